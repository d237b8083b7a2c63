//! Listener registries for internal notifications.
//!
//! Each emitter owns its own [`Listeners`]; there is no global bus. Delivery
//! uses bounded crossbeam channels with `try_send`, so a slow listener loses
//! events instead of stalling the tick.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::Mutex;

use crate::core::ChunkCoord;
use crate::multiplayer::protocol::ChatKind;

/// How a chunk became present in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOrigin {
    Generated,
    Archive,
}

/// A chunk transitioned from absent to present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLoadEvent {
    pub chunk_x: i32,
    pub chunk_y: i32,
    pub origin: LoadOrigin,
}

impl ChunkLoadEvent {
    pub fn coord(&self) -> ChunkCoord {
        ChunkCoord::new(self.chunk_x, self.chunk_y)
    }
}

/// A chat message was accepted from a client (or emitted by the server).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessageReceivedEvent {
    pub sender: String,
    pub content: String,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub kind: ChatKind,
}

pub struct Listeners<E> {
    senders: Mutex<Vec<Sender<E>>>,
    dropped: AtomicU64,
}

impl<E: Clone> Listeners<E> {
    pub fn new() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register a listener with its own queue of `capacity` events.
    pub fn subscribe(&self, capacity: usize) -> Receiver<E> {
        let (tx, rx) = bounded(capacity.max(1));
        self.senders.lock().push(tx);
        rx
    }

    /// Deliver to every live listener without blocking. Listeners whose
    /// receiver was dropped are forgotten.
    pub fn publish(&self, event: &E) {
        let mut senders = self.senders.lock();
        senders.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    pub fn listener_count(&self) -> usize {
        self.senders.lock().len()
    }

    /// Events lost to full listener queues.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<E: Clone> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}
