//! Per-client state and view-radius subscription tracking.
//!
//! Owned by the tick thread. Every reliable message bound for a client goes
//! through its session outbox so it is stamped with that client's next
//! sequence number.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

use crate::core::{ChunkCoord, ClientId};
use crate::error::ProtocolError;
use crate::multiplayer::protocol::Packet;
use crate::world::ChunkStore;

pub struct ClientSession {
    id: ClientId,
    username: String,
    position: Option<(f32, f32)>,
    subscribed: FxHashSet<ChunkCoord>,
    next_seq: u64,
    outbox: Vec<Packet>,
}

impl ClientSession {
    fn new(id: ClientId, username: String) -> Self {
        Self {
            id,
            username,
            position: None,
            subscribed: FxHashSet::default(),
            next_seq: 1,
            outbox: Vec::new(),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn position(&self) -> Option<(f32, f32)> {
        self.position
    }

    pub fn is_subscribed(&self, coord: ChunkCoord) -> bool {
        self.subscribed.contains(&coord)
    }

    pub fn subscriptions(&self) -> &FxHashSet<ChunkCoord> {
        &self.subscribed
    }

    /// Stamp `packet` with the next sequence number and queue it.
    pub fn push_reliable(&mut self, mut packet: Packet) -> u64 {
        let seq = self.next_seq;
        if packet.set_seq(seq) {
            self.next_seq += 1;
        }
        self.outbox.push(packet);
        seq
    }

    pub fn outbox(&self) -> &[Packet] {
        &self.outbox
    }

    pub fn take_outbox(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.outbox)
    }
}

/// What one position update changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SubscriptionDelta {
    pub loaded: Vec<ChunkCoord>,
    pub unloaded: Vec<ChunkCoord>,
    /// Wanted but not generated; retried on the next update.
    pub failed: Vec<ChunkCoord>,
}

pub struct SessionManager {
    store: Arc<ChunkStore>,
    view_radius: i32,
    chunk_size: u16,
    sessions: FxHashMap<ClientId, ClientSession>,
}

impl SessionManager {
    pub fn new(store: Arc<ChunkStore>, view_radius: u32) -> Self {
        let chunk_size = store.chunk_size();
        Self {
            store,
            view_radius: view_radius.min(i32::MAX as u32) as i32,
            chunk_size,
            sessions: FxHashMap::default(),
        }
    }

    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    pub fn view_radius(&self) -> u32 {
        self.view_radius as u32
    }

    /// Returns false if a session with this id already exists.
    pub fn create_session(&mut self, id: ClientId, username: &str) -> bool {
        if self.sessions.contains_key(&id) {
            return false;
        }
        self.sessions
            .insert(id, ClientSession::new(id, username.to_string()));
        true
    }

    pub fn session(&self, id: ClientId) -> Option<&ClientSession> {
        self.sessions.get(&id)
    }

    pub fn session_mut(&mut self, id: ClientId) -> Option<&mut ClientSession> {
        self.sessions.get_mut(&id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &ClientSession> {
        self.sessions.values()
    }

    pub fn sessions_mut(&mut self) -> impl Iterator<Item = &mut ClientSession> {
        self.sessions.values_mut()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn has_username(&self, username: &str) -> bool {
        self.sessions
            .values()
            .any(|s| s.username.eq_ignore_ascii_case(username))
    }

    /// Queue a reliable packet; `None` if the session is gone.
    pub fn queue_reliable(&mut self, id: ClientId, packet: Packet) -> Option<u64> {
        self.sessions
            .get_mut(&id)
            .map(|session| session.push_reliable(packet))
    }

    /// Move the client's view to `(x, y)` and reconcile its chunk
    /// subscriptions. `Ok(None)` if the session does not exist.
    ///
    /// Positions whose view would reach past the `i32` tile grid are refused
    /// and leave the session untouched.
    pub fn on_position_update(
        &mut self,
        id: ClientId,
        x: f32,
        y: f32,
    ) -> Result<Option<SubscriptionDelta>, ProtocolError> {
        let center =
            ChunkCoord::checked_from_world(x, y, self.chunk_size, self.view_radius as u32)
                .ok_or(ProtocolError::InvalidPosition { x, y })?;
        let Some(session) = self.sessions.get_mut(&id) else {
            return Ok(None);
        };
        session.position = Some((x, y));

        let desired = center.neighborhood(self.view_radius);
        let wanted: FxHashSet<ChunkCoord> = desired.iter().copied().collect();
        let mut delta = SubscriptionDelta::default();

        let mut leaving: Vec<ChunkCoord> = session
            .subscribed
            .iter()
            .filter(|coord| !wanted.contains(coord))
            .copied()
            .collect();
        leaving.sort_unstable();
        for coord in leaving {
            self.store.release(coord.x, coord.y, id);
            session.subscribed.remove(&coord);
            session.push_reliable(Packet::ChunkUnload {
                seq: 0,
                chunk_x: coord.x,
                chunk_y: coord.y,
            });
            delta.unloaded.push(coord);
        }

        let entering: Vec<ChunkCoord> = desired
            .into_iter()
            .filter(|coord| !session.subscribed.contains(coord))
            .collect();
        for (coord, result) in self.store.acquire_many(&entering, id) {
            match result {
                Ok(chunk) => {
                    session.subscribed.insert(coord);
                    session.push_reliable(Packet::ChunkData {
                        seq: 0,
                        chunk_x: coord.x,
                        chunk_y: coord.y,
                        tiles: chunk.tiles().to_vec(),
                    });
                    delta.loaded.push(coord);
                }
                Err(e) => {
                    warn!(client = id, %coord, error = %e, "chunk unavailable, will retry");
                    delta.failed.push(coord);
                }
            }
        }

        if !delta.loaded.is_empty() || !delta.unloaded.is_empty() {
            debug!(
                client = id,
                %center,
                loaded = delta.loaded.len(),
                unloaded = delta.unloaded.len(),
                "subscriptions updated"
            );
        }
        Ok(Some(delta))
    }

    /// Release everything the client held and forget the session.
    pub fn on_disconnect(&mut self, id: ClientId) -> Option<ClientSession> {
        let session = self.sessions.remove(&id)?;
        for coord in &session.subscribed {
            self.store.release(coord.x, coord.y, id);
        }
        debug!(client = id, released = session.subscribed.len(), "session removed");
        Some(session)
    }

    /// Disconnect every session, returning them.
    pub fn drain(&mut self) -> Vec<ClientSession> {
        let ids: Vec<ClientId> = self.sessions.keys().copied().collect();
        ids.into_iter()
            .filter_map(|id| self.on_disconnect(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use crate::config::default_biomes;
    use crate::core::{BiomeRegistry, Chunk};
    use crate::error::GenerationError;
    use crate::world::{BiomeField, ChunkGenerator, ChunkSource};

    fn generator(seed: u64) -> ChunkGenerator {
        let registry = Arc::new(BiomeRegistry::from_table(&default_biomes()).unwrap());
        let mut field = BiomeField::new(registry, 4);
        field.init_with_seed(seed);
        ChunkGenerator::new(Arc::new(field), 16).unwrap()
    }

    fn manager(seed: u64, view_radius: u32) -> SessionManager {
        let store = ChunkStore::new(Arc::new(generator(seed)), Duration::from_secs(30));
        SessionManager::new(Arc::new(store), view_radius)
    }

    #[test]
    fn test_first_update_subscribes_view_square() {
        let mut sessions = manager(42, 1);
        assert!(sessions.create_session(1, "alice"));
        assert!(!sessions.create_session(1, "alice"));

        let delta = sessions.on_position_update(1, 0.0, 0.0).unwrap().unwrap();

        assert_eq!(delta.loaded.len(), 9);
        assert!(delta.unloaded.is_empty());
        let store = sessions.store().clone();
        assert_eq!(store.generation_count(), 9);
        for dy in -1..=1 {
            for dx in -1..=1 {
                assert_eq!(store.subscriber_count(dx, dy), 1);
            }
        }

        let outbox = sessions.session(1).unwrap().outbox();
        assert_eq!(outbox.len(), 9);
        let seqs: Vec<u64> = outbox.iter().filter_map(Packet::seq).collect();
        assert_eq!(seqs, (1..=9).collect::<Vec<_>>());

        // Standing still changes nothing
        let delta = sessions.on_position_update(1, 3.0, 3.0).unwrap().unwrap();
        assert_eq!(delta, SubscriptionDelta::default());
        assert_eq!(store.generation_count(), 9);
    }

    #[test]
    fn test_moving_swaps_neighborhoods() {
        let mut sessions = manager(42, 1);
        sessions.create_session(1, "alice");
        sessions.on_position_update(1, 0.0, 0.0).unwrap();

        let delta = sessions.on_position_update(1, 100.0, 0.0).unwrap().unwrap();

        let store = sessions.store().clone();
        assert_eq!(delta.unloaded.len(), 9);
        assert_eq!(delta.loaded.len(), 9);
        for coord in ChunkCoord::new(0, 0).neighborhood(1) {
            assert_eq!(store.subscriber_count(coord.x, coord.y), 0);
        }
        for coord in ChunkCoord::new(6, 0).neighborhood(1) {
            assert_eq!(store.subscriber_count(coord.x, coord.y), 1);
            assert!(sessions.session(1).unwrap().is_subscribed(coord));
        }
    }

    #[test]
    fn test_unload_follows_matching_load() {
        let mut sessions = manager(5, 2);
        sessions.create_session(9, "carol");
        for x in [0.0, 40.0, 90.0, -30.0, 200.0] {
            sessions.on_position_update(9, x, x / 2.0).unwrap();
        }

        let outbox = sessions.session_mut(9).unwrap().take_outbox();
        let mut loaded_at: FxHashMap<(i32, i32), u64> = FxHashMap::default();
        let mut last_seq = 0;
        for packet in &outbox {
            let seq = packet.seq().unwrap();
            assert!(seq > last_seq);
            last_seq = seq;
            match packet {
                Packet::ChunkData {
                    chunk_x, chunk_y, ..
                } => {
                    loaded_at.insert((*chunk_x, *chunk_y), seq);
                }
                Packet::ChunkUnload {
                    chunk_x, chunk_y, ..
                } => {
                    let load = loaded_at.remove(&(*chunk_x, *chunk_y));
                    assert!(matches!(load, Some(s) if s < seq));
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_disconnect_releases_everything() {
        let mut sessions = manager(42, 1);
        sessions.create_session(1, "alice");
        sessions.create_session(2, "bob");
        sessions.on_position_update(1, 0.0, 0.0).unwrap();
        sessions.on_position_update(2, 16.0, 0.0).unwrap();

        let store = sessions.store().clone();
        assert_eq!(store.subscriber_count(0, 0), 2);

        let gone = sessions.on_disconnect(1).unwrap();
        assert_eq!(gone.username(), "alice");
        assert!(store.subscriptions_of(1).is_empty());
        assert_eq!(store.subscriber_count(0, 0), 1);
        assert_eq!(store.subscriber_count(-1, 0), 0);
        assert!(sessions.on_disconnect(1).is_none());
        assert_eq!(sessions.len(), 1);
        assert!(sessions.on_position_update(1, 0.0, 0.0).unwrap().is_none());
    }

    #[test]
    fn test_position_past_the_world_edge_is_refused() {
        let mut sessions = manager(42, 1);
        sessions.create_session(1, "alice");
        sessions.on_position_update(1, 0.0, 0.0).unwrap();
        let store = sessions.store().clone();

        for (x, y) in [(1.0e12, 0.0), (0.0, -1.0e12), (f32::NAN, 0.0), (0.0, f32::INFINITY)] {
            let err = sessions.on_position_update(1, x, y).unwrap_err();
            assert!(matches!(err, ProtocolError::InvalidPosition { .. }));
        }

        // The refused updates left the old view in place
        let session = sessions.session(1).unwrap();
        assert_eq!(session.position(), Some((0.0, 0.0)));
        assert_eq!(session.subscriptions().len(), 9);
        assert_eq!(store.loaded_count(), 9);
        assert!(sessions.on_position_update(7, 1.0e12, 0.0).is_err());
    }

    struct FlakyOnce {
        inner: ChunkGenerator,
        failed: AtomicBool,
    }

    impl ChunkSource for FlakyOnce {
        fn generate(&self, coord: ChunkCoord) -> Result<Chunk, GenerationError> {
            if coord == ChunkCoord::new(1, 0) && !self.failed.swap(true, Ordering::SeqCst) {
                return Err(GenerationError::WorkerUnavailable);
            }
            self.inner.generate(coord)
        }

        fn seed(&self) -> u64 {
            self.inner.seed()
        }

        fn chunk_size(&self) -> u16 {
            self.inner.chunk_size()
        }
    }

    #[test]
    fn test_failed_chunk_is_retried() {
        let source = Arc::new(FlakyOnce {
            inner: generator(1),
            failed: AtomicBool::new(false),
        });
        let store = Arc::new(ChunkStore::new(source, Duration::from_secs(30)));
        let mut sessions = SessionManager::new(store.clone(), 1);
        sessions.create_session(1, "dave");

        let first = sessions.on_position_update(1, 0.0, 0.0).unwrap().unwrap();
        assert_eq!(first.failed, vec![ChunkCoord::new(1, 0)]);
        assert_eq!(first.loaded.len(), 8);
        assert!(!store.is_loaded(1, 0));

        let second = sessions.on_position_update(1, 1.0, 1.0).unwrap().unwrap();
        assert_eq!(second.loaded, vec![ChunkCoord::new(1, 0)]);
        assert!(second.failed.is_empty());
        assert_eq!(store.subscriber_count(1, 0), 1);
    }
}
