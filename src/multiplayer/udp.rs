//! Unreliable channel: one UDP socket for every client plus a bounded
//! drop-oldest queue per recipient.

use std::collections::VecDeque;
use std::io::Result;
use std::net::SocketAddr;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::{info, trace};

use crate::constants::MAX_FRAME_SIZE;
use crate::multiplayer::protocol::Packet;

pub struct UdpChannel {
    socket: UdpSocket,
}

impl UdpChannel {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!(addr = %socket.local_addr()?, "UDP socket bound");
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Wait for the next datagram. Undecodable datagrams are returned as
    /// errors with their source so the caller can log and keep going.
    pub async fn recv(&self) -> Result<(SocketAddr, std::result::Result<Packet, std::io::Error>)> {
        let mut buf = vec![0u8; MAX_FRAME_SIZE + 2];
        let (len, from) = self.socket.recv_from(&mut buf).await?;
        Ok((from, Packet::from_bytes(&buf[..len])))
    }

    /// Send without waiting; a full socket buffer drops the datagram.
    pub fn try_send_to(&self, packet: &Packet, addr: SocketAddr) -> Result<()> {
        let bytes = packet.to_bytes()?;
        self.socket.try_send_to(&bytes, addr)?;
        Ok(())
    }

    pub async fn send_to(&self, packet: &Packet, addr: SocketAddr) -> Result<()> {
        let bytes = packet.to_bytes()?;
        self.socket.send_to(&bytes, addr).await?;
        Ok(())
    }
}

/// Bounded queue that discards the oldest entry when full.
#[derive(Debug)]
pub struct DatagramQueue {
    queue: VecDeque<Packet>,
    capacity: usize,
    dropped: u64,
}

impl DatagramQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    pub fn push(&mut self, packet: Packet) {
        if self.queue.len() == self.capacity {
            self.queue.pop_front();
            self.dropped += 1;
            trace!(dropped = self.dropped, "datagram queue full, dropped oldest");
        }
        self.queue.push_back(packet);
    }

    pub fn pop(&mut self) -> Option<Packet> {
        self.queue.pop_front()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Packet> + '_ {
        self.queue.drain(..)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// A [`DatagramQueue`] shared between the tick thread, which pushes, and a
/// connection's writer task, which waits on [`DatagramLane::pop`]. Carries
/// unreliable packets over TCP for clients with no UDP endpoint, so a slow
/// reader loses stale positions rather than fresh ones.
#[derive(Debug)]
pub struct DatagramLane {
    queue: Mutex<DatagramQueue>,
    ready: Notify,
}

impl DatagramLane {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(DatagramQueue::new(capacity)),
            ready: Notify::new(),
        }
    }

    pub fn push(&self, packet: Packet) {
        self.queue.lock().push(packet);
        self.ready.notify_one();
    }

    pub fn try_pop(&self) -> Option<Packet> {
        self.queue.lock().pop()
    }

    /// Wait until a packet is queued.
    pub async fn pop(&self) -> Packet {
        loop {
            if let Some(packet) = self.try_pop() {
                return packet;
            }
            self.ready.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.queue.lock().dropped()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(x: f32) -> Packet {
        Packet::PositionUpdate {
            client_id: 1,
            x,
            y: 0.0,
        }
    }

    #[test]
    fn test_queue_drops_oldest() {
        let mut queue = DatagramQueue::new(3);
        for i in 0..5 {
            queue.push(position(i as f32));
        }

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 2);
        let kept: Vec<Packet> = queue.drain().collect();
        assert_eq!(kept, vec![position(2.0), position(3.0), position(4.0)]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_lane_keeps_newest_and_wakes_waiter() {
        let lane = std::sync::Arc::new(DatagramLane::new(2));
        for i in 0..5 {
            lane.push(position(i as f32));
        }
        assert_eq!(lane.len(), 2);
        assert_eq!(lane.dropped(), 3);
        assert_eq!(lane.pop().await, position(3.0));
        assert_eq!(lane.try_pop(), Some(position(4.0)));
        assert!(lane.is_empty());

        let waiter = {
            let lane = std::sync::Arc::clone(&lane);
            tokio::spawn(async move { lane.pop().await })
        };
        tokio::task::yield_now().await;
        lane.push(position(9.0));
        let woken = tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(woken, position(9.0));
    }

    #[tokio::test]
    async fn test_datagram_roundtrip() {
        let a = UdpChannel::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = UdpChannel::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let packet = Packet::UdpPosition {
            client_id: 4,
            token: 99,
            x: 1.5,
            y: -2.0,
        };

        a.send_to(&packet, b.local_addr().unwrap()).await.unwrap();
        let (from, received) = b.recv().await.unwrap();

        assert_eq!(from, a.local_addr().unwrap());
        assert_eq!(received.unwrap(), packet);
    }
}
