use crate::constants::MAX_FRAME_SIZE;
use crate::multiplayer::protocol::Packet;
use std::io::{Error, ErrorKind, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Framed TCP stream. Reads and writes can run concurrently from
/// different tasks since each half has its own lock.
pub struct TcpConnection {
    writer: Mutex<OwnedWriteHalf>,
    reader: Mutex<OwnedReadHalf>,
    connected: AtomicBool,
    addr: SocketAddr,
}

impl TcpConnection {
    pub fn new(stream: TcpStream, addr: SocketAddr) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            connected: AtomicBool::new(true),
            addr,
        }
    }

    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        Ok(Self::new(stream, peer))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn send(&self, packet: &Packet) -> Result<()> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(Error::new(ErrorKind::NotConnected, "Connection closed"));
        }

        let bytes = packet.to_bytes()?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read one whole frame. I/O errors end the connection; a frame that
    /// arrives intact but fails to decode is reported as `InvalidData`.
    pub async fn recv(&self) -> Result<Packet> {
        let data = self.recv_frame().await?;
        Packet::from_bytes(&data)
    }

    pub async fn recv_frame(&self) -> Result<Vec<u8>> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(Error::new(ErrorKind::NotConnected, "Connection closed"));
        }

        let mut reader = self.reader.lock().await;

        // Read packet length (2 bytes)
        let mut len_buf = [0u8; 2];
        reader.read_exact(&mut len_buf).await?;
        let len = u16::from_le_bytes(len_buf) as usize;

        if len == 0 || len > MAX_FRAME_SIZE {
            return Err(Error::new(ErrorKind::InvalidData, "Bad frame length"));
        }

        let mut data = vec![0u8; len + 2];
        data[0..2].copy_from_slice(&len_buf);
        reader.read_exact(&mut data[2..]).await?;
        Ok(data)
    }

    pub async fn close(&self) -> Result<()> {
        if !self.connected.swap(false, Ordering::Relaxed) {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        debug!(addr = %self.addr, "connection closed");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

/// Listening socket that hands out client ids.
pub struct TcpServer {
    listener: TcpListener,
    next_id: AtomicU32,
}

impl TcpServer {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "TCP listener bound");

        Ok(Self {
            listener,
            next_id: AtomicU32::new(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept a new connection and return its ID
    pub async fn accept(&self) -> Result<(u32, TcpConnection)> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        info!(client = id, %addr, "client connected");
        Ok((id, TcpConnection::new(stream, addr)))
    }
}
