use crate::core::ClientId;
use crate::multiplayer::protocol::{ChatKind, Packet};
use crate::multiplayer::tcp::TcpConnection;
use crate::multiplayer::udp::UdpChannel;
use std::io::{Error, ErrorKind, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::ToSocketAddrs;
use tracing::{debug, info};

/// Headless client speaking the sync protocol over TCP. Used for smoke
/// testing a running server.
pub struct SyncClient {
    connection: TcpConnection,
    client_id: ClientId,
    udp_token: u64,
    chunk_size: u16,
    seed: u64,
    udp: Option<(UdpChannel, SocketAddr)>,
}

impl SyncClient {
    /// Connect and complete the handshake. A refused handshake comes back as
    /// `PermissionDenied` carrying the server's reason.
    pub async fn connect<A: ToSocketAddrs>(addr: A, username: &str) -> Result<Self> {
        let connection = TcpConnection::connect(addr).await?;
        info!(server = %connection.addr(), username, "connecting");

        connection
            .send(&Packet::Handshake {
                username: username.to_string(),
            })
            .await?;

        // Wait for HandshakeAck
        loop {
            match connection.recv().await? {
                Packet::HandshakeAck {
                    client_id,
                    udp_token,
                    chunk_size,
                    seed,
                    ..
                } => {
                    info!(client_id, chunk_size, seed, "handshake accepted");
                    return Ok(Self {
                        connection,
                        client_id,
                        udp_token,
                        chunk_size,
                        seed,
                        udp: None,
                    });
                }
                Packet::Disconnect { reason } => {
                    return Err(Error::new(ErrorKind::PermissionDenied, reason));
                }
                Packet::Pong { .. } => continue,
                other => {
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        format!("Unexpected response {}", other.kind_name()),
                    ));
                }
            }
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Token to present on `UdpPosition` datagrams.
    pub fn udp_token(&self) -> u64 {
        self.udp_token
    }

    pub fn chunk_size(&self) -> u16 {
        self.chunk_size
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub async fn send(&self, packet: &Packet) -> Result<()> {
        self.connection.send(packet).await
    }

    pub async fn recv(&self) -> Result<Packet> {
        self.connection.recv().await
    }

    /// Send position update
    pub async fn send_position(&self, x: f32, y: f32) -> Result<()> {
        self.send(&Packet::PositionUpdate {
            client_id: self.client_id,
            x,
            y,
        })
        .await
    }

    /// Send chat message
    pub async fn send_chat(&self, message: &str) -> Result<()> {
        self.send(&Packet::ChatBroadcast {
            seq: 0,
            sender: String::new(),
            content: message.to_string(),
            timestamp: 0,
            kind: ChatKind::Player,
        })
        .await
    }

    /// Open a local UDP socket for position datagrams to the server's
    /// unreliable channel. Returns the local address.
    pub async fn bind_udp(&mut self, server: SocketAddr) -> Result<SocketAddr> {
        let local: IpAddr = if server.is_ipv4() {
            Ipv4Addr::UNSPECIFIED.into()
        } else {
            Ipv6Addr::UNSPECIFIED.into()
        };
        let channel = UdpChannel::bind(SocketAddr::new(local, 0)).await?;
        let addr = channel.local_addr()?;
        self.udp = Some((channel, server));
        Ok(addr)
    }

    fn udp(&self) -> Result<&(UdpChannel, SocketAddr)> {
        self.udp
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::NotConnected, "UDP not bound"))
    }

    /// Send position over UDP, tagged with the handshake token. The server
    /// answers peers' positions to this socket once it accepts one.
    pub async fn send_udp_position(&self, x: f32, y: f32) -> Result<()> {
        let (channel, server) = self.udp()?;
        let packet = Packet::UdpPosition {
            client_id: self.client_id,
            token: self.udp_token,
            x,
            y,
        };
        channel.send_to(&packet, *server).await
    }

    /// Next datagram on the UDP socket.
    pub async fn recv_datagram(&self) -> Result<Packet> {
        let (channel, _) = self.udp()?;
        let (_, packet) = channel.recv().await?;
        packet
    }

    /// Send ping
    pub async fn send_ping(&self) -> Result<()> {
        let timestamp = chrono::Utc::now().timestamp_millis() as u64;
        self.send(&Packet::Ping { timestamp }).await
    }

    /// Log out and close the stream.
    pub async fn disconnect(self) -> Result<()> {
        let _ = self
            .send(&Packet::Disconnect {
                reason: "logout".to_string(),
            })
            .await;
        self.connection.close().await?;
        debug!(client_id = self.client_id, "disconnected");
        Ok(())
    }
}
