//! Connection handling and the authoritative tick.
//!
//! Socket tasks only decode and forward. Every state change happens on the
//! tick thread inside [`ServerCore::process_messages`], which owns the
//! [`SessionManager`] and is the single writer for session state.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{LimitSettings, ServerConfig};
use crate::constants::MAX_CHAT_LEN;
use crate::core::{ChunkCoord, ClientId};
use crate::error::{AccountError, ProtocolError, ServerError};
use crate::events::{ChatMessageReceivedEvent, Listeners};
use crate::multiplayer::account::AccountLookup;
use crate::multiplayer::protocol::{ChatKind, Packet};
use crate::multiplayer::session::{ClientSession, SessionManager};
use crate::multiplayer::tcp::{TcpConnection, TcpServer};
use crate::multiplayer::udp::{DatagramLane, DatagramQueue, UdpChannel};
use crate::world::ChunkStore;

pub const SHUTDOWN_REASON: &str = "server shutting down";
const SERVER_SENDER: &str = "server";

/// Lifecycle of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticated,
    Active,
    Closed,
}

/// Everything socket tasks hand to the tick thread.
pub enum Inbound {
    Opened {
        client: ClientId,
        addr: SocketAddr,
        link: ClientLink,
    },
    Packet {
        client: ClientId,
        packet: Packet,
    },
    Malformed {
        client: ClientId,
        reason: String,
    },
    Closed {
        client: ClientId,
        reason: String,
    },
    Datagram {
        addr: SocketAddr,
        packet: Packet,
    },
}

/// Tick-side handles for one connection's writer and reader tasks.
/// Dropping the link ends the writer once its reliable queue drains.
pub struct ClientLink {
    reliable: mpsc::Sender<Packet>,
    unreliable: Arc<DatagramLane>,
    shutdown: Arc<Notify>,
}

/// Task-side ends of a [`ClientLink`].
pub struct LinkReceivers {
    pub reliable: mpsc::Receiver<Packet>,
    pub unreliable: Arc<DatagramLane>,
    pub shutdown: Arc<Notify>,
}

impl ClientLink {
    pub fn new(reliable_capacity: usize, unreliable_capacity: usize) -> (Self, LinkReceivers) {
        let (reliable, reliable_rx) = mpsc::channel(reliable_capacity.max(1));
        let unreliable = Arc::new(DatagramLane::new(unreliable_capacity));
        let shutdown = Arc::new(Notify::new());
        (
            Self {
                reliable,
                unreliable: Arc::clone(&unreliable),
                shutdown: Arc::clone(&shutdown),
            },
            LinkReceivers {
                reliable: reliable_rx,
                unreliable,
                shutdown,
            },
        )
    }
}

struct Connection {
    state: ConnectionState,
    addr: SocketAddr,
    link: ClientLink,
    udp_token: u64,
    udp_addr: Option<SocketAddr>,
    datagrams: DatagramQueue,
}

pub struct ServerCore {
    sessions: SessionManager,
    accounts: Arc<dyn AccountLookup>,
    connections: FxHashMap<ClientId, Connection>,
    inbound: mpsc::Receiver<Inbound>,
    udp: Option<Arc<UdpChannel>>,
    chat_listeners: Arc<Listeners<ChatMessageReceivedEvent>>,
    limits: LimitSettings,
    uptime: Duration,
}

impl ServerCore {
    pub fn new(
        sessions: SessionManager,
        accounts: Arc<dyn AccountLookup>,
        inbound: mpsc::Receiver<Inbound>,
        limits: LimitSettings,
        chat_listeners: Arc<Listeners<ChatMessageReceivedEvent>>,
    ) -> Self {
        Self {
            sessions,
            accounts,
            connections: FxHashMap::default(),
            inbound,
            udp: None,
            chat_listeners,
            limits,
            uptime: Duration::ZERO,
        }
    }

    pub fn with_udp(mut self, udp: Arc<UdpChannel>) -> Self {
        self.udp = Some(udp);
        self
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn connection_state(&self, client: ClientId) -> ConnectionState {
        self.connections
            .get(&client)
            .map_or(ConnectionState::Closed, |c| c.state)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn uptime(&self) -> Duration {
        self.uptime
    }

    /// One tick: apply queued inbound messages, evict idle chunks, then
    /// flush outbound queues. Returns how many inbound messages were applied.
    pub fn process_messages(&mut self, delta: Duration) -> usize {
        self.uptime += delta;

        let mut processed = 0;
        while processed < self.limits.max_inbound_per_tick {
            match self.inbound.try_recv() {
                Ok(message) => {
                    self.handle(message);
                    processed += 1;
                }
                Err(_) => break,
            }
        }

        self.sessions.store().evict_idle(Instant::now());
        self.flush();
        processed
    }

    /// Fan `packet` out to every ACTIVE session accepted by `filter`.
    /// Reliable kinds are sequenced per recipient; positions go to the
    /// drop-oldest datagram queue.
    pub fn broadcast<F>(&mut self, packet: &Packet, filter: F) -> usize
    where
        F: Fn(&ClientSession) -> bool,
    {
        let mut delivered = 0;
        for session in self.sessions.sessions_mut() {
            let Some(conn) = self.connections.get_mut(&session.id()) else {
                continue;
            };
            if conn.state != ConnectionState::Active || !filter(session) {
                continue;
            }
            if packet.is_reliable() {
                session.push_reliable(packet.clone());
            } else {
                conn.datagrams.push(packet.clone());
            }
            delivered += 1;
        }
        delivered
    }

    /// Disconnect everyone with the shutdown notice and release every
    /// subscription.
    pub fn shutdown(&mut self) {
        let clients: Vec<ClientId> = self.connections.keys().copied().collect();
        for client in clients {
            self.close(client, SHUTDOWN_REASON, true);
        }
        for session in self.sessions.drain() {
            debug!(client = session.id(), "session dropped at shutdown");
        }
        info!("all sessions closed");
    }

    fn handle(&mut self, message: Inbound) {
        match message {
            Inbound::Opened { client, addr, link } => {
                debug!(client, %addr, "connection registered");
                self.connections.insert(
                    client,
                    Connection {
                        state: ConnectionState::Connecting,
                        addr,
                        link,
                        udp_token: 0,
                        udp_addr: None,
                        datagrams: DatagramQueue::new(self.limits.unreliable_queue),
                    },
                );
            }
            Inbound::Packet { client, packet } => {
                if let Err(e) = self.handle_packet(client, packet) {
                    warn!(client, error = %e, "closing client");
                    self.close(client, &e.to_string(), true);
                }
            }
            Inbound::Malformed { client, reason } => {
                let e = ProtocolError::Malformed(reason);
                warn!(client, error = %e, "closing client");
                self.close(client, &e.to_string(), true);
            }
            Inbound::Closed { client, reason } => {
                self.close(client, &reason, false);
            }
            Inbound::Datagram { addr, packet } => self.handle_datagram(addr, packet),
        }
    }

    fn handle_datagram(&mut self, addr: SocketAddr, packet: Packet) {
        let Packet::UdpPosition {
            client_id,
            token,
            x,
            y,
        } = packet
        else {
            debug!(%addr, kind = packet.kind_name(), "ignoring datagram");
            return;
        };
        match self.connections.get_mut(&client_id) {
            Some(conn) if conn.udp_token == token && conn.state != ConnectionState::Connecting => {
                conn.udp_addr = Some(addr);
            }
            _ => {
                debug!(%addr, client = client_id, "datagram with bad token");
                return;
            }
        }
        if let Err(e) = self.handle_position(client_id, x, y) {
            warn!(client = client_id, error = %e, "closing client");
            self.close(client_id, &e.to_string(), true);
        }
    }

    fn handle_packet(&mut self, client: ClientId, packet: Packet) -> Result<(), ServerError> {
        let Some(state) = self.connections.get(&client).map(|c| c.state) else {
            return Ok(());
        };
        let authenticated = matches!(
            state,
            ConnectionState::Authenticated | ConnectionState::Active
        );

        match packet {
            Packet::Handshake { username } if state == ConnectionState::Connecting => {
                self.handshake(client, &username)
            }
            Packet::PositionUpdate { x, y, .. } if authenticated => {
                self.handle_position(client, x, y)
            }
            Packet::ChatBroadcast { content, .. } if authenticated => {
                self.handle_chat(client, content)
            }
            Packet::Ping { timestamp } => {
                self.send_reliable(client, Packet::Pong { timestamp });
                Ok(())
            }
            Packet::Disconnect { reason } => {
                debug!(client, %reason, "client logged out");
                self.close(client, "logout", false);
                Ok(())
            }
            other => Err(ProtocolError::UnexpectedMessage {
                kind: other.kind_name(),
                state,
            }
            .into()),
        }
    }

    fn handshake(&mut self, client: ClientId, username: &str) -> Result<(), ServerError> {
        let record = self.accounts.lookup(username)?;
        if self.sessions.has_username(&record.username) {
            return Err(AccountError::AlreadyConnected(record.username).into());
        }
        if self.sessions.len() >= self.limits.max_sessions {
            return Err(ServerError::ResourceExhausted("server full".to_string()));
        }
        let store = self.sessions.store();
        if store.loaded_count() >= self.limits.max_loaded_chunks {
            return Err(ServerError::ResourceExhausted(
                "chunk limit reached".to_string(),
            ));
        }
        let (chunk_size, seed) = (store.chunk_size(), store.seed());

        let Some(conn) = self.connections.get_mut(&client) else {
            return Ok(());
        };
        conn.state = ConnectionState::Authenticated;
        conn.udp_token = rand::random::<u64>();
        let udp_token = conn.udp_token;

        self.sessions.create_session(client, &record.username);
        self.sessions.queue_reliable(
            client,
            Packet::HandshakeAck {
                seq: 0,
                client_id: client,
                udp_token,
                chunk_size,
                seed,
            },
        );
        info!(client, username = %record.username, "client authenticated");
        Ok(())
    }

    fn handle_position(&mut self, client: ClientId, x: f32, y: f32) -> Result<(), ServerError> {
        let state = self.connection_state(client);
        if !matches!(
            state,
            ConnectionState::Authenticated | ConnectionState::Active
        ) {
            return Err(ProtocolError::UnexpectedMessage {
                kind: "PositionUpdate",
                state,
            }
            .into());
        }
        let Some(delta) = self.sessions.on_position_update(client, x, y)? else {
            return Ok(());
        };

        if state == ConnectionState::Authenticated {
            if let Some(conn) = self.connections.get_mut(&client) {
                conn.state = ConnectionState::Active;
            }
            let name = self
                .sessions
                .session(client)
                .map(|s| s.username().to_string())
                .unwrap_or_default();
            info!(client, username = %name, "player active");
            self.emit_chat(SERVER_SENDER, &format!("{name} joined the game"), ChatKind::System);
        }

        let chunk_size = self.sessions.store().chunk_size();
        let coord = ChunkCoord::from_world(x, y, chunk_size);
        self.broadcast(
            &Packet::PositionUpdate {
                client_id: client,
                x,
                y,
            },
            |peer| peer.id() != client && peer.is_subscribed(coord),
        );

        // Show the mover any players already standing in chunks it just received
        if !delta.loaded.is_empty() {
            let loaded: FxHashSet<ChunkCoord> = delta.loaded.into_iter().collect();
            let peers: Vec<Packet> = self
                .sessions
                .sessions()
                .filter(|peer| peer.id() != client)
                .filter(|peer| self.connection_state(peer.id()) == ConnectionState::Active)
                .filter_map(|peer| {
                    let (px, py) = peer.position()?;
                    loaded
                        .contains(&ChunkCoord::from_world(px, py, chunk_size))
                        .then_some(Packet::PositionUpdate {
                            client_id: peer.id(),
                            x: px,
                            y: py,
                        })
                })
                .collect();
            if let Some(conn) = self.connections.get_mut(&client) {
                for packet in peers {
                    conn.datagrams.push(packet);
                }
            }
        }
        Ok(())
    }

    fn handle_chat(&mut self, client: ClientId, content: String) -> Result<(), ServerError> {
        if content.len() > MAX_CHAT_LEN {
            return Err(ProtocolError::ChatTooLong(MAX_CHAT_LEN).into());
        }
        let Some(sender) = self
            .sessions
            .session(client)
            .map(|s| s.username().to_string())
        else {
            return Ok(());
        };
        self.emit_chat(&sender, &content, ChatKind::Player);
        Ok(())
    }

    fn emit_chat(&mut self, sender: &str, content: &str, kind: ChatKind) {
        let timestamp = chrono::Utc::now().timestamp_millis();
        self.broadcast(
            &Packet::ChatBroadcast {
                seq: 0,
                sender: sender.to_string(),
                content: content.to_string(),
                timestamp,
                kind,
            },
            |_| true,
        );
        self.chat_listeners.publish(&ChatMessageReceivedEvent {
            sender: sender.to_string(),
            content: content.to_string(),
            timestamp,
            kind,
        });
    }

    /// Route through the session outbox when there is one so the packet
    /// keeps its place in the client's reliable stream.
    fn send_reliable(&mut self, client: ClientId, packet: Packet) {
        if let Some(session) = self.sessions.session_mut(client) {
            session.push_reliable(packet);
        } else if let Some(conn) = self.connections.get(&client) {
            let _ = conn.link.reliable.try_send(packet);
        }
    }

    /// Tear down one client. With `notify`, the client is told why first.
    fn close(&mut self, client: ClientId, reason: &str, notify: bool) {
        let Some(conn) = self.connections.remove(&client) else {
            return;
        };
        if notify {
            let notice = Packet::Disconnect {
                reason: reason.to_string(),
            };
            if let Err(e) = conn.link.reliable.try_send(notice) {
                debug!(client, error = %e, "disconnect notice not delivered");
            }
        }
        conn.link.shutdown.notify_one();

        let session = self.sessions.on_disconnect(client);
        info!(client, addr = %conn.addr, %reason, "client disconnected");

        if conn.state == ConnectionState::Active {
            self.broadcast(
                &Packet::PeerLeft {
                    seq: 0,
                    client_id: client,
                },
                |_| true,
            );
            if let Some(session) = session {
                self.emit_chat(
                    SERVER_SENDER,
                    &format!("{} left the game", session.username()),
                    ChatKind::System,
                );
            }
        }
    }

    fn flush(&mut self) {
        let mut overflowed = Vec::new();
        let mut lost = Vec::new();

        for session in self.sessions.sessions_mut() {
            let Some(conn) = self.connections.get(&session.id()) else {
                continue;
            };
            for packet in session.take_outbox() {
                match conn.link.reliable.try_send(packet) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        overflowed.push(session.id());
                        break;
                    }
                    Err(TrySendError::Closed(_)) => {
                        lost.push(session.id());
                        break;
                    }
                }
            }
        }

        for conn in self.connections.values_mut() {
            for packet in conn.datagrams.drain() {
                match (&self.udp, conn.udp_addr) {
                    (Some(udp), Some(addr)) => {
                        if let Err(e) = udp.try_send_to(&packet, addr) {
                            debug!(%addr, error = %e, "datagram dropped");
                        }
                    }
                    // No UDP endpoint yet; ride the TCP stream
                    _ => conn.link.unreliable.push(packet),
                }
            }
        }

        for client in overflowed {
            warn!(client, "reliable queue overflow");
            self.close(client, "outbound queue overflow", true);
        }
        for client in lost {
            self.close(client, "connection lost", false);
        }
    }
}

struct RunningServer {
    tcp_addr: SocketAddr,
    udp_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
    tick_thread: Option<thread::JoinHandle<()>>,
}

/// Owns the listening sockets and the tick thread.
pub struct SyncServer {
    config: ServerConfig,
    store: Arc<ChunkStore>,
    accounts: Arc<dyn AccountLookup>,
    chat_listeners: Arc<Listeners<ChatMessageReceivedEvent>>,
    running: Arc<AtomicBool>,
    active: Option<RunningServer>,
}

impl SyncServer {
    pub fn new(
        config: ServerConfig,
        store: Arc<ChunkStore>,
        accounts: Arc<dyn AccountLookup>,
    ) -> Self {
        Self {
            config,
            store,
            accounts,
            chat_listeners: Arc::new(Listeners::new()),
            running: Arc::new(AtomicBool::new(false)),
            active: None,
        }
    }

    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Bound TCP and UDP addresses while running.
    pub fn local_addrs(&self) -> Option<(SocketAddr, SocketAddr)> {
        self.active.as_ref().map(|a| (a.tcp_addr, a.udp_addr))
    }

    pub fn subscribe_chat(&self, capacity: usize) -> crossbeam_channel::Receiver<ChatMessageReceivedEvent> {
        self.chat_listeners.subscribe(capacity)
    }

    /// Bind both channels and start serving. Port 0 picks a free port; the
    /// bound addresses are returned. Must be called inside a tokio runtime.
    pub async fn start_server(
        &mut self,
        tcp_port: u16,
        udp_port: u16,
    ) -> Result<(SocketAddr, SocketAddr), ServerError> {
        if self.active.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        let tcp_bind = self.config.bind_address(tcp_port)?;
        let tcp = TcpServer::bind(tcp_bind)
            .await
            .map_err(|source| ServerError::Bind {
                addr: tcp_bind,
                source,
            })?;
        let udp_bind = self.config.bind_address(udp_port)?;
        let udp = UdpChannel::bind(udp_bind)
            .await
            .map_err(|source| ServerError::Bind {
                addr: udp_bind,
                source,
            })?;
        let tcp_addr = tcp.local_addr()?;
        let udp_addr = udp.local_addr()?;
        let udp = Arc::new(udp);

        let limits = self.config.limits.clone();
        let (inbound_tx, inbound_rx) = mpsc::channel(limits.inbound_queue.max(1));
        let sessions = SessionManager::new(Arc::clone(&self.store), self.config.world.view_radius);
        let mut core = ServerCore::new(
            sessions,
            Arc::clone(&self.accounts),
            inbound_rx,
            limits.clone(),
            Arc::clone(&self.chat_listeners),
        )
        .with_udp(Arc::clone(&udp));

        let accept_task = tokio::spawn(accept_loop(tcp, inbound_tx.clone(), limits));
        let udp_task = tokio::spawn(datagram_loop(udp, inbound_tx));

        self.running.store(true, Ordering::Relaxed);
        let running = Arc::clone(&self.running);
        let interval = self.config.tick_interval();
        let runtime = tokio::runtime::Handle::current();
        let tick_thread = thread::Builder::new()
            .name("tick".to_string())
            .spawn(move || {
                let _guard = runtime.enter();
                let mut last = Instant::now();
                while running.load(Ordering::Relaxed) {
                    let started = Instant::now();
                    core.process_messages(started - last);
                    last = started;
                    if let Some(rest) = interval.checked_sub(started.elapsed()) {
                        thread::sleep(rest);
                    }
                }
                core.shutdown();
            });
        let tick_thread = match tick_thread {
            Ok(handle) => handle,
            Err(e) => {
                self.running.store(false, Ordering::Relaxed);
                accept_task.abort();
                udp_task.abort();
                return Err(e.into());
            }
        };

        info!(%tcp_addr, %udp_addr, "server started");
        self.active = Some(RunningServer {
            tcp_addr,
            udp_addr,
            tasks: vec![accept_task, udp_task],
            tick_thread: Some(tick_thread),
        });
        Ok((tcp_addr, udp_addr))
    }

    /// Notify every client, release all subscriptions and stop the tick.
    pub async fn stop_server(&mut self) -> Result<(), ServerError> {
        let mut active = self.active.take().ok_or(ServerError::NotRunning)?;
        self.running.store(false, Ordering::Relaxed);

        for task in &active.tasks {
            task.abort();
        }
        if let Some(handle) = active.tick_thread.take() {
            let joined = tokio::task::spawn_blocking(move || handle.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                error!("tick thread panicked");
            }
        }

        let archived = self.store.flush_archive();
        info!(archived, "server stopped");
        Ok(())
    }
}

async fn accept_loop(tcp: TcpServer, inbound: mpsc::Sender<Inbound>, limits: LimitSettings) {
    loop {
        match tcp.accept().await {
            Ok((client, conn)) => {
                let (link, receivers) =
                    ClientLink::new(limits.reliable_queue, limits.unreliable_queue);
                let addr = conn.addr();
                let opened = Inbound::Opened { client, addr, link };
                if inbound.send(opened).await.is_err() {
                    break;
                }
                spawn_connection(client, conn, receivers, inbound.clone());
            }
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
}

async fn datagram_loop(udp: Arc<UdpChannel>, inbound: mpsc::Sender<Inbound>) {
    loop {
        match udp.recv().await {
            Ok((addr, Ok(packet))) => match inbound.try_send(Inbound::Datagram { addr, packet }) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => debug!(%addr, "inbound queue full, datagram dropped"),
                Err(TrySendError::Closed(_)) => break,
            },
            Ok((addr, Err(e))) => debug!(%addr, error = %e, "undecodable datagram"),
            Err(e) => warn!(error = %e, "UDP receive failed"),
        }
    }
}

/// Reader and writer tasks for one accepted connection. The reader waits
/// for room in `inbound`, so a flooding client only stalls its own socket.
fn spawn_connection(
    client: ClientId,
    conn: TcpConnection,
    receivers: LinkReceivers,
    inbound: mpsc::Sender<Inbound>,
) {
    let conn = Arc::new(conn);
    let LinkReceivers {
        mut reliable,
        unreliable,
        shutdown,
    } = receivers;

    let writer = Arc::clone(&conn);
    tokio::spawn(async move {
        loop {
            let packet = tokio::select! {
                biased;
                packet = reliable.recv() => match packet {
                    Some(packet) => packet,
                    None => break,
                },
                packet = unreliable.pop() => packet,
            };
            if let Err(e) = writer.send(&packet).await {
                debug!(client, error = %e, "write failed");
                break;
            }
        }
        let _ = writer.close().await;
    });

    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = shutdown.notified() => break,
                frame = conn.recv_frame() => frame,
            };
            let message = match frame {
                Ok(data) => match Packet::from_bytes(&data) {
                    Ok(packet) => Inbound::Packet { client, packet },
                    Err(e) => Inbound::Malformed {
                        client,
                        reason: e.to_string(),
                    },
                },
                Err(e) if e.kind() == ErrorKind::InvalidData => Inbound::Malformed {
                    client,
                    reason: e.to_string(),
                },
                Err(e) => Inbound::Closed {
                    client,
                    reason: e.to_string(),
                },
            };
            let last = !matches!(message, Inbound::Packet { .. });
            if inbound.send(message).await.is_err() || last {
                break;
            }
        }
    });
}
