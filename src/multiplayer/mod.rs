pub mod account;
pub mod client;
pub mod protocol;
pub mod server;
pub mod session;
pub mod tcp;
pub mod udp;

// Re-exports for convenience
pub use account::{AccountLookup, AllowList, OpenAccounts, UserRecord};
pub use client::SyncClient;
pub use protocol::{ChatKind, Packet};
pub use server::{ConnectionState, ServerCore, SyncServer};
pub use session::{ClientSession, SessionManager, SubscriptionDelta};
pub use tcp::{TcpConnection, TcpServer};
pub use udp::{DatagramLane, DatagramQueue, UdpChannel};
