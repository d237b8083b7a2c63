//! Error types shared across the world and network layers.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::core::ChunkCoord;
use crate::multiplayer::server::ConnectionState;

/// Configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The config file is not valid TOML for [`crate::config::ServerConfig`].
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// A value is out of range or inconsistent.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Misuse of the biome field.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorldError {
    #[error("biome field sampled before a world seed was established")]
    NotInitialized,
}

/// A chunk could not be produced.
///
/// Cloneable so that every caller collapsed onto one generation receives the
/// same outcome.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error(transparent)]
    World(#[from] WorldError),
    #[error("biome index {0} is not in the registry")]
    UnknownBiome(u16),
    #[error("generation worker pool is unavailable")]
    WorkerUnavailable,
    #[error("chunk {0} lies outside the addressable world")]
    OutOfBounds(ChunkCoord),
}

/// On-disk chunk archive failures.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive i/o: {0}")]
    Io(#[from] io::Error),
    #[error("archive codec: {0}")]
    Codec(#[from] bincode::Error),
    #[error("not a chunk archive file")]
    BadMagic,
    #[error("corrupt archive file: {0}")]
    Corrupt(String),
    #[error("unsupported archive version {0}")]
    Version(u32),
    #[error("archive written for seed {found}, world seed is {expected}")]
    SeedMismatch { expected: u64, found: u64 },
}

/// Account collaborator failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccountError {
    #[error("no account named {0:?}")]
    NotFound(String),
    #[error("invalid username {0:?}")]
    InvalidUsername(String),
    #[error("{0:?} is already connected")]
    AlreadyConnected(String),
}

/// A client broke the protocol. The offending session is closed.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("{kind} not allowed while {state:?}")]
    UnexpectedMessage {
        kind: &'static str,
        state: ConnectionState,
    },
    #[error("position ({x}, {y}) is outside the world")]
    InvalidPosition { x: f32, y: f32 },
    #[error("chat message exceeds {0} bytes")]
    ChatTooLong(usize),
}

/// Server-level failures.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("invalid bind address {0:?}")]
    BadAddress(String),
    #[error("authentication failed: {0}")]
    AuthFailure(#[from] AccountError),
    #[error("resources exhausted: {0}")]
    ResourceExhausted(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    World(#[from] WorldError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("server is already running")]
    AlreadyRunning,
    #[error("server is not running")]
    NotRunning,
}
