// Core module with fundamental types
pub mod core;

// World module with biome classification, generation and chunk storage
pub mod world;

// Multiplayer module with the wire protocol, sessions and server
pub mod multiplayer;

// Other modules
pub mod config;
pub mod constants;
pub mod error;
pub mod events;

// Re-exports
pub use config::ServerConfig;
pub use core::{Biome, BiomeRegistry, BiomeType, Chunk, ChunkCoord, ClientId, TileId};
pub use error::{
    AccountError, ArchiveError, ConfigError, GenerationError, ProtocolError, ServerError,
    WorldError,
};
pub use events::{ChatMessageReceivedEvent, ChunkLoadEvent, LoadOrigin};
pub use multiplayer::{SessionManager, SyncClient, SyncServer};
pub use world::{
    BiomeField, BiomeTransitionResult, ChunkArchive, ChunkGenerator, ChunkStore, GenerationPool,
};
