//! Core data structures for the world
//! Contains biomes, tiles and chunks.

pub mod biome;
pub mod chunk;

/// Server-assigned connection handle.
pub type ClientId = u32;

// Re-export commonly used types
pub use biome::{Biome, BiomeRegistry, BiomeType};
pub use chunk::{Chunk, ChunkCoord, TileId};
