//! World generation and management modules
//! Contains biome classification, chunk generation, loading and storage.

pub mod archive;
pub mod biome_field;
pub mod generator;
pub mod loader;
pub mod store;

// Re-export commonly used types
pub use archive::ChunkArchive;
pub use biome_field::{BiomeField, BiomeFrequency, BiomeTransitionResult};
pub use generator::{ChunkGenerator, ChunkSource};
pub use loader::{GenerationOutcome, GenerationPool};
pub use store::ChunkStore;
