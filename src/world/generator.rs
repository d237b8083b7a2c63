//! Thread-safe chunk generation from the biome field
//!
//! Tile choice is random but reproducible: every tile draws from a ChaCha8
//! stream keyed by (seed, chunk x, chunk y) with the stream id set to the
//! tile's local offset, so generation order never affects the result.

use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::core::{Chunk, ChunkCoord};
use crate::error::{GenerationError, WorldError};
use crate::world::biome_field::BiomeField;

/// Anything that can produce chunk tiles for a coordinate.
pub trait ChunkSource: Send + Sync {
    fn generate(&self, coord: ChunkCoord) -> Result<Chunk, GenerationError>;

    fn seed(&self) -> u64;

    fn chunk_size(&self) -> u16;
}

/// Generator bound to one seeded [`BiomeField`].
pub struct ChunkGenerator {
    field: Arc<BiomeField>,
    seed: u64,
    chunk_size: u16,
}

impl ChunkGenerator {
    /// Fails when the field has no seed yet.
    pub fn new(field: Arc<BiomeField>, chunk_size: u16) -> Result<Self, WorldError> {
        let seed = field.seed().ok_or(WorldError::NotInitialized)?;
        Ok(ChunkGenerator {
            field,
            seed,
            chunk_size,
        })
    }

    pub fn field(&self) -> &Arc<BiomeField> {
        &self.field
    }

    /// Generate a complete chunk at the given coordinates
    pub fn generate_chunk(&self, chunk_x: i32, chunk_y: i32) -> Result<Chunk, GenerationError> {
        let coord = ChunkCoord::new(chunk_x, chunk_y);
        let size = self.chunk_size;
        let mut chunk = Chunk::new(coord, size);
        let (base_x, base_y) = coord
            .origin(size)
            .ok_or(GenerationError::OutOfBounds(coord))?;
        let registry = self.field.registry();
        let mut rng = ChaCha8Rng::seed_from_u64(self.position_hash(chunk_x, chunk_y));

        for ly in 0..size {
            for lx in 0..size {
                let sample = self
                    .field
                    .sample(base_x + lx as i32, base_y + ly as i32)?;

                let offset = ly as u64 * size as u64 + lx as u64;
                rng.set_stream(offset);
                rng.set_word_pos(0);

                let roll: f32 = rng.gen_range(0.0..1.0);
                let biome_type = if roll < sample.blend {
                    sample.secondary
                } else {
                    sample.primary
                };
                let biome = registry
                    .get(biome_type)
                    .ok_or(GenerationError::UnknownBiome(biome_type.0))?;

                let pick = rng.gen_range(0..biome.total_weight());
                chunk.set_tile(lx, ly, biome.pick_tile(pick));
            }
        }

        Ok(chunk)
    }

    fn position_hash(&self, x: i32, y: i32) -> u64 {
        let mut hash = self.seed;
        hash = hash.wrapping_add(x as u32 as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        hash = hash.wrapping_add(y as u32 as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
        hash ^ (hash >> 31)
    }
}

impl ChunkSource for ChunkGenerator {
    fn generate(&self, coord: ChunkCoord) -> Result<Chunk, GenerationError> {
        self.generate_chunk(coord.x, coord.y)
    }

    fn seed(&self) -> u64 {
        self.seed
    }

    fn chunk_size(&self) -> u16 {
        self.chunk_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_biomes;
    use crate::core::BiomeRegistry;

    fn generator(seed: u64, chunk_size: u16) -> ChunkGenerator {
        let registry = Arc::new(BiomeRegistry::from_table(&default_biomes()).unwrap());
        let mut field = BiomeField::new(registry, 4);
        field.init_with_seed(seed);
        ChunkGenerator::new(Arc::new(field), chunk_size).unwrap()
    }

    #[test]
    fn test_requires_seeded_field() {
        let registry = Arc::new(BiomeRegistry::from_table(&default_biomes()).unwrap());
        let field = Arc::new(BiomeField::new(registry, 4));
        assert_eq!(
            ChunkGenerator::new(field, 16).err(),
            Some(WorldError::NotInitialized)
        );
    }

    #[test]
    fn test_generation_is_deterministic_across_instances() {
        let first = generator(42, 16);
        // A fresh instance stands in for a server restart.
        let restarted = generator(42, 16);

        for (cx, cy) in [(0, 0), (-1, -1), (5, 5), (-37, 112), (1000, -3)] {
            let a = first.generate_chunk(cx, cy).unwrap();
            let b = first.generate_chunk(cx, cy).unwrap();
            let c = restarted.generate_chunk(cx, cy).unwrap();
            assert_eq!(a, b);
            assert_eq!(a.tiles(), c.tiles());
        }
    }

    #[test]
    fn test_chunk_past_the_grid_edge_is_refused() {
        let err = generator(42, 16).generate_chunk(i32::MAX, 0).unwrap_err();
        assert_eq!(err, GenerationError::OutOfBounds(ChunkCoord::new(i32::MAX, 0)));
    }

    #[test]
    fn test_seed_changes_output() {
        let a = generator(1, 16).generate_chunk(3, 4).unwrap();
        let b = generator(2, 16).generate_chunk(3, 4).unwrap();
        assert_ne!(a.tiles(), b.tiles());
    }

    #[test]
    fn test_tiles_belong_to_sampled_biomes() {
        let generator = generator(42, 8);
        let chunk = generator.generate_chunk(2, -1).unwrap();
        let (base_x, base_y) = chunk.coord().origin(8).unwrap();
        let registry = generator.field().registry();

        assert_eq!(chunk.tiles().len(), 64);
        for ly in 0..8u16 {
            for lx in 0..8u16 {
                let tile = chunk.get_tile(lx, ly).unwrap();
                let sample = generator
                    .field()
                    .sample(base_x + lx as i32, base_y + ly as i32)
                    .unwrap();
                let allowed = [sample.primary, sample.secondary].iter().any(|&b| {
                    registry
                        .get(b)
                        .unwrap()
                        .tiles()
                        .iter()
                        .any(|&(t, _)| t == tile)
                });
                assert!(allowed, "tile {tile} at ({lx}, {ly}) not in its biomes");
            }
        }
    }

    #[test]
    fn test_reports_chunk_size_and_seed() {
        let generator = generator(99, 32);
        assert_eq!(ChunkSource::seed(&generator), 99);
        assert_eq!(generator.chunk_size(), 32);
        let chunk = generator.generate(ChunkCoord::new(0, 0)).unwrap();
        assert_eq!(chunk.size(), 32);
    }
}
