//! Deterministic biome classification using FastNoiseLite
//!
//! Two coherent noise fields (temperature and moisture) place every world
//! tile in climate space; the nearest configured biome wins. Near a region
//! boundary the field also reports the neighboring biome and a blend factor
//! so chunk generation can smooth the seam.

use std::sync::Arc;

use fastnoise_lite::{FastNoiseLite, FractalType, NoiseType};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::constants::CLIMATE_SCALE;
use crate::core::{BiomeRegistry, BiomeType};
use crate::error::WorldError;

const TEMPERATURE_FREQUENCY: f32 = 0.004;
const MOISTURE_FREQUENCY: f32 = 0.006;
const DEBUG_SAMPLE_EXTENT: i32 = 1_000_000;

// Search order for the nearest boundary: axes first, then diagonals.
const DIRECTIONS: [(i32, i32); 8] = [
    (1, 0),
    (-1, 0),
    (0, 1),
    (0, -1),
    (1, 1),
    (-1, 1),
    (1, -1),
    (-1, -1),
];

/// Outcome of sampling the field at one coordinate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiomeTransitionResult {
    pub primary: BiomeType,
    /// Neighbor being blended toward; equals `primary` away from boundaries.
    pub secondary: BiomeType,
    /// Weight of `secondary`, in `[0, 1]`.
    pub blend: f32,
}

/// Empirical share of one biome in a [`BiomeField::debug_biome_distribution`] run.
#[derive(Debug, Clone, PartialEq)]
pub struct BiomeFrequency {
    pub biome: BiomeType,
    pub name: String,
    pub count: usize,
    pub frequency: f64,
}

struct ClimateNoise {
    temperature: FastNoiseLite,
    moisture: FastNoiseLite,
}

impl ClimateNoise {
    fn new(seed: u64) -> Self {
        let base = (seed ^ (seed >> 32)) as u32;
        ClimateNoise {
            temperature: Self::create_fbm_noise(base, TEMPERATURE_FREQUENCY),
            moisture: Self::create_fbm_noise(base.wrapping_add(1), MOISTURE_FREQUENCY),
        }
    }

    fn create_fbm_noise(seed: u32, frequency: f32) -> FastNoiseLite {
        let mut noise = FastNoiseLite::with_seed(seed as i32);
        noise.set_noise_type(Some(NoiseType::OpenSimplex2));
        noise.set_fractal_type(Some(FractalType::FBm));
        noise.set_fractal_octaves(Some(4));
        noise.set_fractal_lacunarity(Some(2.0));
        noise.set_fractal_gain(Some(0.5));
        noise.set_frequency(Some(frequency));
        noise
    }
}

pub struct BiomeField {
    registry: Arc<BiomeRegistry>,
    blend_radius: i32,
    seeded: Option<(u64, ClimateNoise)>,
}

impl BiomeField {
    /// Create an unseeded field; call [`init`](Self::init) or
    /// [`init_with_seed`](Self::init_with_seed) before sampling.
    pub fn new(registry: Arc<BiomeRegistry>, blend_radius: u32) -> Self {
        Self {
            registry,
            blend_radius: blend_radius.min(i32::MAX as u32) as i32,
            seeded: None,
        }
    }

    /// Establish a random world seed and return it.
    pub fn init(&mut self) -> u64 {
        let seed = rand::random::<u64>();
        self.init_with_seed(seed);
        seed
    }

    pub fn init_with_seed(&mut self, seed: u64) {
        self.seeded = Some((seed, ClimateNoise::new(seed)));
    }

    pub fn seed(&self) -> Option<u64> {
        self.seeded.as_ref().map(|(seed, _)| *seed)
    }

    pub fn registry(&self) -> &Arc<BiomeRegistry> {
        &self.registry
    }

    pub fn blend_radius(&self) -> u32 {
        self.blend_radius as u32
    }

    fn noise(&self) -> Result<&ClimateNoise, WorldError> {
        self.seeded
            .as_ref()
            .map(|(_, noise)| noise)
            .ok_or(WorldError::NotInitialized)
    }

    fn classify_with(&self, noise: &ClimateNoise, x: i32, y: i32) -> BiomeType {
        let scale = CLIMATE_SCALE as f32;
        let fx = x as f32;
        let fy = y as f32;
        let temperature = noise.temperature.get_noise_2d(fx, fy) * scale;
        let moisture = noise.moisture.get_noise_2d(fx, fy) * scale;
        self.registry.nearest(temperature, moisture)
    }

    /// Discrete biome at a world tile, without blending.
    pub fn classify(&self, x: i32, y: i32) -> Result<BiomeType, WorldError> {
        Ok(self.classify_with(self.noise()?, x, y))
    }

    pub fn sample(&self, x: i32, y: i32) -> Result<BiomeTransitionResult, WorldError> {
        let noise = self.noise()?;
        let primary = self.classify_with(noise, x, y);
        let radius = self.blend_radius;

        for step in 1..=radius {
            for (dx, dy) in DIRECTIONS {
                let other = self.classify_with(
                    noise,
                    x.saturating_add(dx * step),
                    y.saturating_add(dy * step),
                );
                if other != primary {
                    let blend = 0.5 * (1.0 - (step - 1) as f32 / radius as f32);
                    return Ok(BiomeTransitionResult {
                        primary,
                        secondary: other,
                        blend,
                    });
                }
            }
        }

        Ok(BiomeTransitionResult {
            primary,
            secondary: primary,
            blend: 0.0,
        })
    }

    /// Classify `samples` pseudo-random coordinates and report how often each
    /// biome occurs. The coordinates derive from the world seed so repeated
    /// calibration runs agree.
    pub fn debug_biome_distribution(
        &self,
        samples: usize,
    ) -> Result<Vec<BiomeFrequency>, WorldError> {
        let noise = self.noise()?;
        let seed = self.seed().ok_or(WorldError::NotInitialized)?;
        let mut rng = ChaCha8Rng::seed_from_u64(seed ^ 0x9E37_79B9_7F4A_7C15);
        let mut counts = vec![0usize; self.registry.len()];

        for _ in 0..samples {
            let x = rng.gen_range(-DEBUG_SAMPLE_EXTENT..DEBUG_SAMPLE_EXTENT);
            let y = rng.gen_range(-DEBUG_SAMPLE_EXTENT..DEBUG_SAMPLE_EXTENT);
            let biome = self.classify_with(noise, x, y);
            counts[biome.0 as usize] += 1;
        }

        Ok(self
            .registry
            .iter()
            .map(|(biome, b)| {
                let count = counts[biome.0 as usize];
                BiomeFrequency {
                    biome,
                    name: b.name.clone(),
                    count,
                    frequency: if samples == 0 {
                        0.0
                    } else {
                        count as f64 / samples as f64
                    },
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_biomes;

    fn field(seed: u64) -> BiomeField {
        let registry = Arc::new(BiomeRegistry::from_table(&default_biomes()).unwrap());
        let mut field = BiomeField::new(registry, 4);
        field.init_with_seed(seed);
        field
    }

    #[test]
    fn test_sample_before_init_fails() {
        let registry = Arc::new(BiomeRegistry::from_table(&default_biomes()).unwrap());
        let field = BiomeField::new(registry, 4);
        assert_eq!(field.sample(0, 0), Err(WorldError::NotInitialized));
        assert_eq!(
            field.debug_biome_distribution(10),
            Err(WorldError::NotInitialized)
        );
    }

    #[test]
    fn test_sample_is_reproducible() {
        let a = field(42);
        let b = field(42);
        for (x, y) in [(0, 0), (-17, 93), (1000, -1000), (123_456, 7)] {
            assert_eq!(a.sample(x, y).unwrap(), b.sample(x, y).unwrap());
        }
    }

    #[test]
    fn test_blend_is_bounded_and_consistent() {
        let field = field(7);
        let mut saw_boundary = false;
        for x in -400..400 {
            let result = field.sample(x * 7, x * 5).unwrap();
            assert!((0.0..=1.0).contains(&result.blend));
            if result.secondary == result.primary {
                assert_eq!(result.blend, 0.0);
            } else {
                saw_boundary = true;
                assert!(result.blend > 0.0);
            }
        }
        assert!(saw_boundary, "expected at least one biome boundary");
    }

    #[test]
    fn test_zero_radius_never_blends() {
        let registry = Arc::new(BiomeRegistry::from_table(&default_biomes()).unwrap());
        let mut field = BiomeField::new(registry, 0);
        field.init_with_seed(3);
        for x in 0..100 {
            let result = field.sample(x * 37, -x * 11).unwrap();
            assert_eq!(result.secondary, result.primary);
            assert_eq!(result.blend, 0.0);
        }
    }

    #[test]
    fn test_distribution_counts_every_sample() {
        let field = field(42);
        let report = field.debug_biome_distribution(2_000).unwrap();
        assert_eq!(report.len(), field.registry().len());
        assert_eq!(report.iter().map(|f| f.count).sum::<usize>(), 2_000);
        let total: f64 = report.iter().map(|f| f.frequency).sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert_eq!(report, field.debug_biome_distribution(2_000).unwrap());
    }
}
