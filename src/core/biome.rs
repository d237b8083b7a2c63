use std::collections::BTreeSet;

use crate::config::BiomeTable;
use crate::constants::CLIMATE_SCALE;
use crate::core::chunk::TileId;
use crate::error::ConfigError;

/// Dense index of a biome in the [`BiomeRegistry`], ordered by biome name.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct BiomeType(pub u16);

/// Resolved configuration for one biome.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Biome {
    pub name: String,
    pub temperature: i32,
    pub moisture: i32,
    tiles: Vec<(TileId, u32)>,
    total_weight: u32,
}

impl Biome {
    pub fn total_weight(&self) -> u32 {
        self.total_weight
    }

    pub fn tiles(&self) -> &[(TileId, u32)] {
        &self.tiles
    }

    /// Maps `roll` in `0..total_weight()` onto the weighted tile table.
    pub fn pick_tile(&self, roll: u32) -> TileId {
        let mut remaining = roll;
        for &(tile, weight) in &self.tiles {
            if remaining < weight {
                return tile;
            }
            remaining -= weight;
        }
        // roll >= total_weight; clamp to the last entry
        self.tiles.last().map(|&(tile, _)| tile).unwrap_or_default()
    }

    /// Squared distance in climate space.
    pub fn climate_distance(&self, temperature: f32, moisture: f32) -> f32 {
        let dt = temperature - self.temperature as f32;
        let dm = moisture - self.moisture as f32;
        dt * dt + dm * dm
    }
}

/// Every biome and tile known to the world, fixed at startup.
#[derive(Clone, Debug)]
pub struct BiomeRegistry {
    biomes: Vec<Biome>,
    tile_names: Vec<String>,
}

impl BiomeRegistry {
    pub fn from_table(table: &BiomeTable) -> Result<Self, ConfigError> {
        if table.is_empty() {
            return Err(ConfigError::Invalid("biome table is empty".to_string()));
        }
        if table.len() > u16::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "too many biomes: {}",
                table.len()
            )));
        }

        let tile_names: Vec<String> = table
            .values()
            .flat_map(|params| params.tiles.keys().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if tile_names.len() > TileId::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "too many distinct tiles: {}",
                tile_names.len()
            )));
        }

        let mut biomes = Vec::with_capacity(table.len());
        for (name, params) in table {
            for (axis, value) in [("temperature", params.temperature), ("moisture", params.moisture)] {
                if value.abs() > CLIMATE_SCALE {
                    return Err(ConfigError::Invalid(format!(
                        "biome {name}: {axis} {value} outside -{CLIMATE_SCALE}..={CLIMATE_SCALE}"
                    )));
                }
            }

            let mut tiles = Vec::with_capacity(params.tiles.len());
            let mut total_weight: u32 = 0;
            for (tile_name, &weight) in &params.tiles {
                if weight == 0 {
                    continue;
                }
                let id = tile_names
                    .binary_search(tile_name)
                    .map_err(|_| ConfigError::Invalid(format!("unknown tile {tile_name}")))?;
                total_weight = total_weight.checked_add(weight).ok_or_else(|| {
                    ConfigError::Invalid(format!("biome {name}: tile weights overflow"))
                })?;
                tiles.push((id as TileId, weight));
            }
            if total_weight == 0 {
                return Err(ConfigError::Invalid(format!(
                    "biome {name} has no tile with a positive weight"
                )));
            }

            biomes.push(Biome {
                name: name.clone(),
                temperature: params.temperature,
                moisture: params.moisture,
                tiles,
                total_weight,
            });
        }

        Ok(Self { biomes, tile_names })
    }

    pub fn len(&self) -> usize {
        self.biomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.biomes.is_empty()
    }

    pub fn get(&self, biome: BiomeType) -> Option<&Biome> {
        self.biomes.get(biome.0 as usize)
    }

    pub fn find(&self, name: &str) -> Option<BiomeType> {
        self.biomes
            .iter()
            .position(|b| b.name == name)
            .map(|i| BiomeType(i as u16))
    }

    pub fn iter(&self) -> impl Iterator<Item = (BiomeType, &Biome)> {
        self.biomes
            .iter()
            .enumerate()
            .map(|(i, b)| (BiomeType(i as u16), b))
    }

    pub fn tile_name(&self, tile: TileId) -> Option<&str> {
        self.tile_names.get(tile as usize).map(String::as_str)
    }

    pub fn tile_id(&self, name: &str) -> Option<TileId> {
        self.tile_names
            .binary_search_by(|t| t.as_str().cmp(name))
            .ok()
            .map(|i| i as TileId)
    }

    pub fn tile_count(&self) -> usize {
        self.tile_names.len()
    }

    /// Biome whose climate center is nearest; ties go to the lower index.
    pub fn nearest(&self, temperature: f32, moisture: f32) -> BiomeType {
        let mut best = BiomeType(0);
        let mut best_distance = f32::INFINITY;
        for (biome_type, biome) in self.iter() {
            let distance = biome.climate_distance(temperature, moisture);
            if distance < best_distance {
                best = biome_type;
                best_distance = distance;
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BiomeParams, default_biomes};
    use std::collections::BTreeMap;

    fn params(temperature: i32, moisture: i32, tiles: &[(&str, u32)]) -> BiomeParams {
        BiomeParams {
            temperature,
            moisture,
            tiles: tiles
                .iter()
                .map(|(n, w)| (n.to_string(), *w))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn test_registry_orders_by_name() {
        let registry = BiomeRegistry::from_table(&default_biomes()).unwrap();
        let names: Vec<&str> = registry.iter().map(|(_, b)| b.name.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert_eq!(registry.find("desert"), Some(BiomeType(0)));
    }

    #[test]
    fn test_shared_tiles_get_one_id() {
        let registry = BiomeRegistry::from_table(&default_biomes()).unwrap();
        let snow = registry.tile_id("snow").unwrap();
        let tundra = registry.get(registry.find("tundra").unwrap()).unwrap();
        let mountains = registry.get(registry.find("mountains").unwrap()).unwrap();
        assert!(tundra.tiles().iter().any(|&(t, _)| t == snow));
        assert!(mountains.tiles().iter().any(|&(t, _)| t == snow));
        assert_eq!(registry.tile_name(snow), Some("snow"));
    }

    #[test]
    fn test_pick_tile_follows_weights() {
        let mut table = BiomeTable::new();
        table.insert("a".into(), params(0, 0, &[("x", 3), ("y", 1)]));
        let registry = BiomeRegistry::from_table(&table).unwrap();
        let biome = registry.get(BiomeType(0)).unwrap();
        let x = registry.tile_id("x").unwrap();
        let y = registry.tile_id("y").unwrap();

        assert_eq!(biome.total_weight(), 4);
        assert_eq!(biome.pick_tile(0), x);
        assert_eq!(biome.pick_tile(2), x);
        assert_eq!(biome.pick_tile(3), y);
        assert_eq!(biome.pick_tile(100), y);
    }

    #[test]
    fn test_nearest_breaks_ties_by_index() {
        let mut table = BiomeTable::new();
        table.insert("cold".into(), params(-50, 0, &[("ice", 1)]));
        table.insert("hot".into(), params(50, 0, &[("sand", 1)]));
        let registry = BiomeRegistry::from_table(&table).unwrap();

        assert_eq!(registry.nearest(-80.0, 10.0), BiomeType(0));
        assert_eq!(registry.nearest(70.0, -10.0), BiomeType(1));
        assert_eq!(registry.nearest(0.0, 0.0), BiomeType(0));
    }

    #[test]
    fn test_rejects_bad_tables() {
        assert!(BiomeRegistry::from_table(&BiomeTable::new()).is_err());

        let mut zero = BiomeTable::new();
        zero.insert("empty".into(), params(0, 0, &[("x", 0)]));
        assert!(BiomeRegistry::from_table(&zero).is_err());

        let mut hot = BiomeTable::new();
        hot.insert("lava".into(), params(250, 0, &[("x", 1)]));
        assert!(BiomeRegistry::from_table(&hot).is_err());

        let mut overflow = BiomeTable::new();
        overflow.insert("big".into(), params(0, 0, &[("x", u32::MAX), ("y", 1)]));
        assert!(BiomeRegistry::from_table(&overflow).is_err());
    }
}
