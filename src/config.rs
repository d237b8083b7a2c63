use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{ConfigError, ServerError};

/// Biome name -> generation parameters.
pub type BiomeTable = BTreeMap<String, BiomeParams>;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default)]
    pub network: NetworkSettings,
    #[serde(default)]
    pub world: WorldSettings,
    #[serde(default)]
    pub limits: LimitSettings,
    #[serde(default)]
    pub accounts: AccountSettings,
    #[serde(default = "default_biomes")]
    pub biomes: BiomeTable,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            network: NetworkSettings::default(),
            world: WorldSettings::default(),
            limits: LimitSettings::default(),
            accounts: AccountSettings::default(),
            biomes: default_biomes(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkSettings {
    pub bind_address: String,
    pub tcp_port: u16,
    pub udp_port: u16,
    pub tick_rate_hz: u32,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            tcp_port: DEFAULT_TCP_PORT,
            udp_port: DEFAULT_UDP_PORT,
            tick_rate_hz: DEFAULT_TICK_RATE_HZ,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WorldSettings {
    /// Fixed world seed. A random seed is drawn at startup when absent.
    pub seed: Option<u64>,
    pub chunk_size: u16,
    /// Biome blend search distance, in tiles.
    pub blend_radius: u32,
    /// Subscription radius around the player's chunk, in chunks.
    pub view_radius: u32,
    pub grace_period_secs: f64,
    /// Evicted chunks are written here and restored on the next miss.
    pub archive_dir: Option<PathBuf>,
    /// 0 picks one worker per CPU.
    pub generation_workers: usize,
}

impl Default for WorldSettings {
    fn default() -> Self {
        Self {
            seed: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            blend_radius: DEFAULT_BLEND_RADIUS,
            view_radius: DEFAULT_VIEW_RADIUS,
            grace_period_secs: DEFAULT_GRACE_PERIOD_SECS,
            archive_dir: None,
            generation_workers: 0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LimitSettings {
    pub max_sessions: usize,
    pub max_loaded_chunks: usize,
    pub reliable_queue: usize,
    pub unreliable_queue: usize,
    pub max_inbound_per_tick: usize,
    /// Messages socket tasks may queue for the tick before reads stall.
    pub inbound_queue: usize,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            max_loaded_chunks: DEFAULT_MAX_LOADED_CHUNKS,
            reliable_queue: RELIABLE_QUEUE_CAPACITY,
            unreliable_queue: UNRELIABLE_QUEUE_CAPACITY,
            max_inbound_per_tick: MAX_INBOUND_PER_TICK,
            inbound_queue: INBOUND_QUEUE_CAPACITY,
        }
    }
}

/// Empty allow-list accepts every well-formed username.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AccountSettings {
    pub allow_list: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct BiomeParams {
    /// Climate center on the temperature axis, -100..=100.
    #[serde(default)]
    pub temperature: i32,
    /// Climate center on the moisture axis, -100..=100.
    #[serde(default)]
    pub moisture: i32,
    /// Tile name -> relative weight.
    pub tiles: BTreeMap<String, u32>,
}

fn biome(temperature: i32, moisture: i32, tiles: &[(&str, u32)]) -> BiomeParams {
    BiomeParams {
        temperature,
        moisture,
        tiles: tiles
            .iter()
            .map(|(name, weight)| (name.to_string(), *weight))
            .collect(),
    }
}

pub fn default_biomes() -> BiomeTable {
    let mut table = BiomeTable::new();
    table.insert(
        "plains".to_string(),
        biome(10, 0, &[("grass", 80), ("tall_grass", 15), ("flowers", 5)]),
    );
    table.insert(
        "forest".to_string(),
        biome(0, 35, &[("grass", 50), ("tree", 40), ("bush", 10)]),
    );
    table.insert(
        "desert".to_string(),
        biome(45, -40, &[("sand", 85), ("cactus", 5), ("dead_bush", 10)]),
    );
    table.insert(
        "tundra".to_string(),
        biome(-45, 0, &[("snow", 75), ("ice", 20), ("stone", 5)]),
    );
    table.insert(
        "swamp".to_string(),
        biome(20, 50, &[("mud", 50), ("water", 35), ("reeds", 15)]),
    );
    table.insert(
        "mountains".to_string(),
        biome(-15, -35, &[("stone", 70), ("gravel", 20), ("snow", 10)]),
    );
    table
}

impl ServerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let world = &self.world;
        if world.chunk_size == 0 || world.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "world.chunk_size must be within 1..={MAX_CHUNK_SIZE}, got {}",
                world.chunk_size
            )));
        }
        if world.view_radius > MAX_VIEW_RADIUS {
            return Err(ConfigError::Invalid(format!(
                "world.view_radius must be at most {MAX_VIEW_RADIUS}, got {}",
                world.view_radius
            )));
        }
        if !world.grace_period_secs.is_finite() || world.grace_period_secs < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "world.grace_period_secs must be a non-negative number, got {}",
                world.grace_period_secs
            )));
        }
        if self.network.tick_rate_hz == 0 {
            return Err(ConfigError::Invalid(
                "network.tick_rate_hz must be positive".to_string(),
            ));
        }
        if self.limits.reliable_queue == 0 || self.limits.unreliable_queue == 0 {
            return Err(ConfigError::Invalid(
                "outbound queue capacities must be positive".to_string(),
            ));
        }
        if self.limits.inbound_queue == 0 || self.limits.max_inbound_per_tick == 0 {
            return Err(ConfigError::Invalid(
                "inbound queue capacity and per-tick budget must be positive".to_string(),
            ));
        }
        if self.biomes.is_empty() {
            return Err(ConfigError::Invalid("biome table is empty".to_string()));
        }
        Ok(())
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs_f64(self.world.grace_period_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.network.tick_rate_hz as f64)
    }

    pub fn bind_address(&self, port: u16) -> Result<SocketAddr, ServerError> {
        let text = format!("{}:{}", self.network.bind_address, port);
        text.parse().map_err(|_| ServerError::BadAddress(text))
    }
}
