// World constants
pub const DEFAULT_CHUNK_SIZE: u16 = 16;
pub const MAX_CHUNK_SIZE: u16 = 128;
pub const DEFAULT_BLEND_RADIUS: u32 = 4;
pub const DEFAULT_VIEW_RADIUS: u32 = 2;
pub const MAX_VIEW_RADIUS: u32 = 16;
pub const DEFAULT_GRACE_PERIOD_SECS: f64 = 30.0;
pub const CLIMATE_SCALE: i32 = 100;

// Network constants
pub const DEFAULT_TCP_PORT: u16 = 25565;
pub const DEFAULT_UDP_PORT: u16 = 25566;
pub const DEFAULT_TICK_RATE_HZ: u32 = 20;
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;
pub const MAX_USERNAME_LEN: usize = 32;
pub const MAX_CHAT_LEN: usize = 256;

// Resource limits
pub const DEFAULT_MAX_SESSIONS: usize = 64;
pub const DEFAULT_MAX_LOADED_CHUNKS: usize = 16_384;
pub const RELIABLE_QUEUE_CAPACITY: usize = 1024;
pub const UNRELIABLE_QUEUE_CAPACITY: usize = 64;
pub const MAX_INBOUND_PER_TICK: usize = 4096;
pub const INBOUND_QUEUE_CAPACITY: usize = 8192;

// Generation workers
pub const GENERATION_QUEUE_CAPACITY: usize = 256;
pub const EVENT_QUEUE_CAPACITY: usize = 1024;
