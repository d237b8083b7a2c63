//! Tileworld dedicated server
//!
//! Builds the world and network stack from configuration and serves until
//! Ctrl+C.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use clap::Parser;
use tileworld::config::ServerConfig;
use tileworld::constants::EVENT_QUEUE_CAPACITY;
use tileworld::error::ServerError;
use tileworld::multiplayer::{AccountLookup, AllowList, OpenAccounts};
use tileworld::{
    BiomeField, BiomeRegistry, ChunkArchive, ChunkGenerator, ChunkStore, GenerationPool,
    SyncServer,
};

/// Tileworld multiplayer server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// World seed (random when omitted and not configured)
    #[arg(long)]
    seed: Option<u64>,

    /// TCP port for the reliable channel
    #[arg(long)]
    tcp_port: Option<u16>,

    /// UDP port for position datagrams
    #[arg(long)]
    udp_port: Option<u16>,

    /// Subscription radius in chunks
    #[arg(long)]
    view_radius: Option<u32>,

    /// Print the biome distribution over N samples and exit
    #[arg(long, value_name = "N")]
    biome_report: Option<usize>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "server failed");
            ExitCode::FAILURE
        }
    }
}

fn load_config(args: &Args) -> Result<ServerConfig, ServerError> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(seed) = args.seed {
        config.world.seed = Some(seed);
    }
    if let Some(port) = args.tcp_port {
        config.network.tcp_port = port;
    }
    if let Some(port) = args.udp_port {
        config.network.udp_port = port;
    }
    if let Some(radius) = args.view_radius {
        config.world.view_radius = radius;
    }
    config.validate()?;
    Ok(config)
}

fn run(args: Args) -> Result<(), ServerError> {
    let config = load_config(&args)?;

    let registry = Arc::new(BiomeRegistry::from_table(&config.biomes)?);
    let mut field = BiomeField::new(registry, config.world.blend_radius);
    let seed = match config.world.seed {
        Some(seed) => {
            field.init_with_seed(seed);
            seed
        }
        None => field.init(),
    };
    tracing::info!(seed, biomes = field.registry().len(), "world seeded");

    if let Some(samples) = args.biome_report {
        for entry in field.debug_biome_distribution(samples)? {
            println!(
                "{:<12} {:>8} {:>7.2}%",
                entry.name,
                entry.count,
                entry.frequency * 100.0
            );
        }
        return Ok(());
    }

    let generator = Arc::new(ChunkGenerator::new(Arc::new(field), config.world.chunk_size)?);
    let pool = match config.world.generation_workers {
        0 => GenerationPool::new(generator.clone())?,
        n => GenerationPool::with_worker_count(n, generator.clone())?,
    };
    tracing::info!(workers = pool.worker_count(), "generation pool ready");

    let mut store = ChunkStore::new(generator, config.grace_period()).with_pool(pool);
    if let Some(dir) = &config.world.archive_dir {
        store = store.with_archive(ChunkArchive::open(dir, seed)?);
        tracing::info!(dir = %dir.display(), "chunk archive enabled");
    }
    let store = Arc::new(store);

    // Chunk loads are logged off the tick thread
    let loads = store.subscribe_load_events(EVENT_QUEUE_CAPACITY);
    thread::Builder::new()
        .name("chunk-events".to_string())
        .spawn(move || {
            for event in loads {
                tracing::trace!(chunk = %event.coord(), origin = ?event.origin, "chunk loaded");
            }
        })?;

    let accounts: Arc<dyn AccountLookup> = if config.accounts.allow_list.is_empty() {
        Arc::new(OpenAccounts)
    } else {
        Arc::new(AllowList::new(&config.accounts.allow_list))
    };

    let (tcp_port, udp_port) = (config.network.tcp_port, config.network.udp_port);
    let mut server = SyncServer::new(config, store, accounts);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let (tcp_addr, udp_addr) = server.start_server(tcp_port, udp_port).await?;
        tracing::info!(%tcp_addr, %udp_addr, "Press Ctrl+C to stop the server.");

        let chat = server.subscribe_chat(EVENT_QUEUE_CAPACITY);
        thread::Builder::new()
            .name("chat-log".to_string())
            .spawn(move || {
                for message in chat {
                    tracing::info!(sender = %message.sender, kind = ?message.kind, "{}", message.content);
                }
            })?;

        tokio::signal::ctrl_c().await?;
        tracing::info!("shutdown requested");
        server.stop_server().await
    })
}
