//! cachemeta Metadata Service
//!
//! Runs one metadata replica: opens the local store, the shared event
//! stream and checkpoint directory, applies the node's role on a fixed
//! interval and serves the status endpoint.

use anyhow::Result;
use cachemeta_common::{Config, Role};
use cachemeta_events::FileEventStream;
use cachemeta_meta::status::{self, StatusState};
use cachemeta_meta::{CheckpointLoop, LocalCheckpointManager, MetadataService, ServiceComponents};
use cachemeta_store::{ClusterStateStore, MetadataStore};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "cachemeta-meta")]
#[command(about = "cachemeta Metadata Service")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/cachemeta/meta.toml")]
    config: String,

    /// Role of this node (master or worker)
    #[arg(long, default_value = "worker")]
    role: Role,

    /// Seconds between role re-deliveries (default: a third of the
    /// heartbeat staleness threshold)
    #[arg(long)]
    role_interval_secs: Option<u64>,

    /// Data directory for the local metadata store (overrides config)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Event stream directory (overrides config)
    #[arg(long)]
    events_dir: Option<PathBuf>,

    /// Checkpoint directory (overrides config)
    #[arg(long)]
    checkpoints_dir: Option<PathBuf>,

    /// Listen address for the status endpoint (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level (overrides config)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load config file if it exists
    let mut config: Config = if std::path::Path::new(&args.config).exists() {
        let config_str = std::fs::read_to_string(&args.config)?;
        toml::from_str(&config_str).unwrap_or_else(|e| {
            eprintln!("Warning: Failed to parse config file: {}", e);
            Config::default()
        })
    } else {
        Config::default()
    };

    // CLI takes precedence
    if let Some(dir) = args.data_dir {
        config.node.data_dir = dir;
    }
    if let Some(dir) = args.events_dir {
        config.events.dir = dir;
    }
    if let Some(dir) = args.checkpoints_dir {
        config.checkpoints.dir = dir;
    }
    if let Some(listen) = args.listen {
        config.status.listen = listen;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting cachemeta Metadata Service ({})", config.node.name);

    std::fs::create_dir_all(&config.node.data_dir)?;
    let store = Arc::new(MetadataStore::open(config.store_path())?);
    let cluster = Arc::new(ClusterStateStore::new(
        config.checkpoints.cluster_state_path.clone(),
    ));
    let events = Arc::new(FileEventStream::open(
        &config.events.dir,
        config.events.max_segment_size,
    )?);
    let checkpoints = Arc::new(LocalCheckpointManager::new(
        config.checkpoints.dir.clone(),
        config.checkpoints.retained,
        Arc::clone(&store),
        cluster.checkpoint_path(),
    )?);

    let service = Arc::new(MetadataService::new(
        config.service.clone(),
        ServiceComponents {
            store,
            cluster,
            events,
            checkpoints: checkpoints.clone(),
            registry: checkpoints,
        },
    ));
    service.startup();

    // Periodic checkpoints
    let checkpoint_loop = Arc::new(CheckpointLoop::new(
        Arc::clone(&service),
        config.service.checkpoint_interval(),
    ));
    let checkpoint_handle =
        tokio::spawn(Arc::clone(&checkpoint_loop).run(service.shutdown_signal()));

    // Role re-delivery keeps the heartbeat fresh
    let role_interval = args.role_interval_secs.map_or_else(
        || (config.service.heartbeat_staleness() / 3).max(Duration::from_secs(1)),
        Duration::from_secs,
    );
    info!("Node role {} (re-delivered every {:?})", args.role, role_interval);
    let role_handle = tokio::spawn(role_loop(Arc::clone(&service), args.role, role_interval));

    // Status endpoint
    let app = status::router(Arc::new(StatusState {
        node_name: config.node.name.clone(),
        service: Arc::clone(&service),
        checkpoints: checkpoint_loop,
    }));
    let addr: SocketAddr = config.status.listen.parse().map_err(|e| {
        anyhow::anyhow!("Invalid listen address {}: {}", config.status.listen, e)
    })?;
    info!("Starting status server on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        })
        .await?;

    service.shutdown();
    checkpoint_handle.await?;
    role_handle.await?;

    info!("Metadata Service shut down gracefully");
    Ok(())
}

/// Deliver `role` to the service until shutdown
async fn role_loop(service: Arc<MetadataService>, role: Role, interval: Duration) {
    let mut shutdown = service.shutdown_signal();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.wait_for(|stopping| *stopping) => break,
        }
        // Failures are logged by the service; the next delivery retries
        if let Err(e) = service.on_role_updated(role).await {
            debug!("Role update incomplete: {}", e);
        }
    }
}
