//! cojson sync server
//!
//! Accepts websocket peers and keeps every value they send in storage,
//! relaying changes between clients subscribed to the same values.
//!
//! Usage:
//!   sync-server --port 4200 --db sync-db/storage.db
//!   sync-server --in-memory --flaky --flaky-drop-rate 0.5

use anyhow::{Context, Result};
use clap::Parser;
use cojson_core::{LocalNode, NodeConfig};
use cojson_crypto::AgentSecret;
use cojson_storage::{LocalStorage, SqliteClient, StorageApi};
use cojson_sync::{SyncConfig, SyncManager};
use std::{fs, path::PathBuf, sync::Arc};
use sync_server::{ServerState, build_router};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber, filter::LevelFilter};

#[derive(Parser, Debug)]
#[command(name = "sync-server")]
#[command(about = "cojson websocket sync server")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "4200")]
    port: u16,

    /// Path to the SQLite database
    #[arg(long, default_value = "sync-db/storage.db")]
    db: PathBuf,

    /// Keep everything in memory instead of on disk
    #[arg(long, conflicts_with = "db")]
    in_memory: bool,

    /// Randomly drop incoming messages, for testing clients
    #[arg(long)]
    flaky: bool,

    /// Probability of dropping each incoming message with --flaky
    #[arg(long, default_value = "0.8", requires = "flaky")]
    flaky_drop_rate: f64,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn open_storage(args: &Args) -> Result<Arc<dyn StorageApi>> {
    let client = if args.in_memory {
        info!("using in-memory storage");
        SqliteClient::open_in_memory().context("failed to open in-memory database")?
    } else {
        if let Some(parent) = args.db.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        info!(path = %args.db.display(), "using SQLite storage");
        SqliteClient::open(&args.db)
            .with_context(|| format!("failed to open {}", args.db.display()))?
    };
    Ok(Arc::new(LocalStorage::new(client)))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = if args.verbose { LevelFilter::DEBUG } else { LevelFilter::INFO };
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(log_level.into())
                .from_env_lossy(),
        )
        .with_target(false)
        .compact()
        .init();

    let storage = open_storage(&args)?;
    let node = LocalNode::with_agent(AgentSecret::generate(), NodeConfig::default());
    info!(agent = %node.agent_id(), "sync server starting");

    let config = SyncConfig::default();
    let sync = SyncManager::new(node, Some(storage), config.clone());
    let flaky = args.flaky.then_some(args.flaky_drop_rate);
    if let Some(rate) = flaky {
        warn!(drop_rate = rate, "flaky mode: dropping incoming messages");
    }
    let state = Arc::new(ServerState::new(sync.clone(), config, flaky));
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", args.port))
        .await
        .with_context(|| format!("failed to bind port {}", args.port))?;
    info!(port = args.port, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server failed")?;
    sync.shutdown();
    Ok(())
}
