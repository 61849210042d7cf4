//! Logos Updater — WebSocket gateway in front of the document updater.
//!
//! Documents are persisted to RocksDB when `--storage` is given; history and
//! archive services run in-process.

use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::time::Duration;

use logos_updater::{ServerConfig, UpdaterConfig, UpdaterServer};

#[derive(Parser)]
#[command(name = "logos-updater")]
#[command(version = "0.1.0")]
#[command(about = "Operational-transform document updater", long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(short, long, env = "UPDATER_BIND", default_value = "127.0.0.1:3003")]
    bind: String,

    /// RocksDB directory; omit to keep documents in memory
    #[arg(short, long, env = "UPDATER_STORAGE", value_name = "DIR")]
    storage: Option<PathBuf>,

    /// Ops applied between doc-history flushes
    #[arg(long, env = "UPDATER_DOC_HISTORY_THRESHOLD", default_value_t = 100)]
    doc_history_threshold: u64,

    /// Ops queued between project-history flushes
    #[arg(long, env = "UPDATER_PROJECT_HISTORY_THRESHOLD", default_value_t = 500)]
    project_history_threshold: u64,

    /// Op-log retention in minutes
    #[arg(long, env = "UPDATER_OP_LOG_TTL_MINS", default_value_t = 60)]
    op_log_ttl_mins: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let mut updater = UpdaterConfig::default();
    updater.flush.doc_history_threshold = cli.doc_history_threshold;
    updater.flush.project_history_threshold = cli.project_history_threshold;
    updater.op_log.ttl = Duration::from_secs(cli.op_log_ttl_mins * 60);

    let config = ServerConfig {
        bind_addr: cli.bind,
        storage_path: cli.storage,
        updater,
        ..ServerConfig::default()
    };
    match &config.storage_path {
        Some(path) => info!("Persisting documents to {}", path.display()),
        None => info!("No storage path given, documents are kept in memory"),
    }

    let server = UpdaterServer::open(config)?;
    let maintenance = server.spawn_maintenance();

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down, flushing loaded documents");
            server.shutdown().await;
        }
    }
    maintenance.abort();
    Ok(())
}
