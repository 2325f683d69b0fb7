//! tiercached - Shared Local Cache Daemon
//!
//! Serves this machine's cache tiers to every build process on it, over TCP
//! loopback and optionally a Unix domain socket.
//!
//! ```text
//! ┌───────────┐  ┌───────────┐  ┌───────────┐
//! │  build A  │  │  build B  │  │  build C  │
//! └─────┬─────┘  └─────┬─────┘  └─────┬─────┘
//!       └──────────────┼──────────────┘
//!                      ▼  HELLO / LOOKUP / STORE / BYE
//!              ┌───────────────┐
//!              │   tiercached  │──▶ local disk, archives, mirrors
//!              └───────────────┘
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tiercache::checksum::ChecksumRegistry;
use tiercache::{ArtifactCache, CacheConfig, DaemonServer, DirectoryLocker, NodeChain};

// =============================================================================
// CLI Arguments
// =============================================================================

/// tiercached - shared local artifact cache daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cache configuration file (YAML)
    #[arg(long, env = "TIERCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// TCP listen address
    #[arg(long, env = "TIERCACHE_LISTEN", default_value = "127.0.0.1:7601")]
    listen: SocketAddr,

    /// Unix domain socket path (in addition to TCP)
    #[arg(long, env = "TIERCACHE_SOCKET")]
    socket: Option<PathBuf>,

    /// Override the local cache directory from the configuration
    #[arg(long, env = "TIERCACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Identifier reported to clients during the handshake
    #[arg(long, env = "TIERCACHE_SERVER_ID", default_value = "tiercached")]
    server_id: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args)?;

    let mut config = match &args.config {
        Some(path) => CacheConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => CacheConfig::default(),
    };
    if let Some(dir) = &args.cache_dir {
        config.local.directory = dir.clone();
    }
    // The daemon is the daemon tier; it must not chain to itself
    config.daemon.enabled = false;

    info!("Starting tiercached");
    info!("  Server id: {}", args.server_id);
    info!("  Local directory: {}", config.local.directory.display());
    info!("  Archives: {}", config.archives.len());
    info!("  Mirrors: {}", config.mirrors.len());

    config.validate()?;
    let registry = ChecksumRegistry::default();
    let algorithms = registry.select(&config.checksums)?;
    let factories = config.factories(&registry, DirectoryLocker::global())?;
    let chain = Arc::new(NodeChain::assemble(&factories).await);
    if chain.is_empty() {
        anyhow::bail!("no cache tier could be started");
    }
    info!("  Tiers: {}", chain);

    let cache = Arc::new(ArtifactCache::new(chain, algorithms));
    let server = Arc::new(DaemonServer::new(args.server_id.clone(), cache.clone()));

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    let tcp = tokio::spawn(server.clone().serve_tcp(listener));

    let unix = spawn_unix_listener(args.socket.as_deref(), &server)?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    server.shutdown();

    if let Err(e) = tcp.await? {
        error!("TCP listener error: {}", e);
    }
    if let Some(unix) = unix {
        if let Err(e) = unix.await? {
            error!("Unix listener error: {}", e);
        }
        if let Some(path) = &args.socket {
            let _ = std::fs::remove_file(path);
        }
    }

    cache.close().await?;
    info!(
        connections = server.connections(),
        requests = server.requests(),
        "Daemon shutdown complete"
    );
    Ok(())
}

// =============================================================================
// Listeners
// =============================================================================

type ListenerTask = JoinHandle<tiercache::Result<()>>;

#[cfg(unix)]
fn spawn_unix_listener(
    socket: Option<&Path>,
    server: &Arc<DaemonServer>,
) -> anyhow::Result<Option<ListenerTask>> {
    let Some(path) = socket else {
        return Ok(None);
    };
    // A stale socket from a previous run blocks bind
    let _ = std::fs::remove_file(path);
    let listener = tokio::net::UnixListener::bind(path)
        .with_context(|| format!("binding {}", path.display()))?;
    info!("Unix socket listening on {}", path.display());
    Ok(Some(tokio::spawn(server.clone().serve_unix(listener))))
}

#[cfg(not(unix))]
fn spawn_unix_listener(
    socket: Option<&Path>,
    _server: &Arc<DaemonServer>,
) -> anyhow::Result<Option<ListenerTask>> {
    if socket.is_some() {
        anyhow::bail!("unix domain sockets are not supported on this platform");
    }
    Ok(None)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("tokio=warn".parse()?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}
