mod connection;

use anyhow::{Context, Result};
use clap::Parser;
use libtermdeck::{SessionManager, SessionManagerConfig};
use serde::Deserialize;
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use termdeck_protocol::{DEFAULT_BUFFER_LIMIT, DiscoveryInfo, paths};
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// How long shutdown waits for the last connection to flush its queue.
const CONNECTION_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "termdeck-daemon", about = "PTY host for termdeck terminals")]
struct Args {
    /// TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Where to write the `{pid, port}` discovery record
    #[arg(long)]
    discovery: Option<PathBuf>,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Per-session output buffer size, in chars
    #[arg(long)]
    buffer_limit: Option<usize>,
}

#[derive(Debug, Clone)]
struct RuntimeConfig {
    discovery_file: PathBuf,
    buffer_limit: usize,
    outbound_queue: usize,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    discovery_file: Option<PathBuf>,
    buffer_limit: Option<usize>,
    outbound_queue: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_file.as_deref())?;

    let cfg = load_runtime_config(&args)?;

    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
        .await
        .context("failed to bind loopback listener")?;
    let port = listener.local_addr()?.port();
    let pid = std::process::id();
    paths::write_discovery(&cfg.discovery_file, &DiscoveryInfo { pid, port })
        .with_context(|| format!("failed to write {}", cfg.discovery_file.display()))?;

    info!(
        pid,
        port,
        discovery = %cfg.discovery_file.display(),
        buffer_limit = cfg.buffer_limit,
        "termdeck-daemon started"
    );

    let manager = Arc::new(SessionManager::new(SessionManagerConfig {
        buffer_limit: cfg.buffer_limit,
    }));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let last_connection = accept_loop(
        listener,
        Arc::clone(&manager),
        cfg.outbound_queue,
        shutdown_rx,
        shutdown_tx,
    )
    .await;

    if let Some(handle) = last_connection
        && tokio::time::timeout(CONNECTION_DRAIN_TIMEOUT, handle).await.is_err()
    {
        warn!("control connection did not drain before shutdown");
    }

    let killed = manager.kill_all().await;
    if let Err(err) = paths::remove_discovery(&cfg.discovery_file) {
        warn!("failed to remove discovery file: {err}");
    }
    info!(killed, "termdeck-daemon stopped");
    Ok(())
}

/// Accept control connections until shutdown. Each accepted connection
/// replaces the previous one. Returns the handle of the newest connection
/// so shutdown can let it flush.
async fn accept_loop(
    listener: TcpListener,
    manager: Arc<SessionManager>,
    outbound_queue: usize,
    mut shutdown_rx: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
) -> Option<JoinHandle<()>> {
    let mut sigterm = signal(SignalKind::terminate()).ok();
    let mut current: Option<JoinHandle<()>> = None;

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("shutdown requested, stopping accept loop");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break;
            }
            _ = async {
                match sigterm.as_mut() {
                    Some(sig) => { sig.recv().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {
                info!("terminated, shutting down");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(v) => v,
                    Err(err) => {
                        warn!("accept failed: {err}");
                        continue;
                    }
                };
                if !peer.ip().is_loopback() {
                    warn!(%peer, "rejected non-loopback peer");
                    continue;
                }
                info!(%peer, "control connection accepted");
                current = Some(tokio::spawn(connection::handle_connection(
                    stream,
                    Arc::clone(&manager),
                    outbound_queue,
                    shutdown_tx.clone(),
                )));
            }
        }
    }

    current
}

fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "termdeck_daemon=info,libtermdeck=info".into());
    match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

fn load_runtime_config(args: &Args) -> Result<RuntimeConfig> {
    let file_cfg = if let Some(path) = &args.config {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str::<FileConfig>(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?
    } else {
        FileConfig::default()
    };

    let discovery_file = args
        .discovery
        .clone()
        .or(file_cfg.discovery_file)
        .unwrap_or_else(paths::discovery_file_path);

    Ok(RuntimeConfig {
        discovery_file,
        buffer_limit: args
            .buffer_limit
            .or(file_cfg.buffer_limit)
            .unwrap_or(DEFAULT_BUFFER_LIMIT),
        outbound_queue: file_cfg.outbound_queue.unwrap_or(4096).max(1),
    })
}
