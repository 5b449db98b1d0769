use std::fs;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use termdeck_server::admission::{Authenticator, ConnectionLimiter};
use termdeck_server::config::{Args, Command, ServerConfig};
use termdeck_server::daemon::{ClientTimeouts, DaemonClient, DaemonLauncher};
use termdeck_server::decks::StaticDecks;
use termdeck_server::persistence::{flush_buffers, spawn_snapshot_loop};
use termdeck_server::registry::{CLOSE_GOING_AWAY, TerminalRegistry, spawn_notice_pump};
use termdeck_server::store::TerminalStore;
use termdeck_server::{AppState, app, build_cors};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const STOP_DAEMON_WAIT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "termdeck_server=info,libtermdeck=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = ServerConfig::load(&args)?;

    match args.command {
        Some(Command::StopDaemon) => stop_daemon(&config).await,
        None => serve(config).await,
    }
}

async fn stop_daemon(config: &ServerConfig) -> Result<()> {
    let launcher = DaemonLauncher::new(config.discovery_file.clone(), config.daemon_bin.clone());
    let Some(stream) = launcher.connect_existing().await else {
        bail!(
            "no daemon running (discovery file {})",
            config.discovery_file.display()
        );
    };
    let (client, _notices) = DaemonClient::from_stream(stream, ClientTimeouts::default());
    client
        .shutdown(STOP_DAEMON_WAIT)
        .await
        .context("daemon did not acknowledge shutdown")?;
    info!("daemon stopped");
    Ok(())
}

async fn serve(config: ServerConfig) -> Result<()> {
    fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create {}", config.data_dir.display()))?;
    let store = Arc::new(TerminalStore::open(&config.store_path())?);

    let mut launcher =
        DaemonLauncher::new(config.discovery_file.clone(), config.daemon_bin.clone());
    launcher.log_file = Some(config.data_dir.join("daemon.log"));
    let stream = launcher.connect_or_spawn().await?;
    let (daemon, notices) = DaemonClient::from_stream(stream, ClientTimeouts::default());

    let registry = Arc::new(TerminalRegistry::new(
        daemon,
        store,
        Arc::new(StaticDecks::new(&config.decks)),
        config.buffer_limit,
    ));
    let pump = spawn_notice_pump(Arc::clone(&registry), notices);
    registry.restore().await?;

    let auth = Arc::new(Authenticator::new(config.credential.clone()));
    if auth.is_open() {
        warn!("no credential configured; every client is trusted");
    }

    let shutdown = CancellationToken::new();
    let state = Arc::new(AppState {
        registry: Arc::clone(&registry),
        limiter: Arc::new(ConnectionLimiter::new(config.max_connections_per_ip)),
        auth,
        shutdown: shutdown.clone(),
    });
    let snapshots = spawn_snapshot_loop(
        Arc::clone(&registry),
        config.persist_interval,
        shutdown.clone(),
    );

    let router = app(state, build_cors(&config.allow_origins)?);
    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!("termdeck-server listening on http://{}", config.listen);

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(wait_for_shutdown(shutdown.clone()))
    .await?;

    let closed = registry.close_all_sockets(CLOSE_GOING_AWAY, "server shutting down");
    if let Err(err) = snapshots.await {
        warn!("snapshot loop ended abnormally: {err}");
    }
    match flush_buffers(&registry) {
        Ok(saved) => info!(saved, sockets = closed, "final buffer save complete"),
        Err(err) => error!("final buffer save failed: {err}"),
    }
    pump.abort();
    Ok(())
}

/// Resolves on SIGINT, SIGTERM, SIGHUP or an admin shutdown request, and
/// cancels `shutdown` so socket tasks close with 1001.
async fn wait_for_shutdown(shutdown: CancellationToken) {
    let mut sigterm = signal(SignalKind::terminate()).ok();
    let mut sighup = signal(SignalKind::hangup()).ok();
    let term = async {
        match sigterm.as_mut() {
            Some(s) => {
                s.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };
    let hup = async {
        match sighup.as_mut() {
            Some(s) => {
                s.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = shutdown.cancelled() => info!("shutdown requested"),
        _ = tokio::signal::ctrl_c() => info!("interrupted, shutting down"),
        _ = term => info!("SIGTERM received, shutting down"),
        _ = hup => info!("SIGHUP received, shutting down"),
    }
    shutdown.cancel();
}
