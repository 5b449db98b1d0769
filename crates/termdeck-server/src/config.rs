use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use termdeck_protocol::{DEFAULT_BUFFER_LIMIT, paths};

use crate::decks::{DeckConfig, parse_deck_arg};

pub const DEFAULT_LISTEN: &str = "127.0.0.1:7681";
pub const DEFAULT_MAX_CONNECTIONS_PER_IP: usize = 1000;
pub const DEFAULT_PERSIST_INTERVAL: Duration = Duration::from_secs(30);
const DAEMON_BIN_NAME: &str = "termdeck-daemon";

#[derive(Parser, Debug)]
#[command(name = "termdeck-server", about = "Browser terminals backed by a persistent PTY daemon")]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// TOML config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// HTTP listen address
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Directory holding the terminal store
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Daemon executable to spawn when none is running
    #[arg(long)]
    pub daemon_bin: Option<PathBuf>,

    /// Daemon discovery file
    #[arg(long, global = true)]
    pub discovery: Option<PathBuf>,

    /// Shared credential for HTTP and WebSocket clients
    #[arg(long)]
    pub credential: Option<String>,

    #[arg(long)]
    pub max_connections_per_ip: Option<usize>,

    /// Deck as ID=PATH (repeatable)
    #[arg(long = "deck", value_parser = parse_deck_arg)]
    pub decks: Vec<DeckConfig>,

    /// Allowed CORS origin (repeatable, `*` for any)
    #[arg(long = "allow-origin")]
    pub allow_origins: Vec<String>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Ask the running daemon to kill its terminals and exit
    StopDaemon,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    listen: Option<SocketAddr>,
    data_dir: Option<PathBuf>,
    daemon_bin: Option<PathBuf>,
    discovery_file: Option<PathBuf>,
    buffer_limit: Option<usize>,
    max_connections_per_ip: Option<usize>,
    credential: Option<String>,
    persist_interval_secs: Option<u64>,
    #[serde(default)]
    allow_origins: Vec<String>,
    #[serde(default)]
    decks: Vec<DeckConfig>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub data_dir: PathBuf,
    pub daemon_bin: PathBuf,
    pub discovery_file: PathBuf,
    pub buffer_limit: usize,
    pub max_connections_per_ip: usize,
    pub credential: Option<String>,
    pub persist_interval: Duration,
    pub allow_origins: Vec<String>,
    pub decks: Vec<DeckConfig>,
}

impl ServerConfig {
    /// File config first, then command-line flags on top.
    pub fn load(args: &Args) -> Result<Self> {
        let file_cfg = match &args.config {
            Some(path) => read_file_config(path)?,
            None => FileConfig::default(),
        };

        let listen = match args.listen.or(file_cfg.listen) {
            Some(addr) => addr,
            None => DEFAULT_LISTEN.parse().context("invalid default listen address")?,
        };

        let max_connections_per_ip = args
            .max_connections_per_ip
            .or(file_cfg.max_connections_per_ip)
            .unwrap_or(DEFAULT_MAX_CONNECTIONS_PER_IP);
        if max_connections_per_ip == 0 {
            bail!("max_connections_per_ip must be at least 1");
        }

        let mut decks = file_cfg.decks;
        decks.extend(args.decks.iter().cloned());
        if decks.is_empty() {
            decks.push(default_deck());
        }

        let allow_origins = if args.allow_origins.is_empty() {
            file_cfg.allow_origins
        } else {
            args.allow_origins.clone()
        };

        Ok(Self {
            listen,
            data_dir: args
                .data_dir
                .clone()
                .or(file_cfg.data_dir)
                .unwrap_or_else(paths::data_dir),
            daemon_bin: args
                .daemon_bin
                .clone()
                .or(file_cfg.daemon_bin)
                .unwrap_or_else(default_daemon_bin),
            discovery_file: args
                .discovery
                .clone()
                .or(file_cfg.discovery_file)
                .unwrap_or_else(paths::discovery_file_path),
            buffer_limit: file_cfg.buffer_limit.unwrap_or(DEFAULT_BUFFER_LIMIT),
            max_connections_per_ip,
            credential: args
                .credential
                .clone()
                .or(file_cfg.credential)
                .filter(|c| !c.is_empty()),
            persist_interval: file_cfg
                .persist_interval_secs
                .map(|secs| Duration::from_secs(secs.max(1)))
                .unwrap_or(DEFAULT_PERSIST_INTERVAL),
            allow_origins,
            decks,
        })
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("terminals.db")
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("failed to parse config {}", path.display()))
}

/// Without configured decks, one `default` deck rooted at `$HOME`.
fn default_deck() -> DeckConfig {
    let root = std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("/"));
    DeckConfig {
        id: "default".to_string(),
        root,
    }
}

/// The daemon binary installed next to this executable, else whatever
/// `termdeck-daemon` resolves to on `PATH`.
fn default_daemon_bin() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(DAEMON_BIN_NAME)))
        .filter(|candidate| candidate.exists())
        .unwrap_or_else(|| PathBuf::from(DAEMON_BIN_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["termdeck-server"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn defaults_apply_without_flags() {
        let cfg = ServerConfig::load(&args(&[])).expect("config");
        assert_eq!(cfg.listen, DEFAULT_LISTEN.parse::<SocketAddr>().expect("addr"));
        assert_eq!(cfg.max_connections_per_ip, 1000);
        assert_eq!(cfg.persist_interval, Duration::from_secs(30));
        assert_eq!(cfg.buffer_limit, DEFAULT_BUFFER_LIMIT);
        assert_eq!(cfg.decks.len(), 1);
        assert_eq!(cfg.decks[0].id, "default");
        assert!(cfg.credential.is_none());
    }

    #[test]
    fn flags_override_file_and_decks_merge() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("server.toml");
        fs::write(
            &path,
            r#"
listen = "127.0.0.1:9000"
credential = "from-file"
persist_interval_secs = 5
max_connections_per_ip = 3

[[decks]]
id = "web"
root = "/srv/web"
"#,
        )
        .expect("write config");

        let cfg = ServerConfig::load(&args(&[
            "--config",
            path.to_str().expect("utf8"),
            "--credential",
            "from-flag",
            "--deck",
            "api=/srv/api",
        ]))
        .expect("config");

        assert_eq!(cfg.listen.port(), 9000);
        assert_eq!(cfg.credential.as_deref(), Some("from-flag"));
        assert_eq!(cfg.persist_interval, Duration::from_secs(5));
        assert_eq!(cfg.max_connections_per_ip, 3);
        let ids: Vec<&str> = cfg.decks.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["web", "api"]);
    }

    #[test]
    fn zero_connection_cap_is_rejected() {
        let err = ServerConfig::load(&args(&["--max-connections-per-ip", "0"])).expect_err("zero");
        assert!(err.to_string().contains("at least 1"));
    }

    #[test]
    fn stop_daemon_subcommand_parses() {
        let parsed = args(&["stop-daemon", "--discovery", "/tmp/d.json"]);
        assert_eq!(parsed.command, Some(Command::StopDaemon));
        assert_eq!(parsed.discovery, Some(PathBuf::from("/tmp/d.json")));
    }
}
