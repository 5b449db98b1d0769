#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use futures_util::{SinkExt, StreamExt};
use termdeck_protocol::{DaemonEvent, DaemonRequest, LiveSession};
use termdeck_server::admission::{Authenticator, ConnectionLimiter};
use termdeck_server::daemon::{ClientTimeouts, DaemonClient, DaemonNotice};
use termdeck_server::decks::{DeckConfig, StaticDecks};
use termdeck_server::registry::{TerminalRegistry, spawn_notice_pump};
use termdeck_server::store::TerminalStore;
use termdeck_server::{AppState, app, build_cors};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;

pub const WAIT: Duration = Duration::from_secs(5);

/// How the mock answers requests on its own.
#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    pub live: Vec<LiveSession>,
    pub fail_creates: Option<String>,
    /// Never answer `create` or `list`.
    pub silent: bool,
}

/// A fake daemon on a loopback port. Every request it receives shows up on
/// `requests`; anything sent on `events` goes to the connected client.
pub struct MockDaemon {
    pub port: u16,
    pub requests: mpsc::UnboundedReceiver<DaemonRequest>,
    pub events: mpsc::UnboundedSender<DaemonEvent>,
    backlog: Vec<DaemonRequest>,
    hangup: CancellationToken,
}

impl MockDaemon {
    pub async fn start(behavior: MockBehavior) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind mock daemon")?;
        let port = listener.local_addr()?.port();
        let (req_tx, requests) = mpsc::unbounded_channel();
        let (events, mut event_rx) = mpsc::unbounded_channel::<DaemonEvent>();
        let reply_tx = events.clone();
        let hangup = CancellationToken::new();
        let stop = hangup.clone();

        tokio::spawn(async move {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let (read_half, write_half) = stream.into_split();
            let mut reader = FramedRead::new(read_half, LinesCodec::new());
            let mut writer = FramedWrite::new(write_half, LinesCodec::new());

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    event = event_rx.recv() => {
                        let Some(event) = event else { break };
                        let Ok(line) = serde_json::to_string(&event) else { continue };
                        if writer.send(line).await.is_err() {
                            break;
                        }
                    }
                    line = reader.next() => {
                        let Some(Ok(line)) = line else { break };
                        let Ok(req) = serde_json::from_str::<DaemonRequest>(&line) else {
                            continue;
                        };
                        if let Some(reply) = auto_reply(&behavior, &req) {
                            let _ = reply_tx.send(reply);
                        }
                        let _ = req_tx.send(req);
                    }
                }
            }
        });

        Ok(Self {
            port,
            requests,
            events,
            backlog: Vec::new(),
            hangup,
        })
    }

    pub async fn connect(
        &self,
        timeouts: ClientTimeouts,
    ) -> Result<(DaemonClient, mpsc::UnboundedReceiver<DaemonNotice>)> {
        let stream = TcpStream::connect(("127.0.0.1", self.port))
            .await
            .context("failed to connect to mock daemon")?;
        Ok(DaemonClient::from_stream(stream, timeouts))
    }

    pub fn send(&self, event: DaemonEvent) {
        let _ = self.events.send(event);
    }

    pub fn output(&self, id: &str, data: &str) {
        self.send(DaemonEvent::Data {
            id: id.to_string(),
            data: data.to_string(),
        });
    }

    /// Drop the connection as if the daemon died.
    pub fn hang_up(&self) {
        self.hangup.cancel();
    }

    /// Next request matching `pred`; earlier non-matching requests are kept.
    pub async fn expect<F>(&mut self, mut pred: F) -> Result<DaemonRequest>
    where
        F: FnMut(&DaemonRequest) -> bool,
    {
        if let Some(pos) = self.backlog.iter().position(&mut pred) {
            return Ok(self.backlog.remove(pos));
        }
        let deadline = Instant::now() + WAIT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let req = timeout(remaining, self.requests.recv())
                .await
                .context("timed out waiting for daemon request")?
                .context("mock daemon stopped")?;
            if pred(&req) {
                return Ok(req);
            }
            self.backlog.push(req);
        }
    }

    /// Every request seen so far, without waiting.
    pub fn drain(&mut self) -> Vec<DaemonRequest> {
        let mut seen = std::mem::take(&mut self.backlog);
        while let Ok(req) = self.requests.try_recv() {
            seen.push(req);
        }
        seen
    }
}

fn auto_reply(behavior: &MockBehavior, req: &DaemonRequest) -> Option<DaemonEvent> {
    match req {
        DaemonRequest::Create(params) if !behavior.silent => Some(match &behavior.fail_creates {
            Some(message) => DaemonEvent::error(Some(params.id.clone()), message.clone()),
            None => DaemonEvent::Created {
                id: params.id.clone(),
            },
        }),
        DaemonRequest::List if !behavior.silent => Some(DaemonEvent::ListResult {
            terminals: behavior.live.clone(),
        }),
        DaemonRequest::Shutdown => Some(DaemonEvent::ShutdownAck),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub credential: Option<String>,
    pub max_connections_per_ip: usize,
    pub buffer_limit: usize,
    pub timeouts: ClientTimeouts,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            credential: None,
            max_connections_per_ip: 1000,
            buffer_limit: 50_000,
            timeouts: ClientTimeouts::default(),
        }
    }
}

/// The full router on an ephemeral port, talking to a [`MockDaemon`].
pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<AppState>,
    pub registry: Arc<TerminalRegistry>,
    pub daemon: MockDaemon,
    pub http: reqwest::Client,
    _dir: tempfile::TempDir,
}

impl TestServer {
    pub async fn start(behavior: MockBehavior, options: ServerOptions) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(TerminalStore::open(&dir.path().join("terminals.db"))?);
        Self::start_with_store(behavior, options, store, dir).await
    }

    pub async fn start_with_store(
        behavior: MockBehavior,
        options: ServerOptions,
        store: Arc<TerminalStore>,
        dir: tempfile::TempDir,
    ) -> Result<Self> {
        let daemon = MockDaemon::start(behavior).await?;
        let (client, notices) = daemon.connect(options.timeouts).await?;

        let decks = StaticDecks::new(&[web_deck(dir.path())]);
        let registry = Arc::new(TerminalRegistry::new(
            client,
            store,
            Arc::new(decks),
            options.buffer_limit,
        ));
        spawn_notice_pump(Arc::clone(&registry), notices);
        registry.restore().await?;

        let state = Arc::new(AppState {
            registry: Arc::clone(&registry),
            limiter: Arc::new(ConnectionLimiter::new(options.max_connections_per_ip)),
            auth: Arc::new(Authenticator::new(options.credential)),
            shutdown: CancellationToken::new(),
        });
        let router = app(Arc::clone(&state), build_cors(&[])?);
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await;
        });

        Ok(Self {
            addr,
            state,
            registry,
            daemon,
            http: reqwest::Client::new(),
            _dir: dir,
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{path}", self.addr)
    }

    /// `POST /api/terminals` in the `web` deck; returns the new id.
    pub async fn create_terminal(&self) -> Result<String> {
        let resp = self
            .http
            .post(self.url("/api/terminals"))
            .json(&serde_json::json!({ "deckId": "web" }))
            .send()
            .await?;
        if resp.status() != reqwest::StatusCode::CREATED {
            bail!("create failed: {}", resp.status());
        }
        let body: serde_json::Value = resp.json().await?;
        body["id"]
            .as_str()
            .map(str::to_string)
            .context("create response has no id")
    }

    /// Wait until the server mirror of `id` holds `len` chars.
    pub async fn wait_for_buffer(&self, id: &str, len: usize) -> Result<()> {
        let deadline = Instant::now() + WAIT;
        loop {
            let current = self.registry.get(id).map(|r| r.info().buffer_length);
            if current == Some(len) {
                return Ok(());
            }
            if Instant::now() > deadline {
                bail!("buffer of {id} never reached {len} chars");
            }
            sleep(Duration::from_millis(10)).await;
        }
    }
}

pub fn web_deck(root: &Path) -> DeckConfig {
    DeckConfig {
        id: "web".to_string(),
        root: root.to_path_buf(),
    }
}
