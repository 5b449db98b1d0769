//! Client side of the daemon control connection.
//!
//! Replies are correlated through [`PendingRequests`]: `create` waiters are
//! keyed by terminal id, `list` and `shutdown` waiters are answered in bulk.
//! Anything the daemon pushes on its own (`data`, `exit`) comes out of the
//! notice channel returned by [`DaemonClient::from_stream`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use termdeck_protocol::{
    CREATE_TIMEOUT, CreateParams, DISCOVERY_WAIT, DaemonEvent, DaemonRequest, LIST_TIMEOUT,
    LiveSession, MAX_JSON_LINE_BYTES, SessionId, paths,
};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ServerError;

const DISCOVERY_POLL: Duration = Duration::from_millis(100);

/// Unsolicited daemon traffic for the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonNotice {
    Data { id: SessionId, data: String },
    Exit { id: SessionId, code: Option<i32> },
    /// The control connection is gone for good.
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateReply {
    Created,
    Failed(String),
    Unavailable,
}

/// Outstanding requests waiting for a daemon reply.
#[derive(Debug, Default)]
pub struct PendingRequests {
    next_token: u64,
    creates: HashMap<SessionId, Vec<(u64, oneshot::Sender<CreateReply>)>>,
    lists: Vec<(u64, oneshot::Sender<Vec<LiveSession>>)>,
    shutdowns: Vec<oneshot::Sender<()>>,
    closed: bool,
}

impl PendingRequests {
    fn token(&mut self) -> u64 {
        self.next_token = self.next_token.wrapping_add(1);
        self.next_token
    }

    /// `None` once the connection has closed.
    pub fn register_create(&mut self, id: &str) -> Option<(u64, oneshot::Receiver<CreateReply>)> {
        if self.closed {
            return None;
        }
        let token = self.token();
        let (tx, rx) = oneshot::channel();
        self.creates.entry(id.to_string()).or_default().push((token, tx));
        Some((token, rx))
    }

    /// Answer every waiter for `id`. Returns how many there were.
    pub fn resolve_create(&mut self, id: &str, reply: CreateReply) -> usize {
        let Some(waiters) = self.creates.remove(id) else {
            return 0;
        };
        let count = waiters.len();
        for (_, tx) in waiters {
            let _ = tx.send(reply.clone());
        }
        count
    }

    /// Drop one timed-out waiter. Returns false if it was already answered.
    pub fn expire_create(&mut self, id: &str, token: u64) -> bool {
        let Some(waiters) = self.creates.get_mut(id) else {
            return false;
        };
        let before = waiters.len();
        waiters.retain(|(t, _)| *t != token);
        let removed = waiters.len() != before;
        if waiters.is_empty() {
            self.creates.remove(id);
        }
        removed
    }

    pub fn register_list(&mut self) -> Option<(u64, oneshot::Receiver<Vec<LiveSession>>)> {
        if self.closed {
            return None;
        }
        let token = self.token();
        let (tx, rx) = oneshot::channel();
        self.lists.push((token, tx));
        Some((token, rx))
    }

    pub fn resolve_lists(&mut self, terminals: &[LiveSession]) -> usize {
        let waiters = std::mem::take(&mut self.lists);
        let count = waiters.len();
        for (_, tx) in waiters {
            let _ = tx.send(terminals.to_vec());
        }
        count
    }

    pub fn expire_list(&mut self, token: u64) -> bool {
        let before = self.lists.len();
        self.lists.retain(|(t, _)| *t != token);
        self.lists.len() != before
    }

    pub fn register_shutdown(&mut self) -> Option<oneshot::Receiver<()>> {
        if self.closed {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        self.shutdowns.push(tx);
        Some(rx)
    }

    pub fn resolve_shutdowns(&mut self) {
        for tx in self.shutdowns.drain(..) {
            let _ = tx.send(());
        }
    }

    /// The connection is gone: creates fail, lists come back empty, and
    /// nothing new can be registered.
    pub fn close(&mut self) {
        self.closed = true;
        for (_, waiters) in self.creates.drain() {
            for (_, tx) in waiters {
                let _ = tx.send(CreateReply::Unavailable);
            }
        }
        for (_, tx) in self.lists.drain(..) {
            let _ = tx.send(Vec::new());
        }
        self.shutdowns.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn pending_creates(&self) -> usize {
        self.creates.values().map(Vec::len).sum()
    }

    pub fn pending_lists(&self) -> usize {
        self.lists.len()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ClientTimeouts {
    pub create: Duration,
    pub list: Duration,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self {
            create: CREATE_TIMEOUT,
            list: LIST_TIMEOUT,
        }
    }
}

/// Handle to the daemon control connection. Cheap to clone.
///
/// There is no reconnect: once the connection drops every later request
/// fails fast and the server has to be restarted.
#[derive(Clone)]
pub struct DaemonClient {
    out_tx: mpsc::UnboundedSender<DaemonRequest>,
    pending: Arc<Mutex<PendingRequests>>,
    timeouts: ClientTimeouts,
}

impl DaemonClient {
    pub async fn connect(
        port: u16,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DaemonNotice>), ServerError> {
        let stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .map_err(|e| ServerError::DaemonUnavailable(format!("connect to port {port}: {e}")))?;
        Ok(Self::from_stream(stream, ClientTimeouts::default()))
    }

    /// Start the reader/writer tasks on an established connection.
    pub fn from_stream(
        stream: TcpStream,
        timeouts: ClientTimeouts,
    ) -> (Self, mpsc::UnboundedReceiver<DaemonNotice>) {
        if let Err(err) = stream.set_nodelay(true) {
            debug!("set_nodelay failed: {err}");
        }
        let (read_half, write_half) = stream.into_split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let pending = Arc::new(Mutex::new(PendingRequests::default()));
        let closed = CancellationToken::new();

        tokio::spawn(write_loop(write_half, out_rx, closed.clone()));
        tokio::spawn(read_loop(read_half, Arc::clone(&pending), notice_tx, closed));

        (
            Self {
                out_tx,
                pending,
                timeouts,
            },
            notice_rx,
        )
    }

    fn pending(&self) -> MutexGuard<'_, PendingRequests> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_connected(&self) -> bool {
        !self.pending().is_closed()
    }

    /// Spawn (or re-acknowledge) a daemon session. Resolves on `created`,
    /// fails on a matching `error`, a lost connection, or the create timeout.
    pub async fn create(&self, params: CreateParams) -> Result<(), ServerError> {
        let id = params.id.clone();
        let Some((token, rx)) = self.pending().register_create(&id) else {
            return Err(ServerError::DaemonUnavailable("control connection closed".into()));
        };
        if self.out_tx.send(DaemonRequest::Create(params)).is_err() {
            self.pending().expire_create(&id, token);
            return Err(ServerError::DaemonUnavailable("control connection closed".into()));
        }

        match tokio::time::timeout(self.timeouts.create, rx).await {
            Ok(Ok(CreateReply::Created)) => Ok(()),
            Ok(Ok(CreateReply::Failed(message))) => Err(ServerError::SpawnFailure(message)),
            Ok(Ok(CreateReply::Unavailable)) | Ok(Err(_)) => Err(ServerError::DaemonUnavailable(
                "control connection lost".into(),
            )),
            Err(_) => {
                self.pending().expire_create(&id, token);
                warn!(terminal_id = %id, "daemon did not answer create in time");
                Err(ServerError::DaemonRequestTimeout { operation: "create" })
            }
        }
    }

    /// Live daemon sessions. Empty on timeout or a closed connection so a
    /// boot sequence can always proceed.
    pub async fn list(&self) -> Vec<LiveSession> {
        let (token, rx, in_flight) = {
            let mut pending = self.pending();
            let in_flight = pending.pending_lists() > 0;
            let Some((token, rx)) = pending.register_list() else {
                return Vec::new();
            };
            (token, rx, in_flight)
        };
        // Concurrent callers share the reply to the request already sent.
        if !in_flight && self.out_tx.send(DaemonRequest::List).is_err() {
            self.pending().expire_list(token);
            return Vec::new();
        }
        match tokio::time::timeout(self.timeouts.list, rx).await {
            Ok(Ok(terminals)) => terminals,
            Ok(Err(_)) => Vec::new(),
            Err(_) => {
                self.pending().expire_list(token);
                warn!("daemon did not answer list in time; assuming no live sessions");
                Vec::new()
            }
        }
    }

    pub fn input(&self, id: &str, data: &str) {
        self.send(DaemonRequest::Input {
            id: id.to_string(),
            data: data.to_string(),
        });
    }

    pub fn resize(&self, id: &str, cols: u16, rows: u16) {
        self.send(DaemonRequest::Resize {
            id: id.to_string(),
            cols,
            rows,
        });
    }

    pub fn kill(&self, id: &str) {
        self.send(DaemonRequest::Kill { id: id.to_string() });
    }

    pub fn attach(&self, id: &str, buffer_offset: usize) {
        self.send(DaemonRequest::Attach {
            id: id.to_string(),
            buffer_offset,
        });
    }

    /// Ask the daemon to exit and wait for its acknowledgement.
    pub async fn shutdown(&self, wait: Duration) -> Result<(), ServerError> {
        let Some(rx) = self.pending().register_shutdown() else {
            return Err(ServerError::DaemonUnavailable("control connection closed".into()));
        };
        self.send(DaemonRequest::Shutdown);
        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ServerError::DaemonUnavailable(
                "connection closed before shutdown_ack".into(),
            )),
            Err(_) => Err(ServerError::DaemonRequestTimeout {
                operation: "shutdown",
            }),
        }
    }

    fn send(&self, req: DaemonRequest) {
        if let Err(err) = self.out_tx.send(req) {
            debug!("daemon connection closed; dropping {:?}", err.0);
        }
    }
}

async fn write_loop(
    write_half: OwnedWriteHalf,
    mut out_rx: mpsc::UnboundedReceiver<DaemonRequest>,
    closed: CancellationToken,
) {
    let mut writer = FramedWrite::new(
        write_half,
        LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES),
    );
    loop {
        let req = tokio::select! {
            _ = closed.cancelled() => break,
            req = out_rx.recv() => match req {
                Some(req) => req,
                None => break,
            },
        };
        let line = match serde_json::to_string(&req) {
            Ok(line) => line,
            Err(err) => {
                error!("failed to encode daemon request: {err}");
                continue;
            }
        };
        if let Err(err) = writer.send(line).await {
            warn!("daemon write failed: {err}");
            break;
        }
    }
}

async fn read_loop(
    read_half: OwnedReadHalf,
    pending: Arc<Mutex<PendingRequests>>,
    notices: mpsc::UnboundedSender<DaemonNotice>,
    closed: CancellationToken,
) {
    let mut reader = FramedRead::new(
        read_half,
        LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES),
    );
    let lock = || pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

    while let Some(next) = reader.next().await {
        let line = match next {
            Ok(line) => line,
            Err(err) => {
                warn!("daemon read failed: {err}");
                break;
            }
        };
        let event: DaemonEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(err) => {
                debug!("ignoring malformed daemon line: {err}");
                continue;
            }
        };

        match event {
            DaemonEvent::Created { id } => {
                if lock().resolve_create(&id, CreateReply::Created) == 0 {
                    debug!(terminal_id = %id, "created with no waiter");
                }
            }
            DaemonEvent::Error {
                id: Some(id),
                message,
            } => {
                if lock().resolve_create(&id, CreateReply::Failed(message.clone())) == 0 {
                    warn!(terminal_id = %id, "daemon error: {message}");
                }
            }
            DaemonEvent::Error { id: None, message } => {
                warn!("daemon error: {message}");
            }
            DaemonEvent::ListResult { terminals } => {
                lock().resolve_lists(&terminals);
            }
            DaemonEvent::ShutdownAck => {
                lock().resolve_shutdowns();
            }
            DaemonEvent::Data { id, data } => {
                let _ = notices.send(DaemonNotice::Data { id, data });
            }
            DaemonEvent::Exit { id, code } => {
                let _ = notices.send(DaemonNotice::Exit { id, code });
            }
        }
    }

    lock().close();
    closed.cancel();
    error!("daemon control connection lost; restart the server to reconnect");
    let _ = notices.send(DaemonNotice::Disconnected);
}

/// Finds the running daemon through its discovery file, starting one if
/// needed.
#[derive(Debug, Clone)]
pub struct DaemonLauncher {
    pub discovery_file: PathBuf,
    pub daemon_bin: PathBuf,
    pub log_file: Option<PathBuf>,
    pub wait: Duration,
}

impl DaemonLauncher {
    pub fn new(discovery_file: PathBuf, daemon_bin: PathBuf) -> Self {
        Self {
            discovery_file,
            daemon_bin,
            log_file: None,
            wait: DISCOVERY_WAIT,
        }
    }

    /// Connect to the daemon named by the discovery file, if it answers.
    pub async fn connect_existing(&self) -> Option<TcpStream> {
        let info = match paths::read_discovery(&self.discovery_file) {
            Ok(Some(info)) => info,
            Ok(None) => return None,
            Err(err) => {
                debug!(path = %self.discovery_file.display(), "unreadable discovery file: {err}");
                return None;
            }
        };
        match TcpStream::connect(("127.0.0.1", info.port)).await {
            Ok(stream) => {
                info!(pid = info.pid, port = info.port, "connected to daemon");
                Some(stream)
            }
            Err(err) => {
                debug!(pid = info.pid, port = info.port, "stale discovery file: {err}");
                None
            }
        }
    }

    pub async fn connect_or_spawn(&self) -> Result<TcpStream, ServerError> {
        if let Some(stream) = self.connect_existing().await {
            return Ok(stream);
        }

        self.spawn_daemon()?;
        let deadline = tokio::time::Instant::now() + self.wait;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(DISCOVERY_POLL).await;
            if let Some(stream) = self.connect_existing().await {
                return Ok(stream);
            }
        }
        Err(ServerError::DaemonUnavailable(format!(
            "daemon did not publish {} within {:?}",
            self.discovery_file.display(),
            self.wait
        )))
    }

    fn spawn_daemon(&self) -> Result<(), ServerError> {
        let mut cmd = Command::new(&self.daemon_bin);
        cmd.arg("--discovery")
            .arg(&self.discovery_file)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(log_file) = &self.log_file {
            cmd.arg("--log-file").arg(log_file);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|e| {
            ServerError::DaemonUnavailable(format!(
                "failed to spawn {}: {e}",
                self.daemon_bin.display()
            ))
        })?;
        info!(pid = child.id(), bin = %self.daemon_bin.display(), "spawned daemon");

        // Reap the daemon if it exits while this server is still running.
        let reaper = std::thread::Builder::new()
            .name("daemon-reaper".to_string())
            .spawn(move || {
                let _ = child.wait();
            });
        if let Err(err) = reaper {
            debug!("could not start daemon reaper thread: {err}");
        }
        Ok(())
    }
}
