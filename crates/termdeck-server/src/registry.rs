use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use libtermdeck::OutputBuffer;
use serde::Serialize;
use termdeck_protocol::{CreateParams, SessionId};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::daemon::{DaemonClient, DaemonNotice};
use crate::decks::DeckLookup;
use crate::error::ServerError;
use crate::shell::{Platform, resolve_shell, terminal_env};
use crate::store::{TerminalRow, TerminalStore, unix_millis};

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

/// Frames queued per socket before it counts as lagging.
pub const SUBSCRIBER_QUEUE: usize = 1024;

const DEFAULT_TITLE_PREFIX: &str = "Terminal ";

/// What a socket task should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketFrame {
    Output(String),
    Close { code: u16, reason: String },
}

/// Server-side view of one terminal: its metadata, a mirror of the daemon's
/// output buffer and the sockets watching it.
pub struct TerminalRecord {
    pub id: SessionId,
    pub deck_id: String,
    pub title: String,
    pub command: Option<String>,
    pub created_at: i64,
    state: Mutex<RecordState>,
}

struct RecordState {
    buffer: OutputBuffer,
    subscribers: HashMap<u64, mpsc::Sender<SocketFrame>>,
    last_active: i64,
    /// Set once the terminal is deleted or has exited.
    retired: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalInfo {
    pub id: SessionId,
    pub deck_id: String,
    pub title: String,
    pub command: Option<String>,
    pub created_at: i64,
    pub last_active: i64,
    pub buffer_length: usize,
    pub subscribers: usize,
}

impl TerminalRecord {
    fn new(row: &TerminalRow, buffer: OutputBuffer) -> Self {
        Self {
            id: row.id.clone(),
            deck_id: row.deck_id.clone(),
            title: row.title.clone(),
            command: row.command.clone(),
            created_at: row.created_at,
            state: Mutex::new(RecordState {
                buffer,
                subscribers: HashMap::new(),
                last_active: unix_millis(),
                retired: false,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, RecordState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a socket and return what it missed since `buffer_offset`.
    /// Done under the buffer lock, so nothing is delivered twice or skipped
    /// between the replay and the first live frame.
    ///
    /// `None` once the terminal has been retired: the socket must be treated
    /// like one for an unknown id.
    pub fn subscribe(
        &self,
        sub_id: u64,
        buffer_offset: usize,
        tx: mpsc::Sender<SocketFrame>,
    ) -> Option<String> {
        let mut state = self.state();
        if state.retired {
            return None;
        }
        let replay = state.buffer.since(buffer_offset);
        state.subscribers.insert(sub_id, tx);
        Some(replay)
    }

    pub fn unsubscribe(&self, sub_id: u64) -> bool {
        self.state().subscribers.remove(&sub_id).is_some()
    }

    /// Append output and fan it out. A socket whose queue is full is cut
    /// loose; its task closes it and the browser reconnects with its offset.
    pub fn push_output(&self, data: &str) {
        let mut state = self.state();
        state.buffer.push_str(data);
        state.last_active = unix_millis();
        let id = &self.id;
        state.subscribers.retain(|sub_id, tx| {
            match tx.try_send(SocketFrame::Output(data.to_string())) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(terminal_id = %id, sub_id, "socket lagging; disconnecting");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    pub fn touch(&self) {
        self.state().last_active = unix_millis();
    }

    /// Send a final frame to every socket and forget them. Returns how many
    /// sockets were attached. The terminal itself stays open to new sockets.
    pub fn close_subscribers(&self, notice: Option<&str>, code: u16, reason: &str) -> usize {
        let subscribers: Vec<_> = self.state().subscribers.drain().collect();
        Self::send_final(subscribers, notice, code, reason)
    }

    /// Close every socket and refuse all later subscriptions. Both happen
    /// under one lock, so no socket can slip in between.
    pub fn retire(&self, notice: Option<&str>, code: u16, reason: &str) -> usize {
        let subscribers: Vec<_> = {
            let mut state = self.state();
            state.retired = true;
            state.subscribers.drain().collect()
        };
        Self::send_final(subscribers, notice, code, reason)
    }

    fn send_final(
        subscribers: Vec<(u64, mpsc::Sender<SocketFrame>)>,
        notice: Option<&str>,
        code: u16,
        reason: &str,
    ) -> usize {
        let count = subscribers.len();
        for (_, tx) in subscribers {
            if let Some(text) = notice {
                let _ = tx.try_send(SocketFrame::Output(text.to_string()));
            }
            let _ = tx.try_send(SocketFrame::Close {
                code,
                reason: reason.to_string(),
            });
        }
        count
    }

    pub fn buffer_contents(&self) -> String {
        self.state().buffer.contents()
    }

    pub fn info(&self) -> TerminalInfo {
        let state = self.state();
        TerminalInfo {
            id: self.id.clone(),
            deck_id: self.deck_id.clone(),
            title: self.title.clone(),
            command: self.command.clone(),
            created_at: self.created_at,
            last_active: state.last_active,
            buffer_length: state.buffer.len(),
            subscribers: state.subscribers.len(),
        }
    }
}

/// Body of `POST /api/terminals`.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTerminal {
    pub deck_id: String,
    pub title: Option<String>,
    pub command: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub reattached: usize,
    pub respawned: usize,
    pub orphaned: usize,
    pub failed: usize,
}

/// The single owner of id → [`TerminalRecord`] on the server.
pub struct TerminalRegistry {
    records: RwLock<HashMap<SessionId, Arc<TerminalRecord>>>,
    title_index: Mutex<HashMap<String, u64>>,
    next_subscriber: AtomicU64,
    daemon: DaemonClient,
    store: Arc<TerminalStore>,
    decks: Arc<dyn DeckLookup>,
    buffer_limit: usize,
}

impl TerminalRegistry {
    pub fn new(
        daemon: DaemonClient,
        store: Arc<TerminalStore>,
        decks: Arc<dyn DeckLookup>,
        buffer_limit: usize,
    ) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            title_index: Mutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(1),
            daemon,
            store,
            decks,
            buffer_limit,
        }
    }

    pub fn daemon(&self) -> &DaemonClient {
        &self.daemon
    }

    pub fn store(&self) -> &Arc<TerminalStore> {
        &self.store
    }

    pub fn get(&self, id: &str) -> Option<Arc<TerminalRecord>> {
        self.read_records().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.read_records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_records(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<SessionId, Arc<TerminalRecord>>> {
        self.records.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_records(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<SessionId, Arc<TerminalRecord>>> {
        self.records.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn titles(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.title_index.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn next_subscriber_id(&self) -> u64 {
        self.next_subscriber.fetch_add(1, Ordering::Relaxed)
    }

    /// Records sorted by creation time, optionally for one deck.
    pub fn list(&self, deck_id: Option<&str>) -> Vec<TerminalInfo> {
        let mut infos: Vec<TerminalInfo> = self
            .read_records()
            .values()
            .filter(|r| deck_id.is_none_or(|d| r.deck_id == d))
            .map(|r| r.info())
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        infos
    }

    fn next_title(&self, deck_id: &str) -> String {
        let mut titles = self.titles();
        let index = titles.entry(deck_id.to_string()).or_insert(0);
        *index += 1;
        format!("{DEFAULT_TITLE_PREFIX}{index}")
    }

    fn note_title(&self, deck_id: &str, title: &str) {
        let Some(n) = title
            .strip_prefix(DEFAULT_TITLE_PREFIX)
            .and_then(|rest| rest.parse::<u64>().ok())
        else {
            return;
        };
        let mut titles = self.titles();
        let index = titles.entry(deck_id.to_string()).or_insert(0);
        *index = (*index).max(n);
    }

    fn launch_params(
        &self,
        id: &str,
        root: PathBuf,
        command: Option<&str>,
        cols: u16,
        rows: u16,
    ) -> CreateParams {
        let login_shell = std::env::var("SHELL").ok();
        let shell = resolve_shell(Platform::current(), login_shell.as_deref(), command);
        CreateParams {
            id: id.to_string(),
            shell: shell.program,
            shell_args: shell.args,
            cwd: Some(root),
            env: terminal_env(std::env::vars()),
            cols,
            rows,
        }
    }

    /// Create a terminal: persist its row, register it, spawn it on the
    /// daemon and start mirroring its output.
    pub async fn create(&self, req: CreateTerminal) -> Result<TerminalInfo, ServerError> {
        let root = self
            .decks
            .deck_root(&req.deck_id)
            .ok_or_else(|| ServerError::DeckNotFound(req.deck_id.clone()))?;

        let id = uuid::Uuid::new_v4().to_string();
        let title = match req.title.as_deref().map(str::trim) {
            Some(title) if !title.is_empty() => title.to_string(),
            _ => self.next_title(&req.deck_id),
        };
        let command = req
            .command
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);
        let row = TerminalRow {
            id: id.clone(),
            deck_id: req.deck_id.clone(),
            title,
            command,
            buffer: String::new(),
            created_at: unix_millis(),
        };

        // Identity is durable before the process can produce anything.
        self.store.insert(&row)?;
        let record = Arc::new(TerminalRecord::new(&row, OutputBuffer::new(self.buffer_limit)));
        self.write_records().insert(id.clone(), Arc::clone(&record));

        let params = self.launch_params(
            &id,
            root,
            row.command.as_deref(),
            req.cols.unwrap_or(80).clamp(1, 500),
            req.rows.unwrap_or(24).clamp(1, 500),
        );
        if let Err(err) = self.daemon.create(params).await {
            self.write_records().remove(&id);
            if let Err(store_err) = self.store.delete(&id) {
                error!(terminal_id = %id, "failed to roll back row: {store_err}");
            }
            warn!(terminal_id = %id, deck_id = %row.deck_id, "terminal creation failed: {err}");
            return Err(err);
        }

        // A delete may have landed while the daemon was spawning. Its kill
        // reached the daemon before the process existed, so send another.
        let still_registered = self
            .get(&id)
            .is_some_and(|current| Arc::ptr_eq(&current, &record));
        if !still_registered {
            self.daemon.kill(&id);
            warn!(terminal_id = %id, "terminal deleted while it was being created");
            return Err(ServerError::SessionNotFound(id));
        }
        self.daemon.attach(&id, 0);

        info!(terminal_id = %id, deck_id = %row.deck_id, title = %row.title, "terminal created");
        Ok(record.info())
    }

    /// Delete a terminal. The record leaves the registry before the process
    /// is killed or any socket closed, so nothing can re-attach to it.
    pub fn delete(&self, id: &str) -> Result<(), ServerError> {
        let record = self
            .write_records()
            .remove(id)
            .ok_or_else(|| ServerError::SessionNotFound(id.to_string()))?;
        self.daemon.kill(id);
        let deleted = self.store.delete(id);
        let closed = record.retire(None, CLOSE_NORMAL, "terminal deleted");
        deleted?;
        info!(terminal_id = %id, sockets = closed, "terminal deleted");
        Ok(())
    }

    pub fn input(&self, record: &TerminalRecord, data: &str) {
        record.touch();
        self.daemon.input(&record.id, data);
    }

    pub fn resize(&self, record: &TerminalRecord, cols: u16, rows: u16) {
        self.daemon.resize(&record.id, cols, rows);
    }

    pub fn handle_notice(&self, notice: DaemonNotice) {
        match notice {
            DaemonNotice::Data { id, data } => match self.get(&id) {
                Some(record) => record.push_output(&data),
                None => debug!(terminal_id = %id, "output for unknown terminal dropped"),
            },
            DaemonNotice::Exit { id, code } => self.handle_exit(&id, code),
            DaemonNotice::Disconnected => {
                error!(
                    terminals = self.len(),
                    "daemon disconnected; terminals stay readable but take no input until restart"
                );
            }
        }
    }

    fn handle_exit(&self, id: &str, code: Option<i32>) {
        let Some(record) = self.write_records().remove(id) else {
            debug!(terminal_id = %id, "exit for unknown terminal");
            return;
        };
        if let Err(err) = self.store.delete(id) {
            error!(terminal_id = %id, "failed to delete row of exited terminal: {err}");
        }
        let code_text = code.map_or_else(|| "unknown".to_string(), |c| c.to_string());
        let notice = format!("\r\n[process exited with code {code_text}]\r\n");
        let closed = record.retire(Some(&notice), CLOSE_NORMAL, "process exited");
        info!(terminal_id = %id, exit_code = ?code, sockets = closed, "terminal exited");
    }

    /// Close every socket of every terminal. Terminals keep running.
    pub fn close_all_sockets(&self, code: u16, reason: &str) -> usize {
        let records: Vec<Arc<TerminalRecord>> = self.read_records().values().cloned().collect();
        records
            .iter()
            .map(|r| r.close_subscribers(None, code, reason))
            .sum()
    }

    /// `(id, buffer)` for every registered terminal.
    pub fn snapshot(&self) -> Vec<(SessionId, String)> {
        self.read_records()
            .values()
            .map(|r| (r.id.clone(), r.buffer_contents()))
            .collect()
    }

    /// Reconcile persisted rows with the daemon's live sessions (startup).
    ///
    /// Rows of vanished decks are deleted. Live sessions are re-attached
    /// from offset 0. Rows with no live session are respawned under the same
    /// id with their saved transcript as scrollback; a failed respawn keeps
    /// the row for the next boot.
    pub async fn restore(&self) -> Result<RestoreReport, ServerError> {
        let live: HashSet<SessionId> = self
            .daemon
            .list()
            .await
            .into_iter()
            .map(|s| s.id)
            .collect();
        let rows = self.store.load_all()?;
        let mut report = RestoreReport::default();

        for row in rows {
            let Some(root) = self.decks.deck_root(&row.deck_id) else {
                self.store.delete(&row.id)?;
                info!(
                    terminal_id = %row.id,
                    deck_id = %row.deck_id,
                    "dropped terminal of missing deck"
                );
                report.orphaned += 1;
                continue;
            };
            self.note_title(&row.deck_id, &row.title);

            if live.contains(&row.id) {
                let record = TerminalRecord::new(&row, OutputBuffer::new(self.buffer_limit));
                self.write_records().insert(row.id.clone(), Arc::new(record));
                self.daemon.attach(&row.id, 0);
                report.reattached += 1;
                continue;
            }

            let seeded = OutputBuffer::with_contents(self.buffer_limit, &row.buffer);
            let record = Arc::new(TerminalRecord::new(&row, seeded));
            self.write_records().insert(row.id.clone(), Arc::clone(&record));
            let params = self.launch_params(&row.id, root, row.command.as_deref(), 80, 24);
            match self.daemon.create(params).await {
                Ok(()) => {
                    self.daemon.attach(&row.id, 0);
                    report.respawned += 1;
                }
                Err(err) => {
                    self.write_records().remove(&row.id);
                    warn!(
                        terminal_id = %row.id,
                        "respawn failed, keeping row for next start: {err}"
                    );
                    report.failed += 1;
                }
            }
        }

        info!(
            reattached = report.reattached,
            respawned = report.respawned,
            orphaned = report.orphaned,
            failed = report.failed,
            "terminal restore complete"
        );
        Ok(report)
    }
}

/// Feed daemon notices into the registry until the daemon goes away.
pub fn spawn_notice_pump(
    registry: Arc<TerminalRegistry>,
    mut notices: mpsc::UnboundedReceiver<DaemonNotice>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            let last = notice == DaemonNotice::Disconnected;
            registry.handle_notice(notice);
            if last {
                break;
            }
        }
    })
}
