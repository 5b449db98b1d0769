use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::mpsc as std_mpsc;

use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use termdeck_protocol::{CreateParams, DEFAULT_BUFFER_LIMIT, DaemonEvent, LiveSession, SessionId};

use crate::error::DaemonError;
use crate::link::ControlLink;
use crate::output::{OutputBuffer, Utf8Decoder};

const READ_CHUNK_BYTES: usize = 8192;

#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    pub buffer_limit: usize,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            buffer_limit: DEFAULT_BUFFER_LIMIT,
        }
    }
}

/// Result of a `create` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Spawned { pid: Option<u32> },
    /// A live session already had this id; nothing was spawned.
    AlreadyRunning,
}

/// A live PTY process and the tail of its output.
struct Session {
    generation: u64,
    master: Box<dyn MasterPty + Send>,
    input_tx: std_mpsc::Sender<Vec<u8>>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    pid: Option<u32>,
    buffer: OutputBuffer,
}

#[derive(Default)]
struct ManagerState {
    sessions: HashMap<SessionId, Session>,
    link: ControlLink,
    next_generation: u64,
    next_conn_id: u64,
}

/// Owns every PTY process of the daemon and the control link they report to.
///
/// Buffer appends, attach replays and subscription changes all happen under
/// one lock, which is what keeps replay-then-stream free of gaps and
/// duplicates.
pub struct SessionManager {
    state: Mutex<ManagerState>,
    config: SessionManagerConfig,
}

impl SessionManager {
    pub fn new(config: SessionManagerConfig) -> Self {
        Self {
            state: Mutex::new(ManagerState::default()),
            config,
        }
    }

    /// Make `tx` the active control connection, cancelling the previous one.
    /// Returns the new connection id and its cancellation token.
    pub async fn connect_link(
        &self,
        tx: mpsc::Sender<DaemonEvent>,
    ) -> (u64, CancellationToken) {
        let mut state = self.state.lock().await;
        state.next_conn_id = state.next_conn_id.wrapping_add(1);
        let conn_id = state.next_conn_id;
        let cancel = CancellationToken::new();
        if state.link.connect(conn_id, tx, cancel.clone()).is_some() {
            info!(conn_id, "control connection replaced; subscriptions cleared");
        } else {
            info!(conn_id, "control connection established");
        }
        (conn_id, cancel)
    }

    pub async fn disconnect_link(&self, conn_id: u64) {
        let mut state = self.state.lock().await;
        if state.link.disconnect(conn_id) {
            info!(conn_id, "control connection closed");
        }
    }

    /// Spawn a PTY for `params.id`, or re-acknowledge if it is already live.
    ///
    /// The PTY is opened and the child spawned on the blocking pool with the
    /// lock released; the id is checked again before the session is stored.
    pub async fn create(
        self: &Arc<Self>,
        params: CreateParams,
    ) -> Result<CreateOutcome, DaemonError> {
        if self.state.lock().await.sessions.contains_key(&params.id) {
            debug!(session_id = %params.id, "create for live session; re-acknowledging");
            return Ok(CreateOutcome::AlreadyRunning);
        }

        let spawn_params = params.clone();
        let spawned = tokio::task::spawn_blocking(move || spawn_pty(&spawn_params))
            .await
            .map_err(|e| DaemonError::Spawn(format!("spawn task failed: {e}")))??;
        let SpawnedPty {
            master,
            child,
            mut killer,
            reader,
            writer,
            pid,
        } = spawned;

        let mut state = self.state.lock().await;
        if state.sessions.contains_key(&params.id) {
            drop(state);
            debug!(session_id = %params.id, "lost a concurrent create; discarding extra process");
            force_kill(&params.id, pid, killer.as_mut());
            reap_detached(child);
            return Ok(CreateOutcome::AlreadyRunning);
        }

        state.next_generation = state.next_generation.wrapping_add(1);
        let generation = state.next_generation;
        let id = params.id.clone();

        let input_tx = spawn_input_writer(&id, writer)?;
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        spawn_output_reader(&id, reader, chunk_tx)?;

        state.sessions.insert(
            id.clone(),
            Session {
                generation,
                master,
                input_tx,
                killer,
                pid,
                buffer: OutputBuffer::new(self.config.buffer_limit),
            },
        );
        drop(state);

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            pump_output(manager, id, generation, chunk_rx, child).await;
        });

        info!(session_id = %params.id, pid = ?pid, shell = %params.shell, "session created");
        Ok(CreateOutcome::Spawned { pid })
    }

    /// Queue keystrokes for a session. Unknown ids are ignored.
    pub async fn input(&self, id: &str, data: &str) {
        let state = self.state.lock().await;
        let Some(session) = state.sessions.get(id) else {
            debug!(session_id = %id, "input for unknown session ignored");
            return;
        };
        if session.input_tx.send(data.as_bytes().to_vec()).is_err() {
            debug!(session_id = %id, "input dropped; pty writer gone");
        }
    }

    /// Resize a session's PTY. Unknown ids and failures are ignored.
    pub async fn resize(&self, id: &str, cols: u16, rows: u16) {
        let state = self.state.lock().await;
        let Some(session) = state.sessions.get(id) else {
            debug!(session_id = %id, "resize for unknown session ignored");
            return;
        };
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        if let Err(err) = session.master.resize(size) {
            debug!(session_id = %id, "resize failed: {err}");
        }
    }

    /// Terminate and forget a session. Returns false for unknown ids.
    pub async fn kill(&self, id: &str) -> bool {
        let removed = {
            let mut state = self.state.lock().await;
            state.link.unsubscribe(id);
            state.sessions.remove(id)
        };
        let Some(mut session) = removed else {
            return false;
        };
        force_kill(id, session.pid, session.killer.as_mut());
        info!(session_id = %id, "session killed");
        true
    }

    /// Subscribe the active connection to `id` and replay everything after
    /// `buffer_offset` exactly once. Later output streams as `data` events.
    pub async fn attach(&self, id: &str, buffer_offset: usize) -> Result<(), DaemonError> {
        let mut state = self.state.lock().await;
        let replay = state
            .sessions
            .get(id)
            .map(|session| session.buffer.since(buffer_offset))
            .ok_or_else(|| DaemonError::SessionNotFound(id.to_string()))?;

        if !replay.is_empty() {
            state.link.send(DaemonEvent::Data {
                id: id.to_string(),
                data: replay,
            });
        }
        state.link.subscribe(id);
        debug!(session_id = %id, buffer_offset, "attached");
        Ok(())
    }

    pub async fn list(&self) -> Vec<LiveSession> {
        let state = self.state.lock().await;
        let mut live: Vec<LiveSession> = state
            .sessions
            .iter()
            .map(|(id, session)| LiveSession {
                id: id.clone(),
                buffer_length: session.buffer.len(),
            })
            .collect();
        live.sort_by(|a, b| a.id.cmp(&b.id));
        live
    }

    pub async fn session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    /// Kill every live session (daemon shutdown).
    pub async fn kill_all(&self) -> usize {
        let drained: Vec<(SessionId, Session)> = {
            let mut state = self.state.lock().await;
            state.sessions.drain().collect()
        };
        let count = drained.len();
        for (id, mut session) in drained {
            force_kill(&id, session.pid, session.killer.as_mut());
        }
        count
    }

    /// Append decoded output to the session's buffer and forward it if the
    /// active connection is attached. Output from a superseded process
    /// (same id, older generation) is discarded.
    pub async fn record_output(&self, id: &str, generation: u64, data: &str) {
        if data.is_empty() {
            return;
        }
        let mut state = self.state.lock().await;
        let ManagerState {
            sessions, link, ..
        } = &mut *state;
        match sessions.get_mut(id) {
            Some(session) if session.generation == generation => {
                session.buffer.push_str(data);
                link.forward_output(id, data);
            }
            _ => {}
        }
    }

    /// Forget a session whose process exited and report it to the active
    /// connection. No-op if it was already killed or replaced.
    pub async fn record_exit(&self, id: &str, generation: u64, code: Option<i32>) -> bool {
        let mut state = self.state.lock().await;
        let current = state
            .sessions
            .get(id)
            .is_some_and(|session| session.generation == generation);
        if !current {
            return false;
        }
        state.sessions.remove(id);
        state.link.unsubscribe(id);
        state.link.send(DaemonEvent::Exit {
            id: id.to_string(),
            code,
        });
        info!(session_id = %id, exit_code = ?code, "session exited");
        true
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(SessionManagerConfig::default())
    }
}

/// Everything `openpty` and `spawn_command` hand back for one child.
struct SpawnedPty {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    pid: Option<u32>,
}

/// Blocking: allocates the PTY pair and forks the child.
fn spawn_pty(params: &CreateParams) -> Result<SpawnedPty, DaemonError> {
    let pair = native_pty_system()
        .openpty(PtySize {
            rows: params.rows,
            cols: params.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| DaemonError::Spawn(e.to_string()))?;

    let mut cmd = CommandBuilder::new(&params.shell);
    cmd.args(&params.shell_args);
    if let Some(cwd) = &params.cwd {
        cmd.cwd(cwd);
    }
    if !params.env.is_empty() {
        cmd.env_clear();
        for (key, value) in &params.env {
            cmd.env(key, value);
        }
    }

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| DaemonError::Spawn(e.to_string()))?;
    drop(pair.slave);

    let pid = child.process_id();
    let killer = child.clone_killer();
    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| DaemonError::Spawn(e.to_string()))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| DaemonError::Spawn(e.to_string()))?;

    Ok(SpawnedPty {
        master: pair.master,
        child,
        killer,
        reader,
        writer,
        pid,
    })
}

/// SIGKILL the child and everything in its process group. The PTY child
/// leads its own session, so its pid doubles as the group id. Falls back to
/// the portable-pty killer when there is no pid to signal.
fn force_kill(id: &str, pid: Option<u32>, killer: &mut (dyn ChildKiller + Send + Sync)) {
    #[cfg(unix)]
    {
        if let Some(pid) = pid.and_then(|p| libc::pid_t::try_from(p).ok()) {
            // SAFETY: kill(2) only takes integers and touches no memory.
            let group = unsafe { libc::kill(-pid, libc::SIGKILL) };
            let direct = unsafe { libc::kill(pid, libc::SIGKILL) };
            if group == 0 || direct == 0 {
                return;
            }
            debug!(session_id = %id, pid, "SIGKILL failed (process may already be gone)");
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
    if let Err(err) = killer.kill() {
        debug!(session_id = %id, "kill failed (process may already be gone): {err}");
    }
}

/// Wait for a child nobody tracks so it does not linger as a zombie.
fn reap_detached(mut child: Box<dyn Child + Send + Sync>) {
    tokio::task::spawn_blocking(move || {
        let _ = child.wait();
    });
}

/// Blocking PTY writes happen on their own thread so a child that stops
/// reading its input can never stall the daemon.
fn spawn_input_writer(
    id: &str,
    mut writer: Box<dyn Write + Send>,
) -> Result<std_mpsc::Sender<Vec<u8>>, DaemonError> {
    let (tx, rx) = std_mpsc::channel::<Vec<u8>>();
    let session_id = id.to_string();
    std::thread::Builder::new()
        .name(format!("pty-writer-{id}"))
        .spawn(move || {
            while let Ok(bytes) = rx.recv() {
                if let Err(err) = writer.write_all(&bytes).and_then(|_| writer.flush()) {
                    debug!(session_id = %session_id, "pty write failed: {err}");
                    break;
                }
            }
        })?;
    Ok(tx)
}

fn spawn_output_reader(
    id: &str,
    mut reader: Box<dyn Read + Send>,
    chunk_tx: mpsc::UnboundedSender<Vec<u8>>,
) -> Result<(), DaemonError> {
    let session_id = id.to_string();
    std::thread::Builder::new()
        .name(format!("pty-reader-{id}"))
        .spawn(move || {
            let mut buf = [0u8; READ_CHUNK_BYTES];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if chunk_tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        // EIO is how Linux reports the slave side closing.
                        debug!(session_id = %session_id, "pty read ended: {err}");
                        break;
                    }
                }
            }
        })?;
    Ok(())
}

async fn pump_output(
    manager: Arc<SessionManager>,
    id: SessionId,
    generation: u64,
    mut chunks: mpsc::UnboundedReceiver<Vec<u8>>,
    mut child: Box<dyn Child + Send + Sync>,
) {
    let mut decoder = Utf8Decoder::new();
    while let Some(bytes) = chunks.recv().await {
        let text = decoder.decode(&bytes);
        manager.record_output(&id, generation, &text).await;
    }
    let tail = decoder.finish();
    manager.record_output(&id, generation, &tail).await;

    let code = match tokio::task::spawn_blocking(move || child.wait()).await {
        Ok(Ok(status)) => i32::try_from(status.exit_code()).ok(),
        Ok(Err(err)) => {
            warn!(session_id = %id, "failed to reap child: {err}");
            None
        }
        Err(err) => {
            warn!(session_id = %id, "reaper task failed: {err}");
            None
        }
    };
    manager.record_exit(&id, generation, code).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn sh(id: &str, script: &str) -> CreateParams {
        CreateParams {
            id: id.to_string(),
            shell: "/bin/sh".to_string(),
            shell_args: vec!["-c".to_string(), script.to_string()],
            cwd: None,
            env: BTreeMap::new(),
            cols: 80,
            rows: 24,
        }
    }

    async fn wait_for_len(manager: &SessionManager, id: &str, len: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let live = manager.list().await;
            if live.iter().any(|s| s.id == id && s.buffer_length >= len) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {len} chars from {id}: {live:?}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn attach_replays_once_then_streams() {
        let manager = Arc::new(SessionManager::default());
        let (tx, mut rx) = mpsc::channel(64);
        manager.connect_link(tx).await;

        manager
            .create(sh("t1", "printf hello; read line; printf \"$line\"; sleep 5"))
            .await
            .expect("create");
        wait_for_len(&manager, "t1", 5).await;

        manager.attach("t1", 0).await.expect("attach");
        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("replay in time")
            .expect("replay");
        assert_eq!(
            first,
            DaemonEvent::Data {
                id: "t1".to_string(),
                data: "hello".to_string()
            }
        );

        manager.input("t1", "world\n").await;
        let mut streamed = String::new();
        while !streamed.contains("world") {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Some(DaemonEvent::Data { data, .. })) => streamed.push_str(&data),
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(!streamed.contains("hello"), "replayed output again: {streamed:?}");

        assert!(manager.kill("t1").await);
    }

    #[tokio::test]
    async fn create_is_idempotent_per_id() {
        let manager = Arc::new(SessionManager::default());
        let first = manager
            .create(sh("x", "echo a; sleep 5"))
            .await
            .expect("first create");
        assert!(matches!(first, CreateOutcome::Spawned { .. }));

        let second = manager
            .create(sh("x", "echo b; sleep 5"))
            .await
            .expect("second create");
        assert_eq!(second, CreateOutcome::AlreadyRunning);
        assert_eq!(manager.session_count().await, 1);

        wait_for_len(&manager, "x", 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let state = manager.state.lock().await;
        let output = state.sessions.get("x").expect("session").buffer.contents();
        assert!(output.contains('a'));
        assert!(!output.contains('b'));
        drop(state);

        manager.kill_all().await;
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error() {
        let manager = Arc::new(SessionManager::default());
        let mut params = sh("bad", "true");
        params.shell = "/definitely/not/a/shell".to_string();
        let err = manager.create(params).await.expect_err("spawn should fail");
        assert!(matches!(err, DaemonError::Spawn(_)));
        assert_eq!(manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn exit_is_reported_and_session_removed() {
        let manager = Arc::new(SessionManager::default());
        let (tx, mut rx) = mpsc::channel(64);
        manager.connect_link(tx).await;

        manager.create(sh("e", "exit 3")).await.expect("create");
        let event = loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Some(event @ DaemonEvent::Exit { .. })) => break event,
                Ok(Some(_)) => continue,
                other => panic!("no exit event: {other:?}"),
            }
        };
        assert_eq!(
            event,
            DaemonEvent::Exit {
                id: "e".to_string(),
                code: Some(3)
            }
        );
        assert_eq!(manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn stale_generation_cannot_touch_new_session() {
        let manager = Arc::new(SessionManager::default());
        manager.create(sh("g", "sleep 5")).await.expect("create");
        let generation = manager.state.lock().await.sessions["g"].generation;

        assert!(!manager.record_exit("g", generation + 1, Some(0)).await);
        manager.record_output("g", generation + 1, "ghost").await;
        assert_eq!(manager.list().await[0].buffer_length, 0);

        manager.kill_all().await;
    }

    /// True while `pid` exists and is not a zombie.
    #[cfg(target_os = "linux")]
    fn process_alive(pid: u32) -> bool {
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
            return false;
        };
        let state = stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.trim_start().chars().next());
        state != Some('Z')
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn kill_terminates_a_child_that_ignores_hangup() {
        let manager = Arc::new(SessionManager::default());
        let outcome = manager
            .create(sh("k", "trap '' HUP; printf ready; exec sleep 30"))
            .await
            .expect("create");
        let CreateOutcome::Spawned { pid: Some(pid) } = outcome else {
            panic!("no pid: {outcome:?}");
        };
        wait_for_len(&manager, "k", 5).await;

        assert!(manager.kill("k").await);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while process_alive(pid) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "process {pid} survived kill"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(manager.session_count().await, 0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn kill_all_terminates_children_that_ignore_hangup() {
        let manager = Arc::new(SessionManager::default());
        let mut pids = Vec::new();
        for id in ["a", "b"] {
            let outcome = manager
                .create(sh(id, "trap '' HUP; printf ready; exec sleep 30"))
                .await
                .expect("create");
            let CreateOutcome::Spawned { pid: Some(pid) } = outcome else {
                panic!("no pid: {outcome:?}");
            };
            wait_for_len(&manager, id, 5).await;
            pids.push(pid);
        }

        assert_eq!(manager.kill_all().await, 2);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while pids.iter().any(|pid| process_alive(*pid)) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "children survived kill_all: {pids:?}"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn concurrent_creates_for_one_id_spawn_once() {
        let manager = Arc::new(SessionManager::default());
        let (first, second) = tokio::join!(
            manager.create(sh("dup", "sleep 5")),
            manager.create(sh("dup", "sleep 5"))
        );
        let outcomes = [first.expect("first"), second.expect("second")];
        let spawned = outcomes
            .iter()
            .filter(|o| matches!(o, CreateOutcome::Spawned { .. }))
            .count();
        assert_eq!(spawned, 1, "{outcomes:?}");
        assert_eq!(manager.session_count().await, 1);

        manager.kill_all().await;
    }

    #[tokio::test]
    async fn attach_unknown_session_fails() {
        let manager = SessionManager::default();
        let err = manager.attach("nope", 0).await.expect_err("unknown");
        assert!(matches!(err, DaemonError::SessionNotFound(_)));
    }
}
