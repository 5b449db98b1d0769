pub mod paths;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Identity shared by a daemon session and the server-side terminal record.
pub type SessionId = String;

/// Default per-session output buffer capacity, in chars.
pub const DEFAULT_BUFFER_LIMIT: usize = 50_000;

/// Upper bound for a single JSON line on the control connection.
pub const MAX_JSON_LINE_BYTES: usize = 4 * 1024 * 1024;

/// How long the server waits for `created`/`error` after sending `create`.
pub const CREATE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the server waits for `list_result` before assuming no sessions.
pub const LIST_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the server polls for the discovery file after spawning a daemon.
pub const DISCOVERY_WAIT: Duration = Duration::from_secs(8);

/// Server-to-daemon messages, one JSON object per line.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonRequest {
    Create(CreateParams),
    Input {
        id: SessionId,
        data: String,
    },
    Resize {
        id: SessionId,
        cols: u16,
        rows: u16,
    },
    Kill {
        id: SessionId,
    },
    Attach {
        id: SessionId,
        #[serde(rename = "bufferOffset", default)]
        buffer_offset: usize,
    },
    List,
    Shutdown,
}

/// Parameters of a `create` request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateParams {
    pub id: SessionId,
    pub shell: String,
    #[serde(default)]
    pub shell_args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Complete child environment. Empty means "inherit the daemon's".
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
}

/// Daemon-to-server messages.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonEvent {
    Created {
        id: SessionId,
    },
    Data {
        id: SessionId,
        data: String,
    },
    Exit {
        id: SessionId,
        code: Option<i32>,
    },
    ListResult {
        terminals: Vec<LiveSession>,
    },
    ShutdownAck,
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<SessionId>,
        message: String,
    },
}

impl DaemonEvent {
    pub fn error(id: Option<SessionId>, message: impl Into<String>) -> Self {
        Self::Error {
            id,
            message: message.into(),
        }
    }
}

/// One entry of `list_result`: a live session and how much output it holds.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LiveSession {
    pub id: SessionId,
    pub buffer_length: usize,
}

/// Contents of the discovery file the daemon writes after binding.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryInfo {
    pub pid: u32,
    pub port: u16,
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}
