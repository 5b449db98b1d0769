use termdeck_protocol::SessionId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("failed to spawn pty: {0}")]
    Spawn(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
