//! Periodic and final writes of terminal transcripts to the store.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::ServerError;
use crate::registry::TerminalRegistry;

/// Save every terminal's buffer in one transaction. Returns rows updated.
pub fn flush_buffers(registry: &TerminalRegistry) -> Result<usize, ServerError> {
    let snapshot = registry.snapshot();
    if snapshot.is_empty() {
        return Ok(0);
    }
    registry.store().save_buffers(&snapshot)
}

/// Flush on a background thread so the runtime never waits on SQLite.
pub async fn flush_buffers_blocking(registry: Arc<TerminalRegistry>) -> Result<usize, ServerError> {
    tokio::task::spawn_blocking(move || flush_buffers(&registry))
        .await
        .unwrap_or_else(|join_err| Err(ServerError::Task(join_err.to_string())))
}

/// Flush every `interval` until `cancel` fires. The first flush happens one
/// full interval after start; a failed flush is logged and retried next tick.
pub fn spawn_snapshot_loop(
    registry: Arc<TerminalRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match flush_buffers_blocking(Arc::clone(&registry)).await {
                Ok(updated) => debug!(updated, "terminal buffers saved"),
                Err(err) => error!("periodic buffer save failed: {err}"),
            }
        }
        info!("snapshot loop stopped");
    })
}
