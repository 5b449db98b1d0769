use std::collections::HashSet;

use termdeck_protocol::{DaemonEvent, SessionId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Error returned when an outbound queue cannot take another event.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("outbound queue full")]
    Full,
    #[error("outbound queue closed")]
    Closed,
}

/// Queue an event for a connection's writer task without waiting.
///
/// A full queue is an error rather than a silent drop: the caller tears the
/// connection down so the peer re-attaches instead of seeing a gap.
pub fn enqueue_event(
    tx: &mpsc::Sender<DaemonEvent>,
    event: DaemonEvent,
) -> Result<(), EnqueueError> {
    tx.try_send(event).map_err(|err| match err {
        mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
        mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
    })
}

/// The daemon's single control connection.
///
/// Entering `Connected` always starts from an empty subscription set, so a
/// replacement connection never inherits what its predecessor attached to.
#[derive(Debug, Default)]
pub enum ControlLink {
    #[default]
    Disconnected,
    Connected {
        conn_id: u64,
        tx: mpsc::Sender<DaemonEvent>,
        cancel: CancellationToken,
        subscriptions: HashSet<SessionId>,
    },
}

impl ControlLink {
    /// Install a new connection. Returns the token of the connection it
    /// replaced, already cancelled.
    pub fn connect(
        &mut self,
        conn_id: u64,
        tx: mpsc::Sender<DaemonEvent>,
        cancel: CancellationToken,
    ) -> Option<CancellationToken> {
        let previous = std::mem::replace(
            self,
            ControlLink::Connected {
                conn_id,
                tx,
                cancel,
                subscriptions: HashSet::new(),
            },
        );
        match previous {
            ControlLink::Connected { cancel, .. } => {
                cancel.cancel();
                Some(cancel)
            }
            ControlLink::Disconnected => None,
        }
    }

    /// Drop the link if `conn_id` is still the active connection. A stale
    /// connection finishing after being replaced leaves the new one alone.
    pub fn disconnect(&mut self, conn_id: u64) -> bool {
        if self.conn_id() == Some(conn_id) {
            *self = ControlLink::Disconnected;
            true
        } else {
            false
        }
    }

    pub fn conn_id(&self) -> Option<u64> {
        match self {
            ControlLink::Connected { conn_id, .. } => Some(*conn_id),
            ControlLink::Disconnected => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ControlLink::Connected { .. })
    }

    pub fn subscribe(&mut self, id: &str) -> bool {
        match self {
            ControlLink::Connected { subscriptions, .. } => {
                subscriptions.insert(id.to_string());
                true
            }
            ControlLink::Disconnected => false,
        }
    }

    pub fn unsubscribe(&mut self, id: &str) {
        if let ControlLink::Connected { subscriptions, .. } = self {
            subscriptions.remove(id);
        }
    }

    pub fn is_subscribed(&self, id: &str) -> bool {
        match self {
            ControlLink::Connected { subscriptions, .. } => subscriptions.contains(id),
            ControlLink::Disconnected => false,
        }
    }

    /// Send to whichever connection is active, regardless of subscriptions.
    /// Returns false when nothing was delivered.
    pub fn send(&mut self, event: DaemonEvent) -> bool {
        let ControlLink::Connected {
            conn_id, tx, cancel, ..
        } = self
        else {
            return false;
        };

        match enqueue_event(tx, event) {
            Ok(()) => true,
            Err(err) => {
                warn!(conn_id = *conn_id, "dropping control connection: {err}");
                cancel.cancel();
                *self = ControlLink::Disconnected;
                false
            }
        }
    }

    /// Forward live output, but only for attached sessions.
    pub fn forward_output(&mut self, id: &str, data: &str) -> bool {
        if !self.is_subscribed(id) {
            return false;
        }
        self.send(DaemonEvent::Data {
            id: id.to_string(),
            data: data.to_string(),
        })
    }
}
