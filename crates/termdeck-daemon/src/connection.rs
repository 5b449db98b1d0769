use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Result;
use futures_util::{FutureExt, SinkExt, StreamExt};
use libtermdeck::{CreateOutcome, SessionManager, enqueue_event};
use termdeck_protocol::{DaemonEvent, DaemonRequest, MAX_JSON_LINE_BYTES};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, error, info, warn};

/// What the read loop should do after a request.
enum Flow {
    Continue,
    Shutdown,
}

/// Serve one control connection until it closes, is replaced by a newer
/// connection, or asks the daemon to shut down.
pub async fn handle_connection(
    stream: TcpStream,
    manager: Arc<SessionManager>,
    outbound_queue: usize,
    shutdown_tx: watch::Sender<bool>,
) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!("set_nodelay failed: {err}");
    }
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(
        read_half,
        LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES),
    );
    let mut writer = FramedWrite::new(
        write_half,
        LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES),
    );

    let (out_tx, mut out_rx) = mpsc::channel::<DaemonEvent>(outbound_queue);
    let (conn_id, cancel) = manager.connect_link(out_tx.clone()).await;

    let writer_cancel = cancel.clone();
    let writer_task = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = writer_cancel.cancelled() => break,
                event = out_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let line = match serde_json::to_string(&event) {
                Ok(line) => line,
                Err(err) => {
                    error!("failed to encode event: {err}");
                    continue;
                }
            };
            if let Err(err) = writer.send(line).await {
                warn!(conn_id, "socket write failed: {err}");
                writer_cancel.cancel();
                break;
            }
        }
    });

    let mut shutdown_requested = false;
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => {
                info!(conn_id, "connection superseded or dropped");
                break;
            }
            next = reader.next() => match next {
                Some(Ok(line)) => line,
                Some(Err(err)) => {
                    warn!(conn_id, "socket read failed: {err}");
                    break;
                }
                None => break,
            },
        };

        let req: DaemonRequest = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(err) => {
                debug!(conn_id, "ignoring malformed line: {err}");
                continue;
            }
        };

        let outcome = AssertUnwindSafe(handle_request(req, &manager, &out_tx))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(Flow::Continue)) => {}
            Ok(Ok(Flow::Shutdown)) => {
                shutdown_requested = true;
                break;
            }
            Ok(Err(err)) => {
                warn!(conn_id, "dropping connection: {err}");
                break;
            }
            Err(panic) => {
                error!(conn_id, "request handler panicked: {}", panic_message(&panic));
            }
        }
    }

    manager.disconnect_link(conn_id).await;
    drop(out_tx);
    if writer_task.await.is_err() {
        warn!(conn_id, "writer task failed");
    }
    if shutdown_requested {
        shutdown_tx.send_replace(true);
    }
}

async fn handle_request(
    req: DaemonRequest,
    manager: &Arc<SessionManager>,
    out_tx: &mpsc::Sender<DaemonEvent>,
) -> Result<Flow> {
    match req {
        DaemonRequest::Create(params) => {
            let id = params.id.clone();
            let reply = match manager.create(params).await {
                Ok(CreateOutcome::Spawned { .. } | CreateOutcome::AlreadyRunning) => {
                    DaemonEvent::Created { id }
                }
                Err(err) => {
                    warn!(session_id = %id, "create failed: {err}");
                    DaemonEvent::error(Some(id), err.to_string())
                }
            };
            enqueue_event(out_tx, reply)?;
        }
        DaemonRequest::Input { id, data } => {
            manager.input(&id, &data).await;
        }
        DaemonRequest::Resize { id, cols, rows } => {
            manager.resize(&id, cols, rows).await;
        }
        DaemonRequest::Kill { id } => {
            manager.kill(&id).await;
        }
        DaemonRequest::Attach { id, buffer_offset } => {
            if let Err(err) = manager.attach(&id, buffer_offset).await {
                enqueue_event(out_tx, DaemonEvent::error(Some(id), err.to_string()))?;
            }
        }
        DaemonRequest::List => {
            let terminals = manager.list().await;
            enqueue_event(out_tx, DaemonEvent::ListResult { terminals })?;
        }
        DaemonRequest::Shutdown => {
            info!("shutdown requested by control connection");
            enqueue_event(out_tx, DaemonEvent::ShutdownAck)?;
            return Ok(Flow::Shutdown);
        }
    }
    Ok(Flow::Continue)
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
