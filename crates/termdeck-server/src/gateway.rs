//! Browser terminal sockets: `GET /ws/terminals/{id}`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::AppState;
use crate::admission::ConnectionSlot;
use crate::rate_limit::TokenBucket;
use crate::registry::{
    CLOSE_GOING_AWAY, CLOSE_POLICY_VIOLATION, CLOSE_PROTOCOL_ERROR, CLOSE_TRY_AGAIN_LATER,
    SUBSCRIBER_QUEUE, SocketFrame, TerminalRecord,
};

/// Largest inbound frame forwarded to the terminal.
pub const MAX_INPUT_FRAME_BYTES: usize = 64 * 1024;
/// Text frames starting with this carry `cols,rows`.
pub const RESIZE_PREFIX: &str = "\u{0}RESIZE:";
pub const MIN_DIMENSION: u16 = 1;
pub const MAX_DIMENSION: u16 = 500;

const RATE_LIMITED_NOTICE: &str = "\r\n[termdeck] input rate limited\r\n";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketQuery {
    #[serde(default)]
    pub buffer_offset: usize,
    pub token: Option<String>,
}

/// One inbound frame, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Input(String),
    Resize { cols: u16, rows: u16 },
    TooLarge(usize),
    Ignored,
}

pub fn classify_text(text: &str) -> Inbound {
    if text.len() > MAX_INPUT_FRAME_BYTES {
        return Inbound::TooLarge(text.len());
    }
    match text.strip_prefix(RESIZE_PREFIX) {
        Some(dims) => match parse_resize(dims) {
            Some((cols, rows)) => Inbound::Resize { cols, rows },
            None => {
                debug!(payload = %dims, "malformed resize ignored");
                Inbound::Ignored
            }
        },
        None if text.is_empty() => Inbound::Ignored,
        None => Inbound::Input(text.to_string()),
    }
}

pub fn classify_binary(bytes: &[u8]) -> Inbound {
    if bytes.len() > MAX_INPUT_FRAME_BYTES {
        return Inbound::TooLarge(bytes.len());
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => classify_text(text),
        Err(_) => Inbound::Input(String::from_utf8_lossy(bytes).into_owned()),
    }
}

/// `cols,rows`, each clamped to `[1, 500]`.
pub fn parse_resize(dims: &str) -> Option<(u16, u16)> {
    let (cols, rows) = dims.split_once(',')?;
    let clamp = |raw: &str| -> Option<u16> {
        let value: i64 = raw.trim().parse().ok()?;
        let clamped = value.clamp(i64::from(MIN_DIMENSION), i64::from(MAX_DIMENSION));
        u16::try_from(clamped).ok()
    };
    Some((clamp(cols)?, clamp(rows)?))
}

pub fn too_large_notice(len: usize) -> String {
    format!("\r\n[termdeck] input frame too large ({len} bytes, max {MAX_INPUT_FRAME_BYTES})\r\n")
}

/// Admission runs in a fixed order: per-IP cap, then auth, then the
/// terminal lookup. Rejections still upgrade so the browser gets a close
/// code it can act on.
pub async fn terminal_socket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(terminal_id): Path<String>,
    Query(query): Query<SocketQuery>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let ip = peer.ip();
    let Some(slot) = state.limiter.try_acquire(ip) else {
        warn!(
            %ip,
            terminal_id = %terminal_id,
            limit = state.limiter.limit(),
            "connection cap reached"
        );
        return reject(ws, CLOSE_TRY_AGAIN_LATER, "too many connections");
    };

    if !state.auth.authorize(&headers, query.token.as_deref()) {
        warn!(%ip, terminal_id = %terminal_id, "terminal socket rejected: bad credentials");
        return reject(ws, CLOSE_POLICY_VIOLATION, "unauthorized");
    }

    let Some(record) = state.registry.get(&terminal_id) else {
        debug!(%ip, terminal_id = %terminal_id, "socket for unknown terminal");
        return reject(ws, CLOSE_PROTOCOL_ERROR, "unknown terminal");
    };

    let offset = query.buffer_offset;
    ws.on_upgrade(move |socket| serve_socket(socket, state, record, offset, slot))
}

fn reject(ws: WebSocketUpgrade, code: u16, reason: &'static str) -> Response {
    ws.on_upgrade(move |mut socket| async move {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: Utf8Bytes::from_static(reason),
            })))
            .await;
    })
}

async fn serve_socket(
    mut socket: WebSocket,
    state: Arc<AppState>,
    record: Arc<TerminalRecord>,
    buffer_offset: usize,
    slot: ConnectionSlot,
) {
    let sub_id = state.registry.next_subscriber_id();
    let (frame_tx, mut frame_rx) = mpsc::channel(SUBSCRIBER_QUEUE);
    let ip = slot.ip();
    let Some(replay) = record.subscribe(sub_id, buffer_offset, frame_tx) else {
        // Deleted or exited between the lookup and the upgrade.
        debug!(%ip, terminal_id = %record.id, "socket for retired terminal");
        let _ = socket
            .send(close_message(CLOSE_PROTOCOL_ERROR, "unknown terminal"))
            .await;
        return;
    };
    info!(%ip, terminal_id = %record.id, sub_id, buffer_offset, "terminal socket attached");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut bucket = TokenBucket::for_input();
    let mut limited = false;

    let result: Result<(), axum::Error> = async {
        if !replay.is_empty() {
            ws_tx.send(Message::Text(replay.into())).await?;
        }

        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => {
                    ws_tx.send(close_message(CLOSE_GOING_AWAY, "server shutting down")).await?;
                    break;
                }
                frame = frame_rx.recv() => match frame {
                    Some(SocketFrame::Output(text)) => {
                        ws_tx.send(Message::Text(text.into())).await?;
                    }
                    Some(SocketFrame::Close { code, reason }) => {
                        ws_tx.send(close_message(code, &reason)).await?;
                        break;
                    }
                    None => {
                        // Dropped by the record for lagging behind.
                        ws_tx.send(close_message(CLOSE_TRY_AGAIN_LATER, "output backlog")).await?;
                        break;
                    }
                },
                msg = ws_rx.next() => {
                    let inbound = match msg {
                        Some(Ok(Message::Text(text))) => classify_text(text.as_str()),
                        Some(Ok(Message::Binary(bytes))) => classify_binary(&bytes),
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                        Some(Err(err)) => {
                            debug!(terminal_id = %record.id, "socket read failed: {err}");
                            break;
                        }
                    };

                    match inbound {
                        Inbound::TooLarge(len) => {
                            warn!(
                                %ip,
                                terminal_id = %record.id,
                                len,
                                "oversized input frame rejected"
                            );
                            ws_tx.send(Message::Text(too_large_notice(len).into())).await?;
                            continue;
                        }
                        Inbound::Ignored => continue,
                        Inbound::Input(_) | Inbound::Resize { .. } => {}
                    }

                    if !bucket.check() {
                        if !limited {
                            limited = true;
                            warn!(%ip, terminal_id = %record.id, "input rate limited");
                            ws_tx
                                .send(Message::Text(Utf8Bytes::from_static(RATE_LIMITED_NOTICE)))
                                .await?;
                        }
                        continue;
                    }
                    limited = false;

                    match inbound {
                        Inbound::Input(data) => state.registry.input(&record, &data),
                        Inbound::Resize { cols, rows } => {
                            state.registry.resize(&record, cols, rows)
                        }
                        Inbound::TooLarge(_) | Inbound::Ignored => {}
                    }
                }
            }
        }
        Ok(())
    }
    .await;

    if let Err(err) = result {
        debug!(terminal_id = %record.id, "socket write failed: {err}");
    }
    record.unsubscribe(sub_id);
    info!(%ip, terminal_id = %record.id, sub_id, "terminal socket detached");
    drop(slot);
}

fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }))
}
