use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::AppState;
use crate::admission::{ConnectionStats, WS_TOKEN_TTL};
use crate::error::ServerError;
use crate::registry::{CLOSE_GOING_AWAY, CreateTerminal, TerminalInfo};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub deck_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LimitBody {
    pub limit: usize,
}

/// Rejects `/api/*` calls without the credential header.
pub async fn require_credential(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    if state.auth.check_header(req.headers()) {
        return next.run(req).await;
    }
    warn!(path = %req.uri().path(), "api request rejected: bad credentials");
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "unauthorized" })),
    )
        .into_response()
}

/// GET /api/terminals
pub async fn list_terminals(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Json<Vec<TerminalInfo>> {
    Json(state.registry.list(query.deck_id.as_deref()))
}

/// POST /api/terminals
pub async fn create_terminal(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateTerminal>,
) -> Result<(StatusCode, Json<TerminalInfo>), ServerError> {
    if body.deck_id.trim().is_empty() {
        return Err(ServerError::BadRequest("deckId is required".into()));
    }
    let info = state.registry.create(body).await?;
    Ok((StatusCode::CREATED, Json(info)))
}

/// DELETE /api/terminals/{id}
pub async fn delete_terminal(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ServerError> {
    state.registry.delete(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/ws-token
pub async fn issue_ws_token(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "token": state.auth.issue_token(),
        "expiresInSecs": WS_TOKEN_TTL.as_secs(),
    }))
}

/// GET /api/admin/connections
pub async fn connection_stats(State(state): State<Arc<AppState>>) -> Json<ConnectionStats> {
    Json(state.limiter.stats())
}

/// PUT /api/admin/connections/limit
pub async fn set_connection_limit(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LimitBody>,
) -> Result<Json<ConnectionStats>, ServerError> {
    if body.limit == 0 {
        return Err(ServerError::BadRequest("limit must be at least 1".into()));
    }
    state.limiter.set_limit(body.limit);
    info!(limit = body.limit, "per-IP connection limit changed");
    Ok(Json(state.limiter.stats()))
}

/// POST /api/admin/terminals/close-all
pub async fn close_all_sockets(State(state): State<Arc<AppState>>) -> Json<Value> {
    let closed = state
        .registry
        .close_all_sockets(CLOSE_GOING_AWAY, "closed by administrator");
    warn!(closed, "all terminal sockets closed by administrator");
    Json(json!({ "closed": closed }))
}

/// POST /api/admin/shutdown
pub async fn request_shutdown(State(state): State<Arc<AppState>>) -> StatusCode {
    info!("shutdown requested over the admin api");
    state.shutdown.cancel();
    StatusCode::ACCEPTED
}
