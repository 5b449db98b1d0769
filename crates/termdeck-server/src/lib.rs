//! HTTP and WebSocket front end for terminals hosted by `termdeck-daemon`.

pub mod admission;
pub mod api;
pub mod config;
pub mod daemon;
pub mod decks;
pub mod error;
pub mod gateway;
pub mod persistence;
pub mod rate_limit;
pub mod registry;
pub mod shell;
pub mod store;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::{HeaderValue, Method, header};
use axum::middleware;
use axum::routing::{delete, get, post, put};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::admission::{Authenticator, ConnectionLimiter};
use crate::registry::TerminalRegistry;

/// Shared by every handler.
pub struct AppState {
    pub registry: Arc<TerminalRegistry>,
    pub limiter: Arc<ConnectionLimiter>,
    pub auth: Arc<Authenticator>,
    /// Cancelled once the server starts shutting down.
    pub shutdown: CancellationToken,
}

pub fn app(state: Arc<AppState>, cors: CorsLayer) -> Router {
    let api = Router::new()
        .route(
            "/api/terminals",
            get(api::list_terminals).post(api::create_terminal),
        )
        .route("/api/terminals/{id}", delete(api::delete_terminal))
        .route("/api/ws-token", post(api::issue_ws_token))
        .route("/api/admin/connections", get(api::connection_stats))
        .route(
            "/api/admin/connections/limit",
            put(api::set_connection_limit),
        )
        .route(
            "/api/admin/terminals/close-all",
            post(api::close_all_sockets),
        )
        .route("/api/admin/shutdown", post(api::request_shutdown))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            api::require_credential,
        ));

    Router::new()
        .merge(api)
        .route("/ws/terminals/{id}", get(gateway::terminal_socket))
        .layer(cors)
        .with_state(state)
}

/// No configured origins means same-origin only.
pub fn build_cors(origins: &[String]) -> Result<CorsLayer> {
    let methods = [
        Method::GET,
        Method::POST,
        Method::PUT,
        Method::DELETE,
        Method::OPTIONS,
    ];
    if origins.iter().any(|o| o == "*") {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods)
            .allow_headers(Any));
    }

    let mut allowed = Vec::with_capacity(origins.len());
    for origin in origins {
        allowed.push(
            HeaderValue::from_str(origin)
                .with_context(|| format!("invalid allowed origin: {origin}"))?,
        );
    }

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods(methods)
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]))
}
