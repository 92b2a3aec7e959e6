//! HTTP Boundary
//!
//! axum server exposing the SSE price stream and health endpoints.
//!
//! # Endpoints
//!
//! - `GET /v1/stream?symbols=AAPL,MSFT` - SSE stream of price updates
//!   (`data:` frames) interleaved with `event: ping` keepalives. The
//!   session ends when the client disconnects.
//! - `GET /health` - full JSON status.
//! - `GET /healthz` - liveness.
//! - `GET /readyz` - readiness (the service can serve via polling even
//!   while the live link is down, so readiness tracks process health).

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use futures_util::stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::application::services::{OutboundFrame, RelayService, SymbolSeed};
use crate::infrastructure::broadcast::TradeBus;
use crate::infrastructure::finnhub::stream::LinkStatus;

// =============================================================================
// State
// =============================================================================

/// Shared state for all handlers.
pub struct AppState {
    /// Session manager.
    pub service: Arc<RelayService>,
    /// Upstream link state.
    pub link_status: Arc<LinkStatus>,
    /// Trade bus (for receiver stats).
    pub bus: Arc<TradeBus>,
    /// Whether the process runs without a stream token.
    pub polling_only: bool,
    /// Process start time.
    pub started_at: Instant,
}

// =============================================================================
// Health payloads
// =============================================================================

/// Overall service health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Live link up (or intentionally polling-only).
    Healthy,
    /// Live link down; prices served from REST polling.
    Degraded,
}

#[derive(Debug, Serialize)]
struct LinkHealth {
    state: &'static str,
    connected: bool,
    last_connected_at: Option<String>,
    reconnect_attempts: u32,
    messages_received: u64,
}

#[derive(Debug, Serialize)]
struct SessionHealth {
    active: i32,
    bus_receivers: usize,
}

#[derive(Debug, Serialize)]
struct SubscriptionHealth {
    symbols: usize,
    sessions: usize,
}

/// Body of `GET /health`.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: HealthStatus,
    version: &'static str,
    polling_only: bool,
    uptime_secs: u64,
    link: LinkHealth,
    sessions: SessionHealth,
    subscriptions: SubscriptionHealth,
}

// =============================================================================
// Server
// =============================================================================

/// The HTTP server task.
pub struct RelayServer {
    port: u16,
    state: Arc<AppState>,
    cancel: CancellationToken,
}

impl RelayServer {
    /// Creates the server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<AppState>, cancel: CancellationToken) -> Self {
        Self { port, state, cancel }
    }

    /// Binds and serves until cancellation.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if binding or serving fails.
    pub async fn run(self) -> std::io::Result<()> {
        let app = router(Arc::clone(&self.state));
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(%addr, "HTTP server listening");

        let cancel = self.cancel.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
    }
}

/// Builds the router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/stream", get(stream_handler))
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .with_state(state)
}

// =============================================================================
// Handlers
// =============================================================================

#[derive(Debug, Deserialize)]
struct StreamQuery {
    symbols: Option<String>,
}

async fn stream_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
) -> Response {
    let seeds: Vec<SymbolSeed> = query
        .symbols
        .unwrap_or_default()
        .split(',')
        .filter(|raw| !raw.trim().is_empty())
        .map(SymbolSeed::bare)
        .collect();

    let session = state
        .service
        .open_session(seeds, CancellationToken::new());
    let handle = match session {
        Ok(handle) => handle,
        Err(error) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": error.to_string() })),
            )
                .into_response();
        }
    };

    // The handle lives inside the stream; when the client disconnects
    // axum drops the stream, the handle's Drop cancels the session, and
    // the relay task releases its subscriptions.
    let frames = stream::unfold(handle, |mut handle| async move {
        let frame = handle.recv().await?;
        let event = match frame {
            // PriceUpdate serialization cannot fail; fall back to an
            // empty event rather than tearing the stream down.
            OutboundFrame::Trade(update) => Event::default().json_data(&update).unwrap_or_default(),
            OutboundFrame::Keepalive => Event::default().event("ping").data("{}"),
        };
        Some((Ok::<_, Infallible>(event), handle))
    });

    Sse::new(frames).into_response()
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let status = if state.link_status.is_connected() || state.polling_only {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    };
    let stats = state.service.registry_stats();

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        polling_only: state.polling_only,
        uptime_secs: state.started_at.elapsed().as_secs(),
        link: LinkHealth {
            state: state.link_status.state().as_str(),
            connected: state.link_status.is_connected(),
            last_connected_at: state
                .link_status
                .last_connected_at()
                .map(|t| t.to_rfc3339()),
            reconnect_attempts: state.link_status.reconnect_attempts(),
            messages_received: state.link_status.messages_received(),
        },
        sessions: SessionHealth {
            active: state.service.session_count(),
            bus_receivers: state.bus.receiver_count(),
        },
        subscriptions: SubscriptionHealth {
            symbols: stats.symbol_count,
            sessions: stats.session_count,
        },
    })
}

async fn liveness_handler() -> &'static str {
    "OK"
}

async fn readiness_handler() -> &'static str {
    // Sessions can be served from REST polling even with the live link
    // down, so the process is ready as soon as it is up.
    "READY"
}
