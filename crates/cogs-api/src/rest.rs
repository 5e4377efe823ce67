//! HTTP handlers

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::{any, get},
    Extension, Router,
};
use cogs_broker::{ClaimBroker, StateStore, Wait};
use cogs_core::{ClaimStatus, CogsError, CogsResult, NodeStatus, Peer};
use cogs_identity::Identify;
use serde::Deserialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Application state shared across handlers
pub struct AppState {
    pub store: Arc<StateStore>,
    pub broker: Arc<ClaimBroker>,
    pub identity: Arc<dyn Identify>,
    /// Wait applied when a request carries no timeout
    pub default_wait: Wait,
}

/// Create the API router
///
/// Every request must carry the connection's `Peer` as an extension.
/// `CONNECT /api` is taken off the connection before it gets here.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(get_status).fallback(read_only))
        .route("/wait", get(wait_for_devices))
        .route("/api", any(connect_only))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// HTTP status for a failed operation
pub fn status_code(err: &CogsError) -> StatusCode {
    match err {
        CogsError::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
        CogsError::InvalidRequest(_) | CogsError::ResourceExhausted(_) => StatusCode::BAD_REQUEST,
        CogsError::PermissionDenied(_) => StatusCode::FORBIDDEN,
        CogsError::Infrastructure(_) => StatusCode::BAD_GATEWAY,
        e if e.is_not_found() => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: CogsError) -> (StatusCode, String) {
    (status_code(&err), err.to_string())
}

/// Identity a request is accounted to
///
/// Falls back to a peer-derived identity when no owner is known; fails
/// only when resolution itself broke.
pub async fn resolve_requester(identity: &dyn Identify, peer: &Peer) -> CogsResult<String> {
    match identity.identify_peer(peer).await {
        Ok(owner) => Ok(owner),
        Err(e) if e.is_not_found() => {
            let fallback = peer.fallback_identity();
            debug!(peer = %peer, reason = %e, identity = %fallback, "Using fallback identity");
            Ok(fallback)
        }
        Err(e) => {
            warn!(peer = %peer, error = %e, "Failed to resolve requester");
            Err(e)
        }
    }
}

/// Get the node status
async fn get_status(State(state): State<Arc<AppState>>) -> Json<NodeStatus> {
    Json(state.store.snapshot().await)
}

async fn read_only() -> (StatusCode, &'static str) {
    (StatusCode::METHOD_NOT_ALLOWED, "read only")
}

/// Query of a wait request
#[derive(Debug, Deserialize)]
pub struct WaitQuery {
    /// Number of devices wanted
    pub gpu: u32,
    /// Seconds to wait
    #[serde(default)]
    pub timeout: Option<f64>,
}

/// Wait for free devices and claim them
async fn wait_for_devices(
    State(state): State<Arc<AppState>>,
    Extension(peer): Extension<Peer>,
    Query(query): Query<WaitQuery>,
) -> Result<Json<ClaimStatus>, (StatusCode, String)> {
    let owner = resolve_requester(state.identity.as_ref(), &peer)
        .await
        .map_err(error_response)?;
    let wait = query
        .timeout
        .map(Wait::from_secs)
        .unwrap_or(state.default_wait);

    info!(
        peer = %peer,
        owner = %owner,
        count = query.gpu,
        wait = ?wait,
        "Waiting for devices"
    );

    let devices = state
        .broker
        .claim(query.gpu, wait, &owner)
        .await
        .map_err(error_response)?;

    Ok(Json(ClaimStatus { devices }))
}

async fn connect_only() -> (StatusCode, &'static str) {
    (StatusCode::METHOD_NOT_ALLOWED, "method must be connect")
}
