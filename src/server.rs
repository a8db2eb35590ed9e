/// Lookup service - synchronous join-access checks over HTTP
///
/// Answers straight from the access list store: no caching, no retries,
/// and an id without an entry is simply denied. Pipeline health never
/// blocks a check.
use crate::{
    acl::AccessList,
    error::{WardenError, WardenResult},
};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared state for the lookup handlers
#[derive(Clone)]
pub struct LookupState {
    pub acl: AccessList,
}

/// Build the lookup router
pub fn build_router(state: LookupState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/check", get(check_access))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .fallback(not_found)
}

#[derive(Debug, Deserialize)]
pub struct CheckParams {
    pub account_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckResponse {
    pub account_id: String,
    pub allowed: bool,
}

/// Access check handler: allowed iff the account id currently has an
/// access list entry.
async fn check_access(
    State(state): State<LookupState>,
    Query(params): Query<CheckParams>,
) -> WardenResult<Json<CheckResponse>> {
    let account_id = params
        .account_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| WardenError::Validation("account_id query parameter is required".to_string()))?;

    let allowed = state.acl.find(&account_id).await?.is_some();

    Ok(Json(CheckResponse { account_id, allowed }))
}

/// Health check handler
async fn health_check(State(state): State<LookupState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": if state.acl.is_open() { "ok" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// 404 handler
async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "NotFound",
            "message": "Endpoint not found"
        })),
    )
}

/// Start the lookup service, shutting down gracefully when the
/// cancellation token fires.
///
/// Listens on localhost only. Exposing this beyond the local machine
/// needs its own transport security in front.
pub async fn serve(state: LookupState, port: u16, cancel: CancellationToken) -> WardenResult<()> {
    let addr = format!("127.0.0.1:{}", port);

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| WardenError::Internal(format!("Failed to bind to {}: {}", addr, e)))?;

    info!("lookup service listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| WardenError::Internal(format!("Server error: {}", e)))?;

    Ok(())
}
