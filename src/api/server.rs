use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::api::instructions;
use crate::instructions::InstructionStore;

/// Maximum accepted request body. Instructions are plain text; 256 KiB is
/// generous headroom over any realistic system prompt.
const MAX_BODY_BYTES: usize = 256 * 1024;

/// Per-request timeout across the whole API.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared state: the DB path plus the page limit applied when a history
/// request does not specify one. Each request opens its own connection.
#[derive(Clone)]
pub struct ApiState {
    pub db_path: Arc<PathBuf>,
    pub default_page_limit: usize,
}

pub(crate) type ApiResponse = (StatusCode, Json<serde_json::Value>);

pub(crate) fn ok_json(value: serde_json::Value) -> ApiResponse {
    (StatusCode::OK, Json(value))
}

pub(crate) fn err_json(status: StatusCode, message: &str) -> ApiResponse {
    (status, Json(serde_json::json!({ "error": message })))
}

pub(crate) fn open_store(db_path: &Path) -> Result<InstructionStore, (StatusCode, String)> {
    InstructionStore::open(db_path).map_err(|e| {
        tracing::error!("Failed to open instruction store: {e}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to open instruction store".to_string(),
        )
    })
}

async fn handle_health() -> ApiResponse {
    ok_json(serde_json::json!({ "status": "ok" }))
}

/// JSON 404 for unknown API paths. Keeps API errors as JSON, never HTML.
async fn handle_api_fallback() -> ApiResponse {
    err_json(StatusCode::NOT_FOUND, "Unknown API endpoint")
}

/// Build the axum router with all instruction API routes.
pub fn build_router(state: ApiState) -> Router {
    let api_router = Router::new()
        .route("/health", get(handle_health))
        .route(
            "/agents/:agent_id/instructions",
            get(instructions::handle_get_active).put(instructions::handle_create),
        )
        .route(
            "/agents/:agent_id/instructions/latest",
            get(instructions::handle_latest),
        )
        .route(
            "/agents/:agent_id/instructions/history",
            get(instructions::handle_history),
        )
        .route(
            "/agents/:agent_id/instructions/activate",
            post(instructions::handle_activate),
        )
        .route(
            "/agents/:agent_id/instructions/at/:created_at",
            get(instructions::handle_get_by_created_at),
        )
        .fallback(handle_api_fallback);

    Router::new()
        .nest("/api", api_router)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(state)
}
