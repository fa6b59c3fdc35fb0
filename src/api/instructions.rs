use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use crate::api::server::{err_json, ok_json, open_store, ApiResponse, ApiState};
use crate::instructions::{ListOptions, NewInstruction, SortOrder, StoreError};

/// Actor recorded on writes when the caller does not name one.
/// Auth is out of scope; the operator identity is a placeholder.
const DEFAULT_UPDATED_BY: &str = "system";

// ── Request bodies / queries ─────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstructionBody {
    pub instruction: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub change_note: Option<String>,
    #[serde(default)]
    pub updated_by: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivateInstructionBody {
    pub version: String,
    #[serde(default)]
    pub updated_by: Option<String>,
}

#[derive(Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistorySort {
    CreatedAt,
    Version,
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub sort: Option<HistorySort>,
    #[serde(default)]
    pub order: Option<SortOrder>,
    #[serde(default)]
    pub limit: Option<usize>,
}

// ── Handlers ─────────────────────────────────────────────────────

/// GET /agents/:agent_id/instructions — the active instruction.
pub async fn handle_get_active(
    State(state): State<ApiState>,
    AxumPath(agent_id): AxumPath<String>,
) -> ApiResponse {
    let db_path = state.db_path.clone();
    let result =
        tokio::task::spawn_blocking(move || -> Result<serde_json::Value, (StatusCode, String)> {
            let store = open_store(&db_path)?;
            match store
                .get_active_instruction(&agent_id)
                .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
            {
                Some(rec) => Ok(serde_json::json!({ "instruction": rec })),
                None => Err((
                    StatusCode::NOT_FOUND,
                    format!("No active instruction for agent '{agent_id}'"),
                )),
            }
        })
        .await;

    match result {
        Ok(Ok(value)) => ok_json(value),
        Ok(Err((status, msg))) => err_json(status, &msg),
        Err(e) => err_json(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("Task join error: {e}"),
        ),
    }
}

/// PUT /agents/:agent_id/instructions — append a new revision.
pub async fn handle_create(
    State(state): State<ApiState>,
    AxumPath(agent_id): AxumPath<String>,
    Json(body): Json<CreateInstructionBody>,
) -> ApiResponse {
    if agent_id.trim().is_empty() {
        return err_json(StatusCode::BAD_REQUEST, "Agent id is required");
    }
    if body.instruction.trim().is_empty() {
        return err_json(StatusCode::BAD_REQUEST, "Instruction text is required");
    }

    let db_path = state.db_path.clone();
    let result =
        tokio::task::spawn_blocking(move || -> Result<serde_json::Value, (StatusCode, String)> {
            let store = open_store(&db_path)?;
            let rec = store
                .create_instruction(&NewInstruction {
                    agent_id,
                    instruction: body.instruction,
                    updated_by: body
                        .updated_by
                        .unwrap_or_else(|| DEFAULT_UPDATED_BY.to_string()),
                    version: body.version,
                    change_note: body.change_note,
                })
                .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
            Ok(serde_json::json!({ "instruction": rec }))
        })
        .await;

    match result {
        Ok(Ok(value)) => (StatusCode::CREATED, Json(value)),
        Ok(Err((status, msg))) => err_json(status, &msg),
        Err(e) => err_json(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("Task join error: {e}"),
        ),
    }
}

/// GET /agents/:agent_id/instructions/latest — highest version.
pub async fn handle_latest(
    State(state): State<ApiState>,
    AxumPath(agent_id): AxumPath<String>,
) -> ApiResponse {
    let db_path = state.db_path.clone();
    let result =
        tokio::task::spawn_blocking(move || -> Result<serde_json::Value, (StatusCode, String)> {
            let store = open_store(&db_path)?;
            match store
                .get_latest_version(&agent_id)
                .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
            {
                Some(rec) => Ok(serde_json::json!({ "instruction": rec })),
                None => Err((
                    StatusCode::NOT_FOUND,
                    format!("No instructions for agent '{agent_id}'"),
                )),
            }
        })
        .await;

    match result {
        Ok(Ok(value)) => ok_json(value),
        Ok(Err((status, msg))) => err_json(status, &msg),
        Err(e) => err_json(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("Task join error: {e}"),
        ),
    }
}

/// GET /agents/:agent_id/instructions/history — ordered revision list.
pub async fn handle_history(
    State(state): State<ApiState>,
    AxumPath(agent_id): AxumPath<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResponse {
    let db_path = state.db_path.clone();
    let opts = ListOptions {
        order: query.order.unwrap_or_default(),
        limit: Some(query.limit.unwrap_or(state.default_page_limit)),
    };
    let result =
        tokio::task::spawn_blocking(move || -> Result<serde_json::Value, (StatusCode, String)> {
            let store = open_store(&db_path)?;
            let records = match query.sort.unwrap_or(HistorySort::CreatedAt) {
                HistorySort::CreatedAt => store.list_by_created_at(&agent_id, opts),
                HistorySort::Version => store.list_by_version(&agent_id, opts),
            }
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
            let count = records.len();
            Ok(serde_json::json!({
                "instructions": records,
                "count": count,
            }))
        })
        .await;

    match result {
        Ok(Ok(value)) => ok_json(value),
        Ok(Err((status, msg))) => err_json(status, &msg),
        Err(e) => err_json(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("Task join error: {e}"),
        ),
    }
}

/// POST /agents/:agent_id/instructions/activate — switch the active version.
pub async fn handle_activate(
    State(state): State<ApiState>,
    AxumPath(agent_id): AxumPath<String>,
    Json(body): Json<ActivateInstructionBody>,
) -> ApiResponse {
    if body.version.trim().is_empty() {
        return err_json(StatusCode::BAD_REQUEST, "Version is required");
    }

    let db_path = state.db_path.clone();
    let result =
        tokio::task::spawn_blocking(move || -> Result<serde_json::Value, (StatusCode, String)> {
            let store = open_store(&db_path)?;
            let updated_by = body.updated_by.as_deref().unwrap_or(DEFAULT_UPDATED_BY);
            let rec = store
                .activate_instruction(&agent_id, &body.version, updated_by)
                .map_err(|e| match e {
                    StoreError::VersionNotFound { .. } => {
                        (StatusCode::NOT_FOUND, e.to_string())
                    }
                    other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
                })?;
            Ok(serde_json::json!({ "instruction": rec }))
        })
        .await;

    match result {
        Ok(Ok(value)) => ok_json(value),
        Ok(Err((status, msg))) => err_json(status, &msg),
        Err(e) => err_json(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("Task join error: {e}"),
        ),
    }
}

/// GET /agents/:agent_id/instructions/at/:created_at — point lookup.
pub async fn handle_get_by_created_at(
    State(state): State<ApiState>,
    AxumPath((agent_id, created_at)): AxumPath<(String, String)>,
) -> ApiResponse {
    let db_path = state.db_path.clone();
    let result =
        tokio::task::spawn_blocking(move || -> Result<serde_json::Value, (StatusCode, String)> {
            let store = open_store(&db_path)?;
            match store
                .get_instruction(&agent_id, &created_at)
                .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
            {
                Some(rec) => Ok(serde_json::json!({ "instruction": rec })),
                None => Err((
                    StatusCode::NOT_FOUND,
                    format!("No instruction for agent '{agent_id}' at '{created_at}'"),
                )),
            }
        })
        .await;

    match result {
        Ok(Ok(value)) => ok_json(value),
        Ok(Err((status, msg))) => err_json(status, &msg),
        Err(e) => err_json(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("Task join error: {e}"),
        ),
    }
}
