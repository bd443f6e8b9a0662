//! HTTP handlers for the operator API.

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlgate_core::{Environment, PromotionState};
use std::sync::Arc;
use tracing::{error, info};

use crate::execution::{ExecutionError, ExecutionOutcome};
use crate::reconcile::SyncReport;
use crate::repository::{ApprovedScript, ExecutionLogEntry, RepositoryError};
use crate::AppState;

/// Audit entries returned when the caller gives no limit.
const DEFAULT_LOG_LIMIT: usize = 50;

const MAX_LOG_LIMIT: usize = 500;

/// A registry row with its derived promotion state.
#[derive(Debug, Serialize)]
pub struct ScriptView {
    #[serde(flatten)]
    pub script: ApprovedScript,
    pub promotion_state: PromotionState,
}

impl From<ApprovedScript> for ScriptView {
    fn from(script: ApprovedScript) -> Self {
        let promotion_state = script.promotion_state();
        Self {
            script,
            promotion_state,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ScriptsApiResponse {
    pub version: String,
    pub scripts: Vec<ScriptView>,
}

#[derive(Debug, Serialize)]
pub struct LogsApiResponse {
    pub logs: Vec<ExecutionLogEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub environment: Environment,
    pub operator: String,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<usize>,
}

impl LogsQuery {
    fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT)
    }
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn storage_error(context: &str, e: RepositoryError) -> Response {
    error!("{}: {}", context, e);
    json_error(StatusCode::INTERNAL_SERVER_ERROR, context)
}

/// Validate the authorization header against the API token.
///
/// Returns `Ok(())` if authorized, or an error response if not.
#[allow(clippy::result_large_err)]
fn validate_auth(headers: &HeaderMap, api_token: &Option<String>) -> Result<(), Response> {
    let Some(expected_token) = api_token else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "Operator API is disabled (API_TOKEN not configured)",
        )
            .into_response());
    };

    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match auth_header.map(|value| value.strip_prefix("Bearer ")) {
        Some(Some(provided_token)) if provided_token == expected_token.as_str() => Ok(()),
        Some(Some(_)) => Err((StatusCode::UNAUTHORIZED, "Invalid token").into_response()),
        Some(None) => Err((
            StatusCode::UNAUTHORIZED,
            "Invalid Authorization header format. Expected: Bearer <token>",
        )
            .into_response()),
        None => Err((
            StatusCode::UNAUTHORIZED,
            "Missing Authorization header. Expected: Bearer <token>",
        )
            .into_response()),
    }
}

fn execution_error_response(e: &ExecutionError) -> Response {
    let status = match e {
        ExecutionError::ScriptNotFound(_) => StatusCode::NOT_FOUND,
        ExecutionError::PromotionRefused { .. } => StatusCode::CONFLICT,
        ExecutionError::EnvironmentUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        ExecutionError::Repository(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    json_error(status, e.to_string())
}

/// Handler: POST /api/sync
///
/// Walks recent merged pull requests and registers anything missing.
pub async fn sync_api(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<SyncReport>, Response> {
    validate_auth(&headers, &state.api_token)?;

    info!("Manual sync requested");
    let report = state
        .reconciler
        .full_sync(state.sync_pr_limit)
        .await
        .map_err(|e| {
            error!("Manual sync failed: {:#}", e);
            json_error(StatusCode::BAD_GATEWAY, format!("{:#}", e))
        })?;

    Ok(Json(report))
}

/// Handler: GET /api/scripts
pub async fn list_scripts_api(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ScriptsApiResponse>, Response> {
    validate_auth(&headers, &state.api_token)?;

    let scripts = state
        .engine
        .repository()
        .list_scripts()
        .await
        .map_err(|e| storage_error("Failed to list scripts", e))?;

    Ok(Json(ScriptsApiResponse {
        version: crate::get_version(),
        scripts: scripts.into_iter().map(ScriptView::from).collect(),
    }))
}

/// Handler: GET /api/scripts/:name
pub async fn get_script_api(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<ScriptView>, Response> {
    validate_auth(&headers, &state.api_token)?;

    let script = state
        .engine
        .repository()
        .get_script(&name)
        .await
        .map_err(|e| storage_error("Failed to load script", e))?
        .ok_or_else(|| {
            json_error(
                StatusCode::NOT_FOUND,
                format!("script '{}' is not in the registry", name),
            )
        })?;

    Ok(Json(script.into()))
}

/// Handler: POST /api/scripts/:name/execute
///
/// A refused attempt answers 409 and leaves no audit entry. An attempt that
/// reached the database answers 200 whatever the SQL outcome; check `status`.
pub async fn execute_script_api(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<ExecutionOutcome>, Response> {
    validate_auth(&headers, &state.api_token)?;

    let operator = request.operator.trim();
    if operator.is_empty() {
        return Err(json_error(StatusCode::BAD_REQUEST, "operator must not be empty"));
    }

    info!(
        "Execution of '{}' on {} requested by {}",
        name, request.environment, operator
    );

    state
        .engine
        .execute(&name, request.environment, operator)
        .await
        .map(Json)
        .map_err(|e| execution_error_response(&e))
}

/// Handler: GET /api/scripts/:name/logs
pub async fn script_logs_api(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogsApiResponse>, Response> {
    validate_auth(&headers, &state.api_token)?;

    let repository = state.engine.repository();
    let known = repository
        .get_script(&name)
        .await
        .map_err(|e| storage_error("Failed to load script", e))?
        .is_some();
    if !known {
        return Err(json_error(
            StatusCode::NOT_FOUND,
            format!("script '{}' is not in the registry", name),
        ));
    }

    let logs = repository
        .list_execution_logs(Some(&name), query.effective_limit())
        .await
        .map_err(|e| storage_error("Failed to query execution logs", e))?;

    Ok(Json(LogsApiResponse { logs }))
}

/// Handler: GET /api/logs
pub async fn logs_api(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogsApiResponse>, Response> {
    validate_auth(&headers, &state.api_token)?;

    let logs = state
        .engine
        .repository()
        .list_execution_logs(None, query.effective_limit())
        .await
        .map_err(|e| storage_error("Failed to query execution logs", e))?;

    Ok(Json(LogsApiResponse { logs }))
}
