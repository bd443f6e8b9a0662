//! Operator API: registry inspection, manual sync and script execution.
//!
//! Every route requires `Authorization: Bearer <API_TOKEN>`. When no token is
//! configured the whole API answers 503.

pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::AppState;

pub fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/sync", post(handlers::sync_api))
        .route("/api/scripts", get(handlers::list_scripts_api))
        .route("/api/scripts/:name", get(handlers::get_script_api))
        .route("/api/scripts/:name/execute", post(handlers::execute_script_api))
        .route("/api/scripts/:name/logs", get(handlers::script_logs_api))
        .route("/api/logs", get(handlers::logs_api))
}
