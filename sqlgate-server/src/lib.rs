pub mod api;
pub mod config;
pub mod execution;
pub mod github;
pub mod http_log;
pub mod reconcile;
pub mod repository;
pub mod testing;
pub mod webhook;

use axum::{http::StatusCode, response::Json, routing::get, Router};
use serde_json::json;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

pub use execution::{ExecutionEngine, Environments, SqliteExecutor};
pub use github::{GitHubClient, ReviewPlatform};
pub use reconcile::{IntakeSettings, Reconciler};
pub use repository::{InMemoryRepository, ScriptRepository, SqliteRepository};

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

/// The release's git hash when the build environment provides one, otherwise
/// the crate version.
pub fn get_version() -> String {
    match option_env!("SQLGATE_GIT_HASH") {
        Some(git_hash) if git_hash.len() >= 8 => git_hash[..8].to_string(),
        Some(git_hash) => git_hash.to_string(),
        None => built_info::PKG_VERSION.to_string(),
    }
}

pub struct AppState {
    pub reconciler: Reconciler,
    pub engine: ExecutionEngine,
    /// If `None`, webhook signatures are not checked.
    pub webhook_secret: Option<String>,
    /// If `None`, the operator API is disabled.
    pub api_token: Option<String>,
    pub sync_pr_limit: usize,
}

async fn health_check() -> Result<Json<serde_json::Value>, StatusCode> {
    Ok(Json(json!({
        "status": "healthy",
        "service": "sqlgate",
        "version": get_version(),
    })))
}

/// All HTTP routes with request tracing.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .merge(webhook::webhook_router(state.clone()))
        .merge(api::api_router())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}
