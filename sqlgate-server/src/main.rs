use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn, Level};

use sqlgate_core::Environment;
use sqlgate_server::config::Config;
use sqlgate_server::reconcile::sync_polling_loop;
use sqlgate_server::{
    app, get_version, AppState, Environments, ExecutionEngine, GitHubClient, IntakeSettings,
    Reconciler, SqliteExecutor, SqliteRepository,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting sqlgate {}", get_version());

    let config = Config::from_env().context("Failed to load configuration from environment")?;

    if config.github_webhook_secret.is_none() {
        warn!("GITHUB_WEBHOOK_SECRET is not set; webhook signatures will not be verified");
    }
    if config.api_token.is_none() {
        warn!("API_TOKEN is not set; the operator API is disabled");
    }

    let db_path = config.state_db_path();
    info!("Using state database: {}", db_path.display());
    let repository = Arc::new(
        SqliteRepository::new(&db_path).context("Failed to initialize SQLite database")?,
    );

    let github_client = GitHubClient::new(
        config.github_token.clone(),
        config.repo_owner.clone(),
        config.repo_name.clone(),
        config.approval_policy,
    )?;
    info!(
        "Watching {}/{} (min approvals: {}, extensions: {})",
        config.repo_owner,
        config.repo_name,
        config.min_approvals,
        config.script_extensions.join(", ")
    );

    let staging = SqliteExecutor::open(&config.staging_database_path)?;
    let production = SqliteExecutor::open(&config.production_database_path)?;
    let environments = Environments::new()
        .with(Environment::Staging, Arc::new(staging))
        .with(Environment::Production, Arc::new(production));

    let reconciler = Reconciler::new(
        Arc::new(github_client),
        repository.clone(),
        IntakeSettings {
            min_approvals: config.min_approvals,
            script_extensions: config.script_extensions.clone(),
        },
    );

    let app_state = Arc::new(AppState {
        reconciler: reconciler.clone(),
        engine: ExecutionEngine::new(repository, environments),
        webhook_secret: config.github_webhook_secret.clone(),
        api_token: config.api_token.clone(),
        sync_pr_limit: config.sync_pr_limit,
    });

    if let Some(period) = config.sync_interval {
        info!("Periodic sync every {}s", period.as_secs());
        let limit = config.sync_pr_limit;
        tokio::spawn(async move {
            sync_polling_loop(reconciler, period, limit).await;
        });
    }

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, app(app_state)).await?;

    Ok(())
}
