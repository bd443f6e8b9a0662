use anyhow::{anyhow, Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::github::ApprovalPolicy;

/// Name of the SQLite file holding the registry and audit log.
pub const STATE_DB_FILE: &str = "sqlgate-state.db";

#[derive(Clone)]
pub struct Config {
    pub github_token: String,
    pub repo_owner: String,
    pub repo_name: String,
    /// HMAC secret for `/webhook`. If unset, signatures are not checked.
    pub github_webhook_secret: Option<String>,
    pub min_approvals: usize,
    /// Lower-cased, each starting with a dot.
    pub script_extensions: Vec<String>,
    pub sync_pr_limit: usize,
    /// Period of the background sync loop; `None` disables it.
    pub sync_interval: Option<Duration>,
    pub approval_policy: ApprovalPolicy,
    pub staging_database_path: PathBuf,
    pub production_database_path: PathBuf,
    /// Directory for persistent state (SQLite database).
    /// Defaults to current working directory.
    pub state_dir: PathBuf,
    pub port: u16,
    /// Bearer token for the `/api` routes.
    /// If not set, those routes are disabled (503).
    pub api_token: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let github_token = env::var("GITHUB_TOKEN")
            .context("GITHUB_TOKEN environment variable is required")?;

        let (repo_owner, repo_name) = parse_repository(
            &env::var("GITHUB_REPOSITORY")
                .context("GITHUB_REPOSITORY environment variable is required")?,
        )?;

        let github_webhook_secret = parse_optional_secret(env::var("GITHUB_WEBHOOK_SECRET").ok());

        let min_approvals = env::var("MIN_APPROVALS")
            .unwrap_or_else(|_| "2".to_string())
            .parse::<usize>()
            .context("MIN_APPROVALS must be a valid number")?;

        let script_extensions = parse_script_extensions(
            &env::var("SCRIPT_EXTENSIONS").unwrap_or_else(|_| ".sql".to_string()),
        )?;

        let sync_pr_limit = env::var("SYNC_PR_LIMIT")
            .unwrap_or_else(|_| "50".to_string())
            .parse::<usize>()
            .context("SYNC_PR_LIMIT must be a valid number")?;

        let sync_interval = match env::var("SYNC_INTERVAL_SECS") {
            Ok(value) => parse_sync_interval(&value)?,
            Err(_) => None,
        };

        let revoke = match env::var("REVOKE_ON_CHANGES_REQUESTED") {
            Ok(value) => {
                parse_flag(&value).context("REVOKE_ON_CHANGES_REQUESTED must be a boolean")?
            }
            Err(_) => false,
        };
        let approval_policy = if revoke {
            ApprovalPolicy::LatestReview
        } else {
            ApprovalPolicy::EverApproved
        };

        let staging_database_path = env::var("STAGING_DATABASE_PATH")
            .map(PathBuf::from)
            .context("STAGING_DATABASE_PATH environment variable is required")?;

        let production_database_path = env::var("PRODUCTION_DATABASE_PATH")
            .map(PathBuf::from)
            .context("PRODUCTION_DATABASE_PATH environment variable is required")?;

        let state_dir = env::var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        let api_token = parse_optional_secret(env::var("API_TOKEN").ok());

        Ok(Config {
            github_token,
            repo_owner,
            repo_name,
            github_webhook_secret,
            min_approvals,
            script_extensions,
            sync_pr_limit,
            sync_interval,
            approval_policy,
            staging_database_path,
            production_database_path,
            state_dir,
            port,
            api_token,
        })
    }

    pub fn state_db_path(&self) -> PathBuf {
        self.state_dir.join(STATE_DB_FILE)
    }
}

/// Split `owner/repo`.
pub fn parse_repository(value: &str) -> Result<(String, String)> {
    match value.trim().split_once('/') {
        Some((owner, repo))
            if !owner.is_empty() && !repo.is_empty() && !repo.contains('/') =>
        {
            Ok((owner.to_string(), repo.to_string()))
        }
        _ => Err(anyhow!(
            "GITHUB_REPOSITORY must have the form owner/repo, got '{}'",
            value
        )),
    }
}

/// Parse a comma-separated extension list such as `.sql, .psql`.
///
/// A missing leading dot is added and entries are lower-cased.
pub fn parse_script_extensions(value: &str) -> Result<Vec<String>> {
    let extensions: Vec<String> = value
        .split(',')
        .map(str::trim)
        .filter(|ext| !ext.is_empty())
        .map(|ext| {
            let ext = ext.to_lowercase();
            if ext.starts_with('.') {
                ext
            } else {
                format!(".{}", ext)
            }
        })
        .collect();

    if extensions.is_empty() {
        return Err(anyhow!("SCRIPT_EXTENSIONS must name at least one extension"));
    }
    Ok(extensions)
}

/// `0` disables the loop as well.
pub fn parse_sync_interval(value: &str) -> Result<Option<Duration>> {
    let secs = value
        .trim()
        .parse::<u64>()
        .context("SYNC_INTERVAL_SECS must be a valid number")?;
    Ok((secs > 0).then(|| Duration::from_secs(secs)))
}

/// Returns None if the value is missing, empty, or contains only whitespace.
/// An empty token must never count as configured.
/// `true`/`yes`/`1` or `false`/`no`/`0`, case-insensitive. Empty means false.
pub fn parse_flag(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" | "" => Ok(false),
        other => Err(anyhow!("expected true/false, yes/no or 1/0, got '{}'", other)),
    }
}

pub fn parse_optional_secret(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}
