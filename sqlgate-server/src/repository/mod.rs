//! Storage for the approved-script registry and the execution audit log.
//!
//! The `ScriptRepository` trait is the seam between the reconciler/execution
//! engine and the storage backend. Every concurrency guarantee the service
//! relies on lives behind it:
//!
//! - `upsert_script` is a single insert-or-update keyed by script name, so two
//!   concurrent callers can never create two rows for one name;
//! - `mark_executed` is a conditional update keyed by name that only ever sets
//!   promotion flags and refuses production unless staging ran or the script
//!   is marked `DirectProd`;
//! - execution log entries are append-only.

mod memory;
mod sqlite;

pub use memory::InMemoryRepository;
pub use sqlite::SqliteRepository;

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlgate_core::{Environment, PromotionFlags, PromotionState};
use thiserror::Error;

/// One row of a captured query result, column name to value.
pub type ResultRow = serde_json::Map<String, Value>;

/// Everything the reconciler knows about a freshly approved script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptApproval {
    pub name: String,
    pub content: String,
    /// Advisory only; promotion is staging-first regardless.
    pub target_environment: Environment,
    pub pr_url: String,
    pub approvers: BTreeSet<String>,
    pub approved_at: DateTime<Utc>,
    pub direct_prod: bool,
}

/// A registry row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApprovedScript {
    pub name: String,
    pub content: String,
    pub target_environment: Environment,
    pub pr_url: String,
    pub approvers: BTreeSet<String>,
    pub approved_at: DateTime<Utc>,
    #[serde(flatten)]
    pub flags: PromotionFlags,
    pub staging_executed_at: Option<DateTime<Utc>>,
    pub production_executed_at: Option<DateTime<Utc>>,
}

impl ApprovedScript {
    pub fn promotion_state(&self) -> PromotionState {
        self.flags.state()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Error,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Error => "error",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = RepositoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(ExecutionStatus::Success),
            "error" => Ok(ExecutionStatus::Error),
            _ => Err(RepositoryError::corruption("execution status")),
        }
    }
}

/// An execution attempt as captured at the time it ran.
///
/// This is a snapshot: it does not depend on the registry row still existing
/// or still matching.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionRecord {
    pub script_name: String,
    pub script_content: String,
    pub operator: String,
    pub environment: Environment,
    pub executed_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub rows_affected: Option<u64>,
    pub error_message: Option<String>,
    pub duration_ms: u64,
    pub result_rows: Option<Vec<ResultRow>>,
    pub pr_url: String,
    pub approvers: BTreeSet<String>,
}

/// A persisted, immutable audit log row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionLogEntry {
    pub id: i64,
    #[serde(flatten)]
    pub record: ExecutionRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepositoryError {
    #[error("storage error during {operation}: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },
    #[error("corrupt {0} in storage")]
    Corruption(&'static str),
}

impl RepositoryError {
    pub fn storage(operation: &'static str, message: impl Into<String>) -> Self {
        RepositoryError::Storage {
            operation,
            message: message.into(),
        }
    }

    pub fn corruption(what: &'static str) -> Self {
        RepositoryError::Corruption(what)
    }
}

/// Persistence for approved scripts and their execution history.
#[async_trait]
pub trait ScriptRepository: Send + Sync {
    /// Insert a script, or refresh content, PR URL, approvers, target hint,
    /// bypass flag and approval time if the name already exists.
    ///
    /// Promotion flags are never touched by an upsert.
    async fn upsert_script(&self, approval: &ScriptApproval) -> Result<(), RepositoryError>;

    async fn get_script(&self, name: &str) -> Result<Option<ApprovedScript>, RepositoryError>;

    /// All scripts, most recently approved first.
    async fn list_scripts(&self) -> Result<Vec<ApprovedScript>, RepositoryError>;

    async fn script_names(&self) -> Result<HashSet<String>, RepositoryError>;

    /// Record a successful run against `environment`.
    ///
    /// Returns `false` when no row was updated: the script does not exist, or
    /// production was requested while neither `staging_executed` nor
    /// `direct_prod` is set.
    async fn mark_executed(
        &self,
        name: &str,
        environment: Environment,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    async fn append_execution_log(
        &self,
        record: &ExecutionRecord,
    ) -> Result<ExecutionLogEntry, RepositoryError>;

    /// Newest first, optionally restricted to one script.
    async fn list_execution_logs(
        &self,
        script_name: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ExecutionLogEntry>, RepositoryError>;

    async fn get_execution_log(&self, id: i64)
        -> Result<Option<ExecutionLogEntry>, RepositoryError>;
}
