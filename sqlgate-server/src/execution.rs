//! Running approved scripts against an environment and auditing every attempt.
//!
//! An attempt is refused before any SQL runs when the script is unknown, the
//! environment has no handle, or promotion rules forbid it; refusals leave no
//! audit row. Every attempt that reaches the database produces exactly one
//! audit row, whether the statement succeeded or not. Only a successful run
//! advances promotion state.
//!
//! No timeout is imposed on statements here; callers that need a deadline
//! must impose it on the outer request.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::types::ValueRef;
use rusqlite::{Batch, Connection, Statement};
use serde::Serialize;
use serde_json::Value;
use sqlgate_core::{is_read_query, Environment, PromotionRefusal};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::repository::{
    ApprovedScript, ExecutionRecord, ExecutionStatus, RepositoryError, ResultRow,
    ScriptRepository,
};

/// Rows kept from a read query. Extra rows are dropped, not an error.
pub const MAX_RESULT_ROWS: usize = 100;

/// What a database handed back for one script.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatementOutput {
    pub rows: Vec<ResultRow>,
    /// Changed-row count for statements that modify data.
    pub rows_affected: Option<u64>,
}

/// One environment's database.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Run the full script text. The error is the database's message.
    async fn run(&self, statement: &str) -> Result<StatementOutput, String>;
}

/// Named database handles, opened once at startup and passed in.
#[derive(Clone, Default)]
pub struct Environments {
    handles: HashMap<Environment, Arc<dyn SqlExecutor>>,
}

impl Environments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, environment: Environment, executor: Arc<dyn SqlExecutor>) -> Self {
        self.handles.insert(environment, executor);
        self
    }

    pub fn get(&self, environment: Environment) -> Option<Arc<dyn SqlExecutor>> {
        self.handles.get(&environment).cloned()
    }
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("script '{0}' is not in the registry")]
    ScriptNotFound(String),
    #[error("no database is configured for environment '{0}'")]
    EnvironmentUnavailable(Environment),
    #[error("cannot run '{script}' on production: {refusal}")]
    PromotionRefused {
        script: String,
        #[source]
        refusal: PromotionRefusal,
    },
    #[error("failed to load script: {0}")]
    Repository(#[from] RepositoryError),
}

/// Result of an attempt that reached the database.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionOutcome {
    #[serde(flatten)]
    pub record: ExecutionRecord,
    /// Audit log row id, if the row was written.
    pub log_id: Option<i64>,
    /// More rows came back than were kept.
    pub truncated: bool,
    /// The audit row could not be written.
    pub audit_error: Option<String>,
    /// The run succeeded but promotion state could not be advanced.
    pub state_error: Option<String>,
}

impl ExecutionOutcome {
    pub fn succeeded(&self) -> bool {
        self.record.status == ExecutionStatus::Success
    }
}

#[derive(Clone)]
pub struct ExecutionEngine {
    repository: Arc<dyn ScriptRepository>,
    environments: Environments,
}

impl ExecutionEngine {
    pub fn new(repository: Arc<dyn ScriptRepository>, environments: Environments) -> Self {
        Self {
            repository,
            environments,
        }
    }

    pub fn repository(&self) -> &Arc<dyn ScriptRepository> {
        &self.repository
    }

    pub async fn execute(
        &self,
        script_name: &str,
        environment: Environment,
        operator: &str,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let script = self
            .repository
            .get_script(script_name)
            .await?
            .ok_or_else(|| ExecutionError::ScriptNotFound(script_name.to_string()))?;

        let executor = self
            .environments
            .get(environment)
            .ok_or(ExecutionError::EnvironmentUnavailable(environment))?;

        if let Err(refusal) = script.flags.authorize(environment) {
            warn!(
                "Refusing to run '{}' on {} for {}: {}",
                script_name, environment, operator, refusal
            );
            return Err(ExecutionError::PromotionRefused {
                script: script_name.to_string(),
                refusal,
            });
        }

        Ok(self
            .run_and_record(executor.as_ref(), environment, &script, operator)
            .await)
    }

    /// Run the script, write its audit row, and on success advance promotion
    /// state. Never fails: audit and state problems are reported in the
    /// outcome next to the execution result.
    pub async fn run_and_record(
        &self,
        executor: &dyn SqlExecutor,
        environment: Environment,
        script: &ApprovedScript,
        operator: &str,
    ) -> ExecutionOutcome {
        info!(
            "Running '{}' on {} for {}",
            script.name, environment, operator
        );

        let executed_at = Utc::now();
        let started = Instant::now();
        let result = executor.run(&script.content).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let mut truncated = false;
        let (status, rows_affected, error_message, result_rows) = match result {
            Ok(output) if is_read_query(&script.content) => {
                let returned = output.rows.len();
                let mut rows = output.rows;
                if rows.len() > MAX_RESULT_ROWS {
                    truncated = true;
                    rows.truncate(MAX_RESULT_ROWS);
                }
                let count = u64::try_from(returned).unwrap_or(u64::MAX);
                let captured = (!rows.is_empty()).then_some(rows);
                (ExecutionStatus::Success, Some(count), None, captured)
            }
            Ok(output) => (ExecutionStatus::Success, output.rows_affected, None, None),
            Err(message) => {
                warn!(
                    "'{}' failed on {} after {}ms: {}",
                    script.name, environment, duration_ms, message
                );
                (ExecutionStatus::Error, None, Some(message), None)
            }
        };

        let record = ExecutionRecord {
            script_name: script.name.clone(),
            script_content: script.content.clone(),
            operator: operator.to_string(),
            environment,
            executed_at,
            status,
            rows_affected,
            error_message,
            duration_ms,
            result_rows,
            pr_url: script.pr_url.clone(),
            approvers: script.approvers.clone(),
        };

        let (log_id, audit_error) = match self.repository.append_execution_log(&record).await {
            Ok(entry) => (Some(entry.id), None),
            Err(e) => {
                error!(
                    "Failed to write audit log for '{}' on {}: {}",
                    script.name, environment, e
                );
                (None, Some(e.to_string()))
            }
        };

        let state_error = if status == ExecutionStatus::Success {
            match self
                .repository
                .mark_executed(&script.name, environment, executed_at)
                .await
            {
                Ok(true) => None,
                Ok(false) => {
                    error!(
                        "Promotion state for '{}' was not advanced on {}",
                        script.name, environment
                    );
                    Some(format!(
                        "promotion state for '{}' was not updated",
                        script.name
                    ))
                }
                Err(e) => {
                    error!(
                        "Failed to record {} execution of '{}': {}",
                        environment, script.name, e
                    );
                    Some(e.to_string())
                }
            }
        } else {
            None
        };

        info!(
            "'{}' on {} finished with status {} in {}ms",
            script.name, environment, status, duration_ms
        );

        ExecutionOutcome {
            record,
            log_id,
            truncated,
            audit_error,
            state_error,
        }
    }
}

/// `SqlExecutor` over a SQLite database file.
pub struct SqliteExecutor {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteExecutor {
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        use anyhow::Context;

        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        use anyhow::Context;

        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }
}

fn json_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(hex::encode(bytes)),
    }
}

fn collect_rows(stmt: &mut Statement<'_>) -> rusqlite::Result<Vec<ResultRow>> {
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut map = ResultRow::new();
        for (idx, column) in columns.iter().enumerate() {
            map.insert(column.clone(), json_value(row.get_ref(idx)?));
        }
        out.push(map);
    }
    Ok(out)
}

fn total_changes(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("SELECT total_changes()", [], |row| row.get(0))
}

/// Run every statement of `script` in order.
///
/// For a read script the rows of the first statement that returns columns are
/// kept; rows of any later statement are stepped through and dropped. For
/// other scripts the changed-row count covers the whole script.
fn run_statement(conn: &Connection, script: &str) -> rusqlite::Result<StatementOutput> {
    let capture = is_read_query(script);
    let before = total_changes(conn)?;

    let mut captured: Option<Vec<ResultRow>> = None;
    let mut batch = Batch::new(conn, script);
    while let Some(mut stmt) = batch.next()? {
        if capture && captured.is_none() && stmt.column_count() > 0 {
            captured = Some(collect_rows(&mut stmt)?);
        } else {
            let mut rows = stmt.query([])?;
            while rows.next()?.is_some() {}
        }
    }

    let after = total_changes(conn)?;
    Ok(StatementOutput {
        rows: captured.unwrap_or_default(),
        rows_affected: if capture {
            None
        } else {
            u64::try_from(after - before).ok()
        },
    })
}

#[async_trait]
impl SqlExecutor for SqliteExecutor {
    async fn run(&self, statement: &str) -> Result<StatementOutput, String> {
        let conn = self.conn.clone();
        let statement = statement.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| "database connection mutex poisoned".to_string())?;
            run_statement(&conn, &statement).map_err(|e| e.to_string())
        })
        .await
        .map_err(|e| format!("execution task failed: {}", e))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{InMemoryRepository, ScriptApproval};
    use sqlgate_core::PromotionState;
    use std::collections::BTreeSet;

    async fn engine_with(
        scripts: &[(&str, &str, bool)],
    ) -> (ExecutionEngine, Arc<InMemoryRepository>) {
        let repository = Arc::new(InMemoryRepository::new());
        for (name, content, direct_prod) in scripts {
            repository
                .upsert_script(&ScriptApproval {
                    name: name.to_string(),
                    content: content.to_string(),
                    target_environment: Environment::Staging,
                    pr_url: "https://github.com/acme/db/pull/1".to_string(),
                    approvers: BTreeSet::from(["a".to_string(), "b".to_string()]),
                    approved_at: Utc::now(),
                    direct_prod: *direct_prod,
                })
                .await
                .unwrap();
        }

        let staging = SqliteExecutor::open_in_memory().unwrap();
        let production = SqliteExecutor::open_in_memory().unwrap();
        for executor in [&staging, &production] {
            executor
                .run("CREATE TABLE items (id INTEGER PRIMARY KEY, label TEXT, price REAL)")
                .await
                .unwrap();
        }

        let environments = Environments::new()
            .with(Environment::Staging, Arc::new(staging))
            .with(Environment::Production, Arc::new(production));
        (
            ExecutionEngine::new(repository.clone(), environments),
            repository,
        )
    }

    fn insert_many(n: usize) -> String {
        let values: Vec<String> = (0..n).map(|i| format!("({}, 'item{}', 1.5)", i, i)).collect();
        format!("INSERT INTO items (id, label, price) VALUES {};", values.join(", "))
    }

    #[tokio::test]
    async fn test_unknown_script_is_refused_without_log() {
        let (engine, repository) = engine_with(&[]).await;
        let err = engine
            .execute("ghost", Environment::Staging, "op")
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::ScriptNotFound(_)));
        assert!(repository.list_execution_logs(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_production_before_staging_is_refused() {
        let (engine, repository) = engine_with(&[("s", "SELECT 1;", false)]).await;

        let err = engine
            .execute("s", Environment::Production, "op")
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutionError::PromotionRefused { .. }));
        assert!(err.to_string().contains("DirectProd"));
        assert!(repository.list_execution_logs(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_environment_handle() {
        let repository = Arc::new(InMemoryRepository::new());
        repository
            .upsert_script(&ScriptApproval {
                name: "s".to_string(),
                content: "SELECT 1;".to_string(),
                target_environment: Environment::Staging,
                pr_url: String::new(),
                approvers: BTreeSet::new(),
                approved_at: Utc::now(),
                direct_prod: false,
            })
            .await
            .unwrap();
        let engine = ExecutionEngine::new(repository, Environments::new());

        let err = engine
            .execute("s", Environment::Staging, "op")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::EnvironmentUnavailable(Environment::Staging)
        ));
    }

    #[tokio::test]
    async fn test_staging_then_production_promotes() {
        let (engine, repository) =
            engine_with(&[("add", "INSERT INTO items (label) VALUES ('x');", false)]).await;

        let staging = engine.execute("add", Environment::Staging, "op").await.unwrap();
        assert!(staging.succeeded());
        assert_eq!(staging.record.rows_affected, Some(1));
        assert!(staging.log_id.is_some());

        let production = engine
            .execute("add", Environment::Production, "op")
            .await
            .unwrap();
        assert!(production.succeeded());

        let script = repository.get_script("add").await.unwrap().unwrap();
        assert_eq!(script.promotion_state(), PromotionState::ProductionExecuted);
        assert_eq!(repository.list_execution_logs(None, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_run_is_logged_and_does_not_promote() {
        let (engine, repository) =
            engine_with(&[("bad", "UPDATE missing_table SET x = 1;", false)]).await;

        let outcome = engine.execute("bad", Environment::Staging, "op").await.unwrap();

        assert_eq!(outcome.record.status, ExecutionStatus::Error);
        assert!(outcome
            .record
            .error_message
            .as_deref()
            .unwrap()
            .contains("missing_table"));
        let logs = repository.list_execution_logs(Some("bad"), 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].record.status, ExecutionStatus::Error);

        let script = repository.get_script("bad").await.unwrap().unwrap();
        assert!(!script.flags.staging_executed);
    }

    #[tokio::test]
    async fn test_read_query_caps_rows_at_limit() {
        let seed = insert_many(150);
        let (engine, repository) = engine_with(&[
            ("seed", seed.as_str(), false),
            ("read", "-- list items\nSELECT id, label, price FROM items ORDER BY id;", false),
        ])
        .await;
        engine.execute("seed", Environment::Staging, "op").await.unwrap();

        let outcome = engine.execute("read", Environment::Staging, "op").await.unwrap();

        let rows = outcome.record.result_rows.as_ref().unwrap();
        assert_eq!(rows.len(), MAX_RESULT_ROWS);
        assert!(outcome.truncated);
        assert_eq!(outcome.record.rows_affected, Some(150));
        assert_eq!(rows[0].get("label"), Some(&Value::from("item0")));
        assert_eq!(rows[0].get("price"), Some(&Value::from(1.5)));

        let stored = repository
            .get_execution_log(outcome.log_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.record.result_rows.unwrap().len(), MAX_RESULT_ROWS);
    }

    #[tokio::test]
    async fn test_read_query_with_no_rows_has_no_result_set() {
        let (engine, _) = engine_with(&[("read", "SELECT * FROM items;", false)]).await;

        let outcome = engine.execute("read", Environment::Staging, "op").await.unwrap();

        assert!(outcome.succeeded());
        assert_eq!(outcome.record.result_rows, None);
        assert_eq!(outcome.record.rows_affected, Some(0));
        assert!(!outcome.truncated);
    }

    #[tokio::test]
    async fn test_direct_prod_runs_production_first() {
        let (engine, repository) = engine_with(&[("hotfix", "SELECT 1 AS one;", true)]).await;

        let outcome = engine
            .execute("hotfix", Environment::Production, "op")
            .await
            .unwrap();
        assert!(outcome.succeeded());

        let script = repository.get_script("hotfix").await.unwrap().unwrap();
        assert!(script.flags.production_executed);
        assert!(!script.flags.staging_executed);
    }

    #[tokio::test]
    async fn test_reexecution_is_permitted_and_logged_each_time() {
        let (engine, repository) = engine_with(&[("s", "SELECT 1;", false)]).await;
        for _ in 0..3 {
            engine.execute("s", Environment::Staging, "op").await.unwrap();
        }
        assert_eq!(repository.list_execution_logs(Some("s"), 10).await.unwrap().len(), 3);
    }

    struct FailingAudit {
        inner: InMemoryRepository,
    }

    #[async_trait]
    impl ScriptRepository for FailingAudit {
        async fn upsert_script(&self, a: &ScriptApproval) -> Result<(), RepositoryError> {
            self.inner.upsert_script(a).await
        }
        async fn get_script(&self, n: &str) -> Result<Option<ApprovedScript>, RepositoryError> {
            self.inner.get_script(n).await
        }
        async fn list_scripts(&self) -> Result<Vec<ApprovedScript>, RepositoryError> {
            self.inner.list_scripts().await
        }
        async fn script_names(
            &self,
        ) -> Result<std::collections::HashSet<String>, RepositoryError> {
            self.inner.script_names().await
        }
        async fn mark_executed(
            &self,
            n: &str,
            e: Environment,
            at: chrono::DateTime<Utc>,
        ) -> Result<bool, RepositoryError> {
            self.inner.mark_executed(n, e, at).await
        }
        async fn append_execution_log(
            &self,
            _: &ExecutionRecord,
        ) -> Result<crate::repository::ExecutionLogEntry, RepositoryError> {
            Err(RepositoryError::storage("append_execution_log", "disk full"))
        }
        async fn list_execution_logs(
            &self,
            s: Option<&str>,
            l: usize,
        ) -> Result<Vec<crate::repository::ExecutionLogEntry>, RepositoryError> {
            self.inner.list_execution_logs(s, l).await
        }
        async fn get_execution_log(
            &self,
            id: i64,
        ) -> Result<Option<crate::repository::ExecutionLogEntry>, RepositoryError> {
            self.inner.get_execution_log(id).await
        }
    }

    #[tokio::test]
    async fn test_audit_failure_does_not_mask_success() {
        let repository = Arc::new(FailingAudit {
            inner: InMemoryRepository::new(),
        });
        repository
            .upsert_script(&ScriptApproval {
                name: "s".to_string(),
                content: "SELECT 1;".to_string(),
                target_environment: Environment::Staging,
                pr_url: String::new(),
                approvers: BTreeSet::new(),
                approved_at: Utc::now(),
                direct_prod: false,
            })
            .await
            .unwrap();
        let environments = Environments::new().with(
            Environment::Staging,
            Arc::new(SqliteExecutor::open_in_memory().unwrap()),
        );
        let engine = ExecutionEngine::new(repository.clone(), environments);

        let outcome = engine.execute("s", Environment::Staging, "op").await.unwrap();

        assert!(outcome.succeeded());
        assert_eq!(outcome.log_id, None);
        assert!(outcome.audit_error.as_deref().unwrap().contains("disk full"));
        let script = repository.get_script("s").await.unwrap().unwrap();
        assert!(script.flags.staging_executed);
    }

    #[tokio::test]
    async fn test_sqlite_executor_reports_changes_for_multi_statement_scripts() {
        let executor = SqliteExecutor::open_in_memory().unwrap();
        executor
            .run("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1), (2), (3);")
            .await
            .unwrap();

        let output = executor
            .run("UPDATE t SET x = x + 1; DELETE FROM t WHERE x = 4;")
            .await
            .unwrap();
        assert_eq!(output.rows_affected, Some(4));
        assert!(output.rows.is_empty());
    }

    #[tokio::test]
    async fn test_sqlite_executor_runs_statements_after_leading_select() {
        let executor = SqliteExecutor::open_in_memory().unwrap();
        executor
            .run("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1), (2);")
            .await
            .unwrap();

        let output = executor
            .run("SELECT count(*) AS n FROM t;\n-- then clean up\nDELETE FROM t;\nSELECT 99 AS ignored;")
            .await
            .unwrap();
        assert_eq!(output.rows.len(), 1);
        assert_eq!(output.rows[0]["n"], Value::from(2));

        let remaining = executor.run("SELECT count(*) AS n FROM t").await.unwrap();
        assert_eq!(remaining.rows[0]["n"], Value::from(0));
    }

    #[tokio::test]
    async fn test_sqlite_executor_fails_on_later_statement_error() {
        let executor = SqliteExecutor::open_in_memory().unwrap();
        executor.run("CREATE TABLE t (x INTEGER)").await.unwrap();

        let err = executor
            .run("SELECT count(*) FROM t; DELETE FROM missing_table;")
            .await
            .unwrap_err();
        assert!(err.contains("missing_table"));
    }

    #[tokio::test]
    async fn test_failing_tail_of_read_script_does_not_promote() {
        let (engine, repository) = engine_with(&[(
            "report",
            "SELECT count(*) AS n FROM items; DELETE FROM missing_table;",
            false,
        )])
        .await;

        let outcome = engine
            .execute("report", Environment::Staging, "carol")
            .await
            .unwrap();
        assert!(!outcome.succeeded());

        let script = repository.get_script("report").await.unwrap().unwrap();
        assert_eq!(script.promotion_state(), PromotionState::PendingStaging);
    }

    #[tokio::test]
    async fn test_sqlite_executor_maps_column_types() {
        let executor = SqliteExecutor::open_in_memory().unwrap();
        let output = executor
            .run("SELECT 1 AS i, 2.5 AS r, 'x' AS t, NULL AS n, X'CAFE' AS b")
            .await
            .unwrap();

        let row = &output.rows[0];
        assert_eq!(row["i"], Value::from(1));
        assert_eq!(row["r"], Value::from(2.5));
        assert_eq!(row["t"], Value::from("x"));
        assert_eq!(row["n"], Value::Null);
        assert_eq!(row["b"], Value::from("cafe"));
    }
}
