//! SQLite implementation of `ScriptRepository`.
//!
//! # Schema Versioning
//!
//! The database has a `schema_version` table that tracks the schema version.
//! When the schema needs to change, increment `CURRENT_SCHEMA_VERSION` and add
//! a migration in `run_migrations()`. Migrations run sequentially from the
//! current version to the target version.
//!
//! # Storage-level guarantees
//!
//! - `approved_scripts.name` is `UNIQUE` and written with a single
//!   `INSERT .. ON CONFLICT(name) DO UPDATE`.
//! - A `CHECK` constraint rejects any row with `production_executed` set while
//!   both `staging_executed` and `direct_prod` are clear, and a trigger aborts
//!   any update that would clear a promotion flag.
//! - `execution_logs` has triggers that abort every `UPDATE` and `DELETE`.
//!
//! Approver sets and captured result rows are stored as JSON text; they are
//! typed everywhere above this module.


use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use sqlgate_core::{Environment, PromotionFlags};
use tracing::warn;

use super::{
    ApprovedScript, ExecutionLogEntry, ExecutionRecord, RepositoryError, ResultRow,
    ScriptApproval, ScriptRepository,
};

/// Current schema version. Increment this when making schema changes and add
/// corresponding migration logic in `run_migrations()`.
const CURRENT_SCHEMA_VERSION: i64 = 2;

const SCRIPT_COLUMNS: &str = "name, content, target_environment, pr_url, approvers_json, \
     approved_at, staging_executed, staging_executed_at, production_executed, \
     production_executed_at, direct_prod";

const LOG_COLUMNS: &str = "id, script_name, script_content, operator, environment, executed_at, \
     status, rows_affected, error_message, duration_ms, result_rows_json, pr_url, approvers_json";

/// SQLite-backed registry and audit log.
///
/// Uses `tokio::task::spawn_blocking` to run synchronous rusqlite operations
/// without blocking the async runtime.
pub struct SqliteRepository {
    /// Exposed as `pub(crate)` so tests can poke at the raw tables.
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    /// Open (or create) the database at `path` and bring its schema up to date.
    ///
    /// The database is configured with `journal_mode = WAL`,
    /// `synchronous = FULL` and a 5 second busy timeout.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, RepositoryError> {
        let path_ref = path.as_ref();
        let path_str = path_ref.to_string_lossy();
        let is_in_memory = path_str == ":memory:";

        if !is_in_memory && !path_str.is_empty() {
            if let Some(parent) = path_ref.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        RepositoryError::storage(
                            "create database directory",
                            format!("{}: {}", parent.display(), e),
                        )
                    })?;
                }
            }
        }

        let conn = Connection::open(path_ref)
            .map_err(|e| RepositoryError::storage("open database", e.to_string()))?;

        // The audit log is sensitive; keep the file private (Unix only).
        #[cfg(unix)]
        if !is_in_memory && !path_str.is_empty() {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = std::fs::set_permissions(path_ref, permissions) {
                warn!(
                    "Failed to set restrictive permissions on database file: {}",
                    e
                );
            }
        }

        // SQLite can silently keep DELETE mode on filesystems without shared
        // memory support, so check what we actually got.
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| RepositoryError::storage("set journal_mode", e.to_string()))?;

        let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (is_in_memory && journal_mode.eq_ignore_ascii_case("memory"));

        if !journal_mode_ok {
            return Err(RepositoryError::storage(
                "configure journal_mode",
                format!(
                    "Failed to enable WAL mode: SQLite returned '{}' instead of 'wal'",
                    journal_mode
                ),
            ));
        }

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            "#,
        )
        .map_err(|e| RepositoryError::storage("configure pragmas", e.to_string()))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| RepositoryError::storage("create schema_version table", e.to_string()))?;

        let current_version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| RepositoryError::storage("get schema version", e.to_string()))?
            .unwrap_or(0);

        Self::run_migrations(&conn, current_version)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create a new in-memory SQLite repository (for testing).
    pub fn new_in_memory() -> Result<Self, RepositoryError> {
        Self::new(":memory:")
    }

    /// Run migrations from `from_version` to `CURRENT_SCHEMA_VERSION`.
    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), RepositoryError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(RepositoryError::storage(
                "schema version",
                format!(
                    "Database schema version {} is newer than supported version {}. \
                     Please upgrade the application.",
                    from_version, CURRENT_SCHEMA_VERSION
                ),
            ));
        }

        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        // Version 1: registry and audit log.
        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS approved_scripts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL UNIQUE,
                    content TEXT NOT NULL,
                    target_environment TEXT NOT NULL
                        CHECK(target_environment IN ('staging', 'production')),
                    pr_url TEXT NOT NULL,
                    approvers_json TEXT NOT NULL,
                    approved_at TEXT NOT NULL,
                    staging_executed INTEGER NOT NULL DEFAULT 0,
                    staging_executed_at TEXT,
                    production_executed INTEGER NOT NULL DEFAULT 0,
                    production_executed_at TEXT,
                    direct_prod INTEGER NOT NULL DEFAULT 0,
                    CHECK (production_executed = 0 OR staging_executed = 1 OR direct_prod = 1)
                );

                CREATE TABLE IF NOT EXISTS execution_logs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    script_name TEXT NOT NULL,
                    script_content TEXT NOT NULL,
                    operator TEXT NOT NULL,
                    environment TEXT NOT NULL
                        CHECK(environment IN ('staging', 'production')),
                    executed_at TEXT NOT NULL,
                    status TEXT NOT NULL CHECK(status IN ('success', 'error')),
                    rows_affected INTEGER,
                    error_message TEXT,
                    duration_ms INTEGER NOT NULL,
                    result_rows_json TEXT,
                    pr_url TEXT NOT NULL,
                    approvers_json TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_execution_logs_script
                    ON execution_logs(script_name, id DESC);
                "#,
            )
            .map_err(|e| RepositoryError::storage("migration v1", e.to_string()))?;
        }

        // Version 2: enforce append-only audit rows and monotone flags in the
        // database itself, so ad-hoc SQL cannot rewrite history either.
        if from_version < 2 {
            conn.execute_batch(
                r#"
                CREATE TRIGGER IF NOT EXISTS execution_logs_no_update
                BEFORE UPDATE ON execution_logs
                BEGIN
                    SELECT RAISE(ABORT, 'execution_logs is append-only');
                END;

                CREATE TRIGGER IF NOT EXISTS execution_logs_no_delete
                BEFORE DELETE ON execution_logs
                BEGIN
                    SELECT RAISE(ABORT, 'execution_logs is append-only');
                END;

                CREATE TRIGGER IF NOT EXISTS approved_scripts_flags_monotone
                BEFORE UPDATE ON approved_scripts
                WHEN (OLD.staging_executed = 1 AND NEW.staging_executed = 0)
                  OR (OLD.production_executed = 1 AND NEW.production_executed = 0)
                BEGIN
                    SELECT RAISE(ABORT, 'promotion flags cannot be cleared');
                END;
                "#,
            )
            .map_err(|e| RepositoryError::storage("migration v2", e.to_string()))?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| RepositoryError::storage("update schema version", e.to_string()))?;

        Ok(())
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, operation: &'static str, f: F) -> Result<T, RepositoryError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, RepositoryError> + Send + 'static,
    {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| RepositoryError::storage(operation, "connection mutex poisoned"))?;
            f(&conn)
        })
        .await
        .map_err(|e| RepositoryError::storage(operation, e.to_string()))?
    }
}

// =============================================================================
// Conversion helpers
// =============================================================================

/// Convert a u64 counter to i64 for SQLite storage.
///
/// Returns an error rather than wrapping with `as i64`.
fn u64_to_i64(value: u64, operation: &'static str) -> Result<i64, RepositoryError> {
    i64::try_from(value).map_err(|_| {
        RepositoryError::storage(
            operation,
            format!("value {} exceeds maximum storable value ({})", value, i64::MAX),
        )
    })
}

fn i64_to_u64(value: i64, what: &'static str) -> Result<u64, RepositoryError> {
    u64::try_from(value).map_err(|_| RepositoryError::corruption(what))
}

/// Convert a usize limit to i64 for a SQLite LIMIT clause.
fn usize_to_i64_limit(limit: usize, operation: &'static str) -> Result<i64, RepositoryError> {
    i64::try_from(limit).map_err(|_| {
        RepositoryError::storage(
            operation,
            format!("limit {} exceeds maximum storable value ({})", limit, i64::MAX),
        )
    })
}

fn parse_environment(value: &str) -> Result<Environment, RepositoryError> {
    value
        .parse()
        .map_err(|_| RepositoryError::corruption("environment"))
}

fn approvers_to_json(approvers: &BTreeSet<String>) -> Result<String, RepositoryError> {
    serde_json::to_string(approvers)
        .map_err(|e| RepositoryError::storage("serialize approvers", e.to_string()))
}

fn approvers_from_json(json: &str) -> Result<BTreeSet<String>, RepositoryError> {
    serde_json::from_str(json).map_err(|_| RepositoryError::corruption("approvers JSON"))
}

/// Raw column values of one `approved_scripts` row.
struct ScriptRow {
    name: String,
    content: String,
    target_environment: String,
    pr_url: String,
    approvers_json: String,
    approved_at: DateTime<Utc>,
    staging_executed: bool,
    staging_executed_at: Option<DateTime<Utc>>,
    production_executed: bool,
    production_executed_at: Option<DateTime<Utc>>,
    direct_prod: bool,
}

impl ScriptRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            name: row.get(0)?,
            content: row.get(1)?,
            target_environment: row.get(2)?,
            pr_url: row.get(3)?,
            approvers_json: row.get(4)?,
            approved_at: row.get(5)?,
            staging_executed: row.get(6)?,
            staging_executed_at: row.get(7)?,
            production_executed: row.get(8)?,
            production_executed_at: row.get(9)?,
            direct_prod: row.get(10)?,
        })
    }

    fn into_script(self) -> Result<ApprovedScript, RepositoryError> {
        Ok(ApprovedScript {
            target_environment: parse_environment(&self.target_environment)?,
            approvers: approvers_from_json(&self.approvers_json)?,
            name: self.name,
            content: self.content,
            pr_url: self.pr_url,
            approved_at: self.approved_at,
            flags: PromotionFlags {
                staging_executed: self.staging_executed,
                production_executed: self.production_executed,
                direct_prod: self.direct_prod,
            },
            staging_executed_at: self.staging_executed_at,
            production_executed_at: self.production_executed_at,
        })
    }
}

/// Raw column values of one `execution_logs` row.
struct LogRow {
    id: i64,
    script_name: String,
    script_content: String,
    operator: String,
    environment: String,
    executed_at: DateTime<Utc>,
    status: String,
    rows_affected: Option<i64>,
    error_message: Option<String>,
    duration_ms: i64,
    result_rows_json: Option<String>,
    pr_url: String,
    approvers_json: String,
}

impl LogRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            script_name: row.get(1)?,
            script_content: row.get(2)?,
            operator: row.get(3)?,
            environment: row.get(4)?,
            executed_at: row.get(5)?,
            status: row.get(6)?,
            rows_affected: row.get(7)?,
            error_message: row.get(8)?,
            duration_ms: row.get(9)?,
            result_rows_json: row.get(10)?,
            pr_url: row.get(11)?,
            approvers_json: row.get(12)?,
        })
    }

    fn into_entry(self) -> Result<ExecutionLogEntry, RepositoryError> {
        let result_rows = self
            .result_rows_json
            .map(|json| {
                serde_json::from_str::<Vec<ResultRow>>(&json)
                    .map_err(|_| RepositoryError::corruption("result rows JSON"))
            })
            .transpose()?;

        Ok(ExecutionLogEntry {
            id: self.id,
            record: ExecutionRecord {
                script_name: self.script_name,
                script_content: self.script_content,
                operator: self.operator,
                environment: parse_environment(&self.environment)?,
                executed_at: self.executed_at,
                status: self.status.parse()?,
                rows_affected: self
                    .rows_affected
                    .map(|n| i64_to_u64(n, "rows_affected"))
                    .transpose()?,
                error_message: self.error_message,
                duration_ms: i64_to_u64(self.duration_ms, "duration_ms")?,
                result_rows,
                pr_url: self.pr_url,
                approvers: approvers_from_json(&self.approvers_json)?,
            },
        })
    }
}

fn load_log_entry(conn: &Connection, id: i64) -> Result<Option<ExecutionLogEntry>, RepositoryError> {
    conn.query_row(
        &format!("SELECT {LOG_COLUMNS} FROM execution_logs WHERE id = ?1"),
        params![id],
        LogRow::from_row,
    )
    .optional()
    .map_err(|e| RepositoryError::storage("get_execution_log", e.to_string()))?
    .map(LogRow::into_entry)
    .transpose()
}

// =============================================================================
// ScriptRepository trait implementation
// =============================================================================

#[async_trait]
impl ScriptRepository for SqliteRepository {
    async fn upsert_script(&self, approval: &ScriptApproval) -> Result<(), RepositoryError> {
        let approval = approval.clone();
        let approvers_json = approvers_to_json(&approval.approvers)?;

        self.with_conn("upsert_script", move |conn| {
            // A script already promoted through the bypass keeps `direct_prod`
            // so the stored row never shows production without staging or
            // bypass.
            conn.execute(
                "INSERT INTO approved_scripts (name, content, target_environment, pr_url,
                                               approvers_json, approved_at, direct_prod)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(name) DO UPDATE SET
                     content = excluded.content,
                     target_environment = excluded.target_environment,
                     pr_url = excluded.pr_url,
                     approvers_json = excluded.approvers_json,
                     approved_at = excluded.approved_at,
                     direct_prod = CASE
                         WHEN approved_scripts.production_executed = 1
                              AND approved_scripts.staging_executed = 0 THEN 1
                         ELSE excluded.direct_prod
                     END",
                params![
                    approval.name,
                    approval.content,
                    approval.target_environment.as_str(),
                    approval.pr_url,
                    approvers_json,
                    approval.approved_at,
                    approval.direct_prod,
                ],
            )
            .map_err(|e| RepositoryError::storage("upsert_script", e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn get_script(&self, name: &str) -> Result<Option<ApprovedScript>, RepositoryError> {
        let name = name.to_string();

        self.with_conn("get_script", move |conn| {
            conn.query_row(
                &format!("SELECT {SCRIPT_COLUMNS} FROM approved_scripts WHERE name = ?1"),
                params![name],
                ScriptRow::from_row,
            )
            .optional()
            .map_err(|e| RepositoryError::storage("get_script", e.to_string()))?
            .map(ScriptRow::into_script)
            .transpose()
        })
        .await
    }

    async fn list_scripts(&self) -> Result<Vec<ApprovedScript>, RepositoryError> {
        self.with_conn("list_scripts", |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {SCRIPT_COLUMNS} FROM approved_scripts
                     ORDER BY approved_at DESC, id DESC"
                ))
                .map_err(|e| RepositoryError::storage("list_scripts", e.to_string()))?;

            let rows = stmt
                .query_map([], ScriptRow::from_row)
                .map_err(|e| RepositoryError::storage("list_scripts", e.to_string()))?;

            let mut scripts = Vec::new();
            for row in rows {
                let row =
                    row.map_err(|e| RepositoryError::storage("list_scripts row", e.to_string()))?;
                scripts.push(row.into_script()?);
            }
            Ok(scripts)
        })
        .await
    }

    async fn script_names(&self) -> Result<HashSet<String>, RepositoryError> {
        self.with_conn("script_names", |conn| {
            let mut stmt = conn
                .prepare("SELECT name FROM approved_scripts")
                .map_err(|e| RepositoryError::storage("script_names", e.to_string()))?;

            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| RepositoryError::storage("script_names", e.to_string()))?
                .collect::<rusqlite::Result<HashSet<_>>>()
                .map_err(|e| RepositoryError::storage("script_names row", e.to_string()))?;
            Ok(names)
        })
        .await
    }

    async fn mark_executed(
        &self,
        name: &str,
        environment: Environment,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let name = name.to_string();

        self.with_conn("mark_executed", move |conn| {
            let sql = match environment {
                Environment::Staging => {
                    "UPDATE approved_scripts
                     SET staging_executed = 1, staging_executed_at = ?2
                     WHERE name = ?1"
                }
                Environment::Production => {
                    "UPDATE approved_scripts
                     SET production_executed = 1, production_executed_at = ?2
                     WHERE name = ?1 AND (staging_executed = 1 OR direct_prod = 1)"
                }
            };

            let changed = conn
                .execute(sql, params![name, at])
                .map_err(|e| RepositoryError::storage("mark_executed", e.to_string()))?;
            Ok(changed > 0)
        })
        .await
    }

    async fn append_execution_log(
        &self,
        record: &ExecutionRecord,
    ) -> Result<ExecutionLogEntry, RepositoryError> {
        let record = record.clone();
        let approvers_json = approvers_to_json(&record.approvers)?;
        let result_rows_json = record
            .result_rows
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RepositoryError::storage("serialize result rows", e.to_string()))?;
        let rows_affected = record
            .rows_affected
            .map(|n| u64_to_i64(n, "append_execution_log"))
            .transpose()?;
        let duration_ms = u64_to_i64(record.duration_ms, "append_execution_log")?;

        self.with_conn("append_execution_log", move |conn| {
            conn.execute(
                "INSERT INTO execution_logs (script_name, script_content, operator, environment,
                                             executed_at, status, rows_affected, error_message,
                                             duration_ms, result_rows_json, pr_url, approvers_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    record.script_name,
                    record.script_content,
                    record.operator,
                    record.environment.as_str(),
                    record.executed_at,
                    record.status.as_str(),
                    rows_affected,
                    record.error_message,
                    duration_ms,
                    result_rows_json,
                    record.pr_url,
                    approvers_json,
                ],
            )
            .map_err(|e| RepositoryError::storage("append_execution_log", e.to_string()))?;

            Ok(ExecutionLogEntry {
                id: conn.last_insert_rowid(),
                record,
            })
        })
        .await
    }

    async fn list_execution_logs(
        &self,
        script_name: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ExecutionLogEntry>, RepositoryError> {
        let script_name = script_name.map(str::to_string);
        let limit = usize_to_i64_limit(limit, "list_execution_logs")?;

        self.with_conn("list_execution_logs", move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {LOG_COLUMNS} FROM execution_logs
                     WHERE ?1 IS NULL OR script_name = ?1
                     ORDER BY id DESC
                     LIMIT ?2"
                ))
                .map_err(|e| RepositoryError::storage("list_execution_logs", e.to_string()))?;

            let rows = stmt
                .query_map(params![script_name, limit], LogRow::from_row)
                .map_err(|e| RepositoryError::storage("list_execution_logs", e.to_string()))?;

            let mut entries = Vec::new();
            for row in rows {
                let row = row.map_err(|e| {
                    RepositoryError::storage("list_execution_logs row", e.to_string())
                })?;
                entries.push(row.into_entry()?);
            }
            Ok(entries)
        })
        .await
    }

    async fn get_execution_log(
        &self,
        id: i64,
    ) -> Result<Option<ExecutionLogEntry>, RepositoryError> {
        self.with_conn("get_execution_log", move |conn| load_log_entry(conn, id))
            .await
    }
}
