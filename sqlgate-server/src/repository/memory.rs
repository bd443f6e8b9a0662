//! In-memory implementation of `ScriptRepository`.
//!
//! All state is lost on restart. Used by tests and by anything that wants the
//! registry semantics without a database file.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlgate_core::{Environment, PromotionFlags};
use tokio::sync::RwLock;

use super::{
    ApprovedScript, ExecutionLogEntry, ExecutionRecord, RepositoryError, ScriptApproval,
    ScriptRepository,
};

/// Registry in a `HashMap`, audit log in a `Vec`, each behind a `RwLock`.
pub struct InMemoryRepository {
    scripts: RwLock<HashMap<String, ApprovedScript>>,
    logs: RwLock<Vec<ExecutionLogEntry>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            scripts: RwLock::new(HashMap::new()),
            logs: RwLock::new(Vec::new()),
        }
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScriptRepository for InMemoryRepository {
    async fn upsert_script(&self, approval: &ScriptApproval) -> Result<(), RepositoryError> {
        let mut scripts = self.scripts.write().await;

        match scripts.get_mut(&approval.name) {
            Some(existing) => {
                let keep_bypass =
                    existing.flags.production_executed && !existing.flags.staging_executed;
                existing.content = approval.content.clone();
                existing.target_environment = approval.target_environment;
                existing.pr_url = approval.pr_url.clone();
                existing.approvers = approval.approvers.clone();
                existing.approved_at = approval.approved_at;
                existing.flags.direct_prod = approval.direct_prod || keep_bypass;
            }
            None => {
                scripts.insert(
                    approval.name.clone(),
                    ApprovedScript {
                        name: approval.name.clone(),
                        content: approval.content.clone(),
                        target_environment: approval.target_environment,
                        pr_url: approval.pr_url.clone(),
                        approvers: approval.approvers.clone(),
                        approved_at: approval.approved_at,
                        flags: PromotionFlags {
                            direct_prod: approval.direct_prod,
                            ..PromotionFlags::default()
                        },
                        staging_executed_at: None,
                        production_executed_at: None,
                    },
                );
            }
        }
        Ok(())
    }

    async fn get_script(&self, name: &str) -> Result<Option<ApprovedScript>, RepositoryError> {
        let scripts = self.scripts.read().await;
        Ok(scripts.get(name).cloned())
    }

    async fn list_scripts(&self) -> Result<Vec<ApprovedScript>, RepositoryError> {
        let scripts = self.scripts.read().await;
        let mut list: Vec<_> = scripts.values().cloned().collect();
        list.sort_by(|a, b| {
            b.approved_at
                .cmp(&a.approved_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(list)
    }

    async fn script_names(&self) -> Result<HashSet<String>, RepositoryError> {
        let scripts = self.scripts.read().await;
        Ok(scripts.keys().cloned().collect())
    }

    async fn mark_executed(
        &self,
        name: &str,
        environment: Environment,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut scripts = self.scripts.write().await;
        let Some(script) = scripts.get_mut(name) else {
            return Ok(false);
        };

        if script.flags.authorize(environment).is_err() {
            return Ok(false);
        }

        script.flags = script.flags.record_success(environment);
        match environment {
            Environment::Staging => script.staging_executed_at = Some(at),
            Environment::Production => script.production_executed_at = Some(at),
        }
        Ok(true)
    }

    async fn append_execution_log(
        &self,
        record: &ExecutionRecord,
    ) -> Result<ExecutionLogEntry, RepositoryError> {
        let mut logs = self.logs.write().await;
        let id = i64::try_from(logs.len())
            .map_err(|_| RepositoryError::storage("append_execution_log", "log id overflow"))?
            + 1;
        let entry = ExecutionLogEntry {
            id,
            record: record.clone(),
        };
        logs.push(entry.clone());
        Ok(entry)
    }

    async fn list_execution_logs(
        &self,
        script_name: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ExecutionLogEntry>, RepositoryError> {
        let logs = self.logs.read().await;
        Ok(logs
            .iter()
            .rev()
            .filter(|entry| script_name.map_or(true, |name| entry.record.script_name == name))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_execution_log(
        &self,
        id: i64,
    ) -> Result<Option<ExecutionLogEntry>, RepositoryError> {
        let logs = self.logs.read().await;
        Ok(logs.iter().find(|entry| entry.id == id).cloned())
    }
}
