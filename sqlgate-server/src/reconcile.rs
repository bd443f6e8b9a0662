//! Turning merged pull requests into registry rows.
//!
//! Two entry points share one upsert primitive:
//!
//! - [`Reconciler::process_merged_pull_request`] handles a single merge
//!   delivered by webhook and refreshes scripts that already exist.
//! - [`Reconciler::full_sync`] walks recent merges and only backfills scripts
//!   the registry does not know yet. The set of known names is loaded once per
//!   call and updated as each script is stored, so two pull requests touching
//!   the same name in one pass insert it only once.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlgate_core::{parse_metadata, Environment};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::github::{ChangedFile, MergedPullRequest, ReviewPlatform};
use crate::repository::{ScriptApproval, ScriptRepository};

/// Rules deciding which merges and files are taken in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntakeSettings {
    pub min_approvals: usize,
    /// Lower-cased, with leading dot.
    pub script_extensions: Vec<String>,
}

impl Default for IntakeSettings {
    fn default() -> Self {
        Self {
            min_approvals: 2,
            script_extensions: vec![".sql".to_string()],
        }
    }
}

impl IntakeSettings {
    /// Script name for a repository path, or `None` if the extension is not
    /// a script extension. `migrations/fix_totals.sql` becomes `fix_totals`.
    pub fn script_name(&self, path: &str) -> Option<String> {
        let file_name = Path::new(path).file_name()?.to_str()?;
        let lower = file_name.to_lowercase();

        self.script_extensions.iter().find_map(|ext| {
            if lower.len() > ext.len() && lower.ends_with(ext.as_str()) {
                let stem = &file_name[..file_name.len() - ext.len()];
                Some(stem.to_string())
            } else {
                None
            }
        })
    }

    /// Changed files that are scripts and were not removed, with their names.
    pub fn qualifying_files<'a>(&self, files: &'a [ChangedFile]) -> Vec<(&'a ChangedFile, String)> {
        files
            .iter()
            .filter(|file| !file.is_removed())
            .filter_map(|file| self.script_name(&file.filename).map(|name| (file, name)))
            .collect()
    }
}

/// Result of taking in one changed script file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOutcome {
    pub filename: String,
    pub script_name: String,
    pub success: bool,
    pub target_environment: Option<Environment>,
    pub direct_prod: bool,
    pub error: Option<String>,
}

impl FileOutcome {
    fn failed(filename: &str, script_name: &str, error: String) -> Self {
        Self {
            filename: filename.to_string(),
            script_name: script_name.to_string(),
            success: false,
            target_environment: None,
            direct_prod: false,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullRequestOutcome {
    InsufficientApprovals { approvers: BTreeSet<String> },
    NoQualifyingFiles { approvers: BTreeSet<String> },
    Processed {
        approvers: BTreeSet<String>,
        files: Vec<FileOutcome>,
    },
}

/// Tallies for one full sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub synced: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Store one approval. Failures are logged and reported as `false`.
pub async fn upsert_approved_script(
    repository: &dyn ScriptRepository,
    approval: &ScriptApproval,
) -> bool {
    match repository.upsert_script(approval).await {
        Ok(()) => {
            info!(
                "Registered script '{}' from {} (target: {}, direct_prod: {})",
                approval.name, approval.pr_url, approval.target_environment, approval.direct_prod
            );
            true
        }
        Err(e) => {
            error!("Failed to store script '{}': {}", approval.name, e);
            false
        }
    }
}

#[derive(Clone)]
pub struct Reconciler {
    platform: Arc<dyn ReviewPlatform>,
    repository: Arc<dyn ScriptRepository>,
    settings: IntakeSettings,
}

impl Reconciler {
    pub fn new(
        platform: Arc<dyn ReviewPlatform>,
        repository: Arc<dyn ScriptRepository>,
        settings: IntakeSettings,
    ) -> Self {
        Self {
            platform,
            repository,
            settings,
        }
    }

    pub fn settings(&self) -> &IntakeSettings {
        &self.settings
    }

    /// Take in every qualifying script of one merged pull request.
    ///
    /// Errors only when approvers or changed files cannot be listed. A file
    /// that cannot be fetched or stored is reported in its [`FileOutcome`]
    /// and the remaining files are still processed.
    pub async fn process_merged_pull_request(
        &self,
        pr: &MergedPullRequest,
    ) -> Result<PullRequestOutcome> {
        let approvers = self
            .platform
            .list_approvers(pr.number)
            .await
            .with_context(|| format!("Failed to list approvers for PR #{}", pr.number))?;

        if approvers.len() < self.settings.min_approvals {
            info!(
                "PR #{} has {} approver(s), {} required; skipping",
                pr.number,
                approvers.len(),
                self.settings.min_approvals
            );
            return Ok(PullRequestOutcome::InsufficientApprovals { approvers });
        }

        let files = self
            .platform
            .list_changed_files(pr.number)
            .await
            .with_context(|| format!("Failed to list changed files for PR #{}", pr.number))?;

        let qualifying = self.settings.qualifying_files(&files);
        if qualifying.is_empty() {
            info!("PR #{} changed no script files", pr.number);
            return Ok(PullRequestOutcome::NoQualifyingFiles { approvers });
        }

        let mut outcomes = Vec::with_capacity(qualifying.len());
        for (file, script_name) in qualifying {
            outcomes.push(
                self.process_file(pr, &approvers, &file.filename, &script_name)
                    .await,
            );
        }

        let stored = outcomes.iter().filter(|o| o.success).count();
        info!(
            "PR #{}: stored {}/{} script(s)",
            pr.number,
            stored,
            outcomes.len()
        );

        Ok(PullRequestOutcome::Processed {
            approvers,
            files: outcomes,
        })
    }

    /// Backfill scripts from the `limit` most recently merged pull requests.
    ///
    /// Fails only if the merged pull requests or the known script names cannot
    /// be listed; per-PR and per-file failures are counted in `errors`.
    pub async fn full_sync(&self, limit: usize) -> Result<SyncReport> {
        let prs = self
            .platform
            .list_merged_pull_requests(limit)
            .await
            .context("Failed to list merged pull requests")?;

        let mut known = self
            .repository
            .script_names()
            .await
            .context("Failed to load known script names")?;

        info!(
            "Full sync: {} merged PR(s), {} known script(s)",
            prs.len(),
            known.len()
        );

        let mut report = SyncReport::default();

        for pr in &prs {
            let approvers = match self.platform.list_approvers(pr.number).await {
                Ok(approvers) => approvers,
                Err(e) => {
                    warn!("Failed to list approvers for PR #{}: {:#}", pr.number, e);
                    report.errors += 1;
                    continue;
                }
            };

            if approvers.len() < self.settings.min_approvals {
                report.skipped += 1;
                continue;
            }

            let files = match self.platform.list_changed_files(pr.number).await {
                Ok(files) => files,
                Err(e) => {
                    warn!("Failed to list changed files for PR #{}: {:#}", pr.number, e);
                    report.errors += 1;
                    continue;
                }
            };

            let qualifying = self.settings.qualifying_files(&files);
            if qualifying.is_empty() {
                report.skipped += 1;
                continue;
            }

            for (file, script_name) in qualifying {
                if known.contains(&script_name) {
                    report.skipped += 1;
                    continue;
                }

                let outcome = self
                    .process_file(pr, &approvers, &file.filename, &script_name)
                    .await;
                if outcome.success {
                    report.synced += 1;
                    known.insert(script_name);
                } else {
                    report.errors += 1;
                }
            }
        }

        info!(
            "Full sync finished: {} synced, {} skipped, {} errors",
            report.synced, report.skipped, report.errors
        );
        Ok(report)
    }

    async fn process_file(
        &self,
        pr: &MergedPullRequest,
        approvers: &BTreeSet<String>,
        filename: &str,
        script_name: &str,
    ) -> FileOutcome {
        let content = match self.fetch_script(pr, filename).await {
            Ok(Some(content)) => content,
            Ok(None) => {
                warn!("Script {} not found in PR #{}", filename, pr.number);
                return FileOutcome::failed(
                    filename,
                    script_name,
                    format!("file not found at {}", pr.content_ref()),
                );
            }
            Err(e) => {
                warn!("Failed to fetch {} for PR #{}: {:#}", filename, pr.number, e);
                return FileOutcome::failed(filename, script_name, format!("{:#}", e));
            }
        };

        let metadata = parse_metadata(&content);
        let target_environment = metadata.target_or_default();
        let approval = ScriptApproval {
            name: script_name.to_string(),
            content,
            target_environment,
            pr_url: pr.url.clone(),
            approvers: approvers.clone(),
            approved_at: Utc::now(),
            direct_prod: metadata.direct_prod,
        };

        if upsert_approved_script(self.repository.as_ref(), &approval).await {
            FileOutcome {
                filename: filename.to_string(),
                script_name: script_name.to_string(),
                success: true,
                target_environment: Some(target_environment),
                direct_prod: metadata.direct_prod,
                error: None,
            }
        } else {
            FileOutcome::failed(filename, script_name, "failed to store script".to_string())
        }
    }

    /// Content at the merge commit, retrying at the head commit if the file is
    /// missing there.
    async fn fetch_script(&self, pr: &MergedPullRequest, filename: &str) -> Result<Option<String>> {
        let git_ref = pr.content_ref();
        let content = self.platform.fetch_file_content(filename, git_ref).await?;
        if content.is_none() && git_ref != pr.head_sha {
            return self.platform.fetch_file_content(filename, &pr.head_sha).await;
        }
        Ok(content)
    }
}

/// Run [`Reconciler::full_sync`] every `period`.
pub async fn sync_polling_loop(reconciler: Reconciler, period: Duration, limit: usize) {
    let mut interval = interval(period);

    loop {
        interval.tick().await;

        if let Err(e) = reconciler.full_sync(limit).await {
            error!("Periodic sync failed: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRepository;
    use crate::testing::FakePlatform;

    fn settings() -> IntakeSettings {
        IntakeSettings {
            min_approvals: 2,
            script_extensions: vec![".sql".to_string(), ".psql".to_string()],
        }
    }

    fn changed(filename: &str, status: &str) -> ChangedFile {
        ChangedFile {
            filename: filename.to_string(),
            status: status.to_string(),
        }
    }

    fn reconciler(platform: &Arc<FakePlatform>) -> (Reconciler, Arc<InMemoryRepository>) {
        let repository = Arc::new(InMemoryRepository::new());
        let reconciler = Reconciler::new(platform.clone(), repository.clone(), settings());
        (reconciler, repository)
    }

    #[test]
    fn test_script_name_strips_recognized_extension() {
        let settings = settings();
        assert_eq!(
            settings.script_name("migrations/fix_totals.sql").as_deref(),
            Some("fix_totals")
        );
        assert_eq!(settings.script_name("Report.PSQL").as_deref(), Some("Report"));
        assert_eq!(settings.script_name("a/b/c.v2.sql").as_deref(), Some("c.v2"));
        assert_eq!(settings.script_name("README.md"), None);
        assert_eq!(settings.script_name("dir/.sql"), None);
        assert_eq!(settings.script_name("notsql"), None);
    }

    #[test]
    fn test_removed_files_do_not_qualify() {
        let files = vec![
            changed("a.sql", "added"),
            changed("b.sql", "removed"),
            changed("c.sql", "modified"),
            changed("d.txt", "added"),
        ];
        let names: Vec<String> = settings()
            .qualifying_files(&files)
            .into_iter()
            .map(|(_, name)| name)
            .collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_insufficient_approvals_leaves_registry_unchanged() {
        let platform = Arc::new(FakePlatform::new());
        let pr = platform.add_merged_pull_request(1, &["alice"], &[("foo.sql", "SELECT 1;")]);
        let (reconciler, repository) = reconciler(&platform);

        let outcome = reconciler.process_merged_pull_request(&pr).await.unwrap();

        assert!(matches!(
            outcome,
            PullRequestOutcome::InsufficientApprovals { .. }
        ));
        assert!(repository.list_scripts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_processes_scripts_and_parses_metadata() {
        let platform = Arc::new(FakePlatform::new());
        let pr = platform.add_merged_pull_request(
            1,
            &["alice", "bob"],
            &[
                ("db/foo.sql", "-- DirectProd\n-- Target: production\nSELECT 1;"),
                ("db/bar.sql", "UPDATE t SET x = 1;"),
                ("notes.md", "# hi"),
            ],
        );
        let (reconciler, repository) = reconciler(&platform);

        let outcome = reconciler.process_merged_pull_request(&pr).await.unwrap();
        let PullRequestOutcome::Processed { approvers, files } = outcome else {
            panic!("expected processed outcome");
        };
        assert_eq!(approvers.len(), 2);
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.success));

        let foo = repository.get_script("foo").await.unwrap().unwrap();
        assert!(foo.flags.direct_prod);
        assert_eq!(foo.target_environment, Environment::Production);
        assert_eq!(foo.pr_url, pr.url);

        let bar = repository.get_script("bar").await.unwrap().unwrap();
        assert!(!bar.flags.direct_prod);
        assert_eq!(bar.target_environment, Environment::Staging);
    }

    #[tokio::test]
    async fn test_webhook_replay_keeps_one_row_and_refreshes() {
        let platform = Arc::new(FakePlatform::new());
        let first = platform.add_merged_pull_request(1, &["a", "b"], &[("foo.sql", "SELECT 1;")]);
        let second = platform.add_merged_pull_request(2, &["a", "b"], &[("foo.sql", "SELECT 2;")]);
        let (reconciler, repository) = reconciler(&platform);

        reconciler.process_merged_pull_request(&first).await.unwrap();
        reconciler.process_merged_pull_request(&first).await.unwrap();
        reconciler.process_merged_pull_request(&second).await.unwrap();

        let scripts = repository.list_scripts().await.unwrap();
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts[0].content, "SELECT 2;");
        assert_eq!(scripts[0].pr_url, second.url);
    }

    #[tokio::test]
    async fn test_missing_file_is_per_file_failure() {
        let platform = Arc::new(FakePlatform::new());
        let pr = platform.add_merged_pull_request(1, &["a", "b"], &[("ok.sql", "SELECT 1;")]);
        platform.add_changed_file_without_content(1, "gone.sql");
        let (reconciler, repository) = reconciler(&platform);

        let outcome = reconciler.process_merged_pull_request(&pr).await.unwrap();
        let PullRequestOutcome::Processed { files, .. } = outcome else {
            panic!("expected processed outcome");
        };
        let gone = files.iter().find(|f| f.script_name == "gone").unwrap();
        assert!(!gone.success);
        assert!(gone.error.is_some());
        assert!(repository.get_script("ok").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_approver_listing_failure_is_error() {
        let platform = Arc::new(FakePlatform::new());
        let pr = platform.add_merged_pull_request(1, &["a", "b"], &[("foo.sql", "SELECT 1;")]);
        platform.fail_approvers_for(1);
        let (reconciler, _) = reconciler(&platform);

        assert!(reconciler.process_merged_pull_request(&pr).await.is_err());
    }

    #[tokio::test]
    async fn test_full_sync_twice_is_idempotent() {
        let platform = Arc::new(FakePlatform::new());
        platform.add_merged_pull_request(1, &["a", "b"], &[("one.sql", "SELECT 1;")]);
        platform.add_merged_pull_request(
            2,
            &["a", "b", "c"],
            &[("two.sql", "SELECT 2;"), ("three.sql", "SELECT 3;")],
        );
        platform.add_merged_pull_request(3, &["a"], &[("four.sql", "SELECT 4;")]);
        let (reconciler, repository) = reconciler(&platform);

        let first = reconciler.full_sync(50).await.unwrap();
        assert_eq!(
            first,
            SyncReport {
                synced: 3,
                skipped: 1,
                errors: 0
            }
        );

        let second = reconciler.full_sync(50).await.unwrap();
        assert_eq!(
            second,
            SyncReport {
                synced: 0,
                skipped: 4,
                errors: 0
            }
        );
        assert_eq!(repository.list_scripts().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_full_sync_does_not_refresh_known_scripts() {
        let platform = Arc::new(FakePlatform::new());
        let (reconciler, repository) = reconciler(&platform);
        let old = platform.add_merged_pull_request(1, &["a", "b"], &[("foo.sql", "SELECT 1;")]);
        reconciler.process_merged_pull_request(&old).await.unwrap();

        platform.add_merged_pull_request(2, &["a", "b"], &[("foo.sql", "SELECT 2;")]);
        let report = reconciler.full_sync(50).await.unwrap();

        assert_eq!(report.synced, 0);
        let foo = repository.get_script("foo").await.unwrap().unwrap();
        assert_eq!(foo.content, "SELECT 1;");
    }

    #[tokio::test]
    async fn test_full_sync_same_name_in_two_prs_inserted_once() {
        let platform = Arc::new(FakePlatform::new());
        platform.add_merged_pull_request(1, &["a", "b"], &[("x/dup.sql", "SELECT 'old';")]);
        platform.add_merged_pull_request(2, &["a", "b"], &[("y/dup.sql", "SELECT 'new';")]);
        let (reconciler, repository) = reconciler(&platform);

        let report = reconciler.full_sync(50).await.unwrap();

        assert_eq!(report.synced, 1);
        assert_eq!(report.skipped, 1);
        // Newest merge wins since PRs are walked newest first.
        let dup = repository.get_script("dup").await.unwrap().unwrap();
        assert_eq!(dup.content, "SELECT 'new';");
    }

    #[tokio::test]
    async fn test_full_sync_counts_errors_and_continues() {
        let platform = Arc::new(FakePlatform::new());
        platform.add_merged_pull_request(1, &["a", "b"], &[("ok.sql", "SELECT 1;")]);
        platform.add_merged_pull_request(2, &["a", "b"], &[("other.sql", "SELECT 2;")]);
        platform.add_changed_file_without_content(2, "missing.sql");
        platform.add_merged_pull_request(3, &["a", "b"], &[("later.sql", "SELECT 3;")]);
        platform.fail_approvers_for(3);
        let (reconciler, repository) = reconciler(&platform);

        let report = reconciler.full_sync(50).await.unwrap();

        assert_eq!(
            report,
            SyncReport {
                synced: 2,
                skipped: 0,
                errors: 2
            }
        );
        assert!(repository.get_script("ok").await.unwrap().is_some());
        assert!(repository.get_script("later").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_full_sync_fails_when_listing_fails() {
        let platform = Arc::new(FakePlatform::new());
        platform.fail_pull_request_listing();
        let (reconciler, _) = reconciler(&platform);

        assert!(reconciler.full_sync(50).await.is_err());
    }

    #[tokio::test]
    async fn test_full_sync_respects_limit() {
        let platform = Arc::new(FakePlatform::new());
        platform.add_merged_pull_request(1, &["a", "b"], &[("old.sql", "SELECT 1;")]);
        platform.add_merged_pull_request(2, &["a", "b"], &[("new.sql", "SELECT 2;")]);
        let (reconciler, repository) = reconciler(&platform);

        let report = reconciler.full_sync(1).await.unwrap();

        assert_eq!(report.synced, 1);
        assert!(repository.get_script("new").await.unwrap().is_some());
        assert!(repository.get_script("old").await.unwrap().is_none());
    }
}
