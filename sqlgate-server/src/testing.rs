//! In-process stand-ins for external collaborators, for tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::Router;
use chrono::{DateTime, Duration, TimeZone, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlgate_core::Environment;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::execution::{Environments, ExecutionEngine, SqliteExecutor};
use crate::github::{ChangedFile, MergedPullRequest, ReviewPlatform};
use crate::reconcile::{IntakeSettings, Reconciler};
use crate::repository::InMemoryRepository;
use crate::{app, AppState};

struct FakePullRequest {
    pr: MergedPullRequest,
    approvers: BTreeSet<String>,
    files: Vec<ChangedFile>,
    /// Path to content at the merge commit.
    contents: HashMap<String, String>,
}

#[derive(Default)]
struct FakeState {
    pull_requests: Vec<FakePullRequest>,
    failing_approvers: HashSet<u64>,
    failing_files: HashSet<u64>,
    fail_listing: bool,
    fetches: usize,
}

/// A scripted `ReviewPlatform`.
///
/// Pull requests are merged in the order they are added, one minute apart.
#[derive(Default)]
pub struct FakePlatform {
    state: Mutex<FakeState>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn merge_time(index: usize) -> DateTime<Utc> {
        let base = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_else(Utc::now);
        base + Duration::minutes(i64::try_from(index).unwrap_or(i64::MAX / 60))
    }

    /// Register a merged pull request whose files were all added.
    pub fn add_merged_pull_request(
        &self,
        number: u64,
        approvers: &[&str],
        files: &[(&str, &str)],
    ) -> MergedPullRequest {
        let mut state = self.lock();
        let pr = MergedPullRequest {
            number,
            url: format!("https://github.com/acme/db/pull/{}", number),
            merged_at: Self::merge_time(state.pull_requests.len()),
            merge_commit_sha: Some(format!("merge{}", number)),
            head_sha: format!("head{}", number),
        };

        state.pull_requests.push(FakePullRequest {
            pr: pr.clone(),
            approvers: approvers.iter().map(|s| s.to_string()).collect(),
            files: files
                .iter()
                .map(|(path, _)| ChangedFile {
                    filename: path.to_string(),
                    status: "added".to_string(),
                })
                .collect(),
            contents: files
                .iter()
                .map(|(path, content)| (path.to_string(), content.to_string()))
                .collect(),
        });
        pr
    }

    /// List a file as changed in `number` without serving its content.
    pub fn add_changed_file_without_content(&self, number: u64, path: &str) {
        let mut state = self.lock();
        if let Some(entry) = state
            .pull_requests
            .iter_mut()
            .find(|entry| entry.pr.number == number)
        {
            entry.files.push(ChangedFile {
                filename: path.to_string(),
                status: "added".to_string(),
            });
        }
    }

    pub fn fail_approvers_for(&self, number: u64) {
        self.lock().failing_approvers.insert(number);
    }

    pub fn fail_changed_files_for(&self, number: u64) {
        self.lock().failing_files.insert(number);
    }

    pub fn fail_pull_request_listing(&self) {
        self.lock().fail_listing = true;
    }

    /// Number of `fetch_file_content` calls so far.
    pub fn fetch_count(&self) -> usize {
        self.lock().fetches
    }
}

#[async_trait]
impl ReviewPlatform for FakePlatform {
    async fn list_merged_pull_requests(&self, limit: usize) -> Result<Vec<MergedPullRequest>> {
        let state = self.lock();
        if state.fail_listing {
            return Err(anyhow!("GitHub API error: 502 Bad Gateway"));
        }
        let mut prs: Vec<_> = state.pull_requests.iter().map(|e| e.pr.clone()).collect();
        prs.sort_by(|a, b| b.merged_at.cmp(&a.merged_at));
        prs.truncate(limit);
        Ok(prs)
    }

    async fn list_approvers(&self, pr_number: u64) -> Result<BTreeSet<String>> {
        let state = self.lock();
        if state.failing_approvers.contains(&pr_number) {
            return Err(anyhow!("GitHub API error fetching reviews: 500"));
        }
        state
            .pull_requests
            .iter()
            .find(|e| e.pr.number == pr_number)
            .map(|e| e.approvers.clone())
            .ok_or_else(|| anyhow!("GitHub API error fetching reviews: 404 Not Found"))
    }

    async fn list_changed_files(&self, pr_number: u64) -> Result<Vec<ChangedFile>> {
        let state = self.lock();
        if state.failing_files.contains(&pr_number) {
            return Err(anyhow!("GitHub API error fetching changed files: 500"));
        }
        state
            .pull_requests
            .iter()
            .find(|e| e.pr.number == pr_number)
            .map(|e| e.files.clone())
            .ok_or_else(|| anyhow!("GitHub API error fetching changed files: 404 Not Found"))
    }

    async fn fetch_file_content(&self, path: &str, git_ref: &str) -> Result<Option<String>> {
        let mut state = self.lock();
        state.fetches += 1;
        Ok(state
            .pull_requests
            .iter()
            .find(|e| e.pr.merge_commit_sha.as_deref() == Some(git_ref))
            .and_then(|e| e.contents.get(path).cloned()))
    }
}

/// `X-Hub-Signature-256` header value for `body` under `secret`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC accepts keys of any length"),
    };
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// A fully wired application over a [`FakePlatform`], an in-memory registry
/// and in-memory SQLite databases for both environments.
pub struct TestApp {
    pub state: Arc<AppState>,
    pub platform: Arc<FakePlatform>,
    pub repository: Arc<InMemoryRepository>,
    pub staging: Arc<SqliteExecutor>,
    pub production: Arc<SqliteExecutor>,
}

impl TestApp {
    pub fn new(webhook_secret: Option<&str>, api_token: Option<&str>) -> Result<Self> {
        let platform = Arc::new(FakePlatform::new());
        let repository = Arc::new(InMemoryRepository::new());
        let staging = Arc::new(SqliteExecutor::open_in_memory()?);
        let production = Arc::new(SqliteExecutor::open_in_memory()?);

        let environments = Environments::new()
            .with(Environment::Staging, staging.clone())
            .with(Environment::Production, production.clone());

        let state = Arc::new(AppState {
            reconciler: Reconciler::new(
                platform.clone(),
                repository.clone(),
                IntakeSettings::default(),
            ),
            engine: ExecutionEngine::new(repository.clone(), environments),
            webhook_secret: webhook_secret.map(str::to_string),
            api_token: api_token.map(str::to_string),
            sync_pr_limit: 50,
        });

        Ok(Self {
            state,
            platform,
            repository,
            staging,
            production,
        })
    }

    pub fn router(&self) -> Router {
        app(self.state.clone())
    }
}
