use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode, Url};
use reqwest_middleware::{ClientWithMiddleware, RequestBuilder};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::{error, info, warn};

use crate::http_log::ApiLogMiddleware;

pub const DEFAULT_API_BASE: &str = "https://api.github.com";

const PER_PAGE: usize = 100;

/// Upper bound on pages fetched by one listing call.
const MAX_PAGES: u32 = 20;

/// A merged pull request as needed for reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergedPullRequest {
    pub number: u64,
    pub url: String,
    pub merged_at: DateTime<Utc>,
    pub merge_commit_sha: Option<String>,
    pub head_sha: String,
}

impl MergedPullRequest {
    /// Ref to read file contents at: the merge commit, else the PR head.
    pub fn content_ref(&self) -> &str {
        self.merge_commit_sha.as_deref().unwrap_or(&self.head_sha)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChangedFile {
    pub filename: String,
    pub status: String,
}

impl ChangedFile {
    pub fn is_removed(&self) -> bool {
        self.status == "removed"
    }
}

/// How submitted reviews turn into an approver set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ApprovalPolicy {
    /// Anyone who ever submitted an approving review counts.
    #[default]
    EverApproved,
    /// Each reviewer's latest approving, change-requesting or dismissed
    /// review decides. Plain comments are ignored.
    LatestReview,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Review {
    /// `None` for reviews by deleted accounts.
    pub user: Option<ReviewUser>,
    pub state: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReviewUser {
    pub login: String,
}

/// Fold reviews, oldest first, into the set of logins currently approving.
pub fn collect_approvers(reviews: &[Review], policy: ApprovalPolicy) -> BTreeSet<String> {
    match policy {
        ApprovalPolicy::EverApproved => reviews
            .iter()
            .filter(|review| review.state == "APPROVED")
            .filter_map(|review| review.user.as_ref().map(|u| u.login.clone()))
            .collect(),
        ApprovalPolicy::LatestReview => {
            let mut latest: HashMap<&str, bool> = HashMap::new();
            for review in reviews {
                let Some(user) = &review.user else {
                    continue;
                };
                match review.state.as_str() {
                    "APPROVED" => {
                        latest.insert(&user.login, true);
                    }
                    "CHANGES_REQUESTED" | "DISMISSED" => {
                        latest.insert(&user.login, false);
                    }
                    _ => {}
                }
            }
            latest
                .into_iter()
                .filter(|(_, approved)| *approved)
                .map(|(login, _)| login.to_string())
                .collect()
        }
    }
}

/// Read access to the code-review platform hosting the script repository.
///
/// An empty listing is `Ok(vec![])`; every transport or API failure is `Err`.
#[async_trait]
pub trait ReviewPlatform: Send + Sync {
    /// Merged pull requests, most recently merged first, at most `limit`.
    async fn list_merged_pull_requests(&self, limit: usize) -> Result<Vec<MergedPullRequest>>;

    async fn list_approvers(&self, pr_number: u64) -> Result<BTreeSet<String>>;

    async fn list_changed_files(&self, pr_number: u64) -> Result<Vec<ChangedFile>>;

    /// File content at `git_ref`, or `None` if the file does not exist there.
    async fn fetch_file_content(&self, path: &str, git_ref: &str) -> Result<Option<String>>;
}

#[derive(Debug, Deserialize)]
struct PullRequestListItem {
    number: u64,
    html_url: String,
    updated_at: DateTime<Utc>,
    merged_at: Option<DateTime<Utc>>,
    merge_commit_sha: Option<String>,
    head: PullRequestHead,
}

#[derive(Debug, Deserialize)]
struct PullRequestHead {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct FileContentsResponse {
    content: String,
    encoding: String,
}

#[derive(Clone)]
pub struct GitHubClient {
    client: ClientWithMiddleware,
    api_base: String,
    token: String,
    repo_owner: String,
    repo_name: String,
    approval_policy: ApprovalPolicy,
}

impl GitHubClient {
    pub fn new(
        token: String,
        repo_owner: String,
        repo_name: String,
        approval_policy: ApprovalPolicy,
    ) -> Result<Self> {
        Self::with_api_base(
            DEFAULT_API_BASE.to_string(),
            token,
            repo_owner,
            repo_name,
            approval_policy,
        )
    }

    /// Point the client at another API root (GitHub Enterprise, tests).
    pub fn with_api_base(
        api_base: String,
        token: String,
        repo_owner: String,
        repo_name: String,
        approval_policy: ApprovalPolicy,
    ) -> Result<Self> {
        Ok(Self {
            client: create_github_client()?,
            api_base: api_base.trim_end_matches('/').to_string(),
            token,
            repo_owner,
            repo_name,
            approval_policy,
        })
    }

    /// `{api_base}/repos/{owner}/{repo}/{segments...}` with each segment
    /// percent-encoded.
    fn repo_url<'a, I>(&self, segments: I) -> Result<Url>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut url = Url::parse(&self.api_base)
            .with_context(|| format!("Invalid GitHub API base URL: {}", self.api_base))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("GitHub API base URL cannot be a base: {}", self.api_base))?
            .pop_if_empty()
            .extend(["repos", self.repo_owner.as_str(), self.repo_name.as_str()])
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    async fn get_page<T: DeserializeOwned>(&self, url: Url, what: &str) -> Result<Vec<T>> {
        let response = self
            .authorized(self.client.get(url))
            .send()
            .await
            .with_context(|| format!("Failed to send {} request", what))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .context("Failed to read error response body")?;
            error!("GitHub API error fetching {}: {} - {}", what, status, error_text);
            return Err(anyhow!(
                "GitHub API error fetching {}: {} - {}",
                what,
                status,
                error_text
            ));
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse {} response", what))
    }

    /// Fetch every page of a listing endpoint.
    async fn get_all_pages<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        what: &str,
    ) -> Result<Vec<T>> {
        let mut items = Vec::new();

        for page in 1..=MAX_PAGES {
            let mut url = self.repo_url(segments.iter().copied())?;
            url.query_pairs_mut()
                .append_pair("per_page", &PER_PAGE.to_string())
                .append_pair("page", &page.to_string());

            let batch: Vec<T> = self.get_page(url, what).await?;
            let done = batch.len() < PER_PAGE;
            items.extend(batch);
            if done {
                return Ok(items);
            }
        }

        warn!(
            "Stopped paging {} after {} pages; results may be incomplete",
            what, MAX_PAGES
        );
        Ok(items)
    }
}

#[async_trait]
impl ReviewPlatform for GitHubClient {
    async fn list_merged_pull_requests(&self, limit: usize) -> Result<Vec<MergedPullRequest>> {
        info!(
            "Listing up to {} merged PRs in {}/{}",
            limit, self.repo_owner, self.repo_name
        );

        let mut merged = Vec::new();
        if limit == 0 {
            return Ok(merged);
        }

        for page in 1..=MAX_PAGES {
            let mut url = self.repo_url(["pulls"])?;
            url.query_pairs_mut()
                .append_pair("state", "closed")
                .append_pair("sort", "updated")
                .append_pair("direction", "desc")
                .append_pair("per_page", &PER_PAGE.to_string())
                .append_pair("page", &page.to_string());

            let batch: Vec<PullRequestListItem> = self.get_page(url, "pull requests").await?;
            let exhausted = batch.len() < PER_PAGE;
            let oldest_update = batch.last().map(|pr| pr.updated_at);

            merged.extend(batch.into_iter().filter_map(|pr| {
                Some(MergedPullRequest {
                    number: pr.number,
                    url: pr.html_url,
                    merged_at: pr.merged_at?,
                    merge_commit_sha: pr.merge_commit_sha,
                    head_sha: pr.head.sha,
                })
            }));

            if exhausted {
                break;
            }

            // A PR is updated no earlier than it is merged, so once the page
            // reaches back past our `limit`-th newest merge nothing later can
            // displace it.
            if merged.len() >= limit {
                merged.sort_by(|a, b| b.merged_at.cmp(&a.merged_at));
                if oldest_update.is_some_and(|updated| updated <= merged[limit - 1].merged_at) {
                    break;
                }
            }
        }

        merged.sort_by(|a, b| b.merged_at.cmp(&a.merged_at));
        merged.truncate(limit);

        info!("Found {} merged PRs", merged.len());
        Ok(merged)
    }

    async fn list_approvers(&self, pr_number: u64) -> Result<BTreeSet<String>> {
        info!("Fetching reviews for PR #{}", pr_number);

        let number = pr_number.to_string();
        let reviews: Vec<Review> = self
            .get_all_pages(&["pulls", number.as_str(), "reviews"], "reviews")
            .await?;

        let approvers = collect_approvers(&reviews, self.approval_policy);
        info!(
            "PR #{} has {} approver(s) from {} review(s)",
            pr_number,
            approvers.len(),
            reviews.len()
        );
        Ok(approvers)
    }

    async fn list_changed_files(&self, pr_number: u64) -> Result<Vec<ChangedFile>> {
        info!("Fetching changed files for PR #{}", pr_number);

        let number = pr_number.to_string();
        let files: Vec<ChangedFile> = self
            .get_all_pages(&["pulls", number.as_str(), "files"], "changed files")
            .await?;

        info!("PR #{} changed {} file(s)", pr_number, files.len());
        Ok(files)
    }

    async fn fetch_file_content(&self, path: &str, git_ref: &str) -> Result<Option<String>> {
        info!("Fetching file contents: {} at {}", path, git_ref);

        let mut url = self.repo_url(std::iter::once("contents").chain(path.split('/')))?;
        url.query_pairs_mut().append_pair("ref", git_ref);

        let response = self
            .authorized(self.client.get(url))
            .send()
            .await
            .context("Failed to send file contents request")?;

        if response.status() == StatusCode::NOT_FOUND {
            warn!("File {} not found at {}", path, git_ref);
            return Ok(None);
        }

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .context("Failed to read error response body")?;
            error!(
                "GitHub API error fetching file: {} - {}",
                status, error_text
            );
            return Err(anyhow!(
                "GitHub API error fetching file: {} - {}",
                status,
                error_text
            ));
        }

        let file_response: FileContentsResponse = response
            .json()
            .await
            .context("Failed to parse file contents response")?;

        if file_response.encoding != "base64" {
            return Err(anyhow!(
                "Unsupported content encoding '{}' for {} (file too large?)",
                file_response.encoding,
                path
            ));
        }

        let decoded = general_purpose::STANDARD
            .decode(file_response.content.replace('\n', ""))
            .context("Failed to decode base64 file content")?;
        let content_str = String::from_utf8(decoded).context("File content is not valid UTF-8")?;
        info!(
            "Successfully fetched file contents ({} bytes)",
            content_str.len()
        );
        Ok(Some(content_str))
    }
}

pub fn create_github_client() -> Result<ClientWithMiddleware> {
    use reqwest_middleware::ClientBuilder;

    let client = Client::builder()
        .user_agent(format!("sqlgate/{}", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to create HTTP client")?;

    Ok(ClientBuilder::new(client)
        .with(ApiLogMiddleware::new("github"))
        .build())
}
