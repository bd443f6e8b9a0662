use axum::{
    body::Bytes,
    extract::{Request, State},
    http::{HeaderMap, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::post,
    Extension, Router,
};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::github::MergedPullRequest;
use crate::reconcile::{FileOutcome, PullRequestOutcome};
use crate::AppState;

/// GitHub caps webhook payloads at 25 MB.
const MAX_WEBHOOK_BODY_BYTES: usize = 25 * 1024 * 1024;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const EVENT_HEADER: &str = "x-github-event";
pub const DELIVERY_HEADER: &str = "x-github-delivery";

#[derive(Debug, Deserialize)]
pub struct PullRequestEventPayload {
    pub action: Option<String>,
    pub pull_request: Option<PullRequestPayload>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PullRequestPayload {
    pub number: u64,
    pub html_url: String,
    #[serde(default)]
    pub merged: bool,
    pub merged_at: Option<DateTime<Utc>>,
    pub merge_commit_sha: Option<String>,
    pub head: PullRequestRef,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PullRequestRef {
    pub sha: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Processed,
    Ignored,
    InsufficientApprovals,
    NoQualifyingFiles,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub status: WebhookStatus,
    pub message: String,
    pub pr_number: Option<u64>,
    pub approvers: Vec<String>,
    pub files: Vec<FileOutcome>,
}

impl WebhookResponse {
    fn ignored(message: impl Into<String>, pr_number: Option<u64>) -> Self {
        Self {
            status: WebhookStatus::Ignored,
            message: message.into(),
            pr_number,
            approvers: Vec::new(),
            files: Vec::new(),
        }
    }
}

/// Identifies one delivery in logs: GitHub's delivery id, or a fresh UUID.
#[derive(Debug, Clone)]
pub struct DeliveryId(pub String);

type HmacSha256 = Hmac<Sha256>;

pub fn verify_github_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let Some(signature_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };

    let signature_bytes = match hex::decode(signature_hex) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };

    mac.update(payload);

    // Use constant-time verification
    mac.verify_slice(&signature_bytes).is_ok()
}

async fn verify_webhook_signature(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    // Runs in front of the method router, so unsupported methods are
    // answered here before any signature check.
    if request.method() != Method::POST {
        return Err(StatusCode::METHOD_NOT_ALLOWED);
    }

    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_WEBHOOK_BODY_BYTES)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    let delivery_id = DeliveryId(
        parts
            .headers
            .get(DELIVERY_HEADER)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
    );

    match &state.webhook_secret {
        Some(secret) => {
            let signature = parts
                .headers
                .get(SIGNATURE_HEADER)
                .and_then(|h| h.to_str().ok())
                .ok_or_else(|| {
                    warn!(delivery = %delivery_id.0, "Webhook without signature header");
                    StatusCode::UNAUTHORIZED
                })?;

            if !verify_github_signature(secret, &bytes, signature) {
                error!(delivery = %delivery_id.0, "Invalid webhook signature");
                return Err(StatusCode::UNAUTHORIZED);
            }
        }
        None => {
            warn!(
                delivery = %delivery_id.0,
                "GITHUB_WEBHOOK_SECRET is not configured; accepting unsigned webhook"
            );
        }
    }

    let mut new_request = Request::from_parts(parts, axum::body::Body::from(bytes));
    new_request.extensions_mut().insert(delivery_id);

    Ok(next.run(new_request).await)
}

fn bad_gateway(message: String) -> Response {
    (StatusCode::BAD_GATEWAY, Json(json!({ "error": message }))).into_response()
}

pub async fn github_webhook_handler(
    State(state): State<Arc<AppState>>,
    Extension(delivery_id): Extension<DeliveryId>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, Response> {
    let span = info_span!("webhook", delivery = %delivery_id.0);
    handle_delivery(state, headers, body).instrument(span).await
}

async fn handle_delivery(
    state: Arc<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, Response> {
    info!("Received webhook payload");

    let payload: PullRequestEventPayload = serde_json::from_slice(&body).map_err(|e| {
        warn!("Malformed webhook payload: {}", e);
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("malformed payload: {}", e) })),
        )
            .into_response()
    })?;

    if let Some(event) = headers.get(EVENT_HEADER).and_then(|h| h.to_str().ok()) {
        if event != "pull_request" {
            info!("Ignoring {} event", event);
            return Ok(Json(WebhookResponse::ignored(
                format!("event '{}' is not handled", event),
                None,
            )));
        }
    }

    let Some(pr) = payload.pull_request else {
        info!("Ignoring event without pull request");
        return Ok(Json(WebhookResponse::ignored(
            "payload has no pull request",
            None,
        )));
    };

    if payload.action.as_deref() != Some("closed") || !pr.merged {
        info!(
            "Ignoring PR #{} event: action {:?}, merged {}",
            pr.number, payload.action, pr.merged
        );
        return Ok(Json(WebhookResponse::ignored(
            "not a merged pull request",
            Some(pr.number),
        )));
    }

    let merged = MergedPullRequest {
        number: pr.number,
        url: pr.html_url,
        merged_at: pr.merged_at.unwrap_or_else(Utc::now),
        merge_commit_sha: pr.merge_commit_sha,
        head_sha: pr.head.sha,
    };

    info!("Processing merged PR #{}", merged.number);

    let outcome = state
        .reconciler
        .process_merged_pull_request(&merged)
        .await
        .map_err(|e| {
            error!("Failed to process PR #{}: {:#}", merged.number, e);
            bad_gateway(format!("{:#}", e))
        })?;

    let response = match outcome {
        PullRequestOutcome::InsufficientApprovals { approvers } => WebhookResponse {
            status: WebhookStatus::InsufficientApprovals,
            message: format!(
                "{} approval(s), {} required",
                approvers.len(),
                state.reconciler.settings().min_approvals
            ),
            pr_number: Some(merged.number),
            approvers: approvers.into_iter().collect(),
            files: Vec::new(),
        },
        PullRequestOutcome::NoQualifyingFiles { approvers } => WebhookResponse {
            status: WebhookStatus::NoQualifyingFiles,
            message: "no script files changed".to_string(),
            pr_number: Some(merged.number),
            approvers: approvers.into_iter().collect(),
            files: Vec::new(),
        },
        PullRequestOutcome::Processed { approvers, files } => {
            let stored = files.iter().filter(|f| f.success).count();
            WebhookResponse {
                status: WebhookStatus::Processed,
                message: format!("stored {} of {} script(s)", stored, files.len()),
                pr_number: Some(merged.number),
                approvers: approvers.into_iter().collect(),
                files,
            }
        }
    };

    Ok(Json(response))
}

pub fn webhook_router(middleware_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/webhook", post(github_webhook_handler))
        .route_layer(middleware::from_fn_with_state(
            middleware_state,
            verify_webhook_signature,
        ))
}
