//! Webhook intake through to audited execution, over the public HTTP surface.

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use sqlgate_server::execution::SqlExecutor;
use sqlgate_server::testing::{sign, TestApp};
use sqlgate_server::ScriptRepository;

const SECRET: &str = "webhook-secret";
const TOKEN: &str = "operator-token";

async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.router().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

fn merged_webhook(number: u64) -> Request<Body> {
    let body = json!({
        "action": "closed",
        "number": number,
        "pull_request": {
            "number": number,
            "html_url": format!("https://github.com/acme/db/pull/{}", number),
            "merged": true,
            "merged_at": "2024-01-01T00:00:00Z",
            "merge_commit_sha": format!("merge{}", number),
            "head": { "sha": format!("head{}", number) }
        }
    })
    .to_string();

    Request::builder()
        .method(Method::POST)
        .uri("/webhook")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-github-event", "pull_request")
        .header("x-hub-signature-256", sign(SECRET, body.as_bytes()))
        .body(Body::from(body))
        .unwrap()
}

fn api(method: Method, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN));
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

fn execute(name: &str, environment: &str) -> Request<Body> {
    api(
        Method::POST,
        &format!("/api/scripts/{}/execute", name),
        Some(json!({ "environment": environment, "operator": "carol" })),
    )
}

#[tokio::test]
async fn direct_prod_script_runs_on_production_first() {
    let app = TestApp::new(Some(SECRET), Some(TOKEN)).unwrap();
    app.production
        .run("CREATE TABLE flags (name TEXT PRIMARY KEY, enabled INTEGER)")
        .await
        .unwrap();
    app.production
        .run("INSERT INTO flags VALUES ('beta', 0), ('gamma', 0)")
        .await
        .unwrap();

    app.platform.add_merged_pull_request(
        12,
        &["alice", "bob"],
        &[(
            "migrations/enable_flags.sql",
            "-- Author: alice\n-- Target: production\n-- DirectProd\nUPDATE flags SET enabled = 1;",
        )],
    );

    let (status, json) = send(&app, merged_webhook(12)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "processed");
    assert_eq!(json["files"][0]["direct_prod"], true);
    assert_eq!(json["files"][0]["target_environment"], "production");

    let (status, json) = send(&app, execute("enable_flags", "production")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "success");
    assert_eq!(json["rows_affected"], 2);

    let script = app
        .repository
        .get_script("enable_flags")
        .await
        .unwrap()
        .unwrap();
    assert!(script.flags.production_executed);
    assert!(!script.flags.staging_executed);
    assert!(script.production_executed_at.is_some());

    let (_, logs) = send(&app, api(Method::GET, "/api/logs", None)).await;
    let logs = logs["logs"].as_array().unwrap().clone();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0]["environment"], "production");
    assert_eq!(logs[0]["pr_url"], "https://github.com/acme/db/pull/12");
    assert_eq!(logs[0]["approvers"], json!(["alice", "bob"]));
}

#[tokio::test]
async fn script_without_bypass_must_pass_staging() {
    let app = TestApp::new(Some(SECRET), Some(TOKEN)).unwrap();
    app.platform.add_merged_pull_request(
        13,
        &["alice", "bob"],
        &[("report.sql", "-- Target: production\nSELECT 1 AS one;")],
    );

    let (status, _) = send(&app, merged_webhook(13)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&app, execute("report", "production")).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, json) = send(&app, execute("report", "staging")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["result_rows"], json!([{ "one": 1 }]));

    let (status, json) = send(&app, execute("report", "production")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "success");

    let (_, script) = send(&app, api(Method::GET, "/api/scripts/report", None)).await;
    assert_eq!(script["promotion_state"], "production_executed");

    let (_, logs) = send(&app, api(Method::GET, "/api/scripts/report/logs", None)).await;
    assert_eq!(logs["logs"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn pull_request_with_one_approval_registers_nothing() {
    let app = TestApp::new(Some(SECRET), Some(TOKEN)).unwrap();
    app.platform
        .add_merged_pull_request(14, &["alice"], &[("drop_all.sql", "DROP TABLE users;")]);

    let (status, json) = send(&app, merged_webhook(14)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "insufficient_approvals");
    assert_eq!(json["approvers"], json!(["alice"]));

    assert!(app
        .repository
        .get_script("drop_all")
        .await
        .unwrap()
        .is_none());
    assert_eq!(app.platform.fetch_count(), 0);

    let (status, _) = send(&app, execute("drop_all", "staging")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn second_sync_skips_everything() {
    let app = TestApp::new(Some(SECRET), Some(TOKEN)).unwrap();
    app.platform.add_merged_pull_request(
        20,
        &["alice", "bob"],
        &[("a.sql", "SELECT 1;"), ("b.sql", "SELECT 2;")],
    );
    app.platform
        .add_merged_pull_request(21, &["alice", "carol"], &[("c.sql", "SELECT 3;")]);

    let (status, first) = send(&app, api(Method::POST, "/api/sync", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first, json!({ "synced": 3, "skipped": 0, "errors": 0 }));

    let fetches = app.platform.fetch_count();

    let (status, second) = send(&app, api(Method::POST, "/api/sync", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second, json!({ "synced": 0, "skipped": 3, "errors": 0 }));
    assert_eq!(app.platform.fetch_count(), fetches);

    let (_, scripts) = send(&app, api(Method::GET, "/api/scripts", None)).await;
    assert_eq!(scripts["scripts"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn webhook_after_sync_refreshes_without_losing_state() {
    let app = TestApp::new(Some(SECRET), Some(TOKEN)).unwrap();
    app.platform
        .add_merged_pull_request(30, &["alice", "bob"], &[("refresh.sql", "SELECT 1;")]);

    send(&app, api(Method::POST, "/api/sync", None)).await;
    let (status, _) = send(&app, execute("refresh", "staging")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, json) = send(&app, merged_webhook(30)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "processed");

    let (_, script) = send(&app, api(Method::GET, "/api/scripts/refresh", None)).await;
    assert_eq!(script["staging_executed"], true);
    assert_eq!(script["promotion_state"], "staging_executed");
}
