use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use sqlgate_core::{classify, parse_metadata, Environment, StatementKind};
use std::fs;
use std::path::PathBuf;

/// sqlgate: review-gated SQL promotion
#[derive(Parser, Debug)]
#[command(name = "sqlgate")]
#[command(about = "Inspect, sync and execute approved SQL scripts", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show how a local script file would be registered
    Check(CheckArgs),
    /// Register approved scripts from recently merged pull requests
    Sync(RemoteArgs),
    /// List registered scripts
    Scripts(RemoteArgs),
    /// Show one registered script
    Show(ShowArgs),
    /// Run a registered script against an environment
    Execute(ExecuteArgs),
    /// Show the execution audit log
    Logs(LogsArgs),
}

#[derive(Args, Debug)]
struct RemoteArgs {
    /// Base URL of the sqlgate server
    #[arg(long, env = "SQLGATE_SERVER", default_value = "http://localhost:3000")]
    server: String,

    /// Operator API token
    #[arg(long, env = "SQLGATE_API_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

#[derive(Parser, Debug)]
struct CheckArgs {
    /// Script file to inspect
    file: PathBuf,
}

#[derive(Parser, Debug)]
struct ShowArgs {
    name: String,

    #[command(flatten)]
    remote: RemoteArgs,
}

#[derive(Parser, Debug)]
struct ExecuteArgs {
    name: String,

    /// Environment to run against (staging or production)
    #[arg(long)]
    environment: Environment,

    /// Who is running the script; recorded in the audit log
    #[arg(long, env = "SQLGATE_OPERATOR")]
    operator: String,

    #[command(flatten)]
    remote: RemoteArgs,
}

#[derive(Parser, Debug)]
struct LogsArgs {
    /// Only entries for this script
    #[arg(long)]
    script: Option<String>,

    /// Maximum number of entries
    #[arg(long, default_value_t = 20)]
    limit: usize,

    #[command(flatten)]
    remote: RemoteArgs,
}

struct ApiClient {
    client: reqwest::Client,
    server: String,
    token: String,
}

impl ApiClient {
    fn new(client: reqwest::Client, remote: RemoteArgs) -> Result<Self> {
        let token = remote
            .token
            .context("API token must be provided via --token argument or SQLGATE_API_TOKEN environment variable")?;
        Ok(Self {
            client,
            server: remote.server.trim_end_matches('/').to_string(),
            token,
        })
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value> {
        let response = request
            .header("Authorization", format!("Bearer {}", self.token))
            .send()
            .await
            .with_context(|| format!("Failed to reach sqlgate server at {}", self.server))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .context("Failed to read error response")?;
            let message = serde_json::from_str::<Value>(&error_text)
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
                .unwrap_or(error_text);
            return Err(anyhow!("sqlgate API error: {} - {}", status, message));
        }

        response.json().await.context("Failed to parse server response")
    }

    async fn get(&self, path: &str) -> Result<Value> {
        self.send(self.client.get(format!("{}{}", self.server, path)))
            .await
    }

    async fn post(&self, path: &str, body: Option<Value>) -> Result<Value> {
        let mut request = self.client.post(format!("{}{}", self.server, path));
        if let Some(body) = body {
            request = request.json(&body);
        }
        self.send(request).await
    }
}

/// Path segment with the characters that would change the route escaped.
fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(char::from(byte))
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or("-")
}

fn approvers(value: &Value) -> String {
    value
        .get("approvers")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default()
}

fn check_report(content: &str) -> String {
    let metadata = parse_metadata(content);
    let kind = match classify(content) {
        StatementKind::Read => "read (result rows are captured)",
        StatementKind::Write => "write (affected-row count is reported)",
    };

    let mut lines = vec![
        format!("Author:      {}", metadata.author.as_deref().unwrap_or("-")),
        format!("Purpose:     {}", metadata.purpose.as_deref().unwrap_or("-")),
        format!("Date:        {}", metadata.date.as_deref().unwrap_or("-")),
        format!(
            "Target:      {}{}",
            metadata.target_or_default(),
            if metadata.target.is_none() {
                " (default)"
            } else {
                ""
            }
        ),
        format!("DirectProd:  {}", if metadata.direct_prod { "yes" } else { "no" }),
        format!("Statement:   {}", kind),
    ];
    if metadata.direct_prod {
        lines.push("Production may run before staging once this script is approved.".to_string());
    }
    lines.join("\n")
}

fn script_line(script: &Value) -> String {
    format!(
        "{:<32} {:<20} direct_prod={:<5} {}",
        str_field(script, "name"),
        str_field(script, "promotion_state"),
        script
            .get("direct_prod")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        str_field(script, "pr_url"),
    )
}

fn log_line(entry: &Value) -> String {
    let rows = entry
        .get("rows_affected")
        .and_then(Value::as_u64)
        .map(|n| format!("{} row(s)", n))
        .unwrap_or_else(|| "-".to_string());
    let mut line = format!(
        "#{:<5} {} {:<24} {:<10} {:<7} {:<12} by {}",
        entry.get("id").and_then(Value::as_i64).unwrap_or_default(),
        str_field(entry, "executed_at"),
        str_field(entry, "script_name"),
        str_field(entry, "environment"),
        str_field(entry, "status"),
        rows,
        str_field(entry, "operator"),
    );
    if let Some(error) = entry.get("error_message").and_then(Value::as_str) {
        line.push_str(&format!("\n       error: {}", error));
    }
    line
}

fn run_check(args: CheckArgs) -> Result<()> {
    let content = fs::read_to_string(&args.file)
        .with_context(|| format!("Failed to read {}", args.file.display()))?;
    println!("{}", check_report(&content));
    Ok(())
}

async fn run_sync(client: reqwest::Client, args: RemoteArgs) -> Result<()> {
    let api = ApiClient::new(client, args)?;
    let report = api.post("/api/sync", None).await?;
    println!(
        "synced: {}, skipped: {}, errors: {}",
        report.get("synced").and_then(Value::as_u64).unwrap_or(0),
        report.get("skipped").and_then(Value::as_u64).unwrap_or(0),
        report.get("errors").and_then(Value::as_u64).unwrap_or(0),
    );
    Ok(())
}

async fn run_scripts(client: reqwest::Client, args: RemoteArgs) -> Result<()> {
    let api = ApiClient::new(client, args)?;
    let response = api.get("/api/scripts").await?;
    let scripts = response
        .get("scripts")
        .and_then(Value::as_array)
        .context("Unexpected response: missing scripts")?;

    if scripts.is_empty() {
        println!("No approved scripts.");
        return Ok(());
    }
    for script in scripts {
        println!("{}", script_line(script));
    }
    Ok(())
}

async fn run_show(client: reqwest::Client, args: ShowArgs) -> Result<()> {
    let api = ApiClient::new(client, args.remote)?;
    let script = api
        .get(&format!("/api/scripts/{}", encode_segment(&args.name)))
        .await?;

    println!("Name:        {}", str_field(&script, "name"));
    println!("State:       {}", str_field(&script, "promotion_state"));
    println!("Target:      {}", str_field(&script, "target_environment"));
    println!(
        "DirectProd:  {}",
        script
            .get("direct_prod")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    );
    println!("PR:          {}", str_field(&script, "pr_url"));
    println!("Approvers:   {}", approvers(&script));
    println!("Approved at: {}", str_field(&script, "approved_at"));
    println!("Staging:     {}", str_field(&script, "staging_executed_at"));
    println!("Production:  {}", str_field(&script, "production_executed_at"));
    println!();
    println!("{}", str_field(&script, "content"));
    Ok(())
}

async fn run_execute(client: reqwest::Client, args: ExecuteArgs) -> Result<()> {
    let api = ApiClient::new(client, args.remote)?;
    let outcome = api
        .post(
            &format!("/api/scripts/{}/execute", encode_segment(&args.name)),
            Some(json!({
                "environment": args.environment,
                "operator": args.operator,
            })),
        )
        .await?;

    for key in ["audit_error", "state_error"] {
        if let Some(problem) = outcome.get(key).and_then(Value::as_str) {
            eprintln!("Warning: {}", problem);
        }
    }

    if str_field(&outcome, "status") != "success" {
        return Err(anyhow!(
            "'{}' failed on {}: {}",
            args.name,
            args.environment,
            str_field(&outcome, "error_message")
        ));
    }

    eprintln!(
        "'{}' succeeded on {} in {}ms",
        args.name,
        args.environment,
        outcome
            .get("duration_ms")
            .and_then(Value::as_u64)
            .unwrap_or(0)
    );
    if let Some(rows) = outcome.get("rows_affected").and_then(Value::as_u64) {
        eprintln!("Rows: {}", rows);
    }
    if let Some(rows) = outcome.get("result_rows").filter(|r| !r.is_null()) {
        println!(
            "{}",
            serde_json::to_string_pretty(rows).context("Failed to format result rows")?
        );
    }
    if outcome
        .get("truncated")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        eprintln!("(result truncated)");
    }
    Ok(())
}

async fn run_logs(client: reqwest::Client, args: LogsArgs) -> Result<()> {
    let api = ApiClient::new(client, args.remote)?;
    let path = match &args.script {
        Some(script) => format!(
            "/api/scripts/{}/logs?limit={}",
            encode_segment(script),
            args.limit
        ),
        None => format!("/api/logs?limit={}", args.limit),
    };
    let response = api.get(&path).await?;
    let logs = response
        .get("logs")
        .and_then(Value::as_array)
        .context("Unexpected response: missing logs")?;

    if logs.is_empty() {
        println!("No executions recorded.");
        return Ok(());
    }
    for entry in logs {
        println!("{}", log_line(entry));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(3600))
        .build()
        .context("Failed to create HTTP client")?;

    match cli.command {
        Commands::Check(args) => run_check(args),
        Commands::Sync(args) => run_sync(client, args).await,
        Commands::Scripts(args) => run_scripts(client, args).await,
        Commands::Show(args) => run_show(client, args).await,
        Commands::Execute(args) => run_execute(client, args).await,
        Commands::Logs(args) => run_logs(client, args).await,
    }
}
