//! Command-line client for the scheduler API.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::{Value, json};

/// Manage scheduled agent jobs on a running server
#[derive(Parser, Debug)]
#[command(name = "manage-jobs", version, about, long_about = None)]
struct Cli {
    /// Scheduler API base URL
    #[arg(long, env = "SCHEDULER_URL", default_value = "http://localhost:8000/scheduler")]
    base_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List all jobs
    List,
    /// Show one job
    Get { id: String },
    /// Add or replace a recurring job
    Add {
        #[arg(long)]
        id: String,
        /// Five-field cron expression, e.g. '0 8 * * *'
        #[arg(long)]
        cron: String,
        /// Prompt handed to the agent
        #[arg(long)]
        content: String,
    },
    /// Add or replace a one-shot job
    Once {
        #[arg(long)]
        id: String,
        /// 'HH:MM[:SS]' today or 'YYYY-MM-DD HH:MM[:SS]'
        #[arg(long)]
        run_at: String,
        /// Prompt handed to the agent
        #[arg(long)]
        content: String,
    },
    /// Remove a job
    Remove { id: String },
    /// Run a job now
    Trigger { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let base = cli.base_url.trim_end_matches('/');
    let client = Client::new();

    match cli.command {
        Command::List => {
            let jobs = call(client.get(format!("{base}/jobs")), base).await?;
            print!("{}", format_job_table(&jobs));
        }
        Command::Get { id } => {
            let job = call(client.get(format!("{base}/jobs/{id}")), base).await?;
            println!("ID: {}", job["id"].as_str().unwrap_or(&id));
            println!("Next run: {}", job["next_run"].as_str().unwrap_or("N/A"));
            println!("Trigger: {}", job["trigger"].as_str().unwrap_or("N/A"));
            println!("Content:\n{}", job["content"].as_str().unwrap_or(""));
        }
        Command::Add { id, cron, content } => {
            let body = json!({ "id": id, "cron": cron, "content": content });
            call(client.post(format!("{base}/jobs")).json(&body), base).await?;
            println!("Job added: {id}");
            println!("Cron: {cron}");
            println!("Content: {}", preview(&content, 50));
        }
        Command::Once { id, run_at, content } => {
            let body = json!({ "id": id, "run_at": run_at, "content": content });
            let result = call(client.post(format!("{base}/jobs/once")).json(&body), base).await?;
            println!("One-shot job added: {id}");
            println!("Runs at: {}", result["run_at"].as_str().unwrap_or(&run_at));
            println!("Content: {}", preview(&content, 50));
        }
        Command::Remove { id } => {
            call(client.delete(format!("{base}/jobs/{id}")), base).await?;
            println!("Job removed: {id}");
        }
        Command::Trigger { id } => {
            call(client.post(format!("{base}/trigger/{id}")), base).await?;
            println!("Job triggered: {id}");
        }
    }
    Ok(())
}

async fn call(request: RequestBuilder, base: &str) -> Result<Value> {
    let response = request
        .send()
        .await
        .with_context(|| format!("cannot reach scheduler API at {base}"))?;
    expect_ok(response).await
}

/// Body of a 200 response; anything else becomes an error carrying `detail`.
async fn expect_ok(response: Response) -> Result<Value> {
    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    if status != StatusCode::OK {
        let detail = body["detail"].as_str().map(str::to_string).unwrap_or_else(|| body.to_string());
        bail!("{status}: {detail}");
    }
    Ok(body)
}

fn format_job_table(jobs: &Value) -> String {
    let Some(jobs) = jobs.as_array().filter(|j| !j.is_empty()) else {
        return "No jobs registered.\n".to_string();
    };

    let mut out = format!("\n{:<20} {:<27} {}\n{}\n", "ID", "NEXT RUN", "CONTENT", "-".repeat(80));
    for job in jobs {
        out.push_str(&format!(
            "{:<20} {:<27} {}\n",
            job["id"].as_str().unwrap_or("?"),
            job["next_run"].as_str().unwrap_or("N/A"),
            preview(job["content"].as_str().unwrap_or(""), 40)
        ));
    }
    out
}

fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        format!("{}...", text.chars().take(max_chars).collect::<String>())
    } else {
        text.to_string()
    }
}
