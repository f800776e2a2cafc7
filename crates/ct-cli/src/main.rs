//! Compliance Tracker CLI

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "ct")]
#[command(about = "Compliance validation workflow client")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// API base URL
    #[arg(long, global = true, default_value = "http://localhost:3000")]
    api_url: String,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a single checklist item
    Item {
        /// Checklist item id
        id: String,

        /// Free-text evidence
        #[arg(short, long)]
        evidence: Option<String>,

        /// Requirement text
        #[arg(short, long)]
        requirement: Option<String>,

        /// Repository URL to fetch evidence from
        #[arg(long)]
        repo: Option<String>,

        /// Poll until the workflow reaches a terminal state
        #[arg(short, long)]
        wait: bool,
    },

    /// Validate a batch of checklist items
    Batch {
        /// Checklist item ids (comma-separated)
        ids: String,

        /// Free-text evidence shared by the batch
        #[arg(short, long)]
        evidence: Option<String>,

        /// Repository URL to fetch evidence from
        #[arg(long)]
        repo: Option<String>,

        /// Poll until the workflow reaches a terminal state
        #[arg(short, long)]
        wait: bool,
    },

    /// Validate an application across focus areas
    App {
        /// Application id
        id: String,

        /// Focus areas (comma-separated), e.g. security,logging
        #[arg(short, long, default_value = "security,code_quality")]
        focus: String,

        /// Repository URL to analyze
        #[arg(long)]
        repo: String,

        /// Poll until the workflow reaches a terminal state
        #[arg(short, long)]
        wait: bool,
    },

    /// Show a workflow and its steps
    Status {
        /// Workflow id
        id: Uuid,
    },

    /// Show the latest workflow for an application
    Latest {
        /// Application id
        id: String,
    },

    /// Cancel a running workflow
    Cancel {
        /// Workflow id
        id: Uuid,
    },

    /// Show one validation result with its findings
    Result {
        /// Validation result id
        id: Uuid,
    },

    /// Show validation history for a checklist item
    History {
        /// Checklist item id
        id: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");

    let client = Client::new(cli.api_url);

    let outcome = match cli.command {
        Commands::Item {
            id,
            evidence,
            requirement,
            repo,
            wait,
        } => cmd_item(&client, id, evidence, requirement, repo, wait).await,
        Commands::Batch {
            ids,
            evidence,
            repo,
            wait,
        } => cmd_batch(&client, ids, evidence, repo, wait).await,
        Commands::App {
            id,
            focus,
            repo,
            wait,
        } => cmd_app(&client, id, focus, repo, wait).await,
        Commands::Status { id } => {
            client
                .get(&format!("/api/validations/workflows/{id}"))
                .await
        }
        Commands::Latest { id } => {
            client
                .get(&format!("/api/validations/applications/{id}/latest"))
                .await
        }
        Commands::Cancel { id } => {
            client
                .post(&format!("/api/validations/workflows/{id}/cancel"), json!({}))
                .await
        }
        Commands::Result { id } => client.get(&format!("/api/validations/results/{id}")).await,
        Commands::History { id } => {
            client
                .get(&format!("/api/validations/checklist-items/{id}"))
                .await
        }
    };

    match outcome {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value).unwrap()),
        Err(message) => {
            error!("{message}");
            std::process::exit(1);
        }
    }
}

struct Client {
    base: String,
    http: reqwest::Client,
}

impl Client {
    fn new(base: String) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    async fn get(&self, path: &str) -> Result<Value, String> {
        let response = self
            .http
            .get(format!("{}{path}", self.base))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        Self::read(response).await
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, String> {
        let response = self
            .http
            .post(format!("{}{path}", self.base))
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        Self::read(response).await
    }

    async fn read(response: reqwest::Response) -> Result<Value, String> {
        let status = response.status();
        let value: Value = response
            .json()
            .await
            .map_err(|e| format!("unreadable reply: {e}"))?;
        if status.is_success() {
            Ok(value)
        } else {
            let message = value
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("request failed");
            Err(format!("HTTP {status}: {message}"))
        }
    }

    /// Poll a workflow every two seconds until it is terminal.
    async fn wait_for(&self, workflow_id: &str) -> Result<Value, String> {
        loop {
            let workflow = self
                .get(&format!("/api/validations/workflows/{workflow_id}"))
                .await?;
            let status = workflow
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if status == "completed" || status == "failed" {
                return Ok(workflow);
            }
            info!("Workflow {workflow_id} is {status}");
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    async fn maybe_wait(&self, submission: Value, wait: bool) -> Result<Value, String> {
        if !wait {
            return Ok(submission);
        }
        let workflow_id = submission
            .get("workflow_id")
            .or_else(|| submission.get("validation_id"))
            .and_then(Value::as_str)
            .ok_or("submission reply carried no workflow id")?
            .to_string();
        self.wait_for(&workflow_id).await
    }
}

fn repo_body(repo: Option<String>) -> Value {
    match repo {
        Some(url) => json!({ "url": url }),
        None => Value::Null,
    }
}

fn split_csv(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

async fn cmd_item(
    client: &Client,
    id: String,
    evidence: Option<String>,
    requirement: Option<String>,
    repo: Option<String>,
    wait: bool,
) -> Result<Value, String> {
    info!("Submitting validation for checklist item {id}");
    let body = json!({
        "checklist_item_id": id,
        "evidence_context": evidence,
        "requirement_text": requirement,
        "repository": repo_body(repo),
    });
    let submission = client.post("/api/validations/items", body).await?;
    client.maybe_wait(submission, wait).await
}

async fn cmd_batch(
    client: &Client,
    ids: String,
    evidence: Option<String>,
    repo: Option<String>,
    wait: bool,
) -> Result<Value, String> {
    let ids = split_csv(&ids);
    if ids.is_empty() {
        return Err("no checklist item ids given".to_string());
    }
    info!("Submitting batch validation for {} items", ids.len());
    let body = json!({
        "checklist_item_ids": ids,
        "evidence_context": evidence,
        "repository": repo_body(repo),
    });
    let submission = client.post("/api/validations/batch", body).await?;
    client.maybe_wait(submission, wait).await
}

async fn cmd_app(
    client: &Client,
    id: String,
    focus: String,
    repo: String,
    wait: bool,
) -> Result<Value, String> {
    let focus_areas = split_csv(&focus);
    info!("Submitting application validation for {id}");
    let body = json!({
        "focus_areas": focus_areas,
        "repository": { "url": repo },
    });
    let submission = client
        .post(&format!("/api/validations/applications/{id}"), body)
        .await?;
    client.maybe_wait(submission, wait).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_splitting_trims_and_drops_empties() {
        assert_eq!(
            split_csv("a, b ,,c"),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert!(split_csv(" , ").is_empty());
    }
}
