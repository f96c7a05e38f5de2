//! AgentKit CLI entry point

use clap::Parser;
use eyre::{Context, Result};
use tracing::info;

use agentkit::cli::{Cli, Command};
use agentkit::config::Config;

fn setup_logging(verbose: bool) {
    let default_level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Command::Serve => {
            let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
            info!(
                provider = %config.llm.provider,
                model = %config.llm.model,
                bind = %config.rpc.bind,
                "AgentKit starting"
            );
            agentkit::daemon::run(config).await
        }

        Command::Submit {
            prompt,
            runner,
            priority,
            server,
        } => {
            let body = serde_json::json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "message/send",
                "params": {
                    "message": {
                        "role": "user",
                        "parts": [{"kind": "text", "text": prompt}],
                    },
                    "runner": runner,
                    "priority": priority,
                }
            });

            let response: serde_json::Value = reqwest::Client::new()
                .post(format!("{}/a2a/message", server))
                .json(&body)
                .send()
                .await
                .context("Failed to reach the daemon")?
                .json()
                .await
                .context("Malformed daemon response")?;

            if let Some(error) = response.get("error") {
                eyre::bail!("submission rejected: {}", error);
            }
            let result = &response["result"];
            println!("{}  {}", result["id"].as_str().unwrap_or("?"), result["status"]["state"].as_str().unwrap_or("?"));
            Ok(())
        }

        Command::Status { task_id, server } => {
            let client = reqwest::Client::new();
            match task_id {
                Some(id) => {
                    let response = client
                        .get(format!("{}/a2a/task/{}", server, id))
                        .send()
                        .await
                        .context("Failed to reach the daemon")?;
                    if !response.status().is_success() {
                        eyre::bail!("task not found: {}", id);
                    }
                    let record: serde_json::Value = response.json().await?;
                    println!("{}", serde_json::to_string_pretty(&record)?);
                }
                None => {
                    let listing: serde_json::Value = client
                        .get(format!("{}/a2a/tasks", server))
                        .send()
                        .await
                        .context("Failed to reach the daemon")?
                        .json()
                        .await?;
                    for task in listing["tasks"].as_array().into_iter().flatten() {
                        println!(
                            "{}  {}",
                            task["id"].as_str().unwrap_or("?"),
                            task["status"]["state"].as_str().unwrap_or("?")
                        );
                    }
                }
            }
            Ok(())
        }

        Command::Cancel { task_id, server } => {
            let response = reqwest::Client::new()
                .post(format!("{}/a2a/task/{}/cancel", server, task_id))
                .send()
                .await
                .context("Failed to reach the daemon")?;
            if response.status().is_success() {
                println!("cancelled {}", task_id);
                Ok(())
            } else {
                eyre::bail!("task not found: {}", task_id)
            }
        }

        Command::Gc { older_than_secs, server } => {
            let mut body = serde_json::Map::new();
            if let Some(secs) = older_than_secs {
                body.insert("older-than-secs".to_string(), secs.into());
            }

            let response = reqwest::Client::new()
                .post(format!("{}/a2a/gc", server))
                .json(&serde_json::Value::Object(body))
                .send()
                .await
                .context("Failed to reach the daemon")?;
            if !response.status().is_success() {
                let error: serde_json::Value = response.json().await.unwrap_or_default();
                eyre::bail!("gc failed: {}", error["error"].as_str().unwrap_or("unknown error"));
            }
            let result: serde_json::Value = response.json().await.context("Malformed daemon response")?;
            println!("cleaned {}", result["cleaned"]);
            Ok(())
        }

        Command::Approvals { approve, deny, server } => {
            let client = reqwest::Client::new();
            // clap's conflicts_with keeps these mutually exclusive
            let resolution = match (approve, deny) {
                (Some(id), _) => Some((id, true)),
                (None, Some(id)) => Some((id, false)),
                (None, None) => None,
            };
            match resolution {
                Some((id, approved)) => {
                    let response: serde_json::Value = client
                        .post(format!("{}/a2a/approval/{}", server, id))
                        .json(&serde_json::json!({"approved": approved}))
                        .send()
                        .await
                        .context("Failed to reach the daemon")?
                        .json()
                        .await?;
                    println!("resolved: {}", response["resolved"]);
                }
                None => {
                    let listing: serde_json::Value = client
                        .get(format!("{}/a2a/approvals", server))
                        .send()
                        .await
                        .context("Failed to reach the daemon")?
                        .json()
                        .await?;
                    for request in listing["pending"].as_array().into_iter().flatten() {
                        println!(
                            "{}  {}  {}  {}",
                            request["id"].as_str().unwrap_or("?"),
                            request["task_id"].as_str().unwrap_or("?"),
                            request["risk"].as_str().unwrap_or("?"),
                            request["action"].as_str().unwrap_or("?"),
                        );
                    }
                }
            }
            Ok(())
        }
    }
}
