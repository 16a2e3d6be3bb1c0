//! CLI for a running member's HTTP API

use clap::{Parser, Subcommand};
use serde_json::json;
use stockgroup::common::parse_duration;
use stockgroup::member::http::WriteReport;

#[derive(Parser)]
#[command(name = "stock")]
#[command(about = "stockgroup CLI")]
#[command(version)]
struct Cli {
    /// Member HTTP URL
    #[arg(long, default_value = "http://127.0.0.1:8800")]
    node: String,

    /// Request timeout (e.g. 500ms, 10s)
    #[arg(long, default_value = "15s")]
    timeout: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show all stocks
    Show,

    /// Get one quote
    Get {
        /// Ticker
        key: String,
    },

    /// Set a quote on every member
    Set {
        /// Ticker
        key: String,
        /// Price
        value: f64,
    },

    /// Remove a quote on every member
    Remove {
        /// Ticker
        key: String,
    },

    /// Compare-and-swap a quote
    Cas {
        /// Ticker
        key: String,
        /// Expected current price
        expected: f64,
        /// New price
        new: f64,
    },

    /// Show the member's view
    View,

    /// Member health
    Health,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client = reqwest::Client::builder()
        .timeout(parse_duration(&cli.timeout)?)
        .build()?;
    let base = cli.node.trim_end_matches('/').to_string();

    match cli.command {
        Commands::Show => {
            let stocks = send(client.get(format!("{}/stocks", base))).await?;
            match stocks.as_object() {
                Some(stocks) if !stocks.is_empty() => {
                    for (key, value) in stocks {
                        println!("{}: {}", key, value);
                    }
                }
                _ => println!("no stocks"),
            }
        }

        Commands::Get { key } => {
            let body = send(client.get(format!("{}/stocks/{}", base, key))).await?;
            println!("{}: {}", key, body["value"]);
        }

        Commands::Set { key, value } => {
            let body = send(
                client
                    .put(format!("{}/stocks/{}", base, key))
                    .json(&json!({ "value": value })),
            )
            .await?;
            print_report(serde_json::from_value(body)?);
        }

        Commands::Remove { key } => {
            let body = send(client.delete(format!("{}/stocks/{}", base, key))).await?;
            print_report(serde_json::from_value(body)?);
        }

        Commands::Cas { key, expected, new } => {
            let body = send(
                client
                    .post(format!("{}/stocks/{}/cas", base, key))
                    .json(&json!({ "expected": expected, "value": new })),
            )
            .await?;
            let report: WriteReport = serde_json::from_value(body)?;
            if report.swapped == Some(true) {
                println!("changed {} from {} to {}", key, expected, new);
            } else {
                println!("failed changing {} from {} to {}", key, expected, new);
            }
            print_report(report);
        }

        Commands::View => {
            let view = send(client.get(format!("{}/view", base))).await?;
            println!("View {}:", view["id"]);
            if let Some(members) = view["members"].as_array() {
                for member in members {
                    println!("  {}", member.as_str().unwrap_or_default());
                }
            }
        }

        Commands::Health => {
            let health = send(client.get(format!("{}/health", base))).await?;
            println!("{}", serde_json::to_string_pretty(&health)?);
        }
    }

    Ok(())
}

async fn send(request: reqwest::RequestBuilder) -> anyhow::Result<serde_json::Value> {
    let response = request.send().await?;
    let status = response.status();
    let body: serde_json::Value = response.json().await?;
    if !status.is_success() {
        let message = body["error"].as_str().unwrap_or("request failed");
        anyhow::bail!("{} ({})", message, status);
    }
    Ok(body)
}

fn print_report(report: WriteReport) {
    println!(
        "{} ({}):",
        report.method,
        if report.complete { "complete" } else { "partial" }
    );
    for response in report.responses {
        println!("  {}: {}", response.member, response.outcome);
    }
}
