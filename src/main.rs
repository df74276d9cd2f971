//! gateway-bridge - command line front end for the gateway client
//!
//! Prints results as JSON on stdout; logs go to stderr.

use anyhow::Context;
use clap::Parser;
use serde_json::Value;
use std::io::Read;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gateway_bridge::{
    config::{Args, Command},
    CallOptions, GatewayClient, GatewaySettings, TaskRecord,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("gateway_bridge={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let settings = GatewaySettings::from(args.gateway);
    let client = GatewayClient::new(settings);

    let output = match args.command {
        Command::Candidates => {
            let plan = client.plan();
            info!(
                candidates = plan.urls.len(),
                device_auth = plan.auth.device.is_some(),
                "Resolved gateway candidates"
            );
            serde_json::to_value(plan.urls)?
        }
        Command::StartTask { task, best_effort } => {
            let task = read_task(&task)?;
            let outcome = if best_effort {
                client.start_task_best_effort(&task).await
            } else {
                client.trigger_task_start(&task).await?
            };
            serde_json::to_value(outcome)?
        }
        Command::RunJob { job } => serde_json::to_value(client.trigger_orchestrator_run(&job).await?)?,
        Command::Call {
            method,
            params,
            expect_final,
        } => {
            let params: Value = serde_json::from_str(&params).context("--params is not valid JSON")?;
            let opts = CallOptions {
                expect_final,
                ..CallOptions::default()
            };
            match client.call(&method, params, opts).await {
                Ok(payload) => payload,
                Err(e) => {
                    error!(method = %method, error = %e, "Gateway call failed");
                    return Err(e.into());
                }
            }
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Read a task record from a file, or from stdin when `source` is `-`.
fn read_task(source: &str) -> anyhow::Result<TaskRecord> {
    let raw = if source == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read task from stdin")?;
        buf
    } else {
        std::fs::read_to_string(source).with_context(|| format!("Failed to read task file {}", source))?
    };
    serde_json::from_str(&raw).context("Task is not a valid task record")
}
