//! Foundry CLI - fleet provisioning workflows from one JSON config.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use foundry::client::ProvisionClient;
use foundry::config::{Action, ActionSet, WorkflowConfig};
use foundry::maas::MaasClient;
use foundry::workflow::WorkflowEngine;

/// Foundry - orchestrate bare metal machine lifecycles.
#[derive(Parser)]
#[command(name = "foundry")]
#[command(about = "Drive a fleet of machines through provisioning workflows")]
struct Cli {
    /// Path to the JSON workflow configuration.
    #[arg(short, long)]
    input: PathBuf,

    /// Override the configured actions with a single action
    /// (e.g. commission, deploy, release, delete, list).
    #[arg(short, long)]
    action: Option<String>,

    /// Comma-separated hostnames to target, or "all".
    #[arg(long)]
    hosts: Option<String>,

    /// Override the configured retry ceiling (0 = retry forever).
    #[arg(long)]
    max_retries: Option<u32>,

    /// Force sequential processing even for multi-machine fleets.
    #[arg(long, default_value = "false")]
    sequential: bool,

    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

fn parse_action(name: &str) -> Result<Action> {
    serde_json::from_value(serde_json::Value::String(name.to_string()))
        .with_context(|| format!("Unknown action: {name}"))
}

/// Restrict the fleet to the requested hostnames.
fn filter_hosts(config: &mut WorkflowConfig, hosts: &str) -> Result<()> {
    if hosts.eq_ignore_ascii_case("all") {
        return Ok(());
    }

    let wanted: Vec<String> = hosts
        .split(',')
        .map(|h| h.trim().to_lowercase())
        .filter(|h| !h.is_empty())
        .collect();

    let available: Vec<String> = config
        .machines
        .iter()
        .map(|m| m.display_name())
        .collect();

    config.machines.retain(|m| {
        m.hostname
            .as_ref()
            .is_some_and(|h| wanted.contains(&h.to_lowercase()))
    });

    if config.machines.is_empty() {
        anyhow::bail!(
            "No machines match --hosts {hosts}. Available: {}",
            available.join(", ")
        );
    }
    Ok(())
}

async fn print_machine_listing(client: &MaasClient) -> Result<()> {
    let machines = client.list_machines().await?;

    println!(
        "\n{:<12} {:<24} {:<20}",
        "SYSTEM_ID", "HOSTNAME", "STATUS"
    );
    println!("{}", "-".repeat(58));
    for machine in &machines {
        println!(
            "{:<12} {:<24} {:<20}",
            machine.system_id, machine.hostname, machine.state
        );
    }
    println!("\nTotal: {} machines", machines.len());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = WorkflowConfig::load(&cli.input)?;

    if let Some(ref action) = cli.action {
        let action = parse_action(action)?;
        config.actions = ActionSet::from(vec![action]);
        info!("Actions overridden from the command line: {}", config.actions.describe());
    }
    if let Some(ref hosts) = cli.hosts {
        filter_hosts(&mut config, hosts)?;
    }
    if let Some(max_retries) = cli.max_retries {
        config.max_retries = max_retries;
    }
    if cli.sequential {
        config.concurrent = Some(false);
    }

    let client = Arc::new(
        MaasClient::new(&config.api_url, &config.api_key)
            .context("Failed to create provisioning client")?,
    );

    if config.actions.contains(Action::List) {
        return print_machine_listing(client.as_ref()).await;
    }

    if config.actions.is_empty() {
        anyhow::bail!("No actions requested; set \"actions\" in the config or pass --action");
    }
    config.validate().context("Invalid configuration")?;

    // Operator interrupt: pollers exit at their next tick and partial
    // results are still reported.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping at the next safe point");
            let _ = shutdown_tx.send(true);
        }
    });

    let engine = WorkflowEngine::new(client, config, shutdown_rx);
    let summary = engine.run().await;
    summary.print();

    if summary.all_succeeded() {
        Ok(())
    } else {
        std::process::exit(1);
    }
}
