//! kioskd - kiosk supervisor
//!
//! One-shot entry points for timers and operators, plus `watch` for running
//! both schedules in-process.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kiosk_shared::Config;
use kioskd::recovery::{ResetOutcome, TriggerOutcome};
use kioskd::resources::SweepOutcome;
use kioskd::Supervisor;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kioskd", version, about = "Kiosk health supervisor")]
struct Cli {
    /// Config file (default: $KIOSK_CONFIG or /etc/kiosk/supervisor.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe health once and recover if unhealthy
    Probe,
    /// Reclaim memory, disk, processes and connections once
    Sweep,
    /// Run one recovery step now
    Trigger,
    /// Clear escalation history
    Reset,
    /// Show escalation state and live health
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Run probe and sweep on their schedules
    Watch,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let supervisor = Supervisor::from_config(&config)?;

    match cli.command {
        Commands::Probe => {
            let outcome = supervisor.probe_cycle().await?;
            if let Some(trigger) = &outcome.trigger {
                print_trigger(trigger);
            }
            Ok(exit_code(outcome.report.healthy()))
        }
        Commands::Sweep => {
            let outcome = supervisor.sweep_cycle().await?;
            match &outcome.sweep {
                SweepOutcome::Completed(report) => {
                    println!("memory {:.1}%, disk {:.1}%", report.memory_pct, report.disk_pct);
                    for action in &report.actions {
                        println!("  {}", action);
                    }
                }
                SweepOutcome::Contended { holder, pid } => {
                    println!("skipped: {} (pid {}) holds the lock", holder, pid);
                }
            }
            if let Some(trigger) = &outcome.trigger {
                print_trigger(trigger);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Trigger => {
            let outcome = supervisor.trigger().await?;
            print_trigger(&outcome);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Reset => match supervisor.reset()? {
            ResetOutcome::Applied { previous } => {
                println!(
                    "reset (was level {}, {} failures)",
                    previous.level, previous.failure_count
                );
                Ok(ExitCode::SUCCESS)
            }
            ResetOutcome::Contended { holder, pid } => {
                println!("busy: {} (pid {}) holds the lock, try again", holder, pid);
                Ok(ExitCode::from(2))
            }
        },
        Commands::Status { json } => {
            let status = supervisor.status().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("{}", status.render());
            }
            Ok(exit_code(status.currently_healthy))
        }
        Commands::Watch => {
            info!("kioskd v{} starting", env!("CARGO_PKG_VERSION"));
            Arc::new(supervisor).watch().await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn exit_code(healthy: bool) -> ExitCode {
    if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn print_trigger(outcome: &TriggerOutcome) {
    match outcome {
        TriggerOutcome::Contended { holder, pid } => {
            println!("recovery already in progress ({}, pid {})", holder, pid)
        }
        TriggerOutcome::Recovered { action, from_level } => {
            println!("recovered by {} (was level {})", action, from_level)
        }
        TriggerOutcome::Escalated { action, from_level, to_level } => {
            println!("{} did not help: level {} -> {}", action, from_level, to_level)
        }
        TriggerOutcome::RebootIssued { failure_count } => {
            println!("reboot issued after {} failures", failure_count)
        }
    }
}
