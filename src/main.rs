//! CLI entry point for epp-ops: fleet queries, health checks and remediation
//! tasks against an endpoint-protection management API.
//!
//! Exit codes:
//! - 0: success
//! - 1: runtime error (config, auth, API error, timeout, etc.)
//! - 2: argument validation error (clap handles this automatically)
//! - 3: `health --fail-on-critical` found at least one critical issue

use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use epp_ops::audit::verify_log;
use epp_ops::client::ApiClient;
use epp_ops::config::Config;
use epp_ops::devices::list_devices;
use epp_ops::error::{EppError, Result};
use epp_ops::health::{Severity, run_health_check};
use epp_ops::tasks::{
    CreateTaskRequest, PollConfig, TaskType, approve_task, cancel_task, create_task, get_task,
    wait_for_task,
};
use epp_ops::workflows::{run_task_per_device, uninstall_then_reinstall};

const EXIT_CRITICAL: u8 = 3;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "epp.toml")]
    config: PathBuf,

    /// OAuth client secret. Prefer the EPP_CLIENT_SECRET environment
    /// variable to keep the secret out of process listings and shell
    /// history.
    #[arg(long, global = true, env = "EPP_CLIENT_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List every managed device.
    Devices {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Evaluate fleet health against the configured thresholds.
    Health {
        /// Print the full report as JSON.
        #[arg(long)]
        json: bool,

        /// Exit with code 3 when any critical issue is found.
        #[arg(long)]
        fail_on_critical: bool,
    },

    /// Manage remote tasks.
    #[command(subcommand)]
    Task(TaskCommand),

    /// Start one scan task per device.
    Scan {
        #[command(flatten)]
        targets: Targets,

        /// Wait for every scan to finish.
        #[arg(long)]
        wait: bool,
    },

    /// Uninstall and reinstall the agent on the given devices.
    Reinstall {
        #[command(flatten)]
        targets: Targets,
    },

    /// Check the integrity digests of an audit log file.
    VerifyAudit {
        /// Audit log to verify.
        path: PathBuf,
    },
}

#[derive(Subcommand)]
enum TaskCommand {
    /// Create a task.
    Create {
        /// Task type: scan, update_definitions, install, uninstall, isolate.
        #[arg(long = "type")]
        task_type: TaskType,

        /// Task name.
        #[arg(long)]
        name: String,

        #[command(flatten)]
        targets: Targets,

        /// Task parameters as a JSON object.
        #[arg(long)]
        params: Option<String>,

        /// Hold the task until it is approved.
        #[arg(long)]
        require_approval: bool,
    },

    /// Show a task.
    Status {
        /// Task id.
        id: String,
    },

    /// Approve a task waiting for approval.
    Approve {
        /// Task id.
        id: String,
    },

    /// Cancel a task.
    Cancel {
        /// Task id.
        id: String,
    },

    /// Poll a task until it finishes.
    Wait {
        /// Task id.
        id: String,

        /// Override the configured timeout.
        #[arg(long)]
        timeout_minutes: Option<u64>,
    },
}

/// Target devices, repeated or comma separated.
#[derive(Args)]
struct Targets {
    /// Device id(s) to target.
    #[arg(long = "device", required = true, value_delimiter = ',')]
    devices: Vec<String>,
}

fn init_logging(verbose: u8, json: bool) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    // Verifying an audit log needs no configuration or network.
    if let Command::VerifyAudit { path } = &cli.command {
        let file = std::fs::File::open(path)?;
        let report = verify_log(BufReader::new(file))?;
        println!(
            "{} entries, {} tampered, {} malformed",
            report.entries,
            report.tampered.len(),
            report.malformed.len()
        );
        for line in &report.tampered {
            println!("  tampered: line {line}");
        }
        for line in &report.malformed {
            println!("  malformed: line {line}");
        }
        let clean = report.tampered.is_empty() && report.malformed.is_empty();
        return Ok(if clean { ExitCode::SUCCESS } else { ExitCode::FAILURE });
    }

    let config = Config::load(&cli.config)?;
    let client = ApiClient::from_config(&config, cli.secret.as_deref())?;

    match cli.command {
        Command::Devices { json } => {
            let devices = list_devices(&client, config.api.page_size).await?;
            if json {
                print_json(&devices)?;
            } else {
                for device in &devices {
                    let last_seen = device
                        .last_seen
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string());
                    let status = format!("{:?}", device.status);
                    println!(
                        "{:<38} {:<28} {:<8} {}",
                        device.id,
                        device.display_name(),
                        status,
                        last_seen
                    );
                }
                println!("{} devices", devices.len());
            }
        }

        Command::Health {
            json,
            fail_on_critical,
        } => {
            let report =
                run_health_check(&client, &config.health, &config.batch, config.api.page_size)
                    .await?;
            if json {
                print_json(&report)?;
            } else {
                println!(
                    "{} devices: {} healthy, {} warning, {} critical, {} unavailable",
                    report.total_devices,
                    report.summary.healthy,
                    report.summary.warning,
                    report.summary.critical,
                    report.unavailable
                );
                println!("compliance: {:.1}%", report.compliance_percentage);
                for issue in &report.issues {
                    println!(
                        "  [{:?}] {} ({}): {}",
                        issue.severity, issue.device_name, issue.device_id, issue.description
                    );
                }
            }
            if fail_on_critical && report.count_severity(Severity::Critical) > 0 {
                return Ok(ExitCode::from(EXIT_CRITICAL));
            }
        }

        Command::Task(command) => run_task_command(&client, &config, command).await?,

        Command::Scan { targets, wait } => {
            let template = CreateTaskRequest::new("on-demand scan", TaskType::Scan, Vec::new());
            let poll = config.tasks.poll_config();
            let result = run_task_per_device(
                &client,
                &template,
                &targets.devices,
                &config.batch,
                wait.then_some(&poll),
            )
            .await?;
            print_json(&result)?;
        }

        Command::Reinstall { targets } => {
            let outcome =
                uninstall_then_reinstall(&client, &targets.devices, &config.tasks.poll_config())
                    .await?;
            print_json(&outcome)?;
        }

        Command::VerifyAudit { .. } => {}
    }

    Ok(ExitCode::SUCCESS)
}

async fn run_task_command(client: &ApiClient, config: &Config, command: TaskCommand) -> Result<()> {
    let task = match command {
        TaskCommand::Create {
            task_type,
            name,
            targets,
            params,
            require_approval,
        } => {
            let mut request = CreateTaskRequest::new(name, task_type, targets.devices)
                .require_approval(require_approval);
            if let Some(raw) = params {
                let value: serde_json::Value = serde_json::from_str(&raw)?;
                if !value.is_object() {
                    return Err(EppError::InvalidInput("--params must be a JSON object".into()));
                }
                request = request.parameters(value);
            }
            create_task(client, &request).await?
        }
        TaskCommand::Status { id } => get_task(client, &id).await?,
        TaskCommand::Approve { id } => approve_task(client, &id).await?,
        TaskCommand::Cancel { id } => cancel_task(client, &id).await?,
        TaskCommand::Wait {
            id,
            timeout_minutes,
        } => {
            let mut poll: PollConfig = config.tasks.poll_config();
            if let Some(minutes) = timeout_minutes {
                poll.timeout = std::time::Duration::from_secs(minutes.saturating_mul(60));
            }
            wait_for_task(client, &id, &poll).await?
        }
    };
    print_json(&task)
}
