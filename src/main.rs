//! trialhost CLI entry point.
//!
//! Runs the provisioning API server or a single workflow from the command line.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use trialhost_clients::production_backends;
use trialhost_common::{ConfigFile, DeprovisionRequest, InstanceId, ProvisioningRequest, Stage};
use trialhost_core::{Backends, Provisioner, SimulatedCloud};
use trialhost_server::{AppState, ServerConfig, TrialServer};

#[derive(Debug, Parser)]
#[command(name = "trialhost", version, about = "Provision short-lived trial environments")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "TRIALHOST_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    log_json: bool,

    /// Run against in-memory backends instead of the real APIs.
    #[arg(long, global = true)]
    simulate: bool,

    /// Edge network API token (overrides `edge.api_token`).
    #[arg(long, env = "EDGE_API_TOKEN", hide_env_values = true, global = true)]
    edge_api_token: Option<String>,

    /// Hypervisor password (overrides `hypervisor.password`).
    #[arg(long, env = "HYPERVISOR_PASSWORD", hide_env_values = true, global = true)]
    hypervisor_password: Option<String>,

    /// Hypervisor API token secret (overrides `hypervisor.token_secret`).
    #[arg(long, env = "HYPERVISOR_TOKEN_SECRET", hide_env_values = true, global = true)]
    hypervisor_token_secret: Option<String>,

    /// Token required on mutating API endpoints (overrides `api.token`).
    #[arg(long, env = "API_TOKEN", hide_env_values = true, global = true)]
    api_token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP API.
    Serve {
        /// Bind address (overrides `server.bind_addr`).
        #[arg(long, env = "BIND_ADDR")]
        bind: Option<String>,
    },

    /// Provision one trial environment and print the result.
    Provision {
        #[arg(long)]
        email: String,
        #[arg(long, default_value = "nginx")]
        oss_type: String,
        #[arg(long)]
        subdomain: String,
        #[arg(long, default_value_t = 7)]
        days: u32,
    },

    /// Tear down a trial environment.
    Deprovision {
        #[arg(long)]
        vmid: u32,
        #[arg(long)]
        subdomain: String,
        /// Omit to skip tunnel deletion.
        #[arg(long, default_value = "")]
        tunnel_id: String,
    },

    /// Check whether a subdomain is available.
    Check { subdomain: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = load_config(&cli)?;
    let backends = if cli.simulate {
        info!("Using simulated backends");
        simulated_backends(&config)
    } else {
        production_backends(&config).context("Failed to configure backends")?
    };
    let provisioner = Provisioner::new(config.provisioner.clone(), backends);

    match cli.command {
        Command::Serve { bind } => {
            let mut server_file = config.server.clone();
            if let Some(bind) = bind {
                server_file.bind_addr = bind;
            }
            let server_config = ServerConfig::from_file(&server_file)?;

            let api_token = if config.api.enabled {
                Some(
                    config
                        .api
                        .token
                        .clone()
                        .context("api.enabled is set but no API token is configured")?,
                )
            } else {
                None
            };

            info!(
                bind_addr = %server_config.bind_addr,
                domain = %config.provisioner.domain,
                token_guard = api_token.is_some(),
                "Configuration loaded"
            );
            info!("Available endpoints:");
            info!("  GET  /health                     - Health check");
            info!("  GET  /ready                      - Readiness check");
            info!("  GET  /api/subdomains/:subdomain  - Subdomain availability");
            info!("  POST /api/provisions             - Submit provisioning job");
            info!("  GET  /api/provisions[/:id]       - Job status");
            info!("  POST /api/deprovisions           - Tear down a trial");

            let state = AppState::new(provisioner, api_token);
            TrialServer::new(state, server_config).run().await?;
        }

        Command::Provision {
            email,
            oss_type,
            subdomain,
            days,
        } => {
            let request = ProvisioningRequest {
                customer_email: email,
                oss_type,
                subdomain,
                duration_days: days,
            };
            let progress = |stage: Stage| info!(%stage, "Stage entered");

            // Ctrl-C cancels the run; it rolls back before returning.
            let cancel = CancellationToken::new();
            let interrupt = tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("Interrupted, rolling back");
                        cancel.cancel();
                    }
                }
            });
            let outcome = provisioner
                .provision_cancellable(&request, &progress, &cancel)
                .await;
            interrupt.abort();

            match outcome {
                Ok(result) => println!("{}", serde_json::to_string_pretty(&result)?),
                Err(failure) => {
                    println!("{}", serde_json::to_string_pretty(&failure.report())?);
                    bail!(failure);
                }
            }
        }

        Command::Deprovision {
            vmid,
            subdomain,
            tunnel_id,
        } => {
            let request = DeprovisionRequest {
                identifier: InstanceId::new(vmid),
                tunnel_id,
                subdomain,
            };
            let report = provisioner.deprovision(&request).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_clean() {
                bail!("{} teardown step(s) failed", report.warnings.len());
            }
        }

        Command::Check { subdomain } => {
            let available = provisioner.check_subdomain(&subdomain).await?;
            println!(
                "{}",
                serde_json::json!({
                    "subdomain": subdomain,
                    "hostname": config.provisioner.public_hostname(&subdomain),
                    "available": available,
                })
            );
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,trialhost=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    // stdout carries command output
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Load the config file (or defaults) and apply command-line/environment overrides.
fn load_config(cli: &Cli) -> anyhow::Result<ConfigFile> {
    let mut config = match &cli.config {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => ConfigFile::default(),
    };

    if let Some(token) = &cli.edge_api_token {
        config.edge.api_token = Some(token.clone());
    }
    if let Some(password) = &cli.hypervisor_password {
        config.hypervisor.password = Some(password.clone());
    }
    if let Some(secret) = &cli.hypervisor_token_secret {
        config.hypervisor.token_secret = Some(secret.clone());
    }
    if let Some(token) = &cli.api_token {
        config.api.token = Some(token.clone());
    }

    Ok(config)
}

/// In-memory backends with every configured template registered.
fn simulated_backends(config: &ConfigFile) -> Backends {
    let cloud = config
        .provisioner
        .apps
        .iter()
        .fold(SimulatedCloud::new(), |cloud, app| {
            cloud.with_template(app.template_id)
        });
    Arc::new(cloud).backends(config.provisioner.pool)
}
