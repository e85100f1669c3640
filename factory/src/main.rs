mod api;
mod backup;
mod cli;
mod config;
mod credential;
mod instance;
mod supervisor;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::api::ApiState;
use crate::instance::InstanceManager;
use crate::supervisor::Pm2;

#[derive(Parser)]
#[command(name = "st-factory", about = "Per-tenant application instance factory on top of pm2")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the management API.
    Serve {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Verify pm2, the application and the directories before running 'serve'. Exits 0 if all pass.
    Check {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Show managed instances straight from pm2 (no daemon needed).
    Status {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
        /// Report on a single instance id instead of listing all.
        id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is normal; variables may come from the real environment.
    let dotenv = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Ok(path) = &dotenv {
        tracing::debug!(path = %path.display(), "loaded environment file");
    }

    let cli = Cli::parse();

    match cli.command {
        Commands::Check { config: config_path } => {
            let config = cli::load_config(config_path)?;
            cli::run_check(&config).await?;
        }
        Commands::Status { config: config_path, id } => {
            let config = cli::load_config(config_path)?;
            cli::run_status(&config, id).await?;
        }
        Commands::Serve { config: config_path } => {
            let config = cli::load_config(config_path)?;
            tracing::info!("st-factory starting with config: {:?}", config);

            let supervisor = Arc::new(Pm2::new(&config.supervisor));
            let instances = Arc::new(InstanceManager::new(&config, supervisor));
            let state = Arc::new(ApiState {
                instances,
                admin_key: config.server.admin_key.clone(),
            });

            api::serve(
                &config.server.bind_addr,
                config.server.port,
                state,
                shutdown_signal(),
            )
            .await?;

            // Instances are owned by pm2 and keep running after we exit.
            tracing::info!("st-factory shut down");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to register SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT, initiating shutdown"),
        _ = terminate => tracing::info!("received SIGTERM, initiating shutdown"),
    }
}
