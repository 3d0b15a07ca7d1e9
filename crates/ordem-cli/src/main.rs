//! ordem CLI - server and maintenance commands
//!
//! `serve` runs the HTTP API with the pool manager and its health monitor.
//! `check`, `verify` and `hash` are one-shot maintenance commands.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use tokio::io::AsyncBufReadExt;
use tracing::{info, warn};

use ordem::api::{self, AppState};
use ordem::observability::{self, SecurityEvent};
use ordem::{CredentialVerifier, DatabaseManager, HealthMonitor, MonitorConfig};

mod config;
mod error;
mod output;

use config::OrdemConfig;
use error::{CliError, Result};

/// ordem - work-order backend
#[derive(Parser)]
#[command(name = "ordem")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to ordem.toml; ignored when missing
    #[arg(short, long, default_value = "ordem.toml", global = true)]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API
    Serve {
        /// Listen address (default: server.bind or 0.0.0.0:5000)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Connect to the database and report pool health
    Check {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Verify a user's secret, read from standard input
    Verify {
        /// Login name
        username: String,
    },

    /// Print the stored form (SHA-256 hex) of a secret read from standard input
    Hash,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve { bind } => cmd_serve(&cli.config, cli.verbose, bind).await,
        Commands::Check { json } => cmd_check(&cli.config, cli.verbose, json).await,
        Commands::Verify { username } => cmd_verify(&cli.config, cli.verbose, &username).await,
        Commands::Hash => cmd_hash().await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            output::error(&e.to_string());
            ExitCode::FAILURE
        }
    }
}

// =============================================================================
// Command Implementations
// =============================================================================

async fn cmd_serve(config_path: &Path, verbose: bool, bind: Option<String>) -> Result<()> {
    let config = OrdemConfig::load_optional(config_path)?;
    let logging = config.observability_config(verbose)?;
    let request_tracing = logging.enable_request_tracing;
    observability::init(logging)?;

    let db_config = config.database_config()?;
    let auth = config.auth_config()?;
    info!(database = %db_config.redacted_connection_string(), "Loaded configuration");

    let manager = Arc::new(DatabaseManager::postgres(db_config)?);
    ordem::security_event!(SecurityEvent::SystemStartup, "Starting ordem server");

    // The API still starts; borrowers retry pool creation on demand
    if let Err(e) = manager.create_pool().await {
        warn!(error = %e, "Starting without a database connection");
    }

    let monitor = HealthMonitor::spawn(Arc::clone(&manager), MonitorConfig::from(manager.config()));
    let app = api::router(AppState::new(Arc::clone(&manager), &auth), request_tracing);

    let addr = config.bind_addr(bind);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(address = %addr, "Server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    monitor.stop();
    manager.shutdown().await;
    ordem::security_event!(SecurityEvent::SystemShutdown, "ordem server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Could not listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

async fn cmd_check(config_path: &Path, verbose: bool, json: bool) -> Result<()> {
    let config = OrdemConfig::load_optional(config_path)?;
    if verbose {
        observability::init(config.observability_config(true)?)?;
    }

    let db_config = config.database_config()?;
    let target = db_config.redacted_connection_string();
    let manager = DatabaseManager::postgres(db_config)?;

    let spinner = (!json).then(|| output::Spinner::new(&format!("Connecting to {}", target)));
    let created = manager.create_pool().await;
    match (&created, spinner) {
        (Ok(_), Some(spinner)) => spinner.finish_success("Connection pool created"),
        (Err(e), Some(spinner)) => spinner.finish_error(&e.to_string()),
        (_, None) => {}
    }

    if let Err(e) = created {
        if json {
            output::print_json(&serde_json::json!({
                "database": target,
                "healthy": false,
                "error": e.to_string(),
            }))?;
        }
        return Err(e.into());
    }

    let health = manager.health_check().await;
    let pool = manager.status().await;

    if json {
        output::print_json(&serde_json::json!({
            "database": target,
            "healthy": health.is_healthy(),
            "health": health.to_json(),
            "pool": pool,
        }))?;
    } else {
        output::print_health(&target, &health, &pool);
    }

    manager.shutdown().await;

    if health.is_healthy() {
        Ok(())
    } else {
        Err(CliError::Unhealthy {
            message: health.message.unwrap_or_default(),
        })
    }
}

async fn cmd_verify(config_path: &Path, verbose: bool, username: &str) -> Result<()> {
    let config = OrdemConfig::load_optional(config_path)?;
    if verbose {
        observability::init(config.observability_config(true)?)?;
    }

    let secret = read_secret().await?;
    let manager = Arc::new(DatabaseManager::postgres(config.database_config()?)?);
    let verifier = CredentialVerifier::new(Arc::clone(&manager), &config.auth_config()?);

    let verified = verifier.verify_credentials(username, &secret).await;
    manager.shutdown().await;

    match verified? {
        Some(identity) => {
            output::success(&format!("{} ({})", identity.name, identity.role));
            Ok(())
        }
        None => Err(CliError::CredentialsRejected {
            username: username.to_string(),
        }),
    }
}

async fn cmd_hash() -> Result<()> {
    let secret = read_secret().await?;
    println!("{}", ordem::sha256_hex(&secret));
    Ok(())
}

/// First line of standard input, without the line terminator.
async fn read_secret() -> Result<String> {
    let mut line = String::new();
    tokio::io::BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await?;

    let secret = line.trim_end_matches(['\r', '\n']).to_string();
    if secret.is_empty() {
        return Err(CliError::EmptyInput);
    }
    Ok(secret)
}
