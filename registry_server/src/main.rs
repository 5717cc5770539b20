//! Drydock — build-artifact registry for Drone CI.
//!
//! Mirrors the repositories and builds a Drone server knows about, stores
//! artifacts uploaded by CI jobs per commit, tags builds for release, and
//! deletes artifacts older than the configured retention policy.

mod config;
mod error;
mod metrics;
mod models;
mod registry;
mod routes;
mod services;
mod storage;
mod store;

use std::io::{BufRead, IsTerminal};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::config::RegistryConfig;
use crate::registry::Registry;
use crate::services::admin_service::AdminAuth;
use crate::services::credentials::CredentialCodec;
use crate::services::drone_service::DroneClient;
use crate::services::reconciler::sweep;
use crate::services::retention::MaxAge;
use crate::services::sweeper::Sweeper;
use crate::storage::{create_private_dir, FsBlobStore};
use crate::store::RegistryStore;

#[derive(Parser)]
#[command(name = "drydock", about = "Build-artifact registry for Drone CI")]
struct Cli {
    /// Config file
    #[arg(long, env = "DRYDOCK_CONFIG", default_value_os_t = config::default_config_path())]
    config: PathBuf,

    /// Data directory for artifacts and the registry snapshot
    #[arg(long, env = "DRYDOCK_DATA", default_value_os_t = config::default_data_dir())]
    data: PathBuf,

    /// Server port
    #[arg(short, long, env = "DRYDOCK_PORT", default_value = "8059")]
    port: u16,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the registry server (default)
    Serve,
    /// Hash an admin password read from stdin
    Password,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    }

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Password => print_password_hash(),
        Command::Serve => serve(cli.config, cli.data, cli.port).await,
    }
}

fn print_password_hash() -> anyhow::Result<()> {
    eprint!("Enter the admin password: ");
    let password = read_password()?;
    if password.is_empty() {
        anyhow::bail!("empty password");
    }
    let hash = services::password::hash_password(&password)?;
    print!("{}", password_config_lines(&hash));
    Ok(())
}

/// Config lines to paste for a new admin password.
fn password_config_lines(hash: &str) -> String {
    format!(
        "# Add this to your config and keep the hash secret:\n\
         username = \"admin\"\n\
         password_hash = \"{hash}\"\n"
    )
}

/// Read a line from stdin. On a terminal, input is not echoed.
fn read_password() -> anyhow::Result<String> {
    if !std::io::stdin().is_terminal() {
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
        return Ok(line.trim_end_matches(['\r', '\n']).to_string());
    }
    crossterm::terminal::enable_raw_mode()?;
    let result = read_hidden_line();
    crossterm::terminal::disable_raw_mode()?;
    eprintln!();
    result
}

fn read_hidden_line() -> anyhow::Result<String> {
    use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};

    let mut password = String::new();
    loop {
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        match key.code {
            KeyCode::Enter => return Ok(password),
            KeyCode::Backspace => {
                password.pop();
            }
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                anyhow::bail!("interrupted")
            }
            KeyCode::Char(c) => password.push(c),
            _ => {}
        }
    }
}

async fn serve(config_path: PathBuf, data_dir: PathBuf, port: u16) -> anyhow::Result<()> {
    tracing::info!("Starting Drydock...");

    let config = RegistryConfig::load(&config_path).await?;
    let max_age = MaxAge::parse(&config.max_age);
    tracing::info!(
        config = %config_path.display(),
        retention = %max_age,
        retention_secs = max_age.as_secs(),
        "Configuration loaded"
    );

    create_private_dir(&data_dir)
        .await
        .map_err(|e| anyhow::anyhow!("creating data directory {}: {e}", data_dir.display()))?;
    let blobs = FsBlobStore::new(data_dir.join("buildfiles"), data_dir.join("uploads"));
    blobs
        .prepare()
        .await
        .map_err(|e| anyhow::anyhow!("preparing {}: {e}", blobs.root().display()))?;

    let store = Arc::new(RegistryStore::restore(data_dir.join("storage.json")).await?);
    tracing::info!(path = %store.path().display(), repositories = store.len(), "Registry restored");
    let source = DroneClient::new(
        &config.drone_host,
        &config.drone_token,
        config.upstream_timeout(),
    )?;
    let registry = Registry::new(store.clone(), Arc::new(blobs), Arc::new(source), max_age);

    // Initialize metrics
    metrics::init_metrics();

    tracing::info!("Running initial sweep...");
    let report = sweep(&registry, config.sweep_repository_timeout()).await;
    tracing::info!(
        repositories = store.len(),
        failed = report.failed,
        "Initial sweep complete"
    );
    let sweeper = Sweeper::start(
        registry.clone(),
        config.sweep_interval(),
        config.sweep_repository_timeout(),
    );

    let state = routes::AppState {
        registry,
        admin: Arc::new(AdminAuth::new(&config.username, &config.password_hash)),
        repo_codec: CredentialCodec::repository(config.token_period_days),
        builds_per_page: config.builds_per_page,
        max_upload_bytes: config.max_upload_bytes(),
    };
    let app = routes::registry_router(state);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Drydock listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Stopping sweeper...");
    sweeper.stop().await;
    store.snapshot().await?;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
