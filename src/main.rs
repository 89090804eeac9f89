use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::Parser;
use relaygate::{
    AppState, GatewayConfig,
    app::build_app,
    db::DbPool,
    observability::{self, metrics},
};

const DEFAULT_CONFIG_FILE: &str = "relaygate.toml";

/// CLI arguments for the relay gateway
#[derive(Parser, Debug)]
#[command(version, about = "OpenAI-compatible relay gateway", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to config file (defaults to ./relaygate.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Start the gateway server (default)
    Serve,
    /// Load and validate the configuration, then exit
    CheckConfig,
    /// Run database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    match args.command {
        Some(Command::CheckConfig) => run_check(args.config.as_deref()),
        Some(Command::Migrate) => run_migrate(args.config.as_deref()).await,
        Some(Command::Serve) | None => run_server(args.config.as_deref()).await,
    }
}

fn config_path(explicit_path: Option<&str>) -> PathBuf {
    PathBuf::from(explicit_path.unwrap_or(DEFAULT_CONFIG_FILE))
}

/// Load the config or exit with a readable message.
fn load_config(explicit_path: Option<&str>) -> (PathBuf, GatewayConfig) {
    let path = config_path(explicit_path);
    match GatewayConfig::from_file(&path) {
        Ok(config) => (path, config),
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", path.display(), e);
            std::process::exit(1);
        }
    }
}

fn run_check(explicit_path: Option<&str>) {
    let (path, config) = load_config(explicit_path);
    println!("Configuration OK: {}", path.display());
    println!("  channels: {}", config.channels.len());
    println!("  users:    {}", config.users.len());
    println!("  tokens:   {}", config.tokens.len());
    println!(
        "  priced models: {}",
        config.pricing.model_ratio.len() + config.pricing.model_price.len()
    );
}

async fn run_migrate(explicit_path: Option<&str>) {
    let (_, config) = load_config(explicit_path);
    if config.database.is_none() {
        eprintln!("No database configured; nothing to migrate");
        std::process::exit(1);
    }

    let result = async {
        let db = DbPool::from_config(&config.database).await?;
        db.run_migrations().await
    }
    .await;

    match result {
        Ok(()) => println!("Migrations complete"),
        Err(e) => {
            eprintln!("Migration failed: {e}");
            std::process::exit(1);
        }
    }
}

async fn run_server(explicit_path: Option<&str>) {
    let (path, config) = load_config(explicit_path);

    if let Err(e) = observability::init_tracing(&config.observability) {
        eprintln!("Failed to initialize tracing: {e}");
        std::process::exit(1);
    }

    if let Err(e) = metrics::init_metrics(&config.observability.metrics) {
        tracing::warn!(error = %e, "Failed to initialize metrics");
    }

    tracing::info!(
        config_file = %path.display(),
        channels = config.channels.len(),
        tokens = config.tokens.len(),
        "Starting relay gateway"
    );

    if config.database.is_none() {
        tracing::warn!(
            "No database configured; balances and logs live in memory and are lost on restart"
        );
    }

    let state = match AppState::new(config.clone()).await {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(error = %e, "Failed to initialize gateway");
            std::process::exit(1);
        }
    };

    let app = build_app(&config, state.clone());

    let bind_addr = SocketAddr::new(config.server.host, config.server.port);
    let listener = match tokio::net::TcpListener::bind(bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(address = %bind_addr, error = %e, "Failed to bind");
            std::process::exit(1);
        }
    };

    tracing::info!("Server listening on http://{}", bind_addr);

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    if let Err(e) = served {
        tracing::error!(error = %e, "Server error");
    }

    drain_background_tasks(&state).await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, waiting for in-flight requests to complete...");
}

/// Flush buffered consume logs, finish queued jobs and in-flight
/// settlements, then return.
async fn drain_background_tasks(state: &AppState) {
    let wait_result = tokio::time::timeout(Duration::from_secs(30), async {
        state.shutdown().await;
        let pending = state.consume_buffer.len();
        state.task_tracker.wait().await;
        pending
    })
    .await;

    match wait_result {
        Ok(pending) => tracing::info!(flushed_consume_logs = pending, "All background tasks completed"),
        Err(_) => {
            tracing::warn!("Timeout waiting for background tasks, some may not have completed")
        }
    }

    tracing::info!("Shutdown complete");
}
