use std::path::{Path, PathBuf};

use clap::Parser;
use gatehouse::{
    AppState, auth::session_store::run_migrations, build_app, config::GatewayConfig,
    observability,
};
use tokio_util::task::TaskTracker;

const DEFAULT_CONFIG_PATH: &str = "gatehouse.toml";

/// CLI arguments for Gatehouse
#[derive(Parser, Debug)]
#[command(version, about = "Gatehouse SAML gateway", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to config file (defaults to ./gatehouse.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Start the gateway server (default)
    Serve,
    /// Apply the bundled session table schema to the configured database
    Migrate,
    /// Load and validate the configuration, then exit
    Check,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config_path = args
        .config
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    match args.command {
        Some(Command::Migrate) => run_migrate(&config_path).await,
        Some(Command::Check) => run_check(&config_path),
        Some(Command::Serve) | None => run_server(&config_path).await,
    }
}

fn load_config(config_path: &Path) -> GatewayConfig {
    match GatewayConfig::from_file(config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!(
                "Failed to load config from {}: {}",
                config_path.display(),
                e
            );
            std::process::exit(1);
        }
    }
}

fn init_tracing(config: &GatewayConfig) {
    if let Err(e) = observability::init_tracing(&config.observability) {
        eprintln!("Failed to initialize tracing: {}", e);
        std::process::exit(1);
    }
}

fn run_check(config_path: &Path) {
    let config = load_config(config_path);
    println!("Configuration OK: {}", config_path.display());
    println!("  services: {}", config.services.len());
    println!("  apps:     {}", config.apps.len());
    println!("  idps:     {}", config.idps.len());
}

async fn run_migrate(config_path: &Path) {
    let config = load_config(config_path);
    init_tracing(&config);

    tracing::info!(
        config_file = %config_path.display(),
        "Running database migrations"
    );

    if config.database.is_none() {
        eprintln!("Error: Database is not configured. Nothing to migrate.");
        std::process::exit(1);
    }

    match run_migrations(&config.database).await {
        Ok(()) => {
            tracing::info!("Database migrations completed successfully");
        }
        Err(e) => {
            tracing::error!(error = %e, "Database migrations failed");
            eprintln!("Error: Database migrations failed: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run_server(config_path: &Path) {
    let config = load_config(config_path);
    init_tracing(&config);

    if let Err(e) = observability::metrics::init_metrics(&config.observability.metrics) {
        tracing::warn!(error = %e, "Failed to initialize metrics; continuing without them");
    }

    if config.server.debug {
        tracing::warn!("Debug mode is enabled: error responses include internal details");
    }
    if config.saml.relay_state_secret.is_none() {
        tracing::warn!("saml.relay_state_secret is not set; RelayState travels unsigned");
    }

    let task_tracker = TaskTracker::new();
    let shutdown_timeout = config.server.shutdown_timeout();
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    let state = match AppState::from_config(config, task_tracker.clone()) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(error = %e, "Failed to initialize gateway");
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    let config = state.config.clone();
    let app = match build_app(&config, state) {
        Ok(app) => app,
        Err(e) => {
            tracing::error!(error = %e, "Failed to build router");
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("Failed to bind to {}: {}", bind_addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!("Server listening on http://{}", bind_addr);

    // Graceful shutdown: wait for SIGINT/SIGTERM, then for in-flight units
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(task_tracker, shutdown_timeout))
        .await
    {
        tracing::error!(error = %e, "Server error");
        std::process::exit(1);
    }
}

async fn shutdown_signal(task_tracker: TaskTracker, timeout: std::time::Duration) {
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

    tracing::info!("Shutdown signal received, waiting for in-flight execution units...");

    // `wait` only resolves on a closed tracker
    task_tracker.close();

    match tokio::time::timeout(timeout, task_tracker.wait()).await {
        Ok(()) => tracing::info!("All execution units completed"),
        Err(_) => {
            tracing::warn!(
                remaining = task_tracker.len(),
                "Timeout waiting for execution units, some may not have completed"
            )
        }
    }

    tracing::info!("Shutdown complete");
}
