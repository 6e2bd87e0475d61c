use payload_host::config::Config;
use payload_host::db::Database;
use payload_host::purge::{purge_loop, PurgePolicy};
use payload_host::server::{AppContext, PayloadServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("payload_host=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let mut config = if config_path.exists() {
        let config = Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;
        info!(path = %config_path.display(), "Configuration loaded");
        config
    } else {
        warn!(path = %config_path.display(), "Configuration file not found, using defaults");
        Config::default()
    };

    if let Ok(keys) = std::env::var("API_KEY") {
        config.server.merge_api_keys(&keys);
    }
    config.validate()?;

    print_startup_banner(&config);

    let db = Database::open(&config.server.database)?;
    if config.server.seed_default_route && db.ensure_default_route()? {
        info!("Default route created at /");
    }

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let context = AppContext::new(&config, db.clone());
    let sandbox = Arc::clone(context.sandbox());

    let server = PayloadServer::new(bind_addr, context, shutdown_rx.clone());
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Payload server error");
        }
    });

    let purge_handle = if config.purge.enabled {
        let policy = PurgePolicy::from(&config.purge);
        let interval = Duration::from_secs(config.purge.interval_secs);
        Some(tokio::spawn(purge_loop(db, policy, interval, shutdown_rx.clone())))
    } else {
        None
    };

    // Wait for shutdown signal
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    info!("Stopping PHP sandbox...");
    sandbox.shutdown().await;

    // Wait for tasks to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = server_handle.await;
        if let Some(handle) = purge_handle {
            let _ = handle.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting payload host");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        admin_path = %config.server.admin_root(),
        api_path = %config.server.api_root(),
        database = %config.server.database,
        "Server configuration"
    );
    if config.server.api_keys.is_empty() {
        warn!("No API keys configured, the management API will reject every request");
    } else {
        info!(api_keys = config.server.api_keys.len(), "API keys configured");
    }
    info!(
        command = %config.sandbox.command,
        start_port = config.sandbox.start_port,
        startup_timeout_ms = config.sandbox.startup_timeout_ms,
        request_timeout_secs = config.sandbox.request_timeout_secs,
        "PHP sandbox settings"
    );
    info!(
        enabled = config.purge.enabled,
        interval_secs = config.purge.interval_secs,
        temporary_delay_days = config.purge.temporary_delay_days,
        swap_delay_days = config.purge.swap_delay_days,
        "Temporary route purge"
    );
}
