use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use homesync::bindings::http::default_bindings;
use homesync::clock::SystemClock;
use homesync::config::Config;
use homesync::network::{ConnectivityProbe, NetworkMonitor};
use homesync::service::SyncService;
use homesync::state::AppState;
use homesync::store::SqliteStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(&config.log_level)
        }))
        .init();

    tracing::info!("Starting homesync");

    let options = SqliteConnectOptions::from_str(&config.database_url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    tracing::info!("Migrations applied");

    let handlers = default_bindings(&config.api_base_url, config.sync.request_timeout)?;
    let service = SyncService::init(
        Arc::new(SqliteStore::new(pool)),
        handlers,
        &config.sync,
        Arc::new(SystemClock),
    )
    .await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let probe = ConnectivityProbe::new(&config.api_base_url, config.probe_interval)?;
    let initially_online = probe.check().await;
    let (raw_tx, raw_rx) = watch::channel(initially_online);
    let probe_handle = probe.spawn(raw_tx, shutdown_rx.clone());

    let (monitor, monitor_handle) =
        NetworkMonitor::spawn(raw_rx, config.sync.debounce, shutdown_rx.clone());
    service.start(monitor);

    let addr = SocketAddr::new(config.host, config.port);
    let app = homesync::build_app(Arc::new(AppState {
        service: service.clone(),
        config,
    }));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown_tx.send_replace(true);
    service.dispose().await;
    let _ = probe_handle.await;
    let _ = monitor_handle.await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
