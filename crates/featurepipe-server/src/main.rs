use anyhow::Result;
use featurepipe_common::logging::{init_logging, LogConfig};
use featurepipe_server::{
    api::{self, AppState},
    config::Config,
    ingest::{ArcGisClient, TokenProvider},
    storage::Storage,
};
use sqlx::postgres::PgPoolOptions;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let log_config = LogConfig::builder()
        .log_file_prefix("featurepipe-server".to_string())
        .filter_directives(
            "featurepipe_server=debug,featurepipe_common=info,tower_http=debug,sqlx=warn".to_string(),
        )
        .build();

    let log_config = LogConfig::from_env().unwrap_or(log_config);

    let _log_guard = init_logging(&log_config)?;

    info!("Starting featurepipe server");

    let config = Config::load()?;
    info!(
        "Configuration loaded - server will bind to {}:{}",
        config.server.host, config.server.port
    );

    let db_pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(config.database.idle_timeout_secs))
        .connect(&config.database.url)
        .await?;

    info!("Database connection pool established");

    let storage = match config.storage.clone() {
        Some(storage_config) => Some(Storage::new(storage_config).await?),
        None => {
            info!("No object storage configured, attachment archiving disabled");
            None
        },
    };

    let http = ArcGisClient::http_client(config.arcgis.timeout())?;
    let tokens = match config.arcgis.credentials()? {
        Some(credentials) => {
            info!(portal = %credentials.portal_url, "Portal token generation enabled");
            TokenProvider::portal(http.clone(), credentials)
        },
        None => {
            info!("No portal account configured, using anonymous access");
            TokenProvider::anonymous(http.clone())
        },
    };

    let shutdown = CancellationToken::new();
    let state = AppState {
        db: db_pool,
        storage,
        http,
        tokens: Arc::new(tokens),
        config: Arc::new(config.clone()),
        shutdown: shutdown.clone(),
    };

    let app = api::router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(config.server.shutdown_timeout_secs, shutdown))
        .await?;

    info!("Server shut down gracefully");

    Ok(())
}

async fn shutdown_signal(timeout_secs: u64, jobs: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }

    // Running jobs stop at the next batch boundary and close their streams
    jobs.cancel();

    info!("Waiting up to {} seconds for jobs to wind down", timeout_secs);
    tokio::time::sleep(Duration::from_secs(timeout_secs.min(5))).await;
}
