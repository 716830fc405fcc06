use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, signal};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use circuit_monitor_service::{
    aggregator::TelemetryAggregator,
    api,
    clock::SystemClock,
    config::{Config, SourceConfig},
    db::{self, PgTelemetrySource},
    source::TelemetrySource,
    supabase::SupabaseClient,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env (ignore error if file absent, env vars may be set externally)
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env().context("Invalid configuration")?;

    let source: Arc<dyn TelemetrySource> = match &config.source {
        SourceConfig::Rest { url, api_key } => {
            info!(url = %url, "Using Supabase REST source");
            Arc::new(SupabaseClient::new(url, api_key, config.page_size))
        }
        SourceConfig::Postgres { database_url } => {
            let pool = db::create_pool(database_url).await?;
            info!("Using Postgres source");
            Arc::new(PgTelemetrySource::new(pool))
        }
    };

    let aggregator = Arc::new(TelemetryAggregator::new(
        source,
        Arc::new(SystemClock),
        config.aggregator.clone(),
    ));
    aggregator.start().await;
    match &config.device_id {
        Some(device_id) => {
            aggregator.select_device(device_id).await;
        }
        None => info!("No DEVICE_ID configured; waiting for PUT /device"),
    }

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(addr = %addr, "HTTP server listening");

    axum::serve(listener, api::router(aggregator.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    aggregator.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
