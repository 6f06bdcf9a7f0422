//! Quote Stream Service Binary
//!
//! Starts the quote distribution service.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin quote-stream-service
//! ```
//!
//! # Environment Variables
//!
//! - `QUOTE_SERVICE_PORT`: WebSocket port (default: 7000)
//! - `QUOTE_SERVICE_HEALTH_PORT`: Health check and metrics HTTP port (default: 8083)
//! - `QUOTE_SERVICE_EMISSION_INTERVAL_MS`: Delay before each streamed quote (default: 1000)
//! - `QUOTE_SERVICE_STREAM_BUFFER`: Per-stream buffer (default: 32)
//! - `QUOTE_SERVICE_MAX_FRAME_BYTES`: Largest inbound frame (default: 65536)
//! - `QUOTE_SERVICE_CHANNEL_INPUT_BUFFER`: Unread channel inputs per stream (default: 256)
//! - `QUOTE_SERVICE_QUOTES_FILE`: Quote file, one per line (default: bundled set)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4318>)
//! - `OTEL_SERVICE_NAME`: Service name (default: quote-stream-service)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use quote_stream_service::infrastructure::health::{HealthServer, HealthServerState};
use quote_stream_service::infrastructure::telemetry;
use quote_stream_service::{
    DeliveryEngine, Dispatcher, QuoteCatalog, QuoteServer, ServiceConfig, SubscriptionRegistry,
    init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Quote Stream Service");

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics();

    let config = ServiceConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // Load the catalog before anything can be served
    let source = config.quote_source();
    let catalog = Arc::new(QuoteCatalog::load(source.as_ref()).await?);

    let registry = Arc::new(SubscriptionRegistry::new());
    let engine = DeliveryEngine::new(catalog, registry, config.delivery_config());
    let dispatcher = Dispatcher::new(engine.clone());

    let server = QuoteServer::bind(
        config.server.bind_addr(),
        dispatcher,
        config.transport_config(),
    )
    .await?;

    // Initialize health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        engine,
        server.connections(),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        Arc::clone(&health_state),
        shutdown_token.clone(),
    );

    // Spawn health server
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    // Spawn WebSocket server
    let server_shutdown = shutdown_token.clone();
    let server_state = Arc::clone(&health_state);
    let server_task = tokio::spawn(async move {
        server_state.set_listening(true);
        if let Err(e) = server.run(server_shutdown).await {
            tracing::error!(error = %e, "WebSocket server error");
        }
        server_state.set_listening(false);
    });

    tracing::info!("Quote service ready");

    await_shutdown(shutdown_token).await;

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, server_task).await.is_err() {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "WebSocket server did not stop in time"
        );
    }

    tracing::info!("Quote service stopped");
    Ok(())
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_err() {
        load_dotenv_from_ancestors();
    }
}

/// Log the parsed configuration.
fn log_config(config: &ServiceConfig) {
    tracing::info!(
        port = config.server.port,
        health_port = config.server.health_port,
        emission_interval_ms = u64::try_from(config.delivery.emission_interval.as_millis())
            .unwrap_or(u64::MAX),
        stream_buffer = config.delivery.stream_buffer,
        "Configuration loaded"
    );
    tracing::debug!(
        max_frame_bytes = config.server.max_frame_bytes,
        quotes_file = ?config.quotes_file,
        "Transport and seed data"
    );
}

/// Load .env file from any ancestor directory.
fn load_dotenv_from_ancestors() {
    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
