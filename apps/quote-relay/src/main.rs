//! Quote Relay Binary
//!
//! Starts the market data relay.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin quote-relay
//! ```
//!
//! # Environment Variables
//!
//! ## Optional
//! - `FINNHUB_API_KEY`: Finnhub API token. Without it the service runs
//!   in polling-only mode (REST quotes, no live stream).
//! - `QUOTE_RELAY_HTTP_PORT`: HTTP port (default: 8080)
//! - `QUOTE_RELAY_STREAM_URL`: WebSocket endpoint (default: wss://ws.finnhub.io)
//! - `QUOTE_RELAY_QUOTE_URL`: REST base URL (default: <https://finnhub.io/api/v1>)
//! - `QUOTE_RELAY_KEEPALIVE_SECS`: SSE keepalive interval (default: 25)
//! - `QUOTE_RELAY_POLL_INTERVAL_SECS`: fallback poll interval (default: 12)
//! - `QUOTE_RELAY_RECONNECT_DELAY_INITIAL_MS`: first reconnect delay (default: 2000)
//! - `QUOTE_RELAY_MAX_RECONNECT_ATTEMPTS`: 0 = retry forever (default: 0)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4318>)
//! - `OTEL_SERVICE_NAME`: Service name (default: quote-relay)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Instant;

use quote_relay::infrastructure::finnhub::heartbeat::HeartbeatConfig;
use quote_relay::infrastructure::finnhub::reconnect::ReconnectConfig;
use quote_relay::infrastructure::telemetry;
use quote_relay::{
    AppState, BaselineTracker, FinnhubClient, FinnhubQuoteFetcher, LinkEvent, RelayConfig,
    RelayServer, RelayService, SessionSettings, StreamClientConfig, SubscriptionRegistry, TradeBus,
};
use quote_relay::{LinkStatus, SnapshotFetcher};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Quote Relay");

    let config = RelayConfig::from_env();
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let registry = Arc::new(SubscriptionRegistry::new());
    let baselines = Arc::new(BaselineTracker::new());
    let bus = Arc::new(TradeBus::new(config.relay.bus_capacity));
    let link_status = Arc::new(LinkStatus::new());

    // Upstream stream client
    let (link_tx, link_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::channel(1024);
    let stream_config = StreamClientConfig {
        url: config.stream_url.clone(),
        token: config.token.clone(),
        reconnect: ReconnectConfig {
            initial_delay: config.websocket.reconnect_delay_initial,
            max_delay: config.websocket.reconnect_delay_max,
            multiplier: config.websocket.reconnect_multiplier,
            max_attempts: config.websocket.max_reconnect_attempts,
            ..ReconnectConfig::default()
        },
        heartbeat: HeartbeatConfig {
            interval: config.websocket.heartbeat_interval,
            timeout: config.websocket.heartbeat_timeout,
        },
    };
    let client = Arc::new(FinnhubClient::new(
        stream_config,
        Arc::clone(&registry),
        Arc::clone(&link_status),
        event_tx,
        shutdown_token.clone(),
    ));
    tokio::spawn(async move {
        if let Err(e) = client.run(link_rx).await {
            tracing::error!(error = %e, "stream client error");
        }
    });

    // Link event pump: trades onto the bus, lifecycle into the logs
    let event_bus = Arc::clone(&bus);
    tokio::spawn(async move {
        handle_link_events(event_rx, event_bus).await;
    });

    // Snapshot fetcher and session service
    let fetcher: Arc<dyn SnapshotFetcher> = Arc::new(FinnhubQuoteFetcher::new(
        config.quote_url.clone(),
        config.token.clone(),
        config.relay.snapshot_timeout,
    )?);
    let service = Arc::new(RelayService::new(
        Arc::clone(&registry),
        Arc::clone(&bus),
        Arc::clone(&baselines),
        link_tx,
        Arc::clone(&link_status),
        fetcher,
        SessionSettings {
            keepalive_interval: config.relay.keepalive_interval,
            poll_interval: config.relay.poll_interval,
            buffer: config.relay.session_buffer,
        },
    ));

    // HTTP boundary
    let app_state = Arc::new(AppState {
        service,
        link_status,
        bus,
        polling_only: config.polling_only(),
        started_at: Instant::now(),
    });
    let server = RelayServer::new(config.relay.http_port, app_state, shutdown_token.clone());
    tokio::spawn(async move {
        if let Err(e) = server.run().await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    tracing::info!("Quote relay ready");

    await_shutdown(shutdown_token).await;

    tracing::info!("Quote relay stopped");
    Ok(())
}

/// Pumps link events onto the trade bus.
async fn handle_link_events(mut rx: mpsc::Receiver<LinkEvent>, bus: Arc<TradeBus>) {
    while let Some(event) = rx.recv().await {
        match event {
            LinkEvent::Connected => {
                tracing::info!("trade stream connected");
            }
            LinkEvent::Disconnected => {
                tracing::warn!("trade stream disconnected");
            }
            LinkEvent::Reconnecting { attempt } => {
                tracing::info!(attempt, "trade stream reconnecting");
            }
            LinkEvent::Trade(trade) => {
                let _ = bus.publish(trade);
            }
            LinkEvent::ProviderError(msg) => {
                tracing::error!(error = %msg, "trade stream provider error");
            }
        }
    }
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_err() {
        load_dotenv_from_ancestors();
    }
}

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

/// Log the parsed configuration.
fn log_config(config: &RelayConfig) {
    tracing::info!(
        http_port = config.relay.http_port,
        polling_only = config.polling_only(),
        keepalive_secs = config.relay.keepalive_interval.as_secs(),
        poll_interval_secs = config.relay.poll_interval.as_secs(),
        "Configuration loaded"
    );
    tracing::debug!(
        stream_url = %config.stream_url,
        quote_url = %config.quote_url,
        "Upstream endpoints"
    );
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
}
