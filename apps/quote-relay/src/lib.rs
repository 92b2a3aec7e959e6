#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::default_trait_access,
        clippy::items_after_statements
    )
)]

//! Quote Relay - Live Market Data Multiplexer
//!
//! Maintains a single WebSocket connection to Finnhub's trade stream and
//! multiplexes price updates to any number of SSE clients, with
//! reference-counted symbol subscriptions, per-symbol previous-close
//! baselines, and a REST polling fallback when the live path is down.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Market data types and subscription bookkeeping
//!   - `market`: Symbols, trade events, baseline tracking
//!   - `subscription`: Ref-counted interest and the registry
//!
//! - **Application**: Ports and session orchestration
//!   - `ports`: The snapshot fetcher seam
//!   - `services`: Session manager and per-session relay tasks
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `finnhub`: WebSocket stream client and REST snapshot fetcher
//!   - `broadcast`: Trade event fan-out
//!   - `http`: SSE boundary and health endpoints
//!   - `config`: Environment configuration
//!   - `telemetry`: Tracing and OTLP export
//!
//! # Data Flow
//!
//! ```text
//!                     ┌─────────────┐     ┌─────────────┐
//! Finnhub WS ────────►│  Trade Bus  │────►│   Session   │──► SSE client 1
//!      ▲              └─────────────┘     │   Relays    │──► SSE client 2
//!      │ subscribe/unsubscribe            └─────────────┘──► SSE client N
//!      └──────────── Subscription Registry ◄────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core market data types with no external dependencies.
pub mod domain;

/// Application layer - Ports and session services.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::market::{BaselineTracker, QuoteSnapshot, Symbol, TradeEvent, normalize_symbol};
pub use domain::subscription::{
    InterestSet, RegistryStats, SessionId, SubscriptionChanges, SubscriptionRegistry,
};

// Ports
pub use application::ports::{SnapshotError, SnapshotFetcher};

// Session service (for integration tests)
pub use application::services::{
    OutboundFrame, PriceUpdate, RelayService, SessionError, SessionHandle, SessionSettings,
    SymbolSeed,
};

// Infrastructure
pub use infrastructure::broadcast::TradeBus;
pub use infrastructure::config::{RelayConfig, RelaySettings, StreamToken, WebSocketSettings};
pub use infrastructure::finnhub::snapshot::FinnhubQuoteFetcher;
pub use infrastructure::finnhub::stream::{
    FinnhubClient, LinkCommand, LinkError, LinkEvent, LinkState, LinkStatus, StreamClientConfig,
};
pub use infrastructure::http::{AppState, RelayServer};

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
