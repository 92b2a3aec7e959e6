//! Infrastructure layer.
//!
//! Adapters for the outside world: the Finnhub WebSocket/REST upstream,
//! the broadcast bus, the HTTP boundary, configuration, and telemetry.

/// Trade event fan-out.
pub mod broadcast;

/// Environment-driven configuration.
pub mod config;

/// Finnhub upstream: stream client, wire codec, snapshot fetcher.
pub mod finnhub;

/// HTTP boundary: SSE streaming and health endpoints.
pub mod http;

/// Tracing and OpenTelemetry setup.
pub mod telemetry;
