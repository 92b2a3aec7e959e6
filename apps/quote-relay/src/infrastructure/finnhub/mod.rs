//! Finnhub upstream adapters.
//!
//! One WebSocket client owns the live trade stream for the whole process;
//! the REST snapshot fetcher backs baseline seeding and polling fallback.

/// JSON frame encode/decode.
pub mod codec;

/// WebSocket ping/pong liveness monitoring.
pub mod heartbeat;

/// Wire message types.
pub mod messages;

/// Reconnect backoff policy.
pub mod reconnect;

/// REST quote snapshot fetcher.
pub mod snapshot;

/// The upstream stream client and link state.
pub mod stream;
