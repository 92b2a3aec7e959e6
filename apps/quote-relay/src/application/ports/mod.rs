//! Application Ports
//!
//! Trait seams implemented by infrastructure adapters. The snapshot
//! fetcher is the only outbound port: it backs both cold-start baseline
//! seeding and the per-session polling fallback, and is mocked in tests.

use async_trait::async_trait;

use crate::domain::market::QuoteSnapshot;

/// Errors from the snapshot quote provider.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// No API credentials configured; REST quotes cannot be fetched.
    #[error("snapshot credentials missing")]
    MissingCredentials,

    /// Transport-level failure reaching the provider.
    #[error("snapshot request failed: {0}")]
    Network(String),

    /// Provider returned a non-success HTTP status.
    #[error("snapshot API error (status {status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// Response body could not be decoded.
    #[error("snapshot response invalid: {0}")]
    Parse(String),

    /// Provider has no usable quote for the symbol.
    #[error("no quote available for {0}")]
    Unavailable(String),
}

/// Source of point-in-time quotes.
///
/// Failures are per-symbol: one symbol erroring must not affect quotes
/// for other symbols.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    /// Fetches the current quote for a single symbol.
    async fn fetch_quote(&self, symbol: &str) -> Result<QuoteSnapshot, SnapshotError>;
}
