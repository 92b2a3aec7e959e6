//! REST Quote Snapshots
//!
//! `SnapshotFetcher` adapter over Finnhub's `/quote` endpoint. Used for
//! cold-start baseline seeding and as the polling fallback while the
//! live stream is down.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;

use crate::application::ports::{SnapshotError, SnapshotFetcher};
use crate::domain::market::{QuoteSnapshot, normalize_symbol};
use crate::infrastructure::config::settings::StreamToken;

/// Raw `/quote` response body.
///
/// `dp` is null for symbols the provider has no previous close for; `c`
/// is 0 for unknown symbols.
#[derive(Debug, Deserialize)]
struct RawQuote {
    #[serde(rename = "c")]
    current_price: Option<f64>,
    #[serde(rename = "dp")]
    percent_change: Option<f64>,
    #[serde(rename = "t")]
    timestamp_secs: Option<i64>,
}

/// Finnhub REST quote client.
pub struct FinnhubQuoteFetcher {
    client: reqwest::Client,
    base_url: String,
    token: Option<StreamToken>,
}

impl FinnhubQuoteFetcher {
    /// Creates the fetcher.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Network`] if the HTTP client cannot be
    /// built.
    pub fn new(
        base_url: impl Into<String>,
        token: Option<StreamToken>,
        timeout: Duration,
    ) -> Result<Self, SnapshotError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SnapshotError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            token,
        })
    }
}

#[async_trait]
impl SnapshotFetcher for FinnhubQuoteFetcher {
    async fn fetch_quote(&self, symbol: &str) -> Result<QuoteSnapshot, SnapshotError> {
        let token = self
            .token
            .as_ref()
            .ok_or(SnapshotError::MissingCredentials)?;
        let symbol = normalize_symbol(symbol)
            .ok_or_else(|| SnapshotError::Unavailable(symbol.to_string()))?;

        let url = format!("{}/quote", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("symbol", symbol.as_str()), ("token", token.as_str())])
            .send()
            .await
            .map_err(|e| SnapshotError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SnapshotError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let raw: RawQuote = response
            .json()
            .await
            .map_err(|e| SnapshotError::Parse(e.to_string()))?;

        let current_price = match raw.current_price {
            Some(price) if price > 0.0 => price,
            _ => return Err(SnapshotError::Unavailable(symbol)),
        };

        // The stream speaks milliseconds; normalize REST's epoch seconds
        // so per-symbol ordering guards compare like with like.
        let timestamp_millis = raw
            .timestamp_secs
            .map_or_else(|| Utc::now().timestamp_millis(), |secs| secs * 1000);

        Ok(QuoteSnapshot {
            symbol,
            current_price,
            percent_change: raw.percent_change,
            timestamp_millis,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_token_is_reported() {
        let fetcher =
            FinnhubQuoteFetcher::new("https://example.invalid", None, Duration::from_secs(1))
                .unwrap();
        let result = fetcher.fetch_quote("AAPL").await;
        assert!(matches!(result, Err(SnapshotError::MissingCredentials)));
    }

    #[tokio::test]
    async fn blank_symbol_is_unavailable() {
        let fetcher = FinnhubQuoteFetcher::new(
            "https://example.invalid",
            Some(StreamToken::new("t")),
            Duration::from_secs(1),
        )
        .unwrap();
        let result = fetcher.fetch_quote("  ").await;
        assert!(matches!(result, Err(SnapshotError::Unavailable(_))));
    }

    #[test]
    fn raw_quote_parses_null_change() {
        let raw: RawQuote = serde_json::from_str(r#"{"c":189.5,"dp":null,"t":1690000000}"#).unwrap();
        assert_eq!(raw.current_price, Some(189.5));
        assert_eq!(raw.percent_change, None);
        assert_eq!(raw.timestamp_secs, Some(1_690_000_000));
    }
}
