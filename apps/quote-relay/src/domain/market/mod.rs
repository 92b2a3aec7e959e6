//! Market data primitives.
//!
//! Trade events as observed on the upstream stream, REST quote snapshots,
//! and the per-symbol previous-close baselines used to derive percent
//! change for raw trade prices.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// A normalized ticker symbol (uppercase, trimmed, non-empty).
pub type Symbol = String;

/// Normalizes a raw symbol string.
///
/// Trims whitespace and uppercases. Returns `None` for strings that are
/// empty after trimming; empty symbols must never enter the registry or
/// the wire.
#[must_use]
pub fn normalize_symbol(raw: &str) -> Option<Symbol> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_uppercase())
}

/// A single trade observation from the live stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    /// Normalized ticker symbol.
    pub symbol: Symbol,
    /// Last trade price.
    pub price: f64,
    /// Trade timestamp, epoch milliseconds.
    pub timestamp_millis: i64,
    /// Trade volume, when the provider includes it.
    pub volume: Option<f64>,
}

/// A point-in-time quote from the REST snapshot endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct QuoteSnapshot {
    /// Normalized ticker symbol.
    pub symbol: Symbol,
    /// Current price.
    pub current_price: f64,
    /// Percent change versus previous close, when the provider knows it.
    pub percent_change: Option<f64>,
    /// Quote timestamp, epoch milliseconds.
    pub timestamp_millis: i64,
}

// ============================================================================
// Baseline Tracker
// ============================================================================

/// Per-symbol previous-close baselines.
///
/// Providers report percent change against the previous close, but live
/// trade frames carry only a price. Given one (price, percent-change)
/// observation the previous close is recovered as
/// `price / (1 + pct / 100)` and later trades for the same symbol can be
/// converted to percent change without another REST call.
#[derive(Debug, Default)]
pub struct BaselineTracker {
    previous_close: RwLock<HashMap<Symbol, f64>>,
}

impl BaselineTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a baseline for `symbol` from a quote observation.
    ///
    /// With a usable percent change and a positive price the previous
    /// close is back-computed; otherwise the current price itself becomes
    /// the baseline (percent change will derive as ~0 for prices near it).
    /// A percent change of -100 would make the denominator zero and is
    /// treated as unusable.
    pub fn set_baseline(&self, symbol: &str, current_price: f64, percent_change: Option<f64>) {
        let Some(symbol) = normalize_symbol(symbol) else {
            return;
        };
        let baseline = match percent_change {
            Some(pct) if current_price > 0.0 => {
                let denominator = 1.0 + pct / 100.0;
                if denominator.abs() > f64::EPSILON {
                    current_price / denominator
                } else {
                    current_price
                }
            }
            _ => current_price,
        };
        self.previous_close.write().insert(symbol, baseline);
    }

    /// Derives percent change for a trade price against the stored
    /// baseline.
    ///
    /// Returns `None` when no baseline is known or the baseline is not a
    /// positive price; a change figure is never fabricated.
    #[must_use]
    pub fn derive_change(&self, symbol: &str, trade_price: f64) -> Option<f64> {
        let symbol = normalize_symbol(symbol)?;
        let baselines = self.previous_close.read();
        let baseline = *baselines.get(&symbol)?;
        if baseline <= 0.0 {
            return None;
        }
        Some((trade_price - baseline) / baseline * 100.0)
    }

    /// Returns the stored previous close for `symbol`, if any.
    #[must_use]
    pub fn previous_close(&self, symbol: &str) -> Option<f64> {
        let symbol = normalize_symbol(symbol)?;
        self.previous_close.read().get(&symbol).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_uppercases_and_trims() {
        assert_eq!(normalize_symbol("  aapl "), Some("AAPL".to_string()));
        assert_eq!(normalize_symbol("Msft"), Some("MSFT".to_string()));
    }

    #[test]
    fn normalize_rejects_empty() {
        assert_eq!(normalize_symbol(""), None);
        assert_eq!(normalize_symbol("   "), None);
    }

    #[test]
    fn baseline_round_trips_percent_change() {
        let tracker = BaselineTracker::new();
        // Price 100 at +5% means previous close ~95.238.
        tracker.set_baseline("AAPL", 100.0, Some(5.0));

        let change = tracker.derive_change("AAPL", 100.0).unwrap();
        assert!((change - 5.0).abs() < 1e-9);
    }

    #[test]
    fn baseline_without_change_derives_zero_at_same_price() {
        let tracker = BaselineTracker::new();
        tracker.set_baseline("TSLA", 250.0, None);

        let change = tracker.derive_change("TSLA", 250.0).unwrap();
        assert!(change.abs() < 1e-9);

        let change = tracker.derive_change("TSLA", 255.0).unwrap();
        assert!((change - 2.0).abs() < 1e-9);
    }

    #[test]
    fn derive_without_baseline_is_none() {
        let tracker = BaselineTracker::new();
        assert_eq!(tracker.derive_change("NVDA", 900.0), None);
    }

    #[test]
    fn degenerate_percent_change_falls_back_to_price() {
        let tracker = BaselineTracker::new();
        tracker.set_baseline("ZVZZT", 10.0, Some(-100.0));
        assert_eq!(tracker.previous_close("ZVZZT"), Some(10.0));
    }

    #[test]
    fn non_positive_price_never_derives() {
        let tracker = BaselineTracker::new();
        tracker.set_baseline("HALT", 0.0, Some(3.0));
        assert_eq!(tracker.derive_change("HALT", 1.0), None);
    }

    #[test]
    fn baseline_lookup_normalizes_symbol() {
        let tracker = BaselineTracker::new();
        tracker.set_baseline("aapl", 100.0, Some(5.0));
        assert!(tracker.derive_change(" AAPL ", 100.0).is_some());
    }

    #[test]
    fn latest_baseline_wins() {
        let tracker = BaselineTracker::new();
        tracker.set_baseline("AAPL", 100.0, Some(5.0));
        tracker.set_baseline("AAPL", 200.0, None);
        assert_eq!(tracker.previous_close("AAPL"), Some(200.0));
    }
}
