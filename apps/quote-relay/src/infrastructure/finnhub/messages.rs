//! Finnhub Wire Messages
//!
//! Frame shapes for the `wss://ws.finnhub.io` trade stream. Inbound
//! frames are tagged objects (`{"type":"trade",...}`); outbound control
//! frames carry a single symbol each.

use serde::{Deserialize, Serialize};

use crate::domain::market::{Symbol, TradeEvent, normalize_symbol};

// =============================================================================
// Inbound
// =============================================================================

/// A message received on the trade stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamMessage {
    /// A batch of trade observations.
    Trade {
        /// Ticks in this frame; may be empty.
        #[serde(default)]
        data: Vec<TradeTick>,
    },
    /// Application-level server ping; liveness signal only.
    Ping,
    /// Provider-reported error.
    Error {
        /// Provider error message.
        #[serde(default)]
        msg: String,
    },
}

/// One trade tick inside a trade frame.
#[derive(Debug, Clone, Deserialize)]
pub struct TradeTick {
    /// Raw symbol as sent by the provider.
    #[serde(rename = "s")]
    pub symbol: String,
    /// Last trade price.
    #[serde(rename = "p")]
    pub price: f64,
    /// Trade timestamp, epoch milliseconds.
    #[serde(rename = "t")]
    pub timestamp_millis: i64,
    /// Trade volume, when present.
    #[serde(rename = "v", default)]
    pub volume: Option<f64>,
}

impl TradeTick {
    /// Converts the tick into a domain event.
    ///
    /// Returns `None` when the symbol normalizes to empty; such ticks are
    /// dropped rather than forwarded.
    #[must_use]
    pub fn into_event(self) -> Option<TradeEvent> {
        let symbol = normalize_symbol(&self.symbol)?;
        Some(TradeEvent {
            symbol,
            price: self.price,
            timestamp_millis: self.timestamp_millis,
            volume: self.volume,
        })
    }
}

// =============================================================================
// Outbound
// =============================================================================

/// Control frame action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    /// Start receiving trades for a symbol.
    Subscribe,
    /// Stop receiving trades for a symbol.
    Unsubscribe,
}

/// Outbound subscribe/unsubscribe frame.
#[derive(Debug, Clone, Serialize)]
pub struct ControlFrame {
    /// Frame action.
    #[serde(rename = "type")]
    pub action: ControlAction,
    /// Target symbol.
    pub symbol: Symbol,
}

impl ControlFrame {
    /// A subscribe frame for `symbol`.
    #[must_use]
    pub fn subscribe(symbol: Symbol) -> Self {
        Self {
            action: ControlAction::Subscribe,
            symbol,
        }
    }

    /// An unsubscribe frame for `symbol`.
    #[must_use]
    pub fn unsubscribe(symbol: Symbol) -> Self {
        Self {
            action: ControlAction::Unsubscribe,
            symbol,
        }
    }
}
