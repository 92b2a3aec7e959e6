//! Trade Event Bus
//!
//! Fan-out of upstream trade events to session tasks via a tokio
//! broadcast channel. Publishing never blocks: when a slow session falls
//! more than the channel capacity behind, it observes a lag error and
//! the oldest events are dropped for that receiver only.

use tokio::sync::broadcast;

use crate::domain::market::TradeEvent;

/// Default channel capacity.
pub const DEFAULT_BUS_CAPACITY: usize = 4096;

/// Broadcast bus for trade events.
#[derive(Debug)]
pub struct TradeBus {
    tx: broadcast::Sender<TradeEvent>,
}

impl Default for TradeBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl TradeBus {
    /// Creates a bus with the given per-receiver capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes a trade event.
    ///
    /// Returns the number of receivers the event reached, or `None` when
    /// there are currently no receivers (not an error: sessions come and
    /// go).
    pub fn publish(&self, event: TradeEvent) -> Option<usize> {
        self.tx.send(event).ok()
    }

    /// Subscribes a new receiver; it sees only events published after
    /// this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TradeEvent> {
        self.tx.subscribe()
    }

    /// Number of live receivers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
