//! Relay Sessions
//!
//! The session manager multiplexes downstream consumers over the single
//! upstream link. Opening a session registers its symbols in the
//! subscription registry and spawns one relay task that:
//!
//! - forwards matching trade events from the bus, enriched with derived
//!   percent change;
//! - emits a keepalive frame on a fixed interval;
//! - polls REST snapshots for its symbols while the live path is down,
//!   synthesizing trade frames (guarded so a stale snapshot never goes
//!   out after a fresher live trade);
//! - releases all registry interest exactly once when the session ends,
//!   whether by client disconnect, explicit close, or shutdown.
//!
//! The service is the only writer to the upstream link: registry 0→1 and
//! 1→0 transitions are translated into link commands here and nowhere
//! else, serialized under one lock so the link sees them in the order
//! the transitions were decided.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

use crate::application::ports::SnapshotFetcher;
use crate::domain::market::{BaselineTracker, Symbol, TradeEvent, normalize_symbol};
use crate::domain::subscription::{
    RegistryStats, SessionId, SubscriptionChanges, SubscriptionRegistry,
};
use crate::infrastructure::broadcast::TradeBus;
use crate::infrastructure::finnhub::stream::{LinkCommand, LinkStatus};

// =============================================================================
// Frames and requests
// =============================================================================

/// A price observation as delivered downstream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceUpdate {
    /// Normalized symbol.
    pub symbol: Symbol,
    /// Trade or snapshot price.
    pub price: f64,
    /// Observation timestamp, epoch milliseconds.
    pub timestamp: i64,
    /// Percent change versus previous close; omitted when unknown.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_percent: Option<f64>,
}

/// One frame on a session's outbound stream.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    /// A price update to render.
    Trade(PriceUpdate),
    /// Keepalive; carries no data.
    Keepalive,
}

/// A requested symbol, optionally with a client-provided baseline seed.
#[derive(Debug, Clone)]
pub struct SymbolSeed {
    /// Raw symbol (normalized by the service).
    pub symbol: String,
    /// Last known price, for baseline seeding.
    pub current_price: Option<f64>,
    /// Percent change matching `current_price`.
    pub percent_change: Option<f64>,
}

impl SymbolSeed {
    /// A seed carrying only a symbol.
    #[must_use]
    pub fn bare(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            current_price: None,
            percent_change: None,
        }
    }
}

/// Mid-session subscription changes.
#[derive(Debug)]
enum SessionCommand {
    AddSymbols(Vec<String>),
    RemoveSymbols(Vec<String>),
}

/// Session open failures.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Every requested symbol normalized to empty.
    #[error("no valid symbols requested")]
    NoSymbols,
}

/// Per-session tuning.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    /// Keepalive frame interval.
    pub keepalive_interval: Duration,
    /// Snapshot polling interval while the live path is down.
    pub poll_interval: Duration,
    /// Outbound frame buffer per session.
    pub buffer: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(25),
            poll_interval: Duration::from_secs(12),
            buffer: 256,
        }
    }
}

// =============================================================================
// Service
// =============================================================================

/// Couples a registry ref-count transition to the emission of its link
/// commands under one lock, so commands reach the link in the order the
/// transitions were decided. Without this, a last-session close racing
/// a fresh open of the same symbol could deliver its unsubscribe after
/// the new subscribe, leaving the upstream dark for a symbol the
/// registry still counts.
struct InterestGate {
    registry: Arc<SubscriptionRegistry>,
    link: mpsc::UnboundedSender<LinkCommand>,
    order: Mutex<()>,
}

impl InterestGate {
    fn new(registry: Arc<SubscriptionRegistry>, link: mpsc::UnboundedSender<LinkCommand>) -> Self {
        Self {
            registry,
            link,
            order: Mutex::new(()),
        }
    }

    fn add_interest(&self, session: SessionId, symbols: &[Symbol]) {
        let _ordered = self.order.lock();
        let changes = self.registry.add_interest(session, symbols);
        self.send(&changes);
    }

    fn remove_interest(&self, session: SessionId, symbols: &[Symbol]) {
        let _ordered = self.order.lock();
        let changes = self.registry.remove_interest(session, symbols);
        self.send(&changes);
    }

    fn session_closed(&self, session: SessionId) -> SubscriptionChanges {
        let _ordered = self.order.lock();
        let changes = self.registry.session_closed(session);
        self.send(&changes);
        changes
    }

    /// Send failures mean the link task is gone, which only happens at
    /// shutdown.
    fn send(&self, changes: &SubscriptionChanges) {
        for symbol in &changes.subscribe {
            let _ = self.link.send(LinkCommand::Subscribe(symbol.clone()));
        }
        for symbol in &changes.unsubscribe {
            let _ = self.link.send(LinkCommand::Unsubscribe(symbol.clone()));
        }
    }
}

/// Shared session manager.
pub struct RelayService {
    registry: Arc<SubscriptionRegistry>,
    bus: Arc<TradeBus>,
    baselines: Arc<BaselineTracker>,
    gate: Arc<InterestGate>,
    link_status: Arc<LinkStatus>,
    fetcher: Arc<dyn SnapshotFetcher>,
    settings: SessionSettings,
    session_count: Arc<AtomicI32>,
}

impl RelayService {
    /// Wires the service. One instance serves the whole process.
    #[must_use]
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        bus: Arc<TradeBus>,
        baselines: Arc<BaselineTracker>,
        link: mpsc::UnboundedSender<LinkCommand>,
        link_status: Arc<LinkStatus>,
        fetcher: Arc<dyn SnapshotFetcher>,
        settings: SessionSettings,
    ) -> Self {
        let gate = Arc::new(InterestGate::new(Arc::clone(&registry), link));
        Self {
            registry,
            bus,
            baselines,
            gate,
            link_status,
            fetcher,
            settings,
            session_count: Arc::new(AtomicI32::new(0)),
        }
    }

    /// Opens a session for the given symbols and spawns its relay task.
    ///
    /// Client-provided price/change seeds are recorded as baselines
    /// before any frame can flow. The session ends when `cancel` fires
    /// or the returned handle is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NoSymbols`] when no requested symbol
    /// survives normalization.
    pub fn open_session(
        &self,
        seeds: Vec<SymbolSeed>,
        cancel: CancellationToken,
    ) -> Result<SessionHandle, SessionError> {
        let mut symbols = Vec::new();
        for seed in &seeds {
            let Some(symbol) = normalize_symbol(&seed.symbol) else {
                continue;
            };
            if symbols.contains(&symbol) {
                continue;
            }
            if let Some(price) = seed.current_price {
                self.baselines.set_baseline(&symbol, price, seed.percent_change);
            }
            symbols.push(symbol);
        }
        if symbols.is_empty() {
            return Err(SessionError::NoSymbols);
        }

        let session_id = uuid::Uuid::new_v4().as_u64_pair().0;
        self.gate.add_interest(session_id, &symbols);

        let bus_rx = self.bus.subscribe();
        let (frame_tx, frame_rx) = mpsc::channel(self.settings.buffer);
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        self.session_count.fetch_add(1, Ordering::Relaxed);
        tracing::info!(session_id, symbols = symbols.len(), "session opened");

        let worker = SessionWorker {
            gate: Arc::clone(&self.gate),
            baselines: Arc::clone(&self.baselines),
            fetcher: Arc::clone(&self.fetcher),
            link_status: Arc::clone(&self.link_status),
            settings: self.settings,
            session_count: Arc::clone(&self.session_count),
            session_id,
            interest: symbols.into_iter().collect(),
            last_delivered: HashMap::new(),
            frame_tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(worker.run(bus_rx, command_rx));

        Ok(SessionHandle {
            session_id,
            frames: frame_rx,
            commands: command_tx,
            cancel,
        })
    }

    /// Open sessions right now.
    #[must_use]
    pub fn session_count(&self) -> i32 {
        self.session_count.load(Ordering::Relaxed)
    }

    /// Registry statistics for health reporting.
    #[must_use]
    pub fn registry_stats(&self) -> RegistryStats {
        self.registry.stats()
    }
}

// =============================================================================
// Session handle
// =============================================================================

/// Downstream end of a session.
///
/// Dropping the handle cancels the session; the relay task then releases
/// all registry interest.
pub struct SessionHandle {
    session_id: SessionId,
    frames: mpsc::Receiver<OutboundFrame>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    cancel: CancellationToken,
}

impl SessionHandle {
    /// Session identifier (for logs).
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.session_id
    }

    /// Receives the next outbound frame; `None` once the session ended.
    pub async fn recv(&mut self) -> Option<OutboundFrame> {
        self.frames.recv().await
    }

    /// Adds symbols to this session mid-stream.
    pub fn add_symbols(&self, symbols: Vec<String>) {
        let _ = self.commands.send(SessionCommand::AddSymbols(symbols));
    }

    /// Removes symbols from this session mid-stream.
    pub fn remove_symbols(&self, symbols: Vec<String>) {
        let _ = self.commands.send(SessionCommand::RemoveSymbols(symbols));
    }

    /// Ends the session.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// =============================================================================
// Relay task
// =============================================================================

struct SessionWorker {
    gate: Arc<InterestGate>,
    baselines: Arc<BaselineTracker>,
    fetcher: Arc<dyn SnapshotFetcher>,
    link_status: Arc<LinkStatus>,
    settings: SessionSettings,
    session_count: Arc<AtomicI32>,
    session_id: SessionId,
    interest: HashSet<Symbol>,
    /// Timestamp of the last frame delivered per symbol; stops stale
    /// snapshot polls from going out after fresher live trades.
    last_delivered: HashMap<Symbol, i64>,
    frame_tx: mpsc::Sender<OutboundFrame>,
    cancel: CancellationToken,
}

impl SessionWorker {
    async fn run(
        mut self,
        mut bus_rx: broadcast::Receiver<TradeEvent>,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    ) {
        self.seed_missing_baselines().await;

        let keepalive_every = self.settings.keepalive_interval;
        let poll_every = self.settings.poll_interval;
        let mut keepalive = interval_at(Instant::now() + keepalive_every, keepalive_every);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut poll = interval_at(Instant::now() + poll_every, poll_every);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut commands_closed = false;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,

                command = commands.recv(), if !commands_closed => match command {
                    Some(command) => self.handle_command(command).await,
                    None => commands_closed = true,
                },

                event = bus_rx.recv() => match event {
                    Ok(trade) => {
                        if self.forward_trade(&trade).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            session_id = self.session_id,
                            skipped,
                            "session fell behind the trade bus"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },

                _ = keepalive.tick() => {
                    if self.frame_tx.send(OutboundFrame::Keepalive).await.is_err() {
                        break;
                    }
                }

                _ = poll.tick() => {
                    if !self.link_status.is_connected()
                        && self.poll_snapshots().await.is_err()
                    {
                        break;
                    }
                }
            }
        }

        self.teardown();
    }

    /// Seeds baselines for symbols that have none, one snapshot each.
    /// Failures are isolated per symbol and non-fatal.
    async fn seed_missing_baselines(&self) {
        let mut symbols: Vec<_> = self
            .interest
            .iter()
            .filter(|symbol| self.baselines.previous_close(symbol).is_none())
            .cloned()
            .collect();
        symbols.sort();

        for symbol in symbols {
            match self.fetcher.fetch_quote(&symbol).await {
                Ok(snapshot) => {
                    self.baselines.set_baseline(
                        &snapshot.symbol,
                        snapshot.current_price,
                        snapshot.percent_change,
                    );
                }
                Err(error) => {
                    tracing::debug!(%symbol, error = %error, "baseline seed skipped");
                }
            }
        }
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::AddSymbols(raw) => {
                let mut added = Vec::new();
                for symbol in raw.iter().filter_map(|s| normalize_symbol(s)) {
                    if self.interest.insert(symbol.clone()) {
                        added.push(symbol);
                    }
                }
                if added.is_empty() {
                    return;
                }
                self.gate.add_interest(self.session_id, &added);

                for symbol in &added {
                    if self.baselines.previous_close(symbol).is_some() {
                        continue;
                    }
                    if let Ok(snapshot) = self.fetcher.fetch_quote(symbol).await {
                        self.baselines.set_baseline(
                            &snapshot.symbol,
                            snapshot.current_price,
                            snapshot.percent_change,
                        );
                    }
                }
            }
            SessionCommand::RemoveSymbols(raw) => {
                let mut removed = Vec::new();
                for symbol in raw.iter().filter_map(|s| normalize_symbol(s)) {
                    if self.interest.remove(&symbol) {
                        self.last_delivered.remove(&symbol);
                        removed.push(symbol);
                    }
                }
                if removed.is_empty() {
                    return;
                }
                self.gate.remove_interest(self.session_id, &removed);
            }
        }
    }

    /// Forwards a live trade if this session wants the symbol.
    async fn forward_trade(
        &mut self,
        trade: &TradeEvent,
    ) -> Result<(), mpsc::error::SendError<OutboundFrame>> {
        if !self.interest.contains(&trade.symbol) {
            return Ok(());
        }

        let change_percent = self
            .baselines
            .derive_change(&trade.symbol, trade.price);
        self.last_delivered
            .insert(trade.symbol.clone(), trade.timestamp_millis);

        self.frame_tx
            .send(OutboundFrame::Trade(PriceUpdate {
                symbol: trade.symbol.clone(),
                price: trade.price,
                timestamp: trade.timestamp_millis,
                change_percent,
            }))
            .await
    }

    /// Fetches snapshots for every symbol and synthesizes trade frames.
    /// Per-symbol fetch errors are logged and skipped; only a dead
    /// downstream ends the session.
    async fn poll_snapshots(&mut self) -> Result<(), mpsc::error::SendError<OutboundFrame>> {
        let mut symbols: Vec<_> = self.interest.iter().cloned().collect();
        symbols.sort();

        for symbol in symbols {
            let snapshot = match self.fetcher.fetch_quote(&symbol).await {
                Ok(snapshot) => snapshot,
                Err(error) => {
                    tracing::debug!(%symbol, error = %error, "snapshot poll failed");
                    continue;
                }
            };

            self.baselines.set_baseline(
                &snapshot.symbol,
                snapshot.current_price,
                snapshot.percent_change,
            );

            // Never replay something older than what already went out.
            let stale = self
                .last_delivered
                .get(&snapshot.symbol)
                .is_some_and(|&last| snapshot.timestamp_millis <= last);
            if stale {
                continue;
            }

            let change_percent = snapshot.percent_change.or_else(|| {
                self.baselines
                    .derive_change(&snapshot.symbol, snapshot.current_price)
            });
            self.last_delivered
                .insert(snapshot.symbol.clone(), snapshot.timestamp_millis);

            self.frame_tx
                .send(OutboundFrame::Trade(PriceUpdate {
                    symbol: snapshot.symbol,
                    price: snapshot.current_price,
                    timestamp: snapshot.timestamp_millis,
                    change_percent,
                }))
                .await?;
        }
        Ok(())
    }

    /// Releases everything this session holds. Runs exactly once: the
    /// worker is the sole owner of its id, and the registry ignores
    /// already-closed sessions.
    fn teardown(&self) {
        let changes = self.gate.session_closed(self.session_id);
        self.session_count.fetch_sub(1, Ordering::Relaxed);
        tracing::info!(
            session_id = self.session_id,
            released = changes.unsubscribe.len(),
            "session closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::{MockSnapshotFetcher, SnapshotError};
    use crate::domain::market::QuoteSnapshot;

    fn no_snapshot_fetcher() -> MockSnapshotFetcher {
        let mut fetcher = MockSnapshotFetcher::new();
        fetcher
            .expect_fetch_quote()
            .returning(|symbol| Err(SnapshotError::Unavailable(symbol.to_string())));
        fetcher
    }

    fn build_service(
        fetcher: MockSnapshotFetcher,
    ) -> (
        Arc<RelayService>,
        Arc<TradeBus>,
        mpsc::UnboundedReceiver<LinkCommand>,
        Arc<LinkStatus>,
    ) {
        build_service_with(fetcher, SessionSettings::default())
    }

    fn build_service_with(
        fetcher: MockSnapshotFetcher,
        settings: SessionSettings,
    ) -> (
        Arc<RelayService>,
        Arc<TradeBus>,
        mpsc::UnboundedReceiver<LinkCommand>,
        Arc<LinkStatus>,
    ) {
        let bus = Arc::new(TradeBus::default());
        let status = Arc::new(LinkStatus::new());
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let service = Arc::new(RelayService::new(
            Arc::new(SubscriptionRegistry::new()),
            Arc::clone(&bus),
            Arc::new(BaselineTracker::new()),
            link_tx,
            Arc::clone(&status),
            Arc::new(fetcher),
            settings,
        ));
        (service, bus, link_rx, status)
    }

    fn fast_polling() -> SessionSettings {
        SessionSettings {
            keepalive_interval: Duration::from_secs(60),
            poll_interval: Duration::from_millis(20),
            buffer: 64,
        }
    }

    fn trade(symbol: &str, price: f64, timestamp: i64) -> TradeEvent {
        TradeEvent {
            symbol: symbol.to_string(),
            price,
            timestamp_millis: timestamp,
            volume: None,
        }
    }

    async fn next_trade(handle: &mut SessionHandle) -> PriceUpdate {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), handle.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("session ended unexpectedly");
            if let OutboundFrame::Trade(update) = frame {
                return update;
            }
        }
    }

    #[tokio::test]
    async fn empty_request_is_rejected() {
        let (service, _bus, _link, _status) = build_service(no_snapshot_fetcher());
        let result = service.open_session(
            vec![SymbolSeed::bare(""), SymbolSeed::bare("   ")],
            CancellationToken::new(),
        );
        assert!(matches!(result, Err(SessionError::NoSymbols)));
        assert_eq!(service.session_count(), 0);
    }

    #[tokio::test]
    async fn session_receives_only_its_symbols() {
        let (service, bus, mut link, status) = build_service(no_snapshot_fetcher());
        status.set_state(crate::infrastructure::finnhub::stream::LinkState::Connected);

        let mut handle = service
            .open_session(vec![SymbolSeed::bare("aapl")], CancellationToken::new())
            .unwrap();
        assert_eq!(
            link.recv().await,
            Some(LinkCommand::Subscribe("AAPL".to_string()))
        );

        // Wait for the worker to finish seeding and enter its loop by
        // publishing until delivery succeeds.
        while bus.receiver_count() == 0 {
            tokio::task::yield_now().await;
        }
        bus.publish(trade("MSFT", 400.0, 1));
        bus.publish(trade("AAPL", 190.0, 2));

        let update = next_trade(&mut handle).await;
        assert_eq!(update.symbol, "AAPL");
        assert!((update.price - 190.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn seeded_baseline_yields_change_percent() {
        let (service, bus, _link, status) = build_service(no_snapshot_fetcher());
        status.set_state(crate::infrastructure::finnhub::stream::LinkState::Connected);

        let mut handle = service
            .open_session(
                vec![SymbolSeed {
                    symbol: "AAPL".to_string(),
                    current_price: Some(100.0),
                    percent_change: Some(5.0),
                }],
                CancellationToken::new(),
            )
            .unwrap();

        while bus.receiver_count() == 0 {
            tokio::task::yield_now().await;
        }
        bus.publish(trade("AAPL", 100.0, 1));

        let update = next_trade(&mut handle).await;
        let change = update.change_percent.unwrap();
        assert!((change - 5.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn unknown_baseline_omits_change_percent() {
        let (service, bus, _link, status) = build_service(no_snapshot_fetcher());
        status.set_state(crate::infrastructure::finnhub::stream::LinkState::Connected);

        let mut handle = service
            .open_session(vec![SymbolSeed::bare("NVDA")], CancellationToken::new())
            .unwrap();

        while bus.receiver_count() == 0 {
            tokio::task::yield_now().await;
        }
        bus.publish(trade("NVDA", 900.0, 1));

        let update = next_trade(&mut handle).await;
        assert_eq!(update.change_percent, None);
        let json = serde_json::to_string(&update).unwrap();
        assert!(!json.contains("changePercent"));
    }

    #[tokio::test]
    async fn shared_symbol_subscribes_once_and_unsubscribes_last() {
        let (service, _bus, mut link, _status) = build_service(no_snapshot_fetcher());

        let first = service
            .open_session(vec![SymbolSeed::bare("TSLA")], CancellationToken::new())
            .unwrap();
        let second = service
            .open_session(vec![SymbolSeed::bare("TSLA")], CancellationToken::new())
            .unwrap();

        assert_eq!(
            link.recv().await,
            Some(LinkCommand::Subscribe("TSLA".to_string()))
        );

        drop(first);
        // Registry still holds interest for the second session.
        drop(second);
        assert_eq!(
            link.recv().await,
            Some(LinkCommand::Unsubscribe("TSLA".to_string()))
        );
        assert!(link.try_recv().is_err());
    }

    #[tokio::test]
    async fn polling_serves_prices_while_disconnected() {
        let mut fetcher = MockSnapshotFetcher::new();
        fetcher.expect_fetch_quote().returning(|symbol| {
            Ok(QuoteSnapshot {
                symbol: symbol.to_string(),
                current_price: 123.0,
                percent_change: Some(1.5),
                timestamp_millis: 1_700_000_000_000,
            })
        });
        let (service, _bus, _link, _status) = build_service_with(fetcher, fast_polling());

        let mut handle = service
            .open_session(vec![SymbolSeed::bare("AAPL")], CancellationToken::new())
            .unwrap();

        // Link is disconnected, so the poll timer synthesizes a frame.
        let update = next_trade(&mut handle).await;
        assert_eq!(update.symbol, "AAPL");
        assert!((update.price - 123.0).abs() < f64::EPSILON);
        assert_eq!(update.change_percent, Some(1.5));
    }

    #[tokio::test]
    async fn stale_snapshot_never_follows_fresher_trade() {
        let mut fetcher = MockSnapshotFetcher::new();
        fetcher.expect_fetch_quote().returning(|symbol| {
            Ok(QuoteSnapshot {
                symbol: symbol.to_string(),
                current_price: 100.0,
                percent_change: None,
                // Older than the live trade below.
                timestamp_millis: 1_000,
            })
        });
        let (service, bus, _link, _status) = build_service_with(fetcher, fast_polling());

        let mut handle = service
            .open_session(vec![SymbolSeed::bare("AAPL")], CancellationToken::new())
            .unwrap();

        while bus.receiver_count() == 0 {
            tokio::task::yield_now().await;
        }
        bus.publish(trade("AAPL", 190.0, 2_000));
        let update = next_trade(&mut handle).await;
        assert_eq!(update.timestamp, 2_000);

        // Polls fire (link disconnected) but their snapshot is older than
        // the delivered trade, so nothing further goes out.
        let frame = tokio::time::timeout(Duration::from_millis(200), handle.recv()).await;
        assert!(frame.is_err(), "stale snapshot was delivered: {frame:?}");
    }

    #[tokio::test]
    async fn closing_session_releases_interest_once() {
        let (service, _bus, mut link, _status) = build_service(no_snapshot_fetcher());

        let handle = service
            .open_session(
                vec![SymbolSeed::bare("AAPL"), SymbolSeed::bare("MSFT")],
                CancellationToken::new(),
            )
            .unwrap();
        assert_eq!(service.session_count(), 1);

        // Drain the two subscribes.
        assert!(link.recv().await.is_some());
        assert!(link.recv().await.is_some());

        handle.close();
        let mut released = vec![
            link.recv().await.unwrap(),
            link.recv().await.unwrap(),
        ];
        released.sort_by_key(|command| format!("{command:?}"));
        assert_eq!(
            released,
            vec![
                LinkCommand::Unsubscribe("AAPL".to_string()),
                LinkCommand::Unsubscribe("MSFT".to_string()),
            ]
        );
        assert!(link.try_recv().is_err());

        // Give the worker a beat, then confirm the count dropped.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(service.session_count(), 0);
    }

    #[tokio::test]
    async fn contended_close_and_open_keep_commands_in_decision_order() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let (link_tx, mut link) = mpsc::unbounded_channel();
        let gate = Arc::new(InterestGate::new(Arc::clone(&registry), link_tx));

        fn replay(
            link: &mut mpsc::UnboundedReceiver<LinkCommand>,
            upstream: &mut HashSet<Symbol>,
        ) {
            while let Ok(command) = link.try_recv() {
                match command {
                    LinkCommand::Subscribe(symbol) => {
                        upstream.insert(symbol);
                    }
                    LinkCommand::Unsubscribe(symbol) => {
                        upstream.remove(&symbol);
                    }
                }
            }
        }

        // A last-holder close races a fresh open of the same symbol. The
        // gate must emit the commands in decision order, so applying them
        // in delivery order always lands on the registry's state.
        let symbols = vec!["TSLA".to_string()];
        let mut upstream: HashSet<Symbol> = HashSet::new();
        for round in 0..200u64 {
            let closing = 2 * round + 1;
            let opening = 2 * round + 2;
            gate.add_interest(closing, &symbols);

            let closer = Arc::clone(&gate);
            let close = tokio::task::spawn_blocking(move || {
                closer.session_closed(closing);
            });
            let opener = Arc::clone(&gate);
            let open_symbols = symbols.clone();
            let open = tokio::task::spawn_blocking(move || {
                opener.add_interest(opening, &open_symbols);
            });
            close.await.unwrap();
            open.await.unwrap();

            replay(&mut link, &mut upstream);
            assert_eq!(registry.active_symbols(), symbols);
            assert!(
                upstream.contains("TSLA"),
                "round {round}: upstream unsubscribed while interest remains"
            );

            gate.session_closed(opening);
            replay(&mut link, &mut upstream);
            assert!(upstream.is_empty(), "round {round}: symbol leaked upstream");
        }
    }

    #[tokio::test]
    async fn mid_session_add_and_remove() {
        let (service, _bus, mut link, _status) = build_service(no_snapshot_fetcher());

        let handle = service
            .open_session(vec![SymbolSeed::bare("AAPL")], CancellationToken::new())
            .unwrap();
        assert_eq!(
            link.recv().await,
            Some(LinkCommand::Subscribe("AAPL".to_string()))
        );

        handle.add_symbols(vec!["msft".to_string()]);
        assert_eq!(
            link.recv().await,
            Some(LinkCommand::Subscribe("MSFT".to_string()))
        );

        handle.remove_symbols(vec!["MSFT".to_string()]);
        assert_eq!(
            link.recv().await,
            Some(LinkCommand::Unsubscribe("MSFT".to_string()))
        );
    }
}
