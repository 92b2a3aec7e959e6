//! Upstream Stream Client
//!
//! The single owner of the Finnhub WebSocket connection. One task runs
//! the connect/read/reconnect loop for the whole process; everything else
//! talks to it through [`LinkCommand`]s and observes it through
//! [`LinkEvent`]s and the shared [`LinkStatus`].
//!
//! # Lifecycle
//!
//! The client stays idle until some symbol interest exists, dials on
//! demand, replays the registry's full active set after every successful
//! connect, and backs off between attempts with the reconnect policy.
//! Without an API token it runs in degraded mode: commands are absorbed
//! so the registry stays coherent, but no connection is ever dialed and
//! sessions are served by REST polling alone.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use super::codec::{CodecError, StreamCodec};
use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatMonitor, spawn_monitor};
use super::messages::{ControlFrame, StreamMessage};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::domain::market::{Symbol, TradeEvent};
use crate::domain::subscription::SubscriptionRegistry;
use crate::infrastructure::config::settings::StreamToken;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

// =============================================================================
// Link state
// =============================================================================

/// Connection state of the upstream link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No connection; idle or backing off.
    Disconnected,
    /// Dial in progress.
    Connecting,
    /// Live connection established.
    Connected,
}

impl LinkState {
    /// Lowercase label for logs and health output.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

/// Shared, cheaply readable link state and counters.
#[derive(Debug)]
pub struct LinkStatus {
    state: RwLock<LinkState>,
    last_connected_at: RwLock<Option<DateTime<Utc>>>,
    reconnect_attempts: AtomicU32,
    messages_received: AtomicU64,
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkStatus {
    /// Creates a status in the disconnected state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(LinkState::Disconnected),
            last_connected_at: RwLock::new(None),
            reconnect_attempts: AtomicU32::new(0),
            messages_received: AtomicU64::new(0),
        }
    }

    /// Current link state.
    #[must_use]
    pub fn state(&self) -> LinkState {
        *self.state.read()
    }

    /// Whether the link is currently connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Records a state transition. Entering `Connected` stamps the
    /// connection time and clears the reconnect counter.
    pub fn set_state(&self, state: LinkState) {
        *self.state.write() = state;
        if state == LinkState::Connected {
            *self.last_connected_at.write() = Some(Utc::now());
            self.reconnect_attempts.store(0, Ordering::Relaxed);
        }
    }

    /// When the link last connected, if ever.
    #[must_use]
    pub fn last_connected_at(&self) -> Option<DateTime<Utc>> {
        *self.last_connected_at.read()
    }

    /// Records a reconnect attempt.
    pub fn record_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Reconnect attempts since the last successful connect.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    /// Records one inbound message.
    pub fn record_message(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Total inbound messages across all connections.
    #[must_use]
    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Commands and events
// =============================================================================

/// Instructions for the link task. Only the session service sends these,
/// and only in reaction to registry transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    /// Subscribe to a symbol upstream (interest went 0→1).
    Subscribe(Symbol),
    /// Unsubscribe from a symbol upstream (interest went 1→0).
    Unsubscribe(Symbol),
}

/// Notifications from the link task.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Connection established and subscriptions replayed.
    Connected,
    /// Connection lost.
    Disconnected,
    /// A reconnect attempt is about to be made.
    Reconnecting {
        /// Attempt number since the last successful connect.
        attempt: u32,
    },
    /// A trade observation arrived.
    Trade(TradeEvent),
    /// The provider reported an application-level error.
    ProviderError(String),
}

/// Fatal link task errors.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// Transport failure.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The provider closed the connection.
    #[error("connection closed by provider")]
    ConnectionClosed,

    /// No inbound traffic within the heartbeat timeout.
    #[error("heartbeat timeout")]
    HeartbeatTimeout,

    /// Outbound frame could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The reconnect attempt budget is exhausted.
    #[error("reconnect attempts exhausted")]
    ReconnectExhausted,
}

// =============================================================================
// Client
// =============================================================================

/// Configuration for the stream client.
#[derive(Debug, Clone)]
pub struct StreamClientConfig {
    /// WebSocket endpoint, without the token query parameter.
    pub url: String,
    /// API token; `None` selects degraded (polling-only) mode.
    pub token: Option<StreamToken>,
    /// Backoff policy configuration.
    pub reconnect: ReconnectConfig,
    /// Liveness configuration.
    pub heartbeat: HeartbeatConfig,
}

/// The upstream WebSocket client.
pub struct FinnhubClient {
    config: StreamClientConfig,
    codec: StreamCodec,
    registry: Arc<SubscriptionRegistry>,
    status: Arc<LinkStatus>,
    event_tx: mpsc::Sender<LinkEvent>,
    cancel: CancellationToken,
    /// Symbols requested while no connection exists. Only a dial trigger;
    /// the registry is the authority for what gets subscribed.
    pending: Mutex<HashSet<Symbol>>,
}

impl FinnhubClient {
    /// Creates the client. Call [`Self::run`] on a dedicated task.
    #[must_use]
    pub fn new(
        config: StreamClientConfig,
        registry: Arc<SubscriptionRegistry>,
        status: Arc<LinkStatus>,
        event_tx: mpsc::Sender<LinkEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            codec: StreamCodec::new(),
            registry,
            status,
            event_tx,
            cancel,
            pending: Mutex::new(HashSet::new()),
        }
    }

    /// Runs the connection loop until cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::ReconnectExhausted`] when a finite attempt
    /// budget runs out; all other exits are clean shutdowns.
    pub async fn run(
        self: Arc<Self>,
        mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    ) -> Result<(), LinkError> {
        let Some(token) = self.config.token.clone() else {
            tracing::warn!(
                "no API token configured; live stream disabled, serving from REST polling only"
            );
            return self.run_degraded(&mut commands).await;
        };

        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            // Stay idle until someone wants a symbol.
            if !self.has_interest() {
                tokio::select! {
                    () = self.cancel.cancelled() => return Ok(()),
                    command = commands.recv() => match command {
                        Some(command) => {
                            self.absorb_offline_command(command);
                            continue;
                        }
                        None => return Ok(()),
                    },
                }
            }

            self.status.set_state(LinkState::Connecting);
            match self.connect_and_run(&token, &mut commands, &mut policy).await {
                Ok(()) => {
                    self.status.set_state(LinkState::Disconnected);
                    return Ok(());
                }
                Err(error) => {
                    self.status.set_state(LinkState::Disconnected);
                    let _ = self.event_tx.send(LinkEvent::Disconnected).await;
                    tracing::warn!(error = %error, "upstream link lost");

                    let Some(delay) = policy.next_delay() else {
                        tracing::error!("reconnect attempts exhausted; giving up");
                        return Err(LinkError::ReconnectExhausted);
                    };
                    let attempt = policy.attempt_count();
                    self.status.record_reconnect_attempt();
                    let _ = self.event_tx.send(LinkEvent::Reconnecting { attempt }).await;
                    tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");

                    tokio::select! {
                        () = self.cancel.cancelled() => return Ok(()),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Degraded mode: absorb commands so shutdown and registry flow stay
    /// coherent, never dial.
    async fn run_degraded(
        &self,
        commands: &mut mpsc::UnboundedReceiver<LinkCommand>,
    ) -> Result<(), LinkError> {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return Ok(()),
                command = commands.recv() => match command {
                    Some(command) => self.absorb_offline_command(command),
                    None => return Ok(()),
                },
            }
        }
    }

    /// One connection: dial, replay subscriptions, pump frames.
    async fn connect_and_run(
        &self,
        token: &StreamToken,
        commands: &mut mpsc::UnboundedReceiver<LinkCommand>,
        policy: &mut ReconnectPolicy,
    ) -> Result<(), LinkError> {
        let url = format!("{}?token={}", self.config.url, token.as_str());
        tracing::info!(endpoint = %self.config.url, "connecting to trade stream");

        let (ws, _response) = connect_async(&url).await?;
        let (mut write, mut read) = ws.split();

        self.status.set_state(LinkState::Connected);
        policy.reset();
        let _ = self.event_tx.send(LinkEvent::Connected).await;

        // The registry survives reconnects and is the authority for what
        // gets subscribed; pending entries only triggered this dial.
        let pending = std::mem::take(&mut *self.pending.lock());
        let symbols = replay_symbols(self.registry.active_symbols(), pending);
        tracing::info!(count = symbols.len(), "replaying subscriptions");
        let mut subscribed: HashSet<Symbol> = symbols.iter().cloned().collect();
        for symbol in symbols {
            self.send_control(&mut write, ControlFrame::subscribe(symbol)).await?;
        }

        let monitor = Arc::new(HeartbeatMonitor::new());
        let heartbeat_cancel = self.cancel.child_token();
        let mut heartbeat =
            spawn_monitor(self.config.heartbeat, Arc::clone(&monitor), heartbeat_cancel.clone());

        let result = self
            .pump(
                &mut write,
                &mut read,
                commands,
                &monitor,
                &mut heartbeat,
                &mut subscribed,
            )
            .await;
        heartbeat_cancel.cancel();
        result
    }

    /// The per-connection select loop.
    async fn pump(
        &self,
        write: &mut WsSink,
        read: &mut (impl futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
              + Unpin),
        commands: &mut mpsc::UnboundedReceiver<LinkCommand>,
        monitor: &HeartbeatMonitor,
        heartbeat: &mut mpsc::Receiver<HeartbeatEvent>,
        subscribed: &mut HashSet<Symbol>,
    ) -> Result<(), LinkError> {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }

                command = commands.recv() => match command {
                    Some(command) => {
                        // Commands queued during backoff may duplicate
                        // what the replay already covered.
                        if should_forward(subscribed, &command) {
                            let frame = match command {
                                LinkCommand::Subscribe(symbol) => ControlFrame::subscribe(symbol),
                                LinkCommand::Unsubscribe(symbol) => {
                                    ControlFrame::unsubscribe(symbol)
                                }
                            };
                            self.send_control(write, frame).await?;
                        }
                    }
                    None => return Ok(()),
                },

                event = heartbeat.recv() => match event {
                    Some(HeartbeatEvent::SendPing) => {
                        write.send(Message::Ping(vec![].into())).await?;
                    }
                    Some(HeartbeatEvent::Timeout) => {
                        tracing::warn!("heartbeat timeout, forcing reconnect");
                        return Err(LinkError::HeartbeatTimeout);
                    }
                    None => {}
                },

                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        monitor.record_activity();
                        self.status.record_message();
                        self.handle_frame(text.as_str()).await;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        monitor.record_activity();
                        write.send(Message::Pong(payload)).await?;
                    }
                    Some(Ok(Message::Pong(_))) => monitor.record_activity(),
                    Some(Ok(Message::Close(frame))) => {
                        tracing::warn!(?frame, "provider closed the connection");
                        return Err(LinkError::ConnectionClosed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => return Err(error.into()),
                    None => return Err(LinkError::ConnectionClosed),
                },
            }
        }
    }

    /// Decodes and dispatches one inbound text frame. Malformed frames
    /// are logged and dropped; they never fail the connection.
    async fn handle_frame(&self, text: &str) {
        match self.codec.decode(text) {
            Ok(StreamMessage::Trade { data }) => {
                for tick in data {
                    if let Some(event) = tick.into_event() {
                        let _ = self.event_tx.send(LinkEvent::Trade(event)).await;
                    }
                }
            }
            Ok(StreamMessage::Ping) => {
                tracing::trace!("server ping");
            }
            Ok(StreamMessage::Error { msg }) => {
                tracing::warn!(message = %msg, "provider error frame");
                let _ = self.event_tx.send(LinkEvent::ProviderError(msg)).await;
            }
            Err(error) => {
                tracing::warn!(error = %error, frame = text, "dropping malformed frame");
            }
        }
    }

    async fn send_control(&self, write: &mut WsSink, frame: ControlFrame) -> Result<(), LinkError> {
        let payload = self.codec.encode(&frame)?;
        tracing::debug!(action = ?frame.action, symbol = %frame.symbol, "control frame");
        write.send(Message::Text(payload.into())).await?;
        Ok(())
    }

    /// Command handling while no connection exists. The pending set makes
    /// fresh interest wake the dial loop; everything else is covered by
    /// the registry replay on connect.
    fn absorb_offline_command(&self, command: LinkCommand) {
        let mut pending = self.pending.lock();
        match command {
            LinkCommand::Subscribe(symbol) => {
                pending.insert(symbol);
            }
            LinkCommand::Unsubscribe(symbol) => {
                pending.remove(&symbol);
            }
        }
    }

    fn has_interest(&self) -> bool {
        !self.registry.active_symbols().is_empty() || !self.pending.lock().is_empty()
    }
}

/// Symbols to subscribe after a successful connect: every symbol the
/// registry still counts interest for, once each. Pending entries exist
/// only to trigger the dial; any whose interest was released before the
/// connect completed must not come back.
fn replay_symbols(active: Vec<Symbol>, pending: HashSet<Symbol>) -> Vec<Symbol> {
    let stale = pending
        .iter()
        .filter(|&symbol| !active.contains(symbol))
        .count();
    if stale > 0 {
        tracing::debug!(stale, "dropping pending symbols with no remaining interest");
    }
    let mut seen = HashSet::with_capacity(active.len());
    active
        .into_iter()
        .filter(|symbol| seen.insert(symbol.clone()))
        .collect()
}

/// Whether a link command still needs to go upstream, given what this
/// connection already subscribed. Tracks the effect of forwarded
/// commands so a subscribe queued behind an unsubscribe goes out again.
fn should_forward(subscribed: &mut HashSet<Symbol>, command: &LinkCommand) -> bool {
    match command {
        LinkCommand::Subscribe(symbol) => subscribed.insert(symbol.clone()),
        LinkCommand::Unsubscribe(symbol) => subscribed.remove(symbol),
    }
}
