//! Connection Liveness
//!
//! Watchdog for the upstream WebSocket. Any inbound traffic (trades,
//! server pings, pongs) counts as liveness; the monitor task asks the
//! connection loop to send a ws ping each interval and reports a timeout
//! once the link has been silent past the threshold. A timeout tears the
//! connection down so the reconnect policy can take over.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Liveness tuning.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    /// How often to send a ws ping.
    pub interval: Duration,
    /// Silence threshold after which the link is considered dead.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(75),
        }
    }
}

/// Events emitted by the monitor task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// The connection loop should send a ws ping now.
    SendPing,
    /// The link has been silent past the timeout; reconnect.
    Timeout,
}

/// Shared liveness clock, written by the read loop.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    last_activity: Mutex<Instant>,
}

impl Default for HeartbeatMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatMonitor {
    /// Creates a monitor considering "now" as the last activity.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Records inbound traffic.
    pub fn record_activity(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last recorded activity.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }
}

/// Spawns the watchdog task for one connection.
///
/// The task exits after emitting [`HeartbeatEvent::Timeout`], when
/// `cancel` fires, or when the receiver is dropped.
pub fn spawn_monitor(
    config: HeartbeatConfig,
    monitor: Arc<HeartbeatMonitor>,
    cancel: CancellationToken,
) -> mpsc::Receiver<HeartbeatEvent> {
    let (tx, rx) = mpsc::channel(4);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(config.interval) => {}
            }

            if monitor.idle_for() >= config.timeout {
                let _ = tx.send(HeartbeatEvent::Timeout).await;
                break;
            }
            if tx.send(HeartbeatEvent::SendPing).await.is_err() {
                break;
            }
        }
    });

    rx
}
