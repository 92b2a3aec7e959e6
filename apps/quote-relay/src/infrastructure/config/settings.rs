//! Service Settings
//!
//! Environment-variable configuration with defaults for every tunable.
//! The only secret is the Finnhub API token; it is optional, and its
//! absence selects degraded polling-only mode rather than failing
//! startup.

use std::time::Duration;

// =============================================================================
// Token
// =============================================================================

/// Finnhub API token. Debug output is redacted.
#[derive(Clone)]
pub struct StreamToken(String);

impl StreamToken {
    /// Wraps a raw token string.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token, for URL/query construction only.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for StreamToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StreamToken").field(&"[REDACTED]").finish()
    }
}

// =============================================================================
// Settings groups
// =============================================================================

/// Upstream WebSocket tunables.
#[derive(Debug, Clone)]
pub struct WebSocketSettings {
    /// Interval between outbound ws pings.
    pub heartbeat_interval: Duration,
    /// Inbound-silence threshold before forcing a reconnect.
    pub heartbeat_timeout: Duration,
    /// Delay before the first reconnect attempt.
    pub reconnect_delay_initial: Duration,
    /// Cap on the reconnect delay.
    pub reconnect_delay_max: Duration,
    /// Backoff growth factor.
    pub reconnect_multiplier: f64,
    /// Reconnect attempt budget; 0 = unlimited.
    pub max_reconnect_attempts: u32,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(75),
            reconnect_delay_initial: Duration::from_secs(2),
            reconnect_delay_max: Duration::from_secs(60),
            reconnect_multiplier: 2.0,
            max_reconnect_attempts: 0,
        }
    }
}

/// Relay and HTTP boundary tunables.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// HTTP listen port.
    pub http_port: u16,
    /// Trade bus capacity (events buffered per slow receiver).
    pub bus_capacity: usize,
    /// Per-session outbound frame buffer.
    pub session_buffer: usize,
    /// SSE keepalive ping interval.
    pub keepalive_interval: Duration,
    /// Snapshot polling interval while the live path is down.
    pub poll_interval: Duration,
    /// Snapshot HTTP request timeout.
    pub snapshot_timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            http_port: 8080,
            bus_capacity: 4096,
            session_buffer: 256,
            keepalive_interval: Duration::from_secs(25),
            poll_interval: Duration::from_secs(12),
            snapshot_timeout: Duration::from_secs(10),
        }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// API token; `None` means polling-only degraded mode.
    pub token: Option<StreamToken>,
    /// WebSocket endpoint (token appended at connect time).
    pub stream_url: String,
    /// REST API base URL.
    pub quote_url: String,
    /// WebSocket tunables.
    pub websocket: WebSocketSettings,
    /// Relay tunables.
    pub relay: RelaySettings,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            token: None,
            stream_url: "wss://ws.finnhub.io".to_string(),
            quote_url: "https://finnhub.io/api/v1".to_string(),
            websocket: WebSocketSettings::default(),
            relay: RelaySettings::default(),
        }
    }
}

impl RelayConfig {
    /// Loads configuration from the environment, falling back to
    /// defaults for anything unset or unparsable.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let token = std::env::var("FINNHUB_API_KEY")
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .map(StreamToken::new);

        let websocket = WebSocketSettings {
            heartbeat_interval: parse_env_duration_secs(
                "QUOTE_RELAY_HEARTBEAT_INTERVAL_SECS",
                defaults.websocket.heartbeat_interval,
            ),
            heartbeat_timeout: parse_env_duration_secs(
                "QUOTE_RELAY_HEARTBEAT_TIMEOUT_SECS",
                defaults.websocket.heartbeat_timeout,
            ),
            reconnect_delay_initial: parse_env_duration_millis(
                "QUOTE_RELAY_RECONNECT_DELAY_INITIAL_MS",
                defaults.websocket.reconnect_delay_initial,
            ),
            reconnect_delay_max: parse_env_duration_secs(
                "QUOTE_RELAY_RECONNECT_DELAY_MAX_SECS",
                defaults.websocket.reconnect_delay_max,
            ),
            reconnect_multiplier: parse_env_f64(
                "QUOTE_RELAY_RECONNECT_MULTIPLIER",
                defaults.websocket.reconnect_multiplier,
            ),
            max_reconnect_attempts: parse_env_u32(
                "QUOTE_RELAY_MAX_RECONNECT_ATTEMPTS",
                defaults.websocket.max_reconnect_attempts,
            ),
        };

        let relay = RelaySettings {
            http_port: parse_env_u16("QUOTE_RELAY_HTTP_PORT", defaults.relay.http_port),
            bus_capacity: parse_env_usize("QUOTE_RELAY_BUS_CAPACITY", defaults.relay.bus_capacity),
            session_buffer: parse_env_usize(
                "QUOTE_RELAY_SESSION_BUFFER",
                defaults.relay.session_buffer,
            ),
            keepalive_interval: parse_env_duration_secs(
                "QUOTE_RELAY_KEEPALIVE_SECS",
                defaults.relay.keepalive_interval,
            ),
            poll_interval: parse_env_duration_secs(
                "QUOTE_RELAY_POLL_INTERVAL_SECS",
                defaults.relay.poll_interval,
            ),
            snapshot_timeout: parse_env_duration_secs(
                "QUOTE_RELAY_SNAPSHOT_TIMEOUT_SECS",
                defaults.relay.snapshot_timeout,
            ),
        };

        Self {
            token,
            stream_url: std::env::var("QUOTE_RELAY_STREAM_URL")
                .unwrap_or(defaults.stream_url),
            quote_url: std::env::var("QUOTE_RELAY_QUOTE_URL").unwrap_or(defaults.quote_url),
            websocket,
            relay,
        }
    }

    /// Whether the service runs without a live stream.
    #[must_use]
    pub const fn polling_only(&self) -> bool {
        self.token.is_none()
    }
}

// =============================================================================
// Env parsing helpers
// =============================================================================

fn parse_env_u16(name: &str, default: u16) -> u16 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_duration_secs(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_env_duration_millis(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map_or(default, Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_debug_is_redacted() {
        let token = StreamToken::new("super-secret");
        let debug = format!("{token:?}");
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn defaults_are_sane() {
        let config = RelayConfig::default();
        assert!(config.polling_only());
        assert_eq!(config.relay.keepalive_interval, Duration::from_secs(25));
        assert_eq!(config.relay.poll_interval, Duration::from_secs(12));
        assert_eq!(config.websocket.reconnect_delay_initial, Duration::from_secs(2));
        assert_eq!(config.websocket.max_reconnect_attempts, 0);
    }

    #[test]
    fn parse_helpers_fall_back_when_unset() {
        // set_var is unsafe under edition 2024 and unsafe code is
        // forbidden crate-wide, so only the unset path is exercised here.
        assert_eq!(parse_env_u16("QR_TEST_UNSET_U16", 7), 7);
        assert_eq!(parse_env_usize("QR_TEST_UNSET_USIZE", 11), 11);
        assert_eq!(
            parse_env_duration_secs("QR_TEST_UNSET_SECS", Duration::from_secs(90)),
            Duration::from_secs(90)
        );
    }
}
