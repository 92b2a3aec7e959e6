//! Configuration loading.

/// Environment-variable settings.
pub mod settings;

pub use settings::{RelayConfig, RelaySettings, StreamToken, WebSocketSettings};
