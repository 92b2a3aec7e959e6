//! Domain layer.
//!
//! Core market-data types and subscription bookkeeping with no external
//! I/O dependencies.

/// Market data types: symbols, trade events, baselines.
pub mod market;

/// Reference-counted subscription tracking.
pub mod subscription;
