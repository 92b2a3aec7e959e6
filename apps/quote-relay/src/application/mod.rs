//! Application layer.
//!
//! Ports (trait seams) between the domain and infrastructure, and the
//! session orchestration service.

/// Port definitions implemented by infrastructure adapters.
pub mod ports;

/// Session management services.
pub mod services;
