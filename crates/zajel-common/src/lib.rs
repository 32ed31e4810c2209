//! Shared utilities for Zajel: configuration, logging, error types.
//!
//! This crate provides common infrastructure used by the crypto, transport
//! and CLI crates, including the closed wire-protocol enums exchanged with
//! the relay and over data channels.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod file_transfer;
pub mod helpers;
pub mod protocol;

pub use config::TransportConfig;
pub use error::{Error, Result};
pub use protocol::*;

/// Initialize tracing with sensible defaults.
///
/// Log level is controlled by the `RUST_LOG` environment variable.
/// Defaults to `info` if not set. `ZAJEL_LOG_FORMAT=json` switches to
/// JSON lines.
pub fn init_tracing() {
    let default_level = "info";
    if helpers::env_string("ZAJEL_LOG_FORMAT").is_some_and(|v| v.eq_ignore_ascii_case("json")) {
        init_tracing_json(default_level);
    } else {
        init_tracing_with_default(default_level);
    }
}

/// Initialize tracing with a specific default level.
pub fn init_tracing_with_default(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Initialize tracing with JSON output, one object per event.
pub fn init_tracing_json(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_target(true)
        .with_current_span(false)
        .init();
}
