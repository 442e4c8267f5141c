//! Shared protocol, identifiers and logging setup for the Virtual Booth.
//!
//! Both the gateway and the call-session client depend on this crate so that
//! the wire format and the participant ordering rule are defined exactly once.

#![forbid(unsafe_code)]

pub mod access_code;
pub mod error;
pub mod ids;
pub mod protocol;

pub use error::{Error, Result};
pub use ids::{is_initiator, now_ms, push_id};
pub use protocol::*;

/// Initialize tracing with sensible defaults.
///
/// Log level is controlled by the `RUST_LOG` environment variable.
/// Defaults to `info` if not set.
pub fn init_tracing() {
    init_tracing_with_default("info");
}

/// Initialize tracing with a specific default filter.
pub fn init_tracing_with_default(default_filter: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
