//! Logging bootstrap (ambient stack): `tracing-subscriber`'s `EnvFilter`
//! sourced from `RUST_LOG`, falling back to a caller-supplied default —
//! the same two-tier default the teacher's `logger::init("INFO")` /
//! `"TRACE"` split encodes, rebuilt on the newer `tracing` idiom the rest
//! of the crate uses.

use tracing_subscriber::{fmt, EnvFilter};

/// Initializes the global `tracing` subscriber. Safe to call more than
/// once; later calls are no-ops (mirrors `logger::init`'s idempotence).
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = fmt().with_env_filter(filter).try_init();
}
