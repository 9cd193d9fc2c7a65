//! Structured logging setup.
//!
//! The engine logs through `tracing`: one span per round (carrying
//! `round_id`/`round_number`) and one per connection, so a single round's
//! or connection's log lines can be filtered out of a busy server's output.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global tracing subscriber. Call once from `main`.
///
/// Respects `RUST_LOG`; defaults to `info` for this crate and `warn` for
/// its dependencies so a default run isn't drowned out by library noise.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("crash_round_engine=info,tower_http=warn"));

    fmt().with_env_filter(filter).with_target(true).init();
}

/// Span for one round's lifetime, attached to every tick/bet/cashout log
/// line emitted while that round is current.
pub fn round_span(round_id: &str, round_number: u64) -> tracing::Span {
    tracing::info_span!("round", round_id, round_number)
}

/// Span for one gateway connection's lifetime. `connection_id` is an
/// ephemeral per-socket identifier (distinct from `user_id`, which can
/// reconnect under many connection ids).
pub fn connection_span(connection_id: &str, user_id: &str) -> tracing::Span {
    tracing::info_span!("connection", connection_id, user_id)
}
