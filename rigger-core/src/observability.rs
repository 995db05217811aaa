//! Tracing setup and span helpers

use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Initialize tracing with environment-based configuration
///
/// `RUST_LOG` wins when set; otherwise `default_filter` is used.
pub fn init_tracing(default_filter: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let fmt_layer = fmt::layer().with_target(true).with_line_number(true);

    // A second init (tests, embedded use) keeps the first subscriber.
    let _ = Registry::default()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}

/// Create a span for one infrastructure runner
#[inline]
pub fn runner_span(name: &str, step: &str) -> Span {
    tracing::info_span!(
        "runner",
        name = %name,
        step = %step,
        exit_code = tracing::field::Empty,
    )
}

/// Create a span for a registry orchestrator reconcile
#[inline]
pub fn reconcile_span(target_mode: &str, generation: i64) -> Span {
    tracing::info_span!(
        "reconcile",
        target_mode = %target_mode,
        generation = generation,
        ready = tracing::field::Empty,
    )
}

/// Create a span for the image checker working on one registry
#[inline]
pub fn checker_span(registry: &str) -> Span {
    tracing::debug_span!(
        "checker",
        registry = %registry,
        processed = tracing::field::Empty,
    )
}
