//! Observability utilities.
//!
//! Every worker runs inside a `stage` span carrying the stage name and id, so
//! any subscriber attributes worker logs to their stage. The `init_*`
//! functions install a process-wide subscriber filtered by `RUST_LOG`.

use crate::core::StageRef;
use tracing::Span;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::EnvFilter;

/// Returns the span a stage worker runs in.
#[must_use]
pub fn stage_span(stage: &StageRef) -> Span {
    tracing::info_span!("stage", stage = %stage.name, stage_id = %stage.id)
}

fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Installs a human-readable subscriber.
///
/// `default_filter` (e.g. `"info"` or `"stagepipe=debug"`) applies when
/// `RUST_LOG` is not set.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(default_filter: &str) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(env_filter(default_filter))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_names(true)
                .with_span_events(FmtSpan::CLOSE),
        )
        .try_init()
}

/// Installs a subscriber writing one JSON object per line.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_json_tracing(default_filter: &str) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(env_filter(default_filter))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_thread_names(true),
        )
        .try_init()
}
