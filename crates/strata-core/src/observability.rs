//! Observability infrastructure for Strata.
//!
//! Structured logging with consistent spans. This module provides
//! initialization helpers and span constructors so every component labels
//! its work the same way.

use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `strata_runner=debug`)
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for task-runner operations with standard fields.
///
/// # Example
///
/// ```rust
/// use strata_core::observability::runner_span;
///
/// let span = runner_span("assign", "task-42");
/// let _guard = span.enter();
/// // ... drive the assignment
/// ```
#[must_use]
pub fn runner_span(operation: &str, task_id: &str) -> Span {
    tracing::info_span!("task_runner", op = operation, task_id = task_id)
}

/// Creates a span for coordination-store operations.
#[must_use]
pub fn store_span(operation: &str, path: &str) -> Span {
    tracing::info_span!("coord_store", op = operation, path = path)
}
