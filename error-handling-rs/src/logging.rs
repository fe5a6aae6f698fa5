//! # Structured Logging
//!
//! Process-wide `tracing` subscriber setup and the per-run span that
//! carries the investigation's context id as its correlation id.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

// Set once the global subscriber is installed.
static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Subscriber settings, normally filled from `PipelineConfig.logging`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Reported once at startup.
    pub service_name: String,
    /// JSON lines when set, human-readable text otherwise.
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            service_name: "incident-orchestrator".to_string(),
            json_format: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("failed to install global subscriber: {0}")]
pub struct LoggingInitError(String);

/// Initializes the structured logging system.
///
/// `RUST_LOG` wins over `config.level` when set. Calling this more than
/// once is a no-op. `log` records from crates that use the `log` facade are
/// bridged into the same subscriber.
pub fn init_logging(config: Option<LoggingConfig>) -> Result<(), LoggingInitError> {
    if LOGGING_INITIALIZED.load(Ordering::SeqCst) {
        return Ok(());
    }

    let config = config.unwrap_or_default();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},hyper=warn,reqwest=warn", config.level)));

    let registry = Registry::default().with(filter);

    let result = if config.json_format {
        let json_layer = fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_target(true)
            .with_span_list(false);
        registry.with(json_layer).try_init()
    } else {
        let text_layer = fmt::layer().with_target(true).with_thread_ids(true);
        registry.with(text_layer).try_init()
    };

    result.map_err(|e| LoggingInitError(e.to_string()))?;
    LOGGING_INITIALIZED.store(true, Ordering::SeqCst);

    tracing::info!(
        service = %config.service_name,
        level = %config.level,
        json = %config.json_format,
        "Structured logging initialized"
    );

    Ok(())
}

/// Span wrapping one pipeline run. Every event inside inherits the
/// context id, so log lines for concurrent runs stay separable.
pub fn run_span(context_id: &str, source: &str) -> tracing::Span {
    tracing::info_span!("pipeline_run", context_id = %context_id, source = %source)
}

/// Span for a single stage inside a run.
pub fn stage_span(stage: &str, attempt_budget: usize) -> tracing::Span {
    tracing::info_span!("stage", stage = %stage, attempt_budget = attempt_budget)
}
