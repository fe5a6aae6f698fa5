//! # Error Handling Framework
//!
//! Shared error classification, structured logging, cancellation and
//! retry support for the incident-response pipeline crates.
//!
//! ## Features
//!
//! - `ErrorKind` / `Severity` tags that crate-level error enums map into
//! - `tracing` subscriber setup with JSON or text output
//! - Per-run spans carrying the context id as correlation id
//! - Retry with exponential backoff, per-attempt timeout and cancellation

pub mod cancel;
pub mod logging;
pub mod retry;
pub mod types;

// Re-export commonly used types
pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use logging::{init_logging, run_span, stage_span, LoggingConfig, LoggingInitError};
pub use retry::{RetryConfig, RetryError, RetryPolicy};
pub use types::{Classify, ErrorKind, Severity};
