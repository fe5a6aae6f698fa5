//! # Shared Error Classification
//!
//! Severity and kind tags shared by every crate in the incident pipeline.
//! Crates keep their own `thiserror` enums and map into these tags for
//! structured logging and retry decisions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The severity level of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    /// Informational message, not an actual error
    Info,
    /// A minor issue that doesn't affect the run
    Minor,
    /// A significant issue that degrades the result
    Major,
    /// The run cannot continue
    Critical,
    /// Process-level failure
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Minor => write!(f, "MINOR"),
            Severity::Major => write!(f, "MAJOR"),
            Severity::Critical => write!(f, "CRITICAL"),
            Severity::Fatal => write!(f, "FATAL"),
        }
    }
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Major
    }
}

/// Categorizes different kinds of errors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Bad or missing configuration
    Configuration,
    /// Collaborator output failed schema checks
    Validation,
    /// Context identity could not be kept consistent
    Integrity,
    /// Network-level failure talking to a collaborator
    Communication,
    /// Collaborator answered with an error
    External,
    /// Operation exceeded its time budget
    Timeout,
    /// Operation was cancelled by the caller
    Cancelled,
    /// Deduplication store or ticket sink failure
    Storage,
    /// Unexpected internal condition
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Configuration => write!(f, "Configuration Error"),
            ErrorKind::Validation => write!(f, "Validation Error"),
            ErrorKind::Integrity => write!(f, "Integrity Error"),
            ErrorKind::Communication => write!(f, "Communication Error"),
            ErrorKind::External => write!(f, "External Service Error"),
            ErrorKind::Timeout => write!(f, "Timeout Error"),
            ErrorKind::Cancelled => write!(f, "Cancelled"),
            ErrorKind::Storage => write!(f, "Storage Error"),
            ErrorKind::Internal => write!(f, "Internal Error"),
        }
    }
}

impl ErrorKind {
    /// Kinds that may succeed when the same call is attempted again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::Communication | ErrorKind::External | ErrorKind::Timeout
        )
    }

    /// Default severity used when an error of this kind is logged.
    pub fn default_severity(&self) -> Severity {
        match self {
            ErrorKind::Cancelled => Severity::Info,
            ErrorKind::Storage | ErrorKind::Communication | ErrorKind::External => Severity::Major,
            ErrorKind::Timeout => Severity::Major,
            ErrorKind::Validation | ErrorKind::Integrity => Severity::Critical,
            ErrorKind::Configuration | ErrorKind::Internal => Severity::Fatal,
        }
    }
}

/// Implemented by crate error enums so shared machinery can classify them.
pub trait Classify {
    fn kind(&self) -> ErrorKind;

    fn severity(&self) -> Severity {
        self.kind().default_severity()
    }
}
