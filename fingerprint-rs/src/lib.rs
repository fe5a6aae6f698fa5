//! Alert fingerprinting and incident deduplication.
//!
//! [`fingerprint`] reduces an [`Alert`] to a short canonical key;
//! [`DedupEngine`] classifies each occurrence as `new` or `existing`
//! against a [`DedupStore`].

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod alert;
pub mod canonical;
pub mod engine;
pub mod store;

pub use alert::{Alert, Priority};
pub use canonical::{
    canonical_components, canonicalize, clean_title, detect_error_tags, extract_services,
    fingerprint, Fingerprint, MAX_FINGERPRINT_LEN,
};
pub use engine::{DedupEngine, DedupOutcome};
pub use store::{DedupStore, FileDedupStore, InMemoryDedupStore, IncidentRecord};

/// Dedup error type.
#[derive(Debug, thiserror::Error)]
pub enum DedupError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("no incident record for fingerprint '{0}'")]
    UnknownFingerprint(String),
}

/// Whether an alert opens a new incident or repeats a known one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupClassification {
    New,
    Existing,
}

impl fmt::Display for DedupClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DedupClassification::New => write!(f, "new"),
            DedupClassification::Existing => write!(f, "existing"),
        }
    }
}
