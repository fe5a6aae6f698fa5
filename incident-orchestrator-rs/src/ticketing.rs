// incident-orchestrator-rs/src/ticketing.rs
// Ticket sink. Field mapping to a real ticketing system is out of scope;
// the NDJSON sink records every action so another process can pick it up.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use error_handling::{Classify, ErrorKind};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::report::TicketAction;

#[derive(Debug, thiserror::Error)]
pub enum TicketError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Classify for TicketError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Storage
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketReceipt {
    pub ticket_ref: String,
}

#[async_trait]
pub trait TicketSink: Send + Sync {
    async fn submit(&self, action: &TicketAction) -> Result<TicketReceipt, TicketError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct TicketLogEntry {
    assigned_ref: String,
    submitted_at: DateTime<Utc>,
    #[serde(flatten)]
    action: TicketAction,
}

/// Appends one JSON line per ticket action.
pub struct NdjsonTicketSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl NdjsonTicketSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn new_ticket_ref() -> String {
        let id = Uuid::new_v4().simple().to_string();
        format!("INC-{}", id[..8].to_ascii_uppercase())
    }
}

#[async_trait]
impl TicketSink for NdjsonTicketSink {
    async fn submit(&self, action: &TicketAction) -> Result<TicketReceipt, TicketError> {
        let ticket_ref = match action {
            TicketAction::Update { ticket_ref, .. } => ticket_ref.clone(),
            TicketAction::Create { .. } => Self::new_ticket_ref(),
        };

        let entry = TicketLogEntry {
            assigned_ref: ticket_ref.clone(),
            submitted_at: Utc::now(),
            action: action.clone(),
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        info!(
            ticket_ref = %ticket_ref,
            fingerprint = %action.fingerprint(),
            create = action.is_create(),
            "Ticket action recorded"
        );
        Ok(TicketReceipt { ticket_ref })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fingerprint::{Fingerprint, Priority};

    #[tokio::test]
    async fn create_then_update_share_the_reference() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = NdjsonTicketSink::new(dir.path().join("tickets").join("log.ndjson"));
        let fp = Fingerprint::from_stored("prometheus|auth-failures|auth");

        let created = sink
            .submit(&TicketAction::Create {
                fingerprint: fp.clone(),
                title: "Auth failures".to_string(),
                priority: Priority::High,
                summary: "Root cause: auth".to_string(),
                services: vec!["auth".to_string()],
            })
            .await
            .unwrap();
        assert!(created.ticket_ref.starts_with("INC-"));
        assert_eq!(created.ticket_ref.len(), 12);

        let updated = sink
            .submit(&TicketAction::Update {
                fingerprint: fp,
                ticket_ref: created.ticket_ref.clone(),
                occurrence_count: 2,
                comment: "Recurred".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(updated.ticket_ref, created.ticket_ref);

        let contents = tokio::fs::read_to_string(sink.path()).await.unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let last: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(last["action"], "update");
        assert_eq!(last["assigned_ref"], created.ticket_ref.as_str());
    }
}
