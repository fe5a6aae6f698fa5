// fingerprint-rs/src/engine.rs
// Fingerprint an alert and classify it against the dedup store. The store
// makes each read-decide-write atomic; callers in this process also queue
// on a per-fingerprint async lock so they do not pile up on the store.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use config_rs::DedupConfig;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, instrument};

use crate::alert::Alert;
use crate::canonical::{fingerprint, Fingerprint};
use crate::store::{DedupStore, IncidentRecord};
use crate::{DedupClassification, DedupError};

/// Result of checking one alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupOutcome {
    pub fingerprint: Fingerprint,
    pub classification: DedupClassification,
    pub record: IncidentRecord,
}

impl DedupOutcome {
    pub fn is_new(&self) -> bool {
        self.classification == DedupClassification::New
    }
}

pub struct DedupEngine {
    store: Arc<dyn DedupStore>,
    locks: DashMap<Fingerprint, Arc<Mutex<()>>>,
    retention: Option<Duration>,
}

impl DedupEngine {
    pub fn new(store: Arc<dyn DedupStore>, config: &DedupConfig) -> Self {
        let retention = config
            .retention_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .map(Duration::seconds);
        Self {
            store,
            locks: DashMap::new(),
            retention,
        }
    }

    pub fn store(&self) -> &Arc<dyn DedupStore> {
        &self.store
    }

    fn lock_for(&self, fingerprint: &Fingerprint) -> Arc<Mutex<()>> {
        self.locks
            .entry(fingerprint.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the map's entry once no other caller holds the lock.
    fn release(&self, fingerprint: &Fingerprint, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.locks
            .remove_if(fingerprint, |_, held| Arc::strong_count(held) == 1);
    }

    /// Fingerprint `alert` and record the occurrence at `alert.received_at`.
    pub async fn check(&self, alert: &Alert) -> Result<DedupOutcome, DedupError> {
        let fp = fingerprint(alert);
        self.record_occurrence(&fp, alert.received_at).await
    }

    /// Miss (or expired hit): create a record and classify `new`.
    /// Hit: bump the count and `last_seen`, classify `existing`.
    #[instrument(skip(self), fields(fingerprint = %fp))]
    pub async fn record_occurrence(
        &self,
        fp: &Fingerprint,
        now: DateTime<Utc>,
    ) -> Result<DedupOutcome, DedupError> {
        let lock = self.lock_for(fp);
        let upserted = {
            let _guard = lock.lock().await;
            self.store.upsert(fp, now, self.retention).await
        };
        self.release(fp, lock);
        let (classification, record) = upserted?;

        metrics::increment_counter!(
            "incident_dedup_total",
            "classification" => classification.to_string()
        );
        info!(
            classification = %classification,
            occurrences = record.occurrence_count,
            "Alert deduplicated"
        );

        Ok(DedupOutcome {
            fingerprint: fp.clone(),
            classification,
            record,
        })
    }

    /// Store the ticket reference opened for this incident unless another
    /// run got there first. The returned record carries the winning ref.
    pub async fn attach_ticket(
        &self,
        fp: &Fingerprint,
        ticket_ref: &str,
    ) -> Result<IncidentRecord, DedupError> {
        let lock = self.lock_for(fp);
        let claimed = {
            let _guard = lock.lock().await;
            self.store.claim_ticket(fp, ticket_ref).await
        };
        self.release(fp, lock);
        let record = claimed?;
        if record.ticket_ref.as_deref() != Some(ticket_ref) {
            info!(
                winner = record.ticket_ref.as_deref().unwrap_or("-"),
                "Incident already has a ticket"
            );
        }
        Ok(record)
    }
}
