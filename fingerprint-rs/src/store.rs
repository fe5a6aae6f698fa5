// fingerprint-rs/src/store.rs
// Deduplication store: fingerprint -> IncidentRecord.
//
// Both operations that decide something (`upsert`, `claim_ticket`) read,
// decide and write in one atomic step inside the store.
// - InMemoryDedupStore: DashMap entry API.
// - FileDedupStore: append-only NDJSON log guarded by an exclusive advisory
//   file lock, re-read under the lock on every call; the last line for a
//   fingerprint wins.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::canonical::Fingerprint;
use crate::{DedupClassification, DedupError};

/// Persisted state for one deduplicated incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentRecord {
    pub fingerprint: Fingerprint,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub occurrence_count: u64,
    #[serde(default)]
    pub ticket_ref: Option<String>,
}

impl IncidentRecord {
    pub fn new(fingerprint: Fingerprint, now: DateTime<Utc>) -> Self {
        Self {
            fingerprint,
            first_seen: now,
            last_seen: now,
            occurrence_count: 1,
            ticket_ref: None,
        }
    }

    /// Register another occurrence.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.occurrence_count += 1;
        if now > self.last_seen {
            self.last_seen = now;
        }
    }

    /// `true` when `last_seen` is older than `retention` at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, retention: Option<Duration>) -> bool {
        match retention {
            Some(window) => now - self.last_seen > window,
            None => false,
        }
    }
}

/// Miss or expired hit: a fresh record, `new`. Hit: bumped record, `existing`.
fn classify_occurrence(
    current: Option<IncidentRecord>,
    fingerprint: &Fingerprint,
    now: DateTime<Utc>,
    retention: Option<Duration>,
) -> (DedupClassification, IncidentRecord) {
    match current {
        Some(mut record) if !record.is_expired(now, retention) => {
            record.touch(now);
            (DedupClassification::Existing, record)
        }
        Some(_) => {
            tracing::info!(fingerprint = %fingerprint, "Dedup record expired, starting a new incident");
            (DedupClassification::New, IncidentRecord::new(fingerprint.clone(), now))
        }
        None => (DedupClassification::New, IncidentRecord::new(fingerprint.clone(), now)),
    }
}

/// First ticket wins; the flag is set when the record took `ticket_ref`.
fn claim_on(
    current: Option<IncidentRecord>,
    fingerprint: &Fingerprint,
    ticket_ref: &str,
) -> Result<(IncidentRecord, bool), DedupError> {
    let mut record =
        current.ok_or_else(|| DedupError::UnknownFingerprint(fingerprint.to_string()))?;
    if record.ticket_ref.is_some() {
        return Ok((record, false));
    }
    record.ticket_ref = Some(ticket_ref.to_string());
    Ok((record, true))
}

/// Key-value store keyed by fingerprint.
#[async_trait]
pub trait DedupStore: Send + Sync {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<IncidentRecord>, DedupError>;

    async fn set(&self, fingerprint: &Fingerprint, record: IncidentRecord) -> Result<(), DedupError>;

    /// Record one occurrence of `fingerprint` at `now` and classify it.
    /// Atomic with respect to every other caller of the same store.
    async fn upsert(
        &self,
        fingerprint: &Fingerprint,
        now: DateTime<Utc>,
        retention: Option<Duration>,
    ) -> Result<(DedupClassification, IncidentRecord), DedupError>;

    /// Set the record's ticket reference unless one is already there.
    /// Returns the stored record, whose `ticket_ref` is the winning one.
    async fn claim_ticket(
        &self,
        fingerprint: &Fingerprint,
        ticket_ref: &str,
    ) -> Result<IncidentRecord, DedupError>;
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct InMemoryDedupStore {
    records: DashMap<Fingerprint, IncidentRecord>,
}

impl InMemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl DedupStore for InMemoryDedupStore {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<IncidentRecord>, DedupError> {
        Ok(self.records.get(fingerprint).map(|r| r.value().clone()))
    }

    async fn set(&self, fingerprint: &Fingerprint, record: IncidentRecord) -> Result<(), DedupError> {
        self.records.insert(fingerprint.clone(), record);
        Ok(())
    }

    async fn upsert(
        &self,
        fingerprint: &Fingerprint,
        now: DateTime<Utc>,
        retention: Option<Duration>,
    ) -> Result<(DedupClassification, IncidentRecord), DedupError> {
        match self.records.entry(fingerprint.clone()) {
            Entry::Occupied(mut occupied) => {
                let (class, record) =
                    classify_occurrence(Some(occupied.get().clone()), fingerprint, now, retention);
                occupied.insert(record.clone());
                Ok((class, record))
            }
            Entry::Vacant(vacant) => {
                let (class, record) = classify_occurrence(None, fingerprint, now, retention);
                vacant.insert(record.clone());
                Ok((class, record))
            }
        }
    }

    async fn claim_ticket(
        &self,
        fingerprint: &Fingerprint,
        ticket_ref: &str,
    ) -> Result<IncidentRecord, DedupError> {
        match self.records.entry(fingerprint.clone()) {
            Entry::Occupied(mut occupied) => {
                let (record, changed) =
                    claim_on(Some(occupied.get().clone()), fingerprint, ticket_ref)?;
                if changed {
                    occupied.insert(record.clone());
                }
                Ok(record)
            }
            Entry::Vacant(_) => Err(DedupError::UnknownFingerprint(fingerprint.to_string())),
        }
    }
}

/// NDJSON-backed store shared by every process pointing at the same path.
/// Reads take a shared lock on the log, decisions an exclusive one; the
/// log is re-read under the lock so no process acts on a stale view.
pub struct FileDedupStore {
    path: PathBuf,
}

impl FileDedupStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `decide` against the current record while holding the exclusive
    /// lock, appending the record it returns (if any).
    async fn locked_update<T, F>(&self, fingerprint: &Fingerprint, decide: F) -> Result<T, DedupError>
    where
        T: Send + 'static,
        F: FnOnce(Option<IncidentRecord>) -> Result<(T, Option<IncidentRecord>), DedupError>
            + Send
            + 'static,
    {
        let path = self.path.clone();
        let fingerprint = fingerprint.clone();
        tokio::task::spawn_blocking(move || -> Result<T, DedupError> {
            let mut file = open_log(&path)?;
            FileExt::lock_exclusive(&file)?;
            // The lock is released when `file` is dropped.
            let current = read_index(&mut file, &path)?.remove(&fingerprint);
            let (value, write) = decide(current)?;
            if let Some(record) = write {
                append_record(&mut file, &record)?;
            }
            Ok(value)
        })
        .await
        .map_err(|err| DedupError::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))?
    }
}

fn open_log(path: &Path) -> Result<File, DedupError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)?)
}

fn read_index(file: &mut File, path: &Path) -> Result<HashMap<Fingerprint, IncidentRecord>, DedupError> {
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;

    let mut index = HashMap::new();
    for line in contents.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<IncidentRecord>(line) {
            Ok(record) => {
                index.insert(record.fingerprint.clone(), record);
            }
            Err(err) => {
                tracing::warn!(error = %err, path = %path.display(), "skipping unreadable dedup record");
            }
        }
    }
    Ok(index)
}

fn append_record(file: &mut File, record: &IncidentRecord) -> Result<(), DedupError> {
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    file.write_all(line.as_bytes())?;
    file.flush()?;
    Ok(())
}

#[async_trait]
impl DedupStore for FileDedupStore {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<IncidentRecord>, DedupError> {
        let path = self.path.clone();
        let fingerprint = fingerprint.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<IncidentRecord>, DedupError> {
            if !path.exists() {
                return Ok(None);
            }
            let mut file = File::open(&path)?;
            FileExt::lock_shared(&file)?;
            Ok(read_index(&mut file, &path)?.remove(&fingerprint))
        })
        .await
        .map_err(|err| DedupError::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))?
    }

    async fn set(&self, fingerprint: &Fingerprint, record: IncidentRecord) -> Result<(), DedupError> {
        self.locked_update(fingerprint, move |_| Ok(((), Some(record))))
            .await
    }

    async fn upsert(
        &self,
        fingerprint: &Fingerprint,
        now: DateTime<Utc>,
        retention: Option<Duration>,
    ) -> Result<(DedupClassification, IncidentRecord), DedupError> {
        let key = fingerprint.clone();
        self.locked_update(fingerprint, move |current| {
            let (class, record) = classify_occurrence(current, &key, now, retention);
            Ok(((class, record.clone()), Some(record)))
        })
        .await
    }

    async fn claim_ticket(
        &self,
        fingerprint: &Fingerprint,
        ticket_ref: &str,
    ) -> Result<IncidentRecord, DedupError> {
        let key = fingerprint.clone();
        let ticket_ref = ticket_ref.to_string();
        self.locked_update(fingerprint, move |current| {
            let (record, changed) = claim_on(current, &key, &ticket_ref)?;
            let write = changed.then(|| record.clone());
            Ok((record, write))
        })
        .await
    }
}
