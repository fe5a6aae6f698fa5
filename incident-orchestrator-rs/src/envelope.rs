// incident-orchestrator-rs/src/envelope.rs
// The context envelope: one investigation's identity and accumulated state.
// Stage results are write-once and the decision log is append-only; the
// controller owns the canonical copy and hands out clones at stage
// boundaries.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use fingerprint::Priority;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::placeholder::is_placeholder_context_id;
use crate::stages::{StageId, StagePayload};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum EnvelopeError {
    #[error("stage '{0}' already has a recorded result")]
    StageAlreadyRecorded(StageId),

    #[error("result for stage '{found}' cannot be stored under '{expected}'")]
    StageMismatch { expected: StageId, found: StageId },
}

/// One stage's validated output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageId,
    pub completed_at: DateTime<Utc>,
    pub payload: StagePayload,
    /// The stage's own proceed-to-next decision, before any override.
    pub decision: bool,
    #[serde(default)]
    pub tools_executed: u64,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    /// A negative stage decision was overridden.
    Override,
    /// Priority was raised to critical mid-run.
    PriorityEscalation,
    /// The envelope was restored after a bad context id echo.
    ContextResync,
    /// The optional anomaly stage was entered or skipped.
    Branch,
    /// The run stopped at a gate.
    Terminal,
    /// A placeholder value was replaced with a verified one.
    PlaceholderSubstitution,
}

/// An audit entry. Never modified once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub kind: DecisionKind,
    pub stage: Option<StageId>,
    pub override_applied: bool,
    pub original_decision: Option<bool>,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
    /// Position in the log, starting at 0.
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugEntry {
    pub at: DateTime<Utc>,
    pub stage: Option<StageId>,
    pub message: String,
}

/// How a stage's echoed context id compares with the envelope's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextEcho {
    Match,
    Missing,
    Placeholder(String),
    Malformed(String),
    Mismatch(String),
}

impl ContextEcho {
    pub fn is_match(&self) -> bool {
        matches!(self, ContextEcho::Match)
    }

    pub fn describe(&self) -> String {
        match self {
            ContextEcho::Match => "context id matches".to_string(),
            ContextEcho::Missing => "context id missing from stage output".to_string(),
            ContextEcho::Placeholder(v) => format!("placeholder context id '{}'", v),
            ContextEcho::Malformed(v) => format!("malformed context id '{}'", v),
            ContextEcho::Mismatch(v) => format!("mismatched context id '{}'", v),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEnvelope {
    context_id: String,
    pub created_at: DateTime<Utc>,
    pub source: String,
    pub initial_params: Value,
    pub priority: Priority,
    pub force_deep_analysis: bool,
    stage_results: BTreeMap<StageId, StageResult>,
    decisions: BTreeMap<String, Decision>,
    debug: Vec<DebugEntry>,
    /// Bumped on every merge into the envelope.
    version: u64,
}

impl ContextEnvelope {
    pub fn new(
        source: impl Into<String>,
        initial_params: Value,
        priority: Priority,
        force_deep_analysis: bool,
    ) -> Self {
        Self {
            context_id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            source: source.into(),
            initial_params,
            priority,
            force_deep_analysis,
            stage_results: BTreeMap::new(),
            decisions: BTreeMap::new(),
            debug: Vec::new(),
            version: 0,
        }
    }

    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn stage_results(&self) -> &BTreeMap<StageId, StageResult> {
        &self.stage_results
    }

    pub fn stage_result(&self, stage: StageId) -> Option<&StageResult> {
        self.stage_results.get(&stage)
    }

    /// Results in completion order.
    pub fn completed_stages(&self) -> Vec<&StageResult> {
        let mut results: Vec<_> = self.stage_results.values().collect();
        results.sort_by_key(|r| r.completed_at);
        results
    }

    pub fn decisions(&self) -> &BTreeMap<String, Decision> {
        &self.decisions
    }

    /// Decisions in the order they were recorded.
    pub fn decision_log(&self) -> Vec<(&str, &Decision)> {
        let mut log: Vec<_> = self
            .decisions
            .iter()
            .map(|(k, d)| (k.as_str(), d))
            .collect();
        log.sort_by_key(|(_, d)| d.sequence);
        log
    }

    pub fn debug_trail(&self) -> &[DebugEntry] {
        &self.debug
    }

    pub fn is_critical(&self) -> bool {
        self.priority == Priority::Critical
    }

    /// Store a stage result. Each stage id can be written once.
    pub fn record_stage_result(&mut self, result: StageResult) -> Result<(), EnvelopeError> {
        if result.payload.stage() != result.stage {
            return Err(EnvelopeError::StageMismatch {
                expected: result.stage,
                found: result.payload.stage(),
            });
        }
        if self.stage_results.contains_key(&result.stage) {
            return Err(EnvelopeError::StageAlreadyRecorded(result.stage));
        }
        self.stage_results.insert(result.stage, result);
        self.version += 1;
        Ok(())
    }

    /// Append a decision under `key`. An existing key is never replaced;
    /// the entry goes under `key#2`, `key#3`, ... instead. Returns the key
    /// actually used.
    pub fn record_decision(
        &mut self,
        key: &str,
        kind: DecisionKind,
        stage: Option<StageId>,
        override_applied: bool,
        original_decision: Option<bool>,
        reason: impl Into<String>,
    ) -> String {
        let mut actual = key.to_string();
        let mut suffix = 2;
        while self.decisions.contains_key(&actual) {
            actual = format!("{}#{}", key, suffix);
            suffix += 1;
        }

        let decision = Decision {
            kind,
            stage,
            override_applied,
            original_decision,
            reason: reason.into(),
            recorded_at: Utc::now(),
            sequence: self.decisions.len() as u64,
        };
        self.decisions.insert(actual.clone(), decision);
        self.version += 1;
        actual
    }

    pub fn push_debug(&mut self, stage: Option<StageId>, message: impl Into<String>) {
        self.debug.push(DebugEntry {
            at: Utc::now(),
            stage,
            message: message.into(),
        });
    }

    /// Raise priority to critical. Returns `false` if it already was.
    pub fn escalate_to_critical(&mut self) -> bool {
        if self.priority == Priority::Critical {
            return false;
        }
        self.priority = Priority::Critical;
        self.version += 1;
        true
    }

    /// Compare a stage's echoed context id with ours.
    pub fn check_echo(&self, echoed: Option<&str>) -> ContextEcho {
        let Some(raw) = echoed else {
            return ContextEcho::Missing;
        };
        let value = raw.trim();
        if value.is_empty() {
            return ContextEcho::Missing;
        }
        if is_placeholder_context_id(value) {
            return ContextEcho::Placeholder(value.to_string());
        }
        if Uuid::parse_str(value).is_err() {
            return ContextEcho::Malformed(value.to_string());
        }
        if value != self.context_id {
            return ContextEcho::Mismatch(value.to_string());
        }
        ContextEcho::Match
    }

    /// Restore identity, parameters and stage results from a known-good
    /// copy. Decisions and debug entries recorded since are kept, and the
    /// version keeps counting forward.
    pub fn resync_from(&mut self, last_good: &ContextEnvelope) {
        self.context_id = last_good.context_id.clone();
        self.created_at = last_good.created_at;
        self.source = last_good.source.clone();
        self.initial_params = last_good.initial_params.clone();
        self.stage_results = last_good.stage_results.clone();
        for (key, decision) in &last_good.decisions {
            self.decisions
                .entry(key.clone())
                .or_insert_with(|| decision.clone());
        }
        self.version = self.version.max(last_good.version) + 1;
    }
}
