// incident-orchestrator-rs/src/report.rs
// Consolidated incident report and the ticket action derived from it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dependency_graph::CascadeAnalysis;
use error_handling::Classify;
use fingerprint::{Alert, DedupClassification, DedupOutcome, Fingerprint, Priority};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::controller::{PipelineFailure, PipelineOutcome, TerminalState};
use crate::envelope::{ContextEnvelope, Decision};
use crate::placeholder::{substitute_placeholders, PlaceholderDetector, UNVERIFIED};
use crate::stages::{RootCauseFinding, StageId, StagePayload};

/// Report fields that hold identifiers, timestamps or audit text and are
/// never scrubbed.
const SCRUB_SKIP_KEYS: &[&str] = &[
    "context_id",
    "fingerprint",
    "classification",
    "status",
    "stage",
    "stopped_after",
    "priority",
    "generated_at",
    "completed_at",
    "decisions",
    "warnings",
    "ticket_ref",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    NoActionNeeded {
        stopped_after: StageId,
    },
    Failed {
        stage: Option<StageId>,
        error_kind: String,
        error: String,
    },
}

impl RunStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, RunStatus::Failed { .. })
    }
}

impl From<TerminalState> for RunStatus {
    fn from(terminal: TerminalState) -> Self {
        match terminal {
            TerminalState::Completed => RunStatus::Completed,
            TerminalState::NoActionNeeded { stopped_after } => {
                RunStatus::NoActionNeeded { stopped_after }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSummary {
    pub stage: StageId,
    pub completed_at: DateTime<Utc>,
    pub decision: bool,
    pub tools_executed: u64,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionEntry {
    pub key: String,
    #[serde(flatten)]
    pub decision: Decision,
}

/// What the ticket sink should do with a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TicketAction {
    Create {
        fingerprint: Fingerprint,
        title: String,
        priority: Priority,
        summary: String,
        services: Vec<String>,
    },
    Update {
        fingerprint: Fingerprint,
        ticket_ref: String,
        occurrence_count: u64,
        comment: String,
    },
}

impl TicketAction {
    pub fn fingerprint(&self) -> &Fingerprint {
        match self {
            TicketAction::Create { fingerprint, .. } | TicketAction::Update { fingerprint, .. } => {
                fingerprint
            }
        }
    }

    pub fn is_create(&self) -> bool {
        matches!(self, TicketAction::Create { .. })
    }

    /// Turn a create that lost the race for the incident's ticket into an
    /// update of the winning ticket. The comment names the duplicate.
    pub fn fold_into(&self, winner: &str, duplicate: &str, occurrence_count: u64) -> TicketAction {
        let detail = match self {
            TicketAction::Create { summary, .. } => summary.as_str(),
            TicketAction::Update { comment, .. } => comment.as_str(),
        };
        TicketAction::Update {
            fingerprint: self.fingerprint().clone(),
            ticket_ref: winner.to_string(),
            occurrence_count,
            comment: format!("Duplicate ticket {} opened concurrently. {}", duplicate, detail),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentReport {
    pub context_id: String,
    pub fingerprint: Fingerprint,
    pub classification: DedupClassification,
    pub occurrence_count: u64,
    pub status: RunStatus,
    pub priority: Priority,
    pub source: String,
    pub title: String,
    pub affected_services: Vec<String>,
    pub root_cause: Option<RootCauseFinding>,
    pub diagnosis: Option<String>,
    pub stages: Vec<StageSummary>,
    pub cascade: Option<CascadeAnalysis>,
    pub decisions: Vec<DecisionEntry>,
    pub warnings: Vec<String>,
    pub ticket_action: Option<TicketAction>,
    /// Set once the ticket sink has accepted `ticket_action`.
    #[serde(default)]
    pub ticket_ref: Option<String>,
    pub generated_at: DateTime<Utc>,
}

/// Builds [`IncidentReport`]s and scrubs any placeholder data left in them.
pub struct ReportAssembler {
    detector: Arc<dyn PlaceholderDetector>,
}

impl ReportAssembler {
    pub fn new(detector: Arc<dyn PlaceholderDetector>) -> Self {
        Self { detector }
    }

    pub fn from_outcome(
        &self,
        alert: &Alert,
        outcome: &PipelineOutcome,
        dedup: &DedupOutcome,
    ) -> IncidentReport {
        self.build(
            alert,
            &outcome.envelope,
            outcome.terminal.into(),
            outcome.cascade.clone(),
            dedup,
        )
    }

    pub fn from_failure(
        &self,
        alert: &Alert,
        failure: &PipelineFailure,
        dedup: &DedupOutcome,
    ) -> IncidentReport {
        let status = RunStatus::Failed {
            stage: failure.error.stage(),
            error_kind: failure.error.kind().to_string(),
            error: failure.error.to_string(),
        };
        let cascade = failure
            .envelope
            .stage_result(StageId::PatternAnalysis)
            .and_then(|r| match &r.payload {
                StagePayload::PatternAnalysis(p) => p.cascade.clone(),
                _ => None,
            });
        self.build(alert, &failure.envelope, status, cascade, dedup)
    }

    fn build(
        &self,
        alert: &Alert,
        envelope: &ContextEnvelope,
        status: RunStatus,
        cascade: Option<CascadeAnalysis>,
        dedup: &DedupOutcome,
    ) -> IncidentReport {
        let completed = envelope.completed_stages();

        let root_cause = envelope
            .stage_result(StageId::RootCause)
            .and_then(|r| match &r.payload {
                StagePayload::RootCause(rc) => Some(rc.root_cause.clone()),
                _ => None,
            });
        let diagnosis = envelope
            .stage_result(StageId::Diagnosis)
            .and_then(|r| match &r.payload {
                StagePayload::Diagnosis(d) => Some(d.diagnosis.clone()),
                _ => None,
            });

        let mut affected_services: Vec<String> = alert.services.clone();
        for result in &completed {
            affected_services.extend(result.payload.named_services().into_iter().map(String::from));
        }
        if let Some(analysis) = &cascade {
            affected_services.extend(analysis.blast_radius.iter().cloned());
        }
        affected_services.sort();
        affected_services.dedup();

        let report = IncidentReport {
            context_id: envelope.context_id().to_string(),
            fingerprint: dedup.fingerprint.clone(),
            classification: dedup.classification,
            occurrence_count: dedup.record.occurrence_count,
            status,
            priority: envelope.priority,
            source: alert.source.clone(),
            title: alert.title.clone(),
            affected_services,
            root_cause,
            diagnosis,
            stages: completed
                .iter()
                .map(|r| StageSummary {
                    stage: r.stage,
                    completed_at: r.completed_at,
                    decision: r.decision,
                    tools_executed: r.tools_executed,
                    summary: summarize(&r.payload),
                })
                .collect(),
            cascade,
            decisions: envelope
                .decision_log()
                .into_iter()
                .map(|(key, decision)| DecisionEntry {
                    key: key.to_string(),
                    decision: decision.clone(),
                })
                .collect(),
            warnings: completed
                .iter()
                .flat_map(|r| r.warnings.iter().map(move |w| format!("{}: {}", r.stage, w)))
                .collect(),
            ticket_action: None,
            ticket_ref: None,
            generated_at: Utc::now(),
        };

        let mut report = self.scrub(report);
        report.ticket_action = ticket_action_for(&report, dedup);
        report
    }

    /// Replace placeholder values left anywhere in the report. Service
    /// fields fall back to the root-cause service when that one is real.
    fn scrub(&self, report: IncidentReport) -> IncidentReport {
        let verified = report
            .root_cause
            .as_ref()
            .map(|rc| rc.service.as_str())
            .filter(|s| *s != UNVERIFIED && !self.detector.is_placeholder(s))
            .map(str::to_string);

        let mut doc = match serde_json::to_value(&report) {
            Ok(doc) => doc,
            Err(err) => {
                warn!(error = %err, "Could not serialize report for placeholder scrub");
                return report;
            }
        };
        let substitutions = substitute_placeholders(
            self.detector.as_ref(),
            &mut doc,
            SCRUB_SKIP_KEYS,
            verified.as_deref(),
        );
        if substitutions.is_empty() {
            return report;
        }

        for sub in &substitutions {
            warn!(path = %sub.path, original = %sub.original, "Scrubbed placeholder from report");
        }
        match serde_json::from_value::<IncidentReport>(doc) {
            Ok(mut scrubbed) => {
                scrubbed.affected_services.sort();
                scrubbed.affected_services.dedup();
                scrubbed.warnings.extend(substitutions.iter().map(|s| {
                    format!("report: placeholder at {} replaced with '{}'", s.path, s.replacement)
                }));
                scrubbed
            }
            Err(err) => {
                warn!(error = %err, "Scrubbed report no longer parses, keeping original");
                report
            }
        }
    }
}

/// Completed runs update the incident's ticket, or open one if it has
/// none yet. Healthy runs only touch an existing ticket. Failed runs never
/// produce a ticket action.
fn ticket_action_for(report: &IncidentReport, dedup: &DedupOutcome) -> Option<TicketAction> {
    let ticket = dedup.record.ticket_ref.clone();
    match (&report.status, ticket) {
        (RunStatus::Failed { .. }, _) => None,
        (RunStatus::Completed, None) => Some(TicketAction::Create {
            fingerprint: report.fingerprint.clone(),
            title: report.title.clone(),
            priority: report.priority,
            summary: ticket_summary(report),
            services: report.affected_services.clone(),
        }),
        (RunStatus::Completed, Some(ticket_ref)) => Some(TicketAction::Update {
            fingerprint: report.fingerprint.clone(),
            ticket_ref,
            occurrence_count: report.occurrence_count,
            comment: format!(
                "Recurred (occurrence {}). {}",
                report.occurrence_count,
                ticket_summary(report)
            ),
        }),
        (RunStatus::NoActionNeeded { stopped_after }, Some(ticket_ref)) => {
            Some(TicketAction::Update {
                fingerprint: report.fingerprint.clone(),
                ticket_ref,
                occurrence_count: report.occurrence_count,
                comment: format!(
                    "Recurred (occurrence {}); investigation stopped after {} with no action needed.",
                    report.occurrence_count, stopped_after
                ),
            })
        }
        (RunStatus::NoActionNeeded { .. }, None) => None,
    }
}

fn ticket_summary(report: &IncidentReport) -> String {
    let mut parts = Vec::new();
    if let Some(rc) = &report.root_cause {
        parts.push(format!("Root cause: {} ({})", rc.service, rc.cause));
    }
    if let Some(diagnosis) = &report.diagnosis {
        parts.push(format!("Diagnosis: {}", diagnosis));
    }
    if let Some(chain) = report.cascade.as_ref().and_then(|c| c.primary_chain()) {
        parts.push(format!(
            "Cascade from {} across {} service(s)",
            chain.root_cause.service,
            chain.affected_services.len()
        ));
    }
    if parts.is_empty() {
        parts.push(format!("Investigation of '{}' completed", report.title));
    }
    parts.join(". ")
}

/// One-line description of a stage payload.
pub fn summarize(payload: &StagePayload) -> String {
    match payload {
        StagePayload::HealthSnapshot(h) => format!(
            "overall status {}; affected [{}]{}",
            h.overall_status,
            h.affected_services.join(", "),
            if h.anomaly_suspected { "; anomaly suspected" } else { "" }
        ),
        StagePayload::AnomalyDetection(a) => format!("{} anomaly(ies) detected", a.anomalies.len()),
        StagePayload::PatternAnalysis(p) => format!(
            "{} pattern(s); {} cascade chain(s)",
            p.patterns.len(),
            p.cascade.as_ref().map(|c| c.chains.len()).unwrap_or(0)
        ),
        StagePayload::RootCause(rc) => {
            format!("{}: {}", rc.root_cause.service, rc.root_cause.cause)
        }
        StagePayload::Diagnosis(d) => d.diagnosis.clone(),
        StagePayload::Remediation(r) => format!(
            "{} action(s); restart order [{}]",
            r.actions.len(),
            r.restart_order.join(", ")
        ),
        StagePayload::Prevention(p) => format!("{} recommendation(s)", p.recommendations.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::StageResult;
    use crate::placeholder::HeuristicPlaceholderDetector;
    use fingerprint::IncidentRecord;
    use serde_json::json;

    fn dedup(classification: DedupClassification, count: u64) -> DedupOutcome {
        let fp = Fingerprint::from_stored("prometheus|auth-failures|auth");
        let mut record = IncidentRecord::new(fp.clone(), Utc::now());
        record.occurrence_count = count;
        if classification == DedupClassification::Existing {
            record.ticket_ref = Some("INC-1234ABCD".to_string());
        }
        DedupOutcome {
            fingerprint: fp,
            classification,
            record,
        }
    }

    fn outcome_with_root_cause(service: &str) -> (Alert, PipelineOutcome) {
        let alert = Alert::new("prometheus", "Auth failures", Priority::High).with_services(["auth"]);
        let mut envelope = ContextEnvelope::new("prometheus", json!({}), Priority::High, false);
        envelope
            .record_stage_result(StageResult {
                stage: StageId::RootCause,
                completed_at: Utc::now(),
                payload: StagePayload::parse(
                    StageId::RootCause,
                    json!({"root_cause": {"service": service, "cause": "expired client secret"}}),
                )
                .unwrap(),
                decision: true,
                tools_executed: 2,
                warnings: vec![],
            })
            .unwrap();
        let outcome = PipelineOutcome {
            envelope,
            terminal: TerminalState::Completed,
            cascade: None,
        };
        (alert, outcome)
    }

    fn assembler() -> ReportAssembler {
        ReportAssembler::new(Arc::new(HeuristicPlaceholderDetector::new()))
    }

    #[test]
    fn completed_new_incident_creates_ticket() {
        let (alert, outcome) = outcome_with_root_cause("auth");
        let report = assembler().from_outcome(&alert, &outcome, &dedup(DedupClassification::New, 1));

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.root_cause.as_ref().unwrap().service, "auth");
        match report.ticket_action {
            Some(TicketAction::Create { ref summary, .. }) => {
                assert!(summary.contains("expired client secret"))
            }
            other => panic!("expected create, got {:?}", other),
        }
    }

    #[test]
    fn completed_existing_incident_updates_ticket() {
        let (alert, outcome) = outcome_with_root_cause("auth");
        let report =
            assembler().from_outcome(&alert, &outcome, &dedup(DedupClassification::Existing, 3));
        match report.ticket_action {
            Some(TicketAction::Update {
                ticket_ref,
                occurrence_count,
                ..
            }) => {
                assert_eq!(ticket_ref, "INC-1234ABCD");
                assert_eq!(occurrence_count, 3);
            }
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[test]
    fn healthy_new_incident_has_no_ticket() {
        let (alert, mut outcome) = outcome_with_root_cause("auth");
        outcome.terminal = TerminalState::NoActionNeeded {
            stopped_after: StageId::HealthSnapshot,
        };
        let report = assembler().from_outcome(&alert, &outcome, &dedup(DedupClassification::New, 1));
        assert!(matches!(report.status, RunStatus::NoActionNeeded { .. }));
        assert!(report.ticket_action.is_none());
    }

    #[test]
    fn existing_incident_without_ticket_opens_one() {
        let (alert, outcome) = outcome_with_root_cause("auth");
        let mut seen_before = dedup(DedupClassification::Existing, 2);
        seen_before.record.ticket_ref = None;

        let report = assembler().from_outcome(&alert, &outcome, &seen_before);
        assert!(matches!(report.ticket_action, Some(TicketAction::Create { .. })));
    }

    #[test]
    fn healthy_recurrence_without_ticket_has_no_action() {
        let (alert, mut outcome) = outcome_with_root_cause("auth");
        outcome.terminal = TerminalState::NoActionNeeded {
            stopped_after: StageId::HealthSnapshot,
        };
        let mut seen_before = dedup(DedupClassification::Existing, 2);
        seen_before.record.ticket_ref = None;

        let report = assembler().from_outcome(&alert, &outcome, &seen_before);
        assert!(report.ticket_action.is_none());
    }

    #[test]
    fn losing_create_folds_into_winning_ticket() {
        let (alert, outcome) = outcome_with_root_cause("auth");
        let report = assembler().from_outcome(&alert, &outcome, &dedup(DedupClassification::New, 1));
        let create = report.ticket_action.expect("create");

        match create.fold_into("INC-00000001", "INC-00000002", 2) {
            TicketAction::Update {
                ticket_ref,
                occurrence_count,
                comment,
                ..
            } => {
                assert_eq!(ticket_ref, "INC-00000001");
                assert_eq!(occurrence_count, 2);
                assert!(comment.contains("INC-00000002"));
                assert!(comment.contains("expired client secret"));
            }
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[test]
    fn placeholder_left_in_report_is_scrubbed() {
        let (alert, outcome) = outcome_with_root_cause("service-a");
        let report = assembler().from_outcome(&alert, &outcome, &dedup(DedupClassification::New, 1));

        let detector = HeuristicPlaceholderDetector::new();
        let doc = serde_json::to_value(&report).unwrap();
        assert!(detector.scan(&doc, SCRUB_SKIP_KEYS).is_empty());
        assert_eq!(report.root_cause.as_ref().unwrap().service, UNVERIFIED);
        assert!(!report.affected_services.iter().any(|s| s == "service-a"));
    }
}
