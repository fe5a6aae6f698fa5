// incident-orchestrator-rs/src/controller.rs
// Stage pipeline controller: runs the stages of one investigation in
// order, validates every response, keeps the envelope consistent and
// decides after each stage whether the run goes on.
//
//   proceed = stage decision || priority == critical || force_deep_analysis

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use config_rs::{CorrelationConfig, PipelineConfig, StageConfig};
use dependency_graph::{
    CascadeAnalysis, CascadeCorrelator, CriticalityTier, DependencyGraph, ErrorEvent, GraphError,
};
use error_handling::{
    run_span, stage_span, CancelSignal, Classify, ErrorKind, RetryConfig, RetryError, RetryPolicy,
};
use fingerprint::{Alert, Priority};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn, Instrument};

use crate::envelope::{ContextEcho, ContextEnvelope, DecisionKind, EnvelopeError, StageResult};
use crate::inference::{InferenceClient, InferenceError, InferenceRequest};
use crate::placeholder::{
    substitute_placeholders, HeuristicPlaceholderDetector, PlaceholderDetector, Substitution,
    UNVERIFIED,
};
use crate::prompts;
use crate::stages::{StageId, StagePayload};
use crate::validation::{Repaired, ValidationError, ValidationGate};

/// Keys that are never checked for placeholder data.
const PLACEHOLDER_SKIP_KEYS: &[&str] = &[
    "context_id",
    "contextId",
    "stage",
    "proceed",
    "decision",
    "tools_executed",
    "metrics",
    "warnings",
];

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("collaborator call for stage '{stage}' failed: {source}")]
    Collaborator {
        stage: StageId,
        #[source]
        source: RetryError<InferenceError>,
    },

    #[error("stage '{stage}' failed validation: {source}")]
    Validation {
        stage: StageId,
        #[source]
        source: ValidationError,
    },

    #[error("run cancelled at stage '{stage}'")]
    Cancelled { stage: StageId },

    #[error("envelope integrity error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("cascade correlation failed: {0}")]
    Correlation(#[from] GraphError),
}

impl PipelineError {
    pub fn stage(&self) -> Option<StageId> {
        match self {
            PipelineError::Collaborator { stage, .. }
            | PipelineError::Validation { stage, .. }
            | PipelineError::Cancelled { stage } => Some(*stage),
            PipelineError::Envelope(EnvelopeError::StageAlreadyRecorded(stage)) => Some(*stage),
            PipelineError::Envelope(EnvelopeError::StageMismatch { expected, .. }) => {
                Some(*expected)
            }
            PipelineError::Correlation(_) => Some(StageId::PatternAnalysis),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled { .. })
    }
}

impl Classify for PipelineError {
    fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Collaborator { source, .. } => match source {
                RetryError::Exhausted { last_error, .. } => last_error.kind(),
                RetryError::TimedOut { .. } => ErrorKind::Timeout,
                RetryError::Cancelled { .. } => ErrorKind::Cancelled,
            },
            PipelineError::Validation { source, .. } => source.kind(),
            PipelineError::Cancelled { .. } => ErrorKind::Cancelled,
            PipelineError::Envelope(_) => ErrorKind::Integrity,
            PipelineError::Correlation(_) => ErrorKind::Configuration,
        }
    }
}

/// A failed run. The envelope holds every stage that completed before the
/// failure.
#[derive(Debug, thiserror::Error)]
#[error("pipeline run failed: {error}")]
pub struct PipelineFailure {
    #[source]
    pub error: PipelineError,
    pub envelope: ContextEnvelope,
}

/// How a successful run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TerminalState {
    /// Every stage ran.
    Completed,
    /// A gate said stop and nothing overrode it: healthy, no action needed.
    NoActionNeeded { stopped_after: StageId },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOutcome {
    pub envelope: ContextEnvelope,
    pub terminal: TerminalState,
    pub cascade: Option<CascadeAnalysis>,
}

/// Input for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub alert: Alert,
    #[serde(default)]
    pub events: Vec<ErrorEvent>,
    #[serde(default)]
    pub force_deep_analysis: bool,
}

impl RunRequest {
    pub fn new(alert: Alert) -> Self {
        Self {
            alert,
            events: Vec::new(),
            force_deep_analysis: false,
        }
    }

    pub fn with_events(mut self, events: Vec<ErrorEvent>) -> Self {
        self.events = events;
        self
    }

    pub fn force_deep_analysis(mut self, force: bool) -> Self {
        self.force_deep_analysis = force;
        self
    }
}

#[derive(Serialize)]
struct CriticalFailureLog<'a> {
    event_type: &'static str, // always "CRITICAL_FAILURE"
    service: &'static str,
    stage: Option<StageId>,
    context_id: &'a str,
    source: &'a str,
    error_kind: String,
    severity: String,
    error_message: String,
    retryable: bool,
    priority: Priority,
    completed_stages: Vec<StageId>,
}

/// Service names known to be real, used to replace placeholders.
#[derive(Debug, Default)]
struct VerifiedValues {
    cascade_root: Option<String>,
    /// Most recent first.
    stage_services: Vec<String>,
    alert_services: Vec<String>,
}

impl VerifiedValues {
    fn from_alert(alert: &Alert, detector: &dyn PlaceholderDetector) -> Self {
        Self {
            alert_services: alert
                .services
                .iter()
                .filter(|s| is_real(s, detector))
                .cloned()
                .collect(),
            ..Self::default()
        }
    }

    fn observe_cascade(&mut self, analysis: &CascadeAnalysis) {
        self.cascade_root = analysis
            .primary_chain()
            .map(|chain| chain.root_cause.service.clone());
    }

    fn observe_stage(&mut self, payload: &StagePayload, detector: &dyn PlaceholderDetector) {
        for service in payload.named_services().into_iter().rev() {
            if is_real(service, detector) {
                self.stage_services.retain(|s| s != service);
                self.stage_services.insert(0, service.to_string());
            }
        }
    }

    fn primary_service(&self) -> Option<&str> {
        self.cascade_root
            .as_deref()
            .or_else(|| self.stage_services.first().map(String::as_str))
            .or_else(|| self.alert_services.first().map(String::as_str))
    }
}

fn is_real(value: &str, detector: &dyn PlaceholderDetector) -> bool {
    let v = value.trim();
    !v.is_empty() && v != UNVERIFIED && !detector.is_placeholder(v)
}

struct StageExecution {
    result: StageResult,
    echo: ContextEcho,
    substitutions: Vec<Substitution>,
}

pub struct PipelineController {
    inference: Arc<dyn InferenceClient>,
    graph: Arc<DependencyGraph>,
    gate: ValidationGate,
    detector: Arc<dyn PlaceholderDetector>,
    retry: RetryPolicy,
    correlation: CorrelationConfig,
    stages: StageConfig,
    namespaces: Vec<String>,
}

impl PipelineController {
    pub fn new(
        inference: Arc<dyn InferenceClient>,
        graph: Arc<DependencyGraph>,
        config: &PipelineConfig,
    ) -> Self {
        let retry = RetryPolicy::new(
            "stage_inference",
            Some(RetryConfig {
                max_retries: config.stages.max_retries,
                base_backoff: Duration::from_millis(config.stages.retry_base_backoff_ms),
                attempt_timeout: Some(Duration::from_secs(config.stages.timeout_secs)),
                ..RetryConfig::default()
            }),
        );

        Self {
            inference,
            graph,
            gate: ValidationGate::new(config.stages.expected_tools_executed),
            detector: Arc::new(HeuristicPlaceholderDetector::new()),
            retry,
            correlation: config.correlation.clone(),
            stages: config.stages.clone(),
            namespaces: config.namespaces.clone(),
        }
    }

    pub fn with_detector(mut self, detector: Arc<dyn PlaceholderDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn graph(&self) -> &Arc<DependencyGraph> {
        &self.graph
    }

    pub fn detector(&self) -> &Arc<dyn PlaceholderDetector> {
        &self.detector
    }

    /// Run one investigation to a terminal state or a fatal error.
    pub async fn run(
        &self,
        request: RunRequest,
        cancel: &CancelSignal,
    ) -> Result<PipelineOutcome, PipelineFailure> {
        let initial_params = serde_json::to_value(&request.alert).unwrap_or(Value::Null);
        let envelope = ContextEnvelope::new(
            request.alert.source.clone(),
            initial_params,
            request.alert.priority,
            request.force_deep_analysis,
        );
        let span = run_span(envelope.context_id(), &request.alert.source);
        self.drive(request, envelope, cancel).instrument(span).await
    }

    async fn drive(
        &self,
        request: RunRequest,
        mut envelope: ContextEnvelope,
        cancel: &CancelSignal,
    ) -> Result<PipelineOutcome, PipelineFailure> {
        let RunRequest { alert, events, .. } = request;
        info!(
            priority = %envelope.priority,
            force_deep_analysis = envelope.force_deep_analysis,
            events = events.len(),
            "Pipeline run started"
        );

        let mut last_good = envelope.clone();
        let mut cascade: Option<CascadeAnalysis> = None;
        let mut verified = VerifiedValues::from_alert(&alert, self.detector.as_ref());
        let mut current = StageId::HealthSnapshot;

        loop {
            if cancel.is_cancelled() {
                return Err(self.fail(envelope, PipelineError::Cancelled { stage: current }));
            }

            if current == StageId::PatternAnalysis && cascade.is_none() {
                match self.correlate(&events, &mut envelope) {
                    Ok(analysis) => {
                        verified.observe_cascade(&analysis);
                        cascade = Some(analysis);
                    }
                    Err(e) => return Err(self.fail(envelope, e)),
                }
            }

            let execution = self
                .execute_stage(current, &alert, &envelope, cascade.as_ref(), &verified, cancel)
                .await;
            let StageExecution {
                result,
                echo,
                substitutions,
            } = match execution {
                Ok(execution) => execution,
                Err(e) => return Err(self.fail(envelope, e)),
            };

            if !echo.is_match() {
                let description = echo.describe();
                warn!(stage = %current, reason = %description, "Rejected context echo, restoring envelope");
                envelope.resync_from(&last_good);
                envelope.record_decision(
                    "context_resync",
                    DecisionKind::ContextResync,
                    Some(current),
                    false,
                    None,
                    description.clone(),
                );
                envelope.push_debug(
                    Some(current),
                    format!(
                        "envelope restored from version {} after {}",
                        last_good.version(),
                        description
                    ),
                );
                metrics::increment_counter!("incident_context_resync_total", "stage" => current.as_str());
            }

            for sub in &substitutions {
                warn!(
                    stage = %current,
                    path = %sub.path,
                    original = %sub.original,
                    replacement = %sub.replacement,
                    "Replaced placeholder value"
                );
                envelope.record_decision(
                    "placeholder_substitution",
                    DecisionKind::PlaceholderSubstitution,
                    Some(current),
                    false,
                    None,
                    format!("{}: '{}' -> '{}'", sub.path, sub.original, sub.replacement),
                );
            }

            verified.observe_stage(&result.payload, self.detector.as_ref());
            let stage_decision = result.decision;
            let reports_critical = result.payload.reports_critical();
            let anomaly_suspected = matches!(
                &result.payload,
                StagePayload::HealthSnapshot(snapshot) if snapshot.anomaly_suspected
            );
            let warnings = result.warnings.len();

            if let Err(e) = envelope.record_stage_result(result) {
                return Err(self.fail(envelope, e.into()));
            }
            metrics::increment_counter!("incident_stage_completed_total", "stage" => current.as_str());
            info!(stage = %current, decision = stage_decision, warnings, "Stage completed");

            if reports_critical && envelope.escalate_to_critical() {
                warn!(stage = %current, "Stage reported critical status, escalating priority");
                envelope.record_decision(
                    "priority_escalation",
                    DecisionKind::PriorityEscalation,
                    Some(current),
                    false,
                    None,
                    format!("stage '{}' reported overall_status critical", current),
                );
            }

            let anomaly_branch =
                current == StageId::HealthSnapshot && self.anomaly_branch(&mut envelope, anomaly_suspected);
            let Some(next) = current.next(anomaly_branch) else {
                info!(version = envelope.version(), "Pipeline run completed");
                return Ok(PipelineOutcome {
                    envelope,
                    terminal: TerminalState::Completed,
                    cascade,
                });
            };

            if !self.gate_allows(&mut envelope, current, stage_decision) {
                envelope.record_decision(
                    "terminal",
                    DecisionKind::Terminal,
                    Some(current),
                    false,
                    Some(false),
                    format!("stage '{}' decided not to proceed to '{}'", current, next),
                );
                info!(stage = %current, "Pipeline stopped at gate: no action needed");
                return Ok(PipelineOutcome {
                    envelope,
                    terminal: TerminalState::NoActionNeeded {
                        stopped_after: current,
                    },
                    cascade,
                });
            }

            last_good = envelope.clone();
            current = next;
        }
    }

    /// Apply the transition rule, recording an override when one is used.
    fn gate_allows(&self, envelope: &mut ContextEnvelope, stage: StageId, decision: bool) -> bool {
        if decision {
            return true;
        }

        let reason = if envelope.is_critical() {
            "priority is critical"
        } else if envelope.force_deep_analysis {
            "force_deep_analysis is set"
        } else {
            return false;
        };

        let key = envelope.record_decision(
            &format!("override_{}", stage),
            DecisionKind::Override,
            Some(stage),
            true,
            Some(false),
            reason,
        );
        metrics::increment_counter!("incident_gate_overrides_total", "stage" => stage.as_str());
        info!(stage = %stage, decision_key = %key, reason, "Gate override applied");
        true
    }

    /// Whether the anomaly stage runs after the health snapshot.
    fn anomaly_branch(&self, envelope: &mut ContextEnvelope, anomaly_suspected: bool) -> bool {
        let wanted = anomaly_suspected || envelope.force_deep_analysis;
        let take = wanted && self.stages.anomaly_stage_enabled;
        let reason = match (take, anomaly_suspected) {
            (true, true) => "health snapshot suspects an anomaly",
            (true, false) => "deep analysis forced",
            (false, _) if wanted => "anomaly stage disabled by configuration",
            (false, _) => "no anomaly suspected",
        };
        envelope.record_decision(
            "anomaly_branch",
            DecisionKind::Branch,
            Some(StageId::HealthSnapshot),
            false,
            Some(take),
            reason,
        );
        debug!(take, reason, "Anomaly branch decided");
        take
    }

    fn correlate(
        &self,
        events: &[ErrorEvent],
        envelope: &mut ContextEnvelope,
    ) -> Result<CascadeAnalysis, PipelineError> {
        let correlator = CascadeCorrelator::new(&self.graph, &self.correlation)?;
        let analysis = correlator.analyze(events);

        let critical_root = analysis
            .chains
            .iter()
            .find(|chain| chain.root_tier == CriticalityTier::Critical)
            .map(|chain| chain.root_cause.service.clone());
        if let Some(root) = critical_root {
            if envelope.escalate_to_critical() {
                warn!(root = %root, "Cascade rooted at a critical-tier service, escalating priority");
                envelope.record_decision(
                    "priority_escalation",
                    DecisionKind::PriorityEscalation,
                    Some(StageId::PatternAnalysis),
                    false,
                    None,
                    format!("cascade root '{}' is a critical-tier service", root),
                );
            }
        }
        Ok(analysis)
    }

    async fn execute_stage(
        &self,
        stage: StageId,
        alert: &Alert,
        envelope: &ContextEnvelope,
        cascade: Option<&CascadeAnalysis>,
        verified: &VerifiedValues,
        cancel: &CancelSignal,
    ) -> Result<StageExecution, PipelineError> {
        let span = stage_span(stage.as_str(), self.retry.config().max_retries + 1);
        async move {
            let prior = envelope.completed_stages();
            let request = InferenceRequest {
                stage,
                system_prompt: prompts::system_prompt(stage),
                user_message: prompts::user_message(
                    stage,
                    alert,
                    envelope.context_id(),
                    &prior,
                    cascade,
                ),
                context: envelope.clone(),
                cascade: cascade.cloned(),
                namespaces: self.namespaces.clone(),
            };

            let raw = self
                .retry
                .run(stage.as_str(), cancel, |attempt| {
                    let request = request.clone();
                    let inference = Arc::clone(&self.inference);
                    async move {
                        debug!(attempt, "Dispatching stage to collaborator");
                        inference.infer(request).await
                    }
                })
                .await
                .map_err(|e| {
                    if e.is_cancelled() {
                        PipelineError::Cancelled { stage }
                    } else {
                        PipelineError::Collaborator { stage, source: e }
                    }
                })?;

            let Repaired { body, repaired } = self
                .gate
                .repair(stage, raw)
                .map_err(|source| PipelineError::Validation { stage, source })?;

            let mut doc = Value::Object(body);
            let substitutions = substitute_placeholders(
                self.detector.as_ref(),
                &mut doc,
                PLACEHOLDER_SKIP_KEYS,
                verified.primary_service(),
            );
            let body = match doc {
                Value::Object(map) => map,
                _ => Map::new(),
            };

            let validated = self
                .gate
                .validate_object(stage, body, repaired)
                .map_err(|source| PipelineError::Validation { stage, source })?;

            let echo = envelope.check_echo(validated.echoed_context_id.as_deref());
            let mut payload = validated.payload;
            enrich(&mut payload, cascade);

            let mut warnings = validated.warnings;
            warnings.extend(substitutions.iter().map(|s| {
                format!(
                    "placeholder '{}' at {} replaced with '{}'",
                    s.original, s.path, s.replacement
                )
            }));

            Ok(StageExecution {
                result: StageResult {
                    stage,
                    completed_at: Utc::now(),
                    payload,
                    decision: validated.decision,
                    tools_executed: validated.tools_executed,
                    warnings,
                },
                echo,
                substitutions,
            })
        }
        .instrument(span)
        .await
    }

    fn fail(&self, envelope: ContextEnvelope, error: PipelineError) -> PipelineFailure {
        metrics::increment_counter!(
            "incident_pipeline_failures_total",
            "kind" => error.kind().to_string()
        );

        if error.is_cancelled() {
            warn!(stage = ?error.stage(), "Pipeline run cancelled");
        } else {
            log_critical_failure(&envelope, &error);
        }
        PipelineFailure { error, envelope }
    }
}

/// Attach the correlator's output to the stages that use it. The
/// correlator's restart order and breaker points are dependency-derived,
/// so they replace whatever the collaborator proposed when present.
fn enrich(payload: &mut StagePayload, cascade: Option<&CascadeAnalysis>) {
    let Some(analysis) = cascade else {
        return;
    };
    match payload {
        StagePayload::PatternAnalysis(p) => p.cascade = Some(analysis.clone()),
        StagePayload::Remediation(p) => {
            if !analysis.restart_order.is_empty() {
                p.restart_order = analysis.restart_order.clone();
            }
            if !analysis.circuit_breakers.is_empty() {
                p.circuit_breakers = analysis.circuit_breakers.clone();
            }
        }
        StagePayload::Prevention(p) => {
            if !analysis.circuit_breakers.is_empty() {
                p.circuit_breakers = analysis.circuit_breakers.clone();
            }
        }
        _ => {}
    }
}

fn log_critical_failure(envelope: &ContextEnvelope, err: &PipelineError) {
    let log_event = CriticalFailureLog {
        event_type: "CRITICAL_FAILURE",
        service: "incident-orchestrator",
        stage: err.stage(),
        context_id: envelope.context_id(),
        source: &envelope.source,
        error_kind: err.kind().to_string(),
        severity: err.severity().to_string(),
        error_message: err.to_string(),
        retryable: err.kind().is_transient(),
        priority: envelope.priority,
        completed_stages: envelope.stage_results().keys().copied().collect(),
    };

    if let Ok(json) = serde_json::to_string(&log_event) {
        error!("{}", json);
    } else {
        error!(
            "CRITICAL_FAILURE: stage={:?}, context_id={}, error={}",
            err.stage(),
            envelope.context_id(),
            err
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::MockInferenceClient;
    use config_rs::CriticalityConfig;
    use dependency_graph::ServiceNode;
    use error_handling::cancel_pair;
    use serde_json::json;

    fn graph() -> Arc<DependencyGraph> {
        Arc::new(
            DependencyGraph::from_nodes(
                vec![ServiceNode {
                    name: "crm".to_string(),
                    dependencies: vec!["auth".to_string()],
                }],
                &CriticalityConfig::default(),
            )
            .unwrap(),
        )
    }

    fn fast_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.stages.max_retries = 1;
        config.stages.retry_base_backoff_ms = 1;
        config.stages.timeout_secs = 5;
        config
    }

    fn echo_response(request: &InferenceRequest, body: Value) -> Value {
        let mut out = json!({
            "stage": request.stage.as_str(),
            "context_id": request.context.context_id(),
            "tools_executed": 1,
        });
        if let (Value::Object(o), Value::Object(b)) = (&mut out, body) {
            o.extend(b);
        }
        out
    }

    #[tokio::test]
    async fn healthy_snapshot_stops_without_action() {
        let mut mock = MockInferenceClient::new();
        mock.expect_infer().times(1).returning(|req| {
            Ok(echo_response(
                &req,
                json!({"overall_status": "healthy", "proceed": false}),
            ))
        });

        let controller = PipelineController::new(Arc::new(mock), graph(), &fast_config());
        let alert = Alert::new("prometheus", "Latency blip", Priority::Low);
        let outcome = controller
            .run(RunRequest::new(alert), &CancelSignal::never())
            .await
            .expect("run succeeds");

        assert_eq!(
            outcome.terminal,
            TerminalState::NoActionNeeded {
                stopped_after: StageId::HealthSnapshot
            }
        );
        assert_eq!(outcome.envelope.stage_results().len(), 1);
        assert!(outcome.envelope.decisions().contains_key("terminal"));
    }

    #[tokio::test]
    async fn transient_collaborator_error_is_retried() {
        let mut mock = MockInferenceClient::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_infer()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(InferenceError::Unavailable("connection refused".into())));
        mock.expect_infer()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|req| {
                Ok(echo_response(
                    &req,
                    json!({"overall_status": "healthy", "proceed": false}),
                ))
            });

        let controller = PipelineController::new(Arc::new(mock), graph(), &fast_config());
        let alert = Alert::new("prometheus", "Latency blip", Priority::Low);
        let outcome = controller
            .run(RunRequest::new(alert), &CancelSignal::never())
            .await
            .expect("second attempt succeeds");
        assert_eq!(outcome.envelope.stage_results().len(), 1);
    }

    #[tokio::test]
    async fn rejected_request_fails_without_retry() {
        let mut mock = MockInferenceClient::new();
        mock.expect_infer().times(1).returning(|_| {
            Err(InferenceError::Status {
                status: 400,
                body: "bad request".into(),
            })
        });

        let controller = PipelineController::new(Arc::new(mock), graph(), &fast_config());
        let alert = Alert::new("prometheus", "Latency blip", Priority::Low);
        let failure = controller
            .run(RunRequest::new(alert), &CancelSignal::never())
            .await
            .unwrap_err();

        assert!(matches!(
            failure.error,
            PipelineError::Collaborator {
                stage: StageId::HealthSnapshot,
                ..
            }
        ));
        assert_eq!(failure.error.kind(), ErrorKind::Configuration);
        assert!(failure.envelope.stage_results().is_empty());
    }

    #[tokio::test]
    async fn cancelled_signal_stops_before_first_stage() {
        let mut mock = MockInferenceClient::new();
        mock.expect_infer().times(0);

        let (handle, signal) = cancel_pair();
        handle.cancel();

        let controller = PipelineController::new(Arc::new(mock), graph(), &fast_config());
        let alert = Alert::new("prometheus", "Latency blip", Priority::Low);
        let failure = controller
            .run(RunRequest::new(alert), &signal)
            .await
            .unwrap_err();
        assert!(failure.error.is_cancelled());
        assert_eq!(failure.error.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn enrich_overrides_restart_order_only_when_cascade_has_one() {
        let mut payload = StagePayload::parse(
            StageId::Remediation,
            json!({"actions": [{"description": "restart"}], "restart_order": ["crm", "auth"]}),
        )
        .unwrap();

        enrich(&mut payload, Some(&CascadeAnalysis::default()));
        match &payload {
            StagePayload::Remediation(r) => assert_eq!(r.restart_order, vec!["crm", "auth"]),
            other => panic!("unexpected {:?}", other),
        }

        let analysis = CascadeAnalysis {
            restart_order: vec!["auth".to_string(), "crm".to_string()],
            ..CascadeAnalysis::default()
        };
        enrich(&mut payload, Some(&analysis));
        match &payload {
            StagePayload::Remediation(r) => assert_eq!(r.restart_order, vec!["auth", "crm"]),
            other => panic!("unexpected {:?}", other),
        }
    }
}
