use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use config_rs::{CriticalityConfig, DedupConfig, PipelineConfig};
use dependency_graph::{DependencyGraph, ErrorEvent, ServiceNode};
use error_handling::{cancel_pair, CancelSignal, Classify, ErrorKind, RetryError};
use fingerprint::{
    Alert, DedupClassification, DedupEngine, DedupStore, FileDedupStore, InMemoryDedupStore,
    Priority,
};
use incident_orchestrator::validation::ValidationError;
use incident_orchestrator::{
    DecisionKind, IncidentService, InferenceClient, InferenceError, InferenceRequest,
    NdjsonTicketSink, PipelineController, PipelineError, RunRequest, RunStatus, StageId,
    StagePayload, TerminalState, TicketAction,
};
use serde_json::{json, Value};

type Responder = Box<dyn Fn(&InferenceRequest) -> Result<Value, InferenceError> + Send + Sync>;

/// Collaborator that answers from per-stage scripts and records requests.
#[derive(Default)]
struct ScriptedClient {
    scripts: HashMap<StageId, Responder>,
    stalls: HashMap<StageId, Duration>,
    calls: Mutex<Vec<InferenceRequest>>,
}

impl ScriptedClient {
    fn new() -> Self {
        Self::default()
    }

    fn on<F>(mut self, stage: StageId, f: F) -> Self
    where
        F: Fn(&InferenceRequest) -> Result<Value, InferenceError> + Send + Sync + 'static,
    {
        self.scripts.insert(stage, Box::new(f));
        self
    }

    fn stall(mut self, stage: StageId, delay: Duration) -> Self {
        self.stalls.insert(stage, delay);
        self
    }

    fn calls(&self) -> Vec<InferenceRequest> {
        self.calls.lock().unwrap().clone()
    }

    fn stages_called(&self) -> Vec<StageId> {
        self.calls().iter().map(|r| r.stage).collect()
    }
}

#[async_trait]
impl InferenceClient for ScriptedClient {
    async fn infer(&self, request: InferenceRequest) -> Result<Value, InferenceError> {
        self.calls.lock().unwrap().push(request.clone());
        if let Some(delay) = self.stalls.get(&request.stage) {
            tokio::time::sleep(*delay).await;
        }
        match self.scripts.get(&request.stage) {
            Some(script) => script(&request),
            None => Ok(respond(&request, default_body(request.stage))),
        }
    }
}

fn default_body(stage: StageId) -> Value {
    match stage {
        StageId::HealthSnapshot => json!({
            "overall_status": "degraded",
            "affected_services": ["auth"],
            "anomaly_suspected": false,
        }),
        StageId::AnomalyDetection => json!({
            "anomalies": [{"service": "auth", "metric": "error_rate", "description": "401 spike"}],
        }),
        StageId::PatternAnalysis => json!({"patterns": [{"signature": "401 burst"}]}),
        StageId::RootCause => json!({
            "root_cause": {
                "service": "auth",
                "cause": "client secret rotated without updating consumers",
                "confidence": 0.9,
            },
        }),
        StageId::Diagnosis => json!({
            "diagnosis": "auth rejects crm credentials",
            "severity": "high",
            "affected_services": ["auth", "crm-customer-information"],
        }),
        StageId::Remediation => json!({
            "actions": [{"description": "restore client secret", "service": "auth"}],
        }),
        StageId::Prevention => json!({"recommendations": ["alert on secret expiry"]}),
    }
}

/// Well-formed response for `request`, with `overrides` merged on top.
fn respond(request: &InferenceRequest, overrides: Value) -> Value {
    let mut out = json!({
        "stage": request.stage.as_str(),
        "context_id": request.context.context_id(),
        "proceed": true,
        "tools_executed": 2,
    });
    let base = default_body(request.stage);
    if let (Value::Object(o), Value::Object(b)) = (&mut out, base) {
        o.extend(b);
    }
    if let (Value::Object(o), Value::Object(extra)) = (&mut out, overrides) {
        o.extend(extra);
    }
    out
}

fn at(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
}

fn graph() -> Arc<DependencyGraph> {
    let nodes = vec![
        ServiceNode {
            name: "crm-customer-information".to_string(),
            dependencies: vec!["auth".to_string()],
        },
        ServiceNode {
            name: "billing".to_string(),
            dependencies: vec![],
        },
    ];
    Arc::new(DependencyGraph::from_nodes(nodes, &CriticalityConfig::default()).unwrap())
}

fn auth_cascade_events() -> Vec<ErrorEvent> {
    vec![
        ErrorEvent::new(at(0), "auth", "401", "Invalid client secret"),
        ErrorEvent::new(at(600), "billing", "500", "internal error"),
        ErrorEvent::new(at(1_500), "crm-customer-information", "timeout", "upstream timed out"),
    ]
}

fn config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.stages.max_retries = 0;
    config.stages.retry_base_backoff_ms = 1;
    config.stages.timeout_secs = 30;
    config
}

fn alert(priority: Priority) -> Alert {
    Alert::new("prometheus", "Auth failures on login", priority)
        .with_body("401 from auth for crm-customer-information")
        .with_services(["auth"])
}

fn controller(client: Arc<ScriptedClient>) -> PipelineController {
    PipelineController::new(client, graph(), &config())
}

#[tokio::test]
async fn full_run_attaches_cascade_and_restart_order() {
    let client = Arc::new(ScriptedClient::new());
    let outcome = controller(client.clone())
        .run(
            RunRequest::new(alert(Priority::High)).with_events(auth_cascade_events()),
            &CancelSignal::never(),
        )
        .await
        .expect("run completes");

    assert_eq!(outcome.terminal, TerminalState::Completed);
    assert_eq!(
        client.stages_called(),
        vec![
            StageId::HealthSnapshot,
            StageId::PatternAnalysis,
            StageId::RootCause,
            StageId::Diagnosis,
            StageId::Remediation,
            StageId::Prevention,
        ]
    );

    let analysis = outcome.cascade.as_ref().expect("cascade analysed");
    assert_eq!(analysis.chains.len(), 1);
    assert!(!analysis.blast_radius.contains("billing"));

    let pattern_request = &client.calls()[1];
    assert!(pattern_request.cascade.is_some());

    match &outcome.envelope.stage_result(StageId::Remediation).unwrap().payload {
        StagePayload::Remediation(r) => {
            assert_eq!(r.restart_order, vec!["auth", "crm-customer-information"]);
            assert_eq!(r.circuit_breakers.len(), 1);
        }
        other => panic!("unexpected payload {:?}", other),
    }
    match &outcome.envelope.stage_result(StageId::PatternAnalysis).unwrap().payload {
        StagePayload::PatternAnalysis(p) => assert!(p.cascade.is_some()),
        other => panic!("unexpected payload {:?}", other),
    }
}

#[tokio::test]
async fn context_id_survives_malformed_echoes() {
    let client = Arc::new(
        ScriptedClient::new()
            .on(StageId::HealthSnapshot, |req| {
                Ok(respond(req, json!({"context_id": "undefined"})))
            })
            .on(StageId::PatternAnalysis, |req| {
                let mut out = respond(req, json!({}));
                out.as_object_mut().unwrap().remove("context_id");
                Ok(out)
            })
            .on(StageId::RootCause, |req| {
                Ok(respond(req, json!({"context_id": "{{ $json.contextId }}"})))
            })
            .on(StageId::Diagnosis, |req| {
                Ok(respond(
                    req,
                    json!({"context_id": "6f1d2c8e-0b3a-4d7e-9c55-2a9e8f7d6b41"}),
                ))
            })
            .on(StageId::Remediation, |req| {
                let wrapped = json!({"output": respond(req, json!({}))});
                Ok(Value::String(format!("Here you go:\n```json\n{}\n```", wrapped)))
            })
            .on(StageId::Prevention, |req| {
                Ok(respond(req, json!({"context_id": "ctx-42"})))
            }),
    );

    let outcome = controller(client.clone())
        .run(RunRequest::new(alert(Priority::High)), &CancelSignal::never())
        .await
        .expect("run completes despite bad echoes");

    let calls = client.calls();
    let original = calls[0].context.context_id().to_string();
    assert_eq!(outcome.envelope.context_id(), original);
    for call in &calls {
        assert_eq!(call.context.context_id(), original, "stage {}", call.stage);
    }

    let resyncs = outcome
        .envelope
        .decision_log()
        .into_iter()
        .filter(|(_, d)| d.kind == DecisionKind::ContextResync)
        .count();
    assert_eq!(resyncs, 5);
    assert!(outcome.envelope.decisions().contains_key("context_resync#5"));
    assert_eq!(outcome.envelope.debug_trail().len(), 5);
    assert_eq!(outcome.envelope.stage_results().len(), 6);

    let remediation = outcome.envelope.stage_result(StageId::Remediation).unwrap();
    assert!(remediation
        .warnings
        .iter()
        .any(|w| w.contains("needed repair")));
}

#[tokio::test]
async fn critical_priority_overrides_negative_decision() {
    let client = Arc::new(ScriptedClient::new().on(StageId::HealthSnapshot, |req| {
        Ok(respond(req, json!({"overall_status": "healthy", "proceed": false})))
    }));

    let outcome = controller(client.clone())
        .run(RunRequest::new(alert(Priority::Critical)), &CancelSignal::never())
        .await
        .expect("run completes");

    assert_eq!(outcome.terminal, TerminalState::Completed);
    let decision = &outcome.envelope.decisions()["override_health_snapshot"];
    assert_eq!(decision.kind, DecisionKind::Override);
    assert!(decision.override_applied);
    assert_eq!(decision.original_decision, Some(false));
    assert_eq!(decision.reason, "priority is critical");

    // The stage's own decision is kept as reported.
    let snapshot = outcome.envelope.stage_result(StageId::HealthSnapshot).unwrap();
    assert!(!snapshot.decision);
}

#[tokio::test]
async fn force_deep_analysis_runs_anomaly_stage_and_overrides() {
    let client = Arc::new(ScriptedClient::new().on(StageId::HealthSnapshot, |req| {
        Ok(respond(req, json!({"overall_status": "healthy", "proceed": false})))
    }));

    let outcome = controller(client.clone())
        .run(
            RunRequest::new(alert(Priority::Low)).force_deep_analysis(true),
            &CancelSignal::never(),
        )
        .await
        .expect("run completes");

    assert_eq!(outcome.terminal, TerminalState::Completed);
    assert_eq!(client.stages_called()[1], StageId::AnomalyDetection);
    let override_entry = &outcome.envelope.decisions()["override_health_snapshot"];
    assert_eq!(override_entry.reason, "force_deep_analysis is set");
    let branch = &outcome.envelope.decisions()["anomaly_branch"];
    assert_eq!(branch.original_decision, Some(true));
}

#[tokio::test]
async fn suspected_anomaly_enters_optional_stage() {
    let client = Arc::new(ScriptedClient::new().on(StageId::HealthSnapshot, |req| {
        Ok(respond(req, json!({"anomaly_suspected": true})))
    }));

    let outcome = controller(client.clone())
        .run(RunRequest::new(alert(Priority::High)), &CancelSignal::never())
        .await
        .expect("run completes");

    assert_eq!(client.stages_called().len(), 7);
    assert!(outcome
        .envelope
        .stage_result(StageId::AnomalyDetection)
        .is_some());
}

#[tokio::test]
async fn critical_status_escalates_later_gates_only() {
    let client = Arc::new(
        ScriptedClient::new()
            .on(StageId::PatternAnalysis, |req| {
                Ok(respond(req, json!({"overall_status": "critical"})))
            })
            .on(StageId::RootCause, |req| Ok(respond(req, json!({"proceed": false})))),
    );

    let outcome = controller(client.clone())
        .run(RunRequest::new(alert(Priority::Medium)), &CancelSignal::never())
        .await
        .expect("run completes");

    assert_eq!(outcome.terminal, TerminalState::Completed);
    assert_eq!(outcome.envelope.priority, Priority::Critical);

    let escalation = &outcome.envelope.decisions()["priority_escalation"];
    assert_eq!(escalation.kind, DecisionKind::PriorityEscalation);
    assert_eq!(escalation.stage, Some(StageId::PatternAnalysis));

    assert!(outcome.envelope.decisions().contains_key("override_root_cause"));
    assert!(!outcome
        .envelope
        .decisions()
        .contains_key("override_health_snapshot"));
}

#[tokio::test]
async fn healthy_snapshot_without_override_stops() {
    let client = Arc::new(ScriptedClient::new().on(StageId::HealthSnapshot, |req| {
        Ok(respond(req, json!({"overall_status": "healthy", "proceed": false})))
    }));

    let outcome = controller(client.clone())
        .run(RunRequest::new(alert(Priority::Medium)), &CancelSignal::never())
        .await
        .expect("healthy terminal is not an error");

    assert_eq!(
        outcome.terminal,
        TerminalState::NoActionNeeded {
            stopped_after: StageId::HealthSnapshot
        }
    );
    assert_eq!(client.stages_called(), vec![StageId::HealthSnapshot]);
}

#[tokio::test]
async fn missing_root_cause_service_is_fatal() {
    let client = Arc::new(ScriptedClient::new().on(StageId::RootCause, |req| {
        Ok(respond(req, json!({"root_cause": {"cause": "unknown token issuer"}})))
    }));

    let failure = controller(client.clone())
        .run(RunRequest::new(alert(Priority::High)), &CancelSignal::never())
        .await
        .expect_err("critical field missing aborts the run");

    match &failure.error {
        PipelineError::Validation {
            stage: StageId::RootCause,
            source: ValidationError::CriticalFieldMissing { field, .. },
        } => assert_eq!(field, "root_cause.service"),
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(failure.error.kind(), ErrorKind::Validation);
    assert_eq!(failure.envelope.stage_results().len(), 2);
    assert_eq!(
        client.stages_called().last().copied(),
        Some(StageId::RootCause)
    );
}

#[tokio::test]
async fn placeholder_service_is_replaced_with_cascade_root() {
    let client = Arc::new(ScriptedClient::new().on(StageId::RootCause, |req| {
        Ok(respond(
            req,
            json!({"root_cause": {"service": "service-a", "cause": "expired client secret"}}),
        ))
    }));

    let outcome = controller(client)
        .run(
            RunRequest::new(alert(Priority::High)).with_events(auth_cascade_events()),
            &CancelSignal::never(),
        )
        .await
        .expect("run completes");

    match &outcome.envelope.stage_result(StageId::RootCause).unwrap().payload {
        StagePayload::RootCause(rc) => assert_eq!(rc.root_cause.service, "auth"),
        other => panic!("unexpected payload {:?}", other),
    }
    assert!(outcome
        .envelope
        .decision_log()
        .iter()
        .any(|(_, d)| d.kind == DecisionKind::PlaceholderSubstitution));
}

#[tokio::test]
async fn cancellation_keeps_completed_stages() {
    let client = Arc::new(ScriptedClient::new().stall(StageId::RootCause, Duration::from_secs(20)));
    let (handle, signal) = cancel_pair();

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();
    });

    let failure = controller(client)
        .run(RunRequest::new(alert(Priority::High)), &signal)
        .await
        .expect_err("cancelled run fails");
    canceller.await.unwrap();

    assert!(matches!(
        failure.error,
        PipelineError::Cancelled {
            stage: StageId::RootCause
        }
    ));
    assert_eq!(failure.envelope.stage_results().len(), 2);
}

#[tokio::test]
async fn stalled_collaborator_times_out() {
    let client = Arc::new(
        ScriptedClient::new().stall(StageId::HealthSnapshot, Duration::from_secs(5)),
    );
    let mut config = config();
    config.stages.timeout_secs = 1;
    let controller = PipelineController::new(client, graph(), &config);

    let failure = controller
        .run(RunRequest::new(alert(Priority::High)), &CancelSignal::never())
        .await
        .expect_err("timed out");

    assert!(matches!(
        failure.error,
        PipelineError::Collaborator {
            source: RetryError::TimedOut { .. },
            ..
        }
    ));
    assert_eq!(failure.error.kind(), ErrorKind::Timeout);
}

#[tokio::test]
async fn service_creates_then_updates_one_ticket() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dedup = DedupEngine::new(Arc::new(InMemoryDedupStore::new()), &DedupConfig::default());
    let tickets = Arc::new(NdjsonTicketSink::new(dir.path().join("tickets.ndjson")));
    let service = IncidentService::new(dedup, controller(Arc::new(ScriptedClient::new())), tickets);

    let first = service
        .handle_alert(
            RunRequest::new(alert(Priority::High)).with_events(auth_cascade_events()),
            &CancelSignal::never(),
        )
        .await
        .expect("first alert handled");
    assert_eq!(first.classification, DedupClassification::New);
    assert_eq!(first.status, RunStatus::Completed);
    assert!(matches!(first.ticket_action, Some(TicketAction::Create { .. })));
    let ticket_ref = first.ticket_ref.clone().expect("ticket created");

    let second = service
        .handle_alert(RunRequest::new(alert(Priority::High)), &CancelSignal::never())
        .await
        .expect("second alert handled");
    assert_eq!(second.classification, DedupClassification::Existing);
    assert_eq!(second.occurrence_count, 2);
    assert_eq!(second.fingerprint, first.fingerprint);
    match &second.ticket_action {
        Some(TicketAction::Update {
            ticket_ref: existing,
            ..
        }) => assert_eq!(existing, &ticket_ref),
        other => panic!("expected update, got {:?}", other),
    }
    assert_eq!(second.ticket_ref.as_deref(), Some(ticket_ref.as_str()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_runs_converge_on_one_ticket() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dedup_path = dir.path().join("dedup.ndjson");
    let ticket_log = dir.path().join("tickets.ndjson");
    let service = || {
        IncidentService::new(
            DedupEngine::new(Arc::new(FileDedupStore::new(&dedup_path)), &DedupConfig::default()),
            controller(Arc::new(ScriptedClient::new())),
            Arc::new(NdjsonTicketSink::new(&ticket_log)),
        )
    };
    let (a, b) = (service(), service());

    let (cancel_a, cancel_b) = (CancelSignal::never(), CancelSignal::never());
    let (first, second) = tokio::join!(
        a.handle_alert(RunRequest::new(alert(Priority::High)), &cancel_a),
        b.handle_alert(RunRequest::new(alert(Priority::High)), &cancel_b)
    );
    let (first, second) = (first.expect("first handled"), second.expect("second handled"));
    assert_eq!(first.fingerprint, second.fingerprint);

    let mut classes = vec![first.classification, second.classification];
    classes.sort_by_key(|c| c.to_string());
    assert_eq!(classes, vec![DedupClassification::Existing, DedupClassification::New]);

    let ticket_ref = first.ticket_ref.clone().expect("ticket attached");
    assert_eq!(second.ticket_ref.as_deref(), Some(ticket_ref.as_str()));
    let stored = FileDedupStore::new(&dedup_path)
        .get(&first.fingerprint)
        .await
        .unwrap()
        .expect("record stored");
    assert_eq!(stored.ticket_ref.as_deref(), Some(ticket_ref.as_str()));
    assert_eq!(stored.occurrence_count, 2);
}

#[tokio::test]
async fn service_reports_failure_without_ticket() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dedup = DedupEngine::new(Arc::new(InMemoryDedupStore::new()), &DedupConfig::default());
    let tickets = Arc::new(NdjsonTicketSink::new(dir.path().join("tickets.ndjson")));
    let client = ScriptedClient::new().on(StageId::Diagnosis, |_| {
        Err(InferenceError::Status {
            status: 400,
            body: "bad request".to_string(),
        })
    });
    let service = IncidentService::new(dedup, controller(Arc::new(client)), tickets);

    let report = service
        .handle_alert(RunRequest::new(alert(Priority::High)), &CancelSignal::never())
        .await
        .expect("failure is reported, not raised");

    match &report.status {
        RunStatus::Failed { stage, .. } => assert_eq!(*stage, Some(StageId::Diagnosis)),
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(report.ticket_action.is_none());
    assert!(report.ticket_ref.is_none());
    assert!(report.root_cause.is_some());
}
