// incident-orchestrator-rs/src/prompts.rs
// Stage prompts. One system prompt per stage; the user message is built
// from the alert and the validated results of earlier stages, all passed
// in explicitly.

use std::fmt::Write as _;

use dependency_graph::CascadeAnalysis;
use fingerprint::Alert;

use crate::envelope::StageResult;
use crate::stages::StageId;

const RESPONSE_CONTRACT: &str = "Respond with a single JSON object. It must contain \
\"stage\" (this stage's id), \"context_id\" (copied verbatim from the context), \
\"proceed\" (boolean: should the investigation continue) and \"tools_executed\" \
(number of telemetry queries you ran). Use only service names that appear in the \
alert, the telemetry or earlier results; never invent example identifiers.";

pub fn system_prompt(stage: StageId) -> String {
    let task = match stage {
        StageId::HealthSnapshot => {
            "You take a health snapshot of the services named in the alert. Report \
             \"overall_status\" (healthy, degraded or critical), \"affected_services\", \
             \"anomaly_suspected\" and the key \"metrics\" you looked at."
        }
        StageId::AnomalyDetection => {
            "You look for statistical anomalies in the metrics of the affected services. \
             Report \"anomalies\" as a list of {service, metric, description, severity}."
        }
        StageId::PatternAnalysis => {
            "You analyse error patterns across logs and traces. A cascade analysis computed \
             from the service dependency graph is attached; use it. Report \"patterns\" and \
             \"correlated_alerts\"."
        }
        StageId::RootCause => {
            "You determine the root cause. Report \"root_cause\" as {service, cause, \
             confidence, evidence} and \"contributing_factors\"."
        }
        StageId::Diagnosis => {
            "You write the diagnosis an on-call engineer will read. Report \"diagnosis\", \
             \"severity\" and \"affected_services\"."
        }
        StageId::Remediation => {
            "You propose remediation. Report \"actions\" as a list of {description, service, \
             requires_approval}. Respect the restart order given in the cascade analysis."
        }
        StageId::Prevention => {
            "You recommend how to prevent recurrence. Report \"recommendations\"; consider \
             the circuit-breaker points in the cascade analysis."
        }
    };
    format!("{}\n\n{}", task, RESPONSE_CONTRACT)
}

/// User message for `stage`, built from the alert and prior results.
pub fn user_message(
    stage: StageId,
    alert: &Alert,
    context_id: &str,
    prior: &[&StageResult],
    cascade: Option<&CascadeAnalysis>,
) -> String {
    let mut msg = String::new();
    let _ = writeln!(msg, "Stage: {}", stage);
    let _ = writeln!(msg, "Context id: {}", context_id);
    let _ = writeln!(msg, "Alert source: {}", alert.source);
    let _ = writeln!(msg, "Alert title: {}", alert.title);
    let _ = writeln!(msg, "Priority: {}", alert.priority);
    if !alert.services.is_empty() {
        let _ = writeln!(msg, "Services: {}", alert.services.join(", "));
    }
    if !alert.body.is_empty() {
        let _ = writeln!(msg, "Alert body:\n{}", alert.body);
    }

    if !prior.is_empty() {
        let _ = writeln!(msg, "\nEarlier stage results:");
        for result in prior {
            let payload = serde_json::to_string(&result.payload).unwrap_or_default();
            let _ = writeln!(msg, "- {} (proceed={}): {}", result.stage, result.decision, payload);
        }
    }

    if let Some(analysis) = cascade {
        let _ = writeln!(
            msg,
            "\nCascade analysis: {} chain(s), blast radius [{}], restart order [{}]",
            analysis.chains.len(),
            analysis.blast_radius.iter().cloned().collect::<Vec<_>>().join(", "),
            analysis.restart_order.join(", ")
        );
        if let Some(primary) = analysis.primary_chain() {
            let _ = writeln!(
                msg,
                "Primary chain root: {} ({}) at {}",
                primary.root_cause.service, primary.root_cause.error_type, primary.root_cause.timestamp
            );
        }
    }
    msg
}
