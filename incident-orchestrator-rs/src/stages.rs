// incident-orchestrator-rs/src/stages.rs
// Stage identifiers and the per-stage result payloads. Collaborator output
// is parsed once into one of these shapes; fields the schema does not know
// about are kept in `extra`.

use std::fmt;
use std::str::FromStr;

use dependency_graph::{CascadeAnalysis, CircuitBreakerPoint};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    HealthSnapshot,
    AnomalyDetection,
    PatternAnalysis,
    RootCause,
    Diagnosis,
    Remediation,
    Prevention,
}

impl StageId {
    pub const ALL: [StageId; 7] = [
        StageId::HealthSnapshot,
        StageId::AnomalyDetection,
        StageId::PatternAnalysis,
        StageId::RootCause,
        StageId::Diagnosis,
        StageId::Remediation,
        StageId::Prevention,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StageId::HealthSnapshot => "health_snapshot",
            StageId::AnomalyDetection => "anomaly_detection",
            StageId::PatternAnalysis => "pattern_analysis",
            StageId::RootCause => "root_cause",
            StageId::Diagnosis => "diagnosis",
            StageId::Remediation => "remediation",
            StageId::Prevention => "prevention",
        }
    }

    /// Stage that follows this one. The anomaly stage is only entered from
    /// the health snapshot, and only when `anomaly_branch` is set.
    pub fn next(self, anomaly_branch: bool) -> Option<StageId> {
        match self {
            StageId::HealthSnapshot if anomaly_branch => Some(StageId::AnomalyDetection),
            StageId::HealthSnapshot => Some(StageId::PatternAnalysis),
            StageId::AnomalyDetection => Some(StageId::PatternAnalysis),
            StageId::PatternAnalysis => Some(StageId::RootCause),
            StageId::RootCause => Some(StageId::Diagnosis),
            StageId::Diagnosis => Some(StageId::Remediation),
            StageId::Remediation => Some(StageId::Prevention),
            StageId::Prevention => None,
        }
    }

    pub fn is_last(self) -> bool {
        self == StageId::Prevention
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        StageId::ALL
            .into_iter()
            .find(|stage| stage.as_str() == normalized)
            .ok_or_else(|| format!("unknown stage '{}'", s))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// "healthy", "degraded", "critical", ...
    pub overall_status: String,
    #[serde(default)]
    pub affected_services: Vec<String>,
    #[serde(default)]
    pub anomaly_suspected: bool,
    #[serde(default)]
    pub metrics: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub metric: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub severity: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyDetection {
    pub anomalies: Vec<Anomaly>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternAnalysis {
    /// Free-form findings; their shape is up to the collaborator.
    pub patterns: Vec<Value>,
    #[serde(default)]
    pub correlated_alerts: Vec<String>,
    /// Attached by the controller from the correlator, never by the collaborator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cascade: Option<CascadeAnalysis>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootCauseFinding {
    pub service: String,
    pub cause: String,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub evidence: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootCause {
    pub root_cause: RootCauseFinding,
    #[serde(default)]
    pub contributing_factors: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub diagnosis: String,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub affected_services: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationAction {
    pub description: String,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub requires_approval: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Remediation {
    pub actions: Vec<RemediationAction>,
    #[serde(default)]
    pub restart_order: Vec<String>,
    #[serde(default)]
    pub circuit_breakers: Vec<CircuitBreakerPoint>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prevention {
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub circuit_breakers: Vec<CircuitBreakerPoint>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Stage output, tagged by stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StagePayload {
    HealthSnapshot(HealthSnapshot),
    AnomalyDetection(AnomalyDetection),
    PatternAnalysis(PatternAnalysis),
    RootCause(RootCause),
    Diagnosis(Diagnosis),
    Remediation(Remediation),
    Prevention(Prevention),
}

impl StagePayload {
    /// Parse a stage body (common envelope fields already removed) into
    /// the shape for `stage`.
    pub fn parse(stage: StageId, body: Value) -> Result<Self, serde_json::Error> {
        Ok(match stage {
            StageId::HealthSnapshot => StagePayload::HealthSnapshot(serde_json::from_value(body)?),
            StageId::AnomalyDetection => {
                StagePayload::AnomalyDetection(serde_json::from_value(body)?)
            }
            StageId::PatternAnalysis => StagePayload::PatternAnalysis(serde_json::from_value(body)?),
            StageId::RootCause => StagePayload::RootCause(serde_json::from_value(body)?),
            StageId::Diagnosis => StagePayload::Diagnosis(serde_json::from_value(body)?),
            StageId::Remediation => StagePayload::Remediation(serde_json::from_value(body)?),
            StageId::Prevention => StagePayload::Prevention(serde_json::from_value(body)?),
        })
    }

    pub fn stage(&self) -> StageId {
        match self {
            StagePayload::HealthSnapshot(_) => StageId::HealthSnapshot,
            StagePayload::AnomalyDetection(_) => StageId::AnomalyDetection,
            StagePayload::PatternAnalysis(_) => StageId::PatternAnalysis,
            StagePayload::RootCause(_) => StageId::RootCause,
            StagePayload::Diagnosis(_) => StageId::Diagnosis,
            StagePayload::Remediation(_) => StageId::Remediation,
            StagePayload::Prevention(_) => StageId::Prevention,
        }
    }

    fn extra(&self) -> &Map<String, Value> {
        match self {
            StagePayload::HealthSnapshot(p) => &p.extra,
            StagePayload::AnomalyDetection(p) => &p.extra,
            StagePayload::PatternAnalysis(p) => &p.extra,
            StagePayload::RootCause(p) => &p.extra,
            StagePayload::Diagnosis(p) => &p.extra,
            StagePayload::Remediation(p) => &p.extra,
            StagePayload::Prevention(p) => &p.extra,
        }
    }

    /// Overall status reported by this stage, if any. Only the health
    /// snapshot has it as a schema field; other stages may still send it.
    pub fn overall_status(&self) -> Option<&str> {
        match self {
            StagePayload::HealthSnapshot(p) => Some(p.overall_status.as_str()),
            other => other.extra().get("overall_status").and_then(Value::as_str),
        }
    }

    pub fn reports_critical(&self) -> bool {
        self.overall_status()
            .map(|s| s.trim().eq_ignore_ascii_case("critical"))
            .unwrap_or(false)
    }

    /// Services this stage names as affected or responsible.
    pub fn named_services(&self) -> Vec<&str> {
        match self {
            StagePayload::HealthSnapshot(p) => p.affected_services.iter().map(String::as_str).collect(),
            StagePayload::AnomalyDetection(p) => {
                p.anomalies.iter().filter_map(|a| a.service.as_deref()).collect()
            }
            StagePayload::RootCause(p) => vec![p.root_cause.service.as_str()],
            StagePayload::Diagnosis(p) => p.affected_services.iter().map(String::as_str).collect(),
            StagePayload::Remediation(p) => {
                p.actions.iter().filter_map(|a| a.service.as_deref()).collect()
            }
            StagePayload::PatternAnalysis(_) | StagePayload::Prevention(_) => Vec::new(),
        }
    }
}
