// incident-orchestrator-rs/src/validation.rs
// Validation gate run on every collaborator response before it reaches the
// envelope.
//
// - Bounded repair: code fences, wrapper keys ("output", ...), single-item
//   arrays, JSON embedded in prose.
// - Critical fields missing => error; the controller aborts the run.
// - Optional fields missing => warning plus default.

use error_handling::{Classify, ErrorKind};
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::stages::{StageId, StagePayload};

/// Wrapper keys peeled off when a response has no stage tag at top level.
const WRAPPER_KEYS: &[&str] = &["output", "json", "data", "result", "response"];

/// Maximum number of wrapper layers / string decodes before giving up.
const MAX_REPAIR_DEPTH: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("output for stage '{stage}' is malformed: {reason}")]
    Malformed { stage: StageId, reason: String },

    #[error("output for stage '{stage}' is missing critical field '{field}'")]
    CriticalFieldMissing { stage: StageId, field: String },

    #[error("expected output for stage '{expected}', got '{found}'")]
    StageMismatch { expected: StageId, found: String },

    #[error("output for stage '{stage}' does not match its schema: {reason}")]
    Schema { stage: StageId, reason: String },
}

impl Classify for ValidationError {
    fn kind(&self) -> ErrorKind {
        match self {
            ValidationError::StageMismatch { .. } => ErrorKind::Integrity,
            _ => ErrorKind::Validation,
        }
    }
}

/// Repaired top-level object plus whether any repair was needed.
#[derive(Debug, Clone, PartialEq)]
pub struct Repaired {
    pub body: Map<String, Value>,
    pub repaired: bool,
}

/// A response that passed the gate.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedOutput {
    pub payload: StagePayload,
    pub decision: bool,
    /// `context_id` exactly as the collaborator echoed it.
    pub echoed_context_id: Option<String>,
    pub tools_executed: u64,
    pub warnings: Vec<String>,
    pub repaired: bool,
}

/// Required fields per stage. Dotted names address nested objects.
pub fn critical_fields(stage: StageId) -> &'static [&'static str] {
    match stage {
        StageId::HealthSnapshot => &["overall_status"],
        StageId::AnomalyDetection => &["anomalies"],
        StageId::PatternAnalysis => &["patterns"],
        StageId::RootCause => &["root_cause", "root_cause.service", "root_cause.cause"],
        StageId::Diagnosis => &["diagnosis"],
        StageId::Remediation => &["actions"],
        StageId::Prevention => &["recommendations"],
    }
}

fn optional_fields(stage: StageId) -> Vec<(&'static str, Value)> {
    match stage {
        StageId::HealthSnapshot => vec![
            ("affected_services", json!([])),
            ("anomaly_suspected", json!(false)),
            ("metrics", json!({})),
        ],
        StageId::AnomalyDetection => vec![],
        StageId::PatternAnalysis => vec![("correlated_alerts", json!([]))],
        StageId::RootCause => vec![("contributing_factors", json!([]))],
        StageId::Diagnosis => vec![("affected_services", json!([]))],
        StageId::Remediation => vec![],
        StageId::Prevention => vec![],
    }
}

#[derive(Debug, Clone)]
pub struct ValidationGate {
    expected_tools_executed: u64,
}

impl Default for ValidationGate {
    fn default() -> Self {
        Self::new(1)
    }
}

impl ValidationGate {
    pub fn new(expected_tools_executed: u64) -> Self {
        Self {
            expected_tools_executed,
        }
    }

    /// Reduce a raw response to a top-level JSON object.
    pub fn repair(&self, stage: StageId, raw: Value) -> Result<Repaired, ValidationError> {
        let mut current = raw;
        let mut repaired = false;

        for _ in 0..=MAX_REPAIR_DEPTH {
            current = match current {
                Value::Object(mut map) => {
                    if map.contains_key("stage") {
                        return Ok(Repaired { body: map, repaired });
                    }
                    let wrapper = WRAPPER_KEYS.iter().copied().find(|key| {
                        matches!(
                            map.get(*key),
                            Some(Value::Object(_)) | Some(Value::String(_)) | Some(Value::Array(_))
                        )
                    });
                    let Some(key) = wrapper else {
                        return Ok(Repaired { body: map, repaired });
                    };
                    repaired = true;
                    match map.remove(key) {
                        Some(Value::Object(mut inner)) => {
                            // Keep an outer echo if the inner object has none.
                            for carried in ["context_id", "contextId"] {
                                if let Some(ctx) = map.remove(carried) {
                                    inner.entry(carried).or_insert(ctx);
                                }
                            }
                            Value::Object(inner)
                        }
                        Some(other) => other,
                        None => Value::Null,
                    }
                }
                Value::String(text) => {
                    repaired = true;
                    parse_loose(&text).ok_or_else(|| ValidationError::Malformed {
                        stage,
                        reason: "text response does not contain a JSON object".to_string(),
                    })?
                }
                Value::Array(mut items) if items.len() == 1 => {
                    repaired = true;
                    items.remove(0)
                }
                other => {
                    return Err(ValidationError::Malformed {
                        stage,
                        reason: format!("expected a JSON object, got {}", json_type(&other)),
                    })
                }
            };
        }

        Err(ValidationError::Malformed {
            stage,
            reason: "response nesting exceeds repair depth".to_string(),
        })
    }

    /// Repair, check and parse a response for `stage`.
    pub fn validate(&self, stage: StageId, raw: Value) -> Result<ValidatedOutput, ValidationError> {
        let Repaired { body, repaired } = self.repair(stage, raw)?;
        self.validate_object(stage, body, repaired)
    }

    /// Check and parse an already repaired object.
    pub fn validate_object(
        &self,
        stage: StageId,
        mut body: Map<String, Value>,
        repaired: bool,
    ) -> Result<ValidatedOutput, ValidationError> {
        let mut warnings = Vec::new();
        if repaired {
            warnings.push("collaborator output needed repair".to_string());
        }

        check_stage_tag(stage, body.remove("stage"))?;

        let echoed_context_id = body
            .remove("context_id")
            .or_else(|| body.remove("contextId"))
            .and_then(|v| match v {
                Value::Null => None,
                Value::String(s) => Some(s),
                other => Some(other.to_string()),
            });

        let decision = match take_decision(&mut body) {
            Some(decision) => decision,
            None if stage.is_last() => true,
            None => {
                return Err(ValidationError::CriticalFieldMissing {
                    stage,
                    field: "proceed".to_string(),
                })
            }
        };

        let tools_executed = match body.remove("tools_executed").and_then(|v| v.as_u64()) {
            Some(count) => count,
            None => {
                warnings.push("optional field 'tools_executed' missing, defaulted to 0".to_string());
                0
            }
        };
        if tools_executed < self.expected_tools_executed {
            warnings.push(format!(
                "tools_executed {} below expected {}",
                tools_executed, self.expected_tools_executed
            ));
        }

        if let Some(Value::Array(carried)) = body.remove("warnings") {
            warnings.extend(carried.into_iter().filter_map(|w| match w {
                Value::String(s) => Some(s),
                _ => None,
            }));
        }

        for field in critical_fields(stage) {
            if !field_present(&body, field) {
                return Err(ValidationError::CriticalFieldMissing {
                    stage,
                    field: field.to_string(),
                });
            }
        }

        for (field, default) in optional_fields(stage) {
            if matches!(body.get(field), None | Some(Value::Null)) {
                warnings.push(format!("optional field '{}' missing, defaulted", field));
                body.insert(field.to_string(), default);
            }
        }

        let payload = StagePayload::parse(stage, Value::Object(body)).map_err(|e| {
            ValidationError::Schema {
                stage,
                reason: e.to_string(),
            }
        })?;

        for warning in &warnings {
            warn!(stage = %stage, warning = %warning, "Non-critical validation issue");
        }

        Ok(ValidatedOutput {
            payload,
            decision,
            echoed_context_id,
            tools_executed,
            warnings,
            repaired,
        })
    }
}

fn check_stage_tag(stage: StageId, tag: Option<Value>) -> Result<(), ValidationError> {
    match tag {
        None | Some(Value::Null) => Err(ValidationError::CriticalFieldMissing {
            stage,
            field: "stage".to_string(),
        }),
        Some(Value::String(raw)) => match raw.parse::<StageId>() {
            Ok(found) if found == stage => Ok(()),
            _ => Err(ValidationError::StageMismatch {
                expected: stage,
                found: raw,
            }),
        },
        Some(other) => Err(ValidationError::StageMismatch {
            expected: stage,
            found: other.to_string(),
        }),
    }
}

/// Pull the proceed flag out of `proceed`, `decision` or any
/// `proceed_to_*` key.
fn take_decision(body: &mut Map<String, Value>) -> Option<bool> {
    let key = ["proceed", "decision"]
        .into_iter()
        .map(str::to_string)
        .find(|k| body.contains_key(k))
        .or_else(|| body.keys().find(|k| k.starts_with("proceed_to_")).cloned())?;

    match body.remove(&key)? {
        Value::Bool(b) => Some(b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "proceed" => Some(true),
            "false" | "no" | "stop" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn field_present(body: &Map<String, Value>, dotted: &str) -> bool {
    let mut parts = dotted.split('.');
    let Some(first) = parts.next() else {
        return false;
    };
    let mut current = match body.get(first) {
        Some(v) => v,
        None => return false,
    };
    for part in parts {
        current = match current.get(part) {
            Some(v) => v,
            None => return false,
        };
    }
    match current {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        _ => true,
    }
}

/// Parse JSON out of text that may be fenced or surrounded by prose.
fn parse_loose(text: &str) -> Option<Value> {
    let trimmed = strip_code_fence(text.trim());
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&trimmed[start..=end]).ok()
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the language tag line, if any.
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
