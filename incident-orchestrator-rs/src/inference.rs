// incident-orchestrator-rs/src/inference.rs
// Interface to the external inference collaborator that performs each
// stage's analysis. The pipeline only sees structured JSON coming back.

use std::time::Duration;

use async_trait::async_trait;
use dependency_graph::CascadeAnalysis;
use error_handling::{Classify, ErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::ContextEnvelope;
use crate::stages::StageId;

/// Everything a stage call sends out. `context` is a copy of the envelope,
/// never the controller's own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub stage: StageId,
    pub system_prompt: String,
    pub user_message: String,
    pub context: ContextEnvelope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cascade: Option<CascadeAnalysis>,
    #[serde(default)]
    pub namespaces: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("collaborator returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode collaborator response: {0}")]
    Decode(String),

    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
}

impl Classify for InferenceError {
    fn kind(&self) -> ErrorKind {
        match self {
            InferenceError::Http(_) | InferenceError::Unavailable(_) => ErrorKind::Communication,
            InferenceError::Status { status, .. } if *status == 429 || *status >= 500 => {
                ErrorKind::External
            }
            InferenceError::Status { .. } => ErrorKind::Configuration,
            InferenceError::Decode(_) => ErrorKind::Validation,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Run one stage's analysis. The response is returned as-is; repair and
    /// validation happen in the pipeline.
    async fn infer(&self, request: InferenceRequest) -> Result<Value, InferenceError>;
}

/// Posts each request as JSON to a single HTTP endpoint.
pub struct HttpInferenceClient {
    endpoint: String,
    http_client: reqwest::Client,
}

impl HttpInferenceClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, InferenceError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| InferenceError::Http(e.to_string()))?;

        Ok(Self {
            endpoint: endpoint.into(),
            http_client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn infer(&self, request: InferenceRequest) -> Result<Value, InferenceError> {
        let response = self
            .http_client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    InferenceError::Unavailable(e.to_string())
                } else {
                    InferenceError::Http(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        // Text first: collaborators sometimes answer with fenced or
        // wrapped JSON, which the validation gate knows how to repair.
        let text = response
            .text()
            .await
            .map_err(|e| InferenceError::Decode(e.to_string()))?;
        Ok(serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_errors_classify_by_code() {
        let busy = InferenceError::Status {
            status: 503,
            body: String::new(),
        };
        assert!(busy.kind().is_transient());

        let throttled = InferenceError::Status {
            status: 429,
            body: String::new(),
        };
        assert!(throttled.kind().is_transient());

        let rejected = InferenceError::Status {
            status: 400,
            body: "bad request".to_string(),
        };
        assert!(!rejected.kind().is_transient());
        assert!(InferenceError::Unavailable("refused".into()).kind().is_transient());
        assert!(!InferenceError::Decode("eof".into()).kind().is_transient());
    }

    #[test]
    fn client_builds_with_timeout() {
        let client = HttpInferenceClient::new("http://127.0.0.1:9/infer", Duration::from_secs(5))
            .expect("client builds");
        assert_eq!(client.endpoint(), "http://127.0.0.1:9/infer");
    }
}
