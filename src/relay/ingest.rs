//! Outbound client for the ingestion endpoint.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Serialize;

use super::MessageEnvelope;

/// Body posted to the ingestion endpoint for one message.
#[derive(Debug, Serialize)]
pub struct ProcessRequest {
    pub data: String,
}

impl ProcessRequest {
    pub fn from_envelope(envelope: &MessageEnvelope, origin: &str) -> Self {
        Self {
            data: format!("{} processed by {}", String::from_utf8_lossy(&envelope.payload), origin),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStatus {
    Success,
    Failure,
}

/// Outcome of one ingestion call. Lives only for one relay iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingResult {
    pub status: ProcessingStatus,
    /// HTTP status, absent when the endpoint could not be reached.
    pub http_status: Option<u16>,
    pub detail: Option<String>,
}

impl ProcessingResult {
    pub fn is_success(&self) -> bool {
        self.status == ProcessingStatus::Success
    }
}

#[derive(Debug, Clone)]
pub struct IngestionClient {
    client: reqwest::Client,
    endpoint: String,
    origin: String,
}

impl IngestionClient {
    pub fn new(
        endpoint: impl Into<String>,
        origin: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint: endpoint.into(), origin: origin.into() })
    }

    /// POST one envelope to the endpoint. Never fails: every outcome is a result.
    pub async fn forward(&self, envelope: &MessageEnvelope) -> ProcessingResult {
        let body = ProcessRequest::from_envelope(envelope, &self.origin);
        let response = match self.client.post(&self.endpoint).json(&body).send().await {
            Ok(response) => response,
            Err(e) => {
                return ProcessingResult {
                    status: ProcessingStatus::Failure,
                    http_status: None,
                    detail: Some(format!("ingestion endpoint unreachable: {e}")),
                };
            }
        };
        let code = response.status();
        let text = response.text().await.unwrap_or_default();
        ProcessingResult {
            status: if code == StatusCode::OK {
                ProcessingStatus::Success
            } else {
                ProcessingStatus::Failure
            },
            http_status: Some(code.as_u16()),
            detail: (!text.is_empty()).then_some(text),
        }
    }
}
