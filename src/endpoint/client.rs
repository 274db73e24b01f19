//! HTTP gateway to user endpoints.
//!
//! Drivers talk to [`EndpointGateway`] so tests can script responses; the
//! production implementation is a thin reqwest client with a per-call
//! timeout. Timeouts the client itself detects (deadline hit, aborted
//! stream) are distinguished from plain connection failures because the two
//! take different recovery paths.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use super::requests::{ExecuteRequest, PreprocessRequest};
use super::responses::RunMetadata;
use crate::models::Endpoint;

/// Response header carrying the endpoint's self-reported version.
pub const VERSION_HEADER: &str = "trigger-version";
/// Response header carrying structured run metadata (subscription opt-ins).
pub const RUN_METADATA_HEADER: &str = "x-trigger-run-metadata";

const API_KEY_HEADER: &str = "x-trigger-api-key";
const ACTION_HEADER: &str = "x-trigger-action";

/// An HTTP response that actually arrived, with headers already picked out.
#[derive(Debug, Clone)]
pub struct ResponseParts {
    pub status: u16,
    pub body: String,
    pub trigger_version: Option<String>,
    pub run_metadata: Option<RunMetadata>,
}

impl ResponseParts {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone)]
pub enum CallOutcome {
    /// The endpoint could not be reached at all.
    NoResponse { error: String },
    /// The client gave up waiting or the stream aborted mid-body.
    TimedOut { error: String },
    Response(ResponseParts),
}

/// One endpoint round-trip with its measured wall-clock duration.
#[derive(Debug, Clone)]
pub struct EndpointCall {
    pub outcome: CallOutcome,
    pub duration_ms: i64,
}

#[async_trait]
pub trait EndpointGateway: Send + Sync {
    async fn preprocess(&self, endpoint: &Endpoint, body: &PreprocessRequest) -> EndpointCall;
    async fn execute(&self, endpoint: &Endpoint, body: &ExecuteRequest) -> EndpointCall;
}

/// Production gateway backed by reqwest.
pub struct HttpEndpointGateway {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpEndpointGateway {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to create HTTP client: {e}"))?;
        Ok(Self { client, timeout })
    }

    async fn call<B: Serialize + Sync>(
        &self,
        endpoint: &Endpoint,
        action: &str,
        body: &B,
    ) -> EndpointCall {
        let started = Instant::now();
        let result = self
            .client
            .post(&endpoint.url)
            .header(API_KEY_HEADER, &endpoint.api_key)
            .header(ACTION_HEADER, action)
            .timeout(self.timeout)
            .json(body)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                let duration_ms = started.elapsed().as_millis() as i64;
                let outcome = if err.is_timeout() {
                    CallOutcome::TimedOut {
                        error: err.to_string(),
                    }
                } else {
                    CallOutcome::NoResponse {
                        error: err.to_string(),
                    }
                };
                return EndpointCall {
                    outcome,
                    duration_ms,
                };
            }
        };

        let status = response.status().as_u16();
        let trigger_version = header_string(&response, VERSION_HEADER);
        let run_metadata = header_string(&response, RUN_METADATA_HEADER).and_then(|raw| {
            match serde_json::from_str::<RunMetadata>(&raw) {
                Ok(metadata) => Some(metadata),
                Err(err) => {
                    debug!(error = %err, "ignoring unparseable run metadata header");
                    None
                }
            }
        });

        let body_result = response.text().await;
        let duration_ms = started.elapsed().as_millis() as i64;
        let outcome = match body_result {
            Ok(body) => CallOutcome::Response(ResponseParts {
                status,
                body,
                trigger_version,
                run_metadata,
            }),
            // A body that dies mid-stream counts as a timeout: the endpoint
            // was alive and may have made progress.
            Err(err) => CallOutcome::TimedOut {
                error: err.to_string(),
            },
        };
        EndpointCall {
            outcome,
            duration_ms,
        }
    }
}

fn header_string(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

#[async_trait]
impl EndpointGateway for HttpEndpointGateway {
    async fn preprocess(&self, endpoint: &Endpoint, body: &PreprocessRequest) -> EndpointCall {
        self.call(endpoint, "PREPROCESS", body).await
    }

    async fn execute(&self, endpoint: &Endpoint, body: &ExecuteRequest) -> EndpointCall {
        self.call(endpoint, "EXECUTE_JOB", body).await
    }
}
