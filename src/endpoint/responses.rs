//! Response bodies and headers parsed from the endpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::TaskId;

/// Preprocess route response.
#[derive(Debug, Clone, Deserialize)]
pub struct PreprocessResponse {
    #[serde(default)]
    pub abort: bool,
    #[serde(default)]
    pub properties: Option<Value>,
}

/// Error envelope used both in non-2xx bodies and in `ERROR` responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskRef {
    pub id: TaskId,
}

/// Task payload carried by the resume variants.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeTaskBody {
    pub id: TaskId,
    #[serde(default)]
    pub output_properties: Option<Value>,
    /// Present when an operation (e.g. fetch) owns the task's completion.
    #[serde(default)]
    pub operation: Option<String>,
    /// Present when an external callback owns the task's completion.
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub delay_until: Option<DateTime<Utc>>,
}

/// Bookkeeping carried by an auto-yield.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoYieldCheckpoint {
    pub location: String,
    pub time_remaining: i64,
    pub time_elapsed: i64,
    #[serde(default)]
    pub limit: Option<i64>,
}

/// Task completion embedded in `AUTO_YIELD_EXECUTION_WITH_COMPLETED_TASK`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedTaskEnvelope {
    pub id: TaskId,
    #[serde(default)]
    pub properties: Option<Value>,
    /// Serialised JSON, parsed before completion.
    #[serde(default)]
    pub output: Option<String>,
    pub execution: AutoYieldCheckpoint,
}

/// The closed tagged union an execute chunk can answer with. Matching is
/// exhaustive; an unknown `status` fails deserialization and the run fails
/// with an invalid-response error.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecuteResponse {
    Success {
        #[serde(default)]
        output: Option<Value>,
    },
    Error {
        error: ErrorBody,
        #[serde(default)]
        task: Option<TaskRef>,
    },
    InvalidPayload {
        errors: Value,
    },
    UnresolvedAuthError {
        issues: Value,
    },
    Canceled,
    ResumeWithTask {
        task: ResumeTaskBody,
    },
    RetryWithTask {
        task: TaskRef,
        #[serde(rename = "retryAt")]
        retry_at: DateTime<Utc>,
        error: ErrorBody,
    },
    YieldExecution {
        key: String,
    },
    AutoYieldExecution(AutoYieldCheckpoint),
    AutoYieldExecutionWithCompletedTask(CompletedTaskEnvelope),
    ResumeWithParallelTask {
        task: ResumeTaskBody,
        #[serde(rename = "childErrors", default)]
        child_errors: Vec<ExecuteResponse>,
    },
}

/// Structured `x-trigger-run-metadata` response header.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetadata {
    #[serde(default)]
    pub success_subscription: Option<bool>,
    #[serde(default)]
    pub failed_subscription: Option<bool>,
}
