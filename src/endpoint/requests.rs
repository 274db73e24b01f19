//! Request bodies sent to the endpoint's preprocess and execute routes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::models::{AutoYieldConfig, ConnectionAuth, RunId};
use crate::task_cache::CachedTask;

#[derive(Debug, Clone, Serialize)]
pub struct JobIdentity {
    pub id: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunIdentity {
    pub id: RunId,
    pub is_test: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_retry: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentInfo {
    pub id: String,
    pub slug: String,
    #[serde(rename = "type")]
    pub env_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrganizationInfo {
    pub id: String,
    pub slug: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub id: String,
    pub name: String,
    pub payload: Value,
    pub context: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreprocessRequest {
    pub event: EventEnvelope,
    pub job: JobIdentity,
    pub run: RunIdentity,
    pub environment: EnvironmentInfo,
    pub organization: OrganizationInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<AccountInfo>,
}

/// The execute body. Fields below `source` only exist for endpoints that
/// understand lazy cached tasks; older endpoints receive the legacy packing
/// and none of the optional trailer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub event: EventEnvelope,
    pub job: JobIdentity,
    pub run: RunIdentity,
    pub environment: EnvironmentInfo,
    pub organization: OrganizationInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<AccountInfo>,
    pub connections: HashMap<String, ConnectionAuth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Value>,
    pub tasks: Vec<CachedTask>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_task_cursor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub noop_tasks_set: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yielded_executions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_chunk_execution_limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_yield_config: Option<AutoYieldConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_yield_immediately: Option<bool>,
}
