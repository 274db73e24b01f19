//! Domain model for runs, tasks, and their surrounding aggregate.
//!
//! A [`Run`] is one triggered execution of a job version. The coordinator
//! drives it forward one endpoint round-trip at a time; everything the
//! drivers read during a chunk is loaded up front into a [`RunAggregate`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identifier newtypes. Kept as transparent UUID wrappers so they bind
/// directly through sqlx and serialize as plain strings.
macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
        )]
        #[sqlx(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_type!(RunId);
id_type!(TaskId);
id_type!(EndpointId);
id_type!(OrganizationId);
id_type!(EnvironmentId);
id_type!(ProjectId);
id_type!(JobId);
id_type!(JobVersionId);
id_type!(EventId);

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Queued,
    Started,
    WaitingToResume,
    Success,
    Failure,
    Aborted,
    TimedOut,
    UnresolvedAuth,
    InvalidPayload,
    Canceled,
}

impl RunStatus {
    /// Terminal statuses are never re-enqueued.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Success
                | RunStatus::Failure
                | RunStatus::Aborted
                | RunStatus::TimedOut
                | RunStatus::UnresolvedAuth
                | RunStatus::InvalidPayload
                | RunStatus::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Started => "STARTED",
            Self::WaitingToResume => "WAITING_TO_RESUME",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Aborted => "ABORTED",
            Self::TimedOut => "TIMED_OUT",
            Self::UnresolvedAuth => "UNRESOLVED_AUTH",
            Self::InvalidPayload => "INVALID_PAYLOAD",
            Self::Canceled => "CANCELED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(Self::Queued),
            "STARTED" => Some(Self::Started),
            "WAITING_TO_RESUME" => Some(Self::WaitingToResume),
            "SUCCESS" => Some(Self::Success),
            "FAILURE" => Some(Self::Failure),
            "ABORTED" => Some(Self::Aborted),
            "TIMED_OUT" => Some(Self::TimedOut),
            "UNRESOLVED_AUTH" => Some(Self::UnresolvedAuth),
            "INVALID_PAYLOAD" => Some(Self::InvalidPayload),
            "CANCELED" => Some(Self::Canceled),
            _ => None,
        }
    }
}

/// Lifecycle status of a task within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Waiting,
    Running,
    Completed,
    Errored,
    Canceled,
}

impl TaskStatus {
    /// Statuses swept to a terminal state when the run fails.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::Waiting | TaskStatus::Running
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Waiting => "WAITING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Errored => "ERRORED",
            Self::Canceled => "CANCELED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "WAITING" => Some(Self::Waiting),
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "ERRORED" => Some(Self::Errored),
            "CANCELED" => Some(Self::Canceled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskAttemptStatus {
    Pending,
    Errored,
}

impl TaskAttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Errored => "ERRORED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "ERRORED" => Some(Self::Errored),
            _ => None,
        }
    }
}

/// One triggered execution of a job version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Incremented once per chunk accepted by the endpoint.
    pub execution_count: i32,
    /// Cumulative milliseconds spent inside endpoint calls.
    pub execution_duration_ms: i64,
    /// Ordered opaque checkpoint keys supplied by the endpoint.
    pub yielded_executions: Vec<String>,
    pub output: Option<Value>,
    pub properties: Option<Value>,
    /// Consumed at body-build time, cleared on every resume path.
    pub force_yield_immediately: bool,
    pub is_test: bool,
    /// Internal runs never register endpoint subscriptions from headers.
    pub internal: bool,
    pub environment_id: EnvironmentId,
    pub endpoint_id: EndpointId,
    pub organization_id: OrganizationId,
    pub project_id: ProjectId,
    pub event_id: EventId,
    pub version_id: JobVersionId,
    pub external_account_id: Option<Uuid>,
}

/// One unit of work inside a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub run_id: RunId,
    pub idempotency_key: String,
    pub display_key: Option<String>,
    pub status: TaskStatus,
    pub noop: bool,
    pub output: Option<Value>,
    pub output_is_undefined: bool,
    pub output_properties: Option<Value>,
    pub parent_id: Option<TaskId>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A retry attempt on a task. Numbering is contiguous per task, from 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAttempt {
    pub task_id: TaskId,
    pub number: i32,
    pub status: TaskAttemptStatus,
    pub run_at: Option<DateTime<Utc>>,
    pub error: Option<Value>,
}

/// The four cooperative-yield thresholds sent to version-gated endpoints.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoYieldConfig {
    pub start_threshold_ms: i64,
    pub before_execute_threshold_ms: i64,
    pub before_complete_threshold_ms: i64,
    pub after_complete_threshold_ms: i64,
}

/// A user's HTTP target for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: EndpointId,
    pub url: String,
    pub api_key: String,
    /// Updated opportunistically from the `trigger-version` response header.
    pub version: Option<String>,
    /// Adaptive per-chunk soft limit, bounded by
    /// [`crate::MIN_RUN_CHUNK_EXECUTION_LIMIT`] and
    /// [`crate::MAX_RUN_CHUNK_EXECUTION_LIMIT`].
    pub run_chunk_execution_limit_ms: i64,
    pub auto_yield: AutoYieldConfig,
}

impl Endpoint {
    /// Whether the endpoint understands the lazy-cached-task body fields
    /// (cursor, Bloom filter, yield history, chunk limit, yield config).
    pub fn supports_lazy_cached_tasks(&self) -> bool {
        match self.version.as_deref() {
            Some(version) => version >= crate::LAZY_LOADED_CACHED_TASKS_VERSION,
            None => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: OrganizationId,
    pub slug: String,
    pub maximum_execution_time_per_run_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvironmentType {
    Development,
    Staging,
    Production,
}

impl EnvironmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "DEVELOPMENT",
            Self::Staging => "STAGING",
            Self::Production => "PRODUCTION",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DEVELOPMENT" => Some(Self::Development),
            "STAGING" => Some(Self::Staging),
            "PRODUCTION" => Some(Self::Production),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub id: EnvironmentId,
    pub slug: String,
    pub env_type: EnvironmentType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub slug: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalAccount {
    pub id: Uuid,
    pub identifier: String,
    pub metadata: Option<Value>,
}

/// The event that triggered the run, including the raw source context the
/// endpoint may need to re-establish its trigger source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub name: String,
    pub payload: Value,
    pub context: Value,
    pub source_context: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobVersion {
    pub id: JobVersionId,
    pub version: String,
    pub job_id: JobId,
    pub job_slug: String,
}

/// A connection row linking the run to an integration credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConnection {
    pub id: Uuid,
    /// Integration key the endpoint addresses this connection by.
    pub key: String,
    /// Stored auth payload, if the credential has been materialised.
    pub auth: Option<Value>,
}

/// Materialised credential handed to the endpoint, keyed by integration key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionAuth {
    #[serde(rename = "type")]
    pub auth_type: String,
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_fields: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionEvent {
    Success,
    Failure,
}

impl SubscriptionEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SUCCESS" => Some(Self::Success),
            "FAILURE" => Some(Self::Failure),
            _ => None,
        }
    }
}

/// An endpoint's opt-in to be notified when the run finishes.
/// Unique per `(run, recipient, event)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSubscription {
    pub id: Uuid,
    pub run_id: RunId,
    pub recipient: String,
    pub event: SubscriptionEvent,
    pub active: bool,
}

/// Record of one cooperative yield checkpoint taken by the endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoYieldExecution {
    pub id: Uuid,
    pub run_id: RunId,
    pub location: String,
    pub time_remaining_ms: i64,
    pub time_elapsed_ms: i64,
    pub limit_ms: i64,
}

/// Everything the drivers read during one chunk, loaded in a single pass.
#[derive(Debug, Clone)]
pub struct RunAggregate {
    pub run: Run,
    pub environment: Environment,
    pub endpoint: Endpoint,
    pub organization: Organization,
    pub project: Project,
    pub external_account: Option<ExternalAccount>,
    pub event: Event,
    pub version: JobVersion,
    pub connections: Vec<RunConnection>,
    /// `COMPLETED` tasks only, ordered ascending by id for determinism.
    pub completed_tasks: Vec<Task>,
    /// Subscriptions restricted to the `ENDPOINT` recipient method.
    pub subscriptions: Vec<RunSubscription>,
    /// Total task count at load time, compared against after a timeout to
    /// decide whether the chunk made forward progress.
    pub task_count: i64,
}

impl RunAggregate {
    /// Whether retry enqueueing should be skipped for follow-up executions.
    pub fn skip_retrying(&self) -> bool {
        self.environment.env_type == EnvironmentType::Development
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_cover_the_completed_set() {
        for status in [
            RunStatus::Success,
            RunStatus::Failure,
            RunStatus::Aborted,
            RunStatus::TimedOut,
            RunStatus::UnresolvedAuth,
            RunStatus::InvalidPayload,
            RunStatus::Canceled,
        ] {
            assert!(status.is_terminal(), "{status:?} should be terminal");
        }
        for status in [
            RunStatus::Queued,
            RunStatus::Started,
            RunStatus::WaitingToResume,
        ] {
            assert!(!status.is_terminal(), "{status:?} should not be terminal");
        }
    }

    #[test]
    fn lazy_cached_tasks_gate_compares_version_dates() {
        let mut endpoint = Endpoint {
            id: EndpointId::new(),
            url: "https://example.test/api".into(),
            api_key: "key".into(),
            version: None,
            run_chunk_execution_limit_ms: 60_000,
            auto_yield: AutoYieldConfig {
                start_threshold_ms: 500,
                before_execute_threshold_ms: 500,
                before_complete_threshold_ms: 500,
                after_complete_threshold_ms: 500,
            },
        };
        assert!(!endpoint.supports_lazy_cached_tasks());

        endpoint.version = Some("2023-07-01".into());
        assert!(!endpoint.supports_lazy_cached_tasks());

        endpoint.version = Some(crate::LAZY_LOADED_CACHED_TASKS_VERSION.into());
        assert!(endpoint.supports_lazy_cached_tasks());

        endpoint.version = Some("2024-01-15".into());
        assert!(endpoint.supports_lazy_cached_tasks());
    }
}
