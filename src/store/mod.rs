//! Store interfaces for persisting run state and the durable job queue.
//!
//! Every mutation the execute state machine performs goes through
//! [`CoordinatorStore`]. Each method is one atomic branch outcome: an
//! observer sees either the whole effect of a chunk or none of it. Queue
//! rows accompanying a mutation are written inside the same transaction, so
//! follow-up jobs are delivered iff the mutation commits.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{
    EndpointId, RunAggregate, RunId, RunStatus, SubscriptionEvent, Task, TaskId,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Why the run is being enqueued for execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunReason {
    Preprocess,
    ExecuteJob,
}

/// A job on the durable queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueJob {
    ExecuteRun {
        run_id: RunId,
        reason: RunReason,
        #[serde(default)]
        resume_task_id: Option<TaskId>,
        /// Set for DEVELOPMENT environments: a failed delivery is dropped
        /// instead of rescheduled.
        #[serde(default)]
        skip_retrying: bool,
    },
    ResumeTask {
        run_id: RunId,
        task_id: TaskId,
    },
    DeliverRunSubscriptions {
        run_id: RunId,
    },
}

/// How long a claimed job stays leased to a worker before any other worker
/// may reclaim it.
pub const JOB_LEASE_SECONDS: i64 = 300;

/// A queue job claimed by a worker, with delivery bookkeeping.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: Uuid,
    pub job: QueueJob,
    pub scheduled_at: DateTime<Utc>,
    pub attempts: i32,
}

/// Which step a failure is attributed to; drives the two branches of
/// [`CoordinatorStore::fail_execution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    Preprocess,
    ExecuteJob,
}

/// Parameters for the single failure write-path.
#[derive(Debug, Clone)]
pub struct FailExecution {
    pub reason: FailureReason,
    pub run_id: RunId,
    pub status: RunStatus,
    pub output: Value,
    pub duration_ms: i64,
    pub skip_retrying: bool,
}

/// Parameters for the `RESUME_WITH_TASK` outcome.
#[derive(Debug, Clone)]
pub struct ResumeTaskWrite {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub duration_ms: i64,
    pub execution_count_delta: i32,
    pub output_properties: Option<Value>,
    /// When set, a `ResumeTask` job is enqueued at the given time (or
    /// immediately). Left unset when an external completion path owns the
    /// re-enqueue.
    pub enqueue_resume: bool,
    pub resume_at: Option<DateTime<Utc>>,
}

/// Parameters for the `RETRY_WITH_TASK` outcome.
#[derive(Debug, Clone)]
pub struct RetryTaskWrite {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub retry_at: DateTime<Utc>,
    pub error: Value,
    pub duration_ms: i64,
    pub execution_count_delta: i32,
}

/// Parameters shared by the yield outcomes.
#[derive(Debug, Clone)]
pub struct YieldWrite {
    pub run_id: RunId,
    /// Opaque checkpoint key appended to the run's yield history.
    pub key: String,
    pub duration_ms: i64,
    pub execution_count_delta: i32,
    pub skip_retrying: bool,
}

/// Extra bookkeeping carried by an auto-yield checkpoint.
#[derive(Debug, Clone)]
pub struct AutoYieldWrite {
    pub base: YieldWrite,
    pub time_remaining_ms: i64,
    pub time_elapsed_ms: i64,
    pub limit_ms: i64,
    /// Cleared when an external task completion precedes the re-enqueue.
    pub enqueue_execution: bool,
}

#[async_trait]
pub trait CoordinatorStore: Send + Sync {
    /// Load the full aggregate a driver needs for one chunk. Read-only.
    async fn load_run(&self, id: RunId) -> StoreResult<Option<RunAggregate>>;

    /// Transition the run out of PREPROCESS: status STARTED, startedAt set,
    /// properties copied, force-yield cleared, EXECUTE_JOB enqueued.
    async fn start_run(
        &self,
        id: RunId,
        properties: Option<Value>,
        skip_retrying: bool,
    ) -> StoreResult<()>;

    /// Cancel a run before any endpoint contact (blocked organisation).
    async fn cancel_run(&self, id: RunId) -> StoreResult<()>;

    /// Open a chunk: promote QUEUED to STARTED (stamping startedAt) and
    /// return the prospective chunk number. The count itself is incremented
    /// inside the accepted outcome's transaction, so deliveries that end in
    /// a queue retry never count a chunk.
    async fn begin_chunk(&self, id: RunId) -> StoreResult<i32>;

    /// Deprecated resume path: a `noop` task goes straight to COMPLETED,
    /// anything else to RUNNING.
    async fn resume_deprecated_task(&self, id: TaskId) -> StoreResult<()>;

    async fn update_endpoint_version(&self, id: EndpointId, version: &str) -> StoreResult<()>;

    /// Idempotent upsert keyed on `(run, recipient, event)`.
    async fn upsert_run_subscription(
        &self,
        run_id: RunId,
        recipient: &str,
        event: SubscriptionEvent,
    ) -> StoreResult<()>;

    /// Terminal SUCCESS: completedAt, output, duration, and a
    /// `DeliverRunSubscriptions` enqueue.
    async fn complete_run(
        &self,
        id: RunId,
        output: Option<Value>,
        duration_ms: i64,
    ) -> StoreResult<()>;

    /// The single non-retryable failure write-path; see [`FailExecution`].
    async fn fail_execution(&self, write: FailExecution) -> StoreResult<()>;

    /// Mark one task ERRORED with the given error as its output.
    async fn record_task_error(&self, id: TaskId, error: Value) -> StoreResult<()>;

    /// Mark one task COMPLETED with the given output and properties.
    async fn complete_task(
        &self,
        id: TaskId,
        output: Option<Value>,
        properties: Option<Value>,
    ) -> StoreResult<()>;

    async fn resume_with_task(&self, write: ResumeTaskWrite) -> StoreResult<()>;

    /// Parent bookkeeping for `RESUME_WITH_PARALLEL_TASK`. This is the sole
    /// accounting event of the chunk; child outcomes ride with zero deltas.
    async fn resume_parallel_parent(
        &self,
        run_id: RunId,
        task_id: TaskId,
        output_properties: Option<Value>,
        duration_ms: i64,
    ) -> StoreResult<()>;

    /// Roll the task's attempt forward and park it WAITING until `retry_at`.
    async fn retry_with_task(&self, write: RetryTaskWrite) -> StoreResult<()>;

    /// Append a yield checkpoint unless the run already holds
    /// `MAX_RUN_YIELDED_EXECUTIONS` keys. Returns false (no writes) when the
    /// ceiling would be exceeded.
    async fn try_append_yield(&self, write: YieldWrite) -> StoreResult<bool>;

    /// Auto-yield bookkeeping: yield append without a ceiling, plus a
    /// checkpoint record.
    async fn record_auto_yield(&self, write: AutoYieldWrite) -> StoreResult<()>;

    /// A timed-out chunk that made forward progress: bank the duration,
    /// retune the endpoint's chunk limit, re-enqueue.
    async fn record_timeout_resume(
        &self,
        id: RunId,
        endpoint_id: EndpointId,
        duration_ms: i64,
        chunk_limit_ms: i64,
        skip_retrying: bool,
    ) -> StoreResult<()>;

    /// Latest task (by createdAt descending) and the current task count.
    async fn latest_task_and_count(&self, id: RunId) -> StoreResult<(Option<Task>, i64)>;

    /// Out-of-band request for the endpoint to yield at its next checkpoint.
    async fn set_force_yield(&self, id: RunId, value: bool) -> StoreResult<()>;

    // Queue surface. Workers claim due jobs, then ack or reschedule. A
    // claim holds a [`JOB_LEASE_SECONDS`] lease; expired leases are swept
    // back into circulation by `reclaim_expired_jobs`.

    async fn enqueue(&self, job: QueueJob, run_at: Option<DateTime<Utc>>) -> StoreResult<()>;

    async fn claim_due_jobs(&self, limit: i64) -> StoreResult<Vec<ClaimedJob>>;

    async fn complete_job(&self, id: Uuid) -> StoreResult<()>;

    async fn retry_job(&self, id: Uuid, run_at: DateTime<Utc>) -> StoreResult<()>;

    /// Clear expired claim leases so messages held by a crashed worker can
    /// be claimed again. Returns how many were reclaimed.
    async fn reclaim_expired_jobs(&self, limit: i64) -> StoreResult<usize>;
}
