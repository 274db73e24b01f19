//! Drover - run execution coordinator for a job orchestration platform
//!
//! A *run* is one triggered invocation of a job version. Drover is the
//! server-side control loop that drives each run forward by repeatedly
//! invoking the user's HTTP endpoint, interpreting its response, persisting
//! progress, and re-enqueueing the run until it reaches a terminal state.
//! The key components are:
//!
//! ## Drivers
//!
//! - [`PreprocessDriver`]: the one-shot PREPROCESS step before a run starts
//! - [`ExecuteDriver`]: the per-chunk EXECUTE_JOB state machine
//! - [`QueueWorker`]: polling loop that claims queue jobs and dispatches them
//!
//! ## Infrastructure
//!
//! - [`store`]: transactional store trait with memory and Postgres backends,
//!   including the durable job queue (SKIP LOCKED claims)
//! - [`endpoint`]: wire types and reqwest gateway for user endpoints
//! - [`YieldCoordinator`]: process-wide mid-flight registry and force-yield
//! - [`task_cache`]: cached-task packing and the no-op Bloom filter

pub mod config;
pub mod connections;
pub mod endpoint;
pub mod execute;
pub mod failure;
pub mod models;
pub mod preprocess;
pub mod store;
pub mod task_cache;
pub mod telemetry;
pub mod test_support;
pub mod worker;
pub mod yield_coordinator;

// Configuration
pub use config::{organization_blocked, Config};

// Drivers
pub use execute::{ExecuteDriver, ExecuteJobInput};
pub use preprocess::PreprocessDriver;
pub use worker::{LoggingNotifier, QueueWorker, SubscriptionNotifier, WorkerConfig};

// Store
pub use store::{
    CoordinatorStore, MemoryStore, PostgresStore, QueueJob, RunReason, StoreError, StoreResult,
};

// Endpoint protocol
pub use endpoint::{EndpointGateway, ExecuteResponse, HttpEndpointGateway};

// Failure policy
pub use failure::{ExecuteError, RetryBackoff};

// Task caching
pub use task_cache::{prepare_noop_tasks_bloom, prepare_tasks, BloomFilter, PreparedTasks};

// Yield coordination
pub use yield_coordinator::{RunRegistration, YieldCoordinator};

/// Floor of the adaptive per-chunk execution limit, in milliseconds.
pub const MIN_RUN_CHUNK_EXECUTION_LIMIT: i64 = 10_000;

/// Ceiling of the adaptive per-chunk execution limit, in milliseconds.
pub const MAX_RUN_CHUNK_EXECUTION_LIMIT: i64 = 120_000;

/// Subtracted from the chunk limit sent to the endpoint so it can yield
/// before the platform-side timer fires.
pub const RUN_CHUNK_EXECUTION_BUFFER: i64 = 2_500;

/// Hard cap on endpoint-requested yields per run.
pub const MAX_RUN_YIELDED_EXECUTIONS: usize = 100;

/// Serialised byte budget for cached tasks embedded in an execute body.
pub const TOTAL_CACHED_TASK_BYTE_LIMIT: usize = 3_500_000;

/// Capacity of the no-op task Bloom filter.
pub const NOOP_TASK_SET_SIZE: usize = 500;

/// First endpoint version that understands the lazy cached-task fields.
pub const LAZY_LOADED_CACHED_TASKS_VERSION: &str = "2023-09-29";
