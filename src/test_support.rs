//! Shared fixtures for unit and integration tests.
//!
//! The scripted gateway stands in for a user endpoint: tests queue up
//! outcomes and assert on the request bodies the drivers built.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::connections::{StoreTaskCompletionService, StoredCredentialResolver};
use crate::endpoint::{
    CallOutcome, EndpointCall, EndpointGateway, ExecuteRequest, PreprocessRequest, ResponseParts,
    RunMetadata,
};
use crate::execute::ExecuteDriver;
use crate::models::{
    AutoYieldConfig, Endpoint, EndpointId, Environment, EnvironmentId, EnvironmentType, Event,
    EventId, JobId, JobVersion, JobVersionId, Organization, OrganizationId, Project, ProjectId,
    Run, RunAggregate, RunId, RunStatus, Task, TaskId, TaskStatus,
};
use crate::preprocess::PreprocessDriver;
use crate::store::MemoryStore;
use crate::telemetry::RecordingEventSink;
use crate::yield_coordinator::YieldCoordinator;

pub fn sample_run() -> Run {
    Run {
        id: RunId::new(),
        status: RunStatus::Queued,
        started_at: None,
        completed_at: None,
        execution_count: 0,
        execution_duration_ms: 0,
        yielded_executions: Vec::new(),
        output: None,
        properties: None,
        force_yield_immediately: false,
        is_test: false,
        internal: false,
        environment_id: EnvironmentId::new(),
        endpoint_id: EndpointId::new(),
        organization_id: OrganizationId::new(),
        project_id: ProjectId::new(),
        event_id: EventId::new(),
        version_id: JobVersionId::new(),
        external_account_id: None,
    }
}

pub fn sample_aggregate() -> RunAggregate {
    let run = sample_run();
    RunAggregate {
        environment: Environment {
            id: run.environment_id,
            slug: "prod".into(),
            env_type: EnvironmentType::Production,
        },
        endpoint: Endpoint {
            id: run.endpoint_id,
            url: "https://example.test/api/trigger".into(),
            api_key: "tr_dev_123".into(),
            version: Some(crate::LAZY_LOADED_CACHED_TASKS_VERSION.into()),
            run_chunk_execution_limit_ms: 60_000,
            auto_yield: AutoYieldConfig {
                start_threshold_ms: 750,
                before_execute_threshold_ms: 750,
                before_complete_threshold_ms: 750,
                after_complete_threshold_ms: 750,
            },
        },
        organization: Organization {
            id: run.organization_id,
            slug: "acme".into(),
            maximum_execution_time_per_run_ms: 900_000,
        },
        project: Project {
            id: run.project_id,
            slug: "pipelines".into(),
        },
        external_account: None,
        event: Event {
            id: run.event_id,
            name: "order.created".into(),
            payload: serde_json::json!({"orderId": 42}),
            context: serde_json::json!({}),
            source_context: None,
            timestamp: Utc::now(),
        },
        version: JobVersion {
            id: run.version_id,
            version: "1.0.0".into(),
            job_id: JobId::new(),
            job_slug: "process-order".into(),
        },
        connections: Vec::new(),
        completed_tasks: Vec::new(),
        subscriptions: Vec::new(),
        task_count: 0,
        run,
    }
}

/// Insert the aggregate's rows into the memory store.
pub fn seed_aggregate(store: &MemoryStore, aggregate: &RunAggregate) {
    store.insert_environment(aggregate.environment.clone());
    store.insert_endpoint(aggregate.endpoint.clone());
    store.insert_organization(aggregate.organization.clone());
    store.insert_project(aggregate.project.clone());
    store.insert_event(aggregate.event.clone());
    store.insert_version(aggregate.version.clone());
    if let Some(account) = &aggregate.external_account {
        store.insert_external_account(account.clone());
    }
    store.insert_run(aggregate.run.clone());
    for task in &aggregate.completed_tasks {
        store.insert_task(task.clone());
    }
    for connection in &aggregate.connections {
        store.insert_connection(aggregate.run.id, connection.clone());
    }
}

pub fn sample_task(run_id: RunId, key: &str, status: TaskStatus) -> Task {
    Task {
        id: TaskId::new(),
        run_id,
        idempotency_key: key.to_string(),
        display_key: None,
        status,
        noop: false,
        output: None,
        output_is_undefined: false,
        output_properties: None,
        parent_id: None,
        created_at: Utc::now(),
        completed_at: matches!(status, TaskStatus::Completed).then(Utc::now),
    }
}

/// Build a 2xx response call with the given JSON body.
pub fn response_call(status: u16, body: Value, duration_ms: i64) -> EndpointCall {
    EndpointCall {
        outcome: CallOutcome::Response(ResponseParts {
            status,
            body: body.to_string(),
            trigger_version: None,
            run_metadata: None,
        }),
        duration_ms,
    }
}

pub fn response_call_with_headers(
    status: u16,
    body: Value,
    duration_ms: i64,
    trigger_version: Option<&str>,
    run_metadata: Option<RunMetadata>,
) -> EndpointCall {
    EndpointCall {
        outcome: CallOutcome::Response(ResponseParts {
            status,
            body: body.to_string(),
            trigger_version: trigger_version.map(|v| v.to_string()),
            run_metadata,
        }),
        duration_ms,
    }
}

pub fn timeout_call(duration_ms: i64) -> EndpointCall {
    EndpointCall {
        outcome: CallOutcome::TimedOut {
            error: "operation timed out".into(),
        },
        duration_ms,
    }
}

pub fn no_response_call() -> EndpointCall {
    EndpointCall {
        outcome: CallOutcome::NoResponse {
            error: "connection refused".into(),
        },
        duration_ms: 0,
    }
}

/// Gateway that replays scripted calls and records every request body.
#[derive(Default)]
pub struct ScriptedGateway {
    execute_script: Mutex<VecDeque<EndpointCall>>,
    preprocess_script: Mutex<VecDeque<EndpointCall>>,
    execute_requests: Mutex<Vec<ExecuteRequest>>,
    preprocess_requests: Mutex<Vec<PreprocessRequest>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_execute(&self, call: EndpointCall) {
        self.execute_script
            .lock()
            .expect("gateway script poisoned")
            .push_back(call);
    }

    pub fn script_preprocess(&self, call: EndpointCall) {
        self.preprocess_script
            .lock()
            .expect("gateway script poisoned")
            .push_back(call);
    }

    pub fn execute_requests(&self) -> Vec<ExecuteRequest> {
        self.execute_requests
            .lock()
            .expect("gateway requests poisoned")
            .clone()
    }

    pub fn preprocess_requests(&self) -> Vec<PreprocessRequest> {
        self.preprocess_requests
            .lock()
            .expect("gateway requests poisoned")
            .clone()
    }
}

#[async_trait]
impl EndpointGateway for ScriptedGateway {
    async fn preprocess(&self, _endpoint: &Endpoint, body: &PreprocessRequest) -> EndpointCall {
        self.preprocess_requests
            .lock()
            .expect("gateway requests poisoned")
            .push(body.clone());
        self.preprocess_script
            .lock()
            .expect("gateway script poisoned")
            .pop_front()
            .unwrap_or_else(no_response_call)
    }

    async fn execute(&self, _endpoint: &Endpoint, body: &ExecuteRequest) -> EndpointCall {
        self.execute_requests
            .lock()
            .expect("gateway requests poisoned")
            .push(body.clone());
        self.execute_script
            .lock()
            .expect("gateway script poisoned")
            .pop_front()
            .unwrap_or_else(no_response_call)
    }
}

/// Fully wired drivers over a memory store and scripted gateway.
pub struct TestHarness {
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<ScriptedGateway>,
    pub telemetry: Arc<RecordingEventSink>,
    pub yields: Arc<YieldCoordinator>,
    pub execute: ExecuteDriver,
    pub preprocess: PreprocessDriver,
}

pub fn harness() -> TestHarness {
    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(ScriptedGateway::new());
    let telemetry = Arc::new(RecordingEventSink::new());
    let yields = Arc::new(YieldCoordinator::new(store.clone()));
    let execute = ExecuteDriver::new(
        store.clone(),
        gateway.clone(),
        Arc::new(StoredCredentialResolver),
        Arc::new(StoreTaskCompletionService::new(store.clone())),
        telemetry.clone(),
        yields.clone(),
        true,
    );
    let preprocess = PreprocessDriver::new(store.clone(), gateway.clone());
    TestHarness {
        store,
        gateway,
        telemetry,
        yields,
        execute,
        preprocess,
    }
}

/// Convenience: run id generator for tests that only need uniqueness.
pub fn unique_id() -> Uuid {
    Uuid::new_v4()
}
