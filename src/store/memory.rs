//! In-memory store for tests and local runs.
//!
//! A single mutex stands in for the transactional boundary: every trait
//! method takes the lock once, so each branch outcome is observed atomically
//! exactly as the Postgres backend commits it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::{
    AutoYieldWrite, ClaimedJob, CoordinatorStore, FailExecution, FailureReason, QueueJob,
    ResumeTaskWrite, RetryTaskWrite, RunReason, StoreError, StoreResult, YieldWrite,
    JOB_LEASE_SECONDS,
};
use crate::models::{
    AutoYieldExecution, Endpoint, EndpointId, Environment, Event, ExternalAccount, JobVersion,
    Organization, Project, Run, RunAggregate, RunConnection, RunId, RunStatus, RunSubscription,
    SubscriptionEvent, Task, TaskAttempt, TaskAttemptStatus, TaskId, TaskStatus,
};
use crate::MAX_RUN_YIELDED_EXECUTIONS;

#[derive(Debug, Clone)]
struct StoredJob {
    id: Uuid,
    job: QueueJob,
    scheduled_at: DateTime<Utc>,
    attempts: i32,
    claimed: bool,
    lock_expires_at: Option<DateTime<Utc>>,
    done: bool,
}

#[derive(Default)]
struct State {
    runs: HashMap<RunId, Run>,
    tasks: HashMap<TaskId, Task>,
    attempts: Vec<TaskAttempt>,
    endpoints: HashMap<EndpointId, Endpoint>,
    organizations: HashMap<Uuid, Organization>,
    environments: HashMap<Uuid, Environment>,
    projects: HashMap<Uuid, Project>,
    events: HashMap<Uuid, Event>,
    versions: HashMap<Uuid, JobVersion>,
    external_accounts: HashMap<Uuid, ExternalAccount>,
    connections: HashMap<RunId, Vec<RunConnection>>,
    subscriptions: Vec<RunSubscription>,
    auto_yields: Vec<AutoYieldExecution>,
    jobs: Vec<StoredJob>,
}

/// Store backend that keeps everything behind one mutex.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("memory store poisoned")
    }

    // Seeding helpers for tests and local harnesses.

    pub fn insert_run(&self, run: Run) {
        self.lock().runs.insert(run.id, run);
    }

    pub fn insert_task(&self, task: Task) {
        self.lock().tasks.insert(task.id, task);
    }

    pub fn insert_endpoint(&self, endpoint: Endpoint) {
        self.lock().endpoints.insert(endpoint.id, endpoint);
    }

    pub fn insert_organization(&self, organization: Organization) {
        self.lock()
            .organizations
            .insert(organization.id.0, organization);
    }

    pub fn insert_environment(&self, environment: Environment) {
        self.lock().environments.insert(environment.id.0, environment);
    }

    pub fn insert_project(&self, project: Project) {
        self.lock().projects.insert(project.id.0, project);
    }

    pub fn insert_event(&self, event: Event) {
        self.lock().events.insert(event.id.0, event);
    }

    pub fn insert_version(&self, version: JobVersion) {
        self.lock().versions.insert(version.id.0, version);
    }

    pub fn insert_external_account(&self, account: ExternalAccount) {
        self.lock().external_accounts.insert(account.id, account);
    }

    pub fn insert_attempt(&self, attempt: TaskAttempt) {
        self.lock().attempts.push(attempt);
    }

    pub fn insert_connection(&self, run_id: RunId, connection: RunConnection) {
        self.lock()
            .connections
            .entry(run_id)
            .or_default()
            .push(connection);
    }

    // Inspection accessors.

    pub fn run(&self, id: RunId) -> Option<Run> {
        self.lock().runs.get(&id).cloned()
    }

    pub fn task(&self, id: TaskId) -> Option<Task> {
        self.lock().tasks.get(&id).cloned()
    }

    pub fn endpoint(&self, id: EndpointId) -> Option<Endpoint> {
        self.lock().endpoints.get(&id).cloned()
    }

    pub fn attempts_for(&self, id: TaskId) -> Vec<TaskAttempt> {
        let mut attempts: Vec<TaskAttempt> = self
            .lock()
            .attempts
            .iter()
            .filter(|a| a.task_id == id)
            .cloned()
            .collect();
        attempts.sort_by_key(|a| a.number);
        attempts
    }

    pub fn auto_yields_for(&self, id: RunId) -> Vec<AutoYieldExecution> {
        self.lock()
            .auto_yields
            .iter()
            .filter(|y| y.run_id == id)
            .cloned()
            .collect()
    }

    pub fn subscriptions_for(&self, id: RunId) -> Vec<RunSubscription> {
        self.lock()
            .subscriptions
            .iter()
            .filter(|s| s.run_id == id)
            .cloned()
            .collect()
    }

    /// Every job ever enqueued, in order, regardless of delivery state.
    pub fn enqueued(&self) -> Vec<QueueJob> {
        self.lock().jobs.iter().map(|j| j.job.clone()).collect()
    }

    /// Backdate every outstanding claim lease, standing in for a worker
    /// that died mid-delivery.
    pub fn expire_job_leases(&self) {
        let expired = Utc::now() - chrono::Duration::seconds(1);
        for job in self.lock().jobs.iter_mut() {
            if job.claimed && !job.done {
                job.lock_expires_at = Some(expired);
            }
        }
    }
}

fn missing_run(id: RunId) -> StoreError {
    StoreError::Message(format!("run {id} not found"))
}

fn missing_task(id: TaskId) -> StoreError {
    StoreError::Message(format!("task {id} not found"))
}

fn push_job(state: &mut State, job: QueueJob, run_at: Option<DateTime<Utc>>) {
    state.jobs.push(StoredJob {
        id: Uuid::new_v4(),
        job,
        scheduled_at: run_at.unwrap_or_else(Utc::now),
        attempts: 0,
        claimed: false,
        lock_expires_at: None,
        done: false,
    });
}

fn enqueue_execution(state: &mut State, run_id: RunId, skip_retrying: bool) {
    push_job(
        state,
        QueueJob::ExecuteRun {
            run_id,
            reason: RunReason::ExecuteJob,
            resume_task_id: None,
            skip_retrying,
        },
        None,
    );
}

#[async_trait]
impl CoordinatorStore for MemoryStore {
    async fn load_run(&self, id: RunId) -> StoreResult<Option<RunAggregate>> {
        let state = self.lock();
        let Some(run) = state.runs.get(&id).cloned() else {
            return Ok(None);
        };

        let environment = state
            .environments
            .get(&run.environment_id.0)
            .cloned()
            .ok_or_else(|| StoreError::Message(format!("environment for run {id} missing")))?;
        let endpoint = state
            .endpoints
            .get(&run.endpoint_id)
            .cloned()
            .ok_or_else(|| StoreError::Message(format!("endpoint for run {id} missing")))?;
        let organization = state
            .organizations
            .get(&run.organization_id.0)
            .cloned()
            .ok_or_else(|| StoreError::Message(format!("organization for run {id} missing")))?;
        let project = state
            .projects
            .get(&run.project_id.0)
            .cloned()
            .ok_or_else(|| StoreError::Message(format!("project for run {id} missing")))?;
        let event = state
            .events
            .get(&run.event_id.0)
            .cloned()
            .ok_or_else(|| StoreError::Message(format!("event for run {id} missing")))?;
        let version = state
            .versions
            .get(&run.version_id.0)
            .cloned()
            .ok_or_else(|| StoreError::Message(format!("version for run {id} missing")))?;
        let external_account = run
            .external_account_id
            .and_then(|account_id| state.external_accounts.get(&account_id).cloned());

        let mut completed_tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| t.run_id == id && t.status == TaskStatus::Completed)
            .cloned()
            .collect();
        completed_tasks.sort_by_key(|t| t.id.0);

        let task_count = state.tasks.values().filter(|t| t.run_id == id).count() as i64;

        let subscriptions = state
            .subscriptions
            .iter()
            .filter(|s| s.run_id == id)
            .cloned()
            .collect();

        Ok(Some(RunAggregate {
            connections: state.connections.get(&id).cloned().unwrap_or_default(),
            run,
            environment,
            endpoint,
            organization,
            project,
            external_account,
            event,
            version,
            completed_tasks,
            subscriptions,
            task_count,
        }))
    }

    async fn start_run(
        &self,
        id: RunId,
        properties: Option<Value>,
        skip_retrying: bool,
    ) -> StoreResult<()> {
        let mut state = self.lock();
        let run = state.runs.get_mut(&id).ok_or_else(|| missing_run(id))?;
        if run.completed_at.is_some() {
            return Ok(());
        }
        run.status = RunStatus::Started;
        run.started_at = Some(Utc::now());
        if properties.is_some() {
            run.properties = properties;
        }
        run.force_yield_immediately = false;
        enqueue_execution(&mut state, id, skip_retrying);
        Ok(())
    }

    async fn cancel_run(&self, id: RunId) -> StoreResult<()> {
        let mut state = self.lock();
        let run = state.runs.get_mut(&id).ok_or_else(|| missing_run(id))?;
        if run.completed_at.is_some() {
            return Ok(());
        }
        run.status = RunStatus::Canceled;
        run.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn begin_chunk(&self, id: RunId) -> StoreResult<i32> {
        let mut state = self.lock();
        let run = state.runs.get_mut(&id).ok_or_else(|| missing_run(id))?;
        if run.status == RunStatus::Queued {
            run.status = RunStatus::Started;
            if run.started_at.is_none() {
                run.started_at = Some(Utc::now());
            }
        }
        Ok(run.execution_count + 1)
    }

    async fn resume_deprecated_task(&self, id: TaskId) -> StoreResult<()> {
        let mut state = self.lock();
        let task = state.tasks.get_mut(&id).ok_or_else(|| missing_task(id))?;
        if task.noop {
            task.status = TaskStatus::Completed;
            task.completed_at = Some(Utc::now());
        } else {
            task.status = TaskStatus::Running;
        }
        Ok(())
    }

    async fn update_endpoint_version(&self, id: EndpointId, version: &str) -> StoreResult<()> {
        let mut state = self.lock();
        if let Some(endpoint) = state.endpoints.get_mut(&id) {
            endpoint.version = Some(version.to_string());
        }
        Ok(())
    }

    async fn upsert_run_subscription(
        &self,
        run_id: RunId,
        recipient: &str,
        event: SubscriptionEvent,
    ) -> StoreResult<()> {
        let mut state = self.lock();
        let exists = state
            .subscriptions
            .iter()
            .any(|s| s.run_id == run_id && s.recipient == recipient && s.event == event);
        if !exists {
            state.subscriptions.push(RunSubscription {
                id: Uuid::new_v4(),
                run_id,
                recipient: recipient.to_string(),
                event,
                active: true,
            });
        }
        Ok(())
    }

    async fn complete_run(
        &self,
        id: RunId,
        output: Option<Value>,
        duration_ms: i64,
    ) -> StoreResult<()> {
        let mut state = self.lock();
        let run = state.runs.get_mut(&id).ok_or_else(|| missing_run(id))?;
        if run.completed_at.is_some() {
            return Ok(());
        }
        run.status = RunStatus::Success;
        run.completed_at = Some(Utc::now());
        run.output = output;
        run.execution_duration_ms += duration_ms;
        run.execution_count += 1;
        push_job(&mut state, QueueJob::DeliverRunSubscriptions { run_id: id }, None);
        Ok(())
    }

    async fn fail_execution(&self, write: FailExecution) -> StoreResult<()> {
        let mut state = self.lock();
        let run = state
            .runs
            .get_mut(&write.run_id)
            .ok_or_else(|| missing_run(write.run_id))?;
        if run.completed_at.is_some() {
            return Ok(());
        }
        let now = Utc::now();
        match write.reason {
            FailureReason::ExecuteJob => {
                run.status = write.status;
                run.completed_at = Some(now);
                run.output = Some(write.output);
                run.execution_duration_ms += write.duration_ms;
                run.force_yield_immediately = false;

                let swept = if write.status == RunStatus::TimedOut {
                    TaskStatus::Canceled
                } else {
                    TaskStatus::Errored
                };
                for task in state.tasks.values_mut() {
                    if task.run_id == write.run_id && task.status.is_open() {
                        task.status = swept;
                        task.completed_at = Some(now);
                    }
                }
                push_job(
                    &mut state,
                    QueueJob::DeliverRunSubscriptions { run_id: write.run_id },
                    None,
                );
            }
            FailureReason::Preprocess => {
                if write.status == RunStatus::Aborted {
                    run.status = RunStatus::Aborted;
                    run.completed_at = Some(now);
                    run.output = Some(write.output);
                } else {
                    run.status = RunStatus::Started;
                    run.started_at = Some(now);
                    enqueue_execution(&mut state, write.run_id, write.skip_retrying);
                }
            }
        }
        Ok(())
    }

    async fn record_task_error(&self, id: TaskId, error: Value) -> StoreResult<()> {
        let mut state = self.lock();
        let task = state.tasks.get_mut(&id).ok_or_else(|| missing_task(id))?;
        task.status = TaskStatus::Errored;
        task.completed_at = Some(Utc::now());
        task.output = Some(error);
        Ok(())
    }

    async fn complete_task(
        &self,
        id: TaskId,
        output: Option<Value>,
        properties: Option<Value>,
    ) -> StoreResult<()> {
        let mut state = self.lock();
        let task = state.tasks.get_mut(&id).ok_or_else(|| missing_task(id))?;
        task.status = TaskStatus::Completed;
        task.completed_at = Some(Utc::now());
        if output.is_some() {
            task.output = output;
        }
        if properties.is_some() {
            task.output_properties = properties;
        }
        Ok(())
    }

    async fn resume_with_task(&self, write: ResumeTaskWrite) -> StoreResult<()> {
        let mut state = self.lock();
        let run = state
            .runs
            .get_mut(&write.run_id)
            .ok_or_else(|| missing_run(write.run_id))?;
        if run.completed_at.is_some() {
            return Ok(());
        }
        run.execution_duration_ms += write.duration_ms;
        run.execution_count += write.execution_count_delta;
        if let Some(properties) = write.output_properties {
            if let Some(task) = state.tasks.get_mut(&write.task_id) {
                task.output_properties = Some(properties);
            }
        }
        if write.enqueue_resume {
            push_job(
                &mut state,
                QueueJob::ResumeTask {
                    run_id: write.run_id,
                    task_id: write.task_id,
                },
                write.resume_at,
            );
        }
        Ok(())
    }

    async fn resume_parallel_parent(
        &self,
        run_id: RunId,
        task_id: TaskId,
        output_properties: Option<Value>,
        duration_ms: i64,
    ) -> StoreResult<()> {
        let mut state = self.lock();
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| missing_run(run_id))?;
        if run.completed_at.is_some() {
            return Ok(());
        }
        run.execution_duration_ms += duration_ms;
        run.execution_count += 1;
        run.force_yield_immediately = false;
        if output_properties.is_some() {
            if let Some(task) = state.tasks.get_mut(&task_id) {
                task.output_properties = output_properties;
            }
        }
        Ok(())
    }

    async fn retry_with_task(&self, write: RetryTaskWrite) -> StoreResult<()> {
        let mut state = self.lock();
        let run = state
            .runs
            .get_mut(&write.run_id)
            .ok_or_else(|| missing_run(write.run_id))?;
        if run.completed_at.is_some() {
            return Ok(());
        }
        run.execution_duration_ms += write.duration_ms;
        run.execution_count += write.execution_count_delta;

        let last_number = state
            .attempts
            .iter()
            .filter(|a| a.task_id == write.task_id)
            .map(|a| a.number)
            .max();
        if let Some(latest_pending) = state
            .attempts
            .iter_mut()
            .filter(|a| a.task_id == write.task_id && a.status == TaskAttemptStatus::Pending)
            .max_by_key(|a| a.number)
        {
            latest_pending.status = TaskAttemptStatus::Errored;
            latest_pending.error = Some(write.error.clone());
        }
        state.attempts.push(TaskAttempt {
            task_id: write.task_id,
            number: last_number.unwrap_or(0) + 1,
            status: TaskAttemptStatus::Pending,
            run_at: Some(write.retry_at),
            error: None,
        });

        let task = state
            .tasks
            .get_mut(&write.task_id)
            .ok_or_else(|| missing_task(write.task_id))?;
        task.status = TaskStatus::Waiting;

        push_job(
            &mut state,
            QueueJob::ResumeTask {
                run_id: write.run_id,
                task_id: write.task_id,
            },
            Some(write.retry_at),
        );
        Ok(())
    }

    async fn try_append_yield(&self, write: YieldWrite) -> StoreResult<bool> {
        let mut state = self.lock();
        let run = state
            .runs
            .get_mut(&write.run_id)
            .ok_or_else(|| missing_run(write.run_id))?;
        if run.completed_at.is_some() {
            return Ok(true);
        }
        if run.yielded_executions.len() + 1 > MAX_RUN_YIELDED_EXECUTIONS {
            return Ok(false);
        }
        run.yielded_executions.push(write.key);
        run.execution_duration_ms += write.duration_ms;
        run.execution_count += write.execution_count_delta;
        run.force_yield_immediately = false;
        enqueue_execution(&mut state, write.run_id, write.skip_retrying);
        Ok(true)
    }

    async fn record_auto_yield(&self, write: AutoYieldWrite) -> StoreResult<()> {
        let mut state = self.lock();
        let run = state
            .runs
            .get_mut(&write.base.run_id)
            .ok_or_else(|| missing_run(write.base.run_id))?;
        if run.completed_at.is_some() {
            return Ok(());
        }
        run.yielded_executions.push(write.base.key.clone());
        run.execution_duration_ms += write.base.duration_ms;
        run.execution_count += write.base.execution_count_delta;
        run.force_yield_immediately = false;
        state.auto_yields.push(AutoYieldExecution {
            id: Uuid::new_v4(),
            run_id: write.base.run_id,
            location: write.base.key,
            time_remaining_ms: write.time_remaining_ms,
            time_elapsed_ms: write.time_elapsed_ms,
            limit_ms: write.limit_ms,
        });
        if write.enqueue_execution {
            enqueue_execution(&mut state, write.base.run_id, write.base.skip_retrying);
        }
        Ok(())
    }

    async fn record_timeout_resume(
        &self,
        id: RunId,
        endpoint_id: EndpointId,
        duration_ms: i64,
        chunk_limit_ms: i64,
        skip_retrying: bool,
    ) -> StoreResult<()> {
        let mut state = self.lock();
        let run = state.runs.get_mut(&id).ok_or_else(|| missing_run(id))?;
        if run.completed_at.is_some() {
            return Ok(());
        }
        run.execution_duration_ms += duration_ms;
        run.execution_count += 1;
        run.force_yield_immediately = false;
        if let Some(endpoint) = state.endpoints.get_mut(&endpoint_id) {
            endpoint.run_chunk_execution_limit_ms = chunk_limit_ms;
        }
        enqueue_execution(&mut state, id, skip_retrying);
        Ok(())
    }

    async fn latest_task_and_count(&self, id: RunId) -> StoreResult<(Option<Task>, i64)> {
        let state = self.lock();
        let mut tasks: Vec<&Task> = state.tasks.values().filter(|t| t.run_id == id).collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let count = tasks.len() as i64;
        Ok((tasks.first().map(|t| (*t).clone()), count))
    }

    async fn set_force_yield(&self, id: RunId, value: bool) -> StoreResult<()> {
        let mut state = self.lock();
        let run = state.runs.get_mut(&id).ok_or_else(|| missing_run(id))?;
        if run.completed_at.is_none() {
            run.force_yield_immediately = value;
        }
        Ok(())
    }

    async fn enqueue(&self, job: QueueJob, run_at: Option<DateTime<Utc>>) -> StoreResult<()> {
        push_job(&mut self.lock(), job, run_at);
        Ok(())
    }

    async fn claim_due_jobs(&self, limit: i64) -> StoreResult<Vec<ClaimedJob>> {
        let mut state = self.lock();
        let now = Utc::now();
        let mut claimed = Vec::new();
        for stored in state.jobs.iter_mut() {
            if claimed.len() as i64 >= limit {
                break;
            }
            if !stored.done && !stored.claimed && stored.scheduled_at <= now {
                stored.claimed = true;
                stored.lock_expires_at = Some(now + chrono::Duration::seconds(JOB_LEASE_SECONDS));
                claimed.push(ClaimedJob {
                    id: stored.id,
                    job: stored.job.clone(),
                    scheduled_at: stored.scheduled_at,
                    attempts: stored.attempts,
                });
            }
        }
        Ok(claimed)
    }

    async fn complete_job(&self, id: Uuid) -> StoreResult<()> {
        let mut state = self.lock();
        if let Some(stored) = state.jobs.iter_mut().find(|j| j.id == id) {
            stored.done = true;
        }
        Ok(())
    }

    async fn retry_job(&self, id: Uuid, run_at: DateTime<Utc>) -> StoreResult<()> {
        let mut state = self.lock();
        if let Some(stored) = state.jobs.iter_mut().find(|j| j.id == id) {
            stored.claimed = false;
            stored.lock_expires_at = None;
            stored.attempts += 1;
            stored.scheduled_at = run_at;
        }
        Ok(())
    }

    async fn reclaim_expired_jobs(&self, limit: i64) -> StoreResult<usize> {
        let mut state = self.lock();
        let now = Utc::now();
        let mut reclaimed = 0usize;
        for stored in state.jobs.iter_mut() {
            if reclaimed as i64 >= limit {
                break;
            }
            let expired = stored
                .lock_expires_at
                .map(|expires| expires <= now)
                .unwrap_or(false);
            if stored.claimed && !stored.done && expired {
                stored.claimed = false;
                stored.lock_expires_at = None;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }
}
