//! The EXECUTE_JOB state machine.
//!
//! One call drives one chunk: build the execution body from the loaded
//! aggregate, invoke the endpoint, then map the outcome onto exactly one
//! persisted branch. Retryable failures surface as
//! [`ExecuteError::Retry`] and the queue reschedules the message; every
//! other failure commits through the store and returns normally.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config;
use crate::connections::{CredentialResolver, TaskCompletionService};
use crate::endpoint::{
    CallOutcome, EndpointGateway, ErrorBody, ExecuteRequest, ExecuteResponse, ResponseParts,
    RunIdentity,
};
use crate::failure::{classify_http_failure, ExecuteError, HttpFailure};
use crate::models::{
    ConnectionAuth, RunAggregate, RunId, RunStatus, SubscriptionEvent, TaskId, TaskStatus,
};
use crate::preprocess::{build_preprocess_request, event_envelope};
use crate::store::{
    AutoYieldWrite, CoordinatorStore, FailExecution, FailureReason, QueueJob, ResumeTaskWrite,
    RetryTaskWrite, RunReason, YieldWrite,
};
use crate::task_cache::{prepare_noop_tasks_bloom, prepare_tasks, prepare_tasks_legacy};
use crate::telemetry::{ExecutionEvent, ExecutionEventKind, ExecutionEventSink};
use crate::yield_coordinator::YieldCoordinator;
use crate::{
    MAX_RUN_CHUNK_EXECUTION_LIMIT, MAX_RUN_YIELDED_EXECUTIONS, MIN_RUN_CHUNK_EXECUTION_LIMIT,
    RUN_CHUNK_EXECUTION_BUFFER, TOTAL_CACHED_TASK_BYTE_LIMIT,
};

/// One EXECUTE_JOB delivery from the queue.
#[derive(Debug, Clone)]
pub struct ExecuteJobInput {
    pub run_id: RunId,
    pub is_retry: bool,
    /// Deprecated resume path, still honoured behind a config flag.
    pub resume_task_id: Option<TaskId>,
    /// Delivered-at minus scheduled-at of the message.
    pub drift_ms: i64,
}

/// Whether a handled response finished the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    RunTerminal,
}

pub struct ExecuteDriver {
    store: Arc<dyn CoordinatorStore>,
    gateway: Arc<dyn EndpointGateway>,
    credentials: Arc<dyn CredentialResolver>,
    task_completions: Arc<dyn TaskCompletionService>,
    telemetry: Arc<dyn ExecutionEventSink>,
    yields: Arc<YieldCoordinator>,
    accept_deprecated_resume: bool,
}

impl ExecuteDriver {
    pub fn new(
        store: Arc<dyn CoordinatorStore>,
        gateway: Arc<dyn EndpointGateway>,
        credentials: Arc<dyn CredentialResolver>,
        task_completions: Arc<dyn TaskCompletionService>,
        telemetry: Arc<dyn ExecutionEventSink>,
        yields: Arc<YieldCoordinator>,
        accept_deprecated_resume: bool,
    ) -> Self {
        Self {
            store,
            gateway,
            credentials,
            task_completions,
            telemetry,
            yields,
            accept_deprecated_resume,
        }
    }

    pub async fn execute(&self, input: ExecuteJobInput) -> Result<(), ExecuteError> {
        let Some(aggregate) = self.store.load_run(input.run_id).await? else {
            debug!(run_id = %input.run_id, "execute for unknown run, ignoring");
            return Ok(());
        };

        // Deregistered on every exit path via the guard's Drop.
        let _registration = self.yields.register(input.run_id);

        if aggregate.run.status == RunStatus::Canceled {
            return Ok(());
        }
        if config::organization_blocked(aggregate.run.organization_id) {
            warn!(
                run_id = %input.run_id,
                organization_id = %aggregate.run.organization_id,
                "canceling run for blocked organization"
            );
            self.store.cancel_run(input.run_id).await?;
            return Ok(());
        }

        let chunk_number = self.store.begin_chunk(input.run_id).await?;
        let observed_task_count = aggregate.task_count;
        let skip_retrying = aggregate.skip_retrying();

        let connections = match self.credentials.resolve(&aggregate.connections).await {
            Ok(connections) => connections,
            Err(err) => {
                self.store
                    .fail_execution(FailExecution {
                        reason: FailureReason::ExecuteJob,
                        run_id: input.run_id,
                        status: RunStatus::Failure,
                        output: json!({ "message": err.to_string() }),
                        duration_ms: 0,
                        skip_retrying,
                    })
                    .await?;
                return Ok(());
            }
        };

        if let Some(task_id) = input.resume_task_id {
            if self.accept_deprecated_resume {
                self.store.resume_deprecated_task(task_id).await?;
            } else {
                warn!(task_id = %task_id, "ignoring deprecated resume task field");
            }
        }

        let source = parse_source_context(aggregate.event.source_context.as_ref());
        let body = build_execute_request(&aggregate, connections, source, input.is_retry);

        debug!(
            run_id = %input.run_id,
            chunk_number,
            cached_tasks = body.tasks.len(),
            "executing run chunk"
        );

        self.emit_event(&aggregate, ExecutionEventKind::Start, input.drift_ms)
            .await;
        let call = self.gateway.execute(&aggregate.endpoint, &body).await;
        self.emit_event(&aggregate, ExecutionEventKind::Finish, 0)
            .await;

        let duration_ms = call.duration_ms;
        match call.outcome {
            CallOutcome::NoResponse { error } => Err(ExecuteError::retry_with(json!({
                "message": format!("Could not connect to endpoint: {error}")
            }))),
            CallOutcome::TimedOut { .. } => {
                self.handle_timeout(&aggregate, duration_ms, observed_task_count, skip_retrying)
                    .await
            }
            CallOutcome::Response(parts) => {
                self.apply_header_side_effects(&aggregate, &parts).await?;

                if !parts.is_success() {
                    return self
                        .handle_http_failure(
                            &aggregate,
                            &parts,
                            duration_ms,
                            observed_task_count,
                            skip_retrying,
                        )
                        .await;
                }

                let response = match serde_json::from_str::<ExecuteResponse>(&parts.body) {
                    Ok(response) => response,
                    Err(err) => {
                        self.store
                            .fail_execution(FailExecution {
                                reason: FailureReason::ExecuteJob,
                                run_id: aggregate.run.id,
                                status: RunStatus::Failure,
                                output: json!({
                                    "message": format!("Endpoint returned an invalid body: {err}")
                                }),
                                duration_ms,
                                skip_retrying,
                            })
                            .await?;
                        return Ok(());
                    }
                };

                self.handle_response(&aggregate, response, duration_ms, skip_retrying)
                    .await
                    .map(|_| ())
            }
        }
    }

    /// Dispatch a parsed response. The parallel variant updates the parent
    /// and then feeds each child through the simple dispatcher with zero
    /// duration and count deltas; the first child that finishes the run
    /// short-circuits the rest.
    async fn handle_response(
        &self,
        aggregate: &RunAggregate,
        response: ExecuteResponse,
        duration_ms: i64,
        skip_retrying: bool,
    ) -> Result<Flow, ExecuteError> {
        match response {
            ExecuteResponse::ResumeWithParallelTask { task, child_errors } => {
                self.store
                    .resume_parallel_parent(
                        aggregate.run.id,
                        task.id,
                        task.output_properties.clone(),
                        duration_ms,
                    )
                    .await?;
                for child in child_errors {
                    match child {
                        ExecuteResponse::ResumeWithParallelTask { .. }
                        | ExecuteResponse::Success { .. } => {
                            warn!(
                                run_id = %aggregate.run.id,
                                "ignoring unsupported child response variant"
                            );
                        }
                        other => {
                            let flow = self
                                .handle_simple(aggregate, other, 0, 0, skip_retrying)
                                .await?;
                            if flow == Flow::RunTerminal {
                                return Ok(Flow::RunTerminal);
                            }
                        }
                    }
                }
                Ok(Flow::Continue)
            }
            other => {
                self.handle_simple(aggregate, other, duration_ms, 1, skip_retrying)
                    .await
            }
        }
    }

    async fn handle_simple(
        &self,
        aggregate: &RunAggregate,
        response: ExecuteResponse,
        duration_ms: i64,
        execution_count_delta: i32,
        skip_retrying: bool,
    ) -> Result<Flow, ExecuteError> {
        let run_id = aggregate.run.id;
        match response {
            ExecuteResponse::Success { output } => {
                self.store.complete_run(run_id, output, duration_ms).await?;
                Ok(Flow::RunTerminal)
            }
            ExecuteResponse::Error { error, task } => {
                let output = serde_json::to_value(&error)?;
                if let Some(task) = task {
                    self.store.record_task_error(task.id, output.clone()).await?;
                }
                self.fail(aggregate, RunStatus::Failure, output, duration_ms, skip_retrying)
                    .await?;
                Ok(Flow::RunTerminal)
            }
            ExecuteResponse::InvalidPayload { errors } => {
                self.fail(
                    aggregate,
                    RunStatus::InvalidPayload,
                    errors,
                    duration_ms,
                    skip_retrying,
                )
                .await?;
                Ok(Flow::RunTerminal)
            }
            ExecuteResponse::UnresolvedAuthError { issues } => {
                self.fail(
                    aggregate,
                    RunStatus::UnresolvedAuth,
                    issues,
                    duration_ms,
                    skip_retrying,
                )
                .await?;
                Ok(Flow::RunTerminal)
            }
            ExecuteResponse::Canceled => Ok(Flow::Continue),
            ExecuteResponse::ResumeWithTask { task } => {
                // An operation or callback owns the completion; only plain
                // tasks get a scheduled resume from here.
                let enqueue_resume = task.operation.is_none() && task.callback_url.is_none();
                self.store
                    .resume_with_task(ResumeTaskWrite {
                        run_id,
                        task_id: task.id,
                        duration_ms,
                        execution_count_delta,
                        output_properties: task.output_properties,
                        enqueue_resume,
                        resume_at: task.delay_until,
                    })
                    .await?;
                Ok(Flow::Continue)
            }
            ExecuteResponse::RetryWithTask {
                task,
                retry_at,
                error,
            } => {
                self.store
                    .retry_with_task(RetryTaskWrite {
                        run_id,
                        task_id: task.id,
                        retry_at,
                        error: serde_json::to_value(&error)?,
                        duration_ms,
                        execution_count_delta,
                    })
                    .await?;
                Ok(Flow::Continue)
            }
            ExecuteResponse::YieldExecution { key } => {
                let accepted = self
                    .store
                    .try_append_yield(YieldWrite {
                        run_id,
                        key,
                        duration_ms,
                        execution_count_delta,
                        skip_retrying,
                    })
                    .await?;
                if accepted {
                    Ok(Flow::Continue)
                } else {
                    self.fail(
                        aggregate,
                        RunStatus::Failure,
                        json!({
                            "message": format!(
                                "Run has reached the maximum of {MAX_RUN_YIELDED_EXECUTIONS} yielded executions"
                            )
                        }),
                        duration_ms,
                        skip_retrying,
                    )
                    .await?;
                    Ok(Flow::RunTerminal)
                }
            }
            ExecuteResponse::AutoYieldExecution(checkpoint) => {
                self.store
                    .record_auto_yield(AutoYieldWrite {
                        base: YieldWrite {
                            run_id,
                            key: checkpoint.location,
                            duration_ms,
                            execution_count_delta,
                            skip_retrying,
                        },
                        time_remaining_ms: checkpoint.time_remaining,
                        time_elapsed_ms: checkpoint.time_elapsed,
                        limit_ms: checkpoint.limit.unwrap_or(0),
                        enqueue_execution: true,
                    })
                    .await?;
                Ok(Flow::Continue)
            }
            ExecuteResponse::AutoYieldExecutionWithCompletedTask(envelope) => {
                self.store
                    .record_auto_yield(AutoYieldWrite {
                        base: YieldWrite {
                            run_id,
                            key: envelope.execution.location.clone(),
                            duration_ms,
                            execution_count_delta,
                            skip_retrying,
                        },
                        time_remaining_ms: envelope.execution.time_remaining,
                        time_elapsed_ms: envelope.execution.time_elapsed,
                        limit_ms: envelope.execution.limit.unwrap_or(0),
                        enqueue_execution: false,
                    })
                    .await?;

                let output = envelope.output.as_deref().and_then(|raw| {
                    match serde_json::from_str::<Value>(raw) {
                        Ok(value) => Some(value),
                        Err(err) => {
                            warn!(
                                run_id = %run_id,
                                task_id = %envelope.id,
                                error = %err,
                                "dropping unparseable completed-task output"
                            );
                            None
                        }
                    }
                });
                self.task_completions
                    .complete_task(run_id, envelope.id, envelope.properties, output)
                    .await
                    .map_err(|err| {
                        ExecuteError::retry_with(json!({
                            "message": format!("Failed to complete task {}: {err}", envelope.id)
                        }))
                    })?;

                self.store
                    .enqueue(
                        QueueJob::ExecuteRun {
                            run_id,
                            reason: RunReason::ExecuteJob,
                            resume_task_id: None,
                            skip_retrying,
                        },
                        None,
                    )
                    .await?;
                Ok(Flow::Continue)
            }
            ExecuteResponse::ResumeWithParallelTask { .. } => {
                // Handled one level up; a nested one is not a valid child.
                warn!(run_id = %run_id, "ignoring nested parallel response");
                Ok(Flow::Continue)
            }
        }
    }

    async fn handle_http_failure(
        &self,
        aggregate: &RunAggregate,
        parts: &ResponseParts,
        duration_ms: i64,
        observed_task_count: i64,
        skip_retrying: bool,
    ) -> Result<(), ExecuteError> {
        let error = serde_json::from_str::<ErrorBody>(&parts.body).ok();
        match classify_http_failure(parts.status, error) {
            HttpFailure::Client { error } => {
                self.fail(
                    aggregate,
                    RunStatus::Failure,
                    serde_json::to_value(&error)?,
                    duration_ms,
                    skip_retrying,
                )
                .await?;
                Ok(())
            }
            HttpFailure::ServerWithBody { error } => {
                Err(ExecuteError::retry_with(serde_json::to_value(&error)?))
            }
            HttpFailure::ClientOpaque => {
                self.fail(
                    aggregate,
                    RunStatus::Failure,
                    json!({
                        "message": format!("Endpoint responded with {} status", parts.status)
                    }),
                    duration_ms,
                    skip_retrying,
                )
                .await?;
                Ok(())
            }
            HttpFailure::Timeout => {
                self.handle_timeout(aggregate, duration_ms, observed_task_count, skip_retrying)
                    .await
            }
            HttpFailure::Transport => Err(ExecuteError::retry_with(json!({
                "message": format!("Endpoint responded with {} status", parts.status)
            }))),
        }
    }

    /// A timed-out chunk is fatal only when the run is out of budget or made
    /// no forward progress; otherwise the chunk limit adapts to what the
    /// endpoint survived and the run re-enqueues.
    async fn handle_timeout(
        &self,
        aggregate: &RunAggregate,
        duration_ms: i64,
        observed_task_count: i64,
        skip_retrying: bool,
    ) -> Result<(), ExecuteError> {
        let run = &aggregate.run;
        let max_execution_ms = aggregate.organization.maximum_execution_time_per_run_ms;

        if run.execution_duration_ms + duration_ms >= max_execution_ms {
            self.fail(
                aggregate,
                RunStatus::TimedOut,
                json!({
                    "message": format!(
                        "Run exceeded the maximum execution time of {max_execution_ms}ms"
                    )
                }),
                duration_ms,
                skip_retrying,
            )
            .await?;
            return Ok(());
        }

        let (latest_task, task_count) = self.store.latest_task_and_count(run.id).await?;
        if task_count == observed_task_count {
            let location = match latest_task.filter(|t| t.status == TaskStatus::Running) {
                Some(task) => format!(
                    "task \"{}\"",
                    task.display_key.unwrap_or(task.idempotency_key)
                ),
                None => "code outside of a task".to_string(),
            };
            self.fail(
                aggregate,
                RunStatus::TimedOut,
                json!({
                    "message": format!(
                        "Endpoint timed out after {duration_ms}ms without creating a new task. \
                         The timeout occurred while executing {location}"
                    )
                }),
                duration_ms,
                skip_retrying,
            )
            .await?;
            return Ok(());
        }

        let chunk_limit_ms =
            duration_ms.clamp(MIN_RUN_CHUNK_EXECUTION_LIMIT, MAX_RUN_CHUNK_EXECUTION_LIMIT);
        self.store
            .record_timeout_resume(
                run.id,
                aggregate.endpoint.id,
                duration_ms,
                chunk_limit_ms,
                skip_retrying,
            )
            .await?;
        Ok(())
    }

    async fn apply_header_side_effects(
        &self,
        aggregate: &RunAggregate,
        parts: &ResponseParts,
    ) -> Result<(), ExecuteError> {
        if let Some(version) = &parts.trigger_version {
            if aggregate.endpoint.version.as_deref() != Some(version.as_str()) {
                self.store
                    .update_endpoint_version(aggregate.endpoint.id, version)
                    .await?;
            }
        }

        if let Some(metadata) = &parts.run_metadata {
            if !aggregate.run.internal {
                let recipient = aggregate.endpoint.id.to_string();
                if metadata.success_subscription == Some(true) {
                    self.store
                        .upsert_run_subscription(
                            aggregate.run.id,
                            &recipient,
                            SubscriptionEvent::Success,
                        )
                        .await?;
                }
                if metadata.failed_subscription == Some(true) {
                    self.store
                        .upsert_run_subscription(
                            aggregate.run.id,
                            &recipient,
                            SubscriptionEvent::Failure,
                        )
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn fail(
        &self,
        aggregate: &RunAggregate,
        status: RunStatus,
        output: Value,
        duration_ms: i64,
        skip_retrying: bool,
    ) -> Result<(), ExecuteError> {
        self.store
            .fail_execution(FailExecution {
                reason: FailureReason::ExecuteJob,
                run_id: aggregate.run.id,
                status,
                output,
                duration_ms,
                skip_retrying,
            })
            .await?;
        Ok(())
    }

    /// Telemetry is best-effort and never blocks a chunk.
    async fn emit_event(&self, aggregate: &RunAggregate, kind: ExecutionEventKind, drift_ms: i64) {
        let event = ExecutionEvent {
            kind,
            event_time: chrono::Utc::now(),
            drift_ms,
            organization_id: aggregate.run.organization_id,
            environment_id: aggregate.run.environment_id,
            project_id: aggregate.run.project_id,
            job_id: aggregate.version.job_id,
            run_id: aggregate.run.id,
        };
        if let Err(err) = self.telemetry.create_execution_event(event).await {
            warn!(run_id = %aggregate.run.id, error = %err, "failed to emit execution event");
        }
    }
}

/// Source context is opaque; a JSON string gets one best-effort decode so
/// the endpoint receives structure when there is some.
fn parse_source_context(raw: Option<&Value>) -> Option<Value> {
    match raw {
        None => None,
        Some(Value::String(text)) => match serde_json::from_str::<Value>(text) {
            Ok(parsed) => Some(parsed),
            Err(_) => Some(Value::String(text.clone())),
        },
        Some(other) => Some(other.clone()),
    }
}

fn build_execute_request(
    aggregate: &RunAggregate,
    connections: HashMap<String, ConnectionAuth>,
    source: Option<Value>,
    is_retry: bool,
) -> ExecuteRequest {
    let preprocess_shape = build_preprocess_request(aggregate);
    let endpoint = &aggregate.endpoint;
    let lazy = endpoint.supports_lazy_cached_tasks();

    let (tasks, cursor) = if lazy {
        let prepared = prepare_tasks(&aggregate.completed_tasks, TOTAL_CACHED_TASK_BYTE_LIMIT);
        (prepared.tasks, prepared.cursor)
    } else {
        (prepare_tasks_legacy(&aggregate.completed_tasks), None)
    };

    ExecuteRequest {
        event: event_envelope(aggregate),
        job: preprocess_shape.job,
        run: RunIdentity {
            id: aggregate.run.id,
            is_test: aggregate.run.is_test,
            started_at: aggregate.run.started_at,
            is_retry: Some(is_retry),
        },
        environment: preprocess_shape.environment,
        organization: preprocess_shape.organization,
        account: preprocess_shape.account,
        connections,
        source,
        tasks,
        cached_task_cursor: cursor,
        noop_tasks_set: lazy.then(|| prepare_noop_tasks_bloom(&aggregate.completed_tasks)),
        yielded_executions: lazy.then(|| aggregate.run.yielded_executions.clone()),
        run_chunk_execution_limit: lazy
            .then(|| endpoint.run_chunk_execution_limit_ms - RUN_CHUNK_EXECUTION_BUFFER),
        auto_yield_config: lazy.then_some(endpoint.auto_yield),
        force_yield_immediately: (lazy && aggregate.run.force_yield_immediately).then_some(true),
    }
}
