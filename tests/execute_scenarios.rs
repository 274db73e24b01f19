//! End-to-end scenarios for the execute state machine, run against the
//! memory store with a scripted endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::json;

use drover::endpoint::{
    EndpointCall, EndpointGateway, ExecuteRequest, PreprocessRequest, RunMetadata,
};
use drover::models::{
    Endpoint, RunStatus, SubscriptionEvent, TaskAttempt, TaskAttemptStatus, TaskStatus,
};
use drover::store::{MemoryStore, QueueJob, RunReason};
use drover::telemetry::ExecutionEventKind;
use drover::test_support::{
    harness, response_call, response_call_with_headers, sample_aggregate, sample_task,
    seed_aggregate, timeout_call, TestHarness,
};
use drover::{ExecuteError, ExecuteJobInput, MAX_RUN_YIELDED_EXECUTIONS};

fn input(harness_aggregate_run_id: drover::models::RunId) -> ExecuteJobInput {
    ExecuteJobInput {
        run_id: harness_aggregate_run_id,
        is_retry: false,
        resume_task_id: None,
        drift_ms: 0,
    }
}

fn execute_run_jobs(store: &MemoryStore) -> Vec<QueueJob> {
    store
        .enqueued()
        .into_iter()
        .filter(|job| matches!(job, QueueJob::ExecuteRun { reason: RunReason::ExecuteJob, .. }))
        .collect()
}

#[tokio::test]
async fn happy_path_success() {
    let h = harness();
    let aggregate = sample_aggregate();
    seed_aggregate(&h.store, &aggregate);
    h.gateway.script_execute(response_call(
        200,
        json!({"status": "SUCCESS", "output": {"ok": true}}),
        300,
    ));

    let mut job = input(aggregate.run.id);
    job.drift_ms = 12;
    h.execute.execute(job).await.expect("execute");

    let run = h.store.run(aggregate.run.id).expect("run");
    assert_eq!(run.status, RunStatus::Success);
    assert!(run.completed_at.is_some());
    assert_eq!(run.execution_count, 1);
    assert_eq!(run.output, Some(json!({"ok": true})));
    assert_eq!(run.execution_duration_ms, 300);

    let delivers: Vec<_> = h
        .store
        .enqueued()
        .into_iter()
        .filter(|job| matches!(job, QueueJob::DeliverRunSubscriptions { .. }))
        .collect();
    assert_eq!(delivers.len(), 1);

    let events = h.telemetry.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, ExecutionEventKind::Start);
    assert_eq!(events[0].drift_ms, 12);
    assert_eq!(events[1].kind, ExecutionEventKind::Finish);
    assert_eq!(events[1].drift_ms, 0);
}

#[tokio::test]
async fn yield_then_success() {
    let h = harness();
    let aggregate = sample_aggregate();
    seed_aggregate(&h.store, &aggregate);

    h.gateway.script_execute(response_call(
        200,
        json!({"status": "YIELD_EXECUTION", "key": "k1"}),
        200,
    ));
    h.execute
        .execute(input(aggregate.run.id))
        .await
        .expect("first chunk");

    let run = h.store.run(aggregate.run.id).expect("run");
    assert_eq!(run.yielded_executions, vec!["k1".to_string()]);
    assert_eq!(run.execution_count, 1);
    assert!(run.completed_at.is_none());
    assert_eq!(execute_run_jobs(&h.store).len(), 1);

    h.gateway
        .script_execute(response_call(200, json!({"status": "SUCCESS"}), 150));
    h.execute
        .execute(input(aggregate.run.id))
        .await
        .expect("second chunk");

    let run = h.store.run(aggregate.run.id).expect("run");
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.yielded_executions, vec!["k1".to_string()]);
    assert_eq!(run.execution_count, 2);
    assert_eq!(run.execution_duration_ms, 350);
}

#[tokio::test]
async fn timeout_without_progress_fails_the_run() {
    let h = harness();
    let aggregate = sample_aggregate();
    seed_aggregate(&h.store, &aggregate);
    h.gateway
        .script_execute(response_call(504, json!("upstream timeout"), 9_000));

    h.execute
        .execute(input(aggregate.run.id))
        .await
        .expect("execute");

    let run = h.store.run(aggregate.run.id).expect("run");
    assert_eq!(run.status, RunStatus::TimedOut);
    assert!(run.completed_at.is_some());
    let message = run.output.expect("output")["message"]
        .as_str()
        .expect("message")
        .to_string();
    assert!(message.contains("code outside of a task"), "{message}");
    assert!(execute_run_jobs(&h.store).is_empty());
}

/// Gateway that creates a task mid-chunk before timing out, simulating an
/// endpoint that made progress before the gateway cut it off.
struct ProgressThenTimeout {
    store: Arc<MemoryStore>,
    run_id: drover::models::RunId,
}

#[async_trait]
impl EndpointGateway for ProgressThenTimeout {
    async fn preprocess(&self, _endpoint: &Endpoint, _body: &PreprocessRequest) -> EndpointCall {
        timeout_call(0)
    }

    async fn execute(&self, _endpoint: &Endpoint, _body: &ExecuteRequest) -> EndpointCall {
        self.store
            .insert_task(sample_task(self.run_id, "created-mid-chunk", TaskStatus::Completed));
        timeout_call(9_000)
    }
}

#[tokio::test]
async fn timeout_with_progress_resumes_and_adapts_the_chunk_limit() {
    let h = harness();
    let mut aggregate = sample_aggregate();
    aggregate.organization.maximum_execution_time_per_run_ms = 60_000;
    seed_aggregate(&h.store, &aggregate);

    let gateway = Arc::new(ProgressThenTimeout {
        store: h.store.clone(),
        run_id: aggregate.run.id,
    });
    let driver = drover::ExecuteDriver::new(
        h.store.clone(),
        gateway,
        Arc::new(drover::connections::StoredCredentialResolver),
        Arc::new(drover::connections::StoreTaskCompletionService::new(
            h.store.clone(),
        )),
        h.telemetry.clone(),
        h.yields.clone(),
        true,
    );

    driver
        .execute(input(aggregate.run.id))
        .await
        .expect("execute");

    let run = h.store.run(aggregate.run.id).expect("run");
    assert!(run.completed_at.is_none());
    assert_eq!(run.execution_duration_ms, 9_000);
    assert!(!run.force_yield_immediately);

    let endpoint = h.store.endpoint(aggregate.endpoint.id).expect("endpoint");
    assert_eq!(endpoint.run_chunk_execution_limit_ms, 10_000);
    assert_eq!(execute_run_jobs(&h.store).len(), 1);
}

#[tokio::test]
async fn timeout_past_the_cumulative_budget_is_fatal() {
    let h = harness();
    let mut aggregate = sample_aggregate();
    aggregate.organization.maximum_execution_time_per_run_ms = 10_000;
    aggregate.run.execution_duration_ms = 5_000;
    seed_aggregate(&h.store, &aggregate);
    h.gateway.script_execute(timeout_call(6_000));

    h.execute
        .execute(input(aggregate.run.id))
        .await
        .expect("execute");

    let run = h.store.run(aggregate.run.id).expect("run");
    assert_eq!(run.status, RunStatus::TimedOut);
    let message = run.output.expect("output")["message"]
        .as_str()
        .expect("message")
        .to_string();
    assert!(message.contains("10000ms"), "{message}");
}

#[tokio::test]
async fn retry_with_task_rolls_the_attempt_forward() {
    let h = harness();
    let aggregate = sample_aggregate();
    seed_aggregate(&h.store, &aggregate);

    let task = sample_task(aggregate.run.id, "t1", TaskStatus::Running);
    let task_id = task.id;
    h.store.insert_task(task);
    h.store.insert_attempt(TaskAttempt {
        task_id,
        number: 1,
        status: TaskAttemptStatus::Errored,
        run_at: None,
        error: Some(json!({"message": "first failure"})),
    });
    h.store.insert_attempt(TaskAttempt {
        task_id,
        number: 2,
        status: TaskAttemptStatus::Pending,
        run_at: None,
        error: None,
    });

    let retry_at = Utc::now() + Duration::seconds(5);
    h.gateway.script_execute(response_call(
        200,
        json!({
            "status": "RETRY_WITH_TASK",
            "task": {"id": task_id.to_string()},
            "retryAt": retry_at.to_rfc3339(),
            "error": {"message": "boom"}
        }),
        100,
    ));

    h.execute
        .execute(input(aggregate.run.id))
        .await
        .expect("execute");

    let attempts = h.store.attempts_for(task_id);
    assert_eq!(attempts.len(), 3);
    assert_eq!(attempts[1].number, 2);
    assert_eq!(attempts[1].status, TaskAttemptStatus::Errored);
    assert!(attempts[1].error.is_some());
    assert_eq!(attempts[2].number, 3);
    assert_eq!(attempts[2].status, TaskAttemptStatus::Pending);
    let run_at = attempts[2].run_at.expect("run_at");
    assert!((run_at - retry_at).num_milliseconds().abs() < 1_000);

    let task = h.store.task(task_id).expect("task");
    assert_eq!(task.status, TaskStatus::Waiting);

    assert!(h.store.enqueued().iter().any(|job| matches!(
        job,
        QueueJob::ResumeTask { task_id: id, .. } if *id == task_id
    )));
}

#[tokio::test]
async fn yield_ceiling_fails_the_run() {
    let h = harness();
    let mut aggregate = sample_aggregate();
    aggregate.run.yielded_executions = (0..MAX_RUN_YIELDED_EXECUTIONS)
        .map(|i| format!("k{i}"))
        .collect();
    seed_aggregate(&h.store, &aggregate);
    h.gateway.script_execute(response_call(
        200,
        json!({"status": "YIELD_EXECUTION", "key": "one-too-many"}),
        50,
    ));

    h.execute
        .execute(input(aggregate.run.id))
        .await
        .expect("execute");

    let run = h.store.run(aggregate.run.id).expect("run");
    assert_eq!(run.status, RunStatus::Failure);
    assert_eq!(run.yielded_executions.len(), MAX_RUN_YIELDED_EXECUTIONS);
    let message = run.output.expect("output")["message"]
        .as_str()
        .expect("message")
        .to_string();
    assert!(
        message.contains(&MAX_RUN_YIELDED_EXECUTIONS.to_string()),
        "{message}"
    );
}

#[tokio::test]
async fn error_response_sweeps_open_tasks() {
    let h = harness();
    let aggregate = sample_aggregate();
    seed_aggregate(&h.store, &aggregate);

    let failing = sample_task(aggregate.run.id, "failing", TaskStatus::Running);
    let failing_id = failing.id;
    let bystander = sample_task(aggregate.run.id, "bystander", TaskStatus::Pending);
    let bystander_id = bystander.id;
    h.store.insert_task(failing);
    h.store.insert_task(bystander);

    h.gateway.script_execute(response_call(
        200,
        json!({
            "status": "ERROR",
            "error": {"message": "user code threw"},
            "task": {"id": failing_id.to_string()}
        }),
        75,
    ));

    h.execute
        .execute(input(aggregate.run.id))
        .await
        .expect("execute");

    let run = h.store.run(aggregate.run.id).expect("run");
    assert_eq!(run.status, RunStatus::Failure);
    assert_eq!(
        h.store.task(failing_id).expect("task").status,
        TaskStatus::Errored
    );
    // Task status closure: nothing is left open after a failure.
    assert_eq!(
        h.store.task(bystander_id).expect("task").status,
        TaskStatus::Errored
    );
}

#[tokio::test]
async fn invalid_payload_and_unresolved_auth_map_to_their_statuses() {
    for (body, expected) in [
        (
            json!({"status": "INVALID_PAYLOAD", "errors": [{"path": "user.id"}]}),
            RunStatus::InvalidPayload,
        ),
        (
            json!({"status": "UNRESOLVED_AUTH_ERROR", "issues": {"github": "missing"}}),
            RunStatus::UnresolvedAuth,
        ),
    ] {
        let h = harness();
        let aggregate = sample_aggregate();
        seed_aggregate(&h.store, &aggregate);
        h.gateway.script_execute(response_call(200, body, 20));

        h.execute
            .execute(input(aggregate.run.id))
            .await
            .expect("execute");
        assert_eq!(h.store.run(aggregate.run.id).expect("run").status, expected);
    }
}

#[tokio::test]
async fn no_response_surfaces_as_a_queue_retry() {
    let h = harness();
    let aggregate = sample_aggregate();
    seed_aggregate(&h.store, &aggregate);
    // Empty script defaults to a connection failure.

    let err = h
        .execute
        .execute(input(aggregate.run.id))
        .await
        .expect_err("should retry");
    assert!(matches!(err, ExecuteError::Retry { .. }));

    let run = h.store.run(aggregate.run.id).expect("run");
    assert!(run.completed_at.is_none());
    assert_eq!(run.execution_count, 0);
}

#[tokio::test]
async fn canceled_run_is_left_untouched() {
    let h = harness();
    let mut aggregate = sample_aggregate();
    aggregate.run.status = RunStatus::Canceled;
    seed_aggregate(&h.store, &aggregate);

    h.execute
        .execute(input(aggregate.run.id))
        .await
        .expect("execute");

    assert!(h.gateway.execute_requests().is_empty());
    assert!(h.store.enqueued().is_empty());
}

#[tokio::test]
async fn terminal_run_is_not_overwritten_by_a_late_delivery() {
    let h = harness();
    let aggregate = sample_aggregate();
    seed_aggregate(&h.store, &aggregate);
    h.gateway
        .script_execute(response_call(200, json!({"status": "SUCCESS"}), 100));
    h.execute
        .execute(input(aggregate.run.id))
        .await
        .expect("first delivery");
    let first = h.store.run(aggregate.run.id).expect("run");

    h.gateway.script_execute(response_call(
        200,
        json!({"status": "SUCCESS", "output": {"second": true}}),
        999,
    ));
    h.execute
        .execute(input(aggregate.run.id))
        .await
        .expect("duplicate delivery");

    let second = h.store.run(aggregate.run.id).expect("run");
    assert_eq!(second.execution_count, first.execution_count);
    assert_eq!(second.output, first.output);
    assert_eq!(second.completed_at, first.completed_at);
}

#[tokio::test]
async fn subscription_headers_upsert_idempotently() {
    let h = harness();
    let aggregate = sample_aggregate();
    seed_aggregate(&h.store, &aggregate);

    for _ in 0..2 {
        h.gateway.script_execute(response_call_with_headers(
            200,
            json!({"status": "YIELD_EXECUTION", "key": "k"}),
            10,
            Some("2024-03-01"),
            Some(RunMetadata {
                success_subscription: Some(true),
                failed_subscription: Some(true),
            }),
        ));
        h.execute
            .execute(input(aggregate.run.id))
            .await
            .expect("execute");
    }

    let subscriptions = h.store.subscriptions_for(aggregate.run.id);
    assert_eq!(subscriptions.len(), 2);
    assert!(subscriptions
        .iter()
        .any(|s| s.event == SubscriptionEvent::Success));
    assert!(subscriptions
        .iter()
        .any(|s| s.event == SubscriptionEvent::Failure));

    let endpoint = h.store.endpoint(aggregate.endpoint.id).expect("endpoint");
    assert_eq!(endpoint.version.as_deref(), Some("2024-03-01"));
}

#[tokio::test]
async fn auto_yield_records_a_checkpoint_and_reenqueues() {
    let h = harness();
    let aggregate = sample_aggregate();
    seed_aggregate(&h.store, &aggregate);
    h.gateway.script_execute(response_call(
        200,
        json!({
            "status": "AUTO_YIELD_EXECUTION",
            "location": "task.after",
            "timeRemaining": 420,
            "timeElapsed": 57_000
        }),
        57_000,
    ));

    h.execute
        .execute(input(aggregate.run.id))
        .await
        .expect("execute");

    let run = h.store.run(aggregate.run.id).expect("run");
    assert_eq!(run.yielded_executions, vec!["task.after".to_string()]);
    assert_eq!(run.execution_count, 1);

    let checkpoints = h.store.auto_yields_for(aggregate.run.id);
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].location, "task.after");
    assert_eq!(checkpoints[0].time_remaining_ms, 420);
    assert_eq!(checkpoints[0].limit_ms, 0);
    assert_eq!(execute_run_jobs(&h.store).len(), 1);
}

#[tokio::test]
async fn auto_yield_with_completed_task_completes_then_reenqueues() {
    let h = harness();
    let aggregate = sample_aggregate();
    seed_aggregate(&h.store, &aggregate);
    let task = sample_task(aggregate.run.id, "long-task", TaskStatus::Running);
    let task_id = task.id;
    h.store.insert_task(task);

    h.gateway.script_execute(response_call(
        200,
        json!({
            "status": "AUTO_YIELD_EXECUTION_WITH_COMPLETED_TASK",
            "id": task_id.to_string(),
            "properties": {"note": "done"},
            "output": "{\"rows\": 12}",
            "execution": {
                "location": "task.afterComplete",
                "timeRemaining": 100,
                "timeElapsed": 58_000,
                "limit": 60_000
            }
        }),
        58_000,
    ));

    h.execute
        .execute(input(aggregate.run.id))
        .await
        .expect("execute");

    let task = h.store.task(task_id).expect("task");
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.output, Some(json!({"rows": 12})));
    assert_eq!(task.output_properties, Some(json!({"note": "done"})));

    let checkpoints = h.store.auto_yields_for(aggregate.run.id);
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].limit_ms, 60_000);
    assert_eq!(execute_run_jobs(&h.store).len(), 1);
}

#[tokio::test]
async fn resume_with_task_schedules_a_resume_for_plain_tasks() {
    let h = harness();
    let aggregate = sample_aggregate();
    seed_aggregate(&h.store, &aggregate);
    let task = sample_task(aggregate.run.id, "plain", TaskStatus::Pending);
    let task_id = task.id;
    h.store.insert_task(task);

    h.gateway.script_execute(response_call(
        200,
        json!({
            "status": "RESUME_WITH_TASK",
            "task": {"id": task_id.to_string(), "outputProperties": {"size": 3}}
        }),
        40,
    ));

    h.execute
        .execute(input(aggregate.run.id))
        .await
        .expect("execute");

    let run = h.store.run(aggregate.run.id).expect("run");
    assert_eq!(run.status, RunStatus::Started);
    assert_eq!(run.execution_count, 1);
    assert_eq!(
        h.store.task(task_id).expect("task").output_properties,
        Some(json!({"size": 3}))
    );
    assert!(h.store.enqueued().iter().any(|job| matches!(
        job,
        QueueJob::ResumeTask { task_id: id, .. } if *id == task_id
    )));
}

#[tokio::test]
async fn resume_with_task_defers_to_external_completion_paths() {
    let h = harness();
    let aggregate = sample_aggregate();
    seed_aggregate(&h.store, &aggregate);
    let task = sample_task(aggregate.run.id, "fetch", TaskStatus::Pending);
    let task_id = task.id;
    h.store.insert_task(task);

    h.gateway.script_execute(response_call(
        200,
        json!({
            "status": "RESUME_WITH_TASK",
            "task": {"id": task_id.to_string(), "operation": "fetch"}
        }),
        40,
    ));

    h.execute
        .execute(input(aggregate.run.id))
        .await
        .expect("execute");

    assert!(!h
        .store
        .enqueued()
        .iter()
        .any(|job| matches!(job, QueueJob::ResumeTask { .. })));
}

#[tokio::test]
async fn parallel_children_are_dispatched_with_parent_accounting() {
    let h = harness();
    let aggregate = sample_aggregate();
    seed_aggregate(&h.store, &aggregate);

    let parent = sample_task(aggregate.run.id, "parent", TaskStatus::Running);
    let parent_id = parent.id;
    let child = sample_task(aggregate.run.id, "child", TaskStatus::Running);
    let child_id = child.id;
    h.store.insert_task(parent);
    h.store.insert_task(child);

    let retry_at = Utc::now() + Duration::seconds(3);
    h.gateway.script_execute(response_call(
        200,
        json!({
            "status": "RESUME_WITH_PARALLEL_TASK",
            "task": {"id": parent_id.to_string(), "outputProperties": {"fanout": 2}},
            "childErrors": [
                {"status": "CANCELED"},
                {
                    "status": "RETRY_WITH_TASK",
                    "task": {"id": child_id.to_string()},
                    "retryAt": retry_at.to_rfc3339(),
                    "error": {"message": "child failed"}
                }
            ]
        }),
        500,
    ));

    h.execute
        .execute(input(aggregate.run.id))
        .await
        .expect("execute");

    let run = h.store.run(aggregate.run.id).expect("run");
    // The parent update is the sole accounting event.
    assert_eq!(run.execution_count, 1);
    assert_eq!(run.execution_duration_ms, 500);
    assert_eq!(
        h.store.task(parent_id).expect("parent").output_properties,
        Some(json!({"fanout": 2}))
    );
    assert_eq!(
        h.store.task(child_id).expect("child").status,
        TaskStatus::Waiting
    );
    let attempts = h.store.attempts_for(child_id);
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].number, 1);
}

#[tokio::test]
async fn parallel_short_circuits_on_the_first_terminal_child() {
    let h = harness();
    let aggregate = sample_aggregate();
    seed_aggregate(&h.store, &aggregate);
    let parent = sample_task(aggregate.run.id, "parent", TaskStatus::Running);
    let parent_id = parent.id;
    let late = sample_task(aggregate.run.id, "late-child", TaskStatus::Running);
    let late_id = late.id;
    h.store.insert_task(parent);
    h.store.insert_task(late);

    h.gateway.script_execute(response_call(
        200,
        json!({
            "status": "RESUME_WITH_PARALLEL_TASK",
            "task": {"id": parent_id.to_string()},
            "childErrors": [
                {"status": "ERROR", "error": {"message": "fatal child"}},
                {
                    "status": "RETRY_WITH_TASK",
                    "task": {"id": late_id.to_string()},
                    "retryAt": Utc::now().to_rfc3339(),
                    "error": {"message": "never handled"}
                }
            ]
        }),
        100,
    ));

    h.execute
        .execute(input(aggregate.run.id))
        .await
        .expect("execute");

    let run = h.store.run(aggregate.run.id).expect("run");
    assert_eq!(run.status, RunStatus::Failure);
    // The retry child after the terminal error was never processed.
    assert!(h.store.attempts_for(late_id).is_empty());
}

#[tokio::test]
async fn blocked_organization_cancels_the_run() {
    let h = harness();
    let aggregate = sample_aggregate();
    seed_aggregate(&h.store, &aggregate);
    std::env::set_var(
        "BLOCKED_ORGS",
        format!("some-other-org,{}", aggregate.run.organization_id),
    );

    h.execute
        .execute(input(aggregate.run.id))
        .await
        .expect("execute");
    std::env::remove_var("BLOCKED_ORGS");

    let run = h.store.run(aggregate.run.id).expect("run");
    assert_eq!(run.status, RunStatus::Canceled);
    assert!(run.completed_at.is_some());
    assert!(h.gateway.execute_requests().is_empty());
}

#[tokio::test]
async fn deprecated_resume_task_transitions_the_task() {
    let h = harness();
    let aggregate = sample_aggregate();
    seed_aggregate(&h.store, &aggregate);
    let mut noop = sample_task(aggregate.run.id, "noop-task", TaskStatus::Waiting);
    noop.noop = true;
    let noop_id = noop.id;
    h.store.insert_task(noop);

    h.gateway
        .script_execute(response_call(200, json!({"status": "SUCCESS"}), 10));

    let mut job = input(aggregate.run.id);
    job.resume_task_id = Some(noop_id);
    h.execute.execute(job).await.expect("execute");

    assert_eq!(
        h.store.task(noop_id).expect("task").status,
        TaskStatus::Completed
    );
}

fn sample_harness_with_unresolved_connection() -> (TestHarness, drover::models::RunAggregate) {
    let h = harness();
    let mut aggregate = sample_aggregate();
    aggregate.connections.push(drover::models::RunConnection {
        id: drover::test_support::unique_id(),
        key: "github".into(),
        auth: None,
    });
    seed_aggregate(&h.store, &aggregate);
    (h, aggregate)
}

#[tokio::test]
async fn unresolvable_connections_fail_without_calling_the_endpoint() {
    let (h, aggregate) = sample_harness_with_unresolved_connection();

    h.execute
        .execute(input(aggregate.run.id))
        .await
        .expect("execute");

    let run = h.store.run(aggregate.run.id).expect("run");
    assert_eq!(run.status, RunStatus::Failure);
    assert!(h.gateway.execute_requests().is_empty());
}
