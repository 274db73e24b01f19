//! Scenarios for the PREPROCESS step.

use serde_json::json;

use drover::models::RunStatus;
use drover::store::{QueueJob, RunReason};
use drover::test_support::{harness, no_response_call, response_call, sample_aggregate, seed_aggregate};

fn execute_jobs(store: &drover::MemoryStore) -> usize {
    store
        .enqueued()
        .iter()
        .filter(|job| matches!(job, QueueJob::ExecuteRun { reason: RunReason::ExecuteJob, .. }))
        .count()
}

#[tokio::test]
async fn healthy_preprocess_starts_the_run_and_enqueues_execution() {
    let h = harness();
    let aggregate = sample_aggregate();
    seed_aggregate(&h.store, &aggregate);
    h.gateway.script_preprocess(response_call(
        200,
        json!({"abort": false, "properties": {"label": "orders"}}),
        50,
    ));

    h.preprocess
        .preprocess(aggregate.run.id)
        .await
        .expect("preprocess");

    let run = h.store.run(aggregate.run.id).expect("run");
    assert_eq!(run.status, RunStatus::Started);
    assert!(run.started_at.is_some());
    assert_eq!(run.properties, Some(json!({"label": "orders"})));
    assert!(!run.force_yield_immediately);
    assert_eq!(execute_jobs(&h.store), 1);
}

#[tokio::test]
async fn abort_finishes_the_run() {
    let h = harness();
    let aggregate = sample_aggregate();
    seed_aggregate(&h.store, &aggregate);
    h.gateway
        .script_preprocess(response_call(200, json!({"abort": true}), 20));

    h.preprocess
        .preprocess(aggregate.run.id)
        .await
        .expect("preprocess");

    let run = h.store.run(aggregate.run.id).expect("run");
    assert_eq!(run.status, RunStatus::Aborted);
    assert!(run.completed_at.is_some());
    assert_eq!(execute_jobs(&h.store), 0);
}

#[tokio::test]
async fn unreachable_endpoint_falls_through_to_execution() {
    // A failed preprocess is transient: the run starts anyway and the
    // execute step surfaces the real failure.
    let h = harness();
    let aggregate = sample_aggregate();
    seed_aggregate(&h.store, &aggregate);
    h.gateway.script_preprocess(no_response_call());

    h.preprocess
        .preprocess(aggregate.run.id)
        .await
        .expect("preprocess");

    let run = h.store.run(aggregate.run.id).expect("run");
    assert_eq!(run.status, RunStatus::Started);
    assert!(run.completed_at.is_none());
    assert_eq!(execute_jobs(&h.store), 1);
}

#[tokio::test]
async fn invalid_body_follows_the_same_transient_path() {
    let h = harness();
    let aggregate = sample_aggregate();
    seed_aggregate(&h.store, &aggregate);
    h.gateway
        .script_preprocess(response_call(200, json!("not an object"), 20));

    h.preprocess
        .preprocess(aggregate.run.id)
        .await
        .expect("preprocess");

    let run = h.store.run(aggregate.run.id).expect("run");
    assert_eq!(run.status, RunStatus::Started);
    assert_eq!(execute_jobs(&h.store), 1);
}

#[tokio::test]
async fn unknown_run_is_ignored() {
    let h = harness();
    h.preprocess
        .preprocess(drover::models::RunId::new())
        .await
        .expect("preprocess");
    assert!(h.gateway.preprocess_requests().is_empty());
}

#[tokio::test]
async fn preprocess_request_carries_job_and_account_identity() {
    let h = harness();
    let mut aggregate = sample_aggregate();
    aggregate.external_account = Some(drover::models::ExternalAccount {
        id: drover::test_support::unique_id(),
        identifier: "customer-17".into(),
        metadata: Some(json!({"tier": "pro"})),
    });
    aggregate.run.external_account_id = aggregate.external_account.as_ref().map(|a| a.id);
    seed_aggregate(&h.store, &aggregate);
    h.gateway
        .script_preprocess(response_call(200, json!({"abort": false}), 10));

    h.preprocess
        .preprocess(aggregate.run.id)
        .await
        .expect("preprocess");

    let requests = h.gateway.preprocess_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].job.id, aggregate.version.job_slug);
    assert_eq!(requests[0].job.version, aggregate.version.version);
    let account = requests[0].account.as_ref().expect("account");
    assert_eq!(account.id, "customer-17");
}
