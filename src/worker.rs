//! Polling worker over the durable job queue.
//!
//! Many workers can run against the same store; `claim_due_jobs` hands each
//! claimed message to exactly one of them. A message is acked on success
//! and rescheduled with exponential backoff when the execute driver asks
//! for a retry, except when the job was enqueued with `skip_retrying`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::execute::{ExecuteDriver, ExecuteJobInput};
use crate::failure::{ExecuteError, RetryBackoff};
use crate::models::RunId;
use crate::preprocess::PreprocessDriver;
use crate::store::{ClaimedJob, CoordinatorStore, QueueJob, RunReason};

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
    pub max_concurrent: usize,
    pub backoff: RetryBackoff,
    /// How often expired claim leases are swept back into circulation.
    pub reclaim_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            batch_size: 20,
            max_concurrent: 8,
            backoff: RetryBackoff::default(),
            reclaim_interval: Duration::from_secs(30),
        }
    }
}

/// Delivery of terminal-state notifications to subscribed endpoints. The
/// coordinator only guarantees the enqueue; delivery itself is owned by the
/// notification pipeline behind this trait.
#[async_trait]
pub trait SubscriptionNotifier: Send + Sync {
    async fn deliver(&self, run_id: RunId) -> anyhow::Result<()>;
}

/// Default notifier: log and move on.
pub struct LoggingNotifier;

#[async_trait]
impl SubscriptionNotifier for LoggingNotifier {
    async fn deliver(&self, run_id: RunId) -> anyhow::Result<()> {
        info!(run_id = %run_id, "delivering run subscriptions");
        Ok(())
    }
}

pub struct QueueWorker {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl QueueWorker {
    pub fn start(
        config: WorkerConfig,
        store: Arc<dyn CoordinatorStore>,
        preprocess: Arc<PreprocessDriver>,
        execute: Arc<ExecuteDriver>,
        notifier: Arc<dyn SubscriptionNotifier>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let task = WorkerTask {
                config,
                store,
                preprocess,
                execute,
                notifier,
                shutdown_rx,
            };
            task.run().await;
        });
        Self {
            shutdown_tx,
            handle,
        }
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown(self) {
        self.trigger_shutdown();
        if let Err(err) = self.handle.await {
            error!(error = %err, "queue worker task panicked");
        }
    }
}

struct WorkerTask {
    config: WorkerConfig,
    store: Arc<dyn CoordinatorStore>,
    preprocess: Arc<PreprocessDriver>,
    execute: Arc<ExecuteDriver>,
    notifier: Arc<dyn SubscriptionNotifier>,
    shutdown_rx: watch::Receiver<bool>,
}

impl WorkerTask {
    async fn run(mut self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis(),
            batch_size = self.config.batch_size,
            max_concurrent = self.config.max_concurrent,
            "starting queue worker",
        );

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut reclaim_ticker = interval(self.config.reclaim_interval);
        reclaim_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.poll_once(&semaphore).await {
                        error!(error = %err, "polling cycle failed");
                    }
                }
                _ = reclaim_ticker.tick() => {
                    match self.store.reclaim_expired_jobs(self.config.batch_size).await {
                        Ok(count) if count > 0 => {
                            info!(count, "reclaimed expired job leases");
                        }
                        Err(err) => {
                            error!(error = %err, "failed to reclaim expired job leases");
                        }
                        _ => {}
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("queue worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn poll_once(&self, semaphore: &Arc<Semaphore>) -> anyhow::Result<()> {
        let available = semaphore.available_permits();
        if available == 0 {
            return Ok(());
        }
        let batch = self.config.batch_size.min(available as i64);
        let claimed = self.store.claim_due_jobs(batch).await?;
        if claimed.is_empty() {
            return Ok(());
        }
        debug!(count = claimed.len(), "claimed queue jobs");

        for job in claimed {
            let permit = semaphore.clone().acquire_owned().await?;
            let store = Arc::clone(&self.store);
            let preprocess = Arc::clone(&self.preprocess);
            let execute = Arc::clone(&self.execute);
            let notifier = Arc::clone(&self.notifier);
            let backoff = self.config.backoff;
            tokio::spawn(async move {
                let _permit = permit;
                handle_job(store, preprocess, execute, notifier, backoff, job).await;
            });
        }
        Ok(())
    }
}

/// Process one claimed job to an ack or a reschedule.
pub async fn handle_job(
    store: Arc<dyn CoordinatorStore>,
    preprocess: Arc<PreprocessDriver>,
    execute: Arc<ExecuteDriver>,
    notifier: Arc<dyn SubscriptionNotifier>,
    backoff: RetryBackoff,
    claimed: ClaimedJob,
) {
    let drift_ms = (Utc::now() - claimed.scheduled_at).num_milliseconds().max(0);

    let result: Result<(), JobFailure> = match claimed.job.clone() {
        QueueJob::ExecuteRun {
            run_id,
            reason: RunReason::Preprocess,
            ..
        } => preprocess
            .preprocess(run_id)
            .await
            .map_err(|err| JobFailure::retryable(err.to_string())),
        QueueJob::ExecuteRun {
            run_id,
            reason: RunReason::ExecuteJob,
            resume_task_id,
            skip_retrying,
        } => {
            match execute
                .execute(ExecuteJobInput {
                    run_id,
                    is_retry: claimed.attempts > 0,
                    resume_task_id,
                    drift_ms,
                })
                .await
            {
                Ok(()) => Ok(()),
                Err(ExecuteError::Retry { output }) => {
                    if skip_retrying {
                        warn!(run_id = %run_id, "dropping retryable failure (retries disabled)");
                        Ok(())
                    } else {
                        Err(JobFailure::retryable(output.to_string()))
                    }
                }
                Err(ExecuteError::Store(err)) => Err(JobFailure::retryable(err.to_string())),
            }
        }
        QueueJob::ResumeTask { run_id, task_id } => store
            .enqueue(
                QueueJob::ExecuteRun {
                    run_id,
                    reason: RunReason::ExecuteJob,
                    resume_task_id: Some(task_id),
                    skip_retrying: false,
                },
                None,
            )
            .await
            .map_err(|err| JobFailure::retryable(err.to_string())),
        QueueJob::DeliverRunSubscriptions { run_id } => notifier
            .deliver(run_id)
            .await
            .map_err(|err| JobFailure::retryable(err.to_string())),
    };

    match result {
        Ok(()) => {
            if let Err(err) = store.complete_job(claimed.id).await {
                error!(job_id = %claimed.id, error = %err, "failed to ack job");
            }
        }
        Err(failure) => {
            let delay_ms = backoff.delay_ms(claimed.attempts + 1);
            let run_at = Utc::now() + chrono::Duration::milliseconds(delay_ms);
            warn!(
                job_id = %claimed.id,
                attempts = claimed.attempts,
                delay_ms,
                reason = %failure.message,
                "rescheduling job"
            );
            if let Err(err) = store.retry_job(claimed.id, run_at).await {
                error!(job_id = %claimed.id, error = %err, "failed to reschedule job");
            }
        }
    }
}

struct JobFailure {
    message: String,
}

impl JobFailure {
    fn retryable(message: String) -> Self {
        Self { message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RunStatus, TaskStatus};
    use crate::store::MemoryStore;
    use crate::test_support::{harness, response_call, sample_aggregate, sample_task, seed_aggregate};
    use serde_json::json;

    #[tokio::test]
    async fn resume_task_job_reenqueues_an_execution_with_the_task() {
        let harness = harness();
        let aggregate = sample_aggregate();
        seed_aggregate(&harness.store, &aggregate);
        let task = sample_task(aggregate.run.id, "t1", TaskStatus::Waiting);
        let task_id = task.id;
        harness.store.insert_task(task);

        let store: Arc<MemoryStore> = harness.store.clone();
        let claimed = ClaimedJob {
            id: crate::test_support::unique_id(),
            job: QueueJob::ResumeTask {
                run_id: aggregate.run.id,
                task_id,
            },
            scheduled_at: Utc::now(),
            attempts: 0,
        };
        handle_job(
            store.clone(),
            Arc::new(PreprocessDriver::new(store.clone(), harness.gateway.clone())),
            Arc::new(harness.execute),
            Arc::new(LoggingNotifier),
            RetryBackoff::default(),
            claimed,
        )
        .await;

        let jobs = store.enqueued();
        assert!(jobs.iter().any(|job| matches!(
            job,
            QueueJob::ExecuteRun {
                resume_task_id: Some(id),
                reason: RunReason::ExecuteJob,
                ..
            } if *id == task_id
        )));
    }

    #[tokio::test]
    async fn execute_job_is_acked_after_success() {
        let harness = harness();
        let aggregate = sample_aggregate();
        seed_aggregate(&harness.store, &aggregate);
        harness.gateway.script_execute(response_call(
            200,
            json!({"status": "SUCCESS", "output": {"done": true}}),
            10,
        ));

        let store: Arc<MemoryStore> = harness.store.clone();
        store
            .enqueue(
                QueueJob::ExecuteRun {
                    run_id: aggregate.run.id,
                    reason: RunReason::ExecuteJob,
                    resume_task_id: None,
                    skip_retrying: false,
                },
                None,
            )
            .await
            .expect("enqueue");
        let claimed = store.claim_due_jobs(10).await.expect("claim");
        assert_eq!(claimed.len(), 1);

        handle_job(
            store.clone(),
            Arc::new(PreprocessDriver::new(store.clone(), harness.gateway.clone())),
            Arc::new(harness.execute),
            Arc::new(LoggingNotifier),
            RetryBackoff::default(),
            claimed.into_iter().next().expect("job"),
        )
        .await;

        let run = store.run(aggregate.run.id).expect("run");
        assert_eq!(run.status, RunStatus::Success);
        // The only undelivered job left is the subscription fan-out.
        let remaining = store.claim_due_jobs(10).await.expect("claim");
        assert_eq!(remaining.len(), 1);
        assert!(matches!(
            remaining[0].job,
            QueueJob::DeliverRunSubscriptions { .. }
        ));
    }
}
