//! Postgres store backend.
//!
//! Each trait method runs its branch in one transaction; queue rows are
//! inserted in the same transaction as the state mutation they accompany, so
//! follow-up jobs exist iff the mutation committed. Terminal transitions are
//! guarded with `completed_at IS NULL` so a re-delivered message cannot
//! overwrite a finished run.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::warn;
use uuid::Uuid;

use super::{
    AutoYieldWrite, ClaimedJob, CoordinatorStore, FailExecution, FailureReason, QueueJob,
    ResumeTaskWrite, RetryTaskWrite, RunReason, StoreError, StoreResult, YieldWrite,
    JOB_LEASE_SECONDS,
};
use crate::models::{
    AutoYieldConfig, Endpoint, EndpointId, Environment, EnvironmentId, EnvironmentType, Event,
    EventId, ExternalAccount, JobId, JobVersion, JobVersionId, Organization, OrganizationId,
    Project, ProjectId, Run, RunAggregate, RunConnection, RunId, RunStatus, RunSubscription,
    SubscriptionEvent, Task, TaskId, TaskStatus,
};
use crate::MAX_RUN_YIELDED_EXECUTIONS;

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Message(format!("migration failed: {e}")))?;
        Ok(())
    }
}

fn parse_status(s: &str) -> StoreResult<RunStatus> {
    RunStatus::parse(s).ok_or_else(|| StoreError::Message(format!("unknown run status {s:?}")))
}

fn parse_task_status(s: &str) -> StoreResult<TaskStatus> {
    TaskStatus::parse(s).ok_or_else(|| StoreError::Message(format!("unknown task status {s:?}")))
}

fn run_from_row(row: &PgRow) -> StoreResult<Run> {
    let status: String = row.try_get("status")?;
    Ok(Run {
        id: RunId(row.try_get("id")?),
        status: parse_status(&status)?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        execution_count: row.try_get("execution_count")?,
        execution_duration_ms: row.try_get("execution_duration_ms")?,
        yielded_executions: row.try_get("yielded_executions")?,
        output: row.try_get("output")?,
        properties: row.try_get("properties")?,
        force_yield_immediately: row.try_get("force_yield_immediately")?,
        is_test: row.try_get("is_test")?,
        internal: row.try_get("internal")?,
        environment_id: EnvironmentId(row.try_get("environment_id")?),
        endpoint_id: EndpointId(row.try_get("endpoint_id")?),
        organization_id: OrganizationId(row.try_get("organization_id")?),
        project_id: ProjectId(row.try_get("project_id")?),
        event_id: EventId(row.try_get("event_id")?),
        version_id: JobVersionId(row.try_get("version_id")?),
        external_account_id: row.try_get("external_account_id")?,
    })
}

fn task_from_row(row: &PgRow) -> StoreResult<Task> {
    let status: String = row.try_get("status")?;
    Ok(Task {
        id: TaskId(row.try_get("id")?),
        run_id: RunId(row.try_get("run_id")?),
        idempotency_key: row.try_get("idempotency_key")?,
        display_key: row.try_get("display_key")?,
        status: parse_task_status(&status)?,
        noop: row.try_get("noop")?,
        output: row.try_get("output")?,
        output_is_undefined: row.try_get("output_is_undefined")?,
        output_properties: row.try_get("output_properties")?,
        parent_id: row.try_get::<Option<Uuid>, _>("parent_id")?.map(TaskId),
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

async fn insert_job(
    tx: &mut Transaction<'_, Postgres>,
    job: &QueueJob,
    run_at: Option<DateTime<Utc>>,
) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO job_queue (id, payload, scheduled_at) VALUES ($1, $2, COALESCE($3, NOW()))",
    )
    .bind(Uuid::new_v4())
    .bind(serde_json::to_value(job)?)
    .bind(run_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_execution_job(
    tx: &mut Transaction<'_, Postgres>,
    run_id: RunId,
    skip_retrying: bool,
) -> StoreResult<()> {
    insert_job(
        tx,
        &QueueJob::ExecuteRun {
            run_id,
            reason: RunReason::ExecuteJob,
            resume_task_id: None,
            skip_retrying,
        },
        None,
    )
    .await
}

#[async_trait]
impl CoordinatorStore for PostgresStore {
    async fn load_run(&self, id: RunId) -> StoreResult<Option<RunAggregate>> {
        let Some(run_row) = sqlx::query("SELECT * FROM runs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        let run = run_from_row(&run_row)?;

        let environment_row = sqlx::query("SELECT * FROM environments WHERE id = $1")
            .bind(run.environment_id)
            .fetch_one(&self.pool)
            .await?;
        let env_type: String = environment_row.try_get("env_type")?;
        let environment = Environment {
            id: run.environment_id,
            slug: environment_row.try_get("slug")?,
            env_type: EnvironmentType::parse(&env_type)
                .ok_or_else(|| StoreError::Message(format!("unknown env type {env_type:?}")))?,
        };

        let endpoint_row = sqlx::query("SELECT * FROM endpoints WHERE id = $1")
            .bind(run.endpoint_id)
            .fetch_one(&self.pool)
            .await?;
        let endpoint = Endpoint {
            id: run.endpoint_id,
            url: endpoint_row.try_get("url")?,
            api_key: endpoint_row.try_get("api_key")?,
            version: endpoint_row.try_get("version")?,
            run_chunk_execution_limit_ms: endpoint_row.try_get("run_chunk_execution_limit_ms")?,
            auto_yield: AutoYieldConfig {
                start_threshold_ms: endpoint_row.try_get("start_threshold_ms")?,
                before_execute_threshold_ms: endpoint_row.try_get("before_execute_threshold_ms")?,
                before_complete_threshold_ms: endpoint_row
                    .try_get("before_complete_threshold_ms")?,
                after_complete_threshold_ms: endpoint_row.try_get("after_complete_threshold_ms")?,
            },
        };

        let organization_row = sqlx::query("SELECT * FROM organizations WHERE id = $1")
            .bind(run.organization_id)
            .fetch_one(&self.pool)
            .await?;
        let organization = Organization {
            id: run.organization_id,
            slug: organization_row.try_get("slug")?,
            maximum_execution_time_per_run_ms: organization_row
                .try_get("maximum_execution_time_per_run_ms")?,
        };

        let project_row = sqlx::query("SELECT * FROM projects WHERE id = $1")
            .bind(run.project_id)
            .fetch_one(&self.pool)
            .await?;
        let project = Project {
            id: run.project_id,
            slug: project_row.try_get("slug")?,
        };

        let event_row = sqlx::query("SELECT * FROM events WHERE id = $1")
            .bind(run.event_id)
            .fetch_one(&self.pool)
            .await?;
        let event = Event {
            id: run.event_id,
            name: event_row.try_get("name")?,
            payload: event_row.try_get("payload")?,
            context: event_row.try_get("context")?,
            source_context: event_row.try_get("source_context")?,
            timestamp: event_row.try_get("occurred_at")?,
        };

        let version_row = sqlx::query("SELECT * FROM job_versions WHERE id = $1")
            .bind(run.version_id)
            .fetch_one(&self.pool)
            .await?;
        let version = JobVersion {
            id: run.version_id,
            version: version_row.try_get("version")?,
            job_id: JobId(version_row.try_get("job_id")?),
            job_slug: version_row.try_get("job_slug")?,
        };

        let external_account = match run.external_account_id {
            Some(account_id) => {
                sqlx::query("SELECT * FROM external_accounts WHERE id = $1")
                    .bind(account_id)
                    .fetch_optional(&self.pool)
                    .await?
                    .map(|row| -> StoreResult<ExternalAccount> {
                        Ok(ExternalAccount {
                            id: account_id,
                            identifier: row.try_get("identifier")?,
                            metadata: row.try_get("metadata")?,
                        })
                    })
                    .transpose()?
            }
            None => None,
        };

        let task_rows = sqlx::query(
            "SELECT * FROM tasks WHERE run_id = $1 AND status = 'COMPLETED' ORDER BY id ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        let completed_tasks = task_rows
            .iter()
            .map(task_from_row)
            .collect::<StoreResult<Vec<_>>>()?;

        let task_count: i64 = sqlx::query("SELECT COUNT(*) AS count FROM tasks WHERE run_id = $1")
            .bind(id)
            .fetch_one(&self.pool)
            .await?
            .try_get("count")?;

        let connection_rows =
            sqlx::query("SELECT * FROM run_connections WHERE run_id = $1 ORDER BY key")
                .bind(id)
                .fetch_all(&self.pool)
                .await?;
        let connections = connection_rows
            .iter()
            .map(|row| -> StoreResult<RunConnection> {
                Ok(RunConnection {
                    id: row.try_get("id")?,
                    key: row.try_get("key")?,
                    auth: row.try_get("auth")?,
                })
            })
            .collect::<StoreResult<Vec<_>>>()?;

        let subscription_rows = sqlx::query("SELECT * FROM run_subscriptions WHERE run_id = $1")
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        let subscriptions = subscription_rows
            .iter()
            .map(|row| -> StoreResult<RunSubscription> {
                let event: String = row.try_get("event")?;
                Ok(RunSubscription {
                    id: row.try_get("id")?,
                    run_id: id,
                    recipient: row.try_get("recipient")?,
                    event: SubscriptionEvent::parse(&event).ok_or_else(|| {
                        StoreError::Message(format!("unknown subscription event {event:?}"))
                    })?,
                    active: row.try_get("active")?,
                })
            })
            .collect::<StoreResult<Vec<_>>>()?;

        Ok(Some(RunAggregate {
            run,
            environment,
            endpoint,
            organization,
            project,
            external_account,
            event,
            version,
            connections,
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
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE runs
            SET status = 'STARTED',
                started_at = NOW(),
                properties = COALESCE($2, properties),
                force_yield_immediately = FALSE
            WHERE id = $1 AND completed_at IS NULL
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(properties)
        .fetch_optional(&mut *tx)
        .await?;
        if updated.is_some() {
            insert_execution_job(&mut tx, id, skip_retrying).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn cancel_run(&self, id: RunId) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE runs
            SET status = 'CANCELED', completed_at = NOW()
            WHERE id = $1 AND completed_at IS NULL
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn begin_chunk(&self, id: RunId) -> StoreResult<i32> {
        let row = sqlx::query(
            r#"
            UPDATE runs
            SET started_at = CASE
                    WHEN status = 'QUEUED' AND started_at IS NULL THEN NOW()
                    ELSE started_at
                END,
                status = CASE WHEN status = 'QUEUED' THEN 'STARTED' ELSE status END
            WHERE id = $1
            RETURNING execution_count + 1 AS chunk_number
            "#,
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("chunk_number")?)
    }

    async fn resume_deprecated_task(&self, id: TaskId) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = CASE WHEN noop THEN 'COMPLETED' ELSE 'RUNNING' END,
                completed_at = CASE WHEN noop THEN NOW() ELSE completed_at END
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_endpoint_version(&self, id: EndpointId, version: &str) -> StoreResult<()> {
        sqlx::query("UPDATE endpoints SET version = $2 WHERE id = $1")
            .bind(id)
            .bind(version)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_run_subscription(
        &self,
        run_id: RunId,
        recipient: &str,
        event: SubscriptionEvent,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO run_subscriptions (id, run_id, recipient, event, active)
            VALUES ($1, $2, $3, $4, TRUE)
            ON CONFLICT (run_id, recipient, event) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(run_id)
        .bind(recipient)
        .bind(event.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_run(
        &self,
        id: RunId,
        output: Option<Value>,
        duration_ms: i64,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE runs
            SET status = 'SUCCESS',
                completed_at = NOW(),
                output = $2,
                execution_duration_ms = execution_duration_ms + $3,
                execution_count = execution_count + 1
            WHERE id = $1 AND completed_at IS NULL
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(output)
        .bind(duration_ms)
        .fetch_optional(&mut *tx)
        .await?;
        if updated.is_some() {
            insert_job(&mut tx, &QueueJob::DeliverRunSubscriptions { run_id: id }, None).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn fail_execution(&self, write: FailExecution) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        match write.reason {
            FailureReason::ExecuteJob => {
                let updated = sqlx::query(
                    r#"
                    UPDATE runs
                    SET status = $2,
                        completed_at = NOW(),
                        output = $3,
                        execution_duration_ms = execution_duration_ms + $4,
                        force_yield_immediately = FALSE
                    WHERE id = $1 AND completed_at IS NULL
                    RETURNING id
                    "#,
                )
                .bind(write.run_id)
                .bind(write.status.as_str())
                .bind(&write.output)
                .bind(write.duration_ms)
                .fetch_optional(&mut *tx)
                .await?;

                if updated.is_some() {
                    let swept = if write.status == RunStatus::TimedOut {
                        TaskStatus::Canceled
                    } else {
                        TaskStatus::Errored
                    };
                    sqlx::query(
                        r#"
                        UPDATE tasks
                        SET status = $2, completed_at = NOW()
                        WHERE run_id = $1 AND status IN ('WAITING', 'RUNNING', 'PENDING')
                        "#,
                    )
                    .bind(write.run_id)
                    .bind(swept.as_str())
                    .execute(&mut *tx)
                    .await?;

                    insert_job(
                        &mut tx,
                        &QueueJob::DeliverRunSubscriptions {
                            run_id: write.run_id,
                        },
                        None,
                    )
                    .await?;
                }
            }
            FailureReason::Preprocess => {
                if write.status == RunStatus::Aborted {
                    sqlx::query(
                        r#"
                        UPDATE runs
                        SET status = 'ABORTED', completed_at = NOW(), output = $2
                        WHERE id = $1 AND completed_at IS NULL
                        "#,
                    )
                    .bind(write.run_id)
                    .bind(&write.output)
                    .execute(&mut *tx)
                    .await?;
                } else {
                    let updated = sqlx::query(
                        r#"
                        UPDATE runs
                        SET status = 'STARTED', started_at = NOW()
                        WHERE id = $1 AND completed_at IS NULL
                        RETURNING id
                        "#,
                    )
                    .bind(write.run_id)
                    .fetch_optional(&mut *tx)
                    .await?;
                    if updated.is_some() {
                        insert_execution_job(&mut tx, write.run_id, write.skip_retrying).await?;
                    }
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn record_task_error(&self, id: TaskId, error: Value) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'ERRORED', completed_at = NOW(), output = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_task(
        &self,
        id: TaskId,
        output: Option<Value>,
        properties: Option<Value>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'COMPLETED',
                completed_at = NOW(),
                output = COALESCE($2, output),
                output_properties = COALESCE($3, output_properties)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(output)
        .bind(properties)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn resume_with_task(&self, write: ResumeTaskWrite) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE runs
            SET execution_duration_ms = execution_duration_ms + $2,
                execution_count = execution_count + $3
            WHERE id = $1 AND completed_at IS NULL
            RETURNING id
            "#,
        )
        .bind(write.run_id)
        .bind(write.duration_ms)
        .bind(write.execution_count_delta)
        .fetch_optional(&mut *tx)
        .await?;

        if updated.is_some() {
            if let Some(properties) = &write.output_properties {
                sqlx::query("UPDATE tasks SET output_properties = $2 WHERE id = $1")
                    .bind(write.task_id)
                    .bind(properties)
                    .execute(&mut *tx)
                    .await?;
            }
            if write.enqueue_resume {
                insert_job(
                    &mut tx,
                    &QueueJob::ResumeTask {
                        run_id: write.run_id,
                        task_id: write.task_id,
                    },
                    write.resume_at,
                )
                .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn resume_parallel_parent(
        &self,
        run_id: RunId,
        task_id: TaskId,
        output_properties: Option<Value>,
        duration_ms: i64,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE runs
            SET execution_duration_ms = execution_duration_ms + $2,
                execution_count = execution_count + 1,
                force_yield_immediately = FALSE
            WHERE id = $1 AND completed_at IS NULL
            RETURNING id
            "#,
        )
        .bind(run_id)
        .bind(duration_ms)
        .fetch_optional(&mut *tx)
        .await?;

        if updated.is_some() {
            if let Some(properties) = &output_properties {
                sqlx::query("UPDATE tasks SET output_properties = $2 WHERE id = $1")
                    .bind(task_id)
                    .bind(properties)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn retry_with_task(&self, write: RetryTaskWrite) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE runs
            SET execution_duration_ms = execution_duration_ms + $2,
                execution_count = execution_count + $3
            WHERE id = $1 AND completed_at IS NULL
            RETURNING id
            "#,
        )
        .bind(write.run_id)
        .bind(write.duration_ms)
        .bind(write.execution_count_delta)
        .fetch_optional(&mut *tx)
        .await?;
        if updated.is_none() {
            tx.commit().await?;
            return Ok(());
        }

        sqlx::query(
            r#"
            UPDATE task_attempts
            SET status = 'ERRORED', error = $2
            WHERE id = (
                SELECT id FROM task_attempts
                WHERE task_id = $1 AND status = 'PENDING'
                ORDER BY number DESC
                LIMIT 1
            )
            "#,
        )
        .bind(write.task_id)
        .bind(&write.error)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO task_attempts (task_id, number, status, run_at)
            SELECT $1, COALESCE(MAX(number), 0) + 1, 'PENDING', $2
            FROM task_attempts WHERE task_id = $1
            "#,
        )
        .bind(write.task_id)
        .bind(write.retry_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE tasks SET status = 'WAITING' WHERE id = $1")
            .bind(write.task_id)
            .execute(&mut *tx)
            .await?;

        insert_job(
            &mut tx,
            &QueueJob::ResumeTask {
                run_id: write.run_id,
                task_id: write.task_id,
            },
            Some(write.retry_at),
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn try_append_yield(&self, write: YieldWrite) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            SELECT cardinality(yielded_executions) AS yields, completed_at
            FROM runs WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(write.run_id)
        .fetch_one(&mut *tx)
        .await?;
        let completed_at: Option<DateTime<Utc>> = row.try_get("completed_at")?;
        if completed_at.is_some() {
            tx.commit().await?;
            return Ok(true);
        }
        let yields: i32 = row.try_get("yields")?;
        if yields as usize + 1 > MAX_RUN_YIELDED_EXECUTIONS {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE runs
            SET yielded_executions = array_append(yielded_executions, $2),
                execution_duration_ms = execution_duration_ms + $3,
                execution_count = execution_count + $4,
                force_yield_immediately = FALSE
            WHERE id = $1
            "#,
        )
        .bind(write.run_id)
        .bind(&write.key)
        .bind(write.duration_ms)
        .bind(write.execution_count_delta)
        .execute(&mut *tx)
        .await?;

        insert_execution_job(&mut tx, write.run_id, write.skip_retrying).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn record_auto_yield(&self, write: AutoYieldWrite) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE runs
            SET yielded_executions = array_append(yielded_executions, $2),
                execution_duration_ms = execution_duration_ms + $3,
                execution_count = execution_count + $4,
                force_yield_immediately = FALSE
            WHERE id = $1 AND completed_at IS NULL
            RETURNING id
            "#,
        )
        .bind(write.base.run_id)
        .bind(&write.base.key)
        .bind(write.base.duration_ms)
        .bind(write.base.execution_count_delta)
        .fetch_optional(&mut *tx)
        .await?;

        if updated.is_some() {
            sqlx::query(
                r#"
                INSERT INTO auto_yield_executions
                    (id, run_id, location, time_remaining_ms, time_elapsed_ms, limit_ms)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(write.base.run_id)
            .bind(&write.base.key)
            .bind(write.time_remaining_ms)
            .bind(write.time_elapsed_ms)
            .bind(write.limit_ms)
            .execute(&mut *tx)
            .await?;

            if write.enqueue_execution {
                insert_execution_job(&mut tx, write.base.run_id, write.base.skip_retrying).await?;
            }
        }
        tx.commit().await?;
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
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE runs
            SET execution_duration_ms = execution_duration_ms + $2,
                execution_count = execution_count + 1,
                force_yield_immediately = FALSE
            WHERE id = $1 AND completed_at IS NULL
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(duration_ms)
        .fetch_optional(&mut *tx)
        .await?;

        if updated.is_some() {
            sqlx::query("UPDATE endpoints SET run_chunk_execution_limit_ms = $2 WHERE id = $1")
                .bind(endpoint_id)
                .bind(chunk_limit_ms)
                .execute(&mut *tx)
                .await?;
            insert_execution_job(&mut tx, id, skip_retrying).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn latest_task_and_count(&self, id: RunId) -> StoreResult<(Option<Task>, i64)> {
        let latest = sqlx::query(
            "SELECT * FROM tasks WHERE run_id = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(task_from_row)
        .transpose()?;

        let count: i64 = sqlx::query("SELECT COUNT(*) AS count FROM tasks WHERE run_id = $1")
            .bind(id)
            .fetch_one(&self.pool)
            .await?
            .try_get("count")?;

        Ok((latest, count))
    }

    async fn set_force_yield(&self, id: RunId, value: bool) -> StoreResult<()> {
        sqlx::query(
            "UPDATE runs SET force_yield_immediately = $2 WHERE id = $1 AND completed_at IS NULL",
        )
        .bind(id)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn enqueue(&self, job: QueueJob, run_at: Option<DateTime<Utc>>) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        insert_job(&mut tx, &job, run_at).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn claim_due_jobs(&self, limit: i64) -> StoreResult<Vec<ClaimedJob>> {
        let lock_expires_at = Utc::now() + chrono::Duration::seconds(JOB_LEASE_SECONDS);
        let rows = sqlx::query(
            r#"
            WITH due AS (
                SELECT id FROM job_queue
                WHERE completed_at IS NULL
                  AND claimed_at IS NULL
                  AND scheduled_at <= NOW()
                ORDER BY scheduled_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE job_queue AS q
            SET claimed_at = NOW(), lock_expires_at = $2
            FROM due
            WHERE q.id = due.id
            RETURNING q.id, q.payload, q.scheduled_at, q.attempts
            "#,
        )
        .bind(limit)
        .bind(lock_expires_at)
        .fetch_all(&self.pool)
        .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let id: Uuid = row.try_get("id")?;
            let payload: Value = row.try_get("payload")?;
            match serde_json::from_value::<QueueJob>(payload) {
                Ok(job) => claimed.push(ClaimedJob {
                    id,
                    job,
                    scheduled_at: row.try_get("scheduled_at")?,
                    attempts: row.try_get("attempts")?,
                }),
                Err(err) => {
                    // Poison message: park it as completed so it stops cycling.
                    warn!(job_id = %id, error = %err, "dropping undecodable queue payload");
                    sqlx::query("UPDATE job_queue SET completed_at = NOW() WHERE id = $1")
                        .bind(id)
                        .execute(&self.pool)
                        .await?;
                }
            }
        }
        Ok(claimed)
    }

    async fn complete_job(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query("UPDATE job_queue SET completed_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn retry_job(&self, id: Uuid, run_at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE job_queue
            SET claimed_at = NULL,
                lock_expires_at = NULL,
                attempts = attempts + 1,
                scheduled_at = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(run_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Uses the same `FOR UPDATE SKIP LOCKED` claim pattern as
    /// `claim_due_jobs` to avoid blocking under concurrent sweepers.
    async fn reclaim_expired_jobs(&self, limit: i64) -> StoreResult<usize> {
        if limit == 0 {
            return Ok(0);
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            r#"
            WITH expired AS (
                SELECT id FROM job_queue
                WHERE claimed_at IS NOT NULL
                  AND completed_at IS NULL
                  AND lock_expires_at <= $1
                ORDER BY lock_expires_at, scheduled_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE job_queue AS q
            SET claimed_at = NULL, lock_expires_at = NULL
            FROM expired
            WHERE q.id = expired.id
            RETURNING q.id
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(rows.len())
    }
}
