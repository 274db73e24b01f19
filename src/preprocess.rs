//! The PREPROCESS step.
//!
//! One call to the endpoint's preprocess route decides whether the run goes
//! anywhere: an abort finishes it, any malformed or failed response falls
//! through the preprocess failure path, and a healthy response transitions
//! the run to STARTED with an EXECUTE_JOB enqueued. The endpoint is never
//! retried from here.

use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use crate::endpoint::{
    AccountInfo, CallOutcome, EndpointGateway, EnvironmentInfo, EventEnvelope, JobIdentity,
    OrganizationInfo, PreprocessRequest, PreprocessResponse, RunIdentity,
};
use crate::models::{RunAggregate, RunId, RunStatus};
use crate::store::{CoordinatorStore, FailExecution, FailureReason, StoreResult};

pub struct PreprocessDriver {
    store: Arc<dyn CoordinatorStore>,
    gateway: Arc<dyn EndpointGateway>,
}

impl PreprocessDriver {
    pub fn new(store: Arc<dyn CoordinatorStore>, gateway: Arc<dyn EndpointGateway>) -> Self {
        Self { store, gateway }
    }

    pub async fn preprocess(&self, run_id: RunId) -> StoreResult<()> {
        let Some(aggregate) = self.store.load_run(run_id).await? else {
            debug!(run_id = %run_id, "preprocess for unknown run, ignoring");
            return Ok(());
        };
        if aggregate.run.status.is_terminal() {
            return Ok(());
        }

        let body = build_preprocess_request(&aggregate);
        let call = self.gateway.preprocess(&aggregate.endpoint, &body).await;

        let parts = match call.outcome {
            CallOutcome::Response(parts) => parts,
            CallOutcome::NoResponse { error } | CallOutcome::TimedOut { error } => {
                return self
                    .fail(
                        &aggregate,
                        RunStatus::Failure,
                        json!({ "message": format!("Could not reach endpoint: {error}") }),
                    )
                    .await;
            }
        };

        if !parts.is_success() {
            return self
                .fail(
                    &aggregate,
                    RunStatus::Failure,
                    json!({
                        "message": format!(
                            "Endpoint responded with {} status during preprocessing",
                            parts.status
                        )
                    }),
                )
                .await;
        }

        let response = match serde_json::from_str::<PreprocessResponse>(&parts.body) {
            Ok(response) => response,
            Err(err) => {
                return self
                    .fail(
                        &aggregate,
                        RunStatus::Failure,
                        json!({
                            "message": format!("Endpoint returned an invalid preprocess body: {err}")
                        }),
                    )
                    .await;
            }
        };

        if response.abort {
            return self
                .fail(
                    &aggregate,
                    RunStatus::Aborted,
                    json!({ "message": "Endpoint aborted the run during preprocessing" }),
                )
                .await;
        }

        self.store
            .start_run(run_id, response.properties, aggregate.skip_retrying())
            .await
    }

    async fn fail(
        &self,
        aggregate: &RunAggregate,
        status: RunStatus,
        output: serde_json::Value,
    ) -> StoreResult<()> {
        self.store
            .fail_execution(FailExecution {
                reason: FailureReason::Preprocess,
                run_id: aggregate.run.id,
                status,
                output,
                duration_ms: 0,
                skip_retrying: aggregate.skip_retrying(),
            })
            .await
    }
}

pub(crate) fn build_preprocess_request(aggregate: &RunAggregate) -> PreprocessRequest {
    PreprocessRequest {
        event: event_envelope(aggregate),
        job: JobIdentity {
            id: aggregate.version.job_slug.clone(),
            version: aggregate.version.version.clone(),
        },
        run: RunIdentity {
            id: aggregate.run.id,
            is_test: aggregate.run.is_test,
            started_at: None,
            is_retry: None,
        },
        environment: EnvironmentInfo {
            id: aggregate.environment.id.to_string(),
            slug: aggregate.environment.slug.clone(),
            env_type: aggregate.environment.env_type.as_str().to_string(),
        },
        organization: OrganizationInfo {
            id: aggregate.organization.id.to_string(),
            slug: aggregate.organization.slug.clone(),
        },
        account: aggregate.external_account.as_ref().map(|account| AccountInfo {
            id: account.identifier.clone(),
            metadata: account.metadata.clone(),
        }),
    }
}

pub(crate) fn event_envelope(aggregate: &RunAggregate) -> EventEnvelope {
    EventEnvelope {
        id: aggregate.event.id.to_string(),
        name: aggregate.event.name.clone(),
        payload: aggregate.event.payload.clone(),
        context: aggregate.event.context.clone(),
        timestamp: aggregate.event.timestamp,
    }
}
