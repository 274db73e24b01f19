//! Execution start/finish events for the telemetry sink.
//!
//! The sink is an external collaborator; emission is best-effort and never
//! blocks or fails a chunk.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::models::{EnvironmentId, JobId, OrganizationId, ProjectId, RunId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionEventKind {
    Start,
    Finish,
}

#[derive(Debug, Clone)]
pub struct ExecutionEvent {
    pub kind: ExecutionEventKind,
    pub event_time: DateTime<Utc>,
    /// Delivered-at minus scheduled-at for the triggering message; zero for
    /// finish events.
    pub drift_ms: i64,
    pub organization_id: OrganizationId,
    pub environment_id: EnvironmentId,
    pub project_id: ProjectId,
    pub job_id: JobId,
    pub run_id: RunId,
}

#[async_trait]
pub trait ExecutionEventSink: Send + Sync {
    async fn create_execution_event(&self, event: ExecutionEvent) -> anyhow::Result<()>;
}

/// Default sink: structured log lines.
pub struct TracingEventSink;

#[async_trait]
impl ExecutionEventSink for TracingEventSink {
    async fn create_execution_event(&self, event: ExecutionEvent) -> anyhow::Result<()> {
        info!(
            kind = ?event.kind,
            run_id = %event.run_id,
            job_id = %event.job_id,
            drift_ms = event.drift_ms,
            "execution event"
        );
        Ok(())
    }
}

/// Test sink that records every event.
#[derive(Clone, Default)]
pub struct RecordingEventSink {
    events: Arc<Mutex<Vec<ExecutionEvent>>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ExecutionEvent> {
        self.events.lock().expect("event sink poisoned").clone()
    }
}

#[async_trait]
impl ExecutionEventSink for RecordingEventSink {
    async fn create_execution_event(&self, event: ExecutionEvent) -> anyhow::Result<()> {
        self.events.lock().expect("event sink poisoned").push(event);
        Ok(())
    }
}
