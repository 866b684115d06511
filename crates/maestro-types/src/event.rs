//! Execution lifecycle events.
//!
//! `WorkflowEvent` is broadcast to live subscribers through the core's
//! event bus and appended to the repository's event log as `EventRecord`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An observable event in the life of a workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    WorkflowStarted {
        execution_id: Uuid,
        workflow_name: String,
    },
    WorkflowCompleted {
        execution_id: Uuid,
        duration_ms: u64,
        steps_completed: u32,
    },
    WorkflowFailed {
        execution_id: Uuid,
        step_key: Option<String>,
        error: String,
    },
    WorkflowPaused {
        execution_id: Uuid,
    },
    WorkflowResumed {
        execution_id: Uuid,
        resume_count: u32,
    },
    WorkflowCancelled {
        execution_id: Uuid,
    },
    StepStarted {
        execution_id: Uuid,
        step_key: String,
        attempt: u32,
    },
    StepCompleted {
        execution_id: Uuid,
        step_key: String,
        duration_ms: u64,
    },
    StepFailed {
        execution_id: Uuid,
        step_key: String,
        error: String,
        will_retry: bool,
    },
    CheckpointCreated {
        execution_id: Uuid,
        checkpoint_id: Uuid,
        label: Option<String>,
    },
    CheckpointsInvalidated {
        execution_id: Uuid,
        reason: String,
        count: u32,
    },
}

impl WorkflowEvent {
    /// The execution this event belongs to.
    pub fn execution_id(&self) -> Uuid {
        match self {
            WorkflowEvent::WorkflowStarted { execution_id, .. }
            | WorkflowEvent::WorkflowCompleted { execution_id, .. }
            | WorkflowEvent::WorkflowFailed { execution_id, .. }
            | WorkflowEvent::WorkflowPaused { execution_id }
            | WorkflowEvent::WorkflowResumed { execution_id, .. }
            | WorkflowEvent::WorkflowCancelled { execution_id }
            | WorkflowEvent::StepStarted { execution_id, .. }
            | WorkflowEvent::StepCompleted { execution_id, .. }
            | WorkflowEvent::StepFailed { execution_id, .. }
            | WorkflowEvent::CheckpointCreated { execution_id, .. }
            | WorkflowEvent::CheckpointsInvalidated { execution_id, .. } => *execution_id,
        }
    }
}

/// A row in the append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// UUIDv7 record ID (time-sortable).
    pub id: Uuid,
    /// Execution the event belongs to (denormalized for querying).
    pub execution_id: Uuid,
    /// The event payload.
    pub event: WorkflowEvent,
    /// When the event was recorded.
    pub recorded_at: DateTime<Utc>,
}

impl EventRecord {
    /// Wrap an event in a new log record stamped now.
    pub fn new(event: WorkflowEvent) -> Self {
        Self {
            id: Uuid::now_v7(),
            execution_id: event.execution_id(),
            event,
            recorded_at: Utc::now(),
        }
    }
}
