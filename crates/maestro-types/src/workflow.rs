//! Workflow domain types for Maestro.
//!
//! Defines the canonical semantic model for workflows: the immutable
//! `WorkflowDefinition` (what a definition source of any encoding must
//! produce), execution tracking types (`WorkflowExecution`,
//! `StepExecutionRecord`), and the durable snapshot types
//! (`MachineSnapshot`, `Checkpoint`) that make a run resumable.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow Definition (canonical semantic model)
// ---------------------------------------------------------------------------

/// The canonical workflow definition.
///
/// Definition sources (YAML files, API payloads, database rows) all convert
/// to this struct. It is created once and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// UUIDv7 assigned on first save.
    pub id: Uuid,
    /// Human-readable workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Optional author attribution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Free-form tags for discovery.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Ordered list of step definitions forming the workflow DAG.
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowDefinition {
    /// Look up a step by its key.
    pub fn step(&self, key: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.key == key)
    }

    /// The set of all step keys, in a deterministic order.
    pub fn step_keys(&self) -> BTreeSet<String> {
        self.steps.iter().map(|s| s.key.clone()).collect()
    }
}

/// A single step in the workflow DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// User-defined step key (e.g. "gather-news"). Unique within a workflow.
    pub key: String,
    /// Prompt template text; `{{path}}` placeholders resolve against the
    /// execution context at dispatch time.
    pub prompt: String,
    /// Step keys this step depends on (DAG edges).
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Explicit agent assignment. When absent the dispatcher picks one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Whether a failure of this step is tolerated rather than fatal.
    #[serde(default)]
    pub optional: bool,
    /// Maximum number of attempts (default 3).
    #[serde(default = "default_retries")]
    pub retries: u32,
}

fn default_retries() -> u32 {
    3
}

// ---------------------------------------------------------------------------
// Execution lifecycle state
// ---------------------------------------------------------------------------

/// Lifecycle state of one workflow execution.
///
/// `Completed`, `Failed`, and `Cancelled` are terminal: no transition
/// leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Idle,
    Parsing,
    Validating,
    Executing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionState {
    /// Whether this state has no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Completed | ExecutionState::Failed | ExecutionState::Cancelled
        )
    }
}

/// The failure recorded when an execution ends in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    /// Key of the step whose failure aborted the run, if a step was at fault.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_key: Option<String>,
    /// Human-readable failure message.
    pub message: String,
}

// ---------------------------------------------------------------------------
// Workflow Execution (audit / query record)
// ---------------------------------------------------------------------------

/// A single execution instance of a workflow.
///
/// Mutated only by the orchestration state machine; immutable once the state
/// is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// UUIDv7 execution ID.
    pub id: Uuid,
    /// ID of the workflow definition being executed.
    pub workflow_id: Uuid,
    /// Name of the workflow (denormalized for display).
    pub workflow_name: String,
    /// Current lifecycle state.
    pub state: ExecutionState,
    /// When the execution started.
    pub started_at: DateTime<Utc>,
    /// When the execution reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// The recorded failure, if the execution failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionFailure>,
    /// How many times this execution has been resumed from a checkpoint.
    #[serde(default)]
    pub resume_count: u32,
}

// ---------------------------------------------------------------------------
// Step execution records
// ---------------------------------------------------------------------------

/// Status of an individual step within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Per-step execution record.
///
/// One record per step per execution: the `retries` counter accumulates in
/// place rather than producing a new record per attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecutionRecord {
    /// UUIDv7 record ID.
    pub id: Uuid,
    /// Parent execution ID.
    pub execution_id: Uuid,
    /// Step key matching `WorkflowStep.key`.
    pub step_key: String,
    /// Current step status.
    pub state: StepState,
    /// JSON result produced by the step, if it completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error message if the step failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Retry attempts used beyond the first (0 when the first attempt settled).
    #[serde(default)]
    pub retries: u32,
    /// Wall-clock duration of the settled step, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// When step execution started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When step execution settled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Machine snapshot
// ---------------------------------------------------------------------------

/// Current snapshot schema version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Versioned, pure-data serialization of the orchestration state machine.
///
/// Deliberately free of transient concurrency handles: only the lifecycle
/// state and its bookkeeping fields survive serialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSnapshot {
    /// Snapshot schema version (`SNAPSHOT_VERSION` at write time).
    pub version: u32,
    /// Lifecycle state at snapshot time.
    pub state: ExecutionState,
    /// Recorded failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionFailure>,
    /// Resume counter at snapshot time.
    #[serde(default)]
    pub resume_count: u32,
    /// When the execution started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the execution reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

/// Soft-invalidation marker on a checkpoint.
///
/// Invalidated checkpoints are retained for audit but refuse restoration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointInvalidation {
    /// Why the checkpoint was invalidated (e.g. the failing step).
    pub reason: String,
    /// When it was invalidated.
    pub at: DateTime<Utc>,
}

/// A durable, write-once snapshot of an execution.
///
/// Sufficient to reconstruct the state machine, context, and step-completion
/// sets and hand control back to the scheduler at the first incomplete level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// UUIDv7 checkpoint ID (time-sortable: newest has the greatest ID).
    pub id: Uuid,
    /// Execution this checkpoint belongs to.
    pub execution_id: Uuid,
    /// Serialized state machine.
    pub machine: MachineSnapshot,
    /// Serialized execution context.
    pub context: serde_json::Value,
    /// Keys of steps that completed successfully.
    pub completed_steps: BTreeSet<String>,
    /// Keys of steps not yet completed.
    pub pending_steps: BTreeSet<String>,
    /// Optional human-readable label (e.g. "level 2").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Who created the checkpoint ("scheduler", "pause", a caller name).
    pub created_by: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Soft-invalidation marker; `None` while the checkpoint is usable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalidated: Option<CheckpointInvalidation>,
}

impl Checkpoint {
    /// Whether this checkpoint can still be restored.
    pub fn is_usable(&self) -> bool {
        self.invalidated.is_none()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
