//! Persistence port for the orchestration core.
//!
//! Defines the storage interface for workflow definitions, executions, step
//! records, checkpoints, and the append-only event log. The infrastructure
//! layer implements this trait; the core treats every operation as durable
//! and crash-consistent.
//!
//! Uses native async fn in traits (RPITIT), no `async_trait` macro.

use chrono::{DateTime, Utc};
use maestro_types::error::RepositoryError;
use maestro_types::event::EventRecord;
use maestro_types::workflow::{
    Checkpoint, CheckpointInvalidation, ExecutionFailure, ExecutionState, StepExecutionRecord,
    StepState, WorkflowDefinition, WorkflowExecution,
};
use uuid::Uuid;

/// Repository trait for orchestration persistence.
///
/// Covers five entity families:
/// - **Definitions:** CRUD for workflow definitions.
/// - **Executions:** create/update/query execution instances.
/// - **Step records:** per-step attempt bookkeeping.
/// - **Checkpoints:** write-once snapshots with soft invalidation.
/// - **Events:** append-only event log.
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Upsert a workflow definition (insert or replace by ID).
    fn save_definition(
        &self,
        definition: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a workflow definition by its UUID.
    fn get_definition(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// List all workflow definitions.
    fn list_definitions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;

    /// Delete a workflow definition by ID. Returns `true` if it existed.
    fn delete_definition(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Create a new execution record.
    fn create_execution(
        &self,
        execution: &WorkflowExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Update an execution's state (and optionally its failure and
    /// completion time).
    fn update_execution_state(
        &self,
        execution_id: &Uuid,
        state: ExecutionState,
        error: Option<&ExecutionFailure>,
        completed_at: Option<DateTime<Utc>>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get an execution by its UUID.
    fn get_execution(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowExecution>, RepositoryError>> + Send;

    /// List executions left in a non-terminal state (crash recovery).
    fn list_interrupted_executions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowExecution>, RepositoryError>> + Send;

    /// Increment an execution's resume counter; returns the new value.
    fn increment_resume_count(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<u32, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Step records
    // -----------------------------------------------------------------------

    /// Create a new step execution record.
    fn create_step_record(
        &self,
        record: &StepExecutionRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Update a step record's status and bookkeeping in place.
    fn update_step_record(
        &self,
        record_id: &Uuid,
        state: StepState,
        retries: u32,
        result: Option<&serde_json::Value>,
        error: Option<&str>,
        duration_ms: Option<u64>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List all step records for an execution.
    fn list_step_records(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepExecutionRecord>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    /// Persist a new checkpoint. Checkpoints are write-once.
    fn create_checkpoint(
        &self,
        checkpoint: &Checkpoint,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a checkpoint by its UUID.
    fn get_checkpoint(
        &self,
        checkpoint_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Checkpoint>, RepositoryError>> + Send;

    /// List an execution's checkpoints, newest first.
    fn list_checkpoints(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<Checkpoint>, RepositoryError>> + Send;

    /// Mark a checkpoint as invalidated (soft delete, retained for audit).
    fn mark_checkpoint_invalidated(
        &self,
        checkpoint_id: &Uuid,
        invalidation: &CheckpointInvalidation,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Hard-delete a checkpoint (retention pruning only). Returns `true` if
    /// it existed.
    fn delete_checkpoint(
        &self,
        checkpoint_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Event log
    // -----------------------------------------------------------------------

    /// Append an event to the log. The log is append-only.
    fn append_event(
        &self,
        record: &EventRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List an execution's events in append order.
    fn list_events(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<EventRecord>, RepositoryError>> + Send;
}
