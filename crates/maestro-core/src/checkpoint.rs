//! Durable checkpoint management.
//!
//! A checkpoint captures everything needed to resume an execution at the
//! first incomplete level: the state machine snapshot, the serialized
//! context, and the completed/pending step-key sets. Checkpoints are
//! write-once; on workflow failure they are soft-invalidated (reason +
//! timestamp, retained for audit) so a naive resume cannot silently
//! continue from state that is known to have led to failure. Retention
//! pruning is the only hard delete.

use std::collections::BTreeSet;

use chrono::Utc;
use maestro_types::event::{EventRecord, WorkflowEvent};
use maestro_types::workflow::{
    Checkpoint, CheckpointInvalidation, StepExecutionRecord, StepState,
};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::machine::{StateMachine, StateTransitionError};
use crate::repository::WorkflowRepository;

// ---------------------------------------------------------------------------
// Options / restored view
// ---------------------------------------------------------------------------

/// Caller-supplied metadata for a new checkpoint.
#[derive(Debug, Clone, Default)]
pub struct CheckpointOptions {
    /// Human-readable label (e.g. "level 2").
    pub label: Option<String>,
    /// Who created the checkpoint; defaults to "orchestrator".
    pub created_by: Option<String>,
}

/// The in-memory state reconstructed from a checkpoint.
#[derive(Debug)]
pub struct RestoredExecution {
    /// Execution the snapshot belongs to.
    pub execution_id: Uuid,
    /// Reconstructed state machine.
    pub machine: StateMachine,
    /// Reconstructed execution context.
    pub context: ExecutionContext,
    /// Steps already completed at snapshot time.
    pub completed_steps: BTreeSet<String>,
    /// Steps still pending at snapshot time.
    pub pending_steps: BTreeSet<String>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from checkpoint operations.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint repository error: {0}")]
    Repository(String),

    #[error("checkpoint not found: {0}")]
    NotFound(Uuid),

    #[error("checkpoint {id} was invalidated: {reason}")]
    Invalidated { id: Uuid, reason: String },

    #[error(transparent)]
    Machine(#[from] StateTransitionError),

    #[error("checkpoint context error: {0}")]
    Context(String),
}

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Creates, restores, invalidates, and prunes execution checkpoints.
///
/// Generic over `R: WorkflowRepository` so it works with any storage
/// backend. Also carries the step-record bookkeeping helpers the scheduler
/// persists through.
pub struct CheckpointManager<R: WorkflowRepository> {
    repo: R,
}

impl<R: WorkflowRepository> CheckpointManager<R> {
    /// Create a new checkpoint manager backed by the given repository.
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    /// Serialize the machine, context, and step sets into a durable
    /// checkpoint.
    pub async fn create_checkpoint(
        &self,
        execution_id: Uuid,
        machine: &StateMachine,
        context: &ExecutionContext,
        completed_steps: &BTreeSet<String>,
        pending_steps: &BTreeSet<String>,
        options: CheckpointOptions,
    ) -> Result<Checkpoint, CheckpointError> {
        let checkpoint = Checkpoint {
            id: Uuid::now_v7(),
            execution_id,
            machine: machine.snapshot(),
            context: context.to_json(),
            completed_steps: completed_steps.clone(),
            pending_steps: pending_steps.clone(),
            label: options.label,
            created_by: options.created_by.unwrap_or_else(|| "orchestrator".to_string()),
            created_at: Utc::now(),
            invalidated: None,
        };

        self.repo
            .create_checkpoint(&checkpoint)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        self.repo
            .append_event(&EventRecord::new(WorkflowEvent::CheckpointCreated {
                execution_id,
                checkpoint_id: checkpoint.id,
                label: checkpoint.label.clone(),
            }))
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(
            execution_id = %execution_id,
            checkpoint_id = %checkpoint.id,
            label = checkpoint.label.as_deref().unwrap_or(""),
            completed = checkpoint.completed_steps.len(),
            pending = checkpoint.pending_steps.len(),
            "created checkpoint"
        );

        Ok(checkpoint)
    }

    /// Reconstruct the in-memory execution state from a prior snapshot.
    ///
    /// Refuses invalidated checkpoints, surfacing the recorded reason.
    pub async fn restore_checkpoint(
        &self,
        checkpoint_id: Uuid,
    ) -> Result<RestoredExecution, CheckpointError> {
        let checkpoint = self
            .repo
            .get_checkpoint(&checkpoint_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?
            .ok_or(CheckpointError::NotFound(checkpoint_id))?;

        if let Some(invalidation) = &checkpoint.invalidated {
            return Err(CheckpointError::Invalidated {
                id: checkpoint_id,
                reason: invalidation.reason.clone(),
            });
        }

        let machine = StateMachine::from_snapshot(checkpoint.machine)?;
        let context = ExecutionContext::from_json(checkpoint.context)
            .map_err(|e| CheckpointError::Context(e.to_string()))?;

        tracing::info!(
            execution_id = %checkpoint.execution_id,
            checkpoint_id = %checkpoint_id,
            completed = checkpoint.completed_steps.len(),
            "restored checkpoint"
        );

        Ok(RestoredExecution {
            execution_id: checkpoint.execution_id,
            machine,
            context,
            completed_steps: checkpoint.completed_steps,
            pending_steps: checkpoint.pending_steps,
        })
    }

    /// Soft-invalidate every usable checkpoint of an execution.
    ///
    /// Returns how many checkpoints were invalidated.
    pub async fn invalidate_for_execution(
        &self,
        execution_id: Uuid,
        reason: &str,
    ) -> Result<u32, CheckpointError> {
        let checkpoints = self
            .repo
            .list_checkpoints(&execution_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        let invalidation = CheckpointInvalidation {
            reason: reason.to_string(),
            at: Utc::now(),
        };

        let mut count = 0u32;
        for checkpoint in checkpoints.iter().filter(|c| c.is_usable()) {
            self.repo
                .mark_checkpoint_invalidated(&checkpoint.id, &invalidation)
                .await
                .map_err(|e| CheckpointError::Repository(e.to_string()))?;
            count += 1;
        }

        if count > 0 {
            self.repo
                .append_event(&EventRecord::new(WorkflowEvent::CheckpointsInvalidated {
                    execution_id,
                    reason: reason.to_string(),
                    count,
                }))
                .await
                .map_err(|e| CheckpointError::Repository(e.to_string()))?;
        }

        tracing::info!(
            execution_id = %execution_id,
            count,
            reason,
            "invalidated checkpoints"
        );

        Ok(count)
    }

    /// Delete all but the most recent `keep_latest` checkpoints.
    ///
    /// Returns how many checkpoints were deleted.
    pub async fn prune_checkpoints(
        &self,
        execution_id: Uuid,
        keep_latest: usize,
    ) -> Result<u32, CheckpointError> {
        let checkpoints = self
            .repo
            .list_checkpoints(&execution_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        let mut deleted = 0u32;
        for checkpoint in checkpoints.iter().skip(keep_latest) {
            if self
                .repo
                .delete_checkpoint(&checkpoint.id)
                .await
                .map_err(|e| CheckpointError::Repository(e.to_string()))?
            {
                deleted += 1;
            }
        }

        if deleted > 0 {
            tracing::debug!(execution_id = %execution_id, deleted, "pruned checkpoints");
        }
        Ok(deleted)
    }

    // -----------------------------------------------------------------------
    // Step-record bookkeeping
    // -----------------------------------------------------------------------

    /// Record a step as started. Returns the record's ID for later updates.
    ///
    /// A step re-attempted after a resume reuses its existing record (one
    /// record per step; the retry counter accumulates in place).
    pub async fn record_step_start(
        &self,
        execution_id: Uuid,
        step_key: &str,
    ) -> Result<Uuid, CheckpointError> {
        let existing = self
            .repo
            .list_step_records(&execution_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?
            .into_iter()
            .find(|r| r.step_key == step_key);
        if let Some(record) = existing {
            self.repo
                .update_step_record(&record.id, StepState::Running, record.retries, None, None, None)
                .await
                .map_err(|e| CheckpointError::Repository(e.to_string()))?;
            return Ok(record.id);
        }

        let record_id = Uuid::now_v7();
        let record = StepExecutionRecord {
            id: record_id,
            execution_id,
            step_key: step_key.to_string(),
            state: StepState::Running,
            result: None,
            error: None,
            retries: 0,
            duration_ms: None,
            started_at: Some(Utc::now()),
            completed_at: None,
        };
        self.repo
            .create_step_record(&record)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;
        Ok(record_id)
    }

    /// Bump a running step's retry counter in place.
    pub async fn record_step_retry(
        &self,
        record_id: Uuid,
        retries: u32,
    ) -> Result<(), CheckpointError> {
        self.repo
            .update_step_record(&record_id, StepState::Running, retries, None, None, None)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    /// Record a step as completed with its result.
    pub async fn record_step_completed(
        &self,
        record_id: Uuid,
        retries: u32,
        result: &Value,
        duration_ms: u64,
    ) -> Result<(), CheckpointError> {
        self.repo
            .update_step_record(
                &record_id,
                StepState::Completed,
                retries,
                Some(result),
                None,
                Some(duration_ms),
            )
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    /// Record a step as failed after exhausting its attempts.
    pub async fn record_step_failed(
        &self,
        record_id: Uuid,
        retries: u32,
        error: &str,
        duration_ms: u64,
    ) -> Result<(), CheckpointError> {
        self.repo
            .update_step_record(
                &record_id,
                StepState::Failed,
                retries,
                None,
                Some(error),
                Some(duration_ms),
            )
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    /// Record a step that never started because the execution aborted first.
    pub async fn record_step_skipped(
        &self,
        execution_id: Uuid,
        step_key: &str,
    ) -> Result<(), CheckpointError> {
        let record = StepExecutionRecord {
            id: Uuid::now_v7(),
            execution_id,
            step_key: step_key.to_string(),
            state: StepState::Skipped,
            result: None,
            error: None,
            retries: 0,
            duration_ms: None,
            started_at: None,
            completed_at: Some(Utc::now()),
        };
        self.repo
            .create_step_record(&record)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{MemRepo, executing_machine, seeded_context};
    use serde_json::json;

    fn manager() -> CheckpointManager<MemRepo> {
        CheckpointManager::new(MemRepo::new())
    }

    fn sets(
        completed: &[&str],
        pending: &[&str],
    ) -> (BTreeSet<String>, BTreeSet<String>) {
        (
            completed.iter().map(|s| s.to_string()).collect(),
            pending.iter().map(|s| s.to_string()).collect(),
        )
    }

    // -----------------------------------------------------------------------
    // Round trip
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_checkpoint_roundtrips_exactly() {
        let manager = manager();
        let execution_id = Uuid::now_v7();
        let machine = executing_machine();
        let mut context = seeded_context(execution_id);
        context.set_step_result("gather", json!("news")).unwrap();
        let (completed, pending) = sets(&["gather"], &["analyze", "publish"]);

        let checkpoint = manager
            .create_checkpoint(
                execution_id,
                &machine,
                &context,
                &completed,
                &pending,
                CheckpointOptions {
                    label: Some("level 0".to_string()),
                    created_by: Some("scheduler".to_string()),
                },
            )
            .await
            .unwrap();

        assert_eq!(checkpoint.created_by, "scheduler");

        let restored = manager.restore_checkpoint(checkpoint.id).await.unwrap();
        assert_eq!(restored.execution_id, execution_id);
        assert_eq!(restored.machine, machine);
        assert_eq!(restored.completed_steps, completed);
        assert_eq!(restored.pending_steps, pending);
        assert_eq!(restored.context.get("gather"), Some(&json!("news")));
        assert_eq!(restored.context.to_json(), context.to_json());
    }

    #[tokio::test]
    async fn test_restore_missing_checkpoint() {
        let manager = manager();
        let err = manager.restore_checkpoint(Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, CheckpointError::NotFound(_)));
    }

    // -----------------------------------------------------------------------
    // Invalidation
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_invalidated_checkpoint_refuses_restore() {
        let manager = manager();
        let execution_id = Uuid::now_v7();
        let machine = executing_machine();
        let context = seeded_context(execution_id);
        let (completed, pending) = sets(&[], &["a"]);

        let checkpoint = manager
            .create_checkpoint(
                execution_id,
                &machine,
                &context,
                &completed,
                &pending,
                CheckpointOptions::default(),
            )
            .await
            .unwrap();

        let count = manager
            .invalidate_for_execution(execution_id, "step 'a' failed")
            .await
            .unwrap();
        assert_eq!(count, 1);

        let err = manager.restore_checkpoint(checkpoint.id).await.unwrap_err();
        match err {
            CheckpointError::Invalidated { reason, .. } => {
                assert!(reason.contains("step 'a' failed"));
            }
            other => panic!("expected invalidated, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalidation_is_idempotent_per_checkpoint() {
        let manager = manager();
        let execution_id = Uuid::now_v7();
        let machine = executing_machine();
        let context = seeded_context(execution_id);
        let (completed, pending) = sets(&[], &["a"]);

        manager
            .create_checkpoint(
                execution_id,
                &machine,
                &context,
                &completed,
                &pending,
                CheckpointOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(
            manager
                .invalidate_for_execution(execution_id, "first")
                .await
                .unwrap(),
            1
        );
        // Already invalidated: nothing left to mark.
        assert_eq!(
            manager
                .invalidate_for_execution(execution_id, "second")
                .await
                .unwrap(),
            0
        );
    }

    // -----------------------------------------------------------------------
    // Retention
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_prune_keeps_latest() {
        let manager = manager();
        let execution_id = Uuid::now_v7();
        let machine = executing_machine();
        let context = seeded_context(execution_id);
        let (completed, pending) = sets(&[], &["a"]);

        let mut ids = Vec::new();
        for i in 0..4 {
            let checkpoint = manager
                .create_checkpoint(
                    execution_id,
                    &machine,
                    &context,
                    &completed,
                    &pending,
                    CheckpointOptions {
                        label: Some(format!("level {i}")),
                        created_by: None,
                    },
                )
                .await
                .unwrap();
            ids.push(checkpoint.id);
        }

        let deleted = manager.prune_checkpoints(execution_id, 2).await.unwrap();
        assert_eq!(deleted, 2);

        let remaining = manager.repo().list_checkpoints(&execution_id).await.unwrap();
        assert_eq!(remaining.len(), 2);
        // Newest-first listing: the two most recent survive.
        assert_eq!(remaining[0].id, ids[3]);
        assert_eq!(remaining[1].id, ids[2]);
    }
}
