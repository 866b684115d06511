//! In-memory implementation of the core's `WorkflowRepository` port.
//!
//! Backed by `DashMap` for keyed records and `RwLock<Vec<_>>` for the
//! append-style collections. Suitable for tests, embedding, and
//! single-process deployments; a SQL-backed store plugs in behind the same
//! trait without touching the core.

use std::sync::RwLock;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use maestro_core::repository::WorkflowRepository;
use maestro_types::error::RepositoryError;
use maestro_types::event::EventRecord;
use maestro_types::workflow::{
    Checkpoint, CheckpointInvalidation, ExecutionFailure, ExecutionState, StepExecutionRecord,
    StepState, WorkflowDefinition, WorkflowExecution,
};
use serde_json::Value;
use uuid::Uuid;

/// Thread-safe in-memory store for orchestration state.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    definitions: DashMap<Uuid, WorkflowDefinition>,
    executions: DashMap<Uuid, WorkflowExecution>,
    step_records: RwLock<Vec<StepExecutionRecord>>,
    checkpoints: RwLock<Vec<Checkpoint>>,
    events: RwLock<Vec<EventRecord>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkflowRepository for MemoryRepository {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<(), RepositoryError> {
        self.definitions.insert(definition.id, definition.clone());
        Ok(())
    }

    async fn get_definition(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.definitions.get(id).map(|d| d.value().clone()))
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let mut definitions: Vec<WorkflowDefinition> =
            self.definitions.iter().map(|d| d.value().clone()).collect();
        definitions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(definitions)
    }

    async fn delete_definition(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(self.definitions.remove(id).is_some())
    }

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    async fn create_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
        if self.executions.contains_key(&execution.id) {
            return Err(RepositoryError::Conflict(format!(
                "execution {} already exists",
                execution.id
            )));
        }
        self.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn update_execution_state(
        &self,
        execution_id: &Uuid,
        state: ExecutionState,
        error: Option<&ExecutionFailure>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), RepositoryError> {
        let mut execution = self
            .executions
            .get_mut(execution_id)
            .ok_or(RepositoryError::NotFound)?;
        execution.state = state;
        if let Some(error) = error {
            execution.error = Some(error.clone());
        }
        if completed_at.is_some() {
            execution.completed_at = completed_at;
        }
        Ok(())
    }

    async fn get_execution(
        &self,
        execution_id: &Uuid,
    ) -> Result<Option<WorkflowExecution>, RepositoryError> {
        Ok(self.executions.get(execution_id).map(|e| e.value().clone()))
    }

    async fn list_interrupted_executions(&self) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let mut interrupted: Vec<WorkflowExecution> = self
            .executions
            .iter()
            .filter(|e| !e.state.is_terminal())
            .map(|e| e.value().clone())
            .collect();
        interrupted.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(interrupted)
    }

    async fn increment_resume_count(&self, execution_id: &Uuid) -> Result<u32, RepositoryError> {
        let mut execution = self
            .executions
            .get_mut(execution_id)
            .ok_or(RepositoryError::NotFound)?;
        execution.resume_count += 1;
        Ok(execution.resume_count)
    }

    // -----------------------------------------------------------------------
    // Step records
    // -----------------------------------------------------------------------

    async fn create_step_record(&self, record: &StepExecutionRecord) -> Result<(), RepositoryError> {
        self.step_records
            .write()
            .expect("step records lock poisoned")
            .push(record.clone());
        Ok(())
    }

    async fn update_step_record(
        &self,
        record_id: &Uuid,
        state: StepState,
        retries: u32,
        result: Option<&Value>,
        error: Option<&str>,
        duration_ms: Option<u64>,
    ) -> Result<(), RepositoryError> {
        let mut records = self.step_records.write().expect("step records lock poisoned");
        let record = records
            .iter_mut()
            .find(|r| &r.id == record_id)
            .ok_or(RepositoryError::NotFound)?;
        record.state = state;
        record.retries = retries;
        if let Some(result) = result {
            record.result = Some(result.clone());
        }
        if let Some(error) = error {
            record.error = Some(error.to_string());
        }
        if duration_ms.is_some() {
            record.duration_ms = duration_ms;
        }
        record.completed_at = match state {
            StepState::Completed | StepState::Failed | StepState::Skipped => Some(Utc::now()),
            StepState::Pending | StepState::Running => None,
        };
        Ok(())
    }

    async fn list_step_records(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<StepExecutionRecord>, RepositoryError> {
        Ok(self
            .step_records
            .read()
            .expect("step records lock poisoned")
            .iter()
            .filter(|r| &r.execution_id == execution_id)
            .cloned()
            .collect())
    }

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    async fn create_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        self.checkpoints
            .write()
            .expect("checkpoints lock poisoned")
            .push(checkpoint.clone());
        Ok(())
    }

    async fn get_checkpoint(
        &self,
        checkpoint_id: &Uuid,
    ) -> Result<Option<Checkpoint>, RepositoryError> {
        Ok(self
            .checkpoints
            .read()
            .expect("checkpoints lock poisoned")
            .iter()
            .find(|c| &c.id == checkpoint_id)
            .cloned())
    }

    async fn list_checkpoints(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<Checkpoint>, RepositoryError> {
        // Insertion order is creation order; newest first means reversed.
        let mut checkpoints: Vec<Checkpoint> = self
            .checkpoints
            .read()
            .expect("checkpoints lock poisoned")
            .iter()
            .filter(|c| &c.execution_id == execution_id)
            .cloned()
            .collect();
        checkpoints.reverse();
        Ok(checkpoints)
    }

    async fn mark_checkpoint_invalidated(
        &self,
        checkpoint_id: &Uuid,
        invalidation: &CheckpointInvalidation,
    ) -> Result<(), RepositoryError> {
        let mut checkpoints = self.checkpoints.write().expect("checkpoints lock poisoned");
        let checkpoint = checkpoints
            .iter_mut()
            .find(|c| &c.id == checkpoint_id)
            .ok_or(RepositoryError::NotFound)?;
        checkpoint.invalidated = Some(invalidation.clone());
        Ok(())
    }

    async fn delete_checkpoint(&self, checkpoint_id: &Uuid) -> Result<bool, RepositoryError> {
        let mut checkpoints = self.checkpoints.write().expect("checkpoints lock poisoned");
        let before = checkpoints.len();
        checkpoints.retain(|c| &c.id != checkpoint_id);
        Ok(checkpoints.len() < before)
    }

    // -----------------------------------------------------------------------
    // Event log
    // -----------------------------------------------------------------------

    async fn append_event(&self, record: &EventRecord) -> Result<(), RepositoryError> {
        self.events
            .write()
            .expect("events lock poisoned")
            .push(record.clone());
        Ok(())
    }

    async fn list_events(&self, execution_id: &Uuid) -> Result<Vec<EventRecord>, RepositoryError> {
        Ok(self
            .events
            .read()
            .expect("events lock poisoned")
            .iter()
            .filter(|e| &e.execution_id == execution_id)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests (repository behavior + end-to-end orchestration)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use maestro_core::dispatch::{AgentDispatcher, DispatchError, DispatchRequest};
    use maestro_core::executor::{Orchestrator, OrchestratorError, WorkflowEngine};
    use maestro_core::registry::AgentRegistry;
    use maestro_types::config::OrchestratorConfig;
    use maestro_types::event::WorkflowEvent;
    use maestro_types::workflow::WorkflowStep;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    // -----------------------------------------------------------------------
    // Fixtures
    // -----------------------------------------------------------------------

    fn step(key: &str, dependencies: &[&str]) -> WorkflowStep {
        WorkflowStep {
            key: key.to_string(),
            prompt: format!("run {key}"),
            dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
            agent: None,
            optional: false,
            retries: 1,
        }
    }

    fn diamond_definition() -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::now_v7(),
            name: "diamond".to_string(),
            description: None,
            author: None,
            tags: vec![],
            steps: vec![
                step("a", &[]),
                step("b", &["a"]),
                step("c", &["a"]),
                step("d", &["b", "c"]),
            ],
        }
    }

    /// Dispatcher with optional per-step delays and failures.
    #[derive(Debug, Default)]
    struct TestDispatcher {
        delays: DashMap<String, Duration>,
        failures: DashMap<String, String>,
    }

    impl TestDispatcher {
        fn new() -> Self {
            Self::default()
        }

        fn delay(&self, key: &str, delay: Duration) {
            self.delays.insert(key.to_string(), delay);
        }

        fn fail(&self, key: &str, message: &str) {
            self.failures.insert(key.to_string(), message.to_string());
        }
    }

    impl AgentDispatcher for TestDispatcher {
        async fn dispatch(
            &self,
            request: DispatchRequest,
            cancel: CancellationToken,
        ) -> Result<Value, DispatchError> {
            if let Some(delay) = self.delays.get(&request.step_key).map(|d| *d) {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if let Some(message) = self.failures.get(&request.step_key) {
                return Err(DispatchError::Failed(message.clone()));
            }
            Ok(json!(format!("{} result", request.step_key)))
        }
    }

    fn orchestrator(
        dispatcher: TestDispatcher,
    ) -> Arc<Orchestrator<MemoryRepository, TestDispatcher>> {
        Arc::new(Orchestrator::new(
            MemoryRepository::new(),
            dispatcher,
            AgentRegistry::new(),
            OrchestratorConfig::default(),
        ))
    }

    fn inputs() -> HashMap<String, Value> {
        HashMap::from([("topic".to_string(), json!("rust"))])
    }

    // -----------------------------------------------------------------------
    // Repository behavior
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_definition_crud() {
        let repo = MemoryRepository::new();
        let def = diamond_definition();

        repo.save_definition(&def).await.unwrap();
        assert!(repo.get_definition(&def.id).await.unwrap().is_some());
        assert_eq!(repo.list_definitions().await.unwrap().len(), 1);
        assert!(repo.delete_definition(&def.id).await.unwrap());
        assert!(!repo.delete_definition(&def.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_execution_is_a_conflict() {
        let repo = MemoryRepository::new();
        let execution = WorkflowExecution {
            id: Uuid::now_v7(),
            workflow_id: Uuid::now_v7(),
            workflow_name: "diamond".to_string(),
            state: ExecutionState::Executing,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            resume_count: 0,
        };
        repo.create_execution(&execution).await.unwrap();
        assert!(matches!(
            repo.create_execution(&execution).await,
            Err(RepositoryError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_checkpoints_list_newest_first() {
        let repo = MemoryRepository::new();
        let execution_id = Uuid::now_v7();
        let mut ids = Vec::new();
        for i in 0..3 {
            let checkpoint = Checkpoint {
                id: Uuid::now_v7(),
                execution_id,
                machine: maestro_types::workflow::MachineSnapshot {
                    version: maestro_types::workflow::SNAPSHOT_VERSION,
                    state: ExecutionState::Executing,
                    error: None,
                    resume_count: 0,
                    started_at: None,
                    completed_at: None,
                },
                context: json!({}),
                completed_steps: Default::default(),
                pending_steps: Default::default(),
                label: Some(format!("level {i}")),
                created_by: "scheduler".to_string(),
                created_at: Utc::now(),
                invalidated: None,
            };
            repo.create_checkpoint(&checkpoint).await.unwrap();
            ids.push(checkpoint.id);
        }

        let listed = repo.list_checkpoints(&execution_id).await.unwrap();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].id, ids[2]);
        assert_eq!(listed[2].id, ids[0]);
    }

    // -----------------------------------------------------------------------
    // End-to-end orchestration
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_diamond_workflow_end_to_end() {
        let orchestrator = orchestrator(TestDispatcher::new());
        let def = diamond_definition();

        let outcome = orchestrator.start(&def, inputs()).await.unwrap();
        assert_eq!(outcome.state, ExecutionState::Completed);
        assert_eq!(outcome.completed_steps.len(), 4);
        assert_eq!(outcome.context.get("d"), Some(&json!("d result")));

        let repo = orchestrator.checkpoints().repo();

        // One checkpoint per level survives (retention keeps 5).
        let checkpoints = repo.list_checkpoints(&outcome.execution_id).await.unwrap();
        assert_eq!(checkpoints.len(), 3);
        let labels: Vec<_> = checkpoints.iter().filter_map(|c| c.label.as_deref()).collect();
        assert_eq!(labels, vec!["level 2", "level 1", "level 0"]);

        // The event log tells the whole story in order.
        let events = repo.list_events(&outcome.execution_id).await.unwrap();
        assert!(matches!(
            events.first().unwrap().event,
            WorkflowEvent::WorkflowStarted { .. }
        ));
        assert!(matches!(
            events.last().unwrap().event,
            WorkflowEvent::WorkflowCompleted { .. }
        ));
        let step_completions = events
            .iter()
            .filter(|e| matches!(e.event, WorkflowEvent::StepCompleted { .. }))
            .count();
        assert_eq!(step_completions, 4);
    }

    #[tokio::test]
    async fn test_level_checkpoint_captures_level_boundary() {
        // For a 3-level workflow, the checkpoint taken after the first
        // level restores with completed == that level's steps and pending
        // == everything in the two later levels.
        let orchestrator = orchestrator(TestDispatcher::new());
        let def = diamond_definition();
        let outcome = orchestrator.start(&def, inputs()).await.unwrap();

        let repo = orchestrator.checkpoints().repo();
        let checkpoints = repo.list_checkpoints(&outcome.execution_id).await.unwrap();
        let level_zero = checkpoints
            .iter()
            .find(|c| c.label.as_deref() == Some("level 0"))
            .unwrap();

        let restored = orchestrator
            .checkpoints()
            .restore_checkpoint(level_zero.id)
            .await
            .unwrap();
        assert_eq!(restored.completed_steps.len(), 1);
        assert!(restored.completed_steps.contains("a"));
        assert_eq!(
            restored.pending_steps,
            ["b", "c", "d"].iter().map(|s| s.to_string()).collect()
        );
        assert_eq!(restored.context.get("a"), Some(&json!("a result")));
        assert_eq!(
            restored.machine.state(),
            ExecutionState::Executing,
            "mid-flight snapshot is still executing"
        );
    }

    #[tokio::test]
    async fn test_optional_failure_tolerated_end_to_end() {
        let dispatcher = TestDispatcher::new();
        dispatcher.fail("b", "provider down");
        let orchestrator = orchestrator(dispatcher);

        let mut def = WorkflowDefinition {
            id: Uuid::now_v7(),
            name: "tolerant".to_string(),
            description: None,
            author: None,
            tags: vec![],
            steps: vec![step("a", &[]), step("b", &[])],
        };
        def.steps[1].optional = true;

        let outcome = orchestrator.start(&def, inputs()).await.unwrap();
        assert_eq!(outcome.state, ExecutionState::Completed);
        assert!(outcome.completed_steps.contains("a"));
        assert!(!outcome.completed_steps.contains("b"));

        let records = orchestrator
            .checkpoints()
            .repo()
            .list_step_records(&outcome.execution_id)
            .await
            .unwrap();
        let b_record = records.iter().find(|r| r.step_key == "b").unwrap();
        assert_eq!(b_record.state, StepState::Failed);
        assert_eq!(b_record.error.as_deref(), Some("provider down"));
    }

    #[tokio::test]
    async fn test_required_failure_aborts_end_to_end() {
        let dispatcher = TestDispatcher::new();
        dispatcher.fail("b", "provider down");
        let orchestrator = orchestrator(dispatcher);

        let def = WorkflowDefinition {
            id: Uuid::now_v7(),
            name: "strict".to_string(),
            description: None,
            author: None,
            tags: vec![],
            steps: vec![step("a", &[]), step("b", &["a"]), step("c", &["b"])],
        };

        let err = orchestrator.start(&def, inputs()).await.unwrap_err();
        let execution_id = match &err {
            OrchestratorError::StepFailed {
                execution_id,
                step_key,
                ..
            } => {
                assert_eq!(step_key, "b");
                *execution_id
            }
            other => panic!("expected step failure, got {other:?}"),
        };

        // c never started; its record is skipped.
        let dispatched = orchestrator.checkpoints().repo();
        let records = dispatched.list_step_records(&execution_id).await.unwrap();
        let c_record = records.iter().find(|r| r.step_key == "c").unwrap();
        assert_eq!(c_record.state, StepState::Skipped);

        // All checkpoints are invalidated and resume is refused.
        let checkpoints = dispatched.list_checkpoints(&execution_id).await.unwrap();
        assert!(!checkpoints.is_empty());
        assert!(checkpoints.iter().all(|c| !c.is_usable()));
        let resume_err = orchestrator
            .resume_from_checkpoint(checkpoints[0].id, &def)
            .await
            .unwrap_err();
        assert!(matches!(resume_err, OrchestratorError::Checkpoint(_)));
    }

    #[tokio::test]
    async fn test_pause_parks_and_resume_continues() {
        let dispatcher = TestDispatcher::new();
        dispatcher.delay("a", Duration::from_millis(100));
        let orchestrator = orchestrator(dispatcher);

        let def = WorkflowDefinition {
            id: Uuid::now_v7(),
            name: "pausable".to_string(),
            description: None,
            author: None,
            tags: vec![],
            steps: vec![step("a", &[]), step("b", &["a"])],
        };

        let mut events = orchestrator.bus().subscribe();
        let handle = tokio::spawn({
            let orchestrator = Arc::clone(&orchestrator);
            let def = def.clone();
            async move { orchestrator.start(&def, inputs()).await }
        });

        // Pause as soon as the run announces itself; the in-flight level
        // settles and the run parks at the boundary.
        let execution_id = loop {
            if let WorkflowEvent::WorkflowStarted { execution_id, .. } = events.recv().await.unwrap()
            {
                break execution_id;
            }
        };
        orchestrator.pause(execution_id).await.unwrap();

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.state, ExecutionState::Paused);
        assert!(outcome.completed_steps.contains("a"));
        assert!(!outcome.completed_steps.contains("b"));

        // The pause checkpoint is the newest; resuming from it finishes the
        // run without re-dispatching "a".
        let repo = orchestrator.checkpoints().repo();
        let checkpoints = repo.list_checkpoints(&execution_id).await.unwrap();
        assert_eq!(checkpoints[0].label.as_deref(), Some("pause"));

        let resumed = orchestrator
            .resume_from_checkpoint(checkpoints[0].id, &def)
            .await
            .unwrap();
        assert_eq!(resumed.state, ExecutionState::Completed);
        assert_eq!(resumed.resume_count, 1);
        assert_eq!(resumed.completed_steps.len(), 2);

        let a_dispatches = orchestrator
            .checkpoints()
            .repo()
            .list_step_records(&execution_id)
            .await
            .unwrap()
            .iter()
            .filter(|r| r.step_key == "a")
            .count();
        assert_eq!(a_dispatches, 1, "one record per step across pause/resume");

        let execution = repo.get_execution(&execution_id).await.unwrap().unwrap();
        assert_eq!(execution.state, ExecutionState::Completed);
        assert_eq!(execution.resume_count, 1);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_in_flight_dispatch() {
        let dispatcher = TestDispatcher::new();
        dispatcher.delay("a", Duration::from_secs(30));
        let orchestrator = orchestrator(dispatcher);

        let def = WorkflowDefinition {
            id: Uuid::now_v7(),
            name: "cancellable".to_string(),
            description: None,
            author: None,
            tags: vec![],
            steps: vec![step("a", &[]), step("b", &["a"])],
        };

        let mut events = orchestrator.bus().subscribe();
        let handle = tokio::spawn({
            let orchestrator = Arc::clone(&orchestrator);
            let def = def.clone();
            async move { orchestrator.start(&def, inputs()).await }
        });

        let execution_id = loop {
            if let WorkflowEvent::WorkflowStarted { execution_id, .. } = events.recv().await.unwrap()
            {
                break execution_id;
            }
        };
        orchestrator.cancel(execution_id).await.unwrap();

        // The 30s dispatch is aborted promptly rather than awaited.
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.state, ExecutionState::Cancelled);
        assert!(outcome.completed_steps.is_empty());

        let execution = orchestrator
            .checkpoints()
            .repo()
            .get_execution(&execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(execution.state, ExecutionState::Cancelled);

        // Later levels never dispatched.
        let invocations = {
            let records = orchestrator
                .checkpoints()
                .repo()
                .list_step_records(&execution_id)
                .await
                .unwrap();
            records.iter().map(|r| r.step_key.clone()).collect::<Vec<_>>()
        };
        assert!(!invocations.contains(&"b".to_string()));
    }
}
