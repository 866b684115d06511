//! Shared fixtures for the core crate's tests: definition builders, a
//! minimal in-memory repository, and a scriptable dispatcher.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::Utc;
use maestro_types::error::RepositoryError;
use maestro_types::event::EventRecord;
use maestro_types::workflow::{
    Checkpoint, CheckpointInvalidation, ExecutionFailure, ExecutionState, StepExecutionRecord,
    StepState, WorkflowDefinition, WorkflowExecution, WorkflowStep,
};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::dispatch::{AgentDispatcher, DispatchError, DispatchRequest};
use crate::machine::StateMachine;
use crate::repository::WorkflowRepository;

// ---------------------------------------------------------------------------
// Definition builders
// ---------------------------------------------------------------------------

/// A single-attempt step with no dependencies.
pub fn step(key: &str) -> WorkflowStep {
    WorkflowStep {
        key: key.to_string(),
        prompt: format!("run {key}"),
        dependencies: vec![],
        agent: None,
        optional: false,
        retries: 1,
    }
}

/// A single-attempt step depending on the given keys.
pub fn step_with_deps(key: &str, dependencies: &[&str]) -> WorkflowStep {
    WorkflowStep {
        dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
        ..step(key)
    }
}

/// A step whose failure does not abort the execution.
pub fn optional_step(key: &str) -> WorkflowStep {
    WorkflowStep {
        optional: true,
        ..step(key)
    }
}

/// A definition named "test-workflow" over the given steps.
pub fn definition(steps: Vec<WorkflowStep>) -> WorkflowDefinition {
    WorkflowDefinition {
        id: Uuid::now_v7(),
        name: "test-workflow".to_string(),
        description: None,
        author: None,
        tags: vec![],
        steps,
    }
}

/// A context seeded with the input variable `topic = "rust"`.
pub fn seeded_context(execution_id: Uuid) -> ExecutionContext {
    ExecutionContext::new(
        "test-workflow",
        execution_id,
        HashMap::from([("topic".to_string(), json!("rust"))]),
    )
}

/// A machine advanced into `Executing`.
pub fn executing_machine() -> StateMachine {
    let mut machine = StateMachine::new();
    machine.start_parsing().unwrap();
    machine.finish_parsing().unwrap();
    machine.finish_validation().unwrap();
    machine
}

// ---------------------------------------------------------------------------
// MemRepo
// ---------------------------------------------------------------------------

/// Minimal in-memory repository for unit tests.
///
/// The production-grade memory store lives in maestro-infra; this one only
/// needs to be correct, not concurrent-friendly.
#[derive(Debug, Default)]
pub struct MemRepo {
    definitions: Mutex<HashMap<Uuid, WorkflowDefinition>>,
    executions: Mutex<HashMap<Uuid, WorkflowExecution>>,
    steps: Mutex<Vec<StepExecutionRecord>>,
    checkpoints: Mutex<Vec<Checkpoint>>,
    events: Mutex<Vec<EventRecord>>,
}

impl MemRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkflowRepository for MemRepo {
    async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<(), RepositoryError> {
        self.definitions
            .lock()
            .unwrap()
            .insert(definition.id, definition.clone());
        Ok(())
    }

    async fn get_definition(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.definitions.lock().unwrap().get(id).cloned())
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        Ok(self.definitions.lock().unwrap().values().cloned().collect())
    }

    async fn delete_definition(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(self.definitions.lock().unwrap().remove(id).is_some())
    }

    async fn create_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
        self.executions
            .lock()
            .unwrap()
            .insert(execution.id, execution.clone());
        Ok(())
    }

    async fn update_execution_state(
        &self,
        execution_id: &Uuid,
        state: ExecutionState,
        error: Option<&ExecutionFailure>,
        completed_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<(), RepositoryError> {
        let mut executions = self.executions.lock().unwrap();
        let execution = executions
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
        Ok(self.executions.lock().unwrap().get(execution_id).cloned())
    }

    async fn list_interrupted_executions(&self) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        Ok(self
            .executions
            .lock()
            .unwrap()
            .values()
            .filter(|e| !e.state.is_terminal())
            .cloned()
            .collect())
    }

    async fn increment_resume_count(&self, execution_id: &Uuid) -> Result<u32, RepositoryError> {
        let mut executions = self.executions.lock().unwrap();
        let execution = executions
            .get_mut(execution_id)
            .ok_or(RepositoryError::NotFound)?;
        execution.resume_count += 1;
        Ok(execution.resume_count)
    }

    async fn create_step_record(&self, record: &StepExecutionRecord) -> Result<(), RepositoryError> {
        self.steps.lock().unwrap().push(record.clone());
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
        let mut steps = self.steps.lock().unwrap();
        let record = steps
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
            .steps
            .lock()
            .unwrap()
            .iter()
            .filter(|r| &r.execution_id == execution_id)
            .cloned()
            .collect())
    }

    async fn create_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        self.checkpoints.lock().unwrap().push(checkpoint.clone());
        Ok(())
    }

    async fn get_checkpoint(
        &self,
        checkpoint_id: &Uuid,
    ) -> Result<Option<Checkpoint>, RepositoryError> {
        Ok(self
            .checkpoints
            .lock()
            .unwrap()
            .iter()
            .find(|c| &c.id == checkpoint_id)
            .cloned())
    }

    async fn list_checkpoints(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<Checkpoint>, RepositoryError> {
        let mut checkpoints: Vec<Checkpoint> = self
            .checkpoints
            .lock()
            .unwrap()
            .iter()
            .filter(|c| &c.execution_id == execution_id)
            .cloned()
            .collect();
        checkpoints.reverse(); // insertion order is creation order
        Ok(checkpoints)
    }

    async fn mark_checkpoint_invalidated(
        &self,
        checkpoint_id: &Uuid,
        invalidation: &CheckpointInvalidation,
    ) -> Result<(), RepositoryError> {
        let mut checkpoints = self.checkpoints.lock().unwrap();
        let checkpoint = checkpoints
            .iter_mut()
            .find(|c| &c.id == checkpoint_id)
            .ok_or(RepositoryError::NotFound)?;
        checkpoint.invalidated = Some(invalidation.clone());
        Ok(())
    }

    async fn delete_checkpoint(&self, checkpoint_id: &Uuid) -> Result<bool, RepositoryError> {
        let mut checkpoints = self.checkpoints.lock().unwrap();
        let before = checkpoints.len();
        checkpoints.retain(|c| &c.id != checkpoint_id);
        Ok(checkpoints.len() < before)
    }

    async fn append_event(&self, record: &EventRecord) -> Result<(), RepositoryError> {
        self.events.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn list_events(&self, execution_id: &Uuid) -> Result<Vec<EventRecord>, RepositoryError> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| &e.execution_id == execution_id)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// ScriptedDispatcher
// ---------------------------------------------------------------------------

/// Dispatcher whose per-step outcomes are scripted up front.
///
/// Outcomes queue per step key; once a step's queue is drained, it fails if
/// marked `fail_always`, otherwise succeeds with a generic value. Every
/// dispatch is logged for ordering assertions.
#[derive(Debug, Default)]
pub struct ScriptedDispatcher {
    queues: Mutex<HashMap<String, VecDeque<Result<Value, String>>>>,
    always_failing: Mutex<HashMap<String, String>>,
    invocations: Mutex<Vec<String>>,
    prompts: Mutex<HashMap<String, String>>,
}

impl ScriptedDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one successful outcome for a step.
    pub fn succeed(&self, key: &str, value: Value) {
        self.queues
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push_back(Ok(value));
    }

    /// Queue `count` failures for a step.
    pub fn fail_times(&self, key: &str, count: usize, message: &str) {
        let mut queues = self.queues.lock().unwrap();
        let queue = queues.entry(key.to_string()).or_default();
        for _ in 0..count {
            queue.push_back(Err(message.to_string()));
        }
    }

    /// Make every (unqueued) dispatch of a step fail.
    pub fn fail_always(&self, key: &str, message: &str) {
        self.always_failing
            .lock()
            .unwrap()
            .insert(key.to_string(), message.to_string());
    }

    /// Step keys in dispatch order (retries included).
    pub fn invocations(&self) -> Vec<String> {
        self.invocations.lock().unwrap().clone()
    }

    /// How many times a step was dispatched.
    pub fn invocation_count(&self, key: &str) -> usize {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|k| k.as_str() == key)
            .count()
    }

    /// The last rendered prompt a step was dispatched with.
    pub fn prompt_for(&self, key: &str) -> Option<String> {
        self.prompts.lock().unwrap().get(key).cloned()
    }
}

impl AgentDispatcher for ScriptedDispatcher {
    async fn dispatch(
        &self,
        request: DispatchRequest,
        _cancel: CancellationToken,
    ) -> Result<Value, DispatchError> {
        self.invocations
            .lock()
            .unwrap()
            .push(request.step_key.clone());
        self.prompts
            .lock()
            .unwrap()
            .insert(request.step_key.clone(), request.prompt.clone());

        let queued = self
            .queues
            .lock()
            .unwrap()
            .get_mut(&request.step_key)
            .and_then(VecDeque::pop_front);
        match queued {
            Some(Ok(value)) => Ok(value),
            Some(Err(message)) => Err(DispatchError::Failed(message)),
            None => {
                if let Some(message) = self.always_failing.lock().unwrap().get(&request.step_key) {
                    Err(DispatchError::Failed(message.clone()))
                } else {
                    Ok(json!(format!("ok: {}", request.step_key)))
                }
            }
        }
    }
}
