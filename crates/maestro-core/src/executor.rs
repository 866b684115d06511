//! The orchestrating facade: one entry point per lifecycle operation.
//!
//! `Orchestrator` owns one execution end to end. `start` drives the state
//! machine through Idle -> Parsing (shape check) -> Validating (full
//! structural validation) -> Executing (scheduler) -> terminal state,
//! persisting the execution record and lifecycle events along the way.
//! `resume_from_checkpoint` reconstructs the machine, context, and step sets
//! from a snapshot and hands control back to the scheduler at the first
//! incomplete level. `pause` and `cancel` signal live runs through their
//! `RunSignals`; both are rejected against terminal executions.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;
use maestro_types::config::OrchestratorConfig;
use maestro_types::error::DefinitionError;
use maestro_types::event::{EventRecord, WorkflowEvent};
use maestro_types::workflow::{
    ExecutionFailure, ExecutionState, WorkflowDefinition, WorkflowExecution,
};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::checkpoint::{CheckpointError, CheckpointManager, CheckpointOptions};
use crate::context::ExecutionContext;
use crate::dispatch::AgentDispatcher;
use crate::event::EventBus;
use crate::graph::{DependencyGraph, GraphError};
use crate::machine::{StateMachine, StateTransitionError};
use crate::registry::AgentRegistry;
use crate::repository::WorkflowRepository;
use crate::retry::RetryPolicy;
use crate::scheduler::{RunSignals, ScheduleOutcome, SchedulerError, StepScheduler};
use crate::validate::{ValidationIssue, validate_definition};

// ---------------------------------------------------------------------------
// Outcome / errors
// ---------------------------------------------------------------------------

/// Result of a settled (or parked) execution.
#[derive(Debug)]
pub struct ExecutionOutcome {
    /// The execution ID.
    pub execution_id: Uuid,
    /// Final lifecycle state of this pass.
    pub state: ExecutionState,
    /// Accumulated context (inputs plus step results).
    pub context: ExecutionContext,
    /// Keys of steps that completed.
    pub completed_steps: BTreeSet<String>,
    /// Resume counter after this pass.
    pub resume_count: u32,
    /// The recorded failure, if the execution failed.
    pub error: Option<ExecutionFailure>,
}

/// The complete list of validation issues for a rejected definition.
#[derive(Debug, Clone)]
pub struct ValidationFailure {
    pub issues: Vec<ValidationIssue>,
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.issues.iter().map(|i| i.to_string()).collect();
        write!(f, "{}", rendered.join("; "))
    }
}

/// Errors surfaced by orchestrator operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The definition's shape is malformed (caught before validation).
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    /// The definition failed structural validation; every issue is included.
    #[error("definition failed validation: {0}")]
    Validation(ValidationFailure),

    #[error(transparent)]
    Graph(#[from] GraphError),

    /// A required step exhausted its attempts and aborted the execution.
    #[error("execution {execution_id}: step '{step_key}' failed after {attempts} attempt(s): {error}")]
    StepFailed {
        execution_id: Uuid,
        step_key: String,
        attempts: u32,
        error: String,
    },

    #[error(transparent)]
    Transition(#[from] StateTransitionError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("repository error: {0}")]
    Repository(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("execution {0} is not running in this process")]
    NotRunning(Uuid),

    #[error("internal scheduler error: {0}")]
    Internal(String),
}

// ---------------------------------------------------------------------------
// WorkflowEngine trait
// ---------------------------------------------------------------------------

/// The lifecycle operations an orchestrator exposes.
///
/// These map 1:1 onto the CLI/API surface: start, resume (from a checkpoint
/// id), pause, cancel.
pub trait WorkflowEngine: Send + Sync {
    /// Execute a definition from the beginning.
    fn start(
        &self,
        definition: &WorkflowDefinition,
        inputs: HashMap<String, Value>,
    ) -> impl std::future::Future<Output = Result<ExecutionOutcome, OrchestratorError>> + Send;

    /// Resume an execution from a prior checkpoint.
    fn resume_from_checkpoint(
        &self,
        checkpoint_id: Uuid,
        definition: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<ExecutionOutcome, OrchestratorError>> + Send;

    /// Park a live execution at its next level boundary.
    fn pause(
        &self,
        execution_id: Uuid,
    ) -> impl std::future::Future<Output = Result<(), OrchestratorError>> + Send;

    /// Abort an execution, interrupting in-flight dispatches.
    fn cancel(
        &self,
        execution_id: Uuid,
    ) -> impl std::future::Future<Output = Result<(), OrchestratorError>> + Send;
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Level-based DAG orchestrator with durable checkpointing.
pub struct Orchestrator<R: WorkflowRepository, D: AgentDispatcher> {
    checkpoints: Arc<CheckpointManager<R>>,
    scheduler: StepScheduler<R, D>,
    registry: AgentRegistry,
    bus: EventBus,
    config: OrchestratorConfig,
    /// Live pause/cancel signals keyed by execution ID.
    signals: DashMap<Uuid, RunSignals>,
}

impl<R, D> Orchestrator<R, D>
where
    R: WorkflowRepository + 'static,
    D: AgentDispatcher + 'static,
{
    /// Create an orchestrator over a repository and a dispatcher.
    pub fn new(repo: R, dispatcher: D, registry: AgentRegistry, config: OrchestratorConfig) -> Self {
        let checkpoints = Arc::new(CheckpointManager::new(repo));
        let bus = EventBus::default();
        let scheduler = StepScheduler::new(
            Arc::clone(&checkpoints),
            Arc::new(dispatcher),
            bus.clone(),
            RetryPolicy::from_config(&config),
            config.level_fan_out,
        );
        Self {
            checkpoints,
            scheduler,
            registry,
            bus,
            config,
            signals: DashMap::new(),
        }
    }

    /// The event bus carrying this orchestrator's lifecycle events.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// The checkpoint manager (and through it, the repository).
    pub fn checkpoints(&self) -> &CheckpointManager<R> {
        &self.checkpoints
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn persist_execution(
        &self,
        definition: &WorkflowDefinition,
        execution_id: Uuid,
        machine: &StateMachine,
    ) -> Result<(), OrchestratorError> {
        let execution = WorkflowExecution {
            id: execution_id,
            workflow_id: definition.id,
            workflow_name: definition.name.clone(),
            state: machine.state(),
            started_at: machine.started_at().unwrap_or_else(Utc::now),
            completed_at: machine.completed_at(),
            error: machine.error().cloned(),
            resume_count: machine.resume_count(),
        };
        self.checkpoints
            .repo()
            .create_execution(&execution)
            .await
            .map_err(|e| OrchestratorError::Repository(e.to_string()))
    }

    async fn update_execution(
        &self,
        execution_id: Uuid,
        machine: &StateMachine,
    ) -> Result<(), OrchestratorError> {
        self.checkpoints
            .repo()
            .update_execution_state(
                &execution_id,
                machine.state(),
                machine.error(),
                machine.completed_at(),
            )
            .await
            .map_err(|e| OrchestratorError::Repository(e.to_string()))
    }

    /// Append an event to the durable log and broadcast it.
    async fn emit(&self, event: WorkflowEvent) -> Result<(), OrchestratorError> {
        self.checkpoints
            .repo()
            .append_event(&EventRecord::new(event.clone()))
            .await
            .map_err(|e| OrchestratorError::Repository(e.to_string()))?;
        self.bus.publish(event);
        Ok(())
    }

    fn outcome(
        execution_id: Uuid,
        machine: &StateMachine,
        context: ExecutionContext,
        completed_steps: BTreeSet<String>,
    ) -> ExecutionOutcome {
        ExecutionOutcome {
            execution_id,
            state: machine.state(),
            context,
            completed_steps,
            resume_count: machine.resume_count(),
            error: machine.error().cloned(),
        }
    }

    /// Register live pause/cancel signals for an execution about to run.
    ///
    /// Registered before the started/resumed event is emitted so a
    /// subscriber reacting to the event can immediately pause or cancel.
    fn register_signals(&self, execution_id: Uuid) -> RunSignals {
        let signals = RunSignals::new();
        self.signals.insert(execution_id, signals.clone());
        signals
    }

    /// Run the scheduler over the remaining levels and settle the machine.
    async fn drive(
        &self,
        definition: &WorkflowDefinition,
        graph: &DependencyGraph,
        mut machine: StateMachine,
        execution_id: Uuid,
        mut context: ExecutionContext,
        mut completed_steps: BTreeSet<String>,
        signals: RunSignals,
    ) -> Result<ExecutionOutcome, OrchestratorError> {
        let run_started = Instant::now();

        let result = self
            .scheduler
            .run(
                definition,
                graph,
                &machine,
                execution_id,
                &mut context,
                &mut completed_steps,
                &signals,
            )
            .await;
        self.signals.remove(&execution_id);

        match result {
            Ok(ScheduleOutcome::Completed) => {
                machine.complete()?;
                self.update_execution(execution_id, &machine).await?;
                self.checkpoints
                    .prune_checkpoints(execution_id, self.config.checkpoint_keep_latest)
                    .await?;
                self.emit(WorkflowEvent::WorkflowCompleted {
                    execution_id,
                    duration_ms: run_started.elapsed().as_millis() as u64,
                    steps_completed: completed_steps.len() as u32,
                })
                .await?;
                tracing::info!(
                    execution_id = %execution_id,
                    workflow = definition.name.as_str(),
                    steps = completed_steps.len(),
                    "workflow completed"
                );
                Ok(Self::outcome(execution_id, &machine, context, completed_steps))
            }
            Ok(ScheduleOutcome::Paused) => {
                machine.pause()?;
                let all_keys = definition.step_keys();
                let pending_steps: BTreeSet<String> =
                    all_keys.difference(&completed_steps).cloned().collect();
                self.checkpoints
                    .create_checkpoint(
                        execution_id,
                        &machine,
                        &context,
                        &completed_steps,
                        &pending_steps,
                        CheckpointOptions {
                            label: Some("pause".to_string()),
                            created_by: Some("pause".to_string()),
                        },
                    )
                    .await?;
                self.update_execution(execution_id, &machine).await?;
                self.emit(WorkflowEvent::WorkflowPaused { execution_id }).await?;
                tracing::info!(execution_id = %execution_id, "workflow paused");
                Ok(Self::outcome(execution_id, &machine, context, completed_steps))
            }
            Err(SchedulerError::Cancelled) => {
                machine.cancel()?;
                self.update_execution(execution_id, &machine).await?;
                self.emit(WorkflowEvent::WorkflowCancelled { execution_id }).await?;
                tracing::info!(execution_id = %execution_id, "workflow cancelled");
                Ok(Self::outcome(execution_id, &machine, context, completed_steps))
            }
            Err(SchedulerError::StepFailed {
                step_key,
                attempts,
                error,
            }) => {
                machine.fail(ExecutionFailure {
                    step_key: Some(step_key.clone()),
                    message: error.clone(),
                })?;
                self.update_execution(execution_id, &machine).await?;

                // A tainted execution must not be silently resumable.
                let reason = format!("step '{step_key}' failed: {error}");
                self.checkpoints
                    .invalidate_for_execution(execution_id, &reason)
                    .await?;

                self.emit(WorkflowEvent::WorkflowFailed {
                    execution_id,
                    step_key: Some(step_key.clone()),
                    error: error.clone(),
                })
                .await?;
                tracing::error!(
                    execution_id = %execution_id,
                    step_key = step_key.as_str(),
                    error = error.as_str(),
                    "workflow failed"
                );
                Err(OrchestratorError::StepFailed {
                    execution_id,
                    step_key,
                    attempts,
                    error,
                })
            }
            Err(other) => {
                let message = other.to_string();
                let _ = machine.fail(ExecutionFailure {
                    step_key: None,
                    message: message.clone(),
                });
                let _ = self.update_execution(execution_id, &machine).await;
                Err(OrchestratorError::Internal(message))
            }
        }
    }
}

/// Shape check run in the Parsing phase, before structural validation.
fn check_shape(definition: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if definition.name.is_empty() {
        return Err(DefinitionError::EmptyName);
    }
    if definition.steps.is_empty() {
        return Err(DefinitionError::NoSteps);
    }
    for (index, step) in definition.steps.iter().enumerate() {
        if step.key.is_empty() {
            return Err(DefinitionError::EmptyStepKey(index));
        }
        if step.prompt.is_empty() {
            return Err(DefinitionError::EmptyPrompt(step.key.clone()));
        }
    }
    Ok(())
}

impl<R, D> WorkflowEngine for Orchestrator<R, D>
where
    R: WorkflowRepository + 'static,
    D: AgentDispatcher + 'static,
{
    async fn start(
        &self,
        definition: &WorkflowDefinition,
        inputs: HashMap<String, Value>,
    ) -> Result<ExecutionOutcome, OrchestratorError> {
        let execution_id = Uuid::now_v7();
        let mut machine = StateMachine::new();
        machine.start_parsing()?;

        if let Err(definition_error) = check_shape(definition) {
            machine.fail(ExecutionFailure {
                step_key: None,
                message: definition_error.to_string(),
            })?;
            self.persist_execution(definition, execution_id, &machine).await?;
            return Err(definition_error.into());
        }
        machine.finish_parsing()?;

        let input_names: BTreeSet<String> = inputs.keys().cloned().collect();
        let issues = validate_definition(definition, &input_names, Some(&self.registry));
        if !issues.is_empty() {
            let failure = ValidationFailure { issues };
            machine.fail(ExecutionFailure {
                step_key: None,
                message: failure.to_string(),
            })?;
            self.persist_execution(definition, execution_id, &machine).await?;
            return Err(OrchestratorError::Validation(failure));
        }
        let graph = DependencyGraph::build(definition)?;
        machine.finish_validation()?;

        self.persist_execution(definition, execution_id, &machine).await?;
        let signals = self.register_signals(execution_id);
        self.emit(WorkflowEvent::WorkflowStarted {
            execution_id,
            workflow_name: definition.name.clone(),
        })
        .await?;
        tracing::info!(
            execution_id = %execution_id,
            workflow = definition.name.as_str(),
            levels = graph.levels().len(),
            "starting workflow execution"
        );

        let context = ExecutionContext::new(&definition.name, execution_id, inputs);
        self.drive(
            definition,
            &graph,
            machine,
            execution_id,
            context,
            BTreeSet::new(),
            signals,
        )
        .await
    }

    async fn resume_from_checkpoint(
        &self,
        checkpoint_id: Uuid,
        definition: &WorkflowDefinition,
    ) -> Result<ExecutionOutcome, OrchestratorError> {
        let restored = self.checkpoints.restore_checkpoint(checkpoint_id).await?;
        let execution_id = restored.execution_id;

        let mut machine = restored.machine;
        machine.resume()?;

        self.checkpoints
            .repo()
            .increment_resume_count(&execution_id)
            .await
            .map_err(|e| OrchestratorError::Repository(e.to_string()))?;
        self.update_execution(execution_id, &machine).await?;

        let graph = DependencyGraph::build(definition)?;
        let signals = self.register_signals(execution_id);
        self.emit(WorkflowEvent::WorkflowResumed {
            execution_id,
            resume_count: machine.resume_count(),
        })
        .await?;
        tracing::info!(
            execution_id = %execution_id,
            workflow = definition.name.as_str(),
            skipping = restored.completed_steps.len(),
            resume_count = machine.resume_count(),
            "resuming workflow execution"
        );

        self.drive(
            definition,
            &graph,
            machine,
            execution_id,
            restored.context,
            restored.completed_steps,
            signals,
        )
        .await
    }

    async fn pause(&self, execution_id: Uuid) -> Result<(), OrchestratorError> {
        if let Some(signals) = self.signals.get(&execution_id) {
            signals.pause.cancel();
            tracing::info!(execution_id = %execution_id, "pause requested");
            return Ok(());
        }

        let execution = self
            .checkpoints
            .repo()
            .get_execution(&execution_id)
            .await
            .map_err(|e| OrchestratorError::Repository(e.to_string()))?
            .ok_or(OrchestratorError::ExecutionNotFound(execution_id))?;
        if execution.state.is_terminal() {
            return Err(StateTransitionError::Terminal {
                state: execution.state,
            }
            .into());
        }
        Err(OrchestratorError::NotRunning(execution_id))
    }

    async fn cancel(&self, execution_id: Uuid) -> Result<(), OrchestratorError> {
        if let Some(signals) = self.signals.get(&execution_id) {
            signals.cancel.cancel();
            tracing::info!(execution_id = %execution_id, "cancel requested");
            return Ok(());
        }

        let execution = self
            .checkpoints
            .repo()
            .get_execution(&execution_id)
            .await
            .map_err(|e| OrchestratorError::Repository(e.to_string()))?
            .ok_or(OrchestratorError::ExecutionNotFound(execution_id))?;
        if execution.state.is_terminal() {
            return Err(StateTransitionError::Terminal {
                state: execution.state,
            }
            .into());
        }

        // Not live in this process (e.g. a crashed run): settle it directly.
        self.checkpoints
            .repo()
            .update_execution_state(&execution_id, ExecutionState::Cancelled, None, Some(Utc::now()))
            .await
            .map_err(|e| OrchestratorError::Repository(e.to_string()))?;
        self.emit(WorkflowEvent::WorkflowCancelled { execution_id }).await?;
        tracing::info!(execution_id = %execution_id, "interrupted execution cancelled");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
