//! Step scheduler: level-by-level fan-out/fan-in execution.
//!
//! Walks the dependency graph one level at a time. Within a level every
//! remaining step is spawned concurrently into a `JoinSet`, and the
//! scheduler drains the whole set before making any fail/continue decision
//! -- a barrier, never fail-fast mid-level. Each task runs its own retry
//! loop with capped exponential backoff; backoff sleeps never block sibling
//! steps.
//!
//! Cancellation is preemptive: every dispatch is raced against the run's
//! cancellation token (which the dispatcher also receives). Pause is
//! cooperative at level boundaries: the in-flight level settles, then the
//! run parks.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use maestro_types::event::WorkflowEvent;
use maestro_types::workflow::{WorkflowDefinition, WorkflowStep};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::checkpoint::{CheckpointError, CheckpointManager, CheckpointOptions};
use crate::context::{ContextError, ExecutionContext};
use crate::dispatch::{AgentDispatcher, DispatchError, DispatchRequest};
use crate::event::EventBus;
use crate::graph::DependencyGraph;
use crate::machine::StateMachine;
use crate::repository::WorkflowRepository;
use crate::retry::{RetryPolicy, should_retry};
use crate::template;

// ---------------------------------------------------------------------------
// Signals / outcome / errors
// ---------------------------------------------------------------------------

/// Live pause/cancel signals for one running execution.
#[derive(Debug, Clone, Default)]
pub struct RunSignals {
    /// Fired to abort the run, including in-flight dispatches.
    pub cancel: CancellationToken,
    /// Fired to park the run at the next level boundary.
    pub pause: CancellationToken,
}

impl RunSignals {
    pub fn new() -> Self {
        Self::default()
    }
}

/// How a scheduler pass ended, short of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// Every required step completed.
    Completed,
    /// A pause was requested; the run parked at a level boundary.
    Paused,
}

/// Errors that abort a scheduler pass.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A required step exhausted its attempts.
    #[error("step '{step_key}' failed after {attempts} attempt(s): {error}")]
    StepFailed {
        step_key: String,
        attempts: u32,
        error: String,
    },

    #[error("execution cancelled")]
    Cancelled,

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("task join error: {0}")]
    Join(String),
}

// ---------------------------------------------------------------------------
// Settled step (task result)
// ---------------------------------------------------------------------------

/// What one step task reports back after it settles.
#[derive(Debug)]
struct SettledStep {
    step_key: String,
    optional: bool,
    attempts: u32,
    outcome: Result<Value, String>,
    cancelled: bool,
}

// ---------------------------------------------------------------------------
// StepScheduler
// ---------------------------------------------------------------------------

/// Executes the levels of a dependency graph against an agent dispatcher.
pub struct StepScheduler<R: WorkflowRepository, D: AgentDispatcher> {
    checkpoints: Arc<CheckpointManager<R>>,
    dispatcher: Arc<D>,
    bus: EventBus,
    policy: RetryPolicy,
    fan_out: Option<usize>,
}

impl<R, D> StepScheduler<R, D>
where
    R: WorkflowRepository + 'static,
    D: AgentDispatcher + 'static,
{
    /// Create a scheduler sharing the orchestrator's checkpoint manager and
    /// dispatcher.
    pub fn new(
        checkpoints: Arc<CheckpointManager<R>>,
        dispatcher: Arc<D>,
        bus: EventBus,
        policy: RetryPolicy,
        fan_out: Option<usize>,
    ) -> Self {
        Self {
            checkpoints,
            dispatcher,
            bus,
            policy,
            fan_out,
        }
    }

    /// Execute all remaining levels in order.
    ///
    /// `completed_steps` holds the keys already done (empty on a fresh
    /// start); it is extended in place as levels settle. After each fully
    /// successful level a checkpoint is persisted; none is taken after a
    /// failed level.
    pub async fn run(
        &self,
        definition: &WorkflowDefinition,
        graph: &DependencyGraph,
        machine: &StateMachine,
        execution_id: Uuid,
        context: &mut ExecutionContext,
        completed_steps: &mut BTreeSet<String>,
        signals: &RunSignals,
    ) -> Result<ScheduleOutcome, SchedulerError> {
        let all_keys: BTreeSet<String> = graph.keys().map(str::to_string).collect();
        let mut failed_optional: BTreeSet<String> = BTreeSet::new();

        for (level_index, level) in graph.levels().iter().enumerate() {
            if signals.cancel.is_cancelled() {
                return Err(SchedulerError::Cancelled);
            }
            if signals.pause.is_cancelled() {
                tracing::info!(
                    execution_id = %execution_id,
                    level = level_index,
                    "pause requested, parking before level"
                );
                return Ok(ScheduleOutcome::Paused);
            }

            let remaining: Vec<WorkflowStep> = level
                .iter()
                .filter(|key| !completed_steps.contains(*key))
                .filter_map(|key| definition.step(key).cloned())
                .collect();
            if remaining.is_empty() {
                tracing::debug!(
                    execution_id = %execution_id,
                    level = level_index,
                    "level already complete, skipping"
                );
                continue;
            }

            tracing::debug!(
                execution_id = %execution_id,
                level = level_index,
                steps = remaining.len(),
                "dispatching level"
            );

            let settled = self
                .run_level(execution_id, remaining, context, &signals.cancel)
                .await?;

            if signals.cancel.is_cancelled() || settled.iter().any(|s| s.cancelled) {
                return Err(SchedulerError::Cancelled);
            }

            // Fold the settled level into the context, then decide.
            let mut fatal: Option<&SettledStep> = None;
            for step in &settled {
                match &step.outcome {
                    Ok(value) => {
                        context.set_step_result(&step.step_key, value.clone())?;
                        completed_steps.insert(step.step_key.clone());
                    }
                    Err(error) => {
                        if step.optional {
                            tracing::warn!(
                                execution_id = %execution_id,
                                step_key = step.step_key.as_str(),
                                error = error.as_str(),
                                "optional step failed, continuing"
                            );
                            failed_optional.insert(step.step_key.clone());
                        } else if fatal.is_none() {
                            fatal = Some(step);
                        }
                    }
                }
            }

            if let Some(fatal) = fatal {
                // Steps that never started are recorded as skipped for audit.
                let settled_keys: BTreeSet<&str> =
                    settled.iter().map(|s| s.step_key.as_str()).collect();
                for key in all_keys.iter().filter(|key| {
                    !completed_steps.contains(*key)
                        && !failed_optional.contains(*key)
                        && !settled_keys.contains(key.as_str())
                }) {
                    self.checkpoints.record_step_skipped(execution_id, key).await?;
                }

                let error = fatal
                    .outcome
                    .as_ref()
                    .err()
                    .cloned()
                    .unwrap_or_default();
                return Err(SchedulerError::StepFailed {
                    step_key: fatal.step_key.clone(),
                    attempts: fatal.attempts,
                    error,
                });
            }

            let pending_steps: BTreeSet<String> =
                all_keys.difference(completed_steps).cloned().collect();
            self.checkpoints
                .create_checkpoint(
                    execution_id,
                    machine,
                    context,
                    completed_steps,
                    &pending_steps,
                    CheckpointOptions {
                        label: Some(format!("level {level_index}")),
                        created_by: Some("scheduler".to_string()),
                    },
                )
                .await?;
        }

        Ok(ScheduleOutcome::Completed)
    }

    /// Spawn every step of a level and wait for all of them to settle.
    async fn run_level(
        &self,
        execution_id: Uuid,
        steps: Vec<WorkflowStep>,
        context: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<Vec<SettledStep>, SchedulerError> {
        let context_value = context.as_value();
        let semaphore = self.fan_out.map(|limit| Arc::new(Semaphore::new(limit)));
        let mut join_set = JoinSet::new();

        for step in steps {
            let prompt = template::render(&step.prompt, &context_value);
            let checkpoints = Arc::clone(&self.checkpoints);
            let dispatcher = Arc::clone(&self.dispatcher);
            let bus = self.bus.clone();
            let policy = self.policy;
            let cancel = cancel.clone();
            let semaphore = semaphore.clone();

            join_set.spawn(async move {
                let _permit = match semaphore {
                    Some(semaphore) => Some(
                        semaphore
                            .acquire_owned()
                            .await
                            .map_err(|_| SchedulerError::Join("fan-out semaphore closed".to_string()))?,
                    ),
                    None => None,
                };
                run_step(checkpoints, dispatcher, bus, policy, execution_id, step, prompt, cancel)
                    .await
            });
        }

        // Barrier: drain the whole set before any decision.
        let mut settled = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            let task_result = joined.map_err(|e| SchedulerError::Join(e.to_string()))?;
            settled.push(task_result?);
        }
        Ok(settled)
    }
}

// ---------------------------------------------------------------------------
// Per-step task
// ---------------------------------------------------------------------------

/// Dispatch one step, retrying with capped backoff until it settles.
#[allow(clippy::too_many_arguments)]
async fn run_step<R: WorkflowRepository, D: AgentDispatcher>(
    checkpoints: Arc<CheckpointManager<R>>,
    dispatcher: Arc<D>,
    bus: EventBus,
    policy: RetryPolicy,
    execution_id: Uuid,
    step: WorkflowStep,
    prompt: String,
    cancel: CancellationToken,
) -> Result<SettledStep, SchedulerError> {
    let record_id = checkpoints.record_step_start(execution_id, &step.key).await?;
    let max_attempts = step.retries.max(1);
    let started = Instant::now();
    let mut attempt = 1u32;
    let mut retries_used = 0u32;

    loop {
        bus.publish(WorkflowEvent::StepStarted {
            execution_id,
            step_key: step.key.clone(),
            attempt,
        });

        let request = DispatchRequest {
            execution_id,
            step_key: step.key.clone(),
            prompt: prompt.clone(),
            agent: step.agent.clone(),
            attempt,
        };

        // Race the dispatch against cancellation as a backstop; the
        // dispatcher also receives the token for prompt aborts.
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(DispatchError::Cancelled),
            result = dispatcher.dispatch(request, cancel.clone()) => result,
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(value) => {
                checkpoints
                    .record_step_completed(record_id, retries_used, &value, elapsed_ms)
                    .await?;
                bus.publish(WorkflowEvent::StepCompleted {
                    execution_id,
                    step_key: step.key.clone(),
                    duration_ms: elapsed_ms,
                });
                return Ok(SettledStep {
                    step_key: step.key,
                    optional: step.optional,
                    attempts: attempt,
                    outcome: Ok(value),
                    cancelled: false,
                });
            }
            Err(DispatchError::Cancelled) => {
                checkpoints
                    .record_step_failed(record_id, retries_used, "dispatch cancelled", elapsed_ms)
                    .await?;
                return Ok(SettledStep {
                    step_key: step.key,
                    optional: step.optional,
                    attempts: attempt,
                    outcome: Err("dispatch cancelled".to_string()),
                    cancelled: true,
                });
            }
            Err(DispatchError::Failed(error)) => {
                if should_retry(attempt, max_attempts) {
                    bus.publish(WorkflowEvent::StepFailed {
                        execution_id,
                        step_key: step.key.clone(),
                        error: error.clone(),
                        will_retry: true,
                    });
                    retries_used += 1;
                    checkpoints.record_step_retry(record_id, retries_used).await?;

                    // Delay for retry attempt n (0-indexed) is
                    // min(2^n * base, cap).
                    let delay = policy.backoff_delay(attempt - 1);
                    tracing::debug!(
                        execution_id = %execution_id,
                        step_key = step.key.as_str(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "step failed, backing off before retry"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            checkpoints
                                .record_step_failed(
                                    record_id,
                                    retries_used,
                                    "dispatch cancelled",
                                    started.elapsed().as_millis() as u64,
                                )
                                .await?;
                            return Ok(SettledStep {
                                step_key: step.key,
                                optional: step.optional,
                                attempts: attempt,
                                outcome: Err("dispatch cancelled".to_string()),
                                cancelled: true,
                            });
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                } else {
                    checkpoints
                        .record_step_failed(record_id, retries_used, &error, elapsed_ms)
                        .await?;
                    bus.publish(WorkflowEvent::StepFailed {
                        execution_id,
                        step_key: step.key.clone(),
                        error: error.clone(),
                        will_retry: false,
                    });
                    return Ok(SettledStep {
                        step_key: step.key,
                        optional: step.optional,
                        attempts: attempt,
                        outcome: Err(error),
                        cancelled: false,
                    });
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
