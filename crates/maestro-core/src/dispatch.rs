//! Agent dispatcher port.
//!
//! The scheduler hands each rendered prompt to an `AgentDispatcher` and
//! receives a result or an error; how the work is fulfilled (provider
//! routing, fallback, model choice) is entirely the implementation's
//! concern. Uses native async fn in traits (RPITIT), no `async_trait`
//! macro.

use maestro_types::agent::AgentSuggestion;
use maestro_types::workflow::WorkflowStep;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Request / error types
// ---------------------------------------------------------------------------

/// One step dispatch: a fully rendered prompt plus routing hints.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// Execution the step belongs to.
    pub execution_id: Uuid,
    /// Key of the step being dispatched.
    pub step_key: String,
    /// Prompt text with all placeholders substituted.
    pub prompt: String,
    /// Explicit agent assignment, if the step carries one.
    pub agent: Option<String>,
    /// 1-based attempt number (increments on retry).
    pub attempt: u32,
}

/// A failed dispatch. Recoverable via retry up to the step's limit.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("agent dispatch failed: {0}")]
    Failed(String),

    #[error("dispatch cancelled")]
    Cancelled,
}

// ---------------------------------------------------------------------------
// AgentDispatcher
// ---------------------------------------------------------------------------

/// External component that fulfills a step's rendered prompt.
///
/// Implementations receive the run's cancellation token and should abort
/// in-flight work promptly when it fires; the scheduler additionally races
/// every dispatch against the same token as a backstop.
pub trait AgentDispatcher: Send + Sync {
    /// Fulfill one step. Returns the step's result value or an error.
    fn dispatch(
        &self,
        request: DispatchRequest,
        cancel: CancellationToken,
    ) -> impl std::future::Future<Output = Result<Value, DispatchError>> + Send;

    /// Ranked agent suggestions for an unassigned step.
    ///
    /// The default implementation suggests nothing.
    fn suggest(
        &self,
        _step: &WorkflowStep,
    ) -> impl std::future::Future<Output = Vec<AgentSuggestion>> + Send {
        std::future::ready(Vec::new())
    }
}

// ---------------------------------------------------------------------------
// NullDispatcher
// ---------------------------------------------------------------------------

/// Dispatcher that "fulfills" every step with a null result.
///
/// Useful for dry runs: the whole orchestration path (graph, validation,
/// scheduling, checkpoints) executes without any agent traffic.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDispatcher;

impl AgentDispatcher for NullDispatcher {
    async fn dispatch(
        &self,
        request: DispatchRequest,
        _cancel: CancellationToken,
    ) -> Result<Value, DispatchError> {
        tracing::debug!(step_key = request.step_key.as_str(), "null dispatch");
        Ok(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_dispatcher_always_succeeds() {
        let request = DispatchRequest {
            execution_id: Uuid::now_v7(),
            step_key: "gather".to_string(),
            prompt: "do the thing".to_string(),
            agent: None,
            attempt: 1,
        };
        let result = NullDispatcher
            .dispatch(request, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, Value::Null);
    }

    #[tokio::test]
    async fn default_suggestions_are_empty() {
        let step = WorkflowStep {
            key: "gather".to_string(),
            prompt: "find news".to_string(),
            dependencies: vec![],
            agent: None,
            optional: false,
            retries: 1,
        };
        assert!(NullDispatcher.suggest(&step).await.is_empty());
    }

    #[test]
    fn dispatch_error_display() {
        assert!(
            DispatchError::Failed("provider 503".to_string())
                .to_string()
                .contains("503")
        );
        assert_eq!(DispatchError::Cancelled.to_string(), "dispatch cancelled");
    }
}
