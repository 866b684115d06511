//! Execution context: the mutable key/value state of one workflow run.
//!
//! Seeded from caller-supplied input variables and extended with each
//! completed step's result under its step key. Owned exclusively by the
//! orchestrator for the lifetime of one execution. Size limits guard
//! against unbounded growth from runaway step outputs.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum serialized size of a single step result (1 MB).
pub const MAX_STEP_RESULT_SIZE: usize = 1_048_576;

/// Maximum total serialized size of all context values (10 MB).
pub const MAX_CONTEXT_SIZE: usize = 10_485_760;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by context mutation or restoration.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("context serialization failed: {0}")]
    Serialize(String),

    #[error("total context size ({actual} bytes) exceeds maximum ({max} bytes)")]
    SizeExceeded { actual: usize, max: usize },

    #[error("failed to restore context: {0}")]
    Restore(String),
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Mutable state accumulated across one workflow execution.
///
/// Values live in a single flat namespace: input variables at their given
/// names, step results under their step keys. Template placeholders resolve
/// against `as_value()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Workflow name (denormalized for logging).
    pub workflow_name: String,
    /// Execution this context belongs to.
    pub execution_id: Uuid,
    /// Input variables and step results.
    values: Map<String, Value>,
}

impl ExecutionContext {
    /// Create a context seeded with the caller's input variables.
    pub fn new(
        workflow_name: impl Into<String>,
        execution_id: Uuid,
        inputs: HashMap<String, Value>,
    ) -> Self {
        Self {
            workflow_name: workflow_name.into(),
            execution_id,
            values: inputs.into_iter().collect(),
        }
    }

    /// Record a completed step's result under its key.
    ///
    /// A result larger than `MAX_STEP_RESULT_SIZE` is replaced by a
    /// truncation marker object. Exceeding `MAX_CONTEXT_SIZE` in total is an
    /// error.
    pub fn set_step_result(&mut self, step_key: &str, result: Value) -> Result<(), ContextError> {
        let serialized = serde_json::to_string(&result)
            .map_err(|e| ContextError::Serialize(e.to_string()))?;

        if serialized.len() > MAX_STEP_RESULT_SIZE {
            tracing::warn!(
                step_key,
                size = serialized.len(),
                max = MAX_STEP_RESULT_SIZE,
                "step result exceeds size limit, truncating"
            );
            let truncated = json!({
                "_truncated": true,
                "_original_size": serialized.len(),
                "_message": format!(
                    "result exceeded {MAX_STEP_RESULT_SIZE} byte limit and was truncated"
                ),
            });
            self.values.insert(step_key.to_string(), truncated);
        } else {
            self.values.insert(step_key.to_string(), result);
        }

        let total = self.total_size();
        if total > MAX_CONTEXT_SIZE {
            return Err(ContextError::SizeExceeded {
                actual: total,
                max: MAX_CONTEXT_SIZE,
            });
        }
        Ok(())
    }

    /// Look up a value (input variable or step result) by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// The names currently bound in the context.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// The context as a single JSON object, for template resolution.
    pub fn as_value(&self) -> Value {
        Value::Object(self.values.clone())
    }

    /// Total serialized size of all values, in bytes.
    pub fn total_size(&self) -> usize {
        self.values
            .values()
            .map(|v| serde_json::to_string(v).map(|s| s.len()).unwrap_or(0))
            .sum()
    }

    /// Serialize the entire context for checkpointing.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }

    /// Restore a context from a checkpoint snapshot.
    pub fn from_json(value: Value) -> Result<Self, ContextError> {
        serde_json::from_value(value).map_err(|e| ContextError::Restore(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_context() -> ExecutionContext {
        ExecutionContext::new(
            "test-workflow",
            Uuid::now_v7(),
            HashMap::from([("topic".to_string(), json!("rust"))]),
        )
    }

    #[test]
    fn test_seeded_inputs_are_visible() {
        let ctx = test_context();
        assert_eq!(ctx.get("topic"), Some(&json!("rust")));
        assert_eq!(ctx.get("missing"), None);
    }

    #[test]
    fn test_step_results_join_the_namespace() {
        let mut ctx = test_context();
        ctx.set_step_result("gather", json!({"articles": 3})).unwrap();
        assert_eq!(ctx.get("gather"), Some(&json!({"articles": 3})));

        let value = ctx.as_value();
        assert_eq!(value["topic"], json!("rust"));
        assert_eq!(value["gather"]["articles"], json!(3));
    }

    #[test]
    fn test_oversized_result_is_truncated() {
        let mut ctx = test_context();
        let huge = "x".repeat(MAX_STEP_RESULT_SIZE + 100);
        ctx.set_step_result("big", json!(huge)).unwrap();

        let stored = ctx.get("big").unwrap();
        assert_eq!(stored["_truncated"], json!(true));
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let mut ctx = test_context();
        ctx.set_step_result("gather", json!("news")).unwrap();

        let snapshot = ctx.to_json();
        let restored = ExecutionContext::from_json(snapshot).unwrap();
        assert_eq!(restored.workflow_name, "test-workflow");
        assert_eq!(restored.execution_id, ctx.execution_id);
        assert_eq!(restored.get("gather"), Some(&json!("news")));
        assert_eq!(restored.get("topic"), Some(&json!("rust")));
    }

    #[test]
    fn test_restore_rejects_garbage() {
        assert!(ExecutionContext::from_json(json!("not a context")).is_err());
    }

    #[test]
    fn test_total_size_is_small_when_empty() {
        let ctx = ExecutionContext::new("empty", Uuid::now_v7(), HashMap::new());
        assert!(ctx.total_size() < 100);
    }
}
