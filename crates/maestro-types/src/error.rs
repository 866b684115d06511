//! Cross-layer error types.

use thiserror::Error;

/// A definition whose shape is malformed.
///
/// Caught at parse time, before validation runs; always fatal to the load.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("workflow name must not be empty")]
    EmptyName,

    #[error("workflow must declare at least one step")]
    NoSteps,

    #[error("step at index {0} has an empty key")]
    EmptyStepKey(usize),

    #[error("step '{0}' has an empty prompt")]
    EmptyPrompt(String),
}

/// Errors from repository operations (used by the port trait in maestro-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("storage connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}
