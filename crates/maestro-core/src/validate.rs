//! Structural validation of workflow definitions.
//!
//! Every check runs and every problem is reported -- the caller gets the
//! complete list, never just the first issue. A definition with a non-empty
//! issue list never reaches the scheduler.

use std::collections::{BTreeSet, HashSet};

use maestro_types::workflow::WorkflowDefinition;
use thiserror::Error;

use crate::graph::{DependencyGraph, GraphError};
use crate::registry::AgentRegistry;
use crate::template::{extract_placeholders, path_root};

// ---------------------------------------------------------------------------
// Issues
// ---------------------------------------------------------------------------

/// A single structural problem found in a definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationIssue {
    #[error("duplicate step key: '{0}'")]
    DuplicateStepKey(String),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    /// Cycle reported by the graph builder, surfaced verbatim.
    #[error(transparent)]
    Graph(GraphError),

    #[error(
        "step '{step}' prompt placeholder '{placeholder}' does not reference a known step or input"
    )]
    UnknownPlaceholderRoot { step: String, placeholder: String },

    #[error("step '{step}' is assigned to unknown agent '{agent}' (available: {available})")]
    UnknownAgent {
        step: String,
        agent: String,
        available: String,
    },
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a definition against the declared input variables and, when
/// given, the agent registry. Returns every issue found (empty ⇒ valid).
///
/// `inputs` holds the names of the variables the caller will seed the
/// execution context with; placeholder roots may reference those as well as
/// step keys. Validation runs once, at execution start, before any step
/// executes.
pub fn validate_definition(
    definition: &WorkflowDefinition,
    inputs: &BTreeSet<String>,
    agents: Option<&AgentRegistry>,
) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    // Duplicate step keys.
    let mut seen: HashSet<&str> = HashSet::new();
    for step in &definition.steps {
        if !seen.insert(step.key.as_str()) {
            issues.push(ValidationIssue::DuplicateStepKey(step.key.clone()));
        }
    }

    // Dependencies must reference existing steps.
    let mut dangling = false;
    for step in &definition.steps {
        for dep in &step.dependencies {
            if !seen.contains(dep.as_str()) {
                dangling = true;
                issues.push(ValidationIssue::UnknownDependency {
                    step: step.key.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    // Cycles: delegate to the graph builder. Only meaningful once every
    // dependency resolves, otherwise the builder would re-report the
    // dangling reference.
    if !dangling {
        if let Err(err @ GraphError::Cycle { .. }) = DependencyGraph::build(definition) {
            issues.push(ValidationIssue::Graph(err));
        }
    }

    // Placeholder roots must name a step or a declared input.
    for step in &definition.steps {
        let mut reported: HashSet<String> = HashSet::new();
        for placeholder in extract_placeholders(&step.prompt) {
            let root = path_root(&placeholder);
            if !seen.contains(root) && !inputs.contains(root) && reported.insert(placeholder.clone())
            {
                issues.push(ValidationIssue::UnknownPlaceholderRoot {
                    step: step.key.clone(),
                    placeholder,
                });
            }
        }
    }

    // Explicit agent assignments must resolve against the registry.
    if let Some(registry) = agents {
        for step in &definition.steps {
            if let Some(agent) = &step.agent {
                if !registry.contains(agent) {
                    issues.push(ValidationIssue::UnknownAgent {
                        step: step.key.clone(),
                        agent: agent.clone(),
                        available: registry.names().join(", "),
                    });
                }
            }
        }
    }

    issues
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{definition, step, step_with_deps};
    use maestro_types::agent::AgentProfile;

    fn no_inputs() -> BTreeSet<String> {
        BTreeSet::new()
    }

    fn registry(names: &[&str]) -> AgentRegistry {
        names
            .iter()
            .map(|n| AgentProfile {
                name: n.to_string(),
                description: None,
                capabilities: vec![],
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Individual checks
    // -----------------------------------------------------------------------

    #[test]
    fn test_valid_definition_has_no_issues() {
        let def = definition(vec![step("a"), step_with_deps("b", &["a"])]);
        assert!(validate_definition(&def, &no_inputs(), None).is_empty());
    }

    #[test]
    fn test_duplicate_step_keys() {
        let def = definition(vec![step("a"), step("a")]);
        let issues = validate_definition(&def, &no_inputs(), None);
        assert_eq!(issues, vec![ValidationIssue::DuplicateStepKey("a".to_string())]);
    }

    #[test]
    fn test_unknown_dependency() {
        let def = definition(vec![step_with_deps("a", &["ghost"])]);
        let issues = validate_definition(&def, &no_inputs(), None);
        assert_eq!(
            issues,
            vec![ValidationIssue::UnknownDependency {
                step: "a".to_string(),
                dependency: "ghost".to_string(),
            }]
        );
    }

    #[test]
    fn test_cycle_surfaces_graph_message() {
        let def = definition(vec![
            step_with_deps("a", &["b"]),
            step_with_deps("b", &["a"]),
        ]);
        let issues = validate_definition(&def, &no_inputs(), None);
        assert_eq!(issues.len(), 1);
        assert_eq!(
            issues[0].to_string(),
            "dependency cycle detected: a -> b -> a"
        );
    }

    #[test]
    fn test_placeholder_root_must_be_step_or_input() {
        let mut def = definition(vec![step("gather"), step_with_deps("analyze", &["gather"])]);
        def.steps[1].prompt = "Use {{gather.output}} and {{topic}} and {{typo.field}}".to_string();

        let inputs = BTreeSet::from(["topic".to_string()]);
        let issues = validate_definition(&def, &inputs, None);
        assert_eq!(
            issues,
            vec![ValidationIssue::UnknownPlaceholderRoot {
                step: "analyze".to_string(),
                placeholder: "typo.field".to_string(),
            }]
        );
    }

    #[test]
    fn test_unknown_agent_lists_available_agents() {
        let mut def = definition(vec![step("a")]);
        def.steps[0].agent = Some("ghostwriter".to_string());

        let issues =
            validate_definition(&def, &no_inputs(), Some(&registry(&["researcher", "writer"])));
        assert_eq!(issues.len(), 1);
        let message = issues[0].to_string();
        assert!(message.contains("ghostwriter"));
        assert!(message.contains("researcher, writer"));
    }

    #[test]
    fn test_agents_not_checked_without_registry() {
        let mut def = definition(vec![step("a")]);
        def.steps[0].agent = Some("anyone".to_string());
        assert!(validate_definition(&def, &no_inputs(), None).is_empty());
    }

    // -----------------------------------------------------------------------
    // Completeness: every problem surfaces in one pass
    // -----------------------------------------------------------------------

    #[test]
    fn test_all_issues_reported_together() {
        let mut def = definition(vec![
            step("a"),
            step("a"),
            step_with_deps("b", &["ghost"]),
        ]);
        def.steps[2].prompt = "{{nowhere.out}}".to_string();
        def.steps[2].agent = Some("phantom".to_string());

        let issues = validate_definition(&def, &no_inputs(), Some(&registry(&["researcher"])));
        assert_eq!(issues.len(), 4, "got: {issues:?}");
        assert!(issues
            .iter()
            .any(|i| matches!(i, ValidationIssue::DuplicateStepKey(_))));
        assert!(issues
            .iter()
            .any(|i| matches!(i, ValidationIssue::UnknownDependency { .. })));
        assert!(issues
            .iter()
            .any(|i| matches!(i, ValidationIssue::UnknownPlaceholderRoot { .. })));
        assert!(issues
            .iter()
            .any(|i| matches!(i, ValidationIssue::UnknownAgent { .. })));
    }

    #[test]
    fn test_duplicate_placeholder_reported_once_per_step() {
        let mut def = definition(vec![step("a")]);
        def.steps[0].prompt = "{{ghost}} and {{ghost}} again".to_string();
        let issues = validate_definition(&def, &no_inputs(), None);
        assert_eq!(issues.len(), 1);
    }
}
