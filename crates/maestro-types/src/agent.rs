//! Agent types for Maestro.
//!
//! `AgentProfile` describes an agent the platform can dispatch work to;
//! `AgentSuggestion` is the dispatcher's ranked recommendation for an
//! unassigned step.

use serde::{Deserialize, Serialize};

/// A dispatchable agent known to the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    /// Unique agent name (e.g. "researcher").
    pub name: String,
    /// What this agent is good at, for humans and for semantic matching.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Capability tags used for type-based matching (e.g. "summarize").
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
}

/// Why a suggested agent was matched to a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionBasis {
    /// The step's explicit agent tag named this agent.
    ExplicitTag,
    /// A capability tag of the agent matched the step's needs.
    TypeMatch,
    /// Semantic similarity between the step prompt and the agent description.
    SemanticSimilarity,
}

/// A ranked agent recommendation for an unassigned step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSuggestion {
    /// Name of the suggested agent.
    pub agent: String,
    /// Confidence in [0.0, 1.0]; higher ranks first.
    pub confidence: f64,
    /// Rationale tier for the match.
    pub basis: SuggestionBasis,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suggestion_basis_serde_names() {
        let json = serde_json::to_string(&SuggestionBasis::SemanticSimilarity).unwrap();
        assert_eq!(json, "\"semantic_similarity\"");
        let parsed: SuggestionBasis = serde_json::from_str("\"explicit_tag\"").unwrap();
        assert_eq!(parsed, SuggestionBasis::ExplicitTag);
    }

    #[test]
    fn test_suggestion_roundtrip() {
        let suggestion = AgentSuggestion {
            agent: "researcher".to_string(),
            confidence: 0.92,
            basis: SuggestionBasis::TypeMatch,
        };
        let json = serde_json::to_string(&suggestion).unwrap();
        let parsed: AgentSuggestion = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.agent, "researcher");
        assert_eq!(parsed.basis, SuggestionBasis::TypeMatch);
    }

    #[test]
    fn test_profile_defaults() {
        let profile: AgentProfile = serde_json::from_str(r#"{"name": "coder"}"#).unwrap();
        assert_eq!(profile.name, "coder");
        assert!(profile.description.is_none());
        assert!(profile.capabilities.is_empty());
    }
}
