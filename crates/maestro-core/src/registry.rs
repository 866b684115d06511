//! Registry of agents available to a workflow.
//!
//! The validator resolves explicit step assignments against this registry;
//! dispatchers may use it to rank suggestions for unassigned steps.

use std::collections::BTreeMap;

use maestro_types::agent::AgentProfile;

/// Name-indexed collection of agent profiles.
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: BTreeMap<String, AgentProfile>,
}

impl AgentRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) an agent profile.
    pub fn register(&mut self, profile: AgentProfile) {
        self.agents.insert(profile.name.clone(), profile);
    }

    /// Whether an agent with this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    /// Look up an agent profile by name.
    pub fn get(&self, name: &str) -> Option<&AgentProfile> {
        self.agents.get(name)
    }

    /// All registered agent names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.agents.keys().map(String::as_str).collect()
    }

    /// Number of registered agents.
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl FromIterator<AgentProfile> for AgentRegistry {
    fn from_iter<I: IntoIterator<Item = AgentProfile>>(iter: I) -> Self {
        let mut registry = Self::new();
        for profile in iter {
            registry.register(profile);
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(name: &str) -> AgentProfile {
        AgentProfile {
            name: name.to_string(),
            description: None,
            capabilities: vec![],
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry: AgentRegistry =
            [profile("researcher"), profile("writer")].into_iter().collect();
        assert!(registry.contains("researcher"));
        assert!(!registry.contains("ghost"));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["researcher", "writer"]);
    }

    #[test]
    fn test_reregister_replaces() {
        let mut registry = AgentRegistry::new();
        registry.register(profile("coder"));
        registry.register(AgentProfile {
            name: "coder".to_string(),
            description: Some("writes Rust".to_string()),
            capabilities: vec![],
        });
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get("coder").unwrap().description.as_deref(),
            Some("writes Rust")
        );
    }
}
