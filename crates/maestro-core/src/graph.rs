//! DAG builder: adjacency, cycle detection, topological order, and levels.
//!
//! Models step dependencies as a `petgraph` directed graph (edge: dependency
//! -> dependent). Cycle detection is a depth-first search with a recursion
//! stack so the reported cycle is the exact key sequence, not just one
//! offending node. Topological order comes from repeated removal of
//! zero-in-degree nodes in definition order, which keeps the output
//! deterministic. Levels group steps whose dependencies are all satisfied by
//! earlier levels; steps sharing a level may run concurrently.

use std::collections::BTreeMap;

use maestro_types::workflow::WorkflowDefinition;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while building a `DependencyGraph`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// A step references a dependency that does not exist. Reported
    /// distinctly from a cycle.
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    /// The dependency graph contains a cycle. `path` is the exact cycle:
    /// it starts and ends on the same step key.
    #[error("dependency cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },
}

// ---------------------------------------------------------------------------
// DependencyGraph
// ---------------------------------------------------------------------------

/// Per-step view inside a built graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
    /// Keys this step depends on, as declared.
    pub dependencies: Vec<String>,
    /// Keys of steps that depend on this step (reverse edges).
    pub dependents: Vec<String>,
    /// Dependency depth: `1 + max(level of dependencies)`, `0` for roots.
    pub level: usize,
}

/// Read-only derived view of a `WorkflowDefinition`'s dependency structure.
///
/// Built once per execution start or resume; immutable thereafter.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: BTreeMap<String, GraphNode>,
    topological_order: Vec<String>,
    levels: Vec<Vec<String>>,
}

impl DependencyGraph {
    /// Build the graph for a definition, or report the first structural
    /// problem (`UnknownDependency` or `Cycle`).
    pub fn build(definition: &WorkflowDefinition) -> Result<Self, GraphError> {
        let steps = &definition.steps;
        let index_of: BTreeMap<&str, usize> = steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.key.as_str(), i))
            .collect();

        // Forward adjacency in petgraph: edge from dependency to dependent.
        let mut graph = DiGraph::<&str, ()>::new();
        let node_indices: Vec<NodeIndex> =
            steps.iter().map(|s| graph.add_node(s.key.as_str())).collect();

        for (i, step) in steps.iter().enumerate() {
            for dep in &step.dependencies {
                let dep_pos = index_of.get(dep.as_str()).ok_or_else(|| {
                    GraphError::UnknownDependency {
                        step: step.key.clone(),
                        dependency: dep.clone(),
                    }
                })?;
                graph.add_edge(node_indices[*dep_pos], node_indices[i], ());
            }
        }

        if let Some(path) = find_cycle(&graph, &node_indices) {
            return Err(GraphError::Cycle { path });
        }

        // Topological order: repeatedly remove zero-in-degree nodes, always
        // scanning in definition order so the result is deterministic.
        let mut in_degree: Vec<usize> = node_indices
            .iter()
            .map(|&idx| graph.neighbors_directed(idx, Direction::Incoming).count())
            .collect();
        let mut removed = vec![false; steps.len()];
        let mut topological_order = Vec::with_capacity(steps.len());

        while topological_order.len() < steps.len() {
            let mut progressed = false;
            for i in 0..steps.len() {
                if !removed[i] && in_degree[i] == 0 {
                    removed[i] = true;
                    progressed = true;
                    topological_order.push(steps[i].key.clone());
                    for dependent in graph.neighbors_directed(node_indices[i], Direction::Outgoing)
                    {
                        in_degree[index_of[graph[dependent]]] -= 1;
                    }
                }
            }
            if !progressed {
                // Unreachable: the DFS above already rejected cycles.
                break;
            }
        }
        debug_assert_eq!(topological_order.len(), steps.len());

        // Level assignment in topological order.
        let mut level_of: BTreeMap<&str, usize> = BTreeMap::new();
        for key in &topological_order {
            let step = &steps[index_of[key.as_str()]];
            let level = step
                .dependencies
                .iter()
                .map(|dep| level_of[dep.as_str()] + 1)
                .max()
                .unwrap_or(0);
            level_of.insert(key.as_str(), level);
        }

        // Partition into level batches, preserving definition order within
        // each level.
        let max_level = level_of.values().copied().max().unwrap_or(0);
        let mut levels: Vec<Vec<String>> =
            vec![Vec::new(); if steps.is_empty() { 0 } else { max_level + 1 }];
        for step in steps {
            levels[level_of[step.key.as_str()]].push(step.key.clone());
        }

        let mut nodes: BTreeMap<String, GraphNode> = steps
            .iter()
            .map(|s| {
                (
                    s.key.clone(),
                    GraphNode {
                        dependencies: s.dependencies.clone(),
                        dependents: Vec::new(),
                        level: level_of[s.key.as_str()],
                    },
                )
            })
            .collect();
        for step in steps {
            for dep in &step.dependencies {
                if let Some(node) = nodes.get_mut(dep) {
                    node.dependents.push(step.key.clone());
                }
            }
        }

        Ok(Self {
            nodes,
            topological_order,
            levels,
        })
    }

    /// Number of steps in the graph.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no steps.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The node view for a step key.
    pub fn node(&self, key: &str) -> Option<&GraphNode> {
        self.nodes.get(key)
    }

    /// Dependency level of a step.
    pub fn level_of(&self, key: &str) -> Option<usize> {
        self.nodes.get(key).map(|n| n.level)
    }

    /// Full topological order over all step keys.
    pub fn topological_order(&self) -> &[String] {
        &self.topological_order
    }

    /// The level partition: `levels()[0]` is the first batch to execute.
    pub fn levels(&self) -> &[Vec<String>] {
        &self.levels
    }

    /// All step keys, in a deterministic order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Cycle detection
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// DFS in the depends-on direction, tracking the recursion stack.
///
/// Returns the exact cycle as `[first, ..., first]` when one exists. Walking
/// toward dependencies (incoming edges of the dependency -> dependent graph)
/// makes the reported path read in "a depends on b depends on ... on a"
/// order.
fn find_cycle(graph: &DiGraph<&str, ()>, node_indices: &[NodeIndex]) -> Option<Vec<String>> {
    let mut marks = vec![Mark::Unvisited; graph.node_count()];
    let mut stack: Vec<NodeIndex> = Vec::new();

    for &start in node_indices {
        if marks[start.index()] == Mark::Unvisited {
            if let Some(path) = visit(graph, start, &mut marks, &mut stack) {
                return Some(path);
            }
        }
    }
    None
}

fn visit(
    graph: &DiGraph<&str, ()>,
    node: NodeIndex,
    marks: &mut [Mark],
    stack: &mut Vec<NodeIndex>,
) -> Option<Vec<String>> {
    marks[node.index()] = Mark::OnStack;
    stack.push(node);

    for dep in graph.neighbors_directed(node, Direction::Incoming) {
        match marks[dep.index()] {
            Mark::Unvisited => {
                if let Some(path) = visit(graph, dep, marks, stack) {
                    return Some(path);
                }
            }
            Mark::OnStack => {
                let first = stack.iter().position(|&n| n == dep).unwrap_or(0);
                let mut path: Vec<String> =
                    stack[first..].iter().map(|&n| graph[n].to_string()).collect();
                path.push(graph[dep].to_string());
                return Some(path);
            }
            Mark::Done => {}
        }
    }

    stack.pop();
    marks[node.index()] = Mark::Done;
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
