//! Pipeline stage graph
//!
//! Stages and the artifacts flowing between them form a DAG. The
//! executor runs it wave by wave: every stage in a wave has all of its
//! inputs produced by earlier waves, so stages within a wave run
//! concurrently.

use std::collections::{HashMap, HashSet};
use std::fmt;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::checks::{Check, CheckRegistry};

/// A node of the pipeline graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Filter,
    Dependencies,
    Package,
    Check(Check),
    Environment,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Filter => f.write_str("filter"),
            Self::Dependencies => f.write_str("dependencies"),
            Self::Package => f.write_str("package"),
            Self::Check(check) => write!(f, "check:{}", check),
            Self::Environment => f.write_str("environment"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("stage graph contains a cycle")]
    CycleDetected,
}

/// Stage DAG with edges from producer to consumer
#[derive(Debug)]
pub struct PipelineGraph {
    graph: DiGraph<Stage, ()>,
    nodes: HashMap<Stage, NodeIndex>,
}

impl Default for PipelineGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            nodes: HashMap::new(),
        }
    }

    /// The standard pipeline for a check registry.
    ///
    /// ```text
    /// filter ─┬─> dependencies ─┬─> package ──> check:build ─┐
    ///         │                 ├─> check:lint ──────────────┤
    ///         │                 └─> check:doc ───────────────┼─> environment
    ///         └─> check:format ──────────────────────────────┘
    /// ```
    ///
    /// The build check consumes the package stage's outcome instead of
    /// compiling a second time.
    pub fn standard(registry: &CheckRegistry) -> Self {
        let mut graph = Self::new();
        graph.add_edge(Stage::Filter, Stage::Dependencies);
        graph.add_edge(Stage::Dependencies, Stage::Package);
        graph.add_edge(Stage::Package, Stage::Environment);

        for &check in registry.checks() {
            let stage = Stage::Check(check);
            match check {
                Check::Build => graph.add_edge(Stage::Package, stage),
                Check::Format => graph.add_edge(Stage::Filter, stage),
                Check::Lint | Check::Doc => graph.add_edge(Stage::Dependencies, stage),
            }
            graph.add_edge(stage, Stage::Environment);
        }
        graph
    }

    pub fn add_stage(&mut self, stage: Stage) -> NodeIndex {
        if let Some(&idx) = self.nodes.get(&stage) {
            return idx;
        }
        let idx = self.graph.add_node(stage);
        self.nodes.insert(stage, idx);
        idx
    }

    /// `from` produces an input of `to`
    pub fn add_edge(&mut self, from: Stage, to: Stage) {
        let from = self.add_stage(from);
        let to = self.add_stage(to);
        self.graph.update_edge(from, to, ());
    }

    pub fn contains(&self, stage: Stage) -> bool {
        self.nodes.contains_key(&stage)
    }

    /// Stages in insertion order
    pub fn stages(&self) -> Vec<Stage> {
        self.graph.node_indices().map(|idx| self.graph[idx]).collect()
    }

    /// Direct producers of a stage's inputs
    pub fn dependencies_of(&self, stage: Stage) -> Vec<Stage> {
        let Some(&idx) = self.nodes.get(&stage) else {
            return Vec::new();
        };
        let mut deps: Vec<NodeIndex> = self.graph.neighbors_directed(idx, Direction::Incoming).collect();
        deps.sort();
        deps.into_iter().map(|dep| self.graph[dep]).collect()
    }

    pub fn topological_order(&self) -> Result<Vec<Stage>, GraphError> {
        let sorted = toposort(&self.graph, None).map_err(|_| GraphError::CycleDetected)?;
        Ok(sorted.into_iter().map(|idx| self.graph[idx]).collect())
    }

    /// Stages grouped into waves of mutually independent stages.
    ///
    /// Within a wave, stages keep insertion order.
    pub fn waves(&self) -> Result<Vec<Vec<Stage>>, GraphError> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|idx| (idx, self.graph.neighbors_directed(idx, Direction::Incoming).count()))
            .collect();
        let mut remaining: HashSet<NodeIndex> = self.graph.node_indices().collect();
        let mut waves = Vec::new();

        while !remaining.is_empty() {
            let mut ready: Vec<NodeIndex> = remaining.iter().filter(|idx| in_degree[idx] == 0).copied().collect();
            if ready.is_empty() {
                return Err(GraphError::CycleDetected);
            }
            ready.sort();

            for idx in &ready {
                remaining.remove(idx);
                for next in self.graph.neighbors_directed(*idx, Direction::Outgoing) {
                    if let Some(deg) = in_degree.get_mut(&next) {
                        *deg = deg.saturating_sub(1);
                    }
                }
            }
            waves.push(ready.into_iter().map(|idx| self.graph[idx]).collect());
        }

        Ok(waves)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_waves() {
        let graph = PipelineGraph::standard(&CheckRegistry::default());
        let waves = graph.waves().unwrap();

        assert_eq!(
            waves,
            vec![
                vec![Stage::Filter],
                vec![Stage::Dependencies, Stage::Check(Check::Format)],
                vec![Stage::Package, Stage::Check(Check::Lint), Stage::Check(Check::Doc)],
                vec![Stage::Check(Check::Build)],
                vec![Stage::Environment],
            ]
        );
    }

    #[test]
    fn test_format_does_not_depend_on_dependencies() {
        let graph = PipelineGraph::standard(&CheckRegistry::default());
        assert_eq!(graph.dependencies_of(Stage::Check(Check::Format)), vec![Stage::Filter]);
        assert_eq!(graph.dependencies_of(Stage::Check(Check::Lint)), vec![Stage::Dependencies]);
    }

    #[test]
    fn test_registry_limits_check_stages() {
        let registry = CheckRegistry::new(vec![Check::Format]);
        let graph = PipelineGraph::standard(&registry);

        assert!(graph.contains(Stage::Check(Check::Format)));
        assert!(!graph.contains(Stage::Check(Check::Lint)));
        assert!(graph.contains(Stage::Package));
    }

    #[test]
    fn test_topological_order_respects_edges() {
        let graph = PipelineGraph::standard(&CheckRegistry::default());
        let order = graph.topological_order().unwrap();
        let pos = |s: Stage| order.iter().position(|x| *x == s).unwrap();

        assert!(pos(Stage::Filter) < pos(Stage::Dependencies));
        assert!(pos(Stage::Dependencies) < pos(Stage::Package));
        assert!(pos(Stage::Package) < pos(Stage::Check(Check::Build)));
        assert_eq!(pos(Stage::Environment), order.len() - 1);
    }

    #[test]
    fn test_cycle_detected() {
        let mut graph = PipelineGraph::new();
        graph.add_edge(Stage::Filter, Stage::Package);
        graph.add_edge(Stage::Package, Stage::Filter);

        assert_eq!(graph.waves(), Err(GraphError::CycleDetected));
        assert!(graph.topological_order().is_err());
    }

    #[test]
    fn test_duplicate_edges_are_merged() {
        let mut graph = PipelineGraph::new();
        graph.add_edge(Stage::Filter, Stage::Dependencies);
        graph.add_edge(Stage::Filter, Stage::Dependencies);
        assert_eq!(graph.dependencies_of(Stage::Dependencies), vec![Stage::Filter]);
        assert_eq!(graph.stages().len(), 2);
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(Stage::Check(Check::Lint).to_string(), "check:lint");
        assert_eq!(Stage::Dependencies.to_string(), "dependencies");
    }
}
