//! Call dependency graph with petgraph
//!
//! Directed graph over callables: an edge `caller -> callee` means the
//! caller's analysis reads the callee's model. The fixpoint driver uses
//! reverse edges to find which callables to re-analyze after a model
//! changes, and the SCC postorder to schedule dependencies first.
//!
//! Self-loops are kept on purpose: a recursive callable reads its own
//! model, so it is its own dependent.

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use rustc_hash::FxHashMap;
use std::collections::{BTreeSet, VecDeque};

use crate::facts::{Callable, FactStore};

/// Callable dependency graph.
pub struct DependencyGraph {
    /// Directed graph: caller -> callee it depends on.
    graph: DiGraph<Callable, ()>,

    /// Callable -> node index mapping.
    node_of: FxHashMap<Callable, NodeIndex>,

    /// Strongly connected components with more than one member.
    cycles: Vec<Vec<Callable>>,

    /// All callables, dependencies before dependents.
    analysis_order: Vec<Callable>,
}

impl DependencyGraph {
    /// Create empty dependency graph
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            node_of: FxHashMap::default(),
            cycles: Vec::new(),
            analysis_order: Vec::new(),
        }
    }

    /// Build the graph from registered callable bodies. Call targets are
    /// expanded through the override relation, so a call on a base method
    /// also creates edges to every overrider.
    pub fn build(store: &FactStore) -> Self {
        let mut graph = DiGraph::new();
        let mut node_of = FxHashMap::default();

        for callable in store.callables() {
            let idx = graph.add_node(callable.clone());
            node_of.insert(callable, idx);
        }

        for (caller, callee) in store.call_edges() {
            let caller_idx = match node_of.get(&caller) {
                Some(idx) => *idx,
                None => continue,
            };
            // Calls into callables without registered bodies (externals,
            // modeled-only names) carry no analysis dependency.
            if let Some(&callee_idx) = node_of.get(&callee) {
                graph.add_edge(caller_idx, callee_idx, ());
            }
        }

        // Tarjan returns SCCs in postorder of the condensation, which for
        // caller -> callee edges is exactly dependencies-first. Members
        // within one SCC are sorted for determinism.
        let sccs = tarjan_scc(&graph);
        let mut analysis_order = Vec::with_capacity(graph.node_count());
        let mut cycles = Vec::new();
        for scc in &sccs {
            let mut members: Vec<Callable> = scc.iter().map(|&idx| graph[idx].clone()).collect();
            members.sort();
            if members.len() > 1 {
                cycles.push(members.clone());
            }
            analysis_order.extend(members);
        }

        Self {
            graph,
            node_of,
            cycles,
            analysis_order,
        }
    }

    /// Callables whose analysis reads `callable`'s model.
    pub fn get_dependents(&self, callable: &Callable) -> Vec<Callable> {
        let mut dependents = match self.node_of.get(callable) {
            Some(&idx) => self
                .graph
                .neighbors_directed(idx, Direction::Incoming)
                .map(|idx| self.graph[idx].clone())
                .collect(),
            None => Vec::new(),
        };
        dependents.sort();
        dependents.dedup();
        dependents
    }

    /// Callables whose models `callable`'s analysis reads.
    pub fn get_dependencies(&self, callable: &Callable) -> Vec<Callable> {
        let mut dependencies = match self.node_of.get(callable) {
            Some(&idx) => self
                .graph
                .neighbors_directed(idx, Direction::Outgoing)
                .map(|idx| self.graph[idx].clone())
                .collect(),
            None => Vec::new(),
        };
        dependencies.sort();
        dependencies.dedup();
        dependencies
    }

    /// Everything that transitively depends on `callable`, excluding the
    /// callable itself unless it sits on a cycle through itself.
    pub fn get_transitive_dependents(&self, callable: &Callable) -> Vec<Callable> {
        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::new();

        if let Some(&idx) = self.node_of.get(callable) {
            queue.push_back(idx);
        }

        while let Some(idx) = queue.pop_front() {
            for neighbor in self.graph.neighbors_directed(idx, Direction::Incoming) {
                if visited.insert(self.graph[neighbor].clone()) {
                    queue.push_back(neighbor);
                }
            }
        }

        visited.into_iter().collect()
    }

    /// All callables, dependencies before dependents. Cycle members appear
    /// consecutively in sorted order.
    pub fn analysis_order(&self) -> &[Callable] {
        &self.analysis_order
    }

    /// Get detected dependency cycles
    pub fn cycles(&self) -> &[Vec<Callable>] {
        &self.cycles
    }

    pub fn has_cycles(&self) -> bool {
        !self.cycles.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}
