// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Dependency graph of a pipeline instance
//!
//! Nodes are slot names; an edge A → B carries the output of A and the input
//! of B it was wired into. The graph is built once per instance from the
//! edges recorded during wiring and never changes afterwards.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::{BTreeSet, HashMap};

use crate::errors::{StepflowError, StepflowResult};

/// An artifact dependency between two slots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEdge {
    pub from: String,
    pub output: String,
    pub to: String,
    pub input: String,
}

/// Immutable slot graph
#[derive(Debug, Clone)]
pub struct PipelineDag {
    graph: DiGraph<String, (String, String)>,
    name_to_index: HashMap<String, NodeIndex>,
    order: Vec<NodeIndex>,
}

impl PipelineDag {
    /// Build a graph over `slots` from wiring edges
    pub(crate) fn build(
        pipeline: &str,
        slots: &[String],
        edges: &[DependencyEdge],
    ) -> StepflowResult<Self> {
        let mut graph = DiGraph::new();
        let mut name_to_index = HashMap::new();

        for slot in slots {
            let node = graph.add_node(slot.clone());
            name_to_index.insert(slot.clone(), node);
        }

        for edge in edges {
            let (Some(from), Some(to)) = (name_to_index.get(&edge.from), name_to_index.get(&edge.to))
            else {
                return Err(StepflowError::binding(
                    pipeline,
                    format!("edge {} -> {} references an unknown slot", edge.from, edge.to),
                ));
            };
            graph.add_edge(*from, *to, (edge.output.clone(), edge.input.clone()));
        }

        // Wiring only hands out outputs of slots already called, so a cycle
        // here means the edge list did not come from wiring
        let order = toposort(&graph, None).map_err(|cycle| {
            StepflowError::binding(
                pipeline,
                format!("dependency cycle through slot '{}'", graph[cycle.node_id()]),
            )
        })?;

        Ok(Self {
            graph,
            name_to_index,
            order,
        })
    }

    /// Slot names in topological order
    pub fn topological_order(&self) -> Vec<&str> {
        self.order.iter().map(|n| self.graph[*n].as_str()).collect()
    }

    pub fn contains(&self, slot: &str) -> bool {
        self.name_to_index.contains_key(slot)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Direct dependencies of a slot (slots that must run before it)
    pub fn dependencies(&self, slot: &str) -> Option<Vec<String>> {
        self.neighbours(slot, Direction::Incoming)
    }

    /// Direct dependents of a slot (slots that consume its outputs)
    pub fn dependents(&self, slot: &str) -> Option<Vec<String>> {
        self.neighbours(slot, Direction::Outgoing)
    }

    fn neighbours(&self, slot: &str, direction: Direction) -> Option<Vec<String>> {
        let node = self.name_to_index.get(slot)?;
        let set: BTreeSet<String> = self
            .graph
            .neighbors_directed(*node, direction)
            .map(|n| self.graph[n].clone())
            .collect();
        Some(set.into_iter().collect())
    }

    /// Edges feeding a slot's inputs
    pub fn incoming(&self, slot: &str) -> Vec<DependencyEdge> {
        let Some(node) = self.name_to_index.get(slot) else {
            return Vec::new();
        };
        let mut edges: Vec<DependencyEdge> = self
            .graph
            .edges_directed(*node, Direction::Incoming)
            .map(|e| DependencyEdge {
                from: self.graph[e.source()].clone(),
                output: e.weight().0.clone(),
                to: slot.to_string(),
                input: e.weight().1.clone(),
            })
            .collect();
        edges.sort_by(|a, b| a.input.cmp(&b.input));
        edges
    }

    /// All edges, grouped by consumer in topological order
    pub fn edges(&self) -> Vec<DependencyEdge> {
        self.order
            .iter()
            .flat_map(|n| self.incoming(&self.graph[*n]))
            .collect()
    }

    /// Check if slot `a` depends (directly or transitively) on slot `b`
    pub fn depends_on(&self, a: &str, b: &str) -> bool {
        let Some(node_a) = self.name_to_index.get(a) else {
            return false;
        };
        let Some(node_b) = self.name_to_index.get(b) else {
            return false;
        };
        if node_a == node_b {
            return false;
        }

        petgraph::algo::has_path_connecting(&self.graph, *node_b, *node_a, None)
    }

    /// Every slot reachable from `slot`, excluding itself
    pub fn descendants(&self, slot: &str) -> Vec<String> {
        let Some(start) = self.name_to_index.get(slot) else {
            return Vec::new();
        };
        let mut seen = BTreeSet::new();
        let mut stack = vec![*start];
        while let Some(node) = stack.pop() {
            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                if seen.insert(self.graph[next].clone()) {
                    stack.push(next);
                }
            }
        }
        seen.into_iter().collect()
    }

    /// Generate Mermaid diagram of the DAG
    pub fn to_mermaid(&self) -> String {
        let mut out = String::from("graph TD\n");

        for node in &self.order {
            let name = &self.graph[*node];
            out.push_str(&format!("    {}[{}]\n", name, name));
        }

        for edge in self.edges() {
            out.push_str(&format!(
                "    {} -->|{}:{}| {}\n",
                edge.from, edge.output, edge.input, edge.to
            ));
        }

        out
    }

    /// Generate DOT diagram of the DAG
    pub fn to_dot(&self, name: &str) -> String {
        let mut out = format!("digraph \"{}\" {{\n", name);
        out.push_str("    rankdir=TB;\n");
        out.push_str("    node [shape=box, style=rounded];\n\n");

        for edge in self.edges() {
            out.push_str(&format!(
                "    \"{}\" -> \"{}\" [label=\"{}\"];\n",
                edge.from, edge.to, edge.input
            ));
        }

        // Isolated nodes
        for node in &self.order {
            if self.graph.neighbors_undirected(*node).count() == 0 {
                out.push_str(&format!("    \"{}\";\n", self.graph[*node]));
            }
        }

        out.push_str("}\n");
        out
    }

    /// Text listing of the execution order. `describe` supplies the step
    /// name shown next to each slot.
    pub fn to_text(&self, describe: impl Fn(&str) -> String) -> String {
        let mut out = String::new();

        for (i, slot) in self.topological_order().into_iter().enumerate() {
            let deps = self.dependencies(slot).unwrap_or_default();

            out.push_str(&format!("{}. {} ({})", i + 1, slot, describe(slot)));

            if !deps.is_empty() {
                out.push_str(&format!(" [depends: {}]", deps.join(", ")));
            }

            out.push('\n');
        }

        out
    }
}
