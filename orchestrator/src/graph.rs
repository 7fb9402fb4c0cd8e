// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Static ordering between phases.
//!
//! The graph never changes at runtime; it exists so that ordering is a
//! checked property instead of a convention.  Edges run from prerequisite
//! to dependent, execution follows a topological sort, and teardown walks
//! the same sort backwards.

use std::collections::{BTreeMap, BTreeSet};

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;

use crate::phases::{PHASES, PhaseId, PhaseSpec};

#[derive(Debug, Error)]
#[error("phase dependencies contain a cycle through {0}")]
pub struct CycleError(pub PhaseId);

#[derive(Debug)]
pub struct PhaseGraph {
    graph: DiGraph<PhaseId, ()>,
    index: BTreeMap<PhaseId, NodeIndex>,
    /// Full topological order, fixed at construction.
    topo: Vec<PhaseId>,
}

impl PhaseGraph {
    /// Builds a graph over all phases from `prerequisite -> dependent`
    /// edges, rejecting cycles.
    pub fn new(
        edges: impl IntoIterator<Item = (PhaseId, PhaseId)>,
    ) -> Result<PhaseGraph, CycleError> {
        let mut graph = DiGraph::new();
        let mut index = BTreeMap::new();
        for id in PhaseId::ALL {
            index.insert(id, graph.add_node(id));
        }
        for (prereq, dependent) in edges {
            graph.update_edge(index[&prereq], index[&dependent], ());
        }
        let topo = toposort(&graph, None)
            .map_err(|cycle| CycleError(graph[cycle.node_id()]))?
            .into_iter()
            .map(|ix| graph[ix])
            .collect();
        Ok(PhaseGraph { graph, index, topo })
    }

    pub fn from_specs(specs: &[PhaseSpec]) -> Result<PhaseGraph, CycleError> {
        Self::new(specs.iter().flat_map(|spec| {
            spec.prerequisites.iter().map(|prereq| (*prereq, spec.id))
        }))
    }

    /// The production graph, built from the static phase table.
    pub fn production() -> PhaseGraph {
        Self::from_specs(&PHASES).expect("the static phase table is acyclic")
    }

    /// Direct prerequisites of `phase`.
    pub fn prerequisites_of(&self, phase: PhaseId) -> BTreeSet<PhaseId> {
        self.graph
            .neighbors_directed(self.index[&phase], Direction::Incoming)
            .map(|ix| self.graph[ix])
            .collect()
    }

    /// Direct dependents of `phase`.
    pub fn dependents_of(&self, phase: PhaseId) -> BTreeSet<PhaseId> {
        self.graph
            .neighbors_directed(self.index[&phase], Direction::Outgoing)
            .map(|ix| self.graph[ix])
            .collect()
    }

    /// `requested` plus every transitive prerequisite.
    pub fn closure(&self, requested: &[PhaseId]) -> BTreeSet<PhaseId> {
        let mut members = BTreeSet::new();
        let mut stack = requested.to_vec();
        while let Some(phase) = stack.pop() {
            if members.insert(phase) {
                stack.extend(self.prerequisites_of(phase));
            }
        }
        members
    }

    /// Execution order for `requested` plus its transitive prerequisites.
    pub fn order(&self, requested: &[PhaseId]) -> Vec<PhaseId> {
        let members = self.closure(requested);
        self.topo.iter().copied().filter(|p| members.contains(p)).collect()
    }

    /// Execution order over exactly `requested`, without expanding
    /// prerequisites.
    pub fn order_isolated(&self, requested: &[PhaseId]) -> Vec<PhaseId> {
        let members: BTreeSet<_> = requested.iter().copied().collect();
        self.topo.iter().copied().filter(|p| members.contains(p)).collect()
    }

    /// Teardown order: reverse topological order over `requested` plus
    /// every transitive dependent.  Destroying a phase implies first
    /// destroying whatever was built on top of it.
    pub fn reverse_order(&self, requested: &[PhaseId]) -> Vec<PhaseId> {
        let mut members = BTreeSet::new();
        let mut stack = requested.to_vec();
        while let Some(phase) = stack.pop() {
            if members.insert(phase) {
                stack.extend(self.dependents_of(phase));
            }
        }
        self.topo
            .iter()
            .rev()
            .copied()
            .filter(|p| members.contains(p))
            .collect()
    }
}
