//! Dependency graph for prerequisite edges.
//!
//! Design:
//! - Forward edges: work -> work it waits for (prerequisites)
//! - Reverse edges: work -> work waiting for it (dependents)
//! - Invariant: edges and reverse_edges must be kept in sync

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::domain::WorkId;

/// Prerequisite graph.
///
/// BTree collections keep lookups ordered by id (ULIDs sort by creation time),
/// so dependents come back oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    /// Forward edges: work -> prerequisites
    edges: BTreeMap<WorkId, BTreeSet<WorkId>>,

    /// Reverse edges: work -> dependents
    reverse_edges: BTreeMap<WorkId, BTreeSet<WorkId>>,
}

/// Flat `(work, prerequisite)` pair as written to the snapshot file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub work: WorkId,
    pub prerequisite: WorkId,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a dependency: `work` waits for `prerequisite`.
    pub fn add_dependency(&mut self, work: WorkId, prerequisite: WorkId) {
        self.edges.entry(work).or_default().insert(prerequisite);
        self.reverse_edges
            .entry(prerequisite)
            .or_default()
            .insert(work);
    }

    /// Remove `id` and every edge touching it, in both directions.
    pub fn remove_node(&mut self, id: &WorkId) {
        if let Some(prereqs) = self.edges.remove(id) {
            for p in prereqs {
                if let Some(set) = self.reverse_edges.get_mut(&p) {
                    set.remove(id);
                    if set.is_empty() {
                        self.reverse_edges.remove(&p);
                    }
                }
            }
        }
        if let Some(dependents) = self.reverse_edges.remove(id) {
            for d in dependents {
                if let Some(set) = self.edges.get_mut(&d) {
                    set.remove(id);
                    if set.is_empty() {
                        self.edges.remove(&d);
                    }
                }
            }
        }
    }

    pub fn prerequisites(&self, id: &WorkId) -> Vec<WorkId> {
        self.edges
            .get(id)
            .map(|deps| deps.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn dependents(&self, id: &WorkId) -> Vec<WorkId> {
        self.reverse_edges
            .get(id)
            .map(|deps| deps.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn edges(&self) -> Vec<Edge> {
        self.edges
            .iter()
            .flat_map(|(work, prereqs)| {
                prereqs.iter().map(move |p| Edge {
                    work: *work,
                    prerequisite: *p,
                })
            })
            .collect()
    }

    pub fn from_edges(edges: impl IntoIterator<Item = Edge>) -> Self {
        let mut graph = Self::new();
        for e in edges {
            graph.add_dependency(e.work, e.prerequisite);
        }
        graph
    }
}
