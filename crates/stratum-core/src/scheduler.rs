//! Kahn level-batching over a [`ResourceGraph`] edge view.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::error::StructuralError;
use crate::graph::ResourceGraph;
use crate::model::Direction;

/// One level of the plan: ids with no edges among them, sorted by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Batch {
    /// 0-indexed position in the plan.
    pub index: usize,
    pub ids: Vec<String>,
}

/// Compute the batches for `direction`.
///
/// Every id appears exactly once, and never before any of its prerequisites.
/// Output is deterministic for a given graph.
pub fn plan(graph: &ResourceGraph, direction: Direction) -> Result<Vec<Batch>, StructuralError> {
    let mut in_degree: BTreeMap<&str, usize> = graph
        .ids()
        .map(|id| (id, graph.prerequisites(id, direction).count()))
        .collect();

    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for id in graph.ids() {
        for prereq in graph.prerequisites(id, direction) {
            dependents.entry(prereq).or_default().push(id);
        }
    }

    let mut batches = Vec::new();
    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(&id, _)| id)
        .collect();
    let mut placed = 0;

    while !ready.is_empty() {
        ready.sort_unstable();
        let mut next = Vec::new();
        for id in &ready {
            for dependent in dependents.get(id).into_iter().flatten() {
                if let Some(deg) = in_degree.get_mut(dependent) {
                    *deg -= 1;
                    if *deg == 0 {
                        next.push(*dependent);
                    }
                }
            }
        }
        placed += ready.len();
        batches.push(Batch {
            index: batches.len(),
            ids: ready.iter().map(|s| s.to_string()).collect(),
        });
        ready = next;
    }

    if placed != graph.len() {
        let path = graph.find_cycle(direction).unwrap_or_default();
        return Err(StructuralError::Cycle { direction, path });
    }
    Ok(batches)
}

/// Tracks failures during a run so downstream nodes are skipped, not
/// attempted.
#[derive(Debug, Default)]
pub struct SkipTracker {
    failed: BTreeSet<String>,
    /// skipped id -> the failed resource that blocked it
    skipped: BTreeMap<String, String>,
}

impl SkipTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_failure(&mut self, id: impl Into<String>) {
        self.failed.insert(id.into());
    }

    pub fn is_failed(&self, id: &str) -> bool {
        self.failed.contains(id)
    }

    /// If any prerequisite of `id` failed or was itself skipped, remember
    /// `id` as skipped and return the failed resource at the root of it.
    pub fn check(
        &mut self,
        graph: &ResourceGraph,
        id: &str,
        direction: Direction,
    ) -> Option<String> {
        let root = graph.prerequisites(id, direction).find_map(|prereq| {
            if self.failed.contains(prereq) {
                Some(prereq.to_string())
            } else {
                self.skipped.get(prereq).cloned()
            }
        })?;
        self.skipped.insert(id.to_string(), root.clone());
        Some(root)
    }

    pub fn skipped(&self) -> &BTreeMap<String, String> {
        &self.skipped
    }
}
