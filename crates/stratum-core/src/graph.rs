//! Validated resource graph with separate create and destroy edge views.
//!
//! An entry `prereqs[x] = {y, ...}` means every `y` must finish (Ready for
//! create, Destroyed for destroy) before `x` may start.
//!
//! - Create view: `x.create_depends_on`.
//! - Destroy view: the inverse of every create edge plus every destroy-only
//!   edge. `x.destroy_depends_on = [y]` makes `y` wait for `x`'s teardown.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::error::StructuralError;
use crate::model::{Direction, EdgeKind, ResourceSpec};
use crate::propagate::collect_references;

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9_-]{0,62}$").expect("static id pattern"))
}

/// Reject ids that are not 1-63 chars of `[a-z0-9_-]` starting alphanumeric.
pub fn validate_id(id: &str) -> Result<(), StructuralError> {
    if id_pattern().is_match(id) {
        Ok(())
    } else {
        Err(StructuralError::InvalidId { id: id.to_string() })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Gray,
    Black,
}

/// Directed dependency graph over [`ResourceSpec`]s.
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    specs: BTreeMap<String, Arc<ResourceSpec>>,
    create_prereqs: BTreeMap<String, BTreeSet<String>>,
    destroy_prereqs: BTreeMap<String, BTreeSet<String>>,
}

impl ResourceGraph {
    /// Build and validate a graph from the full desired spec set.
    ///
    /// Checks, in order: id syntax, duplicate ids, dangling dependencies,
    /// parameter references, then cycles in the create view and the destroy
    /// view. The first problem found is returned.
    pub fn build(specs: impl IntoIterator<Item = ResourceSpec>) -> Result<Self, StructuralError> {
        let mut by_id = BTreeMap::new();
        for spec in specs {
            validate_id(&spec.id)?;
            if by_id.contains_key(&spec.id) {
                return Err(StructuralError::DuplicateId { id: spec.id });
            }
            by_id.insert(spec.id.clone(), Arc::new(spec));
        }

        for spec in by_id.values() {
            for (edge, deps) in [
                (EdgeKind::CreateDependsOn, &spec.create_depends_on),
                (EdgeKind::DestroyDependsOn, &spec.destroy_depends_on),
            ] {
                if let Some(missing) = deps.iter().find(|d| !by_id.contains_key(*d)) {
                    return Err(StructuralError::DanglingDependency {
                        id: spec.id.clone(),
                        missing: missing.clone(),
                        edge,
                    });
                }
            }

            for reference in collect_references(&spec.id, &spec.parameters)? {
                if !by_id.contains_key(&reference.producer) {
                    return Err(StructuralError::DanglingReference {
                        id: spec.id.clone(),
                        producer: reference.producer,
                        reference: reference.raw,
                    });
                }
                if !spec.create_depends_on.contains(&reference.producer) {
                    return Err(StructuralError::UndeclaredReference {
                        id: spec.id.clone(),
                        producer: reference.producer,
                    });
                }
            }
        }

        let mut create_prereqs: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut destroy_prereqs: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for id in by_id.keys() {
            create_prereqs.insert(id.clone(), BTreeSet::new());
            destroy_prereqs.insert(id.clone(), BTreeSet::new());
        }
        for spec in by_id.values() {
            for dep in &spec.create_depends_on {
                create_prereqs
                    .entry(spec.id.clone())
                    .or_default()
                    .insert(dep.clone());
                destroy_prereqs
                    .entry(dep.clone())
                    .or_default()
                    .insert(spec.id.clone());
            }
            for later in &spec.destroy_depends_on {
                destroy_prereqs
                    .entry(later.clone())
                    .or_default()
                    .insert(spec.id.clone());
            }
        }

        let graph = Self {
            specs: by_id,
            create_prereqs,
            destroy_prereqs,
        };
        for direction in [Direction::Create, Direction::Destroy] {
            if let Some(path) = graph.find_cycle(direction) {
                return Err(StructuralError::Cycle { direction, path });
            }
        }
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.specs.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Arc<ResourceSpec>> {
        self.specs.get(id)
    }

    /// Specs in id order.
    pub fn specs(&self) -> impl Iterator<Item = &Arc<ResourceSpec>> {
        self.specs.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.specs.keys().map(String::as_str)
    }

    fn view(&self, direction: Direction) -> &BTreeMap<String, BTreeSet<String>> {
        match direction {
            Direction::Create => &self.create_prereqs,
            Direction::Destroy => &self.destroy_prereqs,
        }
    }

    /// Ids that must finish before `id` may start in `direction`.
    pub fn prerequisites(&self, id: &str, direction: Direction) -> impl Iterator<Item = &str> {
        self.view(direction)
            .get(id)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    /// Ids that wait directly on `id` in `direction`, in id order.
    pub fn dependents(&self, id: &str, direction: Direction) -> Vec<&str> {
        self.view(direction)
            .iter()
            .filter(|(_, prereqs)| prereqs.contains(id))
            .map(|(dependent, _)| dependent.as_str())
            .collect()
    }

    /// Everything downstream of `id` in `direction` (excluding `id`).
    pub fn transitive_dependents(&self, id: &str, direction: Direction) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents(current, direction) {
                if seen.insert(dependent.to_string()) {
                    queue.push_back(dependent);
                }
            }
        }
        seen
    }

    /// Three-color DFS over the prerequisite view. Returns the first cycle
    /// found as a closed path, e.g. `[a, b, a]`.
    pub fn find_cycle(&self, direction: Direction) -> Option<Vec<String>> {
        let view = self.view(direction);
        let mut marks: BTreeMap<&str, Mark> =
            view.keys().map(|id| (id.as_str(), Mark::White)).collect();
        let mut stack: Vec<&str> = Vec::new();

        for start in view.keys() {
            if marks.get(start.as_str()) == Some(&Mark::White) {
                if let Some(cycle) = visit(view, start, &mut marks, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }
}

fn visit<'a>(
    view: &'a BTreeMap<String, BTreeSet<String>>,
    id: &'a str,
    marks: &mut BTreeMap<&'a str, Mark>,
    stack: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    marks.insert(id, Mark::Gray);
    stack.push(id);

    for next in view.get(id).into_iter().flatten() {
        match marks.get(next.as_str()).copied().unwrap_or(Mark::White) {
            Mark::Gray => {
                let start = stack.iter().position(|s| *s == next.as_str()).unwrap_or(0);
                let mut cycle: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(next.clone());
                return Some(cycle);
            }
            Mark::White => {
                if let Some(cycle) = visit(view, next, marks, stack) {
                    return Some(cycle);
                }
            }
            Mark::Black => {}
        }
    }

    stack.pop();
    marks.insert(id, Mark::Black);
    None
}
