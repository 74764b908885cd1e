use std::collections::{HashMap, HashSet};

use uuid::Uuid;

/// Waits-for graph over live transactions: an edge `T -> U` means `T` is
/// waiting on a resource held by `U` in an incompatible mode. Stored as an
/// adjacency map keyed by transaction id.
#[derive(Default)]
pub struct WaitsForGraph {
    edges: HashMap<Uuid, HashSet<Uuid>>,
}

impl WaitsForGraph {
    pub fn add_edge(&mut self, from: Uuid, to: Uuid) {
        if from != to {
            self.edges.entry(from).or_default().insert(to);
        }
    }

    pub fn remove_edge(&mut self, from: Uuid, to: Uuid) {
        if let Some(targets) = self.edges.get_mut(&from) {
            targets.remove(&to);
            if targets.is_empty() {
                self.edges.remove(&from);
            }
        }
    }

    pub fn remove_node(&mut self, id: Uuid) {
        self.edges.remove(&id);
    }

    /// Depth-first search from `start`: true iff `start` can reach itself
    /// again, i.e. the just-added edges closed a cycle.
    pub fn has_cycle_from(&self, start: Uuid) -> bool {
        let mut visited = HashSet::new();
        let mut stack: Vec<Uuid> = match self.edges.get(&start) {
            Some(targets) => targets.iter().copied().collect(),
            None => return false,
        };
        while let Some(current) = stack.pop() {
            if current == start {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            if let Some(targets) = self.edges.get(&current) {
                stack.extend(targets.iter().copied());
            }
        }
        false
    }
}
