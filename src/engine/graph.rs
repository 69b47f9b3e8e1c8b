use petgraph::Direction;
use petgraph::algo::has_path_connecting;
use petgraph::graphmap::DiGraphMap;

use crate::core::UnitId;

/// Index of outstanding waits between units.
///
/// An edge `waiter -> dependency` means that `waiter` is still counting on
/// `dependency` to execute. The weight is the number of times the dependency
/// appears in the waiter's list. The graph never owns units, it only refers to
/// them by id.
#[derive(Default)]
pub(crate) struct DependencyGraph {
    edges: DiGraphMap<UnitId, usize>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, waiter: UnitId, dependency: UnitId) {
        match self.edges.edge_weight_mut(waiter, dependency) {
            Some(weight) => *weight += 1,
            None => {
                self.edges.add_edge(waiter, dependency, 1);
            }
        }
    }

    /// Whether waiting on `dependency` would close a loop back to `waiter`,
    /// that is `dependency` already waits on `waiter`, directly or through a
    /// chain of other units.
    pub fn forms_cycle(&self, waiter: UnitId, dependency: UnitId) -> bool {
        if waiter == dependency {
            return true;
        }

        self.edges.contains_node(waiter)
            && self.edges.contains_node(dependency)
            && has_path_connecting(&self.edges, dependency, waiter, None)
    }

    /// Drops every wait on `dependency` and returns the waiters, one entry per
    /// awaited occurrence.
    pub fn release(&mut self, dependency: UnitId) -> Vec<UnitId> {
        let mut released = Vec::new();

        for waiter in self.edges.neighbors_directed(dependency, Direction::Incoming) {
            let weight = self
                .edges
                .edge_weight(waiter, dependency)
                .copied()
                .unwrap_or(0);

            released.extend(std::iter::repeat_n(waiter, weight));
        }

        self.edges.remove_node(dependency);
        released
    }

    pub fn waiting_on(&self, waiter: UnitId) -> Vec<UnitId> {
        self.edges
            .neighbors_directed(waiter, Direction::Outgoing)
            .collect()
    }
}
