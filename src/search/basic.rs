//! This module contains the depth-first, breadth-first, and uniformly
//! random strategies.

use std::collections::VecDeque;

use rand::{rngs::StdRng, Rng};
use rustc_hash::FxHashMap;

use crate::{
    search::Scheduler,
    state::{StateGraph, StateId},
};

/// LIFO over the frontier: always runs the most recently added state.
#[derive(Debug, Default)]
pub struct DfsScheduler {
    states: Vec<StateId>,
}

impl DfsScheduler {
    /// Constructs an empty strategy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Scheduler for DfsScheduler {
    fn select(&mut self, _graph: &StateGraph, _rng: &mut StdRng) -> Option<StateId> {
        self.states.last().copied()
    }

    fn update(
        &mut self,
        _graph: &StateGraph,
        _current: Option<StateId>,
        added: &[StateId],
        removed: &[StateId],
    ) {
        self.states.extend_from_slice(added);
        if !removed.is_empty() {
            self.states.retain(|id| !removed.contains(id));
        }
    }

    fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    fn size(&self) -> usize {
        self.states.len()
    }

    fn pick_for_offload(&mut self, _graph: &StateGraph) -> Option<StateId> {
        // The oldest state sits nearest the root of the exploration and
        // carries the shortest history: the cheapest state to ship.
        self.states.first().copied()
    }

    fn has_at_least_two(&self) -> bool {
        self.states.len() > 1
    }
}

/// Strict breadth-first order by branch depth.
///
/// A plain FIFO would violate breadth-first order here: a multi-way switch
/// expansion adds many states at once at varying depths. The strategy
/// instead keeps a deque per depth and always serves the shallowest
/// populated bucket.
#[derive(Debug, Default)]
pub struct BfsScheduler {
    buckets:   FxHashMap<usize, VecDeque<StateId>>,
    depth_of:  FxHashMap<StateId, usize>,
    min_depth: usize,
}

impl BfsScheduler {
    /// Constructs an empty strategy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, id: StateId, depth: usize) {
        self.buckets.entry(depth).or_default().push_back(id);
        self.depth_of.insert(id, depth);
        if self.depth_of.len() == 1 || depth < self.min_depth {
            self.min_depth = depth;
        }
    }

    fn remove(&mut self, id: StateId) {
        if let Some(depth) = self.depth_of.remove(&id) {
            if let Some(bucket) = self.buckets.get_mut(&depth) {
                bucket.retain(|s| *s != id);
                if bucket.is_empty() {
                    self.buckets.remove(&depth);
                }
            }
        }
    }

    /// Advances `min_depth` to the next populated bucket.
    fn settle_min_depth(&mut self) {
        if self.buckets.contains_key(&self.min_depth) {
            return;
        }
        self.min_depth = self.buckets.keys().copied().min().unwrap_or(0);
    }
}

impl Scheduler for BfsScheduler {
    fn select(&mut self, _graph: &StateGraph, _rng: &mut StdRng) -> Option<StateId> {
        self.settle_min_depth();
        self.buckets
            .get(&self.min_depth)
            .and_then(|bucket| bucket.front())
            .copied()
    }

    fn update(
        &mut self,
        graph: &StateGraph,
        current: Option<StateId>,
        added: &[StateId],
        removed: &[StateId],
    ) {
        // The stepped state may have deepened; re-bucket it so selection
        // order stays depth-sorted.
        if let Some(current) = current {
            if let (Some(old_depth), Ok(state)) =
                (self.depth_of.get(&current).copied(), graph.state(current))
            {
                if state.depth != old_depth {
                    self.remove(current);
                    self.insert(current, state.depth);
                }
            }
        }

        for id in added {
            if let Ok(state) = graph.state(*id) {
                self.insert(*id, state.depth);
            }
        }
        for id in removed {
            self.remove(*id);
        }
        self.settle_min_depth();
    }

    fn is_empty(&self) -> bool {
        self.depth_of.is_empty()
    }

    fn size(&self) -> usize {
        self.depth_of.len()
    }

    fn pick_for_offload(&mut self, _graph: &StateGraph) -> Option<StateId> {
        self.settle_min_depth();
        self.buckets
            .get(&self.min_depth)
            .and_then(|bucket| bucket.back())
            .copied()
    }

    fn has_at_least_two(&self) -> bool {
        self.buckets
            .get(&self.min_depth)
            .is_some_and(|bucket| bucket.len() > 1)
    }
}

/// Uniformly random over the frontier.
#[derive(Debug, Default)]
pub struct RandomScheduler {
    states: Vec<StateId>,
}

impl RandomScheduler {
    /// Constructs an empty strategy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Scheduler for RandomScheduler {
    fn select(&mut self, _graph: &StateGraph, rng: &mut StdRng) -> Option<StateId> {
        if self.states.is_empty() {
            return None;
        }
        let index = rng.gen_range(0..self.states.len());
        Some(self.states[index])
    }

    fn update(
        &mut self,
        _graph: &StateGraph,
        _current: Option<StateId>,
        added: &[StateId],
        removed: &[StateId],
    ) {
        self.states.extend_from_slice(added);
        if !removed.is_empty() {
            self.states.retain(|id| !removed.contains(id));
        }
    }

    fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    fn size(&self) -> usize {
        self.states.len()
    }

    fn pick_for_offload(&mut self, _graph: &StateGraph) -> Option<StateId> {
        self.states.first().copied()
    }

    fn has_at_least_two(&self) -> bool {
        self.states.len() > 1
    }
}

#[cfg(test)]
mod test {
    use rand::SeedableRng;

    use super::*;
    use crate::ir::FuncId;

    fn graph_with(n: usize) -> (StateGraph, Vec<StateId>) {
        let mut graph = StateGraph::new();
        let first = graph.seed(FuncId(0), 0);
        let mut ids = vec![first];
        for _ in 1..n {
            let id = graph.fork_sibling(first);
            ids.push(id);
        }
        (graph, ids)
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn dfs_selects_most_recently_added() {
        let (graph, ids) = graph_with(3);
        let mut dfs = DfsScheduler::new();
        dfs.update(&graph, None, &ids, &[]);
        assert_eq!(dfs.select(&graph, &mut rng()), Some(ids[2]));

        dfs.update(&graph, None, &[], &[ids[2]]);
        assert_eq!(dfs.select(&graph, &mut rng()), Some(ids[1]));
    }

    #[test]
    fn bfs_serves_shallowest_bucket_first() {
        let (mut graph, ids) = graph_with(3);
        graph.state_mut(ids[1]).expect("live").depth = 2;
        graph.state_mut(ids[2]).expect("live").depth = 1;

        let mut bfs = BfsScheduler::new();
        bfs.update(&graph, None, &ids, &[]);
        assert_eq!(bfs.select(&graph, &mut rng()), Some(ids[0]));

        bfs.update(&graph, None, &[], &[ids[0]]);
        assert_eq!(bfs.select(&graph, &mut rng()), Some(ids[2]));

        bfs.update(&graph, None, &[], &[ids[2]]);
        assert_eq!(bfs.select(&graph, &mut rng()), Some(ids[1]));
    }

    #[test]
    fn bfs_rebuckets_a_deepened_current_state() {
        let (mut graph, ids) = graph_with(2);
        let mut bfs = BfsScheduler::new();
        bfs.update(&graph, None, &ids, &[]);

        // The first state deepens past the second; selection must switch.
        graph.state_mut(ids[0]).expect("live").depth = 5;
        bfs.update(&graph, Some(ids[0]), &[], &[]);
        assert_eq!(bfs.select(&graph, &mut rng()), Some(ids[1]));
    }

    #[test]
    fn random_covers_the_whole_frontier() {
        let (graph, ids) = graph_with(4);
        let mut random = RandomScheduler::new();
        random.update(&graph, None, &ids, &[]);

        let mut rng = rng();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..256 {
            seen.insert(random.select(&graph, &mut rng).expect("non-empty"));
        }
        assert_eq!(seen.len(), ids.len());
    }
}
