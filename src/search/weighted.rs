//! This module contains the non-uniform random strategy: a discrete
//! probability density over the frontier under a pluggable weight
//! function.

use rand::{rngs::StdRng, Rng};
use rustc_hash::FxHashMap;

use crate::{
    constant::COV_NEW_INSTRUCTION_HORIZON,
    search::Scheduler,
    state::{ExecutionState, StateGraph, StateId},
};

/// The weight functions available to the strategy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WeightFunction {
    /// Weight by branch depth, favouring deep paths.
    Depth,

    /// Weight inversely by instructions executed, favouring fresh paths.
    InstCount,

    /// Weight inversely by instructions executed in the current frame.
    CpInstCount,

    /// Weight inversely by accumulated solver cost.
    QueryCost,

    /// Weight by closeness to new coverage, using the instructions
    /// executed since the path last covered a new line as the distance
    /// proxy.
    MinDistToUncovered,

    /// Weight paths that recently covered new code far above the rest.
    CoveringNew,
}

impl WeightFunction {
    /// Checks whether the weight of a state can change as it executes, in
    /// which case the stepped state is re-weighed on every update.
    #[must_use]
    fn is_dynamic(self) -> bool {
        !matches!(self, Self::Depth)
    }

    fn weigh(self, state: &ExecutionState) -> f64 {
        match self {
            Self::Depth => (state.depth as f64) + 1.0,
            Self::InstCount => 1.0 / (state.inst_count.max(1) as f64),
            Self::CpInstCount => 1.0 / (state.frame().inst_count.max(1) as f64),
            Self::QueryCost => {
                if state.query_cost < 0.1 {
                    1.0
                } else {
                    1.0 / state.query_cost
                }
            }
            Self::MinDistToUncovered => 1.0 / (state.insts_since_cov_new.max(1) as f64),
            Self::CoveringNew => {
                if state.covered_new {
                    (COV_NEW_INSTRUCTION_HORIZON.saturating_sub(state.insts_since_cov_new))
                        .max(1) as f64
                } else {
                    1.0
                }
            }
        }
    }
}

/// A discrete PDF over the frontier.
#[derive(Debug)]
pub struct WeightedRandomScheduler {
    function: WeightFunction,
    entries:  Vec<StateId>,
    weights:  Vec<f64>,
    index_of: FxHashMap<StateId, usize>,
}

impl WeightedRandomScheduler {
    /// Constructs an empty strategy weighing with `function`.
    #[must_use]
    pub fn new(function: WeightFunction) -> Self {
        Self {
            function,
            entries: vec![],
            weights: vec![],
            index_of: FxHashMap::default(),
        }
    }

    fn insert(&mut self, id: StateId, weight: f64) {
        self.index_of.insert(id, self.entries.len());
        self.entries.push(id);
        self.weights.push(weight);
    }

    fn remove(&mut self, id: StateId) {
        if let Some(index) = self.index_of.remove(&id) {
            self.entries.swap_remove(index);
            self.weights.swap_remove(index);
            if let Some(moved) = self.entries.get(index) {
                self.index_of.insert(*moved, index);
            }
        }
    }
}

impl Scheduler for WeightedRandomScheduler {
    fn select(&mut self, _graph: &StateGraph, rng: &mut StdRng) -> Option<StateId> {
        let total: f64 = self.weights.iter().sum();
        if self.entries.is_empty() || total <= 0.0 {
            return self.entries.first().copied();
        }
        let mut draw = rng.gen_range(0.0..total);
        for (id, weight) in self.entries.iter().zip(&self.weights) {
            if draw < *weight {
                return Some(*id);
            }
            draw -= weight;
        }
        self.entries.last().copied()
    }

    fn update(
        &mut self,
        graph: &StateGraph,
        current: Option<StateId>,
        added: &[StateId],
        removed: &[StateId],
    ) {
        if self.function.is_dynamic() {
            if let Some(current) = current {
                if let (Some(index), Ok(state)) =
                    (self.index_of.get(&current).copied(), graph.state(current))
                {
                    self.weights[index] = self.function.weigh(state);
                }
            }
        }

        for id in added {
            if let Ok(state) = graph.state(*id) {
                self.insert(*id, self.function.weigh(state));
            }
        }
        for id in removed {
            self.remove(*id);
        }
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn size(&self) -> usize {
        self.entries.len()
    }

    fn pick_for_offload(&mut self, _graph: &StateGraph) -> Option<StateId> {
        self.entries.first().copied()
    }

    fn has_at_least_two(&self) -> bool {
        self.entries.len() > 1
    }
}

#[cfg(test)]
mod test {
    use rand::SeedableRng;

    use super::*;
    use crate::ir::FuncId;

    #[test]
    fn heavily_weighted_states_dominate_selection() {
        let mut graph = StateGraph::new();
        let light = graph.seed(FuncId(0), 0);
        let heavy = graph.fork_sibling(light);
        graph.state_mut(heavy).expect("live").depth = 99;

        let mut scheduler = WeightedRandomScheduler::new(WeightFunction::Depth);
        scheduler.update(&graph, None, &[light, heavy], &[]);

        let mut rng = StdRng::seed_from_u64(3);
        let mut heavy_picks = 0;
        for _ in 0..200 {
            if scheduler.select(&graph, &mut rng) == Some(heavy) {
                heavy_picks += 1;
            }
        }
        assert!(heavy_picks > 150, "picked heavy only {heavy_picks}/200");
    }

    #[test]
    fn dynamic_weights_follow_the_stepped_state() {
        let mut graph = StateGraph::new();
        let a = graph.seed(FuncId(0), 0);
        let b = graph.fork_sibling(a);

        let mut scheduler = WeightedRandomScheduler::new(WeightFunction::InstCount);
        scheduler.update(&graph, None, &[a, b], &[]);

        // After `a` executes a lot of instructions its weight collapses.
        graph.state_mut(a).expect("live").inst_count = 1_000_000;
        scheduler.update(&graph, Some(a), &[], &[]);

        let mut rng = StdRng::seed_from_u64(3);
        let mut b_picks = 0;
        for _ in 0..200 {
            if scheduler.select(&graph, &mut rng) == Some(b) {
                b_picks += 1;
            }
        }
        assert!(b_picks > 150, "picked b only {b_picks}/200");
    }

    #[test]
    fn removal_keeps_the_index_consistent() {
        let mut graph = StateGraph::new();
        let a = graph.seed(FuncId(0), 0);
        let b = graph.fork_sibling(a);
        let c = graph.fork_sibling(a);

        let mut scheduler = WeightedRandomScheduler::new(WeightFunction::Depth);
        scheduler.update(&graph, None, &[a, b, c], &[]);
        scheduler.update(&graph, None, &[], &[a]);

        assert_eq!(scheduler.size(), 2);
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..32 {
            let picked = scheduler.select(&graph, &mut rng).expect("non-empty");
            assert_ne!(picked, a);
        }
    }
}
