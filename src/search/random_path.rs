//! This module contains the random-path strategy: a bit-draw walk of the
//! process tree from the root to a leaf.
//!
//! Walking the tree instead of the frontier biases selection towards
//! subtrees that forked recently near the root, which in practice spreads
//! attention across the program rather than across the raw state count.

use rand::{rngs::StdRng, Rng};
use rustc_hash::FxHashSet;

use crate::{
    search::Scheduler,
    state::{NodeContent, StateGraph, StateId},
};

/// How many walks are attempted before falling back to a uniform pick over
/// the members.
const WALK_RETRIES: usize = 32;

/// A bit-draw walk of the process tree.
///
/// The tree indexes every live state, but a strategy only owns its lane's
/// members (when composed under the splitted scheduler, recovery states
/// live elsewhere). The walk therefore retries until it lands on a member,
/// with a uniform fallback to stay total.
#[derive(Debug, Default)]
pub struct RandomPathScheduler {
    members: FxHashSet<StateId>,
}

impl RandomPathScheduler {
    /// Constructs an empty strategy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Walks the tree from the root, drawing one bit per interior node.
    fn walk(&self, graph: &StateGraph, rng: &mut StdRng) -> Option<StateId> {
        let mut node = graph.tree().root()?;
        loop {
            match graph.tree().content(node) {
                NodeContent::Leaf(state) => return Some(*state),
                NodeContent::Interior { left, right } => {
                    node = if rng.gen_bool(0.5) { *left } else { *right };
                }
                NodeContent::Free { .. } => unreachable!("tree handles are always live"),
            }
        }
    }

    /// Follows a suspended leaf down to the recovery state currently
    /// executing on its behalf.
    fn descend_to_live(&self, graph: &StateGraph, mut id: StateId) -> StateId {
        while let Ok(state) = graph.state(id) {
            match (state.is_suspended(), state.recovery_state) {
                (true, Some(recovery)) => id = recovery,
                _ => break,
            }
        }
        id
    }
}

impl Scheduler for RandomPathScheduler {
    fn select(&mut self, graph: &StateGraph, rng: &mut StdRng) -> Option<StateId> {
        if self.members.is_empty() {
            return None;
        }

        for _ in 0..WALK_RETRIES {
            let Some(landed) = self.walk(graph, rng) else {
                break;
            };
            let candidate = self.descend_to_live(graph, landed);
            if self.members.contains(&candidate) {
                return Some(candidate);
            }
        }

        // The walk kept landing outside this lane; pick uniformly so the
        // strategy stays total.
        let index = rng.gen_range(0..self.members.len());
        self.members.iter().nth(index).copied()
    }

    fn update(
        &mut self,
        _graph: &StateGraph,
        _current: Option<StateId>,
        added: &[StateId],
        removed: &[StateId],
    ) {
        for id in added {
            self.members.insert(*id);
        }
        for id in removed {
            self.members.remove(id);
        }
    }

    fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn size(&self) -> usize {
        self.members.len()
    }

    fn pick_for_offload(&mut self, _graph: &StateGraph) -> Option<StateId> {
        self.members.iter().next().copied()
    }

    fn has_at_least_two(&self) -> bool {
        self.members.len() > 1
    }
}

#[cfg(test)]
mod test {
    use rand::SeedableRng;

    use super::*;
    use crate::ir::FuncId;

    #[test]
    fn walk_reaches_every_member_eventually() {
        let mut graph = StateGraph::new();
        let a = graph.seed(FuncId(0), 0);
        let b = graph.fork_sibling(a);
        let c = graph.fork_sibling(b);

        let mut scheduler = RandomPathScheduler::new();
        scheduler.update(&graph, None, &[a, b, c], &[]);

        let mut rng = StdRng::seed_from_u64(11);
        let mut seen = FxHashSet::default();
        for _ in 0..256 {
            seen.insert(scheduler.select(&graph, &mut rng).expect("non-empty"));
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn suspended_leaves_redirect_to_their_recovery_state() {
        let mut graph = StateGraph::new();
        let dependent = graph.seed(FuncId(0), 0);
        let template = graph.state(dependent).expect("live").clone();
        let recovery = graph.spawn_at(dependent, template);

        {
            let state = graph.state_mut(dependent).expect("live");
            state.set_suspended();
            state.recovery_state = Some(recovery);
        }
        graph.state_mut(recovery).expect("live").kind = crate::state::StateKind::RECOVERY;

        let mut scheduler = RandomPathScheduler::new();
        scheduler.update(&graph, None, &[recovery], &[]);

        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..32 {
            assert_eq!(scheduler.select(&graph, &mut rng), Some(recovery));
        }
    }
}
