//! This module contains the state graph: the set of live states of a
//! worker together with the process tree that indexes them.
//!
//! Every fork splits exactly one leaf of the tree into two, and every
//! termination removes exactly one leaf, so the leaves of the tree are at
//! all times exactly the live (and suspended) states.

use rustc_hash::FxHashMap;

use crate::{
    error::execution::Error,
    ir::FuncId,
    state::{
        process_tree::{NodeContent, ProcessTree},
        ExecutionState,
        StateId,
    },
};

/// The set of live states and the process tree over them.
#[derive(Clone, Debug, Default)]
pub struct StateGraph {
    states:  FxHashMap<StateId, ExecutionState>,
    tree:    ProcessTree,
    next_id: u64,
}

impl StateGraph {
    /// Constructs an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the graph with the initial state for `entry`, returning its
    /// handle.
    pub fn seed(&mut self, entry: FuncId, num_registers: u32) -> StateId {
        let id = self.fresh_id();
        let node = self.tree.plant(id);
        let state = ExecutionState::initial(id, entry, num_registers, node);
        self.states.insert(id, state);
        id
    }

    /// Forks a sibling of the state `at`: the sibling is a
    /// reference-sharing clone, the tree leaf is split, and both states
    /// point at their new leaves. Returns the sibling's handle.
    ///
    /// # Panics
    ///
    /// Panics if `at` is not live; forking always happens on the selected
    /// state, so this is a programmer bug.
    pub fn fork_sibling(&mut self, at: StateId) -> StateId {
        let template = self
            .states
            .get(&at)
            .expect("forked state is live")
            .clone();
        self.spawn_at(at, template)
    }

    /// Splits the leaf of the state `at` and installs `template` (with a
    /// fresh id) as the new left leaf, as when a recovery state is spawned
    /// next to its dependent. Returns the new state's handle.
    ///
    /// # Panics
    ///
    /// Panics if `at` is not live.
    pub fn spawn_at(&mut self, at: StateId, mut template: ExecutionState) -> StateId {
        let new_id = self.fresh_id();
        let leaf = self.states.get(&at).expect("split target is live").ptree_node;
        let (left, right) = self.tree.split(leaf, new_id, at);

        template.id = new_id;
        template.ptree_node = left;
        self.states.insert(new_id, template);
        self.states
            .get_mut(&at)
            .expect("split target is live")
            .ptree_node = right;

        new_id
    }

    /// Removes the state `id` and prunes its leaf from the tree.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not live; the engine removes each state exactly
    /// once, so this is a programmer bug.
    pub fn remove(&mut self, id: StateId) -> ExecutionState {
        let state = self.states.remove(&id).expect("removed state is live");
        self.tree.remove(state.ptree_node);
        state
    }

    /// Gets the state behind `id`.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the state is not live.
    pub fn state(&self, id: StateId) -> Result<&ExecutionState, Error> {
        self.states.get(&id).ok_or(Error::NoSuchState { id: id.0 })
    }

    /// Gets the state behind `id`, mutably.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the state is not live.
    pub fn state_mut(&mut self, id: StateId) -> Result<&mut ExecutionState, Error> {
        self.states
            .get_mut(&id)
            .ok_or(Error::NoSuchState { id: id.0 })
    }

    /// Checks whether `id` is live.
    #[must_use]
    pub fn contains(&self, id: StateId) -> bool {
        self.states.contains_key(&id)
    }

    /// Gets the number of live states.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Checks whether the graph is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Iterates over the live states.
    pub fn states(&self) -> impl Iterator<Item = &ExecutionState> {
        self.states.values()
    }

    /// Iterates over the handles of the live states.
    pub fn ids(&self) -> impl Iterator<Item = StateId> + '_ {
        self.states.keys().copied()
    }

    /// Gets the process tree.
    #[must_use]
    pub fn tree(&self) -> &ProcessTree {
        &self.tree
    }

    /// Checks the structural invariant: the leaves of the tree are exactly
    /// the live states, and each state's back-reference points at the leaf
    /// carrying it.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] describing the first violation found.
    pub fn check_integrity(&self) -> Result<(), Error> {
        let mut leaves = self.tree.leaf_states();
        leaves.sort();
        let mut live: Vec<StateId> = self.states.keys().copied().collect();
        live.sort();
        if leaves != live {
            return Err(Error::CorruptProcessTree {
                reason: format!("leaves {leaves:?} differ from live states {live:?}"),
            });
        }
        for state in self.states.values() {
            match self.tree.content(state.ptree_node) {
                NodeContent::Leaf(carried) if *carried == state.id => {}
                other => {
                    return Err(Error::CorruptProcessTree {
                        reason: format!(
                            "state {:?} points at node {:?} carrying {other:?}",
                            state.id, state.ptree_node
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    fn fresh_id(&mut self) -> StateId {
        let id = StateId(self.next_id);
        self.next_id += 1;
        id
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn seeding_creates_a_single_leaf() {
        let mut graph = StateGraph::new();
        let id = graph.seed(FuncId(0), 0);
        assert_eq!(graph.len(), 1);
        graph.check_integrity().expect("tree is consistent");
        assert_eq!(graph.tree().leaf_states(), vec![id]);
    }

    #[test]
    fn forking_keeps_tree_and_states_in_lockstep() {
        let mut graph = StateGraph::new();
        let a = graph.seed(FuncId(0), 0);
        let b = graph.fork_sibling(a);
        let c = graph.fork_sibling(b);

        assert_eq!(graph.len(), 3);
        graph.check_integrity().expect("tree is consistent");
        assert_ne!(a, b);
        assert_ne!(b, c);
    }

    #[test]
    fn removal_prunes_the_tree() {
        let mut graph = StateGraph::new();
        let a = graph.seed(FuncId(0), 0);
        let b = graph.fork_sibling(a);

        graph.remove(b);
        graph.check_integrity().expect("tree is consistent");
        assert_eq!(graph.tree().leaf_states(), vec![a]);

        graph.remove(a);
        assert!(graph.is_empty());
        assert!(graph.tree().root().is_none());
    }
}
