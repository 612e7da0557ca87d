//! This module contains the compositions that give recovery states their
//! own scheduling lane, visited with a configurable ratio.

use rand::{rngs::StdRng, Rng};

use crate::{
    search::{DynScheduler, Scheduler},
    state::{Priority, StateGraph, StateId},
};

/// Partitions a scheduling delta into its base and recovery parts.
fn partition(graph: &StateGraph, ids: &[StateId]) -> (Vec<StateId>, Vec<StateId>) {
    let mut base = vec![];
    let mut recovery = vec![];
    for id in ids {
        match graph.state(*id) {
            Ok(state) if state.kind.is_recovery() => recovery.push(*id),
            _ => base.push(*id),
        }
    }
    (base, recovery)
}

/// Composes a base strategy and a recovery strategy: recovery states are
/// routed to the recovery lane, and when both lanes hold states the
/// recovery lane is visited with probability `ratio/100`.
#[derive(Debug)]
pub struct SplittedScheduler {
    base:     DynScheduler,
    recovery: DynScheduler,
    ratio:    u32,
}

impl SplittedScheduler {
    /// Constructs the composition with the given visit `ratio` (out of
    /// 100) for the recovery lane.
    #[must_use]
    pub fn new(base: DynScheduler, recovery: DynScheduler, ratio: u32) -> Self {
        Self {
            base,
            recovery,
            ratio,
        }
    }
}

impl Scheduler for SplittedScheduler {
    fn select(&mut self, graph: &StateGraph, rng: &mut StdRng) -> Option<StateId> {
        match (self.base.is_empty(), self.recovery.is_empty()) {
            (true, true) => None,
            (false, true) => self.base.select(graph, rng),
            (true, false) => self.recovery.select(graph, rng),
            (false, false) => {
                if rng.gen_range(0..100) < self.ratio {
                    self.recovery.select(graph, rng)
                } else {
                    self.base.select(graph, rng)
                }
            }
        }
    }

    fn update(
        &mut self,
        graph: &StateGraph,
        current: Option<StateId>,
        added: &[StateId],
        removed: &[StateId],
    ) {
        let (added_base, added_recovery) = partition(graph, added);
        let (removed_base, removed_recovery) = partition(graph, removed);

        let current_is_recovery = current
            .and_then(|id| graph.state(id).ok())
            .is_some_and(|state| state.kind.is_recovery());

        self.base.update(
            graph,
            current.filter(|_| !current_is_recovery),
            &added_base,
            &removed_base,
        );
        self.recovery.update(
            graph,
            current.filter(|_| current_is_recovery),
            &added_recovery,
            &removed_recovery,
        );
    }

    fn is_empty(&self) -> bool {
        self.base.is_empty() && self.recovery.is_empty()
    }

    fn size(&self) -> usize {
        self.base.size() + self.recovery.size()
    }

    fn pick_for_offload(&mut self, graph: &StateGraph) -> Option<StateId> {
        self.base.pick_for_offload(graph)
    }

    fn has_at_least_two(&self) -> bool {
        self.base.has_at_least_two()
    }
}

/// The splitted composition with a third, high-priority lane for freshly
/// spawned recovery states.
///
/// New recovery states enter the high-priority lane and are always served
/// before the rest of the recovery side; the lane is flushed back into the
/// ordinary recovery lane whenever a root recovery (level zero) completes.
#[derive(Debug)]
pub struct OptimizedSplittedScheduler {
    base:          DynScheduler,
    recovery:      DynScheduler,
    high_priority: DynScheduler,
    ratio:         u32,
    high_members:  Vec<StateId>,
}

impl OptimizedSplittedScheduler {
    /// Constructs the composition with the given visit `ratio` (out of
    /// 100) for the recovery side.
    #[must_use]
    pub fn new(
        base: DynScheduler,
        recovery: DynScheduler,
        high_priority: DynScheduler,
        ratio: u32,
    ) -> Self {
        Self {
            base,
            recovery,
            high_priority,
            ratio,
            high_members: vec![],
        }
    }

    /// Moves every state from the high-priority lane into the ordinary
    /// recovery lane.
    fn flush_high_priority(&mut self, graph: &StateGraph) {
        if self.high_members.is_empty() {
            return;
        }
        let members = std::mem::take(&mut self.high_members);
        self.high_priority.update(graph, None, &[], &members);
        self.recovery.update(graph, None, &members, &[]);
    }
}

impl Scheduler for OptimizedSplittedScheduler {
    fn select(&mut self, graph: &StateGraph, rng: &mut StdRng) -> Option<StateId> {
        let recovery_side_empty = self.recovery.is_empty() && self.high_priority.is_empty();
        let pick_recovery = match (self.base.is_empty(), recovery_side_empty) {
            (true, true) => return None,
            (false, true) => false,
            (true, false) => true,
            (false, false) => rng.gen_range(0..100) < self.ratio,
        };

        if pick_recovery {
            if !self.high_priority.is_empty() {
                self.high_priority.select(graph, rng)
            } else {
                self.recovery.select(graph, rng)
            }
        } else {
            self.base.select(graph, rng)
        }
    }

    fn update(
        &mut self,
        graph: &StateGraph,
        current: Option<StateId>,
        added: &[StateId],
        removed: &[StateId],
    ) {
        let (added_base, added_recovery) = partition(graph, added);
        let (removed_base, removed_recovery) = partition(graph, removed);

        // A completed root recovery releases the backlog of freshly
        // spawned recovery states into the ordinary lane.
        let root_recovery_completed = removed_recovery.iter().any(|id| {
            graph
                .state(*id)
                .is_ok_and(|state| state.kind.is_recovery() && state.level == 0)
        });
        if root_recovery_completed {
            self.flush_high_priority(graph);
        }

        let current_is_recovery = current
            .and_then(|id| graph.state(id).ok())
            .is_some_and(|state| state.kind.is_recovery());
        self.base.update(
            graph,
            current.filter(|_| !current_is_recovery),
            &added_base,
            &removed_base,
        );

        // Fresh high-priority recovery states go to the priority lane,
        // the rest to the ordinary one.
        let mut added_high = vec![];
        let mut added_low = vec![];
        for id in added_recovery {
            match graph.state(id) {
                Ok(state) if state.priority == Priority::High => added_high.push(id),
                _ => added_low.push(id),
            }
        }

        let (removed_high, removed_low): (Vec<StateId>, Vec<StateId>) = removed_recovery
            .iter()
            .copied()
            .partition(|id| self.high_members.contains(id));

        self.high_members.extend_from_slice(&added_high);
        self.high_members.retain(|id| !removed_high.contains(id));

        self.high_priority
            .update(graph, None, &added_high, &removed_high);
        self.recovery.update(
            graph,
            current.filter(|_| current_is_recovery),
            &added_low,
            &removed_low,
        );
    }

    fn is_empty(&self) -> bool {
        self.base.is_empty() && self.recovery.is_empty() && self.high_priority.is_empty()
    }

    fn size(&self) -> usize {
        self.base.size() + self.recovery.size() + self.high_priority.size()
    }

    fn pick_for_offload(&mut self, graph: &StateGraph) -> Option<StateId> {
        self.base.pick_for_offload(graph)
    }

    fn has_at_least_two(&self) -> bool {
        self.base.has_at_least_two()
    }
}

#[cfg(test)]
mod test {
    use rand::SeedableRng;

    use super::*;
    use crate::{
        ir::FuncId,
        search::DfsScheduler,
        state::StateKind,
    };

    fn rng() -> StdRng {
        StdRng::seed_from_u64(5)
    }

    fn graph_with_recovery() -> (StateGraph, StateId, StateId) {
        let mut graph = StateGraph::new();
        let normal = graph.seed(FuncId(0), 0);
        let template = graph.state(normal).expect("live").clone();
        let recovery = graph.spawn_at(normal, template);
        graph.state_mut(recovery).expect("live").kind = StateKind::RECOVERY;
        (graph, normal, recovery)
    }

    fn splitted(ratio: u32) -> SplittedScheduler {
        SplittedScheduler::new(
            Box::new(DfsScheduler::new()),
            Box::new(DfsScheduler::new()),
            ratio,
        )
    }

    #[test]
    fn routes_states_by_kind() {
        let (graph, normal, recovery) = graph_with_recovery();
        let mut scheduler = splitted(100);
        scheduler.update(&graph, None, &[normal, recovery], &[]);

        // With ratio 100 the recovery lane always wins while populated.
        assert_eq!(scheduler.select(&graph, &mut rng()), Some(recovery));

        scheduler.update(&graph, None, &[], &[recovery]);
        assert_eq!(scheduler.select(&graph, &mut rng()), Some(normal));
    }

    #[test]
    fn zero_ratio_prefers_the_base_lane() {
        let (graph, normal, recovery) = graph_with_recovery();
        let mut scheduler = splitted(0);
        scheduler.update(&graph, None, &[normal, recovery], &[]);
        assert_eq!(scheduler.select(&graph, &mut rng()), Some(normal));
    }

    #[test]
    fn offload_only_picks_from_the_base_lane() {
        let (graph, normal, recovery) = graph_with_recovery();
        let mut scheduler = splitted(100);
        scheduler.update(&graph, None, &[normal, recovery], &[]);
        assert_eq!(scheduler.pick_for_offload(&graph), Some(normal));
    }

    #[test]
    fn optimized_variant_serves_high_priority_first() {
        let (mut graph, normal, recovery) = graph_with_recovery();
        graph.state_mut(recovery).expect("live").priority = Priority::High;

        let mut scheduler = OptimizedSplittedScheduler::new(
            Box::new(DfsScheduler::new()),
            Box::new(DfsScheduler::new()),
            Box::new(DfsScheduler::new()),
            100,
        );
        scheduler.update(&graph, None, &[normal, recovery], &[]);
        assert_eq!(scheduler.select(&graph, &mut rng()), Some(recovery));

        // Completing the root recovery flushes the priority lane.
        scheduler.update(&graph, None, &[], &[recovery]);
        assert_eq!(scheduler.select(&graph, &mut rng()), Some(normal));
        assert!(scheduler.high_members.is_empty());
    }
}
