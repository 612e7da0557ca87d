//! This module contains the scheduling strategies that decide which live
//! state the engine steps next.
//!
//! A strategy is anything implementing [`Scheduler`]; the engine talks to
//! it exclusively through `select`/`update` plus the small set of probes
//! the distributed layer needs (`size`, `pick_for_offload`,
//! `has_at_least_two`). Strategies never own states, they only hold
//! handles; the [`crate::state::StateGraph`] stays the single source of
//! truth.

pub mod basic;
pub mod random_path;
pub mod splitted;
pub mod weighted;

use std::fmt::Debug;

use rand::rngs::StdRng;

use crate::state::{StateGraph, StateId};

pub use basic::{BfsScheduler, DfsScheduler, RandomScheduler};
pub use random_path::RandomPathScheduler;
pub use splitted::{OptimizedSplittedScheduler, SplittedScheduler};
pub use weighted::{WeightFunction, WeightedRandomScheduler};

/// The interface of a scheduling strategy.
pub trait Scheduler
where
    Self: Debug,
{
    /// Selects the next state to step, without removing it.
    ///
    /// Returns [`None`] exactly when the strategy holds no states.
    fn select(&mut self, graph: &StateGraph, rng: &mut StdRng) -> Option<StateId>;

    /// Applies a scheduling delta: `current` was just stepped (its
    /// weight-relevant statistics may have changed), `added` joined the
    /// frontier and `removed` left it.
    fn update(
        &mut self,
        graph: &StateGraph,
        current: Option<StateId>,
        added: &[StateId],
        removed: &[StateId],
    );

    /// Checks whether the strategy holds no states.
    fn is_empty(&self) -> bool;

    /// Gets the number of states the strategy holds.
    fn size(&self) -> usize;

    /// Picks a state suitable for surrendering to another worker, without
    /// removing it.
    fn pick_for_offload(&mut self, graph: &StateGraph) -> Option<StateId>;

    /// Checks whether the strategy could give one state away and still
    /// have one to run.
    fn has_at_least_two(&self) -> bool;
}

/// A dynamically dispatched scheduling strategy.
pub type DynScheduler = Box<dyn Scheduler>;

/// The base search strategies selectable on the command line.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, clap::ValueEnum)]
pub enum SearchKind {
    /// LIFO over the frontier.
    Dfs,
    /// Strict breadth-first order by branch depth.
    #[default]
    Bfs,
    /// Uniformly random over the frontier.
    RandomState,
    /// A random bit-draw walk of the process tree.
    RandomPath,
    /// Non-uniform random search favouring paths about to cover new code.
    NursCovNew,
    /// Non-uniform random search favouring paths close to uncovered code.
    NursMd2u,
    /// Non-uniform random search weighted by branch depth.
    NursDepth,
    /// Non-uniform random search weighted by instruction count.
    NursICnt,
    /// Non-uniform random search weighted by call-path instruction count.
    NursCpICnt,
    /// Non-uniform random search weighted by accumulated query cost.
    NursQc,
}

/// The strategies selectable for the recovery lane.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, clap::ValueEnum)]
pub enum RecoverySearchKind {
    /// LIFO over the recovery frontier.
    #[default]
    Dfs,
    /// A random walk of the process tree restricted to recovery states.
    RandomPath,
}

/// Constructs the base strategy for `kind`.
#[must_use]
pub fn construct_base(kind: SearchKind) -> DynScheduler {
    match kind {
        SearchKind::Dfs => Box::new(DfsScheduler::new()),
        SearchKind::Bfs => Box::new(BfsScheduler::new()),
        SearchKind::RandomState => Box::new(RandomScheduler::new()),
        SearchKind::RandomPath => Box::new(RandomPathScheduler::new()),
        SearchKind::NursCovNew => {
            Box::new(WeightedRandomScheduler::new(WeightFunction::CoveringNew))
        }
        SearchKind::NursMd2u => Box::new(WeightedRandomScheduler::new(
            WeightFunction::MinDistToUncovered,
        )),
        SearchKind::NursDepth => Box::new(WeightedRandomScheduler::new(WeightFunction::Depth)),
        SearchKind::NursICnt => {
            Box::new(WeightedRandomScheduler::new(WeightFunction::InstCount))
        }
        SearchKind::NursCpICnt => {
            Box::new(WeightedRandomScheduler::new(WeightFunction::CpInstCount))
        }
        SearchKind::NursQc => Box::new(WeightedRandomScheduler::new(WeightFunction::QueryCost)),
    }
}

/// Constructs the strategy for the recovery lane.
#[must_use]
pub fn construct_recovery(kind: RecoverySearchKind) -> DynScheduler {
    match kind {
        RecoverySearchKind::Dfs => Box::new(DfsScheduler::new()),
        RecoverySearchKind::RandomPath => Box::new(RandomPathScheduler::new()),
    }
}

/// Constructs the full scheduler stack for the given configuration: the
/// base strategy alone when recovery splitting is off, otherwise the
/// splitted composition routing recovery states to their own lane.
#[must_use]
pub fn construct(
    base: SearchKind,
    recovery: RecoverySearchKind,
    split: bool,
    optimized_split: bool,
    split_ratio: u32,
) -> DynScheduler {
    if !split {
        return construct_base(base);
    }
    let base_scheduler = construct_base(base);
    let recovery_scheduler = construct_recovery(recovery);
    if optimized_split {
        Box::new(OptimizedSplittedScheduler::new(
            base_scheduler,
            recovery_scheduler,
            Box::new(DfsScheduler::new()),
            split_ratio,
        ))
    } else {
        Box::new(SplittedScheduler::new(
            base_scheduler,
            recovery_scheduler,
            split_ratio,
        ))
    }
}
