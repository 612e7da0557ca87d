//! This module contains the execution engine: the run loop that selects,
//! steps and retires states, the bookkeeping that keeps the state graph,
//! the scheduler and the ranging pool consistent, and the termination
//! paths that turn finished paths into test cases.
//!
//! The companion submodules hold the three hard parts: [`fork`] for the
//! state-forking rules (solver-driven and prefix-guided), [`exec`] for
//! instruction dispatch, and [`recovery`] for the snapshot/recovery
//! protocol around skipped calls.

pub mod exec;
pub mod fork;
pub mod recovery;

use std::{rc::Rc, time::Duration};

use rand::{rngs::StdRng, Rng, SeedableRng};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    constant::{
        MEMORY_KILL_SLACK_MB,
        OFFLOAD_FRACTION_DIVISOR,
        OFFLOAD_MINIMUM_FRONTIER,
        OFFLOAD_NOT_READY_THRESHOLD,
        OFFLOAD_PACKAGE_CAP,
        OFFLOAD_READY_THRESHOLD,
    },
    cluster::{message::Message, prefix, prefix_tree::PrefixTree, Fabric, MASTER_RANK},
    error::{
        execution::{Error as ExecError, TerminateReason},
        protocol,
        Error,
        Result,
    },
    expr::ExprRef,
    ir::{Analysis, FuncId, Program},
    memory::{MemoryAllocator, MemoryObject, ObjectState},
    output::{OutputHandler, TestObject},
    search::{self, DynScheduler},
    solver::{procedure::BoundedProcedure, SolverFacade},
    state::{Prefix, StateGraph, StateId},
    watchdog::DynWatchdog,
};

/// The role an engine plays in a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    /// A single-process run with no coordination.
    Standalone,
    /// The rank-zero node: bounded exploration, then dispatch.
    Master,
    /// A ranked worker executing dispatched prefixes.
    Worker,
}

/// Counters describing one engine's run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct RunStats {
    /// Instructions executed.
    pub instructions: u64,

    /// Forks performed.
    pub forks: u64,

    /// Snapshots taken at skipped calls.
    pub snapshots: u64,

    /// Recovery states spawned.
    pub recovery_states: u64,

    /// Slices resolved for injection.
    pub generated_slices: u64,

    /// States terminated, of any kind.
    pub terminated: u64,

    /// Exit-on errors observed.
    pub errors: u32,
}

/// The result of a completed run.
#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    /// The counters of the run.
    pub stats: RunStats,

    /// Test cases written, of any kind.
    pub tests_written: u64,

    /// Error test cases among them.
    pub errors_written: u64,

    /// Whether an exit-on error was observed, making the process exit
    /// non-zero.
    pub bug_found: bool,
}

/// The execution engine of one node.
///
/// An engine is strictly single-threaded and cooperative: all suspension
/// points are explicit (state selection, instruction steps, solver calls,
/// and the message probe at the top of the run loop).
#[derive(derivative::Derivative)]
#[derivative(Debug)]
pub struct Engine {
    #[derivative(Debug = "ignore")]
    pub(crate) program:  Rc<Program>,
    #[derivative(Debug = "ignore")]
    pub(crate) analysis: Rc<Analysis>,
    pub(crate) config:   Config,
    pub(crate) solver:   SolverFacade,
    pub(crate) graph:    StateGraph,
    scheduler:           DynScheduler,
    pub(crate) rng:      StdRng,
    pub(crate) allocator: MemoryAllocator,
    watchdog:            DynWatchdog,
    outputs:             OutputHandler,
    fabric:              Option<Box<dyn Fabric>>,

    /// Objects backing the program's globals, bound into every state.
    pub(crate) global_objects: FxHashMap<crate::ir::GlobalId, Rc<MemoryObject>>,

    // Step-scoped deltas, drained by `update_states`.
    pub(crate) added_states:   Vec<StateId>,
    pub(crate) removed_states: Vec<StateId>,
    pub(crate) resumed_states: Vec<StateId>,
    pub(crate) newly_suspended: Vec<StateId>,
    pub(crate) ranging_suspended: Vec<StateId>,

    /// Suspended ranging states, keyed by canonical history.
    prefix_pool: FxHashMap<Vec<u8>, StateId>,
    prefix_tree: PrefixTree,

    // Run flags.
    pub(crate) halt_execution: bool,
    pub(crate) halt_from_master: bool,
    ready_to_offload:           bool,
    pub(crate) at_memory_limit: bool,
    pub(crate) inhibit_forking: bool,

    pub(crate) stats: RunStats,
    bug_found:        bool,

    /// Lines covered by any path so far, for the covering-new weights.
    covered_ever: FxHashMap<std::sync::Arc<str>, FxHashSet<u32>>,

    /// Errors already emitted, per (instruction, message).
    emitted_errors: FxHashSet<(u64, String)>,

    /// The working copy of the error-location table.
    error_locations: FxHashMap<String, Vec<u32>>,
}

impl Engine {
    /// Constructs an engine.
    ///
    /// The `fabric` decides the role: absent for a standalone run, rank
    /// zero for the master, any other rank for a worker. The `seed` feeds
    /// this engine's private RNG.
    #[must_use]
    pub fn new(
        program: Rc<Program>,
        analysis: Rc<Analysis>,
        config: Config,
        watchdog: DynWatchdog,
        outputs: OutputHandler,
        fabric: Option<Box<dyn Fabric>>,
        seed: u64,
    ) -> Self {
        let solver = SolverFacade::new(BoundedProcedure::default().in_rc())
            .with_timeout(Duration::from_millis(config.solver_timeout_ms));
        let scheduler = search::construct(
            config.search,
            config.recovery_search,
            config.split_search,
            config.optimized_split,
            config.split_ratio,
        );
        let error_locations = config.error_locations.clone();
        Self {
            program,
            analysis,
            config,
            solver,
            graph: StateGraph::new(),
            scheduler,
            rng: StdRng::seed_from_u64(seed),
            allocator: MemoryAllocator::new(),
            watchdog,
            outputs,
            fabric,
            global_objects: FxHashMap::default(),
            added_states: vec![],
            removed_states: vec![],
            resumed_states: vec![],
            newly_suspended: vec![],
            ranging_suspended: vec![],
            prefix_pool: FxHashMap::default(),
            prefix_tree: PrefixTree::new(),
            halt_execution: false,
            halt_from_master: false,
            ready_to_offload: false,
            at_memory_limit: false,
            inhibit_forking: false,
            stats: RunStats::default(),
            bug_found: false,
            covered_ever: FxHashMap::default(),
            emitted_errors: FxHashSet::default(),
            error_locations,
        }
    }

    /// Gets the role this engine plays.
    #[must_use]
    pub fn role(&self) -> Role {
        match &self.fabric {
            None => Role::Standalone,
            Some(fabric) if fabric.rank() == MASTER_RANK => Role::Master,
            Some(_) => Role::Worker,
        }
    }

    /// Gets the state graph, for inspection.
    #[must_use]
    pub fn graph(&self) -> &StateGraph {
        &self.graph
    }

    /// Gets the output handler, for inspection.
    #[must_use]
    pub fn outputs(&self) -> &OutputHandler {
        &self.outputs
    }

    /// Gets the run counters.
    #[must_use]
    pub fn stats(&self) -> RunStats {
        self.stats
    }

    /// Checks whether an exit-on error was observed.
    #[must_use]
    pub fn bug_found(&self) -> bool {
        self.bug_found
    }

    /// Checks whether the engine was halted, locally or by the master.
    #[must_use]
    pub fn halted(&self) -> bool {
        self.halt_execution || self.halt_from_master
    }

    /// Gets the number of selectable states.
    #[must_use]
    pub fn frontier_size(&self) -> usize {
        self.scheduler.size()
    }

    /// Seeds the engine with the initial state of the function named
    /// `entry`, binding globals and turning parameters into symbolic
    /// inputs.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if `entry` does not exist.
    pub fn prepare(&mut self, entry: &str) -> Result<StateId> {
        let func_id = self.program.function_named(entry).ok_or_else(|| {
            Error::Execution(crate::error::container::Located {
                instruction_id: 0,
                source: None,
                payload: ExecError::UnknownFunction {
                    name: entry.to_owned(),
                },
            })
        })?;
        let function = self.program.function(func_id);
        let num_registers = function.num_registers;
        let params = function.params.clone();

        let root = self.graph.seed(func_id, num_registers);
        self.bind_globals(root)?;

        // Entry parameters become named symbolic inputs.
        {
            let state = self.graph.state_mut(root).map_err(locate_internal)?;
            for (index, (reg, width)) in params.iter().enumerate() {
                let name = state.register_symbolic(&format!("arg{index}"), *width);
                let value = crate::expr::Expr::symbol(name, *width);
                state.frame_mut().locals[reg.0 as usize] = Some(value);
            }
        }

        self.scheduler.update(&self.graph, None, &[root], &[]);
        Ok(root)
    }

    /// Runs a complete standalone exploration of `entry`.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] on fatal failures (corrupt tree, output I/O);
    /// per-state failures terminate the state and are reported through
    /// the emitted test cases.
    pub fn run_standalone(&mut self, entry: &str) -> Result<RunSummary> {
        self.prepare(entry)?;
        self.exhaust_frontier()?;
        if self.halted() && self.config.dump_states_on_halt {
            self.dump_remaining_states()?;
        }
        self.finish()
    }

    /// Drives the frontier until it is exhausted or the engine halts.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] on fatal failures.
    pub fn exhaust_frontier(&mut self) -> Result<()> {
        let poll_interval = self.watchdog.poll_every().max(1);
        let mut loop_counter: usize = 0;

        while !self.scheduler.is_empty() && !self.halted() {
            loop_counter += 1;
            if loop_counter % poll_interval == 0 && self.watchdog.should_stop() {
                debug!("watchdog requested a stop");
                self.halt_execution = true;
                break;
            }

            let Some(current) = self.scheduler.select(&self.graph, &mut self.rng) else {
                break;
            };

            if self.apply_exploration_bound(current)? {
                continue;
            }

            self.step_state(current)?;

            if self.config.max_depth != 0 {
                let too_deep = self
                    .graph
                    .state(current)
                    .is_ok_and(|s| s.depth > self.config.max_depth && !s.is_suspended());
                if too_deep && !self.removed_states.contains(&current) {
                    self.terminate_early(current, "max-depth exceeded.")?;
                }
            }

            if self.config.stop_after_n_instructions != 0
                && self.stats.instructions >= self.config.stop_after_n_instructions
            {
                info!(
                    instructions = self.stats.instructions,
                    "instruction budget exhausted, halting"
                );
                self.halt_execution = true;
            }

            self.check_memory_usage()?;
            self.update_states(Some(current))?;
            self.exchange_offload_signals()?;
        }

        Ok(())
    }

    /// Applies the bounded-exploration rules to the selected state.
    ///
    /// On the master, phase one freezes once enough states are live. On a
    /// worker, non-recovery states beyond the bound are pruned without a
    /// test case. Returns `true` when the caller must re-select.
    fn apply_exploration_bound(&mut self, current: StateId) -> Result<bool> {
        if self.config.exploration_depth == 0 {
            return Ok(false);
        }
        match self.role() {
            Role::Standalone => Ok(false),
            Role::Master => {
                let live = self
                    .graph
                    .states()
                    .filter(|s| !s.is_suspended())
                    .count();
                if live >= self.config.exploration_depth {
                    debug!(live, "phase-one bound reached, freezing exploration");
                    self.halt_execution = true;
                    return Ok(true);
                }
                Ok(false)
            }
            Role::Worker => {
                let state = self.graph.state(current).map_err(locate_internal)?;
                if !state.kind.is_recovery() && state.depth > self.config.exploration_depth {
                    debug!(state = state.id.0, depth = state.depth, "pruning beyond bound");
                    self.scheduler
                        .update(&self.graph, None, &[], &[current]);
                    self.graph.remove(current);
                    return Ok(true);
                }
                Ok(false)
            }
        }
    }

    /// Collects the branch histories of every selectable state, as the
    /// master's work list after phase one.
    #[must_use]
    pub fn collect_work_list(&self) -> Vec<String> {
        self.graph
            .states()
            .filter(|state| !state.is_suspended())
            .map(crate::state::ExecutionState::history_string)
            .collect()
    }

    /// Applies the step-scoped deltas: scheduler synchronisation, moving
    /// ranging-suspended states into the prefix pool, retiring removed
    /// states from the graph, and probing the fabric for coordination
    /// messages.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] on fatal failures.
    pub fn update_states(&mut self, current: Option<StateId>) -> Result<()> {
        let mut added = std::mem::take(&mut self.added_states);
        added.extend(self.resumed_states.drain(..));

        let mut removed_from_scheduler = self.removed_states.clone();
        removed_from_scheduler.extend(self.newly_suspended.drain(..));
        removed_from_scheduler.extend(self.ranging_suspended.iter().copied());

        let current = current.filter(|id| self.graph.contains(*id));
        self.scheduler
            .update(&self.graph, current, &added, &removed_from_scheduler);

        // Park the ranging-suspended siblings in the prefix pool, keyed by
        // canonical history.
        for id in std::mem::take(&mut self.ranging_suspended) {
            let state = self.graph.state_mut(id).map_err(locate_internal)?;
            state.clear_prefixes();
            let canonical = prefix::canonicalize(&state.branch_history)
                .expect("state histories only hold raw digits");
            debug!(state = id.0, path = %String::from_utf8_lossy(&canonical), "parking ranging state");
            self.prefix_tree.insert(&canonical);
            self.prefix_pool.insert(canonical, id);
        }

        for id in std::mem::take(&mut self.removed_states) {
            self.graph.remove(id);
            self.stats.terminated += 1;
        }

        debug_assert!(self.graph.check_integrity().is_ok());

        self.probe_coordination_messages()?;
        Ok(())
    }

    /// Probes the fabric for offload requests and kill or timeout
    /// broadcasts, without blocking.
    fn probe_coordination_messages(&mut self) -> Result<()> {
        if self.role() != Role::Worker {
            return Ok(());
        }
        let Some(fabric) = &self.fabric else {
            return Ok(());
        };
        let Some((_, message)) = fabric.try_recv().map_err(Error::Protocol)? else {
            return Ok(());
        };
        match message {
            Message::Offload => self.answer_offload_request()?,
            Message::Kill => {
                info!("kill received from master");
                self.halt_from_master = true;
                self.halt_execution = true;
            }
            Message::Timeout => {
                info!("global timeout received from master");
                self.halt_from_master = true;
                self.halt_execution = true;
            }
            other => {
                return Err(Error::Protocol(protocol::Error::UnexpectedMessage {
                    what: format!("{other:?} while executing"),
                }))
            }
        }
        Ok(())
    }

    /// Sends the frontier-size hysteresis hints to the master.
    fn exchange_offload_signals(&mut self) -> Result<()> {
        if self.role() != Role::Worker || !self.config.enable_load_balancing {
            return Ok(());
        }
        let size = self.scheduler.size();
        let Some(fabric) = &self.fabric else {
            return Ok(());
        };
        if self.ready_to_offload && size < OFFLOAD_NOT_READY_THRESHOLD {
            fabric
                .send(MASTER_RANK, Message::NotReadyToOffload)
                .map_err(Error::Protocol)?;
            self.ready_to_offload = false;
        } else if !self.ready_to_offload && size >= OFFLOAD_READY_THRESHOLD {
            fabric
                .send(MASTER_RANK, Message::ReadyToOffload)
                .map_err(Error::Protocol)?;
            self.ready_to_offload = true;
        }
        Ok(())
    }

    /// Answers an offload request: packages about a quarter of the
    /// shortest-history non-suspended states as a composite prefix, ships
    /// it, and parks the packaged states in the prefix pool.
    ///
    /// Parking happens immediately: a surrendered state must not be
    /// stepped again on this worker, its range now belongs elsewhere.
    fn answer_offload_request(&mut self) -> Result<()> {
        let package = self.select_offload_package();

        if package.is_empty() {
            debug!("offload request declined, frontier too small");
            return self.send_to(MASTER_RANK, Message::OffloadResp { prefix: None });
        }

        let histories: Vec<Vec<u8>> = package
            .iter()
            .map(|id| {
                self.graph
                    .state(*id)
                    .map(|s| s.branch_history.clone())
                    .map_err(locate_internal)
            })
            .collect::<Result<_>>()?;
        let borrowed: Vec<&[u8]> = histories.iter().map(Vec::as_slice).collect();
        let message = prefix::encode_composite(&borrowed);
        info!(states = package.len(), prefix = %message, "surrendering work");

        self.send_to(
            MASTER_RANK,
            Message::OffloadResp {
                prefix: Some(message),
            },
        )?;

        self.scheduler.update(&self.graph, None, &[], &package);
        for id in package {
            let state = self.graph.state_mut(id).map_err(locate_internal)?;
            state.clear_prefixes();
            let canonical = prefix::canonicalize(&state.branch_history)
                .expect("state histories only hold raw digits");
            self.prefix_tree.insert(&canonical);
            self.prefix_pool.insert(canonical, id);
        }
        Ok(())
    }

    /// Selects the states to surrender: the quarter of the non-suspended
    /// frontier with the shortest branch histories, at least
    /// [`OFFLOAD_MINIMUM_FRONTIER`] candidates required, at most
    /// [`OFFLOAD_PACKAGE_CAP`] shipped.
    fn select_offload_package(&mut self) -> Vec<StateId> {
        if self.halted() || !self.ready_to_offload {
            return vec![];
        }
        let mut candidates: Vec<(usize, StateId)> = self
            .graph
            .states()
            .filter(|s| {
                !s.is_suspended()
                    && !s.kind.is_recovery()
                    && !self.removed_states.contains(&s.id)
                    && !self.prefix_pool.values().any(|p| *p == s.id)
            })
            .map(|s| (s.branch_history.len(), s.id))
            .collect();

        if candidates.len() < OFFLOAD_MINIMUM_FRONTIER {
            return vec![];
        }
        candidates.sort();
        let take = (candidates.len() / OFFLOAD_FRACTION_DIVISOR)
            .max(1)
            .min(OFFLOAD_PACKAGE_CAP);
        candidates
            .into_iter()
            .take(take)
            .map(|(_, id)| id)
            .collect()
    }

    /// Handles a dispatched composite prefix: locates the suspended state
    /// behind each component through the prefix tree, attaches the raw
    /// prefix, and reinserts the resumed states into the scheduler.
    ///
    /// When the pool is empty (a worker's very first task) the prefix is
    /// attached to `fallback` instead, which is the worker's initial
    /// state.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the message is malformed or a component has no
    /// suspended ancestor to resume.
    pub fn handle_prefix_task(&mut self, message: &str, fallback: Option<StateId>) -> Result<()> {
        let components = prefix::decode_composite(message).map_err(Error::Protocol)?;
        let mut resumed: Vec<StateId> = vec![];
        let mut released: Vec<Vec<u8>> = vec![];

        for raw in components {
            let canonical = prefix::canonicalize(&raw).map_err(Error::Protocol)?;
            let target = match self.prefix_tree.longest_occupied_prefix(&canonical) {
                Some(path) => {
                    let id = *self
                        .prefix_pool
                        .get(&path)
                        .expect("occupied tree paths mirror the pool");
                    released.push(path);
                    id
                }
                None => fallback.ok_or_else(|| {
                    Error::Protocol(protocol::Error::NoSuspendedMatch {
                        prefix: String::from_utf8_lossy(&raw).into_owned(),
                    })
                })?,
            };

            self.graph
                .state_mut(target)
                .map_err(locate_internal)?
                .add_prefix(Prefix::new(raw));
            if !resumed.contains(&target) {
                resumed.push(target);
            }
        }

        for path in released {
            self.prefix_tree.release(&path);
            self.prefix_pool.remove(&path);
        }

        info!(states = resumed.len(), prefix = %message, "resuming for dispatched prefix");
        let already_scheduled = |id: &StateId| Some(*id) == fallback;
        let to_add: Vec<StateId> = resumed
            .into_iter()
            .filter(|id| !already_scheduled(id))
            .collect();
        self.resumed_states.extend(to_add);
        self.update_states(None)?;
        Ok(())
    }

    /// Estimates memory usage and, when far enough over the cap, kills
    /// randomly chosen non-suspended, non-recovery states until back in
    /// budget.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] on fatal failures while emitting the `.early`
    /// cases of killed states.
    fn check_memory_usage(&mut self) -> Result<()> {
        let interval = self.config.memory_check_interval.max(1);
        if self.config.max_memory_mb == 0
            || self.stats.instructions % interval != 0
            || self.stats.instructions == 0
        {
            return Ok(());
        }

        let used_mb = self
            .graph
            .states()
            .map(crate::state::ExecutionState::footprint)
            .sum::<usize>()
            >> 20;

        if used_mb <= self.config.max_memory_mb {
            self.at_memory_limit = false;
            return Ok(());
        }

        self.at_memory_limit = true;
        if used_mb <= self.config.max_memory_mb + MEMORY_KILL_SLACK_MB {
            return Ok(());
        }

        let total = self.graph.len();
        let to_kill = (total - total * self.config.max_memory_mb / used_mb).max(1);
        warn!("killing {to_kill} states (over memory cap)");

        let mut victims: Vec<StateId> = self
            .graph
            .states()
            .filter(|s| !s.is_suspended() && !s.kind.is_recovery())
            .map(|s| s.id)
            .collect();

        let mut remaining = victims.len();
        for _ in 0..to_kill.min(victims.len()) {
            if remaining == 0 {
                break;
            }
            let mut index = self.rng.gen_range(0..remaining);
            // Make two pulls to try and not hit a state that covered new
            // code.
            if self
                .graph
                .state(victims[index])
                .is_ok_and(|s| s.covered_new)
            {
                index = self.rng.gen_range(0..remaining);
            }
            victims.swap(index, remaining - 1);
            remaining -= 1;
            self.terminate_early(victims[remaining], "Memory limit exceeded.")?;
        }
        Ok(())
    }

    /// Dumps every remaining state as an `.early` test case, used when the
    /// run halts with live states. States parked in the ranging pool are
    /// not dumped; their ranges belong to other workers.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] on output failures.
    pub fn dump_remaining_states(&mut self) -> Result<()> {
        let parked: FxHashSet<StateId> = self.prefix_pool.values().copied().collect();
        let remaining: Vec<StateId> = self
            .graph
            .ids()
            .filter(|id| !parked.contains(id))
            .collect();
        if remaining.is_empty() {
            return Ok(());
        }
        info!(states = remaining.len(), "halting execution, dumping remaining states");
        for id in remaining {
            if self.graph.contains(id) && !self.removed_states.contains(&id) {
                self.terminate_early(id, "Execution halting.")?;
            }
        }
        self.update_states(None)
    }

    /// Checks whether the engine was halted by the master specifically.
    #[must_use]
    pub fn halted_by_master(&self) -> bool {
        self.halt_from_master
    }

    /// Checks whether remaining states are dumped when the run halts.
    #[must_use]
    pub fn dump_states_on_halt(&self) -> bool {
        self.config.dump_states_on_halt
    }

    /// Records that a bug was reported by another node, so the final exit
    /// status reflects it.
    pub fn note_remote_bug(&mut self) {
        self.bug_found = true;
    }

    /// Sends `message` to the node at `to`.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the fabric is gone.
    pub fn send_to(&self, to: crate::cluster::Rank, message: Message) -> Result<()> {
        let Some(fabric) = &self.fabric else {
            return Err(Error::Protocol(protocol::Error::Disconnected { rank: to }));
        };
        fabric.send(to, message).map_err(Error::Protocol)
    }

    /// Broadcasts `message` to every worker rank.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the fabric is gone.
    pub fn broadcast(&self, message: Message, num_workers: usize) -> Result<()> {
        for rank in 1..=num_workers {
            self.send_to(rank, message.clone())?;
        }
        Ok(())
    }

    /// Receives the next worker message, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the fabric is gone.
    pub fn recv_from_workers(
        &self,
        timeout: Duration,
    ) -> Result<Option<(crate::cluster::Rank, Message)>> {
        let Some(fabric) = &self.fabric else {
            return Ok(None);
        };
        fabric.recv_timeout(timeout).map_err(Error::Protocol)
    }

    /// Tells the master this worker's frontier is exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the fabric is gone.
    pub fn worker_notify_finished(&self) -> Result<()> {
        let Some(fabric) = &self.fabric else {
            return Ok(());
        };
        fabric
            .send(MASTER_RANK, Message::Finish)
            .map_err(Error::Protocol)
    }

    /// Blocks until the master sends the next task. Returns `true` when a
    /// prefix task was installed and execution should continue, `false`
    /// when the worker was told to stop.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] on protocol violations or a lost fabric.
    pub fn worker_wait_for_task(&mut self, fallback: Option<StateId>) -> Result<bool> {
        loop {
            let message = {
                let Some(fabric) = &self.fabric else {
                    return Ok(false);
                };
                fabric.recv().map_err(Error::Protocol)?.1
            };
            match message {
                Message::StartPrefixTask { prefix } => {
                    self.handle_prefix_task(&prefix, fallback)?;
                    return Ok(true);
                }
                Message::Kill | Message::Timeout => {
                    info!("stop received while idle");
                    self.halt_from_master = true;
                    self.halt_execution = true;
                    return Ok(false);
                }
                Message::Offload => {
                    // A request racing our finish notification: we have
                    // nothing to give.
                    let Some(fabric) = &self.fabric else {
                        return Ok(false);
                    };
                    fabric
                        .send(MASTER_RANK, Message::OffloadResp { prefix: None })
                        .map_err(Error::Protocol)?;
                }
                other => {
                    return Err(Error::Protocol(protocol::Error::UnexpectedMessage {
                        what: format!("{other:?} while idle"),
                    }))
                }
            }
        }
    }

    /// Finishes the run: writes the summary and returns it.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] on output failures.
    pub fn finish(&mut self) -> Result<RunSummary> {
        self.stats.errors = u32::try_from(self.emitted_errors.len()).unwrap_or(u32::MAX);
        let summary = RunSummary {
            stats: self.stats,
            tests_written: self.outputs.stats().tests_written,
            errors_written: self.outputs.stats().errors_written,
            bug_found: self.bug_found,
        };
        self.outputs.write_summary(&summary)?;
        Ok(summary)
    }

    // Termination paths.

    /// Terminates `id` alone, without a test case.
    pub(crate) fn terminate_state(&mut self, id: StateId) {
        if !self.removed_states.contains(&id) {
            self.removed_states.push(id);
        }
    }

    /// Terminates the whole dependent chain of `id`, innermost recovery
    /// first.
    pub(crate) fn terminate_state_recursively(&mut self, id: StateId) {
        let mut current = Some(id);
        while let Some(id) = current {
            current = self
                .graph
                .state(id)
                .ok()
                .filter(|s| s.kind.is_recovery())
                .and_then(|s| s.dependent_state);
            self.terminate_state(id);
        }
    }

    /// Terminates `id` early (not a bug), emitting an `.early` case.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] on output failures.
    pub(crate) fn terminate_early(&mut self, id: StateId, message: &str) -> Result<()> {
        debug!(state = id.0, message, "terminating early");
        self.emit_test_case(id, Some("early"), Some(message))?;
        let is_recovery = self
            .graph
            .state(id)
            .is_ok_and(|s| s.kind.is_recovery());
        if is_recovery {
            self.terminate_state_recursively(id);
        } else {
            self.terminate_state(id);
        }
        Ok(())
    }

    /// Terminates `id` on a normal path end, emitting a plain test case.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] on output failures.
    pub(crate) fn terminate_on_exit(&mut self, id: StateId) -> Result<()> {
        debug!(state = id.0, "path terminated normally");
        self.emit_test_case(id, None, None)?;
        self.terminate_state(id);
        Ok(())
    }

    /// Terminates `id` with an error, emitting a `.err` case, driving the
    /// exit-on policies and, in a cluster, reporting the bug upstream.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] on output or fabric failures.
    pub(crate) fn terminate_on_error(
        &mut self,
        id: StateId,
        reason: TerminateReason,
        message: &str,
        info: Option<&str>,
    ) -> Result<()> {
        let (instruction_id, location) = {
            let state = self.graph.state(id).map_err(locate_internal)?;
            let debug_info = &state.prev_pc.instruction(&self.program).debug;
            (
                debug_info.instruction_id,
                (debug_info.file_basename().to_owned(), debug_info.line),
            )
        };

        let fresh = self
            .emitted_errors
            .insert((instruction_id, message.to_owned()));
        if self.config.emit_all_errors || fresh {
            warn!(
                file = %location.0,
                line = location.1,
                "ERROR: {message}"
            );
            if !self.config.emit_all_errors {
                info!("NOTE: now ignoring this error at this location");
            }

            let mut rendered = format!("Error: {message}\n");
            rendered.push_str(&format!("File: {}\nLine: {}\n", location.0, location.1));
            rendered.push_str("Stack:\n");
            {
                let state = self.graph.state(id).map_err(locate_internal)?;
                for frame in state.stack.iter().rev() {
                    let name = &self.program.function(frame.func).name;
                    rendered.push_str(&format!("  in {name}\n"));
                }
            }
            if let Some(info) = info {
                rendered.push_str(&format!("Info:\n{info}\n"));
            }
            self.emit_test_case(id, Some(reason.suffix()), Some(&rendered))?;
        }

        let is_recovery = self
            .graph
            .state(id)
            .is_ok_and(|s| s.kind.is_recovery());
        if is_recovery {
            self.terminate_state_recursively(id);
        } else {
            self.terminate_state(id);
        }

        if self.config.should_exit_on(reason) {
            self.bug_found = true;
            self.apply_error_halting_policy(&location)?;
        }
        Ok(())
    }

    /// Applies the halting policies after an exit-on error: either the
    /// error-location table (halt once every configured location was hit)
    /// or the plain error count.
    fn apply_error_halting_policy(&mut self, location: &(String, u32)) -> Result<()> {
        if self.error_locations.is_empty() {
            if self.config.error_locations.is_empty() {
                let count = u32::try_from(self.emitted_errors.len()).unwrap_or(u32::MAX);
                if self.config.max_error_count == 0 || count >= self.config.max_error_count {
                    self.halt_execution = true;
                }
            }
            // A previously drained table keeps the engine halting.
            return Ok(());
        }

        if let Some(lines) = self.error_locations.get_mut(&location.0) {
            lines.retain(|line| *line != location.1);
            if lines.is_empty() {
                self.error_locations.remove(&location.0);
            }
        }

        if self.error_locations.is_empty() {
            info!("every configured error location was hit, halting");
            self.halt_execution = true;
            match self.role() {
                Role::Worker => {
                    if let Some(fabric) = &self.fabric {
                        fabric
                            .send(MASTER_RANK, Message::BugFound)
                            .map_err(Error::Protocol)?;
                    }
                }
                Role::Master | Role::Standalone => {
                    self.halt_from_master = true;
                }
            }
        }
        Ok(())
    }

    /// Solves the path constraints of `id` and writes its test case.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] on output failures. Solver failures lose the test
    /// case with a warning, as does the covering-new filter.
    fn emit_test_case(
        &mut self,
        id: StateId,
        suffix: Option<&str>,
        message: Option<&str>,
    ) -> Result<()> {
        let Ok(state) = self.graph.state(id) else {
            return Ok(());
        };

        if self.config.only_output_states_covering_new && !state.covered_new {
            return Ok(());
        }

        let model = match self.solver.get_model(state.constraints.items()) {
            Ok(model) => model,
            Err(error) => {
                warn!(state = id.0, %error, "unable to compute a test input, losing test case");
                return Ok(());
            }
        };

        let objects: Vec<TestObject> = state
            .symbolics
            .iter()
            .map(|(name, width)| {
                let value = model.get(name).unwrap_or(0);
                let bytes = value.to_le_bytes()[..width.bytes() as usize].to_vec();
                TestObject {
                    name: name.clone(),
                    bytes,
                }
            })
            .collect();

        let history = state.history_string();
        self.outputs
            .process_test_case(objects, history, suffix, message)?;
        Ok(())
    }

    // Shared small helpers used by the submodules.

    /// Records that the state `id` covered the source location of its
    /// current instruction, updating the covering-new statistics.
    pub(crate) fn note_coverage(&mut self, id: StateId) {
        let Ok(state) = self.graph.state(id) else {
            return;
        };
        let debug_info = state.prev_pc.instruction(&self.program).debug.clone();
        let globally_new = self
            .covered_ever
            .entry(debug_info.file.clone())
            .or_default()
            .insert(debug_info.line);

        let Ok(state) = self.graph.state_mut(id) else {
            return;
        };
        state.cover_line(&debug_info.file, debug_info.line);
        if globally_new {
            state.covered_new = true;
            state.insts_since_cov_new = 0;
        } else {
            state.insts_since_cov_new += 1;
        }
    }

    /// Adds `constraint` to the state `id`.
    pub(crate) fn add_constraint(&mut self, id: StateId, constraint: ExprRef) {
        if let Ok(state) = self.graph.state_mut(id) {
            state.add_constraint(constraint);
        }
    }

    /// Binds the globals of the program into the address space of `id`.
    fn bind_globals(&mut self, id: StateId) -> Result<()> {
        use crate::{ir::AllocSite, memory::allocation::StorageClass};

        let globals: Vec<_> = self
            .program
            .clone()
            .globals()
            .map(|(gid, g)| (gid, g.clone()))
            .collect();
        for (gid, global) in globals {
            let object = self.allocator.allocate(
                global.size,
                StorageClass::Global,
                global.is_read_only,
                AllocSite::Global(global.name.clone()),
            );
            self.global_objects.insert(gid, object.clone());
            let contents = ObjectState::with_bytes(global.size, &global.initializer);
            self.graph
                .state_mut(id)
                .map_err(locate_internal)?
                .address_space
                .bind(object, contents);
        }
        Ok(())
    }

    /// Logs the instruction about to execute, when enabled.
    pub(crate) fn log_step(&mut self, id: StateId) -> Result<()> {
        if !self.config.log_instructions {
            return Ok(());
        }
        let Ok(state) = self.graph.state(id) else {
            return Ok(());
        };
        let debug_info = &state.pc.instruction(&self.program).debug;
        let line = format!(
            "{} {}:{} state {}",
            debug_info.instruction_id, debug_info.file, debug_info.line, id.0
        );
        self.outputs.log_instruction(&line)?;
        Ok(())
    }

    /// Gets the entry function handle for the named slice or function.
    pub(crate) fn function_named(&self, name: &str) -> Option<FuncId> {
        self.program.function_named(name)
    }
}

/// Wraps an internal bookkeeping error into the crate error type.
pub(crate) fn locate_internal(error: ExecError) -> Error {
    Error::Execution(crate::error::container::Located {
        instruction_id: 0,
        source: None,
        payload: error,
    })
}
