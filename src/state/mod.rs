//! This module contains the representation of an in-flight symbolic path:
//! the [`ExecutionState`] with its call stack, address space, path
//! constraints and branch history, the [`Snapshot`]s taken at skipped
//! calls, and the bookkeeping that connects recovery states to the states
//! they service.

pub mod graph;
pub mod process_tree;

pub use graph::StateGraph;
pub use process_tree::{NodeContent, NodeId, ProcessTree};

use std::rc::Rc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    expr::{Expr, ExprRef, Width},
    ir::{FuncId, InstRef},
    memory::{AddressSpace, AllocationRecord, ObjectId},
};

/// A unique handle for an execution state within one worker.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct StateId(pub u64);

/// The role a state plays, as a pair of orthogonal capabilities.
///
/// A plain recovery state spawned from the first snapshot is `RECOVERY`
/// only; one spawned from a later snapshot is both `NORMAL` and `RECOVERY`,
/// because the slice it re-executes may itself depend on earlier skipped
/// calls and thus spawn further recovery.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StateKind(u8);

impl StateKind {
    /// The kind of an ordinary exploration state.
    pub const NORMAL: StateKind = StateKind(1);
    /// The kind of a pure recovery state.
    pub const RECOVERY: StateKind = StateKind(2);
    /// The kind of a recovery state that may itself spawn recovery.
    pub const NORMAL_RECOVERY: StateKind = StateKind(3);

    /// Checks whether the state has normal-state capabilities.
    #[must_use]
    pub fn is_normal(self) -> bool {
        self.0 & 1 != 0
    }

    /// Checks whether the state is a recovery state.
    #[must_use]
    pub fn is_recovery(self) -> bool {
        self.0 & 2 != 0
    }
}

/// The scheduling priority of a recovery state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Priority {
    /// An ordinary recovery state.
    Low,
    /// A freshly spawned recovery state that should run before the rest of
    /// the recovery lane.
    High,
}

/// One frame of a state's call stack.
#[derive(Clone, Debug)]
pub struct StackFrame {
    /// The call instruction that pushed this frame, absent for the entry
    /// frame.
    pub caller: Option<InstRef>,

    /// The function executing in this frame.
    pub func: FuncId,

    /// The per-register value cells of the frame.
    pub locals: Vec<Option<ExprRef>>,

    /// The stack allocations owned by the frame, unbound when it pops.
    pub allocas: Vec<ObjectId>,

    /// The object holding overflow arguments of a variadic call.
    pub varargs: Option<ObjectId>,

    /// Instructions executed while this frame was on top, feeding the
    /// call-path instruction-count scheduling weight.
    pub inst_count: u64,

    /// The caller's incoming-block marker, restored when this frame pops
    /// so phi resolution in the caller is unaffected by the call.
    pub caller_incoming: Option<crate::ir::BlockId>,
}

impl StackFrame {
    /// Constructs a frame for `func` with `num_registers` empty cells,
    /// called from `caller`.
    #[must_use]
    pub fn new(caller: Option<InstRef>, func: FuncId, num_registers: u32) -> Self {
        Self {
            caller,
            func,
            locals: vec![None; num_registers as usize],
            allocas: vec![],
            varargs: None,
            inst_count: 0,
            caller_incoming: None,
        }
    }
}

/// The ordered, canonicalized set of path constraints of a state.
#[derive(Clone, Debug, Default)]
pub struct ConstraintSet {
    items: Vec<ExprRef>,
    seen:  FxHashSet<ExprRef>,
}

impl ConstraintSet {
    /// Constructs an empty constraint set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `constraint` to the set, ignoring duplicates and the constant
    /// `true`.
    pub fn add(&mut self, constraint: ExprRef) {
        if constraint.is_true() {
            return;
        }
        if self.seen.insert(constraint.clone()) {
            self.items.push(constraint);
        }
    }

    /// Gets the constraints in insertion order.
    #[must_use]
    pub fn items(&self) -> &[ExprRef] {
        &self.items
    }

    /// Gets the number of constraints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Checks whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// An immutable copy of a state captured at the moment a side-effecting
/// call was skipped, together with the skipped callee.
///
/// Snapshots are the one place where ownership of a state is genuinely
/// shared: the state that took the snapshot holds it through its snapshot
/// history, and every recovery state spawned from it holds it through its
/// recovery info.
#[derive(Clone, Debug)]
pub struct Snapshot {
    /// The captured state.
    pub state: ExecutionState,

    /// The name of the skipped callee.
    pub callee: String,
}

/// A recovery task: which slice of which skipped callee must be re-executed
/// to service a blocking load.
#[derive(Clone, Debug)]
pub struct RecoveryInfo {
    /// The blocking load instruction.
    pub load_inst: InstRef,

    /// The identifier of the blocking load instruction.
    pub load_inst_id: u64,

    /// The concrete address the load reads from.
    pub load_addr: u64,

    /// The size of the load in bytes.
    pub load_size: u64,

    /// The skipped callee to re-execute.
    pub callee: String,

    /// The slice of the callee to inject.
    pub slice_id: u32,

    /// The snapshot to re-execute from.
    pub snapshot: Rc<Snapshot>,

    /// The index of that snapshot in the dependent's history.
    pub snapshot_index: usize,

    /// Disambiguates repeated recoveries of the same slice.
    pub sub_id: u32,
}

/// What is known about a store performed at an address after the first
/// snapshot was taken.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WrittenAddressInfo {
    /// The widest store seen at the address, in bytes.
    pub max_size: u64,

    /// The snapshot index current when the latest store happened.
    pub snapshot_index: usize,
}

/// A prefix guiding the branch decisions of a ranging state.
///
/// Digits are over the raw alphabet `{'0','1','2','3'}`: forked
/// true/false, and taken true/false without forking. The canonical `{0,1}`
/// form used for radix-tree keys is derived, never stored here.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Prefix {
    digits: Rc<[u8]>,
}

impl Prefix {
    /// Constructs a prefix from raw digits.
    ///
    /// # Panics
    ///
    /// Panics if a digit is outside `{'0','1','2','3'}`; prefixes are
    /// produced by the ingress canonicalizer, so this is a programmer bug.
    #[must_use]
    pub fn new(digits: impl Into<Rc<[u8]>>) -> Self {
        let digits = digits.into();
        assert!(
            digits.iter().all(|d| (b'0'..=b'3').contains(d)),
            "prefix digit outside the raw alphabet"
        );
        Self { digits }
    }

    /// Gets the raw digits of the prefix.
    #[must_use]
    pub fn digits(&self) -> &[u8] {
        &self.digits
    }

    /// Gets the length of the prefix.
    #[must_use]
    pub fn len(&self) -> usize {
        self.digits.len()
    }

    /// Checks whether the prefix is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.digits.is_empty()
    }

    /// Gets the digit guiding the branch event at `depth`, if the prefix
    /// extends that far.
    #[must_use]
    pub fn digit_at(&self, depth: usize) -> Option<u8> {
        self.digits.get(depth).copied()
    }
}

/// The decision a ranging state's prefixes dictate at a branch.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PrefixDirection {
    /// Take the true branch; `fork_and_suspend` says whether the false
    /// sibling is forked into the suspended pool.
    TakeTrue { fork_and_suspend: bool },

    /// Take the false branch, symmetrically.
    TakeFalse { fork_and_suspend: bool },

    /// The prefixes disagree at this depth; perform a real solver fork and
    /// partition the prefixes onto the children.
    Disagree,
}

/// One in-flight symbolic path.
#[derive(Clone, Debug)]
pub struct ExecutionState {
    /// The handle of this state within its worker.
    pub id: StateId,

    /// The role this state plays.
    pub kind: StateKind,

    /// The instruction to execute next.
    pub pc: InstRef,

    /// The instruction executed last.
    pub prev_pc: InstRef,

    /// The call stack, outermost frame first.
    pub stack: Vec<StackFrame>,

    /// The block control flow arrived from, for phi resolution.
    pub incoming_block: Option<crate::ir::BlockId>,

    /// The address space of the state.
    pub address_space: AddressSpace,

    /// The path constraints collected so far.
    pub constraints: ConstraintSet,

    /// The branch events taken to reach this state, over
    /// `{'0','1','2','3'}`.
    pub branch_history: Vec<u8>,

    /// The number of observable branch events on this path. Kept equal to
    /// `branch_history.len()`; prefix guidance indexes prefixes by it.
    pub depth: usize,

    /// The leaf of the process tree carrying this state.
    pub ptree_node: NodeId,

    /// The symbolic inputs introduced on this path, in order, for test
    /// emission.
    pub symbolics: Vec<(String, Width)>,

    /// The names already used for symbolic inputs, to avoid collisions.
    pub array_names: FxHashSet<String>,

    /// Total solver time spent on behalf of this state, in seconds.
    pub query_cost: f64,

    /// The scheduling weight of this state.
    pub weight: f64,

    /// The instructions executed by this state.
    pub inst_count: u64,

    /// Source lines covered by this path.
    pub covered_lines: FxHashMap<std::sync::Arc<str>, FxHashSet<u32>>,

    /// Instructions executed since this path last covered a new line.
    pub insts_since_cov_new: u64,

    /// Whether this path covered a line no other path had covered.
    pub covered_new: bool,

    /// Disables forking for this state.
    pub fork_disabled: bool,

    /// The prefixes currently guiding this state, raw alphabet.
    pub prefixes: Vec<Prefix>,

    // Normal-state bookkeeping.
    /// Whether the state is suspended waiting for recovery.
    suspended: bool,

    /// The snapshots taken at skipped calls, in skip order.
    pub snapshots: Vec<Rc<Snapshot>>,

    /// The currently running recovery state servicing this state.
    pub recovery_state: Option<StateId>,

    /// Whether the last blocking load has been recovered.
    blocking_load_recovered: bool,

    /// Addresses whose recovery is already complete.
    pub recovered_loads: FxHashSet<u64>,

    /// The allocations performed by this state, for address-stable
    /// re-execution.
    pub allocation_record: AllocationRecord,

    /// Constraints added after the first snapshot; imported into future
    /// recovery states.
    pub guiding_constraints: Vec<ExprRef>,

    /// Stores performed since the first snapshot, by address.
    pub written_addresses: FxHashMap<u64, WrittenAddressInfo>,

    /// Recovery tasks waiting to run for this state.
    pub pending_recovery_infos: Vec<Rc<RecoveryInfo>>,

    /// Memoized slice re-executions:
    /// `(snapshot index, slice id) → (address → value)`. A `None` value
    /// records a pending or non-modifying slice.
    pub recovery_cache: FxHashMap<(usize, u32), FxHashMap<u64, Option<ExprRef>>>,

    // Recovery-state bookkeeping.
    /// Where the recovery state must stop: the instruction after the
    /// skipped call, at the captured stack depth.
    pub exit_resume: Option<(InstRef, usize)>,

    /// The state whose blocking load this recovery state services.
    pub dependent_state: Option<StateId>,

    /// The outermost non-recovery ancestor of this recovery chain.
    pub originating_state: Option<StateId>,

    /// The task this recovery state is executing.
    pub recovery_info: Option<Rc<RecoveryInfo>>,

    /// The dependent's allocation record, guiding allocations during
    /// re-execution.
    pub guiding_allocation_record: AllocationRecord,

    /// The recursion level of this recovery state.
    pub level: u32,

    /// The scheduling priority of this recovery state.
    pub priority: Priority,
}

impl ExecutionState {
    /// Constructs the initial state for `entry`, positioned at its first
    /// instruction.
    #[must_use]
    pub fn initial(id: StateId, entry: FuncId, num_registers: u32, ptree_node: NodeId) -> Self {
        let pc = InstRef::entry(entry);
        Self {
            id,
            kind: StateKind::NORMAL,
            pc,
            prev_pc: pc,
            stack: vec![StackFrame::new(None, entry, num_registers)],
            incoming_block: None,
            address_space: AddressSpace::new(),
            constraints: ConstraintSet::new(),
            branch_history: vec![],
            depth: 0,
            ptree_node,
            symbolics: vec![],
            array_names: FxHashSet::default(),
            query_cost: 0.0,
            weight: 1.0,
            inst_count: 0,
            covered_lines: FxHashMap::default(),
            insts_since_cov_new: 0,
            covered_new: false,
            fork_disabled: false,
            prefixes: vec![],
            suspended: false,
            snapshots: vec![],
            recovery_state: None,
            blocking_load_recovered: false,
            recovered_loads: FxHashSet::default(),
            allocation_record: AllocationRecord::new(),
            guiding_constraints: vec![],
            written_addresses: FxHashMap::default(),
            pending_recovery_infos: vec![],
            recovery_cache: FxHashMap::default(),
            exit_resume: None,
            dependent_state: None,
            originating_state: None,
            recovery_info: None,
            guiding_allocation_record: AllocationRecord::new(),
            level: 0,
            priority: Priority::Low,
        }
    }

    /// Gets the frame currently executing.
    ///
    /// # Panics
    ///
    /// Panics if the stack is empty; a live state always has at least the
    /// entry frame, so this is a programmer bug.
    #[must_use]
    pub fn frame(&self) -> &StackFrame {
        self.stack.last().expect("a live state has a frame")
    }

    /// Gets the frame currently executing, mutably.
    ///
    /// # Panics
    ///
    /// Panics if the stack is empty, as for [`Self::frame`].
    pub fn frame_mut(&mut self) -> &mut StackFrame {
        self.stack.last_mut().expect("a live state has a frame")
    }

    /// Adds `constraint` to the path constraints. On a normal,
    /// non-recovery state with snapshot history the constraint also joins
    /// the guiding set that future recovery states import.
    pub fn add_constraint(&mut self, constraint: ExprRef) {
        self.constraints.add(constraint.clone());
        if self.kind.is_normal() && !self.kind.is_recovery() && !self.snapshots.is_empty() {
            self.add_guiding_constraint(constraint);
        }
    }

    /// Adds `constraint` to the guiding set.
    pub fn add_guiding_constraint(&mut self, constraint: ExprRef) {
        if !self.guiding_constraints.contains(&constraint) {
            self.guiding_constraints.push(constraint);
        }
    }

    /// Appends an observable branch event `digit` to the history, keeping
    /// `depth` in lockstep.
    pub fn append_branch_event(&mut self, digit: u8) {
        debug_assert!((b'0'..=b'3').contains(&digit));
        self.branch_history.push(digit);
        self.depth += 1;
    }

    /// Replaces this state's branch history (and depth) with `other`'s.
    ///
    /// Used when a recovery state hands control back to its dependent: the
    /// branches the recovery took become part of the dependent's path.
    pub fn replicate_branch_history(&mut self, history: &[u8]) {
        self.branch_history = history.to_vec();
        self.depth = history.len();
    }

    /// Gets the branch history as a `{0,1,2,3}` string.
    #[must_use]
    pub fn history_string(&self) -> String {
        String::from_utf8(self.branch_history.clone()).expect("history digits are ASCII")
    }

    /// Checks whether the state is suspended.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Suspends the state.
    ///
    /// # Panics
    ///
    /// Panics if called on a state without normal capabilities; only
    /// dependent states suspend.
    pub fn set_suspended(&mut self) {
        assert!(self.kind.is_normal(), "only normal states suspend");
        self.suspended = true;
    }

    /// Resumes the state.
    ///
    /// # Panics
    ///
    /// Panics if called on a state without normal capabilities.
    pub fn set_resumed(&mut self) {
        assert!(self.kind.is_normal(), "only normal states resume");
        self.suspended = false;
    }

    /// Gets the index of the most recent snapshot.
    ///
    /// # Panics
    ///
    /// Panics if no snapshot was taken; callers check
    /// [`Self::in_dependent_mode`] first.
    #[must_use]
    pub fn current_snapshot_index(&self) -> usize {
        assert!(!self.snapshots.is_empty(), "no snapshot has been taken");
        self.snapshots.len() - 1
    }

    /// Checks whether the state has skipped at least one side-effecting
    /// call, and thus must check reads against recovery.
    #[must_use]
    pub fn in_dependent_mode(&self) -> bool {
        !self.snapshots.is_empty()
    }

    /// Checks whether the last blocking load has been recovered.
    #[must_use]
    pub fn is_blocking_load_recovered(&self) -> bool {
        self.blocking_load_recovered
    }

    /// Marks the last blocking load as recovered.
    pub fn mark_load_recovered(&mut self) {
        self.blocking_load_recovered = true;
    }

    /// Clears the recovered marker ahead of the next blocking load.
    pub fn mark_load_unrecovered(&mut self) {
        self.blocking_load_recovered = false;
    }

    /// Records a store of `size` bytes at `address` under the current
    /// snapshot index.
    pub fn add_written_address(&mut self, address: u64, size: u64, snapshot_index: usize) {
        let info = self
            .written_addresses
            .entry(address)
            .or_insert(WrittenAddressInfo {
                max_size: 0,
                snapshot_index,
            });
        info.max_size = info.max_size.max(size);
        info.snapshot_index = snapshot_index;
    }

    /// Gets the overwrite info for `address` if the stores there amount to
    /// a complete overwrite of a load of `load_size` bytes.
    #[must_use]
    pub fn complete_overwrite_info(
        &self,
        address: u64,
        load_size: u64,
    ) -> Option<WrittenAddressInfo> {
        self.written_addresses
            .get(&address)
            .copied()
            .filter(|info| info.max_size >= load_size)
    }

    /// Gets the lowest snapshot index unaffected by a prior complete
    /// overwrite of a load at `address`.
    #[must_use]
    pub fn starting_snapshot_index(&self, address: u64, load_size: u64) -> usize {
        self.complete_overwrite_info(address, load_size)
            .map_or(0, |info| info.snapshot_index + 1)
    }

    /// Memoizes the value written (or `None` for pending/non-modifying)
    /// by the slice `(snapshot_index, slice_id)` at `address`.
    pub fn update_recovered_value(
        &mut self,
        snapshot_index: usize,
        slice_id: u32,
        address: u64,
        value: Option<ExprRef>,
    ) {
        self.recovery_cache
            .entry((snapshot_index, slice_id))
            .or_default()
            .insert(address, value);
    }

    /// Looks up the memoized result of `(snapshot_index, slice_id)` at
    /// `address`. The outer [`Option`] distinguishes "never executed" from
    /// "executed but non-modifying".
    #[must_use]
    pub fn recovered_value(
        &self,
        snapshot_index: usize,
        slice_id: u32,
        address: u64,
    ) -> Option<Option<ExprRef>> {
        self.recovery_cache
            .get(&(snapshot_index, slice_id))
            .and_then(|values| values.get(&address))
            .cloned()
    }

    /// Uniquifies `name` against the names already used on this path,
    /// without registering it as a test-case input.
    pub fn unique_name(&mut self, name: &str) -> String {
        let mut unique = name.to_owned();
        let mut counter = 1;
        while !self.array_names.insert(unique.clone()) {
            unique = format!("{name}_{counter}");
            counter += 1;
        }
        unique
    }

    /// Registers a symbolic input name, uniquifying it against the names
    /// already used on this path. Registered inputs appear as objects of
    /// the emitted test case.
    pub fn register_symbolic(&mut self, name: &str, width: Width) -> String {
        let unique = self.unique_name(name);
        self.symbolics.push((unique.clone(), width));
        unique
    }

    /// Records that this state covered `line` of `file`, returning whether
    /// the line is new for this path.
    pub fn cover_line(&mut self, file: &std::sync::Arc<str>, line: u32) -> bool {
        self.covered_lines
            .entry(file.clone())
            .or_default()
            .insert(line)
    }

    /// Builds the call-trace component of an allocation context: the
    /// identifiers of the call sites on the stack, outermost first.
    #[must_use]
    pub fn call_trace(&self, program: &crate::ir::Program) -> Vec<u64> {
        self.stack
            .iter()
            .filter_map(|frame| frame.caller)
            .map(|caller| caller.instruction(program).debug.instruction_id)
            .collect()
    }

    // Prefix-guided ranging.

    /// Attaches `prefix` to this state.
    pub fn add_prefix(&mut self, prefix: Prefix) {
        self.prefixes.push(prefix);
    }

    /// Drops every attached prefix.
    pub fn clear_prefixes(&mut self) {
        self.prefixes.clear();
    }

    /// Checks whether at least one prefix still extends past the current
    /// depth, so the next branch decision comes from the prefixes rather
    /// than the solver.
    #[must_use]
    pub fn should_range(&self) -> bool {
        self.prefixes.iter().any(|p| self.depth < p.len())
    }

    /// Gets the direction the prefixes dictate at the current depth.
    ///
    /// Any disagreement between the live prefixes' digits at this depth is
    /// a [`PrefixDirection::Disagree`], which the fork logic turns into a
    /// real solver fork with the prefixes partitioned onto the children.
    ///
    /// # Panics
    ///
    /// Panics if no prefix extends past the current depth; callers check
    /// [`Self::should_range`] first.
    #[must_use]
    pub fn direction_to_take(&self) -> PrefixDirection {
        let live: Vec<u8> = self
            .prefixes
            .iter()
            .filter_map(|p| p.digit_at(self.depth))
            .collect();
        let first = *live.first().expect("should_range was checked");

        if live.iter().any(|digit| *digit != first) {
            return PrefixDirection::Disagree;
        }

        match first {
            b'0' => PrefixDirection::TakeTrue {
                fork_and_suspend: true,
            },
            b'1' => PrefixDirection::TakeFalse {
                fork_and_suspend: true,
            },
            b'2' => PrefixDirection::TakeTrue {
                fork_and_suspend: false,
            },
            b'3' => PrefixDirection::TakeFalse {
                fork_and_suspend: false,
            },
            _ => unreachable!("prefix digits are validated on construction"),
        }
    }

    /// After a real fork, keeps only the prefixes that continue on the
    /// true side at the current depth (digits `'0'` and `'2'`), and drops
    /// prefixes that are already exhausted.
    pub fn retain_true_prefixes(&mut self) {
        let depth = self.depth;
        self.prefixes.retain(|p| {
            p.digit_at(depth)
                .is_some_and(|d| d == b'0' || d == b'2')
        });
    }

    /// After a real fork, keeps only the prefixes that continue on the
    /// false side at the current depth (digits `'1'` and `'3'`).
    pub fn retain_false_prefixes(&mut self) {
        let depth = self.depth;
        self.prefixes.retain(|p| {
            p.digit_at(depth)
                .is_some_and(|d| d == b'1' || d == b'3')
        });
    }

    /// Estimates the heap footprint of the state, used for the memory cap.
    #[must_use]
    pub fn footprint(&self) -> usize {
        self.address_space.footprint()
            + self.constraints.len() * 64
            + self.branch_history.len()
            + self.stack.iter().map(|f| f.locals.len() * 16).sum::<usize>()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::FuncId;

    fn state() -> ExecutionState {
        ExecutionState::initial(StateId(0), FuncId(0), 4, NodeId(0))
    }

    #[test]
    fn depth_tracks_history_length() {
        let mut s = state();
        s.append_branch_event(b'0');
        s.append_branch_event(b'2');
        s.append_branch_event(b'3');
        assert_eq!(s.depth, 3);
        assert_eq!(s.branch_history.len(), s.depth);
        assert_eq!(s.history_string(), "023");
    }

    #[test]
    fn guiding_constraints_only_collect_in_dependent_mode() {
        let mut s = state();
        let c = Expr::symbol("c", Width::BOOL);
        s.add_constraint(c.clone());
        assert!(s.guiding_constraints.is_empty());

        s.snapshots.push(Rc::new(Snapshot {
            state:  s.clone(),
            callee: "skipped".into(),
        }));
        let d = Expr::symbol("d", Width::BOOL);
        s.add_constraint(d.clone());
        assert_eq!(s.guiding_constraints, vec![d]);
    }

    #[test]
    fn prefix_agreement_directs_without_forking() {
        let mut s = state();
        s.add_prefix(Prefix::new(*b"20"));
        s.add_prefix(Prefix::new(*b"21"));
        assert!(s.should_range());
        assert_eq!(
            s.direction_to_take(),
            PrefixDirection::TakeTrue {
                fork_and_suspend: false
            }
        );
    }

    #[test]
    fn prefix_disagreement_forces_a_fork() {
        let mut s = state();
        s.add_prefix(Prefix::new(*b"01"));
        s.add_prefix(Prefix::new(*b"11"));
        assert_eq!(s.direction_to_take(), PrefixDirection::Disagree);

        let mut true_side = s.clone();
        true_side.retain_true_prefixes();
        assert_eq!(true_side.prefixes, vec![Prefix::new(*b"01")]);

        s.retain_false_prefixes();
        assert_eq!(s.prefixes, vec![Prefix::new(*b"11")]);
    }

    #[test]
    fn exhausted_prefixes_stop_ranging() {
        let mut s = state();
        s.add_prefix(Prefix::new(*b"0"));
        s.append_branch_event(b'0');
        assert!(!s.should_range());
    }

    #[test]
    fn overwrite_tracking_reports_starting_index() {
        let mut s = state();
        assert_eq!(s.starting_snapshot_index(0x100, 4), 0);

        s.add_written_address(0x100, 4, 2);
        assert_eq!(s.starting_snapshot_index(0x100, 4), 3);
        // A narrower store is not a complete overwrite of a wider load.
        assert_eq!(s.starting_snapshot_index(0x100, 8), 0);
    }

    #[test]
    fn recovery_cache_distinguishes_pending_from_missing() {
        let mut s = state();
        assert_eq!(s.recovered_value(0, 1, 0x10), None);

        s.update_recovered_value(0, 1, 0x10, None);
        assert_eq!(s.recovered_value(0, 1, 0x10), Some(None));

        let v = Expr::constant(9, Width::B32);
        s.update_recovered_value(0, 1, 0x10, Some(v.clone()));
        assert_eq!(s.recovered_value(0, 1, 0x10), Some(Some(v)));
    }

    #[test]
    fn symbolic_names_are_uniquified() {
        let mut s = state();
        assert_eq!(s.register_symbolic("x", Width::B32), "x");
        assert_eq!(s.register_symbolic("x", Width::B32), "x_1");
        assert_eq!(s.symbolics.len(), 2);
    }
}
