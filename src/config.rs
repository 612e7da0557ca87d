//! This module contains the configuration of the engine.

use rustc_hash::FxHashMap;

use crate::{
    constant::{
        DEFAULT_MAX_DEPTH,
        DEFAULT_MAX_FORKS,
        DEFAULT_MAX_MEMORY_MB,
        DEFAULT_SOLVER_TIMEOUT_MS,
        DEFAULT_SPLIT_RATIO,
        MEMORY_CHECK_INTERVAL,
    },
    error::execution::TerminateReason,
    search::{RecoverySearchKind, SearchKind},
};

/// The configuration of a single engine instance.
///
/// Workers receive a copy by value; there is no process-wide configuration
/// object.
#[derive(Clone, Debug)]
pub struct Config {
    /// The base search strategy.
    pub search: SearchKind,

    /// The strategy for the recovery lane.
    pub recovery_search: RecoverySearchKind,

    /// Whether recovery states get their own scheduling lane.
    pub split_search: bool,

    /// Whether the splitted scheduler adds the high-priority lane for
    /// freshly spawned recovery states.
    pub optimized_split: bool,

    /// The ratio (out of 100) with which the recovery lane is visited.
    pub split_ratio: u32,

    /// The maximum number of forks across the whole run.
    pub max_forks: u64,

    /// The maximum exploration depth; zero disables the limit.
    pub max_depth: usize,

    /// The memory cap in megabytes.
    pub max_memory_mb: usize,

    /// Whether forking is inhibited while over the memory cap.
    pub max_memory_inhibit: bool,

    /// How many instructions are executed between memory usage
    /// estimations.
    pub memory_check_interval: u64,

    /// Halt after this many instructions; zero disables the limit.
    pub stop_after_n_instructions: u64,

    /// The seed-replay time budget in seconds, recorded for interface
    /// fidelity.
    pub seed_time_secs: u64,

    /// Whether external calls may receive symbolic arguments (they are
    /// concretised when allowed, refused when not).
    pub allow_external_sym_calls: bool,

    /// Emit every error instead of deduplicating per instruction and
    /// message.
    pub emit_all_errors: bool,

    /// Only emit test cases for paths that covered new lines.
    pub only_output_states_covering_new: bool,

    /// Whether recovery states call through sliced specialisations.
    pub use_slicer: bool,

    /// Whether slices are generated on first use rather than up front.
    pub lazy_slicing: bool,

    /// Additional functions to skip, merged into the analysis tables.
    pub skip_functions: Vec<String>,

    /// The master's phase-one bound: explore until this many states are
    /// live, then freeze and dispatch. Workers instead prune non-recovery
    /// states beyond this depth. Zero disables bounded exploration.
    pub exploration_depth: usize,

    /// The error-location table: file basename to the lines that must each
    /// be hit before the run halts automatically.
    pub error_locations: FxHashMap<String, Vec<u32>>,

    /// Halt after this many exit-on errors when no error-location table is
    /// configured; zero halts on the first.
    pub max_error_count: u32,

    /// The error kinds that make the run exit non-zero (and count towards
    /// the halting policies).
    pub exit_on_error_types: Vec<TerminateReason>,

    /// The wall-clock timeout of a single solver query, in milliseconds.
    pub solver_timeout_ms: u64,

    /// Whether workers participate in offload-based load balancing.
    pub enable_load_balancing: bool,

    /// Whether remaining states are dumped as `.early` test cases when the
    /// run halts.
    pub dump_states_on_halt: bool,

    /// Whether every executed instruction is appended to the instruction
    /// log. Expensive; off by default.
    pub log_instructions: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            search: SearchKind::default(),
            recovery_search: RecoverySearchKind::default(),
            split_search: true,
            optimized_split: true,
            split_ratio: DEFAULT_SPLIT_RATIO,
            max_forks: DEFAULT_MAX_FORKS,
            max_depth: DEFAULT_MAX_DEPTH,
            max_memory_mb: DEFAULT_MAX_MEMORY_MB,
            max_memory_inhibit: true,
            memory_check_interval: MEMORY_CHECK_INTERVAL,
            stop_after_n_instructions: 0,
            seed_time_secs: 0,
            allow_external_sym_calls: false,
            emit_all_errors: false,
            only_output_states_covering_new: false,
            use_slicer: true,
            lazy_slicing: false,
            skip_functions: vec![],
            exploration_depth: 0,
            error_locations: FxHashMap::default(),
            max_error_count: 0,
            exit_on_error_types: vec![
                TerminateReason::Abort,
                TerminateReason::Assert,
                TerminateReason::Ptr,
                TerminateReason::Overflow,
                TerminateReason::Free,
                TerminateReason::ReadOnly,
                TerminateReason::ReportError,
            ],
            solver_timeout_ms: DEFAULT_SOLVER_TIMEOUT_MS,
            enable_load_balancing: true,
            dump_states_on_halt: true,
            log_instructions: false,
        }
    }
}

impl Config {
    /// Checks whether `reason` is configured to make the run exit
    /// non-zero.
    #[must_use]
    pub fn should_exit_on(&self, reason: TerminateReason) -> bool {
        self.exit_on_error_types.contains(&reason)
    }
}
