//! This module contains constants that are needed throughout the codebase.

/// The default maximum number of forks performed across a whole run before
/// forking is inhibited and branch directions are committed at random.
pub const DEFAULT_MAX_FORKS: u64 = u64::MAX;

/// The default maximum exploration depth, in observable branch events.
///
/// A value of zero disables the depth limit.
pub const DEFAULT_MAX_DEPTH: usize = 0;

/// The default memory cap for a single worker, in megabytes.
///
/// When estimated usage exceeds this value by [`MEMORY_KILL_SLACK_MB`], the
/// engine starts killing states to get back under the cap.
pub const DEFAULT_MAX_MEMORY_MB: usize = 2000;

/// The slack above the memory cap, in megabytes, before states are killed.
pub const MEMORY_KILL_SLACK_MB: usize = 100;

/// How many instructions are executed between memory usage estimations.
pub const MEMORY_CHECK_INTERVAL: u64 = 0x10000;

/// The default ratio (out of 100) with which the splitted scheduler visits
/// the recovery lane when both lanes are populated.
pub const DEFAULT_SPLIT_RATIO: u32 = 75;

/// A worker signals that it is willing to surrender work once its frontier
/// grows to this many states.
pub const OFFLOAD_READY_THRESHOLD: usize = 8;

/// A worker withdraws its willingness to surrender work once its frontier
/// shrinks below this many states.
///
/// Kept strictly below [`OFFLOAD_READY_THRESHOLD`] so that the two signals
/// form a hysteresis band rather than oscillating.
pub const OFFLOAD_NOT_READY_THRESHOLD: usize = 4;

/// The smallest frontier from which a worker will surrender states at all.
pub const OFFLOAD_MINIMUM_FRONTIER: usize = 4;

/// The maximum number of states packaged into a single offload response.
pub const OFFLOAD_PACKAGE_CAP: usize = 16;

/// The fraction (as a divisor) of the frontier surrendered per offload.
pub const OFFLOAD_FRACTION_DIVISOR: usize = 4;

/// The default wall-clock timeout for a single solver query, in milliseconds.
pub const DEFAULT_SOLVER_TIMEOUT_MS: u64 = 10_000;

/// The default budget, in total bits of free symbolic input, below which the
/// built-in decision procedure will exhaustively enumerate assignments.
pub const DEFAULT_ENUMERATION_BIT_BUDGET: u32 = 16;

/// The base of the address range handed out for globals.
pub const GLOBAL_ADDRESS_BASE: u64 = 0x1000_0000;

/// The base of the address range handed out for stack allocations.
pub const STACK_ADDRESS_BASE: u64 = 0x4000_0000;

/// The base of the address range handed out for heap allocations.
pub const HEAP_ADDRESS_BASE: u64 = 0x8000_0000;

/// The alignment applied to every allocation.
pub const ALLOCATION_ALIGNMENT: u64 = 16;

/// Allocations at or above this size are refused and bound to null instead.
pub const HUGE_ALLOC_SIZE: u64 = 1 << 31;

/// The default number of run-loop iterations between watchdog polls.
pub const DEFAULT_WATCHDOG_POLL_LOOP_ITERATIONS: usize = 4096;

/// The number of instructions a state may execute without covering a new
/// line before the `CoveringNew` weight stops favouring it.
pub const COV_NEW_INSTRUCTION_HORIZON: u64 = 10_000;
