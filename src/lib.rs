//! This library implements a distributed symbolic execution engine for
//! programs in a typed, SSA-style intermediate representation. Given an
//! entry function and a set of symbolic inputs, it enumerates feasible
//! control-flow paths, collects their path constraints, solves them, and
//! emits one concrete test input per terminated path.
//!
//! # How it Works
//!
//! From a very high level, a run proceeds as follows:
//!
//! 1. A program is ingested as an [`ir::Program`] together with the
//!    [`ir::Analysis`] annotations produced ahead of time (which calls to
//!    skip, which loads may block on skipped side effects, the mod/ref
//!    tables that drive slice selection).
//! 2. The [`engine::Engine`] executes the program symbolically, forking
//!    an [`state::ExecutionState`] at every feasible symbolic branch and
//!    tracking all of them in a process tree. A pluggable
//!    [`search::Scheduler`] picks the next state to step.
//! 3. Calls to expensive side-effecting callees are skipped behind a
//!    [`state::Snapshot`]. When a later load may depend on the skipped
//!    side effect, a *recovery state* re-executes the relevant slice of
//!    the callee from the snapshot and merges its writes back into the
//!    suspended state.
//! 4. In a cluster, the rank-zero master explores a bounded frontier,
//!    then dispatches branch-history *prefix ranges* to workers over the
//!    [`cluster`] fabric, rebalancing in-flight work on demand.
//! 5. Every terminated path is solved through the [`solver`] facade and
//!    written out by the [`output`] handler as a test case.
//!
//! # Basic Usage
//!
//! For the most basic usage of the library, build a program, construct an
//! engine, and run it:
//!
//! ```
//! use std::rc::Rc;
//!
//! use symex_cluster::{
//!     engine::Engine,
//!     expr::{Predicate, Width},
//!     ir::{build::{c32, ProgramBuilder}, Analysis},
//!     output::OutputHandler,
//!     watchdog::LazyWatchdog,
//!     Config,
//! };
//!
//! let mut pb = ProgramBuilder::new();
//! let mut main = pb.function("main");
//! let x = main.sym_input("x", Width::B32);
//! let cond = main.cmp(Predicate::Sgt, x, c32(0));
//! let positive = main.block();
//! let other = main.block();
//! main.cond_br(cond, positive, other);
//! main.switch_to(positive);
//! main.ret(Some(c32(1)));
//! main.switch_to(other);
//! main.ret(Some(c32(0)));
//! pb.add(main);
//!
//! let mut engine = Engine::new(
//!     Rc::new(pb.finish()),
//!     Rc::new(Analysis::new()),
//!     Config::default(),
//!     LazyWatchdog.in_rc(),
//!     OutputHandler::new(None).unwrap(),
//!     None,
//!     0,
//! );
//! let summary = engine.run_standalone("main").unwrap();
//! assert_eq!(summary.tests_written, 2);
//! ```

#![warn(clippy::all, clippy::cargo, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)] // Allows for better API naming

pub mod cluster;
pub mod config;
pub mod constant;
pub mod engine;
pub mod error;
pub mod expr;
pub mod ir;
pub mod memory;
pub mod output;
pub mod search;
pub mod solver;
pub mod state;
pub mod watchdog;

// Re-exports to provide the library interface.
pub use config::Config;
pub use engine::{Engine, RunSummary};
