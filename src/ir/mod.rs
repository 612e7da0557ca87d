//! This module contains the representation of the typed, SSA-form program
//! that the engine executes, together with the pre-analysis annotations the
//! engine consumes.
//!
//! The loader that produces these structures from an on-disk module is an
//! external collaborator; this module only defines the shape the engine
//! needs, plus a small builder used to construct programs by hand in tests.

pub mod analysis;
pub mod build;
pub mod module;

pub use analysis::{AllocSite, Analysis, ModInfo, SkippedFunction};
pub use module::{
    BasicBlock,
    BlockId,
    Callee,
    DebugInfo,
    FuncId,
    Function,
    Global,
    GlobalId,
    InstRef,
    Instruction,
    Op,
    Operand,
    Program,
    Reg,
};
