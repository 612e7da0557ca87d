//! This module contains the definition of the program representation: typed
//! SSA functions made of basic blocks, a global table, and per-instruction
//! debug metadata.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::expr::{BinOp, CastKind, Predicate, Width};

/// The base of the synthetic address range assigned to functions, used for
/// resolving indirect calls.
pub const FUNCTION_ADDRESS_BASE: u64 = 0x0100_0000;

/// A handle to a function within a [`Program`].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize)]
pub struct FuncId(pub u32);

/// A handle to a basic block within a [`Function`].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize)]
pub struct BlockId(pub u32);

/// A virtual register within a function frame.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize)]
pub struct Reg(pub u32);

/// A handle to a global variable within a [`Program`].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize)]
pub struct GlobalId(pub u32);

/// An operand of an instruction.
#[derive(Clone, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum Operand {
    /// The value held in a virtual register of the current frame.
    Reg(Reg),

    /// An immediate constant.
    Const { value: u64, width: Width },

    /// The address of a global variable.
    Global(GlobalId),

    /// The synthetic address of a function, used for indirect calls.
    FuncAddr(FuncId),
}

impl Operand {
    /// Constructs an immediate constant operand.
    #[must_use]
    pub fn constant(value: u64, width: Width) -> Self {
        Self::Const { value, width }
    }
}

/// Debug metadata attached to every instruction.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct DebugInfo {
    /// The source file the instruction was compiled from.
    pub file: Arc<str>,

    /// The source line the instruction was compiled from.
    pub line: u32,

    /// The line of the instruction in the textual assembly dump.
    pub assembly_line: u32,

    /// A program-wide unique identifier for the instruction.
    pub instruction_id: u64,
}

impl DebugInfo {
    /// Gets the basename of the source file, used when matching against the
    /// error-location table.
    #[must_use]
    pub fn file_basename(&self) -> &str {
        self.file
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(self.file.as_ref())
    }
}

/// The callee of a call instruction.
#[derive(Clone, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum Callee {
    /// A direct call to a named function.
    Direct(String),

    /// An indirect call through a function-pointer value.
    Indirect(Operand),
}

/// The operation performed by an instruction.
///
/// Floating-point, vector, and inline-assembly constructs are deliberately
/// not represented; a loader that encounters them produces
/// [`Op::Unsupported`], which terminates the executing state loudly.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum Op {
    /// A binary arithmetic or bitwise operation.
    Binary {
        op:    BinOp,
        left:  Operand,
        right: Operand,
        dst:   Reg,
    },

    /// A comparison producing a boolean register.
    Cmp {
        pred:  Predicate,
        left:  Operand,
        right: Operand,
        dst:   Reg,
    },

    /// A width conversion.
    Cast {
        kind:  CastKind,
        value: Operand,
        to:    Width,
        dst:   Reg,
    },

    /// A conditional choice between two values.
    Select {
        cond:   Operand,
        then_v: Operand,
        else_v: Operand,
        dst:    Reg,
    },

    /// An SSA phi node selecting a value by predecessor block.
    Phi {
        incoming: Vec<(BlockId, Operand)>,
        dst:      Reg,
    },

    /// A load of `width` bits from memory.
    Load {
        address: Operand,
        width:   Width,
        dst:     Reg,
    },

    /// A store of a value to memory.
    Store { address: Operand, value: Operand },

    /// A stack allocation of a fixed size, yielding its address.
    Alloca { size: u64, dst: Reg },

    /// Address arithmetic: `base + offset` over pointer-width values.
    Gep {
        base:   Operand,
        offset: Operand,
        dst:    Reg,
    },

    /// An unconditional branch.
    Br { target: BlockId },

    /// A two-way conditional branch.
    CondBr {
        cond:        Operand,
        then_target: BlockId,
        else_target: BlockId,
    },

    /// A multi-way branch on an integer discriminant.
    Switch {
        discriminant: Operand,
        cases:        Vec<(u64, BlockId)>,
        default:      BlockId,
    },

    /// A call, direct or through a function pointer.
    Call {
        callee: Callee,
        args:   Vec<Operand>,
        dst:    Option<Reg>,
    },

    /// A return from the current function.
    Ret { value: Option<Operand> },

    /// Introduction of a named symbolic input of the given width.
    SymInput {
        name:  String,
        width: Width,
        dst:   Reg,
    },

    /// A point that must never be reached.
    Unreachable,

    /// A construct the engine does not model; executing it fails loudly.
    Unsupported { what: String },
}

impl Op {
    /// Checks whether the operation transfers control rather than producing
    /// a value.
    #[must_use]
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Op::Br { .. }
                | Op::CondBr { .. }
                | Op::Switch { .. }
                | Op::Ret { .. }
                | Op::Unreachable
        )
    }
}

/// An instruction together with its debug metadata.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Instruction {
    /// The operation performed.
    pub op: Op,

    /// The attached debug metadata.
    pub debug: DebugInfo,
}

/// A straight-line sequence of instructions ending in a terminator.
#[derive(Clone, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct BasicBlock {
    /// The instructions of the block, in execution order.
    pub instructions: Vec<Instruction>,
}

/// A function of the program.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Function {
    /// The name of the function.
    pub name: String,

    /// The registers receiving the arguments, with their widths.
    pub params: Vec<(Reg, Width)>,

    /// The total number of virtual registers used by the function body.
    pub num_registers: u32,

    /// Whether the function accepts additional, untyped arguments.
    pub is_variadic: bool,

    /// The basic blocks; block zero is the entry.
    pub blocks: Vec<BasicBlock>,
}

/// A global variable of the program.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Global {
    /// The name of the global.
    pub name: String,

    /// The size of the global in bytes.
    pub size: u64,

    /// The initial bytes, padded with zeroes when shorter than `size`.
    pub initializer: Vec<u8>,

    /// Whether writes to the global are a program error.
    pub is_read_only: bool,
}

/// A complete program: functions, globals, and the name tables needed to
/// resolve calls.
#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize)]
pub struct Program {
    functions: Vec<Function>,
    globals:   Vec<Global>,
    by_name:   FxHashMap<String, FuncId>,
}

impl Program {
    /// Constructs an empty program.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `function` to the program, returning its handle.
    ///
    /// A later function with the same name shadows an earlier one in name
    /// lookup, mirroring how a loader would handle slice specialisations
    /// registered after the fact.
    pub fn add_function(&mut self, function: Function) -> FuncId {
        let id = FuncId(u32::try_from(self.functions.len()).expect("function count exceeds u32"));
        self.by_name.insert(function.name.clone(), id);
        self.functions.push(function);
        id
    }

    /// Adds `global` to the program, returning its handle.
    pub fn add_global(&mut self, global: Global) -> GlobalId {
        let id = GlobalId(u32::try_from(self.globals.len()).expect("global count exceeds u32"));
        self.globals.push(global);
        id
    }

    /// Gets the function behind `id`.
    ///
    /// # Panics
    ///
    /// Panics if the handle was not produced by this program. Handles are
    /// never constructed by callers, so this is a programmer bug.
    #[must_use]
    pub fn function(&self, id: FuncId) -> &Function {
        &self.functions[id.0 as usize]
    }

    /// Looks a function up by name.
    #[must_use]
    pub fn function_named(&self, name: &str) -> Option<FuncId> {
        self.by_name.get(name).copied()
    }

    /// Gets all functions with their handles.
    pub fn functions(&self) -> impl Iterator<Item = (FuncId, &Function)> {
        self.functions
            .iter()
            .enumerate()
            .map(|(i, f)| (FuncId(i as u32), f))
    }

    /// Gets the global behind `id`.
    #[must_use]
    pub fn global(&self, id: GlobalId) -> &Global {
        &self.globals[id.0 as usize]
    }

    /// Gets all globals with their handles.
    pub fn globals(&self) -> impl Iterator<Item = (GlobalId, &Global)> {
        self.globals
            .iter()
            .enumerate()
            .map(|(i, g)| (GlobalId(i as u32), g))
    }

    /// Gets the synthetic address assigned to `id` for use as a
    /// function-pointer value.
    #[must_use]
    pub fn function_address(&self, id: FuncId) -> u64 {
        FUNCTION_ADDRESS_BASE + u64::from(id.0)
    }

    /// Resolves a synthetic function address back to its function.
    #[must_use]
    pub fn function_at_address(&self, address: u64) -> Option<FuncId> {
        let index = address.checked_sub(FUNCTION_ADDRESS_BASE)?;
        (index < self.functions.len() as u64).then(|| FuncId(index as u32))
    }
}

/// A position in the instruction stream: the program counter type.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct InstRef {
    /// The function being executed.
    pub func: FuncId,

    /// The block within that function.
    pub block: BlockId,

    /// The instruction index within that block.
    pub index: u32,
}

impl InstRef {
    /// Constructs a reference to the first instruction of `func`.
    #[must_use]
    pub fn entry(func: FuncId) -> Self {
        Self {
            func,
            block: BlockId(0),
            index: 0,
        }
    }

    /// Gets the instruction this reference points at.
    ///
    /// # Panics
    ///
    /// Panics if the reference is out of bounds for `program`, which means
    /// the engine advanced past a terminator: a programmer bug.
    #[must_use]
    pub fn instruction<'p>(&self, program: &'p Program) -> &'p Instruction {
        &program.function(self.func).blocks[self.block.0 as usize].instructions
            [self.index as usize]
    }

    /// Gets the reference to the instruction after this one in the same
    /// block.
    #[must_use]
    pub fn next(self) -> Self {
        Self {
            index: self.index + 1,
            ..self
        }
    }

    /// Gets the reference to the first instruction of `block` in the same
    /// function.
    #[must_use]
    pub fn at_block(self, block: BlockId) -> Self {
        Self {
            func: self.func,
            block,
            index: 0,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn resolves_function_addresses_round_trip() {
        let mut program = Program::new();
        let id = program.add_function(Function {
            name:          "f".into(),
            params:        vec![],
            num_registers: 0,
            is_variadic:   false,
            blocks:        vec![],
        });
        let address = program.function_address(id);
        assert_eq!(program.function_at_address(address), Some(id));
        assert_eq!(program.function_at_address(address + 1), None);
    }

    #[test]
    fn later_function_shadows_earlier_name() {
        let mut program = Program::new();
        let make = |name: &str| Function {
            name:          name.into(),
            params:        vec![],
            num_registers: 0,
            is_variadic:   false,
            blocks:        vec![],
        };
        program.add_function(make("f"));
        let second = program.add_function(make("f"));
        assert_eq!(program.function_named("f"), Some(second));
    }
}
