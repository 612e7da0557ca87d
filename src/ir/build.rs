//! This module contains a small builder for constructing programs by hand.
//!
//! The real loader is an external collaborator; the builder exists so that
//! unit and integration tests can assemble well-formed programs without
//! one.

use std::sync::Arc;

use crate::{
    expr::{BinOp, CastKind, Predicate, Width},
    ir::module::{
        BasicBlock,
        BlockId,
        Callee,
        DebugInfo,
        FuncId,
        Function,
        Global,
        GlobalId,
        Instruction,
        Op,
        Operand,
        Program,
        Reg,
    },
};

/// Shorthand for a 32-bit constant operand.
#[must_use]
pub fn c32(value: u64) -> Operand {
    Operand::constant(value, Width::B32)
}

/// Shorthand for a 64-bit (pointer-width) constant operand.
#[must_use]
pub fn c64(value: u64) -> Operand {
    Operand::constant(value, Width::B64)
}

impl From<Reg> for Operand {
    fn from(value: Reg) -> Self {
        Operand::Reg(value)
    }
}

/// A builder for a whole [`Program`].
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    program:       Program,
    function_slot: u64,
}

impl ProgramBuilder {
    /// Constructs a builder for an empty program.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts building a function named `name`.
    ///
    /// Each function receives a disjoint range of instruction identifiers,
    /// so identifiers are unique across the whole program.
    pub fn function(&mut self, name: impl Into<String>) -> FunctionBuilder {
        let slot = self.function_slot;
        self.function_slot += 1;
        FunctionBuilder::new(name, slot << 16)
    }

    /// Adds a finished function to the program.
    pub fn add(&mut self, function: FunctionBuilder) -> FuncId {
        self.program.add_function(function.finish())
    }

    /// Adds a global variable to the program.
    pub fn global(
        &mut self,
        name: impl Into<String>,
        size: u64,
        initializer: Vec<u8>,
        is_read_only: bool,
    ) -> GlobalId {
        self.program.add_global(Global {
            name: name.into(),
            size,
            initializer,
            is_read_only,
        })
    }

    /// Finishes building, yielding the program.
    #[must_use]
    pub fn finish(self) -> Program {
        self.program
    }
}

/// A builder for a single [`Function`].
#[derive(Debug)]
pub struct FunctionBuilder {
    name:        String,
    params:      Vec<(Reg, Width)>,
    next_reg:    u32,
    blocks:      Vec<BasicBlock>,
    current:     BlockId,
    file:        Arc<str>,
    line:        u32,
    next_id:     u64,
    is_variadic: bool,
}

impl FunctionBuilder {
    fn new(name: impl Into<String>, first_id: u64) -> Self {
        Self {
            name:        name.into(),
            params:      vec![],
            next_reg:    0,
            blocks:      vec![BasicBlock::default()],
            current:     BlockId(0),
            file:        Arc::from("<unknown>"),
            line:        0,
            next_id:     first_id,
            is_variadic: false,
        }
    }

    /// Declares a parameter of the given `width`, returning the register
    /// that receives the argument.
    pub fn param(&mut self, width: Width) -> Reg {
        let reg = self.fresh_reg();
        self.params.push((reg, width));
        reg
    }

    /// Marks the function as accepting additional untyped arguments.
    pub fn variadic(&mut self) -> &mut Self {
        self.is_variadic = true;
        self
    }

    /// Creates a new empty basic block, returning its handle.
    pub fn block(&mut self) -> BlockId {
        let id = BlockId(u32::try_from(self.blocks.len()).expect("block count exceeds u32"));
        self.blocks.push(BasicBlock::default());
        id
    }

    /// Makes `block` the target of subsequent instruction pushes.
    pub fn switch_to(&mut self, block: BlockId) {
        self.current = block;
    }

    /// Sets the source position attached to subsequently pushed
    /// instructions.
    pub fn at(&mut self, file: impl Into<Arc<str>>, line: u32) {
        self.file = file.into();
        self.line = line;
    }

    /// Gets the identifier assigned to the most recently pushed
    /// instruction.
    #[must_use]
    pub fn last_id(&self) -> u64 {
        self.next_id - 1
    }

    fn fresh_reg(&mut self) -> Reg {
        let reg = Reg(self.next_reg);
        self.next_reg += 1;
        reg
    }

    fn push(&mut self, op: Op) {
        let debug = DebugInfo {
            file:           self.file.clone(),
            line:           self.line,
            assembly_line:  u32::try_from(self.next_id & 0xffff).expect("masked to 16 bits"),
            instruction_id: self.next_id,
        };
        self.next_id += 1;
        self.blocks[self.current.0 as usize]
            .instructions
            .push(Instruction { op, debug });
    }

    /// Pushes a binary operation, returning the destination register.
    pub fn binary(&mut self, op: BinOp, left: impl Into<Operand>, right: impl Into<Operand>) -> Reg {
        let dst = self.fresh_reg();
        self.push(Op::Binary {
            op,
            left: left.into(),
            right: right.into(),
            dst,
        });
        dst
    }

    /// Pushes a comparison, returning the boolean destination register.
    pub fn cmp(
        &mut self,
        pred: Predicate,
        left: impl Into<Operand>,
        right: impl Into<Operand>,
    ) -> Reg {
        let dst = self.fresh_reg();
        self.push(Op::Cmp {
            pred,
            left: left.into(),
            right: right.into(),
            dst,
        });
        dst
    }

    /// Pushes a width conversion, returning the destination register.
    pub fn cast(&mut self, kind: CastKind, value: impl Into<Operand>, to: Width) -> Reg {
        let dst = self.fresh_reg();
        self.push(Op::Cast {
            kind,
            value: value.into(),
            to,
            dst,
        });
        dst
    }

    /// Pushes a conditional choice, returning the destination register.
    pub fn select(
        &mut self,
        cond: impl Into<Operand>,
        then_v: impl Into<Operand>,
        else_v: impl Into<Operand>,
    ) -> Reg {
        let dst = self.fresh_reg();
        self.push(Op::Select {
            cond:   cond.into(),
            then_v: then_v.into(),
            else_v: else_v.into(),
            dst,
        });
        dst
    }

    /// Pushes a phi node, returning the destination register.
    pub fn phi(&mut self, incoming: Vec<(BlockId, Operand)>) -> Reg {
        let dst = self.fresh_reg();
        self.push(Op::Phi { incoming, dst });
        dst
    }

    /// Pushes a load of `width` bits, returning the destination register.
    pub fn load(&mut self, address: impl Into<Operand>, width: Width) -> Reg {
        let dst = self.fresh_reg();
        self.push(Op::Load {
            address: address.into(),
            width,
            dst,
        });
        dst
    }

    /// Pushes a store.
    pub fn store(&mut self, address: impl Into<Operand>, value: impl Into<Operand>) {
        self.push(Op::Store {
            address: address.into(),
            value:   value.into(),
        });
    }

    /// Pushes a stack allocation of `size` bytes, returning the register
    /// holding its address.
    pub fn alloca(&mut self, size: u64) -> Reg {
        let dst = self.fresh_reg();
        self.push(Op::Alloca { size, dst });
        dst
    }

    /// Pushes address arithmetic, returning the destination register.
    pub fn gep(&mut self, base: impl Into<Operand>, offset: impl Into<Operand>) -> Reg {
        let dst = self.fresh_reg();
        self.push(Op::Gep {
            base:   base.into(),
            offset: offset.into(),
            dst,
        });
        dst
    }

    /// Pushes a direct call that produces a value, returning the
    /// destination register.
    pub fn call(&mut self, name: impl Into<String>, args: Vec<Operand>) -> Reg {
        let dst = self.fresh_reg();
        self.push(Op::Call {
            callee: Callee::Direct(name.into()),
            args,
            dst: Some(dst),
        });
        dst
    }

    /// Pushes a direct call that produces no value.
    pub fn call_void(&mut self, name: impl Into<String>, args: Vec<Operand>) {
        self.push(Op::Call {
            callee: Callee::Direct(name.into()),
            args,
            dst: None,
        });
    }

    /// Pushes an indirect call through `target`, returning the destination
    /// register.
    pub fn call_indirect(&mut self, target: impl Into<Operand>, args: Vec<Operand>) -> Reg {
        let dst = self.fresh_reg();
        self.push(Op::Call {
            callee: Callee::Indirect(target.into()),
            args,
            dst: Some(dst),
        });
        dst
    }

    /// Pushes the introduction of a named symbolic input, returning the
    /// destination register.
    pub fn sym_input(&mut self, name: impl Into<String>, width: Width) -> Reg {
        let dst = self.fresh_reg();
        self.push(Op::SymInput {
            name: name.into(),
            width,
            dst,
        });
        dst
    }

    /// Pushes an unconditional branch.
    pub fn br(&mut self, target: BlockId) {
        self.push(Op::Br { target });
    }

    /// Pushes a two-way conditional branch.
    pub fn cond_br(&mut self, cond: impl Into<Operand>, then_target: BlockId, else_target: BlockId) {
        self.push(Op::CondBr {
            cond: cond.into(),
            then_target,
            else_target,
        });
    }

    /// Pushes a multi-way branch.
    pub fn switch(
        &mut self,
        discriminant: impl Into<Operand>,
        cases: Vec<(u64, BlockId)>,
        default: BlockId,
    ) {
        self.push(Op::Switch {
            discriminant: discriminant.into(),
            cases,
            default,
        });
    }

    /// Pushes a return.
    pub fn ret(&mut self, value: Option<Operand>) {
        self.push(Op::Ret { value });
    }

    /// Pushes an unreachable marker.
    pub fn unreachable(&mut self) {
        self.push(Op::Unreachable);
    }

    fn finish(self) -> Function {
        Function {
            name:          self.name,
            params:        self.params,
            num_registers: self.next_reg,
            is_variadic:   self.is_variadic,
            blocks:        self.blocks,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn builds_a_two_block_function() {
        let mut pb = ProgramBuilder::new();
        let mut f = pb.function("main");
        f.at("main.c", 1);
        let x = f.sym_input("x", Width::B32);
        let cond = f.cmp(Predicate::Sgt, x, c32(0));
        let then_b = f.block();
        let else_b = f.block();
        f.cond_br(cond, then_b, else_b);
        f.switch_to(then_b);
        f.ret(Some(c32(1)));
        f.switch_to(else_b);
        f.ret(Some(c32(0)));
        let id = pb.add(f);
        let program = pb.finish();

        let function = program.function(id);
        assert_eq!(function.blocks.len(), 3);
        assert_eq!(function.num_registers, 2);
        assert!(function.blocks[0].instructions[2].op.is_terminator());
    }

    #[test]
    fn instruction_ids_are_unique_across_functions() {
        let mut pb = ProgramBuilder::new();
        let mut f = pb.function("a");
        f.ret(None);
        let a = pb.add(f);
        let mut g = pb.function("b");
        g.ret(None);
        let b = pb.add(g);
        let program = pb.finish();

        let id_a = program.function(a).blocks[0].instructions[0].debug.instruction_id;
        let id_b = program.function(b).blocks[0].instructions[0].debug.instruction_id;
        assert_ne!(id_a, id_b);
    }
}
