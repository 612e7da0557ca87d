//! This module contains instruction stepping and dispatch: control
//! operations are handled explicitly, data operations build symbolic
//! expressions and bind them into the destination register, and memory
//! operations route through the address space with the recovery hooks of
//! [`super::recovery`] applied around them.

use tracing::{debug, warn};

use crate::{
    engine::{locate_internal, Engine},
    error::{
        execution::{Error as ExecError, TerminateReason},
        solver,
        Result,
    },
    expr::{BinOp, Expr, ExprRef, Predicate, Width},
    ir::{AllocSite, BlockId, Callee, InstRef, Op, Operand, Reg},
    memory::{allocation::StorageClass, AllocationContext},
    state::{ExecutionState, StackFrame, StateId},
};

impl Engine {
    /// Advances the state `id` by one instruction.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] only on fatal failures; per-state failures
    /// terminate the state and return [`Ok`].
    pub(crate) fn step_state(&mut self, id: StateId) -> Result<()> {
        if self.reached_recovery_exit(id)? {
            return self.on_recovery_state_exit(id);
        }

        self.log_step(id)?;

        let ki = {
            let state = self.graph.state_mut(id).map_err(locate_internal)?;
            let ki = state.pc;
            state.prev_pc = ki;
            state.pc = ki.next();
            state.inst_count += 1;
            state.frame_mut().inst_count += 1;
            ki
        };
        self.stats.instructions += 1;
        self.note_coverage(id);

        let op = ki.instruction(&self.program).op.clone();
        self.execute_op(id, ki, op)
    }

    /// Terminates `id` with an error located at `ki`.
    fn fail(
        &mut self,
        id: StateId,
        reason: TerminateReason,
        message: &str,
    ) -> Result<()> {
        self.terminate_on_error(id, reason, message, None)
    }

    /// Evaluates `operand` in the context of `state`.
    pub(crate) fn eval_operand(
        &self,
        state: &ExecutionState,
        operand: &Operand,
    ) -> std::result::Result<ExprRef, ExecError> {
        match operand {
            Operand::Reg(reg) => state
                .frame()
                .locals
                .get(reg.0 as usize)
                .and_then(Clone::clone)
                .ok_or(ExecError::UnboundRegister { register: reg.0 }),
            Operand::Const { value, width } => Ok(Expr::constant(*value, *width)),
            Operand::Global(gid) => {
                let object = self
                    .global_objects
                    .get(gid)
                    .expect("globals are bound before execution starts");
                Ok(Expr::constant(object.address, Width::B64))
            }
            Operand::FuncAddr(fid) => {
                Ok(Expr::constant(self.program.function_address(*fid), Width::B64))
            }
        }
    }

    /// Writes `value` into the destination register `dst` of `id`.
    pub(crate) fn bind_local(&mut self, id: StateId, dst: Reg, value: ExprRef) -> Result<()> {
        let state = self.graph.state_mut(id).map_err(locate_internal)?;
        state.frame_mut().locals[dst.0 as usize] = Some(value);
        Ok(())
    }

    /// Redirects control of `id` to the start of `target`, recording the
    /// block it arrived from for phi resolution.
    pub(crate) fn transfer_to_block(&mut self, id: StateId, from: InstRef, target: BlockId) -> Result<()> {
        let state = self.graph.state_mut(id).map_err(locate_internal)?;
        state.incoming_block = Some(from.block);
        state.pc = from.at_block(target);
        Ok(())
    }

    fn execute_op(&mut self, id: StateId, ki: InstRef, op: Op) -> Result<()> {
        match op {
            Op::Binary {
                op,
                left,
                right,
                dst,
            } => self.execute_binary(id, op, &left, &right, dst),
            Op::Cmp {
                pred,
                left,
                right,
                dst,
            } => {
                let state = self.graph.state(id).map_err(locate_internal)?;
                let (l, r) = match (self.eval_operand(state, &left), self.eval_operand(state, &right))
                {
                    (Ok(l), Ok(r)) => (l, r),
                    (Err(e), _) | (_, Err(e)) => return self.fail(id, TerminateReason::Exec, &e.to_string()),
                };
                if l.width() != r.width() {
                    return self.fail(
                        id,
                        TerminateReason::Exec,
                        &ExecError::WidthMismatch {
                            expected: l.width().bits(),
                            found:    r.width().bits(),
                        }
                        .to_string(),
                    );
                }
                self.bind_local(id, dst, Expr::cmp(pred, l, r))
            }
            Op::Cast {
                kind,
                value,
                to,
                dst,
            } => {
                let state = self.graph.state(id).map_err(locate_internal)?;
                match self.eval_operand(state, &value) {
                    Ok(v) => self.bind_local(id, dst, Expr::cast(kind, v, to)),
                    Err(e) => self.fail(id, TerminateReason::Exec, &e.to_string()),
                }
            }
            Op::Select {
                cond,
                then_v,
                else_v,
                dst,
            } => {
                let state = self.graph.state(id).map_err(locate_internal)?;
                let evaluated = (
                    self.eval_operand(state, &cond),
                    self.eval_operand(state, &then_v),
                    self.eval_operand(state, &else_v),
                );
                match evaluated {
                    (Ok(c), Ok(t), Ok(e)) => self.bind_local(id, dst, Expr::ite(c, t, e)),
                    (Err(e), ..) | (_, Err(e), _) | (.., Err(e)) => {
                        self.fail(id, TerminateReason::Exec, &e.to_string())
                    }
                }
            }
            Op::Phi { incoming, dst } => {
                let state = self.graph.state(id).map_err(locate_internal)?;
                let Some(from) = state.incoming_block else {
                    return self.fail(
                        id,
                        TerminateReason::Exec,
                        &ExecError::PhiWithoutIncomingBlock.to_string(),
                    );
                };
                let Some((_, operand)) = incoming.iter().find(|(block, _)| *block == from)
                else {
                    return self.fail(
                        id,
                        TerminateReason::Exec,
                        "phi node has no entry for the incoming block",
                    );
                };
                match self.eval_operand(state, operand) {
                    Ok(v) => self.bind_local(id, dst, v),
                    Err(e) => self.fail(id, TerminateReason::Exec, &e.to_string()),
                }
            }
            Op::Load {
                address,
                width,
                dst,
            } => self.execute_load(id, ki, &address, width, dst),
            Op::Store { address, value } => self.execute_store(id, ki, &address, &value),
            Op::Alloca { size, dst } => {
                let instruction_id = ki.instruction(&self.program).debug.instruction_id;
                let object = self.allocator.allocate(
                    size,
                    StorageClass::Stack,
                    false,
                    AllocSite::Instruction(instruction_id),
                );
                let address = object.address;
                let state = self.graph.state_mut(id).map_err(locate_internal)?;
                state
                    .address_space
                    .bind(object.clone(), crate::memory::ObjectState::zeroed(size));
                state.frame_mut().allocas.push(object.id);
                self.bind_local(id, dst, Expr::constant(address, Width::B64))
            }
            Op::Gep { base, offset, dst } => {
                let state = self.graph.state(id).map_err(locate_internal)?;
                let evaluated = (
                    self.eval_operand(state, &base),
                    self.eval_operand(state, &offset),
                );
                match evaluated {
                    (Ok(b), Ok(o)) => {
                        let widened =
                            Expr::cast(crate::expr::CastKind::ZExt, o, Width::B64);
                        self.bind_local(id, dst, Expr::binary(BinOp::Add, b, widened))
                    }
                    (Err(e), _) | (_, Err(e)) => {
                        self.fail(id, TerminateReason::Exec, &e.to_string())
                    }
                }
            }
            Op::Br { target } => self.transfer_to_block(id, ki, target),
            Op::CondBr {
                cond,
                then_target,
                else_target,
            } => {
                let state = self.graph.state(id).map_err(locate_internal)?;
                let cond = match self.eval_operand(state, &cond) {
                    Ok(c) => c,
                    Err(e) => return self.fail(id, TerminateReason::Exec, &e.to_string()),
                };
                let (true_side, false_side) = self.fork(id, &cond, false)?;
                if let Some(t) = true_side {
                    self.transfer_to_block(t, ki, then_target)?;
                }
                if let Some(f) = false_side {
                    self.transfer_to_block(f, ki, else_target)?;
                }
                Ok(())
            }
            Op::Switch {
                discriminant,
                cases,
                default,
            } => self.execute_switch(id, ki, &discriminant, &cases, default),
            Op::Call { callee, args, dst } => self.execute_call(id, ki, &callee, &args, dst),
            Op::Ret { value } => self.handle_return(id, value.as_ref()),
            Op::SymInput { name, width, dst } => {
                let state = self.graph.state_mut(id).map_err(locate_internal)?;
                let unique = state.register_symbolic(&name, width);
                self.bind_local(id, dst, Expr::symbol(unique, width))
            }
            Op::Unreachable => self.fail(id, TerminateReason::Exec, "reached an unreachable point"),
            Op::Unsupported { what } => self.fail(
                id,
                TerminateReason::Unhandled,
                &ExecError::UnsupportedInstruction { what }.to_string(),
            ),
        }
    }

    fn execute_binary(
        &mut self,
        id: StateId,
        op: BinOp,
        left: &Operand,
        right: &Operand,
        dst: Reg,
    ) -> Result<()> {
        let state = self.graph.state(id).map_err(locate_internal)?;
        let (l, r) = match (self.eval_operand(state, left), self.eval_operand(state, right)) {
            (Ok(l), Ok(r)) => (l, r),
            (Err(e), _) | (_, Err(e)) => {
                return self.fail(id, TerminateReason::Exec, &e.to_string())
            }
        };
        if l.width() != r.width() {
            return self.fail(
                id,
                TerminateReason::Exec,
                &ExecError::WidthMismatch {
                    expected: l.width().bits(),
                    found:    r.width().bits(),
                }
                .to_string(),
            );
        }

        // Division and remainder guard their divisor: the zero side of the
        // fork is an error path.
        let survivor = if matches!(op, BinOp::UDiv | BinOp::SDiv | BinOp::URem | BinOp::SRem) {
            if r.as_const() == Some(0) {
                return self.fail(id, TerminateReason::Overflow, "divide by zero");
            }
            if r.as_const().is_none() {
                let zero = Expr::constant(0, r.width());
                let nonzero = Expr::cmp(Predicate::Ne, r.clone(), zero);
                let (ok, zero_side) = self.fork(id, &nonzero, true)?;
                if let Some(zero_side) = zero_side {
                    self.fail(zero_side, TerminateReason::Overflow, "divide by zero")?;
                }
                match ok {
                    Some(ok) => ok,
                    None => return Ok(()),
                }
            } else {
                id
            }
        } else {
            id
        };

        self.bind_local(survivor, dst, Expr::binary(op, l, r))
    }

    fn execute_switch(
        &mut self,
        id: StateId,
        ki: InstRef,
        discriminant: &Operand,
        cases: &[(u64, BlockId)],
        default: BlockId,
    ) -> Result<()> {
        let state = self.graph.state(id).map_err(locate_internal)?;
        let value = match self.eval_operand(state, discriminant) {
            Ok(v) => v,
            Err(e) => return self.fail(id, TerminateReason::Exec, &e.to_string()),
        };

        if let Some(concrete) = value.as_const() {
            let target = cases
                .iter()
                .find(|(case, _)| *case == concrete)
                .map_or(default, |(_, target)| *target);
            return self.transfer_to_block(id, ki, target);
        }

        // One guard per case, plus the conjunction of negations for the
        // default.
        let width = value.width();
        let mut conditions: Vec<(ExprRef, BlockId)> = cases
            .iter()
            .map(|(case, target)| {
                (
                    Expr::cmp(
                        Predicate::Eq,
                        value.clone(),
                        Expr::constant(*case, width),
                    ),
                    *target,
                )
            })
            .collect();
        let default_cond = cases.iter().fold(Expr::bool_true(), |acc, (case, _)| {
            let ne = Expr::cmp(
                Predicate::Ne,
                value.clone(),
                Expr::constant(*case, width),
            );
            if acc.is_true() {
                ne
            } else {
                Expr::binary(BinOp::And, acc, ne)
            }
        });
        conditions.push((default_cond, default));

        let branches = self.branch_multi(id, &conditions)?;
        for (branch, (_, target)) in branches.iter().zip(&conditions) {
            if let Some(branch) = branch {
                self.transfer_to_block(*branch, ki, *target)?;
            }
        }
        Ok(())
    }

    fn execute_call(
        &mut self,
        id: StateId,
        ki: InstRef,
        callee: &Callee,
        args: &[Operand],
        dst: Option<Reg>,
    ) -> Result<()> {
        let name = match callee {
            Callee::Direct(name) => name.clone(),
            Callee::Indirect(target) => {
                let state = self.graph.state(id).map_err(locate_internal)?;
                let target = match self.eval_operand(state, target) {
                    Ok(t) => t,
                    Err(e) => return self.fail(id, TerminateReason::Exec, &e.to_string()),
                };
                let Some(address) = self.concretize(id, &target)? else {
                    return Ok(());
                };
                match self.program.function_at_address(address) {
                    Some(fid) => self.program.function(fid).name.clone(),
                    None => {
                        return self.fail(
                            id,
                            TerminateReason::Ptr,
                            "indirect call through an invalid function pointer",
                        )
                    }
                }
            }
        };

        if self.execute_intrinsic(id, ki, &name, args, dst)? {
            return Ok(());
        }

        // Skipped side-effecting callees snapshot and return immediately
        // with an unconstrained result.
        let line = ki.instruction(&self.program).debug.line;
        let (is_normal, is_recovery) = {
            let state = self.graph.state(id).map_err(locate_internal)?;
            (state.kind.is_normal(), state.kind.is_recovery())
        };
        if is_normal && !is_recovery && self.analysis.is_skipped(&name, line) {
            if self.analysis.has_side_effects(&name) {
                self.take_snapshot(id, &name)?;
                debug!(state = id.0, callee = %name, "skipping side-effecting call");
            } else {
                debug!(state = id.0, callee = %name, "skipping side-effect-free call");
            }
            if let Some(dst) = dst {
                let fresh = self.fresh_unconstrained(id, &format!("skipped_{name}_ret"))?;
                self.bind_local(id, dst, fresh)?;
            }
            return Ok(());
        }

        // Recovery states call through the sliced specialisation of the
        // callee.
        let mut resolved = name.clone();
        if is_recovery && self.config.use_slicer {
            let slice_id = self
                .graph
                .state(id)
                .map_err(locate_internal)?
                .recovery_info
                .as_ref()
                .map(|ri| ri.slice_id);
            if let Some(slice_id) = slice_id {
                let slice = self.analysis.slice_function(&name, slice_id);
                if slice != name {
                    self.stats.generated_slices += 1;
                    debug!(callee = %name, slice = %slice, "injecting slice");
                    resolved = slice.to_owned();
                }
            }
        }

        let Some(func_id) = self.function_named(&resolved) else {
            return self.call_external(id, &name, args, dst);
        };
        if self.program.function(func_id).blocks.is_empty() {
            // A fully sliced callee contributes nothing.
            debug!(callee = %resolved, "ignoring fully sliced function");
            if let Some(dst) = dst {
                let fresh = self.fresh_unconstrained(id, &format!("{resolved}_ret"))?;
                self.bind_local(id, dst, fresh)?;
            }
            return Ok(());
        }

        self.push_call_frame(id, ki, func_id, args)
    }

    /// Handles the engine intrinsics; returns `true` when `name` was one.
    fn execute_intrinsic(
        &mut self,
        id: StateId,
        ki: InstRef,
        name: &str,
        args: &[Operand],
        dst: Option<Reg>,
    ) -> Result<bool> {
        match name {
            "abort" => {
                self.fail(id, TerminateReason::Abort, "abort failure")?;
                Ok(true)
            }
            "exit" => {
                self.terminate_on_exit(id)?;
                Ok(true)
            }
            "report_error" => {
                self.fail(id, TerminateReason::ReportError, "error reported by program")?;
                Ok(true)
            }
            "assert" => {
                let state = self.graph.state(id).map_err(locate_internal)?;
                let Some(arg) = args.first() else {
                    self.fail(id, TerminateReason::User, "assert requires a condition")?;
                    return Ok(true);
                };
                let value = match self.eval_operand(state, arg) {
                    Ok(v) => v,
                    Err(e) => {
                        self.fail(id, TerminateReason::Exec, &e.to_string())?;
                        return Ok(true);
                    }
                };
                let cond = if value.width() == Width::BOOL {
                    value
                } else {
                    let zero = Expr::constant(0, value.width());
                    Expr::cmp(Predicate::Ne, value, zero)
                };
                let (_, failing) = self.fork(id, &cond, true)?;
                if let Some(failing) = failing {
                    self.fail(failing, TerminateReason::Assert, "assertion failed")?;
                }
                Ok(true)
            }
            "malloc" | "calloc" | "realloc" => {
                let instruction_id = ki.instruction(&self.program).debug.instruction_id;
                let state = self.graph.state(id).map_err(locate_internal)?;
                let size_operand = match (name, args) {
                    ("malloc", [size]) | ("realloc", [_, size]) => size.clone(),
                    ("calloc", [count, size]) => {
                        let evaluated = (
                            self.eval_operand(state, count),
                            self.eval_operand(state, size),
                        );
                        match evaluated {
                            (Ok(c), Ok(s)) => {
                                let total = Expr::binary(BinOp::Mul, c, s);
                                let Some(total) = total.as_const() else {
                                    self.fail(
                                        id,
                                        TerminateReason::Model,
                                        "symbolic allocation size",
                                    )?;
                                    return Ok(true);
                                };
                                Operand::constant(total, Width::B64)
                            }
                            _ => {
                                self.fail(id, TerminateReason::User, "bad calloc arguments")?;
                                return Ok(true);
                            }
                        }
                    }
                    _ => {
                        self.fail(id, TerminateReason::User, "bad allocation arguments")?;
                        return Ok(true);
                    }
                };
                self.execute_alloc(id, instruction_id, &size_operand, dst)?;
                Ok(true)
            }
            "free" => {
                let Some(pointer) = args.first().cloned() else {
                    self.fail(id, TerminateReason::User, "free requires a pointer")?;
                    return Ok(true);
                };
                self.execute_free(id, &pointer)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Handles a dynamic allocation, routing recovery states through the
    /// guiding allocation record so re-execution reuses the original
    /// objects.
    fn execute_alloc(
        &mut self,
        id: StateId,
        instruction_id: u64,
        size_operand: &Operand,
        dst: Option<Reg>,
    ) -> Result<()> {
        let state = self.graph.state(id).map_err(locate_internal)?;
        let size = match self.eval_operand(state, size_operand) {
            Ok(s) => s,
            Err(e) => return self.fail(id, TerminateReason::Exec, &e.to_string()),
        };
        let Some(size) = size.as_const() else {
            return self.fail(id, TerminateReason::Model, "symbolic allocation size");
        };

        let context = AllocationContext {
            call_trace:        self
                .graph
                .state(id)
                .map_err(locate_internal)?
                .call_trace(&self.program),
            alloc_instruction: instruction_id,
        };

        let address = if self
            .graph
            .state(id)
            .map_err(locate_internal)?
            .kind
            .is_recovery()
        {
            self.guided_alloc(id, &context, size)?
        } else {
            self.plain_alloc(id, &context, size)?
        };

        if let Some(dst) = dst {
            self.bind_local(id, dst, Expr::constant(address, Width::B64))?;
        }
        Ok(())
    }

    fn execute_free(&mut self, id: StateId, pointer: &Operand) -> Result<()> {
        let state = self.graph.state(id).map_err(locate_internal)?;
        let pointer = match self.eval_operand(state, pointer) {
            Ok(p) => p,
            Err(e) => return self.fail(id, TerminateReason::Exec, &e.to_string()),
        };
        let Some(address) = self.concretize(id, &pointer)? else {
            return Ok(());
        };
        if address == 0 {
            return Ok(());
        }

        let object = {
            let state = self.graph.state(id).map_err(locate_internal)?;
            match state.address_space.resolve_one(address) {
                Ok(object) => object.clone(),
                Err(_) => {
                    return self.fail(
                        id,
                        TerminateReason::Free,
                        &ExecError::InvalidFree { address }.to_string(),
                    )
                }
            }
        };
        if object.address != address || object.is_local || object.is_global {
            return self.fail(
                id,
                TerminateReason::Free,
                &ExecError::InvalidFree { address }.to_string(),
            );
        }

        self.graph
            .state_mut(id)
            .map_err(locate_internal)?
            .address_space
            .unbind(object.id);
        let is_recovery = self
            .graph
            .state(id)
            .map_err(locate_internal)?
            .kind
            .is_recovery();
        if is_recovery {
            self.unbind_all(id, object.id)?;
        }
        Ok(())
    }

    fn push_call_frame(
        &mut self,
        id: StateId,
        ki: InstRef,
        func_id: crate::ir::FuncId,
        args: &[Operand],
    ) -> Result<()> {
        let function = self.program.function(func_id).clone();
        if args.len() < function.params.len() {
            return self.fail(
                id,
                TerminateReason::User,
                "calling function with too few arguments",
            );
        }
        if args.len() > function.params.len() && !function.is_variadic {
            warn!(callee = %function.name, "calling with extra arguments");
        }

        let mut bound = Vec::with_capacity(args.len());
        {
            let state = self.graph.state(id).map_err(locate_internal)?;
            for arg in args {
                match self.eval_operand(state, arg) {
                    Ok(v) => bound.push(v),
                    Err(e) => return self.fail(id, TerminateReason::Exec, &e.to_string()),
                }
            }
        }

        let mut frame = StackFrame::new(Some(ki), func_id, function.num_registers);
        for ((reg, width), value) in function.params.iter().zip(&bound) {
            if value.width() != *width {
                return self.fail(
                    id,
                    TerminateReason::Exec,
                    &ExecError::WidthMismatch {
                        expected: width.bits(),
                        found:    value.width().bits(),
                    }
                    .to_string(),
                );
            }
            frame.locals[reg.0 as usize] = Some(value.clone());
        }

        // Overflow arguments of a variadic call are packed into a single
        // object owned by the new frame.
        if function.is_variadic && args.len() > function.params.len() {
            let extras = &bound[function.params.len()..];
            let size: u64 = extras.iter().map(|v| v.width().bytes()).sum();
            let instruction_id = ki.instruction(&self.program).debug.instruction_id;
            let object = self.allocator.allocate(
                size,
                StorageClass::Stack,
                false,
                AllocSite::Instruction(instruction_id),
            );
            let mut contents = crate::memory::ObjectState::zeroed(size);
            let mut offset = 0;
            for value in extras {
                let width = value.width();
                contents
                    .write(offset, value.clone())
                    .expect("varargs object sized to fit");
                offset += width.bytes();
            }
            frame.varargs = Some(object.id);
            self.graph
                .state_mut(id)
                .map_err(locate_internal)?
                .address_space
                .bind(object, contents);
        }

        let state = self.graph.state_mut(id).map_err(locate_internal)?;
        frame.caller_incoming = state.incoming_block.take();
        state.stack.push(frame);
        state.pc = InstRef::entry(func_id);
        Ok(())
    }

    fn call_external(
        &mut self,
        id: StateId,
        name: &str,
        args: &[Operand],
        dst: Option<Reg>,
    ) -> Result<()> {
        let symbolic_args = {
            let state = self.graph.state(id).map_err(locate_internal)?;
            args.iter().any(|arg| {
                self.eval_operand(state, arg)
                    .map(|v| v.as_const().is_none())
                    .unwrap_or(true)
            })
        };
        if symbolic_args && !self.config.allow_external_sym_calls {
            return self.fail(
                id,
                TerminateReason::External,
                &format!("external call with symbolic arguments: {name}"),
            );
        }

        debug!(callee = %name, "modelling external call with an unconstrained result");
        if let Some(dst) = dst {
            let fresh = self.fresh_unconstrained(id, &format!("external_{name}"))?;
            self.bind_local(id, dst, fresh)?;
        }
        Ok(())
    }

    fn handle_return(&mut self, id: StateId, value: Option<&Operand>) -> Result<()> {
        let returned = {
            let state = self.graph.state(id).map_err(locate_internal)?;
            match value.map(|v| self.eval_operand(state, v)).transpose() {
                Ok(v) => v,
                Err(e) => return self.fail(id, TerminateReason::Exec, &e.to_string()),
            }
        };

        let popped = {
            let state = self.graph.state_mut(id).map_err(locate_internal)?;
            state.stack.pop().expect("a live state has a frame")
        };
        for alloca in &popped.allocas {
            self.graph
                .state_mut(id)
                .map_err(locate_internal)?
                .address_space
                .unbind(*alloca);
        }
        if let Some(varargs) = popped.varargs {
            self.graph
                .state_mut(id)
                .map_err(locate_internal)?
                .address_space
                .unbind(varargs);
        }

        let Some(caller) = popped.caller else {
            // The entry frame returned: the path ended.
            return self.terminate_on_exit(id);
        };

        {
            let state = self.graph.state_mut(id).map_err(locate_internal)?;
            state.incoming_block = popped.caller_incoming;
            state.pc = caller.next();
        }

        let result_register = match &caller.instruction(&self.program).op {
            Op::Call { dst, .. } => *dst,
            _ => None,
        };
        if let Some(dst) = result_register {
            match returned {
                Some(value) => self.bind_local(id, dst, value)?,
                None => {
                    return self.fail(
                        id,
                        TerminateReason::Exec,
                        "void return bound to a result register",
                    )
                }
            }
        }
        Ok(())
    }

    fn execute_load(
        &mut self,
        id: StateId,
        ki: InstRef,
        address: &Operand,
        width: Width,
        dst: Reg,
    ) -> Result<()> {
        let address_expr = {
            let state = self.graph.state(id).map_err(locate_internal)?;
            match self.eval_operand(state, address) {
                Ok(a) => a,
                Err(e) => return self.fail(id, TerminateReason::Exec, &e.to_string()),
            }
        };
        let Some(address) = self.concretize(id, &address_expr)? else {
            return Ok(());
        };

        // A load in dependent mode may be serviced by a skipped callee; if
        // so, the state suspends and the load re-executes after recovery.
        let instruction_id = ki.instruction(&self.program).debug.instruction_id;
        if self.is_may_blocking_load(id, instruction_id, address, width.bytes())? {
            if self.handle_may_blocking_load(id, ki, address, width.bytes())? {
                return Ok(());
            }
        }

        let value = {
            let state = self.graph.state(id).map_err(locate_internal)?;
            let object = match state.address_space.resolve_one(address) {
                Ok(object) => object.clone(),
                Err(e) => return self.fail(id, TerminateReason::Ptr, &e.to_string()),
            };
            let (_, contents) = state
                .address_space
                .find_object(object.id)
                .expect("resolved objects are bound");
            match contents.read(object.offset_of(address), width) {
                Ok(value) => value,
                Err(e @ ExecError::OutOfBoundsAccess { .. }) => {
                    return self.fail(id, TerminateReason::Ptr, &e.to_string())
                }
                Err(e) => return self.fail(id, TerminateReason::Model, &e.to_string()),
            }
        };

        self.bind_local(id, dst, value)?;
        self.on_normal_state_read(id, address)?;
        Ok(())
    }

    fn execute_store(
        &mut self,
        id: StateId,
        ki: InstRef,
        address: &Operand,
        value: &Operand,
    ) -> Result<()> {
        let (address_expr, value) = {
            let state = self.graph.state(id).map_err(locate_internal)?;
            let evaluated = (
                self.eval_operand(state, address),
                self.eval_operand(state, value),
            );
            match evaluated {
                (Ok(a), Ok(v)) => (a, v),
                (Err(e), _) | (_, Err(e)) => {
                    return self.fail(id, TerminateReason::Exec, &e.to_string())
                }
            }
        };
        let Some(address) = self.concretize(id, &address_expr)? else {
            return Ok(());
        };

        let object = {
            let state = self.graph.state(id).map_err(locate_internal)?;
            match state.address_space.resolve_one(address) {
                Ok(object) => object.clone(),
                Err(e) => return self.fail(id, TerminateReason::Ptr, &e.to_string()),
            }
        };
        if object.is_read_only {
            return self.fail(
                id,
                TerminateReason::ReadOnly,
                &ExecError::ReadOnlyObject { address }.to_string(),
            );
        }

        {
            let state = self.graph.state_mut(id).map_err(locate_internal)?;
            let contents = state.address_space.get_writeable(object.id);
            match contents.write(object.offset_of(address), value.clone()) {
                Ok(()) => {}
                Err(e @ ExecError::OutOfBoundsAccess { .. }) => {
                    return self.fail(id, TerminateReason::Ptr, &e.to_string())
                }
                Err(e) => return self.fail(id, TerminateReason::Model, &e.to_string()),
            }
        }

        let instruction_id = ki.instruction(&self.program).debug.instruction_id;
        self.on_state_write(id, instruction_id, address, &value)?;
        Ok(())
    }

    /// Concretizes an address-like expression, constraining the state to
    /// the chosen value.
    ///
    /// Returns [`None`] when the state was terminated because the
    /// expression could not be resolved.
    pub(crate) fn concretize(&mut self, id: StateId, expr: &ExprRef) -> Result<Option<u64>> {
        if let Some(value) = expr.as_const() {
            return Ok(Some(value));
        }

        let (simplified, result) = {
            let state = self.graph.state(id).map_err(locate_internal)?;
            let constraints = state.constraints.items();
            let simplified = self.solver.simplify(constraints, expr);
            if let Some(value) = simplified.as_const() {
                return Ok(Some(value));
            }
            let started = std::time::Instant::now();
            let result = self.solver.get_value(constraints, &simplified);
            let elapsed = started.elapsed().as_secs_f64();
            (simplified, (result, elapsed))
        };
        let (result, elapsed) = result;
        if let Ok(state) = self.graph.state_mut(id) {
            state.query_cost += elapsed;
        }

        match result {
            Ok(value) => {
                let width = simplified.width();
                let pin = Expr::cmp(
                    Predicate::Eq,
                    simplified,
                    Expr::constant(value, width),
                );
                self.add_constraint(id, pin);
                Ok(Some(value))
            }
            Err(solver::Error::Timeout { .. }) => {
                self.terminate_early(id, "Query timed out (resolve).")?;
                Ok(None)
            }
            Err(_) => {
                self.fail(
                    id,
                    TerminateReason::Unhandled,
                    &ExecError::UnresolvedAddress.to_string(),
                )?;
                Ok(None)
            }
        }
    }

    /// Produces a fresh unconstrained symbolic value for `id`. The value
    /// is not a test-case input, so it is not registered as a symbolic
    /// object.
    fn fresh_unconstrained(&mut self, id: StateId, name: &str) -> Result<ExprRef> {
        let state = self.graph.state_mut(id).map_err(locate_internal)?;
        let unique = state.unique_name(name);
        Ok(Expr::symbol(unique, Width::B64))
    }
}
