//! This module contains the snapshot/recovery protocol: skipping
//! side-effecting calls behind a snapshot, detecting loads blocked by a
//! skipped side effect, re-executing the relevant slice of the skipped
//! callee in a recovery state, and merging its writes back into the
//! suspended dependent.

use std::rc::Rc;

use tracing::{debug, warn};

use crate::{
    engine::{locate_internal, Engine},
    error::{
        execution::{Error as ExecError, TerminateReason},
        Result,
    },
    expr::ExprRef,
    ir::InstRef,
    memory::{allocation::StorageClass, AllocationContext, MemoryObject, ObjectState},
    state::{Priority, RecoveryInfo, Snapshot, StateId, StateKind},
};

impl Engine {
    /// Checks whether the recovery state `id` is back at its exit point:
    /// the instruction after the skipped call, at the captured stack
    /// depth.
    pub(crate) fn reached_recovery_exit(&self, id: StateId) -> Result<bool> {
        let state = self.graph.state(id).map_err(locate_internal)?;
        Ok(state.kind.is_recovery()
            && state
                .exit_resume
                .is_some_and(|(pc, depth)| state.pc == pc && state.stack.len() == depth))
    }

    /// Takes a snapshot of `id` at the currently executing call and
    /// appends it to the state's snapshot history.
    pub(crate) fn take_snapshot(&mut self, id: StateId, callee: &str) -> Result<()> {
        let state = self.graph.state_mut(id).map_err(locate_internal)?;
        let mut captured = state.clone();
        captured.guiding_constraints.clear();
        let index = state.snapshots.len();
        state.snapshots.push(Rc::new(Snapshot {
            state:  captured,
            callee: callee.to_owned(),
        }));
        state.recovered_loads.clear();
        self.stats.snapshots += 1;
        debug!(state = id.0, index, callee, "snapshot taken at skipped call");
        Ok(())
    }

    /// Checks whether the load at `instruction_id` reading `size` bytes
    /// from `address` may be blocked by a skipped side effect.
    pub(crate) fn is_may_blocking_load(
        &mut self,
        id: StateId,
        instruction_id: u64,
        address: u64,
        size: u64,
    ) -> Result<bool> {
        if !self.analysis.may_block(instruction_id) {
            return Ok(false);
        }
        let state = self.graph.state_mut(id).map_err(locate_internal)?;
        if !state.kind.is_normal() || !state.in_dependent_mode() {
            return Ok(false);
        }
        if state.recovered_loads.contains(&address) {
            debug!(state = id.0, address, "load is already recovered");
            return Ok(false);
        }
        if let Some(info) = state.complete_overwrite_info(address, size) {
            if info.snapshot_index == state.current_snapshot_index() {
                state.mark_load_unrecovered();
                debug!(
                    state = id.0,
                    address, "location was overwritten, recovery is not required"
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Handles a may-blocking load: assembles the slices that must be
    /// re-executed and, when any are uncached, spawns the first recovery
    /// state and suspends `id` with its program counter rolled back onto
    /// the load.
    ///
    /// Returns `true` when the load must not proceed (the state
    /// suspended, or was terminated during assembly).
    pub(crate) fn handle_may_blocking_load(
        &mut self,
        id: StateId,
        ki: InstRef,
        address: u64,
        size: u64,
    ) -> Result<bool> {
        if !self.assemble_recovery_infos(id, ki, address, size)? {
            // Assembly terminated the state.
            return Ok(true);
        }
        let has_pending = !self
            .graph
            .state(id)
            .map_err(locate_internal)?
            .pending_recovery_infos
            .is_empty();
        if !has_pending {
            return Ok(false);
        }

        let ri = {
            let state = self.graph.state_mut(id).map_err(locate_internal)?;
            // Re-execute the load once the recovery chain has delivered
            // the value.
            state.pc = state.prev_pc;
            state.pending_recovery_infos.remove(0)
        };
        debug!(state = id.0, address, "load blocks on a skipped side effect");
        self.start_recovery_state(id, ri)?;

        let state = self.graph.state_mut(id).map_err(locate_internal)?;
        if !state.is_suspended() {
            state.set_suspended();
            self.newly_suspended.push(id);
        }
        Ok(true)
    }

    /// Computes the recovery tasks for a blocking load, consulting and
    /// updating the recovery cache. Uncached tasks land in the state's
    /// pending queue, snapshot order preserved.
    ///
    /// Returns `false` when the state was terminated.
    fn assemble_recovery_infos(
        &mut self,
        id: StateId,
        ki: InstRef,
        address: u64,
        size: u64,
    ) -> Result<bool> {
        let site = {
            let state = self.graph.state(id).map_err(locate_internal)?;
            match state.address_space.resolve_one(address) {
                Ok(object) => object.alloc_site.clone(),
                Err(_) => {
                    self.terminate_on_error(
                        id,
                        TerminateReason::Unhandled,
                        &ExecError::UnresolvedAddress.to_string(),
                        None,
                    )?;
                    return Ok(false);
                }
            }
        };
        let modifiers: Vec<crate::ir::ModInfo> =
            self.analysis.approximate_mod_infos(&site).to_vec();
        if modifiers.is_empty() {
            return Ok(true);
        }

        let load_inst_id = ki.instruction(&self.program).debug.instruction_id;
        let mut required: Vec<Rc<RecoveryInfo>> = vec![];
        {
            let state = self.graph.state(id).map_err(locate_internal)?;
            let start = state.starting_snapshot_index(address, size);
            for index in start..state.snapshots.len() {
                // A nested recovery must not re-execute the snapshot it
                // was itself spawned from, or anything later.
                if let Some(own) = &state.recovery_info {
                    if state.kind.is_recovery() && own.snapshot_index == index {
                        break;
                    }
                }
                let snapshot = state.snapshots[index].clone();
                let Some(modifier) = modifiers.iter().find(|m| m.function == snapshot.callee)
                else {
                    continue;
                };
                let Some(slice_id) = self.analysis.slice_id(modifier) else {
                    // The analysis tables are inconsistent; fail loudly.
                    self.terminate_on_error(
                        id,
                        TerminateReason::Exec,
                        &format!("no slice registered for modifier {}", modifier.function),
                        None,
                    )?;
                    return Ok(false);
                };
                required.push(Rc::new(RecoveryInfo {
                    load_inst: ki,
                    load_inst_id,
                    load_addr: address,
                    load_size: size,
                    callee: modifier.function.clone(),
                    slice_id,
                    snapshot,
                    snapshot_index: index,
                    sub_id: 0,
                }));
            }
        }

        // Walk the candidates latest-first: a cached modifying slice
        // serves the load directly and shadows everything earlier; cached
        // non-modifying slices are skipped; the rest is queued and
        // memoized as pending so repeated loads do not re-enqueue it.
        let mut pending: Vec<Rc<RecoveryInfo>> = vec![];
        let mut cached_write: Option<ExprRef> = None;
        {
            let state = self.graph.state_mut(id).map_err(locate_internal)?;
            for ri in required.into_iter().rev() {
                match state.recovered_value(ri.snapshot_index, ri.slice_id, address) {
                    Some(Some(value)) => {
                        state.recovered_loads.insert(address);
                        debug!(
                            state = id.0,
                            index = ri.snapshot_index,
                            slice = ri.slice_id,
                            "reusing cached recovered value"
                        );
                        cached_write = Some(value);
                        break;
                    }
                    Some(None) => {
                        state.recovered_loads.insert(address);
                        debug!(
                            state = id.0,
                            index = ri.snapshot_index,
                            slice = ri.slice_id,
                            "ignoring non-modifying slice"
                        );
                    }
                    None => {
                        state.update_recovered_value(
                            ri.snapshot_index,
                            ri.slice_id,
                            address,
                            None,
                        );
                        pending.insert(0, ri);
                    }
                }
            }
            state.pending_recovery_infos.extend(pending);
        }

        if let Some(value) = cached_write {
            self.write_through(id, address, &value)?;
        }
        Ok(true)
    }

    /// Spawns a recovery state from the snapshot referenced by `ri` to
    /// service a blocking load of `dependent`.
    pub(crate) fn start_recovery_state(
        &mut self,
        dependent: StateId,
        ri: Rc<RecoveryInfo>,
    ) -> Result<()> {
        let (
            dependent_is_recovery,
            dependent_level,
            dependent_record,
            dependent_cache,
            dependent_history,
            dependent_prefixes,
            dependent_originating,
        ) = {
            let state = self.graph.state(dependent).map_err(locate_internal)?;
            (
                state.kind.is_recovery(),
                state.level,
                state.allocation_record.clone(),
                state.recovery_cache.clone(),
                state.branch_history.clone(),
                state.prefixes.clone(),
                state.originating_state,
            )
        };

        let mut template = ri.snapshot.state.clone();
        if ri.snapshot_index == 0 {
            // A recovery from the first snapshot cannot itself depend on
            // earlier skipped calls.
            template.kind = StateKind::RECOVERY;
        } else {
            template.kind = StateKind::NORMAL_RECOVERY;
            template.set_resumed();
            template.recovery_state = None;
            template.mark_load_recovered();
            template.recovered_loads.clear();
            template.recovery_cache = dependent_cache;
            template.allocation_record = dependent_record.clone();
            template.pending_recovery_infos.clear();
        }

        // The snapshot's program counter sits just past the skipped call;
        // that is where the re-execution must stop, and the call itself is
        // where it starts.
        template.exit_resume = Some((template.pc, template.stack.len()));
        template.pc = template.prev_pc;

        template.dependent_state = Some(dependent);
        let originating = if dependent_is_recovery {
            dependent_originating
        } else {
            Some(dependent)
        };
        template.originating_state = originating;
        template.recovery_info = Some(ri.clone());
        template.guiding_allocation_record = dependent_record;
        template.level = if dependent_is_recovery {
            dependent_level + 1
        } else {
            0
        };
        template.priority = Priority::High;
        template.guiding_constraints.clear();
        template.replicate_branch_history(&dependent_history);
        template.prefixes = dependent_prefixes;

        let guiding = originating
            .and_then(|o| self.graph.state(o).ok())
            .map(|o| o.guiding_constraints.clone())
            .unwrap_or_default();

        let recovery = self.graph.spawn_at(dependent, template);
        {
            let state = self.graph.state_mut(recovery).map_err(locate_internal)?;
            for constraint in guiding {
                state.add_constraint(constraint);
            }
        }
        self.graph
            .state_mut(dependent)
            .map_err(locate_internal)?
            .recovery_state = Some(recovery);

        self.added_states.push(recovery);
        self.stats.recovery_states += 1;
        debug!(
            recovery = recovery.0,
            dependent = dependent.0,
            index = ri.snapshot_index,
            slice = ri.slice_id,
            "recovery state started"
        );
        Ok(())
    }

    /// Handles a recovery state reaching its exit point: either chains
    /// into the dependent's next pending recovery, or hands the results
    /// back and resumes the dependent. The exiting recovery terminates
    /// either way.
    pub(crate) fn on_recovery_state_exit(&mut self, id: StateId) -> Result<()> {
        let dependent = self
            .graph
            .state(id)
            .map_err(locate_internal)?
            .dependent_state
            .expect("recovery states have a dependent");
        debug!(recovery = id.0, dependent = dependent.0, "recovery state reached its exit");

        let history = self
            .graph
            .state(id)
            .map_err(locate_internal)?
            .branch_history
            .clone();

        let next = {
            let state = self.graph.state_mut(dependent).map_err(locate_internal)?;
            if state.pending_recovery_infos.is_empty() {
                None
            } else {
                state.replicate_branch_history(&history);
                Some(state.pending_recovery_infos.remove(0))
            }
        };

        match next {
            Some(ri) => self.start_recovery_state(dependent, ri)?,
            None => self.notify_dependent_state(id)?,
        }
        self.terminate_state(id);
        Ok(())
    }

    /// Hands a finished recovery's results to its dependent and resumes
    /// it.
    fn notify_dependent_state(&mut self, recovery: StateId) -> Result<()> {
        let (dependent, is_normal, record, history) = {
            let state = self.graph.state(recovery).map_err(locate_internal)?;
            (
                state
                    .dependent_state
                    .expect("recovery states have a dependent"),
                state.kind.is_normal(),
                state.allocation_record.clone(),
                state.branch_history.clone(),
            )
        };

        let state = self.graph.state_mut(dependent).map_err(locate_internal)?;
        if is_normal {
            // The recovery's allocation record extends the dependent's.
            state.allocation_record = record;
        }
        state.set_resumed();
        state.recovery_state = None;
        state.mark_load_unrecovered();
        state.replicate_branch_history(&history);
        debug!(dependent = dependent.0, "dependent state resumed");
        self.resumed_states.push(dependent);
        Ok(())
    }

    /// Records a successful read in dependent mode so the same location
    /// is not recovered twice.
    pub(crate) fn on_normal_state_read(&mut self, id: StateId, address: u64) -> Result<()> {
        let state = self.graph.state_mut(id).map_err(locate_internal)?;
        if state.kind.is_normal()
            && state.in_dependent_mode()
            && !state.is_blocking_load_recovered()
        {
            state.recovered_loads.insert(address);
            state.mark_load_recovered();
        }
        Ok(())
    }

    /// Applies the write hooks after a store: write-through for recovery
    /// states, overwrite tracking for dependent-mode normal states.
    pub(crate) fn on_state_write(
        &mut self,
        id: StateId,
        instruction_id: u64,
        address: u64,
        value: &ExprRef,
    ) -> Result<()> {
        let (is_recovery, track_overwrite) = {
            let state = self.graph.state(id).map_err(locate_internal)?;
            (
                state.kind.is_recovery(),
                state.kind.is_normal()
                    && state.in_dependent_mode()
                    && self.analysis.may_override(instruction_id),
            )
        };

        if is_recovery {
            self.on_recovery_state_write(id, address, value)?;
        }
        if track_overwrite {
            let state = self.graph.state_mut(id).map_err(locate_internal)?;
            let index = state.current_snapshot_index();
            state.add_written_address(address, value.width().bytes(), index);
        }
        Ok(())
    }

    /// Propagates a recovery state's store at the recovered address into
    /// its dependent, and memoizes the value.
    fn on_recovery_state_write(
        &mut self,
        id: StateId,
        address: u64,
        value: &ExprRef,
    ) -> Result<()> {
        let ri = self
            .graph
            .state(id)
            .map_err(locate_internal)?
            .recovery_info
            .clone()
            .expect("recovery states carry a task");
        if address != ri.load_addr {
            return Ok(());
        }

        let dependent = self
            .graph
            .state(id)
            .map_err(locate_internal)?
            .dependent_state
            .expect("recovery states have a dependent");
        debug!(
            recovery = id.0,
            dependent = dependent.0,
            address,
            "propagating recovered value"
        );
        self.write_through(dependent, address, value)?;
        self.graph
            .state_mut(dependent)
            .map_err(locate_internal)?
            .update_recovered_value(ri.snapshot_index, ri.slice_id, address, Some(value.clone()));
        Ok(())
    }

    /// Writes `value` at the concrete `address` of `id` without any
    /// hooks.
    fn write_through(&mut self, id: StateId, address: u64, value: &ExprRef) -> Result<()> {
        let object = {
            let state = self.graph.state(id).map_err(locate_internal)?;
            match state.address_space.resolve_one(address) {
                Ok(object) => object.clone(),
                Err(_) => {
                    warn!(state = id.0, address, "recovered address is unmapped, dropping write");
                    return Ok(());
                }
            }
        };
        let state = self.graph.state_mut(id).map_err(locate_internal)?;
        let offset = object.offset_of(address);
        state
            .address_space
            .get_writeable(object.id)
            .write(offset, value.clone())
            .map_err(locate_internal)?;
        Ok(())
    }

    /// Handles a dynamic allocation in a recovery state: the guiding
    /// allocation record pins the re-execution to the objects (or
    /// refusals) the original execution produced.
    pub(crate) fn guided_alloc(
        &mut self,
        id: StateId,
        context: &AllocationContext,
        size: u64,
    ) -> Result<u64> {
        let dependent = self
            .graph
            .state(id)
            .map_err(locate_internal)?
            .dependent_state
            .expect("recovery states have a dependent");

        let recorded = self
            .graph
            .state(id)
            .map_err(locate_internal)?
            .guiding_allocation_record
            .get(context);

        match recorded {
            Some(Some(object)) => {
                debug!(
                    state = id.0,
                    address = object.address,
                    "reusing recorded allocation"
                );
                self.bind_if_absent(id, &object, size);
                self.bind_all(dependent, &object, size)?;
                Ok(object.address)
            }
            Some(None) => {
                debug!(state = id.0, "reusing recorded allocation refusal");
                Ok(0)
            }
            None => {
                let object = self.fresh_heap_alloc(context, size);
                {
                    let state = self.graph.state_mut(dependent).map_err(locate_internal)?;
                    state
                        .allocation_record
                        .add(context.clone(), object.clone());
                }
                {
                    let state = self.graph.state_mut(id).map_err(locate_internal)?;
                    if state.kind.is_normal() {
                        state
                            .allocation_record
                            .add(context.clone(), object.clone());
                    }
                }
                match object {
                    Some(object) => {
                        self.bind_if_absent(id, &object, size);
                        self.bind_all(dependent, &object, size)?;
                        Ok(object.address)
                    }
                    None => Ok(0),
                }
            }
        }
    }

    /// Handles a dynamic allocation in a normal state.
    pub(crate) fn plain_alloc(
        &mut self,
        id: StateId,
        context: &AllocationContext,
        size: u64,
    ) -> Result<u64> {
        let object = self.fresh_heap_alloc(context, size);
        let state = self.graph.state_mut(id).map_err(locate_internal)?;
        if state.kind.is_normal() && state.in_dependent_mode() {
            state.allocation_record.add(context.clone(), object.clone());
        }
        match object {
            Some(object) => {
                let address = object.address;
                state
                    .address_space
                    .bind(object, ObjectState::zeroed(size));
                Ok(address)
            }
            None => Ok(0),
        }
    }

    fn fresh_heap_alloc(
        &mut self,
        context: &AllocationContext,
        size: u64,
    ) -> Option<Rc<MemoryObject>> {
        if size >= crate::constant::HUGE_ALLOC_SIZE {
            return None;
        }
        Some(self.allocator.allocate(
            size,
            StorageClass::Heap,
            false,
            crate::ir::AllocSite::Instruction(context.alloc_instruction),
        ))
    }

    fn bind_if_absent(&mut self, id: StateId, object: &Rc<MemoryObject>, size: u64) {
        if let Ok(state) = self.graph.state_mut(id) {
            if !state.address_space.is_bound(object.id) {
                state
                    .address_space
                    .bind(object.clone(), ObjectState::zeroed(size));
            }
        }
    }

    /// Binds `object` into `start` and every further state down its
    /// dependent chain, so the whole chain resolves the same address.
    pub(crate) fn bind_all(
        &mut self,
        start: StateId,
        object: &Rc<MemoryObject>,
        size: u64,
    ) -> Result<()> {
        let mut current = Some(start);
        while let Some(id) = current {
            self.bind_if_absent(id, object, size);
            let state = self.graph.state(id).map_err(locate_internal)?;
            current = if state.kind.is_recovery() {
                state.dependent_state
            } else {
                None
            };
        }
        Ok(())
    }

    /// Unbinds `object` from `start` and every further state down its
    /// dependent chain, mirroring a `free` performed during recovery.
    pub(crate) fn unbind_all(&mut self, id: StateId, object: crate::memory::ObjectId) -> Result<()> {
        let mut current = self
            .graph
            .state(id)
            .map_err(locate_internal)?
            .dependent_state;
        while let Some(dependent) = current {
            let state = self.graph.state_mut(dependent).map_err(locate_internal)?;
            state.address_space.unbind(object);
            current = if state.kind.is_recovery() {
                state.dependent_state
            } else {
                None
            };
        }
        Ok(())
    }

    /// Forks the whole dependent chain of a forking recovery state, so
    /// each recovery keeps exactly one dependent at each level. The
    /// sibling chain becomes the dependent chain of `sibling`, and the
    /// forked outermost ancestor becomes the sibling chain's originating
    /// state.
    pub(crate) fn fork_dependent_states(
        &mut self,
        original: StateId,
        sibling: StateId,
    ) -> Result<()> {
        let mut current = self
            .graph
            .state(original)
            .map_err(locate_internal)?
            .dependent_state
            .expect("recovery states have a dependent");
        let mut prev_forked = sibling;
        let forked_originating;

        loop {
            let template = self.graph.state(current).map_err(locate_internal)?.clone();
            debug_assert!(template.is_suspended() || template.kind.is_recovery());
            let forked = self.graph.spawn_at(current, template);
            if self
                .graph
                .state(forked)
                .map_err(locate_internal)?
                .kind
                .is_recovery()
            {
                self.stats.recovery_states += 1;
            }
            debug!(forked = forked.0, from = current.0, "forked dependent state");

            self.graph
                .state_mut(forked)
                .map_err(locate_internal)?
                .recovery_state = Some(prev_forked);
            self.graph
                .state_mut(prev_forked)
                .map_err(locate_internal)?
                .dependent_state = Some(forked);

            let current_state = self.graph.state(current).map_err(locate_internal)?;
            if current_state.kind.is_recovery() {
                let next = current_state
                    .dependent_state
                    .expect("recovery states have a dependent");
                prev_forked = forked;
                current = next;
            } else {
                forked_originating = forked;
                break;
            }
        }

        // The sibling chain hangs off the freshly forked ancestor.
        let mut walker = Some(sibling);
        while let Some(id) = walker {
            let state = self.graph.state_mut(id).map_err(locate_internal)?;
            if state.kind.is_recovery() {
                state.originating_state = Some(forked_originating);
                walker = state.dependent_state;
            } else {
                walker = None;
            }
        }
        Ok(())
    }

    /// Adds `condition` to every state of the dependent chain of a forked
    /// recovery state, and to the originating state's guiding set.
    pub(crate) fn merge_constraints_for_all(
        &mut self,
        recovery: StateId,
        condition: ExprRef,
    ) -> Result<()> {
        let mut next = self
            .graph
            .state(recovery)
            .map_err(locate_internal)?
            .dependent_state;
        while let Some(id) = next {
            let state = self.graph.state_mut(id).map_err(locate_internal)?;
            state.add_constraint(condition.clone());
            next = if state.kind.is_recovery() {
                state.dependent_state
            } else {
                None
            };
        }

        let originating = self
            .graph
            .state(recovery)
            .map_err(locate_internal)?
            .originating_state;
        if let Some(originating) = originating {
            self.graph
                .state_mut(originating)
                .map_err(locate_internal)?
                .add_guiding_constraint(condition);
        }
        Ok(())
    }
}
