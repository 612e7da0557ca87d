//! This module contains the forking rules: how a symbolic branch turns
//! one state into two, how branch histories and depths are maintained,
//! how prefix guidance overrides the solver on ranging workers, and how
//! multi-way branches expand.

use rand::Rng;
use tracing::{debug, warn};

use crate::{
    engine::{locate_internal, Engine, Role},
    error::Result,
    expr::{Expr, ExprRef},
    state::{PrefixDirection, StateId},
};

/// What the fork decided before any state was created.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Decision {
    /// Continue on the true side only.
    TakeTrue { fork_and_suspend: bool },
    /// Continue on the false side only.
    TakeFalse { fork_and_suspend: bool },
    /// Both sides are feasible: really fork.
    Fork,
}

impl Engine {
    /// Forks `current` on `condition`.
    ///
    /// Returns the `(true side, false side)` state handles; a side is
    /// [`None`] when it is infeasible, was suspended away, or the state
    /// was terminated (solver timeout). `is_internal` marks engine-made
    /// branches that must not appear in the branch history.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] only on fatal failures.
    pub(crate) fn fork(
        &mut self,
        current: StateId,
        condition: &ExprRef,
        is_internal: bool,
    ) -> Result<(Option<StateId>, Option<StateId>)> {
        let ranging = {
            let state = self.graph.state(current).map_err(locate_internal)?;
            self.role() == Role::Worker && !is_internal && state.should_range()
        };

        let mut decision = if ranging {
            let state = self.graph.state(current).map_err(locate_internal)?;
            match state.direction_to_take() {
                PrefixDirection::TakeTrue { fork_and_suspend } => {
                    Decision::TakeTrue { fork_and_suspend }
                }
                PrefixDirection::TakeFalse { fork_and_suspend } => {
                    Decision::TakeFalse { fork_and_suspend }
                }
                PrefixDirection::Disagree => Decision::Fork,
            }
        } else {
            match self.evaluate_condition(current, condition)? {
                Some(decision) => decision,
                None => return Ok((None, None)),
            }
        };

        // Forking can be inhibited: over the memory cap, per-state, or by
        // the global fork budget. The branch is then committed at random.
        if decision == Decision::Fork {
            let state = self.graph.state(current).map_err(locate_internal)?;
            let inhibited = (self.config.max_memory_inhibit && self.at_memory_limit)
                || state.fork_disabled
                || self.inhibit_forking
                || (self.config.max_forks != u64::MAX && self.stats.forks >= self.config.max_forks);
            if inhibited {
                if self.config.max_memory_inhibit && self.at_memory_limit {
                    warn!("skipping fork (memory cap exceeded)");
                } else if state.fork_disabled {
                    warn!("skipping fork (fork disabled on current path)");
                } else if self.inhibit_forking {
                    warn!("skipping fork (fork disabled globally)");
                } else {
                    warn!("skipping fork (max-forks reached)");
                }
                if self.rng.gen_bool(0.5) {
                    self.add_constraint(current, condition.clone());
                    decision = Decision::TakeTrue {
                        fork_and_suspend: false,
                    };
                } else {
                    self.add_constraint(current, Expr::negate_condition(condition));
                    decision = Decision::TakeFalse {
                        fork_and_suspend: false,
                    };
                }
            }
        }

        match decision {
            Decision::TakeTrue { fork_and_suspend } => {
                if fork_and_suspend {
                    let sibling =
                        self.fork_into_suspension(current, condition, is_internal, true)?;
                    Ok((Some(current), Some(sibling)))
                } else {
                    if !is_internal {
                        self.graph
                            .state_mut(current)
                            .map_err(locate_internal)?
                            .append_branch_event(b'2');
                    }
                    Ok((Some(current), None))
                }
            }
            Decision::TakeFalse { fork_and_suspend } => {
                if fork_and_suspend {
                    let sibling =
                        self.fork_into_suspension(current, condition, is_internal, false)?;
                    Ok((Some(sibling), Some(current)))
                } else {
                    if !is_internal {
                        self.graph
                            .state_mut(current)
                            .map_err(locate_internal)?
                            .append_branch_event(b'3');
                    }
                    Ok((None, Some(current)))
                }
            }
            Decision::Fork => {
                let sibling = self.fork_both_live(current, condition, is_internal)?;
                Ok((Some(current), Some(sibling)))
            }
        }
    }

    /// Asks the solver which sides of `condition` are feasible.
    ///
    /// Returns [`None`] when the query failed and the state was
    /// terminated early.
    fn evaluate_condition(
        &mut self,
        current: StateId,
        condition: &ExprRef,
    ) -> Result<Option<Decision>> {
        let (outcome, elapsed) = {
            let state = self.graph.state(current).map_err(locate_internal)?;
            let started = std::time::Instant::now();
            let outcome = self.solver.evaluate(state.constraints.items(), condition);
            (outcome, started.elapsed().as_secs_f64())
        };
        if let Ok(state) = self.graph.state_mut(current) {
            state.query_cost += elapsed;
        }

        match outcome {
            Ok(crate::solver::Validity::True) => Ok(Some(Decision::TakeTrue {
                fork_and_suspend: false,
            })),
            Ok(crate::solver::Validity::False) => Ok(Some(Decision::TakeFalse {
                fork_and_suspend: false,
            })),
            Ok(crate::solver::Validity::Unknown) => Ok(Some(Decision::Fork)),
            Err(_) => {
                // Roll the program counter back so the emitted `.early`
                // case points at the branch.
                if let Ok(state) = self.graph.state_mut(current) {
                    state.pc = state.prev_pc;
                }
                self.terminate_early(current, "Query timed out (fork).")?;
                Ok(None)
            }
        }
    }

    /// Really forks: both sides stay live and schedulable.
    fn fork_both_live(
        &mut self,
        current: StateId,
        condition: &ExprRef,
        is_internal: bool,
    ) -> Result<StateId> {
        let sibling = self.graph.fork_sibling(current);
        self.stats.forks += 1;
        self.added_states.push(sibling);

        // Prefixes partition onto the children by their digit at this
        // depth.
        if self.role() == Role::Worker {
            self.graph
                .state_mut(current)
                .map_err(locate_internal)?
                .retain_true_prefixes();
            self.graph
                .state_mut(sibling)
                .map_err(locate_internal)?
                .retain_false_prefixes();
        }

        if !is_internal {
            self.graph
                .state_mut(current)
                .map_err(locate_internal)?
                .append_branch_event(b'0');
            self.graph
                .state_mut(sibling)
                .map_err(locate_internal)?
                .append_branch_event(b'1');
        }

        self.add_constraint(current, condition.clone());
        self.add_constraint(sibling, Expr::negate_condition(condition));

        let is_recovery = self
            .graph
            .state(current)
            .map_err(locate_internal)?
            .kind
            .is_recovery();
        if is_recovery {
            self.fork_dependent_states(current, sibling)?;
            self.merge_constraints_for_all(current, condition.clone())?;
            self.merge_constraints_for_all(sibling, Expr::negate_condition(condition))?;
        }

        debug!(
            current = current.0,
            sibling = sibling.0,
            "forked on a symbolic branch"
        );
        Ok(sibling)
    }

    /// Forks as directed by a prefix digit: the taken side stays live,
    /// the other side goes straight to the ranging-suspended pool.
    ///
    /// `current_takes_true` says which side `current` keeps; the sibling
    /// receives the opposite digit and constraint.
    fn fork_into_suspension(
        &mut self,
        current: StateId,
        condition: &ExprRef,
        is_internal: bool,
        current_takes_true: bool,
    ) -> Result<StateId> {
        let sibling = self.graph.fork_sibling(current);
        self.stats.forks += 1;

        let (current_digit, sibling_digit) = if current_takes_true {
            (b'0', b'1')
        } else {
            (b'1', b'0')
        };
        if !is_internal {
            self.graph
                .state_mut(current)
                .map_err(locate_internal)?
                .append_branch_event(current_digit);
            self.graph
                .state_mut(sibling)
                .map_err(locate_internal)?
                .append_branch_event(sibling_digit);
        }

        let (current_cond, sibling_cond) = if current_takes_true {
            (condition.clone(), Expr::negate_condition(condition))
        } else {
            (Expr::negate_condition(condition), condition.clone())
        };
        self.add_constraint(current, current_cond.clone());
        self.add_constraint(sibling, sibling_cond.clone());

        let is_recovery = self
            .graph
            .state(current)
            .map_err(locate_internal)?
            .kind
            .is_recovery();
        if is_recovery {
            self.fork_dependent_states(current, sibling)?;
            self.merge_constraints_for_all(current, current_cond)?;
            self.merge_constraints_for_all(sibling, sibling_cond)?;
        }

        debug!(
            current = current.0,
            sibling = sibling.0,
            "forking and suspending the untaken side"
        );
        self.ranging_suspended.push(sibling);
        Ok(sibling)
    }

    /// Expands a multi-way branch over `conditions`, one guard per
    /// target, retaining only the provably feasible cases.
    ///
    /// Returns one entry per condition: the state that took that case, or
    /// [`None`] when the case is infeasible.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] only on fatal failures.
    pub(crate) fn branch_multi(
        &mut self,
        current: StateId,
        conditions: &[(ExprRef, crate::ir::BlockId)],
    ) -> Result<Vec<Option<StateId>>> {
        // Feasibility screen under the current constraints.
        let mut feasible: Vec<bool> = Vec::with_capacity(conditions.len());
        for (condition, _) in conditions {
            let (outcome, elapsed) = {
                let state = self.graph.state(current).map_err(locate_internal)?;
                let started = std::time::Instant::now();
                let outcome = self
                    .solver
                    .may_be_true(state.constraints.items(), condition);
                (outcome, started.elapsed().as_secs_f64())
            };
            if let Ok(state) = self.graph.state_mut(current) {
                state.query_cost += elapsed;
            }
            match outcome {
                Ok(feasibility) => feasible.push(feasibility),
                Err(_) => {
                    if let Ok(state) = self.graph.state_mut(current) {
                        state.pc = state.prev_pc;
                    }
                    self.terminate_early(current, "Query timed out (switch).")?;
                    return Ok(vec![None; conditions.len()]);
                }
            }
        }

        let feasible_count = feasible.iter().filter(|f| **f).count();
        if feasible_count == 0 {
            // Nothing is feasible: the discriminant constraints are
            // already contradictory. The state dies quietly.
            self.terminate_state(current);
            return Ok(vec![None; conditions.len()]);
        }

        // Fork inhibition commits to one feasible case at random.
        let inhibited = (self.config.max_memory_inhibit && self.at_memory_limit)
            || self.inhibit_forking
            || (self.config.max_forks != u64::MAX
                && self.stats.forks + feasible_count as u64 - 1 >= self.config.max_forks);
        if feasible_count == 1 || inhibited {
            if inhibited && feasible_count > 1 {
                warn!("skipping switch expansion (forking inhibited)");
            }
            let candidates: Vec<usize> = feasible
                .iter()
                .enumerate()
                .filter(|(_, f)| **f)
                .map(|(i, _)| i)
                .collect();
            let chosen = candidates[self.rng.gen_range(0..candidates.len())];
            self.add_constraint(current, conditions[chosen].0.clone());
            let mut result = vec![None; conditions.len()];
            result[chosen] = Some(current);
            return Ok(result);
        }

        // Expand: the first feasible case keeps `current`, each further
        // case gets a sibling split off before any constraint lands.
        let mut result: Vec<Option<StateId>> = vec![None; conditions.len()];
        let mut first_feasible = None;
        for (index, feasible) in feasible.iter().enumerate() {
            if !*feasible {
                continue;
            }
            if first_feasible.is_none() {
                first_feasible = Some(index);
                result[index] = Some(current);
                continue;
            }

            let sibling = self.graph.fork_sibling(current);
            self.stats.forks += 1;
            self.added_states.push(sibling);
            if self.role() == Role::Worker {
                self.graph
                    .state_mut(current)
                    .map_err(locate_internal)?
                    .retain_true_prefixes();
                self.graph
                    .state_mut(sibling)
                    .map_err(locate_internal)?
                    .retain_false_prefixes();
            }
            self.graph
                .state_mut(current)
                .map_err(locate_internal)?
                .append_branch_event(b'0');
            self.graph
                .state_mut(sibling)
                .map_err(locate_internal)?
                .append_branch_event(b'1');

            let is_recovery = self
                .graph
                .state(current)
                .map_err(locate_internal)?
                .kind
                .is_recovery();
            if is_recovery {
                self.fork_dependent_states(current, sibling)?;
            }
            result[index] = Some(sibling);
        }

        let is_recovery = self
            .graph
            .state(current)
            .map_err(locate_internal)?
            .kind
            .is_recovery();
        for index in 0..result.len() {
            if let Some(state) = result[index] {
                self.add_constraint(state, conditions[index].0.clone());
                if is_recovery {
                    self.merge_constraints_for_all(state, conditions[index].0.clone())?;
                }
            }
        }
        Ok(result)
    }
}
