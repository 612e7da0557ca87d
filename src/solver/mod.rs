//! This module contains the solver facade: the sole gateway through which
//! the engine asks questions about path constraints.
//!
//! The facade owns a wall-clock timeout, performs expression simplification
//! before dispatching, and exposes the query modes the engine needs:
//! three-valued [`SolverFacade::evaluate`], the may/must refinements, model
//! extraction via [`SolverFacade::get_value`], and range bracketing via
//! [`SolverFacade::get_range`]. Every query returns a [`Result`] so that a
//! timeout or an undecided query is a signal the engine can act on (it
//! terminates the in-flight state early) rather than a crash.

pub mod procedure;

use std::{
    rc::Rc,
    time::{Duration, Instant},
};

use rustc_hash::FxHashMap;

use crate::{
    constant::DEFAULT_SOLVER_TIMEOUT_MS,
    error::solver::{Error, Result},
    expr::{Expr, ExprRef, Predicate},
    solver::procedure::{DynDecisionProcedure, Model, SatResult},
};

/// The three-valued answer of [`SolverFacade::evaluate`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Validity {
    /// The condition holds on every assignment satisfying the constraints.
    True,
    /// The condition fails on every assignment satisfying the constraints.
    False,
    /// Both outcomes are feasible; the engine must fork.
    Unknown,
}

/// The facade over the decision procedure.
#[derive(Clone, Debug)]
pub struct SolverFacade {
    backend: DynDecisionProcedure,
    timeout: Duration,
}

impl SolverFacade {
    /// Constructs a facade over `backend` with the default query timeout.
    #[must_use]
    pub fn new(backend: DynDecisionProcedure) -> Self {
        Self {
            backend,
            timeout: Duration::from_millis(DEFAULT_SOLVER_TIMEOUT_MS),
        }
    }

    /// Sets the wall-clock timeout applied to each individual query.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Simplifies `expr` under the given `constraints`.
    ///
    /// Equalities between a symbol and a constant are substituted through
    /// the expression, after which constant folding runs again. This is
    /// what turns a symbolic address back into a concrete one once the
    /// engine has committed to a concretisation.
    #[must_use]
    pub fn simplify(&self, constraints: &[ExprRef], expr: &ExprRef) -> ExprRef {
        let mut bindings: FxHashMap<Rc<str>, u64> = FxHashMap::default();
        for constraint in constraints {
            if let Expr::Cmp {
                pred: Predicate::Eq,
                left,
                right,
            } = &**constraint
            {
                match (&**left, &**right) {
                    (Expr::Sym { name, .. }, Expr::Const { value, .. })
                    | (Expr::Const { value, .. }, Expr::Sym { name, .. }) => {
                        bindings.insert(name.clone(), *value);
                    }
                    _ => {}
                }
            }
        }
        if bindings.is_empty() {
            return expr.clone();
        }
        substitute(expr, &bindings)
    }

    /// Decides whether `cond` is valid, unsatisfiable, or neither under
    /// `constraints`.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the query timed out or the backend could not
    /// decide it.
    pub fn evaluate(&self, constraints: &[ExprRef], cond: &ExprRef) -> Result<Validity> {
        if cond.is_true() {
            return Ok(Validity::True);
        }
        if cond.is_false() {
            return Ok(Validity::False);
        }
        if self.must_be_true(constraints, cond)? {
            return Ok(Validity::True);
        }
        if self.must_be_false(constraints, cond)? {
            return Ok(Validity::False);
        }
        Ok(Validity::Unknown)
    }

    /// Checks whether some assignment satisfying `constraints` also
    /// satisfies `cond`.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the query timed out or could not be decided.
    pub fn may_be_true(&self, constraints: &[ExprRef], cond: &ExprRef) -> Result<bool> {
        let mut query = constraints.to_vec();
        query.push(cond.clone());
        match self.check(&query)? {
            SatResult::Sat(_) => Ok(true),
            SatResult::Unsat => Ok(false),
            SatResult::Unknown(_) => unreachable!("check maps Unknown to Err"),
        }
    }

    /// Checks whether every assignment satisfying `constraints` also
    /// satisfies `cond`.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the query timed out or could not be decided.
    pub fn must_be_true(&self, constraints: &[ExprRef], cond: &ExprRef) -> Result<bool> {
        let negated = Expr::negate_condition(cond);
        Ok(!self.may_be_true(constraints, &negated)?)
    }

    /// Checks whether no assignment satisfying `constraints` satisfies
    /// `cond`.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the query timed out or could not be decided.
    pub fn must_be_false(&self, constraints: &[ExprRef], cond: &ExprRef) -> Result<bool> {
        Ok(!self.may_be_true(constraints, cond)?)
    }

    /// Gets a concrete value that `expr` can take under `constraints`.
    ///
    /// Symbols left unconstrained by the model default to zero; the
    /// returned value is always a genuine witness.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the constraints are unsatisfiable, the query
    /// timed out, or the backend could not decide it.
    pub fn get_value(&self, constraints: &[ExprRef], expr: &ExprRef) -> Result<u64> {
        if let Some(value) = expr.as_const() {
            return Ok(value);
        }
        let simplified = self.simplify(constraints, expr);
        if let Some(value) = simplified.as_const() {
            return Ok(value);
        }
        let model = self.get_model(constraints)?;
        simplified
            .evaluate(&|name| Some(model.get(name).unwrap_or(0)))
            .ok_or_else(|| Error::Unknown {
                reason: "model did not determine the expression".into(),
            })
    }

    /// Gets a satisfying model of `constraints`.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the constraints are unsatisfiable, the query
    /// timed out, or the backend could not decide it.
    pub fn get_model(&self, constraints: &[ExprRef]) -> Result<Model> {
        match self.check(constraints)? {
            SatResult::Sat(model) => Ok(model),
            SatResult::Unsat => Err(Error::NoModel),
            SatResult::Unknown(_) => unreachable!("check maps Unknown to Err"),
        }
    }

    /// Brackets the values `expr` can take under `constraints`, returning
    /// an inclusive `(min, max)` pair over the unsigned interpretation.
    ///
    /// The bounds are found by binary search over feasibility queries, so
    /// the cost is logarithmic in the width of the expression.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if any of the underlying feasibility queries fails.
    pub fn get_range(&self, constraints: &[ExprRef], expr: &ExprRef) -> Result<(u64, u64)> {
        if let Some(value) = expr.as_const() {
            return Ok((value, value));
        }
        let width = expr.width();

        let le = |bound: u64| {
            Expr::cmp(
                Predicate::Ule,
                expr.clone(),
                Expr::constant(bound, width),
            )
        };

        // Smallest value: tighten the upper bound while it stays feasible.
        let mut lo = 0u64;
        let mut hi = width.mask();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.may_be_true(constraints, &le(mid))? {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        let min = lo;

        // Largest value: tighten the lower bound while its complement stays
        // feasible.
        let mut lo = min;
        let mut hi = width.mask();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let above = Expr::negate_condition(&le(mid));
            if self.may_be_true(constraints, &above)? {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        Ok((min, lo))
    }

    fn check(&self, constraints: &[ExprRef]) -> Result<SatResult> {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let result = self.backend.check(constraints, deadline);
        match result {
            SatResult::Unknown(reason) => {
                if Instant::now() >= deadline {
                    Err(Error::Timeout {
                        timeout_ms: u64::try_from(self.timeout.as_millis())
                            .unwrap_or(u64::MAX),
                    })
                } else {
                    Err(Error::Unknown { reason })
                }
            }
            decided => Ok(decided),
        }
    }
}

/// Substitutes constant `bindings` for symbols throughout `expr`,
/// re-folding as it goes.
fn substitute(expr: &ExprRef, bindings: &FxHashMap<Rc<str>, u64>) -> ExprRef {
    match &**expr {
        Expr::Const { .. } => expr.clone(),
        Expr::Sym { name, width } => match bindings.get(name) {
            Some(value) => Expr::constant(*value, *width),
            None => expr.clone(),
        },
        Expr::Binary { op, left, right } => Expr::binary(
            *op,
            substitute(left, bindings),
            substitute(right, bindings),
        ),
        Expr::Cmp { pred, left, right } => Expr::cmp(
            *pred,
            substitute(left, bindings),
            substitute(right, bindings),
        ),
        Expr::Not { value } => Expr::not(substitute(value, bindings)),
        Expr::Cast { kind, value, to } => Expr::cast(*kind, substitute(value, bindings), *to),
        Expr::Ite {
            cond,
            then_v,
            else_v,
        } => Expr::ite(
            substitute(cond, bindings),
            substitute(then_v, bindings),
            substitute(else_v, bindings),
        ),
    }
}

/// Constructs the facade over the built-in decision procedure with default
/// settings.
#[must_use]
pub fn default_facade() -> SolverFacade {
    SolverFacade::new(procedure::BoundedProcedure::default().in_rc())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::expr::{BinOp, Expr, Predicate, Width};

    fn facade() -> SolverFacade {
        default_facade()
    }

    #[test]
    fn evaluates_symbolic_branch_as_unknown() {
        let x = Expr::symbol("x", Width::B32);
        let cond = Expr::cmp(Predicate::Sgt, x, Expr::constant(0, Width::B32));
        let validity = facade().evaluate(&[], &cond).expect("query must be decided");
        assert_eq!(validity, Validity::Unknown);
    }

    #[test]
    fn evaluates_implied_branch_as_true() {
        let x = Expr::symbol("x", Width::B32);
        let gt_ten = Expr::cmp(
            Predicate::Sgt,
            x.clone(),
            Expr::constant(10, Width::B32),
        );
        let gt_zero = Expr::cmp(Predicate::Sgt, x, Expr::constant(0, Width::B32));
        let validity = facade()
            .evaluate(&[gt_ten], &gt_zero)
            .expect("query must be decided");
        assert_eq!(validity, Validity::True);
    }

    #[test]
    fn extracts_a_witness_for_a_constrained_symbol() {
        let x = Expr::symbol("x", Width::B32);
        let gt = Expr::cmp(
            Predicate::Sgt,
            x.clone(),
            Expr::constant(5, Width::B32),
        );
        let value = facade().get_value(&[gt.clone()], &x).expect("satisfiable");
        let check = gt.evaluate(&|name| (name == "x").then_some(value));
        assert_eq!(check, Some(1));
    }

    #[test]
    fn simplification_substitutes_pinned_symbols() {
        let x = Expr::symbol("x", Width::B32);
        let pin = Expr::cmp(
            Predicate::Eq,
            x.clone(),
            Expr::constant(3, Width::B32),
        );
        let sum = Expr::binary(BinOp::Add, x, Expr::constant(4, Width::B32));
        let simplified = facade().simplify(&[pin], &sum);
        assert_eq!(simplified.as_const(), Some(7));
    }

    #[test]
    fn ranges_bracket_a_bounded_symbol() {
        let x = Expr::symbol("x", Width::B8);
        let lower = Expr::cmp(
            Predicate::Uge,
            x.clone(),
            Expr::constant(10, Width::B8),
        );
        let upper = Expr::cmp(
            Predicate::Ule,
            x.clone(),
            Expr::constant(20, Width::B8),
        );
        let range = facade()
            .get_range(&[lower, upper], &x)
            .expect("range must be decidable");
        assert_eq!(range, (10, 20));
    }
}
