//! This module contains the decision procedure behind the solver facade.
//!
//! The engine treats the procedure as an external collaborator behind the
//! [`DecisionProcedure`] trait; the built-in [`BoundedProcedure`] is a
//! deliberately budgeted implementation. It decides queries by exhaustive
//! enumeration when the free symbolic input is small, by boundary-value
//! probing when it is not, and answers `Unknown` rather than guessing when
//! both are out of reach. A `Sat` answer always carries a verified witness;
//! an `Unsat` answer is only produced when the search was provably
//! exhaustive for the query's shape.

use std::{fmt::Debug, rc::Rc, time::Instant};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    constant::DEFAULT_ENUMERATION_BIT_BUDGET,
    expr::{Expr, ExprRef, Width},
};

/// A satisfying assignment of symbols to concrete values.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Model {
    values: FxHashMap<Rc<str>, u64>,
}

impl Model {
    /// Gets the value assigned to `name`, if the model constrains it.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<u64> {
        self.values.get(name).copied()
    }

    /// Assigns `value` to `name`.
    pub fn insert(&mut self, name: Rc<str>, value: u64) {
        self.values.insert(name, value);
    }

    /// Iterates over the assignments of the model.
    pub fn iter(&self) -> impl Iterator<Item = (&Rc<str>, u64)> {
        self.values.iter().map(|(k, v)| (k, *v))
    }
}

/// The result of a satisfiability check.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SatResult {
    /// The constraints are satisfiable; a witness is attached.
    Sat(Model),

    /// The constraints are unsatisfiable.
    Unsat,

    /// The procedure could not decide the query.
    Unknown(String),
}

/// The interface to an object that can check constraint sets for
/// satisfiability.
///
/// The interface is a single method, but it can encapsulate an arbitrary
/// theory solver as far as the engine is concerned.
pub trait DecisionProcedure
where
    Self: Debug,
{
    /// Checks the conjunction of `constraints` for satisfiability, giving
    /// up once `deadline` has passed.
    #[must_use]
    fn check(&self, constraints: &[ExprRef], deadline: Instant) -> SatResult;
}

/// A dynamically dispatched [`DecisionProcedure`] instance.
pub type DynDecisionProcedure = Rc<dyn DecisionProcedure>;

/// How often, in iterations, the enumeration loops check the deadline.
const DEADLINE_CHECK_STRIDE: u64 = 1024;

/// The largest number of probe combinations attempted before giving up.
const PROBE_LIMIT: usize = 4096;

/// The built-in budgeted decision procedure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BoundedProcedure {
    /// The total number of free bits below which queries are decided by
    /// exhaustive enumeration.
    enumeration_bit_budget: u32,
}

impl BoundedProcedure {
    /// Constructs a procedure with the given enumeration budget.
    #[must_use]
    pub fn new(enumeration_bit_budget: u32) -> Self {
        Self {
            enumeration_bit_budget,
        }
    }

    /// Wraps `self` into an [`Rc`].
    #[must_use]
    pub fn in_rc(self) -> DynDecisionProcedure {
        Rc::new(self)
    }
}

impl Default for BoundedProcedure {
    fn default() -> Self {
        Self::new(DEFAULT_ENUMERATION_BIT_BUDGET)
    }
}

impl DecisionProcedure for BoundedProcedure {
    fn check(&self, constraints: &[ExprRef], deadline: Instant) -> SatResult {
        // Constant constraints decide themselves.
        let mut live: Vec<ExprRef> = Vec::with_capacity(constraints.len());
        for constraint in constraints {
            if constraint.is_false() {
                return SatResult::Unsat;
            }
            if !constraint.is_true() {
                live.push(constraint.clone());
            }
        }
        if live.is_empty() {
            return SatResult::Sat(Model::default());
        }

        let mut symbols: FxHashSet<(Rc<str>, Width)> = FxHashSet::default();
        for constraint in &live {
            constraint.collect_symbols(&mut symbols);
        }
        let mut symbols: Vec<(Rc<str>, Width)> = symbols.into_iter().collect();
        symbols.sort_by(|a, b| a.0.cmp(&b.0));

        let total_bits: u32 = symbols.iter().map(|(_, w)| w.bits()).sum();
        if total_bits <= self.enumeration_bit_budget {
            return enumerate_exhaustively(&live, &symbols, deadline);
        }

        probe_boundaries(&live, &symbols, deadline)
    }
}

/// Checks whether `model` satisfies every constraint in `live`.
fn satisfies(live: &[ExprRef], model: &Model) -> bool {
    live.iter().all(|constraint| {
        constraint.evaluate(&|name| model.get(name).or(Some(0))) == Some(1)
    })
}

/// Decides the query by walking every assignment of the (small) symbol
/// domain.
fn enumerate_exhaustively(
    live: &[ExprRef],
    symbols: &[(Rc<str>, Width)],
    deadline: Instant,
) -> SatResult {
    let total_bits: u32 = symbols.iter().map(|(_, w)| w.bits()).sum();
    let combinations: u64 = 1u64.checked_shl(total_bits).unwrap_or(u64::MAX);

    for encoded in 0..combinations {
        if encoded % DEADLINE_CHECK_STRIDE == 0 && Instant::now() >= deadline {
            return SatResult::Unknown("enumeration timed out".into());
        }

        let mut model = Model::default();
        let mut remaining = encoded;
        for (name, width) in symbols {
            model.insert(name.clone(), remaining & width.mask());
            remaining >>= width.bits();
        }

        if satisfies(live, &model) {
            return SatResult::Sat(model);
        }
    }

    SatResult::Unsat
}

/// Checks whether `expr` is a comparison between exactly the symbol `name`
/// (undecorated, not cast) and constants.
///
/// For such constraints the satisfying set of the symbol is a union of
/// intervals whose endpoints are the constants of the constraint shifted by
/// at most one, so boundary probing over those points is a complete search.
fn is_simple_comparison(expr: &ExprRef, name: &str) -> bool {
    match &**expr {
        Expr::Cmp { left, right, .. } => {
            let symbol_side = |e: &ExprRef| matches!(&**e, Expr::Sym { name: n, .. } if n.as_ref() == name);
            let const_side = |e: &ExprRef| e.as_const().is_some();
            (symbol_side(left) && const_side(right)) || (const_side(left) && symbol_side(right))
        }
        _ => false,
    }
}

/// Collects every constant literal appearing anywhere in `expr` into `out`.
fn collect_constants(expr: &ExprRef, out: &mut FxHashSet<u64>) {
    match &**expr {
        Expr::Const { value, .. } => {
            out.insert(*value);
        }
        Expr::Sym { .. } => {}
        Expr::Binary { left, right, .. } | Expr::Cmp { left, right, .. } => {
            collect_constants(left, out);
            collect_constants(right, out);
        }
        Expr::Not { value } | Expr::Cast { value, .. } => collect_constants(value, out),
        Expr::Ite {
            cond,
            then_v,
            else_v,
        } => {
            collect_constants(cond, out);
            collect_constants(then_v, out);
            collect_constants(else_v, out);
        }
    }
}

/// Decides the query by probing boundary values of each symbol.
///
/// Constraints that mention a single symbol are solved per symbol over that
/// symbol's candidate values. When every constraint on a symbol is a simple
/// comparison against constants, a failed search is conclusive and the
/// query is `Unsat`; otherwise failure degrades to `Unknown`. Symbols that
/// only occur in multi-symbol constraints keep their default of zero and
/// the final verification pass decides whether the assembled witness
/// works.
fn probe_boundaries(
    live: &[ExprRef],
    symbols: &[(Rc<str>, Width)],
    deadline: Instant,
) -> SatResult {
    // Partition the constraints by the symbol they mention.
    let mut per_symbol: FxHashMap<&str, Vec<ExprRef>> = FxHashMap::default();
    let mut multi_symbol: Vec<ExprRef> = vec![];
    for constraint in live {
        let mut mentioned = FxHashSet::default();
        constraint.collect_symbols(&mut mentioned);
        if mentioned.len() == 1 {
            let (name, _) = mentioned.into_iter().next().expect("len checked above");
            per_symbol
                .entry(
                    symbols
                        .iter()
                        .find(|(n, _)| *n == name)
                        .map(|(n, _)| n.as_ref())
                        .expect("symbol table covers all constraints"),
                )
                .or_default()
                .push(constraint.clone());
        } else {
            multi_symbol.push(constraint.clone());
        }
    }

    let mut model = Model::default();
    let mut probes: usize = 0;

    for (name, width) in symbols {
        let Some(on_symbol) = per_symbol.get(name.as_ref()) else {
            continue;
        };

        let mut candidates: FxHashSet<u64> = FxHashSet::default();
        let mask = width.mask();
        candidates.extend([0, 1, mask, mask >> 1, (mask >> 1).wrapping_add(1) & mask]);
        let mut literals = FxHashSet::default();
        for constraint in on_symbol {
            collect_constants(constraint, &mut literals);
        }
        for literal in literals {
            candidates.insert(literal & mask);
            candidates.insert(literal.wrapping_add(1) & mask);
            candidates.insert(literal.wrapping_sub(1) & mask);
        }

        let mut found = None;
        for candidate in &candidates {
            probes += 1;
            if probes > PROBE_LIMIT || Instant::now() >= deadline {
                return SatResult::Unknown("probe budget exhausted".into());
            }
            let holds = on_symbol.iter().all(|constraint| {
                constraint.evaluate(&|n| (n == name.as_ref()).then_some(*candidate)) == Some(1)
            });
            if holds {
                found = Some(*candidate);
                break;
            }
        }

        match found {
            Some(value) => model.insert(name.clone(), value),
            None => {
                let conclusive = on_symbol
                    .iter()
                    .all(|constraint| is_simple_comparison(constraint, name));
                return if conclusive {
                    SatResult::Unsat
                } else {
                    SatResult::Unknown("no boundary candidate satisfied the constraints".into())
                };
            }
        }
    }

    if satisfies(live, &model) {
        SatResult::Sat(model)
    } else {
        SatResult::Unknown("assembled witness failed cross-verification".into())
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::expr::{BinOp, Predicate};

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    fn check(constraints: &[ExprRef]) -> SatResult {
        BoundedProcedure::default().check(constraints, deadline())
    }

    #[test]
    fn decides_empty_constraints_as_sat() {
        assert!(matches!(check(&[]), SatResult::Sat(_)));
    }

    #[test]
    fn enumerates_small_domains_exhaustively() {
        let x = Expr::symbol("x", Width::B8);
        let y = Expr::symbol("y", Width::B8);
        let sum = Expr::binary(BinOp::Add, x, y);
        let eq = Expr::cmp(Predicate::Eq, sum, Expr::constant(44, Width::B8));
        match check(&[eq.clone()]) {
            SatResult::Sat(model) => {
                assert_eq!(eq.evaluate(&|n| model.get(n)), Some(1));
            }
            other => panic!("expected Sat, found {other:?}"),
        }
    }

    #[test]
    fn detects_contradiction_in_small_domain() {
        let x = Expr::symbol("x", Width::B8);
        let lt = Expr::cmp(
            Predicate::Ult,
            x.clone(),
            Expr::constant(5, Width::B8),
        );
        let gt = Expr::cmp(Predicate::Ugt, x, Expr::constant(10, Width::B8));
        assert_eq!(check(&[lt, gt]), SatResult::Unsat);
    }

    #[test]
    fn probes_wide_symbols_at_boundaries() {
        let x = Expr::symbol("x", Width::B64);
        let gt = Expr::cmp(
            Predicate::Ugt,
            x.clone(),
            Expr::constant(1_000_000, Width::B64),
        );
        match check(&[gt.clone()]) {
            SatResult::Sat(model) => {
                assert_eq!(gt.evaluate(&|n| model.get(n)), Some(1));
            }
            other => panic!("expected Sat, found {other:?}"),
        }
    }

    #[test]
    fn concludes_unsat_for_simple_wide_contradictions() {
        let x = Expr::symbol("x", Width::B64);
        let lt = Expr::cmp(
            Predicate::Ult,
            x.clone(),
            Expr::constant(5, Width::B64),
        );
        let gt = Expr::cmp(
            Predicate::Ugt,
            x,
            Expr::constant(1_000_000, Width::B64),
        );
        assert_eq!(check(&[lt, gt]), SatResult::Unsat);
    }

    #[test]
    fn signed_bounds_on_wide_symbols_have_witnesses() {
        let x = Expr::symbol("x", Width::B32);
        let gt = Expr::cmp(
            Predicate::Sgt,
            x.clone(),
            Expr::constant(0, Width::B32),
        );
        let lt = Expr::cmp(Predicate::Slt, x, Expr::constant(100, Width::B32));
        assert!(matches!(check(&[gt, lt]), SatResult::Sat(_)));
    }
}
