//! This module contains common testing utilities for testing this library.
#![cfg(test)]
#![allow(unused)]

use std::rc::Rc;

use symex_cluster::{
    engine::Engine,
    expr::{BinOp, Predicate, Width},
    ir::{
        build::{c32, c64, ProgramBuilder},
        AllocSite,
        Analysis,
        ModInfo,
        Operand,
        Program,
    },
    output::OutputHandler,
    watchdog::LazyWatchdog,
    Config,
};

/// Constructs a standalone engine over `program` and `analysis` with the
/// provided configuration and no output directory.
pub fn new_engine(program: Program, analysis: Analysis, config: Config) -> Engine {
    Engine::new(
        Rc::new(program),
        Rc::new(analysis),
        config,
        LazyWatchdog.in_rc(),
        OutputHandler::new(None).expect("no directory to create"),
        None,
        7,
    )
}

/// Collects the branch histories of every emitted test case, sorted.
pub fn sorted_histories(engine: &Engine) -> Vec<String> {
    let mut histories: Vec<String> = engine
        .outputs()
        .tests()
        .iter()
        .map(|test| test.branch_history.clone())
        .collect();
    histories.sort();
    histories
}

/// Builds the two-branch program used by the plain-branch scenarios:
///
/// ```text
/// main { if (x > 0) t = 1 else t = 0; assert(t == 0 || t == 1); }
/// ```
pub fn two_branch_program() -> Program {
    let mut pb = ProgramBuilder::new();
    let mut main = pb.function("main");
    main.at("plain.c", 1);
    let x = main.sym_input("x", Width::B32);
    let cond = main.cmp(Predicate::Sgt, x, c32(0));
    let then_b = main.block();
    let else_b = main.block();
    let join = main.block();
    main.cond_br(cond, then_b, else_b);

    main.switch_to(then_b);
    main.at("plain.c", 2);
    main.br(join);
    main.switch_to(else_b);
    main.at("plain.c", 3);
    main.br(join);

    main.switch_to(join);
    main.at("plain.c", 4);
    let t = main.phi(vec![
        (then_b, c32(1)),
        (else_b, c32(0)),
    ]);
    let is_zero = main.cmp(Predicate::Eq, t, c32(0));
    let is_one = main.cmp(Predicate::Eq, t, c32(1));
    let either = main.binary(BinOp::Or, is_zero, is_one);
    main.call_void("assert", vec![either.into()]);
    main.ret(None);
    pb.add(main);
    pb.finish()
}

/// Builds a chain of `depth` sequential symbolic branches, giving
/// `2^depth` feasible paths.
pub fn branch_chain_program(depth: usize) -> Program {
    let mut pb = ProgramBuilder::new();
    let mut main = pb.function("main");
    main.at("chain.c", 1);

    for level in 0..depth {
        let x = main.sym_input(&format!("x{level}"), Width::B8);
        let cond = main.cmp(Predicate::Ugt, x, Operand::constant(10, Width::B8));
        let then_b = main.block();
        let else_b = main.block();
        let join = main.block();
        main.cond_br(cond, then_b, else_b);
        main.switch_to(then_b);
        main.br(join);
        main.switch_to(else_b);
        main.br(join);
        main.switch_to(join);
    }
    main.ret(None);
    pb.add(main);
    pb.finish()
}

/// Builds the skip-and-recover program of the snapshot scenarios:
///
/// ```text
/// main { int *a = null; skip_fn(&a); *a = 3; assert(*a == 3); }
/// skip_fn(p) { *p = malloc(4); }
/// ```
///
/// Returns the program plus the analysis tables marking `skip_fn` as a
/// skipped side-effecting callee and the pointer load as may-blocking.
pub fn skip_and_recover_program() -> (Program, Analysis) {
    let mut pb = ProgramBuilder::new();
    let mut analysis = Analysis::new();

    let mut skip_fn = pb.function("skip_fn");
    skip_fn.at("skip.c", 10);
    let p = skip_fn.param(Width::B64);
    let m = skip_fn.call("malloc", vec![c64(4)]);
    skip_fn.store(p, m);
    skip_fn.ret(None);
    pb.add(skip_fn);

    let mut main = pb.function("main");
    main.at("skip.c", 20);
    let cell = main.alloca(8);
    let alloca_id = main.last_id();
    main.call_void("skip_fn", vec![cell.into()]);
    main.at("skip.c", 21);
    let a = main.load(cell, Width::B64);
    let load_id = main.last_id();
    main.at("skip.c", 22);
    main.store(a, c32(3));
    let v = main.load(a, Width::B32);
    let check = main.cmp(Predicate::Eq, v, c32(3));
    main.call_void("assert", vec![check.into()]);
    main.ret(None);
    pb.add(main);

    analysis.skip_function("skip_fn", vec![]);
    analysis.mark_side_effects("skip_fn");
    analysis.mark_may_block(load_id);
    analysis.add_modifier(
        AllocSite::Instruction(alloca_id),
        ModInfo {
            function: "skip_fn".into(),
            offset:   0,
        },
        1,
        "skip_fn",
    );

    (pb.finish(), analysis)
}
