//! This module is an integration test exercising plain path exploration:
//! symbolic branches, multi-way switches, and the branch-history
//! bookkeeping they leave behind.
#![cfg(test)]

use symex_cluster::{
    expr::{Predicate, Width},
    ir::{build::ProgramBuilder, Analysis, Operand},
    Config,
};

mod common;

#[test]
fn plain_branch_terminates_two_paths() -> anyhow::Result<()> {
    let mut engine = common::new_engine(
        common::two_branch_program(),
        Analysis::new(),
        Config::default(),
    );
    let summary = engine.run_standalone("main")?;

    assert_eq!(summary.tests_written, 2);
    assert_eq!(summary.errors_written, 0);
    assert_eq!(summary.stats.snapshots, 0);
    assert!(!summary.bug_found);

    // One forked branch event per path, nothing else.
    let histories = common::sorted_histories(&engine);
    assert_eq!(histories, vec!["0".to_owned(), "1".to_owned()]);
    Ok(())
}

#[test]
fn switch_with_default_covers_four_cases() -> anyhow::Result<()> {
    let mut pb = ProgramBuilder::new();
    let mut main = pb.function("main");
    main.at("switch.c", 1);
    let x = main.sym_input("x", Width::B32);
    let case0 = main.block();
    let case1 = main.block();
    let case2 = main.block();
    let default = main.block();
    main.switch(x, vec![(0, case0), (1, case1), (2, case2)], default);
    for block in [case0, case1, case2, default] {
        main.switch_to(block);
        main.ret(None);
    }
    pb.add(main);

    let mut engine = common::new_engine(pb.finish(), Analysis::new(), Config::default());
    let summary = engine.run_standalone("main")?;

    assert_eq!(summary.tests_written, 4);
    assert_eq!(summary.errors_written, 0);

    // Four distinct leaf strings, and the generated inputs must actually
    // hit four distinct cases.
    let histories = common::sorted_histories(&engine);
    assert_eq!(histories.len(), 4);
    let distinct: std::collections::HashSet<&String> = histories.iter().collect();
    assert_eq!(distinct.len(), 4);

    let mut hit = std::collections::HashSet::new();
    for test in engine.outputs().tests() {
        let object = test.objects.first().expect("switch input is symbolic");
        let mut value = [0u8; 8];
        value[..object.bytes.len()].copy_from_slice(&object.bytes);
        let value = u64::from_le_bytes(value);
        hit.insert(value.min(3));
    }
    assert_eq!(hit.len(), 4, "inputs {hit:?} do not cover all cases");
    Ok(())
}

#[test]
fn infeasible_branches_are_not_explored() -> anyhow::Result<()> {
    let mut pb = ProgramBuilder::new();
    let mut main = pb.function("main");
    main.at("dead.c", 1);
    let x = main.sym_input("x", Width::B8);
    let gt = main.cmp(Predicate::Ugt, x, Operand::constant(100, Width::B8));
    let then_b = main.block();
    let else_b = main.block();
    main.cond_br(gt, then_b, else_b);

    // Inside the true branch, x > 100 makes x < 50 unsatisfiable.
    main.switch_to(then_b);
    let lt = main.cmp(Predicate::Ult, x, Operand::constant(50, Width::B8));
    let dead = main.block();
    let live = main.block();
    main.cond_br(lt, dead, live);
    main.switch_to(dead);
    main.call_void("abort", vec![]);
    main.unreachable();
    main.switch_to(live);
    main.ret(None);

    main.switch_to(else_b);
    main.ret(None);
    pb.add(main);

    let mut engine = common::new_engine(pb.finish(), Analysis::new(), Config::default());
    let summary = engine.run_standalone("main")?;

    // The abort path is infeasible: two clean paths, no error cases.
    assert_eq!(summary.tests_written, 2);
    assert_eq!(summary.errors_written, 0);

    // The inner branch was decided without forking, so the true path
    // records a taken-without-fork digit.
    let histories = common::sorted_histories(&engine);
    assert!(histories.contains(&"03".to_owned()), "histories: {histories:?}");
    Ok(())
}

#[test]
fn assertion_failures_emit_error_cases() -> anyhow::Result<()> {
    let mut pb = ProgramBuilder::new();
    let mut main = pb.function("main");
    main.at("bad.c", 42);
    let x = main.sym_input("x", Width::B8);
    let ok = main.cmp(Predicate::Ult, x, Operand::constant(10, Width::B8));
    main.call_void("assert", vec![ok.into()]);
    main.ret(None);
    pb.add(main);

    let mut engine = common::new_engine(pb.finish(), Analysis::new(), Config::default());
    let summary = engine.run_standalone("main")?;

    assert_eq!(summary.errors_written, 1);
    assert!(summary.bug_found);

    // The failing input really violates the assertion.
    let error_case = engine
        .outputs()
        .tests()
        .iter()
        .find(|t| t.suffix.as_deref() == Some("assert.err"))
        .expect("an assert case was written");
    let object = error_case.objects.first().expect("input is symbolic");
    assert!(object.bytes[0] >= 10);
    Ok(())
}

#[test]
fn the_instruction_budget_halts_the_run() -> anyhow::Result<()> {
    let config = Config {
        stop_after_n_instructions: 16,
        ..Config::default()
    };
    let mut engine = common::new_engine(common::branch_chain_program(8), Analysis::new(), config);
    let summary = engine.run_standalone("main")?;

    // The run halted early and dumped the frontier as early cases.
    assert!(summary.stats.instructions <= 32);
    assert!(engine
        .outputs()
        .tests()
        .iter()
        .any(|t| t.suffix.as_deref() == Some("early")));
    Ok(())
}
