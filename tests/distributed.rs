//! This module is an integration test exercising the master-worker
//! protocol end to end: phase-one exploration, prefix dispatch, and the
//! kill broadcast after a configured error location is hit.
#![cfg(test)]

use std::time::Duration;

use symex_cluster::{
    cluster::run_cluster,
    expr::{Predicate, Width},
    ir::{build::ProgramBuilder, Analysis, Operand},
    Config,
};

mod common;

#[test]
fn cluster_covers_the_same_paths_as_a_standalone_run() -> anyhow::Result<()> {
    // Reference: a free standalone exploration.
    let mut reference = common::new_engine(
        common::branch_chain_program(3),
        Analysis::new(),
        Config::default(),
    );
    let summary = reference.run_standalone("main")?;
    assert_eq!(summary.tests_written, 8);

    // The same program across a master and two workers, frozen early so
    // real dispatch happens.
    let config = Config {
        exploration_depth: 4,
        ..Config::default()
    };
    let outcome = run_cluster(
        &common::branch_chain_program(3),
        &Analysis::new(),
        &config,
        "main",
        2,
        None,
        Some(Duration::from_secs(30)),
    )?;

    let total: u64 = outcome.summaries.iter().map(|s| s.tests_written).sum();
    assert_eq!(total, 8, "summaries: {:?}", outcome.summaries);
    assert!(!outcome.bug_found);
    Ok(())
}

#[test]
fn small_programs_complete_within_the_master_phase() -> anyhow::Result<()> {
    // The frontier never reaches the bound, so the master finishes the
    // whole search itself and the workers are killed without work.
    let config = Config {
        exploration_depth: 64,
        ..Config::default()
    };
    let outcome = run_cluster(
        &common::two_branch_program(),
        &Analysis::new(),
        &config,
        "main",
        2,
        None,
        Some(Duration::from_secs(30)),
    )?;

    let total: u64 = outcome.summaries.iter().map(|s| s.tests_written).sum();
    assert_eq!(total, 2);
    Ok(())
}

#[test]
fn error_location_hit_stops_every_worker() -> anyhow::Result<()> {
    // An abort at bad.c:42 reachable on one side of a symbolic branch.
    let mut pb = ProgramBuilder::new();
    let mut main = pb.function("main");
    main.at("bad.c", 40);
    let x = main.sym_input("x", Width::B32);
    let cond = main.cmp(Predicate::Sgt, x, Operand::constant(0, Width::B32));
    let bad = main.block();
    let good = main.block();
    main.cond_br(cond, bad, good);
    main.switch_to(bad);
    main.at("bad.c", 42);
    main.call_void("abort", vec![]);
    main.unreachable();
    main.switch_to(good);
    main.at("bad.c", 44);
    main.ret(None);
    pb.add(main);
    let program = pb.finish();

    let mut config = Config::default();
    config
        .error_locations
        .insert("bad.c".to_owned(), vec![42]);
    config.exploration_depth = 1;

    let outcome = run_cluster(
        &program,
        &Analysis::new(),
        &config,
        "main",
        2,
        None,
        Some(Duration::from_secs(30)),
    )?;

    assert!(outcome.bug_found);
    let errors: u64 = outcome.summaries.iter().map(|s| s.errors_written).sum();
    assert!(errors >= 1, "summaries: {:?}", outcome.summaries);
    Ok(())
}

#[test]
fn the_wall_clock_budget_kills_a_runaway_search() -> anyhow::Result<()> {
    // An endless allocation loop cannot finish; only the timeout stops
    // it.
    let mut pb = ProgramBuilder::new();
    let mut main = pb.function("main");
    main.at("spin.c", 1);
    let body = main.block();
    main.br(body);
    main.switch_to(body);
    main.call("malloc", vec![symex_cluster::ir::build::c64(16)]);
    main.br(body);
    pb.add(main);
    let program = pb.finish();

    let config = Config {
        exploration_depth: 2,
        ..Config::default()
    };
    let outcome = run_cluster(
        &program,
        &Analysis::new(),
        &config,
        "main",
        1,
        None,
        Some(Duration::from_millis(300)),
    )?;

    // The run ends; whatever was in flight was dumped or discarded.
    assert!(!outcome.summaries.is_empty());
    Ok(())
}
