//! This module is an integration test exercising the snapshot/recovery
//! protocol: skipped side-effecting calls, blocking loads, lazy slice
//! re-execution, and the write-back into the suspended state.
#![cfg(test)]

use symex_cluster::{
    expr::{Predicate, Width},
    ir::{
        build::{c32, c64, ProgramBuilder},
        AllocSite,
        Analysis,
        ModInfo,
    },
    Config,
};

mod common;

#[test]
fn skip_and_recover_round_trips_the_skipped_write() -> anyhow::Result<()> {
    let (program, analysis) = common::skip_and_recover_program();
    let mut engine = common::new_engine(program, analysis, Config::default());
    let summary = engine.run_standalone("main")?;

    // One terminated path, one snapshot, one recovery state, and the
    // assertion on the recovered value held.
    assert_eq!(summary.tests_written, 1);
    assert_eq!(summary.errors_written, 0);
    assert_eq!(summary.stats.snapshots, 1);
    assert_eq!(summary.stats.recovery_states, 1);
    assert!(!summary.bug_found);
    Ok(())
}

#[test]
fn side_effect_free_skips_take_no_snapshot() -> anyhow::Result<()> {
    let mut pb = ProgramBuilder::new();
    let mut analysis = Analysis::new();

    let mut logger = pb.function("log_call");
    logger.at("skip.c", 5);
    logger.ret(None);
    pb.add(logger);

    let mut main = pb.function("main");
    main.at("skip.c", 20);
    main.call_void("log_call", vec![]);
    main.ret(None);
    pb.add(main);

    analysis.skip_function("log_call", vec![]);
    // No side effects registered: the call is dropped silently.

    let mut engine = common::new_engine(pb.finish(), analysis, Config::default());
    let summary = engine.run_standalone("main")?;

    assert_eq!(summary.tests_written, 1);
    assert_eq!(summary.stats.snapshots, 0);
    assert_eq!(summary.stats.recovery_states, 0);
    Ok(())
}

#[test]
fn repeated_blocking_loads_reuse_the_recovery_cache() -> anyhow::Result<()> {
    // As the skip-and-recover program, but the pointer cell is read twice
    // before use; the second read must not spawn another recovery.
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
    let first = main.load(cell, Width::B64);
    let first_load_id = main.last_id();
    let second = main.load(cell, Width::B64);
    let second_load_id = main.last_id();
    let same = main.cmp(Predicate::Eq, first, second);
    main.call_void("assert", vec![same.into()]);
    main.store(second, c32(3));
    main.ret(None);
    pb.add(main);

    analysis.skip_function("skip_fn", vec![]);
    analysis.mark_side_effects("skip_fn");
    analysis.mark_may_block(first_load_id);
    analysis.mark_may_block(second_load_id);
    analysis.add_modifier(
        AllocSite::Instruction(alloca_id),
        ModInfo {
            function: "skip_fn".into(),
            offset:   0,
        },
        1,
        "skip_fn",
    );

    let mut engine = common::new_engine(pb.finish(), analysis, Config::default());
    let summary = engine.run_standalone("main")?;

    assert_eq!(summary.tests_written, 1);
    assert_eq!(summary.errors_written, 0);
    assert_eq!(summary.stats.snapshots, 1);
    // A single recovery serviced both loads.
    assert_eq!(summary.stats.recovery_states, 1);
    Ok(())
}

#[test]
fn overwritten_locations_do_not_trigger_recovery() -> anyhow::Result<()> {
    // The program overwrites the cell after the skipped call, so the
    // later load must see the overwrite and never recover.
    let mut pb = ProgramBuilder::new();
    let mut analysis = Analysis::new();

    let mut skip_fn = pb.function("skip_fn");
    skip_fn.at("skip.c", 10);
    let p = skip_fn.param(Width::B64);
    skip_fn.store(p, c64(0xdead));
    skip_fn.ret(None);
    pb.add(skip_fn);

    let mut main = pb.function("main");
    main.at("skip.c", 20);
    let cell = main.alloca(8);
    let alloca_id = main.last_id();
    main.call_void("skip_fn", vec![cell.into()]);
    main.store(cell, c64(0x1000));
    let store_id = main.last_id();
    let value = main.load(cell, Width::B64);
    let load_id = main.last_id();
    let check = main.cmp(Predicate::Eq, value, c64(0x1000));
    main.call_void("assert", vec![check.into()]);
    main.ret(None);
    pb.add(main);

    analysis.skip_function("skip_fn", vec![]);
    analysis.mark_side_effects("skip_fn");
    analysis.mark_may_block(load_id);
    analysis.mark_may_override(store_id);
    analysis.add_modifier(
        AllocSite::Instruction(alloca_id),
        ModInfo {
            function: "skip_fn".into(),
            offset:   0,
        },
        1,
        "skip_fn",
    );

    let mut engine = common::new_engine(pb.finish(), analysis, Config::default());
    let summary = engine.run_standalone("main")?;

    assert_eq!(summary.tests_written, 1);
    assert_eq!(summary.errors_written, 0);
    assert_eq!(summary.stats.snapshots, 1);
    assert_eq!(summary.stats.recovery_states, 0);
    Ok(())
}

#[test]
fn chained_snapshots_recover_in_order() -> anyhow::Result<()> {
    // Two skipped calls write the same cell; the blocking load needs the
    // later value, which requires replaying both slices in snapshot
    // order.
    let mut pb = ProgramBuilder::new();
    let mut analysis = Analysis::new();

    for (name, value) in [("first_fn", 0x1111u64), ("second_fn", 0x2222u64)] {
        let mut f = pb.function(name);
        f.at("skip.c", 10);
        let p = f.param(Width::B64);
        f.store(p, c64(value));
        f.ret(None);
        pb.add(f);
    }

    let mut main = pb.function("main");
    main.at("skip.c", 20);
    let cell = main.alloca(8);
    let alloca_id = main.last_id();
    main.call_void("first_fn", vec![cell.into()]);
    main.call_void("second_fn", vec![cell.into()]);
    let value = main.load(cell, Width::B64);
    let load_id = main.last_id();
    let check = main.cmp(Predicate::Eq, value, c64(0x2222));
    main.call_void("assert", vec![check.into()]);
    main.ret(None);
    pb.add(main);

    for (slice, name) in [(1u32, "first_fn"), (2, "second_fn")] {
        analysis.skip_function(name, vec![]);
        analysis.mark_side_effects(name);
        analysis.add_modifier(
            AllocSite::Instruction(alloca_id),
            ModInfo {
                function: name.into(),
                offset:   0,
            },
            slice,
            name,
        );
    }
    analysis.mark_may_block(load_id);

    let mut engine = common::new_engine(pb.finish(), analysis, Config::default());
    let summary = engine.run_standalone("main")?;

    assert_eq!(summary.tests_written, 1);
    assert_eq!(summary.errors_written, 0, "the later write must win");
    assert_eq!(summary.stats.snapshots, 2);
    assert_eq!(summary.stats.recovery_states, 2);
    Ok(())
}
