//! This module is an integration test exercising the memory cap: a state
//! allocating in a loop is killed once the worker's estimated usage blows
//! past the cap.
#![cfg(test)]

use symex_cluster::{
    ir::{build::c64, build::ProgramBuilder, Analysis},
    Config,
};

mod common;

#[test]
fn the_memory_cap_kills_allocating_states() -> anyhow::Result<()> {
    let mut pb = ProgramBuilder::new();
    let mut main = pb.function("main");
    main.at("hog.c", 1);
    let body = main.block();
    main.br(body);
    main.switch_to(body);
    main.call("malloc", vec![c64(16 << 20)]);
    main.br(body);
    pb.add(main);

    let config = Config {
        max_memory_mb: 1,
        memory_check_interval: 8,
        ..Config::default()
    };
    let mut engine = common::new_engine(pb.finish(), Analysis::new(), config);
    let summary = engine.run_standalone("main")?;

    // The only state was killed over the cap; it left an `.early` case
    // and nothing survives.
    assert_eq!(summary.stats.terminated, 1);
    assert!(engine.graph().is_empty());
    let early = engine
        .outputs()
        .tests()
        .iter()
        .find(|t| t.suffix.as_deref() == Some("early"))
        .expect("the killed state leaves an early case");
    assert!(early.objects.is_empty());

    // The survivors rule: nothing suspended or mid-recovery was killed.
    assert!(engine
        .graph()
        .states()
        .all(|s| !s.is_suspended() && !s.kind.is_recovery()));
    Ok(())
}
