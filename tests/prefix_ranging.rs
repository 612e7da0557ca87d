//! This module is an integration test exercising prefix-guided ranging on
//! a worker: dispatched prefixes override the solver at branches, untaken
//! siblings are parked, and complementary prefixes cover exactly the
//! frontier a free exploration would.
#![cfg(test)]

use symex_cluster::{
    cluster::{ChannelFabric, Fabric, Message},
    engine::Engine,
    ir::Analysis,
    output::OutputHandler,
    watchdog::LazyWatchdog,
    Config,
};

mod common;

/// Constructs a worker engine wired to a two-node fabric, returning the
/// master-side fabric so the channel stays alive.
fn new_worker(program: symex_cluster::ir::Program) -> (Engine, ChannelFabric) {
    let mut fabrics = ChannelFabric::mesh(2);
    let worker_fabric = fabrics.pop().expect("two fabrics");
    let master_fabric = fabrics.pop().expect("one fabric");
    let engine = Engine::new(
        std::rc::Rc::new(program),
        std::rc::Rc::new(Analysis::new()),
        Config::default(),
        LazyWatchdog.in_rc(),
        OutputHandler::new(None).expect("no directory to create"),
        Some(Box::new(worker_fabric)),
        1,
    );
    (engine, master_fabric)
}

#[test]
fn a_prefix_restricts_exploration_to_its_subtree() -> anyhow::Result<()> {
    let (mut engine, _master) = new_worker(common::branch_chain_program(2));
    let root = engine.prepare("main")?;
    engine.handle_prefix_task("0", Some(root))?;
    engine.exhaust_frontier()?;

    // Two of the four paths lie under the prefix; the untaken sibling of
    // the first branch is parked, not explored.
    let histories = common::sorted_histories(&engine);
    assert_eq!(histories, vec!["00".to_owned(), "01".to_owned()]);
    Ok(())
}

#[test]
fn complementary_prefixes_cover_the_free_exploration() -> anyhow::Result<()> {
    // Free exploration of the same program, for reference.
    let mut reference = common::new_engine(
        common::branch_chain_program(2),
        Analysis::new(),
        Config::default(),
    );
    reference.run_standalone("main")?;
    let expected = common::sorted_histories(&reference);

    // A worker driven by the prefix and then by its complement.
    let (mut engine, _master) = new_worker(common::branch_chain_program(2));
    let root = engine.prepare("main")?;
    engine.handle_prefix_task("0", Some(root))?;
    engine.exhaust_frontier()?;
    // The parked sibling of the first branch resumes under the
    // complementary prefix.
    engine.handle_prefix_task("1", None)?;
    engine.exhaust_frontier()?;

    assert_eq!(common::sorted_histories(&engine), expected);
    Ok(())
}

#[test]
fn composite_prefixes_resume_each_component() -> anyhow::Result<()> {
    let (mut engine, _master) = new_worker(common::branch_chain_program(3));
    let root = engine.prepare("main")?;

    // Range down one path so siblings park at depths 0, 1 and 2.
    engine.handle_prefix_task("000", Some(root))?;
    engine.exhaust_frontier()?;
    let after_first = common::sorted_histories(&engine).len();

    // One composite dispatch resumes two of the parked siblings.
    engine.handle_prefix_task("01-0-1", None)?;
    engine.exhaust_frontier()?;

    let histories = common::sorted_histories(&engine);
    assert!(histories.len() > after_first);
    for history in &["010", "011"] {
        assert!(
            histories.iter().any(|h| h.starts_with(*history)),
            "missing paths under {history}: {histories:?}"
        );
    }
    Ok(())
}

#[test]
fn offload_requests_package_the_shortest_histories() -> anyhow::Result<()> {
    let (mut engine, master) = new_worker(common::branch_chain_program(4));
    engine.prepare("main")?;
    engine.exhaust_frontier()?;

    master.send(1, Message::Offload)?;
    engine.update_states(None)?;

    // Drain the hysteresis hints the worker sent while its frontier grew
    // and shrank; the answer to the request must be a decline, because
    // the frontier is already exhausted.
    loop {
        match master.recv()? {
            (_, Message::ReadyToOffload | Message::NotReadyToOffload) => {}
            (_, Message::OffloadResp { prefix }) => {
                assert!(prefix.is_none());
                break;
            }
            (_, other) => panic!("expected an offload response, found {other:?}"),
        }
    }
    Ok(())
}
