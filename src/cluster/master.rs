//! This module contains the cluster driver: the master's bounded
//! exploration and dispatch loop, the worker run loop, and the plumbing
//! that wires one engine per node over an in-process fabric.

use std::{
    path::PathBuf,
    thread,
    time::{Duration, Instant},
};

use rustc_hash::FxHashSet;
use tracing::{debug, info, warn};

use crate::{
    cluster::message::{ChannelFabric, Fabric, Message, Rank},
    config::Config,
    engine::{Engine, RunSummary},
    error::{protocol, Error, Result},
    ir::{Analysis, Program},
    output::OutputHandler,
    watchdog::{DeadlineWatchdog, DynWatchdog, LazyWatchdog},
};

/// The outcome of a cluster run.
#[derive(Clone, Debug)]
pub struct ClusterOutcome {
    /// The master's summary, then one per worker in rank order.
    pub summaries: Vec<RunSummary>,

    /// Whether any node observed an exit-on error.
    pub bug_found: bool,
}

/// How long the master waits in one receive before re-checking the wall
/// clock.
const MASTER_POLL: Duration = Duration::from_millis(50);

/// Runs a full cluster exploration of `entry`: the master explores up to
/// its phase-one bound, hands the frontier to `num_workers` workers as
/// prefix ranges, and balances load between them until every range is
/// done.
///
/// # Errors
///
/// Returns [`Err`] on fatal failures of the master or any worker.
pub fn run_cluster(
    program: &Program,
    analysis: &Analysis,
    config: &Config,
    entry: &str,
    num_workers: usize,
    output_dir: Option<PathBuf>,
    time_budget: Option<Duration>,
) -> Result<ClusterOutcome> {
    assert!(num_workers >= 1, "a cluster needs at least one worker");
    let num_ranks = num_workers + 1;
    let mut fabrics = ChannelFabric::mesh(num_ranks);
    let master_fabric = fabrics.remove(0);

    let mut handles = Vec::with_capacity(num_workers);
    for fabric in fabrics {
        let rank = fabric.rank();
        let program = program.clone();
        let analysis = analysis.clone();
        let mut config = config.clone();
        if config.exploration_depth == 0 {
            config.exploration_depth = default_exploration_bound(num_workers);
        }
        let worker_dir = output_dir
            .as_ref()
            .map(|dir| dir.join(format!("worker-{rank}")));
        let entry = entry.to_owned();

        // Workers watch the wall clock too, with slack past the master's
        // deadline, so a lost timeout broadcast cannot leave them
        // spinning.
        let worker_budget = time_budget.map(|budget| budget + Duration::from_secs(2));
        handles.push(
            thread::Builder::new()
                .name(format!("symex-worker-{rank}"))
                .spawn(move || -> Result<RunSummary> {
                    let outputs = OutputHandler::new(worker_dir)?;
                    let mut engine = Engine::new(
                        std::rc::Rc::new(program),
                        std::rc::Rc::new(analysis),
                        config,
                        budget_watchdog(worker_budget),
                        outputs,
                        Some(Box::new(fabric)),
                        rank as u64,
                    );
                    worker_loop(&mut engine, &entry)
                })
                .expect("worker threads can be spawned"),
        );
    }

    let mut master_config = config.clone();
    if master_config.exploration_depth == 0 {
        master_config.exploration_depth = default_exploration_bound(num_workers);
    }
    let master_dir = output_dir.as_ref().map(|dir| dir.join("master"));
    let outputs = OutputHandler::new(master_dir)?;
    let mut master = Engine::new(
        std::rc::Rc::new(program.clone()),
        std::rc::Rc::new(analysis.clone()),
        master_config,
        budget_watchdog(time_budget),
        outputs,
        Some(Box::new(master_fabric)),
        0,
    );

    // Phase one: the master alone explores until the bound freezes it.
    master.prepare(entry)?;
    master.exhaust_frontier()?;
    let work_list = master.collect_work_list();
    info!(entries = work_list.len(), "phase one complete, dispatching");

    let master_summary = dispatch_loop(&mut master, work_list, num_workers, time_budget)?;

    let mut summaries = vec![master_summary];
    let mut bug_found = master.bug_found();
    for handle in handles {
        let summary = handle
            .join()
            .map_err(|_| {
                Error::Protocol(protocol::Error::Disconnected { rank: usize::MAX })
            })??;
        bug_found |= summary.bug_found;
        summaries.push(summary);
    }

    Ok(ClusterOutcome {
        summaries,
        bug_found,
    })
}

/// The default phase-one bound when the configuration leaves it unset:
/// a few frontier entries per worker keeps everyone busy from the first
/// round of dispatches.
fn default_exploration_bound(num_workers: usize) -> usize {
    num_workers * 4
}

fn budget_watchdog(budget: Option<Duration>) -> DynWatchdog {
    match budget {
        Some(budget) => DeadlineWatchdog::new(budget).in_rc(),
        None => LazyWatchdog.in_rc(),
    }
}

/// The worker's outer loop: wait for a task, drain the frontier, report
/// back, repeat until told to stop.
fn worker_loop(engine: &mut Engine, entry: &str) -> Result<RunSummary> {
    let root = engine.prepare(entry)?;
    let mut fallback = Some(root);
    let mut worked = false;

    loop {
        if !engine.worker_wait_for_task(fallback)? {
            break;
        }
        // The root state only backs the very first dispatch; afterwards
        // resumption always goes through the suspended pool.
        fallback = None;
        worked = true;

        if !engine.halted() {
            engine.exhaust_frontier()?;
        }
        if engine.halted_by_master() {
            break;
        }
        // A locally halted worker (the error-location policy fired) keeps
        // answering the master until the kill arrives.
        engine.worker_notify_finished()?;
    }

    // A worker that never received work has nothing worth dumping; its
    // pristine root state is not a discovered path.
    if worked && engine.dump_states_on_halt() {
        engine.dump_remaining_states()?;
    }
    engine.finish()
}

/// The master's dispatch loop.
fn dispatch_loop(
    master: &mut Engine,
    work_list: Vec<String>,
    num_workers: usize,
    time_budget: Option<Duration>,
) -> Result<RunSummary> {
    let deadline = time_budget.map(|budget| Instant::now() + budget);
    let mut queue: Vec<String> = work_list;
    queue.reverse();
    let mut idle: Vec<Rank> = (1..=num_workers).collect();
    let mut ready: FxHashSet<Rank> = FxHashSet::default();
    let mut pending_offload: Option<(Rank, Rank)> = None;
    let mut killed = false;

    loop {
        // Hand queued ranges to idle workers.
        while let (Some(_), false) = (queue.last(), idle.is_empty()) {
            let worker = idle.remove(0);
            let prefix = queue.pop().expect("queue non-empty");
            debug!(worker, %prefix, "dispatching range");
            master.send_to(worker, Message::StartPrefixTask { prefix })?;
        }

        // With nothing queued, try to broker an offload from a willing
        // worker to an idle one.
        if queue.is_empty() && pending_offload.is_none() && !idle.is_empty() {
            let target = idle[0];
            if let Some(source) = ready.iter().copied().find(|rank| !idle.contains(rank)) {
                debug!(source, target, "requesting offload");
                master.send_to(source, Message::Offload)?;
                pending_offload = Some((source, target));
            } else if idle.len() == num_workers {
                // Everyone is idle and nothing is queued: the search is
                // complete.
                break;
            }
        }

        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                warn!("global wall clock expired, stopping all workers");
                master.broadcast(Message::Timeout, num_workers)?;
                killed = true;
                break;
            }
        }

        let Some((from, message)) = master.recv_from_workers(MASTER_POLL)? else {
            continue;
        };
        match message {
            Message::Finish => {
                debug!(worker = from, "worker finished its range");
                ready.remove(&from);
                if !idle.contains(&from) {
                    idle.push(from);
                }
            }
            Message::ReadyToOffload => {
                ready.insert(from);
            }
            Message::NotReadyToOffload => {
                ready.remove(&from);
            }
            Message::OffloadResp { prefix } => {
                let Some((source, target)) = pending_offload.take() else {
                    warn!(worker = from, "unsolicited offload response");
                    continue;
                };
                match prefix {
                    Some(prefix) => {
                        debug!(source, target, %prefix, "forwarding offloaded range");
                        idle.retain(|rank| *rank != target);
                        master.send_to(target, Message::StartPrefixTask { prefix })?;
                    }
                    None => {
                        debug!(source, "offload declined");
                        ready.remove(&source);
                    }
                }
            }
            Message::BugFound => {
                info!(worker = from, "bug reported, stopping all workers");
                master.note_remote_bug();
                master.broadcast(Message::Kill, num_workers)?;
                killed = true;
                break;
            }
            other => {
                return Err(Error::Protocol(protocol::Error::UnexpectedMessage {
                    what: format!("{other:?} at the master"),
                }))
            }
        }
    }

    if !killed {
        master.broadcast(Message::Kill, num_workers)?;
    }
    master.finish()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_bound_scales_with_workers() {
        assert_eq!(default_exploration_bound(1), 4);
        assert!(default_exploration_bound(8) >= 8);
    }
}
