//! This module contains the type definitions necessary to support halting
//! a running engine from the outside.
//!
//! # Best-Effort Monitoring
//!
//! Note that the monitoring provided by the watchdog is a best-effort
//! approach. The engine polls it between instruction steps, so a stop
//! request takes effect at the next poll, not instantly. In the
//! distributed setting the master's kill and timeout broadcasts ride on
//! the same mechanism: the worker flips its watchdog flag when the message
//! arrives and the run loop drains at the next poll.

use std::{
    fmt::Debug,
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::constant::DEFAULT_WATCHDOG_POLL_LOOP_ITERATIONS;

/// A dynamically dispatched [`Watchdog`] instance.
pub type DynWatchdog = Rc<dyn Watchdog>;

/// The interface to an object that can be polled to see if the engine
/// needs to abort its run.
///
/// The interface is simple, but it can encapsulate arbitrary logic as far
/// as the engine is concerned, allowing the client to implement complex
/// stop logic.
pub trait Watchdog
where
    Self: Debug,
{
    /// Checks if the engine should halt its run.
    #[must_use]
    fn should_stop(&self) -> bool;

    /// Gets the number of loop iterations the engine should wait before
    /// polling the watchdog.
    #[must_use]
    fn poll_every(&self) -> usize;
}

/// An implementation of the [`Watchdog`] trait that does not place any
/// restrictions on the execution of the engine.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LazyWatchdog;

impl LazyWatchdog {
    /// Wraps `self` into an [`Rc`].
    #[must_use]
    pub fn in_rc(self) -> DynWatchdog {
        Rc::new(self)
    }
}

impl Watchdog for LazyWatchdog {
    fn should_stop(&self) -> bool {
        false
    }

    fn poll_every(&self) -> usize {
        // Something ridiculously huge so it basically never gets checked.
        1_000_000_000_000
    }
}

/// A watchdog that tells the engine when to stop based on a flag in the
/// form of an atomic boolean.
///
/// By default, it requests that the engine poll for watchdog status every
/// [`DEFAULT_WATCHDOG_POLL_LOOP_ITERATIONS`]. This is configurable by
/// calling [`Self::polling_every`].
#[derive(Clone, Debug)]
pub struct FlagWatchdog {
    /// The flag that should be mutated externally to stop the engine by
    /// this watchdog.
    flag: Arc<AtomicBool>,

    /// The number of loop iterations the engine should wait before
    /// polling the watchdog.
    poll_loop_iterations: usize,
}

impl FlagWatchdog {
    /// Constructs a new `FlagWatchdog` wrapping the provided `flag`.
    #[must_use]
    pub fn new(flag: Arc<AtomicBool>) -> Self {
        let poll_loop_iterations = DEFAULT_WATCHDOG_POLL_LOOP_ITERATIONS;
        Self {
            flag,
            poll_loop_iterations,
        }
    }

    /// Specifies the number of loop iterations that the engine should wait
    /// before polling the watchdog for status.
    #[must_use]
    pub fn polling_every(mut self, iterations: usize) -> Self {
        self.poll_loop_iterations = iterations;
        self
    }

    /// Wraps the watchdog into an [`Rc`].
    #[must_use]
    pub fn in_rc(self) -> DynWatchdog {
        Rc::new(self)
    }
}

impl Watchdog for FlagWatchdog {
    fn should_stop(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    fn poll_every(&self) -> usize {
        self.poll_loop_iterations
    }
}

/// A watchdog that stops the engine once a wall-clock budget has elapsed.
#[derive(Clone, Debug)]
pub struct DeadlineWatchdog {
    deadline:             Instant,
    poll_loop_iterations: usize,
}

impl DeadlineWatchdog {
    /// Constructs a watchdog that stops the engine `budget` from now.
    #[must_use]
    pub fn new(budget: Duration) -> Self {
        Self {
            deadline:             Instant::now() + budget,
            poll_loop_iterations: DEFAULT_WATCHDOG_POLL_LOOP_ITERATIONS,
        }
    }

    /// Wraps the watchdog into an [`Rc`].
    #[must_use]
    pub fn in_rc(self) -> DynWatchdog {
        Rc::new(self)
    }
}

impl Watchdog for DeadlineWatchdog {
    fn should_stop(&self) -> bool {
        Instant::now() >= self.deadline
    }

    fn poll_every(&self) -> usize {
        self.poll_loop_iterations
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn flag_watchdog_follows_its_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let watchdog = FlagWatchdog::new(flag.clone());
        assert!(!watchdog.should_stop());

        flag.store(true, Ordering::Relaxed);
        assert!(watchdog.should_stop());
    }

    #[test]
    fn deadline_watchdog_expires() {
        let watchdog = DeadlineWatchdog::new(Duration::from_secs(0));
        assert!(watchdog.should_stop());
    }
}
