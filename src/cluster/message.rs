//! This module contains the tagged message set of the master-worker
//! protocol and the fabric abstraction it travels over.

use std::{fmt::Debug, time::Duration};

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};

use crate::error::protocol::{Error, Result};

/// The identity of a node in the cluster. The master is always rank zero.
pub type Rank = usize;

/// The rank of the master node.
pub const MASTER_RANK: Rank = 0;

/// The messages of the coordination protocol.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Message {
    /// Master to worker: start executing this composite prefix.
    StartPrefixTask { prefix: String },

    /// Worker to master: the worker's frontier is exhausted.
    Finish,

    /// Master to worker: please surrender some work.
    Offload,

    /// Worker to master: the surrendered composite prefix, or [`None`]
    /// when no work could be surrendered.
    OffloadResp { prefix: Option<String> },

    /// Worker to master: the frontier grew enough to surrender work.
    ReadyToOffload,

    /// Worker to master: the frontier shrank below the surrender band.
    NotReadyToOffload,

    /// Worker to master: an error terminated a test and the halting policy
    /// fired.
    BugFound,

    /// Master to worker: terminate immediately.
    Kill,

    /// Master to worker: the global wall clock expired.
    Timeout,
}

/// The interface to a tagged point-to-point message fabric.
///
/// Workers only ever talk to the master and the master only to workers,
/// but the interface does not enforce that; it mirrors a plain
/// rank-addressed fabric.
pub trait Fabric
where
    Self: Debug + Send,
{
    /// Gets the rank of this node.
    fn rank(&self) -> Rank;

    /// Gets the number of nodes in the cluster.
    fn num_ranks(&self) -> usize;

    /// Sends `message` to the node at `to`.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the destination has disconnected.
    fn send(&self, to: Rank, message: Message) -> Result<()>;

    /// Receives the next message, blocking until one arrives.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if every peer has disconnected.
    fn recv(&self) -> Result<(Rank, Message)>;

    /// Receives the next message if one is already waiting.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if every peer has disconnected.
    fn try_recv(&self) -> Result<Option<(Rank, Message)>>;

    /// Receives the next message, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if every peer has disconnected.
    fn recv_timeout(&self, timeout: Duration) -> Result<Option<(Rank, Message)>>;
}

/// A fabric over in-process channels, connecting the master thread and
/// the worker threads of one cluster run.
#[derive(Debug)]
pub struct ChannelFabric {
    rank:    Rank,
    senders: Vec<Sender<(Rank, Message)>>,
    inbox:   Receiver<(Rank, Message)>,
}

impl ChannelFabric {
    /// Constructs a fully connected mesh of `num_ranks` fabrics, one per
    /// node, with rank zero first.
    #[must_use]
    pub fn mesh(num_ranks: usize) -> Vec<ChannelFabric> {
        let mut senders = Vec::with_capacity(num_ranks);
        let mut inboxes = Vec::with_capacity(num_ranks);
        for _ in 0..num_ranks {
            let (tx, rx) = unbounded();
            senders.push(tx);
            inboxes.push(rx);
        }
        inboxes
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| ChannelFabric {
                rank,
                senders: senders.clone(),
                inbox,
            })
            .collect()
    }
}

impl Fabric for ChannelFabric {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn num_ranks(&self) -> usize {
        self.senders.len()
    }

    fn send(&self, to: Rank, message: Message) -> Result<()> {
        self.senders
            .get(to)
            .ok_or(Error::Disconnected { rank: to })?
            .send((self.rank, message))
            .map_err(|_| Error::Disconnected { rank: to })
    }

    fn recv(&self) -> Result<(Rank, Message)> {
        self.inbox
            .recv()
            .map_err(|_| Error::Disconnected { rank: self.rank })
    }

    fn try_recv(&self) -> Result<Option<(Rank, Message)>> {
        match self.inbox.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Error::Disconnected { rank: self.rank }),
        }
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Option<(Rank, Message)>> {
        match self.inbox.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Ok(None),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                Err(Error::Disconnected { rank: self.rank })
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mesh_routes_by_rank() {
        let mut fabrics = ChannelFabric::mesh(3);
        let worker_two = fabrics.pop().expect("three fabrics");
        let worker_one = fabrics.pop().expect("two fabrics");
        let master = fabrics.pop().expect("one fabric");

        master
            .send(1, Message::Offload)
            .expect("worker one is connected");
        master
            .send(2, Message::Kill)
            .expect("worker two is connected");

        assert_eq!(
            worker_one.recv().expect("message pending"),
            (MASTER_RANK, Message::Offload)
        );
        assert_eq!(
            worker_two.recv().expect("message pending"),
            (MASTER_RANK, Message::Kill)
        );
    }

    #[test]
    fn try_recv_does_not_block() {
        let fabrics = ChannelFabric::mesh(2);
        assert_eq!(fabrics[1].try_recv().expect("connected"), None);
    }
}
