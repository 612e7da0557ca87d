//! This module contains the distributed coordination layer: the message
//! fabric between the master and its workers, the composite-prefix
//! encoding that work packages travel as, the radix tree indexing
//! suspended ranging states, and the master's dispatch loop.

pub mod master;
pub mod message;
pub mod prefix;
pub mod prefix_tree;

pub use master::{run_cluster, ClusterOutcome};
pub use message::{ChannelFabric, Fabric, Message, Rank, MASTER_RANK};
pub use prefix_tree::PrefixTree;
