//! Boundary types: cluster membership, the outbound transport and the agent hook.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::db::{Epoch, QuiesceDbListing, QuiesceMap, Rank, Version};

/// Failure to hand a payload to a peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("no membership applied")]
    NoMembership,
    #[error("rank {0} is unknown to the transport")]
    UnknownRank(Rank),
    #[error("rank {0} is disconnected")]
    Disconnected(Rank),
    #[error("rank {rank} rejected the payload (errno {errno})")]
    Rejected { rank: Rank, errno: i32 },
    #[error("payload codec failure: {0}")]
    Codec(String),
}

/// Outbound side of replication.
///
/// Implementations deliver asynchronously or synchronously; they must not call
/// back into the sending manager's coordinator thread.
pub trait QuiesceTransport: Send + Sync {
    /// Send this rank's acknowledgment to the leader.
    fn send_ack(&self, ack: QuiesceMap) -> Result<(), TransportError>;

    /// Send a listing to `to` (leader only).
    fn send_listing_to(&self, to: Rank, listing: QuiesceDbListing) -> Result<(), TransportError>;
}

/// A membership generation as published by the cluster.
#[derive(Clone)]
pub struct ClusterMembership {
    pub epoch: Epoch,
    pub me: Rank,
    pub leader: Rank,
    pub members: BTreeSet<Rank>,
    /// Numeric id of the filesystem; accepted as a root authority.
    pub fs_id: u64,
    /// Name of the filesystem; accepted as a root authority.
    pub fs_name: String,
    pub transport: Arc<dyn QuiesceTransport>,
}

impl ClusterMembership {
    pub fn is_leader(&self) -> bool {
        self.leader == self.me
    }

    pub fn includes_me(&self) -> bool {
        self.members.contains(&self.me)
    }
}

impl fmt::Debug for ClusterMembership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterMembership")
            .field("epoch", &self.epoch)
            .field("me", &self.me)
            .field("leader", &self.leader)
            .field("members", &self.members)
            .field("fs_id", &self.fs_id)
            .field("fs_name", &self.fs_name)
            .finish_non_exhaustive()
    }
}

/// Hook into the agent that performs the actual freeze.
///
/// `notify` receives the quiesce map for the current db version and may edit it
/// into this rank's acknowledgment. Returning true sends the (edited) map to the
/// leader. It is called at most once per db version above `if_newer`.
pub struct AgentCallback {
    pub notify: Box<dyn FnMut(&mut QuiesceMap) -> bool + Send>,
    pub if_newer: Version,
}

impl AgentCallback {
    pub fn new(notify: impl FnMut(&mut QuiesceMap) -> bool + Send + 'static) -> Self {
        AgentCallback {
            notify: Box::new(notify),
            if_newer: 0,
        }
    }
}

impl fmt::Debug for AgentCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentCallback").field("if_newer", &self.if_newer).finish_non_exhaustive()
    }
}
