//! Simulated quiesce cluster.
//!
//! N managers sharing one [`InProcessNetwork`], with helpers to publish
//! membership and an agent that "freezes" instantly.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::QuiesceDbConfig;
use crate::db::{Epoch, QuiesceClock, QuiesceState, Rank, SystemClock};
use crate::manager::{AgentCallback, ClusterMembership, QuiesceDbManager};
use crate::net::InProcessNetwork;

pub const SIM_FS_NAME: &str = "cephfs";
pub const SIM_FS_ID: u64 = 1;

/// An agent that reports every quiescing root as quiesced and every releasing
/// root as released the moment it hears about it.
#[derive(Debug, Clone, Default)]
pub struct InstantAgent {
    notifications: Arc<AtomicU64>,
}

impl InstantAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Times any callback made by this agent was invoked.
    pub fn notifications(&self) -> u64 {
        self.notifications.load(Ordering::Relaxed)
    }

    pub fn callback(&self) -> AgentCallback {
        let notifications = Arc::clone(&self.notifications);
        AgentCallback::new(move |map| {
            notifications.fetch_add(1, Ordering::Relaxed);
            for info in map.roots.values_mut() {
                info.state = match info.state {
                    QuiesceState::Quiescing => QuiesceState::Quiesced,
                    QuiesceState::Releasing => QuiesceState::Released,
                    other => other,
                };
            }
            true
        })
    }
}

/// A set of managers wired to one network.
pub struct SimCluster {
    network: Arc<InProcessNetwork>,
    managers: BTreeMap<Rank, Arc<QuiesceDbManager>>,
    epoch: Epoch,
    leader: Option<Rank>,
}

impl SimCluster {
    /// `size` ranks numbered from 0, on the system clock. Nothing runs until
    /// a membership is published.
    pub fn new(size: u32, config: QuiesceDbConfig) -> Self {
        Self::with_clock(size, Arc::new(SystemClock), config)
    }

    pub fn with_clock(size: u32, clock: Arc<dyn QuiesceClock>, config: QuiesceDbConfig) -> Self {
        let network = InProcessNetwork::new();
        let mut managers = BTreeMap::new();
        for rank in 0..size {
            let manager = Arc::new(QuiesceDbManager::new(Arc::clone(&clock), config));
            network.register(rank, &manager);
            managers.insert(rank, manager);
        }
        SimCluster {
            network,
            managers,
            epoch: 0,
            leader: None,
        }
    }

    pub fn network(&self) -> &Arc<InProcessNetwork> {
        &self.network
    }

    pub fn manager(&self, rank: Rank) -> Option<&Arc<QuiesceDbManager>> {
        self.managers.get(&rank)
    }

    pub fn leader(&self) -> Option<&Arc<QuiesceDbManager>> {
        self.leader.and_then(|rank| self.managers.get(&rank))
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn ranks(&self) -> impl Iterator<Item = Rank> + '_ {
        self.managers.keys().copied()
    }

    /// Publish a membership of every rank, led by `leader`.
    pub fn start(&mut self, leader: Rank) {
        let members: Vec<Rank> = self.ranks().collect();
        self.publish(leader, &members);
    }

    /// Publish a new epoch to every rank. Ranks outside `members` stop.
    pub fn publish(&mut self, leader: Rank, members: &[Rank]) {
        self.epoch += 1;
        self.leader = Some(leader);
        let members: BTreeSet<Rank> = members.iter().copied().collect();
        tracing::info!(epoch = self.epoch, leader, ?members, "publishing membership");

        for (&rank, manager) in &self.managers {
            manager.update_membership(ClusterMembership {
                epoch: self.epoch,
                me: rank,
                leader,
                members: members.clone(),
                fs_id: SIM_FS_ID,
                fs_name: SIM_FS_NAME.to_string(),
                transport: Arc::new(self.network.transport(rank, leader)),
            });
        }
    }

    /// Register `agent` on every rank.
    pub fn attach_agent(&self, agent: &InstantAgent) {
        for manager in self.managers.values() {
            manager.reset_agent_callback(Some(agent.callback()));
        }
    }

    /// Register `agent` on one rank only.
    pub fn attach_agent_to(&self, rank: Rank, agent: &InstantAgent) {
        if let Some(manager) = self.managers.get(&rank) {
            manager.reset_agent_callback(Some(agent.callback()));
        }
    }

    pub fn shutdown(&self) {
        for manager in self.managers.values() {
            manager.shutdown();
        }
    }
}

impl Drop for SimCluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::db::{QuiesceMap, RootInfo};

    #[test]
    fn test_instant_agent_advances_roots() {
        let agent = InstantAgent::new();
        let mut callback = agent.callback();

        let mut map = QuiesceMap::new(3);
        for (root, state) in [
            ("file:/a", QuiesceState::Quiescing),
            ("file:/b", QuiesceState::Releasing),
            ("file:/c", QuiesceState::Quiesced),
        ] {
            map.roots.insert(root.to_string(), RootInfo { state, ttl: Duration::from_secs(1) });
        }

        assert!((callback.notify)(&mut map));
        assert_eq!(map.roots["file:/a"].state, QuiesceState::Quiesced);
        assert_eq!(map.roots["file:/b"].state, QuiesceState::Released);
        assert_eq!(map.roots["file:/c"].state, QuiesceState::Quiesced);
        assert_eq!(agent.notifications(), 1);
    }

    #[test]
    fn test_publish_bumps_the_epoch() {
        let mut cluster = SimCluster::new(2, QuiesceDbConfig::default());
        assert_eq!(cluster.epoch(), 0);
        assert!(cluster.leader().is_none());

        cluster.start(1);
        assert_eq!(cluster.epoch(), 1);
        assert!(Arc::ptr_eq(cluster.leader().unwrap(), cluster.manager(1).unwrap()));

        cluster.publish(0, &[0, 1]);
        assert_eq!(cluster.epoch(), 2);
        assert!(cluster.manager(2).is_none());
        assert_eq!(cluster.ranks().collect::<Vec<_>>(), vec![0, 1]);
    }
}
