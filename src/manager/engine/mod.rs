//! Single-threaded quiesce database engine.
//!
//! The engine owns the database, the peer table and the pending awaits. It is
//! driven by the coordinator thread in [`crate::manager`] and never blocks: every
//! call does one bounded unit of work and reports the next age at which it needs
//! to run again.
//!
//! # Invariants
//!
//! 1. **Single Writer**: only the coordinator thread calls into the engine.
//! 2. **Monotonic Version**: on the leader `db.version` never decreases.
//! 3. **Validation Before Mutation**: a rejected request leaves the db untouched.
//! 4. **Exactly-once Completion**: a request context is moved into exactly one
//!    of the pending awaits or the completion queue, and leaves it once.

mod awaits;
mod leader;
mod replica;
mod set_upkeep;


use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::config::QuiesceDbConfig;
use crate::db::{
    Age, Db, QuiesceClock, QuiesceDbRequest, QuiesceDbResponse, QuiesceError, QuiesceMap, QuiesceSet, Rank,
    RootInfo, SetId, Version,
};
use crate::manager::membership::{ClusterMembership, TransportError};

// ============================================================================
// Contexts
// ============================================================================

/// One submitted request and the channel its response goes to.
#[derive(Debug)]
pub struct RequestContext {
    /// Unique per manager.
    pub id: u64,
    pub request: QuiesceDbRequest,
    reply: Sender<QuiesceDbResponse>,
}

impl RequestContext {
    /// Wrap a request, returning the receiving end of its completion.
    pub fn new(id: u64, request: QuiesceDbRequest) -> (Self, Receiver<QuiesceDbResponse>) {
        let (reply, rx) = bounded(1);
        (RequestContext { id, request, reply }, rx)
    }

    fn complete(self, response: QuiesceDbResponse) {
        if self.reply.send(response).is_err() {
            tracing::trace!(request = self.id, "requester is gone, dropping the response");
        }
    }
}

/// A request waiting for its set to reach a state.
#[derive(Debug)]
pub struct AwaitContext {
    pub expire_at_age: Age,
    pub req_ctx: RequestContext,
}

/// What the leader knows about a peer.
#[derive(Debug, Clone, Default)]
pub struct PeerInfo {
    /// Last acknowledged map; version 0 means nothing acknowledged yet.
    pub diff_map: QuiesceMap,
    /// Db age of the last acknowledgment.
    pub at_age: Age,
}

/// Outcome of admitting a request.
///
/// `Pending` is the internal "busy" result: the request stays parked as an
/// await and is completed by a later pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Admission {
    Done,
    Pending { set_id: SetId, expire_at_age: Age },
}

pub(crate) type Completion = (RequestContext, Result<(), QuiesceError>);

/// Everything a set-level pass needs besides the set itself.
///
/// Borrowed out of the engine so that a set can be mutated while the peer table,
/// the awaits and the completion queue are reachable.
pub(crate) struct SetPass<'a> {
    /// Db version at the start of the pass; a change stamps the set with `db_version + 1`.
    pub db_version: Version,
    pub db_age: Age,
    pub peers: &'a BTreeMap<Rank, PeerInfo>,
    pub awaits: &'a mut BTreeMap<SetId, Vec<AwaitContext>>,
    pub done: &'a mut Vec<Completion>,
}

// ============================================================================
// Engine
// ============================================================================

/// The quiesce database and everything that drives it.
pub struct QuiesceDbEngine {
    clock: Arc<dyn QuiesceClock>,
    config: QuiesceDbConfig,
    /// Membership currently applied; `None` until the first one.
    membership: Option<ClusterMembership>,
    db: Db,
    /// Leader only: every member rank, this one included.
    peers: BTreeMap<Rank, PeerInfo>,
    awaits: BTreeMap<SetId, Vec<AwaitContext>>,
    done_requests: Vec<Completion>,
}

impl QuiesceDbEngine {
    pub fn new(clock: Arc<dyn QuiesceClock>, config: QuiesceDbConfig) -> Self {
        let db = Db::new(clock.now());
        QuiesceDbEngine {
            clock,
            config,
            membership: None,
            db,
            peers: BTreeMap::new(),
            awaits: BTreeMap::new(),
            done_requests: Vec::new(),
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn membership(&self) -> Option<&ClusterMembership> {
        self.membership.as_ref()
    }

    pub fn is_leader(&self) -> bool {
        self.membership.as_ref().is_some_and(ClusterMembership::is_leader)
    }

    /// Current age of the db.
    pub fn age(&self) -> Age {
        self.db.age_at(self.clock.now())
    }

    pub fn pending_awaits(&self) -> usize {
        self.awaits.values().map(Vec::len).sum()
    }

    /// Apply a newly published membership.
    ///
    /// Returns false when there is no membership anymore, i.e. the coordinator
    /// must stop. Losing leadership completes every await with `InProgress` and
    /// rejects every queued request with `NotPermitted`.
    pub fn membership_upkeep(
        &mut self,
        cluster: Option<&ClusterMembership>,
        pending_requests: &mut VecDeque<RequestContext>,
    ) -> bool {
        if let (Some(cluster), Some(applied)) = (cluster, self.membership.as_ref()) {
            if cluster.epoch == applied.epoch {
                return true;
            }
        }

        let was_leader = self.is_leader();
        let is_leader = cluster.is_some_and(ClusterMembership::is_leader);
        match cluster {
            Some(cluster) => tracing::info!(
                epoch = cluster.epoch,
                me = cluster.me,
                leader = cluster.leader,
                is_leader,
                was_leader,
                "applying membership"
            ),
            None => tracing::info!(was_leader, "shutting down"),
        }

        if let Some(cluster) = cluster.filter(|c| c.is_leader()) {
            self.peers.retain(|rank, _| cluster.members.contains(rank));
            for &rank in &cluster.members {
                self.peers.entry(rank).or_default();
            }
        } else {
            self.peers.clear();
            // not authoritative anymore, the sets themselves haven't changed
            for (_, waiters) in std::mem::take(&mut self.awaits) {
                for await_ctx in waiters {
                    self.done_requests.push((await_ctx.req_ctx, Err(QuiesceError::InProgress)));
                }
            }
            while let Some(req_ctx) = pending_requests.pop_front() {
                self.done_requests.push((req_ctx, Err(QuiesceError::NotPermitted)));
            }
        }

        match cluster {
            Some(cluster) => {
                self.membership = Some(cluster.clone());
                true
            }
            None => false,
        }
    }

    /// Complete `requests` with `error` without looking at them.
    pub fn reject_requests(&mut self, requests: impl IntoIterator<Item = RequestContext>, error: QuiesceError) {
        for req_ctx in requests {
            self.done_requests.push((req_ctx, Err(error)));
        }
    }

    /// Send every completed request its response.
    ///
    /// Only the leader fills in the db fields: the addressed set, or every set
    /// for a wildcard query.
    pub fn complete_requests(&mut self) {
        if self.done_requests.is_empty() {
            return;
        }
        let db_age = self.age();
        let leader_epoch = self.membership.as_ref().filter(|m| m.is_leader()).map(|m| m.epoch);

        for (req_ctx, result) in std::mem::take(&mut self.done_requests) {
            let mut response = QuiesceDbResponse::from_result(result);
            if let Some(epoch) = leader_epoch {
                response.db_age = db_age;
                response.db_version = self.db.version;
                response.epoch = epoch;
                if let Some(set_id) = &req_ctx.request.set_id {
                    if let Some(set) = self.db.sets.get(set_id) {
                        response.sets.insert(set_id.clone(), set.clone());
                    }
                } else if req_ctx.request.is_query() {
                    response.sets = self.db.sets.clone();
                }
            }
            tracing::trace!(request = req_ctx.id, code = response.result_code(), "completing request");
            req_ctx.complete(response);
        }
    }

    /// Fill `map` with the effective state and time-to-live of every root of
    /// every active set.
    pub fn calculate_quiesce_map(&self, map: &mut QuiesceMap) {
        map.roots.clear();
        map.db_version = self.db.version;
        let db_age = self.age();

        for set in self.db.sets.values().filter(|set| set.is_active()) {
            for (root, member) in set.members.iter().filter(|(_, member)| !member.excluded) {
                let state = set.effective_member_state(member.rstate.state);
                let ttl = root_ttl(set, member.rstate.at_age, member.is_quiescing(), db_age);
                map.roots
                    .entry(root.clone())
                    .and_modify(|info| {
                        // the same root in several sets: the least advanced wins
                        info.state = info.state.min(state);
                        info.ttl = info.ttl.min(ttl);
                    })
                    .or_insert(RootInfo { state, ttl });
            }
        }
    }

    /// Send this rank's acknowledgment to the leader.
    pub fn send_ack(&self, ack: QuiesceMap) -> Result<(), TransportError> {
        match &self.membership {
            Some(membership) => membership.transport.send_ack(ack),
            None => Err(TransportError::NoMembership),
        }
    }
}

/// Remaining time before a member's current state times out or its set expires.
fn root_ttl(set: &QuiesceSet, member_at_age: Age, member_quiescing: bool, db_age: Age) -> Age {
    let end_of_life = if set.is_quiesced() || set.is_releasing() {
        set.rstate.at_age.saturating_add(set.expiration)
    } else if set.is_active() {
        // upper bound unless the member is known to be on a timer
        let since = if member_quiescing { member_at_age } else { db_age };
        since.saturating_add(set.timeout)
    } else {
        db_age
    };
    end_of_life.saturating_sub(db_age)
}
