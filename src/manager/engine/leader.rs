//! Leader side: acks, request processing, db upkeep and peer replication.

use std::collections::{BTreeMap, VecDeque};

use crate::db::{
    sanitize_roots, Age, MemberInfo, QuiesceDbListing, QuiesceDbRequest, QuiesceError, QuiesceMap, QuiesceSet,
    QuiesceState, Rank, SetId, AGE_NEVER,
};

use super::set_upkeep::{peer_reports, upkeep_set};
use super::{Admission, AwaitContext, QuiesceDbEngine, RequestContext, SetPass};

impl QuiesceDbEngine {
    /// One leader pass.
    ///
    /// Records acks, processes requests in arrival order, runs every set through
    /// its state machine, replicates changed sets and sweeps the awaits. Returns
    /// the age of the earliest timer.
    pub fn leader_upkeep(&mut self, acks: Vec<(Rank, QuiesceMap)>, requests: VecDeque<RequestContext>) -> Age {
        if self.db.version == 0 {
            self.db.time_zero = self.clock.now();
            self.db.sets.clear();
        }

        for (from, diff_map) in acks {
            self.record_ack(from, diff_map);
        }

        for req_ctx in requests {
            self.process_request(req_ctx);
        }

        let next_db_event_at_age = self.upkeep_db();
        let next_await_event_at_age = self.upkeep_awaits();

        next_db_event_at_age.min(next_await_event_at_age)
    }

    fn record_ack(&mut self, from: Rank, diff_map: QuiesceMap) {
        let db_age = self.age();
        let db_version = self.db.version;
        let Some(info) = self.peers.get_mut(&from) else {
            tracing::debug!(peer = from, "ignoring an ack from an unknown peer");
            return;
        };

        if diff_map.db_version > db_version {
            tracing::warn!(
                peer = from,
                acked = diff_map.db_version,
                version = db_version,
                "ack for an unknown version, the peer will get a full db"
            );
            info.diff_map.reset();
        } else {
            info.diff_map = diff_map;
            info.at_age = db_age;
        }
    }

    /// Admit one request: complete it now or park it as an await.
    fn process_request(&mut self, mut req_ctx: RequestContext) {
        match self.admit(&mut req_ctx.request) {
            Ok(Admission::Done) => self.done_requests.push((req_ctx, Ok(()))),
            Ok(Admission::Pending { set_id, expire_at_age }) => {
                tracing::trace!(set_id = %set_id, request = req_ctx.id, "parking an await");
                self.awaits.entry(set_id).or_default().push(AwaitContext { expire_at_age, req_ctx });
            }
            Err(err) => {
                tracing::debug!(request = req_ctx.id, error = %err, "request rejected");
                self.done_requests.push((req_ctx, Err(err)));
            }
        }
    }

    fn admit(&mut self, request: &mut QuiesceDbRequest) -> Result<Admission, QuiesceError> {
        if !request.is_valid() {
            tracing::warn!(?request, "rejecting an invalid request");
            return Err(QuiesceError::InvalidRequest);
        }

        if let Some(roots) = request.roots_mut() {
            let (fs_name, fs_id) = self
                .membership
                .as_ref()
                .map(|m| (m.fs_name.as_str(), m.fs_id))
                .unwrap_or(("", 0));
            *roots = sanitize_roots(roots, fs_name, fs_id).map_err(|err| {
                tracing::warn!(error = %err, "failed to sanitize the roots of a request");
                QuiesceError::InvalidRequest
            })?;
        }

        let db_age = self.age();

        if request.is_cancel_all() {
            tracing::warn!("canceling every active set");
            for (set_id, set) in self.db.sets.iter_mut().filter(|(_, set)| set.is_active()) {
                for member in set.members.values_mut() {
                    member.excluded = true;
                }
                set.rstate.update(QuiesceState::Canceled, db_age);
                set.db_version = self.db.version + 1;
                tracing::debug!(set_id = %set_id, "canceled");
            }
            return Ok(Admission::Done);
        }

        if request.set_id.is_none() && request.if_version.is_some_and(|v| v > 0) {
            tracing::debug!(if_version = ?request.if_version, "a new set can't have a non-zero version");
            return Err(QuiesceError::InvalidRequest);
        }

        let exists = request.set_id.as_ref().is_some_and(|id| self.db.sets.contains_key(id));
        if !exists {
            if request.includes_roots() && request.if_version.unwrap_or(0) == 0 {
                let set_id = match &request.set_id {
                    Some(set_id) => set_id.clone(),
                    None => {
                        let set_id = self.new_set_id();
                        // the response reports the id we picked
                        request.set_id = Some(set_id.clone());
                        set_id
                    }
                };
                tracing::debug!(set_id = %set_id, "creating a new set");
                self.db.sets.insert(
                    set_id,
                    QuiesceSet::new(self.config.default_timeout, self.config.default_expiration),
                );
            } else if request.is_mutating() || request.await_for.is_some() {
                tracing::debug!(set_id = ?request.set_id, "no such set");
                return Err(QuiesceError::NotFound);
            } else {
                // a query of nothing in particular
                return Ok(Admission::Done);
            }
        }

        let Some(set_id) = request.set_id.clone() else {
            return Ok(Admission::Done);
        };
        let Self { db, peers, awaits, done_requests, .. } = self;
        let db_version = db.version;
        let Some(set) = db.sets.get_mut(&set_id) else {
            return Err(QuiesceError::NotFound);
        };

        let mut pass = SetPass {
            db_version,
            db_age,
            peers: &*peers,
            awaits,
            done: done_requests,
        };
        update_set(&set_id, set, request, &mut pass)?;

        if let Some(await_for) = request.await_for {
            // a release later in the same batch is caught by the await sweep
            if (set.is_releasing() || set.is_released()) && !request.is_release() {
                tracing::debug!(set_id = %set_id, state = %set.state(), "can't quiesce-await a released set");
                return Err(QuiesceError::NotPermitted);
            }
            return Ok(Admission::Pending {
                set_id,
                expire_at_age: db_age.saturating_add(await_for),
            });
        }

        Ok(Admission::Done)
    }

    fn new_set_id(&self) -> SetId {
        loop {
            let candidate = format!("{:x}", rand::random::<u32>());
            if !self.db.sets.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Run every set through its state machine and replicate what changed.
    fn upkeep_db(&mut self) -> Age {
        let Self { clock, db, peers, awaits, done_requests, membership, .. } = self;
        let db_age = db.age_at(clock.now());
        let me = membership.as_ref().map(|m| m.me);

        let mut pass = SetPass {
            db_version: db.version,
            db_age,
            peers: &*peers,
            awaits,
            done: done_requests,
        };

        let mut next_event_at_age = AGE_NEVER;
        let mut max_version = db.version;
        let mut peer_updates: BTreeMap<Rank, BTreeMap<SetId, QuiesceSet>> = BTreeMap::new();

        for (set_id, set) in db.sets.iter_mut() {
            let next_set_event_at_age = upkeep_set(set_id, set, &mut pass);
            max_version = max_version.max(set.db_version);
            next_event_at_age = next_event_at_age.min(next_set_event_at_age);

            for (&peer, info) in pass.peers.iter() {
                if Some(peer) != me && info.diff_map.db_version < set.db_version {
                    peer_updates.entry(peer).or_default().insert(set_id.clone(), set.clone());
                }
            }
        }

        db.version = max_version;

        let Some(membership) = membership.as_ref() else {
            return next_event_at_age;
        };
        for (peer, sets) in peer_updates {
            let listing = QuiesceDbListing {
                epoch: membership.epoch,
                db_age: db.age_at(clock.now()),
                db_version: db.version,
                sets,
            };
            let set_count = listing.sets.len();
            tracing::trace!(
                peer,
                sets = set_count,
                acked = pass.peers.get(&peer).map(|p| p.diff_map.db_version),
                version = db.version,
                "replicating to peer"
            );
            if let Err(err) = membership.transport.send_listing_to(peer, listing) {
                tracing::error!(peer, version = db.version, sets = set_count, error = %err, "failed to replicate");
            }
        }

        next_event_at_age
    }
}

/// Apply a valid, sanitized request to an existing (possibly new) set.
///
/// Every check runs before the first mutation. Any change stamps the set with
/// the next db version; a change of roots interrupts pending awaits on the set.
pub(crate) fn update_set(
    set_id: &str,
    set: &mut QuiesceSet,
    request: &QuiesceDbRequest,
    pass: &mut SetPass<'_>,
) -> Result<(), QuiesceError> {
    if let Some(if_version) = request.if_version {
        if set.db_version != if_version {
            tracing::debug!(set_id, version = set.db_version, if_version, "set version mismatch");
            return Err(QuiesceError::Stale);
        }
    }

    if !request.is_mutating() {
        return Ok(());
    }

    let db_age = pass.db_age;
    let set_version = set.db_version;
    let mut did_update = false;
    let mut did_update_roots = false;

    if request.is_release() {
        match set.state() {
            QuiesceState::Quiesced => {
                // keep counting towards the quiesce expiration
                did_update = set.rstate.relabel(QuiesceState::Releasing);
                tracing::debug!(set_id, "releasing");
            }
            QuiesceState::Releasing | QuiesceState::Released => {}
            state => {
                tracing::debug!(set_id, state = %state, "can't release in this state");
                return Err(QuiesceError::NotPermitted);
            }
        }
    } else {
        let mut reset = false;

        if !request.is_reset() {
            if !set.is_active() && set.db_version > 0 {
                tracing::debug!(set_id, state = %set.state(), "rejecting a modification of a terminal set");
                return Err(QuiesceError::NotPermitted);
            }
            if request.includes_roots() && set.is_releasing() {
                tracing::debug!(set_id, "rejecting new roots for a releasing set");
                return Err(QuiesceError::NotPermitted);
            }
        } else if set.state() > QuiesceState::Quiesced {
            tracing::debug!(set_id, state = %set.state(), "reset back to quiescing");
            did_update = set.rstate.update(QuiesceState::Quiescing, db_age);
            reset = true;
        }

        if let Some(timeout) = request.timeout.filter(|timeout| *timeout != set.timeout) {
            set.timeout = timeout;
            did_update = true;
        }
        if let Some(expiration) = request.expiration.filter(|expiration| *expiration != set.expiration) {
            set.expiration = expiration;
            did_update = true;
        }

        let set_state = set.state();
        let mut included_count = 0usize;
        let mut min_member_state = QuiesceState::Max;

        for (root, member) in set.members.iter_mut() {
            if request.should_exclude(root) {
                did_update_roots |= !member.excluded;
                member.excluded = true;
                continue;
            }
            if member.excluded {
                continue;
            }
            included_count += 1;

            let effective = if reset {
                let restarted = MemberInfo::quiescing(db_age).rstate;
                if member.rstate != restarted {
                    member.rstate = restarted;
                    did_update_roots = true;
                }
                member.rstate.state
            } else {
                let reports = peer_reports(pass.peers, set_state, set_version, root, member);
                if reports.reporting > 0 && reports.reporting == pass.peers.len() && !reports.max.is_failure() {
                    reports.min
                } else {
                    member.rstate.state
                }
            };
            min_member_state = min_member_state.min(effective);
        }

        if request.includes_roots() {
            if let Some(roots) = request.roots() {
                for root in roots {
                    // new or excluded roots (re)start quiescing
                    if set.members.get(root).map_or(true, |member| member.excluded) {
                        set.members.insert(root.clone(), MemberInfo::quiescing(db_age));
                        did_update_roots = true;
                        included_count += 1;
                        min_member_state = min_member_state.min(QuiesceState::Quiescing);
                    }
                }
            }
        }

        did_update |= did_update_roots;

        if included_count == 0 {
            tracing::debug!(set_id, "canceled due to zero included members");
            did_update |= set.rstate.update(QuiesceState::Canceled, db_age);
        } else if min_member_state < QuiesceState::Max {
            let next_state = set.next_state(min_member_state);
            if set.rstate.update(next_state, db_age) {
                did_update = true;
                tracing::debug!(set_id, state = %next_state, members = included_count, "set follows its remaining members");
            }
        }
    }

    if did_update {
        tracing::trace!(set_id, from = set.db_version, to = pass.db_version + 1, "set version bump");
        set.db_version = pass.db_version + 1;

        if did_update_roots {
            interrupt_awaits(set_id, set, pass);
        }
    }

    Ok(())
}

/// Complete the awaits on a set whose roots changed.
///
/// Even a set that is quiesced now got there by dropping roots, which doesn't
/// count as a successful quiesce: `Interrupted`, or `Canceled` once the set is
/// no longer active.
fn interrupt_awaits(set_id: &str, set: &QuiesceSet, pass: &mut SetPass<'_>) {
    let Some(waiters) = pass.awaits.remove(set_id) else {
        return;
    };
    let result = if set.is_active() {
        Err(QuiesceError::Interrupted)
    } else {
        Err(QuiesceError::Canceled)
    };
    tracing::debug!(set_id, awaits = waiters.len(), ?result, "interrupting awaits after a change of roots");
    for await_ctx in waiters {
        pass.done.push((await_ctx.req_ctx, result));
    }
}
