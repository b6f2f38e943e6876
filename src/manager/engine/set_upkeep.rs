//! Per-set convergence: peer reports, timeouts, expiration.

use std::collections::BTreeMap;

use crate::db::{effective_member_state, Age, MemberInfo, QuiesceSet, QuiesceState, Rank, Root, Version, AGE_NEVER};

use super::awaits::await_outcome;
use super::{PeerInfo, SetPass};

/// Reduction of the peers' view of one member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PeerReports {
    pub min: QuiesceState,
    pub max: QuiesceState,
    /// Peers whose last ack covers the set's version.
    pub reporting: usize,
}

/// Collect what the peers say about `root` of a set in `set_state`.
///
/// Only peers that acknowledged at least `set_version` count. A peer that didn't
/// list the root agrees with the member's current state.
pub(crate) fn peer_reports(
    peers: &BTreeMap<Rank, PeerInfo>,
    set_state: QuiesceState,
    set_version: Version,
    root: &Root,
    member: &MemberInfo,
) -> PeerReports {
    let mut reports = PeerReports {
        min: QuiesceState::Max,
        max: QuiesceState::Invalid,
        reporting: 0,
    };

    for (peer, info) in peers {
        if info.diff_map.db_version < set_version {
            continue;
        }
        let reported = match info.diff_map.roots.get(root) {
            Some(root_info) if !root_info.state.is_valid() => {
                tracing::debug!(peer, root = %root, state = %root_info.state, "ignoring an invalid peer state");
                continue;
            }
            Some(root_info) => root_info.state,
            None => member.rstate.state,
        };
        let effective = effective_member_state(set_state, reported);
        reports.min = reports.min.min(effective);
        reports.max = reports.max.max(effective);
        reports.reporting += 1;
    }

    reports
}

/// Bring one set up to date with peer reports and the clock.
///
/// Returns the age of the next timer of the set, or [`AGE_NEVER`].
pub(crate) fn upkeep_set(set_id: &str, set: &mut QuiesceSet, pass: &mut SetPass<'_>) -> Age {
    if !set.is_active() {
        return AGE_NEVER;
    }

    let db_age = pass.db_age;
    let next_version = pass.db_version + 1;
    // peer acks are judged against the set as it was when the pass started
    let set_version = set.db_version;

    let mut end_of_life = AGE_NEVER;
    let mut min_member_state = QuiesceState::Max;
    let mut included_members = 0usize;
    let mut terminal: Option<QuiesceState> = None;

    let set_state = set.rstate.state;
    for (root, member) in set.members.iter_mut() {
        if member.excluded {
            continue;
        }
        included_members += 1;

        let reports = peer_reports(pass.peers, set_state, set_version, root, member);

        let adopt = if reports.max.is_failure() {
            // one failing peer is enough
            Some(reports.max)
        } else if reports.min < member.rstate.state {
            // someone rolled back
            Some(reports.min)
        } else if reports.reporting > 0 && reports.reporting == pass.peers.len() {
            Some(reports.min)
        } else {
            None
        };
        if let Some(state) = adopt {
            if member.rstate.update(state, db_age) {
                tracing::debug!(set_id, root = %root, state = %state, "member state updated from peer reports");
                set.db_version = next_version;
            }
        }

        if member.is_quiescing() {
            let timeout_at_age = member.rstate.at_age.saturating_add(set.timeout);
            if timeout_at_age <= db_age {
                // the member keeps its own state
                tracing::info!(set_id, root = %root, "member quiesce timeout");
                terminal = Some(QuiesceState::TimedOut);
                break;
            }
            end_of_life = end_of_life.min(timeout_at_age);
        } else if member.is_failed() {
            tracing::info!(set_id, root = %root, state = %member.rstate.state, "propagating member failure to the set");
            terminal = Some(member.rstate.state);
            break;
        }

        min_member_state = min_member_state.min(member.rstate.state);
    }

    if let Some(state) = terminal {
        set.rstate.update(state, db_age);
        set.db_version = next_version;
        return AGE_NEVER;
    }

    if included_members == 0 {
        tracing::debug!(set_id, "no included members left, canceling");
        set.rstate.update(QuiesceState::Canceled, db_age);
        set.db_version = next_version;
        return AGE_NEVER;
    }

    let next_state = set.next_state(min_member_state);
    if set.rstate.update(next_state, db_age) {
        tracing::debug!(set_id, state = %next_state, "set state follows its members");
        set.db_version = next_version;
    }

    if set.is_quiesced() || set.is_released() {
        // before a zero expiration can kick in below
        resolve_awaits(set_id, set, pass, next_version);
    }

    if set.is_quiescing() {
        debug_assert!(end_of_life > db_age);
    } else if set.is_active() {
        let expire_at_age = set.rstate.at_age.saturating_add(set.expiration);
        if expire_at_age <= db_age {
            tracing::info!(set_id, "set expired");
            set.rstate.update(QuiesceState::Expired, db_age);
            set.db_version = next_version;
            return AGE_NEVER;
        }
        end_of_life = end_of_life.min(expire_at_age);
    }

    end_of_life
}

/// Complete the awaits on a set that just reached a resolving state.
///
/// A successful quiesce await restarts the quiesced timer, postponing expiration.
fn resolve_awaits(set_id: &str, set: &mut QuiesceSet, pass: &mut SetPass<'_>, next_version: Version) {
    let Some(waiters) = pass.awaits.remove(set_id) else {
        return;
    };

    let mut pending = Vec::new();
    for await_ctx in waiters {
        let is_release = await_ctx.req_ctx.request.is_release();
        match await_outcome(set.state(), is_release) {
            Some(result) => {
                if result.is_ok() && set.is_quiesced() && set.rstate.refresh(pass.db_age) {
                    set.db_version = next_version;
                    tracing::trace!(set_id, "quiesced timer restarted by a successful await");
                }
                pass.done.push((await_ctx.req_ctx, result));
            }
            None => pending.push(await_ctx),
        }
    }
    if !pending.is_empty() {
        pass.awaits.insert(set_id.to_string(), pending);
    }
}
