//! Quiesce database manager: the coordinator thread and its inbound queues.
//!
//! Callers never touch the database. They enqueue requests, acks and listings
//! under the submit lock and signal the condition variable; the coordinator
//! thread drains the queues, runs one engine pass, completes requests, talks to
//! the agent and sleeps until there is new work or a timer is due.
//!
//! ```text
//!   submit() ──┐
//!   ack ───────┼──► SubmitState ──► coordinator ──► QuiesceDbEngine
//!   listing ───┘    (Mutex+Condvar)     │
//!                                       ├──► agent callback (own lock)
//!                                       └──► transport (ack / listings)
//! ```

pub mod engine;
pub mod membership;

#[cfg(test)]
mod tests;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::config::QuiesceDbConfig;
use crate::db::{
    QuiesceClock, QuiesceDbListing, QuiesceDbRequest, QuiesceDbResponse, QuiesceError, QuiesceMap, Rank, Version,
    AGE_NEVER,
};

pub use engine::{QuiesceDbEngine, RequestContext};
pub use membership::{AgentCallback, ClusterMembership, QuiesceTransport, TransportError};

/// Everything guarded by the submit lock.
#[derive(Default)]
struct SubmitState {
    /// Latest published membership; `None` asks the coordinator to stop.
    cluster_membership: Option<ClusterMembership>,
    /// Set when `cluster_membership` changed since the coordinator last looked.
    membership_dirty: bool,
    pending_requests: VecDeque<RequestContext>,
    pending_acks: Vec<(Rank, QuiesceMap)>,
    pending_db_update: Option<QuiesceDbListing>,
    /// Set when the agent callback was replaced.
    agent_dirty: bool,
}

impl SubmitState {
    fn has_work(&self) -> bool {
        self.membership_dirty
            || self.agent_dirty
            || !self.pending_requests.is_empty()
            || !self.pending_acks.is_empty()
            || self.pending_db_update.is_some()
    }
}

struct Shared {
    submit: Mutex<SubmitState>,
    submit_condition: Condvar,
    agent: Mutex<Option<AgentCallback>>,
}

impl Shared {
    fn lock_submit(&self) -> MutexGuard<'_, SubmitState> {
        self.submit.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_agent(&self) -> MutexGuard<'_, Option<AgentCallback>> {
        self.agent.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Response of a submitted request, delivered once by the coordinator.
#[derive(Debug)]
pub struct PendingResponse {
    rx: Receiver<QuiesceDbResponse>,
}

impl PendingResponse {
    /// Block until the request completes.
    ///
    /// A coordinator that went away without answering reads as `InProgress`.
    pub fn wait(self) -> QuiesceDbResponse {
        self.rx
            .recv()
            .unwrap_or_else(|_| QuiesceDbResponse::from_result(Err(QuiesceError::InProgress)))
    }

    /// Block for at most `timeout`; `None` if the request is still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<QuiesceDbResponse> {
        match self.rx.recv_timeout(timeout) {
            Ok(response) => Some(response),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                Some(QuiesceDbResponse::from_result(Err(QuiesceError::InProgress)))
            }
        }
    }
}

// ============================================================================
// Manager
// ============================================================================

/// One rank's quiesce database manager.
///
/// The coordinator thread runs while the published membership includes this
/// rank. Dropping the manager stops it.
pub struct QuiesceDbManager {
    shared: Arc<Shared>,
    clock: Arc<dyn QuiesceClock>,
    config: QuiesceDbConfig,
    thread: Mutex<Option<JoinHandle<()>>>,
    next_request_id: AtomicU64,
}

impl QuiesceDbManager {
    pub fn new(clock: Arc<dyn QuiesceClock>, config: QuiesceDbConfig) -> Self {
        QuiesceDbManager {
            shared: Arc::new(Shared {
                submit: Mutex::new(SubmitState::default()),
                submit_condition: Condvar::new(),
                agent: Mutex::new(None),
            }),
            clock,
            config,
            thread: Mutex::new(None),
            next_request_id: AtomicU64::new(1),
        }
    }

    /// Publish a new membership.
    ///
    /// Starts the coordinator if this rank is a member, stops it otherwise.
    pub fn update_membership(&self, membership: ClusterMembership) {
        if !membership.includes_me() {
            tracing::info!(me = membership.me, epoch = membership.epoch, "not a member anymore");
            self.shutdown();
            return;
        }

        {
            let mut state = self.shared.lock_submit();
            state.cluster_membership = Some(membership);
            state.membership_dirty = true;
            self.shared.submit_condition.notify_all();
        }

        let mut thread = self.thread.lock().unwrap_or_else(PoisonError::into_inner);
        if thread.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let engine = QuiesceDbEngine::new(Arc::clone(&self.clock), self.config);
        let spawned = thread::Builder::new()
            .name("quiesce-db".to_string())
            .spawn(move || coordinator_main(shared, engine));
        match spawned {
            Ok(handle) => *thread = Some(handle),
            Err(err) => tracing::error!(error = %err, "failed to start the quiesce db thread"),
        }
    }

    /// Stop the coordinator; every outstanding request is completed first.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.lock_submit();
            state.cluster_membership = None;
            state.membership_dirty = true;
            self.shared.submit_condition.notify_all();
        }

        let handle = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                // asked from within the coordinator, it exits on its own
                return;
            }
            if handle.join().is_err() {
                tracing::error!("the quiesce db thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Submit a request to this rank's database.
    ///
    /// Only the leader accepts requests; elsewhere this fails with `NotPermitted`.
    pub fn submit(&self, request: QuiesceDbRequest) -> Result<PendingResponse, QuiesceError> {
        let mut state = self.shared.lock_submit();
        let accepting = state
            .cluster_membership
            .as_ref()
            .is_some_and(|m| m.is_leader() && m.includes_me());
        if !accepting {
            return Err(QuiesceError::NotPermitted);
        }

        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(request = id, ?request, "submitted");
        let (req_ctx, rx) = RequestContext::new(id, request);
        state.pending_requests.push_back(req_ctx);
        self.shared.submit_condition.notify_all();
        Ok(PendingResponse { rx })
    }

    /// Submit and block until the request completes.
    pub fn submit_and_wait(&self, request: QuiesceDbRequest) -> QuiesceDbResponse {
        match self.submit(request) {
            Ok(pending) => pending.wait(),
            Err(err) => QuiesceDbResponse::from_result(Err(err)),
        }
    }

    /// Ingest an acknowledgment from `from`; only the leader takes acks.
    pub fn submit_ack_from(&self, from: Rank, ack: QuiesceMap) -> Result<(), QuiesceError> {
        let mut state = self.shared.lock_submit();
        if !state.cluster_membership.as_ref().is_some_and(ClusterMembership::is_leader) {
            return Err(QuiesceError::NotPermitted);
        }
        state.pending_acks.push((from, ack));
        self.shared.submit_condition.notify_all();
        Ok(())
    }

    /// Ingest a listing from `from`; only the current leader of the current epoch is heard.
    pub fn submit_listing_from(&self, from: Rank, listing: QuiesceDbListing) -> Result<(), QuiesceError> {
        let mut state = self.shared.lock_submit();
        let Some(membership) = state.cluster_membership.as_ref() else {
            return Err(QuiesceError::NotPermitted);
        };
        if membership.epoch != listing.epoch || membership.leader != from || membership.is_leader() {
            tracing::debug!(
                from,
                epoch = listing.epoch,
                current_epoch = membership.epoch,
                leader = membership.leader,
                "rejecting a listing"
            );
            return Err(QuiesceError::Stale);
        }

        // listings are incremental, don't lose an unapplied one
        let merged = match state.pending_db_update.take() {
            Some(mut pending) if pending.epoch == listing.epoch && pending.db_version <= listing.db_version => {
                pending.sets.extend(listing.sets);
                pending.db_age = listing.db_age;
                pending.db_version = listing.db_version;
                pending
            }
            _ => listing,
        };
        state.pending_db_update = Some(merged);
        self.shared.submit_condition.notify_all();
        Ok(())
    }

    /// Register (or remove) the agent.
    pub fn reset_agent_callback(&self, callback: Option<AgentCallback>) {
        *self.shared.lock_agent() = callback;
        let mut state = self.shared.lock_submit();
        state.agent_dirty = true;
        self.shared.submit_condition.notify_all();
    }
}

impl Drop for QuiesceDbManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Coordinator
// ============================================================================

fn coordinator_main(shared: Arc<Shared>, mut engine: QuiesceDbEngine) {
    tracing::debug!("quiesce db thread started");

    let mut next_event_at_age = AGE_NEVER;
    let mut last_acked: Version = 0;
    let mut last_version: Version = 0;

    // the watermark belongs to the db of a previous run
    if let Some(callback) = shared.lock_agent().as_mut() {
        callback.if_newer = 0;
    }

    let mut state = shared.lock_submit();

    loop {
        let db_age = engine.age();
        if !state.has_work() && next_event_at_age > db_age {
            state = if next_event_at_age == AGE_NEVER {
                shared.submit_condition.wait(state).unwrap_or_else(PoisonError::into_inner)
            } else {
                shared
                    .submit_condition
                    .wait_timeout(state, next_event_at_age - db_age)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            };
        }

        state.membership_dirty = false;
        state.agent_dirty = false;
        let cluster = state.cluster_membership.clone();
        if !engine.membership_upkeep(cluster.as_ref(), &mut state.pending_requests) {
            break;
        }

        let acks = std::mem::take(&mut state.pending_acks);
        let requests = std::mem::take(&mut state.pending_requests);
        let db_update = state.pending_db_update.take();
        drop(state);

        next_event_at_age = if engine.is_leader() {
            engine.leader_upkeep(acks, requests)
        } else {
            engine.reject_requests(requests, QuiesceError::NotPermitted);
            match db_update {
                Some(listing) => engine.replica_upkeep(listing),
                // leader timers don't apply to a replica
                None => AGE_NEVER,
            }
        };

        engine.complete_requests();

        let db_version = engine.db().version;
        // a replica discarded its db
        let db_went_back = db_version < last_version;
        last_version = db_version;

        // by default only ack a version change
        let mut send_ack = last_acked != db_version;
        let mut quiesce_map = QuiesceMap::new(db_version);
        {
            let mut agent = shared.lock_agent();
            if let Some(callback) = agent.as_mut().filter(|_| db_went_back) {
                tracing::debug!(if_newer = callback.if_newer, version = db_version, "lowering the agent watermark");
                callback.if_newer = callback.if_newer.min(db_version);
            }
            match agent.as_mut() {
                Some(callback) if callback.if_newer < db_version => {
                    engine.calculate_quiesce_map(&mut quiesce_map);
                    tracing::trace!(version = db_version, roots = quiesce_map.roots.len(), "notifying the agent");
                    send_ack = (callback.notify)(&mut quiesce_map);
                    callback.if_newer = db_version;
                }
                // an emptied db still acks so that the leader resends its sets
                Some(_) if db_went_back => {}
                Some(_) => send_ack = false,
                None => {
                    // agree with whatever was sent; roots stay quiescing without an agent
                    tracing::trace!("no agent registered, acking with an empty map");
                }
            }
        }

        if send_ack {
            let version = quiesce_map.db_version;
            let roots = quiesce_map.roots.len();
            match engine.send_ack(quiesce_map) {
                Ok(()) => last_acked = version,
                Err(err) => tracing::error!(version, roots, error = %err, "failed to send the agent ack"),
            }
        }

        state = shared.lock_submit();
    }

    drop(state);
    engine.complete_requests();
    tracing::debug!("quiesce db thread stopped");
}
