//! Manager tests.
//!
//! These run the real coordinator threads on the system clock, wired through an
//! in-process network. Awaits are bounded so a broken convergence fails instead
//! of hanging.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::QuiesceDbConfig;
use crate::db::{
    MemberInfo, QuiesceDbListing, QuiesceDbRequest, QuiesceError, QuiesceMap, QuiesceSet, QuiesceState, Rank,
    SystemClock, TimedState,
};
use crate::net::InProcessNetwork;
use crate::sim::{InstantAgent, SimCluster};

use super::{AgentCallback, ClusterMembership, QuiesceDbManager, QuiesceTransport, TransportError};

const AWAIT: Duration = Duration::from_secs(5);

fn manager() -> Arc<QuiesceDbManager> {
    Arc::new(QuiesceDbManager::new(Arc::new(SystemClock), QuiesceDbConfig::default()))
}

fn membership(
    network: &Arc<InProcessNetwork>,
    epoch: u64,
    me: Rank,
    leader: Rank,
    members: &[Rank],
) -> ClusterMembership {
    ClusterMembership {
        epoch,
        me,
        leader,
        members: members.iter().copied().collect::<BTreeSet<_>>(),
        fs_id: 1,
        fs_name: "cephfs".to_string(),
        transport: Arc::new(network.transport(me, leader)),
    }
}

fn set_state(cluster: &SimCluster, set_id: &str) -> Option<QuiesceState> {
    let leader = cluster.leader()?;
    let response = leader.submit_and_wait(QuiesceDbRequest::query(set_id));
    response.result.ok()?;
    response.set().map(|(_, set)| set.state())
}

/// Transport of a replica that keeps the acks it was asked to send.
#[derive(Default)]
struct AckRecorder {
    acks: Mutex<Vec<QuiesceMap>>,
}

impl AckRecorder {
    fn count(&self) -> usize {
        self.acks.lock().unwrap().len()
    }

    fn last(&self) -> Option<QuiesceMap> {
        self.acks.lock().unwrap().last().cloned()
    }
}

impl QuiesceTransport for AckRecorder {
    fn send_ack(&self, ack: QuiesceMap) -> Result<(), TransportError> {
        self.acks.lock().unwrap().push(ack);
        Ok(())
    }

    fn send_listing_to(&self, _to: Rank, _listing: QuiesceDbListing) -> Result<(), TransportError> {
        Ok(())
    }
}

/// A leader listing of version `db_version` with one quiescing set.
fn listing(db_version: u64) -> QuiesceDbListing {
    let mut set = QuiesceSet::new(Duration::from_secs(60), Duration::from_secs(60));
    set.rstate = TimedState::new(QuiesceState::Quiescing, Duration::ZERO);
    set.db_version = db_version;
    set.members.insert("file:/a".to_string(), MemberInfo::quiescing(Duration::ZERO));

    let mut listing = QuiesceDbListing {
        epoch: 1,
        db_age: Duration::ZERO,
        db_version,
        ..Default::default()
    };
    listing.sets.insert("s".to_string(), set);
    listing
}

/// An agent that counts its calls and answers `send`.
fn counting_agent(calls: &Arc<AtomicU64>, send: bool) -> AgentCallback {
    let calls = Arc::clone(calls);
    AgentCallback::new(move |_map| {
        calls.fetch_add(1, Ordering::SeqCst);
        send
    })
}

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + AWAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

/// Give the coordinator time to act on whatever it was just handed.
fn settle() {
    thread::sleep(Duration::from_millis(100));
}

/// Test: nothing is accepted without leadership
#[test]
fn test_submit_requires_leadership() {
    let network = InProcessNetwork::new();
    let manager = manager();
    network.register(1, &manager);

    assert_eq!(
        manager.submit(QuiesceDbRequest::query_all()).err(),
        Some(QuiesceError::NotPermitted)
    );

    manager.update_membership(membership(&network, 1, 1, 0, &[0, 1]));
    let response = manager.submit_and_wait(QuiesceDbRequest::query_all());
    assert_eq!(response.result, Err(QuiesceError::NotPermitted));
    assert_eq!(manager.submit_ack_from(0, QuiesceMap::new(0)), Err(QuiesceError::NotPermitted));
}

#[test]
fn test_listings_only_from_the_leader() {
    let network = InProcessNetwork::new();
    let manager = manager();
    network.register(1, &manager);

    let listing = QuiesceDbListing { epoch: 3, ..Default::default() };
    assert_eq!(manager.submit_listing_from(0, listing.clone()), Err(QuiesceError::NotPermitted));

    manager.update_membership(membership(&network, 3, 1, 0, &[0, 1, 2]));
    assert_eq!(manager.submit_listing_from(2, listing.clone()), Err(QuiesceError::Stale));
    assert_eq!(
        manager.submit_listing_from(0, QuiesceDbListing { epoch: 2, ..Default::default() }),
        Err(QuiesceError::Stale)
    );
    assert_eq!(manager.submit_listing_from(0, listing), Ok(()));
}

/// Test: lifecycle of the coordinator thread
#[test]
fn test_coordinator_lifecycle() {
    let network = InProcessNetwork::new();
    let manager = manager();
    network.register(0, &manager);
    assert!(!manager.is_running());

    manager.update_membership(membership(&network, 1, 0, 0, &[0]));
    assert!(manager.is_running());

    // a second epoch reuses the running thread
    manager.update_membership(membership(&network, 2, 0, 0, &[0]));
    assert!(manager.is_running());

    // left out of the membership
    manager.update_membership(membership(&network, 3, 0, 1, &[1]));
    assert!(!manager.is_running());

    manager.update_membership(membership(&network, 4, 0, 0, &[0]));
    assert!(manager.is_running());
    manager.shutdown();
    assert!(!manager.is_running());
}

#[test]
fn test_single_rank_quiesce_and_release() {
    let agent = InstantAgent::new();
    let mut cluster = SimCluster::new(1, QuiesceDbConfig::default());
    cluster.attach_agent(&agent);
    cluster.start(0);
    let leader = Arc::clone(cluster.leader().unwrap());

    let response = leader.submit_and_wait(
        QuiesceDbRequest::include(["/volumes/a", "file://cephfs/volumes/b"])
            .with_set_id("snap")
            .with_await(AWAIT),
    );
    assert_eq!(response.result, Ok(()));
    let (set_id, set) = response.set().unwrap();
    assert_eq!(set_id, "snap");
    assert_eq!(set.state(), QuiesceState::Quiesced);
    assert!(set.members.contains_key("file:/volumes/a"));
    assert!(set.members.contains_key("file:/volumes/b"));

    let response = leader.submit_and_wait(QuiesceDbRequest::release("snap").with_await(AWAIT));
    assert_eq!(response.result, Ok(()));
    assert_eq!(response.set().unwrap().1.state(), QuiesceState::Released);
    assert!(agent.notifications() >= 2);
}

/// Test: every rank has to report before the set is quiesced
#[test]
fn test_three_ranks_converge() {
    let agent = InstantAgent::new();
    let mut cluster = SimCluster::new(3, QuiesceDbConfig::default());
    cluster.attach_agent(&agent);
    cluster.start(0);
    let leader = Arc::clone(cluster.leader().unwrap());

    let response = leader.submit_and_wait(QuiesceDbRequest::include(["/a", "/b", "/c"]).with_await(AWAIT));
    assert_eq!(response.result, Ok(()));
    let (set_id, set) = response.set().unwrap();
    assert_eq!(set.state(), QuiesceState::Quiesced);
    assert!(set.members.values().all(|m| m.rstate.state == QuiesceState::Quiesced));

    let response = leader.submit_and_wait(QuiesceDbRequest::release(set_id.clone()).with_await(AWAIT));
    assert_eq!(response.result, Ok(()));
    assert!(cluster.network().delivered() > 0);
}

/// Test: a rank without an agent holds the set in quiescing
#[test]
fn test_missing_agent_blocks_quiesce() {
    let agent = InstantAgent::new();
    let mut cluster = SimCluster::new(2, QuiesceDbConfig::default());
    cluster.attach_agent_to(0, &agent);
    cluster.start(0);
    let leader = Arc::clone(cluster.leader().unwrap());

    let response = leader.submit_and_wait(
        QuiesceDbRequest::include(["/a"])
            .with_set_id("stuck")
            .with_await(Duration::from_millis(200)),
    );
    assert_eq!(response.result, Err(QuiesceError::InProgress));
    assert_eq!(set_state(&cluster, "stuck"), Some(QuiesceState::Quiescing));

    // once the agent shows up the set completes
    cluster.attach_agent_to(1, &agent);
    let response = leader.submit_and_wait(QuiesceDbRequest::query("stuck").with_await(AWAIT));
    assert_eq!(response.result, Ok(()));
    assert_eq!(set_state(&cluster, "stuck"), Some(QuiesceState::Quiesced));
}

#[test]
fn test_quiesce_timeout() {
    let mut cluster = SimCluster::new(2, QuiesceDbConfig::default());
    cluster.start(0);
    let leader = Arc::clone(cluster.leader().unwrap());

    let response = leader.submit_and_wait(
        QuiesceDbRequest::include(["/a"])
            .with_set_id("slow")
            .with_timeout(Duration::from_millis(100))
            .with_await(AWAIT),
    );
    assert_eq!(response.result, Err(QuiesceError::TimedOut));
    assert_eq!(set_state(&cluster, "slow"), Some(QuiesceState::TimedOut));
}

/// Test: shutdown answers everything still in flight
#[test]
fn test_shutdown_completes_pending_requests() {
    let network = InProcessNetwork::new();
    let manager = manager();
    network.register(0, &manager);
    manager.update_membership(membership(&network, 1, 0, 0, &[0]));

    // no agent, this await can only end with the coordinator
    let pending = manager
        .submit(QuiesceDbRequest::include(["/a"]).with_await(Duration::from_secs(60)))
        .unwrap();
    assert!(pending.wait_timeout(Duration::from_millis(50)).is_none());

    manager.shutdown();
    let response = pending.wait();
    assert!(matches!(
        response.result,
        Err(QuiesceError::InProgress) | Err(QuiesceError::NotPermitted)
    ));
    assert_eq!(
        manager.submit(QuiesceDbRequest::query_all()).err(),
        Some(QuiesceError::NotPermitted)
    );
}

#[test]
fn test_leadership_handover_keeps_sets() {
    let agent = InstantAgent::new();
    let mut cluster = SimCluster::new(2, QuiesceDbConfig::default());
    cluster.attach_agent(&agent);
    cluster.start(0);

    let old_leader = Arc::clone(cluster.leader().unwrap());
    let response = old_leader.submit_and_wait(QuiesceDbRequest::include(["/a"]).with_set_id("keep").with_await(AWAIT));
    assert_eq!(response.result, Ok(()));

    // let the replica apply the last listing
    thread::sleep(Duration::from_millis(200));
    cluster.publish(1, &[0, 1]);

    assert_eq!(
        old_leader.submit(QuiesceDbRequest::query("keep")).err(),
        Some(QuiesceError::NotPermitted)
    );
    assert_eq!(set_state(&cluster, "keep"), Some(QuiesceState::Quiesced));
}

#[test]
fn test_removed_rank_stops() {
    let mut cluster = SimCluster::new(3, QuiesceDbConfig::default());
    cluster.start(0);
    assert!(cluster.ranks().all(|rank| cluster.manager(rank).unwrap().is_running()));

    cluster.publish(0, &[0, 1]);
    assert!(!cluster.manager(2).unwrap().is_running());
    assert!(cluster.manager(1).unwrap().is_running());

    cluster.shutdown();
    assert!(cluster.ranks().all(|rank| !cluster.manager(rank).unwrap().is_running()));
}

/// Test: the agent hears about each db version once and acks follow it
#[test]
fn test_agent_notification_and_ack_rules() {
    let recorder = Arc::new(AckRecorder::default());
    let manager = manager();
    manager.update_membership(ClusterMembership {
        epoch: 1,
        me: 1,
        leader: 0,
        members: [0, 1].into_iter().collect(),
        fs_id: 1,
        fs_name: "cephfs".to_string(),
        transport: Arc::clone(&recorder) as Arc<dyn QuiesceTransport>,
    });

    // without an agent an empty map is acked, once per version
    manager.submit_listing_from(0, listing(1)).unwrap();
    wait_until("the first ack", || recorder.count() == 1);
    assert_eq!(recorder.last(), Some(QuiesceMap::new(1)));
    manager.submit_listing_from(0, listing(1)).unwrap();
    settle();
    assert_eq!(recorder.count(), 1);

    // a new agent is told about the current version
    let calls = Arc::new(AtomicU64::new(0));
    manager.reset_agent_callback(Some(counting_agent(&calls, true)));
    wait_until("the agent ack", || recorder.count() == 2);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let ack = recorder.last().unwrap();
    assert_eq!(ack.db_version, 1);
    assert_eq!(ack.roots["file:/a"].state, QuiesceState::Quiescing);

    // wake-ups at the same version reach neither the agent nor the leader
    manager.submit_listing_from(0, listing(1)).unwrap();
    settle();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.count(), 2);

    manager.submit_listing_from(0, listing(2)).unwrap();
    wait_until("the second agent ack", || recorder.count() == 3);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(recorder.last().unwrap().db_version, 2);

    // an agent that declines keeps the ack back
    let declined = Arc::new(AtomicU64::new(0));
    manager.reset_agent_callback(Some(counting_agent(&declined, false)));
    wait_until("the declining agent", || declined.load(Ordering::SeqCst) == 1);
    settle();
    assert_eq!(recorder.count(), 3);
    assert_eq!(declined.load(Ordering::SeqCst), 1);
}

/// Test: a leader that comes back with an empty db still gets its sets quiesced
///
/// The replica discards its newer db on the first listing from the restarted
/// leader. Its agent has to hear about the leader's low versions again.
#[test]
fn test_replica_agent_follows_a_restarted_leader() {
    let agent = InstantAgent::new();
    let mut cluster = SimCluster::new(2, QuiesceDbConfig::default());
    cluster.attach_agent(&agent);
    cluster.start(0);

    let leader = Arc::clone(cluster.leader().unwrap());
    for set_id in ["s1", "s2", "s3"] {
        let response = leader.submit_and_wait(QuiesceDbRequest::include(["/a"]).with_set_id(set_id).with_await(AWAIT));
        assert_eq!(response.result, Ok(()));
    }
    // let the replica apply the last listing
    thread::sleep(Duration::from_millis(200));

    // rank 0 leaves, then leads again with a fresh db
    cluster.publish(1, &[1]);
    assert!(!leader.is_running());
    cluster.publish(0, &[0, 1]);

    let response = leader.submit_and_wait(
        QuiesceDbRequest::include(["/new"])
            .with_set_id("fresh")
            .with_await(AWAIT),
    );
    assert_eq!(response.result, Ok(()));
    assert_eq!(set_state(&cluster, "fresh"), Some(QuiesceState::Quiesced));
    assert_eq!(set_state(&cluster, "s1"), None);
}
