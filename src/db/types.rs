//! Database table and the replication payloads.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::clock::Age;
use super::state::{QuiesceSet, QuiesceState};

/// Identifier of a quiesce set.
pub type SetId = String;
/// Normalized root, e.g. `file:/volumes/a` or `inode:1234`.
pub type Root = String;
/// Cluster rank.
pub type Rank = u32;
/// Membership generation.
pub type Epoch = u64;
/// Database version, the replication cursor.
pub type Version = u64;

/// The versioned table of quiesce sets.
///
/// Owned by the coordinator thread. On the leader `version` only grows; a replica
/// may `reset()` when it learns the leader restarted with an older database.
#[derive(Debug, Clone)]
pub struct Db {
    pub version: Version,
    pub time_zero: Instant,
    pub sets: BTreeMap<SetId, QuiesceSet>,
}

impl Db {
    pub fn new(time_zero: Instant) -> Self {
        Db {
            version: 0,
            time_zero,
            sets: BTreeMap::new(),
        }
    }

    /// Age of `now` relative to this database's time zero.
    pub fn age_at(&self, now: Instant) -> Age {
        now.saturating_duration_since(self.time_zero)
    }

    /// Drop every set and go back to version 0.
    pub fn reset(&mut self) {
        self.version = 0;
        self.sets.clear();
    }
}

/// Per-root entry of a [`QuiesceMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootInfo {
    pub state: QuiesceState,
    /// Remaining time before the root's current state times out or expires.
    pub ttl: Duration,
}

/// Root states as of a database version.
///
/// Sent from the manager to its agent, and from every rank to the leader as an
/// acknowledgment. In an ack, roots not listed are taken to agree with the leader.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuiesceMap {
    pub db_version: Version,
    pub roots: BTreeMap<Root, RootInfo>,
}

impl QuiesceMap {
    pub fn new(db_version: Version) -> Self {
        QuiesceMap {
            db_version,
            roots: BTreeMap::new(),
        }
    }

    /// Forget everything, including the version.
    pub fn reset(&mut self) {
        self.db_version = 0;
        self.roots.clear();
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Incremental leader-to-peer update: the sets changed since the peer's last ack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuiesceDbListing {
    pub epoch: Epoch,
    /// Leader's db age when the listing was produced; replicas rebase on it.
    pub db_age: Age,
    pub db_version: Version,
    pub sets: BTreeMap<SetId, QuiesceSet>,
}

impl QuiesceDbListing {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::state::{MemberInfo, TimedState};

    #[test]
    fn test_listing_survives_the_codec() {
        let mut set = QuiesceSet::new(Duration::from_secs(10), Duration::from_secs(20));
        set.rstate = TimedState::new(QuiesceState::Quiesced, Duration::from_millis(1500));
        set.db_version = 7;
        set.members.insert("file:/a".to_string(), MemberInfo::quiescing(Duration::from_secs(1)));

        let mut listing = QuiesceDbListing {
            epoch: 3,
            db_age: Duration::from_secs(42),
            db_version: 7,
            sets: BTreeMap::new(),
        };
        listing.sets.insert("s1".to_string(), set);

        let bytes = listing.encode().unwrap();
        assert_eq!(QuiesceDbListing::decode(&bytes).unwrap(), listing);
    }

    #[test]
    fn test_map_reset_forgets_version() {
        let mut map = QuiesceMap::new(5);
        map.roots.insert(
            "file:/a".to_string(),
            RootInfo { state: QuiesceState::Quiesced, ttl: Duration::from_secs(1) },
        );
        map.reset();
        assert_eq!(map, QuiesceMap::default());
    }

    #[test]
    fn test_db_age_and_reset() {
        let t0 = Instant::now();
        let mut db = Db::new(t0);
        assert_eq!(db.age_at(t0 + Duration::from_secs(2)), Duration::from_secs(2));

        db.version = 4;
        db.sets.insert("s".to_string(), QuiesceSet::new(Duration::ZERO, Duration::ZERO));
        db.reset();
        assert_eq!(db.version, 0);
        assert!(db.sets.is_empty());
    }
}
