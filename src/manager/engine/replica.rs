//! Replica side: applying leader listings.

use crate::db::{time_distance, Age, QuiesceDbListing, AGE_NEVER};

use super::QuiesceDbEngine;

impl QuiesceDbEngine {
    /// Apply a listing from the leader.
    ///
    /// Replicas have no timers of their own, so this always returns [`AGE_NEVER`].
    pub fn replica_upkeep(&mut self, listing: QuiesceDbListing) -> Age {
        let epoch = self.membership.as_ref().map_or(0, |m| m.epoch);
        if listing.epoch != epoch {
            tracing::debug!(listing_epoch = listing.epoch, epoch, "ignoring a listing from another epoch");
            return AGE_NEVER;
        }

        // the leader's age tells where its time zero sits on our clock
        let now = self.clock.now();
        match now.checked_sub(listing.db_age) {
            Some(time_zero) => {
                let drift = time_distance(time_zero, self.db.time_zero);
                if drift > self.config.time_zero_drift_warn {
                    tracing::debug!(?drift, "significant db time zero change");
                }
                self.db.time_zero = time_zero;
            }
            None => {
                tracing::warn!(db_age = ?listing.db_age, "leader db age is beyond the local clock, keeping the time zero");
            }
        }

        if self.db.version > listing.db_version {
            tracing::info!(
                version = self.db.version,
                listing_version = listing.db_version,
                "got an older db from the leader, discarding ours"
            );
            self.db.reset();
        } else {
            tracing::trace!(
                version = listing.db_version,
                sets = listing.sets.len(),
                "applying a listing"
            );
            self.db.sets.extend(listing.sets);
            self.db.version = listing.db_version;
        }

        AGE_NEVER
    }
}
