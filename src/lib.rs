//! Replicated quiesce database.
//!
//! A cluster-wide quiesce freezes I/O under a set of roots on every rank. This crate
//! tracks the *state* of such operations: one rank is the leader and owns the
//! authoritative database, every other rank holds a replica built from leader listings.
//!
//! - `db`: data model (sets, members, states, ages), requests and root normalization
//! - `manager`: the coordinator thread and the single-threaded upkeep engine it drives
//! - `net`: in-process transport connecting managers of one process
//! - `sim`: a simulated cluster with an instantly-converging agent
//!
//! # Invariants
//!
//! 1. **Single Writer**: the database is mutated only on the coordinator thread.
//! 2. **Monotonic Version**: `db.version` never decreases on the leader.
//! 3. **Validation Before Mutation**: a rejected request leaves no partial effects.
//! 4. **Exactly-once Completion**: every submitted request is completed exactly once.

pub mod config;
pub mod db;
pub mod manager;
pub mod net;
pub mod sim;

pub use config::QuiesceDbConfig;
pub use db::{
    Age, Db, ManualClock, MemberInfo, QuiesceClock, QuiesceDbListing, QuiesceDbRequest,
    QuiesceDbResponse, QuiesceError, QuiesceMap, QuiesceOp, QuiesceSet, QuiesceState, Rank,
    Root, RootInfo, SetId, SystemClock, TimedState,
};
pub use manager::{
    AgentCallback, ClusterMembership, PendingResponse, QuiesceDbManager, QuiesceTransport,
    TransportError,
};
pub use net::{InProcessNetwork, InProcessTransport};
pub use sim::{InstantAgent, SimCluster};
