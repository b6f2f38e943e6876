//! In-process network for quiesce db managers.
//!
//! Connects the managers of one process. Every payload goes through the bincode
//! codec on its way, so what a peer receives is exactly what would cross a wire.
//! Ranks can be disconnected to simulate partitions: payloads from or to a
//! disconnected rank are refused.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use crate::db::{QuiesceDbListing, QuiesceMap, Rank};
use crate::manager::{QuiesceDbManager, QuiesceTransport, TransportError};

/// One registered rank.
struct Endpoint {
    manager: Weak<QuiesceDbManager>,
    /// Connection status (true = connected).
    connected: Arc<AtomicBool>,
}

/// Payload kinds carried by the network.
enum Payload {
    Ack(Vec<u8>),
    Listing(Vec<u8>),
}

/// Loopback network between managers of one process.
#[derive(Default)]
pub struct InProcessNetwork {
    endpoints: RwLock<BTreeMap<Rank, Endpoint>>,
    /// Payloads handed to a manager.
    delivered: AtomicU64,
}

impl InProcessNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach `manager` as `rank`. The network only keeps a weak reference.
    pub fn register(&self, rank: Rank, manager: &Arc<QuiesceDbManager>) {
        let mut endpoints = self.endpoints.write().unwrap_or_else(PoisonError::into_inner);
        endpoints.insert(
            rank,
            Endpoint {
                manager: Arc::downgrade(manager),
                connected: Arc::new(AtomicBool::new(true)),
            },
        );
    }

    /// Drop everything from or to `rank`.
    pub fn disconnect(&self, rank: Rank) {
        self.set_connected(rank, false);
    }

    pub fn reconnect(&self, rank: Rank) {
        self.set_connected(rank, true);
    }

    pub fn is_connected(&self, rank: Rank) -> bool {
        let endpoints = self.endpoints.read().unwrap_or_else(PoisonError::into_inner);
        endpoints
            .get(&rank)
            .map(|endpoint| endpoint.connected.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// A transport sending as `me`, with acks going to `leader`.
    pub fn transport(self: &Arc<Self>, me: Rank, leader: Rank) -> InProcessTransport {
        InProcessTransport {
            network: Arc::clone(self),
            me,
            leader,
        }
    }

    fn set_connected(&self, rank: Rank, connected: bool) {
        let endpoints = self.endpoints.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(endpoint) = endpoints.get(&rank) {
            endpoint.connected.store(connected, Ordering::SeqCst);
        }
    }

    fn deliver(&self, from: Rank, to: Rank, payload: Payload) -> Result<(), TransportError> {
        // resolve the target and release the lock before calling into it
        let target = {
            let endpoints = self.endpoints.read().unwrap_or_else(PoisonError::into_inner);
            let sender_up = endpoints
                .get(&from)
                .map_or(true, |endpoint| endpoint.connected.load(Ordering::SeqCst));
            if !sender_up {
                return Err(TransportError::Disconnected(from));
            }
            let endpoint = endpoints.get(&to).ok_or(TransportError::UnknownRank(to))?;
            if !endpoint.connected.load(Ordering::SeqCst) {
                return Err(TransportError::Disconnected(to));
            }
            endpoint.manager.upgrade().ok_or(TransportError::UnknownRank(to))?
        };

        let accepted = match payload {
            Payload::Ack(bytes) => {
                let ack = QuiesceMap::decode(&bytes).map_err(|err| TransportError::Codec(err.to_string()))?;
                target.submit_ack_from(from, ack)
            }
            Payload::Listing(bytes) => {
                let listing =
                    QuiesceDbListing::decode(&bytes).map_err(|err| TransportError::Codec(err.to_string()))?;
                target.submit_listing_from(from, listing)
            }
        };
        accepted.map_err(|err| TransportError::Rejected {
            rank: to,
            errno: err.errno(),
        })?;

        self.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// [`QuiesceTransport`] over an [`InProcessNetwork`].
#[derive(Clone)]
pub struct InProcessTransport {
    network: Arc<InProcessNetwork>,
    me: Rank,
    leader: Rank,
}

impl QuiesceTransport for InProcessTransport {
    fn send_ack(&self, ack: QuiesceMap) -> Result<(), TransportError> {
        let bytes = ack.encode().map_err(|err| TransportError::Codec(err.to_string()))?;
        self.network.deliver(self.me, self.leader, Payload::Ack(bytes))
    }

    fn send_listing_to(&self, to: Rank, listing: QuiesceDbListing) -> Result<(), TransportError> {
        let bytes = listing.encode().map_err(|err| TransportError::Codec(err.to_string()))?;
        self.network.deliver(self.me, to, Payload::Listing(bytes))
    }
}
