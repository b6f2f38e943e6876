//! Quiesce states and the per-set / per-member state records.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::clock::Age;
use super::types::{Root, Version};

/// Lifecycle state of a set or of a member root.
///
/// The numeric order is meaningful: a set is only as far along as its least
/// advanced member, so aggregation takes the minimum over members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum QuiesceState {
    Invalid = 0,
    Quiescing = 1,
    Quiesced = 2,
    Releasing = 3,
    Released = 4,
    Expired = 5,
    TimedOut = 6,
    Canceled = 7,
    /// Sentinel above every real state; identity of a minimum reduction.
    Max = 8,
}

impl QuiesceState {
    /// First terminal state. Nothing leaves a terminal state.
    pub const TERMINAL_THRESHOLD: QuiesceState = QuiesceState::Released;
    /// First failure state.
    pub const FAILURE_THRESHOLD: QuiesceState = QuiesceState::Expired;

    pub fn is_terminal(self) -> bool {
        self >= Self::TERMINAL_THRESHOLD && self < QuiesceState::Max
    }

    pub fn is_failure(self) -> bool {
        self >= Self::FAILURE_THRESHOLD && self < QuiesceState::Max
    }

    /// A state that can be stored or reported (neither sentinel).
    pub fn is_valid(self) -> bool {
        self > QuiesceState::Invalid && self < QuiesceState::Max
    }

    pub fn name(self) -> &'static str {
        match self {
            QuiesceState::Invalid => "invalid",
            QuiesceState::Quiescing => "quiescing",
            QuiesceState::Quiesced => "quiesced",
            QuiesceState::Releasing => "releasing",
            QuiesceState::Released => "released",
            QuiesceState::Expired => "expired",
            QuiesceState::TimedOut => "timedout",
            QuiesceState::Canceled => "canceled",
            QuiesceState::Max => "max",
        }
    }
}

impl fmt::Display for QuiesceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A state together with the age at which it was entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimedState {
    pub state: QuiesceState,
    pub at_age: Age,
}

impl TimedState {
    pub fn new(state: QuiesceState, at_age: Age) -> Self {
        TimedState { state, at_age }
    }

    /// Enter `state` at `age`.
    ///
    /// Returns false without touching `at_age` if already in `state`.
    pub fn update(&mut self, state: QuiesceState, age: Age) -> bool {
        if self.state == state {
            return false;
        }
        self.state = state;
        self.at_age = age;
        true
    }

    /// Switch to `state` but keep counting from the current `at_age`.
    ///
    /// Release uses this so that a releasing set keeps running down the
    /// expiration that started when it became quiesced.
    pub fn relabel(&mut self, state: QuiesceState) -> bool {
        if self.state == state {
            return false;
        }
        self.state = state;
        true
    }

    /// Restart the timer of the current state. Returns false if it already
    /// started at `age`.
    pub fn refresh(&mut self, age: Age) -> bool {
        if self.at_age == age {
            return false;
        }
        self.at_age = age;
        true
    }
}

impl Default for TimedState {
    fn default() -> Self {
        TimedState::new(QuiesceState::Invalid, Age::ZERO)
    }
}

/// One root of a set. Excluded roots are kept so they can be re-included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub excluded: bool,
    pub rstate: TimedState,
}

impl MemberInfo {
    /// A freshly included member, starting to quiesce at `age`.
    pub fn quiescing(age: Age) -> Self {
        MemberInfo {
            excluded: false,
            rstate: TimedState::new(QuiesceState::Quiescing, age),
        }
    }

    pub fn is_quiescing(&self) -> bool {
        self.rstate.state == QuiesceState::Quiescing
    }

    pub fn is_failed(&self) -> bool {
        self.rstate.state.is_failure()
    }
}

/// A named group of roots quiesced and released together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuiesceSet {
    /// Aggregate state of the set.
    pub rstate: TimedState,
    /// How long a member may stay quiescing before the set times out.
    pub timeout: Duration,
    /// How long the set may stay quiesced/releasing before it expires.
    pub expiration: Duration,
    /// Db version of the last change to this set.
    pub db_version: Version,
    pub members: BTreeMap<Root, MemberInfo>,
}

impl QuiesceSet {
    /// An empty, not yet active set.
    pub fn new(timeout: Duration, expiration: Duration) -> Self {
        QuiesceSet {
            rstate: TimedState::default(),
            timeout,
            expiration,
            db_version: 0,
            members: BTreeMap::new(),
        }
    }

    pub fn state(&self) -> QuiesceState {
        self.rstate.state
    }

    pub fn is_active(&self) -> bool {
        self.rstate.state > QuiesceState::Invalid && self.rstate.state < QuiesceState::TERMINAL_THRESHOLD
    }

    pub fn is_quiescing(&self) -> bool {
        self.rstate.state == QuiesceState::Quiescing
    }

    pub fn is_quiesced(&self) -> bool {
        self.rstate.state == QuiesceState::Quiesced
    }

    pub fn is_releasing(&self) -> bool {
        self.rstate.state == QuiesceState::Releasing
    }

    pub fn is_released(&self) -> bool {
        self.rstate.state == QuiesceState::Released
    }

    /// Roots that are currently part of the set.
    pub fn included_roots(&self) -> impl Iterator<Item = &Root> {
        self.members
            .iter()
            .filter(|(_, member)| !member.excluded)
            .map(|(root, _)| root)
    }

    /// State the set should move to given the minimum state of its members.
    ///
    /// A releasing set whose members are still quiesced stays releasing.
    pub fn next_state(&self, min_member_state: QuiesceState) -> QuiesceState {
        debug_assert!(min_member_state > QuiesceState::Invalid);
        debug_assert!(self.rstate.state < QuiesceState::TERMINAL_THRESHOLD);

        if self.is_releasing() && min_member_state == QuiesceState::Quiesced {
            return QuiesceState::Releasing;
        }
        min_member_state
    }

    /// How a member state (own or peer-reported) counts towards this set.
    pub fn effective_member_state(&self, reported: QuiesceState) -> QuiesceState {
        effective_member_state(self.rstate.state, reported)
    }
}

/// Interpret a member state in the light of the owning set's state.
///
/// Failures always count. While releasing, a quiesced member is considered
/// releasing and any progress up to released counts. While otherwise active,
/// quiescing and quiesced count. Anything else reads as the set state.
pub fn effective_member_state(set_state: QuiesceState, reported: QuiesceState) -> QuiesceState {
    if reported.is_failure() {
        return reported;
    }
    match set_state {
        QuiesceState::Releasing => match reported {
            QuiesceState::Quiesced => QuiesceState::Releasing,
            QuiesceState::Quiescing | QuiesceState::Releasing | QuiesceState::Released => reported,
            _ => set_state,
        },
        QuiesceState::Quiescing | QuiesceState::Quiesced => match reported {
            QuiesceState::Quiescing | QuiesceState::Quiesced => reported,
            _ => set_state,
        },
        _ => set_state,
    }
}
