//! Requests, responses and result codes.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use thiserror::Error;

use super::clock::Age;
use super::state::QuiesceSet;
use super::types::{Epoch, Root, SetId, Version};

/// Set of roots named by a request.
pub type Roots = BTreeSet<Root>;

/// Failure of a request.
///
/// Each variant carries a POSIX code; callers building barriers on top of
/// awaits depend on the exact code, see [`QuiesceError::errno`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QuiesceError {
    /// Malformed request or root.
    #[error("invalid request")]
    InvalidRequest,
    /// The addressed set does not exist.
    #[error("no such quiesce set")]
    NotFound,
    /// The set's version did not match `if_version`.
    #[error("quiesce set version mismatch")]
    Stale,
    /// The operation is illegal in the set's current state, or this rank is not the leader.
    #[error("operation not permitted")]
    NotPermitted,
    /// The await expired before the set got there, or leadership was lost.
    #[error("operation still in progress")]
    InProgress,
    /// The set was canceled.
    #[error("quiesce set canceled")]
    Canceled,
    /// The set timed out quiescing or expired.
    #[error("quiesce set timed out")]
    TimedOut,
    /// The set's roots changed while awaiting.
    #[error("await interrupted by a change of roots")]
    Interrupted,
}

impl QuiesceError {
    /// POSIX code of this error.
    pub fn errno(self) -> i32 {
        match self {
            QuiesceError::InvalidRequest => libc::EINVAL,
            QuiesceError::NotFound => libc::ENOENT,
            QuiesceError::Stale => libc::ESTALE,
            QuiesceError::NotPermitted => libc::EPERM,
            QuiesceError::InProgress => libc::EINPROGRESS,
            QuiesceError::Canceled => libc::ECANCELED,
            QuiesceError::TimedOut => libc::ETIMEDOUT,
            QuiesceError::Interrupted => libc::EINTR,
        }
    }
}

/// What a request does to the roots of its set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuiesceOp {
    /// Add roots (upsert). With no roots and no parameter change this is a query.
    Include(Roots),
    /// Remove roots.
    Exclude(Roots),
    /// Make the set contain exactly these roots, resurrecting it if terminal.
    Reset(Roots),
    /// Release a quiesced set.
    Release,
    /// Cancel the addressed set, or every active set when no set is named.
    Cancel,
}

/// A request against the quiesce database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuiesceDbRequest {
    pub set_id: Option<SetId>,
    /// Only apply if the set is at exactly this version (0: the set must be new).
    pub if_version: Option<Version>,
    pub timeout: Option<Duration>,
    pub expiration: Option<Duration>,
    /// Complete only once the set is quiesced (or released, for a release).
    pub await_for: Option<Duration>,
    pub op: QuiesceOp,
}

impl QuiesceDbRequest {
    pub fn new(op: QuiesceOp) -> Self {
        QuiesceDbRequest {
            set_id: None,
            if_version: None,
            timeout: None,
            expiration: None,
            await_for: None,
            op,
        }
    }

    /// Quiesce `roots`, creating a new set unless a set id is added.
    pub fn include<I, R>(roots: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<Root>,
    {
        Self::new(QuiesceOp::Include(roots.into_iter().map(Into::into).collect()))
    }

    pub fn exclude<I, R>(set_id: impl Into<SetId>, roots: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<Root>,
    {
        Self::new(QuiesceOp::Exclude(roots.into_iter().map(Into::into).collect())).with_set_id(set_id)
    }

    pub fn reset<I, R>(set_id: impl Into<SetId>, roots: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<Root>,
    {
        Self::new(QuiesceOp::Reset(roots.into_iter().map(Into::into).collect())).with_set_id(set_id)
    }

    /// Query one set.
    pub fn query(set_id: impl Into<SetId>) -> Self {
        Self::new(QuiesceOp::Include(Roots::new())).with_set_id(set_id)
    }

    /// Query every set.
    pub fn query_all() -> Self {
        Self::new(QuiesceOp::Include(Roots::new()))
    }

    pub fn release(set_id: impl Into<SetId>) -> Self {
        Self::new(QuiesceOp::Release).with_set_id(set_id)
    }

    pub fn cancel(set_id: impl Into<SetId>) -> Self {
        Self::new(QuiesceOp::Cancel).with_set_id(set_id)
    }

    pub fn cancel_all() -> Self {
        Self::new(QuiesceOp::Cancel)
    }

    pub fn with_set_id(mut self, set_id: impl Into<SetId>) -> Self {
        self.set_id = Some(set_id.into());
        self
    }

    pub fn with_if_version(mut self, version: Version) -> Self {
        self.if_version = Some(version);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn with_await(mut self, await_for: Duration) -> Self {
        self.await_for = Some(await_for);
        self
    }

    /// Roots named by the op, if any.
    pub fn roots(&self) -> Option<&Roots> {
        match &self.op {
            QuiesceOp::Include(roots) | QuiesceOp::Exclude(roots) | QuiesceOp::Reset(roots) => Some(roots),
            QuiesceOp::Release | QuiesceOp::Cancel => None,
        }
    }

    pub fn roots_mut(&mut self) -> Option<&mut Roots> {
        match &mut self.op {
            QuiesceOp::Include(roots) | QuiesceOp::Exclude(roots) | QuiesceOp::Reset(roots) => Some(roots),
            QuiesceOp::Release | QuiesceOp::Cancel => None,
        }
    }

    fn has_roots(&self) -> bool {
        self.roots().is_some_and(|roots| !roots.is_empty())
    }

    /// Structural validity, checked before anything else.
    pub fn is_valid(&self) -> bool {
        match &self.op {
            QuiesceOp::Exclude(roots) | QuiesceOp::Reset(roots) if roots.is_empty() => return false,
            _ => {}
        }

        // anything goes for a named set, and a new set must bring roots;
        // the only wildcards are a plain query and cancel-all
        self.set_id.is_some()
            || self.includes_roots()
            || ((self.is_cancel_all() || self.is_query())
                && self.await_for.is_none()
                && self.timeout.is_none()
                && self.expiration.is_none()
                && self.if_version.is_none())
    }

    /// Whether the request changes anything when applied.
    pub fn is_mutating(&self) -> bool {
        match &self.op {
            QuiesceOp::Include(roots) => !roots.is_empty() || self.timeout.is_some() || self.expiration.is_some(),
            _ => true,
        }
    }

    pub fn is_release(&self) -> bool {
        matches!(self.op, QuiesceOp::Release)
    }

    pub fn is_reset(&self) -> bool {
        matches!(self.op, QuiesceOp::Reset(_))
    }

    pub fn is_cancel(&self) -> bool {
        matches!(self.op, QuiesceOp::Cancel)
    }

    pub fn is_cancel_all(&self) -> bool {
        self.is_cancel() && self.set_id.is_none()
    }

    pub fn is_query(&self) -> bool {
        matches!(&self.op, QuiesceOp::Include(roots) if roots.is_empty())
    }

    /// Whether roots will be added to the set.
    pub fn includes_roots(&self) -> bool {
        matches!(self.op, QuiesceOp::Include(_) | QuiesceOp::Reset(_)) && self.has_roots()
    }

    /// Whether an existing member `root` is excluded by this request.
    pub fn should_exclude(&self, root: &Root) -> bool {
        match &self.op {
            QuiesceOp::Include(_) | QuiesceOp::Release => false,
            QuiesceOp::Exclude(roots) => roots.contains(root),
            QuiesceOp::Reset(roots) => !roots.contains(root),
            QuiesceOp::Cancel => true,
        }
    }
}

/// Completion of a request.
///
/// The database fields are only filled in by the leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuiesceDbResponse {
    pub result: Result<(), QuiesceError>,
    pub db_version: Version,
    pub db_age: Age,
    pub epoch: Epoch,
    /// The addressed set, or every set for a wildcard query.
    pub sets: BTreeMap<SetId, QuiesceSet>,
}

impl QuiesceDbResponse {
    /// A response carrying only a result.
    pub fn from_result(result: Result<(), QuiesceError>) -> Self {
        QuiesceDbResponse {
            result,
            db_version: 0,
            db_age: Age::ZERO,
            epoch: 0,
            sets: BTreeMap::new(),
        }
    }

    /// 0 on success, otherwise the POSIX code.
    pub fn result_code(&self) -> i32 {
        match self.result {
            Ok(()) => 0,
            Err(err) => err.errno(),
        }
    }

    /// The single set of the response, for requests addressing one set.
    pub fn set(&self) -> Option<(&SetId, &QuiesceSet)> {
        self.sets.iter().next()
    }
}
