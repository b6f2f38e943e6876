//! Await resolution.

use crate::db::{Age, QuiesceError, QuiesceState, AGE_NEVER};

use super::QuiesceDbEngine;

/// How the state of a set resolves an await on it.
///
/// `None` means the state alone doesn't decide, the await stays pending until
/// its own deadline.
pub(crate) fn await_outcome(state: QuiesceState, is_release: bool) -> Option<Result<(), QuiesceError>> {
    match state {
        QuiesceState::Canceled => Some(Err(QuiesceError::Canceled)),
        QuiesceState::Expired | QuiesceState::TimedOut => Some(Err(QuiesceError::TimedOut)),
        QuiesceState::Quiesced if !is_release => Some(Ok(())),
        QuiesceState::Quiescing if !is_release => None,
        QuiesceState::Released if is_release => Some(Ok(())),
        QuiesceState::Releasing if is_release => None,
        // a release await on a set that isn't releasing, or the other way around
        QuiesceState::Quiescing | QuiesceState::Quiesced | QuiesceState::Releasing | QuiesceState::Released => {
            Some(Err(QuiesceError::NotPermitted))
        }
        QuiesceState::Invalid | QuiesceState::Max => None,
    }
}

impl QuiesceDbEngine {
    /// Complete every await that can be decided now.
    ///
    /// Returns the earliest deadline among the awaits left pending.
    pub(super) fn upkeep_awaits(&mut self) -> Age {
        let db_age = self.age();
        let mut next_event_at_age = AGE_NEVER;

        for (set_id, waiters) in self.awaits.iter_mut() {
            let set = self.db.sets.get(set_id);
            let mut pending = Vec::with_capacity(waiters.len());

            for await_ctx in waiters.drain(..) {
                let outcome = match set {
                    None => Some(Err(QuiesceError::NotFound)),
                    Some(set) => await_outcome(set.state(), await_ctx.req_ctx.request.is_release()),
                };
                let outcome = outcome.or_else(|| (db_age >= await_ctx.expire_at_age).then_some(Err(QuiesceError::InProgress)));

                match outcome {
                    Some(result) => {
                        tracing::debug!(
                            set_id = %set_id,
                            request = await_ctx.req_ctx.id,
                            ?result,
                            "completing an await"
                        );
                        self.done_requests.push((await_ctx.req_ctx, result));
                    }
                    None => {
                        next_event_at_age = next_event_at_age.min(await_ctx.expire_at_age);
                        pending.push(await_ctx);
                    }
                }
            }
            *waiters = pending;
        }
        self.awaits.retain(|_, waiters| !waiters.is_empty());

        next_event_at_age
    }
}
