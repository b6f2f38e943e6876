//! Quiesce database data model.
//!
//! Everything here is plain data plus pure helpers; the state lives in the
//! manager's engine and is only touched from the coordinator thread.

pub mod clock;
pub mod request;
pub mod roots;
pub mod state;
pub mod types;

pub use clock::{time_distance, Age, ManualClock, QuiesceClock, SystemClock, AGE_NEVER};
pub use request::{QuiesceDbRequest, QuiesceDbResponse, QuiesceError, QuiesceOp, Roots};
pub use roots::{normalize_root, sanitize_roots, RootError};
pub use state::{effective_member_state, MemberInfo, QuiesceSet, QuiesceState, TimedState};
pub use types::{Db, Epoch, QuiesceDbListing, QuiesceMap, Rank, Root, RootInfo, SetId, Version};
