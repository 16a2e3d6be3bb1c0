//! Group membership
//!
//! - `view`: member identities and the ordered, versioned view
//! - `membership`: current view, listener registry, coordinator-side join/leave
//! - `detector`: heartbeat failure detector feeding eviction

pub mod detector;
pub mod membership;
pub mod view;

pub use detector::FailureDetector;
pub use membership::{GroupMembership, MembershipListener};
pub use view::{MemberId, View, ViewId};
