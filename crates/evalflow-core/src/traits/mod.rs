//! Collaborator traits: the seams between the scheduler core and its stores,
//! notifiers and clock.

pub mod clock;
pub mod lock;
pub mod notify;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use lock::DistributedLock;
pub use notify::{GroupMembershipSyncer, NotificationSender};
pub use store::{EvaluationStore, JobStore, LockGraph};
