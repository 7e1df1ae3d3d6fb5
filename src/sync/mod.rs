#![doc = include_str!("README.md")]

pub mod coordinator;
pub mod diff;
pub mod types;

#[doc(inline)]
pub use coordinator::{DataSync, SyncStateCallback};
#[doc(inline)]
pub use diff::SnapshotDiffer;
#[doc(inline)]
pub use types::{
    ChangeEvent, ChangeKind, ConflictKind, ConflictStrategy, SubscriptionState, SyncConfig,
    SyncError, SyncErrorKind, SyncState,
};
