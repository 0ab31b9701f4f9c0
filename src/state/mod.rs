//! Build persistence.
//!
//! A build is saved after every scheduling round so an interrupted run can
//! pick up where it stopped.

mod snapshot;

pub use snapshot::{BuildSnapshot, SnapshotStore, SNAPSHOT_VERSION};
