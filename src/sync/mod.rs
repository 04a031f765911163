//! Queue replay and the connectivity-aware scheduling around it.

pub mod connectivity;
pub mod reconcile;

pub use connectivity::{Connectivity, Coordinator, SyncStatus};
pub use reconcile::{EntryFailure, PassResult, Reconciler};
