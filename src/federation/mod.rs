// Federation sync: selective, asynchronous replication of promoted entries
// between peer ledgers. Transport is the caller's concern; peers are reached
// through the `FederationPeer` trait.

pub mod peer;
pub mod sync;
pub mod types;

pub use peer::{FederationPeer, LocalPeer};
pub use sync::{FederationSync, ReplicaStore};
pub use types::{EntrySummary, SyncError, SyncResult};
