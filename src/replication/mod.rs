//! Master/follower replication over the node listener
//!
//! Followers poll the master's data version and pull the whole dataset when
//! they fall behind. There is no log shipping: intermediate versions may be
//! skipped, and the last pulled dataset is the follower's durable state.

pub mod coordinator;
pub mod peer;
pub mod protocol;

pub use coordinator::{ReplicationCoordinator, SyncState};
pub use peer::PeerClient;
pub use protocol::{PeerRequestKind, PeerResponse, VersionResponse};
