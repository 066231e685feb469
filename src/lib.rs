//! # fleetconf
//!
//! A versioned client configuration server:
//! - Per-app configs of type int, float, string, code (rule expressions) and
//!   template (nested app configs)
//! - Rules matched against client attributes (OS, versions, IP, language,
//!   device rollout buckets)
//! - Immutable in-memory snapshots swapped atomically after every write
//! - One master accepting admin writes, followers pulling full datasets
//!
//! ## Architecture
//!
//! ```text
//!            admin writes (/op/*)
//!                   │
//! ┌─────────────────▼────────────────┐   POST /node/req/version|pull|register
//! │ Master                           │◄──────────────────────────┐
//! │  DurableStore ─► SnapshotStore   │                           │
//! │                  ─► Matcher      │              ┌────────────┴───────────┐
//! └─────────────────┬────────────────┘              │ Follower               │
//!                   │ GET /client/conf              │  pulls when behind,    │
//!                   ▼                               │  serves last snapshot  │
//!                clients ◄──────────────────────────┤                        │
//!                                                   └────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a master
//! ```bash
//! fleetconf serve --node-type master \
//!   --client-addr 0.0.0.0:17070 \
//!   --node-addr 0.0.0.0:17071 \
//!   --db ./fleetconf-data
//! ```
//!
//! ### Start a follower
//! ```bash
//! fleetconf serve --node-type slave \
//!   --client-addr 0.0.0.0:18070 \
//!   --node-addr 0.0.0.0:18071 \
//!   --master-addr master.internal:17071
//! ```
//!
//! ### Ask for a configuration
//! ```bash
//! curl 'http://localhost:17070/client/conf?app_key=...&os_type=ios&os_version=17.2&app_version=2.1.0&ip=10.0.0.7&lang=en&device_id=abc'
//! ```

#![allow(clippy::result_large_err)]

pub mod common;
pub mod matcher;
pub mod replication;
pub mod server;
pub mod snapshot;
pub mod store;

// Re-export commonly used types
pub use common::{Config, Error, NodeType, Result};
pub use matcher::{ClientRequest, Matcher};
pub use replication::ReplicationCoordinator;
pub use server::ConfServer;
pub use snapshot::{Snapshot, SnapshotStore};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
