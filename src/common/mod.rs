//! Common utilities and types shared across fleetconf

pub mod audit;
pub mod config;
pub mod error;
pub mod hash;
pub mod tracing_middleware;
pub mod utils;

pub use audit::{audit, init_audit_log, AuditEventType};
pub use config::{Config, NodeType};
pub use error::{Error, Result};
pub use hash::{blake3_hash, rollout_bucket};
pub use utils::{generate_key, next_backoff, retry_with_backoff, timestamp_now, validate_name};
