//! Audit logging for admin writes and node registrations
//!
//! Entries are JSON lines appended to the audit file and mirrored through
//! `tracing` under the `audit` target.

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// Audit log event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventType {
    UserCreated,
    AppCreated,
    ConfigCreated,
    ConfigUpdated,
    ConfigDeleted,
    NodeRegistered,
    DatasetPulled,
}

/// Audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    pub event: AuditEventType,
    pub actor: String,
    pub target: Option<String>,
    pub data_version: u64,
    pub message: String,
}

/// Audit logger
pub struct AuditLogger {
    file: Option<Mutex<File>>,
}

static AUDIT_LOGGER: OnceCell<AuditLogger> = OnceCell::new();

/// Install the process-wide audit logger; later calls are ignored
pub fn init_audit_log(path: &Path) {
    let _ = AUDIT_LOGGER.set(AuditLogger::new(path));
}

/// Process-wide audit logger (tracing only until `init_audit_log` runs)
pub fn audit() -> &'static AuditLogger {
    AUDIT_LOGGER.get_or_init(AuditLogger::disabled)
}

impl AuditLogger {
    /// Create an audit logger appending to `path`
    pub fn new(path: &Path) -> Self {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                tracing::warn!("Audit log {} unavailable: {}", path.display(), e);
                e
            })
            .ok()
            .map(Mutex::new);
        Self { file }
    }

    /// Audit logger that only emits tracing events
    pub fn disabled() -> Self {
        Self { file: None }
    }

    /// Log an audit entry
    pub fn log(&self, entry: AuditEntry) {
        tracing::info!(
            target: "audit",
            event = ?entry.event,
            actor = %entry.actor,
            target_key = entry.target.as_deref().unwrap_or("-"),
            data_version = entry.data_version,
            "{}",
            entry.message
        );
        let line = serde_json::to_string(&entry).unwrap_or_else(|_| "{}".to_string());
        if let Some(file) = &self.file {
            if let Ok(mut f) = file.lock() {
                let _ = writeln!(f, "{}", line);
            }
        }
    }

    /// Convenience for logging an event
    pub fn log_event(
        &self,
        event: AuditEventType,
        actor: impl Into<String>,
        target: Option<String>,
        data_version: u64,
        message: impl Into<String>,
    ) {
        self.log(AuditEntry {
            timestamp: Utc::now(),
            event,
            actor: actor.into(),
            target,
            data_version,
            message: message.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_log_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let logger = AuditLogger::new(&path);
        logger.log_event(
            AuditEventType::ConfigCreated,
            "admin",
            Some("cfg-1".to_string()),
            7,
            "config created",
        );
        logger.log_event(AuditEventType::NodeRegistered, "node", None, 7, "joined");

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let entry: AuditEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(entry.event, AuditEventType::ConfigCreated);
        assert_eq!(entry.data_version, 7);
    }

    #[test]
    fn test_disabled_logger_does_not_panic() {
        AuditLogger::disabled().log_event(
            AuditEventType::UserCreated,
            "admin",
            None,
            1,
            "user created",
        );
    }
}
