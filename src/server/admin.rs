//! Admin writes: users, apps and configs
//!
//! Every write runs under the admin lock and commits the record together with
//! the data version bump in one transaction, then reloads the store and swaps
//! the snapshot. Only the master accepts them.

use crate::common::{
    audit, generate_key, timestamp_now, validate_name, AuditEventType, Error, Result,
};
use crate::replication::ReplicationCoordinator;
use crate::snapshot::resolved::parse_value;
use crate::snapshot::{AdminGuard, ResolvedValue, Snapshot, SnapshotStore};
use crate::store::{App, ConfigEntry, Record, Txn, User, ValueType};
use std::sync::Arc;

#[derive(Clone)]
pub struct AdminService {
    snapshots: Arc<SnapshotStore>,
    coordinator: Arc<ReplicationCoordinator>,
}

impl AdminService {
    pub fn new(snapshots: Arc<SnapshotStore>, coordinator: Arc<ReplicationCoordinator>) -> Self {
        Self {
            snapshots,
            coordinator,
        }
    }

    /// Version the next commit will carry; stable while the admin lock is held
    fn next_version(&self, _guard: &AdminGuard<'_>) -> Result<u64> {
        Ok(self.snapshots.store().get_data_version()? + 1)
    }

    /// Commit `txn` plus the version bump, then rebuild. Returns the new version.
    fn commit_locked(&self, guard: &AdminGuard<'_>, mut txn: Txn) -> Result<u64> {
        let store = self.snapshots.store();
        let version = self.next_version(guard)?;
        store.update_record(Some(&mut txn), Record::DataVersion(version))?;
        store.commit(txn)?;
        self.snapshots.reload_locked(guard)?;
        Ok(version)
    }

    pub fn new_user(&self, name: &str) -> Result<User> {
        self.coordinator.ensure_writable()?;
        validate_name("user name", name)?;

        let guard = self.snapshots.admin_lock();
        if self.snapshots.load().user_by_name(name).is_some() {
            return Err(Error::AlreadyExists(format!("user {}", name)));
        }

        let user = User {
            key: generate_key(),
            name: name.to_string(),
            created_utc: timestamp_now(),
        };
        let mut txn = Txn::new();
        txn.insert(Record::User(user.clone()));
        let version = self.commit_locked(&guard, txn)?;

        audit().log_event(
            AuditEventType::UserCreated,
            user.name.clone(),
            Some(user.key.clone()),
            version,
            format!("Created user {}", user.name),
        );
        Ok(user)
    }

    pub fn new_app(&self, user_key: &str, name: &str) -> Result<App> {
        self.coordinator.ensure_writable()?;
        validate_name("app name", name)?;

        let guard = self.snapshots.admin_lock();
        let snapshot = self.snapshots.load();
        let user = snapshot
            .user(user_key)
            .ok_or_else(|| Error::NotFound(format!("user {}", user_key)))?;

        let app = App {
            key: generate_key(),
            user_key: user.key.clone(),
            name: name.to_string(),
            created_utc: timestamp_now(),
        };
        let mut txn = Txn::new();
        txn.insert(Record::App(app.clone()));
        let version = self.commit_locked(&guard, txn)?;

        audit().log_event(
            AuditEventType::AppCreated,
            user.name.clone(),
            Some(app.key.clone()),
            version,
            format!("Created app {}", app.name),
        );
        Ok(app)
    }

    pub fn new_config(&self, app_key: &str, k: &str, v: &str, v_type: ValueType) -> Result<ConfigEntry> {
        self.coordinator.ensure_writable()?;
        validate_name("config key", k)?;

        let guard = self.snapshots.admin_lock();
        let snapshot = self.snapshots.load();
        if snapshot.app(app_key).is_none() {
            return Err(Error::NotFound(format!("app {}", app_key)));
        }
        check_value(&snapshot, v_type, v)?;

        let now = timestamp_now();
        let entry = ConfigEntry {
            key: generate_key(),
            app_key: app_key.to_string(),
            k: k.to_string(),
            v: v.to_string(),
            v_type,
            seq: self.next_version(&guard)?,
            created_utc: now,
            updated_utc: now,
        };
        let mut txn = Txn::new();
        txn.insert(Record::Config(entry.clone()));
        let version = self.commit_locked(&guard, txn)?;

        audit().log_event(
            AuditEventType::ConfigCreated,
            app_key.to_string(),
            Some(entry.key.clone()),
            version,
            format!("Created config {} ({})", entry.k, entry.v_type),
        );
        Ok(entry)
    }

    /// Replace the value (and optionally the type) of a config
    pub fn update_config(&self, key: &str, v: &str, v_type: Option<ValueType>) -> Result<ConfigEntry> {
        self.coordinator.ensure_writable()?;

        let guard = self.snapshots.admin_lock();
        let snapshot = self.snapshots.load();
        let mut entry = snapshot
            .raw_config(key)
            .map(|c| c.as_ref().clone())
            .ok_or_else(|| Error::NotFound(format!("config {}", key)))?;

        let v_type = v_type.unwrap_or(entry.v_type);
        check_value(&snapshot, v_type, v)?;
        entry.v = v.to_string();
        entry.v_type = v_type;
        entry.updated_utc = timestamp_now();

        let mut txn = Txn::new();
        txn.update(Record::Config(entry.clone()));
        let version = self.commit_locked(&guard, txn)?;

        audit().log_event(
            AuditEventType::ConfigUpdated,
            entry.app_key.clone(),
            Some(entry.key.clone()),
            version,
            format!("Updated config {}", entry.k),
        );
        Ok(entry)
    }

    pub fn delete_config(&self, key: &str) -> Result<()> {
        self.coordinator.ensure_writable()?;

        let guard = self.snapshots.admin_lock();
        let entry = self
            .snapshots
            .load()
            .raw_config(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("config {}", key)))?;

        let mut txn = Txn::new();
        txn.delete(Record::Config(entry.as_ref().clone()));
        let version = self.commit_locked(&guard, txn)?;

        audit().log_event(
            AuditEventType::ConfigDeleted,
            entry.app_key.clone(),
            Some(entry.key.clone()),
            version,
            format!("Deleted config {}", entry.k),
        );
        Ok(())
    }
}

/// Reject values that would never resolve
fn check_value(snapshot: &Snapshot, v_type: ValueType, v: &str) -> Result<()> {
    match parse_value(v_type, v) {
        ResolvedValue::Invalid { reason, .. } => Err(Error::InvalidRequest(format!(
            "{} value {:?}: {}",
            v_type, v, reason
        ))),
        ResolvedValue::Template(target) if snapshot.app(&target).is_none() => Err(
            Error::InvalidRequest(format!("template refers to unknown app {}", target)),
        ),
        _ => Ok(()),
    }
}
