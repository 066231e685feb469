//! Versioned in-memory snapshot of the durable store
//!
//! A [`Snapshot`] holds every index the read path needs at one data version.
//! [`SnapshotStore`] swaps whole snapshots; it never patches one in place.
//!
//! Two locks, always taken in this order:
//! 1. the admin lock ([`AdminGuard`]), held for a whole admin write or
//!    replication apply, so only one writer touches the data version at a time;
//! 2. the snapshot lock, held only for the pointer swap (writers) or an `Arc`
//!    clone (readers).
//!
//! Readers never wait on the admin lock, and a reader always sees one complete
//! snapshot.

pub mod resolved;

pub use resolved::{ResolvedConfig, ResolvedValue};

use crate::common::{timestamp_now, Config, Error, NodeType, Result};
use crate::store::{App, ConfigEntry, Dataset, DurableStore, Node, Record, User};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// Who this process is in the node registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    /// Client address, the registry key
    pub url: String,
    /// Peer address
    pub node_url: String,
    pub node_type: NodeType,
}

impl From<&Config> for NodeIdentity {
    fn from(config: &Config) -> Self {
        Self {
            url: config.client_addr.clone(),
            node_url: config.node_addr.clone(),
            node_type: config.node_type,
        }
    }
}

/// Complete read-only view of users, apps, configs and nodes at one data version
#[derive(Debug, Default)]
pub struct Snapshot {
    data_version: u64,
    users: Vec<Arc<User>>,
    users_by_key: HashMap<String, Arc<User>>,
    users_by_name: HashMap<String, Arc<User>>,
    apps: Vec<Arc<App>>,
    apps_by_key: HashMap<String, Arc<App>>,
    apps_by_name: HashMap<String, Vec<Arc<App>>>,
    raw_configs: Vec<Arc<ConfigEntry>>,
    raw_configs_by_key: HashMap<String, Arc<ConfigEntry>>,
    configs_by_key: HashMap<String, Arc<ResolvedConfig>>,
    app_configs: HashMap<String, Vec<Arc<ResolvedConfig>>>,
    nodes: HashMap<String, Node>,
}

impl Snapshot {
    /// Build every index from a dataset. Configs whose app does not exist are skipped.
    pub fn build(dataset: Dataset) -> Self {
        let mut snapshot = Snapshot {
            data_version: dataset.data_version,
            ..Default::default()
        };

        for user in dataset.users {
            let user = Arc::new(user);
            snapshot.users_by_key.insert(user.key.clone(), user.clone());
            snapshot
                .users_by_name
                .insert(user.name.clone(), user.clone());
            snapshot.users.push(user);
        }

        for app in dataset.apps {
            let app = Arc::new(app);
            snapshot.apps_by_key.insert(app.key.clone(), app.clone());
            snapshot
                .apps_by_name
                .entry(app.name.clone())
                .or_default()
                .push(app.clone());
            // Known apps resolve to an empty mapping, unknown ones to nothing
            snapshot.app_configs.insert(app.key.clone(), Vec::new());
            snapshot.apps.push(app);
        }

        for entry in dataset.configs {
            let Some(configs) = snapshot.app_configs.get_mut(&entry.app_key) else {
                tracing::warn!(
                    config_key = %entry.key,
                    app_key = %entry.app_key,
                    "Skipping config of unknown app"
                );
                continue;
            };
            let resolved = Arc::new(ResolvedConfig::from_entry(&entry));
            if let ResolvedValue::Invalid { reason, .. } = &resolved.value {
                tracing::warn!(
                    config_key = %entry.key,
                    app_key = %entry.app_key,
                    k = %entry.k,
                    "Config value does not parse as {}: {}",
                    entry.v_type,
                    reason
                );
            }
            configs.push(resolved.clone());
            snapshot
                .configs_by_key
                .insert(entry.key.clone(), resolved);
            let entry = Arc::new(entry);
            snapshot
                .raw_configs_by_key
                .insert(entry.key.clone(), entry.clone());
            snapshot.raw_configs.push(entry);
        }

        for node in dataset.nodes {
            snapshot.nodes.insert(node.url.clone(), node);
        }

        snapshot
    }

    pub fn data_version(&self) -> u64 {
        self.data_version
    }

    pub fn user(&self, key: &str) -> Option<&Arc<User>> {
        self.users_by_key.get(key)
    }

    pub fn user_by_name(&self, name: &str) -> Option<&Arc<User>> {
        self.users_by_name.get(name)
    }

    /// Users in stored order
    pub fn users(&self) -> &[Arc<User>] {
        &self.users
    }

    pub fn app(&self, key: &str) -> Option<&Arc<App>> {
        self.apps_by_key.get(key)
    }

    /// Apps sharing a display name
    pub fn apps_by_name(&self, name: &str) -> &[Arc<App>] {
        self.apps_by_name
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Apps created by a user, in stored order
    pub fn apps_of_user(&self, user_key: &str) -> Vec<Arc<App>> {
        self.apps
            .iter()
            .filter(|a| a.user_key == user_key)
            .cloned()
            .collect()
    }

    pub fn config(&self, key: &str) -> Option<&Arc<ResolvedConfig>> {
        self.configs_by_key.get(key)
    }

    pub fn raw_config(&self, key: &str) -> Option<&Arc<ConfigEntry>> {
        self.raw_configs_by_key.get(key)
    }

    /// Stored configs of an app, in stored order
    pub fn raw_configs_of_app(&self, app_key: &str) -> Vec<Arc<ConfigEntry>> {
        self.raw_configs
            .iter()
            .filter(|c| c.app_key == app_key)
            .cloned()
            .collect()
    }

    /// Resolved configs of an app in stored order; `None` for an unknown app
    pub fn app_configs(&self, app_key: &str) -> Option<&[Arc<ResolvedConfig>]> {
        self.app_configs.get(app_key).map(Vec::as_slice)
    }

    pub fn node(&self, url: &str) -> Option<&Node> {
        self.nodes.get(url)
    }

    /// Nodes ordered by URL
    pub fn nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.url.cmp(&b.url));
        nodes
    }

    /// The master registered in this snapshot, if any
    pub fn master(&self) -> Option<&Node> {
        self.nodes.values().find(|n| n.node_type.is_master())
    }

    /// Reconstruct the dataset this snapshot was built from (minus skipped configs)
    pub fn to_dataset(&self) -> Dataset {
        Dataset {
            users: self.users.iter().map(|u| u.as_ref().clone()).collect(),
            apps: self.apps.iter().map(|a| a.as_ref().clone()).collect(),
            configs: self
                .raw_configs
                .iter()
                .map(|c| c.as_ref().clone())
                .collect(),
            nodes: self.nodes(),
            data_version: self.data_version,
        }
    }
}

/// Proof that the admin lock is held
pub struct AdminGuard<'a> {
    owner: &'a SnapshotStore,
    _guard: MutexGuard<'a, ()>,
}

/// Owner of the current snapshot
pub struct SnapshotStore {
    identity: NodeIdentity,
    store: Arc<dyn DurableStore>,
    admin: Mutex<()>,
    current: RwLock<Arc<Snapshot>>,
}

impl SnapshotStore {
    /// Create a store holding an empty snapshot at version 0
    pub fn new(identity: NodeIdentity, store: Arc<dyn DurableStore>) -> Self {
        Self {
            identity,
            store,
            admin: Mutex::new(()),
            current: RwLock::new(Arc::new(Snapshot::default())),
        }
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    /// Take the admin-serialization lock
    pub fn admin_lock(&self) -> AdminGuard<'_> {
        AdminGuard {
            owner: self,
            _guard: self.admin.lock(),
        }
    }

    /// Current snapshot
    pub fn load(&self) -> Arc<Snapshot> {
        self.current.read().clone()
    }

    pub fn current_version(&self) -> u64 {
        self.current.read().data_version
    }

    /// Resolved configs of an app; callers must treat them as read-only
    pub fn app_configs(&self, app_key: &str) -> Option<Vec<Arc<ResolvedConfig>>> {
        self.current
            .read()
            .app_configs(app_key)
            .map(|configs| configs.to_vec())
    }

    /// Replace the snapshot with one built from `dataset`
    pub fn rebuild(&self, dataset: Dataset) -> Result<Arc<Snapshot>> {
        let guard = self.admin_lock();
        self.rebuild_locked(&guard, dataset)
    }

    /// Reload everything from the durable store and rebuild
    pub fn reload_locked(&self, guard: &AdminGuard<'_>) -> Result<Arc<Snapshot>> {
        let dataset = self.store.load_dataset()?;
        self.rebuild_locked(guard, dataset)
    }

    /// Replace the snapshot; the caller already holds the admin lock.
    ///
    /// Registers this node in the durable store first when the dataset has no
    /// entry for it, or one with a stale type or peer address. If that write
    /// fails nothing is swapped.
    pub fn rebuild_locked(&self, guard: &AdminGuard<'_>, mut dataset: Dataset) -> Result<Arc<Snapshot>> {
        debug_assert!(std::ptr::eq(guard.owner, self), "admin guard of another store");

        self.ensure_self_registered(&mut dataset)?;

        let version = dataset.data_version;
        let snapshot = Arc::new(Snapshot::build(dataset));
        *self.current.write() = snapshot.clone();

        tracing::debug!(data_version = version, "Snapshot rebuilt");
        Ok(snapshot)
    }

    fn ensure_self_registered(&self, dataset: &mut Dataset) -> Result<()> {
        let me = &self.identity;
        match dataset.nodes.iter_mut().find(|n| n.url == me.url) {
            Some(node) if node.node_type == me.node_type && node.node_url == me.node_url => {}
            Some(node) => {
                let mut updated = node.clone();
                updated.node_type = me.node_type;
                updated.node_url = me.node_url.clone();
                self.store
                    .update_record(None, Record::Node(updated.clone()))
                    .map_err(|e| Error::Registration(format!("update {}: {}", me.url, e)))?;
                tracing::info!(
                    url = %me.url,
                    node_type = %me.node_type,
                    "Updated node registration"
                );
                *node = updated;
            }
            None => {
                let node = Node {
                    url: me.url.clone(),
                    node_url: me.node_url.clone(),
                    node_type: me.node_type,
                    data_version: dataset.data_version,
                    created_utc: timestamp_now(),
                    last_check_utc: 0,
                };
                // The dataset may predate a row already in the store
                match self.store.insert_record(None, Record::Node(node.clone())) {
                    Err(Error::AlreadyExists(_)) => {
                        self.store.update_record(None, Record::Node(node.clone()))
                    }
                    other => other,
                }
                .map_err(|e| Error::Registration(format!("insert {}: {}", me.url, e)))?;
                tracing::info!(
                    url = %me.url,
                    node_type = %me.node_type,
                    "Registered node"
                );
                dataset.nodes.push(node);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, ValueType};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn identity() -> NodeIdentity {
        NodeIdentity {
            url: "127.0.0.1:17070".into(),
            node_url: "127.0.0.1:17071".into(),
            node_type: NodeType::Master,
        }
    }

    fn dataset(version: u64, configs_per_app: usize) -> Dataset {
        let apps: Vec<App> = (0..3)
            .map(|i| App {
                key: format!("app-{}", i),
                user_key: "u1".into(),
                name: if i < 2 { "shared".into() } else { format!("solo-{}", i) },
                created_utc: i,
            })
            .collect();
        let mut configs = Vec::new();
        for app in &apps {
            for j in 0..configs_per_app {
                configs.push(ConfigEntry {
                    key: format!("{}-cfg-{}", app.key, j),
                    app_key: app.key.clone(),
                    k: format!("k{}", j),
                    v: format!("{}", version * 100 + j as u64),
                    v_type: ValueType::Int,
                    seq: j as u64,
                    created_utc: j as u64,
                    updated_utc: j as u64,
                });
            }
        }
        Dataset {
            users: vec![User {
                key: "u1".into(),
                name: "alice".into(),
                created_utc: 0,
            }],
            apps,
            configs,
            nodes: vec![],
            data_version: version,
        }
    }

    #[test]
    fn test_indices() {
        let mut ds = dataset(4, 2);
        ds.configs.push(ConfigEntry {
            key: "orphan".into(),
            app_key: "missing-app".into(),
            k: "x".into(),
            v: "1".into(),
            v_type: ValueType::Int,
            seq: 0,
            created_utc: 0,
            updated_utc: 0,
        });
        let snapshot = Snapshot::build(ds);

        assert_eq!(snapshot.data_version(), 4);
        assert_eq!(snapshot.user_by_name("alice").unwrap().key, "u1");
        assert_eq!(snapshot.apps_by_name("shared").len(), 2);
        assert!(snapshot.apps_by_name("nobody").is_empty());
        assert_eq!(snapshot.apps_of_user("u1").len(), 3);
        assert_eq!(snapshot.app_configs("app-1").unwrap().len(), 2);
        assert!(snapshot.app_configs("missing-app").is_none());
        assert!(snapshot.config("orphan").is_none());
        assert!(snapshot.raw_config("app-0-cfg-1").is_some());
        assert_eq!(snapshot.to_dataset().configs.len(), 6);
    }

    #[test]
    fn test_rebuild_registers_self_once() {
        let store = Arc::new(MemoryStore::new());
        store.init_data_version().unwrap();
        let snapshots = SnapshotStore::new(identity(), store.clone());

        let snapshot = snapshots.rebuild(store.load_dataset().unwrap()).unwrap();
        assert_eq!(snapshot.node("127.0.0.1:17070").unwrap().node_type, NodeType::Master);
        assert_eq!(store.get_all_nodes().unwrap().len(), 1);

        // Second rebuild finds the entry and writes nothing new
        snapshots.rebuild(store.load_dataset().unwrap()).unwrap();
        assert_eq!(store.get_all_nodes().unwrap().len(), 1);
    }

    #[test]
    fn test_rebuild_heals_node_type() {
        let store = Arc::new(MemoryStore::new());
        store.init_data_version().unwrap();
        store
            .insert_record(
                None,
                Record::Node(Node {
                    url: "127.0.0.1:17070".into(),
                    node_url: "127.0.0.1:17071".into(),
                    node_type: NodeType::Slave,
                    data_version: 1,
                    created_utc: 1,
                    last_check_utc: 0,
                }),
            )
            .unwrap();

        let snapshots = SnapshotStore::new(identity(), store.clone());
        let snapshot = snapshots.rebuild(store.load_dataset().unwrap()).unwrap();
        assert_eq!(snapshot.master().unwrap().url, "127.0.0.1:17070");
        assert_eq!(store.get_all_nodes().unwrap()[0].node_type, NodeType::Master);
    }

    #[test]
    fn test_concurrent_readers_never_see_partial_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let snapshots = Arc::new(SnapshotStore::new(identity(), store));
        snapshots.rebuild(dataset(1, 5)).unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let snapshots = snapshots.clone();
                let done = done.clone();
                std::thread::spawn(move || {
                    while !done.load(Ordering::Relaxed) {
                        let snapshot = snapshots.load();
                        let version = snapshot.data_version();
                        for i in 0..3 {
                            let configs = snapshot.app_configs(&format!("app-{}", i)).unwrap();
                            assert_eq!(configs.len(), 5);
                            for config in configs {
                                match config.value {
                                    ResolvedValue::Int(v) => assert_eq!(v as u64 / 100, version),
                                    _ => panic!("unexpected value"),
                                }
                            }
                        }
                    }
                })
            })
            .collect();

        for version in 2..200 {
            snapshots.rebuild(dataset(version, 5)).unwrap();
        }
        done.store(true, Ordering::Relaxed);
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(snapshots.current_version(), 199);
    }

    #[test]
    fn test_failed_registration_keeps_old_snapshot() {
        struct FailingStore(MemoryStore);
        impl DurableStore for FailingStore {
            fn get_all_users(&self) -> Result<Vec<User>> {
                self.0.get_all_users()
            }
            fn get_all_apps(&self) -> Result<Vec<App>> {
                self.0.get_all_apps()
            }
            fn get_all_configs(&self) -> Result<Vec<ConfigEntry>> {
                self.0.get_all_configs()
            }
            fn get_all_nodes(&self) -> Result<Vec<Node>> {
                self.0.get_all_nodes()
            }
            fn get_data_version(&self) -> Result<u64> {
                self.0.get_data_version()
            }
            fn commit(&self, _txn: crate::store::Txn) -> Result<()> {
                Err(Error::Internal("disk full".into()))
            }
            fn replace_all(&self, dataset: &Dataset) -> Result<()> {
                self.0.replace_all(dataset)
            }
        }

        let snapshots = SnapshotStore::new(identity(), Arc::new(FailingStore(MemoryStore::new())));
        let err = snapshots.rebuild(dataset(3, 1)).unwrap_err();
        assert!(matches!(err, Error::Registration(_)));
        assert_eq!(snapshots.current_version(), 0);
        assert!(snapshots.app_configs("app-0").is_none());
    }
}
