//! Replication coordinator
//!
//! Decides whether this node may accept admin writes, answers peer requests
//! and, on followers, keeps the local snapshot converged with the master by
//! pulling full datasets whenever the master's data version moves ahead.
//!
//! ```text
//! Uninitialized --check_node_validity--> Registered --first sync--> Synced <--> Stale
//! ```

use crate::common::{
    audit, next_backoff, retry_with_backoff, timestamp_now, AuditEventType, Config, Error,
    NodeType, Result,
};
use crate::replication::peer::PeerClient;
use crate::replication::protocol::{PeerRequestKind, PeerResponse, VersionResponse};
use crate::snapshot::SnapshotStore;
use crate::store::{Dataset, Node, Record};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;

/// Attempts made to report a freshly pulled version to the master
const REPORT_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Identity not validated yet
    Uninitialized,
    /// Identity validated, nothing pulled yet
    Registered,
    /// Local data version equals the master's
    Synced,
    /// Master is ahead; serving the last good snapshot
    Stale,
}

pub struct ReplicationCoordinator {
    config: Config,
    snapshots: Arc<SnapshotStore>,
    peer: PeerClient,
    state: RwLock<SyncState>,
}

impl ReplicationCoordinator {
    pub fn new(config: Config, snapshots: Arc<SnapshotStore>) -> Result<Self> {
        let peer = PeerClient::new(config.peer_timeout())?;
        Ok(Self {
            config,
            snapshots,
            peer,
            state: RwLock::new(SyncState::Uninitialized),
        })
    }

    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    fn set_state(&self, next: SyncState) {
        let mut state = self.state.write();
        if *state != next {
            tracing::debug!(from = ?*state, to = ?next, "Sync state changed");
            *state = next;
        }
    }

    pub fn node_type(&self) -> NodeType {
        self.config.node_type
    }

    pub fn is_master(&self) -> bool {
        self.config.node_type.is_master()
    }

    pub fn snapshots(&self) -> &Arc<SnapshotStore> {
        &self.snapshots
    }

    /// Client address of the master, as known from the registry or config
    pub fn master_url(&self) -> String {
        if self.is_master() {
            return self.config.client_addr.clone();
        }
        self.snapshots
            .load()
            .master()
            .map(|m| m.url.clone())
            .or_else(|| self.config.master_addr.clone())
            .unwrap_or_default()
    }

    /// Admin writes are only accepted by the master
    pub fn ensure_writable(&self) -> Result<()> {
        if self.is_master() {
            Ok(())
        } else {
            Err(Error::NotMaster(self.master_url()))
        }
    }

    fn master_node_addr(&self) -> Result<&str> {
        self.config
            .master_node_addr()
            .ok_or_else(|| Error::InvalidConfig("slave nodes require master_addr".into()))
    }

    /// Check that this instance may take its configured place in the fleet
    pub async fn check_node_validity(&self) -> Result<()> {
        resolve_addr("client_addr", &self.config.client_addr).await?;
        resolve_addr("node_addr", &self.config.node_addr).await?;
        if !self.is_master() {
            let master = self.master_node_addr()?;
            resolve_addr("master_addr", master).await?;
        }

        let me = self.snapshots.identity();
        let nodes = self.snapshots.store().get_all_nodes()?;
        if let Some(existing) = nodes.iter().find(|n| n.url == me.url) {
            if existing.node_url != me.node_url {
                return Err(Error::InvalidNode(format!(
                    "{} is registered with node address {}, not {}",
                    me.url, existing.node_url, me.node_url
                )));
            }
            if existing.node_type != me.node_type {
                tracing::info!(
                    url = %me.url,
                    from = %existing.node_type,
                    to = %me.node_type,
                    "Node type changed since last start"
                );
            }
        }
        if me.node_type.is_master() {
            if let Some(other) = nodes
                .iter()
                .find(|n| n.node_type.is_master() && n.url != me.url)
            {
                tracing::warn!(
                    url = %me.url,
                    other = %other.url,
                    "Another node is registered as master, taking over"
                );
            }
        }

        self.set_state(SyncState::Registered);
        Ok(())
    }

    /// Startup sequence. Errors returned here are fatal.
    pub async fn bootstrap(&self) -> Result<()> {
        let store = self.snapshots.store().clone();
        store.init_data_version()?;
        self.check_node_validity().await?;

        let snapshot = self.snapshots.rebuild(store.load_dataset()?)?;
        tracing::info!(
            node_type = %self.node_type(),
            data_version = snapshot.data_version(),
            "Loaded snapshot"
        );

        if self.is_master() {
            self.set_state(SyncState::Synced);
            return Ok(());
        }

        // A master that is down must not keep a follower from serving
        if let Err(e) = self.check_once().await {
            tracing::warn!("Initial sync with master failed: {}", e);
        }
        Ok(())
    }

    /// Compare versions with the master and pull when behind
    pub async fn check_once(&self) -> Result<SyncState> {
        if self.is_master() {
            self.set_state(SyncState::Synced);
            return Ok(SyncState::Synced);
        }

        let master = self.master_node_addr()?.to_string();
        let remote = self.peer.fetch_version(&master).await?;
        let local = self.snapshots.current_version();

        if remote.data_version > local {
            tracing::info!(
                local,
                remote = remote.data_version,
                "Behind master, pulling"
            );
            self.set_state(SyncState::Stale);
            self.pull_and_apply().await?;
        } else if remote.data_version == local {
            self.set_state(SyncState::Synced);
        } else {
            tracing::warn!(
                local,
                remote = remote.data_version,
                master = %master,
                "Master is behind this node, ignoring"
            );
        }

        Ok(self.state())
    }

    /// Pull the master's dataset, persist it and swap the snapshot
    pub async fn pull_and_apply(&self) -> Result<u64> {
        let master = self.master_node_addr()?.to_string();
        let dataset = self.peer.pull(&master).await?;
        let version = self.apply_dataset(dataset)?;

        self.set_state(SyncState::Synced);
        audit().log_event(
            AuditEventType::DatasetPulled,
            self.config.client_addr.clone(),
            Some(master.clone()),
            version,
            format!("Pulled dataset from {}", master),
        );

        if let Err(e) = self.report_version(&master).await {
            tracing::warn!(master = %master, "Failed to report data version: {}", e);
        }
        Ok(version)
    }

    /// Persist and load a pulled dataset under the admin lock
    fn apply_dataset(&self, dataset: Dataset) -> Result<u64> {
        let guard = self.snapshots.admin_lock();
        let local = self.snapshots.current_version();
        if dataset.data_version < local {
            return Err(Error::StaleDataset {
                local,
                received: dataset.data_version,
            });
        }

        let version = dataset.data_version;
        let digest = dataset.digest()?;
        self.snapshots.store().replace_all(&dataset)?;
        self.snapshots.rebuild_locked(&guard, dataset)?;
        tracing::info!(data_version = version, digest = %digest, "Applied dataset from master");
        Ok(version)
    }

    async fn report_version(&self, master: &str) -> Result<()> {
        let me = self.snapshots.identity();
        let node = Node {
            url: me.url.clone(),
            node_url: me.node_url.clone(),
            node_type: me.node_type,
            data_version: self.snapshots.current_version(),
            created_utc: timestamp_now(),
            last_check_utc: timestamp_now(),
        };
        retry_with_backoff(
            || self.peer.register(master, &node),
            REPORT_ATTEMPTS,
            self.config.sync_interval() / 4,
        )
        .await?;
        Ok(())
    }

    /// Follower loop: check the master every `sync_interval`, backing off on failure
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if self.is_master() {
            return;
        }

        let interval = self.config.sync_interval();
        let max_backoff = self.config.max_backoff();
        let mut delay = interval;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    tracing::info!("Sync loop stopped");
                    return;
                }
            }

            match self.check_once().await {
                Ok(_) => delay = interval,
                Err(e) => {
                    delay = next_backoff(delay, max_backoff);
                    if e.is_retryable() {
                        tracing::warn!(retry_in = ?delay, "Sync with master failed: {}", e);
                    } else {
                        tracing::error!(retry_in = ?delay, "Sync with master failed: {}", e);
                    }
                }
            }
        }
    }

    /// Answer a request received on the node listener
    pub fn handle_peer_request(&self, kind: PeerRequestKind, payload: &[u8]) -> Result<PeerResponse> {
        match kind {
            PeerRequestKind::Version => Ok(PeerResponse::Version(VersionResponse {
                data_version: self.snapshots.current_version(),
                node_type: self.node_type(),
            })),
            PeerRequestKind::Pull => Ok(PeerResponse::Pull(self.snapshots.load().to_dataset())),
            PeerRequestKind::Register => {
                let node: Node = serde_json::from_slice(payload)
                    .map_err(|e| Error::InvalidRequest(format!("register body: {}", e)))?;
                self.register_node(node).map(PeerResponse::Registered)
            }
        }
    }

    /// Upsert a node in the registry; the data version is left alone
    pub fn register_node(&self, mut node: Node) -> Result<Node> {
        self.ensure_writable()?;
        if node.url.trim().is_empty() || node.node_url.trim().is_empty() {
            return Err(Error::InvalidRequest("node url and node_url are required".into()));
        }
        if node.url == self.snapshots.identity().url {
            return Err(Error::InvalidRequest(format!(
                "{} is this master's own address",
                node.url
            )));
        }

        let guard = self.snapshots.admin_lock();
        let store = self.snapshots.store();
        let now = timestamp_now();
        node.last_check_utc = now;

        let version = match self.snapshots.load().node(&node.url) {
            Some(existing) => {
                node.created_utc = existing.created_utc;
                store.update_record(None, Record::Node(node.clone()))?;
                self.snapshots.reload_locked(&guard)?.data_version()
            }
            None => {
                node.created_utc = now;
                match store.insert_record(None, Record::Node(node.clone())) {
                    Err(Error::AlreadyExists(_)) => {
                        store.update_record(None, Record::Node(node.clone()))
                    }
                    other => other,
                }?;
                let version = self.snapshots.reload_locked(&guard)?.data_version();
                audit().log_event(
                    AuditEventType::NodeRegistered,
                    node.url.clone(),
                    Some(node.node_url.clone()),
                    version,
                    format!("Registered {} node {}", node.node_type, node.url),
                );
                version
            }
        };

        tracing::debug!(
            url = %node.url,
            node_data_version = node.data_version,
            data_version = version,
            "Node checked in"
        );
        Ok(node)
    }
}

async fn resolve_addr(field: &str, addr: &str) -> Result<()> {
    let mut addrs = tokio::net::lookup_host(addr)
        .await
        .map_err(|e| Error::InvalidNode(format!("{} {:?} does not resolve: {}", field, addr, e)))?;
    if addrs.next().is_none() {
        return Err(Error::InvalidNode(format!(
            "{} {:?} resolves to no address",
            field, addr
        )));
    }
    Ok(())
}
