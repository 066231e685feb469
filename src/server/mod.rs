//! Node server: client and node listeners plus the follower sync loop

pub mod admin;
pub mod http;

pub use admin::AdminService;
pub use http::{create_client_router, create_node_router, ServerState};

use crate::common::{init_audit_log, Config, Result};
use crate::replication::ReplicationCoordinator;
use crate::snapshot::{NodeIdentity, SnapshotStore};
use crate::store::{DurableStore, MemoryStore, RocksStore};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct ConfServer {
    config: Config,
}

impl ConfServer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run until Ctrl-C or until a listener fails
    pub async fn serve(self) -> Result<()> {
        init_audit_log(&self.config.audit_log);
        let handle = start(self.config).await?;

        let mut stopped = handle.subscribe();
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res?;
                tracing::info!("Received Ctrl-C, shutting down");
            }
            _ = stopped.wait_for(|stop| *stop) => {
                tracing::warn!("A listener stopped, shutting down");
            }
        }

        handle.shutdown().await;
        Ok(())
    }
}

fn open_store(config: &Config) -> Result<Arc<dyn DurableStore>> {
    match &config.db_path {
        Some(path) => {
            tracing::info!("  DB path: {}", path.display());
            Ok(Arc::new(RocksStore::open(path)?))
        }
        None => {
            tracing::warn!("No db_path configured, using an in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Bind both listeners, bootstrap and start serving.
///
/// Port 0 in either address binds an ephemeral port; the node then registers
/// under the bound address.
pub async fn start(mut config: Config) -> Result<ServerHandle> {
    let client_listener = TcpListener::bind(&config.client_addr).await?;
    let node_listener = TcpListener::bind(&config.node_addr).await?;
    let client_addr = client_listener.local_addr()?;
    let node_addr = node_listener.local_addr()?;
    config.client_addr = client_addr.to_string();
    config.node_addr = node_addr.to_string();
    config.validate()?;

    tracing::info!("Starting fleetconf {} node", config.node_type);
    tracing::info!("  Client API: {}", client_addr);
    tracing::info!("  Node API: {}", node_addr);
    if let Some(master) = &config.master_addr {
        tracing::info!("  Master: {}", master);
    }

    let store = open_store(&config)?;
    let snapshots = Arc::new(SnapshotStore::new(NodeIdentity::from(&config), store));
    let coordinator = Arc::new(ReplicationCoordinator::new(config, snapshots)?);
    coordinator.bootstrap().await?;

    let state = ServerState::new(coordinator.clone());
    let (shutdown, _) = watch::channel(false);
    let shutdown = Arc::new(shutdown);

    let tasks = vec![
        spawn_listener("client", client_listener, create_client_router(state.clone()), shutdown.clone()),
        spawn_listener("node", node_listener, create_node_router(state), shutdown.clone()),
        tokio::spawn(coordinator.clone().run(shutdown.subscribe())),
    ];

    tracing::info!(
        data_version = coordinator.snapshots().current_version(),
        "✓ Node ready"
    );

    Ok(ServerHandle {
        client_addr,
        node_addr,
        coordinator,
        shutdown,
        tasks,
    })
}

fn spawn_listener(
    name: &'static str,
    listener: TcpListener,
    router: Router,
    shutdown: Arc<watch::Sender<bool>>,
) -> JoinHandle<()> {
    let mut stop = shutdown.subscribe();
    tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = stop.wait_for(|stop| *stop).await;
            })
            .await;
        if let Err(e) = result {
            tracing::error!(listener = name, "HTTP server error: {}", e);
        }
        // Take the rest of the node down with this listener
        shutdown.send_replace(true);
    })
}

/// A running node
pub struct ServerHandle {
    pub client_addr: SocketAddr,
    pub node_addr: SocketAddr,
    coordinator: Arc<ReplicationCoordinator>,
    shutdown: Arc<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn coordinator(&self) -> &Arc<ReplicationCoordinator> {
        &self.coordinator
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Stop the listeners and the sync loop and wait for them
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!("Server task failed: {}", e);
            }
        }
        tracing::info!("Node stopped");
    }
}
