//! Admin writes: version accounting under concurrency and restart recovery

use fleetconf::common::{Config, NodeType};
use fleetconf::matcher::ClientRequest;
use fleetconf::replication::ReplicationCoordinator;
use fleetconf::server::{start, AdminService};
use fleetconf::snapshot::{NodeIdentity, SnapshotStore};
use fleetconf::store::{DurableStore, RocksStore, ValueType};
use fleetconf::Matcher;
use reqwest::StatusCode;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

#[tokio::test]
async fn test_concurrent_admin_writes_bump_version_once_each() {
    let master = start(Config {
        client_addr: "127.0.0.1:0".into(),
        node_addr: "127.0.0.1:0".into(),
        ..Default::default()
    })
    .await
    .unwrap();
    let before = master.coordinator().snapshots().current_version();

    let client = reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .build()
        .unwrap();
    let writes: u64 = 24;
    let tasks: Vec<_> = (0..writes)
        .map(|i| {
            let client = client.clone();
            let url = format!("http://{}/op/user", master.client_addr);
            tokio::spawn(async move {
                client
                    .post(url)
                    .json(&json!({ "name": format!("user-{}", i) }))
                    .send()
                    .await
                    .unwrap()
                    .status()
            })
        })
        .collect();
    for task in tasks {
        assert_eq!(task.await.unwrap(), StatusCode::CREATED);
    }

    let snapshots = master.coordinator().snapshots().clone();
    assert_eq!(snapshots.current_version(), before + writes);
    assert_eq!(snapshots.store().get_data_version().unwrap(), before + writes);
    assert_eq!(snapshots.load().users().len(), writes as usize);

    drop(snapshots);
    master.shutdown().await;
}

struct Node {
    snapshots: Arc<SnapshotStore>,
    admin: AdminService,
}

async fn open_node(path: &Path) -> Node {
    let config = Config {
        client_addr: "127.0.0.1:7070".into(),
        node_addr: "127.0.0.1:7071".into(),
        node_type: NodeType::Master,
        ..Default::default()
    };
    let store = Arc::new(RocksStore::open(path).unwrap());
    let snapshots = Arc::new(SnapshotStore::new(NodeIdentity::from(&config), store));
    let coordinator = Arc::new(ReplicationCoordinator::new(config, snapshots.clone()).unwrap());
    coordinator.bootstrap().await.unwrap();
    Node {
        admin: AdminService::new(snapshots.clone(), coordinator),
        snapshots,
    }
}

#[tokio::test]
async fn test_restart_recovers_state_from_rocksdb() {
    let dir = TempDir::new().unwrap();
    let client = ClientRequest {
        os_type: "Android".into(),
        os_version: "13".into(),
        app_version: "3.2.1".into(),
        ip: "172.16.0.9".into(),
        lang: "de".into(),
        device_id: None,
    };

    let (app_key, version, expected) = {
        let node = open_node(dir.path()).await;
        let user = node.admin.new_user("ops").unwrap();
        let shared = node.admin.new_app(&user.key, "shared").unwrap();
        let app = node.admin.new_app(&user.key, "android").unwrap();
        node.admin
            .new_config(&shared.key, "endpoint", "https://api.example.com", ValueType::String)
            .unwrap();
        node.admin
            .new_config(&app.key, "common", &shared.key, ValueType::Template)
            .unwrap();
        node.admin
            .new_config(
                &app.key,
                "cache_mb",
                "when os_type == 'android' and ip in ['172.16.0.0/12'] => 256; 64",
                ValueType::Code,
            )
            .unwrap();

        let expected = Matcher::new(node.snapshots.clone())
            .resolve(&app.key, &client)
            .unwrap();
        assert_eq!(
            serde_json::Value::Object(expected.clone()),
            json!({ "common": { "endpoint": "https://api.example.com" }, "cache_mb": 256 })
        );
        (app.key, node.snapshots.current_version(), expected)
    };

    let node = open_node(dir.path()).await;
    assert_eq!(node.snapshots.current_version(), version);
    assert_eq!(node.snapshots.load().nodes().len(), 1);
    let resolved = Matcher::new(node.snapshots.clone())
        .resolve(&app_key, &client)
        .unwrap();
    assert_eq!(resolved, expected);
}
