//! Master/follower replication over real listeners

use fleetconf::common::Config;
use fleetconf::replication::{PeerClient, SyncState};
use fleetconf::server::{start, ServerHandle};
use fleetconf::store::Node;
use fleetconf::NodeType;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;

fn http() -> Client {
    Client::builder()
        .pool_max_idle_per_host(0)
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

async fn start_master() -> ServerHandle {
    start(Config {
        client_addr: "127.0.0.1:0".into(),
        node_addr: "127.0.0.1:0".into(),
        node_type: NodeType::Master,
        ..Default::default()
    })
    .await
    .unwrap()
}

/// Follower whose background loop stays out of the way of manual checks
async fn start_follower(master: &ServerHandle) -> ServerHandle {
    start(Config {
        client_addr: "127.0.0.1:0".into(),
        node_addr: "127.0.0.1:0".into(),
        node_type: NodeType::Slave,
        master_addr: Some(master.node_addr.to_string()),
        sync_interval_ms: 60_000,
        max_backoff_ms: 120_000,
        ..Default::default()
    })
    .await
    .unwrap()
}

async fn post(client: &Client, node: &ServerHandle, path: &str, body: Value) -> (StatusCode, Value) {
    let resp = client
        .post(format!("http://{}{}", node.client_addr, path))
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = resp.status();
    (status, resp.json().await.unwrap_or(Value::Null))
}

async fn get(client: &Client, node: &ServerHandle, path: &str) -> (StatusCode, Value) {
    let resp = client
        .get(format!("http://{}{}", node.client_addr, path))
        .send()
        .await
        .unwrap();
    let status = resp.status();
    (status, resp.json().await.unwrap_or(Value::Null))
}

async fn new_config(client: &Client, node: &ServerHandle, app_key: &str, k: &str, v: &str, v_type: &str) {
    let (status, _) = post(
        client,
        node,
        "/op/config",
        json!({ "app_key": app_key, "k": k, "v": v, "v_type": v_type }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

fn conf_path(app_key: &str, app_version: &str) -> String {
    format!(
        "/client/conf?app_key={}&os_type=ios&os_version=17.1&app_version={}&ip=10.2.3.4&lang=en&device_id=dev-9",
        app_key, app_version
    )
}

#[tokio::test]
async fn test_follower_converges_after_one_pull() {
    let client = http();
    let master = start_master().await;

    // v1 -> v3
    let (_, user) = post(&client, &master, "/op/user", json!({ "name": "ops" })).await;
    let user_key = user["key"].as_str().unwrap().to_string();
    let (_, app) = post(&client, &master, "/op/app", json!({ "user_key": user_key, "name": "ios" })).await;
    let app_key = app["key"].as_str().unwrap().to_string();

    let follower = start_follower(&master).await;
    assert_eq!(follower.coordinator().snapshots().current_version(), 3);
    assert_eq!(follower.coordinator().state(), SyncState::Synced);

    // v3 -> v5 on the master only
    new_config(&client, &master, &app_key, "timeout", "30", "int").await;
    new_config(
        &client,
        &master,
        &app_key,
        "new_ui",
        "when app_version >= '2.0.0' => true; false",
        "code",
    )
    .await;
    assert_eq!(master.coordinator().snapshots().current_version(), 5);
    assert_eq!(follower.coordinator().snapshots().current_version(), 3);

    let state = follower.coordinator().check_once().await.unwrap();
    assert_eq!(state, SyncState::Synced);
    assert_eq!(follower.coordinator().snapshots().current_version(), 5);

    for app_version in ["2.1.0", "1.9.9"] {
        let (status, from_master) = get(&client, &master, &conf_path(&app_key, app_version)).await;
        assert_eq!(status, StatusCode::OK);
        let (_, from_follower) = get(&client, &follower, &conf_path(&app_key, app_version)).await;
        assert_eq!(from_master, from_follower);
    }

    // The follower reported its new version back
    let (_, nodes) = get(&client, &master, "/op/nodes").await;
    let follower_url = follower.client_addr.to_string();
    let entry = nodes["nodes"]
        .as_array()
        .unwrap()
        .iter()
        .find(|n| n["url"] == follower_url.as_str())
        .cloned()
        .unwrap();
    assert_eq!(entry["data_version"], 5);
    assert_eq!(entry["node_type"], "slave");
    // Registration does not move the data version
    assert_eq!(master.coordinator().snapshots().current_version(), 5);

    follower.shutdown().await;
    master.shutdown().await;
}

#[tokio::test]
async fn test_follower_rejects_admin_writes() {
    let client = http();
    let master = start_master().await;
    post(&client, &master, "/op/user", json!({ "name": "ops" })).await;
    // Pulls v2, which carries the master's registry entry
    let follower = start_follower(&master).await;

    let (status, body) = post(&client, &follower, "/op/user", json!({ "name": "intruder" })).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["master"], master.client_addr.to_string().as_str());

    let (_, users) = get(&client, &master, "/op/users").await;
    let users = users["users"].as_array().unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0]["name"], "ops");

    follower.shutdown().await;
    master.shutdown().await;
}

#[tokio::test]
async fn test_background_loop_catches_up() {
    let client = http();
    let master = start_master().await;
    let follower = start(Config {
        client_addr: "127.0.0.1:0".into(),
        node_addr: "127.0.0.1:0".into(),
        node_type: NodeType::Slave,
        master_addr: Some(master.node_addr.to_string()),
        sync_interval_ms: 50,
        max_backoff_ms: 500,
        ..Default::default()
    })
    .await
    .unwrap();

    post(&client, &master, "/op/user", json!({ "name": "loop" })).await;
    let target = master.coordinator().snapshots().current_version();

    let mut caught_up = false;
    for _ in 0..100 {
        if follower.coordinator().snapshots().current_version() == target {
            caught_up = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(caught_up, "follower never reached version {}", target);

    follower.shutdown().await;
    master.shutdown().await;
}

#[tokio::test]
async fn test_peer_client_round_trip() {
    let master = start_master().await;
    let peer = PeerClient::new(Duration::from_secs(2)).unwrap();
    let addr = master.node_addr.to_string();

    let version = peer.fetch_version(&addr).await.unwrap();
    assert_eq!(version.data_version, 1);
    assert_eq!(version.node_type, NodeType::Master);

    let dataset = peer.pull(&addr).await.unwrap();
    assert_eq!(dataset.data_version, 1);
    assert_eq!(dataset.nodes.len(), 1);

    let node = Node {
        url: "10.9.9.9:17070".into(),
        node_url: "10.9.9.9:17071".into(),
        node_type: NodeType::Slave,
        data_version: 1,
        created_utc: 0,
        last_check_utc: 0,
    };
    let registered = peer.register(&addr, &node).await.unwrap();
    assert!(registered.last_check_utc > 0);
    assert_eq!(peer.pull(&addr).await.unwrap().nodes.len(), 2);

    master.shutdown().await;
}
