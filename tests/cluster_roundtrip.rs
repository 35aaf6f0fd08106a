//! Master/client end-to-end scenarios over real HTTP
//!
//! Each test spins up a master node (and usually a client node) on an
//! ephemeral port and drives the public API.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use shepherd::config::ShepherdConfig;
use shepherd::node::types::{NodeInfo, NodeRole, NodeState, MODEL_FILES_METADATA_KEY};
use shepherd::node::Node;
use shepherd::server::envelope::Envelope;
use shepherd::server::{create_router, AppState};

fn write_gguf(dir: &Path, name: &str) {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"GGUF");
    bytes.extend_from_slice(&3u32.to_le_bytes());
    bytes.extend_from_slice(&[0u8; 32]);
    std::fs::write(dir.join(name), &bytes).unwrap();
}

fn base_config(data_dir: &Path) -> ShepherdConfig {
    let mut config = ShepherdConfig::default();
    config.node.data_dir = Some(data_dir.to_path_buf());
    config.client.heartbeat_interval_secs = 1;
    config.client.heartbeat_timeout_secs = 1;
    config.client.poll_interval_secs = 1;
    config.master.health_check_interval_secs = 1;
    config.master.timeout_threshold_secs = 3;
    config
}

/// Start a node and serve its API on an ephemeral port
async fn serve_node(
    config: ShepherdConfig,
    role: NodeRole,
) -> (Arc<Node>, String, tokio::task::JoinHandle<()>) {
    let node = Node::new(config, role).unwrap();
    node.start().await.unwrap();

    let app = create_router(AppState::new(node.clone()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    (node, format!("http://{}", addr), handle)
}

async fn get_nodes(client: &reqwest::Client, master_url: &str) -> Vec<NodeInfo> {
    let envelope: Envelope<Vec<NodeInfo>> = client
        .get(format!("{}/api/master/nodes", master_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    envelope.data.unwrap_or_default()
}

/// Wait until `check` passes or the deadline expires
async fn wait_for<F, Fut>(deadline: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    false
}

#[tokio::test]
async fn test_register_and_heartbeat() {
    let master_dir = tempfile::tempdir().unwrap();
    let (master, master_url, _h) =
        serve_node(base_config(master_dir.path()), NodeRole::Master).await;

    let client_dir = tempfile::tempdir().unwrap();
    let mut client_config = base_config(client_dir.path());
    client_config.node.id = Some("node-a".to_string());
    client_config.client.master_address = Some(master_url.clone());
    let (client_node, _client_url, _ch) = serve_node(client_config, NodeRole::Client).await;

    let http = reqwest::Client::new();

    // Three heartbeat intervals later the master shows one online node
    // with a fresh lastHeartbeat.
    tokio::time::sleep(Duration::from_secs(3)).await;
    let nodes = get_nodes(&http, &master_url).await;
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].id, "node-a");
    assert_eq!(nodes[0].state, NodeState::Online);

    let age = chrono::Utc::now() - nodes[0].last_heartbeat.unwrap();
    assert!(age.num_seconds() <= 2, "stale heartbeat: {}s", age);

    // The client recorded who it connected to.
    let master_id = master.info().await.id;
    assert_eq!(client_node.info().await.connected_to, Some(master_id));

    client_node.stop().await;
    master.stop().await;
}

#[tokio::test]
async fn test_command_roundtrip_scan_models() {
    let master_dir = tempfile::tempdir().unwrap();
    let (master, master_url, _h) =
        serve_node(base_config(master_dir.path()), NodeRole::Master).await;

    let models_dir = tempfile::tempdir().unwrap();
    write_gguf(models_dir.path(), "tiny-1B.Q8_0.gguf");

    let client_dir = tempfile::tempdir().unwrap();
    let mut client_config = base_config(client_dir.path());
    client_config.node.id = Some("node-a".to_string());
    client_config.client.master_address = Some(master_url.clone());
    client_config
        .models
        .paths
        .push(models_dir.path().to_string_lossy().into_owned());
    let (client_node, _client_url, _ch) = serve_node(client_config, NodeRole::Client).await;

    let http = reqwest::Client::new();

    // Submit a scan_models command addressed to the client.
    let envelope: Envelope<serde_json::Value> = http
        .post(format!("{}/api/master/command", master_url))
        .json(&serde_json::json!({
            "type": "scan_models",
            "toNodeId": "node-a",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(envelope.success);
    let command_id = envelope.data.unwrap()["commandId"]
        .as_str()
        .unwrap()
        .to_string();

    // Within two poll cycles the result lands in the sink.
    let http2 = http.clone();
    let url = master_url.clone();
    let cid = command_id.clone();
    let arrived = wait_for(Duration::from_secs(6), move || {
        let http = http2.clone();
        let url = url.clone();
        let cid = cid.clone();
        async move {
            http.get(format!("{}/api/master/results/{}", url, cid))
                .send()
                .await
                .map(|r| r.status().is_success())
                .unwrap_or(false)
        }
    })
    .await;
    assert!(arrived, "no result for command {}", command_id);

    let envelope: Envelope<serde_json::Value> = http
        .get(format!("{}/api/master/results/{}", master_url, command_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let result = envelope.data.unwrap();
    assert_eq!(result["success"], true);
    assert_eq!(result["result"]["modelCount"], 1);

    client_node.stop().await;
    master.stop().await;
}

#[tokio::test]
async fn test_duplicate_results_stored_once() {
    let master_dir = tempfile::tempdir().unwrap();
    let (master, master_url, _h) =
        serve_node(base_config(master_dir.path()), NodeRole::Master).await;

    let http = reqwest::Client::new();

    // Register a node entry the results can be attributed to.
    let info = NodeInfo::new("node-a", NodeRole::Client, "127.0.0.1", 8080);
    http.post(format!("{}/api/master/clients/register", master_url))
        .json(&info)
        .send()
        .await
        .unwrap();

    let command_id = uuid::Uuid::new_v4();
    let result = serde_json::json!({
        "commandId": command_id,
        "fromNodeId": "node-a",
        "toNodeId": "master",
        "success": true,
        "result": {"modelCount": 3},
        "completedAt": chrono::Utc::now(),
        "durationMillis": 12,
    });

    // Deliver the same result five times; exactly one is stored.
    let mut stored_count = 0;
    for _ in 0..5 {
        let envelope: Envelope<serde_json::Value> = http
            .post(format!(
                "{}/api/master/clients/node-a/results",
                master_url
            ))
            .json(&result)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        // Every delivery is acknowledged, duplicates included.
        assert!(envelope.success);
        if envelope.data.unwrap()["stored"] == true {
            stored_count += 1;
        }
    }
    assert_eq!(stored_count, 1);

    master.stop().await;
}

#[tokio::test]
async fn test_heartbeat_loss_marks_offline_then_recovers() {
    let master_dir = tempfile::tempdir().unwrap();
    let (master, master_url, _h) =
        serve_node(base_config(master_dir.path()), NodeRole::Master).await;

    let client_dir = tempfile::tempdir().unwrap();
    let mut client_config = base_config(client_dir.path());
    client_config.node.id = Some("node-a".to_string());
    client_config.client.master_address = Some(master_url.clone());
    let (client_node, _client_url, _ch) =
        serve_node(client_config.clone(), NodeRole::Client).await;

    let http = reqwest::Client::new();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(get_nodes(&http, &master_url).await[0].state, NodeState::Online);

    // Stop the client: after >= 3 intervals the sweeper flips it offline.
    client_node.stop().await;
    let http2 = http.clone();
    let url = master_url.clone();
    let offline = wait_for(Duration::from_secs(8), move || {
        let http = http2.clone();
        let url = url.clone();
        async move { get_nodes(&http, &url).await[0].state == NodeState::Offline }
    })
    .await;
    assert!(offline, "node never went offline");

    // A restart under the same ID returns it to online.
    let client_dir2 = tempfile::tempdir().unwrap();
    let mut restart_config = client_config;
    restart_config.node.data_dir = Some(client_dir2.path().to_path_buf());
    let (restarted, _url2, _h2) = serve_node(restart_config, NodeRole::Client).await;

    let http3 = http.clone();
    let url = master_url.clone();
    let online = wait_for(Duration::from_secs(5), move || {
        let http = http3.clone();
        let url = url.clone();
        async move { get_nodes(&http, &url).await[0].state == NodeState::Online }
    })
    .await;
    assert!(online, "node never came back online");

    restarted.stop().await;
    master.stop().await;
}

#[tokio::test]
async fn test_scheduler_locality_picks_file_holder() {
    let master_dir = tempfile::tempdir().unwrap();
    let mut master_config = base_config(master_dir.path());
    master_config.master.strategy = "locality".to_string();
    let (master, master_url, _h) = serve_node(master_config, NodeRole::Master).await;

    let http = reqwest::Client::new();

    // node-a: plenty of free VRAM, but no copy of the file.
    let mut node_a = NodeInfo::new("node-a", NodeRole::Client, "127.0.0.1", 8080);
    node_a.resources = Some(shepherd::node::types::ResourceSnapshot {
        gpus: vec![shepherd::node::types::GpuInfo {
            index: 0,
            vendor: shepherd::node::types::GpuVendor::Nvidia,
            name: "Big GPU".to_string(),
            total_memory_bytes: 48 << 30,
            used_memory_bytes: 0,
            temperature_c: None,
            utilization_percent: None,
            power_watts: None,
            driver_version: None,
        }],
        ..Default::default()
    });

    // node-b: less VRAM, but it already has M.gguf on disk.
    let mut node_b = NodeInfo::new("node-b", NodeRole::Client, "127.0.0.1", 8081);
    node_b.metadata.insert(
        MODEL_FILES_METADATA_KEY.to_string(),
        "M.gguf".to_string(),
    );
    node_b.resources = Some(shepherd::node::types::ResourceSnapshot {
        gpus: vec![shepherd::node::types::GpuInfo {
            index: 0,
            vendor: shepherd::node::types::GpuVendor::Nvidia,
            name: "Small GPU".to_string(),
            total_memory_bytes: 16 << 30,
            used_memory_bytes: 0,
            temperature_c: None,
            utilization_percent: None,
            power_watts: None,
            driver_version: None,
        }],
        ..Default::default()
    });

    for node in [&node_a, &node_b] {
        http.post(format!("{}/api/master/clients/register", master_url))
            .json(node)
            .send()
            .await
            .unwrap();
    }

    // An untargeted load_model goes through the scheduler.
    let envelope: Envelope<serde_json::Value> = http
        .post(format!("{}/api/master/command", master_url))
        .json(&serde_json::json!({
            "type": "load_model",
            "payload": {"model_id": "M.gguf"},
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert!(envelope.success);
    assert_eq!(envelope.data.unwrap()["toNodeId"], "node-b");

    master.stop().await;
}

#[tokio::test]
async fn test_scheduled_load_executes_on_file_holder() {
    use std::os::unix::fs::PermissionsExt;

    // The master holds its own copy of the model, so the submitted key
    // can be the master-local stable ID; the command must still reach
    // the client as a handle the client can resolve.
    let master_models = tempfile::tempdir().unwrap();
    write_gguf(master_models.path(), "tiny-1B.Q8_0.gguf");

    let master_dir = tempfile::tempdir().unwrap();
    let mut master_config = base_config(master_dir.path());
    master_config.master.strategy = "locality".to_string();
    master_config
        .models
        .paths
        .push(master_models.path().to_string_lossy().into_owned());
    let (master, master_url, _h) = serve_node(master_config, NodeRole::Master).await;

    let client_models = tempfile::tempdir().unwrap();
    write_gguf(client_models.path(), "tiny-1B.Q8_0.gguf");

    let bin_dir = tempfile::tempdir().unwrap();
    let fake_server = bin_dir.path().join("llama-server");
    std::fs::write(
        &fake_server,
        "#!/bin/sh\necho 'all slots are idle'\nsleep 30\n",
    )
    .unwrap();
    std::fs::set_permissions(&fake_server, std::fs::Permissions::from_mode(0o755)).unwrap();

    let client_dir = tempfile::tempdir().unwrap();
    let mut client_config = base_config(client_dir.path());
    client_config.node.id = Some("node-a".to_string());
    client_config.client.master_address = Some(master_url.clone());
    client_config
        .models
        .paths
        .push(client_models.path().to_string_lossy().into_owned());
    let (client_node, _client_url, _ch) = serve_node(client_config, NodeRole::Client).await;

    let http = reqwest::Client::new();

    // Let the first heartbeat land so the candidate carries resources.
    tokio::time::sleep(Duration::from_secs(2)).await;

    // Address the model by the master's own stable ID; different from
    // the client's, since stable IDs are path-derived.
    let master_key =
        shepherd::registry::stable_model_id(&master_models.path().join("tiny-1B.Q8_0.gguf"));
    let client_model_id =
        shepherd::registry::stable_model_id(&client_models.path().join("tiny-1B.Q8_0.gguf"));
    assert_ne!(master_key, client_model_id);

    let envelope: Envelope<serde_json::Value> = http
        .post(format!("{}/api/master/command", master_url))
        .json(&serde_json::json!({
            "type": "load_model",
            "payload": {
                "model_id": master_key,
                "binary_path": fake_server.to_string_lossy(),
            },
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(envelope.success, "submit failed: {:?}", envelope.error);
    let data = envelope.data.unwrap();
    assert_eq!(data["toNodeId"], "node-a");
    let command_id = data["commandId"].as_str().unwrap().to_string();

    // The client must actually execute the load and deliver the result.
    let http2 = http.clone();
    let url = master_url.clone();
    let cid = command_id.clone();
    let arrived = wait_for(Duration::from_secs(10), move || {
        let http = http2.clone();
        let url = url.clone();
        let cid = cid.clone();
        async move {
            http.get(format!("{}/api/master/results/{}", url, cid))
                .send()
                .await
                .map(|r| r.status().is_success())
                .unwrap_or(false)
        }
    })
    .await;
    assert!(arrived, "no result for scheduled load {}", command_id);

    let envelope: Envelope<serde_json::Value> = http
        .get(format!("{}/api/master/results/{}", master_url, command_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let result = envelope.data.unwrap();
    assert_eq!(result["success"], true, "load failed: {}", result["error"]);
    assert_eq!(result["result"]["model_id"], client_model_id);

    // The subprocess is live on the client under its own model ID.
    assert!(client_node.supervisor().is_live(&client_model_id));

    client_node.stop().await;
    master.stop().await;
}

#[tokio::test]
async fn test_client_pauses_polling_when_master_dies() {
    let master_dir = tempfile::tempdir().unwrap();
    let (master, master_url, master_handle) =
        serve_node(base_config(master_dir.path()), NodeRole::Master).await;

    let client_dir = tempfile::tempdir().unwrap();
    let mut client_config = base_config(client_dir.path());
    client_config.node.id = Some("node-a".to_string());
    client_config.client.master_address = Some(master_url.clone());
    let (client_node, _client_url, _ch) = serve_node(client_config, NodeRole::Client).await;

    tokio::time::sleep(Duration::from_secs(2)).await;
    let connector = client_node.connector().unwrap().clone();
    assert!(!connector.is_paused());

    // Kill the master; OnDisconnect must fire within 3 intervals and
    // pause polling.
    master_handle.abort();
    master.stop().await;

    let paused = wait_for(Duration::from_secs(10), || {
        let connector = connector.clone();
        async move { connector.is_paused() }
    })
    .await;
    assert!(paused, "client never noticed the dead master");

    client_node.stop().await;
}

#[tokio::test]
async fn test_info_and_models_endpoints() {
    let models_dir = tempfile::tempdir().unwrap();
    write_gguf(models_dir.path(), "llama-8B.Q4_K_M.gguf");

    let data_dir = tempfile::tempdir().unwrap();
    let mut config = base_config(data_dir.path());
    config
        .models
        .paths
        .push(models_dir.path().to_string_lossy().into_owned());
    let (node, url, _h) = serve_node(config, NodeRole::Standalone).await;

    let http = reqwest::Client::new();

    let envelope: Envelope<serde_json::Value> = http
        .get(format!("{}/api/info", url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(envelope.success);
    let info = envelope.data.unwrap();
    assert_eq!(info["name"], "shepherd");
    assert_eq!(info["role"], "standalone");

    let envelope: Envelope<serde_json::Value> = http
        .get(format!("{}/api/models", url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let models = envelope.data.unwrap();
    assert_eq!(models.as_array().unwrap().len(), 1);
    assert_eq!(models[0]["isLoaded"], false);
    assert_eq!(models[0]["metadata"]["quantization"], "Q4_K_M");

    // Master routes are absent on a standalone node.
    let status = http
        .get(format!("{}/api/master/nodes", url))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, reqwest::StatusCode::BAD_REQUEST);

    node.stop().await;
}
