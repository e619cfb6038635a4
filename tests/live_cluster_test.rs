//! Tests against real server processes.
//!
//! These need a `redis-server` compatible binary on PATH (override with
//! `KVLINK_TEST_SERVER`) and are `#[ignore]`d so the default test run
//! stays hermetic. Run them with `cargo test -- --ignored`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{sleep, Instant};

use kvlink::cluster::MigrationPlan;
use kvlink::harness::ServerProcess;
use kvlink::protocol::command;
use kvlink::stream::{TcpByteStream, TcpConnector};
use kvlink::{ClusterClient, NodeClient, RespValue};

const STARTUP: Duration = Duration::from_secs(10);

fn spawn_or_skip(port: u16, cluster: bool) -> Option<ServerProcess> {
    let result = if cluster {
        ServerProcess::spawn_cluster_node(port)
    } else {
        ServerProcess::spawn(port)
    };
    match result {
        Ok(server) => Some(server),
        Err(e) => {
            eprintln!("skipping live test, cannot spawn server: {e}");
            None
        }
    }
}

fn addslots(range: std::ops::RangeInclusive<u16>) -> RespValue {
    let mut parts: Vec<String> = vec!["CLUSTER".to_string(), "ADDSLOTS".to_string()];
    parts.extend(range.map(|slot| slot.to_string()));
    command::request(&parts)
}

async fn wait_cluster_ok(client: &mut NodeClient<TcpByteStream>) -> bool {
    for _ in 0..75 {
        if let Ok(reply) = client.call(&command::request(&["CLUSTER", "INFO"])).await {
            if let Some(text) = reply.as_str() {
                if text.contains("cluster_state:ok") {
                    return true;
                }
            }
        }
        sleep(Duration::from_millis(200)).await;
    }
    false
}

#[tokio::test]
#[ignore]
async fn live_single_node_round_trip() {
    let Some(server) = spawn_or_skip(7699, false) else {
        return;
    };
    server.wait_ready(STARTUP).await.unwrap();

    let mut client = NodeClient::new();
    client.connect(server.addr()).await.unwrap();

    let reply = client
        .call(&command::request(&["SET", "greeting", "hello"]))
        .await
        .unwrap();
    assert_eq!(reply, RespValue::ok());

    let reply = client
        .call(&command::request(&["GET", "greeting"]))
        .await
        .unwrap();
    assert_eq!(reply.as_bytes(), Some(&b"hello"[..]));

    let reply = client
        .call(&command::request(&["DEL", "greeting"]))
        .await
        .unwrap();
    assert_eq!(reply.as_integer(), Some(1));

    let reply = client
        .call(&command::request(&["GET", "greeting"]))
        .await
        .unwrap();
    assert_eq!(reply, RespValue::null_bulk_string());

    client.disconnect();
    server.shutdown().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn live_cluster_routes_and_migrates() {
    let ports = [7701u16, 7702, 7703];
    let mut servers = Vec::new();
    for &port in &ports {
        let Some(server) = spawn_or_skip(port, true) else {
            return;
        };
        servers.push(server);
    }
    for server in &servers {
        server.wait_ready(STARTUP).await.unwrap();
    }

    // Form the cluster by hand: slots, epochs, then introductions.
    let ranges = [0..=5460u16, 5461..=10922, 10923..=16383];
    let mut admins = Vec::new();
    for (i, server) in servers.iter().enumerate() {
        let mut admin = NodeClient::new();
        admin.connect(server.addr()).await.unwrap();
        let reply = admin.call(&addslots(ranges[i].clone())).await.unwrap();
        assert_eq!(reply, RespValue::ok(), "ADDSLOTS on {}", server.addr());
        let epoch = (i + 1).to_string();
        admin
            .call(&command::request(&[
                "CLUSTER",
                "SET-CONFIG-EPOCH",
                epoch.as_str(),
            ]))
            .await
            .unwrap();
        admins.push(admin);
    }
    for port in &ports[1..] {
        let port_text = port.to_string();
        admins[0]
            .call(&command::request(&[
                "CLUSTER",
                "MEET",
                "127.0.0.1",
                port_text.as_str(),
            ]))
            .await
            .unwrap();
    }
    for admin in admins.iter_mut() {
        assert!(wait_cluster_ok(admin).await, "cluster never converged");
    }

    // Routed traffic through the cluster client.
    let mut client = ClusterClient::new(
        TcpConnector::new(),
        vec![servers[0].addr().to_string()],
    );
    let keys = ["alpha", "beta", "gamma", "delta"];
    for key in keys {
        let value = format!("value-{key}");
        let reply = client
            .call(command::request(&["SET", key, value.as_str()]))
            .await
            .unwrap();
        assert_eq!(reply, RespValue::ok());
    }
    for key in keys {
        let reply = client
            .call(command::request(&["GET", key]))
            .await
            .unwrap();
        assert_eq!(reply.as_bytes(), Some(format!("value-{key}").as_bytes()));
    }

    // Move a random slot and make sure the data stays reachable.
    let plan = MigrationPlan::random(client.topology()).expect("two nodes minimum");
    let done: Arc<Mutex<Option<kvlink::Result<()>>>> = Arc::new(Mutex::new(None));
    let tx = done.clone();
    client.begin_migration(
        plan,
        Box::new(move |result| {
            *tx.lock().unwrap() = Some(result);
        }),
    );
    let deadline = Instant::now() + Duration::from_secs(30);
    let result = loop {
        client.update().await;
        if let Some(result) = done.lock().unwrap().take() {
            break result;
        }
        assert!(Instant::now() < deadline, "migration timed out");
        sleep(Duration::from_millis(1)).await;
    };
    result.unwrap();

    for key in keys {
        let reply = client
            .call(command::request(&["GET", key]))
            .await
            .unwrap();
        assert_eq!(reply.as_bytes(), Some(format!("value-{key}").as_bytes()));
    }

    for server in servers {
        server.shutdown().await.unwrap();
    }
}
