//! End-to-end tests for the peer-mesh transport: two kernels on localhost
//! exchanging hellos, federating messages, and deduplicating connections.
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

use estuary::{
    ClientSnapshot, Kernel, KernelOptions, MeshOptions, MeshTransport, Message, Transport,
};

const DEADLINE: Duration = Duration::from_secs(5);

fn mesh_kernel(port: u16, peers: Vec<String>, reconnect: Duration) -> (Arc<Kernel>, Arc<MeshTransport>) {
    let mesh = Arc::new(MeshTransport::new(MeshOptions {
        host: "127.0.0.1".into(),
        port,
        peers,
        reconnect_interval: reconnect,
        ..Default::default()
    }));
    let kernel = Arc::new(Kernel::new(KernelOptions {
        transports: vec![mesh.clone() as Arc<dyn Transport>],
        ..Default::default()
    }));
    (kernel, mesh)
}

async fn mesh_peers_of(kernel: &Kernel) -> Vec<ClientSnapshot> {
    kernel
        .presence()
        .await
        .into_iter()
        .filter(|s| s.transport == "mesh")
        .collect()
}

/// Poll until the condition holds or the deadline passes.
async fn wait_for<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + DEADLINE;
    while !condition().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Grab a free localhost port. Racy in principle, fine for tests.
fn reserve_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

#[tokio::test]
async fn two_nodes_federate_messages() {
    // Node 1 listens; node 2 dials it.
    let (k1, m1) = mesh_kernel(0, vec![], Duration::from_millis(200));
    k1.start().await.unwrap();
    let addr1 = m1.local_addr().unwrap();

    let (k2, m2) = mesh_kernel(0, vec![addr1.to_string()], Duration::from_millis(200));
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    k2.on("*", move |msg, tk| {
        let seen_tx = seen_tx.clone();
        async move {
            let transport = tk
                .presence()
                .get(tk.client_id())
                .await
                .map(|s| s.transport)
                .unwrap_or_default();
            let _ = seen_tx.send((msg, tk.client_id().to_owned(), transport));
            Ok(())
        }
    });
    k2.start().await.unwrap();

    // Each hub surfaces exactly one synthetic client for the other node.
    let expected_on_1 = format!("mesh:{}", m2.node_id());
    let expected_on_2 = format!("mesh:{}", m1.node_id());
    wait_for("hello exchange", || {
        let (k1, k2) = (k1.clone(), k2.clone());
        async move { mesh_peers_of(&k1).await.len() == 1 && mesh_peers_of(&k2).await.len() == 1 }
    })
    .await;

    let peers_on_1 = mesh_peers_of(&k1).await;
    assert_eq!(peers_on_1[0].id, expected_on_1);
    assert_eq!(peers_on_1[0].metadata.get("nodeId"), Some(&json!(m2.node_id())));
    assert_eq!(mesh_peers_of(&k2).await[0].id, expected_on_2);

    // Unicast through node 1's hub lands on node 2 as an inbound message
    // from the synthetic mesh client.
    let sent = k1
        .hub()
        .send(&expected_on_1, Message::event("sync:ping", json!({"n": 1})))
        .await;
    assert!(sent);

    let (msg, from, transport) = timeout(DEADLINE, seen_rx.recv())
        .await
        .expect("federated message never arrived")
        .unwrap();
    assert_eq!(msg.kind, "sync:ping");
    assert_eq!(msg.payload, json!({"n": 1}));
    assert!(msg.timestamp.is_some(), "hub timestamp missing");
    assert_eq!(from, expected_on_2);
    assert_eq!(transport, "mesh");

    // The transport-level broadcast helper reaches every ready peer too.
    let fanned = m1.broadcast(Message::event("gossip", json!("hello"))).await;
    assert_eq!(fanned, 1);
    let (msg, _, _) = timeout(DEADLINE, seen_rx.recv())
        .await
        .expect("broadcast never arrived")
        .unwrap();
    assert_eq!(msg.kind, "gossip");

    // Stopping node 2 tears down the connection and node 1 notices.
    k2.stop().await;
    wait_for("peer teardown", || {
        let k1 = k1.clone();
        async move { mesh_peers_of(&k1).await.is_empty() }
    })
    .await;
    k1.stop().await;
}

#[tokio::test]
async fn concurrent_mutual_dial_yields_one_connection_per_node() {
    let port1 = reserve_port();
    let port2 = reserve_port();

    // Slightly different reconnect intervals break dial symmetry.
    let (k1, m1) = mesh_kernel(
        port1,
        vec![format!("127.0.0.1:{port2}")],
        Duration::from_millis(150),
    );
    let (k2, m2) = mesh_kernel(
        port2,
        vec![format!("127.0.0.1:{port1}")],
        Duration::from_millis(230),
    );
    k1.start().await.unwrap();
    k2.start().await.unwrap();

    let expected_on_1 = format!("mesh:{}", m2.node_id());
    let expected_on_2 = format!("mesh:{}", m1.node_id());

    wait_for("both nodes connected", || {
        let (k1, k2) = (k1.clone(), k2.clone());
        let (expected_on_1, expected_on_2) = (expected_on_1.clone(), expected_on_2.clone());
        async move {
            let p1 = mesh_peers_of(&k1).await;
            let p2 = mesh_peers_of(&k2).await;
            p1.len() == 1
                && p2.len() == 1
                && p1[0].id == expected_on_1
                && p2[0].id == expected_on_2
        }
    })
    .await;

    // The dedup invariant must hold from here on: sample for a while and
    // never observe a second client for the same node.
    for _ in 0..20 {
        let p1 = mesh_peers_of(&k1).await;
        let p2 = mesh_peers_of(&k2).await;
        assert!(p1.len() <= 1, "node 1 has duplicate mesh peers: {p1:?}");
        assert!(p2.len() <= 1, "node 2 has duplicate mesh peers: {p2:?}");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    k1.stop().await;
    k2.stop().await;
}

#[tokio::test]
async fn dialer_reconnects_after_peer_restart() {
    let port1 = reserve_port();

    let (k1, _m1) = mesh_kernel(port1, vec![], Duration::from_millis(150));
    k1.start().await.unwrap();

    // The dialer comes up pointing at node 1 and connects.
    let (k2, _m2) = mesh_kernel(0, vec![format!("127.0.0.1:{port1}")], Duration::from_millis(150));
    k2.start().await.unwrap();
    wait_for("initial connection", || {
        let k2 = k2.clone();
        async move { mesh_peers_of(&k2).await.len() == 1 }
    })
    .await;

    // Node 1 goes away; the dialer notices.
    k1.stop().await;
    wait_for("peer loss", || {
        let k2 = k2.clone();
        async move { mesh_peers_of(&k2).await.is_empty() }
    })
    .await;

    // Node 1 returns on the same port with the same identity; the fixed
    // interval dial loop finds it again.
    let (k1b, m1b) = mesh_kernel(port1, vec![], Duration::from_millis(150));
    k1b.start().await.unwrap();
    assert_eq!(m1b.local_addr().unwrap().port(), port1);
    wait_for("reconnect", || {
        let k2 = k2.clone();
        async move { mesh_peers_of(&k2).await.len() == 1 }
    })
    .await;
    // A fresh node id means a fresh synthetic client.
    assert_eq!(mesh_peers_of(&k2).await[0].id, format!("mesh:{}", m1b.node_id()));

    k2.stop().await;
    k1b.stop().await;
}
