//! Multi-node behavior over real localhost sockets.
//!
//! Every node binds ephemeral ports and runs with short timers so failure
//! detection, expiry and rebalancing complete within a few hundred
//! milliseconds.

use serde_json::json;
use session_cluster::storage::protocol::{CreateSessionResponse, SessionSnapshot};
use session_cluster::{ClusterConfig, ClusterError, SessionId, SessionNode, StoreError};
use std::time::Duration;
use tokio::net::UdpSocket;

fn fast_config() -> ClusterConfig {
    ClusterConfig {
        partition_count: 31,
        heartbeat_interval: Duration::from_millis(50),
        failure_threshold: 3,
        suspect_grace: Duration::from_millis(150),
        join_timeout: Duration::from_secs(2),
        sweep_interval: Duration::from_millis(100),
        operation_timeout: Duration::from_secs(5),
        backup_timeout: Duration::from_secs(1),
        ..ClusterConfig::ephemeral()
    }
}

async fn start_cluster(size: usize, config: ClusterConfig) -> Vec<SessionNode> {
    let founder = SessionNode::start(config.clone()).await.unwrap();
    let seed = founder.gossip_addr();
    let mut nodes = vec![founder];
    for _ in 1..size {
        let node = SessionNode::start(config.clone().with_member(seed))
            .await
            .unwrap();
        nodes.push(node);
    }
    assert!(
        converged(&nodes, size).await,
        "cluster of {} did not converge",
        size
    );
    nodes
}

/// Waits until every node has installed the same partition table for a
/// view of `size` members.
async fn converged(nodes: &[SessionNode], size: usize) -> bool {
    eventually(Duration::from_secs(5), || {
        let versions: Vec<u64> = nodes
            .iter()
            .map(|node| node.store().partitioner().view_version())
            .collect();
        nodes
            .iter()
            .all(|node| node.membership().view().len() == size)
            && versions.windows(2).all(|pair| pair[0] == pair[1])
            && nodes
                .iter()
                .all(|node| node.membership().view().version == versions[0])
    })
    .await
}

async fn eventually<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    condition()
}

async fn shutdown_all(nodes: Vec<SessionNode>) {
    for node in nodes {
        node.shutdown().await;
    }
}

// ============================================================
// CRUD ACROSS NODES
// ============================================================

#[tokio::test]
async fn test_read_your_writes_from_any_node() {
    let nodes = start_cluster(2, fast_config()).await;
    let (a, b) = (nodes[0].store(), nodes[1].store());

    for i in 0..10 {
        let id = a.create().await.unwrap();
        a.set_attribute(&id, "user", json!(format!("user-{}", i)))
            .await
            .unwrap();
        assert_eq!(
            a.get_attribute(&id, "user").await.unwrap(),
            json!(format!("user-{}", i))
        );
        assert_eq!(
            b.get_attribute(&id, "user").await.unwrap(),
            json!(format!("user-{}", i))
        );
    }

    // With ten keys over two nodes, at least one call had to be forwarded.
    assert!(a.stats().forwards + b.stats().forwards > 0);

    shutdown_all(nodes).await;
}

#[tokio::test]
async fn test_writes_reach_the_backup_before_returning() {
    let nodes = start_cluster(2, fast_config()).await;
    let a = nodes[0].store();

    let id = a.create().await.unwrap();
    a.set_attribute(&id, "cart", json!(["book"])).await.unwrap();

    // Backup count 1 on two nodes: both hold the same version right away.
    let copies: Vec<_> = nodes
        .iter()
        .map(|node| node.store().local_entry(&id).unwrap())
        .collect();
    assert_eq!(copies[0].version, copies[1].version);
    assert_eq!(copies[0].attributes["cart"], json!(["book"]));

    shutdown_all(nodes).await;
}

#[tokio::test]
async fn test_delete_is_idempotent_across_nodes() {
    let nodes = start_cluster(2, fast_config()).await;
    let (a, b) = (nodes[0].store(), nodes[1].store());

    let id = a.create().await.unwrap();
    b.delete(&id).await.unwrap();
    b.delete(&id).await.unwrap();
    a.delete(&id).await.unwrap();

    assert_eq!(a.get(&id).await, Err(StoreError::SessionNotFound(id.clone())));
    assert!(nodes.iter().all(|node| node.store().local_entry(&id).is_none()));

    // Never existed at all.
    a.delete(&SessionId::from("no-such-session")).await.unwrap();

    shutdown_all(nodes).await;
}

#[tokio::test]
async fn test_concurrent_writers_leave_one_dominating_value() {
    let nodes = start_cluster(2, fast_config()).await;
    let (a, b) = (nodes[0].store(), nodes[1].store());

    let id = a.create().await.unwrap();
    let (from_a, from_b) = tokio::join!(
        a.set_attribute(&id, "color", json!("red")),
        b.set_attribute(&id, "color", json!("blue")),
    );
    from_a.unwrap();
    from_b.unwrap();

    let seen_by_a = a.get(&id).await.unwrap();
    let seen_by_b = b.get(&id).await.unwrap();
    assert_eq!(seen_by_a.attributes["color"], seen_by_b.attributes["color"]);
    assert!(["red", "blue"].contains(&seen_by_a.attributes["color"].as_str().unwrap()));
    // create = 1, then one version per write.
    assert_eq!(seen_by_a.version, 3);

    // Primary and backup agree on the winner.
    let copies: Vec<_> = nodes
        .iter()
        .map(|node| node.store().local_entry(&id).unwrap())
        .collect();
    assert_eq!(copies[0].version, copies[1].version);
    assert_eq!(copies[0].attributes["color"], copies[1].attributes["color"]);

    shutdown_all(nodes).await;
}

// ============================================================
// EXPIRY & EVICTION
// ============================================================

#[tokio::test]
async fn test_idle_session_expires_on_every_owner() {
    let nodes = start_cluster(2, fast_config()).await;
    let a = nodes[0].store();

    let id = a
        .create_with(Duration::from_secs(60), Duration::from_secs(1))
        .await
        .unwrap();
    assert!(a.get(&id).await.is_ok());

    // Idle timeout plus one sweep interval, with some slack.
    tokio::time::sleep(Duration::from_millis(1400)).await;

    assert!(nodes.iter().all(|node| node.store().local_entry(&id).is_none()));
    assert_eq!(a.get(&id).await, Err(StoreError::SessionNotFound(id.clone())));
    assert_eq!(
        nodes.iter().map(|node| node.store().stats().expirations).sum::<u64>(),
        1
    );

    shutdown_all(nodes).await;
}

#[tokio::test]
async fn test_capacity_evicts_least_recently_used() {
    let config = ClusterConfig {
        capacity_per_node: 3,
        ..fast_config()
    };
    let node = SessionNode::start(config).await.unwrap();
    let store = node.store();

    let oldest = store.create().await.unwrap();
    let untouched = store.create().await.unwrap();
    let third = store.create().await.unwrap();

    // Reading the oldest entry makes `untouched` the LRU victim.
    store.get(&oldest).await.unwrap();
    let fourth = store.create().await.unwrap();

    assert_eq!(store.stats().evictions, 1);
    assert!(store.get(&untouched).await.unwrap_err().is_not_found());
    for id in [&oldest, &third, &fourth] {
        assert!(store.get(id).await.is_ok(), "{} should survive", id);
    }

    node.shutdown().await;
}

// ============================================================
// MEMBERSHIP CHANGES
// ============================================================

#[tokio::test]
async fn test_failover_keeps_sessions_without_resurrection() {
    let mut nodes = start_cluster(2, fast_config()).await;
    let survivor = nodes[1].store();
    let writer = nodes[0].store();

    let mut live = Vec::new();
    let mut deleted = Vec::new();
    for i in 0..20 {
        let id = writer.create().await.unwrap();
        writer.set_attribute(&id, "n", json!(i)).await.unwrap();
        if i % 4 == 0 {
            writer.delete(&id).await.unwrap();
            deleted.push(id);
        } else {
            live.push((id, i));
        }
    }

    let crashed = nodes.remove(0);
    let crashed_id = crashed.id().clone();
    crashed.halt().await;

    let removed = eventually(Duration::from_secs(5), || {
        !survivor.membership().view().contains(&crashed_id)
            && survivor.partitioner().view_version() == survivor.membership().view().version
    })
    .await;
    assert!(removed, "crashed node should leave the view");

    for (id, n) in &live {
        assert_eq!(survivor.get_attribute(id, "n").await.unwrap(), json!(n));
    }
    for id in &deleted {
        assert_eq!(
            survivor.get(id).await,
            Err(StoreError::SessionNotFound(id.clone()))
        );
    }

    // The promoted primary accepts new writes.
    let (id, _) = &live[0];
    survivor.set_attribute(id, "after", json!(true)).await.unwrap();
    assert_eq!(survivor.get_attribute(id, "after").await.unwrap(), json!(true));

    shutdown_all(nodes).await;
}

#[tokio::test]
async fn test_joining_node_takes_over_existing_sessions() {
    let first = SessionNode::start(fast_config()).await.unwrap();
    let store = first.store();

    let mut ids = Vec::new();
    for i in 0..20 {
        let id = store.create().await.unwrap();
        store.set_attribute(&id, "n", json!(i)).await.unwrap();
        ids.push(id);
    }

    let second = SessionNode::start(fast_config().with_member(first.gossip_addr()))
        .await
        .unwrap();
    let nodes = vec![first, second];
    assert!(converged(&nodes, 2).await);

    let newcomer = nodes[1].store();
    assert!(newcomer.stats().primary_partitions > 0);
    for (i, id) in ids.iter().enumerate() {
        assert_eq!(newcomer.get_attribute(id, "n").await.unwrap(), json!(i));
        assert_eq!(
            nodes[0].store().get_attribute(id, "n").await.unwrap(),
            json!(i)
        );
    }

    shutdown_all(nodes).await;
}

#[tokio::test]
async fn test_graceful_shutdown_removes_node_quickly() {
    let config = ClusterConfig {
        // Slow failure detection: only the leave message explains a fast removal.
        suspect_grace: Duration::from_secs(10),
        ..fast_config()
    };
    let mut nodes = start_cluster(2, config).await;
    let stayer = nodes[0].store();
    let id = stayer.create().await.unwrap();
    stayer.set_attribute(&id, "k", json!("v")).await.unwrap();

    let leaver = nodes.remove(1);
    let leaver_id = leaver.id().clone();
    leaver.shutdown().await;

    assert!(
        eventually(Duration::from_secs(1), || {
            !stayer.membership().view().contains(&leaver_id)
        })
        .await
    );
    assert!(
        eventually(Duration::from_secs(1), || {
            stayer.partitioner().view_version() == stayer.membership().view().version
        })
        .await
    );
    assert_eq!(stayer.get_attribute(&id, "k").await.unwrap(), json!("v"));

    shutdown_all(nodes).await;
}

#[tokio::test]
async fn test_unreachable_candidates_are_fatal_unless_standalone() {
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let silent_addr = silent.local_addr().unwrap();

    let strict = ClusterConfig {
        allow_standalone: false,
        join_timeout: Duration::from_millis(300),
        ..fast_config()
    }
    .with_member(silent_addr);
    let result = SessionNode::start(strict).await;
    assert!(matches!(result, Err(ClusterError::ClusterUnreachable { .. })));

    let lenient = ClusterConfig {
        allow_standalone: true,
        join_timeout: Duration::from_millis(300),
        ..fast_config()
    }
    .with_member(silent_addr);
    let node = SessionNode::start(lenient).await.unwrap();
    let id = node.store().create().await.unwrap();
    assert!(node.store().get(&id).await.is_ok());
    node.shutdown().await;
}

#[tokio::test]
async fn test_invalid_config_is_rejected_before_binding() {
    let config = ClusterConfig {
        backup_timeout: Duration::from_secs(30),
        operation_timeout: Duration::from_secs(30),
        ..fast_config()
    };
    assert!(matches!(
        SessionNode::start(config).await,
        Err(ClusterError::Config(_))
    ));
}

// ============================================================
// HTTP SURFACE
// ============================================================

#[tokio::test]
async fn test_public_http_api_round_trip() {
    let nodes = start_cluster(2, fast_config()).await;
    let client = reqwest::Client::new();
    let base_a = format!("http://{}", nodes[0].http_addr());
    let base_b = format!("http://{}", nodes[1].http_addr());

    let created: CreateSessionResponse = client
        .post(format!("{}/sessions", base_a))
        .json(&json!({}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = created.id;

    let status = client
        .put(format!("{}/sessions/{}/attributes/theme", base_b, id))
        .json(&json!("dark"))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, reqwest::StatusCode::NO_CONTENT);

    let session: SessionSnapshot = client
        .get(format!("{}/sessions/{}", base_a, id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(session.attributes["theme"], json!("dark"));

    let missing = client
        .get(format!("{}/sessions/{}/attributes/font", base_b, id))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(missing, reqwest::StatusCode::NOT_FOUND);

    for _ in 0..2 {
        let deleted = client
            .delete(format!("{}/sessions/{}", base_b, id))
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(deleted, reqwest::StatusCode::NO_CONTENT);
    }

    let gone = client
        .get(format!("{}/sessions/{}", base_a, id))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(gone, reqwest::StatusCode::NOT_FOUND);

    let health: serde_json::Value = client
        .get(format!("{}/health", base_b))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["members"].as_array().unwrap().len(), 2);

    shutdown_all(nodes).await;
}
