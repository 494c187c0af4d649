//! Membership Module Tests
//!
//! ## Test Scopes
//! - **Data Structures**: node identity, view versioning and the gossip wire format.
//! - **Service Logic**: founding, joining through a candidate, rejection of foreign
//!   clusters, failure detection and graceful leave over real localhost sockets.
//! - **Recovery**: suspicion refuted by a live peer, segments re-merging after
//!   a network split, and forgetting departed members.

#[cfg(test)]
mod tests {
    use crate::config::ClusterConfig;
    use crate::error::ClusterError;
    use crate::membership::service::MembershipService;
    use crate::membership::types::{ClusterView, GossipMessage, Node, NodeId, NodeState};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::net::UdpSocket;
    use tokio::sync::watch;
    use tokio::task::JoinHandle;

    struct Member {
        service: Arc<MembershipService>,
        shutdown: watch::Sender<bool>,
        handles: Vec<JoinHandle<()>>,
    }

    impl Member {
        async fn stop(self) {
            let _ = self.shutdown.send(true);
            for handle in self.handles {
                let _ = handle.await;
            }
        }
    }

    fn fast_config() -> ClusterConfig {
        ClusterConfig {
            heartbeat_interval: Duration::from_millis(50),
            failure_threshold: 3,
            suspect_grace: Duration::from_millis(100),
            join_timeout: Duration::from_secs(2),
            ..ClusterConfig::ephemeral()
        }
    }

    async fn spawn_member(config: &ClusterConfig) -> Member {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let http_addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let service = MembershipService::new(config, socket, http_addr).unwrap();
        let (shutdown, rx) = watch::channel(false);
        let handles = service.start(rx);
        Member {
            service,
            shutdown,
            handles,
        }
    }

    async fn eventually<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        condition()
    }

    fn set_isolated(member: &Member, isolated: bool) {
        member.service.isolated.store(isolated, Ordering::Relaxed);
    }

    fn state_of(service: &MembershipService, id: &NodeId) -> Option<NodeState> {
        service.members.get(id).map(|m| m.state)
    }

    async fn send_raw(socket: &UdpSocket, msg: &GossipMessage, to: SocketAddr) {
        let encoded = bincode::serialize(msg).unwrap();
        socket.send_to(&encoded, to).await.unwrap();
    }

    fn node(id: &str, port: u16) -> Node {
        Node::new(
            NodeId(id.to_string()),
            SocketAddr::from(([127, 0, 0, 1], port)),
            SocketAddr::from(([127, 0, 0, 1], port + 1000)),
        )
    }

    // ============================================================
    // NODE & VIEW TESTS
    // ============================================================

    #[test]
    fn test_node_id_is_unique() {
        assert_ne!(NodeId::new(), NodeId::new());
    }

    #[test]
    fn test_view_membership_changes_bump_version() {
        let a = node("a", 5000);
        let b = node("b", 5001);

        let view = ClusterView::founding(&a);
        assert_eq!(view.version, 1);
        assert_eq!(view.members[0].state, NodeState::Active);

        let grown = view.with_member(&b);
        assert_eq!(grown.version, 2);
        assert_eq!(grown.member_ids(), vec![NodeId("a".into()), NodeId("b".into())]);

        let shrunk = grown.without_member(&NodeId("a".into()));
        assert_eq!(shrunk.version, 3);
        assert_eq!(shrunk.member_ids(), vec![NodeId("b".into())]);

        // The original snapshots are untouched.
        assert_eq!(view.len(), 1);
        assert_eq!(grown.len(), 2);
    }

    #[test]
    fn test_with_member_replaces_previous_incarnation_at_same_address() {
        let old = node("old", 5000);
        let restarted = node("new", 5000);

        let view = ClusterView::founding(&old).with_member(&restarted);
        assert_eq!(view.member_ids(), vec![NodeId("new".into())]);
    }

    #[test]
    fn test_merge_of_conflicting_views_is_newer_union() {
        let base = ClusterView::founding(&node("a", 5000));
        let left = base.with_member(&node("b", 5001));
        let right = base.with_member(&node("c", 5002));
        assert_eq!(left.version, right.version);
        assert!(!left.same_members(&right));

        let merged = left.merge(&right);
        assert_eq!(merged.version, left.version + 1);
        assert_eq!(merged.len(), 3);
        assert!(merged.same_members(&right.merge(&left)));
    }

    #[test]
    fn test_handshake_bincode_serialization() {
        let msg = GossipMessage::Handshake {
            cluster_name: "sessions".into(),
            node: node("joiner", 5000),
            view_version: 0,
        };

        let encoded = bincode::serialize(&msg).expect("Failed to serialize Handshake");
        let decoded: GossipMessage =
            bincode::deserialize(&encoded).expect("Failed to deserialize Handshake");

        if let GossipMessage::Handshake {
            cluster_name,
            node,
            view_version,
        } = decoded
        {
            assert_eq!(cluster_name, "sessions");
            assert_eq!(node.id.0, "joiner");
            assert_eq!(node.http_addr.port(), 6000);
            assert!(node.last_heartbeat.is_none());
            assert_eq!(view_version, 0);
        } else {
            panic!("Wrong message type");
        }
    }

    // ============================================================
    // MEMBERSHIP SERVICE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_founder_without_candidates() {
        let member = spawn_member(&fast_config()).await;
        assert_eq!(member.service.local_state(), NodeState::Joining);
        assert_eq!(member.service.view().version, 0);

        member.service.join().await.unwrap();

        let view = member.service.view();
        assert!(member.service.is_joined());
        assert_eq!(view.version, 1);
        assert_eq!(view.member_ids(), vec![member.service.local_id().clone()]);

        member.stop().await;
    }

    #[tokio::test]
    async fn test_second_node_joins_through_candidate() {
        let config = fast_config();
        let a = spawn_member(&config).await;
        a.service.join().await.unwrap();

        let b_config = config
            .clone()
            .with_member(a.service.local_node.gossip_addr);
        let b = spawn_member(&b_config).await;
        let mut views = b.service.subscribe();
        b.service.join().await.unwrap();
        assert!(views.has_changed().unwrap());

        let converged = eventually(Duration::from_secs(2), || {
            let va = a.service.view();
            let vb = b.service.view();
            va.len() == 2 && va.version == vb.version && va.same_members(&vb)
        })
        .await;
        assert!(converged, "both nodes should agree on a two-member view");

        let b_seen_by_a = a.service.get_member(b.service.local_id()).unwrap();
        assert_eq!(b_seen_by_a.http_addr, b.service.local_node.http_addr);

        b.stop().await;
        a.stop().await;
    }

    #[tokio::test]
    async fn test_unreachable_candidates_fail_startup() {
        // Bound but silent: handshakes are swallowed.
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = ClusterConfig {
            allow_standalone: false,
            join_timeout: Duration::from_millis(300),
            ..fast_config()
        }
        .with_member(silent.local_addr().unwrap());

        let member = spawn_member(&config).await;
        let result = member.service.join().await;
        assert!(matches!(
            result,
            Err(ClusterError::ClusterUnreachable { .. })
        ));
        assert!(!member.service.is_joined());

        member.stop().await;
    }

    #[tokio::test]
    async fn test_standalone_allowed_when_configured() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = ClusterConfig {
            allow_standalone: true,
            join_timeout: Duration::from_millis(200),
            ..fast_config()
        }
        .with_member(silent.local_addr().unwrap());

        let member = spawn_member(&config).await;
        member.service.join().await.unwrap();
        assert_eq!(member.service.view().len(), 1);

        member.stop().await;
    }

    #[tokio::test]
    async fn test_foreign_cluster_name_is_ignored() {
        let a = spawn_member(&fast_config()).await;
        a.service.join().await.unwrap();

        let config = ClusterConfig {
            cluster_name: "other-cluster".into(),
            allow_standalone: false,
            join_timeout: Duration::from_millis(300),
            ..fast_config()
        }
        .with_member(a.service.local_node.gossip_addr);

        let b = spawn_member(&config).await;
        assert!(b.service.join().await.is_err());
        assert_eq!(a.service.view().len(), 1);

        b.stop().await;
        a.stop().await;
    }

    #[tokio::test]
    async fn test_silent_node_is_removed_from_view() {
        let config = fast_config();
        let a = spawn_member(&config).await;
        a.service.join().await.unwrap();

        let b = spawn_member(&config.clone().with_member(a.service.local_node.gossip_addr)).await;
        b.service.join().await.unwrap();
        assert!(eventually(Duration::from_secs(2), || a.service.view().len() == 2).await);

        let b_id = b.service.local_id().clone();
        let version_before = a.service.view().version;

        // Crash: no leave announcement, heartbeats simply stop.
        b.stop().await;

        let removed = eventually(Duration::from_secs(3), || !a.service.view().contains(&b_id)).await;
        assert!(removed, "silent node should be declared LEFT");
        assert!(a.service.view().version > version_before);
        assert_eq!(
            a.service.members.get(&b_id).map(|m| m.state),
            Some(NodeState::Left)
        );

        a.stop().await;
    }

    #[tokio::test]
    async fn test_graceful_leave_is_immediate() {
        let config = ClusterConfig {
            // Slow failure detection so only the leave message can explain removal.
            heartbeat_interval: Duration::from_millis(200),
            suspect_grace: Duration::from_secs(10),
            ..fast_config()
        };
        let a = spawn_member(&config).await;
        a.service.join().await.unwrap();

        let b = spawn_member(&config.clone().with_member(a.service.local_node.gossip_addr)).await;
        b.service.join().await.unwrap();
        assert!(eventually(Duration::from_secs(2), || a.service.view().len() == 2).await);

        let b_id = b.service.local_id().clone();
        b.service.leave().await;
        assert_eq!(b.service.local_state(), NodeState::Left);

        assert!(eventually(Duration::from_millis(500), || !a.service.view().contains(&b_id)).await);

        b.stop().await;
        a.stop().await;
    }

    // ============================================================
    // RECOVERY TESTS
    // ============================================================

    #[tokio::test]
    async fn test_suspect_is_refuted_by_alive_and_heartbeat() {
        let config = ClusterConfig {
            // Long grace so the peer stays SUSPECT while it refutes.
            suspect_grace: Duration::from_secs(2),
            ..fast_config()
        };
        let a = spawn_member(&config).await;
        a.service.join().await.unwrap();
        let a_addr = a.service.local_node.gossip_addr;

        // A hand-driven peer that only speaks when told to.
        let peer_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = Node::new(
            NodeId::new(),
            peer_socket.local_addr().unwrap(),
            SocketAddr::from(([127, 0, 0, 1], 1)),
        );
        let handshake = GossipMessage::Handshake {
            cluster_name: config.cluster_name.clone(),
            node: peer.clone(),
            view_version: 0,
        };
        send_raw(&peer_socket, &handshake, a_addr).await;
        assert!(eventually(Duration::from_secs(1), || a.service.view().contains(&peer.id)).await);
        let version = a.service.view().version;

        assert!(
            eventually(Duration::from_secs(1), || {
                state_of(&a.service, &peer.id) == Some(NodeState::Suspect)
            })
            .await
        );
        let alive = GossipMessage::Alive {
            node_id: peer.id.clone(),
            view_version: version,
        };
        send_raw(&peer_socket, &alive, a_addr).await;
        assert!(
            eventually(Duration::from_millis(500), || {
                state_of(&a.service, &peer.id) == Some(NodeState::Active)
            })
            .await,
            "ALIVE should clear the suspicion"
        );

        // Silent again: suspected again, then a heartbeat refutes it.
        assert!(
            eventually(Duration::from_secs(1), || {
                state_of(&a.service, &peer.id) == Some(NodeState::Suspect)
            })
            .await
        );
        let heartbeat = GossipMessage::Heartbeat {
            node_id: peer.id.clone(),
            timestamp_ms: 0,
            view_version: version,
        };
        send_raw(&peer_socket, &heartbeat, a_addr).await;
        assert!(
            eventually(Duration::from_millis(500), || {
                state_of(&a.service, &peer.id) == Some(NodeState::Active)
            })
            .await,
            "a heartbeat should clear the suspicion"
        );

        // Refuted suspicions never cost a view change.
        let view = a.service.view();
        assert!(view.contains(&peer.id));
        assert_eq!(view.version, version);

        a.stop().await;
    }

    #[tokio::test]
    async fn test_split_segments_merge_after_heal() {
        let config = fast_config();
        let a = spawn_member(&config).await;
        a.service.join().await.unwrap();
        let b = spawn_member(&config.clone().with_member(a.service.local_node.gossip_addr)).await;
        b.service.join().await.unwrap();
        assert!(eventually(Duration::from_secs(2), || a.service.view().len() == 2).await);
        assert!(eventually(Duration::from_secs(2), || b.service.view().len() == 2).await);

        set_isolated(&a, true);
        set_isolated(&b, true);
        let split = eventually(Duration::from_secs(3), || {
            a.service.view().len() == 1 && b.service.view().len() == 1
        })
        .await;
        assert!(split, "each side should drop the other while cut off");

        set_isolated(&a, false);
        set_isolated(&b, false);
        let merged = eventually(Duration::from_secs(5), || {
            let (va, vb) = (a.service.view(), b.service.view());
            va.len() == 2 && va.version == vb.version && va.same_members(&vb)
        })
        .await;
        assert!(merged, "segments should converge on one view after the heal");
        assert_eq!(
            state_of(&a.service, b.service.local_id()),
            Some(NodeState::Active)
        );
        assert_eq!(
            state_of(&b.service, a.service.local_id()),
            Some(NodeState::Active)
        );

        b.stop().await;
        a.stop().await;
    }

    #[tokio::test]
    async fn test_merge_from_foreign_cluster_is_ignored() {
        let a = spawn_member(&fast_config()).await;
        a.service.join().await.unwrap();
        let a_addr = a.service.local_node.gossip_addr;

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let stranger = Node::new(
            NodeId::new(),
            socket.local_addr().unwrap(),
            SocketAddr::from(([127, 0, 0, 1], 1)),
        );
        let offer = GossipMessage::Merge {
            cluster_name: "other".into(),
            node: stranger.clone(),
            view: ClusterView::founding(&stranger),
        };
        send_raw(&socket, &offer, a_addr).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(a.service.view().len(), 1);
        assert!(a.service.members.get(&stranger.id).is_none());

        a.stop().await;
    }

    #[tokio::test]
    async fn test_departed_members_are_forgotten() {
        let config = ClusterConfig {
            departed_retention: Duration::from_millis(300),
            ..fast_config()
        };
        let a = spawn_member(&config).await;
        a.service.join().await.unwrap();
        let b = spawn_member(&config.clone().with_member(a.service.local_node.gossip_addr)).await;
        b.service.join().await.unwrap();
        assert!(eventually(Duration::from_secs(2), || a.service.view().len() == 2).await);

        let b_id = b.service.local_id().clone();
        b.stop().await;

        assert!(eventually(Duration::from_secs(3), || !a.service.view().contains(&b_id)).await);
        let forgotten =
            eventually(Duration::from_secs(3), || a.service.members.get(&b_id).is_none()).await;
        assert!(forgotten, "LEFT record should be dropped after the retention window");
        assert!(a.service.members.contains_key(a.service.local_id()));

        a.stop().await;
    }
}
