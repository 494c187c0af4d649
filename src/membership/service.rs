use anyhow::Result;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::info;

use super::types::{ClusterView, GossipMessage, Node, NodeId, NodeState};
use crate::clock::now_ms;
use crate::config::ClusterConfig;
use crate::error::ClusterError;

const HANDSHAKE_RETRY_INTERVAL: Duration = Duration::from_millis(250);
const MAX_DATAGRAM: usize = 65_536;
/// Heartbeat ticks between two merge offers to addresses outside the view.
const MERGE_OFFER_TICKS: u64 = 5;

pub struct MembershipService {
    pub local_node: Node,
    /// Every node this process has heard of, including ones that left.
    pub members: Arc<DashMap<NodeId, Node>>,
    cluster_name: String,
    candidates: Vec<SocketAddr>,
    allow_standalone: bool,
    join_timeout: Duration,
    heartbeat_interval: Duration,
    failure_window: Duration,
    suspect_grace: Duration,
    departed_retention: Duration,
    state: RwLock<NodeState>,
    view: watch::Sender<Arc<ClusterView>>,
    joined: Notify,
    socket: Arc<UdpSocket>,
    /// Drops every inbound datagram while set, as a network partition would.
    #[cfg(test)]
    pub(crate) isolated: std::sync::atomic::AtomicBool,
}

impl MembershipService {
    pub fn new(
        config: &ClusterConfig,
        socket: UdpSocket,
        http_addr: SocketAddr,
    ) -> Result<Arc<Self>, ClusterError> {
        let gossip_addr = socket.local_addr()?;
        let local_node = Node::new(NodeId::new(), gossip_addr, http_addr);

        let candidates = config
            .members
            .iter()
            .copied()
            .filter(|addr| *addr != gossip_addr)
            .collect();

        let members = Arc::new(DashMap::new());
        members.insert(local_node.id.clone(), local_node.clone());

        let (view, _) = watch::channel(Arc::new(ClusterView::default()));

        Ok(Arc::new(Self {
            local_node,
            members,
            cluster_name: config.cluster_name.clone(),
            candidates,
            allow_standalone: config.allow_standalone,
            join_timeout: config.join_timeout,
            heartbeat_interval: config.heartbeat_interval,
            failure_window: config.failure_window(),
            suspect_grace: config.suspect_grace,
            departed_retention: config.departed_retention,
            state: RwLock::new(NodeState::Joining),
            view,
            joined: Notify::new(),
            socket: Arc::new(socket),
            #[cfg(test)]
            isolated: std::sync::atomic::AtomicBool::new(false),
        }))
    }

    /// Spawns the receive, heartbeat and failure detection loops. Each loop
    /// exits once `shutdown` flips to `true`.
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        tracing::info!("Starting membership service on {}", self.local_node.gossip_addr);

        let receive_handle = {
            let service = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                service.receive_loop(shutdown).await;
            })
        };

        let heartbeat_handle = {
            let service = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                service.heartbeat_loop(shutdown).await;
            })
        };

        let failure_detection_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.failure_detection_loop(shutdown).await;
            })
        };

        vec![receive_handle, heartbeat_handle, failure_detection_handle]
    }

    /// Handshakes with the configured candidates until one answers with its
    /// view. Must run after [`start`](Self::start) so acks can be received.
    pub async fn join(&self) -> Result<(), ClusterError> {
        if self.candidates.is_empty() {
            info!("No candidate members configured, founding a new cluster");
            self.found_cluster();
            return Ok(());
        }

        info!(
            "Joining cluster '{}' via {} candidate(s)",
            self.cluster_name,
            self.candidates.len()
        );

        let deadline = tokio::time::Instant::now() + self.join_timeout;
        let mut retry = tokio::time::interval(HANDSHAKE_RETRY_INTERVAL);

        while !self.is_joined() {
            tokio::select! {
                _ = self.joined.notified() => {}
                _ = retry.tick() => {
                    let msg = GossipMessage::Handshake {
                        cluster_name: self.cluster_name.clone(),
                        node: self.local_node.clone(),
                        view_version: self.view().version,
                    };
                    for candidate in &self.candidates {
                        if let Err(e) = self.send_to(&msg, *candidate).await {
                            tracing::debug!("Handshake to {} failed: {}", candidate, e);
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }

        if self.is_joined() {
            return Ok(());
        }

        if self.allow_standalone {
            tracing::warn!(
                "No candidate answered within {:?}; founding standalone cluster",
                self.join_timeout
            );
            self.found_cluster();
            return Ok(());
        }

        Err(ClusterError::ClusterUnreachable {
            candidates: self.candidates.clone(),
            timeout: self.join_timeout,
        })
    }

    /// Announces a graceful departure to the rest of the cluster.
    pub async fn leave(&self) {
        if !self.is_joined() {
            return;
        }
        let msg = GossipMessage::Leave {
            node_id: self.local_node.id.clone(),
            view_version: self.view().version,
        };
        self.broadcast_message(msg).await;
        *self.state.write() = NodeState::Left;
        info!("Left cluster '{}'", self.cluster_name);
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_node.id
    }

    pub fn local_state(&self) -> NodeState {
        *self.state.read()
    }

    pub fn is_joined(&self) -> bool {
        self.local_state() == NodeState::Active
    }

    /// The current view. Cheap: views are shared, never mutated in place.
    pub fn view(&self) -> Arc<ClusterView> {
        self.view.borrow().clone()
    }

    /// Receiver that observes every newly installed view.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ClusterView>> {
        self.view.subscribe()
    }

    pub fn get_active_members(&self) -> Vec<Node> {
        self.view().members.clone()
    }

    pub fn get_member(&self, id: &NodeId) -> Option<Node> {
        if let Some(node) = self.view().member(id) {
            return Some(node.clone());
        }
        self.members.get(id).map(|entry| entry.value().clone())
    }

    fn found_cluster(&self) {
        *self.state.write() = NodeState::Active;
        if let Some(mut local) = self.members.get_mut(&self.local_node.id) {
            local.state = NodeState::Active;
        }
        let view = Arc::new(ClusterView::founding(&self.local_node));
        self.view.send_replace(view);
        info!("Founded cluster '{}' as {}", self.cluster_name, self.local_node.id);
        self.joined.notify_one();
    }

    /// Atomically derives the next view from the current one. Readers never
    /// observe a partially updated view.
    fn update_view<F>(&self, change: F) -> Option<Arc<ClusterView>>
    where
        F: FnOnce(&ClusterView) -> Option<ClusterView>,
    {
        let mut installed = None;
        self.view.send_if_modified(|current| match change(current) {
            Some(next) => {
                let next = Arc::new(next);
                *current = next.clone();
                installed = Some(next);
                true
            }
            None => false,
        });

        if let Some(view) = &installed {
            info!(
                "Installed cluster view v{} with {} member(s)",
                view.version,
                view.len()
            );
        }
        installed
    }

    async fn receive_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let received = tokio::select! {
                _ = shutdown.changed() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };

            match received {
                Ok(_) if self.drops_inbound() => {}
                Ok((len, src)) => match bincode::deserialize::<GossipMessage>(&buf[..len]) {
                    Ok(msg) => {
                        if let Err(e) = self.handle_message(msg, src).await {
                            tracing::error!("Error handling message from {}: {}", src, e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to deserialize message from {}: {}", src, e);
                    }
                },
                Err(e) => {
                    // ICMP port-unreachable from a dead peer surfaces here on some platforms.
                    tracing::debug!("Failed to receive UDP packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }

        tracing::debug!("Membership receive loop stopped");
    }

    #[cfg(test)]
    fn drops_inbound(&self) -> bool {
        self.isolated.load(std::sync::atomic::Ordering::Relaxed)
    }

    #[cfg(not(test))]
    fn drops_inbound(&self) -> bool {
        false
    }

    async fn handle_message(&self, msg: GossipMessage, src: SocketAddr) -> Result<()> {
        if self.local_state() == NodeState::Left {
            return Ok(());
        }

        match msg {
            GossipMessage::Handshake {
                cluster_name,
                node,
                view_version,
            } => {
                self.handle_handshake(cluster_name, node, view_version, src)
                    .await?;
            }

            GossipMessage::HandshakeAck { cluster_name, view } => {
                self.handle_handshake_ack(cluster_name, view).await?;
            }

            GossipMessage::Join { node } => {
                self.handle_join(node).await?;
            }

            GossipMessage::Heartbeat {
                node_id,
                timestamp_ms,
                view_version,
            } => {
                self.handle_heartbeat(node_id, timestamp_ms, view_version, src)
                    .await?;
            }

            GossipMessage::Suspect {
                node_id,
                view_version,
            } => {
                self.handle_suspect(node_id, view_version).await?;
            }

            GossipMessage::Alive {
                node_id,
                view_version,
            } => {
                self.handle_alive(node_id, view_version);
            }

            GossipMessage::ViewRequest { node_id } => {
                tracing::debug!("View requested by {}", node_id);
                let reply = GossipMessage::ViewUpdate {
                    view: (*self.view()).clone(),
                };
                self.send_to(&reply, src).await?;
            }

            GossipMessage::ViewUpdate { view } => {
                self.adopt_view(view).await;
            }

            GossipMessage::Leave {
                node_id,
                view_version,
            } => {
                self.handle_leave(node_id, view_version).await;
            }

            GossipMessage::Merge {
                cluster_name,
                node,
                view,
            } => {
                self.handle_merge(cluster_name, node, view).await;
            }
        }

        Ok(())
    }

    async fn handle_handshake(
        &self,
        cluster_name: String,
        node: Node,
        view_version: u64,
        src: SocketAddr,
    ) -> Result<()> {
        if cluster_name != self.cluster_name {
            tracing::warn!(
                "Rejecting handshake from {} for cluster '{}'",
                src,
                cluster_name
            );
            return Ok(());
        }

        if !self.is_joined() {
            // Two candidates starting together: the lowest address founds.
            if self.local_node.gossip_addr < node.gossip_addr && view_version == 0 {
                info!("Peer {} is also joining; founding as lowest address", src);
                self.found_cluster();
            } else {
                return Ok(());
            }
        }

        tracing::info!("Node {} handshaking from {}", node.id, node.gossip_addr);
        self.touch_member(&node);

        let changed = self.update_view(|view| match view.member(&node.id) {
            Some(existing)
                if existing.gossip_addr == node.gossip_addr
                    && existing.http_addr == node.http_addr =>
            {
                None
            }
            _ => Some(view.with_member(&node)),
        });

        let view = self.view();
        let reply = GossipMessage::HandshakeAck {
            cluster_name: self.cluster_name.clone(),
            view: (*view).clone(),
        };
        self.send_to(&reply, src).await?;

        if let Some(view) = changed {
            self.broadcast_view(&view).await;
        }

        Ok(())
    }

    async fn handle_handshake_ack(&self, cluster_name: String, view: ClusterView) -> Result<()> {
        if cluster_name != self.cluster_name {
            return Ok(());
        }

        if self.is_joined() {
            self.adopt_view(view).await;
            return Ok(());
        }

        let view = if view.contains(&self.local_node.id) {
            view
        } else {
            view.with_member(&self.local_node)
        };

        for member in &view.members {
            if member.id != self.local_node.id {
                self.touch_member(member);
            }
        }

        *self.state.write() = NodeState::Active;
        if let Some(mut local) = self.members.get_mut(&self.local_node.id) {
            local.state = NodeState::Active;
        }
        let view = Arc::new(view);
        self.view.send_replace(view.clone());
        info!(
            "Joined cluster '{}' at view v{} with {} member(s)",
            self.cluster_name,
            view.version,
            view.len()
        );
        self.joined.notify_one();

        let announce = GossipMessage::Join {
            node: self.local_node.clone(),
        };
        self.broadcast_message(announce).await;

        Ok(())
    }

    async fn handle_join(&self, node: Node) -> Result<()> {
        if !self.is_joined() {
            return Ok(());
        }

        tracing::info!("Node {} joining cluster at {}", node.id, node.gossip_addr);
        self.touch_member(&node);

        let changed = self.update_view(|view| {
            if view.contains(&node.id) {
                None
            } else {
                Some(view.with_member(&node))
            }
        });

        if let Some(view) = changed {
            self.broadcast_view(&view).await;
        }

        Ok(())
    }

    async fn handle_heartbeat(
        &self,
        node_id: NodeId,
        timestamp_ms: u64,
        view_version: u64,
        src: SocketAddr,
    ) -> Result<()> {
        tracing::trace!("Heartbeat from {} (t={})", node_id, timestamp_ms);

        let (refuted, stranger) = match self.members.get_mut(&node_id) {
            Some(mut member) => {
                member.last_heartbeat = Some(Instant::now());
                match member.state {
                    NodeState::Suspect => {
                        member.state = NodeState::Active;
                        member.suspected_at = None;
                        (true, false)
                    }
                    NodeState::Left => (false, true),
                    _ => (false, false),
                }
            }
            None => (false, true),
        };

        let view = self.view();

        if refuted {
            tracing::info!("Node {} refuted suspicion by heartbeat", node_id);
            let msg = GossipMessage::Alive {
                node_id: node_id.clone(),
                view_version: view.version,
            };
            self.broadcast_message(msg).await;
        }

        if (stranger || !view.contains(&node_id)) && self.is_joined() {
            // Let the sender notice it is not part of our view and re-join.
            let reply = GossipMessage::ViewUpdate {
                view: (*view).clone(),
            };
            self.send_to(&reply, src).await?;
        } else if view_version > view.version {
            let request = GossipMessage::ViewRequest {
                node_id: self.local_node.id.clone(),
            };
            self.send_to(&request, src).await?;
        }

        Ok(())
    }

    async fn handle_suspect(&self, node_id: NodeId, view_version: u64) -> Result<()> {
        if node_id == self.local_node.id {
            tracing::info!("Refuting suspicion about this node (v{})", view_version);
            let msg = GossipMessage::Alive {
                node_id,
                view_version: self.view().version,
            };
            self.broadcast_message(msg).await;
            return Ok(());
        }

        match self.members.get_mut(&node_id) {
            Some(mut member) => {
                let heard_recently = member
                    .last_heartbeat
                    .is_some_and(|seen| seen.elapsed() <= self.heartbeat_interval * 2);

                if member.state == NodeState::Active && !heard_recently {
                    tracing::warn!("Node {} suspected by peer gossip", node_id);
                    member.state = NodeState::Suspect;
                    member.suspected_at = Some(Instant::now());
                }
            }
            None => {
                tracing::debug!("Suspected node {} doesn't exist", node_id);
            }
        }

        Ok(())
    }

    fn handle_alive(&self, node_id: NodeId, view_version: u64) {
        if let Some(mut member) = self.members.get_mut(&node_id) {
            if member.state == NodeState::Suspect {
                tracing::info!("Node {} is alive again (v{})", node_id, view_version);
                member.state = NodeState::Active;
                member.suspected_at = None;
                member.last_heartbeat = Some(Instant::now());
            }
        }
    }

    async fn handle_leave(&self, node_id: NodeId, view_version: u64) {
        tracing::info!("Node {} leaving cluster (v{})", node_id, view_version);

        if let Some(mut member) = self.members.get_mut(&node_id) {
            member.state = NodeState::Left;
            member.left_at = Some(Instant::now());
        }

        let changed = self.update_view(|view| {
            view.contains(&node_id)
                .then(|| view.without_member(&node_id))
        });

        if let Some(view) = changed {
            self.broadcast_view(&view).await;
        }
    }

    /// Unions the view of a node outside ours. Only a sender missing from
    /// the local view triggers it; members that already share a view
    /// converge through `ViewUpdate`.
    async fn handle_merge(&self, cluster_name: String, node: Node, view: ClusterView) {
        if cluster_name != self.cluster_name || !self.is_joined() {
            return;
        }
        if node.id == self.local_node.id
            || !view.contains(&node.id)
            || self.view().contains(&node.id)
        {
            return;
        }

        // Refresh liveness first so the detector does not drop them again
        // before their heartbeats resume.
        for member in &view.members {
            if member.id != self.local_node.id {
                self.touch_member(member);
            }
        }

        let merged = self.update_view(|current| {
            (!current.contains(&node.id)).then(|| current.merge(&view))
        });

        if let Some(merged) = merged {
            info!(
                "Merged view v{} of {} ({} member(s)) into v{}",
                view.version,
                node.id,
                view.len(),
                merged.version
            );
            self.broadcast_view(&merged).await;
        }
    }

    async fn adopt_view(&self, incoming: ClusterView) {
        if !self.is_joined() {
            return;
        }

        let incoming_version = incoming.version;
        let installed = self.update_view(|current| {
            if incoming.version > current.version {
                Some(incoming.clone())
            } else if incoming.version == current.version && !incoming.same_members(current) {
                Some(current.merge(&incoming))
            } else {
                None
            }
        });

        let Some(view) = installed else {
            return;
        };

        for member in &view.members {
            if member.id != self.local_node.id {
                self.touch_member(member);
            }
        }

        if !view.contains(&self.local_node.id) {
            tracing::warn!("View v{} does not include this node; re-announcing", view.version);
            let announce = GossipMessage::Join {
                node: self.local_node.clone(),
            };
            self.broadcast_message(announce).await;
        } else if view.version > incoming_version {
            self.broadcast_view(&view).await;
        }
    }

    /// Records liveness for `node`, reviving it if it had been given up on.
    fn touch_member(&self, node: &Node) {
        let now = Instant::now();
        let mut entry = self
            .members
            .entry(node.id.clone())
            .or_insert_with(|| node.as_active());
        entry.gossip_addr = node.gossip_addr;
        entry.http_addr = node.http_addr;
        entry.last_heartbeat = Some(now);
        if entry.state != NodeState::Active {
            entry.state = NodeState::Active;
            entry.suspected_at = None;
            entry.left_at = None;
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.heartbeat_interval);
        let mut ticks: u64 = 0;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {}
            }

            if !self.is_joined() {
                continue;
            }

            let view = self.view();
            let msg = GossipMessage::Heartbeat {
                node_id: self.local_node.id.clone(),
                timestamp_ms: now_ms(),
                view_version: view.version,
            };

            let encoded = match bincode::serialize(&msg) {
                Ok(encoded) => encoded,
                Err(e) => {
                    tracing::error!("Failed to serialize heartbeat: {}", e);
                    continue;
                }
            };

            for member in view.members.iter().filter(|m| m.id != self.local_node.id) {
                if let Err(e) = self.socket.send_to(&encoded, member.gossip_addr).await {
                    tracing::debug!("Failed to send heartbeat to {}: {}", member.id, e);
                }
            }

            ticks += 1;
            if ticks % MERGE_OFFER_TICKS == 0 {
                self.offer_merge(&view).await;
            }
        }
    }

    /// Sends this side's view to every known address outside it: the
    /// configured candidates and recently departed members.
    async fn offer_merge(&self, view: &ClusterView) {
        let inside: HashSet<SocketAddr> = view.members.iter().map(|m| m.gossip_addr).collect();
        let mut targets: Vec<SocketAddr> = self.candidates.clone();
        targets.extend(
            self.members
                .iter()
                .filter(|entry| entry.state == NodeState::Left)
                .map(|entry| entry.gossip_addr),
        );
        targets.retain(|addr| *addr != self.local_node.gossip_addr && !inside.contains(addr));
        targets.sort();
        targets.dedup();
        if targets.is_empty() {
            return;
        }

        let msg = GossipMessage::Merge {
            cluster_name: self.cluster_name.clone(),
            node: self.local_node.clone(),
            view: view.clone(),
        };
        for target in targets {
            if let Err(e) = self.send_to(&msg, target).await {
                tracing::trace!("Merge offer to {} failed: {}", target, e);
            }
        }
    }

    async fn failure_detection_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.heartbeat_interval);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {}
            }

            if !self.is_joined() {
                continue;
            }

            let now = Instant::now();
            let view = self.view();
            let mut suspicions = Vec::new();
            let mut departed = Vec::new();

            for mut entry in self.members.iter_mut() {
                let member = entry.value_mut();

                if member.id == self.local_node.id {
                    continue;
                }

                // Dropped from the view by another node's decision.
                if !view.contains(&member.id) {
                    let quiet = member
                        .last_heartbeat
                        .is_some_and(|seen| now.duration_since(seen) > self.failure_window);
                    if member.state != NodeState::Left && quiet {
                        member.state = NodeState::Left;
                        member.left_at = Some(now);
                    }
                    continue;
                }

                let Some(last_heartbeat) = member.last_heartbeat else {
                    member.last_heartbeat = Some(now);
                    continue;
                };
                let elapsed = now.duration_since(last_heartbeat);

                match member.state {
                    NodeState::Active | NodeState::Joining => {
                        if elapsed > self.failure_window {
                            tracing::warn!(
                                "Node {} suspected (no heartbeat for {:?})",
                                member.id,
                                elapsed
                            );
                            member.state = NodeState::Suspect;
                            member.suspected_at = Some(now);
                            suspicions.push(GossipMessage::Suspect {
                                node_id: member.id.clone(),
                                view_version: view.version,
                            });
                        }
                    }

                    NodeState::Suspect => {
                        let since = member.suspected_at.unwrap_or(now);
                        if now.duration_since(since) > self.suspect_grace {
                            tracing::warn!(
                                "Node {} declared LEFT (no heartbeat for {:?})",
                                member.id,
                                elapsed
                            );
                            member.state = NodeState::Left;
                            member.left_at = Some(now);
                            departed.push(member.id.clone());
                        }
                    }

                    NodeState::Left => {}
                }
            }

            for msg in suspicions {
                self.broadcast_message(msg).await;
            }

            for node_id in departed {
                let changed = self.update_view(|view| {
                    view.contains(&node_id)
                        .then(|| view.without_member(&node_id))
                });
                if let Some(view) = changed {
                    self.broadcast_view(&view).await;
                }
            }

            self.prune_departed(now);
        }
    }

    /// Forgets LEFT records older than the retention window.
    fn prune_departed(&self, now: Instant) {
        let retention = self.departed_retention;
        let before = self.members.len();
        self.members.retain(|_, member| {
            !(member.state == NodeState::Left
                && member
                    .left_at
                    .is_some_and(|left| now.duration_since(left) > retention))
        });
        let pruned = before.saturating_sub(self.members.len());
        if pruned > 0 {
            tracing::debug!("Forgot {} departed member(s)", pruned);
        }
    }

    async fn broadcast_view(&self, view: &ClusterView) {
        let msg = GossipMessage::ViewUpdate { view: view.clone() };
        self.broadcast_message(msg).await;
    }

    /// Sends `msg` to every member of the current view except this node.
    async fn broadcast_message(&self, msg: GossipMessage) {
        let encoded = match bincode::serialize(&msg) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!("Failed to serialize gossip message: {}", e);
                return;
            }
        };

        let view = self.view();
        for member in view.members.iter() {
            if member.id == self.local_node.id {
                continue;
            }
            if let Err(e) = self.socket.send_to(&encoded, member.gossip_addr).await {
                tracing::warn!("Failed to broadcast to {}: {}", member.id, e);
            }
        }
    }

    async fn send_to(&self, msg: &GossipMessage, addr: SocketAddr) -> Result<(), ClusterError> {
        let encoded = bincode::serialize(msg)?;
        self.socket.send_to(&encoded, addr).await?;
        Ok(())
    }
}
