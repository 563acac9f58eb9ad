//! Cluster membership service: join sequence, gossip rounds, failure
//! detection and leave handling.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::cluster::ClusterError;
use crate::cluster::event::ClusterEvent;
use crate::cluster::gossip::{GossipEntry, GossipState, GossipStatus};
use crate::cluster::join::{JoinAttempt, JoinValidator, run_validators};
use crate::cluster::protocol::{GossipCodec, GossipMessage};
use crate::cluster::split_brain::{SplitBrainAction, SplitBrainDetector};
use crate::cluster::topology::Topology;
use crate::cluster::view::ClusterView;
use crate::codec::{CodecFactory, SingletonCodecFactory};
use crate::config::ClusterConfig;
use crate::metrics::{self, MetricsRegistry};
use crate::network::{
    ClientHandler, DisconnectReason, NetworkClient, NetworkConnectorConfig, NetworkService,
    ServerConnection, ServerHandler,
};
use crate::node::{Node, NodeId, NodeState};
use crate::seed::SeedNodeManager;

/// Protocol id of the membership connector.
pub const CLUSTER_PROTOCOL: &str = "hekate.cluster";

/// Faults the cluster service reports to its owning instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterFault {
    /// Detector declared the local node outside the real cluster.
    SplitBrain(SplitBrainAction),
    /// Detector itself failed; the instance must terminate.
    DetectorFailure,
}

/// Membership service for one node instance.
///
/// Owns the gossip runtime of the current incarnation; a rejoin replaces the
/// runtime wholesale (fresh identity, fresh topology versions).
pub struct ClusterService {
    config: ClusterConfig,
    network: Arc<NetworkService>,
    seeds: Arc<SeedNodeManager>,
    view: ClusterView,
    metrics: Arc<MetricsRegistry>,
    validators: Vec<Arc<dyn JoinValidator>>,
    detector: Option<Arc<dyn SplitBrainDetector>>,
    codec: Arc<dyn CodecFactory<GossipMessage>>,
    runtime: Mutex<Option<Arc<GossipRuntime>>>,
    state_tx: Arc<watch::Sender<NodeState>>,
    fault_tx: mpsc::UnboundedSender<ClusterFault>,
}

impl ClusterService {
    /// Creates the service and registers the membership connector.
    pub fn new(
        config: ClusterConfig,
        network: Arc<NetworkService>,
        seeds: Arc<SeedNodeManager>,
        validators: Vec<Arc<dyn JoinValidator>>,
        detector: Option<Arc<dyn SplitBrainDetector>>,
        metrics: Arc<MetricsRegistry>,
        state_tx: Arc<watch::Sender<NodeState>>,
        fault_tx: mpsc::UnboundedSender<ClusterFault>,
    ) -> Result<Arc<Self>, ClusterError> {
        let codec: Arc<dyn CodecFactory<GossipMessage>> =
            Arc::new(SingletonCodecFactory::new(GossipCodec));
        let service = Arc::new(Self {
            config,
            network: Arc::clone(&network),
            seeds,
            view: ClusterView::new(),
            metrics,
            validators,
            detector,
            codec: Arc::clone(&codec),
            runtime: Mutex::new(None),
            state_tx,
            fault_tx,
        });

        network.register_connector(
            NetworkConnectorConfig {
                protocol: CLUSTER_PROTOCOL.to_string(),
                codec,
                heartbeat_disabled: false,
            },
            Arc::new(GossipServerHandler {
                service: Arc::downgrade(&service),
            }),
        )?;
        Ok(service)
    }

    /// Observable topology view.
    #[must_use]
    pub fn view(&self) -> &ClusterView {
        &self.view
    }

    /// Latest topology snapshot.
    #[must_use]
    pub fn topology(&self) -> Topology {
        self.view.topology()
    }

    /// Local node descriptor of the current incarnation.
    #[must_use]
    pub fn local_node(&self) -> Option<Node> {
        let runtime = self.runtime.lock().clone();
        runtime.map(|runtime| runtime.local_node())
    }

    fn publish_state(&self, state: NodeState) {
        let _ = self.state_tx.send(state);
    }

    /// Runs the full join sequence and resolves once the local node is `Up`.
    pub async fn join(self: &Arc<Self>, local: Node) -> Result<Topology, ClusterError> {
        let deadline = tokio::time::Instant::now() + self.config.join_timeout;

        // Split-brain gate: keep polling while the detector reports invalid.
        if let Some(detector) = &self.detector {
            loop {
                match detector.is_valid(&local).await {
                    Ok(true) => break,
                    Ok(false) => {
                        debug!("split-brain detector reports invalid; delaying join");
                        tokio::time::sleep(self.config.split_brain_check_interval).await;
                    }
                    Err(err) => {
                        let _ = self.fault_tx.send(ClusterFault::DetectorFailure);
                        return Err(ClusterError::DetectorFailure(err.to_string()));
                    }
                }
                if tokio::time::Instant::now() >= deadline {
                    return Err(ClusterError::JoinTimeout(self.config.join_timeout));
                }
            }
        }

        self.seeds.start_discovery(local.addr).await?;
        let mut seeds = self.seeds.find_seed_nodes().await?;
        seeds.retain(|addr| *addr != local.addr);
        {
            let mut rng = SmallRng::from_entropy();
            seeds.shuffle(&mut rng);
        }

        let runtime = GossipRuntime::new(self, local.clone());
        *self.runtime.lock() = Some(Arc::clone(&runtime));

        // Try seeds in random order; the first accepting handshake decides.
        self.publish_state(NodeState::Joining);
        let mut accepted = false;
        for seed in &seeds {
            match runtime.join_via(*seed, &local, &self.config.name).await {
                Ok(()) => {
                    accepted = true;
                    break;
                }
                Err(ClusterError::JoinRejected { reason, rejected_by }) => {
                    runtime.shutdown();
                    *self.runtime.lock() = None;
                    self.seeds.stop_discovery(local.addr).await;
                    self.publish_state(NodeState::Down);
                    return Err(ClusterError::JoinRejected { reason, rejected_by });
                }
                Err(err) => {
                    debug!(seed = %seed, "seed join attempt failed: {err}");
                }
            }
        }

        if !accepted {
            // Nobody reachable: found a new cluster.
            info!("no reachable seed nodes; forming a new cluster");
            runtime.found_cluster();
        }

        self.publish_state(NodeState::Synchronizing);
        runtime.start_gossip_loop();

        let mut up_rx = runtime.up_rx.clone();
        let became_up = timeout(deadline - tokio::time::Instant::now(), async {
            loop {
                if *up_rx.borrow_and_update() {
                    return true;
                }
                if up_rx.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await;

        match became_up {
            Ok(true) => {
                // Wait for the join event to flow through the dispatcher so
                // callers observe a populated topology.
                let topology = self.view.future_of(|topology| !topology.is_empty()).await?;
                self.publish_state(NodeState::Up);
                Ok(topology)
            }
            Ok(false) => Err(ClusterError::Terminated),
            Err(_) => Err(ClusterError::JoinTimeout(self.config.join_timeout)),
        }
    }

    /// Graceful leave: announce, await one acknowledgement, go down.
    pub async fn leave(&self) -> Result<(), ClusterError> {
        let runtime = self.runtime.lock().clone();
        let Some(runtime) = runtime else {
            return Ok(());
        };
        self.publish_state(NodeState::Leaving);
        self.seeds.suspend_discovery().await;

        if timeout(self.config.leave_timeout, runtime.announce_leave())
            .await
            .is_err()
        {
            warn!("graceful leave timed out; escalating to terminate");
        }
        self.shutdown_runtime(runtime).await;
        Ok(())
    }

    /// Immediate departure relying on peer failure detection.
    pub async fn terminate(&self) {
        let runtime = self.runtime.lock().clone();
        if let Some(runtime) = runtime {
            self.publish_state(NodeState::Terminating);
            self.shutdown_runtime(runtime).await;
        }
    }

    async fn shutdown_runtime(&self, runtime: Arc<GossipRuntime>) {
        runtime.shutdown();
        self.seeds.stop_discovery(runtime.local_addr).await;
        self.view
            .publish(ClusterEvent::Leave(self.view.topology()));
        *self.runtime.lock() = None;
        self.publish_state(NodeState::Down);
    }

    fn runtime(&self) -> Option<Arc<GossipRuntime>> {
        self.runtime.lock().clone()
    }

    /// Detector check triggered when gossip leaves this node alone in a
    /// previously larger cluster.
    fn spawn_split_brain_check(self: &Arc<Self>) {
        let Some(detector) = self.detector.clone() else {
            return;
        };
        let Some(local) = self.local_node() else {
            return;
        };
        let service = Arc::clone(self);
        let action = self.config.split_brain_action;
        tokio::spawn(async move {
            match detector.is_valid(&local).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!("split-brain detected; applying {action:?}");
                    let _ = service.fault_tx.send(ClusterFault::SplitBrain(action));
                }
                Err(err) => {
                    warn!("split-brain detector failed: {err}; terminating");
                    let _ = service.fault_tx.send(ClusterFault::DetectorFailure);
                }
            }
        });
    }
}

/// Per-incarnation gossip engine.
struct GossipRuntime {
    service: Weak<ClusterService>,
    local_id: NodeId,
    local_addr: SocketAddr,
    state: Mutex<GossipState>,
    publisher: Mutex<TopologyPublisher>,
    clients: dashmap::DashMap<SocketAddr, Arc<NetworkClient<GossipMessage>>>,
    network: Arc<NetworkService>,
    view: ClusterView,
    metrics: Arc<MetricsRegistry>,
    config: ClusterConfig,
    codec: Arc<dyn CodecFactory<GossipMessage>>,
    shutdown_tx: watch::Sender<bool>,
    up_rx: watch::Receiver<bool>,
    up_tx: watch::Sender<bool>,
    join_waiter: Mutex<Option<oneshot::Sender<Result<(), ClusterError>>>>,
    leave_waiter: Mutex<Option<oneshot::Sender<()>>>,
}

struct TopologyPublisher {
    last: Option<BTreeSet<Node>>,
    version: u64,
}

impl GossipRuntime {
    fn new(service: &Arc<ClusterService>, local: Node) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        let (up_tx, up_rx) = watch::channel(false);
        let local_id = local.id;
        let local_addr = local.addr;
        let state = GossipState::new(GossipEntry::new(local, GossipStatus::Joining));
        Arc::new(Self {
            service: Arc::downgrade(service),
            local_id,
            local_addr,
            state: Mutex::new(state),
            publisher: Mutex::new(TopologyPublisher {
                last: None,
                version: 0,
            }),
            clients: dashmap::DashMap::new(),
            network: Arc::clone(&service.network),
            view: service.view.clone(),
            metrics: Arc::clone(&service.metrics),
            config: service.config.clone(),
            codec: Arc::clone(&service.codec),
            shutdown_tx,
            up_rx,
            up_tx,
            join_waiter: Mutex::new(None),
            leave_waiter: Mutex::new(None),
        })
    }

    fn local_node(&self) -> Node {
        self.state.lock().local().node.clone()
    }

    fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        for entry in self.clients.iter() {
            entry.value().disconnect();
        }
        self.clients.clear();
    }

    /// Founder path: no seeds answered, become a single-node cluster.
    fn found_cluster(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            state.update_local(|entry| {
                entry.status = GossipStatus::Up;
                entry.node.join_order = 1;
            });
            state.bump_epoch();
        }
        self.after_state_change();
    }

    /// One join attempt against one seed address.
    async fn join_via(
        self: &Arc<Self>,
        seed: SocketAddr,
        local: &Node,
        cluster: &str,
    ) -> Result<(), ClusterError> {
        let client = self.client_for(seed);
        client.ready().await?;

        let (tx, rx) = oneshot::channel();
        *self.join_waiter.lock() = Some(tx);

        client
            .send(&GossipMessage::JoinRequest {
                node: local.clone(),
                cluster: cluster.to_string(),
            })
            .await?;

        // The accept/reject arrives on this client's receive path.
        match timeout(self.network.config().connect_timeout * 2, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) | Err(_) => {
                *self.join_waiter.lock() = None;
                Err(ClusterError::JoinTimeout(self.config.join_timeout))
            }
        }
    }

    fn client_for(self: &Arc<Self>, addr: SocketAddr) -> Arc<NetworkClient<GossipMessage>> {
        if let Some(client) = self.clients.get(&addr) {
            if !client.is_disconnected() {
                return Arc::clone(&client);
            }
            drop(client);
            self.clients.remove(&addr);
        }
        let handler = Arc::new(GossipClientHandler {
            runtime: Arc::downgrade(self),
            peer: addr,
        });
        let client = Arc::new(self.network.connect(
            addr,
            CLUSTER_PROTOCOL,
            Bytes::new(),
            &self.codec,
            handler,
        ));
        self.clients.insert(addr, Arc::clone(&client));
        client
    }

    fn start_gossip_loop(self: &Arc<Self>) {
        let runtime = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(runtime.config.gossip_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut rng = SmallRng::from_entropy();
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => runtime.gossip_round(&mut rng).await,
                }
            }
            debug!("gossip loop stopped");
        });
    }

    async fn gossip_round(self: &Arc<Self>, rng: &mut SmallRng) {
        self.metrics.increment(metrics::GOSSIP_ROUNDS);

        let (message, mut peers, alive_addrs) = {
            let mut state = self.state.lock();
            if state.local_is_coordinator() {
                let admitted = state.assign_join_orders();
                if !admitted.is_empty() {
                    debug!(count = admitted.len(), "admitted joining nodes");
                }
                let retired = state.retire_leaving();
                if !retired.is_empty() {
                    debug!(count = retired.len(), "retired leaving nodes");
                }
            }
            let message = GossipMessage::Update {
                from: self.local_id,
                epoch: state.epoch(),
                digest: state.digest(),
                rumors: state.entries().cloned().collect(),
            };
            let peers = state.gossip_peers();
            let alive: BTreeSet<SocketAddr> = state
                .topology_nodes()
                .iter()
                .map(|node| node.addr)
                .collect();
            (message, peers, alive)
        };

        if let Some(service) = self.service.upgrade() {
            service.seeds.update_alive(alive_addrs);
        }

        peers.shuffle(rng);
        peers.truncate(self.config.gossip_fanout.max(1));

        for peer in peers {
            let client = self.client_for(peer.addr);
            match client.send(&message).await {
                Ok(()) => {
                    let mut state = self.state.lock();
                    state.unsuspect(self.local_id, peer.id);
                }
                Err(err) => {
                    debug!(peer = %peer.addr, "gossip send failed: {err}");
                    self.on_peer_failure(peer.id, peer.addr);
                }
            }
        }

        self.apply_failures();
        self.after_state_change();
    }

    fn on_peer_failure(&self, peer_id: NodeId, peer_addr: SocketAddr) {
        if let Some((_, client)) = self.clients.remove(&peer_addr) {
            client.disconnect();
        }
        let mut state = self.state.lock();
        if state.suspect(self.local_id, peer_id) {
            debug!(peer = %peer_id, "suspecting unreachable peer");
        }
    }

    fn apply_failures(&self) {
        let failed = {
            let mut state = self.state.lock();
            state.apply_failure_quorum(self.config.failure_quorum_fraction)
        };
        for id in failed {
            info!(node = %id, "peer declared failed by suspicion quorum");
        }
    }

    /// Publishes the topology if membership changed and keeps derived
    /// signals (`up` flag, split-brain trigger) current.
    fn after_state_change(self: &Arc<Self>) {
        let (nodes, epoch, local_up) = {
            let state = self.state.lock();
            (
                state.topology_nodes(),
                state.epoch(),
                state.local().status == GossipStatus::Up,
            )
        };

        if local_up && !*self.up_rx.borrow() {
            let _ = self.up_tx.send(true);
        }
        if !local_up {
            // Events start once the local node is admitted.
            return;
        }

        // Publishing happens under the publisher lock so concurrent state
        // changes cannot reorder versions on the dispatch queue.
        let published = {
            let mut publisher = self.publisher.lock();
            let event = match &publisher.last {
                Some(last) if *last == nodes => None,
                Some(last) => {
                    let added: Vec<Node> = nodes.difference(last).cloned().collect();
                    let removed: Vec<Node> = last.difference(&nodes).cloned().collect();
                    publisher.version = publisher.version.max(epoch).max(publisher.version + 1);
                    let topology = Topology::new(publisher.version, nodes.clone());
                    publisher.last = Some(nodes);
                    Some(ClusterEvent::Change {
                        topology,
                        added,
                        removed,
                    })
                }
                None => {
                    publisher.version = publisher.version.max(epoch).max(1);
                    let topology = Topology::new(publisher.version, nodes.clone());
                    publisher.last = Some(nodes);
                    Some(ClusterEvent::Join(topology))
                }
            };
            event.map(|event| {
                let removed_someone = matches!(
                    &event,
                    ClusterEvent::Change { removed, .. } if !removed.is_empty()
                );
                let remaining = event.topology().size();
                self.view.publish(event);
                (removed_someone, remaining)
            })
        };

        if let Some((removed_someone, remaining)) = published {
            self.metrics.increment(metrics::CLUSTER_EVENTS);
            // Alone after losing peers: consult the split-brain detector.
            if removed_someone && remaining == 1 {
                if let Some(service) = self.service.upgrade() {
                    service.spawn_split_brain_check();
                }
            }
        }
    }

    /// Handles an inbound update; returns the delta reply if the sender is
    /// missing anything.
    fn handle_update(
        self: &Arc<Self>,
        epoch: u64,
        digest: &[crate::cluster::gossip::GossipDigest],
        rumors: Vec<GossipEntry>,
    ) -> Option<GossipMessage> {
        let reply = {
            let mut state = self.state.lock();
            state.merge_epoch(epoch);
            state.merge(rumors);
            let deltas = state.deltas_for(digest);
            if deltas.is_empty() {
                None
            } else {
                Some(GossipMessage::Update {
                    from: self.local_id,
                    epoch: state.epoch(),
                    digest: state.digest(),
                    rumors: deltas,
                })
            }
        };
        self.apply_failures();
        self.after_state_change();
        reply
    }

    fn on_join_accept(self: &Arc<Self>, epoch: u64, entries: Vec<GossipEntry>) {
        {
            let mut state = self.state.lock();
            state.merge_epoch(epoch);
            state.merge(entries);
        }
        self.after_state_change();
        if let Some(waiter) = self.join_waiter.lock().take() {
            let _ = waiter.send(Ok(()));
        }
    }

    fn on_join_reject(&self, reason: String, rejected_by: SocketAddr) {
        if let Some(waiter) = self.join_waiter.lock().take() {
            let _ = waiter.send(Err(ClusterError::JoinRejected {
                reason,
                rejected_by,
            }));
        }
    }

    /// Announces the local leave and waits for one acknowledgement.
    async fn announce_leave(self: &Arc<Self>) {
        let (entry, peers) = {
            let mut state = self.state.lock();
            state.update_local(|entry| entry.status = GossipStatus::Leaving);
            (state.local().clone(), state.gossip_peers())
        };
        if peers.is_empty() {
            return;
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        *self.leave_waiter.lock() = Some(ack_tx);

        let message = GossipMessage::LeaveRequest {
            from: self.local_id,
            entry,
        };
        for peer in &peers {
            let client = self.client_for(peer.addr);
            if let Err(err) = client.send(&message).await {
                debug!(peer = %peer.addr, "leave announcement failed: {err}");
            }
        }

        let _ = ack_rx.await;
        let mut state = self.state.lock();
        state.update_local(|entry| entry.status = GossipStatus::Down);
    }

    fn on_leave_ack(&self) {
        if let Some(waiter) = self.leave_waiter.lock().take() {
            let _ = waiter.send(());
        }
    }
}

/// Inbound handler for the membership connector.
struct GossipServerHandler {
    service: Weak<ClusterService>,
}

#[async_trait]
impl ServerHandler<GossipMessage> for GossipServerHandler {
    async fn on_message(&self, msg: GossipMessage, from: &ServerConnection<GossipMessage>) {
        let Some(service) = self.service.upgrade() else {
            from.disconnect();
            return;
        };
        match msg {
            GossipMessage::JoinRequest { node, cluster } => {
                let Some(runtime) = service.runtime() else {
                    let _ = from
                        .send(&GossipMessage::JoinReject {
                            reason: "local node is not up".to_string(),
                        })
                        .await;
                    return;
                };
                if runtime.state.lock().local().status != GossipStatus::Up {
                    let _ = from
                        .send(&GossipMessage::JoinReject {
                            reason: "local node is not up".to_string(),
                        })
                        .await;
                    return;
                }
                let local = runtime.local_node();
                let attempt = JoinAttempt {
                    joining: &node,
                    cluster: &cluster,
                    local_cluster: &service.config.name,
                    local: &local,
                };
                if let Some(reason) = run_validators(&service.validators, &attempt).await {
                    info!(joining = %node, reason, "join rejected");
                    let _ = from.send(&GossipMessage::JoinReject { reason }).await;
                    return;
                }

                let (epoch, entries) = {
                    let mut state = runtime.state.lock();
                    state.add_joining(node);
                    (state.epoch(), state.entries().cloned().collect())
                };
                let _ = from
                    .send(&GossipMessage::JoinAccept {
                        coordinator: runtime.local_id,
                        epoch,
                        entries,
                    })
                    .await;
            }
            GossipMessage::Update {
                epoch,
                digest,
                rumors,
                ..
            } => {
                if let Some(runtime) = service.runtime() {
                    if let Some(reply) = runtime.handle_update(epoch, &digest, rumors) {
                        let _ = from.send(&reply).await;
                    }
                }
            }
            GossipMessage::LeaveRequest { from: leaver, entry } => {
                if let Some(runtime) = service.runtime() {
                    runtime.state.lock().merge([entry]);
                    runtime.after_state_change();
                    let _ = from
                        .send(&GossipMessage::LeaveAck {
                            from: runtime.local_id,
                        })
                        .await;
                    debug!(leaver = %leaver, "acknowledged leave");
                }
            }
            GossipMessage::LeaveAck { .. }
            | GossipMessage::JoinAccept { .. }
            | GossipMessage::JoinReject { .. } => {}
        }
    }
}

/// Receive path of outbound gossip connections.
struct GossipClientHandler {
    runtime: Weak<GossipRuntime>,
    peer: SocketAddr,
}

#[async_trait]
impl ClientHandler<GossipMessage> for GossipClientHandler {
    async fn on_message(&self, msg: GossipMessage) {
        let Some(runtime) = self.runtime.upgrade() else {
            return;
        };
        match msg {
            GossipMessage::JoinAccept {
                epoch, entries, ..
            } => runtime.on_join_accept(epoch, entries),
            GossipMessage::JoinReject { reason } => runtime.on_join_reject(reason, self.peer),
            GossipMessage::Update {
                epoch,
                digest,
                rumors,
                ..
            } => {
                if let Some(reply) = runtime.handle_update(epoch, &digest, rumors) {
                    let client = runtime
                        .clients
                        .get(&self.peer)
                        .map(|client| Arc::clone(&client));
                    if let Some(client) = client {
                        let _ = client.send(&reply).await;
                    }
                }
            }
            GossipMessage::LeaveAck { .. } => runtime.on_leave_ack(),
            GossipMessage::LeaveRequest { entry, .. } => {
                runtime.state.lock().merge([entry]);
                runtime.after_state_change();
            }
            GossipMessage::JoinRequest { .. } => {}
        }
    }

    async fn on_disconnect(&self, reason: DisconnectReason) {
        let Some(runtime) = self.runtime.upgrade() else {
            return;
        };
        if matches!(reason, DisconnectReason::LocalClose) {
            return;
        }
        // Identify the peer by address to record the suspicion.
        let peer_id = {
            let state = runtime.state.lock();
            let found = state
                .entries()
                .find(|entry| entry.node.addr == self.peer)
                .map(|entry| entry.node.id);
            found
        };
        if let Some(peer_id) = peer_id {
            runtime.on_peer_failure(peer_id, self.peer);
        } else {
            runtime.clients.remove(&self.peer);
        }
    }
}
