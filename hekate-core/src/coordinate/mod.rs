//! Coordination kernel: single-coordinator broadcast/collect rounds scoped
//! to named processes.
//!
//! Each participating node registers the process name as a node property;
//! the filtered sub-topology defines the members and its oldest member acts
//! as coordinator. Every topology change aborts the current round and
//! starts a fresh one (handlers are idempotent by contract).

/// Built-in leader election on top of the kernel.
pub mod election;
/// Coordination wire protocol.
pub mod protocol;

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

pub use election::LeaderElection;
pub use protocol::{CoordinationCodec, CoordinationMessage};

use crate::cluster::view::ClusterView;
use crate::cluster::{Topology, TopologyHash};
use crate::codec::{CodecFactory, SingletonCodecFactory};
use crate::config::{CoordinationConfig, MessagingChannelConfig};
use crate::messaging::{
    ChannelSetup, Message, MessageOpts, MessageReceiver, MessagingChannel, MessagingError,
    MessagingService, ReceiverError,
};
use crate::node::NodeId;

/// Name of the messaging channel carrying coordination traffic.
pub const COORDINATION_CHANNEL: &str = "hekate.coordination";

const BROADCAST_MEMBER_TIMEOUT: Duration = Duration::from_secs(5);
const BROADCAST_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Node property advertising participation in a coordination process.
#[must_use]
pub fn process_property(process: &str) -> String {
    format!("hekate.coordination.process.{process}")
}

/// Coordination failures.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// No process with that name is configured locally.
    #[error("unknown coordination process: {0}")]
    UnknownProcess(String),
    /// A configured process has no handler attached.
    #[error("no handler attached for coordination process: {0}")]
    MissingHandler(String),
    /// The round was aborted by a topology change.
    #[error("coordination round cancelled")]
    Cancelled,
    /// Messaging failure.
    #[error(transparent)]
    Messaging(#[from] MessagingError),
}

/// Replies collected by one broadcast: exactly one per member, including
/// the coordinator's own.
#[derive(Debug, Clone)]
pub struct BroadcastResult {
    /// Member replies keyed by node id.
    pub replies: BTreeMap<NodeId, Bytes>,
}

/// Application hook driving one coordination process.
#[async_trait]
pub trait CoordinationHandler: Send + Sync {
    /// Called on every member when a round begins.
    async fn prepare(&self, ctx: Arc<CoordinationContext>) {
        let _ = ctx;
    }

    /// Called on the coordinator after `prepare`; drives the round through
    /// [`CoordinationContext::broadcast`] and finishes it with
    /// [`CoordinationContext::complete`].
    async fn coordinate(&self, ctx: Arc<CoordinationContext>);

    /// Handles one broadcast request on a member; the returned bytes
    /// travel back to the coordinator.
    async fn process(&self, request: Bytes, ctx: Arc<CoordinationContext>) -> Bytes;

    /// Called when the round is aborted by a topology change.
    async fn cancel(&self, ctx: Arc<CoordinationContext>) {
        let _ = ctx;
    }
}

/// Per-round context shared by handler callbacks.
pub struct CoordinationContext {
    process: String,
    round: TopologyHash,
    topology: Topology,
    members: Vec<NodeId>,
    coordinator: NodeId,
    local: NodeId,
    channel: MessagingChannel<CoordinationMessage>,
    attachment: Mutex<Option<Box<dyn Any + Send + Sync>>>,
    done: AtomicBool,
    cancelled: AtomicBool,
    completed_tx: watch::Sender<bool>,
}

impl CoordinationContext {
    /// Process name.
    #[must_use]
    pub fn process(&self) -> &str {
        &self.process
    }

    /// Sub-topology this round is scoped to.
    #[must_use]
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Member node ids, including the coordinator and the local node.
    #[must_use]
    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    /// Number of members.
    #[must_use]
    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// This round's coordinator.
    #[must_use]
    pub const fn coordinator(&self) -> NodeId {
        self.coordinator
    }

    /// The local member.
    #[must_use]
    pub const fn local(&self) -> NodeId {
        self.local
    }

    /// Whether the local node coordinates this round.
    #[must_use]
    pub fn is_coordinator(&self) -> bool {
        self.coordinator == self.local
    }

    /// Whether the round finished (completed or cancelled).
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Whether the round was aborted.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Stores a user attachment for later callbacks of the same round.
    pub fn set_attachment<T: Any + Send + Sync>(&self, value: T) {
        *self.attachment.lock() = Some(Box::new(value));
    }

    /// Reads the attachment back, if it has the expected type.
    #[must_use]
    pub fn attachment<T: Any + Send + Sync + Clone>(&self) -> Option<T> {
        self.attachment
            .lock()
            .as_ref()
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
    }

    /// Sends `request` to every member (the coordinator included) and
    /// resolves once all replies arrived. Members that have not caught up
    /// with this round yet are retried until the round is cancelled.
    pub async fn broadcast(&self, request: Bytes) -> Result<BroadcastResult, CoordinationError> {
        let mut replies: BTreeMap<NodeId, Bytes> = BTreeMap::new();
        loop {
            if self.is_cancelled() {
                return Err(CoordinationError::Cancelled);
            }
            let missing: Vec<NodeId> = self
                .members
                .iter()
                .copied()
                .filter(|member| !replies.contains_key(member))
                .collect();
            if missing.is_empty() {
                return Ok(BroadcastResult { replies });
            }

            for member in missing {
                let message = CoordinationMessage::Request {
                    process: self.process.clone(),
                    round: self.round,
                    payload: request.clone(),
                };
                let opts = MessageOpts::to(member).with_timeout(BROADCAST_MEMBER_TIMEOUT);
                match self.channel.request_with(&message, opts).await {
                    Ok(CoordinationMessage::Response { payload }) => {
                        replies.insert(member, payload);
                    }
                    Ok(CoordinationMessage::Reject) => {
                        debug!(process = %self.process, member = %member, "member not in round yet");
                    }
                    Ok(other) => {
                        warn!(process = %self.process, ?other, "unexpected broadcast reply");
                    }
                    Err(err) => {
                        debug!(process = %self.process, member = %member, "broadcast send failed: {err}");
                    }
                }
            }
            tokio::time::sleep(BROADCAST_RETRY_DELAY).await;
        }
    }

    /// Completes the round: members are notified and per-process futures
    /// resolve.
    pub async fn complete(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.completed_tx.send(true);
        for member in &self.members {
            if *member == self.local {
                continue;
            }
            let message = CoordinationMessage::Complete {
                process: self.process.clone(),
                round: self.round,
            };
            let opts = MessageOpts::to(*member).with_timeout(BROADCAST_MEMBER_TIMEOUT);
            if let Err(err) = self.channel.send_with(&message, opts).await {
                debug!(process = %self.process, member = %member, "complete signal failed: {err}");
            }
        }
    }

    /// Aborts the round; in-flight broadcasts fail with `Cancelled`.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.done.store(true, Ordering::Release);
    }
}

enum ProcessEvent {
    Topology(Topology),
    Request {
        round: TopologyHash,
        payload: Bytes,
        message: Message<CoordinationMessage>,
    },
    Complete {
        round: TopologyHash,
    },
}

struct ProcessRuntime {
    name: String,
    events_tx: mpsc::UnboundedSender<ProcessEvent>,
    completed_tx: watch::Sender<bool>,
}

impl ProcessRuntime {
    fn spawn(
        name: String,
        local_id: NodeId,
        handler: Arc<dyn CoordinationHandler>,
        channel: MessagingChannel<CoordinationMessage>,
        view: &ClusterView,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (completed_tx, _) = watch::channel(false);
        let runtime = Arc::new(Self {
            name: name.clone(),
            events_tx,
            completed_tx: completed_tx.clone(),
        });

        // Per-process single-threaded executor: prepare/process/cancel run
        // in event order. The worker owns its pieces directly so it exits
        // (and the runtime frees) once every event sender is gone.
        tokio::spawn(process_worker(
            name,
            local_id,
            handler,
            channel,
            completed_tx,
            events_rx,
        ));

        let tx = runtime.events_tx.clone();
        view.listen(Box::new(move |event| {
            // A leave idles the process; rounds only run while the local
            // node is a member.
            let topology = if event.is_leave() {
                Topology::empty()
            } else {
                event.topology().clone()
            };
            let _ = tx.send(ProcessEvent::Topology(topology));
        }));
        runtime
    }
}

async fn process_worker(
    name: String,
    local_id: NodeId,
    handler: Arc<dyn CoordinationHandler>,
    channel: MessagingChannel<CoordinationMessage>,
    completed_tx: watch::Sender<bool>,
    mut rx: mpsc::UnboundedReceiver<ProcessEvent>,
) {
    let mut current: Option<Arc<CoordinationContext>> = None;

    while let Some(event) = rx.recv().await {
        match event {
            ProcessEvent::Topology(topology) => {
                if let Some(old) = current.take() {
                    if !old.is_done() {
                        old.cancel();
                        handler.cancel(Arc::clone(&old)).await;
                    }
                }
                if topology.is_empty() || !topology.contains(local_id) {
                    continue;
                }
                let Some(coordinator) = topology.oldest().map(|node| node.id) else {
                    continue;
                };
                let members: Vec<NodeId> = topology.nodes().map(|node| node.id).collect();
                let _ = completed_tx.send(false);
                let ctx = Arc::new(CoordinationContext {
                    process: name.clone(),
                    round: topology.hash(),
                    topology,
                    members,
                    coordinator,
                    local: local_id,
                    channel: channel.clone(),
                    attachment: Mutex::new(None),
                    done: AtomicBool::new(false),
                    cancelled: AtomicBool::new(false),
                    completed_tx: completed_tx.clone(),
                });
                current = Some(Arc::clone(&ctx));
                debug!(process = %name, coordinator = %coordinator, "coordination round started");

                handler.prepare(Arc::clone(&ctx)).await;
                if ctx.is_coordinator() {
                    // Coordinate runs off-worker so the coordinator can
                    // process its own broadcast requests.
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        handler.coordinate(ctx).await;
                    });
                }
            }
            ProcessEvent::Request {
                round,
                payload,
                message,
            } => {
                let in_round = current
                    .as_ref()
                    .filter(|ctx| ctx.round == round && !ctx.is_cancelled());
                match in_round {
                    Some(ctx) => {
                        let reply = handler.process(payload, Arc::clone(ctx)).await;
                        let _ = message
                            .reply(CoordinationMessage::Response { payload: reply })
                            .await;
                    }
                    None => {
                        let _ = message.reply(CoordinationMessage::Reject).await;
                    }
                }
            }
            ProcessEvent::Complete { round } => {
                if let Some(ctx) = current.as_ref().filter(|ctx| ctx.round == round) {
                    ctx.done.store(true, Ordering::Release);
                    let _ = completed_tx.send(true);
                }
            }
        }
    }
}

/// Public handle for one coordination process.
#[derive(Clone)]
pub struct CoordinationProcess {
    runtime: Arc<ProcessRuntime>,
}

impl CoordinationProcess {
    /// Process name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.runtime.name
    }

    /// Resolves once the current round completes (fires immediately if it
    /// already has).
    pub async fn completion(&self) {
        let mut rx = self.runtime.completed_tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Registry of the node's coordination processes.
pub struct CoordinationService {
    processes: HashMap<String, CoordinationProcess>,
}

impl CoordinationService {
    /// Builds the service: one shared channel plus a runtime per
    /// configured process.
    pub fn new(
        config: &CoordinationConfig,
        mut handlers: HashMap<String, Arc<dyn CoordinationHandler>>,
        local_id: NodeId,
        messaging: &MessagingService,
        view: &ClusterView,
    ) -> Result<Self, CoordinationError> {
        let routing: Arc<DashMap<String, mpsc::UnboundedSender<ProcessEvent>>> =
            Arc::new(DashMap::new());
        let codec: Arc<dyn CodecFactory<CoordinationMessage>> =
            Arc::new(SingletonCodecFactory::new(CoordinationCodec));

        let mut channel_config = MessagingChannelConfig::named(COORDINATION_CHANNEL);
        channel_config.worker_threads = 2;
        channel_config.request_timeout = BROADCAST_MEMBER_TIMEOUT;

        let channel = messaging.register_channel(
            ChannelSetup::new(channel_config, codec).with_receiver(Arc::new(
                CoordinationReceiver {
                    routing: Arc::clone(&routing),
                },
            )),
        )?;

        let mut processes = HashMap::new();
        for process_config in &config.processes {
            let name = process_config.name.clone();
            let handler = handlers
                .remove(&name)
                .ok_or_else(|| CoordinationError::MissingHandler(name.clone()))?;

            let property = process_property(&name);
            let process_view = view.filter(move |node| node.property(&property).is_some());
            let runtime = ProcessRuntime::spawn(
                name.clone(),
                local_id,
                handler,
                channel.clone(),
                &process_view,
            );
            routing.insert(name.clone(), runtime.events_tx.clone());
            processes.insert(name, CoordinationProcess { runtime });
        }

        Ok(Self { processes })
    }

    /// Looks up a configured process.
    pub fn process(&self, name: &str) -> Result<CoordinationProcess, CoordinationError> {
        self.processes
            .get(name)
            .cloned()
            .ok_or_else(|| CoordinationError::UnknownProcess(name.to_string()))
    }
}

/// Routes inbound coordination traffic to its process worker.
struct CoordinationReceiver {
    routing: Arc<DashMap<String, mpsc::UnboundedSender<ProcessEvent>>>,
}

#[async_trait]
impl MessageReceiver<CoordinationMessage> for CoordinationReceiver {
    async fn receive(&self, msg: Message<CoordinationMessage>) -> Result<(), ReceiverError> {
        match msg.payload().clone() {
            CoordinationMessage::Request {
                process,
                round,
                payload,
            } => {
                let Some(tx) = self.routing.get(&process) else {
                    return Err(format!("unknown coordination process: {process}").into());
                };
                let _ = tx.send(ProcessEvent::Request {
                    round,
                    payload,
                    message: msg,
                });
            }
            CoordinationMessage::Complete { process, round } => {
                if let Some(tx) = self.routing.get(&process) {
                    let _ = tx.send(ProcessEvent::Complete { round });
                }
            }
            CoordinationMessage::Response { .. } | CoordinationMessage::Reject => {}
        }
        Ok(())
    }
}
