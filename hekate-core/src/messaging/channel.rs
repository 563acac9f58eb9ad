//! Messaging channel: routed, pooled, correlated request/response.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::cluster::view::ClusterView;
use crate::codec::{Codec, CodecFactory, SingletonCodecFactory, decode_from_bytes, encode_to_bytes};
use crate::config::MessagingChannelConfig;
use crate::messaging::MessagingError;
use crate::messaging::backpressure::{ReceivePressureGuard, SendPressureGuard};
use crate::messaging::failover::{
    FailoverCondition, FailoverDecision, FailoverPolicy, FailureInfo,
};
use crate::messaging::load_balancer::{LoadBalancer, LoadBalancerContext};
use crate::messaging::message::{Message, MessageReceiver, ReplyHandle};
use crate::messaging::protocol::{MessagingFrame, MessagingFrameCodec};
use crate::messaging::worker::WorkerPool;
use crate::metrics::{self, MetricsRegistry};
use crate::network::{
    ClientHandler, DisconnectReason, NetworkClient, NetworkConnectorConfig, NetworkService,
    ServerConnection, ServerHandler,
};
use crate::node::{Node, NodeId};

const CORRELATION_MASK: u32 = 0x7fff_ffff;

/// Per-message options: destination pinning, affinity, timeout override.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageOpts {
    /// Affinity hash; stable routing and per-key ordering.
    pub affinity: Option<u32>,
    /// Pin the destination, bypassing the load balancer.
    pub to: Option<NodeId>,
    /// Overall timeout override (channel default otherwise).
    pub timeout: Option<Duration>,
}

impl MessageOpts {
    /// Options pinning the destination node.
    #[must_use]
    pub fn to(node: NodeId) -> Self {
        Self {
            to: Some(node),
            ..Self::default()
        }
    }

    /// Options carrying an affinity key.
    #[must_use]
    pub fn affinity_key<K: Hash>(key: &K) -> Self {
        Self {
            affinity: Some(affinity_hash(key)),
            ..Self::default()
        }
    }

    /// Adds an affinity key.
    #[must_use]
    pub fn with_affinity_key<K: Hash>(mut self, key: &K) -> Self {
        self.affinity = Some(affinity_hash(key));
        self
    }

    /// Adds a timeout override.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// 32-bit affinity hash of an application key.
#[must_use]
pub fn affinity_hash<K: Hash>(key: &K) -> u32 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish() as u32
}

/// Part of a streaming response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponsePart<P> {
    /// Intermediate chunk; more parts follow.
    Chunk(P),
    /// Final reply; the stream ends after this.
    Final(P),
}

/// Consumer side of a streaming request.
pub struct ResponseStream<P> {
    rx: mpsc::UnboundedReceiver<Result<ResponsePart<P>, MessagingError>>,
    done: bool,
}

impl<P> ResponseStream<P> {
    /// Next part; `None` once the final reply (or an error) was yielded.
    pub async fn recv(&mut self) -> Option<Result<ResponsePart<P>, MessagingError>> {
        if self.done {
            return None;
        }
        let part = self.rx.recv().await;
        match &part {
            Some(Ok(ResponsePart::Final(_))) | Some(Err(_)) | None => self.done = true,
            Some(Ok(ResponsePart::Chunk(_))) => {}
        }
        part
    }

    /// Drains the stream into its chunks and final reply.
    pub async fn collect(mut self) -> Result<(Vec<P>, P), MessagingError> {
        let mut chunks = Vec::new();
        while let Some(part) = self.recv().await {
            match part? {
                ResponsePart::Chunk(chunk) => chunks.push(chunk),
                ResponsePart::Final(last) => return Ok((chunks, last)),
            }
        }
        Err(MessagingError::Network(
            crate::network::NetworkError::ClosedChannel,
        ))
    }
}

enum Pending<P> {
    Single(oneshot::Sender<Result<P, MessagingError>>),
    Stream(mpsc::UnboundedSender<Result<ResponsePart<P>, MessagingError>>),
}

struct PooledConnection<P> {
    client: NetworkClient<MessagingFrame>,
    correlations: Arc<DashMap<u32, Pending<P>>>,
    counter: AtomicU32,
}

impl<P> PooledConnection<P> {
    fn next_correlation(&self) -> u32 {
        self.counter.fetch_add(1, Ordering::Relaxed) & CORRELATION_MASK
    }
}

struct PeerPool<P> {
    addr: SocketAddr,
    slots: Mutex<Vec<Option<Arc<PooledConnection<P>>>>>,
    round_robin: AtomicUsize,
}

/// All channel state shared by clones of [`MessagingChannel`].
pub(crate) struct ChannelInner<P> {
    name: String,
    protocol: String,
    config: MessagingChannelConfig,
    codec: Arc<dyn Codec<P>>,
    frame_codec: Arc<dyn CodecFactory<MessagingFrame>>,
    network: Arc<NetworkService>,
    view: ClusterView,
    balancer: Arc<dyn LoadBalancer>,
    failover: Option<Arc<dyn FailoverPolicy>>,
    failover_condition: Arc<dyn FailoverCondition>,
    pressure: SendPressureGuard,
    pools: DashMap<NodeId, Arc<PeerPool<P>>>,
    metrics: Arc<MetricsRegistry>,
}

/// Named, codec-typed messaging endpoint with routing, backpressure and
/// failover.
pub struct MessagingChannel<P> {
    inner: Arc<ChannelInner<P>>,
}

impl<P> Clone for MessagingChannel<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: Send + 'static> MessagingChannel<P> {
    /// Builds the channel and registers its transport connector.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create(
        config: MessagingChannelConfig,
        codec_factory: &Arc<dyn CodecFactory<P>>,
        receiver: Option<Arc<dyn MessageReceiver<P>>>,
        view: ClusterView,
        balancer: Arc<dyn LoadBalancer>,
        failover: Option<Arc<dyn FailoverPolicy>>,
        failover_condition: Arc<dyn FailoverCondition>,
        network: Arc<NetworkService>,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self, MessagingError> {
        let name = config.name.clone();
        let protocol = format!("hekate.messaging.{name}");
        let codec = codec_factory.create();
        let frame_codec: Arc<dyn CodecFactory<MessagingFrame>> =
            Arc::new(SingletonCodecFactory::new(MessagingFrameCodec));

        let inner = Arc::new(ChannelInner {
            name,
            protocol: protocol.clone(),
            pressure: SendPressureGuard::new(&config.backpressure),
            config,
            codec: Arc::clone(&codec),
            frame_codec: Arc::clone(&frame_codec),
            network: Arc::clone(&network),
            view,
            balancer,
            failover,
            failover_condition,
            pools: DashMap::new(),
            metrics,
        });

        let receive_pressure = Arc::new(ReceivePressureGuard::new(&inner.config.backpressure));
        let workers = receiver.map(|receiver| {
            WorkerPool::spawn(
                &inner.name,
                inner.config.worker_threads,
                receiver,
                Arc::clone(&receive_pressure),
            )
        });

        network.register_connector(
            NetworkConnectorConfig {
                protocol,
                codec: frame_codec,
                heartbeat_disabled: false,
            },
            Arc::new(ChannelServerHandler {
                codec,
                workers,
                receive_pressure,
                channel: inner.name.clone(),
            }),
        )?;

        Ok(Self { inner })
    }

    /// Channel name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The (possibly filtered) topology this channel routes over.
    #[must_use]
    pub fn topology(&self) -> crate::cluster::Topology {
        self.inner.view.topology()
    }

    /// Fire-and-forget notification.
    pub async fn send(&self, payload: &P) -> Result<(), MessagingError> {
        self.send_with(payload, MessageOpts::default()).await
    }

    /// Fire-and-forget notification with options.
    pub async fn send_with(&self, payload: &P, opts: MessageOpts) -> Result<(), MessagingError> {
        let payload = encode_to_bytes(self.inner.codec.as_ref(), payload)?;
        let overall = opts.timeout.unwrap_or(self.inner.config.request_timeout);
        let deadline = tokio::time::Instant::now() + overall;

        self.with_failover(opts, deadline, overall, |conn, _correlation| {
            let payload = payload.clone();
            async move {
                let frame = MessagingFrame::Notification {
                    affinity: opts.affinity,
                    payload,
                };
                conn.client.send(&frame).await?;
                Ok(None)
            }
        })
        .await
        .map(|_| ())
    }

    /// Request expecting a single final reply.
    pub async fn request(&self, payload: &P) -> Result<P, MessagingError> {
        self.request_with(payload, MessageOpts::default()).await
    }

    /// Request with options (pinning, affinity, timeout).
    pub async fn request_with(&self, payload: &P, opts: MessageOpts) -> Result<P, MessagingError> {
        let payload = encode_to_bytes(self.inner.codec.as_ref(), payload)?;
        let overall = opts.timeout.unwrap_or(self.inner.config.request_timeout);
        let deadline = tokio::time::Instant::now() + overall;

        let reply = self
            .with_failover(opts, deadline, overall, |conn, correlation| {
                let payload = payload.clone();
                async move {
                    let (tx, rx) = oneshot::channel();
                    conn.correlations.insert(correlation, Pending::Single(tx));
                    let frame = MessagingFrame::Request {
                        correlation,
                        affinity: opts.affinity,
                        payload,
                    };
                    if let Err(err) = conn.client.send(&frame).await {
                        conn.correlations.remove(&correlation);
                        return Err(err.into());
                    }
                    let remaining =
                        deadline.saturating_duration_since(tokio::time::Instant::now());
                    match timeout(remaining, rx).await {
                        Ok(Ok(result)) => result.map(Some),
                        Ok(Err(_)) => Err(MessagingError::Network(
                            crate::network::NetworkError::ClosedChannel,
                        )),
                        Err(_) => {
                            conn.correlations.remove(&correlation);
                            Err(MessagingError::Timeout(overall))
                        }
                    }
                }
            })
            .await?;
        reply.ok_or(MessagingError::Timeout(overall))
    }

    /// Request expecting zero or more chunks before the final reply.
    ///
    /// Failover applies to the send only; once the remote receiver has
    /// started streaming, a broken connection surfaces as a stream error.
    pub async fn stream_request(
        &self,
        payload: &P,
        opts: MessageOpts,
    ) -> Result<ResponseStream<P>, MessagingError> {
        let payload = encode_to_bytes(self.inner.codec.as_ref(), payload)?;
        let node = self.route(opts, None)?;
        let conn = self.connection(&node, opts.affinity)?;
        let correlation = conn.next_correlation();

        let (tx, rx) = mpsc::unbounded_channel();
        conn.correlations.insert(correlation, Pending::Stream(tx));

        self.inner.pressure.acquire().await?;
        let frame = MessagingFrame::StreamRequest {
            correlation,
            affinity: opts.affinity,
            payload,
        };
        let sent = conn.client.send(&frame).await;
        self.inner.pressure.release();
        self.inner.metrics.increment(metrics::MESSAGING_ENQUEUED);
        if let Err(err) = sent {
            conn.correlations.remove(&correlation);
            return Err(err.into());
        }

        Ok(ResponseStream { rx, done: false })
    }

    /// Shared routing + retry skeleton for single-reply operations.
    async fn with_failover<F, Fut>(
        &self,
        opts: MessageOpts,
        deadline: tokio::time::Instant,
        overall: Duration,
        attempt_fn: F,
    ) -> Result<Option<P>, MessagingError>
    where
        F: Fn(Arc<PooledConnection<P>>, u32) -> Fut,
        Fut: std::future::Future<Output = Result<Option<P>, MessagingError>>,
    {
        let mut attempt = 0usize;
        let mut failure: Option<FailureInfo> = None;
        let mut pinned: Option<Node> = None;

        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(MessagingError::Timeout(overall));
            }
            let node = match pinned.take() {
                Some(node) => node,
                None => self.route(opts, failure.as_ref())?,
            };
            attempt += 1;

            let conn = self.connection(&node, opts.affinity)?;
            let correlation = conn.next_correlation();

            self.inner.pressure.acquire().await?;
            self.inner.metrics.increment(metrics::MESSAGING_ENQUEUED);
            let result = attempt_fn(Arc::clone(&conn), correlation).await;
            self.inner.pressure.release();
            self.inner.metrics.increment(metrics::MESSAGING_DEQUEUED);

            let err = match result {
                Ok(reply) => return Ok(reply),
                Err(err) => err,
            };

            // The overall deadline is never retried past.
            if matches!(err, MessagingError::Timeout(_)) {
                return Err(err);
            }
            let Some(policy) = &self.inner.failover else {
                return Err(err);
            };
            if !self.inner.failover_condition.applies(&err) {
                return Err(err);
            }
            let info = FailureInfo {
                attempt,
                last_node: Some(node.id),
                error: err.to_string(),
            };
            match policy.apply(&info) {
                FailoverDecision::Fail => return Err(err),
                FailoverDecision::RetrySameNode => {
                    debug!(channel = %self.inner.name, node = %node, "retrying on same node");
                    pinned = Some(node);
                    failure = Some(info);
                }
                FailoverDecision::ReRoute => {
                    debug!(channel = %self.inner.name, "re-routing after failure");
                    failure = Some(info);
                }
            }
            self.inner.metrics.increment(metrics::MESSAGING_RETRIES);
        }
    }

    fn route(
        &self,
        opts: MessageOpts,
        failure: Option<&FailureInfo>,
    ) -> Result<Node, MessagingError> {
        let topology = self.inner.view.topology();
        if let Some(to) = opts.to {
            return topology
                .get(to)
                .cloned()
                .ok_or(MessagingError::UnknownDestination(to));
        }
        let ctx = LoadBalancerContext {
            topology: &topology,
            affinity: opts.affinity,
            failure,
        };
        let id = self
            .inner
            .balancer
            .route(&ctx)
            .ok_or(MessagingError::NoReceivers)?;
        topology
            .get(id)
            .cloned()
            .ok_or(MessagingError::UnknownDestination(id))
    }

    /// Pool slot for `(node, affinity)`: stable for a given affinity,
    /// round-robin otherwise. Dead connections are replaced in place.
    fn connection(
        &self,
        node: &Node,
        affinity: Option<u32>,
    ) -> Result<Arc<PooledConnection<P>>, MessagingError> {
        let sockets = self.inner.config.sockets.max(1);
        let pool = self
            .inner
            .pools
            .entry(node.id)
            .or_insert_with(|| {
                Arc::new(PeerPool {
                    addr: node.addr,
                    slots: Mutex::new(vec![None; sockets]),
                    round_robin: AtomicUsize::new(0),
                })
            })
            .clone();

        let slot = match affinity {
            Some(affinity) => affinity as usize % sockets,
            None => pool.round_robin.fetch_add(1, Ordering::Relaxed) % sockets,
        };

        let mut slots = pool.slots.lock();
        if let Some(existing) = &slots[slot] {
            if !existing.client.is_disconnected() {
                return Ok(Arc::clone(existing));
            }
        }

        let correlations: Arc<DashMap<u32, Pending<P>>> = Arc::new(DashMap::new());
        let handler = Arc::new(ChannelClientHandler {
            correlations: Arc::clone(&correlations),
            codec: Arc::clone(&self.inner.codec),
            channel: self.inner.name.clone(),
        });
        let client = self.inner.network.connect(
            pool.addr,
            self.inner.protocol.clone(),
            Bytes::new(),
            &self.inner.frame_codec,
            handler,
        );
        let conn = Arc::new(PooledConnection {
            client,
            correlations,
            counter: AtomicU32::new(1),
        });
        slots[slot] = Some(Arc::clone(&conn));
        Ok(conn)
    }
}

/// Server side of the channel connector: decodes payloads and dispatches
/// to the worker pool.
struct ChannelServerHandler<P> {
    codec: Arc<dyn Codec<P>>,
    workers: Option<WorkerPool<P>>,
    receive_pressure: Arc<ReceivePressureGuard>,
    channel: String,
}

impl<P: Send + 'static> ChannelServerHandler<P> {
    async fn deliver(
        &self,
        request: Option<(u32, bool)>,
        affinity: Option<u32>,
        payload: Bytes,
        from: &ServerConnection<MessagingFrame>,
    ) {
        let Some(workers) = &self.workers else {
            warn!(channel = %self.channel, "message dropped: no receiver configured");
            if let Some((correlation, _)) = request {
                let _ = from
                    .send(&MessagingFrame::ErrorResponse {
                        correlation,
                        stack_trace: format!(
                            "no receiver configured for channel '{}'",
                            self.channel
                        ),
                    })
                    .await;
            }
            return;
        };

        let payload = match decode_from_bytes(self.codec.as_ref(), payload) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(channel = %self.channel, "payload decode failed: {err}; closing connection");
                from.disconnect();
                return;
            }
        };

        let reply = request.map(|(correlation, stream)| {
            Arc::new(ReplyHandle::new(
                correlation,
                stream,
                from.clone(),
                Arc::clone(&self.codec),
            ))
        });

        self.receive_pressure.on_enqueue(from);
        workers.dispatch(affinity, Message::new(payload, reply));
    }
}

#[async_trait]
impl<P: Send + 'static> ServerHandler<MessagingFrame> for ChannelServerHandler<P> {
    async fn on_message(&self, msg: MessagingFrame, from: &ServerConnection<MessagingFrame>) {
        match msg {
            MessagingFrame::Notification { affinity, payload } => {
                self.deliver(None, affinity, payload, from).await;
            }
            MessagingFrame::Request {
                correlation,
                affinity,
                payload,
            } => {
                self.deliver(Some((correlation, false)), affinity, payload, from)
                    .await;
            }
            MessagingFrame::StreamRequest {
                correlation,
                affinity,
                payload,
            } => {
                self.deliver(Some((correlation, true)), affinity, payload, from)
                    .await;
            }
            // Replies never arrive on the server side of a connection.
            MessagingFrame::ResponseChunk { .. }
            | MessagingFrame::FinalResponse { .. }
            | MessagingFrame::ErrorResponse { .. } => {}
        }
    }
}

/// Client side: routes correlated replies back to pending requests.
struct ChannelClientHandler<P> {
    correlations: Arc<DashMap<u32, Pending<P>>>,
    codec: Arc<dyn Codec<P>>,
    channel: String,
}

impl<P> ChannelClientHandler<P> {
    fn decode(&self, payload: Bytes) -> Result<P, MessagingError> {
        decode_from_bytes(self.codec.as_ref(), payload).map_err(MessagingError::from)
    }
}

#[async_trait]
impl<P: Send + 'static> ClientHandler<MessagingFrame> for ChannelClientHandler<P> {
    async fn on_message(&self, msg: MessagingFrame) {
        match msg {
            MessagingFrame::ResponseChunk {
                correlation,
                payload,
            } => {
                // Chunks for unknown or completed requests are dropped.
                if let Some(pending) = self.correlations.get(&correlation) {
                    if let Pending::Stream(tx) = pending.value() {
                        let _ = tx.send(self.decode(payload).map(ResponsePart::Chunk));
                    }
                }
            }
            MessagingFrame::FinalResponse {
                correlation,
                payload,
            } => {
                if let Some((_, pending)) = self.correlations.remove(&correlation) {
                    match pending {
                        Pending::Single(tx) => {
                            let _ = tx.send(self.decode(payload));
                        }
                        Pending::Stream(tx) => {
                            let _ = tx.send(self.decode(payload).map(ResponsePart::Final));
                        }
                    }
                }
            }
            MessagingFrame::ErrorResponse {
                correlation,
                stack_trace,
            } => {
                if let Some((_, pending)) = self.correlations.remove(&correlation) {
                    let err = MessagingError::Remote { stack_trace };
                    match pending {
                        Pending::Single(tx) => {
                            let _ = tx.send(Err(err));
                        }
                        Pending::Stream(tx) => {
                            let _ = tx.send(Err(err));
                        }
                    }
                }
            }
            other => {
                debug!(channel = %self.channel, ?other, "unexpected frame on client side");
            }
        }
    }

    async fn on_disconnect(&self, reason: DisconnectReason) {
        // Every pending request on this connection fails; failover decides
        // what happens next at the request layer.
        let keys: Vec<u32> = self.correlations.iter().map(|entry| *entry.key()).collect();
        for key in keys {
            if let Some((_, pending)) = self.correlations.remove(&key) {
                let err = match &reason {
                    DisconnectReason::ReadTimeout => MessagingError::Network(
                        crate::network::NetworkError::ReadTimeout,
                    ),
                    _ => MessagingError::Network(
                        crate::network::NetworkError::ClosedChannel,
                    ),
                };
                match pending {
                    Pending::Single(tx) => {
                        let _ = tx.send(Err(err));
                    }
                    Pending::Stream(tx) => {
                        let _ = tx.send(Err(err));
                    }
                }
            }
        }
    }
}
