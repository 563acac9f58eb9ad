//! Messaging: named channels with load-balanced routing, affinity,
//! request correlation, streaming replies, backpressure and failover.

pub mod backpressure;
/// Messaging channel implementation.
pub mod channel;
/// Failover policy contracts.
pub mod failover;
/// Load balancer contracts and built-ins.
pub mod load_balancer;
/// Inbound message handle and receiver contract.
pub mod message;
/// Wire frames.
pub mod protocol;
mod worker;

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;

pub use channel::{MessageOpts, MessagingChannel, ResponsePart, ResponseStream, affinity_hash};
pub use failover::{
    FailoverCondition, FailoverDecision, FailoverPolicy, FailureInfo, MaxAttemptsPolicy,
    TransientFailoverCondition,
};
pub use load_balancer::{DefaultLoadBalancer, LoadBalancer, LoadBalancerContext};
pub use message::{Message, MessageReceiver, ReceiverError};
pub use protocol::MessagingFrame;

use crate::cluster::view::ClusterView;
use crate::codec::{CodecError, CodecFactory};
use crate::config::MessagingChannelConfig;
use crate::metrics::MetricsRegistry;
use crate::network::{NetworkError, NetworkService};
use crate::node::{Node, NodeId};

/// Messaging failures.
#[derive(Debug, Error)]
pub enum MessagingError {
    /// The load balancer found no suitable receiver.
    #[error("no suitable receivers in the channel topology")]
    NoReceivers,
    /// A pinned destination is not part of the channel topology.
    #[error("destination {0} is not in the channel topology")]
    UnknownDestination(NodeId),
    /// The operation did not complete in time (pending retries are
    /// cancelled).
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// Transport failure.
    #[error(transparent)]
    Network(#[from] NetworkError),
    /// Payload codec failure.
    #[error("payload codec failure: {0}")]
    Codec(#[from] CodecError),
    /// The remote receiver failed; carries its rendered error.
    #[error("remote receiver failed: {stack_trace}")]
    Remote {
        /// String rendering of the remote failure.
        stack_trace: String,
    },
    /// Outbound high watermark reached with the `Fail` overflow policy.
    #[error("channel overloaded")]
    Overloaded,
    /// No channel registered under that name (or wrong payload type).
    #[error("unknown channel: {0}")]
    UnknownChannel(String),
    /// A channel with this name already exists.
    #[error("duplicate channel: {0}")]
    DuplicateChannel(String),
    /// Reply attempted on a notification.
    #[error("message does not expect a reply")]
    ReplyNotExpected,
    /// Partial reply attempted on a plain request.
    #[error("message does not expect partial replies")]
    PartialNotExpected,
    /// Second final reply attempted.
    #[error("request already replied to")]
    AlreadyReplied,
}

/// Everything needed to bring one channel up.
pub struct ChannelSetup<P> {
    /// Channel options.
    pub config: MessagingChannelConfig,
    /// Payload codec factory.
    pub codec: Arc<dyn CodecFactory<P>>,
    /// Inbound receiver; channels without one are send-only.
    pub receiver: Option<Arc<dyn MessageReceiver<P>>>,
    /// Restricts the channel topology to matching nodes.
    pub filter: Option<Arc<dyn Fn(&Node) -> bool + Send + Sync>>,
    /// Routing policy (default balancer when absent).
    pub load_balancer: Option<Arc<dyn LoadBalancer>>,
    /// Retry policy; no retries when absent.
    pub failover: Option<Arc<dyn FailoverPolicy>>,
    /// Gates which errors reach the failover policy.
    pub failover_condition: Option<Arc<dyn FailoverCondition>>,
}

impl<P> Clone for ChannelSetup<P> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            codec: Arc::clone(&self.codec),
            receiver: self.receiver.clone(),
            filter: self.filter.clone(),
            load_balancer: self.load_balancer.clone(),
            failover: self.failover.clone(),
            failover_condition: self.failover_condition.clone(),
        }
    }
}

impl<P> ChannelSetup<P> {
    /// Minimal setup: a named channel with a codec.
    pub fn new(config: MessagingChannelConfig, codec: Arc<dyn CodecFactory<P>>) -> Self {
        Self {
            config,
            codec,
            receiver: None,
            filter: None,
            load_balancer: None,
            failover: None,
            failover_condition: None,
        }
    }

    /// Attaches an inbound receiver.
    #[must_use]
    pub fn with_receiver(mut self, receiver: Arc<dyn MessageReceiver<P>>) -> Self {
        self.receiver = Some(receiver);
        self
    }

    /// Attaches a failover policy.
    #[must_use]
    pub fn with_failover(mut self, policy: Arc<dyn FailoverPolicy>) -> Self {
        self.failover = Some(policy);
        self
    }
}

/// Registry of the node's messaging channels.
pub struct MessagingService {
    network: Arc<NetworkService>,
    view: ClusterView,
    metrics: Arc<MetricsRegistry>,
    channels: Mutex<HashMap<String, Box<dyn Any + Send + Sync>>>,
}

impl MessagingService {
    /// Creates the service over the given transport and topology view.
    #[must_use]
    pub fn new(
        network: Arc<NetworkService>,
        view: ClusterView,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            network,
            view,
            metrics,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Builds and registers one channel.
    pub fn register_channel<P: Send + 'static>(
        &self,
        setup: ChannelSetup<P>,
    ) -> Result<MessagingChannel<P>, MessagingError> {
        let name = setup.config.name.clone();
        {
            let channels = self.channels.lock();
            if channels.contains_key(&name) {
                return Err(MessagingError::DuplicateChannel(name));
            }
        }

        let view = match &setup.filter {
            Some(filter) => {
                let filter = Arc::clone(filter);
                self.view.filter(move |node| filter(node))
            }
            None => self.view.clone(),
        };
        let balancer = setup
            .load_balancer
            .unwrap_or_else(|| Arc::new(DefaultLoadBalancer::new()));
        let condition: Arc<dyn FailoverCondition> = setup
            .failover_condition
            .unwrap_or_else(|| Arc::new(TransientFailoverCondition));

        let channel = MessagingChannel::create(
            setup.config,
            &setup.codec,
            setup.receiver,
            view,
            balancer,
            setup.failover,
            condition,
            Arc::clone(&self.network),
            Arc::clone(&self.metrics),
        )?;

        self.channels
            .lock()
            .insert(name, Box::new(channel.clone()));
        Ok(channel)
    }

    /// Looks up a registered channel by name and payload type.
    pub fn channel<P: Send + 'static>(
        &self,
        name: &str,
    ) -> Result<MessagingChannel<P>, MessagingError> {
        let channels = self.channels.lock();
        channels
            .get(name)
            .and_then(|channel| channel.downcast_ref::<MessagingChannel<P>>())
            .cloned()
            .ok_or_else(|| MessagingError::UnknownChannel(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};
    use std::net::SocketAddr;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use crate::cluster::event::ClusterEvent;
    use crate::cluster::topology::Topology;
    use crate::codec::{Codec, DataReader, DataWriter, SingletonCodecFactory};
    use crate::config::NetworkConfig;

    struct StringCodec;

    impl Codec<String> for StringCodec {
        fn encode(&self, msg: &String, out: &mut DataWriter) -> Result<(), CodecError> {
            out.write_str(msg);
            Ok(())
        }

        fn decode(&self, input: &mut DataReader) -> Result<String, CodecError> {
            input.read_string()
        }
    }

    fn string_codec() -> Arc<dyn CodecFactory<String>> {
        Arc::new(SingletonCodecFactory::new(StringCodec))
    }

    fn network() -> Arc<NetworkService> {
        let service = NetworkService::new(
            NetworkConfig {
                port: 0,
                connect_timeout: Duration::from_secs(1),
                ..NetworkConfig::default()
            },
            Arc::new(MetricsRegistry::new()),
        );
        service.start().unwrap();
        service
    }

    fn member(id: u128, addr: SocketAddr) -> Node {
        let mut node = Node::new(addr, Some(format!("n{id}")), BTreeSet::new(), BTreeMap::new());
        node.id = NodeId::from_u128(id);
        node.join_order = id as u64;
        node
    }

    fn view_of(nodes: Vec<Node>) -> ClusterView {
        let view = ClusterView::new();
        view.publish(ClusterEvent::Join(Topology::new(
            1,
            nodes.into_iter().collect(),
        )));
        view
    }

    struct EchoReceiver;

    #[async_trait]
    impl MessageReceiver<String> for EchoReceiver {
        async fn receive(&self, msg: Message<String>) -> Result<(), ReceiverError> {
            if msg.is_request() {
                let reply = format!("echo:{}", msg.payload());
                msg.reply(reply).await?;
            }
            Ok(())
        }
    }

    struct FailingReceiver;

    #[async_trait]
    impl MessageReceiver<String> for FailingReceiver {
        async fn receive(&self, _msg: Message<String>) -> Result<(), ReceiverError> {
            Err("synthetic receiver failure".into())
        }
    }

    struct StreamingReceiver;

    #[async_trait]
    impl MessageReceiver<String> for StreamingReceiver {
        async fn receive(&self, msg: Message<String>) -> Result<(), ReceiverError> {
            if msg.is_stream_request() {
                msg.reply_partial("part-1".to_string()).await?;
                msg.reply_partial("part-2".to_string()).await?;
            }
            msg.reply("done".to_string()).await?;
            Ok(())
        }
    }

    fn channel_config(name: &str) -> MessagingChannelConfig {
        let mut config = MessagingChannelConfig::named(name);
        config.request_timeout = Duration::from_secs(3);
        config
    }

    struct TestPeer {
        service: MessagingService,
        addr: SocketAddr,
    }

    fn peer(view: &ClusterView) -> TestPeer {
        let network = network();
        let addr = network.local_addr().unwrap();
        let service =
            MessagingService::new(network, view.clone(), Arc::new(MetricsRegistry::new()));
        TestPeer { service, addr }
    }

    /// Builds a two-node rig: `a` routes to `b`'s receiver.
    fn rig(receiver: Arc<dyn MessageReceiver<String>>) -> (MessagingChannel<String>, TestPeer) {
        // Receiver-side network must exist first so its address is known.
        let network_b = network();
        let addr_b = network_b.local_addr().unwrap();
        let view = view_of(vec![member(2, addr_b)]);

        let b = TestPeer {
            service: MessagingService::new(
                network_b,
                view.clone(),
                Arc::new(MetricsRegistry::new()),
            ),
            addr: addr_b,
        };
        b.service
            .register_channel(
                ChannelSetup::new(channel_config("test"), string_codec())
                    .with_receiver(receiver),
            )
            .unwrap();

        let a = peer(&view);
        let channel = a
            .service
            .register_channel(ChannelSetup::new(channel_config("test"), string_codec()))
            .unwrap();
        (channel, b)
    }

    #[tokio::test]
    async fn request_gets_final_reply() {
        let (channel, _b) = rig(Arc::new(EchoReceiver));
        let reply = channel.request(&"hello".to_string()).await.unwrap();
        assert_eq!(reply, "echo:hello");
    }

    #[tokio::test]
    async fn receiver_error_becomes_remote_failure() {
        let (channel, _b) = rig(Arc::new(FailingReceiver));
        let err = channel.request(&"boom".to_string()).await.unwrap_err();
        match err {
            MessagingError::Remote { stack_trace } => {
                assert!(stack_trace.contains("synthetic receiver failure"));
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_request_yields_chunks_then_final() {
        let (channel, _b) = rig(Arc::new(StreamingReceiver));
        let stream = channel
            .stream_request(&"go".to_string(), MessageOpts::default())
            .await
            .unwrap();
        let (chunks, last) = stream.collect().await.unwrap();
        assert_eq!(chunks, vec!["part-1".to_string(), "part-2".to_string()]);
        assert_eq!(last, "done");
    }

    #[tokio::test]
    async fn no_receivers_when_topology_empty() {
        let view = view_of(vec![]);
        let a = peer(&view);
        let channel = a
            .service
            .register_channel(ChannelSetup::new(channel_config("empty"), string_codec()))
            .unwrap();
        assert!(matches!(
            channel.request(&"x".to_string()).await,
            Err(MessagingError::NoReceivers)
        ));
    }

    #[tokio::test]
    async fn duplicate_channel_rejected() {
        let view = view_of(vec![]);
        let a = peer(&view);
        a.service
            .register_channel(ChannelSetup::new(channel_config("dup"), string_codec()))
            .unwrap();
        assert!(matches!(
            a.service
                .register_channel(ChannelSetup::new(channel_config("dup"), string_codec())),
            Err(MessagingError::DuplicateChannel(_))
        ));
    }

    #[tokio::test]
    async fn channel_lookup_by_name_and_type() {
        let view = view_of(vec![]);
        let a = peer(&view);
        a.service
            .register_channel(ChannelSetup::new(channel_config("lookup"), string_codec()))
            .unwrap();
        assert!(a.service.channel::<String>("lookup").is_ok());
        assert!(matches!(
            a.service.channel::<String>("missing"),
            Err(MessagingError::UnknownChannel(_))
        ));
    }

    #[tokio::test]
    async fn notifications_are_received_in_affinity_order() {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        struct Collector {
            seen: Mutex<Vec<u32>>,
            expect: usize,
            done: mpsc::UnboundedSender<Vec<u32>>,
        }

        #[async_trait]
        impl MessageReceiver<String> for Collector {
            async fn receive(&self, msg: Message<String>) -> Result<(), ReceiverError> {
                let value: u32 = msg.payload().parse()?;
                let mut seen = self.seen.lock();
                seen.push(value);
                if seen.len() == self.expect {
                    let _ = self.done.send(seen.clone());
                }
                Ok(())
            }
        }

        let total = 100;
        let (channel, _b) = rig(Arc::new(Collector {
            seen: Mutex::new(Vec::new()),
            expect: total,
            done: done_tx,
        }));

        let opts = MessageOpts::affinity_key(&42u64);
        for i in 0..total {
            channel.send_with(&i.to_string(), opts).await.unwrap();
        }

        let seen = tokio::time::timeout(Duration::from_secs(5), done_rx.recv())
            .await
            .expect("receiver should observe all messages")
            .unwrap();
        let expected: Vec<u32> = (0..total as u32).collect();
        assert_eq!(seen, expected);
    }
}
