//! Messaging scenarios: affinity ordering across real nodes, failover.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;

use common::{addr_of, test_config};
use hekate_core::codec::{Codec, CodecError, CodecFactory, DataReader, DataWriter, SingletonCodecFactory};
use hekate_core::config::MessagingChannelConfig;
use hekate_core::messaging::{
    ChannelSetup, MaxAttemptsPolicy, Message, MessageOpts, MessageReceiver, ReceiverError,
};

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

fn channel_config() -> MessagingChannelConfig {
    let mut config = MessagingChannelConfig::named("orders");
    config.worker_threads = 4;
    config.request_timeout = Duration::from_secs(5);
    config
}

struct OrderedCollector {
    seen: Mutex<Vec<u32>>,
    expect: usize,
    done: mpsc::UnboundedSender<Vec<u32>>,
}

#[async_trait]
impl MessageReceiver<String> for OrderedCollector {
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

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn affinity_preserves_send_order_across_nodes() {
    const TOTAL: usize = 1_000;
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();

    let receiver = Arc::new(OrderedCollector {
        seen: Mutex::new(Vec::new()),
        expect: TOTAL,
        done: done_tx,
    });

    let mut receiver_bootstrap = test_config("affinity", &[]);
    receiver_bootstrap.messaging.channels = Vec::new();
    let n1 = hekate_core::HekateBootstrap::new(receiver_bootstrap)
        .with_channel(
            ChannelSetup::new(channel_config(), string_codec()).with_receiver(receiver),
        )
        .join()
        .await
        .unwrap();

    let n2 = hekate_core::HekateBootstrap::new(test_config("affinity", &[addr_of(&n1)]))
        .with_channel(ChannelSetup::new(channel_config(), string_codec()))
        .join()
        .await
        .unwrap();

    {
        let view = n2.cluster_view().unwrap();
        timeout(Duration::from_secs(15), view.future_of(|t| t.size() == 2))
            .await
            .expect("convergence")
            .unwrap();
    }

    let n1_id = n1.local_node().unwrap().id;
    let channel = n2.messaging().unwrap().channel::<String>("orders").unwrap();
    let opts = MessageOpts::to(n1_id).with_affinity_key(&42u64);
    for i in 0..TOTAL as u32 {
        channel.send_with(&i.to_string(), opts).await.unwrap();
    }

    let seen = timeout(Duration::from_secs(30), done_rx.recv())
        .await
        .expect("all messages should arrive")
        .unwrap();
    let expected: Vec<u32> = (0..TOTAL as u32).collect();
    assert_eq!(seen, expected, "affinity messages must keep send order");

    n2.leave().await.unwrap();
    n1.leave().await.unwrap();
}

struct EchoReceiver;

#[async_trait]
impl MessageReceiver<String> for EchoReceiver {
    async fn receive(&self, msg: Message<String>) -> Result<(), ReceiverError> {
        if msg.is_request() {
            msg.reply(format!("echo:{}", msg.payload())).await?;
        }
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn request_fails_over_after_receiver_death() {
    let n1 = hekate_core::HekateBootstrap::new(test_config("failover", &[]))
        .with_channel(
            ChannelSetup::new(channel_config(), string_codec()).with_receiver(Arc::new(EchoReceiver)),
        )
        .join()
        .await
        .unwrap();
    let n2 = hekate_core::HekateBootstrap::new(test_config("failover", &[addr_of(&n1)]))
        .with_channel(
            ChannelSetup::new(channel_config(), string_codec()).with_receiver(Arc::new(EchoReceiver)),
        )
        .join()
        .await
        .unwrap();
    let n3 = hekate_core::HekateBootstrap::new(test_config("failover", &[addr_of(&n1)]))
        .with_channel(
            ChannelSetup::new(channel_config(), string_codec())
                .with_receiver(Arc::new(EchoReceiver))
                .with_failover(Arc::new(MaxAttemptsPolicy::new(5))),
        )
        .join()
        .await
        .unwrap();

    {
        let view = n3.cluster_view().unwrap();
        timeout(Duration::from_secs(15), view.future_of(|t| t.size() == 3))
            .await
            .expect("convergence")
            .unwrap();
    }

    // Kill one receiver; requests keep succeeding through retries while
    // the topology still lists the dead node.
    n2.terminate().await;

    let channel = n3.messaging().unwrap().channel::<String>("orders").unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    let mut successes = 0;
    while successes < 20 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "requests should keep succeeding via failover"
        );
        match channel.request(&format!("m{successes}")).await {
            Ok(reply) => {
                assert!(reply.starts_with("echo:"));
                successes += 1;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    }

    n3.leave().await.unwrap();
    n1.leave().await.unwrap();
}
