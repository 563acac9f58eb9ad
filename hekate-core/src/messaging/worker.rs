//! Per-channel async worker pool.
//!
//! An affinity-tagged message always lands on worker `affinity % count`,
//! giving per-key processing order; everything else round-robins.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tracing::warn;

use crate::messaging::backpressure::ReceivePressureGuard;
use crate::messaging::message::{Message, MessageReceiver};

pub(crate) struct WorkerPool<P> {
    queues: Vec<mpsc::UnboundedSender<Message<P>>>,
    next: AtomicUsize,
}

impl<P: Send + 'static> WorkerPool<P> {
    pub(crate) fn spawn(
        channel_name: &str,
        count: usize,
        receiver: Arc<dyn MessageReceiver<P>>,
        pressure: Arc<ReceivePressureGuard>,
    ) -> Self {
        let mut queues = Vec::with_capacity(count.max(1));
        for index in 0..count.max(1) {
            let (tx, rx) = mpsc::unbounded_channel();
            queues.push(tx);
            tokio::spawn(worker_loop(
                format!("{channel_name}#{index}"),
                rx,
                Arc::clone(&receiver),
                Arc::clone(&pressure),
            ));
        }
        Self {
            queues,
            next: AtomicUsize::new(0),
        }
    }

    /// Routes a message to its worker.
    pub(crate) fn dispatch(&self, affinity: Option<u32>, message: Message<P>) {
        let index = match affinity {
            Some(affinity) => affinity as usize % self.queues.len(),
            None => self.next.fetch_add(1, Ordering::Relaxed) % self.queues.len(),
        };
        // A closed queue only happens at shutdown; the message is dropped
        // with the rest of the channel.
        let _ = self.queues[index].send(message);
    }
}

async fn worker_loop<P: Send + 'static>(
    name: String,
    mut rx: mpsc::UnboundedReceiver<Message<P>>,
    receiver: Arc<dyn MessageReceiver<P>>,
    pressure: Arc<ReceivePressureGuard>,
) {
    while let Some(message) = rx.recv().await {
        let reply = message.reply_handle();
        if let Err(err) = receiver.receive(message).await {
            warn!(worker = %name, "receiver failed: {err}");
            if let Some(reply) = reply {
                if !reply.is_replied() {
                    reply.send_error(format!("{err}")).await;
                }
            }
        }
        pressure.on_dequeue();
    }
}
