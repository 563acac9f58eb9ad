//! Leader election built on the coordination kernel.
//!
//! The coordinator (oldest member) announces itself to every member through
//! one broadcast round; members adopt the announced leader and acknowledge.
//! A leader failure triggers a topology change, a fresh round, and a new
//! announcement from the surviving oldest member.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;
use tracing::debug;

use crate::coordinate::{CoordinationContext, CoordinationHandler};
use crate::node::NodeId;

/// Observable election outcome.
#[derive(Clone)]
pub struct LeaderElection {
    leader_rx: watch::Receiver<Option<NodeId>>,
}

impl LeaderElection {
    /// Creates the observer handle and the handler to register under the
    /// election's coordination process.
    #[must_use]
    pub fn new() -> (Self, Arc<dyn CoordinationHandler>) {
        let (leader_tx, leader_rx) = watch::channel(None);
        let handler = Arc::new(ElectionHandler { leader_tx });
        (Self { leader_rx }, handler)
    }

    /// Currently known leader, if any round completed yet.
    #[must_use]
    pub fn current(&self) -> Option<NodeId> {
        *self.leader_rx.borrow()
    }

    /// Waits for a leader to be announced.
    pub async fn leader(&self) -> Option<NodeId> {
        let mut rx = self.leader_rx.clone();
        loop {
            if let Some(leader) = *rx.borrow_and_update() {
                return Some(leader);
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }
}

struct ElectionHandler {
    leader_tx: watch::Sender<Option<NodeId>>,
}

#[async_trait]
impl CoordinationHandler for ElectionHandler {
    async fn coordinate(&self, ctx: Arc<CoordinationContext>) {
        let announcement = Bytes::copy_from_slice(&ctx.coordinator().as_u128().to_be_bytes());
        match ctx.broadcast(announcement).await {
            Ok(result) => {
                debug!(
                    process = %ctx.process(),
                    acks = result.replies.len(),
                    "leader announcement acknowledged"
                );
                ctx.complete().await;
            }
            Err(err) => debug!(process = %ctx.process(), "election round aborted: {err}"),
        }
    }

    async fn process(&self, request: Bytes, _ctx: Arc<CoordinationContext>) -> Bytes {
        if request.len() == 16 {
            let mut raw = [0u8; 16];
            raw.copy_from_slice(&request);
            let leader = NodeId::from_u128(u128::from_be_bytes(raw));
            let _ = self.leader_tx.send(Some(leader));
        }
        Bytes::from_static(b"ack")
    }

    async fn cancel(&self, ctx: Arc<CoordinationContext>) {
        debug!(process = %ctx.process(), "election round cancelled");
    }
}
