//! Observable, filterable views over the cluster topology.
//!
//! Listener dispatch runs on one dedicated task per view: events arrive
//! strictly ordered by topology version and every listener sees them
//! serially. A listener registered after the node is up receives a
//! synthetic `Join` carrying the current topology first.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use crate::cluster::ClusterError;
use crate::cluster::event::ClusterEvent;
use crate::cluster::topology::Topology;
use crate::node::Node;

/// Listener callback invoked on the view's dispatch task.
pub type ClusterEventFn = Box<dyn Fn(&ClusterEvent) + Send + Sync>;

type TopologyPredicate = Box<dyn Fn(&Topology) -> bool + Send + Sync>;

enum ViewCommand {
    Publish(ClusterEvent),
    Listen(ClusterEventFn),
    FutureOf(TopologyPredicate, oneshot::Sender<Topology>),
}

struct ViewShared {
    topology: RwLock<Topology>,
    tx: mpsc::UnboundedSender<ViewCommand>,
}

/// Handle to an observable topology stream.
#[derive(Clone)]
pub struct ClusterView {
    shared: Arc<ViewShared>,
}

impl ClusterView {
    /// Creates a view and spawns its dispatch task.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ViewShared {
            topology: RwLock::new(Topology::empty()),
            tx,
        });
        tokio::spawn(dispatch_loop(rx, Arc::clone(&shared)));
        Self { shared }
    }

    /// Latest topology observed by this view (empty before join).
    #[must_use]
    pub fn topology(&self) -> Topology {
        self.shared.topology.read().clone()
    }

    /// Registers a listener. If the view already has a topology the
    /// listener first receives a synthetic `Join` event.
    pub fn listen(&self, listener: ClusterEventFn) {
        let _ = self.shared.tx.send(ViewCommand::Listen(listener));
    }

    /// Completes when an observed topology satisfies `predicate`;
    /// cancelled (with [`ClusterError::FutureCancelled`]) on leave.
    pub async fn future_of(
        &self,
        predicate: impl Fn(&Topology) -> bool + Send + Sync + 'static,
    ) -> Result<Topology, ClusterError> {
        let (tx, rx) = oneshot::channel();
        if self
            .shared
            .tx
            .send(ViewCommand::FutureOf(Box::new(predicate), tx))
            .is_err()
        {
            return Err(ClusterError::FutureCancelled);
        }
        rx.await.map_err(|_| ClusterError::FutureCancelled)
    }

    /// Derived view whose topology and events only contain matching nodes.
    ///
    /// Events fire only when the filtered member set changes, so the
    /// filtered version sequence can skip versions of the parent view.
    #[must_use]
    pub fn filter(&self, predicate: impl Fn(&Node) -> bool + Send + Sync + 'static) -> Self {
        let child = Self::new();
        let forward = child.clone();
        let last: Mutex<Option<BTreeSet<Node>>> = Mutex::new(None);
        self.listen(Box::new(move |event| {
            let filtered = event.topology().filter(&predicate);
            let mut last = last.lock();
            match event {
                ClusterEvent::Leave(_) => {
                    *last = None;
                    forward.publish(ClusterEvent::Leave(filtered));
                }
                ClusterEvent::Join(_) | ClusterEvent::Change { .. } => {
                    let nodes: BTreeSet<Node> = filtered.nodes().cloned().collect();
                    match last.replace(nodes.clone()) {
                        None => forward.publish(ClusterEvent::Join(filtered)),
                        Some(previous) if previous != nodes => {
                            let added = nodes.difference(&previous).cloned().collect();
                            let removed = previous.difference(&nodes).cloned().collect();
                            forward.publish(ClusterEvent::Change {
                                topology: filtered,
                                added,
                                removed,
                            });
                        }
                        Some(_) => {}
                    }
                }
            }
        }));
        child
    }

    /// Feeds an event into the dispatch pipeline.
    pub(crate) fn publish(&self, event: ClusterEvent) {
        let _ = self.shared.tx.send(ViewCommand::Publish(event));
    }
}

impl Default for ClusterView {
    fn default() -> Self {
        Self::new()
    }
}

async fn dispatch_loop(mut rx: mpsc::UnboundedReceiver<ViewCommand>, shared: Arc<ViewShared>) {
    let mut listeners: Vec<ClusterEventFn> = Vec::new();
    let mut futures: Vec<(TopologyPredicate, oneshot::Sender<Topology>)> = Vec::new();
    let mut joined = false;

    while let Some(command) = rx.recv().await {
        match command {
            ViewCommand::Publish(event) => {
                trace!(?event, "dispatching cluster event");
                *shared.topology.write() = event.topology().clone();
                joined = !event.is_leave();

                for listener in &listeners {
                    listener(&event);
                }

                if event.is_leave() {
                    // Cancel outstanding futures by dropping their senders.
                    futures.clear();
                } else {
                    let topology = event.topology();
                    let mut remaining = Vec::with_capacity(futures.len());
                    for (predicate, tx) in futures.drain(..) {
                        if tx.is_closed() {
                            continue;
                        }
                        if predicate(topology) {
                            let _ = tx.send(topology.clone());
                        } else {
                            remaining.push((predicate, tx));
                        }
                    }
                    futures = remaining;
                }
            }
            ViewCommand::Listen(listener) => {
                if joined {
                    let event = ClusterEvent::Join(shared.topology.read().clone());
                    listener(&event);
                }
                listeners.push(listener);
            }
            ViewCommand::FutureOf(predicate, tx) => {
                let current = shared.topology.read().clone();
                if joined && predicate(&current) {
                    let _ = tx.send(current);
                } else {
                    futures.push((predicate, tx));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet as Set};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Duration;

    use crate::node::NodeId;

    fn node(id: u128, join_order: u64) -> Node {
        let mut node = Node::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9_000 + id as u16),
            Some(format!("n{id}")),
            Set::new(),
            BTreeMap::new(),
        );
        node.id = NodeId::from_u128(id);
        node.join_order = join_order;
        node
    }

    fn topology(version: u64, ids: &[u128]) -> Topology {
        Topology::new(
            version,
            ids.iter().map(|id| node(*id, *id as u64)).collect(),
        )
    }

    #[tokio::test]
    async fn events_arrive_in_version_order() {
        let view = ClusterView::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        view.listen(Box::new(move |event| {
            let _ = tx.send(event.topology().version());
        }));

        view.publish(ClusterEvent::Join(topology(1, &[1])));
        view.publish(ClusterEvent::Change {
            topology: topology(2, &[1, 2]),
            added: vec![node(2, 2)],
            removed: vec![],
        });
        view.publish(ClusterEvent::Leave(topology(3, &[1])));

        assert_eq!(rx.recv().await.unwrap(), 1);
        assert_eq!(rx.recv().await.unwrap(), 2);
        assert_eq!(rx.recv().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn late_listener_gets_synthetic_join() {
        let view = ClusterView::new();
        view.publish(ClusterEvent::Join(topology(5, &[1, 2])));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        view.listen(Box::new(move |event| {
            let is_join = matches!(event, ClusterEvent::Join(_));
            let _ = tx.send((is_join, event.topology().version()));
        }));

        assert_eq!(rx.recv().await.unwrap(), (true, 5));
    }

    #[tokio::test]
    async fn future_of_completes_on_match() {
        let view = ClusterView::new();
        let waiter = {
            let view = view.clone();
            tokio::spawn(async move { view.future_of(|t| t.size() >= 2).await })
        };
        view.publish(ClusterEvent::Join(topology(1, &[1])));
        view.publish(ClusterEvent::Change {
            topology: topology(2, &[1, 2]),
            added: vec![node(2, 2)],
            removed: vec![],
        });

        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result.version(), 2);
    }

    #[tokio::test]
    async fn future_of_cancelled_on_leave() {
        let view = ClusterView::new();
        view.publish(ClusterEvent::Join(topology(1, &[1])));
        let waiter = {
            let view = view.clone();
            tokio::spawn(async move { view.future_of(|t| t.size() >= 10).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        view.publish(ClusterEvent::Leave(topology(2, &[])));

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(ClusterError::FutureCancelled)));
    }

    #[tokio::test]
    async fn filtered_view_skips_unrelated_changes() {
        let view = ClusterView::new();
        let filtered = view.filter(|node| node.join_order == 1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        filtered.listen(Box::new(move |event| {
            let _ = tx.send((format!("{event:?}"), event.topology().size()));
        }));

        view.publish(ClusterEvent::Join(topology(1, &[1])));
        // Node 2 does not match the filter: no event on the filtered view.
        view.publish(ClusterEvent::Change {
            topology: topology(2, &[1, 2]),
            added: vec![node(2, 2)],
            removed: vec![],
        });
        view.publish(ClusterEvent::Leave(topology(3, &[])));

        let (first, size) = rx.recv().await.unwrap();
        assert!(first.starts_with("Join"), "got {first}");
        assert_eq!(size, 1);
        let (second, _) = rx.recv().await.unwrap();
        assert!(second.starts_with("Leave"), "got {second}");
    }
}
