//! Node instance: bootstrap, lifecycle orchestration, service wiring.
//!
//! A [`HekateNode`] owns one runtime stack per cluster incarnation. A
//! rejoin (after a split-brain verdict) tears the stack down and rebuilds
//! it with a fresh identity, so topology versions and node ids never leak
//! across incarnations.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::cluster::split_brain::SplitBrainAction;
use crate::cluster::view::ClusterView;
use crate::cluster::{
    AddressFamilyValidator, AddressReachabilityDetector, ClusterFault, ClusterNameValidator,
    ClusterService, JoinValidator, SplitBrainDetector, Topology,
};
use crate::config::HekateConfig;
use crate::coordinate::{CoordinationHandler, CoordinationService, process_property};
use crate::error::{HekateError, Result};
use crate::lock::{LockService, region_property};
use crate::messaging::{ChannelSetup, MessagingError, MessagingService};
use crate::metrics::{MetricsRegistry, MetricsSink};
use crate::network::NetworkService;
use crate::node::{Node, NodeState};
use crate::seed::{SeedNodeManager, SeedNodeProvider, StaticSeedNodeProvider};
use crate::service::{DependencyContext, Service, ServiceKernel};
use crate::util::StateGuard;

type ChannelRecipe = Box<dyn Fn(&MessagingService) -> std::result::Result<(), MessagingError> + Send + Sync>;

/// Lifecycle listener invoked after every state change.
pub type LifecycleListener = Box<dyn Fn(NodeState) + Send + Sync>;

/// Entry point: collects configuration and runtime plug-ins, then builds
/// (and optionally joins) a node.
pub struct HekateBootstrap {
    config: HekateConfig,
    seed_provider: Option<Arc<dyn SeedNodeProvider>>,
    validators: Vec<Arc<dyn JoinValidator>>,
    detector: Option<Arc<dyn SplitBrainDetector>>,
    reachability_target: Option<SocketAddr>,
    channel_recipes: Vec<ChannelRecipe>,
    coordination_handlers: HashMap<String, Arc<dyn CoordinationHandler>>,
    metrics_sink: Option<Arc<dyn MetricsSink>>,
}

impl HekateBootstrap {
    /// Starts a bootstrap from configuration.
    #[must_use]
    pub fn new(config: HekateConfig) -> Self {
        Self {
            config,
            seed_provider: None,
            validators: Vec::new(),
            detector: None,
            reachability_target: None,
            channel_recipes: Vec::new(),
            coordination_handlers: HashMap::new(),
            metrics_sink: None,
        }
    }

    /// Replaces the default static seed provider.
    #[must_use]
    pub fn with_seed_provider(mut self, provider: Arc<dyn SeedNodeProvider>) -> Self {
        self.seed_provider = Some(provider);
        self
    }

    /// Appends a user join validator (after the built-in ones).
    #[must_use]
    pub fn with_join_validator(mut self, validator: Arc<dyn JoinValidator>) -> Self {
        self.validators.push(validator);
        self
    }

    /// Installs a split-brain detector.
    #[must_use]
    pub fn with_split_brain_detector(mut self, detector: Arc<dyn SplitBrainDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    /// Installs an [`AddressReachabilityDetector`] probing `target`.
    #[must_use]
    pub fn with_reachability_detector(mut self, target: SocketAddr) -> Self {
        self.reachability_target = Some(target);
        self
    }

    /// Declares a messaging channel; re-registered on every incarnation.
    #[must_use]
    pub fn with_channel<P: Send + 'static>(mut self, setup: ChannelSetup<P>) -> Self {
        self.channel_recipes.push(Box::new(move |messaging| {
            messaging.register_channel(setup.clone()).map(|_| ())
        }));
        self
    }

    /// Attaches the handler for a configured coordination process.
    #[must_use]
    pub fn with_coordination_handler(
        mut self,
        process: impl Into<String>,
        handler: Arc<dyn CoordinationHandler>,
    ) -> Self {
        self.coordination_handlers.insert(process.into(), handler);
        self
    }

    /// Mirrors metric updates into an external sink.
    #[must_use]
    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics_sink = Some(sink);
        self
    }

    /// Validates configuration and builds the (not yet joined) node.
    pub fn build(self) -> Result<Arc<HekateNode>> {
        self.config.validate()?;
        for process in &self.config.coordination.processes {
            if !self.coordination_handlers.contains_key(&process.name) {
                return Err(crate::config::ConfigError::InvalidValue {
                    option: "coordination.processes",
                    reason: format!("process '{}' has no handler attached", process.name),
                }
                .into());
            }
        }

        let metrics = match &self.metrics_sink {
            Some(sink) => Arc::new(MetricsRegistry::with_sink(Arc::clone(sink))),
            None => Arc::new(MetricsRegistry::new()),
        };
        let (state_tx, state_rx) = watch::channel(NodeState::Down);

        let node = Arc::new(HekateNode {
            config: self.config,
            guard: StateGuard::new("hekate-node"),
            metrics,
            state_tx: Arc::new(state_tx),
            state_rx,
            listeners: Mutex::new(Vec::new()),
            runtime: Mutex::new(None),
            seed_provider: self.seed_provider,
            validators: self.validators,
            detector: self.detector,
            reachability_target: self.reachability_target,
            channel_recipes: self.channel_recipes,
            coordination_handlers: self.coordination_handlers,
        });

        // Lifecycle listener dispatch runs on its own task, in state order.
        let weak = Arc::downgrade(&node);
        let mut rx = node.state_rx.clone();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let Some(node) = weak.upgrade() else { return };
                let state = *rx.borrow();
                for listener in node.listeners.lock().iter() {
                    listener(state);
                }
            }
        });

        Ok(node)
    }

    /// Builds the node and joins the cluster.
    pub async fn join(self) -> Result<Arc<HekateNode>> {
        let node = self.build()?;
        node.join().await?;
        Ok(node)
    }
}

/// One runtime stack (a single cluster incarnation).
#[derive(Clone)]
struct NodeRuntime {
    kernel: Arc<ServiceKernel>,
    network: Arc<NetworkService>,
    cluster: Arc<ClusterService>,
    messaging: Arc<MessagingService>,
    locks: Arc<LockService>,
    coordination: Arc<CoordinationService>,
    local: Node,
}

/// A cluster node instance.
pub struct HekateNode {
    config: HekateConfig,
    guard: StateGuard,
    metrics: Arc<MetricsRegistry>,
    state_tx: Arc<watch::Sender<NodeState>>,
    state_rx: watch::Receiver<NodeState>,
    listeners: Mutex<Vec<LifecycleListener>>,
    runtime: Mutex<Option<NodeRuntime>>,
    seed_provider: Option<Arc<dyn SeedNodeProvider>>,
    validators: Vec<Arc<dyn JoinValidator>>,
    detector: Option<Arc<dyn SplitBrainDetector>>,
    reachability_target: Option<SocketAddr>,
    channel_recipes: Vec<ChannelRecipe>,
    coordination_handlers: HashMap<String, Arc<dyn CoordinationHandler>>,
}

impl HekateNode {
    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> NodeState {
        *self.state_rx.borrow()
    }

    /// Waits until the node reaches `state`.
    pub async fn await_state(&self, state: NodeState) {
        let mut rx = self.state_rx.clone();
        loop {
            if *rx.borrow_and_update() == state {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Registers a lifecycle listener.
    pub fn on_state_change(&self, listener: LifecycleListener) {
        self.listeners.lock().push(listener);
    }

    /// Metrics registry of this instance.
    #[must_use]
    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Local node descriptor of the current incarnation (join order
    /// included once the cluster assigned it).
    #[must_use]
    pub fn local_node(&self) -> Option<Node> {
        let runtime = self.runtime.lock();
        let runtime = runtime.as_ref()?;
        Some(
            runtime
                .cluster
                .local_node()
                .unwrap_or_else(|| runtime.local.clone()),
        )
    }

    /// Latest topology snapshot.
    #[must_use]
    pub fn topology(&self) -> Topology {
        self.runtime
            .lock()
            .as_ref()
            .map_or_else(Topology::empty, |runtime| runtime.cluster.topology())
    }

    /// Observable cluster view.
    pub fn cluster_view(&self) -> Result<ClusterView> {
        Ok(self.require_runtime()?.cluster.view().clone())
    }

    /// Transport service (ping, raw connectors).
    pub fn network(&self) -> Result<Arc<NetworkService>> {
        Ok(self.require_runtime()?.network)
    }

    /// Messaging service.
    pub fn messaging(&self) -> Result<Arc<MessagingService>> {
        Ok(self.require_runtime()?.messaging)
    }

    /// Lock service.
    pub fn locks(&self) -> Result<Arc<LockService>> {
        Ok(self.require_runtime()?.locks)
    }

    /// Coordination service.
    pub fn coordination(&self) -> Result<Arc<CoordinationService>> {
        Ok(self.require_runtime()?.coordination)
    }

    fn require_runtime(&self) -> Result<NodeRuntime> {
        let _entered = self.guard.enter()?;
        self.runtime
            .lock()
            .clone()
            .ok_or(HekateError::IllegalState {
                component: "hekate-node",
                state: "DOWN",
            })
    }

    fn set_state(&self, state: NodeState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    /// Brings the service stack up without joining; a following
    /// [`join`](Self::join) runs only the cluster join sequence.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        {
            let mut guard = self.guard.lock_write();
            guard.become_initializing()?;
        }
        self.set_state(NodeState::Initializing);

        match self.initialize_inner().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.terminate().await;
                Err(err)
            }
        }
    }

    async fn initialize_inner(self: &Arc<Self>) -> Result<()> {
        let runtime = self.build_runtime()?;
        runtime.kernel.initialize().await?;
        {
            let mut guard = self.guard.lock_write();
            guard.become_initialized()?;
        }
        self.set_state(NodeState::Initialized);
        *self.runtime.lock() = Some(runtime);
        Ok(())
    }

    /// Joins the cluster; resolves once the local node is `Up`. Runs
    /// [`initialize`](Self::initialize) first when needed.
    pub async fn join(self: &Arc<Self>) -> Result<Topology> {
        if !self.guard.is_initialized() {
            self.initialize().await?;
        }

        let runtime = self.runtime.lock().clone().ok_or(HekateError::IllegalState {
            component: "hekate-node",
            state: "DOWN",
        })?;
        match runtime.cluster.join(runtime.local.clone()).await {
            Ok(topology) => {
                info!(size = topology.size(), version = topology.version(), "joined cluster");
                Ok(topology)
            }
            Err(err) => {
                self.terminate().await;
                Err(err.into())
            }
        }
    }

    /// Graceful departure: announce, wait for acknowledgement, shut down.
    pub async fn leave(&self) -> Result<()> {
        {
            let mut guard = self.guard.lock_write();
            if !guard.become_terminating() {
                return Ok(());
            }
        }
        let runtime = self.runtime.lock().take();
        if let Some(runtime) = runtime {
            if let Err(err) = runtime.cluster.leave().await {
                warn!("graceful leave failed: {err}");
            }
            runtime.kernel.terminate().await;
        }
        {
            let mut guard = self.guard.lock_write();
            guard.become_terminated();
        }
        self.set_state(NodeState::Down);
        Ok(())
    }

    /// Immediate shutdown; peers detect the departure via gossip failure
    /// detection.
    pub async fn terminate(&self) {
        {
            let mut guard = self.guard.lock_write();
            if !guard.become_terminating() {
                return;
            }
        }
        self.set_state(NodeState::Terminating);
        let runtime = self.runtime.lock().take();
        if let Some(runtime) = runtime {
            runtime.kernel.terminate().await;
        }
        {
            let mut guard = self.guard.lock_write();
            guard.become_terminated();
        }
        self.set_state(NodeState::Down);
    }

    /// Builds one incarnation's runtime stack.
    fn build_runtime(self: &Arc<Self>) -> Result<NodeRuntime> {
        let metrics = Arc::clone(&self.metrics);
        let network = NetworkService::new(self.config.network.clone(), Arc::clone(&metrics));
        let addr = network.start()?;

        // Advertise lock regions and coordination processes as node
        // properties; filtered views key off them.
        let mut properties = self.config.node.properties.clone();
        for region in &self.config.locks.regions {
            properties.insert(region_property(&region.name), "true".to_string());
        }
        for process in &self.config.coordination.processes {
            properties.insert(process_property(&process.name), "true".to_string());
        }
        let local = Node::new(
            addr,
            self.config.node.name.clone(),
            self.config.node.roles.clone(),
            properties,
        );

        let provider: Arc<dyn SeedNodeProvider> = match &self.seed_provider {
            Some(provider) => Arc::clone(provider),
            None => {
                let crate::config::SeedConfig::Static { seeds } = &self.config.cluster.seed;
                Arc::new(StaticSeedNodeProvider::new(seeds).map_err(crate::cluster::ClusterError::from)?)
            }
        };
        let seeds = Arc::new(SeedNodeManager::new(
            self.config.cluster.name.clone(),
            provider,
            Arc::clone(&network),
        ));

        let mut validators: Vec<Arc<dyn JoinValidator>> =
            vec![Arc::new(ClusterNameValidator), Arc::new(AddressFamilyValidator)];
        validators.extend(self.validators.iter().cloned());

        let detector = self.detector.clone().or_else(|| {
            self.reachability_target.map(|target| {
                Arc::new(AddressReachabilityDetector::new(target, Arc::clone(&network)))
                    as Arc<dyn SplitBrainDetector>
            })
        });

        let (fault_tx, fault_rx) = mpsc::unbounded_channel();
        let cluster = ClusterService::new(
            self.config.cluster.clone(),
            Arc::clone(&network),
            seeds,
            validators,
            detector,
            Arc::clone(&metrics),
            Arc::clone(&self.state_tx),
            fault_tx,
        )?;
        tokio::spawn(fault_loop(Arc::downgrade(self), fault_rx));

        let messaging = Arc::new(MessagingService::new(
            Arc::clone(&network),
            cluster.view().clone(),
            Arc::clone(&metrics),
        ));
        for recipe in &self.channel_recipes {
            recipe(&messaging)?;
        }

        let locks = Arc::new(LockService::new(
            &self.config.locks,
            local.id,
            &messaging,
            cluster.view(),
            Arc::clone(&metrics),
        )?);
        let coordination = Arc::new(CoordinationService::new(
            &self.config.coordination,
            self.coordination_handlers.clone(),
            local.id,
            &messaging,
            cluster.view(),
        )?);

        let kernel = Arc::new(ServiceKernel::resolve(vec![
            Arc::new(NetworkAdapter {
                network: Arc::clone(&network),
            }),
            Arc::new(ClusterAdapter {
                cluster: Arc::clone(&cluster),
            }),
            Arc::new(MessagingAdapter),
            Arc::new(LockAdapter),
            Arc::new(CoordinationAdapter),
        ])?);

        Ok(NodeRuntime {
            kernel,
            network,
            cluster,
            messaging,
            locks,
            coordination,
            local,
        })
    }
}

async fn fault_loop(node: Weak<HekateNode>, mut fault_rx: mpsc::UnboundedReceiver<ClusterFault>) {
    while let Some(fault) = fault_rx.recv().await {
        let Some(node) = node.upgrade() else { return };
        match fault {
            ClusterFault::SplitBrain(SplitBrainAction::Rejoin) => {
                warn!("split-brain detected; restarting with a fresh identity");
                node.terminate().await;
                if let Err(err) = node.join().await {
                    warn!("rejoin after split-brain failed: {err}");
                }
            }
            ClusterFault::SplitBrain(SplitBrainAction::Terminate) => {
                warn!("split-brain detected; terminating");
                node.terminate().await;
            }
            ClusterFault::DetectorFailure => {
                warn!("split-brain detector failed; terminating");
                node.terminate().await;
            }
        }
    }
}

struct NetworkAdapter {
    network: Arc<NetworkService>,
}

#[async_trait]
impl Service for NetworkAdapter {
    fn name(&self) -> &'static str {
        "network"
    }

    async fn initialize(&self) -> Result<()> {
        self.network.start()?;
        Ok(())
    }

    async fn terminate(&self) {
        self.network.stop().await;
    }
}

struct ClusterAdapter {
    cluster: Arc<ClusterService>,
}

#[async_trait]
impl Service for ClusterAdapter {
    fn name(&self) -> &'static str {
        "cluster"
    }

    fn configure(&self, ctx: &mut DependencyContext) {
        ctx.depends_on("network");
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn terminate(&self) {
        self.cluster.terminate().await;
    }
}

struct MessagingAdapter;

#[async_trait]
impl Service for MessagingAdapter {
    fn name(&self) -> &'static str {
        "messaging"
    }

    fn configure(&self, ctx: &mut DependencyContext) {
        ctx.depends_on("network");
        ctx.depends_on("cluster");
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn terminate(&self) {}
}

struct LockAdapter;

#[async_trait]
impl Service for LockAdapter {
    fn name(&self) -> &'static str {
        "locks"
    }

    fn configure(&self, ctx: &mut DependencyContext) {
        ctx.depends_on("messaging");
        ctx.depends_on("cluster");
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn terminate(&self) {}
}

struct CoordinationAdapter;

#[async_trait]
impl Service for CoordinationAdapter {
    fn name(&self) -> &'static str {
        "coordination"
    }

    fn configure(&self, ctx: &mut DependencyContext) {
        ctx.depends_on("messaging");
        ctx.depends_on("cluster");
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn terminate(&self) {}
}
