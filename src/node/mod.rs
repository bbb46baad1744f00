//! The node orchestrator.
//!
//! Owns discovery, the peer pool, the inbound server, the contribution
//! meter and the backend reference, and routes prompt and tensor
//! requests across the ring: work arriving at the node that holds layer
//! zero runs locally and forwards its output; work arriving anywhere
//! else relays to a peer that can make progress.

use crate::config::{parse_static_peer, NodeConfig};
use crate::device::{current_process_memory_mib, DeviceCapabilities};
use crate::discovery::{DiscoveryService, PeerInfo};
use crate::errors::{NodeError, Result};
use crate::inference::{InferenceBackend, InferenceState};
use crate::model::{Shard, Tensor};
use crate::rpc::{PeerHandle, RequestHandler, RpcConfig, RpcServer};
use crate::telemetry::ContributionMeter;
use crate::topology::Topology;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Edge label for direct RPC peers in the topology.
const PEER_EDGE_DESCRIPTION: &str = "RPC peer";

/// Overall deadline for one topology fan-out; late peers are dropped
/// from the merge.
const TOPOLOGY_FANOUT_DEADLINE: Duration = Duration::from_secs(10);

/// Depth used by the periodic topology refresh.
const TOPOLOGY_REFRESH_DEPTH: i32 = 2;

/// Lifecycle state of the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error(String),
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Stopped => write!(f, "stopped"),
            NodeStatus::Starting => write!(f, "starting"),
            NodeStatus::Running => write!(f, "running"),
            NodeStatus::Stopping => write!(f, "stopping"),
            NodeStatus::Error(msg) => write!(f, "error: {}", msg),
        }
    }
}

/// Receives upstream result and status deliveries.
#[async_trait]
pub trait ResultSubscriber: Send + Sync {
    async fn on_result(&self, request_id: &str, token_ids: &[i32], is_finished: bool);
    async fn on_opaque_status(&self, request_id: &str, status: &str);
}

struct NodeInner {
    config: NodeConfig,
    rpc_config: RpcConfig,
    backend: Arc<dyn InferenceBackend>,
    meter: ContributionMeter,
    // std lock: read synchronously from is_healthy(), written once at start
    capabilities: std::sync::RwLock<DeviceCapabilities>,
    pool: RwLock<HashMap<String, Arc<PeerHandle>>>,
    outstanding: RwLock<HashMap<String, Instant>>,
    topology: RwLock<Topology>,
    // peers added manually or from config; exempt from discovery eviction
    pinned: std::sync::RwLock<HashSet<String>>,
    subscriber: std::sync::RwLock<Option<Arc<dyn ResultSubscriber>>>,
    status_tx: watch::Sender<NodeStatus>,
    // serializes start/stop transitions
    lifecycle: Mutex<()>,
    discovery: Mutex<Option<DiscoveryService>>,
    server: Mutex<Option<RpcServer>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: Mutex<Option<CancellationToken>>,
}

/// A participating compute node in the inference ring.
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    pub fn new(config: NodeConfig, backend: Arc<dyn InferenceBackend>) -> Result<Self> {
        config.validate()?;
        let rpc_config = RpcConfig::from_node_config(&config);
        let (status_tx, _) = watch::channel(NodeStatus::Stopped);

        let pinned = config
            .static_peers
            .iter()
            .filter_map(|entry| parse_static_peer(entry).ok())
            .map(|(id, _)| id)
            .collect();

        Ok(Self {
            inner: Arc::new(NodeInner {
                config,
                rpc_config,
                backend,
                meter: ContributionMeter::new(),
                capabilities: std::sync::RwLock::new(DeviceCapabilities::unknown()),
                pool: RwLock::new(HashMap::new()),
                outstanding: RwLock::new(HashMap::new()),
                topology: RwLock::new(Topology::default()),
                pinned: std::sync::RwLock::new(pinned),
                subscriber: std::sync::RwLock::new(None),
                status_tx,
                lifecycle: Mutex::new(()),
                discovery: Mutex::new(None),
                server: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                cancel: Mutex::new(None),
            }),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.inner.config.node_id
    }

    pub fn status(&self) -> NodeStatus {
        self.inner.status_tx.borrow().clone()
    }

    /// Observe lifecycle transitions.
    pub fn subscribe_status(&self) -> watch::Receiver<NodeStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn meter(&self) -> &ContributionMeter {
        &self.inner.meter
    }

    pub fn capabilities(&self) -> DeviceCapabilities {
        self.inner.capabilities.read().unwrap().clone()
    }

    pub fn is_healthy(&self) -> bool {
        self.inner.healthy()
    }

    /// Wire in a receiver for upstream result deliveries.
    pub fn set_subscriber(&self, subscriber: Arc<dyn ResultSubscriber>) {
        *self.inner.subscriber.write().unwrap() = Some(subscriber);
    }

    /// Address the inbound server is bound to, once running.
    pub async fn rpc_addr(&self) -> Option<SocketAddr> {
        self.inner
            .server
            .lock()
            .await
            .as_ref()
            .map(|s| s.local_addr())
    }

    /// Ids of peers currently in the pool.
    pub async fn peer_ids(&self) -> Vec<String> {
        self.inner.pool.read().await.keys().cloned().collect()
    }

    /// Most recent topology snapshot.
    pub async fn topology(&self) -> Topology {
        self.inner.topology.read().await.clone()
    }

    /// Manually open a handle to a peer, exempt from discovery eviction.
    pub async fn add_peer(&self, peer_id: &str, addr: SocketAddr) -> Result<()> {
        if peer_id == self.inner.config.node_id {
            return Err(NodeError::Config(
                "cannot add self as a peer".to_string(),
            ));
        }
        let handle = PeerHandle::connect(peer_id, addr, self.inner.rpc_config.clone()).await?;
        self.inner.pinned.write().unwrap().insert(peer_id.to_string());
        let replaced = self
            .inner
            .pool
            .write()
            .await
            .insert(peer_id.to_string(), Arc::new(handle));
        if let Some(old) = replaced {
            old.close().await;
        }
        info!(peer_id, addr = %addr, "peer added");
        Ok(())
    }

    /// Submit a prompt to this node, as an ingress gateway would.
    pub async fn submit_prompt(
        &self,
        shard: Shard,
        prompt: String,
        request_id: String,
        state: Option<InferenceState>,
    ) -> Result<Tensor> {
        self.inner
            .handle_prompt(shard, prompt, request_id, state)
            .await
    }

    /// Submit an intermediate tensor to this node.
    pub async fn submit_tensor(
        &self,
        shard: Shard,
        tensor: Tensor,
        request_id: String,
        state: Option<InferenceState>,
    ) -> Result<Tensor> {
        self.inner
            .handle_tensor(shard, tensor, request_id, state)
            .await
    }

    /// Collect the cluster topology from this node's point of view.
    pub async fn collect_topology(
        &self,
        visited: HashSet<String>,
        max_depth: i32,
    ) -> Result<Topology> {
        self.inner.handle_topology(visited, max_depth).await
    }

    /// Bring the node up: probe capabilities, start the server and
    /// discovery, launch the maintenance tasks.
    pub async fn start(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        {
            let status = self.inner.status_tx.borrow().clone();
            if matches!(status, NodeStatus::Running | NodeStatus::Starting) {
                return Ok(());
            }
        }
        self.inner.set_status(NodeStatus::Starting);

        match self.inner.clone().start_resources().await {
            Ok(()) => {
                self.inner.set_status(NodeStatus::Running);
                info!(node_id = %self.node_id(), "node running");
                Ok(())
            }
            Err(e) => {
                warn!(node_id = %self.node_id(), error = %e, "node failed to start");
                self.inner.set_status(NodeStatus::Error(e.to_string()));
                self.inner.shutdown_resources().await;
                Err(e)
            }
        }
    }

    /// Bring the node down. Idempotent.
    pub async fn stop(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        {
            let status = self.inner.status_tx.borrow().clone();
            if matches!(status, NodeStatus::Stopped | NodeStatus::Stopping) {
                return;
            }
        }
        self.inner.set_status(NodeStatus::Stopping);
        self.inner.shutdown_resources().await;

        if let Err(e) = self.inner.meter.snapshot().save_to_file() {
            debug!(error = %e, "failed to persist contribution snapshot");
        }

        self.inner.set_status(NodeStatus::Stopped);
        info!(node_id = %self.node_id(), "node stopped");
    }
}

impl NodeInner {
    fn set_status(&self, status: NodeStatus) {
        self.status_tx.send_replace(status);
    }

    fn healthy(&self) -> bool {
        let running = matches!(*self.status_tx.borrow(), NodeStatus::Running);
        running && !self.capabilities.read().unwrap().is_unknown()
    }

    async fn start_resources(self: Arc<Self>) -> Result<()> {
        let capabilities = tokio::task::spawn_blocking(DeviceCapabilities::detect)
            .await
            .map_err(|e| NodeError::Internal(format!("capability probe panicked: {}", e)))?;
        info!(
            model = %capabilities.model,
            chip = %capabilities.chip,
            memory_mib = capabilities.memory_mib,
            "device capabilities probed"
        );
        *self.capabilities.write().unwrap() = capabilities;
        self.meter.update_peak_memory(current_process_memory_mib());

        let bind: SocketAddr = format!("{}:{}", self.config.bind_addr, self.config.rpc_port)
            .parse()
            .map_err(|e| NodeError::Config(format!("bad bind address: {}", e)))?;
        let handler: Arc<dyn RequestHandler> = self.clone();
        let server = RpcServer::bind(bind, handler, self.rpc_config.clone()).await?;
        let advertised_port = server.local_addr().port();
        *self.server.lock().await = Some(server);

        let cancel = CancellationToken::new();

        for entry in &self.config.static_peers {
            let (peer_id, addr) = parse_static_peer(entry)?;
            if peer_id == self.config.node_id {
                continue;
            }
            match PeerHandle::connect(&peer_id, addr, self.rpc_config.clone()).await {
                Ok(handle) => {
                    self.pool.write().await.insert(peer_id, Arc::new(handle));
                }
                Err(e) => {
                    warn!(peer_id = %peer_id, error = %e, "static peer unreachable");
                }
            }
        }

        let mut tasks = Vec::new();

        if self.config.enable_discovery {
            let discovery = DiscoveryService::new(&self.config, advertised_port);
            discovery.start().await?;
            let changes = discovery.subscribe();
            *self.discovery.lock().await = Some(discovery);
            tasks.push(tokio::spawn(pool_maintenance_loop(
                self.clone(),
                changes,
                cancel.clone(),
            )));
        }

        tasks.push(tokio::spawn(topology_refresh_loop(
            self.clone(),
            cancel.clone(),
        )));

        *self.tasks.lock().await = tasks;
        *self.cancel.lock().await = Some(cancel);
        Ok(())
    }

    async fn shutdown_resources(&self) {
        if let Some(cancel) = self.cancel.lock().await.take() {
            cancel.cancel();
        }
        for task in self.tasks.lock().await.drain(..) {
            let _ = task.await;
        }
        if let Some(discovery) = self.discovery.lock().await.take() {
            discovery.stop().await;
        }
        if let Some(server) = self.server.lock().await.take() {
            server.stop().await;
        }
        let handles: Vec<Arc<PeerHandle>> =
            self.pool.write().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.close().await;
        }
        self.outstanding.write().await.clear();
    }

    /// Reconcile the pool with a discovery snapshot: open handles for
    /// new peers, close handles for vanished ones. Pinned peers are
    /// never evicted here.
    async fn sync_pool(&self, snapshot: HashMap<String, PeerInfo>) {
        let to_add: Vec<PeerInfo> = {
            let pool = self.pool.read().await;
            snapshot
                .values()
                .filter(|p| p.id != self.config.node_id && !pool.contains_key(&p.id))
                .cloned()
                .collect()
        };

        for peer in to_add {
            match PeerHandle::connect(&peer.id, peer.rpc_addr(), self.rpc_config.clone()).await {
                Ok(handle) => {
                    info!(peer_id = %peer.id, addr = %peer.rpc_addr(), "peer handle opened");
                    self.pool
                        .write()
                        .await
                        .insert(peer.id.clone(), Arc::new(handle));
                }
                Err(e) => {
                    // retried on the next snapshot while discovery still sees the peer
                    warn!(peer_id = %peer.id, error = %e, "failed to open peer handle");
                }
            }
        }

        let to_close: Vec<Arc<PeerHandle>> = {
            let pinned = self.pinned.read().unwrap().clone();
            let mut pool = self.pool.write().await;
            let stale: Vec<String> = pool
                .keys()
                .filter(|id| !snapshot.contains_key(*id) && !pinned.contains(*id))
                .cloned()
                .collect();
            stale.iter().filter_map(|id| pool.remove(id)).collect()
        };

        for handle in to_close {
            info!(peer_id = %handle.peer_id(), "peer handle closed after eviction");
            handle.close().await;
        }
    }

    /// Any live peer that is not self. Baseline selection; a downstream
    /// router may substitute an affinity strategy.
    async fn select_peer(&self) -> Result<Arc<PeerHandle>> {
        self.pool
            .read()
            .await
            .values()
            .find(|p| p.peer_id() != self.config.node_id)
            .cloned()
            .ok_or(NodeError::NoPeers)
    }

    async fn infer_prompt_local(
        &self,
        request_id: &str,
        shard: &Shard,
        prompt: &str,
        state: Option<InferenceState>,
    ) -> Result<(Tensor, Option<InferenceState>)> {
        self.backend
            .infer_prompt(request_id, shard, prompt, state)
            .await
            .map_err(|e| match e {
                NodeError::Backend(_) => e,
                other => NodeError::Backend(other.to_string()),
            })
    }

    async fn infer_tensor_local(
        &self,
        request_id: &str,
        shard: &Shard,
        input: &Tensor,
        state: Option<InferenceState>,
    ) -> Result<(Tensor, Option<InferenceState>)> {
        self.backend
            .infer_tensor(request_id, shard, input, state)
            .await
            .map_err(|e| match e {
                NodeError::Backend(_) => e,
                other => NodeError::Backend(other.to_string()),
            })
    }

    /// Hand the intermediate tensor to a peer holding the next layers.
    async fn forward(
        &self,
        current: &Shard,
        tensor: Tensor,
        request_id: &str,
        state: Option<InferenceState>,
    ) -> Result<Tensor> {
        let next = current.next();
        let peer = self.select_peer().await?;
        debug!(
            request_id,
            next_shard = %next,
            peer_id = peer.peer_id(),
            "forwarding to next layers"
        );
        peer.send_tensor(next, tensor, request_id.to_string(), state)
            .await
    }

    async fn route_prompt(
        &self,
        shard: &Shard,
        prompt: &str,
        request_id: &str,
        state: Option<InferenceState>,
    ) -> Result<Tensor> {
        shard.validate()?;
        if shard.is_first_layer() {
            let (output, next_state) = self
                .infer_prompt_local(request_id, shard, prompt, state)
                .await?;
            if shard.is_last_layer() {
                Ok(output)
            } else {
                self.forward(shard, output, request_id, next_state).await
            }
        } else {
            // someone else begins this chain; relay the prompt anchored
            // at layer zero so the receiver starts the ring
            let peer = self.select_peer().await?;
            debug!(request_id, peer_id = peer.peer_id(), "relaying prompt");
            peer.send_prompt(
                shard.first(),
                prompt.to_string(),
                request_id.to_string(),
                state,
            )
            .await
        }
    }
}

#[async_trait]
impl RequestHandler for NodeInner {
    async fn handle_prompt(
        &self,
        shard: Shard,
        prompt: String,
        request_id: String,
        state: Option<InferenceState>,
    ) -> Result<Tensor> {
        let started = Instant::now();
        self.outstanding
            .write()
            .await
            .insert(request_id.clone(), started);

        let result = self.route_prompt(&shard, &prompt, &request_id, state).await;

        let outcome = match result {
            Ok(output) => {
                let tokens = prompt.split_whitespace().count() as u64;
                self.meter.record_prompt(
                    tokens,
                    started.elapsed().as_millis() as u64,
                    prompt.len() as u64,
                );
                Ok(output)
            }
            Err(e) => {
                self.meter.record_failure();
                Err(e)
            }
        };

        self.outstanding.write().await.remove(&request_id);
        outcome
    }

    async fn handle_tensor(
        &self,
        shard: Shard,
        tensor: Tensor,
        request_id: String,
        state: Option<InferenceState>,
    ) -> Result<Tensor> {
        let started = Instant::now();
        self.outstanding
            .write()
            .await
            .insert(request_id.clone(), started);

        let result = async {
            shard.validate()?;
            tensor.validate()?;
            let input_elements = tensor.element_count()?;
            let (output, next_state) = self
                .infer_tensor_local(&request_id, &shard, &tensor, state)
                .await?;
            let output = if shard.is_last_layer() {
                output
            } else {
                self.forward(&shard, output, &request_id, next_state).await?
            };
            Ok((output, input_elements))
        }
        .await;

        let outcome = match result {
            Ok((output, input_elements)) => {
                self.meter.record_tensor(
                    started.elapsed().as_millis() as u64,
                    (input_elements * 4) as u64,
                );
                Ok(output)
            }
            Err(e) => {
                self.meter.record_failure();
                Err(e)
            }
        };

        self.outstanding.write().await.remove(&request_id);
        outcome
    }

    async fn handle_topology(
        &self,
        mut visited: HashSet<String>,
        max_depth: i32,
    ) -> Result<Topology> {
        if visited.contains(&self.config.node_id) {
            // already collected on another path; stop the recursion here
            return Ok(Topology::default());
        }
        visited.insert(self.config.node_id.clone());

        let mut topology = Topology::default();
        topology.add_node(
            &self.config.node_id,
            self.capabilities.read().unwrap().clone(),
        );
        topology
            .peer_graph
            .entry(self.config.node_id.clone())
            .or_default();

        let peers: Vec<Arc<PeerHandle>> = self.pool.read().await.values().cloned().collect();
        for peer in &peers {
            topology.add_edge(&self.config.node_id, peer.peer_id(), PEER_EDGE_DESCRIPTION);
        }

        if max_depth > 0 {
            let collections = peers.iter().map(|peer| {
                let peer = peer.clone();
                let visited = visited.clone();
                async move {
                    let result = tokio::time::timeout(
                        TOPOLOGY_FANOUT_DEADLINE,
                        peer.collect_topology(visited, max_depth - 1),
                    )
                    .await;
                    (peer.peer_id().to_string(), result)
                }
            });

            for (peer_id, result) in futures::future::join_all(collections).await {
                match result {
                    Ok(Ok(peer_topology)) => topology.merge(peer_topology),
                    Ok(Err(e)) => {
                        warn!(peer_id = %peer_id, error = %e, "topology collection failed")
                    }
                    Err(_) => {
                        warn!(peer_id = %peer_id, "topology collection timed out")
                    }
                }
            }
        }

        *self.topology.write().await = topology.clone();
        Ok(topology)
    }

    async fn handle_result(
        &self,
        request_id: String,
        token_ids: Vec<i32>,
        is_finished: bool,
    ) -> Result<()> {
        info!(
            request_id,
            tokens = token_ids.len(),
            is_finished,
            "result delivered"
        );
        let subscriber = self.subscriber.read().unwrap().clone();
        if let Some(subscriber) = subscriber {
            subscriber
                .on_result(&request_id, &token_ids, is_finished)
                .await;
        }
        Ok(())
    }

    async fn handle_opaque_status(&self, request_id: String, status: String) -> Result<()> {
        info!(request_id, status = %status, "opaque status delivered");
        let subscriber = self.subscriber.read().unwrap().clone();
        if let Some(subscriber) = subscriber {
            subscriber.on_opaque_status(&request_id, &status).await;
        }
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.healthy()
    }
}

async fn pool_maintenance_loop(
    inner: Arc<NodeInner>,
    mut changes: broadcast::Receiver<HashMap<String, PeerInfo>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            change = changes.recv() => match change {
                Ok(snapshot) => inner.sync_pool(snapshot).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "discovery change stream lagged; re-reading");
                    let current = match inner.discovery.lock().await.as_ref() {
                        Some(discovery) => discovery.peers().await,
                        None => break,
                    };
                    inner.sync_pool(current).await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

async fn topology_refresh_loop(inner: Arc<NodeInner>, cancel: CancellationToken) {
    let mut ticker = interval(inner.config.topology_interval());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                inner.meter.update_peak_memory(current_process_memory_mib());
                if inner.pool.read().await.is_empty() {
                    continue;
                }
                if let Err(e) = inner
                    .handle_topology(HashSet::new(), TOPOLOGY_REFRESH_DEPTH)
                    .await
                {
                    debug!(error = %e, "topology refresh failed");
                }
            }
        }
    }
}
