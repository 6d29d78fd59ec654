//! The cluster facade: owns the runtime and every fabric subsystem, routes
//! inbound messages by tag, and exposes the node-transparent API
//!
//! Startup validates the config, binds the transport, and dials the seeds.
//! `stop` is idempotent: it announces a graceful shutdown, rejects every
//! pending cross-node operation, and releases sockets and timers.

use crate::config::ClusterConfig;
use crate::connection::ReconnectPolicy;
use crate::error::{ClusterError, ClusterResult};
use crate::global_registry::{GlobalRegistry, GlobalRegistryStats};
use crate::link::{LinkManager, LinkRef, LinkStats};
use crate::membership::{Membership, MembershipEvent, NodeInfo, NodeStatus};
use crate::message::ClusterMessage;
use crate::monitor::{MonitorManager, MonitorRef, MonitorStats};
use crate::remote_call::{RemoteCallManager, RemoteCallStats};
use crate::serializer::{Envelope, MessageSerializer};
use crate::spawn::{BehaviorRegistry, RemoteSpawner, SpawnOptions, SpawnStats};
use crate::transport::{PeerStats, Transport, TransportEvent, TransportSettings};
use axon_core::{
    Behavior, ExitReason, GenServerOptions, LifecycleEvent, NodeId, Runtime, ServerRef,
    TerminationHook,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Reserved payload key marking system-level casts (remote stop). Payloads
/// carrying it are consumed by the dispatcher, never by user handlers.
const SYSTEM_KEY: &str = "@axon_system";

/// Aggregated statistics snapshot for the whole node
#[derive(Debug, Clone, serde::Serialize)]
pub struct ClusterStats {
    pub node_id: String,
    pub uptime_ms: u64,
    pub process_count: usize,
    pub connections: Vec<PeerStats>,
    pub remote_calls: RemoteCallStats,
    pub spawns: SpawnStats,
    pub monitors: MonitorStats,
    pub links: LinkStats,
    pub global_registry: GlobalRegistryStats,
}

struct ClusterInner {
    config: ClusterConfig,
    local: NodeId,
    runtime: Arc<Runtime>,
    transport: Arc<Transport>,
    membership: Arc<Membership>,
    calls: Arc<RemoteCallManager>,
    behaviors: Arc<BehaviorRegistry>,
    spawner: Arc<RemoteSpawner>,
    global: Arc<GlobalRegistry>,
    monitors: Arc<MonitorManager>,
    links: Arc<LinkManager>,
    started: AtomicBool,
    hooks_registered: AtomicBool,
    started_at: Instant,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// One node's view of the cluster. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

impl Cluster {
    /// Validate the configuration and assemble the subsystems. Nothing
    /// touches the network until `start`.
    pub fn new(config: ClusterConfig) -> ClusterResult<Self> {
        config.validate()?;
        let local = config.node_id()?;

        let runtime = Runtime::new();
        let serializer = Arc::new(MessageSerializer::new(
            config.cluster_secret.clone(),
            config.max_frame_size,
        ));
        let transport = Transport::new(
            local.clone(),
            serializer,
            TransportSettings {
                bind_host: config.host.clone(),
                port: config.port,
                connect_timeout: config.connect_timeout(),
                reconnect: ReconnectPolicy {
                    base_delay: config.reconnect_base_delay(),
                    max_delay: config.reconnect_max_delay(),
                    max_attempts: config.reconnect_max_attempts,
                },
            },
        );
        let membership = Membership::new(
            local.clone(),
            transport.clone(),
            runtime.clone(),
            config.heartbeat_interval(),
            config.heartbeat_miss_threshold,
            config.seed_node_ids()?,
        );
        let calls = RemoteCallManager::new(transport.clone(), runtime.clone(), config.call_timeout());
        let behaviors = BehaviorRegistry::new();
        let global = GlobalRegistry::new(local.clone(), transport.clone(), runtime.clone());
        let spawner = RemoteSpawner::new(
            local.clone(),
            transport.clone(),
            runtime.clone(),
            behaviors.clone(),
            global.clone(),
        );
        let monitors = MonitorManager::new(
            local.clone(),
            transport.clone(),
            runtime.clone(),
            config.setup_timeout(),
        );
        let links = LinkManager::new(
            local.clone(),
            transport.clone(),
            runtime.clone(),
            config.setup_timeout(),
        );

        Ok(Self {
            inner: Arc::new(ClusterInner {
                config,
                local,
                runtime,
                transport,
                membership,
                calls,
                behaviors,
                spawner,
                global,
                monitors,
                links,
                started: AtomicBool::new(false),
                hooks_registered: AtomicBool::new(false),
                started_at: Instant::now(),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Start the transport, the dispatcher, membership, and seed dialing
    pub async fn start(&self) -> ClusterResult<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if !self.inner.hooks_registered.swap(true, Ordering::SeqCst) {
            self.inner
                .runtime
                .add_termination_hook(Arc::new(MonitorHook(self.inner.monitors.clone())))
                .await;
            self.inner
                .runtime
                .add_termination_hook(Arc::new(LinkHook(self.inner.links.clone())))
                .await;
        }

        if let Err(e) = self.inner.transport.start().await {
            self.inner.started.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let mut tasks = self.inner.tasks.lock().await;

        // Inbound message dispatcher.
        let cluster = self.clone();
        let mut transport_events = self.inner.transport.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                match transport_events.recv().await {
                    Ok(TransportEvent::Message { envelope, from }) => {
                        cluster.route_message(envelope, from).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Dispatcher lagged {} transport events", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        // Membership events fan out to the subsystems.
        let cluster = self.clone();
        let mut membership_events = self.inner.membership.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                match membership_events.recv().await {
                    Ok(MembershipEvent::NodeDown { node_id, .. }) => {
                        cluster.inner.calls.on_node_down(&node_id).await;
                        cluster.inner.spawner.on_node_down(&node_id).await;
                        cluster.inner.monitors.on_node_down(&node_id).await;
                        cluster.inner.links.on_node_down(&node_id).await;
                        cluster.inner.global.on_node_down(&node_id).await;
                    }
                    Ok(MembershipEvent::NodeUp { node_id }) => {
                        cluster.inner.global.sync_with(&node_id).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Membership fanout lagged {} events", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
        drop(tasks);

        self.inner.membership.start().await?;
        info!("Cluster node {} started", self.inner.local);
        Ok(())
    }

    /// Announce a graceful shutdown, reject every pending cross-node
    /// operation, and tear everything down. Idempotent.
    pub async fn stop(&self) {
        if !self.inner.started.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Cluster node {} stopping", self.inner.local);

        self.inner
            .transport
            .broadcast(&ClusterMessage::NodeDown {
                node_id: self.inner.local.clone(),
                reason: crate::message::NodeDownReason::GracefulShutdown,
            })
            .await;
        // Give the write buffers a moment to drain before closing sockets.
        tokio::time::sleep(Duration::from_millis(100)).await;

        self.inner.membership.stop().await;
        self.inner.transport.stop().await;

        self.inner.calls.reset().await;
        self.inner.spawner.reset().await;
        self.inner.monitors.reset().await;
        self.inner.links.reset().await;
        self.inner.global.reset().await;

        let mut tasks = self.inner.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    pub fn node_id(&self) -> &NodeId {
        &self.inner.local
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.inner.config
    }

    /// The local GenServer runtime
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.inner.runtime
    }

    /// The behavior registry for remote spawn
    pub fn behaviors(&self) -> &Arc<BehaviorRegistry> {
        &self.inner.behaviors
    }

    /// The cluster-wide name registry
    pub fn global_registry(&self) -> &Arc<GlobalRegistry> {
        &self.inner.global
    }

    /// Start a GenServer on this node
    pub async fn start_server<B: Behavior>(
        &self,
        behavior: B,
        options: GenServerOptions,
    ) -> ClusterResult<ServerRef> {
        Ok(self.inner.runtime.start(behavior, options).await?)
    }

    /// Call a process wherever it lives
    pub async fn call(
        &self,
        target: &ServerRef,
        msg: Value,
        timeout: Option<Duration>,
    ) -> ClusterResult<Value> {
        let timeout = timeout.unwrap_or_else(|| self.inner.config.call_timeout());
        match self.remote_node(target) {
            None => Ok(self.inner.runtime.call(target.id, msg, timeout).await?),
            Some(node) => {
                self.ensure_started()?;
                self.inner.calls.call(target, &node, msg, timeout).await
            }
        }
    }

    /// Cast to a process wherever it lives; best-effort
    pub async fn cast(&self, target: &ServerRef, msg: Value) -> ClusterResult<()> {
        match self.remote_node(target) {
            None => Ok(self.inner.runtime.cast(target.id, msg).await?),
            Some(node) => {
                self.ensure_started()?;
                self.inner.calls.cast(target, &node, msg).await;
                Ok(())
            }
        }
    }

    /// Stop a process wherever it lives. Remote stops travel as a system
    /// cast consumed by the peer's dispatcher.
    pub async fn stop_server(&self, target: &ServerRef, reason: ExitReason) -> ClusterResult<()> {
        match self.remote_node(target) {
            None => Ok(self.inner.runtime.stop(target.id, reason).await?),
            Some(node) => {
                self.ensure_started()?;
                self.inner
                    .calls
                    .cast(target, &node, system_stop_payload(&reason))
                    .await;
                Ok(())
            }
        }
    }

    /// Spawn a pre-registered behavior on a target node
    pub async fn spawn(
        &self,
        behavior_name: &str,
        target_node: &NodeId,
        options: SpawnOptions,
    ) -> ClusterResult<ServerRef> {
        if *target_node != self.inner.local {
            self.ensure_started()?;
        }
        self.inner.spawner.spawn(behavior_name, target_node, options).await
    }

    /// Monitor a remote process from a local one
    pub async fn monitor(
        &self,
        monitoring: &ServerRef,
        monitored: &ServerRef,
        timeout: Option<Duration>,
    ) -> ClusterResult<MonitorRef> {
        self.ensure_started()?;
        self.inner.monitors.monitor(monitoring, monitored, timeout).await
    }

    pub async fn demonitor(&self, monitor_ref: &MonitorRef) -> ClusterResult<()> {
        self.inner.monitors.demonitor(monitor_ref).await
    }

    /// Link a local process to a remote one
    pub async fn link(
        &self,
        local_ref: &ServerRef,
        remote_ref: &ServerRef,
        timeout: Option<Duration>,
    ) -> ClusterResult<LinkRef> {
        self.ensure_started()?;
        self.inner.links.link(local_ref, remote_ref, timeout).await
    }

    pub async fn unlink(&self, link_ref: &LinkRef) -> ClusterResult<()> {
        self.inner.links.unlink(link_ref).await
    }

    /// Connect to a peer explicitly (seeds connect automatically)
    pub async fn connect_to(&self, node: &NodeId) -> ClusterResult<()> {
        self.ensure_started()?;
        self.inner.transport.connect_to(node).await
    }

    pub async fn get_nodes(&self) -> Vec<NodeInfo> {
        self.inner.membership.get_nodes().await
    }

    pub async fn get_connected_nodes(&self) -> Vec<NodeId> {
        self.inner.membership.get_connected_nodes().await
    }

    pub async fn get_node_status(&self, node: &NodeId) -> Option<NodeStatus> {
        self.inner.membership.get_status(node).await
    }

    /// Membership events (node up/down, status changes)
    pub fn subscribe_membership(&self) -> broadcast::Receiver<MembershipEvent> {
        self.inner.membership.subscribe()
    }

    /// Lifecycle events of local processes and supervisors
    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.runtime.subscribe_events()
    }

    /// Read-only statistics snapshot across every subsystem
    pub async fn get_stats(&self) -> ClusterStats {
        ClusterStats {
            node_id: self.inner.local.to_string(),
            uptime_ms: self.inner.started_at.elapsed().as_millis() as u64,
            process_count: self.inner.runtime.process_count().await,
            connections: self.inner.transport.get_stats().await,
            remote_calls: self.inner.calls.get_stats().await,
            spawns: self.inner.spawner.get_stats().await,
            monitors: self.inner.monitors.get_stats().await,
            links: self.inner.links.get_stats().await,
            global_registry: self.inner.global.get_stats().await,
        }
    }

    /// Connected peers as seen by membership, for node selection
    pub(crate) async fn selection_candidates(&self) -> Vec<NodeId> {
        let mut nodes = self.inner.membership.get_connected_nodes().await;
        nodes.push(self.inner.local.clone());
        nodes.sort();
        nodes
    }

    pub(crate) async fn node_load(&self, node: &NodeId) -> usize {
        if *node == self.inner.local {
            return self.inner.runtime.process_count().await;
        }
        self.inner
            .membership
            .get_nodes()
            .await
            .into_iter()
            .find(|info| &info.node_id == node)
            .map(|info| info.process_count)
            .unwrap_or(0)
    }

    fn ensure_started(&self) -> ClusterResult<()> {
        if self.is_started() {
            Ok(())
        } else {
            Err(ClusterError::ClusterNotStarted)
        }
    }

    /// `None` for local targets, `Some(node)` for remote ones
    fn remote_node(&self, target: &ServerRef) -> Option<NodeId> {
        match &target.node_id {
            Some(node) if *node != self.inner.local => Some(node.clone()),
            _ => None,
        }
    }

    /// Dispatch one inbound envelope by payload tag
    async fn route_message(&self, envelope: Envelope, from: NodeId) {
        debug!("Inbound {} from {}", envelope.payload.tag(), from);
        match envelope.payload {
            ClusterMessage::Heartbeat {
                process_count,
                uptime_ms,
            } => {
                self.inner
                    .membership
                    .handle_heartbeat(&from, process_count, uptime_ms)
                    .await;
            }
            ClusterMessage::NodeDown { node_id, reason } => {
                self.inner
                    .membership
                    .handle_node_down_message(&node_id, reason)
                    .await;
            }
            ClusterMessage::CallRequest {
                call_id,
                target_server_id,
                payload,
            } => {
                self.inner
                    .calls
                    .handle_request(from, call_id, target_server_id, payload)
                    .await;
            }
            ClusterMessage::CallReply { call_id, result } => {
                self.inner.calls.handle_reply(call_id, result).await;
            }
            ClusterMessage::Cast {
                target_server_id,
                payload,
            } => {
                if let Some(reason) = parse_system_stop(&payload) {
                    let runtime = self.inner.runtime.clone();
                    tokio::spawn(async move {
                        let _ = runtime.stop(target_server_id, reason).await;
                    });
                } else {
                    self.inner.calls.handle_cast(target_server_id, payload).await;
                }
            }
            ClusterMessage::SpawnRequest {
                spawn_id,
                behavior_name,
                name,
                registration,
                init_timeout_ms,
            } => {
                self.inner
                    .spawner
                    .handle_request(from, spawn_id, behavior_name, name, registration, init_timeout_ms)
                    .await;
            }
            ClusterMessage::SpawnReply { spawn_id, result } => {
                self.inner.spawner.handle_reply(&from, spawn_id, result).await;
            }
            ClusterMessage::MonitorRequest {
                monitor_id,
                monitoring,
                monitored,
            } => {
                self.inner
                    .monitors
                    .handle_monitor_request(from, monitor_id, monitoring, monitored)
                    .await;
            }
            ClusterMessage::MonitorAck {
                monitor_id,
                success,
                reason,
            } => {
                self.inner
                    .monitors
                    .handle_monitor_ack(monitor_id, success, reason)
                    .await;
            }
            ClusterMessage::DemonitorRequest { monitor_id } => {
                self.inner.monitors.handle_demonitor(monitor_id).await;
            }
            ClusterMessage::ProcessDown {
                monitor_id,
                monitored,
                reason,
            } => {
                self.inner
                    .monitors
                    .handle_process_down(monitor_id, monitored, reason)
                    .await;
            }
            ClusterMessage::LinkRequest { link_id, from: from_ref, to } => {
                self.inner
                    .links
                    .handle_link_request(from, link_id, from_ref, to)
                    .await;
            }
            ClusterMessage::LinkAck {
                link_id,
                success,
                reason,
            } => {
                self.inner.links.handle_link_ack(link_id, success, reason).await;
            }
            ClusterMessage::UnlinkRequest { link_id } => {
                self.inner.links.handle_unlink(link_id).await;
            }
            ClusterMessage::ExitSignal {
                link_id,
                from: from_ref,
                to,
                reason,
            } => {
                self.inner
                    .links
                    .handle_exit_signal(link_id, from_ref, to, reason)
                    .await;
            }
            ClusterMessage::RegistryAnnounce { entries, removed } => {
                self.inner.global.handle_announce(&from, entries, removed).await;
            }
            ClusterMessage::RegistryConflictResolution { winner } => {
                self.inner.global.handle_conflict_resolution(&from, winner).await;
            }
        }
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("node_id", &self.inner.local)
            .field("started", &self.is_started())
            .finish()
    }
}

fn system_stop_payload(reason: &ExitReason) -> Value {
    json!({ SYSTEM_KEY: "stop", "reason": reason })
}

fn parse_system_stop(payload: &Value) -> Option<ExitReason> {
    if payload.get(SYSTEM_KEY)?.as_str()? != "stop" {
        return None;
    }
    serde_json::from_value(payload.get("reason")?.clone()).ok()
}

/// Clears incoming monitors (and notifies monitoring peers) before a dying
/// process emits its `Terminated` event.
struct MonitorHook(Arc<MonitorManager>);

#[async_trait]
impl TerminationHook for MonitorHook {
    async fn on_terminate(&self, server_id: axon_core::ServerId, reason: &ExitReason) {
        self.0.on_local_terminate(server_id, reason).await;
    }
}

/// Propagates or silently removes links before the `Terminated` event.
struct LinkHook(Arc<LinkManager>);

#[async_trait]
impl TerminationHook for LinkHook {
    async fn on_terminate(&self, server_id: axon_core::ServerId, reason: &ExitReason) {
        self.0.on_local_terminate(server_id, reason).await;
    }
}
