//! Distributed supervisor: children spawned on chosen peer nodes, watched
//! through remote monitors, restarted with the same strategies and
//! intensity limits as the local supervisor
//!
//! The supervisor owns a lightweight agent process whose only job is to
//! receive monitor notifications and funnel them into the command loop.
//! Node loss arrives as an ordinary `noconnection` down signal, so failover
//! and crash restarts share one code path; only the accounting differs.

use crate::cluster::Cluster;
use crate::error::{ClusterError, ClusterResult};
use crate::message::Registration;
use crate::monitor::MonitorRef;
use crate::spawn::SpawnOptions;
use axon_core::{
    Behavior, CoreError, CoreResult, ExitReason, GenServerOptions, InfoMessage, LifecycleEvent,
    NodeId, RestartIntensity, RestartPolicy, RestartWindow, ServerId, ServerRef, Strategy,
};
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Placement policy for children
#[derive(Clone)]
pub enum NodeSelector {
    /// Always place on the local node
    LocalFirst,
    /// Cycle through the candidate set
    RoundRobin,
    /// Pick the node with the fewest processes
    LeastLoaded,
    /// Uniformly random candidate
    Random,
    /// Pin to one node; fails if it is not connected
    Node(NodeId),
    /// User-provided policy over the candidate set
    Custom(Arc<dyn Fn(&[NodeId], &str) -> Option<NodeId> + Send + Sync>),
}

impl std::fmt::Debug for NodeSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalFirst => write!(f, "LocalFirst"),
            Self::RoundRobin => write!(f, "RoundRobin"),
            Self::LeastLoaded => write!(f, "LeastLoaded"),
            Self::Random => write!(f, "Random"),
            Self::Node(node) => write!(f, "Node({})", node),
            Self::Custom(_) => write!(f, "Custom"),
        }
    }
}

/// Specification of one distributed child
#[derive(Debug, Clone)]
pub struct DistChildSpec {
    pub id: String,
    /// Behavior name, pre-registered on every candidate node
    pub behavior: String,
    pub restart: RestartPolicy,
    pub registration: Registration,
    /// Name applied via the registration policy
    pub name: Option<String>,
}

impl DistChildSpec {
    pub fn new<S: Into<String>, B: Into<String>>(id: S, behavior: B) -> Self {
        Self {
            id: id.into(),
            behavior: behavior.into(),
            restart: RestartPolicy::Permanent,
            registration: Registration::None,
            name: None,
        }
    }

    pub fn restart(mut self, policy: RestartPolicy) -> Self {
        self.restart = policy;
        self
    }

    /// Register the child globally under this name, keeping one instance
    /// cluster-wide
    pub fn global_name<S: Into<String>>(mut self, name: S) -> Self {
        self.registration = Registration::Global;
        self.name = Some(name.into());
        self
    }

    pub fn local_name<S: Into<String>>(mut self, name: S) -> Self {
        self.registration = Registration::Local;
        self.name = Some(name.into());
        self
    }
}

/// Template for `simple_one_for_one` dynamic children
#[derive(Debug, Clone)]
pub struct DistChildTemplate {
    pub behavior: String,
    pub restart: RestartPolicy,
}

impl DistChildTemplate {
    pub fn new<B: Into<String>>(behavior: B) -> Self {
        Self {
            behavior: behavior.into(),
            restart: RestartPolicy::Permanent,
        }
    }
}

/// Distributed supervisor configuration
#[derive(Debug, Clone)]
pub struct DistSupervisorOptions {
    pub strategy: Strategy,
    pub selector: NodeSelector,
    pub children: Vec<DistChildSpec>,
    pub intensity: RestartIntensity,
    pub child_template: Option<DistChildTemplate>,
}

impl DistSupervisorOptions {
    pub fn new(strategy: Strategy, selector: NodeSelector) -> Self {
        Self {
            strategy,
            selector,
            children: Vec::new(),
            intensity: RestartIntensity::default(),
            child_template: None,
        }
    }

    pub fn child(mut self, spec: DistChildSpec) -> Self {
        self.children.push(spec);
        self
    }

    pub fn intensity(mut self, max_restarts: u32, within: Duration) -> Self {
        self.intensity = RestartIntensity {
            max_restarts,
            within,
        };
        self
    }

    pub fn child_template(mut self, template: DistChildTemplate) -> Self {
        self.child_template = Some(template);
        self
    }
}

/// Events emitted by a distributed supervisor
#[derive(Debug, Clone)]
pub enum DistSupervisorEvent {
    Started {
        supervisor_id: Uuid,
    },
    ChildStarted {
        child_id: String,
        server_ref: ServerRef,
        node: NodeId,
    },
    ChildRestarted {
        child_id: String,
        server_ref: ServerRef,
        node: NodeId,
    },
    /// A restart placed the child on a different node
    ChildMigrated {
        child_id: String,
        from: NodeId,
        to: NodeId,
    },
    ChildTerminated {
        child_id: String,
        reason: ExitReason,
    },
    Terminated {
        supervisor_id: Uuid,
        reason: ExitReason,
    },
}

/// Point-in-time view of one distributed child
#[derive(Debug, Clone)]
pub struct DistChildSnapshot {
    pub id: String,
    pub server_ref: Option<ServerRef>,
    pub node: Option<NodeId>,
    pub restart_count: u32,
    pub restart: RestartPolicy,
}

/// Counters for the observability surface
#[derive(Debug, Clone, Default)]
pub struct DistSupervisorStats {
    pub children: usize,
    pub active: usize,
    pub restarts: u64,
    /// Restarts caused by node loss (`noconnection`), counted separately
    pub node_failure_restarts: u64,
}

enum DistCommand {
    StartChild {
        spec: Box<DistChildSpec>,
        reply: oneshot::Sender<ClusterResult<ServerRef>>,
    },
    StartDynamicChild {
        reply: oneshot::Sender<ClusterResult<ServerRef>>,
    },
    TerminateChild {
        child_id: String,
        reply: oneshot::Sender<ClusterResult<()>>,
    },
    RestartChild {
        child_id: String,
        reply: oneshot::Sender<ClusterResult<ServerRef>>,
    },
    GetChildren {
        reply: oneshot::Sender<Vec<DistChildSnapshot>>,
    },
    GetStats {
        reply: oneshot::Sender<DistSupervisorStats>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running distributed supervisor
#[derive(Clone)]
pub struct DistSupervisorHandle {
    id: Uuid,
    command_tx: mpsc::UnboundedSender<DistCommand>,
    events_tx: broadcast::Sender<DistSupervisorEvent>,
    done_rx: watch::Receiver<bool>,
}

impl DistSupervisorHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_running(&self) -> bool {
        !*self.done_rx.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DistSupervisorEvent> {
        self.events_tx.subscribe()
    }

    pub async fn start_child(&self, spec: DistChildSpec) -> ClusterResult<ServerRef> {
        self.request(|reply| DistCommand::StartChild {
            spec: Box::new(spec),
            reply,
        })
        .await?
    }

    pub async fn start_child_dynamic(&self) -> ClusterResult<ServerRef> {
        self.request(|reply| DistCommand::StartDynamicChild { reply })
            .await?
    }

    pub async fn terminate_child(&self, child_id: &str) -> ClusterResult<()> {
        self.request(|reply| DistCommand::TerminateChild {
            child_id: child_id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn restart_child(&self, child_id: &str) -> ClusterResult<ServerRef> {
        self.request(|reply| DistCommand::RestartChild {
            child_id: child_id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn get_children(&self) -> ClusterResult<Vec<DistChildSnapshot>> {
        self.request(|reply| DistCommand::GetChildren { reply }).await
    }

    pub async fn get_stats(&self) -> ClusterResult<DistSupervisorStats> {
        self.request(|reply| DistCommand::GetStats { reply }).await
    }

    pub async fn stop(&self) -> ClusterResult<()> {
        self.request(|reply| DistCommand::Stop { reply }).await
    }

    pub async fn wait_terminated(&self) {
        let mut done_rx = self.done_rx.clone();
        while !*done_rx.borrow() {
            if done_rx.changed().await.is_err() {
                break;
            }
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> DistCommand,
    ) -> ClusterResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(make(reply_tx))
            .map_err(|_| ClusterError::Core(CoreError::SupervisorNotRunning(self.id.to_string())))?;
        reply_rx
            .await
            .map_err(|_| ClusterError::Core(CoreError::SupervisorNotRunning(self.id.to_string())))
    }
}

/// Forwards monitor notifications into the supervisor's command loop
struct SupervisorAgent {
    signals: mpsc::UnboundedSender<(Uuid, ServerRef, ExitReason)>,
}

#[async_trait]
impl Behavior for SupervisorAgent {
    async fn handle_info(&mut self, msg: InfoMessage) -> CoreResult<()> {
        if let InfoMessage::Down {
            monitor_id,
            from,
            reason,
        } = msg
        {
            let _ = self.signals.send((monitor_id, from, reason));
        }
        Ok(())
    }
}

/// Distributed supervisor entry point
pub struct DistSupervisor;

impl DistSupervisor {
    /// Start the agent process, the initial children, and the command loop
    pub async fn start(
        cluster: Cluster,
        options: DistSupervisorOptions,
    ) -> ClusterResult<DistSupervisorHandle> {
        validate_options(&options)?;

        let id = Uuid::new_v4();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let agent_ref = cluster
            .runtime()
            .start(
                SupervisorAgent {
                    signals: signals_tx,
                },
                GenServerOptions::default(),
            )
            .await
            .map_err(ClusterError::Core)?;

        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let lifecycle_rx = cluster.runtime().subscribe_events();

        let mut task = DistSupervisorTask {
            id,
            cluster,
            agent_ref,
            strategy: options.strategy,
            selector: options.selector,
            template: options.child_template,
            window: RestartWindow::new(options.intensity),
            children: Vec::new(),
            expected_exits: HashSet::new(),
            events_tx: events_tx.clone(),
            rr_index: 0,
            dynamic_seq: 0,
            restarts: 0,
            node_failure_restarts: 0,
        };

        for spec in &options.children {
            match task.spawn_child(spec, false).await {
                Ok(placed) => {
                    task.emit(DistSupervisorEvent::ChildStarted {
                        child_id: spec.id.clone(),
                        server_ref: placed.server_ref.clone(),
                        node: placed.node.clone(),
                    });
                    task.children.push(DistChildState {
                        spec: spec.clone(),
                        placed: Some(placed),
                        restart_count: 0,
                    });
                }
                Err(e) => {
                    error!("Distributed child '{}' failed to start: {}", spec.id, e);
                    task.stop_all_children().await;
                    let _ = task
                        .cluster
                        .runtime()
                        .stop(task.agent_ref.id, ExitReason::Shutdown)
                        .await;
                    return Err(e);
                }
            }
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = watch::channel(false);
        tokio::spawn(task.run(command_rx, signals_rx, lifecycle_rx, done_tx));

        info!("Distributed supervisor {} started", id);
        let _ = events_tx.send(DistSupervisorEvent::Started { supervisor_id: id });

        Ok(DistSupervisorHandle {
            id,
            command_tx,
            events_tx,
            done_rx,
        })
    }
}

fn validate_options(options: &DistSupervisorOptions) -> ClusterResult<()> {
    let mut seen = HashSet::new();
    for spec in &options.children {
        if !seen.insert(spec.id.clone()) {
            return Err(ClusterError::Core(CoreError::DuplicateChild(spec.id.clone())));
        }
    }
    match options.strategy {
        Strategy::SimpleOneForOne => {
            if options.child_template.is_none() {
                return Err(ClusterError::Core(CoreError::MissingChildTemplate));
            }
            if !options.children.is_empty() {
                return Err(ClusterError::Core(CoreError::InvalidSimpleOneForOne(
                    "children must be empty at start".to_string(),
                )));
            }
        }
        _ => {
            if options.child_template.is_some() {
                return Err(ClusterError::Core(CoreError::InvalidSimpleOneForOne(
                    "child_template requires the simple_one_for_one strategy".to_string(),
                )));
            }
        }
    }
    Ok(())
}

/// Where a child currently runs
#[derive(Debug, Clone)]
struct Placement {
    node: NodeId,
    server_ref: ServerRef,
    monitor: Option<MonitorRef>,
}

struct DistChildState {
    spec: DistChildSpec,
    placed: Option<Placement>,
    restart_count: u32,
}

struct DistSupervisorTask {
    id: Uuid,
    cluster: Cluster,
    agent_ref: ServerRef,
    strategy: Strategy,
    selector: NodeSelector,
    template: Option<DistChildTemplate>,
    window: RestartWindow,
    children: Vec<DistChildState>,
    expected_exits: HashSet<ServerId>,
    events_tx: broadcast::Sender<DistSupervisorEvent>,
    rr_index: usize,
    dynamic_seq: u64,
    restarts: u64,
    node_failure_restarts: u64,
}

impl DistSupervisorTask {
    async fn run(
        mut self,
        mut command_rx: mpsc::UnboundedReceiver<DistCommand>,
        mut signals_rx: mpsc::UnboundedReceiver<(Uuid, ServerRef, ExitReason)>,
        mut lifecycle_rx: broadcast::Receiver<LifecycleEvent>,
        done_tx: watch::Sender<bool>,
    ) {
        let exit_reason = loop {
            tokio::select! {
                command = command_rx.recv() => {
                    match command {
                        Some(DistCommand::Stop { reply }) => {
                            let _ = reply.send(());
                            break ExitReason::Shutdown;
                        }
                        Some(command) => self.handle_command(command).await,
                        None => break ExitReason::Shutdown,
                    }
                }
                signal = signals_rx.recv() => {
                    match signal {
                        Some((monitor_id, from, reason)) => {
                            if let Some(exit) = self.on_monitor_down(monitor_id, from, reason).await {
                                break exit;
                            }
                        }
                        None => break ExitReason::Shutdown,
                    }
                }
                event = lifecycle_rx.recv() => {
                    match event {
                        Ok(LifecycleEvent::Terminated { server_id, reason, .. }) => {
                            if let Some(exit) = self.on_local_exit(server_id, reason).await {
                                break exit;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("Distributed supervisor {} lagged {} events", self.id, missed);
                        }
                        Err(broadcast::error::RecvError::Closed) => break ExitReason::Shutdown,
                    }
                }
            }
        };

        self.stop_all_children().await;
        let _ = self
            .cluster
            .runtime()
            .stop(self.agent_ref.id, ExitReason::Shutdown)
            .await;
        info!(
            "Distributed supervisor {} terminated: {}",
            self.id, exit_reason
        );
        self.emit(DistSupervisorEvent::Terminated {
            supervisor_id: self.id,
            reason: exit_reason,
        });
        let _ = done_tx.send(true);
    }

    async fn handle_command(&mut self, command: DistCommand) {
        match command {
            DistCommand::StartChild { spec, reply } => {
                let _ = reply.send(self.command_start_child(*spec).await);
            }
            DistCommand::StartDynamicChild { reply } => {
                let _ = reply.send(self.command_start_dynamic().await);
            }
            DistCommand::TerminateChild { child_id, reply } => {
                let _ = reply.send(self.command_terminate_child(&child_id).await);
            }
            DistCommand::RestartChild { child_id, reply } => {
                let _ = reply.send(self.command_restart_child(&child_id).await);
            }
            DistCommand::GetChildren { reply } => {
                let snapshots = self
                    .children
                    .iter()
                    .map(|c| DistChildSnapshot {
                        id: c.spec.id.clone(),
                        server_ref: c.placed.as_ref().map(|p| p.server_ref.clone()),
                        node: c.placed.as_ref().map(|p| p.node.clone()),
                        restart_count: c.restart_count,
                        restart: c.spec.restart,
                    })
                    .collect();
                let _ = reply.send(snapshots);
            }
            DistCommand::GetStats { reply } => {
                let active = self.children.iter().filter(|c| c.placed.is_some()).count();
                let _ = reply.send(DistSupervisorStats {
                    children: self.children.len(),
                    active,
                    restarts: self.restarts,
                    node_failure_restarts: self.node_failure_restarts,
                });
            }
            DistCommand::Stop { .. } => unreachable!("handled in the loop"),
        }
    }

    async fn command_start_child(&mut self, spec: DistChildSpec) -> ClusterResult<ServerRef> {
        if self.strategy == Strategy::SimpleOneForOne {
            return Err(ClusterError::Core(CoreError::InvalidSimpleOneForOne(
                "use start_child_dynamic for simple_one_for_one supervisors".to_string(),
            )));
        }
        if self.children.iter().any(|c| c.spec.id == spec.id) {
            return Err(ClusterError::Core(CoreError::DuplicateChild(spec.id)));
        }

        let placed = self.spawn_child(&spec, false).await?;
        let server_ref = placed.server_ref.clone();
        self.emit(DistSupervisorEvent::ChildStarted {
            child_id: spec.id.clone(),
            server_ref: server_ref.clone(),
            node: placed.node.clone(),
        });
        self.children.push(DistChildState {
            spec,
            placed: Some(placed),
            restart_count: 0,
        });
        Ok(server_ref)
    }

    async fn command_start_dynamic(&mut self) -> ClusterResult<ServerRef> {
        let template = match (&self.strategy, &self.template) {
            (Strategy::SimpleOneForOne, Some(template)) => template.clone(),
            (Strategy::SimpleOneForOne, None) => {
                return Err(ClusterError::Core(CoreError::MissingChildTemplate))
            }
            _ => {
                return Err(ClusterError::Core(CoreError::InvalidSimpleOneForOne(
                    "start_child_dynamic requires the simple_one_for_one strategy".to_string(),
                )))
            }
        };

        self.dynamic_seq += 1;
        let spec = DistChildSpec {
            id: format!("child_{}", self.dynamic_seq),
            behavior: template.behavior,
            restart: template.restart,
            registration: Registration::None,
            name: None,
        };

        let placed = self.spawn_child(&spec, false).await?;
        let server_ref = placed.server_ref.clone();
        self.emit(DistSupervisorEvent::ChildStarted {
            child_id: spec.id.clone(),
            server_ref: server_ref.clone(),
            node: placed.node.clone(),
        });
        self.children.push(DistChildState {
            spec,
            placed: Some(placed),
            restart_count: 0,
        });
        Ok(server_ref)
    }

    async fn command_terminate_child(&mut self, child_id: &str) -> ClusterResult<()> {
        let idx = self
            .children
            .iter()
            .position(|c| c.spec.id == child_id)
            .ok_or_else(|| ClusterError::Core(CoreError::ChildNotFound(child_id.to_string())))?;

        self.stop_child(idx).await;
        self.emit(DistSupervisorEvent::ChildTerminated {
            child_id: child_id.to_string(),
            reason: ExitReason::Shutdown,
        });
        if self.strategy == Strategy::SimpleOneForOne {
            self.children.remove(idx);
        }
        Ok(())
    }

    async fn command_restart_child(&mut self, child_id: &str) -> ClusterResult<ServerRef> {
        let idx = self
            .children
            .iter()
            .position(|c| c.spec.id == child_id)
            .ok_or_else(|| ClusterError::Core(CoreError::ChildNotFound(child_id.to_string())))?;
        if self.children[idx].placed.is_some() {
            return Err(ClusterError::Core(CoreError::Internal(format!(
                "child '{}' is already running",
                child_id
            ))));
        }

        let spec = self.children[idx].spec.clone();
        let placed = self.spawn_child(&spec, true).await?;
        let server_ref = placed.server_ref.clone();
        self.children[idx].restart_count += 1;
        self.restarts += 1;
        self.emit(DistSupervisorEvent::ChildRestarted {
            child_id: child_id.to_string(),
            server_ref: server_ref.clone(),
            node: placed.node.clone(),
        });
        self.children[idx].placed = Some(placed);
        Ok(server_ref)
    }

    /// A remote monitor reported a child down
    async fn on_monitor_down(
        &mut self,
        monitor_id: Uuid,
        _from: ServerRef,
        reason: ExitReason,
    ) -> Option<ExitReason> {
        let idx = self.children.iter().position(|c| {
            c.placed
                .as_ref()
                .and_then(|p| p.monitor.as_ref())
                .map(|m| m.monitor_id == monitor_id)
                .unwrap_or(false)
        })?;
        self.on_child_down(idx, reason).await
    }

    /// A locally placed child terminated
    async fn on_local_exit(&mut self, server_id: ServerId, reason: ExitReason) -> Option<ExitReason> {
        if self.expected_exits.remove(&server_id) {
            return None;
        }
        let idx = self.children.iter().position(|c| {
            c.placed
                .as_ref()
                .map(|p| p.node == *self.cluster.node_id() && p.server_ref.id == server_id)
                .unwrap_or(false)
        })?;
        self.on_child_down(idx, reason).await
    }

    /// Shared death handling: accounting, restart decision, strategy
    async fn on_child_down(&mut self, idx: usize, reason: ExitReason) -> Option<ExitReason> {
        let old_placement = self.children[idx].placed.take()?;
        let child_id = self.children[idx].spec.id.clone();
        let policy = self.children[idx].spec.restart;
        info!(
            "Distributed supervisor {} observed child '{}' down on {}: {}",
            self.id, child_id, old_placement.node, reason
        );

        if reason == ExitReason::Noconnection {
            self.node_failure_restarts += 1;
        }

        let should_restart = match policy {
            RestartPolicy::Permanent => true,
            RestartPolicy::Transient => reason.is_abnormal(),
            RestartPolicy::Temporary => false,
        };
        if !should_restart {
            self.emit(DistSupervisorEvent::ChildTerminated {
                child_id,
                reason,
            });
            if self.strategy == Strategy::SimpleOneForOne || policy == RestartPolicy::Temporary {
                self.children.remove(idx);
            }
            return None;
        }

        if !self.window.record() {
            let intensity = self.window.intensity();
            error!(
                "Distributed supervisor {} exceeded restart intensity ({} within {:?})",
                self.id, intensity.max_restarts, intensity.within
            );
            return Some(ExitReason::error(format!(
                "max restarts exceeded: {} within {} ms",
                intensity.max_restarts,
                intensity.within.as_millis()
            )));
        }

        match self.strategy {
            Strategy::OneForOne | Strategy::SimpleOneForOne => {
                self.restart_one(idx, Some(old_placement.node)).await
            }
            Strategy::OneForAll => self.restart_from(0, idx, old_placement.node).await,
            Strategy::RestForOne => self.restart_from(idx, idx, old_placement.node).await,
        }
    }

    /// Respawn one child through the selector; a placement change fires
    /// `child_migrated`.
    async fn restart_one(&mut self, idx: usize, old_node: Option<NodeId>) -> Option<ExitReason> {
        loop {
            let spec = self.children[idx].spec.clone();
            match self.spawn_child(&spec, true).await {
                Ok(placed) => {
                    self.children[idx].restart_count += 1;
                    self.restarts += 1;
                    self.emit(DistSupervisorEvent::ChildRestarted {
                        child_id: spec.id.clone(),
                        server_ref: placed.server_ref.clone(),
                        node: placed.node.clone(),
                    });
                    if let Some(old_node) = &old_node {
                        if *old_node != placed.node {
                            info!(
                                "Child '{}' migrated from {} to {}",
                                spec.id, old_node, placed.node
                            );
                            self.emit(DistSupervisorEvent::ChildMigrated {
                                child_id: spec.id.clone(),
                                from: old_node.clone(),
                                to: placed.node.clone(),
                            });
                        }
                    }
                    self.children[idx].placed = Some(placed);
                    return None;
                }
                Err(e) => {
                    error!(
                        "Distributed supervisor {} failed to restart child '{}': {}",
                        self.id, spec.id, e
                    );
                    if !self.window.record() {
                        let intensity = self.window.intensity();
                        return Some(ExitReason::error(format!(
                            "max restarts exceeded: {} within {} ms",
                            intensity.max_restarts,
                            intensity.within.as_millis()
                        )));
                    }
                }
            }
        }
    }

    /// Stop children `[from..]` (reverse), then restart them in order.
    /// Children that were deliberately stopped before the failure stay
    /// stopped.
    async fn restart_from(
        &mut self,
        from: usize,
        dead_idx: usize,
        dead_node: NodeId,
    ) -> Option<ExitReason> {
        let mut to_restart: Vec<usize> = vec![dead_idx];
        for idx in (from..self.children.len()).rev() {
            if idx == dead_idx {
                continue;
            }
            if self.children[idx].placed.is_some() {
                self.stop_child(idx).await;
                to_restart.push(idx);
            }
        }

        to_restart.sort_unstable();
        for idx in to_restart {
            let old_node = if idx == dead_idx {
                Some(dead_node.clone())
            } else {
                None
            };
            if let Some(exit) = self.restart_one(idx, old_node).await {
                return Some(exit);
            }
        }
        None
    }

    /// Spawn a child on a freshly selected node and monitor it
    async fn spawn_child(&mut self, spec: &DistChildSpec, clear_stale: bool) -> ClusterResult<Placement> {
        // A previous incarnation's global name survives process death by
        // contract; clear it before respawning or the registration conflicts.
        if clear_stale && spec.registration == Registration::Global {
            if let Some(name) = &spec.name {
                let _ = self.cluster.global_registry().retract(name).await;
            }
        }

        let node = self.select_node(&spec.id).await?;
        let options = SpawnOptions {
            name: spec.name.clone(),
            registration: spec.registration,
            init_timeout: Duration::from_secs(5),
            timeout: self.cluster.config().spawn_timeout(),
        };
        let server_ref = self.cluster.spawn(&spec.behavior, &node, options).await?;

        let monitor = if node != *self.cluster.node_id() {
            match self
                .cluster
                .monitor(&self.agent_ref, &server_ref, None)
                .await
            {
                Ok(monitor) => Some(monitor),
                Err(e) => {
                    warn!(
                        "Failed to monitor child '{}' on {}: {}",
                        spec.id, node, e
                    );
                    let _ = self
                        .cluster
                        .stop_server(&server_ref, ExitReason::Shutdown)
                        .await;
                    return Err(e);
                }
            }
        } else {
            None
        };

        debug!("Placed child '{}' on {}", spec.id, node);
        Ok(Placement {
            node,
            server_ref,
            monitor,
        })
    }

    /// Stop a child wherever it runs, without triggering restart handling
    async fn stop_child(&mut self, idx: usize) {
        let placement = match self.children[idx].placed.take() {
            Some(placement) => placement,
            None => return,
        };
        if let Some(monitor) = &placement.monitor {
            let _ = self.cluster.demonitor(monitor).await;
        } else {
            self.expected_exits.insert(placement.server_ref.id);
        }
        let _ = self
            .cluster
            .stop_server(&placement.server_ref, ExitReason::Shutdown)
            .await;
    }

    async fn stop_all_children(&mut self) {
        for idx in (0..self.children.len()).rev() {
            self.stop_child(idx).await;
        }
    }

    /// Apply the node selector to the currently connected candidate set
    async fn select_node(&mut self, child_id: &str) -> ClusterResult<NodeId> {
        let candidates = self.cluster.selection_candidates().await;
        if candidates.is_empty() {
            return Err(ClusterError::NoAvailableNode);
        }
        let local = self.cluster.node_id().clone();

        match &self.selector {
            NodeSelector::LocalFirst => Ok(local),
            NodeSelector::RoundRobin => {
                let node = candidates[self.rr_index % candidates.len()].clone();
                self.rr_index += 1;
                Ok(node)
            }
            NodeSelector::LeastLoaded => {
                let mut best: Option<(NodeId, usize)> = None;
                for node in candidates {
                    let load = self.cluster.node_load(&node).await;
                    match &best {
                        Some((_, best_load)) if *best_load <= load => {}
                        _ => best = Some((node, load)),
                    }
                }
                best.map(|(node, _)| node).ok_or(ClusterError::NoAvailableNode)
            }
            NodeSelector::Random => {
                let idx = rand::thread_rng().gen_range(0..candidates.len());
                Ok(candidates[idx].clone())
            }
            NodeSelector::Node(node) => {
                if candidates.contains(node) {
                    Ok(node.clone())
                } else {
                    Err(ClusterError::NoAvailableNode)
                }
            }
            NodeSelector::Custom(select) => select(&candidates, child_id)
                .filter(|node| candidates.contains(node))
                .ok_or(ClusterError::NoAvailableNode),
        }
    }

    fn emit(&self, event: DistSupervisorEvent) {
        let _ = self.events_tx.send(event);
    }
}
