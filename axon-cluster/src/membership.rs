//! Cluster membership: seed dialing, heartbeats, miss detection
//!
//! Membership is best-effort gossip over direct peer links. Each node
//! heartbeats every connected peer; a peer that misses enough heartbeats is
//! declared down with `heartbeat_timeout` and its connection is torn down,
//! which hands retry ownership to the reconnect loop.

use crate::error::ClusterResult;
use crate::message::{ClusterMessage, NodeDownReason};
use crate::transport::{Transport, TransportEvent};
use axon_core::{NodeId, Runtime};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Node status as tracked by membership
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// Point-in-time view of one peer
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub status: NodeStatus,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub process_count: usize,
    pub uptime_ms: u64,
}

/// Membership events
#[derive(Debug, Clone)]
pub enum MembershipEvent {
    NodeUp {
        node_id: NodeId,
    },
    NodeDown {
        node_id: NodeId,
        reason: NodeDownReason,
    },
    StatusChange {
        node_id: NodeId,
        status: NodeStatus,
    },
}

struct NodeEntry {
    status: NodeStatus,
    last_heartbeat: Option<Instant>,
    last_heartbeat_wall: Option<DateTime<Utc>>,
    process_count: usize,
    uptime_ms: u64,
    /// Reconnect is suppressed after a peer's graceful shutdown
    suppress_reconnect: bool,
}

impl NodeEntry {
    fn new(status: NodeStatus) -> Self {
        Self {
            status,
            last_heartbeat: None,
            last_heartbeat_wall: None,
            process_count: 0,
            uptime_ms: 0,
            suppress_reconnect: false,
        }
    }
}

pub struct Membership {
    local: NodeId,
    transport: Arc<Transport>,
    runtime: Arc<Runtime>,
    heartbeat_interval: Duration,
    miss_threshold: u32,
    seeds: Vec<NodeId>,
    nodes: RwLock<HashMap<NodeId, NodeEntry>>,
    events_tx: broadcast::Sender<MembershipEvent>,
    started_at: Instant,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Membership {
    pub fn new(
        local: NodeId,
        transport: Arc<Transport>,
        runtime: Arc<Runtime>,
        heartbeat_interval: Duration,
        miss_threshold: u32,
        seeds: Vec<NodeId>,
    ) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            local,
            transport,
            runtime,
            heartbeat_interval,
            miss_threshold,
            seeds,
            nodes: RwLock::new(HashMap::new()),
            events_tx,
            started_at: Instant::now(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events_tx.subscribe()
    }

    /// Watch transport events, heartbeat peers, sweep for misses, dial seeds
    pub async fn start(self: &Arc<Self>) -> ClusterResult<()> {
        let mut tasks = self.tasks.lock().await;

        // Transport events drive the status machine.
        let membership = self.clone();
        let mut transport_events = self.transport.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                match transport_events.recv().await {
                    Ok(TransportEvent::ConnectionEstablished { node_id }) => {
                        membership.mark_connected(&node_id).await;
                    }
                    Ok(TransportEvent::ConnectionLost { node_id, reason }) => {
                        membership.mark_disconnected(&node_id, reason).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Membership lagged {} transport events", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        // Outbound heartbeats.
        let membership = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(membership.heartbeat_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let heartbeat = ClusterMessage::Heartbeat {
                    process_count: membership.runtime.process_count().await,
                    uptime_ms: membership.started_at.elapsed().as_millis() as u64,
                };
                membership.transport.broadcast(&heartbeat).await;
            }
        }));

        // Miss detection sweep, plus seed redial for nodes that never came up.
        let membership = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(membership.heartbeat_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                membership.sweep().await;
                membership.redial_seeds().await;
            }
        }));
        drop(tasks);

        // Initial seed dial.
        for seed in self.seeds.clone() {
            if seed == self.local {
                continue;
            }
            self.set_status(&seed, NodeStatus::Connecting).await;
            let membership = self.clone();
            tokio::spawn(async move {
                if let Err(e) = membership.transport.connect_to(&seed).await {
                    warn!("Seed {} not reachable: {}", seed, e);
                }
            });
        }

        Ok(())
    }

    pub async fn stop(&self) {
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    /// Record an inbound heartbeat. A heartbeat from a peer we had marked
    /// disconnected proves the link is alive again.
    pub async fn handle_heartbeat(&self, from: &NodeId, process_count: usize, uptime_ms: u64) {
        let recovered = {
            let mut nodes = self.nodes.write().await;
            let entry = nodes
                .entry(from.clone())
                .or_insert_with(|| NodeEntry::new(NodeStatus::Connected));
            entry.last_heartbeat = Some(Instant::now());
            entry.last_heartbeat_wall = Some(Utc::now());
            entry.process_count = process_count;
            entry.uptime_ms = uptime_ms;
            let recovered = entry.status != NodeStatus::Connected;
            entry.status = NodeStatus::Connected;
            recovered
        };
        if recovered {
            info!("Node up (heartbeat): {}", from);
            self.emit(MembershipEvent::StatusChange {
                node_id: from.clone(),
                status: NodeStatus::Connected,
            });
            self.emit(MembershipEvent::NodeUp {
                node_id: from.clone(),
            });
        }
    }

    /// A peer announced it is going down (graceful shutdown): suppress the
    /// reconnect loop and mark it disconnected.
    pub async fn handle_node_down_message(&self, node_id: &NodeId, reason: NodeDownReason) {
        info!("Peer {} announced node_down: {}", node_id, reason);
        {
            let mut nodes = self.nodes.write().await;
            let entry = nodes
                .entry(node_id.clone())
                .or_insert_with(|| NodeEntry::new(NodeStatus::Connected));
            entry.suppress_reconnect = true;
        }
        self.transport
            .drop_connection(node_id, reason, false)
            .await;
    }

    pub async fn get_status(&self, node_id: &NodeId) -> Option<NodeStatus> {
        let nodes = self.nodes.read().await;
        nodes.get(node_id).map(|entry| entry.status)
    }

    pub async fn get_nodes(&self) -> Vec<NodeInfo> {
        let nodes = self.nodes.read().await;
        nodes
            .iter()
            .map(|(node_id, entry)| NodeInfo {
                node_id: node_id.clone(),
                status: entry.status,
                last_heartbeat_at: entry.last_heartbeat_wall,
                process_count: entry.process_count,
                uptime_ms: entry.uptime_ms,
            })
            .collect()
    }

    pub async fn get_connected_nodes(&self) -> Vec<NodeId> {
        let nodes = self.nodes.read().await;
        nodes
            .iter()
            .filter(|(_, entry)| entry.status == NodeStatus::Connected)
            .map(|(node_id, _)| node_id.clone())
            .collect()
    }

    async fn mark_connected(&self, node_id: &NodeId) {
        let changed = {
            let mut nodes = self.nodes.write().await;
            let entry = nodes
                .entry(node_id.clone())
                .or_insert_with(|| NodeEntry::new(NodeStatus::Connecting));
            let changed = entry.status != NodeStatus::Connected;
            entry.status = NodeStatus::Connected;
            entry.last_heartbeat = Some(Instant::now());
            entry.last_heartbeat_wall = Some(Utc::now());
            entry.suppress_reconnect = false;
            changed
        };
        if changed {
            info!("Node up: {}", node_id);
            self.emit(MembershipEvent::StatusChange {
                node_id: node_id.clone(),
                status: NodeStatus::Connected,
            });
            self.emit(MembershipEvent::NodeUp {
                node_id: node_id.clone(),
            });
        }
    }

    async fn mark_disconnected(&self, node_id: &NodeId, reason: NodeDownReason) {
        let changed = {
            let mut nodes = self.nodes.write().await;
            match nodes.get_mut(node_id) {
                Some(entry) => {
                    let changed = entry.status != NodeStatus::Disconnected;
                    entry.status = NodeStatus::Disconnected;
                    changed
                }
                None => false,
            }
        };
        if changed {
            warn!("Node down: {} ({})", node_id, reason);
            self.emit(MembershipEvent::StatusChange {
                node_id: node_id.clone(),
                status: NodeStatus::Disconnected,
            });
            self.emit(MembershipEvent::NodeDown {
                node_id: node_id.clone(),
                reason,
            });
        }
    }

    async fn set_status(&self, node_id: &NodeId, status: NodeStatus) {
        let mut nodes = self.nodes.write().await;
        nodes
            .entry(node_id.clone())
            .or_insert_with(|| NodeEntry::new(status))
            .status = status;
    }

    /// Declare peers dead after `interval * miss_threshold` of silence
    async fn sweep(&self) {
        let cutoff = self.heartbeat_interval * self.miss_threshold;
        let stale: Vec<NodeId> = {
            let nodes = self.nodes.read().await;
            nodes
                .iter()
                .filter(|(_, entry)| {
                    entry.status == NodeStatus::Connected
                        && match entry.last_heartbeat {
                            Some(at) => at.elapsed() > cutoff,
                            None => false,
                        }
                })
                .map(|(node_id, _)| node_id.clone())
                .collect()
        };

        for node_id in stale {
            warn!("Heartbeat timeout for {}", node_id);
            // Tearing the connection down emits ConnectionLost, which the
            // watcher translates into the NodeDown event.
            self.transport
                .drop_connection(&node_id, NodeDownReason::HeartbeatTimeout, true)
                .await;
        }
    }

    /// Keep trying seeds that are not currently connected
    async fn redial_seeds(&self) {
        for seed in &self.seeds {
            if *seed == self.local {
                continue;
            }
            let suppressed = {
                let nodes = self.nodes.read().await;
                nodes
                    .get(seed)
                    .map(|entry| entry.suppress_reconnect)
                    .unwrap_or(false)
            };
            if suppressed || self.transport.is_connected_to(seed).await {
                continue;
            }
            debug!("Redialing seed {}", seed);
            let transport = self.transport.clone();
            let seed = seed.clone();
            tokio::spawn(async move {
                let _ = transport.connect_to(&seed).await;
            });
        }
    }

    fn emit(&self, event: MembershipEvent) {
        let _ = self.events_tx.send(event);
    }
}

impl std::fmt::Debug for Membership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Membership")
            .field("local", &self.local)
            .finish()
    }
}
