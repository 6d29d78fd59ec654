//! Remote monitors: unidirectional death notifications across nodes
//!
//! The monitoring side keeps outgoing entries, the monitored side keeps
//! incoming entries. Every `process_down` is delivered at most once per
//! monitor id: delivery happens only when the entry is atomically removed.

use crate::error::{ClusterError, ClusterResult};
use crate::message::{ClusterMessage, SerializedRef};
use crate::transport::Transport;
use axon_core::{ExitReason, InfoMessage, NodeId, Runtime, ServerId, ServerRef};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Handle returned by `monitor`, used to demonitor later
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorRef {
    pub monitor_id: Uuid,
    pub monitoring: ServerRef,
    pub monitored: ServerRef,
}

#[derive(Debug, Clone)]
struct OutgoingMonitor {
    monitoring_id: ServerId,
    monitored: ServerRef,
}

#[derive(Debug, Clone)]
struct IncomingMonitor {
    monitoring: ServerRef,
    monitored_id: ServerId,
}

/// Counters for the observability surface
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct MonitorStats {
    pub outgoing: usize,
    pub incoming: usize,
    pub downs_delivered: u64,
    pub downs_sent: u64,
}

pub struct MonitorManager {
    local: NodeId,
    transport: Arc<Transport>,
    runtime: Arc<Runtime>,
    setup_timeout: Duration,
    outgoing: RwLock<HashMap<Uuid, OutgoingMonitor>>,
    incoming: RwLock<HashMap<Uuid, IncomingMonitor>>,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<ClusterResult<()>>>>,
    downs_delivered: AtomicU64,
    downs_sent: AtomicU64,
}

impl MonitorManager {
    pub fn new(
        local: NodeId,
        transport: Arc<Transport>,
        runtime: Arc<Runtime>,
        setup_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            local,
            transport,
            runtime,
            setup_timeout,
            outgoing: RwLock::new(HashMap::new()),
            incoming: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            downs_delivered: AtomicU64::new(0),
            downs_sent: AtomicU64::new(0),
        })
    }

    /// Install a monitor from a local process onto a remote one.
    ///
    /// The entry is registered before the request goes out so a
    /// `process_down` racing the ack (the noproc case) still finds it.
    pub async fn monitor(
        &self,
        monitoring: &ServerRef,
        monitored: &ServerRef,
        timeout: Option<Duration>,
    ) -> ClusterResult<MonitorRef> {
        let target_node = monitored
            .node_id
            .clone()
            .ok_or_else(|| ClusterError::not_reachable("monitored ref has no node".to_string()))?;
        let timeout = timeout.unwrap_or(self.setup_timeout);

        let monitor_id = Uuid::new_v4();
        {
            let mut outgoing = self.outgoing.write().await;
            outgoing.insert(
                monitor_id,
                OutgoingMonitor {
                    monitoring_id: monitoring.id,
                    monitored: monitored.clone(),
                },
            );
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending.lock().await.insert(monitor_id, ack_tx);

        let request = ClusterMessage::MonitorRequest {
            monitor_id,
            monitoring: SerializedRef::from_ref(monitoring, &self.local),
            monitored: SerializedRef::from_ref(monitored, &self.local),
        };
        if let Err(e) = self.transport.send(&target_node, &request).await {
            self.abandon_setup(monitor_id).await;
            return Err(e);
        }

        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(Ok(()))) => Ok(MonitorRef {
                monitor_id,
                monitoring: monitoring.clone(),
                monitored: monitored.clone(),
            }),
            Ok(Ok(Err(e))) => {
                self.abandon_setup(monitor_id).await;
                Err(e)
            }
            Ok(Err(_)) => {
                self.abandon_setup(monitor_id).await;
                Err(ClusterError::ClusterNotStarted)
            }
            Err(_) => {
                self.abandon_setup(monitor_id).await;
                Err(ClusterError::RemoteMonitorTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Remove a monitor; the monitored node drops its incoming entry too
    pub async fn demonitor(&self, monitor_ref: &MonitorRef) -> ClusterResult<()> {
        let removed = {
            let mut outgoing = self.outgoing.write().await;
            outgoing.remove(&monitor_ref.monitor_id)
        };
        if let Some(entry) = removed {
            if let Some(node) = &entry.monitored.node_id {
                let _ = self
                    .transport
                    .send(
                        node,
                        &ClusterMessage::DemonitorRequest {
                            monitor_id: monitor_ref.monitor_id,
                        },
                    )
                    .await;
            }
        }
        Ok(())
    }

    /// Serve an inbound monitor_request on the monitored node.
    ///
    /// Erlang semantics: setup always "succeeds"; a dead target is reported
    /// with an immediate `process_down{noproc}` right after the ack.
    pub async fn handle_monitor_request(
        &self,
        from: NodeId,
        monitor_id: Uuid,
        monitoring: SerializedRef,
        monitored: SerializedRef,
    ) {
        let alive = self.runtime.is_running(monitored.id).await;
        if alive {
            let mut incoming = self.incoming.write().await;
            incoming.insert(
                monitor_id,
                IncomingMonitor {
                    monitoring: monitoring.to_ref(&self.local),
                    monitored_id: monitored.id,
                },
            );
        }

        let ack = ClusterMessage::MonitorAck {
            monitor_id,
            success: true,
            reason: None,
        };
        if let Err(e) = self.transport.send(&from, &ack).await {
            warn!("Failed to send monitor_ack to {}: {}", from, e);
            return;
        }

        if !alive {
            debug!(
                "Monitor {} targets dead process {}, reporting noproc",
                monitor_id, monitored.id
            );
            self.downs_sent.fetch_add(1, Ordering::Relaxed);
            let down = ClusterMessage::ProcessDown {
                monitor_id,
                monitored,
                reason: ExitReason::Noproc,
            };
            let _ = self.transport.send(&from, &down).await;
        }
    }

    /// Resolve a pending setup from an inbound monitor_ack
    pub async fn handle_monitor_ack(&self, monitor_id: Uuid, success: bool, reason: Option<String>) {
        let ack_tx = match self.pending.lock().await.remove(&monitor_id) {
            Some(tx) => tx,
            None => return,
        };
        let result = if success {
            Ok(())
        } else {
            Err(ClusterError::RemoteCallFailed(
                reason.unwrap_or_else(|| "monitor setup refused".to_string()),
            ))
        };
        let _ = ack_tx.send(result);
    }

    /// Drop an incoming entry on demonitor
    pub async fn handle_demonitor(&self, monitor_id: Uuid) {
        let mut incoming = self.incoming.write().await;
        incoming.remove(&monitor_id);
    }

    /// Deliver an inbound process_down to the monitoring process, at most
    /// once per monitor id.
    pub async fn handle_process_down(
        &self,
        monitor_id: Uuid,
        monitored: SerializedRef,
        reason: ExitReason,
    ) {
        let entry = {
            let mut outgoing = self.outgoing.write().await;
            outgoing.remove(&monitor_id)
        };
        let entry = match entry {
            Some(entry) => entry,
            None => {
                debug!("Dropping process_down for unknown monitor {}", monitor_id);
                return;
            }
        };

        self.downs_delivered.fetch_add(1, Ordering::Relaxed);
        self.runtime
            .send_info(
                entry.monitoring_id,
                InfoMessage::Down {
                    monitor_id,
                    from: monitored.to_ref(&self.local),
                    reason,
                },
            )
            .await;
    }

    /// Local process terminated: notify every monitoring node, then clear
    /// the entries. Outgoing monitors owned by the dead process go too.
    pub async fn on_local_terminate(&self, server_id: ServerId, reason: &ExitReason) {
        let notify: Vec<(Uuid, IncomingMonitor)> = {
            let mut incoming = self.incoming.write().await;
            let ids: Vec<Uuid> = incoming
                .iter()
                .filter(|(_, entry)| entry.monitored_id == server_id)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| incoming.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        for (monitor_id, entry) in notify {
            let node = match &entry.monitoring.node_id {
                Some(node) => node.clone(),
                None => continue,
            };
            self.downs_sent.fetch_add(1, Ordering::Relaxed);
            let down = ClusterMessage::ProcessDown {
                monitor_id,
                monitored: SerializedRef::new(server_id, self.local.clone()),
                reason: reason.clone(),
            };
            if let Err(e) = self.transport.send(&node, &down).await {
                debug!("Failed to send process_down to {}: {}", node, e);
            }
        }

        let mut outgoing = self.outgoing.write().await;
        outgoing.retain(|_, entry| entry.monitoring_id != server_id);
    }

    /// A peer node went down: synthesize `noconnection` for every outgoing
    /// monitor aimed at it, drop incoming monitors from it silently.
    pub async fn on_node_down(&self, node: &NodeId) {
        let lost: Vec<(Uuid, OutgoingMonitor)> = {
            let mut outgoing = self.outgoing.write().await;
            let ids: Vec<Uuid> = outgoing
                .iter()
                .filter(|(_, entry)| entry.monitored.node_id.as_ref() == Some(node))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| outgoing.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        for (monitor_id, entry) in lost {
            info!(
                "Monitor {} lost its node {}, delivering noconnection",
                monitor_id, node
            );
            self.downs_delivered.fetch_add(1, Ordering::Relaxed);
            self.runtime
                .send_info(
                    entry.monitoring_id,
                    InfoMessage::Down {
                        monitor_id,
                        from: entry.monitored.clone(),
                        reason: ExitReason::Noconnection,
                    },
                )
                .await;
        }

        let mut incoming = self.incoming.write().await;
        incoming.retain(|_, entry| entry.monitoring.node_id.as_ref() != Some(node));
    }

    /// Clear all state; used on cluster stop
    pub async fn reset(&self) {
        self.outgoing.write().await.clear();
        self.incoming.write().await.clear();
        let mut pending = self.pending.lock().await;
        for (_, ack_tx) in pending.drain() {
            let _ = ack_tx.send(Err(ClusterError::ClusterNotStarted));
        }
    }

    pub async fn get_stats(&self) -> MonitorStats {
        MonitorStats {
            outgoing: self.outgoing.read().await.len(),
            incoming: self.incoming.read().await.len(),
            downs_delivered: self.downs_delivered.load(Ordering::Relaxed),
            downs_sent: self.downs_sent.load(Ordering::Relaxed),
        }
    }

    async fn abandon_setup(&self, monitor_id: Uuid) {
        self.pending.lock().await.remove(&monitor_id);
        self.outgoing.write().await.remove(&monitor_id);
    }
}

impl std::fmt::Debug for MonitorManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorManager")
            .field("local", &self.local)
            .finish()
    }
}
