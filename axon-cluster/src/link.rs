//! Remote links: bidirectional exit propagation across nodes
//!
//! Each side stores its own half of a link, keyed by link id. Normal exits
//! silently remove the link on both sides; abnormal exits propagate as exit
//! signals, which the receiver delivers through the trap-exit rule. Node
//! loss delivers a local `noconnection` exit for every affected link.

use crate::error::{ClusterError, ClusterResult};
use crate::message::{ClusterMessage, SerializedRef};
use crate::transport::Transport;
use axon_core::{ExitReason, NodeId, Runtime, ServerId, ServerRef};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Handle returned by `link`, used to unlink later
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRef {
    pub link_id: Uuid,
    pub local: ServerRef,
    pub remote: ServerRef,
}

#[derive(Debug, Clone)]
struct LinkEntry {
    local_id: ServerId,
    remote: ServerRef,
}

/// Counters for the observability surface
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct LinkStats {
    pub active: usize,
    pub exit_signals_sent: u64,
    pub exit_signals_delivered: u64,
}

pub struct LinkManager {
    local: NodeId,
    transport: Arc<Transport>,
    runtime: Arc<Runtime>,
    setup_timeout: Duration,
    links: RwLock<HashMap<Uuid, LinkEntry>>,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<ClusterResult<()>>>>,
    exit_signals_sent: AtomicU64,
    exit_signals_delivered: AtomicU64,
}

impl LinkManager {
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
            links: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            exit_signals_sent: AtomicU64::new(0),
            exit_signals_delivered: AtomicU64::new(0),
        })
    }

    /// Link a local process to a remote one. The peer registers its half
    /// only if the target exists and is running.
    pub async fn link(
        &self,
        local_ref: &ServerRef,
        remote_ref: &ServerRef,
        timeout: Option<Duration>,
    ) -> ClusterResult<LinkRef> {
        let target_node = remote_ref
            .node_id
            .clone()
            .ok_or_else(|| ClusterError::not_reachable("remote ref has no node".to_string()))?;
        let timeout = timeout.unwrap_or(self.setup_timeout);

        let link_id = Uuid::new_v4();
        {
            let mut links = self.links.write().await;
            links.insert(
                link_id,
                LinkEntry {
                    local_id: local_ref.id,
                    remote: remote_ref.clone(),
                },
            );
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending.lock().await.insert(link_id, ack_tx);

        let request = ClusterMessage::LinkRequest {
            link_id,
            from: SerializedRef::from_ref(local_ref, &self.local),
            to: SerializedRef::from_ref(remote_ref, &self.local),
        };
        if let Err(e) = self.transport.send(&target_node, &request).await {
            self.abandon_setup(link_id).await;
            return Err(e);
        }

        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(Ok(()))) => Ok(LinkRef {
                link_id,
                local: local_ref.clone(),
                remote: remote_ref.clone(),
            }),
            Ok(Ok(Err(e))) => {
                self.abandon_setup(link_id).await;
                Err(e)
            }
            Ok(Err(_)) => {
                self.abandon_setup(link_id).await;
                Err(ClusterError::ClusterNotStarted)
            }
            Err(_) => {
                self.abandon_setup(link_id).await;
                Err(ClusterError::RemoteLinkTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Remove a link explicitly; both sides drop their halves, no ack
    pub async fn unlink(&self, link_ref: &LinkRef) -> ClusterResult<()> {
        let removed = {
            let mut links = self.links.write().await;
            links.remove(&link_ref.link_id)
        };
        if let Some(entry) = removed {
            if let Some(node) = &entry.remote.node_id {
                let _ = self
                    .transport
                    .send(
                        node,
                        &ClusterMessage::UnlinkRequest {
                            link_id: link_ref.link_id,
                        },
                    )
                    .await;
            }
        }
        Ok(())
    }

    /// Serve an inbound link_request on the target node
    pub async fn handle_link_request(
        &self,
        from_node: NodeId,
        link_id: Uuid,
        from: SerializedRef,
        to: SerializedRef,
    ) {
        let running = self.runtime.is_running(to.id).await;
        if running {
            let mut links = self.links.write().await;
            links.insert(
                link_id,
                LinkEntry {
                    local_id: to.id,
                    remote: from.to_ref(&self.local),
                },
            );
        }

        let ack = ClusterMessage::LinkAck {
            link_id,
            success: running,
            reason: if running {
                None
            } else {
                Some("noproc".to_string())
            },
        };
        if let Err(e) = self.transport.send(&from_node, &ack).await {
            warn!("Failed to send link_ack to {}: {}", from_node, e);
        }
    }

    /// Resolve a pending setup from an inbound link_ack
    pub async fn handle_link_ack(&self, link_id: Uuid, success: bool, reason: Option<String>) {
        let ack_tx = match self.pending.lock().await.remove(&link_id) {
            Some(tx) => tx,
            None => return,
        };
        let result = if success {
            Ok(())
        } else {
            Err(ClusterError::RemoteLinkRejected(
                reason.unwrap_or_else(|| "link refused".to_string()),
            ))
        };
        let _ = ack_tx.send(result);
    }

    /// Drop the local half on an inbound unlink_request
    pub async fn handle_unlink(&self, link_id: Uuid) {
        let mut links = self.links.write().await;
        links.remove(&link_id);
    }

    /// Deliver an inbound exit_signal through the trap-exit rule
    pub async fn handle_exit_signal(
        &self,
        link_id: Uuid,
        from: SerializedRef,
        to: SerializedRef,
        reason: ExitReason,
    ) {
        let entry = {
            let mut links = self.links.write().await;
            links.remove(&link_id)
        };
        if entry.is_none() {
            debug!("Dropping exit_signal for unknown link {}", link_id);
            return;
        }

        self.exit_signals_delivered.fetch_add(1, Ordering::Relaxed);
        info!(
            "Exit signal for {} from {}: {}",
            to.id,
            from,
            reason
        );
        self.runtime
            .exit_signal(to.id, from.to_ref(&self.local), reason)
            .await;
    }

    /// Local linked process terminated: propagate or silently unlink,
    /// removing the local halves immediately either way.
    pub async fn on_local_terminate(&self, server_id: ServerId, reason: &ExitReason) {
        let affected: Vec<(Uuid, LinkEntry)> = {
            let mut links = self.links.write().await;
            let ids: Vec<Uuid> = links
                .iter()
                .filter(|(_, entry)| entry.local_id == server_id)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| links.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        for (link_id, entry) in affected {
            let node = match &entry.remote.node_id {
                Some(node) => node.clone(),
                None => continue,
            };
            let message = if *reason == ExitReason::Normal {
                ClusterMessage::UnlinkRequest { link_id }
            } else {
                self.exit_signals_sent.fetch_add(1, Ordering::Relaxed);
                ClusterMessage::ExitSignal {
                    link_id,
                    from: SerializedRef::new(server_id, self.local.clone()),
                    to: SerializedRef::from_ref(&entry.remote, &self.local),
                    reason: reason.clone(),
                }
            };
            if let Err(e) = self.transport.send(&node, &message).await {
                debug!("Failed to propagate link teardown to {}: {}", node, e);
            }
        }
    }

    /// A peer node went down: every link to it collapses into a local
    /// `noconnection` exit for the linked process.
    pub async fn on_node_down(&self, node: &NodeId) {
        let lost: Vec<(Uuid, LinkEntry)> = {
            let mut links = self.links.write().await;
            let ids: Vec<Uuid> = links
                .iter()
                .filter(|(_, entry)| entry.remote.node_id.as_ref() == Some(node))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| links.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        for (link_id, entry) in lost {
            info!(
                "Link {} lost its node {}, delivering noconnection exit",
                link_id, node
            );
            self.exit_signals_delivered.fetch_add(1, Ordering::Relaxed);
            self.runtime
                .exit_signal(entry.local_id, entry.remote.clone(), ExitReason::Noconnection)
                .await;
        }
    }

    /// Clear all state; used on cluster stop
    pub async fn reset(&self) {
        self.links.write().await.clear();
        let mut pending = self.pending.lock().await;
        for (_, ack_tx) in pending.drain() {
            let _ = ack_tx.send(Err(ClusterError::ClusterNotStarted));
        }
    }

    pub async fn get_stats(&self) -> LinkStats {
        LinkStats {
            active: self.links.read().await.len(),
            exit_signals_sent: self.exit_signals_sent.load(Ordering::Relaxed),
            exit_signals_delivered: self.exit_signals_delivered.load(Ordering::Relaxed),
        }
    }

    async fn abandon_setup(&self, link_id: Uuid) {
        self.pending.lock().await.remove(&link_id);
        self.links.write().await.remove(&link_id);
    }
}

impl std::fmt::Debug for LinkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkManager")
            .field("local", &self.local)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ReconnectPolicy;
    use crate::serializer::MessageSerializer;
    use crate::transport::TransportSettings;
    use async_trait::async_trait;
    use axon_core::{Behavior, CoreResult, GenServerOptions, InfoMessage};

    struct Idle;

    #[async_trait]
    impl Behavior for Idle {}

    struct Recorder {
        seen: Arc<RwLock<Vec<InfoMessage>>>,
    }

    #[async_trait]
    impl Behavior for Recorder {
        async fn handle_info(&mut self, msg: InfoMessage) -> CoreResult<()> {
            self.seen.write().await.push(msg);
            Ok(())
        }
    }

    fn node(s: &str) -> NodeId {
        NodeId::parse(s).unwrap()
    }

    fn test_transport(local: &NodeId) -> Arc<Transport> {
        Transport::new(
            local.clone(),
            Arc::new(MessageSerializer::default()),
            TransportSettings {
                bind_host: "127.0.0.1".to_string(),
                port: local.port(),
                connect_timeout: Duration::from_secs(1),
                reconnect: ReconnectPolicy::default(),
            },
        )
    }

    struct Fixture {
        manager: Arc<LinkManager>,
        runtime: Arc<Runtime>,
        local: NodeId,
    }

    fn fixture() -> Fixture {
        let local = node("link@127.0.0.1:4311");
        let runtime = Runtime::new();
        let manager = LinkManager::new(
            local.clone(),
            test_transport(&local),
            runtime.clone(),
            Duration::from_secs(1),
        );
        Fixture {
            manager,
            runtime,
            local,
        }
    }

    async fn eventually<F, Fut>(what: &str, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..80 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition never held: {}", what);
    }

    #[tokio::test]
    async fn normal_exit_removes_links_without_signals() {
        let f = fixture();
        let dying = ServerId::new();
        let peer = node("peer@127.0.0.1:4312");
        for _ in 0..2 {
            f.manager.links.write().await.insert(
                Uuid::new_v4(),
                LinkEntry {
                    local_id: dying,
                    remote: ServerRef::remote(ServerId::new(), peer.clone()),
                },
            );
        }
        // A link owned by another local process survives.
        let other = ServerId::new();
        f.manager.links.write().await.insert(
            Uuid::new_v4(),
            LinkEntry {
                local_id: other,
                remote: ServerRef::remote(ServerId::new(), peer),
            },
        );

        f.manager.on_local_terminate(dying, &ExitReason::Normal).await;

        let stats = f.manager.get_stats().await;
        assert_eq!(stats.active, 1);
        assert_eq!(stats.exit_signals_sent, 0);
    }

    #[tokio::test]
    async fn abnormal_exit_propagates_exit_signals() {
        let f = fixture();
        let dying = ServerId::new();
        let peer = node("peer@127.0.0.1:4313");
        f.manager.links.write().await.insert(
            Uuid::new_v4(),
            LinkEntry {
                local_id: dying,
                remote: ServerRef::remote(ServerId::new(), peer),
            },
        );

        f.manager
            .on_local_terminate(dying, &ExitReason::error("boom"))
            .await;

        let stats = f.manager.get_stats().await;
        assert_eq!(stats.active, 0);
        assert_eq!(stats.exit_signals_sent, 1);
    }

    #[tokio::test]
    async fn exit_signal_for_unknown_link_is_ignored() {
        let f = fixture();
        let target = f
            .runtime
            .start(Idle, GenServerOptions::default())
            .await
            .unwrap();

        let from = SerializedRef::new(ServerId::new(), node("peer@127.0.0.1:4314"));
        let to = SerializedRef::new(target.id, f.local.clone());
        f.manager
            .handle_exit_signal(Uuid::new_v4(), from, to, ExitReason::error("boom"))
            .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(f.runtime.is_running(target.id).await);
    }

    #[tokio::test]
    async fn exit_signal_kills_non_trapping_target() {
        let f = fixture();
        let target = f
            .runtime
            .start(Idle, GenServerOptions::default())
            .await
            .unwrap();
        let peer = node("peer@127.0.0.1:4315");
        let remote = ServerRef::remote(ServerId::new(), peer.clone());

        let link_id = Uuid::new_v4();
        f.manager.links.write().await.insert(
            link_id,
            LinkEntry {
                local_id: target.id,
                remote: remote.clone(),
            },
        );

        f.manager
            .handle_exit_signal(
                link_id,
                SerializedRef::from_ref(&remote, &f.local),
                SerializedRef::new(target.id, f.local.clone()),
                ExitReason::error("boom"),
            )
            .await;

        eventually("target killed", || async {
            !f.runtime.is_running(target.id).await
        })
        .await;
        assert!(f.manager.links.read().await.is_empty());
    }

    #[tokio::test]
    async fn exit_signal_is_trapped_as_info() {
        let f = fixture();
        let seen = Arc::new(RwLock::new(Vec::new()));
        let target = f
            .runtime
            .start(
                Recorder { seen: seen.clone() },
                GenServerOptions::default().trap_exit(true),
            )
            .await
            .unwrap();
        let remote = ServerRef::remote(ServerId::new(), node("peer@127.0.0.1:4316"));

        let link_id = Uuid::new_v4();
        f.manager.links.write().await.insert(
            link_id,
            LinkEntry {
                local_id: target.id,
                remote: remote.clone(),
            },
        );

        f.manager
            .handle_exit_signal(
                link_id,
                SerializedRef::from_ref(&remote, &f.local),
                SerializedRef::new(target.id, f.local.clone()),
                ExitReason::error("boom"),
            )
            .await;

        eventually("signal trapped", || async {
            seen.read().await.iter().any(|msg| {
                matches!(
                    msg,
                    InfoMessage::ExitSignal { reason, .. } if reason.is_abnormal()
                )
            })
        })
        .await;
        assert!(f.runtime.is_running(target.id).await);
    }

    #[tokio::test]
    async fn node_down_delivers_local_noconnection() {
        let f = fixture();
        let seen = Arc::new(RwLock::new(Vec::new()));
        let target = f
            .runtime
            .start(
                Recorder { seen: seen.clone() },
                GenServerOptions::default().trap_exit(true),
            )
            .await
            .unwrap();

        let dead = node("dead@127.0.0.1:4317");
        let other = node("other@127.0.0.1:4318");
        f.manager.links.write().await.insert(
            Uuid::new_v4(),
            LinkEntry {
                local_id: target.id,
                remote: ServerRef::remote(ServerId::new(), dead.clone()),
            },
        );
        f.manager.links.write().await.insert(
            Uuid::new_v4(),
            LinkEntry {
                local_id: target.id,
                remote: ServerRef::remote(ServerId::new(), other),
            },
        );

        f.manager.on_node_down(&dead).await;

        eventually("noconnection exit", || async {
            seen.read().await.iter().any(|msg| {
                matches!(
                    msg,
                    InfoMessage::ExitSignal { reason, .. }
                        if *reason == ExitReason::Noconnection
                )
            })
        })
        .await;
        // Only links to the dead node collapse.
        assert_eq!(f.manager.links.read().await.len(), 1);
    }
}
