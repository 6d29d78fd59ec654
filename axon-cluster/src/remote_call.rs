//! Remote synchronous calls and fire-and-forget casts
//!
//! Calls correlate request and reply by a fresh call id. A pending entry's
//! terminal transition (reply, timeout, node-down rejection, reset) is
//! atomic: whichever path removes the entry first wins and every other path
//! is a no-op, so late replies are silently dropped.

use crate::error::{ClusterError, ClusterResult};
use crate::message::{CallErrorKind, CallOutcome, ClusterMessage};
use crate::transport::Transport;
use axon_core::{CoreError, NodeId, Runtime, ServerId, ServerRef};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

/// Counters for the observability surface
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RemoteCallStats {
    pub pending: usize,
    pub resolved: u64,
    pub rejected: u64,
    pub timed_out: u64,
    pub casts_sent: u64,
}

struct PendingCall {
    reply_tx: oneshot::Sender<ClusterResult<Value>>,
    target_node: NodeId,
}

pub struct RemoteCallManager {
    transport: Arc<Transport>,
    runtime: Arc<Runtime>,
    /// Deadline applied on the serving side while the local handler runs
    serve_timeout: Duration,
    pending: Mutex<HashMap<Uuid, PendingCall>>,
    resolved: AtomicU64,
    rejected: AtomicU64,
    timed_out: AtomicU64,
    casts_sent: AtomicU64,
}

impl RemoteCallManager {
    pub fn new(transport: Arc<Transport>, runtime: Arc<Runtime>, serve_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            transport,
            runtime,
            serve_timeout,
            pending: Mutex::new(HashMap::new()),
            resolved: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            casts_sent: AtomicU64::new(0),
        })
    }

    /// Call a process on a remote node and await its reply
    pub async fn call(
        &self,
        target: &ServerRef,
        node: &NodeId,
        msg: Value,
        timeout: Duration,
    ) -> ClusterResult<Value> {
        let call_id = Uuid::new_v4();
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(
                call_id,
                PendingCall {
                    reply_tx,
                    target_node: node.clone(),
                },
            );
        }

        let request = ClusterMessage::CallRequest {
            call_id,
            target_server_id: target.id,
            payload: msg,
        };
        if let Err(e) = self.transport.send(node, &request).await {
            self.take(call_id).await;
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => {
                match &result {
                    Ok(_) => self.resolved.fetch_add(1, Ordering::Relaxed),
                    Err(_) => self.rejected.fetch_add(1, Ordering::Relaxed),
                };
                result
            }
            Ok(Err(_)) => {
                // Resolver dropped without sending: cluster reset.
                self.rejected.fetch_add(1, Ordering::Relaxed);
                Err(ClusterError::ClusterNotStarted)
            }
            Err(_) => {
                self.take(call_id).await;
                self.timed_out.fetch_add(1, Ordering::Relaxed);
                Err(ClusterError::RemoteCallTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Fire-and-forget cast; silently dropped when the peer is unreachable
    pub async fn cast(&self, target: &ServerRef, node: &NodeId, msg: Value) {
        let message = ClusterMessage::Cast {
            target_server_id: target.id,
            payload: msg,
        };
        match self.transport.send(node, &message).await {
            Ok(()) => {
                self.casts_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                debug!("Dropping cast to {}: {}", node, e);
            }
        }
    }

    /// Serve an inbound `call_request` by delivering to the local process
    /// and replying with the outcome.
    pub async fn handle_request(
        self: &Arc<Self>,
        from: NodeId,
        call_id: Uuid,
        target_server_id: ServerId,
        payload: Value,
    ) {
        let manager = self.clone();
        tokio::spawn(async move {
            let outcome = match manager
                .runtime
                .call(target_server_id, payload, manager.serve_timeout)
                .await
            {
                Ok(value) => CallOutcome::Ok { value },
                Err(CoreError::ServerNotRunning(detail)) => CallOutcome::Error {
                    kind: CallErrorKind::ServerNotRunning,
                    message: detail,
                },
                Err(CoreError::CallTimeout { timeout_ms }) => CallOutcome::Error {
                    kind: CallErrorKind::Timeout,
                    message: format!("handler exceeded {} ms", timeout_ms),
                },
                Err(e) => CallOutcome::Error {
                    kind: CallErrorKind::HandlerError,
                    message: e.to_string(),
                },
            };

            let reply = ClusterMessage::CallReply {
                call_id,
                result: outcome,
            };
            if let Err(e) = manager.transport.send(&from, &reply).await {
                warn!("Failed to send call_reply to {}: {}", from, e);
            }
        });
    }

    /// Resolve a pending call from an inbound `call_reply`
    pub async fn handle_reply(&self, call_id: Uuid, result: CallOutcome) {
        let entry = match self.take(call_id).await {
            Some(entry) => entry,
            None => {
                debug!("Dropping late call_reply {}", call_id);
                return;
            }
        };

        let outcome = match result {
            CallOutcome::Ok { value } => Ok(value),
            CallOutcome::Error { kind, message } => Err(match kind {
                CallErrorKind::ServerNotRunning => ClusterError::RemoteServerNotRunning(message),
                CallErrorKind::Timeout | CallErrorKind::HandlerError => {
                    ClusterError::RemoteCallFailed(message)
                }
            }),
        };
        let _ = entry.reply_tx.send(outcome);
    }

    /// Serve an inbound cast
    pub async fn handle_cast(&self, target_server_id: ServerId, payload: Value) {
        let _ = self.runtime.cast(target_server_id, payload).await;
    }

    /// Reject every pending call aimed at a node that went down
    pub async fn on_node_down(&self, node: &NodeId) {
        let drained: Vec<(Uuid, PendingCall)> = {
            let mut pending = self.pending.lock().await;
            let ids: Vec<Uuid> = pending
                .iter()
                .filter(|(_, call)| &call.target_node == node)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|call| (id, call)))
                .collect()
        };

        for (call_id, call) in drained {
            debug!("Rejecting pending call {} to down node {}", call_id, node);
            // The awaiting caller records the rejection in the stats.
            let _ = call
                .reply_tx
                .send(Err(ClusterError::not_reachable(node.to_string())));
        }
    }

    /// Reject everything; used on cluster stop
    pub async fn reset(&self) {
        let mut pending = self.pending.lock().await;
        for (_, call) in pending.drain() {
            let _ = call.reply_tx.send(Err(ClusterError::ClusterNotStarted));
        }
    }

    pub async fn get_stats(&self) -> RemoteCallStats {
        RemoteCallStats {
            pending: self.pending.lock().await.len(),
            resolved: self.resolved.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            casts_sent: self.casts_sent.load(Ordering::Relaxed),
        }
    }

    async fn take(&self, call_id: Uuid) -> Option<PendingCall> {
        let mut pending = self.pending.lock().await;
        pending.remove(&call_id)
    }
}

impl std::fmt::Debug for RemoteCallManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCallManager").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ReconnectPolicy;
    use crate::serializer::MessageSerializer;
    use crate::transport::TransportSettings;
    use serde_json::json;

    fn node(s: &str) -> NodeId {
        NodeId::parse(s).unwrap()
    }

    // An unstarted transport: sends fail, which is all these tests need.
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

    fn manager() -> Arc<RemoteCallManager> {
        let local = node("caller@127.0.0.1:4101");
        RemoteCallManager::new(test_transport(&local), Runtime::new(), Duration::from_secs(1))
    }

    async fn insert_pending(
        manager: &RemoteCallManager,
        target: &NodeId,
    ) -> (Uuid, oneshot::Receiver<ClusterResult<Value>>) {
        let call_id = Uuid::new_v4();
        let (reply_tx, reply_rx) = oneshot::channel();
        manager.pending.lock().await.insert(
            call_id,
            PendingCall {
                reply_tx,
                target_node: target.clone(),
            },
        );
        (call_id, reply_rx)
    }

    #[tokio::test]
    async fn late_replies_are_dropped() {
        let manager = manager();
        manager
            .handle_reply(
                Uuid::new_v4(),
                CallOutcome::Ok { value: json!(1) },
            )
            .await;

        let stats = manager.get_stats().await;
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.resolved, 0);
    }

    #[tokio::test]
    async fn reply_resolution_is_terminal() {
        let manager = manager();
        let peer = node("peer@127.0.0.1:4102");
        let (call_id, reply_rx) = insert_pending(&manager, &peer).await;

        manager
            .handle_reply(call_id, CallOutcome::Ok { value: json!(42) })
            .await;
        assert_eq!(reply_rx.await.unwrap().unwrap(), json!(42));

        // The entry is gone; a second reply for the same id is a no-op.
        manager
            .handle_reply(call_id, CallOutcome::Ok { value: json!(43) })
            .await;
        assert_eq!(manager.get_stats().await.pending, 0);
    }

    #[tokio::test]
    async fn node_down_rejects_only_calls_to_that_node() {
        let manager = manager();
        let down = node("down@127.0.0.1:4103");
        let up = node("up@127.0.0.1:4104");
        let (_, down_rx) = insert_pending(&manager, &down).await;
        let (_, mut up_rx) = insert_pending(&manager, &up).await;

        manager.on_node_down(&down).await;

        assert!(matches!(
            down_rx.await.unwrap(),
            Err(ClusterError::NodeNotReachable(_))
        ));
        assert!(up_rx.try_recv().is_err());
        assert_eq!(manager.get_stats().await.pending, 1);
    }

    #[tokio::test]
    async fn error_outcomes_map_to_typed_errors() {
        let manager = manager();
        let peer = node("peer@127.0.0.1:4105");

        let (call_id, reply_rx) = insert_pending(&manager, &peer).await;
        manager
            .handle_reply(
                call_id,
                CallOutcome::Error {
                    kind: CallErrorKind::ServerNotRunning,
                    message: "gone".to_string(),
                },
            )
            .await;
        assert!(matches!(
            reply_rx.await.unwrap(),
            Err(ClusterError::RemoteServerNotRunning(_))
        ));

        let (call_id, reply_rx) = insert_pending(&manager, &peer).await;
        manager
            .handle_reply(
                call_id,
                CallOutcome::Error {
                    kind: CallErrorKind::HandlerError,
                    message: "boom".to_string(),
                },
            )
            .await;
        assert!(matches!(
            reply_rx.await.unwrap(),
            Err(ClusterError::RemoteCallFailed(_))
        ));
    }

    #[tokio::test]
    async fn reset_rejects_everything() {
        let manager = manager();
        let peer = node("peer@127.0.0.1:4106");
        let (_, rx1) = insert_pending(&manager, &peer).await;
        let (_, rx2) = insert_pending(&manager, &peer).await;

        manager.reset().await;

        assert!(matches!(
            rx1.await.unwrap(),
            Err(ClusterError::ClusterNotStarted)
        ));
        assert!(matches!(
            rx2.await.unwrap(),
            Err(ClusterError::ClusterNotStarted)
        ));
        assert_eq!(manager.get_stats().await.pending, 0);
    }

    #[tokio::test]
    async fn cast_to_unreachable_peer_is_silently_dropped() {
        let manager = manager();
        let peer = node("peer@127.0.0.1:4107");
        let target = ServerRef::remote(ServerId::new(), peer.clone());

        manager.cast(&target, &peer, json!("inc")).await;
        assert_eq!(manager.get_stats().await.casts_sent, 0);
    }
}
