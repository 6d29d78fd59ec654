//! TCP transport: listener, peer connection map, routing, broadcast
//!
//! Inbound sockets identify themselves with their first envelope's `from`
//! field; a peer that is already connected wins over a new duplicate socket,
//! which keeps simultaneous dials deterministic on both sides.

use crate::connection::{
    configure_socket, Connection, ConnectionEvent, ConnectionStats, ReconnectPolicy,
};
use crate::error::{ClusterError, ClusterResult};
use crate::message::{ClusterMessage, NodeDownReason};
use crate::serializer::{Envelope, MessageSerializer};
use axon_core::NodeId;
use bytes::BytesMut;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 4096;
const IDENTIFICATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Events emitted by the transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Started,
    Stopped,
    ConnectionEstablished {
        node_id: NodeId,
    },
    ConnectionLost {
        node_id: NodeId,
        reason: NodeDownReason,
    },
    Message {
        envelope: Envelope,
        from: NodeId,
    },
    Error {
        message: String,
    },
}

/// Transport tuning knobs, derived from the cluster config
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub bind_host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

/// Per-peer stats snapshot
#[derive(Debug, Clone, serde::Serialize)]
pub struct PeerStats {
    pub node_id: String,
    pub connected: bool,
    pub outbound: bool,
    #[serde(flatten)]
    pub traffic: ConnectionStats,
}

pub struct Transport {
    local: NodeId,
    serializer: Arc<MessageSerializer>,
    settings: TransportSettings,
    peers: RwLock<HashMap<NodeId, Arc<Connection>>>,
    pending_dials: Mutex<HashMap<NodeId, Vec<oneshot::Sender<ClusterResult<()>>>>>,
    events_tx: broadcast::Sender<TransportEvent>,
    listener_task: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Transport {
    pub fn new(
        local: NodeId,
        serializer: Arc<MessageSerializer>,
        settings: TransportSettings,
    ) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            local,
            serializer,
            settings,
            peers: RwLock::new(HashMap::new()),
            pending_dials: Mutex::new(HashMap::new()),
            events_tx,
            listener_task: Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }

    pub fn local_node_id(&self) -> &NodeId {
        &self.local
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events_tx.subscribe()
    }

    /// Bind the listener and start accepting peers
    pub async fn start(self: &Arc<Self>) -> ClusterResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let bind_addr = format!("{}:{}", self.settings.bind_host, self.settings.port);
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            self.started.store(false, Ordering::SeqCst);
            ClusterError::Io(format!("failed to bind {}: {}", bind_addr, e))
        })?;
        info!("Transport for {} listening on {}", self.local, bind_addr);

        let transport = self.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!("Accepted connection from {}", addr);
                        let transport = transport.clone();
                        tokio::spawn(async move {
                            transport.handle_inbound(stream).await;
                        });
                    }
                    Err(e) => {
                        error!("Accept failed: {}", e);
                    }
                }
            }
        });
        *self.listener_task.lock().await = Some(task);

        self.emit(TransportEvent::Started);
        Ok(())
    }

    /// Close every connection and stop accepting. Idempotent.
    pub async fn stop(self: &Arc<Self>) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(task) = self.listener_task.lock().await.take() {
            task.abort();
        }

        let peers: Vec<Arc<Connection>> = {
            let mut peers = self.peers.write().await;
            peers.drain().map(|(_, conn)| conn).collect()
        };
        for conn in peers {
            conn.close().await;
        }

        let mut pending = self.pending_dials.lock().await;
        for (_, waiters) in pending.drain() {
            for waiter in waiters {
                let _ = waiter.send(Err(ClusterError::ClusterNotStarted));
            }
        }
        drop(pending);

        self.emit(TransportEvent::Stopped);
        info!("Transport for {} stopped", self.local);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Establish (or coalesce onto an in-flight dial of) a connection to a
    /// peer. Connecting to the local node is a no-op.
    pub async fn connect_to(self: &Arc<Self>, node: &NodeId) -> ClusterResult<()> {
        if !self.is_started() {
            return Err(ClusterError::ClusterNotStarted);
        }
        if *node == self.local {
            return Ok(());
        }
        {
            let peers = self.peers.read().await;
            if let Some(conn) = peers.get(node) {
                if conn.is_connected().await {
                    return Ok(());
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        let is_first = {
            let mut pending = self.pending_dials.lock().await;
            let waiters = pending.entry(node.clone()).or_default();
            waiters.push(tx);
            waiters.len() == 1
        };

        if is_first {
            let transport = self.clone();
            let node = node.clone();
            tokio::spawn(async move {
                transport.dial(node).await;
            });
        }

        rx.await
            .map_err(|_| ClusterError::not_reachable(node.to_string()))?
    }

    async fn dial(self: Arc<Self>, node: NodeId) {
        let (conn_events_tx, conn_events_rx) = mpsc::unbounded_channel();
        let conn = Connection::outbound(
            node.clone(),
            self.local.clone(),
            self.serializer.clone(),
            self.settings.reconnect.clone(),
            self.settings.connect_timeout,
            conn_events_tx,
        );

        let result = conn.connect().await;

        if result.is_ok() {
            let existing_connected = {
                let peers = self.peers.read().await;
                match peers.get(&node) {
                    Some(existing) => existing.is_connected().await,
                    None => false,
                }
            };
            if existing_connected {
                // An inbound connection raced us in; keep it.
                conn.destroy().await;
            } else {
                let previous = {
                    let mut peers = self.peers.write().await;
                    peers.insert(node.clone(), conn.clone())
                };
                if let Some(previous) = previous {
                    previous.destroy().await;
                }
                self.spawn_pump(node.clone(), conn_events_rx);
            }
        }

        let waiters = {
            let mut pending = self.pending_dials.lock().await;
            pending.remove(&node).unwrap_or_default()
        };
        let shared = result.map(|_| ());
        for waiter in waiters {
            let _ = waiter.send(shared.clone());
        }
    }

    /// Identify an accepted socket by its first frame and adopt it
    async fn handle_inbound(self: Arc<Self>, mut stream: TcpStream) {
        configure_socket(&stream);

        let mut buf = BytesMut::with_capacity(8 * 1024);
        let first = tokio::time::timeout(IDENTIFICATION_TIMEOUT, async {
            loop {
                if let Some(frame) = self.serializer.unframe(&mut buf)? {
                    return Ok::<Vec<u8>, ClusterError>(frame);
                }
                let n = stream.read_buf(&mut buf).await.map_err(ClusterError::from)?;
                if n == 0 {
                    return Err(ClusterError::Io("peer closed before identifying".into()));
                }
            }
        })
        .await;

        let frame = match first {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                debug!("Discarding inbound socket: {}", e);
                return;
            }
            Err(_) => {
                debug!("Discarding inbound socket: identification timed out");
                return;
            }
        };

        let envelope = match self.serializer.deserialize(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Rejecting inbound socket: {}", e);
                return;
            }
        };
        let peer = envelope.from.clone();
        if peer == self.local {
            debug!("Ignoring self-connection");
            return;
        }

        let adopted = {
            let mut peers = self.peers.write().await;
            let keep_existing = match peers.get(&peer) {
                Some(existing) => existing.is_connected().await,
                None => false,
            };
            if keep_existing {
                None
            } else {
                let (conn_events_tx, conn_events_rx) = mpsc::unbounded_channel();
                let conn = Connection::adopt(
                    peer.clone(),
                    self.local.clone(),
                    self.serializer.clone(),
                    stream,
                    buf,
                    conn_events_tx,
                )
                .await;
                let previous = peers.insert(peer.clone(), conn);
                Some((previous, conn_events_rx))
            }
        };

        match adopted {
            None => {
                // Duplicate-connection tiebreak: the connected peer entry
                // wins and the fresh socket is dropped on the floor.
                debug!("Discarding duplicate connection from {}", peer);
            }
            Some((previous, conn_events_rx)) => {
                if let Some(previous) = previous {
                    previous.destroy().await;
                }
                self.spawn_pump(peer.clone(), conn_events_rx);
                self.emit(TransportEvent::ConnectionEstablished {
                    node_id: peer.clone(),
                });
                self.emit(TransportEvent::Message {
                    envelope,
                    from: peer,
                });
            }
        }
    }

    /// Forward one connection's events into the transport event stream
    fn spawn_pump(
        self: &Arc<Self>,
        node: NodeId,
        mut events_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        let transport = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    ConnectionEvent::Connected => {
                        transport.emit(TransportEvent::ConnectionEstablished {
                            node_id: node.clone(),
                        });
                    }
                    ConnectionEvent::Message(envelope) => {
                        transport.emit(TransportEvent::Message {
                            envelope,
                            from: node.clone(),
                        });
                    }
                    ConnectionEvent::Disconnected { reason } => {
                        transport.emit(TransportEvent::ConnectionLost {
                            node_id: node.clone(),
                            reason,
                        });
                    }
                    ConnectionEvent::ReconnectFailed => {
                        transport.emit(TransportEvent::Error {
                            message: format!("gave up reconnecting to {}", node),
                        });
                        transport.remove_peer(&node).await;
                    }
                }
            }
        });
    }

    /// Send one message to one peer
    pub async fn send(&self, node: &NodeId, message: &ClusterMessage) -> ClusterResult<()> {
        let conn = {
            let peers = self.peers.read().await;
            peers.get(node).cloned()
        };
        match conn {
            Some(conn) => conn.send(message).await,
            None => Err(ClusterError::not_reachable(node.to_string())),
        }
    }

    /// Send to every connected peer, best-effort
    pub async fn broadcast(&self, message: &ClusterMessage) {
        let conns: Vec<Arc<Connection>> = {
            let peers = self.peers.read().await;
            peers.values().cloned().collect()
        };
        for conn in conns {
            if conn.is_connected().await {
                if let Err(e) = conn.send(message).await {
                    debug!("Broadcast to {} failed: {}", conn.peer(), e);
                }
            }
        }
    }

    pub async fn is_connected_to(&self, node: &NodeId) -> bool {
        let peers = self.peers.read().await;
        match peers.get(node) {
            Some(conn) => conn.is_connected().await,
            None => false,
        }
    }

    pub async fn connected_nodes(&self) -> Vec<NodeId> {
        let peers = self.peers.read().await;
        let mut nodes = Vec::new();
        for (node, conn) in peers.iter() {
            if conn.is_connected().await {
                nodes.push(node.clone());
            }
        }
        nodes
    }

    /// Deliberately drop a peer connection with no reconnect
    pub async fn disconnect_from(&self, node: &NodeId) {
        if let Some(conn) = self.remove_peer(node).await {
            conn.close().await;
            self.emit(TransportEvent::ConnectionLost {
                node_id: node.clone(),
                reason: NodeDownReason::ConnectionClosed,
            });
        }
    }

    /// Tear down a peer's socket (heartbeat timeout, graceful shutdown).
    /// With `allow_reconnect`, an outbound connection will redial on its own.
    pub async fn drop_connection(&self, node: &NodeId, reason: NodeDownReason, allow_reconnect: bool) {
        let conn = {
            let peers = self.peers.read().await;
            peers.get(node).cloned()
        };
        if let Some(conn) = conn {
            conn.interrupt(reason, allow_reconnect).await;
            if !allow_reconnect || !conn.is_outbound() {
                self.remove_peer(node).await;
            }
        }
    }

    async fn remove_peer(&self, node: &NodeId) -> Option<Arc<Connection>> {
        let mut peers = self.peers.write().await;
        peers.remove(node)
    }

    /// Per-peer traffic counters for the observability surface
    pub async fn get_stats(&self) -> Vec<PeerStats> {
        let peers = self.peers.read().await;
        let mut stats = Vec::with_capacity(peers.len());
        for (node, conn) in peers.iter() {
            stats.push(PeerStats {
                node_id: node.to_string(),
                connected: conn.is_connected().await,
                outbound: conn.is_outbound(),
                traffic: conn.stats(),
            });
        }
        stats
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event);
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("local", &self.local)
            .field("started", &self.is_started())
            .finish()
    }
}
