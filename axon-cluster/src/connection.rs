//! A single TCP link to one peer node
//!
//! Owns the socket, the framed read loop, and the reconnect loop. Outbound
//! connections reconnect with exponential backoff and jitter after an
//! unexpected disconnect; adopted (inbound) connections never redial, the
//! initiating side owns that.

use crate::error::{ClusterError, ClusterResult};
use crate::message::{ClusterMessage, NodeDownReason};
use crate::serializer::{Envelope, MessageSerializer};
use axon_core::NodeId;
use bytes::BytesMut;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const READ_BUFFER_CAPACITY: usize = 8 * 1024;
const KEEPALIVE_TIME: Duration = Duration::from_secs(30);

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// Events surfaced to the transport's per-connection pump
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The link (re)entered the connected state
    Connected,
    /// One inbound envelope, delivered in frame order
    Message(Envelope),
    /// The link dropped
    Disconnected { reason: NodeDownReason },
    /// The reconnect loop gave up after its attempt limit
    ReconnectFailed,
}

/// Reconnect policy for outbound connections
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// 0 means unbounded
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: 0,
        }
    }
}

impl ReconnectPolicy {
    /// `min(base * 2^attempt, max)` scaled by jitter in [0.5, 1.5)
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let exp = base_ms.saturating_mul(1u64 << attempt.min(20)).min(max_ms);
        let jitter: f64 = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_millis((exp as f64 * jitter) as u64)
    }
}

/// Per-connection traffic counters
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ConnectionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
}

pub struct Connection {
    peer: NodeId,
    local: NodeId,
    serializer: Arc<MessageSerializer>,
    reconnect: ReconnectPolicy,
    connect_timeout: Duration,
    outbound: bool,
    state: RwLock<ConnectionState>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    reconnect_enabled: AtomicBool,
    reconnecting: AtomicBool,
    destroyed: AtomicBool,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// A dialing connection; call `connect` to establish it
    pub fn outbound(
        peer: NodeId,
        local: NodeId,
        serializer: Arc<MessageSerializer>,
        reconnect: ReconnectPolicy,
        connect_timeout: Duration,
        events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer,
            local,
            serializer,
            reconnect,
            connect_timeout,
            outbound: true,
            state: RwLock::new(ConnectionState::Disconnected),
            writer: Mutex::new(None),
            events_tx,
            reconnect_enabled: AtomicBool::new(true),
            reconnecting: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            read_task: Mutex::new(None),
        })
    }

    /// Take ownership of a socket the transport already accepted. The bytes
    /// left over after the identification frame stay in the read buffer.
    pub async fn adopt(
        peer: NodeId,
        local: NodeId,
        serializer: Arc<MessageSerializer>,
        stream: TcpStream,
        leftover: BytesMut,
        events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Arc<Self> {
        let conn = Arc::new(Self {
            peer,
            local,
            serializer,
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            outbound: false,
            state: RwLock::new(ConnectionState::Connected),
            writer: Mutex::new(None),
            events_tx,
            reconnect_enabled: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            read_task: Mutex::new(None),
        });

        let (read_half, write_half) = stream.into_split();
        *conn.writer.lock().await = Some(write_half);
        let task = tokio::spawn(read_loop(conn.clone(), read_half, leftover));
        *conn.read_task.lock().await = Some(task);
        conn
    }

    pub fn peer(&self) -> &NodeId {
        &self.peer
    }

    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    /// Dial the peer; resolves once connected
    pub async fn connect(self: &Arc<Self>) -> ClusterResult<()> {
        self.establish().await?;
        let _ = self.events_tx.send(ConnectionEvent::Connected);
        Ok(())
    }

    async fn establish(self: &Arc<Self>) -> ClusterResult<()> {
        {
            let mut state = self.state.write().await;
            *state = ConnectionState::Connecting;
        }

        let addr = self.peer.addr_string();
        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr)).await
        {
            Err(_) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ClusterError::not_reachable(format!(
                    "{}: connect timed out",
                    self.peer
                )));
            }
            Ok(Err(e)) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ClusterError::not_reachable(format!("{}: {}", self.peer, e)));
            }
            Ok(Ok(stream)) => stream,
        };

        configure_socket(&stream);
        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);

        let mut read_task = self.read_task.lock().await;
        if let Some(old) = read_task.take() {
            old.abort();
        }
        *read_task = Some(tokio::spawn(read_loop(
            self.clone(),
            read_half,
            BytesMut::with_capacity(READ_BUFFER_CAPACITY),
        )));
        drop(read_task);

        *self.state.write().await = ConnectionState::Connected;
        debug!("Connected to {}", self.peer);
        Ok(())
    }

    /// Frame, serialize, and write one message
    pub async fn send(self: &Arc<Self>, message: &ClusterMessage) -> ClusterResult<()> {
        if self.state().await != ConnectionState::Connected {
            return Err(ClusterError::not_reachable(self.peer.to_string()));
        }

        let bytes = self.serializer.serialize(message, &self.local)?;
        let framed = self.serializer.frame(&bytes)?;

        let mut writer = self.writer.lock().await;
        let write_half = writer
            .as_mut()
            .ok_or_else(|| ClusterError::not_reachable(self.peer.to_string()))?;
        if let Err(e) = write_half.write_all(&framed).await {
            drop(writer);
            warn!("Write to {} failed: {}", self.peer, e);
            self.handle_disconnect(NodeDownReason::ConnectionClosed).await;
            return Err(ClusterError::not_reachable(self.peer.to_string()));
        }
        drop(writer);

        self.bytes_sent
            .fetch_add(framed.len() as u64, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Flush and close; no reconnect will follow
    pub async fn close(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.reconnect_enabled.store(false, Ordering::SeqCst);
        *self.state.write().await = ConnectionState::Closing;

        if let Some(mut write_half) = self.writer.lock().await.take() {
            let _ = write_half.shutdown().await;
        }
        if let Some(task) = self.read_task.lock().await.take() {
            task.abort();
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Abort immediately without flushing
    pub async fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.reconnect_enabled.store(false, Ordering::SeqCst);
        if let Some(task) = self.read_task.lock().await.take() {
            task.abort();
        }
        *self.writer.lock().await = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Tear down the socket as if the peer vanished. Used by the heartbeat
    /// sweep; the reconnect loop still applies unless disabled first.
    pub async fn interrupt(self: &Arc<Self>, reason: NodeDownReason, allow_reconnect: bool) {
        if !allow_reconnect {
            self.reconnect_enabled.store(false, Ordering::SeqCst);
        }
        if let Some(task) = self.read_task.lock().await.take() {
            task.abort();
        }
        self.handle_disconnect(reason).await;
    }

    pub fn disable_reconnect(&self) {
        self.reconnect_enabled.store(false, Ordering::SeqCst);
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
        }
    }

    /// Idempotent transition to `Disconnected`, followed by the reconnect
    /// loop when this side owns redialing.
    fn handle_disconnect(
        self: &Arc<Self>,
        reason: NodeDownReason,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut state = self.state.write().await;
            if *state == ConnectionState::Disconnected {
                return;
            }
            *state = ConnectionState::Disconnected;
        }
        *self.writer.lock().await = None;

        info!("Connection to {} lost: {}", self.peer, reason);
        let _ = self
            .events_tx
            .send(ConnectionEvent::Disconnected { reason });

        let should_reconnect = self.outbound
            && self.reconnect_enabled.load(Ordering::SeqCst)
            && self
                .reconnecting
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok();
        if should_reconnect {
            let conn = self.clone();
            tokio::spawn(async move {
                conn.reconnect_loop().await;
            });
        }
        })
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        loop {
            if self.destroyed.load(Ordering::SeqCst)
                || !self.reconnect_enabled.load(Ordering::SeqCst)
            {
                break;
            }

            let delay = self.reconnect.delay_for_attempt(attempt);
            debug!(
                "Reconnect to {} in {:?} (attempt {})",
                self.peer,
                delay,
                attempt + 1
            );
            tokio::time::sleep(delay).await;

            if self.destroyed.load(Ordering::SeqCst)
                || !self.reconnect_enabled.load(Ordering::SeqCst)
            {
                break;
            }

            match self.establish().await {
                Ok(()) => {
                    info!("Reconnected to {}", self.peer);
                    let _ = self.events_tx.send(ConnectionEvent::Connected);
                    break;
                }
                Err(e) => {
                    debug!("Reconnect attempt to {} failed: {}", self.peer, e);
                    attempt += 1;
                    if self.reconnect.max_attempts > 0 && attempt >= self.reconnect.max_attempts {
                        warn!(
                            "Giving up reconnecting to {} after {} attempts",
                            self.peer, attempt
                        );
                        let _ = self.events_tx.send(ConnectionEvent::ReconnectFailed);
                        break;
                    }
                }
            }
        }
        self.reconnecting.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("outbound", &self.outbound)
            .finish()
    }
}

/// Enable TCP keep-alive so dead peers surface promptly, and disable Nagle
/// for control-message latency.
pub(crate) fn configure_socket(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let sock = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE_TIME);
    if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
        debug!("Failed to enable TCP keep-alive: {}", e);
    }
}

/// Read frames until the socket dies, emitting each envelope in order
async fn read_loop(conn: Arc<Connection>, mut reader: OwnedReadHalf, mut buf: BytesMut) {
    loop {
        loop {
            match conn.serializer.unframe(&mut buf) {
                Ok(Some(frame)) => match conn.serializer.deserialize(&frame) {
                    Ok(envelope) => {
                        conn.messages_received.fetch_add(1, Ordering::Relaxed);
                        let _ = conn.events_tx.send(ConnectionEvent::Message(envelope));
                    }
                    Err(e) => {
                        // Bad or unauthenticated bytes kill the connection.
                        warn!("Dropping connection to {}: {}", conn.peer, e);
                        conn.handle_disconnect(NodeDownReason::ConnectionClosed).await;
                        return;
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("Framing error from {}: {}", conn.peer, e);
                    conn.handle_disconnect(NodeDownReason::ConnectionClosed).await;
                    return;
                }
            }
        }

        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                conn.handle_disconnect(NodeDownReason::ConnectionClosed).await;
                return;
            }
            Ok(n) => {
                conn.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(e) => {
                debug!("Read from {} failed: {}", conn.peer, e);
                conn.handle_disconnect(NodeDownReason::ConnectionClosed).await;
                return;
            }
        }
    }
}
