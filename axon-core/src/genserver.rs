//! GenServer runtime: single-writer processes with sequential mailbox dispatch
//!
//! Each process owns a behavior and a FIFO mailbox. At most one handler runs
//! per process at a time; messages are processed strictly in enqueue order.
//! Suspension points occur only at handler boundaries, so every handler
//! observes a consistent state snapshot for its whole execution.

use crate::error::{CoreError, CoreResult};
use crate::events::{EventBus, LifecycleEvent};
use crate::registry::LocalRegistry;
use crate::types::{ExitReason, InfoMessage, ServerId, ServerRef};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tracing::{debug, error, warn};

/// Default deadline for a behavior's `init` callback
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default deadline for synchronous calls
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// The capability set a GenServer process exposes.
///
/// The implementing type owns the process state; the runtime's single-writer
/// loop guarantees handlers never run concurrently, so plain `&mut self`
/// mutation is race-free.
#[async_trait]
pub trait Behavior: Send + 'static {
    /// Called once before the process enters the running state. Failing or
    /// timing out here fails the whole `start` call.
    async fn init(&mut self) -> CoreResult<()> {
        Ok(())
    }

    /// Handle a synchronous call and produce the reply
    async fn handle_call(&mut self, msg: Value) -> CoreResult<Value> {
        warn!("Unhandled call: {:?}", msg);
        Ok(Value::Null)
    }

    /// Handle an asynchronous cast
    async fn handle_cast(&mut self, msg: Value) -> CoreResult<()> {
        warn!("Unhandled cast: {:?}", msg);
        Ok(())
    }

    /// Handle out-of-band messages: exit signals, monitor notifications,
    /// name-conflict signals, and plain messages
    async fn handle_info(&mut self, msg: InfoMessage) -> CoreResult<()> {
        debug!("Unhandled info: {:?}", msg);
        Ok(())
    }

    /// Called on the way down, best-effort, before cleanup completes
    async fn terminate(&mut self, _reason: &ExitReason) {}
}

/// Options for starting a GenServer process
#[derive(Debug, Clone)]
pub struct GenServerOptions {
    /// Register the process under this local name at start
    pub name: Option<String>,
    /// Deliver incoming exit signals as `InfoMessage::ExitSignal` instead of
    /// terminating the process
    pub trap_exit: bool,
    /// Deadline for the `init` callback
    pub init_timeout: Duration,
}

impl Default for GenServerOptions {
    fn default() -> Self {
        Self {
            name: None,
            trap_exit: false,
            init_timeout: DEFAULT_INIT_TIMEOUT,
        }
    }
}

impl GenServerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn trap_exit(mut self, trap: bool) -> Self {
        self.trap_exit = trap;
        self
    }

    pub fn init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }
}

/// Process status. `Stopped` is terminal; ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Initializing,
    Running,
    Stopping,
    Stopped,
}

/// Point-in-time statistics snapshot for one process
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub server_id: ServerId,
    pub name: Option<String>,
    pub status: ServerStatus,
    pub started_at: DateTime<Utc>,
    pub message_count: u64,
    pub queue_size: usize,
    pub last_message_at: Option<DateTime<Utc>>,
}

/// Hook invoked during process termination, before the `Terminated`
/// lifecycle event is emitted. The cluster fabric registers hooks here so
/// links, monitors, and registrations are cleared first.
#[async_trait]
pub trait TerminationHook: Send + Sync {
    async fn on_terminate(&self, server_id: ServerId, reason: &ExitReason);
}

/// Mailbox envelope
enum Envelope {
    Call {
        msg: Value,
        reply_tx: oneshot::Sender<CoreResult<Value>>,
    },
    Cast {
        msg: Value,
    },
    Info {
        msg: InfoMessage,
    },
    Stop {
        reason: ExitReason,
    },
}

/// Out-of-band signals that preempt the mailbox
enum ControlSignal {
    Kill { reason: ExitReason },
}

struct ProcessHandle {
    server_id: ServerId,
    name: Option<String>,
    trap_exit: bool,
    mailbox: mpsc::UnboundedSender<Envelope>,
    control: mpsc::UnboundedSender<ControlSignal>,
    status: RwLock<ServerStatus>,
    started_at: DateTime<Utc>,
    message_count: AtomicU64,
    queue_size: AtomicUsize,
    // Milliseconds since epoch; 0 means no message processed yet.
    last_message_at_ms: AtomicI64,
    done_rx: watch::Receiver<bool>,
}

impl ProcessHandle {
    fn enqueue(&self, envelope: Envelope) -> CoreResult<()> {
        self.queue_size.fetch_add(1, Ordering::Relaxed);
        self.mailbox.send(envelope).map_err(|_| {
            self.queue_size.fetch_sub(1, Ordering::Relaxed);
            CoreError::server_not_running(self.server_id.to_string())
        })
    }

    fn note_dequeue(&self) {
        self.queue_size.fetch_sub(1, Ordering::Relaxed);
        self.message_count.fetch_add(1, Ordering::Relaxed);
        self.last_message_at_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    async fn stats(&self) -> ServerStats {
        let last_ms = self.last_message_at_ms.load(Ordering::Relaxed);
        ServerStats {
            server_id: self.server_id,
            name: self.name.clone(),
            status: *self.status.read().await,
            started_at: self.started_at,
            message_count: self.message_count.load(Ordering::Relaxed),
            queue_size: self.queue_size.load(Ordering::Relaxed),
            last_message_at: (last_ms > 0)
                .then(|| Utc.timestamp_millis_opt(last_ms).single())
                .flatten(),
        }
    }
}

/// The process table and dispatch machinery for one node.
///
/// Owns every local GenServer, the local name registry, and the lifecycle
/// event bus. The cluster fabric holds an `Arc<Runtime>` and builds its
/// remote semantics on these primitives.
pub struct Runtime {
    processes: RwLock<HashMap<ServerId, Arc<ProcessHandle>>>,
    registry: LocalRegistry,
    events: EventBus,
    hooks: RwLock<Vec<Arc<dyn TerminationHook>>>,
}

impl Runtime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            processes: RwLock::new(HashMap::new()),
            registry: LocalRegistry::new(),
            events: EventBus::new(),
            hooks: RwLock::new(Vec::new()),
        })
    }

    /// Start a GenServer process from a behavior value
    pub async fn start<B: Behavior>(
        self: &Arc<Self>,
        behavior: B,
        options: GenServerOptions,
    ) -> CoreResult<ServerRef> {
        self.start_boxed(Box::new(behavior), options).await
    }

    /// Start a GenServer process from an already boxed behavior.
    ///
    /// Runs `init` under the configured deadline; on failure or timeout the
    /// process never existed as far as observers are concerned (no process
    /// table entry, no name binding, no `Started` event).
    pub async fn start_boxed(
        self: &Arc<Self>,
        mut behavior: Box<dyn Behavior>,
        options: GenServerOptions,
    ) -> CoreResult<ServerRef> {
        let server_id = ServerId::new();
        let server_ref = ServerRef::local(server_id);

        if let Some(name) = &options.name {
            self.registry.register(name, server_ref.clone()).await?;
        }

        let init_result =
            tokio::time::timeout(options.init_timeout, AssertUnwindSafe(behavior.init()).catch_unwind())
                .await;
        let init_error = match init_result {
            Err(_) => Some(CoreError::InitTimeout {
                timeout_ms: options.init_timeout.as_millis() as u64,
            }),
            Ok(Err(_)) => Some(CoreError::init_failed("init panicked")),
            Ok(Ok(Err(e))) => Some(CoreError::init_failed(e.to_string())),
            Ok(Ok(Ok(()))) => None,
        };
        if let Some(err) = init_error {
            if let Some(name) = &options.name {
                let _ = self.registry.unregister(name).await;
            }
            return Err(err);
        }

        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = watch::channel(false);

        let handle = Arc::new(ProcessHandle {
            server_id,
            name: options.name.clone(),
            trap_exit: options.trap_exit,
            mailbox: mailbox_tx,
            control: control_tx,
            status: RwLock::new(ServerStatus::Running),
            started_at: Utc::now(),
            message_count: AtomicU64::new(0),
            queue_size: AtomicUsize::new(0),
            last_message_at_ms: AtomicI64::new(0),
            done_rx,
        });

        {
            let mut processes = self.processes.write().await;
            processes.insert(server_id, handle.clone());
        }

        let runtime = self.clone();
        tokio::spawn(run_loop(runtime, behavior, handle, mailbox_rx, control_rx, done_tx));

        debug!(
            "Started GenServer {} ({})",
            server_id,
            options.name.as_deref().unwrap_or("unnamed")
        );
        self.events.emit(LifecycleEvent::Started {
            server_id,
            name: options.name,
        });

        Ok(server_ref)
    }

    /// Synchronous call: enqueue, await the handler's reply
    pub async fn call(
        &self,
        server_id: ServerId,
        msg: Value,
        timeout: Duration,
    ) -> CoreResult<Value> {
        let handle = self.running_handle(server_id).await?;

        let (reply_tx, reply_rx) = oneshot::channel();
        handle.enqueue(Envelope::Call { msg, reply_tx })?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Err(_) => Err(CoreError::CallTimeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
            Ok(Err(_)) => Err(CoreError::Terminated(format!(
                "server {} exited before replying",
                server_id
            ))),
            Ok(Ok(result)) => result,
        }
    }

    /// Asynchronous cast: enqueue and return. Casts to processes that do not
    /// exist (anymore) are silently dropped.
    pub async fn cast(&self, server_id: ServerId, msg: Value) -> CoreResult<()> {
        match self.running_handle(server_id).await {
            Ok(handle) => {
                let _ = handle.enqueue(Envelope::Cast { msg });
            }
            Err(_) => {
                debug!("Dropping cast to non-running server {}", server_id);
            }
        }
        Ok(())
    }

    /// Deliver an info message; silently dropped if the target is gone
    pub async fn send_info(&self, server_id: ServerId, msg: InfoMessage) {
        if let Ok(handle) = self.running_handle(server_id).await {
            let _ = handle.enqueue(Envelope::Info { msg });
        } else {
            debug!("Dropping info message to non-running server {}", server_id);
        }
    }

    /// Orderly stop: a shutdown message is enqueued behind pending mail and
    /// the call returns once the process has fully terminated.
    pub async fn stop(&self, server_id: ServerId, reason: ExitReason) -> CoreResult<()> {
        self.stop_with_timeout(server_id, reason, None).await.map(|_| ())
    }

    /// Orderly stop with a deadline. Returns `Ok(false)` if the process did
    /// not terminate in time (the caller may then `kill` it).
    pub async fn stop_with_timeout(
        &self,
        server_id: ServerId,
        reason: ExitReason,
        timeout: Option<Duration>,
    ) -> CoreResult<bool> {
        let handle = match self.handle(server_id).await {
            Some(handle) => handle,
            None => return Ok(true), // already gone
        };
        let _ = handle.enqueue(Envelope::Stop { reason });

        let mut done_rx = handle.done_rx.clone();
        drop(handle);
        let wait = async move {
            while !*done_rx.borrow() {
                if done_rx.changed().await.is_err() {
                    break;
                }
            }
        };

        match timeout {
            None => {
                wait.await;
                Ok(true)
            }
            Some(deadline) => Ok(tokio::time::timeout(deadline, wait).await.is_ok()),
        }
    }

    /// Forceful termination: preempts the mailbox via the control channel.
    /// Pending messages are discarded; `terminate` still runs best-effort.
    pub async fn kill(&self, server_id: ServerId, reason: ExitReason) {
        if let Some(handle) = self.handle(server_id).await {
            let _ = handle.control.send(ControlSignal::Kill { reason });
        }
    }

    /// Deliver an exit signal (from a linked process) using the trap rule:
    /// trapping processes receive it as info, everything else is killed
    /// unless the reason is `Normal`.
    pub async fn exit_signal(&self, server_id: ServerId, from: ServerRef, reason: ExitReason) {
        let handle = match self.handle(server_id).await {
            Some(handle) => handle,
            None => return,
        };
        if handle.trap_exit {
            let _ = handle.enqueue(Envelope::Info {
                msg: InfoMessage::ExitSignal { from, reason },
            });
        } else if reason != ExitReason::Normal {
            let _ = handle.control.send(ControlSignal::Kill { reason });
        }
    }

    /// Block until the process has fully terminated (no-op if already gone)
    pub async fn wait_terminated(&self, server_id: ServerId) {
        if let Some(handle) = self.handle(server_id).await {
            let mut done_rx = handle.done_rx.clone();
            drop(handle);
            while !*done_rx.borrow() {
                if done_rx.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    pub async fn is_running(&self, server_id: ServerId) -> bool {
        match self.handle(server_id).await {
            Some(handle) => *handle.status.read().await == ServerStatus::Running,
            None => false,
        }
    }

    pub async fn status(&self, server_id: ServerId) -> Option<ServerStatus> {
        match self.handle(server_id).await {
            Some(handle) => Some(*handle.status.read().await),
            None => None,
        }
    }

    pub async fn get_stats(&self, server_id: ServerId) -> Option<ServerStats> {
        match self.handle(server_id).await {
            Some(handle) => Some(handle.stats().await),
            None => None,
        }
    }

    /// Statistics snapshots for every live process
    pub async fn list_servers(&self) -> Vec<ServerStats> {
        let handles: Vec<Arc<ProcessHandle>> = {
            let processes = self.processes.read().await;
            processes.values().cloned().collect()
        };
        let mut stats = Vec::with_capacity(handles.len());
        for handle in handles {
            stats.push(handle.stats().await);
        }
        stats
    }

    pub async fn process_count(&self) -> usize {
        let processes = self.processes.read().await;
        processes.len()
    }

    /// The node-local name registry
    pub fn registry(&self) -> &LocalRegistry {
        &self.registry
    }

    /// The lifecycle event bus
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Subscribe to lifecycle events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Register a termination hook. Hooks run during process teardown,
    /// before the `Terminated` event is emitted.
    pub async fn add_termination_hook(&self, hook: Arc<dyn TerminationHook>) {
        let mut hooks = self.hooks.write().await;
        hooks.push(hook);
    }

    async fn handle(&self, server_id: ServerId) -> Option<Arc<ProcessHandle>> {
        let processes = self.processes.read().await;
        processes.get(&server_id).cloned()
    }

    async fn running_handle(&self, server_id: ServerId) -> CoreResult<Arc<ProcessHandle>> {
        let handle = self
            .handle(server_id)
            .await
            .ok_or_else(|| CoreError::server_not_running(server_id.to_string()))?;
        if *handle.status.read().await != ServerStatus::Running {
            return Err(CoreError::server_not_running(server_id.to_string()));
        }
        Ok(handle)
    }
}

/// The single-writer dispatch loop for one process
async fn run_loop(
    runtime: Arc<Runtime>,
    mut behavior: Box<dyn Behavior>,
    handle: Arc<ProcessHandle>,
    mut mailbox_rx: mpsc::UnboundedReceiver<Envelope>,
    mut control_rx: mpsc::UnboundedReceiver<ControlSignal>,
    done_tx: watch::Sender<bool>,
) {
    let exit_reason = loop {
        tokio::select! {
            biased;
            signal = control_rx.recv() => {
                match signal {
                    Some(ControlSignal::Kill { reason }) => break reason,
                    None => break ExitReason::Normal,
                }
            }
            envelope = mailbox_rx.recv() => {
                match envelope {
                    Some(envelope) => {
                        handle.note_dequeue();
                        if let Some(reason) = dispatch(&mut behavior, envelope).await {
                            break reason;
                        }
                    }
                    None => break ExitReason::Normal,
                }
            }
        }
    };

    terminate_process(runtime, behavior, handle, exit_reason, done_tx).await;
}

/// Run one handler; `Some(reason)` ends the process
async fn dispatch(behavior: &mut Box<dyn Behavior>, envelope: Envelope) -> Option<ExitReason> {
    match envelope {
        Envelope::Call { msg, reply_tx } => {
            match AssertUnwindSafe(behavior.handle_call(msg)).catch_unwind().await {
                Ok(Ok(reply)) => {
                    let _ = reply_tx.send(Ok(reply));
                    None
                }
                Ok(Err(e)) => {
                    let message = e.to_string();
                    let _ = reply_tx.send(Err(CoreError::handler(message.clone())));
                    Some(ExitReason::error(message))
                }
                Err(_) => {
                    let _ = reply_tx.send(Err(CoreError::handler("handler panicked")));
                    Some(ExitReason::error("handler panicked"))
                }
            }
        }
        Envelope::Cast { msg } => {
            match AssertUnwindSafe(behavior.handle_cast(msg)).catch_unwind().await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => {
                    error!("Error handling cast: {}", e);
                    Some(ExitReason::error(e.to_string()))
                }
                Err(_) => {
                    error!("Cast handler panicked");
                    Some(ExitReason::error("handler panicked"))
                }
            }
        }
        Envelope::Info { msg } => {
            match AssertUnwindSafe(behavior.handle_info(msg)).catch_unwind().await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => {
                    error!("Error handling info: {}", e);
                    Some(ExitReason::error(e.to_string()))
                }
                Err(_) => {
                    error!("Info handler panicked");
                    Some(ExitReason::error("handler panicked"))
                }
            }
        }
        Envelope::Stop { reason } => Some(reason),
    }
}

/// Teardown: terminate callback, cleanup hooks, table/registry removal, and
/// only then the `Terminated` event and the done notification.
async fn terminate_process(
    runtime: Arc<Runtime>,
    mut behavior: Box<dyn Behavior>,
    handle: Arc<ProcessHandle>,
    exit_reason: ExitReason,
    done_tx: watch::Sender<bool>,
) {
    {
        let mut status = handle.status.write().await;
        *status = ServerStatus::Stopping;
    }

    if AssertUnwindSafe(behavior.terminate(&exit_reason))
        .catch_unwind()
        .await
        .is_err()
    {
        warn!("terminate callback panicked for server {}", handle.server_id);
    }

    let hooks: Vec<Arc<dyn TerminationHook>> = {
        let hooks = runtime.hooks.read().await;
        hooks.clone()
    };
    for hook in hooks {
        hook.on_terminate(handle.server_id, &exit_reason).await;
    }

    if let Some(name) = &handle.name {
        let _ = runtime.registry.unregister(name).await;
    }
    {
        let mut processes = runtime.processes.write().await;
        processes.remove(&handle.server_id);
    }
    {
        let mut status = handle.status.write().await;
        *status = ServerStatus::Stopped;
    }

    debug!(
        "GenServer {} terminated: {}",
        handle.server_id, exit_reason
    );
    runtime.events.emit(LifecycleEvent::Terminated {
        server_id: handle.server_id,
        name: handle.name.clone(),
        reason: exit_reason,
    });
    let _ = done_tx.send(true);
}
