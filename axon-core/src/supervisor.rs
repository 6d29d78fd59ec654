//! OTP-style supervision: child specs, restart strategies, intensity limits
//!
//! A supervisor runs as its own command-loop task, observing child deaths
//! through the runtime's lifecycle event stream. Children start in
//! definition order and stop in reverse order. A sliding restart window
//! bounds how hard the supervisor will fight a failure storm before giving
//! up and terminating itself.

use crate::error::{CoreError, CoreResult};
use crate::events::LifecycleEvent;
use crate::genserver::{Behavior, GenServerOptions, Runtime};
use crate::types::{ExitReason, ServerId, ServerRef};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default restart intensity: 3 restarts within 5 seconds
pub const DEFAULT_MAX_RESTARTS: u32 = 3;
pub const DEFAULT_RESTART_WINDOW: Duration = Duration::from_secs(5);

/// Default deadline for a child's orderly shutdown
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Factory producing a fresh behavior instance for each (re)start.
/// The argument is only used by `simple_one_for_one` dynamic children.
pub type BehaviorFactory = Arc<dyn Fn(Option<Value>) -> Box<dyn Behavior> + Send + Sync>;

/// Supervisor restart strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Restart only the failed child
    OneForOne,
    /// On any child death, restart every child
    OneForAll,
    /// Restart the failed child and every child started after it
    RestForOne,
    /// Homogeneous dynamic children built from a template
    SimpleOneForOne,
}

/// Per-child restart policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Always restart
    Permanent,
    /// Restart only on abnormal exit
    Transient,
    /// Never restart
    Temporary,
}

/// When the supervisor shuts itself down based on significant children
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoShutdown {
    Never,
    AnySignificant,
    AllSignificant,
}

/// Restart rate limit: at most `max_restarts` within `within`
#[derive(Debug, Clone, Copy)]
pub struct RestartIntensity {
    pub max_restarts: u32,
    pub within: Duration,
}

impl Default for RestartIntensity {
    fn default() -> Self {
        Self {
            max_restarts: DEFAULT_MAX_RESTARTS,
            within: DEFAULT_RESTART_WINDOW,
        }
    }
}

/// Sliding window of restart timestamps.
///
/// Each recorded restart appends the current instant and evicts entries
/// older than the window; exceeding `max_restarts` live entries is a breach.
/// Shared by the local and the distributed supervisor.
#[derive(Debug)]
pub struct RestartWindow {
    intensity: RestartIntensity,
    timestamps: VecDeque<Instant>,
}

impl RestartWindow {
    pub fn new(intensity: RestartIntensity) -> Self {
        Self {
            intensity,
            timestamps: VecDeque::new(),
        }
    }

    /// Record a restart. Returns `false` when the intensity is breached.
    pub fn record(&mut self) -> bool {
        let now = Instant::now();
        self.timestamps.push_back(now);
        while let Some(&front) = self.timestamps.front() {
            if now.duration_since(front) > self.intensity.within {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
        self.timestamps.len() <= self.intensity.max_restarts as usize
    }

    pub fn intensity(&self) -> RestartIntensity {
        self.intensity
    }

    pub fn recent_count(&self) -> usize {
        self.timestamps.len()
    }
}

/// Specification of one supervised child
#[derive(Clone)]
pub struct ChildSpec {
    pub id: String,
    pub factory: BehaviorFactory,
    /// Options passed to the runtime when (re)starting the child process
    pub options: GenServerOptions,
    pub restart: RestartPolicy,
    pub shutdown_timeout: Duration,
    /// Participates in the supervisor's auto-shutdown policy
    pub significant: bool,
}

impl ChildSpec {
    pub fn new<S, F>(id: S, factory: F) -> Self
    where
        S: Into<String>,
        F: Fn(Option<Value>) -> Box<dyn Behavior> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            factory: Arc::new(factory),
            options: GenServerOptions::default(),
            restart: RestartPolicy::Permanent,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            significant: false,
        }
    }

    pub fn restart(mut self, policy: RestartPolicy) -> Self {
        self.restart = policy;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn significant(mut self, significant: bool) -> Self {
        self.significant = significant;
        self
    }

    pub fn options(mut self, options: GenServerOptions) -> Self {
        self.options = options;
        self
    }
}

impl std::fmt::Debug for ChildSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildSpec")
            .field("id", &self.id)
            .field("restart", &self.restart)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("significant", &self.significant)
            .finish()
    }
}

/// Template for `simple_one_for_one` dynamic children
#[derive(Clone)]
pub struct ChildTemplate {
    pub factory: BehaviorFactory,
    pub restart: RestartPolicy,
    pub shutdown_timeout: Duration,
}

impl ChildTemplate {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(Option<Value>) -> Box<dyn Behavior> + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
            restart: RestartPolicy::Permanent,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn restart(mut self, policy: RestartPolicy) -> Self {
        self.restart = policy;
        self
    }
}

/// Supervisor configuration
#[derive(Clone)]
pub struct SupervisorOptions {
    pub strategy: Strategy,
    pub children: Vec<ChildSpec>,
    pub intensity: RestartIntensity,
    pub auto_shutdown: AutoShutdown,
    pub child_template: Option<ChildTemplate>,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            strategy: Strategy::OneForOne,
            children: Vec::new(),
            intensity: RestartIntensity::default(),
            auto_shutdown: AutoShutdown::Never,
            child_template: None,
        }
    }
}

impl SupervisorOptions {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            ..Default::default()
        }
    }

    pub fn child(mut self, spec: ChildSpec) -> Self {
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

    pub fn auto_shutdown(mut self, policy: AutoShutdown) -> Self {
        self.auto_shutdown = policy;
        self
    }

    pub fn child_template(mut self, template: ChildTemplate) -> Self {
        self.child_template = Some(template);
        self
    }
}

/// Child status as seen by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    Running,
    Stopped,
}

/// Point-in-time view of one supervised child
#[derive(Debug, Clone)]
pub struct ChildSnapshot {
    pub id: String,
    pub server_ref: Option<ServerRef>,
    pub status: ChildStatus,
    pub restart_count: u32,
    pub restart: RestartPolicy,
    pub significant: bool,
}

/// Child counts reported by `count_children`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildCounts {
    pub specs: usize,
    pub active: usize,
}

enum SupervisorCommand {
    StartChild {
        spec: Box<ChildSpec>,
        reply: oneshot::Sender<CoreResult<ServerRef>>,
    },
    StartDynamicChild {
        args: Option<Value>,
        reply: oneshot::Sender<CoreResult<ServerRef>>,
    },
    TerminateChild {
        child_id: String,
        reply: oneshot::Sender<CoreResult<()>>,
    },
    RestartChild {
        child_id: String,
        reply: oneshot::Sender<CoreResult<ServerRef>>,
    },
    GetChildren {
        reply: oneshot::Sender<Vec<ChildSnapshot>>,
    },
    CountChildren {
        reply: oneshot::Sender<ChildCounts>,
    },
    Stop {
        reason: ExitReason,
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running supervisor
#[derive(Clone, Debug)]
pub struct SupervisorHandle {
    id: Uuid,
    command_tx: mpsc::UnboundedSender<SupervisorCommand>,
    done_rx: watch::Receiver<bool>,
}

impl SupervisorHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_running(&self) -> bool {
        !*self.done_rx.borrow()
    }

    /// Add and start a child (not valid for `simple_one_for_one`)
    pub async fn start_child(&self, spec: ChildSpec) -> CoreResult<ServerRef> {
        self.request(|reply| SupervisorCommand::StartChild {
            spec: Box::new(spec),
            reply,
        })
        .await?
    }

    /// Start a dynamic child from the template (`simple_one_for_one` only)
    pub async fn start_child_args(&self, args: Option<Value>) -> CoreResult<ServerRef> {
        self.request(|reply| SupervisorCommand::StartDynamicChild { args, reply })
            .await?
    }

    /// Stop a child without restarting it
    pub async fn terminate_child(&self, child_id: &str) -> CoreResult<()> {
        self.request(|reply| SupervisorCommand::TerminateChild {
            child_id: child_id.to_string(),
            reply,
        })
        .await?
    }

    /// Restart a currently stopped child
    pub async fn restart_child(&self, child_id: &str) -> CoreResult<ServerRef> {
        self.request(|reply| SupervisorCommand::RestartChild {
            child_id: child_id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn get_children(&self) -> CoreResult<Vec<ChildSnapshot>> {
        self.request(|reply| SupervisorCommand::GetChildren { reply })
            .await
    }

    pub async fn count_children(&self) -> CoreResult<ChildCounts> {
        self.request(|reply| SupervisorCommand::CountChildren { reply })
            .await
    }

    /// Stop the supervisor and all children (reverse start order)
    pub async fn stop(&self, reason: ExitReason) -> CoreResult<()> {
        self.request(|reply| SupervisorCommand::Stop { reason, reply })
            .await
    }

    /// Block until the supervisor has fully terminated
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
        make: impl FnOnce(oneshot::Sender<T>) -> SupervisorCommand,
    ) -> CoreResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(make(reply_tx))
            .map_err(|_| CoreError::SupervisorNotRunning(self.id.to_string()))?;
        reply_rx
            .await
            .map_err(|_| CoreError::SupervisorNotRunning(self.id.to_string()))
    }
}

/// Supervisor entry point
pub struct Supervisor;

impl Supervisor {
    /// Validate options, start the initial children in definition order, and
    /// spawn the supervision loop. Fails (and rolls back already started
    /// children) if any initial child fails to start.
    pub async fn start(
        runtime: Arc<Runtime>,
        options: SupervisorOptions,
    ) -> CoreResult<SupervisorHandle> {
        validate_options(&options)?;

        let id = Uuid::new_v4();
        // Subscribe before starting children so no termination can be missed.
        let events_rx = runtime.subscribe_events();

        let mut children: Vec<ChildState> = Vec::with_capacity(options.children.len());
        for spec in &options.children {
            match start_child_process(&runtime, spec, None).await {
                Ok(server_ref) => {
                    runtime.events().emit(LifecycleEvent::ChildStarted {
                        supervisor_id: id,
                        child_id: spec.id.clone(),
                        server_id: server_ref.id,
                    });
                    children.push(ChildState {
                        spec: spec.clone(),
                        args: None,
                        current: Some(server_ref.id),
                        restart_count: 0,
                    });
                }
                Err(e) => {
                    error!("Child '{}' failed to start: {}", spec.id, e);
                    for started in children.iter().rev() {
                        if let Some(server_id) = started.current {
                            runtime.kill(server_id, ExitReason::Shutdown).await;
                        }
                    }
                    return Err(e);
                }
            }
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = watch::channel(false);

        let task = SupervisorTask {
            id,
            runtime: runtime.clone(),
            strategy: options.strategy,
            auto_shutdown: options.auto_shutdown,
            template: options.child_template,
            window: RestartWindow::new(options.intensity),
            children,
            expected_exits: HashSet::new(),
            dynamic_seq: 0,
        };
        tokio::spawn(task.run(command_rx, events_rx, done_tx));

        info!("Supervisor {} started", id);
        runtime
            .events()
            .emit(LifecycleEvent::SupervisorStarted { supervisor_id: id });

        Ok(SupervisorHandle {
            id,
            command_tx,
            done_rx,
        })
    }
}

fn validate_options(options: &SupervisorOptions) -> CoreResult<()> {
    let mut seen = HashSet::new();
    for spec in &options.children {
        if !seen.insert(spec.id.clone()) {
            return Err(CoreError::DuplicateChild(spec.id.clone()));
        }
    }

    match options.strategy {
        Strategy::SimpleOneForOne => {
            if options.child_template.is_none() {
                return Err(CoreError::MissingChildTemplate);
            }
            if !options.children.is_empty() {
                return Err(CoreError::InvalidSimpleOneForOne(
                    "children must be empty at start".to_string(),
                ));
            }
        }
        _ => {
            if options.child_template.is_some() {
                return Err(CoreError::InvalidSimpleOneForOne(
                    "child_template requires the simple_one_for_one strategy".to_string(),
                ));
            }
        }
    }
    Ok(())
}

async fn start_child_process(
    runtime: &Arc<Runtime>,
    spec: &ChildSpec,
    args: Option<Value>,
) -> CoreResult<ServerRef> {
    let behavior = (spec.factory)(args);
    runtime.start_boxed(behavior, spec.options.clone()).await
}

struct ChildState {
    spec: ChildSpec,
    args: Option<Value>,
    current: Option<ServerId>,
    restart_count: u32,
}

struct SupervisorTask {
    id: Uuid,
    runtime: Arc<Runtime>,
    strategy: Strategy,
    auto_shutdown: AutoShutdown,
    template: Option<ChildTemplate>,
    window: RestartWindow,
    children: Vec<ChildState>,
    // Exits we initiated ourselves; not subject to restart handling.
    expected_exits: HashSet<ServerId>,
    dynamic_seq: u64,
}

impl SupervisorTask {
    async fn run(
        mut self,
        mut command_rx: mpsc::UnboundedReceiver<SupervisorCommand>,
        mut events_rx: broadcast::Receiver<LifecycleEvent>,
        done_tx: watch::Sender<bool>,
    ) {
        let exit_reason = loop {
            tokio::select! {
                command = command_rx.recv() => {
                    match command {
                        Some(SupervisorCommand::Stop { reason, reply }) => {
                            let _ = reply.send(());
                            break reason;
                        }
                        Some(command) => self.handle_command(command).await,
                        None => break ExitReason::Shutdown,
                    }
                }
                event = events_rx.recv() => {
                    match event {
                        Ok(LifecycleEvent::Terminated { server_id, reason, .. }) => {
                            if let Some(exit) = self.on_child_exit(server_id, reason).await {
                                break exit;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("Supervisor {} lagged {} lifecycle events", self.id, missed);
                        }
                        Err(broadcast::error::RecvError::Closed) => break ExitReason::Shutdown,
                    }
                }
            }
        };

        self.stop_all_children().await;
        info!("Supervisor {} terminated: {}", self.id, exit_reason);
        self.runtime
            .events()
            .emit(LifecycleEvent::SupervisorTerminated {
                supervisor_id: self.id,
                reason: exit_reason,
            });
        let _ = done_tx.send(true);
    }

    async fn handle_command(&mut self, command: SupervisorCommand) {
        match command {
            SupervisorCommand::StartChild { spec, reply } => {
                let _ = reply.send(self.command_start_child(*spec).await);
            }
            SupervisorCommand::StartDynamicChild { args, reply } => {
                let _ = reply.send(self.command_start_dynamic(args).await);
            }
            SupervisorCommand::TerminateChild { child_id, reply } => {
                let _ = reply.send(self.command_terminate_child(&child_id).await);
            }
            SupervisorCommand::RestartChild { child_id, reply } => {
                let _ = reply.send(self.command_restart_child(&child_id).await);
            }
            SupervisorCommand::GetChildren { reply } => {
                let _ = reply.send(self.snapshot_children());
            }
            SupervisorCommand::CountChildren { reply } => {
                let active = self.children.iter().filter(|c| c.current.is_some()).count();
                let _ = reply.send(ChildCounts {
                    specs: self.children.len(),
                    active,
                });
            }
            SupervisorCommand::Stop { .. } => unreachable!("handled in the loop"),
        }
    }

    async fn command_start_child(&mut self, spec: ChildSpec) -> CoreResult<ServerRef> {
        if self.strategy == Strategy::SimpleOneForOne {
            return Err(CoreError::InvalidSimpleOneForOne(
                "use start_child_args for simple_one_for_one supervisors".to_string(),
            ));
        }
        if self.children.iter().any(|c| c.spec.id == spec.id) {
            return Err(CoreError::DuplicateChild(spec.id));
        }

        let server_ref = start_child_process(&self.runtime, &spec, None).await?;
        self.runtime.events().emit(LifecycleEvent::ChildStarted {
            supervisor_id: self.id,
            child_id: spec.id.clone(),
            server_id: server_ref.id,
        });
        self.children.push(ChildState {
            spec,
            args: None,
            current: Some(server_ref.id),
            restart_count: 0,
        });
        Ok(server_ref)
    }

    async fn command_start_dynamic(&mut self, args: Option<Value>) -> CoreResult<ServerRef> {
        let template = match (&self.strategy, &self.template) {
            (Strategy::SimpleOneForOne, Some(template)) => template.clone(),
            (Strategy::SimpleOneForOne, None) => return Err(CoreError::MissingChildTemplate),
            _ => {
                return Err(CoreError::InvalidSimpleOneForOne(
                    "start_child_args requires the simple_one_for_one strategy".to_string(),
                ))
            }
        };

        self.dynamic_seq += 1;
        let spec = ChildSpec {
            id: format!("child_{}", self.dynamic_seq),
            factory: template.factory,
            options: GenServerOptions::default(),
            restart: template.restart,
            shutdown_timeout: template.shutdown_timeout,
            significant: false,
        };

        let server_ref = start_child_process(&self.runtime, &spec, args.clone()).await?;
        self.runtime.events().emit(LifecycleEvent::ChildStarted {
            supervisor_id: self.id,
            child_id: spec.id.clone(),
            server_id: server_ref.id,
        });
        self.children.push(ChildState {
            spec,
            args,
            current: Some(server_ref.id),
            restart_count: 0,
        });
        Ok(server_ref)
    }

    async fn command_terminate_child(&mut self, child_id: &str) -> CoreResult<()> {
        let idx = self
            .children
            .iter()
            .position(|c| c.spec.id == child_id)
            .ok_or_else(|| CoreError::ChildNotFound(child_id.to_string()))?;

        if let Some(server_id) = self.children[idx].current.take() {
            let timeout = self.children[idx].spec.shutdown_timeout;
            self.stop_child_process(server_id, timeout).await;
        }
        self.runtime.events().emit(LifecycleEvent::ChildTerminated {
            supervisor_id: self.id,
            child_id: child_id.to_string(),
            reason: ExitReason::Shutdown,
        });

        // Dynamic children are forgotten entirely once terminated.
        if self.strategy == Strategy::SimpleOneForOne {
            self.children.remove(idx);
        }
        Ok(())
    }

    async fn command_restart_child(&mut self, child_id: &str) -> CoreResult<ServerRef> {
        let idx = self
            .children
            .iter()
            .position(|c| c.spec.id == child_id)
            .ok_or_else(|| CoreError::ChildNotFound(child_id.to_string()))?;

        if self.children[idx].current.is_some() {
            return Err(CoreError::internal(format!(
                "child '{}' is already running",
                child_id
            )));
        }

        let spec = self.children[idx].spec.clone();
        let args = self.children[idx].args.clone();
        let server_ref = start_child_process(&self.runtime, &spec, args).await?;
        self.children[idx].current = Some(server_ref.id);
        self.children[idx].restart_count += 1;
        self.runtime.events().emit(LifecycleEvent::ChildRestarted {
            supervisor_id: self.id,
            child_id: child_id.to_string(),
            server_id: server_ref.id,
        });
        Ok(server_ref)
    }

    /// React to a process termination event. Returns `Some(reason)` when the
    /// supervisor itself must terminate.
    async fn on_child_exit(
        &mut self,
        server_id: ServerId,
        reason: ExitReason,
    ) -> Option<ExitReason> {
        if self.expected_exits.remove(&server_id) {
            return None;
        }
        let idx = self
            .children
            .iter()
            .position(|c| c.current == Some(server_id))?;

        self.children[idx].current = None;
        let child_id = self.children[idx].spec.id.clone();
        let policy = self.children[idx].spec.restart;
        let significant = self.children[idx].spec.significant;
        debug!(
            "Supervisor {} observed exit of child '{}': {}",
            self.id, child_id, reason
        );

        let should_restart = match policy {
            RestartPolicy::Permanent => true,
            RestartPolicy::Transient => reason.is_abnormal(),
            RestartPolicy::Temporary => false,
        };

        if !should_restart {
            self.runtime.events().emit(LifecycleEvent::ChildTerminated {
                supervisor_id: self.id,
                child_id,
                reason,
            });
            if self.strategy == Strategy::SimpleOneForOne || policy == RestartPolicy::Temporary {
                self.children.remove(idx);
            }
            return self.check_auto_shutdown(significant);
        }

        if !self.window.record() {
            let intensity = self.window.intensity();
            error!(
                "Supervisor {} exceeded restart intensity ({} within {:?})",
                self.id, intensity.max_restarts, intensity.within
            );
            return Some(ExitReason::error(format!(
                "max restarts exceeded: {} within {} ms",
                intensity.max_restarts,
                intensity.within.as_millis()
            )));
        }

        match self.strategy {
            Strategy::OneForOne | Strategy::SimpleOneForOne => self.restart_one(idx).await,
            Strategy::OneForAll => self.restart_from(0, idx).await,
            Strategy::RestForOne => self.restart_from(idx, idx).await,
        }
    }

    /// Restart a single child in place, retrying until it starts or the
    /// restart window is breached
    async fn restart_one(&mut self, idx: usize) -> Option<ExitReason> {
        loop {
            let spec = self.children[idx].spec.clone();
            let args = self.children[idx].args.clone();
            match start_child_process(&self.runtime, &spec, args).await {
                Ok(server_ref) => {
                    self.children[idx].current = Some(server_ref.id);
                    self.children[idx].restart_count += 1;
                    info!(
                        "Supervisor {} restarted child '{}' (attempt {})",
                        self.id, spec.id, self.children[idx].restart_count
                    );
                    self.runtime.events().emit(LifecycleEvent::ChildRestarted {
                        supervisor_id: self.id,
                        child_id: spec.id,
                        server_id: server_ref.id,
                    });
                    return None;
                }
                Err(e) => {
                    error!(
                        "Supervisor {} failed to restart child '{}': {}",
                        self.id, spec.id, e
                    );
                    // A failed restart counts against the window too.
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

    /// Stop children `[from..]` (reverse order), then restart them in order.
    /// The child at `dead_idx` is already down. Used by one_for_all
    /// (`from = 0`) and rest_for_one (`from = dead_idx`). Children that were
    /// deliberately stopped before the failure stay stopped.
    async fn restart_from(&mut self, from: usize, dead_idx: usize) -> Option<ExitReason> {
        let mut to_restart: Vec<usize> = vec![dead_idx];
        for idx in (from..self.children.len()).rev() {
            if idx == dead_idx {
                continue;
            }
            if let Some(server_id) = self.children[idx].current.take() {
                let timeout = self.children[idx].spec.shutdown_timeout;
                self.stop_child_process(server_id, timeout).await;
                to_restart.push(idx);
            }
        }

        to_restart.sort_unstable();
        for idx in to_restart {
            if let Some(exit) = self.restart_one(idx).await {
                return Some(exit);
            }
        }
        None
    }

    fn check_auto_shutdown(&self, significant: bool) -> Option<ExitReason> {
        if !significant {
            return None;
        }
        match self.auto_shutdown {
            AutoShutdown::Never => None,
            AutoShutdown::AnySignificant => {
                info!("Supervisor {} auto-shutdown: significant child stopped", self.id);
                Some(ExitReason::Shutdown)
            }
            AutoShutdown::AllSignificant => {
                let any_left = self
                    .children
                    .iter()
                    .any(|c| c.spec.significant && c.current.is_some());
                if any_left {
                    None
                } else {
                    info!(
                        "Supervisor {} auto-shutdown: all significant children stopped",
                        self.id
                    );
                    Some(ExitReason::Shutdown)
                }
            }
        }
    }

    /// Orderly stop with fallback to kill after the shutdown timeout
    async fn stop_child_process(&mut self, server_id: ServerId, timeout: Duration) {
        self.expected_exits.insert(server_id);
        let finished = self
            .runtime
            .stop_with_timeout(server_id, ExitReason::Shutdown, Some(timeout))
            .await
            .unwrap_or(true);
        if !finished {
            warn!(
                "Child {} did not stop within {:?}, force-terminating",
                server_id, timeout
            );
            self.runtime.kill(server_id, ExitReason::Shutdown).await;
            let _ = tokio::time::timeout(timeout, self.runtime.wait_terminated(server_id)).await;
        }
    }

    async fn stop_all_children(&mut self) {
        for idx in (0..self.children.len()).rev() {
            if let Some(server_id) = self.children[idx].current.take() {
                let timeout = self.children[idx].spec.shutdown_timeout;
                self.stop_child_process(server_id, timeout).await;
            }
        }
    }

    fn snapshot_children(&self) -> Vec<ChildSnapshot> {
        self.children
            .iter()
            .map(|c| ChildSnapshot {
                id: c.spec.id.clone(),
                server_ref: c.current.map(ServerRef::local),
                status: if c.current.is_some() {
                    ChildStatus::Running
                } else {
                    ChildStatus::Stopped
                },
                restart_count: c.restart_count,
                restart: c.spec.restart,
                significant: c.spec.significant,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genserver::Behavior;
    use async_trait::async_trait;
    use serde_json::json;

    struct Worker;

    #[async_trait]
    impl Behavior for Worker {
        async fn handle_call(&mut self, _msg: Value) -> CoreResult<Value> {
            Ok(json!("ok"))
        }
    }

    fn worker_spec(id: &str) -> ChildSpec {
        ChildSpec::new(id, |_| Box::new(Worker))
    }

    async fn child_server_id(handle: &SupervisorHandle, child_id: &str) -> Option<ServerId> {
        handle
            .get_children()
            .await
            .unwrap()
            .into_iter()
            .find(|c| c.id == child_id)
            .and_then(|c| c.server_ref.map(|r| r.id))
    }

    async fn wait_for_restart(
        handle: &SupervisorHandle,
        child_id: &str,
        old: ServerId,
    ) -> ServerId {
        for _ in 0..100 {
            if let Some(current) = child_server_id(handle, child_id).await {
                if current != old {
                    return current;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("child '{}' was not restarted", child_id);
    }

    #[tokio::test]
    async fn one_for_one_restarts_only_the_failed_child() {
        let runtime = Runtime::new();
        let handle = Supervisor::start(
            runtime.clone(),
            SupervisorOptions::new(Strategy::OneForOne)
                .child(worker_spec("c1"))
                .child(worker_spec("c2"))
                .intensity(3, Duration::from_secs(60)),
        )
        .await
        .unwrap();

        let c1_old = child_server_id(&handle, "c1").await.unwrap();
        let c2_old = child_server_id(&handle, "c2").await.unwrap();

        runtime.kill(c1_old, ExitReason::error("boom")).await;
        let c1_new = wait_for_restart(&handle, "c1", c1_old).await;

        assert_ne!(c1_new, c1_old);
        assert_eq!(child_server_id(&handle, "c2").await.unwrap(), c2_old);

        let children = handle.get_children().await.unwrap();
        let c1 = children.iter().find(|c| c.id == "c1").unwrap();
        assert_eq!(c1.restart_count, 1);

        handle.stop(ExitReason::Shutdown).await.unwrap();
    }

    #[tokio::test]
    async fn intensity_breach_terminates_the_supervisor() {
        let runtime = Runtime::new();
        let handle = Supervisor::start(
            runtime.clone(),
            SupervisorOptions::new(Strategy::OneForOne)
                .child(worker_spec("c1"))
                .child(worker_spec("c2"))
                .intensity(2, Duration::from_secs(1)),
        )
        .await
        .unwrap();

        let mut current = child_server_id(&handle, "c1").await.unwrap();
        for _ in 0..2 {
            runtime.kill(current, ExitReason::error("boom")).await;
            current = wait_for_restart(&handle, "c1", current).await;
        }

        // Third failure within the window breaches the intensity.
        runtime.kill(current, ExitReason::error("boom")).await;
        tokio::time::timeout(Duration::from_secs(5), handle.wait_terminated())
            .await
            .expect("supervisor should terminate");
        assert!(!handle.is_running());

        // Every child process is gone with the supervisor.
        assert_eq!(runtime.process_count().await, 0);
    }

    #[tokio::test]
    async fn one_for_all_restarts_every_child() {
        let runtime = Runtime::new();
        let handle = Supervisor::start(
            runtime.clone(),
            SupervisorOptions::new(Strategy::OneForAll)
                .child(worker_spec("a"))
                .child(worker_spec("b")),
        )
        .await
        .unwrap();

        let a_old = child_server_id(&handle, "a").await.unwrap();
        let b_old = child_server_id(&handle, "b").await.unwrap();

        runtime.kill(b_old, ExitReason::error("boom")).await;
        let b_new = wait_for_restart(&handle, "b", b_old).await;
        let a_new = wait_for_restart(&handle, "a", a_old).await;

        assert_ne!(a_new, a_old);
        assert_ne!(b_new, b_old);
        handle.stop(ExitReason::Shutdown).await.unwrap();
    }

    #[tokio::test]
    async fn rest_for_one_restarts_later_children_only() {
        let runtime = Runtime::new();
        let handle = Supervisor::start(
            runtime.clone(),
            SupervisorOptions::new(Strategy::RestForOne)
                .child(worker_spec("a"))
                .child(worker_spec("b"))
                .child(worker_spec("c")),
        )
        .await
        .unwrap();

        let a_old = child_server_id(&handle, "a").await.unwrap();
        let b_old = child_server_id(&handle, "b").await.unwrap();
        let c_old = child_server_id(&handle, "c").await.unwrap();

        runtime.kill(b_old, ExitReason::error("boom")).await;
        let b_new = wait_for_restart(&handle, "b", b_old).await;
        let c_new = wait_for_restart(&handle, "c", c_old).await;

        assert_ne!(b_new, b_old);
        assert_ne!(c_new, c_old);
        assert_eq!(child_server_id(&handle, "a").await.unwrap(), a_old);
        handle.stop(ExitReason::Shutdown).await.unwrap();
    }

    #[tokio::test]
    async fn temporary_children_are_never_restarted() {
        let runtime = Runtime::new();
        let handle = Supervisor::start(
            runtime.clone(),
            SupervisorOptions::new(Strategy::OneForOne)
                .child(worker_spec("t").restart(RestartPolicy::Temporary)),
        )
        .await
        .unwrap();

        let t_old = child_server_id(&handle, "t").await.unwrap();
        runtime.kill(t_old, ExitReason::error("boom")).await;
        runtime.wait_terminated(t_old).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Temporary children are removed from the child list entirely.
        assert!(handle.get_children().await.unwrap().is_empty());
        handle.stop(ExitReason::Shutdown).await.unwrap();
    }

    #[tokio::test]
    async fn transient_children_restart_only_on_abnormal_exit() {
        let runtime = Runtime::new();
        let handle = Supervisor::start(
            runtime.clone(),
            SupervisorOptions::new(Strategy::OneForOne)
                .child(worker_spec("t").restart(RestartPolicy::Transient)),
        )
        .await
        .unwrap();

        let t_old = child_server_id(&handle, "t").await.unwrap();
        runtime.stop(t_old, ExitReason::Normal).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let children = handle.get_children().await.unwrap();
        assert_eq!(children[0].status, ChildStatus::Stopped);
        assert_eq!(children[0].restart_count, 0);

        // Manual restart brings it back; an abnormal exit then restarts it.
        let restarted = handle.restart_child("t").await.unwrap();
        runtime.kill(restarted.id, ExitReason::error("boom")).await;
        wait_for_restart(&handle, "t", restarted.id).await;

        handle.stop(ExitReason::Shutdown).await.unwrap();
    }

    #[tokio::test]
    async fn simple_one_for_one_spawns_from_template() {
        let runtime = Runtime::new();
        let handle = Supervisor::start(
            runtime.clone(),
            SupervisorOptions::new(Strategy::SimpleOneForOne)
                .child_template(ChildTemplate::new(|_| Box::new(Worker))),
        )
        .await
        .unwrap();

        let first = handle.start_child_args(Some(json!(1))).await.unwrap();
        let second = handle.start_child_args(Some(json!(2))).await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(handle.count_children().await.unwrap().active, 2);

        // Static specs are rejected for this strategy.
        let err = handle.start_child(worker_spec("nope")).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidSimpleOneForOne(_)));

        runtime.kill(first.id, ExitReason::error("boom")).await;
        wait_for_restart(&handle, "child_1", first.id).await;

        handle.stop(ExitReason::Shutdown).await.unwrap();
    }

    #[tokio::test]
    async fn simple_one_for_one_requires_template_and_no_children() {
        let runtime = Runtime::new();
        let err = Supervisor::start(
            runtime.clone(),
            SupervisorOptions::new(Strategy::SimpleOneForOne),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::MissingChildTemplate));

        let err = Supervisor::start(
            runtime,
            SupervisorOptions::new(Strategy::SimpleOneForOne)
                .child_template(ChildTemplate::new(|_| Box::new(Worker)))
                .child(worker_spec("static")),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::InvalidSimpleOneForOne(_)));
    }

    #[tokio::test]
    async fn duplicate_child_ids_are_rejected() {
        let runtime = Runtime::new();
        let err = Supervisor::start(
            runtime.clone(),
            SupervisorOptions::new(Strategy::OneForOne)
                .child(worker_spec("dup"))
                .child(worker_spec("dup")),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::DuplicateChild(_)));

        let handle = Supervisor::start(
            runtime,
            SupervisorOptions::new(Strategy::OneForOne).child(worker_spec("dup")),
        )
        .await
        .unwrap();
        let err = handle.start_child(worker_spec("dup")).await.unwrap_err();
        assert!(matches!(err, CoreError::DuplicateChild(_)));
        handle.stop(ExitReason::Shutdown).await.unwrap();
    }

    #[tokio::test]
    async fn auto_shutdown_any_significant() {
        let runtime = Runtime::new();
        let handle = Supervisor::start(
            runtime.clone(),
            SupervisorOptions::new(Strategy::OneForOne)
                .auto_shutdown(AutoShutdown::AnySignificant)
                .child(worker_spec("keeper"))
                .child(
                    worker_spec("sig")
                        .restart(RestartPolicy::Temporary)
                        .significant(true),
                ),
        )
        .await
        .unwrap();

        let sig = child_server_id(&handle, "sig").await.unwrap();
        runtime.stop(sig, ExitReason::Normal).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle.wait_terminated())
            .await
            .expect("supervisor should auto-shutdown");
    }

    #[test]
    fn restart_window_evicts_old_entries() {
        let mut window = RestartWindow::new(RestartIntensity {
            max_restarts: 2,
            within: Duration::from_millis(50),
        });
        assert!(window.record());
        assert!(window.record());
        assert!(!window.record());

        std::thread::sleep(Duration::from_millis(60));
        assert!(window.record());
        assert_eq!(window.recent_count(), 1);
    }
}
