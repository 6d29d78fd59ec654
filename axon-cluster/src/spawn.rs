//! Remote spawn: behavior registry plus the spawn_request/spawn_reply flow
//!
//! Behaviors cannot cross the wire; each node pre-registers factories under
//! well-known names and spawn requests carry only the name. The target node
//! starts the process, applies the requested registration, and replies with
//! the new server id or a typed failure.

use crate::error::{ClusterError, ClusterResult};
use crate::global_registry::GlobalRegistry;
use crate::message::{ClusterMessage, Registration, SpawnErrorKind, SpawnOutcome};
use crate::transport::Transport;
use axon_core::{
    supervisor::BehaviorFactory, Behavior, GenServerOptions, NodeId, Runtime, ServerRef,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Named behavior factories; the same names must exist on every node that
/// may host the behavior.
#[derive(Default)]
pub struct BehaviorRegistry {
    behaviors: RwLock<HashMap<String, BehaviorFactory>>,
}

impl BehaviorRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            behaviors: RwLock::new(HashMap::new()),
        })
    }

    pub async fn register<S, F>(&self, name: S, factory: F)
    where
        S: Into<String>,
        F: Fn(Option<Value>) -> Box<dyn Behavior> + Send + Sync + 'static,
    {
        let mut behaviors = self.behaviors.write().await;
        behaviors.insert(name.into(), Arc::new(factory));
    }

    pub async fn unregister(&self, name: &str) {
        let mut behaviors = self.behaviors.write().await;
        behaviors.remove(name);
    }

    pub async fn contains(&self, name: &str) -> bool {
        let behaviors = self.behaviors.read().await;
        behaviors.contains_key(name)
    }

    pub async fn names(&self) -> Vec<String> {
        let behaviors = self.behaviors.read().await;
        behaviors.keys().cloned().collect()
    }

    /// Instantiate a behavior, or `None` if the name is unknown
    pub async fn create(&self, name: &str, args: Option<Value>) -> Option<Box<dyn Behavior>> {
        let behaviors = self.behaviors.read().await;
        behaviors.get(name).map(|factory| factory(args))
    }
}

/// Options for one remote spawn
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Name applied via the requested registration
    pub name: Option<String>,
    pub registration: Registration,
    pub init_timeout: Duration,
    /// Deadline for the whole round-trip
    pub timeout: Duration,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            name: None,
            registration: Registration::None,
            init_timeout: Duration::from_secs(5),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Counters for the observability surface
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SpawnStats {
    pub pending: usize,
    pub spawned: u64,
    pub served: u64,
    pub failed: u64,
}

pub struct RemoteSpawner {
    local: NodeId,
    transport: Arc<Transport>,
    runtime: Arc<Runtime>,
    behaviors: Arc<BehaviorRegistry>,
    global: Arc<GlobalRegistry>,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<ClusterResult<ServerRef>>>>,
    pending_nodes: Mutex<HashMap<Uuid, NodeId>>,
    spawned: AtomicU64,
    served: AtomicU64,
    failed: AtomicU64,
}

impl RemoteSpawner {
    pub fn new(
        local: NodeId,
        transport: Arc<Transport>,
        runtime: Arc<Runtime>,
        behaviors: Arc<BehaviorRegistry>,
        global: Arc<GlobalRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local,
            transport,
            runtime,
            behaviors,
            global,
            pending: Mutex::new(HashMap::new()),
            pending_nodes: Mutex::new(HashMap::new()),
            spawned: AtomicU64::new(0),
            served: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    /// Launch a pre-registered behavior on a target node
    pub async fn spawn(
        &self,
        behavior_name: &str,
        target: &NodeId,
        options: SpawnOptions,
    ) -> ClusterResult<ServerRef> {
        if *target == self.local {
            return self.spawn_local(behavior_name, &options).await;
        }

        let spawn_id = Uuid::new_v4();
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            self.pending.lock().await.insert(spawn_id, reply_tx);
            self.pending_nodes
                .lock()
                .await
                .insert(spawn_id, target.clone());
        }

        let request = ClusterMessage::SpawnRequest {
            spawn_id,
            behavior_name: behavior_name.to_string(),
            name: options.name.clone(),
            registration: options.registration,
            init_timeout_ms: options.init_timeout.as_millis() as u64,
        };
        if let Err(e) = self.transport.send(target, &request).await {
            self.take(spawn_id).await;
            return Err(e);
        }

        match tokio::time::timeout(options.timeout, reply_rx).await {
            Ok(Ok(result)) => {
                match &result {
                    Ok(_) => self.spawned.fetch_add(1, Ordering::Relaxed),
                    Err(_) => self.failed.fetch_add(1, Ordering::Relaxed),
                };
                result
            }
            Ok(Err(_)) => Err(ClusterError::ClusterNotStarted),
            Err(_) => {
                self.take(spawn_id).await;
                self.failed.fetch_add(1, Ordering::Relaxed);
                Err(ClusterError::RemoteSpawnTimeout {
                    timeout_ms: options.timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Spawn on the local node, short-circuiting the wire protocol
    async fn spawn_local(
        &self,
        behavior_name: &str,
        options: &SpawnOptions,
    ) -> ClusterResult<ServerRef> {
        match self.start_behavior(behavior_name, options).await {
            Ok(server_ref) => {
                self.spawned.fetch_add(1, Ordering::Relaxed);
                Ok(server_ref)
            }
            Err(outcome) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                Err(spawn_error(outcome))
            }
        }
    }

    /// Serve an inbound spawn_request
    pub async fn handle_request(
        self: &Arc<Self>,
        from: NodeId,
        spawn_id: Uuid,
        behavior_name: String,
        name: Option<String>,
        registration: Registration,
        init_timeout_ms: u64,
    ) {
        let spawner = self.clone();
        tokio::spawn(async move {
            let options = SpawnOptions {
                name,
                registration,
                init_timeout: Duration::from_millis(init_timeout_ms),
                timeout: Duration::ZERO, // unused on the serving side
            };
            let result = match spawner.start_behavior(&behavior_name, &options).await {
                Ok(server_ref) => {
                    spawner.served.fetch_add(1, Ordering::Relaxed);
                    info!(
                        "Spawned behavior '{}' as {} for {}",
                        behavior_name, server_ref.id, from
                    );
                    SpawnOutcome::Ok {
                        server_id: server_ref.id,
                    }
                }
                Err(outcome) => outcome,
            };

            let reply = ClusterMessage::SpawnReply { spawn_id, result };
            if let Err(e) = spawner.transport.send(&from, &reply).await {
                warn!("Failed to send spawn_reply to {}: {}", from, e);
            }
        });
    }

    /// Resolve a pending spawn from an inbound spawn_reply
    pub async fn handle_reply(&self, from: &NodeId, spawn_id: Uuid, result: SpawnOutcome) {
        let reply_tx = match self.take(spawn_id).await {
            Some(tx) => tx,
            None => {
                debug!("Dropping late spawn_reply {}", spawn_id);
                return;
            }
        };

        let outcome = match result {
            SpawnOutcome::Ok { server_id } => Ok(ServerRef::remote(server_id, from.clone())),
            SpawnOutcome::Error { kind, detail } => Err(spawn_error(SpawnOutcome::Error {
                kind,
                detail,
            })),
        };
        let _ = reply_tx.send(outcome);
    }

    /// Reject pending spawns aimed at a node that went down
    pub async fn on_node_down(&self, node: &NodeId) {
        let ids: Vec<Uuid> = {
            let pending_nodes = self.pending_nodes.lock().await;
            pending_nodes
                .iter()
                .filter(|(_, target)| *target == node)
                .map(|(id, _)| *id)
                .collect()
        };
        for spawn_id in ids {
            if let Some(reply_tx) = self.take(spawn_id).await {
                let _ = reply_tx.send(Err(ClusterError::not_reachable(node.to_string())));
            }
        }
    }

    /// Reject everything; used on cluster stop
    pub async fn reset(&self) {
        let mut pending = self.pending.lock().await;
        for (_, reply_tx) in pending.drain() {
            let _ = reply_tx.send(Err(ClusterError::ClusterNotStarted));
        }
        self.pending_nodes.lock().await.clear();
    }

    pub async fn get_stats(&self) -> SpawnStats {
        SpawnStats {
            pending: self.pending.lock().await.len(),
            spawned: self.spawned.load(Ordering::Relaxed),
            served: self.served.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Start the behavior locally and apply the requested registration.
    /// Errors come back as the wire outcome so serving and local spawns
    /// share one code path.
    async fn start_behavior(
        &self,
        behavior_name: &str,
        options: &SpawnOptions,
    ) -> Result<ServerRef, SpawnOutcome> {
        let behavior = self
            .behaviors
            .create(behavior_name, None)
            .await
            .ok_or_else(|| SpawnOutcome::Error {
                kind: SpawnErrorKind::BehaviorNotFound,
                detail: behavior_name.to_string(),
            })?;

        let mut gen_options = GenServerOptions::default().init_timeout(options.init_timeout);
        if options.registration == Registration::Local {
            if let Some(name) = &options.name {
                gen_options = gen_options.with_name(name.clone());
            }
        }

        let server_ref = self
            .runtime
            .start_boxed(behavior, gen_options)
            .await
            .map_err(|e| SpawnOutcome::Error {
                kind: match e {
                    axon_core::CoreError::NameAlreadyRegistered(_) => {
                        SpawnErrorKind::RegistrationFailed
                    }
                    _ => SpawnErrorKind::InitFailed,
                },
                detail: e.to_string(),
            })?;

        if options.registration == Registration::Global {
            if let Some(name) = &options.name {
                if let Err(e) = self.global.register(name, server_ref.clone()).await {
                    // Roll the process back; the spawn as requested failed.
                    self.runtime
                        .kill(server_ref.id, axon_core::ExitReason::Shutdown)
                        .await;
                    return Err(SpawnOutcome::Error {
                        kind: SpawnErrorKind::RegistrationFailed,
                        detail: e.to_string(),
                    });
                }
            }
        }

        Ok(server_ref)
    }

    async fn take(&self, spawn_id: Uuid) -> Option<oneshot::Sender<ClusterResult<ServerRef>>> {
        self.pending_nodes.lock().await.remove(&spawn_id);
        let mut pending = self.pending.lock().await;
        pending.remove(&spawn_id)
    }
}

fn spawn_error(outcome: SpawnOutcome) -> ClusterError {
    match outcome {
        SpawnOutcome::Ok { .. } => ClusterError::RemoteSpawnInit("unexpected ok".to_string()),
        SpawnOutcome::Error { kind, detail } => match kind {
            SpawnErrorKind::BehaviorNotFound => ClusterError::BehaviorNotFound(detail),
            SpawnErrorKind::InitFailed => ClusterError::RemoteSpawnInit(detail),
            SpawnErrorKind::RegistrationFailed => ClusterError::RemoteSpawnRegistration(detail),
        },
    }
}

impl std::fmt::Debug for RemoteSpawner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSpawner")
            .field("local", &self.local)
            .finish()
    }
}
