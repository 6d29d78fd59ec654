//! Cluster-wide name registry with coordinator-free conflict resolution
//!
//! Every node keeps a full local view. Local changes are announced to all
//! connected peers; on peer connect both sides exchange their locally owned
//! entries. Conflicts resolve deterministically everywhere: the earlier
//! `registered_at` wins, ties break on the smaller SHA-256 of the owner
//! node id. Process termination does NOT unregister global names; only an
//! explicit unregister or the owner node going down removes them.

use crate::error::{ClusterError, ClusterResult};
use crate::message::{ClusterMessage, RegistryEntryWire, RegistryRemovalWire};
use crate::transport::Transport;
use axon_core::{InfoMessage, NodeId, Runtime, ServerRef};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// One entry in the local view
#[derive(Debug, Clone)]
pub struct GlobalEntry {
    pub name: String,
    pub server_ref: ServerRef,
    pub registered_at: i64,
    pub owner_node_id: NodeId,
}

/// Counters for the observability surface
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct GlobalRegistryStats {
    pub entries: usize,
    pub owned: usize,
    pub conflicts_resolved: u64,
    pub announces_sent: u64,
    pub announces_received: u64,
}

pub struct GlobalRegistry {
    local: NodeId,
    transport: Arc<Transport>,
    runtime: Arc<Runtime>,
    entries: RwLock<HashMap<String, GlobalEntry>>,
    conflicts_resolved: AtomicU64,
    announces_sent: AtomicU64,
    announces_received: AtomicU64,
}

impl GlobalRegistry {
    pub fn new(local: NodeId, transport: Arc<Transport>, runtime: Arc<Runtime>) -> Arc<Self> {
        Arc::new(Self {
            local,
            transport,
            runtime,
            entries: RwLock::new(HashMap::new()),
            conflicts_resolved: AtomicU64::new(0),
            announces_sent: AtomicU64::new(0),
            announces_received: AtomicU64::new(0),
        })
    }

    /// Register a name owned by this node and announce it cluster-wide
    pub async fn register(&self, name: &str, server_ref: ServerRef) -> ClusterResult<()> {
        let entry = {
            let mut entries = self.entries.write().await;
            if entries.contains_key(name) {
                return Err(ClusterError::GlobalNameConflict(name.to_string()));
            }
            let entry = GlobalEntry {
                name: name.to_string(),
                server_ref,
                registered_at: Utc::now().timestamp_millis(),
                owner_node_id: self.local.clone(),
            };
            entries.insert(name.to_string(), entry.clone());
            entry
        };

        info!("Registered global name '{}'", name);
        self.announce(vec![self.to_wire(&entry)], Vec::new()).await;
        Ok(())
    }

    /// Remove a name owned by this node and announce the removal
    pub async fn unregister(&self, name: &str) -> ClusterResult<()> {
        let removed = {
            let mut entries = self.entries.write().await;
            match entries.get(name) {
                Some(entry) if entry.owner_node_id == self.local => entries.remove(name),
                Some(_) => {
                    return Err(ClusterError::GlobalNameNotFound(format!(
                        "'{}' is not owned by this node",
                        name
                    )))
                }
                None => return Err(ClusterError::GlobalNameNotFound(name.to_string())),
            }
        };

        if let Some(entry) = removed {
            info!("Unregistered global name '{}'", name);
            self.announce(
                Vec::new(),
                vec![RegistryRemovalWire {
                    name: entry.name,
                    owner_node_id: entry.owner_node_id,
                }],
            )
            .await;
        }
        Ok(())
    }

    /// Remove a name regardless of owner, broadcasting a retraction that
    /// names the stored owner so every view converges. Used by distributed
    /// supervisors to clear a dead child's stale registration before
    /// respawning it elsewhere.
    pub async fn retract(&self, name: &str) -> ClusterResult<()> {
        let removed = {
            let mut entries = self.entries.write().await;
            entries.remove(name)
        };
        if let Some(entry) = removed {
            debug!("Retracted global name '{}' (owner {})", name, entry.owner_node_id);
            self.announce(
                Vec::new(),
                vec![RegistryRemovalWire {
                    name: entry.name,
                    owner_node_id: entry.owner_node_id,
                }],
            )
            .await;
        }
        Ok(())
    }

    /// Resolve a name, failing if it is unknown
    pub async fn lookup(&self, name: &str) -> ClusterResult<ServerRef> {
        self.whereis(name)
            .await
            .ok_or_else(|| ClusterError::GlobalNameNotFound(name.to_string()))
    }

    pub async fn whereis(&self, name: &str) -> Option<ServerRef> {
        let entries = self.entries.read().await;
        entries.get(name).map(|entry| entry.server_ref.clone())
    }

    pub async fn is_registered(&self, name: &str) -> bool {
        let entries = self.entries.read().await;
        entries.contains_key(name)
    }

    pub async fn get_names(&self) -> Vec<String> {
        let entries = self.entries.read().await;
        entries.keys().cloned().collect()
    }

    pub async fn get_entry(&self, name: &str) -> Option<GlobalEntry> {
        let entries = self.entries.read().await;
        entries.get(name).cloned()
    }

    /// Send this node's own registrations to a newly connected peer
    pub async fn sync_with(&self, node: &NodeId) {
        let owned: Vec<RegistryEntryWire> = {
            let entries = self.entries.read().await;
            entries
                .values()
                .filter(|entry| entry.owner_node_id == self.local)
                .map(|entry| self.to_wire(entry))
                .collect()
        };
        if owned.is_empty() {
            return;
        }
        debug!("Syncing {} global names with {}", owned.len(), node);
        let message = ClusterMessage::RegistryAnnounce {
            entries: owned,
            removed: Vec::new(),
        };
        if let Err(e) = self.transport.send(node, &message).await {
            debug!("Registry sync with {} failed: {}", node, e);
        } else {
            self.announces_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Merge an inbound announce through the conflict rule
    pub async fn handle_announce(
        &self,
        from: &NodeId,
        entries: Vec<RegistryEntryWire>,
        removed: Vec<RegistryRemovalWire>,
    ) {
        self.announces_received.fetch_add(1, Ordering::Relaxed);
        for wire in entries {
            self.merge(from, wire).await;
        }
        for removal in removed {
            let mut entries = self.entries.write().await;
            if let Some(entry) = entries.get(&removal.name) {
                // Only honored when the retraction names the stored owner.
                if entry.owner_node_id == removal.owner_node_id {
                    entries.remove(&removal.name);
                    debug!("Removed global name '{}' on retraction", removal.name);
                }
            }
        }
    }

    /// Merge an inbound conflict-resolution broadcast (same rule, already
    /// decided elsewhere; idempotent here).
    pub async fn handle_conflict_resolution(&self, from: &NodeId, winner: RegistryEntryWire) {
        self.merge(from, winner).await;
    }

    /// Drop every entry owned by a node that went down
    pub async fn on_node_down(&self, node: &NodeId) {
        let removed: Vec<String> = {
            let mut entries = self.entries.write().await;
            let names: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| &entry.owner_node_id == node)
                .map(|(name, _)| name.clone())
                .collect();
            for name in &names {
                entries.remove(name);
            }
            names
        };
        if !removed.is_empty() {
            info!(
                "Removed {} global names owned by down node {}",
                removed.len(),
                node
            );
        }
    }

    /// Clear the whole view; used on cluster stop
    pub async fn reset(&self) {
        let mut entries = self.entries.write().await;
        entries.clear();
    }

    pub async fn get_stats(&self) -> GlobalRegistryStats {
        let entries = self.entries.read().await;
        let owned = entries
            .values()
            .filter(|entry| entry.owner_node_id == self.local)
            .count();
        GlobalRegistryStats {
            entries: entries.len(),
            owned,
            conflicts_resolved: self.conflicts_resolved.load(Ordering::Relaxed),
            announces_sent: self.announces_sent.load(Ordering::Relaxed),
            announces_received: self.announces_received.load(Ordering::Relaxed),
        }
    }

    /// Apply the deterministic conflict rule to one incoming entry
    async fn merge(&self, from: &NodeId, wire: RegistryEntryWire) {
        let incoming = GlobalEntry {
            name: wire.name.clone(),
            server_ref: wire.server_ref.to_ref(&self.local),
            registered_at: wire.registered_at,
            owner_node_id: wire.owner_node_id.clone(),
        };

        enum Outcome {
            Inserted,
            AlreadyConverged,
            IncomingWon { loser: GlobalEntry },
            IncomingLost { winner: GlobalEntry },
        }

        let outcome = {
            let mut entries = self.entries.write().await;
            match entries.get(&incoming.name) {
                None => {
                    entries.insert(incoming.name.clone(), incoming.clone());
                    Outcome::Inserted
                }
                Some(existing) => {
                    if existing.owner_node_id == incoming.owner_node_id
                        && existing.registered_at == incoming.registered_at
                    {
                        Outcome::AlreadyConverged
                    } else if wins(&incoming, existing) {
                        let loser = existing.clone();
                        entries.insert(incoming.name.clone(), incoming.clone());
                        Outcome::IncomingWon { loser }
                    } else {
                        Outcome::IncomingLost {
                            winner: existing.clone(),
                        }
                    }
                }
            }
        };

        match outcome {
            Outcome::Inserted | Outcome::AlreadyConverged => {}
            Outcome::IncomingWon { loser } => {
                self.conflicts_resolved.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Global name conflict on '{}': {} wins over {}",
                    incoming.name, incoming.owner_node_id, loser.owner_node_id
                );
                if loser.owner_node_id == self.local {
                    // Tell the losing local process so it can reconcile.
                    self.runtime
                        .send_info(
                            loser.server_ref.id,
                            InfoMessage::NameConflict {
                                name: incoming.name.clone(),
                                winner: incoming.server_ref.clone(),
                            },
                        )
                        .await;
                }
                // Spread the winner so every view converges.
                self.transport
                    .broadcast(&ClusterMessage::RegistryConflictResolution {
                        winner: self.to_wire(&incoming),
                    })
                    .await;
            }
            Outcome::IncomingLost { winner } => {
                self.conflicts_resolved.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Global name conflict on '{}': keeping {}",
                    winner.name, winner.owner_node_id
                );
                // The sender holds the losing entry; reply with the winner.
                let _ = self
                    .transport
                    .send(
                        from,
                        &ClusterMessage::RegistryConflictResolution {
                            winner: self.to_wire(&winner),
                        },
                    )
                    .await;
            }
        }
    }

    async fn announce(&self, entries: Vec<RegistryEntryWire>, removed: Vec<RegistryRemovalWire>) {
        self.announces_sent.fetch_add(1, Ordering::Relaxed);
        self.transport
            .broadcast(&ClusterMessage::RegistryAnnounce { entries, removed })
            .await;
    }

    fn to_wire(&self, entry: &GlobalEntry) -> RegistryEntryWire {
        RegistryEntryWire {
            name: entry.name.clone(),
            server_ref: crate::message::SerializedRef::from_ref(&entry.server_ref, &self.local),
            registered_at: entry.registered_at,
            owner_node_id: entry.owner_node_id.clone(),
        }
    }
}

/// The deterministic conflict rule: earlier `registered_at` wins, ties break
/// on the smaller SHA-256 digest of the owner node id.
fn wins(candidate: &GlobalEntry, incumbent: &GlobalEntry) -> bool {
    if candidate.registered_at != incumbent.registered_at {
        return candidate.registered_at < incumbent.registered_at;
    }
    node_hash(&candidate.owner_node_id) < node_hash(&incumbent.owner_node_id)
}

fn node_hash(node: &NodeId) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(node.to_string().as_bytes());
    hasher.finalize().into()
}

impl std::fmt::Debug for GlobalRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalRegistry")
            .field("local", &self.local)
            .finish()
    }
}
