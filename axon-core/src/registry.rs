//! Local name registry
//!
//! Maps names to processes on the current node. Entries are removed
//! automatically when the named process terminates.

use crate::error::{CoreError, CoreResult};
use crate::types::{ServerId, ServerRef};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Node-local name → process mapping
#[derive(Debug, Default)]
pub struct LocalRegistry {
    names: RwLock<HashMap<String, ServerRef>>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self {
            names: RwLock::new(HashMap::new()),
        }
    }

    /// Bind a name to a process. Fails if the name is taken.
    pub async fn register(&self, name: &str, server_ref: ServerRef) -> CoreResult<()> {
        let mut names = self.names.write().await;
        if names.contains_key(name) {
            return Err(CoreError::NameAlreadyRegistered(name.to_string()));
        }
        names.insert(name.to_string(), server_ref);
        debug!("Registered local name '{}'", name);
        Ok(())
    }

    /// Remove a name binding
    pub async fn unregister(&self, name: &str) -> CoreResult<ServerRef> {
        let mut names = self.names.write().await;
        names
            .remove(name)
            .ok_or_else(|| CoreError::NameNotFound(name.to_string()))
    }

    /// Remove any binding pointing at the given process id
    pub async fn unregister_id(&self, server_id: ServerId) {
        let mut names = self.names.write().await;
        names.retain(|_, server_ref| server_ref.id != server_id);
    }

    /// Resolve a name, failing if it is not bound
    pub async fn lookup(&self, name: &str) -> CoreResult<ServerRef> {
        self.whereis(name)
            .await
            .ok_or_else(|| CoreError::NameNotFound(name.to_string()))
    }

    /// Resolve a name, returning `None` if it is not bound
    pub async fn whereis(&self, name: &str) -> Option<ServerRef> {
        let names = self.names.read().await;
        names.get(name).cloned()
    }

    pub async fn is_registered(&self, name: &str) -> bool {
        let names = self.names.read().await;
        names.contains_key(name)
    }

    /// All currently bound names
    pub async fn names(&self) -> Vec<String> {
        let names = self.names.read().await;
        names.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        let names = self.names.read().await;
        names.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
