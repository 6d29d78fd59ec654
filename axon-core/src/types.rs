//! Core types used throughout the Axon runtime

use crate::node_id::NodeId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Process identifier, unique within its owning node for the node's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerId(pub Uuid);

impl ServerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ServerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Externally usable identity of a process. A missing node id means the
/// process is local to the current node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerRef {
    pub id: ServerId,
    pub node_id: Option<NodeId>,
}

impl ServerRef {
    /// Reference to a process on the current node
    pub fn local(id: ServerId) -> Self {
        Self { id, node_id: None }
    }

    /// Reference to a process on a specific node
    pub fn remote(id: ServerId, node_id: NodeId) -> Self {
        Self {
            id,
            node_id: Some(node_id),
        }
    }

    pub fn is_local(&self) -> bool {
        self.node_id.is_none()
    }
}

impl std::fmt::Display for ServerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.node_id {
            Some(node) => write!(f, "{}@{}", self.id, node),
            None => write!(f, "{}", self.id),
        }
    }
}

/// Why a process exited.
///
/// `Normal` and `Shutdown` are orderly terminations; `Error` is a crash.
/// `Noproc` and `Noconnection` only occur as propagated reasons: the former
/// when a monitored process was already gone at monitor setup, the latter
/// when the node hosting the peer was declared down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitReason {
    Normal,
    Shutdown,
    Error { message: String },
    Noproc,
    Noconnection,
}

impl ExitReason {
    /// Create a crash reason from any displayable error
    pub fn error<S: Into<String>>(message: S) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Whether this reason counts as an abnormal exit for restart policies
    /// and link propagation. `Normal` and `Shutdown` are expected exits.
    pub fn is_abnormal(&self) -> bool {
        !matches!(self, Self::Normal | Self::Shutdown)
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Shutdown => write!(f, "shutdown"),
            Self::Error { message } => write!(f, "error: {}", message),
            Self::Noproc => write!(f, "noproc"),
            Self::Noconnection => write!(f, "noconnection"),
        }
    }
}

/// Messages delivered to a behavior's `handle_info` callback
#[derive(Debug, Clone)]
pub enum InfoMessage {
    /// An exit signal from a linked process, delivered instead of killing
    /// the receiver because it traps exits
    ExitSignal { from: ServerRef, reason: ExitReason },

    /// A monitored process terminated
    Down {
        monitor_id: Uuid,
        from: ServerRef,
        reason: ExitReason,
    },

    /// This process lost a global name to a concurrent registration
    NameConflict { name: String, winner: ServerRef },

    /// An ordinary out-of-band message
    Message(Value),
}
