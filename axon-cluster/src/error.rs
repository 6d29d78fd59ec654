//! Error handling for the cluster fabric

use crate::message::NodeDownReason;
use axon_core::CoreError;
use thiserror::Error;

/// Result type used throughout the cluster fabric
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Main error type for the cluster fabric.
///
/// Configuration errors surface to the caller and are never retried;
/// connectivity errors reject pending cross-node operations while the
/// reconnect loop owns the retry; request-lifecycle errors are local-only
/// and delivered to the awaiting caller.
#[derive(Error, Debug, Clone)]
pub enum ClusterError {
    /// The cluster configuration failed validation
    #[error("Invalid cluster config: {0}")]
    InvalidClusterConfig(String),

    /// An operation requires a started cluster
    #[error("Cluster not started")]
    ClusterNotStarted,

    /// No behavior is registered under the requested name
    #[error("Behavior not found: {0}")]
    BehaviorNotFound(String),

    /// The node selector produced no candidate node
    #[error("No available node")]
    NoAvailableNode,

    /// The target node has no live connection
    #[error("Node not reachable: {0}")]
    NodeNotReachable(String),

    /// A peer node was declared down
    #[error("Node {node_id} down: {reason}")]
    NodeDown {
        node_id: String,
        reason: NodeDownReason,
    },

    /// A payload could not be serialized for the wire
    #[error("Message serialization failed: {0}")]
    Serialize(String),

    /// Inbound bytes could not be decoded or authenticated
    #[error("Message deserialization failed: {0}")]
    Deserialize(String),

    /// A remote call did not complete within its deadline
    #[error("Remote call timed out after {timeout_ms} ms")]
    RemoteCallTimeout { timeout_ms: u64 },

    /// The remote handler failed while serving a call
    #[error("Remote call failed: {0}")]
    RemoteCallFailed(String),

    /// The remote target process is not running
    #[error("Remote server not running: {0}")]
    RemoteServerNotRunning(String),

    /// A remote spawn did not complete within its deadline
    #[error("Remote spawn timed out after {timeout_ms} ms")]
    RemoteSpawnTimeout { timeout_ms: u64 },

    /// The remote behavior's init failed
    #[error("Remote spawn init failed: {0}")]
    RemoteSpawnInit(String),

    /// The remote registration step of a spawn failed
    #[error("Remote spawn registration failed: {0}")]
    RemoteSpawnRegistration(String),

    /// Monitor setup did not complete within its deadline
    #[error("Remote monitor setup timed out after {timeout_ms} ms")]
    RemoteMonitorTimeout { timeout_ms: u64 },

    /// Link setup did not complete within its deadline
    #[error("Remote link setup timed out after {timeout_ms} ms")]
    RemoteLinkTimeout { timeout_ms: u64 },

    /// The peer refused the link (target missing or not running)
    #[error("Remote link rejected: {0}")]
    RemoteLinkRejected(String),

    /// The global name is already taken
    #[error("Global name conflict: {0}")]
    GlobalNameConflict(String),

    /// The global name is not registered
    #[error("Global name not found: {0}")]
    GlobalNameNotFound(String),

    /// Socket-level failures
    #[error("I/O error: {0}")]
    Io(String),

    /// Errors from the local runtime
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl ClusterError {
    /// Create a new invalid-config error
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        Self::InvalidClusterConfig(msg.into())
    }

    /// Create a new serialize error
    pub fn serialize<S: Into<String>>(msg: S) -> Self {
        Self::Serialize(msg.into())
    }

    /// Create a new deserialize error
    pub fn deserialize<S: Into<String>>(msg: S) -> Self {
        Self::Deserialize(msg.into())
    }

    /// Create a new not-reachable error for a node
    pub fn not_reachable<S: Into<String>>(node: S) -> Self {
        Self::NodeNotReachable(node.into())
    }
}

impl From<std::io::Error> for ClusterError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
