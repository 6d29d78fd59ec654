//! Error handling for the Axon core runtime

use thiserror::Error;

/// Result type used throughout the core runtime
pub type CoreResult<T> = Result<T, CoreError>;

/// Main error type for the core runtime
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    /// The target process does not exist or is not in the running state
    #[error("Server not running: {0}")]
    ServerNotRunning(String),

    /// A synchronous call did not receive a reply within its deadline
    #[error("Call timed out after {timeout_ms} ms")]
    CallTimeout { timeout_ms: u64 },

    /// The behavior's init callback returned an error
    #[error("Init failed: {0}")]
    InitFailed(String),

    /// The behavior's init callback exceeded its deadline
    #[error("Init timed out after {timeout_ms} ms")]
    InitTimeout { timeout_ms: u64 },

    /// A call or info handler returned an error
    #[error("Handler error: {0}")]
    Handler(String),

    /// The target process terminated before the operation completed
    #[error("Server terminated: {0}")]
    Terminated(String),

    /// A local name is already bound to another process
    #[error("Name already registered: {0}")]
    NameAlreadyRegistered(String),

    /// No process is bound to the requested local name
    #[error("Name not found: {0}")]
    NameNotFound(String),

    /// A child spec with the same id already exists in the supervisor
    #[error("Duplicate child id: {0}")]
    DuplicateChild(String),

    /// No child with the requested id exists in the supervisor
    #[error("Child not found: {0}")]
    ChildNotFound(String),

    /// A simple_one_for_one supervisor was started without a child template
    #[error("Missing child template for simple_one_for_one supervisor")]
    MissingChildTemplate,

    /// A simple_one_for_one supervisor was misconfigured
    #[error("Invalid simple_one_for_one configuration: {0}")]
    InvalidSimpleOneForOne(String),

    /// The supervisor exceeded its restart intensity and gave up
    #[error("Max restarts exceeded: {max_restarts} within {within_ms} ms")]
    MaxRestartsExceeded { max_restarts: u32, within_ms: u64 },

    /// The supervisor is no longer accepting commands
    #[error("Supervisor not running: {0}")]
    SupervisorNotRunning(String),

    /// A node identifier string failed lexical validation
    #[error("Invalid node id: {0}")]
    InvalidNodeId(String),

    /// Internal runtime errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Create a new server-not-running error
    pub fn server_not_running<S: Into<String>>(msg: S) -> Self {
        Self::ServerNotRunning(msg.into())
    }

    /// Create a new init-failed error
    pub fn init_failed<S: Into<String>>(msg: S) -> Self {
        Self::InitFailed(msg.into())
    }

    /// Create a new handler error
    pub fn handler<S: Into<String>>(msg: S) -> Self {
        Self::Handler(msg.into())
    }

    /// Create a new invalid-node-id error
    pub fn invalid_node_id<S: Into<String>>(msg: S) -> Self {
        Self::InvalidNodeId(msg.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }
}
