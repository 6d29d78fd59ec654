//! # Axon Core Runtime
//!
//! This crate provides the local half of the Axon actor runtime: GenServer
//! processes with sequential mailbox dispatch, OTP-style supervisors with
//! restart strategies, a local name registry, node identifiers, and the
//! lifecycle event stream consumed by the cluster fabric and observers.

pub mod error;
pub mod events;
pub mod genserver;
pub mod node_id;
pub mod registry;
pub mod supervisor;
pub mod types;

// Re-export commonly used types
pub use error::{CoreError, CoreResult};
pub use events::{EventBus, LifecycleEvent};
pub use genserver::{
    Behavior, GenServerOptions, Runtime, ServerStats, ServerStatus, TerminationHook,
};
pub use node_id::NodeId;
pub use registry::LocalRegistry;
pub use supervisor::{
    AutoShutdown, BehaviorFactory, ChildCounts, ChildSnapshot, ChildSpec, ChildStatus,
    ChildTemplate, RestartIntensity, RestartPolicy, RestartWindow, Strategy, Supervisor,
    SupervisorHandle, SupervisorOptions,
};
pub use types::{ExitReason, InfoMessage, ServerId, ServerRef};
