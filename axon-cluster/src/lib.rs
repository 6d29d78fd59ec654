//! # Axon Cluster Fabric
//!
//! The distributed half of the Axon runtime: TCP-framed authenticated
//! transport with reconnecting peer links, heartbeat-driven membership,
//! remote call/cast, remote spawn of pre-registered behaviors, a
//! cluster-wide name registry with coordinator-free conflict resolution,
//! remote monitors and links, and a distributed supervisor with failover
//! on node loss.

pub mod cluster;
pub mod config;
pub mod connection;
pub mod dist_supervisor;
pub mod error;
pub mod global_registry;
pub mod link;
pub mod membership;
pub mod message;
pub mod monitor;
pub mod remote_call;
pub mod serializer;
pub mod spawn;
pub mod transport;

// Re-export commonly used types
pub use cluster::{Cluster, ClusterStats};
pub use config::ClusterConfig;
pub use connection::{ConnectionState, ConnectionStats, ReconnectPolicy};
pub use dist_supervisor::{
    DistChildSpec, DistChildTemplate, DistSupervisor, DistSupervisorEvent, DistSupervisorHandle,
    DistSupervisorOptions, DistSupervisorStats, NodeSelector,
};
pub use error::{ClusterError, ClusterResult};
pub use global_registry::{GlobalEntry, GlobalRegistry};
pub use link::{LinkRef, LinkStats};
pub use membership::{MembershipEvent, NodeInfo, NodeStatus};
pub use message::{ClusterMessage, NodeDownReason, Registration, SerializedRef};
pub use monitor::{MonitorRef, MonitorStats};
pub use serializer::{Envelope, MessageSerializer, DEFAULT_MAX_FRAME_SIZE, PROTOCOL_VERSION};
pub use spawn::{BehaviorRegistry, SpawnOptions};
pub use transport::{Transport, TransportEvent};

// The local runtime is part of the public surface of this crate.
pub use axon_core::{
    Behavior, CoreError, ExitReason, GenServerOptions, InfoMessage, LifecycleEvent, NodeId,
    Runtime, ServerId, ServerRef,
};
