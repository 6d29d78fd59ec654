//! Cluster configuration and validation

use crate::error::{ClusterError, ClusterResult};
use crate::serializer::DEFAULT_MAX_FRAME_SIZE;
use axon_core::NodeId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default port, shared with the Erlang port mapper out of tradition
pub const DEFAULT_PORT: u16 = 4369;

/// Cluster-wide configuration. All durations are milliseconds so the struct
/// deserializes naturally from JSON config files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Node name, the part before `@` in the node id
    pub node_name: String,

    /// Host used both for binding the listener and for the node identity
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Seed node ids (`name@host:port`) dialed at startup
    #[serde(default)]
    pub seeds: Vec<String>,

    /// Shared secret for HMAC envelope authentication
    #[serde(default)]
    pub cluster_secret: Option<String>,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_heartbeat_miss_threshold")]
    pub heartbeat_miss_threshold: u32,

    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,

    /// 0 means reconnect forever
    #[serde(default)]
    pub reconnect_max_attempts: u32,

    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Deadline for remote monitor and link setup handshakes
    #[serde(default = "default_setup_timeout_ms")]
    pub setup_timeout_ms: u64,

    #[serde(default = "default_spawn_timeout_ms")]
    pub spawn_timeout_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_heartbeat_interval_ms() -> u64 {
    5000
}

fn default_heartbeat_miss_threshold() -> u32 {
    3
}

fn default_reconnect_base_delay_ms() -> u64 {
    1000
}

fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

fn default_call_timeout_ms() -> u64 {
    5000
}

fn default_setup_timeout_ms() -> u64 {
    10_000
}

fn default_spawn_timeout_ms() -> u64 {
    10_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_shutdown_timeout_ms() -> u64 {
    5000
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

impl ClusterConfig {
    pub fn new<S: Into<String>>(node_name: S) -> Self {
        Self {
            node_name: node_name.into(),
            host: default_host(),
            port: default_port(),
            seeds: Vec::new(),
            cluster_secret: None,
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_miss_threshold: default_heartbeat_miss_threshold(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            reconnect_max_attempts: 0,
            call_timeout_ms: default_call_timeout_ms(),
            setup_timeout_ms: default_setup_timeout_ms(),
            spawn_timeout_ms: default_spawn_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            max_frame_size: default_max_frame_size(),
        }
    }

    pub fn with_host<S: Into<String>>(mut self, host: S) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_seeds<I, S>(mut self, seeds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.seeds = seeds.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_secret<S: Into<String>>(mut self, secret: S) -> Self {
        self.cluster_secret = Some(secret.into());
        self
    }

    pub fn with_heartbeat(mut self, interval_ms: u64, miss_threshold: u32) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self.heartbeat_miss_threshold = miss_threshold;
        self
    }

    pub fn with_reconnect(mut self, base_delay_ms: u64, max_delay_ms: u64, max_attempts: u32) -> Self {
        self.reconnect_base_delay_ms = base_delay_ms;
        self.reconnect_max_delay_ms = max_delay_ms;
        self.reconnect_max_attempts = max_attempts;
        self
    }

    /// The node id this configuration describes
    pub fn node_id(&self) -> ClusterResult<NodeId> {
        NodeId::new(&self.node_name, &self.host, self.port)
            .map_err(|e| ClusterError::invalid_config(e.to_string()))
    }

    /// Parsed seed node ids
    pub fn seed_node_ids(&self) -> ClusterResult<Vec<NodeId>> {
        self.seeds
            .iter()
            .map(|s| {
                NodeId::parse(s)
                    .map_err(|e| ClusterError::invalid_config(format!("bad seed '{}': {}", s, e)))
            })
            .collect()
    }

    /// Validate the whole configuration
    pub fn validate(&self) -> ClusterResult<()> {
        self.node_id()?;
        self.seed_node_ids()?;
        if self.heartbeat_interval_ms == 0 {
            return Err(ClusterError::invalid_config("heartbeat_interval_ms must be > 0"));
        }
        if self.heartbeat_miss_threshold == 0 {
            return Err(ClusterError::invalid_config(
                "heartbeat_miss_threshold must be > 0",
            ));
        }
        if self.reconnect_base_delay_ms == 0 {
            return Err(ClusterError::invalid_config(
                "reconnect_base_delay_ms must be > 0",
            ));
        }
        if self.reconnect_max_delay_ms < self.reconnect_base_delay_ms {
            return Err(ClusterError::invalid_config(
                "reconnect_max_delay_ms must be >= reconnect_base_delay_ms",
            ));
        }
        if self.max_frame_size == 0 {
            return Err(ClusterError::invalid_config("max_frame_size must be > 0"));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_millis(self.setup_timeout_ms)
    }

    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_millis(self.spawn_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
