//! Wire vocabulary: the tagged cluster message union and its helper types
//!
//! Every inbound frame deserializes to an envelope whose payload is one of
//! these tags; the cluster dispatcher routes purely on the tag.

use axon_core::{ExitReason, NodeId, ServerId, ServerRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Why a node was declared down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeDownReason {
    HeartbeatTimeout,
    ConnectionClosed,
    ConnectionRefused,
    GracefulShutdown,
}

impl std::fmt::Display for NodeDownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::ConnectionClosed => "connection_closed",
            Self::ConnectionRefused => "connection_refused",
            Self::GracefulShutdown => "graceful_shutdown",
        };
        write!(f, "{}", s)
    }
}

/// Name registration applied to a remotely spawned process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Registration {
    None,
    Local,
    Global,
}

/// Wire form of a process reference; always carries the origin node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedRef {
    pub id: ServerId,
    pub node_id: NodeId,
}

impl SerializedRef {
    pub fn new(id: ServerId, node_id: NodeId) -> Self {
        Self { id, node_id }
    }

    /// Wire form of a local or remote reference
    pub fn from_ref(server_ref: &ServerRef, local: &NodeId) -> Self {
        Self {
            id: server_ref.id,
            node_id: server_ref.node_id.clone().unwrap_or_else(|| local.clone()),
        }
    }

    /// Usable reference: local refs lose their node id
    pub fn to_ref(&self, local: &NodeId) -> ServerRef {
        if &self.node_id == local {
            ServerRef::local(self.id)
        } else {
            ServerRef::remote(self.id, self.node_id.clone())
        }
    }
}

impl std::fmt::Display for SerializedRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.node_id)
    }
}

/// Result of a remote call, as carried by `call_reply`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallOutcome {
    Ok { value: Value },
    Error { kind: CallErrorKind, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallErrorKind {
    ServerNotRunning,
    HandlerError,
    Timeout,
}

/// Result of a remote spawn, as carried by `spawn_reply`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SpawnOutcome {
    Ok { server_id: ServerId },
    Error { kind: SpawnErrorKind, detail: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnErrorKind {
    BehaviorNotFound,
    InitFailed,
    RegistrationFailed,
}

/// One global-registry entry on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntryWire {
    pub name: String,
    pub server_ref: SerializedRef,
    pub registered_at: i64,
    pub owner_node_id: NodeId,
}

/// A retraction of a global name, honored when the stored owner matches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryRemovalWire {
    pub name: String,
    pub owner_node_id: NodeId,
}

/// The cluster message union. Tag names are the wire protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterMessage {
    Heartbeat {
        process_count: usize,
        uptime_ms: u64,
    },
    NodeDown {
        node_id: NodeId,
        reason: NodeDownReason,
    },
    CallRequest {
        call_id: Uuid,
        target_server_id: ServerId,
        payload: Value,
    },
    CallReply {
        call_id: Uuid,
        result: CallOutcome,
    },
    Cast {
        target_server_id: ServerId,
        payload: Value,
    },
    SpawnRequest {
        spawn_id: Uuid,
        behavior_name: String,
        name: Option<String>,
        registration: Registration,
        init_timeout_ms: u64,
    },
    SpawnReply {
        spawn_id: Uuid,
        result: SpawnOutcome,
    },
    MonitorRequest {
        monitor_id: Uuid,
        monitoring: SerializedRef,
        monitored: SerializedRef,
    },
    MonitorAck {
        monitor_id: Uuid,
        success: bool,
        reason: Option<String>,
    },
    DemonitorRequest {
        monitor_id: Uuid,
    },
    ProcessDown {
        monitor_id: Uuid,
        monitored: SerializedRef,
        reason: ExitReason,
    },
    LinkRequest {
        link_id: Uuid,
        from: SerializedRef,
        to: SerializedRef,
    },
    LinkAck {
        link_id: Uuid,
        success: bool,
        reason: Option<String>,
    },
    UnlinkRequest {
        link_id: Uuid,
    },
    ExitSignal {
        link_id: Uuid,
        from: SerializedRef,
        to: SerializedRef,
        reason: ExitReason,
    },
    RegistryAnnounce {
        entries: Vec<RegistryEntryWire>,
        removed: Vec<RegistryRemovalWire>,
    },
    RegistryConflictResolution {
        winner: RegistryEntryWire,
    },
}

impl ClusterMessage {
    /// The wire tag, mostly for logging
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Heartbeat { .. } => "heartbeat",
            Self::NodeDown { .. } => "node_down",
            Self::CallRequest { .. } => "call_request",
            Self::CallReply { .. } => "call_reply",
            Self::Cast { .. } => "cast",
            Self::SpawnRequest { .. } => "spawn_request",
            Self::SpawnReply { .. } => "spawn_reply",
            Self::MonitorRequest { .. } => "monitor_request",
            Self::MonitorAck { .. } => "monitor_ack",
            Self::DemonitorRequest { .. } => "demonitor_request",
            Self::ProcessDown { .. } => "process_down",
            Self::LinkRequest { .. } => "link_request",
            Self::LinkAck { .. } => "link_ack",
            Self::UnlinkRequest { .. } => "unlink_request",
            Self::ExitSignal { .. } => "exit_signal",
            Self::RegistryAnnounce { .. } => "registry_announce",
            Self::RegistryConflictResolution { .. } => "registry_conflict_resolution",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn messages_carry_snake_case_tags() {
        let msg = ClusterMessage::Heartbeat {
            process_count: 3,
            uptime_ms: 1000,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "heartbeat");

        let msg = ClusterMessage::CallRequest {
            call_id: Uuid::new_v4(),
            target_server_id: ServerId::new(),
            payload: json!({"op": "get"}),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "call_request");
        assert_eq!(msg.tag(), "call_request");
    }

    #[test]
    fn serialized_ref_round_trips() {
        let local = NodeId::parse("a@h1:1000").unwrap();
        let remote = NodeId::parse("b@h2:1000").unwrap();
        let id = ServerId::new();

        let wire = SerializedRef::new(id, remote.clone());
        assert_eq!(wire.to_ref(&local), ServerRef::remote(id, remote));

        let wire = SerializedRef::new(id, local.clone());
        assert_eq!(wire.to_ref(&local), ServerRef::local(id));

        let as_wire = SerializedRef::from_ref(&ServerRef::local(id), &local);
        assert_eq!(as_wire.node_id, local);
    }

    #[test]
    fn all_required_tags_deserialize() {
        for tag in [
            "heartbeat",
            "node_down",
            "call_request",
            "call_reply",
            "cast",
            "spawn_request",
            "spawn_reply",
            "monitor_request",
            "monitor_ack",
            "demonitor_request",
            "process_down",
            "link_request",
            "link_ack",
            "unlink_request",
            "exit_signal",
            "registry_announce",
            "registry_conflict_resolution",
        ] {
            // Build a representative value for each tag and make sure the
            // union dispatches on it.
            let id = Uuid::new_v4();
            let server_id = ServerId::new();
            let node = "n@h:1";
            let sref = json!({"id": server_id, "node_id": node});
            let value = match tag {
                "heartbeat" => json!({"type": tag, "process_count": 0, "uptime_ms": 0}),
                "node_down" => json!({"type": tag, "node_id": node, "reason": "graceful_shutdown"}),
                "call_request" => {
                    json!({"type": tag, "call_id": id, "target_server_id": server_id, "payload": 1})
                }
                "call_reply" => {
                    json!({"type": tag, "call_id": id, "result": {"status": "ok", "value": 1}})
                }
                "cast" => json!({"type": tag, "target_server_id": server_id, "payload": 1}),
                "spawn_request" => json!({
                    "type": tag, "spawn_id": id, "behavior_name": "w",
                    "name": null, "registration": "none", "init_timeout_ms": 5000
                }),
                "spawn_reply" => json!({
                    "type": tag, "spawn_id": id,
                    "result": {"status": "ok", "server_id": server_id}
                }),
                "monitor_request" => {
                    json!({"type": tag, "monitor_id": id, "monitoring": sref, "monitored": sref})
                }
                "monitor_ack" => {
                    json!({"type": tag, "monitor_id": id, "success": true, "reason": null})
                }
                "demonitor_request" => json!({"type": tag, "monitor_id": id}),
                "process_down" => json!({
                    "type": tag, "monitor_id": id, "monitored": sref,
                    "reason": {"kind": "noconnection"}
                }),
                "link_request" => json!({"type": tag, "link_id": id, "from": sref, "to": sref}),
                "link_ack" => json!({"type": tag, "link_id": id, "success": false, "reason": "noproc"}),
                "unlink_request" => json!({"type": tag, "link_id": id}),
                "exit_signal" => json!({
                    "type": tag, "link_id": id, "from": sref, "to": sref,
                    "reason": {"kind": "error", "message": "boom"}
                }),
                "registry_announce" => json!({"type": tag, "entries": [], "removed": []}),
                "registry_conflict_resolution" => json!({
                    "type": tag,
                    "winner": {"name": "svc", "server_ref": sref, "registered_at": 1, "owner_node_id": node}
                }),
                _ => unreachable!(),
            };
            let msg: ClusterMessage =
                serde_json::from_value(value).unwrap_or_else(|e| panic!("{}: {}", tag, e));
            assert_eq!(msg.tag(), tag);
        }
    }
}
