//! Lifecycle event stream for processes and supervisors
//!
//! Events flow outward from the runtime to any subscriber: supervisors use
//! them to observe child deaths, the cluster fabric uses them to fan out
//! monitor notifications and link signals, and observers consume them
//! read-only.

use crate::types::{ExitReason, ServerId};
use tokio::sync::broadcast;
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Lifecycle events emitted by the runtime and by supervisors
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// A process finished init and entered the running state
    Started {
        server_id: ServerId,
        name: Option<String>,
    },

    /// A process reached its terminal state; all cleanup has completed
    Terminated {
        server_id: ServerId,
        name: Option<String>,
        reason: ExitReason,
    },

    /// A supervisor started
    SupervisorStarted { supervisor_id: Uuid },

    /// A supervisor terminated; its children are already stopped
    SupervisorTerminated {
        supervisor_id: Uuid,
        reason: ExitReason,
    },

    /// A supervisor started a child
    ChildStarted {
        supervisor_id: Uuid,
        child_id: String,
        server_id: ServerId,
    },

    /// A supervisor restarted a child under a new process id
    ChildRestarted {
        supervisor_id: Uuid,
        child_id: String,
        server_id: ServerId,
    },

    /// A supervised child stopped and will not be restarted
    ChildTerminated {
        supervisor_id: Uuid,
        child_id: String,
        reason: ExitReason,
    },
}

/// Broadcast bus for lifecycle events.
///
/// Subscribers that fall behind lose the oldest events; sizing the channel
/// above any realistic burst keeps delivery lossless in practice.
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribe to the event stream. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all current subscribers
    pub fn emit(&self, event: LifecycleEvent) {
        // A send error only means there are no subscribers right now.
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
