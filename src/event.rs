//! Outward activity events
//!
//! Every state change the engine wants a UI to see is expressed as an
//! [`ActivityEvent`] and published on an [`EventStream`]. The engine never
//! knows how (or whether) the events are rendered.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;
use tracing::trace;

/// Opaque agent identifier, assigned monotonically by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub u32);

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Coarse activity state of one agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AgentStatus {
    /// Working (assumed until proven idle)
    #[default]
    Active,
    /// Finished its turn, waiting for the human
    Waiting,
    /// A non-exempt tool has been open past the permission threshold
    PermissionPending,
}

/// Event published to the UI collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ActivityEvent {
    AgentToolStart {
        agent_id: AgentId,
        tool_id: String,
        status: String,
    },
    AgentToolDone {
        agent_id: AgentId,
        tool_id: String,
    },
    AgentToolsClear {
        agent_id: AgentId,
    },
    AgentStatus {
        agent_id: AgentId,
        status: AgentStatus,
    },
    SubagentToolStart {
        agent_id: AgentId,
        parent_tool_id: String,
        tool_id: String,
        status: String,
    },
    SubagentToolDone {
        agent_id: AgentId,
        parent_tool_id: String,
        tool_id: String,
    },
    SubagentClear {
        agent_id: AgentId,
        parent_tool_id: String,
    },
    AgentPermission {
        agent_id: AgentId,
    },
    AgentPermissionClear {
        agent_id: AgentId,
    },
    SubagentPermission {
        agent_id: AgentId,
        parent_tool_id: String,
    },
}

impl ActivityEvent {
    /// Get the agent id from any event
    pub fn agent_id(&self) -> AgentId {
        match self {
            Self::AgentToolStart { agent_id, .. }
            | Self::AgentToolDone { agent_id, .. }
            | Self::AgentToolsClear { agent_id }
            | Self::AgentStatus { agent_id, .. }
            | Self::SubagentToolStart { agent_id, .. }
            | Self::SubagentToolDone { agent_id, .. }
            | Self::SubagentClear { agent_id, .. }
            | Self::AgentPermission { agent_id }
            | Self::AgentPermissionClear { agent_id }
            | Self::SubagentPermission { agent_id, .. } => *agent_id,
        }
    }
}

/// Sending half of the outward event channel.
#[derive(Debug, Clone)]
pub struct EventStream {
    tx: broadcast::Sender<ActivityEvent>,
}

/// Receiving half handed to UI consumers.
#[derive(Debug)]
pub struct EventRx {
    rx: broadcast::Receiver<ActivityEvent>,
}

impl EventStream {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn send(&self, event: ActivityEvent) {
        trace!(?event, "activity event");
        let _ = self.tx.send(event);
    }

    /// Subscribe to activity events.
    ///
    /// The receiver swallows `broadcast::RecvError::Lagged`: a slow consumer
    /// loses the oldest events rather than stalling the engine.
    pub fn subscribe(&self) -> EventRx {
        EventRx {
            rx: self.tx.subscribe(),
        }
    }
}

impl EventRx {
    pub async fn recv(&mut self) -> Option<ActivityEvent> {
        loop {
            match self.rx.recv().await {
                Ok(ev) => return Some(ev),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive; `None` when nothing is queued.
    pub fn try_recv(&mut self) -> Option<ActivityEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(ev) => return Some(ev),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
