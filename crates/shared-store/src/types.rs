//! Core types for actions, snapshots and replication roles

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Position of a stamped action in the host's total order
pub type SequenceId = u64;

/// Reserved action kind that hard-resets a replica to a snapshot
pub const SET_INITIAL_STATE: &str = "setInitialState";

/// Request a guest sends to fetch the host's snapshot
pub const GET_STATE_REQUEST: &str = "getState";

/// Notification carrying actions in both directions
pub const DISPATCH_NOTIFICATION: &str = "dispatch";

/// Fixed suffix of the shared service name
pub const SERVICE_NAME_SUFFIX: &str = "shared-store";

/// Name of the shared service for an application
pub fn service_name(app_id: &str) -> String {
    if app_id.is_empty() {
        SERVICE_NAME_SUFFIX.to_string()
    } else {
        format!("{}.{}", app_id, SERVICE_NAME_SUFFIX)
    }
}

/// A state-changing action
///
/// `sequence_id` is absent until the host has stamped the action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    /// Action type understood by the reducer
    pub kind: String,
    /// Opaque application payload
    #[serde(default)]
    pub payload: Value,
    /// Host-assigned position in the total order
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_id: Option<SequenceId>,
}

impl Action {
    /// Create an action without payload
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: Value::Null,
            sequence_id: None,
        }
    }

    /// Create an action carrying a payload
    pub fn with_payload(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            sequence_id: None,
        }
    }

    /// The reserved reset action carrying a full state
    pub fn set_initial_state(state: Value) -> Self {
        Self::with_payload(SET_INITIAL_STATE, state)
    }

    pub fn is_set_initial_state(&self) -> bool {
        self.kind == SET_INITIAL_STATE
    }

    pub fn is_stamped(&self) -> bool {
        self.sequence_id.is_some()
    }

    /// Return this action stamped with a sequence id
    pub fn stamped(mut self, sequence_id: SequenceId) -> Self {
        self.sequence_id = Some(sequence_id);
        self
    }

    /// Serialize for the transport
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Deserialize from the transport
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

/// Host state handed to a guest at attach time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    /// Host state with every action below `next_sequence_id` folded in
    pub state: Value,
    /// Sequence id the host will stamp next
    pub next_sequence_id: SequenceId,
}

/// Peer role in the current session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicatorRole {
    /// No session, state is local only
    #[default]
    None,
    /// Owns the authoritative state and stamps actions
    Host,
    /// Mirrors the host and proposes actions through it
    Guest,
}

/// Observable replication status of a store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationStatus {
    /// No session; dispatches apply directly
    #[default]
    Inactive,
    /// Serving guests as host
    Hosting,
    /// Guest waiting for the host snapshot
    Attaching,
    /// Guest replica is in sync with the host order
    Ready,
    /// Session active but the shared service is unavailable; local-only state
    Degraded,
    /// Guest bootstrap failed; no usable replica
    NotReady,
}

/// Configuration for a replicated store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Identity of the embedding application, prefixes the service name
    pub app_id: String,
    /// How long a guest waits for the host snapshot
    pub bootstrap_timeout_ms: u64,
    /// Capacity of the applied-action event channel
    pub event_capacity: usize,
}

impl ReplicationConfig {
    pub fn service_name(&self) -> String {
        service_name(&self.app_id)
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            bootstrap_timeout_ms: 10_000,
            event_capacity: 1000,
        }
    }
}

/// Stats about replication on this peer
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplicationStats {
    pub role: ReplicatorRole,
    pub status: ReplicationStatus,
    /// Next id the host stamps, or the next id a guest expects
    pub next_sequence_id: SequenceId,
    pub actions_applied: u64,
    pub actions_stamped: u64,
    pub actions_relayed: u64,
    pub actions_forwarded: u64,
    pub actions_parked: u64,
    pub actions_dropped: u64,
    pub pending_actions: usize,
}
