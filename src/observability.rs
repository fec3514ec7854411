//! Structured events for the node's lifecycle, carried over `tracing` so a
//! subscriber can route them to logs, a collector, or both, without this
//! crate depending on any particular backend.
//!
//! Adapted from the teacher's `AgentEvent`/`AgentEventType` pair to this
//! crate's envelope/peer vocabulary: connection lifecycle, registration,
//! and mod dispatch outcomes replace agent state transitions and FIPA
//! message events.

use serde::{Deserialize, Serialize};
use tracing::info_span;

use crate::domain_types::{AgentId, ModName, NodeId, PeerHandle, Timestamp};

/// One occurrence worth surfacing to an operator or a metrics pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NetworkEvent {
    /// A peer completed its transport-level connection.
    PeerConnected {
        /// The accepted peer's handle.
        peer: PeerHandle,
    },
    /// A peer's connection was torn down, gracefully or otherwise.
    PeerDisconnected {
        /// The peer's handle.
        peer: PeerHandle,
        /// Whether the peer bound an agent identity before disconnecting.
        had_agent: bool,
    },
    /// An agent successfully registered (first time, or via
    /// `force_reconnect`).
    AgentRegistered {
        /// The registered agent's id.
        agent_id: AgentId,
        /// Whether this registration displaced an existing connection.
        reconnected: bool,
    },
    /// An agent explicitly unregistered.
    AgentUnregistered {
        /// The unregistered agent's id.
        agent_id: AgentId,
    },
    /// A peer was reaped for missing too many heartbeat replies.
    PeerReaped {
        /// The reaped peer's handle.
        peer: PeerHandle,
    },
    /// A mod's `on_envelope` returned an error. The envelope that triggered
    /// it is not retried; the error is confined to that one delivery.
    ModDispatchFailed {
        /// The mod that failed.
        mod_name: ModName,
        /// The failure, rendered as text (mods report `Box<dyn Error>`).
        error: String,
    },
}

/// A `NetworkEvent` plus the node and time it occurred at, the shape
/// forwarded to any external collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// The node that recorded this event.
    pub node_id: String,
    /// When it occurred.
    pub recorded_at: Timestamp,
    /// The event itself.
    pub event: NetworkEvent,
}

/// Emits `event` as a structured `tracing` record at the node's current
/// info span, and returns it wrapped with node id and timestamp for any
/// caller that also wants to forward it elsewhere (a metrics sink, a
/// snapshot of recent activity, a test assertion).
pub fn record(node_id: &NodeId, event: NetworkEvent) -> RecordedEvent {
    let recorded = RecordedEvent {
        node_id: node_id.to_string(),
        recorded_at: Timestamp::now(),
        event,
    };
    tracing::info!(node_id = %node_id, event = ?recorded.event, "network event");
    recorded
}

/// Builds the span that should bracket one peer connection's lifetime,
/// from accept/dial through teardown. Call once per connection and enter
/// it for the duration of that connection's reader/writer tasks.
#[must_use]
pub fn connection_span(peer: PeerHandle) -> tracing::Span {
    info_span!("connection", peer = ?peer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_stamps_node_id_and_time() {
        let node_id = NodeId::generate();
        let recorded = record(
            &node_id,
            NetworkEvent::PeerReaped {
                peer: PeerHandle::from_counter(7),
            },
        );
        assert_eq!(recorded.node_id, node_id.to_string());
        assert!(recorded.recorded_at.as_millis() > 0);
    }
}
