//! The unit the transport carries.
//!
//! Dynamically typed payloads in the source behavior become a tagged
//! variant here: [`EnvelopeKind`] names the shape, and [`Envelope::payload`]
//! stays a `serde_json::Value` fallback so forward-compatible mod-defined
//! payloads don't need a crate release to be carried, while every kind this
//! crate itself interprets gets a typed accessor.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain_types::{AgentId, EnvelopeId, ModName, Timestamp};

/// The kind of one framed message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// A synchronous system command (`register_agent`, `list_agents`, ...).
    SystemRequest,
    /// The orchestrator's reply to a system request.
    SystemResponse,
    /// A server-initiated liveness probe.
    Heartbeat,
    /// A peer's reply to a liveness probe.
    HeartbeatReply,
    /// An envelope addressed to exactly one agent.
    Direct,
    /// An envelope addressed to every other agent visible to this node.
    Broadcast,
    /// An envelope addressed to a named mod.
    ModMessage,
    /// A decentralized-topology presence digest, exchanged between nodes
    /// directly over a peer connection (never topology-routed).
    GossipDigest,
}

/// One framed message, self-contained and carried as-is by the transport and
/// topology layers: intermediate routers may annotate `relevant_agent_id`
/// but must never mutate `payload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// The envelope's kind.
    pub kind: EnvelopeKind,
    /// The agent id that originated this envelope.
    pub sender_id: AgentId,
    /// The agent id this envelope is addressed to, if any (absent for
    /// broadcast and some system envelopes).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<AgentId>,
    /// The mod this envelope is addressed to, required when `kind` is
    /// [`EnvelopeKind::ModMessage`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mod_name: Option<ModName>,
    /// A routing hint a topology hop may set without touching `payload`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relevant_agent_id: Option<AgentId>,
    /// Free-form, kind-specific payload.
    pub payload: Value,
    /// Server-assigned on first handling; absent on envelopes not yet
    /// accepted by a node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope_id: Option<EnvelopeId>,
    /// Creation timestamp.
    pub created_at: Timestamp,
}

impl Envelope {
    /// Builds a new envelope with no id assigned yet (server-assigned on
    /// first handling) and the current time as its creation timestamp.
    #[must_use]
    pub fn new(kind: EnvelopeKind, sender_id: AgentId, payload: Value) -> Self {
        Self {
            kind,
            sender_id,
            target_id: None,
            mod_name: None,
            relevant_agent_id: None,
            payload,
            envelope_id: None,
            created_at: Timestamp::now(),
        }
    }

    /// Sets the direct-message target and returns `self` for chaining.
    #[must_use]
    pub fn with_target(mut self, target_id: AgentId) -> Self {
        self.target_id = Some(target_id);
        self
    }

    /// Sets the addressed mod name and returns `self` for chaining.
    #[must_use]
    pub fn with_mod(mut self, mod_name: ModName) -> Self {
        self.mod_name = Some(mod_name);
        self
    }

    /// Assigns a server-side envelope id. Idempotent: does nothing if one is
    /// already set, since an envelope is assigned an id exactly once, on
    /// first handling.
    pub fn assign_id(&mut self, id: EnvelopeId) {
        if self.envelope_id.is_none() {
            self.envelope_id = Some(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(s: &str) -> AgentId {
        AgentId::try_new(s.to_string()).unwrap()
    }

    #[test]
    fn new_envelope_has_no_id_until_assigned() {
        let mut envelope = Envelope::new(EnvelopeKind::Direct, agent("alpha"), Value::Null)
            .with_target(agent("beta"));
        assert!(envelope.envelope_id.is_none());
        envelope.assign_id(EnvelopeId::new(1));
        assert_eq!(envelope.envelope_id.unwrap().into_inner(), 1);
        envelope.assign_id(EnvelopeId::new(2));
        assert_eq!(
            envelope.envelope_id.unwrap().into_inner(),
            1,
            "assigning an id twice must not overwrite the first"
        );
    }

    #[test]
    fn round_trips_through_json() {
        let envelope = Envelope::new(
            EnvelopeKind::ModMessage,
            agent("alpha"),
            serde_json::json!({"action": "send_direct_message"}),
        )
        .with_mod(ModName::try_new("thread_messaging".to_string()).unwrap());
        let json = serde_json::to_string(&envelope).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.sender_id, envelope.sender_id);
        assert_eq!(back.mod_name, envelope.mod_name);
    }
}
