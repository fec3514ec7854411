//! Agent registration, directory, discovery, and routing.
//!
//! Both variants named in spec §4.3 implement the same six-operation
//! contract; [`centralized`] and [`decentralized`] hold the concrete
//! behavior.

pub mod centralized;
pub mod decentralized;

use std::collections::HashSet;

use async_trait::async_trait;

use crate::domain_types::{AgentId, PeerHandle};
use crate::envelope::Envelope;
use crate::error::TopologyError;
use crate::peer::AgentInfo;

/// The result of routing one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// The envelope was handed to the target's transport.
    Delivered,
    /// The target's location is not yet known; the envelope was queued
    /// pending discovery.
    Queued,
}

/// Shared contract implemented by both topology variants.
#[async_trait]
pub trait Topology: Send + Sync {
    /// Registers `agent_id` as reachable via local `peer`.
    ///
    /// # Errors
    ///
    /// Returns a [`TopologyError`] wrapping the underlying registry error on
    /// a rejected duplicate registration, or a transport error if a remote
    /// round-trip (client role) fails.
    async fn register_agent(
        &self,
        peer: PeerHandle,
        agent_id: AgentId,
        metadata: std::collections::HashMap<String, String>,
        capabilities: HashSet<String>,
        force: bool,
    ) -> Result<(), TopologyError>;

    /// Removes `agent_id` from the directory this node can see.
    async fn unregister_agent(&self, agent_id: &AgentId);

    /// Returns the directory entries visible to this node, optionally
    /// filtered by a required capability.
    async fn discover_agents(&self, capability_filter: Option<&str>) -> Vec<AgentInfo>;

    /// Routes `envelope` toward its `target_id` (direct) or to every other
    /// known agent (broadcast).
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::TargetUnreachable`] if the target cannot be
    /// located by any means available to this topology.
    async fn route(&self, envelope: Envelope) -> Result<RouteOutcome, TopologyError>;

    /// Starts background tasks (gossip ticker, coordinator dial) for this
    /// topology instance.
    async fn start(&self) -> Result<(), TopologyError>;

    /// Stops background tasks and releases resources.
    async fn shutdown(&self);
}
