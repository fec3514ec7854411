//! Peer lifecycle and the registry mapping peer handles to agent ids.
//!
//! Cyclic ownership between a peer, its writer task, and its directory
//! entry is broken with an arena: peers live in [`PeerRegistry`]'s slab
//! keyed by [`PeerHandle`]; everything else holds the handle (a
//! non-owning key) and resolves it lazily, getting `not-found` once the
//! peer has been reaped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::domain_types::{AgentId, PeerHandle, Timestamp};
use crate::envelope::Envelope;
use crate::error::RegistryError;

/// A peer's place in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Accepted or dialed, not yet bound to an agent id.
    Open,
    /// Bound to an agent id via a successful `register_agent`.
    Registered,
    /// Torn down; the registry entry has been or is about to be reaped.
    Closed,
}

/// The connection-local endpoint for one peer.
pub struct Peer {
    /// Transport-assigned, process-unique handle.
    pub handle: PeerHandle,
    /// The agent id bound to this peer, if registered.
    pub agent_id: Option<AgentId>,
    /// Arbitrary metadata supplied at registration.
    pub metadata: HashMap<String, String>,
    /// Capability tags supplied at registration.
    pub capabilities: std::collections::HashSet<String>,
    /// Current lifecycle state.
    pub state: PeerState,
    /// Timestamp of the last heartbeat reply (or registration, initially).
    pub last_seen: Timestamp,
    /// Bounded outbound queue; the writer task drains this onto the stream.
    pub outbound: mpsc::Sender<Envelope>,
}

impl Peer {
    /// Returns the metadata map, captured as an `agent_info` snapshot in
    /// directory listings.
    #[must_use]
    pub fn info(&self) -> Option<AgentInfo> {
        self.agent_id.clone().map(|agent_id| AgentInfo {
            agent_id,
            metadata: self.metadata.clone(),
            capabilities: self.capabilities.clone(),
            last_seen: self.last_seen,
            peer_handle: self.handle,
        })
    }
}

/// A directory entry: an agent id plus the information needed to route to
/// and describe it.
#[derive(Debug, Clone)]
pub struct AgentInfo {
    /// The agent's identifier.
    pub agent_id: AgentId,
    /// Metadata supplied at registration.
    pub metadata: HashMap<String, String>,
    /// Capability tags supplied at registration.
    pub capabilities: std::collections::HashSet<String>,
    /// Timestamp of the last heartbeat reply.
    pub last_seen: Timestamp,
    /// The local peer handle implementing this agent, if registered on this
    /// node (absent for remote directory entries mirrored from gossip).
    pub peer_handle: PeerHandle,
}

/// O(1) peer registry: the single source of truth for "which local peer
/// implements which agent." All routing decisions flow through it.
pub struct PeerRegistry {
    peers: DashMap<PeerHandle, Peer>,
    by_agent: DashMap<AgentId, PeerHandle>,
    next_handle: AtomicU64,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerRegistry {
    /// Builds an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
            by_agent: DashMap::new(),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Allocates a fresh handle for a newly accepted or dialed connection
    /// and inserts it in the `Open` state.
    pub fn accept(&self, outbound: mpsc::Sender<Envelope>) -> PeerHandle {
        let handle = PeerHandle::from_counter(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let peer = Peer {
            handle,
            agent_id: None,
            metadata: HashMap::new(),
            capabilities: std::collections::HashSet::new(),
            state: PeerState::Open,
            last_seen: Timestamp::now(),
            outbound,
        };
        self.peers.insert(handle, peer);
        debug!(?handle, "peer accepted");
        handle
    }

    /// Binds `handle` to `agent_id`. If `force` is true and `agent_id` is
    /// already bound to a different peer, the old peer's outbound channel is
    /// closed and its entry displaced before the new binding is recorded —
    /// atomically with respect to other callers of `bind`, since the
    /// displacement and insertion both happen before this call returns.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateAgent`] if `agent_id` is already
    /// bound and `force` is false. Returns [`RegistryError::PeerNotFound`] if
    /// `handle` has no entry (already reaped).
    pub fn bind(
        &self,
        handle: PeerHandle,
        agent_id: AgentId,
        metadata: HashMap<String, String>,
        capabilities: std::collections::HashSet<String>,
        force: bool,
    ) -> Result<(), RegistryError> {
        if let Some(existing_handle) = self.by_agent.get(&agent_id).map(|e| *e) {
            if existing_handle != handle {
                if !force {
                    return Err(RegistryError::DuplicateAgent(agent_id));
                }
                if let Some((_, old_peer)) = self.peers.remove(&existing_handle) {
                    drop(old_peer.outbound);
                    info!(?existing_handle, %agent_id, "displaced by force_reconnect");
                }
            }
        }

        let mut entry = self
            .peers
            .get_mut(&handle)
            .ok_or(RegistryError::PeerNotFound)?;
        entry.agent_id = Some(agent_id.clone());
        entry.metadata = metadata;
        entry.capabilities = capabilities;
        entry.state = PeerState::Registered;
        entry.last_seen = Timestamp::now();
        drop(entry);

        self.by_agent.insert(agent_id, handle);
        Ok(())
    }

    /// Removes `handle`'s directory entry and closes its outbound channel.
    /// A no-op, not an error, if the handle is already gone.
    pub fn unbind(&self, handle: PeerHandle) {
        if let Some((_, peer)) = self.peers.remove(&handle) {
            if let Some(agent_id) = peer.agent_id {
                self.by_agent.remove(&agent_id);
            }
            drop(peer.outbound);
            debug!(?handle, "peer unbound");
        }
    }

    /// Looks up the live peer handle implementing `agent_id`.
    #[must_use]
    pub fn lookup(&self, agent_id: &AgentId) -> Option<PeerHandle> {
        self.by_agent.get(agent_id).map(|e| *e)
    }

    /// Returns a directory snapshot, optionally filtered by a required
    /// capability.
    #[must_use]
    pub fn list(&self, capability_filter: Option<&str>) -> Vec<AgentInfo> {
        self.peers
            .iter()
            .filter_map(|entry| entry.value().info())
            .filter(|info| {
                capability_filter.is_none_or(|cap| info.capabilities.contains(cap))
            })
            .collect()
    }

    /// Updates `handle`'s last-seen timestamp, e.g. on heartbeat reply.
    pub fn touch(&self, handle: PeerHandle) {
        if let Some(mut entry) = self.peers.get_mut(&handle) {
            entry.last_seen = Timestamp::now();
        }
    }

    /// Returns the outbound sender for `handle`, if it is still live.
    #[must_use]
    pub fn outbound_sender(&self, handle: PeerHandle) -> Option<mpsc::Sender<Envelope>> {
        self.peers.get(&handle).map(|e| e.outbound.clone())
    }

    /// Returns the number of currently registered peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Returns whether the registry currently has no peers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Finds and returns the handles of peers whose `last_seen` is older
    /// than `timeout`, for the stale-peer reaper to close.
    #[must_use]
    pub fn stale_peers(&self, timeout: std::time::Duration) -> Vec<PeerHandle> {
        self.peers
            .iter()
            .filter(|entry| entry.value().last_seen.elapsed() > timeout)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Reaps `handle`, logging at `warn` level since this path is only
    /// reached by heartbeat timeout, not a graceful unbind.
    pub fn reap(&self, handle: PeerHandle) {
        if let Some((_, peer)) = self.peers.remove(&handle) {
            if let Some(agent_id) = peer.agent_id.clone() {
                self.by_agent.remove(&agent_id);
                warn!(%agent_id, ?handle, "peer reaped after missed heartbeats");
            }
        }
    }
}

/// Shared handle to one node's peer registry.
pub type SharedPeerRegistry = Arc<PeerRegistry>;

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(s: &str) -> AgentId {
        AgentId::try_new(s.to_string()).unwrap()
    }

    fn channel() -> mpsc::Sender<Envelope> {
        mpsc::channel(8).0
    }

    #[test]
    fn bind_then_lookup_finds_the_peer() {
        let registry = PeerRegistry::new();
        let handle = registry.accept(channel());
        registry
            .bind(handle, agent("alpha"), HashMap::new(), Default::default(), false)
            .unwrap();
        assert_eq!(registry.lookup(&agent("alpha")), Some(handle));
    }

    #[test]
    fn duplicate_registration_without_force_is_rejected() {
        let registry = PeerRegistry::new();
        let h1 = registry.accept(channel());
        let h2 = registry.accept(channel());
        registry
            .bind(h1, agent("alpha"), HashMap::new(), Default::default(), false)
            .unwrap();
        let result = registry.bind(h2, agent("alpha"), HashMap::new(), Default::default(), false);
        assert!(matches!(result, Err(RegistryError::DuplicateAgent(_))));
        assert_eq!(registry.lookup(&agent("alpha")), Some(h1));
    }

    #[test]
    fn force_reconnect_displaces_the_prior_binding() {
        let registry = PeerRegistry::new();
        let h1 = registry.accept(channel());
        let h2 = registry.accept(channel());
        registry
            .bind(h1, agent("alpha"), HashMap::new(), Default::default(), false)
            .unwrap();
        registry
            .bind(h2, agent("alpha"), HashMap::new(), Default::default(), true)
            .unwrap();
        assert_eq!(registry.lookup(&agent("alpha")), Some(h2));
        assert!(registry.peers.get(&h1).is_none());
    }

    #[test]
    fn unbind_removes_directory_entry() {
        let registry = PeerRegistry::new();
        let handle = registry.accept(channel());
        registry
            .bind(handle, agent("alpha"), HashMap::new(), Default::default(), false)
            .unwrap();
        registry.unbind(handle);
        assert_eq!(registry.lookup(&agent("alpha")), None);
    }

    #[test]
    fn list_filters_by_capability() {
        let registry = PeerRegistry::new();
        let handle = registry.accept(channel());
        let mut caps = std::collections::HashSet::new();
        caps.insert("vision".to_string());
        registry.bind(handle, agent("alpha"), HashMap::new(), caps, false).unwrap();
        assert_eq!(registry.list(Some("vision")).len(), 1);
        assert_eq!(registry.list(Some("hearing")).len(), 0);
    }
}
