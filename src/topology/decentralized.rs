//! Decentralized topology: each node keeps a locally merged view of the
//! whole network, seeded by bootstrap peers and refreshed by periodic
//! presence-digest exchange.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::domain_types::{AgentId, NodeId, PeerHandle, Timestamp};
use crate::envelope::{Envelope, EnvelopeKind};
use crate::error::TopologyError;
use crate::peer::{AgentInfo, SharedPeerRegistry};
use crate::transport::Transport;

use super::{RouteOutcome, Topology};

/// One entry in a presence digest: an agent id, the node it's currently
/// homed on, and the timestamp of that attribution.
#[derive(Debug, Clone)]
pub struct DigestEntry {
    /// The agent this entry describes.
    pub agent_id: AgentId,
    /// The node currently attributed as this agent's home.
    pub home_node: NodeId,
    /// When this attribution was last refreshed.
    pub last_seen: Timestamp,
}

/// Merges `incoming` into `local` using most-recent-timestamp-wins, with
/// the home node id as a deterministic tiebreak on equal timestamps. Pure
/// and independently testable, per the "explicit task scheduling" and
/// "no ambient access" design notes: this function has no side effects
/// beyond the map it's handed.
pub fn merge_digest(
    local: &mut HashMap<AgentId, (NodeId, Timestamp)>,
    incoming: Vec<DigestEntry>,
) {
    for entry in incoming {
        let should_replace = match local.get(&entry.agent_id) {
            None => true,
            Some((existing_node, existing_ts)) => {
                match entry.last_seen.as_millis().cmp(&existing_ts.as_millis()) {
                    std::cmp::Ordering::Greater => true,
                    std::cmp::Ordering::Less => false,
                    std::cmp::Ordering::Equal => &entry.home_node > existing_node,
                }
            }
        };
        if should_replace {
            local.insert(entry.agent_id, (entry.home_node, entry.last_seen));
        }
    }
}

/// Parses a `GossipDigest` envelope payload, as built by
/// [`DecentralizedTopology::send_digest`], into the sending node's id and
/// its entries. Returns `None` on any malformed or missing field.
#[must_use]
pub fn parse_digest_payload(payload: &Value) -> Option<(NodeId, Vec<DigestEntry>)> {
    let source_node = payload.get("source_node")?.as_str()?;
    let source_node = NodeId::try_new(source_node.to_string()).ok()?;

    let raw_entries = payload.get("entries")?.as_array()?;
    let mut entries = Vec::with_capacity(raw_entries.len());
    for entry in raw_entries {
        let agent_id = entry.get("agent_id")?.as_str()?;
        let agent_id = AgentId::try_new(agent_id.to_string()).ok()?;
        let home_node = entry.get("home_node")?.as_str()?;
        let home_node = NodeId::try_new(home_node.to_string()).ok()?;
        let last_seen = entry.get("last_seen")?.as_u64()?;
        entries.push(DigestEntry {
            agent_id,
            home_node,
            last_seen: Timestamp::from_millis(last_seen),
        });
    }
    Some((source_node, entries))
}

/// The decentralized topology variant.
pub struct DecentralizedTopology {
    registry: SharedPeerRegistry,
    transport: Arc<dyn Transport>,
    self_node_id: NodeId,
    bootstrap_nodes: Vec<SocketAddr>,
    /// agent id -> (home node, last seen)
    remote_view: Mutex<HashMap<AgentId, (NodeId, Timestamp)>>,
    /// node id -> peer handle of our connection to that node
    node_peers: DashMap<NodeId, PeerHandle>,
    /// envelopes awaiting discovery of their target's home node
    pending: DashMap<AgentId, Vec<Envelope>>,
    /// peer handles dialed as bootstrap seeds, kept until a digest from
    /// that connection tells us which node they belong to
    bootstrap_peers: Mutex<Vec<PeerHandle>>,
}

impl DecentralizedTopology {
    /// Builds a decentralized topology for `self_node_id`, dialing
    /// `bootstrap_nodes` on [`Topology::start`].
    #[must_use]
    pub fn new(
        registry: SharedPeerRegistry,
        transport: Arc<dyn Transport>,
        self_node_id: NodeId,
        bootstrap_nodes: Vec<SocketAddr>,
    ) -> Self {
        Self {
            registry,
            transport,
            self_node_id,
            bootstrap_nodes,
            remote_view: Mutex::new(HashMap::new()),
            node_peers: DashMap::new(),
            pending: DashMap::new(),
            bootstrap_peers: Mutex::new(Vec::new()),
        }
    }

    /// Builds a presence digest from this node's local directory and known
    /// remote view, and sends it to every peer this node currently has a
    /// gossip connection to (spec §4.3's periodic digest exchange).
    pub async fn send_digest(&self) {
        let entries = self.local_digest_entries();
        if entries.is_empty() {
            return;
        }
        let sender_id = AgentId::try_new(self.self_node_id.to_string())
            .unwrap_or_else(|_| AgentId::try_new("node".to_string()).expect("fallback is valid"));
        let payload = json!({
            "source_node": self.self_node_id.to_string(),
            "entries": entries.iter().map(|e| json!({
                "agent_id": e.agent_id.to_string(),
                "home_node": e.home_node.to_string(),
                "last_seen": e.last_seen.as_millis(),
            })).collect::<Vec<_>>(),
        });

        let mut targets: Vec<PeerHandle> =
            self.node_peers.iter().map(|entry| *entry.value()).collect();
        targets.extend(
            self.bootstrap_peers
                .lock()
                .expect("bootstrap_peers lock poisoned")
                .iter()
                .copied(),
        );
        targets.sort_unstable_by_key(|h| h.into_inner());
        targets.dedup();

        for peer in targets {
            let envelope = Envelope::new(EnvelopeKind::GossipDigest, sender_id.clone(), payload.clone());
            if let Err(err) = self.transport.send(peer, envelope).await {
                debug!(?peer, %err, "gossip digest send failed");
            }
        }
    }

    fn local_digest_entries(&self) -> Vec<DigestEntry> {
        let mut entries: HashMap<AgentId, DigestEntry> = HashMap::new();
        for info in self.registry.list(None) {
            entries.insert(
                info.agent_id.clone(),
                DigestEntry {
                    agent_id: info.agent_id,
                    home_node: self.self_node_id.clone(),
                    last_seen: info.last_seen,
                },
            );
        }
        for (agent_id, (home_node, last_seen)) in
            self.remote_view.lock().expect("remote_view lock poisoned").iter()
        {
            entries.entry(agent_id.clone()).or_insert_with(|| DigestEntry {
                agent_id: agent_id.clone(),
                home_node: home_node.clone(),
                last_seen: *last_seen,
            });
        }
        entries.into_values().collect()
    }

    /// Applies a presence digest received from `source_node`, merging its
    /// entries into the local view and flushing any envelopes that were
    /// queued awaiting discovery of a now-known agent.
    pub async fn apply_digest(&self, source_node: NodeId, peer: PeerHandle, entries: Vec<DigestEntry>) {
        self.node_peers.insert(source_node, peer);
        let newly_known: Vec<AgentId> = {
            let mut view = self.remote_view.lock().expect("remote_view lock poisoned");
            let before: std::collections::HashSet<AgentId> = view.keys().cloned().collect();
            merge_digest(&mut view, entries);
            view.keys()
                .filter(|id| !before.contains(*id))
                .cloned()
                .collect()
        };
        for agent_id in newly_known {
            self.flush_pending(&agent_id).await;
        }
    }

    async fn flush_pending(&self, agent_id: &AgentId) {
        if let Some((_, envelopes)) = self.pending.remove(agent_id) {
            for envelope in envelopes {
                if let Err(err) = self.route(envelope).await {
                    warn!(%agent_id, %err, "failed to flush queued envelope after discovery");
                }
            }
        }
    }

    fn home_of(&self, agent_id: &AgentId) -> Option<NodeId> {
        self.remote_view
            .lock()
            .expect("remote_view lock poisoned")
            .get(agent_id)
            .map(|(node, _)| node.clone())
    }
}

#[async_trait]
impl Topology for DecentralizedTopology {
    async fn register_agent(
        &self,
        peer: PeerHandle,
        agent_id: AgentId,
        metadata: HashMap<String, String>,
        capabilities: std::collections::HashSet<String>,
        force: bool,
    ) -> Result<(), TopologyError> {
        self.registry
            .bind(peer, agent_id.clone(), metadata, capabilities, force)?;
        let mut view = self.remote_view.lock().expect("remote_view lock poisoned");
        view.insert(agent_id, (self.self_node_id.clone(), Timestamp::now()));
        Ok(())
    }

    async fn unregister_agent(&self, agent_id: &AgentId) {
        if let Some(handle) = self.registry.lookup(agent_id) {
            self.registry.unbind(handle);
        }
        self.remote_view
            .lock()
            .expect("remote_view lock poisoned")
            .remove(agent_id);
    }

    async fn discover_agents(&self, capability_filter: Option<&str>) -> Vec<AgentInfo> {
        self.registry.list(capability_filter)
    }

    async fn route(&self, mut envelope: Envelope) -> Result<RouteOutcome, TopologyError> {
        if matches!(envelope.kind, EnvelopeKind::Broadcast) {
            for info in self.registry.list(None) {
                if info.agent_id == envelope.sender_id {
                    continue;
                }
                if let Err(err) = self.transport.send(info.peer_handle, envelope.clone()).await {
                    warn!(agent_id = %info.agent_id, %err, "broadcast send failed");
                }
            }
            return Ok(RouteOutcome::Delivered);
        }

        let Some(target_id) = envelope.target_id.clone() else {
            return Err(TopologyError::TargetUnreachable(envelope.sender_id));
        };

        if let Some(peer) = self.registry.lookup(&target_id) {
            self.transport.send(peer, envelope).await?;
            return Ok(RouteOutcome::Delivered);
        }

        match self.home_of(&target_id) {
            Some(home_node) => {
                let Some(peer) = self.node_peers.get(&home_node).map(|e| *e) else {
                    return Err(TopologyError::TargetUnreachable(target_id));
                };
                let already_forwarded = envelope.relevant_agent_id.is_some();
                if already_forwarded {
                    debug!(%target_id, "dropping envelope after bounded forward hop count");
                    return Err(TopologyError::TargetUnreachable(target_id));
                }
                envelope.relevant_agent_id = Some(target_id.clone());
                self.transport.send(peer, envelope).await?;
                Ok(RouteOutcome::Delivered)
            }
            None => {
                self.pending.entry(target_id.clone()).or_default().push(envelope);
                Ok(RouteOutcome::Queued)
            }
        }
    }

    async fn start(&self) -> Result<(), TopologyError> {
        for addr in &self.bootstrap_nodes {
            match self.transport.dial(*addr, HashMap::new()).await {
                Ok(handle) => {
                    info!(%addr, "dialed bootstrap node");
                    self.bootstrap_peers
                        .lock()
                        .expect("bootstrap_peers lock poisoned")
                        .push(handle);
                }
                Err(err) => warn!(%addr, %err, "failed to dial bootstrap node"),
            }
        }
        Ok(())
    }

    async fn shutdown(&self) {
        for entry in self.node_peers.iter() {
            self.transport.close(*entry.value(), Duration::from_secs(1)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(s: &str) -> AgentId {
        AgentId::try_new(s.to_string()).unwrap()
    }
    fn node(s: &str) -> NodeId {
        NodeId::try_new(s.to_string()).unwrap()
    }

    #[test]
    fn merge_prefers_newer_timestamp() {
        let mut local = HashMap::new();
        local.insert(agent("alpha"), (node("n1"), Timestamp::now()));
        std::thread::sleep(std::time::Duration::from_millis(5));
        let newer = Timestamp::now();
        merge_digest(
            &mut local,
            vec![DigestEntry {
                agent_id: agent("alpha"),
                home_node: node("n2"),
                last_seen: newer,
            }],
        );
        assert_eq!(local.get(&agent("alpha")).unwrap().0, node("n2"));
    }

    #[test]
    fn merge_ignores_entry_older_than_local() {
        let mut local = HashMap::new();
        let stale_ts = Timestamp::now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let fresh_ts = Timestamp::now();
        local.insert(agent("alpha"), (node("n2"), fresh_ts));
        merge_digest(
            &mut local,
            vec![DigestEntry {
                agent_id: agent("alpha"),
                home_node: node("n1"),
                last_seen: stale_ts,
            }],
        );
        assert_eq!(local.get(&agent("alpha")).unwrap().0, node("n2"));
    }

    #[test]
    fn merge_tiebreaks_on_node_id_when_timestamps_equal() {
        let mut local = HashMap::new();
        let ts = Timestamp::now();
        local.insert(agent("alpha"), (node("n1"), ts));
        merge_digest(
            &mut local,
            vec![DigestEntry {
                agent_id: agent("alpha"),
                home_node: node("n9"),
                last_seen: ts,
            }],
        );
        assert_eq!(local.get(&agent("alpha")).unwrap().0, node("n9"));
    }
}
