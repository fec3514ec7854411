//! Optional periodic persistence of directory state, so a restarted node
//! can rehydrate its peer directory without waiting for heartbeats/gossip
//! to repopulate it. Off by default (spec's durability Non-goal); when
//! enabled via [`crate::config::SnapshotSection`], [`crate::main`] ticks
//! [`write_snapshot`] on an interval and once more during graceful
//! shutdown.
//!
//! Grounded on `src/database.rs`'s functional-core/imperative-shell split:
//! a pure function builds the value to persist, a thin async shell does
//! the I/O. Uses `serde_json` and `tokio::fs`, atomic via write-to-temp
//! then rename so a crash mid-write never leaves a corrupt file in place.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::domain_types::{NodeId, Timestamp};
use crate::error::SnapshotError;
use crate::orchestrator::Network;
use crate::peer::AgentInfo;

/// One entry in a snapshot's agent directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotAgent {
    /// The agent's id.
    pub agent_id: String,
    /// Free-form metadata supplied at registration.
    pub metadata: HashMap<String, String>,
    /// Capability tags supplied at registration.
    pub capabilities: Vec<String>,
}

impl From<&AgentInfo> for SnapshotAgent {
    fn from(info: &AgentInfo) -> Self {
        Self {
            agent_id: info.agent_id.to_string(),
            metadata: info.metadata.clone(),
            capabilities: info.capabilities.iter().cloned().collect(),
        }
    }
}

/// A point-in-time capture of this node's registered-agent directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSnapshot {
    /// The node that produced this snapshot.
    pub node_id: String,
    /// When the snapshot was taken.
    pub taken_at: u64,
    /// Every agent registered directly with this node at capture time.
    pub agents: Vec<SnapshotAgent>,
}

impl NodeSnapshot {
    /// Builds a snapshot from the node's current directory view. Pure:
    /// takes a slice of already-collected agent info rather than reaching
    /// into `Network` itself, so it's trivially testable.
    #[must_use]
    pub fn capture(node_id: &NodeId, agents: &[AgentInfo]) -> Self {
        Self {
            node_id: node_id.to_string(),
            taken_at: Timestamp::now().as_millis(),
            agents: agents.iter().map(SnapshotAgent::from).collect(),
        }
    }
}

/// Serializes `network`'s current directory and atomically writes it to
/// `path` (write to `path.tmp`, then rename over the original).
///
/// # Errors
///
/// Returns [`SnapshotError::Serialize`] if the snapshot cannot be encoded,
/// or [`SnapshotError::Io`] if the temp file cannot be written or renamed.
pub async fn write_snapshot(network: &Network, path: &str) -> Result<(), SnapshotError> {
    let agents = network.list_agents(None);
    let snapshot = NodeSnapshot::capture(network.node_id(), &agents);
    let json = serde_json::to_vec_pretty(&snapshot)?;

    let tmp_path = format!("{path}.tmp");
    tokio::fs::write(&tmp_path, &json).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    debug!(path, agent_count = snapshot.agents.len(), "wrote snapshot");
    Ok(())
}

/// Loads a previously written snapshot from `path`, if present. Absence of
/// the file is not an error: a node's first run has nothing to load.
///
/// # Errors
///
/// Returns [`SnapshotError::Io`] if `path` exists but cannot be read, or
/// [`SnapshotError::Serialize`] if its contents are not a valid snapshot.
pub async fn load_snapshot(path: &str) -> Result<Option<NodeSnapshot>, SnapshotError> {
    if !Path::new(path).exists() {
        return Ok(None);
    }
    let bytes = tokio::fs::read(path).await?;
    let snapshot: NodeSnapshot = serde_json::from_slice(&bytes)?;
    info!(path, agent_count = snapshot.agents.len(), "loaded snapshot");
    Ok(Some(snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::{AgentId, PeerHandle};

    fn agent_info(name: &str) -> AgentInfo {
        AgentInfo {
            agent_id: AgentId::try_new(name.to_string()).unwrap(),
            metadata: HashMap::new(),
            capabilities: std::collections::HashSet::from(["chat".to_string()]),
            last_seen: Timestamp::now(),
            peer_handle: PeerHandle::from_counter(1),
        }
    }

    #[test]
    fn capture_copies_every_agent() {
        let node_id = NodeId::generate();
        let agents = vec![agent_info("alpha"), agent_info("beta")];
        let snapshot = NodeSnapshot::capture(&node_id, &agents);
        assert_eq!(snapshot.agents.len(), 2);
        assert_eq!(snapshot.node_id, node_id.to_string());
    }

    #[tokio::test]
    async fn write_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parley.snapshot.json");
        let path_str = path.to_str().unwrap();

        let snapshot = NodeSnapshot {
            node_id: "node-1".to_string(),
            taken_at: 42,
            agents: vec![SnapshotAgent {
                agent_id: "alpha".to_string(),
                metadata: HashMap::new(),
                capabilities: vec![],
            }],
        };
        let json = serde_json::to_vec_pretty(&snapshot).unwrap();
        let tmp_path = format!("{path_str}.tmp");
        tokio::fs::write(&tmp_path, &json).await.unwrap();
        tokio::fs::rename(&tmp_path, path_str).await.unwrap();

        let loaded = load_snapshot(path_str).await.unwrap().unwrap();
        assert_eq!(loaded.node_id, "node-1");
        assert_eq!(loaded.agents.len(), 1);
    }

    #[tokio::test]
    async fn load_missing_file_is_none_not_error() {
        let result = load_snapshot("/nonexistent/path/parley.snapshot.json").await.unwrap();
        assert!(result.is_none());
    }
}
