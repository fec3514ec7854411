//! Centralized topology: a coordinator holding the authoritative registry,
//! or a client proxying to it.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain_types::{AgentId, PeerHandle};
use crate::envelope::{Envelope, EnvelopeKind};
use crate::error::TopologyError;
use crate::peer::{AgentInfo, SharedPeerRegistry};
use crate::transport::Transport;

use super::{RouteOutcome, Topology};

/// The coordinator role: owns the authoritative registry. Registration is
/// local; routing looks the target up in the registry directly.
pub struct CoordinatorTopology {
    registry: SharedPeerRegistry,
    transport: Arc<dyn Transport>,
}

impl CoordinatorTopology {
    /// Builds a coordinator topology over the given registry and transport.
    #[must_use]
    pub fn new(registry: SharedPeerRegistry, transport: Arc<dyn Transport>) -> Self {
        Self { registry, transport }
    }
}

#[async_trait]
impl Topology for CoordinatorTopology {
    async fn register_agent(
        &self,
        peer: PeerHandle,
        agent_id: AgentId,
        metadata: HashMap<String, String>,
        capabilities: HashSet<String>,
        force: bool,
    ) -> Result<(), TopologyError> {
        self.registry
            .bind(peer, agent_id, metadata, capabilities, force)
            .map_err(TopologyError::from)
    }

    async fn unregister_agent(&self, agent_id: &AgentId) {
        if let Some(handle) = self.registry.lookup(agent_id) {
            self.registry.unbind(handle);
        }
    }

    async fn discover_agents(&self, capability_filter: Option<&str>) -> Vec<AgentInfo> {
        self.registry.list(capability_filter)
    }

    async fn route(&self, envelope: Envelope) -> Result<RouteOutcome, TopologyError> {
        match envelope.kind {
            EnvelopeKind::Broadcast => {
                for info in self.registry.list(None) {
                    if info.agent_id == envelope.sender_id {
                        continue;
                    }
                    if let Err(err) = self.transport.send(info.peer_handle, envelope.clone()).await
                    {
                        warn!(agent_id = %info.agent_id, %err, "broadcast send failed");
                    }
                }
                Ok(RouteOutcome::Delivered)
            }
            _ => {
                let Some(target_id) = envelope.target_id.clone() else {
                    return Err(TopologyError::TargetUnreachable(envelope.sender_id));
                };
                let Some(peer) = self.registry.lookup(&target_id) else {
                    return Err(TopologyError::TargetUnreachable(target_id));
                };
                self.transport.send(peer, envelope).await?;
                Ok(RouteOutcome::Delivered)
            }
        }
    }

    async fn start(&self) -> Result<(), TopologyError> {
        info!("coordinator topology started");
        Ok(())
    }

    async fn shutdown(&self) {}
}

/// A pending request awaiting a response from the coordinator.
type PendingRequests = DashMap<String, oneshot::Sender<serde_json::Value>>;

/// The client role: holds one peer to the coordinator and proxies every
/// local call to a remote system request.
pub struct ClientTopology {
    transport: Arc<dyn Transport>,
    registry: SharedPeerRegistry,
    coordinator_addr: SocketAddr,
    coordinator_peer: tokio::sync::RwLock<Option<PeerHandle>>,
    self_agent_id: AgentId,
    pending: PendingRequests,
}

impl ClientTopology {
    /// Builds a client topology that will dial `coordinator_addr` on
    /// [`Topology::start`].
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: SharedPeerRegistry,
        coordinator_addr: SocketAddr,
        self_agent_id: AgentId,
    ) -> Self {
        Self {
            transport,
            registry,
            coordinator_addr,
            coordinator_peer: tokio::sync::RwLock::new(None),
            self_agent_id,
            pending: DashMap::new(),
        }
    }

    /// Called by the orchestrator when a `system_response` arrives from the
    /// coordinator peer, to wake up the matching pending request.
    pub fn resolve_pending(&self, request_id: &str, value: serde_json::Value) {
        if let Some((_, sender)) = self.pending.remove(request_id) {
            let _ = sender.send(value);
        }
    }

    async fn request(
        &self,
        command: &str,
        fields: serde_json::Value,
    ) -> Result<serde_json::Value, TopologyError> {
        let peer = *self
            .coordinator_peer
            .read()
            .await
            .as_ref()
            .ok_or_else(|| TopologyError::TargetUnreachable(self.self_agent_id.clone()))?;
        let request_id = Uuid::new_v4().to_string();
        let mut payload = serde_json::json!({
            "command": command,
            "request_id": request_id,
        });
        if let (Some(payload_map), Some(fields_map)) = (payload.as_object_mut(), fields.as_object()) {
            for (k, v) in fields_map {
                payload_map.insert(k.clone(), v.clone());
            }
        }
        let envelope = Envelope::new(
            EnvelopeKind::SystemRequest,
            self.self_agent_id.clone(),
            payload,
        );
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);
        self.transport.send(peer, envelope).await?;
        rx.await
            .map_err(|_| TopologyError::TargetUnreachable(self.self_agent_id.clone()))
    }
}

#[async_trait]
impl Topology for ClientTopology {
    async fn register_agent(
        &self,
        _peer: PeerHandle,
        agent_id: AgentId,
        metadata: HashMap<String, String>,
        _capabilities: HashSet<String>,
        force: bool,
    ) -> Result<(), TopologyError> {
        let response = self
            .request(
                "register_agent",
                serde_json::json!({
                    "agent_id": agent_id.to_string(),
                    "metadata": metadata,
                    "force_reconnect": force,
                }),
            )
            .await?;
        if response.get("success").and_then(serde_json::Value::as_bool) == Some(true) {
            Ok(())
        } else {
            Err(TopologyError::TargetUnreachable(agent_id))
        }
    }

    async fn unregister_agent(&self, agent_id: &AgentId) {
        let _ = self
            .request(
                "unregister_agent",
                serde_json::json!({ "agent_id": agent_id.to_string() }),
            )
            .await;
    }

    async fn discover_agents(&self, _capability_filter: Option<&str>) -> Vec<AgentInfo> {
        // Remote directory entries are reconstructed from the coordinator's
        // list_agents response by the orchestrator's system-request caller;
        // this client's own registry only holds its local peer.
        self.registry.list(None)
    }

    async fn route(&self, envelope: Envelope) -> Result<RouteOutcome, TopologyError> {
        let peer = *self
            .coordinator_peer
            .read()
            .await
            .as_ref()
            .ok_or_else(|| TopologyError::TargetUnreachable(envelope.sender_id.clone()))?;
        self.transport.send(peer, envelope).await?;
        Ok(RouteOutcome::Delivered)
    }

    async fn start(&self) -> Result<(), TopologyError> {
        let handle = self
            .transport
            .dial(self.coordinator_addr, HashMap::new())
            .await?;
        *self.coordinator_peer.write().await = Some(handle);
        info!(addr = %self.coordinator_addr, "client topology dialed coordinator");
        Ok(())
    }

    async fn shutdown(&self) {
        if let Some(peer) = *self.coordinator_peer.read().await {
            self.transport.close(peer, Duration::from_secs(5)).await;
        }
    }
}
