//! The network orchestrator: lifecycle, system-request handling, and
//! envelope dispatch tying the transport and topology layers together.
//!
//! Grounded on the injected-component, atomic-flag, background-task-spawning
//! shape used elsewhere in this codebase's central coordination structs:
//! components are wired in as `Arc<dyn Trait>` at construction, `start`/
//! `shutdown` are idempotent against atomic flags, and the dispatch loop is
//! a dedicated task draining an mpsc channel fed by the transport.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::config::{NetworkConfig, TopologyMode};
use crate::domain_types::{AgentId, EnvelopeId, NodeId, PeerHandle};
use crate::envelope::{Envelope, EnvelopeKind};
use crate::error::{OrchestratorError, TopologyError};
use crate::mods::ModHost;
use crate::observability::{self, NetworkEvent};
use crate::peer::{PeerRegistry, SharedPeerRegistry};
use crate::topology::centralized::{ClientTopology, CoordinatorTopology};
use crate::topology::decentralized::DecentralizedTopology;
use crate::topology::{RouteOutcome, Topology};
use crate::transport::{DuplexTransport, InboundFrame, PeerClosed, Transport};

/// Wraps the three concrete topology implementations so the orchestrator
/// can both treat them uniformly (via [`Topology`]) and reach
/// variant-specific behavior (resolving a client's pending requests,
/// applying a decentralized gossip digest) without downcasting.
pub enum NetworkTopology {
    /// Centralized, coordinator role.
    Coordinator(Arc<CoordinatorTopology>),
    /// Centralized, client role.
    Client(Arc<ClientTopology>),
    /// Decentralized gossip mesh.
    Decentralized(Arc<DecentralizedTopology>),
}

impl NetworkTopology {
    fn as_trait(&self) -> Arc<dyn Topology> {
        match self {
            Self::Coordinator(t) => Arc::clone(t) as Arc<dyn Topology>,
            Self::Client(t) => Arc::clone(t) as Arc<dyn Topology>,
            Self::Decentralized(t) => Arc::clone(t) as Arc<dyn Topology>,
        }
    }
}

/// Central coordination hub for one network node: owns the transport,
/// topology, peer registry, and mod host, and runs the envelope dispatch
/// and background-task loops.
pub struct Network {
    config: NetworkConfig,
    node_id: NodeId,
    registry: SharedPeerRegistry,
    transport: Arc<DuplexTransport>,
    topology: NetworkTopology,
    mod_host: Arc<ModHost>,
    is_running: AtomicBool,
    is_shutdown: AtomicBool,
    next_envelope_id: AtomicU64,
    inbound_rx: RwLock<Option<mpsc::Receiver<InboundFrame>>>,
    closed_rx: RwLock<Option<mpsc::Receiver<PeerClosed>>>,
}

impl Network {
    /// Builds a node from `config` and the set of mods to enable, wiring
    /// the transport, topology, and peer registry according to
    /// `config.network.mode`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration fails validation.
    pub fn new(config: NetworkConfig, mod_host: Arc<ModHost>) -> Result<Self, OrchestratorError> {
        config
            .validate()
            .map_err(|e| OrchestratorError::UnknownCommand(format!("invalid configuration: {e}")))?;

        let node_id = config
            .network
            .node_id
            .clone()
            .map(NodeId::try_new)
            .transpose()
            .unwrap_or(None)
            .unwrap_or_else(NodeId::generate);

        let registry: SharedPeerRegistry = Arc::new(PeerRegistry::new());
        let (inbound_tx, inbound_rx) = mpsc::channel(4096);
        let (closed_tx, closed_rx) = mpsc::channel(1024);

        let max_frame_bytes = config.thread_messaging_config().max_file_size;
        let transport = Arc::new(DuplexTransport::new(
            Arc::clone(&registry),
            inbound_tx,
            closed_tx,
            max_frame_bytes.max(crate::domain_types::MAX_ENVELOPE_BYTES),
            1024,
            config.network.max_connections,
        ));

        let topology = match config.network.mode {
            TopologyMode::Centralized => {
                if let Some(coordinator_addr) = config.network.bootstrap_nodes.first() {
                    let addr: SocketAddr = coordinator_addr
                        .parse()
                        .map_err(|_| OrchestratorError::UnknownCommand(format!(
                            "invalid coordinator address: {coordinator_addr}"
                        )))?;
                    let self_id = AgentId::try_new(format!("{node_id}-gateway"))
                        .expect("node id derived string is always valid");
                    NetworkTopology::Client(Arc::new(ClientTopology::new(
                        Arc::clone(&transport) as Arc<dyn Transport>,
                        Arc::clone(&registry),
                        addr,
                        self_id,
                    )))
                } else {
                    NetworkTopology::Coordinator(Arc::new(CoordinatorTopology::new(
                        Arc::clone(&registry),
                        Arc::clone(&transport) as Arc<dyn Transport>,
                    )))
                }
            }
            TopologyMode::Decentralized => {
                let bootstrap_addrs = config
                    .network
                    .bootstrap_nodes
                    .iter()
                    .filter_map(|s| s.parse().ok())
                    .collect();
                NetworkTopology::Decentralized(Arc::new(DecentralizedTopology::new(
                    Arc::clone(&registry),
                    Arc::clone(&transport) as Arc<dyn Transport>,
                    node_id.clone(),
                    bootstrap_addrs,
                )))
            }
        };

        Ok(Self {
            config,
            node_id,
            registry,
            transport,
            topology,
            mod_host,
            is_running: AtomicBool::new(false),
            is_shutdown: AtomicBool::new(false),
            next_envelope_id: AtomicU64::new(1),
            inbound_rx: RwLock::new(Some(inbound_rx)),
            closed_rx: RwLock::new(Some(closed_rx)),
        })
    }

    /// This node's id.
    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// This node's peer registry.
    #[must_use]
    pub fn registry(&self) -> &SharedPeerRegistry {
        &self.registry
    }

    /// The address the duplex transport is actually listening on, once
    /// [`Self::start`] has bound a socket. Useful when the configured port
    /// was `0` and the OS assigned one.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    /// Assigns the next monotonically increasing envelope id.
    fn next_envelope_id(&self) -> EnvelopeId {
        EnvelopeId::new(self.next_envelope_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Starts transports and topology, starts enabled mods in declaration
    /// order, begins listening, and spawns background tasks. Idempotent:
    /// calling `start` on an already-running node is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot bind or the topology fails
    /// to start (e.g. a client cannot dial its coordinator).
    pub async fn start(self: &Arc<Self>) -> Result<(), OrchestratorError> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let addr: SocketAddr = format!("{}:{}", self.config.network.host, self.config.network.port)
            .parse()
            .map_err(|_| {
                OrchestratorError::UnknownCommand("invalid bind address".to_string())
            })?;
        self.transport
            .listen(addr)
            .await
            .map_err(OrchestratorError::Transport)?;

        self.topology
            .as_trait()
            .start()
            .await
            .map_err(OrchestratorError::Topology)?;

        self.mod_host.start_all(Arc::clone(self)).await;

        self.spawn_dispatch_loop();
        self.spawn_heartbeat_task();
        self.spawn_reaper_task();
        self.spawn_closed_peer_task();
        if matches!(self.topology, NetworkTopology::Decentralized(_)) {
            self.spawn_gossip_task();
        }

        info!(node_id = %self.node_id, "network started");
        Ok(())
    }

    fn spawn_dispatch_loop(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut rx = this
                .inbound_rx
                .write()
                .await
                .take()
                .expect("dispatch loop started exactly once");
            while let Some(frame) = rx.recv().await {
                if this.is_shutdown.load(Ordering::SeqCst) {
                    break;
                }
                let this = Arc::clone(&this);
                tokio::spawn(async move {
                    if let Err(err) = this.handle_envelope(frame.peer, frame.envelope).await {
                        debug!(%err, "envelope dispatch failed");
                    }
                });
            }
        });
    }

    fn spawn_closed_peer_task(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut rx = this
                .closed_rx
                .write()
                .await
                .take()
                .expect("closed-peer task started exactly once");
            while let Some(PeerClosed { peer }) = rx.recv().await {
                debug!(?peer, "peer connection closed");
            }
        });
    }

    fn spawn_heartbeat_task(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let interval = self.config.heartbeat_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if this.is_shutdown.load(Ordering::SeqCst) {
                    break;
                }
                let snapshot = this.registry.list(None);
                for info in snapshot {
                    let heartbeat = Envelope::new(
                        EnvelopeKind::Heartbeat,
                        AgentId::try_new(this.node_id.to_string()).unwrap_or_else(|_| {
                            AgentId::try_new("node".to_string()).expect("fallback is valid")
                        }),
                        json!({}),
                    );
                    if let Err(err) = this.transport.send(info.peer_handle, heartbeat).await {
                        warn!(agent_id = %info.agent_id, %err, "heartbeat send failed");
                    }
                }
            }
        });
    }

    fn spawn_reaper_task(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let timeout = self.config.heartbeat_timeout();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(timeout / 2);
            loop {
                ticker.tick().await;
                if this.is_shutdown.load(Ordering::SeqCst) {
                    break;
                }
                for handle in this.registry.stale_peers(timeout) {
                    this.registry.reap(handle);
                    observability::record(&this.node_id, NetworkEvent::PeerReaped { peer: handle });
                }
            }
        });
    }

    fn spawn_gossip_task(self: &Arc<Self>) {
        let NetworkTopology::Decentralized(topology) = &self.topology else {
            return;
        };
        let topology = Arc::clone(topology);
        let this = Arc::clone(self);
        let interval = self.config.discovery_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if this.is_shutdown.load(Ordering::SeqCst) {
                    break;
                }
                topology.send_digest().await;
            }
        });
    }

    async fn handle_envelope(
        self: &Arc<Self>,
        peer: PeerHandle,
        mut envelope: Envelope,
    ) -> Result<(), OrchestratorError> {
        envelope.assign_id(self.next_envelope_id());
        match envelope.kind {
            EnvelopeKind::SystemRequest => self.handle_system_request(peer, envelope).await,
            EnvelopeKind::SystemResponse => {
                if let NetworkTopology::Client(client) = &self.topology {
                    if let (Some(request_id), Some(_)) = (
                        envelope.payload.get("request_id").and_then(|v| v.as_str()),
                        envelope.payload.get("command"),
                    ) {
                        client.resolve_pending(request_id, envelope.payload.clone());
                    }
                }
                Ok(())
            }
            EnvelopeKind::Heartbeat => {
                self.registry.touch(peer);
                let sender_id = self
                    .registry
                    .list(None)
                    .into_iter()
                    .find(|info| info.peer_handle == peer)
                    .map(|info| info.agent_id)
                    .unwrap_or(envelope.sender_id.clone());
                let reply = Envelope::new(EnvelopeKind::HeartbeatReply, sender_id, json!({}));
                self.transport
                    .send(peer, reply)
                    .await
                    .map_err(OrchestratorError::Transport)
            }
            EnvelopeKind::HeartbeatReply => {
                self.registry.touch(peer);
                Ok(())
            }
            EnvelopeKind::GossipDigest => {
                if let NetworkTopology::Decentralized(topology) = &self.topology {
                    match crate::topology::decentralized::parse_digest_payload(&envelope.payload) {
                        Some((source_node, entries)) => {
                            topology.apply_digest(source_node, peer, entries).await;
                        }
                        None => debug!("dropping malformed gossip digest"),
                    }
                }
                Ok(())
            }
            EnvelopeKind::ModMessage => {
                let Some(mod_name) = envelope.mod_name.clone() else {
                    return self.send_error(peer, &envelope, "invalid_payload", "mod_message missing mod name").await;
                };
                match self.mod_host.dispatch(&mod_name, peer, envelope.clone()).await {
                    Ok(()) => Ok(()),
                    Err(OrchestratorError::UnknownMod(name)) => {
                        self.send_error(peer, &envelope, "unknown_mod", &format!("no such mod: {name}")).await
                    }
                    Err(other) => Err(other),
                }
            }
            EnvelopeKind::Direct | EnvelopeKind::Broadcast => {
                match self.topology.as_trait().route(envelope.clone()).await {
                    Ok(RouteOutcome::Delivered | RouteOutcome::Queued) => Ok(()),
                    Err(err) => {
                        self.send_error(peer, &envelope, err.error_kind(), &err.to_string())
                            .await
                    }
                }
            }
        }
    }

    async fn send_error(
        self: &Arc<Self>,
        peer: PeerHandle,
        original: &Envelope,
        error_kind: &str,
        message: &str,
    ) -> Result<(), OrchestratorError> {
        let error_envelope = Envelope::new(
            EnvelopeKind::SystemResponse,
            AgentId::try_new(self.node_id.to_string()).unwrap_or_else(|_| {
                AgentId::try_new("node".to_string()).expect("fallback is valid")
            }),
            json!({
                "success": false,
                "error_kind": error_kind,
                "error": message,
                "in_reply_to": original.envelope_id,
            }),
        );
        self.transport
            .send(peer, error_envelope)
            .await
            .map_err(OrchestratorError::Transport)
    }

    async fn handle_system_request(
        self: &Arc<Self>,
        peer: PeerHandle,
        envelope: Envelope,
    ) -> Result<(), OrchestratorError> {
        let command = envelope
            .payload
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let request_id = envelope.payload.get("request_id").cloned();

        let response_fields = match command.as_str() {
            "register_agent" => self.handle_register_agent(peer, &envelope).await,
            "list_agents" => self.handle_list_agents(),
            "list_mods" => self.handle_list_mods(),
            "get_network_info" => self.handle_get_network_info(),
            "unregister_agent" => self.handle_unregister_agent(&envelope).await,
            other => {
                return self
                    .send_error(peer, &envelope, "unknown_command", &format!("unrecognized command: {other}"))
                    .await;
            }
        };

        let mut payload = json!({ "command": command });
        if let Some(request_id) = request_id {
            if let Some(map) = payload.as_object_mut() {
                map.insert("request_id".to_string(), request_id);
            }
        }
        if let (Some(map), Some(fields)) = (payload.as_object_mut(), response_fields.as_object()) {
            for (k, v) in fields {
                map.insert(k.clone(), v.clone());
            }
        }

        let response = Envelope::new(
            EnvelopeKind::SystemResponse,
            AgentId::try_new(self.node_id.to_string()).unwrap_or_else(|_| {
                AgentId::try_new("node".to_string()).expect("fallback is valid")
            }),
            payload,
        );
        self.transport
            .send(peer, response)
            .await
            .map_err(OrchestratorError::Transport)
    }

    async fn handle_register_agent(&self, peer: PeerHandle, envelope: &Envelope) -> serde_json::Value {
        let Some(agent_id_str) = envelope.payload.get("agent_id").and_then(|v| v.as_str()) else {
            return json!({"success": false, "error_kind": "invalid_payload", "error": "missing agent_id"});
        };
        let Ok(agent_id) = AgentId::try_new(agent_id_str.to_string()) else {
            return json!({"success": false, "error_kind": "invalid_payload", "error": "invalid agent_id"});
        };
        let metadata: HashMap<String, String> = envelope
            .payload
            .get("metadata")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        let capabilities: std::collections::HashSet<String> = envelope
            .payload
            .get("capabilities")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        let force = envelope
            .payload
            .get("force_reconnect")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);

        match self
            .topology
            .as_trait()
            .register_agent(peer, agent_id.clone(), metadata, capabilities, force)
            .await
        {
            Ok(()) => {
                observability::record(
                    &self.node_id,
                    NetworkEvent::AgentRegistered {
                        agent_id: agent_id.clone(),
                        reconnected: force,
                    },
                );
                json!({
                    "success": true,
                    "network_name": self.config.network.name,
                    "node_id": self.node_id.to_string(),
                    "agent_id_effective": agent_id.to_string(),
                })
            }
            Err(_) => json!({
                "success": false,
                "error_kind": "duplicate_agent",
                "error": "agent already connected",
            }),
        }
    }

    fn handle_list_agents(&self) -> serde_json::Value {
        let agents: Vec<_> = self
            .registry
            .list(None)
            .into_iter()
            .map(|info| {
                json!({
                    "agent_id": info.agent_id.to_string(),
                    "metadata": info.metadata,
                    "capabilities": info.capabilities,
                    "last_seen": info.last_seen.as_millis(),
                })
            })
            .collect();
        json!({ "agents": agents })
    }

    fn handle_list_mods(&self) -> serde_json::Value {
        json!({ "mods": self.mod_host.mod_names() })
    }

    fn handle_get_network_info(&self) -> serde_json::Value {
        let mode = match self.config.network.mode {
            TopologyMode::Centralized => "centralized",
            TopologyMode::Decentralized => "decentralized",
        };
        json!({
            "network_info": {
                "name": self.config.network.name,
                "node_id": self.node_id.to_string(),
                "mode": mode,
                "mods": self.mod_host.mod_names(),
                "agent_count": self.registry.len(),
            }
        })
    }

    async fn handle_unregister_agent(&self, envelope: &Envelope) -> serde_json::Value {
        let Some(agent_id_str) = envelope.payload.get("agent_id").and_then(|v| v.as_str()) else {
            return json!({"success": false, "error_kind": "invalid_payload"});
        };
        let Ok(agent_id) = AgentId::try_new(agent_id_str.to_string()) else {
            return json!({"success": false, "error_kind": "invalid_payload"});
        };
        self.topology.as_trait().unregister_agent(&agent_id).await;
        observability::record(&self.node_id, NetworkEvent::AgentUnregistered { agent_id });
        json!({ "success": true })
    }

    /// Sends `envelope` through the topology's routing path (used by mods
    /// to forward/broadcast to other agents).
    ///
    /// # Errors
    ///
    /// Returns a [`TopologyError`] if the target cannot be reached.
    pub async fn route(&self, envelope: Envelope) -> Result<RouteOutcome, TopologyError> {
        self.topology.as_trait().route(envelope).await
    }

    /// Sends `envelope` directly to `peer` without topology routing (used
    /// by mods replying to the peer that sent the original request).
    ///
    /// # Errors
    ///
    /// Returns a [`crate::error::TransportError`] if the peer is gone or
    /// backpressured.
    pub async fn send_to_peer(
        &self,
        peer: PeerHandle,
        envelope: Envelope,
    ) -> Result<(), crate::error::TransportError> {
        self.transport.send(peer, envelope).await
    }

    /// Returns the directory entries currently visible to this node.
    #[must_use]
    pub fn list_agents(&self, capability_filter: Option<&str>) -> Vec<crate::peer::AgentInfo> {
        self.registry.list(capability_filter)
    }

    /// Reverses startup: gives each mod a bounded drain window, stops
    /// topology background tasks, and marks the node shut down. Idempotent.
    pub async fn shutdown(self: &Arc<Self>) {
        if self.is_shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(node_id = %self.node_id, "shutting down");
        let drain_window = Duration::from_secs(5);
        tokio::time::timeout(drain_window, self.mod_host.shutdown_all())
            .await
            .unwrap_or_else(|_| warn!("mod shutdown exceeded drain window"));
        self.topology.as_trait().shutdown().await;
        for info in self.registry.list(None) {
            self.transport.close(info.peer_handle, Duration::from_secs(1)).await;
        }
    }
}
