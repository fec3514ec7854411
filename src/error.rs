//! Crate-level error types.
//!
//! Each subsystem defines its own error enum; [`ParleyError`] aggregates them
//! for call sites (chiefly the server binary) that want a single error type.
//! Every `error_kind` string named in the wire protocol has a matching
//! variant somewhere in this tree.

use thiserror::Error;

use crate::domain_types::{AgentId, ChannelName, MessageId};

/// Errors raised by the frame codec and duplex transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The target peer's stream has already been closed.
    #[error("peer-gone")]
    PeerGone,
    /// The peer's outbound queue is saturated beyond its high-water mark.
    #[error("backpressure-full")]
    BackpressureFull,
    /// A frame exceeded the configured maximum envelope size.
    #[error("payload_too_large: frame of {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge {
        /// Size of the offending frame, in bytes.
        size: usize,
        /// Configured maximum, in bytes.
        limit: usize,
    },
    /// A frame could not be decoded as a well-formed envelope.
    #[error("invalid_payload: {0}")]
    InvalidPayload(String),
    /// The underlying I/O operation failed.
    #[error("transport I/O error")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the peer registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The requested agent id is already bound to a live peer.
    #[error("duplicate_agent: {0} is already registered")]
    DuplicateAgent(AgentId),
    /// No directory entry exists for the requested agent.
    #[error("not_registered: {0} is not registered")]
    NotRegistered(AgentId),
    /// The requested peer handle has no registry entry (already reaped).
    #[error("peer handle not found")]
    PeerNotFound,
}

/// Errors raised by topology routing.
#[derive(Debug, Error)]
pub enum TopologyError {
    /// The target agent could not be located anywhere in the directory.
    #[error("target_unreachable: {0} could not be reached")]
    TargetUnreachable(AgentId),
    /// The envelope was accepted but queued pending discovery, not delivered.
    #[error("queued pending discovery of {0}")]
    Queued(AgentId),
    /// Delivery failed at the transport layer.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors surfaced by orchestrator-level system-request handling.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The envelope named a command the orchestrator does not recognize.
    #[error("unknown_command: {0}")]
    UnknownCommand(String),
    /// The envelope named a mod that is not enabled on this node.
    #[error("unknown_mod: {0}")]
    UnknownMod(String),
    /// Registry-level failure during a system request.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// Topology-level failure while routing.
    #[error(transparent)]
    Topology(#[from] TopologyError),
    /// Transport-level failure while writing a response.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors raised by the Thread Messaging mod.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ThreadMessagingError {
    /// A reply's parent message does not exist.
    #[error("parent_missing: {0}")]
    ParentMissing(MessageId),
    /// A reply would exceed the structural thread-depth cap.
    #[error("depth_exceeded")]
    DepthExceeded,
    /// The named channel does not exist and auto-create is disabled.
    #[error("channel_missing: {0}")]
    ChannelMissing(ChannelName),
    /// The referenced message does not exist (or has been evicted).
    #[error("message-missing: {0}")]
    MessageMissing(MessageId),
    /// The reaction type is not in the configured supported set.
    #[error("invalid-reaction: {0}")]
    InvalidReaction(String),
    /// An uploaded attachment exceeded the configured size cap.
    #[error("too-large: attachment of {size} bytes exceeds limit of {limit} bytes")]
    TooLarge {
        /// Size of the rejected attachment, in bytes.
        size: usize,
        /// Configured maximum, in bytes.
        limit: usize,
    },
    /// The node's attachment quota has been exhausted.
    #[error("quota_exhausted")]
    QuotaExhausted,
    /// The direct-message target is not registered anywhere reachable.
    #[error("target-not-registered: {0}")]
    TargetNotRegistered(AgentId),
    /// The payload did not conform to the shape a given action expects.
    #[error("invalid_payload: {0}")]
    InvalidPayload(String),
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration document could not be parsed.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    /// The configuration document could not be read from disk.
    #[error("failed to read configuration file")]
    Io(#[from] std::io::Error),
    /// A cross-field validation rule was violated.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors raised while writing or restoring a snapshot.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// Serialization of node state failed.
    #[error("failed to serialize snapshot")]
    Serialize(#[from] serde_json::Error),
    /// The atomic write-then-rename could not complete.
    #[error("failed to write snapshot file")]
    Io(#[from] std::io::Error),
}

/// Aggregate error type for call sites that need exactly one error enum
/// (chiefly `main`).
#[derive(Debug, Error)]
pub enum ParleyError {
    /// Transport-layer failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Registry-layer failure.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// Topology-layer failure.
    #[error(transparent)]
    Topology(#[from] TopologyError),
    /// Orchestrator-layer failure.
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    /// Thread Messaging mod failure.
    #[error(transparent)]
    ThreadMessaging(#[from] ThreadMessagingError),
    /// Configuration failure.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Snapshot failure.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

impl ThreadMessagingError {
    /// Returns the stable `error_kind` string for this error, as carried on
    /// the wire in `success:false` responses and error envelopes.
    #[must_use]
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::ParentMissing(_) => "parent_missing",
            Self::DepthExceeded => "depth_exceeded",
            Self::ChannelMissing(_) => "channel_missing",
            Self::MessageMissing(_) => "message-missing",
            Self::InvalidReaction(_) => "invalid-reaction",
            Self::TooLarge { .. } => "too-large",
            Self::QuotaExhausted => "quota_exhausted",
            Self::TargetNotRegistered(_) => "target-not-registered",
            Self::InvalidPayload(_) => "invalid_payload",
        }
    }
}

impl RegistryError {
    /// Returns the stable `error_kind` string for this error.
    #[must_use]
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::DuplicateAgent(_) => "duplicate_agent",
            Self::NotRegistered(_) | Self::PeerNotFound => "not_registered",
        }
    }
}

impl TransportError {
    /// Returns the stable `error_kind` string for this error.
    #[must_use]
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::PeerGone | Self::Io(_) => "target_unreachable",
            Self::BackpressureFull => "backpressure",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::InvalidPayload(_) => "invalid_payload",
        }
    }
}

impl TopologyError {
    /// Returns the stable `error_kind` string for this error.
    #[must_use]
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::TargetUnreachable(_) | Self::Queued(_) => "target_unreachable",
            Self::Transport(e) => e.error_kind(),
        }
    }
}
