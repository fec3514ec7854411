//! Validated domain primitives.
//!
//! These newtypes make illegal states unrepresentable at the type level
//! instead of relying on ad-hoc validation scattered through call sites.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Maximum size, in bytes, of an envelope payload or attachment blob.
pub const MAX_ENVELOPE_BYTES: usize = 10 * 1024 * 1024;

/// Fixed structural limit on reply nesting. Not configurable upward; see
/// [`crate::config::NetworkConfig::validate`].
pub const MAX_THREAD_DEPTH: u8 = 5;

/// Opaque agent identifier, unique within a network at a given time.
#[nutype(
    validate(len_char_min = 1, len_char_max = 256),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct AgentId(String);

/// Identifier for one node (server process) in the network.
#[nutype(
    validate(len_char_min = 1, len_char_max = 256),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct NodeId(String);

impl NodeId {
    /// Generates a random node id suitable as a default when none is configured.
    #[must_use]
    pub fn generate() -> Self {
        Self::try_new(format!("node-{}", Uuid::new_v4())).expect("generated id is always valid")
    }
}

/// Connection-local identifier for one accepted or dialed peer. Never reused
/// within a node's process lifetime.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    TryFrom,
    Into
))]
pub struct PeerHandle(u64);

impl PeerHandle {
    /// Constructs a handle from a raw counter value.
    #[must_use]
    pub fn from_counter(value: u64) -> Self {
        Self::new(value)
    }
}

/// Server-assigned, monotonically increasing message id.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    TryFrom,
    Into
))]
pub struct EnvelopeId(u64);

/// Unique identifier for a stored thread-messaging record (message, channel
/// root, or reply).
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    TryFrom,
    Into
))]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generates a new random message id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Unique identifier for a stored attachment.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    TryFrom,
    Into
))]
pub struct AttachmentId(Uuid);

impl AttachmentId {
    /// Generates a new random attachment id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Name of a channel. Channels are created statically by configuration or
/// dynamically on first message when auto-create is enabled.
#[nutype(
    validate(len_char_min = 1, len_char_max = 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct ChannelName(String);

/// Name under which a mod is registered with the orchestrator.
#[nutype(
    validate(len_char_min = 1, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct ModName(String);

/// Nesting level of a message within its thread. `0` is always a root.
/// Bounded to [`MAX_THREAD_DEPTH`].
#[nutype(
    validate(less_or_equal = 5),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 0
)]
pub struct ThreadLevel(u8);

impl ThreadLevel {
    /// Root level, used for channel/direct messages with no parent.
    #[must_use]
    pub fn root() -> Self {
        Self::default()
    }

    /// The level one below the structural maximum; any reply to a message at
    /// this level would exceed [`MAX_THREAD_DEPTH`].
    #[must_use]
    pub fn is_max(&self) -> bool {
        self.into_inner() == MAX_THREAD_DEPTH
    }

    /// Computes the child level, failing if it would exceed the structural cap.
    ///
    /// # Errors
    ///
    /// Returns an error if `self` is already at the maximum depth.
    pub fn child(&self) -> Result<Self, ThreadLevelError> {
        Self::try_new(self.into_inner() + 1)
    }
}

/// Free-text content of a message. Non-empty, bounded by the envelope size cap.
#[nutype(
    validate(len_char_min = 1, predicate = |s: &str| s.as_bytes().len() <= MAX_ENVELOPE_BYTES),
    derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Display, TryFrom, Into, AsRef)
)]
pub struct MessageContent(String);

/// Kind of reaction an agent can attach to a message, drawn from a
/// configured predefined set at the mod layer (validated there, since the
/// set is configuration-dependent rather than fixed).
#[nutype(
    validate(len_char_min = 1, len_char_max = 32),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct ReactionType(String);

/// Original filename of an uploaded attachment.
#[nutype(
    validate(len_char_min = 1, len_char_max = 512),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct FileName(String);

/// Per-channel cap on the number of live root messages before the oldest
/// root (and its subtree) is evicted.
#[nutype(
    validate(greater_or_equal = 1),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 5000
)]
pub struct ChannelHistoryCap(usize);

impl ChannelHistoryCap {
    /// Gets the value as usize.
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Wall-clock timestamp recorded at message/record creation time, as
/// milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Captures the current time.
    #[must_use]
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
            .unwrap_or(0);
        Self(millis)
    }

    /// Milliseconds since the Unix epoch.
    #[must_use]
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Reconstructs a timestamp from a raw milliseconds-since-epoch value,
    /// e.g. one carried on the wire in a gossip digest entry.
    #[must_use]
    pub fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Elapsed duration since this timestamp was captured, saturating at zero.
    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        let now = Self::now().0;
        std::time::Duration::from_millis(now.saturating_sub(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_level_root_is_zero() {
        assert_eq!(ThreadLevel::root().into_inner(), 0);
    }

    #[test]
    fn thread_level_child_rejects_past_max() {
        let max = ThreadLevel::try_new(5).unwrap();
        assert!(max.child().is_err());
        assert!(max.is_max());
    }

    #[test]
    fn thread_level_child_increments() {
        let level = ThreadLevel::try_new(2).unwrap();
        assert_eq!(level.child().unwrap().into_inner(), 3);
    }

    #[test]
    fn message_content_rejects_empty() {
        assert!(MessageContent::try_new(String::new()).is_err());
    }

    #[test]
    fn message_content_rejects_oversize() {
        let huge = "a".repeat(MAX_ENVELOPE_BYTES + 1);
        assert!(MessageContent::try_new(huge).is_err());
    }

    #[test]
    fn agent_id_rejects_empty() {
        assert!(AgentId::try_new(String::new()).is_err());
    }
}
