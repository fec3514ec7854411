//! Thread Messaging's domain records: channels, messages, attachments, and
//! the thread-reconstruction view handed back on retrieval.
//!
//! Grounded on the message-and-conversation shape in
//! `message_router/domain_types.rs` (`FipaMessage`, `Conversation`),
//! generalized from a flat conversation to channels with nested reply
//! subtrees per spec §3–§4.6.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain_types::{AgentId, AttachmentId, ChannelName, FileName, MessageId, ReactionType, ThreadLevel, Timestamp};

/// A named message room: membership set, ordered root list, running totals.
#[derive(Debug, Clone)]
pub struct Channel {
    /// The channel's name, also its key in the channel store.
    pub name: ChannelName,
    /// Free-text description, empty if none was configured.
    pub description: String,
    /// Agent ids currently subscribed to this channel.
    pub members: HashSet<AgentId>,
    /// Root message ids, oldest first. The eviction unit is a root plus its
    /// full subtree (spec §3 "a root and its thread are an eviction unit").
    pub roots: VecDeque<MessageId>,
    /// Total message count (roots and replies) currently live in the channel.
    pub message_count: usize,
}

impl Channel {
    /// Builds an empty channel with the given name and description.
    #[must_use]
    pub fn new(name: ChannelName, description: String) -> Self {
        Self {
            name,
            description,
            members: HashSet::new(),
            roots: VecDeque::new(),
            message_count: 0,
        }
    }
}

/// One stored message: a channel root, a reply, or a direct message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Server-assigned unique id.
    pub id: MessageId,
    /// The agent that sent this message.
    pub sender: AgentId,
    /// Direct-message target, or a mentioned agent on a channel message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<AgentId>,
    /// The channel this message belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<ChannelName>,
    /// Free-form content blob (e.g. `{"text": "..."}`).
    pub content: Value,
    /// Creation timestamp.
    pub created_at: Timestamp,
    /// The message this one replies to, if any. Absent for roots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
    /// Nesting level within the thread; `0` for roots, capped at 5.
    pub thread_level: ThreadLevel,
    /// A quoted message's id, if this message quotes another.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quoted_message_id: Option<MessageId>,
    /// A short excerpt of the quoted message's content, captured at quote
    /// time so retrieval doesn't need a second lookup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quoted_excerpt: Option<String>,
    /// Reaction string to the set of distinct agents who applied it; the
    /// count reported on the wire is this set's length.
    #[serde(default)]
    pub reactions: HashMap<ReactionType, HashSet<AgentId>>,
    /// Attachment ids carried by this message.
    #[serde(default)]
    pub attachments: Vec<AttachmentId>,
    /// Child message ids, in the order they were created.
    #[serde(default)]
    pub children: Vec<MessageId>,
}

impl MessageRecord {
    /// Whether this message is the root of its thread.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.reply_to_id.is_none()
    }
}

/// An uploaded file: independently retained until an explicit purge (spec
/// Open Question decision, SPEC_FULL §F.1), not tied to any message's
/// lifetime.
#[derive(Debug, Clone)]
pub struct Attachment {
    /// Server-assigned unique id.
    pub id: AttachmentId,
    /// The name the uploader gave the file.
    pub file_name: FileName,
    /// Best-effort MIME type, guessed from the file extension.
    pub mime_type: String,
    /// Size of `data`, in bytes.
    pub size: usize,
    /// The raw file bytes.
    pub data: Vec<u8>,
    /// Upload timestamp.
    pub uploaded_at: Timestamp,
    /// The agent that uploaded this file.
    pub owner: AgentId,
}

/// The unordered pair of agents identifying one DM conversation.
pub type DmKey = (AgentId, AgentId);

/// Builds the canonical (order-independent) key for the DM conversation
/// between `a` and `b`.
#[must_use]
pub fn dm_key(a: &AgentId, b: &AgentId) -> DmKey {
    if a.to_string() <= b.to_string() {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

/// Per-message metadata describing its place in its thread, carried
/// alongside the record on retrieval so a client can reconstruct the tree
/// without further lookups (spec §4.6 "Retrieval algorithm").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadInfo {
    /// Whether this message is the root of its thread.
    pub is_root: bool,
    /// This message's nesting level.
    pub thread_level: ThreadLevel,
    /// The number of direct children this message has.
    pub children_count: usize,
}

/// One message plus its thread-position metadata, as emitted by
/// retrieval's pre-order walk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedMessage {
    /// The stored message.
    #[serde(flatten)]
    pub message: MessageRecord,
    /// Its thread-position metadata.
    pub thread_info: ThreadInfo,
}

/// Guesses a best-effort MIME type from a file name's extension. Spec §3
/// calls this "best-effort"; unrecognized extensions fall back to the
/// generic octet-stream type rather than failing the upload.
#[must_use]
pub fn guess_mime_type(file_name: &str) -> String {
    let ext = file_name.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "txt" => "text/plain",
        "md" => "text/markdown",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "pdf" => "application/pdf",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        _ => "application/octet-stream",
    }
    .to_string()
}
