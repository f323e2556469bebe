//! Cross-process messages.
//!
//! Every message on the shared slot is a [`CrossTabMessage`] serialized as a
//! JSON string. The payload is a closed set of [`ChannelEvent`]s; anything
//! else is rejected as malformed.

use crate::document::DocId;
use crate::origin::OriginId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum MessageError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Message kind {declared} does not match payload {actual}")]
    KindMismatch {
        declared: MessageKind,
        actual: MessageKind,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    DocumentChanged,
    DocumentDeleted,
    SyncStatus,
    SessionClaim,
    SessionHeartbeat,
    SessionReleased,
    SettingsChanged,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::DocumentChanged => "document-changed",
            MessageKind::DocumentDeleted => "document-deleted",
            MessageKind::SyncStatus => "sync-status",
            MessageKind::SessionClaim => "session-claim",
            MessageKind::SessionHeartbeat => "session-heartbeat",
            MessageKind::SessionReleased => "session-released",
            MessageKind::SettingsChanged => "settings-changed",
        }
    }

    /// Leader-election traffic, handled by the hub before fan-out.
    pub fn is_session(&self) -> bool {
        matches!(
            self,
            MessageKind::SessionClaim | MessageKind::SessionHeartbeat | MessageKind::SessionReleased
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The live timer session owned by the leader.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionState {
    /// Document the session is attached to (e.g. the task being timed).
    pub task_id: Option<DocId>,
    pub running: bool,
    /// When the current run started, ms since epoch.
    pub started_at: Option<u64>,
    /// Time accumulated by earlier runs.
    pub accumulated_ms: u64,
}

impl SessionState {
    /// Elapsed session time at `now_ms`.
    pub fn elapsed_ms(&self, now_ms: u64) -> u64 {
        let current = match (self.running, self.started_at) {
            (true, Some(start)) => now_ms.saturating_sub(start),
            _ => 0,
        };
        self.accumulated_ms + current
    }
}

/// What a leader announces with every claim and heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderState {
    pub leader_id: OriginId,
    pub last_heartbeat: u64,
    pub claimed_at: u64,
    #[serde(default)]
    pub session_state: SessionState,
}

/// Payloads that may cross the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ChannelEvent {
    /// A document was written locally; other processes reload it.
    #[serde(rename_all = "camelCase")]
    DocumentChanged {
        id: DocId,
        rev: Option<String>,
        #[serde(default)]
        fields: Vec<String>,
    },
    DocumentDeleted { id: DocId },
    SyncStatus { status: String },
    SessionClaim(LeaderState),
    SessionHeartbeat(LeaderState),
    #[serde(rename_all = "camelCase")]
    SessionReleased { leader_id: OriginId },
    SettingsChanged { key: String, value: Value },
}

impl ChannelEvent {
    pub fn kind(&self) -> MessageKind {
        match self {
            ChannelEvent::DocumentChanged { .. } => MessageKind::DocumentChanged,
            ChannelEvent::DocumentDeleted { .. } => MessageKind::DocumentDeleted,
            ChannelEvent::SyncStatus { .. } => MessageKind::SyncStatus,
            ChannelEvent::SessionClaim(_) => MessageKind::SessionClaim,
            ChannelEvent::SessionHeartbeat(_) => MessageKind::SessionHeartbeat,
            ChannelEvent::SessionReleased { .. } => MessageKind::SessionReleased,
            ChannelEvent::SettingsChanged { .. } => MessageKind::SettingsChanged,
        }
    }

    /// The entity this event is about, for deduplication.
    pub fn entity(&self) -> &str {
        match self {
            ChannelEvent::DocumentChanged { id, .. } | ChannelEvent::DocumentDeleted { id } => id,
            ChannelEvent::SyncStatus { .. } => "status",
            ChannelEvent::SessionClaim(_)
            | ChannelEvent::SessionHeartbeat(_)
            | ChannelEvent::SessionReleased { .. } => "session",
            ChannelEvent::SettingsChanged { key, .. } => key,
        }
    }

    /// Semantic key `"{kind}:{entity}"`: two events with the same key describe
    /// the same logical change, whatever their message ids.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.kind(), self.entity())
    }
}

/// One message on the shared slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossTabMessage {
    pub id: String,
    pub kind: MessageKind,
    /// Send time, ms since epoch.
    pub timestamp: u64,
    pub origin_id: OriginId,
    pub payload: ChannelEvent,
}

impl CrossTabMessage {
    pub fn new(origin_id: OriginId, timestamp: u64, payload: ChannelEvent) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: payload.kind(),
            timestamp,
            origin_id,
            payload,
        }
    }

    pub fn to_json(&self) -> Result<String, MessageError> {
        serde_json::to_string(self).map_err(|e| MessageError::Malformed(e.to_string()))
    }

    /// Parse and validate a slot value.
    pub fn from_json(raw: &str) -> Result<Self, MessageError> {
        let msg: Self =
            serde_json::from_str(raw).map_err(|e| MessageError::Malformed(e.to_string()))?;
        let actual = msg.payload.kind();
        if msg.kind != actual {
            return Err(MessageError::KindMismatch {
                declared: msg.kind,
                actual,
            });
        }
        Ok(msg)
    }
}

/// An event delivered to in-process consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingEvent {
    pub kind: MessageKind,
    pub payload: ChannelEvent,
    pub origin_id: OriginId,
}

impl From<CrossTabMessage> for IncomingEvent {
    fn from(msg: CrossTabMessage) -> Self {
        Self {
            kind: msg.kind,
            payload: msg.payload,
            origin_id: msg.origin_id,
        }
    }
}
