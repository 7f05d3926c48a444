//! Wire protocol for the live-update channels.
//!
//! Each logical channel speaks the same envelope format (bincode-encoded):
//!
//! ```text
//! client → server   ClientEnvelope { id, call }
//! server → client   ServerEnvelope::Reply { id, result }
//!                   ServerEnvelope::Event(PushEvent)
//! ```
//!
//! Replies are correlated back to their call by `id`. Push events carry a
//! stable wire name (`PushEvent::name`) which is also the key the listener
//! guard uses to keep handler registration idempotent.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Logical channel identifiers.
///
/// Invariant: a registry holds at most one connection per name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelName {
    Notifications,
    Presence,
    Chat,
    Activity,
    QuestionUpdates,
    ViewCount,
    BadgeProgress,
}

impl ChannelName {
    /// All channels, in bootstrap order.
    pub const ALL: [ChannelName; 7] = [
        ChannelName::Notifications,
        ChannelName::Presence,
        ChannelName::Chat,
        ChannelName::Activity,
        ChannelName::QuestionUpdates,
        ChannelName::ViewCount,
        ChannelName::BadgeProgress,
    ];

    /// Stable path segment for this channel's endpoint.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelName::Notifications => "notifications",
            ChannelName::Presence => "presence",
            ChannelName::Chat => "chat",
            ChannelName::Activity => "activity",
            ChannelName::QuestionUpdates => "question-updates",
            ChannelName::ViewCount => "view-count",
            ChannelName::BadgeProgress => "badge-progress",
        }
    }

    /// Whether the channel only runs for an authenticated session.
    ///
    /// Anonymous visitors still get presence, activity, question updates
    /// and view counters; per-user channels never start without a user.
    pub fn requires_auth(&self) -> bool {
        matches!(
            self,
            ChannelName::Notifications | ChannelName::Chat | ChannelName::BadgeProgress
        )
    }
}

impl std::fmt::Display for ChannelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A server-pushed notification payload.
///
/// Optional fields may be absent on the wire; consumers degrade gracefully
/// (a missing `related_score` simply omits the score text).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub id: Uuid,
    pub kind: String,
    pub message: String,
    /// Server clock, milliseconds since the Unix epoch.
    pub created_at: u64,
    #[serde(default)]
    pub target_url: Option<String>,
    #[serde(default)]
    pub related_score: Option<i64>,
}

/// Server-to-client push events, across all channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PushEvent {
    // notifications channel
    ReceiveNotification(NotificationEvent),
    NotificationMarkedAsRead { id: Uuid },
    AllNotificationsMarkedAsRead,
    ReputationChanged {
        user_id: Uuid,
        new_value: i64,
        #[serde(default)]
        reason: Option<String>,
    },

    // presence channel
    UserOnline { user_id: Uuid },
    UserOffline { user_id: Uuid },
    OnlineUsers { user_ids: Vec<Uuid> },
    OnlineCount { count: u64 },

    // view-count channel
    ReceiveCurrentViewCount { resource_id: String, count: u64 },
    ReceiveUpdatedViewCount { resource_id: String, count: u64 },

    // badge channel
    BadgeProgressUpdated { badge_id: String, current: u32, target: u32 },
    BadgeAwarded { badge_id: String, name: String },

    // chat channel
    ReceiveChatMessage {
        sender_id: Uuid,
        sender_name: String,
        body: String,
        sent_at: u64,
    },

    // activity channel
    ActivityRecorded {
        actor_name: String,
        action: String,
        target_id: String,
        occurred_at: u64,
    },
}

impl PushEvent {
    /// Stable wire name for this event, used as the listener-guard key.
    pub fn name(&self) -> &'static str {
        match self {
            PushEvent::ReceiveNotification(_) => "ReceiveNotification",
            PushEvent::NotificationMarkedAsRead { .. } => "NotificationMarkedAsRead",
            PushEvent::AllNotificationsMarkedAsRead => "AllNotificationsMarkedAsRead",
            PushEvent::ReputationChanged { .. } => "ReputationChanged",
            PushEvent::UserOnline { .. } => "UserOnline",
            PushEvent::UserOffline { .. } => "UserOffline",
            PushEvent::OnlineUsers { .. } => "OnlineUsers",
            PushEvent::OnlineCount { .. } => "OnlineCount",
            PushEvent::ReceiveCurrentViewCount { .. } => "ReceiveCurrentViewCount",
            PushEvent::ReceiveUpdatedViewCount { .. } => "ReceiveUpdatedViewCount",
            PushEvent::BadgeProgressUpdated { .. } => "BadgeProgressUpdated",
            PushEvent::BadgeAwarded { .. } => "BadgeAwarded",
            PushEvent::ReceiveChatMessage { .. } => "ReceiveChatMessage",
            PushEvent::ActivityRecorded { .. } => "ActivityRecorded",
        }
    }
}

/// Client-to-server hub calls.
///
/// A call is issued over an already-open channel and answered by exactly
/// one correlated reply. Calls are never retried by this layer; the caller
/// decides what a failure means (toast, optimistic fallback, ignore).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoteCall {
    PageView { path: String, title: String },
    RecordAction {
        action_type: String,
        target_id: String,
        #[serde(default)]
        details: Option<String>,
    },
    JoinGroup { name: String },
    LeaveGroup { name: String },
    JoinQuestionGroup { question_id: u64 },
    MarkAsRead { id: Uuid },
    MarkAllAsRead,
    IncreaseViewCount { resource_id: String },
    GetCurrentViewCount { resource_id: String },
}

impl RemoteCall {
    /// Hub method name for this call.
    pub fn method(&self) -> &'static str {
        match self {
            RemoteCall::PageView { .. } => "PageView",
            RemoteCall::RecordAction { .. } => "RecordAction",
            RemoteCall::JoinGroup { .. } => "JoinGroup",
            RemoteCall::LeaveGroup { .. } => "LeaveGroup",
            RemoteCall::JoinQuestionGroup { .. } => "JoinQuestionGroup",
            RemoteCall::MarkAsRead { .. } => "MarkAsRead",
            RemoteCall::MarkAllAsRead => "MarkAllAsRead",
            RemoteCall::IncreaseViewCount { .. } => "IncreaseViewCount",
            RemoteCall::GetCurrentViewCount { .. } => "GetCurrentViewCount",
        }
    }
}

/// Client-to-server envelope: one correlated call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientEnvelope {
    /// Correlation id, unique per link.
    pub id: u64,
    pub call: RemoteCall,
}

/// Server-to-client envelope: a reply to a call, or an unsolicited push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerEnvelope {
    Reply {
        id: u64,
        /// `Ok(Some(n))` for calls that return a number
        /// (e.g. `GetCurrentViewCount`), `Ok(None)` otherwise.
        result: Result<Option<u64>, String>,
    },
    Event(PushEvent),
}

impl ClientEnvelope {
    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (env, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(env)
    }
}

impl ServerEnvelope {
    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (env, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(env)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    /// The transport could not be established.
    ConnectFailed(String),
    /// The transport dropped underneath us.
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectFailed(e) => write!(f, "Connect failed: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
