//! In-process event bus. Components publish what happened; whoever sits
//! on top of the server (admin API, embedding application) subscribes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

/// Capacity of the broadcast ring. Slow subscribers see `Lagged`.
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventType {
    #[serde(rename = "message:received")]
    MessageReceived,
    #[serde(rename = "message:sent")]
    MessageSent,
    #[serde(rename = "member:joined")]
    MemberJoined,
    #[serde(rename = "member:left")]
    MemberLeft,
    #[serde(rename = "member:kicked")]
    MemberKicked,
    #[serde(rename = "member:muted")]
    MemberMuted,
    #[serde(rename = "member:unmuted")]
    MemberUnmuted,
    #[serde(rename = "member:banned")]
    MemberBanned,
    #[serde(rename = "member:unbanned")]
    MemberUnbanned,
    #[serde(rename = "member:role_changed")]
    MemberRoleChanged,
    #[serde(rename = "status:changed")]
    StatusChanged,
    #[serde(rename = "reaction:added")]
    ReactionAdded,
    #[serde(rename = "reaction:removed")]
    ReactionRemoved,
    #[serde(rename = "channel:updated")]
    ChannelUpdated,
    #[serde(rename = "system:connected")]
    SystemConnected,
    #[serde(rename = "system:error")]
    SystemError,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::MessageReceived => "message:received",
            EventType::MessageSent => "message:sent",
            EventType::MemberJoined => "member:joined",
            EventType::MemberLeft => "member:left",
            EventType::MemberKicked => "member:kicked",
            EventType::MemberMuted => "member:muted",
            EventType::MemberUnmuted => "member:unmuted",
            EventType::MemberBanned => "member:banned",
            EventType::MemberUnbanned => "member:unbanned",
            EventType::MemberRoleChanged => "member:role_changed",
            EventType::StatusChanged => "status:changed",
            EventType::ReactionAdded => "reaction:added",
            EventType::ReactionRemoved => "reaction:removed",
            EventType::ChannelUpdated => "channel:updated",
            EventType::SystemConnected => "system:connected",
            EventType::SystemError => "system:error",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventType,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    /// Fire and forget. Publishing with no subscribers is not an error.
    pub fn publish(&self, kind: EventType, data: Value) {
        let event = Event {
            kind,
            data,
            timestamp: Utc::now(),
        };
        if self.tx.send(event).is_err() {
            trace!(event = %kind, "no event subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
