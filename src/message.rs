//! Message protocol definitions
//!
//! JSON-based message protocol. Client requests are plain objects whose
//! shape is implied by connection phase (first message claims a username,
//! every later one forwards a chat). Server messages are an enum so the
//! outbound queue carries a closed set of variants, but they go out as one
//! flat object with every field present.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Username;

/// Client → Server: first message on a new connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimUsernameRequest {
    pub username: Username,
}

/// Client → Server: route `content` to another user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardMessageRequest {
    pub to_username: Username,
    pub content: String,
}

/// Server → Client message
///
/// Internally a closed set of variants. On the wire every message carries
/// the full field set (`type`, `fromUsername`, `toUsername`, `content`,
/// `timestamp`, `users`); fields a variant does not use are sent empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireMessage", from = "WireMessage")]
pub enum ServerMessage {
    /// A routed direct message; `timestamp` is stamped by the registry
    Chat {
        from_username: Username,
        to_username: Username,
        content: String,
        timestamp: DateTime<Utc>,
    },
    /// Full presence snapshot, sent on every membership change
    Broadcast {
        users: BTreeSet<Username>,
        timestamp: DateTime<Utc>,
    },
}

impl ServerMessage {
    /// Build a chat message stamped with the current time
    pub fn chat(from: Username, to: Username, content: String) -> Self {
        ServerMessage::Chat {
            from_username: from,
            to_username: to,
            content,
            timestamp: Utc::now(),
        }
    }

    pub fn broadcast(users: BTreeSet<Username>) -> Self {
        ServerMessage::Broadcast {
            users,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum MessageKind {
    Chat,
    Broadcast,
}

/// Flat wire form of [`ServerMessage`]
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(rename = "type")]
    kind: MessageKind,
    #[serde(default)]
    from_username: Username,
    #[serde(default)]
    to_username: Username,
    #[serde(default)]
    content: String,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    users: BTreeSet<Username>,
}

impl From<ServerMessage> for WireMessage {
    fn from(msg: ServerMessage) -> Self {
        match msg {
            ServerMessage::Chat {
                from_username,
                to_username,
                content,
                timestamp,
            } => WireMessage {
                kind: MessageKind::Chat,
                from_username,
                to_username,
                content,
                timestamp,
                users: BTreeSet::new(),
            },
            ServerMessage::Broadcast { users, timestamp } => WireMessage {
                kind: MessageKind::Broadcast,
                from_username: Username::default(),
                to_username: Username::default(),
                content: String::new(),
                timestamp,
                users,
            },
        }
    }
}

impl From<WireMessage> for ServerMessage {
    fn from(wire: WireMessage) -> Self {
        match wire.kind {
            MessageKind::Chat => ServerMessage::Chat {
                from_username: wire.from_username,
                to_username: wire.to_username,
                content: wire.content,
                timestamp: wire.timestamp,
            },
            MessageKind::Broadcast => ServerMessage::Broadcast {
                users: wire.users,
                timestamp: wire.timestamp,
            },
        }
    }
}
