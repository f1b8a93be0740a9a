//! Asynchronous events pushed by the server.

use serde::{Deserialize, Serialize};

use super::{AuthOption, Message, SessionId, SessionView, Time, UserId};
use crate::snowflake::Snowflake;

/// Indicates that access to the room is denied pending authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BounceEvent {
    /// The reason why access was denied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// The authentication methods the session may attempt.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub auth_options: Vec<AuthOption>,
    /// The banned agent, when bouncing due to an agent ban.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// The banned address, when bouncing due to an IP ban.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

/// Informs the session that it is about to be closed by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisconnectEvent {
    /// The reason for the disconnect.
    pub reason: String,
}

/// Announces that a session has joined the room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JoinEvent(pub SessionView);

/// Announces that a session has left the room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartEvent(pub SessionView);

/// Announces a change in the state of the cluster hosting the room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkEvent {
    /// The type of network change; currently always `"partition"`.
    pub r#type: String,
    /// The id of the affected server.
    pub server_id: String,
    /// The era of the affected server.
    pub server_era: String,
}

/// Announces that a session in the room has changed its name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NickEvent {
    /// The id of the session whose name changed.
    pub session_id: SessionId,
    /// The id of the agent or account logged into the session.
    pub id: UserId,
    /// The previous name.
    pub from: String,
    /// The new name.
    pub to: String,
}

/// Announces that a message in the room has been modified or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditMessageEvent {
    /// The unique id of the edit that was applied.
    pub edit_id: Snowflake,
    /// The message after the edit.
    #[serde(flatten)]
    pub message: Message,
}

/// Represents a server-to-client ping.
///
/// The client should send back a [`PingReply`](super::PingReply) with the
/// same timestamp as soon as possible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingEvent {
    /// The unix timestamp according to the server.
    pub time: Time,
    /// The expected time of the next ping event, according to the server.
    pub next: Time,
}

/// Announces a message sent to the room by another session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SendEvent(pub Message);

/// Describes the state of the room to a session that just joined it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEvent {
    /// The id of the agent or account logged into this session.
    pub identity: UserId,
    /// The id of this session.
    pub session_id: SessionId,
    /// The version of the server hosting this session.
    pub version: String,
    /// The sessions currently joined in the room.
    pub listing: Vec<SessionView>,
    /// The most recent messages posted to the room.
    pub log: Vec<Message>,
}
