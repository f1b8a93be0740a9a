//! Field types shared by commands, replies, and events.

// Serde's derive macros generate this warning and it can't be turned off
// locally, so it's off for the entire module.
#![allow(clippy::use_self)]

use std::fmt;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::snowflake::Snowflake;

/// Describes an account and its preferred name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountView {
    /// The id of the account.
    pub id: AccountId,
    /// The name that the holder of the account goes by.
    pub name: String,
}

/// Mode of authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthOption {
    /// Authentication with a passcode, where a key is derived from the
    /// passcode to unlock an access grant.
    Passcode,
}

/// A node in a room's log.
///
/// It corresponds to a chat message, or a post, or any broadcasted event in
/// a room that should appear in the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// The id of the message (unique within a room).
    pub id: MessageId,
    /// The id of the message's parent, or null if top-level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<MessageId>,
    /// The edit id of the most recent edit of this message, or null if it's
    /// never been edited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_edit_id: Option<Snowflake>,
    /// The unix timestamp of when the message was posted.
    pub time: Time,
    /// The view of the sender's session.
    pub sender: SessionView,
    /// The content of the message (client-defined).
    ///
    /// If the room was encrypted when the message was posted, this holds
    /// `base64url(tag) + "/" + base64url(ciphertext)` instead of plaintext.
    pub content: String,
    /// The id of the key that encrypts the message in storage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key_id: Option<String>,
    /// The unix timestamp of when the message was last edited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited: Option<Time>,
    /// The unix timestamp of when the message was deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<Time>,
}

impl Message {
    /// True if the content is stored encrypted under a room message key.
    pub fn encrypted(&self) -> bool {
        self.encryption_key_id.is_some()
    }
}

/// The type of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PacketType {
    // Asynchronous events
    /// See [`BounceEvent`](super::BounceEvent).
    BounceEvent,
    /// See [`DisconnectEvent`](super::DisconnectEvent).
    DisconnectEvent,
    /// See [`JoinEvent`](super::JoinEvent).
    JoinEvent,
    /// See [`PartEvent`](super::PartEvent).
    PartEvent,
    /// See [`NetworkEvent`](super::NetworkEvent).
    NetworkEvent,
    /// See [`NickEvent`](super::NickEvent).
    NickEvent,
    /// See [`EditMessageEvent`](super::EditMessageEvent).
    EditMessageEvent,
    /// See [`PingEvent`](super::PingEvent).
    PingEvent,
    /// See [`SendEvent`](super::SendEvent).
    SendEvent,
    /// See [`SnapshotEvent`](super::SnapshotEvent).
    SnapshotEvent,

    // Session commands
    /// See [`Auth`](super::Auth).
    Auth,
    /// See [`AuthReply`](super::AuthReply).
    AuthReply,
    /// See [`Ping`](super::Ping).
    Ping,
    /// See [`PingReply`](super::PingReply).
    PingReply,

    // Chat room commands
    /// See [`GetMessage`](super::GetMessage).
    GetMessage,
    /// See [`GetMessageReply`](super::GetMessageReply).
    GetMessageReply,
    /// See [`Log`](super::Log).
    Log,
    /// See [`LogReply`](super::LogReply).
    LogReply,
    /// See [`Nick`](super::Nick).
    Nick,
    /// See [`NickReply`](super::NickReply).
    NickReply,
    /// See [`PmInitiate`](super::PmInitiate).
    PmInitiate,
    /// See [`PmInitiateReply`](super::PmInitiateReply).
    PmInitiateReply,
    /// See [`Send`](super::Send).
    Send,
    /// See [`SendReply`](super::SendReply).
    SendReply,
    /// See [`Who`](super::Who).
    Who,
    /// See [`WhoReply`](super::WhoReply).
    WhoReply,

    // Room host commands
    /// See [`EditMessage`](super::EditMessage).
    EditMessage,
    /// See [`EditMessageReply`](super::EditMessageReply).
    EditMessageReply,

    // Staff commands
    /// See [`CreateRoom`](super::CreateRoom).
    CreateRoom,
    /// See [`CreateRoomReply`](super::CreateRoomReply).
    CreateRoomReply,

    // Account commands
    /// See [`Login`](super::Login).
    Login,
    /// See [`LoginReply`](super::LoginReply).
    LoginReply,
    /// See [`Logout`](super::Logout).
    Logout,
    /// See [`LogoutReply`](super::LogoutReply).
    LogoutReply,
    /// See [`RegisterAccount`](super::RegisterAccount).
    RegisterAccount,
    /// See [`RegisterAccountReply`](super::RegisterAccountReply).
    RegisterAccountReply,

    /// Reply to a command whose type the server does not recognize.
    ErrorReply,
}

impl PacketType {
    /// The reply type corresponding to this command type, if this is a
    /// command.
    pub fn reply_type(self) -> Option<Self> {
        match self {
            Self::Auth => Some(Self::AuthReply),
            Self::Ping => Some(Self::PingReply),
            Self::GetMessage => Some(Self::GetMessageReply),
            Self::Log => Some(Self::LogReply),
            Self::Nick => Some(Self::NickReply),
            Self::PmInitiate => Some(Self::PmInitiateReply),
            Self::Send => Some(Self::SendReply),
            Self::Who => Some(Self::WhoReply),
            Self::EditMessage => Some(Self::EditMessageReply),
            Self::CreateRoom => Some(Self::CreateRoomReply),
            Self::Login => Some(Self::LoginReply),
            Self::Logout => Some(Self::LogoutReply),
            Self::RegisterAccount => Some(Self::RegisterAccountReply),
            _ => None,
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_value(self) {
            Ok(Value::String(s)) => write!(f, "{s}"),
            _ => Err(fmt::Error),
        }
    }
}

/// Describes an account to its owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonalAccountView {
    /// The id of the account.
    pub id: AccountId,
    /// The name that the holder of the account goes by.
    pub name: String,
    /// The account's email address.
    pub email: String,
}

/// Describes a session and its identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionView {
    /// The id of an agent or account.
    pub id: UserId,
    /// The name-in-use at the time this view was captured.
    pub name: String,
    /// The id of the server that captured this view.
    pub server_id: String,
    /// The era of the server that captured this view.
    pub server_era: String,
    /// Id of the session, unique across all sessions globally.
    pub session_id: SessionId,
    /// If true, this session belongs to a member of staff.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_staff: bool,
    /// If true, this session belongs to a manager of the room.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_manager: bool,
}

/// Time is specified as a signed 64-bit integer, giving the number of
/// seconds since the Unix Epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Time(pub i64);

impl Time {
    pub fn from_timestamp(time: Timestamp) -> Self {
        Self(time.as_second())
    }

    pub fn as_timestamp(&self) -> Timestamp {
        Timestamp::from_second(self.0).unwrap()
    }

    pub fn now() -> Self {
        Self::from_timestamp(Timestamp::now())
    }
}

/// Identifies a user.
///
/// The prefix of this value (up to the colon) indicates a type of session,
/// while the suffix is a unique value for that type of session.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn for_agent(agent_id: &str) -> Self {
        Self(format!("agent:{agent_id}"))
    }

    pub fn for_account(account_id: Snowflake) -> Self {
        Self(format!("account:{account_id}"))
    }

    pub fn session_type(&self) -> Option<SessionType> {
        if self.0.starts_with("agent:") {
            Some(SessionType::Agent)
        } else if self.0.starts_with("account:") {
            Some(SessionType::Account)
        } else {
            None
        }
    }

    /// The account id of an `account:` user, if it is one.
    pub fn account_id(&self) -> Option<Snowflake> {
        let suffix = self.0.strip_prefix("account:")?;
        suffix.parse().ok()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum SessionType {
    Agent,
    Account,
}

/// Identifies an account.
///
/// This type is a wrapper around [`Snowflake`] meant for type safety.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(pub Snowflake);

/// Identifies a message.
///
/// This type is a wrapper around [`Snowflake`] meant for type safety.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub Snowflake);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a private room.
///
/// This type is a wrapper around [`Snowflake`] meant for type safety.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PmId(pub Snowflake);

impl fmt::Display for PmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a session.
///
/// This type is a wrapper around [`String`] meant for type safety.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
