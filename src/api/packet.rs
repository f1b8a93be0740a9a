//! The packets exchanged between the server and its clients.
//!
//! Every frame on the wire is a single UTF-8 JSON object. Commands carry a
//! client-generated id which the server echoes in exactly one reply; events
//! carry no id.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::PacketType;

/// A "raw" packet.
///
/// This packet closely matches the wire representation. It can contain
/// arbitrary data in the form of a JSON [`Value`]. It can also contain both
/// data and an error at the same time.
///
/// In order to interpret this packet, you probably want to convert it to a
/// [`ParsedPacket`] using [`ParsedPacket::from_packet`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    /// Client-generated id for associating replies with commands.
    pub id: Option<String>,
    /// The type of the command, reply, or event.
    pub r#type: PacketType,
    /// The payload of the command, reply, or event.
    pub data: Option<Value>,
    /// This field appears in replies if a command fails.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// This field appears in replies to warn the client that it may be
    /// flooding.
    ///
    /// The client should slow down its command rate.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub throttled: bool,
    /// If throttled is true, this field describes why.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throttled_reason: Option<String>,
}

/// Models the relationship between command and reply types.
///
/// This trait is useful for type-safe command-reply APIs.
pub trait Command {
    /// The type of reply the client can expect from the server when sending
    /// this command.
    type Reply;
}

macro_rules! packets {
    ( $( $mod:ident::$name:ident, )*) => {
        /// A big enum containing every type of packet data.
        #[derive(Debug, Clone)]
        #[non_exhaustive]
        pub enum Data {
            $( $name(super::$mod::$name), )*
        }

        impl Data {
            /// Interpret a JSON [`Value`] as packet data of a specific
            /// [`PacketType`].
            ///
            /// This method may fail if the data is invalid, or if the type
            /// does not name a payload-carrying packet.
            pub fn from_value(ptype: PacketType, value: Value) -> serde_json::Result<Self> {
                use serde::de::Error;
                Ok(match ptype {
                    $( PacketType::$name => Self::$name(serde_json::from_value(value)?), )*
                    _ => return Err(serde_json::Error::custom(format!(
                        "no payload known for packet type {ptype}"
                    ))),
                })
            }

            /// Convert the packet data into a JSON [`Value`].
            ///
            /// This method may fail if the data fails to serialize.
            pub fn into_value(self) -> serde_json::Result<Value> {
                Ok(match self {
                    $( Self::$name(p) => serde_json::to_value(p)?, )*
                })
            }

            /// The [`PacketType`] of this packet data.
            pub fn packet_type(&self) -> PacketType {
                match self {
                    $( Self::$name(_) => PacketType::$name, )*
                }
            }
        }

        $(
            impl From<super::$mod::$name> for Data {
                fn from(p: super::$mod::$name) -> Self {
                    Self::$name(p)
                }
            }

            impl TryFrom<Data> for super::$mod::$name {
                type Error = ();

                fn try_from(value: Data) -> Result<Self, Self::Error> {
                    match value {
                        Data::$name(p) => Ok(p),
                        _ => Err(())
                    }
                }
            }
        )*
    };
}

macro_rules! commands {
    ( $( $cmd:ident => $rpl:ident, )* ) => {
        $(
            impl Command for super::$cmd {
                type Reply = super::$rpl;
            }
        )*
    };
}

packets! {
    // Events
    events::BounceEvent,
    events::DisconnectEvent,
    events::EditMessageEvent,
    events::JoinEvent,
    events::NetworkEvent,
    events::NickEvent,
    events::PartEvent,
    events::PingEvent,
    events::SendEvent,
    events::SnapshotEvent,
    // Session commands
    session_cmds::Auth,
    session_cmds::AuthReply,
    session_cmds::Ping,
    session_cmds::PingReply,
    // Chat room commands
    room_cmds::GetMessage,
    room_cmds::GetMessageReply,
    room_cmds::Log,
    room_cmds::LogReply,
    room_cmds::Nick,
    room_cmds::NickReply,
    room_cmds::PmInitiate,
    room_cmds::PmInitiateReply,
    room_cmds::Send,
    room_cmds::SendReply,
    room_cmds::Who,
    room_cmds::WhoReply,
    room_cmds::EditMessage,
    room_cmds::EditMessageReply,
    room_cmds::CreateRoom,
    room_cmds::CreateRoomReply,
    // Account commands
    account_cmds::Login,
    account_cmds::LoginReply,
    account_cmds::Logout,
    account_cmds::LogoutReply,
    account_cmds::RegisterAccount,
    account_cmds::RegisterAccountReply,
}

commands! {
    // Session commands
    Auth => AuthReply,
    Ping => PingReply,
    // Chat room commands
    GetMessage => GetMessageReply,
    Log => LogReply,
    Nick => NickReply,
    PmInitiate => PmInitiateReply,
    Send => SendReply,
    Who => WhoReply,
    EditMessage => EditMessageReply,
    CreateRoom => CreateRoomReply,
    // Account commands
    Login => LoginReply,
    Logout => LogoutReply,
    RegisterAccount => RegisterAccountReply,
}

/// A fully parsed and interpreted packet.
///
/// Compared to [`Packet`], this packet's representation more closely
/// matches the actual use of packets.
#[derive(Debug, Clone)]
pub struct ParsedPacket {
    /// Client-generated id for associating replies with commands.
    pub id: Option<String>,
    /// The type of the command, reply, or event.
    pub r#type: PacketType,
    /// The payload of the command, reply, or event, or an error message if
    /// the command failed.
    pub content: Result<Data, String>,
    /// A warning to the client that it may be flooding.
    ///
    /// The client should slow down its command rate.
    pub throttled: Option<String>,
}

impl ParsedPacket {
    /// Convert a [`Data`]-compatible value into a [`ParsedPacket`].
    pub fn from_data(id: Option<String>, data: impl Into<Data>) -> Self {
        let data = data.into();
        Self {
            id,
            r#type: data.packet_type(),
            content: Ok(data),
            throttled: None,
        }
    }

    /// Construct an error reply to the command with the given id and type.
    ///
    /// When the command type is unknown or carries no reply type, the reply
    /// is tagged [`PacketType::ErrorReply`].
    pub fn from_error(id: Option<String>, cmd_type: Option<PacketType>, error: String) -> Self {
        let r#type = cmd_type
            .and_then(PacketType::reply_type)
            .unwrap_or(PacketType::ErrorReply);
        Self {
            id,
            r#type,
            content: Err(error),
            throttled: None,
        }
    }

    /// Convert a [`Packet`] into a [`ParsedPacket`].
    ///
    /// This method may fail if the packet data is invalid.
    pub fn from_packet(packet: Packet) -> serde_json::Result<Self> {
        let id = packet.id;
        let r#type = packet.r#type;

        let content = if let Some(error) = packet.error {
            Err(error)
        } else {
            let data = packet.data.unwrap_or_default();
            Ok(Data::from_value(r#type, data)?)
        };

        let throttled = if packet.throttled {
            let reason = packet
                .throttled_reason
                .unwrap_or_else(|| "no reason given".to_string());
            Some(reason)
        } else {
            None
        };

        Ok(Self {
            id,
            r#type,
            content,
            throttled,
        })
    }

    /// Convert a [`ParsedPacket`] into a [`Packet`].
    ///
    /// This method may fail if the packet data fails to serialize.
    pub fn into_packet(self) -> serde_json::Result<Packet> {
        let id = self.id;
        let r#type = self.r#type;
        let throttled = self.throttled.is_some();
        let throttled_reason = self.throttled;

        Ok(match self.content {
            Ok(data) => Packet {
                id,
                r#type,
                data: Some(data.into_value()?),
                error: None,
                throttled,
                throttled_reason,
            },
            Err(error) => Packet {
                id,
                r#type,
                data: None,
                error: Some(error),
                throttled,
                throttled_reason,
            },
        })
    }
}

impl TryFrom<Packet> for ParsedPacket {
    type Error = serde_json::Error;

    fn try_from(value: Packet) -> Result<Self, Self::Error> {
        Self::from_packet(value)
    }
}

impl TryFrom<ParsedPacket> for Packet {
    type Error = serde_json::Error;

    fn try_from(value: ParsedPacket) -> Result<Self, Self::Error> {
        value.into_packet()
    }
}

#[cfg(test)]
mod tests {
    use super::super::{
        Auth, AuthOption, Log, Nick, Ping, Send, SessionId, SessionView, Time, UserId, Who,
    };
    use super::*;
    use crate::snowflake::Snowflake;

    fn round_trip(data: impl Into<Data> + Clone) -> Data {
        let packet = ParsedPacket::from_data(Some("1".into()), data)
            .into_packet()
            .unwrap();
        let text = serde_json::to_string(&packet).unwrap();
        let packet: Packet = serde_json::from_str(&text).unwrap();
        let parsed = ParsedPacket::from_packet(packet).unwrap();
        assert_eq!(parsed.id.as_deref(), Some("1"));
        parsed.content.unwrap()
    }

    #[test]
    fn command_round_trips() {
        match round_trip(Send {
            content: "hi".into(),
            parent: None,
        }) {
            Data::Send(p) => assert_eq!(p.content, "hi"),
            other => panic!("unexpected payload: {other:?}"),
        }

        match round_trip(Auth {
            r#type: AuthOption::Passcode,
            passcode: Some("swordfish".into()),
        }) {
            Data::Auth(p) => assert_eq!(p.passcode.as_deref(), Some("swordfish")),
            other => panic!("unexpected payload: {other:?}"),
        }

        match round_trip(Nick { name: "nanook".into() }) {
            Data::Nick(p) => assert_eq!(p.name, "nanook"),
            other => panic!("unexpected payload: {other:?}"),
        }

        match round_trip(Log { n: 10, before: None }) {
            Data::Log(p) => assert_eq!(p.n, 10),
            other => panic!("unexpected payload: {other:?}"),
        }

        match round_trip(Ping { time: Time(12345) }) {
            Data::Ping(p) => assert_eq!(p.time, Time(12345)),
            other => panic!("unexpected payload: {other:?}"),
        }

        match round_trip(Who {}) {
            Data::Who(_) => {}
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn edit_message_defaults() {
        let packet: Packet = serde_json::from_str(
            r#"{"id":"2","type":"edit-message","data":{"id":"0000000000abc","previous_edit_id":0,"content":"hello","announce":true}}"#,
        )
        .unwrap();
        let parsed = ParsedPacket::from_packet(packet).unwrap();
        match parsed.content.unwrap() {
            Data::EditMessage(p) => {
                assert!(p.previous_edit_id.is_zero());
                assert!(p.announce);
                assert!(!p.delete);
                assert_eq!(p.content, "hello");
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn events_have_no_id() {
        let view = SessionView {
            id: UserId::for_agent("x"),
            name: "nanook".into(),
            server_id: "s1".into(),
            server_era: "e1".into(),
            session_id: SessionId("s1-0001".into()),
            is_staff: false,
            is_manager: false,
        };
        let packet = ParsedPacket::from_data(None, super::super::JoinEvent(view))
            .into_packet()
            .unwrap();
        assert_eq!(packet.id, None);
        assert_eq!(packet.r#type, PacketType::JoinEvent);
    }

    #[test]
    fn error_replies_echo_the_request_id() {
        let reply = ParsedPacket::from_error(
            Some("7".into()),
            Some(PacketType::EditMessage),
            "edit inconsistent".into(),
        );
        let packet = reply.into_packet().unwrap();
        assert_eq!(packet.id.as_deref(), Some("7"));
        assert_eq!(packet.r#type, PacketType::EditMessageReply);
        assert_eq!(packet.error.as_deref(), Some("edit inconsistent"));

        let reply = ParsedPacket::from_error(Some("8".into()), None, "invalid command type".into());
        assert_eq!(reply.r#type, PacketType::ErrorReply);
    }

    #[test]
    fn zero_snowflake_wire_form() {
        let text = serde_json::to_string(&Snowflake::ZERO).unwrap();
        assert_eq!(text, "\"0000000000000\"");
    }
}
