//! The wire protocol spoken over each session's transport.

mod account_cmds;
mod events;
pub mod packet;
mod room_cmds;
mod session_cmds;
mod types;

pub use account_cmds::*;
pub use events::*;
pub use packet::{Data, Packet, ParsedPacket};
pub use room_cmds::*;
pub use session_cmds::*;
pub use types::*;
