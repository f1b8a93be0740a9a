//! Error handling.

use std::fmt;

use tokio_tungstenite::tungstenite;

/// Every way the service can fail.
///
/// The unit variants up to [`Error::NoMasterKey`] are the stable error
/// kinds that may surface on the wire; the remainder are transport,
/// encoding, and storage failures.
#[derive(Debug)]
pub enum Error {
    /// Authentication or authorization failure.
    AccessDenied,

    /// No account is registered under the given personal identity.
    AccountNotFound,

    /// The personal identity is already attached to another account.
    PersonalIdentityInUse,

    /// The email verification token did not verify or has expired.
    InvalidVerificationToken,

    /// The password reset confirmation code did not verify or has expired.
    InvalidConfirmationCode,

    /// The named room does not exist.
    RoomNotFound,

    /// The PM does not exist.
    PmNotFound,

    /// The message does not exist, or has aged out of retention.
    MessageNotFound,

    /// The account does not hold a manager grant for the room.
    ManagerNotFound,

    /// No capability row exists under the computed id.
    CapabilityNotFound,

    /// The edit's `previous_edit_id` does not match the stored chain.
    EditInconsistent,

    /// The proposed nick is empty or too long.
    InvalidNick,

    /// A key or envelope was structurally invalid or failed to verify.
    InvalidKey,

    /// The operation requires the key in decrypted form.
    KeyMustBeDecrypted,

    /// The operation requires the key in encrypted form.
    KeyMustBeEncrypted,

    /// The KMS has no master key configured.
    NoMasterKey,

    /// The connection is closed.
    ConnectionClosed,

    /// A ping was not replied to in time.
    PingTimeout,

    /// A binary message was received on the frame transport.
    ReceivedBinaryMessage,

    /// A packet was not sent because it could not be serialized.
    MalformedPacket(serde_json::Error),

    /// A malformed packet was received.
    ReceivedMalformedPacket(serde_json::Error),

    /// A socket error outside the websocket layer.
    Io(std::io::Error),

    /// A websocket transport error.
    Tungstenite(tungstenite::Error),

    /// A storage error.
    Database(rusqlite::Error),

    /// A cipher, KDF, or encoding failure outside the stable kinds.
    Crypto(String),

    /// A configuration problem.
    Config(String),
}

impl Error {
    /// The HTTP status the join path maps this error to.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::RoomNotFound | Self::PmNotFound => 404,
            Self::AccessDenied => 401,
            _ => 500,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AccessDenied => write!(f, "access denied"),
            Self::AccountNotFound => write!(f, "account not found"),
            Self::PersonalIdentityInUse => write!(f, "personal identity already in use"),
            Self::InvalidVerificationToken => write!(f, "invalid verification token"),
            Self::InvalidConfirmationCode => write!(f, "invalid confirmation code"),
            Self::RoomNotFound => write!(f, "room not found"),
            Self::PmNotFound => write!(f, "pm not found"),
            Self::MessageNotFound => write!(f, "message not found"),
            Self::ManagerNotFound => write!(f, "manager not found"),
            Self::CapabilityNotFound => write!(f, "capability not found"),
            Self::EditInconsistent => write!(f, "edit inconsistent"),
            Self::InvalidNick => write!(f, "invalid nick"),
            Self::InvalidKey => write!(f, "invalid key"),
            Self::KeyMustBeDecrypted => write!(f, "key must be decrypted"),
            Self::KeyMustBeEncrypted => write!(f, "key must be encrypted"),
            Self::NoMasterKey => write!(f, "no master key"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::PingTimeout => write!(f, "ping timed out"),
            Self::ReceivedBinaryMessage => write!(f, "received binary message"),
            Self::MalformedPacket(err) => write!(f, "malformed packet: {err}"),
            Self::ReceivedMalformedPacket(err) => write!(f, "received malformed packet: {err}"),
            Self::Io(err) => write!(f, "{err}"),
            Self::Tungstenite(err) => write!(f, "{err}"),
            Self::Database(err) => write!(f, "{err}"),
            Self::Crypto(msg) => write!(f, "{msg}"),
            Self::Config(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::MalformedPacket(err) | Self::ReceivedMalformedPacket(err) => Some(err),
            Self::Io(err) => Some(err),
            Self::Tungstenite(err) => Some(err),
            Self::Database(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<tungstenite::Error> for Error {
    fn from(err: tungstenite::Error) -> Self {
        Self::Tungstenite(err)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err)
    }
}

/// An alias of [`Result`](std::result::Result) for [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
