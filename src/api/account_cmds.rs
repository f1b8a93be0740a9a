//! Account commands.
//!
//! These commands enable a client to register, associate, and dissociate
//! with an account. An account allows an identity to be shared across
//! browsers and devices, and is a prerequisite for room management.

use serde::{Deserialize, Serialize};

use super::AccountId;

/// Attempt to log an anonymous session into an account.
///
/// The command will return an error if the session is already logged in.
///
/// If the login succeeds, the client should expect to receive a
/// [`DisconnectEvent`](super::DisconnectEvent) shortly after. The next
/// connection the client makes will be a logged in session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Login {
    /// The namespace of a personal identifier.
    pub namespace: String,
    /// The id of a personal identifier.
    pub id: String,
    /// The password for unlocking the account.
    pub password: String,
}

/// Return whether the session successfully logged into an account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginReply {
    /// True if the session is now logged in.
    pub success: bool,
    /// If [`Self::success`] was false, the reason why.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// If [`Self::success`] was true, the id of the account the session
    /// logged into.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<AccountId>,
}

/// Log a session out of an account.
///
/// The command will return an error if the session is not logged in.
///
/// If the logout is successful, the client should expect to receive a
/// [`DisconnectEvent`](super::DisconnectEvent) shortly after. The next
/// connection the client makes will be a logged out session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logout;

/// Confirm a logout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogoutReply;

/// Create a new account and log into it.
///
/// The command will return an error if the session is already logged in.
///
/// If the account registration succeeds, the client should expect to
/// receive a [`DisconnectEvent`](super::DisconnectEvent) shortly after. The
/// next connection the client makes will be a logged in session using the
/// new account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAccount {
    /// The namespace of a personal identifier.
    pub namespace: String,
    /// The id of a personal identifier.
    pub id: String,
    /// The password for unlocking the account.
    pub password: String,
}

/// Return whether the new account was registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAccountReply {
    /// True if the session is now logged in.
    pub success: bool,
    /// If [`Self::success`] was false, the reason why.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// If [`Self::success`] was true, the id of the account the session
    /// logged into.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<AccountId>,
}
