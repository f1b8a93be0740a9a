//! Session authentication and authorization state.

use std::collections::HashMap;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;

use crate::account::Account;
use crate::api::{Auth, AuthOption};
use crate::backend::Backend;
use crate::security::capability::{shared_secret_capability_id, Capability};
use crate::security::{
    block_crypt, key_from_passcode, unpad, ManagedKey, ManagedKeyPair, ROOM_MESSAGE_KEY_TYPE,
};
use crate::{Error, Result};

/// What a session has proven about itself.
#[derive(Debug, Clone, Default)]
pub struct Authorization {
    /// The account the session is logged into, if any.
    pub account: Option<Account>,
    /// The decrypted password-derived key for the account.
    pub client_key: Option<ManagedKey>,
    /// The room's manager key pair, when unlocked by a manager grant.
    pub manager_key_pair: Option<ManagedKeyPair>,
    /// Message keys unlocked by this session, by key id.
    pub message_keys: HashMap<String, ManagedKey>,
}

impl Authorization {
    pub fn add_message_key(&mut self, key_id: &str, key: ManagedKey) {
        self.message_keys.insert(key_id.to_string(), key);
    }
}

/// The outcome of an authentication attempt.
#[derive(Debug, Clone, Default)]
pub struct AuthorizationResult {
    pub authorization: Authorization,
    pub failure_reason: Option<String>,
}

impl AuthorizationResult {
    fn failure(reason: &str) -> Self {
        Self {
            authorization: Authorization::default(),
            failure_reason: Some(reason.to_string()),
        }
    }
}

/// Authenticate an `auth` command against a room.
pub async fn authenticate(
    backend: &dyn Backend,
    room_name: &str,
    cmd: &Auth,
) -> Result<AuthorizationResult> {
    match cmd.r#type {
        AuthOption::Passcode => {
            let passcode = cmd.passcode.as_deref().unwrap_or_default();
            authenticate_with_passcode(backend, room_name, passcode).await
        }
    }
}

/// Authenticate with a passcode.
///
/// Derives the holder key from the passcode and the room's key nonce,
/// computes the capability id both sides agree on, and unlocks the room's
/// message key from the stored grant.
async fn authenticate_with_passcode(
    backend: &dyn Backend,
    room_name: &str,
    passcode: &str,
) -> Result<AuthorizationResult> {
    let Some(mkey) = backend.room_message_key(room_name).await? else {
        return Ok(AuthorizationResult::default());
    };

    let holder_key =
        key_from_passcode(passcode.as_bytes(), &mkey.nonce, ROOM_MESSAGE_KEY_TYPE)?;

    let capability_id = shared_secret_capability_id(&holder_key, &mkey.nonce)?;

    let Some(capability) = backend.get_capability(room_name, &capability_id).await? else {
        return Ok(AuthorizationResult::failure("passcode incorrect"));
    };

    let room_key = decrypt_room_key(&holder_key, &capability)?;

    let mut authorization = Authorization::default();
    authorization.add_message_key(&mkey.key_id.to_string(), room_key);
    Ok(AuthorizationResult {
        authorization,
        failure_reason: None,
    })
}

/// Authenticate a personal identity and password against an account.
pub async fn authenticate_account(
    backend: &dyn Backend,
    namespace: &str,
    id: &str,
    password: &str,
) -> Result<AuthorizationResult> {
    let account = match backend.resolve_account(namespace, id).await {
        Ok(account) => account,
        Err(Error::AccountNotFound) => {
            return Ok(AuthorizationResult::failure("account not found"))
        }
        Err(err) => return Err(err),
    };

    let client_key = account.key_from_password(password)?;
    match account.unlock(&client_key) {
        Ok(_) => {}
        Err(Error::AccessDenied) => return Ok(AuthorizationResult::failure("access denied")),
        Err(err) => return Err(err),
    }

    Ok(AuthorizationResult {
        authorization: Authorization {
            account: Some(account),
            client_key: Some(client_key),
            ..Authorization::default()
        },
        failure_reason: None,
    })
}

/// Open the room message key held in a shared-secret capability.
pub fn decrypt_room_key(client_key: &ManagedKey, capability: &Capability) -> Result<ManagedKey> {
    if client_key.encrypted() {
        return Err(Error::KeyMustBeDecrypted);
    }

    let iv = URL_SAFE
        .decode(&capability.id)
        .map_err(|e| Error::Crypto(format!("capability id: {e}")))?;

    let mut payload = capability.encrypted_payload.clone();
    block_crypt(&iv, &client_key.plaintext, &mut payload)?;
    let payload = unpad(&payload)?;

    let key_bytes: Vec<u8> =
        serde_json::from_slice(payload).map_err(|_| Error::AccessDenied)?;
    Ok(ManagedKey::from_plaintext(ROOM_MESSAGE_KEY_TYPE, key_bytes))
}
