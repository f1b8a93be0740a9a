//! Private message channels.
//!
//! A PM is a key shared between exactly two parties, materialized as a
//! room named `pm:<id>`. The key is wrapped three ways: under the KMS (so
//! the service can admit the receiver later), under the initiator's client
//! key, and — after first access — under the receiver's client key.

use crate::api::UserId;
use crate::security::kms::Kms;
use crate::security::{poly1305_mac, poly1305_verify, ManagedKey, ROOM_MESSAGE_KEY_TYPE};
use crate::session::Client;
use crate::snowflake::Snowflake;
use crate::{Error, Result};

/// A private message channel between two users.
#[derive(Debug, Clone)]
pub struct Pm {
    pub id: Snowflake,
    pub initiator: Snowflake,
    pub receiver: UserId,
    pub receiver_mac: Vec<u8>,
    pub iv: Vec<u8>,
    pub encrypted_system_key: ManagedKey,
    pub encrypted_initiator_key: ManagedKey,
    pub encrypted_receiver_key: Option<ManagedKey>,
}

impl Pm {
    /// The name of the room this PM materializes as.
    pub fn room_name(&self) -> String {
        format!("pm:{}", self.id)
    }

    /// The id under which messages in this PM are encrypted.
    pub fn key_id(&self) -> String {
        format!("pm:{}", self.id)
    }
}

/// Construct a new PM between the calling client and a recipient.
///
/// The caller must be logged into an account; the recipient may be an
/// agent or an account.
pub fn initiate_pm(
    kms: &dyn Kms,
    id: Snowflake,
    client: &Client,
    recipient: &UserId,
) -> Result<Pm> {
    let account = client.authorization.account.as_ref().ok_or(Error::AccessDenied)?;
    let client_key = client
        .authorization
        .client_key
        .as_ref()
        .ok_or(Error::AccessDenied)?;

    let encrypted_system_key =
        kms.generate_encrypted_key(ROOM_MESSAGE_KEY_TYPE, "pm", &id.to_string())?;
    let mut pm_key = encrypted_system_key.clone();
    kms.decrypt_key(&mut pm_key)?;

    let iv = kms.generate_nonce(ROOM_MESSAGE_KEY_TYPE.block_size())?;

    let mut encrypted_initiator_key =
        ManagedKey::from_plaintext(ROOM_MESSAGE_KEY_TYPE, pm_key.plaintext.clone());
    encrypted_initiator_key.iv = iv.clone();
    encrypted_initiator_key.encrypt(client_key)?;

    let receiver_mac = poly1305_mac(&pm_key.plaintext, recipient.0.as_bytes());

    Ok(Pm {
        id,
        initiator: account.id,
        receiver: recipient.clone(),
        receiver_mac: receiver_mac.to_vec(),
        iv,
        encrypted_system_key,
        encrypted_initiator_key,
        encrypted_receiver_key: None,
    })
}

impl Pm {
    /// Unwrap the calling client's copy of the PM key.
    ///
    /// On the receiver's first access, their key copy is written; the
    /// returned flag indicates the PM row was modified and must be
    /// persisted.
    pub fn access(&mut self, kms: &dyn Kms, client: &Client) -> Result<(ManagedKey, bool)> {
        let client_key = client
            .authorization
            .client_key
            .as_ref()
            .ok_or(Error::AccessDenied)?;

        let is_initiator = client
            .authorization
            .account
            .as_ref()
            .is_some_and(|account| account.id == self.initiator);
        if is_initiator {
            let mut key = self.encrypted_initiator_key.clone();
            key.decrypt(client_key)?;
            return Ok((key, false));
        }

        if client.user_id() != self.receiver {
            return Err(Error::AccessDenied);
        }

        if let Some(receiver_key) = &self.encrypted_receiver_key {
            let mut key = receiver_key.clone();
            key.decrypt(client_key)?;
            return Ok((key, false));
        }

        // First access by the receiver: recover the key via the KMS and
        // leave behind a copy only they can open.
        let mut pm_key = self.encrypted_system_key.clone();
        kms.decrypt_key(&mut pm_key)?;

        if !poly1305_verify(&self.receiver_mac, &pm_key.plaintext, self.receiver.0.as_bytes()) {
            return Err(Error::AccessDenied);
        }

        let mut receiver_key =
            ManagedKey::from_plaintext(ROOM_MESSAGE_KEY_TYPE, pm_key.plaintext.clone());
        receiver_key.iv = self.iv.clone();
        receiver_key.encrypt(client_key)?;
        self.encrypted_receiver_key = Some(receiver_key);

        let key = ManagedKey::from_plaintext(ROOM_MESSAGE_KEY_TYPE, pm_key.plaintext);
        Ok((key, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{new_account_security, Account};
    use crate::auth::Authorization;
    use crate::backend::Agent;
    use crate::security::kms::LocalKms;
    use crate::security::CLIENT_KEY_TYPE;

    fn account_client(kms: &LocalKms, id: u64) -> Client {
        let (security, client_key) = new_account_security(kms, "hunter2").unwrap();
        let account = Account {
            id: Snowflake(id),
            security,
            staff_capability: None,
            personal_identities: Vec::new(),
        };
        Client {
            agent: Agent::new(&format!("agent{id}")),
            agent_key: ManagedKey::from_plaintext(CLIENT_KEY_TYPE, vec![id as u8; 16]),
            ip: None,
            authorization: Authorization {
                account: Some(account),
                client_key: Some(client_key),
                ..Authorization::default()
            },
        }
    }

    fn agent_client(agent_id: &str, key_byte: u8) -> Client {
        let agent_key = ManagedKey::from_plaintext(CLIENT_KEY_TYPE, vec![key_byte; 16]);
        Client {
            agent: Agent::new(agent_id),
            agent_key: agent_key.clone(),
            ip: None,
            authorization: Authorization {
                client_key: Some(agent_key),
                ..Authorization::default()
            },
        }
    }

    #[test]
    fn both_parties_recover_the_same_key() {
        let kms = LocalKms::generate();
        let alice = account_client(&kms, 1);
        let bob = agent_client("bob", 9);

        let mut pm = initiate_pm(&kms, Snowflake(77), &alice, &bob.user_id()).unwrap();
        assert_eq!(pm.room_name(), format!("pm:{}", Snowflake(77)));
        assert!(pm.encrypted_receiver_key.is_none());

        let (alice_key, modified) = pm.access(&kms, &alice).unwrap();
        assert!(!modified);

        // The receiver's first access writes their key copy.
        let (bob_key, modified) = pm.access(&kms, &bob).unwrap();
        assert!(modified);
        assert!(pm.encrypted_receiver_key.is_some());
        assert_eq!(alice_key.plaintext, bob_key.plaintext);

        // Later accesses use the stored copy.
        let (bob_key, modified) = pm.access(&kms, &bob).unwrap();
        assert!(!modified);
        assert_eq!(alice_key.plaintext, bob_key.plaintext);
    }

    #[test]
    fn outsiders_are_denied() {
        let kms = LocalKms::generate();
        let alice = account_client(&kms, 1);
        let bob = agent_client("bob", 9);
        let carol = agent_client("carol", 13);

        let mut pm = initiate_pm(&kms, Snowflake(78), &alice, &bob.user_id()).unwrap();
        assert!(matches!(
            pm.access(&kms, &carol),
            Err(Error::AccessDenied)
        ));
    }

    #[test]
    fn initiation_requires_an_account() {
        let kms = LocalKms::generate();
        let bob = agent_client("bob", 9);
        let carol = agent_client("carol", 13);
        assert!(matches!(
            initiate_pm(&kms, Snowflake(79), &bob, &carol.user_id()),
            Err(Error::AccessDenied)
        ));
    }
}
