//! The storage contract backing rooms, messages, accounts, and keys.
//!
//! Two implementations share this contract: [`memory::TestBackend`], a
//! mutex-protected in-memory store, and [`sqlite::SqliteBackend`], the
//! relational store. The room engine and session runtime only ever see
//! `Arc<dyn Backend>`.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::account::{Account, AccountSecurity};
use crate::api::{EditMessage, Message, MessageId, SessionId, Time, UserId};
use crate::pm::Pm;
use crate::presence::{Presence, PresenceRow};
use crate::security::capability::{
    decrypt_public_key_payload, grant_public_key, Capability,
};
use crate::security::kms::{Kms, KmsCredential};
use crate::security::{
    poly1305_mac, poly1305_verify, KeyPairType, KeyType, ManagedKey, ManagedKeyPair,
    ROOM_MESSAGE_KEY_TYPE,
};
use crate::snowflake::Snowflake;
use crate::{Error, Result};

pub use memory::TestBackend;
pub use sqlite::SqliteBackend;

/// A `(server_id, server_era)` pair identifying one run of one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub server_id: String,
    pub server_era: String,
}

/// A room as persisted.
#[derive(Debug, Clone)]
pub struct RoomRecord {
    pub name: String,
    pub founded_by: Option<String>,
    pub retention_days: u32,
    pub min_agent_age_secs: i64,
    /// Nonce for manager grant capability ids.
    pub nonce: Vec<u8>,
    /// MAC verifying a presented room key-encrypting key.
    pub mac: Vec<u8>,
    /// IV under which the room key pair is encrypted.
    pub iv: Vec<u8>,
    /// IV of the KMS envelope holding the room KEK.
    pub management_key_iv: Vec<u8>,
    /// The room KEK, wrapped by the KMS under the room name context.
    pub encrypted_management_key: Vec<u8>,
    pub encrypted_private_key: Vec<u8>,
    pub public_key: Vec<u8>,
}

impl RoomRecord {
    /// The room KEK in its KMS envelope.
    pub fn management_key(&self) -> ManagedKey {
        ManagedKey::from_ciphertext(
            KeyType::Aes128,
            self.management_key_iv.clone(),
            self.encrypted_management_key.clone(),
            "room",
            &self.name,
        )
    }

    /// The room key pair used to seal manager grants, private half
    /// encrypted.
    pub fn manager_key_pair(&self) -> ManagedKeyPair {
        ManagedKeyPair {
            kind: KeyPairType::X25519,
            iv: self.iv.clone(),
            private_key: Vec::new(),
            encrypted_private_key: self.encrypted_private_key.clone(),
            public_key: self.public_key.clone(),
        }
    }

    /// Decrypt the room key pair with the presented KEK.
    ///
    /// A wrong key fails the MAC check before any decryption is attempted.
    pub fn unlock(&self, owner_key: &ManagedKey) -> Result<ManagedKeyPair> {
        if owner_key.encrypted() {
            return Err(Error::KeyMustBeDecrypted);
        }
        if !poly1305_verify(&self.mac, &owner_key.plaintext, &self.iv) {
            return Err(Error::AccessDenied);
        }
        let mut key_pair = self.manager_key_pair();
        key_pair.decrypt(owner_key)?;
        Ok(key_pair)
    }
}

/// Create the security block for a new room.
///
/// Returns the partially-filled record (key material only) and the
/// decrypted KEK, which the caller uses to seal grants for the founding
/// managers.
pub fn new_room_security(kms: &dyn Kms, name: &str) -> Result<(RoomRecord, ManagedKey)> {
    let key_type = KeyType::Aes128;
    let kp_type = KeyPairType::X25519;

    // One KMS request covers all the randomness needed: key pair IV,
    // private key seed, and grant nonce.
    let random_data = kms.generate_nonce(
        key_type.block_size() + kp_type.private_key_size() + kp_type.nonce_size(),
    )?;
    let (iv, rest) = random_data.split_at(key_type.block_size());
    let (seed, grant_nonce) = rest.split_at(kp_type.private_key_size());

    let management_key = kms.generate_encrypted_key(key_type, "room", name)?;
    let mut kek = management_key.clone();
    kms.decrypt_key(&mut kek)?;

    let mut key_pair = ManagedKeyPair::generate(kp_type, seed)?;
    key_pair.iv = iv.to_vec();
    key_pair.encrypt(&kek)?;

    let mac = poly1305_mac(&kek.plaintext, iv);

    let record = RoomRecord {
        name: name.to_string(),
        founded_by: None,
        retention_days: 0,
        min_agent_age_secs: 0,
        nonce: grant_nonce.to_vec(),
        mac: mac.to_vec(),
        iv: iv.to_vec(),
        management_key_iv: management_key.iv.clone(),
        encrypted_management_key: management_key.ciphertext.clone(),
        encrypted_private_key: key_pair.encrypted_private_key.clone(),
        public_key: key_pair.public_key.clone(),
    };
    Ok((record, kek))
}

/// Seal a manager grant for the holder account.
///
/// The payload is the room KEK; holding it proves management authority.
pub fn seal_manager_grant(
    room: &RoomRecord,
    room_key_pair: &ManagedKeyPair,
    kek: &ManagedKey,
    holder: &Account,
) -> Result<Capability> {
    grant_public_key(
        room_key_pair,
        &holder.key_pair().public_key,
        &room.nonce,
        &holder.id.to_string(),
        &kek.plaintext,
    )
}

/// Open a manager grant, returning the room KEK and the unlocked room key
/// pair. This is the authority proof for manager-only operations.
pub fn open_manager_grant(
    room: &RoomRecord,
    holder_key_pair: &ManagedKeyPair,
    capability: &Capability,
) -> Result<(ManagedKey, ManagedKeyPair)> {
    let payload = decrypt_public_key_payload(holder_key_pair, &room.public_key, capability)?;
    let kek_bytes: Vec<u8> = serde_json::from_slice(&payload).map_err(|_| Error::AccessDenied)?;
    let kek = ManagedKey::from_plaintext(KeyType::Aes128, kek_bytes);
    let key_pair = room.unlock(&kek)?;
    Ok((kek, key_pair))
}

/// An append-only record of one edit applied to a message.
///
/// Rows are written inside the edit transaction and never mutated.
#[derive(Debug, Clone)]
pub struct MessageEditLog {
    pub edit_id: Snowflake,
    pub room: String,
    pub message_id: MessageId,
    pub previous_edit_id: Option<Snowflake>,
    pub previous_content: String,
    pub previous_parent: Option<MessageId>,
    pub editor_id: Option<UserId>,
    pub edited_at: Time,
}

/// A room message key row joined with its activation.
#[derive(Debug, Clone)]
pub struct RoomMessageKey {
    pub key_id: Snowflake,
    pub nonce: Vec<u8>,
    pub activated: Time,
    pub expired: Option<Time>,
    /// The symmetric key, wrapped by the KMS under the room name context.
    pub key: ManagedKey,
}

impl RoomMessageKey {
    /// Mint a fresh message key for a room. The caller persists it with
    /// [`Backend::activate_room_message_key`].
    pub fn generate(kms: &dyn Kms, room: &str, key_id: Snowflake) -> Result<Self> {
        let nonce = kms.generate_nonce(ROOM_MESSAGE_KEY_TYPE.key_size())?;
        let key = kms.generate_encrypted_key(ROOM_MESSAGE_KEY_TYPE, "room", room)?;
        Ok(Self {
            key_id,
            nonce,
            activated: Time::now(),
            expired: None,
            key,
        })
    }
}

/// An anonymous client identity, persisted across connections through the
/// agent cookie.
#[derive(Debug, Clone)]
pub struct Agent {
    pub id: String,
    pub account_id: Option<Snowflake>,
    pub iv: Vec<u8>,
    /// The account client key, wrapped under the cookie-held agent key.
    pub encrypted_client_key: Vec<u8>,
    pub created: Time,
}

impl Agent {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            account_id: None,
            iv: Vec::new(),
            encrypted_client_key: Vec::new(),
            created: Time::now(),
        }
    }

    pub fn age_secs(&self) -> i64 {
        Time::now().0 - self.created.0
    }
}

/// A single transactional store.
///
/// All read paths that return messages filter on the room's retention
/// window. The operations named in the room engine's contract (edit,
/// ban upsert, key activation, manager revocation, registration) are
/// single transactions in the relational implementation.
#[async_trait]
pub trait Backend: Send + Sync {
    /// The implementation version string, surfaced in snapshots.
    fn version(&self) -> String;

    // Rooms

    /// Create a new room, optionally with a message key already activated
    /// and manager grants for the given accounts.
    async fn create_room(
        &self,
        kms: &dyn Kms,
        private: bool,
        name: &str,
        managers: &[Account],
    ) -> Result<RoomRecord>;

    /// Fetch an existing room by name.
    async fn get_room(&self, name: &str) -> Result<RoomRecord>;

    /// Set how many days of history the room retains; 0 means forever.
    async fn set_room_retention(&self, name: &str, days: u32) -> Result<()>;

    // Messages

    async fn save_message(&self, room: &str, msg: &Message) -> Result<()>;

    /// A single message, honoring retention.
    async fn get_message(&self, room: &str, id: MessageId) -> Result<Message>;

    /// The latest messages before `before`, newest last, honoring
    /// retention and skipping deleted messages.
    async fn latest(&self, room: &str, n: usize, before: Option<MessageId>)
        -> Result<Vec<Message>>;

    /// Whether the message can be replied to.
    async fn is_valid_parent(&self, room: &str, id: MessageId) -> Result<bool>;

    /// Apply an edit to a message in one transaction, appending to the
    /// edit log. Fails with [`Error::EditInconsistent`] if the command's
    /// `previous_edit_id` does not match the stored chain.
    async fn edit_message(
        &self,
        room: &str,
        edit_id: Snowflake,
        editor: Option<UserId>,
        cmd: &EditMessage,
    ) -> Result<Message>;

    // Presence

    async fn store_presence(&self, row: &PresenceRow) -> Result<()>;
    async fn update_presence(&self, row: &PresenceRow) -> Result<()>;
    async fn remove_presence(&self, room: &str, session_id: &SessionId) -> Result<()>;

    /// Presence facts for a room, restricted to rows owned by live peers.
    async fn room_presence(&self, room: &str, live: &[PeerIdentity]) -> Result<Vec<Presence>>;

    /// Delete this server's presence rows from prior eras. Called once at
    /// startup.
    async fn purge_other_eras(&self, server_id: &str, current_era: &str) -> Result<()>;

    /// Rooms with presence rows owned by the given peer.
    async fn rooms_touched_by(&self, server_id: &str, server_era: &str) -> Result<Vec<String>>;

    // Bans

    /// Upsert a ban on `(room, agent_id)`; `room = None` bans globally. A
    /// `None` expiry is permanent.
    async fn ban_agent(&self, room: Option<&str>, agent_id: &str, until: Option<Time>)
        -> Result<()>;
    async fn unban_agent(&self, room: Option<&str>, agent_id: &str) -> Result<()>;
    async fn ban_ip(&self, room: Option<&str>, ip: &str, until: Option<Time>) -> Result<()>;
    async fn unban_ip(&self, room: Option<&str>, ip: &str) -> Result<()>;
    async fn agent_banned(&self, room: &str, agent_id: &str) -> Result<bool>;
    async fn ip_banned(&self, room: &str, ip: &str) -> Result<bool>;

    // Message keys and capabilities

    /// Expire the room's current key activation and activate the given
    /// key, in one transaction.
    async fn activate_room_message_key(&self, room: &str, key: &RoomMessageKey) -> Result<()>;

    /// The room's current message key, or `None` if the room is unlocked.
    async fn room_message_key(&self, room: &str) -> Result<Option<RoomMessageKey>>;

    async fn save_capability(&self, room: &str, capability: &Capability) -> Result<()>;
    async fn get_capability(&self, room: &str, id: &str) -> Result<Option<Capability>>;

    // Managers

    async fn save_manager_capability(
        &self,
        room: &str,
        account_id: Snowflake,
        capability: &Capability,
    ) -> Result<()>;

    /// The unrevoked manager grant held by the account.
    async fn manager_capability(&self, room: &str, account_id: Snowflake) -> Result<Capability>;

    /// Accounts holding unrevoked manager grants.
    async fn managers(&self, room: &str) -> Result<Vec<Account>>;

    /// Verify the actor's authority and revoke the former manager's grant,
    /// in one transaction.
    async fn remove_manager(
        &self,
        room: &RoomRecord,
        actor: &Account,
        actor_key: &ManagedKey,
        former_manager: Snowflake,
    ) -> Result<()>;

    // Accounts

    async fn get_account(&self, id: Snowflake) -> Result<Account>;

    /// Create a new, unverified account in one transaction, returning it
    /// along with its decrypted client key. The calling agent is
    /// associated with the account.
    async fn register_account(
        &self,
        kms: &dyn Kms,
        namespace: &str,
        id: &str,
        password: &str,
        agent_id: &str,
        agent_key: &ManagedKey,
    ) -> Result<(Account, ManagedKey)>;

    /// Any account registered under the given personal identity.
    async fn resolve_account(&self, namespace: &str, id: &str) -> Result<Account>;

    /// Attach a staff KMS capability to the account.
    async fn grant_staff(
        &self,
        kms: &dyn Kms,
        account_id: Snowflake,
        credential: &KmsCredential,
    ) -> Result<()>;

    async fn revoke_staff(&self, account_id: Snowflake) -> Result<()>;

    /// Mark the personal identity verified.
    async fn verify_personal_identity(&self, namespace: &str, id: &str) -> Result<()>;

    /// Replace the account's security block (password reset).
    async fn set_account_security(
        &self,
        account_id: Snowflake,
        security: &AccountSecurity,
    ) -> Result<()>;

    // Agents

    async fn register_agent(&self, agent: &Agent) -> Result<()>;
    async fn get_agent(&self, id: &str) -> Result<Option<Agent>>;
    async fn set_agent_account(&self, agent_id: &str, account_id: Option<Snowflake>)
        -> Result<()>;

    /// Store the account client key, wrapped under the cookie-held agent
    /// key.
    async fn set_agent_client_key(
        &self,
        agent_id: &str,
        agent_key: &ManagedKey,
        client_key: &ManagedKey,
    ) -> Result<()>;

    /// Recover the stored client key with the cookie-held agent key.
    async fn agent_client_key(
        &self,
        agent_id: &str,
        agent_key: &ManagedKey,
    ) -> Result<Option<ManagedKey>>;

    // PMs

    async fn save_pm(&self, pm: &Pm) -> Result<()>;
    async fn get_pm(&self, id: Snowflake) -> Result<Pm>;

    /// Persist the receiver's key copy after their first access.
    async fn update_pm_receiver_key(&self, pm: &Pm) -> Result<()>;
}
