//! The relational implementation of the storage contract.

use std::sync::Arc;

use async_trait::async_trait;
use log::warn;
use parking_lot::Mutex;
use rusqlite::types::{FromSql, FromSqlError, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql, Transaction};

use super::{
    new_room_security, open_manager_grant, seal_manager_grant, Agent, Backend, PeerIdentity,
    RoomMessageKey, RoomRecord,
};
use crate::account::{new_account_security, Account, AccountSecurity, PersonalIdentity};
use crate::api::{EditMessage, Message, MessageId, SessionId, SessionView, Time, UserId};
use crate::pm::Pm;
use crate::presence::{Presence, PresenceRow};
use crate::security::capability::{grant_shared_secret, Capability};
use crate::security::kms::{Kms, KmsCredential};
use crate::security::{
    block_crypt, random_bytes, KeyPairType, ManagedKey, ManagedKeyPair, BLOCK_SIZE,
    CLIENT_KEY_TYPE, ROOM_MESSAGE_KEY_TYPE,
};
use crate::snowflake::{IdGenerator, Snowflake};
use crate::{Error, Result};

/// Wrapper for [`Snowflake`] that implements useful rusqlite traits.
struct WSnowflake(Snowflake);

impl ToSql for WSnowflake {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        self.0 .0.to_sql()
    }
}

impl FromSql for WSnowflake {
    fn column_result(value: ValueRef<'_>) -> std::result::Result<Self, FromSqlError> {
        u64::column_result(value).map(|v| Self(Snowflake(v)))
    }
}

/// Wrapper for [`Time`] that implements useful rusqlite traits.
struct WTime(Time);

impl ToSql for WTime {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        self.0 .0.to_sql()
    }
}

impl FromSql for WTime {
    fn column_result(value: ValueRef<'_>) -> std::result::Result<Self, FromSqlError> {
        i64::column_result(value).map(|v| Self(Time(v)))
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS room (
    name TEXT PRIMARY KEY,
    founded_by TEXT,
    retention_days INTEGER NOT NULL DEFAULT 0,
    min_agent_age INTEGER NOT NULL DEFAULT 0,
    pk_nonce BLOB NOT NULL,
    pk_mac BLOB NOT NULL,
    pk_iv BLOB NOT NULL,
    management_key_iv BLOB NOT NULL,
    encrypted_management_key BLOB NOT NULL,
    encrypted_private_key BLOB NOT NULL,
    public_key BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS message (
    room TEXT NOT NULL,
    id INTEGER NOT NULL,
    previous_edit_id INTEGER,
    parent INTEGER,
    posted INTEGER NOT NULL,
    edited INTEGER,
    deleted INTEGER,
    session_id TEXT NOT NULL,
    sender_id TEXT NOT NULL,
    sender_name TEXT NOT NULL,
    sender_is_manager INTEGER NOT NULL DEFAULT 0,
    sender_is_staff INTEGER NOT NULL DEFAULT 0,
    server_id TEXT NOT NULL,
    server_era TEXT NOT NULL,
    content TEXT NOT NULL,
    encryption_key_id TEXT,
    PRIMARY KEY (room, id)
);
CREATE INDEX IF NOT EXISTS idx_message_room_posted ON message(room, posted);

CREATE TABLE IF NOT EXISTS message_edit_log (
    edit_id INTEGER PRIMARY KEY,
    room TEXT NOT NULL,
    message_id INTEGER NOT NULL,
    previous_edit_id INTEGER,
    previous_content TEXT NOT NULL,
    previous_parent INTEGER,
    editor_id TEXT,
    edited_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS master_key (
    id INTEGER PRIMARY KEY,
    encrypted_key BLOB NOT NULL,
    iv BLOB NOT NULL,
    nonce BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS room_master_key (
    room TEXT NOT NULL,
    key_id INTEGER NOT NULL,
    activated INTEGER NOT NULL,
    expired INTEGER,
    PRIMARY KEY (room, key_id)
);

CREATE TABLE IF NOT EXISTS capability (
    id TEXT PRIMARY KEY,
    room TEXT NOT NULL,
    nonce BLOB NOT NULL,
    public_data BLOB NOT NULL,
    encrypted_private_data BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS room_manager_capability (
    room TEXT NOT NULL,
    account_id INTEGER NOT NULL,
    capability_id TEXT NOT NULL,
    granted INTEGER NOT NULL,
    revoked INTEGER,
    PRIMARY KEY (room, account_id, capability_id)
);

CREATE TABLE IF NOT EXISTS account (
    id INTEGER PRIMARY KEY,
    nonce BLOB NOT NULL,
    mac BLOB NOT NULL,
    system_key_iv BLOB NOT NULL,
    encrypted_system_key BLOB NOT NULL,
    user_key_iv BLOB NOT NULL,
    encrypted_user_key BLOB NOT NULL,
    key_pair_iv BLOB NOT NULL,
    encrypted_private_key BLOB NOT NULL,
    public_key BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS staff_capability (
    account_id INTEGER PRIMARY KEY,
    id TEXT NOT NULL,
    nonce BLOB NOT NULL,
    public_data BLOB NOT NULL,
    encrypted_private_data BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS personal_identity (
    namespace TEXT NOT NULL,
    id TEXT NOT NULL,
    account_id INTEGER NOT NULL,
    verified INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (namespace, id)
);
CREATE INDEX IF NOT EXISTS idx_personal_identity_account
    ON personal_identity(account_id);

CREATE TABLE IF NOT EXISTS agent (
    id TEXT PRIMARY KEY,
    account_id INTEGER,
    iv BLOB,
    encrypted_client_key BLOB,
    created INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS banned_agent (
    room TEXT NOT NULL DEFAULT '',
    agent_id TEXT NOT NULL,
    created INTEGER NOT NULL,
    expires INTEGER,
    PRIMARY KEY (room, agent_id)
);

CREATE TABLE IF NOT EXISTS banned_ip (
    room TEXT NOT NULL DEFAULT '',
    ip TEXT NOT NULL,
    created INTEGER NOT NULL,
    expires INTEGER,
    PRIMARY KEY (room, ip)
);

CREATE TABLE IF NOT EXISTS presence (
    room TEXT NOT NULL,
    server_id TEXT NOT NULL,
    server_era TEXT NOT NULL,
    session_id TEXT NOT NULL,
    updated INTEGER NOT NULL,
    fact TEXT NOT NULL,
    PRIMARY KEY (room, session_id)
);
CREATE INDEX IF NOT EXISTS idx_presence_server ON presence(server_id, server_era);

CREATE TABLE IF NOT EXISTS pm (
    id INTEGER PRIMARY KEY,
    initiator INTEGER NOT NULL,
    receiver TEXT NOT NULL,
    receiver_mac BLOB NOT NULL,
    iv BLOB NOT NULL,
    encrypted_system_key BLOB NOT NULL,
    encrypted_initiator_key BLOB NOT NULL,
    encrypted_receiver_key BLOB
);
";

/// The relational backend, one connection behind a mutex.
pub struct SqliteBackend {
    version: String,
    ids: Arc<IdGenerator>,
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    pub fn open(path: &str, version: &str, ids: Arc<IdGenerator>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            version: version.to_string(),
            ids,
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory(version: &str, ids: Arc<IdGenerator>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            version: version.to_string(),
            ids,
            conn: Mutex::new(conn),
        })
    }
}

const MESSAGE_COLUMNS: &str = "room, id, previous_edit_id, parent, posted, edited, deleted, 
    session_id, sender_id, sender_name, sender_is_manager, sender_is_staff, 
    server_id, server_era, content, encryption_key_id";

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: MessageId(row.get::<_, WSnowflake>("id")?.0),
        parent: row
            .get::<_, Option<WSnowflake>>("parent")?
            .map(|s| MessageId(s.0)),
        previous_edit_id: row
            .get::<_, Option<WSnowflake>>("previous_edit_id")?
            .map(|s| s.0),
        time: row.get::<_, WTime>("posted")?.0,
        sender: SessionView {
            id: UserId(row.get("sender_id")?),
            name: row.get("sender_name")?,
            server_id: row.get("server_id")?,
            server_era: row.get("server_era")?,
            session_id: SessionId(row.get("session_id")?),
            is_staff: row.get("sender_is_staff")?,
            is_manager: row.get("sender_is_manager")?,
        },
        content: row.get("content")?,
        encryption_key_id: row.get("encryption_key_id")?,
        edited: row.get::<_, Option<WTime>>("edited")?.map(|t| t.0),
        deleted: row.get::<_, Option<WTime>>("deleted")?.map(|t| t.0),
    })
}

fn room_from_row(row: &Row<'_>) -> rusqlite::Result<RoomRecord> {
    Ok(RoomRecord {
        name: row.get("name")?,
        founded_by: row.get("founded_by")?,
        retention_days: row.get("retention_days")?,
        min_agent_age_secs: row.get("min_agent_age")?,
        nonce: row.get("pk_nonce")?,
        mac: row.get("pk_mac")?,
        iv: row.get("pk_iv")?,
        management_key_iv: row.get("management_key_iv")?,
        encrypted_management_key: row.get("encrypted_management_key")?,
        encrypted_private_key: row.get("encrypted_private_key")?,
        public_key: row.get("public_key")?,
    })
}

fn get_room_tx(conn: &Connection, name: &str) -> Result<RoomRecord> {
    conn.query_row("SELECT * FROM room WHERE name = ?1", params![name], |row| {
        room_from_row(row)
    })
    .optional()?
    .ok_or(Error::RoomNotFound)
}

fn retention_threshold(record: &RoomRecord) -> i64 {
    if record.retention_days == 0 {
        return 0;
    }
    Time::now().0 - i64::from(record.retention_days) * 24 * 3600
}

fn capability_from_row(row: &Row<'_>) -> rusqlite::Result<Capability> {
    Ok(Capability {
        id: row.get("id")?,
        nonce: row.get("nonce")?,
        public_payload: row.get("public_data")?,
        encrypted_payload: row.get("encrypted_private_data")?,
    })
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    let id = row.get::<_, WSnowflake>("id")?.0;
    let nonce: Vec<u8> = row.get("nonce")?;
    let nonce_base64 = {
        use base64::engine::general_purpose::URL_SAFE;
        use base64::Engine as _;
        URL_SAFE.encode(&nonce)
    };
    Ok(Account {
        id,
        security: AccountSecurity {
            mac: row.get("mac")?,
            system_key: ManagedKey::from_ciphertext(
                CLIENT_KEY_TYPE,
                row.get("system_key_iv")?,
                row.get("encrypted_system_key")?,
                "nonce",
                &nonce_base64,
            ),
            user_key: ManagedKey::from_ciphertext(
                CLIENT_KEY_TYPE,
                row.get("user_key_iv")?,
                row.get("encrypted_user_key")?,
                "",
                "",
            ),
            key_pair: ManagedKeyPair {
                kind: KeyPairType::X25519,
                iv: row.get("key_pair_iv")?,
                private_key: Vec::new(),
                encrypted_private_key: row.get("encrypted_private_key")?,
                public_key: row.get("public_key")?,
            },
            nonce,
        },
        staff_capability: None,
        personal_identities: Vec::new(),
    })
}

fn load_account(conn: &Connection, id: Snowflake) -> Result<Account> {
    let mut account = conn
        .query_row(
            "SELECT * FROM account WHERE id = ?1",
            params![WSnowflake(id)],
            account_from_row,
        )
        .optional()?
        .ok_or(Error::AccountNotFound)?;

    account.staff_capability = conn
        .query_row(
            "SELECT id, nonce, public_data, encrypted_private_data
             FROM staff_capability WHERE account_id = ?1",
            params![WSnowflake(id)],
            capability_from_row,
        )
        .optional()?;

    let mut stmt = conn.prepare(
        "SELECT namespace, id, verified FROM personal_identity WHERE account_id = ?1",
    )?;
    let identities = stmt.query_map(params![WSnowflake(id)], |row| {
        Ok(PersonalIdentity {
            namespace: row.get(0)?,
            id: row.get(1)?,
            verified: row.get(2)?,
        })
    })?;
    for identity in identities {
        account.personal_identities.push(identity?);
    }

    Ok(account)
}

fn insert_capability(conn: &Connection, room: &str, capability: &Capability) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO capability (id, room, nonce, public_data, encrypted_private_data)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            capability.id,
            room,
            capability.nonce,
            capability.public_payload,
            capability.encrypted_payload,
        ],
    )?;
    Ok(())
}

fn insert_manager_grant(
    conn: &Connection,
    room: &str,
    account_id: Snowflake,
    capability: &Capability,
) -> Result<()> {
    insert_capability(conn, room, capability)?;
    conn.execute(
        "INSERT OR IGNORE INTO room_manager_capability
         (room, account_id, capability_id, granted, revoked)
         VALUES (?1, ?2, ?3, ?4, NULL)",
        params![room, WSnowflake(account_id), capability.id, WTime(Time::now())],
    )?;
    Ok(())
}

fn manager_capability_tx(
    conn: &Connection,
    room: &str,
    account_id: Snowflake,
) -> Result<Capability> {
    conn.query_row(
        "SELECT c.id, c.nonce, c.public_data, c.encrypted_private_data
         FROM capability c, room_manager_capability rm
         WHERE rm.room = ?1 AND rm.account_id = ?2 AND c.id = rm.capability_id
         AND rm.revoked IS NULL",
        params![room, WSnowflake(account_id)],
        capability_from_row,
    )
    .optional()?
    .ok_or(Error::ManagerNotFound)
}

fn activate_message_key_tx(tx: &Transaction<'_>, room: &str, key: &RoomMessageKey) -> Result<()> {
    tx.execute(
        "UPDATE room_master_key SET expired = ?2 WHERE room = ?1 AND expired IS NULL",
        params![room, WTime(Time::now())],
    )?;
    tx.execute(
        "INSERT INTO master_key (id, encrypted_key, iv, nonce) VALUES (?1, ?2, ?3, ?4)",
        params![
            WSnowflake(key.key_id),
            key.key.ciphertext,
            key.key.iv,
            key.nonce
        ],
    )?;
    tx.execute(
        "INSERT INTO room_master_key (room, key_id, activated, expired)
         VALUES (?1, ?2, ?3, NULL)",
        params![room, WSnowflake(key.key_id), WTime(key.activated)],
    )?;
    Ok(())
}

#[async_trait]
impl Backend for SqliteBackend {
    fn version(&self) -> String {
        self.version.clone()
    }

    async fn create_room(
        &self,
        kms: &dyn Kms,
        private: bool,
        name: &str,
        managers: &[Account],
    ) -> Result<RoomRecord> {
        let (record, kek) = new_room_security(kms, name)?;
        let room_kp = record.unlock(&kek)?;

        let mut grants = Vec::with_capacity(managers.len());
        for manager in managers {
            grants.push((
                manager.id,
                seal_manager_grant(&record, &room_kp, &kek, manager)?,
            ));
        }
        let message_key = if private {
            Some(RoomMessageKey::generate(kms, name, self.ids.next())?)
        } else {
            None
        };

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        if let Some(existing) = tx
            .query_row("SELECT * FROM room WHERE name = ?1", params![name], |row| {
                room_from_row(row)
            })
            .optional()?
        {
            tx.commit()?;
            return Ok(existing);
        }

        tx.execute(
            "INSERT INTO room (name, founded_by, retention_days, min_agent_age,
             pk_nonce, pk_mac, pk_iv, management_key_iv, encrypted_management_key,
             encrypted_private_key, public_key)
             VALUES (?1, NULL, 0, 0, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.name,
                record.nonce,
                record.mac,
                record.iv,
                record.management_key_iv,
                record.encrypted_management_key,
                record.encrypted_private_key,
                record.public_key,
            ],
        )?;
        for (account_id, capability) in &grants {
            insert_manager_grant(&tx, name, *account_id, capability)?;
        }
        if let Some(key) = &message_key {
            activate_message_key_tx(&tx, name, key)?;
        }

        tx.commit()?;
        Ok(record)
    }

    async fn get_room(&self, name: &str) -> Result<RoomRecord> {
        get_room_tx(&self.conn.lock(), name)
    }

    async fn set_room_retention(&self, name: &str, days: u32) -> Result<()> {
        let n = self.conn.lock().execute(
            "UPDATE room SET retention_days = ?2 WHERE name = ?1",
            params![name, days],
        )?;
        if n == 0 {
            return Err(Error::RoomNotFound);
        }
        Ok(())
    }

    async fn save_message(&self, room: &str, msg: &Message) -> Result<()> {
        self.conn.lock().execute(
            &format!("INSERT INTO message ({MESSAGE_COLUMNS}) VALUES 
                (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"),
            params![
                room,
                WSnowflake(msg.id.0),
                msg.previous_edit_id.map(WSnowflake),
                msg.parent.map(|p| WSnowflake(p.0)),
                WTime(msg.time),
                msg.edited.map(WTime),
                msg.deleted.map(WTime),
                msg.sender.session_id.0,
                msg.sender.id.0,
                msg.sender.name,
                msg.sender.is_manager,
                msg.sender.is_staff,
                msg.sender.server_id,
                msg.sender.server_era,
                msg.content,
                msg.encryption_key_id,
            ],
        )?;
        Ok(())
    }

    async fn get_message(&self, room: &str, id: MessageId) -> Result<Message> {
        let conn = self.conn.lock();
        let record = get_room_tx(&conn, room)?;

        let msg = conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM message WHERE room = ?1 AND id = ?2"),
                params![room, WSnowflake(id.0)],
                message_from_row,
            )
            .optional()?
            .ok_or(Error::MessageNotFound)?;

        if record.retention_days > 0 && msg.time.0 < retention_threshold(&record) {
            return Err(Error::MessageNotFound);
        }
        Ok(msg)
    }

    async fn latest(
        &self,
        room: &str,
        n: usize,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>> {
        let conn = self.conn.lock();
        let record = get_room_tx(&conn, room)?;
        let threshold = retention_threshold(&record);

        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM message
             WHERE room = ?1 AND deleted IS NULL AND posted >= ?2
             AND (?3 IS NULL OR id < ?3)
             ORDER BY id DESC LIMIT ?4"
        ))?;
        let rows = stmt.query_map(
            params![
                room,
                threshold,
                before.map(|b| WSnowflake(b.0)),
                n as i64
            ],
            message_from_row,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        messages.reverse();
        Ok(messages)
    }

    async fn is_valid_parent(&self, room: &str, id: MessageId) -> Result<bool> {
        let conn = self.conn.lock();
        let record = get_room_tx(&conn, room)?;

        let posted: Option<WTime> = conn
            .query_row(
                "SELECT posted FROM message WHERE room = ?1 AND id = ?2",
                params![room, WSnowflake(id.0)],
                |row| row.get(0),
            )
            .optional()?;

        match posted {
            None => Ok(false),
            Some(_) if record.retention_days == 0 => Ok(true),
            Some(posted) => Ok(posted.0 .0 >= retention_threshold(&record)),
        }
    }

    async fn edit_message(
        &self,
        room: &str,
        edit_id: Snowflake,
        editor: Option<UserId>,
        cmd: &EditMessage,
    ) -> Result<Message> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let mut msg = tx
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM message WHERE room = ?1 AND id = ?2"),
                params![room, WSnowflake(cmd.id.0)],
                message_from_row,
            )
            .optional()?
            .ok_or(Error::MessageNotFound)?;

        let stored = msg.previous_edit_id.unwrap_or(Snowflake::ZERO);
        if stored != cmd.previous_edit_id {
            return Err(Error::EditInconsistent);
        }

        tx.execute(
            "INSERT INTO message_edit_log
             (edit_id, room, message_id, previous_edit_id, previous_content,
              previous_parent, editor_id, edited_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                WSnowflake(edit_id),
                room,
                WSnowflake(cmd.id.0),
                msg.previous_edit_id.map(WSnowflake),
                msg.content,
                msg.parent.map(|p| WSnowflake(p.0)),
                editor.as_ref().map(|e| e.0.clone()),
                WTime(Time::now()),
            ],
        )?;

        let now = Time::now();
        msg.edited = Some(now);
        msg.previous_edit_id = Some(edit_id);
        if !cmd.content.is_empty() {
            msg.content = cmd.content.clone();
        }
        if let Some(parent) = cmd.parent {
            msg.parent = Some(parent);
        }
        if cmd.delete != msg.deleted.is_some() {
            msg.deleted = if cmd.delete { Some(now) } else { None };
        }

        tx.execute(
            "UPDATE message SET edited = ?3, previous_edit_id = ?4, content = ?5,
             parent = ?6, deleted = ?7 WHERE room = ?1 AND id = ?2",
            params![
                room,
                WSnowflake(cmd.id.0),
                msg.edited.map(WTime),
                msg.previous_edit_id.map(WSnowflake),
                msg.content,
                msg.parent.map(|p| WSnowflake(p.0)),
                msg.deleted.map(WTime),
            ],
        )?;

        tx.commit()?;
        Ok(msg)
    }

    async fn store_presence(&self, row: &PresenceRow) -> Result<()> {
        let fact = serde_json::to_string(&row.fact).map_err(Error::MalformedPacket)?;
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO presence
             (room, server_id, server_era, session_id, updated, fact)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.room,
                row.server_id,
                row.server_era,
                row.session_id.0,
                WTime(row.updated),
                fact
            ],
        )?;
        Ok(())
    }

    async fn update_presence(&self, row: &PresenceRow) -> Result<()> {
        self.store_presence(row).await
    }

    async fn remove_presence(&self, room: &str, session_id: &SessionId) -> Result<()> {
        self.conn.lock().execute(
            "DELETE FROM presence WHERE room = ?1 AND session_id = ?2",
            params![room, session_id.0],
        )?;
        Ok(())
    }

    async fn room_presence(&self, room: &str, live: &[PeerIdentity]) -> Result<Vec<Presence>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT server_id, server_era, fact FROM presence WHERE room = ?1",
        )?;
        let rows = stmt.query_map(params![room], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut presences = Vec::new();
        for row in rows {
            let (server_id, server_era, fact) = row?;
            let is_live = live
                .iter()
                .any(|p| p.server_id == server_id && p.server_era == server_era);
            if !is_live {
                continue;
            }
            match serde_json::from_str::<Presence>(&fact) {
                Ok(presence) => presences.push(presence),
                Err(err) => warn!("presence fact unmarshal error: {err}"),
            }
        }
        Ok(presences)
    }

    async fn purge_other_eras(&self, server_id: &str, current_era: &str) -> Result<()> {
        self.conn.lock().execute(
            "DELETE FROM presence WHERE server_id = ?1 AND server_era != ?2",
            params![server_id, current_era],
        )?;
        Ok(())
    }

    async fn rooms_touched_by(&self, server_id: &str, server_era: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT room FROM presence WHERE server_id = ?1 AND server_era = ?2
             ORDER BY room",
        )?;
        let rows = stmt.query_map(params![server_id, server_era], |row| row.get(0))?;
        let mut rooms = Vec::new();
        for row in rows {
            rooms.push(row?);
        }
        Ok(rooms)
    }

    async fn ban_agent(
        &self,
        room: Option<&str>,
        agent_id: &str,
        until: Option<Time>,
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        // Insert-then-update loop to emulate an upsert; retried on
        // duplicate key until one of the two succeeds.
        loop {
            match tx.execute(
                "INSERT INTO banned_agent (room, agent_id, created, expires)
                 VALUES (?1, ?2, ?3, ?4)",
                params![room.unwrap_or(""), agent_id, WTime(Time::now()), until.map(WTime)],
            ) {
                Ok(_) => break,
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation => {}
                Err(err) => return Err(err.into()),
            }
            let n = tx.execute(
                "UPDATE banned_agent SET expires = ?3 WHERE room = ?1 AND agent_id = ?2",
                params![room.unwrap_or(""), agent_id, until.map(WTime)],
            )?;
            if n > 0 {
                break;
            }
        }

        tx.commit()?;
        Ok(())
    }

    async fn unban_agent(&self, room: Option<&str>, agent_id: &str) -> Result<()> {
        self.conn.lock().execute(
            "DELETE FROM banned_agent WHERE room = ?1 AND agent_id = ?2",
            params![room.unwrap_or(""), agent_id],
        )?;
        Ok(())
    }

    async fn ban_ip(&self, room: Option<&str>, ip: &str, until: Option<Time>) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO banned_ip (room, ip, created, expires) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (room, ip) DO UPDATE SET expires = excluded.expires",
            params![room.unwrap_or(""), ip, WTime(Time::now()), until.map(WTime)],
        )?;
        Ok(())
    }

    async fn unban_ip(&self, room: Option<&str>, ip: &str) -> Result<()> {
        self.conn.lock().execute(
            "DELETE FROM banned_ip WHERE room = ?1 AND ip = ?2",
            params![room.unwrap_or(""), ip],
        )?;
        Ok(())
    }

    async fn agent_banned(&self, room: &str, agent_id: &str) -> Result<bool> {
        let count: i64 = self.conn.lock().query_row(
            "SELECT COUNT(*) FROM banned_agent
             WHERE agent_id = ?1 AND room IN (?2, '')
             AND (expires IS NULL OR expires >= ?3)",
            params![agent_id, room, WTime(Time::now())],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    async fn ip_banned(&self, room: &str, ip: &str) -> Result<bool> {
        let count: i64 = self.conn.lock().query_row(
            "SELECT COUNT(*) FROM banned_ip
             WHERE ip = ?1 AND room IN (?2, '')
             AND (expires IS NULL OR expires >= ?3)",
            params![ip, room, WTime(Time::now())],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    async fn activate_room_message_key(&self, room: &str, key: &RoomMessageKey) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        activate_message_key_tx(&tx, room, key)?;
        tx.commit()?;
        Ok(())
    }

    async fn room_message_key(&self, room: &str) -> Result<Option<RoomMessageKey>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT mk.id, mk.encrypted_key, mk.iv, mk.nonce, r.activated, r.expired
             FROM master_key mk, room_master_key r
             WHERE r.room = ?1 AND mk.id = r.key_id AND r.expired IS NULL
             ORDER BY r.activated DESC LIMIT 1",
            params![room],
            |row| {
                Ok(RoomMessageKey {
                    key_id: row.get::<_, WSnowflake>(0)?.0,
                    nonce: row.get(3)?,
                    activated: row.get::<_, WTime>(4)?.0,
                    expired: row.get::<_, Option<WTime>>(5)?.map(|t| t.0),
                    key: ManagedKey::from_ciphertext(
                        ROOM_MESSAGE_KEY_TYPE,
                        row.get(2)?,
                        row.get(1)?,
                        "room",
                        room,
                    ),
                })
            },
        )
        .optional()
        .map_err(Error::from)
    }

    async fn save_capability(&self, room: &str, capability: &Capability) -> Result<()> {
        insert_capability(&self.conn.lock(), room, capability)
    }

    async fn get_capability(&self, room: &str, id: &str) -> Result<Option<Capability>> {
        self.conn
            .lock()
            .query_row(
                "SELECT id, nonce, public_data, encrypted_private_data
                 FROM capability WHERE id = ?1 AND room = ?2",
                params![id, room],
                capability_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    async fn save_manager_capability(
        &self,
        room: &str,
        account_id: Snowflake,
        capability: &Capability,
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        insert_manager_grant(&tx, room, account_id, capability)?;
        tx.commit()?;
        Ok(())
    }

    async fn manager_capability(&self, room: &str, account_id: Snowflake) -> Result<Capability> {
        manager_capability_tx(&self.conn.lock(), room, account_id)
    }

    async fn managers(&self, room: &str) -> Result<Vec<Account>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT account_id FROM room_manager_capability
             WHERE room = ?1 AND revoked IS NULL",
        )?;
        let rows = stmt.query_map(params![room], |row| row.get::<_, WSnowflake>(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?.0);
        }

        let mut accounts = Vec::with_capacity(ids.len());
        for id in ids {
            accounts.push(load_account(&conn, id)?);
        }
        Ok(accounts)
    }

    async fn remove_manager(
        &self,
        room: &RoomRecord,
        actor: &Account,
        actor_key: &ManagedKey,
        former_manager: Snowflake,
    ) -> Result<()> {
        let actor_kp = actor.unlock(actor_key)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let capability = manager_capability_tx(&tx, &room.name, actor.id)
            .map_err(|_| Error::AccessDenied)?;
        open_manager_grant(room, &actor_kp, &capability).map_err(|_| Error::AccessDenied)?;

        let n = tx.execute(
            "UPDATE room_manager_capability SET revoked = ?3
             WHERE room = ?1 AND account_id = ?2 AND revoked IS NULL",
            params![room.name, WSnowflake(former_manager), WTime(Time::now())],
        )?;
        if n == 0 {
            return Err(Error::ManagerNotFound);
        }

        tx.commit()?;
        Ok(())
    }

    async fn get_account(&self, id: Snowflake) -> Result<Account> {
        load_account(&self.conn.lock(), id)
    }

    async fn register_account(
        &self,
        kms: &dyn Kms,
        namespace: &str,
        id: &str,
        password: &str,
        agent_id: &str,
        agent_key: &ManagedKey,
    ) -> Result<(Account, ManagedKey)> {
        let exists: bool = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT COUNT(*) FROM personal_identity WHERE namespace = ?1 AND id = ?2",
                params![namespace, id],
                |row| row.get::<_, i64>(0),
            )? > 0
        };
        if exists {
            return Err(Error::PersonalIdentityInUse);
        }

        let (security, client_key) = new_account_security(kms, password)?;
        let account = Account {
            id: self.ids.next(),
            security,
            staff_capability: None,
            personal_identities: vec![PersonalIdentity {
                namespace: namespace.to_string(),
                id: id.to_string(),
                verified: false,
            }],
        };

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let taken: i64 = tx.query_row(
            "SELECT COUNT(*) FROM personal_identity WHERE namespace = ?1 AND id = ?2",
            params![namespace, id],
            |row| row.get(0),
        )?;
        if taken > 0 {
            return Err(Error::PersonalIdentityInUse);
        }

        tx.execute(
            "INSERT INTO account (id, nonce, mac, system_key_iv, encrypted_system_key,
             user_key_iv, encrypted_user_key, key_pair_iv, encrypted_private_key, public_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                WSnowflake(account.id),
                account.security.nonce,
                account.security.mac,
                account.security.system_key.iv,
                account.security.system_key.ciphertext,
                account.security.user_key.iv,
                account.security.user_key.ciphertext,
                account.security.key_pair.iv,
                account.security.key_pair.encrypted_private_key,
                account.security.key_pair.public_key,
            ],
        )?;
        tx.execute(
            "INSERT INTO personal_identity (namespace, id, account_id, verified)
             VALUES (?1, ?2, ?3, 0)",
            params![namespace, id, WSnowflake(account.id)],
        )?;

        let agent_updated = {
            let iv = random_bytes(BLOCK_SIZE);
            let mut wrapped = client_key.plaintext.clone();
            block_crypt(&iv, &agent_key.plaintext, &mut wrapped)?;
            tx.execute(
                "UPDATE agent SET account_id = ?2, iv = ?3, encrypted_client_key = ?4
                 WHERE id = ?1",
                params![agent_id, WSnowflake(account.id), iv, wrapped],
            )?
        };
        if agent_updated == 0 {
            warn!("agent {agent_id} not found while registering {namespace}:{id}");
        }

        tx.commit()?;
        Ok((account, client_key))
    }

    async fn resolve_account(&self, namespace: &str, id: &str) -> Result<Account> {
        let conn = self.conn.lock();
        let account_id = conn
            .query_row(
                "SELECT account_id FROM personal_identity WHERE namespace = ?1 AND id = ?2",
                params![namespace, id],
                |row| row.get::<_, WSnowflake>(0),
            )
            .optional()?
            .ok_or(Error::AccountNotFound)?;
        load_account(&conn, account_id.0)
    }

    async fn grant_staff(
        &self,
        kms: &dyn Kms,
        account_id: Snowflake,
        credential: &KmsCredential,
    ) -> Result<()> {
        let account = load_account(&self.conn.lock(), account_id)?;
        let mut key = account.security.system_key.clone();
        kms.decrypt_key(&mut key)?;
        let nonce = kms.generate_nonce(CLIENT_KEY_TYPE.block_size())?;
        let capability = grant_shared_secret(&key, &nonce, &credential.kms_type, credential)?;

        self.conn.lock().execute(
            "INSERT OR REPLACE INTO staff_capability
             (account_id, id, nonce, public_data, encrypted_private_data)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                WSnowflake(account_id),
                capability.id,
                capability.nonce,
                capability.public_payload,
                capability.encrypted_payload,
            ],
        )?;
        Ok(())
    }

    async fn revoke_staff(&self, account_id: Snowflake) -> Result<()> {
        self.conn.lock().execute(
            "DELETE FROM staff_capability WHERE account_id = ?1",
            params![WSnowflake(account_id)],
        )?;
        Ok(())
    }

    async fn verify_personal_identity(&self, namespace: &str, id: &str) -> Result<()> {
        let n = self.conn.lock().execute(
            "UPDATE personal_identity SET verified = 1 WHERE namespace = ?1 AND id = ?2",
            params![namespace, id],
        )?;
        if n == 0 {
            return Err(Error::AccountNotFound);
        }
        Ok(())
    }

    async fn set_account_security(
        &self,
        account_id: Snowflake,
        security: &AccountSecurity,
    ) -> Result<()> {
        let n = self.conn.lock().execute(
            "UPDATE account SET nonce = ?2, mac = ?3, system_key_iv = ?4,
             encrypted_system_key = ?5, user_key_iv = ?6, encrypted_user_key = ?7,
             key_pair_iv = ?8, encrypted_private_key = ?9, public_key = ?10
             WHERE id = ?1",
            params![
                WSnowflake(account_id),
                security.nonce,
                security.mac,
                security.system_key.iv,
                security.system_key.ciphertext,
                security.user_key.iv,
                security.user_key.ciphertext,
                security.key_pair.iv,
                security.key_pair.encrypted_private_key,
                security.key_pair.public_key,
            ],
        )?;
        if n == 0 {
            return Err(Error::AccountNotFound);
        }
        Ok(())
    }

    async fn register_agent(&self, agent: &Agent) -> Result<()> {
        self.conn.lock().execute(
            "INSERT OR IGNORE INTO agent (id, account_id, iv, encrypted_client_key, created)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                agent.id,
                agent.account_id.map(WSnowflake),
                agent.iv,
                agent.encrypted_client_key,
                WTime(agent.created),
            ],
        )?;
        Ok(())
    }

    async fn get_agent(&self, id: &str) -> Result<Option<Agent>> {
        self.conn
            .lock()
            .query_row(
                "SELECT id, account_id, iv, encrypted_client_key, created
                 FROM agent WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Agent {
                        id: row.get(0)?,
                        account_id: row.get::<_, Option<WSnowflake>>(1)?.map(|s| s.0),
                        iv: row.get::<_, Option<Vec<u8>>>(2)?.unwrap_or_default(),
                        encrypted_client_key: row
                            .get::<_, Option<Vec<u8>>>(3)?
                            .unwrap_or_default(),
                        created: row.get::<_, WTime>(4)?.0,
                    })
                },
            )
            .optional()
            .map_err(Error::from)
    }

    async fn set_agent_account(
        &self,
        agent_id: &str,
        account_id: Option<Snowflake>,
    ) -> Result<()> {
        if account_id.is_none() {
            self.conn.lock().execute(
                "UPDATE agent SET account_id = NULL, iv = NULL, encrypted_client_key = NULL
                 WHERE id = ?1",
                params![agent_id],
            )?;
        } else {
            self.conn.lock().execute(
                "UPDATE agent SET account_id = ?2 WHERE id = ?1",
                params![agent_id, account_id.map(WSnowflake)],
            )?;
        }
        Ok(())
    }

    async fn set_agent_client_key(
        &self,
        agent_id: &str,
        agent_key: &ManagedKey,
        client_key: &ManagedKey,
    ) -> Result<()> {
        let iv = random_bytes(BLOCK_SIZE);
        let mut wrapped = client_key.plaintext.clone();
        block_crypt(&iv, &agent_key.plaintext, &mut wrapped)?;
        let n = self.conn.lock().execute(
            "UPDATE agent SET iv = ?2, encrypted_client_key = ?3 WHERE id = ?1",
            params![agent_id, iv, wrapped],
        )?;
        if n == 0 {
            return Err(Error::AccessDenied);
        }
        Ok(())
    }

    async fn agent_client_key(
        &self,
        agent_id: &str,
        agent_key: &ManagedKey,
    ) -> Result<Option<ManagedKey>> {
        let Some(agent) = self.get_agent(agent_id).await? else {
            return Ok(None);
        };
        if agent.encrypted_client_key.is_empty() {
            return Ok(None);
        }
        let mut plaintext = agent.encrypted_client_key;
        block_crypt(&agent.iv, &agent_key.plaintext, &mut plaintext)?;
        Ok(Some(ManagedKey::from_plaintext(CLIENT_KEY_TYPE, plaintext)))
    }

    async fn save_pm(&self, pm: &Pm) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO pm (id, initiator, receiver, receiver_mac, iv,
             encrypted_system_key, encrypted_initiator_key, encrypted_receiver_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                WSnowflake(pm.id),
                WSnowflake(pm.initiator),
                pm.receiver.0,
                pm.receiver_mac,
                pm.iv,
                pm.encrypted_system_key.ciphertext,
                pm.encrypted_initiator_key.ciphertext,
                pm.encrypted_receiver_key.as_ref().map(|k| k.ciphertext.clone()),
            ],
        )?;
        Ok(())
    }

    async fn get_pm(&self, id: Snowflake) -> Result<Pm> {
        self.conn
            .lock()
            .query_row(
                "SELECT id, initiator, receiver, receiver_mac, iv, encrypted_system_key,
                 encrypted_initiator_key, encrypted_receiver_key FROM pm WHERE id = ?1",
                params![WSnowflake(id)],
                |row| {
                    let id = row.get::<_, WSnowflake>(0)?.0;
                    let iv: Vec<u8> = row.get(4)?;
                    Ok(Pm {
                        id,
                        initiator: row.get::<_, WSnowflake>(1)?.0,
                        receiver: UserId(row.get(2)?),
                        receiver_mac: row.get(3)?,
                        encrypted_system_key: ManagedKey::from_ciphertext(
                            ROOM_MESSAGE_KEY_TYPE,
                            iv.clone(),
                            row.get(5)?,
                            "pm",
                            &id.to_string(),
                        ),
                        encrypted_initiator_key: ManagedKey::from_ciphertext(
                            ROOM_MESSAGE_KEY_TYPE,
                            iv.clone(),
                            row.get(6)?,
                            "",
                            "",
                        ),
                        encrypted_receiver_key: row
                            .get::<_, Option<Vec<u8>>>(7)?
                            .map(|ciphertext| {
                                ManagedKey::from_ciphertext(
                                    ROOM_MESSAGE_KEY_TYPE,
                                    iv.clone(),
                                    ciphertext,
                                    "",
                                    "",
                                )
                            }),
                        iv,
                    })
                },
            )
            .optional()?
            .ok_or(Error::PmNotFound)
    }

    async fn update_pm_receiver_key(&self, pm: &Pm) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE pm SET receiver = ?2, encrypted_receiver_key = ?3 WHERE id = ?1",
            params![
                WSnowflake(pm.id),
                pm.receiver.0,
                pm.encrypted_receiver_key.as_ref().map(|k| k.ciphertext.clone()),
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{EditMessage, SessionView};

    fn test_backend() -> SqliteBackend {
        SqliteBackend::open_in_memory("testver", Arc::new(IdGenerator::new(1))).unwrap()
    }

    fn view(identity: &str, session_id: &str) -> SessionView {
        SessionView {
            id: UserId(identity.to_string()),
            name: "guest".into(),
            server_id: "test".into(),
            server_era: "era1".into(),
            session_id: SessionId(session_id.to_string()),
            is_staff: false,
            is_manager: false,
        }
    }

    fn message(ids: &IdGenerator, sender: &SessionView, content: &str) -> Message {
        Message {
            id: MessageId(ids.next()),
            parent: None,
            previous_edit_id: None,
            time: Time::now(),
            sender: sender.clone(),
            content: content.to_string(),
            encryption_key_id: None,
            edited: None,
            deleted: None,
        }
    }

    #[tokio::test]
    async fn message_round_trip_and_log() {
        let backend = test_backend();
        let kms = crate::security::kms::LocalKms::generate();
        backend.create_room(&kms, false, "lobby", &[]).await.unwrap();

        let ids = IdGenerator::new(2);
        let sender = view("agent:A", "A-1");
        let m1 = message(&ids, &sender, "one");
        let m2 = message(&ids, &sender, "two");
        backend.save_message("lobby", &m1).await.unwrap();
        backend.save_message("lobby", &m2).await.unwrap();

        let log = backend.latest("lobby", 10, None).await.unwrap();
        assert_eq!(
            log.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
            vec!["one", "two"]
        );

        let log = backend.latest("lobby", 1, None).await.unwrap();
        assert_eq!(log[0].content, "two");

        let log = backend.latest("lobby", 10, Some(m2.id)).await.unwrap();
        assert_eq!(log[0].content, "one");

        let fetched = backend.get_message("lobby", m1.id).await.unwrap();
        assert_eq!(fetched.content, "one");
        assert!(backend.is_valid_parent("lobby", m1.id).await.unwrap());
        assert!(!backend
            .is_valid_parent("lobby", MessageId(Snowflake(42)))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn edit_chain_is_enforced() {
        let backend = test_backend();
        let kms = crate::security::kms::LocalKms::generate();
        backend.create_room(&kms, false, "edits", &[]).await.unwrap();

        let ids = IdGenerator::new(2);
        let sender = view("agent:A", "A-1");
        let msg = message(&ids, &sender, "original");
        backend.save_message("edits", &msg).await.unwrap();

        let e1 = ids.next();
        let edited = backend
            .edit_message(
                "edits",
                e1,
                Some(sender.id.clone()),
                &EditMessage {
                    id: msg.id,
                    previous_edit_id: Snowflake::ZERO,
                    parent: None,
                    content: "hello".into(),
                    delete: false,
                    announce: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(edited.content, "hello");
        assert_eq!(edited.previous_edit_id, Some(e1));

        // A stale previous_edit_id is rejected and changes nothing.
        let err = backend
            .edit_message(
                "edits",
                ids.next(),
                Some(sender.id.clone()),
                &EditMessage {
                    id: msg.id,
                    previous_edit_id: Snowflake::ZERO,
                    parent: None,
                    content: "conflict".into(),
                    delete: false,
                    announce: false,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EditInconsistent));

        let stored = backend.get_message("edits", msg.id).await.unwrap();
        assert_eq!(stored.content, "hello");

        // Deleting hides the message from the log.
        backend
            .edit_message(
                "edits",
                ids.next(),
                Some(sender.id.clone()),
                &EditMessage {
                    id: msg.id,
                    previous_edit_id: e1,
                    parent: None,
                    content: String::new(),
                    delete: true,
                    announce: false,
                },
            )
            .await
            .unwrap();
        assert!(backend.latest("edits", 10, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ban_upsert_converges() {
        let backend = test_backend();
        let until1 = Some(Time(Time::now().0 + 60));
        let until2 = Some(Time(Time::now().0 + 7200));

        backend.ban_agent(Some("lobby"), "agent:A", until1).await.unwrap();
        backend.ban_agent(Some("lobby"), "agent:A", until2).await.unwrap();

        assert!(backend.agent_banned("lobby", "agent:A").await.unwrap());

        let expires: Option<i64> = backend
            .conn
            .lock()
            .query_row(
                "SELECT expires FROM banned_agent WHERE room = 'lobby' AND agent_id = 'agent:A'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(expires, until2.map(|t| t.0));

        backend.unban_agent(Some("lobby"), "agent:A").await.unwrap();
        assert!(!backend.agent_banned("lobby", "agent:A").await.unwrap());
    }

    #[tokio::test]
    async fn expired_bans_do_not_bounce() {
        let backend = test_backend();
        backend
            .ban_agent(Some("lobby"), "agent:A", Some(Time(Time::now().0 - 1)))
            .await
            .unwrap();
        assert!(!backend.agent_banned("lobby", "agent:A").await.unwrap());

        // Global bans cover every room.
        backend.ban_agent(None, "agent:B", None).await.unwrap();
        assert!(backend.agent_banned("lobby", "agent:B").await.unwrap());
    }

    #[tokio::test]
    async fn message_key_rotation() {
        let backend = test_backend();
        let kms = crate::security::kms::LocalKms::generate();
        backend.create_room(&kms, false, "sekrit", &[]).await.unwrap();

        assert!(backend.room_message_key("sekrit").await.unwrap().is_none());

        let ids = IdGenerator::new(3);
        let k1 = RoomMessageKey::generate(&kms, "sekrit", ids.next()).unwrap();
        backend.activate_room_message_key("sekrit", &k1).await.unwrap();
        let current = backend.room_message_key("sekrit").await.unwrap().unwrap();
        assert_eq!(current.key_id, k1.key_id);

        let k2 = RoomMessageKey::generate(&kms, "sekrit", ids.next()).unwrap();
        backend.activate_room_message_key("sekrit", &k2).await.unwrap();
        let current = backend.room_message_key("sekrit").await.unwrap().unwrap();
        assert_eq!(current.key_id, k2.key_id);
    }

    #[tokio::test]
    async fn account_registration_and_resolve() {
        let backend = test_backend();
        let kms = crate::security::kms::LocalKms::generate();

        let agent = Agent::new("agent1");
        backend.register_agent(&agent).await.unwrap();
        let agent_key = ManagedKey::from_plaintext(CLIENT_KEY_TYPE, vec![1u8; 16]);

        let (account, client_key) = backend
            .register_account(&kms, "email", "max@example.com", "hunter2", "agent1", &agent_key)
            .await
            .unwrap();

        let resolved = backend.resolve_account("email", "max@example.com").await.unwrap();
        assert_eq!(resolved.id, account.id);
        resolved.unlock(&client_key).unwrap();

        let err = backend
            .register_account(&kms, "email", "max@example.com", "other", "agent1", &agent_key)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PersonalIdentityInUse));

        // The agent can recover the client key from its cookie secret.
        let recovered = backend
            .agent_client_key("agent1", &agent_key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recovered.plaintext, client_key.plaintext);

        backend
            .verify_personal_identity("email", "max@example.com")
            .await
            .unwrap();
        let resolved = backend.resolve_account("email", "max@example.com").await.unwrap();
        assert!(resolved.personal_identities[0].verified);
    }

    #[tokio::test]
    async fn manager_grants_round_trip() {
        let backend = test_backend();
        let kms = crate::security::kms::LocalKms::generate();

        let agent_key = ManagedKey::from_plaintext(CLIENT_KEY_TYPE, vec![1u8; 16]);
        let agent = Agent::new("agent1");
        backend.register_agent(&agent).await.unwrap();
        let (alice, alice_key) = backend
            .register_account(&kms, "email", "alice@example.com", "hunter2", "agent1", &agent_key)
            .await
            .unwrap();
        let (bob, _) = backend
            .register_account(&kms, "email", "bob@example.com", "hunter2", "agent1", &agent_key)
            .await
            .unwrap();

        let room = backend
            .create_room(&kms, false, "managed", std::slice::from_ref(&alice))
            .await
            .unwrap();

        let managers = backend.managers("managed").await.unwrap();
        assert_eq!(managers.len(), 1);
        assert_eq!(managers[0].id, alice.id);

        // Alice's grant opens with her unlocked key pair.
        let cap = backend.manager_capability("managed", alice.id).await.unwrap();
        let alice_kp = alice.unlock(&alice_key).unwrap();
        open_manager_grant(&room, &alice_kp, &cap).unwrap();

        // Alice revokes a grant for Bob.
        let bob_cap = {
            let (kek, room_kp) = open_manager_grant(&room, &alice_kp, &cap).unwrap();
            seal_manager_grant(&room, &room_kp, &kek, &bob).unwrap()
        };
        backend
            .save_manager_capability("managed", bob.id, &bob_cap)
            .await
            .unwrap();
        assert_eq!(backend.managers("managed").await.unwrap().len(), 2);

        backend
            .remove_manager(&room, &alice, &alice_key, bob.id)
            .await
            .unwrap();
        assert_eq!(backend.managers("managed").await.unwrap().len(), 1);

        let err = backend
            .remove_manager(&room, &alice, &alice_key, bob.id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ManagerNotFound));
    }
}
