//! The in-memory implementation of the storage contract.
//!
//! Used by tests and runnable single-node. Everything lives behind one
//! mutex; the transactional guarantees of the contract hold trivially.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::warn;
use parking_lot::Mutex;

use super::{
    new_room_security, open_manager_grant, seal_manager_grant, Agent, Backend, MessageEditLog,
    PeerIdentity, RoomMessageKey, RoomRecord,
};
use crate::account::{new_account_security, Account, AccountSecurity, PersonalIdentity};
use crate::api::{EditMessage, Message, MessageId, SessionId, Time, UserId};
use crate::pm::Pm;
use crate::presence::{Presence, PresenceRow};
use crate::security::capability::{grant_shared_secret, Capability};
use crate::security::kms::{Kms, KmsCredential};
use crate::security::{block_crypt, random_bytes, ManagedKey, BLOCK_SIZE, CLIENT_KEY_TYPE};
use crate::snowflake::{IdGenerator, Snowflake};
use crate::{Error, Result};

#[derive(Debug, Clone)]
struct ManagerGrantRow {
    account_id: Snowflake,
    capability_id: String,
    granted: Time,
    revoked: Option<Time>,
}

#[derive(Debug, Default)]
struct State {
    rooms: HashMap<String, RoomRecord>,
    messages: HashMap<String, Vec<Message>>,
    edit_log: Vec<MessageEditLog>,
    message_keys: HashMap<String, Vec<RoomMessageKey>>,
    capabilities: HashMap<String, (String, Capability)>,
    manager_grants: HashMap<String, Vec<ManagerGrantRow>>,
    accounts: HashMap<Snowflake, Account>,
    account_ids: HashMap<String, Snowflake>,
    agents: HashMap<String, Agent>,
    banned_agents: HashMap<(Option<String>, String), Option<Time>>,
    banned_ips: HashMap<(Option<String>, String), Option<Time>>,
    presence: HashMap<(String, SessionId), PresenceRow>,
    pms: HashMap<Snowflake, Pm>,
}

/// A mutex-protected in-memory backend.
#[derive(Debug)]
pub struct TestBackend {
    version: String,
    ids: Arc<IdGenerator>,
    state: Mutex<State>,
}

impl TestBackend {
    pub fn new(version: &str, ids: Arc<IdGenerator>) -> Self {
        Self {
            version: version.to_string(),
            ids,
            state: Mutex::new(State::default()),
        }
    }
}

fn retention_threshold(room: &RoomRecord) -> Option<Time> {
    if room.retention_days == 0 {
        return None;
    }
    Some(Time(
        Time::now().0 - i64::from(room.retention_days) * 24 * 3600,
    ))
}

fn within_retention(room: &RoomRecord, msg: &Message) -> bool {
    match retention_threshold(room) {
        Some(threshold) => msg.time >= threshold,
        None => true,
    }
}

fn ban_active(expiry: Option<&Option<Time>>) -> bool {
    match expiry {
        None => false,
        Some(None) => true,
        Some(Some(until)) => *until >= Time::now(),
    }
}

#[async_trait]
impl Backend for TestBackend {
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

        let mut state = self.state.lock();
        if let Some(existing) = state.rooms.get(name) {
            return Ok(existing.clone());
        }
        state.rooms.insert(name.to_string(), record.clone());
        for (account_id, capability) in grants {
            state
                .capabilities
                .insert(capability.id.clone(), (name.to_string(), capability.clone()));
            state
                .manager_grants
                .entry(name.to_string())
                .or_default()
                .push(ManagerGrantRow {
                    account_id,
                    capability_id: capability.id,
                    granted: Time::now(),
                    revoked: None,
                });
        }
        if let Some(key) = message_key {
            state
                .message_keys
                .entry(name.to_string())
                .or_default()
                .push(key);
        }
        Ok(record)
    }

    async fn get_room(&self, name: &str) -> Result<RoomRecord> {
        self.state
            .lock()
            .rooms
            .get(name)
            .cloned()
            .ok_or(Error::RoomNotFound)
    }

    async fn set_room_retention(&self, name: &str, days: u32) -> Result<()> {
        self.state
            .lock()
            .rooms
            .get_mut(name)
            .ok_or(Error::RoomNotFound)?
            .retention_days = days;
        Ok(())
    }

    async fn save_message(&self, room: &str, msg: &Message) -> Result<()> {
        self.state
            .lock()
            .messages
            .entry(room.to_string())
            .or_default()
            .push(msg.clone());
        Ok(())
    }

    async fn get_message(&self, room: &str, id: MessageId) -> Result<Message> {
        let state = self.state.lock();
        let record = state.rooms.get(room).ok_or(Error::RoomNotFound)?;
        let msg = state
            .messages
            .get(room)
            .and_then(|msgs| msgs.iter().find(|m| m.id == id))
            .ok_or(Error::MessageNotFound)?;
        if !within_retention(record, msg) {
            return Err(Error::MessageNotFound);
        }
        Ok(msg.clone())
    }

    async fn latest(
        &self,
        room: &str,
        n: usize,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>> {
        let state = self.state.lock();
        let record = state.rooms.get(room).ok_or(Error::RoomNotFound)?;

        let mut messages: Vec<Message> = state
            .messages
            .get(room)
            .map(|msgs| {
                msgs.iter()
                    .filter(|m| m.deleted.is_none())
                    .filter(|m| within_retention(record, m))
                    .filter(|m| before.is_none_or(|b| m.id < b))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        messages.sort_by_key(|m| m.id);
        if messages.len() > n {
            messages.drain(..messages.len() - n);
        }
        Ok(messages)
    }

    async fn is_valid_parent(&self, room: &str, id: MessageId) -> Result<bool> {
        let state = self.state.lock();
        let record = state.rooms.get(room).ok_or(Error::RoomNotFound)?;
        if record.retention_days == 0 {
            return Ok(state
                .messages
                .get(room)
                .is_some_and(|msgs| msgs.iter().any(|m| m.id == id)));
        }
        let Some(msg) = state
            .messages
            .get(room)
            .and_then(|msgs| msgs.iter().find(|m| m.id == id))
        else {
            return Ok(false);
        };
        Ok(within_retention(record, msg))
    }

    async fn edit_message(
        &self,
        room: &str,
        edit_id: Snowflake,
        editor: Option<UserId>,
        cmd: &EditMessage,
    ) -> Result<Message> {
        let mut state = self.state.lock();

        let msg = state
            .messages
            .get_mut(room)
            .and_then(|msgs| msgs.iter_mut().find(|m| m.id == cmd.id))
            .ok_or(Error::MessageNotFound)?;

        let stored = msg.previous_edit_id.unwrap_or(Snowflake::ZERO);
        if stored != cmd.previous_edit_id {
            return Err(Error::EditInconsistent);
        }

        let entry = MessageEditLog {
            edit_id,
            room: room.to_string(),
            message_id: cmd.id,
            previous_edit_id: msg.previous_edit_id,
            previous_content: msg.content.clone(),
            previous_parent: msg.parent,
            editor_id: editor,
            edited_at: Time::now(),
        };

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

        let updated = msg.clone();
        state.edit_log.push(entry);
        Ok(updated)
    }

    async fn store_presence(&self, row: &PresenceRow) -> Result<()> {
        self.state
            .lock()
            .presence
            .insert((row.room.clone(), row.session_id.clone()), row.clone());
        Ok(())
    }

    async fn update_presence(&self, row: &PresenceRow) -> Result<()> {
        self.store_presence(row).await
    }

    async fn remove_presence(&self, room: &str, session_id: &SessionId) -> Result<()> {
        self.state
            .lock()
            .presence
            .remove(&(room.to_string(), session_id.clone()));
        Ok(())
    }

    async fn room_presence(&self, room: &str, live: &[PeerIdentity]) -> Result<Vec<Presence>> {
        Ok(self
            .state
            .lock()
            .presence
            .values()
            .filter(|row| row.room == room)
            .filter(|row| {
                live.iter().any(|peer| {
                    peer.server_id == row.server_id && peer.server_era == row.server_era
                })
            })
            .map(|row| row.fact.clone())
            .collect())
    }

    async fn purge_other_eras(&self, server_id: &str, current_era: &str) -> Result<()> {
        self.state.lock().presence.retain(|_, row| {
            row.server_id != server_id || row.server_era == current_era
        });
        Ok(())
    }

    async fn rooms_touched_by(&self, server_id: &str, server_era: &str) -> Result<Vec<String>> {
        let state = self.state.lock();
        let mut rooms: Vec<String> = state
            .presence
            .values()
            .filter(|row| row.server_id == server_id && row.server_era == server_era)
            .map(|row| row.room.clone())
            .collect();
        rooms.sort();
        rooms.dedup();
        Ok(rooms)
    }

    async fn ban_agent(
        &self,
        room: Option<&str>,
        agent_id: &str,
        until: Option<Time>,
    ) -> Result<()> {
        self.state
            .lock()
            .banned_agents
            .insert((room.map(String::from), agent_id.to_string()), until);
        Ok(())
    }

    async fn unban_agent(&self, room: Option<&str>, agent_id: &str) -> Result<()> {
        self.state
            .lock()
            .banned_agents
            .remove(&(room.map(String::from), agent_id.to_string()));
        Ok(())
    }

    async fn ban_ip(&self, room: Option<&str>, ip: &str, until: Option<Time>) -> Result<()> {
        self.state
            .lock()
            .banned_ips
            .insert((room.map(String::from), ip.to_string()), until);
        Ok(())
    }

    async fn unban_ip(&self, room: Option<&str>, ip: &str) -> Result<()> {
        self.state
            .lock()
            .banned_ips
            .remove(&(room.map(String::from), ip.to_string()));
        Ok(())
    }

    async fn agent_banned(&self, room: &str, agent_id: &str) -> Result<bool> {
        let state = self.state.lock();
        Ok(ban_active(
            state
                .banned_agents
                .get(&(Some(room.to_string()), agent_id.to_string())),
        ) || ban_active(state.banned_agents.get(&(None, agent_id.to_string()))))
    }

    async fn ip_banned(&self, room: &str, ip: &str) -> Result<bool> {
        let state = self.state.lock();
        Ok(
            ban_active(state.banned_ips.get(&(Some(room.to_string()), ip.to_string())))
                || ban_active(state.banned_ips.get(&(None, ip.to_string()))),
        )
    }

    async fn activate_room_message_key(&self, room: &str, key: &RoomMessageKey) -> Result<()> {
        let mut state = self.state.lock();
        let keys = state.message_keys.entry(room.to_string()).or_default();
        let now = Time::now();
        for existing in keys.iter_mut() {
            if existing.expired.is_none() {
                existing.expired = Some(now);
            }
        }
        keys.push(key.clone());
        Ok(())
    }

    async fn room_message_key(&self, room: &str) -> Result<Option<RoomMessageKey>> {
        Ok(self
            .state
            .lock()
            .message_keys
            .get(room)
            .and_then(|keys| keys.iter().rev().find(|key| key.expired.is_none()))
            .cloned())
    }

    async fn save_capability(&self, room: &str, capability: &Capability) -> Result<()> {
        self.state.lock().capabilities.insert(
            capability.id.clone(),
            (room.to_string(), capability.clone()),
        );
        Ok(())
    }

    async fn get_capability(&self, room: &str, id: &str) -> Result<Option<Capability>> {
        Ok(self
            .state
            .lock()
            .capabilities
            .get(id)
            .filter(|(r, _)| r == room)
            .map(|(_, c)| c.clone()))
    }

    async fn save_manager_capability(
        &self,
        room: &str,
        account_id: Snowflake,
        capability: &Capability,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let grants = state.manager_grants.entry(room.to_string()).or_default();
        if grants
            .iter()
            .any(|g| g.account_id == account_id && g.revoked.is_none())
        {
            return Ok(());
        }
        grants.push(ManagerGrantRow {
            account_id,
            capability_id: capability.id.clone(),
            granted: Time::now(),
            revoked: None,
        });
        state.capabilities.insert(
            capability.id.clone(),
            (room.to_string(), capability.clone()),
        );
        Ok(())
    }

    async fn manager_capability(&self, room: &str, account_id: Snowflake) -> Result<Capability> {
        let state = self.state.lock();
        let grant = state
            .manager_grants
            .get(room)
            .and_then(|grants| {
                grants
                    .iter()
                    .find(|g| g.account_id == account_id && g.revoked.is_none())
            })
            .ok_or(Error::ManagerNotFound)?;
        state
            .capabilities
            .get(&grant.capability_id)
            .map(|(_, c)| c.clone())
            .ok_or(Error::CapabilityNotFound)
    }

    async fn managers(&self, room: &str) -> Result<Vec<Account>> {
        let state = self.state.lock();
        Ok(state
            .manager_grants
            .get(room)
            .map(|grants| {
                grants
                    .iter()
                    .filter(|g| g.revoked.is_none())
                    .filter_map(|g| state.accounts.get(&g.account_id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn remove_manager(
        &self,
        room: &RoomRecord,
        actor: &Account,
        actor_key: &ManagedKey,
        former_manager: Snowflake,
    ) -> Result<()> {
        let actor_kp = actor.unlock(actor_key)?;

        let mut state = self.state.lock();

        let actor_grant = state
            .manager_grants
            .get(&room.name)
            .and_then(|grants| {
                grants
                    .iter()
                    .find(|g| g.account_id == actor.id && g.revoked.is_none())
            })
            .ok_or(Error::AccessDenied)?;
        let (_, capability) = state
            .capabilities
            .get(&actor_grant.capability_id)
            .ok_or(Error::AccessDenied)?;
        open_manager_grant(room, &actor_kp, capability).map_err(|_| Error::AccessDenied)?;

        let grant = state
            .manager_grants
            .get_mut(&room.name)
            .and_then(|grants| {
                grants
                    .iter_mut()
                    .find(|g| g.account_id == former_manager && g.revoked.is_none())
            })
            .ok_or(Error::ManagerNotFound)?;
        grant.revoked = Some(Time::now());
        Ok(())
    }

    async fn get_account(&self, id: Snowflake) -> Result<Account> {
        self.state
            .lock()
            .accounts
            .get(&id)
            .cloned()
            .ok_or(Error::AccountNotFound)
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
        let key = format!("{namespace}:{id}");
        if self.state.lock().account_ids.contains_key(&key) {
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

        let mut state = self.state.lock();
        if state.account_ids.contains_key(&key) {
            return Err(Error::PersonalIdentityInUse);
        }
        state.account_ids.insert(key, account.id);
        state.accounts.insert(account.id, account.clone());

        match state.agents.get_mut(agent_id) {
            Some(agent) => {
                let iv = random_bytes(BLOCK_SIZE);
                let mut wrapped = client_key.plaintext.clone();
                block_crypt(&iv, &agent_key.plaintext, &mut wrapped)?;
                agent.iv = iv;
                agent.encrypted_client_key = wrapped;
                agent.account_id = Some(account.id);
            }
            None => {
                warn!("agent {agent_id} not found while registering {namespace}:{id}");
            }
        }

        Ok((account, client_key))
    }

    async fn resolve_account(&self, namespace: &str, id: &str) -> Result<Account> {
        let state = self.state.lock();
        let account_id = state
            .account_ids
            .get(&format!("{namespace}:{id}"))
            .ok_or(Error::AccountNotFound)?;
        state
            .accounts
            .get(account_id)
            .cloned()
            .ok_or(Error::AccountNotFound)
    }

    async fn grant_staff(
        &self,
        kms: &dyn Kms,
        account_id: Snowflake,
        credential: &KmsCredential,
    ) -> Result<()> {
        let mut key = {
            let state = self.state.lock();
            let account = state.accounts.get(&account_id).ok_or(Error::AccountNotFound)?;
            account.security.system_key.clone()
        };
        kms.decrypt_key(&mut key)?;
        let nonce = kms.generate_nonce(CLIENT_KEY_TYPE.block_size())?;
        let capability = grant_shared_secret(&key, &nonce, &credential.kms_type, credential)?;

        let mut state = self.state.lock();
        let account = state
            .accounts
            .get_mut(&account_id)
            .ok_or(Error::AccountNotFound)?;
        account.staff_capability = Some(capability);
        Ok(())
    }

    async fn revoke_staff(&self, account_id: Snowflake) -> Result<()> {
        let mut state = self.state.lock();
        let account = state
            .accounts
            .get_mut(&account_id)
            .ok_or(Error::AccountNotFound)?;
        account.staff_capability = None;
        Ok(())
    }

    async fn verify_personal_identity(&self, namespace: &str, id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let account_id = *state
            .account_ids
            .get(&format!("{namespace}:{id}"))
            .ok_or(Error::AccountNotFound)?;
        let account = state
            .accounts
            .get_mut(&account_id)
            .ok_or(Error::AccountNotFound)?;
        for identity in &mut account.personal_identities {
            if identity.namespace == namespace && identity.id == id {
                identity.verified = true;
            }
        }
        Ok(())
    }

    async fn set_account_security(
        &self,
        account_id: Snowflake,
        security: &AccountSecurity,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let account = state
            .accounts
            .get_mut(&account_id)
            .ok_or(Error::AccountNotFound)?;
        account.security = security.clone();
        Ok(())
    }

    async fn register_agent(&self, agent: &Agent) -> Result<()> {
        self.state
            .lock()
            .agents
            .entry(agent.id.clone())
            .or_insert_with(|| agent.clone());
        Ok(())
    }

    async fn get_agent(&self, id: &str) -> Result<Option<Agent>> {
        Ok(self.state.lock().agents.get(id).cloned())
    }

    async fn set_agent_account(
        &self,
        agent_id: &str,
        account_id: Option<Snowflake>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(agent) = state.agents.get_mut(agent_id) {
            agent.account_id = account_id;
            if account_id.is_none() {
                agent.iv = Vec::new();
                agent.encrypted_client_key = Vec::new();
            }
        }
        Ok(())
    }

    async fn set_agent_client_key(
        &self,
        agent_id: &str,
        agent_key: &ManagedKey,
        client_key: &ManagedKey,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let agent = state.agents.get_mut(agent_id).ok_or(Error::AccessDenied)?;
        let iv = random_bytes(BLOCK_SIZE);
        let mut wrapped = client_key.plaintext.clone();
        block_crypt(&iv, &agent_key.plaintext, &mut wrapped)?;
        agent.iv = iv;
        agent.encrypted_client_key = wrapped;
        Ok(())
    }

    async fn agent_client_key(
        &self,
        agent_id: &str,
        agent_key: &ManagedKey,
    ) -> Result<Option<ManagedKey>> {
        let state = self.state.lock();
        let Some(agent) = state.agents.get(agent_id) else {
            return Ok(None);
        };
        if agent.encrypted_client_key.is_empty() {
            return Ok(None);
        }
        let mut plaintext = agent.encrypted_client_key.clone();
        block_crypt(&agent.iv, &agent_key.plaintext, &mut plaintext)?;
        Ok(Some(ManagedKey::from_plaintext(CLIENT_KEY_TYPE, plaintext)))
    }

    async fn save_pm(&self, pm: &Pm) -> Result<()> {
        self.state.lock().pms.insert(pm.id, pm.clone());
        Ok(())
    }

    async fn get_pm(&self, id: Snowflake) -> Result<Pm> {
        self.state.lock().pms.get(&id).cloned().ok_or(Error::PmNotFound)
    }

    async fn update_pm_receiver_key(&self, pm: &Pm) -> Result<()> {
        self.state.lock().pms.insert(pm.id, pm.clone());
        Ok(())
    }
}
