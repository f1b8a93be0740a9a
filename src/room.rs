//! The per-room presence and broadcast engine.
//!
//! A [`Room`] tracks which identities are present, fans events out to
//! every attached session, and fronts the storage contract for messages,
//! keys, bans, and manager grants. Mutations are serialized per room, so
//! the sequence of committed mutations defines a total order that every
//! session observes a subsequence of, in order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::account::Account;
use crate::api::{
    BounceEvent, Data, EditMessage, EditMessageEvent, EditMessageReply, JoinEvent, Message,
    MessageId, NickEvent, PartEvent, ParsedPacket, SendEvent, SessionId, SessionView, Time,
    UserId,
};
use crate::backend::{Agent, Backend, PeerIdentity, RoomMessageKey, RoomRecord};
use crate::cluster::{Cluster, PeerDesc, RoomEventEnvelope};
use crate::presence::PresenceRow;
use crate::security::capability::Capability;
use crate::security::kms::Kms;
use crate::security::{decrypt_gcm, encrypt_gcm, ManagedKey};
use crate::snowflake::IdGenerator;
use crate::{Error, Result};

/// Capacity of each session's outbound event channel. A session that falls
/// this far behind is disconnected rather than queued without bound.
pub const OUTBOUND_CAPACITY: usize = 100;

/// Number of log messages included in a join snapshot.
pub const SNAPSHOT_LOG_SIZE: usize = 100;

/// What kind of room this is.
#[derive(Debug, Clone)]
pub enum RoomKind {
    /// An ordinary room; encryption follows the room's message key rows.
    Public,
    /// A PM room; every message is encrypted under the PM key.
    Pm { key_id: String, key: ManagedKey },
}

/// A room's handle on one attached session.
#[derive(Debug, Clone)]
struct SessionOutbound {
    session_id: SessionId,
    tx: mpsc::Sender<ParsedPacket>,
}

#[derive(Debug, Default)]
struct RoomState {
    /// Identity id → the view published for that identity.
    identities: HashMap<UserId, SessionView>,
    /// Identity id → attached sessions, in join order.
    live: HashMap<UserId, Vec<SessionOutbound>>,
    #[cfg(test)]
    part_waiters: HashMap<SessionId, tokio::sync::oneshot::Sender<()>>,
}

/// A nexus of communication. Sessions connect to a room and interact.
pub struct Room {
    record: RoomRecord,
    kind: RoomKind,
    backend: Arc<dyn Backend>,
    kms: Arc<dyn Kms>,
    ids: Arc<IdGenerator>,
    server: PeerDesc,
    cluster: Arc<dyn Cluster>,
    /// Per-room sequence for cross-server event ordering.
    seq: AtomicU64,
    /// Serializes commit+broadcast so all sessions observe mutations in
    /// commit order.
    mutation: tokio::sync::Mutex<()>,
    inner: Mutex<RoomState>,
}

impl Room {
    pub fn new(
        record: RoomRecord,
        kind: RoomKind,
        backend: Arc<dyn Backend>,
        kms: Arc<dyn Kms>,
        ids: Arc<IdGenerator>,
        server: PeerDesc,
        cluster: Arc<dyn Cluster>,
    ) -> Arc<Self> {
        Arc::new(Self {
            record,
            kind,
            backend,
            kms,
            ids,
            server,
            cluster,
            seq: AtomicU64::new(0),
            mutation: tokio::sync::Mutex::new(()),
            inner: Mutex::new(RoomState::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn record(&self) -> &RoomRecord {
        &self.record
    }

    pub fn version(&self) -> String {
        self.backend.version()
    }

    /// The id of the key a session must hold to join, if any.
    pub async fn required_key_id(&self) -> Result<Option<String>> {
        match &self.kind {
            RoomKind::Pm { key_id, .. } => Ok(Some(key_id.clone())),
            RoomKind::Public => Ok(self
                .backend
                .room_message_key(&self.record.name)
                .await?
                .map(|key| key.key_id.to_string())),
        }
    }

    /// Insert a session into the room's presence.
    pub async fn join(
        &self,
        view: &SessionView,
        tx: mpsc::Sender<ParsedPacket>,
        agent: &Agent,
        client_ip: Option<&str>,
    ) -> Result<()> {
        let name = self.record.name.clone();

        if self.backend.agent_banned(&name, &view.id.0).await? {
            return Err(Error::AccessDenied);
        }
        if let Some(ip) = client_ip {
            if self.backend.ip_banned(&name, ip).await? {
                return Err(Error::AccessDenied);
            }
        }
        if self.record.min_agent_age_secs > 0 && agent.age_secs() < self.record.min_agent_age_secs
        {
            return Err(Error::AccessDenied);
        }

        let _guard = self.mutation.lock().await;

        self.backend
            .store_presence(&PresenceRow::new(&name, view))
            .await?;

        let first_for_identity = {
            let mut state = self.inner.lock();
            let sessions = state.live.entry(view.id.clone()).or_default();
            let first = sessions.is_empty();
            sessions.push(SessionOutbound {
                session_id: view.session_id.clone(),
                tx,
            });
            if first {
                state.identities.insert(view.id.clone(), view.clone());
            }
            first
        };

        if first_for_identity {
            self.broadcast(
                Data::from(JoinEvent(view.clone())),
                &[&view.session_id],
            )
            .await?;
        }

        debug!("{name}: {} joined", view.session_id);
        Ok(())
    }

    /// Remove a session from the room's presence.
    pub async fn part(&self, view: &SessionView) -> Result<()> {
        let name = self.record.name.clone();
        let _guard = self.mutation.lock().await;

        self.backend
            .remove_presence(&name, &view.session_id)
            .await?;

        let last_for_identity = {
            let mut state = self.inner.lock();
            let last = match state.live.get_mut(&view.id) {
                Some(sessions) => {
                    sessions.retain(|s| s.session_id != view.session_id);
                    sessions.is_empty()
                }
                None => false,
            };
            if last {
                state.live.remove(&view.id);
                state.identities.remove(&view.id);
            }
            #[cfg(test)]
            if let Some(waiter) = state.part_waiters.remove(&view.session_id) {
                let _ = waiter.send(());
            }
            last
        };

        if last_for_identity {
            self.broadcast(Data::from(PartEvent(view.clone())), &[&view.session_id])
                .await?;
        }

        debug!("{name}: {} parted", view.session_id);
        Ok(())
    }

    /// Whether the message with the given id is able to be replied to.
    pub async fn is_valid_parent(&self, id: MessageId) -> Result<bool> {
        self.backend.is_valid_parent(&self.record.name, id).await
    }

    /// Broadcast a message from a session to the room.
    ///
    /// Assigns the message id, applies the room's current message key if
    /// present, persists, and fans out a send event. Returns the stored
    /// message.
    pub async fn send(
        &self,
        sender: &SessionView,
        content: String,
        parent: Option<MessageId>,
    ) -> Result<Message> {
        if let Some(parent) = parent {
            if !self.is_valid_parent(parent).await? {
                return Err(Error::MessageNotFound);
            }
        }

        let _guard = self.mutation.lock().await;

        let mut msg = Message {
            id: MessageId(self.ids.next()),
            parent,
            previous_edit_id: None,
            time: Time::now(),
            sender: sender.clone(),
            content,
            encryption_key_id: None,
            edited: None,
            deleted: None,
        };

        match &self.kind {
            RoomKind::Pm { key_id, key } => encrypt_message(&mut msg, key_id, key)?,
            RoomKind::Public => {
                if let Some(mkey) = self.backend.room_message_key(&self.record.name).await? {
                    let mut key = mkey.key.clone();
                    self.kms.decrypt_key(&mut key)?;
                    encrypt_message(&mut msg, &mkey.key_id.to_string(), &key)?;
                }
            }
        }

        self.backend.save_message(&self.record.name, &msg).await?;

        self.broadcast(Data::from(SendEvent(msg.clone())), &[&sender.session_id])
            .await?;

        Ok(msg)
    }

    /// Modify or delete a message.
    pub async fn edit_message(
        &self,
        session: &SessionView,
        cmd: &EditMessage,
    ) -> Result<EditMessageReply> {
        let edit_id = self.ids.next();

        let _guard = self.mutation.lock().await;

        let msg = self
            .backend
            .edit_message(&self.record.name, edit_id, Some(session.id.clone()), cmd)
            .await?;

        if cmd.announce {
            self.broadcast(
                Data::from(EditMessageEvent {
                    edit_id,
                    message: msg.clone(),
                }),
                &[&session.session_id],
            )
            .await?;
        }

        Ok(EditMessageReply {
            edit_id,
            deleted: msg.deleted.is_some(),
            message: msg,
        })
    }

    /// The latest messages, honoring retention.
    pub async fn latest(&self, n: usize, before: Option<MessageId>) -> Result<Vec<Message>> {
        self.backend.latest(&self.record.name, n, before).await
    }

    /// A single message, honoring retention.
    pub async fn get_message(&self, id: MessageId) -> Result<Message> {
        self.backend.get_message(&self.record.name, id).await
    }

    /// The current global list of sessions connected to this room, across
    /// all live peers.
    pub async fn listing(&self) -> Result<Vec<SessionView>> {
        let live: Vec<PeerIdentity> = self
            .cluster
            .peers()
            .into_iter()
            .map(|peer| PeerIdentity {
                server_id: peer.id,
                server_era: peer.era,
            })
            .collect();

        let mut listing: Vec<SessionView> = self
            .backend
            .room_presence(&self.record.name, &live)
            .await?
            .into_iter()
            .map(|presence| presence.session_view)
            .collect();

        listing.sort_by(|a, b| {
            (&a.name, &a.id, &a.session_id).cmp(&(&b.name, &b.id, &b.session_id))
        });
        Ok(listing)
    }

    /// Update the nickname of a session in this room.
    pub async fn rename_user(
        &self,
        session: &SessionView,
        former_name: &str,
    ) -> Result<NickEvent> {
        let _guard = self.mutation.lock().await;

        self.backend
            .update_presence(&PresenceRow::new(&self.record.name, session))
            .await?;

        {
            let mut state = self.inner.lock();
            if let Some(view) = state.identities.get_mut(&session.id) {
                view.name = session.name.clone();
            }
        }

        let event = NickEvent {
            session_id: session.session_id.clone(),
            id: session.id.clone(),
            from: former_name.to_string(),
            to: session.name.clone(),
        };
        self.broadcast(Data::from(event.clone()), &[&session.session_id])
            .await?;
        Ok(event)
    }

    /// Ban an identity from the room. `None` means a permanent ban.
    pub async fn ban_agent(&self, agent_id: &str, until: Option<Time>) -> Result<()> {
        let _guard = self.mutation.lock().await;
        self.backend
            .ban_agent(Some(&self.record.name), agent_id, until)
            .await?;
        self.broadcast(
            Data::from(BounceEvent {
                reason: Some("banned".to_string()),
                auth_options: Vec::new(),
                agent_id: Some(agent_id.to_string()),
                ip: None,
            }),
            &[],
        )
        .await
    }

    pub async fn unban_agent(&self, agent_id: &str) -> Result<()> {
        self.backend
            .unban_agent(Some(&self.record.name), agent_id)
            .await
    }

    /// Ban an IP from the room. `None` means a permanent ban.
    pub async fn ban_ip(&self, ip: &str, until: Option<Time>) -> Result<()> {
        let _guard = self.mutation.lock().await;
        self.backend.ban_ip(Some(&self.record.name), ip, until).await?;
        self.broadcast(
            Data::from(BounceEvent {
                reason: Some("banned".to_string()),
                auth_options: Vec::new(),
                agent_id: None,
                ip: Some(ip.to_string()),
            }),
            &[],
        )
        .await
    }

    pub async fn unban_ip(&self, ip: &str) -> Result<()> {
        self.backend.unban_ip(Some(&self.record.name), ip).await
    }

    /// Generate and activate a new message key for the room.
    ///
    /// This invalidates all passcode grants made with the previous key.
    pub async fn generate_master_key(&self) -> Result<RoomMessageKey> {
        let key_id = self.ids.next();
        let key = RoomMessageKey::generate(self.kms.as_ref(), &self.record.name, key_id)?;
        self.backend
            .activate_room_message_key(&self.record.name, &key)
            .await?;
        Ok(key)
    }

    /// The room's current message key, or `None` if the room is unlocked.
    pub async fn message_key(&self) -> Result<Option<RoomMessageKey>> {
        self.backend.room_message_key(&self.record.name).await
    }

    pub async fn save_capability(&self, capability: &Capability) -> Result<()> {
        self.backend
            .save_capability(&self.record.name, capability)
            .await
    }

    pub async fn get_capability(&self, id: &str) -> Result<Option<Capability>> {
        self.backend.get_capability(&self.record.name, id).await
    }

    /// Accounts holding unrevoked manager grants for this room.
    pub async fn managers(&self) -> Result<Vec<Account>> {
        self.backend.managers(&self.record.name).await
    }

    /// The manager grant held by the given account.
    pub async fn manager_capability(&self, manager: &Account) -> Result<Capability> {
        self.backend
            .manager_capability(&self.record.name, manager.id)
            .await
    }

    /// Grant the room's manager key to a new account.
    ///
    /// The actor proves authority by opening their own grant with their
    /// unlocked account key.
    pub async fn add_manager(
        &self,
        actor: &Account,
        actor_key: &ManagedKey,
        new_manager: &Account,
    ) -> Result<()> {
        let actor_kp = actor.unlock(actor_key)?;
        let capability = match self
            .backend
            .manager_capability(&self.record.name, actor.id)
            .await
        {
            Ok(capability) => capability,
            Err(Error::ManagerNotFound | Error::CapabilityNotFound) => {
                return Err(Error::AccessDenied)
            }
            Err(err) => return Err(err),
        };

        let (kek, room_kp) =
            crate::backend::open_manager_grant(&self.record, &actor_kp, &capability)?;
        let grant =
            crate::backend::seal_manager_grant(&self.record, &room_kp, &kek, new_manager)?;
        self.backend
            .save_manager_capability(&self.record.name, new_manager.id, &grant)
            .await
    }

    /// Revoke an account's manager grant, on the authority of an acting
    /// manager.
    pub async fn remove_manager(
        &self,
        actor: &Account,
        actor_key: &ManagedKey,
        former_manager: &Account,
    ) -> Result<()> {
        self.backend
            .remove_manager(&self.record, actor, actor_key, former_manager.id)
            .await
    }

    /// Emit one event to every attached session except `exclude`, and
    /// forward it to the other servers hosting this room.
    async fn broadcast(&self, data: Data, exclude: &[&SessionId]) -> Result<()> {
        let packet = ParsedPacket::from_data(None, data);

        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let envelope = RoomEventEnvelope {
            room: self.record.name.clone(),
            server_id: self.server.id.clone(),
            server_era: self.server.era.clone(),
            seq,
            packet: packet.clone().into_packet().map_err(Error::MalformedPacket)?,
        };
        let key = RoomEventEnvelope::key(&self.record.name);
        let value = serde_json::to_string(&envelope).map_err(Error::MalformedPacket)?;
        self.cluster.set_value(&key, value).await?;

        self.broadcast_local(&packet, exclude);
        Ok(())
    }

    /// Deliver a packet to every locally attached session except
    /// `exclude`.
    ///
    /// Delivery is non-blocking: a session whose outbound channel is full
    /// loses its place in the room and is disconnected, preserving the
    /// "events are ordered or you're gone" guarantee.
    pub(crate) fn broadcast_local(&self, packet: &ParsedPacket, exclude: &[&SessionId]) {
        let mut state = self.inner.lock();

        let mut dropped = Vec::new();
        for sessions in state.live.values() {
            for outbound in sessions {
                if exclude.contains(&&outbound.session_id) {
                    continue;
                }
                if outbound.tx.try_send(packet.clone()).is_err() {
                    dropped.push(outbound.session_id.clone());
                }
            }
        }

        for session_id in dropped {
            warn!(
                "{}: dropping slow session {session_id}",
                self.record.name
            );
            for sessions in state.live.values_mut() {
                // Dropping the sender closes the session's event stream;
                // its run loop tears the connection down and parts.
                sessions.retain(|s| s.session_id != session_id);
            }
        }
    }

    /// Wait until the session with the given id has fully parted.
    #[cfg(test)]
    pub(crate) async fn wait_for_part(&self, session_id: &SessionId) {
        let rx = {
            let mut state = self.inner.lock();
            let present = state
                .live
                .values()
                .any(|sessions| sessions.iter().any(|s| &s.session_id == session_id));
            if !present {
                return;
            }
            let (tx, rx) = tokio::sync::oneshot::channel();
            state.part_waiters.insert(session_id.clone(), tx);
            rx
        };
        let _ = rx.await;
    }

    #[cfg(test)]
    pub(crate) fn snapshot_presence(
        &self,
    ) -> (HashMap<UserId, SessionView>, HashMap<UserId, Vec<SessionId>>) {
        let state = self.inner.lock();
        let live = state
            .live
            .iter()
            .map(|(id, sessions)| {
                (
                    id.clone(),
                    sessions.iter().map(|s| s.session_id.clone()).collect(),
                )
            })
            .collect();
        (state.identities.clone(), live)
    }
}

/// Encrypt a message's content in place under a room message key.
///
/// The message id doubles as the AEAD nonce; this is safe exactly because
/// snowflakes never repeat under the generator's clock+server invariant.
/// The sender identity binds the ciphertext as associated data.
pub(crate) fn encrypt_message(msg: &mut Message, key_id: &str, key: &ManagedKey) -> Result<()> {
    if key.encrypted() {
        return Err(Error::KeyMustBeDecrypted);
    }

    let nonce = msg.id.to_string();
    let (tag, ciphertext) = encrypt_gcm(
        key,
        nonce.as_bytes(),
        msg.content.as_bytes(),
        msg.sender.id.0.as_bytes(),
    )?;

    msg.content = format!("{}/{}", URL_SAFE.encode(tag), URL_SAFE.encode(ciphertext));
    msg.encryption_key_id = Some(key_id.to_string());
    Ok(())
}

/// Decrypt a message's content in place with the keys a session holds.
///
/// Returns false, leaving the message untouched, if the session holds no
/// key for it.
pub(crate) fn decrypt_message(
    msg: &mut Message,
    keys: &HashMap<String, ManagedKey>,
) -> Result<bool> {
    let Some(key_id) = &msg.encryption_key_id else {
        return Ok(true);
    };
    let Some(key) = keys.get(key_id) else {
        return Ok(false);
    };

    let (tag, ciphertext) = msg
        .content
        .split_once('/')
        .ok_or_else(|| Error::Crypto("message corrupted".to_string()))?;
    let tag = URL_SAFE
        .decode(tag)
        .map_err(|e| Error::Crypto(format!("message corrupted: {e}")))?;
    let ciphertext = URL_SAFE
        .decode(ciphertext)
        .map_err(|e| Error::Crypto(format!("message corrupted: {e}")))?;

    let nonce = msg.id.to_string();
    let plaintext = decrypt_gcm(
        key,
        nonce.as_bytes(),
        &tag,
        &ciphertext,
        msg.sender.id.0.as_bytes(),
    )?;

    msg.content = String::from_utf8(plaintext)
        .map_err(|_| Error::Crypto("message corrupted".to_string()))?;
    msg.encryption_key_id = None;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TestBackend;
    use crate::cluster::{ClusterFabric, LocalCluster};
    use crate::security::kms::LocalKms;

    fn test_server() -> PeerDesc {
        PeerDesc {
            id: "test".into(),
            era: "era1".into(),
            version: "testver".into(),
        }
    }

    async fn test_room(name: &str) -> Arc<Room> {
        let kms: Arc<dyn Kms> = Arc::new(LocalKms::generate());
        let ids = Arc::new(IdGenerator::new(1));
        let backend: Arc<dyn Backend> =
            Arc::new(TestBackend::new("testver", ids.clone()));
        let record = backend
            .create_room(kms.as_ref(), false, name, &[])
            .await
            .unwrap();
        let cluster: Arc<dyn Cluster> =
            Arc::new(LocalCluster::attach(ClusterFabric::new(), test_server()));
        Room::new(
            record,
            RoomKind::Public,
            backend,
            kms,
            ids,
            test_server(),
            cluster,
        )
    }

    struct TestSession {
        view: SessionView,
        agent: Agent,
        rx: mpsc::Receiver<ParsedPacket>,
    }

    impl TestSession {
        fn new(identity: &str, session_id: &str) -> (Self, mpsc::Sender<ParsedPacket>) {
            let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
            let view = SessionView {
                id: UserId(identity.to_string()),
                name: "guest".into(),
                server_id: "test".into(),
                server_era: "era1".into(),
                session_id: SessionId(session_id.to_string()),
                is_staff: false,
                is_manager: false,
            };
            (
                Self {
                    view,
                    agent: Agent::new(identity),
                    rx,
                },
                tx,
            )
        }

        fn drain(&mut self) -> Vec<ParsedPacket> {
            let mut packets = Vec::new();
            while let Ok(packet) = self.rx.try_recv() {
                packets.push(packet);
            }
            packets
        }
    }

    async fn join(room: &Room, session: &TestSession, tx: mpsc::Sender<ParsedPacket>) {
        room.join(&session.view, tx, &session.agent, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn room_presence() {
        let room = test_room("presence").await;

        let (mut a, a_tx) = TestSession::new("agent:A", "A-1");
        let (b, b_tx) = TestSession::new("agent:B", "B-1");
        let (a2, a2_tx) = TestSession::new("agent:A", "A-2");

        // First join.
        join(&room, &a, a_tx).await;
        let (identities, live) = room.snapshot_presence();
        assert_eq!(identities.len(), 1);
        assert_eq!(live[&a.view.id], vec![a.view.session_id.clone()]);

        // Second join.
        join(&room, &b, b_tx).await;
        let (identities, live) = room.snapshot_presence();
        assert!(identities.contains_key(&b.view.id));
        assert_eq!(live[&b.view.id], vec![b.view.session_id.clone()]);

        // Duplicate join for the same identity.
        join(&room, &a2, a2_tx).await;
        let (_, live) = room.snapshot_presence();
        assert_eq!(
            live[&a.view.id],
            vec![a.view.session_id.clone(), a2.view.session_id.clone()]
        );

        // Identity stays present while one session remains.
        room.part(&a.view).await.unwrap();
        let (identities, live) = room.snapshot_presence();
        assert!(identities.contains_key(&a.view.id));
        assert_eq!(live[&a.view.id], vec![a2.view.session_id.clone()]);

        // Last session out removes the identity.
        room.part(&a2.view).await.unwrap();
        room.part(&b.view).await.unwrap();
        let (identities, live) = room.snapshot_presence();
        assert!(identities.is_empty());
        assert!(live.is_empty());

        // Everyone is gone from the durable listing too.
        assert!(room.listing().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn room_broadcast_excludes_sender() {
        let room = test_room("broadcast").await;

        let (mut a, a_tx) = TestSession::new("agent:A", "A-1");
        let (mut b, b_tx) = TestSession::new("agent:B", "B-1");
        let (mut c, c_tx) = TestSession::new("agent:C", "C-1");

        join(&room, &a, a_tx).await;
        join(&room, &b, b_tx).await;
        join(&room, &c, c_tx).await;

        // A saw B and C join; B saw C join; C saw nothing.
        assert_eq!(a.drain().len(), 2);
        assert_eq!(b.drain().len(), 1);
        assert_eq!(c.drain().len(), 0);

        let msg = room.send(&a.view, "1".into(), None).await.unwrap();
        assert_eq!(msg.content, "1");

        assert!(a.drain().is_empty());
        for session in [&mut b, &mut c] {
            let packets = session.drain();
            assert_eq!(packets.len(), 1);
            match packets[0].content.as_ref().unwrap() {
                Data::SendEvent(event) => assert_eq!(event.0.content, "1"),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn send_events_are_ordered() {
        let room = test_room("ordering").await;

        let (a, a_tx) = TestSession::new("agent:A", "A-1");
        let (mut b, b_tx) = TestSession::new("agent:B", "B-1");
        join(&room, &a, a_tx).await;
        join(&room, &b, b_tx).await;
        b.drain();

        for i in 0..10 {
            room.send(&a.view, format!("{i}"), None).await.unwrap();
        }

        let contents: Vec<String> = b
            .drain()
            .into_iter()
            .filter_map(|packet| match packet.content.ok()? {
                Data::SendEvent(event) => Some(event.0.content),
                _ => None,
            })
            .collect();
        assert_eq!(
            contents,
            (0..10).map(|i| i.to_string()).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn slow_sessions_are_dropped() {
        let room = test_room("backpressure").await;

        let (a, a_tx) = TestSession::new("agent:A", "A-1");
        // B gets a tiny channel and never drains it.
        let (b_tx, _b_rx) = mpsc::channel(1);
        let (b, _) = TestSession::new("agent:B", "B-1");
        join(&room, &a, a_tx).await;
        room.join(&b.view, b_tx, &b.agent, None).await.unwrap();

        room.send(&a.view, "1".into(), None).await.unwrap();
        room.send(&a.view, "2".into(), None).await.unwrap();

        let (_, live) = room.snapshot_presence();
        assert!(!live.contains_key(&b.view.id) || live[&b.view.id].is_empty());
    }

    #[tokio::test]
    async fn banned_identities_bounce_on_join() {
        let room = test_room("banhammer").await;

        let (a, a_tx) = TestSession::new("agent:A", "A-1");
        room.ban_agent("agent:A", None).await.unwrap();
        let err = room.join(&a.view, a_tx, &a.agent, None).await.unwrap_err();
        assert!(matches!(err, Error::AccessDenied));

        room.unban_agent("agent:A").await.unwrap();
        let (_, a_tx) = TestSession::new("agent:A", "A-1");
        room.join(&a.view, a_tx, &a.agent, None).await.unwrap();
    }

    #[tokio::test]
    async fn message_encryption_round_trips() {
        let room = test_room("sekrit").await;
        let key = room.generate_master_key().await.unwrap();

        let (a, a_tx) = TestSession::new("agent:A", "A-1");
        join(&room, &a, a_tx).await;

        let stored = room.send(&a.view, "attack at dawn".into(), None).await.unwrap();
        assert!(stored.encrypted());
        assert_ne!(stored.content, "attack at dawn");

        // A session holding the key can read it back.
        let mkey = room.message_key().await.unwrap().unwrap();
        assert_eq!(mkey.key_id, key.key_id);
        let mut plain = mkey.key;
        room.kms.decrypt_key(&mut plain).unwrap();
        let mut keys = HashMap::new();
        keys.insert(key.key_id.to_string(), plain);

        let mut msg = stored.clone();
        assert!(decrypt_message(&mut msg, &keys).unwrap());
        assert_eq!(msg.content, "attack at dawn");

        // Without the key the message stays sealed.
        let mut msg = stored;
        assert!(!decrypt_message(&mut msg, &HashMap::new()).unwrap());
        assert!(msg.encrypted());
    }

    #[tokio::test]
    async fn wait_for_part_returns_after_part() {
        let room = test_room("waiters").await;
        let (a, a_tx) = TestSession::new("agent:A", "A-1");
        join(&room, &a, a_tx).await;

        let waiter = {
            let room = room.clone();
            let session_id = a.view.session_id.clone();
            tokio::spawn(async move { room.wait_for_part(&session_id).await })
        };

        room.part(&a.view).await.unwrap();
        waiter.await.unwrap();
    }
}
