//! Service assembly and the transport acceptor.
//!
//! A [`Service`] owns the handles everything else borrows: config, KMS,
//! cluster, backend, id generator, and the arena of live rooms indexed by
//! name. The process entry point is the only place that assembles one.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use cookie::Cookie;
use futures_util::SinkExt;
use hmac::{Hmac, Mac};
use log::{info, warn};
use parking_lot::Mutex;
use sha2::Sha256;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::account::{
    check_email_verification_token, check_password_reset_confirmation, confirmation_account,
    email_verification_token, password_reset_confirmation,
};
use crate::api::{
    DisconnectEvent, NetworkEvent, ParsedPacket, SessionId, SessionView, Time,
};
use crate::auth::Authorization;
use crate::backend::{Agent, Backend, RoomRecord};
use crate::cluster::{Cluster, ClusterEvent, EventOrder, PeerDesc, RoomEventEnvelope};
use crate::config::ServerConfig;
use crate::room::{Room, RoomKind};
use crate::security::kms::Kms;
use crate::security::{constant_time_eq, random_bytes, ManagedKey, CLIENT_KEY_TYPE};
use crate::session::{run_session, Client, SessionContext};
use crate::snowflake::{IdGenerator, Snowflake};
use crate::{Error, Result};

/// Subprotocol token echoed to clients that offer it.
const SUBPROTOCOL: &str = "heim1";

/// Name of the agent cookie.
const AGENT_COOKIE: &str = "a";

/// How long email verification tokens stay valid.
const VERIFICATION_TOKEN_TTL_SECS: i64 = 3 * 24 * 3600;

/// How long password reset confirmations stay valid.
const RESET_CONFIRMATION_TTL_SECS: i64 = 3600;

/// The assembled service.
pub struct Service {
    pub config: ServerConfig,
    pub kms: Arc<dyn Kms>,
    pub cluster: Arc<dyn Cluster>,
    pub backend: Arc<dyn Backend>,
    pub ids: Arc<IdGenerator>,
    server: PeerDesc,
    /// MAC key authenticating agent cookies. Drawn per boot; cookies are
    /// re-issued when they fail to verify.
    agent_mac_key: Vec<u8>,
    rooms: Mutex<HashMap<String, Arc<Room>>>,
    order: Mutex<EventOrder>,
    shutdown_tx: watch::Sender<bool>,
    shutdown: watch::Receiver<bool>,
}

impl Service {
    /// Assemble the service and start its cluster watcher.
    ///
    /// Deletes this server's presence rows from prior eras before
    /// accepting anything.
    pub async fn start(
        config: ServerConfig,
        kms: Arc<dyn Kms>,
        cluster: Arc<dyn Cluster>,
        backend: Arc<dyn Backend>,
        ids: Arc<IdGenerator>,
        server: PeerDesc,
    ) -> Result<Arc<Self>> {
        backend.purge_other_eras(&server.id, &server.era).await?;

        let (shutdown_tx, shutdown) = watch::channel(false);
        // Subscribe before anything can publish, so no event is missed.
        let watch_rx = cluster.watch();
        let service = Arc::new(Self {
            config,
            kms,
            cluster,
            backend,
            ids,
            server,
            agent_mac_key: random_bytes(32),
            rooms: Mutex::new(HashMap::new()),
            order: Mutex::new(EventOrder::new()),
            shutdown_tx,
            shutdown,
        });

        tokio::spawn(service.clone().watch_cluster(watch_rx));
        Ok(service)
    }

    pub fn server(&self) -> &PeerDesc {
        &self.server
    }

    /// Signal every session to drain and close.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.cluster.part().await;
    }

    pub fn session_context(&self) -> SessionContext {
        SessionContext {
            backend: self.backend.clone(),
            kms: self.kms.clone(),
            ids: self.ids.clone(),
            server: self.server.clone(),
            ping_interval: Duration::from_secs(self.config.ping_interval_secs.max(1)),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Accept connections until shutdown.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("serving era {} on {}", self.server.era, listener.local_addr()?);
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    tokio::spawn(self.clone().on_conn(stream, addr));
                }
            }
        }
        Ok(())
    }

    async fn on_conn(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        info!("<{addr}> connected");
        if let Err(err) = self.handle_conn(stream, addr).await {
            warn!("<{addr}> error: {err}");
        }
        info!("<{addr}> disconnected");
    }

    async fn handle_conn(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        // Minting a fresh agent cookie is pure, so a candidate can be
        // prepared before the handshake and issued inside the upgrade
        // callback if the client did not present a valid one.
        let candidate = AgentCookie::new();
        let candidate_value = candidate.encode(&self.agent_mac_key);

        let mut routed: Option<(String, String)> = None;
        let mut presented: Option<AgentCookie> = None;

        let mac_key = self.agent_mac_key.clone();
        let ws = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &Request, mut resp: Response| {
                match parse_room_path(req.uri().path()) {
                    Some(parts) => routed = Some(parts),
                    None => {
                        let mut not_found =
                            ErrorResponse::new(Some("404 page not found".to_string()));
                        *not_found.status_mut() = StatusCode::NOT_FOUND;
                        return Err(not_found);
                    }
                }

                presented = req
                    .headers()
                    .get(header::COOKIE)
                    .and_then(|value| value.to_str().ok())
                    .and_then(find_agent_cookie)
                    .and_then(|value| AgentCookie::decode(&value, &mac_key));

                let offers_subprotocol = req
                    .headers()
                    .get(header::SEC_WEBSOCKET_PROTOCOL)
                    .and_then(|value| value.to_str().ok())
                    .is_some_and(|value| value.split(',').any(|p| p.trim() == SUBPROTOCOL));
                if offers_subprotocol {
                    resp.headers_mut().append(
                        header::SEC_WEBSOCKET_PROTOCOL,
                        HeaderValue::from_static(SUBPROTOCOL),
                    );
                }

                if presented.is_none() {
                    let cookie = Cookie::build((AGENT_COOKIE, candidate_value.clone()))
                        .path("/")
                        .http_only(true)
                        .build();
                    if let Ok(value) = HeaderValue::from_str(&cookie.to_string()) {
                        resp.headers_mut().append(header::SET_COOKIE, value);
                    }
                }

                Ok(resp)
            },
        )
        .await?;

        let (prefix, name) = routed.ok_or(Error::RoomNotFound)?;
        let cookie = presented.unwrap_or(candidate);

        // Load or create the agent behind the cookie.
        let agent_key = ManagedKey::from_plaintext(CLIENT_KEY_TYPE, cookie.nonce.clone());
        let agent = match self.backend.get_agent(&cookie.agent_id).await? {
            Some(agent) => agent,
            None => {
                let agent = Agent::new(&cookie.agent_id);
                self.backend.register_agent(&agent).await?;
                agent
            }
        };

        let mut client = Client {
            agent,
            agent_key,
            ip: Some(addr.ip().to_string()),
            authorization: Authorization::default(),
        };

        // Bind the agent's account to the connection if its stored key
        // still unlocks it.
        if let Some(account_id) = client.agent.account_id {
            match self.authenticate_agent(&mut client, account_id).await {
                Ok(()) => {}
                Err(Error::AccessDenied) => {
                    client.authorization = Authorization::default();
                }
                Err(err) => return Err(err),
            }
        }
        if client.authorization.client_key.is_none() {
            // Anonymous agents use their cookie secret as the client key,
            // so PM key copies can be wrapped for them.
            client.authorization.client_key = Some(client.agent_key.clone());
        }

        let room = match self.resolve_room(&prefix, &name, &mut client).await {
            Ok(room) => room,
            Err(err) => {
                let mut ws = ws;
                let reason = err.to_string();
                if let Ok(packet) =
                    ParsedPacket::from_data(None, DisconnectEvent { reason }).into_packet()
                {
                    if let Ok(text) = serde_json::to_string(&packet) {
                        let _ = ws.send(WsMessage::Text(text)).await;
                    }
                }
                let _ = ws.close(None).await;
                return Err(err);
            }
        };

        let view = self.session_view(room.name(), &client).await;
        run_session(self.session_context(), room, client, view, ws).await
    }

    async fn session_view(&self, room_name: &str, client: &Client) -> SessionView {
        let (is_staff, is_manager) = match &client.authorization.account {
            Some(account) => (
                account.is_staff(),
                self.backend
                    .manager_capability(room_name, account.id)
                    .await
                    .is_ok(),
            ),
            None => (false, false),
        };

        SessionView {
            id: client.user_id(),
            name: String::new(),
            server_id: self.server.id.clone(),
            server_era: self.server.era.clone(),
            session_id: SessionId(format!(
                "{}-{}",
                self.server.id,
                hex::encode(random_bytes(4))
            )),
            is_staff,
            is_manager,
        }
    }

    async fn authenticate_agent(&self, client: &mut Client, account_id: Snowflake) -> Result<()> {
        let account = match self.backend.get_account(account_id).await {
            Ok(account) => account,
            Err(Error::AccountNotFound) => return Err(Error::AccessDenied),
            Err(err) => return Err(err),
        };

        let client_key = self
            .backend
            .agent_client_key(&client.agent.id, &client.agent_key)
            .await?
            .ok_or(Error::AccessDenied)?;

        account.unlock(&client_key)?;

        client.authorization.account = Some(account);
        client.authorization.client_key = Some(client_key);
        Ok(())
    }

    /// The live room for a name, loading or creating it as configured.
    pub async fn room(&self, name: &str) -> Result<Arc<Room>> {
        if let Some(room) = self.rooms.lock().get(name) {
            return Ok(room.clone());
        }

        let record = match self.backend.get_room(name).await {
            Ok(record) => record,
            Err(Error::RoomNotFound) if self.config.allow_room_creation => {
                self.backend
                    .create_room(self.kms.as_ref(), false, name, &[])
                    .await?
            }
            Err(err) => return Err(err),
        };

        Ok(self.materialize(record, RoomKind::Public))
    }

    /// The live room for a PM, unwrapping the caller's key copy.
    pub async fn pm_room(&self, pm_id: Snowflake, client: &mut Client) -> Result<Arc<Room>> {
        let mut pm = self.backend.get_pm(pm_id).await?;
        let (key, modified) = pm.access(self.kms.as_ref(), client)?;
        if modified {
            self.backend.update_pm_receiver_key(&pm).await?;
        }
        client.authorization.add_message_key(&pm.key_id(), key.clone());

        let name = pm.room_name();
        if let Some(room) = self.rooms.lock().get(&name) {
            return Ok(room.clone());
        }

        let record = match self.backend.get_room(&name).await {
            Ok(record) => record,
            Err(Error::RoomNotFound) => {
                self.backend
                    .create_room(self.kms.as_ref(), false, &name, &[])
                    .await?
            }
            Err(err) => return Err(err),
        };

        Ok(self.materialize(
            record,
            RoomKind::Pm {
                key_id: pm.key_id(),
                key,
            },
        ))
    }

    fn materialize(&self, record: RoomRecord, kind: RoomKind) -> Arc<Room> {
        let name = record.name.clone();
        let room = Room::new(
            record,
            kind,
            self.backend.clone(),
            self.kms.clone(),
            self.ids.clone(),
            self.server.clone(),
            self.cluster.clone(),
        );
        self.rooms
            .lock()
            .entry(name)
            .or_insert(room)
            .clone()
    }

    /// Route a websocket path to a room.
    pub async fn resolve_room(
        &self,
        prefix: &str,
        name: &str,
        client: &mut Client,
    ) -> Result<Arc<Room>> {
        match prefix {
            "pm:" => {
                let pm_id: Snowflake = name.parse().map_err(|_| Error::RoomNotFound)?;
                self.pm_room(pm_id, client).await
            }
            "" => self.room(name).await,
            _ => Err(Error::RoomNotFound),
        }
    }

    async fn watch_cluster(self: Arc<Self>, mut rx: broadcast::Receiver<ClusterEvent>) {
        loop {
            match rx.recv().await {
                Ok(ClusterEvent::ValueSet { key, value }) if key.starts_with("events/") => {
                    self.forward_event(&value);
                }
                Ok(ClusterEvent::ValueSet { .. }) => {}
                Ok(ClusterEvent::PeerLost { peer }) => {
                    if let Err(err) = self.handle_partition(&peer).await {
                        warn!("partition handling error: {err}");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("cluster watch lagged by {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
            if *self.shutdown.borrow() {
                break;
            }
        }
    }

    /// Deliver a cross-server room event to local sessions, strictly in
    /// per-stream sequence order.
    fn forward_event(&self, value: &str) {
        let envelope: RoomEventEnvelope = match serde_json::from_str(value) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!("malformed cluster event: {err}");
                return;
            }
        };
        if envelope.server_id == self.server.id && envelope.server_era == self.server.era {
            return;
        }

        let ready = self.order.lock().accept(envelope);
        for envelope in ready {
            let room = self.rooms.lock().get(&envelope.room).cloned();
            let Some(room) = room else { continue };
            match ParsedPacket::from_packet(envelope.packet) {
                Ok(packet) => room.broadcast_local(&packet, &[]),
                Err(err) => warn!("malformed forwarded packet: {err}"),
            }
        }
    }

    /// Tell every room a lost peer touched that its sessions are gone.
    async fn handle_partition(&self, peer: &PeerDesc) -> Result<()> {
        let affected = self
            .backend
            .rooms_touched_by(&peer.id, &peer.era)
            .await?;
        let packet = ParsedPacket::from_data(
            None,
            NetworkEvent {
                r#type: "partition".to_string(),
                server_id: peer.id.clone(),
                server_era: peer.era.clone(),
            },
        );
        for name in affected {
            let room = self.rooms.lock().get(&name).cloned();
            if let Some(room) = room {
                room.broadcast_local(&packet, &[]);
            }
        }
        Ok(())
    }

    // Account maintenance entry points consumed by the HTTP front-end
    // collaborator.

    /// Mint a verification token for the account registered under the
    /// email address.
    pub async fn issue_email_verification(&self, email: &str) -> Result<(String, Time)> {
        let account = self.backend.resolve_account("email", email).await?;
        let mut kek = account.security.system_key.clone();
        self.kms.decrypt_key(&mut kek)?;
        let expires = Time(Time::now().0 + VERIFICATION_TOKEN_TTL_SECS);
        Ok((email_verification_token(&kek, email, expires)?, expires))
    }

    /// Verify an email address with a previously issued token.
    pub async fn verify_email(&self, email: &str, expires: Time, token: &str) -> Result<()> {
        let account = self.backend.resolve_account("email", email).await?;
        let mut kek = account.security.system_key.clone();
        self.kms.decrypt_key(&mut kek)?;
        check_email_verification_token(&kek, email, expires, token)?;
        self.backend.verify_personal_identity("email", email).await
    }

    /// Begin a password reset, returning the confirmation code to email
    /// to the account holder.
    pub async fn issue_password_reset(&self, namespace: &str, id: &str) -> Result<String> {
        let account = self.backend.resolve_account(namespace, id).await?;
        let mut kek = account.security.system_key.clone();
        self.kms.decrypt_key(&mut kek)?;
        let expires = Time(Time::now().0 + RESET_CONFIRMATION_TTL_SECS);
        password_reset_confirmation(&kek, account.id, expires)
    }

    /// Complete a password reset. The nonce and key pair are preserved;
    /// only the password-derived wrapping changes.
    pub async fn confirm_password_reset(&self, confirmation: &str, password: &str) -> Result<()> {
        let account_id = confirmation_account(confirmation)?;
        let account = match self.backend.get_account(account_id).await {
            Ok(account) => account,
            Err(Error::AccountNotFound) => return Err(Error::InvalidConfirmationCode),
            Err(err) => return Err(err),
        };

        let mut kek = account.security.system_key.clone();
        self.kms.decrypt_key(&mut kek)?;
        check_password_reset_confirmation(&kek, confirmation)?;

        let security = account.security.reset_password(self.kms.as_ref(), password)?;
        self.backend.set_account_security(account_id, &security).await
    }
}

/// Split `/room/{prefix}{name}/ws` into its prefix and name.
fn parse_room_path(path: &str) -> Option<(String, String)> {
    let rest = path.strip_prefix("/room/")?;
    let rest = rest.strip_suffix("/ws")?;
    let (prefix, name) = match rest.strip_prefix("pm:") {
        Some(name) => ("pm:", name),
        None => ("", rest),
    };
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    {
        return None;
    }
    Some((prefix.to_string(), name.to_string()))
}

/// The agent cookie: authenticated but not encrypted.
#[derive(Debug, Clone)]
struct AgentCookie {
    agent_id: String,
    account_id: Option<String>,
    /// Doubles as the agent's secret key for wrapping its client key.
    nonce: Vec<u8>,
}

impl AgentCookie {
    fn new() -> Self {
        Self {
            agent_id: hex::encode(random_bytes(8)),
            account_id: None,
            nonce: random_bytes(CLIENT_KEY_TYPE.key_size()),
        }
    }

    fn mac(&self, key: &[u8]) -> Vec<u8> {
        let mut mac =
            Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key length");
        mac.update(self.agent_id.as_bytes());
        mac.update(b"|");
        mac.update(self.account_id.as_deref().unwrap_or_default().as_bytes());
        mac.update(b"|");
        mac.update(&self.nonce);
        mac.finalize().into_bytes().to_vec()
    }

    fn encode(&self, key: &[u8]) -> String {
        let packed = format!(
            "{}|{}|{}|{}",
            self.agent_id,
            self.account_id.as_deref().unwrap_or_default(),
            hex::encode(&self.nonce),
            hex::encode(self.mac(key)),
        );
        URL_SAFE.encode(packed)
    }

    fn decode(value: &str, key: &[u8]) -> Option<Self> {
        let packed = URL_SAFE.decode(value).ok()?;
        let packed = String::from_utf8(packed).ok()?;
        let mut parts = packed.split('|');
        let cookie = Self {
            agent_id: parts.next()?.to_string(),
            account_id: match parts.next()? {
                "" => None,
                id => Some(id.to_string()),
            },
            nonce: hex::decode(parts.next()?).ok()?,
        };
        let mac = hex::decode(parts.next()?).ok()?;
        if parts.next().is_some() {
            return None;
        }
        if !constant_time_eq(&mac, &cookie.mac(key)) {
            return None;
        }
        Some(cookie)
    }
}

fn find_agent_cookie(header: &str) -> Option<String> {
    for item in Cookie::split_parse(header.to_string()).flatten() {
        if item.name() == AGENT_COOKIE {
            return Some(item.value().to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_paths_parse() {
        assert_eq!(
            parse_room_path("/room/lobby/ws"),
            Some((String::new(), "lobby".to_string()))
        );
        assert_eq!(
            parse_room_path("/room/pm:0123abc/ws"),
            Some(("pm:".to_string(), "0123abc".to_string()))
        );
        assert_eq!(parse_room_path("/room/Lobby/ws"), None);
        assert_eq!(parse_room_path("/room//ws"), None);
        assert_eq!(parse_room_path("/room/lobby"), None);
        assert_eq!(parse_room_path("/metrics"), None);
    }

    #[test]
    fn agent_cookie_round_trips() {
        let key = random_bytes(32);
        let cookie = AgentCookie::new();
        let encoded = cookie.encode(&key);

        let decoded = AgentCookie::decode(&encoded, &key).unwrap();
        assert_eq!(decoded.agent_id, cookie.agent_id);
        assert_eq!(decoded.nonce, cookie.nonce);

        // A tampered or differently-keyed cookie fails to verify.
        assert!(AgentCookie::decode(&encoded, &random_bytes(32)).is_none());
        let mut tampered = cookie.clone();
        tampered.agent_id = "someone-else".to_string();
        let forged = URL_SAFE.encode(format!(
            "{}|{}|{}|{}",
            tampered.agent_id,
            "",
            hex::encode(&tampered.nonce),
            hex::encode(cookie.mac(&key)),
        ));
        assert!(AgentCookie::decode(&forged, &key).is_none());
    }

    #[test]
    fn cookie_header_lookup() {
        let header = "x=1; a=abc123; other=zzz";
        assert_eq!(find_agent_cookie(header).as_deref(), Some("abc123"));
        assert_eq!(find_agent_cookie("x=1"), None);
    }
}
