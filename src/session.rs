//! The per-connection session runtime.
//!
//! Each connection owns two cooperating tasks: a reader that parses
//! inbound frames, and this runtime, which dispatches commands, produces
//! replies inline, and interleaves room events from a bounded outbound
//! channel. Exactly one reply is produced per command id; events carry no
//! id. A session that cannot keep up with its event channel is
//! disconnected by the room rather than queued without bound.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use crate::account::{validate_account_password, validate_personal_identity};
use crate::api::{
    Auth, AuthOption, AuthReply, BounceEvent, CreateRoom, CreateRoomReply, Data, DisconnectEvent,
    EditMessage, GetMessage, GetMessageReply, Log, LogReply, Login, LoginReply, LogoutReply,
    Message, NetworkEvent, Nick, NickReply, Packet, ParsedPacket, PingEvent, PingReply, PmId,
    PmInitiate, PmInitiateReply, RegisterAccount, RegisterAccountReply, SessionView, Time,
    UserId, Who, WhoReply,
};
use crate::auth::{authenticate, authenticate_account, Authorization};
use crate::backend::{Agent, Backend};
use crate::cluster::PeerDesc;
use crate::nick::normalize_nick;
use crate::pm::initiate_pm;
use crate::room::{decrypt_message, Room, OUTBOUND_CAPACITY, SNAPSHOT_LOG_SIZE};
use crate::security::kms::Kms;
use crate::security::ManagedKey;
use crate::snowflake::IdGenerator;
use crate::{Error, Result};

/// Everything a session needs from the surrounding service.
#[derive(Clone)]
pub struct SessionContext {
    pub backend: Arc<dyn Backend>,
    pub kms: Arc<dyn Kms>,
    pub ids: Arc<IdGenerator>,
    pub server: PeerDesc,
    pub ping_interval: Duration,
    pub shutdown: watch::Receiver<bool>,
}

/// The acting client behind a session.
#[derive(Debug, Clone)]
pub struct Client {
    pub agent: Agent,
    /// The cookie-held agent secret, used to wrap the client key at rest.
    pub agent_key: ManagedKey,
    pub ip: Option<String>,
    pub authorization: Authorization,
}

impl Client {
    pub fn user_id(&self) -> UserId {
        match &self.authorization.account {
            Some(account) => UserId::for_account(account.id),
            None => UserId::for_agent(&self.agent.id),
        }
    }
}

enum Outcome {
    Continue,
    Disconnect(String),
}

enum SessionState {
    Unauthorized,
    Joined,
}

struct Session<S> {
    ctx: SessionContext,
    room: Arc<Room>,
    client: Client,
    view: SessionView,
    state: SessionState,
    sink: SplitSink<WebSocketStream<S>, WsMessage>,
    event_tx: mpsc::Sender<ParsedPacket>,
    last_ping: Option<Time>,
    ping_replied: bool,
}

/// Serve one connection until it closes.
///
/// The websocket handshake has already happened; `view` carries the
/// session's identity as resolved from the agent cookie.
pub async fn run_session<S>(
    ctx: SessionContext,
    room: Arc<Room>,
    client: Client,
    view: SessionView,
    ws: WebSocketStream<S>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();

    let (in_tx, mut in_rx) = mpsc::unbounded_channel();
    let reader = tokio::spawn(read_loop(stream, in_tx));

    let (event_tx, mut event_rx) = mpsc::channel(OUTBOUND_CAPACITY);

    let mut session = Session {
        ctx,
        room,
        client,
        view,
        state: SessionState::Unauthorized,
        sink,
        event_tx,
        last_ping: None,
        ping_replied: false,
    };

    let result = session.run(&mut in_rx, &mut event_rx).await;

    if matches!(session.state, SessionState::Joined) {
        if let Err(err) = session.room.part(&session.view).await {
            warn!("{}: part error: {err}", session.view.session_id);
        }
    }
    let _ = session.sink.close().await;
    reader.abort();

    result
}

async fn read_loop<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    tx: mpsc::UnboundedSender<Result<String>>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let next = match stream.next().await {
            None => Err(Error::ConnectionClosed),
            Some(Ok(WsMessage::Text(text))) => Ok(text),
            Some(Ok(WsMessage::Binary(_))) => Err(Error::ReceivedBinaryMessage),
            Some(Ok(WsMessage::Close(_))) => Err(Error::ConnectionClosed),
            Some(Ok(_)) => continue,
            Some(Err(err)) => Err(Error::Tungstenite(err)),
        };
        let failed = next.is_err();
        if tx.send(next).is_err() || failed {
            break;
        }
    }
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn run(
        &mut self,
        in_rx: &mut mpsc::UnboundedReceiver<Result<String>>,
        event_rx: &mut mpsc::Receiver<ParsedPacket>,
    ) -> Result<()> {
        let mut shutdown = self.ctx.shutdown.clone();

        // Either join outright, or bounce and wait for auth.
        match self.try_join().await {
            Ok(true) => {}
            Ok(false) => {
                self.write(ParsedPacket::from_data(
                    None,
                    BounceEvent {
                        reason: Some("room is private".to_string()),
                        auth_options: vec![AuthOption::Passcode],
                        agent_id: None,
                        ip: None,
                    },
                ))
                .await?;
            }
            Err(Error::AccessDenied) => {
                self.write(ParsedPacket::from_data(
                    None,
                    BounceEvent {
                        reason: Some("banned".to_string()),
                        auth_options: Vec::new(),
                        agent_id: Some(self.view.id.0.clone()),
                        ip: None,
                    },
                ))
                .await?;
                return Err(Error::AccessDenied);
            }
            Err(err) => return Err(err),
        }

        let mut ping_timer = tokio::time::interval(self.ctx.ping_interval);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let event = NetworkEvent {
                        r#type: "partition".to_string(),
                        server_id: self.ctx.server.id.clone(),
                        server_era: self.ctx.server.era.clone(),
                    };
                    let _ = self.write(ParsedPacket::from_data(None, event)).await;
                    return Ok(());
                }

                inbound = in_rx.recv() => {
                    match inbound {
                        None | Some(Err(Error::ConnectionClosed)) => return Ok(()),
                        Some(Err(err)) => return Err(err),
                        Some(Ok(text)) => {
                            match self.handle_frame(&text).await? {
                                Outcome::Continue => {}
                                Outcome::Disconnect(reason) => {
                                    self.write(ParsedPacket::from_data(
                                        None,
                                        DisconnectEvent { reason },
                                    ))
                                    .await?;
                                    return Ok(());
                                }
                            }
                        }
                    }
                }

                event = event_rx.recv() => {
                    match event {
                        // The room dropped this session for falling behind.
                        None => return Err(Error::ConnectionClosed),
                        Some(packet) => {
                            if let Some(packet) = self.filter_event(packet) {
                                self.write(packet).await?;
                            }
                        }
                    }
                }

                _ = ping_timer.tick() => {
                    if self.last_ping.is_some() && !self.ping_replied {
                        debug!("{}: ping timeout", self.view.session_id);
                        return Err(Error::PingTimeout);
                    }
                    let now = Time::now();
                    let next = Time(now.0 + self.ctx.ping_interval.as_secs() as i64);
                    self.last_ping = Some(now);
                    self.ping_replied = false;
                    self.write(ParsedPacket::from_data(
                        None,
                        PingEvent { time: now, next },
                    ))
                    .await?;
                }
            }
        }
    }

    /// Join the room if the session's authorization covers its key.
    ///
    /// Returns false if authentication is still required.
    async fn try_join(&mut self) -> Result<bool> {
        if let Some(key_id) = self.room.required_key_id().await? {
            if !self
                .client
                .authorization
                .message_keys
                .contains_key(&key_id)
            {
                return Ok(false);
            }
        }

        self.room
            .join(
                &self.view,
                self.event_tx.clone(),
                &self.client.agent,
                self.client.ip.as_deref(),
            )
            .await?;
        self.state = SessionState::Joined;

        let listing = self.room.listing().await?;
        let mut log = Vec::new();
        for mut msg in self.room.latest(SNAPSHOT_LOG_SIZE, None).await? {
            if decrypt_message(&mut msg, &self.client.authorization.message_keys)? {
                log.push(msg);
            }
        }

        let snapshot = crate::api::SnapshotEvent {
            identity: self.view.id.clone(),
            session_id: self.view.session_id.clone(),
            version: self.room.version(),
            listing,
            log,
        };
        self.write(ParsedPacket::from_data(None, snapshot)).await?;
        Ok(true)
    }

    async fn handle_frame(&mut self, text: &str) -> Result<Outcome> {
        let packet: Packet = match serde_json::from_str(text) {
            Ok(packet) => packet,
            Err(err) => {
                // Salvage the id if the frame was at least JSON, so the
                // error reply can be correlated.
                let id = serde_json::from_str::<serde_json::Value>(text)
                    .ok()
                    .and_then(|v| {
                        v.get("id")
                            .and_then(|id| id.as_str().map(str::to_string))
                    });
                let salvaged = id.is_some();
                self.write(ParsedPacket::from_error(
                    id,
                    None,
                    format!("invalid command type: {err}"),
                ))
                .await?;
                if salvaged {
                    return Ok(Outcome::Continue);
                }
                return Err(Error::ReceivedMalformedPacket(err));
            }
        };

        let id = packet.id.clone();
        let cmd_type = packet.r#type;
        let parsed = match ParsedPacket::from_packet(packet) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.write(ParsedPacket::from_error(
                    id,
                    Some(cmd_type),
                    err.to_string(),
                ))
                .await?;
                return Ok(Outcome::Continue);
            }
        };

        let data = match parsed.content {
            Ok(data) => data,
            Err(err) => {
                self.write(ParsedPacket::from_error(id, Some(cmd_type), err))
                    .await?;
                return Ok(Outcome::Continue);
            }
        };

        // Only commands (and ping replies) come in from clients.
        let is_command =
            cmd_type.reply_type().is_some() || matches!(data, Data::PingReply(_));
        if !is_command {
            self.write(ParsedPacket::from_error(
                id,
                None,
                format!("invalid command type: {cmd_type}"),
            ))
            .await?;
            return Ok(Outcome::Continue);
        }

        match self.dispatch(id.clone(), data).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.write(ParsedPacket::from_error(id, Some(cmd_type), err.to_string()))
                    .await?;
                Ok(Outcome::Continue)
            }
        }
    }

    async fn dispatch(&mut self, id: Option<String>, data: Data) -> Result<Outcome> {
        if !matches!(self.state, SessionState::Joined) {
            match data {
                Data::Auth(_)
                | Data::Login(_)
                | Data::Logout(_)
                | Data::RegisterAccount(_)
                | Data::Ping(_)
                | Data::PingReply(_) => {}
                _ => return Err(Error::AccessDenied),
            }
        }

        match data {
            Data::Ping(cmd) => {
                self.reply(id, PingReply { time: Some(cmd.time) }).await?;
            }
            Data::PingReply(reply) => {
                if reply.time == self.last_ping {
                    self.ping_replied = true;
                }
            }
            Data::Auth(cmd) => return self.cmd_auth(id, cmd).await,
            Data::Login(cmd) => return self.cmd_login(id, cmd).await,
            Data::Logout(_) => return self.cmd_logout(id).await,
            Data::RegisterAccount(cmd) => return self.cmd_register(id, cmd).await,
            Data::Nick(cmd) => return self.cmd_nick(id, cmd).await,
            Data::Send(cmd) => {
                let msg = self
                    .room
                    .send(&self.view, cmd.content, cmd.parent)
                    .await?;
                let msg = self.decrypt_for_session(msg)?;
                self.reply(id, crate::api::SendReply(msg)).await?;
            }
            Data::GetMessage(GetMessage { id: message_id }) => {
                let msg = self.room.get_message(message_id).await?;
                let msg = self.decrypt_for_session(msg)?;
                self.reply(id, GetMessageReply(msg)).await?;
            }
            Data::Log(cmd) => return self.cmd_log(id, cmd).await,
            Data::Who(Who {}) => {
                let listing = self.room.listing().await?;
                self.reply(id, WhoReply { listing }).await?;
            }
            Data::EditMessage(cmd) => return self.cmd_edit(id, cmd).await,
            Data::PmInitiate(cmd) => return self.cmd_pm_initiate(id, cmd).await,
            Data::CreateRoom(cmd) => return self.cmd_create_room(id, cmd).await,
            // Reply and event payloads are rejected before dispatch.
            _ => {}
        }
        Ok(Outcome::Continue)
    }

    async fn cmd_auth(&mut self, id: Option<String>, cmd: Auth) -> Result<Outcome> {
        if matches!(self.state, SessionState::Joined) {
            self.reply(
                id,
                AuthReply {
                    success: false,
                    reason: Some("already joined".to_string()),
                },
            )
            .await?;
            return Ok(Outcome::Continue);
        }

        let result = authenticate(self.ctx.backend.as_ref(), self.room.name(), &cmd).await?;
        if let Some(reason) = result.failure_reason {
            self.reply(
                id,
                AuthReply {
                    success: false,
                    reason: Some(reason),
                },
            )
            .await?;
            return Ok(Outcome::Continue);
        }

        self.client
            .authorization
            .message_keys
            .extend(result.authorization.message_keys);

        self.reply(
            id,
            AuthReply {
                success: true,
                reason: None,
            },
        )
        .await?;

        match self.try_join().await {
            Ok(_) => Ok(Outcome::Continue),
            Err(Error::AccessDenied) => Ok(Outcome::Disconnect("banned".to_string())),
            Err(err) => Err(err),
        }
    }

    async fn cmd_login(&mut self, id: Option<String>, cmd: Login) -> Result<Outcome> {
        if self.client.authorization.account.is_some() {
            return Err(Error::AccessDenied);
        }

        let result = authenticate_account(
            self.ctx.backend.as_ref(),
            &cmd.namespace,
            &cmd.id,
            &cmd.password,
        )
        .await?;

        if let Some(reason) = result.failure_reason {
            self.reply(
                id,
                LoginReply {
                    success: false,
                    reason: Some(reason),
                    account_id: None,
                },
            )
            .await?;
            return Ok(Outcome::Continue);
        }

        let authorization = result.authorization;
        let account = authorization.account.as_ref().ok_or(Error::AccessDenied)?;
        let account_id = account.id;

        self.ctx
            .backend
            .set_agent_account(&self.client.agent.id, Some(account_id))
            .await?;
        if let Some(client_key) = &authorization.client_key {
            self.ctx
                .backend
                .set_agent_client_key(&self.client.agent.id, &self.client.agent_key, client_key)
                .await?;
        }

        self.reply(
            id,
            LoginReply {
                success: true,
                reason: None,
                account_id: Some(crate::api::AccountId(account_id)),
            },
        )
        .await?;
        Ok(Outcome::Disconnect("authentication changed".to_string()))
    }

    async fn cmd_logout(&mut self, id: Option<String>) -> Result<Outcome> {
        if self.client.authorization.account.is_none() {
            return Err(Error::AccessDenied);
        }
        self.ctx
            .backend
            .set_agent_account(&self.client.agent.id, None)
            .await?;
        self.reply(id, LogoutReply).await?;
        Ok(Outcome::Disconnect("authentication changed".to_string()))
    }

    async fn cmd_register(
        &mut self,
        id: Option<String>,
        cmd: RegisterAccount,
    ) -> Result<Outcome> {
        if self.client.authorization.account.is_some() {
            return Err(Error::AccessDenied);
        }

        let (ok, reason) = validate_personal_identity(&cmd.namespace, &cmd.id);
        if !ok {
            self.reply(
                id,
                RegisterAccountReply {
                    success: false,
                    reason,
                    account_id: None,
                },
            )
            .await?;
            return Ok(Outcome::Continue);
        }
        let (ok, reason) = validate_account_password(&cmd.password);
        if !ok {
            self.reply(
                id,
                RegisterAccountReply {
                    success: false,
                    reason,
                    account_id: None,
                },
            )
            .await?;
            return Ok(Outcome::Continue);
        }

        let registered = self
            .ctx
            .backend
            .register_account(
                self.ctx.kms.as_ref(),
                &cmd.namespace,
                &cmd.id,
                &cmd.password,
                &self.client.agent.id,
                &self.client.agent_key,
            )
            .await;

        match registered {
            Ok((account, _client_key)) => {
                let account_id = account.id;
                self.reply(
                    id,
                    RegisterAccountReply {
                        success: true,
                        reason: None,
                        account_id: Some(crate::api::AccountId(account_id)),
                    },
                )
                .await?;
                Ok(Outcome::Disconnect("authentication changed".to_string()))
            }
            Err(Error::PersonalIdentityInUse) => {
                self.reply(
                    id,
                    RegisterAccountReply {
                        success: false,
                        reason: Some(Error::PersonalIdentityInUse.to_string()),
                        account_id: None,
                    },
                )
                .await?;
                Ok(Outcome::Continue)
            }
            Err(err) => Err(err),
        }
    }

    async fn cmd_nick(&mut self, id: Option<String>, cmd: Nick) -> Result<Outcome> {
        let to = normalize_nick(&cmd.name)?;
        let from = self.view.name.clone();
        self.view.name = to.clone();

        self.room.rename_user(&self.view, &from).await?;

        self.reply(
            id,
            NickReply {
                session_id: self.view.session_id.clone(),
                id: self.view.id.clone(),
                from,
                to,
            },
        )
        .await?;
        Ok(Outcome::Continue)
    }

    async fn cmd_log(&mut self, id: Option<String>, cmd: Log) -> Result<Outcome> {
        let n = cmd.n.min(1000);
        let log = self.room.latest(n, cmd.before).await?;

        let mut visible = Vec::with_capacity(log.len());
        for mut msg in log {
            if decrypt_message(&mut msg, &self.client.authorization.message_keys)? {
                visible.push(msg);
            }
        }

        self.reply(
            id,
            LogReply {
                log: visible,
                before: cmd.before,
            },
        )
        .await?;
        Ok(Outcome::Continue)
    }

    async fn cmd_edit(&mut self, id: Option<String>, cmd: EditMessage) -> Result<Outcome> {
        if !self.view.is_manager && !self.view.is_staff {
            return Err(Error::AccessDenied);
        }
        let mut reply = self.room.edit_message(&self.view, &cmd).await?;
        reply.message = self.decrypt_for_session(reply.message)?;
        self.reply(id, reply).await?;
        Ok(Outcome::Continue)
    }

    async fn cmd_pm_initiate(
        &mut self,
        id: Option<String>,
        cmd: PmInitiate,
    ) -> Result<Outcome> {
        let pm_id = self.ctx.ids.next();
        let pm = initiate_pm(self.ctx.kms.as_ref(), pm_id, &self.client, &cmd.user_id)?;
        self.ctx.backend.save_pm(&pm).await?;

        let to_nick = self
            .room
            .listing()
            .await?
            .into_iter()
            .find(|view| view.id == cmd.user_id)
            .map(|view| view.name)
            .unwrap_or_default();

        self.reply(
            id,
            PmInitiateReply {
                pm_id: PmId(pm_id),
                to_nick,
            },
        )
        .await?;
        Ok(Outcome::Continue)
    }

    async fn cmd_create_room(
        &mut self,
        id: Option<String>,
        cmd: CreateRoom,
    ) -> Result<Outcome> {
        if !self.view.is_staff {
            return Err(Error::AccessDenied);
        }

        let mut managers = Vec::with_capacity(cmd.managers.len());
        for account_id in &cmd.managers {
            managers.push(self.ctx.backend.get_account(account_id.0).await?);
        }

        let created = self
            .ctx
            .backend
            .create_room(self.ctx.kms.as_ref(), cmd.private, &cmd.name, &managers)
            .await;

        let reply = match created {
            Ok(_) => CreateRoomReply {
                success: true,
                failure_reason: None,
            },
            Err(err) => CreateRoomReply {
                success: false,
                failure_reason: Some(err.to_string()),
            },
        };
        self.reply(id, reply).await?;
        Ok(Outcome::Continue)
    }

    /// Decrypt a message for this session, or return it as stored if the
    /// session holds no key for it.
    fn decrypt_for_session(&self, mut msg: Message) -> Result<Message> {
        decrypt_message(&mut msg, &self.client.authorization.message_keys)?;
        Ok(msg)
    }

    /// Rewrite or suppress a room event before it reaches this session's
    /// transport.
    ///
    /// Encrypted payloads the session holds no key for are suppressed
    /// entirely.
    fn filter_event(&self, mut packet: ParsedPacket) -> Option<ParsedPacket> {
        let keys = &self.client.authorization.message_keys;
        let keep = match &mut packet.content {
            Ok(Data::SendEvent(event)) => decrypt_message(&mut event.0, keys).unwrap_or(false),
            Ok(Data::EditMessageEvent(event)) => {
                decrypt_message(&mut event.message, keys).unwrap_or(false)
            }
            _ => true,
        };
        keep.then_some(packet)
    }

    async fn reply(&mut self, id: Option<String>, data: impl Into<Data>) -> Result<()> {
        self.write(ParsedPacket::from_data(id, data)).await
    }

    async fn write(&mut self, packet: ParsedPacket) -> Result<()> {
        let packet = packet.into_packet().map_err(Error::MalformedPacket)?;
        let text = serde_json::to_string(&packet).map_err(Error::MalformedPacket)?;
        self.sink.send(WsMessage::Text(text)).await?;
        Ok(())
    }
}
