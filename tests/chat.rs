//! End-to-end chat scenarios over the in-memory backend.
//!
//! Each client is a real websocket driven over an in-process duplex pipe,
//! served by the same session runtime the TCP acceptor uses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::DuplexStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use parlor::api::{MessageId, SessionId, SessionView, Time, UserId};
use parlor::auth::Authorization;
use parlor::backend::{Agent, Backend, TestBackend};
use parlor::cluster::{Cluster, ClusterFabric, LocalCluster, PeerDesc};
use parlor::room::{Room, RoomKind};
use parlor::security::kms::{Kms, LocalKms};
use parlor::security::capability::grant_shared_secret;
use parlor::security::{key_from_passcode, ManagedKey, CLIENT_KEY_TYPE, ROOM_MESSAGE_KEY_TYPE};
use parlor::session::{run_session, Client, SessionContext};
use parlor::snowflake::{IdGenerator, Snowflake};

struct Harness {
    backend: Arc<dyn Backend>,
    kms: Arc<dyn Kms>,
    ids: Arc<IdGenerator>,
    cluster: Arc<dyn Cluster>,
    server: PeerDesc,
    rooms: Mutex<HashMap<String, Arc<Room>>>,
    session_counter: AtomicU64,
    shutdown: watch::Receiver<bool>,
    _shutdown_tx: watch::Sender<bool>,
}

impl Harness {
    fn new() -> Arc<Self> {
        let ids = Arc::new(IdGenerator::new(1));
        let server = PeerDesc {
            id: "test".to_string(),
            era: "era1".to_string(),
            version: "testver".to_string(),
        };
        let (tx, rx) = watch::channel(false);
        Arc::new(Self {
            backend: Arc::new(TestBackend::new("testver", ids.clone())),
            kms: Arc::new(LocalKms::generate()),
            ids,
            cluster: Arc::new(LocalCluster::attach(ClusterFabric::new(), server.clone())),
            server,
            rooms: Mutex::new(HashMap::new()),
            session_counter: AtomicU64::new(0),
            shutdown: rx,
            _shutdown_tx: tx,
        })
    }

    async fn room(&self, name: &str) -> Arc<Room> {
        if let Some(room) = self.rooms.lock().get(name) {
            return room.clone();
        }
        let record = match self.backend.get_room(name).await {
            Ok(record) => record,
            Err(_) => self
                .backend
                .create_room(self.kms.as_ref(), false, name, &[])
                .await
                .unwrap(),
        };
        let room = Room::new(
            record,
            RoomKind::Public,
            self.backend.clone(),
            self.kms.clone(),
            self.ids.clone(),
            self.server.clone(),
            self.cluster.clone(),
        );
        self.rooms.lock().entry(name.to_string()).or_insert(room).clone()
    }

    fn context(&self) -> SessionContext {
        SessionContext {
            backend: self.backend.clone(),
            kms: self.kms.clone(),
            ids: self.ids.clone(),
            server: self.server.clone(),
            ping_interval: Duration::from_secs(600),
            shutdown: self.shutdown.clone(),
        }
    }

    async fn connect(&self, room_name: &str, staff: bool) -> TestClient {
        let n = self.session_counter.fetch_add(1, Ordering::SeqCst);
        let agent_id = format!("agent{n}");
        let agent = Agent::new(&agent_id);
        self.backend.register_agent(&agent).await.unwrap();

        let agent_key = ManagedKey::from_plaintext(CLIENT_KEY_TYPE, vec![n as u8; 16]);
        let client = Client {
            agent,
            agent_key: agent_key.clone(),
            ip: None,
            authorization: Authorization {
                client_key: Some(agent_key),
                ..Authorization::default()
            },
        };
        let view = SessionView {
            id: UserId(format!("agent:{agent_id}")),
            name: String::new(),
            server_id: self.server.id.clone(),
            server_era: self.server.era.clone(),
            session_id: SessionId(format!("test-{n}")),
            is_staff: staff,
            is_manager: false,
        };

        let room = self.room(room_name).await;

        let (server_io, client_io) = tokio::io::duplex(256 * 1024);
        let server_ws =
            WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let client_ws =
            WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;

        let ctx = self.context();
        tokio::spawn(async move {
            let _ = run_session(ctx, room, client, view, server_ws).await;
        });

        TestClient { ws: client_ws }
    }

    /// Rotate the room key and write a passcode grant for it.
    async fn grant_passcode(&self, room_name: &str, passcode: &str) {
        let room = self.room(room_name).await;
        let key = room.generate_master_key().await.unwrap();

        let mut plain = key.key.clone();
        self.kms.decrypt_key(&mut plain).unwrap();

        let holder =
            key_from_passcode(passcode.as_bytes(), &key.nonce, ROOM_MESSAGE_KEY_TYPE).unwrap();
        let capability =
            grant_shared_secret(&holder, &key.nonce, &"passcode", &plain.plaintext).unwrap();
        room.save_capability(&capability).await.unwrap();
    }
}

struct TestClient {
    ws: WebSocketStream<DuplexStream>,
}

impl TestClient {
    async fn send(&mut self, packet: Value) {
        self.ws
            .send(WsMessage::Text(packet.to_string()))
            .await
            .unwrap();
    }

    /// The next packet of the given type; other types are skipped.
    async fn recv_type(&mut self, ptype: &str) -> Value {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.ws.next())
                .await
                .expect("timed out waiting for packet")
                .expect("connection closed")
                .unwrap();
            let WsMessage::Text(text) = frame else { continue };
            let packet: Value = serde_json::from_str(&text).unwrap();
            if packet["type"] == ptype {
                return packet;
            }
        }
    }
}

#[tokio::test]
async fn two_users_chat() {
    let harness = Harness::new();

    let mut a = harness.connect("lobby", false).await;
    let snapshot = a.recv_type("snapshot-event").await;
    assert_eq!(snapshot["data"]["version"], "testver");

    let mut b = harness.connect("lobby", false).await;
    b.recv_type("snapshot-event").await;
    a.recv_type("join-event").await;

    a.send(json!({"type": "send", "id": "1", "data": {"content": "hi"}}))
        .await;

    let reply = a.recv_type("send-reply").await;
    assert_eq!(reply["id"], "1");
    assert_eq!(reply["data"]["content"], "hi");
    let message_id = reply["data"]["id"].as_str().unwrap().to_string();

    let event = b.recv_type("send-event").await;
    assert_eq!(event["data"]["id"], message_id.as_str());
    assert_eq!(event["data"]["content"], "hi");
}

#[tokio::test]
async fn who_lists_each_session_once() {
    let harness = Harness::new();

    let mut a = harness.connect("crowd", false).await;
    a.recv_type("snapshot-event").await;
    let mut b = harness.connect("crowd", false).await;
    b.recv_type("snapshot-event").await;

    b.send(json!({"type": "who", "id": "1", "data": {}})).await;
    let reply = b.recv_type("who-reply").await;
    let listing = reply["data"]["listing"].as_array().unwrap();
    assert_eq!(listing.len(), 2);

    let mut session_ids: Vec<&str> = listing
        .iter()
        .map(|view| view["session_id"].as_str().unwrap())
        .collect();
    session_ids.sort_unstable();
    session_ids.dedup();
    assert_eq!(session_ids.len(), 2);
}

#[tokio::test]
async fn edit_message_announces() {
    let harness = Harness::new();

    let mut a = harness.connect("editable", true).await;
    a.recv_type("snapshot-event").await;
    let mut b = harness.connect("editable", false).await;
    b.recv_type("snapshot-event").await;

    a.send(json!({"type": "send", "id": "1", "data": {"content": "hi"}}))
        .await;
    let reply = a.recv_type("send-reply").await;
    let message_id = reply["data"]["id"].as_str().unwrap().to_string();
    b.recv_type("send-event").await;

    a.send(json!({
        "type": "edit-message",
        "id": "2",
        "data": {
            "id": message_id,
            "previous_edit_id": 0,
            "content": "hello",
            "announce": true,
        },
    }))
    .await;

    let reply = a.recv_type("edit-message-reply").await;
    assert_eq!(reply["id"], "2");
    let edit_id = reply["data"]["edit_id"].as_str().unwrap().to_string();
    assert_eq!(reply["data"]["message"]["content"], "hello");

    let event = b.recv_type("edit-message-event").await;
    assert_eq!(event["data"]["edit_id"], edit_id.as_str());
    assert_eq!(event["data"]["content"], "hello");
}

#[tokio::test]
async fn stale_edits_are_rejected() {
    let harness = Harness::new();

    let mut a = harness.connect("conflicted", true).await;
    a.recv_type("snapshot-event").await;
    let mut b = harness.connect("conflicted", true).await;
    b.recv_type("snapshot-event").await;

    a.send(json!({"type": "send", "id": "1", "data": {"content": "original"}}))
        .await;
    let reply = a.recv_type("send-reply").await;
    let message_id = reply["data"]["id"].as_str().unwrap().to_string();
    b.recv_type("send-event").await;

    a.send(json!({
        "type": "edit-message",
        "id": "2",
        "data": {"id": message_id, "previous_edit_id": 0, "content": "first"},
    }))
    .await;
    a.recv_type("edit-message-reply").await;

    // The second editor still thinks the message is unedited.
    b.send(json!({
        "type": "edit-message",
        "id": "9",
        "data": {"id": message_id, "previous_edit_id": 0, "content": "second"},
    }))
    .await;
    let reply = b.recv_type("edit-message-reply").await;
    assert_eq!(reply["id"], "9");
    assert_eq!(reply["error"], "edit inconsistent");

    // Only the first edit took.
    b.send(json!({"type": "log", "id": "10", "data": {"n": 10}}))
        .await;
    let reply = b.recv_type("log-reply").await;
    assert_eq!(reply["data"]["log"][0]["content"], "first");
}

#[tokio::test]
async fn passcode_room_round_trip() {
    let harness = Harness::new();
    harness.grant_passcode("sekrit", "swordfish").await;

    // Without auth, the session is bounced.
    let mut a = harness.connect("sekrit", false).await;
    let bounce = a.recv_type("bounce-event").await;
    assert_eq!(bounce["data"]["auth_options"][0], "passcode");

    // A wrong passcode is rejected.
    a.send(json!({
        "type": "auth", "id": "1",
        "data": {"type": "passcode", "passcode": "wrong"},
    }))
    .await;
    let reply = a.recv_type("auth-reply").await;
    assert_eq!(reply["data"]["success"], false);
    assert_eq!(reply["data"]["reason"], "passcode incorrect");

    // The right one joins the room.
    a.send(json!({
        "type": "auth", "id": "2",
        "data": {"type": "passcode", "passcode": "swordfish"},
    }))
    .await;
    let reply = a.recv_type("auth-reply").await;
    assert_eq!(reply["data"]["success"], true);
    a.recv_type("snapshot-event").await;

    a.send(json!({"type": "send", "id": "3", "data": {"content": "attack at dawn"}}))
        .await;
    let reply = a.recv_type("send-reply").await;
    // The sender sees plaintext even though the room stores ciphertext.
    assert_eq!(reply["data"]["content"], "attack at dawn");

    // A second key-holding session reads the log decrypted.
    let mut b = harness.connect("sekrit", false).await;
    b.recv_type("bounce-event").await;
    b.send(json!({
        "type": "auth", "id": "1",
        "data": {"type": "passcode", "passcode": "swordfish"},
    }))
    .await;
    b.recv_type("auth-reply").await;
    b.recv_type("snapshot-event").await;

    b.send(json!({"type": "log", "id": "2", "data": {"n": 10}})).await;
    let reply = b.recv_type("log-reply").await;
    assert_eq!(reply["data"]["log"][0]["content"], "attack at dawn");

    // The stored row is encrypted.
    let stored = harness.backend.latest("sekrit", 10, None).await.unwrap();
    assert!(stored[0].encrypted());
    assert_ne!(stored[0].content, "attack at dawn");
}

#[tokio::test]
async fn nick_balances_bidi_controls() {
    let harness = Harness::new();

    let mut a = harness.connect("names", false).await;
    a.recv_type("snapshot-event").await;

    a.send(json!({"type": "nick", "id": "1", "data": {"name": "a\u{202E}b"}}))
        .await;
    let reply = a.recv_type("nick-reply").await;
    assert_eq!(reply["data"]["to"], "a\u{202E}b\u{202C}");
    assert_eq!(reply["data"]["from"], "");

    // Another session sees the nick event.
    let mut b = harness.connect("names", false).await;
    b.recv_type("snapshot-event").await;
    a.send(json!({"type": "nick", "id": "2", "data": {"name": "  max   power  "}}))
        .await;
    let reply = a.recv_type("nick-reply").await;
    assert_eq!(reply["data"]["to"], "max power");
    let event = b.recv_type("nick-event").await;
    assert_eq!(event["data"]["to"], "max power");
}

#[tokio::test]
async fn retention_hides_old_messages() {
    let harness = Harness::new();

    let mut a = harness.connect("fleeting", false).await;
    a.recv_type("snapshot-event").await;
    harness
        .backend
        .set_room_retention("fleeting", 1)
        .await
        .unwrap();

    // A message posted two days ago, behind the retention window.
    let old = parlor::api::Message {
        id: MessageId(Snowflake(1000)),
        parent: None,
        previous_edit_id: None,
        time: Time(Time::now().0 - 2 * 24 * 3600),
        sender: SessionView {
            id: UserId("agent:old".to_string()),
            name: "old".to_string(),
            server_id: "test".to_string(),
            server_era: "era0".to_string(),
            session_id: SessionId("test-old".to_string()),
            is_staff: false,
            is_manager: false,
        },
        content: "ancient".to_string(),
        encryption_key_id: None,
        edited: None,
        deleted: None,
    };
    harness.backend.save_message("fleeting", &old).await.unwrap();

    a.send(json!({"type": "log", "id": "1", "data": {"n": 10}})).await;
    let reply = a.recv_type("log-reply").await;
    assert_eq!(reply["data"]["log"].as_array().unwrap().len(), 0);

    // Replying to it fails: the parent has aged out.
    a.send(json!({
        "type": "send", "id": "2",
        "data": {"content": "necro", "parent": old.id.to_string()},
    }))
    .await;
    let reply = a.recv_type("send-reply").await;
    assert_eq!(reply["error"], "message not found");
}

#[tokio::test]
async fn unknown_commands_get_error_replies() {
    let harness = Harness::new();

    let mut a = harness.connect("strict", false).await;
    a.recv_type("snapshot-event").await;

    a.send(json!({"type": "frobnicate", "id": "1", "data": {}}))
        .await;
    let reply = a.recv_type("error-reply").await;
    assert_eq!(reply["id"], "1");
    assert!(reply["error"]
        .as_str()
        .unwrap()
        .contains("invalid command type"));

    // The session is still usable afterwards.
    a.send(json!({"type": "ping", "id": "2", "data": {"time": 1}}))
        .await;
    let reply = a.recv_type("ping-reply").await;
    assert_eq!(reply["data"]["time"], 1);
}

#[tokio::test]
async fn cross_server_events_forward_in_order() {
    use parlor::config::ServerConfig;
    use parlor::server::Service;
    use tokio::sync::mpsc;

    let fabric = ClusterFabric::new();
    let ids = Arc::new(IdGenerator::new(1));
    let backend: Arc<dyn Backend> = Arc::new(TestBackend::new("testver", ids.clone()));
    let kms: Arc<dyn Kms> = Arc::new(LocalKms::generate());

    let mut services = Vec::new();
    for name in ["s1", "s2"] {
        let desc = PeerDesc {
            id: name.to_string(),
            era: "era1".to_string(),
            version: "testver".to_string(),
        };
        let cluster: Arc<dyn Cluster> =
            Arc::new(LocalCluster::attach(fabric.clone(), desc.clone()));
        let service = Service::start(
            ServerConfig::default(),
            kms.clone(),
            cluster,
            backend.clone(),
            ids.clone(),
            desc,
        )
        .await
        .unwrap();
        services.push(service);
    }

    // Materialize the room on both servers, with one session each.
    let room1 = services[0].room("bridge").await.unwrap();
    let room2 = services[1].room("bridge").await.unwrap();

    let view = |server: &str, who: &str| SessionView {
        id: UserId(format!("agent:{who}")),
        name: who.to_string(),
        server_id: server.to_string(),
        server_era: "era1".to_string(),
        session_id: SessionId(format!("{server}-{who}")),
        is_staff: false,
        is_manager: false,
    };

    let a = view("s1", "a");
    let (a_tx, _a_rx) = mpsc::channel(100);
    room1.join(&a, a_tx, &Agent::new("a"), None).await.unwrap();

    let b = view("s2", "b");
    let (b_tx, mut b_rx) = mpsc::channel(100);
    room2.join(&b, b_tx, &Agent::new("b"), None).await.unwrap();

    for i in 0..5 {
        room1.send(&a, format!("{i}"), None).await.unwrap();
    }

    // B, attached to the other server, sees A's messages in send order.
    let mut contents = Vec::new();
    while contents.len() < 5 {
        let packet = tokio::time::timeout(Duration::from_secs(5), b_rx.recv())
            .await
            .expect("timed out waiting for forwarded event")
            .expect("event channel closed");
        if let Ok(parlor::api::Data::SendEvent(event)) = packet.content {
            contents.push(event.0.content);
        }
    }
    assert_eq!(contents, vec!["0", "1", "2", "3", "4"]);

    // The global listing sees both sessions.
    let listing = room2.listing().await.unwrap();
    assert_eq!(listing.len(), 2);
}

#[tokio::test]
async fn registration_and_login_cycle() {
    let harness = Harness::new();

    let mut a = harness.connect("welcome", false).await;
    a.recv_type("snapshot-event").await;

    // Short passwords are rejected without touching storage.
    a.send(json!({
        "type": "register-account", "id": "1",
        "data": {"namespace": "email", "id": "max@example.com", "password": "abc"},
    }))
    .await;
    let reply = a.recv_type("register-account-reply").await;
    assert_eq!(reply["data"]["success"], false);

    a.send(json!({
        "type": "register-account", "id": "2",
        "data": {"namespace": "email", "id": "max@example.com", "password": "hunter2"},
    }))
    .await;
    let reply = a.recv_type("register-account-reply").await;
    assert_eq!(reply["data"]["success"], true);
    a.recv_type("disconnect-event").await;

    // A fresh session logs in with the same credentials.
    let mut b = harness.connect("welcome", false).await;
    b.recv_type("snapshot-event").await;
    b.send(json!({
        "type": "login", "id": "1",
        "data": {"namespace": "email", "id": "max@example.com", "password": "wrong-password"},
    }))
    .await;
    let reply = b.recv_type("login-reply").await;
    assert_eq!(reply["data"]["success"], false);

    b.send(json!({
        "type": "login", "id": "2",
        "data": {"namespace": "email", "id": "max@example.com", "password": "hunter2"},
    }))
    .await;
    let reply = b.recv_type("login-reply").await;
    assert_eq!(reply["data"]["success"], true);
    let event = b.recv_type("disconnect-event").await;
    assert_eq!(event["data"]["reason"], "authentication changed");
}
