//! Cluster coordination.
//!
//! The core consumes a small contract: a shared key-value namespace with
//! change notifications, a peer registry, and a clean leave. The in-tree
//! implementation couples processes through a shared in-memory fabric;
//! a coordination-service adapter satisfies the same trait out of tree.
//!
//! Coordination keys: `config` holds the configuration blob,
//! `peers/<server_id>` this peer's liveness record, and `events/<room>`
//! the per-room cross-server event stream.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use log::warn;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::api::Packet;
use crate::Result;

/// How many out-of-order envelopes a receiver will buffer per stream
/// before resynchronizing.
pub const REORDER_WINDOW: u64 = 32;

/// A peer as registered in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDesc {
    pub id: String,
    pub era: String,
    pub version: String,
}

/// A change observed through [`Cluster::watch`].
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    /// A key was written.
    ValueSet { key: String, value: String },
    /// A peer left the cluster or stopped refreshing its liveness.
    PeerLost { peer: PeerDesc },
}

/// The coordination contract the core consumes.
#[async_trait]
pub trait Cluster: Send + Sync {
    async fn get_value(&self, key: &str) -> Result<Option<String>>;
    async fn set_value(&self, key: &str, value: String) -> Result<()>;

    /// Subscribe to cluster changes.
    fn watch(&self) -> broadcast::Receiver<ClusterEvent>;

    /// A snapshot of known live peers, including this one.
    fn peers(&self) -> Vec<PeerDesc>;

    /// Leave the cluster cleanly.
    async fn part(&self);
}

/// The shared state a set of [`LocalCluster`] handles coordinate through.
///
/// One fabric per process; multiple servers attach to the same fabric in
/// tests to exercise cross-server paths.
#[derive(Debug)]
pub struct ClusterFabric {
    values: Mutex<HashMap<String, String>>,
    peers: Mutex<Vec<PeerDesc>>,
    tx: broadcast::Sender<ClusterEvent>,
}

impl ClusterFabric {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(1024);
        Arc::new(Self {
            values: Mutex::new(HashMap::new()),
            peers: Mutex::new(Vec::new()),
            tx,
        })
    }
}

/// An in-memory cluster handle for one server.
#[derive(Debug, Clone)]
pub struct LocalCluster {
    fabric: Arc<ClusterFabric>,
    me: PeerDesc,
}

impl LocalCluster {
    /// Attach a server to the fabric, publishing its liveness record.
    pub fn attach(fabric: Arc<ClusterFabric>, me: PeerDesc) -> Self {
        {
            let mut peers = fabric.peers.lock();
            peers.retain(|p| p.id != me.id);
            peers.push(me.clone());
        }
        let key = format!("peers/{}", me.id);
        let value = serde_json::to_string(&me).unwrap_or_default();
        fabric.values.lock().insert(key.clone(), value.clone());
        let _ = fabric.tx.send(ClusterEvent::ValueSet { key, value });
        Self { fabric, me }
    }

    pub fn desc(&self) -> &PeerDesc {
        &self.me
    }
}

#[async_trait]
impl Cluster for LocalCluster {
    async fn get_value(&self, key: &str) -> Result<Option<String>> {
        Ok(self.fabric.values.lock().get(key).cloned())
    }

    async fn set_value(&self, key: &str, value: String) -> Result<()> {
        self.fabric
            .values
            .lock()
            .insert(key.to_string(), value.clone());
        let _ = self.fabric.tx.send(ClusterEvent::ValueSet {
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<ClusterEvent> {
        self.fabric.tx.subscribe()
    }

    fn peers(&self) -> Vec<PeerDesc> {
        self.fabric.peers.lock().clone()
    }

    async fn part(&self) {
        self.fabric.peers.lock().retain(|p| p.id != self.me.id);
        self.fabric
            .values
            .lock()
            .remove(&format!("peers/{}", self.me.id));
        let _ = self.fabric.tx.send(ClusterEvent::PeerLost {
            peer: self.me.clone(),
        });
    }
}

/// A room event as forwarded between servers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomEventEnvelope {
    pub room: String,
    pub server_id: String,
    pub server_era: String,
    pub seq: u64,
    pub packet: Packet,
}

impl RoomEventEnvelope {
    /// The coordination key this envelope is published under.
    pub fn key(room: &str) -> String {
        format!("events/{room}")
    }
}

type StreamKey = (String, String, String);

/// Receiver-side ordering for cross-server room events.
///
/// Envelopes are delivered strictly in sequence order per
/// `(room, server_id, server_era)` stream. Out-of-order envelopes are
/// buffered up to [`REORDER_WINDOW`]; past that, the gap is abandoned and
/// the stream resynchronizes at the newest sequence.
#[derive(Debug, Default)]
pub struct EventOrder {
    next: HashMap<StreamKey, u64>,
    buffered: HashMap<StreamKey, BTreeMap<u64, RoomEventEnvelope>>,
}

impl EventOrder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept an incoming envelope, returning every envelope now
    /// deliverable in order.
    pub fn accept(&mut self, env: RoomEventEnvelope) -> Vec<RoomEventEnvelope> {
        let key = (
            env.room.clone(),
            env.server_id.clone(),
            env.server_era.clone(),
        );

        let next = *self.next.entry(key.clone()).or_insert(env.seq);

        if env.seq < next {
            // Duplicate or already-abandoned sequence.
            return Vec::new();
        }

        if env.seq > next + REORDER_WINDOW {
            warn!(
                "event stream {}/{} resynchronizing: expected {next}, got {}",
                env.room, env.server_id, env.seq
            );
            self.buffered.remove(&key);
            self.next.insert(key, env.seq + 1);
            return vec![env];
        }

        let buffer = self.buffered.entry(key.clone()).or_default();
        buffer.insert(env.seq, env);

        let mut ready = Vec::new();
        let mut next = next;
        while let Some(env) = buffer.remove(&next) {
            ready.push(env);
            next += 1;
        }
        self.next.insert(key, next);
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::PacketType;

    fn env(seq: u64) -> RoomEventEnvelope {
        RoomEventEnvelope {
            room: "lobby".into(),
            server_id: "s2".into(),
            server_era: "e1".into(),
            seq,
            packet: Packet {
                id: None,
                r#type: PacketType::SendEvent,
                data: None,
                error: None,
                throttled: false,
                throttled_reason: None,
            },
        }
    }

    #[test]
    fn in_order_envelopes_pass_through() {
        let mut order = EventOrder::new();
        assert_eq!(order.accept(env(5)).len(), 1);
        assert_eq!(order.accept(env(6)).len(), 1);
        assert_eq!(order.accept(env(7)).len(), 1);
    }

    #[test]
    fn out_of_order_envelopes_are_buffered() {
        let mut order = EventOrder::new();
        assert_eq!(order.accept(env(1)).len(), 1);
        assert!(order.accept(env(3)).is_empty());
        assert!(order.accept(env(4)).is_empty());
        let ready = order.accept(env(2));
        assert_eq!(
            ready.iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![2, 3, 4]
        );
    }

    #[test]
    fn duplicates_are_dropped() {
        let mut order = EventOrder::new();
        assert_eq!(order.accept(env(1)).len(), 1);
        assert!(order.accept(env(1)).is_empty());
    }

    #[test]
    fn large_gaps_resynchronize() {
        let mut order = EventOrder::new();
        assert_eq!(order.accept(env(1)).len(), 1);
        let ready = order.accept(env(2 + REORDER_WINDOW + 1));
        assert_eq!(ready.len(), 1);
        // The abandoned gap no longer delivers.
        assert!(order.accept(env(3)).is_empty());
    }

    #[tokio::test]
    async fn fabric_coordinates_values_and_peers() {
        let fabric = ClusterFabric::new();
        let a = LocalCluster::attach(
            fabric.clone(),
            PeerDesc {
                id: "a".into(),
                era: "e1".into(),
                version: "test".into(),
            },
        );
        let b = LocalCluster::attach(
            fabric.clone(),
            PeerDesc {
                id: "b".into(),
                era: "e1".into(),
                version: "test".into(),
            },
        );

        let mut watch = b.watch();
        a.set_value("config", "x = 1".into()).await.unwrap();
        assert_eq!(b.get_value("config").await.unwrap().as_deref(), Some("x = 1"));

        let mut saw_config = false;
        while let Ok(event) = watch.try_recv() {
            if let ClusterEvent::ValueSet { key, value } = event {
                if key == "config" {
                    assert_eq!(value, "x = 1");
                    saw_config = true;
                }
            }
        }
        assert!(saw_config);

        assert_eq!(a.peers().len(), 2);
        b.part().await;
        assert_eq!(a.peers().len(), 1);
    }
}
