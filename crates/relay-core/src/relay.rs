//! Signaling relay: binds sockets to peer ids, forwards addressed envelopes
//! and broadcasts directory snapshots.
//!
//! [`Relay`] is the synchronous dispatcher. [`RelayHandle::spawn`] runs it
//! inside a single task that also owns the liveness sweep, so message
//! handling and eviction never interleave.

use crate::model::{ClientMessage, PeerInfo, PeerSummary, ServerMessage};
use crate::registry::Registry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Identifies one accepted socket for its lifetime.
pub type ConnId = u64;

/// What the relay asks a socket writer to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close,
}

pub type OutboundTx = mpsc::UnboundedSender<Outbound>;
pub type OutboundRx = mpsc::UnboundedReceiver<Outbound>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// How often silent peers are swept
    pub sweep_interval_secs: u64,
    /// A peer not heard from for longer than this is evicted
    pub peer_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 15,
            peer_timeout_secs: 45,
        }
    }
}

impl RelayConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStats {
    pub peers: usize,
    pub connections: usize,
}

struct Connection {
    tx: OutboundTx,
    peer_id: Option<String>,
}

impl Connection {
    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

#[derive(Default)]
pub struct Relay {
    registry: Registry,
    connections: HashMap<ConnId, Connection>,
    bindings: HashMap<String, ConnId>,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            peers: self.registry.len(),
            connections: self.connections.len(),
        }
    }

    /// A new socket gets the directory immediately, before it registers.
    pub fn on_connect(&mut self, conn: ConnId, tx: OutboundTx) {
        let connection = Connection { tx, peer_id: None };
        match self.peer_list_json() {
            Ok(text) => send_to(conn, &connection, text),
            Err(e) => tracing::error!("Failed to serialize peer list: {}", e),
        }
        self.connections.insert(conn, connection);
        tracing::debug!("Connection {} opened ({} total)", conn, self.connections.len());
    }

    /// Parse and dispatch one text frame. Bad input is logged and dropped.
    pub fn on_text(&mut self, conn: ConnId, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => self.on_envelope(conn, msg),
            Err(e) => tracing::warn!("Malformed envelope from connection {}: {}", conn, e),
        }
    }

    pub fn on_envelope(&mut self, conn: ConnId, msg: ClientMessage) {
        if !self.connections.contains_key(&conn) {
            tracing::debug!("Envelope from unknown connection {}", conn);
            return;
        }

        match msg {
            ClientMessage::Register { peer_id, info } => self.handle_register(conn, peer_id, info),
            ClientMessage::Signal {
                target_peer,
                signal,
            } => self.handle_signal(conn, &target_peer, signal),
            ClientMessage::Heartbeat { .. } => {
                if let Some(id) = self.bound_id(conn) {
                    self.registry.touch(&id);
                }
            }
            ClientMessage::Goodbye { .. } => {
                if let Some(id) = self.unbind(conn) {
                    tracing::info!("Peer {} said goodbye", id);
                    self.registry.remove(&id);
                    self.broadcast_snapshot();
                }
            }
            ClientMessage::Unknown => {
                tracing::warn!("Unknown envelope kind from connection {}", conn);
            }
        }
    }

    /// Safe to call after `goodbye` already released the id.
    pub fn on_disconnect(&mut self, conn: ConnId) {
        let peer_id = self.unbind(conn);
        self.connections.remove(&conn);
        tracing::debug!("Connection {} closed ({} remaining)", conn, self.connections.len());

        if let Some(id) = peer_id {
            if self.registry.remove(&id) {
                self.broadcast_snapshot();
            }
        }
    }

    /// Evict silent peers, close their sockets and announce the new directory.
    pub fn sweep(&mut self, now: Instant, timeout: Duration) -> Vec<String> {
        let expired = self.registry.sweep_expired(now, timeout);
        for id in &expired {
            if let Some(conn) = self.bindings.remove(id) {
                if let Some(connection) = self.connections.get_mut(&conn) {
                    connection.peer_id = None;
                    let _ = connection.tx.send(Outbound::Close);
                }
            }
        }
        if !expired.is_empty() {
            self.broadcast_snapshot();
        }
        expired
    }

    /// Serialize the directory once and push it to every open socket.
    pub fn broadcast_snapshot(&self) {
        let text = match self.peer_list_json() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Failed to serialize peer list: {}", e);
                return;
            }
        };

        for (conn, connection) in &self.connections {
            if connection.is_open() {
                send_to(*conn, connection, text.clone());
            }
        }
    }

    fn handle_register(&mut self, conn: ConnId, peer_id: String, info: PeerInfo) {
        if peer_id.is_empty() {
            tracing::warn!("Connection {} sent register without a peer id", conn);
            self.reply(
                conn,
                &ServerMessage::Error {
                    message: "Missing peerId in registration".to_string(),
                },
            );
            return;
        }

        // Same socket under a new id: release the old one.
        if let Some(previous) = self.bound_id(conn) {
            if previous != peer_id {
                self.bindings.remove(&previous);
                self.registry.remove(&previous);
            }
        }

        // Same id from another socket: the newest socket owns it.
        if let Some(other) = self.bindings.get(&peer_id).copied() {
            if other != conn {
                tracing::warn!("Peer {} re-registered from connection {} (was {})", peer_id, conn, other);
                if let Some(old) = self.connections.get_mut(&other) {
                    old.peer_id = None;
                }
            }
        }

        if let Some(connection) = self.connections.get_mut(&conn) {
            connection.peer_id = Some(peer_id.clone());
        }
        self.bindings.insert(peer_id.clone(), conn);
        self.registry.register(&peer_id, &info);

        self.reply(
            conn,
            &ServerMessage::Registered {
                peer_id,
                message: "Registration successful".to_string(),
            },
        );
        self.broadcast_snapshot();
    }

    fn handle_signal(&mut self, conn: ConnId, target: &str, signal: serde_json::Value) {
        let Some(source) = self.bound_id(conn) else {
            tracing::debug!("Dropping signal from unregistered connection {}", conn);
            return;
        };

        let target_conn = self
            .bindings
            .get(target)
            .and_then(|c| self.connections.get(c).map(|connection| (*c, connection)));

        match target_conn {
            Some((target_conn, connection)) if connection.is_open() => {
                let msg = ServerMessage::Signal {
                    source_peer: source,
                    signal,
                };
                match msg.to_json() {
                    Ok(text) => send_to(target_conn, connection, text),
                    Err(e) => tracing::warn!("Failed to serialize signal: {}", e),
                }
            }
            _ => tracing::debug!("Dropping signal from {} to unreachable peer {}", source, target),
        }
    }

    fn reply(&self, conn: ConnId, msg: &ServerMessage) {
        let Some(connection) = self.connections.get(&conn) else {
            return;
        };
        match msg.to_json() {
            Ok(text) => send_to(conn, connection, text),
            Err(e) => tracing::warn!("Failed to serialize reply: {}", e),
        }
    }

    fn bound_id(&self, conn: ConnId) -> Option<String> {
        self.connections.get(&conn).and_then(|c| c.peer_id.clone())
    }

    fn unbind(&mut self, conn: ConnId) -> Option<String> {
        let id = self.connections.get_mut(&conn)?.peer_id.take()?;
        if self.bindings.get(&id) == Some(&conn) {
            self.bindings.remove(&id);
        }
        Some(id)
    }

    fn peer_list_json(&self) -> serde_json::Result<String> {
        let peers: Vec<PeerSummary> = self
            .registry
            .snapshot()
            .iter()
            .map(|record| record.summary())
            .collect();
        ServerMessage::PeerList { peers }.to_json()
    }
}

fn send_to(conn: ConnId, connection: &Connection, text: String) {
    if connection.tx.send(Outbound::Text(text)).is_err() {
        tracing::debug!("Connection {} is gone, skipping send", conn);
    }
}

enum RelayEvent {
    Connected(ConnId, OutboundTx),
    Text(ConnId, String),
    Disconnected(ConnId),
    Stats(oneshot::Sender<RelayStats>),
}

/// Cheap, cloneable front door to the relay task.
#[derive(Clone)]
pub struct RelayHandle {
    tx: mpsc::UnboundedSender<RelayEvent>,
    next_conn: Arc<AtomicU64>,
}

impl RelayHandle {
    /// Start the relay task. It ends once every handle has been dropped.
    pub fn spawn(config: RelayConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_relay(config, rx));
        let handle = Self {
            tx,
            next_conn: Arc::new(AtomicU64::new(1)),
        };
        (handle, task)
    }

    /// Attach a new socket; the receiver yields what must be written to it.
    pub fn connect(&self) -> (ConnId, OutboundRx) {
        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        if self.tx.send(RelayEvent::Connected(conn, tx)).is_err() {
            tracing::warn!("Relay task is not running");
        }
        (conn, rx)
    }

    pub fn deliver(&self, conn: ConnId, text: String) {
        let _ = self.tx.send(RelayEvent::Text(conn, text));
    }

    pub fn disconnect(&self, conn: ConnId) {
        let _ = self.tx.send(RelayEvent::Disconnected(conn));
    }

    pub async fn stats(&self) -> Option<RelayStats> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(RelayEvent::Stats(tx)).ok()?;
        rx.await.ok()
    }
}

async fn run_relay(config: RelayConfig, mut rx: mpsc::UnboundedReceiver<RelayEvent>) {
    let mut relay = Relay::new();
    let timeout = config.peer_timeout();
    let mut sweep = tokio::time::interval(config.sweep_interval());
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    tracing::info!(
        "Relay running (sweep every {:?}, timeout {:?})",
        config.sweep_interval(),
        timeout
    );

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    RelayEvent::Connected(conn, tx) => relay.on_connect(conn, tx),
                    RelayEvent::Text(conn, text) => relay.on_text(conn, &text),
                    RelayEvent::Disconnected(conn) => relay.on_disconnect(conn),
                    RelayEvent::Stats(reply) => {
                        let _ = reply.send(relay.stats());
                    }
                }
            }
            _ = sweep.tick() => {
                let expired = relay.sweep(Instant::now(), timeout);
                if !expired.is_empty() {
                    tracing::info!("Sweep evicted {} peer(s)", expired.len());
                }
            }
        }
    }

    tracing::info!("Relay stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceClass, PeerStatus};
    use serde_json::json;

    fn open(relay: &mut Relay, conn: ConnId) -> OutboundRx {
        let (tx, rx) = mpsc::unbounded_channel();
        relay.on_connect(conn, tx);
        rx
    }

    fn drain(rx: &mut OutboundRx) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Text(text) = item {
                out.push(serde_json::from_str(&text).unwrap());
            }
        }
        out
    }

    fn register(relay: &mut Relay, conn: ConnId, id: &str) {
        relay.on_text(
            conn,
            &json!({"type": "register", "peerId": id, "info": {"name": id, "deviceType": "mobile"}})
                .to_string(),
        );
    }

    fn last_peer_list(msgs: &[ServerMessage]) -> Vec<PeerSummary> {
        msgs.iter()
            .rev()
            .find_map(|m| match m {
                ServerMessage::PeerList { peers } => Some(peers.clone()),
                _ => None,
            })
            .expect("no peer list")
    }

    #[test]
    fn test_snapshot_sent_before_registration() {
        let mut relay = Relay::new();
        let mut a = open(&mut relay, 1);
        register(&mut relay, 1, "a");
        drain(&mut a);

        let mut b = open(&mut relay, 2);
        let msgs = drain(&mut b);
        assert_eq!(msgs.len(), 1);
        let peers = last_peer_list(&msgs);
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].id, "a");
        assert_eq!(peers[0].device_type, DeviceClass::Mobile);
    }

    #[test]
    fn test_register_broadcasts_to_everyone_and_acks_sender() {
        let mut relay = Relay::new();
        let mut a = open(&mut relay, 1);
        let mut b = open(&mut relay, 2);
        register(&mut relay, 1, "a");
        register(&mut relay, 2, "b");

        let a_msgs = drain(&mut a);
        let b_msgs = drain(&mut b);
        assert!(a_msgs
            .iter()
            .any(|m| matches!(m, ServerMessage::Registered { peer_id, .. } if peer_id == "a")));

        for msgs in [&a_msgs, &b_msgs] {
            let mut ids: Vec<_> = last_peer_list(msgs).into_iter().map(|p| p.id).collect();
            ids.sort();
            assert_eq!(ids, vec!["a", "b"]);
            assert!(last_peer_list(msgs)
                .iter()
                .all(|p| p.status == PeerStatus::Available));
        }
    }

    #[test]
    fn test_register_without_id_gets_error_and_stays_open() {
        let mut relay = Relay::new();
        let mut a = open(&mut relay, 1);
        drain(&mut a);
        relay.on_text(1, r#"{"type":"register","info":{"name":"x"}}"#);
        let msgs = drain(&mut a);
        assert!(matches!(msgs.as_slice(), [ServerMessage::Error { .. }]));
        assert_eq!(relay.stats().connections, 1);
        assert_eq!(relay.stats().peers, 0);
    }

    #[test]
    fn test_signal_forwarded_verbatim_to_target_only() {
        let mut relay = Relay::new();
        let mut a = open(&mut relay, 1);
        let mut b = open(&mut relay, 2);
        let mut c = open(&mut relay, 3);
        register(&mut relay, 1, "a");
        register(&mut relay, 2, "b");
        register(&mut relay, 3, "c");
        drain(&mut a);
        drain(&mut b);
        drain(&mut c);

        let payload = json!({"type": "offer", "sdp": "v=0\r\n", "extra": [1, 2]});
        relay.on_text(
            1,
            &json!({"type": "signal", "targetPeer": "b", "signal": payload}).to_string(),
        );

        assert_eq!(
            drain(&mut b),
            vec![ServerMessage::Signal {
                source_peer: "a".into(),
                signal: payload,
            }]
        );
        assert!(drain(&mut a).is_empty());
        assert!(drain(&mut c).is_empty());
    }

    #[test]
    fn test_signal_to_missing_target_does_not_affect_others() {
        let mut relay = Relay::new();
        let mut a = open(&mut relay, 1);
        let b = open(&mut relay, 2);
        let mut c = open(&mut relay, 3);
        register(&mut relay, 1, "a");
        register(&mut relay, 2, "b");
        register(&mut relay, 3, "c");
        drain(&mut a);
        drain(&mut c);

        // b's socket is gone without a close event yet
        drop(b);
        relay.on_text(1, &json!({"type": "signal", "targetPeer": "b", "signal": {"n": 1}}).to_string());
        relay.on_text(1, &json!({"type": "signal", "targetPeer": "zzz", "signal": {"n": 2}}).to_string());
        relay.on_text(1, &json!({"type": "signal", "targetPeer": "c", "signal": {"n": 3}}).to_string());

        let got = drain(&mut c);
        assert_eq!(
            got,
            vec![ServerMessage::Signal {
                source_peer: "a".into(),
                signal: json!({"n": 3}),
            }]
        );
    }

    #[test]
    fn test_signal_from_unregistered_is_dropped() {
        let mut relay = Relay::new();
        let _a = open(&mut relay, 1);
        let mut b = open(&mut relay, 2);
        register(&mut relay, 2, "b");
        drain(&mut b);

        relay.on_text(1, &json!({"type": "signal", "targetPeer": "b", "signal": {}}).to_string());
        assert!(drain(&mut b).is_empty());
    }

    #[test]
    fn test_goodbye_then_close_is_idempotent() {
        let mut relay = Relay::new();
        let _a = open(&mut relay, 1);
        let mut b = open(&mut relay, 2);
        register(&mut relay, 1, "a");
        register(&mut relay, 2, "b");
        drain(&mut b);

        relay.on_text(1, r#"{"type":"goodbye","peerId":"a"}"#);
        let after_goodbye = drain(&mut b);
        assert_eq!(last_peer_list(&after_goodbye).len(), 1);

        relay.on_disconnect(1);
        // no second broadcast: nothing was left to remove
        assert!(drain(&mut b).is_empty());
        assert_eq!(relay.stats(), RelayStats { peers: 1, connections: 1 });
    }

    #[test]
    fn test_disconnect_removes_and_broadcasts() {
        let mut relay = Relay::new();
        let _a = open(&mut relay, 1);
        let mut b = open(&mut relay, 2);
        register(&mut relay, 1, "a");
        register(&mut relay, 2, "b");
        drain(&mut b);

        relay.on_disconnect(1);
        let peers = last_peer_list(&drain(&mut b));
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].id, "b");
    }

    #[test]
    fn test_heartbeat_touches_without_broadcast() {
        let mut relay = Relay::new();
        let mut a = open(&mut relay, 1);
        register(&mut relay, 1, "a");
        drain(&mut a);

        let before = relay.registry().get("a").unwrap().last_seen_at;
        relay.on_text(1, r#"{"type":"heartbeat","peerId":"a"}"#);
        let after = relay.registry().get("a").unwrap().last_seen_at;
        assert!(after >= before);
        assert!(drain(&mut a).is_empty());
    }

    #[test]
    fn test_malformed_and_unknown_frames_keep_socket_open() {
        let mut relay = Relay::new();
        let mut a = open(&mut relay, 1);
        drain(&mut a);
        relay.on_text(1, "{not json");
        relay.on_text(1, r#"{"type":"teleport"}"#);
        relay.on_text(1, r#"{"type":"signal"}"#);
        register(&mut relay, 1, "a");
        assert_eq!(relay.stats().peers, 1);
        assert!(!drain(&mut a).is_empty());
    }

    #[test]
    fn test_reregister_from_new_socket_survives_old_close() {
        let mut relay = Relay::new();
        let _old = open(&mut relay, 1);
        let _new = open(&mut relay, 2);
        register(&mut relay, 1, "a");
        register(&mut relay, 2, "a");

        relay.on_disconnect(1);
        assert!(relay.registry().contains("a"));
        relay.on_disconnect(2);
        assert!(!relay.registry().contains("a"));
    }

    #[test]
    fn test_broadcast_skips_closed_sockets() {
        let mut relay = Relay::new();
        let a = open(&mut relay, 1);
        let mut b = open(&mut relay, 2);
        drop(a);
        register(&mut relay, 2, "b");
        assert!(!drain(&mut b).is_empty());
    }

    #[test]
    fn test_sweep_closes_expired_sockets() {
        let mut relay = Relay::new();
        let mut a = open(&mut relay, 1);
        let mut b = open(&mut relay, 2);
        register(&mut relay, 1, "a");
        drain(&mut a);
        drain(&mut b);

        let expired = relay.sweep(Instant::now() + Duration::from_secs(60), Duration::from_secs(45));
        assert_eq!(expired, vec!["a".to_string()]);

        let mut saw_close = false;
        while let Ok(item) = a.try_recv() {
            if item == Outbound::Close {
                saw_close = true;
            }
        }
        assert!(saw_close);
        assert!(last_peer_list(&drain(&mut b)).is_empty());

        // the later socket close must not broadcast again
        relay.on_disconnect(1);
        assert!(drain(&mut b).is_empty());
    }

    #[tokio::test]
    async fn test_relay_task_roundtrip() {
        let (handle, task) = RelayHandle::spawn(RelayConfig::default());
        let (a, mut a_rx) = handle.connect();
        let (_b, mut b_rx) = handle.connect();

        handle.deliver(
            a,
            json!({"type": "register", "peerId": "a", "info": {"name": "RedLion"}}).to_string(),
        );

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats, RelayStats { peers: 1, connections: 2 });

        // initial empty snapshot, then the broadcast after a registered
        let first = b_rx.recv().await.unwrap();
        assert!(matches!(first, Outbound::Text(ref t) if t.contains("peer-list")));
        let second = b_rx.recv().await.unwrap();
        assert!(matches!(second, Outbound::Text(ref t) if t.contains("RedLion")));
        assert!(a_rx.recv().await.is_some());

        drop(handle);
        task.await.unwrap();
    }
}
