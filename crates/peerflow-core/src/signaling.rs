//! Client side of the signaling link.
//!
//! [`SignalingClient`] keeps a websocket to the relay alive: it registers on
//! every (re)connect, sends heartbeats while up, backs off exponentially while
//! down and says goodbye on shutdown. [`LocalSignaling`] speaks to an
//! in-process relay task instead of a socket.

use crate::config::ClientConfig;
use crate::identity::LocalIdentity;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use relay_core::{ClientMessage, ConnId, Outbound, RelayHandle, ServerMessage};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use transport_rtc::{IceCandidate, SdpKind, SessionDescription};

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signaling link is down")]
    NotConnected,
    #[error("signaling client has shut down")]
    Closed,
    #[error("encoding envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Negotiation data carried opaquely by `signal` envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: IceCandidate },
    #[serde(other)]
    Unknown,
}

impl SignalPayload {
    pub fn description(desc: SessionDescription) -> Self {
        match desc.kind {
            SdpKind::Offer => SignalPayload::Offer { sdp: desc.sdp },
            SdpKind::Answer => SignalPayload::Answer { sdp: desc.sdp },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SignalPayload::Offer { .. } => "offer",
            SignalPayload::Answer { .. } => "answer",
            SignalPayload::Candidate { .. } => "candidate",
            SignalPayload::Unknown => "unknown",
        }
    }
}

/// What the signaling link reports to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    Connected,
    Disconnected,
    Message(ServerMessage),
}

pub type SignalingEvents = mpsc::UnboundedReceiver<SignalingEvent>;

/// Capability to push envelopes to the relay.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn send(&self, msg: ClientMessage) -> Result<(), SignalingError>;

    fn is_connected(&self) -> bool;
}

/// Exponential reconnect delay: `initial`, doubling, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SignalingTiming {
    pub heartbeat: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl From<&ClientConfig> for SignalingTiming {
    fn from(cfg: &ClientConfig) -> Self {
        Self {
            heartbeat: cfg.heartbeat_interval(),
            backoff_initial: cfg.reconnect_initial(),
            backoff_max: cfg.reconnect_max(),
        }
    }
}

enum LinkEnd {
    Lost,
    Shutdown,
}

/// Reconnecting websocket link to the relay.
pub struct SignalingClient {
    connected: Arc<AtomicBool>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SignalingClient {
    pub fn spawn(
        url: impl Into<String>,
        identity: LocalIdentity,
        timing: SignalingTiming,
    ) -> (Self, SignalingEvents) {
        let url = url.into();
        let connected = Arc::new(AtomicBool::new(false));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run_link(
            url,
            identity,
            timing,
            connected.clone(),
            outbound_rx,
            events_tx,
            shutdown_rx,
        ));

        let client = Self {
            connected,
            outbound: outbound_tx,
            shutdown: shutdown_tx,
            task: Some(task),
        };
        (client, events_rx)
    }

    /// Say goodbye if the link is up and stop reconnecting.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if tokio::time::timeout(Duration::from_secs(2), task).await.is_err() {
                tracing::warn!("Signaling link did not stop in time");
            }
        }
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl SignalingTransport for SignalingClient {
    async fn send(&self, msg: ClientMessage) -> Result<(), SignalingError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SignalingError::NotConnected);
        }
        self.outbound.send(msg).map_err(|_| SignalingError::Closed)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

async fn run_link(
    url: String,
    identity: LocalIdentity,
    timing: SignalingTiming,
    connected: Arc<AtomicBool>,
    mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
    events: mpsc::UnboundedSender<SignalingEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(timing.backoff_initial, timing.backoff_max);

    loop {
        if *shutdown.borrow() {
            break;
        }

        let attempt = tokio::select! {
            res = tokio_tungstenite::connect_async(url.as_str()) => res,
            _ = shutdown.changed() => break,
        };

        match attempt {
            Ok((ws, _)) => {
                tracing::info!("Connected to signaling relay {}", url);
                backoff.reset();
                let end = drive_link(
                    ws,
                    &identity,
                    &timing,
                    &connected,
                    &mut outbound,
                    &events,
                    &mut shutdown,
                )
                .await;

                connected.store(false, Ordering::SeqCst);
                let _ = events.send(SignalingEvent::Disconnected);
                // envelopes queued for the dead link are not replayed
                while outbound.try_recv().is_ok() {}

                if let LinkEnd::Shutdown = end {
                    break;
                }
                tracing::warn!("Signaling link to {} lost", url);
            }
            Err(e) => {
                tracing::warn!("Failed to connect to signaling relay {}: {}", url, e);
            }
        }

        let delay = backoff.next_delay();
        tracing::info!("Reconnecting to signaling relay in {:?}", delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    tracing::debug!("Signaling link task finished");
}

async fn drive_link<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    identity: &LocalIdentity,
    timing: &SignalingTiming,
    connected: &AtomicBool,
    outbound: &mut mpsc::UnboundedReceiver<ClientMessage>,
    events: &mpsc::UnboundedSender<SignalingEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> LinkEnd
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();

    let register = ClientMessage::Register {
        peer_id: identity.peer_id.clone(),
        info: identity.info(),
    };
    if let Err(e) = send_envelope(&mut sink, &register).await {
        tracing::warn!("Failed to register with relay: {}", e);
        return LinkEnd::Lost;
    }
    connected.store(true, Ordering::SeqCst);
    let _ = events.send(SignalingEvent::Connected);

    let mut heartbeat = tokio::time::interval(timing.heartbeat);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(msg) => {
                        let _ = events.send(SignalingEvent::Message(msg));
                    }
                    Err(e) => tracing::warn!("Malformed message from relay: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => return LinkEnd::Lost,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!("Signaling socket error: {}", e);
                    return LinkEnd::Lost;
                }
            },
            out = outbound.recv() => match out {
                Some(msg) => {
                    if let Err(e) = send_envelope(&mut sink, &msg).await {
                        tracing::warn!("Failed to send to relay: {}", e);
                        return LinkEnd::Lost;
                    }
                }
                None => return LinkEnd::Shutdown,
            },
            _ = heartbeat.tick() => {
                let beat = ClientMessage::Heartbeat { peer_id: Some(identity.peer_id.clone()) };
                if let Err(e) = send_envelope(&mut sink, &beat).await {
                    tracing::warn!("Heartbeat failed: {}", e);
                    return LinkEnd::Lost;
                }
            }
            _ = shutdown.changed() => {
                let goodbye = ClientMessage::Goodbye { peer_id: Some(identity.peer_id.clone()) };
                if let Err(e) = send_envelope(&mut sink, &goodbye).await {
                    tracing::debug!("Goodbye not delivered: {}", e);
                }
                let _ = sink.close().await;
                return LinkEnd::Shutdown;
            }
        }
    }
}

async fn send_envelope<K>(sink: &mut K, msg: &ClientMessage) -> anyhow::Result<()>
where
    K: futures::Sink<Message> + Unpin,
    K::Error: std::error::Error + Send + Sync + 'static,
{
    let text = serde_json::to_string(msg)?;
    sink.send(Message::Text(text)).await?;
    Ok(())
}

/// Signaling over an in-process relay task; one instance is one "socket".
pub struct LocalSignaling {
    relay: RelayHandle,
    conn: ConnId,
    peer_id: String,
    connected: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl LocalSignaling {
    /// Attach to `relay` and register as `identity`.
    pub fn connect(relay: &RelayHandle, identity: &LocalIdentity) -> (Self, SignalingEvents) {
        let (conn, mut outbound) = relay.connect();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));

        let register = ClientMessage::Register {
            peer_id: identity.peer_id.clone(),
            info: identity.info(),
        };
        match serde_json::to_string(&register) {
            Ok(text) => relay.deliver(conn, text),
            Err(e) => tracing::error!("Failed to encode registration: {}", e),
        }
        let _ = events_tx.send(SignalingEvent::Connected);

        let link_up = connected.clone();
        let task = tokio::spawn(async move {
            while let Some(out) = outbound.recv().await {
                match out {
                    Outbound::Text(text) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(msg) => {
                            if events_tx.send(SignalingEvent::Message(msg)).is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!("Malformed message from relay: {}", e),
                    },
                    Outbound::Close => break,
                }
            }
            link_up.store(false, Ordering::SeqCst);
            let _ = events_tx.send(SignalingEvent::Disconnected);
        });

        let link = Self {
            relay: relay.clone(),
            conn,
            peer_id: identity.peer_id.clone(),
            connected,
            task,
        };
        (link, events_rx)
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn
    }

    /// Send goodbye and detach from the relay.
    pub fn close(&self) {
        let goodbye = ClientMessage::Goodbye {
            peer_id: Some(self.peer_id.clone()),
        };
        if let Ok(text) = serde_json::to_string(&goodbye) {
            self.relay.deliver(self.conn, text);
        }
        self.connected.store(false, Ordering::SeqCst);
        self.relay.disconnect(self.conn);
    }
}

impl Drop for LocalSignaling {
    fn drop(&mut self) {
        self.relay.disconnect(self.conn);
        self.task.abort();
    }
}

#[async_trait]
impl SignalingTransport for LocalSignaling {
    async fn send(&self, msg: ClientMessage) -> Result<(), SignalingError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SignalingError::NotConnected);
        }
        let text = serde_json::to_string(&msg)?;
        self.relay.deliver(self.conn, text);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
