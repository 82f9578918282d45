//! Collaborator facade: everything the presentation layer calls or observes.
//!
//! `PeerClient` is cheap to clone. It routes signaling envelopes and local
//! commands to per-remote session tasks, and exposes the peer directory, the
//! conversation logs and a stream of [`ClientEvent`]s.

use crate::config::ClientConfig;
use crate::conversation::{Conversations, Entry, FileRecord};
use crate::error::ClientError;
use crate::identity::LocalIdentity;
use crate::session::{NegotiationState, Session, SessionInput, SessionSlot};
use crate::signaling::{SignalPayload, SignalingEvent, SignalingEvents, SignalingTransport};
use crate::transfer::{OutgoingFile, TransferLimits};
use crate::view::{PeerDirectory, PeerView};
use parking_lot::Mutex;
use relay_core::{PeerStatus, PeerSummary, ServerMessage};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use transport_rtc::PeerConnectionFactory;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    SignalingUp,
    SignalingDown,
    SessionChanged {
        remote_id: String,
        state: NegotiationState,
    },
    Appended {
        remote_id: String,
        entry: Entry,
    },
    TransferProgress {
        remote_id: String,
        file_id: String,
        received: u32,
        total: u32,
    },
    TransferDiscarded {
        remote_id: String,
        file_id: String,
    },
}

pub(crate) struct Shared {
    pub(crate) identity: LocalIdentity,
    pub(crate) config: ClientConfig,
    pub(crate) signaling: Arc<dyn SignalingTransport>,
    pub(crate) factory: Arc<dyn PeerConnectionFactory>,
    pub(crate) view: PeerView,
    conversations: Mutex<Conversations>,
    events: broadcast::Sender<ClientEvent>,
    sessions: Mutex<HashMap<String, SessionSlot>>,
    next_generation: AtomicU64,
}

impl Shared {
    pub(crate) fn limits(&self) -> TransferLimits {
        TransferLimits {
            max_file_size: self.config.max_file_size,
            max_total_chunks: self.config.max_total_chunks,
        }
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn record(&self, remote_id: &str, entry: Entry) {
        self.conversations.lock().append(remote_id, entry.clone());
        self.emit(ClientEvent::Appended {
            remote_id: remote_id.to_string(),
            entry,
        });
    }

    /// Hand `input` to the session for `remote_id`. With `open` set a new
    /// session is started when none is running; otherwise the input is
    /// handed back.
    pub(crate) fn route(
        self: &Arc<Self>,
        remote_id: &str,
        input: SessionInput,
        open: bool,
    ) -> Option<SessionInput> {
        let mut sessions = self.sessions.lock();
        let input = match sessions.get(remote_id) {
            Some(slot) => match slot.tx.send(input) {
                Ok(()) => return None,
                Err(mpsc::error::SendError(input)) => {
                    sessions.remove(remote_id);
                    input
                }
            },
            None => input,
        };
        if !open {
            return Some(input);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(input);
        sessions.insert(
            remote_id.to_string(),
            SessionSlot {
                generation,
                tx: tx.clone(),
            },
        );
        drop(sessions);

        let session = Session::new(self.clone(), remote_id.to_string(), generation, tx);
        tokio::spawn(session.run(rx));
        None
    }

    /// Forget the slot, unless a newer session already took it.
    pub(crate) fn release(&self, remote_id: &str, generation: u64) {
        let mut sessions = self.sessions.lock();
        if sessions.get(remote_id).map(|s| s.generation) == Some(generation) {
            sessions.remove(remote_id);
        }
    }
}

#[derive(Clone)]
pub struct PeerClient {
    shared: Arc<Shared>,
}

impl PeerClient {
    pub fn new(
        identity: LocalIdentity,
        config: ClientConfig,
        signaling: Arc<dyn SignalingTransport>,
        factory: Arc<dyn PeerConnectionFactory>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                identity,
                config,
                signaling,
                factory,
                view: PeerView::new(),
                conversations: Mutex::new(Conversations::new()),
                events,
                sessions: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Consume a signaling event stream until it ends.
    pub fn attach(&self, mut events: SignalingEvents) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                client.handle_signaling_event(event);
            }
            tracing::debug!("Signaling event stream ended");
        })
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.shared.identity
    }

    pub fn local_id(&self) -> &str {
        &self.shared.identity.peer_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub fn handle_signaling_event(&self, event: SignalingEvent) {
        match event {
            SignalingEvent::Connected => {
                tracing::info!("Signaling link up");
                self.shared.emit(ClientEvent::SignalingUp);
            }
            SignalingEvent::Disconnected => {
                // established sessions do not depend on the relay
                tracing::warn!("Signaling link down");
                self.shared.emit(ClientEvent::SignalingDown);
            }
            SignalingEvent::Message(msg) => self.handle_server_message(msg),
        }
    }

    pub fn handle_server_message(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::PeerList { peers } => {
                tracing::debug!("Peer list with {} entries", peers.len());
                let gone: Vec<String> = {
                    let listed: HashSet<&str> = peers.iter().map(|p| p.id.as_str()).collect();
                    self.shared
                        .sessions
                        .lock()
                        .keys()
                        .filter(|id| !listed.contains(id.as_str()))
                        .cloned()
                        .collect()
                };
                self.shared.view.apply_list(self.local_id(), peers);
                // only sessions still negotiating act on this
                for remote in gone {
                    self.shared.route(&remote, SessionInput::RemoteGone, false);
                }
            }
            ServerMessage::Signal {
                source_peer,
                signal,
            } => self.handle_signal(source_peer, signal),
            ServerMessage::Registered { peer_id, message } => {
                tracing::info!("Registered as {}: {}", peer_id, message);
            }
            ServerMessage::Error { message } => {
                tracing::warn!("Relay reported an error: {}", message);
            }
            ServerMessage::Unknown => {
                tracing::debug!("Ignoring unknown relay message");
            }
        }
    }

    fn handle_signal(&self, source: String, signal: serde_json::Value) {
        if source == self.local_id() || source.is_empty() {
            tracing::warn!("Ignoring signal with source {:?}", source);
            return;
        }
        let payload: SignalPayload = match serde_json::from_value(signal) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("Malformed signal from {}: {}", source, e);
                return;
            }
        };

        let kind = payload.kind();
        let opens = matches!(payload, SignalPayload::Offer { .. });
        if self
            .shared
            .route(&source, SessionInput::Signal(payload), opens)
            .is_some()
        {
            tracing::debug!("Dropping {} from {}: no session", kind, source);
        }
    }

    /// Start negotiating with `remote_id`; returns once the offer is sent.
    pub async fn connect_to_peer(&self, remote_id: &str) -> Result<(), ClientError> {
        if remote_id == self.local_id() {
            return Err(ClientError::SelfConnect);
        }
        let (tx, rx) = oneshot::channel();
        self.shared.route(remote_id, SessionInput::Connect(tx), true);
        rx.await
            .map_err(|_| ClientError::SessionClosed(remote_id.to_string()))?
    }

    pub async fn send_message(&self, remote_id: &str, text: impl Into<String>) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        let input = SessionInput::SendMessage {
            text: text.into(),
            reply: tx,
        };
        if self.shared.route(remote_id, input, false).is_some() {
            return Err(ClientError::NotConnected(remote_id.to_string()));
        }
        rx.await
            .map_err(|_| ClientError::SessionClosed(remote_id.to_string()))?
    }

    /// Resolves when the last chunk has been handed to the channel.
    pub async fn send_file(&self, remote_id: &str, file: OutgoingFile) -> Result<FileRecord, ClientError> {
        let (tx, rx) = oneshot::channel();
        let input = SessionInput::SendFile { file, reply: tx };
        if self.shared.route(remote_id, input, false).is_some() {
            return Err(ClientError::NotConnected(remote_id.to_string()));
        }
        rx.await
            .map_err(|_| ClientError::SessionClosed(remote_id.to_string()))?
    }

    /// Tear down the session with `remote_id`, if any.
    pub fn disconnect(&self, remote_id: &str) {
        if self.shared.route(remote_id, SessionInput::Close, false).is_some() {
            tracing::debug!("No session with {} to close", remote_id);
        }
    }

    /// Close every session.
    pub fn disconnect_all(&self) {
        let remotes: Vec<String> = self.shared.sessions.lock().keys().cloned().collect();
        for remote in remotes {
            self.disconnect(&remote);
        }
    }

    pub fn peers(&self) -> Vec<PeerSummary> {
        self.shared.view.snapshot()
    }

    pub fn watch_peers(&self) -> watch::Receiver<PeerDirectory> {
        self.shared.view.subscribe()
    }

    /// Connection status of one remote as shown to the user.
    pub fn status(&self, remote_id: &str) -> Option<PeerStatus> {
        self.shared.view.status(remote_id)
    }

    pub fn has_session(&self, remote_id: &str) -> bool {
        self.shared.sessions.lock().contains_key(remote_id)
    }

    pub fn conversation(&self, remote_id: &str) -> Vec<Entry> {
        self.shared.conversations.lock().entries(remote_id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    pub fn signaling_connected(&self) -> bool {
        self.shared.signaling.is_connected()
    }
}
