//! Per-remote negotiation sessions.
//!
//! Every remote peer gets one task that owns its [`Session`]. Signaling
//! envelopes, peer-connection events and local commands for that remote all
//! arrive on the task's inbox, so they are handled one at a time; different
//! remotes run concurrently. A session moves `idle -> connecting -> connected
//! -> closed` and never leaves `closed`: the next attempt gets a new task.

use crate::client::{ClientEvent, Shared};
use crate::conversation::{Entry, FileRecord, Origin};
use crate::error::ClientError;
use crate::frame::{ChunkFrame, ControlFrame, Frame, FrameError};
use crate::identity::new_file_id;
use crate::signaling::SignalPayload;
use crate::transfer::{
    plan_outgoing, split_chunks, BeginOutcome, FileInfo, OutgoingFile, ReceiveOutcome, TransferTable,
};
use bytes::Bytes;
use relay_core::{ClientMessage, PeerStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use transport_rtc::{
    ChannelMessage, ChannelOptions, ConnectionEvent, ConnectionEvents, DataChannel, IceCandidate,
    PeerConnection, SessionDescription, TransportError,
};

/// Label of the single channel carrying every frame kind.
pub const CHANNEL_LABEL: &str = "communication";

const MAX_QUEUED_CANDIDATES: usize = 64;
const BACKPRESSURE_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Connecting,
    Connected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

pub(crate) type Reply<T> = oneshot::Sender<Result<T, ClientError>>;

pub(crate) enum SessionInput {
    Connect(Reply<()>),
    Signal(SignalPayload),
    Connection(ConnectionEvent),
    SendMessage { text: String, reply: Reply<()> },
    SendFile { file: OutgoingFile, reply: Reply<FileRecord> },
    /// Negotiation deadline fired.
    Deadline,
    /// The remote is no longer in the relay's directory.
    RemoteGone,
    Close,
}

pub(crate) struct SessionSlot {
    pub generation: u64,
    pub tx: mpsc::UnboundedSender<SessionInput>,
}

/// Sender-side pacing for chunk frames.
#[derive(Debug, Clone, Copy)]
struct Pacing {
    chunk_size: usize,
    pause: Duration,
    max_buffered: usize,
}

pub(crate) struct Session {
    shared: Arc<Shared>,
    remote_id: String,
    generation: u64,
    inbox: mpsc::UnboundedSender<SessionInput>,
    state: NegotiationState,
    role: Option<Role>,
    pc: Option<Arc<dyn PeerConnection>>,
    channel: Option<Arc<dyn DataChannel>>,
    remote_described: bool,
    queued_candidates: Vec<IceCandidate>,
    deadline: Option<JoinHandle<()>>,
    transfers: TransferTable,
    /// Cleared on teardown; outgoing transfers check it before every chunk.
    alive: Arc<AtomicBool>,
}

impl Session {
    pub(crate) fn new(
        shared: Arc<Shared>,
        remote_id: String,
        generation: u64,
        inbox: mpsc::UnboundedSender<SessionInput>,
    ) -> Self {
        let transfers = TransferTable::new(shared.limits());
        Self {
            shared,
            remote_id,
            generation,
            inbox,
            state: NegotiationState::Idle,
            role: None,
            pc: None,
            channel: None,
            remote_described: false,
            queued_candidates: Vec::new(),
            deadline: None,
            transfers,
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionInput>) {
        tracing::debug!("Session task for {} started (gen {})", self.remote_id, self.generation);

        while let Some(input) = rx.recv().await {
            self.handle(input).await;
            if self.state == NegotiationState::Closed {
                break;
            }
        }
        if self.state != NegotiationState::Closed {
            self.teardown("inbox closed").await;
        }

        rx.close();
        while let Ok(input) = rx.try_recv() {
            match input {
                // a fresh attempt from the remote gets a fresh session
                SessionInput::Signal(offer @ SignalPayload::Offer { .. }) => {
                    tracing::debug!("Re-routing offer from {} to a new session", self.remote_id);
                    self.shared.route(&self.remote_id, SessionInput::Signal(offer), true);
                }
                other => self.reject(other),
            }
        }
        tracing::debug!("Session task for {} finished", self.remote_id);
    }

    async fn handle(&mut self, input: SessionInput) {
        match input {
            SessionInput::Connect(reply) => {
                let result = self.connect().await;
                let _ = reply.send(result);
            }
            SessionInput::Signal(payload) => self.on_signal(payload).await,
            SessionInput::Connection(event) => self.on_connection_event(event).await,
            SessionInput::SendMessage { text, reply } => {
                let result = self.send_message(text).await;
                let _ = reply.send(result);
            }
            SessionInput::SendFile { file, reply } => self.send_file(file, reply),
            SessionInput::Deadline => {
                if self.state == NegotiationState::Connecting {
                    self.teardown("negotiation timed out").await;
                }
            }
            SessionInput::RemoteGone => {
                if self.state == NegotiationState::Connecting {
                    self.teardown("remote left the directory").await;
                }
            }
            SessionInput::Close => self.teardown("closed locally").await,
        }
    }

    fn reject(&self, input: SessionInput) {
        match input {
            SessionInput::Connect(reply) => {
                let _ = reply.send(Err(ClientError::SessionClosed(self.remote_id.clone())));
            }
            SessionInput::SendMessage { reply, .. } => {
                let _ = reply.send(Err(ClientError::NotConnected(self.remote_id.clone())));
            }
            SessionInput::SendFile { reply, .. } => {
                let _ = reply.send(Err(ClientError::NotConnected(self.remote_id.clone())));
            }
            SessionInput::Signal(_)
            | SessionInput::Connection(_)
            | SessionInput::Deadline
            | SessionInput::RemoteGone
            | SessionInput::Close => {}
        }
    }

    fn set_state(&mut self, state: NegotiationState) {
        self.state = state;
        self.shared.emit(ClientEvent::SessionChanged {
            remote_id: self.remote_id.clone(),
            state,
        });
    }

    /// Schedule a `Deadline` input for the current negotiation.
    fn arm_deadline(&mut self) {
        let inbox = self.inbox.clone();
        let after = self.shared.config.negotiation_timeout();
        self.disarm_deadline();
        self.deadline = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = inbox.send(SessionInput::Deadline);
        }));
    }

    fn disarm_deadline(&mut self) {
        if let Some(task) = self.deadline.take() {
            task.abort();
        }
    }

    async fn connect(&mut self) -> Result<(), ClientError> {
        if self.state != NegotiationState::Idle {
            return Err(ClientError::AlreadyActive(self.remote_id.clone()));
        }
        self.role = Some(Role::Initiator);
        self.set_state(NegotiationState::Connecting);
        self.arm_deadline();
        tracing::info!("Connecting to peer {}", self.remote_id);

        match self.start_initiator().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.teardown(&format!("offer failed: {}", e)).await;
                Err(e)
            }
        }
    }

    async fn start_initiator(&mut self) -> Result<(), ClientError> {
        let (pc, events) = self.shared.factory.create(&self.remote_id).await?;
        self.pc = Some(pc.clone());
        self.spawn_pump(events);

        // the offer only describes channels declared before it
        let channel = pc
            .create_data_channel(CHANNEL_LABEL, ChannelOptions::reliable_ordered())
            .await?;
        self.channel = Some(channel);

        let offer = pc.create_offer().await?;
        pc.set_local_description(offer.clone()).await?;
        self.send_signal(SignalPayload::description(offer)).await
    }

    async fn accept_offer(&mut self, sdp: String) -> Result<(), ClientError> {
        let (pc, events) = self.shared.factory.create(&self.remote_id).await?;
        self.pc = Some(pc.clone());
        // start listening before the offer is applied so the inbound channel is not missed
        self.spawn_pump(events);

        pc.set_remote_description(SessionDescription::offer(sdp)).await?;
        self.remote_described = true;
        self.flush_candidates(&pc).await;

        let answer = pc.create_answer().await?;
        pc.set_local_description(answer.clone()).await?;
        self.send_signal(SignalPayload::description(answer)).await
    }

    fn spawn_pump(&self, mut events: ConnectionEvents) {
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if inbox.send(SessionInput::Connection(event)).is_err() {
                    break;
                }
            }
        });
    }

    async fn send_signal(&self, signal: SignalPayload) -> Result<(), ClientError> {
        let kind = signal.kind();
        let msg = ClientMessage::Signal {
            target_peer: self.remote_id.clone(),
            signal: serde_json::to_value(&signal).map_err(crate::signaling::SignalingError::from)?,
        };
        self.shared.signaling.send(msg).await?;
        tracing::debug!("Sent {} to {}", kind, self.remote_id);
        Ok(())
    }

    async fn on_signal(&mut self, payload: SignalPayload) {
        match payload {
            SignalPayload::Offer { sdp } => {
                if self.state != NegotiationState::Idle {
                    tracing::warn!(
                        "Ignoring offer from {}: session is already {:?}",
                        self.remote_id,
                        self.state
                    );
                    return;
                }
                self.role = Some(Role::Responder);
                self.set_state(NegotiationState::Connecting);
                self.arm_deadline();
                tracing::info!("Answering offer from {}", self.remote_id);

                if let Err(e) = self.accept_offer(sdp).await {
                    tracing::warn!("Failed to answer {}: {}", self.remote_id, e);
                    self.teardown("answer failed").await;
                }
            }
            SignalPayload::Answer { sdp } => {
                let expecting = self.state == NegotiationState::Connecting
                    && self.role == Some(Role::Initiator)
                    && !self.remote_described;
                let Some(pc) = self.pc.clone().filter(|_| expecting) else {
                    tracing::warn!("Ignoring unexpected answer from {}", self.remote_id);
                    return;
                };

                match pc.set_remote_description(SessionDescription::answer(sdp)).await {
                    Ok(()) => {
                        self.remote_described = true;
                        self.flush_candidates(&pc).await;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to apply answer from {}: {}", self.remote_id, e);
                        self.teardown("answer rejected").await;
                    }
                }
            }
            SignalPayload::Candidate { candidate } => {
                let Some(pc) = self.pc.clone() else {
                    tracing::debug!("Dropping candidate from {}: no connection", self.remote_id);
                    return;
                };
                if !self.remote_described {
                    if self.queued_candidates.len() >= MAX_QUEUED_CANDIDATES {
                        tracing::warn!("Candidate queue for {} is full, dropping", self.remote_id);
                    } else {
                        self.queued_candidates.push(candidate);
                    }
                    return;
                }
                if let Err(e) = pc.add_ice_candidate(candidate).await {
                    tracing::warn!("Failed to add candidate from {}: {}", self.remote_id, e);
                }
            }
            SignalPayload::Unknown => {
                tracing::warn!("Unknown signal type from {}", self.remote_id);
            }
        }
    }

    async fn flush_candidates(&mut self, pc: &Arc<dyn PeerConnection>) {
        for candidate in std::mem::take(&mut self.queued_candidates) {
            if let Err(e) = pc.add_ice_candidate(candidate).await {
                tracing::warn!("Failed to add queued candidate from {}: {}", self.remote_id, e);
            }
        }
    }

    async fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::LocalCandidate(candidate) => {
                if let Err(e) = self.send_signal(SignalPayload::Candidate { candidate }).await {
                    tracing::warn!("Could not forward candidate to {}: {}", self.remote_id, e);
                }
            }
            ConnectionEvent::DataChannel(channel) => {
                if self.role == Some(Role::Responder) && self.channel.is_none() {
                    tracing::debug!("Inbound channel '{}' from {}", channel.label(), self.remote_id);
                    self.channel = Some(channel);
                } else {
                    tracing::debug!("Ignoring extra channel '{}' from {}", channel.label(), self.remote_id);
                }
            }
            ConnectionEvent::ChannelOpen => {
                if self.state == NegotiationState::Connecting && self.channel.is_some() {
                    self.disarm_deadline();
                    self.set_state(NegotiationState::Connected);
                    self.shared.view.set_status(&self.remote_id, PeerStatus::Connected);
                    tracing::info!("Channel to {} is open", self.remote_id);
                }
            }
            ConnectionEvent::ChannelMessage(msg) => {
                if self.state == NegotiationState::Connected {
                    self.on_frame(msg);
                } else {
                    tracing::debug!("Dropping frame from {} in state {:?}", self.remote_id, self.state);
                }
            }
            ConnectionEvent::ChannelClosed => self.teardown("channel closed").await,
            ConnectionEvent::StateChanged(state) => {
                if state.is_terminal() {
                    self.teardown(&format!("connection {:?}", state)).await;
                } else {
                    tracing::debug!("Connection to {} is {:?}", self.remote_id, state);
                }
            }
        }
    }

    fn on_frame(&mut self, msg: ChannelMessage) {
        let frame = match Frame::decode(&msg) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Dropping malformed frame from {}: {}", self.remote_id, e);
                return;
            }
        };

        match frame {
            Frame::Control(ControlFrame::Message { text }) => {
                self.shared
                    .record(&self.remote_id, Entry::message(Origin::Remote, text));
            }
            Frame::Control(header @ ControlFrame::FileInfo { .. }) => {
                let Some(info) = FileInfo::from_frame(header) else {
                    return;
                };
                let file_id = info.file_id.clone();
                match self.transfers.begin(info) {
                    Ok(BeginOutcome::Started) => {
                        tracing::info!("Receiving file {} from {}", file_id, self.remote_id);
                    }
                    Ok(BeginOutcome::AlreadyPending) => {
                        tracing::warn!("Duplicate file-info for {} from {}", file_id, self.remote_id);
                    }
                    Ok(BeginOutcome::Completed(record)) => self.complete(record),
                    Err(e) => {
                        tracing::warn!("Rejecting file {} from {}: {}", file_id, self.remote_id, e);
                    }
                }
            }
            Frame::Control(ControlFrame::Unknown) => {
                tracing::warn!("Unknown control frame from {}", self.remote_id);
            }
            Frame::Chunk(chunk) => self.on_chunk(chunk),
        }
    }

    fn on_chunk(&mut self, chunk: ChunkFrame) {
        let file_id = chunk.file_id.clone();
        let index = chunk.index;
        match self.transfers.receive(chunk) {
            ReceiveOutcome::Stored { received, total } => {
                tracing::debug!("Chunk {} of {} for {} ({}/{})", index, total, file_id, received, total);
                self.shared.emit(ClientEvent::TransferProgress {
                    remote_id: self.remote_id.clone(),
                    file_id,
                    received,
                    total,
                });
            }
            ReceiveOutcome::Completed(record) => self.complete(record),
            ReceiveOutcome::Duplicate => {
                tracing::debug!("Duplicate chunk {} for {}", index, file_id);
            }
            ReceiveOutcome::UnknownFile => {
                tracing::warn!("Chunk {} for unknown file {} from {}", index, file_id, self.remote_id);
            }
            ReceiveOutcome::OutOfRange { index, total } => {
                tracing::warn!("Chunk index {} out of range ({}) for {}", index, total, file_id);
            }
            ReceiveOutcome::Corrupt { expected, actual } => {
                tracing::warn!(
                    "Dropping file {} from {}: expected {} bytes, got {}",
                    file_id,
                    self.remote_id,
                    expected,
                    actual
                );
            }
        }
    }

    fn complete(&self, record: FileRecord) {
        tracing::info!(
            "Received {} ({} bytes, sha256 {}) from {}",
            record.name,
            record.size,
            record.digest,
            self.remote_id
        );
        self.shared
            .record(&self.remote_id, Entry::file(Origin::Remote, record));
    }

    fn open_channel(&self) -> Result<Arc<dyn DataChannel>, ClientError> {
        match (&self.channel, self.state) {
            (Some(channel), NegotiationState::Connected) if channel.is_open() => Ok(channel.clone()),
            _ => Err(ClientError::NotConnected(self.remote_id.clone())),
        }
    }

    async fn send_message(&mut self, text: String) -> Result<(), ClientError> {
        let channel = self.open_channel()?;
        let frame = Frame::Control(ControlFrame::Message { text: text.clone() }).encode()?;
        channel.send(frame).await?;
        self.shared
            .record(&self.remote_id, Entry::message(Origin::Local, text));
        Ok(())
    }

    fn send_file(&mut self, file: OutgoingFile, reply: Reply<FileRecord>) {
        let channel = match self.open_channel() {
            Ok(channel) => channel,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        let config = &self.shared.config;
        let limits = self.shared.limits();
        let total_chunks = match plan_outgoing(file.data.len() as u64, config.chunk_size, &limits) {
            Ok(n) => n,
            Err(e) => {
                let _ = reply.send(Err(e.into()));
                return;
            }
        };
        let pacing = Pacing {
            chunk_size: config.chunk_size,
            pause: config.chunk_pause(),
            max_buffered: config.max_buffered_amount,
        };
        let info = FileInfo {
            file_id: new_file_id(),
            name: file.name,
            size: file.data.len() as u64,
            mime_type: file.mime_type,
            total_chunks,
        };

        let shared = self.shared.clone();
        let alive = self.alive.clone();
        let remote_id = self.remote_id.clone();
        let data = file.data;
        tokio::spawn(async move {
            tracing::info!(
                "Sending {} to {} ({} bytes, {} chunks)",
                info.name,
                remote_id,
                info.size,
                info.total_chunks
            );
            let result = match stream_file(channel, &alive, &info, &data, pacing).await {
                Ok(()) => {
                    let record = FileRecord::new(info.file_id, info.name, info.mime_type, data);
                    shared.record(&remote_id, Entry::file(Origin::Local, record.clone()));
                    Ok(record)
                }
                Err(StreamEnd::Interrupted) => {
                    tracing::warn!("Transfer of {} to {} interrupted", info.file_id, remote_id);
                    Err(ClientError::SessionClosed(remote_id))
                }
                Err(StreamEnd::Failed(e)) => {
                    tracing::warn!("Transfer of {} to {} failed: {}", info.file_id, remote_id, e);
                    Err(e)
                }
            };
            let _ = reply.send(result);
        });
    }

    /// Move to `closed`: discard partial transfers, release the connection
    /// and free the slot for a future session.
    async fn teardown(&mut self, reason: &str) {
        if self.state == NegotiationState::Closed {
            return;
        }
        tracing::info!("Session with {} closed: {}", self.remote_id, reason);
        self.alive.store(false, Ordering::SeqCst);
        self.disarm_deadline();
        self.set_state(NegotiationState::Closed);
        // inputs routed from here on start a new session
        self.shared.release(&self.remote_id, self.generation);

        for file_id in self.transfers.discard_all() {
            tracing::warn!("Discarding incomplete file {} from {}", file_id, self.remote_id);
            self.shared.emit(ClientEvent::TransferDiscarded {
                remote_id: self.remote_id.clone(),
                file_id,
            });
        }
        self.shared.view.set_status(&self.remote_id, PeerStatus::Available);
        self.queued_candidates.clear();

        if let Some(channel) = self.channel.take() {
            channel.close().await;
        }
        if let Some(pc) = self.pc.take() {
            pc.close().await;
        }
    }
}

enum StreamEnd {
    Interrupted,
    Failed(ClientError),
}

impl From<FrameError> for StreamEnd {
    fn from(e: FrameError) -> Self {
        StreamEnd::Failed(e.into())
    }
}

impl From<TransportError> for StreamEnd {
    fn from(e: TransportError) -> Self {
        StreamEnd::Failed(e.into())
    }
}

/// File-info first, then every chunk in ascending index order.
async fn stream_file(
    channel: Arc<dyn DataChannel>,
    alive: &AtomicBool,
    info: &FileInfo,
    data: &Bytes,
    pacing: Pacing,
) -> Result<(), StreamEnd> {
    let header = Frame::Control(info.to_frame()).encode()?;
    channel.send(header).await?;

    for (index, chunk) in split_chunks(data, pacing.chunk_size).enumerate() {
        loop {
            if !alive.load(Ordering::SeqCst) || !channel.is_open() {
                return Err(StreamEnd::Interrupted);
            }
            if channel.buffered_amount() <= pacing.max_buffered {
                break;
            }
            tokio::time::sleep(BACKPRESSURE_POLL).await;
        }

        let frame = Frame::Chunk(ChunkFrame::new(info.file_id.clone(), index as u32, chunk));
        channel.send(frame.encode()?).await?;

        if !pacing.pause.is_zero() {
            tokio::time::sleep(pacing.pause).await;
        }
    }
    Ok(())
}
