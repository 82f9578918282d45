//! In-process implementation of the capability traits.
//!
//! Connections created from factories sharing one [`LoopbackNetwork`] find
//! each other through a token embedded in their session descriptions. The
//! link comes up when the initiator applies the answer; a data channel exists
//! only if the initiator declared it before creating its offer, as with a real
//! stack. Messages are delivered in send order through the receiving
//! connection's event stream.

use crate::{
    ChannelMessage, ChannelOptions, ConnectionEvent, ConnectionEvents, ConnectionState, DataChannel,
    IceCandidate, PeerConnection, PeerConnectionFactory, SdpKind, SessionDescription, TransportError,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

const TOKEN_ATTR: &str = "a=x-loopback-token:";
const LABEL_ATTR: &str = "a=x-channel-label:";

type EventTx = mpsc::UnboundedSender<ConnectionEvent>;

#[derive(Default)]
pub struct LoopbackNetwork {
    next_token: AtomicU64,
    endpoints: Mutex<HashMap<u64, Weak<LoopbackConnection>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn factory(self: &Arc<Self>, local_id: impl Into<String>) -> LoopbackFactory {
        LoopbackFactory {
            network: self.clone(),
            local_id: local_id.into(),
            created: Mutex::new(Vec::new()),
        }
    }

    fn lookup(&self, token: u64) -> Option<Arc<LoopbackConnection>> {
        self.endpoints.lock().get(&token).and_then(Weak::upgrade)
    }

    fn register(&self, conn: &Arc<LoopbackConnection>) {
        let mut endpoints = self.endpoints.lock();
        endpoints.retain(|_, weak| weak.strong_count() > 0);
        endpoints.insert(conn.token, Arc::downgrade(conn));
    }
}

pub struct LoopbackFactory {
    network: Arc<LoopbackNetwork>,
    local_id: String,
    created: Mutex<Vec<Weak<LoopbackConnection>>>,
}

impl LoopbackFactory {
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Connections from this factory that are still alive, oldest first.
    pub fn connections(&self) -> Vec<Arc<LoopbackConnection>> {
        self.created.lock().iter().filter_map(Weak::upgrade).collect()
    }

    pub fn connection_to(&self, remote_id: &str) -> Option<Arc<LoopbackConnection>> {
        self.connections()
            .into_iter()
            .rev()
            .find(|c| c.remote_id == remote_id && !c.is_closed())
    }
}

#[async_trait]
impl PeerConnectionFactory for LoopbackFactory {
    async fn create(
        &self,
        remote_id: &str,
    ) -> Result<(Arc<dyn PeerConnection>, ConnectionEvents), TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(LoopbackConnection {
            token: self.network.next_token.fetch_add(1, Ordering::Relaxed) + 1,
            remote_id: remote_id.to_string(),
            network: self.network.clone(),
            inner: Mutex::new(ConnInner {
                events: Some(tx),
                local: None,
                remote: None,
                channel: None,
                peer: None,
                remote_candidates: Vec::new(),
                closed: false,
            }),
        });

        self.network.register(&conn);
        self.created.lock().push(Arc::downgrade(&conn));
        tracing::debug!("{}: loopback connection {} towards {}", self.local_id, conn.token, remote_id);
        Ok((conn, rx))
    }
}

struct ConnInner {
    events: Option<EventTx>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    channel: Option<Arc<LoopbackChannel>>,
    peer: Option<u64>,
    remote_candidates: Vec<IceCandidate>,
    closed: bool,
}

pub struct LoopbackConnection {
    token: u64,
    remote_id: String,
    network: Arc<LoopbackNetwork>,
    inner: Mutex<ConnInner>,
}

impl LoopbackConnection {
    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.inner.lock().remote_candidates.clone()
    }

    /// Report a network failure on this side, as ICE would.
    pub fn fail(&self) {
        self.emit(ConnectionEvent::StateChanged(ConnectionState::Failed));
    }

    fn emit(&self, event: ConnectionEvent) {
        if let Some(tx) = &self.inner.lock().events {
            let _ = tx.send(event);
        }
    }

    fn events_sender(&self) -> Option<EventTx> {
        self.inner.lock().events.clone()
    }

    fn host_candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                self.token,
                40000 + self.token % 20000
            ),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        }
    }

    /// Initiator side: the answer is in, bring both ends up.
    fn establish(&self, responder: &LoopbackConnection, label: Option<String>) {
        let declared = self.inner.lock().channel.clone();

        match (label, declared) {
            (Some(label), Some(ours)) => {
                let theirs = Arc::new(LoopbackChannel::new(label));
                ours.wire(responder.events_sender());
                theirs.wire(self.events_sender());
                responder.inner.lock().channel = Some(theirs.clone());

                responder.emit(ConnectionEvent::StateChanged(ConnectionState::Connected));
                responder.emit(ConnectionEvent::DataChannel(theirs));
                responder.emit(ConnectionEvent::ChannelOpen);
                self.emit(ConnectionEvent::StateChanged(ConnectionState::Connected));
                self.emit(ConnectionEvent::ChannelOpen);
            }
            _ => {
                tracing::debug!("Loopback link {} <-> {} has no data channel", self.token, responder.token);
                responder.emit(ConnectionEvent::StateChanged(ConnectionState::Connected));
                self.emit(ConnectionEvent::StateChanged(ConnectionState::Connected));
            }
        }
    }
}

#[async_trait]
impl PeerConnection for LoopbackConnection {
    async fn create_data_channel(
        &self,
        label: &str,
        options: ChannelOptions,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(TransportError::Closed);
        }
        if inner.local.is_some() {
            return Err(TransportError::InvalidState("renegotiation is not supported"));
        }
        if inner.channel.is_some() {
            return Err(TransportError::InvalidState("only one channel per connection"));
        }
        if !options.ordered || options.max_retransmits.is_some() {
            tracing::debug!("Loopback channels are always ordered and reliable");
        }

        let channel = Arc::new(LoopbackChannel::new(label.to_string()));
        inner.channel = Some(channel.clone());
        Ok(channel)
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let inner = self.inner.lock();
        if inner.closed {
            return Err(TransportError::Closed);
        }
        let label = inner.channel.as_ref().map(|c| c.label.clone());
        Ok(SessionDescription::offer(build_sdp(self.token, label.as_deref())))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let inner = self.inner.lock();
        if inner.closed {
            return Err(TransportError::Closed);
        }
        let offer = match &inner.remote {
            Some(desc) if desc.kind == SdpKind::Offer => desc,
            _ => return Err(TransportError::InvalidState("no remote offer to answer")),
        };
        let label = parse_attr(&offer.sdp, LABEL_ATTR);
        Ok(SessionDescription::answer(build_sdp(self.token, label.as_deref())))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(TransportError::Closed);
            }
            inner.local = Some(desc);
        }
        self.emit(ConnectionEvent::LocalCandidate(self.host_candidate()));
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let token = parse_attr(&desc.sdp, TOKEN_ATTR)
            .and_then(|t| t.parse::<u64>().ok())
            .ok_or_else(|| TransportError::InvalidDescription("missing loopback token".into()))?;

        let label = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(TransportError::Closed);
            }
            match desc.kind {
                SdpKind::Offer if inner.local.is_some() => {
                    return Err(TransportError::InvalidState("offer after local description"));
                }
                SdpKind::Answer
                    if !matches!(&inner.local, Some(d) if d.kind == SdpKind::Offer) =>
                {
                    return Err(TransportError::InvalidState("answer without local offer"));
                }
                _ => {}
            }
            let kind = desc.kind;
            inner.remote = Some(desc);
            inner.peer = Some(token);
            match kind {
                SdpKind::Answer => Some(
                    inner
                        .local
                        .as_ref()
                        .and_then(|d| parse_attr(&d.sdp, LABEL_ATTR)),
                ),
                SdpKind::Offer => None,
            }
        };

        if let Some(label) = label {
            let responder = self.network.lookup(token).ok_or(TransportError::Closed)?;
            self.establish(&responder, label);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(TransportError::Closed);
        }
        if inner.remote.is_none() {
            return Err(TransportError::InvalidState("remote description not set"));
        }
        inner.remote_candidates.push(candidate);
        Ok(())
    }

    async fn close(&self) {
        let (channel, peer, events) = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            (inner.channel.take(), inner.peer, inner.events.take())
        };

        if let Some(channel) = channel {
            channel.shutdown();
        }
        if let Some(peer) = peer.and_then(|t| self.network.lookup(t)) {
            let peer_channel = peer.inner.lock().channel.clone();
            if let Some(ch) = peer_channel {
                ch.detach();
            }
            peer.emit(ConnectionEvent::StateChanged(ConnectionState::Disconnected));
        }
        drop(events);
    }
}

struct ChannelInner {
    remote: Option<EventTx>,
    open: bool,
}

pub struct LoopbackChannel {
    label: String,
    inner: Mutex<ChannelInner>,
}

impl LoopbackChannel {
    fn new(label: String) -> Self {
        Self {
            label,
            inner: Mutex::new(ChannelInner {
                remote: None,
                open: false,
            }),
        }
    }

    fn wire(&self, remote: Option<EventTx>) {
        let mut inner = self.inner.lock();
        inner.open = remote.is_some();
        inner.remote = remote;
    }

    /// Stop sending without notifying the other end.
    fn detach(&self) {
        let mut inner = self.inner.lock();
        inner.open = false;
        inner.remote = None;
    }

    fn shutdown(&self) {
        let remote = {
            let mut inner = self.inner.lock();
            inner.open = false;
            inner.remote.take()
        };
        if let Some(tx) = remote {
            let _ = tx.send(ConnectionEvent::ChannelClosed);
        }
    }
}

#[async_trait]
impl DataChannel for LoopbackChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.inner.lock().open
    }

    fn buffered_amount(&self) -> usize {
        0
    }

    async fn send(&self, msg: ChannelMessage) -> Result<(), TransportError> {
        let inner = self.inner.lock();
        if !inner.open {
            return Err(TransportError::ChannelClosed);
        }
        match &inner.remote {
            Some(tx) => tx
                .send(ConnectionEvent::ChannelMessage(msg))
                .map_err(|_| TransportError::SendFailed("remote endpoint is gone".into())),
            None => Err(TransportError::ChannelClosed),
        }
    }

    async fn close(&self) {
        self.shutdown();
    }
}

fn build_sdp(token: u64, channel_label: Option<&str>) -> String {
    let mut sdp = format!(
        "v=0\r\no=- {token} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n{TOKEN_ATTR}{token}\r\n"
    );
    if let Some(label) = channel_label {
        sdp.push_str("m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n");
        sdp.push_str("c=IN IP4 0.0.0.0\r\na=mid:0\r\n");
        sdp.push_str(&format!("{LABEL_ATTR}{label}\r\n"));
    }
    sdp
}

fn parse_attr(sdp: &str, attr: &str) -> Option<String> {
    sdp.lines()
        .find_map(|line| line.trim_end().strip_prefix(attr))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next(events: &mut ConnectionEvents) -> ConnectionEvent {
        tokio::time::timeout(std::time::Duration::from_secs(1), events.recv())
            .await
            .expect("timed out")
            .expect("stream ended")
    }

    #[tokio::test]
    async fn test_negotiated_channel_carries_messages_in_order() {
        let net = LoopbackNetwork::new();
        let fa = net.factory("a");
        let fb = net.factory("b");
        let (a, mut a_events) = fa.create("b").await.unwrap();
        let (b, mut b_events) = fb.create("a").await.unwrap();

        let a_chan = a
            .create_data_channel("communication", ChannelOptions::reliable_ordered())
            .await
            .unwrap();
        let offer = a.create_offer().await.unwrap();
        assert!(offer.sdp.contains("m=application"));
        a.set_local_description(offer.clone()).await.unwrap();
        assert!(matches!(next(&mut a_events).await, ConnectionEvent::LocalCandidate(_)));

        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        assert!(matches!(next(&mut b_events).await, ConnectionEvent::LocalCandidate(_)));

        a.set_remote_description(answer).await.unwrap();

        assert!(matches!(
            next(&mut b_events).await,
            ConnectionEvent::StateChanged(ConnectionState::Connected)
        ));
        let b_chan = match next(&mut b_events).await {
            ConnectionEvent::DataChannel(ch) => ch,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(b_chan.label(), "communication");
        assert!(matches!(next(&mut b_events).await, ConnectionEvent::ChannelOpen));

        a_chan.send(ChannelMessage::Text("one".into())).await.unwrap();
        a_chan.send(ChannelMessage::Binary(vec![2])).await.unwrap();
        assert!(matches!(
            next(&mut b_events).await,
            ConnectionEvent::ChannelMessage(ChannelMessage::Text(t)) if t == "one"
        ));
        assert!(matches!(
            next(&mut b_events).await,
            ConnectionEvent::ChannelMessage(ChannelMessage::Binary(b)) if b == vec![2]
        ));

        b_chan.send(ChannelMessage::Text("back".into())).await.unwrap();
        assert!(matches!(
            next(&mut a_events).await,
            ConnectionEvent::StateChanged(ConnectionState::Connected)
        ));
        assert!(matches!(next(&mut a_events).await, ConnectionEvent::ChannelOpen));
        assert!(matches!(
            next(&mut a_events).await,
            ConnectionEvent::ChannelMessage(ChannelMessage::Text(t)) if t == "back"
        ));
    }

    #[tokio::test]
    async fn test_channel_declared_after_offer_is_not_negotiated() {
        let net = LoopbackNetwork::new();
        let (a, _a_events) = net.factory("a").create("b").await.unwrap();

        let offer = a.create_offer().await.unwrap();
        assert!(!offer.sdp.contains("m=application"));
        a.set_local_description(offer).await.unwrap();
        let late = a
            .create_data_channel("communication", ChannelOptions::default())
            .await;
        assert!(matches!(late, Err(TransportError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_candidate_before_remote_description_is_rejected() {
        let net = LoopbackNetwork::new();
        let fb = net.factory("b");
        let (b, _events) = fb.create("a").await.unwrap();
        let cand = IceCandidate {
            candidate: "candidate:9 1 udp 1 127.0.0.1 9 typ host".into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        };
        assert!(b.add_ice_candidate(cand).await.is_err());
    }

    #[tokio::test]
    async fn test_close_notifies_remote() {
        let net = LoopbackNetwork::new();
        let fa = net.factory("a");
        let fb = net.factory("b");
        let (a, mut a_events) = fa.create("b").await.unwrap();
        let (b, mut b_events) = fb.create("a").await.unwrap();

        a.create_data_channel("communication", ChannelOptions::default())
            .await
            .unwrap();
        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        // drain setup events on b
        for _ in 0..4 {
            next(&mut b_events).await;
        }

        a.close().await;
        assert!(fa.connection_to("b").is_none());
        assert!(matches!(next(&mut b_events).await, ConnectionEvent::ChannelClosed));
        assert!(matches!(
            next(&mut b_events).await,
            ConnectionEvent::StateChanged(ConnectionState::Disconnected)
        ));

        // the link is gone in both directions
        while a_events.try_recv().is_ok() {}
        assert!(a_events.recv().await.is_none());
        assert!(fb.connection_to("a").is_some());
    }
}
