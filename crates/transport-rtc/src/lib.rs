//! Peer-connection capability interface.
//!
//! The negotiation layer drives a peer connection and its data channel only
//! through these traits. A browser runtime, a native WebRTC stack or the
//! in-process [`loopback`] implementation can sit behind them.
//!
//! Every asynchronous callback a real stack would fire (local candidates,
//! inbound channels, channel open/close, messages, state changes) arrives as a
//! [`ConnectionEvent`] on the single receiver returned by
//! [`PeerConnectionFactory::create`], in the order it happened.

pub mod loopback;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("connection closed")]
    Closed,
    #[error("channel not open")]
    ChannelClosed,
    #[error("send failed: {0}")]
    SendFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the shape browsers serialize `RTCIceCandidate` to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States after which the connection will not carry data again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

/// One data-channel message: text and binary are distinct on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl ChannelMessage {
    pub fn len(&self) -> usize {
        match self {
            ChannelMessage::Text(t) => t.len(),
            ChannelMessage::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOptions {
    pub ordered: bool,
    /// `None` means fully reliable
    pub max_retransmits: Option<u16>,
}

impl ChannelOptions {
    pub fn reliable_ordered() -> Self {
        Self {
            ordered: true,
            max_retransmits: None,
        }
    }
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self::reliable_ordered()
    }
}

pub enum ConnectionEvent {
    /// A local candidate was gathered and should be sent to the remote.
    LocalCandidate(IceCandidate),
    /// The remote created a channel (responder side).
    DataChannel(Arc<dyn DataChannel>),
    ChannelOpen,
    ChannelMessage(ChannelMessage),
    ChannelClosed,
    StateChanged(ConnectionState),
}

impl std::fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionEvent::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            ConnectionEvent::DataChannel(ch) => f.debug_tuple("DataChannel").field(&ch.label()).finish(),
            ConnectionEvent::ChannelOpen => f.write_str("ChannelOpen"),
            ConnectionEvent::ChannelMessage(m) => {
                f.debug_tuple("ChannelMessage").field(&m.len()).finish()
            }
            ConnectionEvent::ChannelClosed => f.write_str("ChannelClosed"),
            ConnectionEvent::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
        }
    }
}

pub type ConnectionEvents = mpsc::UnboundedReceiver<ConnectionEvent>;

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    /// Bytes queued locally and not yet handed to the network.
    fn buffered_amount(&self) -> usize;

    async fn send(&self, msg: ChannelMessage) -> Result<(), TransportError>;

    async fn close(&self);
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Declare a channel; must happen before `create_offer` for it to be negotiated.
    async fn create_data_channel(
        &self,
        label: &str,
        options: ChannelOptions,
    ) -> Result<Arc<dyn DataChannel>, TransportError>;

    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    async fn close(&self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Create a connection towards `remote_id` together with its event stream.
    async fn create(
        &self,
        remote_id: &str,
    ) -> Result<(Arc<dyn PeerConnection>, ConnectionEvents), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_browser_shape() {
        let raw = r#"{"candidate":"candidate:1 1 udp 2122260223 10.0.0.2 5000 typ host","sdpMid":"0","sdpMLineIndex":0,"usernameFragment":"ab"}"#;
        let c: IceCandidate = serde_json::from_str(raw).unwrap();
        assert_eq!(c.sdp_mid.as_deref(), Some("0"));
        assert_eq!(c.sdp_m_line_index, Some(0));
        assert_eq!(c.username_fragment.as_deref(), Some("ab"));

        let back = serde_json::to_value(&c).unwrap();
        assert_eq!(back["sdpMLineIndex"], 0);
    }

    #[test]
    fn test_description_wire_shape() {
        let v = serde_json::to_value(SessionDescription::answer("v=0")).unwrap();
        assert_eq!(v["type"], "answer");
        assert_eq!(v["sdp"], "v=0");
    }

    #[test]
    fn test_terminal_states() {
        assert!(ConnectionState::Failed.is_terminal());
        assert!(ConnectionState::Disconnected.is_terminal());
        assert!(ConnectionState::Closed.is_terminal());
        assert!(!ConnectionState::Connected.is_terminal());
        assert!(!ConnectionState::New.is_terminal());
    }
}
