use crate::frame::FrameError;
use crate::signaling::SignalingError;
use crate::transfer::TransferError;
use thiserror::Error;
use transport_rtc::TransportError;

/// Errors returned by collaborator-facing operations on `PeerClient`.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no open channel to {0}")]
    NotConnected(String),
    #[error("a session with {0} is already active")]
    AlreadyActive(String),
    #[error("cannot open a session with ourselves")]
    SelfConnect,
    #[error("session with {0} closed")]
    SessionClosed(String),
    #[error("signaling: {0}")]
    Signaling(#[from] SignalingError),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("transfer: {0}")]
    Transfer(#[from] TransferError),
    #[error("framing: {0}")]
    Frame(#[from] FrameError),
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
