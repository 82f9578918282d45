//! PeerFlow client core.
//!
//! Discovers peers through a signaling relay, negotiates a direct data channel
//! with each remote and moves text messages and chunked files over it.

pub mod client;
pub mod config;
pub mod conversation;
pub mod error;
pub mod frame;
pub mod identity;
pub mod session;
pub mod signaling;
pub mod transfer;
pub mod view;

// Re-export commonly used types
pub use client::{ClientEvent, PeerClient};
pub use config::ClientConfig;
pub use conversation::{Entry, EntryKind, FileRecord, Origin};
pub use error::ClientError;
pub use frame::{ChunkFrame, ControlFrame, Frame, FrameError, MAX_FILE_ID_LEN};
pub use identity::LocalIdentity;
pub use session::{NegotiationState, Role, CHANNEL_LABEL};
pub use signaling::{LocalSignaling, SignalingClient, SignalingEvent, SignalingTiming, SignalingTransport};
pub use transfer::{OutgoingFile, TransferLimits};
pub use view::PeerDirectory;
