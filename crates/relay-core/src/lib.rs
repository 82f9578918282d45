//! Signaling relay core: wire model, peer registry and the relay task.
//!
//! Payloads never pass through here; the relay only introduces peers to each
//! other and forwards their negotiation envelopes.

pub mod model;
pub mod registry;
pub mod relay;

pub use model::{ClientMessage, DeviceClass, PeerInfo, PeerStatus, PeerSummary, ServerMessage};
pub use registry::{PeerRecord, Registry};
pub use relay::{ConnId, Outbound, Relay, RelayConfig, RelayHandle, RelayStats};
