use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Coarse device class a peer advertises when registering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Mobile,
    Tablet,
    #[default]
    #[serde(alias = "laptop")]
    Desktop,
}

impl DeviceClass {
    /// Lenient parse used for client-supplied strings; anything unknown is a desktop.
    pub fn parse_lenient(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "mobile" => DeviceClass::Mobile,
            "tablet" => DeviceClass::Tablet,
            _ => DeviceClass::Desktop,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    #[default]
    Available,
    Connected,
}

/// Self-description sent with `register`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    #[serde(default = "unknown_name")]
    pub name: String,
    #[serde(rename = "deviceType", default, deserialize_with = "lenient_device")]
    pub device_type: DeviceClass,
}

impl Default for PeerInfo {
    fn default() -> Self {
        Self {
            name: unknown_name(),
            device_type: DeviceClass::Desktop,
        }
    }
}

fn unknown_name() -> String {
    "Unknown".to_string()
}

fn lenient_device<'de, D>(deserializer: D) -> Result<DeviceClass, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.as_deref().map(DeviceClass::parse_lenient).unwrap_or_default())
}

/// One entry of a `peer-list` broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub id: String,
    pub name: String,
    #[serde(rename = "deviceType", default)]
    pub device_type: DeviceClass,
    #[serde(default)]
    pub status: PeerStatus,
}

/// Client -> relay envelopes.
///
/// `signal` carries an opaque payload: the relay forwards it verbatim and
/// never looks inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Register {
        #[serde(rename = "peerId", default)]
        peer_id: String,
        #[serde(default)]
        info: PeerInfo,
    },
    Signal {
        #[serde(rename = "targetPeer")]
        target_peer: String,
        signal: Value,
    },
    Heartbeat {
        #[serde(rename = "peerId", default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<String>,
    },
    Goodbye {
        #[serde(rename = "peerId", default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

/// Relay -> client messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    PeerList {
        peers: Vec<PeerSummary>,
    },
    Signal {
        #[serde(rename = "sourcePeer")]
        source_peer: String,
        signal: Value,
    },
    Registered {
        #[serde(rename = "peerId")]
        peer_id: String,
        message: String,
    },
    Error {
        message: String,
    },
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    /// Serialize to the JSON text sent over the socket.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_from_browser_shape() {
        let raw = r#"{"type":"register","peerId":"peer_ab12cd34","info":{"name":"BlueFox","deviceType":"laptop"}}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Register {
                peer_id: "peer_ab12cd34".into(),
                info: PeerInfo {
                    name: "BlueFox".into(),
                    device_type: DeviceClass::Desktop,
                },
            }
        );
    }

    #[test]
    fn test_register_defaults_missing_info() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"register","peerId":"x"}"#).unwrap();
        match msg {
            ClientMessage::Register { info, .. } => {
                assert_eq!(info.name, "Unknown");
                assert_eq!(info.device_type, DeviceClass::Desktop);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_kind_is_not_a_parse_error() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"dance","peerId":"x"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Unknown);
    }

    #[test]
    fn test_server_signal_wire_names() {
        let msg = ServerMessage::Signal {
            source_peer: "a".into(),
            signal: json!({"type": "offer", "sdp": "v=0"}),
        };
        let v: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(v["type"], "signal");
        assert_eq!(v["sourcePeer"], "a");
        assert_eq!(v["signal"]["sdp"], "v=0");
    }

    #[test]
    fn test_peer_list_wire_names() {
        let msg = ServerMessage::PeerList {
            peers: vec![PeerSummary {
                id: "a".into(),
                name: "RedLion".into(),
                device_type: DeviceClass::Tablet,
                status: PeerStatus::Available,
            }],
        };
        let v: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(v["type"], "peer-list");
        assert_eq!(v["peers"][0]["deviceType"], "tablet");
        assert_eq!(v["peers"][0]["status"], "available");
    }
}
