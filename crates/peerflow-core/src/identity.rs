use rand_core::{OsRng, RngCore};
use relay_core::{DeviceClass, PeerInfo};
use std::time::{SystemTime, UNIX_EPOCH};

const COLORS: [&str; 8] = ["Red", "Blue", "Green", "Yellow", "Purple", "Orange", "Cyan", "Magenta"];
const ANIMALS: [&str; 8] = ["Lion", "Tiger", "Bear", "Eagle", "Wolf", "Dolphin", "Fox", "Hawk"];
const LANDSCAPES: [&str; 8] = ["Mountain", "River", "Forest", "Ocean", "Desert", "Sky", "Valley", "Canyon"];

/// How this client presents itself to the relay and to other peers.
///
/// The id is generated per process and never persisted: a restart is a new
/// peer as far as the registry is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub peer_id: String,
    pub display_name: String,
    pub device_class: DeviceClass,
}

impl LocalIdentity {
    /// Fresh random id; `display_name` falls back to a memorable generated name.
    pub fn generate(display_name: Option<String>, device_class: DeviceClass) -> Self {
        let display_name = display_name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(memorable_name);
        Self {
            peer_id: format!("peer_{}", short_hex()),
            display_name,
            device_class,
        }
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            name: self.display_name.clone(),
            device_type: self.device_class,
        }
    }
}

/// `<Color><Animal>` or `<Color><Landscape>`, e.g. `BlueFox`, `CyanValley`.
pub fn memorable_name() -> String {
    let roll = OsRng.next_u32();
    let color = COLORS[(roll % COLORS.len() as u32) as usize];
    let nouns = if (roll >> 8) & 1 == 0 { &ANIMALS } else { &LANDSCAPES };
    let noun = nouns[((roll >> 16) % nouns.len() as u32) as usize];
    format!("{}{}", color, noun)
}

/// `<unix millis>_<8 hex>`, unique enough to key concurrent transfers.
pub fn new_file_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("{}_{}", millis, short_hex())
}

fn short_hex() -> String {
    let mut bytes = [0u8; 4];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_shape() {
        let id = LocalIdentity::generate(None, DeviceClass::Mobile);
        let suffix = id.peer_id.strip_prefix("peer_").unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id.info().device_type, DeviceClass::Mobile);
    }

    #[test]
    fn test_display_name_override() {
        let id = LocalIdentity::generate(Some("Kitchen".into()), DeviceClass::Desktop);
        assert_eq!(id.display_name, "Kitchen");

        let blank = LocalIdentity::generate(Some("  ".into()), DeviceClass::Desktop);
        assert!(!blank.display_name.trim().is_empty());
    }

    #[test]
    fn test_memorable_name_parts() {
        for _ in 0..32 {
            let name = memorable_name();
            let color = COLORS.iter().find(|c| name.starts_with(**c)).unwrap();
            let rest = &name[color.len()..];
            assert!(ANIMALS.contains(&rest) || LANDSCAPES.contains(&rest), "{}", name);
        }
    }

    #[test]
    fn test_file_ids_are_distinct() {
        let a = new_file_id();
        let b = new_file_id();
        assert_ne!(a, b);
        let (millis, suffix) = a.split_once('_').unwrap();
        assert!(millis.parse::<u128>().is_ok());
        assert_eq!(suffix.len(), 8);
    }
}
