//! In-memory directory of registered peers.
//!
//! The registry is owned by exactly one relay task; it has no interior
//! locking and every method runs to completion without yielding.

use crate::model::{DeviceClass, PeerInfo, PeerStatus, PeerSummary};
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub id: String,
    pub display_name: String,
    pub device_class: DeviceClass,
    pub last_seen_at: Instant,
    pub status: PeerStatus,
}

impl PeerRecord {
    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            id: self.id.clone(),
            name: self.display_name.clone(),
            device_type: self.device_class,
            status: self.status,
        }
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    peers: HashMap<String, PeerRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the record for `id`.
    pub fn register(&mut self, id: &str, info: &PeerInfo) {
        self.register_at(id, info, Instant::now())
    }

    pub fn register_at(&mut self, id: &str, info: &PeerInfo, now: Instant) {
        if id.is_empty() {
            tracing::warn!("Ignoring registration with empty peer id");
            return;
        }

        let record = PeerRecord {
            id: id.to_string(),
            display_name: info.name.clone(),
            device_class: info.device_type,
            last_seen_at: now,
            status: PeerStatus::Available,
        };

        if self.peers.insert(id.to_string(), record).is_some() {
            tracing::debug!("Replaced registry record for {}", id);
        } else {
            tracing::info!("Registered peer {} ({} total)", id, self.peers.len());
        }
    }

    /// Refresh liveness of a known peer; unknown ids are ignored.
    pub fn touch(&mut self, id: &str) {
        self.touch_at(id, Instant::now())
    }

    pub fn touch_at(&mut self, id: &str, now: Instant) {
        if let Some(record) = self.peers.get_mut(id) {
            record.last_seen_at = now;
        }
    }

    /// Returns whether a record was actually removed.
    pub fn remove(&mut self, id: &str) -> bool {
        let removed = self.peers.remove(id).is_some();
        if removed {
            tracing::info!("Removed peer {} ({} remaining)", id, self.peers.len());
        }
        removed
    }

    pub fn contains(&self, id: &str) -> bool {
        self.peers.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&PeerRecord> {
        self.peers.get(id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// All current records, in no particular order. Callers filter themselves out.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.peers.values().cloned().collect()
    }

    /// Remove and return every id whose `now - last_seen_at` exceeds `timeout`.
    pub fn sweep_expired(&mut self, now: Instant, timeout: Duration) -> Vec<String> {
        let expired: Vec<String> = self
            .peers
            .values()
            .filter(|p| now.saturating_duration_since(p.last_seen_at) > timeout)
            .map(|p| p.id.clone())
            .collect();

        for id in &expired {
            self.peers.remove(id);
            tracing::info!("Evicted silent peer {}", id);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str) -> PeerInfo {
        PeerInfo {
            name: name.to_string(),
            device_type: DeviceClass::Mobile,
        }
    }

    #[test]
    fn test_register_replaces_instead_of_duplicating() {
        let mut reg = Registry::new();
        reg.register("a", &info("RedLion"));
        reg.register("b", &info("BlueFox"));
        reg.register("a", &info("GreenHawk"));

        let snap = reg.snapshot();
        assert_eq!(snap.len(), 2);
        let a: Vec<_> = snap.iter().filter(|p| p.id == "a").collect();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].display_name, "GreenHawk");
    }

    #[test]
    fn test_empty_id_is_ignored() {
        let mut reg = Registry::new();
        reg.register("", &info("Nobody"));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut reg = Registry::new();
        reg.register("a", &info("RedLion"));
        assert!(reg.remove("a"));
        assert!(!reg.remove("a"));
        assert!(!reg.remove("never-seen"));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_touch_unknown_is_noop() {
        let mut reg = Registry::new();
        reg.touch("ghost");
        assert!(reg.is_empty());
    }

    #[test]
    fn test_sweep_removes_exactly_expired() {
        let mut reg = Registry::new();
        let t0 = Instant::now();
        let timeout = Duration::from_secs(45);

        reg.register_at("old", &info("A"), t0);
        reg.register_at("edge", &info("B"), t0 + Duration::from_secs(15));
        reg.register_at("fresh", &info("C"), t0 + Duration::from_secs(50));
        reg.register_at("touched", &info("D"), t0);
        reg.touch_at("touched", t0 + Duration::from_secs(40));

        // now - edge == 45s exactly: not strictly greater, so it survives
        let now = t0 + Duration::from_secs(60);
        let mut expired = reg.sweep_expired(now, timeout);
        expired.sort();

        assert_eq!(expired, vec!["old".to_string()]);
        assert!(reg.contains("edge"));
        assert!(reg.contains("fresh"));
        assert!(reg.contains("touched"));
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn test_register_unregister_sequences_never_duplicate() {
        let mut reg = Registry::new();
        let ids = ["a", "b", "c"];
        for round in 0..50usize {
            let id = ids[round % ids.len()];
            if round % 4 == 3 {
                reg.remove(id);
            } else {
                reg.register(id, &info("X"));
            }
            let snap = reg.snapshot();
            let mut seen: Vec<&str> = snap.iter().map(|p| p.id.as_str()).collect();
            let before = seen.len();
            seen.sort();
            seen.dedup();
            assert_eq!(before, seen.len());
        }
    }
}
