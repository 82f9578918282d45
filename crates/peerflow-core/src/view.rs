//! The peer directory as the presentation layer sees it.
//!
//! The relay always reports peers as `available`; the client overlays
//! `connected` for remotes with an open channel. All updates go through one
//! `watch` sender so observers never see a half-applied change.

use relay_core::{PeerStatus, PeerSummary};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerDirectory {
    pub peers: Vec<PeerSummary>,
    connected: HashSet<String>,
}

impl PeerDirectory {
    pub fn get(&self, id: &str) -> Option<&PeerSummary> {
        self.peers.iter().find(|p| p.id == id)
    }

    pub fn status(&self, id: &str) -> Option<PeerStatus> {
        if self.connected.contains(id) {
            return Some(PeerStatus::Connected);
        }
        self.get(id).map(|p| p.status)
    }
}

#[derive(Debug, Clone)]
pub struct PeerView {
    tx: Arc<watch::Sender<PeerDirectory>>,
}

impl Default for PeerView {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerView {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(PeerDirectory::default());
        Self { tx: Arc::new(tx) }
    }

    /// Replace the list with a fresh `peer-list`, dropping ourselves.
    pub fn apply_list(&self, local_id: &str, peers: Vec<PeerSummary>) {
        self.tx.send_modify(|dir| {
            dir.peers = peers
                .into_iter()
                .filter(|p| p.id != local_id)
                .map(|mut p| {
                    p.status = if dir.connected.contains(&p.id) {
                        PeerStatus::Connected
                    } else {
                        PeerStatus::Available
                    };
                    p
                })
                .collect();
        });
    }

    pub fn set_status(&self, remote_id: &str, status: PeerStatus) {
        self.tx.send_modify(|dir| {
            match status {
                PeerStatus::Connected => dir.connected.insert(remote_id.to_string()),
                PeerStatus::Available => dir.connected.remove(remote_id),
            };
            if let Some(peer) = dir.peers.iter_mut().find(|p| p.id == remote_id) {
                peer.status = status;
            }
        });
    }

    pub fn snapshot(&self) -> Vec<PeerSummary> {
        self.tx.borrow().peers.clone()
    }

    pub fn status(&self, remote_id: &str) -> Option<PeerStatus> {
        self.tx.borrow().status(remote_id)
    }

    pub fn subscribe(&self) -> watch::Receiver<PeerDirectory> {
        self.tx.subscribe()
    }
}
