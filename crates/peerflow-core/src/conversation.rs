use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

/// A file that has been fully sent or fully received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub file_id: String,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub data: Bytes,
    /// SHA-256 of `data`, lowercase hex
    pub digest: String,
}

impl FileRecord {
    pub fn new(file_id: String, name: String, mime_type: String, data: Bytes) -> Self {
        let digest = hex::encode(Sha256::digest(&data));
        Self {
            file_id,
            name,
            size: data.len() as u64,
            mime_type,
            data,
            digest,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Message(String),
    File(FileRecord),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub origin: Origin,
    pub at: SystemTime,
    pub kind: EntryKind,
}

impl Entry {
    pub fn message(origin: Origin, text: impl Into<String>) -> Self {
        Self {
            origin,
            at: SystemTime::now(),
            kind: EntryKind::Message(text.into()),
        }
    }

    pub fn file(origin: Origin, record: FileRecord) -> Self {
        Self {
            origin,
            at: SystemTime::now(),
            kind: EntryKind::File(record),
        }
    }

    pub fn as_file(&self) -> Option<&FileRecord> {
        match &self.kind {
            EntryKind::File(record) => Some(record),
            EntryKind::Message(_) => None,
        }
    }
}

/// Append-only, insertion-ordered log per remote peer.
#[derive(Debug, Default)]
pub struct Conversations {
    logs: HashMap<String, Vec<Entry>>,
}

impl Conversations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, remote_id: &str, entry: Entry) {
        self.logs.entry(remote_id.to_string()).or_default().push(entry);
    }

    pub fn entries(&self, remote_id: &str) -> Vec<Entry> {
        self.logs.get(remote_id).cloned().unwrap_or_default()
    }

    pub fn len(&self, remote_id: &str) -> usize {
        self.logs.get(remote_id).map_or(0, Vec::len)
    }

    pub fn remotes(&self) -> Vec<String> {
        self.logs.keys().cloned().collect()
    }
}
