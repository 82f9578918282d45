//! Chunked file transfer: splitting on the sending side, reassembly on the
//! receiving side.
//!
//! A [`TransferTable`] belongs to exactly one negotiation session and is only
//! touched from that session's task, so it needs no locking.

use crate::conversation::FileRecord;
use crate::error::ClientError;
use crate::frame::{check_file_id, ChunkFrame, ControlFrame, FrameError};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("file is {size} bytes, limit is {limit}")]
    TooLarge { size: u64, limit: u64 },
    #[error("{chunks} chunks exceeds limit of {limit}")]
    TooManyChunks { chunks: u64, limit: u32 },
    #[error("declared {size} bytes in zero chunks")]
    EmptyChunkList { size: u64 },
    #[error("chunk size must be greater than zero")]
    ZeroChunkSize,
    #[error(transparent)]
    Frame(#[from] FrameError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferLimits {
    pub max_file_size: u64,
    pub max_total_chunks: u32,
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self {
            max_file_size: 1024 * 1024 * 1024,
            max_total_chunks: 65_536,
        }
    }
}

/// Header of one file, as announced by a `file-info` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub file_id: String,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub total_chunks: u32,
}

impl FileInfo {
    pub fn to_frame(&self) -> ControlFrame {
        ControlFrame::FileInfo {
            file_id: self.file_id.clone(),
            name: self.name.clone(),
            size: self.size,
            file_type: self.mime_type.clone(),
            total_chunks: self.total_chunks,
        }
    }

    pub fn from_frame(frame: ControlFrame) -> Option<Self> {
        match frame {
            ControlFrame::FileInfo {
                file_id,
                name,
                size,
                file_type,
                total_chunks,
            } => Some(Self {
                file_id,
                name,
                size,
                mime_type: file_type,
                total_chunks,
            }),
            _ => None,
        }
    }
}

/// A file the local user wants to send.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub name: String,
    pub mime_type: String,
    pub data: Bytes,
}

impl OutgoingFile {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    /// Read a file from disk, guessing its MIME type from the extension.
    pub async fn from_path(path: &Path) -> Result<Self, ClientError> {
        let data = tokio::fs::read(path).await.map_err(|source| ClientError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        Ok(Self::new(name, mime_for(path), data))
    }
}

fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "md" | "log" => "text/plain",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}

/// Number of chunks `size` bytes split into.
pub fn chunk_count(size: u64, chunk_size: usize) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    size.div_ceil(chunk_size as u64)
}

/// Zero-copy slices of `data`, each at most `chunk_size` bytes.
pub fn split_chunks(data: &Bytes, chunk_size: usize) -> impl Iterator<Item = Bytes> + '_ {
    let step = chunk_size.max(1);
    (0..data.len())
        .step_by(step)
        .map(move |start| data.slice(start..(start + step).min(data.len())))
}

/// Validate an outgoing file and return its chunk count.
pub fn plan_outgoing(
    size: u64,
    chunk_size: usize,
    limits: &TransferLimits,
) -> Result<u32, TransferError> {
    if chunk_size == 0 {
        return Err(TransferError::ZeroChunkSize);
    }
    if size > limits.max_file_size {
        return Err(TransferError::TooLarge {
            size,
            limit: limits.max_file_size,
        });
    }
    let chunks = chunk_count(size, chunk_size);
    if chunks > limits.max_total_chunks as u64 {
        return Err(TransferError::TooManyChunks {
            chunks,
            limit: limits.max_total_chunks,
        });
    }
    Ok(chunks as u32)
}

#[derive(Debug)]
pub struct PendingTransfer {
    info: FileInfo,
    slots: Vec<Option<Bytes>>,
    received: u32,
}

impl PendingTransfer {
    fn new(info: FileInfo) -> Self {
        Self {
            slots: vec![None; info.total_chunks as usize],
            info,
            received: 0,
        }
    }

    pub fn info(&self) -> &FileInfo {
        &self.info
    }

    pub fn received(&self) -> u32 {
        self.received
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.info.total_chunks
    }

    /// Returns true when the slot was filled for the first time.
    fn store(&mut self, index: u32, payload: Bytes) -> bool {
        let slot = &mut self.slots[index as usize];
        let first = slot.is_none();
        *slot = Some(payload);
        if first {
            self.received += 1;
        }
        first
    }

    fn assemble(self) -> Result<FileRecord, (FileInfo, u64)> {
        let actual: u64 = self.slots.iter().flatten().map(|s| s.len() as u64).sum();
        if actual != self.info.size {
            return Err((self.info, actual));
        }
        let mut buf = BytesMut::with_capacity(actual as usize);
        for slot in self.slots.iter().flatten() {
            buf.extend_from_slice(slot);
        }
        let info = self.info;
        Ok(FileRecord::new(info.file_id, info.name, info.mime_type, buf.freeze()))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum BeginOutcome {
    Started,
    /// A transfer with this id is already in flight; the new header was ignored.
    AlreadyPending,
    /// Zero-length file: nothing to wait for.
    Completed(FileRecord),
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReceiveOutcome {
    Stored { received: u32, total: u32 },
    Duplicate,
    Completed(FileRecord),
    UnknownFile,
    OutOfRange { index: u32, total: u32 },
    /// All chunks arrived but their total length disagrees with the header.
    Corrupt { expected: u64, actual: u64 },
}

#[derive(Debug, Default)]
pub struct TransferTable {
    limits: TransferLimits,
    pending: HashMap<String, PendingTransfer>,
}

impl TransferTable {
    pub fn new(limits: TransferLimits) -> Self {
        Self {
            limits,
            pending: HashMap::new(),
        }
    }

    pub fn begin(&mut self, info: FileInfo) -> Result<BeginOutcome, TransferError> {
        check_file_id(&info.file_id)?;
        if info.size > self.limits.max_file_size {
            return Err(TransferError::TooLarge {
                size: info.size,
                limit: self.limits.max_file_size,
            });
        }
        if info.total_chunks > self.limits.max_total_chunks {
            return Err(TransferError::TooManyChunks {
                chunks: info.total_chunks as u64,
                limit: self.limits.max_total_chunks,
            });
        }
        if self.pending.contains_key(&info.file_id) {
            return Ok(BeginOutcome::AlreadyPending);
        }
        if info.total_chunks == 0 {
            if info.size != 0 {
                return Err(TransferError::EmptyChunkList { size: info.size });
            }
            return Ok(BeginOutcome::Completed(FileRecord::new(
                info.file_id,
                info.name,
                info.mime_type,
                Bytes::new(),
            )));
        }

        tracing::debug!(
            "Expecting {} chunks for {} ({})",
            info.total_chunks,
            info.file_id,
            info.name
        );
        self.pending
            .insert(info.file_id.clone(), PendingTransfer::new(info));
        Ok(BeginOutcome::Started)
    }

    pub fn receive(&mut self, chunk: ChunkFrame) -> ReceiveOutcome {
        let Some(transfer) = self.pending.get_mut(&chunk.file_id) else {
            return ReceiveOutcome::UnknownFile;
        };

        let total = transfer.info.total_chunks;
        if chunk.index >= total {
            return ReceiveOutcome::OutOfRange {
                index: chunk.index,
                total,
            };
        }
        if !transfer.store(chunk.index, chunk.payload) {
            return ReceiveOutcome::Duplicate;
        }
        if !transfer.is_complete() {
            return ReceiveOutcome::Stored {
                received: transfer.received,
                total,
            };
        }

        let Some(done) = self.pending.remove(&chunk.file_id) else {
            return ReceiveOutcome::UnknownFile;
        };
        match done.assemble() {
            Ok(record) => ReceiveOutcome::Completed(record),
            Err((info, actual)) => ReceiveOutcome::Corrupt {
                expected: info.size,
                actual,
            },
        }
    }

    /// Drop every in-flight transfer, returning their ids.
    pub fn discard_all(&mut self) -> Vec<String> {
        self.pending.drain().map(|(id, _)| id).collect()
    }

    pub fn get(&self, file_id: &str) -> Option<&PendingTransfer> {
        self.pending.get(file_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
