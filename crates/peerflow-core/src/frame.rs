//! Data-channel framing.
//!
//! Text messages carry JSON control frames. Binary messages carry one file
//! chunk each:
//!
//! ```text
//! byte 0          fileIdLength (N)
//! bytes 1..=N     fileId, UTF-8
//! bytes N+1..N+4  chunkIndex, u32 little-endian
//! bytes N+5..     payload
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use transport_rtc::ChannelMessage;

/// The length prefix is one byte, so file ids longer than this cannot be framed.
pub const MAX_FILE_ID_LEN: usize = u8::MAX as usize;

const INDEX_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("file id is empty")]
    EmptyFileId,
    #[error("file id is {0} bytes, limit is 255")]
    FileIdTooLong(usize),
    #[error("chunk frame truncated: {0} bytes")]
    Truncated(usize),
    #[error("file id is not valid UTF-8")]
    InvalidFileId,
    #[error("malformed control frame: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlFrame {
    Message {
        text: String,
    },
    FileInfo {
        #[serde(rename = "fileId")]
        file_id: String,
        name: String,
        size: u64,
        #[serde(rename = "fileType", default)]
        file_type: String,
        #[serde(rename = "totalChunks")]
        total_chunks: u32,
    },
    #[serde(other)]
    Unknown,
}

impl ControlFrame {
    pub fn encode(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(text)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub file_id: String,
    pub index: u32,
    pub payload: Bytes,
}

impl ChunkFrame {
    pub fn new(file_id: impl Into<String>, index: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            file_id: file_id.into(),
            index,
            payload: payload.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let id = self.file_id.as_bytes();
        check_file_id(&self.file_id)?;

        let mut buf = BytesMut::with_capacity(1 + id.len() + INDEX_LEN + self.payload.len());
        buf.put_u8(id.len() as u8);
        buf.put_slice(id);
        buf.put_u32_le(self.index);
        buf.put_slice(&self.payload);
        Ok(buf.to_vec())
    }

    pub fn decode(raw: &[u8]) -> Result<Self, FrameError> {
        let mut buf = raw;
        if buf.remaining() < 1 {
            return Err(FrameError::Truncated(raw.len()));
        }
        let id_len = buf.get_u8() as usize;
        if id_len == 0 {
            return Err(FrameError::EmptyFileId);
        }
        if buf.remaining() < id_len + INDEX_LEN {
            return Err(FrameError::Truncated(raw.len()));
        }

        let file_id = std::str::from_utf8(&buf[..id_len])
            .map_err(|_| FrameError::InvalidFileId)?
            .to_string();
        buf.advance(id_len);
        let index = buf.get_u32_le();

        Ok(Self {
            file_id,
            index,
            payload: Bytes::copy_from_slice(buf),
        })
    }
}

/// Reject ids that could not be carried in a chunk header.
pub fn check_file_id(file_id: &str) -> Result<(), FrameError> {
    match file_id.len() {
        0 => Err(FrameError::EmptyFileId),
        n if n > MAX_FILE_ID_LEN => Err(FrameError::FileIdTooLong(n)),
        _ => Ok(()),
    }
}

/// One decoded data-channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Control(ControlFrame),
    Chunk(ChunkFrame),
}

impl Frame {
    pub fn decode(msg: &ChannelMessage) -> Result<Self, FrameError> {
        match msg {
            ChannelMessage::Text(text) => ControlFrame::decode(text).map(Frame::Control),
            ChannelMessage::Binary(raw) => ChunkFrame::decode(raw).map(Frame::Chunk),
        }
    }

    pub fn encode(&self) -> Result<ChannelMessage, FrameError> {
        match self {
            Frame::Control(control) => control.encode().map(ChannelMessage::Text),
            Frame::Chunk(chunk) => chunk.encode().map(ChannelMessage::Binary),
        }
    }
}
