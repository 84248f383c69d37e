//! Binary protocol between sync clients and the server
//!
//! Wire format (all integers are big-endian):
//!
//! Request/Response frame:
//! ```text
//! +--------+--------+------------------+
//! | type   | length | payload          |
//! | 1 byte | 4 bytes| variable         |
//! +--------+--------+------------------+
//! ```
//!
//! Message types:
//! - 0x01: GetFileInfoMap request (no payload)
//! - 0x02: FileInfoMap response (count:4, record*count)
//! - 0x03: UpdateFile request (record)
//! - 0x04: UpdateResult response (accepted:1, current_version:8)
//! - 0x05: GetBlock request (hash:32)
//! - 0x06: Block response (data)
//! - 0x07: PutBlock request (data)
//! - 0x08: PutBlockOk response (hash:32, computed by the server)
//! - 0x09: HasBlocks request (count:4, hashes:[32]*count)
//! - 0x0A: BlocksPresent response (count:4, hashes:[32]*count)
//! - 0x0B: NotFound response (hash:32)
//! - 0x0C: Error response (utf-8 message)
//!
//! A metadata record is `name_len:2, name, version:8, count:4, hashes:[32]*count`.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, SyncError};
use crate::hash::ContentHash;
use crate::meta::{FileMetadata, UpdateOutcome};

/// Default maximum payload size accepted from a peer (64 MiB)
pub const DEFAULT_MAX_FRAME: usize = 64 * 1024 * 1024;

/// Message type identifiers
pub mod msg {
    pub const GET_FILE_INFO_MAP: u8 = 0x01;
    pub const FILE_INFO_MAP: u8 = 0x02;
    pub const UPDATE_FILE: u8 = 0x03;
    pub const UPDATE_RESULT: u8 = 0x04;
    pub const GET_BLOCK: u8 = 0x05;
    pub const BLOCK: u8 = 0x06;
    pub const PUT_BLOCK: u8 = 0x07;
    pub const PUT_BLOCK_OK: u8 = 0x08;
    pub const HAS_BLOCKS: u8 = 0x09;
    pub const BLOCKS_PRESENT: u8 = 0x0A;
    pub const NOT_FOUND: u8 = 0x0B;
    pub const ERROR: u8 = 0x0C;
}

/// Message exchanged between client and server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    GetFileInfoMap,
    FileInfoMap(HashMap<String, FileMetadata>),
    UpdateFile(FileMetadata),
    UpdateResult(UpdateOutcome),
    GetBlock(ContentHash),
    Block(Bytes),
    PutBlock(Bytes),
    PutBlockOk(ContentHash),
    HasBlocks(Vec<ContentHash>),
    BlocksPresent(Vec<ContentHash>),
    NotFound(ContentHash),
    Error(String),
}

impl Message {
    /// Type byte of this message
    #[must_use]
    pub fn msg_type(&self) -> u8 {
        match self {
            Self::GetFileInfoMap => msg::GET_FILE_INFO_MAP,
            Self::FileInfoMap(_) => msg::FILE_INFO_MAP,
            Self::UpdateFile(_) => msg::UPDATE_FILE,
            Self::UpdateResult(_) => msg::UPDATE_RESULT,
            Self::GetBlock(_) => msg::GET_BLOCK,
            Self::Block(_) => msg::BLOCK,
            Self::PutBlock(_) => msg::PUT_BLOCK,
            Self::PutBlockOk(_) => msg::PUT_BLOCK_OK,
            Self::HasBlocks(_) => msg::HAS_BLOCKS,
            Self::BlocksPresent(_) => msg::BLOCKS_PRESENT,
            Self::NotFound(_) => msg::NOT_FOUND,
            Self::Error(_) => msg::ERROR,
        }
    }

    /// Short name for logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::GetFileInfoMap => "GetFileInfoMap",
            Self::FileInfoMap(_) => "FileInfoMap",
            Self::UpdateFile(_) => "UpdateFile",
            Self::UpdateResult(_) => "UpdateResult",
            Self::GetBlock(_) => "GetBlock",
            Self::Block(_) => "Block",
            Self::PutBlock(_) => "PutBlock",
            Self::PutBlockOk(_) => "PutBlockOk",
            Self::HasBlocks(_) => "HasBlocks",
            Self::BlocksPresent(_) => "BlocksPresent",
            Self::NotFound(_) => "NotFound",
            Self::Error(_) => "Error",
        }
    }

    /// Encode the payload (without the frame header)
    ///
    /// # Errors
    /// Returns [`SyncError::Protocol`] if a filename is longer than the
    /// wire format allows.
    pub fn encode_payload(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        match self {
            Self::GetFileInfoMap => {}
            Self::FileInfoMap(files) => {
                buf.put_u32(encode_count(files.len())?);
                // Sorted so equal maps encode identically
                let mut records: Vec<_> = files.values().collect();
                records.sort_by(|a, b| a.filename.cmp(&b.filename));
                for meta in records {
                    encode_record(&mut buf, meta)?;
                }
            }
            Self::UpdateFile(meta) => encode_record(&mut buf, meta)?,
            Self::UpdateResult(outcome) => {
                buf.put_u8(u8::from(outcome.accepted));
                buf.put_u64(outcome.current_version);
            }
            Self::GetBlock(hash) | Self::PutBlockOk(hash) | Self::NotFound(hash) => {
                buf.put_slice(hash.as_bytes());
            }
            Self::Block(data) | Self::PutBlock(data) => buf.put_slice(data),
            Self::HasBlocks(hashes) | Self::BlocksPresent(hashes) => {
                encode_hashes(&mut buf, hashes)?;
            }
            Self::Error(message) => buf.put_slice(message.as_bytes()),
        }
        Ok(buf.freeze())
    }

    /// Decode a message from its type byte and payload
    ///
    /// # Errors
    /// Returns [`SyncError::Protocol`] for unknown types, truncated payloads
    /// and trailing bytes.
    pub fn decode(msg_type: u8, payload: Bytes) -> Result<Self> {
        let mut p = Payload(payload);
        let message = match msg_type {
            msg::GET_FILE_INFO_MAP => Self::GetFileInfoMap,
            msg::FILE_INFO_MAP => {
                let count = p.u32()? as usize;
                let mut files = HashMap::with_capacity(count.min(p.remaining() / 14));
                for _ in 0..count {
                    let meta = p.record()?;
                    files.insert(meta.filename.clone(), meta);
                }
                Self::FileInfoMap(files)
            }
            msg::UPDATE_FILE => Self::UpdateFile(p.record()?),
            msg::UPDATE_RESULT => {
                let accepted = match p.u8()? {
                    0 => false,
                    1 => true,
                    other => return Err(protocol_error(format!("bad accepted flag {other}"))),
                };
                let current_version = p.u64()?;
                Self::UpdateResult(UpdateOutcome {
                    accepted,
                    current_version,
                })
            }
            msg::GET_BLOCK => Self::GetBlock(p.hash()?),
            msg::BLOCK => Self::Block(p.rest()),
            msg::PUT_BLOCK => Self::PutBlock(p.rest()),
            msg::PUT_BLOCK_OK => Self::PutBlockOk(p.hash()?),
            msg::HAS_BLOCKS => Self::HasBlocks(p.hashes()?),
            msg::BLOCKS_PRESENT => Self::BlocksPresent(p.hashes()?),
            msg::NOT_FOUND => Self::NotFound(p.hash()?),
            msg::ERROR => Self::Error(String::from_utf8_lossy(&p.rest()).into_owned()),
            _ => return Err(protocol_error(format!("unknown message type: {msg_type:#04x}"))),
        };
        p.finish()?;
        Ok(message)
    }
}

fn protocol_error(message: impl Into<String>) -> SyncError {
    SyncError::Protocol(message.into())
}

fn encode_count(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| protocol_error(format!("too many entries: {len}")))
}

fn encode_hashes(buf: &mut BytesMut, hashes: &[ContentHash]) -> Result<()> {
    buf.put_u32(encode_count(hashes.len())?);
    for hash in hashes {
        buf.put_slice(hash.as_bytes());
    }
    Ok(())
}

fn encode_record(buf: &mut BytesMut, meta: &FileMetadata) -> Result<()> {
    let name = meta.filename.as_bytes();
    let name_len = u16::try_from(name.len())
        .map_err(|_| protocol_error(format!("filename too long: {} bytes", name.len())))?;
    buf.put_u16(name_len);
    buf.put_slice(name);
    buf.put_u64(meta.version);
    encode_hashes(buf, &meta.block_hash_list)
}

/// Bounds-checked reader over a received payload
struct Payload(Bytes);

impl Payload {
    fn remaining(&self) -> usize {
        self.0.remaining()
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.0.remaining() < n {
            return Err(protocol_error(format!(
                "truncated payload: need {n} bytes, have {}",
                self.0.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.0.get_u8())
    }

    fn u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.0.get_u16())
    }

    fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.0.get_u32())
    }

    fn u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.0.get_u64())
    }

    fn take(&mut self, n: usize) -> Result<Bytes> {
        self.need(n)?;
        Ok(self.0.split_to(n))
    }

    fn hash(&mut self) -> Result<ContentHash> {
        let mut raw = [0u8; 32];
        self.need(32)?;
        self.0.copy_to_slice(&mut raw);
        Ok(ContentHash::from_raw(raw))
    }

    fn hashes(&mut self) -> Result<Vec<ContentHash>> {
        let count = self.u32()? as usize;
        self.need(count.saturating_mul(32))?;
        (0..count).map(|_| self.hash()).collect()
    }

    fn record(&mut self) -> Result<FileMetadata> {
        let name_len = self.u16()? as usize;
        let name = self.take(name_len)?;
        let filename = String::from_utf8(name.to_vec())
            .map_err(|_| protocol_error("filename is not utf-8"))?;
        let version = self.u64()?;
        let block_hash_list = self.hashes()?;
        Ok(FileMetadata::new(filename, version, block_hash_list))
    }

    fn rest(&mut self) -> Bytes {
        let len = self.0.remaining();
        self.0.split_to(len)
    }

    fn finish(&self) -> Result<()> {
        if self.0.has_remaining() {
            return Err(protocol_error(format!(
                "{} trailing bytes in payload",
                self.0.remaining()
            )));
        }
        Ok(())
    }
}

fn transport_error(e: &std::io::Error) -> SyncError {
    SyncError::Transport(e.to_string())
}

/// Protocol writer for sending messages
pub struct ProtocolWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> ProtocolWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Send one message and flush
    ///
    /// # Errors
    /// Returns [`SyncError::Protocol`] if the message cannot be encoded and
    /// [`SyncError::Transport`] if the write fails.
    pub async fn send(&mut self, message: &Message) -> Result<()> {
        let payload = message.encode_payload()?;
        let len = u32::try_from(payload.len())
            .map_err(|_| protocol_error(format!("payload too large: {} bytes", payload.len())))?;

        let mut header = [0u8; 5];
        header[0] = message.msg_type();
        header[1..].copy_from_slice(&len.to_be_bytes());

        self.inner.write_all(&header).await.map_err(|e| transport_error(&e))?;
        self.inner.write_all(&payload).await.map_err(|e| transport_error(&e))?;
        self.inner.flush().await.map_err(|e| transport_error(&e))?;
        Ok(())
    }

    /// Get inner writer
    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Protocol reader for receiving messages
pub struct ProtocolReader<R> {
    inner: R,
    max_frame: usize,
}

impl<R: AsyncRead + Unpin> ProtocolReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            max_frame: DEFAULT_MAX_FRAME,
        }
    }

    /// Reject frames whose payload exceeds `max_frame` bytes
    #[must_use]
    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    /// Read the next message, or `None` if the peer closed the stream
    /// cleanly between frames.
    ///
    /// # Errors
    /// Returns [`SyncError::Transport`] on I/O failure or a stream cut short
    /// mid-frame, and [`SyncError::Protocol`] for oversized or malformed
    /// frames.
    pub async fn read_message(&mut self) -> Result<Option<Message>> {
        let mut header = [0u8; 5];
        match self.inner.read_exact(&mut header[..1]).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(transport_error(&e)),
        }
        self.inner
            .read_exact(&mut header[1..])
            .await
            .map_err(|e| transport_error(&e))?;

        let msg_type = header[0];
        let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
        if len > self.max_frame {
            return Err(protocol_error(format!(
                "frame of {len} bytes exceeds limit of {}",
                self.max_frame
            )));
        }

        let mut payload = vec![0u8; len];
        self.inner
            .read_exact(&mut payload)
            .await
            .map_err(|e| transport_error(&e))?;

        Message::decode(msg_type, Bytes::from(payload)).map(Some)
    }

    /// Get inner reader
    pub fn into_inner(self) -> R {
        self.inner
    }
}
