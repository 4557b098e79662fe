//! Wire protocol for the sync stream.
//!
//! Frame format: `len:u32 | type:u8 | req_len:u16 | req_id | payload`
//!
//! All multi-byte integers are big-endian. Strings are length-prefixed
//! (u16 len + UTF-8), byte blobs are u32 len + raw bytes, lists are u32
//! count + repeated elements. `len` counts everything after itself.
//!
//! Every request carries a 36-char v4 UUID request id; responses echo it.
//! Server-pushed messages (notifications, content chunks) carry an empty
//! request id.

pub mod messages;

use anyhow::{Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub use messages::{
    AskVersionIncrease, CheckVersion, ClientMessage, DirectoryCreate, DirectorySubscribe,
    DirectoryUnsubscribe, ErrorCode, ErrorMessage, FileChange, FileChunk,
    FileContentRequestAllow, FileContentRequestDeny, FileId, FileMetadata, FileStatus,
    FileStatusInfo, FileType, FileWrite, FileWriteEnd, OkDirectoryCreated, OkSubscribed,
    OkUnsubscribed, RequestFileContent, RequestVersion, ServerMessage, VersionIncreaseAllow,
    VersionIncreaseDeny, VersionIncreased, VersionRequest,
};

/// Maximum frame size (64MB) - prevents OOM from malicious/corrupted frames
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    // Client -> server
    DirectoryCreate = 0x01,
    DirectorySubscribe = 0x02,
    DirectoryUnsubscribe = 0x03,
    RequestVersion = 0x04,
    AskVersionIncrease = 0x05,
    FileWrite = 0x06,
    FileWriteEnd = 0x07,
    RequestFileContent = 0x08,
    // Server -> client
    OkDirectoryCreated = 0x10,
    OkSubscribed = 0x11,
    OkUnsubscribed = 0x12,
    CheckVersion = 0x13,
    VersionIncreaseAllow = 0x14,
    VersionIncreaseDeny = 0x15,
    VersionIncreased = 0x16,
    FileContentRequestAllow = 0x17,
    FileContentRequestDeny = 0x18,
    Error = 0x19,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::DirectoryCreate),
            0x02 => Some(Self::DirectorySubscribe),
            0x03 => Some(Self::DirectoryUnsubscribe),
            0x04 => Some(Self::RequestVersion),
            0x05 => Some(Self::AskVersionIncrease),
            0x06 => Some(Self::FileWrite),
            0x07 => Some(Self::FileWriteEnd),
            0x08 => Some(Self::RequestFileContent),
            0x10 => Some(Self::OkDirectoryCreated),
            0x11 => Some(Self::OkSubscribed),
            0x12 => Some(Self::OkUnsubscribed),
            0x13 => Some(Self::CheckVersion),
            0x14 => Some(Self::VersionIncreaseAllow),
            0x15 => Some(Self::VersionIncreaseDeny),
            0x16 => Some(Self::VersionIncreased),
            0x17 => Some(Self::FileContentRequestAllow),
            0x18 => Some(Self::FileContentRequestDeny),
            0x19 => Some(Self::Error),
            _ => None,
        }
    }
}

// =============================================================================
// Field helpers
// =============================================================================

pub(crate) fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

pub(crate) fn take_str(payload: &mut Bytes) -> Result<String> {
    if payload.remaining() < 2 {
        anyhow::bail!("string length truncated");
    }
    let len = payload.get_u16() as usize;
    if payload.remaining() < len {
        anyhow::bail!("string truncated: expected {} bytes, got {}", len, payload.remaining());
    }
    String::from_utf8(payload.copy_to_bytes(len).to_vec()).context("invalid UTF-8 in string")
}

pub(crate) fn put_blob(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

pub(crate) fn take_blob(payload: &mut Bytes) -> Result<Bytes> {
    if payload.remaining() < 4 {
        anyhow::bail!("blob length truncated");
    }
    let len = payload.get_u32() as usize;
    if payload.remaining() < len {
        anyhow::bail!("blob truncated: expected {} bytes, got {}", len, payload.remaining());
    }
    Ok(payload.copy_to_bytes(len))
}

pub(crate) fn take_u8(payload: &mut Bytes) -> Result<u8> {
    if payload.remaining() < 1 {
        anyhow::bail!("u8 truncated");
    }
    Ok(payload.get_u8())
}

pub(crate) fn take_u32(payload: &mut Bytes) -> Result<u32> {
    if payload.remaining() < 4 {
        anyhow::bail!("u32 truncated");
    }
    Ok(payload.get_u32())
}

pub(crate) fn take_u64(payload: &mut Bytes) -> Result<u64> {
    if payload.remaining() < 8 {
        anyhow::bail!("u64 truncated");
    }
    Ok(payload.get_u64())
}

pub(crate) fn take_bool(payload: &mut Bytes) -> Result<bool> {
    Ok(take_u8(payload)? != 0)
}

/// Assemble a complete frame from a message body.
pub(crate) fn finish_frame(msg_type: MessageType, request_id: &str, body: &[u8]) -> Bytes {
    let req = request_id.as_bytes();
    let payload_len = 1 + 2 + req.len() + body.len();

    let mut buf = BytesMut::with_capacity(4 + payload_len);
    buf.put_u32(payload_len as u32);
    buf.put_u8(msg_type as u8);
    buf.put_u16(req.len() as u16);
    buf.put_slice(req);
    buf.put_slice(body);
    buf.freeze()
}

// =============================================================================
// Frame reading/writing
// =============================================================================

/// Read a single frame from the stream.
/// Returns (message_type, request_id, payload).
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<(MessageType, String, Bytes)> {
    let len = r.read_u32().await.context("failed to read frame length")?;

    // Validate frame size before allocation
    if len > MAX_FRAME_SIZE {
        anyhow::bail!("frame size {} exceeds maximum allowed size {}", len, MAX_FRAME_SIZE);
    }
    if len < 3 {
        anyhow::bail!("frame too short: {} bytes", len);
    }

    let mut raw = vec![0u8; len as usize];
    r.read_exact(&mut raw)
        .await
        .context("failed to read frame payload")?;

    let mut payload = Bytes::from(raw);
    let type_byte = payload.get_u8();
    let msg_type = MessageType::from_u8(type_byte)
        .with_context(|| format!("unknown message type 0x{type_byte:02x}"))?;

    let req_len = payload.get_u16() as usize;
    if payload.remaining() < req_len {
        anyhow::bail!("request id truncated");
    }
    let request_id = String::from_utf8(payload.copy_to_bytes(req_len).to_vec())
        .context("invalid UTF-8 in request id")?;

    Ok((msg_type, request_id, payload))
}

/// Write a pre-encoded frame to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Bytes) -> Result<()> {
    w.write_all(frame).await.context("failed to write frame")?;
    Ok(())
}
