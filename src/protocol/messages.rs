//! Message payloads for the sync stream.
//!
//! Each message encodes to a complete frame via `encode(request_id)` and
//! decodes from the frame payload (after the frame header has been
//! consumed by `read_frame`).

use anyhow::Result;
use bytes::{Bytes, BytesMut};

use super::{
    finish_frame, put_blob, put_str, take_blob, take_bool, take_str, take_u32, take_u64, take_u8,
    MessageType,
};

// =============================================================================
// Shared types
// =============================================================================

/// Kind of a synchronized entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum FileType {
    #[default]
    File = 0,
    /// A directory entry; has no content.
    Directory = 1,
}

impl FileType {
    pub fn from_u8(b: u8) -> Self {
        match b {
            1 => Self::Directory,
            _ => Self::File,
        }
    }
}

/// Arbitration outcome for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum FileStatus {
    #[default]
    Free = 0,
    Blocked = 1,
    Denied = 2,
}

impl FileStatus {
    pub fn from_u8(b: u8) -> Self {
        match b {
            1 => Self::Blocked,
            2 => Self::Denied,
            _ => Self::Free,
        }
    }
}

/// Server-side error codes carried by [`ErrorMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    DirectoryNotFound = 1,
    FileNotFound = 2,
    Timeout = 3,
    Internal = 4,
}

impl ErrorCode {
    pub fn from_u8(b: u8) -> Self {
        match b {
            1 => Self::DirectoryNotFound,
            2 => Self::FileNotFound,
            3 => Self::Timeout,
            _ => Self::Internal,
        }
    }
}

/// Versioned metadata of one file, as held by the server and mirrored by
/// clients.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileMetadata {
    pub id: String,
    pub directory_id: String,
    pub version: u64,
    /// Version at which content last changed; 0 if the file never had
    /// content. Unchanged by pure metadata edits.
    pub content_changed_version: u64,
    pub file_type: FileType,
    pub current_path: String,
    pub deleted: bool,
}

impl FileMetadata {
    pub(crate) fn encode_into(&self, buf: &mut BytesMut) {
        use bytes::BufMut;
        put_str(buf, &self.id);
        put_str(buf, &self.directory_id);
        buf.put_u64(self.version);
        buf.put_u64(self.content_changed_version);
        buf.put_u8(self.file_type as u8);
        put_str(buf, &self.current_path);
        buf.put_u8(self.deleted as u8);
    }

    pub(crate) fn decode_from(payload: &mut Bytes) -> Result<Self> {
        Ok(Self {
            id: take_str(payload)?,
            directory_id: take_str(payload)?,
            version: take_u64(payload)?,
            content_changed_version: take_u64(payload)?,
            file_type: FileType::from_u8(take_u8(payload)?),
            current_path: take_str(payload)?,
            deleted: take_bool(payload)?,
        })
    }
}

/// Arbitration status for one file, carried by deny responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStatusInfo {
    pub id: String,
    pub directory_id: String,
    pub status: FileStatus,
}

impl FileStatusInfo {
    fn encode_into(&self, buf: &mut BytesMut) {
        use bytes::BufMut;
        put_str(buf, &self.id);
        put_str(buf, &self.directory_id);
        buf.put_u8(self.status as u8);
    }

    fn decode_from(payload: &mut Bytes) -> Result<Self> {
        Ok(Self {
            id: take_str(payload)?,
            directory_id: take_str(payload)?,
            status: FileStatus::from_u8(take_u8(payload)?),
        })
    }
}

/// A (file, directory) id pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileId {
    pub id: String,
    pub directory_id: String,
}

impl FileId {
    fn encode_into(&self, buf: &mut BytesMut) {
        put_str(buf, &self.id);
        put_str(buf, &self.directory_id);
    }

    fn decode_from(payload: &mut Bytes) -> Result<Self> {
        Ok(Self {
            id: take_str(payload)?,
            directory_id: take_str(payload)?,
        })
    }
}

/// One chunk of file content, flowing in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    /// File id; empty when uploading a file the server has not minted yet.
    pub id: String,
    pub directory_id: String,
    /// Directory-relative path; lets receivers place chunks for files they
    /// have no local record of.
    pub current_path: String,
    pub offset: u64,
    pub data: Bytes,
}

impl FileChunk {
    fn encode_into(&self, buf: &mut BytesMut) {
        use bytes::BufMut;
        put_str(buf, &self.id);
        put_str(buf, &self.directory_id);
        put_str(buf, &self.current_path);
        buf.put_u64(self.offset);
        put_blob(buf, &self.data);
    }

    fn decode_from(payload: &mut Bytes) -> Result<Self> {
        Ok(Self {
            id: take_str(payload)?,
            directory_id: take_str(payload)?,
            current_path: take_str(payload)?,
            offset: take_u64(payload)?,
            data: take_blob(payload)?,
        })
    }
}

/// One file entry of an ASK_VERSION_INCREASE request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    /// Empty for files the server has not seen yet.
    pub id: String,
    pub directory_id: String,
    pub current_path: String,
    pub file_type: FileType,
    pub deleted: bool,
    pub content_changed: bool,
    /// Client-minted attempt timestamp, microseconds since epoch.
    pub first_try_time: u64,
}

impl FileChange {
    fn encode_into(&self, buf: &mut BytesMut) {
        use bytes::BufMut;
        put_str(buf, &self.id);
        put_str(buf, &self.directory_id);
        put_str(buf, &self.current_path);
        buf.put_u8(self.file_type as u8);
        buf.put_u8(self.deleted as u8);
        buf.put_u8(self.content_changed as u8);
        buf.put_u64(self.first_try_time);
    }

    fn decode_from(payload: &mut Bytes) -> Result<Self> {
        Ok(Self {
            id: take_str(payload)?,
            directory_id: take_str(payload)?,
            current_path: take_str(payload)?,
            file_type: FileType::from_u8(take_u8(payload)?),
            deleted: take_bool(payload)?,
            content_changed: take_bool(payload)?,
            first_try_time: take_u64(payload)?,
        })
    }
}

/// One entry of a REQUEST_VERSION: a whole directory or a single file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionRequest {
    Directory(String),
    File(FileId),
}

impl VersionRequest {
    fn encode_into(&self, buf: &mut BytesMut) {
        use bytes::BufMut;
        match self {
            VersionRequest::Directory(dir_id) => {
                buf.put_u8(0);
                put_str(buf, dir_id);
            }
            VersionRequest::File(file_id) => {
                buf.put_u8(1);
                file_id.encode_into(buf);
            }
        }
    }

    fn decode_from(payload: &mut Bytes) -> Result<Self> {
        match take_u8(payload)? {
            0 => Ok(VersionRequest::Directory(take_str(payload)?)),
            1 => Ok(VersionRequest::File(FileId::decode_from(payload)?)),
            tag => anyhow::bail!("unknown version request tag: {}", tag),
        }
    }
}

fn encode_list<T>(buf: &mut BytesMut, items: &[T], f: impl Fn(&T, &mut BytesMut)) {
    use bytes::BufMut;
    buf.put_u32(items.len() as u32);
    for item in items {
        f(item, buf);
    }
}

fn decode_list<T>(payload: &mut Bytes, f: impl Fn(&mut Bytes) -> Result<T>) -> Result<Vec<T>> {
    let count = take_u32(payload)? as usize;
    let mut items = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        items.push(f(payload)?);
    }
    Ok(items)
}

// =============================================================================
// Client -> server messages
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryCreate;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectorySubscribe {
    pub directory_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryUnsubscribe {
    pub directory_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestVersion {
    pub requests: Vec<VersionRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AskVersionIncrease {
    pub files: Vec<FileChange>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileWrite {
    pub chunk: FileChunk,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileWriteEnd;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFileContent {
    pub files: Vec<FileId>,
}

/// Any message a client may send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    DirectoryCreate(DirectoryCreate),
    DirectorySubscribe(DirectorySubscribe),
    DirectoryUnsubscribe(DirectoryUnsubscribe),
    RequestVersion(RequestVersion),
    AskVersionIncrease(AskVersionIncrease),
    FileWrite(FileWrite),
    FileWriteEnd(FileWriteEnd),
    RequestFileContent(RequestFileContent),
}

impl ClientMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            ClientMessage::DirectoryCreate(_) => MessageType::DirectoryCreate,
            ClientMessage::DirectorySubscribe(_) => MessageType::DirectorySubscribe,
            ClientMessage::DirectoryUnsubscribe(_) => MessageType::DirectoryUnsubscribe,
            ClientMessage::RequestVersion(_) => MessageType::RequestVersion,
            ClientMessage::AskVersionIncrease(_) => MessageType::AskVersionIncrease,
            ClientMessage::FileWrite(_) => MessageType::FileWrite,
            ClientMessage::FileWriteEnd(_) => MessageType::FileWriteEnd,
            ClientMessage::RequestFileContent(_) => MessageType::RequestFileContent,
        }
    }

    pub fn encode(&self, request_id: &str) -> Bytes {
        let mut body = BytesMut::new();
        match self {
            ClientMessage::DirectoryCreate(_) | ClientMessage::FileWriteEnd(_) => {}
            ClientMessage::DirectorySubscribe(m) => put_str(&mut body, &m.directory_id),
            ClientMessage::DirectoryUnsubscribe(m) => put_str(&mut body, &m.directory_id),
            ClientMessage::RequestVersion(m) => {
                encode_list(&mut body, &m.requests, VersionRequest::encode_into)
            }
            ClientMessage::AskVersionIncrease(m) => {
                encode_list(&mut body, &m.files, FileChange::encode_into)
            }
            ClientMessage::FileWrite(m) => m.chunk.encode_into(&mut body),
            ClientMessage::RequestFileContent(m) => {
                encode_list(&mut body, &m.files, FileId::encode_into)
            }
        }
        finish_frame(self.message_type(), request_id, &body)
    }

    pub fn decode(msg_type: MessageType, mut payload: Bytes) -> Result<Self> {
        let msg = match msg_type {
            MessageType::DirectoryCreate => ClientMessage::DirectoryCreate(DirectoryCreate),
            MessageType::DirectorySubscribe => {
                ClientMessage::DirectorySubscribe(DirectorySubscribe {
                    directory_id: take_str(&mut payload)?,
                })
            }
            MessageType::DirectoryUnsubscribe => {
                ClientMessage::DirectoryUnsubscribe(DirectoryUnsubscribe {
                    directory_id: take_str(&mut payload)?,
                })
            }
            MessageType::RequestVersion => ClientMessage::RequestVersion(RequestVersion {
                requests: decode_list(&mut payload, VersionRequest::decode_from)?,
            }),
            MessageType::AskVersionIncrease => {
                ClientMessage::AskVersionIncrease(AskVersionIncrease {
                    files: decode_list(&mut payload, FileChange::decode_from)?,
                })
            }
            MessageType::FileWrite => ClientMessage::FileWrite(FileWrite {
                chunk: FileChunk::decode_from(&mut payload)?,
            }),
            MessageType::FileWriteEnd => ClientMessage::FileWriteEnd(FileWriteEnd),
            MessageType::RequestFileContent => {
                ClientMessage::RequestFileContent(RequestFileContent {
                    files: decode_list(&mut payload, FileId::decode_from)?,
                })
            }
            other => anyhow::bail!("not a client message type: {:?}", other),
        };
        Ok(msg)
    }
}

// =============================================================================
// Server -> client messages
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OkDirectoryCreated {
    pub directory_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OkSubscribed {
    pub directory_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OkUnsubscribed {
    pub directory_id: String,
}

/// Directory snapshot: response to REQUEST_VERSION and the notification
/// pushed to subscribers after every commit. Always carries the full
/// current listing so peers can diff deterministically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckVersion {
    pub files: Vec<FileMetadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionIncreaseAllow;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionIncreaseDeny {
    pub files: Vec<FileStatusInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionIncreased {
    pub files: Vec<FileMetadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileContentRequestAllow;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContentRequestDeny {
    pub files: Vec<FileStatusInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    pub code: ErrorCode,
    pub message: String,
    pub file_ids: Vec<String>,
}

impl ErrorMessage {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            file_ids: Vec::new(),
        }
    }
}

/// Any message a server may send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    OkDirectoryCreated(OkDirectoryCreated),
    OkSubscribed(OkSubscribed),
    OkUnsubscribed(OkUnsubscribed),
    CheckVersion(CheckVersion),
    VersionIncreaseAllow(VersionIncreaseAllow),
    VersionIncreaseDeny(VersionIncreaseDeny),
    VersionIncreased(VersionIncreased),
    FileContentRequestAllow(FileContentRequestAllow),
    FileContentRequestDeny(FileContentRequestDeny),
    FileWrite(FileWrite),
    FileWriteEnd(FileWriteEnd),
    Error(ErrorMessage),
}

impl ServerMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            ServerMessage::OkDirectoryCreated(_) => MessageType::OkDirectoryCreated,
            ServerMessage::OkSubscribed(_) => MessageType::OkSubscribed,
            ServerMessage::OkUnsubscribed(_) => MessageType::OkUnsubscribed,
            ServerMessage::CheckVersion(_) => MessageType::CheckVersion,
            ServerMessage::VersionIncreaseAllow(_) => MessageType::VersionIncreaseAllow,
            ServerMessage::VersionIncreaseDeny(_) => MessageType::VersionIncreaseDeny,
            ServerMessage::VersionIncreased(_) => MessageType::VersionIncreased,
            ServerMessage::FileContentRequestAllow(_) => MessageType::FileContentRequestAllow,
            ServerMessage::FileContentRequestDeny(_) => MessageType::FileContentRequestDeny,
            ServerMessage::FileWrite(_) => MessageType::FileWrite,
            ServerMessage::FileWriteEnd(_) => MessageType::FileWriteEnd,
            ServerMessage::Error(_) => MessageType::Error,
        }
    }

    pub fn encode(&self, request_id: &str) -> Bytes {
        let mut body = BytesMut::new();
        match self {
            ServerMessage::OkDirectoryCreated(m) => put_str(&mut body, &m.directory_id),
            ServerMessage::OkSubscribed(m) => put_str(&mut body, &m.directory_id),
            ServerMessage::OkUnsubscribed(m) => put_str(&mut body, &m.directory_id),
            ServerMessage::CheckVersion(m) => {
                encode_list(&mut body, &m.files, FileMetadata::encode_into)
            }
            ServerMessage::VersionIncreaseAllow(_)
            | ServerMessage::FileContentRequestAllow(_)
            | ServerMessage::FileWriteEnd(_) => {}
            ServerMessage::VersionIncreaseDeny(m) => {
                encode_list(&mut body, &m.files, FileStatusInfo::encode_into)
            }
            ServerMessage::VersionIncreased(m) => {
                encode_list(&mut body, &m.files, FileMetadata::encode_into)
            }
            ServerMessage::FileContentRequestDeny(m) => {
                encode_list(&mut body, &m.files, FileStatusInfo::encode_into)
            }
            ServerMessage::FileWrite(m) => m.chunk.encode_into(&mut body),
            ServerMessage::Error(m) => {
                use bytes::BufMut;
                body.put_u8(m.code as u8);
                put_str(&mut body, &m.message);
                encode_list(&mut body, &m.file_ids, |id, buf| put_str(buf, id));
            }
        }
        finish_frame(self.message_type(), request_id, &body)
    }

    pub fn decode(msg_type: MessageType, mut payload: Bytes) -> Result<Self> {
        let msg = match msg_type {
            MessageType::OkDirectoryCreated => ServerMessage::OkDirectoryCreated(
                OkDirectoryCreated { directory_id: take_str(&mut payload)? },
            ),
            MessageType::OkSubscribed => {
                ServerMessage::OkSubscribed(OkSubscribed { directory_id: take_str(&mut payload)? })
            }
            MessageType::OkUnsubscribed => ServerMessage::OkUnsubscribed(OkUnsubscribed {
                directory_id: take_str(&mut payload)?,
            }),
            MessageType::CheckVersion => ServerMessage::CheckVersion(CheckVersion {
                files: decode_list(&mut payload, FileMetadata::decode_from)?,
            }),
            MessageType::VersionIncreaseAllow => {
                ServerMessage::VersionIncreaseAllow(VersionIncreaseAllow)
            }
            MessageType::VersionIncreaseDeny => {
                ServerMessage::VersionIncreaseDeny(VersionIncreaseDeny {
                    files: decode_list(&mut payload, FileStatusInfo::decode_from)?,
                })
            }
            MessageType::VersionIncreased => ServerMessage::VersionIncreased(VersionIncreased {
                files: decode_list(&mut payload, FileMetadata::decode_from)?,
            }),
            MessageType::FileContentRequestAllow => {
                ServerMessage::FileContentRequestAllow(FileContentRequestAllow)
            }
            MessageType::FileContentRequestDeny => {
                ServerMessage::FileContentRequestDeny(FileContentRequestDeny {
                    files: decode_list(&mut payload, FileStatusInfo::decode_from)?,
                })
            }
            MessageType::FileWrite => ServerMessage::FileWrite(FileWrite {
                chunk: FileChunk::decode_from(&mut payload)?,
            }),
            MessageType::FileWriteEnd => ServerMessage::FileWriteEnd(FileWriteEnd),
            MessageType::Error => ServerMessage::Error(ErrorMessage {
                code: ErrorCode::from_u8(take_u8(&mut payload)?),
                message: take_str(&mut payload)?,
                file_ids: decode_list(&mut payload, take_str)?,
            }),
            other => anyhow::bail!("not a server message type: {:?}", other),
        };
        Ok(msg)
    }

}

// =============================================================================
// Tests
// =============================================================================
