//! One stream session per connected client.
//!
//! Owns the client id minted at connect time, the inbound dispatch loop,
//! and at most one in-flight pending upload. Outbound frames (replies and
//! fan-out notifications alike) go through one unbounded channel drained
//! by a writer task, so all writes onto the stream are serialized.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::protocol::{
    self, AskVersionIncrease, CheckVersion, ClientMessage, DirectorySubscribe,
    DirectoryUnsubscribe, ErrorCode, ErrorMessage, FileChunk, FileContentRequestAllow,
    FileContentRequestDeny, FileMetadata, FileStatus, FileWrite, FileWriteEnd,
    OkDirectoryCreated, OkSubscribed, OkUnsubscribed, RequestFileContent, RequestVersion,
    ServerMessage, VersionIncreaseAllow, VersionIncreaseDeny, VersionIncreased, VersionRequest,
};
use crate::server::storage::StorageEngine;
use crate::server::subscriptions::SubscriptionRegistry;

/// Timeouts and limits governing one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// From VERSION_INCREASE_ALLOW until the first FILE_WRITE chunk.
    pub first_write_timeout: Duration,
    /// Between FILE_WRITE messages, and from the last chunk to
    /// FILE_WRITE_END.
    pub write_timeout: Duration,
    pub max_chunk_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            first_write_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(30),
            max_chunk_size: 1024 * 1024,
        }
    }
}

/// A commit whose content is in flight, between VERSION_INCREASE_ALLOW and
/// FILE_WRITE_END.
struct PendingUpload {
    request: AskVersionIncrease,
    /// file id or current path -> accumulated bytes.
    contents: HashMap<String, Vec<u8>>,
    last_write_time: Instant,
    received_first_write: bool,
}

impl PendingUpload {
    fn timeout(&self, config: &SessionConfig) -> Duration {
        if self.received_first_write {
            config.write_timeout
        } else {
            config.first_write_timeout
        }
    }
}

struct Session {
    client_id: String,
    storage: Arc<StorageEngine>,
    subscriptions: Arc<SubscriptionRegistry>,
    config: SessionConfig,
    outbound: mpsc::UnboundedSender<Bytes>,
}

/// Drive one client connection to completion.
pub async fn run_session(
    storage: Arc<StorageEngine>,
    subscriptions: Arc<SubscriptionRegistry>,
    config: SessionConfig,
    stream: TcpStream,
) {
    let client_id = Uuid::new_v4().to_string();
    info!(client_id = %client_id, "client connected");

    let (mut read_half, write_half) = stream.into_split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Bytes>();

    // Writer task: the only place that touches the write half.
    let writer_client = client_id.clone();
    let writer = tokio::spawn(async move {
        let mut writer = BufWriter::new(write_half);
        while let Some(frame) = outbound_rx.recv().await {
            if protocol::write_frame(&mut writer, &frame).await.is_err() {
                break;
            }
            if writer.flush().await.is_err() {
                break;
            }
        }
        debug!(client_id = %writer_client, "writer task finished");
    });

    let session = Session {
        client_id: client_id.clone(),
        storage: storage.clone(),
        subscriptions: subscriptions.clone(),
        config,
        outbound,
    };

    let mut pending: Option<PendingUpload> = None;

    loop {
        let frame = if let Some(p) = &pending {
            let budget = p.timeout(&session.config).saturating_sub(p.last_write_time.elapsed());
            match tokio::time::timeout(budget, protocol::read_frame(&mut read_half)).await {
                Ok(result) => result,
                Err(_) => {
                    info!(client_id = %client_id, "upload timeout, rolling back");
                    let p = pending.take().expect("pending upload present");
                    session.rollback(p).await;
                    session.send(
                        &ServerMessage::Error(ErrorMessage::new(ErrorCode::Timeout, "upload timeout")),
                        "",
                    );
                    continue;
                }
            }
        } else {
            protocol::read_frame(&mut read_half).await
        };

        let (msg_type, request_id, payload) = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!(client_id = %client_id, "stream ended: {e:#}");
                break;
            }
        };

        let msg = match ClientMessage::decode(msg_type, payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(client_id = %client_id, "undecodable {msg_type:?} message: {e:#}");
                continue;
            }
        };

        match msg {
            ClientMessage::DirectoryCreate(_) => session.handle_directory_create(&request_id),
            ClientMessage::DirectorySubscribe(m) => session.handle_subscribe(m, &request_id),
            ClientMessage::DirectoryUnsubscribe(m) => session.handle_unsubscribe(m, &request_id),
            ClientMessage::RequestVersion(m) => session.handle_request_version(m, &request_id),
            ClientMessage::AskVersionIncrease(m) => {
                session
                    .handle_ask_version_increase(m, &request_id, &mut pending)
                    .await
            }
            ClientMessage::FileWrite(m) => session.handle_file_write(m, &mut pending),
            ClientMessage::FileWriteEnd(_) => {
                session.handle_file_write_end(&request_id, &mut pending).await
            }
            ClientMessage::RequestFileContent(m) => {
                session.handle_request_file_content(m, &request_id).await
            }
        }
    }

    info!(client_id = %client_id, "client disconnected");

    if let Some(p) = pending.take() {
        session.rollback(p).await;
    }
    subscriptions.remove_client(&client_id);
    storage.release_locks(&client_id);

    drop(session);
    let _ = writer.await;
}

impl Session {
    fn send(&self, msg: &ServerMessage, request_id: &str) {
        if self.outbound.send(msg.encode(request_id)).is_err() {
            warn!(client_id = %self.client_id, "outbound channel closed");
        }
    }

    fn send_error(&self, request_id: &str, code: ErrorCode, message: impl Into<String>) {
        self.send(&ServerMessage::Error(ErrorMessage::new(code, message)), request_id);
    }

    fn handle_directory_create(&self, request_id: &str) {
        let dir_id = self.storage.create_directory();
        self.send(
            &ServerMessage::OkDirectoryCreated(OkDirectoryCreated { directory_id: dir_id }),
            request_id,
        );
    }

    fn handle_subscribe(&self, msg: DirectorySubscribe, request_id: &str) {
        debug!(client_id = %self.client_id, directory_id = %msg.directory_id, "subscribe");

        if !self.storage.directory_exists(&msg.directory_id) {
            self.send_error(
                request_id,
                ErrorCode::DirectoryNotFound,
                format!("directory not found: {}", msg.directory_id),
            );
            return;
        }

        self.subscriptions
            .subscribe(&self.client_id, &msg.directory_id, self.outbound.clone());
        self.send(
            &ServerMessage::OkSubscribed(OkSubscribed { directory_id: msg.directory_id }),
            request_id,
        );
    }

    fn handle_unsubscribe(&self, msg: DirectoryUnsubscribe, request_id: &str) {
        self.subscriptions.unsubscribe(&self.client_id, &msg.directory_id);
        self.send(
            &ServerMessage::OkUnsubscribed(OkUnsubscribed { directory_id: msg.directory_id }),
            request_id,
        );
    }

    fn handle_request_version(&self, msg: RequestVersion, request_id: &str) {
        let mut files = Vec::new();

        for request in &msg.requests {
            match request {
                VersionRequest::Directory(dir_id) => {
                    files.extend(self.storage.directory_files(dir_id));
                }
                VersionRequest::File(file_id) => {
                    // Soft-deleted records are included: clients reconciling
                    // a DENIED file need to learn about the deletion.
                    if let Some(meta) =
                        self.storage.file_metadata(&file_id.directory_id, &file_id.id)
                    {
                        files.push(meta);
                    }
                }
            }
        }

        debug!(client_id = %self.client_id, files = files.len(), "sending version snapshot");
        self.send(&ServerMessage::CheckVersion(CheckVersion { files }), request_id);
    }

    async fn handle_ask_version_increase(
        &self,
        msg: AskVersionIncrease,
        request_id: &str,
        pending: &mut Option<PendingUpload>,
    ) {
        debug!(client_id = %self.client_id, files = msg.files.len(), "ask version increase");

        let results = self.storage.check_version_increase(&self.client_id, &msg);

        if results.iter().any(|r| r.status != FileStatus::Free) {
            let statuses = results
                .into_iter()
                .map(|r| crate::protocol::FileStatusInfo {
                    id: r.file_id,
                    directory_id: r.directory_id,
                    status: r.status,
                })
                .collect();
            self.send(
                &ServerMessage::VersionIncreaseDeny(VersionIncreaseDeny { files: statuses }),
                request_id,
            );
            return;
        }

        let needs_content = msg.files.iter().any(|f| f.content_changed && !f.deleted);

        if needs_content {
            self.storage.lock_files_for_write(&self.client_id, &msg);
            *pending = Some(PendingUpload {
                request: msg,
                contents: HashMap::new(),
                last_write_time: Instant::now(),
                received_first_write: false,
            });
            self.send(
                &ServerMessage::VersionIncreaseAllow(VersionIncreaseAllow),
                request_id,
            );
        } else {
            // Metadata-only change: lock, apply, and release in one step
            self.storage.lock_files_for_write(&self.client_id, &msg);
            let updated = self.apply(msg, HashMap::new()).await;
            self.send(
                &ServerMessage::VersionIncreased(VersionIncreased { files: updated.clone() }),
                request_id,
            );
            self.notify_file_changes(&updated);
        }
    }

    fn handle_file_write(&self, msg: FileWrite, pending: &mut Option<PendingUpload>) {
        let Some(p) = pending.as_mut() else {
            // Stray chunk outside an upload window; ignored
            error!(client_id = %self.client_id, "FILE_WRITE without pending upload");
            return;
        };

        p.received_first_write = true;
        p.last_write_time = Instant::now();

        let chunk = msg.chunk;
        let key = if !chunk.current_path.is_empty() {
            chunk.current_path.clone()
        } else if !chunk.id.is_empty() {
            chunk.id.clone()
        } else {
            // First content-changing file of the request without bytes yet
            let fallback = p
                .request
                .files
                .iter()
                .filter(|f| f.content_changed && !f.deleted)
                .map(|f| f.current_path.clone())
                .find(|path| !p.contents.contains_key(path));
            match fallback {
                Some(path) => path,
                None => {
                    error!(client_id = %self.client_id, "cannot determine file for chunk");
                    return;
                }
            }
        };

        let content = p.contents.entry(key).or_default();
        let offset = chunk.offset as usize;
        let end = offset + chunk.data.len();
        // Tolerates out-of-order and overlapping writes
        if end > content.len() {
            content.resize(end, 0);
        }
        content[offset..end].copy_from_slice(&chunk.data);

        debug!(
            client_id = %self.client_id,
            offset = chunk.offset,
            size = chunk.data.len(),
            total = content.len(),
            "received chunk"
        );
    }

    async fn handle_file_write_end(&self, request_id: &str, pending: &mut Option<PendingUpload>) {
        let Some(p) = pending.take() else {
            error!(client_id = %self.client_id, "FILE_WRITE_END without pending upload");
            return;
        };

        let updated = self.apply(p.request, p.contents).await;
        self.send(
            &ServerMessage::VersionIncreased(VersionIncreased { files: updated.clone() }),
            request_id,
        );
        self.notify_file_changes(&updated);
    }

    async fn handle_request_file_content(&self, msg: RequestFileContent, request_id: &str) {
        debug!(client_id = %self.client_id, files = msg.files.len(), "request file content");

        let results = self.storage.check_files_for_read(&self.client_id, &msg);

        let non_free: Vec<_> = results
            .into_iter()
            .filter(|r| r.status != FileStatus::Free)
            .map(|r| crate::protocol::FileStatusInfo {
                id: r.file_id,
                directory_id: r.directory_id,
                status: r.status,
            })
            .collect();

        if !non_free.is_empty() {
            self.send(
                &ServerMessage::FileContentRequestDeny(FileContentRequestDeny { files: non_free }),
                request_id,
            );
            return;
        }

        self.storage.lock_files_for_read(&self.client_id, &msg);
        self.send(
            &ServerMessage::FileContentRequestAllow(FileContentRequestAllow),
            request_id,
        );

        for file_id in &msg.files {
            let storage = self.storage.clone();
            let dir = file_id.directory_id.clone();
            let id = file_id.id.clone();
            let file = tokio::task::spawn_blocking(move || storage.file(&dir, &id))
                .await
                .ok()
                .flatten();

            let Some(file) = file else {
                warn!(file_id = %file_id.id, "file not found during content stream, skipping");
                continue;
            };

            let content = file.content.unwrap_or_default();
            debug!(path = %file.current_path, size = content.len(), "streaming file");

            let mut offset = 0usize;
            loop {
                let end = (offset + self.config.max_chunk_size).min(content.len());
                let chunk = FileChunk {
                    id: file.id.clone(),
                    directory_id: file.directory_id.clone(),
                    current_path: file.current_path.clone(),
                    offset: offset as u64,
                    data: Bytes::copy_from_slice(&content[offset..end]),
                };
                // Pushed chunks carry no request id
                self.send(&ServerMessage::FileWrite(FileWrite { chunk }), "");

                offset = end;
                if offset >= content.len() {
                    break;
                }
            }
        }

        self.send(&ServerMessage::FileWriteEnd(FileWriteEnd), "");
        self.storage.unlock_files_after_read(&self.client_id, &msg);
    }

    /// Commit off the runtime threads; the storage engine does disk I/O
    /// under its lock.
    async fn apply(
        &self,
        request: AskVersionIncrease,
        contents: HashMap<String, Vec<u8>>,
    ) -> Vec<FileMetadata> {
        let storage = self.storage.clone();
        let client_id = self.client_id.clone();
        tokio::task::spawn_blocking(move || {
            storage.apply_version_increase(&client_id, &request, &contents)
        })
        .await
        .unwrap_or_default()
    }

    async fn rollback(&self, p: PendingUpload) {
        let storage = self.storage.clone();
        let client_id = self.client_id.clone();
        let _ = tokio::task::spawn_blocking(move || {
            storage.rollback_upload(&client_id, &p.request);
        })
        .await;
    }

    /// Fan a full-listing snapshot out to every other subscriber of the
    /// committed directory.
    fn notify_file_changes(&self, updated: &[FileMetadata]) {
        let Some(first) = updated.first() else {
            return;
        };
        let dir_id = &first.directory_id;

        // Full current listing, not just the updated subset, so every peer
        // can diff deterministically.
        let files = self.storage.directory_files(dir_id);
        let frame = ServerMessage::CheckVersion(CheckVersion { files }).encode("");
        self.subscriptions
            .notify_subscribers(dir_id, &self.client_id, frame);
    }
}
