//! The client-side reconciler.
//!
//! Keeps configured local directories in agreement with the server, both
//! ways: watcher events are debounced and published through the
//! version-increase arbitration, and incoming directory snapshots are
//! diffed against the local metadata store and applied to the local tree
//! without re-triggering the watcher.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};

use crate::client::config::{expand_tilde, ClientConfig, DirectoryEntry};
use crate::client::connection::{Connection, RESPONSE_TIMEOUT};
use crate::client::watcher::{EntryKind, FileEvent, FileEventKind};
use crate::error::{Result, SyncError};
use crate::meta::MetadataStore;
use crate::protocol::{
    AskVersionIncrease, ClientMessage, DirectoryCreate, DirectorySubscribe, FileChange,
    FileChunk, FileId, FileMetadata, FileStatus, FileType, FileWrite, FileWriteEnd,
    RequestFileContent, RequestVersion, ServerMessage, VersionRequest,
};

/// How long a download may run after FILE_CONTENT_REQUEST_ALLOW.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Suffix of in-flight download files, renamed over the target on
/// completion.
const TEMP_SUFFIX: &str = ".synxpo_tmp";

/// How long applied filesystem changes stay in `files_being_written`
/// after the change, letting the watcher echo drain.
const ECHO_SETTLE: Duration = Duration::from_millis(150);

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

fn system_time_micros(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_micros() as u64
}

/// Directory-relative path in wire form: forward slashes.
fn rel_to_wire(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn wire_to_native(rel: &str) -> PathBuf {
    rel.split('/').collect()
}

fn temp_path_for(final_path: &Path) -> PathBuf {
    let mut os = final_path.as_os_str().to_owned();
    os.push(TEMP_SUFFIX);
    PathBuf::from(os)
}

/// A local change queued for publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChangeInfo {
    pub file_id: Option<String>,
    pub directory_id: String,
    pub rel_path: String,
    pub file_type: FileType,
    pub deleted: bool,
    pub content_changed: bool,
    pub first_try_time: u64,
}

impl FileChangeInfo {
    fn to_wire(&self) -> FileChange {
        FileChange {
            id: self.file_id.clone().unwrap_or_default(),
            directory_id: self.directory_id.clone(),
            current_path: self.rel_path.clone(),
            file_type: self.file_type,
            deleted: self.deleted,
            content_changed: self.content_changed,
            first_try_time: self.first_try_time,
        }
    }
}

#[derive(Default)]
struct DirectoryState {
    subscribed: bool,
    /// Advisory; set around snapshot processing, never consulted to block.
    is_syncing: bool,
    /// Changes the server reported BLOCKED, retried on the next snapshot.
    blocked_changes: HashMap<String, FileChangeInfo>,
    /// Absolute path -> queued change, drained by the debounce loop.
    pending_changes: HashMap<PathBuf, FileChangeInfo>,
    /// Absolute paths the engine itself is mutating; watcher events under
    /// them are dropped.
    files_being_written: HashSet<PathBuf>,
    last_change_time: Option<Instant>,
}

struct DownloadState {
    directory_id: String,
    /// Requested metadata by file id; upserted locally on completion.
    files: HashMap<String, FileMetadata>,
    streams: HashMap<String, tokio::fs::File>,
    temp_paths: HashMap<String, PathBuf>,
    final_paths: HashMap<String, PathBuf>,
    done: Option<oneshot::Sender<()>>,
}

/// What a server snapshot implies for the local tree.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct VersionDiff {
    pub to_download: Vec<FileMetadata>,
    pub to_rename_or_delete: Vec<FileMetadata>,
    pub to_upload: Vec<FileMetadata>,
    pub to_delete_local: Vec<String>,
}

/// Diff a server listing against the local records.
pub fn diff_listings(local: Vec<FileMetadata>, server: &[FileMetadata]) -> VersionDiff {
    let mut diff = VersionDiff::default();
    let mut local_map: HashMap<String, FileMetadata> =
        local.into_iter().map(|f| (f.id.clone(), f)).collect();

    for server_file in server {
        match local_map.remove(&server_file.id) {
            None => {
                if server_file.content_changed_version > 0 && !server_file.deleted {
                    diff.to_download.push(server_file.clone());
                }
                diff.to_rename_or_delete.push(server_file.clone());
            }
            Some(local_file) => {
                if server_file.content_changed_version > local_file.content_changed_version
                    && !server_file.deleted
                {
                    diff.to_download.push(server_file.clone());
                }
                if server_file.current_path != local_file.current_path
                    || server_file.deleted != local_file.deleted
                {
                    diff.to_rename_or_delete.push(server_file.clone());
                }
                if local_file.version > server_file.version {
                    diff.to_upload.push(local_file);
                }
            }
        }
    }

    // Local records absent from the server listing
    for (file_id, local_file) in local_map {
        if local_file.version > 0 {
            diff.to_delete_local.push(file_id);
        } else {
            diff.to_upload.push(local_file);
        }
    }

    diff
}

pub struct SyncEngine {
    config_path: PathBuf,
    config: Mutex<ClientConfig>,
    meta: Arc<dyn MetadataStore>,
    conn: Arc<Connection>,
    dirs: Mutex<HashMap<String, DirectoryState>>,
    download: AsyncMutex<Option<DownloadState>>,
    /// Serializes snapshot processing across concurrent CHECK_VERSIONs.
    sync_lock: AsyncMutex<()>,
    running: AtomicBool,
}

impl SyncEngine {
    pub fn new(
        config_path: PathBuf,
        config: ClientConfig,
        meta: Arc<dyn MetadataStore>,
        conn: Arc<Connection>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config_path,
            config: Mutex::new(config),
            meta,
            conn,
            dirs: Mutex::new(HashMap::new()),
            download: AsyncMutex::new(None),
            sync_lock: AsyncMutex::new(()),
            running: AtomicBool::new(false),
        })
    }

    /// Initialize every configured directory, then run the dispatch,
    /// debounce, and watcher-intake tasks until `stop`.
    pub async fn start(
        self: &Arc<Self>,
        callbacks: mpsc::UnboundedReceiver<ServerMessage>,
        watcher_events: mpsc::UnboundedReceiver<FileEvent>,
    ) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        self.initialize_directories().await?;

        let engine = self.clone();
        tokio::spawn(async move { engine.dispatch_loop(callbacks).await });

        let engine = self.clone();
        tokio::spawn(async move { engine.debounce_loop().await });

        let engine = self.clone();
        tokio::spawn(async move {
            let mut watcher_events = watcher_events;
            while let Some(event) = watcher_events.recv().await {
                engine.on_file_event(event);
            }
        });

        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.conn.close();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Initialization
    // =========================================================================

    async fn initialize_directories(self: &Arc<Self>) -> Result<()> {
        let entries: Vec<DirectoryEntry> = self.config.lock().directories.clone();
        let known: HashSet<String> = self.meta.list_directories().into_iter().collect();
        let mut configured: HashSet<String> = HashSet::new();

        for entry in entries {
            if !entry.enabled {
                continue;
            }
            let local_path = expand_tilde(&entry.local_path);

            match &entry.directory_id {
                None => {
                    let dir_id = self.create_remote_directory().await?;
                    info!(directory_id = %dir_id, path = %local_path.display(), "linked new directory");

                    let mut updated = entry.clone();
                    updated.directory_id = Some(dir_id.clone());
                    {
                        let mut config = self.config.lock();
                        config.update_directory(&updated);
                        if let Err(e) = config.save(&self.config_path) {
                            warn!("failed to persist directory id: {e:#}");
                        }
                    }

                    self.meta.register_directory(&dir_id, &local_path)?;
                    configured.insert(dir_id.clone());
                    self.subscribe(&dir_id).await?;
                    self.upload_initial_files(&dir_id, &local_path).await?;
                }
                Some(dir_id) => {
                    if !known.contains(dir_id) {
                        self.meta.register_directory(dir_id, &local_path)?;
                    }
                    configured.insert(dir_id.clone());
                    self.subscribe(dir_id).await?;
                    // Catch-up: the snapshot arrives on the callback channel
                    self.request_versions(dir_id)?;
                }
            }
        }

        for dir_id in known {
            if !configured.contains(&dir_id) {
                info!(directory_id = %dir_id, "unregistering directory dropped from config");
                self.meta.unregister_directory(&dir_id)?;
            }
        }

        Ok(())
    }

    async fn create_remote_directory(&self) -> Result<String> {
        let response = self
            .conn
            .send_with_response(&ClientMessage::DirectoryCreate(DirectoryCreate), RESPONSE_TIMEOUT)
            .await?;
        match response {
            ServerMessage::OkDirectoryCreated(m) => Ok(m.directory_id),
            other => Err(SyncError::internal(format!(
                "unexpected response to DIRECTORY_CREATE: {other:?}"
            ))),
        }
    }

    async fn subscribe(&self, directory_id: &str) -> Result<()> {
        let response = self
            .conn
            .send_with_response(
                &ClientMessage::DirectorySubscribe(DirectorySubscribe {
                    directory_id: directory_id.to_string(),
                }),
                RESPONSE_TIMEOUT,
            )
            .await?;

        match response {
            ServerMessage::OkSubscribed(_) => {
                self.dirs
                    .lock()
                    .entry(directory_id.to_string())
                    .or_default()
                    .subscribed = true;
                Ok(())
            }
            ServerMessage::Error(e) => Err(SyncError::DirectoryNotFound(e.message)),
            other => Err(SyncError::internal(format!(
                "unexpected response to DIRECTORY_SUBSCRIBE: {other:?}"
            ))),
        }
    }

    async fn upload_initial_files(self: &Arc<Self>, directory_id: &str, root: &Path) -> Result<()> {
        let root_buf = root.to_path_buf();
        let rel_paths = tokio::task::spawn_blocking(move || scan_regular_files(&root_buf))
            .await
            .map_err(|e| SyncError::internal(e.to_string()))??;

        if rel_paths.is_empty() {
            return Ok(());
        }

        let t = now_micros();
        let changes: Vec<FileChangeInfo> = rel_paths
            .into_iter()
            .map(|rel| FileChangeInfo {
                file_id: None,
                directory_id: directory_id.to_string(),
                rel_path: rel_to_wire(&rel),
                file_type: FileType::File,
                deleted: false,
                content_changed: true,
                first_try_time: t,
            })
            .collect();

        info!(directory_id, files = changes.len(), "uploading initial files");
        self.ask_version_increase(directory_id, changes).await
    }

    // =========================================================================
    // Watcher intake and debounce
    // =========================================================================

    /// Queue a raw watcher event. Events under paths the engine itself is
    /// writing are dropped to break the echo loop.
    pub fn on_file_event(&self, event: FileEvent) {
        let Some(directory_id) = self.meta.directory_id_for_path(&event.path) else {
            debug!(path = %event.path.display(), "event outside any synced directory");
            return;
        };
        let Some(root) = self.meta.directory_root(&directory_id) else {
            return;
        };

        let mut dirs = self.dirs.lock();
        let state = dirs.entry(directory_id.clone()).or_default();

        if state.files_being_written.contains(&event.path) {
            debug!(path = %event.path.display(), "suppressed self-echo event");
            return;
        }
        if let Some(old) = &event.old_path {
            if state.files_being_written.contains(old) {
                debug!(path = %old.display(), "suppressed self-echo rename");
                return;
            }
        }

        let Ok(rel) = event.path.strip_prefix(&root) else {
            return;
        };
        let rel_path = rel_to_wire(rel);

        // Renames resolve the file id through the old path
        let file_id = match (&event.kind, &event.old_path) {
            (FileEventKind::Renamed, Some(old)) => old
                .strip_prefix(&root)
                .ok()
                .and_then(|old_rel| self.meta.get_by_path(&directory_id, &rel_to_wire(old_rel)).ok())
                .map(|m| m.id),
            _ => self.meta.get_by_path(&directory_id, &rel_path).ok().map(|m| m.id),
        };

        let file_type = match event.entry {
            EntryKind::Directory => FileType::Directory,
            _ => FileType::File,
        };

        let info = FileChangeInfo {
            file_id,
            directory_id,
            rel_path,
            file_type,
            deleted: event.kind == FileEventKind::Deleted,
            content_changed: matches!(
                event.kind,
                FileEventKind::Created | FileEventKind::Modified
            ) && file_type == FileType::File,
            first_try_time: system_time_micros(event.timestamp),
        };

        debug!(path = %event.path.display(), ?info, "queued change");
        state.pending_changes.insert(event.path, info);
        state.last_change_time = Some(Instant::now());
    }

    /// Wake every ~100 ms; directories quiet for `watch_debounce` get
    /// their queued changes drained and published.
    async fn debounce_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(100));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while self.is_running() {
            ticker.tick().await;
            let debounce = self.config.lock().watch_debounce();

            let ready: Vec<(String, Vec<FileChangeInfo>)> = {
                let mut dirs = self.dirs.lock();
                dirs.iter_mut()
                    .filter(|(_, state)| {
                        !state.pending_changes.is_empty()
                            && state
                                .last_change_time
                                .map(|t| t.elapsed() >= debounce)
                                .unwrap_or(false)
                    })
                    .map(|(dir_id, state)| {
                        (dir_id.clone(), state.pending_changes.drain().map(|(_, c)| c).collect())
                    })
                    .collect()
            };

            for (dir_id, changes) in ready {
                if let Err(e) = self.ask_version_increase(&dir_id, changes).await {
                    // Dropped changes resurface with the next snapshot
                    warn!(directory_id = %dir_id, "failed to publish changes: {e}");
                }
            }
        }
    }

    // =========================================================================
    // Outgoing flow
    // =========================================================================

    /// Publish a batch of changes. FREE-denied entries retry immediately,
    /// BLOCKED ones park until the next snapshot, DENIED ones adopt the
    /// server's state via REQUEST_VERSION.
    async fn ask_version_increase(
        &self,
        directory_id: &str,
        mut changes: Vec<FileChangeInfo>,
    ) -> Result<()> {
        loop {
            if changes.is_empty() {
                return Ok(());
            }

            let request = AskVersionIncrease {
                files: changes.iter().map(FileChangeInfo::to_wire).collect(),
            };
            let response = self
                .conn
                .send_with_response(&ClientMessage::AskVersionIncrease(request), RESPONSE_TIMEOUT)
                .await?;

            match response {
                ServerMessage::VersionIncreaseAllow(_) => {
                    let with_content: Vec<FileChangeInfo> = changes
                        .iter()
                        .filter(|c| c.content_changed && !c.deleted)
                        .cloned()
                        .collect();
                    return self.upload_file_contents(directory_id, &with_content).await;
                }
                ServerMessage::VersionIncreased(increased) => {
                    for meta in &increased.files {
                        if let Err(e) = self.meta.upsert(meta) {
                            warn!(file_id = %meta.id, "failed to record commit: {e}");
                        }
                    }
                    return Ok(());
                }
                ServerMessage::VersionIncreaseDeny(deny) => {
                    let mut free = Vec::new();
                    let mut denied_ids = Vec::new();
                    {
                        let mut dirs = self.dirs.lock();
                        let state = dirs.entry(directory_id.to_string()).or_default();

                        // Statuses come back in request order
                        for (status, change) in deny.files.iter().zip(changes.iter()) {
                            match status.status {
                                FileStatus::Free => free.push(change.clone()),
                                FileStatus::Blocked => {
                                    debug!(file_id = %status.id, "change blocked, parking");
                                    state
                                        .blocked_changes
                                        .insert(status.id.clone(), change.clone());
                                }
                                FileStatus::Denied => {
                                    if !status.id.is_empty() {
                                        denied_ids.push(status.id.clone());
                                    }
                                }
                            }
                        }
                    }

                    if !denied_ids.is_empty() {
                        debug!(count = denied_ids.len(), "denied, adopting server state");
                        self.request_file_versions(directory_id, &denied_ids)?;
                    }

                    changes = free;
                }
                ServerMessage::Error(e) => {
                    return Err(SyncError::internal(format!("server error: {}", e.message)));
                }
                other => {
                    return Err(SyncError::internal(format!(
                        "unexpected response to ASK_VERSION_INCREASE: {other:?}"
                    )));
                }
            }
        }
    }

    /// Stream the named files as chunks, then commit with FILE_WRITE_END.
    async fn upload_file_contents(
        &self,
        directory_id: &str,
        files: &[FileChangeInfo],
    ) -> Result<()> {
        let root = self
            .meta
            .directory_root(directory_id)
            .ok_or_else(|| SyncError::DirectoryNotFound(directory_id.to_string()))?;

        let (chunk_size, max_file_size) = {
            let config = self.config.lock();
            (config.chunk_size, config.max_file_size)
        };

        for change in files {
            let abs = root.join(wire_to_native(&change.rel_path));
            let mut file = match tokio::fs::File::open(&abs).await {
                Ok(f) => f,
                // Deleted between queueing and upload; the rollback sweep
                // will clear the server-side lock
                Err(_) => {
                    warn!(path = %abs.display(), "file vanished before upload");
                    continue;
                }
            };

            let size = file.metadata().await.map(|m| m.len()).unwrap_or(0);
            if size > max_file_size {
                warn!(path = %abs.display(), size, "file exceeds max_file_size, skipping");
                continue;
            }

            let mut offset = 0u64;
            let mut buf = vec![0u8; chunk_size];
            let mut sent_any = false;

            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                self.send_chunk(change, directory_id, offset, &buf[..n])?;
                offset += n as u64;
                sent_any = true;
            }

            // A zero-length file still gets one empty chunk so the commit
            // records its content
            if !sent_any {
                self.send_chunk(change, directory_id, 0, &[])?;
            }

            debug!(path = %change.rel_path, bytes = offset, "uploaded file content");
        }

        let response = self
            .conn
            .send_with_response(&ClientMessage::FileWriteEnd(FileWriteEnd), RESPONSE_TIMEOUT)
            .await?;

        match response {
            ServerMessage::VersionIncreased(increased) => {
                for meta in &increased.files {
                    if let Err(e) = self.meta.upsert(meta) {
                        warn!(file_id = %meta.id, "failed to record commit: {e}");
                    }
                }
                Ok(())
            }
            ServerMessage::Error(e) => {
                Err(SyncError::internal(format!("upload failed: {}", e.message)))
            }
            other => Err(SyncError::internal(format!(
                "unexpected response to FILE_WRITE_END: {other:?}"
            ))),
        }
    }

    fn send_chunk(
        &self,
        change: &FileChangeInfo,
        directory_id: &str,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        self.conn.send(&ClientMessage::FileWrite(FileWrite {
            chunk: FileChunk {
                id: change.file_id.clone().unwrap_or_default(),
                directory_id: directory_id.to_string(),
                current_path: change.rel_path.clone(),
                offset,
                data: bytes::Bytes::copy_from_slice(data),
            },
        }))
    }

    fn request_versions(&self, directory_id: &str) -> Result<()> {
        self.conn.send(&ClientMessage::RequestVersion(RequestVersion {
            requests: vec![VersionRequest::Directory(directory_id.to_string())],
        }))
    }

    fn request_file_versions(&self, directory_id: &str, file_ids: &[String]) -> Result<()> {
        self.conn.send(&ClientMessage::RequestVersion(RequestVersion {
            requests: file_ids
                .iter()
                .map(|id| {
                    VersionRequest::File(FileId {
                        id: id.clone(),
                        directory_id: directory_id.to_string(),
                    })
                })
                .collect(),
        }))
    }

    // =========================================================================
    // Incoming flow
    // =========================================================================

    /// Drain server pushes: snapshots drive reconciliation, chunk frames
    /// feed the active download.
    async fn dispatch_loop(self: Arc<Self>, mut callbacks: mpsc::UnboundedReceiver<ServerMessage>) {
        while let Some(msg) = callbacks.recv().await {
            if !self.is_running() {
                break;
            }
            match msg {
                ServerMessage::CheckVersion(check) => {
                    let Some(first) = check.files.first() else {
                        continue;
                    };
                    let directory_id = first.directory_id.clone();
                    // Processed off the dispatch task: this loop has to
                    // stay free to feed FILE_WRITE chunks to the download
                    let engine = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = engine.process_check_version(&directory_id, check.files).await
                        {
                            error!(directory_id = %directory_id, "snapshot processing failed: {e}");
                        }
                    });
                }
                ServerMessage::FileWrite(write) => self.handle_download_chunk(write.chunk).await,
                ServerMessage::FileWriteEnd(_) => self.finish_download().await,
                ServerMessage::Error(e) => {
                    warn!(code = ?e.code, "server error: {}", e.message);
                }
                other => debug!("ignoring late or unexpected push: {other:?}"),
            }
        }
        info!("server stream closed, stopping auto-sync");
        self.running.store(false, Ordering::SeqCst);
    }

    async fn process_check_version(
        self: &Arc<Self>,
        directory_id: &str,
        server_files: Vec<FileMetadata>,
    ) -> Result<()> {
        let _guard = self.sync_lock.lock().await;

        {
            let mut dirs = self.dirs.lock();
            dirs.entry(directory_id.to_string()).or_default().is_syncing = true;
        }

        let result = self.apply_check_version(directory_id, &server_files).await;

        {
            let mut dirs = self.dirs.lock();
            dirs.entry(directory_id.to_string()).or_default().is_syncing = false;
        }

        result
    }

    async fn apply_check_version(
        self: &Arc<Self>,
        directory_id: &str,
        server_files: &[FileMetadata],
    ) -> Result<()> {
        let local = self.meta.list_files(directory_id).unwrap_or_default();
        let diff = diff_listings(local, server_files);

        debug!(
            directory_id,
            download = diff.to_download.len(),
            rename_or_delete = diff.to_rename_or_delete.len(),
            upload = diff.to_upload.len(),
            delete_local = diff.to_delete_local.len(),
            "computed snapshot diff"
        );

        // Metadata operations first: they set files_being_written before
        // touching the tree
        if !diff.to_rename_or_delete.is_empty() {
            self.apply_renames_and_deletes(directory_id, &diff.to_rename_or_delete)
                .await?;
        }

        if !diff.to_download.is_empty() {
            self.request_file_contents(directory_id, diff.to_download).await?;
        }

        if !diff.to_upload.is_empty() {
            let t = now_micros();
            let changes: Vec<FileChangeInfo> = diff
                .to_upload
                .iter()
                .map(|meta| FileChangeInfo {
                    file_id: Some(meta.id.clone()),
                    directory_id: directory_id.to_string(),
                    rel_path: meta.current_path.clone(),
                    file_type: meta.file_type,
                    deleted: meta.deleted,
                    content_changed: true,
                    first_try_time: t,
                })
                .collect();
            self.ask_version_increase(directory_id, changes).await?;
        }

        if !diff.to_delete_local.is_empty() {
            self.delete_missing_files(directory_id, &diff.to_delete_local).await?;
        }

        // Parked BLOCKED changes get their retry now
        let blocked: Vec<FileChangeInfo> = {
            let mut dirs = self.dirs.lock();
            dirs.entry(directory_id.to_string())
                .or_default()
                .blocked_changes
                .drain()
                .map(|(_, c)| c)
                .collect()
        };
        if !blocked.is_empty() {
            debug!(count = blocked.len(), "retrying blocked changes");
            self.ask_version_increase(directory_id, blocked).await?;
        }

        Ok(())
    }

    async fn apply_renames_and_deletes(
        self: &Arc<Self>,
        directory_id: &str,
        files: &[FileMetadata],
    ) -> Result<()> {
        let root = self
            .meta
            .directory_root(directory_id)
            .ok_or_else(|| SyncError::DirectoryNotFound(directory_id.to_string()))?;

        // Collect every path about to change and suppress its echoes
        let mut affected: Vec<PathBuf> = Vec::new();
        for meta in files {
            let new_abs = root.join(wire_to_native(&meta.current_path));
            if meta.deleted {
                affected.push(new_abs);
            } else if let Ok(local) = self.meta.get_by_id(directory_id, &meta.id) {
                let old_abs = root.join(wire_to_native(&local.current_path));
                if old_abs != new_abs {
                    affected.push(old_abs);
                    affected.push(new_abs);
                }
            }
        }
        self.mark_being_written(directory_id, &affected);

        for meta in files {
            let new_abs = root.join(wire_to_native(&meta.current_path));

            if meta.deleted {
                if new_abs.exists() {
                    if let Err(e) = tokio::fs::remove_file(&new_abs).await {
                        warn!(path = %new_abs.display(), "failed to delete: {e}");
                    }
                }
            } else if let Ok(local) = self.meta.get_by_id(directory_id, &meta.id) {
                let old_abs = root.join(wire_to_native(&local.current_path));
                if old_abs != new_abs && old_abs.exists() {
                    if let Some(parent) = new_abs.parent() {
                        let _ = tokio::fs::create_dir_all(parent).await;
                    }
                    if let Err(e) = tokio::fs::rename(&old_abs, &new_abs).await {
                        warn!(from = %old_abs.display(), to = %new_abs.display(), "rename failed: {e}");
                    }
                }
            }

            if let Err(e) = self.meta.upsert(meta) {
                warn!(file_id = %meta.id, "failed to record server state: {e}");
            }
        }

        self.unmark_being_written_later(directory_id, affected);
        Ok(())
    }

    /// Request content for the given files and wait for the transfer to
    /// complete. FREE-denied entries retry immediately; BLOCKED ones are
    /// left for the snapshot that follows the blocker's commit.
    async fn request_file_contents(
        self: &Arc<Self>,
        directory_id: &str,
        mut files: Vec<FileMetadata>,
    ) -> Result<()> {
        loop {
            if files.is_empty() {
                return Ok(());
            }

            // Transfer state goes up before the request: the first chunk
            // can arrive right behind the ALLOW
            let (done_tx, done_rx) = oneshot::channel();
            {
                let mut download = self.download.lock().await;
                *download = Some(DownloadState {
                    directory_id: directory_id.to_string(),
                    files: files.iter().map(|f| (f.id.clone(), f.clone())).collect(),
                    streams: HashMap::new(),
                    temp_paths: HashMap::new(),
                    final_paths: HashMap::new(),
                    done: Some(done_tx),
                });
            }

            let request = ClientMessage::RequestFileContent(RequestFileContent {
                files: files
                    .iter()
                    .map(|f| FileId {
                        id: f.id.clone(),
                        directory_id: f.directory_id.clone(),
                    })
                    .collect(),
            });

            let response = match self.conn.send_with_response(&request, RESPONSE_TIMEOUT).await {
                Ok(response) => response,
                Err(e) => {
                    self.clear_download().await;
                    return Err(e);
                }
            };

            match response {
                ServerMessage::FileContentRequestAllow(_) => {
                    return match tokio::time::timeout(DOWNLOAD_TIMEOUT, done_rx).await {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(_)) => Err(SyncError::Cancelled),
                        Err(_) => {
                            self.clear_download().await;
                            Err(SyncError::Timeout("file download stalled".to_string()))
                        }
                    };
                }
                ServerMessage::FileContentRequestDeny(deny) => {
                    self.clear_download().await;
                    let mut retry = Vec::new();
                    for status in &deny.files {
                        match status.status {
                            FileStatus::Free => {
                                if let Ok(meta) =
                                    self.meta.get_by_id(&status.directory_id, &status.id)
                                {
                                    retry.push(meta);
                                }
                            }
                            // The next snapshot re-drives blocked files
                            FileStatus::Blocked => {}
                            FileStatus::Denied => {
                                debug!(file_id = %status.id, "content request denied, skipping");
                            }
                        }
                    }
                    files = retry;
                }
                other => {
                    self.clear_download().await;
                    return Err(SyncError::internal(format!(
                        "unexpected response to REQUEST_FILE_CONTENT: {other:?}"
                    )));
                }
            }
        }
    }

    async fn handle_download_chunk(&self, chunk: FileChunk) {
        let mut guard = self.download.lock().await;
        let Some(state) = guard.as_mut() else {
            warn!("content chunk outside any transfer, ignoring");
            return;
        };

        let file_id = chunk.id.clone();
        let directory_id = if chunk.directory_id.is_empty() {
            state.directory_id.clone()
        } else {
            chunk.directory_id.clone()
        };

        if !state.streams.contains_key(&file_id) {
            let mut current_path = chunk.current_path.clone();
            if current_path.is_empty() {
                if let Ok(meta) = self.meta.get_by_id(&directory_id, &file_id) {
                    current_path = meta.current_path;
                }
            }
            if current_path.is_empty() {
                error!(file_id = %file_id, "cannot resolve path for incoming chunk");
                return;
            }

            let Some(root) = self.meta.directory_root(&directory_id) else {
                error!(directory_id = %directory_id, "no root for incoming chunk");
                return;
            };

            let final_path = root.join(wire_to_native(&current_path));
            let temp_path = temp_path_for(&final_path);

            if let Some(parent) = final_path.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }

            // Both the temp file and its target are ours; neither may echo
            let marked = [temp_path.clone(), final_path.clone()];
            self.mark_being_written(&directory_id, &marked);

            match tokio::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .await
            {
                Ok(file) => {
                    debug!(path = %temp_path.display(), "opened download stream");
                    state.streams.insert(file_id.clone(), file);
                    state.temp_paths.insert(file_id.clone(), temp_path);
                    state.final_paths.insert(file_id.clone(), final_path);
                }
                Err(e) => {
                    error!(path = %temp_path.display(), "failed to open temp file: {e}");
                    self.unmark_being_written_now(&directory_id, &marked);
                    return;
                }
            }
        }

        let file = state.streams.get_mut(&file_id).expect("stream just ensured");
        if let Err(e) = file.seek(std::io::SeekFrom::Start(chunk.offset)).await {
            error!(file_id = %file_id, "seek failed: {e}");
            return;
        }
        if let Err(e) = file.write_all(&chunk.data).await {
            error!(file_id = %file_id, "write failed: {e}");
        }
    }

    /// Close streams, rename temp files over their targets, record the
    /// server metadata, and wake the waiting requester.
    async fn finish_download(self: &Arc<Self>) {
        let state = self.download.lock().await.take();
        let Some(mut state) = state else {
            return;
        };

        let mut touched: Vec<PathBuf> = Vec::new();

        for (file_id, mut file) in state.streams.drain() {
            let _ = file.flush().await;
            drop(file);

            let (Some(temp_path), Some(final_path)) = (
                state.temp_paths.get(&file_id),
                state.final_paths.get(&file_id),
            ) else {
                continue;
            };
            touched.push(temp_path.clone());
            touched.push(final_path.clone());

            match tokio::fs::rename(temp_path, final_path).await {
                Ok(()) => {
                    if let Some(meta) = state.files.get(&file_id) {
                        if let Err(e) = self.meta.upsert(meta) {
                            warn!(file_id = %file_id, "failed to record download: {e}");
                        }
                    }
                    info!(path = %final_path.display(), "downloaded file");
                }
                Err(e) => {
                    warn!(path = %final_path.display(), "failed to finalize download: {e}");
                    let _ = tokio::fs::remove_file(temp_path).await;
                }
            }
        }

        self.unmark_being_written_later(&state.directory_id, touched);

        if let Some(done) = state.done.take() {
            let _ = done.send(());
        }
    }

    async fn clear_download(&self) {
        let state = self.download.lock().await.take();
        if let Some(mut state) = state {
            let mut touched: Vec<PathBuf> = state.final_paths.values().cloned().collect();
            for (_, temp_path) in state.temp_paths.drain() {
                let _ = tokio::fs::remove_file(&temp_path).await;
                touched.push(temp_path);
            }
            self.unmark_being_written_now(&state.directory_id, &touched);
        }
    }

    async fn delete_missing_files(
        self: &Arc<Self>,
        directory_id: &str,
        file_ids: &[String],
    ) -> Result<()> {
        let root = self
            .meta
            .directory_root(directory_id)
            .ok_or_else(|| SyncError::DirectoryNotFound(directory_id.to_string()))?;

        let mut affected = Vec::new();
        for file_id in file_ids {
            let Ok(meta) = self.meta.get_by_id(directory_id, file_id) else {
                continue;
            };
            let abs = root.join(wire_to_native(&meta.current_path));
            affected.push(abs.clone());
            self.mark_being_written(directory_id, std::slice::from_ref(&abs));

            if abs.exists() {
                if let Err(e) = tokio::fs::remove_file(&abs).await {
                    warn!(path = %abs.display(), "failed to delete: {e}");
                }
            }
            if let Err(e) = self.meta.remove(directory_id, file_id) {
                warn!(file_id = %file_id, "failed to drop record: {e}");
            }
        }

        self.unmark_being_written_later(directory_id, affected);
        Ok(())
    }

    // =========================================================================
    // Echo suppression bookkeeping
    // =========================================================================

    fn mark_being_written(&self, directory_id: &str, paths: &[PathBuf]) {
        let mut dirs = self.dirs.lock();
        let state = dirs.entry(directory_id.to_string()).or_default();
        for path in paths {
            state.files_being_written.insert(path.clone());
        }
    }

    fn unmark_being_written_now(&self, directory_id: &str, paths: &[PathBuf]) {
        let mut dirs = self.dirs.lock();
        if let Some(state) = dirs.get_mut(directory_id) {
            for path in paths {
                state.files_being_written.remove(path);
            }
        }
    }

    /// Unmark after a short settle window so trailing watcher events for
    /// our own mutations still land inside the suppression set.
    fn unmark_being_written_later(self: &Arc<Self>, directory_id: &str, paths: Vec<PathBuf>) {
        if paths.is_empty() {
            return;
        }
        let engine = self.clone();
        let directory_id = directory_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(ECHO_SETTLE).await;
            engine.unmark_being_written_now(&directory_id, &paths);
        });
    }
}

/// Relative paths of all regular files under `root`.
fn scan_regular_files(root: &Path) -> Result<Vec<PathBuf>> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                walk(root, &path, out)?;
            } else if file_type.is_file() {
                if let Ok(rel) = path.strip_prefix(root) {
                    out.push(rel.to_path_buf());
                }
            }
        }
        Ok(())
    }

    let mut out = Vec::new();
    if root.exists() {
        walk(root, root, &mut out)?;
    }
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(id: &str, path: &str, version: u64, ccv: u64) -> FileMetadata {
        FileMetadata {
            id: id.to_string(),
            directory_id: "dir-1".to_string(),
            version,
            content_changed_version: ccv,
            file_type: FileType::File,
            current_path: path.to_string(),
            deleted: false,
        }
    }

    #[test]
    fn test_diff_new_server_file_downloads() {
        let diff = diff_listings(vec![], &[meta("f1", "a.txt", 1, 1)]);
        assert_eq!(diff.to_download.len(), 1);
        assert_eq!(diff.to_rename_or_delete.len(), 1);
        assert!(diff.to_upload.is_empty());
        assert!(diff.to_delete_local.is_empty());
    }

    #[test]
    fn test_diff_content_change_downloads() {
        let diff = diff_listings(
            vec![meta("f1", "a.txt", 1, 1)],
            &[meta("f1", "a.txt", 2, 2)],
        );
        assert_eq!(diff.to_download.len(), 1);
        assert!(diff.to_rename_or_delete.is_empty());
    }

    #[test]
    fn test_diff_pure_rename_skips_download() {
        let diff = diff_listings(
            vec![meta("f1", "a.txt", 1, 1)],
            &[meta("f1", "b.txt", 2, 1)],
        );
        assert!(diff.to_download.is_empty());
        assert_eq!(diff.to_rename_or_delete.len(), 1);
        assert_eq!(diff.to_rename_or_delete[0].current_path, "b.txt");
    }

    #[test]
    fn test_diff_soft_delete_no_download() {
        let mut deleted = meta("f1", "a.txt", 2, 1);
        deleted.deleted = true;
        let diff = diff_listings(vec![meta("f1", "a.txt", 1, 1)], &[deleted]);
        assert!(diff.to_download.is_empty());
        assert_eq!(diff.to_rename_or_delete.len(), 1);
        assert!(diff.to_rename_or_delete[0].deleted);
    }

    #[test]
    fn test_diff_local_newer_uploads() {
        let diff = diff_listings(
            vec![meta("f1", "a.txt", 3, 3)],
            &[meta("f1", "a.txt", 2, 2)],
        );
        assert!(diff.to_download.is_empty());
        assert_eq!(diff.to_upload.len(), 1);
        assert_eq!(diff.to_upload[0].version, 3);
    }

    #[test]
    fn test_diff_missing_on_server_deletes_local() {
        let diff = diff_listings(vec![meta("f1", "a.txt", 1, 1)], &[]);
        assert_eq!(diff.to_delete_local, vec!["f1".to_string()]);
    }

    #[test]
    fn test_diff_identical_is_empty() {
        let diff = diff_listings(
            vec![meta("f1", "a.txt", 2, 1)],
            &[meta("f1", "a.txt", 2, 1)],
        );
        assert_eq!(diff, VersionDiff::default());
    }

    #[test]
    fn test_rel_path_wire_form() {
        assert_eq!(rel_to_wire(Path::new("a/b/c.txt")), "a/b/c.txt");
        assert_eq!(wire_to_native("a/b/c.txt"), PathBuf::from("a/b/c.txt"));
    }

    #[test]
    fn test_temp_path_keeps_full_name() {
        assert_eq!(
            temp_path_for(Path::new("/d/notes.txt")),
            PathBuf::from("/d/notes.txt.synxpo_tmp")
        );
    }

    #[test]
    fn test_scan_regular_files() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "a").unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("sub/b.txt"), "b").unwrap();

        let files = scan_regular_files(tmp.path()).unwrap();
        assert_eq!(
            files,
            vec![PathBuf::from("a.txt"), PathBuf::from("sub/b.txt")]
        );
    }

    #[test]
    fn test_scan_missing_root_is_empty() {
        let tmp = tempfile::TempDir::new().unwrap();
        let files = scan_regular_files(&tmp.path().join("absent")).unwrap();
        assert!(files.is_empty());
    }
}
