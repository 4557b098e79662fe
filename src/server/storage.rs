//! Authoritative per-file version and lock state.
//!
//! All server-side mutations funnel through this engine: version-increase
//! arbitration, write locks with backup snapshots, commit, rollback, and
//! the reader-side lock triplet. One reader-writer lock protects the whole
//! directory map; mutations are mirrored to the metadata store and the
//! content store while the lock is held, and the in-memory state stays
//! authoritative for the lifetime of the process.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::meta::MetadataStore;
use crate::protocol::{
    AskVersionIncrease, FileMetadata, FileStatus, FileType, RequestFileContent,
};
use crate::server::content::ContentStore;

/// The most recent admitted attempt for a file: the client-supplied
/// FIRST_TRY_TIME and the connection that carried it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LastTry {
    pub time: u64,
    pub client_id: String,
}

/// A file as held by the server.
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub id: String,
    pub directory_id: String,
    pub version: u64,
    pub content_changed_version: u64,
    pub file_type: FileType,
    pub current_path: String,
    pub deleted: bool,
    /// Cached content; None means not loaded from disk yet.
    pub content: Option<Vec<u8>>,
    /// Client holding the write lock; empty when free.
    pub locked_by: String,
    pub lock_acquired_at: Option<Instant>,
    /// Number of in-flight reads. Reads exclude writes but not each other.
    pub readers: u32,
    pub last_try: LastTry,
}

impl StoredFile {
    fn write_locked(&self) -> bool {
        !self.locked_by.is_empty()
    }

    fn clear_write_lock(&mut self) {
        self.locked_by.clear();
        self.lock_acquired_at = None;
    }

    pub fn metadata(&self) -> FileMetadata {
        FileMetadata {
            id: self.id.clone(),
            directory_id: self.directory_id.clone(),
            version: self.version,
            content_changed_version: self.content_changed_version,
            file_type: self.file_type,
            current_path: self.current_path.clone(),
            deleted: self.deleted,
        }
    }

    fn from_metadata(meta: &FileMetadata) -> Self {
        Self {
            id: meta.id.clone(),
            directory_id: meta.directory_id.clone(),
            version: meta.version,
            content_changed_version: meta.content_changed_version,
            file_type: meta.file_type,
            current_path: meta.current_path.clone(),
            deleted: meta.deleted,
            content: None,
            locked_by: String::new(),
            lock_acquired_at: None,
            readers: 0,
            last_try: LastTry::default(),
        }
    }
}

struct Directory {
    files: HashMap<String, StoredFile>,
    /// current_path -> file id; excludes deleted entries.
    path_index: HashMap<String, String>,
}

impl Directory {
    fn new() -> Self {
        Self {
            files: HashMap::new(),
            path_index: HashMap::new(),
        }
    }

    /// Locate a file id by request discriminator: id if present, else path.
    fn locate(&self, file_id: &str, current_path: &str) -> Option<String> {
        if !file_id.is_empty() && self.files.contains_key(file_id) {
            return Some(file_id.to_string());
        }
        if !current_path.is_empty() {
            return self.path_index.get(current_path).cloned();
        }
        None
    }
}

struct Inner {
    directories: HashMap<String, Directory>,
    /// client_id -> file_id -> pre-lock snapshot, for rollback.
    backups: HashMap<String, HashMap<String, StoredFile>>,
}

/// Outcome of arbitration for one requested file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionCheckResult {
    /// Empty for files the server has not seen yet.
    pub file_id: String,
    pub directory_id: String,
    pub status: FileStatus,
}

pub struct StorageEngine {
    meta: Arc<dyn MetadataStore>,
    content: ContentStore,
    inner: RwLock<Inner>,
}

impl StorageEngine {
    pub fn new(storage_root: impl Into<std::path::PathBuf>, meta: Arc<dyn MetadataStore>) -> io::Result<Self> {
        let content = ContentStore::new(storage_root)?;
        let engine = Self {
            meta,
            content,
            inner: RwLock::new(Inner {
                directories: HashMap::new(),
                backups: HashMap::new(),
            }),
        };
        engine.load_from_meta();
        Ok(engine)
    }

    /// Hydrate the in-memory map from the metadata store; content blobs are
    /// read lazily on first access.
    fn load_from_meta(&self) {
        let mut inner = self.inner.write();

        let dir_ids = self.meta.list_directories();
        info!(count = dir_ids.len(), "loading directories from metadata store");

        for dir_id in dir_ids {
            let mut dir = Directory::new();
            match self.meta.list_files(&dir_id) {
                Ok(files) => {
                    for meta in &files {
                        let stored = StoredFile::from_metadata(meta);
                        if !stored.deleted {
                            dir.path_index
                                .insert(stored.current_path.clone(), stored.id.clone());
                        }
                        dir.files.insert(stored.id.clone(), stored);
                    }
                    debug!(directory_id = %dir_id, files = files.len(), "loaded directory");
                }
                Err(e) => warn!(directory_id = %dir_id, "failed to load files: {e}"),
            }
            inner.directories.insert(dir_id, dir);
        }
    }

    /// Mint a fresh directory, register it, return its id.
    pub fn create_directory(&self) -> String {
        let mut inner = self.inner.write();
        let dir_id = Uuid::new_v4().to_string();

        inner.directories.insert(dir_id.clone(), Directory::new());

        let dir_path = self.content.root().join(&dir_id);
        if let Err(e) = std::fs::create_dir_all(&dir_path) {
            warn!(directory_id = %dir_id, "failed to create blob directory: {e}");
        }
        if let Err(e) = self.meta.register_directory(&dir_id, &dir_path) {
            warn!(directory_id = %dir_id, "failed to register directory: {e}");
        }

        info!(directory_id = %dir_id, "created directory");
        dir_id
    }

    pub fn directory_exists(&self, directory_id: &str) -> bool {
        self.inner.read().directories.contains_key(directory_id)
    }

    /// Metadata of every non-deleted file in the directory.
    pub fn directory_files(&self, directory_id: &str) -> Vec<FileMetadata> {
        let inner = self.inner.read();
        let Some(dir) = inner.directories.get(directory_id) else {
            return Vec::new();
        };
        dir.files
            .values()
            .filter(|f| !f.deleted)
            .map(StoredFile::metadata)
            .collect()
    }

    /// Metadata of a single file, without touching the content store.
    /// Soft-deleted records are returned too.
    pub fn file_metadata(&self, directory_id: &str, file_id: &str) -> Option<FileMetadata> {
        let inner = self.inner.read();
        inner
            .directories
            .get(directory_id)?
            .files
            .get(file_id)
            .map(StoredFile::metadata)
    }

    /// Snapshot of a file, loading content from disk if not cached.
    pub fn file(&self, directory_id: &str, file_id: &str) -> Option<StoredFile> {
        let inner = self.inner.read();
        let file = inner.directories.get(directory_id)?.files.get(file_id)?;
        let mut snapshot = file.clone();
        drop(inner);

        if !snapshot.deleted && snapshot.content.is_none() {
            match self.content.read(directory_id, file_id) {
                Ok(bytes) => snapshot.content = Some(bytes),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(file_id, "failed to read content blob: {e}"),
            }
        }
        Some(snapshot)
    }

    pub fn file_by_path(&self, directory_id: &str, rel_path: &str) -> Option<StoredFile> {
        let file_id = {
            let inner = self.inner.read();
            inner
                .directories
                .get(directory_id)?
                .path_index
                .get(rel_path)?
                .clone()
        };
        self.file(directory_id, &file_id)
    }

    /// The conflict arbiter. For each file of the request, decide FREE,
    /// BLOCKED, or DENIED against the stored LAST_TRY and lock state; FREE
    /// results update LAST_TRY as a side effect.
    pub fn check_version_increase(
        &self,
        client_id: &str,
        request: &AskVersionIncrease,
    ) -> Vec<VersionCheckResult> {
        let mut inner = self.inner.write();
        let mut results = Vec::with_capacity(request.files.len());

        for change in &request.files {
            let mut result = VersionCheckResult {
                file_id: String::new(),
                directory_id: change.directory_id.clone(),
                status: FileStatus::Denied,
            };

            let Some(dir) = inner.directories.get_mut(&change.directory_id) else {
                warn!(directory_id = %change.directory_id, "version check: directory not found");
                results.push(result);
                continue;
            };

            let Some(file_id) = dir.locate(&change.id, &change.current_path) else {
                // New file: admitted, id assigned at commit
                result.status = FileStatus::Free;
                debug!(path = %change.current_path, "version check: new file, free");
                results.push(result);
                continue;
            };

            let file = dir.files.get_mut(&file_id).expect("located id is present");
            result.file_id = file_id;

            let t_req = change.first_try_time;
            let last = &file.last_try;

            if last.time > t_req {
                // A later competing writer has already been admitted
                result.status = FileStatus::Denied;
                debug!(file_id = %result.file_id, "version check: denied (stale attempt)");
            } else if last.time < t_req || (last.time == t_req && last.client_id == client_id) {
                if file.write_locked() && file.locked_by != client_id {
                    result.status = FileStatus::Blocked;
                    debug!(file_id = %result.file_id, locked_by = %file.locked_by, "version check: blocked");
                } else if file.readers > 0 {
                    result.status = FileStatus::Blocked;
                    debug!(file_id = %result.file_id, "version check: blocked (being read)");
                } else {
                    result.status = FileStatus::Free;
                    file.last_try = LastTry {
                        time: t_req,
                        client_id: client_id.to_string(),
                    };
                }
            } else {
                // Same timestamp, different connection: deterministic tie-break
                result.status = FileStatus::Denied;
                debug!(file_id = %result.file_id, "version check: denied (timestamp tie)");
            }

            results.push(result);
        }

        results
    }

    /// Take backup snapshots and set write locks for every existing file of
    /// the request. Requires a preceding all-FREE `check_version_increase`.
    pub fn lock_files_for_write(&self, client_id: &str, request: &AskVersionIncrease) {
        let mut inner = self.inner.write();
        let now = Instant::now();

        for change in &request.files {
            let Some(dir) = inner.directories.get(&change.directory_id) else {
                continue;
            };
            let Some(file_id) = dir.locate(&change.id, &change.current_path) else {
                continue;
            };

            let snapshot = inner.directories[&change.directory_id].files[&file_id].clone();
            inner
                .backups
                .entry(client_id.to_string())
                .or_default()
                .insert(file_id.clone(), snapshot);

            let dir = inner.directories.get_mut(&change.directory_id).unwrap();
            let file = dir.files.get_mut(&file_id).unwrap();
            file.locked_by = client_id.to_string();
            file.lock_acquired_at = Some(now);
            debug!(file_id = %file_id, client_id, "locked file for write");
        }
    }

    /// Commit: bump versions, apply metadata changes and content, maintain
    /// the path index, clear write locks, mirror to the metadata store.
    ///
    /// `contents` maps file id (if known) or current path to the uploaded
    /// bytes. Returns the updated records for notification fan-out.
    pub fn apply_version_increase(
        &self,
        client_id: &str,
        request: &AskVersionIncrease,
        contents: &HashMap<String, Vec<u8>>,
    ) -> Vec<FileMetadata> {
        let mut inner = self.inner.write();
        let mut updated = Vec::new();

        for change in &request.files {
            let Some(dir) = inner.directories.get_mut(&change.directory_id) else {
                warn!(directory_id = %change.directory_id, "apply: directory not found");
                continue;
            };

            match dir.locate(&change.id, &change.current_path) {
                Some(file_id) => {
                    let file = dir.files.get(&file_id).expect("located id is present");
                    let old_path = file.current_path.clone();
                    let mut next = file.clone();

                    next.version += 1;

                    if change.content_changed {
                        next.content_changed_version = next.version;
                        let bytes = contents
                            .get(&file_id)
                            .or_else(|| contents.get(&change.current_path));
                        if let Some(bytes) = bytes {
                            if let Err(e) = self.content.write(&change.directory_id, &file_id, bytes)
                            {
                                // Abort this file's commit; the lock stands
                                // until rollback or the stale-lock sweep.
                                warn!(file_id = %file_id, "content write failed, commit aborted: {e}");
                                continue;
                            }
                            next.content = Some(bytes.clone());
                        }
                    }

                    next.file_type = change.file_type;
                    next.current_path = change.current_path.clone();

                    if change.deleted && !next.deleted {
                        if let Err(e) = self.content.delete(&change.directory_id, &file_id) {
                            warn!(file_id = %file_id, "failed to delete content blob: {e}");
                        }
                        next.content = None;
                    }
                    next.deleted = change.deleted;
                    next.clear_write_lock();

                    if old_path != change.current_path {
                        dir.path_index.remove(&old_path);
                    }
                    if change.deleted {
                        dir.path_index.remove(&change.current_path);
                    } else {
                        dir.path_index
                            .insert(change.current_path.clone(), file_id.clone());
                    }

                    let meta = next.metadata();
                    dir.files.insert(file_id.clone(), next);
                    if let Err(e) = self.meta.upsert(&meta) {
                        warn!(file_id = %file_id, "metadata upsert failed: {e}");
                    }
                    info!(
                        file_id = %meta.id,
                        path = %meta.current_path,
                        version = meta.version,
                        content_changed_version = meta.content_changed_version,
                        "updated file"
                    );
                    updated.push(meta);
                }
                None => {
                    let mut file = StoredFile {
                        id: Uuid::new_v4().to_string(),
                        directory_id: change.directory_id.clone(),
                        version: 1,
                        content_changed_version: if change.content_changed { 1 } else { 0 },
                        file_type: change.file_type,
                        current_path: change.current_path.clone(),
                        deleted: change.deleted,
                        content: None,
                        locked_by: String::new(),
                        lock_acquired_at: None,
                        readers: 0,
                        last_try: LastTry {
                            time: change.first_try_time,
                            client_id: client_id.to_string(),
                        },
                    };

                    if change.content_changed {
                        let bytes = contents
                            .get(&change.current_path)
                            .or_else(|| contents.get(&change.id));
                        if let Some(bytes) = bytes {
                            if let Err(e) =
                                self.content.write(&change.directory_id, &file.id, bytes)
                            {
                                warn!(path = %change.current_path, "content write failed, file not created: {e}");
                                continue;
                            }
                            file.content = Some(bytes.clone());
                        }
                    }

                    if !file.deleted {
                        dir.path_index
                            .insert(file.current_path.clone(), file.id.clone());
                    }

                    let meta = file.metadata();
                    dir.files.insert(file.id.clone(), file);
                    if let Err(e) = self.meta.upsert(&meta) {
                        warn!(file_id = %meta.id, "metadata upsert failed: {e}");
                    }
                    info!(file_id = %meta.id, path = %meta.current_path, "created file");
                    updated.push(meta);
                }
            }
        }

        inner.backups.remove(client_id);
        updated
    }

    /// Undo a failed upload: restore pre-lock snapshots and release any
    /// write locks the client still holds on the requested files. Content
    /// blobs written before the rollback are not undone; the lock and
    /// version gate keep intermediate state invisible, and the next commit
    /// overwrites them.
    pub fn rollback_upload(&self, client_id: &str, request: &AskVersionIncrease) {
        let mut inner = self.inner.write();

        if let Some(backups) = inner.backups.remove(client_id) {
            for (file_id, snapshot) in backups {
                if let Some(dir) = inner.directories.get_mut(&snapshot.directory_id) {
                    if let Some(file) = dir.files.get_mut(&file_id) {
                        *file = snapshot;
                        info!(file_id = %file_id, "rolled back file");
                    }
                }
            }
        }

        for change in &request.files {
            let Some(dir) = inner.directories.get_mut(&change.directory_id) else {
                continue;
            };
            let Some(file_id) = dir.locate(&change.id, &change.current_path) else {
                continue;
            };
            let file = dir.files.get_mut(&file_id).expect("located id is present");
            if file.locked_by == client_id {
                file.clear_write_lock();
                debug!(file_id = %file_id, "unlocked file after rollback");
            }
        }
    }

    /// Reader-side arbitration: DENIED for unknown directory or file,
    /// BLOCKED when write-locked by any client, else FREE.
    pub fn check_files_for_read(
        &self,
        _client_id: &str,
        request: &RequestFileContent,
    ) -> Vec<VersionCheckResult> {
        let inner = self.inner.read();
        let mut results = Vec::with_capacity(request.files.len());

        for file_id in &request.files {
            let mut result = VersionCheckResult {
                file_id: file_id.id.clone(),
                directory_id: file_id.directory_id.clone(),
                status: FileStatus::Denied,
            };

            if let Some(file) = inner
                .directories
                .get(&file_id.directory_id)
                .and_then(|d| d.files.get(&file_id.id))
            {
                result.status = if file.write_locked() {
                    FileStatus::Blocked
                } else {
                    FileStatus::Free
                };
            }

            results.push(result);
        }

        results
    }

    pub fn lock_files_for_read(&self, _client_id: &str, request: &RequestFileContent) {
        let mut inner = self.inner.write();
        for file_id in &request.files {
            if let Some(file) = inner
                .directories
                .get_mut(&file_id.directory_id)
                .and_then(|d| d.files.get_mut(&file_id.id))
            {
                file.readers += 1;
            }
        }
    }

    pub fn unlock_files_after_read(&self, _client_id: &str, request: &RequestFileContent) {
        let mut inner = self.inner.write();
        for file_id in &request.files {
            if let Some(file) = inner
                .directories
                .get_mut(&file_id.directory_id)
                .and_then(|d| d.files.get_mut(&file_id.id))
            {
                file.readers = file.readers.saturating_sub(1);
            }
        }
    }

    /// Disconnect cleanup: release write locks and drop backups.
    pub fn release_locks(&self, client_id: &str) {
        let mut inner = self.inner.write();

        for dir in inner.directories.values_mut() {
            for file in dir.files.values_mut() {
                if file.locked_by == client_id {
                    file.clear_write_lock();
                    info!(file_id = %file.id, "released lock on disconnect");
                }
            }
        }

        inner.backups.remove(client_id);
    }

    /// Background sweep: clear write locks older than `write_timeout`.
    /// Backups are not restored; the owning upload is already lost and the
    /// client is expected to retry.
    pub fn check_stale_locks(&self, write_timeout: Duration) {
        let mut inner = self.inner.write();
        let now = Instant::now();

        for dir in inner.directories.values_mut() {
            for file in dir.files.values_mut() {
                if let Some(acquired) = file.lock_acquired_at {
                    if now.duration_since(acquired) > write_timeout {
                        info!(file_id = %file.id, locked_by = %file.locked_by, "releasing stale lock");
                        file.clear_write_lock();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::MemoryMetadataStore;
    use crate::protocol::FileChange;
    use tempfile::TempDir;

    fn engine() -> (StorageEngine, TempDir) {
        let tmp = TempDir::new().unwrap();
        let meta = Arc::new(MemoryMetadataStore::new());
        let engine = StorageEngine::new(tmp.path().join("storage"), meta).unwrap();
        (engine, tmp)
    }

    fn change(dir_id: &str, id: &str, path: &str, t: u64) -> FileChange {
        FileChange {
            id: id.to_string(),
            directory_id: dir_id.to_string(),
            current_path: path.to_string(),
            file_type: FileType::File,
            deleted: false,
            content_changed: true,
            first_try_time: t,
        }
    }

    fn ask(changes: Vec<FileChange>) -> AskVersionIncrease {
        AskVersionIncrease { files: changes }
    }

    fn commit_file(
        engine: &StorageEngine,
        client: &str,
        dir_id: &str,
        path: &str,
        content: &[u8],
        t: u64,
    ) -> FileMetadata {
        let request = ask(vec![change(dir_id, "", path, t)]);
        let results = engine.check_version_increase(client, &request);
        assert!(results.iter().all(|r| r.status == FileStatus::Free));
        engine.lock_files_for_write(client, &request);

        let mut contents = HashMap::new();
        contents.insert(path.to_string(), content.to_vec());
        let updated = engine.apply_version_increase(client, &request, &contents);
        assert_eq!(updated.len(), 1);
        updated.into_iter().next().unwrap()
    }

    #[test]
    fn test_create_directory() {
        let (engine, _tmp) = engine();
        let dir_id = engine.create_directory();
        assert_eq!(dir_id.len(), 36);
        assert!(engine.directory_exists(&dir_id));
        assert!(!engine.directory_exists("nope"));
    }

    #[test]
    fn test_new_file_is_free() {
        let (engine, _tmp) = engine();
        let dir_id = engine.create_directory();

        let results =
            engine.check_version_increase("client-a", &ask(vec![change(&dir_id, "", "a.txt", 100)]));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, FileStatus::Free);
        assert!(results[0].file_id.is_empty());
    }

    #[test]
    fn test_unknown_directory_is_denied() {
        let (engine, _tmp) = engine();
        let results =
            engine.check_version_increase("client-a", &ask(vec![change("missing", "", "a.txt", 100)]));
        assert_eq!(results[0].status, FileStatus::Denied);
    }

    #[test]
    fn test_commit_creates_version_one() {
        let (engine, _tmp) = engine();
        let dir_id = engine.create_directory();

        let meta = commit_file(&engine, "client-a", &dir_id, "a.txt", b"v1", 100);
        assert_eq!(meta.version, 1);
        assert_eq!(meta.content_changed_version, 1);
        assert_eq!(meta.current_path, "a.txt");

        let stored = engine.file(&dir_id, &meta.id).unwrap();
        assert_eq!(stored.content.as_deref(), Some(b"v1".as_slice()));
        assert_eq!(stored.last_try.time, 100);
    }

    #[test]
    fn test_last_try_denies_older_attempt() {
        let (engine, _tmp) = engine();
        let dir_id = engine.create_directory();
        let meta = commit_file(&engine, "client-b", &dir_id, "a.txt", b"newer", 200);

        // An attempt stamped before the admitted one loses
        let results = engine.check_version_increase(
            "client-a",
            &ask(vec![change(&dir_id, &meta.id, "a.txt", 100)]),
        );
        assert_eq!(results[0].status, FileStatus::Denied);
    }

    #[test]
    fn test_same_timestamp_tie_break_by_connection() {
        let (engine, _tmp) = engine();
        let dir_id = engine.create_directory();
        let meta = commit_file(&engine, "client-a", &dir_id, "a.txt", b"x", 100);

        // Same client, same timestamp: idempotent retry
        let retry = engine.check_version_increase(
            "client-a",
            &ask(vec![change(&dir_id, &meta.id, "a.txt", 100)]),
        );
        assert_eq!(retry[0].status, FileStatus::Free);

        // Different client, same timestamp: denied
        let other = engine.check_version_increase(
            "client-b",
            &ask(vec![change(&dir_id, &meta.id, "a.txt", 100)]),
        );
        assert_eq!(other[0].status, FileStatus::Denied);
    }

    #[test]
    fn test_write_lock_blocks_other_writers() {
        let (engine, _tmp) = engine();
        let dir_id = engine.create_directory();
        let meta = commit_file(&engine, "client-a", &dir_id, "a.txt", b"x", 100);

        let request = ask(vec![change(&dir_id, &meta.id, "a.txt", 200)]);
        let results = engine.check_version_increase("client-a", &request);
        assert_eq!(results[0].status, FileStatus::Free);
        engine.lock_files_for_write("client-a", &request);

        let blocked = engine.check_version_increase(
            "client-b",
            &ask(vec![change(&dir_id, &meta.id, "a.txt", 300)]),
        );
        assert_eq!(blocked[0].status, FileStatus::Blocked);
    }

    #[test]
    fn test_reader_blocks_writer_and_writer_blocks_reader() {
        let (engine, _tmp) = engine();
        let dir_id = engine.create_directory();
        let meta = commit_file(&engine, "client-a", &dir_id, "a.txt", b"x", 100);

        let read_request = RequestFileContent {
            files: vec![crate::protocol::FileId {
                id: meta.id.clone(),
                directory_id: dir_id.clone(),
            }],
        };

        engine.lock_files_for_read("reader", &read_request);
        let blocked = engine.check_version_increase(
            "client-b",
            &ask(vec![change(&dir_id, &meta.id, "a.txt", 200)]),
        );
        assert_eq!(blocked[0].status, FileStatus::Blocked);
        engine.unlock_files_after_read("reader", &read_request);

        // Now a write lock blocks readers
        let request = ask(vec![change(&dir_id, &meta.id, "a.txt", 300)]);
        assert_eq!(
            engine.check_version_increase("client-b", &request)[0].status,
            FileStatus::Free
        );
        engine.lock_files_for_write("client-b", &request);

        let read_check = engine.check_files_for_read("reader", &read_request);
        assert_eq!(read_check[0].status, FileStatus::Blocked);
    }

    #[test]
    fn test_concurrent_reads_allowed() {
        let (engine, _tmp) = engine();
        let dir_id = engine.create_directory();
        let meta = commit_file(&engine, "client-a", &dir_id, "a.txt", b"x", 100);

        let request = RequestFileContent {
            files: vec![crate::protocol::FileId {
                id: meta.id.clone(),
                directory_id: dir_id.clone(),
            }],
        };

        engine.lock_files_for_read("reader-1", &request);
        let second = engine.check_files_for_read("reader-2", &request);
        assert_eq!(second[0].status, FileStatus::Free);

        engine.unlock_files_after_read("reader-1", &request);
        engine.unlock_files_after_read("reader-2", &request);

        // Writer is free again once all readers are gone
        let write = engine.check_version_increase(
            "client-b",
            &ask(vec![change(&dir_id, &meta.id, "a.txt", 200)]),
        );
        assert_eq!(write[0].status, FileStatus::Free);
    }

    #[test]
    fn test_rename_keeps_content_version() {
        let (engine, _tmp) = engine();
        let dir_id = engine.create_directory();
        let meta = commit_file(&engine, "client-a", &dir_id, "a.txt", b"body", 100);

        let mut rename = change(&dir_id, &meta.id, "renamed.txt", 200);
        rename.content_changed = false;
        let request = ask(vec![rename]);

        assert_eq!(
            engine.check_version_increase("client-a", &request)[0].status,
            FileStatus::Free
        );
        engine.lock_files_for_write("client-a", &request);
        let updated = engine.apply_version_increase("client-a", &request, &HashMap::new());

        assert_eq!(updated[0].version, 2);
        assert_eq!(updated[0].content_changed_version, 1);
        assert_eq!(updated[0].current_path, "renamed.txt");

        // Path index moved with the rename
        assert!(engine.file_by_path(&dir_id, "a.txt").is_none());
        let at_new = engine.file_by_path(&dir_id, "renamed.txt").unwrap();
        assert_eq!(at_new.id, meta.id);
        assert_eq!(at_new.content.as_deref(), Some(b"body".as_slice()));
    }

    #[test]
    fn test_soft_delete_removes_blob_and_path() {
        let (engine, _tmp) = engine();
        let dir_id = engine.create_directory();
        let meta = commit_file(&engine, "client-a", &dir_id, "a.txt", b"body", 100);

        let mut delete = change(&dir_id, &meta.id, "a.txt", 200);
        delete.deleted = true;
        delete.content_changed = false;
        let request = ask(vec![delete]);

        assert_eq!(
            engine.check_version_increase("client-a", &request)[0].status,
            FileStatus::Free
        );
        engine.lock_files_for_write("client-a", &request);
        let updated = engine.apply_version_increase("client-a", &request, &HashMap::new());

        assert!(updated[0].deleted);
        assert_eq!(updated[0].version, 2);

        // Record survives, path index and listing drop it
        assert!(engine.file(&dir_id, &meta.id).unwrap().deleted);
        assert!(engine.file_by_path(&dir_id, "a.txt").is_none());
        assert!(engine.directory_files(&dir_id).is_empty());
    }

    #[test]
    fn test_rollback_restores_pre_lock_snapshot() {
        let (engine, _tmp) = engine();
        let dir_id = engine.create_directory();
        let meta = commit_file(&engine, "client-a", &dir_id, "a.txt", b"v1", 100);

        let request = ask(vec![change(&dir_id, &meta.id, "a.txt", 200)]);
        assert_eq!(
            engine.check_version_increase("client-b", &request)[0].status,
            FileStatus::Free
        );
        engine.lock_files_for_write("client-b", &request);

        engine.rollback_upload("client-b", &request);

        let restored = engine.file(&dir_id, &meta.id).unwrap();
        assert_eq!(restored.version, 1);
        assert_eq!(restored.content_changed_version, 1);
        assert_eq!(restored.current_path, "a.txt");
        assert!(!restored.deleted);
        assert!(!restored.write_locked());
        // LAST_TRY reflects the admitted (then rolled back) attempt
        assert_eq!(restored.last_try.time, 200);

        // A fresh writer is admitted again
        let after = engine.check_version_increase(
            "client-c",
            &ask(vec![change(&dir_id, &meta.id, "a.txt", 300)]),
        );
        assert_eq!(after[0].status, FileStatus::Free);
    }

    #[test]
    fn test_release_locks_on_disconnect() {
        let (engine, _tmp) = engine();
        let dir_id = engine.create_directory();
        let meta = commit_file(&engine, "client-a", &dir_id, "a.txt", b"x", 100);

        let request = ask(vec![change(&dir_id, &meta.id, "a.txt", 200)]);
        engine.check_version_increase("client-b", &request);
        engine.lock_files_for_write("client-b", &request);

        engine.release_locks("client-b");

        let stored = engine.file(&dir_id, &meta.id).unwrap();
        assert!(!stored.write_locked());
    }

    #[test]
    fn test_stale_lock_sweep() {
        let (engine, _tmp) = engine();
        let dir_id = engine.create_directory();
        let meta = commit_file(&engine, "client-a", &dir_id, "a.txt", b"x", 100);

        let request = ask(vec![change(&dir_id, &meta.id, "a.txt", 200)]);
        engine.check_version_increase("client-b", &request);
        engine.lock_files_for_write("client-b", &request);

        // A generous timeout leaves the lock alone
        engine.check_stale_locks(Duration::from_secs(60));
        assert!(engine.file(&dir_id, &meta.id).unwrap().write_locked());

        // Zero timeout sweeps it
        engine.check_stale_locks(Duration::from_secs(0));
        assert!(!engine.file(&dir_id, &meta.id).unwrap().write_locked());
    }

    #[test]
    fn test_versions_increase_monotonically() {
        let (engine, _tmp) = engine();
        let dir_id = engine.create_directory();

        let first = commit_file(&engine, "client-a", &dir_id, "a.txt", b"v1", 100);
        for i in 2..=10u64 {
            let request = ask(vec![change(&dir_id, &first.id, "a.txt", 100 + i)]);
            assert_eq!(
                engine.check_version_increase("client-a", &request)[0].status,
                FileStatus::Free
            );
            engine.lock_files_for_write("client-a", &request);
            let mut contents = HashMap::new();
            contents.insert(first.id.clone(), format!("v{i}").into_bytes());
            let updated = engine.apply_version_increase("client-a", &request, &contents);
            assert_eq!(updated[0].version, i);
            assert_eq!(updated[0].content_changed_version, i);
        }

        let stored = engine.file(&dir_id, &first.id).unwrap();
        assert_eq!(stored.version, 10);
        assert_eq!(stored.content.as_deref(), Some(b"v10".as_slice()));
    }

    #[test]
    fn test_same_path_new_file_race_last_writer_wins() {
        let (engine, _tmp) = engine();
        let dir_id = engine.create_directory();

        // Both clients admitted while the path is still unknown
        let req_a = ask(vec![change(&dir_id, "", "race.txt", 100)]);
        let req_b = ask(vec![change(&dir_id, "", "race.txt", 200)]);
        assert_eq!(
            engine.check_version_increase("client-a", &req_a)[0].status,
            FileStatus::Free
        );
        assert_eq!(
            engine.check_version_increase("client-b", &req_b)[0].status,
            FileStatus::Free
        );
        engine.lock_files_for_write("client-a", &req_a);
        engine.lock_files_for_write("client-b", &req_b);

        let mut contents_a = HashMap::new();
        contents_a.insert("race.txt".to_string(), b"from a".to_vec());
        let first = engine.apply_version_increase("client-a", &req_a, &contents_a);
        assert_eq!(first[0].version, 1);

        // The second commit lands on the record the first created
        let mut contents_b = HashMap::new();
        contents_b.insert("race.txt".to_string(), b"from b".to_vec());
        let second = engine.apply_version_increase("client-b", &req_b, &contents_b);
        assert_eq!(second[0].version, 2);
        assert_eq!(second[0].id, first[0].id);

        let stored = engine.file_by_path(&dir_id, "race.txt").unwrap();
        assert_eq!(stored.content.as_deref(), Some(b"from b".as_slice()));
    }

    #[test]
    fn test_restart_rehydrates_from_metadata() {
        let tmp = TempDir::new().unwrap();
        let meta: Arc<dyn MetadataStore> = Arc::new(MemoryMetadataStore::new());

        let dir_id;
        let file_id;
        {
            let engine = StorageEngine::new(tmp.path().join("storage"), meta.clone()).unwrap();
            dir_id = engine.create_directory();
            file_id = commit_file(&engine, "client-a", &dir_id, "kept.txt", b"persisted", 100).id;
        }

        let engine = StorageEngine::new(tmp.path().join("storage"), meta).unwrap();
        assert!(engine.directory_exists(&dir_id));

        let stored = engine.file(&dir_id, &file_id).unwrap();
        assert_eq!(stored.version, 1);
        // Content comes back lazily from the blob store
        assert_eq!(stored.content.as_deref(), Some(b"persisted".as_slice()));
    }
}
