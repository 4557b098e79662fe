//! File metadata storage.
//!
//! This interface is the only persistence contract the sync core depends
//! on. It tracks which directories are registered and the metadata records
//! of their files; it does not touch file content and does not watch the
//! filesystem.

mod memory;
mod sqlite;

use std::path::{Path, PathBuf};

pub use memory::MemoryMetadataStore;
pub use sqlite::SqliteMetadataStore;

use crate::protocol::FileMetadata;

pub type MetaResult<T> = std::result::Result<T, MetaError>;

#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("backend: {0}")]
    Backend(String),
}

/// Durable mapping of directory id to file metadata records, with lookup
/// by file id and by current relative path.
///
/// Deleted files keep their records but are absent from the path index.
pub trait MetadataStore: Send + Sync {
    /// Idempotent; the latest call wins on a path update.
    fn register_directory(&self, directory_id: &str, root_path: &Path) -> MetaResult<()>;

    /// Cascades: all file records of the directory are removed.
    fn unregister_directory(&self, directory_id: &str) -> MetaResult<()>;

    fn list_directories(&self) -> Vec<String>;

    /// Root path the directory was registered with.
    fn directory_root(&self, directory_id: &str) -> Option<PathBuf>;

    /// Directory owning the given absolute path, if any.
    fn directory_id_for_path(&self, path: &Path) -> Option<String>;

    fn list_files(&self, directory_id: &str) -> MetaResult<Vec<FileMetadata>>;

    fn get_by_id(&self, directory_id: &str, file_id: &str) -> MetaResult<FileMetadata>;

    /// Deleted files are absent from the path index.
    fn get_by_path(&self, directory_id: &str, rel_path: &str) -> MetaResult<FileMetadata>;

    /// Atomically replaces the record and the (directory, path) -> id
    /// mapping, dropping any prior mapping for the record's old path.
    /// Requires a non-empty id and a known directory.
    fn upsert(&self, metadata: &FileMetadata) -> MetaResult<()>;

    fn remove(&self, directory_id: &str, file_id: &str) -> MetaResult<()>;
}

pub(crate) fn validate_record(metadata: &FileMetadata) -> MetaResult<()> {
    if metadata.id.is_empty() {
        return Err(MetaError::InvalidRecord("file id is required".to_string()));
    }
    if metadata.directory_id.is_empty() {
        return Err(MetaError::InvalidRecord("directory id is required".to_string()));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod store_tests {
    //! Contract tests run against both implementations.

    use super::*;
    use crate::protocol::FileType;

    fn meta(dir_id: &str, file_id: &str, path: &str, version: u64) -> FileMetadata {
        FileMetadata {
            id: file_id.to_string(),
            directory_id: dir_id.to_string(),
            version,
            content_changed_version: version,
            file_type: FileType::File,
            current_path: path.to_string(),
            deleted: false,
        }
    }

    pub fn register_and_list(store: &dyn MetadataStore) {
        store.register_directory("dir-1", Path::new("/tmp/a")).unwrap();
        store.register_directory("dir-2", Path::new("/tmp/b")).unwrap();

        let mut dirs = store.list_directories();
        dirs.sort();
        assert_eq!(dirs, vec!["dir-1".to_string(), "dir-2".to_string()]);
        assert_eq!(store.directory_root("dir-1"), Some(PathBuf::from("/tmp/a")));
    }

    pub fn register_is_idempotent(store: &dyn MetadataStore) {
        store.register_directory("dir-1", Path::new("/tmp/old")).unwrap();
        store.register_directory("dir-1", Path::new("/tmp/new")).unwrap();
        assert_eq!(store.directory_root("dir-1"), Some(PathBuf::from("/tmp/new")));
        assert_eq!(store.list_directories().len(), 1);
    }

    pub fn upsert_and_lookup(store: &dyn MetadataStore) {
        store.register_directory("dir-1", Path::new("/tmp/a")).unwrap();
        let m = meta("dir-1", "file-1", "x/y.txt", 1);
        store.upsert(&m).unwrap();

        assert_eq!(store.get_by_id("dir-1", "file-1").unwrap(), m);
        assert_eq!(store.get_by_path("dir-1", "x/y.txt").unwrap(), m);
        assert_eq!(store.list_files("dir-1").unwrap(), vec![m]);
    }

    pub fn upsert_requires_known_directory(store: &dyn MetadataStore) {
        let m = meta("dir-missing", "file-1", "a.txt", 1);
        assert!(matches!(store.upsert(&m), Err(MetaError::NotFound(_))));
    }

    pub fn upsert_rejects_empty_id(store: &dyn MetadataStore) {
        store.register_directory("dir-1", Path::new("/tmp/a")).unwrap();
        let m = meta("dir-1", "", "a.txt", 1);
        assert!(matches!(store.upsert(&m), Err(MetaError::InvalidRecord(_))));
    }

    pub fn rename_moves_path_mapping(store: &dyn MetadataStore) {
        store.register_directory("dir-1", Path::new("/tmp/a")).unwrap();
        store.upsert(&meta("dir-1", "file-1", "old.txt", 1)).unwrap();

        let mut renamed = meta("dir-1", "file-1", "new.txt", 2);
        renamed.content_changed_version = 1;
        store.upsert(&renamed).unwrap();

        assert!(matches!(
            store.get_by_path("dir-1", "old.txt"),
            Err(MetaError::NotFound(_))
        ));
        assert_eq!(store.get_by_path("dir-1", "new.txt").unwrap().id, "file-1");
    }

    pub fn deleted_absent_from_path_index(store: &dyn MetadataStore) {
        store.register_directory("dir-1", Path::new("/tmp/a")).unwrap();
        store.upsert(&meta("dir-1", "file-1", "gone.txt", 1)).unwrap();

        let mut deleted = meta("dir-1", "file-1", "gone.txt", 2);
        deleted.deleted = true;
        deleted.content_changed_version = 1;
        store.upsert(&deleted).unwrap();

        assert!(matches!(
            store.get_by_path("dir-1", "gone.txt"),
            Err(MetaError::NotFound(_))
        ));
        // Record itself survives soft-delete
        assert!(store.get_by_id("dir-1", "file-1").unwrap().deleted);

        // A new file may claim the freed path
        store.upsert(&meta("dir-1", "file-2", "gone.txt", 1)).unwrap();
        assert_eq!(store.get_by_path("dir-1", "gone.txt").unwrap().id, "file-2");
    }

    pub fn unregister_cascades(store: &dyn MetadataStore) {
        store.register_directory("dir-1", Path::new("/tmp/a")).unwrap();
        store.upsert(&meta("dir-1", "file-1", "a.txt", 1)).unwrap();
        store.unregister_directory("dir-1").unwrap();

        assert!(store.list_directories().is_empty());
        assert!(matches!(store.list_files("dir-1"), Err(MetaError::NotFound(_))));
    }

    pub fn remove_file(store: &dyn MetadataStore) {
        store.register_directory("dir-1", Path::new("/tmp/a")).unwrap();
        store.upsert(&meta("dir-1", "file-1", "a.txt", 1)).unwrap();
        store.remove("dir-1", "file-1").unwrap();

        assert!(matches!(
            store.get_by_id("dir-1", "file-1"),
            Err(MetaError::NotFound(_))
        ));
        assert!(matches!(
            store.remove("dir-1", "file-1"),
            Err(MetaError::NotFound(_))
        ));
    }

    pub fn directory_id_for_path(store: &dyn MetadataStore) {
        store.register_directory("dir-1", Path::new("/tmp/a")).unwrap();
        store.register_directory("dir-2", Path::new("/tmp/b")).unwrap();

        assert_eq!(
            store.directory_id_for_path(Path::new("/tmp/a/sub/file.txt")),
            Some("dir-1".to_string())
        );
        assert_eq!(
            store.directory_id_for_path(Path::new("/tmp/b/x.txt")),
            Some("dir-2".to_string())
        );
        assert_eq!(store.directory_id_for_path(Path::new("/elsewhere/x.txt")), None);
    }
}
