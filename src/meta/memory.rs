//! In-memory metadata store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::{validate_record, MetaError, MetaResult, MetadataStore};
use crate::protocol::FileMetadata;

#[derive(Default)]
struct DirEntry {
    root: PathBuf,
    files: HashMap<String, FileMetadata>,
    /// current_path -> file id; excludes deleted records.
    path_index: HashMap<String, String>,
}

/// Metadata store backed by nested maps behind a single mutex.
///
/// Suitable for tests and for servers that rebuild state from content on
/// restart.
#[derive(Default)]
pub struct MemoryMetadataStore {
    inner: Mutex<HashMap<String, DirEntry>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn register_directory(&self, directory_id: &str, root_path: &Path) -> MetaResult<()> {
        let mut inner = self.inner.lock();
        let entry = inner.entry(directory_id.to_string()).or_default();
        entry.root = root_path.to_path_buf();
        Ok(())
    }

    fn unregister_directory(&self, directory_id: &str) -> MetaResult<()> {
        self.inner.lock().remove(directory_id);
        Ok(())
    }

    fn list_directories(&self) -> Vec<String> {
        self.inner.lock().keys().cloned().collect()
    }

    fn directory_root(&self, directory_id: &str) -> Option<PathBuf> {
        self.inner.lock().get(directory_id).map(|d| d.root.clone())
    }

    fn directory_id_for_path(&self, path: &Path) -> Option<String> {
        let inner = self.inner.lock();
        inner
            .iter()
            .find(|(_, dir)| !dir.root.as_os_str().is_empty() && path.starts_with(&dir.root))
            .map(|(id, _)| id.clone())
    }

    fn list_files(&self, directory_id: &str) -> MetaResult<Vec<FileMetadata>> {
        let inner = self.inner.lock();
        let dir = inner
            .get(directory_id)
            .ok_or_else(|| MetaError::NotFound(format!("directory: {directory_id}")))?;
        Ok(dir.files.values().cloned().collect())
    }

    fn get_by_id(&self, directory_id: &str, file_id: &str) -> MetaResult<FileMetadata> {
        let inner = self.inner.lock();
        inner
            .get(directory_id)
            .and_then(|dir| dir.files.get(file_id))
            .cloned()
            .ok_or_else(|| MetaError::NotFound(format!("file: {file_id}")))
    }

    fn get_by_path(&self, directory_id: &str, rel_path: &str) -> MetaResult<FileMetadata> {
        let inner = self.inner.lock();
        inner
            .get(directory_id)
            .and_then(|dir| {
                let id = dir.path_index.get(rel_path)?;
                dir.files.get(id)
            })
            .cloned()
            .ok_or_else(|| MetaError::NotFound(format!("file at path: {rel_path}")))
    }

    fn upsert(&self, metadata: &FileMetadata) -> MetaResult<()> {
        validate_record(metadata)?;

        let mut inner = self.inner.lock();
        let dir = inner
            .get_mut(&metadata.directory_id)
            .ok_or_else(|| MetaError::NotFound(format!("directory: {}", metadata.directory_id)))?;

        if let Some(old) = dir.files.get(&metadata.id) {
            if dir.path_index.get(&old.current_path) == Some(&metadata.id) {
                dir.path_index.remove(&old.current_path);
            }
        }

        if !metadata.deleted {
            dir.path_index
                .insert(metadata.current_path.clone(), metadata.id.clone());
        } else {
            // A deleted record must not shadow a live one at the same path
            if dir.path_index.get(&metadata.current_path) == Some(&metadata.id) {
                dir.path_index.remove(&metadata.current_path);
            }
        }

        dir.files.insert(metadata.id.clone(), metadata.clone());
        Ok(())
    }

    fn remove(&self, directory_id: &str, file_id: &str) -> MetaResult<()> {
        let mut inner = self.inner.lock();
        let dir = inner
            .get_mut(directory_id)
            .ok_or_else(|| MetaError::NotFound(format!("directory: {directory_id}")))?;

        let removed = dir
            .files
            .remove(file_id)
            .ok_or_else(|| MetaError::NotFound(format!("file: {file_id}")))?;

        if dir.path_index.get(&removed.current_path) == Some(&removed.id) {
            dir.path_index.remove(&removed.current_path);
        }
        Ok(())
    }
}
