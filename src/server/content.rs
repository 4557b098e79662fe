//! On-disk blob store for whole-file content.
//!
//! Blobs live at `<root>/<directory_id>/<file_id>`. Synchronous `std::fs`
//! I/O: callers invoke this under the storage engine's lock and wrap the
//! commit path in `spawn_blocking` on the async side.

use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Deterministic blob location for a (directory, file) pair.
    pub fn path_for(&self, directory_id: &str, file_id: &str) -> PathBuf {
        self.root.join(directory_id).join(file_id)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Truncates any prior blob and writes all bytes.
    pub fn write(&self, directory_id: &str, file_id: &str, content: &[u8]) -> io::Result<()> {
        std::fs::create_dir_all(self.root.join(directory_id))?;
        let path = self.path_for(directory_id, file_id);
        std::fs::write(&path, content)?;
        debug!(path = %path.display(), size = content.len(), "wrote content blob");
        Ok(())
    }

    /// Reads the whole blob. A missing blob is an error, not an empty
    /// vector - callers must distinguish absence from a zero-length file.
    pub fn read(&self, directory_id: &str, file_id: &str) -> io::Result<Vec<u8>> {
        std::fs::read(self.path_for(directory_id, file_id))
    }

    /// Removes the blob; missing is not an error.
    pub fn delete(&self, directory_id: &str, file_id: &str) -> io::Result<()> {
        let path = self.path_for(directory_id, file_id);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "deleted content blob");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
