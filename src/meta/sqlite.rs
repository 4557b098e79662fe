//! SQLite-backed metadata store.
//!
//! Two tables: `directories` and `files`, with a partial unique index on
//! `(directory_id, current_path)` covering non-deleted rows only - the path
//! index excludes soft-deleted records, so a new file may claim a path a
//! deleted record still carries.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use super::{validate_record, MetaError, MetaResult, MetadataStore};
use crate::protocol::{FileMetadata, FileType};

struct Inner {
    conn: Connection,
    /// directory_id -> registered root; kept in memory for path lookups.
    directories: HashMap<String, PathBuf>,
}

pub struct SqliteMetadataStore {
    inner: Mutex<Inner>,
}

fn db_err(e: rusqlite::Error) -> MetaError {
    MetaError::Backend(e.to_string())
}

impl SqliteMetadataStore {
    pub fn open(db_path: &Path) -> MetaResult<Self> {
        if let Some(parent) = db_path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                return Err(MetaError::Backend(format!(
                    "failed to create {}: {e}",
                    parent.display()
                )));
            }
        }

        let conn = Connection::open(db_path).map_err(|e| {
            warn!("failed to open metadata db {}: {e}", db_path.display());
            db_err(e)
        })?;

        conn.pragma_update(None, "journal_mode", "WAL").map_err(db_err)?;
        conn.pragma_update(None, "foreign_keys", "ON").map_err(db_err)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS directories (
                directory_id   TEXT PRIMARY KEY,
                directory_path TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS files (
                directory_id            TEXT NOT NULL,
                file_id                 TEXT NOT NULL,
                version                 INTEGER NOT NULL,
                content_changed_version INTEGER NOT NULL,
                file_type               INTEGER NOT NULL,
                current_path            TEXT NOT NULL,
                deleted                 INTEGER NOT NULL,
                PRIMARY KEY (directory_id, file_id),
                FOREIGN KEY (directory_id)
                    REFERENCES directories (directory_id) ON DELETE CASCADE
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_files_dir_path
                ON files (directory_id, current_path) WHERE deleted = 0;",
        )
        .map_err(db_err)?;

        let mut directories = HashMap::new();
        {
            let mut stmt = conn
                .prepare("SELECT directory_id, directory_path FROM directories")
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(db_err)?;
            for row in rows {
                let (id, path) = row.map_err(db_err)?;
                directories.insert(id, PathBuf::from(path));
            }
        }

        Ok(Self {
            inner: Mutex::new(Inner { conn, directories }),
        })
    }

    fn row_to_metadata(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileMetadata> {
        Ok(FileMetadata {
            directory_id: row.get(0)?,
            id: row.get(1)?,
            version: row.get::<_, i64>(2)? as u64,
            content_changed_version: row.get::<_, i64>(3)? as u64,
            file_type: FileType::from_u8(row.get::<_, i64>(4)? as u8),
            current_path: row.get(5)?,
            deleted: row.get::<_, i64>(6)? != 0,
        })
    }
}

const FILE_COLUMNS: &str =
    "directory_id, file_id, version, content_changed_version, file_type, current_path, deleted";

impl MetadataStore for SqliteMetadataStore {
    fn register_directory(&self, directory_id: &str, root_path: &Path) -> MetaResult<()> {
        let mut inner = self.inner.lock();
        inner
            .conn
            .execute(
                "INSERT INTO directories (directory_id, directory_path) VALUES (?1, ?2)
                 ON CONFLICT(directory_id) DO UPDATE SET directory_path = excluded.directory_path",
                params![directory_id, root_path.to_string_lossy()],
            )
            .map_err(db_err)?;
        inner
            .directories
            .insert(directory_id.to_string(), root_path.to_path_buf());
        Ok(())
    }

    fn unregister_directory(&self, directory_id: &str) -> MetaResult<()> {
        let mut inner = self.inner.lock();
        inner
            .conn
            .execute(
                "DELETE FROM directories WHERE directory_id = ?1",
                params![directory_id],
            )
            .map_err(db_err)?;
        inner.directories.remove(directory_id);
        Ok(())
    }

    fn list_directories(&self) -> Vec<String> {
        self.inner.lock().directories.keys().cloned().collect()
    }

    fn directory_root(&self, directory_id: &str) -> Option<PathBuf> {
        self.inner.lock().directories.get(directory_id).cloned()
    }

    fn directory_id_for_path(&self, path: &Path) -> Option<String> {
        let inner = self.inner.lock();
        inner
            .directories
            .iter()
            .find(|(_, root)| !root.as_os_str().is_empty() && path.starts_with(root))
            .map(|(id, _)| id.clone())
    }

    fn list_files(&self, directory_id: &str) -> MetaResult<Vec<FileMetadata>> {
        let inner = self.inner.lock();
        if !inner.directories.contains_key(directory_id) {
            return Err(MetaError::NotFound(format!("directory: {directory_id}")));
        }

        let mut stmt = inner
            .conn
            .prepare(&format!("SELECT {FILE_COLUMNS} FROM files WHERE directory_id = ?1"))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![directory_id], Self::row_to_metadata)
            .map_err(db_err)?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row.map_err(db_err)?);
        }
        Ok(result)
    }

    fn get_by_id(&self, directory_id: &str, file_id: &str) -> MetaResult<FileMetadata> {
        let inner = self.inner.lock();
        inner
            .conn
            .query_row(
                &format!(
                    "SELECT {FILE_COLUMNS} FROM files WHERE directory_id = ?1 AND file_id = ?2"
                ),
                params![directory_id, file_id],
                Self::row_to_metadata,
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| MetaError::NotFound(format!("file: {file_id}")))
    }

    fn get_by_path(&self, directory_id: &str, rel_path: &str) -> MetaResult<FileMetadata> {
        let inner = self.inner.lock();
        inner
            .conn
            .query_row(
                &format!(
                    "SELECT {FILE_COLUMNS} FROM files
                     WHERE directory_id = ?1 AND current_path = ?2 AND deleted = 0"
                ),
                params![directory_id, rel_path],
                Self::row_to_metadata,
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| MetaError::NotFound(format!("file at path: {rel_path}")))
    }

    fn upsert(&self, metadata: &FileMetadata) -> MetaResult<()> {
        validate_record(metadata)?;

        let mut inner = self.inner.lock();
        if !inner.directories.contains_key(&metadata.directory_id) {
            return Err(MetaError::NotFound(format!(
                "directory: {}",
                metadata.directory_id
            )));
        }

        let tx = inner.conn.transaction().map_err(db_err)?;
        tx.execute(
            "INSERT INTO files (directory_id, file_id, version, content_changed_version,
                                file_type, current_path, deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(directory_id, file_id) DO UPDATE SET
                 version = excluded.version,
                 content_changed_version = excluded.content_changed_version,
                 file_type = excluded.file_type,
                 current_path = excluded.current_path,
                 deleted = excluded.deleted",
            params![
                metadata.directory_id,
                metadata.id,
                metadata.version as i64,
                metadata.content_changed_version as i64,
                metadata.file_type as i64,
                metadata.current_path,
                metadata.deleted as i64,
            ],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)
    }

    fn remove(&self, directory_id: &str, file_id: &str) -> MetaResult<()> {
        let inner = self.inner.lock();
        let changes = inner
            .conn
            .execute(
                "DELETE FROM files WHERE directory_id = ?1 AND file_id = ?2",
                params![directory_id, file_id],
            )
            .map_err(db_err)?;

        if changes == 0 {
            return Err(MetaError::NotFound(format!("file: {file_id}")));
        }
        Ok(())
    }
}
