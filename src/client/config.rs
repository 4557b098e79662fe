//! Client configuration.
//!
//! A JSON file, by default at `~/.synxpo/config.json`. Unknown keys are
//! rejected; missing keys fall back to defaults so a minimal config with
//! just `server_address` and `directories` works.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// One synchronized directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DirectoryEntry {
    /// Server-minted id; absent until the first sync creates it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory_id: Option<String>,
    pub local_path: PathBuf,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    pub server_address: String,
    pub storage_path: PathBuf,
    pub backup_path: PathBuf,
    pub temp_path: PathBuf,
    pub watch_debounce_ms: u64,
    pub max_file_size: u64,
    pub chunk_size: usize,
    pub max_retry_attempts: u32,
    pub retry_delay_s: u64,
    pub log_path: PathBuf,
    pub log_level: String,
    pub directories: Vec<DirectoryEntry>,
}

fn default_true() -> bool {
    true
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1:50051".to_string(),
            storage_path: PathBuf::from("~/.synxpo/storage"),
            backup_path: PathBuf::from("~/.synxpo/backups"),
            temp_path: PathBuf::from("~/.synxpo/temp"),
            watch_debounce_ms: 100,
            max_file_size: 100 * 1024 * 1024,
            chunk_size: 64 * 1024,
            max_retry_attempts: 3,
            retry_delay_s: 5,
            log_path: PathBuf::from("~/.synxpo/client.log"),
            log_level: "info".to_string(),
            directories: Vec::new(),
        }
    }
}

impl ClientConfig {
    pub fn default_path() -> PathBuf {
        expand_tilde(Path::new("~/.synxpo/config.json"))
    }

    /// Load from file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw)
            .with_context(|| format!("failed to write config {}", path.display()))
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.watch_debounce_ms)
    }

    pub fn add_directory(&mut self, entry: DirectoryEntry) {
        self.directories.push(entry);
    }

    /// Replace the entry with the same local path.
    pub fn update_directory(&mut self, entry: &DirectoryEntry) {
        if let Some(existing) = self
            .directories
            .iter_mut()
            .find(|d| d.local_path == entry.local_path)
        {
            *existing = entry.clone();
        }
    }

    /// Set a scalar field by key, for `config set <key> <value>`.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "server_address" => self.server_address = value.to_string(),
            "storage_path" => self.storage_path = PathBuf::from(value),
            "backup_path" => self.backup_path = PathBuf::from(value),
            "temp_path" => self.temp_path = PathBuf::from(value),
            "watch_debounce_ms" => self.watch_debounce_ms = value.parse()?,
            "max_file_size" => self.max_file_size = value.parse()?,
            "chunk_size" => self.chunk_size = value.parse()?,
            "max_retry_attempts" => self.max_retry_attempts = value.parse()?,
            "retry_delay_s" => self.retry_delay_s = value.parse()?,
            "log_path" => self.log_path = PathBuf::from(value),
            "log_level" => self.log_level = value.to_string(),
            other => bail!("unknown config key: {other}"),
        }
        Ok(())
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
    } else if let Some(rest) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            home.join(rest)
        } else {
            path.to_path_buf()
        }
    } else {
        path.to_path_buf()
    }
}
