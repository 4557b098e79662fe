//! Client side: configuration, the stream connection, watcher intake, and
//! the sync engine.

pub mod config;
pub mod connection;
pub mod engine;
pub mod watcher;

pub use config::{expand_tilde, ClientConfig, DirectoryEntry};
pub use connection::Connection;
pub use engine::SyncEngine;
pub use watcher::{DirWatcher, EntryKind, FileEvent, FileEventKind};
