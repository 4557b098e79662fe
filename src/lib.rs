//! SynXpo - directory synchronization over a long-lived bidirectional stream.
//!
//! One server holds the authoritative replica of each registered directory;
//! any number of clients subscribe, publish local changes through a
//! version/lock arbiter, and consume peers' committed changes as directory
//! snapshots.
//!
//! Crate layout:
//! - [`protocol`] - wire messages (length-delimited binary frames)
//! - [`meta`] - file metadata storage (in-memory and sqlite)
//! - [`server`] - storage engine, subscriptions, stream sessions
//! - [`client`] - config, stream connection, watcher intake, sync engine

pub mod client;
pub mod error;
pub mod meta;
pub mod protocol;
pub mod server;

pub use error::{Result, SyncError};
