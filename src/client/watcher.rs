//! Filesystem watcher intake.
//!
//! The sync engine consumes the raw, undebounced event stream defined
//! here; debouncing and self-echo suppression are the engine's job. The
//! `notify` adapter translates platform events into this contract, pairing
//! rename halves within a ~1 s window (an unpaired half degrades to a
//! Deleted or Created event).

use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};

use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

use crate::error::{Result, SyncError};

pub const RENAME_PAIR_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    Created,
    Modified,
    Deleted,
    Renamed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub kind: FileEventKind,
    pub entry: EntryKind,
    pub path: PathBuf,
    pub old_path: Option<PathBuf>,
    pub timestamp: SystemTime,
}

impl FileEvent {
    fn new(kind: FileEventKind, entry: EntryKind, path: PathBuf) -> Self {
        Self {
            kind,
            entry,
            path,
            old_path: None,
            timestamp: SystemTime::now(),
        }
    }
}

/// Translator state: an unpaired rename-from half waiting for its
/// rename-to.
#[derive(Default)]
struct Translator {
    pending_rename: Option<(PathBuf, Instant)>,
}

impl Translator {
    fn translate(&mut self, event: &notify::Event) -> Vec<FileEvent> {
        let mut out = Vec::new();

        // An unpaired rename-from past the window becomes a deletion
        if let Some((old, at)) = &self.pending_rename {
            if at.elapsed() > RENAME_PAIR_WINDOW {
                out.push(FileEvent::new(
                    FileEventKind::Deleted,
                    EntryKind::Unknown,
                    old.clone(),
                ));
                self.pending_rename = None;
            }
        }

        match &event.kind {
            EventKind::Create(kind) => {
                let entry = match kind {
                    CreateKind::File => EntryKind::File,
                    CreateKind::Folder => EntryKind::Directory,
                    _ => EntryKind::Unknown,
                };
                for path in &event.paths {
                    out.push(FileEvent::new(FileEventKind::Created, entry, path.clone()));
                }
            }
            EventKind::Modify(ModifyKind::Name(mode)) => match mode {
                RenameMode::From => {
                    if let Some(path) = event.paths.first() {
                        self.pending_rename = Some((path.clone(), Instant::now()));
                    }
                }
                RenameMode::To => {
                    if let Some(path) = event.paths.first() {
                        let mut ev =
                            FileEvent::new(FileEventKind::Renamed, EntryKind::Unknown, path.clone());
                        match self.pending_rename.take() {
                            Some((old, _)) => ev.old_path = Some(old),
                            // No from-half: treat as a plain creation
                            None => ev.kind = FileEventKind::Created,
                        }
                        out.push(ev);
                    }
                }
                RenameMode::Both => {
                    if event.paths.len() >= 2 {
                        let mut ev = FileEvent::new(
                            FileEventKind::Renamed,
                            EntryKind::Unknown,
                            event.paths[1].clone(),
                        );
                        ev.old_path = Some(event.paths[0].clone());
                        out.push(ev);
                    }
                }
                _ => {
                    for path in &event.paths {
                        out.push(FileEvent::new(
                            FileEventKind::Modified,
                            EntryKind::Unknown,
                            path.clone(),
                        ));
                    }
                }
            },
            EventKind::Modify(_) => {
                for path in &event.paths {
                    out.push(FileEvent::new(
                        FileEventKind::Modified,
                        EntryKind::Unknown,
                        path.clone(),
                    ));
                }
            }
            EventKind::Remove(kind) => {
                let entry = match kind {
                    RemoveKind::File => EntryKind::File,
                    RemoveKind::Folder => EntryKind::Directory,
                    _ => EntryKind::Unknown,
                };
                for path in &event.paths {
                    out.push(FileEvent::new(FileEventKind::Deleted, entry, path.clone()));
                }
            }
            _ => {}
        }

        out
    }
}

/// Recursive directory watcher feeding a channel of contract events.
pub struct DirWatcher {
    watcher: RecommendedWatcher,
}

impl DirWatcher {
    pub fn new(tx: UnboundedSender<FileEvent>) -> Result<Self> {
        let mut translator = Translator::default();

        let watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            match result {
                Ok(event) => {
                    for translated in translator.translate(&event) {
                        if tx.send(translated).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => warn!("watcher error: {e}"),
            }
        })
        .map_err(|e| SyncError::internal(format!("failed to create watcher: {e}")))?;

        Ok(Self { watcher })
    }

    pub fn watch(&mut self, path: &std::path::Path) -> Result<()> {
        self.watcher
            .watch(path, RecursiveMode::Recursive)
            .map_err(|e| SyncError::internal(format!("failed to watch {}: {e}", path.display())))
    }

    pub fn unwatch(&mut self, path: &std::path::Path) -> Result<()> {
        self.watcher
            .unwatch(path)
            .map_err(|e| SyncError::internal(format!("failed to unwatch {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::Event;

    fn ev(kind: EventKind, paths: Vec<&str>) -> Event {
        Event {
            kind,
            paths: paths.into_iter().map(PathBuf::from).collect(),
            attrs: Default::default(),
        }
    }

    #[test]
    fn test_create_translates() {
        let mut t = Translator::default();
        let out = t.translate(&ev(EventKind::Create(CreateKind::File), vec!["/d/a.txt"]));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, FileEventKind::Created);
        assert_eq!(out[0].entry, EntryKind::File);
        assert_eq!(out[0].path, PathBuf::from("/d/a.txt"));
    }

    #[test]
    fn test_modify_translates() {
        let mut t = Translator::default();
        let out = t.translate(&ev(
            EventKind::Modify(ModifyKind::Data(notify::event::DataChange::Content)),
            vec!["/d/a.txt"],
        ));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, FileEventKind::Modified);
    }

    #[test]
    fn test_remove_translates() {
        let mut t = Translator::default();
        let out = t.translate(&ev(EventKind::Remove(RemoveKind::File), vec!["/d/a.txt"]));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, FileEventKind::Deleted);
    }

    #[test]
    fn test_rename_pairing() {
        let mut t = Translator::default();

        let from = t.translate(&ev(
            EventKind::Modify(ModifyKind::Name(RenameMode::From)),
            vec!["/d/old.txt"],
        ));
        assert!(from.is_empty());

        let to = t.translate(&ev(
            EventKind::Modify(ModifyKind::Name(RenameMode::To)),
            vec!["/d/new.txt"],
        ));
        assert_eq!(to.len(), 1);
        assert_eq!(to[0].kind, FileEventKind::Renamed);
        assert_eq!(to[0].path, PathBuf::from("/d/new.txt"));
        assert_eq!(to[0].old_path, Some(PathBuf::from("/d/old.txt")));
    }

    #[test]
    fn test_rename_both_in_one_event() {
        let mut t = Translator::default();
        let out = t.translate(&ev(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            vec!["/d/old.txt", "/d/new.txt"],
        ));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, FileEventKind::Renamed);
        assert_eq!(out[0].old_path, Some(PathBuf::from("/d/old.txt")));
    }

    #[test]
    fn test_unpaired_rename_to_becomes_created() {
        let mut t = Translator::default();
        let out = t.translate(&ev(
            EventKind::Modify(ModifyKind::Name(RenameMode::To)),
            vec!["/d/new.txt"],
        ));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, FileEventKind::Created);
        assert!(out[0].old_path.is_none());
    }

    #[test]
    fn test_stale_rename_from_becomes_deleted() {
        let mut t = Translator::default();
        t.translate(&ev(
            EventKind::Modify(ModifyKind::Name(RenameMode::From)),
            vec!["/d/old.txt"],
        ));
        // Force the pending half past the window
        t.pending_rename = Some((
            PathBuf::from("/d/old.txt"),
            Instant::now() - RENAME_PAIR_WINDOW - Duration::from_millis(10),
        ));

        let out = t.translate(&ev(EventKind::Create(CreateKind::File), vec!["/d/other.txt"]));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].kind, FileEventKind::Deleted);
        assert_eq!(out[0].path, PathBuf::from("/d/old.txt"));
        assert_eq!(out[1].kind, FileEventKind::Created);
    }
}
