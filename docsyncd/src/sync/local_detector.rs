use std::sync::Arc;

use super::filters::IgnoreRules;
use super::local_fs::{LocalEntry, LocalFs, LocalFsError, RawLocalEvent};

/// Local change, enriched with a stat of the object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEvent {
    Created(LocalEntry),
    Modified(LocalEntry),
    Deleted(String),
    Moved { from: String, entry: LocalEntry },
}

impl LocalEvent {
    pub fn path(&self) -> &str {
        match self {
            LocalEvent::Created(entry)
            | LocalEvent::Modified(entry)
            | LocalEvent::Moved { entry, .. } => &entry.path,
            LocalEvent::Deleted(path) => path,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detected {
    Event(LocalEvent),
    Rescan(String),
    Nothing,
}

/// Turns raw watcher notifications into [`LocalEvent`]s.
pub struct LocalDetector {
    fs: Arc<dyn LocalFs>,
    rules: IgnoreRules,
}

impl LocalDetector {
    pub fn new(fs: Arc<dyn LocalFs>, rules: IgnoreRules) -> Self {
        Self { fs, rules }
    }

    pub fn rules(&self) -> &IgnoreRules {
        &self.rules
    }

    pub async fn detect(&self, raw: RawLocalEvent) -> Result<Detected, LocalFsError> {
        match raw {
            RawLocalEvent::Rescan(path) => Ok(Detected::Rescan(path)),
            RawLocalEvent::Created(path) | RawLocalEvent::Modified(path)
                if self.rules.is_ignored_path(&path) =>
            {
                Ok(Detected::Nothing)
            }
            RawLocalEvent::Created(path) => self.present(path, true).await,
            RawLocalEvent::Modified(path) => self.present(path, false).await,
            RawLocalEvent::Deleted(path) => {
                if self.rules.is_ignored_path(&path) {
                    return Ok(Detected::Nothing);
                }
                Ok(Detected::Event(LocalEvent::Deleted(path)))
            }
            RawLocalEvent::Moved { from, to } => {
                match (
                    self.rules.is_ignored_path(&from),
                    self.rules.is_ignored_path(&to),
                ) {
                    (true, true) => Ok(Detected::Nothing),
                    (true, false) => self.present(to, true).await,
                    (false, true) => Ok(Detected::Event(LocalEvent::Deleted(from))),
                    (false, false) => match self.fs.stat(&to).await? {
                        Some(entry) => Ok(Detected::Event(LocalEvent::Moved { from, entry })),
                        None => Ok(Detected::Event(LocalEvent::Deleted(from))),
                    },
                }
            }
        }
    }

    async fn present(&self, path: String, created: bool) -> Result<Detected, LocalFsError> {
        let event = match self.fs.stat(&path).await? {
            Some(entry) if created => LocalEvent::Created(entry),
            Some(entry) => LocalEvent::Modified(entry),
            None => LocalEvent::Deleted(path),
        };
        Ok(Detected::Event(event))
    }
}
