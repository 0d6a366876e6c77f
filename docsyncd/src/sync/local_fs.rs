use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use super::paths::PathError;
use super::store::ItemKind;

/// Extended attribute carrying the identity tag of a synchronized object.
pub const TAG_ATTRIBUTE: &str = "user.docsync.tag";

#[derive(Debug, Error)]
pub enum LocalFsError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("local object not found: {0}")]
    NotFound(String),
    #[error("local object already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid sync path: {0}")]
    Path(#[from] PathError),
    #[error("filesystem watcher failed: {0}")]
    Watch(#[from] notify::Error),
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl LocalFsError {
    pub fn io(path: &str, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::NotFound => LocalFsError::NotFound(path.to_string()),
            std::io::ErrorKind::AlreadyExists => LocalFsError::AlreadyExists(path.to_string()),
            _ => LocalFsError::Io {
                path: path.to_string(),
                source,
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, LocalFsError::NotFound(_))
    }
}

/// Snapshot of one local object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub path: String,
    pub kind: ItemKind,
    /// Content digest; always `None` for folders.
    pub fingerprint: Option<String>,
    pub mtime: Option<i64>,
    pub size: u64,
    pub tag: Option<String>,
    pub file_id: Option<String>,
}

impl LocalEntry {
    pub fn is_folder(&self) -> bool {
        self.kind == ItemKind::Folder
    }
}

/// Unprocessed notification from the watcher. Paths are sync-relative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawLocalEvent {
    Created(String),
    Modified(String),
    Deleted(String),
    Moved { from: String, to: String },
    /// The watcher lost track of changes below this path.
    Rescan(String),
}

/// Live subscription to local changes. `backlog` counts events that were
/// emitted but not applied yet; dropping the watch stops notifications.
pub struct LocalWatch {
    pub events: mpsc::UnboundedReceiver<RawLocalEvent>,
    pub backlog: Arc<AtomicUsize>,
    pub guard: Box<dyn Send>,
}

/// Sending half used by watch implementations.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<RawLocalEvent>,
    backlog: Arc<AtomicUsize>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RawLocalEvent>, Arc<AtomicUsize>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let backlog = Arc::new(AtomicUsize::new(0));
        (
            Self {
                tx,
                backlog: backlog.clone(),
            },
            rx,
            backlog,
        )
    }

    pub fn send(&self, event: RawLocalEvent) {
        self.backlog.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(event).is_err() {
            self.backlog.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
pub trait LocalFs: Send + Sync {
    /// Direct children of a folder; ignore rules are applied by callers.
    async fn list(&self, path: &str) -> Result<Vec<LocalEntry>, LocalFsError>;
    async fn stat(&self, path: &str) -> Result<Option<LocalEntry>, LocalFsError>;
    async fn read_tag(&self, path: &str) -> Result<Option<String>, LocalFsError>;
    async fn write_tag(&self, path: &str, tag: &str) -> Result<(), LocalFsError>;
    async fn create_folder(&self, path: &str) -> Result<LocalEntry, LocalFsError>;
    /// Replaces the content of `path` atomically; readers never observe a
    /// partially written file.
    async fn write_file(
        &self,
        path: &str,
        content: Bytes,
        tag: Option<&str>,
    ) -> Result<LocalEntry, LocalFsError>;
    async fn read_file(&self, path: &str) -> Result<Bytes, LocalFsError>;
    async fn rename(&self, from: &str, to: &str) -> Result<LocalEntry, LocalFsError>;
    async fn delete(&self, path: &str) -> Result<(), LocalFsError>;
    async fn watch(&self) -> Result<LocalWatch, LocalFsError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_counts_backlog() {
        let (sink, mut rx, backlog) = EventSink::channel();
        sink.send(RawLocalEvent::Created("/a".into()));
        sink.send(RawLocalEvent::Deleted("/b".into()));
        assert_eq!(backlog.load(Ordering::SeqCst), 2);
        assert_eq!(rx.try_recv().ok(), Some(RawLocalEvent::Created("/a".into())));
    }

    #[test]
    fn sink_does_not_count_after_receiver_dropped() {
        let (sink, rx, backlog) = EventSink::channel();
        drop(rx);
        sink.send(RawLocalEvent::Created("/a".into()));
        assert_eq!(backlog.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn io_errors_map_not_found() {
        let err = LocalFsError::io(
            "/a",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.is_not_found());
    }
}
