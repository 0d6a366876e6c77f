use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;

use super::error::SyncError;
use super::local_fs::LocalFs;
use super::paths;
use super::reconciler::Reconciler;
use super::remote::{RemoteChange, RemoteClient, RemoteDescriptor, RemoteError};
use super::store::{ChangeKind, ItemKind, PairStore};

const SEEN_LIMIT: usize = 10_000;

/// Differences between one local folder and its remote counterpart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderCheck {
    /// Local names with no remote document.
    pub missing_remote: Vec<String>,
    /// Remote names with no local object.
    pub missing_local: Vec<String>,
    /// Present on both sides with different content.
    pub mismatched: Vec<String>,
}

impl FolderCheck {
    pub fn is_consistent(&self) -> bool {
        self.missing_remote.is_empty() && self.missing_local.is_empty() && self.mismatched.is_empty()
    }
}

/// Polls the remote change feed and feeds new changes to the reconciler.
///
/// A store without a checkpoint gets a full walk of the remote tree; the
/// checkpoint only advances after a batch was applied.
pub struct RemoteDetector {
    store: Arc<PairStore>,
    remote: Arc<dyn RemoteClient>,
    reconciler: Arc<Reconciler>,
    root_id: String,
    seen: Mutex<HashSet<(String, String)>>,
    started: AtomicU64,
    generation: watch::Sender<u64>,
}

impl RemoteDetector {
    pub fn new(
        store: Arc<PairStore>,
        remote: Arc<dyn RemoteClient>,
        reconciler: Arc<Reconciler>,
        root_id: impl Into<String>,
    ) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            store,
            remote,
            reconciler,
            root_id: root_id.into(),
            seen: Mutex::new(HashSet::new()),
            started: AtomicU64::new(0),
            generation,
        }
    }

    /// Carries the sequence number of the latest poll that was applied.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Number of polls started so far; a poll numbered above this value
    /// started later.
    pub fn polls_started(&self) -> u64 {
        self.started.load(Ordering::SeqCst)
    }

    /// Returns the number of changes handed to the reconciler.
    pub async fn poll(&self) -> Result<usize, SyncError> {
        let seq = self.started.fetch_add(1, Ordering::SeqCst) + 1;
        let (changes, next) = match self.store.checkpoint().await? {
            Some(checkpoint) => {
                let batch = self.remote.poll_changes(Some(&checkpoint)).await?;
                (batch.changes, batch.checkpoint)
            }
            None => {
                // Take the head first so nothing changed during the walk is lost.
                let head = self.remote.poll_changes(None).await?.checkpoint;
                tracing::info!(root = %self.root_id, "no checkpoint, walking remote tree");
                (self.walk().await?, head)
            }
        };

        let fresh = self.unseen(changes).await?;
        let applied = fresh.len();
        if applied > 0 {
            tracing::debug!(changes = applied, "applying remote changes");
        }
        self.reconciler.apply_remote_batch(fresh).await?;
        self.store.set_checkpoint(&next).await?;
        self.generation.send_modify(|g| *g = (*g).max(seq));
        Ok(applied)
    }

    async fn walk(&self) -> Result<Vec<RemoteChange>, SyncError> {
        let mut changes = Vec::new();
        let mut folders = VecDeque::from([self.root_id.clone()]);
        while let Some(folder) = folders.pop_front() {
            let children = match self.remote.get_children(&folder).await {
                Ok(children) => children,
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err.into()),
            };
            for child in children {
                if child.kind == ItemKind::Folder {
                    folders.push_back(child.remote_id.clone());
                }
                changes.push(RemoteChange {
                    remote_id: child.remote_id.clone(),
                    kind: ChangeKind::Created,
                    version: child.version.clone(),
                    descriptor: Some(child),
                });
            }
        }
        Ok(changes)
    }

    /// Drops changes already reflected in the store, including the echoes of
    /// the engine's own uploads.
    async fn unseen(&self, changes: Vec<RemoteChange>) -> Result<Vec<RemoteChange>, SyncError> {
        let mut fresh = Vec::with_capacity(changes.len());
        for change in changes {
            let key = (change.remote_id.clone(), change.version.clone());
            if change.kind != ChangeKind::Deleted {
                if self.seen.lock().contains(&key) {
                    continue;
                }
                if let Some(record) = self.store.find_by_remote_id(&change.remote_id).await?
                    && record.remote_version.as_deref() == Some(change.version.as_str())
                    && change.descriptor.as_ref().is_none_or(|d| {
                        d.same_placement(
                            record.remote_parent_id.as_deref(),
                            record.remote_name.as_deref().unwrap_or_default(),
                        )
                    })
                {
                    continue;
                }
            }
            let mut seen = self.seen.lock();
            if seen.len() >= SEEN_LIMIT {
                seen.clear();
            }
            seen.insert(key);
            fresh.push(change);
        }
        Ok(fresh)
    }

    /// Compares the direct children of a local folder with the remote folder
    /// bound to it.
    pub async fn verify_folder(
        &self,
        fs: &dyn LocalFs,
        path: &str,
    ) -> Result<FolderCheck, SyncError> {
        let record = self
            .store
            .find_by_local_path(path)
            .await?
            .ok_or_else(|| SyncError::Deferred(format!("{path} is not tracked")))?;
        let Some(remote_id) = record.remote_id.as_deref() else {
            return Err(SyncError::Deferred(format!("{path} has no remote counterpart yet")));
        };

        let rules = self.reconciler.rules();
        let local: Vec<_> = fs
            .list(path)
            .await?
            .into_iter()
            .filter(|entry| !rules.is_ignored_path(&entry.path))
            .collect();
        let remote: Vec<RemoteDescriptor> = match self.remote.get_children(remote_id).await {
            Ok(children) => children,
            Err(RemoteError::NotFound(_)) => Vec::new(),
            Err(err) => return Err(err.into()),
        };

        let mut check = FolderCheck::default();
        for entry in &local {
            let name = paths::file_name(&entry.path);
            match remote.iter().find(|d| d.name == name) {
                None => check.missing_remote.push(name.to_string()),
                Some(doc) if doc.kind != entry.kind => check.mismatched.push(name.to_string()),
                Some(doc) if entry.kind == ItemKind::File
                    && doc.fingerprint.is_some()
                    && !doc.same_content(entry.fingerprint.as_deref()) =>
                {
                    check.mismatched.push(name.to_string())
                }
                Some(_) => {}
            }
        }
        for doc in &remote {
            if rules.is_ignored_name(&doc.name) {
                continue;
            }
            if !local.iter().any(|e| paths::file_name(&e.path) == doc.name) {
                check.missing_local.push(doc.name.clone());
            }
        }
        check.missing_remote.sort();
        check.missing_local.sort();
        check.mismatched.sort();
        Ok(check)
    }
}
