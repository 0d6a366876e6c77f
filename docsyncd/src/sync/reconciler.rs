use std::{collections::VecDeque, sync::Arc};

use tokio::sync::{Mutex, MutexGuard};

use super::error::SyncError;
use super::filters::IgnoreRules;
use super::fingerprint::same_content;
use super::local_detector::LocalEvent;
use super::local_fs::{LocalEntry, LocalFs, LocalFsError};
use super::paths;
use super::remote::{RemoteChange, RemoteDescriptor};
use super::store::{ChangeKind, ItemKind, PairRecord, PairStore, SyncStatus};

pub fn new_tag() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Turns local and remote change events into store transitions.
///
/// Every local mutation (by the reconciler, the processor or conflict
/// resolution) happens under [`Reconciler::lock`], so events caused by the
/// engine itself are evaluated against an up-to-date store.
pub struct Reconciler {
    store: Arc<PairStore>,
    fs: Arc<dyn LocalFs>,
    rules: IgnoreRules,
    gate: Mutex<()>,
}

impl Reconciler {
    pub fn new(store: Arc<PairStore>, fs: Arc<dyn LocalFs>, rules: IgnoreRules) -> Self {
        Self {
            store,
            fs,
            rules,
            gate: Mutex::new(()),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.gate.lock().await
    }

    pub fn rules(&self) -> &IgnoreRules {
        &self.rules
    }

    pub async fn apply_local_batch(&self, events: Vec<LocalEvent>) -> Result<(), SyncError> {
        let _gate = self.gate.lock().await;
        for event in events {
            let path = event.path().to_string();
            match self.apply_local(event).await {
                Ok(()) => {}
                Err(SyncError::Store(err)) => return Err(SyncError::Store(err)),
                Err(err) => tracing::warn!(path, error = %err, "local change not applied"),
            }
        }
        Ok(())
    }

    /// Store failures abort the batch so the caller does not advance past it.
    pub async fn apply_remote_batch(&self, changes: Vec<RemoteChange>) -> Result<(), SyncError> {
        let _gate = self.gate.lock().await;
        for change in changes {
            self.apply_remote(change).await?;
        }
        Ok(())
    }

    async fn apply_local(&self, event: LocalEvent) -> Result<(), SyncError> {
        match event {
            LocalEvent::Created(entry) | LocalEvent::Modified(entry) => self.apply_tree(entry).await,
            LocalEvent::Deleted(path) => self.apply_deleted(&path).await,
            LocalEvent::Moved { from, entry } => self.apply_moved(&from, entry).await,
        }
    }

    async fn apply_tree(&self, entry: LocalEntry) -> Result<(), SyncError> {
        let mut queue = VecDeque::from([entry]);
        while let Some(entry) = queue.pop_front() {
            let path = entry.path.clone();
            if !self.apply_present(entry).await? {
                continue;
            }
            match self.fs.list(&path).await {
                Ok(children) => queue.extend(
                    children
                        .into_iter()
                        .filter(|child| !self.rules.is_ignored_path(&child.path)),
                ),
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Returns true when the children of `entry` still need to be visited.
    async fn apply_present(&self, entry: LocalEntry) -> Result<bool, SyncError> {
        if entry.path == paths::ROOT || self.rules.is_ignored_path(&entry.path) {
            return Ok(false);
        }
        let Some(parent) = self.ensure_parent(&entry.path).await? else {
            return Ok(false);
        };
        self.identify(entry, &parent).await
    }

    async fn identify(&self, entry: LocalEntry, parent: &PairRecord) -> Result<bool, SyncError> {
        if let Some(tag) = entry.tag.clone()
            && let Some(record) = self.store.find_by_local_tag(&tag).await?
        {
            if record.local_path.as_deref() == Some(entry.path.as_str()) {
                self.update_content(&record, &entry).await?;
                return Ok(false);
            }
            let original_alive = match record.local_path.as_deref() {
                Some(old) => self.fs.read_tag(old).await?.as_deref() == Some(tag.as_str()),
                None => false,
            };
            if !original_alive && record.kind == entry.kind {
                return self.move_to(record, entry, parent).await;
            }
            if let Some(current) = self.fs.read_tag(&entry.path).await?
                && current != tag
                && let Some(known) = self.store.find_by_local_tag(&current).await?
                && known.local_path.as_deref() == Some(entry.path.as_str())
            {
                // Tagged after the snapshot was taken, earlier in this batch.
                let mut entry = entry;
                entry.tag = Some(current);
                self.update_content(&known, &entry).await?;
                return Ok(false);
            }
            tracing::debug!(path = %entry.path, original = ?record.local_path, "copy detected");
            return self.new_identity(entry, parent).await;
        }

        if let Some(record) = self.store.find_by_local_path(&entry.path).await? {
            if record.kind == entry.kind {
                let tag = record.local_tag.clone().unwrap_or_else(new_tag);
                if !self.tag_object(&entry.path, &tag).await? {
                    return Ok(false);
                }
                let mut entry = entry;
                entry.tag = Some(tag);
                self.update_content(&record, &entry).await?;
                return Ok(false);
            }
            self.store.mark_locally_deleted(record.id).await?;
        }
        self.new_identity(entry, parent).await
    }

    /// Returns false when the object vanished. Tagging failures are logged
    /// only: untagged objects are still matched by path.
    async fn tag_object(&self, path: &str, tag: &str) -> Result<bool, LocalFsError> {
        match self.fs.write_tag(path, tag).await {
            Ok(()) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => {
                tracing::warn!(path, error = %err, "cannot tag local object");
                Ok(true)
            }
        }
    }

    async fn new_identity(&self, entry: LocalEntry, parent: &PairRecord) -> Result<bool, SyncError> {
        let tag = new_tag();
        if !self.tag_object(&entry.path, &tag).await? {
            return Ok(false);
        }
        let mut record = PairRecord::draft(paths::file_name(&entry.path), entry.kind);
        record.local_path = Some(entry.path.clone());
        record.parent_id = Some(parent.id);
        record.depth = parent.depth + 1;
        record.apply_local(&entry);
        record.local_tag = Some(tag);
        record.local_change = Some(ChangeKind::Created);
        let inserted = self.store.insert(&record).await?;
        tracing::debug!(path = %entry.path, id = inserted.id, "new local object");
        Ok(entry.is_folder())
    }

    async fn move_to(
        &self,
        record: PairRecord,
        entry: LocalEntry,
        parent: &PairRecord,
    ) -> Result<bool, SyncError> {
        let revived = record.local_path.is_none();
        let Some(moved) = self
            .store
            .move_record(record.id, &entry.path, parent.id)
            .await?
        else {
            return Ok(false);
        };
        tracing::debug!(from = ?record.local_path, to = %entry.path, id = moved.id, "local move");
        let placement_matches = moved.remote_id.is_some()
            && moved.remote_parent_id == parent.remote_id
            && moved.remote_name.as_deref() == Some(moved.name.as_str());
        self.store
            .modify(moved.id, |r| {
                r.apply_local(&entry);
                if revived {
                    r.clear_sticky();
                }
                if r.local_change == Some(ChangeKind::Created) {
                    return;
                }
                if r.remote_id.is_none() {
                    r.local_change = Some(ChangeKind::Created);
                } else if placement_matches {
                    if matches!(
                        r.local_change,
                        Some(ChangeKind::Moved) | Some(ChangeKind::Deleted)
                    ) {
                        r.local_change = None;
                    }
                    if r.remote_change == Some(ChangeKind::Moved) {
                        r.remote_change = None;
                    }
                } else {
                    r.local_change = Some(ChangeKind::Moved);
                }
            })
            .await?;
        Ok(revived && entry.is_folder())
    }

    async fn update_content(&self, record: &PairRecord, entry: &LocalEntry) -> Result<(), SyncError> {
        let changed = record.local_fingerprint != entry.fingerprint;
        self.store
            .modify(record.id, |r| {
                r.apply_local(entry);
                if !r.is_file() {
                    return;
                }
                if same_content(
                    r.local_fingerprint.as_deref(),
                    r.synced_fingerprint.as_deref(),
                ) {
                    if r.local_change == Some(ChangeKind::Modified) {
                        r.local_change = None;
                    }
                } else if r.local_change.is_none() {
                    r.local_change = Some(ChangeKind::Modified);
                }
                if changed && r.status == SyncStatus::Error {
                    r.clear_sticky();
                }
            })
            .await?;
        Ok(())
    }

    async fn apply_deleted(&self, path: &str) -> Result<(), SyncError> {
        if self.rules.is_ignored_path(path) {
            return Ok(());
        }
        let Some(record) = self.store.find_by_local_path(path).await? else {
            return Ok(());
        };
        if let Some(entry) = self.fs.stat(path).await? {
            // Replaced in place (atomic save); the object is still there.
            return self.apply_tree(entry).await;
        }
        tracing::debug!(path, id = record.id, "local delete");
        self.store.mark_locally_deleted(record.id).await?;
        Ok(())
    }

    async fn apply_moved(&self, from: &str, mut entry: LocalEntry) -> Result<(), SyncError> {
        if let Some(record) = self.store.find_by_local_path(from).await?
            && record.kind == entry.kind
            && !self.rules.is_ignored_path(&entry.path)
        {
            let same_identity = match (&entry.tag, &record.local_tag) {
                (Some(seen), Some(known)) => seen == known,
                (None, _) => true,
                (Some(_), None) => false,
            };
            if same_identity {
                let Some(parent) = self.ensure_parent(&entry.path).await? else {
                    return Ok(());
                };
                if entry.tag.is_none()
                    && let Some(tag) = record.local_tag.clone()
                    && self.tag_object(&entry.path, &tag).await?
                {
                    entry.tag = Some(tag);
                }
                self.move_to(record, entry, &parent).await?;
                return Ok(());
            }
        }

        self.apply_tree(entry).await?;
        if let Some(stale) = self.store.find_by_local_path(from).await?
            && self.fs.stat(from).await?.is_none()
        {
            self.store.mark_locally_deleted(stale.id).await?;
        }
        Ok(())
    }

    /// Record of the folder containing `path`, registering ancestors that
    /// exist locally but are not known yet.
    async fn ensure_parent(&self, path: &str) -> Result<Option<PairRecord>, SyncError> {
        let Some(parent_path) = paths::parent_path(path) else {
            return Ok(None);
        };
        if let Some(parent) = self.store.find_by_local_path(parent_path).await? {
            return Ok(Some(parent));
        }

        let mut missing = vec![parent_path.to_string()];
        let mut current = parent_path;
        while let Some(up) = paths::parent_path(current) {
            if self.store.find_by_local_path(up).await?.is_some() {
                break;
            }
            missing.push(up.to_string());
            current = up;
        }
        for ancestor in missing.iter().rev() {
            let Some(entry) = self.fs.stat(ancestor).await? else {
                return Ok(None);
            };
            if !entry.is_folder() {
                return Ok(None);
            }
            let Some(grandparent) = (match paths::parent_path(ancestor) {
                Some(up) => self.store.find_by_local_path(up).await?,
                None => None,
            }) else {
                return Ok(None);
            };
            self.identify(entry, &grandparent).await?;
        }
        Ok(self.store.find_by_local_path(parent_path).await?)
    }

    async fn apply_remote(&self, change: RemoteChange) -> Result<(), SyncError> {
        let existing = self.store.find_by_remote_id(&change.remote_id).await?;
        if existing
            .as_ref()
            .is_some_and(|r| r.local_path.as_deref() == Some(paths::ROOT))
        {
            return Ok(());
        }
        let descriptor = match change.kind {
            ChangeKind::Deleted => None,
            _ => change.descriptor,
        };
        let Some(descriptor) = descriptor else {
            if let Some(record) = existing {
                self.apply_remote_deletion(record).await?;
            }
            return Ok(());
        };

        let parent = match descriptor.parent_id.as_deref() {
            Some(parent_id) => self.store.find_by_remote_id(parent_id).await?,
            None => None,
        };
        let Some(parent) = parent.filter(|p| p.kind == ItemKind::Folder) else {
            // Moved out of the synchronized tree.
            if let Some(record) = existing {
                self.apply_remote_deletion(record).await?;
            }
            return Ok(());
        };
        if self.rules.is_ignored_name(&descriptor.name) {
            return Ok(());
        }

        match existing {
            Some(record) => {
                self.remote_updated(record, descriptor, &parent, change.kind)
                    .await
            }
            None => self.remote_created(descriptor, &parent).await,
        }
    }

    /// The remote document is gone. Locally edited subtrees lose their remote
    /// binding and are uploaded again; the caller holds [`Reconciler::lock`].
    pub async fn apply_remote_deletion(&self, record: PairRecord) -> Result<(), SyncError> {
        if record.local_path.is_none() {
            self.store.remove_subtree(record.id).await?;
            return Ok(());
        }
        let subtree = self.store.list_subtree(record.id).await?;
        if subtree.iter().any(PairRecord::has_local_edits) {
            tracing::info!(
                path = ?record.local_path,
                "remote delete of locally edited subtree, uploading it again"
            );
            for item in &subtree {
                if item.local_path.is_none() {
                    self.store.remove_subtree(item.id).await?;
                    continue;
                }
                self.store
                    .modify(item.id, |r| {
                        r.forget_remote();
                        r.synced_fingerprint = None;
                        r.remote_change = None;
                        r.local_change = Some(ChangeKind::Created);
                        r.clear_sticky();
                    })
                    .await?;
            }
            return Ok(());
        }
        self.store
            .modify(record.id, |r| {
                r.remote_change = Some(ChangeKind::Deleted);
                r.clear_sticky();
            })
            .await?;
        Ok(())
    }

    async fn remote_created(
        &self,
        descriptor: RemoteDescriptor,
        parent: &PairRecord,
    ) -> Result<(), SyncError> {
        if let Some(parent_path) = parent.local_path.as_deref() {
            let target = paths::join(parent_path, &descriptor.name);
            if let Some(holder) = self.store.find_by_local_path(&target).await? {
                let bindable = holder.remote_id.is_none()
                    && holder.kind == descriptor.kind
                    && (holder.kind == ItemKind::Folder
                        || holder.claimed_by.is_some()
                        || descriptor.same_content(holder.local_fingerprint.as_deref()));
                if bindable {
                    tracing::debug!(path = %target, remote_id = %descriptor.remote_id, "binding local object to remote document");
                    self.store
                        .modify(holder.id, |r| {
                            r.apply_remote(&descriptor);
                            if r.is_file() {
                                r.synced_fingerprint = descriptor.fingerprint.clone();
                            }
                        })
                        .await?;
                    return Ok(());
                }
            }
        }

        let name = self.free_name(parent, &descriptor.name).await?;
        let mut record = PairRecord::draft(name, descriptor.kind);
        record.parent_id = Some(parent.id);
        record.depth = parent.depth + 1;
        record.apply_remote(&descriptor);
        record.remote_change = Some(ChangeKind::Created);
        let inserted = self.store.insert(&record).await?;
        tracing::debug!(remote_id = %descriptor.remote_id, name = %inserted.name, "new remote document");
        Ok(())
    }

    async fn remote_updated(
        &self,
        record: PairRecord,
        descriptor: RemoteDescriptor,
        parent: &PairRecord,
        kind: ChangeKind,
    ) -> Result<(), SyncError> {
        let placement_changed = record.remote_parent_id != descriptor.parent_id
            || record.remote_name.as_deref() != Some(descriptor.name.as_str());
        let local_parent_remote = if record.parent_id == Some(parent.id) {
            parent.remote_id.clone()
        } else {
            match record.parent_id {
                Some(id) => self.store.get(id).await?.and_then(|p| p.remote_id),
                None => None,
            }
        };
        let local_matches =
            local_parent_remote == descriptor.parent_id && record.name == descriptor.name;
        let content_changed = descriptor.kind == ItemKind::File
            && match descriptor.fingerprint.as_deref() {
                Some(fingerprint) => {
                    !same_content(Some(fingerprint), record.remote_fingerprint.as_deref())
                }
                None => {
                    kind == ChangeKind::Modified
                        && record.remote_version.as_deref() != Some(descriptor.version.as_str())
                }
            };
        let parent_id = parent.id;
        let parent_depth = parent.depth;

        self.store
            .modify(record.id, |r| {
                r.apply_remote(&descriptor);
                if (placement_changed || content_changed) && r.status == SyncStatus::Error {
                    r.clear_sticky();
                }
                if r.local_path.is_none() {
                    // Not materialized yet: follow the remote placement.
                    r.name = descriptor.name.clone();
                    r.parent_id = Some(parent_id);
                    r.depth = parent_depth + 1;
                } else if local_matches {
                    if r.remote_change == Some(ChangeKind::Moved) {
                        r.remote_change = None;
                    }
                    if r.local_change == Some(ChangeKind::Moved) {
                        r.local_change = None;
                    }
                } else if placement_changed && r.remote_change != Some(ChangeKind::Created) {
                    r.remote_change = Some(ChangeKind::Moved);
                }
                if content_changed
                    && descriptor.fingerprint.is_none()
                    && r.remote_change.is_none()
                {
                    r.remote_change = Some(ChangeKind::Modified);
                }
            })
            .await?;
        Ok(())
    }

    async fn free_name(&self, parent: &PairRecord, name: &str) -> Result<String, SyncError> {
        let taken: Vec<String> = self
            .store
            .list_children(parent.id)
            .await?
            .into_iter()
            .map(|r| r.name)
            .collect();
        let mut candidate = name.to_string();
        let mut n = 0;
        loop {
            let on_disk = match parent.local_path.as_deref() {
                Some(parent_path) => self
                    .fs
                    .stat(&paths::join(parent_path, &candidate))
                    .await?
                    .is_some(),
                None => false,
            };
            if !on_disk && !taken.contains(&candidate) {
                return Ok(candidate);
            }
            n += 1;
            candidate = paths::disambiguate(name, n);
        }
    }
}

#[cfg(test)]
#[path = "reconciler_tests.rs"]
mod tests;
