use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::backoff::Backoff;
use super::error::SyncError;
use super::local_fs::LocalFs;
use super::operation::{Operation, plan};
use super::paths;
use super::reconciler::{Reconciler, new_tag};
use super::remote::{RemoteClient, RemoteDescriptor};
use super::store::{
    Applied, ChangeKind, ItemKind, PairRecord, PairStore, StoreError, now_millis,
};

const DEFER_MS: i64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    Retrying,
    Failed,
    Conflicted,
    Deferred,
}

/// Drains ready records: claim, plan, probe, apply, mark.
pub struct Processor {
    store: Arc<PairStore>,
    fs: Arc<dyn LocalFs>,
    remote: Arc<dyn RemoteClient>,
    reconciler: Arc<Reconciler>,
    backoff: Backoff,
    max_retries: u32,
    rescans: Option<mpsc::UnboundedSender<String>>,
}

impl Processor {
    pub fn new(
        store: Arc<PairStore>,
        fs: Arc<dyn LocalFs>,
        remote: Arc<dyn RemoteClient>,
        reconciler: Arc<Reconciler>,
    ) -> Self {
        Self {
            store,
            fs,
            remote,
            reconciler,
            backoff: Backoff::new(Duration::from_millis(250), Duration::from_secs(60), true),
            max_retries: 5,
            rescans: None,
        }
    }

    pub fn with_retry(mut self, backoff: Backoff, max_retries: u32) -> Self {
        self.backoff = backoff;
        self.max_retries = max_retries.max(1);
        self
    }

    /// Subtrees to rescan after an identity mismatch are sent here.
    pub fn with_rescans(mut self, rescans: mpsc::UnboundedSender<String>) -> Self {
        self.rescans = Some(rescans);
        self
    }

    /// Processes until nothing is ready or `cancel` fires. A failing record
    /// never stops the loop; only store failures do.
    pub async fn drain(&self, worker: &str, cancel: &CancellationToken) -> Result<usize, StoreError> {
        let mut processed = 0;
        while !cancel.is_cancelled() {
            match self.run_once(worker).await? {
                Some(_) => processed += 1,
                None => break,
            }
        }
        Ok(processed)
    }

    pub async fn run_once(&self, worker: &str) -> Result<Option<Outcome>, StoreError> {
        let Some(record) = self.store.claim_next_ready(worker, now_millis()).await? else {
            return Ok(None);
        };
        let operation = plan(&record);
        tracing::debug!(
            worker,
            id = record.id,
            path = ?record.local_path,
            operation = operation.as_str(),
            "processing"
        );

        let outcome = match self.apply(&record, operation).await {
            Ok(()) => {
                self.store.release_claim(record.id, None).await?;
                Outcome::Applied
            }
            Err(err) => self.fail(&record, operation, err).await?,
        };
        Ok(Some(outcome))
    }

    async fn fail(
        &self,
        record: &PairRecord,
        operation: Operation,
        err: SyncError,
    ) -> Result<Outcome, StoreError> {
        let now = now_millis();
        match err {
            SyncError::ConflictDetected(reason) => {
                tracing::info!(id = record.id, reason, "conflict detected");
                self.store.mark_conflicted(record.id, &reason).await?;
                Ok(Outcome::Conflicted)
            }
            SyncError::Deferred(reason) => {
                tracing::debug!(id = record.id, reason, "deferred");
                self.store
                    .release_claim(record.id, Some(now + DEFER_MS))
                    .await?;
                Ok(Outcome::Deferred)
            }
            SyncError::IdentityMismatch { path } => {
                tracing::info!(id = record.id, path, "identity mismatch, rescanning");
                if let Some(rescans) = &self.rescans {
                    let _ = rescans.send(path.clone());
                }
                let attempt = record.retry_count as u32 + 1;
                let message = format!("identity mismatch at {path}");
                if attempt >= self.max_retries {
                    tracing::warn!(id = record.id, attempt, path, "identity mismatch persists");
                    self.store.mark_failed(record.id, &message, None).await?;
                    return Ok(Outcome::Failed);
                }
                self.store
                    .mark_failed(record.id, &message, Some(self.backoff.retry_at(attempt, now)))
                    .await?;
                Ok(Outcome::Retrying)
            }
            err if err.is_transient() => {
                let attempt = record.retry_count as u32 + 1;
                let message = format!("{} failed: {err}", operation.as_str());
                if attempt >= self.max_retries {
                    tracing::warn!(id = record.id, attempt, error = %err, "giving up");
                    self.store.mark_failed(record.id, &message, None).await?;
                    return Ok(Outcome::Failed);
                }
                let retry_at = self.backoff.retry_at(attempt, now);
                tracing::debug!(id = record.id, attempt, retry_at, error = %err, "will retry");
                self.store
                    .mark_failed(record.id, &message, Some(retry_at))
                    .await?;
                Ok(Outcome::Retrying)
            }
            err => {
                tracing::warn!(id = record.id, error = %err, "{} rejected", operation.as_str());
                self.store
                    .mark_failed(record.id, &format!("{} failed: {err}", operation.as_str()), None)
                    .await?;
                Ok(Outcome::Failed)
            }
        }
    }

    async fn apply(&self, record: &PairRecord, operation: Operation) -> Result<(), SyncError> {
        let parent = match record.parent_id {
            Some(id) => self.store.get(id).await?,
            None => None,
        };
        match operation {
            Operation::Forget => {
                self.store.remove_subtree(record.id).await?;
                Ok(())
            }
            Operation::Settle => {
                self.synchronized(record, Applied {
                    expected_version: record.row_version,
                    clear_local: true,
                    clear_remote: true,
                    ..Applied::default()
                })
                .await
            }
            Operation::Upload { create: true } | Operation::CreateRemoteFolder => {
                self.create_remote(record, parent.as_ref()).await
            }
            Operation::Upload { create: false } => self.update_remote(record).await,
            Operation::Download | Operation::CreateLocalFolder => {
                self.materialize(record, parent.as_ref()).await
            }
            Operation::DeleteRemote => self.delete_remote(record).await,
            Operation::DeleteLocal => self.delete_local(record).await,
            Operation::MoveRemote => self.move_remote(record, parent.as_ref()).await,
            Operation::RenameLocal => self.rename_local(record).await,
        }
    }

    async fn synchronized(&self, record: &PairRecord, applied: Applied) -> Result<(), SyncError> {
        self.store
            .mark_synchronized(record.id, &applied)
            .await?
            .ok_or(StoreError::MissingRecord(record.id))?;
        Ok(())
    }

    async fn create_remote(
        &self,
        record: &PairRecord,
        parent: Option<&PairRecord>,
    ) -> Result<(), SyncError> {
        let parent_remote = parent
            .and_then(|p| p.remote_id.clone())
            .ok_or_else(|| SyncError::Deferred("parent has no remote document".into()))?;
        let local_path = record
            .local_path
            .clone()
            .ok_or_else(|| SyncError::Deferred("local object is gone".into()))?;

        let mut record = record.clone();
        if record.remote_id.is_some() {
            // Re-upload of a subtree deleted remotely while edited here.
            let _gate = self.reconciler.lock().await;
            self.reconciler.apply_remote_deletion(record.clone()).await?;
            record = self
                .store
                .get(record.id)
                .await?
                .ok_or(StoreError::MissingRecord(record.id))?;
        }

        let existing = self
            .remote
            .get_children(&parent_remote)
            .await?
            .into_iter()
            .find(|d| d.name == record.name);
        if let Some(doc) = existing {
            let owned = self.store.find_by_remote_id(&doc.remote_id).await?.is_some();
            let adoptable = !owned
                && doc.kind == record.kind
                && (record.kind == ItemKind::Folder
                    || doc.same_content(record.local_fingerprint.as_deref()));
            if !adoptable {
                return Err(SyncError::Deferred(format!(
                    "remote name {} is held by another document",
                    record.name
                )));
            }
            tracing::debug!(id = record.id, remote_id = %doc.remote_id, "remote document already present");
            let synced = doc.fingerprint.clone().or(record.local_fingerprint.clone());
            return self
                .synchronized(&record, Applied {
                    expected_version: record.row_version,
                    clear_local: true,
                    remote: Some(doc),
                    synced_fingerprint: synced,
                    ..Applied::default()
                })
                .await;
        }

        let doc = match record.kind {
            ItemKind::Folder => self.remote.create_folder(&parent_remote, &record.name).await?,
            ItemKind::File => {
                let content = self.fs.read_file(&local_path).await.map_err(|err| {
                    if err.is_not_found() {
                        SyncError::IdentityMismatch {
                            path: local_path.clone(),
                        }
                    } else {
                        err.into()
                    }
                })?;
                self.remote
                    .create_document(&parent_remote, &record.name, content)
                    .await?
            }
        };
        tracing::info!(path = %local_path, remote_id = %doc.remote_id, "created remote document");
        let synced = doc.fingerprint.clone().or(record.local_fingerprint.clone());
        self.synchronized(&record, Applied {
            expected_version: record.row_version,
            clear_local: true,
            remote: Some(doc),
            synced_fingerprint: synced,
            ..Applied::default()
        })
        .await
    }

    async fn update_remote(&self, record: &PairRecord) -> Result<(), SyncError> {
        let (Some(remote_id), Some(local_path)) = (&record.remote_id, &record.local_path) else {
            return Err(SyncError::Deferred("record lost a side".into()));
        };
        let Some(current) = self.current_remote(record, remote_id).await? else {
            return Ok(());
        };
        if current.same_content(record.local_fingerprint.as_deref()) {
            return self
                .synchronized(record, Applied {
                    expected_version: record.row_version,
                    clear_local: true,
                    clear_remote: true,
                    synced_fingerprint: current.fingerprint.clone(),
                    remote: Some(current),
                    ..Applied::default()
                })
                .await;
        }
        if current.fingerprint.is_some()
            && current.fingerprint != record.remote_fingerprint
            && !current.same_content(record.synced_fingerprint.as_deref())
        {
            // Changed remotely since the last poll: let the store decide.
            self.store
                .modify(record.id, |r| {
                    r.apply_remote(&current);
                    r.claimed_by = None;
                })
                .await?;
            return Ok(());
        }

        let content = self.fs.read_file(local_path).await.map_err(|err| {
            if err.is_not_found() {
                SyncError::IdentityMismatch {
                    path: local_path.clone(),
                }
            } else {
                err.into()
            }
        })?;
        let doc = self.remote.update_content(remote_id, content).await?;
        tracing::info!(path = %local_path, remote_id, "uploaded content");
        let synced = doc.fingerprint.clone().or(record.local_fingerprint.clone());
        self.synchronized(record, Applied {
            expected_version: record.row_version,
            clear_local: true,
            remote: Some(doc),
            synced_fingerprint: synced,
            ..Applied::default()
        })
        .await
    }

    /// Fresh descriptor of the record's remote document. A vanished document
    /// is handed to the reconciler and `None` is returned.
    async fn current_remote(
        &self,
        record: &PairRecord,
        remote_id: &str,
    ) -> Result<Option<RemoteDescriptor>, SyncError> {
        match self.remote.get_document(remote_id).await {
            Ok(doc) => Ok(Some(doc)),
            Err(err) if err.is_not_found() => {
                tracing::info!(id = record.id, remote_id, "remote document disappeared");
                let _gate = self.reconciler.lock().await;
                if let Some(fresh) = self.store.get(record.id).await? {
                    self.reconciler.apply_remote_deletion(fresh).await?;
                }
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Download or local folder creation.
    async fn materialize(
        &self,
        record: &PairRecord,
        parent: Option<&PairRecord>,
    ) -> Result<(), SyncError> {
        let record = &self.with_local_tag(record).await?;
        let remote_id = record
            .remote_id
            .clone()
            .ok_or_else(|| SyncError::Deferred("record has no remote document".into()))?;
        let parent_path = parent
            .and_then(|p| p.local_path.clone())
            .ok_or_else(|| SyncError::Deferred("parent folder is not local yet".into()))?;
        let Some(doc) = self.current_remote(record, &remote_id).await? else {
            return Ok(());
        };
        let target = record
            .local_path
            .clone()
            .unwrap_or_else(|| paths::join(&parent_path, &record.name));

        let content = match record.kind {
            ItemKind::File => Some(
                self.remote
                    .download(&remote_id, doc.fingerprint.as_deref())
                    .await?,
            ),
            ItemKind::Folder => None,
        };

        let _gate = self.reconciler.lock().await;
        let current = self
            .store
            .get(record.id)
            .await?
            .ok_or(StoreError::MissingRecord(record.id))?;
        if current.row_version != record.row_version {
            return Err(SyncError::Deferred("record changed during transfer".into()));
        }
        let on_disk = self.fs.stat(&target).await?;
        if let Some(existing) = &on_disk {
            if record.local_path.is_none() {
                // An untracked object took the name: pick another one.
                let name = self.free_local_name(&parent_path, &record.name).await?;
                self.store
                    .modify(record.id, |r| {
                        r.name = name;
                        r.claimed_by = None;
                    })
                    .await?;
                return Err(SyncError::Deferred(format!("{target} is taken")));
            }
            if existing.kind != record.kind {
                return Err(SyncError::IdentityMismatch { path: target });
            }
            if record.is_file() && existing.fingerprint != record.local_fingerprint {
                // Edited locally since the last event; wait for it.
                return Err(SyncError::Deferred(format!("{target} changed locally")));
            }
            if record.has_local_edits() {
                return Err(SyncError::ConflictDetected(format!(
                    "{target} has unsynchronized local edits"
                )));
            }
        }

        let tag = current.local_tag.clone().unwrap_or_else(new_tag);
        let mut entry = match content {
            Some(content) => {
                let holds_content = on_disk
                    .as_ref()
                    .is_some_and(|e| doc.same_content(e.fingerprint.as_deref()));
                match (holds_content, on_disk) {
                    (true, Some(entry)) => entry,
                    _ => self.fs.write_file(&target, content, Some(&tag)).await?,
                }
            }
            None => self.fs.create_folder(&target).await?,
        };
        if entry.tag.as_deref() != Some(tag.as_str()) {
            self.fs.write_tag(&target, &tag).await?;
            entry.tag = Some(tag);
        }
        tracing::info!(path = %target, remote_id, "materialized remote document");

        let renamed = doc.name != record.name;
        let synced = doc
            .fingerprint
            .clone()
            .or_else(|| entry.fingerprint.clone());
        self.synchronized(&current, Applied {
            expected_version: current.row_version,
            clear_local: true,
            clear_remote: true,
            remote: Some(doc),
            local: Some(entry),
            synced_fingerprint: synced,
        })
        .await?;
        if renamed {
            // Stored under a disambiguated name; the remote follows.
            self.store
                .modify(record.id, |r| r.local_change = Some(ChangeKind::Moved))
                .await?;
        }
        Ok(())
    }

    /// Stores the tag a download will carry before anything reaches the disk,
    /// so a rescan after an interrupted write finds the record by its tag.
    async fn with_local_tag(&self, record: &PairRecord) -> Result<PairRecord, SyncError> {
        if record.local_tag.is_some() {
            return Ok(record.clone());
        }
        let tag = new_tag();
        let tagged = self
            .store
            .modify(record.id, |r| {
                r.local_tag.get_or_insert(tag);
            })
            .await?
            .ok_or(StoreError::MissingRecord(record.id))?;
        Ok(tagged)
    }

    async fn free_local_name(&self, parent_path: &str, name: &str) -> Result<String, SyncError> {
        let mut n = 1;
        loop {
            let candidate = paths::disambiguate(name, n);
            let path = paths::join(parent_path, &candidate);
            if self.fs.stat(&path).await?.is_none()
                && self.store.find_by_local_path(&path).await?.is_none()
            {
                return Ok(candidate);
            }
            n += 1;
        }
    }

    async fn delete_remote(&self, record: &PairRecord) -> Result<(), SyncError> {
        let Some(remote_id) = record.remote_id.as_deref() else {
            self.store.remove_subtree(record.id).await?;
            return Ok(());
        };
        let subtree = self.store.list_subtree(record.id).await?;
        if subtree
            .iter()
            .any(|r| r.remote_change.is_some_and(|c| c.is_content()))
        {
            // Remote edits below: bring the subtree back instead.
            tracing::info!(id = record.id, "remote subtree changed, restoring it locally");
            for item in subtree.iter().filter(|r| r.local_path.is_none()) {
                self.store
                    .modify(item.id, |r| {
                        r.local_change = None;
                        if r.remote_change.is_none() {
                            r.remote_change = Some(ChangeKind::Created);
                        }
                    })
                    .await?;
            }
            return Ok(());
        }

        match self.remote.delete_document(remote_id).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }
        tracing::info!(id = record.id, remote_id, "deleted remote document");
        self.store.remove_subtree(record.id).await?;
        Ok(())
    }

    async fn delete_local(&self, record: &PairRecord) -> Result<(), SyncError> {
        let Some(path) = record.local_path.clone() else {
            self.store.remove_subtree(record.id).await?;
            return Ok(());
        };
        let _gate = self.reconciler.lock().await;
        let Some(fresh) = self.store.get(record.id).await? else {
            return Ok(());
        };
        let subtree = self.store.list_subtree(record.id).await?;
        if subtree.iter().any(PairRecord::has_local_edits) {
            self.reconciler.apply_remote_deletion(fresh).await?;
            return Ok(());
        }
        if let Some(entry) = self.fs.stat(&path).await? {
            if record.is_file() && entry.fingerprint != record.local_fingerprint {
                return Err(SyncError::Deferred(format!("{path} changed locally")));
            }
            self.fs.delete(&path).await?;
        }
        tracing::info!(path, "deleted local object");
        self.store.remove_subtree(record.id).await?;
        Ok(())
    }

    async fn move_remote(
        &self,
        record: &PairRecord,
        parent: Option<&PairRecord>,
    ) -> Result<(), SyncError> {
        let remote_id = record
            .remote_id
            .clone()
            .ok_or_else(|| SyncError::Deferred("record has no remote document".into()))?;
        let parent_remote = parent
            .and_then(|p| p.remote_id.clone())
            .ok_or_else(|| SyncError::Deferred("parent has no remote document".into()))?;
        let Some(current) = self.current_remote(record, &remote_id).await? else {
            return Ok(());
        };
        let doc = if current.same_placement(Some(&parent_remote), &record.name) {
            current
        } else {
            self.remote
                .move_document(&remote_id, &parent_remote, &record.name)
                .await?
        };
        tracing::info!(path = ?record.local_path, remote_id, "moved remote document");
        self.synchronized(record, Applied {
            expected_version: record.row_version,
            clear_local: true,
            remote: Some(doc),
            ..Applied::default()
        })
        .await
    }

    async fn rename_local(&self, record: &PairRecord) -> Result<(), SyncError> {
        let (Some(old_path), Some(remote_parent), Some(remote_name)) = (
            record.local_path.clone(),
            record.remote_parent_id.clone(),
            record.remote_name.clone(),
        ) else {
            return Err(SyncError::Deferred("record lost a side".into()));
        };
        let new_parent = self
            .store
            .find_by_remote_id(&remote_parent)
            .await?
            .ok_or_else(|| SyncError::Deferred("remote parent is not known yet".into()))?;
        let parent_path = new_parent
            .local_path
            .clone()
            .ok_or_else(|| SyncError::Deferred("remote parent is not local yet".into()))?;
        if paths::is_within(&parent_path, &old_path) {
            return Err(SyncError::PermanentRemoteRejection(format!(
                "cannot move {old_path} into itself"
            )));
        }

        let _gate = self.reconciler.lock().await;
        let mut target = paths::join(&parent_path, &remote_name);
        if target != old_path && self.fs.stat(&target).await?.is_some() {
            let name = self.free_local_name(&parent_path, &remote_name).await?;
            target = paths::join(&parent_path, &name);
        }
        let entry = if target == old_path {
            self.fs.stat(&old_path).await?
        } else {
            match self.fs.rename(&old_path, &target).await {
                Ok(entry) => Some(entry),
                Err(err) if err.is_not_found() => None,
                Err(err) => return Err(err.into()),
            }
        };
        let Some(entry) = entry else {
            return Err(SyncError::IdentityMismatch { path: old_path });
        };
        let moved = self
            .store
            .move_record(record.id, &target, new_parent.id)
            .await?
            .ok_or(StoreError::MissingRecord(record.id))?;
        tracing::info!(from = %old_path, to = %target, "renamed local object");
        let renamed = paths::file_name(&target) != remote_name;
        self.synchronized(&moved, Applied {
            expected_version: moved.row_version,
            clear_remote: true,
            local: Some(entry),
            ..Applied::default()
        })
        .await?;
        if renamed {
            self.store
                .modify(record.id, |r| r.local_change = Some(ChangeKind::Moved))
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "processor_tests.rs"]
mod tests;
