use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use sqlx::{
    Row, Sqlite, SqliteConnection, SqlitePool,
    migrate::Migrator,
    query::Query,
    sqlite::{SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use super::fingerprint::same_content;
use super::local_fs::LocalEntry;
use super::paths;
use super::remote::RemoteDescriptor;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const COLUMNS: &str = "id, local_path, parent_id, name, kind, depth, local_tag, local_file_id, \
    local_fingerprint, local_mtime, remote_id, remote_parent_id, remote_name, remote_fingerprint, \
    remote_version, remote_mtime, synced_fingerprint, status, local_change, remote_change, \
    retry_count, retry_at, last_error, last_error_at, claimed_by, row_version";

/// Ancestors before descendants, then by path, then by id.
fn dependency_order(alias: &str) -> String {
    format!("{alias}depth ASC, COALESCE({alias}local_path, {alias}name) ASC, {alias}id ASC")
}

const SUBTREE: &str = "WITH RECURSIVE sub(id) AS (\
    SELECT ?1 UNION ALL SELECT p.id FROM pairs p JOIN sub ON p.parent_id = sub.id)";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("invalid item kind: {0}")]
    InvalidKind(String),
    #[error("invalid sync status: {0}")]
    InvalidStatus(String),
    #[error("invalid change kind: {0}")]
    InvalidChange(String),
    #[error("pair record {0} not found")]
    MissingRecord(i64),
    #[error("store is bound to remote root {existing}, not {requested}")]
    RootMismatch { existing: String, requested: String },
    #[error("record {0} changed concurrently")]
    VersionConflict(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ItemKind {
    #[default]
    File,
    Folder,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::File => "file",
            ItemKind::Folder => "folder",
        }
    }
}

impl FromStr for ItemKind {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "file" => Ok(ItemKind::File),
            "folder" => Ok(ItemKind::Folder),
            other => Err(StoreError::InvalidKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncStatus {
    #[default]
    Synchronized,
    LocallyChanged,
    RemotelyChanged,
    Conflicted,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synchronized => "synchronized",
            SyncStatus::LocallyChanged => "locally_changed",
            SyncStatus::RemotelyChanged => "remotely_changed",
            SyncStatus::Conflicted => "conflicted",
            SyncStatus::Error => "error",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "synchronized" => Ok(SyncStatus::Synchronized),
            "locally_changed" => Ok(SyncStatus::LocallyChanged),
            "remotely_changed" => Ok(SyncStatus::RemotelyChanged),
            "conflicted" => Ok(SyncStatus::Conflicted),
            "error" => Ok(SyncStatus::Error),
            other => Err(StoreError::InvalidStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Moved,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Modified => "modified",
            ChangeKind::Moved => "moved",
            ChangeKind::Deleted => "deleted",
        }
    }

    pub fn is_content(&self) -> bool {
        matches!(self, ChangeKind::Created | ChangeKind::Modified)
    }
}

impl FromStr for ChangeKind {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "created" => Ok(ChangeKind::Created),
            "modified" => Ok(ChangeKind::Modified),
            "moved" => Ok(ChangeKind::Moved),
            "deleted" => Ok(ChangeKind::Deleted),
            other => Err(StoreError::InvalidChange(other.to_string())),
        }
    }
}

/// One local object paired with (at most) one remote document.
///
/// `synced_fingerprint` is the common base both sides agreed on at the last
/// successful apply; a side whose fingerprint differs from it has pending
/// content changes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PairRecord {
    pub id: i64,
    pub local_path: Option<String>,
    pub parent_id: Option<i64>,
    pub name: String,
    pub kind: ItemKind,
    pub depth: i64,
    pub local_tag: Option<String>,
    pub local_file_id: Option<String>,
    pub local_fingerprint: Option<String>,
    pub local_mtime: Option<i64>,
    pub remote_id: Option<String>,
    pub remote_parent_id: Option<String>,
    pub remote_name: Option<String>,
    pub remote_fingerprint: Option<String>,
    pub remote_version: Option<String>,
    pub remote_mtime: Option<i64>,
    pub synced_fingerprint: Option<String>,
    pub status: SyncStatus,
    pub local_change: Option<ChangeKind>,
    pub remote_change: Option<ChangeKind>,
    pub retry_count: i64,
    pub retry_at: Option<i64>,
    pub last_error: Option<String>,
    pub last_error_at: Option<i64>,
    pub claimed_by: Option<String>,
    pub row_version: i64,
}

impl PairRecord {
    pub fn draft(name: impl Into<String>, kind: ItemKind) -> Self {
        Self {
            name: name.into(),
            kind,
            ..Self::default()
        }
    }

    pub fn is_file(&self) -> bool {
        self.kind == ItemKind::File
    }

    pub fn apply_remote(&mut self, remote: &RemoteDescriptor) {
        self.remote_id = Some(remote.remote_id.clone());
        self.remote_parent_id = remote.parent_id.clone();
        self.remote_name = Some(remote.name.clone());
        self.remote_fingerprint = remote.fingerprint.clone();
        self.remote_version = Some(remote.version.clone());
        self.remote_mtime = remote.mtime;
    }

    pub fn apply_local(&mut self, entry: &LocalEntry) {
        self.local_fingerprint = entry.fingerprint.clone();
        self.local_mtime = entry.mtime;
        self.local_file_id = entry.file_id.clone();
        if entry.tag.is_some() {
            self.local_tag = entry.tag.clone();
        }
    }

    pub fn forget_remote(&mut self) {
        self.remote_id = None;
        self.remote_parent_id = None;
        self.remote_name = None;
        self.remote_fingerprint = None;
        self.remote_version = None;
        self.remote_mtime = None;
    }

    pub fn has_local_edits(&self) -> bool {
        self.local_change.is_some_and(|c| c.is_content())
            || (self.is_file()
                && self.local_path.is_some()
                && !same_content(
                    self.local_fingerprint.as_deref(),
                    self.synced_fingerprint.as_deref(),
                ))
    }

    /// Drops `conflicted`/`error` so the next refresh derives the status
    /// from pending changes again.
    pub fn clear_sticky(&mut self) {
        if matches!(self.status, SyncStatus::Conflicted | SyncStatus::Error) {
            self.status = SyncStatus::LocallyChanged;
            self.retry_count = 0;
            self.retry_at = None;
        }
    }

    fn content_conflict(&self) -> bool {
        self.is_file()
            && self.local_change.is_some_and(|c| c.is_content())
            && self.remote_change.is_some_and(|c| c.is_content())
            && !same_content(
                self.local_fingerprint.as_deref(),
                self.remote_fingerprint.as_deref(),
            )
    }

    /// Reconciles the pending-change hints with the fingerprints, then derives
    /// the status.
    pub fn refresh_status(&mut self) {
        let both_sides = self.local_path.is_some() && self.remote_id.is_some();
        if self.is_file() {
            let converged = both_sides
                && same_content(
                    self.local_fingerprint.as_deref(),
                    self.remote_fingerprint.as_deref(),
                );
            if converged {
                if self.local_change.is_some_and(|c| c.is_content()) {
                    self.local_change = None;
                }
                if self.remote_change.is_some_and(|c| c.is_content()) {
                    self.remote_change = None;
                }
                self.synced_fingerprint = self.local_fingerprint.clone();
            } else {
                if self.local_path.is_some()
                    && self.local_change.is_none()
                    && !same_content(
                        self.local_fingerprint.as_deref(),
                        self.synced_fingerprint.as_deref(),
                    )
                {
                    self.local_change = Some(ChangeKind::Modified);
                }
                if self.remote_id.is_some()
                    && self.remote_change.is_none()
                    && self.remote_fingerprint.is_some()
                    && !same_content(
                        self.remote_fingerprint.as_deref(),
                        self.synced_fingerprint.as_deref(),
                    )
                {
                    self.remote_change = Some(ChangeKind::Modified);
                }
            }
        } else if both_sides {
            if self.local_change == Some(ChangeKind::Created) {
                self.local_change = None;
            }
            if self.remote_change == Some(ChangeKind::Created) {
                self.remote_change = None;
            }
        }

        let pending = self.local_change.is_some() || self.remote_change.is_some();
        self.status = if !pending {
            SyncStatus::Synchronized
        } else if self.content_conflict() {
            SyncStatus::Conflicted
        } else if matches!(self.status, SyncStatus::Conflicted | SyncStatus::Error) {
            self.status
        } else if self.local_change.is_some() {
            SyncStatus::LocallyChanged
        } else {
            SyncStatus::RemotelyChanged
        };

        if self.status == SyncStatus::Synchronized {
            self.retry_count = 0;
            self.retry_at = None;
            self.last_error = None;
            self.last_error_at = None;
        }
    }
}

/// Result of a successful apply, handed to [`PairStore::mark_synchronized`].
#[derive(Debug, Clone, Default)]
pub struct Applied {
    /// Row version observed right before the side effect. Pending changes are
    /// only cleared when the record did not change in the meantime.
    pub expected_version: i64,
    pub clear_local: bool,
    pub clear_remote: bool,
    pub remote: Option<RemoteDescriptor>,
    pub local: Option<LocalEntry>,
    pub synced_fingerprint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreCounts {
    pub total: i64,
    pub synchronized: i64,
    pub pending: i64,
    pub conflicted: i64,
    pub errors: i64,
    pub claimed: i64,
}

impl StoreCounts {
    pub fn unsynchronized(&self) -> i64 {
        self.pending + self.conflicted + self.errors
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictEntry {
    pub id: i64,
    pub pair_id: Option<i64>,
    pub local_path: String,
    pub renamed_local: String,
    pub remote_id: Option<String>,
    pub created: i64,
    pub reason: String,
}

pub struct PairStore {
    pool: SqlitePool,
    write_gate: Mutex<()>,
}

impl PairStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_gate: Mutex::new(()),
        }
    }

    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self::from_pool(pool);
        store.init().await?;
        Ok(store)
    }

    pub async fn open_default() -> Result<Self, StoreError> {
        Self::open(&default_db_path()?).await
    }

    /// In-memory database; a single long-lived connection keeps it alive.
    pub async fn open_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self::from_pool(pool);
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn get(&self, id: i64) -> Result<Option<PairRecord>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        fetch_by_id(&mut conn, id).await
    }

    pub async fn find_by_local_path(&self, path: &str) -> Result<Option<PairRecord>, StoreError> {
        self.fetch_one_where("local_path = ?1", path).await
    }

    pub async fn find_by_remote_id(&self, remote_id: &str) -> Result<Option<PairRecord>, StoreError> {
        self.fetch_one_where("remote_id = ?1", remote_id).await
    }

    pub async fn find_by_local_tag(&self, tag: &str) -> Result<Option<PairRecord>, StoreError> {
        self.fetch_one_where("local_tag = ?1", tag).await
    }

    async fn fetch_one_where(
        &self,
        predicate: &str,
        value: &str,
    ) -> Result<Option<PairRecord>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM pairs WHERE {predicate}");
        let row = sqlx::query(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// Binds the store to a remote root and returns the root record ("/").
    pub async fn ensure_root(&self, remote_root_id: &str) -> Result<PairRecord, StoreError> {
        let _gate = self.write_gate.lock().await;
        let mut tx = self.pool.begin().await?;
        let existing = fetch_where_tx(&mut tx, "local_path = ?1", paths::ROOT).await?;
        let root = match existing {
            Some(root) => {
                if root.remote_id.as_deref() != Some(remote_root_id) {
                    return Err(StoreError::RootMismatch {
                        existing: root.remote_id.unwrap_or_default(),
                        requested: remote_root_id.to_string(),
                    });
                }
                root
            }
            None => {
                let mut root = PairRecord::draft("", ItemKind::Folder);
                root.local_path = Some(paths::ROOT.to_string());
                root.remote_id = Some(remote_root_id.to_string());
                root.remote_name = Some(String::new());
                insert_tx(&mut tx, &root).await?
            }
        };
        tx.commit().await?;
        Ok(root)
    }

    pub async fn insert(&self, draft: &PairRecord) -> Result<PairRecord, StoreError> {
        let _gate = self.write_gate.lock().await;
        let mut tx = self.pool.begin().await?;
        if let Some(path) = draft.local_path.as_deref() {
            evict_path_tx(&mut tx, path, None).await?;
        }
        let record = insert_tx(&mut tx, draft).await?;
        tx.commit().await?;
        Ok(record)
    }

    /// Inserts a record, or overwrites every field of the record with the same id.
    pub async fn upsert(&self, pair: &PairRecord) -> Result<PairRecord, StoreError> {
        let _gate = self.write_gate.lock().await;
        let mut tx = self.pool.begin().await?;
        let record = match fetch_by_id(&mut tx, pair.id).await? {
            Some(existing) => {
                let mut next = pair.clone();
                next.row_version = existing.row_version;
                next.refresh_status();
                write_tx(&mut tx, &next).await?
            }
            None => insert_tx(&mut tx, pair).await?,
        };
        tx.commit().await?;
        Ok(record)
    }

    /// Read-modify-write of one record in a single transaction. The status is
    /// re-derived after `mutate` runs and the row version is bumped.
    pub async fn modify<F>(&self, id: i64, mutate: F) -> Result<Option<PairRecord>, StoreError>
    where
        F: FnOnce(&mut PairRecord),
    {
        let _gate = self.write_gate.lock().await;
        let mut tx = self.pool.begin().await?;
        let Some(mut record) = fetch_by_id(&mut tx, id).await? else {
            return Ok(None);
        };
        mutate(&mut record);
        record.refresh_status();
        let record = write_tx(&mut tx, &record).await?;
        tx.commit().await?;
        Ok(Some(record))
    }

    /// Moves a record to `new_path` under `new_parent_id`; descendants follow in
    /// the same transaction. Records still holding the target path lose their
    /// local side.
    pub async fn move_record(
        &self,
        id: i64,
        new_path: &str,
        new_parent_id: i64,
    ) -> Result<Option<PairRecord>, StoreError> {
        let _gate = self.write_gate.lock().await;
        let mut tx = self.pool.begin().await?;
        let Some(mut record) = fetch_by_id(&mut tx, id).await? else {
            return Ok(None);
        };
        if record.local_path.as_deref() == Some(new_path) && record.parent_id == Some(new_parent_id)
        {
            return Ok(Some(record));
        }
        let parent = fetch_by_id(&mut tx, new_parent_id)
            .await?
            .ok_or(StoreError::MissingRecord(new_parent_id))?;

        evict_path_tx(&mut tx, new_path, Some(id)).await?;

        let new_depth = parent.depth + 1;
        let delta = new_depth - record.depth;
        if delta != 0 {
            let sql = format!(
                "{SUBTREE} UPDATE pairs SET depth = depth + ?2, row_version = row_version + 1 \
                 WHERE id IN (SELECT id FROM sub) AND id != ?1"
            );
            sqlx::query(&sql)
                .bind(id)
                .bind(delta)
                .execute(&mut *tx)
                .await?;
        }
        if let Some(old_path) = record.local_path.clone() {
            let sql = format!(
                "{SUBTREE} UPDATE pairs SET local_path = ?3 || substr(local_path, length(?2) + 1), \
                 row_version = row_version + 1 \
                 WHERE id IN (SELECT id FROM sub) AND id != ?1 AND local_path IS NOT NULL \
                 AND substr(local_path, 1, length(?2) + 1) = ?2 || '/'"
            );
            sqlx::query(&sql)
                .bind(id)
                .bind(&old_path)
                .bind(new_path)
                .execute(&mut *tx)
                .await?;
        }

        record.local_path = Some(new_path.to_string());
        record.name = paths::file_name(new_path).to_string();
        record.parent_id = Some(new_parent_id);
        record.depth = new_depth;
        record.refresh_status();
        let record = write_tx(&mut tx, &record).await?;
        tx.commit().await?;
        Ok(Some(record))
    }

    /// The local object (and everything below it) is gone. Records that never
    /// reached the remote are dropped; the others wait for a remote delete.
    pub async fn mark_locally_deleted(&self, id: i64) -> Result<(), StoreError> {
        let _gate = self.write_gate.lock().await;
        let mut tx = self.pool.begin().await?;
        locally_delete_tx(&mut tx, id).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn remove_subtree(&self, id: i64) -> Result<u64, StoreError> {
        let _gate = self.write_gate.lock().await;
        let mut tx = self.pool.begin().await?;
        let ids = subtree_ids_tx(&mut tx, id).await?;
        sqlx::query("DELETE FROM pairs WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(ids.len() as u64)
    }

    /// The record and all of its descendants, ancestors first.
    pub async fn list_subtree(&self, id: i64) -> Result<Vec<PairRecord>, StoreError> {
        let sql = format!(
            "{SUBTREE} SELECT {COLUMNS} FROM pairs WHERE id IN (SELECT id FROM sub) ORDER BY {}",
            dependency_order("")
        );
        let rows = sqlx::query(&sql).bind(id).fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn list_children(&self, parent_id: i64) -> Result<Vec<PairRecord>, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM pairs WHERE parent_id = ?1 ORDER BY name ASC, id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(parent_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Records whose local path is `scope` or lies below it.
    pub async fn list_in_scope(&self, scope: &str) -> Result<Vec<PairRecord>, StoreError> {
        let rows = if scope == paths::ROOT {
            let sql = format!(
                "SELECT {COLUMNS} FROM pairs WHERE local_path IS NOT NULL ORDER BY depth, local_path"
            );
            sqlx::query(&sql).fetch_all(&self.pool).await?
        } else {
            let sql = format!(
                "SELECT {COLUMNS} FROM pairs WHERE local_path = ?1 \
                 OR substr(local_path, 1, length(?1) + 1) = ?1 || '/' ORDER BY depth, local_path"
            );
            sqlx::query(&sql).bind(scope).fetch_all(&self.pool).await?
        };
        rows.iter().map(record_from_row).collect()
    }

    /// Every record that is not synchronized, in dependency order: ancestors
    /// strictly before descendants, then by path, then by id.
    pub async fn list_pending(&self) -> Result<Vec<PairRecord>, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM pairs WHERE status != 'synchronized' ORDER BY {}",
            dependency_order("")
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn list_by_status(&self, status: SyncStatus) -> Result<Vec<PairRecord>, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM pairs WHERE status = ?1 ORDER BY {}",
            dependency_order("")
        );
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Claims the first ready record in dependency order. Ready: pending,
    /// unclaimed, retry time reached, parent synchronized.
    pub async fn claim_next_ready(
        &self,
        worker: &str,
        now: i64,
    ) -> Result<Option<PairRecord>, StoreError> {
        let _gate = self.write_gate.lock().await;
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "SELECT p.id FROM pairs p LEFT JOIN pairs parent ON parent.id = p.parent_id \
             WHERE p.status IN ('locally_changed', 'remotely_changed') \
               AND p.claimed_by IS NULL \
               AND (p.retry_at IS NULL OR p.retry_at <= ?1) \
               AND (p.parent_id IS NULL OR parent.status = 'synchronized') \
             ORDER BY {} LIMIT 1",
            dependency_order("p.")
        );
        let id: Option<i64> = sqlx::query(&sql)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?
            .map(|row| row.try_get("id"))
            .transpose()?;

        let Some(id) = id else {
            return Ok(None);
        };
        sqlx::query(
            "UPDATE pairs SET claimed_by = ?2, row_version = row_version + 1 \
             WHERE id = ?1 AND claimed_by IS NULL",
        )
        .bind(id)
        .bind(worker)
        .execute(&mut *tx)
        .await?;
        let record = fetch_by_id(&mut tx, id).await?;
        tx.commit().await?;
        Ok(record)
    }

    pub async fn release_claim(&self, id: i64, retry_at: Option<i64>) -> Result<(), StoreError> {
        let _gate = self.write_gate.lock().await;
        sqlx::query(
            "UPDATE pairs SET claimed_by = NULL, retry_at = COALESCE(?2, retry_at), \
             row_version = row_version + 1 WHERE id = ?1",
        )
        .bind(id)
        .bind(retry_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Releases every claim, noting `note` as the records' last error.
    pub async fn release_all_claims(&self, note: Option<&str>) -> Result<u64, StoreError> {
        let _gate = self.write_gate.lock().await;
        let result = sqlx::query(
            "UPDATE pairs SET claimed_by = NULL, \
             last_error = COALESCE(?1, last_error), \
             last_error_at = CASE WHEN ?1 IS NULL THEN last_error_at ELSE ?2 END, \
             row_version = row_version + 1 WHERE claimed_by IS NOT NULL",
        )
        .bind(note)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn mark_synchronized(
        &self,
        id: i64,
        applied: &Applied,
    ) -> Result<Option<PairRecord>, StoreError> {
        let _gate = self.write_gate.lock().await;
        let mut tx = self.pool.begin().await?;
        let Some(mut record) = fetch_by_id(&mut tx, id).await? else {
            return Ok(None);
        };
        let unchanged = record.row_version == applied.expected_version;

        if let Some(remote) = &applied.remote {
            record.apply_remote(remote);
        }
        if let Some(local) = &applied.local
            && (unchanged || record.local_path.is_none()
                || record.local_path.as_deref() == Some(local.path.as_str()))
        {
            if record.local_path.as_deref() != Some(local.path.as_str()) {
                evict_path_tx(&mut tx, &local.path, Some(id)).await?;
                record.local_path = Some(local.path.clone());
                record.name = paths::file_name(&local.path).to_string();
            }
            record.apply_local(local);
        }
        if let Some(fingerprint) = &applied.synced_fingerprint {
            record.synced_fingerprint = Some(fingerprint.clone());
        }
        if unchanged {
            if applied.clear_local {
                record.local_change = None;
            }
            if applied.clear_remote {
                record.remote_change = None;
            }
        }
        record.claimed_by = None;
        record.retry_count = 0;
        record.retry_at = None;
        record.last_error = None;
        record.last_error_at = None;
        if record.status == SyncStatus::Error {
            record.clear_sticky();
        }
        record.refresh_status();
        let record = write_tx(&mut tx, &record).await?;
        tx.commit().await?;
        Ok(Some(record))
    }

    pub async fn mark_conflicted(&self, id: i64, reason: &str) -> Result<(), StoreError> {
        let _gate = self.write_gate.lock().await;
        sqlx::query(
            "UPDATE pairs SET status = 'conflicted', claimed_by = NULL, last_error = ?2, \
             last_error_at = ?3, row_version = row_version + 1 WHERE id = ?1",
        )
        .bind(id)
        .bind(reason)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Records a failed apply. With `retry_at` the record stays pending and is
    /// retried later; without it the record becomes `error`.
    pub async fn mark_failed(
        &self,
        id: i64,
        error: &str,
        retry_at: Option<i64>,
    ) -> Result<Option<PairRecord>, StoreError> {
        self.modify(id, |record| {
            record.claimed_by = None;
            record.last_error = Some(error.to_string());
            record.last_error_at = Some(now_millis());
            match retry_at {
                Some(at) => {
                    record.retry_count += 1;
                    record.retry_at = Some(at);
                }
                None => record.status = SyncStatus::Error,
            }
        })
        .await
    }

    pub async fn counts(&self) -> Result<StoreCounts, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM pairs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = StoreCounts::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            counts.total += n;
            match status.parse::<SyncStatus>()? {
                SyncStatus::Synchronized => counts.synchronized += n,
                SyncStatus::LocallyChanged | SyncStatus::RemotelyChanged => counts.pending += n,
                SyncStatus::Conflicted => counts.conflicted += n,
                SyncStatus::Error => counts.errors += n,
            }
        }
        counts.claimed =
            sqlx::query("SELECT COUNT(*) AS n FROM pairs WHERE claimed_by IS NOT NULL")
                .fetch_one(&self.pool)
                .await?
                .try_get("n")?;
        Ok(counts)
    }

    pub async fn last_error(&self) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(
            "SELECT last_error FROM pairs WHERE last_error IS NOT NULL \
             ORDER BY last_error_at DESC, id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some(row) => row.try_get("last_error")?,
            None => None,
        })
    }

    pub async fn checkpoint(&self) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT checkpoint FROM sync_checkpoint WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => row.try_get("checkpoint")?,
            None => None,
        })
    }

    pub async fn set_checkpoint(&self, checkpoint: &str) -> Result<(), StoreError> {
        let _gate = self.write_gate.lock().await;
        sqlx::query(
            "INSERT INTO sync_checkpoint (id, checkpoint, updated_at) VALUES (1, ?1, ?2) \
             ON CONFLICT(id) DO UPDATE SET checkpoint = excluded.checkpoint, \
             updated_at = excluded.updated_at",
        )
        .bind(checkpoint)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_conflict(
        &self,
        pair_id: Option<i64>,
        local_path: &str,
        renamed_local: &str,
        remote_id: Option<&str>,
        reason: &str,
    ) -> Result<i64, StoreError> {
        let _gate = self.write_gate.lock().await;
        let result = sqlx::query(
            "INSERT INTO conflicts (pair_id, local_path, renamed_local, remote_id, created, reason) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(pair_id)
        .bind(local_path)
        .bind(renamed_local)
        .bind(remote_id)
        .bind(now_millis())
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn list_conflicts(&self) -> Result<Vec<ConflictEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, pair_id, local_path, renamed_local, remote_id, created, reason \
             FROM conflicts ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ConflictEntry {
                id: row.try_get("id")?,
                pair_id: row.try_get("pair_id")?,
                local_path: row.try_get("local_path")?,
                renamed_local: row.try_get("renamed_local")?,
                remote_id: row.try_get("remote_id")?,
                created: row.try_get("created")?,
                reason: row.try_get("reason")?,
            });
        }
        Ok(out)
    }

    /// Splits a conflicted record in two inside one transaction: `original`
    /// gives up its local side, `copy` is inserted as a new local object.
    pub async fn split_conflict(
        &self,
        original: &PairRecord,
        copy: &PairRecord,
    ) -> Result<PairRecord, StoreError> {
        let _gate = self.write_gate.lock().await;
        let mut tx = self.pool.begin().await?;
        let current = fetch_by_id(&mut tx, original.id)
            .await?
            .ok_or(StoreError::MissingRecord(original.id))?;
        if current.row_version != original.row_version {
            return Err(StoreError::VersionConflict(original.id));
        }
        let mut original = original.clone();
        original.refresh_status();
        write_tx(&mut tx, &original).await?;
        if let Some(path) = copy.local_path.as_deref() {
            evict_path_tx(&mut tx, path, None).await?;
        }
        let inserted = insert_tx(&mut tx, copy).await?;
        tx.commit().await?;
        Ok(inserted)
    }
}

pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

fn default_db_path() -> Result<PathBuf, StoreError> {
    let base = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    Ok(base.join("docsync").join("state.db"))
}

fn record_from_row(row: &SqliteRow) -> Result<PairRecord, StoreError> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    let local_change: Option<String> = row.try_get("local_change")?;
    let remote_change: Option<String> = row.try_get("remote_change")?;
    Ok(PairRecord {
        id: row.try_get("id")?,
        local_path: row.try_get("local_path")?,
        parent_id: row.try_get("parent_id")?,
        name: row.try_get("name")?,
        kind: kind.parse()?,
        depth: row.try_get("depth")?,
        local_tag: row.try_get("local_tag")?,
        local_file_id: row.try_get("local_file_id")?,
        local_fingerprint: row.try_get("local_fingerprint")?,
        local_mtime: row.try_get("local_mtime")?,
        remote_id: row.try_get("remote_id")?,
        remote_parent_id: row.try_get("remote_parent_id")?,
        remote_name: row.try_get("remote_name")?,
        remote_fingerprint: row.try_get("remote_fingerprint")?,
        remote_version: row.try_get("remote_version")?,
        remote_mtime: row.try_get("remote_mtime")?,
        synced_fingerprint: row.try_get("synced_fingerprint")?,
        status: status.parse()?,
        local_change: local_change.as_deref().map(str::parse).transpose()?,
        remote_change: remote_change.as_deref().map(str::parse).transpose()?,
        retry_count: row.try_get("retry_count")?,
        retry_at: row.try_get("retry_at")?,
        last_error: row.try_get("last_error")?,
        last_error_at: row.try_get("last_error_at")?,
        claimed_by: row.try_get("claimed_by")?,
        row_version: row.try_get("row_version")?,
    })
}

fn bind_fields<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    record: &'q PairRecord,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    query
        .bind(&record.local_path)
        .bind(record.parent_id)
        .bind(&record.name)
        .bind(record.kind.as_str())
        .bind(record.depth)
        .bind(&record.local_tag)
        .bind(&record.local_file_id)
        .bind(&record.local_fingerprint)
        .bind(record.local_mtime)
        .bind(&record.remote_id)
        .bind(&record.remote_parent_id)
        .bind(&record.remote_name)
        .bind(&record.remote_fingerprint)
        .bind(&record.remote_version)
        .bind(record.remote_mtime)
        .bind(&record.synced_fingerprint)
        .bind(record.status.as_str())
        .bind(record.local_change.map(|c| c.as_str()))
        .bind(record.remote_change.map(|c| c.as_str()))
        .bind(record.retry_count)
        .bind(record.retry_at)
        .bind(&record.last_error)
        .bind(record.last_error_at)
        .bind(&record.claimed_by)
}

async fn fetch_by_id(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<PairRecord>, StoreError> {
    let sql = format!("SELECT {COLUMNS} FROM pairs WHERE id = ?1");
    let row = sqlx::query(&sql).bind(id).fetch_optional(&mut *conn).await?;
    row.as_ref().map(record_from_row).transpose()
}

async fn fetch_where_tx(
    conn: &mut SqliteConnection,
    predicate: &str,
    value: &str,
) -> Result<Option<PairRecord>, StoreError> {
    let sql = format!("SELECT {COLUMNS} FROM pairs WHERE {predicate}");
    let row = sqlx::query(&sql)
        .bind(value)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(record_from_row).transpose()
}

async fn insert_tx(
    conn: &mut SqliteConnection,
    draft: &PairRecord,
) -> Result<PairRecord, StoreError> {
    let mut record = draft.clone();
    record.row_version = 0;
    record.refresh_status();
    let query = sqlx::query(
        "INSERT INTO pairs (local_path, parent_id, name, kind, depth, local_tag, local_file_id, \
         local_fingerprint, local_mtime, remote_id, remote_parent_id, remote_name, \
         remote_fingerprint, remote_version, remote_mtime, synced_fingerprint, status, \
         local_change, remote_change, retry_count, retry_at, last_error, last_error_at, \
         claimed_by, row_version) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, \
         ?18, ?19, ?20, ?21, ?22, ?23, ?24, 0)",
    );
    let result = bind_fields(query, &record).execute(&mut *conn).await?;
    let id = result.last_insert_rowid();
    fetch_by_id(conn, id)
        .await?
        .ok_or(StoreError::MissingRecord(id))
}

async fn write_tx(
    conn: &mut SqliteConnection,
    record: &PairRecord,
) -> Result<PairRecord, StoreError> {
    let query = sqlx::query(
        "UPDATE pairs SET local_path = ?1, parent_id = ?2, name = ?3, kind = ?4, depth = ?5, \
         local_tag = ?6, local_file_id = ?7, local_fingerprint = ?8, local_mtime = ?9, \
         remote_id = ?10, remote_parent_id = ?11, remote_name = ?12, remote_fingerprint = ?13, \
         remote_version = ?14, remote_mtime = ?15, synced_fingerprint = ?16, status = ?17, \
         local_change = ?18, remote_change = ?19, retry_count = ?20, retry_at = ?21, \
         last_error = ?22, last_error_at = ?23, claimed_by = ?24, \
         row_version = row_version + 1 \
         WHERE id = ?25 AND row_version = ?26",
    );
    let result = bind_fields(query, record)
        .bind(record.id)
        .bind(record.row_version)
        .execute(&mut *conn)
        .await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::VersionConflict(record.id));
    }
    fetch_by_id(conn, record.id)
        .await?
        .ok_or(StoreError::MissingRecord(record.id))
}

async fn subtree_ids_tx(conn: &mut SqliteConnection, id: i64) -> Result<Vec<i64>, StoreError> {
    let sql = format!("{SUBTREE} SELECT id FROM sub");
    let rows = sqlx::query(&sql).bind(id).fetch_all(&mut *conn).await?;
    rows.iter()
        .map(|row| row.try_get::<i64, _>("id").map_err(StoreError::from))
        .collect()
}

async fn locally_delete_tx(conn: &mut SqliteConnection, id: i64) -> Result<(), StoreError> {
    let sql = format!(
        "{SUBTREE} SELECT {COLUMNS} FROM pairs WHERE id IN (SELECT id FROM sub) ORDER BY depth DESC"
    );
    let rows = sqlx::query(&sql).bind(id).fetch_all(&mut *conn).await?;
    let records = rows
        .iter()
        .map(record_from_row)
        .collect::<Result<Vec<_>, _>>()?;
    for mut record in records {
        if record.remote_id.is_none() {
            sqlx::query("DELETE FROM pairs WHERE id = ?1")
                .bind(record.id)
                .execute(&mut *conn)
                .await?;
            continue;
        }
        record.local_path = None;
        record.local_fingerprint = None;
        record.local_mtime = None;
        record.local_change = Some(ChangeKind::Deleted);
        record.clear_sticky();
        record.refresh_status();
        write_tx(conn, &record).await?;
    }
    Ok(())
}

/// Records holding `path` (or paths below it) outside the subtree of
/// `keep` lose their local side.
async fn evict_path_tx(
    conn: &mut SqliteConnection,
    path: &str,
    keep: Option<i64>,
) -> Result<(), StoreError> {
    let keep_ids = match keep {
        Some(id) => subtree_ids_tx(conn, id).await?,
        None => Vec::new(),
    };
    let rows = sqlx::query(
        "SELECT id FROM pairs WHERE local_path = ?1 \
         OR substr(local_path, 1, length(?1) + 1) = ?1 || '/' ORDER BY depth ASC",
    )
    .bind(path)
    .fetch_all(&mut *conn)
    .await?;
    for row in rows {
        let holder: i64 = row.try_get("id")?;
        if keep_ids.contains(&holder) {
            continue;
        }
        let still_holding = fetch_by_id(conn, holder)
            .await?
            .is_some_and(|r| r.local_path.is_some());
        if still_holding {
            tracing::debug!(holder, path, "evicting stale holder of local path");
            locally_delete_tx(conn, holder).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
