use std::{str::FromStr, sync::Arc};

use thiserror::Error;
use time::OffsetDateTime;

use super::error::SyncError;
use super::local_fs::LocalFs;
use super::paths;
use super::store::{ChangeKind, ItemKind, PairRecord, PairStore};

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown conflict policy: {0}")]
pub struct UnknownPolicy(String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    #[default]
    KeepBoth,
    LastWriterWins,
    Manual,
}

impl FromStr for ConflictPolicy {
    type Err = UnknownPolicy;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "keep-both" => Ok(ConflictPolicy::KeepBoth),
            "last-writer-wins" | "lww" => Ok(ConflictPolicy::LastWriterWins),
            "manual" => Ok(ConflictPolicy::Manual),
            other => Err(UnknownPolicy(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    KeepLocal,
    KeepRemote,
    KeepBoth,
}

pub trait ConflictResolver: Send + Sync {
    /// `None` leaves the record conflicted until someone resolves it.
    fn decide(&self, record: &PairRecord) -> Option<Resolution>;
}

pub struct KeepBothResolver;

impl ConflictResolver for KeepBothResolver {
    fn decide(&self, _record: &PairRecord) -> Option<Resolution> {
        Some(Resolution::KeepBoth)
    }
}

/// Newer modification time wins; ties and unknown times keep both.
pub struct LastWriterWinsResolver;

impl ConflictResolver for LastWriterWinsResolver {
    fn decide(&self, record: &PairRecord) -> Option<Resolution> {
        match (record.local_mtime, record.remote_mtime) {
            (Some(local), Some(remote)) if local > remote => Some(Resolution::KeepLocal),
            (Some(local), Some(remote)) if remote > local => Some(Resolution::KeepRemote),
            _ => Some(Resolution::KeepBoth),
        }
    }
}

pub struct ManualResolver;

impl ConflictResolver for ManualResolver {
    fn decide(&self, _record: &PairRecord) -> Option<Resolution> {
        None
    }
}

pub fn resolver_for(policy: ConflictPolicy) -> Arc<dyn ConflictResolver> {
    match policy {
        ConflictPolicy::KeepBoth => Arc::new(KeepBothResolver),
        ConflictPolicy::LastWriterWins => Arc::new(LastWriterWinsResolver),
        ConflictPolicy::Manual => Arc::new(ManualResolver),
    }
}

/// "report.txt" -> "report (conflict 2024-05-01 101500).txt"
pub fn conflict_name(name: &str, at: OffsetDateTime) -> String {
    let stamp = format!(
        "{:04}-{:02}-{:02} {:02}{:02}{:02}",
        at.year(),
        u8::from(at.month()),
        at.day(),
        at.hour(),
        at.minute(),
        at.second()
    );
    paths::decorate(name, &format!("conflict {stamp}"))
}

/// Applies `resolution` to a conflicted record. Returns the path of the
/// renamed local copy for keep-both.
pub async fn apply_resolution(
    store: &PairStore,
    fs: &dyn LocalFs,
    record: &PairRecord,
    resolution: Resolution,
) -> Result<Option<String>, SyncError> {
    match resolution {
        Resolution::KeepLocal => {
            store
                .modify(record.id, |r| {
                    r.clear_sticky();
                    r.synced_fingerprint = r.remote_fingerprint.clone();
                    r.remote_change = None;
                    if r.local_change != Some(ChangeKind::Created) {
                        r.local_change = Some(ChangeKind::Modified);
                    }
                })
                .await?;
            tracing::info!(id = record.id, "conflict resolved in favor of local content");
            Ok(None)
        }
        Resolution::KeepRemote => {
            store
                .modify(record.id, |r| {
                    r.clear_sticky();
                    r.synced_fingerprint = r.local_fingerprint.clone();
                    r.local_change = None;
                    r.remote_change = Some(ChangeKind::Modified);
                })
                .await?;
            tracing::info!(id = record.id, "conflict resolved in favor of remote content");
            Ok(None)
        }
        Resolution::KeepBoth => keep_both(store, fs, record).await,
    }
}

async fn keep_both(
    store: &PairStore,
    fs: &dyn LocalFs,
    record: &PairRecord,
) -> Result<Option<String>, SyncError> {
    let Some(path) = record.local_path.clone() else {
        // Nothing local left to preserve.
        store
            .modify(record.id, |r| {
                r.clear_sticky();
                r.local_change = None;
                r.remote_change = Some(ChangeKind::Modified);
            })
            .await?;
        return Ok(None);
    };
    let parent = paths::parent_path(&path).unwrap_or(paths::ROOT).to_string();
    let base = conflict_name(paths::file_name(&path), OffsetDateTime::now_utc());
    let mut target = paths::join(&parent, &base);
    let mut n = 1;
    while fs.stat(&target).await?.is_some() || store.find_by_local_path(&target).await?.is_some()
    {
        n += 1;
        target = paths::join(&parent, &paths::disambiguate(&base, n));
    }

    let entry = fs.rename(&path, &target).await?;

    let mut copy = PairRecord::draft(paths::file_name(&target), record.kind);
    copy.local_path = Some(target.clone());
    copy.parent_id = record.parent_id;
    copy.depth = record.depth;
    copy.apply_local(&entry);
    if copy.local_tag.is_none() {
        copy.local_tag = record.local_tag.clone();
    }
    copy.local_change = Some(ChangeKind::Created);

    let mut original = record.clone();
    original.clear_sticky();
    original.local_path = None;
    original.local_tag = None;
    original.local_file_id = None;
    original.local_fingerprint = None;
    original.local_mtime = None;
    original.local_change = None;
    original.remote_change = Some(if original.kind == ItemKind::Folder {
        ChangeKind::Created
    } else {
        ChangeKind::Modified
    });

    store.split_conflict(&original, &copy).await?;
    store
        .record_conflict(
            Some(record.id),
            &path,
            &target,
            record.remote_id.as_deref(),
            record.last_error.as_deref().unwrap_or("both sides changed"),
        )
        .await?;
    tracing::info!(path, renamed = %target, "conflict resolved by keeping both versions");
    Ok(Some(target))
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    fn conflicted(local_mtime: Option<i64>, remote_mtime: Option<i64>) -> PairRecord {
        let mut record = PairRecord::draft("A.txt", ItemKind::File);
        record.local_mtime = local_mtime;
        record.remote_mtime = remote_mtime;
        record
    }

    #[test]
    fn conflict_name_keeps_extension() {
        let at = datetime!(2024-05-01 10:15:00 UTC);
        assert_eq!(conflict_name("A.txt", at), "A (conflict 2024-05-01 101500).txt");
        assert_eq!(conflict_name("Makefile", at), "Makefile (conflict 2024-05-01 101500)");
    }

    #[test]
    fn parses_policies() {
        assert_eq!("keep-both".parse(), Ok(ConflictPolicy::KeepBoth));
        assert_eq!("LAST_WRITER_WINS".parse(), Ok(ConflictPolicy::LastWriterWins));
        assert_eq!("manual".parse(), Ok(ConflictPolicy::Manual));
        assert!("coin-flip".parse::<ConflictPolicy>().is_err());
    }

    #[test]
    fn last_writer_wins_by_mtime() {
        let lww = LastWriterWinsResolver;
        assert_eq!(
            lww.decide(&conflicted(Some(20), Some(10))),
            Some(Resolution::KeepLocal)
        );
        assert_eq!(
            lww.decide(&conflicted(Some(10), Some(20))),
            Some(Resolution::KeepRemote)
        );
        assert_eq!(
            lww.decide(&conflicted(Some(10), None)),
            Some(Resolution::KeepBoth)
        );
    }

    #[test]
    fn manual_never_decides() {
        assert_eq!(ManualResolver.decide(&conflicted(None, None)), None);
        assert_eq!(
            resolver_for(ConflictPolicy::default()).decide(&conflicted(None, None)),
            Some(Resolution::KeepBoth)
        );
    }
}
