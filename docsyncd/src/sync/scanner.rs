use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use super::error::SyncError;
use super::filters::IgnoreRules;
use super::local_detector::LocalEvent;
use super::local_fs::{LocalEntry, LocalFs};
use super::paths;
use super::store::{PairRecord, PairStore};

/// Compares a local subtree with the store and reports the differences as
/// [`LocalEvent`]s. Used at startup, after watcher overflows and when a
/// client asks for a rescan.
///
/// Events are ordered so they can be applied one by one: moves (shallow
/// targets first), deletions, modifications, then creations (shallow first).
pub struct Scanner {
    store: Arc<PairStore>,
    fs: Arc<dyn LocalFs>,
    rules: IgnoreRules,
}

#[derive(Default)]
struct Classified {
    moves: Vec<(String, LocalEntry)>,
    modified: Vec<LocalEntry>,
    created: Vec<LocalEntry>,
    explained: HashSet<String>,
}

impl Scanner {
    pub fn new(store: Arc<PairStore>, fs: Arc<dyn LocalFs>, rules: IgnoreRules) -> Self {
        Self { store, fs, rules }
    }

    pub async fn scan(&self, scope: &str) -> Result<Vec<LocalEvent>, SyncError> {
        let entries = self.walk(scope).await?;
        let known: HashMap<String, PairRecord> = self
            .store
            .list_in_scope(scope)
            .await?
            .into_iter()
            .filter(|r| r.local_path.as_deref() != Some(paths::ROOT))
            .filter_map(|r| r.local_path.clone().map(|path| (path, r)))
            .collect();
        let on_disk: HashMap<&str, &LocalEntry> =
            entries.iter().map(|e| (e.path.as_str(), e)).collect();

        let mut tagged: HashMap<&str, Vec<&LocalEntry>> = HashMap::new();
        for entry in &entries {
            if let Some(tag) = entry.tag.as_deref() {
                tagged.entry(tag).or_default().push(entry);
            }
        }

        let mut found = Classified::default();
        for entry in &entries {
            self.classify(entry, &known, &on_disk, &tagged, &mut found)
                .await?;
        }

        let mut events = Vec::new();

        found
            .moves
            .sort_by_key(|(_, entry)| paths::depth(&entry.path));
        let moves = found.moves.clone();
        for (from, entry) in found.moves {
            let implied = moves.iter().any(|(parent_from, parent)| {
                paths::is_within(&from, parent_from)
                    && from != *parent_from
                    && entry.path == format!("{}{}", parent.path, &from[parent_from.len()..])
            });
            if !implied {
                events.push(LocalEvent::Moved { from, entry });
            }
        }

        let mut gone: Vec<&String> = known
            .keys()
            .filter(|path| !on_disk.contains_key(path.as_str()) && !found.explained.contains(*path))
            .collect();
        gone.sort_by_key(|path| paths::depth(path));
        let mut deleted: Vec<String> = Vec::new();
        for path in gone {
            if deleted.iter().any(|d| paths::is_within(path, d)) {
                continue;
            }
            deleted.push(path.clone());
        }
        events.extend(deleted.into_iter().map(LocalEvent::Deleted));

        events.extend(found.modified.into_iter().map(LocalEvent::Modified));

        found.created.sort_by_key(|entry| paths::depth(&entry.path));
        let mut created_folders: Vec<String> = Vec::new();
        for entry in found.created {
            if created_folders
                .iter()
                .any(|folder| paths::is_within(&entry.path, folder))
            {
                continue;
            }
            if entry.is_folder() {
                created_folders.push(entry.path.clone());
            }
            events.push(LocalEvent::Created(entry));
        }

        tracing::debug!(scope, events = events.len(), "scan finished");
        Ok(events)
    }

    async fn classify(
        &self,
        entry: &LocalEntry,
        known: &HashMap<String, PairRecord>,
        on_disk: &HashMap<&str, &LocalEntry>,
        tagged: &HashMap<&str, Vec<&LocalEntry>>,
        found: &mut Classified,
    ) -> Result<(), SyncError> {
        if let Some(tag) = entry.tag.as_deref()
            && let Some(record) = self.store.find_by_local_tag(tag).await?
        {
            let Some(old) = record.local_path.clone() else {
                // Restored after a delete; the reconciler revives the record by tag.
                found.created.push(entry.clone());
                return Ok(());
            };
            if old == entry.path {
                if record.local_fingerprint != entry.fingerprint || record.kind != entry.kind {
                    found.modified.push(entry.clone());
                }
                return Ok(());
            }
            let original_alive = match on_disk.get(old.as_str()) {
                Some(there) => there.tag.as_deref() == Some(tag),
                None if known.contains_key(&old) => false,
                None => self.fs.read_tag(&old).await?.as_deref() == Some(tag),
            };
            let candidates = tagged.get(tag).map(Vec::as_slice).unwrap_or_default();
            let is_target = move_target(&record, candidates)
                .is_some_and(|target| target.path == entry.path);
            if !original_alive && is_target {
                found.explained.insert(old.clone());
                found.moves.push((old, entry.clone()));
                return Ok(());
            }
            let mut copy = entry.clone();
            copy.tag = None;
            found.created.push(copy);
            return Ok(());
        }

        match known.get(&entry.path) {
            Some(record) if record.kind == entry.kind => {
                if record.local_tag != entry.tag || record.local_fingerprint != entry.fingerprint {
                    found.modified.push(entry.clone());
                }
            }
            _ => found.created.push(entry.clone()),
        }
        Ok(())
    }

    async fn walk(&self, scope: &str) -> Result<Vec<LocalEntry>, SyncError> {
        let mut entries = Vec::new();
        if scope != paths::ROOT {
            match self.fs.stat(scope).await? {
                Some(entry) if !self.rules.is_ignored_path(scope) => entries.push(entry),
                _ => return Ok(entries),
            }
            if !entries[0].is_folder() {
                return Ok(entries);
            }
        }

        let mut folders = VecDeque::from([scope.to_string()]);
        while let Some(folder) = folders.pop_front() {
            let children = match self.fs.list(&folder).await {
                Ok(children) => children,
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err.into()),
            };
            for child in children {
                if self.rules.is_ignored_path(&child.path) {
                    continue;
                }
                if child.is_folder() {
                    folders.push_back(child.path.clone());
                }
                entries.push(child);
            }
        }
        Ok(entries)
    }
}

/// Picks which of the objects carrying a record's tag is the record itself:
/// the one at its own path, then the one with the same file id, then the
/// first by path. Every other candidate is a copy.
fn move_target<'a>(record: &PairRecord, candidates: &[&'a LocalEntry]) -> Option<&'a LocalEntry> {
    let mut candidates: Vec<&'a LocalEntry> = candidates
        .iter()
        .copied()
        .filter(|entry| entry.kind == record.kind)
        .collect();
    candidates.sort_by(|a, b| a.path.cmp(&b.path));
    let own = candidates
        .iter()
        .copied()
        .find(|entry| record.local_path.as_deref() == Some(entry.path.as_str()));
    let same_file = || {
        candidates
            .iter()
            .copied()
            .find(|entry| record.local_file_id.is_some() && entry.file_id == record.local_file_id)
    };
    own.or_else(same_file)
        .or_else(|| candidates.first().copied())
}
