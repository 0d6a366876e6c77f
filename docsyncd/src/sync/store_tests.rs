use super::*;

async fn make_store() -> PairStore {
    PairStore::open_memory().await.unwrap()
}

fn synced_file(path: &str, parent_id: i64, remote_id: &str, fp: &str) -> PairRecord {
    let mut record = PairRecord::draft(paths::file_name(path), ItemKind::File);
    record.local_path = Some(path.to_string());
    record.parent_id = Some(parent_id);
    record.depth = paths::depth(path);
    record.local_tag = Some(format!("tag-{remote_id}"));
    record.local_fingerprint = Some(fp.to_string());
    record.remote_id = Some(remote_id.to_string());
    record.remote_parent_id = Some("root".to_string());
    record.remote_name = Some(record.name.clone());
    record.remote_fingerprint = Some(fp.to_string());
    record.remote_version = Some("1".to_string());
    record.synced_fingerprint = Some(fp.to_string());
    record
}

fn local_folder(path: &str, parent_id: i64) -> PairRecord {
    let mut record = PairRecord::draft(paths::file_name(path), ItemKind::Folder);
    record.local_path = Some(path.to_string());
    record.parent_id = Some(parent_id);
    record.depth = paths::depth(path);
    record.local_change = Some(ChangeKind::Created);
    record
}

#[tokio::test]
async fn ensure_root_is_idempotent_and_bound() {
    let store = make_store().await;
    let root = store.ensure_root("root").await.unwrap();
    let again = store.ensure_root("root").await.unwrap();

    assert_eq!(root.id, again.id);
    assert_eq!(root.local_path.as_deref(), Some("/"));
    assert_eq!(root.status, SyncStatus::Synchronized);
    assert!(matches!(
        store.ensure_root("other").await,
        Err(StoreError::RootMismatch { .. })
    ));
}

#[tokio::test]
async fn insert_and_lookup_by_path_tag_and_remote_id() {
    let store = make_store().await;
    let root = store.ensure_root("root").await.unwrap();
    let inserted = store
        .insert(&synced_file("/a.txt", root.id, "r1", "aa"))
        .await
        .unwrap();

    assert_eq!(inserted.status, SyncStatus::Synchronized);
    assert_eq!(
        store.find_by_local_path("/a.txt").await.unwrap(),
        Some(inserted.clone())
    );
    assert_eq!(
        store.find_by_remote_id("r1").await.unwrap().map(|r| r.id),
        Some(inserted.id)
    );
    assert_eq!(
        store.find_by_local_tag("tag-r1").await.unwrap().map(|r| r.id),
        Some(inserted.id)
    );
}

#[tokio::test]
async fn diverging_content_changes_conflict() {
    let store = make_store().await;
    let root = store.ensure_root("root").await.unwrap();
    let record = store
        .insert(&synced_file("/a.txt", root.id, "r1", "aa"))
        .await
        .unwrap();

    let updated = store
        .modify(record.id, |r| {
            r.local_fingerprint = Some("bb".into());
            r.local_change = Some(ChangeKind::Modified);
            r.remote_fingerprint = Some("cc".into());
            r.remote_change = Some(ChangeKind::Modified);
        })
        .await
        .unwrap()
        .unwrap();

    assert_eq!(updated.status, SyncStatus::Conflicted);
}

#[tokio::test]
async fn identical_content_changes_converge() {
    let store = make_store().await;
    let root = store.ensure_root("root").await.unwrap();
    let record = store
        .insert(&synced_file("/a.txt", root.id, "r1", "aa"))
        .await
        .unwrap();

    let updated = store
        .modify(record.id, |r| {
            r.local_fingerprint = Some("bb".into());
            r.local_change = Some(ChangeKind::Modified);
            r.remote_fingerprint = Some("bb".into());
            r.remote_change = Some(ChangeKind::Modified);
        })
        .await
        .unwrap()
        .unwrap();

    assert_eq!(updated.status, SyncStatus::Synchronized);
    assert_eq!(updated.synced_fingerprint.as_deref(), Some("bb"));
    assert_eq!(updated.local_change, None);
    assert_eq!(updated.remote_change, None);
}

#[tokio::test]
async fn fingerprint_drift_is_detected_without_a_hint() {
    let store = make_store().await;
    let root = store.ensure_root("root").await.unwrap();
    let record = store
        .insert(&synced_file("/a.txt", root.id, "r1", "aa"))
        .await
        .unwrap();

    let updated = store
        .modify(record.id, |r| r.local_fingerprint = Some("bb".into()))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(updated.local_change, Some(ChangeKind::Modified));
    assert_eq!(updated.status, SyncStatus::LocallyChanged);
}

#[tokio::test]
async fn move_record_rewrites_descendants() {
    let store = make_store().await;
    let root = store.ensure_root("root").await.unwrap();
    let a1 = store.insert(&local_folder("/a1", root.id)).await.unwrap();
    let a2 = store.insert(&local_folder("/a2", root.id)).await.unwrap();
    let sub = store.insert(&local_folder("/a1/sub", a1.id)).await.unwrap();
    let file = store
        .insert(&synced_file("/a1/sub/x.txt", sub.id, "rx", "aa"))
        .await
        .unwrap();

    let moved = store
        .move_record(a1.id, "/a2/a1", a2.id)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(moved.local_path.as_deref(), Some("/a2/a1"));
    assert_eq!(moved.depth, 2);
    let file = store.get(file.id).await.unwrap().unwrap();
    assert_eq!(file.local_path.as_deref(), Some("/a2/a1/sub/x.txt"));
    assert_eq!(file.depth, 4);
    let sub = store.get(sub.id).await.unwrap().unwrap();
    assert_eq!(sub.local_path.as_deref(), Some("/a2/a1/sub"));
    assert!(store.find_by_local_path("/a1").await.unwrap().is_none());

    let again = store
        .move_record(a1.id, "/a2/a1", a2.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.local_path, moved.local_path);
}

#[tokio::test]
async fn move_record_evicts_previous_holder() {
    let store = make_store().await;
    let root = store.ensure_root("root").await.unwrap();
    let old = store
        .insert(&synced_file("/a.txt", root.id, "r1", "aa"))
        .await
        .unwrap();
    let new = store
        .insert(&synced_file("/b.txt", root.id, "r2", "bb"))
        .await
        .unwrap();

    store.move_record(new.id, "/a.txt", root.id).await.unwrap();

    let old = store.get(old.id).await.unwrap().unwrap();
    assert_eq!(old.local_path, None);
    assert_eq!(old.local_change, Some(ChangeKind::Deleted));
    let new = store.find_by_local_path("/a.txt").await.unwrap().unwrap();
    assert_eq!(new.remote_id.as_deref(), Some("r2"));
}

#[tokio::test]
async fn locally_deleted_subtree_forgets_unpublished_records() {
    let store = make_store().await;
    let root = store.ensure_root("root").await.unwrap();
    let mut folder = local_folder("/a1", root.id);
    folder.remote_id = Some("rf".into());
    folder.local_change = None;
    let folder = store.insert(&folder).await.unwrap();
    let published = store
        .insert(&synced_file("/a1/x.txt", folder.id, "rx", "aa"))
        .await
        .unwrap();
    let mut unpublished = PairRecord::draft("y.txt", ItemKind::File);
    unpublished.local_path = Some("/a1/y.txt".into());
    unpublished.parent_id = Some(folder.id);
    unpublished.depth = 2;
    unpublished.local_fingerprint = Some("bb".into());
    unpublished.local_change = Some(ChangeKind::Created);
    let unpublished = store.insert(&unpublished).await.unwrap();

    store.mark_locally_deleted(folder.id).await.unwrap();

    assert!(store.get(unpublished.id).await.unwrap().is_none());
    let published = store.get(published.id).await.unwrap().unwrap();
    assert_eq!(published.local_path, None);
    assert_eq!(published.local_change, Some(ChangeKind::Deleted));
    assert_eq!(published.status, SyncStatus::LocallyChanged);
    let folder = store.get(folder.id).await.unwrap().unwrap();
    assert_eq!(folder.local_change, Some(ChangeKind::Deleted));
}

#[tokio::test]
async fn claims_follow_dependency_order() {
    let store = make_store().await;
    let root = store.ensure_root("root").await.unwrap();
    let folder = store.insert(&local_folder("/a1", root.id)).await.unwrap();
    let mut child = PairRecord::draft("x.txt", ItemKind::File);
    child.local_path = Some("/a1/x.txt".into());
    child.parent_id = Some(folder.id);
    child.depth = 2;
    child.local_fingerprint = Some("aa".into());
    child.local_change = Some(ChangeKind::Created);
    let child = store.insert(&child).await.unwrap();

    let first = store.claim_next_ready("w1", now_millis()).await.unwrap().unwrap();
    assert_eq!(first.id, folder.id);
    assert_eq!(first.claimed_by.as_deref(), Some("w1"));
    assert!(store
        .claim_next_ready("w2", now_millis())
        .await
        .unwrap()
        .is_none());

    let applied = Applied {
        expected_version: first.row_version,
        clear_local: true,
        remote: Some(RemoteDescriptor {
            remote_id: "rf".into(),
            parent_id: Some("root".into()),
            name: "a1".into(),
            kind: ItemKind::Folder,
            fingerprint: None,
            version: "1".into(),
            mtime: None,
        }),
        ..Applied::default()
    };
    let synced = store
        .mark_synchronized(folder.id, &applied)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(synced.status, SyncStatus::Synchronized);

    let next = store.claim_next_ready("w2", now_millis()).await.unwrap().unwrap();
    assert_eq!(next.id, child.id);
}

#[tokio::test]
async fn upsert_inserts_then_overwrites_with_derived_status() {
    let store = make_store().await;
    let root = store.ensure_root("root").await.unwrap();
    let inserted = store
        .upsert(&synced_file("/a.txt", root.id, "r1", "aa"))
        .await
        .unwrap();
    assert_eq!(inserted.status, SyncStatus::Synchronized);

    let mut edited = inserted.clone();
    edited.local_fingerprint = Some("bb".into());
    let overwritten = store.upsert(&edited).await.unwrap();

    assert_eq!(overwritten.id, inserted.id);
    assert_eq!(overwritten.status, SyncStatus::LocallyChanged);
    assert_eq!(overwritten.local_change, Some(ChangeKind::Modified));
    assert!(overwritten.row_version > inserted.row_version);
    assert_eq!(store.counts().await.unwrap().total, 2);
}

fn remote_only(name: &str, parent_id: i64, remote_id: &str) -> PairRecord {
    let mut record = PairRecord::draft(name, ItemKind::File);
    record.parent_id = Some(parent_id);
    record.depth = 1;
    record.remote_id = Some(remote_id.to_string());
    record.remote_name = Some(name.to_string());
    record.remote_fingerprint = Some("ff".into());
    record.remote_change = Some(ChangeKind::Created);
    record
}

#[tokio::test]
async fn pending_records_list_ancestors_first_then_path_then_id() {
    let store = make_store().await;
    let root = store.ensure_root("root").await.unwrap();
    let b = store.insert(&local_folder("/b", root.id)).await.unwrap();
    store.insert(&local_folder("/b/sub", b.id)).await.unwrap();
    let a = store.insert(&local_folder("/a", root.id)).await.unwrap();
    for name in ["z.txt", "c.txt"] {
        let mut file = PairRecord::draft(name, ItemKind::File);
        file.local_path = Some(format!("/a/{name}"));
        file.parent_id = Some(a.id);
        file.depth = 2;
        file.local_fingerprint = Some("aa".into());
        file.local_change = Some(ChangeKind::Created);
        store.insert(&file).await.unwrap();
    }
    store
        .insert(&synced_file("/s.txt", root.id, "rs", "aa"))
        .await
        .unwrap();
    let first = store.insert(&remote_only("r.txt", root.id, "r1")).await.unwrap();
    let second = store.insert(&remote_only("r.txt", root.id, "r2")).await.unwrap();

    store.move_record(b.id, "/a/b", a.id).await.unwrap().unwrap();

    let pending = store.list_pending().await.unwrap();
    let order: Vec<(i64, String)> = pending
        .iter()
        .map(|r| (r.id, r.local_path.clone().unwrap_or_else(|| r.name.clone())))
        .collect();
    let labels: Vec<&str> = order.iter().map(|(_, label)| label.as_str()).collect();
    assert_eq!(
        labels,
        vec!["/a", "r.txt", "r.txt", "/a/b", "/a/c.txt", "/a/z.txt", "/a/b/sub"]
    );
    assert_eq!(order[1].0, first.id);
    assert_eq!(order[2].0, second.id);

    let claimed = store.claim_next_ready("w1", now_millis()).await.unwrap().unwrap();
    assert_eq!(claimed.id, a.id);
}

#[tokio::test]
async fn stale_apply_keeps_newer_change() {
    let store = make_store().await;
    let root = store.ensure_root("root").await.unwrap();
    let record = store
        .insert(&synced_file("/a.txt", root.id, "r1", "aa"))
        .await
        .unwrap();
    let claimed = store
        .modify(record.id, |r| {
            r.local_fingerprint = Some("bb".into());
            r.local_change = Some(ChangeKind::Modified);
        })
        .await
        .unwrap()
        .unwrap();
    store
        .modify(record.id, |r| r.local_fingerprint = Some("cc".into()))
        .await
        .unwrap();

    let applied = Applied {
        expected_version: claimed.row_version,
        clear_local: true,
        synced_fingerprint: Some("bb".into()),
        remote: Some(RemoteDescriptor {
            remote_id: "r1".into(),
            parent_id: Some("root".into()),
            name: "a.txt".into(),
            kind: ItemKind::File,
            fingerprint: Some("bb".into()),
            version: "2".into(),
            mtime: None,
        }),
        ..Applied::default()
    };
    let after = store
        .mark_synchronized(record.id, &applied)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(after.local_change, Some(ChangeKind::Modified));
    assert_eq!(after.status, SyncStatus::LocallyChanged);
}

#[tokio::test]
async fn failures_retry_then_error() {
    let store = make_store().await;
    let root = store.ensure_root("root").await.unwrap();
    let folder = store.insert(&local_folder("/a1", root.id)).await.unwrap();

    let retried = store
        .mark_failed(folder.id, "timeout", Some(now_millis() + 60_000))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(retried.retry_count, 1);
    assert_eq!(retried.status, SyncStatus::LocallyChanged);
    assert!(store
        .claim_next_ready("w1", now_millis())
        .await
        .unwrap()
        .is_none());

    let failed = store
        .mark_failed(folder.id, "rejected", None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.status, SyncStatus::Error);
    assert_eq!(store.last_error().await.unwrap().as_deref(), Some("rejected"));

    let counts = store.counts().await.unwrap();
    assert_eq!(counts.errors, 1);
    assert_eq!(counts.total, 2);
}

#[tokio::test]
async fn release_all_claims_notes_interruption() {
    let store = make_store().await;
    let root = store.ensure_root("root").await.unwrap();
    let folder = store.insert(&local_folder("/a1", root.id)).await.unwrap();
    store.claim_next_ready("w1", now_millis()).await.unwrap();

    let released = store
        .release_all_claims(Some("interrupted by shutdown"))
        .await
        .unwrap();

    assert_eq!(released, 1);
    let folder = store.get(folder.id).await.unwrap().unwrap();
    assert_eq!(folder.claimed_by, None);
    assert_eq!(folder.last_error.as_deref(), Some("interrupted by shutdown"));
    assert_eq!(store.counts().await.unwrap().claimed, 0);
}

#[tokio::test]
async fn checkpoint_and_conflict_log_persist() {
    let store = make_store().await;
    assert_eq!(store.checkpoint().await.unwrap(), None);
    store.set_checkpoint("7").await.unwrap();
    store.set_checkpoint("8").await.unwrap();
    assert_eq!(store.checkpoint().await.unwrap().as_deref(), Some("8"));

    store
        .record_conflict(None, "/a.txt", "/a (conflict).txt", Some("r1"), "both edited")
        .await
        .unwrap();
    let conflicts = store.list_conflicts().await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].renamed_local, "/a (conflict).txt");
}

#[tokio::test]
async fn file_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("state").join("state.db");
    {
        let store = PairStore::open(&db_path).await.unwrap();
        store.ensure_root("root").await.unwrap();
        store.set_checkpoint("42").await.unwrap();
    }
    let store = PairStore::open(&db_path).await.unwrap();
    assert_eq!(store.checkpoint().await.unwrap().as_deref(), Some("42"));
    assert!(store.find_by_local_path("/").await.unwrap().is_some());
}
