use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::conflict;
use super::engine::{EngineError, EngineShared};
use super::local_detector::Detected;
use super::local_fs::RawLocalEvent;
use super::paths;
use super::store::SyncStatus;

/// Upper bound of raw events detected and applied in one reconciler pass.
const LOCAL_BATCH: usize = 256;

/// Tasks of a started engine.
pub(super) struct Running {
    cancel: CancellationToken,
    tasks: Vec<(String, JoinHandle<()>)>,
    _watch: Box<dyn Send>,
}

/// Brings a stopped engine up: stale claims are released, the root is
/// registered, live events are subscribed before the differential scan so
/// nothing changed during the scan is missed, then the loops are spawned.
pub(super) async fn launch(shared: &Arc<EngineShared>) -> Result<Running, EngineError> {
    let released = shared
        .store
        .release_all_claims(Some("interrupted before completion"))
        .await?;
    if released > 0 {
        tracing::warn!(released, "released claims left by a previous run");
    }
    shared.store.ensure_root(&shared.config.remote_root_id).await?;

    let watch = shared.fs.watch().await?;
    *shared.backlog.lock() = watch.backlog.clone();
    shared.rescan(paths::ROOT).await?;

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();
    tasks.push((
        "local-events".to_string(),
        tokio::spawn(local_loop(
            shared.clone(),
            watch.events,
            watch.backlog,
            cancel.clone(),
        )),
    ));
    tasks.push((
        "remote-poll".to_string(),
        tokio::spawn(remote_loop(shared.clone(), cancel.clone())),
    ));
    tasks.push((
        "conflicts".to_string(),
        tokio::spawn(resolver_loop(shared.clone(), cancel.clone())),
    ));
    for n in 0..shared.config.workers.max(1) {
        let name = format!("worker-{n}");
        tasks.push((
            name.clone(),
            tokio::spawn(worker_loop(shared.clone(), name, cancel.clone())),
        ));
    }
    if shared.config.rescan_interval.is_some() {
        tasks.push((
            "rescan".to_string(),
            tokio::spawn(rescan_loop(shared.clone(), cancel.clone())),
        ));
    }

    Ok(Running {
        cancel,
        tasks,
        _watch: watch.guard,
    })
}

/// Cancels the loops, gives them the grace period to finish the record at
/// hand and aborts the rest. Claims of aborted work are released so those
/// records stay pending; failing to do so is the only fatal stop error.
pub(super) async fn shutdown(shared: &EngineShared, running: Running) -> Result<(), EngineError> {
    let Running {
        cancel,
        tasks,
        _watch: watch,
    } = running;
    cancel.cancel();

    let deadline = Instant::now() + shared.config.grace_period;
    let mut aborted = 0;
    for (name, mut handle) in tasks {
        if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
            tracing::warn!(task = %name, "task did not stop in time, aborting");
            handle.abort();
            // Claims are released only once the aborted task is gone.
            let _ = handle.await;
            aborted += 1;
        }
    }

    let released = shared
        .store
        .release_all_claims(Some("interrupted by engine stop"))
        .await?;
    if aborted > 0 || released > 0 {
        tracing::info!(aborted, released, "engine stop interrupted work");
    }
    drop(watch);
    *shared.backlog.lock() = Arc::new(AtomicUsize::new(0));
    Ok(())
}

async fn local_loop(
    shared: Arc<EngineShared>,
    mut events: mpsc::UnboundedReceiver<RawLocalEvent>,
    backlog: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    let mut rescans = shared.rescans.lock().await;
    loop {
        let mut raw = Vec::new();
        let mut scopes = Vec::new();
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(event) = events.recv() => raw.push(event),
            Some(scope) = rescans.recv() => scopes.push(scope),
            else => break,
        }
        while raw.len() < LOCAL_BATCH {
            match events.try_recv() {
                Ok(event) => raw.push(event),
                Err(_) => break,
            }
        }

        let taken = raw.len();
        let mut batch = Vec::with_capacity(taken);
        for event in raw {
            match shared.local.detect(event).await {
                Ok(Detected::Event(event)) => batch.push(event),
                Ok(Detected::Rescan(scope)) => scopes.push(scope),
                Ok(Detected::Nothing) => {}
                Err(err) => tracing::warn!(error = %err, "failed to inspect local change"),
            }
        }
        if !batch.is_empty()
            && let Err(err) = shared.reconciler.apply_local_batch(batch).await
        {
            tracing::error!(error = %err, "failed to apply local changes");
        }

        scopes.sort();
        scopes.dedup();
        for scope in scopes {
            if let Err(err) = shared.rescan(&scope).await {
                tracing::warn!(scope, error = %err, "rescan failed");
            }
        }
        backlog.fetch_sub(taken, Ordering::SeqCst);
        shared.work.notify_waiters();
    }
}

async fn remote_loop(shared: Arc<EngineShared>, cancel: CancellationToken) {
    loop {
        match shared.remote.poll().await {
            Ok(0) => {}
            Ok(changes) => {
                tracing::debug!(changes, "remote changes applied");
                shared.work.notify_waiters();
            }
            Err(err) => tracing::warn!(error = %err, "remote poll failed"),
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = shared.poll_now.notified() => {}
            _ = tokio::time::sleep(shared.config.poll_interval) => {}
        }
    }
}

async fn resolver_loop(shared: Arc<EngineShared>, cancel: CancellationToken) {
    loop {
        match resolve_pending(&shared).await {
            Ok(0) => {}
            Ok(_) => shared.work.notify_waiters(),
            Err(err) => tracing::warn!(error = %err, "conflict resolution failed"),
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = shared.work.notified() => {}
            _ = tokio::time::sleep(shared.config.worker_idle) => {}
        }
    }
}

async fn resolve_pending(shared: &EngineShared) -> Result<usize, EngineError> {
    let mut resolved = 0;
    for record in shared.store.list_by_status(SyncStatus::Conflicted).await? {
        let Some(resolution) = shared.resolver.decide(&record) else {
            continue;
        };
        let _gate = shared.reconciler.lock().await;
        // Re-read under the gate; a reconciler pass may have moved it on.
        let Some(current) = shared
            .store
            .get(record.id)
            .await?
            .filter(|r| r.status == SyncStatus::Conflicted && r.claimed_by.is_none())
        else {
            continue;
        };
        conflict::apply_resolution(&shared.store, shared.fs.as_ref(), &current, resolution)
            .await?;
        resolved += 1;
    }
    Ok(resolved)
}

async fn worker_loop(shared: Arc<EngineShared>, name: String, cancel: CancellationToken) {
    loop {
        match shared.processor.drain(&name, &cancel).await {
            Ok(0) => {}
            Ok(processed) => {
                tracing::debug!(worker = %name, processed, "drained ready records");
                shared.work.notify_waiters();
            }
            Err(err) => tracing::error!(worker = %name, error = %err, "store failure in worker"),
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = shared.work.notified() => {}
            _ = tokio::time::sleep(shared.config.worker_idle) => {}
        }
    }
}

async fn rescan_loop(shared: Arc<EngineShared>, cancel: CancellationToken) {
    let Some(interval) = shared.config.rescan_interval else {
        return;
    };
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        if let Err(err) = shared.rescan(paths::ROOT).await {
            tracing::warn!(error = %err, "periodic rescan failed");
        }
    }
}
