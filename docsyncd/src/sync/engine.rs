use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc};
use tokio::time::Instant;

use super::conflict::{self, ConflictResolver, Resolution};
use super::config::EngineConfig;
use super::error::SyncError;
use super::lifecycle::{self, Running};
use super::local_detector::LocalDetector;
use super::local_fs::{LocalFs, LocalFsError};
use super::processor::Processor;
use super::reconciler::Reconciler;
use super::remote::RemoteClient;
use super::remote_detector::{FolderCheck, RemoteDetector};
use super::scanner::Scanner;
use super::store::{ConflictEntry, PairRecord, PairStore, StoreCounts, StoreError, SyncStatus};

const WAIT_STEP: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine is {actual}, expected {expected}")]
    InvalidState {
        expected: EngineState,
        actual: EngineState,
    },
    #[error("not synchronized after {0:?}")]
    Timeout(Duration),
    #[error("no conflicted record with id {0}")]
    UnknownConflict(i64),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Local(#[from] LocalFsError),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EngineState::Stopped => "stopped",
            EngineState::Starting => "starting",
            EngineState::Running => "running",
            EngineState::Stopping => "stopping",
        })
    }
}

/// Snapshot for hosts that show "syncing", "up to date" or "N items failed".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    pub state: EngineState,
    pub counts: StoreCounts,
    pub last_error: Option<String>,
    /// Live local events not applied yet.
    pub backlog: usize,
}

impl EngineStatus {
    pub fn is_synchronized(&self) -> bool {
        self.counts.unsynchronized() == 0 && self.counts.claimed == 0 && self.backlog == 0
    }
}

/// Everything the engine tasks share. Owned through an `Arc`; no globals,
/// so several engines can live in one process.
pub(super) struct EngineShared {
    pub(super) config: EngineConfig,
    pub(super) store: Arc<PairStore>,
    pub(super) fs: Arc<dyn LocalFs>,
    pub(super) local: LocalDetector,
    pub(super) scanner: Scanner,
    pub(super) reconciler: Arc<Reconciler>,
    pub(super) remote: RemoteDetector,
    pub(super) processor: Processor,
    pub(super) resolver: Arc<dyn ConflictResolver>,
    pub(super) rescans: AsyncMutex<mpsc::UnboundedReceiver<String>>,
    pub(super) backlog: parking_lot::Mutex<Arc<AtomicUsize>>,
    pub(super) state: parking_lot::Mutex<EngineState>,
    /// Wakes idle workers and the resolver.
    pub(super) work: Notify,
    pub(super) poll_now: Notify,
}

impl EngineShared {
    pub(super) fn set_state(&self, state: EngineState) {
        *self.state.lock() = state;
        tracing::debug!(%state, "engine state changed");
    }

    fn backlog(&self) -> usize {
        self.backlog.lock().load(Ordering::SeqCst)
    }

    /// Scans `scope` and applies the differences. Returns the number of
    /// events found.
    pub(super) async fn rescan(&self, scope: &str) -> Result<usize, SyncError> {
        let events = self.scanner.scan(scope).await?;
        let found = events.len();
        if found > 0 {
            tracing::info!(scope, events = found, "scan found local changes");
            self.reconciler.apply_local_batch(events).await?;
            self.work.notify_waiters();
        }
        Ok(found)
    }
}

/// Keeps one local folder and one remote folder consistent.
pub struct SyncEngine {
    shared: Arc<EngineShared>,
    running: AsyncMutex<Option<Running>>,
}

impl SyncEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<PairStore>,
        fs: Arc<dyn LocalFs>,
        remote: Arc<dyn RemoteClient>,
    ) -> Self {
        let rules = config.ignore.clone();
        let reconciler = Arc::new(Reconciler::new(store.clone(), fs.clone(), rules.clone()));
        let (rescan_tx, rescan_rx) = mpsc::unbounded_channel();
        let processor = Processor::new(
            store.clone(),
            fs.clone(),
            remote.clone(),
            reconciler.clone(),
        )
        .with_retry(config.backoff(), config.max_retries)
        .with_rescans(rescan_tx);
        let shared = EngineShared {
            local: LocalDetector::new(fs.clone(), rules.clone()),
            scanner: Scanner::new(store.clone(), fs.clone(), rules),
            remote: RemoteDetector::new(
                store.clone(),
                remote,
                reconciler.clone(),
                config.remote_root_id.clone(),
            ),
            resolver: conflict::resolver_for(config.conflict_policy),
            processor,
            reconciler,
            rescans: AsyncMutex::new(rescan_rx),
            backlog: parking_lot::Mutex::new(Arc::new(AtomicUsize::new(0))),
            state: parking_lot::Mutex::new(EngineState::Stopped),
            work: Notify::new(),
            poll_now: Notify::new(),
            config,
            store,
            fs,
        };
        Self {
            shared: Arc::new(shared),
            running: AsyncMutex::new(None),
        }
    }

    pub fn state(&self) -> EngineState {
        *self.shared.state.lock()
    }

    pub async fn start(&self) -> Result<(), EngineError> {
        let mut running = self.running.lock().await;
        {
            let mut state = self.shared.state.lock();
            if *state != EngineState::Stopped {
                return Err(EngineError::InvalidState {
                    expected: EngineState::Stopped,
                    actual: *state,
                });
            }
            *state = EngineState::Starting;
        }
        match lifecycle::launch(&self.shared).await {
            Ok(tasks) => {
                *running = Some(tasks);
                self.shared.set_state(EngineState::Running);
                tracing::info!(
                    workers = self.shared.config.workers,
                    remote_root = %self.shared.config.remote_root_id,
                    "sync engine started"
                );
                Ok(())
            }
            Err(err) => {
                self.shared.set_state(EngineState::Stopped);
                tracing::error!(error = %err, "sync engine failed to start");
                Err(err)
            }
        }
    }

    /// Stopping a stopped engine does nothing.
    pub async fn stop(&self) -> Result<(), EngineError> {
        let mut running = self.running.lock().await;
        let Some(tasks) = running.take() else {
            return Ok(());
        };
        self.shared.set_state(EngineState::Stopping);
        let result = lifecycle::shutdown(&self.shared, tasks).await;
        self.shared.set_state(EngineState::Stopped);
        match &result {
            Ok(()) => tracing::info!("sync engine stopped"),
            Err(err) => tracing::error!(error = %err, "sync engine stopped uncleanly"),
        }
        result
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        Ok(EngineStatus {
            state: self.state(),
            counts: self.shared.store.counts().await?,
            last_error: self.shared.store.last_error().await?,
            backlog: self.shared.backlog(),
        })
    }

    pub async fn is_synchronized(&self) -> Result<bool, EngineError> {
        Ok(self.status().await?.is_synchronized())
    }

    /// Records waiting for an operation, a conflict decision or a retry.
    pub async fn pending_count(&self) -> Result<i64, EngineError> {
        Ok(self.shared.store.counts().await?.unsynchronized())
    }

    pub async fn last_error(&self) -> Result<Option<String>, EngineError> {
        Ok(self.shared.store.last_error().await?)
    }

    /// Waits until both sides are consistent and a remote poll that began
    /// after this call has been applied. Expiry fails the wait only.
    pub async fn wait_sync(&self, timeout: Duration) -> Result<(), EngineError> {
        let state = self.state();
        if state != EngineState::Running {
            return Err(EngineError::InvalidState {
                expected: EngineState::Running,
                actual: state,
            });
        }
        let after = self.shared.remote.polls_started();
        let polled = self.shared.remote.subscribe();
        self.shared.poll_now.notify_one();

        let deadline = Instant::now() + timeout;
        loop {
            let polled_since = *polled.borrow() > after;
            if polled_since && self.is_synchronized().await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(EngineError::Timeout(timeout));
            }
            tokio::time::sleep(WAIT_STEP).await;
        }
    }

    /// Compares one local folder with its remote counterpart.
    pub async fn verify_folder(&self, path: &str) -> Result<FolderCheck, EngineError> {
        Ok(self
            .shared
            .remote
            .verify_folder(self.shared.fs.as_ref(), path)
            .await?)
    }

    pub async fn list_conflicts(&self) -> Result<Vec<PairRecord>, EngineError> {
        Ok(self.shared.store.list_by_status(SyncStatus::Conflicted).await?)
    }

    /// Every keep-both resolution so far.
    pub async fn conflict_log(&self) -> Result<Vec<ConflictEntry>, EngineError> {
        Ok(self.shared.store.list_conflicts().await?)
    }

    /// Resolves a conflicted record by hand. Returns the path of the renamed
    /// local copy for [`Resolution::KeepBoth`].
    pub async fn resolve_conflict(
        &self,
        id: i64,
        resolution: Resolution,
    ) -> Result<Option<String>, EngineError> {
        let renamed = {
            let _gate = self.shared.reconciler.lock().await;
            let record = self
                .shared
                .store
                .get(id)
                .await?
                .filter(|r| r.status == SyncStatus::Conflicted)
                .ok_or(EngineError::UnknownConflict(id))?;
            conflict::apply_resolution(
                &self.shared.store,
                self.shared.fs.as_ref(),
                &record,
                resolution,
            )
            .await?
        };
        self.shared.work.notify_waiters();
        Ok(renamed)
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
