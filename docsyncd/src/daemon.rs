use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use docsync_core::{DocsyncClient, TransferConfig, TransferLimits};
use thiserror::Error;

use crate::sync::config::EngineConfig;
use crate::sync::conflict::ConflictPolicy;
use crate::sync::disk_fs::DiskFs;
use crate::sync::engine::{EngineError, EngineStatus, SyncEngine};
use crate::sync::filters::IgnoreRules;
use crate::sync::fingerprint::DigestAlgorithm;
use crate::sync::remote::DocsyncRemote;
use crate::sync::store::{PairStore, StoreCounts};

const DEFAULT_SYNC_DIR_NAME: &str = "Docsync";
const DEFAULT_REMOTE_ROOT: &str = "root";
const DEFAULT_POLL_SECS: u64 = 15;
const DEFAULT_WORKER_LOOP_MS: u64 = 500;
const DEFAULT_WORKERS: u64 = 4;
const DEFAULT_MAX_RETRIES: u64 = 5;
const DEFAULT_GRACE_SECS: u64 = 5;
const DEFAULT_PAGE_SIZE: u64 = 200;
const DEFAULT_ONCE_TIMEOUT_SECS: u64 = 600;
const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("home directory is unavailable")]
    MissingHome,
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub sync_root: PathBuf,
    pub state_db: PathBuf,
    pub api_url: Option<String>,
    pub token: Option<String>,
    pub remote_root: String,
    pub poll_interval: Duration,
    pub worker_interval: Duration,
    pub rescan_interval: Option<Duration>,
    pub workers: usize,
    pub max_retries: u32,
    pub grace_period: Duration,
    pub conflict_policy: ConflictPolicy,
    pub digest: DigestAlgorithm,
    pub use_trash: bool,
    pub page_size: u32,
    pub once_timeout: Duration,
    pub extra_ignored_suffixes: Vec<String>,
}

impl DaemonConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::MissingHome)?;
        Self::from_lookup(&home, |name| std::env::var(name).ok())
    }

    /// Builds the configuration from `lookup`, which maps variable names to
    /// values the way the process environment does.
    pub fn from_lookup<F>(home: &Path, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let sync_root = var("DOCSYNC_SYNC_DIR")
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(|| home.join(DEFAULT_SYNC_DIR_NAME));
        let state_db = var("DOCSYNC_STATE_DB")
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(default_state_db);
        let conflict_policy = match var("DOCSYNC_CONFLICT_POLICY") {
            Some(value) => value.parse().map_err(|err| ConfigError::Invalid {
                name: "DOCSYNC_CONFLICT_POLICY",
                reason: format!("{err}"),
            })?,
            None => ConflictPolicy::default(),
        };
        let digest = match var("DOCSYNC_DIGEST") {
            Some(value) => DigestAlgorithm::parse(&value).map_err(|err| ConfigError::Invalid {
                name: "DOCSYNC_DIGEST",
                reason: err.to_string(),
            })?,
            None => DigestAlgorithm::default(),
        };
        let rescan_secs = read_u64(&var, "DOCSYNC_RESCAN_SECS", 0);

        Ok(Self {
            sync_root,
            state_db,
            api_url: var("DOCSYNC_API_URL"),
            token: var("DOCSYNC_TOKEN"),
            remote_root: var("DOCSYNC_REMOTE_ROOT")
                .unwrap_or_else(|| DEFAULT_REMOTE_ROOT.to_string()),
            poll_interval: Duration::from_secs(read_u64(
                &var,
                "DOCSYNC_POLL_SECS",
                DEFAULT_POLL_SECS,
            )),
            worker_interval: Duration::from_millis(read_u64(
                &var,
                "DOCSYNC_WORKER_LOOP_MS",
                DEFAULT_WORKER_LOOP_MS,
            )),
            rescan_interval: (rescan_secs > 0).then(|| Duration::from_secs(rescan_secs)),
            workers: read_count(&var, "DOCSYNC_WORKERS", DEFAULT_WORKERS)?,
            max_retries: read_count(&var, "DOCSYNC_MAX_RETRIES", DEFAULT_MAX_RETRIES)?,
            grace_period: Duration::from_secs(read_u64(
                &var,
                "DOCSYNC_GRACE_SECS",
                DEFAULT_GRACE_SECS,
            )),
            conflict_policy,
            digest,
            use_trash: read_bool(&var, "DOCSYNC_USE_TRASH", true),
            page_size: read_count(&var, "DOCSYNC_PAGE_SIZE", DEFAULT_PAGE_SIZE)?,
            once_timeout: Duration::from_secs(read_u64(
                &var,
                "DOCSYNC_ONCE_TIMEOUT_SECS",
                DEFAULT_ONCE_TIMEOUT_SECS,
            )),
            extra_ignored_suffixes: var("DOCSYNC_IGNORE_SUFFIXES")
                .map(|value| split_list(&value))
                .unwrap_or_default(),
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        let suffixes: Vec<&str> = self
            .extra_ignored_suffixes
            .iter()
            .map(String::as_str)
            .collect();
        EngineConfig {
            remote_root_id: self.remote_root.clone(),
            workers: self.workers,
            poll_interval: self.poll_interval,
            worker_idle: self.worker_interval,
            rescan_interval: self.rescan_interval,
            grace_period: self.grace_period,
            max_retries: self.max_retries,
            conflict_policy: self.conflict_policy,
            ignore: IgnoreRules::default().with_extra(&[], &suffixes),
            ..EngineConfig::default()
        }
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    engine: Arc<SyncEngine>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let api_url = config
            .api_url
            .clone()
            .ok_or(ConfigError::Missing("DOCSYNC_API_URL"))?;
        let token = config
            .token
            .clone()
            .ok_or(ConfigError::Missing("DOCSYNC_TOKEN"))?;
        tokio::fs::create_dir_all(&config.sync_root)
            .await
            .with_context(|| format!("failed to create sync root at {:?}", config.sync_root))?;

        let store = PairStore::open(&config.state_db)
            .await
            .with_context(|| format!("failed to open state store at {:?}", config.state_db))?;
        let limits = TransferLimits::new(TransferConfig::default());
        let client = DocsyncClient::with_limits(&api_url, token, limits)
            .context("failed to build remote client")?;
        let remote = DocsyncRemote::new(client, config.digest, config.page_size);
        let fs = DiskFs::new(config.sync_root.clone(), config.digest, config.use_trash);
        let engine = Arc::new(SyncEngine::new(
            config.engine_config(),
            Arc::new(store),
            Arc::new(fs),
            Arc::new(remote),
        ));

        Ok(Self { config, engine })
    }

    /// Runs until Ctrl-C.
    pub async fn run(self) -> anyhow::Result<()> {
        self.engine
            .start()
            .await
            .context("failed to start sync engine")?;
        tracing::info!(
            sync_root = %self.config.sync_root.display(),
            remote_root = %self.config.remote_root,
            policy = ?self.config.conflict_policy,
            "docsyncd started"
        );

        let engine_for_status = Arc::clone(&self.engine);
        let status_handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(STATUS_LOG_INTERVAL).await;
                match engine_for_status.status().await {
                    Ok(status) => log_status(&status),
                    Err(err) => tracing::warn!(error = %err, "failed to read engine status"),
                }
            }
        });

        let signal = tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal");
        status_handle.abort();
        tracing::info!("shutting down");
        self.engine
            .stop()
            .await
            .context("failed to stop sync engine")?;
        signal
    }

    /// Starts, waits until both sides agree, then stops.
    pub async fn run_once(self) -> anyhow::Result<EngineStatus> {
        self.engine
            .start()
            .await
            .context("failed to start sync engine")?;
        let waited = self.engine.wait_sync(self.config.once_timeout).await;
        let status = self.engine.status().await;
        self.engine
            .stop()
            .await
            .context("failed to stop sync engine")?;
        match waited {
            Ok(()) | Err(EngineError::Timeout(_)) => Ok(status?),
            Err(err) => Err(err.into()),
        }
    }
}

/// Summary of the state store without starting an engine.
pub async fn store_summary(config: &DaemonConfig) -> anyhow::Result<String> {
    let store = PairStore::open(&config.state_db)
        .await
        .with_context(|| format!("failed to open state store at {:?}", config.state_db))?;
    let counts = store.counts().await?;
    let last_error = store.last_error().await?;
    Ok(summary_line(&counts, last_error.as_deref()))
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
