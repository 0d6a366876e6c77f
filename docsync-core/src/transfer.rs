use std::{env, sync::Arc};

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use md5::Context;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::client::DocsyncError;

#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    pub download_concurrency: usize,
    pub upload_concurrency: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_concurrency: read_limit("DOCSYNC_DOWNLOAD_CONCURRENCY", 4),
            upload_concurrency: read_limit("DOCSYNC_UPLOAD_CONCURRENCY", 2),
        }
    }
}

/// Caps the number of content transfers in flight per direction.
#[derive(Clone)]
pub struct TransferLimits {
    download_limit: Arc<Semaphore>,
    upload_limit: Arc<Semaphore>,
}

impl TransferLimits {
    pub fn new(config: TransferConfig) -> Self {
        Self {
            download_limit: Arc::new(Semaphore::new(config.download_concurrency.max(1))),
            upload_limit: Arc::new(Semaphore::new(config.upload_concurrency.max(1))),
        }
    }

    pub async fn acquire_download(&self) -> Result<OwnedSemaphorePermit, DocsyncError> {
        self.download_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DocsyncError::ConcurrencyClosed)
    }

    pub async fn acquire_upload(&self) -> Result<OwnedSemaphorePermit, DocsyncError> {
        self.upload_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DocsyncError::ConcurrencyClosed)
    }
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self::new(TransferConfig::default())
    }
}

/// Streams a response body into memory, verifying its md5 when one is expected.
pub(crate) async fn collect_checked(
    response: reqwest::Response,
    expected_md5: Option<&str>,
) -> Result<Bytes, DocsyncError> {
    let mut stream = response.bytes_stream();
    let mut body = BytesMut::new();
    let mut md5 = expected_md5.map(|_| Context::new());

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if let Some(ctx) = md5.as_mut() {
            ctx.consume(&chunk);
        }
        body.extend_from_slice(&chunk);
    }

    if let (Some(expected), Some(ctx)) = (expected_md5, md5) {
        let actual_md5 = format!("{:x}", ctx.compute());
        if actual_md5 != expected.to_ascii_lowercase() {
            return Err(DocsyncError::IntegrityMismatch {
                expected_md5: expected.to_ascii_lowercase(),
                actual_md5,
            });
        }
    }

    Ok(body.freeze())
}

fn read_limit(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}
