use async_trait::async_trait;
use bytes::Bytes;
use docsync_core::{
    ChangeEventKind, DocsyncClient, DocsyncError, Document, DocumentKind,
};
use thiserror::Error;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use super::fingerprint::{DigestAlgorithm, FingerprintError, normalize_remote, same_content};
use super::store::{ChangeKind, ItemKind};

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error(transparent)]
    Api(#[from] DocsyncError),
    #[error("remote document not found: {0}")]
    NotFound(String),
    #[error("remote rejected the request: {0}")]
    Rejected(String),
    #[error("remote unavailable: {0}")]
    Unavailable(String),
    #[error("invalid remote digest: {0}")]
    Digest(#[from] FingerprintError),
}

impl RemoteError {
    pub fn is_not_found(&self) -> bool {
        match self {
            RemoteError::NotFound(_) => true,
            RemoteError::Api(err) => err.is_not_found(),
            _ => false,
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Unavailable(_) => true,
            RemoteError::Api(err) => err.is_retryable(),
            _ => false,
        }
    }
}

/// What the core knows about one remote document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDescriptor {
    pub remote_id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub kind: ItemKind,
    /// Digest comparable with local fingerprints, when the remote provides one.
    pub fingerprint: Option<String>,
    pub version: String,
    pub mtime: Option<i64>,
}

impl RemoteDescriptor {
    pub fn same_placement(&self, parent_id: Option<&str>, name: &str) -> bool {
        self.parent_id.as_deref() == parent_id && self.name == name
    }

    pub fn same_content(&self, fingerprint: Option<&str>) -> bool {
        same_content(self.fingerprint.as_deref(), fingerprint)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteChange {
    pub remote_id: String,
    pub kind: ChangeKind,
    pub version: String,
    /// Current state of the document; absent for deletions.
    pub descriptor: Option<RemoteDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoteChangeBatch {
    pub changes: Vec<RemoteChange>,
    pub checkpoint: String,
}

#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn get_document(&self, remote_id: &str) -> Result<RemoteDescriptor, RemoteError>;
    async fn get_children(&self, remote_id: &str) -> Result<Vec<RemoteDescriptor>, RemoteError>;
    async fn create_folder(
        &self,
        parent_id: &str,
        name: &str,
    ) -> Result<RemoteDescriptor, RemoteError>;
    async fn create_document(
        &self,
        parent_id: &str,
        name: &str,
        content: Bytes,
    ) -> Result<RemoteDescriptor, RemoteError>;
    async fn update_content(
        &self,
        remote_id: &str,
        content: Bytes,
    ) -> Result<RemoteDescriptor, RemoteError>;
    /// Fetches the content, verifying it against `expected` when given.
    async fn download(&self, remote_id: &str, expected: Option<&str>)
    -> Result<Bytes, RemoteError>;
    async fn move_document(
        &self,
        remote_id: &str,
        parent_id: &str,
        name: &str,
    ) -> Result<RemoteDescriptor, RemoteError>;
    async fn delete_document(&self, remote_id: &str) -> Result<(), RemoteError>;
    async fn poll_changes(&self, checkpoint: Option<&str>)
    -> Result<RemoteChangeBatch, RemoteError>;
}

/// [`RemoteClient`] over the REST client.
#[derive(Clone)]
pub struct DocsyncRemote {
    client: DocsyncClient,
    algorithm: DigestAlgorithm,
    page_size: u32,
}

impl DocsyncRemote {
    pub fn new(client: DocsyncClient, algorithm: DigestAlgorithm, page_size: u32) -> Self {
        Self {
            client,
            algorithm,
            page_size: page_size.max(1),
        }
    }

    fn describe(&self, doc: Document) -> Result<RemoteDescriptor, RemoteError> {
        let fingerprint = match doc.kind {
            DocumentKind::File => normalize_remote(doc.digest.as_deref(), self.algorithm)?,
            DocumentKind::Folder => None,
        };
        Ok(RemoteDescriptor {
            remote_id: doc.id,
            parent_id: doc.parent_id,
            name: doc.name,
            kind: match doc.kind {
                DocumentKind::File => ItemKind::File,
                DocumentKind::Folder => ItemKind::Folder,
            },
            fingerprint,
            version: doc.version,
            mtime: doc.modified.as_deref().and_then(parse_mtime),
        })
    }
}

fn parse_mtime(value: &str) -> Option<i64> {
    let parsed = OffsetDateTime::parse(value, &Rfc3339).ok()?;
    Some((parsed.unix_timestamp_nanos() / 1_000_000) as i64)
}

fn change_kind(kind: ChangeEventKind) -> ChangeKind {
    match kind {
        ChangeEventKind::Created => ChangeKind::Created,
        ChangeEventKind::Modified => ChangeKind::Modified,
        ChangeEventKind::Moved => ChangeKind::Moved,
        ChangeEventKind::Deleted => ChangeKind::Deleted,
    }
}

#[async_trait]
impl RemoteClient for DocsyncRemote {
    async fn get_document(&self, remote_id: &str) -> Result<RemoteDescriptor, RemoteError> {
        let doc = self.client.get_document(remote_id).await?;
        self.describe(doc)
    }

    async fn get_children(&self, remote_id: &str) -> Result<Vec<RemoteDescriptor>, RemoteError> {
        self.client
            .list_children_all(remote_id, self.page_size)
            .await?
            .into_iter()
            .map(|doc| self.describe(doc))
            .collect()
    }

    async fn create_folder(
        &self,
        parent_id: &str,
        name: &str,
    ) -> Result<RemoteDescriptor, RemoteError> {
        let doc = self.client.create_folder(parent_id, name).await?;
        self.describe(doc)
    }

    async fn create_document(
        &self,
        parent_id: &str,
        name: &str,
        content: Bytes,
    ) -> Result<RemoteDescriptor, RemoteError> {
        let doc = self.client.create_file(parent_id, name, content).await?;
        self.describe(doc)
    }

    async fn update_content(
        &self,
        remote_id: &str,
        content: Bytes,
    ) -> Result<RemoteDescriptor, RemoteError> {
        let doc = self.client.update_content(remote_id, content).await?;
        self.describe(doc)
    }

    async fn download(
        &self,
        remote_id: &str,
        expected: Option<&str>,
    ) -> Result<Bytes, RemoteError> {
        let md5_check = expected.filter(|_| self.algorithm == DigestAlgorithm::Md5);
        let content = self.client.download_content(remote_id, md5_check).await?;
        if let Some(expected) = expected
            && md5_check.is_none()
        {
            let actual = self.algorithm.digest(&content);
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(RemoteError::Unavailable(format!(
                    "content of {remote_id} does not match digest {expected}"
                )));
            }
        }
        Ok(content)
    }

    async fn move_document(
        &self,
        remote_id: &str,
        parent_id: &str,
        name: &str,
    ) -> Result<RemoteDescriptor, RemoteError> {
        let doc = self.client.move_document(remote_id, parent_id, name).await?;
        self.describe(doc)
    }

    async fn delete_document(&self, remote_id: &str) -> Result<(), RemoteError> {
        self.client.delete_document(remote_id).await?;
        Ok(())
    }

    async fn poll_changes(
        &self,
        checkpoint: Option<&str>,
    ) -> Result<RemoteChangeBatch, RemoteError> {
        let batch = self.client.poll_changes(checkpoint).await?;
        let mut changes = Vec::with_capacity(batch.changes.len());
        for entry in batch.changes {
            let descriptor = entry.document.map(|doc| self.describe(doc)).transpose()?;
            changes.push(RemoteChange {
                remote_id: entry.document_id,
                kind: change_kind(entry.event),
                version: entry.version,
                descriptor,
            });
        }
        Ok(RemoteChangeBatch {
            changes,
            checkpoint: batch.checkpoint,
        })
    }
}
