use bytes::Bytes;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::transfer::{TransferLimits, collect_checked};

#[derive(Debug, Error)]
pub enum DocsyncError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("base url cannot carry path segments: {0}")]
    InvalidBaseUrl(String),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("concurrency limiter is closed")]
    ConcurrencyClosed,
    #[error("download integrity check failed: expected {expected_md5}, got {actual_md5}")]
    IntegrityMismatch {
        expected_md5: String,
        actual_md5: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    NotFound,
    Permanent,
}

/// REST client for the remote document repository.
///
/// Documents are addressed by opaque ids; folders and files share one
/// namespace. Content transfers go through [`TransferLimits`].
#[derive(Clone)]
pub struct DocsyncClient {
    http: Client,
    base_url: Url,
    token: String,
    limits: TransferLimits,
}

impl DocsyncClient {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, DocsyncError> {
        Self::with_limits(base_url, token, TransferLimits::default())
    }

    pub fn with_limits(
        base_url: &str,
        token: impl Into<String>,
        limits: TransferLimits,
    ) -> Result<Self, DocsyncError> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(DocsyncError::InvalidBaseUrl(base_url.to_string()));
        }
        Ok(Self {
            http: Client::new(),
            base_url,
            token: token.into(),
            limits,
        })
    }

    pub async fn get_document(&self, id: &str) -> Result<Document, DocsyncError> {
        let url = self.document_url(id, &[])?;
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn list_children(
        &self,
        id: &str,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<DocumentPage, DocsyncError> {
        let mut url = self.document_url(id, &["children"])?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(limit) = limit {
                query.append_pair("limit", &limit.to_string());
            }
            if let Some(offset) = offset {
                query.append_pair("offset", &offset.to_string());
            }
        }
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn list_children_all(
        &self,
        id: &str,
        page_size: u32,
    ) -> Result<Vec<Document>, DocsyncError> {
        let page_size = page_size.max(1);
        let mut offset = 0u32;
        let mut items = Vec::new();
        loop {
            let page = self.list_children(id, Some(page_size), Some(offset)).await?;
            let fetched = page.items.len() as u32;
            offset = offset.saturating_add(fetched);
            let total = page.total;
            items.extend(page.items);
            if offset >= total || fetched == 0 {
                break;
            }
        }
        Ok(items)
    }

    pub async fn create_folder(&self, parent_id: &str, name: &str) -> Result<Document, DocsyncError> {
        let url = self.document_url(parent_id, &["children"])?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&CreateFolderRequest {
                name,
                kind: DocumentKind::Folder,
            })
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn create_file(
        &self,
        parent_id: &str,
        name: &str,
        content: Bytes,
    ) -> Result<Document, DocsyncError> {
        let _permit = self.limits.acquire_upload().await?;
        let mut url = self.document_url(parent_id, &["files"])?;
        url.query_pairs_mut().append_pair("name", name);
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .body(content)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn update_content(&self, id: &str, content: Bytes) -> Result<Document, DocsyncError> {
        let _permit = self.limits.acquire_upload().await?;
        let url = self.document_url(id, &["content"])?;
        let response = self
            .http
            .put(url)
            .bearer_auth(&self.token)
            .body(content)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn download_content(
        &self,
        id: &str,
        expected_md5: Option<&str>,
    ) -> Result<Bytes, DocsyncError> {
        let _permit = self.limits.acquire_download().await?;
        let url = self.document_url(id, &["content"])?;
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        collect_checked(response, expected_md5).await
    }

    pub async fn move_document(
        &self,
        id: &str,
        parent_id: &str,
        name: &str,
    ) -> Result<Document, DocsyncError> {
        let url = self.document_url(id, &["move"])?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&MoveRequest { parent_id, name })
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn delete_document(&self, id: &str) -> Result<(), DocsyncError> {
        let url = self.document_url(id, &[])?;
        let response = self
            .http
            .delete(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(Self::api_error(response).await)
    }

    pub async fn poll_changes(&self, since: Option<&str>) -> Result<ChangeBatch, DocsyncError> {
        let mut url = self.api_url(&["changes"])?;
        if let Some(since) = since {
            url.query_pairs_mut().append_pair("since", since);
        }
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    fn api_url(&self, segments: &[&str]) -> Result<Url, DocsyncError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| DocsyncError::InvalidBaseUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(["api", "v1"])
            .extend(segments);
        Ok(url)
    }

    fn document_url(&self, id: &str, tail: &[&str]) -> Result<Url, DocsyncError> {
        let mut url = self.api_url(&["documents", id])?;
        if !tail.is_empty() {
            url.path_segments_mut()
                .map_err(|_| DocsyncError::InvalidBaseUrl(self.base_url.to_string()))?
                .extend(tail);
        }
        Ok(url)
    }

    async fn api_error(response: reqwest::Response) -> DocsyncError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        DocsyncError::Api { status, body }
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DocsyncError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            Err(Self::api_error(response).await)
        }
    }
}

impl DocsyncError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            DocsyncError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    /// Network failures and throttling/server errors are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            DocsyncError::Request(_) | DocsyncError::IntegrityMismatch { .. } => true,
            _ => matches!(
                self.classification(),
                Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
            ),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.classification(), Some(ApiErrorClass::NotFound))
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if matches!(status, StatusCode::NOT_FOUND | StatusCode::GONE) {
        ApiErrorClass::NotFound
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::LOCKED | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Document {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DocumentKind,
    #[serde(default)]
    pub digest: Option<String>,
    pub version: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    File,
    Folder,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DocumentPage {
    pub items: Vec<Document>,
    pub limit: u32,
    pub offset: u32,
    pub total: u32,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChangeEventKind {
    Created,
    Modified,
    Moved,
    Deleted,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChangeEntry {
    pub document_id: String,
    pub event: ChangeEventKind,
    pub version: String,
    #[serde(default)]
    pub document: Option<Document>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ChangeBatch {
    #[serde(default)]
    pub changes: Vec<ChangeEntry>,
    pub checkpoint: String,
}

#[derive(Debug, Serialize)]
struct CreateFolderRequest<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    kind: DocumentKind,
}

#[derive(Debug, Serialize)]
struct MoveRequest<'a> {
    parent_id: &'a str,
    name: &'a str,
}
