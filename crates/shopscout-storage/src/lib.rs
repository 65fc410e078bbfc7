//! Raw artifact storage, persistence stores and the provider HTTP fetcher.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

mod stores;

pub use stores::{
    CatalogStore, JsonFileCatalogStore, JsonFileTaskStore, JsonlUsageLog, MemoryCatalogStore,
    MemoryTaskStore, MemoryUsageLog, StorageError, TaskStore, UsageLog,
};

pub const CRATE_NAME: &str = "shopscout-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Writes `bytes` to `path` through a sibling temp file and an atomic rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed archive of raw provider responses.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        provider: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(stamp)
            .join(provider)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Store bytes immutably under a hash-addressed path.
    pub async fn store_bytes(
        &self,
        fetched_at: DateTime<Utc>,
        provider: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = sha256_hex(bytes);
        let relative_path =
            self.artifact_relative_path(fetched_at, provider, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        let exists = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?;
        if !exists {
            write_atomic(&absolute_path, bytes)
                .await
                .with_context(|| format!("writing artifact {}", absolute_path.display()))?;
        }

        Ok(StoredArtifact {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated: exists,
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_provider_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(25),
            user_agent: None,
            global_concurrency: 16,
            per_provider_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout {
                url: err
                    .url()
                    .map(|u| redact_query(u.as_str()))
                    .unwrap_or_else(|| "<unknown>".to_string()),
            }
        } else {
            FetchError::Request(err)
        }
    }
}

/// Single-attempt HTTP client: one request per call, fixed timeout, no retry
/// loop. Failover between providers happens in the router.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_provider_limit: usize,
    per_provider: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_provider_limit: config.per_provider_concurrency.max(1),
            per_provider: Mutex::new(HashMap::new()),
        })
    }

    async fn provider_semaphore(&self, provider: &str) -> Arc<Semaphore> {
        let mut map = self.per_provider.lock().await;
        map.entry(provider.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_provider_limit)))
            .clone()
    }

    pub async fn fetch(
        &self,
        provider: &str,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError> {
        // Semaphores are never closed while the fetcher is alive.
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_provider = self.provider_semaphore(provider).await;
        let _provider = per_provider.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_fetch", provider, url = %redact_query(url));
        async move {
            let mut request = self.client.get(url);
            for (name, value) in headers {
                request = request.header(name.as_str(), value.as_str());
            }

            let resp = request.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: redact_query(&final_url),
                });
            }

            let body = resp.bytes().await?.to_vec();
            debug!(bytes = body.len(), "provider response received");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
                fetched_at: Utc::now(),
            })
        }
        .instrument(span)
        .await
    }
}

/// Drops the query string so credentials passed as parameters never reach logs.
pub fn redact_query(url: &str) -> String {
    match url.split_once('?') {
        Some((base, _)) => format!("{base}?<redacted>"),
        None => url.to_string(),
    }
}
