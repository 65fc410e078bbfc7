//! Persistence collaborators: usage log, product catalog and collection tasks.
//!
//! Each trait has a file-backed implementation for the CLI/server and an
//! in-memory one for tests and embedding.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shopscout_core::{CanonicalProductRecord, CollectionTask, ProviderId, UsageEvent};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::write_atomic;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt data in {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("write rejected: {0}")]
    Rejected(String),
}

fn io_err(path: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Append-only provider usage log read by the quota tracker.
#[async_trait]
pub trait UsageLog: Send + Sync {
    async fn append(&self, event: UsageEvent) -> Result<(), StorageError>;

    /// Events for `provider` recorded at or after `since`.
    async fn events_since(
        &self,
        provider: &ProviderId,
        since: DateTime<Utc>,
    ) -> Result<Vec<UsageEvent>, StorageError>;
}

#[derive(Debug, Default)]
pub struct MemoryUsageLog {
    events: Mutex<Vec<UsageEvent>>,
}

impl MemoryUsageLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageLog for MemoryUsageLog {
    async fn append(&self, event: UsageEvent) -> Result<(), StorageError> {
        self.events.lock().await.push(event);
        Ok(())
    }

    async fn events_since(
        &self,
        provider: &ProviderId,
        since: DateTime<Utc>,
    ) -> Result<Vec<UsageEvent>, StorageError> {
        Ok(self
            .events
            .lock()
            .await
            .iter()
            .filter(|e| &e.provider == provider && e.recorded_at >= since)
            .cloned()
            .collect())
    }
}

/// One JSON object per line; appends never rewrite earlier entries.
#[derive(Debug)]
pub struct JsonlUsageLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlUsageLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl UsageLog for JsonlUsageLog {
    async fn append(&self, event: UsageEvent) -> Result<(), StorageError> {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err(parent, e))?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| io_err(&self.path, e))?;
        file.write_all(&line)
            .await
            .map_err(|e| io_err(&self.path, e))?;
        file.flush().await.map_err(|e| io_err(&self.path, e))?;
        Ok(())
    }

    async fn events_since(
        &self,
        provider: &ProviderId,
        since: DateTime<Utc>,
    ) -> Result<Vec<UsageEvent>, StorageError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_err(&self.path, err)),
        };

        let mut events = Vec::new();
        for (index, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let event: UsageEvent = match serde_json::from_str(line) {
                Ok(event) => event,
                Err(err) => {
                    warn!(
                        path = %self.path.display(),
                        line = index + 1,
                        error = %err,
                        "skipping unreadable usage line"
                    );
                    continue;
                }
            };
            if &event.provider == provider && event.recorded_at >= since {
                events.push(event);
            }
        }
        Ok(events)
    }
}

/// Product catalog keyed by synthetic id, upsert-on-conflict.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Insert or replace by id (last write wins).
    async fn upsert(&self, record: &CanonicalProductRecord) -> Result<(), StorageError>;

    /// Upserts a batch, one outcome per record in input order.
    async fn upsert_many(
        &self,
        records: &[CanonicalProductRecord],
    ) -> Vec<Result<(), StorageError>> {
        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            outcomes.push(self.upsert(record).await);
        }
        outcomes
    }

    /// All records in first-insertion order.
    async fn list(&self) -> Result<Vec<CanonicalProductRecord>, StorageError>;
}

#[derive(Debug, Default)]
struct CatalogState {
    order: Vec<Uuid>,
    rows: HashMap<Uuid, CanonicalProductRecord>,
}

impl CatalogState {
    fn from_records(records: Vec<CanonicalProductRecord>) -> Self {
        let mut state = Self::default();
        for record in records {
            state.upsert(record);
        }
        state
    }

    fn upsert(&mut self, record: CanonicalProductRecord) {
        if !self.rows.contains_key(&record.id) {
            self.order.push(record.id);
        }
        self.rows.insert(record.id, record);
    }

    fn ordered(&self) -> Vec<CanonicalProductRecord> {
        self.order
            .iter()
            .filter_map(|id| self.rows.get(id).cloned())
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct MemoryCatalogStore {
    state: Mutex<CatalogState>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn upsert(&self, record: &CanonicalProductRecord) -> Result<(), StorageError> {
        self.state.lock().await.upsert(record.clone());
        Ok(())
    }

    async fn upsert_many(
        &self,
        records: &[CanonicalProductRecord],
    ) -> Vec<Result<(), StorageError>> {
        let mut state = self.state.lock().await;
        records
            .iter()
            .map(|record| {
                state.upsert(record.clone());
                Ok(())
            })
            .collect()
    }

    async fn list(&self) -> Result<Vec<CanonicalProductRecord>, StorageError> {
        Ok(self.state.lock().await.ordered())
    }
}

/// Whole catalog in one JSON array, rewritten atomically on every write.
/// A batch upsert costs one read and one write.
#[derive(Debug)]
pub struct JsonFileCatalogStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileCatalogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<CatalogState, StorageError> {
        let records: Vec<CanonicalProductRecord> = read_json_or_default(&self.path).await?;
        Ok(CatalogState::from_records(records))
    }

    async fn write_batch(&self, records: &[CanonicalProductRecord]) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut state = self.load().await?;
        for record in records {
            state.upsert(record.clone());
        }
        let bytes = serde_json::to_vec_pretty(&state.ordered())?;
        write_atomic(&self.path, &bytes)
            .await
            .map_err(|e| io_err(&self.path, e))
    }
}

#[async_trait]
impl CatalogStore for JsonFileCatalogStore {
    async fn upsert(&self, record: &CanonicalProductRecord) -> Result<(), StorageError> {
        self.write_batch(std::slice::from_ref(record)).await
    }

    async fn upsert_many(
        &self,
        records: &[CanonicalProductRecord],
    ) -> Vec<Result<(), StorageError>> {
        if records.is_empty() {
            return Vec::new();
        }
        match self.write_batch(records).await {
            Ok(()) => records.iter().map(|_| Ok(())).collect(),
            Err(err) => {
                let message = err.to_string();
                records
                    .iter()
                    .map(|_| Err(StorageError::Rejected(message.clone())))
                    .collect()
            }
        }
    }

    async fn list(&self) -> Result<Vec<CanonicalProductRecord>, StorageError> {
        Ok(self.load().await?.ordered())
    }
}

/// Collection task records.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn put(&self, task: &CollectionTask) -> Result<(), StorageError>;
    async fn get(&self, id: Uuid) -> Result<Option<CollectionTask>, StorageError>;
}

#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<HashMap<Uuid, CollectionTask>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn put(&self, task: &CollectionTask) -> Result<(), StorageError> {
        self.tasks.lock().await.insert(task.id, task.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<CollectionTask>, StorageError> {
        Ok(self.tasks.lock().await.get(&id).cloned())
    }
}

#[derive(Debug)]
pub struct JsonFileTaskStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileTaskStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl TaskStore for JsonFileTaskStore {
    async fn put(&self, task: &CollectionTask) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut tasks: Vec<CollectionTask> = read_json_or_default(&self.path).await?;
        match tasks.iter_mut().find(|t| t.id == task.id) {
            Some(existing) => *existing = task.clone(),
            None => tasks.push(task.clone()),
        }
        let bytes = serde_json::to_vec_pretty(&tasks)?;
        write_atomic(&self.path, &bytes)
            .await
            .map_err(|e| io_err(&self.path, e))
    }

    async fn get(&self, id: Uuid) -> Result<Option<CollectionTask>, StorageError> {
        let tasks: Vec<CollectionTask> = read_json_or_default(&self.path).await?;
        Ok(tasks.into_iter().find(|t| t.id == id))
    }
}

async fn read_json_or_default<T>(path: &Path) -> Result<T, StorageError>
where
    T: serde::de::DeserializeOwned + Default,
{
    match fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StorageError::Corrupt {
            path: path.display().to_string(),
            source,
        }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(err) => Err(io_err(path, err)),
    }
}
