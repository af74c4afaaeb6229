// Signal persistence behind a document-store trait
pub mod memory;
pub mod postgres;
pub mod redis;

pub use self::memory::MemorySignalStore;
pub use self::postgres::PostgresSignalStore;
pub use self::redis::RedisSignalStore;

use crate::config::{StoreBackend, StoreSettings};
use crate::error::PipelineError;
use crate::models::Signal;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Keyed signal collection
///
/// `put` is an upsert on `id`. Queries return signals in no particular order.
#[async_trait]
pub trait SignalStore: Send + Sync {
    async fn put(&self, signal: &Signal) -> Result<(), PipelineError>;

    async fn get(&self, id: Uuid) -> Result<Option<Signal>, PipelineError>;

    /// ACTIVE signals for one instrument
    async fn find_active(&self, instrument: &str) -> Result<Vec<Signal>, PipelineError>;

    /// Signals still followed by reconciliation (ACTIVE or partially hit)
    async fn find_tracked(&self) -> Result<Vec<Signal>, PipelineError>;

    /// Signals with `expires_at < now`
    async fn find_expired(&self, now: DateTime<Utc>) -> Result<Vec<Signal>, PipelineError>;

    /// Remove by id, returns how many existed
    async fn delete_batch(&self, ids: &[Uuid]) -> Result<usize, PipelineError>;
}

/// Open the configured backend
pub async fn connect(settings: &StoreSettings) -> Result<Arc<dyn SignalStore>, PipelineError> {
    let url = settings.url.as_deref();

    let store: Arc<dyn SignalStore> = match (settings.backend, url) {
        (StoreBackend::Memory, _) => Arc::new(MemorySignalStore::new()),
        (StoreBackend::Redis, Some(url)) => Arc::new(RedisSignalStore::new(url).await?),
        (StoreBackend::Postgres, Some(url)) => Arc::new(PostgresSignalStore::new(url).await?),
        (backend, None) => {
            return Err(PipelineError::Config(format!(
                "store backend {:?} requires store.url",
                backend
            )))
        }
    };

    tracing::info!(backend = ?settings.backend, "Signal store ready");
    Ok(store)
}
