use super::SignalStore;
use crate::error::PipelineError;
use crate::models::{Signal, SignalStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// In-process store, used in tests and when no backend is configured
#[derive(Default)]
pub struct MemorySignalStore {
    signals: RwLock<HashMap<Uuid, Signal>>,
}

impl MemorySignalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.signals.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.signals.read().await.is_empty()
    }

    pub async fn all(&self) -> Vec<Signal> {
        self.signals.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl SignalStore for MemorySignalStore {
    async fn put(&self, signal: &Signal) -> Result<(), PipelineError> {
        self.signals.write().await.insert(signal.id, signal.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Signal>, PipelineError> {
        Ok(self.signals.read().await.get(&id).cloned())
    }

    async fn find_active(&self, instrument: &str) -> Result<Vec<Signal>, PipelineError> {
        Ok(self
            .signals
            .read()
            .await
            .values()
            .filter(|s| s.instrument == instrument && s.status == SignalStatus::Active)
            .cloned()
            .collect())
    }

    async fn find_tracked(&self) -> Result<Vec<Signal>, PipelineError> {
        Ok(self
            .signals
            .read()
            .await
            .values()
            .filter(|s| s.is_tracked())
            .cloned()
            .collect())
    }

    async fn find_expired(&self, now: DateTime<Utc>) -> Result<Vec<Signal>, PipelineError> {
        Ok(self
            .signals
            .read()
            .await
            .values()
            .filter(|s| s.expires_at < now)
            .cloned()
            .collect())
    }

    async fn delete_batch(&self, ids: &[Uuid]) -> Result<usize, PipelineError> {
        let mut signals = self.signals.write().await;
        Ok(ids.iter().filter(|id| signals.remove(id).is_some()).count())
    }
}
