use super::SignalStore;
use crate::error::PipelineError;
use crate::models::{Signal, SignalStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::time::{timeout, Duration};
use uuid::Uuid;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Redis-backed signal store
///
/// Signals are JSON documents in the hash `{prefix}` keyed by id; the sorted
/// set `{prefix}:expiry` scores ids by `expires_at` (unix millis) for sweeps.
pub struct RedisSignalStore {
    conn: ConnectionManager,
    hash_key: String,
    expiry_key: String,
}

impl RedisSignalStore {
    /// Connect with the default `signals` key prefix
    pub async fn new(redis_url: &str) -> Result<Self, PipelineError> {
        Self::with_prefix(redis_url, "signals").await
    }

    pub async fn with_prefix(redis_url: &str, prefix: &str) -> Result<Self, PipelineError> {
        let client = Client::open(redis_url)?;

        let conn = timeout(CONNECT_TIMEOUT, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                PipelineError::Persistence(format!(
                    "Redis connection timeout after {} seconds",
                    CONNECT_TIMEOUT.as_secs()
                ))
            })??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self {
            conn,
            hash_key: prefix.to_string(),
            expiry_key: format!("{}:expiry", prefix),
        })
    }

    async fn load_all(&self) -> Result<Vec<Signal>, PipelineError> {
        let mut conn = self.conn.clone();
        let docs: Vec<String> = conn.hvals(&self.hash_key).await?;
        Ok(decode_all(docs))
    }
}

fn decode_all(docs: Vec<String>) -> Vec<Signal> {
    docs.into_iter()
        .filter_map(|doc| match serde_json::from_str::<Signal>(&doc) {
            Ok(signal) => Some(signal),
            Err(e) => {
                tracing::warn!("Skipping undecodable signal document: {}", e);
                None
            }
        })
        .collect()
}

#[async_trait]
impl SignalStore for RedisSignalStore {
    async fn put(&self, signal: &Signal) -> Result<(), PipelineError> {
        let mut conn = self.conn.clone();
        let doc = serde_json::to_string(signal)?;
        let id = signal.id.to_string();
        let score = signal.expires_at.timestamp_millis() as f64;

        let _: () = redis::pipe()
            .atomic()
            .hset(&self.hash_key, &id, doc)
            .ignore()
            .zadd(&self.expiry_key, &id, score)
            .ignore()
            .query_async(&mut conn)
            .await?;

        tracing::debug!(signal_id = %signal.id, status = %signal.status, "Saved signal to Redis");
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Signal>, PipelineError> {
        let mut conn = self.conn.clone();
        let doc: Option<String> = conn.hget(&self.hash_key, id.to_string()).await?;
        doc.map(|d| serde_json::from_str(&d).map_err(PipelineError::from))
            .transpose()
    }

    async fn find_active(&self, instrument: &str) -> Result<Vec<Signal>, PipelineError> {
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .filter(|s| s.instrument == instrument && s.status == SignalStatus::Active)
            .collect())
    }

    async fn find_tracked(&self) -> Result<Vec<Signal>, PipelineError> {
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .filter(|s| s.is_tracked())
            .collect())
    }

    async fn find_expired(&self, now: DateTime<Utc>) -> Result<Vec<Signal>, PipelineError> {
        let mut conn = self.conn.clone();
        // exclusive upper bound: expires_at < now
        let ids: Vec<String> = conn
            .zrangebyscore(&self.expiry_key, "-inf", format!("({}", now.timestamp_millis()))
            .await?;

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let docs: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(&self.hash_key)
            .arg(&ids)
            .query_async(&mut conn)
            .await?;

        Ok(decode_all(docs.into_iter().flatten().collect()))
    }

    async fn delete_batch(&self, ids: &[Uuid]) -> Result<usize, PipelineError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.clone();
        let ids: Vec<String> = ids.iter().map(Uuid::to_string).collect();

        let (removed, _): (usize, usize) = redis::pipe()
            .atomic()
            .hdel(&self.hash_key, &ids)
            .zrem(&self.expiry_key, &ids)
            .query_async(&mut conn)
            .await?;

        tracing::debug!("Deleted {} signals from Redis", removed);
        Ok(removed)
    }
}
