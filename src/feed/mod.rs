// Market data feed: historical fetch, live candles, pooled depth
pub mod backoff;
pub mod depth;
pub mod history;
pub mod live;

pub use backoff::ReconnectBackoff;
pub use depth::DepthSubscription;
pub use live::LiveStream;

use crate::error::PipelineError;
use crate::models::{Candle, ConnectionState, DepthSnapshot, Horizon};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Live candle updates from one upstream connection
pub type CandleStream = Pin<Box<dyn Stream<Item = Result<Candle, PipelineError>> + Send>>;

/// Depth snapshots from one upstream connection
pub type DepthStream = Pin<Box<dyn Stream<Item = Result<DepthSnapshot, PipelineError>> + Send>>;

/// Raw upstream market data (one attempt per call, no retry)
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn fetch_klines(
        &self,
        instrument: &str,
        interval: Horizon,
        limit: usize,
    ) -> Result<Vec<Candle>, PipelineError>;

    async fn connect_candles(
        &self,
        instrument: &str,
        interval: Horizon,
    ) -> Result<CandleStream, PipelineError>;

    async fn connect_depth(&self, instrument: &str) -> Result<DepthStream, PipelineError>;
}

/// Feed tuning
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub rest_base_url: String,
    pub ws_base_url: String,
    /// Minimum viable history length
    pub min_candles: usize,
    pub retry_attempts: u32,
    pub retry_base_delay: Duration,
    pub request_timeout: Duration,
    pub requests_per_minute: u32,
    pub reconnect_min_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub reconnect_jitter: Duration,
    /// Consecutive stream failures before falling back to polling
    pub max_stream_failures: u32,
    pub poll_interval: Duration,
    pub poll_limit: usize,
    pub depth_levels: u16,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            rest_base_url: "https://api.binance.com".to_string(),
            ws_base_url: "wss://stream.binance.com:9443/ws".to_string(),
            min_candles: 50,
            retry_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
            request_timeout: Duration::from_secs(10),
            requests_per_minute: 600,
            reconnect_min_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            reconnect_jitter: Duration::from_secs(1),
            max_stream_failures: 5,
            poll_interval: Duration::from_secs(60),
            poll_limit: 2,
            depth_levels: 20,
        }
    }
}

impl FeedConfig {
    pub fn backoff(&self) -> ReconnectBackoff {
        ReconnectBackoff::new(
            self.reconnect_min_delay,
            self.reconnect_max_delay,
            self.reconnect_jitter,
        )
    }
}

/// Connection table: live stream id -> observed state
pub(crate) type LiveTable = DashMap<u64, watch::Receiver<ConnectionState>>;

/// Resilient market data access for the tracked instruments
///
/// Constructed explicitly and handed to whoever needs it; clones share the
/// same source and connection tables.
#[derive(Clone)]
pub struct MarketDataFeed {
    source: Arc<dyn MarketDataSource>,
    config: Arc<FeedConfig>,
    live: Arc<LiveTable>,
    depth: Arc<depth::DepthTable>,
    next_id: Arc<AtomicU64>,
}

impl MarketDataFeed {
    pub fn new(source: Arc<dyn MarketDataSource>, config: FeedConfig) -> Self {
        Self {
            source,
            config: Arc::new(config),
            live: Arc::new(DashMap::new()),
            depth: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    /// Fetch closed history, requiring at least `min_candles` bars
    pub async fn fetch_history(
        &self,
        instrument: &str,
        interval: Horizon,
        limit: usize,
    ) -> Result<Vec<Candle>, PipelineError> {
        history::fetch_history(
            self.source.as_ref(),
            &self.config,
            instrument,
            interval,
            limit,
            self.config.min_candles,
        )
        .await
    }

    /// Last traded price via a small history fetch
    pub async fn latest_price(&self, instrument: &str) -> Result<f64, PipelineError> {
        let candles = history::fetch_history(
            self.source.as_ref(),
            &self.config,
            instrument,
            Horizon::M1,
            self.config.poll_limit.max(1),
            1,
        )
        .await?;

        candles
            .last()
            .map(|c| c.close)
            .ok_or_else(|| PipelineError::DataUnavailable {
                instrument: instrument.to_string(),
                interval: Horizon::M1.to_string(),
                got: 0,
                required: 1,
            })
    }

    /// Open a live candle stream with reconnect and polling fallback
    pub fn stream_live(&self, instrument: &str, interval: Horizon) -> LiveStream {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        live::spawn(
            id,
            instrument,
            interval,
            self.source.clone(),
            self.config.clone(),
            self.live.clone(),
        )
    }

    /// Subscribe to pooled depth snapshots for an instrument
    pub fn stream_depth(&self, instrument: &str) -> DepthSubscription {
        depth::subscribe(
            instrument,
            self.source.clone(),
            self.config.clone(),
            self.depth.clone(),
        )
    }

    /// Snapshot of every live stream's connection state
    pub fn connection_states(&self) -> Vec<ConnectionState> {
        let mut states: Vec<ConnectionState> = self
            .live
            .iter()
            .map(|entry| entry.value().borrow().clone())
            .collect();
        states.sort_by(|a, b| {
            a.instrument
                .cmp(&b.instrument)
                .then(a.interval.cmp(&b.interval))
        });
        states
    }

    /// Number of consumers attached to an instrument's depth connection
    pub fn depth_subscribers(&self, instrument: &str) -> usize {
        self.depth
            .get(instrument)
            .map(|pool| pool.subscribers)
            .unwrap_or(0)
    }
}
