use crate::error::PipelineError;
use crate::feed::FeedConfig;
use crate::models::Horizon;
use crate::pipeline::ConfluenceConfig;
use crate::scheduler::SchedulerConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

const ENV_PREFIX: &str = "CONFLUENCE";

/// Top-level settings
///
/// Layered as: built-in defaults, then an optional TOML file, then
/// `CONFLUENCE__SECTION__KEY` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub instruments: Vec<String>,
    pub horizons: Vec<Horizon>,
    pub schedule: ScheduleSettings,
    pub feed: FeedSettings,
    pub confluence: ConfluenceSettings,
    pub store: StoreSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSettings {
    pub cycle_period_secs: u64,
    /// Keep a live candle stream per instrument for current prices
    pub live_prices: bool,
    pub price_interval: Horizon,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedSettings {
    pub rest_base_url: String,
    pub ws_base_url: String,
    pub history_limit: usize,
    pub min_candles: usize,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub requests_per_minute: u32,
    pub reconnect_min_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_jitter_ms: u64,
    pub max_stream_failures: u32,
    pub poll_interval_secs: u64,
    pub poll_limit: usize,
    pub depth_levels: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfluenceSettings {
    pub threshold: f64,
    pub min_setup_horizons: usize,
    pub validity_hours: i64,
    /// Per-horizon weight overrides keyed by interval code ("4h")
    #[serde(default)]
    pub weights: HashMap<String, f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Redis,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            instruments: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            horizons: Horizon::ALL.to_vec(),
            schedule: ScheduleSettings {
                cycle_period_secs: 15 * 60,
                live_prices: true,
                price_interval: Horizon::M1,
            },
            feed: FeedSettings {
                rest_base_url: "https://api.binance.com".to_string(),
                ws_base_url: "wss://stream.binance.com:9443/ws".to_string(),
                history_limit: 300,
                min_candles: 50,
                retry_attempts: 3,
                retry_base_delay_ms: 1_000,
                request_timeout_secs: 10,
                requests_per_minute: 600,
                reconnect_min_delay_ms: 1_000,
                reconnect_max_delay_ms: 30_000,
                reconnect_jitter_ms: 1_000,
                max_stream_failures: 5,
                poll_interval_secs: 60,
                poll_limit: 2,
                depth_levels: 20,
            },
            confluence: ConfluenceSettings {
                threshold: 70.0,
                min_setup_horizons: 4,
                validity_hours: 24,
                weights: HashMap::new(),
            },
            store: StoreSettings {
                backend: StoreBackend::Memory,
                url: None,
            },
        }
    }
}

impl Settings {
    /// Load settings from defaults, an optional file, and the environment
    pub fn load(path: Option<&str>) -> Result<Self, PipelineError> {
        let defaults = config::Config::try_from(&Settings::default())?;

        let mut builder = config::Config::builder().add_source(defaults);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        let settings: Settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("instruments")
                    .with_list_parse_key("horizons"),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Reject inconsistent values before anything is started
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.instruments.is_empty() {
            return Err(PipelineError::Config("no instruments configured".into()));
        }
        if self.horizons.is_empty() {
            return Err(PipelineError::Config("no horizons configured".into()));
        }
        if !(0.0..=100.0).contains(&self.confluence.threshold) {
            return Err(PipelineError::Config(format!(
                "confluence threshold {} outside 0..=100",
                self.confluence.threshold
            )));
        }
        if self.confluence.min_setup_horizons > self.horizons.len() {
            return Err(PipelineError::Config(format!(
                "min_setup_horizons {} exceeds the {} configured horizons",
                self.confluence.min_setup_horizons,
                self.horizons.len()
            )));
        }
        if self.confluence.validity_hours <= 0 {
            return Err(PipelineError::Config(format!(
                "validity_hours must be positive, got {}",
                self.confluence.validity_hours
            )));
        }
        if self.feed.reconnect_min_delay_ms > self.feed.reconnect_max_delay_ms {
            return Err(PipelineError::Config(
                "reconnect_min_delay_ms must not exceed reconnect_max_delay_ms".into(),
            ));
        }
        if self.feed.min_candles == 0 || self.feed.retry_attempts == 0 {
            return Err(PipelineError::Config(
                "min_candles and retry_attempts must be at least 1".into(),
            ));
        }
        if self.schedule.cycle_period_secs == 0 {
            return Err(PipelineError::Config("cycle_period_secs must be positive".into()));
        }
        if self.feed.poll_interval_secs == 0 {
            return Err(PipelineError::Config("poll_interval_secs must be positive".into()));
        }
        if self.store.backend != StoreBackend::Memory && self.store.url.is_none() {
            return Err(PipelineError::Config(format!(
                "store backend {:?} requires store.url",
                self.store.backend
            )));
        }
        self.weight_overrides()?;
        Ok(())
    }

    fn weight_overrides(&self) -> Result<HashMap<Horizon, f64>, PipelineError> {
        self.confluence
            .weights
            .iter()
            .map(|(key, weight)| {
                let horizon = key.parse::<Horizon>().map_err(PipelineError::Config)?;
                if !weight.is_finite() || *weight <= 0.0 {
                    return Err(PipelineError::Config(format!(
                        "weight for {} must be a positive number, got {}",
                        horizon, weight
                    )));
                }
                Ok((horizon, *weight))
            })
            .collect()
    }

    pub fn feed_config(&self) -> FeedConfig {
        let f = &self.feed;
        FeedConfig {
            rest_base_url: f.rest_base_url.clone(),
            ws_base_url: f.ws_base_url.clone(),
            min_candles: f.min_candles,
            retry_attempts: f.retry_attempts,
            retry_base_delay: Duration::from_millis(f.retry_base_delay_ms),
            request_timeout: Duration::from_secs(f.request_timeout_secs),
            requests_per_minute: f.requests_per_minute,
            reconnect_min_delay: Duration::from_millis(f.reconnect_min_delay_ms),
            reconnect_max_delay: Duration::from_millis(f.reconnect_max_delay_ms),
            reconnect_jitter: Duration::from_millis(f.reconnect_jitter_ms),
            max_stream_failures: f.max_stream_failures,
            poll_interval: Duration::from_secs(f.poll_interval_secs),
            poll_limit: f.poll_limit,
            depth_levels: f.depth_levels,
        }
    }

    pub fn confluence_config(&self) -> ConfluenceConfig {
        let mut weights: HashMap<Horizon, f64> =
            Horizon::ALL.iter().map(|h| (*h, h.default_weight())).collect();
        // validate() has already rejected bad overrides
        if let Ok(overrides) = self.weight_overrides() {
            weights.extend(overrides);
        }

        ConfluenceConfig {
            threshold: self.confluence.threshold,
            min_setup_horizons: self.confluence.min_setup_horizons,
            validity_window: chrono::Duration::hours(self.confluence.validity_hours),
            weights,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            instruments: self.instruments.clone(),
            horizons: self.horizons.clone(),
            cycle_period: Duration::from_secs(self.schedule.cycle_period_secs),
            history_limit: self.feed.history_limit,
            live_prices: self.schedule.live_prices,
            price_interval: self.schedule.price_interval,
        }
    }
}
