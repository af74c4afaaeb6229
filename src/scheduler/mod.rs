// Periodic control loop: reconcile, then fanout -> confluence -> publish per instrument
pub mod price_cache;

pub use price_cache::{CachedPrice, PriceCache};

use crate::feed::MarketDataFeed;
use crate::lifecycle::{PublishOutcome, SignalLifecycleManager};
use crate::models::{ConnectionStatus, Horizon};
use crate::pipeline::{setup_count, ConfluenceValidator, TimeframeFanout};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub instruments: Vec<String>,
    pub horizons: Vec<Horizon>,
    pub cycle_period: Duration,
    pub history_limit: usize,
    /// Keep a live stream per instrument to price reconciliation
    pub live_prices: bool,
    pub price_interval: Horizon,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            instruments: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            horizons: Horizon::ALL.to_vec(),
            cycle_period: Duration::from_secs(15 * 60),
            history_limit: 300,
            live_prices: true,
            price_interval: Horizon::M1,
        }
    }
}

/// What happened to one instrument in a cycle
#[derive(Debug, Clone, PartialEq)]
pub enum InstrumentOutcome {
    Published,
    Suppressed,
    Duplicate,
    /// Fewer horizons produced a setup than the quorum requires
    NoQuorum { setups: usize },
    BelowThreshold { score: f64 },
    Failed(String),
}

/// Per-cycle counters, logged at the end of every cycle
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub started_at: Option<DateTime<Utc>>,
    pub instruments: usize,
    pub published: usize,
    pub suppressed: usize,
    pub below_threshold: usize,
    pub skipped: usize,
    pub failed: usize,
    pub transitions: usize,
    pub swept: usize,
    pub degraded_connections: usize,
    /// Shutdown arrived before every instrument was processed
    pub interrupted: bool,
}

impl CycleReport {
    fn record(&mut self, outcome: &InstrumentOutcome) {
        self.instruments += 1;
        match outcome {
            InstrumentOutcome::Published => self.published += 1,
            InstrumentOutcome::Suppressed | InstrumentOutcome::Duplicate => self.suppressed += 1,
            InstrumentOutcome::NoQuorum { .. } => self.skipped += 1,
            InstrumentOutcome::BelowThreshold { .. } => self.below_threshold += 1,
            InstrumentOutcome::Failed(_) => self.failed += 1,
        }
    }
}

pub struct CycleScheduler {
    config: SchedulerConfig,
    fanout: TimeframeFanout,
    validator: ConfluenceValidator,
    lifecycle: SignalLifecycleManager,
    prices: PriceCache,
}

impl CycleScheduler {
    pub fn new(
        config: SchedulerConfig,
        fanout: TimeframeFanout,
        validator: ConfluenceValidator,
        lifecycle: SignalLifecycleManager,
    ) -> Self {
        Self {
            config,
            fanout,
            validator,
            lifecycle,
            prices: PriceCache::new(),
        }
    }

    pub fn price_cache(&self) -> &PriceCache {
        &self.prices
    }

    pub fn lifecycle(&self) -> &SignalLifecycleManager {
        &self.lifecycle
    }

    fn feed(&self) -> &MarketDataFeed {
        self.fanout.feed()
    }

    /// Run cycles until `shutdown` is cancelled
    ///
    /// The first cycle starts immediately. Shutdown lets the instrument in
    /// progress finish and never starts another cycle.
    pub async fn run(&self, shutdown: CancellationToken) {
        let watchers = if self.config.live_prices {
            self.spawn_price_watchers(&shutdown)
        } else {
            Vec::new()
        };

        tracing::info!(
            instruments = self.config.instruments.len(),
            horizons = self.config.horizons.len(),
            "🔄 Cycle loop starting, every {:?}",
            self.config.cycle_period
        );

        let mut ticker = interval_at(Instant::now(), self.config.cycle_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            self.run_cycle(&shutdown).await;

            if shutdown.is_cancelled() {
                break;
            }
        }

        for watcher in watchers {
            if let Err(e) = watcher.await {
                tracing::warn!("Price watcher ended abnormally: {}", e);
            }
        }

        tracing::info!("Cycle loop stopped");
    }

    /// One full cycle: reconcile and sweep, then every instrument in turn
    pub async fn run_cycle(&self, shutdown: &CancellationToken) -> CycleReport {
        let started_at = Utc::now();
        let mut report = CycleReport {
            started_at: Some(started_at),
            ..CycleReport::default()
        };

        tracing::info!("🔄 [CYCLE] Tick at {}", started_at.format("%H:%M:%S"));

        let prices = self.current_prices(started_at).await;
        match self.lifecycle.reconcile_all(&prices, started_at).await {
            Ok(summary) => {
                report.transitions = summary.transitions.len();
                if summary.failed > 0 {
                    tracing::warn!(failed = summary.failed, "Some signals failed to reconcile");
                }
            }
            Err(e) => tracing::error!("Reconcile failed, retrying next cycle: {}", e),
        }

        match self.lifecycle.sweep_expired(started_at).await {
            Ok(swept) => report.swept = swept,
            Err(e) => tracing::error!("Sweep failed, retrying next cycle: {}", e),
        }

        for instrument in &self.config.instruments {
            if shutdown.is_cancelled() {
                report.interrupted = true;
                tracing::info!("Shutdown requested, ending cycle early");
                break;
            }

            let outcome = self.process_instrument(instrument, started_at).await;
            report.record(&outcome);
        }

        report.degraded_connections = self
            .feed()
            .connection_states()
            .iter()
            .filter(|s| s.status == ConnectionStatus::Polling)
            .count();

        tracing::info!(
            instruments = report.instruments,
            published = report.published,
            suppressed = report.suppressed,
            below_threshold = report.below_threshold,
            skipped = report.skipped,
            failed = report.failed,
            transitions = report.transitions,
            swept = report.swept,
            degraded = report.degraded_connections,
            "✅ Cycle complete in {}ms",
            (Utc::now() - started_at).num_milliseconds()
        );

        report
    }

    async fn process_instrument(
        &self,
        instrument: &str,
        cycle_started_at: DateTime<Utc>,
    ) -> InstrumentOutcome {
        let results = self
            .fanout
            .analyze_all_horizons(instrument, &self.config.horizons)
            .await;

        if !self.validator.has_quorum(&results) {
            let setups = setup_count(&results);
            tracing::info!(
                instrument = %instrument,
                setups,
                required = self.validator.config().min_setup_horizons,
                "Not enough horizons with a setup"
            );
            return InstrumentOutcome::NoQuorum { setups };
        }

        let confluence = self.validator.validate(instrument, &results);
        if !confluence.is_valid {
            return InstrumentOutcome::BelowThreshold {
                score: confluence.confluence_score,
            };
        }

        let signal = match self
            .validator
            .build_signal(&results, &confluence, cycle_started_at)
        {
            Ok(signal) => signal,
            Err(e) => {
                tracing::warn!(instrument = %instrument, "Could not build signal: {}", e);
                return InstrumentOutcome::Failed(e.to_string());
            }
        };

        match self.lifecycle.publish(&signal).await {
            Ok(PublishOutcome::Published(_)) => InstrumentOutcome::Published,
            Ok(PublishOutcome::Suppressed { .. }) => InstrumentOutcome::Suppressed,
            Ok(PublishOutcome::Duplicate(_)) => InstrumentOutcome::Duplicate,
            Err(e) => {
                tracing::error!(instrument = %instrument, "Failed to publish signal: {}", e);
                InstrumentOutcome::Failed(e.to_string())
            }
        }
    }

    /// Streamed price when fresh within one cycle, otherwise a REST lookup
    async fn current_prices(&self, now: DateTime<Utc>) -> HashMap<String, f64> {
        let not_before = now
            - chrono::Duration::from_std(self.config.cycle_period)
                .unwrap_or_else(|_| chrono::Duration::minutes(15));

        let mut prices = HashMap::new();
        for instrument in &self.config.instruments {
            if let Some(price) = self.prices.fresh(instrument, not_before) {
                prices.insert(instrument.clone(), price);
                continue;
            }

            match self.feed().latest_price(instrument).await {
                Ok(price) => {
                    prices.insert(instrument.clone(), price);
                }
                Err(e) => tracing::warn!(
                    instrument = %instrument,
                    "No current price, reconciliation skipped: {}",
                    e
                ),
            }
        }
        prices
    }

    fn spawn_price_watchers(&self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        self.config
            .instruments
            .iter()
            .map(|instrument| {
                let feed = self.feed().clone();
                let cache = self.prices.clone();
                let shutdown = shutdown.clone();
                let instrument = instrument.clone();
                let interval = self.config.price_interval;

                tokio::spawn(async move {
                    let mut live = feed.stream_live(&instrument, interval);
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            update = live.next() => match update {
                                Some(candle) => cache.update(&instrument, candle.close, Utc::now()),
                                None => break,
                            },
                        }
                    }
                    live.disconnect().await;
                })
            })
            .collect()
    }
}
