use crate::analysis::{Analyzer, AnalyzerOptions};
use crate::error::PipelineError;
use crate::feed::MarketDataFeed;
use crate::models::{Horizon, TimeframeSetup};
use futures::future::join_all;
use std::fmt;
use std::sync::Arc;

/// Why a horizon produced no setup without being an error
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    InsufficientData,
    FeedUnavailable(String),
    NoSetups,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::InsufficientData => f.write_str("insufficient data"),
            SkipReason::FeedUnavailable(e) => write!(f, "feed unavailable: {}", e),
            SkipReason::NoSetups => f.write_str("no setups"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HorizonOutcome {
    Setup(TimeframeSetup),
    Skipped(SkipReason),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HorizonResult {
    pub horizon: Horizon,
    pub outcome: HorizonOutcome,
}

impl HorizonResult {
    pub fn setup(&self) -> Option<&TimeframeSetup> {
        match &self.outcome {
            HorizonOutcome::Setup(setup) => Some(setup),
            _ => None,
        }
    }
}

/// Horizons that produced a setup
pub fn setup_count(results: &[HorizonResult]) -> usize {
    results.iter().filter(|r| r.setup().is_some()).count()
}

/// Runs history fetch + analysis for every horizon of one instrument
pub struct TimeframeFanout {
    feed: MarketDataFeed,
    analyzer: Arc<dyn Analyzer>,
    options: AnalyzerOptions,
    history_limit: usize,
}

impl TimeframeFanout {
    pub fn new(feed: MarketDataFeed, analyzer: Arc<dyn Analyzer>, history_limit: usize) -> Self {
        Self {
            feed,
            analyzer,
            options: AnalyzerOptions::default(),
            history_limit,
        }
    }

    pub fn with_options(mut self, options: AnalyzerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn feed(&self) -> &MarketDataFeed {
        &self.feed
    }

    /// Analyze every horizon concurrently; returns once all have settled
    ///
    /// Results come back in the order of `horizons`. A failing horizon never
    /// affects the others.
    pub async fn analyze_all_horizons(
        &self,
        instrument: &str,
        horizons: &[Horizon],
    ) -> Vec<HorizonResult> {
        let tasks = horizons.iter().map(|&horizon| async move {
            HorizonResult {
                horizon,
                outcome: self.analyze_horizon(instrument, horizon).await,
            }
        });

        let results = join_all(tasks).await;

        tracing::info!(
            instrument = %instrument,
            horizons = results.len(),
            setups = setup_count(&results),
            "Fanout complete"
        );

        results
    }

    async fn analyze_horizon(&self, instrument: &str, horizon: Horizon) -> HorizonOutcome {
        let candles = match self
            .feed
            .fetch_history(instrument, horizon, self.history_limit)
            .await
        {
            Ok(candles) => candles,
            Err(e @ PipelineError::DataUnavailable { .. }) => {
                tracing::info!(instrument = %instrument, horizon = %horizon, "Skipped: {}", e);
                return HorizonOutcome::Skipped(SkipReason::InsufficientData);
            }
            Err(PipelineError::Network(e)) => {
                tracing::warn!(instrument = %instrument, horizon = %horizon, "Feed unavailable: {}", e);
                return HorizonOutcome::Skipped(SkipReason::FeedUnavailable(e));
            }
            Err(e) => {
                tracing::warn!(instrument = %instrument, horizon = %horizon, "History fetch failed: {}", e);
                return HorizonOutcome::Failed(e.to_string());
            }
        };

        let output = match self
            .analyzer
            .analyze(&candles, instrument, horizon, &self.options)
            .await
        {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(
                    instrument = %instrument,
                    horizon = %horizon,
                    analyzer = self.analyzer.name(),
                    "Analyzer failed: {}",
                    e
                );
                return HorizonOutcome::Failed(e.to_string());
            }
        };

        match output.best() {
            Some(mut setup) => {
                setup.horizon = horizon;
                tracing::info!(
                    instrument = %instrument,
                    horizon = %horizon,
                    direction = %setup.direction,
                    confidence = setup.confidence,
                    "Setup found"
                );
                HorizonOutcome::Setup(setup)
            }
            None => {
                tracing::debug!(instrument = %instrument, horizon = %horizon, "No setups");
                HorizonOutcome::Skipped(SkipReason::NoSetups)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalysisOutput;
    use crate::feed::{CandleStream, DepthStream, FeedConfig, MarketDataSource};
    use crate::models::{Candle, Direction, EntryZone};
    use async_trait::async_trait;

    /// Per-horizon scripted history
    struct HorizonSource;

    #[async_trait]
    impl MarketDataSource for HorizonSource {
        async fn fetch_klines(
            &self,
            _instrument: &str,
            interval: Horizon,
            _limit: usize,
        ) -> Result<Vec<Candle>, PipelineError> {
            let n = match interval {
                Horizon::M1 => 30,
                Horizon::M5 => return Err(PipelineError::Network("connection reset".into())),
                Horizon::M15 => return Err(PipelineError::Http { status: 400, body: "bad".into() }),
                _ => 300,
            };
            Ok((0..n)
                .map(|i| Candle {
                    time: i as i64 * interval.duration_secs(),
                    open: 100.0,
                    high: 101.0,
                    low: 99.0,
                    close: 100.0,
                    volume: 1.0,
                    is_closed: true,
                })
                .collect())
        }

        async fn connect_candles(&self, _: &str, _: Horizon) -> Result<CandleStream, PipelineError> {
            Err(PipelineError::Network("unused".into()))
        }

        async fn connect_depth(&self, _: &str) -> Result<DepthStream, PipelineError> {
            Err(PipelineError::Network("unused".into()))
        }
    }

    /// LONG on hourly and above, nothing on 30m, error on 1w
    struct FixedAnalyzer;

    #[async_trait]
    impl Analyzer for FixedAnalyzer {
        async fn analyze(
            &self,
            _candles: &[Candle],
            _instrument: &str,
            horizon: Horizon,
            _options: &AnalyzerOptions,
        ) -> Result<AnalysisOutput, PipelineError> {
            match horizon {
                Horizon::M30 => Ok(AnalysisOutput::empty()),
                Horizon::W1 => Err(PipelineError::Analyzer("model crashed".into())),
                _ => Ok(AnalysisOutput {
                    setups: vec![TimeframeSetup {
                        horizon,
                        direction: Direction::Long,
                        entry_zone: EntryZone { low: 99.0, high: 101.0 },
                        stop_loss: 95.0,
                        targets: Vec::new(),
                        confidence: 0.8,
                    }],
                }),
            }
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    fn fanout() -> TimeframeFanout {
        let feed = MarketDataFeed::new(
            Arc::new(HorizonSource),
            FeedConfig {
                retry_attempts: 1,
                ..FeedConfig::default()
            },
        );
        TimeframeFanout::new(feed, Arc::new(FixedAnalyzer), 300)
    }

    #[tokio::test]
    async fn test_short_history_is_skipped_as_insufficient() {
        let results = fanout()
            .analyze_all_horizons("BTCUSDT", &[Horizon::M1])
            .await;

        assert_eq!(
            results[0].outcome,
            HorizonOutcome::Skipped(SkipReason::InsufficientData)
        );
        assert_eq!(SkipReason::InsufficientData.to_string(), "insufficient data");
    }

    #[tokio::test]
    async fn test_every_horizon_settles_independently() {
        let results = fanout()
            .analyze_all_horizons("BTCUSDT", &Horizon::ALL)
            .await;

        assert_eq!(results.len(), 8);
        assert_eq!(
            results.iter().map(|r| r.horizon).collect::<Vec<_>>(),
            Horizon::ALL.to_vec()
        );

        assert!(matches!(results[1].outcome, HorizonOutcome::Skipped(SkipReason::FeedUnavailable(_))));
        assert!(matches!(results[2].outcome, HorizonOutcome::Failed(_)));
        assert_eq!(results[3].outcome, HorizonOutcome::Skipped(SkipReason::NoSetups));
        assert!(matches!(results[7].outcome, HorizonOutcome::Failed(_)));

        // 1h, 4h, 1d survive the failures around them
        assert_eq!(setup_count(&results), 3);
        assert_eq!(results[5].setup().unwrap().horizon, Horizon::H4);
    }
}
