use super::{AnalysisOutput, Analyzer, AnalyzerOptions};
use crate::error::PipelineError;
use crate::indicators::{calculate_atr, calculate_ema, calculate_sma, closes};
use crate::models::{Candle, Direction, EntryZone, Horizon, Target, TimeframeSetup};
use async_trait::async_trait;

/// Trend analyzer settings
#[derive(Debug, Clone)]
pub struct TrendConfig {
    pub fast_period: usize,
    pub slow_period: usize,
    pub atr_period: usize,
    /// Stop distance in ATRs
    pub stop_atr: f64,
    /// Half-width of the entry zone in ATRs
    pub zone_atr: f64,
    /// Targets as multiples of the risk (entry to stop)
    pub target_r_multiples: Vec<f64>,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            fast_period: 20,
            slow_period: 50,
            atr_period: 14,
            stop_atr: 1.5,
            zone_atr: 0.25,
            target_r_multiples: vec![1.0, 2.0, 3.0],
        }
    }
}

/// Built-in moving-average trend detector
///
/// LONG when the fast EMA is above the slow SMA and price is above the fast
/// EMA; SHORT on the mirror image. Stops and targets are ATR based.
/// Confidence grows with the EMA/SMA spread measured in ATRs.
#[derive(Debug, Clone, Default)]
pub struct TrendAnalyzer {
    config: TrendConfig,
}

impl TrendAnalyzer {
    pub fn new(config: TrendConfig) -> Self {
        Self { config }
    }

    pub fn min_candles_required(&self) -> usize {
        self.config
            .slow_period
            .max(self.config.fast_period)
            .max(self.config.atr_period + 1)
    }

    fn detect(&self, candles: &[Candle], horizon: Horizon) -> Option<TimeframeSetup> {
        let prices = closes(candles);
        let last = *prices.last()?;
        let fast = calculate_ema(&prices, self.config.fast_period)?;
        let slow = calculate_sma(&prices, self.config.slow_period)?;
        let atr = calculate_atr(candles, self.config.atr_period)?;

        if atr <= 0.0 {
            return None;
        }

        let direction = if fast > slow && last > fast {
            Direction::Long
        } else if fast < slow && last < fast {
            Direction::Short
        } else {
            return None;
        };

        let sign = match direction {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        };

        let risk = self.config.stop_atr * atr;
        let stop_loss = last - sign * risk;
        let targets = self
            .config
            .target_r_multiples
            .iter()
            .enumerate()
            .map(|(i, r)| Target {
                price: last + sign * r * risk,
                probability: (0.7 - 0.2 * i as f64).max(0.1),
            })
            .collect();

        let spread = (fast - slow).abs() / atr;

        Some(TimeframeSetup {
            horizon,
            direction,
            entry_zone: EntryZone {
                low: last - self.config.zone_atr * atr,
                high: last + self.config.zone_atr * atr,
            },
            stop_loss,
            targets,
            confidence: (spread / 2.0).clamp(0.0, 1.0),
        })
    }
}

#[async_trait]
impl Analyzer for TrendAnalyzer {
    async fn analyze(
        &self,
        candles: &[Candle],
        instrument: &str,
        horizon: Horizon,
        options: &AnalyzerOptions,
    ) -> Result<AnalysisOutput, PipelineError> {
        if candles.len() < self.min_candles_required() {
            return Err(PipelineError::Analyzer(format!(
                "{} {}: {} candles, need {}",
                instrument,
                horizon,
                candles.len(),
                self.min_candles_required()
            )));
        }

        let setups = self
            .detect(candles, horizon)
            .filter(|s| s.confidence >= options.min_confidence)
            .into_iter()
            .collect::<Vec<_>>();

        tracing::debug!(
            instrument = %instrument,
            horizon = %horizon,
            setups = setups.len(),
            "Trend analysis complete"
        );

        Ok(AnalysisOutput { setups })
    }

    fn name(&self) -> &str {
        "trend"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(start: f64, step: f64, n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let close = start + step * i as f64;
                Candle {
                    time: i as i64 * 3600,
                    open: close - step,
                    high: close + 1.0,
                    low: close - 1.0,
                    close,
                    volume: 10.0,
                    is_closed: true,
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn test_uptrend_gives_long_setup() {
        let analyzer = TrendAnalyzer::default();
        let candles = series(100.0, 1.0, 80);

        let output = analyzer
            .analyze(&candles, "BTCUSDT", Horizon::H4, &AnalyzerOptions::default())
            .await
            .unwrap();

        let setup = output.best().expect("long setup");
        assert_eq!(setup.direction, Direction::Long);
        assert_eq!(setup.horizon, Horizon::H4);
        assert!(setup.stop_loss < setup.entry_zone.low);
        assert!(setup.targets.windows(2).all(|t| t[0].price < t[1].price));
        assert!((0.0..=1.0).contains(&setup.confidence));
    }

    #[tokio::test]
    async fn test_downtrend_gives_short_setup() {
        let analyzer = TrendAnalyzer::default();
        let candles = series(300.0, -1.0, 80);

        let setup = analyzer
            .analyze(&candles, "ETHUSDT", Horizon::D1, &AnalyzerOptions::default())
            .await
            .unwrap()
            .best()
            .expect("short setup");

        assert_eq!(setup.direction, Direction::Short);
        assert!(setup.stop_loss > setup.entry_zone.high);
        assert!(setup.targets[0].price < setup.entry_zone.low);
    }

    #[tokio::test]
    async fn test_flat_market_has_no_setups() {
        let analyzer = TrendAnalyzer::default();
        let candles = series(100.0, 0.0, 80);

        let output = analyzer
            .analyze(&candles, "BTCUSDT", Horizon::H1, &AnalyzerOptions::default())
            .await
            .unwrap();
        assert!(output.setups.is_empty());
    }

    #[tokio::test]
    async fn test_min_confidence_filters() {
        let analyzer = TrendAnalyzer::default();
        let candles = series(100.0, 1.0, 80);
        let options = AnalyzerOptions { min_confidence: 1.01 };

        let output = analyzer
            .analyze(&candles, "BTCUSDT", Horizon::H1, &options)
            .await
            .unwrap();
        assert!(output.setups.is_empty());
    }

    #[tokio::test]
    async fn test_short_series_is_an_error() {
        let analyzer = TrendAnalyzer::default();
        let result = analyzer
            .analyze(&series(100.0, 1.0, 10), "BTCUSDT", Horizon::H1, &AnalyzerOptions::default())
            .await;
        assert!(matches!(result, Err(PipelineError::Analyzer(_))));
    }
}
