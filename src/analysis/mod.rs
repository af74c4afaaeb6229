// Per-timeframe analyzer contract
pub mod trend;

pub use trend::{TrendAnalyzer, TrendConfig};

use crate::error::PipelineError;
use crate::models::{Candle, Horizon, TimeframeSetup};
use async_trait::async_trait;

/// Options passed through to every analyzer call
#[derive(Debug, Clone)]
pub struct AnalyzerOptions {
    /// Setups below this confidence are not reported
    pub min_confidence: f64,
}

impl Default for AnalyzerOptions {
    fn default() -> Self {
        Self { min_confidence: 0.0 }
    }
}

/// Candidate setups for one (instrument, horizon)
#[derive(Debug, Clone, Default)]
pub struct AnalysisOutput {
    pub setups: Vec<TimeframeSetup>,
}

impl AnalysisOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Highest-confidence candidate
    pub fn best(self) -> Option<TimeframeSetup> {
        self.setups
            .into_iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
    }
}

/// Single-timeframe setup detection
///
/// Implementations are opaque to the pipeline: they see a closed candle
/// series and report zero or more candidate setups.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(
        &self,
        candles: &[Candle],
        instrument: &str,
        horizon: Horizon,
        options: &AnalyzerOptions,
    ) -> Result<AnalysisOutput, PipelineError>;

    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, EntryZone};

    fn setup(confidence: f64) -> TimeframeSetup {
        TimeframeSetup {
            horizon: Horizon::H1,
            direction: Direction::Long,
            entry_zone: EntryZone { low: 99.0, high: 101.0 },
            stop_loss: 95.0,
            targets: Vec::new(),
            confidence,
        }
    }

    #[test]
    fn test_best_picks_highest_confidence() {
        let output = AnalysisOutput {
            setups: vec![setup(0.4), setup(0.9), setup(0.6)],
        };
        assert_eq!(output.best().unwrap().confidence, 0.9);
        assert!(AnalysisOutput::empty().best().is_none());
    }
}
