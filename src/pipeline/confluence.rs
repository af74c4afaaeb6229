use super::fanout::{setup_count, HorizonResult};
use crate::error::PipelineError;
use crate::models::{ConfluenceResult, Direction, Horizon, Signal, SignalStatus, TimeframeSetup};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};

/// Confluence gate settings
#[derive(Debug, Clone)]
pub struct ConfluenceConfig {
    /// Minimum score (0..=100) for a valid result
    pub threshold: f64,
    /// Minimum horizons with a setup before validating at all
    pub min_setup_horizons: usize,
    pub validity_window: chrono::Duration,
    pub weights: HashMap<Horizon, f64>,
}

impl Default for ConfluenceConfig {
    fn default() -> Self {
        Self {
            threshold: 70.0,
            min_setup_horizons: 4,
            validity_window: chrono::Duration::hours(24),
            weights: Horizon::ALL
                .iter()
                .map(|h| (*h, h.default_weight()))
                .collect(),
        }
    }
}

impl ConfluenceConfig {
    pub fn weight(&self, horizon: Horizon) -> f64 {
        self.weights
            .get(&horizon)
            .copied()
            .unwrap_or_else(|| horizon.default_weight())
    }
}

/// Weighted cross-horizon agreement and signal synthesis
pub struct ConfluenceValidator {
    config: ConfluenceConfig,
}

impl ConfluenceValidator {
    pub fn new(config: ConfluenceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConfluenceConfig {
        &self.config
    }

    /// Enough horizons produced a setup to be worth validating
    pub fn has_quorum(&self, results: &[HorizonResult]) -> bool {
        setup_count(results) >= self.config.min_setup_horizons
    }

    /// Score agreement across the horizons that produced a setup
    ///
    /// `score = 100 * weight(majority direction) / weight(all setups)`.
    /// A tie has no direction, no agreeing horizons and is never valid.
    pub fn validate(&self, instrument: &str, results: &[HorizonResult]) -> ConfluenceResult {
        let setups: Vec<&TimeframeSetup> = results.iter().filter_map(|r| r.setup()).collect();

        let weight_of = |direction: Direction| -> f64 {
            setups
                .iter()
                .filter(|s| s.direction == direction)
                .map(|s| self.config.weight(s.horizon))
                .sum()
        };
        let long = weight_of(Direction::Long);
        let short = weight_of(Direction::Short);
        let total = long + short;

        if total <= 0.0 {
            return ConfluenceResult {
                instrument: instrument.to_string(),
                direction: None,
                confluence_score: 0.0,
                agreeing_horizons: BTreeSet::new(),
                is_valid: false,
            };
        }

        let (direction, majority) = if long > short {
            (Some(Direction::Long), long)
        } else if short > long {
            (Some(Direction::Short), short)
        } else {
            (None, long)
        };

        let confluence_score = (100.0 * majority / total).clamp(0.0, 100.0);

        let agreeing_horizons: BTreeSet<Horizon> = match direction {
            Some(d) => setups
                .iter()
                .filter(|s| s.direction == d)
                .map(|s| s.horizon)
                .collect(),
            None => BTreeSet::new(),
        };

        let is_valid = direction.is_some()
            && !agreeing_horizons.is_empty()
            && confluence_score >= self.config.threshold;

        tracing::info!(
            instrument = %instrument,
            direction = ?direction,
            score = confluence_score,
            agreeing = agreeing_horizons.len(),
            valid = is_valid,
            "Confluence evaluated"
        );

        ConfluenceResult {
            instrument: instrument.to_string(),
            direction,
            confluence_score,
            agreeing_horizons,
            is_valid,
        }
    }

    /// Turn a valid confluence into a signal
    ///
    /// The basis is the agreeing setup with the highest confidence; its entry
    /// zone midpoint becomes the entry. The id is fixed by instrument,
    /// direction and cycle start.
    pub fn build_signal(
        &self,
        results: &[HorizonResult],
        confluence: &ConfluenceResult,
        cycle_started_at: DateTime<Utc>,
    ) -> Result<Signal, PipelineError> {
        let direction = match (confluence.is_valid, confluence.direction) {
            (true, Some(direction)) => direction,
            _ => {
                return Err(PipelineError::Analyzer(format!(
                    "{}: confluence not valid, no signal",
                    confluence.instrument
                )))
            }
        };

        let basis = results
            .iter()
            .filter_map(|r| r.setup())
            .filter(|s| s.direction == direction && confluence.agreeing_horizons.contains(&s.horizon))
            .max_by(|a, b| {
                a.confidence
                    .total_cmp(&b.confidence)
                    .then(a.horizon.cmp(&b.horizon))
            })
            .ok_or_else(|| {
                PipelineError::Analyzer(format!(
                    "{}: no agreeing setup to build from",
                    confluence.instrument
                ))
            })?;

        let entry = basis.entry_zone.midpoint();
        let stop_on_right_side = match direction {
            Direction::Long => basis.stop_loss < entry,
            Direction::Short => basis.stop_loss > entry,
        };
        if entry <= 0.0 || !stop_on_right_side {
            return Err(PipelineError::Analyzer(format!(
                "{} {}: inconsistent {} setup (entry {}, stop {})",
                confluence.instrument, basis.horizon, direction, entry, basis.stop_loss
            )));
        }

        let risk_pct = (entry - basis.stop_loss).abs() / entry * 100.0;

        Ok(Signal {
            id: Signal::fingerprint(&confluence.instrument, direction, cycle_started_at.timestamp_millis()),
            instrument: confluence.instrument.clone(),
            direction,
            entry,
            stop_loss: basis.stop_loss,
            targets: basis.targets.clone(),
            confluence_score: confluence.confluence_score,
            risk_pct,
            agreeing_horizons: confluence.agreeing_horizons.iter().copied().collect(),
            basis_horizon: basis.horizon,
            status: SignalStatus::Active,
            hit_targets: BTreeSet::new(),
            published_at: cycle_started_at,
            expires_at: cycle_started_at + self.config.validity_window,
            updated_at: cycle_started_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntryZone, Target};
    use crate::pipeline::{HorizonOutcome, SkipReason};

    fn setup(horizon: Horizon, direction: Direction, confidence: f64) -> HorizonResult {
        let (stop_loss, targets) = match direction {
            Direction::Long => (49_500.0, vec![Target { price: 51_000.0, probability: 0.6 }]),
            Direction::Short => (50_500.0, vec![Target { price: 49_000.0, probability: 0.6 }]),
        };
        HorizonResult {
            horizon,
            outcome: HorizonOutcome::Setup(TimeframeSetup {
                horizon,
                direction,
                entry_zone: EntryZone { low: 49_900.0, high: 50_100.0 },
                stop_loss,
                targets,
                confidence,
            }),
        }
    }

    fn skipped(horizon: Horizon) -> HorizonResult {
        HorizonResult {
            horizon,
            outcome: HorizonOutcome::Skipped(SkipReason::NoSetups),
        }
    }

    fn validator() -> ConfluenceValidator {
        ConfluenceValidator::new(ConfluenceConfig::default())
    }

    #[test]
    fn test_four_of_eight_long_with_75_percent_weight_is_valid() {
        // long 30m+1h+1d+1w = 24 vs short 5m+4h = 8
        let results = vec![
            skipped(Horizon::M1),
            setup(Horizon::M5, Direction::Short, 0.5),
            skipped(Horizon::M15),
            setup(Horizon::M30, Direction::Long, 0.6),
            setup(Horizon::H1, Direction::Long, 0.6),
            setup(Horizon::H4, Direction::Short, 0.7),
            setup(Horizon::D1, Direction::Long, 0.9),
            setup(Horizon::W1, Direction::Long, 0.8),
        ];

        let validator = validator();
        assert!(validator.has_quorum(&results));

        let result = validator.validate("BTCUSDT", &results);
        assert!(result.is_valid);
        assert_eq!(result.direction, Some(Direction::Long));
        assert!((result.confluence_score - 75.0).abs() < 1e-9);
        assert_eq!(result.agreeing_horizons.len(), 4);
        assert!(result.agreeing_horizons.contains(&Horizon::W1));
        assert!(!result.agreeing_horizons.contains(&Horizon::H4));
    }

    #[test]
    fn test_higher_four_outweigh_lower_four() {
        // 1h+4h+1d+1w = 26 of 36
        let results = vec![
            setup(Horizon::M1, Direction::Short, 0.5),
            setup(Horizon::M5, Direction::Short, 0.5),
            setup(Horizon::M15, Direction::Short, 0.5),
            setup(Horizon::M30, Direction::Short, 0.5),
            setup(Horizon::H1, Direction::Long, 0.6),
            setup(Horizon::H4, Direction::Long, 0.7),
            setup(Horizon::D1, Direction::Long, 0.9),
            setup(Horizon::W1, Direction::Long, 0.8),
        ];

        let result = validator().validate("BTCUSDT", &results);
        assert!(result.is_valid);
        assert_eq!(result.direction, Some(Direction::Long));
        assert!((result.confluence_score - 2600.0 / 36.0).abs() < 1e-9);
    }

    #[test]
    fn test_below_threshold_is_invalid() {
        // 1h+4h = 11 vs 1d = 7 -> 61%
        let results = vec![
            setup(Horizon::H1, Direction::Long, 0.6),
            setup(Horizon::H4, Direction::Long, 0.6),
            setup(Horizon::D1, Direction::Short, 0.6),
        ];

        let result = validator().validate("BTCUSDT", &results);
        assert_eq!(result.direction, Some(Direction::Long));
        assert!(!result.is_valid);
        assert!(result.confluence_score < 70.0);
    }

    #[test]
    fn test_tie_has_no_direction() {
        // 4h (6) vs 1m+1h (1+5)
        let results = vec![
            setup(Horizon::H4, Direction::Long, 0.9),
            setup(Horizon::M1, Direction::Short, 0.9),
            setup(Horizon::H1, Direction::Short, 0.9),
        ];

        let result = validator().validate("ETHUSDT", &results);
        assert_eq!(result.direction, None);
        assert!(result.agreeing_horizons.is_empty());
        assert!(!result.is_valid);
        assert_eq!(result.confluence_score, 50.0);
    }

    #[test]
    fn test_no_setups_is_invalid_with_zero_score() {
        let results: Vec<_> = Horizon::ALL.iter().map(|h| skipped(*h)).collect();

        let validator = validator();
        assert!(!validator.has_quorum(&results));

        let result = validator.validate("BTCUSDT", &results);
        assert_eq!(result.confluence_score, 0.0);
        assert!(!result.is_valid);
    }

    #[test]
    fn test_score_bounded_and_valid_implies_threshold() {
        let directions = [Direction::Long, Direction::Short];
        let validator = validator();

        // every assignment of LONG/SHORT/none across the eight horizons
        for mask in 0..3u32.pow(8) {
            let mut m = mask;
            let results: Vec<HorizonResult> = Horizon::ALL
                .iter()
                .map(|h| {
                    let pick = m % 3;
                    m /= 3;
                    match pick {
                        0 => skipped(*h),
                        i => setup(*h, directions[i as usize - 1], 0.5),
                    }
                })
                .collect();

            let result = validator.validate("X", &results);
            assert!((0.0..=100.0).contains(&result.confluence_score));
            if result.is_valid {
                assert!(result.confluence_score >= 70.0);
                assert!(result.direction.is_some());
            }
        }
    }

    #[test]
    fn test_build_signal_uses_most_confident_agreeing_setup() {
        let results = vec![
            setup(Horizon::H1, Direction::Long, 0.6),
            setup(Horizon::H4, Direction::Long, 0.95),
            setup(Horizon::D1, Direction::Long, 0.7),
            setup(Horizon::W1, Direction::Long, 0.8),
        ];
        let validator = validator();
        let confluence = validator.validate("BTCUSDT", &results);
        let cycle = Utc::now();

        let signal = validator.build_signal(&results, &confluence, cycle).unwrap();

        assert_eq!(signal.basis_horizon, Horizon::H4);
        assert_eq!(signal.entry, 50_000.0);
        assert_eq!(signal.stop_loss, 49_500.0);
        assert!((signal.risk_pct - 1.0).abs() < 1e-9);
        assert_eq!(signal.status, SignalStatus::Active);
        assert_eq!(signal.expires_at - signal.published_at, chrono::Duration::hours(24));
        assert_eq!(
            signal.id,
            Signal::fingerprint("BTCUSDT", Direction::Long, cycle.timestamp_millis())
        );
    }

    #[test]
    fn test_build_signal_rejects_invalid_confluence() {
        let results = vec![setup(Horizon::H1, Direction::Long, 0.6), setup(Horizon::H4, Direction::Short, 0.6)];
        let validator = validator();
        let confluence = validator.validate("BTCUSDT", &results);

        assert!(validator.build_signal(&results, &confluence, Utc::now()).is_err());
    }
}
