use crate::models::Candle;

/// Close prices, oldest first
pub fn closes(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(|c| c.close).collect()
}

/// Simple moving average over the most recent `period` values
pub fn calculate_sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }

    let sum: f64 = values[values.len() - period..].iter().sum();
    Some(sum / period as f64)
}

/// Exponential moving average, seeded with the SMA of the first `period` values
pub fn calculate_ema(values: &[f64], period: usize) -> Option<f64> {
    let seed = calculate_sma(values.get(..period)?, period)?;
    let k = 2.0 / (period as f64 + 1.0);

    Some(
        values[period..]
            .iter()
            .fold(seed, |ema, value| (value - ema) * k + ema),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sma_uses_latest_window() {
        let values = vec![1.0, 100.0, 102.0, 104.0, 106.0, 108.0];
        assert_eq!(calculate_sma(&values, 5), Some(104.0));
    }

    #[test]
    fn test_sma_insufficient_data() {
        assert!(calculate_sma(&[100.0, 102.0], 5).is_none());
        assert!(calculate_sma(&[100.0], 0).is_none());
    }

    #[test]
    fn test_ema_tracks_rising_series() {
        let values = vec![100.0, 102.0, 104.0, 106.0, 108.0, 110.0];
        let ema = calculate_ema(&values, 5).unwrap();
        assert!(ema > 104.0);
        assert!(ema < 110.0);
    }

    #[test]
    fn test_ema_of_flat_series_is_flat() {
        let values = vec![50.0; 30];
        assert_eq!(calculate_ema(&values, 10), Some(50.0));
        assert!(calculate_ema(&values[..5], 10).is_none());
    }
}
