//! Average True Range
//!
//! True range is the largest of `high - low`, `|high - prev_close|` and
//! `|low - prev_close|`. Smoothed with Wilder's average.

use crate::models::Candle;

/// True range for every candle after the first
pub fn true_ranges(candles: &[Candle]) -> Vec<f64> {
    candles
        .windows(2)
        .map(|pair| {
            let (prev, cur) = (&pair[0], &pair[1]);
            (cur.high - cur.low)
                .max((cur.high - prev.close).abs())
                .max((cur.low - prev.close).abs())
        })
        .collect()
}

/// Current ATR, or None with fewer than `period + 1` candles
pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 {
        return None;
    }
    let ranges = true_ranges(candles);
    if ranges.len() < period {
        return None;
    }

    let seed = ranges[..period].iter().sum::<f64>() / period as f64;
    let n = period as f64;
    Some(
        ranges[period..]
            .iter()
            .fold(seed, |atr, tr| (atr * (n - 1.0) + tr) / n),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candles(bars: &[(f64, f64, f64)]) -> Vec<Candle> {
        bars.iter()
            .enumerate()
            .map(|(i, &(high, low, close))| Candle {
                time: i as i64 * 3600,
                open: close,
                high,
                low,
                close,
                volume: 1000.0,
                is_closed: true,
            })
            .collect()
    }

    #[test]
    fn test_atr_of_constant_range() {
        let bars = vec![(101.0, 99.0, 100.0); 15];
        let atr = calculate_atr(&candles(&bars), 14).unwrap();
        assert!((atr - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_gap_widens_true_range() {
        let c = candles(&[(101.0, 99.0, 100.0), (111.0, 109.0, 110.0)]);
        assert_eq!(true_ranges(&c), vec![11.0]);
    }

    #[test]
    fn test_volatile_market_has_larger_atr() {
        let calm = vec![(101.0, 99.0, 100.0); 20];
        let wild: Vec<_> = (0..20)
            .map(|i| if i % 2 == 0 { (110.0, 90.0, 105.0) } else { (108.0, 92.0, 95.0) })
            .collect();

        let calm_atr = calculate_atr(&candles(&calm), 14).unwrap();
        let wild_atr = calculate_atr(&candles(&wild), 14).unwrap();
        assert!(wild_atr > 5.0 * calm_atr);
    }

    #[test]
    fn test_insufficient_data() {
        let bars = vec![(101.0, 99.0, 100.0); 2];
        assert!(calculate_atr(&candles(&bars), 14).is_none());
    }
}
