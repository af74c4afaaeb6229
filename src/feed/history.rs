use super::{FeedConfig, MarketDataSource};
use crate::error::PipelineError;
use crate::models::{Candle, Horizon};
use tokio::time::{sleep, timeout};

/// Fetch klines with the retry policy, then enforce a minimum length
///
/// Retryable failures (timeouts, 429, 5xx) are retried up to
/// `retry_attempts` times with a linear `attempt * retry_base_delay` pause.
/// Terminal failures propagate on the first attempt.
pub async fn fetch_history(
    source: &dyn MarketDataSource,
    config: &FeedConfig,
    instrument: &str,
    interval: Horizon,
    limit: usize,
    min_candles: usize,
) -> Result<Vec<Candle>, PipelineError> {
    let candles = fetch_with_retry(source, config, instrument, interval, limit).await?;

    if candles.len() < min_candles {
        return Err(PipelineError::DataUnavailable {
            instrument: instrument.to_string(),
            interval: interval.to_string(),
            got: candles.len(),
            required: min_candles,
        });
    }

    Ok(candles)
}

async fn fetch_with_retry(
    source: &dyn MarketDataSource,
    config: &FeedConfig,
    instrument: &str,
    interval: Horizon,
    limit: usize,
) -> Result<Vec<Candle>, PipelineError> {
    let max_attempts = config.retry_attempts.max(1);
    let mut attempt = 1;

    loop {
        let result = match timeout(
            config.request_timeout,
            source.fetch_klines(instrument, interval, limit),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Network(format!(
                "request timed out after {:?}",
                config.request_timeout
            ))),
        };

        match result {
            Ok(candles) => {
                if attempt > 1 {
                    tracing::info!(
                        instrument = %instrument,
                        interval = %interval,
                        attempt,
                        "Fetched history after retry"
                    );
                }
                return Ok(normalize(candles));
            }
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = config.retry_base_delay * attempt;
                tracing::warn!(
                    instrument = %instrument,
                    interval = %interval,
                    "Attempt {}/{} failed: {}. Retrying in {:?}...",
                    attempt,
                    max_attempts,
                    e,
                    delay
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) if e.is_retryable() => {
                return Err(PipelineError::Network(format!(
                    "{} {} unreachable after {} attempts: {}",
                    instrument, interval, max_attempts, e
                )));
            }
            Err(e) => return Err(e),
        }
    }
}

/// Sort ascending by time and drop duplicate buckets, keeping the latest copy
fn normalize(mut candles: Vec<Candle>) -> Vec<Candle> {
    candles.sort_by_key(|c| c.time);
    candles.dedup_by(|later, earlier| {
        if later.time == earlier.time {
            *earlier = *later;
            true
        } else {
            false
        }
    });
    candles
}
