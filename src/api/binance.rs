use crate::error::PipelineError;
use crate::feed::{CandleStream, DepthStream, FeedConfig, MarketDataSource};
use crate::models::{Candle, DepthSnapshot, Horizon, PriceLevel};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde::Deserialize;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const KLINES_PATH: &str = "/api/v3/klines";
const DEFAULT_RATE_LIMIT_RPM: u32 = 600;

type BinanceRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Client for Binance-compatible REST and websocket market data
///
/// Cloneable; all clones share the same rate limiter.
#[derive(Clone)]
pub struct BinanceClient {
    client: Client,
    rest_base_url: String,
    ws_base_url: String,
    depth_levels: u16,
    connect_timeout: Duration,
    rate_limiter: Arc<BinanceRateLimiter>,
}

// ============== Wire Types ==============

#[derive(Debug, Deserialize)]
struct KlineEvent {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "k")]
    kline: KlinePayload,
}

#[derive(Debug, Deserialize)]
struct KlinePayload {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "x")]
    is_closed: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DepthPayload {
    last_update_id: u64,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

fn parse_price(raw: &str) -> Result<f64, PipelineError> {
    raw.parse::<f64>()
        .map_err(|e| PipelineError::Parse(format!("invalid number '{}': {}", raw, e)))
}

/// Kline row: [openTime, open, high, low, close, volume, closeTime, ...]
fn candle_from_row(row: &[serde_json::Value], now_ms: i64) -> Result<Candle, PipelineError> {
    if row.len() < 7 {
        return Err(PipelineError::Parse(format!(
            "kline row has {} fields, expected at least 7",
            row.len()
        )));
    }

    let int_at = |i: usize| {
        row[i]
            .as_i64()
            .ok_or_else(|| PipelineError::Parse(format!("kline field {} is not an integer", i)))
    };
    let num_at = |i: usize| match &row[i] {
        serde_json::Value::String(s) => parse_price(s),
        serde_json::Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| PipelineError::Parse(format!("kline field {} out of range", i))),
        _ => Err(PipelineError::Parse(format!("kline field {} is not numeric", i))),
    };

    Ok(Candle {
        time: int_at(0)? / 1000,
        open: num_at(1)?,
        high: num_at(2)?,
        low: num_at(3)?,
        close: num_at(4)?,
        volume: num_at(5)?,
        is_closed: int_at(6)? < now_ms,
    })
}

fn parse_levels(raw: &[[String; 2]]) -> Result<Vec<PriceLevel>, PipelineError> {
    raw.iter()
        .map(|[price, qty]| {
            Ok(PriceLevel {
                price: parse_price(price)?,
                quantity: parse_price(qty)?,
            })
        })
        .collect()
}

/// Parse a websocket kline event into a candle
pub(crate) fn parse_kline_message(text: &str) -> Result<Candle, PipelineError> {
    let event: KlineEvent = serde_json::from_str(text)?;
    if event.event_type != "kline" {
        return Err(PipelineError::Parse(format!(
            "unexpected event type '{}'",
            event.event_type
        )));
    }
    let k = event.kline;
    Ok(Candle {
        time: k.open_time / 1000,
        open: parse_price(&k.open)?,
        high: parse_price(&k.high)?,
        low: parse_price(&k.low)?,
        close: parse_price(&k.close)?,
        volume: parse_price(&k.volume)?,
        is_closed: k.is_closed,
    })
}

/// Parse a partial-book depth message
pub(crate) fn parse_depth_message(
    instrument: &str,
    text: &str,
) -> Result<DepthSnapshot, PipelineError> {
    let payload: DepthPayload = serde_json::from_str(text)?;
    Ok(DepthSnapshot {
        instrument: instrument.to_string(),
        last_update_id: payload.last_update_id,
        bids: parse_levels(&payload.bids)?,
        asks: parse_levels(&payload.asks)?,
        received_at: Utc::now(),
    })
}

// ============== Implementation ==============

impl BinanceClient {
    pub fn new(config: &FeedConfig) -> Result<Self, PipelineError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| PipelineError::Config(format!("failed to build HTTP client: {}", e)))?;

        let rpm = NonZeroU32::new(config.requests_per_minute)
            .or(NonZeroU32::new(DEFAULT_RATE_LIMIT_RPM))
            .ok_or_else(|| PipelineError::Config("invalid rate limit".into()))?;
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_minute(rpm)));

        Ok(Self {
            client,
            rest_base_url: config.rest_base_url.trim_end_matches('/').to_string(),
            ws_base_url: config.ws_base_url.trim_end_matches('/').to_string(),
            depth_levels: config.depth_levels,
            connect_timeout: config.request_timeout,
            rate_limiter,
        })
    }

    fn kline_stream_url(&self, instrument: &str, interval: Horizon) -> String {
        format!(
            "{}/{}@kline_{}",
            self.ws_base_url,
            instrument.to_lowercase(),
            interval.as_str()
        )
    }

    fn depth_stream_url(&self, instrument: &str) -> String {
        format!(
            "{}/{}@depth{}@100ms",
            self.ws_base_url,
            instrument.to_lowercase(),
            self.depth_levels
        )
    }

    async fn open_socket(
        &self,
        url: &str,
    ) -> Result<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        PipelineError,
    > {
        let (ws_stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| PipelineError::Network(format!("connect timeout for {}", url)))??;

        tracing::debug!(url = %url, "Websocket connected");
        Ok(ws_stream)
    }
}

#[async_trait]
impl MarketDataSource for BinanceClient {
    /// Single attempt, no retry; the feed owns the retry policy
    async fn fetch_klines(
        &self,
        instrument: &str,
        interval: Horizon,
        limit: usize,
    ) -> Result<Vec<Candle>, PipelineError> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}{}", self.rest_base_url, KLINES_PATH);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("symbol", instrument.to_uppercase()),
                ("interval", interval.as_str().to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(PipelineError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let rows: Vec<Vec<serde_json::Value>> = response
            .json()
            .await
            .map_err(|e| PipelineError::Parse(format!("klines for {}: {}", instrument, e)))?;

        let now_ms = Utc::now().timestamp_millis();
        let candles = rows
            .into_iter()
            .map(|row| candle_from_row(&row, now_ms))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(
            instrument = %instrument,
            interval = %interval,
            count = candles.len(),
            "Fetched klines"
        );

        Ok(candles)
    }

    async fn connect_candles(
        &self,
        instrument: &str,
        interval: Horizon,
    ) -> Result<CandleStream, PipelineError> {
        let url = self.kline_stream_url(instrument, interval);
        let ws_stream = self.open_socket(&url).await?;

        let stream = ws_stream.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => Some(parse_kline_message(&text)),
                Ok(_) => None,
                Err(e) => Some(Err(PipelineError::from(e))),
            }
        });

        Ok(Box::pin(stream))
    }

    async fn connect_depth(&self, instrument: &str) -> Result<DepthStream, PipelineError> {
        let url = self.depth_stream_url(instrument);
        let ws_stream = self.open_socket(&url).await?;
        let instrument = instrument.to_string();

        let stream = ws_stream.filter_map(move |msg| {
            let instrument = instrument.clone();
            async move {
                match msg {
                    Ok(Message::Text(text)) => Some(parse_depth_message(&instrument, &text)),
                    Ok(_) => None,
                    Err(e) => Some(Err(PipelineError::from(e))),
                }
            }
        });

        Ok(Box::pin(stream))
    }
}
