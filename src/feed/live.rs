use super::{history, CandleStream, FeedConfig, LiveTable, MarketDataSource, ReconnectBackoff};
use crate::error::PipelineError;
use crate::models::{Candle, ConnectionState, ConnectionStatus, Horizon};
use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const UPDATE_BUFFER: usize = 256;

/// Consumer handle for one live candle stream
///
/// Dropping the handle cancels the connection task; `disconnect` also
/// waits for it to finish.
pub struct LiveStream {
    instrument: String,
    interval: Horizon,
    updates: mpsc::Receiver<Candle>,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl LiveStream {
    /// Next candle update, `None` once the stream is closed
    pub async fn next(&mut self) -> Option<Candle> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.updates.recv().await
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn interval(&self) -> Horizon {
        self.interval
    }

    /// Stop the stream; no update is delivered after this returns
    pub async fn disconnect(mut self) {
        self.cancel.cancel();
        self.updates.close();

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(
                    instrument = %self.instrument,
                    interval = %self.interval,
                    "Live stream task ended abnormally: {}",
                    e
                );
            }
        }
    }
}

impl Drop for LiveStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub(crate) fn spawn(
    id: u64,
    instrument: &str,
    interval: Horizon,
    source: Arc<dyn MarketDataSource>,
    config: Arc<FeedConfig>,
    table: Arc<LiveTable>,
) -> LiveStream {
    let (updates_tx, updates_rx) = mpsc::channel(UPDATE_BUFFER);
    let (state_tx, state_rx) = watch::channel(ConnectionState::new(instrument, interval));
    let cancel = CancellationToken::new();

    table.insert(id, state_rx.clone());

    let connection = Connection {
        id,
        instrument: instrument.to_string(),
        interval,
        backoff: config.backoff(),
        source,
        config,
        table,
        updates: updates_tx,
        state: state_tx,
        cancel: cancel.clone(),
        failures: 0,
    };

    LiveStream {
        instrument: instrument.to_string(),
        interval,
        updates: updates_rx,
        state: state_rx,
        cancel,
        task: Some(tokio::spawn(connection.run())),
    }
}

enum Phase {
    Connecting,
    Open(CandleStream),
    Reconnecting,
    Polling,
    Closed,
}

/// Connection task: CONNECTING -> OPEN -> RECONNECTING -> ... -> POLLING
///
/// Every await races the cancellation token and every delivery re-checks
/// it, so nothing is sent once the consumer has disconnected.
struct Connection {
    id: u64,
    instrument: String,
    interval: Horizon,
    source: Arc<dyn MarketDataSource>,
    config: Arc<FeedConfig>,
    backoff: ReconnectBackoff,
    table: Arc<LiveTable>,
    updates: mpsc::Sender<Candle>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
    /// Consecutive failures since the last successful open
    failures: u32,
}

impl Connection {
    async fn run(mut self) {
        tracing::info!(
            instrument = %self.instrument,
            interval = %self.interval,
            "Opening live stream"
        );

        let mut phase = Phase::Connecting;
        loop {
            phase = match phase {
                Phase::Connecting => self.connect().await,
                Phase::Open(stream) => self.pump(stream).await,
                Phase::Reconnecting => self.wait_before_reconnect().await,
                Phase::Polling => self.poll().await,
                Phase::Closed => break,
            };
        }

        self.set_status(ConnectionStatus::Closed);
        self.table.remove(&self.id);

        tracing::info!(
            instrument = %self.instrument,
            interval = %self.interval,
            "Live stream closed"
        );
    }

    async fn connect(&mut self) -> Phase {
        self.set_status(ConnectionStatus::Connecting);

        let result = tokio::select! {
            _ = self.cancel.cancelled() => return Phase::Closed,
            result = timeout(
                self.config.request_timeout,
                self.source.connect_candles(&self.instrument, self.interval),
            ) => result,
        };

        match result {
            Ok(Ok(stream)) => {
                self.failures = 0;
                self.state.send_modify(|s| {
                    s.status = ConnectionStatus::Open;
                    s.reconnect_attempts = 0;
                });
                tracing::info!(
                    instrument = %self.instrument,
                    interval = %self.interval,
                    "Live stream open"
                );
                Phase::Open(stream)
            }
            Ok(Err(e)) => self.on_failure(e),
            Err(_) => self.on_failure(PipelineError::Network(format!(
                "connect timed out after {:?}",
                self.config.request_timeout
            ))),
        }
    }

    async fn pump(&mut self, mut stream: CandleStream) -> Phase {
        loop {
            let item = tokio::select! {
                _ = self.cancel.cancelled() => return Phase::Closed,
                item = stream.next() => item,
            };

            match item {
                Some(Ok(candle)) => {
                    if !self.deliver(candle).await {
                        return Phase::Closed;
                    }
                }
                Some(Err(PipelineError::Parse(msg))) => {
                    tracing::warn!(
                        instrument = %self.instrument,
                        interval = %self.interval,
                        "Skipping malformed stream message: {}",
                        msg
                    );
                }
                Some(Err(e)) => return self.on_failure(e),
                None => {
                    return self.on_failure(PipelineError::Network("stream closed by upstream".into()))
                }
            }
        }
    }

    fn on_failure(&mut self, error: PipelineError) -> Phase {
        self.failures += 1;

        if self.failures >= self.config.max_stream_failures {
            tracing::warn!(
                instrument = %self.instrument,
                interval = %self.interval,
                failures = self.failures,
                "Live stream failed repeatedly ({}), falling back to polling",
                error
            );
            let attempts = self.failures;
            self.state.send_modify(|s| {
                s.status = ConnectionStatus::Polling;
                s.reconnect_attempts = attempts;
            });
            return Phase::Polling;
        }

        tracing::warn!(
            instrument = %self.instrument,
            interval = %self.interval,
            failures = self.failures,
            "Live stream failure: {}",
            error
        );
        Phase::Reconnecting
    }

    async fn wait_before_reconnect(&mut self) -> Phase {
        let attempts = self.failures;
        let delay = self.backoff.delay(attempts.saturating_sub(1));
        self.state.send_modify(|s| {
            s.status = ConnectionStatus::Reconnecting;
            s.reconnect_attempts = attempts;
        });

        tracing::debug!(
            instrument = %self.instrument,
            interval = %self.interval,
            "Reconnecting in {:?}",
            delay
        );

        tokio::select! {
            _ = self.cancel.cancelled() => Phase::Closed,
            _ = sleep(delay) => Phase::Connecting,
        }
    }

    /// Steady-state fallback: fetch the latest bar on a fixed interval
    async fn poll(&mut self) -> Phase {
        let period = self.config.poll_interval.max(Duration::from_millis(1));
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let limit = self.config.poll_limit.max(1);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Phase::Closed,
                _ = ticker.tick() => {}
            }

            let fetched = tokio::select! {
                _ = self.cancel.cancelled() => return Phase::Closed,
                result = history::fetch_history(
                    self.source.as_ref(),
                    &self.config,
                    &self.instrument,
                    self.interval,
                    limit,
                    1,
                ) => result,
            };

            match fetched {
                Ok(candles) => {
                    if let Some(latest) = candles.last().copied() {
                        if !self.deliver(latest).await {
                            return Phase::Closed;
                        }
                    }
                }
                Err(e) => tracing::warn!(
                    instrument = %self.instrument,
                    interval = %self.interval,
                    "Poll failed: {}",
                    e
                ),
            }
        }
    }

    /// Returns false once the consumer is gone or the stream is cancelled
    async fn deliver(&mut self, candle: Candle) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.state.send_modify(|s| s.last_message_at = Some(Utc::now()));

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.updates.send(candle) => sent.is_ok(),
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.state.send_modify(|s| s.status = status);
    }
}

#[cfg(test)]
mod tests {
    use crate::error::PipelineError;
    use crate::feed::{CandleStream, DepthStream, FeedConfig, MarketDataFeed, MarketDataSource};
    use crate::models::{Candle, ConnectionStatus, Horizon};
    use async_trait::async_trait;
    use futures::{stream, StreamExt};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::time::Instant;

    fn candle(time: i64, close: f64) -> Candle {
        Candle {
            time,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            is_closed: false,
        }
    }

    /// Streaming always fails; REST returns a fixed bar
    struct FlakySource {
        connects: AtomicU32,
        polls: Mutex<Vec<Instant>>,
    }

    impl FlakySource {
        fn new() -> Self {
            Self {
                connects: AtomicU32::new(0),
                polls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MarketDataSource for FlakySource {
        async fn fetch_klines(
            &self,
            _instrument: &str,
            _interval: Horizon,
            _limit: usize,
        ) -> Result<Vec<Candle>, PipelineError> {
            self.polls.lock().unwrap().push(Instant::now());
            Ok(vec![candle(1_700_000_000, 49_000.0), candle(1_700_000_060, 49_100.0)])
        }

        async fn connect_candles(&self, _: &str, _: Horizon) -> Result<CandleStream, PipelineError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Err(PipelineError::Network("connection refused".into()))
        }

        async fn connect_depth(&self, _: &str) -> Result<DepthStream, PipelineError> {
            Err(PipelineError::Network("unused".into()))
        }
    }

    /// Streams a fixed sequence, including one malformed message
    struct ScriptedStreamSource;

    #[async_trait]
    impl MarketDataSource for ScriptedStreamSource {
        async fn fetch_klines(&self, _: &str, _: Horizon, _: usize) -> Result<Vec<Candle>, PipelineError> {
            Ok(Vec::new())
        }

        async fn connect_candles(&self, _: &str, _: Horizon) -> Result<CandleStream, PipelineError> {
            let items = vec![
                Ok(candle(1, 100.0)),
                Err(PipelineError::Parse("garbage".into())),
                Ok(candle(2, 101.0)),
            ];
            Ok(Box::pin(stream::iter(items).chain(stream::pending())))
        }

        async fn connect_depth(&self, _: &str) -> Result<DepthStream, PipelineError> {
            Err(PipelineError::Network("unused".into()))
        }
    }

    /// Connect outcomes follow a script; an opened stream sends one bar and ends
    struct ScriptedConnectSource {
        opens: Mutex<VecDeque<bool>>,
        connects: Mutex<Vec<Instant>>,
    }

    impl ScriptedConnectSource {
        fn new(opens: &[bool]) -> Self {
            Self {
                opens: Mutex::new(opens.iter().copied().collect()),
                connects: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MarketDataSource for ScriptedConnectSource {
        async fn fetch_klines(&self, _: &str, _: Horizon, _: usize) -> Result<Vec<Candle>, PipelineError> {
            Ok(Vec::new())
        }

        async fn connect_candles(&self, _: &str, _: Horizon) -> Result<CandleStream, PipelineError> {
            self.connects.lock().unwrap().push(Instant::now());
            let open = self.opens.lock().unwrap().pop_front().unwrap_or(false);
            if open {
                Ok(Box::pin(stream::iter(vec![Ok(candle(1, 100.0))])))
            } else {
                Err(PipelineError::Network("connection refused".into()))
            }
        }

        async fn connect_depth(&self, _: &str) -> Result<DepthStream, PipelineError> {
            Err(PipelineError::Network("unused".into()))
        }
    }

    fn config() -> FeedConfig {
        FeedConfig {
            reconnect_min_delay: Duration::from_millis(100),
            reconnect_max_delay: Duration::from_secs(2),
            reconnect_jitter: Duration::ZERO,
            max_stream_failures: 5,
            poll_interval: Duration::from_secs(60),
            ..FeedConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_to_polling_after_five_failures() {
        let source = Arc::new(FlakySource::new());
        let feed = MarketDataFeed::new(source.clone(), config());

        let mut live = feed.stream_live("BTCUSDT", Horizon::M1);

        let first = live.next().await.expect("polled candle");
        assert_eq!(first.close, 49_100.0);
        assert_eq!(source.connects.load(Ordering::SeqCst), 5);
        assert_eq!(live.state().status, ConnectionStatus::Polling);
        assert!(live.state().is_degraded());

        let second = live.next().await.expect("second polled candle");
        assert_eq!(second.close, 49_100.0);

        let polls = source.polls.lock().unwrap().clone();
        assert_eq!(polls.len(), 2);
        assert!(polls[1] - polls[0] >= Duration::from_secs(60));

        // no streaming retries once polling is the steady state
        assert_eq!(source.connects.load(Ordering::SeqCst), 5);

        let states = feed.connection_states();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].status, ConnectionStatus::Polling);

        live.disconnect().await;
        assert!(feed.connection_states().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_skips_malformed_messages() {
        let feed = MarketDataFeed::new(Arc::new(ScriptedStreamSource), config());
        let mut live = feed.stream_live("ETHUSDT", Horizon::M5);

        assert_eq!(live.next().await.map(|c| c.time), Some(1));
        assert_eq!(live.next().await.map(|c| c.time), Some(2));
        assert_eq!(live.state().status, ConnectionStatus::Open);
        assert_eq!(live.state().reconnect_attempts, 0);
        assert!(live.state().last_message_at.is_some());

        live.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_backoff_stops_task() {
        let source = Arc::new(FlakySource::new());
        let feed = MarketDataFeed::new(
            source.clone(),
            FeedConfig {
                reconnect_min_delay: Duration::from_secs(10),
                reconnect_max_delay: Duration::from_secs(60),
                ..config()
            },
        );

        let live = feed.stream_live("BTCUSDT", Horizon::H1);
        let mut state = live.watch_state();
        while state.borrow().status != ConnectionStatus::Reconnecting {
            state.changed().await.unwrap();
        }

        live.disconnect().await;

        // a pending reconnect timer must not fire a new attempt
        let connects = source.connects.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(source.connects.load(Ordering::SeqCst), connects);
        assert!(source.polls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_resets_after_successful_open() {
        // fail, fail, fail, open (one bar then upstream close), fail...
        let source = Arc::new(ScriptedConnectSource::new(&[false, false, false, true]));
        let feed = MarketDataFeed::new(source.clone(), config());

        let mut live = feed.stream_live("BTCUSDT", Horizon::M1);
        let mut state = live.watch_state();

        assert_eq!(live.next().await.map(|c| c.time), Some(1));

        // first reconnect after the open counts from one again
        while state.borrow().status != ConnectionStatus::Reconnecting {
            state.changed().await.unwrap();
        }
        assert_eq!(state.borrow().reconnect_attempts, 1);

        tokio::time::sleep(Duration::from_millis(150)).await;

        let connects = source.connects.lock().unwrap().clone();
        assert!(connects.len() >= 5, "only {} connects", connects.len());
        let gaps: Vec<Duration> = connects.windows(2).map(|w| w[1] - w[0]).collect();

        // 100ms, 200ms, 400ms while failing, then back to the minimum
        let expected = [100, 200, 400, 100].map(Duration::from_millis);
        for (gap, want) in gaps.iter().zip(expected) {
            assert!(
                *gap >= want && *gap <= want + Duration::from_millis(1),
                "gap {:?}, expected {:?}",
                gap,
                want
            );
        }
        assert_eq!(expected[3], config().reconnect_min_delay);

        live.disconnect().await;
    }
}
