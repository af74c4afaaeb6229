use super::{DepthStream, FeedConfig, MarketDataSource};
use crate::error::PipelineError;
use crate::models::DepthSnapshot;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

const SNAPSHOT_BUFFER: usize = 64;

/// One upstream depth connection shared by every subscriber of an instrument
pub(crate) struct DepthPool {
    pub(crate) subscribers: usize,
    sender: broadcast::Sender<DepthSnapshot>,
    cancel: CancellationToken,
}

pub(crate) type DepthTable = DashMap<String, DepthPool>;

/// Reference-counted handle on a pooled depth connection
///
/// Releasing the last handle (explicitly or by drop) closes the connection.
pub struct DepthSubscription {
    instrument: String,
    receiver: broadcast::Receiver<DepthSnapshot>,
    table: Arc<DepthTable>,
    released: bool,
}

impl DepthSubscription {
    /// Next snapshot; a lagging consumer skips to the newest ones
    pub async fn recv(&mut self) -> Option<DepthSnapshot> {
        if self.released {
            return None;
        }
        loop {
            match self.receiver.recv().await {
                Ok(snapshot) => return Some(snapshot),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(
                        instrument = %self.instrument,
                        skipped,
                        "Depth consumer lagging, dropped snapshots"
                    );
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let mut last = false;
        if let Some(mut pool) = self.table.get_mut(&self.instrument) {
            pool.subscribers = pool.subscribers.saturating_sub(1);
            last = pool.subscribers == 0;
        }

        if last {
            if let Some((_, pool)) = self
                .table
                .remove_if(&self.instrument, |_, pool| pool.subscribers == 0)
            {
                pool.cancel.cancel();
                tracing::info!(instrument = %self.instrument, "Closed depth stream");
            }
        }
    }
}

impl Drop for DepthSubscription {
    fn drop(&mut self) {
        self.release();
    }
}

pub(crate) fn subscribe(
    instrument: &str,
    source: Arc<dyn MarketDataSource>,
    config: Arc<FeedConfig>,
    table: Arc<DepthTable>,
) -> DepthSubscription {
    let receiver = match table.entry(instrument.to_string()) {
        Entry::Occupied(mut entry) => {
            let pool = entry.get_mut();
            pool.subscribers += 1;
            tracing::debug!(
                instrument = %instrument,
                subscribers = pool.subscribers,
                "Attached to existing depth stream"
            );
            pool.sender.subscribe()
        }
        Entry::Vacant(entry) => {
            let (sender, receiver) = broadcast::channel(SNAPSHOT_BUFFER);
            let cancel = CancellationToken::new();

            tokio::spawn(pump(
                instrument.to_string(),
                source,
                config,
                sender.clone(),
                cancel.clone(),
            ));

            entry.insert(DepthPool {
                subscribers: 1,
                sender,
                cancel,
            });
            tracing::info!(instrument = %instrument, "Opened depth stream");
            receiver
        }
    };

    DepthSubscription {
        instrument: instrument.to_string(),
        receiver,
        table,
        released: false,
    }
}

/// Keep one depth connection alive until the pool is cancelled
async fn pump(
    instrument: String,
    source: Arc<dyn MarketDataSource>,
    config: Arc<FeedConfig>,
    sender: broadcast::Sender<DepthSnapshot>,
    cancel: CancellationToken,
) {
    let backoff = config.backoff();
    let mut failures: u32 = 0;

    loop {
        let connected = tokio::select! {
            _ = cancel.cancelled() => return,
            result = timeout(config.request_timeout, source.connect_depth(&instrument)) => result,
        };

        let error = match connected {
            Ok(Ok(stream)) => {
                failures = 0;
                forward(&instrument, stream, &sender, &cancel).await
            }
            Ok(Err(e)) => Some(e),
            Err(_) => Some(PipelineError::Network("depth connect timed out".into())),
        };

        let Some(error) = error else {
            return;
        };

        let delay = backoff.delay(failures);
        failures = failures.saturating_add(1);
        tracing::warn!(
            instrument = %instrument,
            "Depth stream failure: {}. Reconnecting in {:?}",
            error,
            delay
        );

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(delay) => {}
        }
    }
}

/// Forward snapshots until failure (`Some`) or cancellation (`None`)
async fn forward(
    instrument: &str,
    mut stream: DepthStream,
    sender: &broadcast::Sender<DepthSnapshot>,
    cancel: &CancellationToken,
) -> Option<PipelineError> {
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => return None,
            item = stream.next() => item,
        };

        match item {
            Some(Ok(snapshot)) => {
                if cancel.is_cancelled() {
                    return None;
                }
                // no receivers between subscribers is not an error
                let _ = sender.send(snapshot);
            }
            Some(Err(PipelineError::Parse(msg))) => {
                tracing::warn!(instrument = %instrument, "Skipping malformed depth message: {}", msg);
            }
            Some(Err(e)) => return Some(e),
            None => return Some(PipelineError::Network("depth stream closed by upstream".into())),
        }
    }
}
