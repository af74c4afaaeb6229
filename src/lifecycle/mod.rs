use crate::error::PipelineError;
use crate::models::{Direction, Signal, SignalStatus};
use crate::store::SignalStore;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use uuid::Uuid;

/// Result of a publish attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published(Uuid),
    /// An ACTIVE signal already exists for the same instrument and direction
    Suppressed { existing: Uuid },
    /// This exact signal id was already stored
    Duplicate(Uuid),
}

/// One status change applied to a stored signal
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub signal_id: Uuid,
    pub instrument: String,
    pub from: SignalStatus,
    pub to: SignalStatus,
    pub price: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileSummary {
    pub checked: usize,
    pub transitions: Vec<Transition>,
    /// Tracked signals with no current price this round
    pub unpriced: usize,
    pub failed: usize,
}

/// Next (status, hit targets) for a tracked signal at `price`, if anything changes
///
/// The stop is checked before targets. Target hits only accumulate, and the
/// reported index is the furthest target reached so far.
pub fn next_state(signal: &Signal, price: f64) -> Option<(SignalStatus, BTreeSet<usize>)> {
    if !signal.is_tracked() || !price.is_finite() {
        return None;
    }

    let stopped = match signal.direction {
        Direction::Long => price <= signal.stop_loss,
        Direction::Short => price >= signal.stop_loss,
    };
    if stopped {
        return Some((SignalStatus::Stopped, signal.hit_targets.clone()));
    }

    let mut hit = signal.hit_targets.clone();
    for (i, target) in signal.targets.iter().enumerate() {
        let reached = match signal.direction {
            Direction::Long => price >= target.price,
            Direction::Short => price <= target.price,
        };
        if reached {
            hit.insert(i);
        }
    }

    if hit == signal.hit_targets {
        return None;
    }

    let furthest = hit.iter().next_back().copied()?;
    Some((SignalStatus::TargetHit(furthest), hit))
}

/// Owns signal status transitions against the store
pub struct SignalLifecycleManager {
    store: Arc<dyn SignalStore>,
}

impl SignalLifecycleManager {
    pub fn new(store: Arc<dyn SignalStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn SignalStore> {
        &self.store
    }

    /// Persist a new ACTIVE signal unless one is already live for its
    /// instrument and direction
    ///
    /// Only ACTIVE signals suppress. Once a signal has hit a target
    /// (`TARGET_HIT(k)`) it stays tracked for the remaining targets but no
    /// longer blocks a fresh signal in the same direction.
    pub async fn publish(&self, signal: &Signal) -> Result<PublishOutcome, PipelineError> {
        if self.store.get(signal.id).await?.is_some() {
            tracing::debug!(signal_id = %signal.id, "Signal already stored");
            return Ok(PublishOutcome::Duplicate(signal.id));
        }

        let active = self.store.find_active(&signal.instrument).await?;
        if let Some(existing) = active.iter().find(|s| s.direction == signal.direction) {
            tracing::info!(
                instrument = %signal.instrument,
                direction = %signal.direction,
                existing = %existing.id,
                "Signal suppressed: active signal already published"
            );
            return Ok(PublishOutcome::Suppressed { existing: existing.id });
        }

        self.store.put(signal).await?;

        tracing::info!(
            instrument = %signal.instrument,
            direction = %signal.direction,
            signal_id = %signal.id,
            entry = signal.entry,
            stop = signal.stop_loss,
            score = signal.confluence_score,
            "📣 Signal published"
        );

        Ok(PublishOutcome::Published(signal.id))
    }

    /// Re-evaluate one signal against a price, persisting only on change
    pub async fn reconcile(
        &self,
        signal: &mut Signal,
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<Option<Transition>, PipelineError> {
        let Some((status, hit_targets)) = next_state(signal, price) else {
            return Ok(None);
        };

        let mut updated = signal.clone();
        updated.status = status;
        updated.hit_targets = hit_targets;
        updated.updated_at = now;
        self.apply(signal, updated, Some(price)).await.map(Some)
    }

    /// Reconcile every tracked signal; expire those past their window
    pub async fn reconcile_all(
        &self,
        prices: &HashMap<String, f64>,
        now: DateTime<Utc>,
    ) -> Result<ReconcileSummary, PipelineError> {
        let tracked = self.store.find_tracked().await?;
        let mut summary = ReconcileSummary {
            checked: tracked.len(),
            ..ReconcileSummary::default()
        };

        for mut signal in tracked {
            let result = if now >= signal.expires_at {
                self.expire(&mut signal, now).await.map(Some)
            } else if let Some(&price) = prices.get(&signal.instrument) {
                self.reconcile(&mut signal, price, now).await
            } else {
                summary.unpriced += 1;
                continue;
            };

            match result {
                Ok(Some(transition)) => summary.transitions.push(transition),
                Ok(None) => {}
                Err(e) => {
                    summary.failed += 1;
                    tracing::warn!(
                        signal_id = %signal.id,
                        instrument = %signal.instrument,
                        "Failed to reconcile signal: {}",
                        e
                    );
                }
            }
        }

        Ok(summary)
    }

    /// Delete every signal with `expires_at < now`, returns how many were removed
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, PipelineError> {
        let expired = self.store.find_expired(now).await?;
        if expired.is_empty() {
            return Ok(0);
        }

        let ids: Vec<Uuid> = expired.iter().map(|s| s.id).collect();
        let removed = self.store.delete_batch(&ids).await?;

        tracing::info!(removed, "🧹 Swept expired signals");
        Ok(removed)
    }

    async fn expire(&self, signal: &mut Signal, now: DateTime<Utc>) -> Result<Transition, PipelineError> {
        let mut updated = signal.clone();
        updated.status = SignalStatus::Expired;
        updated.updated_at = now;
        self.apply(signal, updated, None).await
    }

    async fn apply(
        &self,
        signal: &mut Signal,
        updated: Signal,
        price: Option<f64>,
    ) -> Result<Transition, PipelineError> {
        self.store.put(&updated).await?;

        let transition = Transition {
            signal_id: signal.id,
            instrument: signal.instrument.clone(),
            from: signal.status,
            to: updated.status,
            price,
        };

        tracing::info!(
            signal_id = %transition.signal_id,
            instrument = %transition.instrument,
            from = %transition.from,
            to = %transition.to,
            price = ?price,
            "Signal status changed"
        );

        *signal = updated;
        Ok(transition)
    }
}
