use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CachedPrice {
    pub price: f64,
    pub updated_at: DateTime<Utc>,
}

/// Latest streamed close per instrument
///
/// Written by the live price watchers, read once per cycle.
#[derive(Clone, Default)]
pub struct PriceCache {
    prices: Arc<DashMap<String, CachedPrice>>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, instrument: &str, price: f64, at: DateTime<Utc>) {
        if !price.is_finite() || price <= 0.0 {
            return;
        }
        self.prices
            .insert(instrument.to_string(), CachedPrice { price, updated_at: at });
    }

    pub fn get(&self, instrument: &str) -> Option<CachedPrice> {
        self.prices.get(instrument).map(|entry| *entry)
    }

    /// Price if updated at or after `not_before`
    pub fn fresh(&self, instrument: &str, not_before: DateTime<Utc>) -> Option<f64> {
        self.get(instrument)
            .filter(|cached| cached.updated_at >= not_before)
            .map(|cached| cached.price)
    }

    pub fn snapshot(&self) -> HashMap<String, f64> {
        self.prices
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().price))
            .collect()
    }
}
