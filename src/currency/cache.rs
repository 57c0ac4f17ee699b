use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use rust_decimal::Decimal;
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedRate {
    pub rate: Decimal,
    pub is_fallback: bool,
}

pub fn cache_key(from: &str, to: &str) -> String {
    format!("exchange_rate:{from}:{to}")
}

/// Process-wide rate cache with a fixed time-to-live.
#[derive(Debug)]
pub struct RateCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, (CachedRate, Instant)>>,
}

impl RateCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, key: &str) -> Option<CachedRate> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|(_, stored_at)| stored_at.elapsed() < self.ttl)
            .map(|(rate, _)| *rate)
    }

    pub async fn put(&self, key: &str, rate: CachedRate) {
        self.entries
            .write()
            .await
            .insert(key.to_string(), (rate, Instant::now()));
    }
}

/// Rates seen during a single request or job. Dropping it is the flush point.
#[derive(Debug, Default)]
pub struct RequestRates {
    entries: Mutex<HashMap<String, CachedRate>>,
}

impl RequestRates {
    pub async fn get(&self, key: &str) -> Option<CachedRate> {
        self.entries.lock().await.get(key).copied()
    }

    pub async fn put(&self, key: &str, rate: CachedRate) {
        self.entries.lock().await.insert(key.to_string(), rate);
    }

    pub async fn flush(&self) {
        self.entries.lock().await.clear();
    }
}
