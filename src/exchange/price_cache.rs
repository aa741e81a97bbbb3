use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// TTL-bounded, size-capped price cache shared read-mostly by all positions
/// evaluated in one tick. Keeps ticker traffic inside exchange rate limits.
#[derive(Debug)]
pub struct PriceCache {
    ttl: Duration,
    max_size: usize,
    inner: Mutex<HashMap<String, (Decimal, Instant)>>,
}

impl PriceCache {
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self {
            ttl,
            max_size,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, pair: &str) -> Option<Decimal> {
        let cache = self.inner.lock().expect("price cache poisoned");
        cache
            .get(pair)
            .filter(|(_, at)| at.elapsed() < self.ttl)
            .map(|(price, _)| *price)
    }

    pub fn put(&self, pair: &str, price: Decimal) {
        let mut cache = self.inner.lock().expect("price cache poisoned");
        if cache.len() >= self.max_size && !cache.contains_key(pair) {
            // Evict the stalest entry to stay within the cap.
            if let Some(oldest) = cache
                .iter()
                .min_by_key(|(_, (_, at))| *at)
                .map(|(k, _)| k.clone())
            {
                cache.remove(&oldest);
            }
        }
        cache.insert(pair.to_string(), (price, Instant::now()));
    }
}
