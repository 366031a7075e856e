//! TTL dedup cache for point values.
//!
//! Suppresses a write when the incoming value is numerically equal to the
//! last one emitted for the same key and the cached entry is still inside
//! the TTL. A hit does not refresh the cached timestamp: the TTL is
//! anchored to the first write of a cluster of equal values, so a stuck
//! reading still lands in storage once per TTL.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Relative epsilon for float comparison.
const EPSILON: f64 = 1e-9;

struct Entry {
    value: f64,
    at: Instant,
}

pub struct ValueCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl ValueCache {
    /// TTLs of zero fall back to one hour.
    pub fn new(ttl: Duration) -> Self {
        let ttl = if ttl.is_zero() { Duration::from_secs(3600) } else { ttl };
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` when the value is fresh and must be written; the
    /// cache is refreshed in that case. Returns `false` on a dedup hit.
    pub fn observe(&self, key: &str, value: f64) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get(key) {
            if entry.at.elapsed() <= self.ttl && approx_eq(value, entry.value) {
                return false;
            }
        }
        entries.insert(
            key.to_string(),
            Entry {
                value,
                at: Instant::now(),
            },
        );
        true
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() <= EPSILON * 1.0_f64.max(a.abs()).max(b.abs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suppresses_near_equal_values_within_ttl() {
        let cache = ValueCache::new(Duration::from_secs(10));
        assert!(cache.observe("k", 21.000000001));
        // Within relative epsilon of the cached value.
        assert!(!cache.observe("k", 21.000000002));
        // A genuinely different value writes and refreshes.
        assert!(cache.observe("k", 22.0));
        assert!(!cache.observe("k", 22.0));
    }

    #[test]
    fn distinct_keys_do_not_interfere() {
        let cache = ValueCache::new(Duration::from_secs(10));
        assert!(cache.observe("a", 1.0));
        assert!(cache.observe("b", 1.0));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn expired_entries_write_again() {
        let cache = ValueCache::new(Duration::from_millis(10));
        assert!(cache.observe("k", 5.0));
        std::thread::sleep(Duration::from_millis(25));
        assert!(cache.observe("k", 5.0));
    }

    #[test]
    fn epsilon_scales_with_magnitude() {
        let cache = ValueCache::new(Duration::from_secs(10));
        assert!(cache.observe("big", 1e12));
        // 1e12 * 1e-9 = 1e3 absolute tolerance.
        assert!(!cache.observe("big", 1e12 + 500.0));
        assert!(cache.observe("big", 1e12 + 5000.0));
    }

    #[test]
    fn zero_ttl_defaults_to_an_hour() {
        let cache = ValueCache::new(Duration::ZERO);
        assert_eq!(cache.ttl, Duration::from_secs(3600));
    }
}
