//! Bounded time-indexed set of recently processed packet ids

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

/// Default entry cap.
pub const SEEN_CACHE_CAPACITY: usize = 10_000;

/// Default entry lifetime.
pub const SEEN_CACHE_MAX_AGE: Duration = Duration::from_secs(3600);

/// Recently seen packet ids, used to suppress duplicate processing.
///
/// Entries age out after one hour; if the cache still exceeds its cap
/// after an age sweep, the oldest half is trimmed. A sweep runs
/// periodically (driven by the owning service) and whenever an insert
/// pushes the cache past its cap.
pub struct SeenPacketCache {
    entries: DashMap<String, Instant>,
    max_entries: usize,
    max_age: Duration,
}

impl SeenPacketCache {
    pub fn new() -> Self {
        Self::with_limits(SEEN_CACHE_CAPACITY, SEEN_CACHE_MAX_AGE)
    }

    pub fn with_limits(max_entries: usize, max_age: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
            max_age,
        }
    }

    /// O(1) membership test.
    pub fn contains(&self, packet_id: &str) -> bool {
        self.entries.contains_key(packet_id)
    }

    /// Record a packet id with the current monotonic timestamp. Sweeps
    /// when this insert pushes the cache past its cap.
    pub fn insert(&self, packet_id: &str) {
        self.entries.insert(packet_id.to_string(), Instant::now());
        if self.entries.len() > self.max_entries {
            self.sweep();
        }
    }

    /// Drop aged entries, then trim the oldest half if the cache is still
    /// over its cap.
    pub fn sweep(&self) {
        let before = self.entries.len();
        self.entries.retain(|_, seen_at| seen_at.elapsed() <= self.max_age);

        if self.entries.len() > self.max_entries {
            let mut by_age: Vec<(String, Instant)> = self
                .entries
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect();
            by_age.sort_by_key(|(_, seen_at)| *seen_at);
            let trim = by_age.len() / 2;
            for (packet_id, _) in by_age.into_iter().take(trim) {
                self.entries.remove(&packet_id);
            }
        }

        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!("seen-packet sweep removed {} entries", removed);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SeenPacketCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_after_insert() {
        let cache = SeenPacketCache::new();
        assert!(!cache.contains("p1"));
        cache.insert("p1");
        assert!(cache.contains("p1"));
    }

    #[test]
    fn test_sweep_removes_aged_entries() {
        let cache = SeenPacketCache::with_limits(100, Duration::from_millis(0));
        cache.insert("p1");
        std::thread::sleep(Duration::from_millis(5));
        cache.sweep();
        assert!(!cache.contains("p1"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_overflow_trims_oldest_half() {
        let cache = SeenPacketCache::with_limits(10, Duration::from_secs(3600));
        for i in 0..10 {
            cache.insert(&format!("p{}", i));
            // Distinct monotonic timestamps so the age order is stable.
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(cache.len(), 10);

        // The insert that crosses the cap triggers the sweep; nothing has
        // aged out, so the oldest half goes.
        cache.insert("p10");
        assert!(cache.len() <= 10);
        assert!(cache.contains("p10"));
        assert!(!cache.contains("p0"));
    }

    #[test]
    fn test_cache_never_exceeds_cap_after_sweep() {
        let cache = SeenPacketCache::with_limits(50, Duration::from_secs(3600));
        for i in 0..200 {
            cache.insert(&format!("p{}", i));
        }
        cache.sweep();
        assert!(cache.len() <= 50);
    }
}
