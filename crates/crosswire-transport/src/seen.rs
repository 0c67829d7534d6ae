//! Seen-message cache shared by every backend.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// How long a message id is remembered.
pub const SEEN_EXPIRY: Duration = Duration::from_secs(10 * 60);
/// Cadence of the background cleanup tick.
pub const SEEN_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct SeenCache {
    entries: Mutex<HashMap<String, Instant>>,
    expiry: Duration,
}

impl Default for SeenCache {
    fn default() -> Self {
        Self::new(SEEN_EXPIRY)
    }
}

impl SeenCache {
    pub fn new(expiry: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            expiry,
        }
    }

    /// Record `id`; returns `false` if it was already seen and has not
    /// expired.
    pub fn insert(&self, id: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(id) {
            Some(at) if now.saturating_duration_since(*at) <= self.expiry => false,
            _ => {
                entries.insert(id.to_string(), now);
                true
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries
            .lock()
            .get(id)
            .map(|at| at.elapsed() <= self.expiry)
            .unwrap_or(false)
    }

    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now())
    }

    pub fn cleanup_at(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, at| now.saturating_duration_since(*at) <= self.expiry);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_rejected() {
        let seen = SeenCache::default();
        assert!(seen.insert("m1"));
        assert!(!seen.insert("m1"));
        assert!(seen.contains("m1"));
        assert!(seen.insert("m2"));
    }

    #[test]
    fn test_expired_entries_cleaned() {
        let seen = SeenCache::new(Duration::from_secs(600));
        seen.insert("m1");

        assert_eq!(seen.cleanup_at(Instant::now() + Duration::from_secs(60)), 0);
        assert_eq!(seen.cleanup_at(Instant::now() + Duration::from_secs(601)), 1);
        assert!(seen.is_empty());
        assert!(seen.insert("m1"));
    }
}
