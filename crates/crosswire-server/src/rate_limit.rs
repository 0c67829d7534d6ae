use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

/// Sliding-window limiter keyed by member id.
///
/// Each member keeps the instants of its accepted sends. A check drops
/// everything at or before `now - window` and allows the send iff fewer than
/// `max_rate` remain; only allowed sends are recorded.
#[derive(Clone)]
pub struct RateLimiter {
    windows: Arc<Mutex<HashMap<String, VecDeque<Instant>>>>,
    max_rate: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_rate: usize, window: Duration) -> Self {
        Self {
            windows: Arc::new(Mutex::new(HashMap::new())),
            max_rate,
            window,
        }
    }

    pub async fn check(&self, member_id: &str) -> bool {
        self.check_at(member_id, Instant::now()).await
    }

    pub async fn check_at(&self, member_id: &str, now: Instant) -> bool {
        let mut windows = self.windows.lock().await;
        let sends = windows.entry(member_id.to_string()).or_default();

        if let Some(cutoff) = now.checked_sub(self.window) {
            while sends.front().is_some_and(|t| *t <= cutoff) {
                sends.pop_front();
            }
        }

        if sends.len() < self.max_rate {
            sends.push_back(now);
            true
        } else {
            debug!(member = member_id, limit = self.max_rate, "rate limit exceeded");
            false
        }
    }

    /// Forget a member's history (after moderation actions).
    pub async fn reset(&self, member_id: &str) {
        self.windows.lock().await.remove(member_id);
    }

    /// Drop members with nothing inside the window.
    pub async fn purge_stale(&self) {
        let mut windows = self.windows.lock().await;
        let now = Instant::now();
        let window = self.window;
        windows.retain(|_, sends| {
            sends
                .back()
                .is_some_and(|last| now.duration_since(*last) < window)
        });
    }

    pub async fn tracked_members(&self) -> usize {
        self.windows.lock().await.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(60, Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exact_limit_then_reject() {
        let limiter = RateLimiter::new(5, Duration::from_secs(60));
        let start = Instant::now();

        for i in 0..5 {
            assert!(limiter.check_at("m1", start + Duration::from_millis(i)).await);
        }
        assert!(!limiter.check_at("m1", start + Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_window_elapses() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        let start = Instant::now();

        assert!(limiter.check_at("m1", start).await);
        assert!(limiter.check_at("m1", start).await);
        assert!(!limiter.check_at("m1", start + Duration::from_secs(59)).await);
        assert!(limiter.check_at("m1", start + Duration::from_secs(61)).await);
    }

    #[tokio::test]
    async fn test_members_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check("a").await);
        assert!(!limiter.check("a").await);
        assert!(limiter.check("b").await);

        limiter.reset("a").await;
        assert!(limiter.check("a").await);
    }

    #[tokio::test]
    async fn test_purge_stale() {
        let limiter = RateLimiter::new(10, Duration::from_millis(1));
        assert!(limiter.check("a").await);
        tokio::time::sleep(Duration::from_millis(5)).await;

        limiter.purge_stale().await;
        assert_eq!(limiter.tracked_members().await, 0);
    }
}
