//! Content-based abuse checks: keyword blacklist, global duplicate
//! fingerprints and per-member repetition.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crosswire_shared::crypto::sha256_hex;
use crosswire_shared::protocol::Message;
use crosswire_shared::types::MessageType;

#[derive(Debug, Clone)]
pub struct SpamConfig {
    pub enable_duplicate_detection: bool,
    pub enable_content_filter: bool,
    pub enable_rapid_post_detection: bool,
    pub max_duplicate_window: Duration,
    pub max_similar_in_history: usize,
    pub max_history_size: usize,
}

impl Default for SpamConfig {
    fn default() -> Self {
        Self {
            enable_duplicate_detection: true,
            enable_content_filter: true,
            enable_rapid_post_detection: true,
            max_duplicate_window: Duration::from_secs(5 * 60),
            max_similar_in_history: 3,
            max_history_size: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpamReason {
    Blacklisted(String),
    Duplicate,
    Repetition,
}

impl std::fmt::Display for SpamReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpamReason::Blacklisted(word) => write!(f, "blacklisted keyword: {word}"),
            SpamReason::Duplicate => f.write_str("duplicate message"),
            SpamReason::Repetition => f.write_str("too many similar messages in history"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SpamStats {
    pub total_checked: u64,
    pub duplicate_detected: u64,
    pub blacklist_detected: u64,
    pub repetition_detected: u64,
}

#[derive(Default)]
struct SpamState {
    fingerprints: HashMap<String, Instant>,
    history: HashMap<String, VecDeque<String>>,
    blacklist: Vec<String>,
    stats: SpamStats,
}

pub struct SpamDetector {
    config: SpamConfig,
    state: Mutex<SpamState>,
}

pub const DEFAULT_BLACKLIST: [&str; 3] = ["spam", "advertisement", "广告"];

impl SpamDetector {
    pub fn new(config: SpamConfig) -> Self {
        let state = SpamState {
            blacklist: DEFAULT_BLACKLIST.iter().map(|w| w.to_string()).collect(),
            ..SpamState::default()
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    pub async fn check(&self, msg: &Message, member_id: &str) -> Result<(), SpamReason> {
        self.check_at(msg, member_id, Instant::now()).await
    }

    /// Check and, when accepted, record. Both happen under one lock.
    pub async fn check_at(
        &self,
        msg: &Message,
        member_id: &str,
        now: Instant,
    ) -> Result<(), SpamReason> {
        let mut state = self.state.lock().await;
        state.stats.total_checked += 1;

        if self.config.enable_content_filter && msg.kind == MessageType::Text {
            let text = msg.content_str("text").unwrap_or("").to_lowercase();
            let hit = state
                .blacklist
                .iter()
                .find(|word| text.contains(&word.to_lowercase()))
                .cloned();
            if let Some(word) = hit {
                state.stats.blacklist_detected += 1;
                return Err(SpamReason::Blacklisted(word));
            }
        }

        // Reactions, files and control messages carry nothing to fingerprint.
        let content = msg.fingerprint_content();
        if content.is_empty() {
            return Ok(());
        }
        let fingerprint = sha256_hex(format!("{}:{}", msg.sender_id, content).as_bytes());

        if self.config.enable_duplicate_detection {
            let recent = state
                .fingerprints
                .get(&fingerprint)
                .is_some_and(|seen| now.saturating_duration_since(*seen) < self.config.max_duplicate_window);
            if recent {
                state.stats.duplicate_detected += 1;
                return Err(SpamReason::Duplicate);
            }
        }

        if self.config.enable_rapid_post_detection {
            let similar = state
                .history
                .get(member_id)
                .map(|h| h.iter().filter(|f| **f == fingerprint).count())
                .unwrap_or(0);
            if similar >= self.config.max_similar_in_history {
                state.stats.repetition_detected += 1;
                return Err(SpamReason::Repetition);
            }
        }

        state.fingerprints.insert(fingerprint.clone(), now);
        let max_history = self.config.max_history_size;
        let history = state.history.entry(member_id.to_string()).or_default();
        history.push_back(fingerprint);
        while history.len() > max_history {
            history.pop_front();
        }
        Ok(())
    }

    pub async fn add_blacklist_word(&self, word: &str) {
        let mut state = self.state.lock().await;
        if !state.blacklist.iter().any(|w| w == word) {
            state.blacklist.push(word.to_string());
            info!(word, "added blacklist word");
        }
    }

    /// Returns `false` if the word was not listed.
    pub async fn remove_blacklist_word(&self, word: &str) -> bool {
        let mut state = self.state.lock().await;
        let before = state.blacklist.len();
        state.blacklist.retain(|w| w != word);
        let removed = state.blacklist.len() != before;
        if removed {
            info!(word, "removed blacklist word");
        }
        removed
    }

    pub async fn blacklist_words(&self) -> Vec<String> {
        self.state.lock().await.blacklist.clone()
    }

    pub async fn clear_member_history(&self, member_id: &str) {
        self.state.lock().await.history.remove(member_id);
        debug!(member = member_id, "cleared spam history");
    }

    pub async fn stats(&self) -> SpamStats {
        self.state.lock().await.stats
    }

    pub async fn reset_stats(&self) {
        self.state.lock().await.stats = SpamStats::default();
    }

    /// Drop fingerprints older than the duplicate window. Returns how many.
    pub async fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now()).await
    }

    pub async fn cleanup_at(&self, now: Instant) -> usize {
        let window = self.config.max_duplicate_window;
        let mut state = self.state.lock().await;
        let before = state.fingerprints.len();
        state
            .fingerprints
            .retain(|_, seen| now.saturating_duration_since(*seen) < window);
        let removed = before - state.fingerprints.len();
        debug!(removed, remaining = state.fingerprints.len(), "spam fingerprint cleanup");
        removed
    }
}

impl Default for SpamDetector {
    fn default() -> Self {
        Self::new(SpamConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(sender: &str, body: &str) -> Message {
        Message::text(sender, "nick", body)
    }

    #[tokio::test]
    async fn test_duplicate_window() {
        let detector = SpamDetector::default();
        let start = Instant::now();
        let msg = text("m1", "hello there");

        assert!(detector.check_at(&msg, "m1", start).await.is_ok());
        assert_eq!(
            detector
                .check_at(&msg, "m1", start + Duration::from_secs(60))
                .await,
            Err(SpamReason::Duplicate)
        );
        assert!(detector
            .check_at(&msg, "m1", start + Duration::from_secs(5 * 60 + 1))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_same_text_from_other_sender_is_fine() {
        let detector = SpamDetector::default();
        assert!(detector.check(&text("a", "hi"), "a").await.is_ok());
        assert!(detector.check(&text("b", "hi"), "b").await.is_ok());
    }

    #[tokio::test]
    async fn test_repetition_outlives_window() {
        let config = SpamConfig {
            max_duplicate_window: Duration::from_secs(1),
            ..SpamConfig::default()
        };
        let detector = SpamDetector::new(config);
        let start = Instant::now();
        let msg = text("m1", "again");

        for i in 0..3 {
            let at = start + Duration::from_secs(2 * i);
            assert!(detector.check_at(&msg, "m1", at).await.is_ok());
        }
        assert_eq!(
            detector
                .check_at(&msg, "m1", start + Duration::from_secs(10))
                .await,
            Err(SpamReason::Repetition)
        );

        detector.clear_member_history("m1").await;
        assert!(detector
            .check_at(&msg, "m1", start + Duration::from_secs(12))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_blacklist_case_insensitive() {
        let detector = SpamDetector::default();
        let err = detector
            .check(&text("m1", "Buy now, ADVERTISEMENT inside"), "m1")
            .await
            .unwrap_err();
        assert_eq!(err, SpamReason::Blacklisted("advertisement".into()));

        detector.add_blacklist_word("Crypto").await;
        assert!(detector.check(&text("m1", "free crypto"), "m1").await.is_err());
        assert!(detector.remove_blacklist_word("Crypto").await);
        assert!(!detector.remove_blacklist_word("Crypto").await);
        assert!(detector.check(&text("m1", "free crypto"), "m1").await.is_ok());

        let stats = detector.stats().await;
        assert_eq!(stats.blacklist_detected, 2);
        assert_eq!(stats.total_checked, 3);
        detector.reset_stats().await;
        assert_eq!(detector.stats().await, SpamStats::default());
    }

    #[tokio::test]
    async fn test_blacklist_ignores_code() {
        let detector = SpamDetector::default();
        let mut msg = Message::new("m1", "nick", MessageType::Code);
        msg.content.insert("code".into(), "let spam = 1;".into());
        assert!(detector.check(&msg, "m1").await.is_ok());
    }

    #[tokio::test]
    async fn test_reactions_skip_fingerprinting() {
        let detector = SpamDetector::default();
        let reaction = Message::reaction("m1", "msg-1", "+1", true);
        for _ in 0..5 {
            assert!(detector.check(&reaction, "m1").await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_cleanup_drops_old_fingerprints() {
        let detector = SpamDetector::default();
        let start = Instant::now();
        detector.check_at(&text("m1", "one"), "m1", start).await.unwrap();
        detector.check_at(&text("m1", "two"), "m1", start).await.unwrap();

        assert_eq!(detector.cleanup_at(start + Duration::from_secs(60)).await, 0);
        assert_eq!(detector.cleanup_at(start + Duration::from_secs(301)).await, 2);
    }
}
