//! Generic chunk reassembly.
//!
//! Used for raw frames (keyed by `"<srcMAC>:<sequence>"`) and for mDNS
//! label chunks (keyed by message id). Partial messages that stop receiving
//! chunks are dropped by [`Reassembler::gc`].

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Idle time after which a partial message is discarded.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug)]
struct ReassemblyState {
    chunks: BTreeMap<usize, Vec<u8>>,
    total: usize,
    created_at: Instant,
    updated_at: Instant,
}

#[derive(Debug)]
pub struct Reassembler<K> {
    states: Mutex<HashMap<K, ReassemblyState>>,
    idle_timeout: Duration,
}

impl<K: Eq + Hash + Clone> Reassembler<K> {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            idle_timeout,
        }
    }

    /// Store one chunk; returns the concatenated payload when the message
    /// is complete.
    ///
    /// Messages of `total <= 1` bypass the state table entirely. A repeated
    /// index overwrites the earlier chunk. Indices outside `0..total` are
    /// ignored.
    pub fn insert(&self, key: K, index: usize, total: usize, chunk: Vec<u8>) -> Option<Vec<u8>> {
        if total <= 1 {
            return Some(chunk);
        }
        if index >= total {
            return None;
        }

        let now = Instant::now();
        let mut states = self.states.lock();
        let state = states.entry(key.clone()).or_insert_with(|| ReassemblyState {
            chunks: BTreeMap::new(),
            total,
            created_at: now,
            updated_at: now,
        });

        if index >= state.total {
            return None;
        }
        state.chunks.insert(index, chunk);
        state.updated_at = now;

        if state.chunks.len() < state.total {
            return None;
        }

        // BTreeMap iterates in index order.
        let done = states.remove(&key)?;
        Some(done.chunks.into_values().flatten().collect())
    }

    /// Drop partial messages idle for longer than the timeout.
    pub fn gc(&self) -> usize {
        self.gc_at(Instant::now())
    }

    pub fn gc_at(&self, now: Instant) -> usize {
        let mut states = self.states.lock();
        let before = states.len();
        states.retain(|_, s| now.saturating_duration_since(s.updated_at) <= self.idle_timeout);
        before - states.len()
    }

    /// Number of messages currently mid-reassembly.
    pub fn pending(&self) -> usize {
        self.states.lock().len()
    }

    /// Age of the oldest partial message, if any.
    pub fn oldest_age(&self) -> Option<Duration> {
        self.states
            .lock()
            .values()
            .map(|s| s.created_at.elapsed())
            .max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_chunk_fast_path() {
        let r: Reassembler<String> = Reassembler::new(DEFAULT_IDLE_TIMEOUT);
        assert_eq!(r.insert("k".into(), 0, 1, b"x".to_vec()), Some(b"x".to_vec()));
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn test_out_of_range_index_ignored() {
        let r: Reassembler<String> = Reassembler::new(DEFAULT_IDLE_TIMEOUT);
        assert_eq!(r.insert("k".into(), 5, 2, b"x".to_vec()), None);
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn test_last_write_wins() {
        let r: Reassembler<(u8, u32)> = Reassembler::new(DEFAULT_IDLE_TIMEOUT);
        assert_eq!(r.insert((1, 9), 0, 2, b"old".to_vec()), None);
        assert_eq!(r.insert((1, 9), 0, 2, b"new".to_vec()), None);
        assert_eq!(r.insert((1, 9), 1, 2, b"!".to_vec()), Some(b"new!".to_vec()));
    }

    #[test]
    fn test_idle_state_purged_then_fresh_start_succeeds() {
        let r: Reassembler<String> = Reassembler::new(Duration::from_secs(300));
        assert_eq!(r.insert("k".into(), 0, 2, b"stale".to_vec()), None);
        assert_eq!(r.pending(), 1);

        // Not yet idle.
        assert_eq!(r.gc_at(Instant::now() + Duration::from_secs(60)), 0);
        assert_eq!(r.gc_at(Instant::now() + Duration::from_secs(301)), 1);
        assert_eq!(r.pending(), 0);

        // The orphaned chunk 0 is gone; a new message under the same key
        // must be complete on its own.
        assert_eq!(r.insert("k".into(), 1, 2, b"b".to_vec()), None);
        assert_eq!(r.insert("k".into(), 0, 2, b"a".to_vec()), Some(b"ab".to_vec()));
    }
}
