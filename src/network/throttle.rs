//! Handshake rate limiting
//!
//! A bounded recency map: each key (sender IP during discovery, device id
//! during negotiation) is admitted at most once per cool-down window.
//! Duplicates inside the window are discarded silently; they are not
//! errors. The map is shared across connection tasks and purged once it
//! exceeds its capacity.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::trace;

/// Bounded-size recency map used to drop duplicate attempts
#[derive(Debug)]
pub struct Throttle<K> {
    entries: Mutex<HashMap<K, Instant>>,
    cooldown: Duration,
    capacity: usize,
}

impl<K: Eq + Hash + Clone> Throttle<K> {
    pub fn new(cooldown: Duration, capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            cooldown,
            capacity,
        }
    }

    /// Admit the key if it has not been seen within the cool-down window.
    /// Returns false for duplicates, which callers discard without error.
    pub fn admit(&self, key: K) -> bool {
        self.admit_at(key, Instant::now())
    }

    /// Deterministic variant taking an explicit clock reading
    pub fn admit_at(&self, key: K, now: Instant) -> bool {
        let mut entries = self.entries.lock().expect("throttle lock poisoned");

        if let Some(last) = entries.get(&key) {
            if now.duration_since(*last) < self.cooldown {
                return false;
            }
        }

        if entries.len() >= self.capacity {
            let cooldown = self.cooldown;
            let before = entries.len();
            entries.retain(|_, last| now.duration_since(*last) < cooldown);
            trace!(purged = before - entries.len(), "purged stale throttle entries");
        }

        entries.insert(key, now);
        true
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.entries.lock().expect("throttle lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
