//! Fixed-window counter store shared by every limiter layer.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

use super::descriptor::LimitKey;
use crate::clock::Clock;

/// State of one counted key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowEntry {
    /// Requests seen in the current window
    pub count: u64,
    pub window_start: u64,
    pub window_end: u64,
    pub first_seen: u64,
    pub last_seen: u64,
}

impl WindowEntry {
    fn new(now: u64, window_ms: u64) -> Self {
        Self {
            count: 0,
            window_start: now,
            window_end: now.saturating_add(window_ms),
            first_seen: now,
            last_seen: now,
        }
    }

    /// An entry is logically absent once `now` passes its window end.
    pub fn is_expired(&self, now: u64) -> bool {
        now > self.window_end
    }

    fn roll(&mut self, now: u64, window_ms: u64) {
        self.count = 0;
        self.window_start = now;
        self.window_end = now.saturating_add(window_ms);
    }
}

/// Result of counting one request against a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    pub violated: bool,
    /// Count after this request; zero when the limit blocks everything
    pub count: u64,
    /// The ceiling the count was compared against
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: u64,
}

/// Keyed fixed-window counters with lazy expiry.
///
/// Each key lives in one `DashMap` shard, so the read-modify-write of a
/// single key is atomic while unrelated keys proceed in parallel.
pub struct WindowCounterStore {
    entries: DashMap<LimitKey, WindowEntry>,
    clock: Arc<dyn Clock>,
}

impl WindowCounterStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Count one request against `key` and compare with `max_requests`.
    ///
    /// A `max_requests` of zero always violates and never creates an entry.
    pub fn evaluate(&self, key: &LimitKey, window_ms: u64, max_requests: u64) -> WindowOutcome {
        let now = self.clock.now_ms();

        if max_requests == 0 {
            return WindowOutcome {
                violated: true,
                count: 0,
                limit: 0,
                remaining: 0,
                reset_at: now.saturating_add(window_ms),
            };
        }

        let mut entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| WindowEntry::new(now, window_ms));

        if entry.is_expired(now) {
            trace!(key = %key, "Window expired, starting a new one");
            entry.roll(now, window_ms);
        }

        entry.count += 1;
        entry.last_seen = now;

        WindowOutcome {
            violated: entry.count > max_requests,
            count: entry.count,
            limit: max_requests,
            remaining: max_requests.saturating_sub(entry.count),
            reset_at: entry.window_end,
        }
    }

    /// Get the live entry for `key`, treating expired entries as absent.
    pub fn get(&self, key: &LimitKey) -> Option<WindowEntry> {
        let now = self.clock.now_ms();
        self.entries
            .get(key)
            .map(|e| *e)
            .filter(|e| !e.is_expired(now))
    }

    /// Remove every entry scoped to `ip`. Returns how many were removed.
    pub fn remove_ip(&self, ip: &str) -> usize {
        let keys: Vec<LimitKey> = self
            .entries
            .iter()
            .filter(|e| e.key().ip() == Some(ip))
            .map(|e| e.key().clone())
            .collect();

        keys.iter()
            .filter(|k| self.entries.remove(*k).is_some())
            .count()
    }

    /// Evict entries whose window ended before now.
    ///
    /// Keys are collected first and removed one at a time so no shard lock
    /// is held for longer than a single removal.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let expired: Vec<LimitKey> = self
            .entries
            .iter()
            .filter(|e| e.window_end < now)
            .map(|e| e.key().clone())
            .collect();

        expired
            .iter()
            .filter(|k| {
                self.entries
                    .remove_if(*k, |_, e| e.window_end < now)
                    .is_some()
            })
            .count()
    }

    /// Number of stored entries, including not-yet-swept expired ones.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries whose window is still open.
    pub fn live_count(&self) -> usize {
        let now = self.clock.now_ms();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }
}
