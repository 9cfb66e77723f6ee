//! Temporary blocks and suspicion scores per client.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::PenaltyConfig;

/// Result of one decay pass over the suspicion scores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecayReport {
    /// Scores lowered but still positive
    pub decayed: usize,
    /// Scores that reached zero and were removed
    pub removed: usize,
}

/// Tracks "blocked until" deadlines and accumulated suspicion per client.
///
/// A client under penalty is rejected before any limit is evaluated. While a
/// client has a score but no penalty, its per-IP ceiling is divided by
/// [`PenaltyEngine::limit_divisor`] so limits tighten before an outright
/// block.
pub struct PenaltyEngine {
    /// Client key → monotonic ms the block lifts at
    penalties: DashMap<String, u64>,
    /// Client key → suspicion score
    scores: DashMap<String, u32>,
    config: PenaltyConfig,
    clock: Arc<dyn Clock>,
}

impl PenaltyEngine {
    pub fn new(config: PenaltyConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            penalties: DashMap::new(),
            scores: DashMap::new(),
            config,
            clock,
        }
    }

    /// Milliseconds left on `client`'s penalty, if one is active.
    ///
    /// Lapsed penalties are evicted on the way.
    pub fn remaining_ms(&self, client: &str) -> Option<u64> {
        let now = self.clock.now_ms();
        let blocked_until = *self.penalties.get(client)?;
        if now < blocked_until {
            return Some(blocked_until - now);
        }
        self.penalties.remove_if(client, |_, until| *until <= now);
        None
    }

    pub fn is_penalized(&self, client: &str) -> bool {
        self.remaining_ms(client).is_some()
    }

    /// Penalty length for a given score.
    pub fn penalty_duration_ms(&self, score: u32) -> u64 {
        (score as u64)
            .saturating_mul(self.config.multiplier_minutes)
            .saturating_mul(60_000)
            .min(self.config.max_duration_ms)
    }

    /// Block `client` for a duration proportional to `score`.
    ///
    /// Returns the duration applied.
    pub fn apply_penalty(&self, client: &str, score: u32) -> u64 {
        let duration = self.penalty_duration_ms(score);
        self.block_for(client, duration);
        warn!(
            client = %client,
            score = score,
            blocked_ms = duration,
            "Penalty applied"
        );
        duration
    }

    /// Block `client` for exactly `duration_ms`, replacing any existing penalty.
    pub fn block_for(&self, client: &str, duration_ms: u64) {
        let until = self.clock.now_ms().saturating_add(duration_ms);
        self.penalties.insert(client.to_string(), until);
    }

    /// Lift `client`'s penalty. Returns whether one was active.
    pub fn clear_penalty(&self, client: &str) -> bool {
        let now = self.clock.now_ms();
        let removed = self
            .penalties
            .remove(client)
            .map(|(_, until)| until > now)
            .unwrap_or(false);
        if removed {
            info!(client = %client, "Penalty removed");
        }
        removed
    }

    pub fn score(&self, client: &str) -> u32 {
        self.scores.get(client).map(|s| *s).unwrap_or(0)
    }

    /// Add `weight` to `client`'s score and return the new score.
    pub fn add_score(&self, client: &str, weight: u32) -> u32 {
        if weight == 0 {
            return self.score(client);
        }
        let mut score = self.scores.entry(client.to_string()).or_insert(0);
        *score = score.saturating_add(weight);
        *score
    }

    pub fn clear_score(&self, client: &str) -> bool {
        self.scores.remove(client).is_some()
    }

    /// Divisor applied to `client`'s per-IP ceiling.
    ///
    /// `max(1, score / score_divisor_step)` while the client has a score and
    /// no active penalty, otherwise 1.
    pub fn limit_divisor(&self, client: &str) -> u64 {
        let score = self.score(client);
        if score == 0 || self.is_penalized(client) {
            return 1;
        }
        ((score / self.config.score_divisor_step) as u64).max(1)
    }

    /// Evict penalties that have lapsed. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let expired: Vec<String> = self
            .penalties
            .iter()
            .filter(|e| *e.value() < now)
            .map(|e| e.key().clone())
            .collect();

        expired
            .iter()
            .filter(|k| {
                self.penalties
                    .remove_if(k.as_str(), |_, until| *until < now)
                    .is_some()
            })
            .count()
    }

    /// Lower every score by `step`, removing scores that reach zero.
    pub fn decay(&self, step: u32) -> DecayReport {
        let mut report = DecayReport::default();
        let clients: Vec<String> = self.scores.iter().map(|e| e.key().clone()).collect();

        for client in clients {
            let reached_zero = match self.scores.get_mut(&client) {
                Some(mut score) => {
                    *score = score.saturating_sub(step);
                    *score == 0
                }
                None => continue,
            };

            if reached_zero {
                if self.scores.remove_if(&client, |_, s| *s == 0).is_some() {
                    report.removed += 1;
                }
            } else {
                report.decayed += 1;
            }
        }

        report
    }

    /// Number of unexpired penalties.
    pub fn active_penalties(&self) -> usize {
        let now = self.clock.now_ms();
        self.penalties.iter().filter(|e| *e.value() > now).count()
    }

    /// Number of clients with a non-zero score.
    pub fn suspicious_clients(&self) -> usize {
        self.scores.len()
    }

    /// The `limit` highest-scoring clients, highest first.
    pub fn top_suspicious(&self, limit: usize) -> Vec<(String, u32)> {
        let mut all: Vec<(String, u32)> = self
            .scores
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        all.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        all.truncate(limit);
        all
    }
}
