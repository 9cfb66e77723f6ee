//! Behavioral heuristics feeding the suspicion score.

use std::sync::Arc;

use tracing::debug;

use super::evaluator::EvaluatorKind;
use super::penalty::PenaltyEngine;
use super::request::RequestContext;
use crate::config::BehaviorConfig;

/// Raises suspicion scores from request shape and limit violations, and
/// hands clients over to the [`PenaltyEngine`] once they cross the
/// configured threshold.
pub struct BehavioralAnalyzer {
    config: BehaviorConfig,
    penalties: Arc<PenaltyEngine>,
}

impl BehavioralAnalyzer {
    pub fn new(config: BehaviorConfig, penalties: Arc<PenaltyEngine>) -> Self {
        Self { config, penalties }
    }

    /// Score an admitted request.
    ///
    /// Returns the penalty duration if this request pushed the client over
    /// the threshold.
    pub fn on_request_admitted(&self, req: &RequestContext, client: &str) -> Option<u64> {
        let weight = self.request_weight(req);
        if weight == 0 {
            return None;
        }

        let score = self.penalties.add_score(client, weight);
        debug!(client = %client, weight = weight, score = score, "Suspicious request shape");
        self.maybe_penalize(client, score)
    }

    /// Score a limit violation reported by `kind`.
    pub fn on_violation(&self, client: &str, kind: EvaluatorKind) -> Option<u64> {
        let weight = self.config.weights.violation(kind);
        let score = self.penalties.add_score(client, weight);
        debug!(client = %client, kind = kind.as_str(), score = score, "Violation scored");
        self.maybe_penalize(client, score)
    }

    /// Weight contributed by the shape of `req` alone.
    pub fn request_weight(&self, req: &RequestContext) -> u32 {
        let mut weight = 0;

        let implausible_agent = match &req.user_agent {
            Some(ua) => ua.trim().len() < self.config.min_user_agent_len,
            None => true,
        };
        if implausible_agent {
            weight += self.config.weights.missing_user_agent;
        }

        if self
            .config
            .sensitive_route_prefixes
            .iter()
            .any(|prefix| req.path.starts_with(prefix.as_str()))
        {
            weight += self.config.weights.sensitive_route;
        }

        weight
    }

    fn maybe_penalize(&self, client: &str, score: u32) -> Option<u64> {
        if score < self.config.suspicious_threshold || self.penalties.is_penalized(client) {
            return None;
        }
        Some(self.penalties.apply_penalty(client, score))
    }
}
