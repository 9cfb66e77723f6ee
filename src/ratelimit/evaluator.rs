//! The five limit evaluators and violation selection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{trace, warn};

use super::counter::{WindowCounterStore, WindowOutcome};
use super::descriptor::LimitKey;
use super::request::RequestContext;
use super::rules::{LimitConfig, RuleAction, RuleSet};
use crate::error::EvaluationFault;
use crate::geo::GeoResolver;

/// Limiting dimension that produced a result.
///
/// Declaration order is reporting precedence: when several evaluators
/// report a violation for the same request, the smallest kind wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluatorKind {
    Global,
    Ip,
    User,
    Geo,
    Rule,
}

impl EvaluatorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluatorKind::Global => "global",
            EvaluatorKind::Ip => "ip",
            EvaluatorKind::User => "user",
            EvaluatorKind::Geo => "geo",
            EvaluatorKind::Rule => "rule",
        }
    }
}

/// The custom rule a [`EvaluatorKind::Rule`] result came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleHit {
    pub id: String,
    pub name: String,
    pub action: RuleAction,
}

/// Outcome of one evaluator for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluatorResult {
    pub kind: EvaluatorKind,
    pub key: LimitKey,
    pub violated: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Monotonic ms at which the window resets
    pub reset_at: u64,
    pub rule: Option<RuleHit>,
}

impl EvaluatorResult {
    fn from_outcome(kind: EvaluatorKind, key: LimitKey, outcome: WindowOutcome) -> Self {
        Self {
            kind,
            key,
            violated: outcome.violated,
            limit: outcome.limit,
            remaining: outcome.remaining,
            reset_at: outcome.reset_at,
            rule: None,
        }
    }
}

/// Pick the violation to report, by [`EvaluatorKind`] precedence.
///
/// Independent of the order evaluators ran in.
pub fn select_violation(results: &[EvaluatorResult]) -> Option<&EvaluatorResult> {
    results.iter().filter(|r| r.violated).min_by_key(|r| r.kind)
}

/// Divide a ceiling by a suspicion divisor without reaching zero.
fn tightened(ceiling: u64, divisor: u64) -> u64 {
    if ceiling == 0 {
        return 0;
    }
    (ceiling / divisor.max(1)).max(1)
}

/// Runs every configured limiting dimension against the shared window store.
pub struct Evaluators {
    store: Arc<WindowCounterStore>,
    global: Option<LimitConfig>,
    per_ip: Option<LimitConfig>,
    per_user: Option<LimitConfig>,
    elevated_roles: Vec<String>,
    per_geo: HashMap<String, LimitConfig>,
    rules: RuleSet,
    geo: Arc<dyn GeoResolver>,
    geo_timeout: Duration,
}

/// Limits an [`Evaluators`] is built from.
#[derive(Debug, Clone, Default)]
pub struct EvaluatorLimits {
    pub global: Option<LimitConfig>,
    pub per_ip: Option<LimitConfig>,
    pub per_user: Option<LimitConfig>,
    pub elevated_roles: Vec<String>,
    pub per_geo: HashMap<String, LimitConfig>,
}

impl Evaluators {
    pub fn new(
        store: Arc<WindowCounterStore>,
        limits: EvaluatorLimits,
        rules: RuleSet,
        geo: Arc<dyn GeoResolver>,
        geo_timeout: Duration,
    ) -> Self {
        let per_geo = limits
            .per_geo
            .into_iter()
            .map(|(country, limit)| (country.to_ascii_uppercase(), limit))
            .collect();

        Self {
            store,
            global: limits.global,
            per_ip: limits.per_ip,
            per_user: limits.per_user,
            elevated_roles: limits.elevated_roles,
            per_geo,
            rules,
            geo,
            geo_timeout,
        }
    }

    fn count(
        &self,
        kind: EvaluatorKind,
        key: LimitKey,
        window_ms: u64,
        ceiling: u64,
    ) -> EvaluatorResult {
        let outcome = self.store.evaluate(&key, window_ms, ceiling);
        trace!(
            kind = kind.as_str(),
            key = %key,
            count = outcome.count,
            limit = outcome.limit,
            violated = outcome.violated,
            "Evaluated limit"
        );
        EvaluatorResult::from_outcome(kind, key, outcome)
    }

    /// Service-wide limit under the single `global` key.
    pub fn global(&self) -> Option<EvaluatorResult> {
        let limit = self.global.as_ref()?;
        Some(self.count(
            EvaluatorKind::Global,
            LimitKey::Global,
            limit.window_ms,
            limit.ceiling(),
        ))
    }

    /// Per-IP limit, with the ceiling divided by the client's suspicion
    /// `divisor`.
    pub fn per_ip(&self, ip: &str, divisor: u64) -> Option<EvaluatorResult> {
        let limit = self.per_ip.as_ref()?;
        Some(self.count(
            EvaluatorKind::Ip,
            LimitKey::Ip(ip.to_string()),
            limit.window_ms,
            tightened(limit.ceiling(), divisor),
        ))
    }

    /// Per-user limit. Skipped for anonymous requests.
    pub fn per_user(&self, req: &RequestContext) -> Option<EvaluatorResult> {
        let limit = self.per_user.as_ref()?;
        let user = req.user_id.as_ref()?;

        let elevated = req
            .role
            .as_ref()
            .map_or(false, |role| self.elevated_roles.iter().any(|r| r == role));
        let ceiling = if elevated {
            limit.premium_ceiling()
        } else {
            limit.ceiling()
        };

        Some(self.count(
            EvaluatorKind::User,
            LimitKey::User(user.clone()),
            limit.window_ms,
            ceiling,
        ))
    }

    /// Per-country limit. Only consults the resolver when a country table
    /// is configured; lookups are bounded by the geo timeout.
    pub async fn per_geo(&self, ip: &str) -> Result<Option<EvaluatorResult>, EvaluationFault> {
        if self.per_geo.is_empty() {
            return Ok(None);
        }

        let country = match tokio::time::timeout(self.geo_timeout, self.geo.resolve(ip)).await {
            Ok(Ok(Some(country))) => country.to_ascii_uppercase(),
            Ok(Ok(None)) => return Ok(None),
            Ok(Err(e)) => {
                return Err(EvaluationFault::GeoLookup {
                    ip: ip.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(EvaluationFault::GeoTimeout {
                    ip: ip.to_string(),
                    timeout: self.geo_timeout,
                })
            }
        };

        let Some(limit) = self.per_geo.get(&country) else {
            return Ok(None);
        };

        Ok(Some(self.count(
            EvaluatorKind::Geo,
            LimitKey::Geo {
                country,
                ip: ip.to_string(),
            },
            limit.window_ms,
            limit.ceiling(),
        )))
    }

    /// Custom rules, highest priority first.
    ///
    /// Stops at the first matching rule that is violated. Matching rules
    /// that are not violated are counted and scanning continues. Returns
    /// the first matching rule's result when none is violated.
    pub fn custom_rules(&self, req: &RequestContext) -> Option<EvaluatorResult> {
        let mut first_match = None;

        for rule in self.rules.iter() {
            if !rule.matches(req) {
                continue;
            }

            let key = LimitKey::Rule {
                id: rule.id.clone(),
                ip: req.client_ip.clone(),
            };
            let mut result = self.count(
                EvaluatorKind::Rule,
                key,
                rule.limit.window_ms,
                rule.limit.ceiling(),
            );
            result.rule = Some(RuleHit {
                id: rule.id.clone(),
                name: rule.name.clone(),
                action: rule.action,
            });

            if result.violated {
                return Some(result);
            }
            if first_match.is_none() {
                first_match = Some(result);
            }
        }

        first_match
    }

    /// Run every evaluator for `req`.
    ///
    /// Faults are logged and the faulting evaluator is left out of the
    /// results, so it can never cause a denial.
    pub async fn evaluate_all(
        &self,
        req: &RequestContext,
        ip_divisor: u64,
    ) -> Vec<EvaluatorResult> {
        let mut results = Vec::with_capacity(5);

        results.extend(self.global());
        results.extend(self.per_ip(&req.client_ip, ip_divisor));
        results.extend(self.per_user(req));

        match self.per_geo(&req.client_ip).await {
            Ok(result) => results.extend(result),
            Err(fault) => warn!(
                ip = %req.client_ip,
                error = %fault,
                "Geo evaluation failed, admitting"
            ),
        }

        results.extend(self.custom_rules(req));
        results
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }
}
