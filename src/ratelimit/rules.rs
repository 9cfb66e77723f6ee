//! Limit and custom rule configuration.
//!
//! Limits and rules are loaded from YAML alongside the rest of the service
//! configuration. Custom rules can also be built in code with an arbitrary
//! predicate closure.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::request::RequestContext;
use crate::error::{GatekeeperError, Result};

/// Artificial delay applied by `delay` rules when none is configured.
pub const DEFAULT_RULE_DELAY_MS: u64 = 1_000;

/// One fixed-window limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Length of the counting window in milliseconds
    pub window_ms: u64,
    /// Requests allowed per window
    pub max_requests: u64,
    /// Extra requests tolerated on top of `max_requests`
    #[serde(default)]
    pub burst: Option<u64>,
    /// Ceiling for elevated roles (per-user limits only)
    #[serde(default)]
    pub premium_max: Option<u64>,
    /// Explicit intent to reject everything; required for `max_requests: 0`
    #[serde(default)]
    pub block_all: bool,
}

impl LimitConfig {
    pub fn new(window_ms: u64, max_requests: u64) -> Self {
        Self {
            window_ms,
            max_requests,
            burst: None,
            premium_max: None,
            block_all: false,
        }
    }

    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst = Some(burst);
        self
    }

    pub fn with_premium_max(mut self, premium_max: u64) -> Self {
        self.premium_max = Some(premium_max);
        self
    }

    /// A limit that rejects every request.
    pub fn block_all(window_ms: u64) -> Self {
        Self {
            block_all: true,
            ..Self::new(window_ms, 0)
        }
    }

    /// Effective ceiling including burst.
    pub fn ceiling(&self) -> u64 {
        if self.block_all {
            return 0;
        }
        self.max_requests.saturating_add(self.burst.unwrap_or(0))
    }

    /// Effective ceiling for elevated roles.
    pub fn premium_ceiling(&self) -> u64 {
        match self.premium_max {
            Some(max) if !self.block_all => max.saturating_add(self.burst.unwrap_or(0)),
            _ => self.ceiling(),
        }
    }

    /// Validate the limit, naming it in any error.
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.window_ms == 0 {
            return Err(GatekeeperError::Config(format!(
                "{}: window_ms must be greater than zero",
                name
            )));
        }
        if self.max_requests == 0 && !self.block_all {
            return Err(GatekeeperError::Config(format!(
                "{}: max_requests must be greater than zero (set block_all to reject everything)",
                name
            )));
        }
        if let Some(0) = self.premium_max {
            return Err(GatekeeperError::Config(format!(
                "{}: premium_max must be greater than zero",
                name
            )));
        }
        Ok(())
    }
}

/// Kind of out-of-band notification a rule can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyKind {
    Captcha,
    Warn,
}

impl NotifyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyKind::Captcha => "captcha",
            NotifyKind::Warn => "warn",
        }
    }
}

/// What happens when a custom rule's limit is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RuleAction {
    /// Reject with 429
    Block,
    /// Admit after an artificial delay
    Delay {
        #[serde(default = "default_delay_ms")]
        ms: u64,
    },
    /// Admit and notify
    Notify { kind: NotifyKind },
}

fn default_delay_ms() -> u64 {
    DEFAULT_RULE_DELAY_MS
}

impl Default for RuleAction {
    fn default() -> Self {
        RuleAction::Block
    }
}

impl RuleAction {
    /// Whether this action denies the request.
    pub fn denies(&self) -> bool {
        matches!(self, RuleAction::Block)
    }
}

/// Declarative request matcher. Every populated field must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleMatch {
    /// Route prefix, e.g. `/api/upload`
    #[serde(default)]
    pub path_prefix: Option<String>,
    /// HTTP methods, case-insensitive
    #[serde(default)]
    pub methods: Vec<String>,
    /// Caller roles
    #[serde(default)]
    pub roles: Vec<String>,
    /// Case-insensitive substring of the user agent
    #[serde(default)]
    pub user_agent_contains: Option<String>,
    /// Only match requests without an identity
    #[serde(default)]
    pub anonymous_only: bool,
}

impl RuleMatch {
    pub fn matches(&self, req: &RequestContext) -> bool {
        if let Some(prefix) = &self.path_prefix {
            if !req.path.starts_with(prefix.as_str()) {
                return false;
            }
        }

        if !self.methods.is_empty()
            && !self.methods.iter().any(|m| m.eq_ignore_ascii_case(&req.method))
        {
            return false;
        }

        if !self.roles.is_empty() {
            match &req.role {
                Some(role) if self.roles.iter().any(|r| r == role) => {}
                _ => return false,
            }
        }

        if let Some(needle) = &self.user_agent_contains {
            let needle = needle.to_ascii_lowercase();
            match &req.user_agent {
                Some(ua) if ua.to_ascii_lowercase().contains(&needle) => {}
                _ => return false,
            }
        }

        if self.anonymous_only && req.is_authenticated() {
            return false;
        }

        true
    }
}

/// Predicate deciding whether a rule applies to a request.
#[derive(Clone)]
pub enum RulePredicate {
    Matcher(RuleMatch),
    Custom(Arc<dyn Fn(&RequestContext) -> bool + Send + Sync>),
}

impl RulePredicate {
    /// A custom predicate that panics counts as not matching.
    pub fn matches(&self, req: &RequestContext) -> bool {
        match self {
            RulePredicate::Matcher(m) => m.matches(req),
            RulePredicate::Custom(f) => {
                catch_unwind(AssertUnwindSafe(|| f(req))).unwrap_or_else(|_| {
                    warn!(ip = %req.client_ip, path = %req.path, "Custom rule predicate panicked");
                    false
                })
            }
        }
    }
}

impl fmt::Debug for RulePredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RulePredicate::Matcher(m) => f.debug_tuple("Matcher").field(m).finish(),
            RulePredicate::Custom(_) => f.write_str("Custom(<fn>)"),
        }
    }
}

/// A custom limit applied to requests matching a predicate.
#[derive(Debug, Clone)]
pub struct CustomRule {
    pub id: String,
    pub name: String,
    pub predicate: RulePredicate,
    pub limit: LimitConfig,
    pub action: RuleAction,
    /// Higher priorities are evaluated first
    pub priority: i32,
    pub enabled: bool,
}

impl CustomRule {
    /// Create an enabled blocking rule at priority 0.
    pub fn new<F>(
        id: impl Into<String>,
        name: impl Into<String>,
        predicate: F,
        limit: LimitConfig,
    ) -> Self
    where
        F: Fn(&RequestContext) -> bool + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            name: name.into(),
            predicate: RulePredicate::Custom(Arc::new(predicate)),
            limit,
            action: RuleAction::Block,
            priority: 0,
            enabled: true,
        }
    }

    pub fn with_action(mut self, action: RuleAction) -> Self {
        self.action = action;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn matches(&self, req: &RequestContext) -> bool {
        self.enabled && self.predicate.matches(req)
    }
}

/// Serialized form of a [`CustomRule`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomRuleConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "match", default)]
    pub matcher: RuleMatch,
    pub limit: LimitConfig,
    #[serde(default)]
    pub action: RuleAction,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl From<CustomRuleConfig> for CustomRule {
    fn from(config: CustomRuleConfig) -> Self {
        Self {
            name: config.name.unwrap_or_else(|| config.id.clone()),
            id: config.id,
            predicate: RulePredicate::Matcher(config.matcher),
            limit: config.limit,
            action: config.action,
            priority: config.priority,
            enabled: config.enabled,
        }
    }
}

/// Custom rules ordered by descending priority.
///
/// Rules with equal priority keep their configured order.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<CustomRule>,
}

impl RuleSet {
    /// Validate and order `rules`.
    pub fn new(mut rules: Vec<CustomRule>) -> Result<Self> {
        let mut seen = std::collections::HashSet::new();
        for rule in &rules {
            if rule.id.trim().is_empty() {
                return Err(GatekeeperError::Config("custom rule id must not be empty".into()));
            }
            if !seen.insert(rule.id.clone()) {
                return Err(GatekeeperError::Config(format!(
                    "duplicate custom rule id '{}'",
                    rule.id
                )));
            }
            rule.limit.validate(&format!("rule '{}'", rule.id))?;
        }

        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(Self { rules })
    }

    pub fn iter(&self) -> impl Iterator<Item = &CustomRule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
