//! Configuration management for Gatekeeper.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{GatekeeperError, Result};
use crate::geo::GeoRange;
use crate::ratelimit::access::IpList;
use crate::ratelimit::{CustomRuleConfig, EvaluatorKind, LimitConfig};

/// Prefix for environment overrides, e.g. `GATEKEEPER__SERVER__LISTEN_ADDR`.
pub const ENV_PREFIX: &str = "GATEKEEPER";

/// Main configuration for the Gatekeeper service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Admission control configuration
    #[serde(default)]
    pub admission: AdmissionConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Bearer token required by the admin routes. Admin routes are not
    /// mounted when unset.
    #[serde(default)]
    pub admin_token: Option<String>,

    /// Accept `X-Authenticated-User` / `X-Authenticated-Role` on the check
    /// endpoint. Only enable behind a proxy that strips client copies.
    #[serde(default)]
    pub trust_identity_headers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            admin_token: None,
            trust_identity_headers: false,
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Admission control configuration.
///
/// Defaults are applied once when the configuration is deserialized; the
/// controller never merges configuration per call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Service-wide limit
    #[serde(default)]
    pub global: Option<LimitConfig>,

    /// Per client IP limit
    #[serde(default = "default_per_ip")]
    pub per_ip: Option<LimitConfig>,

    /// Per authenticated user limit
    #[serde(default)]
    pub per_user: Option<LimitConfig>,

    /// Per country limits, keyed by ISO country code
    #[serde(default)]
    pub per_geo: HashMap<String, LimitConfig>,

    /// Static CIDR → country table for the built-in geo resolver
    #[serde(default)]
    pub geo_ranges: Vec<GeoRange>,

    /// Roles that get the per-user `premium_max` ceiling
    #[serde(default = "default_elevated_roles")]
    pub elevated_roles: Vec<String>,

    /// CIDRs or IPs that bypass admission control entirely
    #[serde(default)]
    pub allowlist: Vec<String>,

    /// CIDRs or IPs that are always rejected
    #[serde(default)]
    pub blocklist: Vec<String>,

    /// Roles that bypass admission control
    #[serde(default = "default_exempt_roles")]
    pub exempt_roles: Vec<String>,

    /// Route prefixes that bypass admission control
    #[serde(default = "default_exempt_routes")]
    pub exempt_routes: Vec<String>,

    /// Custom rules
    #[serde(default)]
    pub rules: Vec<CustomRuleConfig>,

    #[serde(default)]
    pub behavior: BehaviorConfig,

    #[serde(default)]
    pub penalty: PenaltyConfig,

    /// Sweeper interval in milliseconds
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Suspicion score removed per sweep
    #[serde(default = "default_decay_step")]
    pub decay_step: u32,

    /// Attach `X-RateLimit-*` headers to responses
    #[serde(default = "default_true")]
    pub headers_enabled: bool,

    /// Upper bound on a single geo lookup
    #[serde(default = "default_geo_timeout_ms")]
    pub geo_timeout_ms: u64,

    /// How many clients `stats()` lists as most suspicious
    #[serde(default = "default_top_suspicious_limit")]
    pub top_suspicious_limit: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            global: None,
            per_ip: default_per_ip(),
            per_user: None,
            per_geo: HashMap::new(),
            geo_ranges: Vec::new(),
            elevated_roles: default_elevated_roles(),
            allowlist: Vec::new(),
            blocklist: Vec::new(),
            exempt_roles: default_exempt_roles(),
            exempt_routes: default_exempt_routes(),
            rules: Vec::new(),
            behavior: BehaviorConfig::default(),
            penalty: PenaltyConfig::default(),
            sweep_interval_ms: default_sweep_interval_ms(),
            decay_step: default_decay_step(),
            headers_enabled: true,
            geo_timeout_ms: default_geo_timeout_ms(),
            top_suspicious_limit: default_top_suspicious_limit(),
        }
    }
}

fn default_per_ip() -> Option<LimitConfig> {
    Some(LimitConfig::new(60_000, 100))
}

fn default_elevated_roles() -> Vec<String> {
    vec!["premium".to_string(), "admin".to_string()]
}

fn default_exempt_roles() -> Vec<String> {
    vec!["admin".to_string(), "system".to_string()]
}

fn default_exempt_routes() -> Vec<String> {
    vec!["/health".to_string()]
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

fn default_decay_step() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_geo_timeout_ms() -> u64 {
    50
}

fn default_top_suspicious_limit() -> usize {
    10
}

impl AdmissionConfig {
    /// Reject configurations that cannot run. Called before startup.
    pub fn validate(&self) -> Result<()> {
        if let Some(limit) = &self.global {
            limit.validate("global")?;
        }
        if let Some(limit) = &self.per_ip {
            limit.validate("per_ip")?;
        }
        if let Some(limit) = &self.per_user {
            limit.validate("per_user")?;
        }
        for (country, limit) in &self.per_geo {
            limit.validate(&format!("per_geo.{}", country))?;
        }

        IpList::parse("allowlist", &self.allowlist)?;
        IpList::parse("blocklist", &self.blocklist)?;

        if self.sweep_interval_ms == 0 {
            return Err(GatekeeperError::Config(
                "sweep_interval_ms must be greater than zero".into(),
            ));
        }
        if self.decay_step == 0 {
            return Err(GatekeeperError::Config(
                "decay_step must be greater than zero".into(),
            ));
        }
        // A zero timeout would skip every geo lookup
        if self.geo_timeout_ms == 0 {
            return Err(GatekeeperError::Config(
                "geo_timeout_ms must be greater than zero".into(),
            ));
        }

        self.behavior.validate()?;
        self.penalty.validate()?;
        Ok(())
    }
}

/// Behavioral analysis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorConfig {
    /// Score at which a client is penalized
    #[serde(default = "default_suspicious_threshold")]
    pub suspicious_threshold: u32,

    /// User agents shorter than this count as implausible
    #[serde(default = "default_min_user_agent_len")]
    pub min_user_agent_len: usize,

    /// Authentication and administrative route prefixes
    #[serde(default = "default_sensitive_route_prefixes")]
    pub sensitive_route_prefixes: Vec<String>,

    #[serde(default)]
    pub weights: BehaviorWeights,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            suspicious_threshold: default_suspicious_threshold(),
            min_user_agent_len: default_min_user_agent_len(),
            sensitive_route_prefixes: default_sensitive_route_prefixes(),
            weights: BehaviorWeights::default(),
        }
    }
}

fn default_suspicious_threshold() -> u32 {
    50
}

fn default_min_user_agent_len() -> usize {
    10
}

fn default_sensitive_route_prefixes() -> Vec<String> {
    vec!["/auth".to_string(), "/admin".to_string(), "/login".to_string()]
}

impl BehaviorConfig {
    fn validate(&self) -> Result<()> {
        if self.suspicious_threshold == 0 {
            return Err(GatekeeperError::Config(
                "behavior.suspicious_threshold must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Suspicion score weights.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorWeights {
    pub missing_user_agent: u32,
    pub sensitive_route: u32,
    pub global_violation: u32,
    pub ip_violation: u32,
    pub user_violation: u32,
    pub geo_violation: u32,
    pub rule_violation: u32,
}

impl Default for BehaviorWeights {
    fn default() -> Self {
        Self {
            missing_user_agent: 5,
            sensitive_route: 3,
            global_violation: 10,
            ip_violation: 15,
            user_violation: 5,
            geo_violation: 20,
            rule_violation: 25,
        }
    }
}

impl BehaviorWeights {
    /// Weight added for a violation reported by `kind`.
    pub fn violation(&self, kind: EvaluatorKind) -> u32 {
        match kind {
            EvaluatorKind::Global => self.global_violation,
            EvaluatorKind::Ip => self.ip_violation,
            EvaluatorKind::User => self.user_violation,
            EvaluatorKind::Geo => self.geo_violation,
            EvaluatorKind::Rule => self.rule_violation,
        }
    }
}

/// Penalty configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PenaltyConfig {
    /// Penalty minutes per point of suspicion score
    #[serde(default = "default_multiplier_minutes")]
    pub multiplier_minutes: u64,

    /// Longest penalty that can be imposed from score
    #[serde(default = "default_max_duration_ms")]
    pub max_duration_ms: u64,

    /// Score points per step of per-IP limit tightening
    #[serde(default = "default_score_divisor_step")]
    pub score_divisor_step: u32,
}

impl Default for PenaltyConfig {
    fn default() -> Self {
        Self {
            multiplier_minutes: default_multiplier_minutes(),
            max_duration_ms: default_max_duration_ms(),
            score_divisor_step: default_score_divisor_step(),
        }
    }
}

fn default_multiplier_minutes() -> u64 {
    1
}

fn default_max_duration_ms() -> u64 {
    3_600_000
}

fn default_score_divisor_step() -> u32 {
    20
}

impl PenaltyConfig {
    fn validate(&self) -> Result<()> {
        if self.max_duration_ms == 0 {
            return Err(GatekeeperError::Config(
                "penalty.max_duration_ms must be greater than zero".into(),
            ));
        }
        if self.score_divisor_step == 0 {
            return Err(GatekeeperError::Config(
                "penalty.score_divisor_step must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

impl GatekeeperConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GatekeeperError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Load configuration from a YAML file, layered with `GATEKEEPER__*`
    /// environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        if !path.exists() {
            return Err(GatekeeperError::Config(format!(
                "configuration file {} does not exist",
                path.display()
            )));
        }

        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path).format(::config::FileFormat::Yaml))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| GatekeeperError::Config(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| GatekeeperError::Config(e.to_string()))
    }
}
