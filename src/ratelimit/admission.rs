//! The admission decision entry point.
//!
//! [`AdmissionController::decide`] runs a fixed sequence per request:
//! bypass checks (allowlist, exempt role, exempt route), the blocklist,
//! the penalty gate, and finally every limit evaluator. The first
//! violation by precedence decides the response. Nothing in here returns
//! an error to the caller; evaluator faults are logged and admitted.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, trace, warn};

use super::access::IpList;
use super::behavior::BehavioralAnalyzer;
use super::counter::WindowCounterStore;
use super::evaluator::{
    select_violation, EvaluatorKind, EvaluatorLimits, EvaluatorResult, Evaluators,
};
use super::penalty::PenaltyEngine;
use super::request::RequestContext;
use super::rules::{CustomRule, NotifyKind, RuleAction, RuleSet};
use super::sweeper::{SweepReport, Sweeper};
use crate::clock::{Clock, MonotonicClock};
use crate::config::AdmissionConfig;
use crate::error::Result;
use crate::geo::{GeoResolver, StaticGeoResolver};
use crate::notify::{NotificationSink, RuleNotification, TracingNotificationSink};

/// Why a request skipped admission control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BypassReason {
    Allowlist,
    ExemptRole,
    ExemptRoute,
}

/// Where a request ended up in the decision sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DecisionState {
    Bypassed { reason: BypassReason },
    Blocklisted,
    Penalized,
    Violated { kind: EvaluatorKind },
    /// A custom rule was exceeded but its action admits the request.
    RuleAction { action: RuleAction },
    Admitted,
}

/// Values for the `X-RateLimit-*` response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitHeaders {
    pub limit: u64,
    pub remaining: u64,
    /// Milliseconds until the reporting window resets
    pub reset_after_ms: u64,
}

impl RateLimitHeaders {
    fn from_result(result: &EvaluatorResult, now: u64) -> Self {
        Self {
            limit: result.limit,
            remaining: result.remaining,
            reset_after_ms: result.reset_at.saturating_sub(now),
        }
    }
}

/// JSON body sent with a denial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DenialBody {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

/// The outcome of one admission decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub admit: bool,
    /// 200 when admitted, 429 otherwise
    pub status: u16,
    pub state: DecisionState,
    pub headers: Option<RateLimitHeaders>,
    pub retry_after_secs: Option<u64>,
    pub body: Option<DenialBody>,
    /// Wait this long before passing the request on
    pub delay: Option<Duration>,
}

impl Decision {
    fn bypass(reason: BypassReason) -> Self {
        Self::admitted(DecisionState::Bypassed { reason }, None)
    }

    fn admitted(state: DecisionState, headers: Option<RateLimitHeaders>) -> Self {
        Self {
            admit: true,
            status: 200,
            state,
            headers,
            retry_after_secs: None,
            body: None,
            delay: None,
        }
    }

    fn denied(
        status: u16,
        state: DecisionState,
        error: &str,
        message: String,
        retry_after_secs: Option<u64>,
        headers: Option<RateLimitHeaders>,
    ) -> Self {
        Self {
            admit: false,
            status,
            state,
            headers,
            retry_after_secs,
            body: Some(DenialBody {
                error: error.to_string(),
                message,
                retry_after: retry_after_secs,
            }),
            delay: None,
        }
    }

    pub fn is_bypass(&self) -> bool {
        matches!(self.state, DecisionState::Bypassed { .. })
    }
}

/// Milliseconds to whole seconds for `Retry-After`, never below one.
fn retry_secs(ms: u64) -> u64 {
    ms.div_ceil(1_000).max(1)
}

/// A client and its suspicion score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SuspiciousClient {
    pub client: String,
    pub score: u32,
}

/// Snapshot of admission state for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdmissionStats {
    pub active_window_entries: usize,
    pub active_penalties: usize,
    pub suspicious_client_count: usize,
    pub top_suspicious_clients: Vec<SuspiciousClient>,
}

/// What an unblock removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UnblockReport {
    pub penalty_cleared: bool,
    pub score_cleared: bool,
    pub windows_removed: usize,
}

/// Builds an [`AdmissionController`] with non-default collaborators.
pub struct AdmissionControllerBuilder {
    config: AdmissionConfig,
    clock: Option<Arc<dyn Clock>>,
    geo: Option<Arc<dyn GeoResolver>>,
    notifier: Option<Arc<dyn NotificationSink>>,
    rules: Vec<CustomRule>,
}

impl AdmissionControllerBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn geo_resolver(mut self, geo: Arc<dyn GeoResolver>) -> Self {
        self.geo = Some(geo);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Add a rule built in code, alongside the configured ones.
    pub fn rule(mut self, rule: CustomRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Validate the configuration and assemble the controller.
    pub fn build(self) -> Result<AdmissionController> {
        let config = self.config;
        config.validate()?;

        let clock: Arc<dyn Clock> = self
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()));
        let geo: Arc<dyn GeoResolver> = match self.geo {
            Some(geo) => geo,
            None => Arc::new(StaticGeoResolver::from_ranges(&config.geo_ranges)?),
        };
        let notifier: Arc<dyn NotificationSink> = self
            .notifier
            .unwrap_or_else(|| Arc::new(TracingNotificationSink));

        let mut rules: Vec<CustomRule> =
            config.rules.iter().cloned().map(CustomRule::from).collect();
        rules.extend(self.rules);
        let rules = RuleSet::new(rules)?;

        let allowlist = IpList::parse("allowlist", &config.allowlist)?;
        let blocklist = IpList::parse("blocklist", &config.blocklist)?;

        let store = Arc::new(WindowCounterStore::new(clock.clone()));
        let penalties = Arc::new(PenaltyEngine::new(config.penalty.clone(), clock.clone()));
        let behavior = BehavioralAnalyzer::new(config.behavior.clone(), penalties.clone());

        let limits = EvaluatorLimits {
            global: config.global.clone(),
            per_ip: config.per_ip.clone(),
            per_user: config.per_user.clone(),
            elevated_roles: config.elevated_roles.clone(),
            per_geo: config.per_geo.clone(),
        };
        let evaluators = Evaluators::new(
            store.clone(),
            limits,
            rules,
            geo,
            Duration::from_millis(config.geo_timeout_ms),
        );

        let sweeper = Arc::new(Sweeper::new(
            store.clone(),
            penalties.clone(),
            Duration::from_millis(config.sweep_interval_ms),
            config.decay_step,
        ));

        info!(
            rules = evaluators.rules().len(),
            allowlist = allowlist.len(),
            blocklist = blocklist.len(),
            geo_countries = config.per_geo.len(),
            "Admission controller initialized"
        );

        Ok(AdmissionController {
            allowlist,
            blocklist,
            exempt_roles: config.exempt_roles,
            exempt_routes: config.exempt_routes,
            headers_enabled: config.headers_enabled,
            top_suspicious_limit: config.top_suspicious_limit,
            store,
            penalties,
            behavior,
            evaluators,
            notifier,
            sweeper,
            clock,
        })
    }
}

/// Owns every admission table and decides each request.
///
/// Constructed once and shared behind an `Arc`; call [`start`](Self::start)
/// to run the sweeper and [`stop`](Self::stop) on shutdown.
pub struct AdmissionController {
    allowlist: IpList,
    blocklist: IpList,
    exempt_roles: Vec<String>,
    exempt_routes: Vec<String>,
    headers_enabled: bool,
    top_suspicious_limit: usize,
    store: Arc<WindowCounterStore>,
    penalties: Arc<PenaltyEngine>,
    behavior: BehavioralAnalyzer,
    evaluators: Evaluators,
    notifier: Arc<dyn NotificationSink>,
    sweeper: Arc<Sweeper>,
    clock: Arc<dyn Clock>,
}

impl AdmissionController {
    /// Controller with the monotonic clock, the configured static geo table
    /// and logging notifications.
    pub fn new(config: AdmissionConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: AdmissionConfig) -> AdmissionControllerBuilder {
        AdmissionControllerBuilder {
            config,
            clock: None,
            geo: None,
            notifier: None,
            rules: Vec::new(),
        }
    }

    /// Decide whether `req` may proceed.
    pub async fn decide(&self, req: &RequestContext) -> Decision {
        let client = req.client_ip.as_str();

        if let Some(reason) = self.bypass_reason(req) {
            trace!(ip = %client, reason = ?reason, "Admission bypassed");
            return Decision::bypass(reason);
        }

        if self.blocklist.contains(client) {
            warn!(ip = %client, path = %req.path, "Blocklisted client rejected");
            return Decision::denied(
                429,
                DecisionState::Blocklisted,
                "too_many_requests",
                "Access from this address is not permitted".to_string(),
                None,
                None,
            );
        }

        if let Some(remaining_ms) = self.penalties.remaining_ms(client) {
            debug!(ip = %client, remaining_ms = remaining_ms, "Penalized client rejected");
            let retry = retry_secs(remaining_ms);
            return Decision::denied(
                429,
                DecisionState::Penalized,
                "too_many_requests",
                format!("Temporarily blocked. Try again in {} seconds.", retry),
                Some(retry),
                None,
            );
        }

        let divisor = self.penalties.limit_divisor(client);
        let results = self.evaluators.evaluate_all(req, divisor).await;
        let now = self.clock.now_ms();

        let Some(violation) = select_violation(&results) else {
            self.behavior.on_request_admitted(req, client);
            trace!(ip = %client, evaluated = results.len(), "Request admitted");
            return Decision::admitted(DecisionState::Admitted, self.ip_headers(&results, now));
        };

        if let Some(hit) = violation.rule.as_ref().filter(|hit| !hit.action.denies()) {
            return self
                .soft_rule_violation(req, hit.action, &hit.id, &hit.name, &results, now)
                .await;
        }

        self.deny(req, violation, now)
    }

    fn bypass_reason(&self, req: &RequestContext) -> Option<BypassReason> {
        if self.allowlist.contains(&req.client_ip) {
            return Some(BypassReason::Allowlist);
        }
        if let Some(role) = &req.role {
            if self.exempt_roles.iter().any(|r| r == role) {
                return Some(BypassReason::ExemptRole);
            }
        }
        if self
            .exempt_routes
            .iter()
            .any(|prefix| req.path.starts_with(prefix.as_str()))
        {
            return Some(BypassReason::ExemptRoute);
        }
        None
    }

    fn ip_headers(&self, results: &[EvaluatorResult], now: u64) -> Option<RateLimitHeaders> {
        if !self.headers_enabled {
            return None;
        }
        results
            .iter()
            .find(|r| r.kind == EvaluatorKind::Ip)
            .map(|r| RateLimitHeaders::from_result(r, now))
    }

    fn deny(&self, req: &RequestContext, violation: &EvaluatorResult, now: u64) -> Decision {
        let client = req.client_ip.as_str();
        warn!(
            ip = %client,
            kind = violation.kind.as_str(),
            key = %violation.key,
            limit = violation.limit,
            path = %req.path,
            "Rate limit exceeded"
        );

        let mut retry_ms = violation.reset_at.saturating_sub(now);
        if let Some(penalty_ms) = self.behavior.on_violation(client, violation.kind) {
            retry_ms = retry_ms.max(penalty_ms);
        }
        let retry = retry_secs(retry_ms);

        let headers = self
            .headers_enabled
            .then(|| RateLimitHeaders::from_result(violation, now));

        Decision::denied(
            429,
            DecisionState::Violated {
                kind: violation.kind,
            },
            "too_many_requests",
            format!("Rate limit exceeded. Try again in {} seconds.", retry),
            Some(retry),
            headers,
        )
    }

    async fn soft_rule_violation(
        &self,
        req: &RequestContext,
        action: RuleAction,
        rule_id: &str,
        rule_name: &str,
        results: &[EvaluatorResult],
        now: u64,
    ) -> Decision {
        let client = req.client_ip.as_str();
        info!(ip = %client, rule = %rule_id, action = ?action, "Custom rule exceeded");
        self.behavior.on_violation(client, EvaluatorKind::Rule);
        self.behavior.on_request_admitted(req, client);

        let mut decision = Decision::admitted(
            DecisionState::RuleAction { action },
            self.ip_headers(results, now),
        );

        match action {
            RuleAction::Delay { ms } => decision.delay = Some(Duration::from_millis(ms)),
            RuleAction::Notify { kind } => {
                self.send_notification(req, kind, rule_id, rule_name).await
            }
            RuleAction::Block => {}
        }

        decision
    }

    async fn send_notification(
        &self,
        req: &RequestContext,
        kind: NotifyKind,
        rule_id: &str,
        rule_name: &str,
    ) {
        self.notifier
            .notify(RuleNotification {
                kind,
                rule_id: rule_id.to_string(),
                rule_name: rule_name.to_string(),
                client_ip: req.client_ip.clone(),
                path: req.path.clone(),
                user_id: req.user_id.clone(),
            })
            .await;
    }

    /// Block `ip` for `duration_ms`, replacing any existing penalty.
    pub fn block_ip(&self, ip: &str, duration_ms: u64) {
        self.penalties.block_for(ip, duration_ms);
        warn!(ip = %ip, blocked_ms = duration_ms, "Client blocked by operator");
    }

    /// Lift every restriction on `ip`: its penalty, its suspicion score and
    /// every window counted against it.
    pub fn unblock_ip(&self, ip: &str) -> UnblockReport {
        let report = UnblockReport {
            penalty_cleared: self.penalties.clear_penalty(ip),
            score_cleared: self.penalties.clear_score(ip),
            windows_removed: self.store.remove_ip(ip),
        };
        info!(
            ip = %ip,
            penalty = report.penalty_cleared,
            score = report.score_cleared,
            windows = report.windows_removed,
            "Client unblocked by operator"
        );
        report
    }

    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            active_window_entries: self.store.live_count(),
            active_penalties: self.penalties.active_penalties(),
            suspicious_client_count: self.penalties.suspicious_clients(),
            top_suspicious_clients: self
                .penalties
                .top_suspicious(self.top_suspicious_limit)
                .into_iter()
                .map(|(client, score)| SuspiciousClient { client, score })
                .collect(),
        }
    }

    /// Start the background sweeper. Must be called inside a tokio runtime.
    pub fn start(&self) -> bool {
        self.sweeper.start()
    }

    /// Stop the background sweeper and wait for it.
    pub async fn stop(&self) {
        self.sweeper.stop().await;
    }

    /// Run one sweep cycle immediately.
    pub fn sweep(&self) -> SweepReport {
        self.sweeper.sweep()
    }

    pub fn penalties(&self) -> &PenaltyEngine {
        &self.penalties
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::geo::GeoError;
    use crate::notify::ChannelNotificationSink;
    use crate::ratelimit::request::Identity;
    use crate::ratelimit::rules::LimitConfig;
    use async_trait::async_trait;

    const BROWSER_UA: &str = "Mozilla/5.0 (X11; Linux x86_64)";

    struct FailingGeo;

    #[async_trait]
    impl GeoResolver for FailingGeo {
        async fn resolve(&self, _ip: &str) -> std::result::Result<Option<String>, GeoError> {
            Err(GeoError("resolver offline".into()))
        }
    }

    fn per_ip(max: u64) -> AdmissionConfig {
        AdmissionConfig {
            per_ip: Some(LimitConfig::new(60_000, max)),
            ..Default::default()
        }
    }

    fn controller(config: AdmissionConfig) -> (Arc<ManualClock>, AdmissionController) {
        let clock = Arc::new(ManualClock::new(0));
        let controller = AdmissionController::builder(config)
            .clock(clock.clone())
            .build()
            .unwrap();
        (clock, controller)
    }

    fn request(ip: &str) -> RequestContext {
        RequestContext::new(ip, "/api/items").with_user_agent(BROWSER_UA)
    }

    #[tokio::test]
    async fn test_fourth_request_denied() {
        let (_clock, controller) = controller(per_ip(3));
        let req = request("9.9.9.9");

        for remaining in [2, 1, 0] {
            let decision = controller.decide(&req).await;
            assert!(decision.admit);
            assert_eq!(decision.state, DecisionState::Admitted);
            assert_eq!(decision.headers.unwrap().remaining, remaining);
        }

        let denied = controller.decide(&req).await;
        assert!(!denied.admit);
        assert_eq!(denied.status, 429);
        assert_eq!(denied.state, DecisionState::Violated { kind: EvaluatorKind::Ip });
        assert_eq!(denied.retry_after_secs, Some(60));
        let body = denied.body.unwrap();
        assert_eq!(body.error, "too_many_requests");
        assert_eq!(body.retry_after, Some(60));
    }

    #[tokio::test]
    async fn test_admitted_headers_come_from_per_ip() {
        let mut config = per_ip(3);
        config.global = Some(LimitConfig::new(1_000, 500));
        let (clock, controller) = controller(config);

        clock.advance(10);
        let decision = controller.decide(&request("1.1.1.1")).await;
        assert_eq!(
            decision.headers,
            Some(RateLimitHeaders {
                limit: 3,
                remaining: 2,
                reset_after_ms: 60_000,
            })
        );
    }

    #[tokio::test]
    async fn test_allowlisted_cidr_always_admits() {
        let mut config = per_ip(1);
        config.allowlist = vec!["10.0.0.0/8".into()];
        let (_clock, controller) = controller(config);

        for _ in 0..5 {
            let decision = controller.decide(&request("10.1.2.3")).await;
            assert!(decision.admit);
            assert!(decision.is_bypass());
        }
        assert_eq!(controller.stats().active_window_entries, 0);
    }

    #[tokio::test]
    async fn test_exempt_roles_and_routes_bypass() {
        let mut config = per_ip(1);
        config.per_ip = Some(LimitConfig::block_all(60_000));
        let (_clock, controller) = controller(config);

        let health = RequestContext::new("2.2.2.2", "/health");
        assert_eq!(
            controller.decide(&health).await.state,
            DecisionState::Bypassed {
                reason: BypassReason::ExemptRoute
            }
        );

        let admin = request("2.2.2.2").with_identity(Identity {
            user_id: "ops".into(),
            role: Some("admin".into()),
        });
        assert_eq!(
            controller.decide(&admin).await.state,
            DecisionState::Bypassed {
                reason: BypassReason::ExemptRole
            }
        );

        assert!(!controller.decide(&request("2.2.2.2")).await.admit);
    }

    #[tokio::test]
    async fn test_blocklist_rejects_with_too_many_requests() {
        let mut config = per_ip(100);
        config.blocklist = vec!["192.0.2.0/24".into()];
        config.allowlist = vec!["192.0.2.10".into()];
        let (_clock, controller) = controller(config);

        let denied = controller.decide(&request("192.0.2.55")).await;
        assert_eq!(denied.status, 429);
        assert_eq!(denied.state, DecisionState::Blocklisted);
        assert_eq!(denied.body.as_ref().unwrap().error, "too_many_requests");
        assert!(denied.retry_after_secs.is_none());

        // Allowlist is checked first
        assert!(controller.decide(&request("192.0.2.10")).await.admit);
    }

    #[tokio::test]
    async fn test_repeated_violations_escalate_to_penalty() {
        let mut config = per_ip(1);
        config.per_ip = Some(LimitConfig::block_all(60_000));
        let (_clock, controller) = controller(config);
        let req = request("6.6.6.6");

        for _ in 0..4 {
            let decision = controller.decide(&req).await;
            assert_eq!(decision.state, DecisionState::Violated { kind: EvaluatorKind::Ip });
        }
        assert_eq!(controller.penalties().score("6.6.6.6"), 60);

        let fifth = controller.decide(&req).await;
        assert_eq!(fifth.state, DecisionState::Penalized);
        assert_eq!(fifth.status, 429);
        assert_eq!(fifth.retry_after_secs, Some(3_600));
    }

    #[tokio::test]
    async fn test_penalty_lapses() {
        let (clock, controller) = controller(per_ip(10));
        controller.block_ip("7.7.7.7", 5_000);

        let denied = controller.decide(&request("7.7.7.7")).await;
        assert_eq!(denied.state, DecisionState::Penalized);
        assert_eq!(denied.retry_after_secs, Some(5));

        clock.advance(5_000);
        assert!(controller.decide(&request("7.7.7.7")).await.admit);
    }

    #[tokio::test]
    async fn test_suspicion_tightens_per_ip_limit() {
        let (_clock, controller) = controller(per_ip(10));
        controller.penalties().add_score("8.8.4.4", 40);

        let decision = controller.decide(&request("8.8.4.4")).await;
        assert_eq!(decision.headers.unwrap().limit, 5);
    }

    #[tokio::test]
    async fn test_global_violation_reported_over_ip() {
        let mut config = per_ip(1);
        config.global = Some(LimitConfig::new(60_000, 1));
        let (_clock, controller) = controller(config);
        let req = request("3.3.3.3");

        assert!(controller.decide(&req).await.admit);
        let denied = controller.decide(&req).await;
        assert_eq!(
            denied.state,
            DecisionState::Violated {
                kind: EvaluatorKind::Global
            }
        );
    }

    #[tokio::test]
    async fn test_geo_fault_fails_open() {
        let mut config = per_ip(100);
        config.per_geo.insert("FR".into(), LimitConfig::block_all(60_000));
        let clock = Arc::new(ManualClock::new(0));
        let controller = AdmissionController::builder(config)
            .clock(clock)
            .geo_resolver(Arc::new(FailingGeo))
            .build()
            .unwrap();

        for _ in 0..3 {
            assert!(controller.decide(&request("81.2.3.4")).await.admit);
        }
    }

    #[tokio::test]
    async fn test_geo_limit_from_static_ranges() {
        let mut config = per_ip(100);
        config.per_geo.insert("FR".into(), LimitConfig::block_all(60_000));
        config.geo_ranges = vec![crate::geo::GeoRange {
            cidr: "81.0.0.0/8".into(),
            country: "fr".into(),
        }];
        let (_clock, controller) = controller(config);

        let denied = controller.decide(&request("81.2.3.4")).await;
        assert_eq!(denied.state, DecisionState::Violated { kind: EvaluatorKind::Geo });
        assert!(controller.decide(&request("8.8.8.8")).await.admit);
    }

    #[tokio::test]
    async fn test_delay_rule_admits_with_delay() {
        let clock = Arc::new(ManualClock::new(0));
        let controller = AdmissionController::builder(per_ip(100))
            .clock(clock)
            .rule(
                CustomRule::new(
                    "uploads",
                    "Upload throttle",
                    |r: &RequestContext| r.path.starts_with("/upload"),
                    LimitConfig::new(60_000, 1),
                )
                .with_action(RuleAction::Delay { ms: 250 }),
            )
            .build()
            .unwrap();

        let req = RequestContext::new("5.5.5.5", "/upload/file").with_user_agent(BROWSER_UA);
        let first = controller.decide(&req).await;
        assert_eq!(first.delay, None);

        let second = controller.decide(&req).await;
        assert!(second.admit);
        assert_eq!(second.delay, Some(Duration::from_millis(250)));
        assert_eq!(
            second.state,
            DecisionState::RuleAction {
                action: RuleAction::Delay { ms: 250 }
            }
        );
        assert_eq!(controller.penalties().score("5.5.5.5"), 25);
    }

    #[tokio::test]
    async fn test_notify_rule_admits_and_notifies() {
        let (sink, mut rx) = ChannelNotificationSink::new();
        let clock = Arc::new(ManualClock::new(0));
        let controller = AdmissionController::builder(per_ip(100))
            .clock(clock)
            .notifier(Arc::new(sink))
            .rule(
                CustomRule::new("scrapers", "Scrapers", |_| true, LimitConfig::block_all(60_000))
                    .with_action(RuleAction::Notify {
                        kind: NotifyKind::Captcha,
                    }),
            )
            .build()
            .unwrap();

        let decision = controller.decide(&request("4.3.2.1")).await;
        assert!(decision.admit);

        let notification = rx.try_recv().unwrap();
        assert_eq!(notification.kind, NotifyKind::Captcha);
        assert_eq!(notification.rule_id, "scrapers");
        assert_eq!(notification.client_ip, "4.3.2.1");
    }

    #[tokio::test]
    async fn test_block_rule_denies() {
        let controller = AdmissionController::builder(per_ip(100))
            .clock(Arc::new(ManualClock::new(0)))
            .rule(CustomRule::new(
                "exports",
                "Export limit",
                |r: &RequestContext| r.path.starts_with("/api"),
                LimitConfig::new(60_000, 1),
            ))
            .build()
            .unwrap();

        assert!(controller.decide(&request("7.7.7.7")).await.admit);

        let denied = controller.decide(&request("7.7.7.7")).await;
        assert!(!denied.admit);
        assert_eq!(denied.status, 429);
        assert_eq!(
            denied.state,
            DecisionState::Violated {
                kind: EvaluatorKind::Rule
            }
        );
        assert_eq!(denied.body.as_ref().unwrap().error, "too_many_requests");
        assert_eq!(denied.retry_after_secs, Some(60));
    }

    #[tokio::test]
    async fn test_warn_rule_admits_and_notifies() {
        let (sink, mut rx) = ChannelNotificationSink::new();
        let controller = AdmissionController::builder(per_ip(100))
            .clock(Arc::new(ManualClock::new(0)))
            .notifier(Arc::new(sink))
            .rule(
                CustomRule::new("bulk", "Bulk readers", |_| true, LimitConfig::new(60_000, 1))
                    .with_action(RuleAction::Notify {
                        kind: NotifyKind::Warn,
                    }),
            )
            .build()
            .unwrap();

        assert!(controller.decide(&request("3.3.3.3")).await.admit);
        assert!(rx.try_recv().is_err());

        let decision = controller.decide(&request("3.3.3.3")).await;
        assert!(decision.admit);
        assert_eq!(decision.status, 200);
        assert_eq!(
            decision.state,
            DecisionState::RuleAction {
                action: RuleAction::Notify {
                    kind: NotifyKind::Warn
                }
            }
        );

        let notification = rx.try_recv().unwrap();
        assert_eq!(notification.kind, NotifyKind::Warn);
        assert_eq!(notification.rule_name, "Bulk readers");
        assert_eq!(notification.client_ip, "3.3.3.3");
    }

    #[tokio::test]
    async fn test_panicking_rule_predicate_admits() {
        let controller = AdmissionController::builder(per_ip(100))
            .clock(Arc::new(ManualClock::new(0)))
            .rule(CustomRule::new(
                "fragile",
                "fragile",
                |r: &RequestContext| r.path.as_bytes()[100] == b'x',
                LimitConfig::block_all(60_000),
            ))
            .build()
            .unwrap();

        let req = RequestContext::new("2.4.6.8", "/short").with_user_agent(BROWSER_UA);
        let decision = controller.decide(&req).await;
        assert!(decision.admit);
        assert_eq!(decision.state, DecisionState::Admitted);
    }

    #[tokio::test]
    async fn test_headers_disabled() {
        let mut config = per_ip(1);
        config.headers_enabled = false;
        let (_clock, controller) = controller(config);

        assert!(controller.decide(&request("1.2.3.4")).await.headers.is_none());
        let denied = controller.decide(&request("1.2.3.4")).await;
        assert!(denied.headers.is_none());
        assert_eq!(denied.retry_after_secs, Some(60));
    }

    #[tokio::test]
    async fn test_unblock_clears_all_client_state() {
        let mut config = per_ip(1);
        config.global = Some(LimitConfig::new(60_000, 100));
        let (_clock, controller) = controller(config);
        let req = request("6.6.6.6");

        controller.decide(&req).await;
        controller.decide(&req).await;
        controller.block_ip("6.6.6.6", 60_000);

        let stats = controller.stats();
        assert_eq!(stats.active_penalties, 1);
        assert_eq!(stats.active_window_entries, 2);
        assert_eq!(
            stats.top_suspicious_clients,
            vec![SuspiciousClient {
                client: "6.6.6.6".into(),
                score: 15
            }]
        );

        let report = controller.unblock_ip("6.6.6.6");
        assert_eq!(
            report,
            UnblockReport {
                penalty_cleared: true,
                score_cleared: true,
                windows_removed: 1,
            }
        );
        assert!(controller.decide(&req).await.admit);
        assert_eq!(controller.stats().suspicious_client_count, 0);
    }

    #[tokio::test]
    async fn test_sweep_decays_scores_to_zero() {
        let (_clock, controller) = controller(per_ip(100));
        controller.penalties().add_score("1.1.1.1", 3);

        for _ in 0..3 {
            controller.sweep();
        }
        assert_eq!(controller.penalties().score("1.1.1.1"), 0);
        assert_eq!(controller.stats().suspicious_client_count, 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = per_ip(0);
        assert!(AdmissionController::new(config).is_err());

        let clock = Arc::new(ManualClock::new(0));
        let dup = AdmissionController::builder(per_ip(5))
            .clock(clock)
            .rule(CustomRule::new("a", "a", |_| true, LimitConfig::new(1_000, 1)))
            .rule(CustomRule::new("a", "a", |_| true, LimitConfig::new(1_000, 1)))
            .build();
        assert!(dup.is_err());
    }

    #[test]
    fn test_decide_from_sync_code() {
        let (_clock, controller) = controller(per_ip(2));
        let decision = tokio_test::block_on(controller.decide(&request("1.1.1.1")));
        assert!(decision.admit);
    }

    #[test]
    fn test_denial_body_shape() {
        let body = DenialBody {
            error: "too_many_requests".into(),
            message: "slow down".into(),
            retry_after: Some(3),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["retryAfter"], 3);

        let bare = DenialBody {
            retry_after: None,
            ..body
        };
        let json = serde_json::to_value(&bare).unwrap();
        assert!(json.get("retryAfter").is_none());
    }
}
