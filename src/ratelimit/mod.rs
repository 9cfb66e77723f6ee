//! Admission control: limit evaluation, penalties and state management.

pub mod access;
pub mod admission;
pub mod behavior;
pub mod counter;
pub mod descriptor;
pub mod evaluator;
pub mod penalty;
pub mod request;
pub mod rules;
pub mod sweeper;

pub use admission::{
    AdmissionController, AdmissionControllerBuilder, AdmissionStats, BypassReason, Decision,
    DecisionState, DenialBody, RateLimitHeaders, SuspiciousClient, UnblockReport,
};
pub use counter::{WindowCounterStore, WindowEntry, WindowOutcome};
pub use descriptor::LimitKey;
pub use evaluator::{EvaluatorKind, EvaluatorResult};
pub use penalty::PenaltyEngine;
pub use request::{resolve_client_ip, Identity, RequestContext, UNKNOWN_IP};
pub use rules::{CustomRule, CustomRuleConfig, LimitConfig, NotifyKind, RuleAction, RuleMatch};
pub use sweeper::{SweepReport, Sweeper};
