//! Gatekeeper - Adaptive Admission Control
//!
//! This crate decides, per inbound HTTP request, whether to admit, delay or
//! reject it. Limits are counted in fixed windows along several independent
//! dimensions (global, per-IP, per-user, per-country and custom rules), and
//! clients that keep violating them accumulate a suspicion score that first
//! tightens their limits and then blocks them outright for a while.

pub mod clock;
pub mod config;
pub mod error;
pub mod geo;
pub mod http;
pub mod notify;
pub mod ratelimit;
