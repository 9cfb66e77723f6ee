//! Notification sink for non-blocking custom rule actions.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::ratelimit::NotifyKind;

/// A custom rule exceeded its limit with a `captcha` or `warn` action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleNotification {
    pub kind: NotifyKind,
    pub rule_id: String,
    pub rule_name: String,
    pub client_ip: String,
    pub path: String,
    pub user_id: Option<String>,
}

/// Receives rule notifications. Must not block the request path.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: RuleNotification);
}

/// Emits notifications as structured log events.
#[derive(Debug, Default, Clone)]
pub struct TracingNotificationSink;

#[async_trait]
impl NotificationSink for TracingNotificationSink {
    async fn notify(&self, n: RuleNotification) {
        info!(
            target: "gatekeeper::notify",
            kind = n.kind.as_str(),
            rule = %n.rule_id,
            ip = %n.client_ip,
            path = %n.path,
            user = ?n.user_id,
            "Custom rule notification"
        );
    }
}

/// Forwards notifications over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotificationSink {
    tx: mpsc::UnboundedSender<RuleNotification>,
}

impl ChannelNotificationSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RuleNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NotificationSink for ChannelNotificationSink {
    async fn notify(&self, notification: RuleNotification) {
        if self.tx.send(notification).is_err() {
            warn!("Notification receiver dropped");
        }
    }
}
