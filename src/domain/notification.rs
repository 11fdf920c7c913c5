//! Webhook payloads and pending notifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{MetaEventKind, SubscriptionId};

/// Outcome of one detection.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DetectionResult {
    /// Whether the condition was met.
    pub triggered: bool,
    /// Window string from the config, echoed back.
    pub window: String,
    /// Event count, for `event_count` detections.
    pub event_count: Option<u64>,
    /// Aggregate or net value, for the aggregate detections.
    pub aggregated_value: Option<f64>,
    /// Numeric threshold the metric was compared against.
    pub threshold: Option<f64>,
    /// Contract that satisfied a multi-contract condition.
    pub triggered_by_contract: Option<String>,
}

impl DetectionResult {
    /// A non-triggered result carrying only the window.
    #[must_use]
    pub fn not_triggered(window: impl Into<String>) -> Self {
        Self {
            window: window.into(),
            ..Self::default()
        }
    }
}

/// `meta_event` section of a webhook payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaEventSummary {
    /// Detection kind.
    #[serde(rename = "type")]
    pub kind: MetaEventKind,
    /// Always `true` in delivered payloads.
    pub condition_met: bool,
    /// Aggregate or net value, for aggregate detections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregated_value: Option<f64>,
    /// Matched event count, for `event_count` detections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_count: Option<u64>,
    /// Threshold compared against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    /// Window string from the config.
    pub window: String,
    /// Contract that satisfied a multi-contract condition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by_contract: Option<String>,
}

/// JSON body POSTed to a subscriber's webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    /// Subscription that fired.
    pub subscription_id: SubscriptionId,
    /// Subscription name.
    pub subscription_name: String,
    /// Detection time, ISO-8601.
    pub triggered_at: DateTime<Utc>,
    /// What fired.
    pub meta_event: MetaEventSummary,
}

impl WebhookPayload {
    /// Renders the payload for a triggered detection.
    #[must_use]
    pub fn from_detection(
        subscription_id: SubscriptionId,
        subscription_name: impl Into<String>,
        kind: MetaEventKind,
        result: &DetectionResult,
        triggered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            subscription_id,
            subscription_name: subscription_name.into(),
            triggered_at,
            meta_event: MetaEventSummary {
                kind,
                condition_met: true,
                aggregated_value: result.aggregated_value,
                event_count: result.event_count,
                threshold: result.threshold,
                window: result.window.clone(),
                triggered_by_contract: result.triggered_by_contract.clone(),
            },
        }
    }
}

/// A triggered detection waiting for delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingNotification {
    /// Subscription that fired.
    pub subscription_id: SubscriptionId,
    /// Delivery target.
    pub webhook_url: String,
    /// Rendered payload.
    pub payload: WebhookPayload,
}
