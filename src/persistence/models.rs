//! Database models for the notification audit log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::SubscriptionId;

/// A row from the `notifications_log` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationLog {
    /// Row ID.
    pub id: Uuid,
    /// Subscription that fired.
    pub subscription_id: SubscriptionId,
    /// Detection time; the only input to cooldown.
    pub triggered_at: DateTime<Utc>,
    /// Full webhook payload as JSONB.
    pub payload: serde_json::Value,
    /// Last HTTP status, `0` if no response was ever received, `None`
    /// while delivery is still in progress.
    pub webhook_response_status: Option<u16>,
    /// Delivery attempts made.
    pub retry_count: u32,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
}
