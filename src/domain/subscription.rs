//! Subscriptions and their identifiers.
//!
//! Subscriptions are created and edited by the subscription-management
//! service. The worker only ever reads the active set.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::MetaEventConfig;

/// Cooldown applied when a subscription does not set one.
pub const DEFAULT_COOLDOWN_MINUTES: u32 = 1;

fn default_cooldown_minutes() -> u32 {
    DEFAULT_COOLDOWN_MINUTES
}

/// Unique identifier for a subscription.
///
/// Wraps a UUID so subscription identifiers cannot be confused with
/// notification log IDs or other UUIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(uuid::Uuid);

impl SubscriptionId {
    /// Creates a new random `SubscriptionId` (UUID v4).
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Creates a `SubscriptionId` from an existing [`uuid::Uuid`].
    #[must_use]
    pub const fn from_uuid(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }

}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<uuid::Uuid> for SubscriptionId {
    fn from(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }
}

impl From<SubscriptionId> for uuid::Uuid {
    fn from(id: SubscriptionId) -> Self {
        id.0
    }
}

/// A user's standing request to be notified when a meta-event fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    /// Subscription identifier.
    pub id: SubscriptionId,
    /// Owning user.
    pub user_id: String,
    /// Human-readable name, echoed in webhook payloads.
    pub name: String,
    /// Delivery target.
    pub webhook_url: String,
    /// Detection definition.
    pub meta_event_config: MetaEventConfig,
    /// Minimum minutes between notifications.
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: u32,
    /// Only active subscriptions are evaluated.
    pub is_active: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Creates an active subscription with the default cooldown.
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        name: impl Into<String>,
        webhook_url: impl Into<String>,
        meta_event_config: MetaEventConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: SubscriptionId::new(),
            user_id: user_id.into(),
            name: name.into(),
            webhook_url: webhook_url.into(),
            meta_event_config,
            cooldown_minutes: DEFAULT_COOLDOWN_MINUTES,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the cooldown as a duration.
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::minutes(i64::from(self.cooldown_minutes))
    }
}
