//! Per-subscription cooldown.
//!
//! A subscription that notified less than `cooldown_minutes` ago is not
//! evaluated at all for the current pass, so no detection query is issued
//! for it until the cooldown has expired.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::domain::Subscription;
use crate::error::EngineError;
use crate::persistence::NotificationLogStore;

/// Result of a cooldown check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownDecision {
    /// The subscription may be evaluated.
    Ready,
    /// The subscription is cooling down.
    CoolingDown {
        /// Time since the last notification.
        elapsed: Duration,
        /// Time left until the cooldown expires.
        remaining: Duration,
    },
}

impl CooldownDecision {
    /// Decides from the last trigger time alone.
    #[must_use]
    pub fn from_last_trigger(
        last_triggered_at: Option<DateTime<Utc>>,
        cooldown: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        match last_triggered_at {
            Some(last) => {
                let elapsed = now - last;
                if elapsed < cooldown {
                    Self::CoolingDown {
                        elapsed,
                        remaining: cooldown - elapsed,
                    }
                } else {
                    Self::Ready
                }
            }
            None => Self::Ready,
        }
    }
}

/// Looks up the most recent notification per subscription and applies
/// its cooldown.
#[derive(Debug, Clone)]
pub struct CooldownGate {
    logs: Arc<dyn NotificationLogStore>,
}

impl CooldownGate {
    /// Creates a gate reading from `logs`.
    #[must_use]
    pub fn new(logs: Arc<dyn NotificationLogStore>) -> Self {
        Self { logs }
    }

    /// Checks whether `subscription` may be evaluated at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::PersistenceError`] if the log lookup fails.
    pub async fn check(
        &self,
        subscription: &Subscription,
        now: DateTime<Utc>,
    ) -> Result<CooldownDecision, EngineError> {
        let last = self.logs.last_triggered_at(subscription.id).await?;
        Ok(CooldownDecision::from_last_trigger(
            last,
            subscription.cooldown(),
            now,
        ))
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::{ComparisonOperator, Condition, ConditionValue, EventScope, MetaEventConfig};
    use crate::persistence::InMemoryStore;

    fn make_subscription(cooldown_minutes: u32) -> Subscription {
        let config = MetaEventConfig::EventCount {
            scope: EventScope::new(
                "erc20_transfer",
                "5m",
                Condition {
                    operator: ComparisonOperator::GreaterThan,
                    value: ConditionValue::Number(10.0),
                },
            ),
        };
        let mut sub = Subscription::new("user", "cooldown", "https://example.com", config);
        sub.cooldown_minutes = cooldown_minutes;
        sub
    }

    #[test]
    fn never_notified_is_ready() {
        let decision = CooldownDecision::from_last_trigger(None, Duration::minutes(5), Utc::now());
        assert_eq!(decision, CooldownDecision::Ready);
    }

    #[test]
    fn boundary_is_ready() {
        let now = Utc::now();
        let decision = CooldownDecision::from_last_trigger(
            Some(now - Duration::minutes(5)),
            Duration::minutes(5),
            now,
        );
        assert_eq!(decision, CooldownDecision::Ready);
    }

    #[tokio::test]
    async fn recent_notification_blocks_evaluation() {
        let store = Arc::new(InMemoryStore::new());
        let sub = make_subscription(5);
        let now = Utc::now();
        let created = store
            .create(sub.id, now - Duration::minutes(2), &serde_json::json!({}))
            .await;
        assert!(created.is_ok());

        let gate = CooldownGate::new(Arc::clone(&store) as Arc<dyn NotificationLogStore>);
        let Ok(decision) = gate.check(&sub, now).await else {
            panic!("check failed");
        };
        assert_eq!(
            decision,
            CooldownDecision::CoolingDown {
                elapsed: Duration::minutes(2),
                remaining: Duration::minutes(3),
            }
        );
    }

    #[tokio::test]
    async fn expired_cooldown_is_ready() {
        let store = Arc::new(InMemoryStore::new());
        let sub = make_subscription(5);
        let now = Utc::now();
        let created = store
            .create(sub.id, now - Duration::minutes(6), &serde_json::json!({}))
            .await;
        assert!(created.is_ok());

        let gate = CooldownGate::new(Arc::clone(&store) as Arc<dyn NotificationLogStore>);
        let decision = gate.check(&sub, now).await;
        assert!(matches!(decision, Ok(CooldownDecision::Ready)));
    }
}
