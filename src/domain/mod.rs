//! Domain layer: subscriptions, meta-event configs, windows, and payloads.
//!
//! Everything here is plain data plus pure functions. Store access lives
//! in [`crate::persistence`] and orchestration in [`crate::service`].

pub mod event;
pub mod meta_event;
pub mod notification;
pub mod subscription;
pub mod window;

pub use event::Event;
pub use meta_event::{
    Aggregation, ComparisonOperator, Condition, ConditionValue, ContractTargets, DEFAULT_CHAIN,
    EventScope, MetaEventConfig, MetaEventKind,
};
pub use notification::{DetectionResult, MetaEventSummary, PendingNotification, WebhookPayload};
pub use subscription::{DEFAULT_COOLDOWN_MINUTES, Subscription, SubscriptionId};
pub use window::{WindowBound, parse_window};
