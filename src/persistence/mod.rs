//! Persistence layer: event, subscription, and notification log stores.
//!
//! The worker talks to storage only through the three traits below.
//! [`postgres::PostgresStore`] backs them with `sqlx::PgPool`;
//! [`memory::InMemoryStore`] keeps everything in process.

pub mod memory;
pub mod models;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{Aggregation, Subscription, SubscriptionId, WindowBound};
use crate::error::EngineError;

pub use memory::InMemoryStore;
pub use models::NotificationLog;
pub use postgres::PostgresStore;

/// Filter set for count and aggregate queries.
///
/// Addresses are expected lower-case. `None` filters match everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventQuery {
    /// Event type to match.
    pub event_type: String,
    /// Chain to match.
    pub chain: String,
    /// Emitting contract.
    pub contract_address: Option<String>,
    /// Sender address.
    pub from_address: Option<String>,
    /// Recipient address.
    pub to_address: Option<String>,
    /// Market identifier.
    pub market_id: Option<String>,
    /// Time or block lower bound.
    pub bound: WindowBound,
}

impl EventQuery {
    /// Returns the same filter set for a different event type.
    #[must_use]
    pub fn with_event_type(&self, event_type: &str) -> Self {
        Self {
            event_type: event_type.to_string(),
            ..self.clone()
        }
    }
}

/// Read access to decoded events.
#[async_trait]
pub trait EventStore: Send + Sync + std::fmt::Debug {
    /// Counts events matching `query`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::PersistenceError`] on store failure.
    async fn count_matching(&self, query: &EventQuery) -> Result<u64, EngineError>;

    /// Applies `aggregation` to `data[field]` over events matching `query`.
    /// Returns `0` when nothing matches.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::PersistenceError`] on store failure and
    /// [`EngineError::UnsupportedAggregation`] for [`Aggregation::Count`].
    async fn aggregate(
        &self,
        query: &EventQuery,
        field: &str,
        aggregation: Aggregation,
    ) -> Result<f64, EngineError>;

    /// Returns the highest stored block for `event_type` on `chain`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::PersistenceError`] on store failure.
    async fn max_block(&self, event_type: &str, chain: &str) -> Result<Option<u64>, EngineError>;
}

/// Read access to subscriptions.
#[async_trait]
pub trait SubscriptionStore: Send + Sync + std::fmt::Debug {
    /// Returns every active subscription.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::PersistenceError`] on store failure.
    async fn list_active(&self) -> Result<Vec<Subscription>, EngineError>;
}

/// Audit log of triggered notifications.
#[async_trait]
pub trait NotificationLogStore: Send + Sync + std::fmt::Debug {
    /// Creates a log row and returns its ID.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::PersistenceError`] on store failure.
    async fn create(
        &self,
        subscription_id: SubscriptionId,
        triggered_at: DateTime<Utc>,
        payload: &serde_json::Value,
    ) -> Result<Uuid, EngineError>;

    /// Records the number of delivery attempts made so far.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::PersistenceError`] on store failure.
    async fn update_retry_count(&self, log_id: Uuid, retry_count: u32) -> Result<(), EngineError>;

    /// Records the final HTTP status (`0` when no response was received).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::PersistenceError`] on store failure.
    async fn update_response_status(&self, log_id: Uuid, status: u16) -> Result<(), EngineError>;

    /// Returns `triggered_at` of the subscription's most recent log row.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::PersistenceError`] on store failure.
    async fn last_triggered_at(
        &self,
        subscription_id: SubscriptionId,
    ) -> Result<Option<DateTime<Utc>>, EngineError>;
}
