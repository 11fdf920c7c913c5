//! In-process store implementing every persistence trait.
//!
//! [`InMemoryStore`] keeps events, subscriptions, and notification logs in
//! [`tokio::sync::RwLock`]-guarded vectors. Readers take a snapshot under
//! the read lock, so concurrent appends become visible on the next query.
//! Used by the test-suite and for running the worker without a database.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{EventQuery, EventStore, NotificationLog, NotificationLogStore, SubscriptionStore};
use crate::domain::{Aggregation, Event, Subscription, SubscriptionId, WindowBound};
use crate::error::EngineError;

/// Lock-protected in-memory store.
///
/// Every [`EventStore`] call increments a query counter, which lets
/// callers verify when detection was skipped entirely.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    events: RwLock<Vec<Event>>,
    event_keys: RwLock<HashSet<(String, String, u32)>>,
    subscriptions: RwLock<Vec<Subscription>>,
    logs: RwLock<Vec<NotificationLog>>,
    event_queries: AtomicUsize,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an event unless one with the same
    /// `(chain, transaction_hash, log_index)` already exists.
    ///
    /// Returns `true` when the event was inserted.
    pub async fn insert_event(&self, event: Event) -> bool {
        let (chain, transaction_hash, log_index) = event.key();
        let key = (chain.to_string(), transaction_hash.to_string(), log_index);
        let mut keys = self.event_keys.write().await;
        if !keys.insert(key) {
            return false;
        }
        self.events.write().await.push(event);
        true
    }

    /// Inserts a batch of events with insert-or-ignore semantics and
    /// returns how many were new.
    pub async fn insert_events(&self, events: impl IntoIterator<Item = Event>) -> usize {
        let mut inserted = 0;
        for event in events {
            if self.insert_event(event).await {
                inserted += 1;
            }
        }
        inserted
    }

    /// Adds or replaces a subscription.
    pub async fn upsert_subscription(&self, subscription: Subscription) {
        let mut subs = self.subscriptions.write().await;
        if let Some(existing) = subs.iter_mut().find(|s| s.id == subscription.id) {
            *existing = subscription;
        } else {
            subs.push(subscription);
        }
    }

    /// Returns a snapshot of all notification log rows.
    pub async fn notification_logs(&self) -> Vec<NotificationLog> {
        self.logs.read().await.clone()
    }

    /// Returns the number of event queries served so far.
    #[must_use]
    pub fn event_query_count(&self) -> usize {
        self.event_queries.load(Ordering::SeqCst)
    }

    async fn matching_events(&self, query: &EventQuery) -> Vec<Event> {
        self.event_queries.fetch_add(1, Ordering::SeqCst);
        self.events
            .read()
            .await
            .iter()
            .filter(|event| matches_query(event, query))
            .cloned()
            .collect()
    }

    async fn update_log<F>(&self, log_id: Uuid, apply: F) -> Result<(), EngineError>
    where
        F: FnOnce(&mut NotificationLog),
    {
        let mut logs = self.logs.write().await;
        let log = logs
            .iter_mut()
            .find(|l| l.id == log_id)
            .ok_or_else(|| EngineError::PersistenceError(format!("notification log {log_id} not found")))?;
        apply(log);
        Ok(())
    }
}

fn matches_optional(filter: Option<&String>, value: Option<&String>) -> bool {
    match filter {
        Some(expected) => value == Some(expected),
        None => true,
    }
}

fn matches_query(event: &Event, query: &EventQuery) -> bool {
    let in_window = match query.bound {
        WindowBound::Since(since) => event.timestamp >= since,
        WindowBound::FromBlock(block) => event.block_number >= block,
    };

    in_window
        && event.event_type == query.event_type
        && event.chain == query.chain
        && matches_optional(query.contract_address.as_ref(), Some(&event.contract_address))
        && matches_optional(query.from_address.as_ref(), event.from_address.as_ref())
        && matches_optional(query.to_address.as_ref(), event.to_address.as_ref())
        && matches_optional(query.market_id.as_ref(), event.market_id.as_ref())
}

#[allow(clippy::cast_precision_loss)]
fn apply_aggregation(values: &[f64], aggregation: Aggregation) -> Result<f64, EngineError> {
    if values.is_empty() {
        return Ok(0.0);
    }
    let value = match aggregation {
        Aggregation::Sum => values.iter().sum(),
        Aggregation::Avg => values.iter().sum::<f64>() / values.len() as f64,
        Aggregation::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        Aggregation::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        Aggregation::Count => return Err(EngineError::UnsupportedAggregation(aggregation)),
    };
    Ok(value)
}

#[async_trait]
impl EventStore for InMemoryStore {
    async fn count_matching(&self, query: &EventQuery) -> Result<u64, EngineError> {
        let matched = self.matching_events(query).await;
        Ok(u64::try_from(matched.len()).unwrap_or(u64::MAX))
    }

    async fn aggregate(
        &self,
        query: &EventQuery,
        field: &str,
        aggregation: Aggregation,
    ) -> Result<f64, EngineError> {
        let values: Vec<f64> = self
            .matching_events(query)
            .await
            .iter()
            .filter_map(|event| event.numeric_field(field))
            .collect();
        apply_aggregation(&values, aggregation)
    }

    async fn max_block(&self, event_type: &str, chain: &str) -> Result<Option<u64>, EngineError> {
        self.event_queries.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .events
            .read()
            .await
            .iter()
            .filter(|e| e.event_type == event_type && e.chain == chain)
            .map(|e| e.block_number)
            .max())
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryStore {
    async fn list_active(&self) -> Result<Vec<Subscription>, EngineError> {
        Ok(self
            .subscriptions
            .read()
            .await
            .iter()
            .filter(|s| s.is_active)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl NotificationLogStore for InMemoryStore {
    async fn create(
        &self,
        subscription_id: SubscriptionId,
        triggered_at: DateTime<Utc>,
        payload: &serde_json::Value,
    ) -> Result<Uuid, EngineError> {
        let id = Uuid::new_v4();
        self.logs.write().await.push(NotificationLog {
            id,
            subscription_id,
            triggered_at,
            payload: payload.clone(),
            webhook_response_status: None,
            retry_count: 0,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn update_retry_count(&self, log_id: Uuid, retry_count: u32) -> Result<(), EngineError> {
        self.update_log(log_id, |log| log.retry_count = retry_count)
            .await
    }

    async fn update_response_status(&self, log_id: Uuid, status: u16) -> Result<(), EngineError> {
        self.update_log(log_id, |log| log.webhook_response_status = Some(status))
            .await
    }

    async fn last_triggered_at(
        &self,
        subscription_id: SubscriptionId,
    ) -> Result<Option<DateTime<Utc>>, EngineError> {
        Ok(self
            .logs
            .read()
            .await
            .iter()
            .filter(|l| l.subscription_id == subscription_id)
            .map(|l| l.triggered_at)
            .max())
    }
}
