//! PostgreSQL implementation of the stores.
//!
//! Expected tables (owned by the ingestion and subscription services):
//! `events`, `subscriptions`, `notifications_log`. Event addresses are
//! stored lower-case and `data` is JSONB with numeric values encoded as
//! numbers or decimal strings.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use super::{EventQuery, EventStore, NotificationLogStore, SubscriptionStore};
use crate::domain::{
    Aggregation, DEFAULT_COOLDOWN_MINUTES, MetaEventConfig, Subscription, SubscriptionId,
    WindowBound,
};
use crate::error::EngineError;

type SubscriptionRow = (
    Uuid,
    String,
    String,
    String,
    serde_json::Value,
    Option<i32>,
    bool,
    DateTime<Utc>,
    DateTime<Utc>,
);

/// PostgreSQL-backed store using `sqlx::PgPool`.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a store over the given connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Round-trips `SELECT NOW()` to prove connectivity.
    ///
    /// # Errors
    ///
    /// Returns a [`EngineError::PersistenceError`] when the database is
    /// unreachable.
    pub async fn ping(&self) -> Result<DateTime<Utc>, EngineError> {
        let now = sqlx::query_scalar::<_, DateTime<Utc>>("SELECT NOW()")
            .fetch_one(&self.pool)
            .await?;
        Ok(now)
    }
}

fn sql_function(aggregation: Aggregation) -> Result<&'static str, EngineError> {
    match aggregation {
        Aggregation::Sum => Ok("SUM"),
        Aggregation::Avg => Ok("AVG"),
        Aggregation::Min => Ok("MIN"),
        Aggregation::Max => Ok("MAX"),
        Aggregation::Count => Err(EngineError::UnsupportedAggregation(aggregation)),
    }
}

fn to_db_block(block: u64) -> i64 {
    i64::try_from(block).unwrap_or(i64::MAX)
}

fn push_filters(qb: &mut QueryBuilder<'static, Postgres>, query: &EventQuery) {
    qb.push(" WHERE event_type = ")
        .push_bind(query.event_type.clone());
    qb.push(" AND chain = ").push_bind(query.chain.clone());

    match query.bound {
        WindowBound::Since(since) => {
            qb.push(" AND timestamp >= ").push_bind(since);
        }
        WindowBound::FromBlock(block) => {
            qb.push(" AND block_number >= ").push_bind(to_db_block(block));
        }
    }

    if let Some(contract) = &query.contract_address {
        qb.push(" AND contract_address = ").push_bind(contract.clone());
    }
    if let Some(from) = &query.from_address {
        qb.push(" AND from_address = ").push_bind(from.clone());
    }
    if let Some(to) = &query.to_address {
        qb.push(" AND to_address = ").push_bind(to.clone());
    }
    if let Some(market) = &query.market_id {
        qb.push(" AND market_id = ").push_bind(market.clone());
    }
}

fn count_query(query: &EventQuery) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new("SELECT COUNT(*) FROM events");
    push_filters(&mut qb, query);
    qb
}

fn aggregate_query(
    query: &EventQuery,
    field: &str,
    aggregation: Aggregation,
) -> Result<QueryBuilder<'static, Postgres>, EngineError> {
    let mut qb = QueryBuilder::new("SELECT ");
    qb.push(sql_function(aggregation)?)
        .push("((data->>")
        .push_bind(field.to_string())
        .push(")::numeric)::float8 FROM events");
    push_filters(&mut qb, query);
    Ok(qb)
}

fn subscription_from_row(row: SubscriptionRow) -> Result<Subscription, EngineError> {
    let (id, user_id, name, webhook_url, config, cooldown, is_active, created_at, updated_at) = row;
    let meta_event_config: MetaEventConfig = serde_json::from_value(config)
        .map_err(|e| EngineError::InvalidConfig(format!("subscription {id}: {e}")))?;
    let cooldown_minutes = cooldown
        .and_then(|m| u32::try_from(m).ok())
        .unwrap_or(DEFAULT_COOLDOWN_MINUTES);

    Ok(Subscription {
        id: SubscriptionId::from_uuid(id),
        user_id,
        name,
        webhook_url,
        meta_event_config,
        cooldown_minutes,
        is_active,
        created_at,
        updated_at,
    })
}

#[async_trait]
impl EventStore for PostgresStore {
    async fn count_matching(&self, query: &EventQuery) -> Result<u64, EngineError> {
        let mut qb = count_query(query);
        let count = qb.build_query_scalar::<i64>().fetch_one(&self.pool).await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn aggregate(
        &self,
        query: &EventQuery,
        field: &str,
        aggregation: Aggregation,
    ) -> Result<f64, EngineError> {
        let mut qb = aggregate_query(query, field, aggregation)?;
        let value = qb
            .build_query_scalar::<Option<f64>>()
            .fetch_one(&self.pool)
            .await?;
        Ok(value.unwrap_or(0.0))
    }

    async fn max_block(&self, event_type: &str, chain: &str) -> Result<Option<u64>, EngineError> {
        let block = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT MAX(block_number) FROM events WHERE event_type = $1 AND chain = $2",
        )
        .bind(event_type)
        .bind(chain)
        .fetch_one(&self.pool)
        .await?;

        Ok(block.and_then(|b| u64::try_from(b).ok()))
    }
}

#[async_trait]
impl SubscriptionStore for PostgresStore {
    async fn list_active(&self) -> Result<Vec<Subscription>, EngineError> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(
            "SELECT id, user_id, name, webhook_url, meta_event_config, cooldown_minutes, \
             is_active, created_at, updated_at FROM subscriptions WHERE is_active = TRUE",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut subscriptions = Vec::with_capacity(rows.len());
        for row in rows {
            match subscription_from_row(row) {
                Ok(sub) => subscriptions.push(sub),
                Err(e) => tracing::error!(error = %e, "skipping subscription with unreadable config"),
            }
        }
        Ok(subscriptions)
    }
}

#[async_trait]
impl NotificationLogStore for PostgresStore {
    async fn create(
        &self,
        subscription_id: SubscriptionId,
        triggered_at: DateTime<Utc>,
        payload: &serde_json::Value,
    ) -> Result<Uuid, EngineError> {
        let id = sqlx::query_scalar::<_, Uuid>(
            "INSERT INTO notifications_log (subscription_id, triggered_at, payload) \
             VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(Uuid::from(subscription_id))
        .bind(triggered_at)
        .bind(payload)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn update_retry_count(&self, log_id: Uuid, retry_count: u32) -> Result<(), EngineError> {
        sqlx::query("UPDATE notifications_log SET retry_count = $1 WHERE id = $2")
            .bind(i32::try_from(retry_count).unwrap_or(i32::MAX))
            .bind(log_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_response_status(&self, log_id: Uuid, status: u16) -> Result<(), EngineError> {
        sqlx::query("UPDATE notifications_log SET webhook_response_status = $1 WHERE id = $2")
            .bind(i32::from(status))
            .bind(log_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn last_triggered_at(
        &self,
        subscription_id: SubscriptionId,
    ) -> Result<Option<DateTime<Utc>>, EngineError> {
        let last = sqlx::query_scalar::<_, DateTime<Utc>>(
            "SELECT triggered_at FROM notifications_log WHERE subscription_id = $1 \
             ORDER BY triggered_at DESC LIMIT 1",
        )
        .bind(Uuid::from(subscription_id))
        .fetch_optional(&self.pool)
        .await?;

        Ok(last)
    }
}
