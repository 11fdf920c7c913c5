//! Meta-event detection.
//!
//! [`MetaEventDetector`] evaluates one subscription's config against the
//! event store. It holds no state between calls and never propagates an
//! error: any failure is logged and reported as "not triggered".

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::domain::{
    Aggregation, ContractTargets, DetectionResult, MetaEventConfig, Subscription, WindowBound,
};
use crate::error::EngineError;
use crate::persistence::{EventQuery, EventStore};

/// Metric computed by one detection query.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Measurement {
    Count(u64),
    Value(f64),
}

impl Measurement {
    #[allow(clippy::cast_precision_loss)]
    fn as_f64(self) -> f64 {
        match self {
            Self::Count(n) => n as f64,
            Self::Value(v) => v,
        }
    }
}

/// Evaluates meta-event configs against the event store.
#[derive(Debug, Clone)]
pub struct MetaEventDetector {
    events: Arc<dyn EventStore>,
}

impl MetaEventDetector {
    /// Creates a detector reading from `events`.
    #[must_use]
    pub fn new(events: Arc<dyn EventStore>) -> Self {
        Self { events }
    }

    /// Runs detection for `subscription` with the window ending now.
    pub async fn detect(&self, subscription: &Subscription) -> DetectionResult {
        self.detect_at(subscription, Utc::now()).await
    }

    /// Runs detection for `subscription` with the window ending at `now`.
    ///
    /// Config and store errors are logged and fail closed.
    pub async fn detect_at(&self, subscription: &Subscription, now: DateTime<Utc>) -> DetectionResult {
        let config = &subscription.meta_event_config;
        match self.try_detect(config, now).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(
                    subscription_id = %subscription.id,
                    config_error = e.is_config_error(),
                    error = %e,
                    "meta-event detection failed"
                );
                DetectionResult::not_triggered(config.scope().window.clone())
            }
        }
    }

    async fn try_detect(
        &self,
        config: &MetaEventConfig,
        now: DateTime<Utc>,
    ) -> Result<DetectionResult, EngineError> {
        let window_minutes = config.validate()?;
        let scope = config.scope();
        let bound = self.resolve_bound(config, window_minutes, now).await?;

        tracing::debug!(
            kind = config.kind().as_str(),
            event_type = %scope.event_type,
            chain = %scope.chain,
            ?bound,
            "running detection query"
        );

        let base = EventQuery {
            event_type: scope.event_type.clone(),
            chain: scope.chain.clone(),
            contract_address: None,
            from_address: scope.from_address.as_deref().map(str::to_lowercase),
            to_address: scope.to_address.as_deref().map(str::to_lowercase),
            market_id: scope.market_id.clone(),
            bound,
        };
        let threshold = scope.condition.value.threshold();

        match scope.contract_targets() {
            ContractTargets::AnyOf(contracts) => {
                for contract in contracts {
                    let query = EventQuery {
                        contract_address: Some(contract.clone()),
                        ..base.clone()
                    };
                    let measurement = self.measure(config, &query).await?;
                    if scope.condition.is_met(measurement.as_f64()) {
                        tracing::debug!(%contract, "contract satisfied condition");
                        let mut result = triggered_result(&scope.window, measurement, threshold);
                        result.triggered_by_contract = Some(contract);
                        return Ok(result);
                    }
                }
                Ok(DetectionResult::not_triggered(scope.window.clone()))
            }
            targets => {
                let query = EventQuery {
                    contract_address: match targets {
                        ContractTargets::Single(contract) => Some(contract),
                        _ => None,
                    },
                    ..base
                };
                let measurement = self.measure(config, &query).await?;
                tracing::debug!(value = measurement.as_f64(), "detection query result");

                let mut result = triggered_result(&scope.window, measurement, threshold);
                result.triggered = scope.condition.is_met(measurement.as_f64());
                Ok(result)
            }
        }
    }

    /// Resolves the lower bound: block lookback when configured, otherwise
    /// the trailing time window.
    async fn resolve_bound(
        &self,
        config: &MetaEventConfig,
        window_minutes: u64,
        now: DateTime<Utc>,
    ) -> Result<WindowBound, EngineError> {
        let scope = config.scope();
        let Some(lookback) = scope.lookback_blocks else {
            return Ok(WindowBound::trailing_minutes(now, window_minutes));
        };

        let mut max_block = 0;
        for event_type in config.window_event_types() {
            if let Some(block) = self.events.max_block(event_type, &scope.chain).await? {
                max_block = max_block.max(block);
            }
        }
        Ok(WindowBound::trailing_blocks(max_block, lookback))
    }

    async fn measure(
        &self,
        config: &MetaEventConfig,
        query: &EventQuery,
    ) -> Result<Measurement, EngineError> {
        match config {
            MetaEventConfig::EventCount { .. } => {
                Ok(Measurement::Count(self.events.count_matching(query).await?))
            }
            MetaEventConfig::RollingAggregate {
                field, aggregation, ..
            } => Ok(Measurement::Value(
                self.aggregate(query, field, *aggregation).await?,
            )),
            MetaEventConfig::NetAggregate {
                field,
                aggregation,
                positive_event_type,
                negative_event_type,
                ..
            } => {
                let positive = self
                    .aggregate(&query.with_event_type(positive_event_type), field, *aggregation)
                    .await?;
                let negative = self
                    .aggregate(&query.with_event_type(negative_event_type), field, *aggregation)
                    .await?;
                Ok(Measurement::Value(positive - negative))
            }
        }
    }

    async fn aggregate(
        &self,
        query: &EventQuery,
        field: &str,
        aggregation: Aggregation,
    ) -> Result<f64, EngineError> {
        if aggregation == Aggregation::Count {
            return Err(EngineError::UnsupportedAggregation(aggregation));
        }
        self.events.aggregate(query, field, aggregation).await
    }
}

fn triggered_result(window: &str, measurement: Measurement, threshold: f64) -> DetectionResult {
    let (event_count, aggregated_value) = match measurement {
        Measurement::Count(n) => (Some(n), None),
        Measurement::Value(v) => (None, Some(v)),
    };
    DetectionResult {
        triggered: true,
        window: window.to_string(),
        event_count,
        aggregated_value,
        threshold: Some(threshold),
        triggered_by_contract: None,
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Duration;

    use super::*;
    use crate::domain::{ComparisonOperator, Condition, ConditionValue, Event, EventScope};
    use crate::persistence::InMemoryStore;

    fn condition(operator: ComparisonOperator, value: f64) -> Condition {
        Condition {
            operator,
            value: ConditionValue::Number(value),
        }
    }

    fn event(
        event_type: &str,
        contract: &str,
        block: u64,
        minutes_ago: i64,
        amount: f64,
        seq: u32,
    ) -> Event {
        let mut data = BTreeMap::new();
        data.insert("assets".to_string(), serde_json::json!(amount.to_string()));
        Event {
            chain: "ethereum".to_string(),
            block_number: block,
            timestamp: Utc::now() - Duration::minutes(minutes_ago),
            event_type: event_type.to_string(),
            contract_address: contract.to_string(),
            from_address: None,
            to_address: None,
            market_id: Some("0xmarket".to_string()),
            data,
            transaction_hash: format!("0x{event_type}{contract}{seq}"),
            log_index: seq,
        }
    }

    async fn seed_transfers(store: &InMemoryStore, contract: &str, count: u32) {
        for seq in 0..count {
            store
                .insert_event(event("erc20_transfer", contract, 100, 1, 1.0, seq))
                .await;
        }
    }

    fn subscription(config: MetaEventConfig) -> Subscription {
        Subscription::new("user", "test", "https://example.com/hook", config)
    }

    fn detector(store: &Arc<InMemoryStore>) -> MetaEventDetector {
        MetaEventDetector::new(Arc::clone(store) as Arc<dyn EventStore>)
    }

    #[tokio::test]
    async fn event_count_triggers_above_threshold() {
        let store = Arc::new(InMemoryStore::new());
        seed_transfers(&store, "0xaaa", 12).await;
        store
            .insert_event(event("erc20_transfer", "0xaaa", 90, 30, 1.0, 99))
            .await;

        let mut scope = EventScope::new("erc20_transfer", "5m", condition(ComparisonOperator::GreaterThan, 10.0));
        scope.contract_address = Some("0xAAA".to_string());
        let sub = subscription(MetaEventConfig::EventCount { scope });

        let result = detector(&store).detect(&sub).await;
        assert!(result.triggered);
        assert_eq!(result.event_count, Some(12));
        assert_eq!(result.threshold, Some(10.0));
        assert_eq!(result.window, "5m");
        assert!(result.triggered_by_contract.is_none());
    }

    #[tokio::test]
    async fn event_count_below_threshold_reports_metric() {
        let store = Arc::new(InMemoryStore::new());
        seed_transfers(&store, "0xaaa", 3).await;

        let scope = EventScope::new("erc20_transfer", "5m", condition(ComparisonOperator::GreaterThan, 10.0));
        let result = detector(&store)
            .detect(&subscription(MetaEventConfig::EventCount { scope }))
            .await;
        assert!(!result.triggered);
        assert_eq!(result.event_count, Some(3));
    }

    #[tokio::test]
    async fn multi_contract_short_circuits_on_first_match() {
        let store = Arc::new(InMemoryStore::new());
        seed_transfers(&store, "0xa", 3).await;
        seed_transfers(&store, "0xb", 15).await;
        seed_transfers(&store, "0xc", 20).await;

        let mut scope = EventScope::new("erc20_transfer", "5m", condition(ComparisonOperator::GreaterThan, 10.0));
        scope.contracts = Some(vec!["0xA".to_string(), "0xB".to_string(), "0xC".to_string()]);
        let sub = subscription(MetaEventConfig::EventCount { scope });

        let result = detector(&store).detect(&sub).await;
        assert!(result.triggered);
        assert_eq!(result.triggered_by_contract.as_deref(), Some("0xb"));
        assert_eq!(result.event_count, Some(15));
        assert_eq!(store.event_query_count(), 2);
    }

    #[tokio::test]
    async fn multi_contract_without_match_has_no_attribution() {
        let store = Arc::new(InMemoryStore::new());
        seed_transfers(&store, "0xa", 1).await;

        let mut scope = EventScope::new("erc20_transfer", "5m", condition(ComparisonOperator::GreaterThan, 10.0));
        scope.contracts = Some(vec!["0xa".to_string(), "0xb".to_string()]);
        let result = detector(&store)
            .detect(&subscription(MetaEventConfig::EventCount { scope }))
            .await;

        assert!(!result.triggered);
        assert!(result.triggered_by_contract.is_none());
        assert_eq!(store.event_query_count(), 2);
    }

    #[tokio::test]
    async fn net_aggregate_detects_outflow() {
        let store = Arc::new(InMemoryStore::new());
        store
            .insert_event(event("morpho_supply", "0xmorpho", 10, 5, 1_000_000.0, 0))
            .await;
        store
            .insert_event(event("morpho_withdraw", "0xmorpho", 10, 5, 1_000_000.0, 1))
            .await;
        store
            .insert_event(event("morpho_withdraw", "0xmorpho", 11, 4, 800_000.0, 2))
            .await;

        let mut scope = EventScope::new("morpho_supply", "1h", condition(ComparisonOperator::LessThan, -500_000.0));
        scope.market_id = Some("0xmarket".to_string());
        let sub = subscription(MetaEventConfig::NetAggregate {
            scope,
            field: "assets".to_string(),
            aggregation: Aggregation::Sum,
            positive_event_type: "morpho_supply".to_string(),
            negative_event_type: "morpho_withdraw".to_string(),
        });

        let result = detector(&store).detect(&sub).await;
        assert!(result.triggered);
        assert_eq!(result.aggregated_value, Some(-800_000.0));
        assert_eq!(result.threshold, Some(-500_000.0));
    }

    #[tokio::test]
    async fn rolling_aggregate_compares_average() {
        let store = Arc::new(InMemoryStore::new());
        for (seq, amount) in [100.0, 300.0].into_iter().enumerate() {
            let seq = u32::try_from(seq).unwrap_or_default();
            store
                .insert_event(event("erc4626_deposit", "0xvault", 5, 1, amount, seq))
                .await;
        }

        let scope = EventScope::new("erc4626_deposit", "15m", condition(ComparisonOperator::GreaterOrEqual, 200.0));
        let sub = subscription(MetaEventConfig::RollingAggregate {
            scope,
            field: "assets".to_string(),
            aggregation: Aggregation::Avg,
        });

        let result = detector(&store).detect(&sub).await;
        assert!(result.triggered);
        assert_eq!(result.aggregated_value, Some(200.0));
        assert!(result.event_count.is_none());
    }

    #[tokio::test]
    async fn lookback_blocks_overrides_time_window() {
        let store = Arc::new(InMemoryStore::new());
        // Old by time, recent by block.
        for seq in 0..3 {
            store
                .insert_event(event("erc20_transfer", "0xaaa", 1_000, 600, 1.0, seq))
                .await;
        }
        store
            .insert_event(event("erc20_transfer", "0xaaa", 500, 0, 1.0, 10))
            .await;

        let mut scope = EventScope::new("erc20_transfer", "5m", condition(ComparisonOperator::Equal, 3.0));
        scope.lookback_blocks = Some(100);
        let result = detector(&store)
            .detect(&subscription(MetaEventConfig::EventCount { scope }))
            .await;

        assert!(result.triggered);
        assert_eq!(result.event_count, Some(3));
    }

    #[tokio::test]
    async fn net_lookback_shares_one_cutoff_and_lowercases_sender() {
        let store = Arc::new(InMemoryStore::new());
        let rows = [
            ("morpho_supply", 1_000, 10.0, "0xabc"),
            ("morpho_withdraw", 950, 50.0, "0xabc"),
            // Inside a cut-off computed from the withdraw max alone (850).
            ("morpho_withdraw", 850, 1_000.0, "0xabc"),
            ("morpho_withdraw", 960, 500.0, "0xdef"),
        ];
        for (seq, (event_type, block, amount, from)) in (0u32..).zip(rows) {
            let mut row = event(event_type, "0xmorpho", block, 0, amount, seq);
            row.from_address = Some(from.to_string());
            store.insert_event(row).await;
        }

        let mut scope = EventScope::new("morpho_supply", "1h", condition(ComparisonOperator::LessThan, -30.0));
        scope.lookback_blocks = Some(100);
        scope.from_address = Some("0xABC".to_string());
        let sub = subscription(MetaEventConfig::NetAggregate {
            scope,
            field: "assets".to_string(),
            aggregation: Aggregation::Sum,
            positive_event_type: "morpho_supply".to_string(),
            negative_event_type: "morpho_withdraw".to_string(),
        });

        let result = detector(&store).detect(&sub).await;
        assert!(result.triggered);
        assert_eq!(result.aggregated_value, Some(-40.0));
    }

    #[tokio::test]
    async fn invalid_window_fails_closed_without_querying() {
        let store = Arc::new(InMemoryStore::new());
        seed_transfers(&store, "0xaaa", 50).await;

        let scope = EventScope::new("erc20_transfer", "5 minutes", condition(ComparisonOperator::GreaterThan, 1.0));
        let result = detector(&store)
            .detect(&subscription(MetaEventConfig::EventCount { scope }))
            .await;

        assert!(!result.triggered);
        assert_eq!(result.window, "5 minutes");
        assert_eq!(store.event_query_count(), 0);
    }

    #[tokio::test]
    async fn count_aggregation_fails_closed() {
        let store = Arc::new(InMemoryStore::new());
        seed_transfers(&store, "0xaaa", 5).await;

        let scope = EventScope::new("erc20_transfer", "5m", condition(ComparisonOperator::GreaterThan, 1.0));
        let sub = subscription(MetaEventConfig::RollingAggregate {
            scope,
            field: "assets".to_string(),
            aggregation: Aggregation::Count,
        });

        let result = detector(&store).detect(&sub).await;
        assert!(!result.triggered);
    }
}
