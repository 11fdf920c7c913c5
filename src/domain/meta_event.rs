//! Meta-event configuration.
//!
//! [`MetaEventConfig`] is a tagged union over the three detection kinds.
//! Each variant carries the shared [`EventScope`] plus only the fields its
//! algorithm needs, so a deserialised config can never be missing the
//! inputs for its own detection path.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::window::parse_window;
use crate::error::EngineError;

/// Chain assumed when a config omits `chain`.
pub const DEFAULT_CHAIN: &str = "ethereum";

fn default_chain() -> String {
    DEFAULT_CHAIN.to_string()
}

/// Comparison applied between a computed metric and the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOperator {
    /// `actual > threshold`
    #[serde(rename = ">")]
    GreaterThan,
    /// `actual < threshold`
    #[serde(rename = "<")]
    LessThan,
    /// `actual >= threshold`
    #[serde(rename = ">=")]
    GreaterOrEqual,
    /// `actual <= threshold`
    #[serde(rename = "<=")]
    LessOrEqual,
    /// `actual == threshold`
    #[serde(rename = "=")]
    Equal,
    /// `actual != threshold`
    #[serde(rename = "!=")]
    NotEqual,
}

impl ComparisonOperator {
    /// Evaluates `actual <op> threshold` with plain IEEE-754 semantics.
    #[must_use]
    #[allow(clippy::float_cmp)]
    pub fn evaluate(self, actual: f64, threshold: f64) -> bool {
        match self {
            Self::GreaterThan => actual > threshold,
            Self::LessThan => actual < threshold,
            Self::GreaterOrEqual => actual >= threshold,
            Self::LessOrEqual => actual <= threshold,
            Self::Equal => actual == threshold,
            Self::NotEqual => actual != threshold,
        }
    }

    /// Returns the operator symbol.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GreaterThan => ">",
            Self::LessThan => "<",
            Self::GreaterOrEqual => ">=",
            Self::LessOrEqual => "<=",
            Self::Equal => "=",
            Self::NotEqual => "!=",
        }
    }
}

impl fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Threshold as stored: a number, or a string.
///
/// Only the numeric form participates in evaluation. String thresholds
/// evaluate as `0` until a comparison semantics for them is defined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionValue {
    /// Numeric threshold.
    Number(f64),
    /// Non-numeric threshold, currently coerced to `0`.
    Text(String),
}

impl ConditionValue {
    /// Returns the numeric threshold used for evaluation.
    #[must_use]
    pub const fn threshold(&self) -> f64 {
        match self {
            Self::Number(n) => *n,
            Self::Text(_) => 0.0,
        }
    }
}

/// Threshold condition of a meta-event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Comparison operator.
    pub operator: ComparisonOperator,
    /// Threshold value.
    pub value: ConditionValue,
}

impl Condition {
    /// Evaluates the condition against a computed metric.
    #[must_use]
    pub fn is_met(&self, actual: f64) -> bool {
        self.operator.evaluate(actual, self.value.threshold())
    }
}

/// Aggregation function over a numeric event field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    /// Sum of values.
    Sum,
    /// Arithmetic mean.
    Avg,
    /// Minimum value.
    Min,
    /// Maximum value.
    Max,
    /// Row count. Rejected by the aggregate variants.
    Count,
}

impl Aggregation {
    /// Returns the lowercase aggregation name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Avg => "avg",
            Self::Min => "min",
            Self::Max => "max",
            Self::Count => "count",
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which contracts a detection covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractTargets {
    /// No contract filter: every contract matches.
    All,
    /// Exactly one contract, evaluated once without attribution.
    Single(String),
    /// Two or more contracts, evaluated in order with OR semantics.
    AnyOf(Vec<String>),
}

/// Filter and window fields shared by every detection kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventScope {
    /// Event type the meta-event is about (e.g. `erc20_transfer`).
    pub event_type: String,
    /// Chain name.
    #[serde(default = "default_chain")]
    pub chain: String,
    /// Contract OR-set. Takes precedence over `contract_address` when non-empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contracts: Option<Vec<String>>,
    /// Single contract filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_address: Option<String>,
    /// Market identifier filter (bytes32, Morpho markets).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_id: Option<String>,
    /// Sender address filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_address: Option<String>,
    /// Recipient address filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_address: Option<String>,
    /// Duration window, e.g. `15m`, `1h`, `7d`.
    pub window: String,
    /// Block-count lookback. Replaces the time window when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookback_blocks: Option<u64>,
    /// Trigger condition.
    pub condition: Condition,
}

impl EventScope {
    /// Creates a scope with the default chain and no address filters.
    #[must_use]
    pub fn new(event_type: impl Into<String>, window: impl Into<String>, condition: Condition) -> Self {
        Self {
            event_type: event_type.into(),
            chain: default_chain(),
            contracts: None,
            contract_address: None,
            market_id: None,
            from_address: None,
            to_address: None,
            window: window.into(),
            lookback_blocks: None,
            condition,
        }
    }

    /// Resolves the contract filter, lower-casing addresses.
    #[must_use]
    pub fn contract_targets(&self) -> ContractTargets {
        match self.contracts.as_deref() {
            Some([only]) => ContractTargets::Single(only.to_lowercase()),
            Some(list) if !list.is_empty() => {
                ContractTargets::AnyOf(list.iter().map(|c| c.to_lowercase()).collect())
            }
            _ => match &self.contract_address {
                Some(address) => ContractTargets::Single(address.to_lowercase()),
                None => ContractTargets::All,
            },
        }
    }
}

/// Derived alert condition, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetaEventConfig {
    /// Count of matching events compared to the threshold.
    EventCount {
        /// Shared filters and condition.
        #[serde(flatten)]
        scope: EventScope,
    },
    /// Aggregation over one numeric field compared to the threshold.
    RollingAggregate {
        /// Shared filters and condition.
        #[serde(flatten)]
        scope: EventScope,
        /// Field of the event `data` map to aggregate.
        field: String,
        /// Aggregation function.
        aggregation: Aggregation,
    },
    /// Signed difference of one aggregation over two event populations.
    NetAggregate {
        /// Shared filters and condition.
        #[serde(flatten)]
        scope: EventScope,
        /// Field of the event `data` map to aggregate.
        field: String,
        /// Aggregation function.
        aggregation: Aggregation,
        /// Population added to the net value.
        positive_event_type: String,
        /// Population subtracted from the net value.
        negative_event_type: String,
    },
}

impl MetaEventConfig {
    /// Returns the shared scope.
    #[must_use]
    pub const fn scope(&self) -> &EventScope {
        match self {
            Self::EventCount { scope }
            | Self::RollingAggregate { scope, .. }
            | Self::NetAggregate { scope, .. } => scope,
        }
    }

    /// Returns the detection kind.
    #[must_use]
    pub const fn kind(&self) -> MetaEventKind {
        match self {
            Self::EventCount { .. } => MetaEventKind::EventCount,
            Self::RollingAggregate { .. } => MetaEventKind::RollingAggregate,
            Self::NetAggregate { .. } => MetaEventKind::NetAggregate,
        }
    }

    /// Event types whose max block bounds a block lookback.
    #[must_use]
    pub fn window_event_types(&self) -> Vec<&str> {
        match self {
            Self::EventCount { scope } | Self::RollingAggregate { scope, .. } => {
                vec![scope.event_type.as_str()]
            }
            Self::NetAggregate {
                positive_event_type,
                negative_event_type,
                ..
            } => vec![positive_event_type.as_str(), negative_event_type.as_str()],
        }
    }

    /// Checks the config for errors serde cannot express and returns the
    /// window length in minutes.
    ///
    /// # Errors
    ///
    /// - [`EngineError::InvalidWindowFormat`] for a malformed `window`.
    /// - [`EngineError::UnsupportedAggregation`] when an aggregate variant
    ///   asks for `count`.
    /// - [`EngineError::InvalidConfig`] for empty event types or fields.
    pub fn validate(&self) -> Result<u64, EngineError> {
        let scope = self.scope();
        let minutes = parse_window(&scope.window)?;

        if scope.event_type.trim().is_empty() {
            return Err(EngineError::InvalidConfig("event_type is empty".to_string()));
        }

        match self {
            Self::EventCount { .. } => {}
            Self::RollingAggregate {
                field, aggregation, ..
            } => check_aggregate(field, *aggregation)?,
            Self::NetAggregate {
                field,
                aggregation,
                positive_event_type,
                negative_event_type,
                ..
            } => {
                check_aggregate(field, *aggregation)?;
                if positive_event_type.trim().is_empty() || negative_event_type.trim().is_empty() {
                    return Err(EngineError::InvalidConfig(
                        "net_aggregate requires positive_event_type and negative_event_type"
                            .to_string(),
                    ));
                }
            }
        }

        Ok(minutes)
    }
}

fn check_aggregate(field: &str, aggregation: Aggregation) -> Result<(), EngineError> {
    if aggregation == Aggregation::Count {
        return Err(EngineError::UnsupportedAggregation(aggregation));
    }
    if field.trim().is_empty() {
        return Err(EngineError::InvalidConfig("aggregate field is empty".to_string()));
    }
    Ok(())
}

/// Detection kind discriminator, as reported in webhook payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaEventKind {
    /// `event_count`
    EventCount,
    /// `rolling_aggregate`
    RollingAggregate,
    /// `net_aggregate`
    NetAggregate,
}

impl MetaEventKind {
    /// Returns the kind as a static string slice.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EventCount => "event_count",
            Self::RollingAggregate => "rolling_aggregate",
            Self::NetAggregate => "net_aggregate",
        }
    }
}
