//! Decoded on-chain events.
//!
//! Events are written by the ingestion service and only read here. The
//! triple `(chain, transaction_hash, log_index)` identifies an event;
//! re-ingesting the same triple is a no-op.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One decoded log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Chain name (e.g. `"ethereum"`, `"base"`).
    pub chain: String,
    /// Block the log was emitted in.
    pub block_number: u64,
    /// Block timestamp.
    pub timestamp: DateTime<Utc>,
    /// Decoded event type (e.g. `"morpho_supply"`).
    pub event_type: String,
    /// Emitting contract, lower-case hex.
    pub contract_address: String,
    /// Sender, when the event has one.
    pub from_address: Option<String>,
    /// Recipient, when the event has one.
    pub to_address: Option<String>,
    /// Market identifier, for market-scoped protocols.
    pub market_id: Option<String>,
    /// Decoded event arguments.
    pub data: BTreeMap<String, serde_json::Value>,
    /// Transaction hash.
    pub transaction_hash: String,
    /// Log index within the transaction.
    pub log_index: u32,
}

impl Event {
    /// Returns the identity triple used for insert-or-ignore.
    #[must_use]
    pub fn key(&self) -> (&str, &str, u32) {
        (&self.chain, &self.transaction_hash, self.log_index)
    }

    /// Reads `data[field]` as a number.
    ///
    /// Integer amounts are usually stored as decimal strings to keep
    /// full precision, so both JSON numbers and numeric strings are
    /// accepted.
    #[must_use]
    pub fn numeric_field(&self, field: &str) -> Option<f64> {
        match self.data.get(field)? {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_event(value: serde_json::Value) -> Event {
        let mut data = BTreeMap::new();
        data.insert("assets".to_string(), value);
        Event {
            chain: "ethereum".to_string(),
            block_number: 1,
            timestamp: Utc::now(),
            event_type: "morpho_supply".to_string(),
            contract_address: "0xbbb".to_string(),
            from_address: None,
            to_address: None,
            market_id: None,
            data,
            transaction_hash: "0x01".to_string(),
            log_index: 0,
        }
    }

    #[test]
    fn numeric_field_accepts_numbers_and_strings() {
        assert_eq!(make_event(serde_json::json!(42)).numeric_field("assets"), Some(42.0));
        assert_eq!(
            make_event(serde_json::json!("1000000")).numeric_field("assets"),
            Some(1_000_000.0)
        );
        assert_eq!(make_event(serde_json::json!(true)).numeric_field("assets"), None);
        assert_eq!(make_event(serde_json::json!(1)).numeric_field("shares"), None);
    }
}
