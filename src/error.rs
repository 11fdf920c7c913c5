//! Engine error types.
//!
//! [`EngineError`] is the central error type for the worker. Configuration
//! errors are raised inside detection and contained per subscription; store
//! and delivery errors are propagated to the component that owns the retry
//! or fail-closed decision.

use crate::domain::Aggregation;

/// Crate-wide error enum.
///
/// # Containment
///
/// | Variant                  | Raised by            | Contained at            |
/// |--------------------------|----------------------|-------------------------|
/// | `InvalidWindowFormat`    | window resolver      | detector (per sub)      |
/// | `UnsupportedAggregation` | config validation    | detector (per sub)      |
/// | `InvalidConfig`          | config validation    | detector (per sub)      |
/// | `PersistenceError`       | stores               | detector / worker pass  |
/// | `DeliveryError`          | webhook transport    | dispatcher retry loop   |
/// | `Internal`               | task joins, builders | worker pass / bootstrap |
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Window string did not match `^\d+(m|h|d)$`.
    #[error("invalid window format: {0} (expected e.g. 15m, 1h, 7d)")]
    InvalidWindowFormat(String),

    /// Aggregation is not usable by the aggregate detection variants.
    #[error("unsupported aggregation `{0}`: use the event_count type for counting")]
    UnsupportedAggregation(Aggregation),

    /// Meta-event configuration is structurally invalid.
    #[error("invalid meta-event config: {0}")]
    InvalidConfig(String),

    /// Store read or write failure.
    #[error("persistence error: {0}")]
    PersistenceError(String),

    /// Webhook request produced no HTTP response (timeout, network error).
    #[error("delivery error: {0}")]
    DeliveryError(String),

    /// Internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Returns `true` for errors caused by the subscription's own
    /// configuration rather than by infrastructure.
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidWindowFormat(_) | Self::UnsupportedAggregation(_) | Self::InvalidConfig(_)
        )
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        Self::PersistenceError(err.to_string())
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        Self::DeliveryError(err.to_string())
    }
}
