//! Webhook delivery with an audit trail.
//!
//! Every notification is logged before the first network attempt. Delivery
//! is then attempted up to [`RetryPolicy::max_attempts`] times with a
//! linearly growing delay; a `404` aborts immediately. The attempt count and
//! final status are written back to the log row.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;

use crate::domain::PendingNotification;
use crate::error::EngineError;
use crate::persistence::NotificationLogStore;

/// Status that marks a subscriber endpoint as permanently misconfigured.
const PERMANENT_FAILURE_STATUS: u16 = 404;

/// Outbound HTTP seam for webhook delivery.
#[async_trait]
pub trait WebhookTransport: Send + Sync + std::fmt::Debug {
    /// POSTs `body` as JSON to `url` and returns the response status.
    ///
    /// Any HTTP response, whatever its status, is `Ok`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::DeliveryError`] when no response was
    /// received (timeout, connection failure).
    async fn post_json(&self, url: &str, body: &serde_json::Value) -> Result<u16, EngineError>;
}

/// [`WebhookTransport`] backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Builds a client with a per-request timeout and `User-Agent`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Internal`] if the client cannot be built.
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| EngineError::Internal(format!("http client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookTransport for ReqwestTransport {
    async fn post_json(&self, url: &str, body: &serde_json::Value) -> Result<u16, EngineError> {
        let response = self.client.post(url).json(body).send().await?;
        Ok(response.status().as_u16())
    }
}

/// Delivery attempt limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per notification, including the first.
    pub max_attempts: u32,
    /// Delay unit; the wait after attempt `n` is `n * base_delay`.
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based).
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1_000),
        }
    }
}

/// Aggregate outcome of a batch dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Notifications delivered with a 2xx response.
    pub successful: usize,
    /// Notifications that exhausted retries, hit a 404, or could not be
    /// logged.
    pub failed: usize,
}

/// Delivers triggered notifications and maintains their audit rows.
#[derive(Debug, Clone)]
pub struct WebhookDispatcher {
    logs: Arc<dyn NotificationLogStore>,
    transport: Arc<dyn WebhookTransport>,
    policy: RetryPolicy,
}

impl WebhookDispatcher {
    /// Creates a dispatcher.
    #[must_use]
    pub fn new(
        logs: Arc<dyn NotificationLogStore>,
        transport: Arc<dyn WebhookTransport>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            logs,
            transport,
            policy,
        }
    }

    /// Delivers one notification. Returns `true` on a 2xx response.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::PersistenceError`] only when the audit row
    /// cannot be created, in which case nothing is sent. Failures to update
    /// the row afterwards are logged and do not affect the outcome.
    pub async fn dispatch(&self, notification: &PendingNotification) -> Result<bool, EngineError> {
        let subscription_id = notification.subscription_id;
        let body = serde_json::to_value(&notification.payload)
            .map_err(|e| EngineError::Internal(format!("payload serialization: {e}")))?;

        let log_id = self
            .logs
            .create(subscription_id, notification.payload.triggered_at, &body)
            .await?;

        let max_attempts = self.policy.max_attempts.max(1);
        let mut delivered = false;
        let mut last_status: u16 = 0;

        for attempt in 1..=max_attempts {
            tracing::info!(
                %subscription_id,
                url = %notification.webhook_url,
                attempt,
                max_attempts,
                "sending webhook"
            );

            let mut abort = false;
            match self.transport.post_json(&notification.webhook_url, &body).await {
                Ok(status) => {
                    last_status = status;
                    if (200..300).contains(&status) {
                        tracing::info!(%subscription_id, status, "webhook delivered");
                        delivered = true;
                    } else if status == PERMANENT_FAILURE_STATUS {
                        tracing::warn!(%subscription_id, status, "webhook endpoint not found, giving up");
                        abort = true;
                    } else {
                        tracing::warn!(%subscription_id, status, attempt, "webhook returned non-2xx status");
                    }
                }
                Err(e) => {
                    tracing::warn!(%subscription_id, attempt, error = %e, "webhook delivery failed");
                }
            }

            if let Err(e) = self.logs.update_retry_count(log_id, attempt).await {
                tracing::error!(%log_id, error = %e, "failed to record retry count");
            }

            if delivered || abort {
                break;
            }
            if attempt < max_attempts {
                tokio::time::sleep(self.policy.delay_after(attempt)).await;
            }
        }

        if let Err(e) = self.logs.update_response_status(log_id, last_status).await {
            tracing::error!(%log_id, error = %e, "failed to record webhook response status");
        }
        if !delivered {
            tracing::error!(%subscription_id, last_status, "webhook delivery failed permanently");
        }

        Ok(delivered)
    }

    /// Delivers every notification concurrently, one task each.
    ///
    /// A failure, error, or panic in one delivery never cancels another.
    pub async fn dispatch_batch(&self, notifications: Vec<PendingNotification>) -> BatchSummary {
        let handles = notifications.into_iter().map(|notification| {
            let dispatcher = self.clone();
            tokio::spawn(async move { dispatcher.dispatch(&notification).await })
        });

        let mut summary = BatchSummary::default();
        for outcome in join_all(handles).await {
            match outcome {
                Ok(Ok(true)) => summary.successful += 1,
                Ok(Ok(false)) => summary.failed += 1,
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "notification could not be dispatched");
                    summary.failed += 1;
                }
                Err(e) => {
                    tracing::error!(error = %e, "dispatch task aborted");
                    summary.failed += 1;
                }
            }
        }
        summary
    }
}
