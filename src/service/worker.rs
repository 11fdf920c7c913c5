//! Periodic detection passes.
//!
//! [`MetaEventWorker`] runs one pass per timer tick: list active
//! subscriptions, gate each through the cooldown, detect sequentially,
//! then hand every trigger to the dispatcher as one batch.
//!
//! # Concurrency
//!
//! - At most one pass runs at a time. A tick that fires while a pass is in
//!   progress is dropped, never queued.
//! - Subscriptions within a pass are evaluated one after another, so this
//!   worker has at most one event-store query in flight.
//! - Webhook dispatch at the end of a pass is fully concurrent.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use super::cooldown::{CooldownDecision, CooldownGate};
use super::detector::MetaEventDetector;
use super::dispatcher::WebhookDispatcher;
use crate::domain::{PendingNotification, Subscription, WebhookPayload};
use crate::error::EngineError;
use crate::persistence::SubscriptionStore;

/// Shortest accepted tick interval.
const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Summary of one completed pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    /// When the pass started.
    pub started_at: Option<DateTime<Utc>>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Active subscriptions found.
    pub subscriptions: usize,
    /// Subscriptions skipped by the cooldown gate.
    pub skipped_cooldown: usize,
    /// Subscriptions whose cooldown lookup failed.
    pub errors: usize,
    /// Subscriptions that went through detection.
    pub evaluated: usize,
    /// Detections that triggered.
    pub triggered: usize,
    /// Notifications delivered.
    pub delivered: usize,
    /// Notifications that failed delivery.
    pub failed: usize,
}

/// Counters shared with the ops endpoints.
#[derive(Debug, Default)]
pub struct WorkerStats {
    passes_completed: AtomicU64,
    ticks_dropped: AtomicU64,
    last_pass: RwLock<Option<PassReport>>,
}

/// Point-in-time copy of [`WorkerStats`].
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    /// Passes that ran to completion.
    pub passes_completed: u64,
    /// Ticks dropped because a pass was still running.
    pub ticks_dropped: u64,
    /// Report of the most recent completed pass.
    pub last_pass: Option<PassReport>,
}

impl WorkerStats {
    /// Creates zeroed stats.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a consistent-enough copy for reporting.
    pub async fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            passes_completed: self.passes_completed.load(Ordering::Relaxed),
            ticks_dropped: self.ticks_dropped.load(Ordering::Relaxed),
            last_pass: self.last_pass.read().await.clone(),
        }
    }

    async fn record_pass(&self, report: &PassReport) {
        self.passes_completed.fetch_add(1, Ordering::Relaxed);
        *self.last_pass.write().await = Some(report.clone());
    }

    fn record_dropped_tick(&self) {
        self.ticks_dropped.fetch_add(1, Ordering::Relaxed);
    }
}

/// Clears the single-flight flag when dropped, including during unwinding.
struct PassGuard<'a> {
    running: &'a AtomicBool,
}

impl<'a> PassGuard<'a> {
    fn try_acquire(running: &'a AtomicBool) -> Option<Self> {
        running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { running })
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Scheduler and pass runner.
#[derive(Debug)]
pub struct MetaEventWorker {
    subscriptions: Arc<dyn SubscriptionStore>,
    cooldown: CooldownGate,
    detector: MetaEventDetector,
    dispatcher: WebhookDispatcher,
    running: AtomicBool,
    stats: Arc<WorkerStats>,
}

impl MetaEventWorker {
    /// Creates a worker from its collaborators.
    #[must_use]
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        cooldown: CooldownGate,
        detector: MetaEventDetector,
        dispatcher: WebhookDispatcher,
    ) -> Self {
        Self {
            subscriptions,
            cooldown,
            detector,
            dispatcher,
            running: AtomicBool::new(false),
            stats: Arc::new(WorkerStats::new()),
        }
    }

    /// Returns the shared stats handle.
    #[must_use]
    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    /// Returns `true` while a pass is in progress.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Runs one detection pass unless another is already running.
    ///
    /// Returns `Ok(None)` when the pass was skipped.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::PersistenceError`] if the active
    /// subscriptions cannot be listed. Per-subscription failures are
    /// logged and counted instead.
    pub async fn run_pass(&self) -> Result<Option<PassReport>, EngineError> {
        let Some(_guard) = PassGuard::try_acquire(&self.running) else {
            self.stats.record_dropped_tick();
            tracing::info!("previous pass still running, dropping tick");
            return Ok(None);
        };

        let started = Instant::now();
        let mut report = PassReport {
            started_at: Some(Utc::now()),
            ..PassReport::default()
        };

        let subscriptions = self.subscriptions.list_active().await?;
        report.subscriptions = subscriptions.len();

        if subscriptions.is_empty() {
            tracing::info!("no active subscriptions");
        } else {
            tracing::info!(count = subscriptions.len(), "checking active subscriptions");
            let pending = self.evaluate_all(&subscriptions, &mut report).await;

            if !pending.is_empty() {
                tracing::info!(count = pending.len(), "dispatching webhooks");
                let summary = self.dispatcher.dispatch_batch(pending).await;
                report.delivered = summary.successful;
                report.failed = summary.failed;
                tracing::info!(
                    successful = summary.successful,
                    failed = summary.failed,
                    "webhook batch finished"
                );
            }
        }

        report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::info!(
            duration_ms = report.duration_ms,
            subscriptions = report.subscriptions,
            skipped = report.skipped_cooldown,
            errors = report.errors,
            evaluated = report.evaluated,
            triggered = report.triggered,
            delivered = report.delivered,
            failed = report.failed,
            "pass completed"
        );
        self.stats.record_pass(&report).await;
        Ok(Some(report))
    }

    async fn evaluate_all(
        &self,
        subscriptions: &[Subscription],
        report: &mut PassReport,
    ) -> Vec<PendingNotification> {
        let mut pending = Vec::new();

        for subscription in subscriptions {
            let subscription_id = subscription.id;

            match self.cooldown.check(subscription, Utc::now()).await {
                Ok(CooldownDecision::Ready) => {}
                Ok(CooldownDecision::CoolingDown { elapsed, remaining }) => {
                    tracing::info!(
                        %subscription_id,
                        name = %subscription.name,
                        elapsed_secs = elapsed.num_seconds(),
                        remaining_secs = remaining.num_seconds(),
                        "subscription cooling down, skipping"
                    );
                    report.skipped_cooldown += 1;
                    continue;
                }
                Err(e) => {
                    tracing::error!(%subscription_id, error = %e, "cooldown lookup failed");
                    report.errors += 1;
                    continue;
                }
            }

            report.evaluated += 1;
            let result = self.detector.detect(subscription).await;
            if !result.triggered {
                tracing::debug!(%subscription_id, name = %subscription.name, "no trigger");
                continue;
            }

            tracing::info!(
                %subscription_id,
                name = %subscription.name,
                contract = result.triggered_by_contract.as_deref().unwrap_or("-"),
                "meta-event triggered"
            );
            report.triggered += 1;
            pending.push(PendingNotification {
                subscription_id,
                webhook_url: subscription.webhook_url.clone(),
                payload: WebhookPayload::from_detection(
                    subscription_id,
                    subscription.name.clone(),
                    subscription.meta_event_config.kind(),
                    &result,
                    Utc::now(),
                ),
            });
        }

        pending
    }

    async fn tick(&self) {
        if let Err(e) = self.run_pass().await {
            tracing::error!(error = %e, "detection pass failed");
        }
    }

    /// Runs passes every `interval`, starting immediately, until
    /// `shutdown` flips to `true` or its sender is dropped.
    ///
    /// On shutdown no new pass starts; the in-flight pass, including its
    /// webhook batch, is awaited before returning.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let interval = interval.max(MIN_INTERVAL);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut passes = JoinSet::new();

        tracing::info!(interval_secs = interval.as_secs(), "meta-event worker started");

        if *shutdown.borrow() {
            return;
        }

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let worker = Arc::clone(&self);
                    passes.spawn(async move { worker.tick().await });
                }
                Some(joined) = passes.join_next() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "detection pass task aborted");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        tracing::info!(in_flight = passes.len(), "shutting down worker");
        while let Some(joined) = passes.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "detection pass task aborted");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::collections::BTreeMap;

    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use tokio::sync::Notify;

    use super::*;
    use crate::domain::{ComparisonOperator, Condition, ConditionValue, Event, EventScope, MetaEventConfig};
    use crate::persistence::{EventStore, InMemoryStore, NotificationLogStore};
    use crate::service::dispatcher::{RetryPolicy, WebhookTransport};

    #[derive(Debug)]
    struct AlwaysOk;

    #[async_trait]
    impl WebhookTransport for AlwaysOk {
        async fn post_json(&self, _url: &str, _body: &serde_json::Value) -> Result<u16, EngineError> {
            Ok(200)
        }
    }

    /// Blocks `list_active` until released.
    #[derive(Debug, Default)]
    struct GatedSubscriptions {
        release: Notify,
    }

    #[async_trait]
    impl SubscriptionStore for GatedSubscriptions {
        async fn list_active(&self) -> Result<Vec<Subscription>, EngineError> {
            self.release.notified().await;
            Ok(Vec::new())
        }
    }

    #[derive(Debug)]
    struct PanickingSubscriptions;

    #[async_trait]
    impl SubscriptionStore for PanickingSubscriptions {
        async fn list_active(&self) -> Result<Vec<Subscription>, EngineError> {
            panic!("store blew up");
        }
    }

    #[derive(Debug)]
    struct FailingSubscriptions;

    #[async_trait]
    impl SubscriptionStore for FailingSubscriptions {
        async fn list_active(&self) -> Result<Vec<Subscription>, EngineError> {
            Err(EngineError::PersistenceError("connection reset".to_string()))
        }
    }

    fn build_worker(
        store: &Arc<InMemoryStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
    ) -> MetaEventWorker {
        let logs = Arc::clone(store) as Arc<dyn NotificationLogStore>;
        let events = Arc::clone(store) as Arc<dyn EventStore>;
        MetaEventWorker::new(
            subscriptions,
            CooldownGate::new(Arc::clone(&logs)),
            MetaEventDetector::new(events),
            WebhookDispatcher::new(
                logs,
                Arc::new(AlwaysOk),
                RetryPolicy {
                    max_attempts: 1,
                    base_delay: Duration::from_millis(1),
                },
            ),
        )
    }

    fn transfer(seq: u32) -> Event {
        Event {
            chain: "ethereum".to_string(),
            block_number: 1,
            timestamp: Utc::now(),
            event_type: "erc20_transfer".to_string(),
            contract_address: "0xaaa".to_string(),
            from_address: None,
            to_address: None,
            market_id: None,
            data: BTreeMap::new(),
            transaction_hash: format!("0x{seq}"),
            log_index: 0,
        }
    }

    fn count_subscription(cooldown_minutes: u32) -> Subscription {
        let config = MetaEventConfig::EventCount {
            scope: EventScope::new(
                "erc20_transfer",
                "5m",
                Condition {
                    operator: ComparisonOperator::GreaterThan,
                    value: ConditionValue::Number(1.0),
                },
            ),
        };
        let mut sub = Subscription::new("user", "spike", "https://example.com/hook", config);
        sub.cooldown_minutes = cooldown_minutes;
        sub
    }

    #[tokio::test]
    async fn overlapping_pass_is_dropped() {
        let store = Arc::new(InMemoryStore::new());
        let gated = Arc::new(GatedSubscriptions::default());
        let worker = Arc::new(build_worker(
            &store,
            Arc::clone(&gated) as Arc<dyn SubscriptionStore>,
        ));

        let first = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.run_pass().await })
        };
        while !worker.is_running() {
            tokio::task::yield_now().await;
        }

        let second = worker.run_pass().await;
        assert!(matches!(second, Ok(None)));

        gated.release.notify_one();
        let Ok(first) = first.await else {
            panic!("first pass panicked");
        };
        assert!(matches!(first, Ok(Some(_))));
        assert!(!worker.is_running());

        let stats = worker.stats().snapshot().await;
        assert_eq!(stats.passes_completed, 1);
        assert_eq!(stats.ticks_dropped, 1);
    }

    #[tokio::test]
    async fn guard_is_released_after_panic() {
        let store = Arc::new(InMemoryStore::new());
        let worker = Arc::new(build_worker(&store, Arc::new(PanickingSubscriptions)));

        let handle = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.run_pass().await })
        };
        assert!(handle.await.is_err());
        assert!(!worker.is_running());
    }

    #[tokio::test]
    async fn listing_failure_surfaces_and_releases_guard() {
        let store = Arc::new(InMemoryStore::new());
        let worker = build_worker(&store, Arc::new(FailingSubscriptions));

        let result = worker.run_pass().await;
        assert!(matches!(result, Err(EngineError::PersistenceError(_))));
        assert!(!worker.is_running());
    }

    #[tokio::test]
    async fn cooling_subscription_issues_no_event_queries() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_events((0..5).map(transfer)).await;
        let sub = count_subscription(5);
        let created = store
            .create(sub.id, Utc::now() - ChronoDuration::minutes(2), &serde_json::json!({}))
            .await;
        assert!(created.is_ok());
        store.upsert_subscription(sub).await;

        let worker = build_worker(&store, Arc::clone(&store) as Arc<dyn SubscriptionStore>);
        let Ok(Some(report)) = worker.run_pass().await else {
            panic!("pass should complete");
        };

        assert_eq!(report.skipped_cooldown, 1);
        assert_eq!(report.evaluated, 0);
        assert_eq!(store.event_query_count(), 0);
        assert_eq!(store.notification_logs().await.len(), 1);
    }

    #[tokio::test]
    async fn expired_cooldown_is_evaluated_and_notified() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_events((0..5).map(transfer)).await;
        let sub = count_subscription(5);
        let created = store
            .create(sub.id, Utc::now() - ChronoDuration::minutes(6), &serde_json::json!({}))
            .await;
        assert!(created.is_ok());
        store.upsert_subscription(sub).await;

        let worker = build_worker(&store, Arc::clone(&store) as Arc<dyn SubscriptionStore>);
        let Ok(Some(report)) = worker.run_pass().await else {
            panic!("pass should complete");
        };

        assert_eq!(report.evaluated, 1);
        assert_eq!(report.triggered, 1);
        assert_eq!(report.delivered, 1);
        assert!(store.event_query_count() > 0);
        assert_eq!(store.notification_logs().await.len(), 2);
    }

    #[tokio::test]
    async fn run_loop_fires_immediately_and_stops_on_shutdown() {
        let store = Arc::new(InMemoryStore::new());
        let worker = Arc::new(build_worker(
            &store,
            Arc::clone(&store) as Arc<dyn SubscriptionStore>,
        ));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(Arc::clone(&worker).run(Duration::from_secs(60), rx));
        while worker.stats().snapshot().await.passes_completed == 0 {
            tokio::task::yield_now().await;
        }
        assert!(tx.send(true).is_ok());
        assert!(handle.await.is_ok());

        assert_eq!(worker.stats().snapshot().await.passes_completed, 1);
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_pass() {
        let store = Arc::new(InMemoryStore::new());
        let gated = Arc::new(GatedSubscriptions::default());
        let worker = Arc::new(build_worker(
            &store,
            Arc::clone(&gated) as Arc<dyn SubscriptionStore>,
        ));
        let (tx, rx) = watch::channel(false);

        let mut handle = tokio::spawn(Arc::clone(&worker).run(Duration::from_secs(60), rx));
        while !worker.is_running() {
            tokio::task::yield_now().await;
        }
        assert!(tx.send(true).is_ok());

        let early = tokio::time::timeout(Duration::from_millis(50), &mut handle).await;
        assert!(early.is_err(), "run returned before the pass finished");
        assert_eq!(worker.stats().snapshot().await.passes_completed, 0);

        gated.release.notify_one();
        assert!(handle.await.is_ok());
        assert!(!worker.is_running());
        assert_eq!(worker.stats().snapshot().await.passes_completed, 1);
    }
}
