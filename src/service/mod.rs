//! Service layer: the detection pipeline.
//!
//! [`MetaEventWorker`] drives each pass: [`CooldownGate`] filters
//! subscriptions, [`MetaEventDetector`] evaluates the rest against the
//! event store, and [`WebhookDispatcher`] delivers what triggered.

pub mod cooldown;
pub mod detector;
pub mod dispatcher;
pub mod worker;

pub use cooldown::{CooldownDecision, CooldownGate};
pub use detector::MetaEventDetector;
pub use dispatcher::{BatchSummary, ReqwestTransport, RetryPolicy, WebhookDispatcher, WebhookTransport};
pub use worker::{MetaEventWorker, PassReport, StatsSnapshot, WorkerStats};
