//! # telltide-worker
//!
//! Meta-event detection and webhook notification worker.
//!
//! Subscriptions describe derived alert conditions ("more than 10 large
//! transfers in 5 minutes", "net outflow above 1M over an hour") evaluated
//! over a rolling window of indexed on-chain events. On every tick the
//! worker evaluates each active subscription that is not cooling down and
//! POSTs a JSON payload to the subscriber's webhook when its condition
//! holds. Every delivery is recorded in a notification log before the
//! first attempt.
//!
//! ## Architecture
//!
//! ```text
//! Timer (service/worker)
//!     │
//!     ├── SubscriptionStore ── list active
//!     ├── CooldownGate (service/cooldown) ── NotificationLogStore
//!     ├── MetaEventDetector (service/detector) ── EventStore
//!     │
//!     ├── WebhookDispatcher (service/dispatcher)
//!     │       ├── NotificationLogStore (audit)
//!     │       └── WebhookTransport (reqwest)
//!     │
//!     └── PostgreSQL Persistence / InMemoryStore
//!
//! Ops HTTP (api/): /health, /status
//! ```

pub mod api;
pub mod app_state;
pub mod config;
pub mod domain;
pub mod error;
pub mod persistence;
pub mod service;
