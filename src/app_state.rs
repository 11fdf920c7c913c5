//! Shared state injected into the ops handlers.

use std::sync::Arc;

use crate::service::WorkerStats;

/// State available to all handlers via Axum's `State` extractor.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Counters and last pass report published by the worker.
    pub stats: Arc<WorkerStats>,
}
