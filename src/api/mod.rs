//! Operational HTTP surface.
//!
//! Only liveness and worker status are exposed; subscriptions are managed
//! elsewhere.

pub mod handlers;

use axum::Router;

use crate::app_state::AppState;

/// Builds the ops router.
pub fn build_router() -> Router<AppState> {
    Router::new().merge(handlers::system::routes())
}
