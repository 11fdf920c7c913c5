//! telltide-worker entry point.
//!
//! Connects to PostgreSQL, starts the detection loop and the ops HTTP
//! server, and drains the in-flight pass on ctrl-c.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use telltide_worker::api;
use telltide_worker::app_state::AppState;
use telltide_worker::config::WorkerConfig;
use telltide_worker::persistence::{
    EventStore, NotificationLogStore, PostgresStore, SubscriptionStore,
};
use telltide_worker::service::{
    CooldownGate, MetaEventDetector, MetaEventWorker, ReqwestTransport, WebhookDispatcher,
};

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = WorkerConfig::from_env()?;
    init_tracing(config.log_json);
    tracing::info!(
        interval_secs = config.interval_seconds,
        max_attempts = config.webhook_max_attempts,
        "starting telltide-worker"
    );

    // Connect and verify the store
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .min_connections(config.database_min_connections)
        .acquire_timeout(Duration::from_secs(config.database_connect_timeout_secs))
        .connect(&config.database_url)
        .await?;
    let store = Arc::new(PostgresStore::new(pool));
    let db_time = store.ping().await?;
    tracing::info!(%db_time, "database connection verified");

    // Build service layer
    let logs = Arc::clone(&store) as Arc<dyn NotificationLogStore>;
    let transport = Arc::new(ReqwestTransport::new(
        config.webhook_timeout(),
        &config.webhook_user_agent,
    )?);
    let worker = Arc::new(MetaEventWorker::new(
        Arc::clone(&store) as Arc<dyn SubscriptionStore>,
        CooldownGate::new(Arc::clone(&logs)),
        MetaEventDetector::new(Arc::clone(&store) as Arc<dyn EventStore>),
        WebhookDispatcher::new(logs, transport, config.retry_policy()),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Ops server
    let ops = if config.ops_enabled {
        let app = api::build_router()
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(AppState {
                stats: worker.stats(),
            });
        let listener = tokio::net::TcpListener::bind(config.ops_listen_addr).await?;
        tracing::info!(addr = %config.ops_listen_addr, "ops server listening");

        let mut ops_shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = ops_shutdown.changed().await;
                })
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "ops server failed");
            }
        }))
    } else {
        None
    };

    // Detection loop
    let worker_task = tokio::spawn(Arc::clone(&worker).run(config.interval(), shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    shutdown_tx.send_replace(true);

    if let Err(e) = worker_task.await {
        tracing::error!(error = %e, "worker task aborted");
    }
    if let Some(ops) = ops {
        if let Err(e) = ops.await {
            tracing::error!(error = %e, "ops task aborted");
        }
    }

    tracing::info!("telltide-worker stopped");
    Ok(())
}
