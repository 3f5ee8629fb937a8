mod config;
mod http;
mod subscriber;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use taskqueue_core::clock::SystemClock;
use taskqueue_core::idempotency::IdempotencyCache;
use taskqueue_core::queue::QueueService;
use taskqueue_core::task::TaskService;
use taskqueue_postgres::PgTaskStore;
use taskqueue_wire::SubscriptionSession;

use config::Config;

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("startup error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_new(config.tracing_filter()).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let store = match PgTaskStore::connect(&config.psql_source).await {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "failed to connect to database");
            std::process::exit(1);
        }
    };

    if let Err(e) = store.run_migrations().await {
        tracing::error!(error = %e, "failed to run migrations");
        std::process::exit(1);
    }

    let store = Arc::new(store);
    let clock = Arc::new(SystemClock);
    let idempotency = Arc::new(IdempotencyCache::new());

    let queue_service = Arc::new(QueueService::new(clock.clone(), idempotency.clone(), store.clone()));
    let task_service = Arc::new(TaskService::new(clock, idempotency, store));

    let base_cancel = CancellationToken::new();

    let app_state = http::AppState {
        queue_service: queue_service.clone(),
        task_service: task_service.clone(),
    };
    let app = http::router(app_state).layer(tower_http::trace::TraceLayer::new_for_http()).layer(
        tower_http::cors::CorsLayer::permissive(),
    );

    let http_listener = match TcpListener::bind(&config.service_addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, addr = %config.service_addr, "failed to bind HTTP listener");
            std::process::exit(1);
        }
    };

    let subscriber_listener = match TcpListener::bind(&config.subscriber_addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, addr = %config.subscriber_addr, "failed to bind subscriber listener");
            std::process::exit(1);
        }
    };

    tracing::info!(addr = %config.service_addr, "HTTP listener started");
    tracing::info!(addr = %config.subscriber_addr, "subscription listener started");

    let session = Arc::new(SubscriptionSession::new(queue_service, task_service));
    let subscriber_cancel = base_cancel.clone();
    let subscriber_task = tokio::spawn(subscriber::serve(subscriber_listener, session, subscriber_cancel));

    let http_cancel = base_cancel.clone();
    let http_task = tokio::spawn(async move {
        axum::serve(http_listener, app)
            .with_graceful_shutdown(async move { http_cancel.cancelled().await })
            .await
    });

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown signal received"),
        Err(e) => tracing::error!(error = %e, "failed to listen for shutdown signal"),
    }

    base_cancel.cancel();
    let _ = subscriber_task.await;
    let _ = http_task.await;
}
