use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vellum::breaker::CircuitBreaker;
use vellum::cache::DocumentCache;
use vellum::jobs::{
    EnhancementCompletions, InMemoryJobQueue, Job, JobDispatcher, JobProcessor, run_queue_driver,
};
use vellum::limiter::RateLimiter;
use vellum::pipeline::RequestPipeline;
use vellum::server::{AppState, ServerPolicies, build_router};
use vellum::store::MemoryStore;
use vellum::webhooks::{
    DeliveryLedger, HttpTransport, WebhookManager, WebhookRegistry, spawn_delivery_worker,
};

/// Placeholder for the enhancement pipeline collaborator: this binary wires
/// a processor that completes every job with a synthetic result URL. The
/// real AI pipeline implements [`JobProcessor`] and is injected here.
struct PlaceholderProcessor;

#[async_trait]
impl JobProcessor for PlaceholderProcessor {
    async fn process(&self, job: &Job) -> Result<serde_json::Value, String> {
        Ok(serde_json::json!({
            "result_url": format!("https://results.vellum.invalid/{}", job.id),
        }))
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vellum=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Single-node wiring: every collaborator is backed in-process. A
    // multi-instance deployment swaps MemoryStore for a shared store and
    // InMemoryJobQueue for a managed queue.
    let store = Arc::new(MemoryStore::new());
    let pipeline = RequestPipeline::new(
        CircuitBreaker::new(store.clone()),
        RateLimiter::new(store.clone()),
    );
    let cache = Arc::new(DocumentCache::new(store));

    let registry = Arc::new(WebhookRegistry::new());
    let ledger = Arc::new(DeliveryLedger::new());
    let cancel = CancellationToken::new();

    let worker = spawn_delivery_worker(
        registry.clone(),
        ledger.clone(),
        Arc::new(HttpTransport::new()),
        cancel.clone(),
    );
    let webhooks = Arc::new(WebhookManager::new(registry.clone(), ledger.clone(), worker));

    let queue = Arc::new(InMemoryJobQueue::new());
    let dispatcher = Arc::new(JobDispatcher::new(
        queue.clone(),
        cache.clone(),
        webhooks.clone(),
    ));

    tokio::spawn(run_queue_driver(
        queue,
        Arc::new(PlaceholderProcessor),
        Arc::new(EnhancementCompletions::new(cache.clone(), webhooks.clone())),
        cancel.clone(),
    ));

    let state = AppState::new(
        pipeline,
        dispatcher,
        cache,
        registry,
        ledger,
        webhooks,
        ServerPolicies::default(),
    );
    let app = build_router(state);

    let port = std::env::var("VELLUM_PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(3000);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    let shutdown_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received, draining workers");
            shutdown_cancel.cancel();
        })
        .await
        .unwrap();
}
