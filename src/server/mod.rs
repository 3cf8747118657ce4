//! HTTP server for the resilience core.
//!
//! Every mutating endpoint runs under the request pipeline (circuit breaker,
//! then rate limits, then the handler), so rejection behavior is uniform:
//! 429 + `Retry-After` when a rate limit trips, 503 when a circuit is open.
//!
//! # Endpoints
//!
//! - `POST /enhance` - single-file enhancement (cache-aware)
//! - `POST /enhance/batch` - up to 10 files, per-item outcomes
//! - `POST /webhooks`, `GET /webhooks`, `GET/PUT/DELETE /webhooks/{id}`
//! - `POST /webhooks/{id}/rotate-secret`
//! - `GET /webhooks/{id}/deliveries` - delivery history for debugging
//! - `GET /health` - liveness probe
//!
//! Authentication happens upstream; handlers trust the `X-Owner-Id` header
//! to carry the verified caller identity.

use std::sync::Arc;

use axum::http::HeaderMap;

pub mod enhance;
pub mod health;
pub mod webhooks_api;

use crate::cache::DocumentCache;
use crate::error::ApiError;
use crate::jobs::JobDispatcher;
use crate::pipeline::{EndpointPolicy, RequestPipeline};
use crate::types::OwnerId;
use crate::webhooks::{DeliveryLedger, WebhookManager, WebhookRegistry};

pub use health::health_handler;

/// Header carrying the verified caller identity.
pub const HEADER_OWNER: &str = "x-owner-id";

/// Admission policies per endpoint group.
#[derive(Debug, Clone, Copy)]
pub struct ServerPolicies {
    pub enhance: EndpointPolicy,
    pub webhooks: EndpointPolicy,
}

impl Default for ServerPolicies {
    fn default() -> Self {
        ServerPolicies {
            enhance: EndpointPolicy::default(),
            webhooks: EndpointPolicy::default(),
        }
    }
}

/// Shared application state, passed to handlers via Axum's `State`
/// extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    pipeline: RequestPipeline,
    dispatcher: Arc<JobDispatcher>,
    cache: Arc<DocumentCache>,
    registry: Arc<WebhookRegistry>,
    ledger: Arc<DeliveryLedger>,
    webhooks: Arc<WebhookManager>,
    policies: ServerPolicies,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pipeline: RequestPipeline,
        dispatcher: Arc<JobDispatcher>,
        cache: Arc<DocumentCache>,
        registry: Arc<WebhookRegistry>,
        ledger: Arc<DeliveryLedger>,
        webhooks: Arc<WebhookManager>,
        policies: ServerPolicies,
    ) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                pipeline,
                dispatcher,
                cache,
                registry,
                ledger,
                webhooks,
                policies,
            }),
        }
    }

    pub fn pipeline(&self) -> &RequestPipeline {
        &self.inner.pipeline
    }

    pub fn dispatcher(&self) -> Arc<JobDispatcher> {
        self.inner.dispatcher.clone()
    }

    pub fn cache(&self) -> Arc<DocumentCache> {
        self.inner.cache.clone()
    }

    pub fn registry(&self) -> Arc<WebhookRegistry> {
        self.inner.registry.clone()
    }

    pub fn ledger(&self) -> Arc<DeliveryLedger> {
        self.inner.ledger.clone()
    }

    pub fn webhooks(&self) -> Arc<WebhookManager> {
        self.inner.webhooks.clone()
    }

    pub fn enhance_policy(&self) -> &EndpointPolicy {
        &self.inner.policies.enhance
    }

    pub fn webhooks_policy(&self) -> &EndpointPolicy {
        &self.inner.policies.webhooks
    }
}

/// Extracts the verified caller identity from the request headers.
pub fn owner_from_headers(headers: &HeaderMap) -> Result<OwnerId, ApiError> {
    headers
        .get(HEADER_OWNER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(OwnerId::new)
        .ok_or_else(|| ApiError::validation("missing X-Owner-Id header"))
}

/// Builds the axum Router with all endpoints.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::routing::{delete, get, post, put};

    axum::Router::new()
        .route("/enhance", post(enhance::enhance_handler))
        .route("/enhance/batch", post(enhance::batch_handler))
        .route("/webhooks", post(webhooks_api::create_webhook_handler))
        .route("/webhooks", get(webhooks_api::list_webhooks_handler))
        .route("/webhooks/{id}", get(webhooks_api::get_webhook_handler))
        .route("/webhooks/{id}", put(webhooks_api::update_webhook_handler))
        .route(
            "/webhooks/{id}",
            delete(webhooks_api::delete_webhook_handler),
        )
        .route(
            "/webhooks/{id}/rotate-secret",
            post(webhooks_api::rotate_secret_handler),
        )
        .route(
            "/webhooks/{id}/deliveries",
            get(webhooks_api::list_deliveries_handler),
        )
        .route("/health", get(health_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_extraction_requires_header() {
        let mut headers = HeaderMap::new();
        assert!(owner_from_headers(&headers).is_err());

        headers.insert(HEADER_OWNER, "acct_1".parse().unwrap());
        assert_eq!(owner_from_headers(&headers).unwrap(), OwnerId::new("acct_1"));
    }

    #[test]
    fn empty_owner_header_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_OWNER, "".parse().unwrap());
        assert!(owner_from_headers(&headers).is_err());
    }
}
