//! Webhook subscription endpoints.
//!
//! CRUD over the registry plus secret rotation and a read-only delivery
//! history for debugging receivers. The creation response is the only place
//! a webhook secret ever appears.

use std::collections::HashMap;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;
use crate::pipeline::RequestContext;
use crate::types::WebhookId;
use crate::webhooks::{
    CreateWebhook, RegistryError, UpdateWebhook, Webhook, WebhookDelivery, WebhookRetryPolicy,
};

use super::{AppState, owner_from_headers};

impl From<RegistryError> for ApiError {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::NotFound(id) => ApiError::NotFound(format!("webhook {id}")),
            other => ApiError::Validation(other.to_string()),
        }
    }
}

/// Request body for `POST /webhooks`.
#[derive(Debug, Deserialize)]
pub struct CreateWebhookRequest {
    pub url: String,
    pub events: Vec<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub retry_policy: Option<WebhookRetryPolicy>,
}

/// Response body for `POST /webhooks`: the one-time secret disclosure.
#[derive(Debug, Serialize)]
pub struct CreatedWebhookResponse {
    pub webhook: Webhook,
    /// Shown exactly once; store it now.
    pub secret: String,
}

/// Request body for `PUT /webhooks/{id}`.
#[derive(Debug, Deserialize, Default)]
pub struct UpdateWebhookRequest {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub events: Option<Vec<String>>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub retry_policy: Option<WebhookRetryPolicy>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

/// Response body for `POST /webhooks/{id}/rotate-secret`.
#[derive(Debug, Serialize)]
pub struct RotatedSecretResponse {
    /// The new secret, shown exactly once. The previous secret keeps
    /// verifying signatures for a short grace period.
    pub secret: String,
}

/// `POST /webhooks` handler.
pub async fn create_webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateWebhookRequest>,
) -> Result<(StatusCode, Json<CreatedWebhookResponse>), ApiError> {
    let owner = owner_from_headers(&headers)?;
    let ctx = RequestContext::new(owner.clone(), "webhooks");

    let registry = state.registry();
    let created = state
        .pipeline()
        .run(&ctx, state.webhooks_policy(), || async {
            Ok(registry
                .create(
                    &owner,
                    CreateWebhook {
                        url: request.url,
                        events: request.events,
                        headers: request.headers,
                        retry_policy: request.retry_policy,
                    },
                )
                .await?)
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreatedWebhookResponse {
            webhook: created.webhook,
            secret: created.secret,
        }),
    ))
}

/// `GET /webhooks` handler.
pub async fn list_webhooks_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Webhook>>, ApiError> {
    let owner = owner_from_headers(&headers)?;
    Ok(Json(state.registry().list(&owner).await))
}

/// `GET /webhooks/{id}` handler.
pub async fn get_webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Webhook>, ApiError> {
    let owner = owner_from_headers(&headers)?;
    let webhook = state
        .registry()
        .get(&owner, WebhookId::from_uuid(id))
        .await?;
    Ok(Json(webhook))
}

/// `PUT /webhooks/{id}` handler.
pub async fn update_webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateWebhookRequest>,
) -> Result<Json<Webhook>, ApiError> {
    let owner = owner_from_headers(&headers)?;
    let ctx = RequestContext::new(owner.clone(), "webhooks");

    let registry = state.registry();
    let webhook = state
        .pipeline()
        .run(&ctx, state.webhooks_policy(), || async {
            Ok(registry
                .update(
                    &owner,
                    WebhookId::from_uuid(id),
                    UpdateWebhook {
                        url: request.url,
                        events: request.events,
                        headers: request.headers,
                        retry_policy: request.retry_policy,
                        is_active: request.is_active,
                    },
                )
                .await?)
        })
        .await?;

    Ok(Json(webhook))
}

/// `DELETE /webhooks/{id}` handler.
pub async fn delete_webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let owner = owner_from_headers(&headers)?;
    let ctx = RequestContext::new(owner.clone(), "webhooks");

    let registry = state.registry();
    state
        .pipeline()
        .run(&ctx, state.webhooks_policy(), || async {
            Ok(registry.delete(&owner, WebhookId::from_uuid(id)).await?)
        })
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

/// `POST /webhooks/{id}/rotate-secret` handler.
pub async fn rotate_secret_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<RotatedSecretResponse>, ApiError> {
    let owner = owner_from_headers(&headers)?;
    let ctx = RequestContext::new(owner.clone(), "webhooks");

    let registry = state.registry();
    let secret = state
        .pipeline()
        .run(&ctx, state.webhooks_policy(), || async {
            Ok(registry
                .rotate_secret(&owner, WebhookId::from_uuid(id))
                .await?)
        })
        .await?;

    Ok(Json(RotatedSecretResponse { secret }))
}

/// `GET /webhooks/{id}/deliveries` handler: recent delivery records for
/// debugging a receiver.
pub async fn list_deliveries_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<WebhookDelivery>>, ApiError> {
    let owner = owner_from_headers(&headers)?;
    let webhook_id = WebhookId::from_uuid(id);

    // Ownership check before exposing delivery history.
    state.registry().get(&owner, webhook_id).await?;

    Ok(Json(state.ledger().for_webhook(webhook_id).await))
}
