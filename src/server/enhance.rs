//! Enhancement endpoints.
//!
//! `POST /enhance` runs the single-file pipeline: circuit breaker, rate
//! limits, cache lookup, enqueue. When the enhance circuit is open, a cached
//! near-duplicate result (if any) is served as the fallback instead of a
//! bare 503.
//!
//! `POST /enhance/batch` accepts up to ten files and always answers with a
//! per-item outcome list; individual failures are captured in the body, not
//! raised, unless the caller sets `stop_on_error`.

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::cache::CacheEntry;
use crate::error::ApiError;
use crate::jobs::{BatchFile, BatchOptions, BatchResult, EnhanceOutcome, JobPriority};
use crate::pipeline::RequestContext;
use crate::types::{DocumentId, JobId};

use super::{AppState, owner_from_headers};

/// Request body for a single enhancement.
#[derive(Debug, Deserialize)]
pub struct EnhanceRequest {
    pub file_name: String,
    /// Base64-encoded file bytes.
    pub content: String,
    #[serde(default)]
    pub priority: JobPriority,
}

/// Response body for a single enhancement.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EnhanceResponse {
    /// New work was enqueued; completion arrives via polling or webhooks.
    Queued {
        job_id: JobId,
        document_id: DocumentId,
    },
    /// A prior result for near-duplicate content was reused.
    Cached { entry: CacheEntry },
}

/// One file within a batch request.
#[derive(Debug, Deserialize)]
pub struct BatchFileRequest {
    pub file_name: String,
    /// Base64-encoded file bytes.
    pub content: String,
}

/// Request body for a batch enhancement.
#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub files: Vec<BatchFileRequest>,
    #[serde(default)]
    pub stop_on_error: bool,
}

/// `POST /enhance` handler.
pub async fn enhance_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<EnhanceRequest>,
) -> Result<Response, ApiError> {
    let owner = owner_from_headers(&headers)?;
    let ctx = RequestContext::new(owner.clone(), "enhance");

    let content = BASE64
        .decode(&request.content)
        .map_err(|_| ApiError::validation("content is not valid base64"))?;

    let dispatcher = state.dispatcher();
    let cache = state.cache();
    let outcome = state
        .pipeline()
        .run_with_fallback(
            &ctx,
            state.enhance_policy(),
            || async {
                dispatcher
                    .enhance(&owner, &request.file_name, &content, request.priority)
                    .await
            },
            || async {
                // Circuit open: a near-duplicate cached result still answers
                // the request; otherwise the caller gets the 503.
                match cache.lookup(&owner, &content).await {
                    Ok(Some(entry)) => Ok(EnhanceOutcome::Cached { entry }),
                    _ => Err(ApiError::CircuitOpen {
                        operation: "enhance".to_string(),
                    }),
                }
            },
        )
        .await?;

    let response = match outcome {
        EnhanceOutcome::Queued {
            job_id,
            document_id,
        } => (
            StatusCode::ACCEPTED,
            Json(EnhanceResponse::Queued {
                job_id,
                document_id,
            }),
        )
            .into_response(),
        EnhanceOutcome::Cached { entry } => {
            (StatusCode::OK, Json(EnhanceResponse::Cached { entry })).into_response()
        }
    };
    Ok(response)
}

/// `POST /enhance/batch` handler.
///
/// Always answers 200 with per-item outcomes when the batch was admitted;
/// a single bad file among many never turns into an opaque request failure.
pub async fn batch_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<BatchRequest>,
) -> Result<(StatusCode, Json<BatchResult>), ApiError> {
    let owner = owner_from_headers(&headers)?;
    let ctx = RequestContext::new(owner.clone(), "enhance");

    let files: Vec<BatchFile> = request
        .files
        .into_iter()
        .map(|file| BatchFile {
            file_name: file.file_name,
            // Undecodable content becomes an empty file, which the per-item
            // pipeline captures as that item's validation failure rather
            // than failing the whole batch.
            content: BASE64.decode(&file.content).unwrap_or_default(),
        })
        .collect();
    let options = BatchOptions {
        stop_on_error: request.stop_on_error,
    };

    let dispatcher = state.dispatcher();
    let result = state
        .pipeline()
        .run(&ctx, state.enhance_policy(), || async {
            dispatcher.enhance_batch(&owner, files, options).await
        })
        .await?;

    Ok((StatusCode::OK, Json(result)))
}
