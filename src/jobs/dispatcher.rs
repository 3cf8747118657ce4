//! Priority job dispatch with cache short-circuiting and batch fan-out.
//!
//! The dispatcher sits between the API handlers and the queue collaborator.
//! Single enhancements check the document cache before paying for new work;
//! batches run the same per-item pipeline concurrently with bounded fan-out,
//! capturing per-item failures instead of raising them (unless the caller
//! opted into stop-on-error).

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::StreamExt;
use futures::stream;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, DocumentCache};
use crate::error::ApiError;
use crate::types::{DocumentId, OwnerId};
use crate::webhooks::{EventKind, WebhookManager};

use super::batch::{BatchFile, BatchItemOutcome, BatchItemStatus, BatchOptions, BatchResult};
use super::queue::JobQueue;
use super::types::{JobPriority, JobSpec};

/// Maximum files per batch request.
pub const MAX_BATCH_SIZE: usize = 10;

/// Concurrent per-item pipelines per batch: the batch size, capped here.
pub const MAX_BATCH_CONCURRENCY: usize = 10;

/// Maximum file size accepted for enhancement.
pub const MAX_FILE_BYTES: usize = 20 * 1024 * 1024;

/// The queue enhancement jobs land on.
const ENHANCE_QUEUE: &str = "enhance";

/// Payload of an enhancement job as handed to the queue collaborator.
///
/// Carries everything the completion hook needs to store the cache entry
/// and fire webhook events without re-reading request state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhancementJobPayload {
    pub owner_id: OwnerId,
    pub document_id: DocumentId,
    pub file_name: String,
    pub content_base64: String,
}

impl EnhancementJobPayload {
    pub fn content(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(&self.content_base64)
    }
}

/// Outcome of a single enhancement request.
#[derive(Debug)]
pub enum EnhanceOutcome {
    /// New work was enqueued.
    Queued {
        job_id: crate::types::JobId,
        document_id: DocumentId,
    },
    /// A prior result for near-duplicate content was reused.
    Cached { entry: CacheEntry },
}

/// Dispatches enhancement work to the queue collaborator.
pub struct JobDispatcher {
    queue: Arc<dyn JobQueue>,
    cache: Arc<DocumentCache>,
    webhooks: Arc<WebhookManager>,
}

impl JobDispatcher {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        cache: Arc<DocumentCache>,
        webhooks: Arc<WebhookManager>,
    ) -> Self {
        JobDispatcher {
            queue,
            cache,
            webhooks,
        }
    }

    /// Runs the single-file pipeline: validate, check the cache, enqueue on
    /// a miss.
    pub async fn enhance(
        &self,
        owner: &OwnerId,
        file_name: &str,
        content: &[u8],
        priority: JobPriority,
    ) -> Result<EnhanceOutcome, ApiError> {
        validate_file(file_name, content)?;

        if let Some(entry) = self
            .cache
            .lookup(owner, content)
            .await
            .map_err(|error| ApiError::Internal(error.to_string()))?
        {
            debug!(owner = %owner, file_name, "serving enhancement from cache");
            return Ok(EnhanceOutcome::Cached { entry });
        }

        let document_id = DocumentId::new();
        let payload = EnhancementJobPayload {
            owner_id: owner.clone(),
            document_id,
            file_name: file_name.to_string(),
            content_base64: BASE64.encode(content),
        };
        let spec = JobSpec::new(
            ENHANCE_QUEUE,
            serde_json::to_value(&payload).map_err(|error| ApiError::Internal(error.to_string()))?,
        )
        .with_priority(priority);

        let job_id = self
            .queue
            .enqueue(spec)
            .await
            .map_err(|error| ApiError::EnqueueFailed(error.to_string()))?;

        info!(owner = %owner, job_id = %job_id, document_id = %document_id, "enhancement enqueued");
        Ok(EnhanceOutcome::Queued {
            job_id,
            document_id,
        })
    }

    /// Runs the per-item pipeline over a batch.
    ///
    /// Items run concurrently with fan-out bounded by the batch size (capped
    /// at [`MAX_BATCH_CONCURRENCY`]); no ordering is guaranteed between item
    /// completions. With `stop_on_error` the items run sequentially instead,
    /// and the first failure aborts the remainder unprocessed.
    pub async fn enhance_batch(
        &self,
        owner: &OwnerId,
        files: Vec<BatchFile>,
        options: BatchOptions,
    ) -> Result<BatchResult, ApiError> {
        if files.is_empty() {
            return Err(ApiError::validation("batch must contain at least one file"));
        }
        if files.len() > MAX_BATCH_SIZE {
            return Err(ApiError::validation(format!(
                "batch size {} exceeds the maximum of {MAX_BATCH_SIZE}",
                files.len()
            )));
        }

        let total_files = files.len();
        let outcomes = if options.stop_on_error {
            let mut outcomes = Vec::with_capacity(total_files);
            for (index, file) in files.into_iter().enumerate() {
                let outcome = self.process_item(owner, index, file).await;
                let failed = matches!(outcome.status, BatchItemStatus::Failed { .. });
                outcomes.push(outcome);
                if failed {
                    debug!(owner = %owner, index, "stop_on_error: aborting batch");
                    break;
                }
            }
            outcomes
        } else {
            let concurrency = total_files.min(MAX_BATCH_CONCURRENCY);
            stream::iter(files.into_iter().enumerate())
                .map(|(index, file)| self.process_item(owner, index, file))
                .buffer_unordered(concurrency)
                .collect()
                .await
        };

        let result = BatchResult::from_outcomes(total_files, outcomes);

        if result.batch_failed {
            // Wholesale failure is the only batch-level event; partial
            // failures are reported per item only.
            warn!(owner = %owner, batch_id = %result.batch_id, "entire batch failed");
            self.webhooks
                .queue_delivery(
                    owner,
                    EventKind::BatchFailed,
                    serde_json::json!({
                        "batch_id": result.batch_id,
                        "total_files": result.total_files,
                        "failed_files": result.failed_files,
                    }),
                )
                .await;
        }

        Ok(result)
    }

    /// One item's pipeline: failures are captured in the outcome, never
    /// raised.
    async fn process_item(&self, owner: &OwnerId, index: usize, file: BatchFile) -> BatchItemOutcome {
        let status = match self
            .enhance(owner, &file.file_name, &file.content, JobPriority::Normal)
            .await
        {
            Ok(EnhanceOutcome::Queued { job_id, .. }) => BatchItemStatus::Queued { job_id },
            Ok(EnhanceOutcome::Cached { entry }) => BatchItemStatus::Cached { entry },
            Err(error) => BatchItemStatus::Failed {
                error: error.to_string(),
            },
        };

        BatchItemOutcome {
            index,
            file_name: file.file_name,
            status,
        }
    }
}

fn validate_file(file_name: &str, content: &[u8]) -> Result<(), ApiError> {
    if file_name.trim().is_empty() {
        return Err(ApiError::validation("file_name is required"));
    }
    if content.is_empty() {
        return Err(ApiError::validation("file content is empty"));
    }
    if content.len() > MAX_FILE_BYTES {
        return Err(ApiError::validation(format!(
            "file exceeds the maximum size of {MAX_FILE_BYTES} bytes"
        )));
    }
    Ok(())
}
