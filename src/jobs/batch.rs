//! Batch request aggregation.
//!
//! A batch is an ephemeral aggregate: per-file outcomes tagged queued,
//! cached, or failed, plus counts. It is built once per batch request and
//! returned in the response body; it is never persisted. A partial failure
//! is not an error: the caller always receives the full outcome list.

use serde::Serialize;
use uuid::Uuid;

use crate::cache::CacheEntry;
use crate::types::JobId;

/// One file submitted in a batch.
#[derive(Debug, Clone)]
pub struct BatchFile {
    pub file_name: String,
    pub content: Vec<u8>,
}

/// Batch processing options.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOptions {
    /// Abort the batch at the first per-item failure instead of capturing it
    /// and continuing.
    pub stop_on_error: bool,
}

/// The terminal status of one batch item.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchItemStatus {
    /// Work was enqueued for this file.
    Queued { job_id: JobId },
    /// A prior result was reused; no new work.
    Cached { entry: CacheEntry },
    /// The item failed; the error is captured, not raised.
    Failed { error: String },
}

/// One file's outcome within a batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchItemOutcome {
    /// Position in the submitted batch.
    pub index: usize,
    pub file_name: String,
    #[serde(flatten)]
    pub status: BatchItemStatus,
}

/// The aggregate result of one batch request.
#[derive(Debug, Serialize)]
pub struct BatchResult {
    pub batch_id: Uuid,
    /// Files submitted, including any never processed under stop-on-error.
    pub total_files: usize,
    pub queued_files: usize,
    pub cached_files: usize,
    pub failed_files: usize,
    /// True when every submitted file failed: a wholesale batch failure
    /// (still reported in a 200-level response, with per-item detail).
    pub batch_failed: bool,
    pub outcomes: Vec<BatchItemOutcome>,
}

impl BatchResult {
    /// Aggregates per-item outcomes. `total_files` is the submitted count,
    /// which under stop-on-error can exceed the number of outcomes.
    pub fn from_outcomes(total_files: usize, mut outcomes: Vec<BatchItemOutcome>) -> Self {
        outcomes.sort_by_key(|outcome| outcome.index);

        let queued_files = outcomes
            .iter()
            .filter(|outcome| matches!(outcome.status, BatchItemStatus::Queued { .. }))
            .count();
        let cached_files = outcomes
            .iter()
            .filter(|outcome| matches!(outcome.status, BatchItemStatus::Cached { .. }))
            .count();
        let failed_files = outcomes
            .iter()
            .filter(|outcome| matches!(outcome.status, BatchItemStatus::Failed { .. }))
            .count();

        BatchResult {
            batch_id: Uuid::new_v4(),
            total_files,
            queued_files,
            cached_files,
            failed_files,
            batch_failed: total_files > 0 && failed_files == total_files,
            outcomes,
        }
    }
}
