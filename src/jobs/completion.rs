//! Terminal job outcomes: cache population and webhook events.
//!
//! The completion hook is where a finished job turns into caller-visible
//! effects: a successful enhancement stores its result in the document cache
//! (so near-duplicate uploads reuse it) and fires `enhancement.completed`; a
//! permanently failed job fires `enhancement.failed`. Everything here is
//! best-effort relative to the job itself: a cache or fan-out problem is
//! logged, never allowed to fail the driver.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;

use crate::cache::{CacheEntry, DocumentCache};
use crate::types::EnhancementId;
use crate::webhooks::{EventKind, WebhookManager};

use super::dispatcher::EnhancementJobPayload;
use super::queue::CompletionSink;
use super::types::Job;

/// Wires terminal enhancement outcomes into the cache and webhook fan-out.
pub struct EnhancementCompletions {
    cache: Arc<DocumentCache>,
    webhooks: Arc<WebhookManager>,
}

impl EnhancementCompletions {
    pub fn new(cache: Arc<DocumentCache>, webhooks: Arc<WebhookManager>) -> Self {
        EnhancementCompletions { cache, webhooks }
    }

    fn parse_payload(job: &Job) -> Option<EnhancementJobPayload> {
        match serde_json::from_value(job.spec.payload.clone()) {
            Ok(payload) => Some(payload),
            Err(error) => {
                warn!(job_id = %job.id, %error, "job payload is not an enhancement payload");
                None
            }
        }
    }
}

#[async_trait]
impl CompletionSink for EnhancementCompletions {
    async fn on_completed(&self, job: &Job, result: serde_json::Value) {
        let Some(payload) = Self::parse_payload(job) else {
            return;
        };

        let result_url = result
            .get("result_url")
            .and_then(|value| value.as_str())
            .unwrap_or_default()
            .to_string();
        let enhancement_id = EnhancementId::new();

        // First successful processing populates the cache; a decode problem
        // only costs future cache hits.
        match payload.content() {
            Ok(content) => {
                let entry = CacheEntry {
                    document_id: payload.document_id,
                    enhancement_id,
                    result_url: result_url.clone(),
                    metadata: HashMap::from([(
                        "file_name".to_string(),
                        payload.file_name.clone(),
                    )]),
                    created_at: Utc::now(),
                };
                if let Err(error) = self.cache.store(&payload.owner_id, &content, entry).await {
                    warn!(job_id = %job.id, %error, "failed to store cache entry");
                }
            }
            Err(error) => {
                warn!(job_id = %job.id, %error, "job payload content is not valid base64");
            }
        }

        self.webhooks
            .queue_delivery(
                &payload.owner_id,
                EventKind::EnhancementCompleted,
                serde_json::json!({
                    "document_id": payload.document_id,
                    "enhancement_id": enhancement_id,
                    "file_name": payload.file_name,
                    "result_url": result_url,
                }),
            )
            .await;
    }

    async fn on_failed(&self, job: &Job, error: &str) {
        let Some(payload) = Self::parse_payload(job) else {
            return;
        };

        self.webhooks
            .queue_delivery(
                &payload.owner_id,
                EventKind::EnhancementFailed,
                serde_json::json!({
                    "document_id": payload.document_id,
                    "file_name": payload.file_name,
                    "error": error,
                }),
            )
            .await;
    }
}
