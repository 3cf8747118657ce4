//! Background delivery worker.
//!
//! One owned tokio task performs all delivery attempts. New deliveries
//! arrive on a channel in creation order (so one webhook's deliveries for an
//! event are never reordered relative to creation); failed attempts wait out
//! their backoff delay in an internal schedule and re-run when due.
//!
//! Delivery is fire-and-forget relative to the request that triggered the
//! event: outcomes only ever touch the delivery ledger and the log. When a
//! delivery exhausts its attempts it is logged and left terminal; nothing
//! propagates back to the caller.
//!
//! Deactivating a webhook stops *future* deliveries from being queued (the
//! manager filters on `is_active`) but does not cancel in-flight retries.
//! Hard-deleting the webhook does: the worker checks the registry before
//! every attempt and drops deliveries whose webhook is gone.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::delivery::{DeliveryLedger, DeliveryStatus, WebhookDelivery, build_outbound_request};
use super::registry::{DeliveryTarget, WebhookRegistry};
use super::transport::DeliveryTransport;

/// Channel buffer for newly queued deliveries.
const DELIVERY_CHANNEL_BUFFER: usize = 256;

/// One unit of work for the worker: a delivery and the snapshot of its
/// webhook taken when the event fired.
#[derive(Debug)]
pub struct DeliveryJob {
    pub target: DeliveryTarget,
    pub delivery: WebhookDelivery,
}

/// A retry waiting for its backoff delay to elapse.
struct ScheduledRetry {
    due: Instant,
    job: DeliveryJob,
}

impl PartialEq for ScheduledRetry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due
    }
}

impl Eq for ScheduledRetry {}

impl PartialOrd for ScheduledRetry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledRetry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest due time
        // surfaces first.
        other.due.cmp(&self.due)
    }
}

/// Handle to the running delivery worker.
pub struct DeliveryWorkerHandle {
    tx: mpsc::Sender<DeliveryJob>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl DeliveryWorkerHandle {
    /// Hands a delivery to the worker. Returns false if the worker has shut
    /// down (the delivery stays in the ledger as pending; a restart would
    /// re-drive it in a deployment with durable delivery records).
    pub async fn submit(&self, job: DeliveryJob) -> bool {
        self.tx.send(job).await.is_ok()
    }

    /// Stops the worker and waits for it to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Spawns the delivery worker task.
pub fn spawn_delivery_worker(
    registry: Arc<WebhookRegistry>,
    ledger: Arc<DeliveryLedger>,
    transport: Arc<dyn DeliveryTransport>,
    cancel: CancellationToken,
) -> DeliveryWorkerHandle {
    let (tx, rx) = mpsc::channel(DELIVERY_CHANNEL_BUFFER);
    let worker_cancel = cancel.clone();

    let task = tokio::spawn(async move {
        run_worker(registry, ledger, transport, rx, worker_cancel).await;
    });

    DeliveryWorkerHandle { tx, cancel, task }
}

async fn run_worker(
    registry: Arc<WebhookRegistry>,
    ledger: Arc<DeliveryLedger>,
    transport: Arc<dyn DeliveryTransport>,
    mut rx: mpsc::Receiver<DeliveryJob>,
    cancel: CancellationToken,
) {
    info!("delivery worker started");
    let mut schedule: BinaryHeap<ScheduledRetry> = BinaryHeap::new();
    let mut channel_open = true;

    loop {
        if !channel_open && schedule.is_empty() {
            // All senders dropped and every scheduled retry has resolved.
            break;
        }
        let next_due = schedule.peek().map(|scheduled| scheduled.due);

        tokio::select! {
            _ = cancel.cancelled() => break,

            job = rx.recv(), if channel_open => {
                match job {
                    Some(job) => {
                        attempt_delivery(&registry, &ledger, transport.as_ref(), job, &mut schedule)
                            .await;
                    }
                    None => channel_open = false,
                }
            }

            _ = sleep_until_due(next_due), if next_due.is_some() => {
                if let Some(scheduled) = schedule.pop() {
                    attempt_delivery(
                        &registry,
                        &ledger,
                        transport.as_ref(),
                        scheduled.job,
                        &mut schedule,
                    )
                    .await;
                }
            }
        }
    }

    if !schedule.is_empty() {
        warn!(
            pending_retries = schedule.len(),
            "delivery worker stopping with retries still scheduled"
        );
    }
    info!("delivery worker stopped");
}

async fn sleep_until_due(due: Option<Instant>) {
    match due {
        Some(due) => tokio::time::sleep_until(due).await,
        // The select arm is disabled when nothing is scheduled.
        None => std::future::pending().await,
    }
}

/// Performs one delivery attempt and schedules the retry on failure.
async fn attempt_delivery(
    registry: &WebhookRegistry,
    ledger: &DeliveryLedger,
    transport: &dyn DeliveryTransport,
    mut job: DeliveryJob,
    schedule: &mut BinaryHeap<ScheduledRetry>,
) {
    let delivery_id = job.delivery.id;
    let webhook_id = job.delivery.webhook_id;

    // Hard-deleted webhooks cancel their in-flight retries.
    if !registry.exists(webhook_id).await {
        debug!(
            delivery_id = %delivery_id,
            webhook_id = %webhook_id,
            "dropping delivery for deleted webhook"
        );
        ledger
            .update(delivery_id, |delivery| {
                delivery.status = DeliveryStatus::Exhausted;
                delivery.last_error = Some("webhook deleted".to_string());
                delivery.next_retry_at = None;
            })
            .await;
        return;
    }

    let timestamp_ms = Utc::now().timestamp_millis().max(0) as u64;
    let request = build_outbound_request(&job.target, &job.delivery, timestamp_ms);

    let outcome = transport.deliver(&request).await;
    let failure = match outcome {
        Ok(status) if (200..300).contains(&status) => {
            info!(
                delivery_id = %delivery_id,
                webhook_id = %webhook_id,
                attempt = job.delivery.attempt + 1,
                "delivery succeeded"
            );
            ledger
                .update(delivery_id, |delivery| {
                    delivery.status = DeliveryStatus::Delivered;
                    delivery.attempt += 1;
                    delivery.next_retry_at = None;
                    delivery.last_error = None;
                })
                .await;
            return;
        }
        Ok(status) => format!("receiver returned HTTP {status}"),
        Err(error) => error.to_string(),
    };

    // Failed attempt: compute the backoff from the 0-indexed attempt number,
    // then advance the attempt count and decide between retry and
    // exhaustion.
    let failed_attempt = job.delivery.attempt;
    let policy = job.target.retry_policy;
    let delay = policy.delay_for_attempt(failed_attempt);
    let attempts_made = failed_attempt + 1;

    if attempts_made >= policy.max_attempts {
        // Terminal. Logged, never surfaced to the original caller.
        warn!(
            delivery_id = %delivery_id,
            webhook_id = %webhook_id,
            attempts = attempts_made,
            error = %failure,
            "delivery exhausted all attempts"
        );
        ledger
            .update(delivery_id, |delivery| {
                delivery.status = DeliveryStatus::Exhausted;
                delivery.attempt = attempts_made;
                delivery.next_retry_at = None;
                delivery.last_error = Some(failure);
            })
            .await;
        return;
    }

    debug!(
        delivery_id = %delivery_id,
        webhook_id = %webhook_id,
        attempt = attempts_made,
        delay_ms = delay.as_millis() as u64,
        error = %failure,
        "delivery failed, scheduling retry"
    );

    let next_retry_at = Utc::now()
        + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
    ledger
        .update(delivery_id, |delivery| {
            delivery.status = DeliveryStatus::Retrying;
            delivery.attempt = attempts_made;
            delivery.next_retry_at = Some(next_retry_at);
            delivery.last_error = Some(failure);
        })
        .await;

    job.delivery.attempt = attempts_made;
    schedule.push(ScheduledRetry {
        due: Instant::now() + delay,
        job,
    });
}
