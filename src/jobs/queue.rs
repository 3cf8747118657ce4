//! Durable queue collaborator and the in-memory implementation.
//!
//! The dispatcher hands jobs to a [`JobQueue`], assumed durable and
//! at-least-once in production (a managed job queue). [`InMemoryJobQueue`]
//! provides the single-node and test implementation: a binary heap ordered by
//! priority rank, FIFO within the same priority via sequence numbers.
//!
//! [`run_queue_driver`] is the owned background task that pulls jobs off the
//! in-memory queue, runs them through an opaque [`JobProcessor`], applies the
//! per-job retry policy, and reports terminal outcomes to a
//! [`CompletionSink`]. Job execution itself (the AI pipeline) is not this
//! crate's concern; the processor is the seam it plugs into.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::types::JobId;

use super::types::{Job, JobSpec, JobState};

/// Errors raised by the queue collaborator.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue backend rejected or lost the job.
    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// The durable queue collaborator.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueues a job, returning its assigned ID.
    async fn enqueue(&self, spec: JobSpec) -> Result<JobId>;

    /// Reads a job's current state, or `None` for unknown IDs.
    async fn state(&self, id: JobId) -> Result<Option<JobState>>;
}

/// An entry in the priority heap.
///
/// Ordered by priority rank (lower rank first), then by sequence number
/// (FIFO within the same priority level).
#[derive(Debug, Clone)]
struct HeapEntry {
    id: JobId,
    rank: u8,
    sequence: u64,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.rank == other.rank && self.sequence == other.sequence
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: reverse both comparisons so the lowest
        // rank, then the lowest sequence number, surfaces first.
        match other.rank.cmp(&self.rank) {
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            ordering => ordering,
        }
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    heap: BinaryHeap<HeapEntry>,
    jobs: HashMap<JobId, Job>,
    next_sequence: u64,
}

/// In-process priority job queue.
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    inner: Mutex<QueueInner>,
    /// Wakes the driver when work arrives.
    notify: Notify,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of jobs waiting to run.
    pub fn waiting(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").heap.len()
    }

    /// Pops the highest-priority waiting job and marks it active.
    pub fn dequeue(&self) -> Option<Job> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let entry = inner.heap.pop()?;
        let job = inner.jobs.get_mut(&entry.id)?;
        job.state = JobState::Active;
        job.attempt += 1;
        Some(job.clone())
    }

    /// Puts a failed job back on the heap for another attempt.
    pub fn requeue(&self, id: JobId) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let rank = match inner.jobs.get_mut(&id) {
            Some(job) => {
                job.state = JobState::Waiting;
                job.spec.priority.rank()
            }
            None => return,
        };
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.heap.push(HeapEntry { id, rank, sequence });
        drop(inner);
        self.notify.notify_one();
    }

    /// Records a terminal state for a job.
    pub fn finish(&self, id: JobId, state: JobState) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        if let Some(job) = inner.jobs.get_mut(&id) {
            job.state = state;
        }
    }

    /// Waits until the queue is notified of new work.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, spec: JobSpec) -> Result<JobId> {
        let id = JobId::new();
        let mut inner = self.inner.lock().expect("queue lock poisoned");

        let entry = HeapEntry {
            id,
            rank: spec.priority.rank(),
            sequence: inner.next_sequence,
        };
        inner.next_sequence += 1;
        inner.jobs.insert(id, Job::new(id, spec));
        inner.heap.push(entry);
        drop(inner);

        self.notify.notify_one();
        Ok(id)
    }

    async fn state(&self, id: JobId) -> Result<Option<JobState>> {
        let inner = self.inner.lock().expect("queue lock poisoned");
        Ok(inner.jobs.get(&id).map(|job| job.state.clone()))
    }
}

/// The opaque operation a job runs: succeeds with a JSON result or fails
/// with a message. The enhancement pipeline implements this outside the
/// resilience core.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &Job) -> std::result::Result<serde_json::Value, String>;
}

/// Receives terminal job outcomes (to store cache entries and fire webhook
/// events). Implementations must not fail the driver.
#[async_trait]
pub trait CompletionSink: Send + Sync {
    async fn on_completed(&self, job: &Job, result: serde_json::Value);
    async fn on_failed(&self, job: &Job, error: &str);
}

/// Runs the in-memory queue until cancelled.
///
/// Jobs run serially in arrival-priority order. A failed job with attempts
/// remaining is re-enqueued after its backoff delay (the requeue happens on
/// a spawned timer so the driver keeps draining other jobs); a failed job
/// with no attempts left is terminal and reported to the sink.
pub async fn run_queue_driver(
    queue: Arc<InMemoryJobQueue>,
    processor: Arc<dyn JobProcessor>,
    completions: Arc<dyn CompletionSink>,
    cancel: CancellationToken,
) {
    info!("job queue driver started");

    loop {
        let Some(job) = queue.dequeue() else {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = queue.notified() => continue,
            }
        };

        debug!(job_id = %job.id, queue = %job.spec.queue, attempt = job.attempt, "running job");

        match processor.process(&job).await {
            Ok(result) => {
                queue.finish(job.id, JobState::Completed);
                completions.on_completed(&job, result).await;
            }
            Err(message) => {
                if job.attempts_remaining() {
                    let delay = job.spec.retry.backoff.delay_for_attempt(job.attempt - 1);
                    warn!(
                        job_id = %job.id,
                        attempt = job.attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "job failed, scheduling retry"
                    );
                    let queue = queue.clone();
                    let id = job.id;
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        queue.requeue(id);
                    });
                } else {
                    error!(
                        job_id = %job.id,
                        attempts = job.attempt,
                        error = %message,
                        "job failed permanently"
                    );
                    queue.finish(job.id, JobState::Failed);
                    completions.on_failed(&job, &message).await;
                }
            }
        }
    }

    info!("job queue driver stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{JobBackoff, JobPriority, JobRetryPolicy};
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

    fn spec(queue: &str, priority: JobPriority) -> JobSpec {
        JobSpec::new(queue, serde_json::json!({ "queue": queue })).with_priority(priority)
    }

    #[tokio::test]
    async fn dequeue_empty_returns_none() {
        let queue = InMemoryJobQueue::new();
        assert!(queue.dequeue().is_none());
    }

    #[tokio::test]
    async fn high_priority_dequeued_first() {
        let queue = InMemoryJobQueue::new();

        let low = queue.enqueue(spec("a", JobPriority::Low)).await.unwrap();
        let normal = queue.enqueue(spec("b", JobPriority::Normal)).await.unwrap();
        let high = queue.enqueue(spec("c", JobPriority::High)).await.unwrap();

        assert_eq!(queue.dequeue().unwrap().id, high);
        assert_eq!(queue.dequeue().unwrap().id, normal);
        assert_eq!(queue.dequeue().unwrap().id, low);
    }

    #[tokio::test]
    async fn fifo_within_same_priority() {
        let queue = InMemoryJobQueue::new();

        let first = queue.enqueue(spec("a", JobPriority::Normal)).await.unwrap();
        let second = queue.enqueue(spec("b", JobPriority::Normal)).await.unwrap();
        let third = queue.enqueue(spec("c", JobPriority::Normal)).await.unwrap();

        assert_eq!(queue.dequeue().unwrap().id, first);
        assert_eq!(queue.dequeue().unwrap().id, second);
        assert_eq!(queue.dequeue().unwrap().id, third);
    }

    #[tokio::test]
    async fn dequeue_marks_active_and_counts_attempt() {
        let queue = InMemoryJobQueue::new();
        let id = queue.enqueue(spec("a", JobPriority::Normal)).await.unwrap();
        assert_eq!(queue.state(id).await.unwrap(), Some(JobState::Waiting));

        let job = queue.dequeue().unwrap();
        assert_eq!(job.attempt, 1);
        assert_eq!(queue.state(id).await.unwrap(), Some(JobState::Active));
    }

    #[tokio::test]
    async fn unknown_job_has_no_state() {
        let queue = InMemoryJobQueue::new();
        assert_eq!(queue.state(JobId::new()).await.unwrap(), None);
    }

    struct FlakyProcessor {
        calls: AtomicU32,
        succeed_on: u32,
    }

    #[async_trait]
    impl JobProcessor for FlakyProcessor {
        async fn process(&self, _job: &Job) -> std::result::Result<serde_json::Value, String> {
            let call = self.calls.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            if call >= self.succeed_on {
                Ok(serde_json::json!({ "ok": true }))
            } else {
                Err("transient".to_string())
            }
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        completed: AtomicU32,
        failed: AtomicU32,
    }

    #[async_trait]
    impl CompletionSink for RecordingSink {
        async fn on_completed(&self, _job: &Job, _result: serde_json::Value) {
            self.completed.fetch_add(1, AtomicOrdering::SeqCst);
        }

        async fn on_failed(&self, _job: &Job, _error: &str) {
            self.failed.fetch_add(1, AtomicOrdering::SeqCst);
        }
    }

    /// A job that fails twice with max_attempts=3 still completes, after the
    /// backoff delays elapse.
    #[tokio::test(start_paused = true)]
    async fn driver_retries_until_success() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let processor = Arc::new(FlakyProcessor {
            calls: AtomicU32::new(0),
            succeed_on: 3,
        });
        let sink = Arc::new(RecordingSink::default());
        let cancel = CancellationToken::new();

        let driver = tokio::spawn(run_queue_driver(
            queue.clone(),
            processor.clone(),
            sink.clone(),
            cancel.clone(),
        ));

        let id = queue
            .enqueue(JobSpec::new("enhance", serde_json::json!({})).with_retry(JobRetryPolicy {
                max_attempts: 3,
                backoff: JobBackoff::Exponential { delay_ms: 100 },
            }))
            .await
            .unwrap();

        // Paused time auto-advances through the backoff sleeps.
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
        loop {
            if queue.state(id).await.unwrap() == Some(JobState::Completed) {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "job never completed");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        assert_eq!(processor.calls.load(AtomicOrdering::SeqCst), 3);
        assert_eq!(sink.completed.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(sink.failed.load(AtomicOrdering::SeqCst), 0);

        cancel.cancel();
        driver.await.unwrap();
    }

    /// A job that always fails is terminal after max_attempts and reported
    /// exactly once.
    #[tokio::test(start_paused = true)]
    async fn driver_marks_failed_after_exhaustion() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let processor = Arc::new(FlakyProcessor {
            calls: AtomicU32::new(0),
            succeed_on: u32::MAX,
        });
        let sink = Arc::new(RecordingSink::default());
        let cancel = CancellationToken::new();

        let driver = tokio::spawn(run_queue_driver(
            queue.clone(),
            processor.clone(),
            sink.clone(),
            cancel.clone(),
        ));

        let id = queue
            .enqueue(JobSpec::new("enhance", serde_json::json!({})).with_retry(JobRetryPolicy {
                max_attempts: 3,
                backoff: JobBackoff::Exponential { delay_ms: 100 },
            }))
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
        loop {
            if queue.state(id).await.unwrap() == Some(JobState::Failed) {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "job never failed");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        assert_eq!(processor.calls.load(AtomicOrdering::SeqCst), 3);
        assert_eq!(sink.failed.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(sink.completed.load(AtomicOrdering::SeqCst), 0);

        cancel.cancel();
        driver.await.unwrap();
    }
}
