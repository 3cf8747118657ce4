//! Priority job dispatch with retry, batching, and completion fan-out.
//!
//! # Module Structure
//!
//! - [`types`]: jobs, priorities, retry policies
//! - [`queue`]: the durable queue collaborator, the in-memory priority
//!   queue, and the driver task that runs jobs through an opaque processor
//! - [`batch`]: per-item outcome aggregation for batch requests
//! - [`dispatcher`]: the cache-aware enqueue pipeline (single and batch)
//! - [`completion`]: terminal outcomes feeding the cache and webhook events

pub mod batch;
pub mod completion;
pub mod dispatcher;
pub mod queue;
pub mod types;

pub use batch::{BatchFile, BatchItemOutcome, BatchItemStatus, BatchOptions, BatchResult};
pub use completion::EnhancementCompletions;
pub use dispatcher::{
    EnhanceOutcome, EnhancementJobPayload, JobDispatcher, MAX_BATCH_CONCURRENCY, MAX_BATCH_SIZE,
};
pub use queue::{CompletionSink, InMemoryJobQueue, JobProcessor, JobQueue, QueueError, run_queue_driver};
pub use types::{Job, JobBackoff, JobPriority, JobRetryPolicy, JobSpec, JobState};
