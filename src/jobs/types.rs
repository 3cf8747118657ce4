//! Job types and retry policies.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::JobId;

/// Job priority. Lower numeric rank is dequeued first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    High,
    #[default]
    Normal,
    Low,
}

impl JobPriority {
    /// The numeric rank used for queue ordering (HIGH=1, NORMAL=2, LOW=3).
    pub fn rank(&self) -> u8 {
        match self {
            JobPriority::High => 1,
            JobPriority::Normal => 2,
            JobPriority::Low => 3,
        }
    }
}

/// Job lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Queued, waiting to be picked up.
    Waiting,
    /// Currently being executed.
    Active,
    /// Terminal: completed successfully.
    Completed,
    /// Terminal: failed after exhausting all attempts.
    Failed,
}

impl JobState {
    /// Returns true for terminal states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Delay strategy between job attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobBackoff {
    /// `delay_ms * 2^attempt` between retries.
    Exponential { delay_ms: u64 },
}

impl JobBackoff {
    /// Computes the delay before re-running a job that has failed
    /// `attempt + 1` times (0-indexed attempt).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            JobBackoff::Exponential { delay_ms } => {
                let factor = 2u64.saturating_pow(attempt);
                Duration::from_millis(delay_ms.saturating_mul(factor))
            }
        }
    }
}

/// Retry policy attached to every job at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub backoff: JobBackoff,
}

impl Default for JobRetryPolicy {
    fn default() -> Self {
        JobRetryPolicy {
            max_attempts: 3,
            backoff: JobBackoff::Exponential { delay_ms: 2_000 },
        }
    }
}

/// Everything needed to enqueue one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// The named queue the job belongs to (e.g., "enhance", "export").
    pub queue: String,
    pub payload: serde_json::Value,
    pub priority: JobPriority,
    pub retry: JobRetryPolicy,
}

impl JobSpec {
    pub fn new(queue: impl Into<String>, payload: serde_json::Value) -> Self {
        JobSpec {
            queue: queue.into(),
            payload,
            priority: JobPriority::default(),
            retry: JobRetryPolicy::default(),
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_retry(mut self, retry: JobRetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// A job as tracked by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub spec: JobSpec,
    /// Attempts already made (0 before the first run).
    pub attempt: u32,
    pub state: JobState,
}

impl Job {
    pub fn new(id: JobId, spec: JobSpec) -> Self {
        Job {
            id,
            spec,
            attempt: 0,
            state: JobState::Waiting,
        }
    }

    /// Whether another attempt is allowed after a failure.
    pub fn attempts_remaining(&self) -> bool {
        self.attempt < self.spec.retry.max_attempts
    }
}
