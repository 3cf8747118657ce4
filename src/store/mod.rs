//! Shared state store collaborator.
//!
//! The rate limiter's window counters and the circuit breaker's per-operation
//! states are the only truly shared mutable state in the core, and both must
//! be coordinated across process instances. This module defines the narrow
//! interface they coordinate through: atomic increment for counters and
//! compare-and-swap for state records. Read-then-write is never part of the
//! contract; every mutation is a single atomic operation on the store.
//!
//! Production deployments back this with a shared store (e.g., Redis:
//! `INCR`+`EXPIRE`, `SET ... NX`/`WATCH`). [`MemoryStore`] provides the
//! single-node and test implementation.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStore;

/// Errors raised by the shared store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The stored value could not be interpreted as required (e.g., a counter
    /// key holding non-numeric data).
    #[error("corrupt value at key {key}: {reason}")]
    CorruptValue { key: String, reason: String },

    /// The backing store is unreachable or failed.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// A shared key-value store with atomic counters and compare-and-swap.
///
/// All operations are atomic with respect to concurrent callers, including
/// callers in other process instances when backed by an external store.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Atomically increments the counter at `key` and returns the
    /// post-increment value. Creates the counter at 1 with the given TTL if
    /// it does not exist; an existing counter's TTL is left untouched.
    async fn incr_and_get(&self, key: &str, ttl: Duration) -> Result<u64>;

    /// Atomically decrements the counter at `key`, saturating at zero.
    /// Returns the post-decrement value. Missing keys are treated as zero.
    async fn decr(&self, key: &str) -> Result<u64>;

    /// Reads the value at `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Writes `value` at `key`, replacing any existing value. `ttl = None`
    /// means no expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Atomically replaces the value at `key` with `new`, but only if the
    /// current value equals `expected` (`None` = key absent). Returns whether
    /// the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool>;
}
