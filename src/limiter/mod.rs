//! Fixed-window rate limiting over the shared store.
//!
//! Admission control is a fixed-window counter keyed by
//! `(scope, identity, window_start)`. Each admission atomically increments
//! the counter via the store's `incr_and_get`; if the post-increment count
//! exceeds the limit the request is rejected with the time remaining in the
//! window. Because the increment is a single atomic store operation, the
//! limit holds across concurrent callers and across process instances.
//!
//! # The fixed-window trade-off
//!
//! A burst straddling a window boundary can briefly see up to 2x the limit
//! (the tail of one window plus the head of the next). This is the deliberate
//! price of O(1) accounting per request; a sliding window would need a log of
//! request timestamps per identity.
//!
//! # Provisional admission
//!
//! With `skip_failed_requests` enabled, only requests that ultimately succeed
//! should consume quota. Admission still increments eagerly (the atomic
//! counter is the whole concurrency story), and the post-handler accounting
//! step reverses the increment via [`RateLimiter::forgive`] when the handler
//! fails. This is the one path where admission is provisional.

pub mod window;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;

use crate::store::{SharedStore, StoreError};
use crate::types::OwnerId;

use window::{retry_after_ms, window_key, window_start};

/// Errors raised by the rate limiter.
///
/// Store faults are deliberately separate from rejections: a rejection is a
/// normal outcome, a store fault is an infrastructure problem.
#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("rate limit store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type for limiter operations.
pub type Result<T> = std::result::Result<T, LimiterError>;

/// A per-scope admission quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateQuota {
    /// Maximum admissions per window.
    pub limit: u64,

    /// Window length.
    pub window: Duration,
}

impl RateQuota {
    pub const fn new(limit: u64, window: Duration) -> Self {
        RateQuota { limit, window }
    }
}

/// Proof that one scope admitted one request, carrying enough context to
/// reverse the admission if the handler later fails.
#[derive(Debug, Clone)]
pub struct AdmissionTicket {
    key: String,
}

/// Outcome of an admission check.
#[derive(Debug)]
pub enum Admission {
    /// Admitted by every checked scope.
    Allowed(Vec<AdmissionTicket>),

    /// Rejected by a scope; the first failing scope determines the hint.
    Rejected {
        /// The scope that rejected the request.
        scope: String,
        /// Time until that scope's window resets.
        retry_after: Duration,
    },
}

impl Admission {
    /// Returns true if the request was admitted.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed(_))
    }
}

/// Fixed-window admission control.
///
/// Explicitly constructed and injected; holds no global state beyond the
/// shared store it coordinates through.
pub struct RateLimiter {
    store: Arc<dyn SharedStore>,
    skip_failed_requests: bool,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        RateLimiter {
            store,
            skip_failed_requests: false,
        }
    }

    /// Enables post-handler accounting: failed requests have their admission
    /// reversed so only successes consume quota.
    pub fn with_skip_failed_requests(mut self, skip: bool) -> Self {
        self.skip_failed_requests = skip;
        self
    }

    /// Checks a single scope, admitting or rejecting the request.
    pub async fn admit(
        &self,
        scope: &str,
        identity: &OwnerId,
        quota: RateQuota,
    ) -> Result<Admission> {
        self.admit_all(&[(scope, quota)], identity).await
    }

    /// Checks the request against several independent scopes (e.g., per-user
    /// and per-endpoint); it is admitted only if every scope admits it.
    ///
    /// Scopes are checked in order and the first failing scope determines
    /// `retry_after`. Counters already incremented for earlier scopes are not
    /// reversed on a later scope's rejection: under fixed-window accounting a
    /// rejected request still consumed an admission attempt in the scopes
    /// that passed.
    pub async fn admit_all(
        &self,
        scopes: &[(&str, RateQuota)],
        identity: &OwnerId,
    ) -> Result<Admission> {
        self.admit_all_at(scopes, identity, now_epoch_ms()).await
    }

    /// Clock-explicit variant of [`RateLimiter::admit_all`].
    pub async fn admit_all_at(
        &self,
        scopes: &[(&str, RateQuota)],
        identity: &OwnerId,
        now_ms: u64,
    ) -> Result<Admission> {
        let mut tickets = Vec::with_capacity(scopes.len());

        for (scope, quota) in scopes {
            let window_ms = quota.window.as_millis() as u64;
            let key = window_key(scope, identity.as_str(), window_start(now_ms, window_ms));

            // TTL of 2x the window keeps the counter alive for the whole
            // window regardless of when within it the first request landed,
            // then lets the store evict it.
            let count = self.store.incr_and_get(&key, quota.window * 2).await?;

            if count > quota.limit {
                tracing::debug!(
                    scope = %scope,
                    identity = %identity,
                    count,
                    limit = quota.limit,
                    "rate limit exceeded"
                );
                return Ok(Admission::Rejected {
                    scope: scope.to_string(),
                    retry_after: Duration::from_millis(retry_after_ms(now_ms, window_ms)),
                });
            }

            tickets.push(AdmissionTicket { key });
        }

        Ok(Admission::Allowed(tickets))
    }

    /// Reverses a prior admission after the handler failed.
    ///
    /// No-op unless `skip_failed_requests` is enabled.
    pub async fn forgive(&self, tickets: &[AdmissionTicket]) -> Result<()> {
        if !self.skip_failed_requests {
            return Ok(());
        }
        for ticket in tickets {
            self.store.decr(&ticket.key).await?;
        }
        Ok(())
    }
}

/// Current time as epoch milliseconds.
fn now_epoch_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}
