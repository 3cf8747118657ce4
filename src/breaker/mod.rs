//! Per-operation circuit breaking over the shared store.
//!
//! Each named operation gets a [`CircuitState`] record created lazily on
//! first use. Callers `engage` the breaker before invoking the downstream
//! operation and report the outcome on the returned guard:
//!
//! ```text
//! CLOSED ──(failures reach threshold)──► OPEN
//! OPEN ──(reset timeout elapses, one caller wins the CAS)──► HALF_OPEN
//! HALF_OPEN ──(trial succeeds)──► CLOSED
//! HALF_OPEN ──(trial fails)──► OPEN (timeout restarts)
//! ```
//!
//! Every transition goes through compare-and-swap on the shared store, so
//! the rules hold across concurrent callers and across process instances.
//! In particular the OPEN→HALF_OPEN edge is claimed by exactly the one
//! caller whose CAS succeeds; all others are rejected until the trial
//! resolves.

pub mod state;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::store::{SharedStore, StoreError};

pub use state::CircuitState;

/// Errors raised by the circuit breaker.
#[derive(Debug, Error)]
pub enum BreakerError {
    #[error("circuit state store error: {0}")]
    Store(#[from] StoreError),

    #[error("circuit state codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Result type for breaker operations.
pub type Result<T> = std::result::Result<T, BreakerError>;

/// Per-operation breaker configuration.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,

    /// Cooldown before an open circuit permits a trial call.
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Outcome of engaging the breaker for one call.
pub enum BreakerDecision {
    /// The call may proceed; report the outcome on the guard.
    Pass(BreakerGuard),

    /// The circuit is open (or a trial is already in flight); the downstream
    /// operation must not be invoked.
    Rejected,
}

impl BreakerDecision {
    /// Returns the guard if the call was admitted.
    pub fn into_guard(self) -> Option<BreakerGuard> {
        match self {
            BreakerDecision::Pass(guard) => Some(guard),
            BreakerDecision::Rejected => None,
        }
    }
}

/// Obligation to report the outcome of an admitted call.
///
/// `trial` guards hold the half-open slot: their outcome alone decides
/// whether the circuit closes again or re-opens.
pub struct BreakerGuard {
    store: Arc<dyn SharedStore>,
    key: String,
    config: BreakerConfig,
    trial: bool,
}

/// How many CAS attempts to make before giving up on a contended record.
/// Contention here is a handful of requests racing one small record; a
/// bounded retry avoids an unbounded loop on a misbehaving store.
const CAS_ATTEMPTS: usize = 8;

/// Circuit breaking for named downstream operations.
pub struct CircuitBreaker {
    store: Arc<dyn SharedStore>,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        CircuitBreaker { store }
    }

    /// Engages the breaker for one call to `operation`.
    pub async fn engage(&self, operation: &str, config: BreakerConfig) -> Result<BreakerDecision> {
        self.engage_at(operation, config, now_epoch_ms()).await
    }

    /// Clock-explicit variant of [`CircuitBreaker::engage`].
    pub async fn engage_at(
        &self,
        operation: &str,
        config: BreakerConfig,
        now_ms: u64,
    ) -> Result<BreakerDecision> {
        let key = state_key(operation);

        for _ in 0..CAS_ATTEMPTS {
            let raw = self.store.get(&key).await?;
            let state = parse_state(raw.as_deref())?;

            match state {
                CircuitState::Closed { .. } => {
                    return Ok(BreakerDecision::Pass(self.guard(&key, config, false)));
                }
                CircuitState::Open { .. } | CircuitState::HalfOpen { .. } => {
                    if !state.reset_timeout_elapsed(now_ms, config.reset_timeout) {
                        debug!(operation, "circuit open, rejecting call");
                        return Ok(BreakerDecision::Rejected);
                    }

                    // Cooldown elapsed: try to claim the single trial slot.
                    let claimed = CircuitState::HalfOpen { since_ms: now_ms };
                    if self
                        .swap(&key, raw.as_deref(), &claimed)
                        .await?
                    {
                        info!(operation, "circuit half-open, admitting trial call");
                        return Ok(BreakerDecision::Pass(self.guard(&key, config, true)));
                    }
                    // Lost the race; re-read and re-decide.
                }
            }
        }

        // The record is too contended to read a stable state; fail safe.
        Ok(BreakerDecision::Rejected)
    }

    fn guard(&self, key: &str, config: BreakerConfig, trial: bool) -> BreakerGuard {
        BreakerGuard {
            store: self.store.clone(),
            key: key.to_string(),
            config,
            trial,
        }
    }

    async fn swap(&self, key: &str, expected: Option<&str>, new: &CircuitState) -> Result<bool> {
        let serialized = serde_json::to_string(new)?;
        Ok(self
            .store
            .compare_and_swap(key, expected, &serialized, None)
            .await?)
    }
}

impl BreakerGuard {
    /// Reports a successful call.
    pub async fn succeed(self) -> Result<()> {
        if self.trial {
            // The trial owns the half-open slot; its success closes the
            // circuit unconditionally.
            info!(key = %self.key, "trial call succeeded, closing circuit");
            set_state(&self.store, &self.key, &CircuitState::initial()).await?;
            return Ok(());
        }

        for _ in 0..CAS_ATTEMPTS {
            let raw = self.store.get(&self.key).await?;
            match parse_state(raw.as_deref())? {
                CircuitState::Closed {
                    consecutive_failures,
                } if consecutive_failures > 0 => {
                    let reset = CircuitState::initial();
                    let serialized = serde_json::to_string(&reset)?;
                    if self
                        .store
                        .compare_and_swap(&self.key, raw.as_deref(), &serialized, None)
                        .await?
                    {
                        return Ok(());
                    }
                }
                // Already clean, or another actor opened the circuit while we
                // ran; either way nothing to record.
                _ => return Ok(()),
            }
        }
        Ok(())
    }

    /// Reports a failed call.
    pub async fn fail(self) -> Result<()> {
        self.fail_at(now_epoch_ms()).await
    }

    /// Clock-explicit variant of [`BreakerGuard::fail`].
    pub async fn fail_at(self, now_ms: u64) -> Result<()> {
        if self.trial {
            // A failed trial re-opens the circuit and restarts the timeout.
            warn!(key = %self.key, "trial call failed, re-opening circuit");
            set_state(
                &self.store,
                &self.key,
                &CircuitState::Open {
                    opened_at_ms: now_ms,
                },
            )
            .await?;
            return Ok(());
        }

        for _ in 0..CAS_ATTEMPTS {
            let raw = self.store.get(&self.key).await?;
            match parse_state(raw.as_deref())? {
                CircuitState::Closed {
                    consecutive_failures,
                } => {
                    let failures = consecutive_failures + 1;
                    let next = if failures >= self.config.failure_threshold {
                        warn!(
                            key = %self.key,
                            failures,
                            threshold = self.config.failure_threshold,
                            "failure threshold reached, opening circuit"
                        );
                        CircuitState::Open {
                            opened_at_ms: now_ms,
                        }
                    } else {
                        CircuitState::Closed {
                            consecutive_failures: failures,
                        }
                    };

                    let serialized = serde_json::to_string(&next)?;
                    if self
                        .store
                        .compare_and_swap(&self.key, raw.as_deref(), &serialized, None)
                        .await?
                    {
                        return Ok(());
                    }
                }
                // Another actor already opened the circuit or claimed a
                // trial; this failure is subsumed.
                CircuitState::Open { .. } | CircuitState::HalfOpen { .. } => return Ok(()),
            }
        }
        Ok(())
    }
}

fn state_key(operation: &str) -> String {
    format!("cb:{operation}")
}

fn parse_state(raw: Option<&str>) -> Result<CircuitState> {
    match raw {
        Some(raw) => Ok(serde_json::from_str(raw)?),
        None => Ok(CircuitState::initial()),
    }
}

async fn set_state(store: &Arc<dyn SharedStore>, key: &str, state: &CircuitState) -> Result<()> {
    let serialized = serde_json::to_string(state)?;
    store.set(key, &serialized, None).await?;
    Ok(())
}

/// Current time as epoch milliseconds.
fn now_epoch_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}
