//! Circuit state records.
//!
//! One record per named operation, stored as JSON in the shared store and
//! mutated only via compare-and-swap. The predicates here are pure so the
//! transition rules can be tested without a clock or a store.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The state of one operation's circuit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through; failures are counted.
    Closed {
        /// Consecutive failures observed since the last success.
        consecutive_failures: u32,
    },

    /// Calls are rejected without invoking the downstream operation.
    Open {
        /// When the circuit opened (epoch ms). The reset timeout counts from
        /// here, and restarts from here again after a failed trial.
        opened_at_ms: u64,
    },

    /// A single trial call is in flight; everyone else is rejected until it
    /// resolves.
    HalfOpen {
        /// When the trial was claimed (epoch ms). If a trial holder dies
        /// without resolving, a fresh trial may be claimed after another
        /// reset timeout.
        since_ms: u64,
    },
}

impl CircuitState {
    /// The state a circuit starts in: closed with a clean slate.
    pub fn initial() -> Self {
        CircuitState::Closed {
            consecutive_failures: 0,
        }
    }

    /// Whether an open circuit has cooled down long enough to permit a trial.
    pub fn reset_timeout_elapsed(&self, now_ms: u64, reset_timeout: Duration) -> bool {
        let elapsed_since = |then_ms: u64| now_ms.saturating_sub(then_ms) >= reset_timeout.as_millis() as u64;
        match self {
            CircuitState::Open { opened_at_ms } => elapsed_since(*opened_at_ms),
            // A stale half-open trial (holder crashed mid-trial) is treated
            // the same way so the circuit cannot wedge.
            CircuitState::HalfOpen { since_ms } => elapsed_since(*since_ms),
            CircuitState::Closed { .. } => false,
        }
    }
}
