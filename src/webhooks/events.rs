//! Event names webhooks can subscribe to.
//!
//! The legal event set is closed and validated at the subscription boundary,
//! so a typo in a subscription request fails loudly instead of silently
//! never matching.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A platform event a webhook can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// An enhancement job finished successfully.
    EnhancementCompleted,
    /// An enhancement job failed permanently.
    EnhancementFailed,
    /// An export job finished successfully.
    ExportCompleted,
    /// Every item of a batch failed (wholesale batch failure).
    ///
    /// Partial-failure batches fire no batch-level event; the per-item
    /// enhancement events are the only signal.
    BatchFailed,
}

impl EventKind {
    /// The wire name of the event.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::EnhancementCompleted => "enhancement.completed",
            EventKind::EnhancementFailed => "enhancement.failed",
            EventKind::ExportCompleted => "export.completed",
            EventKind::BatchFailed => "batch.failed",
        }
    }

    /// All legal event kinds, for validation error messages.
    pub fn all() -> &'static [EventKind] {
        &[
            EventKind::EnhancementCompleted,
            EventKind::EnhancementFailed,
            EventKind::ExportCompleted,
            EventKind::BatchFailed,
        ]
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error for unrecognized event names.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event name: {0}")]
pub struct UnknownEvent(pub String);

impl FromStr for EventKind {
    type Err = UnknownEvent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::all()
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownEvent(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_roundtrip() {
        for kind in EventKind::all() {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), *kind);
        }
    }

    #[test]
    fn unknown_names_are_rejected() {
        assert_eq!(
            "document.exploded".parse::<EventKind>(),
            Err(UnknownEvent("document.exploded".to_string()))
        );
    }

    #[test]
    fn display_matches_wire_name() {
        assert_eq!(
            EventKind::EnhancementCompleted.to_string(),
            "enhancement.completed"
        );
        assert_eq!(EventKind::BatchFailed.to_string(), "batch.failed");
    }
}
