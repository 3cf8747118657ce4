//! Core domain types for the resilience core.
//!
//! This module contains the fundamental identifier types used throughout the
//! application, designed to encode invariants via the type system.

pub mod ids;

pub use ids::{DeliveryId, DocumentId, EnhancementId, JobId, OwnerId, WebhookId};
