//! Webhook subscription registry and durable, retrying event delivery.
//!
//! This module provides at-least-once delivery of platform events to
//! registered HTTP endpoints:
//!
//! - [`registry`]: subscription CRUD, one-time secret issuance, rotation
//!   with a grace period
//! - [`events`]: the closed set of event names
//! - [`signature`]: HMAC-SHA256 payload signing over `{timestamp}.{body}`
//! - [`retry`]: client-configurable, range-validated backoff policies
//! - [`delivery`]: per-(webhook, event) delivery records and outbound
//!   request construction
//! - [`transport`]: the outbound HTTP seam
//! - [`worker`]: the owned background task that attempts, retries, and
//!   eventually delivers or exhausts
//! - [`manager`]: event fan-out gluing the registry to the worker

pub mod delivery;
pub mod events;
pub mod manager;
pub mod registry;
pub mod retry;
pub mod signature;
pub mod transport;
pub mod worker;

pub use delivery::{DeliveryLedger, DeliveryStatus, WebhookDelivery};
pub use events::EventKind;
pub use manager::WebhookManager;
pub use registry::{
    CreateWebhook, CreatedWebhook, RegistryError, UpdateWebhook, Webhook, WebhookRegistry,
};
pub use retry::WebhookRetryPolicy;
pub use signature::{format_signature_header, parse_signature_header, sign_payload, verify_signature};
pub use transport::{DeliveryTransport, HttpTransport};
pub use worker::{DeliveryJob, DeliveryWorkerHandle, spawn_delivery_worker};
