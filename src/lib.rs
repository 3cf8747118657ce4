//! Vellum - request-resilience and reliable event-delivery core for a
//! document-enhancement platform.
//!
//! This library provides the admission-control, failure-isolation, and
//! delivery-guarantee layer that every mutating API endpoint is wrapped in:
//! rate limiting, circuit breaking, content-addressed result caching,
//! priority job dispatch with partial-failure handling, and durable,
//! retrying webhook delivery.

pub mod breaker;
pub mod cache;
pub mod error;
pub mod jobs;
pub mod limiter;
pub mod pipeline;
pub mod server;
pub mod store;
pub mod types;
pub mod webhooks;
