//! Outbound HTTP transport for webhook deliveries.
//!
//! The delivery worker is written against [`DeliveryTransport`] so tests can
//! substitute a scripted transport; production uses [`HttpTransport`] over a
//! shared `reqwest` client.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::delivery::OutboundRequest;

/// Per-request timeout for delivery POSTs. A slow receiver is
/// indistinguishable from a dead one past this point; the retry engine
/// handles the rest.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors raised by the transport layer (network-level failures; non-2xx
/// statuses are returned as values, not errors).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("delivery request failed: {0}")]
    Request(String),
}

/// Sends one delivery attempt and reports the receiver's HTTP status.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn deliver(&self, request: &OutboundRequest) -> Result<u16, TransportError>;
}

/// Production transport over `reqwest`.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .expect("reqwest client construction cannot fail with static config");
        HttpTransport { client }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeliveryTransport for HttpTransport {
    async fn deliver(&self, request: &OutboundRequest) -> Result<u16, TransportError> {
        let mut builder = self.client.post(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        let response = builder
            .body(request.body.clone())
            .send()
            .await
            .map_err(|error| TransportError::Request(error.to_string()))?;

        Ok(response.status().as_u16())
    }
}
