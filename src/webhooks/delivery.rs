//! Delivery records and outbound request construction.
//!
//! One [`WebhookDelivery`] record exists per (webhook, event instance). It is
//! created in `Pending` when the event fires, moves to `Retrying` while the
//! worker backs off between failed attempts, and terminates at `Delivered`
//! or `Exhausted`. Exhaustion is logged, never surfaced to the request that
//! triggered the event.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::types::{DeliveryId, WebhookId};

use super::events::EventKind;
use super::registry::DeliveryTarget;
use super::signature::{format_signature_header, sign_payload};

/// Header carrying the HMAC signature.
pub const HEADER_SIGNATURE: &str = "x-signature";
/// Header carrying the delivery ID for receiver-side deduplication.
pub const HEADER_EVENT_ID: &str = "x-event-id";
/// Header carrying the signing timestamp (epoch ms).
pub const HEADER_TIMESTAMP: &str = "x-timestamp";

/// Delivery lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Created, not yet attempted.
    Pending,
    /// Terminal: the receiver acknowledged with a 2xx.
    Delivered,
    /// A failed attempt is waiting out its backoff delay.
    Retrying,
    /// Terminal: every attempt failed.
    Exhausted,
}

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::Exhausted)
    }
}

/// One delivery of one event instance to one webhook.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookDelivery {
    pub id: DeliveryId,
    pub webhook_id: WebhookId,
    pub event: EventKind,
    pub payload: serde_json::Value,
    /// Attempts already made.
    pub attempt: u32,
    pub status: DeliveryStatus,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl WebhookDelivery {
    pub fn new(webhook_id: WebhookId, event: EventKind, payload: serde_json::Value) -> Self {
        WebhookDelivery {
            id: DeliveryId::new(),
            webhook_id,
            event,
            payload,
            attempt: 0,
            status: DeliveryStatus::Pending,
            next_retry_at: None,
            last_error: None,
            created_at: Utc::now(),
        }
    }
}

/// Shared record of all deliveries, for observability and tests.
///
/// Terminal records are kept; a production deployment would prune them
/// passively the way cache entries expire.
#[derive(Debug, Default)]
pub struct DeliveryLedger {
    deliveries: RwLock<HashMap<DeliveryId, WebhookDelivery>>,
}

impl DeliveryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, delivery: WebhookDelivery) {
        self.deliveries.write().await.insert(delivery.id, delivery);
    }

    pub async fn get(&self, id: DeliveryId) -> Option<WebhookDelivery> {
        self.deliveries.read().await.get(&id).cloned()
    }

    /// Applies a mutation to one record, if it exists.
    pub async fn update(&self, id: DeliveryId, mutate: impl FnOnce(&mut WebhookDelivery)) {
        if let Some(delivery) = self.deliveries.write().await.get_mut(&id) {
            mutate(delivery);
        }
    }

    /// Snapshot of all records for a webhook, newest first.
    pub async fn for_webhook(&self, webhook_id: WebhookId) -> Vec<WebhookDelivery> {
        let mut records: Vec<_> = self
            .deliveries
            .read()
            .await
            .values()
            .filter(|delivery| delivery.webhook_id == webhook_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }
}

/// A fully built outbound POST, ready for the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

/// Builds the signed outbound request for one delivery attempt.
///
/// The body is `{event, data, timestamp}`; the signature covers
/// `{timestamp}.{body}` with the webhook's current secret. Custom per-webhook
/// headers are appended after the protocol headers.
pub fn build_outbound_request(
    target: &DeliveryTarget,
    delivery: &WebhookDelivery,
    timestamp_ms: u64,
) -> OutboundRequest {
    let body = serde_json::json!({
        "event": delivery.event.as_str(),
        "data": delivery.payload,
        "timestamp": timestamp_ms,
    })
    .to_string();

    let signature = sign_payload(timestamp_ms, body.as_bytes(), target.secret.as_bytes());

    let mut headers = vec![
        ("content-type".to_string(), "application/json".to_string()),
        (
            HEADER_SIGNATURE.to_string(),
            format_signature_header(&signature),
        ),
        (HEADER_EVENT_ID.to_string(), delivery.id.to_string()),
        (HEADER_TIMESTAMP.to_string(), timestamp_ms.to_string()),
    ];
    for (name, value) in &target.headers {
        headers.push((name.clone(), value.clone()));
    }

    OutboundRequest {
        url: target.url.clone(),
        headers,
        body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhooks::retry::WebhookRetryPolicy;
    use crate::webhooks::signature::verify_signature;

    fn target(secret: &str) -> DeliveryTarget {
        DeliveryTarget {
            webhook_id: WebhookId::new(),
            url: "https://example.com/hooks".to_string(),
            headers: HashMap::from([("x-tenant".to_string(), "acme".to_string())]),
            secret: secret.to_string(),
            retry_policy: WebhookRetryPolicy::default(),
        }
    }

    fn delivery() -> WebhookDelivery {
        WebhookDelivery::new(
            WebhookId::new(),
            EventKind::EnhancementCompleted,
            serde_json::json!({ "document_id": "doc-1" }),
        )
    }

    fn header<'a>(request: &'a OutboundRequest, name: &str) -> Option<&'a str> {
        request
            .headers
            .iter()
            .find(|(header_name, _)| header_name == name)
            .map(|(_, value)| value.as_str())
    }

    #[test]
    fn new_delivery_starts_pending() {
        let delivery = delivery();
        assert_eq!(delivery.status, DeliveryStatus::Pending);
        assert_eq!(delivery.attempt, 0);
        assert_eq!(delivery.next_retry_at, None);
        assert_eq!(delivery.last_error, None);
    }

    #[test]
    fn outbound_request_is_signed_and_verifiable() {
        let target = target("whsec_test");
        let delivery = delivery();
        let timestamp = 1_700_000_000_000;

        let request = build_outbound_request(&target, &delivery, timestamp);

        let signature = header(&request, HEADER_SIGNATURE).unwrap();
        assert!(verify_signature(
            timestamp,
            request.body.as_bytes(),
            signature,
            [target.secret.as_bytes()],
        ));
    }

    #[test]
    fn outbound_request_carries_protocol_and_custom_headers() {
        let target = target("whsec_test");
        let delivery = delivery();

        let request = build_outbound_request(&target, &delivery, 1_000);

        assert_eq!(header(&request, HEADER_EVENT_ID), Some(delivery.id.to_string().as_str()));
        assert_eq!(header(&request, HEADER_TIMESTAMP), Some("1000"));
        assert_eq!(header(&request, "x-tenant"), Some("acme"));
        assert_eq!(header(&request, "content-type"), Some("application/json"));
    }

    #[test]
    fn body_has_event_data_timestamp() {
        let target = target("whsec_test");
        let delivery = delivery();

        let request = build_outbound_request(&target, &delivery, 1_000);
        let body: serde_json::Value = serde_json::from_str(&request.body).unwrap();

        assert_eq!(body["event"], "enhancement.completed");
        assert_eq!(body["data"]["document_id"], "doc-1");
        assert_eq!(body["timestamp"], 1_000);
    }

    #[tokio::test]
    async fn ledger_update_and_query() {
        let ledger = DeliveryLedger::new();
        let record = delivery();
        let id = record.id;
        let webhook_id = record.webhook_id;

        ledger.insert(record).await;
        ledger
            .update(id, |delivery| {
                delivery.status = DeliveryStatus::Retrying;
                delivery.attempt = 1;
            })
            .await;

        let fetched = ledger.get(id).await.unwrap();
        assert_eq!(fetched.status, DeliveryStatus::Retrying);
        assert_eq!(fetched.attempt, 1);

        assert_eq!(ledger.for_webhook(webhook_id).await.len(), 1);
        assert!(ledger.for_webhook(WebhookId::new()).await.is_empty());
    }
}
