//! Webhook manager: event fan-out to subscriptions.
//!
//! The manager owns the bridge from "an event happened" to "delivery records
//! exist and the worker has them". It filters the owner's subscriptions by
//! event name and active flag, creates one pending delivery record per
//! matching webhook, and hands each to the delivery worker. From that point
//! delivery is fully internal: nothing here ever propagates back to whatever
//! triggered the event.

use std::sync::Arc;

use tracing::warn;

use crate::types::{DeliveryId, OwnerId};

use super::delivery::{DeliveryLedger, WebhookDelivery};
use super::events::EventKind;
use super::registry::WebhookRegistry;
use super::worker::{DeliveryJob, DeliveryWorkerHandle};

/// Fan-out of platform events to registered webhooks.
pub struct WebhookManager {
    registry: Arc<WebhookRegistry>,
    ledger: Arc<DeliveryLedger>,
    worker: DeliveryWorkerHandle,
}

impl WebhookManager {
    pub fn new(
        registry: Arc<WebhookRegistry>,
        ledger: Arc<DeliveryLedger>,
        worker: DeliveryWorkerHandle,
    ) -> Self {
        WebhookManager {
            registry,
            ledger,
            worker,
        }
    }

    /// Queues one delivery per active subscription of `owner` matching
    /// `event`. Returns the created delivery IDs (observability only; the
    /// deliveries themselves are fire-and-forget).
    pub async fn queue_delivery(
        &self,
        owner: &OwnerId,
        event: EventKind,
        payload: serde_json::Value,
    ) -> Vec<DeliveryId> {
        let targets = self.registry.subscriptions_for(owner, event).await;
        let mut delivery_ids = Vec::with_capacity(targets.len());

        for target in targets {
            let delivery = WebhookDelivery::new(target.webhook_id, event, payload.clone());
            let delivery_id = delivery.id;
            self.ledger.insert(delivery.clone()).await;

            if !self.worker.submit(DeliveryJob { target, delivery }).await {
                // Worker shut down mid-flight; the record stays pending in
                // the ledger.
                warn!(
                    delivery_id = %delivery_id,
                    event = %event,
                    "delivery worker unavailable, delivery left pending"
                );
            }
            delivery_ids.push(delivery_id);
        }

        delivery_ids
    }

    /// The delivery ledger, for observability endpoints and tests.
    pub fn ledger(&self) -> &Arc<DeliveryLedger> {
        &self.ledger
    }

    /// Stops the delivery worker and waits for it to exit.
    pub async fn shutdown(self) {
        self.worker.shutdown().await;
    }
}
