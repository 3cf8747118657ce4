//! Webhook subscription registry.
//!
//! Owns the full lifecycle of webhook subscriptions: creation (with one-time
//! secret issuance), updates, secret rotation with a verification grace
//! period, deactivation, and deletion. The registry is an explicitly
//! constructed service injected where needed; there is no process-wide
//! singleton.
//!
//! # Secret handling
//!
//! Secrets are write-once: generated at creation, returned to the caller
//! exactly once, and never re-returned by any read path. [`Secret`] redacts
//! itself from `Debug` output and is never serialized. Rotation keeps the
//! previous secret verifiable for [`ROTATION_GRACE`] so deliveries already
//! signed with it are not dropped mid-flight.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use crate::types::{OwnerId, WebhookId};

use super::events::{EventKind, UnknownEvent};
use super::retry::{InvalidRetryPolicy, WebhookRetryPolicy};

/// How long a rotated-out secret remains valid for signature verification.
pub const ROTATION_GRACE: Duration = Duration::from_secs(5 * 60);

/// Errors raised by registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No webhook with this ID owned by the caller. Ownership mismatches are
    /// reported identically so callers cannot probe other accounts' IDs.
    #[error("webhook not found: {0}")]
    NotFound(WebhookId),

    /// The URL is not a valid http(s) endpoint.
    #[error("invalid webhook url: {0}")]
    InvalidUrl(String),

    /// A subscription must name at least one event.
    #[error("webhook must subscribe to at least one event")]
    NoEvents,

    /// An event name outside the legal set.
    #[error(transparent)]
    UnknownEvent(#[from] UnknownEvent),

    /// A retry policy field outside its legal range.
    #[error(transparent)]
    InvalidRetryPolicy(#[from] InvalidRetryPolicy),
}

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// A webhook signing secret. Redacted from debug output, never serialized.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Secret(format!("whsec_{}", hex::encode(bytes)))
    }

    /// Exposes the secret material for signing.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(****)")
    }
}

/// The caller-visible view of a subscription. Deliberately has no secret
/// field, so no read path can leak it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Webhook {
    pub id: WebhookId,
    pub owner_id: OwnerId,
    pub url: String,
    pub events: BTreeSet<EventKind>,
    pub is_active: bool,
    pub headers: HashMap<String, String>,
    pub retry_policy: WebhookRetryPolicy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What the registry actually stores per subscription.
#[derive(Debug, Clone)]
struct StoredWebhook {
    webhook: Webhook,
    secret: Secret,
    /// The rotated-out secret and its validity deadline, if inside the
    /// grace window.
    previous_secret: Option<(Secret, DateTime<Utc>)>,
}

/// Request to create a subscription. Event names arrive as strings and are
/// validated against the closed event set.
#[derive(Debug, Clone)]
pub struct CreateWebhook {
    pub url: String,
    pub events: Vec<String>,
    pub headers: HashMap<String, String>,
    pub retry_policy: Option<WebhookRetryPolicy>,
}

/// Partial update to a subscription; `None` fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct UpdateWebhook {
    pub url: Option<String>,
    pub events: Option<Vec<String>>,
    pub headers: Option<HashMap<String, String>>,
    pub retry_policy: Option<WebhookRetryPolicy>,
    pub is_active: Option<bool>,
}

/// The one-time creation response: the only place the secret ever appears.
#[derive(Debug)]
pub struct CreatedWebhook {
    pub webhook: Webhook,
    pub secret: String,
}

/// Everything the delivery worker needs to deliver to one subscription.
#[derive(Debug, Clone)]
pub struct DeliveryTarget {
    pub webhook_id: WebhookId,
    pub url: String,
    pub headers: HashMap<String, String>,
    /// The current signing secret.
    pub secret: String,
    pub retry_policy: WebhookRetryPolicy,
}

/// In-memory subscription registry.
#[derive(Debug, Default)]
pub struct WebhookRegistry {
    webhooks: RwLock<HashMap<WebhookId, StoredWebhook>>,
}

impl WebhookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a subscription; the returned secret is shown exactly once.
    pub async fn create(&self, owner: &OwnerId, request: CreateWebhook) -> Result<CreatedWebhook> {
        let url = validate_url(&request.url)?;
        let events = parse_events(&request.events)?;
        let retry_policy = request.retry_policy.unwrap_or_default();
        retry_policy.validate()?;

        let now = Utc::now();
        let secret = Secret::generate();
        let webhook = Webhook {
            id: WebhookId::new(),
            owner_id: owner.clone(),
            url,
            events,
            is_active: true,
            headers: request.headers,
            retry_policy,
            created_at: now,
            updated_at: now,
        };

        let exposed = secret.expose().to_string();
        let mut webhooks = self.webhooks.write().await;
        webhooks.insert(
            webhook.id,
            StoredWebhook {
                webhook: webhook.clone(),
                secret,
                previous_secret: None,
            },
        );

        info!(webhook_id = %webhook.id, owner = %owner, "webhook created");
        Ok(CreatedWebhook {
            webhook,
            secret: exposed,
        })
    }

    /// Reads one subscription owned by the caller.
    pub async fn get(&self, owner: &OwnerId, id: WebhookId) -> Result<Webhook> {
        let webhooks = self.webhooks.read().await;
        owned(&webhooks, owner, id).map(|stored| stored.webhook.clone())
    }

    /// Lists the caller's subscriptions.
    pub async fn list(&self, owner: &OwnerId) -> Vec<Webhook> {
        let webhooks = self.webhooks.read().await;
        webhooks
            .values()
            .filter(|stored| &stored.webhook.owner_id == owner)
            .map(|stored| stored.webhook.clone())
            .collect()
    }

    /// Applies a partial update.
    pub async fn update(
        &self,
        owner: &OwnerId,
        id: WebhookId,
        update: UpdateWebhook,
    ) -> Result<Webhook> {
        // Validate before taking the write lock; a rejected update must not
        // leave partial changes behind.
        let url = update.url.as_deref().map(validate_url).transpose()?;
        let events = update.events.as_deref().map(parse_events).transpose()?;
        if let Some(policy) = &update.retry_policy {
            policy.validate()?;
        }

        let mut webhooks = self.webhooks.write().await;
        let stored = owned_mut(&mut webhooks, owner, id)?;

        if let Some(url) = url {
            stored.webhook.url = url;
        }
        if let Some(events) = events {
            stored.webhook.events = events;
        }
        if let Some(headers) = update.headers {
            stored.webhook.headers = headers;
        }
        if let Some(policy) = update.retry_policy {
            stored.webhook.retry_policy = policy;
        }
        if let Some(is_active) = update.is_active {
            stored.webhook.is_active = is_active;
        }
        stored.webhook.updated_at = Utc::now();

        Ok(stored.webhook.clone())
    }

    /// Rotates the signing secret, returning the new one (shown exactly
    /// once). The old secret remains verifiable until the grace deadline.
    pub async fn rotate_secret(&self, owner: &OwnerId, id: WebhookId) -> Result<String> {
        let mut webhooks = self.webhooks.write().await;
        let stored = owned_mut(&mut webhooks, owner, id)?;

        let grace_until = Utc::now()
            + chrono::Duration::from_std(ROTATION_GRACE).expect("grace period fits chrono range");
        let new_secret = Secret::generate();
        let old_secret = std::mem::replace(&mut stored.secret, new_secret);
        stored.previous_secret = Some((old_secret, grace_until));
        stored.webhook.updated_at = Utc::now();

        info!(webhook_id = %id, owner = %owner, "webhook secret rotated");
        Ok(stored.secret.expose().to_string())
    }

    /// Hard-deletes a subscription. Future deliveries stop immediately;
    /// the delivery worker also drops queued retries for deleted webhooks.
    pub async fn delete(&self, owner: &OwnerId, id: WebhookId) -> Result<()> {
        let mut webhooks = self.webhooks.write().await;
        owned(&webhooks, owner, id)?;
        webhooks.remove(&id);
        info!(webhook_id = %id, owner = %owner, "webhook deleted");
        Ok(())
    }

    /// Returns whether a webhook still exists (any owner). Used by the
    /// delivery worker to stop retrying deliveries for deleted webhooks.
    pub async fn exists(&self, id: WebhookId) -> bool {
        self.webhooks.read().await.contains_key(&id)
    }

    /// All secrets currently valid for verifying this webhook's signatures:
    /// the active secret plus a rotated-out secret inside its grace window.
    pub async fn verification_secrets(&self, owner: &OwnerId, id: WebhookId) -> Result<Vec<String>> {
        let webhooks = self.webhooks.read().await;
        let stored = owned(&webhooks, owner, id)?;

        let mut secrets = vec![stored.secret.expose().to_string()];
        if let Some((previous, grace_until)) = &stored.previous_secret {
            if Utc::now() < *grace_until {
                secrets.push(previous.expose().to_string());
            }
        }
        Ok(secrets)
    }

    /// Finds the active subscriptions of `owner` listening for `event`,
    /// snapshotting what the delivery worker needs.
    pub async fn subscriptions_for(&self, owner: &OwnerId, event: EventKind) -> Vec<DeliveryTarget> {
        let webhooks = self.webhooks.read().await;
        webhooks
            .values()
            .filter(|stored| {
                let webhook = &stored.webhook;
                &webhook.owner_id == owner && webhook.is_active && webhook.events.contains(&event)
            })
            .map(|stored| DeliveryTarget {
                webhook_id: stored.webhook.id,
                url: stored.webhook.url.clone(),
                headers: stored.webhook.headers.clone(),
                secret: stored.secret.expose().to_string(),
                retry_policy: stored.webhook.retry_policy,
            })
            .collect()
    }
}

fn owned<'a>(
    webhooks: &'a HashMap<WebhookId, StoredWebhook>,
    owner: &OwnerId,
    id: WebhookId,
) -> Result<&'a StoredWebhook> {
    webhooks
        .get(&id)
        .filter(|stored| &stored.webhook.owner_id == owner)
        .ok_or(RegistryError::NotFound(id))
}

fn owned_mut<'a>(
    webhooks: &'a mut HashMap<WebhookId, StoredWebhook>,
    owner: &OwnerId,
    id: WebhookId,
) -> Result<&'a mut StoredWebhook> {
    webhooks
        .get_mut(&id)
        .filter(|stored| &stored.webhook.owner_id == owner)
        .ok_or(RegistryError::NotFound(id))
}

fn validate_url(url: &str) -> Result<String> {
    if url.starts_with("https://") || url.starts_with("http://") {
        Ok(url.to_string())
    } else {
        Err(RegistryError::InvalidUrl(url.to_string()))
    }
}

fn parse_events(names: &[String]) -> Result<BTreeSet<EventKind>> {
    if names.is_empty() {
        return Err(RegistryError::NoEvents);
    }
    names.iter().map(|name| Ok(name.parse()?)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> OwnerId {
        OwnerId::new("acct_1")
    }

    fn create_request() -> CreateWebhook {
        CreateWebhook {
            url: "https://example.com/hooks".to_string(),
            events: vec!["enhancement.completed".to_string()],
            headers: HashMap::new(),
            retry_policy: None,
        }
    }

    #[tokio::test]
    async fn create_returns_secret_exactly_once() {
        let registry = WebhookRegistry::new();
        let created = registry.create(&owner(), create_request()).await.unwrap();

        assert!(created.secret.starts_with("whsec_"));
        assert!(created.webhook.is_active);

        // No read path returns the secret again.
        let fetched = registry.get(&owner(), created.webhook.id).await.unwrap();
        let json = serde_json::to_string(&fetched).unwrap();
        assert!(!json.contains(&created.secret));
    }

    #[tokio::test]
    async fn secret_is_redacted_from_debug() {
        let secret = Secret::generate();
        assert_eq!(format!("{:?}", secret), "Secret(****)");
    }

    #[tokio::test]
    async fn create_rejects_bad_input() {
        let registry = WebhookRegistry::new();

        let mut bad_url = create_request();
        bad_url.url = "ftp://example.com".to_string();
        assert!(matches!(
            registry.create(&owner(), bad_url).await,
            Err(RegistryError::InvalidUrl(_))
        ));

        let mut no_events = create_request();
        no_events.events.clear();
        assert!(matches!(
            registry.create(&owner(), no_events).await,
            Err(RegistryError::NoEvents)
        ));

        let mut unknown_event = create_request();
        unknown_event.events = vec!["document.exploded".to_string()];
        assert!(matches!(
            registry.create(&owner(), unknown_event).await,
            Err(RegistryError::UnknownEvent(_))
        ));

        let mut bad_policy = create_request();
        bad_policy.retry_policy = Some(WebhookRetryPolicy {
            max_attempts: 99,
            ..WebhookRetryPolicy::default()
        });
        assert!(matches!(
            registry.create(&owner(), bad_policy).await,
            Err(RegistryError::InvalidRetryPolicy(_))
        ));
    }

    #[tokio::test]
    async fn other_owner_cannot_see_or_touch() {
        let registry = WebhookRegistry::new();
        let created = registry.create(&owner(), create_request()).await.unwrap();
        let other = OwnerId::new("acct_2");

        assert!(matches!(
            registry.get(&other, created.webhook.id).await,
            Err(RegistryError::NotFound(_))
        ));
        assert!(matches!(
            registry.delete(&other, created.webhook.id).await,
            Err(RegistryError::NotFound(_))
        ));
        assert!(matches!(
            registry.rotate_secret(&other, created.webhook.id).await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn update_applies_partial_changes() {
        let registry = WebhookRegistry::new();
        let created = registry.create(&owner(), create_request()).await.unwrap();

        let updated = registry
            .update(
                &owner(),
                created.webhook.id,
                UpdateWebhook {
                    is_active: Some(false),
                    events: Some(vec![
                        "enhancement.failed".to_string(),
                        "batch.failed".to_string(),
                    ]),
                    ..UpdateWebhook::default()
                },
            )
            .await
            .unwrap();

        assert!(!updated.is_active);
        assert_eq!(updated.events.len(), 2);
        // Unchanged fields survive.
        assert_eq!(updated.url, created.webhook.url);
    }

    #[tokio::test]
    async fn rotation_keeps_old_secret_in_grace() {
        let registry = WebhookRegistry::new();
        let created = registry.create(&owner(), create_request()).await.unwrap();
        let id = created.webhook.id;

        let new_secret = registry.rotate_secret(&owner(), id).await.unwrap();
        assert_ne!(new_secret, created.secret);

        let secrets = registry.verification_secrets(&owner(), id).await.unwrap();
        assert_eq!(secrets.len(), 2);
        assert!(secrets.contains(&new_secret));
        assert!(secrets.contains(&created.secret));
    }

    #[tokio::test]
    async fn event_filtering_matches_active_subscribers_only() {
        let registry = WebhookRegistry::new();

        let subscribed = registry.create(&owner(), create_request()).await.unwrap();

        // Subscribed to a different event.
        let mut other_event = create_request();
        other_event.events = vec!["batch.failed".to_string()];
        registry.create(&owner(), other_event).await.unwrap();

        // Subscribed but deactivated.
        let deactivated = registry.create(&owner(), create_request()).await.unwrap();
        registry
            .update(
                &owner(),
                deactivated.webhook.id,
                UpdateWebhook {
                    is_active: Some(false),
                    ..UpdateWebhook::default()
                },
            )
            .await
            .unwrap();

        // A different owner entirely.
        registry
            .create(&OwnerId::new("acct_2"), create_request())
            .await
            .unwrap();

        let targets = registry
            .subscriptions_for(&owner(), EventKind::EnhancementCompleted)
            .await;
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].webhook_id, subscribed.webhook.id);
    }

    #[tokio::test]
    async fn delete_removes_subscription() {
        let registry = WebhookRegistry::new();
        let created = registry.create(&owner(), create_request()).await.unwrap();
        let id = created.webhook.id;

        registry.delete(&owner(), id).await.unwrap();
        assert!(!registry.exists(id).await);
        assert!(matches!(
            registry.get(&owner(), id).await,
            Err(RegistryError::NotFound(_))
        ));
    }
}
