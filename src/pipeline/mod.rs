//! Request pipeline: the explicit guard chain every mutating endpoint runs.
//!
//! Ordering is explicit rather than implied by middleware nesting:
//!
//! 1. The circuit breaker is engaged for the endpoint's operation name and
//!    fails fast (503, or a configured fallback) if the endpoint is
//!    unhealthy.
//! 2. The rate limiter checks the per-user and per-endpoint scopes; either
//!    rejection short-circuits with 429 and a retry hint, before the handler
//!    runs and with no side effects.
//! 3. The handler runs. Its outcome is reported back to the breaker -
//!    infrastructure faults count toward opening the circuit, caller
//!    mistakes do not - and, when `skip_failed_requests` is configured on
//!    the limiter, failed requests have their admission reversed.
//!
//! The pipeline is a plain injected service: handlers receive it via
//! application state and pass their logic as an async closure.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::breaker::{BreakerConfig, BreakerDecision, CircuitBreaker};
use crate::error::ApiError;
use crate::limiter::{Admission, RateLimiter, RateQuota};
use crate::types::OwnerId;

/// Per-request context threaded through the pipeline.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// The verified caller identity.
    pub owner: OwnerId,
    /// The operation name, shared by the breaker state and the per-endpoint
    /// rate-limit scope (e.g., "enhance", "webhooks").
    pub endpoint: &'static str,
    pub received_at: DateTime<Utc>,
}

impl RequestContext {
    pub fn new(owner: OwnerId, endpoint: &'static str) -> Self {
        RequestContext {
            owner,
            endpoint,
            received_at: Utc::now(),
        }
    }
}

/// Admission policy for one endpoint.
#[derive(Debug, Clone, Copy)]
pub struct EndpointPolicy {
    /// Budget per caller across this endpoint.
    pub per_user: RateQuota,
    /// Shared budget across all callers of this endpoint.
    pub per_endpoint: RateQuota,
    pub breaker: BreakerConfig,
}

impl Default for EndpointPolicy {
    fn default() -> Self {
        EndpointPolicy {
            per_user: RateQuota::new(60, Duration::from_secs(60)),
            per_endpoint: RateQuota::new(1_000, Duration::from_secs(60)),
            breaker: BreakerConfig::default(),
        }
    }
}

/// The guard chain composing circuit breaking and admission control around a
/// handler.
pub struct RequestPipeline {
    breaker: CircuitBreaker,
    limiter: RateLimiter,
}

impl RequestPipeline {
    pub fn new(breaker: CircuitBreaker, limiter: RateLimiter) -> Self {
        RequestPipeline { breaker, limiter }
    }

    /// Runs a handler under the full guard chain. Circuit-open conditions
    /// reject with [`ApiError::CircuitOpen`].
    pub async fn run<T, F, Fut>(
        &self,
        ctx: &RequestContext,
        policy: &EndpointPolicy,
        handler: F,
    ) -> Result<T, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        match self.admit(ctx, policy).await? {
            Admitted::Proceed(guard) => self.finish(ctx, guard, handler().await).await,
            Admitted::CircuitOpen => Err(ApiError::CircuitOpen {
                operation: ctx.endpoint.to_string(),
            }),
        }
    }

    /// Like [`RequestPipeline::run`], but a circuit-open condition is served
    /// by the fallback instead of rejected. The breaker fails fast before
    /// admission control runs, so fallback responses consume no rate-limit
    /// quota.
    pub async fn run_with_fallback<T, F, Fut, FB, FutB>(
        &self,
        ctx: &RequestContext,
        policy: &EndpointPolicy,
        handler: F,
        fallback: FB,
    ) -> Result<T, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
        FB: FnOnce() -> FutB,
        FutB: Future<Output = Result<T, ApiError>>,
    {
        match self.admit(ctx, policy).await? {
            Admitted::Proceed(guard) => self.finish(ctx, guard, handler().await).await,
            // The fallback result is not reported to the breaker: it never
            // touched the unhealthy downstream.
            Admitted::CircuitOpen => fallback().await,
        }
    }

    /// Steps 1 and 2: breaker then limiter.
    async fn admit(
        &self,
        ctx: &RequestContext,
        policy: &EndpointPolicy,
    ) -> Result<Admitted, ApiError> {
        let decision = self
            .breaker
            .engage(ctx.endpoint, policy.breaker)
            .await
            .map_err(|error| ApiError::Internal(error.to_string()))?;

        let guard = match decision {
            BreakerDecision::Pass(guard) => guard,
            BreakerDecision::Rejected => return Ok(Admitted::CircuitOpen),
        };

        // Per-user budget first: the caller-specific hint is the more useful
        // rejection.
        let user_admission = self
            .limiter
            .admit("user", &ctx.owner, policy.per_user)
            .await
            .map_err(|error| ApiError::Internal(error.to_string()))?;
        let mut tickets = match user_admission {
            Admission::Allowed(tickets) => tickets,
            Admission::Rejected { retry_after, .. } => {
                // A dropped trial guard is reclaimed after the stale-trial
                // timeout; a rate-limited request must not resolve it.
                return Err(ApiError::RateLimited { retry_after });
            }
        };

        // The per-endpoint budget is shared by every caller, so the
        // endpoint name itself is the identity.
        let endpoint_identity = OwnerId::new(ctx.endpoint);
        let endpoint_admission = self
            .limiter
            .admit("endpoint", &endpoint_identity, policy.per_endpoint)
            .await
            .map_err(|error| ApiError::Internal(error.to_string()))?;
        match endpoint_admission {
            Admission::Allowed(more) => tickets.extend(more),
            Admission::Rejected { retry_after, .. } => {
                return Err(ApiError::RateLimited { retry_after });
            }
        }

        Ok(Admitted::Proceed(Guarded { guard, tickets }))
    }

    /// Step 3: report the handler outcome.
    async fn finish<T>(
        &self,
        ctx: &RequestContext,
        guarded: Guarded,
        outcome: Result<T, ApiError>,
    ) -> Result<T, ApiError> {
        match &outcome {
            Ok(_) => {
                if let Err(error) = guarded.guard.succeed().await {
                    tracing::warn!(endpoint = ctx.endpoint, %error, "failed to record circuit success");
                }
            }
            Err(error) if error.counts_toward_circuit() => {
                if let Err(record_error) = guarded.guard.fail().await {
                    tracing::warn!(
                        endpoint = ctx.endpoint,
                        error = %record_error,
                        "failed to record circuit failure"
                    );
                }
            }
            // Caller mistakes are neutral: the guard is dropped without
            // recording either way.
            Err(_) => {}
        }

        if outcome.is_err() {
            if let Err(error) = self.limiter.forgive(&guarded.tickets).await {
                tracing::warn!(endpoint = ctx.endpoint, %error, "failed to reverse admission");
            }
        }

        outcome
    }
}

enum Admitted {
    Proceed(Guarded),
    CircuitOpen,
}

struct Guarded {
    guard: crate::breaker::BreakerGuard,
    tickets: Vec<crate::limiter::AdmissionTicket>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn pipeline() -> RequestPipeline {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        RequestPipeline::new(
            CircuitBreaker::new(store.clone()),
            RateLimiter::new(store),
        )
    }

    fn pipeline_skipping_failed() -> RequestPipeline {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        RequestPipeline::new(
            CircuitBreaker::new(store.clone()),
            RateLimiter::new(store).with_skip_failed_requests(true),
        )
    }

    fn ctx() -> RequestContext {
        RequestContext::new(OwnerId::new("acct_1"), "enhance")
    }

    fn policy() -> EndpointPolicy {
        EndpointPolicy {
            per_user: RateQuota::new(100, Duration::from_secs(60)),
            per_endpoint: RateQuota::new(1_000, Duration::from_secs(60)),
            breaker: BreakerConfig {
                failure_threshold: 2,
                reset_timeout: Duration::from_secs(3_600),
            },
        }
    }

    #[tokio::test]
    async fn happy_path_runs_handler_once() {
        let pipeline = pipeline();
        let calls = AtomicU32::new(0);

        let result = pipeline
            .run(&ctx(), &policy(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ApiError>(42)
            })
            .await
            .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn per_user_limit_rejects_before_handler() {
        let pipeline = pipeline();
        let tight = EndpointPolicy {
            per_user: RateQuota::new(1, Duration::from_secs(60)),
            ..policy()
        };
        let calls = AtomicU32::new(0);

        let handler = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ApiError>(())
        };

        pipeline.run(&ctx(), &tight, handler).await.unwrap();

        let err = pipeline.run(&ctx(), &tight, handler).await.unwrap_err();
        match err {
            ApiError::RateLimited { retry_after } => {
                assert!(retry_after > Duration::ZERO);
                assert!(retry_after <= Duration::from_secs(60));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1, "handler must not run");
    }

    #[tokio::test]
    async fn per_endpoint_limit_is_shared_across_users() {
        let pipeline = pipeline();
        let tight = EndpointPolicy {
            per_endpoint: RateQuota::new(1, Duration::from_secs(60)),
            ..policy()
        };

        let first = RequestContext::new(OwnerId::new("acct_1"), "enhance");
        let second = RequestContext::new(OwnerId::new("acct_2"), "enhance");

        pipeline
            .run(&first, &tight, || async { Ok::<_, ApiError>(()) })
            .await
            .unwrap();

        // A different user hits the shared endpoint budget.
        let err = pipeline
            .run(&second, &tight, || async { Ok::<_, ApiError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn infrastructure_failures_open_the_circuit() {
        let pipeline = pipeline();
        let calls = AtomicU32::new(0);

        let failing = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ApiError::EnqueueFailed("queue down".to_string()))
        };

        // Threshold is 2.
        let _ = pipeline.run(&ctx(), &policy(), failing).await;
        let _ = pipeline.run(&ctx(), &policy(), failing).await;

        let err = pipeline.run(&ctx(), &policy(), failing).await.unwrap_err();
        assert!(matches!(err, ApiError::CircuitOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2, "handler must not run while open");
    }

    #[tokio::test]
    async fn validation_errors_do_not_open_the_circuit() {
        let pipeline = pipeline();

        for _ in 0..5 {
            let err = pipeline
                .run(&ctx(), &policy(), || async {
                    Err::<(), _>(ApiError::validation("bad input"))
                })
                .await
                .unwrap_err();
            assert!(matches!(err, ApiError::Validation(_)));
        }

        // Well past the threshold, the circuit is still closed.
        let result = pipeline
            .run(&ctx(), &policy(), || async { Ok::<_, ApiError>("fine") })
            .await
            .unwrap();
        assert_eq!(result, "fine");
    }

    #[tokio::test]
    async fn fallback_serves_circuit_open() {
        let pipeline = pipeline();

        let failing = || async { Err::<&str, _>(ApiError::Internal("downstream".to_string())) };
        let _ = pipeline.run(&ctx(), &policy(), failing).await;
        let _ = pipeline.run(&ctx(), &policy(), failing).await;

        let result = pipeline
            .run_with_fallback(
                &ctx(),
                &policy(),
                || async { panic!("handler must not run while open") },
                || async { Ok("served from cache") },
            )
            .await
            .unwrap();
        assert_eq!(result, "served from cache");
    }

    #[tokio::test]
    async fn skip_failed_requests_reverses_admission() {
        let pipeline = pipeline_skipping_failed();
        let tight = EndpointPolicy {
            per_user: RateQuota::new(1, Duration::from_secs(60)),
            ..policy()
        };

        let err = pipeline
            .run(&ctx(), &tight, || async {
                Err::<(), _>(ApiError::validation("bad input"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));

        // The failed request's admission was reversed; the slot is free.
        pipeline
            .run(&ctx(), &tight, || async { Ok::<_, ApiError>(()) })
            .await
            .unwrap();
    }
}
