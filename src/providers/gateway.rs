use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{Provider, ProviderDescriptor, ProviderQuery};
use crate::budget::{BudgetLedger, Cost, LeadBudget};
use crate::cache::ResponseCache;
use crate::circuit_breaker::{BreakerSettings, BreakerSnapshot, ProviderBreaker};
use crate::errors::ProviderError;
use crate::models::{CallOutcome, ProviderEvent, ProviderId};

/// Exponential backoff for retryable provider errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based). A provider's
    /// Retry-After hint wins when it is longer, capped at `max_delay`.
    pub fn delay(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let exponential = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        hint.map_or(exponential, |h| h.max(exponential).min(self.max_delay))
    }
}

/// Successful call result.
#[derive(Debug, Clone, PartialEq)]
pub struct Called<T> {
    pub value: T,
    pub cost: Cost,
    pub from_cache: bool,
}

/// Result of one gateway call plus every provider interaction it caused.
#[derive(Debug)]
pub struct GatewayOutcome<T> {
    pub result: Result<Called<T>, ProviderError>,
    pub events: Vec<ProviderEvent>,
}

struct ProviderSlot {
    breaker: ProviderBreaker,
    cost_per_call: Cost,
    /// Set after an authentication failure; stays set for the session.
    disabled: AtomicBool,
}

/// Wraps every adapter call: cache, circuit breaker, budget reservation,
/// per-call timeout, retries and cancellation.
pub struct ProviderGateway {
    slots: HashMap<ProviderId, ProviderSlot>,
    cache: ResponseCache,
    ledger: Arc<BudgetLedger>,
    retry: RetryPolicy,
}

impl ProviderGateway {
    /// One breaker per distinct provider id in `descriptors`.
    pub fn new(
        descriptors: &[ProviderDescriptor],
        breaker: BreakerSettings,
        retry: RetryPolicy,
        cache: ResponseCache,
        ledger: Arc<BudgetLedger>,
    ) -> Self {
        let mut slots = HashMap::new();
        for descriptor in descriptors {
            slots
                .entry(descriptor.id.clone())
                .or_insert_with(|| ProviderSlot {
                    breaker: ProviderBreaker::new(descriptor.id.clone(), breaker),
                    cost_per_call: descriptor.cost_per_call,
                    disabled: AtomicBool::new(false),
                });
        }

        Self {
            slots,
            cache,
            ledger,
            retry,
        }
    }

    pub fn ledger(&self) -> &Arc<BudgetLedger> {
        &self.ledger
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<_> = self.slots.values().map(|s| s.breaker.snapshot()).collect();
        snapshots.sort_by(|a, b| a.provider.cmp(&b.provider));
        snapshots
    }

    /// True when calls to `provider` are charged against the budget.
    pub fn is_paid(&self, provider: &ProviderId) -> bool {
        self.slots
            .get(provider)
            .is_some_and(|s| !s.cost_per_call.is_zero())
    }

    /// Cost of the cheapest paid provider, if any is registered.
    pub fn cheapest_paid_call(&self) -> Option<Cost> {
        self.slots
            .values()
            .map(|s| s.cost_per_call)
            .filter(|c| !c.is_zero())
            .min()
    }

    pub fn is_disabled(&self, provider: &ProviderId) -> bool {
        self.slots
            .get(provider)
            .is_some_and(|s| s.disabled.load(Ordering::Acquire))
    }

    pub async fn call<P>(
        &self,
        provider: &P,
        query: &P::Query,
        lead: &LeadBudget,
        cancel: &CancellationToken,
    ) -> GatewayOutcome<P::Response>
    where
        P: Provider + ?Sized,
    {
        let mut events = Vec::new();
        let result = self.call_inner(provider, query, lead, cancel, &mut events).await;
        GatewayOutcome { result, events }
    }

    async fn call_inner<P>(
        &self,
        provider: &P,
        query: &P::Query,
        lead: &LeadBudget,
        cancel: &CancellationToken,
        events: &mut Vec<ProviderEvent>,
    ) -> Result<Called<P::Response>, ProviderError>
    where
        P: Provider + ?Sized,
    {
        let descriptor = provider.descriptor();
        let id = &descriptor.id;
        let skipped = |events: &mut Vec<ProviderEvent>, err: ProviderError| {
            events.push(ProviderEvent::new(
                id.clone(),
                CallOutcome::Skipped { kind: err.kind() },
            ));
            Err(err)
        };

        let Some(slot) = self.slots.get(id) else {
            tracing::error!(provider = %id, "Provider was not registered with the gateway");
            return skipped(events, ProviderError::Disabled(id.clone()));
        };

        if slot.disabled.load(Ordering::Acquire) {
            return skipped(events, ProviderError::Disabled(id.clone()));
        }

        let key = query.cache_key();
        if let Some(value) = self.cache.get::<P::Response>(id, &key).await {
            events.push(ProviderEvent::new(id.clone(), CallOutcome::CacheHit));
            return Ok(Called {
                value,
                cost: Cost::ZERO,
                from_cache: true,
            });
        }

        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return skipped(events, ProviderError::Cancelled(id.clone()));
            }

            let permit = match slot.breaker.try_acquire() {
                Ok(permit) => permit,
                Err(err) => return skipped(events, err),
            };

            let reservation = if descriptor.cost_per_call.is_zero() {
                None
            } else {
                match self.ledger.try_reserve(id, descriptor.cost_per_call, lead) {
                    Ok(reservation) => Some(reservation),
                    Err(reason) => {
                        return skipped(
                            events,
                            ProviderError::BudgetExceeded {
                                provider: id.clone(),
                                reason,
                            },
                        )
                    }
                }
            };

            tracing::debug!(provider = %id, attempt, "Calling provider");
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ProviderError::Cancelled(id.clone())),
                result = tokio::time::timeout(descriptor.timeout, provider.fetch(query)) => {
                    result.unwrap_or_else(|_| Err(ProviderError::Timeout(id.clone())))
                }
            };

            match outcome {
                Ok(value) => {
                    permit.success();
                    let cost = reservation.map_or(Cost::ZERO, |r| r.commit().amount);
                    self.cache.put(id, &key, &value, descriptor.cache_ttl).await;
                    events.push(ProviderEvent::new(id.clone(), CallOutcome::Success { cost }));
                    return Ok(Called {
                        value,
                        cost,
                        from_cache: false,
                    });
                }
                Err(err @ ProviderError::Cancelled(_)) => {
                    // The request already left; a paid provider bills it anyway.
                    let cost = reservation.map_or(Cost::ZERO, |r| r.commit().amount);
                    tracing::debug!(provider = %id, %cost, "Provider call cancelled in flight");
                    events.push(ProviderEvent::new(id.clone(), CallOutcome::Cancelled { cost }));
                    return Err(err);
                }
                Err(err) => {
                    drop(reservation);
                    if err.trips_breaker() {
                        permit.failure();
                    }

                    events.push(ProviderEvent::new(
                        id.clone(),
                        CallOutcome::Failed { kind: err.kind() },
                    ));

                    if matches!(err, ProviderError::Auth(_)) {
                        slot.disabled.store(true, Ordering::Release);
                        tracing::error!(provider = %id, "Authentication rejected, disabling provider for this run");
                        return Err(err);
                    }

                    if !err.is_retryable() || attempt >= self.retry.max_retries {
                        tracing::warn!(provider = %id, attempt, "Provider call failed: {}", err);
                        return Err(err);
                    }

                    let hint = match &err {
                        ProviderError::RateLimited { retry_after, .. } => *retry_after,
                        _ => None,
                    };
                    let delay = self.retry.delay(attempt, hint);
                    tracing::info!(provider = %id, attempt, ?delay, "Retrying after: {}", err);

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return skipped(events, ProviderError::Cancelled(id.clone()));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}
