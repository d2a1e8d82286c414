use chrono::{DateTime, Utc};
use failsafe::backoff::{self, Constant};
use failsafe::failure_policy::{self, ConsecutiveFailures};
use failsafe::{Config, Instrument, StateMachine};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::ProviderError;
use crate::models::ProviderId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time spent open before a half-open trial is allowed.
    pub cooldown: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

#[derive(Debug, Default)]
struct BreakerTelemetry {
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    times_opened: AtomicU64,
    rejected_calls: AtomicU64,
    last_failure: Mutex<Option<DateTime<Utc>>>,
}

/// Mirrors state transitions of the failsafe state machine into telemetry
/// and logs them.
#[derive(Debug, Clone)]
struct BreakerInstrument {
    provider: ProviderId,
    telemetry: Arc<BreakerTelemetry>,
}

impl Instrument for BreakerInstrument {
    fn on_call_rejected(&self) {
        self.telemetry.rejected_calls.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(provider = %self.provider, "Circuit open, call rejected");
    }

    fn on_open(&self) {
        self.telemetry.state.store(OPEN, Ordering::Release);
        self.telemetry.times_opened.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            provider = %self.provider,
            failures = self.telemetry.consecutive_failures.load(Ordering::Relaxed),
            "Circuit opened"
        );
    }

    fn on_half_open(&self) {
        self.telemetry.state.store(HALF_OPEN, Ordering::Release);
        tracing::info!(provider = %self.provider, "Circuit half-open, allowing one trial call");
    }

    fn on_closed(&self) {
        self.telemetry.state.store(CLOSED, Ordering::Release);
        tracing::info!(provider = %self.provider, "Circuit closed");
    }
}

type Machine = StateMachine<ConsecutiveFailures<Constant>, BreakerInstrument>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub provider: ProviderId,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub times_opened: u64,
    pub rejected_calls: u64,
}

/// Failure isolation for one provider.
///
/// `closed -> open` after `failure_threshold` consecutive failures,
/// `open -> half-open` once the cooldown has elapsed, then exactly one trial
/// call decides between `closed` and `open` again.
pub struct ProviderBreaker {
    provider: ProviderId,
    machine: Machine,
    telemetry: Arc<BreakerTelemetry>,
    trial_in_flight: AtomicBool,
}

impl ProviderBreaker {
    pub fn new(provider: ProviderId, settings: BreakerSettings) -> Self {
        let telemetry = Arc::new(BreakerTelemetry::default());
        let instrument = BreakerInstrument {
            provider: provider.clone(),
            telemetry: telemetry.clone(),
        };
        let policy = failure_policy::consecutive_failures(
            settings.failure_threshold.max(1),
            backoff::constant(settings.cooldown),
        );

        Self {
            provider,
            machine: Config::new().failure_policy(policy).instrument(instrument).build(),
            telemetry,
            trial_in_flight: AtomicBool::new(false),
        }
    }

    pub fn provider(&self) -> &ProviderId {
        &self.provider
    }

    pub fn state(&self) -> CircuitState {
        match self.telemetry.state.load(Ordering::Acquire) {
            OPEN => CircuitState::Open,
            HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    /// Ask permission for one call. Fails fast while open, and while another
    /// half-open trial is already in flight.
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>, ProviderError> {
        if !self.machine.is_call_permitted() {
            return Err(ProviderError::CircuitOpen(self.provider.clone()));
        }

        if self.state() == CircuitState::HalfOpen {
            if self
                .trial_in_flight
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                self.telemetry.rejected_calls.fetch_add(1, Ordering::Relaxed);
                return Err(ProviderError::CircuitOpen(self.provider.clone()));
            }
            return Ok(BreakerPermit {
                breaker: self,
                trial: true,
            });
        }

        Ok(BreakerPermit {
            breaker: self,
            trial: false,
        })
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            provider: self.provider.clone(),
            state: self.state(),
            consecutive_failures: self.telemetry.consecutive_failures.load(Ordering::Relaxed),
            last_failure: *self.telemetry.last_failure.lock(),
            times_opened: self.telemetry.times_opened.load(Ordering::Relaxed),
            rejected_calls: self.telemetry.rejected_calls.load(Ordering::Relaxed),
        }
    }
}

/// Permission for one call. Report the outcome with `success`/`failure`;
/// dropping it unreported leaves the breaker untouched.
pub struct BreakerPermit<'a> {
    breaker: &'a ProviderBreaker,
    trial: bool,
}

impl BreakerPermit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(self) {
        self.breaker
            .telemetry
            .consecutive_failures
            .store(0, Ordering::Relaxed);
        self.breaker.machine.on_success();
    }

    pub fn failure(self) {
        self.breaker
            .telemetry
            .consecutive_failures
            .fetch_add(1, Ordering::Relaxed);
        *self.breaker.telemetry.last_failure.lock() = Some(Utc::now());
        self.breaker.machine.on_error();
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if self.trial {
            self.breaker.trial_in_flight.store(false, Ordering::Release);
        }
    }
}
