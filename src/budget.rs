use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::errors::BudgetError;
use crate::models::ProviderId;

const MICROS_PER_DOLLAR: f64 = 1_000_000.0;

/// Money in micro-dollars. Integer arithmetic keeps the ledger exact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cost(u64);

impl Cost {
    pub const ZERO: Cost = Cost(0);

    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Negative or non-finite amounts collapse to zero.
    pub fn from_dollars(dollars: f64) -> Self {
        if !dollars.is_finite() || dollars <= 0.0 {
            return Self::ZERO;
        }
        Self((dollars * MICROS_PER_DOLLAR).round() as u64)
    }

    pub fn micros(self) -> u64 {
        self.0
    }

    pub fn as_dollars(self) -> f64 {
        self.0 as f64 / MICROS_PER_DOLLAR
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn saturating_sub(self, other: Cost) -> Cost {
        Cost(self.0.saturating_sub(other.0))
    }

    /// `self * fraction`, rounded down.
    pub fn scale(self, fraction: f64) -> Cost {
        Cost((self.0 as f64 * fraction.clamp(0.0, 1.0)).floor() as u64)
    }
}

impl Add for Cost {
    type Output = Cost;

    fn add(self, rhs: Cost) -> Cost {
        Cost(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Cost {
    fn add_assign(&mut self, rhs: Cost) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Sum for Cost {
    fn sum<I: Iterator<Item = Cost>>(iter: I) -> Cost {
        iter.fold(Cost::ZERO, Add::add)
    }
}

impl fmt::Display for Cost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${:.4}", self.as_dollars())
    }
}

// ============ Session ledger ============

#[derive(Debug, Default)]
struct LedgerState {
    spent: Cost,
    reserved: Cost,
    per_provider: BTreeMap<ProviderId, Cost>,
}

/// Point-in-time view of the ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetSnapshot {
    pub total_budget: Cost,
    pub spent: Cost,
    pub reserved: Cost,
    pub per_lead_cost_cap: Cost,
    pub per_provider_spend: BTreeMap<ProviderId, Cost>,
    pub soft_limit_reached: bool,
    pub exhausted: bool,
}

/// Session-scoped spend tracker.
///
/// Every paid call first reserves its cost, which counts against the budget
/// immediately. Success commits the reservation into `spent`, anything else
/// releases it. Because the check and the reservation happen under one lock,
/// `spent + reserved <= total_budget` holds at every instant regardless of how
/// many pipelines debit concurrently.
#[derive(Debug)]
pub struct BudgetLedger {
    total_budget: Cost,
    per_lead_cost_cap: Cost,
    soft_limit: Cost,
    state: Mutex<LedgerState>,
    soft_limit_reached: AtomicBool,
    exhausted: AtomicBool,
}

impl BudgetLedger {
    /// `soft_fraction` is the share of `total_budget` after which new leads
    /// should no longer be admitted.
    pub fn new(total_budget: Cost, per_lead_cost_cap: Cost, soft_fraction: f64) -> Self {
        Self {
            total_budget,
            per_lead_cost_cap,
            soft_limit: total_budget.scale(soft_fraction),
            state: Mutex::new(LedgerState::default()),
            soft_limit_reached: AtomicBool::new(false),
            exhausted: AtomicBool::new(false),
        }
    }

    pub fn total_budget(&self) -> Cost {
        self.total_budget
    }

    pub fn per_lead_cost_cap(&self) -> Cost {
        self.per_lead_cost_cap
    }

    pub fn spent(&self) -> Cost {
        self.state.lock().spent
    }

    pub fn remaining(&self) -> Cost {
        let state = self.state.lock();
        self.total_budget
            .saturating_sub(state.spent)
            .saturating_sub(state.reserved)
    }

    pub fn soft_limit_reached(&self) -> bool {
        self.soft_limit_reached.load(Ordering::Acquire)
    }

    /// Set once a paid call was refused by the global ceiling.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Acquire)
    }

    /// True when no new lead should start enrichment.
    pub fn admission_closed(&self) -> bool {
        self.soft_limit_reached() || self.is_exhausted()
    }

    /// Whether the unreserved remainder still covers a call of `amount`.
    pub fn can_fund(&self, amount: Cost) -> bool {
        self.remaining() >= amount
    }

    /// Atomically check both ceilings and set `amount` aside for `provider`.
    pub fn try_reserve<'a>(
        &'a self,
        provider: &ProviderId,
        amount: Cost,
        lead: &'a LeadBudget,
    ) -> Result<Reservation<'a>, BudgetError> {
        let mut state = self.state.lock();
        let mut lead_state = lead.state.lock();

        let lead_total = lead_state.spent + lead_state.reserved + amount;
        if lead_total > self.per_lead_cost_cap {
            tracing::debug!(
                lead = %lead.key,
                provider = %provider,
                "Per-lead cap {} would be exceeded ({} requested)",
                self.per_lead_cost_cap,
                amount
            );
            return Err(BudgetError::PerLeadCapExceeded);
        }

        let session_total = state.spent + state.reserved + amount;
        if session_total > self.total_budget {
            if !self.exhausted.swap(true, Ordering::AcqRel) {
                tracing::warn!(
                    provider = %provider,
                    "Session budget {} exhausted (spent {}, reserved {}, requested {})",
                    self.total_budget,
                    state.spent,
                    state.reserved,
                    amount
                );
            }
            return Err(BudgetError::GlobalBudgetExceeded);
        }

        state.reserved += amount;
        lead_state.reserved += amount;
        self.note_commitment(state.spent + state.reserved);

        Ok(Reservation {
            ledger: self,
            lead,
            provider: provider.clone(),
            amount,
            settled: false,
        })
    }

    /// Reserve and commit in one step.
    pub fn try_debit(
        &self,
        provider: &ProviderId,
        amount: Cost,
        lead: &LeadBudget,
    ) -> Result<Receipt, BudgetError> {
        Ok(self.try_reserve(provider, amount, lead)?.commit())
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        let state = self.state.lock();
        BudgetSnapshot {
            total_budget: self.total_budget,
            spent: state.spent,
            reserved: state.reserved,
            per_lead_cost_cap: self.per_lead_cost_cap,
            per_provider_spend: state.per_provider.clone(),
            soft_limit_reached: self.soft_limit_reached(),
            exhausted: self.is_exhausted(),
        }
    }

    fn settle(&self, lead: &LeadBudget, provider: &ProviderId, amount: Cost, commit: bool) -> Cost {
        let mut state = self.state.lock();
        let mut lead_state = lead.state.lock();

        state.reserved = state.reserved.saturating_sub(amount);
        lead_state.reserved = lead_state.reserved.saturating_sub(amount);

        if commit {
            state.spent += amount;
            lead_state.spent += amount;
            *state.per_provider.entry(provider.clone()).or_default() += amount;
        }

        state.spent
    }

    /// Pending reservations count toward the soft threshold so that
    /// concurrent leads cannot all be admitted before anything is spent.
    fn note_commitment(&self, committed: Cost) {
        if committed >= self.soft_limit && !self.soft_limit_reached.swap(true, Ordering::AcqRel) {
            tracing::warn!(
                "Soft budget threshold reached: committed {} of {} (threshold {})",
                committed,
                self.total_budget,
                self.soft_limit
            );
        }
    }
}

// ============ Per-lead accounting ============

#[derive(Debug, Default)]
struct LeadSpend {
    spent: Cost,
    reserved: Cost,
}

/// Spend of a single lead, checked against the ledger's per-lead cap.
#[derive(Debug)]
pub struct LeadBudget {
    key: String,
    state: Mutex<LeadSpend>,
}

impl LeadBudget {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            state: Mutex::new(LeadSpend::default()),
        }
    }

    pub fn spent(&self) -> Cost {
        self.state.lock().spent
    }
}

/// Cost set aside for one in-flight call. Dropping it without committing
/// returns the amount to the budget.
#[derive(Debug)]
pub struct Reservation<'a> {
    ledger: &'a BudgetLedger,
    lead: &'a LeadBudget,
    provider: ProviderId,
    amount: Cost,
    settled: bool,
}

impl Reservation<'_> {
    pub fn amount(&self) -> Cost {
        self.amount
    }

    pub fn commit(mut self) -> Receipt {
        self.settled = true;
        let spent_after = self
            .ledger
            .settle(self.lead, &self.provider, self.amount, true);
        Receipt {
            provider: self.provider.clone(),
            amount: self.amount,
            spent_after,
        }
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.ledger
                .settle(self.lead, &self.provider, self.amount, false);
        }
    }
}

/// Proof of a committed debit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Receipt {
    pub provider: ProviderId,
    pub amount: Cost,
    pub spent_after: Cost,
}
