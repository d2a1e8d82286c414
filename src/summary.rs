use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::budget::Cost;
use crate::errors::ErrorKind;
use crate::models::{
    CallOutcome, CandidateRecord, EnrichedLead, LeadStage, ProviderEvent, ProviderId, QualityGrade,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProviderUsage {
    /// Network calls attempted, retries included.
    pub calls: u64,
    pub successes: u64,
    pub cache_hits: u64,
    pub failures: u64,
    /// Calls refused before reaching the network.
    pub skipped: u64,
    pub circuit_rejections: u64,
    pub budget_refusals: u64,
    /// Calls sent and then abandoned when the run was cancelled.
    pub cancelled: u64,
    pub cost: Cost,
}

impl ProviderUsage {
    fn record(&mut self, outcome: &CallOutcome) {
        match outcome {
            CallOutcome::Success { cost } => {
                self.calls += 1;
                self.successes += 1;
                self.cost += *cost;
            }
            CallOutcome::CacheHit => self.cache_hits += 1,
            CallOutcome::Failed { .. } => {
                self.calls += 1;
                self.failures += 1;
            }
            CallOutcome::Cancelled { cost } => {
                self.calls += 1;
                self.cancelled += 1;
                self.cost += *cost;
            }
            CallOutcome::Skipped { kind } => {
                self.skipped += 1;
                match kind {
                    ErrorKind::CircuitOpen => self.circuit_rejections += 1,
                    ErrorKind::BudgetExceeded => self.budget_refusals += 1,
                    _ => {}
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QualityMetrics {
    pub qualified_count: usize,
    pub rejected_count: usize,
    pub rejection_reasons: BTreeMap<String, usize>,
    pub grades: BTreeMap<QualityGrade, usize>,
}

/// Output of one enrichment run. Every statistic is derived from the
/// emitted leads and run-level events, so callers can recompute it.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub leads: Vec<EnrichedLead>,
    pub total_processed: usize,
    pub total_cost: Cost,
    pub total_cost_dollars: f64,
    pub quality_metrics: QualityMetrics,
    pub provider_usage_stats: BTreeMap<ProviderId, ProviderUsage>,
    /// Number of leads affected by each error kind.
    pub error_counts: BTreeMap<ErrorKind, usize>,
    /// Candidates never admitted because the budget or the run was exhausted.
    pub unattempted: Vec<CandidateRecord>,
    pub unattempted_count: usize,
    pub duplicates_skipped: usize,
    /// Provider interactions not tied to a lead (place search).
    pub run_events: Vec<ProviderEvent>,
    pub aborted: bool,
}

impl RunSummary {
    pub fn from_leads(
        run_id: Uuid,
        leads: Vec<EnrichedLead>,
        run_events: Vec<ProviderEvent>,
        unattempted: Vec<CandidateRecord>,
        duplicates_skipped: usize,
        aborted: bool,
    ) -> Self {
        let mut quality_metrics = QualityMetrics::default();
        let mut provider_usage_stats: BTreeMap<ProviderId, ProviderUsage> = BTreeMap::new();
        let mut error_counts: BTreeMap<ErrorKind, usize> = BTreeMap::new();

        for lead in &leads {
            match lead.stage {
                LeadStage::Qualified => quality_metrics.qualified_count += 1,
                LeadStage::Rejected => {
                    quality_metrics.rejected_count += 1;
                    if let Some(reason) = &lead.rejection {
                        *quality_metrics
                            .rejection_reasons
                            .entry(reason.code())
                            .or_default() += 1;
                    }
                }
                _ => {}
            }
            if let Some(grade) = lead.quality_grade {
                *quality_metrics.grades.entry(grade).or_default() += 1;
            }
            for kind in lead.error_kinds() {
                *error_counts.entry(kind).or_default() += 1;
            }
        }

        let all_events = leads.iter().flat_map(|l| l.events.iter()).chain(run_events.iter());
        for event in all_events {
            provider_usage_stats
                .entry(event.provider.clone())
                .or_default()
                .record(&event.outcome);
        }
        for kind in run_events.iter().filter_map(ProviderEvent::error_kind) {
            *error_counts.entry(kind).or_default() += 1;
        }

        let total_cost: Cost = provider_usage_stats.values().map(|u| u.cost).sum();

        Self {
            run_id,
            total_processed: leads.len(),
            total_cost,
            total_cost_dollars: total_cost.as_dollars(),
            quality_metrics,
            provider_usage_stats,
            error_counts,
            unattempted_count: unattempted.len(),
            unattempted,
            duplicates_skipped,
            run_events,
            aborted,
            leads,
        }
    }

    pub fn qualified(&self) -> impl Iterator<Item = &EnrichedLead> {
        self.leads.iter().filter(|l| l.stage == LeadStage::Qualified)
    }

    pub fn rejected(&self) -> impl Iterator<Item = &EnrichedLead> {
        self.leads.iter().filter(|l| l.stage == LeadStage::Rejected)
    }
}
