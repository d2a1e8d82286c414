use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::budget::{BudgetLedger, LeadBudget};
use crate::cache::ResponseCache;
use crate::config::RunConfig;
use crate::enrichment::{extract_domain, prepare_candidate, validate_phone};
use crate::errors::{AppError, BudgetError, ProviderError};
use crate::models::{
    CallOutcome, CandidateRecord, EnrichedLead, EnrichmentField, FieldName, ProviderEvent,
    ProviderId, RejectionReason, SourceTrustClass,
};
use crate::providers::{
    Called, Deliverability, DiscoveredEmails, DomainQuery, EmailQuery, EmailVerificationProvider,
    GatewayOutcome, PlaceDetails, PlaceQuery, PlaceSearchQuery, ProviderGateway, ProviderSet,
};
use crate::quality;
use crate::scoring;
use crate::summary::RunSummary;

/// Per-run state shared by every lead pipeline of that run.
pub struct RunContext {
    pub run_id: Uuid,
    pub config: RunConfig,
    pub gateway: ProviderGateway,
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn new(providers: &ProviderSet, config: RunConfig, cancel: CancellationToken) -> Self {
        let ledger = Arc::new(BudgetLedger::new(
            config.total_budget,
            config.per_lead_cost_cap,
            config.soft_budget_fraction,
        ));
        let gateway = ProviderGateway::new(
            &providers.descriptors(),
            config.breaker,
            config.retry,
            ResponseCache::new(config.cache_capacity),
            ledger,
        );

        Self {
            run_id: Uuid::new_v4(),
            config,
            gateway,
            cancel,
        }
    }

    pub fn ledger(&self) -> &BudgetLedger {
        self.gateway.ledger()
    }

    /// Why no further lead should be admitted, if anything.
    fn admission_block(&self) -> Option<&'static str> {
        if self.cancel.is_cancelled() {
            return Some("run aborted");
        }
        let ledger = self.ledger();
        if ledger.admission_closed() {
            return Some("budget threshold reached");
        }
        match self.gateway.cheapest_paid_call() {
            Some(cost) if !ledger.can_fund(cost) => Some("remaining budget cannot fund a paid call"),
            _ => None,
        }
    }
}

/// What a lead task hands back to the run.
enum LeadResult {
    Finished(EnrichedLead),
    /// Every paid call was refused by the session budget before any went
    /// out; the candidate goes back to the unattempted list.
    Unfunded {
        candidate: CandidateRecord,
        events: Vec<ProviderEvent>,
    },
}

enum PipelineOutcome {
    Completed,
    Unfunded,
}

/// Drives candidates through enrichment, scoring and filtering.
pub struct DiscoveryOrchestrator {
    providers: ProviderSet,
    config: RunConfig,
}

impl DiscoveryOrchestrator {
    pub fn new(providers: ProviderSet, config: RunConfig) -> Self {
        Self { providers, config }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub async fn run(&self, candidates: Vec<CandidateRecord>) -> RunSummary {
        self.run_with_cancel(candidates, CancellationToken::new()).await
    }

    /// Run a batch. Cancelling `cancel` aborts in-flight provider calls;
    /// interrupted leads come back rejected with reason `aborted`.
    pub async fn run_with_cancel(
        &self,
        candidates: Vec<CandidateRecord>,
        cancel: CancellationToken,
    ) -> RunSummary {
        let ctx = Arc::new(RunContext::new(&self.providers, self.config.clone(), cancel));
        self.run_in(ctx, candidates, Vec::new()).await
    }

    /// Search for businesses, then enrich what the search found. The search
    /// call is cached, breaker-guarded and charged like any other call.
    pub async fn discover(&self, query: PlaceSearchQuery) -> Result<RunSummary, AppError> {
        let search = self
            .providers
            .place_search
            .clone()
            .ok_or_else(|| AppError::Config("no place search provider is enabled".to_string()))?;

        let ctx = Arc::new(RunContext::new(
            &self.providers,
            self.config.clone(),
            CancellationToken::new(),
        ));
        tracing::info!(run_id = %ctx.run_id, "Searching places for '{}'", query.text);

        let search_budget = LeadBudget::new(format!("search:{}", query.text));
        let outcome = ctx
            .gateway
            .call(search.as_ref(), &query, &search_budget, &ctx.cancel)
            .await;

        match outcome.result {
            Ok(called) => Ok(self.run_in(ctx, called.value, outcome.events).await),
            Err(e) => {
                // Only configuration problems end a run with an error.
                tracing::error!(run_id = %ctx.run_id, "Place search failed, nothing to enrich: {}", e);
                Ok(RunSummary::from_leads(
                    ctx.run_id,
                    Vec::new(),
                    outcome.events,
                    Vec::new(),
                    0,
                    ctx.cancel.is_cancelled(),
                ))
            }
        }
    }

    async fn run_in(
        &self,
        ctx: Arc<RunContext>,
        candidates: Vec<CandidateRecord>,
        mut run_events: Vec<ProviderEvent>,
    ) -> RunSummary {
        let span = tracing::info_span!("run", run_id = %ctx.run_id);
        async move {
            tracing::info!(
                "Starting run with {} candidates (concurrency {}, budget {})",
                candidates.len(),
                ctx.config.max_concurrent_leads,
                ctx.config.total_budget
            );

            let timer = ctx.config.run_timeout.map(|limit| {
                let cancel = ctx.cancel.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(limit).await;
                    tracing::warn!("Run timeout of {:?} reached, aborting", limit);
                    cancel.cancel();
                })
            });

            let (unique, duplicates_skipped) = dedupe(candidates);
            let (handles, mut unattempted) = self.admit(&ctx, unique).await;

            let mut leads = Vec::with_capacity(handles.len());
            for (candidate, handle) in handles {
                match handle.await {
                    Ok(LeadResult::Finished(lead)) => leads.push(lead),
                    Ok(LeadResult::Unfunded { candidate, events }) => {
                        tracing::info!("'{}' left unattempted, budget could not fund it", candidate.name);
                        run_events.extend(events);
                        unattempted.push(candidate);
                    }
                    Err(e) => {
                        tracing::error!("Lead task for '{}' failed: {}", candidate.name, e);
                        leads.push(EnrichedLead::rejected(
                            candidate,
                            RejectionReason::Internal {
                                message: e.to_string(),
                            },
                        ));
                    }
                }
            }

            if let Some(timer) = timer {
                timer.abort();
            }

            let budget = ctx.ledger().snapshot();
            for breaker in ctx.gateway.breaker_snapshots() {
                tracing::debug!(
                    provider = %breaker.provider,
                    state = ?breaker.state,
                    opened = breaker.times_opened,
                    rejected = breaker.rejected_calls,
                    "Breaker state at end of run"
                );
            }

            let summary = RunSummary::from_leads(
                ctx.run_id,
                leads,
                run_events,
                unattempted,
                duplicates_skipped,
                ctx.cancel.is_cancelled(),
            );

            tracing::info!(
                "Run finished: {} processed, {} qualified, {} rejected, {} unattempted, spent {} of {}",
                summary.total_processed,
                summary.quality_metrics.qualified_count,
                summary.quality_metrics.rejected_count,
                summary.unattempted_count,
                budget.spent,
                budget.total_budget
            );
            summary
        }
        .instrument(span)
        .await
    }

    /// Admit leads into the worker pool until the input, the budget or the
    /// run runs out. Returns the spawned pipelines and the leftovers.
    async fn admit(
        &self,
        ctx: &Arc<RunContext>,
        candidates: Vec<CandidateRecord>,
    ) -> (Vec<(CandidateRecord, JoinHandle<LeadResult>)>, Vec<CandidateRecord>) {
        let semaphore = Arc::new(Semaphore::new(ctx.config.max_concurrent_leads.max(1)));
        let mut handles = Vec::new();
        let mut unattempted = Vec::new();
        let mut pending = candidates.into_iter();

        while let Some(candidate) = pending.next() {
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => permit.ok(),
                _ = ctx.cancel.cancelled() => None,
            };

            let Some(permit) = permit else {
                unattempted.push(candidate);
                break;
            };

            if let Some(reason) = ctx.admission_block() {
                tracing::warn!(
                    "Not admitting further leads: {} (spent {}, remaining {})",
                    reason,
                    ctx.ledger().spent(),
                    ctx.ledger().remaining()
                );
                unattempted.push(candidate);
                break;
            }

            let task_ctx = ctx.clone();
            let providers = self.providers.clone();
            let fallback = candidate.clone();
            let handle = tokio::spawn(
                async move {
                    let _permit = permit;
                    process_lead(&task_ctx, &providers, candidate).await
                }
                .in_current_span(),
            );
            handles.push((fallback, handle));
        }

        unattempted.extend(pending);
        if !unattempted.is_empty() {
            tracing::info!("{} candidates left unattempted", unattempted.len());
        }
        (handles, unattempted)
    }
}

fn dedupe(candidates: Vec<CandidateRecord>) -> (Vec<CandidateRecord>, usize) {
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(candidates.len());
    let mut duplicates = 0;
    for candidate in candidates {
        if seen.insert(candidate.key()) {
            unique.push(candidate);
        } else {
            tracing::debug!("Skipping duplicate candidate '{}'", candidate.name);
            duplicates += 1;
        }
    }
    (unique, duplicates)
}

async fn process_lead(ctx: &RunContext, providers: &ProviderSet, candidate: CandidateRecord) -> LeadResult {
    let prepared = match prepare_candidate(&candidate, &ctx.config.phone_region) {
        Ok(prepared) => prepared,
        Err(e) => {
            tracing::warn!("Rejecting malformed candidate: {}", e);
            return LeadResult::Finished(EnrichedLead::rejected(
                candidate,
                RejectionReason::InvalidRecord {
                    message: e.to_string(),
                },
            ));
        }
    };

    let mut lead = EnrichedLead::new(prepared);
    let span = tracing::debug_span!("lead", key = %lead.key);

    match LeadPipeline::new(ctx, providers, &lead.key)
        .run(&mut lead)
        .instrument(span)
        .await
    {
        Ok(PipelineOutcome::Completed) => {}
        Ok(PipelineOutcome::Unfunded) => {
            return LeadResult::Unfunded {
                candidate,
                events: lead.events,
            }
        }
        Err(e) => {
            tracing::error!(lead = %lead.key, "Lead pipeline failed: {}", e);
            if !lead.stage.is_terminal() {
                let reason = RejectionReason::Internal {
                    message: e.to_string(),
                };
                if let Err(e) = lead.reject(reason) {
                    tracing::error!(lead = %lead.key, "Could not reject lead: {}", e);
                }
            }
        }
    }

    LeadResult::Finished(lead)
}

/// Enrichment of one lead: `discovered -> enriched -> scored -> qualified | rejected`.
struct LeadPipeline<'a> {
    ctx: &'a RunContext,
    providers: &'a ProviderSet,
    budget: LeadBudget,
    interrupted: bool,
    /// A paid call was refused by the session ceiling.
    refused_by_budget: bool,
    /// A paid provider was reached, or served from cache.
    paid_attempted: bool,
}

impl<'a> LeadPipeline<'a> {
    fn new(ctx: &'a RunContext, providers: &'a ProviderSet, key: &str) -> Self {
        Self {
            ctx,
            providers,
            budget: LeadBudget::new(key),
            interrupted: false,
            refused_by_budget: false,
            paid_attempted: false,
        }
    }

    async fn run(mut self, lead: &mut EnrichedLead) -> Result<PipelineOutcome, AppError> {
        let known_domain = lead.candidate.website.as_deref().and_then(extract_domain);
        let place_query = PlaceQuery::for_candidate(&lead.candidate);
        let company = Some(lead.candidate.name.clone());

        // Place detail and email discovery are independent when the website
        // is already known; otherwise discovery waits for the place website.
        let (place, discovery) = match &known_domain {
            Some(domain) => {
                tokio::join!(
                    self.fetch_place(&place_query),
                    self.discover_emails(domain, company.clone())
                )
            }
            None => (self.fetch_place(&place_query).await, Vec::new()),
        };

        let mut found_domain = None;
        if let Some((source, outcome)) = place {
            if let Some(called) = self.absorb(lead, outcome) {
                found_domain = called.value.website.as_deref().and_then(extract_domain);
                self.apply_place(lead, &source, called)?;
            }
        }

        let discovery = match (&known_domain, found_domain) {
            (None, Some(domain)) if !self.interrupted => self.discover_emails(&domain, company).await,
            _ => discovery,
        };
        for (source, outcome) in discovery {
            if let Some(called) = self.absorb(lead, outcome) {
                apply_emails(lead, &source, called)?;
            }
        }

        if !self.interrupted {
            if let Some(verifier) = self.providers.email_verification.clone() {
                self.verify_emails(lead, verifier.as_ref()).await?;
            }
        }

        if self.interrupted {
            tracing::info!("Lead interrupted by run abort");
            lead.reject(RejectionReason::Aborted)?;
            return Ok(PipelineOutcome::Completed);
        }

        if self.refused_by_budget && !self.paid_attempted {
            tracing::info!("No paid call could be funded for this lead");
            return Ok(PipelineOutcome::Unfunded);
        }

        lead.mark_enriched()?;
        let score = scoring::score(lead, &self.ctx.config.scoring);
        lead.set_score(score, scoring::grade(lead, score))?;

        match quality::evaluate(lead, &self.ctx.config.requirements) {
            Ok(()) => {
                tracing::info!(score, "Lead qualified");
                lead.qualify()?;
            }
            Err(reason) => {
                tracing::info!(score, reason = %reason.code(), "Lead rejected");
                lead.reject(reason)?;
            }
        }
        Ok(PipelineOutcome::Completed)
    }

    async fn fetch_place(&self, query: &PlaceQuery) -> Option<(ProviderId, GatewayOutcome<PlaceDetails>)> {
        let provider = self.providers.place_detail.as_ref()?;
        let outcome = self
            .ctx
            .gateway
            .call(provider.as_ref(), query, &self.budget, &self.ctx.cancel)
            .await;
        Some((provider.descriptor().id.clone(), outcome))
    }

    async fn discover_emails(
        &self,
        domain: &str,
        company: Option<String>,
    ) -> Vec<(ProviderId, GatewayOutcome<DiscoveredEmails>)> {
        let query = DomainQuery {
            domain: domain.to_string(),
            company,
        };
        let query = &query;
        let calls: Vec<_> = self
            .providers
            .email_discovery
            .iter()
            .map(|provider| async move {
                let outcome = self
                    .ctx
                    .gateway
                    .call(provider.as_ref(), query, &self.budget, &self.ctx.cancel)
                    .await;
                (provider.descriptor().id.clone(), outcome)
            })
            .collect();
        futures::future::join_all(calls).await
    }

    /// Verify discovered emails best-first until one is deliverable or the
    /// verification allowance is used up.
    async fn verify_emails(
        &mut self,
        lead: &mut EnrichedLead,
        verifier: &EmailVerificationProvider,
    ) -> Result<(), AppError> {
        let already_verified = lead
            .evidence(FieldName::Email)
            .any(|f| f.source_trust_class == SourceTrustClass::Verified);
        if already_verified {
            return Ok(());
        }

        let mut ranked: Vec<EnrichmentField> = lead.evidence(FieldName::Email).cloned().collect();
        ranked.sort_by(|a, b| b.precedence(a));
        let mut seen = BTreeSet::new();
        ranked.retain(|f| seen.insert(f.value.to_ascii_lowercase()));

        let source = verifier.descriptor().id.clone();
        for field in ranked.into_iter().take(self.ctx.config.max_email_verifications) {
            let query = EmailQuery {
                email: field.value.clone(),
            };
            let outcome = self
                .ctx
                .gateway
                .call(verifier, &query, &self.budget, &self.ctx.cancel)
                .await;
            let Some(called) = self.absorb(lead, outcome) else {
                break;
            };

            match called.value.verdict {
                Deliverability::Deliverable => {
                    lead.append_field(
                        FieldName::Email,
                        EnrichmentField::new(
                            field.value,
                            source.clone(),
                            SourceTrustClass::Verified,
                            called.value.confidence,
                            called.cost,
                        )
                        .confirming(),
                    )?;
                    break;
                }
                Deliverability::Undeliverable => {
                    tracing::debug!("Invalidating undeliverable email {}", field.value);
                    lead.invalidate(FieldName::Email, &field.value)?;
                }
                Deliverability::Risky => {}
            }
        }
        Ok(())
    }

    /// Record the call's events on the lead and turn failures into "field
    /// unavailable".
    fn absorb<T>(&mut self, lead: &mut EnrichedLead, outcome: GatewayOutcome<T>) -> Option<Called<T>> {
        let ctx = self.ctx;
        self.paid_attempted |= outcome.events.iter().any(|event| {
            !matches!(event.outcome, CallOutcome::Skipped { .. }) && ctx.gateway.is_paid(&event.provider)
        });
        lead.record_events(outcome.events);
        match outcome.result {
            Ok(called) => Some(called),
            Err(err) => {
                match &err {
                    ProviderError::Cancelled(_) => self.interrupted = true,
                    ProviderError::BudgetExceeded {
                        reason: BudgetError::GlobalBudgetExceeded,
                        ..
                    } => self.refused_by_budget = true,
                    _ => {}
                }
                tracing::debug!(provider = %err.provider(), "Field unavailable: {}", err);
                None
            }
        }
    }

    fn apply_place(
        &self,
        lead: &mut EnrichedLead,
        source: &ProviderId,
        called: Called<PlaceDetails>,
    ) -> Result<(), AppError> {
        let details = called.value;
        let observed = |value: String| {
            EnrichmentField::new(
                value,
                source.clone(),
                SourceTrustClass::Observed,
                details.confidence,
                called.cost,
            )
        };

        if let Some(phone) = details.phone.as_deref() {
            match validate_phone(phone, &self.ctx.config.phone_region) {
                (true, normalized) => lead.append_field(FieldName::Phone, observed(normalized))?,
                (false, reason) => tracing::debug!("Ignoring place phone {}: {}", phone, reason),
            }
        }
        if let Some(website) = details.website.clone() {
            lead.append_field(FieldName::Website, observed(website))?;
        }
        if let Some(address) = details.formatted_address.clone() {
            lead.append_field(FieldName::Address, observed(address))?;
        }
        Ok(())
    }
}

fn apply_emails(
    lead: &mut EnrichedLead,
    source: &ProviderId,
    called: Called<DiscoveredEmails>,
) -> Result<(), AppError> {
    for email in called.value.emails {
        lead.append_field(
            FieldName::Email,
            EnrichmentField::new(email.address, source.clone(), email.trust, email.confidence, called.cost),
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedupe_by_identity() {
        let (unique, duplicates) = dedupe(vec![
            CandidateRecord::new("Blue Door Bakery", "12 Main St"),
            CandidateRecord::new("blue door  bakery", "12 MAIN ST"),
            CandidateRecord::new("Red Door Cafe", "14 Main St"),
        ]);
        assert_eq!(unique.len(), 2);
        assert_eq!(duplicates, 1);
    }

    #[tokio::test]
    async fn test_invalid_candidate_rejected_without_calls() {
        let orchestrator = DiscoveryOrchestrator::new(ProviderSet::default(), RunConfig::default());
        let summary = orchestrator
            .run(vec![CandidateRecord::new("", "12 Main St")])
            .await;

        assert_eq!(summary.total_processed, 1);
        assert_eq!(summary.quality_metrics.rejection_reasons["invalid_record"], 1);
        assert!(summary.leads[0].events.is_empty());
        assert_eq!(summary.error_counts[&crate::errors::ErrorKind::Validation], 1);
    }

    #[tokio::test]
    async fn test_no_providers_means_missing_email() {
        let orchestrator = DiscoveryOrchestrator::new(ProviderSet::default(), RunConfig::default());
        let summary = orchestrator
            .run(vec![CandidateRecord::new("Blue Door Bakery", "12 Main St")])
            .await;

        assert_eq!(summary.quality_metrics.rejection_reasons["missing_email"], 1);
        assert_eq!(summary.leads[0].final_confidence_score, Some(10.0));
    }

    #[tokio::test]
    async fn test_discover_without_search_provider_is_config_error() {
        let orchestrator = DiscoveryOrchestrator::new(ProviderSet::default(), RunConfig::default());
        let result = orchestrator
            .discover(PlaceSearchQuery {
                text: "bakery".to_string(),
            })
            .await;
        assert!(matches!(result, Err(AppError::Config(_))));
    }
}
