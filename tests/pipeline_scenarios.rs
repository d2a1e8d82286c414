/// End-to-end pipeline scenarios with in-memory providers
/// Exercises budget admission, circuit breaking, caching, cancellation and the
/// place / discovery / verification ordering
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use lead_enrichment::budget::{BudgetLedger, Cost, LeadBudget};
use lead_enrichment::cache::ResponseCache;
use lead_enrichment::circuit_breaker::{BreakerSettings, CircuitState};
use lead_enrichment::config::RunConfig;
use lead_enrichment::errors::{ErrorKind, ProviderError};
use lead_enrichment::models::{
    CallOutcome, CandidateRecord, FieldName, LeadStage, ProviderId, QualityGrade, SourceTrustClass,
};
use lead_enrichment::providers::{
    Capability, Deliverability, DiscoveredEmail, DiscoveredEmails, DomainQuery, EmailDiscoveryProvider,
    EmailQuery, EmailVerification, EmailVerificationProvider, PlaceDetailProvider, PlaceDetails,
    PlaceQuery, PlaceSearchProvider, PlaceSearchQuery, Provider, ProviderDescriptor, ProviderGateway,
    ProviderSet, RetryPolicy,
};
use lead_enrichment::DiscoveryOrchestrator;

/// Ordered record of provider activity shared by the fakes of one scenario.
type CallLog = Arc<Mutex<Vec<String>>>;

fn position(log: &CallLog, entry: &str) -> usize {
    log.lock()
        .iter()
        .position(|e| e == entry)
        .unwrap_or_else(|| panic!("{} not in {:?}", entry, log.lock()))
}

fn descriptor(id: &str, capability: Capability, cost: f64) -> ProviderDescriptor {
    ProviderDescriptor {
        id: ProviderId::from(id),
        capability,
        cost_per_call: Cost::from_dollars(cost),
        timeout: Duration::from_secs(5),
        cache_ttl: Duration::from_secs(3600),
    }
}

/// Email discovery backed by a domain table, with a configurable failure mode.
struct FakeDiscovery {
    descriptor: ProviderDescriptor,
    emails: HashMap<String, Vec<DiscoveredEmail>>,
    failure: Option<ProviderError>,
    delay: Duration,
    calls: AtomicUsize,
    seen: Mutex<Vec<String>>,
    log: CallLog,
}

impl FakeDiscovery {
    fn new(id: &str, cost: f64) -> Self {
        Self {
            descriptor: descriptor(id, Capability::EmailDiscovery, cost),
            emails: HashMap::new(),
            failure: None,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            log: CallLog::default(),
        }
    }

    fn found(mut self, domain: &str, local: &str, trust: SourceTrustClass, confidence: f64) -> Self {
        self.emails.entry(domain.to_string()).or_default().push(DiscoveredEmail {
            address: format!("{}@{}", local, domain),
            trust,
            confidence,
        });
        self
    }

    fn verified(self, domain: &str, local: &str, confidence: f64) -> Self {
        self.found(domain, local, SourceTrustClass::Verified, confidence)
    }

    fn observed(self, domain: &str, local: &str, confidence: f64) -> Self {
        self.found(domain, local, SourceTrustClass::Observed, confidence)
    }

    fn logging(mut self, log: &CallLog) -> Self {
        self.log = log.clone();
        self
    }

    fn failing(mut self, err: ProviderError) -> Self {
        self.failure = Some(err);
        self
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for FakeDiscovery {
    type Query = DomainQuery;
    type Response = DiscoveredEmails;

    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn fetch(&self, query: &DomainQuery) -> Result<DiscoveredEmails, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(query.domain.clone());
        self.log.lock().push(format!("{}:start", self.descriptor.id));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.log.lock().push(format!("{}:end", self.descriptor.id));
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        Ok(DiscoveredEmails {
            emails: self.emails.get(&query.domain).cloned().unwrap_or_default(),
            organization: None,
        })
    }
}

/// Place detail that always resolves to the same listing.
struct FakePlaces {
    descriptor: ProviderDescriptor,
    details: PlaceDetails,
    delay: Duration,
    log: CallLog,
}

impl FakePlaces {
    fn new(website: Option<&str>, log: &CallLog) -> Self {
        Self {
            descriptor: descriptor("places", Capability::PlaceDetail, 0.017),
            details: PlaceDetails {
                place_id: Some("place-1".to_string()),
                phone: Some("(512) 474-2212".to_string()),
                website: website.map(str::to_string),
                formatted_address: Some("12 Main St, Austin, TX 78701".to_string()),
                rating: Some(4.7),
                review_count: Some(210),
                confidence: 90.0,
            },
            delay: Duration::ZERO,
            log: log.clone(),
        }
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Provider for FakePlaces {
    type Query = PlaceQuery;
    type Response = PlaceDetails;

    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn fetch(&self, _query: &PlaceQuery) -> Result<PlaceDetails, ProviderError> {
        self.log.lock().push("places:start".to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.log.lock().push("places:end".to_string());
        Ok(self.details.clone())
    }
}

/// Verifier with scripted verdicts; unknown addresses come back risky.
struct FakeVerifier {
    descriptor: ProviderDescriptor,
    verdicts: HashMap<String, Deliverability>,
    log: CallLog,
}

impl FakeVerifier {
    fn new(log: &CallLog) -> Self {
        Self {
            descriptor: descriptor("neverbounce", Capability::EmailVerification, 0.008),
            verdicts: HashMap::new(),
            log: log.clone(),
        }
    }

    fn verdict(mut self, email: &str, verdict: Deliverability) -> Self {
        self.verdicts.insert(email.to_string(), verdict);
        self
    }
}

#[async_trait]
impl Provider for FakeVerifier {
    type Query = EmailQuery;
    type Response = EmailVerification;

    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn fetch(&self, query: &EmailQuery) -> Result<EmailVerification, ProviderError> {
        self.log.lock().push(format!("verify:{}", query.email));
        let verdict = self
            .verdicts
            .get(&query.email)
            .copied()
            .unwrap_or(Deliverability::Risky);
        Ok(EmailVerification {
            email: query.email.clone(),
            verdict,
            confidence: 95.0,
        })
    }
}

/// Place search that never gets an answer through.
struct FailingSearch {
    descriptor: ProviderDescriptor,
}

#[async_trait]
impl Provider for FailingSearch {
    type Query = PlaceSearchQuery;
    type Response = Vec<CandidateRecord>;

    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn fetch(&self, _query: &PlaceSearchQuery) -> Result<Vec<CandidateRecord>, ProviderError> {
        Err(upstream("places_search"))
    }
}

fn candidate(name: &str, domain: &str) -> CandidateRecord {
    CandidateRecord::new(name, format!("{} Main St, Austin, TX", name.len()))
        .with_phone("+15124742212")
        .with_website(format!("https://{}", domain))
}

fn orchestrator(discovery: Arc<FakeDiscovery>, config: RunConfig) -> DiscoveryOrchestrator {
    let providers = ProviderSet {
        email_discovery: vec![discovery as Arc<EmailDiscoveryProvider>],
        ..ProviderSet::default()
    };
    DiscoveryOrchestrator::new(providers, config)
}

fn upstream(id: &str) -> ProviderError {
    ProviderError::Upstream {
        provider: ProviderId::from(id),
        status: 503,
        message: "unavailable".to_string(),
    }
}

#[cfg(test)]
mod qualification_scenarios {
    use super::*;

    #[tokio::test]
    async fn test_verified_emails_qualify_and_missing_email_rejects() {
        let discovery = Arc::new(
            FakeDiscovery::new("hunter", 0.04)
                .verified("bluedoor.com", "owner", 95.0)
                .verified("redoak.com", "hello", 95.0),
        );
        let summary = orchestrator(discovery.clone(), RunConfig::default())
            .run(vec![
                candidate("Blue Door Bakery", "bluedoor.com"),
                candidate("Red Oak Cafe", "redoak.com"),
                candidate("Green Leaf Deli", "greenleaf.com"),
            ])
            .await;

        assert_eq!(summary.total_processed, 3);
        assert_eq!(summary.quality_metrics.qualified_count, 2);
        assert_eq!(summary.quality_metrics.rejection_reasons["missing_email"], 1);

        for lead in summary.qualified() {
            assert_eq!(lead.final_confidence_score, Some(82.0));
            assert_eq!(lead.quality_grade, Some(QualityGrade::B));
            let email = lead.winner(FieldName::Email).unwrap();
            assert_eq!(email.source_trust_class, SourceTrustClass::Verified);
        }

        let rejected: Vec<_> = summary.rejected().collect();
        assert_eq!(rejected[0].candidate.name, "Green Leaf Deli");
        assert_eq!(rejected[0].final_confidence_score, Some(25.0));

        assert_eq!(summary.total_cost, Cost::from_dollars(0.12));
        assert_eq!(discovery.calls(), 3);
    }

    #[tokio::test]
    async fn test_stats_do_not_depend_on_concurrency() {
        let candidates: Vec<CandidateRecord> = (0..8)
            .map(|i| candidate(&format!("Shop {}", i), &format!("shop{}.com", i)))
            .collect();

        let mut results = Vec::new();
        for concurrency in [1, 5] {
            let mut discovery = FakeDiscovery::new("hunter", 0.04);
            for i in (0..8).step_by(2) {
                discovery = discovery.verified(&format!("shop{}.com", i), "owner", 95.0);
            }
            let config = RunConfig {
                max_concurrent_leads: concurrency,
                ..RunConfig::default()
            };
            let summary = orchestrator(Arc::new(discovery), config)
                .run(candidates.clone())
                .await;
            results.push(summary);
        }

        let (serial, parallel) = (&results[0], &results[1]);
        assert_eq!(serial.quality_metrics, parallel.quality_metrics);
        assert_eq!(serial.provider_usage_stats, parallel.provider_usage_stats);
        assert_eq!(serial.total_cost, parallel.total_cost);
        assert_eq!(serial.quality_metrics.qualified_count, 4);

        let names = |s: &lead_enrichment::RunSummary| {
            let mut names: Vec<String> = s.qualified().map(|l| l.candidate.name.clone()).collect();
            names.sort();
            names
        };
        assert_eq!(names(serial), names(parallel));
    }

    #[tokio::test]
    async fn test_duplicate_candidates_processed_once() {
        let discovery = Arc::new(FakeDiscovery::new("hunter", 0.04));
        let summary = orchestrator(discovery.clone(), RunConfig::default())
            .run(vec![
                candidate("Blue Door Bakery", "bluedoor.com"),
                candidate("Blue Door Bakery", "bluedoor.com"),
            ])
            .await;

        assert_eq!(summary.total_processed, 1);
        assert_eq!(summary.duplicates_skipped, 1);
        assert_eq!(discovery.calls(), 1);
    }
}

#[cfg(test)]
mod budget_scenarios {
    use super::*;

    #[tokio::test]
    async fn test_admission_stops_at_soft_limit() {
        let discovery = Arc::new(FakeDiscovery::new("hunter", 0.05));
        let config = RunConfig {
            max_concurrent_leads: 1,
            total_budget: Cost::from_dollars(0.10),
            per_lead_cost_cap: Cost::from_dollars(0.05),
            ..RunConfig::default()
        };
        let candidates: Vec<CandidateRecord> = (0..5)
            .map(|i| candidate(&format!("Shop {}", i), &format!("shop{}.com", i)))
            .collect();

        let summary = orchestrator(discovery.clone(), config).run(candidates).await;

        assert!(summary.total_processed <= 2);
        assert_eq!(summary.total_processed + summary.unattempted_count, 5);
        assert!(summary.unattempted_count >= 3);
        assert!(summary.total_cost <= Cost::from_dollars(0.10));

        let per_lead: Cost = summary.leads.iter().map(|l| l.total_cost()).sum();
        assert_eq!(per_lead, summary.total_cost);
        assert_eq!(discovery.calls(), summary.total_processed);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_leaves_rest_unattempted() {
        let mut discovery = FakeDiscovery::new("hunter", 0.05);
        for i in 0..5 {
            discovery = discovery.verified(&format!("shop{}.com", i), "owner", 95.0);
        }
        let discovery = Arc::new(discovery);
        let config = RunConfig {
            total_budget: Cost::from_dollars(0.10),
            ..RunConfig::default()
        };
        assert!(config.max_concurrent_leads >= 5);
        let candidates: Vec<CandidateRecord> = (0..5)
            .map(|i| candidate(&format!("Shop {}", i), &format!("shop{}.com", i)))
            .collect();

        let summary = orchestrator(discovery.clone(), config).run(candidates).await;

        assert!(!summary.aborted);
        assert_eq!(summary.total_processed, 2);
        assert_eq!(summary.quality_metrics.qualified_count, 2);
        assert_eq!(summary.unattempted_count, 3);
        assert_eq!(summary.total_cost, Cost::from_dollars(0.10));
        assert_eq!(discovery.calls(), 2);

        let usage = &summary.provider_usage_stats[&ProviderId::from("hunter")];
        assert_eq!((usage.successes, usage.budget_refusals), (2, 3));
        assert!(!summary.quality_metrics.rejection_reasons.contains_key("aborted"));
    }

    #[tokio::test]
    async fn test_per_lead_cap_skips_paid_call() {
        let discovery = Arc::new(FakeDiscovery::new("hunter", 0.05));
        let config = RunConfig {
            per_lead_cost_cap: Cost::from_dollars(0.04),
            ..RunConfig::default()
        };

        let summary = orchestrator(discovery.clone(), config)
            .run(vec![candidate("Blue Door Bakery", "bluedoor.com")])
            .await;

        assert_eq!(discovery.calls(), 0);
        assert_eq!(summary.total_cost, Cost::ZERO);
        let usage = &summary.provider_usage_stats[&ProviderId::from("hunter")];
        assert_eq!(usage.budget_refusals, 1);
        assert_eq!(summary.error_counts[&ErrorKind::BudgetExceeded], 1);
    }

    #[tokio::test]
    async fn test_cache_hit_costs_nothing() {
        let discovery = Arc::new(FakeDiscovery::new("hunter", 0.04).verified("bluedoor.com", "owner", 95.0));
        let config = RunConfig {
            max_concurrent_leads: 1,
            ..RunConfig::default()
        };

        let summary = orchestrator(discovery.clone(), config)
            .run(vec![
                candidate("Blue Door Bakery", "bluedoor.com"),
                candidate("Blue Door Bakery Downtown", "bluedoor.com"),
            ])
            .await;

        assert_eq!(discovery.calls(), 1);
        assert_eq!(summary.total_cost, Cost::from_dollars(0.04));
        let usage = &summary.provider_usage_stats[&ProviderId::from("hunter")];
        assert_eq!((usage.calls, usage.cache_hits), (1, 1));
        assert_eq!(summary.quality_metrics.qualified_count, 2);
    }
}

#[cfg(test)]
mod breaker_scenarios {
    use super::*;

    fn gateway(descriptor: &ProviderDescriptor, settings: BreakerSettings) -> ProviderGateway {
        ProviderGateway::new(
            std::slice::from_ref(descriptor),
            settings,
            RetryPolicy::none(),
            ResponseCache::new(100),
            Arc::new(BudgetLedger::new(Cost::from_dollars(10.0), Cost::from_dollars(10.0), 0.8)),
        )
    }

    #[tokio::test]
    async fn test_open_circuit_skips_network() {
        let provider = FakeDiscovery::new("flaky", 0.0).failing(upstream("flaky"));
        let gateway = gateway(&provider.descriptor, BreakerSettings::default());
        let lead = LeadBudget::new("lead");
        let cancel = CancellationToken::new();

        for i in 0..5 {
            let query = DomainQuery {
                domain: format!("shop{}.com", i),
                company: None,
            };
            let outcome = gateway.call(&provider, &query, &lead, &cancel).await;
            assert!(matches!(outcome.result, Err(ProviderError::Upstream { .. })));
        }
        assert_eq!(provider.calls(), 5);

        let query = DomainQuery {
            domain: "shop6.com".to_string(),
            company: None,
        };
        let outcome = gateway.call(&provider, &query, &lead, &cancel).await;
        assert_eq!(
            outcome.result.unwrap_err(),
            ProviderError::CircuitOpen(ProviderId::from("flaky"))
        );
        assert_eq!(
            outcome.events[0].outcome,
            CallOutcome::Skipped {
                kind: ErrorKind::CircuitOpen
            }
        );
        assert_eq!(provider.calls(), 5);
        assert_eq!(gateway.breaker_snapshots()[0].state, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_half_open_admits_single_trial() {
        let settings = BreakerSettings {
            failure_threshold: 1,
            cooldown: Duration::from_millis(50),
        };
        let failing = FakeDiscovery::new("flaky", 0.0).failing(upstream("flaky"));
        let gateway = gateway(&failing.descriptor, settings);
        let lead = LeadBudget::new("lead");
        let cancel = CancellationToken::new();
        let query = |d: &str| DomainQuery {
            domain: d.to_string(),
            company: None,
        };

        let _ = gateway.call(&failing, &query("a.com"), &lead, &cancel).await;
        assert_eq!(gateway.breaker_snapshots()[0].state, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;

        let recovered = FakeDiscovery::new("flaky", 0.0).slow(Duration::from_millis(50));
        let query_b = query("b.com");
        let query_c = query("c.com");
        let (first, second) = tokio::join!(
            gateway.call(&recovered, &query_b, &lead, &cancel),
            gateway.call(&recovered, &query_c, &lead, &cancel),
        );

        assert_eq!(recovered.calls(), 1);
        let outcomes = [first.result.is_ok(), second.result.is_ok()];
        assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
        assert_eq!(gateway.breaker_snapshots()[0].state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_failing_provider_trips_breaker_during_run() {
        let discovery = Arc::new(FakeDiscovery::new("flaky", 0.0).failing(upstream("flaky")));
        let config = RunConfig {
            max_concurrent_leads: 1,
            retry: RetryPolicy::none(),
            ..RunConfig::default()
        };
        let candidates: Vec<CandidateRecord> = (0..7)
            .map(|i| candidate(&format!("Shop {}", i), &format!("shop{}.com", i)))
            .collect();

        let summary = orchestrator(discovery.clone(), config).run(candidates).await;

        assert_eq!(discovery.calls(), 5);
        assert_eq!(summary.total_processed, 7);
        let usage = &summary.provider_usage_stats[&ProviderId::from("flaky")];
        assert_eq!(usage.failures, 5);
        assert_eq!(usage.circuit_rejections, 2);
        assert_eq!(summary.quality_metrics.rejection_reasons["missing_email"], 7);
    }

    #[tokio::test]
    async fn test_auth_failure_disables_provider() {
        let discovery = Arc::new(
            FakeDiscovery::new("hunter", 0.0).failing(ProviderError::Auth(ProviderId::from("hunter"))),
        );
        let config = RunConfig {
            max_concurrent_leads: 1,
            ..RunConfig::default()
        };
        let candidates: Vec<CandidateRecord> = (0..3)
            .map(|i| candidate(&format!("Shop {}", i), &format!("shop{}.com", i)))
            .collect();

        let summary = orchestrator(discovery.clone(), config).run(candidates).await;

        assert_eq!(discovery.calls(), 1);
        let usage = &summary.provider_usage_stats[&ProviderId::from("hunter")];
        assert_eq!((usage.failures, usage.skipped), (1, 2));
        assert_eq!(summary.error_counts[&ErrorKind::Auth], 3);
        assert_eq!(summary.total_processed, 3);
    }
}

#[cfg(test)]
mod cancellation_scenarios {
    use super::*;

    #[tokio::test]
    async fn test_cancelled_run_marks_leads_aborted() {
        let discovery = Arc::new(FakeDiscovery::new("hunter", 0.04).slow(Duration::from_secs(10)));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let summary = orchestrator(discovery, RunConfig::default())
            .run_with_cancel(
                vec![
                    candidate("Blue Door Bakery", "bluedoor.com"),
                    candidate("Red Oak Cafe", "redoak.com"),
                ],
                cancel,
            )
            .await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(summary.aborted);
        assert_eq!(summary.quality_metrics.rejection_reasons["aborted"], 2);
        assert!(summary.leads.iter().all(|l| l.stage == LeadStage::Rejected));

        // Both requests were already sent when the run was cancelled.
        assert_eq!(summary.total_cost, Cost::from_dollars(0.08));
        let usage = &summary.provider_usage_stats[&ProviderId::from("hunter")];
        assert_eq!((usage.calls, usage.cancelled), (2, 2));
        assert_eq!(summary.error_counts[&ErrorKind::Cancelled], 2);
    }

    #[tokio::test]
    async fn test_run_timeout_aborts() {
        let discovery = Arc::new(FakeDiscovery::new("hunter", 0.0).slow(Duration::from_secs(10)));
        let config = RunConfig {
            run_timeout: Some(Duration::from_millis(50)),
            ..RunConfig::default()
        };

        let summary = orchestrator(discovery, config)
            .run(vec![candidate("Blue Door Bakery", "bluedoor.com")])
            .await;

        assert!(summary.aborted);
        assert_eq!(summary.quality_metrics.rejection_reasons["aborted"], 1);
    }
}

#[cfg(test)]
mod enrichment_flow_scenarios {
    use super::*;

    fn providers(
        places: Option<FakePlaces>,
        discovery: FakeDiscovery,
        verifier: Option<FakeVerifier>,
    ) -> ProviderSet {
        ProviderSet {
            place_detail: places.map(|p| Arc::new(p) as Arc<PlaceDetailProvider>),
            email_discovery: vec![Arc::new(discovery) as Arc<EmailDiscoveryProvider>],
            email_verification: verifier.map(|v| Arc::new(v) as Arc<EmailVerificationProvider>),
            ..ProviderSet::default()
        }
    }

    #[tokio::test]
    async fn test_place_website_feeds_discovery() {
        let log = CallLog::default();
        let places = FakePlaces::new(Some("https://www.bluedoor.com/"), &log);
        let discovery = FakeDiscovery::new("hunter", 0.04)
            .verified("bluedoor.com", "owner", 95.0)
            .logging(&log);
        let orchestrator = DiscoveryOrchestrator::new(
            providers(Some(places), discovery, None),
            RunConfig::default(),
        );

        let summary = orchestrator
            .run(vec![
                CandidateRecord::new("Blue Door Bakery", "12 Main St, Austin, TX").with_phone("+15124742212"),
            ])
            .await;

        assert_eq!(summary.quality_metrics.qualified_count, 1);
        let lead = &summary.leads[0];
        assert_eq!(lead.winner(FieldName::Website).unwrap().source_id, ProviderId::from("places"));
        assert_eq!(lead.winner(FieldName::Email).unwrap().value, "owner@bluedoor.com");
        assert!(position(&log, "places:end") < position(&log, "hunter:start"));
        assert_eq!(summary.total_cost, Cost::from_dollars(0.057));
    }

    #[tokio::test]
    async fn test_place_and_discovery_overlap_when_domain_known() {
        let log = CallLog::default();
        let places = FakePlaces::new(None, &log).slow(Duration::from_millis(50));
        let discovery = FakeDiscovery::new("hunter", 0.04)
            .verified("bluedoor.com", "owner", 95.0)
            .slow(Duration::from_millis(50))
            .logging(&log);
        let orchestrator = DiscoveryOrchestrator::new(
            providers(Some(places), discovery, None),
            RunConfig::default(),
        );

        let summary = orchestrator
            .run(vec![candidate("Blue Door Bakery", "bluedoor.com")])
            .await;

        assert_eq!(summary.quality_metrics.qualified_count, 1);
        assert!(position(&log, "hunter:start") < position(&log, "places:end"));
        assert!(position(&log, "places:start") < position(&log, "hunter:end"));
    }

    #[tokio::test]
    async fn test_verification_follows_discovery() {
        let log = CallLog::default();
        let discovery = FakeDiscovery::new("hunter", 0.04)
            .observed("bluedoor.com", "owner", 80.0)
            .logging(&log);
        let verifier = FakeVerifier::new(&log).verdict("owner@bluedoor.com", Deliverability::Deliverable);
        let orchestrator =
            DiscoveryOrchestrator::new(providers(None, discovery, Some(verifier)), RunConfig::default());

        let summary = orchestrator
            .run(vec![candidate("Blue Door Bakery", "bluedoor.com")])
            .await;

        assert!(position(&log, "hunter:end") < position(&log, "verify:owner@bluedoor.com"));

        let lead = &summary.leads[0];
        assert_eq!(lead.stage, LeadStage::Qualified);
        let email = lead.winner(FieldName::Email).unwrap();
        assert_eq!(email.source_trust_class, SourceTrustClass::Verified);
        assert_eq!(email.source_id, ProviderId::from("neverbounce"));
        // A verifier echo is not independent agreement: 25 + 95 * 0.6.
        assert_eq!(lead.final_confidence_score, Some(82.0));
        assert_eq!(summary.total_cost, Cost::from_dollars(0.048));
    }

    #[tokio::test]
    async fn test_undeliverable_email_is_invalidated() {
        let log = CallLog::default();
        let discovery = FakeDiscovery::new("hunter", 0.04)
            .observed("bluedoor.com", "owner", 90.0)
            .observed("bluedoor.com", "orders", 75.0);
        let verifier = FakeVerifier::new(&log)
            .verdict("owner@bluedoor.com", Deliverability::Undeliverable)
            .verdict("orders@bluedoor.com", Deliverability::Deliverable);
        let orchestrator =
            DiscoveryOrchestrator::new(providers(None, discovery, Some(verifier)), RunConfig::default());

        let summary = orchestrator
            .run(vec![candidate("Blue Door Bakery", "bluedoor.com")])
            .await;

        assert_eq!(
            *log.lock(),
            vec!["verify:owner@bluedoor.com".to_string(), "verify:orders@bluedoor.com".to_string()]
        );
        let lead = &summary.leads[0];
        assert_eq!(lead.stage, LeadStage::Qualified);
        assert_eq!(lead.winner(FieldName::Email).unwrap().value, "orders@bluedoor.com");
        assert!(lead.evidence(FieldName::Email).all(|f| f.value != "owner@bluedoor.com"));
    }

    #[tokio::test]
    async fn test_all_undeliverable_means_missing_email() {
        let log = CallLog::default();
        let discovery = FakeDiscovery::new("hunter", 0.04).observed("bluedoor.com", "owner", 90.0);
        let verifier = FakeVerifier::new(&log).verdict("owner@bluedoor.com", Deliverability::Undeliverable);
        let orchestrator =
            DiscoveryOrchestrator::new(providers(None, discovery, Some(verifier)), RunConfig::default());

        let summary = orchestrator
            .run(vec![candidate("Blue Door Bakery", "bluedoor.com")])
            .await;

        assert_eq!(summary.quality_metrics.rejection_reasons["missing_email"], 1);
        assert!(summary.leads[0].winner(FieldName::Email).is_none());
    }

    #[tokio::test]
    async fn test_failed_place_search_is_an_empty_run() {
        let search = FailingSearch {
            descriptor: descriptor("places_search", Capability::PlaceSearch, 0.032),
        };
        let providers = ProviderSet {
            place_search: Some(Arc::new(search) as Arc<PlaceSearchProvider>),
            ..ProviderSet::default()
        };
        let config = RunConfig {
            retry: RetryPolicy::none(),
            ..RunConfig::default()
        };

        let summary = DiscoveryOrchestrator::new(providers, config)
            .discover(PlaceSearchQuery {
                text: "bakeries in Austin, TX".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(summary.total_processed, 0);
        assert_eq!(summary.total_cost, Cost::ZERO);
        assert_eq!(summary.error_counts[&ErrorKind::Upstream], 1);
        assert_eq!(summary.run_events.len(), 1);
    }
}
