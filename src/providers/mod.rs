//! Provider adapters.
//!
//! One capability-typed interface per provider category. The orchestrator
//! only depends on the `dyn` aliases below, never on concrete clients; every
//! call goes through [`gateway::ProviderGateway`].

pub mod gateway;
pub mod google_places;
pub mod hunter;
pub mod neverbounce;
pub mod pattern;
pub mod website;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::budget::Cost;
use crate::config::{Config, ProviderKind, ProviderSettings};
use crate::errors::{AppError, ProviderError, ResultExt};
use crate::models::{CandidateRecord, ProviderId, SourceTrustClass};

pub use gateway::{Called, GatewayOutcome, ProviderGateway, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    PlaceSearch,
    PlaceDetail,
    EmailDiscovery,
    EmailVerification,
}

/// Static facts about an adapter that the gateway needs before calling it.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderDescriptor {
    pub id: ProviderId,
    pub capability: Capability,
    /// Estimated cost of one call; zero for free providers.
    pub cost_per_call: Cost,
    pub timeout: Duration,
    /// How long a successful response may be served from cache.
    pub cache_ttl: Duration,
}

impl ProviderDescriptor {
    pub fn from_settings(id: &str, capability: Capability, settings: &ProviderSettings) -> Self {
        Self {
            id: ProviderId::from(id),
            capability,
            cost_per_call: settings.cost_per_call,
            timeout: settings.timeout,
            cache_ttl: settings.cache_ttl,
        }
    }
}

/// A normalized query that can key the response cache.
pub trait ProviderQuery {
    fn cache_key(&self) -> String;
}

/// Uniform adapter contract. Adapters are stateless with respect to leads.
#[async_trait]
pub trait Provider: Send + Sync {
    type Query: ProviderQuery + Send + Sync;
    type Response: Serialize + DeserializeOwned + Send + Sync;

    fn descriptor(&self) -> &ProviderDescriptor;

    async fn fetch(&self, query: &Self::Query) -> Result<Self::Response, ProviderError>;
}

// ============ Queries and responses ============

/// Free-text business search, e.g. "bakeries in Austin, TX".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceSearchQuery {
    pub text: String,
}

impl ProviderQuery for PlaceSearchQuery {
    fn cache_key(&self) -> String {
        format!("search:{}", self.text)
    }
}

/// Lookup of one known business.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceQuery {
    pub place_id: Option<String>,
    pub name: String,
    pub address: String,
}

impl PlaceQuery {
    pub fn for_candidate(candidate: &CandidateRecord) -> Self {
        Self {
            place_id: candidate.place_id.clone(),
            name: candidate.name.clone(),
            address: candidate.address.clone(),
        }
    }
}

impl ProviderQuery for PlaceQuery {
    fn cache_key(&self) -> String {
        match &self.place_id {
            Some(id) => format!("detail:id:{}", id),
            None => format!("detail:{}|{}", self.name, self.address),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaceDetails {
    pub place_id: Option<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub formatted_address: Option<String>,
    pub rating: Option<f64>,
    pub review_count: Option<u32>,
    /// Confidence in the match between query and returned place.
    pub confidence: f64,
}

/// Email discovery is keyed by lower-cased domain only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainQuery {
    pub domain: String,
    pub company: Option<String>,
}

impl ProviderQuery for DomainQuery {
    fn cache_key(&self) -> String {
        self.domain.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredEmail {
    pub address: String,
    pub trust: SourceTrustClass,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredEmails {
    pub emails: Vec<DiscoveredEmail>,
    pub organization: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailQuery {
    pub email: String,
}

impl ProviderQuery for EmailQuery {
    fn cache_key(&self) -> String {
        self.email.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Deliverability {
    Deliverable,
    Undeliverable,
    /// Catch-all domains and unknown results: neither confirmed nor refuted.
    Risky,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailVerification {
    pub email: String,
    pub verdict: Deliverability,
    pub confidence: f64,
}

// ============ Capability interfaces ============

pub type PlaceSearchProvider = dyn Provider<Query = PlaceSearchQuery, Response = Vec<CandidateRecord>>;
pub type PlaceDetailProvider = dyn Provider<Query = PlaceQuery, Response = PlaceDetails>;
pub type EmailDiscoveryProvider = dyn Provider<Query = DomainQuery, Response = DiscoveredEmails>;
pub type EmailVerificationProvider = dyn Provider<Query = EmailQuery, Response = EmailVerification>;

/// The adapters available to one orchestrator.
#[derive(Clone, Default)]
pub struct ProviderSet {
    pub place_search: Option<Arc<PlaceSearchProvider>>,
    pub place_detail: Option<Arc<PlaceDetailProvider>>,
    pub email_discovery: Vec<Arc<EmailDiscoveryProvider>>,
    pub email_verification: Option<Arc<EmailVerificationProvider>>,
}

impl ProviderSet {
    /// Build the enabled adapters. A missing credential for an enabled
    /// provider is a fatal configuration error.
    pub fn from_config(config: &Config) -> Result<Self, AppError> {
        let mut set = ProviderSet::default();

        if config.is_enabled(ProviderKind::GooglePlaces) {
            let api = google_places::GooglePlacesApi::new(&config.google_places)
                .context("configuring google_places")?;
            set.place_search = Some(Arc::new(google_places::GooglePlacesSearch::new(
                api.clone(),
                &config.google_places_search,
            )));
            set.place_detail = Some(Arc::new(google_places::GooglePlacesDetails::new(
                api,
                &config.google_places,
            )));
        }

        if config.is_enabled(ProviderKind::Hunter) {
            let hunter = hunter::HunterClient::new(&config.hunter).context("configuring hunter")?;
            set.email_discovery.push(Arc::new(hunter));
        }

        if config.is_enabled(ProviderKind::Website) {
            set.email_discovery
                .push(Arc::new(website::WebsiteEmailScraper::new(&config.website)));
        }

        if config.is_enabled(ProviderKind::Pattern) {
            set.email_discovery
                .push(Arc::new(pattern::PatternEmailGenerator::new()));
        }

        if config.is_enabled(ProviderKind::NeverBounce) {
            let verifier = neverbounce::NeverBounceClient::new(&config.neverbounce)
                .context("configuring neverbounce")?;
            set.email_verification = Some(Arc::new(verifier));
        }

        tracing::info!(
            place_search = set.place_search.is_some(),
            place_detail = set.place_detail.is_some(),
            email_discovery = set.email_discovery.len(),
            email_verification = set.email_verification.is_some(),
            "Providers configured"
        );

        Ok(set)
    }

    pub fn descriptors(&self) -> Vec<ProviderDescriptor> {
        let mut out = Vec::new();
        if let Some(p) = &self.place_search {
            out.push(p.descriptor().clone());
        }
        if let Some(p) = &self.place_detail {
            out.push(p.descriptor().clone());
        }
        out.extend(self.email_discovery.iter().map(|p| p.descriptor().clone()));
        if let Some(p) = &self.email_verification {
            out.push(p.descriptor().clone());
        }
        out
    }
}

// ============ Shared HTTP plumbing ============

pub(crate) fn require_credential(id: &str, key: &Option<String>) -> Result<String, ProviderError> {
    key.as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ProviderError::MissingCredential(ProviderId::from(id)))
}

pub(crate) fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

pub(crate) fn transport_error(provider: &ProviderId, err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(provider.clone())
    } else {
        ProviderError::Network {
            provider: provider.clone(),
            message: err.to_string(),
        }
    }
}

/// Map a non-success HTTP status onto the error taxonomy.
pub(crate) fn status_error(
    provider: &ProviderId,
    status: reqwest::StatusCode,
    retry_after: Option<Duration>,
    body: String,
) -> ProviderError {
    match status.as_u16() {
        401 | 403 => ProviderError::Auth(provider.clone()),
        429 => ProviderError::RateLimited {
            provider: provider.clone(),
            retry_after,
        },
        code => {
            let message: String = body.chars().take(200).collect();
            if code >= 500 {
                ProviderError::Upstream {
                    provider: provider.clone(),
                    status: code,
                    message,
                }
            } else {
                ProviderError::Rejected {
                    provider: provider.clone(),
                    message: format!("status {}: {}", code, message),
                }
            }
        }
    }
}

/// Send a GET and decode the JSON body, classifying failures.
pub(crate) async fn get_json<T: DeserializeOwned>(
    provider: &ProviderId,
    request: reqwest::RequestBuilder,
) -> Result<T, ProviderError> {
    let response = request
        .send()
        .await
        .map_err(|e| transport_error(provider, e))?;

    let status = response.status();
    if !status.is_success() {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        tracing::warn!(provider = %provider, "Provider returned error {}", status);
        return Err(status_error(provider, status, retry_after, body));
    }

    response.json::<T>().await.map_err(|e| ProviderError::Decode {
        provider: provider.clone(),
        message: e.to_string(),
    })
}
