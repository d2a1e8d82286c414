use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::{
    get_json, http_client, require_credential, Capability, DiscoveredEmail, DiscoveredEmails,
    DomainQuery, Provider, ProviderDescriptor,
};
use crate::config::ProviderSettings;
use crate::enrichment::{is_valid_email, normalize_email};
use crate::errors::ProviderError;
use crate::models::{ProviderId, SourceTrustClass};

pub const PROVIDER_ID: &str = "hunter";

const MAX_EMAILS: usize = 5;

#[derive(Debug, Deserialize)]
struct DomainSearchResponse {
    data: Option<DomainSearchData>,
}

#[derive(Debug, Deserialize)]
struct DomainSearchData {
    organization: Option<String>,
    #[serde(default)]
    emails: Vec<HunterEmail>,
}

#[derive(Debug, Deserialize)]
struct HunterEmail {
    value: String,
    #[serde(rename = "type")]
    kind: Option<String>,
    confidence: Option<f64>,
    verification: Option<HunterVerification>,
}

#[derive(Debug, Deserialize)]
struct HunterVerification {
    status: Option<String>,
}

/// Hunter.io domain search.
pub struct HunterClient {
    client: Client,
    base_url: String,
    api_key: String,
    descriptor: ProviderDescriptor,
}

impl HunterClient {
    pub fn new(settings: &ProviderSettings) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client(settings.timeout),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: require_credential(PROVIDER_ID, &settings.api_key)?,
            descriptor: ProviderDescriptor::from_settings(PROVIDER_ID, Capability::EmailDiscovery, settings),
        })
    }

    fn to_discovered(email: HunterEmail) -> Option<DiscoveredEmail> {
        let address = normalize_email(&email.value);
        if !is_valid_email(&address) {
            return None;
        }

        let confidence = email.confidence.unwrap_or(50.0).clamp(0.0, 100.0);
        let personal = email.kind.as_deref() == Some("personal");
        if !personal && confidence <= 50.0 {
            return None;
        }

        let verified = email
            .verification
            .and_then(|v| v.status)
            .is_some_and(|s| s == "valid");

        Some(DiscoveredEmail {
            address,
            trust: if verified {
                SourceTrustClass::Verified
            } else {
                SourceTrustClass::Observed
            },
            confidence,
        })
    }
}

#[async_trait]
impl Provider for HunterClient {
    type Query = DomainQuery;
    type Response = DiscoveredEmails;

    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn fetch(&self, query: &DomainQuery) -> Result<DiscoveredEmails, ProviderError> {
        tracing::info!("Hunter domain search: {}", query.domain);
        tracing::debug!(
            "Hunter URL: {}/domain-search?domain={}&api_key=[REDACTED]",
            self.base_url,
            query.domain
        );

        let request = self
            .client
            .get(format!("{}/domain-search", self.base_url))
            .query(&[
                ("domain", query.domain.as_str()),
                ("api_key", self.api_key.as_str()),
                ("limit", "10"),
            ]);

        let response: DomainSearchResponse =
            get_json(&ProviderId::from(PROVIDER_ID), request).await?;

        let Some(data) = response.data else {
            return Ok(DiscoveredEmails::default());
        };

        let mut emails: Vec<DiscoveredEmail> =
            data.emails.into_iter().filter_map(Self::to_discovered).collect();
        emails.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| a.address.cmp(&b.address))
        });
        emails.dedup_by(|a, b| a.address == b.address);
        emails.truncate(MAX_EMAILS);

        tracing::info!("Hunter found {} usable emails for {}", emails.len(), query.domain);
        Ok(DiscoveredEmails {
            emails,
            organization: data.organization,
        })
    }
}
