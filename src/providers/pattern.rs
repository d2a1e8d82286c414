use async_trait::async_trait;
use std::time::Duration;

use super::{
    Capability, DiscoveredEmail, DiscoveredEmails, DomainQuery, Provider, ProviderDescriptor,
};
use crate::budget::Cost;
use crate::enrichment::is_valid_email;
use crate::errors::ProviderError;
use crate::models::{ProviderId, SourceTrustClass};

pub const PROVIDER_ID: &str = "pattern";

const COMMON_MAILBOXES: &[&str] = &["info", "contact", "hello", "office"];

/// Default confidence for a guessed address.
const PATTERN_CONFIDENCE: f64 = 60.0;

/// Offline email guessing from common mailbox names. Free, and every result
/// is `Inferred`.
pub struct PatternEmailGenerator {
    descriptor: ProviderDescriptor,
}

impl PatternEmailGenerator {
    pub fn new() -> Self {
        Self {
            descriptor: ProviderDescriptor {
                id: ProviderId::from(PROVIDER_ID),
                capability: Capability::EmailDiscovery,
                cost_per_call: Cost::ZERO,
                timeout: Duration::from_secs(1),
                cache_ttl: Duration::ZERO,
            },
        }
    }
}

impl Default for PatternEmailGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for PatternEmailGenerator {
    type Query = DomainQuery;
    type Response = DiscoveredEmails;

    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn fetch(&self, query: &DomainQuery) -> Result<DiscoveredEmails, ProviderError> {
        let emails = COMMON_MAILBOXES
            .iter()
            .map(|mailbox| format!("{}@{}", mailbox, query.domain))
            .filter(|address| is_valid_email(address))
            .map(|address| DiscoveredEmail {
                address,
                trust: SourceTrustClass::Inferred,
                confidence: PATTERN_CONFIDENCE,
            })
            .collect();

        Ok(DiscoveredEmails {
            emails,
            organization: query.company.clone(),
        })
    }
}
