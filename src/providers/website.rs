use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use std::collections::BTreeSet;
use std::sync::OnceLock;
use std::time::Duration;

use super::{
    Capability, DiscoveredEmail, DiscoveredEmails, DomainQuery, Provider, ProviderDescriptor,
};
use crate::config::ProviderSettings;
use crate::enrichment::{is_valid_email, normalize_email};
use crate::errors::ProviderError;
use crate::models::SourceTrustClass;

pub const PROVIDER_ID: &str = "website";

/// Homepage first, then the pages businesses usually list contacts on.
const PAGES: &[&str] = &["", "/contact", "/contact-us", "/about"];

const MAX_EMAILS: usize = 5;
const PAGE_TIMEOUT: Duration = Duration::from_secs(5);
const USER_AGENT: &str = "lead-enrichment-scraper/1.0";

/// Published on the business's own site, but nobody checked the mailbox.
const SCRAPED_CONFIDENCE: f64 = 70.0;

/// Asset names such as `logo@2x.png` look like addresses to the pattern.
const ASSET_SUFFIXES: &[&str] = &[".png", ".jpg", ".jpeg", ".gif", ".svg", ".webp"];

fn address_pattern() -> &'static Regex {
    static ADDRESS: OnceLock<Regex> = OnceLock::new();
    ADDRESS.get_or_init(|| {
        Regex::new(r"(?i)[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}").expect("address regex is valid")
    })
}

/// Addresses found in `html`, normalized, filtered and deduplicated in page order.
pub fn extract_emails(html: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    address_pattern()
        .find_iter(html)
        .map(|m| normalize_email(m.as_str()))
        .filter(|address| !ASSET_SUFFIXES.iter().any(|suffix| address.ends_with(suffix)))
        .filter(|address| is_valid_email(address))
        .filter(|address| seen.insert(address.clone()))
        .take(MAX_EMAILS)
        .collect()
}

/// Free email discovery from the business's own web pages.
///
/// `base_url` may contain a `{domain}` placeholder; the default settings
/// point straight at `https://{domain}`. Unreachable pages are skipped: a
/// dead business site says nothing about the health of the scraper.
pub struct WebsiteEmailScraper {
    client: Client,
    base_url: String,
    descriptor: ProviderDescriptor,
}

impl WebsiteEmailScraper {
    pub fn new(settings: &ProviderSettings) -> Self {
        let client = Client::builder()
            .timeout(PAGE_TIMEOUT.min(settings.timeout))
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            descriptor: ProviderDescriptor::from_settings(PROVIDER_ID, Capability::EmailDiscovery, settings),
        }
    }

    fn site_url(&self, domain: &str) -> String {
        self.base_url.replace("{domain}", domain)
    }

    async fn page(&self, url: &str) -> Option<String> {
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("Skipping {}: {}", url, e);
                return None;
            }
        };
        if !response.status().is_success() {
            tracing::debug!("Skipping {}: status {}", url, response.status());
            return None;
        }
        response.text().await.ok()
    }
}

#[async_trait]
impl Provider for WebsiteEmailScraper {
    type Query = DomainQuery;
    type Response = DiscoveredEmails;

    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn fetch(&self, query: &DomainQuery) -> Result<DiscoveredEmails, ProviderError> {
        let site = self.site_url(&query.domain);
        tracing::info!("Scraping {} for contact emails", site);

        for page in PAGES {
            let url = format!("{}{}", site, page);
            let Some(html) = self.page(&url).await else {
                continue;
            };

            let emails = extract_emails(&html);
            if emails.is_empty() {
                continue;
            }

            tracing::info!("Found {} emails on {}", emails.len(), url);
            return Ok(DiscoveredEmails {
                emails: emails
                    .into_iter()
                    .map(|address| DiscoveredEmail {
                        address,
                        trust: SourceTrustClass::Observed,
                        confidence: SCRAPED_CONFIDENCE,
                    })
                    .collect(),
                organization: None,
            });
        }

        tracing::debug!("No emails published on {}", site);
        Ok(DiscoveredEmails::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_skips_assets_and_duplicates() {
        let html = r#"
            <img src="/img/logo@2x.png">
            <a href="mailto:Owner@BlueDoor.com">Owner@BlueDoor.com</a>
            <p>Write to owner@bluedoor.com or hello@bluedoor.com</p>
            <p>noreply@bluedoor.com</p>
        "#;

        assert_eq!(
            extract_emails(html),
            vec!["owner@bluedoor.com".to_string(), "hello@bluedoor.com".to_string()]
        );
    }

    #[test]
    fn test_extract_keeps_at_most_five() {
        let html: String = (0..8).map(|i| format!("staff{}@bluedoor.com ", i)).collect();
        assert_eq!(extract_emails(&html).len(), MAX_EMAILS);
    }

    #[test]
    fn test_domain_placeholder() {
        let scraper = WebsiteEmailScraper::new(&ProviderSettings::website());
        assert_eq!(scraper.site_url("bluedoor.com"), "https://bluedoor.com");
        assert!(scraper.descriptor().cost_per_call.is_zero());
    }
}
