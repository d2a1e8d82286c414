use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::{
    get_json, http_client, require_credential, Capability, Deliverability, EmailQuery,
    EmailVerification, Provider, ProviderDescriptor,
};
use crate::config::ProviderSettings;
use crate::errors::ProviderError;
use crate::models::ProviderId;

pub const PROVIDER_ID: &str = "neverbounce";

#[derive(Debug, Deserialize)]
struct CheckResponse {
    status: String,
    result: Option<String>,
    #[serde(default)]
    flags: Vec<String>,
    message: Option<String>,
}

/// Confidence in a NeverBounce result, adjusted by the flags it reports.
pub fn calculate_confidence(result: &str, flags: &[String]) -> f64 {
    let base: i32 = match result {
        "valid" => 95,
        "catchall" => 75,
        "unknown" => 50,
        "disposable" => 10,
        "invalid" => 5,
        _ => 0,
    };

    let adjusted = flags.iter().fold(base, |acc, flag| match flag.as_str() {
        "has_dns" => acc + 5,
        "has_dns_mx" => acc + 5,
        "smtp_connectable" => acc + 10,
        // Shared inboxes (info@, contact@) and free webmail are worth less.
        "role_account" => acc - 10,
        "free_email_host" => acc - 5,
        _ => acc,
    });

    f64::from(adjusted.clamp(0, 100))
}

fn verdict(result: &str) -> Deliverability {
    match result {
        "valid" => Deliverability::Deliverable,
        "invalid" | "disposable" => Deliverability::Undeliverable,
        _ => Deliverability::Risky,
    }
}

/// NeverBounce single-address verification.
pub struct NeverBounceClient {
    client: Client,
    base_url: String,
    api_key: String,
    descriptor: ProviderDescriptor,
}

impl NeverBounceClient {
    pub fn new(settings: &ProviderSettings) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client(settings.timeout),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: require_credential(PROVIDER_ID, &settings.api_key)?,
            descriptor: ProviderDescriptor::from_settings(
                PROVIDER_ID,
                Capability::EmailVerification,
                settings,
            ),
        })
    }
}

#[async_trait]
impl Provider for NeverBounceClient {
    type Query = EmailQuery;
    type Response = EmailVerification;

    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn fetch(&self, query: &EmailQuery) -> Result<EmailVerification, ProviderError> {
        let id = ProviderId::from(PROVIDER_ID);
        tracing::debug!("NeverBounce check for {}", query.email);

        let request = self
            .client
            .get(format!("{}/single/check", self.base_url))
            .query(&[("key", self.api_key.as_str()), ("email", query.email.as_str())]);

        let response: CheckResponse = get_json(&id, request).await?;
        let message = response
            .message
            .clone()
            .unwrap_or_else(|| response.status.clone());

        match response.status.as_str() {
            "success" => {}
            "auth_failure" | "bad_referrer" => return Err(ProviderError::Auth(id)),
            "throttle_triggered" => {
                return Err(ProviderError::RateLimited {
                    provider: id,
                    retry_after: None,
                })
            }
            "temp_unavail" => {
                return Err(ProviderError::Upstream {
                    provider: id,
                    status: 503,
                    message,
                })
            }
            _ => return Err(ProviderError::Rejected { provider: id, message }),
        }

        let result = response.result.unwrap_or_else(|| "unknown".to_string());
        let verification = EmailVerification {
            email: query.email.clone(),
            verdict: verdict(&result),
            confidence: calculate_confidence(&result, &response.flags),
        };

        tracing::info!(
            "NeverBounce: {} is {} ({:?}, confidence {})",
            query.email,
            result,
            verification.verdict,
            verification.confidence
        );
        Ok(verification)
    }
}
