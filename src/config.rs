use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

use crate::budget::Cost;
use crate::circuit_breaker::BreakerSettings;
use crate::models::SourceTrustClass;
use crate::providers::RetryPolicy;
use crate::quality::QualityRequirements;
use crate::scoring::ScoringPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProviderKind {
    GooglePlaces,
    Hunter,
    NeverBounce,
    Pattern,
    Website,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 5] = [
        ProviderKind::GooglePlaces,
        ProviderKind::Hunter,
        ProviderKind::NeverBounce,
        ProviderKind::Pattern,
        ProviderKind::Website,
    ];

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "google_places" => Some(ProviderKind::GooglePlaces),
            "hunter" => Some(ProviderKind::Hunter),
            "neverbounce" => Some(ProviderKind::NeverBounce),
            "pattern" => Some(ProviderKind::Pattern),
            "website" => Some(ProviderKind::Website),
            _ => None,
        }
    }
}

const WEBSITE_URL_TEMPLATE: &str = "https://{domain}";

/// Endpoint, credential and call economics of one provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub cost_per_call: Cost,
    pub timeout: Duration,
    pub cache_ttl: Duration,
}

impl ProviderSettings {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key,
            cost_per_call: Cost::ZERO,
            timeout: Duration::from_secs(10),
            cache_ttl: Duration::from_secs(3600),
        }
    }

    pub fn cost(mut self, dollars: f64) -> Self {
        self.cost_per_call = Cost::from_dollars(dollars);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn google_places_details(api_key: Option<String>) -> Self {
        Self::new("https://maps.googleapis.com/maps/api/place", api_key)
            .cost(0.017)
            .timeout(Duration::from_secs(10))
            .cache_ttl(Duration::from_secs(24 * 3600))
    }

    pub fn google_places_search(api_key: Option<String>) -> Self {
        Self::new("https://maps.googleapis.com/maps/api/place", api_key)
            .cost(0.032)
            .timeout(Duration::from_secs(10))
            .cache_ttl(Duration::from_secs(24 * 3600))
    }

    pub fn hunter(api_key: Option<String>) -> Self {
        Self::new("https://api.hunter.io/v2", api_key)
            .cost(0.04)
            .timeout(Duration::from_secs(15))
            .cache_ttl(Duration::from_secs(6 * 3600))
    }

    pub fn neverbounce(api_key: Option<String>) -> Self {
        Self::new("https://api.neverbounce.com/v4", api_key)
            .cost(0.008)
            .timeout(Duration::from_secs(30))
            .cache_ttl(Duration::from_secs(3600))
    }

    /// `{domain}` in the base URL is replaced by the business domain.
    pub fn website() -> Self {
        Self::new(WEBSITE_URL_TEMPLATE, None)
            .timeout(Duration::from_secs(20))
            .cache_ttl(Duration::from_secs(6 * 3600))
    }
}

/// Everything one enrichment run needs besides its providers.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub max_concurrent_leads: usize,
    pub total_budget: Cost,
    pub per_lead_cost_cap: Cost,
    /// Share of the total budget after which no new lead is admitted.
    pub soft_budget_fraction: f64,
    pub requirements: QualityRequirements,
    pub scoring: ScoringPolicy,
    pub breaker: BreakerSettings,
    pub retry: RetryPolicy,
    pub max_email_verifications: usize,
    pub run_timeout: Option<Duration>,
    pub phone_region: String,
    pub cache_capacity: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_concurrent_leads: 5,
            total_budget: Cost::from_dollars(5.0),
            per_lead_cost_cap: Cost::from_dollars(0.50),
            soft_budget_fraction: 0.8,
            requirements: QualityRequirements::default(),
            scoring: ScoringPolicy::default(),
            breaker: BreakerSettings::default(),
            retry: RetryPolicy::default(),
            max_email_verifications: 2,
            run_timeout: None,
            phone_region: "US".to_string(),
            cache_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub enabled_providers: BTreeSet<ProviderKind>,
    pub google_places: ProviderSettings,
    pub google_places_search: ProviderSettings,
    pub hunter: ProviderSettings,
    pub neverbounce: ProviderSettings,
    pub website: ProviderSettings,
    pub run: RunConfig,
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.trim().is_empty())
}

fn parse_var<T: FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match optional_var(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} has invalid value '{}'", name, raw)),
    }
}

fn parse_bool(name: &str, default: bool) -> anyhow::Result<bool> {
    match optional_var(name) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => anyhow::bail!("{} must be a boolean, got '{}'", name, raw),
        },
    }
}

fn url_var(name: &str, default: &str) -> anyhow::Result<String> {
    let url = optional_var(name).unwrap_or_else(|| default.to_string());
    if !url.starts_with("http://") && !url.starts_with("https://") {
        anyhow::bail!("{} must start with http:// or https://", name);
    }
    Ok(url)
}

fn dollars_var(name: &str, default: f64) -> anyhow::Result<Cost> {
    let dollars: f64 = parse_var(name, default)?;
    if !dollars.is_finite() || dollars < 0.0 {
        anyhow::bail!("{} must be a non-negative amount", name);
    }
    Ok(Cost::from_dollars(dollars))
}

fn list_var<T>(name: &str, parse: impl Fn(&str) -> Option<T>) -> anyhow::Result<Option<Vec<T>>> {
    let Some(raw) = optional_var(name) else {
        return Ok(None);
    };
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| parse(item).ok_or_else(|| anyhow::anyhow!("{} has unknown entry '{}'", name, item)))
        .collect::<anyhow::Result<Vec<T>>>()
        .map(Some)
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let enabled_providers: BTreeSet<ProviderKind> = list_var("ENABLED_PROVIDERS", ProviderKind::parse)?
            .map(|kinds| kinds.into_iter().collect())
            .unwrap_or_else(|| ProviderKind::ALL.into_iter().collect());

        let places_key = optional_var("GOOGLE_PLACES_API_KEY");
        let places_url = url_var("GOOGLE_PLACES_BASE_URL", "https://maps.googleapis.com/maps/api/place")?;

        let mut google_places = ProviderSettings::google_places_details(places_key.clone());
        google_places.base_url = places_url.clone();
        let mut google_places_search = ProviderSettings::google_places_search(places_key);
        google_places_search.base_url = places_url;

        let mut hunter = ProviderSettings::hunter(optional_var("HUNTER_API_KEY"));
        hunter.base_url = url_var("HUNTER_BASE_URL", "https://api.hunter.io/v2")?;

        let mut neverbounce = ProviderSettings::neverbounce(optional_var("NEVERBOUNCE_API_KEY"));
        neverbounce.base_url = url_var("NEVERBOUNCE_BASE_URL", "https://api.neverbounce.com/v4")?;

        let mut website = ProviderSettings::website();
        if let Some(template) = optional_var("WEBSITE_BASE_URL") {
            if !template.contains("{domain}") {
                anyhow::bail!("WEBSITE_BASE_URL must contain a {{domain}} placeholder");
            }
            website.base_url = template.trim().to_string();
        }

        let defaults = RunConfig::default();

        let soft_budget_fraction: f64 = parse_var("SOFT_BUDGET_THRESHOLD", defaults.soft_budget_fraction)?;
        if !(soft_budget_fraction > 0.0 && soft_budget_fraction <= 1.0) {
            anyhow::bail!("SOFT_BUDGET_THRESHOLD must be in (0, 1]");
        }

        let max_concurrent_leads: usize = parse_var("MAX_CONCURRENT_LEADS", defaults.max_concurrent_leads)?;
        if max_concurrent_leads == 0 {
            anyhow::bail!("MAX_CONCURRENT_LEADS must be at least 1");
        }

        let minimum_confidence: f64 = parse_var("MIN_CONFIDENCE", defaults.requirements.minimum_confidence)?;
        if !(0.0..=100.0).contains(&minimum_confidence) {
            anyhow::bail!("MIN_CONFIDENCE must be between 0 and 100");
        }

        let rejected_source_trust_classes = list_var("REJECTED_TRUST_CLASSES", SourceTrustClass::parse)?
            .map(|classes| classes.into_iter().collect())
            .unwrap_or_else(|| defaults.requirements.rejected_source_trust_classes.clone());

        let requirements = QualityRequirements {
            require_email: parse_bool("REQUIRE_EMAIL", defaults.requirements.require_email)?,
            require_phone: parse_bool("REQUIRE_PHONE", defaults.requirements.require_phone)?,
            require_website: parse_bool("REQUIRE_WEBSITE", defaults.requirements.require_website)?,
            minimum_confidence,
            rejected_source_trust_classes,
        };

        let breaker = BreakerSettings {
            failure_threshold: parse_var("BREAKER_FAILURE_THRESHOLD", defaults.breaker.failure_threshold)?,
            cooldown: Duration::from_secs(parse_var(
                "BREAKER_COOLDOWN_SECS",
                defaults.breaker.cooldown.as_secs(),
            )?),
        };

        let retry = RetryPolicy {
            max_retries: parse_var("PROVIDER_MAX_RETRIES", defaults.retry.max_retries)?,
            ..defaults.retry
        };

        let run_timeout = optional_var("RUN_TIMEOUT_SECS")
            .map(|raw| {
                raw.trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|_| anyhow::anyhow!("RUN_TIMEOUT_SECS must be a whole number of seconds"))
            })
            .transpose()?;

        let run = RunConfig {
            max_concurrent_leads,
            total_budget: dollars_var("TOTAL_BUDGET", 5.0)?,
            per_lead_cost_cap: dollars_var("PER_LEAD_COST_CAP", 0.50)?,
            soft_budget_fraction,
            requirements,
            breaker,
            retry,
            run_timeout,
            phone_region: optional_var("DEFAULT_PHONE_REGION").unwrap_or(defaults.phone_region.clone()),
            ..defaults
        };

        let config = Self {
            enabled_providers,
            google_places,
            google_places_search,
            hunter,
            neverbounce,
            website,
            run,
        };

        // Never log credentials, only whether they are present.
        tracing::info!("Configuration loaded successfully");
        tracing::debug!(
            "Providers enabled: {:?} (places key: {}, hunter key: {}, neverbounce key: {})",
            config.enabled_providers,
            config.google_places.api_key.is_some(),
            config.hunter.api_key.is_some(),
            config.neverbounce.api_key.is_some()
        );
        tracing::debug!(
            "Budget {} (per lead {}), concurrency {}",
            config.run.total_budget,
            config.run.per_lead_cost_cap,
            config.run.max_concurrent_leads
        );

        Ok(config)
    }

    pub fn is_enabled(&self, kind: ProviderKind) -> bool {
        self.enabled_providers.contains(&kind)
    }
}
