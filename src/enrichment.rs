/// Candidate validation and normalization shared by the orchestrator and the
/// provider adapters.
///
/// - email syntax and placeholder detection
/// - phone normalization to E.164
/// - website domain extraction (skipping social and directory hosts)
/// - deterministic record identity
use phonenumber::country::Id as CountryId;
use phonenumber::Mode;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

use crate::errors::AppError;
use crate::models::CandidateRecord;

/// Hosts that never belong to the business itself, so email discovery on
/// them would only return the platform's own addresses.
const SKIPPED_HOSTS: &[&str] = &[
    "facebook.com",
    "instagram.com",
    "linkedin.com",
    "twitter.com",
    "x.com",
    "youtube.com",
    "tiktok.com",
    "yelp.com",
    "google.com",
    "goo.gl",
    "business.site",
    "wixsite.com",
    "squarespace.com",
    "godaddysites.com",
];

fn email_regex() -> &'static Regex {
    static EMAIL_REGEX: OnceLock<Regex> = OnceLock::new();
    EMAIL_REGEX.get_or_init(|| {
        // RFC 5322 simplified: local@domain.tld
        Regex::new(
            r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)+$",
        )
        .expect("email regex is valid")
    })
}

/// Validate email address
///
/// Checks for:
/// - Basic email format (contains @ and .)
/// - Fake/placeholder patterns (repeated digits, example domains)
/// - Valid domain structure
pub fn is_valid_email(email: &str) -> bool {
    if email.len() < 5 || !email.contains('@') || !email.contains('.') {
        return false;
    }

    let fake_patterns = [
        "999999",
        "111111",
        "000000",
        "123456789",
        "@example.",
        "@domain.",
        "@email.",
        "noreply@",
        "no-reply@",
    ];

    let lowered = email.to_ascii_lowercase();
    if let Some(pattern) = fake_patterns.iter().find(|p| lowered.contains(*p)) {
        tracing::debug!("Discarding placeholder email (pattern '{}'): {}", pattern, email);
        return false;
    }

    if !email_regex().is_match(email) {
        tracing::debug!("Discarding malformed email: {}", email);
        return false;
    }

    true
}

/// Trimmed, lower-cased email.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

fn region_id(region: &str) -> Option<CountryId> {
    let id = match region.trim().to_ascii_uppercase().as_str() {
        "US" => CountryId::US,
        "CA" => CountryId::CA,
        "GB" | "UK" => CountryId::GB,
        "IE" => CountryId::IE,
        "AU" => CountryId::AU,
        "NZ" => CountryId::NZ,
        "BR" => CountryId::BR,
        "MX" => CountryId::MX,
        "DE" => CountryId::DE,
        "FR" => CountryId::FR,
        "ES" => CountryId::ES,
        "IT" => CountryId::IT,
        "PT" => CountryId::PT,
        "NL" => CountryId::NL,
        _ => return None,
    };
    Some(id)
}

/// Validate and normalize a phone number for `region` (ISO 3166 alpha-2).
///
/// Returns: (is_valid, normalized_phone_or_error_msg)
pub fn validate_phone(raw: &str, region: &str) -> (bool, String) {
    if raw.trim().is_empty() || raw.len() < 7 {
        return (false, "Phone too short".to_string());
    }

    let Some(country) = region_id(region) else {
        return (false, format!("Unsupported phone region '{}'", region));
    };

    match phonenumber::parse(Some(country), raw) {
        Ok(number) => {
            if phonenumber::is_valid(&number) {
                let formatted = number.format().mode(Mode::E164).to_string();
                tracing::debug!("Normalized phone {} -> {}", raw, formatted);
                (true, formatted)
            } else {
                (false, format!("Invalid {} phone number", region))
            }
        }
        Err(e) => (false, format!("Parse error: {:?}", e)),
    }
}

/// Registrable host of a website, lower-cased and without `www.`.
///
/// Returns None for unparseable URLs and for social/directory hosts.
pub fn extract_domain(website: &str) -> Option<String> {
    let trimmed = website.trim();
    if trimmed.is_empty() {
        return None;
    }

    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };

    let parsed = url::Url::parse(&with_scheme).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();

    if !host.contains('.') {
        return None;
    }

    let skipped = SKIPPED_HOSTS
        .iter()
        .any(|s| host == *s || host.ends_with(&format!(".{}", s)));
    if skipped {
        tracing::debug!("Skipping non-business host {}", host);
        return None;
    }

    Some(host)
}

fn normalize_part(value: &str) -> String {
    value
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Deterministic identity of a business: hex SHA-256 of normalized name and
/// address, truncated to 24 characters.
pub fn identity_key(name: &str, address: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_part(name).as_bytes());
    hasher.update(b"|");
    hasher.update(normalize_part(address).as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..24].to_string()
}

/// Reject records that cannot be enriched and normalize the rest.
///
/// An unparseable phone is dropped rather than rejecting the record, since
/// the rest of the entry is still usable.
pub fn prepare_candidate(
    candidate: &CandidateRecord,
    phone_region: &str,
) -> Result<CandidateRecord, AppError> {
    if candidate.name.trim().is_empty() {
        return Err(AppError::Validation("candidate name is empty".to_string()));
    }
    if candidate.address.trim().is_empty() {
        return Err(AppError::Validation(format!(
            "candidate '{}' has no address",
            candidate.name.trim()
        )));
    }
    if let Some(rating) = candidate.rating {
        if !(0.0..=5.0).contains(&rating) {
            return Err(AppError::Validation(format!(
                "candidate '{}' has rating {} outside 0-5",
                candidate.name.trim(),
                rating
            )));
        }
    }

    let mut prepared = candidate.clone();
    prepared.name = candidate.name.trim().to_string();
    prepared.address = candidate.address.trim().to_string();

    prepared.phone = candidate
        .phone
        .as_deref()
        .filter(|p| !p.trim().is_empty())
        .and_then(|raw| match validate_phone(raw, phone_region) {
            (true, normalized) => Some(normalized),
            (false, reason) => {
                tracing::warn!("Dropping phone for '{}': {}", prepared.name, reason);
                None
            }
        });

    if let Some(website) = candidate.website.as_deref().filter(|w| !w.trim().is_empty()) {
        let with_scheme = if website.contains("://") {
            website.trim().to_string()
        } else {
            format!("https://{}", website.trim())
        };
        if url::Url::parse(&with_scheme).is_err() {
            return Err(AppError::Validation(format!(
                "candidate '{}' has malformed website '{}'",
                prepared.name, website
            )));
        }
        prepared.website = Some(with_scheme);
    } else {
        prepared.website = None;
    }

    Ok(prepared)
}
