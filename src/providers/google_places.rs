use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::{
    get_json, http_client, require_credential, Capability, PlaceDetails, PlaceQuery,
    PlaceSearchQuery, Provider, ProviderDescriptor,
};
use crate::config::ProviderSettings;
use crate::errors::ProviderError;
use crate::models::{CandidateRecord, ProviderId};

pub const PROVIDER_ID: &str = "google_places";

const DETAIL_FIELDS: &str =
    "place_id,formatted_address,formatted_phone_number,international_phone_number,website,rating,user_ratings_total";

#[derive(Debug, Deserialize)]
struct SearchEnvelope {
    status: String,
    #[serde(default)]
    results: Vec<PlaceResult>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FindEnvelope {
    status: String,
    #[serde(default)]
    candidates: Vec<PlaceResult>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DetailsEnvelope {
    status: String,
    #[serde(default)]
    result: Option<PlaceResult>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PlaceResult {
    place_id: Option<String>,
    name: Option<String>,
    formatted_address: Option<String>,
    formatted_phone_number: Option<String>,
    international_phone_number: Option<String>,
    website: Option<String>,
    rating: Option<f64>,
    user_ratings_total: Option<u32>,
}

/// Maps the Places API `status` field. `ZERO_RESULTS` is a valid empty answer.
fn check_status(
    provider: &ProviderId,
    status: &str,
    error_message: Option<String>,
) -> Result<(), ProviderError> {
    let message = error_message.unwrap_or_else(|| status.to_string());
    match status {
        "OK" | "ZERO_RESULTS" => Ok(()),
        "REQUEST_DENIED" => Err(ProviderError::Auth(provider.clone())),
        "OVER_QUERY_LIMIT" => Err(ProviderError::RateLimited {
            provider: provider.clone(),
            retry_after: None,
        }),
        "UNKNOWN_ERROR" => Err(ProviderError::Upstream {
            provider: provider.clone(),
            status: 503,
            message,
        }),
        _ => Err(ProviderError::Rejected {
            provider: provider.clone(),
            message,
        }),
    }
}

/// Shared Places API client used by the search and detail adapters.
#[derive(Clone)]
pub struct GooglePlacesApi {
    client: Client,
    base_url: String,
    api_key: String,
    id: ProviderId,
}

impl GooglePlacesApi {
    pub fn new(settings: &ProviderSettings) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client(settings.timeout),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: require_credential(PROVIDER_ID, &settings.api_key)?,
            id: ProviderId::from(PROVIDER_ID),
        })
    }

    async fn text_search(&self, text: &str) -> Result<Vec<PlaceResult>, ProviderError> {
        tracing::info!("Places text search: {}", text);
        let request = self
            .client
            .get(format!("{}/textsearch/json", self.base_url))
            .query(&[("query", text), ("key", self.api_key.as_str())]);

        let envelope: SearchEnvelope = get_json(&self.id, request).await?;
        check_status(&self.id, &envelope.status, envelope.error_message)?;
        Ok(envelope.results)
    }

    async fn find_place_id(&self, name: &str, address: &str) -> Result<Option<String>, ProviderError> {
        let input = format!("{} {}", name, address);
        tracing::debug!("Places find: {}", input);
        let request = self
            .client
            .get(format!("{}/findplacefromtext/json", self.base_url))
            .query(&[
                ("input", input.as_str()),
                ("inputtype", "textquery"),
                ("fields", "place_id"),
                ("key", self.api_key.as_str()),
            ]);

        let envelope: FindEnvelope = get_json(&self.id, request).await?;
        check_status(&self.id, &envelope.status, envelope.error_message)?;
        Ok(envelope.candidates.into_iter().find_map(|c| c.place_id))
    }

    async fn details(&self, place_id: &str) -> Result<Option<PlaceResult>, ProviderError> {
        tracing::debug!("Places details for {}", place_id);
        let request = self
            .client
            .get(format!("{}/details/json", self.base_url))
            .query(&[
                ("place_id", place_id),
                ("fields", DETAIL_FIELDS),
                ("key", self.api_key.as_str()),
            ]);

        let envelope: DetailsEnvelope = get_json(&self.id, request).await?;
        check_status(&self.id, &envelope.status, envelope.error_message)?;
        Ok(envelope.result)
    }
}

/// Turns a free-text query into candidate records.
pub struct GooglePlacesSearch {
    api: GooglePlacesApi,
    descriptor: ProviderDescriptor,
}

impl GooglePlacesSearch {
    pub fn new(api: GooglePlacesApi, settings: &ProviderSettings) -> Self {
        Self {
            api,
            descriptor: ProviderDescriptor::from_settings(PROVIDER_ID, Capability::PlaceSearch, settings),
        }
    }
}

#[async_trait]
impl Provider for GooglePlacesSearch {
    type Query = PlaceSearchQuery;
    type Response = Vec<CandidateRecord>;

    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn fetch(&self, query: &PlaceSearchQuery) -> Result<Vec<CandidateRecord>, ProviderError> {
        let results = self.api.text_search(&query.text).await?;

        let candidates: Vec<CandidateRecord> = results
            .into_iter()
            .filter_map(|r| {
                Some(CandidateRecord {
                    name: r.name?,
                    address: r.formatted_address?,
                    phone: r.international_phone_number.or(r.formatted_phone_number),
                    website: r.website,
                    rating: r.rating,
                    review_count: r.user_ratings_total,
                    place_id: r.place_id,
                })
            })
            .collect();

        tracing::info!("Places search returned {} candidates", candidates.len());
        Ok(candidates)
    }
}

/// Phone, website and reputation for one business.
pub struct GooglePlacesDetails {
    api: GooglePlacesApi,
    descriptor: ProviderDescriptor,
}

impl GooglePlacesDetails {
    pub fn new(api: GooglePlacesApi, settings: &ProviderSettings) -> Self {
        Self {
            api,
            descriptor: ProviderDescriptor::from_settings(PROVIDER_ID, Capability::PlaceDetail, settings),
        }
    }
}

#[async_trait]
impl Provider for GooglePlacesDetails {
    type Query = PlaceQuery;
    type Response = PlaceDetails;

    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn fetch(&self, query: &PlaceQuery) -> Result<PlaceDetails, ProviderError> {
        // A known place id is an exact match; a text lookup is slightly less certain.
        let (place_id, confidence) = match &query.place_id {
            Some(id) => (id.clone(), 95.0),
            None => match self.api.find_place_id(&query.name, &query.address).await? {
                Some(id) => (id, 85.0),
                None => return Ok(PlaceDetails::default()),
            },
        };

        let Some(result) = self.api.details(&place_id).await? else {
            return Ok(PlaceDetails::default());
        };

        Ok(PlaceDetails {
            place_id: Some(place_id),
            phone: result
                .international_phone_number
                .or(result.formatted_phone_number),
            website: result.website,
            formatted_address: result.formatted_address,
            rating: result.rating,
            review_count: result.user_ratings_total,
            confidence,
        })
    }
}
