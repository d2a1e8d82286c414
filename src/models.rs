use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::budget::Cost;
use crate::errors::{AppError, ErrorKind};

// ============ Provenance ============

/// Stable identifier of a data provider ("google_places", "hunter", ...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(String);

impl ProviderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ProviderId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a value was obtained, decided once by the adapter that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTrustClass {
    /// Matched and independently confirmed (e.g. SMTP-verified email).
    Verified,
    /// Seen in a primary source (listing, the business's own website).
    Observed,
    /// Generated or guessed, never confirmed.
    Inferred,
}

impl SourceTrustClass {
    /// Higher is more trusted.
    pub fn rank(self) -> u8 {
        match self {
            SourceTrustClass::Verified => 3,
            SourceTrustClass::Observed => 2,
            SourceTrustClass::Inferred => 1,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "verified" => Some(SourceTrustClass::Verified),
            "observed" => Some(SourceTrustClass::Observed),
            "inferred" => Some(SourceTrustClass::Inferred),
            _ => None,
        }
    }
}

/// Attributes a lead can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldName {
    Email,
    Phone,
    Website,
    Address,
}

impl fmt::Display for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldName::Email => "email",
            FieldName::Phone => "phone",
            FieldName::Website => "website",
            FieldName::Address => "address",
        };
        f.write_str(name)
    }
}

/// One attribute value plus its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentField {
    pub value: String,
    pub source_id: ProviderId,
    pub source_trust_class: SourceTrustClass,
    /// Provider-reported or defaulted confidence, 0-100.
    pub confidence: f64,
    /// Cost of the provider call that produced this value.
    pub cost_incurred: Cost,
    /// Set when a verifier checked a value it was handed rather than
    /// finding it independently.
    #[serde(default)]
    pub confirmation: bool,
}

impl EnrichmentField {
    pub fn new(
        value: impl Into<String>,
        source_id: ProviderId,
        source_trust_class: SourceTrustClass,
        confidence: f64,
        cost_incurred: Cost,
    ) -> Self {
        Self {
            value: value.into(),
            source_id,
            source_trust_class,
            confidence: confidence.clamp(0.0, 100.0),
            cost_incurred,
            confirmation: false,
        }
    }

    pub fn confirming(mut self) -> Self {
        self.confirmation = true;
        self
    }

    /// Ordering used to pick the winning value among competing evidence:
    /// trust class first, then confidence, then value and source so the
    /// choice never depends on arrival order.
    pub fn precedence(&self, other: &Self) -> Ordering {
        self.source_trust_class
            .rank()
            .cmp(&other.source_trust_class.rank())
            .then_with(|| self.confidence.total_cmp(&other.confidence))
            .then_with(|| other.value.cmp(&self.value))
            .then_with(|| other.source_id.cmp(&self.source_id))
    }
}

// ============ Candidate ============

/// Raw business entry as delivered by the directory source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub review_count: Option<u32>,
    /// Directory-side identifier (Google place id), when the source has one.
    #[serde(default)]
    pub place_id: Option<String>,
}

impl CandidateRecord {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            phone: None,
            website: None,
            rating: None,
            review_count: None,
            place_id: None,
        }
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    pub fn with_website(mut self, website: impl Into<String>) -> Self {
        self.website = Some(website.into());
        self
    }

    /// Deterministic identity derived from name and address.
    pub fn key(&self) -> String {
        crate::enrichment::identity_key(&self.name, &self.address)
    }

    /// Value the directory itself supplied for a field.
    pub fn value_of(&self, field: FieldName) -> Option<&str> {
        let value = match field {
            FieldName::Email => None,
            FieldName::Phone => self.phone.as_deref(),
            FieldName::Website => self.website.as_deref(),
            FieldName::Address => Some(self.address.as_str()),
        };
        value.map(str::trim).filter(|v| !v.is_empty())
    }
}

// ============ Lead lifecycle ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStage {
    Discovered,
    Enriched,
    Scored,
    Qualified,
    Rejected,
}

impl LeadStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, LeadStage::Qualified | LeadStage::Rejected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QualityGrade {
    A,
    B,
    C,
    D,
    F,
}

/// Why a lead ended up rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectionReason {
    InvalidRecord { message: String },
    MissingField { field: FieldName },
    TrustVeto { field: FieldName },
    BelowMinimumConfidence { score: f64, minimum: f64 },
    Aborted,
    Internal { message: String },
}

impl RejectionReason {
    /// Stable code used to bucket rejections in run statistics.
    pub fn code(&self) -> String {
        match self {
            RejectionReason::InvalidRecord { .. } => "invalid_record".to_string(),
            RejectionReason::MissingField { field } => format!("missing_{}", field),
            RejectionReason::TrustVeto { field } => format!("untrusted_{}", field),
            RejectionReason::BelowMinimumConfidence { .. } => "below_minimum_confidence".to_string(),
            RejectionReason::Aborted => "aborted".to_string(),
            RejectionReason::Internal { .. } => "internal".to_string(),
        }
    }
}

/// What happened on one provider interaction, recorded on the lead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CallOutcome {
    Success { cost: Cost },
    CacheHit,
    /// A network call was made and failed.
    Failed { kind: ErrorKind },
    /// No network call was made (circuit open, budget, disabled, cancelled).
    Skipped { kind: ErrorKind },
    /// The request was sent, then abandoned by run cancellation. Paid calls
    /// are charged because the provider may already bill for them.
    Cancelled { cost: Cost },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEvent {
    pub provider: ProviderId,
    #[serde(flatten)]
    pub outcome: CallOutcome,
}

impl ProviderEvent {
    pub fn new(provider: ProviderId, outcome: CallOutcome) -> Self {
        Self { provider, outcome }
    }

    pub fn cost(&self) -> Cost {
        match self.outcome {
            CallOutcome::Success { cost } | CallOutcome::Cancelled { cost } => cost,
            _ => Cost::ZERO,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self.outcome {
            CallOutcome::Failed { kind } | CallOutcome::Skipped { kind } => Some(kind),
            CallOutcome::Cancelled { .. } => Some(ErrorKind::Cancelled),
            _ => None,
        }
    }
}

/// A candidate moving through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedLead {
    pub key: String,
    pub candidate: CandidateRecord,
    pub fields: BTreeMap<FieldName, Vec<EnrichmentField>>,
    /// Values a verifier proved wrong; ignored by scoring and filtering.
    pub invalidated: BTreeSet<(FieldName, String)>,
    pub final_confidence_score: Option<f64>,
    pub quality_grade: Option<QualityGrade>,
    pub stage: LeadStage,
    pub rejection: Option<RejectionReason>,
    pub events: Vec<ProviderEvent>,
}

impl EnrichedLead {
    pub fn new(candidate: CandidateRecord) -> Self {
        Self {
            key: candidate.key(),
            candidate,
            fields: BTreeMap::new(),
            invalidated: BTreeSet::new(),
            final_confidence_score: None,
            quality_grade: None,
            stage: LeadStage::Discovered,
            rejection: None,
            events: Vec::new(),
        }
    }

    /// A lead that never entered enrichment.
    pub fn rejected(candidate: CandidateRecord, reason: RejectionReason) -> Self {
        let mut lead = Self::new(candidate);
        lead.stage = LeadStage::Rejected;
        lead.rejection = Some(reason);
        lead
    }

    fn ensure_open(&self, action: &str) -> Result<(), AppError> {
        if self.stage.is_terminal() {
            return Err(AppError::InvalidTransition(format!(
                "cannot {} lead {} in terminal stage {:?}",
                action, self.key, self.stage
            )));
        }
        Ok(())
    }

    pub fn append_field(&mut self, name: FieldName, field: EnrichmentField) -> Result<(), AppError> {
        if self.stage != LeadStage::Discovered {
            return Err(AppError::InvalidTransition(format!(
                "cannot append {} to lead {} in stage {:?}",
                name, self.key, self.stage
            )));
        }
        let entries = self.fields.entry(name).or_default();
        let duplicate = entries
            .iter()
            .any(|f| f.source_id == field.source_id && f.value.eq_ignore_ascii_case(&field.value));
        if !duplicate {
            entries.push(field);
        }
        Ok(())
    }

    pub fn invalidate(&mut self, name: FieldName, value: &str) -> Result<(), AppError> {
        self.ensure_open("invalidate a field on")?;
        self.invalidated.insert((name, value.to_ascii_lowercase()));
        Ok(())
    }

    pub fn record_events(&mut self, events: impl IntoIterator<Item = ProviderEvent>) {
        if !self.stage.is_terminal() {
            self.events.extend(events);
        }
    }

    pub fn mark_enriched(&mut self) -> Result<(), AppError> {
        self.transition(LeadStage::Discovered, LeadStage::Enriched)
    }

    pub fn set_score(&mut self, score: f64, grade: QualityGrade) -> Result<(), AppError> {
        self.transition(LeadStage::Enriched, LeadStage::Scored)?;
        self.final_confidence_score = Some(score);
        self.quality_grade = Some(grade);
        Ok(())
    }

    pub fn qualify(&mut self) -> Result<(), AppError> {
        self.transition(LeadStage::Scored, LeadStage::Qualified)
    }

    /// Any non-terminal lead may be rejected.
    pub fn reject(&mut self, reason: RejectionReason) -> Result<(), AppError> {
        self.ensure_open("reject")?;
        self.stage = LeadStage::Rejected;
        self.rejection = Some(reason);
        Ok(())
    }

    fn transition(&mut self, from: LeadStage, to: LeadStage) -> Result<(), AppError> {
        if self.stage != from {
            return Err(AppError::InvalidTransition(format!(
                "lead {} expected stage {:?} before {:?}, found {:?}",
                self.key, from, to, self.stage
            )));
        }
        self.stage = to;
        Ok(())
    }

    fn is_invalidated(&self, name: FieldName, value: &str) -> bool {
        self.invalidated
            .contains(&(name, value.to_ascii_lowercase()))
    }

    /// Enrichment evidence for a field, minus invalidated values.
    pub fn evidence(&self, name: FieldName) -> impl Iterator<Item = &EnrichmentField> + '_ {
        self.fields
            .get(&name)
            .into_iter()
            .flatten()
            .filter(move |f| !self.is_invalidated(name, &f.value))
    }

    /// Highest-precedence enrichment value for a field.
    pub fn winner(&self, name: FieldName) -> Option<&EnrichmentField> {
        self.evidence(name).max_by(|a, b| a.precedence(b))
    }

    /// True when either the directory or a provider supplied the field.
    pub fn has_field(&self, name: FieldName) -> bool {
        self.candidate.value_of(name).is_some() || self.evidence(name).next().is_some()
    }

    /// Trust classes backing a field; directory-supplied values count as observed.
    pub fn trust_classes(&self, name: FieldName) -> BTreeSet<SourceTrustClass> {
        let mut classes: BTreeSet<SourceTrustClass> =
            self.evidence(name).map(|f| f.source_trust_class).collect();
        if self.candidate.value_of(name).is_some() {
            classes.insert(SourceTrustClass::Observed);
        }
        classes
    }

    /// Best known value for a field, preferring provider evidence.
    pub fn best_value(&self, name: FieldName) -> Option<&str> {
        self.winner(name)
            .map(|f| f.value.as_str())
            .or_else(|| self.candidate.value_of(name))
    }

    pub fn total_cost(&self) -> Cost {
        self.events.iter().map(ProviderEvent::cost).sum()
    }

    pub fn error_kinds(&self) -> BTreeSet<ErrorKind> {
        let mut kinds: BTreeSet<ErrorKind> =
            self.events.iter().filter_map(ProviderEvent::error_kind).collect();
        if matches!(self.rejection, Some(RejectionReason::InvalidRecord { .. })) {
            kinds.insert(ErrorKind::Validation);
        }
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(value: &str, source: &str, class: SourceTrustClass, confidence: f64) -> EnrichmentField {
        EnrichmentField::new(value, ProviderId::from(source), class, confidence, Cost::ZERO)
    }

    fn lead() -> EnrichedLead {
        EnrichedLead::new(CandidateRecord::new("Blue Door Bakery", "12 Main St, Austin, TX"))
    }

    #[test]
    fn test_winner_prefers_trust_over_confidence() {
        let mut lead = lead();
        lead.append_field(
            FieldName::Email,
            field("guess@bluedoor.com", "pattern", SourceTrustClass::Inferred, 99.0),
        )
        .unwrap();
        lead.append_field(
            FieldName::Email,
            field("owner@bluedoor.com", "neverbounce", SourceTrustClass::Verified, 80.0),
        )
        .unwrap();

        assert_eq!(lead.winner(FieldName::Email).unwrap().value, "owner@bluedoor.com");
    }

    #[test]
    fn test_winner_ties_broken_by_confidence() {
        let mut lead = lead();
        lead.append_field(
            FieldName::Email,
            field("a@bluedoor.com", "hunter", SourceTrustClass::Observed, 70.0),
        )
        .unwrap();
        lead.append_field(
            FieldName::Email,
            field("b@bluedoor.com", "scraper", SourceTrustClass::Observed, 85.0),
        )
        .unwrap();

        assert_eq!(lead.winner(FieldName::Email).unwrap().value, "b@bluedoor.com");
    }

    #[test]
    fn test_invalidated_values_are_ignored() {
        let mut lead = lead();
        lead.append_field(
            FieldName::Email,
            field("Bad@bluedoor.com", "hunter", SourceTrustClass::Observed, 90.0),
        )
        .unwrap();
        lead.invalidate(FieldName::Email, "bad@bluedoor.com").unwrap();

        assert!(lead.winner(FieldName::Email).is_none());
        assert!(!lead.has_field(FieldName::Email));
    }

    #[test]
    fn test_terminal_stage_is_immutable() {
        let mut lead = lead();
        lead.mark_enriched().unwrap();
        lead.set_score(82.0, QualityGrade::B).unwrap();
        lead.qualify().unwrap();

        assert!(lead.reject(RejectionReason::Aborted).is_err());
        assert!(lead.mark_enriched().is_err());
        assert_eq!(lead.stage, LeadStage::Qualified);
    }

    #[test]
    fn test_fields_cannot_be_appended_after_enrichment() {
        let mut lead = lead();
        lead.mark_enriched().unwrap();
        let result = lead.append_field(
            FieldName::Phone,
            field("+15125550100", "google_places", SourceTrustClass::Observed, 90.0),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_directory_values_count_as_observed() {
        let lead = EnrichedLead::new(
            CandidateRecord::new("Blue Door Bakery", "12 Main St").with_phone("512-555-0100"),
        );
        assert!(lead.has_field(FieldName::Phone));
        assert_eq!(
            lead.trust_classes(FieldName::Phone),
            BTreeSet::from([SourceTrustClass::Observed])
        );
        assert!(lead.trust_classes(FieldName::Email).is_empty());
    }

    #[test]
    fn test_rejection_codes() {
        assert_eq!(
            RejectionReason::MissingField { field: FieldName::Email }.code(),
            "missing_email"
        );
        assert_eq!(
            RejectionReason::TrustVeto { field: FieldName::Email }.code(),
            "untrusted_email"
        );
    }
}
