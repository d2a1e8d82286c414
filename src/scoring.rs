use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::models::{EnrichedLead, FieldName, QualityGrade, SourceTrustClass};

/// Multiplier applied to a field's confidence by trust class.
/// `inferred: None` excludes inferred evidence from the score entirely.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrustWeights {
    pub verified: f64,
    pub observed: f64,
    pub inferred: Option<f64>,
}

impl TrustWeights {
    pub fn multiplier(&self, class: SourceTrustClass) -> f64 {
        match class {
            SourceTrustClass::Verified => self.verified,
            SourceTrustClass::Observed => self.observed,
            SourceTrustClass::Inferred => self.inferred.unwrap_or(0.0),
        }
    }
}

impl Default for TrustWeights {
    fn default() -> Self {
        Self {
            verified: 1.0,
            observed: 0.9,
            inferred: Some(0.5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringPolicy {
    /// Structural points for core fields the lead carries from any source.
    pub address_points: f64,
    pub phone_points: f64,
    pub website_points: f64,
    pub rating_threshold: f64,
    pub rating_points: f64,
    pub review_threshold: u32,
    pub review_points: f64,
    /// Share of the winning value's weighted confidence a field contributes.
    pub field_weights: BTreeMap<FieldName, f64>,
    pub trust: TrustWeights,
    /// Added once per field when two or more providers agree on its winner.
    pub agreement_points: f64,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            address_points: 10.0,
            phone_points: 10.0,
            website_points: 5.0,
            rating_threshold: 4.0,
            rating_points: 5.0,
            review_threshold: 10,
            review_points: 5.0,
            field_weights: BTreeMap::from([
                (FieldName::Email, 0.6),
                (FieldName::Phone, 0.15),
                (FieldName::Website, 0.1),
            ]),
            trust: TrustWeights::default(),
            agreement_points: 5.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub structural: f64,
    pub reputation: f64,
    pub evidence: BTreeMap<FieldName, f64>,
    pub agreement: f64,
    pub total: f64,
}

/// Deterministic 0-100 confidence for a lead. Depends only on the lead's
/// candidate data and enrichment fields.
pub fn score(lead: &EnrichedLead, policy: &ScoringPolicy) -> f64 {
    breakdown(lead, policy).total
}

pub fn breakdown(lead: &EnrichedLead, policy: &ScoringPolicy) -> ScoreBreakdown {
    let mut out = ScoreBreakdown::default();

    for (field, points) in [
        (FieldName::Address, policy.address_points),
        (FieldName::Phone, policy.phone_points),
        (FieldName::Website, policy.website_points),
    ] {
        if lead.has_field(field) {
            out.structural += points;
        }
    }

    let candidate = &lead.candidate;
    if candidate.rating.is_some_and(|r| r >= policy.rating_threshold) {
        out.reputation += policy.rating_points;
    }
    if candidate.review_count.is_some_and(|n| n >= policy.review_threshold) {
        out.reputation += policy.review_points;
    }

    for (&field, &weight) in &policy.field_weights {
        let Some(winner) = lead.winner(field) else {
            continue;
        };
        if winner.source_trust_class == SourceTrustClass::Inferred && policy.trust.inferred.is_none() {
            continue;
        }

        let contribution = winner.confidence * policy.trust.multiplier(winner.source_trust_class) * weight;
        out.evidence.insert(field, contribution);

        // A verifier echoing the value it was asked about is not a second finder.
        let agreeing: BTreeSet<_> = lead
            .evidence(field)
            .filter(|f| !f.confirmation && f.value.eq_ignore_ascii_case(&winner.value))
            .map(|f| &f.source_id)
            .collect();
        if agreeing.len() >= 2 {
            out.agreement += policy.agreement_points;
        }
    }

    let raw = out.structural + out.reputation + out.evidence.values().sum::<f64>() + out.agreement;
    out.total = round2(raw.clamp(0.0, 100.0));
    out
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Bucket a score. Top grades require email evidence.
pub fn grade(lead: &EnrichedLead, score: f64) -> QualityGrade {
    let email = lead.winner(FieldName::Email);
    let verified_email = email.is_some_and(|e| e.source_trust_class == SourceTrustClass::Verified);

    if score >= 90.0 && verified_email {
        QualityGrade::A
    } else if score >= 75.0 && email.is_some() {
        QualityGrade::B
    } else if score >= 60.0 {
        QualityGrade::C
    } else if score >= 40.0 {
        QualityGrade::D
    } else {
        QualityGrade::F
    }
}
