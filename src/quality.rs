use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::models::{EnrichedLead, FieldName, RejectionReason, SourceTrustClass};

/// Acceptance rules for scored leads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityRequirements {
    pub require_email: bool,
    pub require_phone: bool,
    pub require_website: bool,
    pub minimum_confidence: f64,
    /// A field backed only by these trust classes vetoes the lead.
    pub rejected_source_trust_classes: BTreeSet<SourceTrustClass>,
}

impl Default for QualityRequirements {
    fn default() -> Self {
        Self {
            require_email: true,
            require_phone: false,
            require_website: false,
            minimum_confidence: 70.0,
            rejected_source_trust_classes: BTreeSet::from([SourceTrustClass::Inferred]),
        }
    }
}

impl QualityRequirements {
    fn required_fields(&self) -> impl Iterator<Item = FieldName> + '_ {
        [
            (FieldName::Email, self.require_email),
            (FieldName::Phone, self.require_phone),
            (FieldName::Website, self.require_website),
        ]
        .into_iter()
        .filter_map(|(field, required)| required.then_some(field))
    }
}

/// Decide a single lead. Rules apply in order: missing required field,
/// trust-class veto, then minimum confidence. The veto wins over any score.
pub fn evaluate(lead: &EnrichedLead, requirements: &QualityRequirements) -> Result<(), RejectionReason> {
    if let Some(field) = requirements
        .required_fields()
        .find(|field| !lead.has_field(*field))
    {
        return Err(RejectionReason::MissingField { field });
    }

    if !requirements.rejected_source_trust_classes.is_empty() {
        for field in [FieldName::Email, FieldName::Phone, FieldName::Website] {
            let classes = lead.trust_classes(field);
            let vetoed = !classes.is_empty()
                && classes
                    .iter()
                    .all(|c| requirements.rejected_source_trust_classes.contains(c));
            if vetoed {
                return Err(RejectionReason::TrustVeto { field });
            }
        }
    }

    let score = lead.final_confidence_score.unwrap_or(0.0);
    if score < requirements.minimum_confidence {
        return Err(RejectionReason::BelowMinimumConfidence {
            score,
            minimum: requirements.minimum_confidence,
        });
    }

    Ok(())
}

/// Leads that pass every rule. Pure and idempotent.
pub fn filter(leads: &[EnrichedLead], requirements: &QualityRequirements) -> Vec<EnrichedLead> {
    leads
        .iter()
        .filter(|lead| evaluate(lead, requirements).is_ok())
        .cloned()
        .collect()
}

/// Split leads into accepted and rejected-with-reason.
pub fn partition(
    leads: Vec<EnrichedLead>,
    requirements: &QualityRequirements,
) -> (Vec<EnrichedLead>, Vec<(EnrichedLead, RejectionReason)>) {
    let mut accepted = Vec::new();
    let mut rejected = Vec::new();
    for lead in leads {
        match evaluate(&lead, requirements) {
            Ok(()) => accepted.push(lead),
            Err(reason) => rejected.push((lead, reason)),
        }
    }
    (accepted, rejected)
}
