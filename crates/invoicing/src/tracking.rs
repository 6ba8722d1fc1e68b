use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use cadence_core::{AccountId, DomainError, DomainResult, InvoiceId};

use crate::item::ProposedItem;

/// Idempotency token attached to the items produced by one recompute request.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackingId(String);

impl TrackingId {
    pub fn new(value: impl Into<String>) -> DomainResult<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(DomainError::validation("tracking id must not be empty"));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for TrackingId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<uuid::Uuid> for TrackingId {
    fn from(value: uuid::Uuid) -> Self {
        Self(value.to_string())
    }
}

/// What a tracking id produced, and from which candidate set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingRecord {
    pub tracking_id: TrackingId,
    pub account_id: AccountId,
    /// `None` when the recompute produced no invoice.
    pub invoice_id: Option<InvoiceId>,
    pub target_date: NaiveDate,
    pub fingerprint: String,
}

/// SHA-256 (hex) of the JSON encoding of a candidate set.
///
/// Candidates are compared in the order given; projector output is already
/// sorted, so the same timeline always fingerprints the same.
pub fn fingerprint(candidates: &[ProposedItem]) -> DomainResult<String> {
    let bytes = serde_json::to_vec(candidates)
        .map_err(|e| DomainError::invariant(format!("candidate encoding failed: {e}")))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}
