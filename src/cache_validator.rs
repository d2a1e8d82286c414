use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Provider response as stored in the response cache.
///
/// The serialized response is kept next to its SHA-256 checksum. An entry
/// whose checksum no longer matches is treated as a miss, so a corrupted
/// entry costs one fresh provider call instead of feeding bad data into a
/// lead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedCacheEntry {
    /// The serialized provider response (JSON)
    pub data: String,
    /// SHA-256 checksum of `data` (hex encoded)
    pub checksum: String,
}

impl ValidatedCacheEntry {
    pub fn new(data: String) -> Self {
        let checksum = Self::compute_checksum(&data);
        Self { data, checksum }
    }

    /// Serialize a provider response and seal it with a checksum.
    pub fn seal<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::to_string(value)?))
    }

    fn compute_checksum(data: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn is_valid(&self) -> bool {
        Self::compute_checksum(&self.data) == self.checksum
    }

    /// Verify the checksum and decode the response.
    ///
    /// Returns None if the entry was tampered with or no longer decodes as `T`.
    pub fn open<T: DeserializeOwned>(&self) -> Option<T> {
        if !self.is_valid() {
            tracing::warn!(
                "Cache validation failed: checksum mismatch. Expected: {}, Data length: {}",
                self.checksum,
                self.data.len()
            );
            return None;
        }

        match serde_json::from_str(&self.data) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("Cached response no longer decodes: {}", e);
                None
            }
        }
    }
}
