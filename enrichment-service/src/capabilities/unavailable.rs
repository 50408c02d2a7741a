use async_trait::async_trait;

use super::{Extraction, Extractor};
use crate::error::CapabilityError;

/// Extractor for a modality with no provider configured. Every call fails,
/// which fails the job.
pub struct UnavailableExtractor {
    capability: &'static str,
    reason: String,
}

impl UnavailableExtractor {
    pub fn new(capability: &'static str, reason: impl Into<String>) -> Self {
        Self {
            capability,
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Extractor for UnavailableExtractor {
    async fn extract(&self, _bytes: &[u8], _filename: &str) -> Result<Extraction, CapabilityError> {
        Err(CapabilityError::Unavailable {
            capability: self.capability,
            reason: self.reason.clone(),
        })
    }
}
