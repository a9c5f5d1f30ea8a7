//! Layer version de-duplication
//!
//! A freshly built layer is equivalent to a published version when their
//! content hashes are equal. The comparison is an exact, case-sensitive string
//! match on the base64 encoding; both sides produce it the same way.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::metadata::parse_inline;

/// One published layer version, as listed by the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerVersionCandidate {
    pub version_id: String,
    pub content_hash_base64: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer_version_arn: Option<String>,
}

impl LayerVersionCandidate {
    pub fn new(version_id: impl Into<String>, content_hash_base64: impl Into<String>) -> Self {
        Self {
            version_id: version_id.into(),
            content_hash_base64: content_hash_base64.into(),
            layer_version_arn: None,
        }
    }

    pub fn with_arn(mut self, arn: impl Into<String>) -> Self {
        self.layer_version_arn = Some(arn.into());
        self
    }

    /// Candidate from a published version description.
    ///
    /// Returns `None` when the description carries no inline metadata hash,
    /// e.g. versions published by hand or by other tools.
    pub fn from_description(
        version_id: impl Into<String>,
        description: &str,
        arn: Option<String>,
    ) -> Option<Self> {
        let hash = parse_inline(description)?.sha256b64?;
        Some(Self {
            version_id: version_id.into(),
            content_hash_base64: hash,
            layer_version_arn: arn,
        })
    }
}

/// Outcome of the de-duplication check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "version_id", rename_all = "snake_case")]
pub enum Decision {
    /// An equivalent version exists
    ReuseVersion(String),
    /// No equivalent version; publish the new artifact
    PublishNew,
}

/// Decides whether a built layer may reuse a published version
#[derive(Debug, Clone, Copy, Default)]
pub struct LayerDeduplicator;

impl LayerDeduplicator {
    pub fn new() -> Self {
        Self
    }

    /// First candidate whose hash equals `local_hash`.
    ///
    /// Any match is as good as another since the hash defines equivalence,
    /// so this is not a search for the newest version.
    pub fn find_match<'a>(
        &self,
        local_hash: &str,
        candidates: &'a [LayerVersionCandidate],
    ) -> Option<&'a LayerVersionCandidate> {
        candidates
            .iter()
            .find(|c| c.content_hash_base64 == local_hash)
    }

    pub fn decide(&self, local_hash: &str, candidates: &[LayerVersionCandidate]) -> Decision {
        debug!(candidates = candidates.len(), %local_hash, "comparing layer hash");
        match self.find_match(local_hash, candidates) {
            Some(existing) => {
                info!(
                    version = %existing.version_id,
                    sha256b64 = %local_hash,
                    "layer matches an already-published version"
                );
                Decision::ReuseVersion(existing.version_id.clone())
            }
            None => {
                info!(sha256b64 = %local_hash, "no published layer version matches");
                Decision::PublishNew
            }
        }
    }
}
