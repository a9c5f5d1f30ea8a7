//! Build provenance metadata
//!
//! Metadata is gathered once per build and rendered three ways:
//! - an inline string capped in size (the layer version description)
//! - a YAML document embedded inside the artifact
//! - a canonical JSON companion document that travels next to the artifact

mod inline;

pub use inline::{
    min_inline_limit, parse_inline, InlineMetadata, DEFAULT_INLINE_LIMIT, TRUNCATION_MARKER,
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

/// Archive path of the embedded metadata document
pub const EMBEDDED_METADATA_PATH: &str = "lambda_zip_metadata.yml";

/// Errors rendering metadata
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Canonical JSON error: {0}")]
    Canonical(String),
}

/// Version-control state of the source tree
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcsInfo {
    /// Active branch (None when detached or unknown)
    pub branch: Option<String>,
    /// HEAD commit
    pub commit: Option<String>,
    /// `git describe --always --dirty` output
    pub describe: Option<String>,
    /// Tracked files differ from HEAD
    pub dirty: bool,
    /// Number of untracked files
    pub untracked: u64,
}

/// Who built the artifact, where and when
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderInfo {
    pub host: String,
    pub user: String,
    pub source_path: String,
    /// Unix seconds
    pub timestamp: i64,
}

impl BuilderInfo {
    /// Gather builder provenance for a source directory
    pub fn gather(source_path: &Path) -> Self {
        Self {
            host: whoami::fallible::hostname().unwrap_or_else(|_| "unknown".to_string()),
            user: whoami::username(),
            source_path: source_path.to_string_lossy().to_string(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// Provenance of one build.
///
/// Fields are read-only. The content hash is attached exactly once through
/// [`Metadata::sealed`], which consumes the unsealed value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    describe: Option<String>,
    #[serde(default)]
    dirty: bool,
    #[serde(default)]
    untracked: u64,
    host: String,
    user: String,
    source_path: String,
    timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sha256b64: Option<String>,
}

impl Metadata {
    /// Aggregate VCS and builder provenance. Missing VCS data renders as
    /// empty/zero.
    pub fn build_from(vcs: Option<VcsInfo>, builder: BuilderInfo) -> Self {
        let vcs = vcs.unwrap_or_default();
        Self {
            branch: non_empty(vcs.branch),
            commit: non_empty(vcs.commit),
            describe: non_empty(vcs.describe),
            dirty: vcs.dirty,
            untracked: vcs.untracked,
            host: builder.host,
            user: builder.user,
            source_path: builder.source_path,
            timestamp: builder.timestamp,
            sha256b64: None,
        }
    }

    /// Attach the artifact content hash
    pub fn sealed(self, sha256b64: impl Into<String>) -> Self {
        Self {
            sha256b64: Some(sha256b64.into()),
            ..self
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.sha256b64.is_some()
    }

    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    pub fn commit(&self) -> Option<&str> {
        self.commit.as_deref()
    }

    pub fn describe(&self) -> Option<&str> {
        self.describe.as_deref()
    }

    pub fn dirty(&self) -> bool {
        self.dirty
    }

    pub fn untracked(&self) -> u64 {
        self.untracked
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn source_path(&self) -> &str {
        &self.source_path
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn sha256b64(&self) -> Option<&str> {
        self.sha256b64.as_deref()
    }

    /// Full YAML document stored inside the artifact
    pub fn embedded_document(&self) -> Result<String, MetadataError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Read an embedded document back
    pub fn from_embedded_document(yaml: &str) -> Result<Self, MetadataError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Full canonical JSON document plus caller-supplied fields.
    ///
    /// Provenance fields take precedence over extras with the same key.
    pub fn companion_document(&self, extra: &Map<String, Value>) -> Result<String, MetadataError> {
        let value = Value::Object(self.companion_fields(extra)?);
        let bytes = serde_json_canonicalizer::to_vec(&value)
            .map_err(|e| MetadataError::Canonical(e.to_string()))?;
        String::from_utf8(bytes).map_err(|e| MetadataError::Canonical(e.to_string()))
    }

    /// Companion fields flattened to strings, for object-store user metadata
    pub fn object_metadata(
        &self,
        extra: &Map<String, Value>,
    ) -> Result<BTreeMap<String, String>, MetadataError> {
        Ok(self
            .companion_fields(extra)?
            .into_iter()
            .map(|(key, value)| {
                let text = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                (key, text)
            })
            .collect())
    }

    fn companion_fields(&self, extra: &Map<String, Value>) -> Result<Map<String, Value>, MetadataError> {
        let mut fields = extra.clone();
        if let Value::Object(own) = serde_json::to_value(self)? {
            fields.extend(own);
        }
        Ok(fields)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}
