//! Remote collaborators
//!
//! Abstracts the AWS calls for testability. Provides:
//! - `LayerRegistry`, `ObjectStore`, `FunctionUpdater`: interfaces the
//!   pipeline delivers through
//! - `mock::MockBackend`: in-process recording backend for tests
//! - `aws_cli::AwsCli`: the `aws` command line client for production

pub mod aws_cli;
pub mod mock;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::Path;
use std::str::FromStr;

pub use crate::install::{DependencyInstaller, InstallError, InstallRequest};
use crate::layer::LayerVersionCandidate;

/// Remote call errors
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("Invalid object URL '{0}': expected s3://bucket/key")]
    InvalidUrl(String),

    #[error("Failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("{command} exited with status {status:?}: {stderr}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("Unexpected response: {0}")]
    Response(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No layer version ARN to attach for layer {0}")]
    MissingLayerArn(String),

    #[error("Injected failure: {0}")]
    Injected(String),
}

/// Location of an object in S3
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectUrl {
    pub bucket: String,
    /// Key without a leading `/`; may end in `/` to name a prefix
    pub key: String,
}

impl ObjectUrl {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    pub fn parse(url: &str) -> Result<Self, RemoteError> {
        let rest = url
            .strip_prefix("s3://")
            .ok_or_else(|| RemoteError::InvalidUrl(url.to_string()))?;
        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(RemoteError::InvalidUrl(url.to_string()));
        }
        Ok(Self::new(bucket, key.trim_start_matches('/')))
    }

    /// Names a prefix rather than an object
    pub fn is_prefix(&self) -> bool {
        self.key.is_empty() || self.key.ends_with('/')
    }

    /// The object for an artifact called `name`: prefixes get `<name>.zip`
    /// appended, full keys are used as given.
    pub fn for_artifact(&self, name: &str) -> Self {
        if self.is_prefix() {
            Self::new(self.bucket.clone(), format!("{}{}.zip", self.key, name))
        } else {
            self.clone()
        }
    }
}

impl fmt::Display for ObjectUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

impl FromStr for ObjectUrl {
    type Err = RemoteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Request to publish a layer version from an uploaded object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub layer_name: String,
    pub object: ObjectUrl,
    /// Inline metadata; later builds read the content hash back from it
    pub description: String,
}

/// A newly published layer version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedLayer {
    pub version_id: String,
    pub layer_version_arn: String,
}

/// Published layer versions
pub trait LayerRegistry {
    /// Every version of `layer_name` that carries a content hash
    fn list_layer_versions(
        &self,
        layer_name: &str,
    ) -> Result<Vec<LayerVersionCandidate>, RemoteError>;

    fn publish_layer_version(&self, request: &PublishRequest)
        -> Result<PublishedLayer, RemoteError>;
}

/// Artifact storage
pub trait ObjectStore {
    /// Upload a local file with string user metadata
    fn upload_object(
        &self,
        local_path: &Path,
        url: &ObjectUrl,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), RemoteError>;
}

/// Points a function at new code
pub trait FunctionUpdater {
    /// Replace the function code, then attach `layer_version_arn` when given
    fn update_function_code(
        &self,
        function_name: &str,
        object: &ObjectUrl,
        layer_version_arn: Option<&str>,
    ) -> Result<(), RemoteError>;
}
