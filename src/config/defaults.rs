//! Built-in defaults (layer 1)
//!
//! Hardcoded defaults for all configuration values.

use serde::{Deserialize, Serialize};

/// Packages the AWS Lambda Python runtime already provides
pub const RUNTIME_PROVIDED_PACKAGES: &[&str] = &[
    "boto3",
    "botocore",
    "dateutil",
    "pip",
    "python_dateutil",
    "jmespath",
    "s3transfer",
    "setuptools",
    "six",
    "urllib3",
];

/// Built-in default configuration values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuiltinDefaults {
    /// Packages omitted from every artifact (default: the runtime's own)
    pub runtime_provided: Vec<String>,

    /// Directory inside the layer ZIP holding packages (default: "python")
    pub layer_root: String,

    /// Byte cap of the layer description (default: 256)
    pub inline_limit: usize,

    /// Archived but not hashed (default: [".pyc"])
    pub hash_skip_suffixes: Vec<String>,

    /// pip version needed for layer builds (default: "22.2")
    pub min_pip_version: String,
}

impl Default for BuiltinDefaults {
    fn default() -> Self {
        Self {
            runtime_provided: RUNTIME_PROVIDED_PACKAGES
                .iter()
                .map(|p| p.to_string())
                .collect(),
            layer_root: "python".to_string(),
            inline_limit: 256,
            hash_skip_suffixes: vec![".pyc".to_string()],
            min_pip_version: "22.2".to_string(),
        }
    }
}

impl BuiltinDefaults {
    /// Convert to JSON Value for merging
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "runtime_provided": self.runtime_provided,
            "layer_root": self.layer_root,
            "inline_limit": self.inline_limit,
            "hash_skip_suffixes": self.hash_skip_suffixes,
            "min_pip_version": self.min_pip_version,
            "local_dependency": [],
            "zip_omit": [],
            "layer_omit_projects": [],
            "layer_omit_paths": []
        })
    }
}
