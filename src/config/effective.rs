//! Effective configuration with full provenance
//!
//! The effective config captures the merged configuration plus
//! information about where each value came from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::defaults::BuiltinDefaults;
use super::merge::merge_layers;
use super::project::discover_projects;
use crate::archive::FilterError;
use crate::metadata::min_inline_limit;

/// Schema version for effective_config
pub const SCHEMA_VERSION: u32 = 1;

/// Schema identifier
pub const SCHEMA_ID: &str = "lambda-zip/effective_config@1";

/// Lambda caps layer descriptions at this many bytes
const MAX_INLINE_LIMIT: usize = 256;

/// Origin of a configuration source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigOrigin {
    Builtin,
    Dependency,
    Project,
    Cli,
}

/// A contributing config source with provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSource {
    /// Origin of this source
    pub origin: ConfigOrigin,

    /// File path (None for builtin/cli)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// SHA-256 digest of raw file bytes (None for builtin/cli)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// Typed view of the merged configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackagingConfig {
    /// Local projects to install first, dependencies before dependents
    #[serde(default)]
    pub local_dependency: Vec<PathBuf>,

    /// Regexes omitted from both artifacts
    #[serde(default)]
    pub zip_omit: Vec<String>,

    /// Project names omitted from the layer
    #[serde(default)]
    pub layer_omit_projects: Vec<String>,

    /// Regexes omitted from the layer, matched beneath the layer root
    #[serde(default)]
    pub layer_omit_paths: Vec<String>,

    pub runtime_provided: Vec<String>,
    pub layer_root: String,
    pub inline_limit: usize,
    pub hash_skip_suffixes: Vec<String>,
    pub min_pip_version: String,
}

/// Effective configuration with full provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveConfig {
    /// Schema version
    pub schema_version: u32,

    /// Schema identifier
    pub schema_id: String,

    /// When this config was computed
    pub created_at: DateTime<Utc>,

    /// The merged configuration object
    pub config: Value,

    /// Contributing sources in precedence order
    pub sources: Vec<ConfigSource>,
}

impl EffectiveConfig {
    /// Build effective config for the project rooted at `project_dir`
    pub fn build(project_dir: &Path, cli_overrides: Option<Value>) -> Result<Self, ConfigError> {
        let mut layers = Vec::new();
        let mut sources = Vec::new();

        // Layer 1: Built-in defaults
        let defaults = BuiltinDefaults::default();
        layers.push(defaults.to_value());
        sources.push(ConfigSource {
            origin: ConfigOrigin::Builtin,
            path: None,
            digest: None,
        });

        // Layers 2-3: local dependencies, then the project itself
        let sections = discover_projects(project_dir)?;
        let last = sections.len().saturating_sub(1);
        for (i, section) in sections.into_iter().enumerate() {
            let Some(path) = section.pyproject_path else {
                continue;
            };
            layers.push(section.value);
            sources.push(ConfigSource {
                origin: if i == last {
                    ConfigOrigin::Project
                } else {
                    ConfigOrigin::Dependency
                },
                path: Some(path.to_string_lossy().to_string()),
                digest: section.digest,
            });
        }

        // Layer 4: CLI overrides
        if let Some(cli) = cli_overrides {
            layers.push(cli);
            sources.push(ConfigSource {
                origin: ConfigOrigin::Cli,
                path: None,
                digest: None,
            });
        }

        let merged = merge_layers(layers);
        Self::validate_config(&merged)?;
        debug!(sources = sources.len(), "configuration merged");

        Ok(Self {
            schema_version: SCHEMA_VERSION,
            schema_id: SCHEMA_ID.to_string(),
            created_at: Utc::now(),
            config: merged,
            sources,
        })
    }

    /// Validate configuration values
    fn validate_config(config: &Value) -> Result<(), ConfigError> {
        // inline_limit must leave room for the content hash
        if let Some(limit) = config.get("inline_limit") {
            let min = min_inline_limit() as u64;
            match limit.as_u64() {
                Some(n) if n >= min && n <= MAX_INLINE_LIMIT as u64 => {}
                _ => {
                    return Err(ConfigError::ValidationError(format!(
                        "inline_limit must be in [{}, {}]",
                        min, MAX_INLINE_LIMIT
                    )))
                }
            }
        }

        // layer_root must be a plain relative directory name
        if let Some(root) = config.get("layer_root").and_then(|v| v.as_str()) {
            if root.is_empty()
                || root.starts_with('/')
                || root.ends_with('/')
                || root.split('/').any(|part| part.is_empty() || part == "..")
            {
                return Err(ConfigError::ValidationError(format!(
                    "layer_root must be a relative directory, got {:?}",
                    root
                )));
            }
        }

        // Regex options must compile
        for key in ["zip_omit", "layer_omit_paths"] {
            let Some(patterns) = config.get(key).and_then(|v| v.as_array()) else {
                continue;
            };
            for pattern in patterns {
                let Some(pattern) = pattern.as_str() else {
                    return Err(ConfigError::ValidationError(format!(
                        "{} entries must be strings",
                        key
                    )));
                };
                regex_lite::Regex::new(pattern).map_err(|source| {
                    FilterError::InvalidPattern {
                        pattern: pattern.to_string(),
                        source,
                    }
                })?;
            }
        }

        Ok(())
    }

    /// Typed view of the merged configuration
    pub fn packaging(&self) -> Result<PackagingConfig, ConfigError> {
        serde_json::from_value(self.config.clone())
            .map_err(|e| ConfigError::ValidationError(e.to_string()))
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Write to file
    pub fn write_to_file(&self, path: &Path) -> io::Result<()> {
        let json = self.to_json().map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("JSON serialization failed: {}", e),
            )
        })?;
        fs::write(path, json)
    }

    /// Get a config value by path (dot-separated)
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut current = &self.config;
        for part in path.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    /// Get a config value as string
    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(|v| v.as_str())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("local dependency {path} (declared in {declared_in}) is not a directory")]
    MissingLocalDependency { path: PathBuf, declared_in: PathBuf },

    #[error("invalid omission rule: {0}")]
    InvalidRule(#[from] FilterError),
}
