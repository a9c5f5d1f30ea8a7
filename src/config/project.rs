//! Project configuration discovery
//!
//! Reads the `[tool.lambda_zip]` (or top-level `[lambda_zip]`) section of
//! `pyproject.toml` in the project being packaged and, recursively, in every
//! directory it lists under `local_dependency`.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::effective::ConfigError;

/// File holding the project configuration section
pub const PYPROJECT_FILE: &str = "pyproject.toml";

/// One project's configuration section
#[derive(Debug, Clone)]
pub struct ProjectSection {
    /// Canonical project directory
    pub project_dir: PathBuf,

    /// `pyproject.toml` path, when the project has one
    pub pyproject_path: Option<PathBuf>,

    /// SHA-256 digest of the raw `pyproject.toml` bytes
    pub digest: Option<String>,

    /// The section, with `local_dependency` entries resolved to absolute paths
    pub value: Value,
}

/// Collect the sections of `root` and its local dependencies.
///
/// Dependencies come before their dependents and `root` is always last. A
/// directory reachable along several paths is visited once.
pub fn discover_projects(root: &Path) -> Result<Vec<ProjectSection>, ConfigError> {
    let root = fs::canonicalize(root)
        .map_err(|e| ConfigError::IoError(format!("{}: {}", root.display(), e)))?;

    let mut visited = BTreeSet::new();
    let mut sections = Vec::new();
    visit(&root, &mut visited, &mut sections)?;
    Ok(sections)
}

fn visit(
    dir: &Path,
    visited: &mut BTreeSet<PathBuf>,
    sections: &mut Vec<ProjectSection>,
) -> Result<(), ConfigError> {
    if !visited.insert(dir.to_path_buf()) {
        return Ok(());
    }

    let section = load_section(dir)?;
    debug!(
        project = %dir.display(),
        has_pyproject = section.pyproject_path.is_some(),
        "loaded project configuration"
    );

    for dep in local_dependencies(&section.value) {
        visit(Path::new(dep), visited, sections)?;
    }
    sections.push(section);
    Ok(())
}

fn local_dependencies(section: &Value) -> impl Iterator<Item = &str> {
    section
        .get("local_dependency")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
        .filter_map(|v| v.as_str())
}

fn load_section(dir: &Path) -> Result<ProjectSection, ConfigError> {
    let path = dir.join(PYPROJECT_FILE);
    if !path.is_file() {
        return Ok(ProjectSection {
            project_dir: dir.to_path_buf(),
            pyproject_path: None,
            digest: None,
            value: Value::Object(serde_json::Map::new()),
        });
    }

    let bytes = fs::read(&path)
        .map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))?;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let digest = hex::encode(hasher.finalize());

    let contents = String::from_utf8(bytes).map_err(|e| {
        ConfigError::ParseError(format!("{}: invalid UTF-8: {}", path.display(), e))
    })?;
    let document: toml::Table = toml::from_str(&contents).map_err(|e| {
        ConfigError::ParseError(format!("{}: TOML parse error: {}", path.display(), e))
    })?;

    let mut value = select_section(document)
        .map(toml_to_json)
        .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
    if !value.is_object() {
        return Err(ConfigError::ParseError(format!(
            "{}: lambda_zip must be a table",
            path.display()
        )));
    }
    resolve_local_dependencies(dir, &path, &mut value)?;

    Ok(ProjectSection {
        project_dir: dir.to_path_buf(),
        pyproject_path: Some(path),
        digest: Some(digest),
        value,
    })
}

/// `[tool.lambda_zip]` wins over a top-level `[lambda_zip]`.
fn select_section(mut document: toml::Table) -> Option<toml::Value> {
    let tool_section = document
        .get_mut("tool")
        .and_then(|tool| tool.as_table_mut())
        .and_then(|tool| tool.remove("lambda_zip"));
    tool_section.or_else(|| document.remove("lambda_zip"))
}

fn resolve_local_dependencies(
    dir: &Path,
    pyproject: &Path,
    section: &mut Value,
) -> Result<(), ConfigError> {
    let Some(entries) = section.get_mut("local_dependency") else {
        return Ok(());
    };
    let Some(items) = entries.as_array_mut() else {
        return Err(ConfigError::ParseError(format!(
            "{}: local_dependency must be an array of paths",
            pyproject.display()
        )));
    };

    for item in items.iter_mut() {
        let Some(relative) = item.as_str() else {
            return Err(ConfigError::ParseError(format!(
                "{}: local_dependency entries must be strings",
                pyproject.display()
            )));
        };
        let resolved = fs::canonicalize(dir.join(relative)).map_err(|_| {
            ConfigError::MissingLocalDependency {
                path: dir.join(relative),
                declared_in: pyproject.to_path_buf(),
            }
        })?;
        if !resolved.is_dir() {
            return Err(ConfigError::MissingLocalDependency {
                path: resolved,
                declared_in: pyproject.to_path_buf(),
            });
        }
        *item = Value::String(resolved.to_string_lossy().to_string());
    }
    Ok(())
}

/// Convert TOML Value to JSON Value
fn toml_to_json(toml: toml::Value) -> Value {
    match toml {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::Number(i.into()),
        toml::Value::Float(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(arr) => Value::Array(arr.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => {
            let map: serde_json::Map<String, Value> = table
                .into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect();
            Value::Object(map)
        }
    }
}
