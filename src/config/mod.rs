//! Configuration merge system
//!
//! Implements the layered configuration merge:
//! 1. Built-in defaults
//! 2. `pyproject.toml` sections of local dependencies (deepest first)
//! 3. `pyproject.toml` section of the project being packaged
//! 4. CLI flags

mod defaults;
mod effective;
mod merge;
mod project;

pub use defaults::{BuiltinDefaults, RUNTIME_PROVIDED_PACKAGES};
pub use effective::{ConfigError, ConfigOrigin, ConfigSource, EffectiveConfig, PackagingConfig};
pub use merge::{deep_merge, merge_layers};
pub use project::{discover_projects, ProjectSection, PYPROJECT_FILE};
