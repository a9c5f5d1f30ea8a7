//! lambda-zip - reproducible AWS Lambda packaging
//!
//! Builds deployable ZIP artifacts for Python Lambda functions, optionally
//! splitting dependencies into a separately versioned layer, and skips
//! publishing a layer version when an equivalent one already exists.

pub mod archive;
pub mod config;
pub mod install;
pub mod layer;
pub mod metadata;
pub mod pipeline;
pub mod remote;
pub mod vcs;

pub use archive::{Artifact, ArtifactBuilder, ArtifactKind, OmissionRule, PathFilter};
pub use config::{EffectiveConfig, PackagingConfig};
pub use layer::{Decision, LayerDeduplicator, LayerVersionCandidate};
pub use metadata::{BuilderInfo, Metadata, VcsInfo};
pub use pipeline::{
    BuildOutcome, Collaborators, LayerOptions, Pipeline, PipelineConfig, PipelineError, Stage,
};
