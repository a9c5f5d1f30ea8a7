//! Packaging pipeline
//!
//! A linear state machine:
//! `Init -> BuildFunctionArtifact -> [BuildLayerArtifact] -> [DedupDecision]
//! -> ReadyForUpload -> Done`.
//!
//! Building ends at `ReadyForUpload` with sealed artifacts and, in layer mode,
//! a reuse-or-publish decision. Delivery hands those to the remote
//! collaborators and ends at `Done`. Nothing is retried.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::archive::{
    ArchiveError, Artifact, ArtifactBuilder, ArtifactKind, FilterError, OmissionRule, PathFilter,
};
use crate::config::{ConfigError, EffectiveConfig, PackagingConfig};
use crate::install::{DependencyInstaller, InstallError, InstallRequest};
use crate::layer::{Decision, LayerDeduplicator, LayerVersionCandidate};
use crate::metadata::{BuilderInfo, Metadata, VcsInfo};
use crate::remote::{
    FunctionUpdater, LayerRegistry, ObjectStore, ObjectUrl, PublishRequest, RemoteError,
};

/// Staging subdirectory the function is installed into
const FUNCTION_STAGING_DIR: &str = "function";

/// Staging subdirectory holding the layer tree
const LAYER_STAGING_DIR: &str = "layer";

/// Written to the work directory at the start of every build
pub const EFFECTIVE_CONFIG_FILE: &str = "effective_config.json";

/// Pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("install error: {0}")]
    Install(#[from] InstallError),

    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("cannot list versions of layer {layer_name}: {source}")]
    DedupUnavailable {
        layer_name: String,
        #[source]
        source: RemoteError,
    },

    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("pipeline is at stage {0}, not ready for delivery")]
    NotReady(Stage),
}

impl From<FilterError> for PipelineError {
    fn from(e: FilterError) -> Self {
        PipelineError::Config(ConfigError::InvalidRule(e))
    }
}

impl PipelineError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Config(_) => 2,
            PipelineError::Install(_) => 3,
            PipelineError::Archive(_) => 4,
            PipelineError::DedupUnavailable { .. } => 5,
            PipelineError::Remote(_) => 6,
            PipelineError::Io(_) => 1,
            PipelineError::NotReady(_) => 1,
        }
    }
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Pipeline stages, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    BuildFunctionArtifact,
    BuildLayerArtifact,
    DedupDecision,
    ReadyForUpload,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Init => "init",
            Stage::BuildFunctionArtifact => "build_function_artifact",
            Stage::BuildLayerArtifact => "build_layer_artifact",
            Stage::DedupDecision => "dedup_decision",
            Stage::ReadyForUpload => "ready_for_upload",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

/// Dependency layer settings
#[derive(Debug, Clone)]
pub struct LayerOptions {
    /// Layer name in the registry
    pub name: String,

    /// Output ZIP (default: `<src parent>/<name>_layer.zip`)
    pub zip_path: Option<PathBuf>,

    /// Where new versions are uploaded; a prefix gets `<name>.zip` appended
    pub object_url: Option<ObjectUrl>,
}

impl LayerOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            zip_path: None,
            object_url: None,
        }
    }
}

/// Pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Project being packaged
    pub src_dir: PathBuf,

    /// Staging root; `function/` and `layer/` are (re)created beneath it
    pub work_dir: PathBuf,

    /// Output ZIP (default: `<src parent>/<src name>.zip`)
    pub function_zip: Option<PathBuf>,

    /// Where the function ZIP is uploaded
    pub function_url: Option<ObjectUrl>,

    /// Function whose code is replaced; requires `function_url`
    pub update_function: Option<String>,

    /// Split dependencies into a layer
    pub layer: Option<LayerOptions>,

    /// VCS provenance, when available
    pub vcs: Option<VcsInfo>,

    /// Builder provenance
    pub builder: BuilderInfo,

    /// Publish a new layer version when the registry cannot be listed
    pub assume_publish_when_unavailable: bool,

    /// Keep uploaded ZIPs on disk
    pub keep: bool,
}

impl PipelineConfig {
    pub fn new(src_dir: impl Into<PathBuf>, work_dir: impl Into<PathBuf>, builder: BuilderInfo) -> Self {
        Self {
            src_dir: src_dir.into(),
            work_dir: work_dir.into(),
            function_zip: None,
            function_url: None,
            update_function: None,
            layer: None,
            vcs: None,
            builder,
            assume_publish_when_unavailable: false,
            keep: false,
        }
    }
}

/// The collaborators a pipeline talks to
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub installer: &'a dyn DependencyInstaller,
    pub registry: &'a dyn LayerRegistry,
    pub store: &'a dyn ObjectStore,
    pub updater: &'a dyn FunctionUpdater,
}

impl<'a> Collaborators<'a> {
    /// Use one backend for every role
    pub fn uniform<B>(backend: &'a B) -> Self
    where
        B: DependencyInstaller + LayerRegistry + ObjectStore + FunctionUpdater,
    {
        Self {
            installer: backend,
            registry: backend,
            store: backend,
            updater: backend,
        }
    }
}

/// A built layer and what to do with it
#[derive(Debug, Clone, Serialize)]
pub struct LayerOutcome {
    pub name: String,
    pub artifact: Artifact,
    /// Inline metadata used as the version description
    pub description: String,
    pub decision: Decision,
    /// Published versions considered for reuse
    pub candidates: Vec<LayerVersionCandidate>,
}

/// Result of the build stages
#[derive(Debug, Clone, Serialize)]
pub struct BuildOutcome {
    pub function: Artifact,
    pub layer: Option<LayerOutcome>,
}

/// Layer version the function ends up using
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerVersionRef {
    pub version_id: String,
    pub layer_version_arn: Option<String>,
    pub reused: bool,
}

/// What delivery did
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeliveryReport {
    pub function_object: Option<ObjectUrl>,
    pub layer_object: Option<ObjectUrl>,
    pub layer_version: Option<LayerVersionRef>,
    pub updated_function: Option<String>,
    /// Local files deleted after upload
    pub removed: Vec<PathBuf>,
}

/// Build and delivery results of one run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub outcome: BuildOutcome,
    pub delivery: DeliveryReport,
}

/// Resolved inputs of the build stages
struct BuildPlan {
    src_dir: PathBuf,
    packaging: PackagingConfig,
    function_filter: PathFilter,
    layer_rules: Vec<OmissionRule>,
}

/// Pipeline execution context
pub struct Pipeline<'a> {
    config: PipelineConfig,
    effective: EffectiveConfig,
    collaborators: Collaborators<'a>,
    stage: Stage,
}

impl<'a> Pipeline<'a> {
    /// Create a new pipeline with the given configuration
    pub fn new(
        config: PipelineConfig,
        effective: EffectiveConfig,
        collaborators: Collaborators<'a>,
    ) -> Self {
        Self {
            config,
            effective,
            collaborators,
            stage: Stage::Init,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn effective_config(&self) -> &EffectiveConfig {
        &self.effective
    }

    fn enter(&mut self, next: Stage) {
        info!(from = %self.stage, to = %next, "stage transition");
        self.stage = next;
    }

    /// Build, decide, then deliver
    pub fn run(&mut self) -> PipelineResult<RunReport> {
        let outcome = self.build()?;
        let delivery = self.deliver(&outcome)?;
        Ok(RunReport { outcome, delivery })
    }

    /// Run the stages up to `ReadyForUpload`
    pub fn build(&mut self) -> PipelineResult<BuildOutcome> {
        self.stage = Stage::Init;
        info!(stage = %self.stage, src = %self.config.src_dir.display(), "starting");
        let plan = self.init()?;

        self.enter(Stage::BuildFunctionArtifact);
        let function = self.build_function(&plan)?;

        let layer = match self.config.layer.clone() {
            Some(options) => {
                self.enter(Stage::BuildLayerArtifact);
                let artifact = self.build_layer(&plan, &options, &function)?;

                self.enter(Stage::DedupDecision);
                let (decision, candidates) = self.decide(&options, &artifact)?;
                let description = artifact.inline_description(plan.packaging.inline_limit);
                Some(LayerOutcome {
                    name: options.name,
                    artifact,
                    description,
                    decision,
                    candidates,
                })
            }
            None => None,
        };

        self.enter(Stage::ReadyForUpload);
        Ok(BuildOutcome { function, layer })
    }

    /// Validate, compile rules and populate the staging directories
    fn init(&mut self) -> PipelineResult<BuildPlan> {
        if self.config.update_function.is_some() && self.config.function_url.is_none() {
            return Err(ConfigError::ValidationError(
                "updating a function requires a function object URL".to_string(),
            )
            .into());
        }
        if let Some(layer) = &self.config.layer {
            if layer.name.trim().is_empty() {
                return Err(
                    ConfigError::ValidationError("layer name must not be empty".to_string()).into(),
                );
            }
            // The function ZIP holds no dependencies in layer mode
            if self.config.update_function.is_some() && layer.object_url.is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "updating a function with layer {} requires a layer object URL",
                    layer.name
                ))
                .into());
            }
        }

        let src_dir = fs::canonicalize(&self.config.src_dir).map_err(|e| {
            ConfigError::ValidationError(format!(
                "source directory {}: {}",
                self.config.src_dir.display(),
                e
            ))
        })?;
        if !src_dir.is_dir() {
            return Err(ConfigError::ValidationError(format!(
                "source path {} is not a directory",
                src_dir.display()
            ))
            .into());
        }

        let packaging = self.effective.packaging()?;
        let function_filter = PathFilter::new()
            .with_projects(&packaging.runtime_provided)?
            .with_patterns(&packaging.zip_omit)?;
        let mut layer_rules = packaging
            .layer_omit_projects
            .iter()
            .map(|p| OmissionRule::project(p))
            .collect::<Result<Vec<_>, _>>()?;
        for pattern in packaging.layer_omit_paths.iter().filter(|p| !p.is_empty()) {
            layer_rules.push(OmissionRule::pattern(pattern)?);
        }
        debug!(
            function_rules = function_filter.rules().len(),
            layer_rules = layer_rules.len(),
            "compiled omission rules"
        );

        let plan = BuildPlan {
            src_dir,
            packaging,
            function_filter,
            layer_rules,
        };

        fs::create_dir_all(&self.config.work_dir)?;
        let config_path = self.config.work_dir.join(EFFECTIVE_CONFIG_FILE);
        self.effective.write_to_file(&config_path)?;
        debug!(path = %config_path.display(), "wrote effective configuration");

        for request in self.install_requests(&plan)? {
            self.collaborators.installer.install(&request)?;
        }
        Ok(plan)
    }

    fn function_staging(&self) -> PathBuf {
        self.config.work_dir.join(FUNCTION_STAGING_DIR)
    }

    fn layer_staging(&self) -> PathBuf {
        self.config.work_dir.join(LAYER_STAGING_DIR)
    }

    /// Installs for this run, in order.
    ///
    /// In layer mode the function gets the project alone and the layer gets
    /// the project with every dependency; the layer filter later drops what
    /// the function already holds. Local dependencies precede their
    /// dependents.
    fn install_requests(&self, plan: &BuildPlan) -> PipelineResult<Vec<InstallRequest>> {
        let function_dir = fresh_dir(&self.function_staging())?;
        let with_dependencies = |target: &Path| -> Vec<InstallRequest> {
            plan.packaging
                .local_dependency
                .iter()
                .chain(std::iter::once(&plan.src_dir))
                .map(|package| InstallRequest {
                    target_dir: target.to_path_buf(),
                    packages: vec![package.clone()],
                    install_dependencies: true,
                })
                .collect()
        };

        if self.config.layer.is_none() {
            return Ok(with_dependencies(&function_dir));
        }

        let mut requests = vec![InstallRequest {
            target_dir: function_dir,
            packages: vec![plan.src_dir.clone()],
            install_dependencies: false,
        }];
        let layer_dir = fresh_dir(&self.layer_staging())?;
        requests.extend(with_dependencies(&layer_dir.join(&plan.packaging.layer_root)));
        Ok(requests)
    }

    fn metadata(&self) -> Metadata {
        Metadata::build_from(self.config.vcs.clone(), self.config.builder.clone())
    }

    fn build_function(&self, plan: &BuildPlan) -> PipelineResult<Artifact> {
        let output = self
            .config
            .function_zip
            .clone()
            .unwrap_or_else(|| default_function_zip(&plan.src_dir));
        let artifact = ArtifactBuilder::new(ArtifactKind::Function, output)
            .with_hash_skip_suffixes(&plan.packaging.hash_skip_suffixes)
            .build(&self.function_staging(), &plan.function_filter, self.metadata())?;
        artifact.write_companion()?;
        Ok(artifact)
    }

    fn build_layer(
        &self,
        plan: &BuildPlan,
        options: &LayerOptions,
        function: &Artifact,
    ) -> PipelineResult<Artifact> {
        let root = plan.packaging.layer_root.as_str();
        let filter = plan
            .function_filter
            .rooted_at(root)
            .with_rules(plan.layer_rules.iter().cloned())
            .excluding_paths(
                function
                    .included_files
                    .iter()
                    .map(|path| format!("{}/{}", root, path)),
            );

        let output = options
            .zip_path
            .clone()
            .unwrap_or_else(|| default_layer_zip(&plan.src_dir, &options.name));
        let artifact = ArtifactBuilder::new(ArtifactKind::Layer, output)
            .with_hash_skip_suffixes(&plan.packaging.hash_skip_suffixes)
            .build(&self.layer_staging(), &filter, self.metadata())?;
        artifact.write_companion()?;
        Ok(artifact)
    }

    /// One registry listing, then an exact hash comparison
    fn decide(
        &self,
        options: &LayerOptions,
        artifact: &Artifact,
    ) -> PipelineResult<(Decision, Vec<LayerVersionCandidate>)> {
        match self.collaborators.registry.list_layer_versions(&options.name) {
            Ok(candidates) => {
                let decision =
                    LayerDeduplicator::new().decide(&artifact.content_hash_base64, &candidates);
                Ok((decision, candidates))
            }
            Err(e) if self.config.assume_publish_when_unavailable => {
                warn!(
                    layer = %options.name,
                    error = %e,
                    "layer versions unavailable; assuming a new version is needed"
                );
                Ok((Decision::PublishNew, Vec::new()))
            }
            Err(source) => Err(PipelineError::DedupUnavailable {
                layer_name: options.name.clone(),
                source,
            }),
        }
    }

    /// Upload, publish and update as configured, then tidy up
    pub fn deliver(&mut self, outcome: &BuildOutcome) -> PipelineResult<DeliveryReport> {
        if self.stage != Stage::ReadyForUpload {
            return Err(PipelineError::NotReady(self.stage));
        }
        let mut report = DeliveryReport::default();
        let mut uploaded: Vec<&Artifact> = Vec::new();

        if let Some(layer) = &outcome.layer {
            let object_url = self
                .config
                .layer
                .as_ref()
                .and_then(|options| options.object_url.as_ref());
            match &layer.decision {
                Decision::ReuseVersion(version_id) => {
                    let arn = layer
                        .candidates
                        .iter()
                        .find(|c| &c.version_id == version_id)
                        .and_then(|c| c.layer_version_arn.clone());
                    info!(layer = %layer.name, version = %version_id, "reusing layer version");
                    report.layer_version = Some(LayerVersionRef {
                        version_id: version_id.clone(),
                        layer_version_arn: arn,
                        reused: true,
                    });
                }
                Decision::PublishNew => match object_url {
                    Some(url) => {
                        let url = url.for_artifact(&layer.name);
                        let metadata = layer
                            .artifact
                            .object_metadata()
                            .map_err(ArchiveError::from)?;
                        self.collaborators.store.upload_object(
                            &layer.artifact.output_path,
                            &url,
                            &metadata,
                        )?;
                        uploaded.push(&layer.artifact);

                        let published =
                            self.collaborators
                                .registry
                                .publish_layer_version(&PublishRequest {
                                    layer_name: layer.name.clone(),
                                    object: url.clone(),
                                    description: layer.description.clone(),
                                })?;
                        report.layer_object = Some(url);
                        report.layer_version = Some(LayerVersionRef {
                            version_id: published.version_id,
                            layer_version_arn: Some(published.layer_version_arn),
                            reused: false,
                        });
                    }
                    None if self.config.update_function.is_some() => {
                        return Err(RemoteError::MissingLayerArn(layer.name.clone()).into());
                    }
                    None => {
                        warn!(layer = %layer.name, "no layer object URL; new layer version not published");
                    }
                },
            }
        }

        if let Some(url) = &self.config.function_url {
            let url = url.for_artifact(&artifact_name(&outcome.function.output_path));
            let metadata = outcome
                .function
                .object_metadata()
                .map_err(ArchiveError::from)?;
            self.collaborators
                .store
                .upload_object(&outcome.function.output_path, &url, &metadata)?;
            uploaded.push(&outcome.function);
            report.function_object = Some(url);
        }

        if let Some(function_name) = &self.config.update_function {
            let object = report.function_object.as_ref().ok_or_else(|| {
                ConfigError::ValidationError(
                    "updating a function requires a function object URL".to_string(),
                )
            })?;
            let layer_arn = match (&outcome.layer, &report.layer_version) {
                (Some(layer), Some(version)) => Some(
                    version.layer_version_arn.clone().ok_or_else(|| {
                        RemoteError::MissingLayerArn(format!(
                            "{} version {}",
                            layer.name, version.version_id
                        ))
                    })?,
                ),
                (Some(layer), None) => {
                    return Err(RemoteError::MissingLayerArn(layer.name.clone()).into())
                }
                (None, _) => None,
            };
            self.collaborators.updater.update_function_code(
                function_name,
                object,
                layer_arn.as_deref(),
            )?;
            report.updated_function = Some(function_name.clone());
        }

        if !self.config.keep {
            for artifact in uploaded {
                artifact.remove_local()?;
                report.removed.push(artifact.output_path.clone());
            }
        }

        self.enter(Stage::Done);
        Ok(report)
    }
}

/// Empty directory at `path`, created or cleared
fn fresh_dir(path: &Path) -> io::Result<PathBuf> {
    if path.exists() {
        debug!(path = %path.display(), "clearing staging directory");
        fs::remove_dir_all(path)?;
    }
    fs::create_dir_all(path)?;
    Ok(path.to_path_buf())
}

fn project_name(src_dir: &Path) -> String {
    src_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "function".to_string())
}

fn sibling(src_dir: &Path, file_name: String) -> PathBuf {
    match src_dir.parent() {
        Some(parent) => parent.join(file_name),
        None => PathBuf::from(file_name),
    }
}

/// `<src parent>/<src name>.zip`
pub fn default_function_zip(src_dir: &Path) -> PathBuf {
    sibling(src_dir, format!("{}.zip", project_name(src_dir)))
}

/// `<src parent>/<layer name>_layer.zip`
pub fn default_layer_zip(src_dir: &Path, layer_name: &str) -> PathBuf {
    sibling(src_dir, format!("{}_layer.zip", layer_name))
}

/// Object name for a ZIP: its file stem
fn artifact_name(zip_path: &Path) -> String {
    zip_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "function".to_string())
}
