//! In-process mock collaborators
//!
//! `MockBackend` stands in for pip, S3 and Lambda at once. It records every
//! call, keeps published layer versions in memory, and supports per-operation
//! failure injection for error paths.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{
    DependencyInstaller, FunctionUpdater, InstallError, InstallRequest, LayerRegistry,
    ObjectStore, ObjectUrl, PublishRequest, PublishedLayer, RemoteError,
};
use crate::layer::LayerVersionCandidate;

/// Operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MockOperation {
    Install,
    ListLayerVersions,
    PublishLayerVersion,
    UploadObject,
    UpdateFunctionCode,
}

/// One recorded collaborator call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCall {
    Install(InstallRequest),
    ListLayerVersions {
        layer_name: String,
    },
    PublishLayerVersion(PublishRequest),
    UploadObject {
        local_path: PathBuf,
        url: ObjectUrl,
        metadata: BTreeMap<String, String>,
    },
    UpdateFunctionCode {
        function_name: String,
        object: ObjectUrl,
        layer_version_arn: Option<String>,
    },
}

/// Files a fake project installs
#[derive(Debug, Clone, Default)]
struct FakeProject {
    /// Always installed
    own: Vec<(String, Vec<u8>)>,
    /// Installed only when dependencies are requested
    requirements: Vec<(String, Vec<u8>)>,
}

/// A published version held by the mock registry
#[derive(Debug, Clone)]
struct StoredVersion {
    version: u64,
    description: String,
    arn: String,
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<RecordedCall>,
    failures: BTreeSet<MockOperation>,
    layers: BTreeMap<String, Vec<StoredVersion>>,
    objects: BTreeMap<String, Vec<u8>>,
}

/// Mock pip/S3/Lambda backend
#[derive(Debug, Default)]
pub struct MockBackend {
    projects: BTreeMap<PathBuf, FakeProject>,
    state: Mutex<MockState>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Files `pip install <dir>` writes for the project itself
    pub fn with_project(mut self, dir: &Path, files: &[(&str, &str)]) -> Self {
        self.projects.entry(dir.to_path_buf()).or_default().own = owned(files);
        self
    }

    /// Files `pip install <dir>` additionally writes unless `--no-deps`
    pub fn with_requirements(mut self, dir: &Path, files: &[(&str, &str)]) -> Self {
        self.projects
            .entry(dir.to_path_buf())
            .or_default()
            .requirements = owned(files);
        self
    }

    /// Seed an already-published layer version
    pub fn with_layer_version(
        self,
        layer_name: &str,
        version: u64,
        description: impl Into<String>,
    ) -> Self {
        if let Ok(mut state) = self.state.lock() {
            let arn = layer_version_arn(layer_name, version);
            state
                .layers
                .entry(layer_name.to_string())
                .or_default()
                .push(StoredVersion {
                    version,
                    description: description.into(),
                    arn,
                });
        }
        self
    }

    /// Make every call of `operation` fail
    pub fn fail(&self, operation: MockOperation) {
        if let Ok(mut state) = self.state.lock() {
            state.failures.insert(operation);
        }
    }

    /// Calls made so far, in order
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state
            .lock()
            .map(|s| s.calls.clone())
            .unwrap_or_default()
    }

    /// Number of recorded calls matching `predicate`
    pub fn count(&self, predicate: impl Fn(&RecordedCall) -> bool) -> usize {
        self.calls().iter().filter(|c| predicate(c)).count()
    }

    /// Uploaded bytes by URL
    pub fn object(&self, url: &ObjectUrl) -> Option<Vec<u8>> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.objects.get(&url.to_string()).cloned())
    }

    /// Published version numbers of a layer
    pub fn layer_versions(&self, layer_name: &str) -> Vec<u64> {
        self.state
            .lock()
            .ok()
            .and_then(|s| {
                s.layers
                    .get(layer_name)
                    .map(|v| v.iter().map(|sv| sv.version).collect())
            })
            .unwrap_or_default()
    }

    /// Record a call and apply failure injection
    fn record(&self, operation: MockOperation, call: RecordedCall) -> Result<(), String> {
        let mut state = self.state.lock().map_err(|e| e.to_string())?;
        state.calls.push(call);
        if state.failures.contains(&operation) {
            return Err(format!("{:?}", operation));
        }
        Ok(())
    }
}

fn owned(files: &[(&str, &str)]) -> Vec<(String, Vec<u8>)> {
    files
        .iter()
        .map(|(path, contents)| (path.to_string(), contents.as_bytes().to_vec()))
        .collect()
}

fn layer_version_arn(layer_name: &str, version: u64) -> String {
    format!(
        "arn:aws:lambda:us-east-1:000000000000:layer:{}:{}",
        layer_name, version
    )
}

fn write_files(target: &Path, files: &[(String, Vec<u8>)]) -> Result<(), InstallError> {
    for (relative, contents) in files {
        let path = target.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| InstallError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(&path, contents).map_err(|source| InstallError::Io { path, source })?;
    }
    Ok(())
}

impl DependencyInstaller for MockBackend {
    fn install(&self, request: &InstallRequest) -> Result<(), InstallError> {
        self.record(MockOperation::Install, RecordedCall::Install(request.clone()))
            .map_err(|operation| InstallError::Failed {
                command: "pip install".to_string(),
                status: Some(1),
                stderr: format!("injected failure: {}", operation),
            })?;

        fs::create_dir_all(&request.target_dir).map_err(|source| InstallError::Io {
            path: request.target_dir.clone(),
            source,
        })?;
        for package in &request.packages {
            let Some(project) = self.projects.get(package) else {
                continue;
            };
            write_files(&request.target_dir, &project.own)?;
            if request.install_dependencies {
                write_files(&request.target_dir, &project.requirements)?;
            }
        }
        Ok(())
    }
}

impl LayerRegistry for MockBackend {
    fn list_layer_versions(
        &self,
        layer_name: &str,
    ) -> Result<Vec<LayerVersionCandidate>, RemoteError> {
        self.record(
            MockOperation::ListLayerVersions,
            RecordedCall::ListLayerVersions {
                layer_name: layer_name.to_string(),
            },
        )
        .map_err(RemoteError::Injected)?;

        let state = self
            .state
            .lock()
            .map_err(|e| RemoteError::Response(e.to_string()))?;
        let Some(versions) = state.layers.get(layer_name) else {
            return Ok(Vec::new());
        };
        // Newest first, like the Lambda API
        Ok(versions
            .iter()
            .rev()
            .filter_map(|v| {
                LayerVersionCandidate::from_description(
                    v.version.to_string(),
                    &v.description,
                    Some(v.arn.clone()),
                )
            })
            .collect())
    }

    fn publish_layer_version(
        &self,
        request: &PublishRequest,
    ) -> Result<PublishedLayer, RemoteError> {
        self.record(
            MockOperation::PublishLayerVersion,
            RecordedCall::PublishLayerVersion(request.clone()),
        )
        .map_err(RemoteError::Injected)?;

        let mut state = self
            .state
            .lock()
            .map_err(|e| RemoteError::Response(e.to_string()))?;
        if !state.objects.contains_key(&request.object.to_string()) {
            return Err(RemoteError::Response(format!(
                "no such object: {}",
                request.object
            )));
        }
        let versions = state.layers.entry(request.layer_name.clone()).or_default();
        let version = versions.iter().map(|v| v.version).max().unwrap_or(0) + 1;
        let arn = layer_version_arn(&request.layer_name, version);
        versions.push(StoredVersion {
            version,
            description: request.description.clone(),
            arn: arn.clone(),
        });

        Ok(PublishedLayer {
            version_id: version.to_string(),
            layer_version_arn: arn,
        })
    }
}

impl ObjectStore for MockBackend {
    fn upload_object(
        &self,
        local_path: &Path,
        url: &ObjectUrl,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), RemoteError> {
        self.record(
            MockOperation::UploadObject,
            RecordedCall::UploadObject {
                local_path: local_path.to_path_buf(),
                url: url.clone(),
                metadata: metadata.clone(),
            },
        )
        .map_err(RemoteError::Injected)?;

        let bytes = fs::read(local_path).map_err(|e| {
            RemoteError::Response(format!("cannot read {}: {}", local_path.display(), e))
        })?;
        let mut state = self
            .state
            .lock()
            .map_err(|e| RemoteError::Response(e.to_string()))?;
        state.objects.insert(url.to_string(), bytes);
        Ok(())
    }
}

impl FunctionUpdater for MockBackend {
    fn update_function_code(
        &self,
        function_name: &str,
        object: &ObjectUrl,
        layer_version_arn: Option<&str>,
    ) -> Result<(), RemoteError> {
        self.record(
            MockOperation::UpdateFunctionCode,
            RecordedCall::UpdateFunctionCode {
                function_name: function_name.to_string(),
                object: object.clone(),
                layer_version_arn: layer_version_arn.map(str::to_string),
            },
        )
        .map_err(RemoteError::Injected)
    }
}
