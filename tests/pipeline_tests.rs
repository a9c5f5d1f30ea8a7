//! Pipeline Tests
//!
//! Whole runs against the in-process mock backend: configuration layered
//! across local dependency projects, reuse of layer versions published by
//! other builders, and the error paths that map to exit codes.

use std::fs;
use std::path::{Path, PathBuf};

use lambda_zip::config::{ConfigOrigin, PYPROJECT_FILE};
use lambda_zip::metadata::parse_inline;
use lambda_zip::remote::mock::{MockBackend, MockOperation, RecordedCall};
use lambda_zip::remote::{InstallRequest, ObjectUrl};
use lambda_zip::{
    BuilderInfo, Collaborators, Decision, EffectiveConfig, LayerOptions, Pipeline, PipelineConfig,
    PipelineError, Stage, VcsInfo,
};
use tempfile::TempDir;

// =============================================================================
// Fixtures
// =============================================================================

/// A service project `svc` depending on a local library `lib`
struct Workspace {
    _temp: TempDir,
    root: PathBuf,
    svc: PathBuf,
    lib: PathBuf,
}

fn workspace(svc_config: &str, lib_config: &str) -> Workspace {
    let temp = TempDir::new().unwrap();
    let root = fs::canonicalize(temp.path()).unwrap();
    let svc = root.join("svc");
    let lib = root.join("lib");
    fs::create_dir_all(&svc).unwrap();
    fs::create_dir_all(&lib).unwrap();
    fs::write(svc.join(PYPROJECT_FILE), svc_config).unwrap();
    fs::write(lib.join(PYPROJECT_FILE), lib_config).unwrap();
    Workspace {
        _temp: temp,
        root,
        svc,
        lib,
    }
}

const SVC_CONFIG: &str = r#"
[project]
name = "svc"

[tool.lambda_zip]
local_dependency = ["../lib"]
zip_omit = ["^svc/fixtures/"]
"#;

const LIB_CONFIG: &str = r#"
[project]
name = "lib"

[tool.lambda_zip]
zip_omit = ["^lib/tests/"]
layer_omit_projects = ["pandas"]
"#;

fn backend(ws: &Workspace, pyc: &str) -> MockBackend {
    MockBackend::new()
        .with_project(
            &ws.svc,
            &[
                ("svc/__init__.py", ""),
                ("svc/handler.py", "from lib import util\n"),
                ("svc/fixtures/event.json", "{}"),
                ("svc/__pycache__/handler.cpython-312.pyc", pyc),
            ],
        )
        .with_requirements(&ws.svc, &[("requests/__init__.py", "# requests\n")])
        .with_project(
            &ws.lib,
            &[
                ("lib/__init__.py", ""),
                ("lib/util.py", "def util(): pass\n"),
                ("lib/tests/test_util.py", "def test(): pass\n"),
            ],
        )
        .with_requirements(
            &ws.lib,
            &[
                ("pandas/__init__.py", "# pandas\n"),
                ("botocore/__init__.py", "# provided\n"),
                ("attrs/__init__.py", "# attrs\n"),
            ],
        )
}

fn builder(host: &str) -> BuilderInfo {
    BuilderInfo {
        host: host.to_string(),
        user: "ci".to_string(),
        source_path: "/src/svc".to_string(),
        timestamp: 1_700_000_000,
    }
}

fn pipeline_config(ws: &Workspace, work: &str, host: &str) -> PipelineConfig {
    let mut config = PipelineConfig::new(&ws.svc, ws.root.join(work), builder(host));
    config.function_zip = Some(ws.root.join(work).join("out/svc.zip"));
    config.vcs = Some(VcsInfo {
        branch: Some("main".to_string()),
        commit: Some("0123456789abcdef0123456789abcdef01234567".to_string()),
        describe: Some("v1.4.0".to_string()),
        dirty: false,
        untracked: 0,
    });
    let mut layer = LayerOptions::new("svc-deps");
    layer.zip_path = Some(ws.root.join(work).join("out/svc-deps_layer.zip"));
    layer.object_url = Some(ObjectUrl::parse("s3://artifacts/layers/").unwrap());
    config.layer = Some(layer);
    config
}

fn installs(mock: &MockBackend) -> Vec<InstallRequest> {
    mock.calls()
        .into_iter()
        .filter_map(|c| match c {
            RecordedCall::Install(r) => Some(r),
            _ => None,
        })
        .collect()
}

fn has_prefix(files: &[String], prefix: &str) -> bool {
    files.iter().any(|p| p.starts_with(prefix))
}

fn effective(dir: &Path) -> EffectiveConfig {
    EffectiveConfig::build(dir, None).unwrap()
}

// =============================================================================
// Configuration across projects
// =============================================================================

#[test]
fn test_dependency_configuration_is_merged() {
    let ws = workspace(SVC_CONFIG, LIB_CONFIG);
    let effective = effective(&ws.svc);

    let origins: Vec<_> = effective.sources.iter().map(|s| s.origin.clone()).collect();
    assert_eq!(
        origins,
        vec![
            ConfigOrigin::Builtin,
            ConfigOrigin::Dependency,
            ConfigOrigin::Project
        ]
    );
    assert!(effective.sources[1..].iter().all(|s| s.digest.is_some()));

    let packaging = effective.packaging().unwrap();
    assert_eq!(packaging.local_dependency, vec![ws.lib.clone()]);
    assert_eq!(packaging.zip_omit, vec!["^lib/tests/", "^svc/fixtures/"]);
    assert_eq!(packaging.layer_omit_projects, vec!["pandas"]);

    let path = ws.root.join("effective_config.json");
    effective.write_to_file(&path).unwrap();
    let written: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(written["schema_id"], "lambda-zip/effective_config@1");
}

#[test]
fn test_function_only_build_applies_merged_rules() {
    let ws = workspace(SVC_CONFIG, LIB_CONFIG);
    let mock = backend(&ws, "pyc");
    let mut config = pipeline_config(&ws, "work", "build-01");
    config.layer = None;

    let mut pipeline = Pipeline::new(config, effective(&ws.svc), Collaborators::uniform(&mock));
    let outcome = pipeline.build().unwrap();

    let requests = installs(&mock);
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].packages, vec![ws.lib.clone()]);
    assert_eq!(requests[1].packages, vec![ws.svc.clone()]);
    assert!(requests.iter().all(|r| r.install_dependencies));

    let files = &outcome.function.included_files;
    assert!(files.contains(&"svc/handler.py".to_string()));
    assert!(files.contains(&"lib/util.py".to_string()));
    assert!(has_prefix(files, "pandas/"));
    assert!(!has_prefix(files, "lib/tests/"));
    assert!(!has_prefix(files, "svc/fixtures/"));
    assert!(!has_prefix(files, "botocore/"));
}

#[test]
fn test_layer_build_splits_project_and_dependencies() {
    let ws = workspace(SVC_CONFIG, LIB_CONFIG);
    let mock = backend(&ws, "pyc");
    let mut pipeline = Pipeline::new(
        pipeline_config(&ws, "work", "build-01"),
        effective(&ws.svc),
        Collaborators::uniform(&mock),
    );
    let outcome = pipeline.build().unwrap();
    let layer = outcome.layer.as_ref().unwrap();

    assert_eq!(
        outcome.function.included_files,
        vec![
            "svc/__init__.py",
            "svc/__pycache__/handler.cpython-312.pyc",
            "svc/handler.py"
        ]
    );

    let files = &layer.artifact.included_files;
    assert!(files.iter().all(|p| p.starts_with("python/")));
    assert!(files.contains(&"python/lib/util.py".to_string()));
    assert!(files.contains(&"python/requests/__init__.py".to_string()));
    assert!(files.contains(&"python/attrs/__init__.py".to_string()));
    assert!(!has_prefix(files, "python/svc/"));
    assert!(!has_prefix(files, "python/pandas/"));
    assert!(!has_prefix(files, "python/botocore/"));
    assert!(!has_prefix(files, "python/lib/tests/"));

    assert_eq!(layer.decision, Decision::PublishNew);
    let inline = parse_inline(&layer.description).unwrap();
    assert_eq!(
        inline.sha256b64.as_deref(),
        Some(layer.artifact.content_hash_base64.as_str())
    );
}

// =============================================================================
// Layer reuse across builders
// =============================================================================

#[test]
fn test_layer_published_elsewhere_is_reused() {
    let ws = workspace(SVC_CONFIG, LIB_CONFIG);

    // Another machine built and published this layer as version 4
    let first_mock = backend(&ws, "pyc from build-01");
    let mut first = Pipeline::new(
        pipeline_config(&ws, "work-a", "build-01"),
        effective(&ws.svc),
        Collaborators::uniform(&first_mock),
    );
    let first_outcome = first.build().unwrap();
    let published = first_outcome.layer.as_ref().unwrap();

    let mock = backend(&ws, "pyc from build-02")
        .with_layer_version("svc-deps", 3, "hand-made")
        .with_layer_version("svc-deps", 4, published.description.clone());

    let mut config = pipeline_config(&ws, "work-b", "build-02");
    config.function_url = Some(ObjectUrl::parse("s3://artifacts/functions/").unwrap());
    config.update_function = Some("svc".to_string());
    let mut second = Pipeline::new(config, effective(&ws.svc), Collaborators::uniform(&mock));
    let report = second.run().unwrap();

    let layer = report.outcome.layer.as_ref().unwrap();
    assert_eq!(
        layer.artifact.content_hash_base64,
        published.artifact.content_hash_base64
    );
    assert_eq!(layer.decision, Decision::ReuseVersion("4".to_string()));
    assert_eq!(
        report.outcome.function.content_hash_base64,
        first_outcome.function.content_hash_base64
    );

    let version = report.delivery.layer_version.as_ref().unwrap();
    assert!(version.reused);
    assert_eq!(
        version.layer_version_arn.as_deref(),
        Some("arn:aws:lambda:us-east-1:000000000000:layer:svc-deps:4")
    );
    assert!(report.delivery.layer_object.is_none());
    assert_eq!(
        mock.count(|c| matches!(c, RecordedCall::PublishLayerVersion(_))),
        0
    );
    assert_eq!(mock.layer_versions("svc-deps"), vec![3, 4]);

    let update = mock
        .calls()
        .into_iter()
        .find_map(|c| match c {
            RecordedCall::UpdateFunctionCode {
                function_name,
                object,
                layer_version_arn,
            } => Some((function_name, object, layer_version_arn)),
            _ => None,
        })
        .unwrap();
    assert_eq!(update.0, "svc");
    assert_eq!(update.1.to_string(), "s3://artifacts/functions/svc.zip");
    assert_eq!(update.2, version.layer_version_arn);

    // Uploaded function ZIP is tidied up; the unchanged layer ZIP stays
    assert!(!report.outcome.function.output_path.exists());
    assert!(layer.artifact.output_path.exists());
    assert_eq!(second.stage(), Stage::Done);
}

#[test]
fn test_changed_dependency_publishes_new_version() {
    let ws = workspace(SVC_CONFIG, LIB_CONFIG);
    let mock = backend(&ws, "pyc");
    let mut first = Pipeline::new(
        pipeline_config(&ws, "work", "build-01"),
        effective(&ws.svc),
        Collaborators::uniform(&mock),
    );
    first.run().unwrap();

    // The library gains a module; rebuild with the same registry contents
    let changed = backend(&ws, "pyc")
        .with_project(
            &ws.lib,
            &[
                ("lib/__init__.py", ""),
                ("lib/util.py", "def util(): pass\n"),
                ("lib/extra.py", "X = 1\n"),
            ],
        )
        .with_layer_version("svc-deps", 1, {
            let layer = mock.calls().into_iter().find_map(|c| match c {
                RecordedCall::PublishLayerVersion(request) => Some(request.description),
                _ => None,
            });
            layer.unwrap()
        });

    let mut second = Pipeline::new(
        pipeline_config(&ws, "work", "build-01"),
        effective(&ws.svc),
        Collaborators::uniform(&changed),
    );
    let report = second.run().unwrap();

    let version = report.delivery.layer_version.unwrap();
    assert!(!version.reused);
    assert_eq!(version.version_id, "2");
    assert_eq!(changed.layer_versions("svc-deps"), vec![1, 2]);
}

// =============================================================================
// Failures
// =============================================================================

#[test]
fn test_missing_local_dependency_is_config_error() {
    let ws = workspace(
        "[tool.lambda_zip]\nlocal_dependency = [\"../nowhere\"]\n",
        LIB_CONFIG,
    );
    let err = EffectiveConfig::build(&ws.svc, None).unwrap_err();
    assert_eq!(PipelineError::from(err).exit_code(), 2);
}

#[test]
fn test_upload_failure_is_remote_error() {
    let ws = workspace(SVC_CONFIG, LIB_CONFIG);
    let mock = backend(&ws, "pyc");
    mock.fail(MockOperation::UploadObject);

    let mut pipeline = Pipeline::new(
        pipeline_config(&ws, "work", "build-01"),
        effective(&ws.svc),
        Collaborators::uniform(&mock),
    );
    let outcome = pipeline.build().unwrap();
    let err = pipeline.deliver(&outcome).unwrap_err();

    assert!(matches!(err, PipelineError::Remote(_)));
    assert_eq!(err.exit_code(), 6);
    assert_eq!(pipeline.stage(), Stage::ReadyForUpload);
    // Nothing is removed when delivery fails
    assert!(outcome.function.output_path.exists());
    assert!(outcome.layer.unwrap().artifact.output_path.exists());
}

#[test]
fn test_publish_failure_leaves_function_untouched() {
    let ws = workspace(SVC_CONFIG, LIB_CONFIG);
    let mock = backend(&ws, "pyc");
    mock.fail(MockOperation::PublishLayerVersion);

    let mut config = pipeline_config(&ws, "work", "build-01");
    config.function_url = Some(ObjectUrl::parse("s3://artifacts/functions/").unwrap());
    config.update_function = Some("svc".to_string());
    let mut pipeline = Pipeline::new(config, effective(&ws.svc), Collaborators::uniform(&mock));

    let err = pipeline.run().unwrap_err();
    assert_eq!(err.exit_code(), 6);
    assert_eq!(
        mock.count(|c| matches!(c, RecordedCall::UpdateFunctionCode { .. })),
        0
    );
    assert!(mock.layer_versions("svc-deps").is_empty());
}
