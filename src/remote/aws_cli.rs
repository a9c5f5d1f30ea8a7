//! Collaborators backed by the `aws` command line client
//!
//! Every call is one `aws` invocation with `--output json`; credentials and
//! region come from the usual AWS environment unless overridden here.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{debug, info};

use super::{
    FunctionUpdater, LayerRegistry, ObjectStore, ObjectUrl, PublishRequest, PublishedLayer,
    RemoteError,
};
use crate::layer::LayerVersionCandidate;

/// `aws` CLI configuration
#[derive(Debug, Clone)]
pub struct AwsCli {
    program: String,
    region: Option<String>,
    profile: Option<String>,
}

impl Default for AwsCli {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListLayerVersionsResponse {
    #[serde(default)]
    layer_versions: Vec<LayerVersionItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LayerVersionItem {
    version: u64,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    layer_version_arn: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PublishLayerVersionResponse {
    version: u64,
    layer_version_arn: String,
}

impl AwsCli {
    pub fn new() -> Self {
        Self {
            program: "aws".to_string(),
            region: None,
            profile: None,
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    /// Global arguments preceding every subcommand
    fn base_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(ref region) = self.region {
            args.push("--region".to_string());
            args.push(region.clone());
        }
        if let Some(ref profile) = self.profile {
            args.push("--profile".to_string());
            args.push(profile.clone());
        }
        args.push("--output".to_string());
        args.push("json".to_string());
        args
    }

    /// Run one `aws` invocation, returning stdout
    fn run(&self, args: &[String]) -> Result<String, RemoteError> {
        // Service and operation only; argument values stay out of logs
        let command = format!("{} {}", self.program, args[..args.len().min(2)].join(" "));
        debug!(%command, "invoking aws cli");

        let output = Command::new(&self.program)
            .args(self.base_args())
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| RemoteError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(RemoteError::CommandFailed {
                command,
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Candidates from a `list-layer-versions` response, skipping versions whose
/// description holds no content hash
fn parse_layer_versions(stdout: &str) -> Result<Vec<LayerVersionCandidate>, RemoteError> {
    let response: ListLayerVersionsResponse = serde_json::from_str(stdout)?;
    Ok(response
        .layer_versions
        .into_iter()
        .filter_map(|item| {
            LayerVersionCandidate::from_description(
                item.version.to_string(),
                item.description.as_deref().unwrap_or(""),
                item.layer_version_arn,
            )
        })
        .collect())
}

fn parse_published_layer(stdout: &str) -> Result<PublishedLayer, RemoteError> {
    let response: PublishLayerVersionResponse = serde_json::from_str(stdout)?;
    Ok(PublishedLayer {
        version_id: response.version.to_string(),
        layer_version_arn: response.layer_version_arn,
    })
}

impl LayerRegistry for AwsCli {
    fn list_layer_versions(
        &self,
        layer_name: &str,
    ) -> Result<Vec<LayerVersionCandidate>, RemoteError> {
        let stdout = self.run(&[
            "lambda".to_string(),
            "list-layer-versions".to_string(),
            "--layer-name".to_string(),
            layer_name.to_string(),
        ])?;
        let candidates = parse_layer_versions(&stdout)?;
        info!(layer = %layer_name, candidates = candidates.len(), "listed layer versions");
        Ok(candidates)
    }

    fn publish_layer_version(
        &self,
        request: &PublishRequest,
    ) -> Result<PublishedLayer, RemoteError> {
        let content = serde_json::json!({
            "S3Bucket": request.object.bucket,
            "S3Key": request.object.key,
        });
        let stdout = self.run(&[
            "lambda".to_string(),
            "publish-layer-version".to_string(),
            "--layer-name".to_string(),
            request.layer_name.clone(),
            "--description".to_string(),
            request.description.clone(),
            "--content".to_string(),
            content.to_string(),
        ])?;
        let published = parse_published_layer(&stdout)?;
        info!(
            layer = %request.layer_name,
            version = %published.version_id,
            "published layer version"
        );
        Ok(published)
    }
}

impl ObjectStore for AwsCli {
    fn upload_object(
        &self,
        local_path: &Path,
        url: &ObjectUrl,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), RemoteError> {
        info!(local = %local_path.display(), %url, "uploading to S3");
        let mut args = vec![
            "s3".to_string(),
            "cp".to_string(),
            local_path.to_string_lossy().to_string(),
            url.to_string(),
        ];
        if !metadata.is_empty() {
            args.push("--metadata".to_string());
            args.push(serde_json::to_string(metadata)?);
        }
        self.run(&args)?;
        Ok(())
    }
}

impl FunctionUpdater for AwsCli {
    fn update_function_code(
        &self,
        function_name: &str,
        object: &ObjectUrl,
        layer_version_arn: Option<&str>,
    ) -> Result<(), RemoteError> {
        info!(function = %function_name, %object, "updating function code");
        self.run(&[
            "lambda".to_string(),
            "update-function-code".to_string(),
            "--function-name".to_string(),
            function_name.to_string(),
            "--s3-bucket".to_string(),
            object.bucket.clone(),
            "--s3-key".to_string(),
            object.key.clone(),
        ])?;

        let Some(arn) = layer_version_arn else {
            return Ok(());
        };

        // Configuration updates are rejected while the code update is in progress
        self.run(&[
            "lambda".to_string(),
            "wait".to_string(),
            "function-updated".to_string(),
            "--function-name".to_string(),
            function_name.to_string(),
        ])?;
        info!(function = %function_name, layer = %arn, "attaching layer");
        self.run(&[
            "lambda".to_string(),
            "update-function-configuration".to_string(),
            "--function-name".to_string(),
            function_name.to_string(),
            "--layers".to_string(),
            arn.to_string(),
        ])?;
        Ok(())
    }
}
