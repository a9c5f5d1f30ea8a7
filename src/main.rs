//! lambda-zip CLI
//!
//! Entry point for the `lambda-zip` command-line tool.

use clap::Parser;
use lambda_zip::config::ConfigError;
use lambda_zip::install::PipInstaller;
use lambda_zip::pipeline::{DeliveryReport, RunReport};
use lambda_zip::remote::aws_cli::AwsCli;
use lambda_zip::remote::ObjectUrl;
use lambda_zip::vcs::GitProbe;
use lambda_zip::{
    BuildOutcome, BuilderInfo, Collaborators, EffectiveConfig, LayerOptions, Pipeline,
    PipelineConfig, PipelineError,
};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lambda-zip")]
#[command(about = "Zip a Python project for AWS Lambda, optionally with a dependency layer", version)]
struct Cli {
    /// Directory containing the project's pyproject.toml
    #[arg(long, default_value = ".")]
    src_dir: PathBuf,

    /// Staging directory (default: a temporary directory)
    #[arg(long)]
    tmp_dir: Option<PathBuf>,

    /// Output ZIP (default: <src parent>/<src name>.zip)
    #[arg(long)]
    zip: Option<PathBuf>,

    /// Regex omitting matching paths, e.g. --omit '^tests/' (repeatable)
    #[arg(long)]
    omit: Vec<String>,

    /// Include git metadata (default)
    #[arg(long, overrides_with = "no_git")]
    git: bool,

    /// Leave git metadata out
    #[arg(long = "no-git", overrides_with = "git")]
    no_git: bool,

    /// Keep the staging directory and uploaded ZIPs
    #[arg(long)]
    keep: bool,

    /// Put dependencies into a layer with this name
    #[arg(long)]
    layer_name: Option<String>,

    /// Upload new layer versions here, e.g. s3://bucket/layers/ or s3://bucket/deps.zip
    #[arg(long, requires = "layer_name")]
    layer_s3_url: Option<String>,

    /// Layer output ZIP (default: <src parent>/<layer name>_layer.zip)
    #[arg(long, requires = "layer_name")]
    layer_zip: Option<PathBuf>,

    /// Upload the function ZIP here
    #[arg(long)]
    upload_s3_url: Option<String>,

    /// Update this Lambda function's code
    #[arg(long, requires = "upload_s3_url")]
    aws_lambda_update: Option<String>,

    /// Publish a new layer version when existing versions cannot be listed
    #[arg(long)]
    assume_publish_when_unavailable: bool,

    /// Log level (RUST_LOG takes precedence)
    #[arg(long, default_value = "info", value_parser = ["trace", "debug", "info", "warn", "error"])]
    log_level: String,

    /// Build and decide, but do not upload, publish or update
    #[arg(long)]
    dry_run: bool,

    /// Print the outcome as JSON
    #[arg(long)]
    json: bool,
}

/// `--json` output when nothing was delivered
#[derive(Serialize)]
struct DryRunReport<'a> {
    outcome: &'a BuildOutcome,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    if let Err(e) = run(cli) {
        error!(error = %e, "lambda-zip failed");
        eprintln!("Error: {}", e);
        process::exit(e.exit_code());
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn parse_url(flag: &str, url: Option<&str>) -> Result<Option<ObjectUrl>, PipelineError> {
    url.map(|u| {
        ObjectUrl::parse(u)
            .map_err(|e| PipelineError::from(ConfigError::ValidationError(format!("--{}: {}", flag, e))))
    })
    .transpose()
}

fn run(cli: Cli) -> Result<(), PipelineError> {
    let src_dir = fs::canonicalize(&cli.src_dir).map_err(|e| {
        ConfigError::ValidationError(format!("--src-dir {}: {}", cli.src_dir.display(), e))
    })?;

    let overrides = if cli.omit.is_empty() {
        None
    } else {
        Some(serde_json::json!({ "zip_omit": cli.omit }))
    };
    let effective = EffectiveConfig::build(&src_dir, overrides)?;

    let pip = PipInstaller::new();
    if cli.layer_name.is_some() {
        let packaging = effective.packaging()?;
        let version = pip.require_version(&packaging.min_pip_version)?;
        info!(%version, "pip supports layer builds");
    }

    let function_url = parse_url("upload-s3-url", cli.upload_s3_url.as_deref())?;
    let layer_url = parse_url("layer-s3-url", cli.layer_s3_url.as_deref())?;

    // Dropped at the end of the run unless kept
    let mut temp_dir = None;
    let work_dir = match cli.tmp_dir {
        Some(dir) => {
            if dir.is_dir() {
                info!(dir = %dir.display(), "using existing staging directory");
            } else {
                fs::create_dir_all(&dir)?;
                info!(dir = %dir.display(), "created staging directory");
            }
            dir
        }
        None => {
            let dir = tempfile::Builder::new().prefix("lambda-zip-").tempdir()?;
            let path = dir.path().to_path_buf();
            info!(dir = %path.display(), "created temporary staging directory");
            if cli.keep {
                let kept = dir.keep();
                info!(dir = %kept.display(), "keeping staging directory");
            } else {
                temp_dir = Some(dir);
            }
            path
        }
    };

    // --git and --no-git override each other; the last one given wins
    let vcs = if cli.git || !cli.no_git {
        GitProbe::new(&src_dir).probe()
    } else {
        None
    };

    let mut config = PipelineConfig::new(&src_dir, &work_dir, BuilderInfo::gather(&src_dir));
    config.function_zip = cli.zip;
    config.function_url = function_url;
    config.update_function = cli.aws_lambda_update;
    config.vcs = vcs;
    config.assume_publish_when_unavailable = cli.assume_publish_when_unavailable;
    config.keep = cli.keep;
    config.layer = cli.layer_name.map(|name| LayerOptions {
        name,
        zip_path: cli.layer_zip,
        object_url: layer_url,
    });

    let aws = AwsCli::new();
    let collaborators = Collaborators {
        installer: &pip,
        registry: &aws,
        store: &aws,
        updater: &aws,
    };
    let mut pipeline = Pipeline::new(config, effective, collaborators);

    let outcome = pipeline.build()?;
    let delivery = if cli.dry_run {
        info!("dry run; skipping delivery");
        None
    } else {
        Some(pipeline.deliver(&outcome)?)
    };

    if cli.json {
        let json = match delivery {
            Some(delivery) => serde_json::to_string_pretty(&RunReport { outcome, delivery }),
            None => serde_json::to_string_pretty(&DryRunReport { outcome: &outcome }),
        }
        .map_err(io::Error::from)?;
        println!("{}", json);
    } else {
        print_summary(&outcome, delivery.as_ref());
    }

    drop(temp_dir);
    Ok(())
}

fn display_path(path: &Path) -> String {
    path.display().to_string()
}

fn print_summary(outcome: &BuildOutcome, delivery: Option<&DeliveryReport>) {
    let function = &outcome.function;
    println!("Function ZIP: {}", display_path(&function.output_path));
    println!(
        "  {} files, {} omitted, sha256b64 {}",
        function.included_count(),
        function.omitted_count(),
        function.content_hash_base64
    );

    if let Some(layer) = &outcome.layer {
        println!("Layer ZIP: {}", display_path(&layer.artifact.output_path));
        println!(
            "  {} files, {} omitted, sha256b64 {}",
            layer.artifact.included_count(),
            layer.artifact.omitted_count(),
            layer.artifact.content_hash_base64
        );
        match &layer.decision {
            lambda_zip::Decision::ReuseVersion(version) => {
                println!("  matches published version {} of {}", version, layer.name)
            }
            lambda_zip::Decision::PublishNew => println!("  new version of {} needed", layer.name),
        }
    }

    let Some(delivery) = delivery else {
        return;
    };
    if let Some(url) = &delivery.layer_object {
        println!("Uploaded layer: {}", url);
    }
    if let Some(version) = &delivery.layer_version {
        let verb = if version.reused { "Using" } else { "Published" };
        println!(
            "{} layer version {}{}",
            verb,
            version.version_id,
            version
                .layer_version_arn
                .as_ref()
                .map(|arn| format!(" ({})", arn))
                .unwrap_or_default()
        );
    }
    if let Some(url) = &delivery.function_object {
        println!("Uploaded function: {}", url);
    }
    if let Some(name) = &delivery.updated_function {
        println!("Updated function: {}", name);
    }
}
