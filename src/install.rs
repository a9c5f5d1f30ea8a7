//! Dependency installation into staging directories
//!
//! Resolving a project's dependency graph is pip's job; this module only
//! invokes it. [`PipInstaller`] shells out to `pip install --target`.

use regex_lite::Regex;
use std::cmp::Ordering;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::{debug, info};

/// One `pip install` invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRequest {
    /// Directory packages are installed into (created when missing)
    pub target_dir: PathBuf,

    /// Local project directories to install
    pub packages: Vec<PathBuf>,

    /// When false, only the listed projects are installed (`--no-deps`)
    pub install_dependencies: bool,
}

/// Installs projects into a staging directory
pub trait DependencyInstaller {
    fn install(&self, request: &InstallRequest) -> Result<(), InstallError>;
}

/// Installation errors
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("Failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("{command} exited with status {status:?}: {stderr}")]
    Failed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("Unable to read pip version from output: {0}")]
    UnrecognizedVersion(String),

    #[error("pip {found} is too old; {required} or newer is required for layer builds")]
    PipTooOld { found: String, required: String },

    #[error("Cannot create staging directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Installer backed by the `pip` command
#[derive(Debug, Clone)]
pub struct PipInstaller {
    program: String,
}

impl Default for PipInstaller {
    fn default() -> Self {
        Self::new()
    }
}

impl PipInstaller {
    pub fn new() -> Self {
        Self {
            program: "pip".to_string(),
        }
    }

    /// Use a different pip executable, e.g. `pip3`
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Arguments for one install request
    pub fn install_args(request: &InstallRequest) -> Vec<String> {
        let mut args = vec!["install".to_string()];
        if !request.install_dependencies {
            args.push("--no-deps".to_string());
        }
        args.push("--target".to_string());
        args.push(request.target_dir.to_string_lossy().to_string());
        args.extend(
            request
                .packages
                .iter()
                .map(|p| p.to_string_lossy().to_string()),
        );
        args
    }

    /// Installed pip version, e.g. "24.0"
    pub fn version(&self) -> Result<String, InstallError> {
        let stdout = self.run(&["--version".to_string()])?;
        let version = parse_pip_version(&stdout)
            .ok_or_else(|| InstallError::UnrecognizedVersion(stdout.trim().to_string()))?;
        debug!(%version, "detected pip version");
        Ok(version)
    }

    /// Fail unless the installed pip is at least `minimum`
    pub fn require_version(&self, minimum: &str) -> Result<String, InstallError> {
        let found = self.version()?;
        if compare_versions(&found, minimum) == Ordering::Less {
            return Err(InstallError::PipTooOld {
                found,
                required: minimum.to_string(),
            });
        }
        Ok(found)
    }

    fn run(&self, args: &[String]) -> Result<String, InstallError> {
        let command = format!("{} {}", self.program, args.join(" "));
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| InstallError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(InstallError::Failed {
                command,
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl DependencyInstaller for PipInstaller {
    fn install(&self, request: &InstallRequest) -> Result<(), InstallError> {
        fs::create_dir_all(&request.target_dir).map_err(|source| InstallError::Io {
            path: request.target_dir.clone(),
            source,
        })?;

        let args = Self::install_args(request);
        info!(
            program = %self.program,
            target = %request.target_dir.display(),
            packages = request.packages.len(),
            no_deps = !request.install_dependencies,
            "invoking pip install"
        );
        self.run(&args)?;
        Ok(())
    }
}

/// Extract the version from `pip --version` output
/// ("pip 24.0 from /usr/lib/python3/site-packages/pip (python 3.12)").
pub fn parse_pip_version(output: &str) -> Option<String> {
    let re = Regex::new(r"^pip (\S+) from").ok()?;
    re.captures(output.trim_start())
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Compare dotted versions numerically ("22.10" > "22.2").
///
/// Missing components count as zero and each component contributes its
/// leading digits only, so "23.1b1" compares as "23.1".
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|part| {
                let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
                digits.parse::<u64>().unwrap_or(0)
            })
            .collect()
    };

    let a_parts = parse(a);
    let b_parts = parse(b);
    let len = a_parts.len().max(b_parts.len());

    for i in 0..len {
        let ap = a_parts.get(i).copied().unwrap_or(0);
        let bp = b_parts.get(i).copied().unwrap_or(0);
        match ap.cmp(&bp) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}
