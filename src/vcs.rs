//! Version-control provenance via the `git` CLI

use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::{debug, warn};

use crate::metadata::VcsInfo;

/// Reads branch, commit and working-tree state of the repository
/// containing a directory
#[derive(Debug, Clone)]
pub struct GitProbe {
    dir: PathBuf,
}

impl GitProbe {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Probe the repository. `None` when `dir` is not inside a git work tree
    /// with at least one commit, or git is not installed.
    pub fn probe(&self) -> Option<VcsInfo> {
        let Some(commit) = self.git(&["rev-parse", "HEAD"]) else {
            warn!(dir = %self.dir.display(), "cannot read git metadata");
            return None;
        };

        // Detached HEAD has no branch
        let branch = self.git(&["symbolic-ref", "--short", "-q", "HEAD"]);
        let describe = self.git(&["describe", "--always", "--dirty"]);
        let status = self
            .git(&["status", "--porcelain", "--untracked-files=all"])
            .unwrap_or_default();
        let (dirty, untracked) = parse_porcelain_status(&status);

        let info = VcsInfo {
            branch,
            commit: Some(commit),
            describe,
            dirty,
            untracked,
        };
        debug!(?info, "git metadata");
        Some(info)
    }

    /// Trimmed stdout of a successful, non-empty git command
    fn git(&self, args: &[&str]) -> Option<String> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.dir)
            .args(args)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if stdout.is_empty() {
            None
        } else {
            Some(stdout)
        }
    }
}

/// Dirty flag and untracked-file count from `git status --porcelain`.
///
/// Untracked files alone do not make the tree dirty.
fn parse_porcelain_status(status: &str) -> (bool, u64) {
    let mut dirty = false;
    let mut untracked = 0;
    for line in status.lines().filter(|l| !l.is_empty()) {
        if line.starts_with("??") {
            untracked += 1;
        } else {
            dirty = true;
        }
    }
    (dirty, untracked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_clean_status() {
        assert_eq!(parse_porcelain_status(""), (false, 0));
    }

    #[test]
    fn test_parse_untracked_only() {
        let status = "?? notes.txt\n?? scratch/a.py\n";
        assert_eq!(parse_porcelain_status(status), (false, 2));
    }

    #[test]
    fn test_parse_modified_and_untracked() {
        let status = " M src/app.py\nA  src/new.py\n?? notes.txt\n";
        assert_eq!(parse_porcelain_status(status), (true, 1));
    }

    #[test]
    fn test_probe_outside_repository() {
        let temp = TempDir::new().unwrap();
        // The temp dir may still sit inside some repository on odd hosts;
        // either way the probe must not panic.
        if let Some(info) = GitProbe::new(temp.path()).probe() {
            assert!(info.commit.is_some());
        }
    }
}
