//! Deterministic artifact construction
//!
//! Walks a staging directory, filters it, and writes a reproducible ZIP:
//! entries sorted by path, a fixed 1980-01-01 timestamp, normalized
//! permissions. The content hash covers the canonical entry stream rather
//! than the ZIP bytes, so the embedded metadata document (which carries the
//! hash and builder provenance) never feeds back into it.

mod filter;

pub use filter::{FilterError, FilterMatch, OmissionRule, PathFilter, EXACT_PATH_REASON};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

use crate::metadata::{Metadata, MetadataError, EMBEDDED_METADATA_PATH};

/// Reason reported for a staged file that collides with the metadata entry
pub const RESERVED_PATH_REASON: &str = "reserved";

/// Suffixes archived but left out of the content hash by default.
/// pip writes the install target path and a build timestamp into `.pyc`.
pub const DEFAULT_HASH_SKIP_SUFFIXES: &[&str] = &[".pyc"];

/// Errors for artifact construction
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Metadata encoding error: {0}")]
    Encoding(#[from] MetadataError),

    #[error("Path is not valid UTF-8: {0}")]
    NonUtf8Path(PathBuf),

    #[error("Path is not within staging directory: {0}")]
    PathNotInStaging(PathBuf),
}

impl ArchiveError {
    fn io(path: &Path, source: io::Error) -> Self {
        ArchiveError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// What an artifact is deployed as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Function,
    Layer,
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactKind::Function => write!(f, "function"),
            ArtifactKind::Layer => write!(f, "layer"),
        }
    }
}

/// A staged file left out of the artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmittedFile {
    pub path: String,
    /// Rule that matched, e.g. `regex:^boto3` or `exact-path`
    pub rule: String,
}

/// A sealed, content-hashed ZIP artifact
#[derive(Debug, Clone, Serialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub source_dir: PathBuf,
    pub output_path: PathBuf,
    /// Archive paths, sorted
    pub included_files: Vec<String>,
    /// Sorted by path
    pub omitted_files: Vec<OmittedFile>,
    pub content_hash_base64: String,
    pub content_hash_hex: String,
    pub size_bytes: u64,
    /// Sealed with `content_hash_base64`
    pub metadata: Metadata,
}

impl Artifact {
    pub fn included_count(&self) -> usize {
        self.included_files.len()
    }

    pub fn omitted_count(&self) -> usize {
        self.omitted_files.len()
    }

    /// Extra fields carried by the companion document
    pub fn companion_extra(&self) -> Map<String, Value> {
        let mut extra = Map::new();
        extra.insert("kind".to_string(), json!(self.kind));
        extra.insert("sha256hex".to_string(), json!(self.content_hash_hex));
        extra.insert("included_count".to_string(), json!(self.included_count()));
        extra.insert("omitted_count".to_string(), json!(self.omitted_count()));
        extra.insert("size_bytes".to_string(), json!(self.size_bytes));
        extra
    }

    /// Canonical JSON companion document
    pub fn companion_document(&self) -> Result<String, MetadataError> {
        self.metadata.companion_document(&self.companion_extra())
    }

    /// Companion fields as object-store user metadata
    pub fn object_metadata(&self) -> Result<BTreeMap<String, String>, MetadataError> {
        self.metadata.object_metadata(&self.companion_extra())
    }

    /// Size-capped description (the layer version description)
    pub fn inline_description(&self, limit_bytes: usize) -> String {
        self.metadata.inline_encode(limit_bytes)
    }

    /// Path of the companion sidecar, `<zip>.metadata.json`
    pub fn companion_path(&self) -> PathBuf {
        append_extension(&self.output_path, "metadata.json")
    }

    /// Write the companion sidecar next to the artifact
    pub fn write_companion(&self) -> Result<PathBuf, ArchiveError> {
        let path = self.companion_path();
        let doc = self.companion_document()?;
        fs::write(&path, doc).map_err(|e| ArchiveError::io(&path, e))?;
        Ok(path)
    }

    /// Delete the local ZIP and its sidecar, if present
    pub fn remove_local(&self) -> Result<(), ArchiveError> {
        for path in [self.output_path.clone(), self.companion_path()] {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "removed local file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(ArchiveError::io(&path, e)),
            }
        }
        Ok(())
    }

    /// Read the embedded metadata document back out of a ZIP
    pub fn read_embedded_metadata(zip_path: &Path) -> Result<Metadata, ArchiveError> {
        let file = File::open(zip_path).map_err(|e| ArchiveError::io(zip_path, e))?;
        let mut archive = ZipArchive::new(file)?;
        let mut entry = archive.by_name(EMBEDDED_METADATA_PATH)?;
        let mut yaml = String::new();
        entry
            .read_to_string(&mut yaml)
            .map_err(|e| ArchiveError::io(zip_path, e))?;
        Ok(Metadata::from_embedded_document(&yaml)?)
    }
}

/// Builds one artifact from a staging directory
#[derive(Debug, Clone)]
pub struct ArtifactBuilder {
    kind: ArtifactKind,
    output_path: PathBuf,
    hash_skip_suffixes: Vec<String>,
}

impl ArtifactBuilder {
    /// Create a builder writing to `output_path`
    pub fn new(kind: ArtifactKind, output_path: PathBuf) -> Self {
        Self {
            kind,
            output_path,
            hash_skip_suffixes: DEFAULT_HASH_SKIP_SUFFIXES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    /// Replace the suffixes that are archived but not hashed
    pub fn with_hash_skip_suffixes<S: AsRef<str>>(mut self, suffixes: &[S]) -> Self {
        self.hash_skip_suffixes = suffixes.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    /// Build and seal the artifact.
    ///
    /// The archive is written to `<output>.partial` and renamed into place
    /// only once complete; on any failure the partial file is removed.
    pub fn build(
        &self,
        staging_dir: &Path,
        filter: &PathFilter,
        metadata: Metadata,
    ) -> Result<Artifact, ArchiveError> {
        info!(
            kind = %self.kind,
            staging = %staging_dir.display(),
            output = %self.output_path.display(),
            "building artifact"
        );

        let (included, omitted) = self.collect_entries(staging_dir, filter)?;
        self.write_entries(staging_dir, included, omitted, metadata)
    }

    /// Write collected entries to `<output>.partial`, then rename into place
    fn write_entries(
        &self,
        staging_dir: &Path,
        included: BTreeMap<String, PathBuf>,
        omitted: Vec<OmittedFile>,
        metadata: Metadata,
    ) -> Result<Artifact, ArchiveError> {
        if let Some(parent) = self.output_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| ArchiveError::io(parent, e))?;
            }
        }

        let partial = append_extension(&self.output_path, "partial");
        let sealed = match self.write_archive(&partial, &included, metadata) {
            Ok(sealed) => sealed,
            Err(e) => {
                let _ = fs::remove_file(&partial);
                return Err(e);
            }
        };
        if let Err(e) = fs::rename(&partial, &self.output_path) {
            let _ = fs::remove_file(&partial);
            return Err(ArchiveError::io(&self.output_path, e));
        }

        let size_bytes = fs::metadata(&self.output_path)
            .map_err(|e| ArchiveError::io(&self.output_path, e))?
            .len();

        let artifact = Artifact {
            kind: self.kind,
            source_dir: staging_dir.to_path_buf(),
            output_path: self.output_path.clone(),
            included_files: included.into_keys().collect(),
            omitted_files: omitted,
            content_hash_base64: sealed.hash_base64,
            content_hash_hex: sealed.hash_hex,
            size_bytes,
            metadata: sealed.metadata,
        };

        info!(
            kind = %artifact.kind,
            included = artifact.included_count(),
            omitted = artifact.omitted_count(),
            bytes = artifact.size_bytes,
            sha256b64 = %artifact.content_hash_base64,
            "created ZIP"
        );

        Ok(artifact)
    }

    /// Partition staged files into included (sorted by archive path) and
    /// omitted
    fn collect_entries(
        &self,
        staging_dir: &Path,
        filter: &PathFilter,
    ) -> Result<(BTreeMap<String, PathBuf>, Vec<OmittedFile>), ArchiveError> {
        let root_meta = fs::metadata(staging_dir).map_err(|e| ArchiveError::io(staging_dir, e))?;
        if !root_meta.is_dir() {
            return Err(ArchiveError::io(
                staging_dir,
                io::Error::new(io::ErrorKind::InvalidInput, "staging path is not a directory"),
            ));
        }

        let mut included = BTreeMap::new();
        let mut omitted = Vec::new();

        for entry in WalkDir::new(staging_dir)
            .follow_links(true)
            .sort_by(|a, b| a.file_name().cmp(b.file_name()))
        {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let rel_path = path
                .strip_prefix(staging_dir)
                .map_err(|_| ArchiveError::PathNotInStaging(path.to_path_buf()))?;
            let archive_path = archive_path(rel_path)?;

            let reason = if archive_path == EMBEDDED_METADATA_PATH {
                Some(RESERVED_PATH_REASON.to_string())
            } else {
                filter.omission_reason(&archive_path)
            };

            match reason {
                Some(rule) => {
                    debug!(path = %archive_path, %rule, "omitting");
                    omitted.push(OmittedFile {
                        path: archive_path,
                        rule,
                    });
                }
                None => {
                    included.insert(archive_path, path.to_path_buf());
                }
            }
        }

        omitted.sort_by(|a, b| a.path.cmp(&b.path));
        Ok((included, omitted))
    }

    fn write_archive(
        &self,
        partial: &Path,
        included: &BTreeMap<String, PathBuf>,
        metadata: Metadata,
    ) -> Result<SealedContent, ArchiveError> {
        let file = File::create(partial).map_err(|e| ArchiveError::io(partial, e))?;
        let mut zip = ZipWriter::new(file);
        let mut hasher = Sha256::new();

        for (archive_path, full_path) in included {
            let contents = fs::read(full_path).map_err(|e| ArchiveError::io(full_path, e))?;

            let mode = if is_executable(full_path) { 0o755 } else { 0o644 };
            zip.start_file(archive_path.as_str(), entry_options(mode))?;
            zip.write_all(&contents)
                .map_err(|e| ArchiveError::io(partial, e))?;

            if !self.skips_hash(archive_path) {
                hasher.update(archive_path.as_bytes());
                hasher.update([0u8]);
                hasher.update((contents.len() as u64).to_be_bytes());
                hasher.update(&contents);
            }
        }

        let digest = hasher.finalize();
        let hash_base64 = STANDARD.encode(digest.as_slice());
        let hash_hex = hex::encode(digest.as_slice());

        let metadata = metadata.sealed(hash_base64.clone());
        let document = metadata.embedded_document()?;
        zip.start_file(EMBEDDED_METADATA_PATH, entry_options(0o644))?;
        zip.write_all(document.as_bytes())
            .map_err(|e| ArchiveError::io(partial, e))?;

        let file = zip.finish()?;
        file.sync_all().map_err(|e| ArchiveError::io(partial, e))?;

        Ok(SealedContent {
            hash_base64,
            hash_hex,
            metadata,
        })
    }

    fn skips_hash(&self, archive_path: &str) -> bool {
        self.hash_skip_suffixes
            .iter()
            .any(|suffix| archive_path.ends_with(suffix.as_str()))
    }
}

struct SealedContent {
    hash_base64: String,
    hash_hex: String,
    metadata: Metadata,
}

/// Canonical entry options: fixed timestamp, normalized mode
fn entry_options(mode: u32) -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default())
        .unix_permissions(mode)
}

/// `/`-separated archive path for a staging-relative path
fn archive_path(rel_path: &Path) -> Result<String, ArchiveError> {
    let parts = rel_path
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| ArchiveError::NonUtf8Path(rel_path.to_path_buf()))?;
    Ok(parts.join("/"))
}

fn append_extension(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

/// Set of archive paths shared by two artifacts
pub fn shared_paths<'a>(a: &'a [String], b: &'a [String]) -> BTreeSet<&'a str> {
    let left: BTreeSet<&str> = a.iter().map(String::as_str).collect();
    b.iter()
        .map(String::as_str)
        .filter(|p| left.contains(p))
        .collect()
}

/// Check if a file is executable
fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = fs::metadata(path) {
            return metadata.permissions().mode() & 0o111 != 0;
        }
    }
    let _ = path;
    false
}
