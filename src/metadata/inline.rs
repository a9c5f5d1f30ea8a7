//! Size-capped inline encoding
//!
//! Lambda layer version descriptions hold at most 256 characters. The
//! description carries a compact JSON object so later builds can read the
//! content hash of every published version from a single list call.

use serde::Deserialize;
use serde_json::Value;

use super::Metadata;

/// Default byte cap for the inline encoding
pub const DEFAULT_INLINE_LIMIT: usize = 256;

/// Key appended when trailing fields were dropped
pub const TRUNCATION_MARKER: &str = "truncated";

/// Length of a base64 SHA-256 digest
const HASH_BASE64_LEN: usize = 44;

const BRANCH_MAX_CHARS: usize = 40;
const DESCRIBE_MAX_CHARS: usize = 20;

impl Metadata {
    /// Encode the inline subset of fields in at most `limit_bytes` bytes.
    ///
    /// Fields are emitted in priority order. When the full object does not
    /// fit, whole trailing fields are dropped and `"truncated":true` is
    /// appended, so the result always parses as a JSON object. Returns an
    /// empty string only when `limit_bytes` cannot hold `{}`.
    pub fn inline_encode(&self, limit_bytes: usize) -> String {
        encode_fields(&self.inline_fields(), limit_bytes)
    }

    fn inline_fields(&self) -> Vec<(&'static str, Value)> {
        let mut fields = Vec::new();
        if let Some(hash) = &self.sha256b64 {
            fields.push(("sha256b64", Value::from(hash.as_str())));
        }
        if let Some(commit) = &self.commit {
            fields.push(("commit", Value::from(commit.as_str())));
        }
        fields.push(("dirty", Value::from(self.dirty)));
        fields.push(("untracked", Value::from(self.untracked)));
        if let Some(describe) = &self.describe {
            fields.push(("describe", Value::from(cap_chars(describe, DESCRIBE_MAX_CHARS))));
        }
        if let Some(branch) = &self.branch {
            fields.push(("branch", Value::from(cap_chars(branch, BRANCH_MAX_CHARS))));
        }
        fields.push(("timestamp", Value::from(self.timestamp)));
        fields.push(("host", Value::from(self.host.as_str())));
        fields.push(("user", Value::from(self.user.as_str())));
        fields
    }
}

fn cap_chars(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

fn render(fields: &[(&str, Value)], truncated: bool) -> String {
    let mut out = String::from("{");
    for (i, (key, value)) in fields.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&Value::from(*key).to_string());
        out.push(':');
        out.push_str(&value.to_string());
    }
    if truncated {
        if !fields.is_empty() {
            out.push(',');
        }
        out.push('"');
        out.push_str(TRUNCATION_MARKER);
        out.push_str("\":true");
    }
    out.push('}');
    out
}

fn encode_fields(fields: &[(&str, Value)], limit_bytes: usize) -> String {
    let full = render(fields, false);
    if full.len() <= limit_bytes {
        return full;
    }
    for keep in (0..fields.len()).rev() {
        let candidate = render(&fields[..keep], true);
        if candidate.len() <= limit_bytes {
            return candidate;
        }
    }
    if limit_bytes >= 2 {
        "{}".to_string()
    } else {
        String::new()
    }
}

/// Smallest limit at which a truncated encoding still carries the content
/// hash. Descriptions without it never match a later build.
pub fn min_inline_limit() -> usize {
    let hash = "A".repeat(HASH_BASE64_LEN);
    render(&[("sha256b64", Value::from(hash))], true).len()
}

/// Fields recovered from an inline-encoded description
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct InlineMetadata {
    pub sha256b64: Option<String>,
    pub commit: Option<String>,
    pub dirty: Option<bool>,
    pub untracked: Option<u64>,
    pub describe: Option<String>,
    pub branch: Option<String>,
    pub timestamp: Option<i64>,
    pub host: Option<String>,
    pub user: Option<String>,
    #[serde(default)]
    pub truncated: bool,
}

/// Parse a description written by [`Metadata::inline_encode`].
///
/// Returns `None` for descriptions that are not JSON objects, such as
/// versions published by other tools.
pub fn parse_inline(description: &str) -> Option<InlineMetadata> {
    serde_json::from_str(description.trim()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{BuilderInfo, VcsInfo};
    use proptest::prelude::*;

    const HASH: &str = "47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU=";

    #[test]
    fn test_min_limit_keeps_hash() {
        let limit = min_inline_limit();
        assert_eq!(limit, r#"{"sha256b64":"","truncated":true}"#.len() + HASH.len());

        let metadata = Metadata::build_from(
            None,
            BuilderInfo {
                host: "a-rather-long-build-host.example.internal".to_string(),
                user: "ci".to_string(),
                source_path: "/src".to_string(),
                timestamp: 1_700_000_000,
            },
        )
        .sealed(HASH);

        let encoded = metadata.inline_encode(limit);
        let parsed = parse_inline(&encoded).unwrap();
        assert_eq!(parsed.sha256b64.as_deref(), Some(HASH));
        assert!(parsed.truncated);

        let too_small = parse_inline(&metadata.inline_encode(limit - 1)).unwrap();
        assert!(too_small.sha256b64.is_none());
    }

    fn metadata(branch: &str, host: &str) -> Metadata {
        Metadata::build_from(
            Some(VcsInfo {
                branch: Some(branch.to_string()),
                commit: Some("0123456789abcdef0123456789abcdef01234567".to_string()),
                describe: Some("v1.2.0-3-g0123456-dirty".to_string()),
                dirty: true,
                untracked: 4,
            }),
            BuilderInfo {
                host: host.to_string(),
                user: "ci".to_string(),
                source_path: "/very/long/source/path/that/is/never/inlined".to_string(),
                timestamp: 1_700_000_000,
            },
        )
        .sealed(HASH)
    }

    #[test]
    fn test_short_metadata_fits_unmodified() {
        let encoded = metadata("main", "build-01").inline_encode(DEFAULT_INLINE_LIMIT);

        assert!(encoded.len() <= DEFAULT_INLINE_LIMIT);
        assert!(encoded.starts_with(&format!("{{\"sha256b64\":\"{}\"", HASH)));
        assert!(!encoded.contains(TRUNCATION_MARKER));
        assert!(!encoded.contains("source_path"));

        let parsed = parse_inline(&encoded).unwrap();
        assert_eq!(parsed.sha256b64.as_deref(), Some(HASH));
        assert_eq!(parsed.branch.as_deref(), Some("main"));
        assert_eq!(parsed.host.as_deref(), Some("build-01"));
        assert!(!parsed.truncated);
    }

    #[test]
    fn test_branch_and_describe_are_capped() {
        let long_branch = "feature/".to_string() + &"x".repeat(100);
        let encoded = metadata(&long_branch, "h").inline_encode(1024);
        let parsed = parse_inline(&encoded).unwrap();

        assert_eq!(parsed.branch.unwrap().chars().count(), 40);
        assert_eq!(parsed.describe.unwrap().chars().count(), 20);
    }

    #[test]
    fn test_long_branch_drops_lower_priority_fields() {
        // 40 multi-byte chars survive the cap and push the total past 256 bytes
        let long_branch = "分支".repeat(60);
        let encoded = metadata(&long_branch, "a-rather-long-build-host.internal.example.com")
            .inline_encode(DEFAULT_INLINE_LIMIT);

        assert!(encoded.len() <= DEFAULT_INLINE_LIMIT, "len {}", encoded.len());
        let parsed = parse_inline(&encoded).unwrap();
        assert!(parsed.truncated);
        assert_eq!(parsed.sha256b64.as_deref(), Some(HASH));
        assert!(parsed.commit.is_some());
        assert!(parsed.user.is_none());
        assert!(parsed.host.is_none());
    }

    #[test]
    fn test_fields_are_dropped_whole() {
        let encoded = metadata("main", &"h".repeat(300)).inline_encode(DEFAULT_INLINE_LIMIT);
        let parsed = parse_inline(&encoded).unwrap();

        assert!(parsed.truncated);
        assert!(parsed.host.is_none());
        assert_eq!(parsed.timestamp, Some(1_700_000_000));
        assert_eq!(parsed.branch.as_deref(), Some("main"));
    }

    #[test]
    fn test_tiny_limits() {
        let m = metadata("main", "h");
        assert_eq!(m.inline_encode(0), "");
        assert_eq!(m.inline_encode(1), "");
        assert_eq!(m.inline_encode(2), "{}");
        assert_eq!(m.inline_encode(19), "{\"truncated\":true}");
    }

    #[test]
    fn test_unsealed_metadata_has_no_hash() {
        let m = Metadata::build_from(
            None,
            BuilderInfo {
                host: "h".to_string(),
                user: "u".to_string(),
                source_path: "/s".to_string(),
                timestamp: 1,
            },
        );
        let parsed = parse_inline(&m.inline_encode(DEFAULT_INLINE_LIMIT)).unwrap();
        assert!(parsed.sha256b64.is_none());
        assert_eq!(parsed.dirty, Some(false));
    }

    #[test]
    fn test_parse_inline_rejects_free_text() {
        assert!(parse_inline("layer for my project").is_none());
        assert!(parse_inline("").is_none());
    }

    proptest! {
        #[test]
        fn prop_inline_encoding_respects_limit_and_parses(
            branch in "\\PC{0,80}",
            commit in "\\PC{0,60}",
            describe in "\\PC{0,40}",
            host in "\\PC{0,120}",
            user in "\\PC{0,60}",
            dirty in any::<bool>(),
            untracked in any::<u64>(),
            timestamp in any::<i64>(),
            limit in 0usize..400,
        ) {
            let m = Metadata::build_from(
                Some(VcsInfo {
                    branch: Some(branch),
                    commit: Some(commit),
                    describe: Some(describe),
                    dirty,
                    untracked,
                }),
                BuilderInfo { host, user, source_path: "/src".to_string(), timestamp },
            )
            .sealed(HASH);

            for cap in [limit, DEFAULT_INLINE_LIMIT] {
                let encoded = m.inline_encode(cap);
                prop_assert!(encoded.len() <= cap);
                if !encoded.is_empty() {
                    let value: Value = serde_json::from_str(&encoded).unwrap();
                    prop_assert!(value.is_object());
                    prop_assert!(parse_inline(&encoded).is_some());
                }
            }

            let parsed = parse_inline(&m.inline_encode(DEFAULT_INLINE_LIMIT)).unwrap();
            prop_assert_eq!(parsed.sha256b64.as_deref(), Some(HASH));
        }
    }
}
