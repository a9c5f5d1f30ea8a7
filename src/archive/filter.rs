//! Omission rules for artifact contents
//!
//! A [`PathFilter`] is a union of literal-prefix and regular-expression rules
//! plus an explicit set of exact archive paths. A path is omitted when any of
//! them matches; rule order never changes the outcome.

use regex_lite::Regex;
use std::collections::BTreeSet;
use std::fmt;

/// Errors for omission rules
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("Invalid omission pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex_lite::Error,
    },

    #[error("Project name must contain at least one character other than '-' or '_': '{0}'")]
    EmptyProjectName(String),
}

/// A single omission rule
#[derive(Debug, Clone)]
pub enum OmissionRule {
    /// Matches every path starting with the literal string
    Prefix(String),
    /// Matches every path containing a match of the expression (unanchored)
    Pattern(Regex),
}

impl OmissionRule {
    /// Literal prefix rule
    pub fn prefix(prefix: impl Into<String>) -> Self {
        OmissionRule::Prefix(prefix.into())
    }

    /// Compile a regular-expression rule
    pub fn pattern(pattern: &str) -> Result<Self, FilterError> {
        Regex::new(pattern)
            .map(OmissionRule::Pattern)
            .map_err(|source| FilterError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })
    }

    /// Rule omitting an installed project by name.
    ///
    /// Installed distributions spell the same project with `-` or `_`
    /// (`python-dateutil` vs `python_dateutil-2.9.0.dist-info`), so runs of
    /// either separator are interchangeable. The name is matched as a prefix
    /// of the path.
    pub fn project(name: &str) -> Result<Self, FilterError> {
        let parts: Vec<String> = name
            .split(['-', '_'])
            .filter(|p| !p.is_empty())
            .map(regex_lite::escape)
            .collect();
        if parts.is_empty() {
            return Err(FilterError::EmptyProjectName(name.to_string()));
        }
        Self::pattern(&format!("^{}", parts.join("[-_]+")))
    }

    /// Check whether this rule matches a path
    pub fn matches(&self, path: &str) -> bool {
        match self {
            OmissionRule::Prefix(prefix) => path.starts_with(prefix.as_str()),
            OmissionRule::Pattern(regex) => regex.is_match(path),
        }
    }
}

impl fmt::Display for OmissionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OmissionRule::Prefix(prefix) => write!(f, "prefix:{}", prefix),
            OmissionRule::Pattern(regex) => write!(f, "regex:{}", regex.as_str()),
        }
    }
}

/// Reason reported for an omitted path
pub const EXACT_PATH_REASON: &str = "exact-path";

/// What omitted a path
#[derive(Debug, Clone, Copy)]
pub enum FilterMatch<'a> {
    /// Listed in the filter's exact exclusions
    Exact,
    Rule(&'a OmissionRule),
}

impl fmt::Display for FilterMatch<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterMatch::Exact => f.write_str(EXACT_PATH_REASON),
            FilterMatch::Rule(rule) => write!(f, "{}", rule),
        }
    }
}

/// Union of omission rules evaluated against archive paths
///
/// Paths are archive-relative, `/`-separated and compared case-sensitively.
/// When the filter is rooted (see [`PathFilter::rooted_at`]) the prefix and
/// pattern rules see the path with the root removed, while exact exclusions
/// always compare against the full archive path.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    rules: Vec<OmissionRule>,
    exact: BTreeSet<String>,
    root: Option<String>,
}

impl PathFilter {
    /// Create an empty filter that omits nothing
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one rule
    pub fn with_rule(mut self, rule: OmissionRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Add several rules
    pub fn with_rules(mut self, rules: impl IntoIterator<Item = OmissionRule>) -> Self {
        self.rules.extend(rules);
        self
    }

    /// Add literal prefix rules
    pub fn with_prefixes<S: AsRef<str>>(self, prefixes: &[S]) -> Self {
        self.with_rules(prefixes.iter().map(|p| OmissionRule::prefix(p.as_ref())))
    }

    /// Compile and add regular-expression rules
    pub fn with_patterns<S: AsRef<str>>(self, patterns: &[S]) -> Result<Self, FilterError> {
        let rules = patterns
            .iter()
            .map(|p| p.as_ref())
            .filter(|p| !p.is_empty())
            .map(OmissionRule::pattern)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.with_rules(rules))
    }

    /// Compile and add project-name rules
    pub fn with_projects<S: AsRef<str>>(self, projects: &[S]) -> Result<Self, FilterError> {
        let rules = projects
            .iter()
            .map(|p| OmissionRule::project(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.with_rules(rules))
    }

    /// Derive a filter that also omits an explicit set of archive paths
    pub fn excluding_paths<I, S>(&self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut derived = self.clone();
        derived.exact.extend(paths.into_iter().map(Into::into));
        derived
    }

    /// Derive a filter whose rules apply beneath `root/`.
    ///
    /// Paths outside the root are only matched by exact exclusions.
    pub fn rooted_at(&self, root: &str) -> Self {
        let root = root.trim_matches('/');
        let mut derived = self.clone();
        derived.root = match (root.is_empty(), self.root.as_deref()) {
            (true, existing) => existing.map(str::to_string),
            (false, Some(existing)) => Some(format!("{}/{}", root, existing)),
            (false, None) => Some(root.to_string()),
        };
        derived
    }

    /// The rules of this filter
    pub fn rules(&self) -> &[OmissionRule] {
        &self.rules
    }

    /// Root the rules are evaluated under, if any
    pub fn root(&self) -> Option<&str> {
        self.root.as_deref()
    }

    /// Check if an archive path is omitted
    pub fn matches(&self, path: &str) -> bool {
        self.first_match(path).is_some()
    }

    /// The exclusion or rule that omits a path, or `None` when it is kept.
    ///
    /// Exact exclusions are checked first, then rules in insertion order.
    /// Which one is reported never changes whether the path is omitted.
    pub fn first_match(&self, path: &str) -> Option<FilterMatch<'_>> {
        if self.exact.contains(path) {
            return Some(FilterMatch::Exact);
        }
        let relative = self.relative(path)?;
        self.rules
            .iter()
            .find(|rule| rule.matches(relative))
            .map(FilterMatch::Rule)
    }

    /// Describe why a path is omitted, for reporting
    pub fn omission_reason(&self, path: &str) -> Option<String> {
        self.first_match(path).map(|m| m.to_string())
    }

    fn relative<'a>(&self, path: &'a str) -> Option<&'a str> {
        match &self.root {
            None => Some(path),
            Some(root) => path.strip_prefix(root.as_str())?.strip_prefix('/'),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_filter_keeps_everything() {
        let filter = PathFilter::new();
        assert!(!filter.matches("a.py"));
        assert!(!filter.matches("vendor/boto3/x.py"));
    }

    #[test]
    fn test_regex_rule_scenario() {
        let filter = PathFilter::new().with_patterns(&["^vendor/boto3"]).unwrap();

        assert!(!filter.matches("a.py"));
        assert!(!filter.matches("b.py"));
        assert!(filter.matches("vendor/boto3/x.py"));
        assert_eq!(
            filter.omission_reason("vendor/boto3/x.py").as_deref(),
            Some("regex:^vendor/boto3")
        );
    }

    #[test]
    fn test_regex_is_unanchored_search() {
        let filter = PathFilter::new().with_patterns(&[r"\.dist-info/"]).unwrap();

        assert!(filter.matches("requests-2.31.0.dist-info/RECORD"));
        assert!(!filter.matches("requests/api.py"));
    }

    #[test]
    fn test_first_match_reports_first_rule() {
        let filter = PathFilter::new()
            .with_prefixes(&["vendor/"])
            .with_patterns(&["^vendor/boto3"])
            .unwrap();

        match filter.first_match("vendor/boto3/x.py") {
            Some(FilterMatch::Rule(OmissionRule::Prefix(p))) => assert_eq!(p, "vendor/"),
            other => panic!("Expected prefix rule, got {:?}", other),
        }
        assert!(filter.first_match("app.py").is_none());
        assert!(matches!(
            filter.excluding_paths(["app.py"]).first_match("app.py"),
            Some(FilterMatch::Exact)
        ));
    }

    #[test]
    fn test_prefix_rule() {
        let filter = PathFilter::new().with_prefixes(&["boto3"]);

        assert!(filter.matches("boto3/__init__.py"));
        assert!(filter.matches("boto3-1.34.0.dist-info/METADATA"));
        assert!(!filter.matches("lib/boto3/__init__.py"));
    }

    #[test]
    fn test_matching_is_case_sensitive() {
        let filter = PathFilter::new()
            .with_prefixes(&["Boto3"])
            .with_patterns(&["^Six"])
            .unwrap();

        assert!(!filter.matches("boto3/__init__.py"));
        assert!(!filter.matches("six.py"));
        assert!(filter.matches("Six.py"));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let err = PathFilter::new().with_patterns(&["(unclosed"]).unwrap_err();
        match err {
            FilterError::InvalidPattern { pattern, .. } => assert_eq!(pattern, "(unclosed"),
            other => panic!("Expected InvalidPattern, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_patterns_ignored() {
        let filter = PathFilter::new().with_patterns(&["", "^x"]).unwrap();
        assert_eq!(filter.rules().len(), 1);
    }

    #[test]
    fn test_project_rule_normalizes_separators() {
        let rule = OmissionRule::project("python-dateutil").unwrap();

        assert!(rule.matches("python_dateutil-2.9.0.dist-info/RECORD"));
        assert!(rule.matches("python-dateutil/x.py"));
        assert!(rule.matches("python__dateutil/x.py"));
        assert!(!rule.matches("dateutil/parser.py"));
        assert!(!rule.matches("lib/python_dateutil/x.py"));
    }

    #[test]
    fn test_project_rule_escapes_metacharacters() {
        let rule = OmissionRule::project("zope.interface").unwrap();

        assert!(rule.matches("zope.interface-6.0.dist-info/RECORD"));
        assert!(!rule.matches("zopexinterface/x.py"));
    }

    #[test]
    fn test_project_rule_rejects_separator_only_name() {
        assert!(matches!(
            OmissionRule::project("-_-"),
            Err(FilterError::EmptyProjectName(_))
        ));
    }

    #[test]
    fn test_excluding_paths_is_derived() {
        let base = PathFilter::new().with_prefixes(&["boto3"]);
        let derived = base.excluding_paths(["handler.py", "app/__init__.py"]);

        assert!(derived.matches("handler.py"));
        assert!(derived.matches("app/__init__.py"));
        assert!(!derived.matches("app/views.py"));
        assert!(derived.matches("boto3/x.py"));
        // The original is untouched
        assert!(!base.matches("handler.py"));
        assert_eq!(
            derived.omission_reason("handler.py").as_deref(),
            Some(EXACT_PATH_REASON)
        );
    }

    #[test]
    fn test_rooted_rules_apply_beneath_root() {
        let filter = PathFilter::new()
            .with_patterns(&["^boto3"])
            .unwrap()
            .rooted_at("python");

        assert!(filter.matches("python/boto3/session.py"));
        assert!(!filter.matches("boto3/session.py"));
        assert!(!filter.matches("python/requests/api.py"));
        assert!(!filter.matches("pythonboto3/x.py"));
    }

    #[test]
    fn test_rooted_exact_paths_use_full_path() {
        let filter = PathFilter::new()
            .rooted_at("python")
            .excluding_paths(["python/app/handler.py"]);

        assert!(filter.matches("python/app/handler.py"));
        assert!(!filter.matches("app/handler.py"));
    }

    #[test]
    fn test_rooted_twice_nests() {
        let filter = PathFilter::new()
            .with_prefixes(&["six"])
            .rooted_at("site")
            .rooted_at("python");

        assert_eq!(filter.root(), Some("python/site"));
        assert!(filter.matches("python/site/six.py"));
        assert!(!filter.matches("python/six.py"));
    }

    const RULE_POOL: &[&str] = &[
        "p:a",
        "p:b/",
        "p:c_",
        "r:^a/b",
        "r:_$",
        r"r:\.py$",
        "r:b.c",
        "r:^c",
    ];

    fn build_filter(indices: &[usize]) -> PathFilter {
        indices.iter().fold(PathFilter::new(), |filter, &i| {
            let entry = RULE_POOL[i];
            let rule = match entry.split_once(':') {
                Some(("p", prefix)) => OmissionRule::prefix(prefix),
                Some((_, pattern)) => OmissionRule::pattern(pattern).unwrap(),
                None => unreachable!(),
            };
            filter.with_rule(rule)
        })
    }

    proptest! {
        #[test]
        fn prop_rule_order_does_not_change_result(
            indices in proptest::collection::vec(0..RULE_POOL.len(), 0..8),
            rotation in 0usize..8,
            paths in proptest::collection::vec("[abc_/.py]{0,12}", 1..16),
        ) {
            let forward = build_filter(&indices);

            let mut reversed_indices = indices.clone();
            reversed_indices.reverse();
            let reversed = build_filter(&reversed_indices);

            let mut rotated_indices = indices.clone();
            if !rotated_indices.is_empty() {
                let n = rotation % rotated_indices.len();
                rotated_indices.rotate_left(n);
            }
            let rotated = build_filter(&rotated_indices);

            for path in &paths {
                let expected = forward.matches(path);
                prop_assert_eq!(reversed.matches(path), expected);
                prop_assert_eq!(rotated.matches(path), expected);
            }
        }

        #[test]
        fn prop_union_equals_any_single_rule(
            indices in proptest::collection::vec(0..RULE_POOL.len(), 0..8),
            path in "[abc_/.py]{0,12}",
        ) {
            let combined = build_filter(&indices);
            let any_single = indices
                .iter()
                .any(|&i| build_filter(&[i]).matches(&path));
            prop_assert_eq!(combined.matches(&path), any_single);
        }
    }
}
