//! Path patterns.
//!
//! A path pattern is a variant of glob matched against absolute repository
//! paths:
//!   * `"/**"` - find all files recursively
//!   * `"*.json"` - find all JSON files recursively
//!   * `"/foo/*.json"` - find all JSON files under the directory /foo
//!   * `"/*/foo.txt"` - find all files named foo.txt at the second depth level
//!   * `"*.json,/bar/*.txt"` - use comma to specify more than one pattern.
//!   A file will be matched if any pattern matches.
//!
//! `?` matches exactly one character that is not `/`, `*` matches any number
//! of them, and `**` matches any number of whole path segments. A pattern
//! that does not start with `/` is implicitly prefixed with `/**/`. Matching
//! is case sensitive.

use std::borrow::Cow;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::Error;

fn normalize_alternative(pattern: &str) -> Cow<str> {
    if pattern.is_empty() {
        return Cow::Borrowed("/**");
    }
    if pattern.starts_with("**") {
        return Cow::Owned(format!("/{}", pattern));
    }
    if !pattern.starts_with('/') {
        return Cow::Owned(format!("/**/{}", pattern));
    }

    Cow::Borrowed(pattern)
}

/// A compiled path pattern. Compile once, match many; matching does not
/// allocate.
#[derive(Debug, Clone)]
pub struct PathPattern {
    raw: String,
    set: GlobSet,
}

impl PathPattern {
    /// Compiles a pattern string, which may hold several `,`-separated
    /// alternatives.
    pub fn compile(pattern: &str) -> Result<PathPattern, Error> {
        let mut builder = GlobSetBuilder::new();
        let mut normalized = Vec::new();
        for alternative in pattern.split(',').map(str::trim) {
            let alternative = normalize_alternative(alternative);
            let glob = GlobBuilder::new(&alternative[1..])
                .literal_separator(true)
                .build()
                .map_err(|e| Error::InvalidPath(format!("invalid path pattern: {}", e)))?;
            builder.add(glob);
            normalized.push(alternative.into_owned());
        }
        let set = builder
            .build()
            .map_err(|e| Error::InvalidPath(format!("invalid path pattern: {}", e)))?;
        Ok(PathPattern {
            raw: normalized.join(","),
            set,
        })
    }

    /// The pattern that matches every file.
    pub fn all() -> PathPattern {
        PathPattern::compile("/**").expect("'/**' always compiles")
    }

    /// Whether the given absolute path matches any alternative.
    pub fn matches(&self, path: &str) -> bool {
        let relative = path.strip_prefix('/').unwrap_or(path);
        self.set.is_match(relative)
    }

    /// The normalized textual form of this pattern.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether this pattern is the match-everything pattern.
    pub fn matches_all(&self) -> bool {
        self.raw == "/**"
    }
}

impl std::fmt::Display for PathPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Builds a single [`PathPattern`] from structural constraints.
///
/// `starts_with` pins the leading directory, each `contains` requires a
/// directory segment anywhere below it, and `extension` constrains the file
/// suffix. All constraints combine into one pattern:
/// `starts_with("/foo") + contains("/ext") + extension("json")` yields
/// `/foo/**/ext/**/*.json`.
#[derive(Debug, Default)]
pub struct PathPatternBuilder {
    prefix: Option<String>,
    contains: Vec<String>,
    suffixes: Vec<String>,
}

impl PathPatternBuilder {
    pub fn new() -> PathPatternBuilder {
        PathPatternBuilder::default()
    }

    /// Requires paths to live under the given directory.
    pub fn starts_with(mut self, dir_path: &str) -> PathPatternBuilder {
        self.prefix = Some(format!("/{}", dir_path.trim_matches('/')));
        self
    }

    /// Requires paths to contain the given directory segment.
    pub fn contains(mut self, dir_path: &str) -> PathPatternBuilder {
        self.contains.push(dir_path.trim_matches('/').to_string());
        self
    }

    /// Requires the given file extension. May be repeated; any of the
    /// extensions matches.
    pub fn extension(mut self, extension: &str) -> PathPatternBuilder {
        self.suffixes
            .push(format!("*.{}", extension.trim_start_matches('.')));
        self
    }

    /// Requires the given file name. May be repeated; any of the names
    /// matches.
    pub fn name(mut self, file_name: &str) -> PathPatternBuilder {
        self.suffixes.push(file_name.to_string());
        self
    }

    pub fn build(self) -> Result<PathPattern, Error> {
        let mut stem = self.prefix.unwrap_or_default();
        for dir in &self.contains {
            stem.push_str("/**/");
            stem.push_str(dir);
        }
        let suffixes = if self.suffixes.is_empty() {
            vec!["**".to_string()]
        } else {
            self.suffixes
        };
        let alternatives: Vec<String> = suffixes
            .iter()
            .map(|suffix| format!("{}/**/{}", stem, suffix))
            .collect();
        PathPattern::compile(&alternatives.join(","))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn pattern(p: &str) -> PathPattern {
        PathPattern::compile(p).unwrap()
    }

    #[test]
    fn test_extension_pattern() {
        let p = pattern("*.json");
        assert!(p.matches("/a.json"));
        assert!(p.matches("/x/y.json"));
        assert!(!p.matches("/a.json/b"));
        assert!(!p.matches("/a.txt"));
    }

    #[test]
    fn test_all_pattern() {
        let p = pattern("/**");
        assert!(p.matches("/a"));
        assert!(p.matches("/a/b/c.json"));
        assert!(p.matches_all());
    }

    #[test]
    fn test_single_segment_wildcard() {
        let p = pattern("/*/foo.txt");
        assert!(p.matches("/a/foo.txt"));
        assert!(!p.matches("/foo.txt"));
        assert!(!p.matches("/a/b/foo.txt"));
    }

    #[test]
    fn test_question_mark() {
        let p = pattern("/a?.txt");
        assert!(p.matches("/ab.txt"));
        assert!(!p.matches("/a.txt"));
        assert!(!p.matches("/a/b.txt"));
    }

    #[test]
    fn test_directory_prefix() {
        let p = pattern("/foo/**");
        assert!(p.matches("/foo/a"));
        assert!(p.matches("/foo/a/b.json"));
        assert!(!p.matches("/bar/a"));
    }

    #[test]
    fn test_alternatives() {
        let p = pattern("*.json,/bar/*.txt");
        assert!(p.matches("/a/b.json"));
        assert!(p.matches("/bar/a.txt"));
        assert!(!p.matches("/a/b.txt"));
    }

    #[test]
    fn test_implicit_prefix_normalization() {
        assert_eq!(pattern("*.json").as_str(), "/**/*.json");
        assert_eq!(pattern("**/a.txt").as_str(), "/**/a.txt");
        assert_eq!(pattern("").as_str(), "/**");
    }

    #[test]
    fn test_builder_composition() {
        let p = PathPatternBuilder::new()
            .starts_with("/foo/bar")
            .contains("/ext")
            .extension("json")
            .build()
            .unwrap();
        assert!(p.matches("/foo/bar/x/ext/y.json"));
        assert!(p.matches("/foo/bar/ext/y.json"));
        assert!(!p.matches("/foo/bar/x/y.json"));
        assert!(!p.matches("/foo/bar/x/ext/y.txt"));
    }

    #[test]
    fn test_builder_extension_only() {
        let p = PathPatternBuilder::new().extension("json").build().unwrap();
        assert_eq!(p.as_str(), "/**/*.json");
        assert!(p.matches("/a.json"));
    }

    #[test]
    fn test_builder_empty_matches_all() {
        let p = PathPatternBuilder::new().build().unwrap();
        assert!(p.matches("/anything/at/all.txt"));
    }
}
