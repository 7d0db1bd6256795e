//! Include/exclude filtering with compiled glob patterns.
//!
//! Globs use `/` or `\` as segment separators and support `*`, `**` and `?`.
//! A trailing separator is shorthand for "this directory and everything
//! beneath it". Patterns are translated to anchored regular expressions that
//! use one separator consistently for both the compiled pattern and the
//! probed path.

use std::fmt;
use std::fs;
use std::path::Path;

use regex::Regex;

use crate::error::PatternError;
use crate::Result;

/// A compiled glob.
#[derive(Clone)]
pub struct GlobMatcher {
    glob: String,
    regex: Regex,
}

impl GlobMatcher {
    /// Compile `glob` for paths rendered with `separator`.
    ///
    /// # Errors
    ///
    /// Returns an error if the translated expression cannot be compiled.
    pub fn compile(glob: &str, separator: char) -> Result<Self> {
        let source = glob_to_regex(glob, separator);
        let regex = Regex::new(&source).map_err(|e| PatternError::invalid(glob, e.to_string()))?;

        Ok(Self {
            glob: glob.to_string(),
            regex,
        })
    }

    /// Check whether the whole of `path` matches this glob.
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    /// The glob this matcher was compiled from.
    #[must_use]
    pub fn glob(&self) -> &str {
        &self.glob
    }

    /// The anchored expression the glob was translated to.
    #[must_use]
    pub fn as_regex_str(&self) -> &str {
        self.regex.as_str()
    }
}

impl fmt::Debug for GlobMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobMatcher")
            .field("glob", &self.glob)
            .field("regex", &self.regex.as_str())
            .finish()
    }
}

/// Translate a glob into an anchored regular expression.
#[must_use]
pub fn glob_to_regex(glob: &str, separator: char) -> String {
    let is_separator = |c: char| c == '/' || c == '\\' || c == separator;

    let mut glob = glob.to_string();
    if glob.ends_with(is_separator) {
        glob.push_str("**");
    }

    let mut sep_buf = [0u8; 4];
    let literal_sep = regex::escape(separator.encode_utf8(&mut sep_buf));
    let any_run = format!("[^{literal_sep}]*?");

    let mut pattern = String::from("^");
    let mut append_separator = false;

    for segment in glob.split(is_separator) {
        if append_separator {
            pattern.push_str(&literal_sep);
        } else {
            append_separator = true;
        }

        if segment == "**" {
            pattern.push_str(".*?");
            append_separator = false;
            continue;
        }

        for ch in segment.chars() {
            match ch {
                '*' => pattern.push_str(&any_run),
                '?' => pattern.push('.'),
                _ => {
                    let mut buf = [0u8; 4];
                    pattern.push_str(&regex::escape(ch.encode_utf8(&mut buf)));
                }
            }
        }
    }

    pattern.push('$');
    pattern
}

/// Include and exclude matcher sets for one watch root.
#[derive(Debug, Clone)]
pub struct FilterSet {
    separator: char,
    includes: Vec<GlobMatcher>,
    excludes: Vec<GlobMatcher>,
}

impl Default for FilterSet {
    fn default() -> Self {
        Self::new(std::path::MAIN_SEPARATOR)
    }
}

impl FilterSet {
    /// Create an empty filter set using `separator`.
    #[must_use]
    pub fn new(separator: char) -> Self {
        Self {
            separator,
            includes: Vec::new(),
            excludes: Vec::new(),
        }
    }

    /// Separator used for compiled patterns and rendered paths.
    #[must_use]
    pub fn separator(&self) -> char {
        self.separator
    }

    /// Add an include pattern.
    ///
    /// # Errors
    ///
    /// Returns an error if the pattern cannot be compiled.
    pub fn include(&mut self, glob: &str) -> Result<()> {
        self.includes.push(GlobMatcher::compile(glob, self.separator)?);
        Ok(())
    }

    /// Add an exclude pattern.
    ///
    /// # Errors
    ///
    /// Returns an error if the pattern cannot be compiled.
    pub fn exclude(&mut self, glob: &str) -> Result<()> {
        self.excludes.push(GlobMatcher::compile(glob, self.separator)?);
        Ok(())
    }

    /// Load exclude patterns from a gitignore-style file.
    ///
    /// Blank lines and `#` comments are skipped. Returns the number of
    /// patterns added. Nothing is added if any line is rejected.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, a line uses `!`
    /// negation, or a pattern cannot be compiled.
    pub fn exclude_from_file(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let content = fs::read_to_string(path.as_ref())?;
        let mut compiled = Vec::new();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if line.starts_with('!') {
                return Err(PatternError::Unsupported {
                    pattern: line.to_string(),
                    reason: "negated patterns are not supported".to_string(),
                }
                .into());
            }

            compiled.push(GlobMatcher::compile(line, self.separator)?);
        }

        let added = compiled.len();
        self.excludes.extend(compiled);
        Ok(added)
    }

    /// Include patterns in insertion order.
    #[must_use]
    pub fn includes(&self) -> &[GlobMatcher] {
        &self.includes
    }

    /// Exclude patterns in insertion order.
    #[must_use]
    pub fn excludes(&self) -> &[GlobMatcher] {
        &self.excludes
    }

    /// Check a relative path against the filters.
    #[must_use]
    pub fn should_track(&self, path: &Path) -> bool {
        self.should_track_str(&self.render(path))
    }

    /// Check an already rendered path against the filters.
    #[must_use]
    pub fn should_track_str(&self, path: &str) -> bool {
        self.should_include(path) && !self.should_exclude(path)
    }

    /// Render a path with this set's separator.
    #[must_use]
    pub fn render(&self, path: &Path) -> String {
        let mut sep_buf = [0u8; 4];
        let sep: &str = self.separator.encode_utf8(&mut sep_buf);

        path.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join(sep)
    }

    fn should_include(&self, path: &str) -> bool {
        self.includes.is_empty() || self.includes.iter().any(|m| m.matches(path))
    }

    fn should_exclude(&self, path: &str) -> bool {
        self.excludes.iter().any(|m| m.matches(path))
    }
}
