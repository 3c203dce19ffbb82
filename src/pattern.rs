//! Delimited regular expressions from configuration (`/.../`).

use crate::error::ConfigError;
use regex::{Regex, RegexBuilder};

/// A compiled `/.../` pattern together with its named capture groups.
#[derive(Clone, Debug)]
pub struct Pattern {
    regex: Regex,
    names: Vec<String>,
}

impl Pattern {
    #[inline]
    pub fn regex(&self) -> &Regex {
        &self.regex
    }

    /// Named capture groups in declaration order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn has_name(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    #[inline]
    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

/// Compile a pattern written as `/expr/`.
///
/// `multiline` makes `.` match newlines so a record format can span several physical lines.
/// `require_names` rejects expressions without a single named capture.
pub fn compile_delimited(
    source: &str,
    multiline: bool,
    require_names: bool,
) -> Result<Pattern, ConfigError> {
    let body = source
        .strip_prefix('/')
        .and_then(|s| s.strip_suffix('/'))
        .ok_or_else(|| ConfigError::InvalidPattern {
            pattern: source.to_string(),
            reason: "must be wrapped in '/'".into(),
        })?;

    let regex = RegexBuilder::new(body)
        .dot_matches_new_line(multiline)
        .multi_line(multiline)
        .build()
        .map_err(|e| ConfigError::InvalidPattern {
            pattern: body.to_string(),
            reason: e.to_string(),
        })?;

    let names: Vec<String> = regex.capture_names().flatten().map(str::to_string).collect();
    if require_names && names.is_empty() {
        return Err(ConfigError::NoNamedCaptures(body.to_string()));
    }
    Ok(Pattern { regex, names })
}

/// Compile an optional, possibly blank, pattern option.
pub fn compile_optional(
    source: Option<&str>,
    multiline: bool,
    require_names: bool,
) -> Result<Option<Pattern>, ConfigError> {
    match source.map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => compile_delimited(s, multiline, require_names).map(Some),
        None => Ok(None),
    }
}
