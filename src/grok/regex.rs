// SPDX-License-Identifier: Apache-2.0

//! Compiled Grok regex with named-capture access.

use regex::{Captures, Regex};

use super::{expand, GrokError, Patterns, Result};

/// A Grok pattern expanded and compiled into a regular expression. The set of
/// named capture groups is fixed at compile time; the regex crate rejects
/// duplicate group names, so each name appears at most once.
#[derive(Debug)]
pub struct GrokRegex {
    regex: Regex,
    /// Names of the capture groups (excluding the unnamed full match)
    group_names: Vec<String>,
}

impl GrokRegex {
    /// Expands `pattern` against the library and compiles the result.
    pub fn compile(pattern: &str, patterns: &Patterns) -> Result<Self> {
        let expanded = expand(pattern, patterns)?;
        let regex = Regex::new(&expanded).map_err(|e| GrokError::RegexCompile {
            pattern: pattern.to_string(),
            regex: expanded.clone(),
            source: e,
        })?;

        let group_names = regex
            .capture_names()
            .flatten()
            .map(str::to_string)
            .collect();

        Ok(Self { regex, group_names })
    }

    /// Named capture groups of this regex, in order of appearance.
    pub fn group_names(&self) -> &[String] {
        &self.group_names
    }

    pub fn has_group(&self, name: &str) -> bool {
        self.group_names.iter().any(|g| g == name)
    }

    /// Matches a single line. Returns None when the line does not match;
    /// the returned result borrows the line and is dropped before the next
    /// match on the same regex.
    pub fn match_line<'r, 't>(&'r self, line: &'t str) -> Option<MatchResult<'r, 't>> {
        self.regex
            .captures(line)
            .map(|captures| MatchResult {
                regex: self,
                captures,
            })
    }
}

/// Captures of one matched line.
pub struct MatchResult<'r, 't> {
    regex: &'r GrokRegex,
    captures: Captures<'t>,
}

impl<'r, 't> MatchResult<'r, 't> {
    /// Returns the text captured by the named group. A group that exists but
    /// did not participate in the match yields an empty string; a name that
    /// is not a group of the regex is an error.
    pub fn get(&self, name: &str) -> Result<&'t str> {
        if !self.regex.has_group(name) {
            return Err(GrokError::UnknownGroup(name.to_string()));
        }
        Ok(self
            .captures
            .name(name)
            .map(|m| m.as_str())
            .unwrap_or(""))
    }
}
