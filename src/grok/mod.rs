// SPDX-License-Identifier: Apache-2.0

//! Grok pattern expansion.
//!
//! A Grok pattern is a regular expression with `%{...}` references to named,
//! reusable fragments. `expand` resolves every reference against a
//! [`Patterns`] library and produces a plain regular expression that
//! [`GrokRegex`](regex::GrokRegex) can compile:
//!
//! - `%{NAME}` becomes a non-capturing group `(?:BODY)`
//! - `%{NAME:field}` becomes a named capturing group `(?P<field>BODY)`
//! - `%{NAME:field:type}` is accepted, the type suffix is ignored

pub mod patterns;
pub mod regex;

pub use patterns::Patterns;
pub use self::regex::{GrokRegex, MatchResult};

use thiserror::Error;

/// After this many substitutions we assume the pattern references itself and
/// abort instead of looping forever.
const MAX_SUBSTITUTIONS: usize = 1000;

#[derive(Debug, Error)]
pub enum GrokError {
    #[error("{0} is not a valid pattern reference")]
    InvalidPattern(String),

    #[error("pattern {0} not defined")]
    UndefinedPattern(String),

    #[error("deep recursion while expanding pattern '{0}'")]
    PatternRecursion(String),

    #[error("failed to compile pattern {pattern}: error in regular expression {regex}: {source}")]
    RegexCompile {
        pattern: String,
        regex: String,
        #[source]
        source: ::regex::Error,
    },

    #[error("'{0}' is not a valid pattern definition, expected 'NAME BODY'")]
    InvalidDefinition(String),

    #[error("field '{0}' is not a named group of the regular expression")]
    UnknownGroup(String),

    #[error("failed to load patterns from {path}: {source}")]
    PatternDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, GrokError>;

/// Resolves all `%{...}` references in `pattern` and returns a plain regular
/// expression. References are replaced one at a time, leftmost first; a
/// reference whose body contains further references is resolved by continued
/// iteration.
pub fn expand(pattern: &str, patterns: &Patterns) -> Result<String> {
    let mut result = pattern.to_string();
    for _ in 0..MAX_SUBSTITUTIONS {
        let (range, replacement) = {
            let Some(reference) = Reference::leftmost(&result) else {
                // No reference left means we are done.
                return Ok(result);
            };
            (reference.start..reference.end, reference.resolve(patterns)?)
        };
        result.replace_range(range, &replacement);
    }
    Err(GrokError::PatternRecursion(pattern.to_string()))
}

/// One `%{...}` occurrence inside a pattern string.
struct Reference<'a> {
    start: usize,
    end: usize,
    inner: &'a str,
}

impl<'a> Reference<'a> {
    /// Finds the leftmost `%{...}` with the shortest possible body, the same
    /// tie-break as matching `%\{(.+?)\}`. An unterminated `%{` is left alone
    /// and treated as literal regex text.
    fn leftmost(s: &'a str) -> Option<Reference<'a>> {
        let start = s.find("%{")?;
        let close = s[start + 2..].find('}')?;
        let end = start + 2 + close + 1;
        Some(Reference {
            start,
            end,
            inner: &s[start + 2..end - 1],
        })
    }

    fn resolve(&self, patterns: &Patterns) -> Result<String> {
        let parts: Vec<&str> = self.inner.split(':').collect();
        let body = patterns
            .find(parts[0])
            .ok_or_else(|| GrokError::UndefinedPattern(format!("%{{{}}}", self.inner)))?;
        match parts.len() {
            // Without a field name there is nothing to capture.
            1 => Ok(format!("(?:{})", body)),
            // With a field name we create a named capturing group. The third
            // segment is a type hint which we accept but ignore.
            2 | 3 => Ok(format!("(?P<{}>{})", parts[1], body)),
            _ => Err(GrokError::InvalidPattern(format!("%{{{}}}", self.inner))),
        }
    }
}
