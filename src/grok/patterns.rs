// SPDX-License-Identifier: Apache-2.0

//! The pattern library: a name -> regex-fragment mapping loaded from pattern
//! files and inline definitions. Mutated only during startup, read-only
//! afterwards.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use super::{GrokError, Result};

#[derive(Debug, Default)]
pub struct Patterns {
    by_name: HashMap<String, String>,
}

impl Patterns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a named pattern. A later definition with the same name replaces
    /// the earlier one, matching the usual pattern-file semantics where user
    /// directories override stock definitions.
    pub fn add(&mut self, name: &str, body: &str) -> Result<()> {
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(GrokError::InvalidDefinition(format!("{} {}", name, body)));
        }
        if body.is_empty() {
            return Err(GrokError::InvalidDefinition(name.to_string()));
        }
        self.by_name.insert(name.to_string(), body.to_string());
        Ok(())
    }

    /// Adds a single `NAME BODY` definition line, the format used both by
    /// pattern files and by inline `additional_patterns` config entries.
    pub fn add_line(&mut self, line: &str) -> Result<()> {
        let mut split = line.splitn(2, char::is_whitespace);
        match (split.next(), split.next()) {
            (Some(name), Some(body)) if !body.trim().is_empty() => {
                self.add(name, body.trim_start())
            }
            _ => Err(GrokError::InvalidDefinition(line.to_string())),
        }
    }

    /// Loads every file in `dir`. Each line is a `NAME BODY` definition;
    /// blank lines and lines starting with `#` are skipped.
    pub fn add_dir(&mut self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        let entries = fs::read_dir(dir).map_err(|e| GrokError::PatternDir {
            path: dir.display().to_string(),
            source: e,
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| GrokError::PatternDir {
                path: dir.display().to_string(),
                source: e,
            })?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let content = fs::read_to_string(&path).map_err(|e| GrokError::PatternDir {
                path: path.display().to_string(),
                source: e,
            })?;
            self.add_str(&content)?;
        }
        Ok(())
    }

    fn add_str(&mut self, content: &str) -> Result<()> {
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            self.add_line(line)?;
        }
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<&str> {
        self.by_name.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
