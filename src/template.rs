// SPDX-License-Identifier: Apache-2.0

//! Label and value templates.
//!
//! A template is literal text interleaved with `{{.field}}` placeholders,
//! where each field must be a named capture group of the metric's pattern.
//! The referenced-field set is known at parse time, which lets metric
//! construction verify every field against the compiled regex before a
//! single line is processed.

use std::collections::HashMap;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("invalid template '{template}': {reason}")]
    Syntax { template: String, reason: String },

    #[error("no value for field '{0}'")]
    MissingField(String),
}

#[derive(Debug, Clone)]
enum Part {
    Literal(String),
    Field(String),
}

#[derive(Debug, Clone)]
pub struct Template {
    name: String,
    text: String,
    parts: Vec<Part>,
    fields: Vec<String>,
}

impl Template {
    /// Parses `text` into a template. `name` is the stable label name this
    /// template renders values for.
    pub fn parse(name: impl Into<String>, text: &str) -> Result<Self, TemplateError> {
        let syntax = |reason: &str| TemplateError::Syntax {
            template: text.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = Vec::new();
        let mut fields: Vec<String> = Vec::new();
        let mut rest = text;
        while let Some(open) = rest.find("{{") {
            if open > 0 {
                parts.push(Part::Literal(rest[..open].to_string()));
            }
            let Some(close) = rest[open..].find("}}") else {
                return Err(syntax("missing closing '}}'"));
            };
            let inner = &rest[open + 2..open + close];
            let Some(field) = inner.strip_prefix('.') else {
                return Err(syntax("expected '{{.field}}'"));
            };
            if field.is_empty() || !field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(syntax("expected '{{.field}}'"));
            }
            if !fields.iter().any(|f| f == field) {
                fields.push(field.to_string());
            }
            parts.push(Part::Field(field.to_string()));
            rest = &rest[open + close + 2..];
        }
        if !rest.is_empty() {
            parts.push(Part::Literal(rest.to_string()));
        }

        Ok(Self {
            name: name.into(),
            text: text.to_string(),
            parts,
            fields,
        })
    }

    /// The label name this template belongs to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The original template text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Capture names this template reads, deduplicated, in order of first use.
    pub fn referenced_fields(&self) -> &[String] {
        &self.fields
    }

    /// Renders the template against the given bindings. Every referenced
    /// field must be present.
    pub fn execute(&self, bindings: &HashMap<String, String>) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.text.len());
        for part in &self.parts {
            match part {
                Part::Literal(s) => out.push_str(s),
                Part::Field(f) => match bindings.get(f) {
                    Some(v) => out.push_str(v),
                    None => return Err(TemplateError::MissingField(f.clone())),
                },
            }
        }
        Ok(out)
    }
}
