// SPDX-License-Identifier: Apache-2.0

//! One metric = one Grok pattern + templates + a label-keyed vector.
//!
//! The four metric types share only name, collector registration and
//! `process`; the difference between them is whether a match increments a
//! counter or feeds a parsed value into an observing vector, so the type
//! split lives in the [`MetricKind`] variant.

pub mod summary;

use std::collections::HashMap;

use prometheus::{CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry};
use thiserror::Error;

use crate::config::{MetricConfig, MetricType};
use crate::grok::{GrokError, GrokRegex, MatchResult, Patterns};
use crate::template::{Template, TemplateError};
use summary::SummaryVec;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("failed to initialize metric {metric}: {source}")]
    Grok {
        metric: String,
        #[source]
        source: GrokError,
    },

    #[error("failed to initialize metric {metric}: {source}")]
    Template {
        metric: String,
        #[source]
        source: TemplateError,
    },

    #[error(
        "failed to initialize metric {metric}: template references field '{field}' which is not a named group of the match pattern"
    )]
    UnknownField { metric: String, field: String },

    #[error("failed to initialize metric {metric}: {kind} metrics require a value template")]
    MissingValue { metric: String, kind: &'static str },

    #[error("failed to initialize metric {metric}: {source}")]
    Registry {
        metric: String,
        #[source]
        source: prometheus::Error,
    },
}

/// Errors recovered per line: the match is skipped for this metric, counted,
/// and processing continues with the next metric.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("error while processing metric {metric}: {source}")]
    Template {
        metric: String,
        #[source]
        source: TemplateError,
    },

    #[error("error while processing metric {metric}: {source}")]
    Capture {
        metric: String,
        #[source]
        source: GrokError,
    },

    #[error(
        "error while processing metric {metric}: value template '{template}' evaluates to '{value}', which is not a valid number"
    )]
    InvalidNumber {
        metric: String,
        template: String,
        value: String,
    },
}

/// Outcome of applying one metric to one line.
#[derive(Debug)]
pub enum LineOutcome {
    /// The pattern did not match. No state changed.
    NoMatch,
    /// The pattern matched and the series was updated once.
    Updated,
    /// The pattern matched but the update was skipped.
    Skipped(ProcessError),
}

impl LineOutcome {
    pub fn matched(&self) -> bool {
        !matches!(self, LineOutcome::NoMatch)
    }
}

enum MetricKind {
    Counter(CounterVec),
    Gauge {
        vec: GaugeVec,
        value: Template,
        /// add instead of set
        cumulative: bool,
    },
    Histogram {
        vec: HistogramVec,
        value: Template,
    },
    Summary {
        vec: SummaryVec,
        value: Template,
    },
}

pub struct Metric {
    name: String,
    regex: GrokRegex,
    labels: Vec<Template>,
    kind: MetricKind,
}

impl Metric {
    /// Builds a metric from its configuration: expands and compiles the match
    /// pattern, parses the templates, verifies every referenced field against
    /// the compiled regex and creates the vector.
    pub fn build(
        input_label_name: &str,
        cfg: &MetricConfig,
        patterns: &Patterns,
    ) -> Result<Metric, BuildError> {
        let name = cfg.name.clone();

        let regex = GrokRegex::compile(&cfg.match_pattern, patterns).map_err(|e| {
            BuildError::Grok {
                metric: name.clone(),
                source: e,
            }
        })?;

        let mut labels = Vec::with_capacity(cfg.labels.len());
        for (label, text) in &cfg.labels {
            labels.push(Template::parse(label, text).map_err(|e| BuildError::Template {
                metric: name.clone(),
                source: e,
            })?);
        }

        let value = if cfg.value.is_empty() {
            None
        } else {
            Some(
                Template::parse("value", &cfg.value).map_err(|e| BuildError::Template {
                    metric: name.clone(),
                    source: e,
                })?,
            )
        };

        for template in labels.iter().chain(value.iter()) {
            for field in template.referenced_fields() {
                if !regex.has_group(field) {
                    return Err(BuildError::UnknownField {
                        metric: name,
                        field: field.clone(),
                    });
                }
            }
        }

        let mut label_names = Vec::with_capacity(labels.len() + 1);
        label_names.push(input_label_name);
        label_names.extend(labels.iter().map(Template::name));

        let registry_err = |e: prometheus::Error| BuildError::Registry {
            metric: cfg.name.clone(),
            source: e,
        };
        let value_for = |kind: &'static str| {
            value.clone().ok_or(BuildError::MissingValue {
                metric: cfg.name.clone(),
                kind,
            })
        };

        let kind = match cfg.metric_type {
            MetricType::Counter => {
                let vec = CounterVec::new(Opts::new(&cfg.name, &cfg.help), &label_names)
                    .map_err(registry_err)?;
                MetricKind::Counter(vec)
            }
            MetricType::Gauge => {
                let vec = GaugeVec::new(Opts::new(&cfg.name, &cfg.help), &label_names)
                    .map_err(registry_err)?;
                MetricKind::Gauge {
                    vec,
                    value: value_for("gauge")?,
                    cumulative: cfg.cumulative,
                }
            }
            MetricType::Histogram => {
                let mut opts = HistogramOpts::new(&cfg.name, &cfg.help);
                if !cfg.buckets.is_empty() {
                    opts = opts.buckets(cfg.buckets.clone());
                }
                let vec = HistogramVec::new(opts, &label_names).map_err(registry_err)?;
                MetricKind::Histogram {
                    vec,
                    value: value_for("histogram")?,
                }
            }
            MetricType::Summary => {
                let vec = SummaryVec::new(
                    &cfg.name,
                    &cfg.help,
                    &label_names,
                    &cfg.quantiles.ranks(),
                )
                .map_err(registry_err)?;
                MetricKind::Summary {
                    vec,
                    value: value_for("summary")?,
                }
            }
        };

        Ok(Metric {
            name,
            regex,
            labels,
            kind,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers this metric's vector with the registry. Called exactly once
    /// at startup.
    pub fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        match &self.kind {
            MetricKind::Counter(vec) => registry.register(Box::new(vec.clone())),
            MetricKind::Gauge { vec, .. } => registry.register(Box::new(vec.clone())),
            MetricKind::Histogram { vec, .. } => registry.register(Box::new(vec.clone())),
            MetricKind::Summary { vec, .. } => registry.register(Box::new(vec.clone())),
        }
    }

    /// Matches `line` and, on a match, updates the series keyed by the input
    /// source and the rendered label values. The series is updated at most
    /// once per call; a template or value failure after a match skips the
    /// update but still reports the line as matched.
    pub fn process(&self, source: &str, line: &str) -> LineOutcome {
        let Some(matched) = self.regex.match_line(line) else {
            return LineOutcome::NoMatch;
        };
        match self.update(source, &matched) {
            Ok(()) => LineOutcome::Updated,
            Err(e) => LineOutcome::Skipped(e),
        }
    }

    fn update(&self, source: &str, matched: &MatchResult<'_, '_>) -> Result<(), ProcessError> {
        match &self.kind {
            MetricKind::Counter(vec) => {
                let values = self.label_values(source, matched)?;
                vec.with_label_values(&as_refs(&values)).inc();
            }
            MetricKind::Gauge {
                vec,
                value,
                cumulative,
            } => {
                let parsed = self.numeric_value(value, matched)?;
                let values = self.label_values(source, matched)?;
                let gauge = vec.with_label_values(&as_refs(&values));
                if *cumulative {
                    gauge.add(parsed);
                } else {
                    gauge.set(parsed);
                }
            }
            MetricKind::Histogram { vec, value } => {
                let parsed = self.numeric_value(value, matched)?;
                let values = self.label_values(source, matched)?;
                vec.with_label_values(&as_refs(&values)).observe(parsed);
            }
            MetricKind::Summary { vec, value } => {
                let parsed = self.numeric_value(value, matched)?;
                let values = self.label_values(source, matched)?;
                vec.observe(&as_refs(&values), parsed);
            }
        }
        Ok(())
    }

    fn numeric_value(
        &self,
        template: &Template,
        matched: &MatchResult<'_, '_>,
    ) -> Result<f64, ProcessError> {
        let rendered = self.render(template, matched)?;
        rendered
            .trim()
            .parse::<f64>()
            .map_err(|_| ProcessError::InvalidNumber {
                metric: self.name.clone(),
                template: template.text().to_string(),
                value: rendered,
            })
    }

    fn label_values(
        &self,
        source: &str,
        matched: &MatchResult<'_, '_>,
    ) -> Result<Vec<String>, ProcessError> {
        let mut values = Vec::with_capacity(self.labels.len() + 1);
        values.push(source.to_string());
        for template in &self.labels {
            values.push(self.render(template, matched)?);
        }
        Ok(values)
    }

    fn render(
        &self,
        template: &Template,
        matched: &MatchResult<'_, '_>,
    ) -> Result<String, ProcessError> {
        let mut bindings = HashMap::with_capacity(template.referenced_fields().len());
        for field in template.referenced_fields() {
            let value = matched.get(field).map_err(|e| ProcessError::Capture {
                metric: self.name.clone(),
                source: e,
            })?;
            bindings.insert(field.clone(), value.to_string());
        }
        template
            .execute(&bindings)
            .map_err(|e| ProcessError::Template {
                metric: self.name.clone(),
                source: e,
            })
    }
}

fn as_refs(values: &[String]) -> Vec<&str> {
    values.iter().map(String::as_str).collect()
}
