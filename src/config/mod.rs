// SPDX-License-Identifier: Apache-2.0

//! YAML configuration: the version-3 model consumed by the pipeline, plus
//! loading, version detection, defaults and validation. Historical schema
//! versions 1 and 2 are upgraded by the pure migrators in [`v1`] and [`v2`]
//! before the rest of the program ever sees them.

pub mod v1;
pub mod v2;

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub const CURRENT_VERSION: u64 = 3;

pub const DEFAULT_INPUT_LABEL: &str = "source";
pub const DEFAULT_PORT: u16 = 9144;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "invalid configuration: {0}. make sure to use 'single quotes' around strings with special characters (like match patterns or label templates), and to use '-' only for lists (metrics) but not for maps (labels)"
    )]
    Yaml(#[source] serde_yaml::Error),

    #[error("config_version {0} is not supported")]
    UnsupportedVersion(u64),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub inputs: Vec<InputConfig>,
    #[serde(default)]
    pub grok: GrokConfig,
    #[serde(default)]
    pub metrics: Vec<MetricConfig>,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub config_version: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub input_label_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    /// Label value identifying this source in every exported series.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "type", default)]
    pub input_type: InputType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub readall: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    #[default]
    File,
    Stdin,
}

impl fmt::Display for InputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputType::File => write!(f, "file"),
            InputType::Stdin => write!(f, "stdin"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GrokConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub patterns_dir: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_patterns: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricConfig {
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    pub name: String,
    #[serde(default)]
    pub help: String,
    #[serde(rename = "match")]
    pub match_pattern: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cumulative: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buckets: Vec<f64>,
    #[serde(default, skip_serializing_if = "Quantiles::is_empty")]
    pub quantiles: Quantiles,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    #[default]
    Counter,
    Gauge,
    Histogram,
    Summary,
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricType::Counter => write!(f, "counter"),
            MetricType::Gauge => write!(f, "gauge"),
            MetricType::Histogram => write!(f, "histogram"),
            MetricType::Summary => write!(f, "summary"),
        }
    }
}

/// Summary quantiles as (rank, allowed error) pairs, written in YAML as a
/// mapping of floats: `{0.5: 0.05, 0.9: 0.01}`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Quantiles(pub Vec<(f64, f64)>);

impl Quantiles {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn ranks(&self) -> Vec<f64> {
        self.0.iter().map(|(rank, _)| *rank).collect()
    }
}

impl Serialize for Quantiles {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (rank, error) in &self.0 {
            map.serialize_entry(rank, error)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Quantiles {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct QuantilesVisitor;

        impl<'de> Visitor<'de> for QuantilesVisitor {
            type Value = Quantiles;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping of quantile rank to allowed error")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::new();
                while let Some((rank, error)) = access.next_entry::<f64, f64>()? {
                    entries.push((rank, error));
                }
                Ok(Quantiles(entries))
            }
        }

        deserializer.deserialize_map(QuantilesVisitor)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cert: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Http,
            host: String::new(),
            port: 0,
            cert: String::new(),
            key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Https,
}

/// Loads a config file, migrating historical schema versions, applying
/// defaults and validating. The second element is a warning to print on
/// stderr, if any.
pub fn load_file(path: impl AsRef<Path>) -> Result<(Config, Option<String>), ConfigError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    load_str(&content)
}

pub fn load_str(content: &str) -> Result<(Config, Option<String>), ConfigError> {
    let (version, warning) = find_version(content)?;
    let mut config = match version {
        1 => v1::unmarshal(content)?,
        2 => v2::unmarshal(content)?,
        3 => serde_yaml::from_str(content).map_err(ConfigError::Yaml)?,
        v => return Err(ConfigError::UnsupportedVersion(v)),
    };
    config.normalize()?;
    Ok((config, warning))
}

/// Reads `global.config_version` without committing to a schema. A file
/// without the field predates versioning and is treated as version 1.
fn find_version(content: &str) -> Result<(u64, Option<String>), ConfigError> {
    let value: serde_yaml::Value = serde_yaml::from_str(content).map_err(ConfigError::Yaml)?;
    let version = value
        .get("global")
        .and_then(|global| global.get("config_version"));
    match version {
        None => Ok((
            1,
            Some(
                "WARNING: 'global.config_version' not found in config file, assuming version 1. \
                 Please upgrade your configuration."
                    .to_string(),
            ),
        )),
        Some(serde_yaml::Value::Number(n)) => match n.as_u64() {
            Some(v @ 1..=2) => Ok((
                v,
                Some(format!(
                    "WARNING: 'config_version: {}' is deprecated, please upgrade your \
                     configuration to version {}.",
                    v, CURRENT_VERSION
                )),
            )),
            Some(v) => Ok((v, None)),
            None => Err(ConfigError::Invalid(format!(
                "'global.config_version' must be a positive integer, got '{:?}'",
                n
            ))),
        },
        Some(other) => Err(ConfigError::Invalid(format!(
            "'global.config_version' must be a number, got '{:?}'",
            other
        ))),
    }
}

impl Config {
    /// Applies defaults and validates; the rest of the program only ever sees
    /// a normalized config.
    pub fn normalize(&mut self) -> Result<(), ConfigError> {
        self.global.config_version = CURRENT_VERSION;
        if self.global.input_label_name.is_empty() {
            self.global.input_label_name = DEFAULT_INPUT_LABEL.to_string();
        }
        if self.server.port == 0 {
            self.server.port = DEFAULT_PORT;
        }

        self.validate_inputs()?;
        self.validate_metrics()?;
        self.validate_server()
    }

    fn validate_inputs(&mut self) -> Result<(), ConfigError> {
        if self.inputs.is_empty() {
            return Err(ConfigError::Invalid(
                "'inputs' must contain at least one input".to_string(),
            ));
        }
        for input in &mut self.inputs {
            match input.input_type {
                InputType::File => {
                    if input.path.is_empty() {
                        return Err(ConfigError::Invalid(
                            "inputs of type 'file' require a 'path'".to_string(),
                        ));
                    }
                    if input.id.is_empty() {
                        input.id = input.path.clone();
                    }
                }
                InputType::Stdin => {
                    if !input.path.is_empty() {
                        return Err(ConfigError::Invalid(
                            "inputs of type 'stdin' must not set a 'path'".to_string(),
                        ));
                    }
                    if input.id.is_empty() {
                        input.id = "stdin".to_string();
                    }
                }
            }
        }
        for (i, input) in self.inputs.iter().enumerate() {
            if self.inputs[..i].iter().any(|other| other.id == input.id) {
                return Err(ConfigError::Invalid(format!(
                    "input id '{}' is used more than once",
                    input.id
                )));
            }
        }
        Ok(())
    }

    fn validate_metrics(&self) -> Result<(), ConfigError> {
        if self.metrics.is_empty() {
            return Err(ConfigError::Invalid(
                "'metrics' must contain at least one metric".to_string(),
            ));
        }
        for metric in &self.metrics {
            if metric.name.is_empty() {
                return Err(ConfigError::Invalid(
                    "every metric requires a 'name'".to_string(),
                ));
            }
            let fail = |reason: String| {
                Err(ConfigError::Invalid(format!(
                    "metric '{}': {}",
                    metric.name, reason
                )))
            };
            if metric.help.is_empty() {
                return fail("'help' must not be empty".to_string());
            }
            if metric.match_pattern.is_empty() {
                return fail("'match' must not be empty".to_string());
            }
            match metric.metric_type {
                MetricType::Counter => {}
                MetricType::Gauge | MetricType::Histogram | MetricType::Summary => {
                    if metric.value.is_empty() {
                        return fail(format!(
                            "metrics of type '{}' require a 'value' template",
                            metric.metric_type
                        ));
                    }
                }
            }
            if !metric.buckets.is_empty() && metric.metric_type != MetricType::Histogram {
                return fail("'buckets' can only be configured for histograms".to_string());
            }
            if !metric.quantiles.is_empty() && metric.metric_type != MetricType::Summary {
                return fail("'quantiles' can only be configured for summaries".to_string());
            }
        }
        for (i, metric) in self.metrics.iter().enumerate() {
            if self.metrics[..i].iter().any(|other| other.name == metric.name) {
                return Err(ConfigError::Invalid(format!(
                    "metric name '{}' is used more than once",
                    metric.name
                )));
            }
        }
        Ok(())
    }

    fn validate_server(&self) -> Result<(), ConfigError> {
        match self.server.protocol {
            Protocol::Http => {
                if !self.server.cert.is_empty() || !self.server.key.is_empty() {
                    return Err(ConfigError::Invalid(
                        "'server.cert' and 'server.key' require 'server.protocol: https'"
                            .to_string(),
                    ));
                }
            }
            Protocol::Https => {
                if self.server.cert.is_empty() != self.server.key.is_empty() {
                    return Err(ConfigError::Invalid(
                        "'server.cert' and 'server.key' must either both be configured or neither"
                            .to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE_V3: &str = "
global:
    config_version: 3
inputs:
    - type: file
      path: /var/log/app.log
      readall: true
grok:
    patterns_dir: ./patterns
metrics:
    - type: counter
      name: test_count_total
      help: Dummy help message.
      match: 'user=%{NUM:uid}'
      labels:
          uid: '{{.uid}}'
server:
    protocol: https
    port: 1111
";

    #[test]
    fn loads_v3_without_warning() {
        let (config, warning) = load_str(EXAMPLE_V3).unwrap();
        assert!(warning.is_none());
        assert_eq!(config.global.config_version, 3);
        assert_eq!(config.global.input_label_name, "source");
        assert_eq!(config.inputs.len(), 1);
        assert_eq!(config.inputs[0].id, "/var/log/app.log");
        assert!(config.inputs[0].readall);
        assert_eq!(config.metrics[0].name, "test_count_total");
        assert_eq!(config.server.port, 1111);
    }

    #[test]
    fn version_detection() {
        let cases: &[(&str, u64, bool)] = &[
            ("config_version: 3", 3, false),
            ("config_version: 2", 2, true),
            ("config_version: 1", 1, true),
        ];
        for (replacement, expected, warn) in cases {
            let content = EXAMPLE_V3.replace("config_version: 3", replacement);
            let (version, warning) = find_version(&content).unwrap();
            assert_eq!(version, *expected);
            assert_eq!(warning.is_some(), *warn, "case {}", replacement);
        }
    }

    #[test]
    fn missing_version_assumes_v1_with_warning() {
        let content = EXAMPLE_V3.replace("config_version: 3", "");
        let (version, warning) = find_version(&content).unwrap();
        assert_eq!(version, 1);
        assert!(warning.is_some());
    }

    #[test]
    fn unsupported_version_is_an_error() {
        let content = EXAMPLE_V3.replace("config_version: 3", "config_version: 4");
        assert!(matches!(
            load_str(&content),
            Err(ConfigError::UnsupportedVersion(4))
        ));
    }

    #[test]
    fn non_numeric_version_is_an_error() {
        let content = EXAMPLE_V3.replace("config_version: 3", "config_version: a");
        assert!(matches!(find_version(&content), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn stdin_input_gets_default_id() {
        let content = EXAMPLE_V3
            .replace("type: file", "type: stdin")
            .replace("path: /var/log/app.log", "")
            .replace("readall: true", "");
        let (config, _) = load_str(&content).unwrap();
        assert_eq!(config.inputs[0].id, "stdin");
    }

    #[test]
    fn duplicate_input_ids_are_rejected() {
        let content = EXAMPLE_V3.replace(
            "inputs:\n    - type: file\n      path: /var/log/app.log\n      readall: true",
            "inputs:\n    - type: file\n      path: /var/log/app.log\n    - type: file\n      path: /var/log/app.log",
        );
        assert!(matches!(load_str(&content), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn gauge_without_value_is_rejected() {
        let content = EXAMPLE_V3.replace("type: counter", "type: gauge");
        match load_str(&content) {
            Err(ConfigError::Invalid(msg)) => assert!(msg.contains("value")),
            other => panic!("expected Invalid, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn buckets_only_for_histograms() {
        let content = EXAMPLE_V3.replace(
            "match: 'user=%{NUM:uid}'",
            "match: 'user=%{NUM:uid}'\n      buckets: [1, 2, 3]",
        );
        assert!(matches!(load_str(&content), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn cert_and_key_must_come_together() {
        let content = EXAMPLE_V3.replace("port: 1111", "port: 1111\n    cert: /tmp/cert.pem");
        assert!(matches!(load_str(&content), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn cert_requires_https() {
        let content = EXAMPLE_V3.replace(
            "protocol: https",
            "protocol: http\n    cert: /tmp/c.pem\n    key: /tmp/k.pem",
        );
        assert!(matches!(load_str(&content), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn quantiles_parse_as_float_map() {
        let yaml = "
global:
    config_version: 3
inputs:
    - type: stdin
metrics:
    - type: summary
      name: test_summary
      help: A summary.
      match: 'val=%{NUM:n}'
      value: '{{.n}}'
      quantiles: {0.5: 0.05, 0.9: 0.01}
";
        let (config, _) = load_str(yaml).unwrap();
        assert_eq!(config.metrics[0].quantiles.ranks(), vec![0.5, 0.9]);
    }

    #[test]
    fn normalized_config_round_trips_through_yaml() {
        let (config, _) = load_str(EXAMPLE_V3).unwrap();
        let printed = serde_yaml::to_string(&config).unwrap();
        let reparsed: Config = serde_yaml::from_str(&printed).unwrap();
        assert_eq!(config, reparsed);
    }
}
