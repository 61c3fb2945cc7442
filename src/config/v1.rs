// SPDX-License-Identifier: Apache-2.0

//! Schema version 1, from before the global section existed. Its `value`
//! field and label list name Grok fields directly; the conversion wraps them
//! in `{{.field}}` templates and chains through the v2 migrator.

use std::collections::BTreeMap;

use serde::Deserialize;

use super::v2::{ConfigV2, InputV2, MetricV2};
use super::{Config, ConfigError, GlobalConfig, GrokConfig, Quantiles, ServerConfig};
use crate::config::MetricType;

pub fn unmarshal(content: &str) -> Result<Config, ConfigError> {
    let v1: ConfigV1 = serde_yaml::from_str(content).map_err(ConfigError::Yaml)?;
    Ok(v1.into_v2().into_v3())
}

#[derive(Debug, Default, Deserialize)]
struct ConfigV1 {
    #[serde(default)]
    input: Option<InputV2>,
    #[serde(default)]
    grok: GrokConfig,
    #[serde(default)]
    metrics: Vec<MetricV1>,
    #[serde(default)]
    server: ServerConfig,
}

#[derive(Debug, Default, Deserialize)]
struct MetricV1 {
    #[serde(rename = "type", default)]
    metric_type: MetricType,
    #[serde(default)]
    name: String,
    #[serde(default)]
    help: String,
    #[serde(rename = "match", default)]
    match_pattern: String,
    /// Name of the Grok field holding the value, not a template.
    #[serde(default)]
    value: String,
    #[serde(default)]
    cumulative: bool,
    #[serde(default)]
    buckets: Vec<f64>,
    #[serde(default)]
    quantiles: Quantiles,
    #[serde(default)]
    labels: Vec<LabelV1>,
}

#[derive(Debug, Default, Deserialize)]
struct LabelV1 {
    #[serde(default)]
    grok_field_name: String,
    #[serde(default)]
    prometheus_label: String,
}

impl ConfigV1 {
    fn into_v2(self) -> ConfigV2 {
        ConfigV2 {
            global: GlobalConfig::default(),
            input: self.input,
            grok: self.grok,
            metrics: self.metrics.into_iter().map(MetricV1::into_v2).collect(),
            server: self.server,
        }
    }
}

impl MetricV1 {
    fn into_v2(self) -> MetricV2 {
        let labels: BTreeMap<String, String> = self
            .labels
            .into_iter()
            .map(|label| (label.prometheus_label, field_template(&label.grok_field_name)))
            .collect();
        MetricV2 {
            metric_type: self.metric_type,
            name: self.name,
            help: self.help,
            match_pattern: self.match_pattern,
            value: field_template(&self.value),
            cumulative: self.cumulative,
            buckets: self.buckets,
            quantiles: self.quantiles,
            labels,
        }
    }
}

fn field_template(grok_field_name: &str) -> String {
    if grok_field_name.is_empty() {
        String::new()
    } else {
        format!("{{{{.{}}}}}", grok_field_name)
    }
}
