// SPDX-License-Identifier: Apache-2.0

//! Schema version 2: a single `input` section instead of the `inputs` list.
//! Everything else already matches version 3.

use std::collections::BTreeMap;

use serde::Deserialize;

use super::{
    Config, ConfigError, GlobalConfig, GrokConfig, InputConfig, InputType, MetricConfig,
    MetricType, Quantiles, ServerConfig, CURRENT_VERSION,
};

pub fn unmarshal(content: &str) -> Result<Config, ConfigError> {
    let v2: ConfigV2 = serde_yaml::from_str(content).map_err(ConfigError::Yaml)?;
    Ok(v2.into_v3())
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ConfigV2 {
    #[serde(default)]
    pub(crate) global: GlobalConfig,
    #[serde(default)]
    pub(crate) input: Option<InputV2>,
    #[serde(default)]
    pub(crate) grok: GrokConfig,
    #[serde(default)]
    pub(crate) metrics: Vec<MetricV2>,
    #[serde(default)]
    pub(crate) server: ServerConfig,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct InputV2 {
    #[serde(rename = "type", default)]
    pub(crate) input_type: InputType,
    #[serde(default)]
    pub(crate) path: String,
    #[serde(default)]
    pub(crate) readall: bool,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct MetricV2 {
    #[serde(rename = "type", default)]
    pub(crate) metric_type: MetricType,
    #[serde(default)]
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) help: String,
    #[serde(rename = "match", default)]
    pub(crate) match_pattern: String,
    #[serde(default)]
    pub(crate) value: String,
    #[serde(default)]
    pub(crate) cumulative: bool,
    #[serde(default)]
    pub(crate) buckets: Vec<f64>,
    #[serde(default)]
    pub(crate) quantiles: Quantiles,
    #[serde(default)]
    pub(crate) labels: BTreeMap<String, String>,
}

impl ConfigV2 {
    /// Pure conversion; defaults and validation happen afterwards on the v3
    /// config.
    pub(crate) fn into_v3(self) -> Config {
        Config {
            global: GlobalConfig {
                config_version: CURRENT_VERSION,
                input_label_name: self.global.input_label_name,
            },
            inputs: self
                .input
                .map(|input| {
                    vec![InputConfig {
                        id: String::new(),
                        input_type: input.input_type,
                        path: input.path,
                        readall: input.readall,
                    }]
                })
                .unwrap_or_default(),
            grok: self.grok,
            metrics: self.metrics.into_iter().map(MetricV2::into_v3).collect(),
            server: self.server,
        }
    }
}

impl MetricV2 {
    pub(crate) fn into_v3(self) -> MetricConfig {
        MetricConfig {
            metric_type: self.metric_type,
            name: self.name,
            help: self.help,
            match_pattern: self.match_pattern,
            value: self.value,
            cumulative: self.cumulative,
            buckets: self.buckets,
            quantiles: self.quantiles,
            labels: self.labels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE_V2: &str = "
global:
    config_version: 2
input:
    type: file
    path: /var/log/syslog
grok:
    patterns_dir: ./patterns
metrics:
    - type: gauge
      name: queue_depth
      help: Current queue depth.
      match: 'depth=%{NUM:d}'
      value: '{{.d}}'
      labels:
          queue: '{{.d}}'
server:
    port: 9144
";

    #[test]
    fn single_input_becomes_one_element_list() {
        let config = unmarshal(EXAMPLE_V2).unwrap();
        assert_eq!(config.global.config_version, CURRENT_VERSION);
        assert_eq!(config.inputs.len(), 1);
        assert_eq!(config.inputs[0].input_type, InputType::File);
        assert_eq!(config.inputs[0].path, "/var/log/syslog");
    }

    #[test]
    fn metric_sections_carry_over() {
        let config = unmarshal(EXAMPLE_V2).unwrap();
        assert_eq!(config.metrics.len(), 1);
        assert_eq!(config.metrics[0].metric_type, MetricType::Gauge);
        assert_eq!(config.metrics[0].value, "{{.d}}");
        assert_eq!(config.metrics[0].labels["queue"], "{{.d}}");
        assert_eq!(config.grok.patterns_dir, "./patterns");
    }
}
