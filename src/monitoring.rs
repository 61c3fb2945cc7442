// SPDX-License-Identifier: Apache-2.0

//! Built-in metrics about the exporter itself. Every label combination that
//! can occur is initialized to zero at startup so the series are visible in
//! scrapes before the first matching line arrives.

use prometheus::{CounterVec, GaugeVec, Opts, Registry};

use crate::metrics::summary::SummaryVec;

pub const STATUS_MATCHED: &str = "matched";
pub const STATUS_IGNORED: &str = "ignored";

#[derive(Clone)]
pub struct SelfMonitoring {
    lines_total: CounterVec,
    lines_matching: CounterVec,
    processing_time: CounterVec,
    processing_errors: CounterVec,
    buffer_load: SummaryVec,
    build_info: GaugeVec,
}

impl SelfMonitoring {
    pub fn new(input_label_name: &str) -> Result<Self, prometheus::Error> {
        let lines_total = CounterVec::new(
            Opts::new(
                "grokmetrics_lines_total",
                "Total number of log lines processed by grokmetrics.",
            ),
            &[input_label_name, "status"],
        )?;
        let lines_matching = CounterVec::new(
            Opts::new(
                "grokmetrics_lines_matching_total",
                "Number of lines matched for each metric. Note that one line can be matched by multiple metrics.",
            ),
            &[input_label_name, "metric"],
        )?;
        let processing_time = CounterVec::new(
            Opts::new(
                "grokmetrics_lines_processing_time_microseconds_total",
                "Processing time in microseconds for each metric. Divide by grokmetrics_lines_matching_total to get the average processing time for one log line.",
            ),
            &[input_label_name, "metric"],
        )?;
        let processing_errors = CounterVec::new(
            Opts::new(
                "grokmetrics_line_processing_errors_total",
                "Number of errors for each metric. If this is > 0 there is an error in the configuration file. Check grokmetrics' console output.",
            ),
            &[input_label_name, "metric"],
        )?;
        let buffer_load = SummaryVec::new(
            "grokmetrics_line_buffer_peak_load",
            "Number of lines that are read from the log source and waiting to be processed. Peak value per second.",
            &[input_label_name],
            &[],
        )?;
        let build_info = GaugeVec::new(
            Opts::new(
                "grokmetrics_build_info",
                "A metric with a constant '1' value labeled by version, builddate, branch, revision, rustversion, and platform on which grokmetrics was built.",
            ),
            &[
                "version",
                "builddate",
                "branch",
                "revision",
                "rustversion",
                "platform",
            ],
        )?;

        Ok(Self {
            lines_total,
            lines_matching,
            processing_time,
            processing_errors,
            buffer_load,
            build_info,
        })
    }

    pub fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.lines_total.clone()))?;
        registry.register(Box::new(self.lines_matching.clone()))?;
        registry.register(Box::new(self.processing_time.clone()))?;
        registry.register(Box::new(self.processing_errors.clone()))?;
        registry.register(Box::new(self.buffer_load.clone()))?;
        registry.register(Box::new(self.build_info.clone()))
    }

    /// Creates every (source, metric) series with a zero value.
    pub fn zero_init(&self, sources: &[String], metric_names: &[String]) {
        for source in sources {
            let source = source.as_str();
            self.lines_total
                .with_label_values(&[source, STATUS_MATCHED])
                .inc_by(0.0);
            self.lines_total
                .with_label_values(&[source, STATUS_IGNORED])
                .inc_by(0.0);
            self.buffer_load.ensure(&[source]);
            for metric in metric_names {
                let metric = metric.as_str();
                self.lines_matching
                    .with_label_values(&[source, metric])
                    .inc_by(0.0);
                self.processing_time
                    .with_label_values(&[source, metric])
                    .inc_by(0.0);
                self.processing_errors
                    .with_label_values(&[source, metric])
                    .inc_by(0.0);
            }
        }
    }

    pub fn set_build_info(&self, version: &str) {
        let platform = format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH);
        self.build_info
            .with_label_values(&[
                version,
                option_env!("GROKMETRICS_BUILD_DATE").unwrap_or("unknown"),
                option_env!("GROKMETRICS_BUILD_BRANCH").unwrap_or("unknown"),
                option_env!("GROKMETRICS_BUILD_REVISION").unwrap_or("unknown"),
                option_env!("GROKMETRICS_BUILD_RUSTC").unwrap_or("unknown"),
                platform.as_str(),
            ])
            .set(1.0);
    }

    pub fn observe_line(&self, source: &str, matched: bool) {
        let status = if matched {
            STATUS_MATCHED
        } else {
            STATUS_IGNORED
        };
        self.lines_total.with_label_values(&[source, status]).inc();
    }

    pub fn observe_match(&self, source: &str, metric: &str, micros: f64) {
        self.lines_matching
            .with_label_values(&[source, metric])
            .inc();
        self.processing_time
            .with_label_values(&[source, metric])
            .inc_by(micros);
    }

    pub fn observe_error(&self, source: &str, metric: &str) {
        self.processing_errors
            .with_label_values(&[source, metric])
            .inc();
    }

    /// Summary fed by the fan-in with per-second buffer depth peaks.
    pub fn buffer_load(&self) -> SummaryVec {
        self.buffer_load.clone()
    }
}
