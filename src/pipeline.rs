// SPDX-License-Identifier: Apache-2.0

//! The dispatch loop: the single consumer of the merged event stream.
//!
//! Every line is applied to every metric in declared order. Per-line
//! template and value errors are logged and counted but never stop the
//! loop; a tailer or server error is fatal and makes the loop return, which
//! terminates the process with a non-zero exit code.

use std::time::Instant;

use thiserror::Error;
use tracing::warn;

use crate::bounded_channel::BoundedReceiver;
use crate::metrics::{LineOutcome, Metric};
use crate::monitoring::SelfMonitoring;
use crate::tail::multi::{LineEvent, MultiTailer};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("server error: {0}")]
    Server(String),

    #[error("error reading log lines from {path}: {error}")]
    Tailer {
        path: String,
        error: std::io::Error,
    },
}

pub struct Pipeline {
    metrics: Vec<Metric>,
    monitor: SelfMonitoring,
}

impl Pipeline {
    pub fn new(metrics: Vec<Metric>, monitor: SelfMonitoring) -> Self {
        Self { metrics, monitor }
    }

    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    /// Consumes merged events until a fatal error arrives or every source has
    /// ended. Runs on the current task only; the monitoring vectors are the
    /// single piece of state shared with the scrape server.
    pub async fn run(
        &self,
        multi: &mut MultiTailer,
        server_errors: &mut BoundedReceiver<String>,
    ) -> Result<(), RunError> {
        let mut lines_open = true;
        let mut errors_open = true;

        while lines_open || errors_open {
            tokio::select! {
                biased;

                message = server_errors.next() => {
                    let message = message
                        .unwrap_or_else(|| "server terminated unexpectedly".to_string());
                    return Err(RunError::Server(message));
                }

                event = multi.errors.next(), if errors_open => match event {
                    Some(event) => {
                        return Err(RunError::Tailer {
                            path: event.source,
                            error: event.error,
                        });
                    }
                    None => errors_open = false,
                },

                event = multi.lines.next(), if lines_open => match event {
                    Some(event) => self.dispatch(&event),
                    None => lines_open = false,
                },
            }
        }
        Ok(())
    }

    /// Applies every metric to one line and updates the self-monitoring
    /// counters. `lines_total` is incremented exactly once per line, no
    /// matter how many metrics matched it.
    fn dispatch(&self, event: &LineEvent) {
        let mut matched = false;
        for metric in &self.metrics {
            let start = Instant::now();
            let outcome = metric.process(&event.source, &event.line);
            if let LineOutcome::Skipped(error) = &outcome {
                warn!("skipping log line: {}", error);
                warn!("{}", event.line);
                self.monitor.observe_error(&event.source, metric.name());
            }
            if outcome.matched() {
                matched = true;
                self.monitor.observe_match(
                    &event.source,
                    metric.name(),
                    start.elapsed().as_micros() as f64,
                );
            }
        }
        self.monitor.observe_line(&event.source, matched);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounded_channel::{bounded, BoundedSender};
    use crate::config::{MetricConfig, MetricType, Quantiles};
    use crate::grok::Patterns;
    use crate::monitoring::{STATUS_IGNORED, STATUS_MATCHED};
    use crate::tail::Tailer;
    use prometheus::Registry;
    use std::collections::{BTreeMap, HashMap};
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    fn patterns() -> Patterns {
        let mut p = Patterns::new();
        p.add("NUM", "[0-9]+").unwrap();
        p
    }

    fn counter_metric(name: &str, pattern: &str) -> MetricConfig {
        MetricConfig {
            metric_type: MetricType::Counter,
            name: name.to_string(),
            help: format!("{} counter.", name),
            match_pattern: pattern.to_string(),
            value: String::new(),
            cumulative: false,
            buckets: Vec::new(),
            quantiles: Quantiles::default(),
            labels: BTreeMap::new(),
        }
    }

    struct Harness {
        registry: Registry,
        lines: BoundedSender<String>,
        errors: BoundedSender<std::io::Error>,
        handle: tokio::task::JoinHandle<Result<(), RunError>>,
    }

    fn start(metric_configs: Vec<MetricConfig>) -> Harness {
        let patterns = patterns();
        let registry = Registry::new();
        let monitor = SelfMonitoring::new("source").unwrap();
        monitor.register(&registry).unwrap();

        let mut metrics = Vec::new();
        for cfg in &metric_configs {
            let metric = Metric::build("source", cfg, &patterns).unwrap();
            metric.register(&registry).unwrap();
            metrics.push(metric);
        }
        monitor.zero_init(
            &["s1".to_string()],
            &metric_configs.iter().map(|m| m.name.clone()).collect::<Vec<_>>(),
        );

        let (line_tx, line_rx) = bounded(16);
        let (error_tx, error_rx) = bounded(1);
        let tailer = Tailer::new(line_rx, error_rx, CancellationToken::new());
        let mut multi = MultiTailer::run(HashMap::from([("s1".to_string(), tailer)]), None);

        let (_server_tx, mut server_rx) = bounded::<String>(1);
        let pipeline = Pipeline::new(metrics, monitor);
        let handle = tokio::spawn(async move {
            let result = pipeline.run(&mut multi, &mut server_rx).await;
            drop(_server_tx);
            result
        });

        Harness {
            registry,
            lines: line_tx,
            errors: error_tx,
            handle,
        }
    }

    fn counter_value(registry: &Registry, name: &str, labels: &[(&str, &str)]) -> f64 {
        let families = registry.gather();
        let family = families
            .iter()
            .find(|f| f.get_name() == name)
            .unwrap_or_else(|| panic!("metric family {} not found", name));
        'metric: for metric in family.get_metric() {
            for (k, v) in labels {
                if !metric
                    .get_label()
                    .iter()
                    .any(|l| l.get_name() == *k && l.get_value() == *v)
                {
                    continue 'metric;
                }
            }
            return metric.get_counter().get_value();
        }
        panic!("no series with labels {:?}", labels)
    }

    async fn finish(harness: Harness) -> (Registry, Result<(), RunError>) {
        drop(harness.lines);
        drop(harness.errors);
        let result = timeout(Duration::from_secs(5), harness.handle)
            .await
            .expect("pipeline did not finish")
            .expect("pipeline task panicked");
        (harness.registry, result)
    }

    #[tokio::test]
    async fn matched_line_updates_metric_and_totals() {
        let harness = start(vec![counter_metric("user_logins_total", "user=%{NUM:uid}")]);

        harness.lines.send("user=42".to_string()).await.unwrap();

        let (registry, result) = finish(harness).await;
        assert!(result.is_ok());
        assert_eq!(
            counter_value(&registry, "user_logins_total", &[("source", "s1")]),
            1.0
        );
        assert_eq!(
            counter_value(
                &registry,
                "grokmetrics_lines_total",
                &[("source", "s1"), ("status", STATUS_MATCHED)]
            ),
            1.0
        );
        assert_eq!(
            counter_value(
                &registry,
                "grokmetrics_lines_matching_total",
                &[("source", "s1"), ("metric", "user_logins_total")]
            ),
            1.0
        );
    }

    #[tokio::test]
    async fn unmatched_line_counts_as_ignored() {
        let harness = start(vec![counter_metric("user_logins_total", "user=%{NUM:uid}")]);

        harness.lines.send("hello world".to_string()).await.unwrap();

        let (registry, result) = finish(harness).await;
        assert!(result.is_ok());
        assert_eq!(
            counter_value(
                &registry,
                "grokmetrics_lines_total",
                &[("source", "s1"), ("status", STATUS_IGNORED)]
            ),
            1.0
        );
        assert_eq!(
            counter_value(
                &registry,
                "grokmetrics_lines_total",
                &[("source", "s1"), ("status", STATUS_MATCHED)]
            ),
            0.0
        );
    }

    #[tokio::test]
    async fn line_total_counts_once_even_with_multiple_matching_metrics() {
        let harness = start(vec![
            counter_metric("first_total", "n=%{NUM:a}"),
            counter_metric("second_total", "n=%{NUM:b}"),
        ]);

        harness.lines.send("n=7".to_string()).await.unwrap();

        let (registry, result) = finish(harness).await;
        assert!(result.is_ok());
        assert_eq!(
            counter_value(&registry, "first_total", &[("source", "s1")]),
            1.0
        );
        assert_eq!(
            counter_value(&registry, "second_total", &[("source", "s1")]),
            1.0
        );
        // both matched, the line is still one line
        assert_eq!(
            counter_value(
                &registry,
                "grokmetrics_lines_total",
                &[("source", "s1"), ("status", STATUS_MATCHED)]
            ),
            1.0
        );
    }

    #[tokio::test]
    async fn value_error_is_counted_and_other_metrics_continue() {
        let mut gauge = counter_metric("bad_gauge", "val=%{NUM:n} unit=(?P<unit>[a-z]+)");
        gauge.metric_type = MetricType::Gauge;
        gauge.value = "{{.unit}}".to_string(); // renders to a non-number
        let harness = start(vec![
            gauge,
            counter_metric("good_counter_total", "val=%{NUM:n}"),
        ]);

        harness
            .lines
            .send("val=5 unit=ms".to_string())
            .await
            .unwrap();

        let (registry, result) = finish(harness).await;
        assert!(result.is_ok());
        assert_eq!(
            counter_value(
                &registry,
                "grokmetrics_line_processing_errors_total",
                &[("source", "s1"), ("metric", "bad_gauge")]
            ),
            1.0
        );
        // the second metric still processed the same line
        assert_eq!(
            counter_value(&registry, "good_counter_total", &[("source", "s1")]),
            1.0
        );
        // an errored match still counts as matched
        assert_eq!(
            counter_value(
                &registry,
                "grokmetrics_lines_total",
                &[("source", "s1"), ("status", STATUS_MATCHED)]
            ),
            1.0
        );
    }

    #[tokio::test]
    async fn tailer_error_is_fatal() {
        let harness = start(vec![counter_metric("some_total", "x=%{NUM:x}")]);

        harness
            .errors
            .send(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
            .await
            .unwrap();

        let result = timeout(Duration::from_secs(5), harness.handle)
            .await
            .expect("pipeline did not finish")
            .expect("pipeline task panicked");
        match result {
            Err(RunError::Tailer { path, error }) => {
                assert_eq!(path, "s1");
                assert!(error.to_string().contains("boom"));
            }
            other => panic!("expected tailer error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn server_error_is_fatal() {
        let patterns = patterns();
        let registry = Registry::new();
        let monitor = SelfMonitoring::new("source").unwrap();
        monitor.register(&registry).unwrap();
        let metric =
            Metric::build("source", &counter_metric("a_total", "x=%{NUM:x}"), &patterns).unwrap();
        metric.register(&registry).unwrap();

        let (_line_tx, line_rx) = bounded::<String>(1);
        let (_error_tx, error_rx) = bounded(1);
        let tailer = Tailer::new(line_rx, error_rx, CancellationToken::new());
        let mut multi = MultiTailer::run(HashMap::from([("s1".to_string(), tailer)]), None);

        let (server_tx, mut server_rx) = bounded::<String>(1);
        server_tx
            .send("address already in use".to_string())
            .await
            .unwrap();

        let pipeline = Pipeline::new(vec![metric], monitor);
        let result = pipeline.run(&mut multi, &mut server_rx).await;
        match result {
            Err(RunError::Server(message)) => {
                assert!(message.contains("address already in use"))
            }
            other => panic!("expected server error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn processing_time_accumulates_for_matches() {
        let harness = start(vec![counter_metric("timed_total", "t=%{NUM:t}")]);

        for _ in 0..3 {
            harness.lines.send("t=1".to_string()).await.unwrap();
        }

        let (registry, result) = finish(harness).await;
        assert!(result.is_ok());
        assert_eq!(
            counter_value(
                &registry,
                "grokmetrics_lines_matching_total",
                &[("source", "s1"), ("metric", "timed_total")]
            ),
            3.0
        );
        // elapsed time is non-negative and was added once per match
        assert!(
            counter_value(
                &registry,
                "grokmetrics_lines_processing_time_microseconds_total",
                &[("source", "s1"), ("metric", "timed_total")]
            ) >= 0.0
        );
    }
}
