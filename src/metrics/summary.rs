// SPDX-License-Identifier: Apache-2.0

//! Label-keyed summary collector.
//!
//! The prometheus crate ships counter, gauge and histogram vectors but no
//! summary. This collector keeps an exact observation count and sum per label
//! tuple and estimates the configured quantile ranks from a bounded window of
//! the most recent observations, sorted at scrape time. Without configured
//! quantiles it exposes only `_count` and `_sum`, which is a valid summary.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use prometheus::core::{Collector, Desc};
use prometheus::proto;

/// Observations retained per label tuple for quantile estimation.
const SAMPLE_WINDOW: usize = 1024;

#[derive(Clone)]
pub struct SummaryVec {
    inner: Arc<Inner>,
}

struct Inner {
    desc: Desc,
    name: String,
    help: String,
    label_names: Vec<String>,
    /// Quantile ranks to expose, e.g. [0.5, 0.9, 0.99].
    quantiles: Vec<f64>,
    children: Mutex<HashMap<Vec<String>, Child>>,
}

#[derive(Default)]
struct Child {
    count: u64,
    sum: f64,
    window: VecDeque<f64>,
}

impl SummaryVec {
    pub fn new(
        name: &str,
        help: &str,
        label_names: &[&str],
        quantiles: &[f64],
    ) -> Result<Self, prometheus::Error> {
        let desc = Desc::new(
            name.to_string(),
            help.to_string(),
            label_names.iter().map(|s| s.to_string()).collect(),
            HashMap::new(),
        )?;
        let mut quantiles = quantiles.to_vec();
        quantiles.sort_by(|a, b| a.total_cmp(b));
        Ok(Self {
            inner: Arc::new(Inner {
                desc,
                name: name.to_string(),
                help: help.to_string(),
                label_names: label_names.iter().map(|s| s.to_string()).collect(),
                quantiles,
                children: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Creates the series for a label tuple without recording an observation,
    /// so the labels show up in scrapes before first use.
    pub fn ensure(&self, label_values: &[&str]) {
        if let Ok(mut children) = self.inner.children.lock() {
            children
                .entry(label_values.iter().map(|s| s.to_string()).collect())
                .or_default();
        }
    }

    pub fn observe(&self, label_values: &[&str], value: f64) {
        if let Ok(mut children) = self.inner.children.lock() {
            let child = children
                .entry(label_values.iter().map(|s| s.to_string()).collect())
                .or_default();
            child.count += 1;
            child.sum += value;
            if child.window.len() == SAMPLE_WINDOW {
                child.window.pop_front();
            }
            child.window.push_back(value);
        }
    }
}

impl Child {
    fn quantile(&self, sorted: &[f64], rank: f64) -> f64 {
        if sorted.is_empty() {
            return f64::NAN;
        }
        let position = rank * (sorted.len() - 1) as f64;
        sorted[position.round() as usize]
    }
}

impl Collector for SummaryVec {
    fn desc(&self) -> Vec<&Desc> {
        vec![&self.inner.desc]
    }

    fn collect(&self) -> Vec<proto::MetricFamily> {
        let Ok(children) = self.inner.children.lock() else {
            return Vec::new();
        };

        let mut family = proto::MetricFamily::default();
        family.set_name(self.inner.name.clone());
        family.set_help(self.inner.help.clone());
        family.set_field_type(proto::MetricType::SUMMARY);

        for (values, child) in children.iter() {
            let mut metric = proto::Metric::default();
            for (name, value) in self.inner.label_names.iter().zip(values) {
                let mut pair = proto::LabelPair::default();
                pair.set_name(name.clone());
                pair.set_value(value.clone());
                metric.mut_label().push(pair);
            }

            let mut summary = proto::Summary::default();
            summary.set_sample_count(child.count);
            summary.set_sample_sum(child.sum);
            if !self.inner.quantiles.is_empty() {
                let mut sorted: Vec<f64> = child.window.iter().copied().collect();
                sorted.sort_by(|a, b| a.total_cmp(b));
                for rank in &self.inner.quantiles {
                    let mut q = proto::Quantile::default();
                    q.set_quantile(*rank);
                    q.set_value(child.quantile(&sorted, *rank));
                    summary.mut_quantile().push(q);
                }
            }
            metric.set_summary(summary);
            family.mut_metric().push(metric);
        }

        vec![family]
    }
}
