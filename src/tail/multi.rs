// SPDX-License-Identifier: Apache-2.0

//! Multi-source fan-in.
//!
//! One worker task per log source forwards that source's lines and errors
//! into two shared channels, tagging every event with the source id. The
//! output channels are rendezvous channels: a slow consumer exerts
//! backpressure on every source equally and no line is ever dropped here.
//! Per-source ordering is preserved because each worker forwards
//! sequentially; ordering across sources is unspecified.

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Tailer;
use crate::bounded_channel::{rendezvous, BoundedReceiver, BoundedSender};
use crate::metrics::summary::SummaryVec;

/// A line read from one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineEvent {
    pub source: String,
    pub line: String,
}

/// A failure of one source's tailer.
#[derive(Debug)]
pub struct ErrorEvent {
    pub source: String,
    pub error: io::Error,
}

pub struct MultiTailer {
    pub lines: BoundedReceiver<LineEvent>,
    pub errors: BoundedReceiver<ErrorEvent>,
    cancel: CancellationToken,
    // keeps worker tasks alive for the lifetime of the handle
    _workers: JoinSet<()>,
}

impl MultiTailer {
    /// Starts one forwarding worker per tailer. When `buffer_load` is given,
    /// each worker feeds the per-second peak depth of its line buffer into
    /// the summary, labeled with the source id.
    pub fn run(tailers: HashMap<String, Tailer>, buffer_load: Option<SummaryVec>) -> MultiTailer {
        let (line_tx, line_rx) = rendezvous();
        let (error_tx, error_rx) = rendezvous();
        let cancel = CancellationToken::new();

        let mut workers = JoinSet::new();
        for (source, tailer) in tailers {
            workers.spawn(forward(
                source,
                tailer,
                line_tx.clone(),
                error_tx.clone(),
                cancel.clone(),
                buffer_load.clone(),
            ));
        }

        MultiTailer {
            lines: line_rx,
            errors: error_rx,
            cancel,
            _workers: workers,
        }
    }

    /// Stops all workers. Each worker observes the cancellation on its next
    /// loop iteration and closes its tailer before exiting; the merged
    /// channels are left open for the consumer to drain.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

async fn forward(
    source: String,
    mut tailer: Tailer,
    lines_out: BoundedSender<LineEvent>,
    errors_out: BoundedSender<ErrorEvent>,
    cancel: CancellationToken,
    buffer_load: Option<SummaryVec>,
) {
    let mut lines_open = true;
    let mut errors_open = true;
    let mut peak_depth: usize = 0;

    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    while lines_open || errors_open {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                tailer.close();
                debug!(source, "fan-in worker stopped");
                return;
            }

            line = tailer.lines.next(), if lines_open => match line {
                Some(line) => {
                    peak_depth = peak_depth.max(tailer.lines.len() + 1);
                    let event = LineEvent { source: source.clone(), line };
                    if lines_out.send(event).await.is_err() {
                        tailer.close();
                        return;
                    }
                }
                None => lines_open = false,
            },

            error = tailer.errors.next(), if errors_open => match error {
                Some(error) => {
                    let event = ErrorEvent { source: source.clone(), error };
                    if errors_out.send(event).await.is_err() {
                        tailer.close();
                        return;
                    }
                }
                None => errors_open = false,
            },

            _ = tick.tick(), if buffer_load.is_some() => {
                if let Some(load) = &buffer_load {
                    load.observe(&[source.as_str()], peak_depth as f64);
                }
                peak_depth = 0;
            }
        }
    }
}
