// SPDX-License-Identifier: Apache-2.0

//! Log tailers. Each tailer owns a reader thread and hands back a [`Tailer`]
//! handle delivering complete lines and errors on two bounded channels; the
//! fan-in in [`multi`] merges any number of them into one tagged event
//! stream.

pub mod file;
pub mod multi;
pub mod stdin;

use std::io;

use tokio_util::sync::CancellationToken;

use crate::bounded_channel::BoundedReceiver;

/// Lines buffered between a reader thread and the fan-in. The fan-in samples
/// this queue's depth for the buffer-load summary.
pub const LINE_BUFFER_SIZE: usize = 1024;

/// Handle to one running log source. Dropping the handle alone does not stop
/// the reader; call [`Tailer::close`].
pub struct Tailer {
    pub lines: BoundedReceiver<String>,
    pub errors: BoundedReceiver<io::Error>,
    cancel: CancellationToken,
}

impl Tailer {
    pub fn new(
        lines: BoundedReceiver<String>,
        errors: BoundedReceiver<io::Error>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            lines,
            errors,
            cancel,
        }
    }

    /// Signals the reader to stop. The reader notices on its next poll tick
    /// and releases the source.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}
