// SPDX-License-Identifier: Apache-2.0

//! Standard-input tailer. Reading happens on a dedicated thread since stdin
//! has no non-blocking line interface; end of input surfaces as an error so
//! the process terminates rather than idling on a closed pipe.

use std::io::{self, BufRead};

use tokio_util::sync::CancellationToken;

use super::{Tailer, LINE_BUFFER_SIZE};
use crate::bounded_channel::bounded;

pub fn run_stdin_tailer() -> Tailer {
    let (line_tx, line_rx) = bounded(LINE_BUFFER_SIZE);
    let (error_tx, error_rx) = bounded(1);
    let cancel = CancellationToken::new();

    let reader_cancel = cancel.clone();
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            if reader_cancel.is_cancelled() {
                return;
            }
            match line {
                Ok(line) => {
                    if line_tx.send_blocking(line).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = error_tx.send_blocking(e);
                    return;
                }
            }
        }
        let _ = error_tx.send_blocking(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "standard input closed",
        ));
    });

    Tailer::new(line_rx, error_rx, cancel)
}
