// SPDX-License-Identifier: Apache-2.0

//! Polling file tailer.
//!
//! A dedicated OS thread reads appended data, assembles complete lines
//! (a trailing fragment without a newline is held back until the writer
//! finishes it) and pushes them into the line channel with a blocking send,
//! so a full buffer pauses reading instead of dropping lines.
//!
//! Between polls the reader detects truncation (file shrank below the read
//! offset) and rotation (the path now names a different file) and restarts
//! from the beginning of the new content.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Tailer, LINE_BUFFER_SIZE};
use crate::bounded_channel::{bounded, BoundedSender};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Starts tailing `path` on a background thread. With `readall` the file is
/// consumed from the start, otherwise only lines appended after startup are
/// delivered.
pub fn run_file_tailer(path: impl Into<PathBuf>, readall: bool, poll_interval: Duration) -> Tailer {
    let path = path.into();
    let (line_tx, line_rx) = bounded(LINE_BUFFER_SIZE);
    let (error_tx, error_rx) = bounded(1);
    let cancel = CancellationToken::new();

    let reader_cancel = cancel.clone();
    std::thread::spawn(move || {
        if let Err(e) = tail(&path, readall, poll_interval, &line_tx, &reader_cancel) {
            // Tailer errors are fatal for the whole process; park the error
            // on the channel and let the reader thread end.
            let _ = error_tx.send_blocking(e);
        }
    });

    Tailer::new(line_rx, error_rx, cancel)
}

fn tail(
    path: &Path,
    readall: bool,
    poll_interval: Duration,
    lines: &BoundedSender<String>,
    cancel: &CancellationToken,
) -> io::Result<()> {
    let file = File::open(path)?;
    let mut file_id = id_of(&file)?;
    let mut offset = if readall {
        0
    } else {
        file.metadata()?.len()
    };
    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(offset))?;

    // bytes of an unterminated final line, carried across polls
    let mut partial: Vec<u8> = Vec::new();

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        loop {
            let mut chunk = Vec::new();
            let read = reader.read_until(b'\n', &mut chunk)?;
            if read == 0 {
                break;
            }
            offset += read as u64;
            partial.extend_from_slice(&chunk);
            if partial.ends_with(b"\n") {
                let line = take_line(&mut partial);
                if lines.send_blocking(line).is_err() {
                    return Ok(());
                }
            }
        }

        let current_len = reader.get_ref().metadata()?.len();
        if current_len < offset {
            debug!(path = %path.display(), "file was truncated, seeking to start");
            reader.seek(SeekFrom::Start(0))?;
            offset = 0;
            partial.clear();
        }

        // The path may point at a new file after rotation. The old handle is
        // already drained above, so switch over and read the replacement from
        // the start. A briefly missing path means the rotation is still in
        // progress; keep polling the old handle until the new file appears.
        if let Ok(metadata) = std::fs::metadata(path) {
            if file_metadata_id(&metadata) != file_id {
                debug!(path = %path.display(), "file was rotated, reopening");
                let file = File::open(path)?;
                file_id = id_of(&file)?;
                offset = 0;
                partial.clear();
                reader = BufReader::new(file);
            }
        }

        std::thread::sleep(poll_interval);
    }
}

fn take_line(buffer: &mut Vec<u8>) -> String {
    buffer.pop(); // trailing \n
    if buffer.ends_with(b"\r") {
        buffer.pop();
    }
    let line = String::from_utf8_lossy(buffer.as_slice()).into_owned();
    buffer.clear();
    line
}

fn id_of(file: &File) -> io::Result<u64> {
    Ok(file_metadata_id(&file.metadata()?))
}

#[cfg(unix)]
fn file_metadata_id(metadata: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

#[cfg(not(unix))]
fn file_metadata_id(_metadata: &std::fs::Metadata) -> u64 {
    // rotation detection relies on inode identity and is unix-only
    0
}
