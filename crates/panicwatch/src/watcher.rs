//! The watcher side of the relaunch
//!
//! Runs single-threaded inside the re-executed process. Its stdin is the
//! read end of the pipe the application's stderr now points at, its stdout
//! is the application's original stderr. Every chunk read is forwarded to
//! stdout first and then appended to the capture buffer, until the
//! application exits and the pipe closes.

use std::io::{self, Read, Write};
use std::process;

use thiserror::Error;

use panicwatch_core::{find_last_record, FailureRecord, RingBuffer};

use crate::config::{Config, WatchOptions};
use crate::role;
use crate::signals::SuspendedSignals;

/// Watcher exit status after the stream closed, record or not
pub const EXIT_CLEAN: i32 = 0;

/// Watcher exit status after a read or write failure during capture
pub const EXIT_IO_ERROR: i32 = 1;

/// Errors the watcher can hit while capturing
#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("Failed to read captured stderr: {0}")]
    Read(#[source] io::Error),

    #[error("Failed to forward captured stderr: {0}")]
    Write(#[source] io::Error),
}

/// Tee state: the capture buffer and the read chunk size
pub struct Watcher {
    buffer: RingBuffer,
    chunk_size: usize,
}

impl Watcher {
    pub fn new(options: &WatchOptions) -> Self {
        Self {
            buffer: RingBuffer::new(options.capture_window_bytes),
            chunk_size: options.tee_chunk_bytes,
        }
    }

    /// Forward `input` to `output` and the capture buffer until end-of-stream.
    ///
    /// Returns the number of bytes forwarded.
    pub fn capture<R: Read, W: Write>(
        &mut self,
        mut input: R,
        mut output: W,
    ) -> Result<u64, WatcherError> {
        let mut chunk = vec![0u8; self.chunk_size];
        let mut total = 0u64;

        loop {
            let n = match input.read(&mut chunk) {
                Ok(0) => return Ok(total),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(WatcherError::Read(e)),
            };

            output
                .write_all(&chunk[..n])
                .and_then(|()| output.flush())
                .map_err(WatcherError::Write)?;
            self.buffer.write(&chunk[..n]);
            total += n as u64;
        }
    }

    /// The last failure record in the captured window, if any
    pub fn finalize(&self) -> Option<FailureRecord> {
        find_last_record(&self.buffer.snapshot())
    }
}

/// Run the watcher process to completion. Never returns.
pub(crate) fn run(config: Config) -> ! {
    let Config {
        options,
        on_failure,
        on_watcher_error,
        ..
    } = config;

    role::clear_marker();
    let mut signals = SuspendedSignals::ignore_all();

    log::debug!(
        "Watcher PID {} capturing (window {} bytes, chunk {} bytes)",
        process::id(),
        options.capture_window_bytes,
        options.tee_chunk_bytes
    );

    let mut watcher = Watcher::new(&options);
    let result = watcher.capture(io::stdin().lock(), io::stdout().lock());

    match result {
        Ok(total) => {
            log::debug!("Captured stream closed after {} bytes", total);
            if let Some(record) = watcher.finalize() {
                log::debug!("Detected {} record: {}", record.kind(), record.message());
                signals.restore_child_exit();
                if let Some(on_failure) = on_failure {
                    on_failure(record);
                }
            }
            process::exit(EXIT_CLEAN)
        }
        Err(err) => {
            log::debug!("Watcher failed: {}", err);
            if let Some(on_watcher_error) = on_watcher_error {
                signals.restore_child_exit();
                on_watcher_error(err);
            }
            process::exit(EXIT_IO_ERROR)
        }
    }
}
