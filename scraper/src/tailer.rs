//! Follows an append-only log and hands each complete line to a parser
//!
//! Game servers write their logs with either `\n` or `\r` line endings, so
//! both are treated as terminators and the empty lines produced by `\r\n`
//! pairs are dropped. At end of input the tailer waits briefly and reads
//! again, picking up whatever the server appended in the meantime.

use log::{debug, error, info};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tokio::time::Duration;

/// Delay before reading again after reaching the end of input
pub const IDLE_DELAY: Duration = Duration::from_millis(10);

const READ_CHUNK: usize = 4096;

/// Consumes log lines, typically a per-game parser feeding the data manager
pub trait LineHandler: Send {
    fn handle_line(&mut self, line: &str);
}

impl<F> LineHandler for F
where
    F: FnMut(&str) + Send,
{
    fn handle_line(&mut self, line: &str) {
        self(line)
    }
}

fn is_terminator(byte: u8) -> bool {
    byte == b'\n' || byte == b'\r'
}

pub struct LineTailer<R> {
    reader: R,
    skip_to_end: bool,
    idle_delay: Duration,
    lines_read: u64,
    pending: Vec<u8>,
}

impl LineTailer<File> {
    /// Opens a log file for tailing.
    pub async fn open(path: impl AsRef<Path>, skip_to_end: bool) -> std::io::Result<Self> {
        let file = File::open(path.as_ref()).await?;
        info!("Tailing {}", path.as_ref().display());
        Ok(Self::new(file, skip_to_end))
    }
}

impl<R: AsyncRead + Unpin> LineTailer<R> {
    /// With `skip_to_end`, everything present before the first end of input
    /// is discarded and only lines appended afterwards are delivered.
    pub fn new(reader: R, skip_to_end: bool) -> Self {
        Self {
            reader,
            skip_to_end,
            idle_delay: IDLE_DELAY,
            lines_read: 0,
            pending: Vec::new(),
        }
    }

    pub fn with_idle_delay(mut self, delay: Duration) -> Self {
        self.idle_delay = delay;
        self
    }

    /// Number of lines delivered so far.
    pub fn lines_read(&self) -> u64 {
        self.lines_read
    }

    /// Reads until `shutdown` flips to true or the reader fails.
    pub async fn run<H: LineHandler>(&mut self, handler: &mut H, mut shutdown: watch::Receiver<bool>) {
        let mut skipping = self.skip_to_end;
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            if *shutdown.borrow() {
                break;
            }

            let n = match self.reader.read(&mut chunk).await {
                Ok(n) => n,
                Err(e) => {
                    error!("Log read failed: {}", e);
                    break;
                }
            };

            if n == 0 {
                if skipping {
                    debug!("Reached end of existing log, following new lines");
                    skipping = false;
                }
                tokio::select! {
                    _ = tokio::time::sleep(self.idle_delay) => {},
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                continue;
            }

            self.pending.extend_from_slice(&chunk[..n]);
            if skipping {
                // Keep only the unterminated tail
                if let Some(last) = self.pending.iter().rposition(|&b| is_terminator(b)) {
                    self.pending.drain(..=last);
                }
                continue;
            }
            self.deliver(handler);
        }
        debug!("Tailer stopped after {} lines", self.lines_read);
    }

    fn deliver<H: LineHandler>(&mut self, handler: &mut H) {
        while let Some(end) = self.pending.iter().position(|&b| is_terminator(b)) {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            let text = String::from_utf8_lossy(&line[..end]);
            if text.trim().is_empty() {
                continue;
            }
            self.lines_read += 1;
            handler.handle_line(&text);
        }
    }
}
