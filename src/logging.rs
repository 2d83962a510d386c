use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

const MAX_LINE_CHARS: usize = 4_000;
const DEFAULT_FLUSH_BYTES: usize = 16 * 1024;
const DEFAULT_MAX_BUFFERED_BYTES: usize = 256 * 1024;

#[derive(Default)]
struct Pending {
    lines: VecDeque<String>,
    bytes: usize,
    dropped: u64,
}

impl Pending {
    fn push_back(&mut self, line: String) {
        self.bytes += line.len();
        self.lines.push_back(line);
    }

    /// Drops the oldest lines until the buffer fits in `max` bytes.
    fn enforce(&mut self, max: usize) {
        while self.bytes > max {
            match self.lines.pop_front() {
                Some(line) => {
                    self.bytes -= line.len();
                    self.dropped += 1;
                }
                None => break,
            }
        }
    }
}

/// Bounded in-memory log buffer appended to a file in batches.
///
/// Lines are flushed once `flush_bytes` have accumulated, or by the timer from
/// [`spawn_flusher`]. A failed flush puts its lines back, so calling
/// [`LogBuffer::flush`] again is always safe. When the file stays unwritable
/// the oldest lines are dropped to stay under `max_buffered_bytes`.
pub struct LogBuffer {
    path: PathBuf,
    flush_bytes: usize,
    max_buffered_bytes: usize,
    pending: Mutex<Pending>,
    // one writer to the file at a time, so batches stay in order
    flushing: Mutex<()>,
}

impl LogBuffer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_limits(path, DEFAULT_FLUSH_BYTES, DEFAULT_MAX_BUFFERED_BYTES)
    }

    pub fn with_limits(path: impl Into<PathBuf>, flush_bytes: usize, max_buffered_bytes: usize) -> Self {
        Self {
            path: path.into(),
            flush_bytes,
            max_buffered_bytes: max_buffered_bytes.max(flush_bytes),
            pending: Mutex::new(Pending::default()),
            flushing: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append(&self, line: &str) {
        let mut line = truncate_line(line.trim_end_matches('\n'));
        line.push('\n');

        let due = {
            let mut pending = self.pending();
            pending.push_back(line);
            pending.enforce(self.max_buffered_bytes);
            pending.bytes >= self.flush_bytes
        };
        if due {
            // stays buffered on failure; the timer tries again
            let _ = self.flush();
        }
    }

    pub fn buffered_bytes(&self) -> usize {
        self.pending().bytes
    }

    pub fn dropped(&self) -> u64 {
        self.pending().dropped
    }

    /// Appends everything buffered to the log file. Returns the bytes written.
    pub fn flush(&self) -> io::Result<usize> {
        let _flushing = self.flushing.lock().unwrap_or_else(PoisonError::into_inner);

        let (lines, dropped) = {
            let mut pending = self.pending();
            if pending.lines.is_empty() && pending.dropped == 0 {
                return Ok(0);
            }
            pending.bytes = 0;
            (std::mem::take(&mut pending.lines), std::mem::take(&mut pending.dropped))
        };

        let mut batch = String::new();
        if dropped > 0 {
            batch.push_str(&format!("[log buffer dropped {dropped} lines]\n"));
        }
        for line in &lines {
            batch.push_str(line);
        }

        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(batch.as_bytes()).and_then(|_| f.flush()));

        match written {
            Ok(()) => Ok(batch.len()),
            Err(e) => {
                let mut pending = self.pending();
                pending.dropped += dropped;
                for line in lines.into_iter().rev() {
                    pending.bytes += line.len();
                    pending.lines.push_front(line);
                }
                pending.enforce(self.max_buffered_bytes);
                Err(e)
            }
        }
    }
}

fn truncate_line(line: &str) -> String {
    if line.len() <= MAX_LINE_CHARS {
        return line.to_string();
    }
    let mut end = MAX_LINE_CHARS;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated {} bytes]", &line[..end], line.len() - end)
}

/// `MakeWriter` handing each formatted event to a [`LogBuffer`].
#[derive(Clone)]
pub struct LogSink {
    buffer: Arc<LogBuffer>,
}

impl LogSink {
    pub fn new(buffer: Arc<LogBuffer>) -> Self {
        Self { buffer }
    }
}

pub struct EventWriter {
    buffer: Arc<LogBuffer>,
    bytes: Vec<u8>,
}

impl Write for EventWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for EventWriter {
    fn drop(&mut self) {
        if !self.bytes.is_empty() {
            self.buffer.append(&String::from_utf8_lossy(&self.bytes));
        }
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = EventWriter;

    fn make_writer(&'a self) -> Self::Writer {
        EventWriter { buffer: self.buffer.clone(), bytes: Vec::new() }
    }
}

/// Flushes `buffer` every `period` until the returned task is aborted.
pub fn spawn_flusher(buffer: Arc<LogBuffer>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let _ = buffer.flush();
        }
    })
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("invalid log filter {filter:?}: {message}")]
    Filter { filter: String, message: String },
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(String),
}

/// Installs the global subscriber writing to `log_dir/observations.log`.
pub fn init(log_dir: &Path, filter: &str) -> Result<Arc<LogBuffer>, LoggingError> {
    let env_filter = EnvFilter::try_new(filter).map_err(|e| LoggingError::Filter {
        filter: filter.to_string(),
        message: e.to_string(),
    })?;
    let buffer = Arc::new(LogBuffer::new(log_dir.join("observations.log")));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(false)
        .with_target(true)
        .with_writer(LogSink::new(buffer.clone()))
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;

    Ok(buffer)
}
