//! Line streams over a child process's output pipes
//!
//! Each pipe is drained by a background task that splits it into lines,
//! strips terminal color codes, logs every line, and publishes it on a
//! broadcast channel. The first subscriber receives every line since the
//! pipe was opened; later subscribers get a live tail.

use parking_lot::Mutex;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Lines buffered per subscriber before it starts lagging
const LINE_BUFFER: usize = 1024;

/// Which pipe a stream was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// Why waiting for a line stopped without a match
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LineWaitError {
    /// The pipe closed, usually because the process exited
    #[error("output stream ended before a matching line was seen")]
    EndOfStream,
    /// No matching line arrived in time
    #[error("no matching line within {} ms", .0.as_millis())]
    Timeout(Duration),
}

/// A live, line-buffered view of one output pipe
pub struct LineStream {
    kind: StreamKind,
    /// Buffered since spawn, handed to the first subscriber
    first: Mutex<Option<broadcast::Receiver<String>>>,
    tail: broadcast::Receiver<String>,
}

impl LineStream {
    /// Start draining `reader` in the background
    pub fn spawn<R>(reader: R, kind: StreamKind) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, first) = broadcast::channel(LINE_BUFFER);
        let tail = tx.subscribe();
        tokio::spawn(pump_lines(reader, kind, tx));
        Self {
            kind,
            first: Mutex::new(Some(first)),
            tail,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Subscribe to the stream.
    ///
    /// The first call returns a receiver holding every line since spawn (up
    /// to the channel capacity). Later calls only see lines published after
    /// the call.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        match self.first.lock().take() {
            Some(first) => first,
            None => self.tail.resubscribe(),
        }
    }
}

async fn pump_lines<R>(reader: R, kind: StreamKind, tx: broadcast::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let stream = kind.as_str();
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let raw = String::from_utf8_lossy(&buf);
                let line = strip_ansi(raw.trim_end_matches(&['\r', '\n'][..]));

                if !line.trim().is_empty() {
                    match kind {
                        StreamKind::Stdout => info!(target: "devserver", stream, "{}", line),
                        StreamKind::Stderr => error!(target: "devserver", stream, "{}", line),
                    }
                }

                // Nobody listening is normal once readiness has been decided
                let _ = tx.send(line);
            }
            Err(e) => {
                debug!(stream, error = %e, "Failed to read dev server output");
                break;
            }
        }
    }

    debug!(stream, "Dev server output closed");
}

fn ansi_escape() -> &'static Regex {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    ANSI.get_or_init(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("valid ANSI escape pattern"))
}

/// Remove terminal color and cursor sequences from a line
pub fn strip_ansi(line: &str) -> String {
    ansi_escape().replace_all(line, "").into_owned()
}

/// Read lines until one satisfies `predicate`, the stream ends, or `timeout` elapses.
pub async fn wait_for_line<F>(
    rx: &mut broadcast::Receiver<String>,
    mut predicate: F,
    timeout: Duration,
) -> Result<String, LineWaitError>
where
    F: FnMut(&str) -> bool,
{
    let search = async {
        loop {
            match rx.recv().await {
                Ok(line) if predicate(&line) => return Ok(line),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Line reader fell behind, skipped lines");
                }
                Err(RecvError::Closed) => return Err(LineWaitError::EndOfStream),
            }
        }
    };

    tokio::time::timeout(timeout, search)
        .await
        .unwrap_or(Err(LineWaitError::Timeout(timeout)))
}

/// Wait for a line matching `pattern`
pub async fn wait_for_match(
    rx: &mut broadcast::Receiver<String>,
    pattern: &Regex,
    timeout: Duration,
) -> Result<String, LineWaitError> {
    wait_for_line(rx, |line| pattern.is_match(line), timeout).await
}

/// Accumulates every line of a stream into text, for error reports
pub struct CapturedLines {
    text: Arc<Mutex<String>>,
    task: JoinHandle<()>,
}

impl CapturedLines {
    pub fn start(mut rx: broadcast::Receiver<String>) -> Self {
        let text = Arc::new(Mutex::new(String::new()));
        let sink = Arc::clone(&text);

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(line) => {
                        let mut text = sink.lock();
                        text.push_str(&line);
                        text.push('\n');
                    }
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Self { text, task }
    }

    /// Text captured so far
    pub fn snapshot(&self) -> String {
        self.text.lock().clone()
    }

    /// Wait up to `grace` for the stream to close, then return everything captured
    pub async fn finish(mut self, grace: Duration) -> String {
        let _ = tokio::time::timeout(grace, &mut self.task).await;
        self.snapshot()
    }
}

impl Drop for CapturedLines {
    fn drop(&mut self) {
        self.task.abort();
    }
}
