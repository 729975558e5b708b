//! Console transcript - bounded output buffer and the console-reader tasks
//!
//! - Ring buffer of the most recent lines with sequential IDs
//! - Every push signals `output_changed` on the [`StatusPublisher`]
//! - Log level parsing via the configurable `log_pattern`

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use super::process::ServerProcess;
use super::status::StatusPublisher;

/// Default number of console lines kept in memory.
pub const DEFAULT_CONSOLE_CAPACITY: usize = 100;

// ─── Line Types ──────────────────────────────────────────────

/// A single line of console output from the server process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsoleLine {
    /// Sequential ID for polling (`GET /api/server/console?since=<id>`)
    pub id: u64,
    /// Unix timestamp (seconds)
    pub timestamp: u64,
    pub source: LineSource,
    pub content: String,
    pub level: LogLevel,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LineSource {
    Stdout,
    Stderr,
    /// Messages from the supervisor itself
    System,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Debug,
}

// ─── Output Buffer ───────────────────────────────────────────

struct LineRing {
    lines: VecDeque<ConsoleLine>,
    next_id: u64,
    capacity: usize,
}

/// Bounded, insertion-ordered console transcript.
///
/// Has its own lock, so console activity never waits on a start/stop
/// transition and the other way round.
pub struct OutputBuffer {
    ring: Mutex<LineRing>,
    publisher: Arc<StatusPublisher>,
}

impl OutputBuffer {
    pub fn new(capacity: usize, publisher: Arc<StatusPublisher>) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(LineRing {
                lines: VecDeque::with_capacity(capacity),
                // 0 = "nothing seen yet" for `since`
                next_id: 1,
                capacity,
            }),
            publisher,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LineRing> {
        // 버퍼 내용은 항상 일관된 상태이므로 poison 상태여도 계속 사용
        self.ring.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a line, evicting the oldest one when full, and signal observers.
    pub fn push(&self, source: LineSource, content: String, level: LogLevel) -> ConsoleLine {
        let line = {
            let mut ring = self.lock();
            let line = ConsoleLine {
                id: ring.next_id,
                timestamp: current_timestamp(),
                source,
                content,
                level,
            };
            ring.next_id += 1;
            if ring.lines.len() >= ring.capacity {
                ring.lines.pop_front();
            }
            ring.lines.push_back(line.clone());
            line
        };
        self.publisher.notify_output_changed();
        line
    }

    /// Owned copy of the whole transcript, oldest first.
    pub fn snapshot(&self) -> Vec<ConsoleLine> {
        self.lock().lines.iter().cloned().collect()
    }

    /// All lines with `id > since_id`.
    pub fn since(&self, since_id: u64) -> Vec<ConsoleLine> {
        self.lock()
            .lines
            .iter()
            .filter(|l| l.id > since_id)
            .cloned()
            .collect()
    }

    pub fn last_id(&self) -> Option<u64> {
        self.lock().lines.back().map(|l| l.id)
    }
}

// ─── Console Reader ──────────────────────────────────────────

/// Newline-delimited reader that tolerates invalid UTF-8.
///
/// Partial input stays in `buf` when a read is cancelled, so `next_line`
/// can be used as a `select!` branch.
struct RawLines<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> RawLines<R> {
    fn new(stream: R) -> Self {
        Self {
            reader: BufReader::new(stream),
            buf: Vec::new(),
        }
    }

    /// `Ok(None)` at end of stream. A trailing line without `\n` is still returned.
    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        let read = self.reader.read_until(b'\n', &mut self.buf).await?;
        if read == 0 && self.buf.is_empty() {
            return Ok(None);
        }
        let raw = std::mem::take(&mut self.buf);
        let raw = raw.strip_suffix(b"\n").unwrap_or(&raw);
        Ok(Some(String::from_utf8_lossy(raw).into_owned()))
    }
}

/// Spawn a task that copies one output stream of `process` into `output`.
///
/// The task ends on end-of-stream, on an I/O error, or once the captured
/// process has exited and nothing more arrives within `drain_window`. It
/// never looks at the supervisor's handle field.
pub(crate) fn spawn_console_reader<R>(
    stream: R,
    source: LineSource,
    process: Arc<ServerProcess>,
    output: Arc<OutputBuffer>,
    log_pattern: Option<Arc<Regex>>,
    drain_window: Duration,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = RawLines::new(stream);
        let pid = process.pid();
        loop {
            tokio::select! {
                next = lines.next_line() => match next {
                    Ok(Some(line)) => record_line(&output, source, line, log_pattern.as_deref()),
                    Ok(None) => {
                        tracing::debug!("[Console] {:?} of process {} reached end of stream", source, pid);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("[Console] Failed to read {:?} of process {}: {}", source, pid, e);
                        break;
                    }
                },
                _ = process.wait_exit() => {
                    drain(&mut lines, &output, source, log_pattern.as_deref(), drain_window).await;
                    tracing::debug!("[Console] Process {} exited; {:?} reader quit", pid, source);
                    break;
                }
            }
        }
    });
}

/// Read what is left in the pipe after exit, giving up after `window` of silence.
/// Orphaned children may keep the pipe open, so end-of-stream is not awaited.
async fn drain<R>(
    lines: &mut RawLines<R>,
    output: &OutputBuffer,
    source: LineSource,
    pattern: Option<&Regex>,
    window: Duration,
) where
    R: AsyncRead + Unpin,
{
    while let Ok(Ok(Some(line))) = tokio::time::timeout(window, lines.next_line()).await {
        record_line(output, source, line, pattern);
    }
}

fn record_line(output: &OutputBuffer, source: LineSource, line: String, pattern: Option<&Regex>) {
    let line = line.trim_end_matches('\r');
    if line.is_empty() {
        return;
    }
    let level = parse_log_level(line, pattern);
    // stderr lines default to at least Warn
    let level = if source == LineSource::Stderr && level == LogLevel::Info {
        LogLevel::Warn
    } else {
        level
    };
    tracing::debug!("[Console] {}", line);
    output.push(source, line.to_string(), level);
}

// ─── Helpers ─────────────────────────────────────────────────

/// Parse the log level from a server log line using an optional regex pattern.
///
/// The pattern should contain a named capture group `level`
/// (INFO, WARN, ERROR, DEBUG, ...). Without a pattern every line is Info.
///
/// Example: `/(?P<level>INFO|WARN|ERROR|DEBUG|FATAL)\]` for vanilla Minecraft.
pub fn parse_log_level(line: &str, pattern: Option<&Regex>) -> LogLevel {
    let Some(level) = pattern
        .and_then(|re| re.captures(line))
        .and_then(|caps| caps.name("level"))
    else {
        return LogLevel::Info;
    };
    match level.as_str().to_uppercase().as_str() {
        "ERROR" | "FATAL" | "SEVERE" => LogLevel::Error,
        "WARN" | "WARNING" => LogLevel::Warn,
        "DEBUG" | "TRACE" => LogLevel::Debug,
        _ => LogLevel::Info,
    }
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ─── Tests ───────────────────────────────────────────────────
