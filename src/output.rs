//! Non-blocking line stream over a child's stdout and stderr.
//!
//! Each pipe gets a reader thread that decodes lines and pushes them into a
//! bounded queue. The controller pulls from the queue with
//! `next_line(timeout)`, which never blocks longer than `timeout`. This keeps
//! the control loop free of platform-specific pipe polling.

use std::io::{BufRead, BufReader, Read};
use std::sync::LazyLock;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use regex::Regex;
use thiserror::Error;
use tracing::debug;

/// Queue capacity shared by both reader threads.
const QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stream::Stdout => f.write_str("stdout"),
            Stream::Stderr => f.write_str("stderr"),
        }
    }
}

/// One decoded line of child output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub text: String,
    pub stream: Stream,
    /// Arrival time at the reader thread.
    pub at: Instant,
}

#[derive(Debug, Error)]
#[error("failed to read child {stream}: {source}")]
pub struct StreamReadError {
    pub stream: Stream,
    #[source]
    pub source: std::io::Error,
}

/// A source of output lines with a bounded wait.
pub trait LineSource {
    /// Next line, or `None` if nothing arrived within `timeout`.
    fn next_line(&mut self, timeout: Duration) -> Option<OutputLine>;

    /// True once every underlying stream has ended and nothing is queued.
    fn is_closed(&self) -> bool {
        false
    }
}

/// Strip ANSI escape sequences (colors, cursor movement, OSC titles).
pub fn strip_ansi(input: &str) -> String {
    static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[^\[\]]")
            .expect("ANSI pattern is valid")
    });
    ANSI_RE.replace_all(input, "").to_string()
}

/// Decode raw bytes read up to and including a newline into a clean line.
///
/// Returns `None` for lines that are blank after cleanup.
pub fn decode_line(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim_end_matches(['\n', '\r']);
    let cleaned = strip_ansi(text);
    let cleaned = cleaned.trim_end();
    if cleaned.trim().is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

/// Line stream fed by one reader thread per captured pipe.
pub struct ChildOutput {
    rx: Receiver<OutputLine>,
    readers: Vec<JoinHandle<()>>,
    closed: bool,
}

impl ChildOutput {
    pub fn new() -> (Self, OutputFeeder) {
        let (tx, rx) = mpsc::sync_channel(QUEUE_CAPACITY);
        (
            Self {
                rx,
                readers: Vec::new(),
                closed: false,
            },
            OutputFeeder { tx },
        )
    }

    /// Build a monitor over the given pipes. Either may be absent.
    pub fn spawn<O, E>(stdout: Option<O>, stderr: Option<E>) -> Self
    where
        O: Read + Send + 'static,
        E: Read + Send + 'static,
    {
        let (mut output, feeder) = Self::new();
        if let Some(pipe) = stdout {
            output.readers.push(feeder.attach(Stream::Stdout, pipe));
        }
        if let Some(pipe) = stderr {
            output.readers.push(feeder.attach(Stream::Stderr, pipe));
        }
        // Only the reader threads hold senders now, so the queue disconnects
        // once both pipes reach EOF.
        drop(feeder);
        output
    }
}

impl LineSource for ChildOutput {
    fn next_line(&mut self, timeout: Duration) -> Option<OutputLine> {
        if self.closed {
            // Keep the caller's cadence even after EOF.
            thread::sleep(timeout);
            return None;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(line) => Some(line),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                debug!("child output streams closed");
                self.closed = true;
                for reader in self.readers.drain(..) {
                    let _ = reader.join();
                }
                None
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Sending side of a [`ChildOutput`] queue.
#[derive(Clone)]
pub struct OutputFeeder {
    tx: SyncSender<OutputLine>,
}

impl OutputFeeder {
    /// Start a reader thread that forwards decoded lines from `pipe`.
    pub fn attach<R>(&self, stream: Stream, pipe: R) -> JoinHandle<()>
    where
        R: Read + Send + 'static,
    {
        let tx = self.tx.clone();
        thread::spawn(move || {
            if let Err(e) = pump_lines(stream, pipe, &tx) {
                // A broken pipe is end of stream, not a supervision failure.
                debug!("{e}; treating as end of stream");
            }
        })
    }
}

fn pump_lines<R: Read>(
    stream: Stream,
    pipe: R,
    tx: &SyncSender<OutputLine>,
) -> Result<(), StreamReadError> {
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        let n = reader
            .read_until(b'\n', &mut buf)
            .map_err(|source| StreamReadError { stream, source })?;
        if n == 0 {
            return Ok(());
        }
        let Some(text) = decode_line(&buf) else {
            continue;
        };
        let line = OutputLine {
            text,
            stream,
            at: Instant::now(),
        };
        if tx.send(line).is_err() {
            // Receiver dropped; nobody is listening anymore.
            return Ok(());
        }
    }
}

/// Scripted line source driven by a [`crate::clock::ManualClock`].
///
/// Each line is delivered once the clock reaches its offset. Waiting with no
/// due line advances the clock by the full timeout, so a control loop using
/// this source makes progress without real sleeps.
#[cfg(test)]
pub struct ScriptedLines<'a> {
    clock: &'a crate::clock::ManualClock,
    lines: std::collections::VecDeque<(Duration, String)>,
    close_when_empty: bool,
}

#[cfg(test)]
impl<'a> ScriptedLines<'a> {
    pub fn new(clock: &'a crate::clock::ManualClock, lines: &[(u64, &str)]) -> Self {
        Self {
            clock,
            lines: lines
                .iter()
                .map(|(ms, text)| (Duration::from_millis(*ms), text.to_string()))
                .collect(),
            close_when_empty: false,
        }
    }

    pub fn closing(mut self) -> Self {
        self.close_when_empty = true;
        self
    }
}

#[cfg(test)]
impl LineSource for ScriptedLines<'_> {
    fn next_line(&mut self, timeout: Duration) -> Option<OutputLine> {
        use crate::clock::Clock;

        let now = self.clock.elapsed();
        match self.lines.front() {
            Some((due, _)) if *due <= now + timeout => {
                if *due > now {
                    self.clock.advance(*due - now);
                }
                let (_, text) = self.lines.pop_front()?;
                Some(OutputLine {
                    text,
                    stream: Stream::Stdout,
                    at: self.clock.now(),
                })
            }
            _ => {
                self.clock.advance(timeout);
                None
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.close_when_empty && self.lines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::io::Cursor;

    #[test]
    fn strip_ansi_removes_csi() {
        let input = "\x1b[31mERROR\x1b[0m: something broke";
        assert_eq!(strip_ansi(input), "ERROR: something broke");
    }

    #[test]
    fn strip_ansi_removes_osc() {
        let input = "\x1b]0;title\x07some text";
        assert_eq!(strip_ansi(input), "some text");
    }

    #[test]
    fn strip_ansi_passthrough_clean_text() {
        assert_eq!(strip_ansi("just normal text"), "just normal text");
    }

    #[test]
    fn decode_line_trims_crlf_and_skips_blank() {
        assert_eq!(decode_line(b"hello\r\n").as_deref(), Some("hello"));
        assert_eq!(decode_line(b"   \n"), None);
        assert_eq!(decode_line(b"\x1b[0m\n"), None);
    }

    #[test]
    fn decode_line_is_lossy_on_invalid_utf8() {
        let decoded = decode_line(b"caf\xff ready\n").unwrap();
        assert!(decoded.ends_with(" ready"));
    }

    #[test]
    fn reads_lines_from_both_streams() {
        let stdout = Cursor::new(b"one\ntwo\n".to_vec());
        let stderr = Cursor::new(b"warn\n".to_vec());
        let mut output = ChildOutput::spawn(Some(stdout), Some(stderr));

        let mut seen = Vec::new();
        for _ in 0..50 {
            match output.next_line(Duration::from_millis(100)) {
                Some(line) => seen.push((line.stream, line.text)),
                None if output.is_closed() => break,
                None => {}
            }
        }

        let stdout_lines: Vec<_> = seen
            .iter()
            .filter(|(s, _)| *s == Stream::Stdout)
            .map(|(_, t)| t.as_str())
            .collect();
        assert_eq!(stdout_lines, vec!["one", "two"]);
        assert!(seen.contains(&(Stream::Stderr, "warn".to_string())));
        assert!(output.is_closed());
    }

    #[test]
    fn unterminated_final_line_is_delivered() {
        let stdout = Cursor::new(b"no newline".to_vec());
        let mut output = ChildOutput::spawn(Some(stdout), None::<Cursor<Vec<u8>>>);
        let line = output.next_line(Duration::from_secs(2)).unwrap();
        assert_eq!(line.text, "no newline");
    }

    #[test]
    fn next_line_respects_timeout_when_silent() {
        let (mut output, feeder) = ChildOutput::new();
        let start = Instant::now();
        assert!(output.next_line(Duration::from_millis(50)).is_none());
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(40));
        assert!(waited < Duration::from_secs(2));
        assert!(!output.is_closed());
        drop(feeder);
    }

    #[test]
    fn read_errors_end_the_stream() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::other("pipe gone"))
            }
        }

        let mut output = ChildOutput::spawn(Some(Broken), None::<Broken>);
        for _ in 0..20 {
            if output.next_line(Duration::from_millis(100)).is_none() && output.is_closed() {
                break;
            }
        }
        assert!(output.is_closed());
    }

    #[test]
    fn scripted_lines_follow_manual_clock() {
        let clock = ManualClock::new();
        let mut lines = ScriptedLines::new(&clock, &[(250, "first"), (1000, "second")]);

        assert!(lines.next_line(Duration::from_millis(100)).is_none());
        assert_eq!(clock.elapsed(), Duration::from_millis(100));

        let first = lines.next_line(Duration::from_millis(200)).unwrap();
        assert_eq!(first.text, "first");
        assert_eq!(clock.elapsed(), Duration::from_millis(250));

        assert!(lines.next_line(Duration::ZERO).is_none());
        assert_eq!(clock.elapsed(), Duration::from_millis(250));
    }
}
