use std::borrow::Cow;
use std::io::{self, BufRead, BufReader, Read};
use std::panic::{self, AssertUnwindSafe};
use std::process::Child;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{never, unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, warn};

use crate::models::error::ShellError;
use crate::models::message::OutputEvent;

/// One progress notification.
#[derive(Debug, Clone, Copy)]
pub struct Progress<'a> {
    pub correlation_id: &'a str,
    /// 1-based line number within the task's output.
    pub index: usize,
    /// Already length-capped.
    pub line: &'a str,
    pub elapsed: Duration,
}

impl Progress<'_> {
    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed.as_secs_f64()
    }

    /// Human-readable form. The line is appended as data, never used as a
    /// format string.
    pub fn message(&self) -> String {
        let mut text = format!("Line {}: ", self.index);
        text.push_str(self.line);
        text.push_str(&format!(" [{:.1}s]", self.elapsed_secs()));
        text
    }
}

/// Receives per-line progress for streamed commands. Errors are logged and
/// never stop the command.
pub trait ProgressSink: Send {
    fn emit(&mut self, progress: &Progress<'_>) -> io::Result<()>;
}

impl<F> ProgressSink for F
where
    F: FnMut(&Progress<'_>) -> io::Result<()> + Send,
{
    fn emit(&mut self, progress: &Progress<'_>) -> io::Result<()> {
        self(progress)
    }
}

/// Truncate to `cap` characters on a char boundary.
pub fn cap_line(line: &str, cap: usize) -> Cow<'_, str> {
    match line.char_indices().nth(cap) {
        None => Cow::Borrowed(line),
        Some((at, _)) => {
            let mut short = line[..at].to_string();
            short.push_str("...");
            Cow::Owned(short)
        }
    }
}

/// Wraps an optional sink: numbering, capping, and isolation of failures.
pub struct Emitter {
    correlation_id: String,
    sink: Option<Box<dyn ProgressSink>>,
    cap: usize,
    index: usize,
    started: Instant,
}

impl Emitter {
    pub fn new(correlation_id: String, sink: Option<Box<dyn ProgressSink>>, cap: usize) -> Self {
        Self {
            correlation_id,
            sink,
            cap,
            index: 0,
            started: Instant::now(),
        }
    }

    pub fn line(&mut self, line: &str) {
        self.index += 1;
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        let capped = cap_line(line, self.cap);
        let progress = Progress {
            correlation_id: &self.correlation_id,
            index: self.index,
            line: &capped,
            elapsed: self.started.elapsed(),
        };
        match panic::catch_unwind(AssertUnwindSafe(|| sink.emit(&progress))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Progress sink for {} failed: {}", self.correlation_id, e),
            Err(_) => warn!("Progress sink for {} panicked", self.correlation_id),
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum Collected {
    Event(OutputEvent),
    Idle,
    Closed,
}

/// Combined stdout/stderr of one child, delivered line by line.
pub struct OutputCollector {
    rx: Receiver<OutputEvent>,
    closed: bool,
    read_timeout: Duration,
    last_activity: Instant,
}

impl OutputCollector {
    /// Take the child's pipes and start one reader thread per pipe.
    pub fn attach(child: &mut Child, read_timeout: Duration) -> Self {
        let (tx, rx) = unbounded();
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, tx.clone(), "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, tx.clone(), "stderr");
        }
        drop(tx);
        Self::from_receiver(rx, read_timeout)
    }

    pub fn from_receiver(rx: Receiver<OutputEvent>, read_timeout: Duration) -> Self {
        Self {
            rx,
            closed: false,
            read_timeout,
            last_activity: Instant::now(),
        }
    }

    /// Receiver to select on; a never-ready one once the readers are gone.
    pub fn receiver(&self) -> Receiver<OutputEvent> {
        if self.closed {
            never()
        } else {
            self.rx.clone()
        }
    }

    pub fn mark_closed(&mut self) {
        self.closed = true;
    }

    /// Wait at most `wait` for the next event.
    pub fn next(&mut self, wait: Duration) -> Collected {
        if self.closed {
            return Collected::Closed;
        }
        match self.rx.recv_timeout(wait) {
            Ok(event) => {
                self.note_activity();
                Collected::Event(event)
            }
            Err(RecvTimeoutError::Timeout) => Collected::Idle,
            Err(RecvTimeoutError::Disconnected) => {
                self.closed = true;
                Collected::Closed
            }
        }
    }

    pub fn note_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    /// A `ReadTimeout` once per stalled read window, `None` otherwise.
    pub fn check_stall(&mut self) -> Option<ShellError> {
        if self.closed || self.last_activity.elapsed() < self.read_timeout {
            return None;
        }
        self.last_activity = Instant::now();
        Some(ShellError::ReadTimeout(self.read_timeout))
    }

    /// Collect what is left after exit, stopping at `limit` or when every
    /// reader has hit EOF.
    pub fn drain(&mut self, limit: Duration) -> Vec<OutputEvent> {
        let deadline = Instant::now() + limit;
        let mut events = vec![];
        while !self.closed {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                debug!("Output drain stopped after {:?}", limit);
                break;
            }
            match self.next(left) {
                Collected::Event(event) => events.push(event),
                Collected::Idle | Collected::Closed => break,
            }
        }
        events
    }
}

fn spawn_reader<R: Read + Send + 'static>(stream: R, sender: Sender<OutputEvent>, name: &'static str) {
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    while matches!(buf.last(), Some(b'\n' | b'\r')) {
                        buf.pop();
                    }
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    if sender.send(OutputEvent::Line(line)).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let _ = sender.send(OutputEvent::ReadError(format!("{name}: {e}")));
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn cap_line_respects_char_boundaries() {
        assert_eq!(cap_line("short", 10), "short");
        assert_eq!(cap_line("ééééé", 3), "ééé...");
    }

    #[test]
    fn message_treats_line_as_data() {
        let progress = Progress {
            correlation_id: "r1",
            index: 2,
            line: "100% {} %s {0}",
            elapsed: Duration::from_millis(1500),
        };
        assert_eq!(progress.message(), "Line 2: 100% {} %s {0} [1.5s]");
    }

    #[test]
    fn emitter_survives_failing_and_panicking_sinks() {
        let seen = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&seen);
        let sink = move |p: &Progress<'_>| -> io::Result<()> {
            *counter.lock().unwrap() += 1;
            match p.index {
                1 => Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")),
                2 => panic!("sink bug"),
                _ => Ok(()),
            }
        };
        let mut emitter = Emitter::new("r".into(), Some(Box::new(sink)), 100);
        emitter.line("a");
        emitter.line("b");
        emitter.line("c");
        assert_eq!(*seen.lock().unwrap(), 3);
    }

    #[test]
    fn stall_is_reported_once_per_window() {
        let (_tx, rx) = unbounded::<OutputEvent>();
        let mut collector = OutputCollector::from_receiver(rx, Duration::from_millis(50));
        assert!(collector.check_stall().is_none());
        thread::sleep(Duration::from_millis(80));
        assert!(matches!(collector.check_stall(), Some(ShellError::ReadTimeout(_))));
        assert!(collector.check_stall().is_none());
    }

    #[test]
    fn drain_stops_when_readers_finish() {
        let (tx, rx) = unbounded();
        tx.send(OutputEvent::Line("tail".into())).unwrap();
        drop(tx);
        let mut collector = OutputCollector::from_receiver(rx, Duration::from_secs(1));
        let started = Instant::now();
        let events = collector.drain(Duration::from_secs(5));
        assert_eq!(events, vec![OutputEvent::Line("tail".into())]);
        assert_eq!(collector.next(Duration::from_millis(10)), Collected::Closed);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
