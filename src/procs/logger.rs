// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::mpsc::{
    self,
    error::{SendTimeoutError, TrySendError},
};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::procs::launcher::ProcessOutput;

pub const DEFAULT_LOG_BUFFER: usize = 1024;
/// Longer lines are split into records of at most this many bytes
pub const MAX_LINE_LEN: usize = 64 * 1024;
const NOTICE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
    /// Notices from the supervisor itself about a service
    Supervisor,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
            Self::Supervisor => f.write_str("launchrc"),
        }
    }
}

/// One line of output, labeled with where it came from
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    pub service: Arc<str>,
    pub stream: StreamKind,
    pub line: String,
    pub timestamp: DateTime<Utc>,
}

impl LogRecord {
    pub fn new(service: Arc<str>, stream: StreamKind, line: String) -> Self {
        Self {
            service,
            stream,
            line,
            timestamp: Utc::now(),
        }
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ts = self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true);
        match self.stream {
            StreamKind::Stdout => write!(f, "{} [{}] {}", ts, self.service, self.line),
            stream => write!(f, "{} [{}:{}] {}", ts, self.service, stream, self.line),
        }
    }
}

pub type LogReceiver = mpsc::Receiver<LogRecord>;

/// Recv lines from every service and multiplex them into one bounded queue.
///
/// Rules:
///  - a reader never blocks on the queue, a full queue drops the line
///  - the first drop for a service is reported once, as "log backpressure"
///  - readers keep draining their pipe after the sink is gone, so a service never stalls
///  - a line longer than [`MAX_LINE_LEN`] is split, each piece its own record
#[derive(Clone, Debug)]
pub struct OutputCollector {
    sender: mpsc::Sender<LogRecord>,
}

impl OutputCollector {
    pub fn new(capacity: usize) -> (Self, LogReceiver) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Start reading a service's output, returns the reader tasks
    pub fn attach(&self, service: &str, output: ProcessOutput) -> Vec<JoinHandle<()>> {
        let service: Arc<str> = Arc::from(service);
        let notified = Arc::new(AtomicBool::new(false));
        let mut readers = Vec::with_capacity(2);

        if let Some(stdout) = output.stdout {
            readers.push(tokio::spawn(read_lines(
                stdout,
                Arc::clone(&service),
                StreamKind::Stdout,
                self.sender.clone(),
                Arc::clone(&notified),
            )));
        }

        if let Some(stderr) = output.stderr {
            readers.push(tokio::spawn(read_lines(
                stderr,
                service,
                StreamKind::Stderr,
                self.sender.clone(),
                notified,
            )));
        }

        readers
    }

    /// A supervisor notice about a service; waits for room rather than dropping
    pub async fn notice(&self, service: &str, line: impl Into<String>) {
        let record = LogRecord::new(Arc::from(service), StreamKind::Supervisor, line.into());
        match self.sender.send_timeout(record, NOTICE_TIMEOUT).await {
            Ok(()) => (),
            Err(SendTimeoutError::Timeout(record)) => {
                warn!(service, "log sink stalled, notice discarded: {}", record.line)
            }
            Err(SendTimeoutError::Closed(_)) => {
                debug!(service, "log sink closed, notice discarded")
            }
        }
    }

    /// A supervisor notice that must not wait; with the queue full it only goes to the log
    pub fn try_notice(&self, service: &str, line: impl Into<String>) {
        let record = LogRecord::new(Arc::from(service), StreamKind::Supervisor, line.into());
        match self.sender.try_send(record) {
            Ok(()) => (),
            Err(TrySendError::Full(record)) => {
                warn!(service, "log sink full: {}", record.line)
            }
            Err(TrySendError::Closed(_)) => {
                debug!(service, "log sink closed, notice discarded")
            }
        }
    }
}

async fn read_lines<R>(
    reader: R,
    service: Arc<str>,
    stream: StreamKind,
    sender: mpsc::Sender<LogRecord>,
    notified: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    let mut split = false;

    loop {
        buf.clear();
        let mut limit = (&mut reader).take(MAX_LINE_LEN as u64);
        match limit.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => (),
            Err(e) => {
                warn!(service = %service, %stream, "failed reading output: {}", e);
                break;
            }
        }

        let ends_line = buf.last() == Some(&b'\n');
        // the newline right after a split piece, not an empty line of its own
        if split && buf.as_slice() == b"\n" {
            split = false;
            continue;
        }
        split = !ends_line;

        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(&['\n', '\r'][..]).to_string();

        match sender.try_send(LogRecord::new(Arc::clone(&service), stream, line)) {
            Ok(()) => (),
            Err(TrySendError::Full(_)) => {
                if !notified.swap(true, Ordering::Relaxed) {
                    warn!(service = %service, "log backpressure, dropping output lines");
                }
            }
            // nobody is listening, keep the pipe drained anyway
            Err(TrySendError::Closed(_)) => (),
        }
    }

    debug!(service = %service, %stream, "output closed");
}

/// Where the multiplexed records end up
pub trait LogSink: Send + 'static {
    fn write(&mut self, record: &LogRecord) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Writes every record as a labeled line to any `io::Write`, stdout by default
pub struct ConsoleSink<W: Write + Send + 'static = io::Stdout> {
    out: W,
}

impl ConsoleSink {
    pub fn stdout() -> Self {
        Self { out: io::stdout() }
    }
}

impl<W: Write + Send + 'static> ConsoleSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send + 'static> LogSink for ConsoleSink<W> {
    fn write(&mut self, record: &LogRecord) -> io::Result<()> {
        writeln!(self.out, "{}", record)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// Consume records until every sender is gone, then flush the sink and hand it back
pub async fn drain<S: LogSink>(mut receiver: LogReceiver, mut sink: S) -> S {
    while let Some(record) = receiver.recv().await {
        if let Err(e) = sink.write(&record) {
            warn!("failed writing log record: {}", e);
        }
    }

    if let Err(e) = sink.flush() {
        warn!("failed flushing log sink: {}", e);
    }

    sink
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procs::launcher::{launch, StdIoConf};
    use crate::service::ServiceSpec;

    fn output_of(script: &str) -> (tokio::process::Child, ProcessOutput) {
        let spec = ServiceSpec::new("chatty", vec!["sh", "-c", script], 9100);
        launch(&spec, StdIoConf::default()).unwrap()
    }

    #[tokio::test]
    async fn labels_lines_by_service_and_stream() {
        let (collector, mut receiver) = OutputCollector::new(16);
        let (mut child, output) = output_of("echo out; echo err 1>&2; printf 'no newline'");

        let readers = collector.attach("chatty", output);
        assert_eq!(readers.len(), 2);
        child.wait().await.unwrap();
        futures::future::join_all(readers).await;
        drop(collector);

        let mut records = Vec::new();
        while let Some(record) = receiver.recv().await {
            records.push(record);
        }

        let mut stdout: Vec<_> = records
            .iter()
            .filter(|r| r.stream == StreamKind::Stdout)
            .map(|r| r.line.as_str())
            .collect();
        stdout.sort_unstable();
        assert_eq!(stdout, vec!["no newline", "out"]);

        let stderr: Vec<_> = records
            .iter()
            .filter(|r| r.stream == StreamKind::Stderr)
            .collect();
        assert_eq!(stderr.len(), 1);
        assert_eq!(stderr[0].line, "err");
        assert!(records.iter().all(|r| &*r.service == "chatty"));
    }

    #[tokio::test]
    async fn full_queue_drops_without_stalling_the_process() {
        let (collector, mut receiver) = OutputCollector::new(2);
        let (mut child, output) = output_of("i=0; while [ $i -lt 2000 ]; do echo line $i; i=$((i+1)); done");

        let readers = collector.attach("chatty", output);
        let status = tokio::time::timeout(std::time::Duration::from_secs(10), child.wait())
            .await
            .expect("process stalled on its output")
            .unwrap();
        assert!(status.success());
        futures::future::join_all(readers).await;
        drop(collector);

        let mut kept = 0;
        while receiver.recv().await.is_some() {
            kept += 1;
        }
        assert!(kept >= 1 && kept <= 2, "kept {} records", kept);
    }

    #[tokio::test]
    async fn readers_outlive_a_closed_sink() {
        let (collector, receiver) = OutputCollector::new(1);
        drop(receiver);

        let (mut child, output) = output_of("echo a; echo b; echo c");
        let readers = collector.attach("chatty", output);
        assert!(child.wait().await.unwrap().success());
        futures::future::join_all(readers).await;
    }

    #[tokio::test]
    async fn drain_writes_notices_and_lines() {
        let (collector, receiver) = OutputCollector::new(8);
        collector.notice("api", "ready on 127.0.0.1:8000").await;
        drop(collector);

        let sink = drain(receiver, ConsoleSink::new(Vec::new())).await;
        let text = String::from_utf8(sink.into_inner()).unwrap();
        assert!(
            text.trim_end().ends_with("[api:launchrc] ready on 127.0.0.1:8000"),
            "{}",
            text
        );
    }

    /// Everything the fmt subscriber writes, for asserting on warnings
    #[derive(Clone, Default)]
    struct Captured(Arc<std::sync::Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(bytes);
            Ok(bytes.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[tokio::test]
    async fn backpressure_is_reported_once_per_service() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        // held, never read
        let (collector, _receiver) = OutputCollector::new(1);
        let flood = "i=0; while [ $i -lt 500 ]; do echo out $i; echo err $i 1>&2; i=$((i+1)); done";

        let mut readers = Vec::new();
        for service in &["api", "ui"] {
            let (mut child, output) = output_of(flood);
            readers.extend(collector.attach(service, output));
            assert!(child.wait().await.unwrap().success());
        }
        futures::future::join_all(readers).await;

        let text = captured.text();
        let warnings = |service: &str| {
            let field = format!("service={}", service);
            text.lines()
                .filter(|line| line.contains("log backpressure") && line.ends_with(&field))
                .count()
        };
        assert_eq!(warnings("api"), 1, "{}", text);
        assert_eq!(warnings("ui"), 1, "{}", text);
    }

    async fn lines_of(script: &str) -> Vec<String> {
        let (collector, mut receiver) = OutputCollector::new(64);
        let (mut child, output) = output_of(script);

        let readers = collector.attach("chatty", output);
        assert!(child.wait().await.unwrap().success());
        futures::future::join_all(readers).await;
        drop(collector);

        let mut lines = Vec::new();
        while let Some(record) = receiver.recv().await {
            lines.push(record.line);
        }
        lines
    }

    #[tokio::test]
    async fn long_lines_are_split() {
        let lines = lines_of("head -c 200000 /dev/zero | tr '\\0' a; echo; echo after").await;

        let (pieces, rest) = lines.split_at(lines.len() - 1);
        assert_eq!(rest, ["after"]);
        assert_eq!(pieces.len(), 4);
        assert!(pieces.iter().all(|p| p.len() <= MAX_LINE_LEN && p.bytes().all(|b| b == b'a')));
        assert_eq!(pieces.iter().map(String::len).sum::<usize>(), 200_000);

        // a line of exactly the limit leaves no empty record behind
        let lines = lines_of("head -c 65536 /dev/zero | tr '\\0' a; echo; echo after").await;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].len(), MAX_LINE_LEN);
        assert_eq!(lines[1], "after");
    }

    #[tokio::test]
    async fn try_notice_never_waits() {
        let (collector, mut receiver) = OutputCollector::new(1);

        collector.try_notice("api", "terminating");
        collector.try_notice("api", "stopped, exited(143)");
        drop(collector);

        let first = receiver.recv().await.unwrap();
        assert_eq!(first.stream, StreamKind::Supervisor);
        assert_eq!(first.line, "terminating");
        assert!(receiver.recv().await.is_none());
    }
}
