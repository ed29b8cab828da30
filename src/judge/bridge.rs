use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::error::JudgeError;
use crate::sandbox::{SharedClock, serialize_millis};

const BRIDGE_BUFFER: usize = 8192;

/// Byte count and last-activity time shared by every bridge of a session
#[derive(Debug)]
pub struct Progress {
    bytes: AtomicU64,
    last_activity_micros: AtomicU64,
}

impl Progress {
    /// Starts with no bytes and `now` as the last activity
    pub fn new(now: Duration) -> Self {
        Self {
            bytes: AtomicU64::new(0),
            last_activity_micros: AtomicU64::new(now.as_micros() as u64),
        }
    }

    pub fn record(&self, bytes: usize, now: Duration) {
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.last_activity_micros
            .fetch_max(now.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn last_activity(&self) -> Duration {
        Duration::from_micros(self.last_activity_micros.load(Ordering::Relaxed))
    }

    pub fn idle_for(&self, now: Duration) -> Duration {
        now.saturating_sub(self.last_activity())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptEntry {
    pub channel: String,
    #[serde(rename = "at_ms", serialize_with = "serialize_millis")]
    pub at: Duration,
    pub data: String,
}

#[derive(Debug, Default)]
struct TranscriptBuffer {
    entries: Vec<TranscriptEntry>,
    retained: usize,
    truncated: bool,
}

/// In-memory record of relayed chunks, capped at `limit` bytes of payload
#[derive(Debug, Clone)]
pub struct TranscriptLog {
    limit: usize,
    inner: Arc<Mutex<TranscriptBuffer>>,
}

impl TranscriptLog {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            inner: Arc::new(Mutex::new(TranscriptBuffer::default())),
        }
    }

    pub fn record(&self, channel: &str, at: Duration, bytes: &[u8]) {
        let mut inner = self.inner.lock();
        let room = self.limit.saturating_sub(inner.retained);
        if room < bytes.len() {
            inner.truncated = true;
        }
        let kept = &bytes[..bytes.len().min(room)];
        if kept.is_empty() {
            return;
        }
        inner.retained += kept.len();
        inner.entries.push(TranscriptEntry {
            channel: channel.to_string(),
            at,
            data: String::from_utf8_lossy(kept).into_owned(),
        });
    }

    pub fn entries(&self) -> Vec<TranscriptEntry> {
        self.inner.lock().entries.clone()
    }

    pub fn is_truncated(&self) -> bool {
        self.inner.lock().truncated
    }
}

/// Where relayed bytes are mirrored besides the sink
#[derive(Debug, Clone)]
pub enum BridgeMode {
    Passthrough,
    TeeToLog(TranscriptLog),
    /// Appends every chunk to a file, prefixed by a header line
    FileBacked(PathBuf),
}

enum Mirror {
    None,
    Log(TranscriptLog),
    File(File),
}

impl Mirror {
    async fn open(mode: BridgeMode, channel: &str) -> Self {
        match mode {
            BridgeMode::Passthrough => Mirror::None,
            BridgeMode::TeeToLog(log) => Mirror::Log(log),
            BridgeMode::FileBacked(path) => {
                match OpenOptions::new().create(true).append(true).open(&path).await {
                    Ok(file) => Mirror::File(file),
                    Err(e) => {
                        log::warn!(
                            "Transcript file {} unavailable for {channel}, relaying without it: {e}",
                            path.display()
                        );
                        Mirror::None
                    }
                }
            }
        }
    }

    async fn record(&mut self, channel: &str, at: Duration, bytes: &[u8]) {
        match self {
            Mirror::None => {}
            Mirror::Log(log) => log.record(channel, at, bytes),
            Mirror::File(file) => {
                let mut record =
                    format!("[{} ms] {channel} {} bytes\n", at.as_millis(), bytes.len()).into_bytes();
                record.extend_from_slice(bytes);
                record.push(b'\n');
                if let Err(e) = file.write_all(&record).await {
                    log::warn!("Transcript write for {channel} failed, mirroring stopped: {e}");
                    *self = Mirror::None;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultSide {
    Read,
    Write,
}

/// A read or write failure other than end-of-stream or a closed sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamFault {
    pub channel: String,
    pub side: FaultSide,
    pub detail: String,
}

impl StreamFault {
    fn new(channel: &str, side: FaultSide, source: io::Error) -> Self {
        let error = JudgeError::Stream {
            channel: channel.to_string(),
            source,
        };
        Self {
            channel: channel.to_string(),
            side,
            detail: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BridgeReport {
    pub channel: String,
    pub bytes: u64,
    pub source_closed: bool,
    pub sink_closed_early: bool,
    pub cancelled: bool,
    pub fault: Option<StreamFault>,
}

/// Relays one byte stream into another on its own task
#[derive(Debug)]
pub struct PipeBridge {
    channel: String,
    cancel: CancellationToken,
    task: JoinHandle<BridgeReport>,
}

impl PipeBridge {
    /// Starts relaying `source` into `sink`
    ///
    /// Cancelling `cancel` (or a parent of it) stops the bridge at its next await.
    pub fn connect<R, W>(
        channel: &str,
        source: R,
        sink: W,
        mode: BridgeMode,
        progress: Arc<Progress>,
        clock: SharedClock,
        cancel: &CancellationToken,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let cancel = cancel.child_token();
        let relay = Relay {
            channel: channel.to_string(),
            progress,
            clock,
            cancel: cancel.clone(),
        };
        log::debug!("Bridge {channel} connected");
        Self {
            channel: channel.to_string(),
            cancel,
            task: tokio::spawn(relay.run(source, sink, mode)),
        }
    }

    /// Waits for the source to close
    pub async fn finish(mut self) -> BridgeReport {
        let joined = (&mut self.task).await;
        self.report_from(joined)
    }

    /// Waits up to `within` for the source to close, then cancels the relay
    pub async fn shutdown(mut self, within: Duration) -> BridgeReport {
        let joined = match tokio::time::timeout(within, &mut self.task).await {
            Ok(joined) => joined,
            Err(_) => {
                log::debug!("Bridge {} still open after {within:?}, cancelling", self.channel);
                self.cancel.cancel();
                (&mut self.task).await
            }
        };
        self.report_from(joined)
    }

    fn report_from(&self, joined: Result<BridgeReport, JoinError>) -> BridgeReport {
        joined.unwrap_or_else(|e| {
            log::error!("Bridge {} task failed: {e}", self.channel);
            BridgeReport {
                channel: self.channel.clone(),
                cancelled: true,
                ..Default::default()
            }
        })
    }
}

impl Drop for PipeBridge {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Relay {
    channel: String,
    progress: Arc<Progress>,
    clock: SharedClock,
    cancel: CancellationToken,
}

impl Relay {
    async fn run<R, W>(self, mut source: R, sink: W, mode: BridgeMode) -> BridgeReport
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let channel = self.channel.as_str();
        let mut report = BridgeReport {
            channel: channel.to_string(),
            ..Default::default()
        };
        let mut mirror = Mirror::open(mode, channel).await;
        let mut sink = Some(sink);
        let mut buf = vec![0u8; BRIDGE_BUFFER];

        loop {
            let n = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    report.cancelled = true;
                    break;
                }
                read = source.read(&mut buf) => match read {
                    Ok(0) => {
                        report.source_closed = true;
                        break;
                    }
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        log::warn!("Bridge {channel} read failed: {e}");
                        report.fault = Some(StreamFault::new(channel, FaultSide::Read, e));
                        break;
                    }
                },
            };

            let chunk = &buf[..n];
            let now = self.clock.now();
            self.progress.record(n, now);
            report.bytes += n as u64;
            mirror.record(channel, now, chunk).await;

            // once the sink is gone the source is only drained
            let Some(writer) = sink.as_mut() else {
                continue;
            };
            let written = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    report.cancelled = true;
                    break;
                }
                written = async {
                    match writer.write_all(chunk).await {
                        Ok(()) => writer.flush().await,
                        Err(e) => Err(e),
                    }
                } => written,
            };
            match written {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    log::debug!("Bridge {channel} sink closed, draining the source");
                    report.sink_closed_early = true;
                    sink = None;
                }
                Err(e) => {
                    log::warn!("Bridge {channel} write failed: {e}");
                    report.fault = Some(StreamFault::new(channel, FaultSide::Write, e));
                    break;
                }
            }
        }

        if let Some(mut writer) = sink.take() {
            if report.source_closed {
                // downstream observes end of input
                if let Err(e) = writer.shutdown().await {
                    log::debug!("Bridge {channel} sink shutdown: {e}");
                }
            }
        }

        log::debug!(
            "Bridge {channel} closed after {} bytes (source closed: {}, cancelled: {})",
            report.bytes,
            report.source_closed,
            report.cancelled
        );
        report
    }
}

/// Bytes drained from an auxiliary stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub bytes: Vec<u8>,
    pub total: u64,
    pub truncated: bool,
}

impl CapturedOutput {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).trim_end().to_string()
    }
}

#[derive(Debug)]
pub struct Capture {
    cancel: CancellationToken,
    task: JoinHandle<CapturedOutput>,
}

impl Capture {
    /// Waits up to `within` for the stream to close and returns what was kept
    pub async fn collect(mut self, within: Duration) -> CapturedOutput {
        let joined = match tokio::time::timeout(within, &mut self.task).await {
            Ok(joined) => joined,
            Err(_) => {
                self.cancel.cancel();
                (&mut self.task).await
            }
        };
        joined.unwrap_or_else(|e| {
            log::error!("Capture task failed: {e}");
            CapturedOutput::default()
        })
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Drains `reader` to its end, keeping at most `limit` bytes
pub fn spawn_capture<R>(mut reader: R, limit: usize) -> Capture
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let task = tokio::spawn(async move {
        let mut output = CapturedOutput::default();
        let mut buf = vec![0u8; BRIDGE_BUFFER];
        loop {
            let n = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                read = reader.read(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        log::debug!("Capture stopped: {e}");
                        break;
                    }
                },
            };
            output.total += n as u64;
            let room = limit.saturating_sub(output.bytes.len());
            if room < n {
                output.truncated = true;
            }
            output.bytes.extend_from_slice(&buf[..n.min(room)]);
        }
        output
    });
    Capture { cancel, task }
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncWriteExt, duplex};

    use super::*;
    use crate::sandbox::{Clock, ManualClock, MonotonicClock};

    fn bridge<R, W>(source: R, sink: W, mode: BridgeMode, progress: Arc<Progress>) -> PipeBridge
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        PipeBridge::connect(
            "a->b",
            source,
            sink,
            mode,
            progress,
            MonotonicClock::shared(),
            &CancellationToken::new(),
        )
    }

    /// Sink whose reader has gone away
    struct ClosedSink;

    impl AsyncWrite for ClosedSink {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Sink that fails with something other than a broken pipe
    struct FailingSink;

    impl AsyncWrite for FailingSink {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn relays_bytes_in_order_and_propagates_eof() {
        let (mut writer, source) = duplex(16);
        let (sink, mut reader) = duplex(16);
        let progress = Arc::new(Progress::new(Duration::ZERO));
        let bridge = bridge(source, sink, BridgeMode::Passthrough, progress.clone());

        let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let expected = payload.clone();
        let producer = tokio::spawn(async move {
            writer.write_all(&payload).await.unwrap();
        });

        let mut received = Vec::new();
        reader.read_to_end(&mut received).await.unwrap();
        producer.await.unwrap();

        assert_eq!(received, expected);
        let report = bridge.finish().await;
        assert!(report.source_closed);
        assert_eq!(report.bytes, 10_000);
        assert_eq!(report.fault, None);
        assert_eq!(progress.bytes(), 10_000);
    }

    #[tokio::test]
    async fn closed_sink_keeps_draining_the_source() {
        let (mut writer, source) = duplex(64);
        let bridge = bridge(
            source,
            ClosedSink,
            BridgeMode::Passthrough,
            Arc::new(Progress::new(Duration::ZERO)),
        );

        // far more than the duplex buffer, so the writer blocks unless drained
        writer.write_all(&[b'x'; 4096]).await.unwrap();
        drop(writer);

        let report = bridge.finish().await;
        assert!(report.sink_closed_early);
        assert!(report.source_closed);
        assert_eq!(report.bytes, 4096);
        assert_eq!(report.fault, None);
    }

    #[tokio::test]
    async fn other_write_errors_are_faults() {
        let (mut writer, source) = duplex(64);
        let bridge = bridge(
            source,
            FailingSink,
            BridgeMode::Passthrough,
            Arc::new(Progress::new(Duration::ZERO)),
        );
        writer.write_all(b"hello").await.unwrap();

        let report = bridge.finish().await;
        let fault = report.fault.unwrap();
        assert_eq!(fault.side, FaultSide::Write);
        assert!(fault.detail.contains("a->b"));
    }

    #[tokio::test]
    async fn shutdown_cancels_a_silent_source() {
        let (_writer, source) = duplex(64);
        let (sink, _reader) = duplex(64);
        let bridge = bridge(
            source,
            sink,
            BridgeMode::Passthrough,
            Arc::new(Progress::new(Duration::ZERO)),
        );

        let report = bridge.shutdown(Duration::from_millis(20)).await;
        assert!(report.cancelled);
        assert!(!report.source_closed);
    }

    #[tokio::test]
    async fn tee_mode_records_the_transcript() {
        let (mut writer, source) = duplex(64);
        let (sink, mut reader) = duplex(64);
        let transcript = TranscriptLog::new(8);
        let bridge = bridge(
            source,
            sink,
            BridgeMode::TeeToLog(transcript.clone()),
            Arc::new(Progress::new(Duration::ZERO)),
        );

        writer.write_all(b"1 2\n").await.unwrap();
        let mut line = [0u8; 4];
        reader.read_exact(&mut line).await.unwrap();
        writer.write_all(b"3 4 5 6\n").await.unwrap();
        drop(writer);
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        bridge.finish().await;

        assert_eq!(rest, b"3 4 5 6\n");
        let entries = transcript.entries();
        assert_eq!(entries[0].data, "1 2\n");
        assert_eq!(entries[0].channel, "a->b");
        assert_eq!(entries[1].data, "3 4 ");
        assert!(transcript.is_truncated());
    }

    #[tokio::test]
    async fn file_mode_spools_chunks() {
        let path = std::env::temp_dir().join(format!("bridge-{}.log", std::process::id()));
        let (mut writer, source) = duplex(64);
        let (sink, mut reader) = duplex(64);
        let bridge = bridge(
            source,
            sink,
            BridgeMode::FileBacked(path.clone()),
            Arc::new(Progress::new(Duration::ZERO)),
        );
        writer.write_all(b"42\n").await.unwrap();
        drop(writer);
        let mut received = Vec::new();
        reader.read_to_end(&mut received).await.unwrap();
        bridge.finish().await;

        let spooled = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert!(spooled.contains("a->b 3 bytes\n42\n"));
    }

    #[test]
    fn progress_tracks_latest_activity() {
        let clock = ManualClock::new();
        let progress = Progress::new(clock.now());
        clock.advance(Duration::from_millis(700));
        assert_eq!(progress.idle_for(clock.now()), Duration::from_millis(700));

        progress.record(5, clock.now());
        clock.advance(Duration::from_millis(100));
        assert_eq!(progress.bytes(), 5);
        assert_eq!(progress.idle_for(clock.now()), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn capture_keeps_a_bounded_prefix() {
        let (mut writer, reader) = duplex(64);
        let capture = spawn_capture(reader, 5);
        writer.write_all(b"points 10  \n").await.unwrap();
        drop(writer);

        let output = capture.collect(Duration::from_secs(5)).await;
        assert_eq!(output.bytes, b"point");
        assert_eq!(output.total, 12);
        assert!(output.truncated);
    }
}
