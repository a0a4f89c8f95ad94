//! Line-oriented duplex channels.
//!
//! A [`Channel`] owns one byte stream pair, usually a child process's stdio.
//! It handles:
//! - Spawning the child with piped stdin/stdout/stderr
//! - Buffering partial reads until a full line is available
//! - Decoding lines with a [`LineCodec`] and pushing the results as events
//! - Classifying undecodable lines and stderr with a [`DiagnosticPolicy`]
//! - Writing lines to stdin
//! - Reporting exit and killing the child on request or on drop
//!
//! Events arrive in order on an unbounded receiver. [`ChannelEvent::Closed`] is
//! always the last event, sent after every stdout line has been delivered.

pub mod diagnostics;

pub use diagnostics::{DiagnosticPolicy, DEFAULT_MARKERS};

use crate::logging::TraceLog;
use crate::protocol::{LineBuffer, LineCodec};
use serde::Serialize;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

const READ_CHUNK: usize = 8192;

/// How long readers may keep draining after the child has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Default grace period for [`Channel::close`].
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(3);

/// Receiver side of a channel's event stream.
pub type ChannelEvents<T> = mpsc::UnboundedReceiver<ChannelEvent<T>>;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Events pushed by a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent<T> {
    /// A line decoded successfully
    Item(T),
    /// An undecodable or stderr line that matched the diagnostic policy
    Diagnostic(String),
    /// Reading failed; the stream is unusable
    TransportError(String),
    /// The stream ended. Always the last event.
    Closed(ChannelExit),
}

/// Exit information for a closed channel.
///
/// In-memory channels close with neither a code nor a signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<ExitStatus> for ChannelExit {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("child process did not provide {0}")]
    MissingPipe(&'static str),

    #[error("channel is closed")]
    Closed,

    #[error("refusing to write a line containing a line break")]
    EmbeddedNewline,

    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for spawning a child process channel.
#[derive(Debug, Clone)]
pub struct ChannelSpec {
    /// Program to run
    pub program: String,
    /// Arguments to pass to the program
    pub args: Vec<String>,
    /// Working directory for the process
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
    /// Policy for undecodable stdout lines and stderr
    pub diagnostics: DiagnosticPolicy,
    /// Wire trace destination
    pub trace: TraceLog,
}

impl ChannelSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
            env: Vec::new(),
            diagnostics: DiagnosticPolicy::default(),
            trace: TraceLog::disabled(),
        }
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn diagnostics(mut self, policy: DiagnosticPolicy) -> Self {
        self.diagnostics = policy;
        self
    }

    pub fn trace(mut self, trace: TraceLog) -> Self {
        self.trace = trace;
        self
    }
}

/// Handle to an open channel.
///
/// Dropping the handle kills a spawned child.
pub struct Channel {
    label: String,
    pid: Option<u32>,
    writer: AsyncMutex<Option<BoxedWriter>>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    exit: watch::Receiver<Option<ChannelExit>>,
    trace: TraceLog,
}

impl Channel {
    /// Spawn `spec.program` and start reading its output.
    pub fn open<C: LineCodec>(
        spec: ChannelSpec,
        codec: C,
    ) -> Result<(Self, ChannelEvents<C::Item>), TransportError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = spec.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| TransportError::Spawn {
            program: spec.program.clone(),
            source,
        })?;
        let pid = child.id();
        let stdin = child.stdin.take().ok_or(TransportError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(TransportError::MissingPipe("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(TransportError::MissingPipe("stderr"))?;

        let label = format!("{} (pid {})", spec.program, pid.unwrap_or_default());
        log::info!("Spawned {}", label);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();
        let codec = Arc::new(codec);
        let policy = Arc::new(spec.diagnostics);

        let stdout_task = tokio::spawn(read_items(
            stdout,
            codec,
            policy.clone(),
            spec.trace.clone(),
            events_tx.clone(),
        ));
        let stderr_task = tokio::spawn(read_stderr(
            stderr,
            policy,
            spec.trace.clone(),
            events_tx.clone(),
        ));
        tokio::spawn(supervise_child(
            child,
            kill_rx,
            [stdout_task, stderr_task],
            exit_tx,
            events_tx,
            label.clone(),
        ));

        Ok((
            Self {
                label,
                pid,
                writer: AsyncMutex::new(Some(Box::new(stdin))),
                kill_tx: Mutex::new(Some(kill_tx)),
                exit: exit_rx,
                trace: spec.trace,
            },
            events_rx,
        ))
    }

    /// Build a channel over an in-memory reader/writer pair.
    ///
    /// The channel closes when the reader reaches EOF or on [`Channel::kill`].
    pub fn from_io<R, W, C>(
        reader: R,
        writer: W,
        codec: C,
        diagnostics: DiagnosticPolicy,
        trace: TraceLog,
    ) -> (Self, ChannelEvents<C::Item>)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
        C: LineCodec,
    {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        let mut reader_task = tokio::spawn(read_items(
            reader,
            Arc::new(codec),
            Arc::new(diagnostics),
            trace.clone(),
            events_tx.clone(),
        ));
        tokio::spawn(async move {
            tokio::select! {
                _ = &mut reader_task => {}
                _ = kill_rx => reader_task.abort(),
            }
            let exit = ChannelExit::default();
            exit_tx.send_replace(Some(exit));
            let _ = events_tx.send(ChannelEvent::Closed(exit));
        });

        (
            Self {
                label: "in-memory channel".to_string(),
                pid: None,
                writer: AsyncMutex::new(Some(Box::new(writer))),
                kill_tx: Mutex::new(Some(kill_tx)),
                exit: exit_rx,
                trace,
            },
            events_rx,
        )
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit information, once the channel has closed.
    pub fn exit_status(&self) -> Option<ChannelExit> {
        *self.exit.borrow()
    }

    /// Write one line followed by `\n`.
    pub async fn write_line(&self, line: &str) -> Result<(), TransportError> {
        if line.contains(['\n', '\r']) {
            return Err(TransportError::EmbeddedNewline);
        }

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::Closed)?;
        self.trace.line("OUT", line);
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    /// Terminate immediately.
    pub fn kill(&self) {
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        let sender = self
            .kill_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(tx) = sender {
            log::debug!("Killing {}", self.label);
            let _ = tx.send(());
        }
    }

    /// Close stdin and give the child up to `grace` to exit before killing it.
    ///
    /// On Unix, SIGINT is sent halfway through the grace period.
    pub async fn close(&self, grace: Duration) -> Option<ChannelExit> {
        self.writer.lock().await.take();

        let half = grace / 2;
        if let Some(exit) = self.wait_exit(half).await {
            return Some(exit);
        }

        #[cfg(unix)]
        {
            if let (Some(pid), None) = (self.pid, self.exit_status()) {
                log::debug!("Sending SIGINT to {}", self.label);
                unsafe {
                    libc::kill(pid as i32, libc::SIGINT);
                }
            }
        }
        if let Some(exit) = self.wait_exit(grace - half).await {
            return Some(exit);
        }

        log::warn!("{} did not exit within {:?}, killing", self.label, grace);
        self.kill();
        self.wait_exit(DRAIN_TIMEOUT * 2).await
    }

    /// Wait up to `bound` for the channel to close.
    pub async fn wait_exit(&self, bound: Duration) -> Option<ChannelExit> {
        let mut rx = self.exit.clone();
        let waited = tokio::time::timeout(bound, async move {
            let exit = rx.wait_for(Option::is_some).await.map(|exit| *exit).ok();
            exit
        })
        .await;
        match waited {
            Ok(Some(exit)) => exit,
            _ => self.exit_status(),
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Split a byte stream into lines and hand each to `on_line`.
async fn pump_lines<R: AsyncRead + Unpin>(
    mut reader: R,
    mut on_line: impl FnMut(&str),
) -> std::io::Result<()> {
    let mut buffer = LineBuffer::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        for line in buffer.feed(&chunk[..n]) {
            on_line(&line);
        }
    }
    if let Some(rest) = buffer.flush() {
        on_line(&rest);
    }
    Ok(())
}

async fn read_items<R, C>(
    reader: R,
    codec: Arc<C>,
    policy: Arc<DiagnosticPolicy>,
    trace: TraceLog,
    events: mpsc::UnboundedSender<ChannelEvent<C::Item>>,
) where
    R: AsyncRead + Unpin,
    C: LineCodec,
{
    let result = pump_lines(reader, |line| {
        trace.line("IN", line);
        if line.trim().is_empty() {
            return;
        }
        match codec.decode(line) {
            Ok(item) => {
                let _ = events.send(ChannelEvent::Item(item));
            }
            Err(failure) => match policy.classify(&failure.raw) {
                Some(text) => {
                    let _ = events.send(ChannelEvent::Diagnostic(text));
                }
                None => log::debug!("Discarding non-protocol line: {}", failure.raw),
            },
        }
    })
    .await;

    if let Err(e) = result {
        log::warn!("Read failed: {}", e);
        let _ = events.send(ChannelEvent::TransportError(e.to_string()));
    }
}

async fn read_stderr<R, T>(
    reader: R,
    policy: Arc<DiagnosticPolicy>,
    trace: TraceLog,
    events: mpsc::UnboundedSender<ChannelEvent<T>>,
) where
    R: AsyncRead + Unpin,
{
    let result = pump_lines(reader, |line| {
        trace.line("ERR", line);
        match policy.classify(line) {
            Some(text) => {
                let _ = events.send(ChannelEvent::Diagnostic(text));
            }
            None if !line.trim().is_empty() => log::debug!("stderr: {}", line),
            None => {}
        }
    })
    .await;

    if let Err(e) = result {
        log::debug!("stderr read failed: {}", e);
    }
}

async fn supervise_child<T>(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    readers: [JoinHandle<()>; 2],
    exit_tx: watch::Sender<Option<ChannelExit>>,
    events: mpsc::UnboundedSender<ChannelEvent<T>>,
    label: String,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            if let Err(e) = child.start_kill() {
                log::warn!("Failed to kill {}: {}", label, e);
            }
            child.wait().await
        }
    };

    // Let the readers deliver everything the child wrote before exiting.
    for mut reader in readers {
        if tokio::time::timeout(DRAIN_TIMEOUT, &mut reader).await.is_err() {
            reader.abort();
        }
    }

    let exit = match status {
        Ok(status) => ChannelExit::from(status),
        Err(e) => {
            let _ = events.send(ChannelEvent::TransportError(format!(
                "failed to wait for child: {e}"
            )));
            ChannelExit::default()
        }
    };
    log::info!(
        "{} exited (code {:?}, signal {:?})",
        label,
        exit.code,
        exit.signal
    );
    exit_tx.send_replace(Some(exit));
    let _ = events.send(ChannelEvent::Closed(exit));
}

// ============================================================================
// TESTS
// ============================================================================
