//! The backend's line-protocol driver.
//!
//! Three pieces run concurrently: a reader task decoding inbound lines, a
//! writer task encoding outbound frames, and the orchestrator loop on the
//! calling task. Frames reach the orchestrator in arrival order. The one
//! shortcut: while a turn is running and nothing is queued behind it, the
//! reader answers a status request from the latest published snapshot, since
//! no earlier frame can still change it.

use super::{Flow, FrameSink, Orchestrator};
use crate::model::ModelClient;
use crate::protocol::{self, BackendStatus, CodecError, Frame, FrameKind, LineBuffer};
use crate::tools::ToolHost;
use thiserror::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

const READ_CHUNK: usize = 8192;

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("failed to write frame: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("writer task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Serve the protocol until the input closes or an exit directive arrives.
///
/// `outbound` must be the receiver paired with the orchestrator's sink. The
/// handshake frame is always written first.
pub async fn serve<R, W, M, T>(
    reader: R,
    writer: W,
    mut orchestrator: Orchestrator<M, T>,
    outbound: mpsc::UnboundedReceiver<Frame>,
) -> Result<(), ServeError>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
    M: ModelClient,
    T: ToolHost,
{
    let writer_task = tokio::spawn(write_frames(writer, outbound));

    let (tx, mut inbound_rx) = mpsc::unbounded_channel();
    let queued = Arc::new(AtomicUsize::new(0));
    let inbound = Inbound {
        tx,
        queued: queued.clone(),
    };
    let reader_task = tokio::spawn(read_frames(
        reader,
        inbound,
        orchestrator.sink().clone(),
        orchestrator.status_watch(),
    ));

    while let Some(frame) = inbound_rx.recv().await {
        queued.fetch_sub(1, Ordering::AcqRel);
        if orchestrator.handle(frame).await == Flow::Exit {
            log::info!("Exit requested");
            break;
        }
    }

    reader_task.abort();
    let _ = reader_task.await;
    orchestrator.shutdown().await;
    // Dropping the last sink lets the writer drain and finish.
    drop(orchestrator);
    writer_task.await?
}

/// The orchestrator's input queue and the number of frames waiting in it.
struct Inbound {
    tx: mpsc::UnboundedSender<Frame>,
    queued: Arc<AtomicUsize>,
}

impl Inbound {
    fn send(&self, frame: Frame) -> bool {
        self.queued.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(frame).is_err() {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    fn is_empty(&self) -> bool {
        self.queued.load(Ordering::Acquire) == 0
    }
}

async fn read_frames<R: AsyncRead + Unpin>(
    mut reader: R,
    inbound: Inbound,
    sink: FrameSink,
    status: watch::Receiver<BackendStatus>,
) {
    let mut buffer = LineBuffer::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                log::warn!("Failed to read input: {}", e);
                break;
            }
        };
        for line in buffer.feed(&chunk[..n]) {
            if !accept_line(&line, &inbound, &sink, &status) {
                return;
            }
        }
    }
    if let Some(rest) = buffer.flush() {
        accept_line(&rest, &inbound, &sink, &status);
    }
    log::debug!("Input closed");
}

/// Route one inbound line. Returns false once the orchestrator loop is gone.
fn accept_line(
    line: &str,
    inbound: &Inbound,
    sink: &FrameSink,
    status: &watch::Receiver<BackendStatus>,
) -> bool {
    if line.trim().is_empty() {
        return true;
    }
    match protocol::decode(line) {
        Ok(frame) if frame.kind() == &FrameKind::StatusRequest && inbound.is_empty() => {
            let snapshot = status.borrow().clone();
            // Idle means the orchestrator may be about to take a frame that
            // changes the answer, so the request waits its turn.
            if !snapshot.busy {
                return inbound.send(frame);
            }
            sink.emit(Frame::status(frame.id(), &snapshot));
            true
        }
        Ok(frame) => inbound.send(frame),
        Err(failure) => {
            log::warn!("{}", failure);
            sink.emit(Frame::error(
                None,
                &format!("Unreadable frame: {}", failure.reason),
            ));
            true
        }
    }
}

async fn write_frames<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
) -> Result<(), ServeError> {
    write_frame(&mut writer, &Frame::connected()).await?;
    while let Some(frame) = outbound.recv().await {
        write_frame(&mut writer, &frame).await?;
    }
    writer.shutdown().await?;
    Ok(())
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<(), ServeError> {
    let line = protocol::encode(frame)?;
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::tests::{answer, calls, orchestrator};
    use super::super::OrchestratorOptions;
    use super::*;
    use crate::protocol::{MessagePayload, MessageRole};
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};

    struct Frontend {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Frontend {
        async fn send(&mut self, frame: &Frame) {
            self.send_raw(&protocol::encode(frame).unwrap()).await;
        }

        async fn send_raw(&mut self, line: &str) {
            self.writer
                .write_all(format!("{line}\n").as_bytes())
                .await
                .unwrap();
        }

        async fn recv(&mut self) -> Option<Frame> {
            let line = self.lines.next_line().await.unwrap()?;
            Some(protocol::decode(&line).unwrap())
        }

        async fn expect(&mut self, kind: &str) -> Frame {
            let frame = self.recv().await.expect("backend closed");
            assert_eq!(frame.kind().as_str(), kind, "unexpected frame {frame:?}");
            frame
        }
    }

    fn start(
        replies: Vec<Result<crate::model::ModelReply, crate::model::ModelError>>,
    ) -> (
        Frontend,
        tokio::task::JoinHandle<Result<(), ServeError>>,
        std::sync::Arc<tokio::sync::Notify>,
    ) {
        let (orch, outbound) = orchestrator(replies, OrchestratorOptions::default());
        let gate = orch.tools().gate.clone();
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (read_half, write_half) = tokio::io::split(theirs);
        let server = tokio::spawn(serve(read_half, write_half, orch, outbound));

        let (read_half, writer) = tokio::io::split(ours);
        let frontend = Frontend {
            lines: BufReader::new(read_half).lines(),
            writer,
        };
        (frontend, server, gate)
    }

    #[tokio::test]
    async fn handshake_turn_and_exit() {
        let (mut frontend, server, _gate) = start(vec![
            calls("", &[("list_directory", json!({"path": "."}))]),
            answer("a.txt and b.txt"),
        ]);

        frontend.expect("connected").await;
        frontend
            .send(&Frame::user_message("req-1", "list files"))
            .await;
        assert_eq!(frontend.expect("tool_start").await.id(), Some("req-1/tool-1"));
        frontend.expect("tool_result").await;
        let message: MessagePayload = frontend.expect("message").await.payload_as().unwrap();
        assert_eq!(message.role, MessageRole::Assistant);
        assert_eq!(message.content, "a.txt and b.txt");

        frontend.send(&Frame::command("c1", "/exit")).await;
        assert_eq!(frontend.expect("message").await.id(), Some("c1"));
        assert!(frontend.recv().await.is_none());
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn status_is_answered_mid_turn_and_inputs_queue() {
        let (mut frontend, server, gate) = start(vec![
            calls("", &[("slow", json!({}))]),
            answer("finished"),
        ]);
        frontend.expect("connected").await;

        frontend.send(&Frame::user_message("r", "be slow")).await;
        frontend.expect("tool_start").await;

        // Nothing queued yet: answered from the running turn's snapshot.
        frontend.send(&Frame::status_request("s1")).await;
        let status_frame = frontend.expect("status").await;
        assert_eq!(status_frame.id(), Some("s1"));
        let status: BackendStatus = status_frame.payload_as().unwrap();
        assert!(status.busy);
        assert_eq!(status.current_tool.as_deref(), Some("slow"));
        assert_eq!(status.model, "o3-mini");

        // Queued behind the running turn, and the status request behind it.
        frontend.send(&Frame::command("c", "/model gpt-4")).await;
        frontend.send(&Frame::status_request("s2")).await;

        gate.notify_one();
        frontend.expect("tool_result").await;
        assert_eq!(frontend.expect("message").await.id(), Some("r"));
        assert_eq!(frontend.expect("message").await.id(), Some("c"));
        let status_frame = frontend.expect("status").await;
        assert_eq!(status_frame.id(), Some("s2"));
        let status: BackendStatus = status_frame.payload_as().unwrap();
        assert!(!status.busy);
        assert_eq!(status.model, "gpt-4");

        drop(frontend);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn idle_status_request_follows_earlier_frames() {
        let (mut frontend, server, _gate) = start(vec![]);
        frontend.expect("connected").await;

        // Both frames in one write, so the reader sees them back to back.
        let command = protocol::encode(&Frame::command("c", "/model gpt-4")).unwrap();
        let request = protocol::encode(&Frame::status_request("s")).unwrap();
        frontend.send_raw(&format!("{command}\n{request}")).await;

        let message = frontend.expect("message").await;
        assert_eq!(message.id(), Some("c"));
        let status_frame = frontend.expect("status").await;
        assert_eq!(status_frame.id(), Some("s"));
        let status: BackendStatus = status_frame.payload_as().unwrap();
        assert_eq!(status.model, "gpt-4");

        drop(frontend);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unreadable_lines_produce_errors() {
        let (mut frontend, server, _gate) = start(vec![]);
        frontend.expect("connected").await;

        frontend.send_raw("this is not json").await;
        let error = frontend.expect("error").await;
        assert!(error.payload()["message"]
            .as_str()
            .unwrap()
            .starts_with("Unreadable frame"));

        // The session keeps serving.
        frontend.send(&Frame::status_request("s")).await;
        frontend.expect("status").await;

        drop(frontend);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn input_eof_ends_cleanly() {
        let (mut frontend, server, _gate) = start(vec![]);
        frontend.expect("connected").await;
        frontend.writer.shutdown().await.unwrap();
        assert!(frontend.recv().await.is_none());
        server.await.unwrap().unwrap();
    }
}
