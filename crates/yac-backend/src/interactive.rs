//! Plain-text loop for running the backend directly in a terminal.
//!
//! Each input line becomes a frame handled by the orchestrator; outbound
//! frames are printed through the transcript formatter.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use yac_core::model::ModelClient;
use yac_core::orchestrator::{Flow, Orchestrator};
use yac_core::protocol::Frame;
use yac_core::tools::ToolHost;
use yac_core::transcript;

pub async fn run<M, T>(
    mut orchestrator: Orchestrator<M, T>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
) -> std::io::Result<()>
where
    M: ModelClient,
    T: ToolHost,
{
    let printer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if let Some(text) = transcript::render(&frame) {
                println!("{text}");
            }
        }
    });

    println!(
        "yac ({}) - type /help for commands, Ctrl-D to quit",
        orchestrator.session().active_model()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut sequence = 0u64;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        sequence += 1;
        let id = format!("local-{sequence}");
        let frame = if line.starts_with('/') {
            Frame::command(&id, line)
        } else {
            Frame::user_message(&id, line)
        };
        if orchestrator.handle(frame).await == Flow::Exit {
            break;
        }
    }

    orchestrator.shutdown().await;
    drop(orchestrator);
    let _ = printer.await;
    Ok(())
}
