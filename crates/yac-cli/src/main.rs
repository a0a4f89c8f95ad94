//! `yac`: line-oriented terminal front end.
//!
//! Spawns the backend through the [`Bridge`], prints frames as plain text and
//! forwards input lines. Lines starting with `/` are commands; `/status` is
//! answered locally through a correlated status query.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use yac_core::paths;
use yac_core::protocol::FrameKind;
use yac_core::transcript;
use yac_core::{Bridge, BridgeConfig, BridgeEvent, ConnectionState, DisconnectReason};

/// Terminal front end for the YAC agent backend
#[derive(Parser, Debug)]
#[command(name = "yac", version, about)]
struct Args {
    /// Backend executable
    #[arg(long, default_value = "yac-backend")]
    backend: String,

    /// Working directory for the backend
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Record wire traffic under ~/.yac/logs
    #[arg(long)]
    trace: bool,

    /// Extra arguments passed to the backend after `--json`
    #[arg(last = true)]
    backend_args: Vec<String>,
}

impl Args {
    fn bridge_config(&self) -> BridgeConfig {
        let mut backend_args = vec!["--json".to_string()];
        backend_args.extend(self.backend_args.iter().cloned());
        let mut config = BridgeConfig::new(&self.backend).args(backend_args);
        if let Some(ref dir) = self.workspace {
            config = config.working_dir(dir);
        }
        if self.trace {
            match paths::default_trace_dir() {
                Some(dir) => config = config.trace_dir(dir),
                None => log::warn!("No home directory, wire tracing disabled"),
            }
        }
        config
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("yac: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    let code = runtime.block_on(run(args));
    // A pending stdin read lives on the blocking pool; don't wait for it.
    runtime.shutdown_background();
    code
}

// Status replies are printed by the `/status` handler.
const PRINTED_KINDS: [FrameKind; 5] = [
    FrameKind::Message,
    FrameKind::ToolStart,
    FrameKind::ToolResult,
    FrameKind::ToolError,
    FrameKind::Error,
];

async fn run(args: Args) -> ExitCode {
    let mut bridge = Bridge::new(args.bridge_config());
    for kind in PRINTED_KINDS {
        bridge.subscribe(kind, |frame| {
            if let Some(text) = transcript::render(frame) {
                println!("{text}");
            }
        });
    }
    bridge.on_unknown(|frame| log::debug!("Ignoring {} frame", frame.kind()));
    let mut events = bridge.events();

    if let Err(e) = bridge.connect().await {
        eprintln!("yac: could not start {}: {e}", args.backend);
        return ExitCode::FAILURE;
    }
    println!("Connected. Type /help for commands, Ctrl-D to quit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut code = ExitCode::SUCCESS;
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => submit(&bridge, line.trim()).await,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("Failed to read input: {}", e);
                    break;
                }
            },
            event = events.recv() => match event {
                Ok(BridgeEvent::StateChanged(ConnectionState::Disconnected(reason))) => {
                    println!("Backend disconnected: {reason}");
                    if reason != DisconnectReason::ProcessExited(Some(0)) {
                        code = ExitCode::FAILURE;
                    }
                    break;
                }
                Ok(BridgeEvent::Diagnostic(text)) => eprintln!("backend: {text}"),
                Ok(BridgeEvent::ToolAbandoned { id, tool }) => println!("!! {tool} abandoned ({id})"),
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => log::warn!("Missed {} events", missed),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    bridge.disconnect().await;
    // Invocations cut short by the disconnect are reported after the drain.
    while let Ok(event) = events.try_recv() {
        if let BridgeEvent::ToolAbandoned { id, tool } = event {
            println!("!! {tool} abandoned ({id})");
        }
    }
    code
}

async fn submit(bridge: &Bridge, line: &str) {
    if line.is_empty() {
        return;
    }
    let sent = if line == "/status" {
        match bridge.get_status().await {
            Ok(status) => {
                println!("{}", transcript::render_status(&status));
                return;
            }
            Err(e) => Err(e),
        }
    } else if line.starts_with('/') {
        bridge.send_command(line).await.map(drop)
    } else {
        bridge.send_message(line).await.map(drop)
    };
    if let Err(e) = sent {
        eprintln!("error: {e}");
    }
}
