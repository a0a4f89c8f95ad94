//! `yac-backend`: the agent side of YAC.
//!
//! With `--json` the backend speaks the line protocol on stdin/stdout and is
//! meant to be spawned by a frontend. Without it, it runs a plain-text loop
//! in the terminal. Logs always go to stderr.

mod interactive;

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::mpsc;
use yac_core::config::{self, YacConfig};
use yac_core::model::{self, ProviderClient};
use yac_core::orchestrator::{self, frame_channel, Orchestrator, OrchestratorOptions};
use yac_core::protocol::Frame;
use yac_core::session::Session;
use yac_core::tools::ToolRegistry;

/// Agent backend for YAC
#[derive(Parser, Debug)]
#[command(name = "yac-backend", version, about)]
struct Args {
    /// Speak the JSON line protocol on stdin/stdout
    #[arg(long)]
    json: bool,

    /// Model provider (openai, anthropic, google, ollama)
    #[arg(long)]
    provider: Option<String>,

    /// Model name; defaults to the provider's default
    #[arg(long)]
    model: Option<String>,

    /// Config file (default: ~/.yac/config.json)
    #[arg(long, env = "YAC_CONFIG")]
    config: Option<PathBuf>,

    /// Directory exposed to the default filesystem server
    #[arg(long)]
    workspace: Option<PathBuf>,
}

type Backend = Orchestrator<ProviderClient, ToolRegistry>;

fn main() -> ExitCode {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .target(env_logger::Target::Stderr)
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("yac-backend: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    let code = runtime.block_on(run(args));
    // A pending stdin read lives on the blocking pool; don't wait for it.
    runtime.shutdown_background();
    code
}

async fn run(args: Args) -> ExitCode {
    let (backend, outbound) = match start(&args).await {
        Ok(started) => started,
        Err(e) => {
            log::error!("{}", e);
            eprintln!("yac-backend: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = if args.json {
        log::info!("Serving line protocol on stdio");
        orchestrator::serve(tokio::io::stdin(), tokio::io::stdout(), backend, outbound)
            .await
            .map_err(|e| e.to_string())
    } else {
        interactive::run(backend, outbound)
            .await
            .map_err(|e| e.to_string())
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Backend stopped: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Load config, build the model client and connect tool servers.
async fn start(args: &Args) -> Result<(Backend, mpsc::UnboundedReceiver<Frame>), String> {
    let path = args.config.clone().unwrap_or_else(config::default_config_path);
    let workspace = match args.workspace {
        Some(ref dir) => dir.clone(),
        None => std::env::current_dir()
            .map_err(|e| format!("cannot resolve working directory: {e}"))?,
    };

    let mut config = YacConfig::load(&path)
        .map_err(|e| e.to_string())?
        .with_default_servers(&workspace);
    config.apply_env();
    if let Some(ref provider) = args.provider {
        config.provider = provider.trim().to_ascii_lowercase();
    }
    if let Some(ref model) = args.model {
        config.model = Some(model.clone());
    }
    config.validate().map_err(|e| e.to_string())?;
    log::info!(
        "Provider {} with model {} ({} tool servers configured)",
        config.provider,
        config.resolved_model(),
        config.mcp_servers.len()
    );

    let client = model::create_client(&config).map_err(|e| e.to_string())?;

    let mut tools = ToolRegistry::new();
    tools
        .connect_all(&config.mcp_servers)
        .await
        .map_err(|e| format!("tool server startup failed: {e}"))?;

    let (sink, outbound) = frame_channel();
    let backend = Orchestrator::new(
        Session::new(config.resolved_model()),
        client,
        tools,
        OrchestratorOptions::from_config(&config).persist_to(path),
        sink,
    );
    Ok((backend, outbound))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Args::command().debug_assert();
    }

    #[test]
    fn parses_flags() {
        let args = Args::try_parse_from([
            "yac-backend",
            "--json",
            "--provider",
            "ollama",
            "--model",
            "llama3.1",
            "--workspace",
            "/tmp/work",
        ])
        .unwrap();
        assert!(args.json);
        assert_eq!(args.provider.as_deref(), Some("ollama"));
        assert_eq!(args.model.as_deref(), Some("llama3.1"));
        assert_eq!(args.workspace, Some(PathBuf::from("/tmp/work")));
    }

    #[tokio::test]
    async fn unknown_provider_fails_startup() {
        let dir = tempfile::tempdir().unwrap();
        let args = Args {
            json: true,
            provider: Some("mystery".into()),
            model: None,
            config: Some(dir.path().join("missing.json")),
            workspace: Some(dir.path().to_path_buf()),
        };
        let err = start(&args).await.err().unwrap();
        assert!(err.contains("unknown provider 'mystery'"));
    }
}
