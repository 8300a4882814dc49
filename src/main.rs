use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use veritas::agents::AgentSet;
use veritas::config::EngineConfig;
use veritas::engine::{self, EngineArgs};
use veritas::ipc::IpcMode;
use veritas::state::{Tier, VerdictMode};

/// Audit engine: spawned per audit by the API-side runner.
#[derive(Parser)]
#[command(name = "veritas-engine")]
#[command(version, about = "URL trust audit engine")]
struct Cli {
    /// Target URL to audit.
    url: String,

    /// Audit depth tier.
    #[arg(long, default_value = "standard_audit")]
    tier: String,

    /// Verdict wording: simple or expert.
    #[arg(long, default_value = "simple")]
    verdict_mode: String,

    /// Opaque audit identifier assigned by the runner.
    #[arg(long)]
    audit_id: Option<String>,

    /// IPC transport: queue or stdout.
    #[arg(long, default_value = "queue")]
    ipc_mode: String,

    /// Unix socket path for queue mode (the runner listens here).
    #[arg(long)]
    ipc_socket: Option<PathBuf>,

    /// Comma-separated security module ids; empty enables all.
    #[arg(long, default_value = "")]
    modules: String,

    /// Accepted for spawn parity; the fallback respawn itself is the
    /// runner's job.
    #[arg(long)]
    use_stdout_fallback: bool,

    /// Optional veritas.toml with tunable overrides.
    #[arg(long, default_value = "veritas.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Diagnostics go to stderr only; stdout carries Stdout-mode IPC.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let tier = Tier::from_str(&cli.tier).map_err(|e| anyhow::anyhow!(e))?;
    let verdict_mode = VerdictMode::from_str(&cli.verdict_mode).map_err(|e| anyhow::anyhow!(e))?;
    let ipc_mode: IpcMode = cli.ipc_mode.parse().map_err(|e: String| anyhow::anyhow!(e))?;
    let modules: Vec<String> = cli
        .modules
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    let audit_id = cli
        .audit_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let config = EngineConfig::load_or_default(&cli.config)
        .context("Failed to load engine configuration")?;

    // Graceful cancellation: the runner sends SIGTERM first, SIGKILL later.
    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    let args = EngineArgs {
        url: cli.url,
        tier,
        verdict_mode,
        audit_id,
        ipc_mode,
        ipc_socket: cli.ipc_socket,
        modules,
    };

    let code = engine::run(args, config, AgentSet::builtin(), cancel).await;
    std::process::exit(code);
}

fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "could not install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = sigterm.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        tracing::info!("cancellation signal received");
        cancel.cancel();
    });
}
