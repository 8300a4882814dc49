//! Engine entry point: one process, one audit.
//!
//! Wires transport → bus → orchestrator, runs the machine to terminal,
//! publishes the terminal events, and maps the outcome to an exit code
//! (0 completed, 1 error, 2 aborted). All diagnostics go to stderr via
//! `tracing`; stdout belongs to Stdout-mode IPC.

use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

use crate::agents::AgentSet;
use crate::bus::EventBus;
use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::event::EventDraft;
use crate::ipc::{EventTransport, IpcMode, QueueTransport, StdoutTransport};
use crate::orchestrator::Orchestrator;
use crate::state::{AuditState, AuditStatus, Tier, VerdictMode};

pub const EXIT_COMPLETED: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_ABORTED: i32 = 2;

/// Everything the engine needs, parsed from the CLI by `main`.
#[derive(Debug, Clone)]
pub struct EngineArgs {
    pub url: String,
    pub tier: Tier,
    pub verdict_mode: VerdictMode,
    pub audit_id: String,
    pub ipc_mode: IpcMode,
    /// Socket path for queue mode; required there, unused in stdout mode.
    pub ipc_socket: Option<PathBuf>,
    pub modules: Vec<String>,
}

/// Run one audit end to end over the transport selected by the CLI flags.
pub async fn run(
    args: EngineArgs,
    config: EngineConfig,
    agents: AgentSet,
    cancel: CancellationToken,
) -> i32 {
    let transport = match build_transport(&args).await {
        Ok(transport) => transport,
        Err(e) => {
            tracing::error!(error = %e, "could not establish IPC transport");
            return EXIT_ERROR;
        }
    };
    run_with_transport(args, config, agents, cancel, transport).await
}

/// Run one audit over an already-built transport. Exposed for embedding
/// and for driving the engine in-process under test.
pub async fn run_with_transport(
    args: EngineArgs,
    config: EngineConfig,
    agents: AgentSet,
    cancel: CancellationToken,
    transport: Box<dyn EventTransport>,
) -> i32 {
    let (bus, pump) = EventBus::start(&args.audit_id, &config.bus, transport);

    let state = match AuditState::new(&args.audit_id, &args.url, args.tier, args.verdict_mode) {
        Ok(state) => state.with_modules(args.modules.clone()),
        Err(e) => {
            let _ = bus
                .publish(EventDraft::audit_error(e.kind(), &e.to_string()))
                .await;
            bus.close().await;
            let _ = pump.await;
            return EXIT_ERROR;
        }
    };

    let orchestrator = Orchestrator::new(state, agents, &config, bus.clone(), cancel);
    let final_state = orchestrator.run().await;

    // Terminal events: result, then exactly one audit_complete.
    let _ = bus
        .publish(EventDraft::audit_result(final_state.result_summary()))
        .await;
    let _ = bus
        .publish(EventDraft::audit_complete(final_state.status.as_str()))
        .await;
    bus.close().await;

    match pump.await {
        Ok(Ok(written)) => {
            tracing::info!(
                audit_id = %final_state.audit_id,
                events = written,
                status = final_state.status.as_str(),
                "audit finished"
            );
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, "IPC transport failed while draining");
            return EXIT_ERROR;
        }
        Err(e) => {
            tracing::error!(error = %e, "event pump panicked");
            return EXIT_ERROR;
        }
    }

    match final_state.status {
        AuditStatus::Completed => EXIT_COMPLETED,
        AuditStatus::Aborted => EXIT_ABORTED,
        _ => EXIT_ERROR,
    }
}

async fn build_transport(args: &EngineArgs) -> Result<Box<dyn EventTransport>, EngineError> {
    match args.ipc_mode {
        IpcMode::Stdout => Ok(Box::new(StdoutTransport::stdout())),
        IpcMode::Queue => {
            let path = args.ipc_socket.as_ref().ok_or_else(|| {
                EngineError::Other(anyhow::anyhow!("queue mode requires --ipc-socket"))
            })?;
            #[cfg(unix)]
            {
                let transport = QueueTransport::connect(path).await?;
                Ok(Box::new(transport))
            }
            #[cfg(not(unix))]
            {
                let _ = path;
                Err(EngineError::Other(anyhow::anyhow!(
                    "queue mode requires unix domain sockets on this platform"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{Agent, AgentContext};
    use crate::errors::AgentError;
    use crate::event::AuditPhase;
    use crate::state::StatePatch;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct NoopAgent(AuditPhase);

    #[async_trait]
    impl Agent for NoopAgent {
        fn phase(&self) -> AuditPhase {
            self.0
        }
        async fn analyze(
            &self,
            _snapshot: &AuditState,
            _ctx: &AgentContext,
        ) -> Result<StatePatch, AgentError> {
            Ok(StatePatch::default())
        }
    }

    fn noop_agents() -> AgentSet {
        AgentSet {
            scout: Arc::new(NoopAgent(AuditPhase::Scout)),
            security: Arc::new(NoopAgent(AuditPhase::Security)),
            vision: Arc::new(NoopAgent(AuditPhase::Vision)),
            graph: Arc::new(NoopAgent(AuditPhase::Graph)),
            judge: Arc::new(NoopAgent(AuditPhase::Judge)),
        }
    }

    #[tokio::test]
    async fn invalid_url_exits_with_error() {
        let args = EngineArgs {
            url: "not a url".to_string(),
            tier: Tier::QuickScan,
            verdict_mode: VerdictMode::Simple,
            audit_id: "a".to_string(),
            ipc_mode: IpcMode::Stdout,
            ipc_socket: None,
            modules: vec![],
        };
        let code = run(
            args,
            EngineConfig::default(),
            noop_agents(),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(code, EXIT_ERROR);
    }

    #[tokio::test]
    async fn queue_mode_without_socket_is_an_error() {
        let args = EngineArgs {
            url: "https://example.com".to_string(),
            tier: Tier::QuickScan,
            verdict_mode: VerdictMode::Simple,
            audit_id: "a".to_string(),
            ipc_mode: IpcMode::Queue,
            ipc_socket: None,
            modules: vec![],
        };
        assert!(build_transport(&args).await.is_err());
    }
}
