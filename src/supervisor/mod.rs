//! API-side supervisor: spawns the engine subprocess per audit, reads its
//! event stream, persists and forwards every event, and owns the process
//! lifecycle.
//!
//! Responsibilities per audit:
//! 1. create the `audits` row, spawn `veritas-engine` with the chosen IPC
//!    mode,
//! 2. run the event reader (persist via the repository, forward to the
//!    WebSocket broadcast) and the exit watcher concurrently,
//! 3. enforce the global timeout (tier deadline + grace): graceful SIGTERM,
//!    then force-kill,
//! 4. synthesize `audit_error(kind=engine_died)` when the process exits
//!    without a terminal event,
//! 5. auto-fallback: queue transport not established within the window →
//!    respawn in stdout mode (when enabled), recorded in `audits.ipc_mode`.

pub mod ws;

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::{Child, Command};
use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::event::{EventDraft, EventKind, ProgressEvent};
use crate::ipc::{IpcMode, QueueEventReader, StdoutEventReader};
use crate::repository::AuditRepository;
use crate::state::{AuditStatus, Finding, ScreenshotMeta, Tier, VerdictMode};

/// Runner tunables.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Engine binary to spawn.
    pub engine_binary: PathBuf,
    /// Preferred IPC mode for new audits.
    pub ipc_mode: IpcMode,
    /// Respawn in stdout mode when the queue transport cannot be
    /// established in time.
    pub use_stdout_fallback: bool,
    /// Queue-mode establishment window.
    pub queue_connect_timeout: Duration,
    /// Grace added to the tier deadline for the global per-audit timeout.
    pub grace: Duration,
    /// Window between graceful SIGTERM and force-kill.
    pub graceful_cancel_timeout: Duration,
    /// Directory for per-audit unix sockets.
    pub socket_dir: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            engine_binary: PathBuf::from(
                std::env::var("VERITAS_ENGINE").unwrap_or_else(|_| "veritas-engine".to_string()),
            ),
            ipc_mode: IpcMode::Queue,
            use_stdout_fallback: true,
            queue_connect_timeout: Duration::from_secs(5),
            grace: Duration::from_secs(30),
            graceful_cancel_timeout: Duration::from_secs(5),
            socket_dir: std::env::temp_dir().join("veritas-ipc"),
        }
    }
}

/// A request to audit one URL.
#[derive(Debug, Clone)]
pub struct AuditRequest {
    pub audit_id: String,
    pub url: String,
    pub tier: Tier,
    pub verdict_mode: VerdictMode,
    pub modules: Vec<String>,
}

/// How an audit ended, from the runner's point of view.
#[derive(Debug, Clone)]
pub struct AuditOutcome {
    pub audit_id: String,
    pub status: AuditStatus,
    pub ipc_mode_used: IpcMode,
    pub events_seen: u64,
}

/// What one engine attempt came back with.
enum AttemptEnd {
    /// A terminal event arrived; the engine owned its ending.
    Terminal(AuditStatus),
    /// The stream ended without a terminal event; exit code attached.
    Died(Option<i32>),
    /// Queue transport was never established (fallback candidate).
    NotEstablished,
}

/// Per-audit supervisor over the repository and the WebSocket broadcast.
pub struct AuditRunner {
    repo: Arc<AuditRepository>,
    ws_tx: broadcast::Sender<String>,
    config: RunnerConfig,
}

impl AuditRunner {
    pub fn new(
        repo: Arc<AuditRepository>,
        ws_tx: broadcast::Sender<String>,
        config: RunnerConfig,
    ) -> Self {
        Self { repo, ws_tx, config }
    }

    /// Run one audit to its terminal event (or synthesized error).
    pub async fn run_audit(&self, request: &AuditRequest) -> Result<AuditOutcome> {
        self.repo
            .create(
                &request.audit_id,
                &request.url,
                request.tier.as_str(),
                request.verdict_mode.as_str(),
                &request.modules,
            )
            .context("Failed to create audit row")?;

        let mut mode = self.config.ipc_mode;
        let mut end = self.attempt(request, mode).await?;

        if matches!(end, AttemptEnd::NotEstablished) {
            if !self.config.use_stdout_fallback {
                let message = "queue transport not established and fallback disabled";
                self.repo
                    .mark_error(&request.audit_id, "ipc_transport_failed", message)?;
                self.synthesize_terminal_error(&request.audit_id, "ipc_transport_failed", message)?;
                return Ok(AuditOutcome {
                    audit_id: request.audit_id.clone(),
                    status: AuditStatus::Error,
                    ipc_mode_used: mode,
                    events_seen: self.repo.max_sequence_no(&request.audit_id)?,
                });
            }
            tracing::warn!(
                audit_id = %request.audit_id,
                "queue transport not established, respawning in stdout mode"
            );
            mode = IpcMode::Stdout;
            end = self.attempt(request, mode).await?;
        }
        self.repo.set_ipc_mode(&request.audit_id, mode.as_str())?;

        let status = match end {
            AttemptEnd::Terminal(status) => status,
            AttemptEnd::Died(exit_code) => {
                let message = format!(
                    "engine exited without a terminal event (exit code {})",
                    exit_code.map_or("unknown".to_string(), |c| c.to_string())
                );
                self.synthesize_terminal_error(&request.audit_id, "engine_died", &message)?;
                self.repo
                    .mark_error(&request.audit_id, "engine_died", &message)?;
                AuditStatus::Error
            }
            AttemptEnd::NotEstablished => {
                // Second attempt is stdout mode, which cannot fail to
                // establish; this arm is unreachable in practice but maps
                // to a transport error for safety.
                let message = "transport not established after fallback";
                self.repo
                    .mark_error(&request.audit_id, "ipc_transport_failed", message)?;
                self.synthesize_terminal_error(&request.audit_id, "ipc_transport_failed", message)?;
                AuditStatus::Error
            }
        };

        Ok(AuditOutcome {
            audit_id: request.audit_id.clone(),
            status,
            ipc_mode_used: mode,
            events_seen: self.repo.max_sequence_no(&request.audit_id)?,
        })
    }

    /// Spawn the engine once and consume its event stream to the end.
    async fn attempt(&self, request: &AuditRequest, mode: IpcMode) -> Result<AttemptEnd> {
        let socket_path = self
            .config
            .socket_dir
            .join(format!("{}.sock", request.audit_id));

        let listener = match mode {
            IpcMode::Queue => Some(self.bind_socket(&socket_path)?),
            IpcMode::Stdout => None,
        };

        let mut child = self.spawn_engine(request, mode, &socket_path)?;
        self.repo.set_status(&request.audit_id, AuditStatus::Running)?;

        let deadline = request.tier.budgets().wall_clock + self.config.grace;
        let read_result = {
            let read = self.read_events(request, mode, listener, &mut child);
            timeout(deadline, read).await
        };

        let end = match read_result {
            Ok(end) => end?,
            Err(_) => {
                tracing::warn!(audit_id = %request.audit_id, "global audit timeout, cancelling engine");
                self.terminate(&mut child).await;
                if self.repo.has_terminal_event(&request.audit_id)? {
                    AttemptEnd::Terminal(self.persisted_status(&request.audit_id)?)
                } else {
                    AttemptEnd::Died(None)
                }
            }
        };

        // The socket file is per-audit; remove it so mode switches between
        // audits leave no residue.
        let _ = std::fs::remove_file(&socket_path);
        Ok(end)
    }

    fn bind_socket(&self, path: &std::path::Path) -> Result<tokio::net::UnixListener> {
        std::fs::create_dir_all(&self.config.socket_dir)
            .context("Failed to create socket dir")?;
        let _ = std::fs::remove_file(path);
        tokio::net::UnixListener::bind(path)
            .with_context(|| format!("Failed to bind IPC socket {}", path.display()))
    }

    fn spawn_engine(
        &self,
        request: &AuditRequest,
        mode: IpcMode,
        socket_path: &std::path::Path,
    ) -> Result<Child> {
        let mut cmd = Command::new(&self.config.engine_binary);
        cmd.arg(&request.url)
            .arg("--tier")
            .arg(request.tier.as_str())
            .arg("--verdict-mode")
            .arg(request.verdict_mode.as_str())
            .arg("--audit-id")
            .arg(&request.audit_id)
            .arg("--ipc-mode")
            .arg(mode.as_str())
            .arg("--modules")
            .arg(request.modules.join(","));
        if mode == IpcMode::Queue {
            cmd.arg("--ipc-socket").arg(socket_path);
        }
        if self.config.use_stdout_fallback {
            cmd.arg("--use-stdout-fallback");
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        cmd.spawn().context("Failed to spawn engine process")
    }

    /// Pump events until the stream ends, then reap the child.
    async fn read_events(
        &self,
        request: &AuditRequest,
        mode: IpcMode,
        listener: Option<tokio::net::UnixListener>,
        child: &mut Child,
    ) -> Result<AttemptEnd> {
        let mut terminal: Option<AuditStatus> = None;

        match mode {
            IpcMode::Queue => {
                let listener = listener
                    .ok_or_else(|| anyhow::anyhow!("queue mode requires a bound listener"))?;
                let accepted =
                    timeout(self.config.queue_connect_timeout, listener.accept()).await;
                let stream = match accepted {
                    Ok(Ok((stream, _addr))) => stream,
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "IPC accept failed");
                        self.terminate(child).await;
                        return Ok(AttemptEnd::NotEstablished);
                    }
                    Err(_) => {
                        self.terminate(child).await;
                        return Ok(AttemptEnd::NotEstablished);
                    }
                };

                let mut reader = QueueEventReader::new(stream);
                while let Some(next) = reader.next_event().await {
                    match next {
                        Ok(event) => {
                            if let Some(status) = self.process_event(&event) {
                                terminal = Some(status);
                            }
                        }
                        Err(e) => {
                            // Queue mode is lossless; a decode fault is a
                            // transport failure, not a skippable line.
                            tracing::error!(error = %e, "queue transport fault");
                            break;
                        }
                    }
                }
            }
            IpcMode::Stdout => {
                let stdout = child
                    .stdout
                    .take()
                    .ok_or_else(|| anyhow::anyhow!("engine stdout not piped"))?;
                let mut reader = StdoutEventReader::new(stdout);
                while let Some(next) = reader.next_event().await {
                    match next {
                        Ok(event) => {
                            if let Some(status) = self.process_event(&event) {
                                terminal = Some(status);
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "stdout stream error");
                            break;
                        }
                    }
                }
                if reader.gaps() > 0 {
                    tracing::warn!(
                        audit_id = %request.audit_id,
                        gaps = reader.gaps(),
                        "stdout transport dropped malformed lines"
                    );
                }
            }
        }

        let status = child.wait().await.context("Failed to reap engine process")?;
        match terminal {
            Some(terminal_status) => Ok(AttemptEnd::Terminal(terminal_status)),
            None => Ok(AttemptEnd::Died(status.code())),
        }
    }

    /// Persist one event and forward it to WebSocket consumers. Returns the
    /// audit status when the event is terminal. Public so an embedding API
    /// can feed events from its own transport reader.
    pub fn process_event(&self, event: &ProgressEvent) -> Option<AuditStatus> {
        if self.repo.append_event_resilient(event) {
            tracing::warn!(audit_id = %event.audit_id, "audit is persistence-degraded");
        }

        match event.kind {
            EventKind::Finding => {
                if let Ok(finding) = serde_json::from_value::<Finding>(event.payload.clone()) {
                    if let Err(e) = self.repo.add_finding(&event.audit_id, &finding) {
                        tracing::warn!(error = %e, "finding insert failed");
                    }
                }
            }
            EventKind::PhaseProgress => {
                // Bursts of findings are coalesced by the bus into one
                // progress event with an array payload; unpack them here.
                if let Some(coalesced) = event.payload.get("findings").and_then(|f| f.as_array()) {
                    for entry in coalesced {
                        if let Ok(finding) = serde_json::from_value::<Finding>(entry.clone()) {
                            if let Err(e) = self.repo.add_finding(&event.audit_id, &finding) {
                                tracing::warn!(error = %e, "finding insert failed");
                            }
                        }
                    }
                }
            }
            EventKind::Screenshot => {
                if let Ok(meta) = serde_json::from_value::<ScreenshotMeta>(event.payload.clone()) {
                    if let Err(e) = self.repo.add_screenshot(&event.audit_id, &meta) {
                        tracing::warn!(error = %e, "screenshot insert failed");
                    }
                }
            }
            EventKind::AuditResult => {
                if let Err(e) = self.repo.complete(&event.audit_id, &event.payload) {
                    tracing::warn!(error = %e, "audit completion write failed");
                }
            }
            EventKind::AuditError => {
                let kind = event.payload["kind"].as_str().unwrap_or("engine_error");
                let message = event.payload["message"].as_str().unwrap_or("");
                if let Err(e) = self.repo.mark_error(&event.audit_id, kind, message) {
                    tracing::warn!(error = %e, "audit error write failed");
                }
            }
            _ => {}
        }

        ws::forward_event(&self.ws_tx, event);

        if event.kind.is_terminal() {
            let status = match event.kind {
                EventKind::AuditError => AuditStatus::Error,
                _ => event
                    .payload
                    .get("status")
                    .and_then(|s| s.as_str())
                    .and_then(|s| AuditStatus::from_str(s).ok())
                    .unwrap_or(AuditStatus::Completed),
            };
            if let Err(e) = self.repo.set_status(&event.audit_id, status) {
                tracing::warn!(error = %e, "terminal status write failed");
            }
            Some(status)
        } else {
            None
        }
    }

    /// Append a synthesized terminal `audit_error` with the next sequence
    /// number, then forward it like any other event.
    pub fn synthesize_terminal_error(&self, audit_id: &str, kind: &str, message: &str) -> Result<()> {
        let next_seq = self.repo.max_sequence_no(audit_id)? + 1;
        let event = EventDraft::audit_error(kind, message).into_event(audit_id, next_seq);
        self.repo
            .append_event(&event)
            .context("Failed to persist synthesized terminal event")?;
        ws::forward_event(&self.ws_tx, &event);
        Ok(())
    }

    fn persisted_status(&self, audit_id: &str) -> Result<AuditStatus> {
        let row = self
            .repo
            .get(audit_id)?
            .ok_or_else(|| anyhow::anyhow!("audit {audit_id} missing"))?;
        AuditStatus::from_str(&row.status).map_err(|e| anyhow::anyhow!(e))
    }

    /// Graceful SIGTERM, then force-kill after the cancel window.
    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            let delivered = std::process::Command::new("kill")
                .args(["-TERM", &pid.to_string()])
                .status()
                .map(|s| s.success())
                .unwrap_or(false);
            if delivered
                && timeout(self.config.graceful_cancel_timeout, child.wait())
                    .await
                    .is_ok()
            {
                return;
            }
        }
        if let Err(e) = child.kill().await {
            tracing::warn!(error = %e, "engine force-kill failed");
        }
    }
}
