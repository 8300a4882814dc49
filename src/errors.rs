//! Typed error hierarchy for the audit engine.
//!
//! Three top-level enums cover the three subsystems:
//! - `AgentError`: per-agent failures, carrying the wire `kind` strings
//! - `TransportError`: IPC delivery failures
//! - `EngineError`: engine lifecycle failures (bus, wiring, spawn)
//!
//! Repository code uses `anyhow::Result` at its seams, matching how the
//! store layer is written elsewhere in the crate.

use thiserror::Error;

use crate::event::AuditPhase;

/// Errors returned by agents through the contract in `agents::Agent`.
///
/// Every variant maps to a stable snake_case `kind` string used in event
/// payloads and in the persisted `errors_json` column.
#[derive(Debug, Clone, Error)]
pub enum AgentError {
    #[error("Page is behind a CAPTCHA challenge")]
    CaptchaBlocked,

    #[error("Page refused automated access")]
    BotBlocked,

    #[error("Navigation timed out")]
    NavigationTimeout,

    #[error("DNS resolution failed: {0}")]
    DnsFailed(String),

    #[error("Security module '{module}' timed out")]
    ModuleTimeout { module: String },

    #[error("Security module '{module}' failed: {message}")]
    ModuleError { module: String, message: String },

    #[error("VLM call timed out")]
    VlmTimeout,

    #[error("VLM backend unavailable")]
    VlmUnavailable,

    #[error("VLM credit budget exhausted")]
    VlmCreditExhausted,

    #[error("OSINT source '{source_name}' timed out")]
    SourceTimeout { source_name: String },

    #[error("Graph investigation timed out")]
    GraphTimeout,

    #[error("Judge unavailable: {0}")]
    JudgeUnavailable(String),

    #[error("Stage deadline elapsed")]
    Timeout,

    #[error("Cancelled")]
    Cancelled,

    #[error("Agent ignored cancellation and was forcibly terminated")]
    CancelEscalated,

    #[error("{0}")]
    Failed(String),
}

impl AgentError {
    /// Stable wire identifier for this error, per the engine's error taxonomy.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CaptchaBlocked => "captcha_blocked",
            Self::BotBlocked => "bot_blocked",
            Self::NavigationTimeout => "navigation_timeout",
            Self::DnsFailed(_) => "dns_failed",
            Self::ModuleTimeout { .. } => "module_timeout",
            Self::ModuleError { .. } => "module_error",
            Self::VlmTimeout => "vlm_timeout",
            Self::VlmUnavailable => "vlm_unavailable",
            Self::VlmCreditExhausted => "vlm_credit_exhausted",
            Self::SourceTimeout { .. } => "source_timeout",
            Self::GraphTimeout => "graph_timeout",
            Self::JudgeUnavailable(_) => "judge_unavailable",
            Self::Timeout => "agent_timeout",
            Self::Cancelled => "cancelled",
            Self::CancelEscalated => "cancel_escalated",
            Self::Failed(_) => "agent_error",
        }
    }

    /// Whether a scout hitting this error should retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NavigationTimeout | Self::DnsFailed(_) | Self::Failed(_)
        )
    }

    /// Whether this is a scout block (counts against `scout_failures`).
    pub fn is_block(&self) -> bool {
        matches!(self, Self::CaptchaBlocked | Self::BotBlocked)
    }

    /// Record this error against a phase for the audit's error log.
    pub fn into_record(self, phase: AuditPhase) -> crate::state::ErrorRecord {
        crate::state::ErrorRecord::new(self.kind(), Some(phase), self.to_string())
    }
}

/// Errors from the IPC transport layer (either mode, either side).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Transport closed")]
    Closed,

    #[error("Transport not established within {0:?}")]
    NotEstablished(std::time::Duration),
}

/// Errors from the engine process lifecycle.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The event bus was closed; no further events can be published.
    #[error("Engine halted: event bus is closed")]
    EngineHalted,

    #[error("IPC transport failed: {0}")]
    IpcTransportFailed(#[from] TransportError),

    #[error("Invalid audit URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Stable wire identifier for terminal `audit_error` payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EngineHalted => "engine_halted",
            Self::IpcTransportFailed(_) => "ipc_transport_failed",
            Self::InvalidUrl { .. } => "invalid_url",
            Self::Other(_) => "engine_error",
        }
    }
}
