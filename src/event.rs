//! Progress events: the sole unit of engine-to-API communication.
//!
//! A [`ProgressEvent`] is created in the engine process, carried over IPC,
//! persisted verbatim into `audit_events`, and forwarded to WebSocket
//! consumers. Per audit, `sequence_no` forms a gapless ascending sequence
//! starting at 1; the bus assigns numbers immediately before handing an
//! event to the transport so that coalescing never leaves holes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::state::{Finding, ScreenshotMeta};

/// Pipeline phase an event is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditPhase {
    Init,
    Scout,
    Security,
    Vision,
    Graph,
    Judge,
}

impl AuditPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Scout => "scout",
            Self::Security => "security",
            Self::Vision => "vision",
            Self::Graph => "graph",
            Self::Judge => "judge",
        }
    }
}

impl std::fmt::Display for AuditPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discriminant of a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PhaseStart,
    PhaseProgress,
    PhaseComplete,
    Finding,
    Screenshot,
    Log,
    AuditResult,
    AuditError,
    AuditComplete,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PhaseStart => "phase_start",
            Self::PhaseProgress => "phase_progress",
            Self::PhaseComplete => "phase_complete",
            Self::Finding => "finding",
            Self::Screenshot => "screenshot",
            Self::Log => "log",
            Self::AuditResult => "audit_result",
            Self::AuditError => "audit_error",
            Self::AuditComplete => "audit_complete",
        }
    }

    /// Terminal kinds end the audit's event stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AuditComplete | Self::AuditError)
    }

    /// Critical kinds bypass the bus throttle entirely.
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::AuditResult | Self::AuditError | Self::AuditComplete)
    }
}

/// A fully-formed event as it travels the wire and lands in storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub audit_id: String,
    pub sequence_no: u64,
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<AuditPhase>,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

/// An event before the bus has assigned its sequence number.
///
/// Producers build drafts; the bus pump turns them into [`ProgressEvent`]s
/// in emission order.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub kind: EventKind,
    pub phase: Option<AuditPhase>,
    pub payload: Value,
}

impl EventDraft {
    pub fn new(kind: EventKind, phase: Option<AuditPhase>, payload: Value) -> Self {
        Self { kind, phase, payload }
    }

    pub fn phase_start(phase: AuditPhase) -> Self {
        Self::new(
            EventKind::PhaseStart,
            Some(phase),
            json!({ "phase": phase.as_str() }),
        )
    }

    pub fn phase_progress(phase: AuditPhase, message: &str) -> Self {
        Self::new(
            EventKind::PhaseProgress,
            Some(phase),
            json!({ "message": message }),
        )
    }

    /// Successful completion of a stage.
    pub fn phase_complete(phase: AuditPhase, duration_ms: u64, finding_count: usize) -> Self {
        Self::new(
            EventKind::PhaseComplete,
            Some(phase),
            json!({
                "duration_ms": duration_ms,
                "finding_count": finding_count,
            }),
        )
    }

    /// Failed completion of a stage; the orchestrator still advances.
    pub fn phase_failed(phase: AuditPhase, duration_ms: u64, kind: &str, message: &str) -> Self {
        Self::new(
            EventKind::PhaseComplete,
            Some(phase),
            json!({
                "duration_ms": duration_ms,
                "error": { "kind": kind, "message": message },
            }),
        )
    }

    pub fn finding(phase: AuditPhase, finding: &Finding) -> Self {
        Self::new(
            EventKind::Finding,
            Some(phase),
            serde_json::to_value(finding).unwrap_or(Value::Null),
        )
    }

    pub fn screenshot(phase: AuditPhase, meta: &ScreenshotMeta) -> Self {
        Self::new(
            EventKind::Screenshot,
            Some(phase),
            serde_json::to_value(meta).unwrap_or(Value::Null),
        )
    }

    pub fn log(phase: Option<AuditPhase>, level: &str, message: &str) -> Self {
        Self::new(
            EventKind::Log,
            phase,
            json!({ "level": level, "message": message }),
        )
    }

    pub fn audit_result(summary: Value) -> Self {
        Self::new(EventKind::AuditResult, None, summary)
    }

    pub fn audit_error(kind: &str, message: &str) -> Self {
        Self::new(
            EventKind::AuditError,
            None,
            json!({ "kind": kind, "message": message }),
        )
    }

    pub fn audit_complete(status: &str) -> Self {
        Self::new(EventKind::AuditComplete, None, json!({ "status": status }))
    }

    /// Coalesce a burst of finding drafts into one `phase_progress` with an
    /// array payload, preserving arrival order.
    pub fn coalesce_findings(phase: Option<AuditPhase>, drafts: Vec<EventDraft>) -> Self {
        let findings: Vec<Value> = drafts.into_iter().map(|d| d.payload).collect();
        Self::new(
            EventKind::PhaseProgress,
            phase,
            json!({ "findings": findings }),
        )
    }

    /// Seal this draft into a wire event.
    pub fn into_event(self, audit_id: &str, sequence_no: u64) -> ProgressEvent {
        ProgressEvent {
            audit_id: audit_id.to_string(),
            sequence_no,
            kind: self.kind,
            phase: self.phase,
            payload: self.payload,
            timestamp: Utc::now(),
        }
    }
}
