//! Audit state and the record types produced by the agent pipeline.
//!
//! `AuditState` is the single mutable record threaded through the state
//! machine. The orchestrator owns it exclusively; stage runners receive a
//! read-only snapshot and hand back a [`StatePatch`] which the orchestrator
//! applies serially. This keeps all mutation on one task and makes the
//! "no races in AuditState" property hold by construction.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::budget::TierBudgets;
use crate::event::AuditPhase;
use crate::errors::EngineError;

/// Scout blocks tolerated before the audit gives up on the current URL.
pub const SCOUT_FAILURE_CAP: u32 = 3;

/// Trust score ceiling applied when the audit ran in degraded mode.
pub const DEGRADED_SCORE_CAP: u8 = 50;

// ── Enumerations ─────────────────────────────────────────────────────

/// Audit depth tier; selects budget limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    QuickScan,
    StandardAudit,
    DeepForensic,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QuickScan => "quick_scan",
            Self::StandardAudit => "standard_audit",
            Self::DeepForensic => "deep_forensic",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "quick_scan" => Ok(Self::QuickScan),
            "standard_audit" => Ok(Self::StandardAudit),
            "deep_forensic" => Ok(Self::DeepForensic),
            other => Err(format!("unknown tier: {other}")),
        }
    }

    /// Budget limits for this tier.
    pub fn budgets(&self) -> TierBudgets {
        match self {
            Self::QuickScan => TierBudgets::new(1, 1, 3, 60),
            Self::StandardAudit => TierBudgets::new(3, 5, 12, 180),
            Self::DeepForensic => TierBudgets::new(5, 10, 30, 600),
        }
    }
}

/// Verdict wording: plain-language or technical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictMode {
    Simple,
    Expert,
}

impl VerdictMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Expert => "expert",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "simple" => Ok(Self::Simple),
            "expert" => Ok(Self::Expert),
            other => Err(format!("unknown verdict mode: {other}")),
        }
    }
}

/// Lifecycle status of an audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Queued,
    Running,
    Completed,
    Aborted,
    Error,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "aborted" => Ok(Self::Aborted),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown audit status: {other}")),
        }
    }
}

/// Risk classification attached to the final verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Risk band for a 0-100 trust score.
    pub fn from_trust_score(score: u8) -> Self {
        match score {
            70..=100 => Self::Low,
            50..=69 => Self::Medium,
            30..=49 => Self::High,
            _ => Self::Critical,
        }
    }
}

/// Severity of an individual finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

// ── Record types ─────────────────────────────────────────────────────

/// A single piece of evidence against (or for) the target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub pattern_type: String,
    pub category: String,
    pub severity: Severity,
    /// Producer confidence in [0, 1].
    pub confidence: f64,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_index: Option<u32>,
}

impl Finding {
    pub fn new(
        pattern_type: &str,
        category: &str,
        severity: Severity,
        confidence: f64,
        description: impl Into<String>,
    ) -> Self {
        Self {
            pattern_type: pattern_type.to_string(),
            category: category.to_string(),
            severity,
            confidence: confidence.clamp(0.0, 1.0),
            description: description.into(),
            screenshot_index: None,
        }
    }

    pub fn with_screenshot(mut self, index: u32) -> Self {
        self.screenshot_index = Some(index);
        self
    }
}

/// Filesystem reference to a captured screenshot; the binary payload lives
/// on disk, never in the database or on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenshotMeta {
    pub path: String,
    pub label: String,
    pub index: u32,
    pub size_bytes: u64,
    pub mime: String,
}

/// Output of one scout visit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoutResult {
    pub url: String,
    pub final_url: String,
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Visible text extracted from the DOM, truncated by the scout.
    pub dom_text: String,
    /// Same-site outbound links, candidates for further investigation.
    pub links: Vec<String>,
    pub screenshots: Vec<ScreenshotMeta>,
    pub fetched_at: DateTime<Utc>,
}

impl ScoutResult {
    /// A page that yielded no usable content still advances the pipeline,
    /// but flips the audit into degraded mode.
    pub fn is_usable(&self) -> bool {
        !self.dom_text.trim().is_empty() || !self.screenshots.is_empty()
    }
}

/// Output of one security module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleResult {
    pub module: String,
    /// Safety score in [0, 1]; 1.0 is clean.
    pub score: f64,
    pub findings: Vec<Finding>,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

/// Output of the vision stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionReport {
    pub findings: Vec<Finding>,
    /// Observations across sequential screenshots (countdowns, rotating
    /// claims), empty when only one capture exists.
    pub temporal_notes: Vec<String>,
    pub credits_used: u32,
    pub degraded: bool,
}

/// Per-source OSINT subreport inside a [`GraphReport`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceReport {
    pub source: String,
    pub available: bool,
    pub verified: Vec<String>,
    pub contradicted: Vec<String>,
    pub notes: Vec<String>,
}

/// Output of the graph stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphReport {
    pub verified_entities: Vec<String>,
    pub contradicted_entities: Vec<String>,
    pub sources: Vec<SourceReport>,
    pub degraded: bool,
}

/// Routing decision produced by the judge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgeAction {
    Finalize,
    RequestMoreInvestigation,
    Abort,
}

/// The final (or candidate) verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    /// Trust score in [0, 100]; higher is safer.
    pub trust_score: u8,
    pub risk_level: RiskLevel,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expert_notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_type: Option<String>,
    pub degraded: bool,
}

/// Judge output: a routing action plus, when finalizing, the verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeDecision {
    pub action: JudgeAction,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub investigate_urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
}

/// Structured error entry appended to `AuditState.errors`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<AuditPhase>,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(kind: &str, phase: Option<AuditPhase>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            phase,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

// ── AuditState ───────────────────────────────────────────────────────

/// The single mutable record threaded through the state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditState {
    pub audit_id: String,
    pub url: String,
    pub tier: Tier,
    pub verdict_mode: VerdictMode,
    /// Security module ids selected for this audit; empty means all
    /// registered modules.
    pub enabled_modules: Vec<String>,
    pub iteration: u32,
    pub max_iterations: u32,
    pub max_pages: u32,
    pub max_vlm_credits: u32,
    pub status: AuditStatus,
    /// URLs queued for investigation, in order. A URL appears at most once
    /// across `pending_urls` and `investigated_urls`.
    pub pending_urls: Vec<String>,
    pub investigated_urls: BTreeSet<String>,
    pub scout_results: Vec<ScoutResult>,
    pub security_results: BTreeMap<String, ModuleResult>,
    pub vision_result: Option<VisionReport>,
    pub graph_result: Option<GraphReport>,
    pub judge_decision: Option<JudgeDecision>,
    pub errors: Vec<ErrorRecord>,
    pub scout_failures: u32,
    pub nim_calls_used: u32,
    /// Set when evidence is incomplete; caps the final trust score.
    pub degraded: bool,
    pub started_at: DateTime<Utc>,
}

impl AuditState {
    /// Create the initial state for an audit. Fails on a syntactically
    /// invalid or non-http(s) URL.
    pub fn new(
        audit_id: &str,
        url: &str,
        tier: Tier,
        verdict_mode: VerdictMode,
    ) -> Result<Self, EngineError> {
        let parsed = Url::parse(url).map_err(|e| EngineError::InvalidUrl {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(EngineError::InvalidUrl {
                url: url.to_string(),
                message: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }

        let budgets = tier.budgets();
        Ok(Self {
            audit_id: audit_id.to_string(),
            url: url.to_string(),
            tier,
            verdict_mode,
            enabled_modules: Vec::new(),
            iteration: 0,
            max_iterations: budgets.max_iterations,
            max_pages: budgets.max_pages,
            max_vlm_credits: budgets.max_vlm_credits,
            status: AuditStatus::Queued,
            pending_urls: vec![url.to_string()],
            investigated_urls: BTreeSet::new(),
            scout_results: Vec::new(),
            security_results: BTreeMap::new(),
            vision_result: None,
            graph_result: None,
            judge_decision: None,
            errors: Vec::new(),
            scout_failures: 0,
            nim_calls_used: 0,
            degraded: false,
            started_at: Utc::now(),
        })
    }

    pub fn with_modules(mut self, modules: Vec<String>) -> Self {
        self.enabled_modules = modules;
        self
    }

    pub fn elapsed_seconds(&self) -> f64 {
        (Utc::now() - self.started_at).num_milliseconds().max(0) as f64 / 1000.0
    }

    pub fn pages_visited(&self) -> u32 {
        self.investigated_urls.len() as u32
    }

    /// The scout result for the most recent visit, if any.
    pub fn latest_scout(&self) -> Option<&ScoutResult> {
        self.scout_results.last()
    }

    /// Reset per-iteration stage outputs. Called once per Scout entry.
    pub fn begin_iteration(&mut self) {
        self.iteration += 1;
        self.vision_result = None;
        self.graph_result = None;
        self.judge_decision = None;
    }

    /// Queue URLs for the next iteration, dropping anything already seen.
    /// Returns how many URLs were actually queued.
    pub fn queue_urls<I: IntoIterator<Item = String>>(&mut self, urls: I) -> usize {
        let mut queued = 0;
        for url in urls {
            if !self.investigated_urls.contains(&url) && !self.pending_urls.contains(&url) {
                self.pending_urls.push(url);
                queued += 1;
            }
        }
        queued
    }

    /// The final verdict, when one has been reached.
    pub fn verdict(&self) -> Option<&Verdict> {
        self.judge_decision.as_ref().and_then(|d| d.verdict.as_ref())
    }

    /// Flat summary used for the `audit_result` event payload and the
    /// `audits` row update.
    pub fn result_summary(&self) -> serde_json::Value {
        let verdict = self.verdict();
        serde_json::json!({
            "audit_id": self.audit_id,
            "url": self.url,
            "status": self.status.as_str(),
            "tier": self.tier.as_str(),
            "iteration": self.iteration,
            "pages_scanned": self.pages_visited(),
            "screenshots_count": self
                .scout_results
                .iter()
                .map(|s| s.screenshots.len())
                .sum::<usize>(),
            "vlm_calls_used": self.nim_calls_used,
            "elapsed_seconds": self.elapsed_seconds(),
            "degraded": self.degraded,
            "trust_score": verdict.map(|v| v.trust_score),
            "risk_level": verdict.map(|v| v.risk_level.as_str()),
            "verdict_summary": verdict.map(|v| v.summary.clone()),
            "site_type": verdict.and_then(|v| v.site_type.clone()),
            "errors": self.errors,
        })
    }
}

// ── StatePatch ───────────────────────────────────────────────────────

/// Field updates returned by a stage runner, applied serially by the
/// orchestrator. Absent fields leave the state untouched.
#[derive(Debug, Clone, Default)]
pub struct StatePatch {
    pub scout_result: Option<ScoutResult>,
    /// URL moved from pending to investigated.
    pub investigated_url: Option<String>,
    /// Candidate URLs harvested during the stage.
    pub discovered_urls: Vec<String>,
    pub security_results: BTreeMap<String, ModuleResult>,
    pub vision_result: Option<VisionReport>,
    pub graph_result: Option<GraphReport>,
    pub judge_decision: Option<JudgeDecision>,
    pub errors: Vec<ErrorRecord>,
    /// Increment `scout_failures` (a block was observed).
    pub scout_blocked: bool,
    /// VLM credit units consumed during the stage.
    pub vlm_credits_spent: u32,
    /// Force the audit into degraded mode.
    pub degraded: bool,
}

impl StatePatch {
    pub fn error(record: ErrorRecord) -> Self {
        Self {
            errors: vec![record],
            ..Self::default()
        }
    }

    /// Apply this patch. The only mutation path for stage output.
    pub fn apply(self, state: &mut AuditState) {
        if let Some(url) = self.investigated_url {
            state.pending_urls.retain(|u| u != &url);
            state.investigated_urls.insert(url);
        }
        if let Some(scout) = self.scout_result {
            state.scout_results.push(scout);
        }
        if !self.discovered_urls.is_empty() {
            state.queue_urls(self.discovered_urls);
        }
        for (module, result) in self.security_results {
            state.security_results.insert(module, result);
        }
        if let Some(vision) = self.vision_result {
            state.vision_result = Some(vision);
        }
        if let Some(graph) = self.graph_result {
            state.graph_result = Some(graph);
        }
        if let Some(decision) = self.judge_decision {
            state.judge_decision = Some(decision);
        }
        state.errors.extend(self.errors);
        if self.scout_blocked {
            state.scout_failures += 1;
        }
        state.nim_calls_used += self.vlm_credits_spent;
        if self.degraded {
            state.degraded = true;
        }
    }
}
