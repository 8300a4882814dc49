//! Vision agent: dark-pattern analysis over captured screenshots.
//!
//! The VLM itself lives behind the [`ScreenshotAnalyzer`] seam; the agent
//! owns credit accounting and degradation. With no analyzer wired (the
//! default) the stage reports `vlm_unavailable` and the pipeline continues
//! on the degraded edge.

use std::sync::Arc;

use async_trait::async_trait;

use super::{Agent, AgentContext};
use crate::errors::AgentError;
use crate::event::{AuditPhase, EventDraft};
use crate::state::{AuditState, Finding, ScreenshotMeta, StatePatch, VisionReport};

/// What one analyzer invocation produced.
#[derive(Debug, Clone)]
pub struct VisionAnalysis {
    pub findings: Vec<Finding>,
    pub temporal_notes: Vec<String>,
    /// VLM credit units this invocation consumed.
    pub credits_used: u32,
}

/// The VLM seam. Implementations receive the screenshots of the latest
/// scout visit and a credit ceiling they must not exceed.
#[async_trait]
pub trait ScreenshotAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        screenshots: &[ScreenshotMeta],
        credit_ceiling: u32,
    ) -> Result<VisionAnalysis, AgentError>;
}

/// Default analyzer: no VLM configured.
pub struct UnavailableAnalyzer;

#[async_trait]
impl ScreenshotAnalyzer for UnavailableAnalyzer {
    async fn analyze(
        &self,
        _screenshots: &[ScreenshotMeta],
        _credit_ceiling: u32,
    ) -> Result<VisionAnalysis, AgentError> {
        Err(AgentError::VlmUnavailable)
    }
}

/// Vision agent wrapping an analyzer.
pub struct VisionAgent {
    analyzer: Arc<dyn ScreenshotAnalyzer>,
}

impl VisionAgent {
    pub fn new(analyzer: Arc<dyn ScreenshotAnalyzer>) -> Self {
        Self { analyzer }
    }
}

#[async_trait]
impl Agent for VisionAgent {
    fn phase(&self) -> AuditPhase {
        AuditPhase::Vision
    }

    async fn analyze(
        &self,
        snapshot: &AuditState,
        ctx: &AgentContext,
    ) -> Result<StatePatch, AgentError> {
        let remaining = snapshot
            .max_vlm_credits
            .saturating_sub(snapshot.nim_calls_used);
        if remaining == 0 {
            return Err(AgentError::VlmCreditExhausted);
        }

        let screenshots: Vec<ScreenshotMeta> = snapshot
            .latest_scout()
            .map(|s| s.screenshots.clone())
            .unwrap_or_default();
        if screenshots.is_empty() {
            // Nothing to look at: a degraded report, not an error. Missing
            // vision evidence does not cap the audit by itself.
            return Ok(StatePatch {
                vision_result: Some(VisionReport {
                    findings: Vec::new(),
                    temporal_notes: Vec::new(),
                    credits_used: 0,
                    degraded: true,
                }),
                ..StatePatch::default()
            });
        }

        let analysis = tokio::select! {
            result = self.analyzer.analyze(&screenshots, remaining) => result?,
            _ = ctx.cancel.cancelled() => return Err(AgentError::Cancelled),
        };

        // An analyzer overrunning its ceiling still counts against the
        // budget; the tracker predicate trips on the next decision point.
        let credits_used = analysis.credits_used;
        for finding in &analysis.findings {
            let _ = ctx
                .bus
                .publish(EventDraft::finding(AuditPhase::Vision, finding))
                .await;
        }

        Ok(StatePatch {
            vision_result: Some(VisionReport {
                findings: analysis.findings,
                temporal_notes: analysis.temporal_notes,
                credits_used,
                degraded: false,
            }),
            vlm_credits_spent: credits_used,
            ..StatePatch::default()
        })
    }
}
