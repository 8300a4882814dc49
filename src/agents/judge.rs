//! Judge agent: weighs the accumulated evidence into a routing decision
//! and, when finalizing, the verdict itself.
//!
//! The built-in judge is deterministic. It requests further investigation
//! only when the evidence is genuinely ambiguous and fresh candidate URLs
//! exist; everything else finalizes. `synthesize_verdict` is also the
//! engine's force-verdict path, so degraded synthesis lives here too.

use async_trait::async_trait;

use super::{Agent, AgentContext};
use crate::errors::AgentError;
use crate::event::{AuditPhase, EventDraft};
use crate::state::{
    AuditState, DEGRADED_SCORE_CAP, JudgeAction, JudgeDecision, RiskLevel, Severity, StatePatch,
    Verdict, VerdictMode,
};

/// Mean module score band treated as "unclear, worth digging further".
const UNCERTAIN_BAND: (f64, f64) = (0.4, 0.75);

/// Candidate URLs requested per investigation round.
const MAX_INVESTIGATE_URLS: usize = 3;

pub struct JudgeAgent;

impl JudgeAgent {
    pub fn new() -> Self {
        Self
    }
}

impl Default for JudgeAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Agent for JudgeAgent {
    fn phase(&self) -> AuditPhase {
        AuditPhase::Judge
    }

    async fn analyze(
        &self,
        snapshot: &AuditState,
        ctx: &AgentContext,
    ) -> Result<StatePatch, AgentError> {
        let candidates = candidate_urls(snapshot);
        let mean = mean_module_score(snapshot);
        let uncertain = mean > UNCERTAIN_BAND.0 && mean < UNCERTAIN_BAND.1;

        let decision = if uncertain && !candidates.is_empty() {
            let _ = ctx
                .bus
                .publish(EventDraft::phase_progress(
                    AuditPhase::Judge,
                    &format!(
                        "evidence inconclusive (mean module score {mean:.2}); requesting {} more page(s)",
                        candidates.len()
                    ),
                ))
                .await;
            JudgeDecision {
                action: JudgeAction::RequestMoreInvestigation,
                investigate_urls: candidates,
                verdict: None,
            }
        } else {
            JudgeDecision {
                action: JudgeAction::Finalize,
                investigate_urls: Vec::new(),
                verdict: Some(synthesize_verdict(snapshot, snapshot.degraded)),
            }
        };

        Ok(StatePatch {
            judge_decision: Some(decision),
            ..StatePatch::default()
        })
    }
}

/// Same-site links seen by the latest scout that have not been visited.
fn candidate_urls(state: &AuditState) -> Vec<String> {
    let Some(scout) = state.latest_scout() else {
        return Vec::new();
    };
    scout
        .links
        .iter()
        .filter(|link| !state.investigated_urls.contains(*link))
        .take(MAX_INVESTIGATE_URLS)
        .cloned()
        .collect()
}

fn mean_module_score(state: &AuditState) -> f64 {
    if state.security_results.is_empty() {
        return 0.5;
    }
    let sum: f64 = state.security_results.values().map(|r| r.score).sum();
    sum / state.security_results.len() as f64
}

/// Build a verdict from whatever evidence has accumulated. Used by the
/// judge on the finalize path and by the engine on every force-verdict
/// branch; `degraded` caps the score and flags the result.
pub fn synthesize_verdict(state: &AuditState, degraded: bool) -> Verdict {
    let mut score = mean_module_score(state) * 100.0;

    if let Some(vision) = &state.vision_result {
        for finding in &vision.findings {
            score -= match finding.severity {
                Severity::Info => 0.0,
                Severity::Low => 2.0,
                Severity::Medium => 5.0,
                Severity::High => 10.0,
                Severity::Critical => 18.0,
            } * finding.confidence;
        }
    }
    if let Some(graph) = &state.graph_result {
        score -= 6.0 * graph.contradicted_entities.len() as f64;
        score += (2.0 * graph.verified_entities.len() as f64).min(10.0);
    }
    // Persistent trouble during the audit is itself a signal.
    score -= (state.errors.len() as f64).min(5.0);

    let mut trust_score = score.clamp(0.0, 100.0).round() as u8;
    let degraded = degraded || state.degraded;
    if degraded {
        trust_score = trust_score.min(DEGRADED_SCORE_CAP);
    }

    let risk_level = RiskLevel::from_trust_score(trust_score);
    let site_type = classify_site_type(state);
    let summary = summary_for(trust_score, risk_level, degraded);
    let expert_notes = match state.verdict_mode {
        VerdictMode::Simple => None,
        VerdictMode::Expert => Some(expert_notes_for(state)),
    };

    Verdict {
        trust_score,
        risk_level,
        summary,
        expert_notes,
        site_type,
        degraded,
    }
}

fn summary_for(trust_score: u8, risk: RiskLevel, degraded: bool) -> String {
    let base = match risk {
        RiskLevel::Low => format!(
            "This site shows the markers of a legitimate operation (trust {trust_score}/100)."
        ),
        RiskLevel::Medium => format!(
            "This site has some concerning signals; proceed with care (trust {trust_score}/100)."
        ),
        RiskLevel::High => format!(
            "This site shows several risk markers; avoid sharing personal or payment details (trust {trust_score}/100)."
        ),
        RiskLevel::Critical => format!(
            "This site matches known scam patterns; do not use it (trust {trust_score}/100)."
        ),
    };
    if degraded {
        format!("{base} Evidence was incomplete, so the score is capped.")
    } else {
        base
    }
}

fn expert_notes_for(state: &AuditState) -> String {
    let mut notes = Vec::new();
    for (name, result) in &state.security_results {
        notes.push(format!(
            "{name}: score {:.2}, {} finding(s), {} error(s)",
            result.score,
            result.findings.len(),
            result.errors.len()
        ));
    }
    if let Some(vision) = &state.vision_result {
        notes.push(format!(
            "vision: {} finding(s){}",
            vision.findings.len(),
            if vision.degraded { " (degraded)" } else { "" }
        ));
    }
    if let Some(graph) = &state.graph_result {
        notes.push(format!(
            "graph: {} verified, {} contradicted across {} source(s)",
            graph.verified_entities.len(),
            graph.contradicted_entities.len(),
            graph.sources.len()
        ));
    }
    notes.push(format!(
        "pages: {}, iterations: {}, errors: {}",
        state.pages_visited(),
        state.iteration,
        state.errors.len()
    ));
    notes.join("; ")
}

/// Rough content classification for the verdict record.
fn classify_site_type(state: &AuditState) -> Option<String> {
    let scout = state.latest_scout()?;
    let excerpt: String = scout.dom_text.chars().take(2000).collect();
    let haystack = format!(
        "{} {excerpt}",
        scout.title.clone().unwrap_or_default()
    )
    .to_lowercase();

    let classes: [(&str, &[&str]); 5] = [
        ("ecommerce", &["add to cart", "checkout", "free shipping"]),
        ("financial", &["investment", "crypto", "trading", "wallet"]),
        ("encyclopedia", &["encyclopedia", "wikipedia"]),
        ("news", &["breaking news", "newsletter", "headlines"]),
        ("saas", &["pricing", "free trial", "sign up"]),
    ];
    classes
        .iter()
        .find(|(_, markers)| markers.iter().any(|m| haystack.contains(m)))
        .map(|(label, _)| label.to_string())
}
