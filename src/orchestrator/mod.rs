//! The audit state machine.
//!
//! One tight loop drives Scout → Security → Vision → Graph → Judge, with
//! the judge's request-more-investigation edge cycling back to Scout for
//! the next iteration. Every hard stop (budget, deadline, fatal error,
//! cancellation after Scout) lands in `ForceVerdict`, which synthesizes a
//! degraded verdict from whatever evidence accumulated: an audit that got
//! past Scout always ends with a verdict, never a bare error.
//!
//! The orchestrator is the sole owner of [`AuditState`]; stages see a
//! snapshot and return patches which are applied here, serially.

use tokio_util::sync::CancellationToken;

use crate::agents::{AgentContext, AgentSet};
use crate::agents::judge::synthesize_verdict;
use crate::budget::BudgetTracker;
use crate::bus::EventBus;
use crate::config::EngineConfig;
use crate::event::{AuditPhase, EventDraft};
use crate::stage::StageRunner;
use crate::state::{
    AuditState, AuditStatus, ErrorRecord, JudgeAction, JudgeDecision, SCOUT_FAILURE_CAP,
};

/// Machine states. `ForceVerdict` and `Terminal` are control states; the
/// rest map one-to-one onto pipeline phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Init,
    Scout,
    Security,
    Vision,
    Graph,
    Judge,
    ForceVerdict,
    Terminal,
}

/// Drives one audit from `init` to `terminal`.
pub struct Orchestrator {
    state: AuditState,
    agents: AgentSet,
    runner: StageRunner,
    budget: BudgetTracker,
    bus: EventBus,
    cancel: CancellationToken,
    scout_retry: crate::config::ScoutRetryConfig,
    /// Set once Scout has landed a page; gates force-verdict vs abort on
    /// cancellation.
    scout_completed: bool,
    /// Whether the next Scout entry starts a fresh iteration (as opposed to
    /// re-trying a blocked URL).
    new_iteration: bool,
}

impl Orchestrator {
    pub fn new(
        state: AuditState,
        agents: AgentSet,
        config: &EngineConfig,
        bus: EventBus,
        cancel: CancellationToken,
    ) -> Self {
        let budget = BudgetTracker::new(state.tier.budgets());
        let runner = StageRunner::new(config.stages.clone(), config.scout_retry.clone());
        Self {
            state,
            agents,
            runner,
            budget,
            bus,
            cancel,
            scout_retry: config.scout_retry.clone(),
            scout_completed: false,
            new_iteration: true,
        }
    }

    fn ctx(&self) -> AgentContext {
        AgentContext {
            audit_id: self.state.audit_id.clone(),
            bus: self.bus.clone(),
            cancel: self.cancel.clone(),
            deadline: self.budget.remaining_wall_clock(),
        }
    }

    /// Run the machine to terminal and hand the final state back.
    pub async fn run(mut self) -> AuditState {
        let mut machine = EngineState::Init;

        loop {
            // Global edges, checked before every stage: cancellation and
            // the wall-clock deadline preempt whatever was next.
            if !matches!(machine, EngineState::ForceVerdict | EngineState::Terminal) {
                if self.cancel.is_cancelled() {
                    machine = if self.scout_completed {
                        EngineState::ForceVerdict
                    } else {
                        self.state.status = AuditStatus::Aborted;
                        EngineState::Terminal
                    };
                } else if self.budget.deadline_reached() {
                    self.push_budget_error("deadline_reached");
                    machine = EngineState::ForceVerdict;
                }
            }

            machine = match machine {
                EngineState::Init => self.on_init().await,
                EngineState::Scout => self.on_scout().await,
                EngineState::Security => self.on_security().await,
                EngineState::Vision => self.on_vision().await,
                EngineState::Graph => self.on_graph().await,
                EngineState::Judge => self.on_judge().await,
                EngineState::ForceVerdict => self.on_force_verdict().await,
                EngineState::Terminal => break,
            };
        }

        self.state
    }

    async fn on_init(&mut self) -> EngineState {
        self.state.status = AuditStatus::Running;
        let _ = self
            .bus
            .publish(EventDraft::log(
                Some(AuditPhase::Init),
                "info",
                &format!(
                    "audit {} started: {} ({})",
                    self.state.audit_id,
                    self.state.url,
                    self.state.tier.as_str()
                ),
            ))
            .await;
        EngineState::Scout
    }

    async fn on_scout(&mut self) -> EngineState {
        if self.new_iteration {
            self.state.begin_iteration();
            self.budget.record_iteration();
            self.new_iteration = false;
        }

        if self.budget.pages_exhausted() {
            self.push_budget_error("pages_exhausted");
            return EngineState::ForceVerdict;
        }
        if self.state.pending_urls.is_empty() {
            self.state
                .errors
                .push(ErrorRecord::new("agent_error", Some(AuditPhase::Scout), "no URLs left to scout"));
            return EngineState::ForceVerdict;
        }

        let snapshot = self.state.clone();
        let outcome = self
            .runner
            .run(&self.agents.scout, &snapshot, &self.ctx(), self.budget.remaining_wall_clock())
            .await;

        match &outcome.error {
            None => {
                let usable = outcome
                    .patch
                    .scout_result
                    .as_ref()
                    .is_some_and(|r| r.is_usable());
                outcome.patch.apply(&mut self.state);
                self.budget.record_page();
                self.scout_completed = true;
                if !usable {
                    // Nothing usable came back; keep going, but the final
                    // score is capped.
                    self.state.degraded = true;
                }
                EngineState::Security
            }
            Some(e) if e.kind() == "cancel_escalated" || e.kind() == "cancelled" => {
                outcome.patch.apply(&mut self.state);
                self.state.status = AuditStatus::Aborted;
                EngineState::Terminal
            }
            Some(_) => {
                // Blocks and hard fetch failures alike count against the cap.
                let mut patch = outcome.patch;
                patch.scout_blocked = true;
                patch.apply(&mut self.state);

                if self.state.scout_failures >= SCOUT_FAILURE_CAP {
                    EngineState::ForceVerdict
                } else {
                    // Same URL, backed off.
                    let backoff = self
                        .scout_retry
                        .backoff_for(self.state.scout_failures.saturating_sub(1))
                        .min(self.budget.remaining_wall_clock());
                    tokio::time::sleep(backoff).await;
                    EngineState::Scout
                }
            }
        }
    }

    async fn on_security(&mut self) -> EngineState {
        let snapshot = self.state.clone();
        let outcome = self
            .runner
            .run(&self.agents.security, &snapshot, &self.ctx(), self.budget.remaining_wall_clock())
            .await;
        // Module errors are already findings inside the patch; a stage-level
        // failure is recorded and the pipeline advances regardless.
        outcome.patch.apply(&mut self.state);
        EngineState::Vision
    }

    async fn on_vision(&mut self) -> EngineState {
        let snapshot = self.state.clone();
        let outcome = self
            .runner
            .run(&self.agents.vision, &snapshot, &self.ctx(), self.budget.remaining_wall_clock())
            .await;

        self.budget
            .record_vlm_credits(outcome.patch.vlm_credits_spent);

        if outcome.failed_with("vlm_credit_exhausted") {
            outcome.patch.apply(&mut self.state);
            self.degrade_vision();
            return EngineState::ForceVerdict;
        }
        if let Some(e) = &outcome.error {
            // vlm_unavailable, vlm_timeout, agent_timeout: continue without
            // vision evidence. The report is degraded; the audit is not.
            tracing::debug!(kind = e.kind(), "vision unavailable, continuing without it");
            outcome.patch.apply(&mut self.state);
            self.degrade_vision();
            return EngineState::Graph;
        }

        outcome.patch.apply(&mut self.state);
        if self.budget.vlm_exhausted() {
            self.push_budget_error("vlm_credits_exhausted");
            return EngineState::ForceVerdict;
        }
        EngineState::Graph
    }

    async fn on_graph(&mut self) -> EngineState {
        let snapshot = self.state.clone();
        let outcome = self
            .runner
            .run(&self.agents.graph, &snapshot, &self.ctx(), self.budget.remaining_wall_clock())
            .await;
        // A graph failure is already recorded in the patch's error log and
        // weighed by verdict synthesis; it does not cap the audit.
        outcome.patch.apply(&mut self.state);
        EngineState::Judge
    }

    async fn on_judge(&mut self) -> EngineState {
        let snapshot = self.state.clone();
        let outcome = self
            .runner
            .run(&self.agents.judge, &snapshot, &self.ctx(), self.budget.remaining_wall_clock())
            .await;

        if outcome.error.is_some() {
            // judge_unavailable or timeout: the engine holds the gavel.
            outcome.patch.apply(&mut self.state);
            return EngineState::ForceVerdict;
        }
        outcome.patch.apply(&mut self.state);

        let Some(decision) = self.state.judge_decision.clone() else {
            return EngineState::ForceVerdict;
        };

        match decision.action {
            JudgeAction::Finalize => {
                self.ensure_verdict();
                self.clamp_degraded();
                self.state.status = AuditStatus::Completed;
                EngineState::Terminal
            }
            JudgeAction::Abort => {
                self.state.status = AuditStatus::Aborted;
                EngineState::Terminal
            }
            JudgeAction::RequestMoreInvestigation => {
                let fresh: Vec<String> = decision
                    .investigate_urls
                    .iter()
                    .filter(|u| !self.state.investigated_urls.contains(*u))
                    .cloned()
                    .collect();

                if fresh.is_empty() {
                    // No progress possible: treated as finalize.
                    self.ensure_verdict();
                    self.clamp_degraded();
                    self.state.status = AuditStatus::Completed;
                    return EngineState::Terminal;
                }
                if self.budget.exhausted().is_some() {
                    if let Some(stop) = self.budget.exhausted() {
                        self.push_budget_error(stop.as_str());
                    }
                    return EngineState::ForceVerdict;
                }

                self.state.pending_urls = fresh;
                self.new_iteration = true;
                EngineState::Scout
            }
        }
    }

    async fn on_force_verdict(&mut self) -> EngineState {
        if !self.scout_completed {
            // Nothing was gathered; there is no evidence to synthesize from.
            self.state.status = AuditStatus::Aborted;
            return EngineState::Terminal;
        }

        let verdict = synthesize_verdict(&self.state, true);
        let _ = self
            .bus
            .publish(EventDraft::log(
                Some(AuditPhase::Judge),
                "warn",
                &format!(
                    "force-verdict: trust {} ({}) from partial evidence",
                    verdict.trust_score,
                    verdict.risk_level.as_str()
                ),
            ))
            .await;
        self.state.degraded = true;
        self.state.judge_decision = Some(JudgeDecision {
            action: JudgeAction::Finalize,
            investigate_urls: Vec::new(),
            verdict: Some(verdict),
        });
        self.state.status = AuditStatus::Completed;
        EngineState::Terminal
    }

    /// A finalize decision without a verdict still produces one.
    fn ensure_verdict(&mut self) {
        let needs_verdict = self
            .state
            .judge_decision
            .as_ref()
            .is_none_or(|d| d.verdict.is_none());
        if needs_verdict {
            let verdict = synthesize_verdict(&self.state, self.state.degraded);
            self.state.judge_decision = Some(JudgeDecision {
                action: JudgeAction::Finalize,
                investigate_urls: Vec::new(),
                verdict: Some(verdict),
            });
        }
    }

    /// Degraded evidence caps the verdict no matter what the judge said.
    fn clamp_degraded(&mut self) {
        if !self.state.degraded {
            return;
        }
        if let Some(decision) = &mut self.state.judge_decision
            && let Some(verdict) = &mut decision.verdict
        {
            verdict.degraded = true;
            verdict.trust_score = verdict
                .trust_score
                .min(crate::state::DEGRADED_SCORE_CAP);
        }
    }

    /// Record a vision degradation if the stage produced no report.
    fn degrade_vision(&mut self) {
        if self.state.vision_result.is_none() {
            self.state.vision_result = Some(crate::state::VisionReport {
                findings: Vec::new(),
                temporal_notes: Vec::new(),
                credits_used: 0,
                degraded: true,
            });
        }
    }

    fn push_budget_error(&mut self, which: &str) {
        self.state.errors.push(ErrorRecord::new(
            "budget_exhausted",
            None,
            format!("hard stop: {which}"),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::Agent;
    use crate::config::BusConfig;
    use crate::errors::{AgentError, TransportError};
    use crate::event::{EventKind, ProgressEvent};
    use crate::ipc::EventTransport;
    use crate::state::{
        GraphReport, ModuleResult, ScoutResult, StatePatch, Tier, VerdictMode, VisionReport,
    };
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct CollectingTransport {
        events: Arc<Mutex<Vec<ProgressEvent>>>,
    }

    #[async_trait]
    impl EventTransport for CollectingTransport {
        async fn send(&mut self, event: &ProgressEvent) -> Result<(), TransportError> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
        async fn shutdown(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    /// Agent with a queue of scripted outcomes; repeats the last one when
    /// the queue runs dry.
    struct ScriptedAgent {
        phase: AuditPhase,
        outcomes: Mutex<Vec<ScriptedOutcome>>,
    }

    #[derive(Clone)]
    enum ScriptedOutcome {
        Patch(Box<StatePatch>),
        Error(AgentError),
    }

    impl ScriptedAgent {
        fn new(phase: AuditPhase, outcomes: Vec<ScriptedOutcome>) -> Arc<Self> {
            Arc::new(Self {
                phase,
                outcomes: Mutex::new(outcomes),
            })
        }
    }

    #[async_trait]
    impl Agent for ScriptedAgent {
        fn phase(&self) -> AuditPhase {
            self.phase
        }

        async fn analyze(
            &self,
            _snapshot: &AuditState,
            _ctx: &AgentContext,
        ) -> Result<StatePatch, AgentError> {
            let mut outcomes = self.outcomes.lock().unwrap();
            let outcome = if outcomes.len() > 1 {
                outcomes.remove(0)
            } else {
                outcomes
                    .first()
                    .cloned()
                    .unwrap_or(ScriptedOutcome::Patch(Box::default()))
            };
            match outcome {
                ScriptedOutcome::Patch(p) => Ok(*p),
                ScriptedOutcome::Error(e) => Err(e),
            }
        }
    }

    fn scout_success(url: &str, links: Vec<String>) -> ScriptedOutcome {
        ScriptedOutcome::Patch(Box::new(StatePatch {
            scout_result: Some(ScoutResult {
                url: url.to_string(),
                final_url: url.to_string(),
                status_code: 200,
                title: Some("Page".to_string()),
                dom_text: "plenty of visible content".to_string(),
                links: links.clone(),
                screenshots: vec![],
                fetched_at: Utc::now(),
            }),
            investigated_url: Some(url.to_string()),
            discovered_urls: links,
            ..StatePatch::default()
        }))
    }

    fn security_success(score: f64) -> ScriptedOutcome {
        let mut results = BTreeMap::new();
        results.insert(
            "tls".to_string(),
            ModuleResult {
                module: "tls".to_string(),
                score,
                findings: vec![],
                errors: vec![],
                duration_ms: 3,
            },
        );
        ScriptedOutcome::Patch(Box::new(StatePatch {
            security_results: results,
            ..StatePatch::default()
        }))
    }

    fn vision_success(credits: u32) -> ScriptedOutcome {
        ScriptedOutcome::Patch(Box::new(StatePatch {
            vision_result: Some(VisionReport {
                findings: vec![],
                temporal_notes: vec![],
                credits_used: credits,
                degraded: false,
            }),
            vlm_credits_spent: credits,
            ..StatePatch::default()
        }))
    }

    fn graph_success() -> ScriptedOutcome {
        ScriptedOutcome::Patch(Box::new(StatePatch {
            graph_result: Some(GraphReport {
                verified_entities: vec!["domain:example.com".to_string()],
                contradicted_entities: vec![],
                sources: vec![],
                degraded: false,
            }),
            ..StatePatch::default()
        }))
    }

    fn judge_finalize(trust: u8) -> ScriptedOutcome {
        ScriptedOutcome::Patch(Box::new(StatePatch {
            judge_decision: Some(JudgeDecision {
                action: JudgeAction::Finalize,
                investigate_urls: vec![],
                verdict: Some(crate::state::Verdict {
                    trust_score: trust,
                    risk_level: crate::state::RiskLevel::from_trust_score(trust),
                    summary: "scripted".to_string(),
                    expert_notes: None,
                    site_type: None,
                    degraded: false,
                }),
            }),
            ..StatePatch::default()
        }))
    }

    fn judge_request(urls: Vec<String>) -> ScriptedOutcome {
        ScriptedOutcome::Patch(Box::new(StatePatch {
            judge_decision: Some(JudgeDecision {
                action: JudgeAction::RequestMoreInvestigation,
                investigate_urls: urls,
                verdict: None,
            }),
            ..StatePatch::default()
        }))
    }

    struct Harness {
        orchestrator: Orchestrator,
        events: Arc<Mutex<Vec<ProgressEvent>>>,
        bus: EventBus,
    }

    fn harness(
        tier: Tier,
        scout: Vec<ScriptedOutcome>,
        security: Vec<ScriptedOutcome>,
        vision: Vec<ScriptedOutcome>,
        graph: Vec<ScriptedOutcome>,
        judge: Vec<ScriptedOutcome>,
    ) -> Harness {
        let transport = CollectingTransport::default();
        let events = transport.events.clone();
        let config = EngineConfig::default();
        let (bus, _handle) =
            EventBus::start("audit-t", &BusConfig::default(), Box::new(transport));

        let agents = AgentSet {
            scout: ScriptedAgent::new(AuditPhase::Scout, scout),
            security: ScriptedAgent::new(AuditPhase::Security, security),
            vision: ScriptedAgent::new(AuditPhase::Vision, vision),
            graph: ScriptedAgent::new(AuditPhase::Graph, graph),
            judge: ScriptedAgent::new(AuditPhase::Judge, judge),
        };

        let state = AuditState::new(
            "audit-t",
            "https://example.com",
            tier,
            VerdictMode::Simple,
        )
        .unwrap();
        let orchestrator =
            Orchestrator::new(state, agents, &config, bus.clone(), CancellationToken::new());
        Harness {
            orchestrator,
            events,
            bus,
        }
    }

    async fn drain(bus: EventBus, events: &Arc<Mutex<Vec<ProgressEvent>>>) -> Vec<ProgressEvent> {
        bus.close().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        events.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn quick_scan_happy_path_completes_in_one_iteration() {
        let h = harness(
            Tier::QuickScan,
            vec![scout_success("https://example.com", vec![])],
            vec![security_success(0.97)],
            vec![vision_success(1)],
            vec![graph_success()],
            vec![judge_finalize(85)],
        );
        let state = h.orchestrator.run().await;

        assert_eq!(state.status, AuditStatus::Completed);
        assert_eq!(state.iteration, 1);
        assert!(state.nim_calls_used <= 3);
        assert_eq!(state.scout_results.len(), 1);
        assert!(!state.degraded);
        let verdict = state.verdict().unwrap();
        assert!(verdict.trust_score >= 70);

        let events = drain(h.bus, &h.events).await;
        let starts = events
            .iter()
            .filter(|e| e.kind == EventKind::PhaseStart)
            .count();
        assert_eq!(starts, 5, "one phase_start per stage");
    }

    #[tokio::test(start_paused = true)]
    async fn bot_blocked_twice_then_recovers() {
        let h = harness(
            Tier::StandardAudit,
            vec![
                ScriptedOutcome::Error(AgentError::BotBlocked),
                ScriptedOutcome::Error(AgentError::BotBlocked),
                scout_success("https://example.com", vec![]),
            ],
            vec![security_success(0.9)],
            vec![vision_success(1)],
            vec![graph_success()],
            vec![judge_finalize(80)],
        );
        let state = h.orchestrator.run().await;

        assert_eq!(state.status, AuditStatus::Completed);
        assert_eq!(state.scout_failures, 2);
        assert_eq!(state.iteration, 1, "block retries stay in the same iteration");

        let events = drain(h.bus, &h.events).await;
        let scout_starts = events
            .iter()
            .filter(|e| e.kind == EventKind::PhaseStart && e.phase == Some(AuditPhase::Scout))
            .count();
        assert_eq!(scout_starts, 3, "three scout entries");
        let security_starts = events
            .iter()
            .filter(|e| e.kind == EventKind::PhaseStart && e.phase == Some(AuditPhase::Security))
            .count();
        assert_eq!(security_starts, 1, "a single downstream pass");
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_blocks_hit_cap_and_force_verdict() {
        let h = harness(
            Tier::StandardAudit,
            vec![ScriptedOutcome::Error(AgentError::BotBlocked)],
            vec![security_success(0.9)],
            vec![vision_success(1)],
            vec![graph_success()],
            vec![judge_finalize(80)],
        );
        let state = h.orchestrator.run().await;

        // Scout never landed a page, so there is no evidence at all.
        assert_eq!(state.status, AuditStatus::Aborted);
        assert_eq!(state.scout_failures, SCOUT_FAILURE_CAP);
    }

    #[tokio::test]
    async fn judge_loop_exhausts_iterations_into_degraded_verdict() {
        let h = harness(
            Tier::StandardAudit, // max_iterations = 3
            vec![
                scout_success("https://example.com", vec![]),
                scout_success("https://example.com/a", vec![]),
                scout_success("https://example.com/b", vec![]),
            ],
            vec![security_success(0.6)],
            vec![vision_success(1)],
            vec![graph_success()],
            vec![
                judge_request(vec![
                    "https://example.com/a".to_string(),
                    "https://example.com/b".to_string(),
                ]),
                judge_request(vec!["https://example.com/c".to_string()]),
                judge_request(vec!["https://example.com/d".to_string()]),
            ],
        );
        let state = h.orchestrator.run().await;

        assert_eq!(state.status, AuditStatus::Completed);
        assert_eq!(state.iteration, 3);
        let verdict = state.verdict().unwrap();
        assert!(verdict.degraded, "budget exhaustion degrades the verdict");
        assert!(
            state
                .errors
                .iter()
                .any(|e| e.kind == "budget_exhausted"),
            "budget stop recorded"
        );
    }

    #[tokio::test]
    async fn judge_requesting_only_seen_urls_finalizes() {
        let h = harness(
            Tier::StandardAudit,
            vec![scout_success("https://example.com", vec![])],
            vec![security_success(0.6)],
            vec![vision_success(1)],
            vec![graph_success()],
            // Requests exactly the URL that was just investigated.
            vec![judge_request(vec!["https://example.com".to_string()])],
        );
        let state = h.orchestrator.run().await;

        assert_eq!(state.status, AuditStatus::Completed);
        assert_eq!(state.iteration, 1);
        assert!(state.verdict().is_some(), "treated as finalize");
    }

    #[tokio::test]
    async fn vlm_credit_exhaustion_forces_degraded_verdict() {
        let h = harness(
            Tier::QuickScan,
            vec![scout_success("https://example.com", vec![])],
            vec![security_success(0.9)],
            vec![ScriptedOutcome::Error(AgentError::VlmCreditExhausted)],
            vec![graph_success()],
            vec![judge_finalize(90)],
        );
        let state = h.orchestrator.run().await;

        assert_eq!(state.status, AuditStatus::Completed);
        let vision = state.vision_result.as_ref().unwrap();
        assert!(vision.degraded);
        let verdict = state.verdict().unwrap();
        assert!(verdict.degraded);
        assert!(verdict.trust_score <= crate::state::DEGRADED_SCORE_CAP);

        let events = drain(h.bus, &h.events).await;
        let graph_started = events
            .iter()
            .any(|e| e.kind == EventKind::PhaseStart && e.phase == Some(AuditPhase::Graph));
        assert!(!graph_started, "graph is skipped on the credit-exhausted edge");
    }

    #[tokio::test]
    async fn vlm_unavailable_continues_to_graph() {
        let h = harness(
            Tier::QuickScan,
            vec![scout_success("https://example.com", vec![])],
            vec![security_success(0.9)],
            vec![ScriptedOutcome::Error(AgentError::VlmUnavailable)],
            vec![graph_success()],
            vec![judge_finalize(80)],
        );
        let state = h.orchestrator.run().await;

        assert_eq!(state.status, AuditStatus::Completed);
        assert!(state.vision_result.as_ref().unwrap().degraded);
        assert!(state.graph_result.is_some(), "graph still ran");
        // Missing vision evidence alone does not cap the verdict.
        assert!(!state.degraded);
        assert_eq!(state.verdict().unwrap().trust_score, 80);
    }

    #[tokio::test]
    async fn unusable_scout_page_degrades_and_caps_score() {
        let empty_page = ScriptedOutcome::Patch(Box::new(StatePatch {
            scout_result: Some(ScoutResult {
                url: "https://example.com".to_string(),
                final_url: "https://example.com".to_string(),
                status_code: 200,
                title: None,
                dom_text: "  ".to_string(),
                links: vec![],
                screenshots: vec![],
                fetched_at: Utc::now(),
            }),
            investigated_url: Some("https://example.com".to_string()),
            ..StatePatch::default()
        }));
        let h = harness(
            Tier::QuickScan,
            vec![empty_page],
            vec![security_success(1.0)],
            vec![vision_success(0)],
            vec![graph_success()],
            vec![judge_finalize(95)],
        );
        let state = h.orchestrator.run().await;

        assert_eq!(state.status, AuditStatus::Completed);
        assert!(state.degraded);
        // Scripted judge said 95; the degraded cap binds anyway.
        let verdict = state.verdict().unwrap();
        assert!(verdict.degraded);
        assert!(verdict.trust_score <= crate::state::DEGRADED_SCORE_CAP);
        assert!(state.result_summary()["degraded"].as_bool().unwrap());
    }

    #[tokio::test]
    async fn cancellation_before_scout_aborts() {
        let h = harness(
            Tier::QuickScan,
            vec![scout_success("https://example.com", vec![])],
            vec![security_success(0.9)],
            vec![vision_success(1)],
            vec![graph_success()],
            vec![judge_finalize(80)],
        );
        h.orchestrator.cancel.cancel();
        let state = h.orchestrator.run().await;
        assert_eq!(state.status, AuditStatus::Aborted);
        assert!(state.verdict().is_none());
    }

    #[tokio::test]
    async fn judge_error_forces_verdict_from_evidence() {
        let h = harness(
            Tier::QuickScan,
            vec![scout_success("https://example.com", vec![])],
            vec![security_success(0.9)],
            vec![vision_success(1)],
            vec![graph_success()],
            vec![ScriptedOutcome::Error(AgentError::JudgeUnavailable(
                "llm backend down".to_string(),
            ))],
        );
        let state = h.orchestrator.run().await;

        assert_eq!(state.status, AuditStatus::Completed);
        let verdict = state.verdict().unwrap();
        assert!(verdict.degraded);
        assert!(state.errors.iter().any(|e| e.kind == "judge_unavailable"));
    }

    #[tokio::test]
    async fn bounded_transitions_for_randomized_outcomes() {
        // For outcomes drawn from {success, timeout, transient error}, the
        // machine terminates within max_iterations * 5 + 1 stage
        // transitions. Scripted roughly: every stage errs with a timeout.
        let timeout_all = vec![ScriptedOutcome::Error(AgentError::Timeout)];
        let h = harness(
            Tier::StandardAudit,
            vec![
                scout_success("https://example.com", vec![]),
            ],
            timeout_all.clone(),
            timeout_all.clone(),
            timeout_all.clone(),
            timeout_all,
        );
        let state = h.orchestrator.run().await;
        // Judge timing out lands in force_verdict with a verdict.
        assert_eq!(state.status, AuditStatus::Completed);
        assert!(state.verdict().is_some());

        let events = drain(h.bus, &h.events).await;
        let transitions = events
            .iter()
            .filter(|e| e.kind == EventKind::PhaseStart)
            .count();
        assert!(transitions <= 3 * 5 + 1);
    }
}
