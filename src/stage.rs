//! Stage runner: wraps one agent invocation with events, deadline,
//! cancellation, and (for the scout) retry.
//!
//! Errors never propagate out of a stage; they come back inside the
//! [`StageOutcome`] so the orchestrator can route on the error kind while
//! the audit keeps its "show must go on" guarantee.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::agents::{Agent, AgentContext};
use crate::config::{ScoutRetryConfig, StageConfig};
use crate::errors::AgentError;
use crate::event::{AuditPhase, EventDraft};
use crate::state::{AuditState, StatePatch};

/// What one stage produced: a patch (always applicable) and the error that
/// shaped it, if any.
#[derive(Debug)]
pub struct StageOutcome {
    pub patch: StatePatch,
    pub error: Option<AgentError>,
    pub duration: Duration,
}

impl StageOutcome {
    pub fn failed_with(&self, kind: &str) -> bool {
        self.error.as_ref().is_some_and(|e| e.kind() == kind)
    }
}

/// Executes stages for one audit.
pub struct StageRunner {
    stages: StageConfig,
    retry: ScoutRetryConfig,
}

impl StageRunner {
    pub fn new(stages: StageConfig, retry: ScoutRetryConfig) -> Self {
        Self { stages, retry }
    }

    /// Run one stage to completion or failure, emitting `phase_start` and
    /// `phase_complete` around it. The effective deadline is the smaller of
    /// the per-phase cap and the remaining wall-clock budget.
    pub async fn run(
        &self,
        agent: &Arc<dyn Agent>,
        snapshot: &AuditState,
        ctx: &AgentContext,
        remaining_wall_clock: Duration,
    ) -> StageOutcome {
        let phase = agent.phase();
        let deadline = self.stages.cap_for(phase).min(remaining_wall_clock);
        let started = Instant::now();

        let _ = ctx.bus.publish(EventDraft::phase_start(phase)).await;

        let retries = if phase == AuditPhase::Scout {
            self.retry.max_attempts
        } else {
            1
        };

        let mut result = Err(AgentError::Timeout);
        for attempt in 0..retries.max(1) {
            if attempt > 0 {
                let backoff = self.retry.backoff_for(attempt - 1);
                let _ = ctx
                    .bus
                    .publish(EventDraft::phase_progress(
                        phase,
                        &format!("transient error, retry {attempt} in {}s", backoff.as_secs()),
                    ))
                    .await;
                tokio::time::sleep(backoff).await;
            }

            let ctx = AgentContext {
                deadline: deadline.saturating_sub(started.elapsed()),
                ..ctx.clone()
            };
            result = self
                .invoke_once(agent, snapshot, &ctx, deadline.saturating_sub(started.elapsed()))
                .await;

            match &result {
                Ok(_) => break,
                Err(e) if e.is_transient() && attempt + 1 < retries => continue,
                Err(_) => break,
            }
        }

        let duration = started.elapsed();
        match result {
            Ok(patch) => {
                let _ = ctx
                    .bus
                    .publish(EventDraft::phase_complete(
                        phase,
                        duration.as_millis() as u64,
                        patch_finding_count(&patch),
                    ))
                    .await;
                StageOutcome {
                    patch,
                    error: None,
                    duration,
                }
            }
            Err(error) => {
                let _ = ctx
                    .bus
                    .publish(EventDraft::phase_failed(
                        phase,
                        duration.as_millis() as u64,
                        error.kind(),
                        &error.to_string(),
                    ))
                    .await;
                StageOutcome {
                    patch: StatePatch::error(error.clone().into_record(phase)),
                    error: Some(error),
                    duration,
                }
            }
        }
    }

    /// One agent invocation under the deadline and the cancellation
    /// contract: after the cancel signal fires, the agent gets the graceful
    /// window to quiesce before the runner abandons it.
    async fn invoke_once(
        &self,
        agent: &Arc<dyn Agent>,
        snapshot: &AuditState,
        ctx: &AgentContext,
        deadline: Duration,
    ) -> Result<StatePatch, AgentError> {
        if deadline.is_zero() {
            return Err(AgentError::Timeout);
        }

        let analyze = agent.analyze(snapshot, ctx);
        tokio::pin!(analyze);

        tokio::select! {
            result = &mut analyze => result,
            () = tokio::time::sleep(deadline) => Err(AgentError::Timeout),
            () = ctx.cancel.cancelled() => {
                // Agents must reach quiescence within the graceful window;
                // past it, the future is dropped (forced termination).
                match tokio::time::timeout(
                    self.stages.graceful_cancel_timeout,
                    &mut analyze,
                )
                .await
                {
                    Ok(Ok(_)) | Ok(Err(_)) => Err(AgentError::Cancelled),
                    Err(_) => Err(AgentError::CancelEscalated),
                }
            }
        }
    }
}

/// Findings carried by a patch, for `phase_complete` payloads.
fn patch_finding_count(patch: &StatePatch) -> usize {
    let security: usize = patch
        .security_results
        .values()
        .map(|r| r.findings.len())
        .sum();
    let vision = patch
        .vision_result
        .as_ref()
        .map(|v| v.findings.len())
        .unwrap_or(0);
    let graph = patch
        .graph_result
        .as_ref()
        .map(|g| g.contradicted_entities.len())
        .unwrap_or(0);
    security + vision + graph
}
