//! Graph agent: OSINT corroboration of entities scraped by the scout.
//!
//! Sources are registered by string id with a latency tier and dispatched
//! in the same three-tier pattern as security modules. A source timing out
//! contributes a `source_unavailable` subreport but never fails the stage;
//! the stage-level deadline (enforced by the stage runner) is the only
//! fatal timeout here.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::time::timeout;
use url::Url;

use super::{Agent, AgentContext, DispatchTier};
use crate::errors::AgentError;
use crate::event::{AuditPhase, EventDraft};
use crate::state::{AuditState, GraphReport, SourceReport, StatePatch};

/// Entities the graph stage tries to corroborate, scoped from scout output.
#[derive(Debug, Clone)]
pub struct EntityScope {
    pub domain: String,
    pub title: Option<String>,
    pub url: String,
}

impl EntityScope {
    fn from_state(state: &AuditState) -> Self {
        let scout = state.latest_scout();
        let url = scout
            .map(|s| s.final_url.clone())
            .unwrap_or_else(|| state.url.clone());
        let domain = Url::parse(&url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();
        Self {
            domain,
            title: scout.and_then(|s| s.title.clone()),
            url,
        }
    }
}

/// One OSINT source.
#[async_trait]
pub trait OsintSource: Send + Sync {
    fn name(&self) -> &'static str;
    fn tier(&self) -> DispatchTier;
    async fn investigate(&self, scope: &EntityScope) -> Result<SourceReport, AgentError>;
}

/// Graph agent over a source registry.
pub struct GraphAgent {
    sources: Vec<Arc<dyn OsintSource>>,
}

impl GraphAgent {
    pub fn new(sources: Vec<Arc<dyn OsintSource>>) -> Self {
        Self { sources }
    }

    /// The built-in source set. Heavier clients (whois, archives, corporate
    /// registries) register here at process start.
    pub fn builtin() -> Self {
        Self::new(vec![Arc::new(DnsResolutionSource)])
    }
}

#[async_trait]
impl Agent for GraphAgent {
    fn phase(&self) -> AuditPhase {
        AuditPhase::Graph
    }

    async fn analyze(
        &self,
        snapshot: &AuditState,
        ctx: &AgentContext,
    ) -> Result<StatePatch, AgentError> {
        let scope = EntityScope::from_state(snapshot);
        let mut reports: Vec<SourceReport> = Vec::new();

        for tier in DispatchTier::ALL {
            let in_tier: Vec<Arc<dyn OsintSource>> = self
                .sources
                .iter()
                .filter(|s| s.tier() == tier)
                .cloned()
                .collect();
            if in_tier.is_empty() {
                continue;
            }
            if ctx.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            let jobs = in_tier.into_iter().map(|source| {
                let scope = scope.clone();
                async move {
                    let outcome = timeout(tier.deadline(), source.investigate(&scope)).await;
                    (source.name(), outcome)
                }
            });

            for (name, outcome) in join_all(jobs).await {
                let report = match outcome {
                    Ok(Ok(report)) => report,
                    Ok(Err(e)) => unavailable_report(name, e.to_string()),
                    Err(_) => unavailable_report(
                        name,
                        AgentError::SourceTimeout { source_name: name.to_string() }.to_string(),
                    ),
                };
                let _ = ctx
                    .bus
                    .publish(EventDraft::phase_progress(
                        AuditPhase::Graph,
                        &format!(
                            "source {name}: {}",
                            if report.available { "done" } else { "unavailable" }
                        ),
                    ))
                    .await;
                reports.push(report);
            }
        }

        let verified: Vec<String> = reports.iter().flat_map(|r| r.verified.clone()).collect();
        let contradicted: Vec<String> =
            reports.iter().flat_map(|r| r.contradicted.clone()).collect();
        let degraded = !reports.is_empty() && reports.iter().all(|r| !r.available);

        Ok(StatePatch {
            graph_result: Some(GraphReport {
                verified_entities: verified,
                contradicted_entities: contradicted,
                sources: reports,
                degraded,
            }),
            ..StatePatch::default()
        })
    }
}

/// A source that produced nothing still appears in the report, marked
/// unavailable, so the judge can discount the graph evidence.
fn unavailable_report(name: &str, note: String) -> SourceReport {
    SourceReport {
        source: name.to_string(),
        available: false,
        verified: Vec::new(),
        contradicted: Vec::new(),
        notes: vec![format!("source_unavailable: {note}")],
    }
}

// ── Built-in sources ─────────────────────────────────────────────────

/// Checks that the audited domain actually resolves.
pub struct DnsResolutionSource;

#[async_trait]
impl OsintSource for DnsResolutionSource {
    fn name(&self) -> &'static str {
        "dns_resolution"
    }

    fn tier(&self) -> DispatchTier {
        DispatchTier::Fast
    }

    async fn investigate(&self, scope: &EntityScope) -> Result<SourceReport, AgentError> {
        if scope.domain.is_empty() {
            return Err(AgentError::Failed("no domain in scope".to_string()));
        }
        let lookup = tokio::net::lookup_host((scope.domain.as_str(), 443)).await;
        let report = match lookup {
            Ok(addrs) => {
                let count = addrs.count();
                SourceReport {
                    source: self.name().to_string(),
                    available: true,
                    verified: vec![format!("domain:{}", scope.domain)],
                    contradicted: Vec::new(),
                    notes: vec![format!("{count} address(es) resolved")],
                }
            }
            Err(e) => SourceReport {
                source: self.name().to_string(),
                available: true,
                verified: Vec::new(),
                contradicted: vec![format!("domain:{}", scope.domain)],
                notes: vec![format!("resolution failed: {e}")],
            },
        };
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::config::BusConfig;
    use crate::errors::TransportError;
    use crate::event::ProgressEvent;
    use crate::ipc::EventTransport;
    use crate::state::{Tier, VerdictMode};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct NullTransport;

    #[async_trait]
    impl EventTransport for NullTransport {
        async fn send(&mut self, _event: &ProgressEvent) -> Result<(), TransportError> {
            Ok(())
        }
        async fn shutdown(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn ctx() -> AgentContext {
        let (bus, _handle) = EventBus::start("a", &BusConfig::default(), Box::new(NullTransport));
        AgentContext {
            audit_id: "a".to_string(),
            bus,
            cancel: CancellationToken::new(),
            deadline: Duration::from_secs(30),
        }
    }

    fn state() -> AuditState {
        AuditState::new(
            "a",
            "https://example.com",
            Tier::StandardAudit,
            VerdictMode::Simple,
        )
        .unwrap()
    }

    struct ScriptedSource {
        name: &'static str,
        tier: DispatchTier,
        verified: Vec<String>,
        contradicted: Vec<String>,
        fail: bool,
        delay: Duration,
    }

    #[async_trait]
    impl OsintSource for ScriptedSource {
        fn name(&self) -> &'static str {
            self.name
        }
        fn tier(&self) -> DispatchTier {
            self.tier
        }
        async fn investigate(&self, _scope: &EntityScope) -> Result<SourceReport, AgentError> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(AgentError::Failed("backend 500".to_string()));
            }
            Ok(SourceReport {
                source: self.name.to_string(),
                available: true,
                verified: self.verified.clone(),
                contradicted: self.contradicted.clone(),
                notes: vec![],
            })
        }
    }

    #[tokio::test]
    async fn reports_merge_across_tiers() {
        let agent = GraphAgent::new(vec![
            Arc::new(ScriptedSource {
                name: "registry",
                tier: DispatchTier::Fast,
                verified: vec!["company:Example Ltd".to_string()],
                contradicted: vec![],
                fail: false,
                delay: Duration::ZERO,
            }),
            Arc::new(ScriptedSource {
                name: "archive",
                tier: DispatchTier::Medium,
                verified: vec![],
                contradicted: vec!["claim:founded 1990".to_string()],
                fail: false,
                delay: Duration::ZERO,
            }),
        ]);

        let patch = agent.analyze(&state(), &ctx()).await.unwrap();
        let report = patch.graph_result.unwrap();
        assert_eq!(report.sources.len(), 2);
        assert_eq!(report.verified_entities, vec!["company:Example Ltd"]);
        assert_eq!(report.contradicted_entities, vec!["claim:founded 1990"]);
        assert!(!report.degraded);
    }

    #[tokio::test]
    async fn failing_source_is_absorbed_as_unavailable() {
        let agent = GraphAgent::new(vec![
            Arc::new(ScriptedSource {
                name: "flaky",
                tier: DispatchTier::Fast,
                verified: vec![],
                contradicted: vec![],
                fail: true,
                delay: Duration::ZERO,
            }),
            Arc::new(ScriptedSource {
                name: "solid",
                tier: DispatchTier::Fast,
                verified: vec!["domain:example.com".to_string()],
                contradicted: vec![],
                fail: false,
                delay: Duration::ZERO,
            }),
        ]);

        let patch = agent.analyze(&state(), &ctx()).await.unwrap();
        let report = patch.graph_result.unwrap();
        assert_eq!(report.sources.len(), 2);
        let flaky = report.sources.iter().find(|s| s.source == "flaky").unwrap();
        assert!(!flaky.available);
        assert!(flaky.notes[0].contains("source_unavailable"));
        assert!(!report.degraded, "one live source keeps the stage healthy");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_source_times_out_without_failing_stage() {
        let agent = GraphAgent::new(vec![Arc::new(ScriptedSource {
            name: "glacial",
            tier: DispatchTier::Fast,
            verified: vec!["x".to_string()],
            contradicted: vec![],
            fail: false,
            delay: Duration::from_secs(60), // far past the 5 s fast tier
        })]);

        let patch = agent.analyze(&state(), &ctx()).await.unwrap();
        let report = patch.graph_result.unwrap();
        assert_eq!(report.sources.len(), 1);
        assert!(!report.sources[0].available);
        assert!(report.degraded, "all sources down degrades the graph");
        assert!(!patch.degraded, "graph degradation does not cap the audit");
    }

    #[tokio::test]
    async fn entity_scope_prefers_scout_final_url() {
        let mut s = state();
        s.scout_results.push(crate::state::ScoutResult {
            url: "https://example.com".to_string(),
            final_url: "https://www.example.com/home".to_string(),
            status_code: 200,
            title: Some("Example".to_string()),
            dom_text: "text".to_string(),
            links: vec![],
            screenshots: vec![],
            fetched_at: chrono::Utc::now(),
        });
        let scope = EntityScope::from_state(&s);
        assert_eq!(scope.domain, "www.example.com");
        assert_eq!(scope.title.as_deref(), Some("Example"));
    }
}
