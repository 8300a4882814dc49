//! Security agent: tiered fan-out over registered scan modules.
//!
//! Modules are dispatched in three tiers (fast ≤ 5 s, medium ≤ 10 s,
//! deep ≤ 30 s); within a tier they run in parallel and the tier waits for
//! all of them or their deadlines, whichever comes first. A module timing
//! out or failing never fails the stage; it becomes an errored
//! [`ModuleResult`] and the pipeline moves on.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::time::{Instant, timeout};
use url::Url;

use super::{Agent, AgentContext, DispatchTier};
use crate::errors::AgentError;
use crate::event::{AuditPhase, EventDraft};
use crate::state::{AuditState, Finding, ModuleResult, Severity, StatePatch};

/// What a module gets to look at: the audit target plus the latest page.
#[derive(Debug, Clone)]
pub struct ModuleTarget {
    pub url: String,
    pub final_url: String,
    pub status_code: u16,
    pub dom_text: String,
}

impl ModuleTarget {
    fn from_state(state: &AuditState) -> Self {
        match state.latest_scout() {
            Some(scout) => Self {
                url: state.url.clone(),
                final_url: scout.final_url.clone(),
                status_code: scout.status_code,
                dom_text: scout.dom_text.clone(),
            },
            None => Self {
                url: state.url.clone(),
                final_url: state.url.clone(),
                status_code: 0,
                dom_text: String::new(),
            },
        }
    }
}

/// One scan module. Implementations must be self-contained: anything they
/// probe beyond the [`ModuleTarget`] they fetch themselves.
#[async_trait]
pub trait SecurityModule: Send + Sync {
    fn name(&self) -> &'static str;
    fn tier(&self) -> DispatchTier;
    async fn scan(&self, target: &ModuleTarget) -> Result<ModuleResult, AgentError>;
}

/// Security agent over a module registry.
pub struct SecurityAgent {
    modules: Vec<Arc<dyn SecurityModule>>,
}

impl SecurityAgent {
    pub fn new(modules: Vec<Arc<dyn SecurityModule>>) -> Self {
        Self { modules }
    }

    /// The built-in module set.
    pub fn builtin() -> Self {
        let client = shared_client();
        // The redirect probe must see 3xx answers itself.
        let no_redirect = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("veritas-security/0.1")
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default();
        Self::new(vec![
            Arc::new(UrlHeuristicsModule),
            Arc::new(HeadersModule { client: client.clone() }),
            Arc::new(TlsModule { client }),
            Arc::new(RedirectChainModule { client: no_redirect }),
        ])
    }

    /// Modules selected by the audit's `enabled_modules` list (empty list
    /// selects everything).
    fn enabled(&self, state: &AuditState) -> Vec<Arc<dyn SecurityModule>> {
        self.modules
            .iter()
            .filter(|m| {
                state.enabled_modules.is_empty()
                    || state.enabled_modules.iter().any(|e| e == m.name())
            })
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Agent for SecurityAgent {
    fn phase(&self) -> AuditPhase {
        AuditPhase::Security
    }

    async fn analyze(
        &self,
        snapshot: &AuditState,
        ctx: &AgentContext,
    ) -> Result<StatePatch, AgentError> {
        let target = ModuleTarget::from_state(snapshot);
        let enabled = self.enabled(snapshot);

        let mut results: BTreeMap<String, ModuleResult> = BTreeMap::new();
        for tier in DispatchTier::ALL {
            let in_tier: Vec<Arc<dyn SecurityModule>> = enabled
                .iter()
                .filter(|m| m.tier() == tier)
                .cloned()
                .collect();
            if in_tier.is_empty() {
                continue;
            }
            if ctx.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            let jobs = in_tier.into_iter().map(|module| {
                let target = target.clone();
                async move {
                    let started = Instant::now();
                    let outcome = timeout(tier.deadline(), module.scan(&target)).await;
                    (module.name(), started.elapsed(), outcome)
                }
            });

            for (name, elapsed, outcome) in join_all(jobs).await {
                let result = match outcome {
                    Ok(Ok(result)) => result,
                    Ok(Err(e)) => errored_result(name, elapsed, e.to_string()),
                    Err(_) => errored_result(
                        name,
                        elapsed,
                        AgentError::ModuleTimeout { module: name.to_string() }.to_string(),
                    ),
                };
                for finding in &result.findings {
                    let _ = ctx
                        .bus
                        .publish(EventDraft::finding(AuditPhase::Security, finding))
                        .await;
                }
                results.insert(name.to_string(), result);
            }
        }

        Ok(StatePatch {
            security_results: results,
            ..StatePatch::default()
        })
    }
}

/// A module that could not produce a verdict scores neutral with its error
/// attached, so downstream weighing can discount it.
fn errored_result(name: &str, elapsed: Duration, error: String) -> ModuleResult {
    ModuleResult {
        module: name.to_string(),
        score: 0.5,
        findings: Vec::new(),
        errors: vec![error],
        duration_ms: elapsed.as_millis() as u64,
    }
}

fn shared_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .user_agent("veritas-security/0.1")
        .build()
        .unwrap_or_default()
}

// ── Built-in modules ─────────────────────────────────────────────────

/// Pure-lexical URL checks: no network, always fast.
pub struct UrlHeuristicsModule;

/// Suspicious top-level domains frequently seen in throwaway scam hosting.
const SUSPICIOUS_TLDS: [&str; 8] = ["tk", "ml", "ga", "cf", "gq", "top", "click", "loan"];

#[async_trait]
impl SecurityModule for UrlHeuristicsModule {
    fn name(&self) -> &'static str {
        "url_heuristics"
    }

    fn tier(&self) -> DispatchTier {
        DispatchTier::Fast
    }

    async fn scan(&self, target: &ModuleTarget) -> Result<ModuleResult, AgentError> {
        let started = Instant::now();
        let url = Url::parse(&target.url).map_err(|e| AgentError::ModuleError {
            module: self.name().to_string(),
            message: e.to_string(),
        })?;

        let mut findings = Vec::new();
        let host = url.host_str().unwrap_or_default().to_string();

        if host.starts_with("xn--") || host.contains(".xn--") {
            findings.push(Finding::new(
                "punycode_host",
                "url",
                Severity::High,
                0.9,
                format!("Host '{host}' uses punycode, a common homograph-attack vector"),
            ));
        }
        if let Some(tld) = host.rsplit('.').next()
            && SUSPICIOUS_TLDS.contains(&tld)
        {
            findings.push(Finding::new(
                "suspicious_tld",
                "url",
                Severity::Medium,
                0.6,
                format!("Top-level domain '.{tld}' is heavily used by disposable sites"),
            ));
        }
        let digit_ratio = if host.is_empty() {
            0.0
        } else {
            host.chars().filter(char::is_ascii_digit).count() as f64 / host.len() as f64
        };
        if digit_ratio > 0.3 {
            findings.push(Finding::new(
                "digit_heavy_host",
                "url",
                Severity::Low,
                0.5,
                format!("Host '{host}' is unusually digit-heavy"),
            ));
        }
        if host.matches('.').count() >= 4 {
            findings.push(Finding::new(
                "deep_subdomain",
                "url",
                Severity::Low,
                0.5,
                format!("Host '{host}' nests {} subdomain levels", host.matches('.').count()),
            ));
        }

        Ok(ModuleResult {
            module: self.name().to_string(),
            score: score_from_findings(&findings),
            findings,
            errors: Vec::new(),
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

/// Security response headers: HSTS, CSP, frame options.
pub struct HeadersModule {
    client: reqwest::Client,
}

#[async_trait]
impl SecurityModule for HeadersModule {
    fn name(&self) -> &'static str {
        "headers"
    }

    fn tier(&self) -> DispatchTier {
        DispatchTier::Fast
    }

    async fn scan(&self, target: &ModuleTarget) -> Result<ModuleResult, AgentError> {
        let started = Instant::now();
        let response = self
            .client
            .get(&target.final_url)
            .send()
            .await
            .map_err(|e| AgentError::ModuleError {
                module: self.name().to_string(),
                message: e.to_string(),
            })?;

        let headers = response.headers();
        let mut findings = Vec::new();
        let expectations = [
            ("strict-transport-security", "missing_hsts", "HSTS header absent"),
            ("content-security-policy", "missing_csp", "Content-Security-Policy absent"),
            ("x-frame-options", "missing_frame_options", "X-Frame-Options absent"),
        ];
        for (header, pattern, description) in expectations {
            if !headers.contains_key(header) {
                findings.push(Finding::new(
                    pattern,
                    "headers",
                    Severity::Low,
                    0.8,
                    description,
                ));
            }
        }

        Ok(ModuleResult {
            module: self.name().to_string(),
            score: score_from_findings(&findings),
            findings,
            errors: Vec::new(),
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

/// Transport security: scheme and certificate acceptance.
pub struct TlsModule {
    client: reqwest::Client,
}

#[async_trait]
impl SecurityModule for TlsModule {
    fn name(&self) -> &'static str {
        "tls"
    }

    fn tier(&self) -> DispatchTier {
        DispatchTier::Medium
    }

    async fn scan(&self, target: &ModuleTarget) -> Result<ModuleResult, AgentError> {
        let started = Instant::now();
        let url = Url::parse(&target.final_url).map_err(|e| AgentError::ModuleError {
            module: self.name().to_string(),
            message: e.to_string(),
        })?;

        let mut findings = Vec::new();
        if url.scheme() != "https" {
            findings.push(Finding::new(
                "plaintext_http",
                "tls",
                Severity::High,
                0.95,
                "Site serves over plaintext HTTP",
            ));
        } else {
            // A successful rustls handshake means the chain validated.
            let mut https = url.clone();
            let _ = https.set_scheme("https");
            if let Err(e) = self.client.head(https).send().await
                && !e.is_timeout()
            {
                findings.push(Finding::new(
                    "tls_handshake_failed",
                    "tls",
                    Severity::High,
                    0.8,
                    format!("HTTPS probe failed: {e}"),
                ));
            }
        }

        Ok(ModuleResult {
            module: self.name().to_string(),
            score: score_from_findings(&findings),
            findings,
            errors: Vec::new(),
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

/// Redirect chain length and cross-host hops.
pub struct RedirectChainModule {
    client: reqwest::Client,
}

#[async_trait]
impl SecurityModule for RedirectChainModule {
    fn name(&self) -> &'static str {
        "redirect_chain"
    }

    fn tier(&self) -> DispatchTier {
        DispatchTier::Medium
    }

    async fn scan(&self, target: &ModuleTarget) -> Result<ModuleResult, AgentError> {
        let started = Instant::now();
        let mut findings = Vec::new();

        let origin = Url::parse(&target.url).ok();
        let landed = Url::parse(&target.final_url).ok();
        if let (Some(origin), Some(landed)) = (origin, landed)
            && origin.host_str() != landed.host_str()
        {
            findings.push(Finding::new(
                "cross_host_redirect",
                "redirects",
                Severity::Medium,
                0.7,
                format!(
                    "Request to {} landed on {}",
                    origin.host_str().unwrap_or("?"),
                    landed.host_str().unwrap_or("?")
                ),
            ));
        }

        // Probe without following redirects to expose chained hops.
        let probe = self
            .client
            .get(&target.url)
            .send()
            .await
            .map_err(|e| AgentError::ModuleError {
                module: self.name().to_string(),
                message: e.to_string(),
            })?;
        if probe.status().is_redirection() {
            findings.push(Finding::new(
                "still_redirecting",
                "redirects",
                Severity::Low,
                0.5,
                format!("Target still answers {} after the scout's visit", probe.status()),
            ));
        }

        Ok(ModuleResult {
            module: self.name().to_string(),
            score: score_from_findings(&findings),
            findings,
            errors: Vec::new(),
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

/// Score starts clean and loses weight per finding by severity.
fn score_from_findings(findings: &[Finding]) -> f64 {
    let penalty: f64 = findings
        .iter()
        .map(|f| {
            let weight = match f.severity {
                Severity::Info => 0.0,
                Severity::Low => 0.08,
                Severity::Medium => 0.2,
                Severity::High => 0.4,
                Severity::Critical => 0.6,
            };
            weight * f.confidence
        })
        .sum();
    (1.0 - penalty).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Tier, VerdictMode};

    fn target(url: &str) -> ModuleTarget {
        ModuleTarget {
            url: url.to_string(),
            final_url: url.to_string(),
            status_code: 200,
            dom_text: String::new(),
        }
    }

    #[tokio::test]
    async fn url_heuristics_flags_punycode_and_tld() {
        let module = UrlHeuristicsModule;
        let result = module
            .scan(&target("https://xn--pple-43d.example.tk/login"))
            .await
            .unwrap();
        let patterns: Vec<&str> = result
            .findings
            .iter()
            .map(|f| f.pattern_type.as_str())
            .collect();
        assert!(patterns.contains(&"punycode_host"));
        assert!(patterns.contains(&"suspicious_tld"));
        assert!(result.score < 1.0);
    }

    #[tokio::test]
    async fn url_heuristics_passes_clean_host() {
        let module = UrlHeuristicsModule;
        let result = module.scan(&target("https://wikipedia.org")).await.unwrap();
        assert!(result.findings.is_empty());
        assert_eq!(result.score, 1.0);
    }

    #[test]
    fn score_degrades_with_severity() {
        let low = vec![Finding::new("a", "b", Severity::Low, 1.0, "x")];
        let high = vec![Finding::new("a", "b", Severity::High, 1.0, "x")];
        assert!(score_from_findings(&low) > score_from_findings(&high));
        assert_eq!(score_from_findings(&[]), 1.0);

        let pile: Vec<Finding> = (0..10)
            .map(|_| Finding::new("a", "b", Severity::Critical, 1.0, "x"))
            .collect();
        assert_eq!(score_from_findings(&pile), 0.0);
    }

    #[test]
    fn enabled_modules_filter() {
        let agent = SecurityAgent::builtin();
        let all = crate::state::AuditState::new(
            "a",
            "https://example.com",
            Tier::QuickScan,
            VerdictMode::Simple,
        )
        .unwrap();
        assert_eq!(agent.enabled(&all).len(), 4);

        let some = all.clone().with_modules(vec![
            "url_heuristics".to_string(),
            "tls".to_string(),
        ]);
        let enabled = agent.enabled(&some);
        assert_eq!(enabled.len(), 2);
        let names: Vec<&str> = enabled.iter().map(|m| m.name()).collect();
        assert_eq!(names, vec!["url_heuristics", "tls"]);
    }

    #[test]
    fn module_target_from_bare_state_uses_audit_url() {
        let state = crate::state::AuditState::new(
            "a",
            "https://example.com",
            Tier::QuickScan,
            VerdictMode::Simple,
        )
        .unwrap();
        let t = ModuleTarget::from_state(&state);
        assert_eq!(t.url, "https://example.com");
        assert_eq!(t.final_url, "https://example.com");
        assert_eq!(t.status_code, 0);
    }

    #[test]
    fn errored_result_scores_neutral() {
        let r = errored_result("tls", Duration::from_millis(7), "boom".to_string());
        assert_eq!(r.score, 0.5);
        assert_eq!(r.errors, vec!["boom".to_string()]);
        assert!(r.findings.is_empty());
    }
}
