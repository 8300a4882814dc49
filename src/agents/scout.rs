//! Scout agent: visits one pending URL and brings back the page.
//!
//! The built-in scout is a plain HTTP fetch, enough to feed the security
//! and graph stages with real content. Full browser automation plugs in
//! behind the [`PageCapturer`] seam; when no capturer is wired the scout
//! simply produces no screenshots and the vision stage degrades.

use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use url::Url;

use super::{Agent, AgentContext};
use crate::errors::AgentError;
use crate::event::{AuditPhase, EventDraft};
use crate::state::{AuditState, ScoutResult, ScreenshotMeta, StatePatch};

/// Upper bound on extracted visible text, to keep state and events small.
const MAX_DOM_TEXT: usize = 20_000;

/// Upper bound on harvested same-site links per page.
const MAX_LINKS: usize = 25;

static TITLE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap());

static HREF_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)href\s*=\s*["']([^"'#]+)["']"#).unwrap());

static TAG_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script.*?</script>|<style.*?</style>|<[^>]+>").unwrap());

/// Markers that identify an interstitial challenge page.
const CAPTCHA_MARKERS: [&str; 4] = [
    "g-recaptcha",
    "h-captcha",
    "cf-challenge",
    "are you a robot",
];

/// Optional browser-automation seam: renders a page and returns raw
/// screenshot bytes plus a label per capture.
#[async_trait]
pub trait PageCapturer: Send + Sync {
    async fn capture(&self, url: &str) -> Result<Vec<(String, Vec<u8>)>, AgentError>;
}

/// Built-in HTTP scout.
pub struct ScoutAgent {
    client: reqwest::Client,
    capturer: Option<Arc<dyn PageCapturer>>,
    screenshot_store: Option<crate::screenshots::ScreenshotStore>,
}

impl ScoutAgent {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("veritas-scout/0.1")
            .build()
            .unwrap_or_default();
        Self {
            client,
            capturer: None,
            screenshot_store: None,
        }
    }

    /// Wire a browser-automation capturer and the store its captures land in.
    pub fn with_capturer(
        mut self,
        capturer: Arc<dyn PageCapturer>,
        store: crate::screenshots::ScreenshotStore,
    ) -> Self {
        self.capturer = Some(capturer);
        self.screenshot_store = Some(store);
        self
    }

    async fn fetch(&self, url: &str) -> Result<(u16, String, String), AgentError> {
        let response = self.client.get(url).send().await.map_err(map_fetch_error)?;
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let body = response.text().await.map_err(map_fetch_error)?;
        Ok((status, final_url, body))
    }

    async fn capture_screenshots(
        &self,
        audit_id: &str,
        url: &str,
        ctx: &AgentContext,
    ) -> Vec<ScreenshotMeta> {
        let (Some(capturer), Some(store)) = (&self.capturer, &self.screenshot_store) else {
            return Vec::new();
        };
        let captures = match capturer.capture(url).await {
            Ok(captures) => captures,
            Err(e) => {
                tracing::warn!(url, error = %e, "page capture failed");
                return Vec::new();
            }
        };

        let mut metas = Vec::new();
        for (index, (label, bytes)) in captures.into_iter().enumerate() {
            match store.save(audit_id, index as u32, &label, &bytes) {
                Ok(meta) => {
                    let _ = ctx
                        .bus
                        .publish(EventDraft::screenshot(AuditPhase::Scout, &meta))
                        .await;
                    metas.push(meta);
                }
                Err(e) => tracing::warn!(audit_id, error = %e, "screenshot save failed"),
            }
        }
        metas
    }
}

impl Default for ScoutAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Agent for ScoutAgent {
    fn phase(&self) -> AuditPhase {
        AuditPhase::Scout
    }

    async fn analyze(
        &self,
        snapshot: &AuditState,
        ctx: &AgentContext,
    ) -> Result<StatePatch, AgentError> {
        let url = snapshot
            .pending_urls
            .first()
            .cloned()
            .ok_or_else(|| AgentError::Failed("no pending URLs to scout".to_string()))?;

        let _ = ctx
            .bus
            .publish(EventDraft::phase_progress(
                AuditPhase::Scout,
                &format!("visiting {url}"),
            ))
            .await;

        let fetch = self.fetch(&url);
        let (status, final_url, body) = tokio::select! {
            result = fetch => result?,
            _ = ctx.cancel.cancelled() => return Err(AgentError::Cancelled),
        };

        classify_block(status, &body)?;

        let screenshots = self.capture_screenshots(&ctx.audit_id, &url, ctx).await;
        let result = ScoutResult {
            url: url.clone(),
            final_url: final_url.clone(),
            status_code: status,
            title: extract_title(&body),
            dom_text: extract_text(&body),
            links: extract_same_site_links(&final_url, &body),
            screenshots,
            fetched_at: Utc::now(),
        };

        Ok(StatePatch {
            discovered_urls: result.links.clone(),
            scout_result: Some(result),
            investigated_url: Some(url),
            ..StatePatch::default()
        })
    }
}

/// Map a reqwest failure onto the scout's error kinds.
fn map_fetch_error(e: reqwest::Error) -> AgentError {
    if e.is_timeout() {
        AgentError::NavigationTimeout
    } else if e.is_connect() {
        let message = e.to_string();
        if message.contains("dns") || message.contains("resolve") {
            AgentError::DnsFailed(message)
        } else {
            AgentError::Failed(message)
        }
    } else {
        AgentError::Failed(e.to_string())
    }
}

/// Detect bot walls and CAPTCHA interstitials.
fn classify_block(status: u16, body: &str) -> Result<(), AgentError> {
    let lower = body.to_lowercase();
    if CAPTCHA_MARKERS.iter().any(|m| lower.contains(m)) {
        return Err(AgentError::CaptchaBlocked);
    }
    if status == 403 || status == 429 {
        return Err(AgentError::BotBlocked);
    }
    Ok(())
}

fn extract_title(body: &str) -> Option<String> {
    TITLE_REGEX
        .captures(body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Strip markup and collapse whitespace into a bounded text excerpt.
fn extract_text(body: &str) -> String {
    let stripped = TAG_REGEX.replace_all(body, " ");
    let mut text = String::with_capacity(stripped.len().min(MAX_DOM_TEXT));
    let mut last_was_space = true;
    for ch in stripped.chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                text.push(' ');
                last_was_space = true;
            }
        } else {
            text.push(ch);
            last_was_space = false;
        }
        if text.len() >= MAX_DOM_TEXT {
            break;
        }
    }
    text.trim().to_string()
}

/// Harvest absolute same-host links, bounded and deduplicated in order.
fn extract_same_site_links(base: &str, body: &str) -> Vec<String> {
    let Ok(base_url) = Url::parse(base) else {
        return Vec::new();
    };
    let host = base_url.host_str().map(str::to_string);

    let mut links = Vec::new();
    for cap in HREF_REGEX.captures_iter(body) {
        let Some(href) = cap.get(1) else { continue };
        let Ok(mut resolved) = base_url.join(href.as_str()) else {
            continue;
        };
        resolved.set_fragment(None);
        if !matches!(resolved.scheme(), "http" | "https") {
            continue;
        }
        if resolved.host_str().map(str::to_string) != host {
            continue;
        }
        let link = resolved.to_string();
        if link != base && !links.contains(&link) {
            links.push(link);
        }
        if links.len() >= MAX_LINKS {
            break;
        }
    }
    links
}
