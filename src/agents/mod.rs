//! Agent contracts and the explicit registry.
//!
//! All five agents obey the same shape: `analyze(snapshot, ctx) -> patch`.
//! The snapshot is read-only; mutation happens only when the orchestrator
//! applies the returned [`StatePatch`]. Agents are discovered through a
//! string-id registry populated at process start, never by runtime introspection.

pub mod graph;
pub mod judge;
pub mod scout;
pub mod security;
pub mod vision;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::errors::AgentError;
use crate::event::AuditPhase;
use crate::state::{AuditState, StatePatch};

pub use graph::{DnsResolutionSource, GraphAgent, OsintSource};
pub use judge::JudgeAgent;
pub use scout::{PageCapturer, ScoutAgent};
pub use security::{SecurityAgent, SecurityModule};
pub use vision::{ScreenshotAnalyzer, UnavailableAnalyzer, VisionAgent};

/// Everything an agent may touch besides its state snapshot.
#[derive(Clone)]
pub struct AgentContext {
    pub audit_id: String,
    /// Bus handle for mid-run emission (findings, screenshots, logs).
    pub bus: EventBus,
    /// Cancellation signal; agents must quiesce within 2 seconds of it
    /// firing.
    pub cancel: CancellationToken,
    /// Per-call deadline the stage runner will enforce; agents with
    /// internal fan-out use it to size their own sub-deadlines.
    pub deadline: Duration,
}

/// Uniform contract for the five pipeline agents.
#[async_trait]
pub trait Agent: Send + Sync {
    /// The phase this agent serves.
    fn phase(&self) -> AuditPhase;

    /// Analyze the current audit snapshot and return a patch.
    async fn analyze(
        &self,
        snapshot: &AuditState,
        ctx: &AgentContext,
    ) -> Result<StatePatch, AgentError>;
}

/// Latency class for in-stage fan-out workers (security modules, OSINT
/// sources). Within a tier, workers run in parallel; tiers run in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DispatchTier {
    Fast,
    Medium,
    Deep,
}

impl DispatchTier {
    pub const ALL: [DispatchTier; 3] = [Self::Fast, Self::Medium, Self::Deep];

    /// Per-worker deadline inside this tier.
    pub fn deadline(&self) -> Duration {
        match self {
            Self::Fast => Duration::from_secs(5),
            Self::Medium => Duration::from_secs(10),
            Self::Deep => Duration::from_secs(30),
        }
    }
}

type AgentCtor = Box<dyn Fn() -> Arc<dyn Agent> + Send + Sync>;

/// Table mapping a string id to an agent constructor. New agents are
/// registered at process start; lookup is by exact id.
#[derive(Default)]
pub struct AgentRegistry {
    ctors: BTreeMap<String, AgentCtor>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, id: &str, ctor: F)
    where
        F: Fn() -> Arc<dyn Agent> + Send + Sync + 'static,
    {
        self.ctors.insert(id.to_string(), Box::new(ctor));
    }

    pub fn build(&self, id: &str) -> Option<Arc<dyn Agent>> {
        self.ctors.get(id).map(|ctor| ctor())
    }

    pub fn ids(&self) -> Vec<&str> {
        self.ctors.keys().map(String::as_str).collect()
    }

    /// Registry with the built-in pipeline agents.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("scout", || Arc::new(ScoutAgent::new()));
        registry.register("security", || Arc::new(SecurityAgent::builtin()));
        registry.register("vision", || {
            Arc::new(VisionAgent::new(Arc::new(UnavailableAnalyzer)))
        });
        registry.register("graph", || Arc::new(GraphAgent::builtin()));
        registry.register("judge", || Arc::new(JudgeAgent::new()));
        registry
    }
}

/// The five agents an orchestrator drives, resolved from a registry or
/// assembled directly (tests inject scripted agents here).
#[derive(Clone)]
pub struct AgentSet {
    pub scout: Arc<dyn Agent>,
    pub security: Arc<dyn Agent>,
    pub vision: Arc<dyn Agent>,
    pub graph: Arc<dyn Agent>,
    pub judge: Arc<dyn Agent>,
}

impl AgentSet {
    /// Resolve the standard five from a registry. Fails if any id is
    /// missing.
    pub fn from_registry(registry: &AgentRegistry) -> anyhow::Result<Self> {
        let get = |id: &str| {
            registry
                .build(id)
                .ok_or_else(|| anyhow::anyhow!("agent '{id}' is not registered"))
        };
        Ok(Self {
            scout: get("scout")?,
            security: get("security")?,
            vision: get("vision")?,
            graph: get("graph")?,
            judge: get("judge")?,
        })
    }

    pub fn builtin() -> Self {
        Self {
            scout: Arc::new(ScoutAgent::new()),
            security: Arc::new(SecurityAgent::builtin()),
            vision: Arc::new(VisionAgent::new(Arc::new(UnavailableAnalyzer))),
            graph: Arc::new(GraphAgent::builtin()),
            judge: Arc::new(JudgeAgent::new()),
        }
    }
}
