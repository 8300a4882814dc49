//! Engine configuration.
//!
//! Tunables ship with defaults matching the audit contract; a `veritas.toml`
//! next to the working directory (or passed via `--config`) overrides them.
//!
//! # Configuration File Format
//!
//! ```toml
//! [bus]
//! capacity = 500
//! events_per_second = 5
//! coalesce_window_ms = 200
//!
//! [stages]
//! scout_timeout_secs = 60
//! security_timeout_secs = 30
//! vision_timeout_secs = 45
//! graph_timeout_secs = 30
//! judge_timeout_secs = 10
//! graceful_cancel_timeout_secs = 5
//!
//! [scout_retry]
//! max_attempts = 3
//! initial_backoff_secs = 1
//! max_backoff_secs = 30
//!
//! [storage]
//! root = "storage"
//! db_file = "veritas.db"
//! max_screenshot_bytes = 5242880
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::event::AuditPhase;

/// Event bus tunables.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub capacity: usize,
    pub events_per_second: u32,
    pub coalesce_window: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: 500,
            events_per_second: 5,
            coalesce_window: Duration::from_millis(200),
        }
    }
}

/// Per-stage timeout caps plus the cancellation escalation window.
#[derive(Debug, Clone)]
pub struct StageConfig {
    pub scout_timeout: Duration,
    pub security_timeout: Duration,
    pub vision_timeout: Duration,
    pub graph_timeout: Duration,
    pub judge_timeout: Duration,
    pub graceful_cancel_timeout: Duration,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            scout_timeout: Duration::from_secs(60),
            security_timeout: Duration::from_secs(30),
            vision_timeout: Duration::from_secs(45),
            graph_timeout: Duration::from_secs(30),
            judge_timeout: Duration::from_secs(10),
            graceful_cancel_timeout: Duration::from_secs(5),
        }
    }
}

impl StageConfig {
    /// Cap for a given phase; `init` shares the judge cap (it does no work).
    pub fn cap_for(&self, phase: AuditPhase) -> Duration {
        match phase {
            AuditPhase::Scout => self.scout_timeout,
            AuditPhase::Security => self.security_timeout,
            AuditPhase::Vision => self.vision_timeout,
            AuditPhase::Graph => self.graph_timeout,
            AuditPhase::Judge | AuditPhase::Init => self.judge_timeout,
        }
    }
}

/// Scout retry policy for transient network errors.
#[derive(Debug, Clone)]
pub struct ScoutRetryConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ScoutRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl ScoutRetryConfig {
    /// Exponential backoff for the given zero-based attempt, capped.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Storage locations and limits.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub root: PathBuf,
    pub db_file: String,
    pub max_screenshot_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("storage"),
            db_file: "veritas.db".to_string(),
            max_screenshot_bytes: 5 * 1024 * 1024,
        }
    }
}

impl StorageConfig {
    pub fn db_path(&self) -> PathBuf {
        self.root.join(&self.db_file)
    }

    pub fn screenshots_root(&self) -> PathBuf {
        self.root.join("screenshots")
    }
}

/// Full engine configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub bus: BusConfig,
    pub stages: StageConfig,
    pub scout_retry: ScoutRetryConfig,
    pub storage: StorageConfig,
}

impl EngineConfig {
    /// Load overrides from a toml file, falling back to defaults when the
    /// file is absent. A present-but-malformed file is an error.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let overlay: ConfigOverlay = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(overlay.into_config())
    }
}

// ── Toml overlay ─────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct ConfigOverlay {
    #[serde(default)]
    bus: BusOverlay,
    #[serde(default)]
    stages: StagesOverlay,
    #[serde(default)]
    scout_retry: ScoutRetryOverlay,
    #[serde(default)]
    storage: StorageOverlay,
}

#[derive(Debug, Default, Deserialize)]
struct BusOverlay {
    capacity: Option<usize>,
    events_per_second: Option<u32>,
    coalesce_window_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct StagesOverlay {
    scout_timeout_secs: Option<u64>,
    security_timeout_secs: Option<u64>,
    vision_timeout_secs: Option<u64>,
    graph_timeout_secs: Option<u64>,
    judge_timeout_secs: Option<u64>,
    graceful_cancel_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ScoutRetryOverlay {
    max_attempts: Option<u32>,
    initial_backoff_secs: Option<u64>,
    max_backoff_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct StorageOverlay {
    root: Option<PathBuf>,
    db_file: Option<String>,
    max_screenshot_bytes: Option<u64>,
}

impl ConfigOverlay {
    fn into_config(self) -> EngineConfig {
        let mut config = EngineConfig::default();

        if let Some(v) = self.bus.capacity {
            config.bus.capacity = v.max(1);
        }
        if let Some(v) = self.bus.events_per_second {
            config.bus.events_per_second = v.max(1);
        }
        if let Some(v) = self.bus.coalesce_window_ms {
            config.bus.coalesce_window = Duration::from_millis(v);
        }

        if let Some(v) = self.stages.scout_timeout_secs {
            config.stages.scout_timeout = Duration::from_secs(v);
        }
        if let Some(v) = self.stages.security_timeout_secs {
            config.stages.security_timeout = Duration::from_secs(v);
        }
        if let Some(v) = self.stages.vision_timeout_secs {
            config.stages.vision_timeout = Duration::from_secs(v);
        }
        if let Some(v) = self.stages.graph_timeout_secs {
            config.stages.graph_timeout = Duration::from_secs(v);
        }
        if let Some(v) = self.stages.judge_timeout_secs {
            config.stages.judge_timeout = Duration::from_secs(v);
        }
        if let Some(v) = self.stages.graceful_cancel_timeout_secs {
            config.stages.graceful_cancel_timeout = Duration::from_secs(v);
        }

        if let Some(v) = self.scout_retry.max_attempts {
            config.scout_retry.max_attempts = v;
        }
        if let Some(v) = self.scout_retry.initial_backoff_secs {
            config.scout_retry.initial_backoff = Duration::from_secs(v);
        }
        if let Some(v) = self.scout_retry.max_backoff_secs {
            config.scout_retry.max_backoff = Duration::from_secs(v);
        }

        if let Some(v) = self.storage.root {
            config.storage.root = v;
        }
        if let Some(v) = self.storage.db_file {
            config.storage.db_file = v;
        }
        if let Some(v) = self.storage.max_screenshot_bytes {
            config.storage.max_screenshot_bytes = v;
        }

        config
    }
}
