//! Audit repository: the durable record of audits, findings, screenshots
//! and every progress event, in a WAL-mode SQLite database.
//!
//! Writers are serialized per process behind a mutex; WAL keeps readers
//! unblocked during writes. `create` and `append_event` are idempotent
//! (`INSERT OR IGNORE` against the primary/unique keys) so a runner restart
//! can safely replay. Event-append failures feed a bounded in-memory retry
//! queue; losing persistence degrades an audit but never aborts it.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::{Connection, params};

use crate::event::ProgressEvent;
use crate::state::{AuditStatus, Finding, ScreenshotMeta};

/// Events held for retry after an append failure before further failures
/// mark the audit degraded.
const APPEND_RETRY_WINDOW: usize = 16;

pub struct AuditRepository {
    conn: Mutex<Connection>,
    retry: Mutex<VecDeque<ProgressEvent>>,
    screenshots_root: PathBuf,
}

impl AuditRepository {
    /// Open (or create) the database at the given path and run migrations.
    pub fn open(path: &Path, screenshots_root: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create db dir {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = FULL;
             PRAGMA foreign_keys = ON;",
        )
        .context("Failed to set database pragmas")?;
        let repo = Self {
            conn: Mutex::new(conn),
            retry: Mutex::new(VecDeque::new()),
            screenshots_root,
        };
        repo.run_migrations()?;
        Ok(repo)
    }

    /// In-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        let repo = Self {
            conn: Mutex::new(conn),
            retry: Mutex::new(VecDeque::new()),
            screenshots_root: PathBuf::from("storage/screenshots"),
        };
        repo.run_migrations()?;
        Ok(repo)
    }

    fn run_migrations(&self) -> Result<()> {
        self.lock()?
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS audits (
                    audit_id TEXT PRIMARY KEY,
                    url TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'queued',
                    tier TEXT NOT NULL,
                    verdict_mode TEXT NOT NULL,
                    enabled_modules TEXT NOT NULL DEFAULT '[]',
                    trust_score INTEGER,
                    risk_level TEXT,
                    verdict_summary TEXT,
                    site_type TEXT,
                    ipc_mode TEXT,
                    pages_scanned INTEGER NOT NULL DEFAULT 0,
                    screenshots_count INTEGER NOT NULL DEFAULT 0,
                    vlm_calls_used INTEGER NOT NULL DEFAULT 0,
                    elapsed_seconds REAL,
                    errors_json TEXT NOT NULL DEFAULT '[]',
                    persistence_degraded INTEGER NOT NULL DEFAULT 0,
                    started_at TEXT NOT NULL DEFAULT (datetime('now')),
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS audit_findings (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    audit_id TEXT NOT NULL REFERENCES audits(audit_id) ON DELETE CASCADE,
                    pattern_type TEXT NOT NULL,
                    category TEXT NOT NULL,
                    severity TEXT NOT NULL,
                    confidence REAL NOT NULL,
                    description TEXT NOT NULL,
                    screenshot_index INTEGER,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS audit_screenshots (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    audit_id TEXT NOT NULL REFERENCES audits(audit_id) ON DELETE CASCADE,
                    file_path TEXT NOT NULL,
                    label TEXT NOT NULL,
                    index_num INTEGER NOT NULL,
                    file_size_bytes INTEGER NOT NULL,
                    mime_type TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(audit_id, file_path)
                );

                CREATE TABLE IF NOT EXISTS audit_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    audit_id TEXT NOT NULL REFERENCES audits(audit_id) ON DELETE CASCADE,
                    sequence_no INTEGER NOT NULL,
                    kind TEXT NOT NULL,
                    phase TEXT,
                    payload_json TEXT NOT NULL,
                    timestamp TEXT NOT NULL,
                    UNIQUE(audit_id, sequence_no)
                );

                CREATE INDEX IF NOT EXISTS idx_findings_audit ON audit_findings(audit_id);
                CREATE INDEX IF NOT EXISTS idx_screenshots_audit ON audit_screenshots(audit_id);
                CREATE INDEX IF NOT EXISTS idx_events_audit ON audit_events(audit_id, sequence_no);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("repository lock poisoned"))
    }

    // ── Audit lifecycle ──────────────────────────────────────────────

    /// Insert the audit row with status `queued`. Idempotent on the id: a
    /// second create with the same id is a no-op.
    pub fn create(
        &self,
        audit_id: &str,
        url: &str,
        tier: &str,
        verdict_mode: &str,
        enabled_modules: &[String],
    ) -> Result<()> {
        let modules_json =
            serde_json::to_string(enabled_modules).context("Failed to encode enabled modules")?;
        self.lock()?
            .execute(
                "INSERT OR IGNORE INTO audits (audit_id, url, tier, verdict_mode, enabled_modules)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![audit_id, url, tier, verdict_mode, modules_json],
            )
            .context("Failed to insert audit")?;
        Ok(())
    }

    pub fn set_status(&self, audit_id: &str, status: AuditStatus) -> Result<()> {
        self.lock()?
            .execute(
                "UPDATE audits SET status = ?1 WHERE audit_id = ?2",
                params![status.as_str(), audit_id],
            )
            .context("Failed to update audit status")?;
        Ok(())
    }

    /// Record which IPC mode actually carried the audit (fallback included).
    pub fn set_ipc_mode(&self, audit_id: &str, mode: &str) -> Result<()> {
        self.lock()?
            .execute(
                "UPDATE audits SET ipc_mode = ?1 WHERE audit_id = ?2",
                params![mode, audit_id],
            )
            .context("Failed to update ipc mode")?;
        Ok(())
    }

    pub fn mark_persistence_degraded(&self, audit_id: &str) -> Result<()> {
        self.lock()?
            .execute(
                "UPDATE audits SET persistence_degraded = 1 WHERE audit_id = ?1",
                params![audit_id],
            )
            .context("Failed to mark audit degraded")?;
        Ok(())
    }

    /// Finalize the audit row from the engine's `audit_result` summary, in
    /// one transaction.
    pub fn complete(&self, audit_id: &str, summary: &serde_json::Value) -> Result<()> {
        let errors_json = serde_json::to_string(
            summary.get("errors").unwrap_or(&serde_json::Value::Array(vec![])),
        )
        .context("Failed to encode errors")?;

        let mut conn = self.lock()?;
        let tx = conn.transaction().context("Failed to begin transaction")?;
        tx.execute(
            "UPDATE audits SET
                status = ?1,
                trust_score = ?2,
                risk_level = ?3,
                verdict_summary = ?4,
                site_type = ?5,
                pages_scanned = ?6,
                screenshots_count = ?7,
                vlm_calls_used = ?8,
                elapsed_seconds = ?9,
                errors_json = ?10,
                completed_at = datetime('now')
             WHERE audit_id = ?11",
            params![
                summary["status"].as_str().unwrap_or("completed"),
                summary["trust_score"].as_i64(),
                summary["risk_level"].as_str(),
                summary["verdict_summary"].as_str(),
                summary["site_type"].as_str(),
                summary["pages_scanned"].as_i64().unwrap_or(0),
                summary["screenshots_count"].as_i64().unwrap_or(0),
                summary["vlm_calls_used"].as_i64().unwrap_or(0),
                summary["elapsed_seconds"].as_f64(),
                errors_json,
                audit_id,
            ],
        )
        .context("Failed to finalize audit row")?;
        tx.commit().context("Failed to commit audit completion")?;
        Ok(())
    }

    /// Terminal error path: status plus the error recorded on the row.
    pub fn mark_error(&self, audit_id: &str, kind: &str, message: &str) -> Result<()> {
        let error_json = serde_json::to_string(&serde_json::json!([{
            "kind": kind,
            "message": message,
        }]))
        .context("Failed to encode error")?;
        self.lock()?
            .execute(
                "UPDATE audits SET status = 'error', errors_json = ?1,
                 completed_at = datetime('now') WHERE audit_id = ?2",
                params![error_json, audit_id],
            )
            .context("Failed to mark audit errored")?;
        Ok(())
    }

    // ── Events ───────────────────────────────────────────────────────

    /// Persist one event. Idempotent on `(audit_id, sequence_no)`; replays
    /// do not duplicate rows.
    pub fn append_event(&self, event: &ProgressEvent) -> Result<()> {
        let payload =
            serde_json::to_string(&event.payload).context("Failed to encode event payload")?;
        self.lock()?
            .execute(
                "INSERT OR IGNORE INTO audit_events
                    (audit_id, sequence_no, kind, phase, payload_json, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.audit_id,
                    event.sequence_no as i64,
                    event.kind.as_str(),
                    event.phase.map(|p| p.as_str()),
                    payload,
                    event.timestamp.to_rfc3339(),
                ],
            )
            .context("Failed to insert audit event")?;
        Ok(())
    }

    /// Append with the bounded retry window. Returns `true` once the audit
    /// should be considered persistence-degraded.
    pub fn append_event_resilient(&self, event: &ProgressEvent) -> bool {
        // Drain anything queued from earlier failures first, preserving
        // order.
        loop {
            let queued = {
                let mut retry = match self.retry.lock() {
                    Ok(retry) => retry,
                    Err(_) => return true,
                };
                retry.pop_front()
            };
            let Some(queued) = queued else { break };
            if let Err(e) = self.append_event(&queued) {
                tracing::warn!(error = %e, "event append retry failed");
                if let Ok(mut retry) = self.retry.lock() {
                    retry.push_front(queued);
                }
                break;
            }
        }

        match self.append_event(event) {
            Ok(()) => false,
            Err(e) => {
                tracing::warn!(error = %e, seq = event.sequence_no, "event append failed");
                let mut retry = match self.retry.lock() {
                    Ok(retry) => retry,
                    Err(_) => return true,
                };
                if retry.len() < APPEND_RETRY_WINDOW {
                    retry.push_back(event.clone());
                    false
                } else {
                    // Window exhausted: the audit continues, degraded.
                    let _ = self.mark_persistence_degraded(&event.audit_id);
                    true
                }
            }
        }
    }

    /// Largest persisted sequence number for an audit (0 when none).
    pub fn max_sequence_no(&self, audit_id: &str) -> Result<u64> {
        let max: i64 = self
            .lock()?
            .query_row(
                "SELECT COALESCE(MAX(sequence_no), 0) FROM audit_events WHERE audit_id = ?1",
                params![audit_id],
                |row| row.get(0),
            )
            .context("Failed to query max sequence")?;
        Ok(max.max(0) as u64)
    }

    /// Whether a terminal event has been persisted for this audit.
    pub fn has_terminal_event(&self, audit_id: &str) -> Result<bool> {
        let count: i64 = self
            .lock()?
            .query_row(
                "SELECT COUNT(*) FROM audit_events
                 WHERE audit_id = ?1 AND kind IN ('audit_complete', 'audit_error')",
                params![audit_id],
                |row| row.get(0),
            )
            .context("Failed to query terminal events")?;
        Ok(count > 0)
    }

    /// All persisted events for an audit in sequence order.
    pub fn events(&self, audit_id: &str) -> Result<Vec<EventRow>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT sequence_no, kind, phase, payload_json, timestamp
                 FROM audit_events WHERE audit_id = ?1 ORDER BY sequence_no",
            )
            .context("Failed to prepare events query")?;
        let rows = stmt
            .query_map(params![audit_id], |row| {
                Ok(EventRow {
                    sequence_no: row.get::<_, i64>(0)? as u64,
                    kind: row.get(1)?,
                    phase: row.get(2)?,
                    payload_json: row.get(3)?,
                    timestamp: row.get(4)?,
                })
            })
            .context("Failed to query events")?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row.context("Failed to read event row")?);
        }
        Ok(events)
    }

    // ── Findings & screenshots ───────────────────────────────────────

    pub fn add_finding(&self, audit_id: &str, finding: &Finding) -> Result<()> {
        self.lock()?
            .execute(
                "INSERT INTO audit_findings
                    (audit_id, pattern_type, category, severity, confidence,
                     description, screenshot_index)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    audit_id,
                    finding.pattern_type,
                    finding.category,
                    finding.severity.as_str(),
                    finding.confidence,
                    finding.description,
                    finding.screenshot_index.map(|i| i as i64),
                ],
            )
            .context("Failed to insert finding")?;
        Ok(())
    }

    /// Store screenshot metadata. The path must resolve under the
    /// configured screenshots root; traversal is rejected.
    pub fn add_screenshot(&self, audit_id: &str, meta: &ScreenshotMeta) -> Result<()> {
        let store = crate::screenshots::ScreenshotStore::new(self.screenshots_root.clone(), u64::MAX);
        store
            .validate(Path::new(&meta.path))
            .context("Screenshot path failed validation")?;

        self.lock()?
            .execute(
                "INSERT OR IGNORE INTO audit_screenshots
                    (audit_id, file_path, label, index_num, file_size_bytes, mime_type)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    audit_id,
                    meta.path,
                    meta.label,
                    meta.index as i64,
                    meta.size_bytes as i64,
                    meta.mime,
                ],
            )
            .context("Failed to insert screenshot")?;
        Ok(())
    }

    // ── Reads ────────────────────────────────────────────────────────

    pub fn get(&self, audit_id: &str) -> Result<Option<AuditRow>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!("{AUDIT_SELECT} WHERE audit_id = ?1"))
            .context("Failed to prepare get query")?;
        let mut rows = stmt
            .query_map(params![audit_id], AuditRow::from_row)
            .context("Failed to query audit")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read audit row")?)),
            None => Ok(None),
        }
    }

    pub fn list_recent(&self, limit: u32, offset: u32) -> Result<Vec<AuditRow>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "{AUDIT_SELECT} ORDER BY started_at DESC LIMIT ?1 OFFSET ?2"
            ))
            .context("Failed to prepare list query")?;
        let rows = stmt
            .query_map(params![limit as i64, offset as i64], AuditRow::from_row)
            .context("Failed to query audits")?;
        let mut audits = Vec::new();
        for row in rows {
            audits.push(row.context("Failed to read audit row")?);
        }
        Ok(audits)
    }

    pub fn get_with_children(&self, audit_id: &str) -> Result<Option<AuditDetail>> {
        let Some(audit) = self.get(audit_id)? else {
            return Ok(None);
        };

        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT pattern_type, category, severity, confidence, description,
                        screenshot_index
                 FROM audit_findings WHERE audit_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare findings query")?;
        let finding_rows = stmt
            .query_map(params![audit_id], |row| {
                Ok(FindingRow {
                    pattern_type: row.get(0)?,
                    category: row.get(1)?,
                    severity: row.get(2)?,
                    confidence: row.get(3)?,
                    description: row.get(4)?,
                    screenshot_index: row.get::<_, Option<i64>>(5)?.map(|i| i as u32),
                })
            })
            .context("Failed to query findings")?;
        let mut findings = Vec::new();
        for row in finding_rows {
            findings.push(row.context("Failed to read finding row")?);
        }

        let mut stmt = conn
            .prepare(
                "SELECT file_path, label, index_num, file_size_bytes, mime_type
                 FROM audit_screenshots WHERE audit_id = ?1 ORDER BY index_num",
            )
            .context("Failed to prepare screenshots query")?;
        let screenshot_rows = stmt
            .query_map(params![audit_id], |row| {
                Ok(ScreenshotMeta {
                    path: row.get(0)?,
                    label: row.get(1)?,
                    index: row.get::<_, i64>(2)? as u32,
                    size_bytes: row.get::<_, i64>(3)? as u64,
                    mime: row.get(4)?,
                })
            })
            .context("Failed to query screenshots")?;
        let mut screenshots = Vec::new();
        for row in screenshot_rows {
            screenshots.push(row.context("Failed to read screenshot row")?);
        }

        let event_count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM audit_events WHERE audit_id = ?1",
                params![audit_id],
                |row| row.get(0),
            )
            .context("Failed to count events")?;

        Ok(Some(AuditDetail {
            audit,
            findings,
            screenshots,
            event_count: event_count as u64,
        }))
    }
}

const AUDIT_SELECT: &str = "SELECT audit_id, url, status, tier, verdict_mode, enabled_modules,
        trust_score, risk_level, verdict_summary, site_type, ipc_mode,
        pages_scanned, screenshots_count, vlm_calls_used, elapsed_seconds,
        errors_json, persistence_degraded, started_at, completed_at
 FROM audits";

/// One row of the `audits` table.
#[derive(Debug, Clone)]
pub struct AuditRow {
    pub audit_id: String,
    pub url: String,
    pub status: String,
    pub tier: String,
    pub verdict_mode: String,
    pub enabled_modules: String,
    pub trust_score: Option<i64>,
    pub risk_level: Option<String>,
    pub verdict_summary: Option<String>,
    pub site_type: Option<String>,
    pub ipc_mode: Option<String>,
    pub pages_scanned: i64,
    pub screenshots_count: i64,
    pub vlm_calls_used: i64,
    pub elapsed_seconds: Option<f64>,
    pub errors_json: String,
    pub persistence_degraded: bool,
    pub started_at: String,
    pub completed_at: Option<String>,
}

impl AuditRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            audit_id: row.get(0)?,
            url: row.get(1)?,
            status: row.get(2)?,
            tier: row.get(3)?,
            verdict_mode: row.get(4)?,
            enabled_modules: row.get(5)?,
            trust_score: row.get(6)?,
            risk_level: row.get(7)?,
            verdict_summary: row.get(8)?,
            site_type: row.get(9)?,
            ipc_mode: row.get(10)?,
            pages_scanned: row.get(11)?,
            screenshots_count: row.get(12)?,
            vlm_calls_used: row.get(13)?,
            elapsed_seconds: row.get(14)?,
            errors_json: row.get(15)?,
            persistence_degraded: row.get::<_, i64>(16)? != 0,
            started_at: row.get(17)?,
            completed_at: row.get(18)?,
        })
    }
}

/// A persisted event, as read back for inspection or post-mortem.
#[derive(Debug, Clone)]
pub struct EventRow {
    pub sequence_no: u64,
    pub kind: String,
    pub phase: Option<String>,
    pub payload_json: String,
    pub timestamp: String,
}

/// A finding as read back from storage.
#[derive(Debug, Clone)]
pub struct FindingRow {
    pub pattern_type: String,
    pub category: String,
    pub severity: String,
    pub confidence: f64,
    pub description: String,
    pub screenshot_index: Option<u32>,
}

/// An audit with its child records.
#[derive(Debug, Clone)]
pub struct AuditDetail {
    pub audit: AuditRow,
    pub findings: Vec<FindingRow>,
    pub screenshots: Vec<ScreenshotMeta>,
    pub event_count: u64,
}

// ── Tests ─────────────────────────────────────────────────────────────
