//! Audit Writer (§4.8). A single writer per process owning an in-memory
//! buffer and a daily-rotated JSONL directory. The `AuditSink` capability
//! trait (§9) is the seam the Tool Router and HTTP layer depend on.

use crate::model::{AuditEvent, AuditSeverity};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::Notify;

const AUTO_FLUSH_LEN: usize = 100;
const DEFAULT_RETENTION_DAYS: i64 = 90;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit_dir must be absolute and must not contain '..' components")]
    InvalidAuditDir,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn emit(&self, event: AuditEvent);
    async fn emit_batch(&self, events: Vec<AuditEvent>);
    async fn flush(&self) -> Result<usize>;
    async fn query(&self, query: AuditQuery) -> Result<Vec<AuditEvent>>;
}

/// §4.8: "streams each relevant date file line-by-line, parses, filters".
/// `start_time`/`end_time` are full ISO-8601 timestamps (as event records
/// carry, e.g. `2026-02-16T10:00:00.000Z`), not whole-day dates — the date
/// portion is used only to pick which `audit-YYYY-MM-DD.jsonl` files need to
/// be opened at all; every event read from those files is then re-checked
/// against the full timestamp bound.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub client_id: Option<String>,
    pub user_id: Option<String>,
    pub event_type: Option<String>,
    pub severity: Option<AuditSeverity>,
    pub limit: Option<usize>,
}

struct Buffer {
    events: Vec<AuditEvent>,
    is_flushing: bool,
}

pub struct AuditWriter {
    audit_dir: PathBuf,
    buffer: Mutex<Buffer>,
    retention_days: i64,
    flush_notify: Notify,
    shutting_down: std::sync::atomic::AtomicBool,
}

impl AuditWriter {
    pub fn new(audit_dir: PathBuf, retention_days: i64) -> Result<Self> {
        validate_audit_dir(&audit_dir)?;
        std::fs::create_dir_all(&audit_dir)
            .with_context(|| format!("creating {}", audit_dir.display()))?;
        set_dir_mode(&audit_dir, 0o700)?;

        Ok(Self {
            audit_dir,
            buffer: Mutex::new(Buffer {
                events: Vec::new(),
                is_flushing: false,
            }),
            retention_days,
            flush_notify: Notify::new(),
            shutting_down: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn mark_shutting_down(&self) {
        self.shutting_down
            .store(true, std::sync::atomic::Ordering::Release);
    }

    /// Background periodic flush tick (default 5s), driven by the caller's
    /// task exactly like the existing health-checker/reloader background
    /// tasks are driven by a `tokio::time::interval`.
    pub async fn run_periodic_flush(&self, period: std::time::Duration, shutdown: &Notify) {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.flush().await {
                        tracing::warn!(error = %e, "periodic audit flush failed");
                    }
                }
                _ = shutdown.notified() => {
                    let _ = self.flush().await;
                    return;
                }
            }
        }
    }

    fn file_path(&self, date: &str) -> PathBuf {
        self.audit_dir.join(format!("audit-{date}.jsonl"))
    }

    /// Retention pruning (§4.8, P8): removes `audit-YYYY-MM-DD.jsonl` files
    /// older than `retention_days`. Returns the real count removed — open
    /// question 1 (see DESIGN.md): this implementation returns the actual
    /// count instead of a hardcoded 0.
    pub fn prune_retention(&self) -> Result<usize> {
        let horizon = chrono_like_date_sub_days(today(), self.retention_days);
        let mut removed = 0;

        for entry in std::fs::read_dir(&self.audit_dir)
            .with_context(|| format!("reading {}", self.audit_dir.display()))?
        {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(date) = parse_audit_filename(name) else {
                continue;
            };
            if date < horizon {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }

        Ok(removed)
    }
}

#[async_trait]
impl AuditSink for AuditWriter {
    async fn emit(&self, event: AuditEvent) {
        if self.shutting_down.load(std::sync::atomic::Ordering::Acquire) {
            tracing::warn!(event_id = %event.event_id, "audit emit during shutdown, dropping silently per spec");
            return;
        }

        let should_flush = {
            let mut buf = self.buffer.lock().unwrap();
            buf.events.push(event);
            buf.events.len() >= AUTO_FLUSH_LEN
        };

        if should_flush {
            self.flush_notify.notify_one();
            if let Err(e) = self.flush().await {
                tracing::warn!(error = %e, "auto-flush failed");
            }
        }
    }

    async fn emit_batch(&self, events: Vec<AuditEvent>) {
        for event in events {
            self.emit(event).await;
        }
    }

    /// Flush (§4.8): guarded by a single lock, atomically swaps the buffer
    /// with an empty one, groups by date, writes one file per date at mode
    /// 0600. Write failure for a date re-buffers just that date's events;
    /// an unknown error re-buffers the entire batch.
    async fn flush(&self) -> Result<usize> {
        let batch = {
            let mut buf = self.buffer.lock().unwrap();
            if buf.is_flushing {
                return Ok(0);
            }
            buf.is_flushing = true;
            std::mem::take(&mut buf.events)
        };

        if batch.is_empty() {
            self.buffer.lock().unwrap().is_flushing = false;
            return Ok(0);
        }

        let mut by_date: HashMap<String, Vec<AuditEvent>> = HashMap::new();
        for event in batch {
            by_date.entry(event.date().to_string()).or_default().push(event);
        }

        let mut written = 0;
        let mut failed: Vec<AuditEvent> = Vec::new();

        for (date, events) in by_date {
            match self.write_date_file(&date, &events) {
                Ok(()) => written += events.len(),
                Err(e) => {
                    tracing::warn!(date = %date, error = %e, "audit flush failed for date, re-buffering");
                    failed.extend(events);
                }
            }
        }

        {
            let mut buf = self.buffer.lock().unwrap();
            // Re-buffered events go back to the front conceptually; since
            // ordering across dates on failure has no ordering guarantee
            // in the spec, appending is sufficient here.
            let mut restored = failed;
            restored.extend(std::mem::take(&mut buf.events));
            buf.events = restored;
            buf.is_flushing = false;
        }

        Ok(written)
    }

    async fn query(&self, q: AuditQuery) -> Result<Vec<AuditEvent>> {
        let limit = q.limit.unwrap_or(1000);
        let mut results = Vec::new();

        // The date portion of each bound only narrows which files are opened
        // at all; the full timestamp is re-checked per event below so an
        // intra-day window (e.g. 10:00-11:00 on the same date) is honored.
        let start_date = q.start_time.as_deref().map(|t| &t[..10.min(t.len())]);
        let end_date = q.end_time.as_deref().map(|t| &t[..10.min(t.len())]);

        let mut dates: Vec<String> = std::fs::read_dir(&self.audit_dir)
            .with_context(|| format!("reading {}", self.audit_dir.display()))?
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().and_then(parse_audit_filename_owned))
            .collect();
        dates.sort();

        for date in dates {
            if let Some(start) = start_date {
                if date.as_str() < start {
                    continue;
                }
            }
            if let Some(end) = end_date {
                if date.as_str() > end {
                    continue;
                }
            }

            let path = self.file_path(&date);
            let Ok(contents) = std::fs::read_to_string(&path) else {
                continue; // missing files are not errors
            };

            for line in contents.lines() {
                if results.len() >= limit {
                    return Ok(results);
                }
                let event: AuditEvent = match serde_json::from_str(line) {
                    Ok(e) => e,
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping unparseable audit line");
                        continue;
                    }
                };

                if let Some(start) = &q.start_time {
                    if &event.timestamp < start {
                        continue;
                    }
                }
                if let Some(end) = &q.end_time {
                    if &event.timestamp > end {
                        continue;
                    }
                }
                if let Some(cid) = &q.client_id {
                    if event.client_id.as_deref() != Some(cid.as_str()) {
                        continue;
                    }
                }
                if let Some(uid) = &q.user_id {
                    if event.user_id.as_deref() != Some(uid.as_str()) {
                        continue;
                    }
                }
                if let Some(et) = &q.event_type {
                    if &event.event_type != et {
                        continue;
                    }
                }
                if let Some(sev) = &q.severity {
                    if event.severity != *sev {
                        continue;
                    }
                }

                results.push(event);
            }
        }

        Ok(results)
    }
}

impl AuditWriter {
    fn write_date_file(&self, date: &str, events: &[AuditEvent]) -> Result<()> {
        use std::io::Write;
        let path = self.file_path(date);

        let mut contents = String::new();
        for event in events {
            contents.push_str(&serde_json::to_string(event)?);
            contents.push('\n');
        }

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        file.write_all(contents.as_bytes())?;
        set_file_mode(&path, 0o600)?;
        Ok(())
    }
}

fn validate_audit_dir(path: &Path) -> Result<(), AuditError> {
    if !path.is_absolute() {
        return Err(AuditError::InvalidAuditDir);
    }
    for component in path.components() {
        if matches!(component, std::path::Component::ParentDir) {
            return Err(AuditError::InvalidAuditDir);
        }
    }
    Ok(())
}

#[cfg(unix)]
fn set_dir_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_dir_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn set_file_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_file_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

fn parse_audit_filename(name: &str) -> Option<String> {
    let date = name.strip_prefix("audit-")?.strip_suffix(".jsonl")?;
    if date.len() == 10 && date.as_bytes()[4] == b'-' && date.as_bytes()[7] == b'-' {
        Some(date.to_string())
    } else {
        None
    }
}

fn parse_audit_filename_owned(name: &str) -> Option<String> {
    parse_audit_filename(name)
}

/// Today's date as `YYYY-MM-DD`, UTC, without pulling in a chrono
/// dependency the rest of the codebase doesn't otherwise need.
fn today() -> String {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    civil_date_from_unix_days((secs / 86400) as i64)
}

fn chrono_like_date_sub_days(date: String, days: i64) -> String {
    let unix_days = unix_days_from_civil_date(&date);
    civil_date_from_unix_days(unix_days - days)
}

/// Days since the Unix epoch for a `YYYY-MM-DD` string, and the inverse.
/// Howard Hinnant's civil_from_days / days_from_civil algorithm (public
/// domain), used instead of a date-time crate for this one conversion.
fn unix_days_from_civil_date(date: &str) -> i64 {
    let y: i64 = date[0..4].parse().unwrap_or(1970);
    let m: i64 = date[5..7].parse().unwrap_or(1);
    let d: i64 = date[8..10].parse().unwrap_or(1);
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as i64;
    let mp = (m + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146097 + doe - 719468
}

pub(crate) fn civil_date_from_unix_days(z: i64) -> String {
    let z = z + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = z - era * 146097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    format!("{y:04}-{m:02}-{d:02}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AuditSeverity;

    fn make_event(id: &str, ts: &str) -> AuditEvent {
        AuditEvent {
            event_id: id.to_string(),
            timestamp: ts.to_string(),
            event_type: "tool.invoke".to_string(),
            severity: AuditSeverity::Info,
            session_id: None,
            client_id: None,
            user_id: None,
            source_ip_hash: None,
            tool_name: None,
            downstream_mcp: None,
            action: "invoke".to_string(),
            request_summary: None,
            response_summary: None,
            authz_decision: None,
            authz_policy: None,
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn audit_rotation_by_date() {
        let dir = tempfile::tempdir().unwrap();
        let writer = AuditWriter::new(dir.path().join("audit"), 90).unwrap();

        writer
            .emit(make_event("e1", "2026-02-16T10:00:00.000Z"))
            .await;
        writer
            .emit(make_event("e2", "2026-02-17T10:00:00.000Z"))
            .await;
        writer.flush().await.unwrap();

        let f1 = std::fs::read_to_string(dir.path().join("audit/audit-2026-02-16.jsonl")).unwrap();
        let f2 = std::fs::read_to_string(dir.path().join("audit/audit-2026-02-17.jsonl")).unwrap();
        assert!(f1.contains("\"e1\""));
        assert!(!f1.contains("\"e2\""));
        assert!(f2.contains("\"e2\""));
        assert!(!f2.contains("\"e1\""));
    }

    #[tokio::test]
    async fn query_filters_by_intra_day_time_window() {
        let dir = tempfile::tempdir().unwrap();
        let writer = AuditWriter::new(dir.path().join("audit"), 90).unwrap();

        writer
            .emit(make_event("morning", "2026-02-16T08:00:00.000Z"))
            .await;
        writer
            .emit(make_event("midday", "2026-02-16T12:00:00.000Z"))
            .await;
        writer
            .emit(make_event("evening", "2026-02-16T20:00:00.000Z"))
            .await;
        writer.flush().await.unwrap();

        let results = writer
            .query(AuditQuery {
                start_time: Some("2026-02-16T10:00:00.000Z".to_string()),
                end_time: Some("2026-02-16T15:00:00.000Z".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].event_id, "midday");
    }

    #[tokio::test]
    async fn auto_flush_at_100() {
        let dir = tempfile::tempdir().unwrap();
        let writer = AuditWriter::new(dir.path().join("audit"), 90).unwrap();

        for i in 0..100 {
            writer
                .emit(make_event(&format!("e{i}"), "2026-02-16T10:00:00.000Z"))
                .await;
        }

        let contents =
            std::fs::read_to_string(dir.path().join("audit/audit-2026-02-16.jsonl")).unwrap();
        assert_eq!(contents.lines().count(), 100);
    }

    #[test]
    fn civil_date_round_trip() {
        assert_eq!(unix_days_from_civil_date("1970-01-01"), 0);
        assert_eq!(civil_date_from_unix_days(0), "1970-01-01");
        let days = unix_days_from_civil_date("2026-02-16");
        assert_eq!(civil_date_from_unix_days(days), "2026-02-16");
    }

    #[test]
    fn retention_horizon_subtracts_days() {
        assert_eq!(
            chrono_like_date_sub_days("2026-02-16".to_string(), 90),
            "2025-11-18"
        );
    }
}
