//! Append-only security audit log
//!
//! Events are serialized to one JSON line each and buffered in memory;
//! the buffer is flushed when it reaches 100 entries, when the 1 second
//! background task fires, and on shutdown. Before each flush the current
//! file is rotated once it reaches 50 MB, and rotated files beyond the
//! retention count are pruned. All I/O is best-effort: the auth flow must
//! never fail because the audit disk is unhappy, so write errors are
//! logged on the diagnostic channel and swallowed.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::warn;

/// Flush once the buffer holds this many entries.
const FLUSH_THRESHOLD: usize = 100;

/// Periodic flush interval.
const FLUSH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// Rotate the live file at this size.
const ROTATE_BYTES: u64 = 50 * 1024 * 1024;

/// Default number of rotated files kept on disk.
pub const DEFAULT_RETENTION: usize = 10;

/// One audit line as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// ISO-8601 UTC timestamp
    pub ts: String,
    /// Dotted event identifier, e.g. `auth.login.failed`
    pub event: String,
    /// Username or `anonymous`
    pub actor: String,
    pub ip: String,
    #[serde(default)]
    pub details: serde_json::Value,
}

/// Handle to the audit log. A disabled handle (before `init`) accepts and
/// discards events.
#[derive(Clone, Default)]
pub struct AuditLog {
    inner: Option<Arc<AuditInner>>,
}

struct AuditInner {
    log_dir: PathBuf,
    retention: usize,
    buffer: Mutex<Vec<String>>,
    stopped: AtomicBool,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

/// Path of the live audit file under a state directory.
pub fn audit_log_path(state_dir: &Path) -> PathBuf {
    state_dir.join("logs").join("audit.jsonl")
}

impl AuditLog {
    /// A handle that drops everything; used before the gateway is built
    /// and in tests that do not care about auditing.
    pub fn disabled() -> Self {
        AuditLog { inner: None }
    }

    /// Initialise the log under `<state>/logs/` and start the periodic
    /// flush task. Must be called from within a tokio runtime.
    pub fn init(state_dir: &Path, retention: usize) -> Self {
        let inner = Arc::new(AuditInner {
            log_dir: state_dir.join("logs"),
            retention,
            buffer: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            flusher: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(inner) if !inner.stopped.load(Ordering::Relaxed) => inner.flush(),
                    _ => break,
                }
            }
        });
        if let Ok(mut slot) = inner.flusher.lock() {
            *slot = Some(handle);
        }

        AuditLog { inner: Some(inner) }
    }

    /// Enqueue an event. No-op before `init` and after `shutdown`.
    pub fn append(&self, event: &str, actor: &str, ip: &str, details: serde_json::Value) {
        let inner = match &self.inner {
            Some(inner) if !inner.stopped.load(Ordering::Relaxed) => inner,
            _ => return,
        };

        let record = AuditEvent {
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            event: event.to_string(),
            actor: actor.to_string(),
            ip: ip.to_string(),
            details,
        };
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(err) => {
                warn!(target: "audit", %err, "failed to serialize audit event");
                return;
            }
        };

        let should_flush = {
            let mut buffer = match inner.buffer.lock() {
                Ok(buffer) => buffer,
                Err(_) => return,
            };
            buffer.push(line);
            buffer.len() >= FLUSH_THRESHOLD
        };
        if should_flush {
            inner.flush();
        }
    }

    /// Flush buffered events to disk immediately.
    pub fn flush(&self) {
        if let Some(inner) = &self.inner {
            inner.flush();
        }
    }

    /// Stop the periodic task and flush whatever is still buffered.
    pub fn shutdown(&self) {
        let inner = match &self.inner {
            Some(inner) => inner,
            None => return,
        };
        inner.stopped.store(true, Ordering::Relaxed);
        if let Ok(mut slot) = inner.flusher.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
        inner.flush();
    }
}

impl AuditInner {
    fn flush(&self) {
        let lines: Vec<String> = {
            let mut buffer = match self.buffer.lock() {
                Ok(buffer) => buffer,
                Err(_) => return,
            };
            if buffer.is_empty() {
                return;
            }
            std::mem::take(&mut *buffer)
        };

        if let Err(err) = self.write_lines(&lines) {
            warn!(target: "audit", %err, "audit flush failed; {} events dropped", lines.len());
        }
    }

    fn write_lines(&self, lines: &[String]) -> std::io::Result<()> {
        fs::create_dir_all(&self.log_dir)?;
        let log_path = self.log_dir.join("audit.jsonl");

        self.rotate_if_needed(&log_path)?;

        let created = !log_path.exists();
        let mut file = OpenOptions::new().create(true).append(true).open(&log_path)?;
        if created {
            restrict_permissions(&log_path)?;
        }
        let mut payload = String::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
        for line in lines {
            payload.push_str(line);
            payload.push('\n');
        }
        file.write_all(payload.as_bytes())?;
        Ok(())
    }

    fn rotate_if_needed(&self, log_path: &Path) -> std::io::Result<()> {
        let size = match fs::metadata(log_path) {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(()),
        };
        if size < ROTATE_BYTES {
            return Ok(());
        }

        let stamp = Utc::now()
            .to_rfc3339_opts(SecondsFormat::Millis, true)
            .replace([':', '.'], "-");
        let rotated = self.log_dir.join(format!("audit-{stamp}.jsonl"));
        fs::rename(log_path, rotated)?;
        self.prune_rotated();
        Ok(())
    }

    fn prune_rotated(&self) {
        let mut rotated: Vec<PathBuf> = match fs::read_dir(&self.log_dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| n.starts_with("audit-") && n.ends_with(".jsonl"))
                        .unwrap_or(false)
                })
                .collect(),
            Err(_) => return,
        };
        if rotated.len() <= self.retention {
            return;
        }
        // Timestamped names sort chronologically
        rotated.sort();
        let excess = rotated.len() - self.retention;
        for path in rotated.into_iter().take(excess) {
            if let Err(err) = fs::remove_file(&path) {
                warn!(target: "audit", %err, path = %path.display(), "failed to prune rotated audit file");
            }
        }
    }
}

/// Last `n` lines of the live audit file, oldest first.
pub fn tail_lines(state_dir: &Path, n: usize) -> std::io::Result<Vec<String>> {
    let contents = match fs::read_to_string(audit_log_path(state_dir)) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    let lines: Vec<&str> = contents.lines().collect();
    let start = lines.len().saturating_sub(n);
    Ok(lines[start..].iter().map(|s| s.to_string()).collect())
}

/// Search the live and rotated audit files.
///
/// `event_prefix` and `actor` match by prefix / equality; `since` filters
/// on the event timestamp. Results come back in file order, rotated files
/// first.
pub fn search(
    state_dir: &Path,
    event_prefix: Option<&str>,
    actor: Option<&str>,
    since: Option<DateTime<Utc>>,
) -> std::io::Result<Vec<AuditEvent>> {
    let log_dir = state_dir.join("logs");
    let mut files: Vec<PathBuf> = match fs::read_dir(&log_dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("audit-") && n.ends_with(".jsonl"))
                    .unwrap_or(false)
            })
            .collect(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    files.sort();
    files.push(log_dir.join("audit.jsonl"));

    let mut results = Vec::new();
    for path in files {
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(_) => continue,
        };
        for line in contents.lines() {
            let event: AuditEvent = match serde_json::from_str(line) {
                Ok(event) => event,
                Err(_) => continue,
            };
            if let Some(prefix) = event_prefix {
                if !event.event.starts_with(prefix) {
                    continue;
                }
            }
            if let Some(actor_filter) = actor {
                if event.actor != actor_filter {
                    continue;
                }
            }
            if let Some(cutoff) = since {
                match DateTime::parse_from_rfc3339(&event.ts) {
                    Ok(ts) if ts.with_timezone(&Utc) >= cutoff => {}
                    _ => continue,
                }
            }
            results.push(event);
        }
    }
    Ok(results)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
