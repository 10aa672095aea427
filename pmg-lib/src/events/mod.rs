use std::{
    fs,
    io::Write as _,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use parking_lot::Mutex;
use rama::telemetry::tracing;
use serde::{Deserialize, Serialize};

use crate::package::PackageVersion;

/// Forensic event kinds written to the append-only log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    InstallStarted,
    InstallAllowed,
    MalwareBlocked,
    MalwareConfirmed,
    InstallTrustedAllowed,
    ProxyHostObserved,
    Error,
}

/// One structured event record, serialized as a single JSON line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: String,
    pub event_type: EventType,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ecosystem: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl Event {
    pub fn new(event_type: EventType, message: impl Into<String>) -> Self {
        Self {
            timestamp: humantime::format_rfc3339_seconds(SystemTime::now()).to_string(),
            event_type,
            message: message.into(),
            package_name: None,
            version: None,
            ecosystem: None,
            details: None,
        }
    }

    pub fn for_package(
        event_type: EventType,
        message: impl Into<String>,
        pkg: &PackageVersion,
    ) -> Self {
        let mut event = Self::new(event_type, message);
        event.package_name = Some(pkg.name().to_owned());
        if pkg.is_resolved() {
            event.version = Some(pkg.version().to_owned());
        }
        event.ecosystem = Some(pkg.ecosystem().to_string());
        event
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Handle to the append-only JSONL event log.
///
/// Cheaply cloneable; the disabled variant discards every record. Write
/// failures are logged and never surface to the caller, a broken event log
/// must not block an installation.
#[derive(Clone)]
pub struct EventLog {
    inner: Option<Arc<EventLogInner>>,
}

struct EventLogInner {
    dir: PathBuf,
    retention_days: u32,
    state: Mutex<WriterState>,
}

struct WriterState {
    day: String,
    file: fs::File,
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("enabled", &self.inner.is_some())
            .finish()
    }
}

const LOG_FILE_PREFIX: &str = "events-";
const LOG_FILE_SUFFIX: &str = ".jsonl";

fn current_day() -> String {
    day_for(SystemTime::now())
}

fn day_for(ts: SystemTime) -> String {
    // RFC 3339 starts with the date: YYYY-MM-DD
    humantime::format_rfc3339_seconds(ts).to_string()[..10].to_owned()
}

fn log_file_path(dir: &Path, day: &str) -> PathBuf {
    dir.join(format!("{LOG_FILE_PREFIX}{day}{LOG_FILE_SUFFIX}"))
}

fn open_log_file(dir: &Path, day: &str) -> std::io::Result<fs::File> {
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file_path(dir, day))
}

impl EventLog {
    /// Open (or create) the event log under `dir`.
    ///
    /// Files rotate by day; files older than `retention_days` are removed on
    /// rotation. `retention_days == 0` disables the cleanup.
    pub fn new(dir: impl Into<PathBuf>, retention_days: u32) -> std::io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let day = current_day();
        let file = open_log_file(&dir, &day)?;

        Ok(Self {
            inner: Some(Arc::new(EventLogInner {
                dir,
                retention_days,
                state: Mutex::new(WriterState { day, file }),
            })),
        })
    }

    /// An event log that discards everything (`skip_event_logging`).
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Append a record; flushed before the lock is released.
    pub fn record(&self, event: Event) {
        let Some(inner) = &self.inner else {
            return;
        };
        if let Err(err) = inner.write(&event) {
            tracing::warn!("failed to write event log record: {err}");
        }
    }
}

impl EventLogInner {
    fn write(&self, event: &Event) -> std::io::Result<()> {
        let line = serde_json::to_string(event)?;

        let mut state = self.state.lock();

        let day = current_day();
        if day != state.day {
            state.file = open_log_file(&self.dir, &day)?;
            state.day = day;
            self.cleanup_expired();
        }

        state.file.write_all(line.as_bytes())?;
        state.file.write_all(b"\n")?;
        state.file.flush()
    }

    fn cleanup_expired(&self) {
        if self.retention_days == 0 {
            return;
        }
        let cutoff_day = day_for(
            SystemTime::now() - Duration::from_secs(u64::from(self.retention_days) * 86_400),
        );

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::debug!("failed to list event log directory: {err}");
                return;
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(day) = name
                .strip_prefix(LOG_FILE_PREFIX)
                .and_then(|rest| rest.strip_suffix(LOG_FILE_SUFFIX))
            else {
                continue;
            };
            // day strings compare lexicographically
            if day < cutoff_day.as_str()
                && let Err(err) = fs::remove_file(entry.path())
            {
                tracing::debug!("failed to remove expired event log file {name}: {err}");
            }
        }
    }
}
