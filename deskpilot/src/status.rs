use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

use crate::activity::ActivityEntry;

/// One recent action as shown by `indicator status`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ActivityRecord {
    pub label: String,
    /// RFC 3339 timestamp of when the daemon recorded the action.
    pub timestamp: String,
}

impl From<&ActivityEntry> for ActivityRecord {
    fn from(entry: &ActivityEntry) -> Self {
        Self {
            label: entry.label.clone(),
            timestamp: entry.timestamp.to_rfc3339(),
        }
    }
}

/// Runtime status written by the daemon to `deskpilot-indicator-status.toml`.
/// `indicator status` reads this file (read-only) to report on the daemon.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DaemonStatus {
    /// Daemon binary version (set from Cargo.toml at compile time).
    pub version: String,
    pub pid: u32,
    /// RFC 3339 timestamp of daemon startup.
    pub started_at: String,
    /// Most recent first.
    #[serde(default)]
    pub recent_activity: Vec<ActivityRecord>,
}

impl DaemonStatus {
    /// Constructs the initial status on daemon startup.
    pub fn new(pid: u32) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            pid,
            started_at: Local::now().to_rfc3339(),
            recent_activity: Vec::new(),
        }
    }

    pub fn set_activity(&mut self, entries: &[ActivityEntry]) {
        self.recent_activity = entries.iter().map(ActivityRecord::from).collect();
    }
}

/// Serializes `status` to TOML and writes it to `path` through a temporary
/// file, so readers never see a half-written report.
/// Logs errors rather than panicking; a status write failure should never
/// crash the daemon.
pub fn write_status(path: &Path, status: &DaemonStatus) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!("failed to create directory {}: {e}", parent.display());
            return;
        }
    }
    match toml::to_string_pretty(status) {
        Ok(content) => {
            let tmp = path.with_extension("toml.tmp");
            let result = std::fs::write(&tmp, content).and_then(|()| std::fs::rename(&tmp, path));
            if let Err(e) = result {
                let _ = std::fs::remove_file(&tmp);
                warn!("failed to write status file: {e}");
            }
        }
        Err(e) => warn!("failed to serialize status: {e}"),
    }
}

/// Reads the status report, if a daemon has written one and it parses.
pub fn read_status(path: &Path) -> Option<DaemonStatus> {
    let content = std::fs::read_to_string(path).ok()?;
    toml::from_str(&content).ok()
}

/// Age of an RFC 3339 timestamp relative to `now`, e.g. `"42s ago"`.
pub fn age_of(timestamp: &str, now: DateTime<Local>) -> Option<String> {
    let then = DateTime::parse_from_rfc3339(timestamp).ok()?;
    let secs = now.signed_duration_since(then).num_seconds().max(0);
    Some(format_age(secs as u64))
}

/// `"Ns ago"` under a minute, `"Nm ago"` under an hour, `"Nh ago"` otherwise.
pub fn format_age(secs: u64) -> String {
    if secs < 60 {
        format!("{secs}s ago")
    } else if secs < 3_600 {
        format!("{}m ago", secs / 60)
    } else {
        format!("{}h ago", secs / 3_600)
    }
}
