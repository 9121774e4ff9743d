//! Canonical file paths for the indicator daemon and its configuration.
//!
//! Runtime files live in a shared state directory (default `/tmp`):
//!   - deskpilot-indicator.sock          Unix socket the daemon listens on.
//!   - deskpilot-indicator.pid           Daemon pid, written after bind.
//!   - deskpilot-indicator-active        Zero-byte "daemon is up" marker.
//!   - deskpilot-indicator.lock          Instance lock held for the daemon's lifetime.
//!   - deskpilot-indicator-status.toml   Written by the daemon, read by `indicator status`.
//!   - deskpilot-indicator.log           Daemon stderr when autostarted.
use std::path::{Path, PathBuf};

pub const DEFAULT_STATE_DIR: &str = "/tmp";
pub const SOCKET_FILE_NAME: &str = "deskpilot-indicator.sock";
pub const PID_FILE_NAME: &str = "deskpilot-indicator.pid";
pub const ACTIVE_FILE_NAME: &str = "deskpilot-indicator-active";
pub const LOCK_FILE_NAME: &str = "deskpilot-indicator.lock";
pub const STATUS_FILE_NAME: &str = "deskpilot-indicator-status.toml";
pub const LOG_FILE_NAME: &str = "deskpilot-indicator.log";

const CONFIG_ENV: &str = "DESKPILOT_CONFIG";
const APP_DIR_NAME: &str = "deskpilot";
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// The full set of well-known paths for one state directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndicatorPaths {
    pub socket: PathBuf,
    pub pid: PathBuf,
    pub active: PathBuf,
    pub lock: PathBuf,
    pub status: PathBuf,
    pub log: PathBuf,
}

impl IndicatorPaths {
    /// Builds every path under `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            socket: dir.join(SOCKET_FILE_NAME),
            pid: dir.join(PID_FILE_NAME),
            active: dir.join(ACTIVE_FILE_NAME),
            lock: dir.join(LOCK_FILE_NAME),
            status: dir.join(STATUS_FILE_NAME),
            log: dir.join(LOG_FILE_NAME),
        }
    }

    /// Uses `state_dir` from the config when set, otherwise `/tmp`.
    pub fn from_state_dir(state_dir: Option<&str>) -> Self {
        match state_dir {
            Some(dir) if !dir.trim().is_empty() => Self::in_dir(dir),
            _ => Self::in_dir(DEFAULT_STATE_DIR),
        }
    }
}

/// Returns the config file path: `$DESKPILOT_CONFIG`, or
/// `$HOME/.config/deskpilot/config.toml`.
pub fn config_file_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    config_dir().join(CONFIG_FILE_NAME)
}

fn config_dir() -> PathBuf {
    std::env::var("HOME")
        .map(|home| PathBuf::from(home).join(".config").join(APP_DIR_NAME))
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_STATE_DIR).join(APP_DIR_NAME))
}
