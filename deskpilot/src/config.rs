use anyhow::{Context, Result};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::event::DaemonEvent;

pub const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 1_500;
pub const DEFAULT_STARTUP_POLL_INTERVAL_MS: u64 = 50;
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_STOP_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_FLASH_DURATION_MS: u64 = 200;
pub const DEFAULT_PULSE_INTERVAL_MS: u64 = 900;
/// Anything faster than this would turn the ambient pulse into a busy loop.
pub const MIN_PULSE_INTERVAL_MS: u64 = 100;
pub const MIN_POLL_INTERVAL_MS: u64 = 10;

/// Root configuration structure. Deserialized from `config.toml`.
#[derive(Debug, Default, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub indicator: IndicatorConfig,
}

/// Settings for the indicator daemon and the clients that talk to it.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct IndicatorConfig {
    /// When false, no invocation ever spawns the daemon implicitly.
    #[serde(default = "default_autostart")]
    pub autostart: bool,
    /// Directory holding the socket and state markers. Defaults to `/tmp`.
    #[serde(default)]
    pub state_dir: Option<String>,
    /// How long an autostarting client waits for the daemon to come up.
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_ms: u64,
    #[serde(default = "default_startup_poll_interval")]
    pub startup_poll_interval_ms: u64,
    /// Client-side deadline for a single request/response exchange.
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,
    /// How long `indicator stop` waits before falling back to SIGTERM.
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_ms: u64,
    #[serde(default = "default_flash_duration")]
    pub flash_duration_ms: u64,
    #[serde(default = "default_pulse_interval")]
    pub pulse_interval_ms: u64,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            autostart: true,
            state_dir: None,
            startup_timeout_ms: DEFAULT_STARTUP_TIMEOUT_MS,
            startup_poll_interval_ms: DEFAULT_STARTUP_POLL_INTERVAL_MS,
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            stop_timeout_ms: DEFAULT_STOP_TIMEOUT_MS,
            flash_duration_ms: DEFAULT_FLASH_DURATION_MS,
            pulse_interval_ms: DEFAULT_PULSE_INTERVAL_MS,
        }
    }
}

impl IndicatorConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn startup_poll_interval(&self) -> Duration {
        Duration::from_millis(self.startup_poll_interval_ms.max(MIN_POLL_INTERVAL_MS))
    }

    /// A zero value disables the client deadline entirely.
    pub fn response_timeout(&self) -> Option<Duration> {
        match self.response_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn flash_duration(&self) -> Duration {
        Duration::from_millis(self.flash_duration_ms)
    }

    pub fn pulse_interval(&self) -> Duration {
        Duration::from_millis(self.pulse_interval_ms.max(MIN_PULSE_INTERVAL_MS))
    }
}

/// Loads the config file at `path`, returning `Config::default()` if the file does not exist.
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Loads the config, logging and falling back to defaults on a broken file.
/// Short-lived invocations must never fail because of a bad config.
pub fn load_or_warn(path: &Path) -> Config {
    load_or_default(path).unwrap_or_else(|e| {
        warn!("config error (using defaults): {e:#}");
        Config::default()
    })
}

/// Watches the parent directory of `path`. Whenever the config file is
/// created or modified, reloads it and sends a `ConfigReloaded` event.
pub async fn watch_config(path: PathBuf, tx: mpsc::UnboundedSender<DaemonEvent>) {
    let (watch_tx, mut watch_rx) = mpsc::channel::<notify::Event>(16);

    let mut watcher = match RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = watch_tx.blocking_send(event);
            }
        },
        NotifyConfig::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            warn!("failed to create config watcher: {e}");
            return;
        }
    };

    // Watch the parent directory rather than the file directly so we catch
    // editor-style atomic saves (write-new + rename).
    let watch_dir = match path.parent() {
        Some(d) if d.exists() => d.to_path_buf(),
        _ => {
            debug!("config directory missing; live reload disabled");
            return;
        }
    };

    if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
        warn!("failed to watch config directory: {e}");
        return;
    }

    while let Some(event) = watch_rx.recv().await {
        let affects_config = event.paths.iter().any(|p| p == path.as_path());
        let is_write = matches!(
            event.kind,
            notify::EventKind::Create(_) | notify::EventKind::Modify(_)
        );

        if affects_config && is_write {
            match load_or_default(&path) {
                Ok(config) => {
                    if tx.send(DaemonEvent::ConfigReloaded(config)).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("failed to reload config: {e:#}"),
            }
        }
    }
}

fn default_autostart() -> bool {
    true
}

fn default_startup_timeout() -> u64 {
    DEFAULT_STARTUP_TIMEOUT_MS
}

fn default_startup_poll_interval() -> u64 {
    DEFAULT_STARTUP_POLL_INTERVAL_MS
}

fn default_response_timeout() -> u64 {
    DEFAULT_RESPONSE_TIMEOUT_MS
}

fn default_stop_timeout() -> u64 {
    DEFAULT_STOP_TIMEOUT_MS
}

fn default_flash_duration() -> u64 {
    DEFAULT_FLASH_DURATION_MS
}

fn default_pulse_interval() -> u64 {
    DEFAULT_PULSE_INTERVAL_MS
}
