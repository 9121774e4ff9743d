//! Client side of the indicator control plane, used by every short-lived
//! invocation: liveness checks, one-shot request/response and the
//! "flash for this action" convenience call.
use anyhow::{bail, Context, Result};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::autostart::AutoStarter;
use crate::config::IndicatorConfig;
use crate::paths::IndicatorPaths;
use crate::process::{self, Liveness, ProcessProbe, SignalProbe};
use crate::protocol::{Command, Response};
use crate::state::StateStore;

const RESPONSE_BUFFER_SIZE: usize = 64;
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Number of leading non-flag arguments that make up an activity label.
const ACTIVITY_LABEL_TOKENS: usize = 3;

/// Result of [`IndicatorClient::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    Stopped,
    Failed,
}

pub struct IndicatorClient {
    store: StateStore,
    probe: Box<dyn ProcessProbe>,
    /// `None` means a read blocks until the daemon answers or hangs up.
    response_timeout: Option<Duration>,
}

impl IndicatorClient {
    pub fn new(paths: IndicatorPaths, config: &IndicatorConfig) -> Self {
        Self::with_probe(paths, Box::new(SignalProbe), config.response_timeout())
    }

    pub fn with_probe(
        paths: IndicatorPaths,
        probe: Box<dyn ProcessProbe>,
        response_timeout: Option<Duration>,
    ) -> Self {
        Self {
            store: StateStore::new(paths),
            probe,
            response_timeout,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn running_pid(&self) -> Option<u32> {
        self.store.read_pid()
    }

    /// Decides whether a daemon is up without talking to it.
    ///
    /// With no pid recorded, the active marker answers (it covers the window
    /// between a daemon starting and publishing its pid). A recorded pid that
    /// is verifiably dead is stale and gets cleaned up, see [`Self::clear_stale`].
    pub fn is_running(&self) -> bool {
        let Some(pid) = self.store.read_pid() else {
            return self.store.is_active_marker_present();
        };

        match self.probe.probe(pid) {
            Liveness::Alive => true,
            Liveness::NotPermitted => {
                debug!("indicator pid {pid} exists but cannot be signalled");
                true
            }
            Liveness::Dead => self.clear_stale(pid),
        }
    }

    /// Removes state left by the dead daemon `pid`. Returns true if a newer
    /// daemon turns out to own the state directory.
    ///
    /// A daemon may have bound and published itself during the liveness check, so
    /// the markers only go if they still name `pid`, and the socket only goes
    /// if nothing accepts connections on it.
    fn clear_stale(&self, pid: u32) -> bool {
        if let Some(current) = self.store.read_pid() {
            if current != pid {
                debug!("indicator pid changed from {pid} to {current} during the liveness check");
                return true;
            }
        }

        debug!("indicator pid {pid} is gone; clearing stale state");
        self.store.remove_markers();
        if UnixStream::connect(&self.store.paths().socket).is_ok() {
            debug!("socket still accepts connections; leaving it in place");
        } else {
            self.store.remove_socket();
        }
        false
    }

    /// Sends one command and reports whether the daemon answered `ok`.
    /// Every failure (no socket, refused, timeout, `error`) reads as false.
    pub fn send(&self, command: &Command) -> bool {
        match self.exchange(command) {
            Ok(Response::Ok) => true,
            Ok(Response::Error) => {
                debug!("indicator rejected {command}");
                false
            }
            Err(e) => {
                debug!("indicator unreachable: {e:#}");
                false
            }
        }
    }

    fn exchange(&self, command: &Command) -> Result<Response> {
        let socket = &self.store.paths().socket;
        if !self.store.socket_exists() {
            bail!("socket {} does not exist", socket.display());
        }

        // The stream is closed when it drops, on every return path.
        let mut stream = UnixStream::connect(socket)
            .with_context(|| format!("connect to {}", socket.display()))?;
        stream.set_read_timeout(self.response_timeout)?;
        stream.set_write_timeout(self.response_timeout)?;

        stream
            .write_all(command.to_line().as_bytes())
            .context("write request")?;

        let mut buf = [0u8; RESPONSE_BUFFER_SIZE];
        let n = stream.read(&mut buf).context("read response")?;
        if n == 0 {
            bail!("daemon closed the connection without answering");
        }
        Ok(Response::parse(&String::from_utf8_lossy(&buf[..n])))
    }

    /// Records the invoking command as activity. A label-less argument list
    /// is a silent no-op.
    pub fn send_activity(&self, args: &[String]) -> bool {
        match activity_label(args) {
            Some(label) => self.send(&Command::Activity(label)),
            None => false,
        }
    }

    /// Visual feedback for a completed action: autostarts the daemon when
    /// policy allows, then flashes and records the action.
    ///
    /// Returns whether the flash was delivered, so the caller can fall back
    /// to a standalone render. Never fails the invocation.
    pub fn flash_for_action(&self, starter: &AutoStarter, args: &[String]) -> bool {
        starter.ensure_running_if_needed(self, args);
        if !self.is_running() {
            return false;
        }
        let flashed = self.send(&Command::Flash);
        self.send_activity(args);
        flashed
    }

    /// Asks the daemon to stop and waits up to `timeout` for it to go away,
    /// then falls back to SIGTERM and waits up to `timeout` again for the
    /// process to exit. State files are only cleaned up once it has.
    pub fn stop(&self, timeout: Duration) -> StopOutcome {
        if !self.is_running() {
            return StopOutcome::NotRunning;
        }

        let acknowledged = self.send(&Command::Stop);
        let deadline = Instant::now() + timeout;
        while self.is_running() && Instant::now() < deadline {
            std::thread::sleep(STOP_POLL_INTERVAL);
        }

        let mut stopped = !self.is_running();
        if !stopped {
            if let Some(pid) = self.running_pid() {
                debug!("indicator did not exit (acknowledged: {acknowledged}); sending SIGTERM to {pid}");
                stopped = process::terminate(pid) && self.wait_for_exit(pid, timeout);
            }
        }

        if stopped {
            self.store.remove_all();
            StopOutcome::Stopped
        } else {
            StopOutcome::Failed
        }
    }

    fn wait_for_exit(&self, pid: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.probe.probe(pid) == Liveness::Dead {
                return true;
            }
            if Instant::now() >= deadline {
                debug!("indicator pid {pid} survived SIGTERM");
                return false;
            }
            std::thread::sleep(STOP_POLL_INTERVAL);
        }
    }
}

/// First few non-flag arguments joined by spaces, e.g. `["app", "open",
/// "Safari", "--json"]` becomes `"app open Safari"`.
pub fn activity_label(args: &[String]) -> Option<String> {
    let label = args
        .iter()
        .filter(|a| !a.starts_with('-'))
        .take(ACTIVITY_LABEL_TOKENS)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(" ");
    if label.trim().is_empty() {
        None
    } else {
        Some(label)
    }
}
