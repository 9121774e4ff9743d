//! The long-lived indicator service.
//!
//! Built once by `indicator start` and owned by it. Lifecycle:
//! binding → running → stopping. The accept loop runs on its own task; the
//! event loop in [`IndicatorService::run`] owns the overlay and the status
//! report, and is the only place either is touched.
//!
//! The instance lock alone does not make a daemon reachable: its socket file
//! can be deleted underneath it. The holder checks its socket periodically
//! and gives way when the file is gone, and a daemon that loses the lock
//! waits for an unreachable holder to do so before giving up.
use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::activity::ActivityLog;
use crate::config::{self, IndicatorConfig};
use crate::event::DaemonEvent;
use crate::listener::{BindOutcome, Dispatcher, IndicatorListener, InstanceLock};
use crate::overlay::{Overlay, Pulse};
use crate::paths::IndicatorPaths;
use crate::protocol::{Command, Response};
use crate::state::StateStore;
use crate::status::{self, DaemonStatus};

/// How often the running daemon checks that its socket and markers are intact.
const SOCKET_CHECK_INTERVAL: Duration = Duration::from_millis(500);
/// How long a daemon that lost the instance lock waits for a silent holder
/// to give way. Several socket checks fit in it.
const TAKEOVER_WINDOW: Duration = Duration::from_secs(3);
const TAKEOVER_RETRY_DELAY: Duration = Duration::from_millis(100);
const HOLDER_PING_DEADLINE: Duration = Duration::from_millis(500);

/// How a service run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceExit {
    /// Another daemon owns the state directory; nothing was written.
    AlreadyRunning,
    /// Served until asked to stop, then cleaned up.
    Stopped,
    /// Its socket file was removed or replaced; released the instance so a
    /// fresh daemon can bind.
    Displaced,
}

pub struct IndicatorService {
    store: StateStore,
    config: IndicatorConfig,
    config_path: Option<PathBuf>,
    overlay: Box<dyn Overlay>,
    activity: Arc<ActivityLog>,
    handle_signals: bool,
}

impl IndicatorService {
    pub fn new(paths: IndicatorPaths, config: IndicatorConfig, overlay: Box<dyn Overlay>) -> Self {
        Self {
            store: StateStore::new(paths),
            config,
            config_path: None,
            overlay,
            activity: Arc::new(ActivityLog::new()),
            handle_signals: false,
        }
    }

    /// Reload overlay timings whenever `path` changes.
    pub fn watch_config(mut self, path: PathBuf) -> Self {
        self.config_path = Some(path);
        self
    }

    /// Treat SIGINT / SIGTERM like a `stop` request.
    pub fn handle_signals(mut self) -> Self {
        self.handle_signals = true;
        self
    }

    #[cfg(test)]
    pub fn activity(&self) -> Arc<ActivityLog> {
        Arc::clone(&self.activity)
    }

    /// Binds, serves until stopped, then removes every trace of itself.
    ///
    /// A bind failure is returned before any state is written; losing the
    /// instance lock to another daemon is not an error.
    pub async fn run(mut self) -> Result<ServiceExit> {
        let Some((listener, lock)) = bind_or_take_over(&self.store).await? else {
            info!("another indicator already owns {}", self.store.paths().socket.display());
            return Ok(ServiceExit::AlreadyRunning);
        };
        let socket_identity = self.store.socket_identity();

        let pid = std::process::id();
        if let Err(e) = self.store.write_state(pid) {
            self.store.remove_all();
            return Err(e);
        }
        info!(
            "indicator v{} listening on {} (pid {pid})",
            env!("CARGO_PKG_VERSION"),
            self.store.paths().socket.display()
        );

        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<DaemonEvent>();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let accept_task = tokio::spawn(listener.serve(
            Dispatcher::new(Arc::clone(&self.activity), event_tx.clone()),
            shutdown_rx,
        ));

        let mut background: Vec<JoinHandle<()>> = Vec::new();
        if let Some(path) = self.config_path.clone() {
            background.push(tokio::spawn(config::watch_config(path, event_tx.clone())));
        }
        if self.handle_signals {
            background.push(tokio::spawn(forward_signals(event_tx.clone())));
        }

        let status_path = self.store.paths().status.clone();
        let mut current_status = DaemonStatus::new(pid);
        status::write_status(&status_path, &current_status);

        let mut pulse = Pulse::default();
        let mut ticker = pulse_ticker(&self.config);
        let mut socket_check = interval(SOCKET_CHECK_INTERVAL);
        socket_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let level = pulse.tick();
                    self.overlay.set_ambient_pulse(level);
                    trace!("emphasis {:.2}", self.overlay.emphasis());
                }
                _ = socket_check.tick() => {
                    if self.store.socket_identity() != socket_identity {
                        warn!(
                            "socket {} was removed or replaced; giving way",
                            self.store.paths().socket.display()
                        );
                        break ServiceExit::Displaced;
                    }
                    if self.store.read_pid() != Some(pid) || !self.store.is_active_marker_present() {
                        debug!("state markers missing; republishing pid {pid}");
                        if let Err(e) = self.store.write_state(pid) {
                            warn!("failed to republish state: {e:#}");
                        }
                    }
                }
                event = event_rx.recv() => match event {
                    Some(DaemonEvent::Flash) => {
                        self.overlay.flash(self.config.flash_duration());
                    }
                    Some(DaemonEvent::ActivityRecorded) => {
                        debug!(
                            "activity log holds {} of {}",
                            self.activity.len(),
                            self.activity.capacity()
                        );
                        current_status.set_activity(&self.activity.snapshot());
                        status::write_status(&status_path, &current_status);
                    }
                    Some(DaemonEvent::ConfigReloaded(new_config)) => {
                        info!("config reloaded");
                        let new_config = new_config.indicator;
                        if new_config.state_dir != self.config.state_dir {
                            warn!("state_dir changes take effect after a restart");
                        }
                        if new_config.pulse_interval() != self.config.pulse_interval() {
                            ticker = pulse_ticker(&new_config);
                        }
                        self.config = new_config;
                    }
                    Some(DaemonEvent::Shutdown) | None => {
                        info!("shutting down");
                        break ServiceExit::Stopped;
                    }
                },
            }
        };

        // ── Stopping ──────────────────────────────────────────────────────────
        let _ = shutdown_tx.send(true);
        if let Err(e) = accept_task.await {
            warn!("accept loop ended abnormally: {e}");
        }
        for task in background {
            task.abort();
        }

        if !self.activity.is_empty() {
            debug!("discarding {} recent actions", self.activity.len());
        }
        // Markers are only ever written by the lock holder; the socket path
        // may already belong to someone else.
        self.store.remove_markers();
        if self.store.socket_identity() == socket_identity {
            self.store.remove_socket();
        }
        if let Err(e) = std::fs::remove_file(&status_path) {
            debug!("status file not removed: {e}");
        }
        drop(lock);

        info!("indicator stopped");
        Ok(exit)
    }
}

/// Binds the listener, or waits for a lock holder that no longer answers on
/// the socket to give way. `None` means a reachable daemon already runs.
async fn bind_or_take_over(store: &StateStore) -> Result<Option<(IndicatorListener, InstanceLock)>> {
    let deadline = Instant::now() + TAKEOVER_WINDOW;
    loop {
        match IndicatorListener::bind(store)? {
            BindOutcome::Bound { listener, lock } => return Ok(Some((listener, lock))),
            BindOutcome::AlreadyRunning => {
                if holder_answers(&store.paths().socket).await {
                    return Ok(None);
                }
                if Instant::now() >= deadline {
                    warn!("instance lock held by a daemon that does not answer");
                    return Ok(None);
                }
                debug!("instance lock held but socket silent; waiting");
                sleep(TAKEOVER_RETRY_DELAY).await;
            }
        }
    }
}

async fn holder_answers(socket: &Path) -> bool {
    let exchange = async {
        let mut stream = UnixStream::connect(socket).await?;
        stream.write_all(Command::Ping.to_line().as_bytes()).await?;
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await?;
        Ok::<_, std::io::Error>(Response::parse(&String::from_utf8_lossy(&buf[..n])))
    };
    matches!(timeout(HOLDER_PING_DEADLINE, exchange).await, Ok(Ok(Response::Ok)))
}

fn pulse_ticker(config: &IndicatorConfig) -> Interval {
    let mut ticker = interval(config.pulse_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn forward_signals(tx: mpsc::UnboundedSender<DaemonEvent>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("failed to install SIGTERM handler: {e}");
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => debug!("received SIGINT"),
        _ = terminate.recv() => debug!("received SIGTERM"),
    }
    let _ = tx.send(DaemonEvent::Shutdown);
}
