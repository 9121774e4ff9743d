//! The daemon's socket server.
//!
//! One request per connection: read a line, dispatch it, write one response
//! line, close. Connections are handled inline on the accept task because
//! requests are a few dozen bytes; anything that touches overlay state is
//! handed to the event loop without waiting on it.
use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::activity::ActivityLog;
use crate::event::DaemonEvent;
use crate::protocol::{Command, Response};
use crate::state::StateStore;

const REQUEST_BUFFER_SIZE: usize = 256;
/// A client that connects but never writes must not wedge the accept loop.
const REQUEST_READ_DEADLINE: Duration = Duration::from_millis(500);
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Exclusive advisory lock on the instance lock file. Released on drop.
pub struct InstanceLock {
    _file: File,
}

impl InstanceLock {
    /// Returns `Ok(None)` when another process already holds the lock.
    pub fn acquire(path: &Path) -> Result<Option<Self>> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;

        // SAFETY: the descriptor is owned by `file` and outlives the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(Some(Self { _file: file }));
        }

        let err = std::io::Error::last_os_error();
        if err.kind() == ErrorKind::WouldBlock {
            Ok(None)
        } else {
            Err(err).with_context(|| format!("Failed to lock {}", path.display()))
        }
    }
}

pub enum BindOutcome {
    Bound {
        listener: IndicatorListener,
        lock: InstanceLock,
    },
    /// Another daemon owns this state directory.
    AlreadyRunning,
}

pub struct IndicatorListener {
    listener: UnixListener,
}

impl IndicatorListener {
    /// Takes the instance lock, clears leftovers from a crashed instance and
    /// binds the socket. Must be called from within a tokio runtime.
    ///
    /// Writes no state; on any failure nothing is left behind for clients to
    /// mistake for a running daemon.
    pub fn bind(store: &StateStore) -> Result<BindOutcome> {
        let paths = store.paths();
        let Some(lock) = InstanceLock::acquire(&paths.lock)? else {
            return Ok(BindOutcome::AlreadyRunning);
        };

        store.remove_markers();
        match std::fs::remove_file(&paths.socket) {
            Ok(()) => debug!("removed stale socket {}", paths.socket.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to remove stale socket {}", paths.socket.display())
                })
            }
        }

        let std_listener = std::os::unix::net::UnixListener::bind(&paths.socket)
            .with_context(|| format!("Failed to bind {}", paths.socket.display()))?;
        std_listener
            .set_nonblocking(true)
            .context("Failed to make listener non-blocking")?;
        let listener =
            UnixListener::from_std(std_listener).context("Failed to register listener")?;

        Ok(BindOutcome::Bound {
            listener: IndicatorListener { listener },
            lock,
        })
    }

    /// Accept loop. Runs until `shutdown` flips to true (or its sender drops);
    /// the listening socket closes when this returns.
    pub async fn serve(self, dispatcher: Dispatcher, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => handle_connection(stream, &dispatcher).await,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
            }
        }
        debug!("accept loop stopped");
    }
}

async fn handle_connection(mut stream: UnixStream, dispatcher: &Dispatcher) {
    let response = match timeout(REQUEST_READ_DEADLINE, read_request(&mut stream)).await {
        Ok(Ok(Some(line))) => dispatcher.dispatch(&line),
        Ok(Ok(None)) => Response::Error,
        Ok(Err(e)) => {
            debug!("failed to read request: {e}");
            Response::Error
        }
        Err(_) => {
            debug!("client sent no request within {REQUEST_READ_DEADLINE:?}");
            Response::Error
        }
    };

    if let Err(e) = stream.write_all(response.to_line().as_bytes()).await {
        debug!("failed to write response: {e}");
    }
    let _ = stream.shutdown().await;
}

/// Reads until the first newline, EOF or a full buffer; returns the first
/// line, or `None` if the client sent nothing.
async fn read_request(stream: &mut UnixStream) -> std::io::Result<Option<String>> {
    let mut buf = [0u8; REQUEST_BUFFER_SIZE];
    let mut len = 0;
    while len < buf.len() {
        let n = stream.read(&mut buf[len..]).await?;
        if n == 0 {
            break;
        }
        len += n;
        if buf[..len].contains(&b'\n') {
            break;
        }
    }
    if len == 0 {
        return Ok(None);
    }
    let text = String::from_utf8_lossy(&buf[..len]);
    Ok(text.lines().next().map(str::to_string))
}

/// Maps requests to responses and side effects.
pub struct Dispatcher {
    activity: Arc<ActivityLog>,
    events: mpsc::UnboundedSender<DaemonEvent>,
}

impl Dispatcher {
    pub fn new(activity: Arc<ActivityLog>, events: mpsc::UnboundedSender<DaemonEvent>) -> Self {
        Self { activity, events }
    }

    pub fn dispatch(&self, line: &str) -> Response {
        match Command::parse(line) {
            Some(Command::Flash) => {
                self.hand_off(DaemonEvent::Flash);
                Response::Ok
            }
            Some(Command::Stop) => {
                self.hand_off(DaemonEvent::Shutdown);
                Response::Ok
            }
            Some(Command::Ping) => Response::Ok,
            Some(Command::Activity(label)) => {
                if !label.is_empty() {
                    debug!("activity: {label}");
                    self.activity.record(label);
                    self.hand_off(DaemonEvent::ActivityRecorded);
                }
                Response::Ok
            }
            None => {
                debug!("unrecognised request {line:?}");
                Response::Error
            }
        }
    }

    fn hand_off(&self, event: DaemonEvent) {
        if self.events.send(event).is_err() {
            debug!("event loop gone; dropping event");
        }
    }
}
