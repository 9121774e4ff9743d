//! On-disk facts that describe a running daemon: the pid marker, the active
//! marker and the socket file. No single file is authoritative; the client
//! combines them with a process probe to decide liveness.
use anyhow::{Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use tracing::debug;

use crate::paths::IndicatorPaths;

/// Device and inode of a socket file. Tells the file a daemon bound apart
/// from one that replaced it at the same path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketIdentity {
    dev: u64,
    ino: u64,
}

#[derive(Debug, Clone)]
pub struct StateStore {
    paths: IndicatorPaths,
}

impl StateStore {
    pub fn new(paths: IndicatorPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &IndicatorPaths {
        &self.paths
    }

    /// Records `pid` as the running daemon and marks it active.
    ///
    /// The pid goes through a temporary file and a rename, so a concurrent
    /// reader sees either no pid file or a complete one.
    pub fn write_state(&self, pid: u32) -> Result<()> {
        if let Some(parent) = self.paths.pid.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create state directory {}", parent.display()))?;
        }

        let tmp = self.paths.pid.with_extension(format!("pid.{pid}.tmp"));
        fs::write(&tmp, pid.to_string())
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        if let Err(e) = fs::rename(&tmp, &self.paths.pid) {
            let _ = fs::remove_file(&tmp);
            return Err(e).with_context(|| format!("Failed to publish {}", self.paths.pid.display()));
        }

        self.mark_active()
    }

    /// Reads the recorded pid. Missing, unreadable, non-numeric and
    /// non-positive contents all yield `None`.
    pub fn read_pid(&self) -> Option<u32> {
        let raw = fs::read_to_string(&self.paths.pid).ok()?;
        match raw.trim().parse::<i64>() {
            Ok(pid) if pid > 0 && pid <= i64::from(i32::MAX) => Some(pid as u32),
            _ => None,
        }
    }

    pub fn mark_active(&self) -> Result<()> {
        fs::write(&self.paths.active, b"")
            .with_context(|| format!("Failed to create {}", self.paths.active.display()))
    }

    pub fn is_active_marker_present(&self) -> bool {
        self.paths.active.exists()
    }

    pub fn socket_exists(&self) -> bool {
        self.paths.socket.exists()
    }

    pub fn socket_identity(&self) -> Option<SocketIdentity> {
        let meta = fs::symlink_metadata(&self.paths.socket).ok()?;
        Some(SocketIdentity {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }

    pub fn remove_socket(&self) {
        remove_if_present(&self.paths.socket);
    }

    /// Removes the pid and active markers. Missing files are not an error.
    pub fn remove_markers(&self) {
        remove_if_present(&self.paths.pid);
        remove_if_present(&self.paths.active);
    }

    /// Removes the markers and the socket file. Idempotent.
    pub fn remove_all(&self) {
        self.remove_markers();
        self.remove_socket();
    }
}

fn remove_if_present(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("removed {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => debug!("failed to remove {}: {e}", path.display()),
    }
}
