//! Zero-effect process existence checks.
//!
//! [`SignalProbe`] sends signal 0, which distinguishes a live process we may
//! not signal (another user's, another session's) from one that is gone.
//! [`ProcessTableProbe`] scans the OS process table instead; it cannot tell
//! "not permitted" apart, but works wherever `sysinfo` does.
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Outcome of probing a pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// The process exists and we may signal it.
    Alive,
    /// The process exists but belongs to a context we cannot signal.
    NotPermitted,
    /// No such process.
    Dead,
}

impl Liveness {
    /// Both `Alive` and `NotPermitted` count as running.
    pub fn is_running(self) -> bool {
        !matches!(self, Liveness::Dead)
    }
}

pub trait ProcessProbe: Send + Sync {
    fn probe(&self, pid: u32) -> Liveness;
}

/// `kill(pid, 0)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalProbe;

impl ProcessProbe for SignalProbe {
    fn probe(&self, pid: u32) -> Liveness {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return Liveness::Dead;
        };
        if pid <= 0 {
            return Liveness::Dead;
        }

        // SAFETY: signal 0 performs only the existence and permission checks.
        let rc = unsafe { libc::kill(pid, 0) };
        if rc == 0 {
            return Liveness::Alive;
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::EPERM) => Liveness::NotPermitted,
            _ => Liveness::Dead,
        }
    }
}

/// Looks the pid up in the OS process table.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessTableProbe;

impl ProcessProbe for ProcessTableProbe {
    fn probe(&self, pid: u32) -> Liveness {
        let pid = Pid::from_u32(pid);
        let mut sys = System::new();
        sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::new(),
        );
        if sys.process(pid).is_some() {
            Liveness::Alive
        } else {
            Liveness::Dead
        }
    }
}

/// Delivers SIGTERM to `pid`. Returns true if the signal was sent.
pub fn terminate(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: plain kill(2) with a positive pid; never targets a process group.
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

/// Resource details about a running daemon, for `indicator status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessDetails {
    pub name: String,
    pub memory_bytes: u64,
    pub run_time_secs: u64,
}

pub fn details(pid: u32) -> Option<ProcessDetails> {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::new().with_memory(),
    );
    sys.process(pid).map(|p| ProcessDetails {
        name: p.name().to_string_lossy().into_owned(),
        memory_bytes: p.memory(),
        run_time_secs: p.run_time(),
    })
}
