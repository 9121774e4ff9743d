use crate::config::Config;

/// Work handed to the daemon's event loop, the only context that touches
/// overlay state.
#[derive(Debug)]
pub enum DaemonEvent {
    /// A client asked for a one-shot pulse.
    Flash,
    /// A new entry landed in the activity log; refresh the status report.
    ActivityRecorded,
    /// The config file changed on disk and was successfully re-parsed.
    ConfigReloaded(Config),
    /// `stop` command, SIGINT or SIGTERM: tear down and exit.
    Shutdown,
}
