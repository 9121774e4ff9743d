//! Starts the indicator daemon on demand.
//!
//! Any ordinary invocation may spawn the daemon if none is running. Two
//! invocations racing here may both spawn; the losing daemon fails to take
//! the instance lock, waits until the winner answers a ping, and exits
//! quietly, so callers never see the race.
use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::client::IndicatorClient;
use crate::config::IndicatorConfig;
use crate::paths::IndicatorPaths;

/// Set to a truthy value to stop this process (and its children) from
/// autostarting the daemon. The daemon sets it on itself.
pub const SKIP_AUTOSTART_ENV: &str = "DESKPILOT_SKIP_INDICATOR_AUTOSTART";
/// The daemon's own control subcommand; never triggers autostart.
pub const INDICATOR_SUBCOMMAND: &str = "indicator";
pub const START_ARGS: [&str; 2] = [INDICATOR_SUBCOMMAND, "start"];

/// What [`AutoStarter::ensure_running_if_needed`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoStart {
    /// Policy says this invocation must not start the daemon.
    Skipped,
    AlreadyRunning,
    /// A daemon was launched and came up before the deadline.
    Started,
    /// A daemon was launched but did not come up in time.
    TimedOut,
    /// No daemon could be launched (executable not found, spawn failed).
    Unavailable,
}

/// Launches a daemon process. Swappable so tests can stand in a fake.
pub trait Launcher: Send + Sync {
    fn launch(&self) -> Result<()>;
}

/// Re-executes the running binary as `indicator start`, detached.
pub struct ProcessLauncher {
    log_path: PathBuf,
}

impl ProcessLauncher {
    pub fn new(paths: &IndicatorPaths) -> Self {
        Self {
            log_path: paths.log.clone(),
        }
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self) -> Result<()> {
        let exe = resolve_executable().context("cannot locate the running executable")?;
        spawn_detached(&exe, &self.log_path)
    }
}

pub struct AutoStarter {
    enabled: bool,
    /// Value of [`SKIP_AUTOSTART_ENV`] as seen by this process.
    skip_env: Option<String>,
    startup_timeout: Duration,
    poll_interval: Duration,
    launcher: Box<dyn Launcher>,
}

impl AutoStarter {
    /// Launches this executable and honours [`SKIP_AUTOSTART_ENV`] from the
    /// process environment.
    pub fn new(config: &IndicatorConfig, paths: &IndicatorPaths) -> Self {
        Self::with_launcher(config, Box::new(ProcessLauncher::new(paths)))
            .skip_env(std::env::var(SKIP_AUTOSTART_ENV).ok())
    }

    /// Uses `launcher` and ignores the process environment until
    /// [`Self::skip_env`] says otherwise.
    pub fn with_launcher(config: &IndicatorConfig, launcher: Box<dyn Launcher>) -> Self {
        Self {
            enabled: config.autostart,
            skip_env: None,
            startup_timeout: config.startup_timeout(),
            poll_interval: config.startup_poll_interval(),
            launcher,
        }
    }

    pub fn skip_env(mut self, value: Option<String>) -> Self {
        self.skip_env = value;
        self
    }

    pub fn should_auto_start(&self, args: &[String]) -> bool {
        self.enabled && should_auto_start(args, self.skip_env.as_deref())
    }

    /// Makes a best effort to have a daemon running before returning.
    /// Callers proceed regardless of the outcome.
    pub fn ensure_running_if_needed(&self, client: &IndicatorClient, args: &[String]) -> AutoStart {
        if !self.should_auto_start(args) {
            return AutoStart::Skipped;
        }
        if client.is_running() {
            return AutoStart::AlreadyRunning;
        }

        if let Err(e) = self.launcher.launch() {
            debug!("indicator autostart abandoned: {e:#}");
            return AutoStart::Unavailable;
        }

        let deadline = Instant::now() + self.startup_timeout;
        while Instant::now() < deadline {
            if client.is_running() {
                return AutoStart::Started;
            }
            std::thread::sleep(self.poll_interval);
        }

        if client.is_running() {
            AutoStart::Started
        } else {
            debug!("indicator did not come up within {:?}", self.startup_timeout);
            AutoStart::TimedOut
        }
    }
}

/// Autostart policy for an argument list (program name excluded).
///
/// `skip_env` is the value of [`SKIP_AUTOSTART_ENV`], if set.
pub fn should_auto_start(args: &[String], skip_env: Option<&str>) -> bool {
    if skip_env.is_some_and(is_truthy) {
        return false;
    }
    if args.is_empty() {
        return false;
    }
    if args
        .iter()
        .any(|a| matches!(a.as_str(), "--help" | "-h" | "--version" | "-V"))
    {
        return false;
    }
    if args[0].eq_ignore_ascii_case("help") {
        return false;
    }
    match args.iter().find(|a| !a.starts_with('-')) {
        Some(first) => !first.eq_ignore_ascii_case(INDICATOR_SUBCOMMAND),
        None => true,
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Path to the executable of the running process.
pub fn resolve_executable() -> Option<PathBuf> {
    let arg0 = std::env::args().next();
    resolve_from(
        std::env::current_exe().ok(),
        arg0.as_deref(),
        std::env::current_dir().ok(),
    )
}

/// Tries, in order: the running image, argv[0] as an absolute path, argv[0]
/// relative to `cwd`, and finally a `which` lookup of argv[0].
fn resolve_from(current_exe: Option<PathBuf>, arg0: Option<&str>, cwd: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(exe) = current_exe.filter(|p| is_executable_file(p)) {
        return Some(exe);
    }

    let arg0 = arg0.filter(|a| !a.is_empty())?;
    let arg0_path = Path::new(arg0);
    if arg0_path.is_absolute() && is_executable_file(arg0_path) {
        return Some(arg0_path.to_path_buf());
    }

    if arg0.contains('/') {
        if let Some(candidate) = cwd.map(|cwd| cwd.join(arg0_path)) {
            if is_executable_file(&candidate) {
                return Some(candidate);
            }
        }
    }

    which(arg0)
}

fn which(name: &str) -> Option<PathBuf> {
    let output = Command::new("which")
        .arg(name)
        .stderr(Stdio::null())
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let found = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if found.is_empty() {
        return None;
    }
    let found = PathBuf::from(found);
    is_executable_file(&found).then_some(found)
}

fn is_executable_file(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Spawns `<exe> indicator start` in its own session with autostart disabled,
/// stdin/stdout discarded and stderr appended to `log_path`.
fn spawn_detached(exe: &Path, log_path: &Path) -> Result<()> {
    let stderr = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map(Stdio::from)
        .unwrap_or_else(|_| Stdio::null());

    let mut cmd = Command::new(exe);
    cmd.args(START_ARGS)
        .env(SKIP_AUTOSTART_ENV, "1")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(stderr);

    // SAFETY: setsid is async-signal-safe and touches no parent state.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {}", exe.display()))?;
    debug!("launched indicator daemon pid {}", child.id());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::{IndicatorService, ServiceExit};
    use crate::overlay::HeadlessOverlay;
    use crate::process::{Liveness, ProcessProbe};
    use crate::state::StateStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    struct AlwaysAlive;

    impl ProcessProbe for AlwaysAlive {
        fn probe(&self, _pid: u32) -> Liveness {
            Liveness::Alive
        }
    }

    /// Pretends to start a daemon by publishing state files (or not).
    struct FakeLauncher {
        store: Option<StateStore>,
        fail: bool,
        launches: Arc<AtomicUsize>,
    }

    impl Launcher for FakeLauncher {
        fn launch(&self) -> Result<()> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("no executable");
            }
            if let Some(store) = &self.store {
                store.write_state(4242)?;
            }
            Ok(())
        }
    }

    fn quick_config() -> IndicatorConfig {
        IndicatorConfig {
            startup_timeout_ms: 150,
            startup_poll_interval_ms: 10,
            ..IndicatorConfig::default()
        }
    }

    fn setup(
        publishes: bool,
        fail: bool,
    ) -> (tempfile::TempDir, IndicatorClient, AutoStarter, Arc<AtomicUsize>) {
        let dir = tempfile::tempdir().unwrap();
        let paths = IndicatorPaths::in_dir(dir.path());
        let client = IndicatorClient::with_probe(paths.clone(), Box::new(AlwaysAlive), None);
        let launches = Arc::new(AtomicUsize::new(0));
        let launcher = FakeLauncher {
            store: publishes.then(|| StateStore::new(paths)),
            fail,
            launches: Arc::clone(&launches),
        };
        let starter = AutoStarter::with_launcher(&quick_config(), Box::new(launcher));
        (dir, client, starter, launches)
    }

    // ── should_auto_start ─────────────────────────────────────────────────────

    #[test]
    fn help_and_version_never_autostart() {
        assert!(!should_auto_start(&args(&["--help"]), None));
        assert!(!should_auto_start(&args(&["-h"]), None));
        assert!(!should_auto_start(&args(&["--version"]), None));
        assert!(!should_auto_start(&args(&["click", "--help"]), None));
        assert!(!should_auto_start(&args(&["help", "click"]), None));
    }

    #[test]
    fn indicator_subcommand_never_autostarts() {
        assert!(!should_auto_start(&args(&["indicator", "start"]), None));
        assert!(!should_auto_start(&args(&["--json", "Indicator", "status"]), None));
    }

    #[test]
    fn empty_args_never_autostart() {
        assert!(!should_auto_start(&[], None));
    }

    #[test]
    fn ordinary_commands_autostart() {
        assert!(should_auto_start(&args(&["click", "100", "200"]), None));
        assert!(should_auto_start(&args(&["--json", "app", "open", "Safari"]), None));
    }

    #[test]
    fn skip_env_disables_autostart_when_truthy() {
        let cmd = args(&["click", "100", "200"]);
        for value in ["1", "true", "YES", " on "] {
            assert!(!should_auto_start(&cmd, Some(value)), "value {value:?}");
        }
        for value in ["", "0", "false", "no"] {
            assert!(should_auto_start(&cmd, Some(value)), "value {value:?}");
        }
    }

    #[test]
    fn config_can_disable_autostart() {
        let config = IndicatorConfig {
            autostart: false,
            ..IndicatorConfig::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let starter = AutoStarter::new(&config, &IndicatorPaths::in_dir(dir.path()));
        assert!(!starter.should_auto_start(&args(&["click", "1", "2"])));
    }

    // ── ensure_running_if_needed ──────────────────────────────────────────────

    #[test]
    fn ensure_skips_for_excluded_invocations() {
        let (_dir, client, starter, launches) = setup(true, false);
        assert_eq!(
            starter.ensure_running_if_needed(&client, &args(&["indicator", "status"])),
            AutoStart::Skipped
        );
        assert_eq!(launches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn ensure_is_idempotent_when_running() {
        let (_dir, client, starter, launches) = setup(true, false);
        client.store().write_state(1).unwrap();
        assert_eq!(
            starter.ensure_running_if_needed(&client, &args(&["click", "1", "2"])),
            AutoStart::AlreadyRunning
        );
        assert_eq!(launches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn ensure_launches_and_waits_for_state() {
        let (_dir, client, starter, launches) = setup(true, false);
        assert_eq!(
            starter.ensure_running_if_needed(&client, &args(&["click", "1", "2"])),
            AutoStart::Started
        );
        assert_eq!(launches.load(Ordering::SeqCst), 1);
        assert!(client.is_running());

        // A second call finds the daemon and does not launch again.
        assert_eq!(
            starter.ensure_running_if_needed(&client, &args(&["click", "1", "2"])),
            AutoStart::AlreadyRunning
        );
        assert_eq!(launches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn ensure_times_out_when_daemon_never_appears() {
        let (_dir, client, starter, _launches) = setup(false, false);
        let started = Instant::now();
        assert_eq!(
            starter.ensure_running_if_needed(&client, &args(&["click", "1", "2"])),
            AutoStart::TimedOut
        );
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[test]
    fn ensure_reports_unavailable_launcher() {
        let (_dir, client, starter, launches) = setup(false, true);
        assert_eq!(
            starter.ensure_running_if_needed(&client, &args(&["click", "1", "2"])),
            AutoStart::Unavailable
        );
        assert_eq!(launches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn skip_env_on_the_starter_blocks_launch() {
        let (_dir, client, starter, launches) = setup(true, false);
        let starter = starter.skip_env(Some("yes".to_string()));
        assert_eq!(
            starter.ensure_running_if_needed(&client, &args(&["click", "1", "2"])),
            AutoStart::Skipped
        );
        assert_eq!(launches.load(Ordering::SeqCst), 0);
    }

    // ── flash_for_action ──────────────────────────────────────────────────────

    #[test]
    fn flash_for_action_degrades_silently_without_daemon() {
        let (_dir, client, starter, _launches) = setup(false, true);
        assert!(!client.flash_for_action(&starter, &args(&["click", "1", "2"])));
    }

    // ── detached spawn ────────────────────────────────────────────────────────

    /// Reports how it was started on stderr, then prints to stdout.
    const REPORTING_SCRIPT: &str = r#"#!/bin/sh
echo "args=$*" >&2
echo "skip=$DESKPILOT_SKIP_INDICATOR_AUTOSTART" >&2
if read -r _line; then echo "stdin=data" >&2; else echo "stdin=eof" >&2; fi
if [ -r /proc/$$/stat ]; then
  sid=$(cut -d' ' -f6 /proc/$$/stat)
else
  sid=$(ps -o sid= -p $$ | tr -d ' ')
fi
echo "pid=$$ sid=$sid" >&2
echo "stdout-line"
echo "done" >&2
"#;

    /// A freshly written script can briefly be busy for exec (ETXTBSY) while
    /// another test thread forks.
    fn spawn_retrying(exe: &Path, log: &Path) {
        for _ in 0..20 {
            match spawn_detached(exe, log) {
                Ok(()) => return,
                Err(e) => {
                    let busy = e
                        .root_cause()
                        .downcast_ref::<std::io::Error>()
                        .and_then(|io| io.raw_os_error())
                        == Some(libc::ETXTBSY);
                    assert!(busy, "spawn failed: {e:#}");
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
        panic!("{} stayed busy", exe.display());
    }

    #[test]
    fn spawn_detached_starts_a_new_session_with_autostart_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-deskpilot");
        std::fs::write(&script, REPORTING_SCRIPT).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let log = dir.path().join("indicator.log");
        std::fs::write(&log, "previous run\n").unwrap();

        spawn_retrying(&script, &log);

        let deadline = Instant::now() + Duration::from_secs(5);
        let report = loop {
            let contents = std::fs::read_to_string(&log).unwrap();
            if contents.contains("done\n") {
                break contents;
            }
            assert!(Instant::now() < deadline, "script never finished: {contents:?}");
            std::thread::sleep(Duration::from_millis(20));
        };

        assert!(report.starts_with("previous run\n"), "log was truncated: {report:?}");
        assert!(report.contains("args=indicator start\n"), "{report:?}");
        assert!(report.contains("skip=1\n"), "{report:?}");
        assert!(report.contains("stdin=eof\n"), "{report:?}");
        assert!(!report.contains("stdout-line"), "stdout reached the log: {report:?}");

        let ids = report.lines().find(|l| l.starts_with("pid=")).unwrap();
        let (pid, sid) = ids.split_once(' ').unwrap();
        let pid = pid.trim_start_matches("pid=");
        assert!(!pid.is_empty());
        assert_eq!(pid, sid.trim_start_matches("sid="), "child is not a session leader");
    }

    // ── autostart against a real service ──────────────────────────────────────

    /// Runs a real [`IndicatorService`] on its own runtime thread per launch.
    struct ServiceLauncher {
        paths: IndicatorPaths,
        launches: Arc<AtomicUsize>,
        exits: Arc<Mutex<Vec<ServiceExit>>>,
    }

    impl Launcher for ServiceLauncher {
        fn launch(&self) -> Result<()> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            let paths = self.paths.clone();
            let exits = Arc::clone(&self.exits);
            std::thread::spawn(move || {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .enable_all()
                    .build()
                    .unwrap();
                let service = IndicatorService::new(
                    paths,
                    IndicatorConfig::default(),
                    Box::new(HeadlessOverlay::new()),
                );
                let exit = runtime.block_on(service.run()).unwrap();
                exits.lock().unwrap().push(exit);
            });
            Ok(())
        }
    }

    struct LiveSetup {
        _dir: tempfile::TempDir,
        paths: IndicatorPaths,
        launches: Arc<AtomicUsize>,
        exits: Arc<Mutex<Vec<ServiceExit>>>,
    }

    impl LiveSetup {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let paths = IndicatorPaths::in_dir(dir.path());
            Self {
                _dir: dir,
                paths,
                launches: Arc::new(AtomicUsize::new(0)),
                exits: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn client(&self) -> IndicatorClient {
            IndicatorClient::new(self.paths.clone(), &IndicatorConfig::default())
        }

        fn starter(&self) -> AutoStarter {
            let launcher = ServiceLauncher {
                paths: self.paths.clone(),
                launches: Arc::clone(&self.launches),
                exits: Arc::clone(&self.exits),
            };
            AutoStarter::with_launcher(&IndicatorConfig::default(), Box::new(launcher))
        }

        fn wait_for_exits(&self, count: usize) -> Vec<ServiceExit> {
            let deadline = Instant::now() + Duration::from_secs(10);
            loop {
                let exits = self.exits.lock().unwrap().clone();
                if exits.len() >= count {
                    return exits;
                }
                assert!(Instant::now() < deadline, "only saw {exits:?}, wanted {count}");
                std::thread::sleep(Duration::from_millis(20));
            }
        }
    }

    #[test]
    fn autostart_brings_up_a_service_that_takes_a_flash() {
        let live = LiveSetup::new();
        let client = live.client();
        let starter = live.starter();
        let cmd = args(&["click", "100", "200"]);

        let started = Instant::now();
        assert_eq!(starter.ensure_running_if_needed(&client, &cmd), AutoStart::Started);
        assert!(started.elapsed() < Duration::from_millis(1_500));
        assert!(client.is_running());
        assert!(client.send(&crate::protocol::Command::Flash));
        assert!(client.flash_for_action(&starter, &cmd));
        assert_eq!(live.launches.load(Ordering::SeqCst), 1);

        assert!(client.send(&crate::protocol::Command::Stop));
        assert_eq!(live.wait_for_exits(1), vec![ServiceExit::Stopped]);
    }

    #[test]
    fn concurrent_autostarts_leave_exactly_one_daemon() {
        let live = Arc::new(LiveSetup::new());
        let barrier = Arc::new(std::sync::Barrier::new(2));
        let racers: Vec<_> = (0..2)
            .map(|_| {
                let live = Arc::clone(&live);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let client = live.client();
                    let starter = live.starter();
                    barrier.wait();
                    starter.ensure_running_if_needed(&client, &args(&["type", "hello"]))
                })
            })
            .collect();
        for racer in racers {
            let outcome = racer.join().unwrap();
            assert!(
                matches!(outcome, AutoStart::Started | AutoStart::AlreadyRunning),
                "{outcome:?}"
            );
        }

        let client = live.client();
        assert!(client.send(&crate::protocol::Command::Ping));

        // Every extra daemon must give up before the winner is stopped, or it
        // would take over the released lock.
        let launches = live.launches.load(Ordering::SeqCst);
        assert!((1..=2).contains(&launches));
        let losers = live.wait_for_exits(launches - 1);
        assert!(losers.iter().all(|e| *e == ServiceExit::AlreadyRunning), "{losers:?}");

        assert!(client.send(&crate::protocol::Command::Stop));
        let exits = live.wait_for_exits(launches);
        assert_eq!(exits.len(), launches);
        assert_eq!(exits.iter().filter(|e| **e == ServiceExit::Stopped).count(), 1);
    }

    // ── executable resolution ─────────────────────────────────────────────────

    #[test]
    fn resolve_prefers_running_image() {
        let exe = std::env::current_exe().unwrap();
        assert_eq!(resolve_from(Some(exe.clone()), Some("ignored"), None), Some(exe));
    }

    #[test]
    fn resolve_falls_back_to_absolute_arg0() {
        let exe = std::env::current_exe().unwrap();
        let resolved = resolve_from(
            Some(PathBuf::from("/nonexistent/deskpilot")),
            Some(exe.to_str().unwrap()),
            None,
        );
        assert_eq!(resolved, Some(exe));
    }

    #[test]
    fn resolve_joins_relative_arg0_with_cwd() {
        let exe = std::env::current_exe().unwrap();
        let dir = exe.parent().unwrap().to_path_buf();
        let name = exe.file_name().unwrap().to_str().unwrap();
        let relative = format!("./{name}");
        let resolved = resolve_from(None, Some(&relative), Some(dir.clone()));
        assert_eq!(resolved, Some(dir.join(&relative)));
    }

    #[test]
    fn resolve_gives_up_on_unknown_names() {
        assert_eq!(resolve_from(None, Some("deskpilot-no-such-binary-xyz"), None), None);
        assert_eq!(resolve_from(None, None, None), None);
        assert_eq!(resolve_from(None, Some(""), None), None);
    }

    #[test]
    fn non_executable_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.txt");
        std::fs::write(&path, "not a program").unwrap();
        assert!(!is_executable_file(&path));
        assert!(!is_executable_file(dir.path()));
    }
}
