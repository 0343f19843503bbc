//! Process supervision for the application under test.
//!
//! Launches the AUT with inherited standard streams so its output stays
//! visible, watches for it to exit on a background thread, and tears it down
//! (plus any lingering build-tool daemon) once the run is over.
//!
//! ## State machine
//!
//! ```text
//! NOT_STARTED → RUNNING → EXITED_CLEAN              (exit after shutdown request, code 0)
//!                       → TERMINATED_BY_SUPERVISOR  (terminate(), or non-zero exit after shutdown request)
//!                       → EXITED_CRASHED            (any exit before shutdown request)
//! ```

use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Interval between liveness checks while waiting on a child to exit.
const EXIT_POLL: Duration = Duration::from_millis(50);

/// Lifecycle of the supervised AUT process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    Running,
    ExitedClean,
    ExitedCrashed,
    TerminatedBySupervisor,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunState::NotStarted | RunState::Running)
    }
}

/// How to start the AUT.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub work_dir: PathBuf,
    /// Applied only when the variable is not already set in our environment.
    pub env: Vec<(String, String)>,
    /// Pause after spawning before handing the process back.
    pub startup_grace: Duration,
}

/// Handle to the spawned AUT.
///
/// Cheap to clone; clones share the child, its state and the shutdown flag.
#[derive(Debug, Clone)]
pub struct SupervisedProcess {
    pid: u32,
    child: Arc<Mutex<Child>>,
    state: Arc<Mutex<RunState>>,
    shutdown_requested: Arc<AtomicBool>,
}

/// Start the AUT. Returns once the process has been spawned; readiness is the
/// caller's concern.
pub fn launch(spec: &LaunchSpec) -> Result<SupervisedProcess> {
    if spec.program.trim().is_empty() {
        bail!("no launch program configured");
    }

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&spec.work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    for (key, value) in &spec.env {
        if std::env::var_os(key).is_none() {
            debug!(key = %key, "applying launch environment override");
            cmd.env(key, value);
        }
    }

    // Own process group, so terminate() reaches the whole launcher tree.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let child = cmd.spawn().with_context(|| {
        format!(
            "failed to launch '{}' in {}",
            spec.program,
            spec.work_dir.display()
        )
    })?;
    let pid = child.id();
    info!(pid, program = %spec.program, args = ?spec.args, "AUT launched");

    if !spec.startup_grace.is_zero() {
        thread::sleep(spec.startup_grace);
    }

    Ok(SupervisedProcess {
        pid,
        child: Arc::new(Mutex::new(child)),
        state: Arc::new(Mutex::new(RunState::Running)),
        shutdown_requested: Arc::new(AtomicBool::new(false)),
    })
}

impl SupervisedProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap()
    }

    /// Mark every later exit as expected.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    fn try_wait(&self) -> std::io::Result<Option<ExitStatus>> {
        self.child.lock().unwrap().try_wait()
    }

    /// Record an observed exit and return the resulting state. The first
    /// terminal state recorded wins.
    fn record_exit(&self, status: ExitStatus) -> RunState {
        let mut state = self.state.lock().unwrap();
        if state.is_terminal() {
            return *state;
        }
        *state = if !self.shutdown_requested() {
            RunState::ExitedCrashed
        } else if status.success() {
            RunState::ExitedClean
        } else {
            RunState::TerminatedBySupervisor
        };
        *state
    }

    /// Wait up to `timeout` for the process to exit.
    fn wait_timeout(&self, timeout: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.try_wait() {
                Ok(Some(status)) => return Some(status),
                Ok(None) => {}
                Err(e) => {
                    warn!(pid = self.pid, error = %e, "failed to poll AUT process");
                    return None;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            thread::sleep(EXIT_POLL.min(deadline - now));
        }
    }

    /// Best-effort graceful stop, escalating to a forced kill after `grace`.
    ///
    /// Idempotent: an already-exited process is left alone.
    pub fn terminate(&self, grace: Duration) {
        self.request_shutdown();

        match self.try_wait() {
            Ok(Some(status)) => {
                let state = self.record_exit(status);
                debug!(pid = self.pid, state = ?state, "AUT already exited");
                return;
            }
            Ok(None) => {}
            Err(e) => warn!(pid = self.pid, error = %e, "failed to poll AUT before terminate"),
        }

        info!(pid = self.pid, "closing AUT process");
        signal_group(self.pid, Signal::Terminate);

        if self.wait_timeout(grace).is_none() {
            warn!(
                pid = self.pid,
                grace_ms = grace.as_millis() as u64,
                "AUT did not exit in time; killing"
            );
            signal_group(self.pid, Signal::Kill);
            let mut child = self.child.lock().unwrap();
            if let Err(e) = child.kill() {
                debug!(pid = self.pid, error = %e, "kill after group signal");
            }
            if let Err(e) = child.wait() {
                warn!(pid = self.pid, error = %e, "failed to reap AUT process");
            }
        }

        let mut state = self.state.lock().unwrap();
        if !state.is_terminal() {
            *state = RunState::TerminatedBySupervisor;
        }
    }
}

/// Background observer of the AUT's exit.
///
/// Stopped and joined by its owner; dropping it does the same.
pub struct ExitWatcher {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

/// Watch `process` on a background thread. If it exits before a shutdown was
/// requested, whatever the exit code, `on_unexpected_exit` runs once with the
/// exit code (`None` when killed by a signal).
pub fn watch_exit<F>(
    process: &SupervisedProcess,
    poll_interval: Duration,
    on_unexpected_exit: F,
) -> Result<ExitWatcher>
where
    F: FnOnce(Option<i32>) + Send + 'static,
{
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();
    let process = process.clone();

    let handle = thread::Builder::new()
        .name("autorun-exit".to_string())
        .spawn(move || {
            while !stop_flag.load(Ordering::Relaxed) {
                match process.try_wait() {
                    Ok(Some(status)) => {
                        let state = process.record_exit(status);
                        if state == RunState::ExitedCrashed {
                            warn!(
                                pid = process.pid,
                                code = ?status.code(),
                                "AUT exited unexpectedly; assuming crash"
                            );
                            on_unexpected_exit(status.code());
                        } else {
                            info!(pid = process.pid, code = ?status.code(), state = ?state, "AUT exited");
                        }
                        return;
                    }
                    Ok(None) => thread::sleep(poll_interval),
                    Err(e) => {
                        warn!(pid = process.pid, error = %e, "exit watcher failed to poll AUT");
                        return;
                    }
                }
            }
        })
        .context("failed to spawn exit watcher thread")?;

    Ok(ExitWatcher {
        stop,
        handle: Some(handle),
    })
}

impl ExitWatcher {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("exit watcher thread panicked");
            }
        }
    }
}

impl Drop for ExitWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One row of the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub command: String,
}

/// Parse `ps -A -o pid=,command=` output.
pub fn parse_process_table(text: &str) -> Vec<ProcessEntry> {
    text.lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            let (pid, command) = trimmed.split_once(char::is_whitespace)?;
            Some(ProcessEntry {
                pid: pid.parse().ok()?,
                command: command.trim().to_string(),
            })
        })
        .collect()
}

/// Pids whose command line contains any fragment, minus `exclude`.
pub fn matching_pids(entries: &[ProcessEntry], fragments: &[String], exclude: &[u32]) -> Vec<u32> {
    entries
        .iter()
        .filter(|e| !exclude.contains(&e.pid))
        .filter(|e| {
            fragments
                .iter()
                .any(|f| !f.is_empty() && e.command.contains(f.as_str()))
        })
        .map(|e| e.pid)
        .collect()
}

fn list_processes() -> Result<Vec<ProcessEntry>> {
    let output = Command::new("ps")
        .args(["-A", "-o", "pid=,command="])
        .stdin(Stdio::null())
        .output()
        .context("failed to run ps")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("ps failed: {stderr}");
    }

    Ok(parse_process_table(&String::from_utf8_lossy(&output.stdout)))
}

/// Forcefully kill every process whose command line matches one of
/// `fragments`, sparing ourselves and our parent. Best-effort: failures are
/// logged and the number of processes signalled is returned.
pub fn kill_sibling_daemons(fragments: &[String]) -> usize {
    if fragments.iter().all(|f| f.is_empty()) {
        return 0;
    }

    let entries = match list_processes() {
        Ok(entries) => entries,
        Err(e) => {
            warn!(error = %e, "could not enumerate processes for daemon sweep");
            return 0;
        }
    };

    let mut exclude = vec![std::process::id()];
    if let Some(parent) = parent_pid() {
        exclude.push(parent);
    }

    let mut killed = 0;
    for pid in matching_pids(&entries, fragments, &exclude) {
        if kill_pid(pid) {
            info!(pid, "killed lingering daemon process");
            killed += 1;
        } else {
            debug!(pid, "daemon process already gone or not killable");
        }
    }
    killed
}

/// Run the build tool's own daemon-stop command, discarding its output and
/// waiting at most `timeout` for it. Best-effort.
pub fn stop_daemon(command: &[String], work_dir: &std::path::Path, timeout: Duration) {
    let Some((program, args)) = command.split_first() else {
        return;
    };

    let spawned = Command::new(program)
        .args(args)
        .current_dir(work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            warn!(program = %program, error = %e, "failed to run daemon stop command");
            return;
        }
    };

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(program = %program, code = ?status.code(), "daemon stop command finished");
                return;
            }
            Ok(None) if Instant::now() < deadline => thread::sleep(EXIT_POLL),
            Ok(None) => {
                warn!(program = %program, "daemon stop command still running; abandoning it");
                let _ = child.kill();
                let _ = child.wait();
                return;
            }
            Err(e) => {
                warn!(program = %program, error = %e, "failed to poll daemon stop command");
                return;
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: Signal) {
    let sig = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // Negative pid addresses the process group created at launch.
    let rc = unsafe { libc::kill(-(pgid as libc::pid_t), sig) };
    if rc != 0 {
        debug!(
            pgid,
            error = %std::io::Error::last_os_error(),
            "process group signal failed"
        );
    }
}

#[cfg(not(unix))]
fn signal_group(pid: u32, signal: Signal) {
    let mut cmd = Command::new("taskkill");
    cmd.args(["/T", "/PID", &pid.to_string()]);
    if matches!(signal, Signal::Kill) {
        cmd.arg("/F");
    }
    if let Err(e) = cmd.stdout(Stdio::null()).stderr(Stdio::null()).status() {
        debug!(pid, error = %e, "taskkill failed");
    }
}

#[cfg(unix)]
fn kill_pid(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) == 0 }
}

#[cfg(not(unix))]
fn kill_pid(pid: u32) -> bool {
    Command::new("taskkill")
        .args(["/F", "/PID", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(unix)]
fn parent_pid() -> Option<u32> {
    u32::try_from(unsafe { libc::getppid() }).ok()
}

#[cfg(not(unix))]
fn parent_pid() -> Option<u32> {
    None
}
